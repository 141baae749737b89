pub mod claim_loop;
pub mod runner;

pub use claim_loop::{run_claim, ClaimStats, PipelineContext};
pub use runner::{run_pipeline, PipelineError, PipelineStats};
