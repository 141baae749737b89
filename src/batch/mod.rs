pub mod accumulator;
pub mod row;

pub use accumulator::{Batch, BatchAccumulator};
pub use row::{project, Row};
