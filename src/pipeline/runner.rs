use super::claim_loop::{run_claim, ClaimStats, PipelineContext};
use crate::broker::{BrokerError, ClaimStream};
use crate::extract::ExtractError;
use std::sync::Arc;
use thiserror::Error;
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Errors that can occur during pipeline operation
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("extraction failed at {topic}/{partition} offset {offset}: {source}")]
    Extract {
        topic: String,
        partition: i32,
        offset: i64,
        #[source]
        source: ExtractError,
    },

    #[error("acknowledging {topic}/{partition} offset {offset} failed: {source}")]
    Acknowledge {
        topic: String,
        partition: i32,
        offset: i64,
        #[source]
        source: BrokerError,
    },

    #[error("broker error: {0}")]
    Broker(#[from] BrokerError),

    #[error("claim task panicked: {0}")]
    Join(#[from] JoinError),
}

impl PipelineError {
    /// Whether the error must stop every claim, not just the one it came from.
    ///
    /// A failed acknowledgment usually means the partition was revoked; its
    /// records are redelivered to the new owner.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, PipelineError::Acknowledge { .. })
    }
}

/// Totals over every claim the pipeline ran.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PipelineStats {
    pub claims: usize,
    pub records: ClaimStats,
}

/// Run one claim loop per claim handed out by `claims`.
///
/// Returns once the claim stream ends and every loop has finished, or once
/// `shutdown` fires and the loops have stopped. The first fatal error
/// cancels every other loop and is returned after they drain.
pub async fn run_pipeline<S: ClaimStream>(
    claims: &mut S,
    ctx: Arc<PipelineContext>,
    shutdown: CancellationToken,
) -> Result<PipelineStats, PipelineError> {
    let mut tasks = JoinSet::new();
    let mut stats = PipelineStats::default();
    let mut fatal: Option<PipelineError> = None;

    info!(
        statement = %ctx.writer().statement(),
        sink = %ctx.writer().target(),
        "Pipeline started"
    );

    loop {
        tokio::select! {
            biased;

            _ = shutdown.cancelled() => break,

            Some(joined) = tasks.join_next() => {
                if let Err(e) = absorb(joined, &mut stats) {
                    fatal = Some(e);
                    shutdown.cancel();
                    break;
                }
            }

            claim = claims.next_claim() => match claim {
                Ok(Some(claim)) => {
                    stats.claims += 1;
                    tasks.spawn(run_claim(claim, ctx.clone(), shutdown.child_token()));
                }
                Ok(None) => {
                    info!("Claim stream ended, waiting for running claims");
                    break;
                }
                Err(e) => {
                    fatal = Some(e.into());
                    shutdown.cancel();
                    break;
                }
            },
        }
    }

    while let Some(joined) = tasks.join_next().await {
        if let Err(e) = absorb(joined, &mut stats) {
            if fatal.is_none() {
                shutdown.cancel();
                fatal = Some(e);
            }
        }
    }

    if let Some(e) = fatal {
        error!(error = %e, "Pipeline stopped on fatal error");
        return Err(e);
    }

    info!(
        claims = stats.claims,
        received = stats.records.received,
        written = stats.records.written,
        dropped = stats.records.dropped,
        failed_flushes = stats.records.failed_flushes,
        "Pipeline stopped"
    );
    Ok(stats)
}

/// Fold a finished claim into the totals; hand back errors that are fatal.
fn absorb(
    joined: Result<Result<ClaimStats, PipelineError>, JoinError>,
    stats: &mut PipelineStats,
) -> Result<(), PipelineError> {
    match joined? {
        Ok(claim_stats) => {
            stats.records += claim_stats;
            Ok(())
        }
        Err(e) if e.is_fatal() => Err(e),
        Err(e) => {
            warn!(error = %e, "Claim loop ended early");
            Ok(())
        }
    }
}
