use crate::broker::{BrokerError, ClaimStream, KafkaClaimStream};
use crate::config::{load_config, ConfigError, Settings};
use crate::pipeline::{run_pipeline, PipelineContext, PipelineError};
use crate::sink::{open_sink, SinkError};
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[derive(Debug, Error)]
pub enum RunError {
    #[error("config not found; use --config <path> or run 'clicksink config init'")]
    ConfigNotFound,

    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    #[error("sink error: {0}")]
    Sink(#[from] SinkError),

    #[error("broker error: {0}")]
    Broker(#[from] BrokerError),

    #[error("pipeline error: {0}")]
    Pipeline(#[from] PipelineError),
}

pub async fn run(config_path: Option<PathBuf>) -> Result<(), RunError> {
    let config_path = config_path.ok_or(RunError::ConfigNotFound)?;
    info!(config_path = %config_path.display(), "Loading configuration");

    let settings = Settings::from_config(load_config(&config_path)?)?;

    let sink = open_sink(&settings.sink)?;
    sink.ping().await?;
    info!(sink = %sink.target(), table = %settings.table, "Sink reachable");

    let shutdown = CancellationToken::new();
    tokio::spawn(cancel_on_signal(shutdown.clone()));

    let mut claims = KafkaClaimStream::connect(&settings, &shutdown).await?;
    let ctx = Arc::new(PipelineContext::from_settings(&settings, sink));

    info!("Pipeline started, press Ctrl+C to shutdown");
    let result = run_pipeline(&mut claims, ctx, shutdown.clone()).await;

    // Stop the consumer and publish acknowledged offsets even after a failure
    shutdown.cancel();
    let closed = claims.shutdown().await;

    if let Err(e) = result {
        if let Err(close_err) = closed {
            error!(error = %close_err, "Broker shutdown failed");
        }
        return Err(e.into());
    }
    closed?;

    info!("Shutdown complete");
    Ok(())
}

async fn cancel_on_signal(shutdown: CancellationToken) {
    tokio::select! {
        _ = wait_for_signal() => {
            info!("Shutdown signal received");
            shutdown.cancel();
        }
        _ = shutdown.cancelled() => {}
    }
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(terminate) => terminate,
        Err(e) => {
            error!(error = %e, "Cannot listen for SIGTERM");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = terminate.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
