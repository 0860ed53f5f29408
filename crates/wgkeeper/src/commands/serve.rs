//! Long-running mode.

use tracing::info;
use wgkeeper_core::{Service, ServiceConfig};

use crate::error::CliError;

pub async fn handle(config: &ServiceConfig) -> Result<(), CliError> {
    let service = Service::build(config).await?;
    if let Err(e) = service.start().await {
        service.shutdown().await;
        return Err(e.into());
    }
    info!(
        interval_secs = config.reconcile_interval.as_secs(),
        "serving; press Ctrl-C to stop"
    );

    let signal = tokio::signal::ctrl_c().await;
    info!("shutting down");
    service.shutdown().await;
    signal.map_err(CliError::from)
}
