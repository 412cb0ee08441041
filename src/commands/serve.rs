use std::net::SocketAddr;

use crate::config::Config;
use crate::error::{RelayError, Result};
use crate::relay::Relay;

/// Run the API server until Ctrl-C
///
/// # Arguments
///
/// * `config` - Loaded configuration
/// * `bind` - Listen address overriding `server.bind`
pub async fn run_serve(config: Config, bind: Option<String>) -> Result<()> {
    let bind = bind.unwrap_or_else(|| config.server.bind.clone());
    let addr: SocketAddr = bind
        .parse()
        .map_err(|e| RelayError::Config(format!("invalid bind address {}: {}", bind, e)))?;

    crate::metrics::init_metrics_exporter();

    let relay = Relay::open(&config)?;
    tracing::info!(
        provider = %config.provider.endpoint,
        content_db = %config.storage.content_path.display(),
        "Starting relay"
    );

    crate::server::serve(relay, addr).await
}
