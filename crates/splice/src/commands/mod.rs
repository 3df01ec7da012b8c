pub mod check;
pub mod config;
pub mod run;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use splice_relay::{
    default_registry, DnsResolver, FilterFactory, RelayServerConfig, TcpConnector,
    DEFAULT_CONNECT_TIMEOUT,
};
use splice_settings::SpliceConfig;

use crate::error::CliError;

/// Listener settings from `[listener]`, falling back to relay defaults.
pub(crate) fn listener_config(config: &SpliceConfig) -> Result<RelayServerConfig, CliError> {
    let mut server = RelayServerConfig::default();
    if let Some(ref addr) = config.listener.bind_addr {
        server.bind_addr = addr.parse::<SocketAddr>().map_err(|e| {
            CliError::Other(format!("Invalid listener.bind_addr '{addr}': {e}"))
        })?;
    }
    if let Some(max) = config.listener.max_connections {
        server.max_connections = max;
    }
    Ok(server)
}

/// Build the configured filter factory.
///
/// Resolves the upstream once; failures here are fatal for the caller.
pub(crate) async fn build_factory(config: &SpliceConfig) -> Result<Arc<dyn FilterFactory>, CliError> {
    let timeout = config
        .upstream
        .connect_timeout_secs
        .map(Duration::from_secs)
        .unwrap_or(DEFAULT_CONNECT_TIMEOUT);
    let registry = default_registry(
        Arc::new(DnsResolver::new()),
        Arc::new(TcpConnector::new(timeout)),
    );
    let name = config.filter_name()?;
    Ok(registry.create(name, &config.filter.config).await?)
}
