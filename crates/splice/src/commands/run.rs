use std::path::PathBuf;

use splice_relay::{RelayServer, RELAY_FILTER_NAME};
use splice_settings::{ConfigLoader, SpliceConfig};
use tracing::info;

use crate::cli::RunArgs;
use crate::commands::{build_factory, listener_config};
use crate::error::CliError;

pub async fn run(args: RunArgs, cwd: PathBuf) -> Result<(), CliError> {
    // --no-config skips global/project config files but --config <extra> still applies.
    let mut config = if args.no_config {
        SpliceConfig::default()
    } else {
        ConfigLoader::load(&cwd)?
    };
    if let Some(ref extra) = args.extra_config {
        let extra_cfg = SpliceConfig::load(extra)?;
        config = config.merge(extra_cfg);
    }
    apply_overrides(&mut config, &args);

    let server_config = listener_config(&config)?;
    let factory = build_factory(&config).await?;

    let handle = RelayServer::new(server_config, factory).start().await?;
    println!("Listening on {}", handle.local_addr());

    tokio::signal::ctrl_c().await?;
    info!(connections = handle.connection_count(), "shutting down");
    handle.shutdown().await?;
    Ok(())
}

/// Layer command-line flags over the file config.
///
/// Naming an upstream on the command line selects the relay filter when no
/// filter was configured.
fn apply_overrides(config: &mut SpliceConfig, args: &RunArgs) {
    if let Some(listen) = args.listen {
        config.listener.bind_addr = Some(listen.to_string());
    }
    if args.server_addr.is_none() && args.server_port.is_none() {
        return;
    }
    if config.filter.name.is_none() {
        config.filter.name = Some(RELAY_FILTER_NAME.to_string());
    }
    if let Some(ref addr) = args.server_addr {
        config
            .filter
            .config
            .insert("server_addr".to_string(), addr.as_str().into());
    }
    if let Some(port) = args.server_port {
        config
            .filter
            .config
            .insert("server_port".to_string(), port.to_string().into());
    }
}
