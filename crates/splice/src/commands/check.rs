use std::path::PathBuf;

use splice_settings::ConfigLoader;

use crate::commands::{build_factory, listener_config};
use crate::error::CliError;

pub async fn check(cwd: PathBuf) -> Result<(), CliError> {
    let global_path = ConfigLoader::global_config_path();
    let project_path = ConfigLoader::project_config_path(&cwd);

    println!("Config files:");
    if let Some(ref path) = global_path {
        let status = if path.exists() { "found" } else { "not found" };
        println!("  {} ({})", path.display(), status);
    } else {
        println!("  global: n/a (config directory not available)");
    }
    let status = if project_path.exists() { "found" } else { "not found" };
    println!("  {} ({})", project_path.display(), status);

    let config = match ConfigLoader::load(&cwd) {
        Ok(config) => {
            println!("Config loaded: OK");
            config
        }
        Err(e) => {
            println!("Config loaded: FAIL ({e})");
            return Err(CliError::Other("One or more checks failed".to_string()));
        }
    };

    let mut all_ok = true;

    print!("Listener: ");
    match listener_config(&config) {
        Ok(server) => println!(
            "OK ({}, max {} connections)",
            server.bind_addr, server.max_connections
        ),
        Err(e) => {
            println!("FAIL ({e})");
            all_ok = false;
        }
    }

    print!("Filter: ");
    match build_factory(&config).await {
        Ok(_) => println!("OK ({})", config.filter_name().unwrap_or("?")),
        Err(e) => {
            println!("FAIL ({e})");
            all_ok = false;
        }
    }

    if !all_ok {
        return Err(CliError::Other("One or more checks failed".to_string()));
    }

    Ok(())
}
