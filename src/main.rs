// src/main.rs

//! The main entry point for the frankenrouter binary.

use anyhow::Result;
use frankenrouter::config::Config;
use frankenrouter::server;
use std::env;
use tracing::error;
use tracing_subscriber::filter::EnvFilter;

const USAGE: &str = "\
Usage: frankenrouter [OPTIONS]

Options:
  --config-file PATH     Path to the TOML configuration file (default: frankenrouter.toml)
  --variables-file PATH  Path to the PSX Variables.txt catalogue (overrides config)
  --listen-port N        Port to listen on for downstream clients (overrides config)
  --log-traffic          Log all traffic to a timestamped file (overrides config)
  --version              Print version and exit
  --help                 Print this help and exit";

#[tokio::main]
async fn main() -> Result<()> {
    const VERSION: &str = env!("CARGO_PKG_VERSION");

    let args: Vec<String> = env::args().collect();

    if args.contains(&"--help".to_string()) {
        println!("{USAGE}");
        return Ok(());
    }
    if args.contains(&"--version".to_string()) {
        println!("frankenrouter version {VERSION}");
        return Ok(());
    }

    // Locate a flag's value in the argument list.
    let flag_value = |flag: &str| -> Option<&String> {
        args.iter()
            .position(|arg| arg == flag)
            .and_then(|i| args.get(i + 1))
    };

    let config_path = flag_value("--config-file")
        .map(|s| s.as_str())
        .unwrap_or("frankenrouter.toml");

    // Load the configuration. The router cannot run without a valid one.
    let mut config = match Config::from_file(config_path) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Failed to load configuration from \"{config_path}\": {e:#}");
            std::process::exit(1);
        }
    };

    // Command-line options override config-file values.
    if let Some(path) = flag_value("--variables-file") {
        config.psx.variables = path.clone().into();
    }
    if let Some(port_str) = flag_value("--listen-port") {
        match port_str.parse::<u16>() {
            Ok(port) => config.listen.port = port,
            Err(_) => {
                eprintln!("Invalid port number: {port_str}");
                std::process::exit(1);
            }
        }
    }
    if args.contains(&"--log-traffic".to_string()) {
        config.log.traffic = true;
    }

    let log_level = std::env::var("RUST_LOG").unwrap_or_else(|_| config.log.level.clone());
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(log_level))
        .compact()
        .with_ansi(true)
        .init();

    if let Err(e) = server::run(config).await {
        error!("Router runtime error: {e:#}");
        return Err(e);
    }

    Ok(())
}
