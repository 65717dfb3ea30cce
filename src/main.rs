// src/main.rs

//! The main entry point for the Citrine proxy.

use anyhow::Result;
use citrine::config::Config;
use citrine::server;
use std::env;
use tracing::error;
use tracing_subscriber::filter::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    const VERSION: &str = env!("CARGO_PKG_VERSION");

    // Collect command-line arguments to decide the execution mode.
    let args: Vec<String> = env::args().collect();

    // Handle the --version flag.
    if args.contains(&"--version".to_string()) {
        println!("Citrine version {VERSION}");
        return Ok(());
    }

    // Determine the configuration path. It can be provided via a --config
    // flag; otherwise, it defaults to "citrine.toml".
    let config_path = args
        .iter()
        .position(|arg| arg == "--config")
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str())
        .unwrap_or("citrine.toml");

    // Load the proxy configuration. The proxy cannot run without a valid
    // config, so a failure here exits immediately.
    let config = match Config::from_file(config_path) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Failed to load configuration from \"{config_path}\": {e:#}");
            std::process::exit(1);
        }
    };

    // Setup logging with compact format and ANSI colors. RUST_LOG overrides
    // the configured level.
    let log_level = std::env::var("RUST_LOG").unwrap_or_else(|_| config.proxy.log_level.clone());
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(log_level))
        .compact()
        .with_ansi(true)
        .init();

    if let Err(e) = server::run(config, config_path).await {
        error!("Proxy runtime error: {}", e);
        return Err(e);
    }

    Ok(())
}
