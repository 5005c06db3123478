//! sbxd: strongbox sync server
//!
//! Usage:
//!   sbxd [--config strongbox.toml] [--listen 0.0.0.0:8443]
//!
//! Stores one archive per account and merges uploads into it. TLS is
//! expected to be terminated in front of this process.

mod accounts;
mod router;
mod server;

use anyhow::Result;
use clap::{Parser, ValueEnum};
use sbx_core::config::SbxConfig;
use std::path::PathBuf;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "sbxd", version, about = "strongbox sync server")]
struct Cli {
    /// Path to strongbox.toml configuration file
    #[arg(long, short = 'c', env = "SBX_CONFIG", default_value = "strongbox.toml")]
    config: PathBuf,

    /// Listen address, overrides [server].listen
    #[arg(long)]
    listen: Option<String>,

    /// Log level (trace, debug, info, warn, error); defaults to [server].log_level
    #[arg(long, env = "SBX_LOG")]
    log: Option<String>,

    /// Log format (json, text); defaults to [server].log_format
    #[arg(long, env = "SBX_LOG_FORMAT")]
    log_format: Option<LogFormat>,
}

#[derive(Clone, Debug, ValueEnum)]
enum LogFormat {
    Json,
    Text,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config_found = cli.config.exists();
    let mut config = SbxConfig::load(&cli.config)?.server;
    if let Some(listen) = cli.listen {
        config.listen = listen;
    }

    let level = cli.log.unwrap_or_else(|| config.log_level.clone());
    let format = cli.log_format.unwrap_or(match config.log_format.as_str() {
        "json" => LogFormat::Json,
        _ => LogFormat::Text,
    });
    init_logging(&level, &format);

    if !config_found {
        tracing::warn!(
            "config file not found: {}  (using defaults)",
            cli.config.display()
        );
    }
    info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %cli.config.display(),
        listen = %config.listen,
        "sbxd starting"
    );

    server::run(&config).await
}

fn init_logging(level: &str, format: &LogFormat) {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    match format {
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().json())
                .init();
        }
        LogFormat::Text => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer())
                .init();
        }
    }
}
