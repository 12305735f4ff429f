//! itod: ito exposure-notification daemon
//!
//! Usage:
//!   itod [--config /etc/ito/itod.toml] [--log info] [--log-format text|json]

mod beacon;
mod daemon;
mod grpc;
mod metrics;
mod service;

use anyhow::Result;
use clap::{Parser, ValueEnum};
use ito_core::config::ItoConfig;
use std::path::Path;
use std::path::PathBuf;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "itod", version, about = "ito exposure-notification daemon")]
struct Cli {
    /// Path to itod.toml configuration file
    #[arg(
        long,
        short = 'c',
        env = "ITO_CONFIG",
        default_value = "/etc/ito/itod.toml"
    )]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "ITO_LOG", default_value = "info")]
    log: String,

    /// Log format (json, text)
    #[arg(long, env = "ITO_LOG_FORMAT", default_value = "text")]
    log_format: LogFormat,
}

#[derive(Clone, Debug, ValueEnum)]
enum LogFormat {
    Json,
    Text,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging(&cli.log, &cli.log_format);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %cli.config.display(),
        "itod starting"
    );

    let config = load_config(&cli.config).await?;
    daemon::run(config).await
}

async fn load_config(path: &Path) -> Result<ItoConfig> {
    if path.exists() {
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| anyhow::anyhow!("reading config {}: {e}", path.display()))?;
        toml::from_str(&content)
            .map_err(|e| anyhow::anyhow!("parsing config {}: {e}", path.display()))
    } else {
        tracing::warn!(
            "config file not found: {}  (using defaults)",
            path.display()
        );
        Ok(ItoConfig::default())
    }
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

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_config_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config(&dir.path().join("absent.toml")).await.unwrap();
        assert_eq!(config.ratchet.exchange_interval, 96);
    }

    #[tokio::test]
    async fn partial_config_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("itod.toml");
        std::fs::write(
            &path,
            "[exposure]\nmin_exposure_duration_secs = 300\n\n[store]\npath = \":memory:\"\n",
        )
        .unwrap();

        let config = load_config(&path).await.unwrap();
        assert_eq!(config.exposure.min_exposure_duration_secs, 300);
        assert_eq!(config.store.path, PathBuf::from(":memory:"));
        assert_eq!(config.ratchet.tcn_valid_interval_secs, 15 * 60);
    }

    #[tokio::test]
    async fn malformed_config_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("itod.toml");
        std::fs::write(&path, "[ratchet\n").unwrap();
        assert!(load_config(&path).await.is_err());
    }

    #[test]
    fn cli_parses_flags() {
        let cli = Cli::parse_from(["itod", "-c", "/tmp/x.toml", "--log-format", "json"]);
        assert_eq!(cli.config, PathBuf::from("/tmp/x.toml"));
        assert!(matches!(cli.log_format, LogFormat::Json));
    }
}
