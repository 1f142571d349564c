use std::process::ExitCode;

use api_buddy::config::ApiBuddyConfig;
use api_buddy::ApiBuddy;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> ExitCode {
    let config_path = std::env::args().nth(1).unwrap_or_else(|| "config.toml".to_string());

    let config = match ApiBuddyConfig::load(&config_path) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("failed to load config from {config_path}: {err}");
            return ExitCode::FAILURE;
        }
    };

    init_tracing(&config.logging.level, &config.logging.format);

    let proxy = match ApiBuddy::new(config) {
        Ok(proxy) => proxy,
        Err(err) => {
            tracing::error!(error = %err, "failed to initialize api-buddy");
            return ExitCode::FAILURE;
        }
    };

    if let Some(key) = proxy.get_secure_key() {
        tracing::info!("generated secure key (shown once): {key}");
    }

    if let Err(err) = proxy.start(true).await {
        tracing::error!(error = %err, "server exited with error");
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}

fn init_tracing(level: &str, format: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let registry = tracing_subscriber::registry().with(filter);
    if format == "json" {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}
