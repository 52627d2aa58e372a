use hackdesk::{app, config::Config};
use tracing_subscriber::EnvFilter;

/// Main entry point for the admin dashboard server
///
/// Reads the configuration from the environment (and `.env`), then serves the
/// dashboard and API until Ctrl+C or SIGTERM.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("hackdesk=info,tower_http=info")),
        )
        .init();

    let config = Config::load()?;
    app::run(config).await
}
