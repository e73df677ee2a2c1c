use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // JSON logs in production (SPS_LOG_JSON=1), human-readable otherwise.
    let json_logs = std::env::var("SPS_LOG_JSON").unwrap_or_default() == "1";
    let filter = EnvFilter::from_default_env().add_directive("switchboard_server=info".parse()?);
    if json_logs {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    let config = switchboard_server::config::ServerConfig::parse();
    if config.pass.is_some() {
        tracing::info!("passcode required for all clients");
    }
    let server = switchboard_server::server::Server::new(config);
    server.run().await
}
