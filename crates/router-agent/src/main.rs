//! Router agent binary

use router_agent::{AgentServer, Config};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Loaded before logging exists, so errors go to stderr
    let config = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Configuration error: {}", e);
            eprintln!("Using default configuration");
            Config::default()
        }
    };

    if config.json_logs() {
        common::logging::init_json(config.log_level());
    } else {
        common::logging::init(config.log_level());
    }

    tracing::info!(listen = %config.server.listen, "Router agent starting");
    AgentServer::new(config).run().await
}
