use anyhow::Context;
use async_trait::async_trait;
use clap::Parser;
use std::path::PathBuf;
use tether::{AuthMethod, Client, Config, EventSubscriber, InboundMessage};
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file (defaults to the per-user config directory)
    #[arg(short, long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Log level used when RUST_LOG is not set
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Show configuration file location and exit
    #[arg(long)]
    config_path: bool,
}

/// Logs traffic and drives the manual auth triggers the core leaves to its host.
struct ConsoleSubscriber {
    identify_on_connect: bool,
    fallback_on_failure: bool,
}

#[async_trait]
impl EventSubscriber for ConsoleSubscriber {
    async fn on_connected(&self, client: &Client) {
        info!("Connected as {}", client.current_nick().await);
        if self.identify_on_connect {
            if let Err(e) = client.identify_with_service().await {
                error!("Cannot identify with service: {}", e);
            }
        }
    }

    async fn on_message(&self, _client: &Client, message: &InboundMessage) {
        info!("[{}] <{}> {}", message.destination, message.sender_nick(), message.text);
    }

    async fn on_authenticated(&self, client: &Client, method: AuthMethod) {
        info!("Authenticated as {} via {:?}", client.current_nick().await, method);
    }

    async fn on_auth_failed(&self, client: &Client, reason: &str) {
        warn!("Authentication failed: {}", reason);
        if self.fallback_on_failure {
            if let Err(e) = client.fallback_join().await {
                warn!("Fallback join not possible: {}", e);
            }
        }
    }

    async fn on_pong(&self, _client: &Client, id: &str) {
        info!("PONG {}", id);
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tether::logger::init(&args.log_level);

    let path = match args.config {
        Some(path) => path,
        None => Config::default_path()?,
    };

    if args.config_path {
        println!("Configuration file location: {}", path.display());
        return Ok(());
    }

    let config = Config::load(&path)
        .with_context(|| format!("loading configuration from {}", path.display()))?;
    config.validate().context("invalid configuration")?;

    let subscriber = ConsoleSubscriber {
        identify_on_connect: config.service_auth.enabled,
        fallback_on_failure: config.behavior.fallback_join,
    };

    info!("Starting tether for {}", config.server.address);
    let client = Client::builder(config)
        .subscriber(subscriber)
        .start()
        .await
        .context("starting client")?;

    tokio::signal::ctrl_c()
        .await
        .context("waiting for ctrl-c")?;

    info!("Interrupted, shutting down");
    client.shutdown(Some("Shutting down".to_string())).await;
    Ok(())
}
