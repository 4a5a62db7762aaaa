//! draftsync command-line tools.
//!
//! `draftsync tail` subscribes to the push channel and prints every
//! matching envelope as one JSON line on stdout. Logs go to stderr.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use draftsync_client::{
    EventEnvelope, EventHub, HubConfig, StaticToken, SubscriptionScope, WebSocketTransport,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "draftsync", about = "draftsync real-time tools")]
struct Cli {
    /// Push endpoint (overrides DRAFTSYNC_PUSH_URL).
    #[arg(long, global = true)]
    url: Option<String>,

    /// Reconnect delays in milliseconds, comma separated
    /// (overrides DRAFTSYNC_RETRY_DELAYS_MS).
    #[arg(long, global = true, value_delimiter = ',')]
    retry_delays_ms: Option<Vec<u64>>,

    /// Heartbeat timeout in milliseconds
    /// (overrides DRAFTSYNC_HEARTBEAT_TIMEOUT_MS).
    #[arg(long, global = true)]
    heartbeat_timeout_ms: Option<u64>,

    /// Bearer token sent when connecting.
    #[arg(long, global = true, env = "DRAFTSYNC_AUTH_TOKEN", hide_env_values = true)]
    token: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print envelopes for a topic as JSON lines until interrupted.
    Tail {
        /// Topic to follow, e.g. `document.lifecycle`.
        #[arg(long)]
        topic: String,

        /// Only envelopes for this resource.
        #[arg(long)]
        resource: Option<String>,
    },
}

impl Cli {
    fn hub_config(&self) -> Result<HubConfig> {
        let mut config = HubConfig::read_env().context("invalid push configuration in environment")?;
        if let Some(url) = &self.url {
            config.url = url.clone();
        }
        if let Some(delays) = &self.retry_delays_ms {
            config.retry_delays_ms = delays.clone();
        }
        if let Some(timeout) = self.heartbeat_timeout_ms {
            config.heartbeat_timeout_ms = timeout;
        }
        config.validate().context("invalid push configuration")?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "draftsync=info,draftsync_client=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let config = cli.hub_config()?;

    match cli.command {
        Command::Tail { topic, resource } => tail(config, cli.token, topic, resource).await,
    }
}

async fn tail(
    config: HubConfig,
    token: Option<String>,
    topic: String,
    resource: Option<String>,
) -> Result<()> {
    tracing::info!(url = %config.url, topic = %topic, resource = ?resource, "tailing push channel");

    let hub = EventHub::builder(config, Arc::new(WebSocketTransport::new()))
        .auth_token(StaticToken(token))
        .on_health_change(|status| tracing::info!(status = %status, "push health"))
        .on_fallback_change(|active| {
            if active {
                tracing::warn!("push channel degraded; consumers should poll");
            } else {
                tracing::info!("push channel recovered");
            }
        })
        .build()
        .context("failed to start event hub")?;

    let scope = match resource {
        Some(resource) => SubscriptionScope::resource(topic, resource),
        None => SubscriptionScope::topic(topic),
    };
    let subscription = hub.subscribe(scope, print_envelope);

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;

    tracing::info!("interrupted, shutting down");
    drop(subscription);
    hub.shutdown();
    Ok(())
}

fn print_envelope(envelope: &EventEnvelope) {
    match envelope.to_json() {
        Ok(line) => println!("{}", line),
        Err(e) => tracing::warn!(envelope_id = %envelope.id, error = %e, "could not encode envelope"),
    }
}
