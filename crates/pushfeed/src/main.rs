//! pushfeed: streaming market data daemon
//!
//! Keeps one exchange stream alive, maintains verified order books for the
//! requested instruments and logs top of book. Serves health, readiness and
//! Prometheus metrics for the pod.

mod server;

use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing::{debug, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use pushfeed_client::{
    Arg, BookEvent, ClientConfig, Credentials, Endpoint, StreamClient, TopicKind,
};
use server::ServerState;

#[derive(Parser, Debug)]
#[command(name = "pushfeed")]
#[command(about = "Streaming order-book client")]
struct Args {
    /// Path to client configuration file
    #[arg(short, long, env = "PUSHFEED_CONFIG")]
    config: Option<PathBuf>,

    /// Channel to subscribe for every instrument
    #[arg(long, default_value = "books")]
    channel: String,

    /// Instrument ids, comma separated
    #[arg(long = "inst-id", env = "PUSHFEED_INST_IDS", value_delimiter = ',', required = true)]
    inst_ids: Vec<String>,

    /// Connect to the simulated trading environment
    #[arg(long)]
    simulated: bool,

    /// Health server bind address
    #[arg(long, env = "PUSHFEED_HEALTH_ADDR", default_value = "0.0.0.0:8080")]
    health_addr: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => {
            let config = ClientConfig::load(path)?;
            info!(path = %path.display(), "Loaded client configuration");
            config
        }
        None => ClientConfig::default(),
    };
    if args.simulated {
        config.simulated = true;
    }
    let endpoint = config.endpoint;

    let mut builder = StreamClient::builder(config);
    if endpoint != Endpoint::Public {
        match Credentials::from_env() {
            Ok(credentials) => builder = builder.credentials(credentials),
            Err(e) if endpoint.requires_login() => return Err(e.into()),
            Err(e) => info!(reason = %e, "No credentials, connecting without login"),
        }
    }
    let client = builder.build()?;

    install_handlers(&client);

    let topics: Vec<Arg> = args
        .inst_ids
        .iter()
        .map(|inst_id| Arg::new(args.channel.as_str()).with_inst_id(inst_id.as_str()))
        .collect();
    client.subscribe(&topics).await?;
    info!(channel = %args.channel, instruments = topics.len(), "Subscriptions queued");

    let health_addr: SocketAddr = args.health_addr.parse()?;
    let state = {
        let client = client.clone();
        ServerState::new(endpoint.label(), move || client.is_connected())
    };
    tokio::spawn(async move {
        info!(addr = %health_addr, "Starting health server");
        if let Err(e) = server::run_server(health_addr, state).await {
            warn!(error = %e, "Health server stopped");
        }
    });

    {
        let client = client.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            info!("Received shutdown signal");
            client.close().await;
        });
    }

    client.run().await?;
    info!("pushfeed stopped");
    Ok(())
}

fn install_handlers(client: &StreamClient) {
    let handlers = client.handlers();

    handlers.on_book(|event: &BookEvent| {
        let book = &event.snapshot;
        let bid = book.best_bid().map(|l| l.price.as_str()).unwrap_or("-");
        let ask = book.best_ask().map(|l| l.price.as_str()).unwrap_or("-");
        info!(
            inst_id = %book.inst_id,
            action = ?event.action,
            bid,
            ask,
            seq_id = book.seq_id,
            "top of book"
        );
    });

    handlers.on_push(TopicKind::Trade, |push| {
        debug!(inst_id = ?push.arg.inst_id, data = %push.data, "trade");
    });

    handlers.on_error(|err| warn!(error = %err, "stream error"));

    handlers.on_event(|event| {
        info!(event = %event.event, code = %event.code, msg = %event.msg, "server event");
    });
}

/// Listen for SIGTERM or ctrl-c.
#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sigterm) => sigterm,
        Err(e) => {
            warn!(error = %e, "SIGTERM handler unavailable, waiting for ctrl-c");
            tokio::signal::ctrl_c().await.ok();
            return;
        }
    };

    tokio::select! {
        _ = sigterm.recv() => info!("SIGTERM received"),
        _ = tokio::signal::ctrl_c() => info!("ctrl-c received"),
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    tokio::signal::ctrl_c().await.ok();
}
