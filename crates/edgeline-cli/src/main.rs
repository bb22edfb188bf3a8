//! Edgeline CLI - run the control plane of a named tunnel's connections

use anyhow::{bail, Context, Result};
use base64::Engine;
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

use edgeline_connection::{
    BooleanFuse, CancellationToken, ControlError, ControlStreamHandler, Observer,
};
use edgeline_proto::{ClientInfo, ConnectionOptions, TunnelCredentials, TunnelIdentity};

/// Edgeline - register tunnel connections with an edge and drain them on shutdown
#[derive(Parser, Debug)]
#[command(name = "edgeline")]
#[command(about = "Register tunnel connections with an edge", long_about = None)]
#[command(version)]
struct Cli {
    /// Edge control address (host:port)
    #[arg(short, long, env = "EDGELINE_EDGE")]
    edge: String,

    /// Number of parallel connections to the edge
    #[arg(long, default_value_t = 4, value_parser = clap::value_parser!(u8).range(1..=16))]
    ha_connections: u8,

    /// Seconds to wait for connections to unregister after Ctrl+C
    #[arg(long, default_value_t = 30)]
    grace_period: u64,

    /// Account the tunnel belongs to
    #[arg(long, env = "EDGELINE_ACCOUNT_TAG")]
    account_tag: String,

    /// Tunnel secret, base64 encoded
    #[arg(long, env = "EDGELINE_TUNNEL_SECRET", hide_env_values = true)]
    tunnel_secret: String,

    /// Tunnel ID
    #[arg(long, env = "EDGELINE_TUNNEL_ID")]
    tunnel_id: Uuid,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

impl Cli {
    fn identity(&self) -> Result<TunnelIdentity> {
        let tunnel_secret = base64::engine::general_purpose::STANDARD
            .decode(self.tunnel_secret.trim())
            .context("Tunnel secret is not valid base64")?;
        if tunnel_secret.is_empty() {
            bail!("Tunnel secret is empty");
        }

        Ok(TunnelIdentity::new(
            TunnelCredentials {
                account_tag: self.account_tag.clone(),
                tunnel_secret,
                tunnel_id: self.tunnel_id,
            },
            ClientInfo::default(),
        ))
    }

    fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(&cli.log_level))
        .context("Invalid log level")?;
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    let identity = Arc::new(cli.identity()?);
    info!(
        "Starting tunnel {} with {} connections to {}",
        identity.tunnel_id(),
        cli.ha_connections,
        cli.edge
    );

    let observer = Arc::new(Observer::new());
    let fuse = Arc::new(BooleanFuse::new());
    // Ctrl+C fires `graceful_shutdown`; a second Ctrl+C cancels `ctx` and cuts unregistration short
    let graceful_shutdown = CancellationToken::new();
    let ctx = CancellationToken::new();

    spawn_signal_handler(graceful_shutdown.clone(), ctx.clone(), cli.grace_period());
    spawn_event_logger(observer.clone(), fuse.clone());

    let mut connections = JoinSet::new();
    for conn_index in 0..cli.ha_connections {
        let handler = Arc::new(ControlStreamHandler::new(
            observer.clone(),
            fuse.clone(),
            identity.clone(),
            conn_index,
            graceful_shutdown.clone(),
            cli.grace_period(),
        ));
        let edge = cli.edge.clone();
        let client = identity.client.clone();
        let ctx = ctx.clone();

        connections.spawn(async move {
            let result = serve_connection(&handler, &ctx, &edge, client).await;
            (conn_index, result, handler.is_gracefully_stopped())
        });
    }

    let mut failed = 0usize;
    let mut graceful = 0usize;
    while let Some(joined) = connections.join_next().await {
        let (conn_index, result, stopped_gracefully) = joined.context("Connection task panicked")?;
        match result {
            Ok(()) if stopped_gracefully => graceful += 1,
            Ok(()) => debug!(conn_index, "Connection stopped without graceful shutdown"),
            Err(e) => {
                failed += 1;
                error!(conn_index, "Connection failed: {:#}", e);
            }
        }
    }

    info!(
        "All connections stopped ({} graceful, {} failed)",
        graceful, failed
    );

    if failed == cli.ha_connections as usize {
        bail!("No connection could be registered with {}", cli.edge);
    }
    Ok(())
}

/// Dial the edge and run one connection's control stream until it stops
async fn serve_connection(
    handler: &ControlStreamHandler,
    ctx: &CancellationToken,
    edge: &str,
    client: ClientInfo,
) -> Result<()> {
    let stream = TcpStream::connect(edge)
        .await
        .with_context(|| format!("Failed to connect to edge {}", edge))?;
    stream.set_nodelay(true)?;

    let mut options = ConnectionOptions::new(client);
    options.origin_local_ip = stream.local_addr().ok().map(|addr| addr.ip());

    match handler.run(ctx, stream, &options).await {
        Ok(()) => Ok(()),
        Err(e @ ControlError::RegistrationRejected { .. }) if e.is_permanent() => {
            Err(e).context("Edge permanently rejected the connection")
        }
        Err(e) => Err(e.into()),
    }
}

fn spawn_signal_handler(
    graceful_shutdown: CancellationToken,
    ctx: CancellationToken,
    grace_period: Duration,
) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_err() {
            warn!("Unable to listen for Ctrl+C");
            return;
        }
        info!(
            "Received Ctrl+C, unregistering connections (grace period {}s)",
            grace_period.as_secs()
        );
        graceful_shutdown.cancel();

        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Received second Ctrl+C, terminating connections");
            ctx.cancel();
        }
    });
}

fn spawn_event_logger(observer: Arc<Observer>, fuse: Arc<BooleanFuse>) {
    let mut events = observer.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            debug!(conn_index = event.index, "Connection event: {:?}", event.kind);
        }
    });
    tokio::spawn(async move {
        fuse.wait_connected().await;
        info!("Tunnel connected");
    });
}
