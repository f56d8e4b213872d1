//! clientsync-server - client grouping and live claim sync service
//!
//! Configuration precedence: CLI flag > environment > TOML file > defaults.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use clientsync_common::config::{load_config, TomlConfig};
use clientsync_server::cache::{CacheInvalidator, InMemoryViewCache};
use clientsync_server::claim::{processor_from_config, ClaimTrigger};
use clientsync_server::db::{self, SqliteChangeSource};
use clientsync_server::dedup::DedupPolicy;
use clientsync_server::hub::{BroadcastHub, HubSettings};
use clientsync_server::identity::IdentityRules;
use clientsync_server::poller::{ChangeDetector, PollerSettings};
use clientsync_server::{build_router, AppState};
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Command-line arguments for clientsync-server
#[derive(Parser, Debug)]
#[command(name = "clientsync-server")]
#[command(about = "Client grouping and live claim sync service")]
#[command(version)]
struct Args {
    /// Path to a TOML config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Address to bind
    #[arg(long, env = "CLIENTSYNC_HOST")]
    host: Option<String>,

    /// Port to listen on
    #[arg(short, long, env = "CLIENTSYNC_PORT")]
    port: Option<u16>,

    /// Claim store URL, e.g. sqlite:///var/lib/claims.db
    #[arg(long, env = "CLIENTSYNC_DATABASE_URL")]
    database_url: Option<String>,

    /// Upstream endpoint that records claims
    #[arg(long, env = "CLIENTSYNC_CLAIMS_URL")]
    claims_url: Option<String>,

    /// Log level when RUST_LOG is unset
    #[arg(long, env = "CLIENTSYNC_LOG_LEVEL")]
    log_level: Option<String>,
}

impl Args {
    /// Overlay CLI/environment values onto the file configuration
    fn apply(self, mut config: TomlConfig) -> TomlConfig {
        if let Some(host) = self.host {
            config.server.host = host;
        }
        if let Some(port) = self.port {
            config.server.port = port;
        }
        if self.database_url.is_some() {
            config.server.database_url = self.database_url;
        }
        if self.claims_url.is_some() {
            config.claims.upstream_url = self.claims_url;
        }
        if let Some(level) = self.log_level {
            config.logging.level = level;
        }
        config
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = load_config(args.config.as_deref()).context("Failed to load configuration")?;
    let config = args.apply(config);

    let level = config.logging.level.trim().to_lowercase();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                format!(
                    "clientsync_server={level},clientsync_common={level},tower_http=info"
                )
                .into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!(
        "Starting clientsync-server v{} [{}] built {} ({})",
        env!("CARGO_PKG_VERSION"),
        env!("CLIENTSYNC_GIT_HASH"),
        env!("CLIENTSYNC_BUILT_AT"),
        env!("CLIENTSYNC_PROFILE")
    );

    let views = Arc::new(InMemoryViewCache::from_config(&config.cache));
    let invalidator = CacheInvalidator::new(views.clone());
    let patterns = config.cache.invalidate_patterns.clone();
    let hub_settings = HubSettings::from(&config.hub);

    let hub = match config.server.database_url.as_deref() {
        Some(url) => {
            let pool = db::connect_readonly(url)
                .await
                .with_context(|| format!("Failed to open claim store {}", url))?;
            info!("✓ Connected to claim store (read-only)");
            let source = SqliteChangeSource::new(pool, &config.poller.table)?;
            let detector =
                ChangeDetector::new(Arc::new(source), PollerSettings::from(&config.poller))
                    .with_invalidation(invalidator.clone(), patterns.clone());
            BroadcastHub::with_detector(hub_settings, Arc::new(detector))
        }
        None => {
            warn!("No claim store configured; out-of-band claim changes will not be detected");
            BroadcastHub::new(hub_settings)
        }
    };

    let processor = processor_from_config(&config.claims)?;
    let claims = ClaimTrigger::new(processor, invalidator, patterns, hub.clone());

    let state = AppState::new(
        hub.clone(),
        claims,
        IdentityRules::from(&config.identity),
        DedupPolicy::from(&config.dedup),
        views,
        config.hub.channel_capacity,
    );
    let app = build_router(state);

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .with_context(|| {
            format!(
                "Invalid listen address {}:{}",
                config.server.host, config.server.port
            )
        })?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("Failed to bind to address")?;
    info!("clientsync-server listening on http://{}", addr);
    info!("Health check: http://{}/health", addr);

    // Live streams only end once the hub drops their sinks
    let shutdown_hub = hub.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            shutdown_hub.reset();
        })
        .await
        .context("Server error")?;

    info!("Server shutdown complete");
    Ok(())
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down");
        },
        _ = terminate => {
            info!("Received terminate signal, shutting down");
        },
    }
}
