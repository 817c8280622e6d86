//! # parley-server
//!
//! Real-time group messaging gateway.
//!
//! This binary provides:
//! - **Session tokens**: Ed25519-signed, stateless, short-lived
//! - **File registry**: uploaded content on disk, metadata persisted to a
//!   JSON snapshot that survives restarts
//! - **Broadcast hub**: every authenticated WebSocket connection receives
//!   every message, in one hub-wide order
//! - **REST API** (axum) for login, upload/download and file listings
//! - **Per-IP rate limiting** on HTTP and per-connection flood control on
//!   the realtime channel

mod api;
mod config;
mod credentials;
mod error;
mod hub;
mod rate_limit;
mod ws;

use std::sync::Arc;

use parley_shared::token::TokenService;
use parley_store::FileRegistry;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::api::AppState;
use crate::config::ServerConfig;
use crate::credentials::CredentialStore;
use crate::hub::{Hub, HubConfig};
use crate::rate_limit::RateLimiter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // -----------------------------------------------------------------------
    // 1. Initialize tracing (respects RUST_LOG env var)
    // -----------------------------------------------------------------------
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new("info,parley_server=debug,parley_store=debug")
        }))
        .init();

    info!("Starting Parley gateway v{}", env!("CARGO_PKG_VERSION"));

    // -----------------------------------------------------------------------
    // 2. Load configuration
    // -----------------------------------------------------------------------
    let config = ServerConfig::from_env();
    info!(?config, "Loaded configuration");

    // -----------------------------------------------------------------------
    // 3. Initialize subsystems
    // -----------------------------------------------------------------------

    // File registry (creates the upload directory, reloads the snapshot)
    let registry = Arc::new(
        FileRegistry::open(
            config.upload_dir.clone(),
            config.snapshot_path.clone(),
            config.max_upload_size,
        )
        .await?,
    );
    info!(files = registry.len().await, "File registry ready");

    let credentials = Arc::new(CredentialStore::from_users(&config.users)?);
    info!(accounts = credentials.len(), "Credential store ready");

    let tokens = Arc::new(match config.token_signing_key {
        Some(seed) => TokenService::from_seed(&seed, config.token_ttl),
        None => {
            warn!("TOKEN_SIGNING_KEY not set, sessions will not survive a restart");
            TokenService::generate(config.token_ttl)
        }
    });

    let hub = Arc::new(Hub::new(
        tokens.clone(),
        registry.clone(),
        HubConfig {
            outbound_queue: config.outbound_queue,
            max_protocol_violations: config.max_protocol_violations,
            ..HubConfig::default()
        },
    ));

    // Rate limiter: 10 req/s sustained, burst of 30
    let rate_limiter = RateLimiter::default();

    let http_addr = config.http_addr;
    let app_state = AppState {
        hub,
        registry,
        tokens,
        credentials,
        rate_limiter: rate_limiter.clone(),
        config: Arc::new(config),
    };

    // -----------------------------------------------------------------------
    // 4. Spawn background tasks
    // -----------------------------------------------------------------------

    // Periodic rate limiter cleanup (every 5 minutes, evict buckets idle >10 min)
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(300));
        loop {
            interval.tick().await;
            rate_limiter.purge_stale(600.0).await;
        }
    });

    // -----------------------------------------------------------------------
    // 5. Run the HTTP + WebSocket server until shutdown
    // -----------------------------------------------------------------------
    tokio::select! {
        result = api::serve(app_state, http_addr) => {
            if let Err(e) = result {
                tracing::error!(error = %e, "HTTP server failed");
                return Err(e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
        }
    }

    Ok(())
}
