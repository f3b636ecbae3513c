//! WorldVisa DMS gateway server
//!
//! Starts the HTTP gateway in front of the DMS backend.
//! - REST proxy with a shared query cache
//! - SSE channels: /api/notifications/stream, /api/client/notifications/stream,
//!   /api/comments/stream
//! - Optional relay of the backend's own event stream
//!
//! Usage:
//!   DMS_BACKEND_URL=https://dms.example.com/api cargo run --bin worldvisa_dms
//!   cargo run --bin dms-cli -- login -e admin@worldvisa.com -p ...

use std::{net::SocketAddr, sync::Arc};

use tokio::net::TcpListener;
use tokio::signal::{self, ctrl_c};
use tracing::info;

use worldvisa_dms::config::Config;
use worldvisa_dms::invalidation::spawn_bridge;
use worldvisa_dms::relay::spawn_upstream_relay;
use worldvisa_dms::rest::{create_router, AppState};
use worldvisa_dms::telemetry::init_tracing;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::load()?;
    let _log_guard = init_tracing(&config);

    info!(backend = %config.backend_url, "WorldVisa DMS gateway starting");
    if config.jwt_secret.is_none() {
        info!("DMS_JWT_SECRET not set, token signatures are left to the backend");
    }

    let state = Arc::new(AppState::from_config(&config));

    // Background tasks: cache GC, hub -> cache invalidation, optional upstream relay
    let _gc = state.cache.spawn_gc();
    let _bridge = spawn_bridge(state.hub.clone(), state.cache.clone());
    let _relay = config.upstream_events_path.clone().map(|path| {
        info!(%path, "relaying backend events");
        spawn_upstream_relay(
            state.backend.clone(),
            path,
            config.upstream_token.clone(),
            state.hub.clone(),
        )
    });

    let app = create_router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = TcpListener::bind(addr).await?;
    info!("Server running on {addr}");

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Shutting down...");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if ctrl_c().await.is_ok() {
            info!("Received Ctrl+C, shutting down");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
                info!("Received terminate signal, shutting down");
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
