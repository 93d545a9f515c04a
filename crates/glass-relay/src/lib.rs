//! SimGlass relay: the `/api/cockpit` device-session API and the
//! shared-cockpit room socket. The API listener also accepts room sockets;
//! the room listener serves only the socket.

pub mod cockpit;
pub mod logging;
pub mod rooms;

use axum::{routing::get, Router};
use std::future::{Future, IntoFuture};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{info, warn};

pub const DEFAULT_ADDR: &str = "127.0.0.1:8080";
pub const DEFAULT_ROOM_ADDR: &str = "127.0.0.1:8085";
pub const DEFAULT_LOG_DIR: &str = ".simglass/logs";

#[derive(Clone, Debug)]
pub struct RelayConfig {
    pub addr: String,
    pub room_addr: String,
    pub debug: bool,
    /// Idle device sessions are dropped after this long; 0 disables the reaper.
    pub stale_seconds: u64,
    pub write_timeout: Duration,
    pub log_dir: String,
    pub allow_lan: bool,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            addr: DEFAULT_ADDR.to_string(),
            room_addr: DEFAULT_ROOM_ADDR.to_string(),
            debug: false,
            stale_seconds: 3600,
            write_timeout: Duration::from_secs(2),
            log_dir: DEFAULT_LOG_DIR.to_string(),
            allow_lan: false,
        }
    }
}

pub struct RelayState {
    pub config: RelayConfig,
    pub cockpit: cockpit::CockpitStore,
    pub rooms: rooms::RoomRegistry,
}

impl RelayState {
    pub fn new(config: RelayConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            cockpit: cockpit::CockpitStore::default(),
            rooms: rooms::RoomRegistry::default(),
        })
    }

    fn start_stale_reaper(self: Arc<Self>) {
        if self.config.stale_seconds == 0 {
            return;
        }
        let stale_after = Duration::from_secs(self.config.stale_seconds);
        let relay = Arc::downgrade(&self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(stale_after / 2);
            loop {
                ticker.tick().await;
                let Some(relay) = relay.upgrade() else {
                    return;
                };
                let reaped = relay.cockpit.reap(stale_after).await;
                if reaped > 0 {
                    warn!(event = "stale_sessions_reaped", count = reaped);
                }
            }
        });
    }
}

pub fn router(relay: Arc<RelayState>) -> Router {
    Router::new()
        .route("/", get(rooms::ws_handler))
        .route("/ws", get(rooms::ws_handler))
        .route("/health", get(|| async { "ok" }))
        .merge(cockpit::routes())
        .with_state(relay)
}

pub fn room_router(relay: Arc<RelayState>) -> Router {
    Router::new()
        .route("/", get(rooms::ws_handler))
        .route("/ws", get(rooms::ws_handler))
        .route("/health", get(|| async { "ok" }))
        .with_state(relay)
}

/// Serves until `shutdown` resolves.
pub async fn serve<F>(listener: TcpListener, relay: Arc<RelayState>, shutdown: F) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    relay.clone().start_stale_reaper();
    let addr = listener.local_addr()?;
    info!(event = "relay_start", addr = %addr, lan = relay.config.allow_lan);
    axum::serve(
        listener,
        router(relay).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await
}

/// Serves the session API on `api` and the room socket on `rooms` over one
/// relay state until `shutdown` resolves.
pub async fn serve_split<F>(
    api: TcpListener,
    rooms: TcpListener,
    relay: Arc<RelayState>,
    shutdown: F,
) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    relay.clone().start_stale_reaper();
    let (stop_tx, stop_rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown.await;
        let _ = stop_tx.send(true);
    });
    info!(
        event = "relay_start",
        addr = %api.local_addr()?,
        room_addr = %rooms.local_addr()?,
        lan = relay.config.allow_lan
    );
    let api_server = axum::serve(
        api,
        router(relay.clone()).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(stopped(stop_rx.clone()));
    let room_server = axum::serve(
        rooms,
        room_router(relay).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(stopped(stop_rx));
    let (api_result, room_result) =
        tokio::join!(api_server.into_future(), room_server.into_future());
    api_result.and(room_result)
}

async fn stopped(mut stop: watch::Receiver<bool>) {
    let _ = stop.wait_for(|stop| *stop).await;
}
