mod api;
mod config;
mod poller;
mod websocket;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use axum::Router;
use tagwatch_reader::DeviceConfig;
use tokio::sync::broadcast;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::{Config, SimConfig};
use crate::websocket::{ReaderSnapshot, ReaderState};

/// Shared application state
pub struct AppState {
    pub reader_state: ReaderState,
    /// Broadcast channel for reader events
    pub events: broadcast::Sender<String>,
    /// Cleared to stop the poll loop
    pub running: AtomicBool,
}

impl AppState {
    pub fn new(snapshot: ReaderSnapshot) -> Self {
        let (events, _) = broadcast::channel(100);
        Self {
            reader_state: ReaderState::new(snapshot),
            events,
            running: AtomicBool::new(true),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "tagwatch_server=debug,tagwatch_reader=info,tower_http=debug".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration; invalid reader settings abort here
    let config = Config::from_env()?;
    let device_config = config.load_device_config()?;

    // Create shared state
    let state = Arc::new(AppState::new(ReaderSnapshot::new(
        device_config.power_level,
        &device_config.known_tags,
    )));

    let listener = tokio::net::TcpListener::bind(&config.bind_address).await?;
    tracing::info!("Tagwatch server listening on {}", config.bind_address);

    run(listener, state, device_config, config.sim, shutdown_signal()).await?;
    tracing::info!("Tagwatch server stopped");

    Ok(())
}

/// Serve until `shutdown` resolves, then stop the poll loop and wait for it.
async fn run(
    listener: tokio::net::TcpListener,
    state: Arc<AppState>,
    device_config: DeviceConfig,
    sim: SimConfig,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    // Start polling on the simulated front-end
    let poll_task = poller::spawn(state.clone(), device_config, sim);

    // Build router
    let app = Router::new()
        .nest("/api", api::router())
        .nest("/ws", websocket::router())
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state.clone());

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await;

    state.running.store(false, Ordering::Relaxed);
    poll_task.await?;
    served?;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::warn!("Failed to listen for Ctrl-C: {}", err);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown requested");
}
