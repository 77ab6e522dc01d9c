mod events;

use std::sync::Arc;

use axum::Router;
use serde::Serialize;
use tagwatch_reader::{DiagnosticsSample, Health, KnownTagBinding};
use tokio::sync::RwLock;

use crate::AppState;

pub use events::{ReaderEvent, events_ws};

/// Build the WebSocket router
pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/events", axum::routing::get(events_ws))
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct KnownTagStatus {
    pub uid: String,
    pub sensor: String,
    pub present: bool,
}

/// Latest reader state as seen by HTTP and WebSocket clients
#[derive(Debug, Clone, Serialize)]
pub struct ReaderSnapshot {
    pub health: Health,
    pub consecutive_failures: u32,
    pub present_tags: Vec<String>,
    pub last_uid: Option<String>,
    pub rf_power: u8,
    pub diagnostics: DiagnosticsSample,
    pub known_tags: Vec<KnownTagStatus>,
}

impl ReaderSnapshot {
    pub fn new(rf_power: u8, known_tags: &[KnownTagBinding]) -> Self {
        Self {
            health: Health::Healthy,
            consecutive_failures: 0,
            present_tags: Vec::new(),
            last_uid: None,
            rf_power,
            diagnostics: DiagnosticsSample::default(),
            known_tags: known_tags
                .iter()
                .map(|binding| KnownTagStatus {
                    uid: binding.uid.to_string(),
                    sensor: binding.sensor.to_string(),
                    present: false,
                })
                .collect(),
        }
    }
}

/// Thread-safe reader state wrapper
pub struct ReaderState(RwLock<ReaderSnapshot>);

impl ReaderState {
    pub fn new(snapshot: ReaderSnapshot) -> Self {
        Self(RwLock::new(snapshot))
    }

    pub async fn read(&self) -> tokio::sync::RwLockReadGuard<'_, ReaderSnapshot> {
        self.0.read().await
    }

    /// For the poll thread, which never runs inside the async runtime.
    pub fn blocking_write(&self) -> tokio::sync::RwLockWriteGuard<'_, ReaderSnapshot> {
        self.0.blocking_write()
    }
}
