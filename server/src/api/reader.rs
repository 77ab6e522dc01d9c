use std::sync::Arc;

use axum::{Json, Router, extract::State, routing::get};

use crate::AppState;
use crate::websocket::ReaderSnapshot;

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/status", get(reader_status))
}

/// GET /api/reader/status - Current health, tags, RF power and diagnostics
async fn reader_status(State(state): State<Arc<AppState>>) -> Json<ReaderSnapshot> {
    let snapshot = state.reader_state.read().await;
    Json(snapshot.clone())
}
