use std::sync::Arc;

use axum::{
    extract::{
        State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    response::Response,
};
use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use tagwatch_reader::{Diagnostic, Health, SensorUpdate};

use crate::AppState;

/// Messages pushed to every connected client
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ReaderEvent {
    TagDetected { uid: String, at: DateTime<Utc> },
    TagRemoved { uid: String, at: DateTime<Utc> },
    Health { state: Health, consecutive_failures: u32 },
    Diagnostic { diagnostic: Diagnostic },
    Sensor { update: SensorUpdate },
}

impl ReaderEvent {
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|err| {
            tracing::warn!("Failed to serialize event: {}", err);
            String::new()
        })
    }
}

/// WebSocket endpoint streaming reader events
pub async fn events_ws(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    ws.on_upgrade(|socket| handle_events_socket(socket, state))
}

async fn handle_events_socket(socket: WebSocket, state: Arc<AppState>) {
    let (mut sender, mut receiver) = socket.split();

    // Subscribe before reading the snapshot so nothing falls in between
    let mut rx = state.events.subscribe();

    tracing::debug!("Event client connected");

    let snapshot = state.reader_state.read().await.clone();
    let initial_state = serde_json::json!({
        "type": "initial_state",
        "reader": snapshot,
    });

    if sender
        .send(Message::Text(initial_state.to_string().into()))
        .await
        .is_err()
    {
        return;
    }

    // Task to forward broadcasts to this client
    let send_task = tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(msg) => {
                    if sender.send(Message::Text(msg.into())).await.is_err() {
                        break;
                    }
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!("Event client lagging, skipped {} messages", skipped);
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    while let Some(Ok(msg)) = receiver.next().await {
        match msg {
            Message::Ping(data) => {
                // Pong is handled automatically by axum
                tracing::trace!("Ping received: {:?}", data);
            }
            Message::Close(_) => {
                break;
            }
            _ => {}
        }
    }

    send_task.abort();
    tracing::debug!("Event client disconnected");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_carry_type_tag() {
        let json: serde_json::Value = serde_json::from_str(
            &ReaderEvent::Health {
                state: Health::Degraded,
                consecutive_failures: 2,
            }
            .to_json(),
        )
        .unwrap();
        assert_eq!(json["type"], "health");
        assert_eq!(json["state"], "degraded");

        let json: serde_json::Value = serde_json::from_str(
            &ReaderEvent::Sensor {
                update: SensorUpdate::RfPower { level: 184 },
            }
            .to_json(),
        )
        .unwrap();
        assert_eq!(json["type"], "sensor");
        assert_eq!(json["update"]["kind"], "rf_power");
        assert_eq!(json["update"]["level"], 184);
    }
}
