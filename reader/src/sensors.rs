//! Sensor publishing boundary.
//!
//! The reader pushes every observable value through a [`Publisher`]. What
//! happens next (MQTT, a status page, a test log) is the host's business.

use std::fmt;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use crate::health::Health;

/// Name of an externally owned binary sensor.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SensorHandle(String);

impl SensorHandle {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SensorHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One value change.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SensorUpdate {
    Agc { value: u8 },
    FieldStrength { value: u8 },
    Temperature { celsius: f32 },
    RfPower { level: u8 },
    /// Binary sensor bound to a known tag.
    KnownTag { sensor: SensorHandle, present: bool },
    /// Last seen UID; empty once no tag is present.
    LastUid { uid: String },
    Health { state: Health, consecutive_failures: u32 },
}

pub trait Publisher: Send {
    fn publish(&mut self, update: SensorUpdate);
}

/// Drops every update.
#[derive(Debug, Default)]
pub struct NullPublisher;

impl Publisher for NullPublisher {
    fn publish(&mut self, _update: SensorUpdate) {}
}

/// Keeps every update in a shared list. Clones share the same list.
#[derive(Debug, Clone, Default)]
pub struct SensorLog(Arc<Mutex<Vec<SensorUpdate>>>);

impl SensorLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> Vec<SensorUpdate> {
        self.0.lock().map(|log| log.clone()).unwrap_or_default()
    }

    pub fn clear(&self) {
        if let Ok(mut log) = self.0.lock() {
            log.clear();
        }
    }
}

impl Publisher for SensorLog {
    fn publish(&mut self, update: SensorUpdate) {
        if let Ok(mut log) = self.0.lock() {
            log.push(update);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_tag_update_keeps_sensor_name_beside_kind() {
        let json = serde_json::to_value(SensorUpdate::KnownTag {
            sensor: SensorHandle::new("front_door"),
            present: true,
        })
        .unwrap();
        assert_eq!(json["kind"], "known_tag");
        assert_eq!(json["sensor"], "front_door");
        assert_eq!(json["present"], true);
    }
}
