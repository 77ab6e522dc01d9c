//! Reader configuration.
//!
//! `DeviceConfig` is built once at startup, validated, and then only ever
//! read. Durations are written in milliseconds in the JSON form.

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;
use tracing::info;

use crate::sensors::SensorHandle;
use crate::uid::Uid;

/// The `ConfigValidationError` kind: anything wrong with user settings.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid config JSON: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("{field} = {value} is out of range ({allowed})")]
    OutOfRange {
        field: &'static str,
        value: String,
        allowed: &'static str,
    },

    #[error("unknown protocol '{0}' (expected ISO14443A, ISO14443B, ISO15693, FELICA or AUTO)")]
    UnknownProtocol(String),

    #[error("known tag {uid} is declared more than once")]
    DuplicateUid { uid: Uid },

    #[error("known tag {uid} has an empty sensor name")]
    EmptySensor { uid: Uid },
}

/// Tag protocol the chip should try first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Protocol {
    Iso14443A,
    Iso14443B,
    Iso15693,
    Felica,
    Auto,
}

impl Protocol {
    pub const ALL: [Protocol; 5] = [
        Protocol::Iso14443A,
        Protocol::Iso14443B,
        Protocol::Iso15693,
        Protocol::Felica,
        Protocol::Auto,
    ];

    /// Register encoding shared by the chip drivers.
    pub fn code(self) -> u8 {
        match self {
            Protocol::Iso14443A => 0,
            Protocol::Iso14443B => 1,
            Protocol::Iso15693 => 2,
            Protocol::Felica => 3,
            Protocol::Auto => 4,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        Protocol::ALL.into_iter().find(|p| p.code() == code)
    }

    /// Whether a tag speaking `answered` is acceptable under this priority.
    pub fn accepts(self, answered: Protocol) -> bool {
        self == Protocol::Auto || self == answered
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Protocol::Iso14443A => "ISO14443A",
            Protocol::Iso14443B => "ISO14443B",
            Protocol::Iso15693 => "ISO15693",
            Protocol::Felica => "FELICA",
            Protocol::Auto => "AUTO",
        };
        f.write_str(name)
    }
}

impl FromStr for Protocol {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let upper = s.trim().to_ascii_uppercase();
        Protocol::ALL
            .into_iter()
            .find(|p| p.to_string() == upper)
            .ok_or_else(|| ConfigError::UnknownProtocol(s.to_string()))
    }
}

impl<'de> Deserialize<'de> for Protocol {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(serde::de::Error::custom)
    }
}

/// Declared association of a UID to a named binary sensor.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct KnownTagBinding {
    pub uid: Uid,
    pub sensor: SensorHandle,
}

/// Thermal protection thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default)]
pub struct ThermalConfig {
    pub threshold_c: f32,
    pub hysteresis_c: f32,
    pub step: u8,
}

impl Default for ThermalConfig {
    fn default() -> Self {
        Self {
            threshold_c: 50.0,
            hysteresis_c: 5.0,
            step: 16,
        }
    }
}

/// How hard the reader tries to recover a chip that keeps failing resets.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default)]
pub struct ResetPolicy {
    #[serde(rename = "ready_timeout_ms", deserialize_with = "millis")]
    pub ready_timeout: Duration,
    pub max_attempts: u8,
    #[serde(rename = "backoff_base_ms", deserialize_with = "millis")]
    pub backoff_base: Duration,
    #[serde(rename = "backoff_max_ms", deserialize_with = "millis")]
    pub backoff_max: Duration,
}

impl Default for ResetPolicy {
    fn default() -> Self {
        Self {
            ready_timeout: Duration::from_secs(1),
            max_attempts: 5,
            backoff_base: Duration::from_secs(1),
            backoff_max: Duration::from_secs(60),
        }
    }
}

impl ResetPolicy {
    /// Delay before the next attempt after `failed` consecutive failed resets.
    pub fn backoff(&self, failed: u8) -> Duration {
        if failed == 0 {
            return Duration::ZERO;
        }
        let factor = 1u32 << u32::from(failed - 1).min(16);
        self.backoff_base
            .saturating_mul(factor)
            .min(self.backoff_max)
    }
}

/// Immutable, validated reader settings.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    #[serde(rename = "update_interval_ms", deserialize_with = "millis")]
    pub update_interval: Duration,

    pub power_level: u8,
    pub protocol_priority: Protocol,
    pub collision_avoidance: bool,
    pub rf_field_off_when_idle: bool,

    pub lpcd_enabled: bool,
    #[serde(rename = "lpcd_interval_ms", deserialize_with = "millis")]
    pub lpcd_interval: Duration,

    pub health_check_enabled: bool,
    #[serde(rename = "health_check_interval_ms", deserialize_with = "millis")]
    pub health_check_interval: Duration,
    pub auto_reset_on_failure: bool,
    pub max_failed_checks: u8,
    pub reset: ResetPolicy,

    pub diagnostics_enabled: bool,
    #[serde(rename = "diagnostics_interval_ms", deserialize_with = "millis")]
    pub diagnostics_interval: Duration,
    pub thermal: ThermalConfig,

    pub known_tags: Vec<KnownTagBinding>,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            update_interval: Duration::from_secs(1),
            power_level: 200,
            protocol_priority: Protocol::Auto,
            collision_avoidance: true,
            rf_field_off_when_idle: false,
            lpcd_enabled: false,
            lpcd_interval: Duration::from_millis(100),
            health_check_enabled: true,
            health_check_interval: Duration::from_secs(60),
            auto_reset_on_failure: true,
            max_failed_checks: 3,
            reset: ResetPolicy::default(),
            diagnostics_enabled: false,
            diagnostics_interval: Duration::from_secs(10),
            thermal: ThermalConfig::default(),
            known_tags: Vec::new(),
        }
    }
}

fn millis<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
    u64::deserialize(deserializer).map(Duration::from_millis)
}

fn out_of_range(field: &'static str, value: impl fmt::Display, allowed: &'static str) -> ConfigError {
    ConfigError::OutOfRange {
        field,
        value: value.to_string(),
        allowed,
    }
}

impl DeviceConfig {
    /// Parse and validate the JSON form.
    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let config: DeviceConfig = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values outside their declared bounds.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("update_interval_ms", self.update_interval),
            ("lpcd_interval_ms", self.lpcd_interval),
            ("health_check_interval_ms", self.health_check_interval),
            ("diagnostics_interval_ms", self.diagnostics_interval),
            ("reset.ready_timeout_ms", self.reset.ready_timeout),
            ("reset.backoff_base_ms", self.reset.backoff_base),
        ];
        for (field, value) in positive {
            if value.is_zero() {
                return Err(out_of_range(field, 0, "> 0"));
            }
        }

        if !(1..=10).contains(&self.max_failed_checks) {
            return Err(out_of_range("max_failed_checks", self.max_failed_checks, "1..=10"));
        }
        if !(1..=20).contains(&self.reset.max_attempts) {
            return Err(out_of_range("reset.max_attempts", self.reset.max_attempts, "1..=20"));
        }
        if self.reset.backoff_max < self.reset.backoff_base {
            return Err(out_of_range(
                "reset.backoff_max_ms",
                self.reset.backoff_max.as_millis(),
                ">= reset.backoff_base_ms",
            ));
        }

        if !self.thermal.threshold_c.is_finite() {
            return Err(out_of_range("thermal.threshold_c", self.thermal.threshold_c, "finite"));
        }
        if !self.thermal.hysteresis_c.is_finite() || self.thermal.hysteresis_c < 0.0 {
            return Err(out_of_range("thermal.hysteresis_c", self.thermal.hysteresis_c, ">= 0"));
        }
        if self.thermal.step == 0 {
            return Err(out_of_range("thermal.step", 0, "1..=255"));
        }

        let mut seen = HashSet::new();
        for binding in &self.known_tags {
            if binding.sensor.as_str().trim().is_empty() {
                return Err(ConfigError::EmptySensor {
                    uid: binding.uid.clone(),
                });
            }
            if !seen.insert(&binding.uid) {
                return Err(ConfigError::DuplicateUid {
                    uid: binding.uid.clone(),
                });
            }
        }

        Ok(())
    }

    /// Log the effective settings once at startup.
    pub fn log_summary(&self) {
        info!(
            update_ms = self.update_interval.as_millis() as u64,
            power = self.power_level,
            protocol = %self.protocol_priority,
            collision_avoidance = self.collision_avoidance,
            known_tags = self.known_tags.len(),
            "reader config"
        );
        if self.lpcd_enabled {
            info!(interval_ms = self.lpcd_interval.as_millis() as u64, "LPCD enabled");
        }
        if self.health_check_enabled {
            info!(
                interval_ms = self.health_check_interval.as_millis() as u64,
                max_failures = self.max_failed_checks,
                auto_reset = self.auto_reset_on_failure,
                "health check enabled"
            );
        } else {
            info!("health check disabled");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn empty_json_gives_defaults() {
        let config = DeviceConfig::from_json("{}").unwrap();
        assert_eq!(config, DeviceConfig::default());
        assert_eq!(config.power_level, 200);
        assert_eq!(config.max_failed_checks, 3);
        assert_eq!(config.lpcd_interval, Duration::from_millis(100));
    }

    #[test]
    fn parses_full_document() {
        let config = DeviceConfig::from_json(
            r#"{
                "update_interval_ms": 500,
                "power_level": 180,
                "protocol_priority": "iso15693",
                "collision_avoidance": false,
                "lpcd_enabled": true,
                "lpcd_interval_ms": 100,
                "max_failed_checks": 5,
                "reset": { "max_attempts": 2, "backoff_base_ms": 250 },
                "thermal": { "threshold_c": 60.0 },
                "known_tags": [
                    { "uid": "74:10:37:94", "sensor": "front_door" },
                    { "uid": "04-A2-2B-1C", "sensor": "garage" }
                ]
            }"#,
        )
        .unwrap();

        assert_eq!(config.update_interval, Duration::from_millis(500));
        assert_eq!(config.protocol_priority, Protocol::Iso15693);
        assert_eq!(config.reset.max_attempts, 2);
        assert_eq!(config.reset.backoff_base, Duration::from_millis(250));
        assert_eq!(config.reset.backoff_max, Duration::from_secs(60));
        assert_eq!(config.thermal.threshold_c, 60.0);
        assert_eq!(config.thermal.step, 16);
        assert_eq!(config.known_tags[0].uid.to_string(), "74-10-37-94");
        assert_eq!(config.known_tags[1].sensor.as_str(), "garage");
    }

    #[test]
    fn rejects_out_of_range_values() {
        for (json, field) in [
            (r#"{"max_failed_checks": 0}"#, "max_failed_checks"),
            (r#"{"max_failed_checks": 11}"#, "max_failed_checks"),
            (r#"{"update_interval_ms": 0}"#, "update_interval_ms"),
            (r#"{"reset": {"max_attempts": 0}}"#, "reset.max_attempts"),
            (r#"{"thermal": {"step": 0}}"#, "thermal.step"),
        ] {
            match DeviceConfig::from_json(json) {
                Err(ConfigError::OutOfRange { field: got, .. }) => assert_eq!(got, field),
                other => panic!("{json}: expected OutOfRange, got {other:?}"),
            }
        }
    }

    #[test]
    fn power_above_255_fails_to_parse() {
        assert!(matches!(
            DeviceConfig::from_json(r#"{"power_level": 300}"#),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn rejects_unknown_protocol_and_bad_uid() {
        assert!(DeviceConfig::from_json(r#"{"protocol_priority": "MIFARE"}"#).is_err());
        assert!(
            DeviceConfig::from_json(r#"{"known_tags": [{"uid": "74-1", "sensor": "x"}]}"#).is_err()
        );
    }

    #[test]
    fn rejects_duplicate_known_tags_after_normalisation() {
        let err = DeviceConfig::from_json(
            r#"{"known_tags": [
                {"uid": "74-10-37-94", "sensor": "a"},
                {"uid": "74:10:37:94", "sensor": "b"}
            ]}"#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::DuplicateUid { .. }));
    }

    #[test]
    fn protocol_has_exactly_five_values() {
        assert_eq!(Protocol::ALL.len(), 5);
        for protocol in Protocol::ALL {
            assert_eq!(Protocol::from_code(protocol.code()), Some(protocol));
            assert_eq!(protocol.to_string().parse::<Protocol>().unwrap(), protocol);
        }
        assert!(Protocol::Auto.accepts(Protocol::Felica));
        assert!(!Protocol::Iso14443A.accepts(Protocol::Iso15693));
    }

    #[test]
    fn reset_backoff_doubles_and_caps() {
        let policy = ResetPolicy::default();
        assert_eq!(policy.backoff(0), Duration::ZERO);
        assert_eq!(policy.backoff(1), Duration::from_secs(1));
        assert_eq!(policy.backoff(2), Duration::from_secs(2));
        assert_eq!(policy.backoff(4), Duration::from_secs(8));
        assert_eq!(policy.backoff(12), Duration::from_secs(60));
    }
}
