use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use tagwatch_reader::{DeviceConfig, Protocol, Uid};

/// Server configuration, read from the environment.
#[derive(Debug, Clone)]
pub struct Config {
    pub bind_address: String,
    /// JSON reader settings; defaults when unset.
    pub device_config: Option<PathBuf>,
    pub sim: SimConfig,
}

/// What the simulated front-end puts in its field.
#[derive(Debug, Clone, PartialEq)]
pub struct SimConfig {
    /// Tag that comes and goes. No tag ever appears when unset.
    pub tag: Option<Uid>,
    pub protocol: Protocol,
    pub present_for: Duration,
    pub absent_for: Duration,
    pub temperature: Option<f32>,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            tag: None,
            protocol: Protocol::Iso14443A,
            present_for: Duration::from_secs(5),
            absent_for: Duration::from_secs(10),
            temperature: None,
        }
    }
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let defaults = SimConfig::default();
        let seconds = |key: &str, default: Duration| -> anyhow::Result<Duration> {
            match lookup(key) {
                Some(value) => Ok(Duration::from_secs(
                    value.parse().with_context(|| format!("{key}: expected seconds"))?,
                )),
                None => Ok(default),
            }
        };

        let sim = SimConfig {
            tag: lookup("TAGWATCH_SIM_TAG")
                .map(|text| text.parse::<Uid>())
                .transpose()
                .context("TAGWATCH_SIM_TAG")?,
            protocol: lookup("TAGWATCH_SIM_PROTOCOL")
                .map(|text| text.parse::<Protocol>())
                .transpose()
                .context("TAGWATCH_SIM_PROTOCOL")?
                .unwrap_or(defaults.protocol),
            present_for: seconds("TAGWATCH_SIM_PRESENT_SECS", defaults.present_for)?,
            absent_for: seconds("TAGWATCH_SIM_ABSENT_SECS", defaults.absent_for)?,
            temperature: lookup("TAGWATCH_SIM_TEMPERATURE")
                .map(|text| text.parse::<f32>())
                .transpose()
                .context("TAGWATCH_SIM_TEMPERATURE")?,
        };

        Ok(Self {
            bind_address: lookup("TAGWATCH_BIND").unwrap_or_else(|| "0.0.0.0:3000".to_string()),
            device_config: lookup("TAGWATCH_DEVICE_CONFIG").map(PathBuf::from),
            sim,
        })
    }

    /// Load and validate the reader settings. Invalid settings abort startup.
    pub fn load_device_config(&self) -> anyhow::Result<DeviceConfig> {
        let config = match &self.device_config {
            Some(path) => {
                let text = std::fs::read_to_string(path)
                    .with_context(|| format!("reading {}", path.display()))?;
                DeviceConfig::from_json(&text)
                    .with_context(|| format!("parsing {}", path.display()))?
            }
            None => DeviceConfig::default(),
        };
        config.validate().context("invalid reader configuration")?;
        Ok(config)
    }
}
