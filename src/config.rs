//! Bridge configuration.
//!
//! Loaded from a YAML file (path in `THERMIQ_CONFIG`, default
//! `thermiq.yaml`), with environment-variable overrides for the values
//! that change between deployments. Every field has a default, so the
//! bridge starts without a config file and talks to a broker on
//! localhost using the stock ThermIQ topic root.

use std::path::Path;

use anyhow::Context;
use serde::Deserialize;

/// Topic root published by the ThermIQ-MQTT hardware by default.
const DEFAULT_NODE: &str = "ThermIQ/ThermIQ-mqtt";

#[derive(Debug, Clone, Deserialize)]
pub struct BridgeConfig {
    /// Base MQTT path of the ThermIQ device, e.g. `ThermIQ/ThermIQ-mqtt`.
    #[serde(default = "default_node")]
    pub mqtt_node: String,
    /// Route writes to the `_dbg` topics instead of the live ones.
    #[serde(default)]
    pub thermiq_dbg: bool,
    #[serde(default = "default_broker_host")]
    pub broker_host: String,
    #[serde(default = "default_broker_port")]
    pub broker_port: u16,
    #[serde(default)]
    pub broker_user: Option<String>,
    #[serde(default)]
    pub broker_pass: Option<String>,
    #[serde(default = "default_http_port")]
    pub http_port: u16,
}

fn default_node() -> String {
    DEFAULT_NODE.to_string()
}

fn default_broker_host() -> String {
    "localhost".to_string()
}

fn default_broker_port() -> u16 {
    1883
}

fn default_http_port() -> u16 {
    8126
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            mqtt_node: default_node(),
            thermiq_dbg: false,
            broker_host: default_broker_host(),
            broker_port: default_broker_port(),
            broker_user: None,
            broker_pass: None,
            http_port: default_http_port(),
        }
    }
}

impl BridgeConfig {
    /// Load from `path` if it exists, otherwise start from defaults.
    /// Environment overrides are applied in either case.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let mut config = if path.exists() {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            serde_yaml::from_str(&contents)
                .with_context(|| format!("parsing {}", path.display()))?
        } else {
            tracing::info!("No config file at {}, using defaults", path.display());
            Self::default()
        };
        config.apply_env();
        Ok(config)
    }

    fn apply_env(&mut self) {
        if let Ok(node) = std::env::var("THERMIQ_MQTT_NODE") {
            self.mqtt_node = node;
        }
        if let Ok(host) = std::env::var("THERMIQ_BROKER_HOST") {
            self.broker_host = host;
        }
        if let Some(port) = std::env::var("THERMIQ_BROKER_PORT")
            .ok()
            .and_then(|p| p.parse().ok())
        {
            self.broker_port = port;
        }
        if let Some(port) = std::env::var("THERMIQ_HTTP_PORT")
            .ok()
            .and_then(|p| p.parse().ok())
        {
            self.http_port = port;
        }
    }

    /// Derive the fixed topic set. Computed once at startup; debug mode
    /// redirects writes but never the inbound data topic.
    pub fn topics(&self) -> Topics {
        let suffix = if self.thermiq_dbg { "_dbg" } else { "" };
        Topics {
            data: format!("{}/data", self.mqtt_node),
            cmd: format!("{}/write{}", self.mqtt_node, suffix),
            set: format!("{}/set{}", self.mqtt_node, suffix),
        }
    }
}

/// The three MQTT paths the bridge talks on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topics {
    /// Inbound telemetry from the device.
    pub data: String,
    /// General register writes.
    pub cmd: String,
    /// The distinguished room-sensor setpoint topic.
    pub set: String,
}
