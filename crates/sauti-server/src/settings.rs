//! Server settings loaded from an optional file plus environment overrides

use config::{Config, Environment, File};
use serde::Deserialize;

use sauti_core::DeliveryConfig;

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub server: ServerSettings,

    #[serde(default)]
    pub upstream: UpstreamSettings,

    #[serde(default)]
    pub session: SessionSettings,

    /// Chunking, lane, and interruption tuning passed through to the core.
    #[serde(default)]
    pub delivery: DeliveryConfig,
}

impl Settings {
    /// Load from `sauti.toml` (optional) with `SAUTI_*` environment
    /// variables taking precedence, e.g. `SAUTI_SERVER__PORT=9000`.
    pub fn load() -> anyhow::Result<Self> {
        let settings = Config::builder()
            .add_source(File::with_name("sauti").required(false))
            .add_source(Environment::with_prefix("SAUTI").separator("__"))
            .build()?
            .try_deserialize()?;
        Ok(settings)
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server: ServerSettings::default(),
            upstream: UpstreamSettings::default(),
            session: SessionSettings::default(),
            delivery: DeliveryConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerSettings {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct UpstreamSettings {
    /// Base URL of the conversational engine
    #[serde(default = "default_upstream_base_url")]
    pub base_url: String,

    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl Default for UpstreamSettings {
    fn default() -> Self {
        Self {
            base_url: default_upstream_base_url(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SessionSettings {
    /// Conversations idle longer than this are swept away
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,

    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            idle_timeout_secs: default_idle_timeout_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_upstream_base_url() -> String {
    "http://127.0.0.1:8900".to_string()
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_idle_timeout_secs() -> u64 {
    600
}

fn default_sweep_interval_secs() -> u64 {
    60
}
