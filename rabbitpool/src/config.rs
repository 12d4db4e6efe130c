//! Layered runtime settings.
//!
//! Settings are resolved from built-in defaults, an optional `rabbitpool.toml`
//! in the working directory (or an explicit file), and finally environment
//! variables prefixed with `RABBITPOOL`, using `__` to separate nested keys
//! (for example `RABBITPOOL_AMQP__HOST=broker`).

use config::{Config, Environment, File};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::Result;
use crate::pool::TopologyConfig;

/// Top-level runtime settings
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub app: AppSettings,
    pub amqp: AmqpSettings,
    pub contract: ContractSettings,
    pub bus: BusSettings,
    pub runtime: RuntimeSettings,
    pub topology: TopologyConfig,
}

impl Settings {
    /// Load settings from `rabbitpool.toml` (if present) and the environment
    pub fn load() -> Result<Self> {
        Self::build(File::with_name("rabbitpool").required(false))
    }

    /// Load settings from an explicit file, still honouring environment overrides
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        Self::build(File::from(path.as_ref()).required(true))
    }

    fn build(file: File<config::FileSourceFile, config::FileFormat>) -> Result<Self> {
        let config = Config::builder()
            .add_source(file)
            .add_source(
                Environment::with_prefix("RABBITPOOL")
                    .prefix_separator("_")
                    .separator("__"),
            )
            .build()?;

        Ok(config.try_deserialize()?)
    }
}

/// Application identity stamped on outgoing messages
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppSettings {
    pub id: String,
    pub version: String,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            id: "rabbitpool".to_string(),
            version: "1.0.0".to_string(),
        }
    }
}

/// Broker connection fields
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AmqpSettings {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub vhost: String,
    /// Heartbeat interval in seconds, 0 disables heartbeat checks
    pub heartbeat: u16,
    /// Connection timeout in seconds
    pub connection_timeout: u64,
    pub ssl: SslSettings,
    /// Number of connection attempts before giving up
    pub connect_retries: u32,
    /// Delay between connection attempts in milliseconds
    pub retry_delay_ms: u64,
}

impl Default for AmqpSettings {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5672,
            user: "guest".to_string(),
            password: "guest".to_string(),
            vhost: "/".to_string(),
            heartbeat: 60,
            connection_timeout: 3,
            ssl: SslSettings::default(),
            connect_retries: 5,
            retry_delay_ms: 1_000,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SslSettings {
    pub enabled: bool,
}

/// Where the channel contract lives and how it is validated
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ContractSettings {
    /// Name of the contract to load from `sources`
    pub name: String,
    /// Directory holding `<protocol>/{channel,operation,message}.json`
    pub validator_dir: PathBuf,
    pub protocol: String,
    pub sources: BTreeMap<String, ContractSource>,
}

impl Default for ContractSettings {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            validator_dir: PathBuf::from("schemas"),
            protocol: "amqp".to_string(),
            sources: BTreeMap::new(),
        }
    }
}

/// Location of one contract document: `path/definitions`
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ContractSource {
    pub path: Option<PathBuf>,
    pub definitions: Option<String>,
}

/// Message bus timings and QoS defaults
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BusSettings {
    pub confirm_timeout_ms: u64,
    pub rpc_timeout_ms: u64,
    pub rpc_poll_interval_ms: u64,
    pub iterate_wait_ms: u64,
    pub qos: QosSettings,
}

impl Default for BusSettings {
    fn default() -> Self {
        Self {
            confirm_timeout_ms: 5_000,
            rpc_timeout_ms: 30_000,
            rpc_poll_interval_ms: 50,
            iterate_wait_ms: 500,
            qos: QosSettings::default(),
        }
    }
}

impl BusSettings {
    pub fn confirm_timeout(&self) -> Duration {
        Duration::from_millis(self.confirm_timeout_ms)
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }

    pub fn rpc_poll_interval(&self) -> Duration {
        Duration::from_millis(self.rpc_poll_interval_ms)
    }

    pub fn iterate_wait(&self) -> Duration {
        Duration::from_millis(self.iterate_wait_ms)
    }
}

/// Consumer prefetch settings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct QosSettings {
    pub prefetch_size: u32,
    pub prefetch_count: u16,
    pub global: bool,
}

impl Default for QosSettings {
    fn default() -> Self {
        Self {
            prefetch_size: 0,
            prefetch_count: 1,
            global: false,
        }
    }
}

/// Supervisor and worker loop cadence
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RuntimeSettings {
    pub loop_interval_ms: u64,
    pub ipc_poll_timeout_ms: u64,
    pub infrastructure_settle_ms: u64,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            loop_interval_ms: 50,
            ipc_poll_timeout_ms: 100,
            infrastructure_settle_ms: 1_000,
        }
    }
}

impl RuntimeSettings {
    pub fn loop_interval(&self) -> Duration {
        Duration::from_millis(self.loop_interval_ms)
    }

    pub fn ipc_poll_timeout(&self) -> Duration {
        Duration::from_millis(self.ipc_poll_timeout_ms)
    }

    pub fn infrastructure_settle(&self) -> Duration {
        Duration::from_millis(self.infrastructure_settle_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::ThreadType;

    #[test]
    fn test_defaults() {
        let settings = Settings::default();
        assert_eq!(settings.amqp.port, 5672);
        assert_eq!(settings.bus.confirm_timeout(), Duration::from_secs(5));
        assert_eq!(settings.bus.rpc_timeout(), Duration::from_secs(30));
        assert_eq!(settings.bus.qos.prefetch_count, 1);
        assert_eq!(settings.runtime.loop_interval(), Duration::from_millis(50));
        assert_eq!(settings.contract.protocol, "amqp");
    }

    #[test]
    fn test_load_from_file() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures/rabbitpool.toml");
        let settings = Settings::load_from(&path).unwrap();

        assert_eq!(settings.app.id, "billing");
        assert_eq!(settings.amqp.heartbeat, 30);
        assert_eq!(settings.contract.name, "billing");
        assert!(settings.contract.sources.contains_key("billing"));
        assert!(settings.topology.has_infrastructure_thread);
        assert_eq!(settings.topology.channels.len(), 1);

        let configurations = settings.topology.thread_configurations();
        assert!(configurations
            .iter()
            .any(|config| config.thread_type == ThreadType::Infrastructure));
    }
}
