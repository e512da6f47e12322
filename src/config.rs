use std::net::SocketAddr;

use anyhow::Result;
use figment::{
    providers::{Format, Serialized, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};

/// Tunables of the application master. The staging and cluster contract
/// (spec file names, environment variables) is fixed; everything here has a
/// working default and may be overridden from a YAML file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AmConfig {
    /// Development mode: containers are controlled in-process instead of
    /// through the metadata store.
    pub dev: bool,
    /// Address the tracker binds to. Port 0 picks an ephemeral port.
    pub tracker_listen_addr: String,
    /// Interval of the provisioning loop.
    pub allocate_interval_ms: u64,
    /// Soft deadline for unmet container requests before the event handler
    /// is consulted.
    pub provision_timeout_secs: u64,
    /// How long to keep polling `allocate` after stopping all containers to
    /// drain their completion events.
    pub drain_secs: u64,
    /// How long a message send waits for the container to acknowledge.
    pub message_ack_timeout_secs: u64,
    /// How long `stop` waits for a container to go away before killing it.
    pub stop_timeout_secs: u64,
    /// Container slots the standalone resource manager hands out.
    pub standalone_capacity: u32,
    pub broker: BrokerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct BrokerConfig {
    /// Command used to start the log-shipping broker. Absent means no broker
    /// is managed by the AM.
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
}

impl Default for AmConfig {
    fn default() -> Self {
        AmConfig {
            dev: true,
            tracker_listen_addr: "0.0.0.0:0".to_string(),
            allocate_interval_ms: 1000,
            provision_timeout_secs: 30,
            drain_secs: 5,
            message_ack_timeout_secs: 60,
            stop_timeout_secs: 30,
            standalone_capacity: 100,
            broker: BrokerConfig::default(),
        }
    }
}

impl AmConfig {
    pub fn from_path(path: &str) -> Result<AmConfig> {
        let config_str = std::fs::read_to_string(path)?;
        let config: AmConfig = Figment::from(Serialized::defaults(AmConfig::default()))
            .merge(Yaml::string(&config_str))
            .extract()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.tracker_listen_addr.parse::<SocketAddr>().is_err() {
            return Err(anyhow::anyhow!(
                "invalid tracker listen address: {}",
                self.tracker_listen_addr
            ));
        }
        if self.allocate_interval_ms == 0 {
            return Err(anyhow::anyhow!("allocate_interval_ms must be positive"));
        }
        Ok(())
    }
}
