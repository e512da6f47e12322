use std::time::Duration;

use anyhow::{Context, Result};
use tokio::{process::Child, process::Command, sync::Mutex};
use tracing::{info, warn};

use crate::{config::BrokerConfig, env_keys};

/// The log-shipping broker the AM runs next to itself. It is an external
/// process; the AM only owns its lifecycle and hands its metadata path to
/// every container. Without a configured command the broker is disabled.
pub struct LogBroker {
    config: BrokerConfig,
    kafka_zk_connect: String,
    child: Mutex<Option<Child>>,
}

impl LogBroker {
    pub fn new(config: BrokerConfig, kafka_zk_connect: String) -> Self {
        LogBroker {
            config,
            kafka_zk_connect,
            child: Mutex::new(None),
        }
    }

    pub async fn start(&self) -> Result<()> {
        let Some(command) = &self.config.command else {
            info!("no log broker configured");
            return Ok(());
        };
        info!(command = %command, "starting log broker");
        let child = Command::new(command)
            .args(&self.config.args)
            .env(env_keys::WEAVE_LOG_KAFKA_ZK, &self.kafka_zk_connect)
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("error starting log broker {command}"))?;
        *self.child.lock().await = Some(child);
        info!("log broker started");
        Ok(())
    }

    pub async fn stop(&self) {
        let Some(mut child) = self.child.lock().await.take() else {
            return;
        };
        info!("stopping log broker");
        if let Err(err) = child.start_kill() {
            warn!("failed to signal log broker: {err}");
            return;
        }
        match tokio::time::timeout(Duration::from_secs(5), child.wait()).await {
            Ok(Ok(status)) => info!(%status, "log broker stopped"),
            Ok(Err(err)) => warn!("error waiting for log broker: {err}"),
            Err(_) => warn!("log broker did not exit in time"),
        }
    }
}
