use std::sync::{Arc, Mutex};

use anyhow::{bail, Result};
use async_trait::async_trait;
use tokio::{sync::mpsc, time::timeout, time::Duration};
use tracing::{debug, warn};

use crate::{
    cluster::{LaunchContext, ProcessLauncher},
    data_model::{system_messages, Message, RunId},
    env_keys,
    metadata::{driver::StoreDriver, CreateMode, MetadataClient},
};

/// Handle through which messages and stop requests reach one running
/// container process.
#[async_trait]
pub trait ContainerController: Send + Sync {
    fn run_id(&self) -> &RunId;

    /// Delivers a message to the container and resolves once the container
    /// acknowledged it.
    async fn send_message(&self, message: &Message) -> Result<()>;

    /// Asks the container to stop and waits for it to go away.
    async fn stop(&self) -> Result<()>;

    /// Records that the cluster reported this container as completed.
    fn completed(&self, exit_status: i32);

    /// Forcibly releases the container.
    async fn kill(&self) -> Result<()>;
}

/// Spawns the in-container process for one assigned instance and returns the
/// controller used to reach it afterwards.
#[async_trait]
pub trait RunnableLauncher: Send + Sync {
    async fn start(&self, run_id: RunId, instance_id: u32) -> Result<Arc<dyn ContainerController>>;
}

/// Builds a [`RunnableLauncher`] for one acquired container.
pub trait LauncherFactory: Send + Sync {
    fn runnable_launcher(
        &self,
        runnable_name: &str,
        process: Arc<dyn ProcessLauncher>,
        ctx: LaunchContext,
    ) -> Arc<dyn RunnableLauncher>;
}

#[derive(Debug, Clone, Copy)]
pub struct ControllerTimeouts {
    pub message_ack: Duration,
    pub stop: Duration,
}

impl Default for ControllerTimeouts {
    fn default() -> Self {
        ControllerTimeouts {
            message_ack: Duration::from_secs(60),
            stop: Duration::from_secs(30),
        }
    }
}

/// Factory for the store-backed launch transport. `metadata_app` is the
/// client namespaced at the application root.
pub struct StoreLauncherFactory {
    metadata_app: MetadataClient,
    timeouts: ControllerTimeouts,
}

impl StoreLauncherFactory {
    pub fn new(metadata_app: MetadataClient, timeouts: ControllerTimeouts) -> Self {
        StoreLauncherFactory {
            metadata_app,
            timeouts,
        }
    }
}

impl LauncherFactory for StoreLauncherFactory {
    fn runnable_launcher(
        &self,
        runnable_name: &str,
        process: Arc<dyn ProcessLauncher>,
        ctx: LaunchContext,
    ) -> Arc<dyn RunnableLauncher> {
        Arc::new(StoreRunnableLauncher::new(
            runnable_name,
            self.metadata_app.namespace(&format!("/runnables/{runnable_name}")),
            process,
            ctx,
            self.timeouts,
        ))
    }
}

/// Launcher whose controllers talk to the container through the metadata
/// store, under the runnable's namespace.
pub struct StoreRunnableLauncher {
    runnable_name: String,
    /// Client namespaced at `/runnables/<name>`.
    runnable_client: MetadataClient,
    process: Arc<dyn ProcessLauncher>,
    ctx: LaunchContext,
    timeouts: ControllerTimeouts,
}

impl StoreRunnableLauncher {
    pub fn new(
        runnable_name: impl Into<String>,
        runnable_client: MetadataClient,
        process: Arc<dyn ProcessLauncher>,
        ctx: LaunchContext,
        timeouts: ControllerTimeouts,
    ) -> Self {
        StoreRunnableLauncher {
            runnable_name: runnable_name.into(),
            runnable_client,
            process,
            ctx,
            timeouts,
        }
    }
}

#[async_trait]
impl RunnableLauncher for StoreRunnableLauncher {
    async fn start(&self, run_id: RunId, instance_id: u32) -> Result<Arc<dyn ContainerController>> {
        let mut ctx = self.ctx.clone();
        ctx.environment
            .insert(env_keys::WEAVE_RUN_ID.to_string(), run_id.to_string());
        ctx.environment.insert(
            env_keys::WEAVE_RUNNABLE_NAME.to_string(),
            self.runnable_name.clone(),
        );
        ctx.environment
            .insert(env_keys::WEAVE_INSTANCE_ID.to_string(), instance_id.to_string());
        ctx.environment.insert(
            env_keys::WEAVE_INSTANCE_COUNT.to_string(),
            ctx.instance_count.to_string(),
        );
        if !ctx.arguments.is_empty() {
            ctx.environment.insert(
                env_keys::WEAVE_RUNNABLE_ARGS.to_string(),
                serde_json::to_string(&ctx.arguments)?,
            );
        }

        self.process.launch(&run_id, instance_id, &ctx).await?;

        Ok(Arc::new(StoreContainerController {
            runnable_name: self.runnable_name.clone(),
            container_client: self.runnable_client.namespace(&format!("/{run_id}")),
            runnable_client: self.runnable_client.clone(),
            run_id,
            instance_id,
            process: self.process.clone(),
            completed: Mutex::new(None),
            timeouts: self.timeouts,
        }))
    }
}

/// Controller speaking the message-node protocol: a message is a sequential
/// node under the container's `messages/` directory, acknowledged by the
/// container deleting it. Liveness is the instance ephemeral node.
pub struct StoreContainerController {
    runnable_name: String,
    run_id: RunId,
    instance_id: u32,
    /// Namespaced at `/runnables/<name>/<containerRunId>`.
    container_client: MetadataClient,
    /// Namespaced at `/runnables/<name>`.
    runnable_client: MetadataClient,
    process: Arc<dyn ProcessLauncher>,
    completed: Mutex<Option<i32>>,
    timeouts: ControllerTimeouts,
}

impl StoreContainerController {
    fn is_completed(&self) -> bool {
        self.completed.lock().unwrap().is_some()
    }

    async fn post_message(&self, message: &Message) -> Result<String> {
        let data = serde_json::to_vec(message)?;
        self.container_client.ensure("", b"").await?;
        self.container_client.ensure("/messages", b"").await?;
        self.container_client
            .create("/messages/msg", &data, CreateMode::PersistentSequential)
            .await
    }
}

#[async_trait]
impl ContainerController for StoreContainerController {
    fn run_id(&self) -> &RunId {
        &self.run_id
    }

    async fn send_message(&self, message: &Message) -> Result<()> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let path = self.post_message(message).await?;
        loop {
            if !self.container_client.exists(&path, Some(tx.clone())).await? {
                return Ok(());
            }
            match timeout(self.timeouts.message_ack, rx.recv()).await {
                Ok(Some(_)) => continue,
                Ok(None) | Err(_) => bail!(
                    "no acknowledgement of {} from {} {}",
                    path,
                    self.runnable_name,
                    self.run_id
                ),
            }
        }
    }

    async fn stop(&self) -> Result<()> {
        if self.is_completed() {
            return Ok(());
        }
        // Fire-and-forget; the instance node going away is the confirmation.
        if let Err(err) = self
            .post_message(&system_messages::stop_runnable(&self.runnable_name))
            .await
        {
            warn!(
                runnable = %self.runnable_name,
                run_id = %self.run_id,
                "failed to post stop message: {err:#}"
            );
        }

        let instance_path = format!("/instances/{}", self.instance_id);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let deadline = tokio::time::Instant::now() + self.timeouts.stop;
        loop {
            if self.is_completed() {
                return Ok(());
            }
            if !self.runnable_client.exists(&instance_path, Some(tx.clone())).await? {
                return Ok(());
            }
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                warn!(
                    runnable = %self.runnable_name,
                    run_id = %self.run_id,
                    "container did not stop in time, killing it"
                );
                return self.kill().await;
            }
            match timeout(remaining, rx.recv()).await {
                Ok(Some(_)) => continue,
                Ok(None) | Err(_) => {
                    warn!(
                        runnable = %self.runnable_name,
                        run_id = %self.run_id,
                        "container did not stop in time, killing it"
                    );
                    return self.kill().await;
                }
            }
        }
    }

    fn completed(&self, exit_status: i32) {
        debug!(
            runnable = %self.runnable_name,
            run_id = %self.run_id,
            exit_status,
            "container completion recorded"
        );
        *self.completed.lock().unwrap() = Some(exit_status);
    }

    async fn kill(&self) -> Result<()> {
        self.process.terminate().await
    }
}
