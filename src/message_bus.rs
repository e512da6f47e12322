use std::{
    collections::HashSet,
    sync::{Arc, Mutex},
};

use anyhow::Result;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::{
    credentials::CredentialsCache,
    data_model::{system_messages, AppSpec, Message, MessageScope, MessageType},
    expected::ExpectedContainers,
    instance_worker::{InstanceChangeRequest, InstanceChangeWorker},
    metadata::MetadataClient,
    registry::{ContainerRegistry, MessageCompletion},
};

/// Consumes control messages from the metadata store and dispatches them.
///
/// Watched locations under the application namespace: the application-level
/// `messages/` node, and each runnable's `runnables/<name>/messages/` node
/// (messages found there are runnable-scoped commands for that runnable).
/// A message node is deleted - acknowledged - only after its dispatch
/// completion fired; delivery is therefore at-least-once and commands must
/// be idempotent, which the processed-set below relies on.
pub struct MessageBus {
    /// Client namespaced at the application root.
    metadata: MetadataClient,
    spec: Arc<AppSpec>,
    registry: Arc<ContainerRegistry>,
    expected: Arc<ExpectedContainers>,
    credentials: Arc<CredentialsCache>,
    worker: Arc<InstanceChangeWorker>,
    shutdown_tx: watch::Sender<bool>,
    processed: Mutex<HashSet<String>>,
}

impl MessageBus {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        metadata: MetadataClient,
        spec: Arc<AppSpec>,
        registry: Arc<ContainerRegistry>,
        expected: Arc<ExpectedContainers>,
        credentials: Arc<CredentialsCache>,
        worker: Arc<InstanceChangeWorker>,
        shutdown_tx: watch::Sender<bool>,
    ) -> Self {
        MessageBus {
            metadata,
            spec,
            registry,
            expected,
            credentials,
            worker,
            shutdown_tx,
            processed: Mutex::new(HashSet::new()),
        }
    }

    fn message_dirs(&self) -> Vec<(String, Option<String>)> {
        let mut dirs = vec![("/messages".to_string(), None)];
        for name in self.spec.runnables.keys() {
            dirs.push((format!("/runnables/{name}/messages"), Some(name.clone())));
        }
        dirs
    }

    pub async fn run(self: Arc<Self>, mut shutdown_rx: watch::Receiver<bool>) {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let dirs = self.message_dirs();
        for (dir, implied_runnable) in &dirs {
            if let Err(err) = self.metadata.ensure(dir, b"").await {
                error!(dir = %dir, "failed to create message node: {err:#}");
            }
            // Install the (self-re-arming) child watch once per directory.
            if let Err(err) = self.metadata.get_children(dir, Some(tx.clone())).await {
                error!(dir = %dir, "failed to watch message node: {err:#}");
            }
            self.sweep(dir, implied_runnable.as_deref()).await;
        }

        loop {
            tokio::select! {
                event = rx.recv() => {
                    let Some(event) = event else { break };
                    let implied = dirs
                        .iter()
                        .find(|(dir, _)| dir == &event.path)
                        .and_then(|(_, implied)| implied.clone());
                    self.sweep(&event.path, implied.as_deref()).await;
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        debug!("message bus shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Processes every unseen message under `dir` in sequence order.
    async fn sweep(&self, dir: &str, implied_runnable: Option<&str>) {
        let mut children = match self.metadata.get_children(dir, None).await {
            Ok(children) => children,
            Err(err) => {
                warn!(dir = %dir, "failed to list messages: {err:#}");
                return;
            }
        };
        children.sort();
        for child in children {
            let node_path = format!("{dir}/{child}");
            if !self.processed.lock().unwrap().insert(node_path.clone()) {
                continue;
            }
            if let Err(err) = self.consume(&node_path, implied_runnable).await {
                warn!(path = %node_path, "failed to process message: {err:#}");
            }
        }
    }

    async fn consume(&self, node_path: &str, implied_runnable: Option<&str>) -> Result<()> {
        let Some(data) = self.metadata.get_data(node_path, None).await? else {
            return Ok(());
        };
        match serde_json::from_slice::<Message>(&data) {
            Ok(mut message) => {
                if message.runnable_name.is_none() {
                    message.runnable_name = implied_runnable.map(str::to_string);
                }
                debug!(path = %node_path, command = %message.command.command, "message received");
                self.dispatch(message).await;
            }
            Err(err) => {
                warn!(path = %node_path, "ignoring malformed message: {err}");
            }
        }
        // Acknowledge by deleting the request node, in every case, so the
        // originator never sees an infinite redelivery.
        self.metadata.delete(node_path).await
    }

    /// Dispatches one message and waits for its completion.
    async fn dispatch(&self, message: Message) {
        let (completion, done) = MessageCompletion::new();

        if self.handle_stop_application(&message) {
            completion.done();
            let _ = done.await;
            return;
        }
        if self.handle_secure_store_updated(&message) {
            self.registry.send_to_all(message, completion).await;
            let _ = done.await;
            return;
        }
        match self.classify_set_instances(&message) {
            SetInstances::Unchanged => {
                completion.done();
                let _ = done.await;
                return;
            }
            SetInstances::Change { old_count, new_count } => {
                let runnable_name = message.runnable_name.clone().unwrap_or_default();
                let submitted = self.worker.submit(InstanceChangeRequest {
                    message,
                    runnable_name,
                    old_count,
                    new_count,
                    completion,
                });
                if let Err(err) = submitted {
                    // Shutdown path: the completion inside the request was
                    // dropped, which releases the waiter below.
                    warn!("instance change discarded: {err:#}");
                }
                let _ = done.await;
                return;
            }
            SetInstances::NotApplicable => {}
        }

        match message.scope {
            MessageScope::AllRunnable => {
                self.registry.send_to_all(message, completion).await;
            }
            MessageScope::Runnable => {
                let runnable_name = message.runnable_name.clone().unwrap_or_default();
                self.registry
                    .send_to_runnable(&runnable_name, message, completion)
                    .await;
            }
            _ => {
                info!(command = %message.command.command, "message ignored");
                completion.done();
            }
        }
        let _ = done.await;
    }

    fn handle_stop_application(&self, message: &Message) -> bool {
        if message.message_type != MessageType::System ||
            message.scope != MessageScope::Application ||
            message.command.command != system_messages::STOP_COMMAND
        {
            return false;
        }
        info!("stop requested through the metadata store");
        let _ = self.shutdown_tx.send(true);
        true
    }

    fn handle_secure_store_updated(&self, message: &Message) -> bool {
        if message.message_type != MessageType::System ||
            message.scope != MessageScope::Application ||
            message.command.command != system_messages::SECURE_STORE_UPDATED_COMMAND
        {
            return false;
        }
        info!("secure store updated, invalidating credentials cache");
        self.credentials.invalidate();
        true
    }

    fn classify_set_instances(&self, message: &Message) -> SetInstances {
        if message.message_type != MessageType::System ||
            message.scope != MessageScope::Runnable ||
            message.command.command != system_messages::INSTANCES_COMMAND
        {
            return SetInstances::NotApplicable;
        }
        let Some(count) = message.command.options.get("count") else {
            return SetInstances::NotApplicable;
        };
        let Ok(new_count) = count.parse::<u32>() else {
            warn!(count = %count, "invalid instance count in message");
            return SetInstances::NotApplicable;
        };
        let Some(runnable_name) = message.runnable_name.as_deref() else {
            return SetInstances::NotApplicable;
        };
        if !self.spec.runnables.contains_key(runnable_name) {
            info!(runnable = %runnable_name, "unknown runnable");
            return SetInstances::NotApplicable;
        }

        let old_count = self.expected.expected(runnable_name);
        info!(
            runnable = %runnable_name,
            old_count,
            new_count,
            "received change instances request"
        );
        if new_count == old_count {
            SetInstances::Unchanged
        } else {
            SetInstances::Change { old_count, new_count }
        }
    }
}

enum SetInstances {
    NotApplicable,
    Unchanged,
    Change { old_count: u32, new_count: u32 },
}
