use std::collections::{BTreeSet, HashMap, HashSet};

use anyhow::{bail, Result};
use std::sync::Arc;
use tokio::sync::{oneshot, Mutex, Notify};
use tracing::{debug, error, info, warn};

use crate::{
    cluster::{ContainerInfo, ContainerStatus},
    controller::{ContainerController, RunnableLauncher},
    data_model::{Message, ResourceReport, RunId, RunResources},
};

/// Fires exactly once when a message has been offered to every targeted
/// container, successfully or not. Dropping it unblocks the waiter too.
pub struct MessageCompletion(Option<oneshot::Sender<()>>);

impl MessageCompletion {
    pub fn new() -> (MessageCompletion, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        (MessageCompletion(Some(tx)), rx)
    }

    pub fn done(mut self) {
        if let Some(tx) = self.0.take() {
            let _ = tx.send(());
        }
    }
}

/// Instance-id slots of one runnable. Ids are assigned lowest-free-first
/// and reused after release, so the live set is always a prefix-dense
/// bitmap whose cardinality equals the running count.
#[derive(Default)]
struct InstanceSlots(BTreeSet<u32>);

impl InstanceSlots {
    fn acquire_lowest(&mut self) -> u32 {
        let mut id = 0;
        while self.0.contains(&id) {
            id += 1;
        }
        self.0.insert(id);
        id
    }

    fn release(&mut self, id: u32) {
        self.0.remove(&id);
    }

    fn cardinality(&self) -> u32 {
        self.0.len() as u32
    }

    fn max(&self) -> Option<u32> {
        self.0.iter().next_back().copied()
    }

    fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[derive(Default)]
struct RegistryInner {
    /// runnable name -> container id -> controller.
    containers: HashMap<String, HashMap<String, Arc<dyn ContainerController>>>,
    /// runnable name -> container id -> resources, mirrors `containers`.
    resources: HashMap<String, HashMap<String, RunResources>>,
    instances: HashMap<String, InstanceSlots>,
    /// Runnable names in first-start order; stop walks this in reverse.
    start_sequence: Vec<String>,
}

impl RegistryInner {
    fn running(&self, runnable_name: &str) -> u32 {
        self.instances
            .get(runnable_name)
            .map(|s| s.cardinality())
            .unwrap_or(0)
    }

    /// The base id shared by live instances of a runnable; rotated to a
    /// fresh one when no instance is running.
    fn base_run_id(&self, runnable_name: &str) -> RunId {
        self.containers
            .get(runnable_name)
            .and_then(|row| row.values().next())
            .map(|controller| controller.run_id().base())
            .unwrap_or_else(RunId::generate)
    }

    fn release_instance(&mut self, runnable_name: &str, instance_id: u32) {
        if let Some(slots) = self.instances.get_mut(runnable_name) {
            slots.release(instance_id);
            if slots.is_empty() {
                self.instances.remove(runnable_name);
            }
        }
    }

    fn remove_container(&mut self, runnable_name: &str, container_id: &str) {
        if let Some(row) = self.containers.get_mut(runnable_name) {
            row.remove(container_id);
            if row.is_empty() {
                self.containers.remove(runnable_name);
            }
        }
        if let Some(row) = self.resources.get_mut(runnable_name) {
            row.remove(container_id);
            if row.is_empty() {
                self.resources.remove(runnable_name);
            }
        }
    }
}

/// The in-memory source of truth for live containers. One lock guards all
/// state; one notification is signalled on every container add or remove,
/// and `wait_for_count` rechecks after every wakeup.
pub struct ContainerRegistry {
    app_id: String,
    app_master_resources: RunResources,
    inner: Mutex<RegistryInner>,
    container_change: Notify,
}

impl ContainerRegistry {
    pub fn new(app_id: impl Into<String>, app_master_resources: RunResources) -> Self {
        ContainerRegistry {
            app_id: app_id.into(),
            app_master_resources,
            inner: Mutex::new(RegistryInner::default()),
            container_change: Notify::new(),
        }
    }

    pub fn app_id(&self) -> &str {
        &self.app_id
    }

    /// Assigns the lowest free instance id, derives the instance run id and
    /// starts the runnable in the given container.
    pub async fn start(
        &self,
        runnable_name: &str,
        container_info: ContainerInfo,
        launcher: &dyn RunnableLauncher,
    ) -> Result<RunId> {
        let mut inner = self.inner.lock().await;
        let base = inner.base_run_id(runnable_name);
        let instance_id = inner
            .instances
            .entry(runnable_name.to_string())
            .or_default()
            .acquire_lowest();
        let run_id = base.derive(instance_id);

        info!(
            runnable = %runnable_name,
            container_id = %container_info.id,
            run_id = %run_id,
            instance_id,
            "starting runnable"
        );
        let controller = match launcher.start(run_id.clone(), instance_id).await {
            Ok(controller) => controller,
            Err(err) => {
                inner.release_instance(runnable_name, instance_id);
                return Err(err);
            }
        };

        inner
            .containers
            .entry(runnable_name.to_string())
            .or_default()
            .insert(container_info.id.clone(), controller);
        inner
            .resources
            .entry(runnable_name.to_string())
            .or_default()
            .insert(
                container_info.id.clone(),
                RunResources {
                    instance_id,
                    container_id: container_info.id,
                    vcores: container_info.vcores,
                    memory_mb: container_info.memory_mb,
                    host: container_info.host,
                },
            );
        if inner.start_sequence.last().map(String::as_str) != Some(runnable_name) {
            inner.start_sequence.push(runnable_name.to_string());
        }
        self.container_change.notify_waiters();
        Ok(run_id)
    }

    /// Stops and removes the running container with the highest instance id
    /// of the given runnable.
    pub async fn remove_last(&self, runnable_name: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let Some(max_instance_id) = inner.instances.get(runnable_name).and_then(|s| s.max())
        else {
            warn!(runnable = %runnable_name, "no running container to remove");
            return Ok(());
        };

        let found = inner.containers.get(runnable_name).and_then(|row| {
            row.iter()
                .find(|(_, controller)| controller.run_id().instance_id() == Some(max_instance_id))
                .map(|(container_id, controller)| (container_id.clone(), controller.clone()))
        });
        let Some((container_id, controller)) = found else {
            bail!("no container found for {runnable_name} with instance id {max_instance_id}");
        };

        info!(
            runnable = %runnable_name,
            run_id = %controller.run_id(),
            "stopping instance"
        );
        if let Err(err) = controller.stop().await {
            error!(
                runnable = %runnable_name,
                run_id = %controller.run_id(),
                "error stopping instance: {err:#}"
            );
        }
        inner.remove_container(runnable_name, &container_id);
        inner.release_instance(runnable_name, max_instance_id);
        self.container_change.notify_waiters();
        Ok(())
    }

    /// Blocks until the running count of the runnable equals `count`.
    pub async fn wait_for_count(&self, runnable_name: &str, count: u32) {
        loop {
            let mut notified = std::pin::pin!(self.container_change.notified());
            notified.as_mut().enable();
            {
                let inner = self.inner.lock().await;
                if inner.running(runnable_name) == count {
                    return;
                }
            }
            notified.await;
        }
    }

    pub async fn count(&self, runnable_name: &str) -> u32 {
        self.inner.lock().await.running(runnable_name)
    }

    pub async fn count_all(&self) -> HashMap<String, u32> {
        let inner = self.inner.lock().await;
        inner
            .instances
            .iter()
            .map(|(name, slots)| (name.clone(), slots.cardinality()))
            .collect()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.lock().await.instances.is_empty()
    }

    pub async fn container_ids(&self) -> HashSet<String> {
        let inner = self.inner.lock().await;
        inner
            .containers
            .values()
            .flat_map(|row| row.keys().cloned())
            .collect()
    }

    pub async fn send_to_all(&self, message: Message, completion: MessageCompletion) {
        let targets: Vec<(String, Arc<dyn ContainerController>)> = {
            let inner = self.inner.lock().await;
            inner
                .containers
                .iter()
                .flat_map(|(name, row)| {
                    row.values()
                        .map(|controller| (name.clone(), controller.clone()))
                })
                .collect()
        };
        Self::send_to_targets(targets, message, completion);
    }

    pub async fn send_to_runnable(
        &self,
        runnable_name: &str,
        message: Message,
        completion: MessageCompletion,
    ) {
        let targets: Vec<(String, Arc<dyn ContainerController>)> = {
            let inner = self.inner.lock().await;
            inner
                .containers
                .get(runnable_name)
                .into_iter()
                .flat_map(|row| row.values())
                .map(|controller| (runnable_name.to_string(), controller.clone()))
                .collect()
        };
        Self::send_to_targets(targets, message, completion);
    }

    /// Sends asynchronously to every target; failures are logged and the
    /// completion fires once all send attempts have terminated.
    fn send_to_targets(
        targets: Vec<(String, Arc<dyn ContainerController>)>,
        message: Message,
        completion: MessageCompletion,
    ) {
        if targets.is_empty() {
            completion.done();
            return;
        }
        let message = Arc::new(message);
        tokio::spawn(async move {
            let sends = targets.into_iter().map(|(runnable_name, controller)| {
                let message = message.clone();
                async move {
                    if let Err(err) = controller.send_message(&message).await {
                        error!(
                            runnable = %runnable_name,
                            run_id = %controller.run_id(),
                            command = %message.command.command,
                            "failed to send message: {err:#}"
                        );
                    }
                }
            });
            futures::future::join_all(sends).await;
            completion.done();
        });
    }

    /// Stops everything, in reverse start order. Within a runnable the
    /// containers stop in parallel; a failed stop does not abort the
    /// sequence. Clears all state at the end.
    pub async fn stop_all(&self) {
        let mut inner = self.inner.lock().await;
        let sequence: Vec<String> = inner.start_sequence.iter().rev().cloned().collect();
        for runnable_name in sequence {
            info!(runnable = %runnable_name, "stopping all instances");
            let controllers: Vec<Arc<dyn ContainerController>> = inner
                .containers
                .get(&runnable_name)
                .into_iter()
                .flat_map(|row| row.values().cloned())
                .collect();
            let stops = controllers.iter().map(|controller| {
                let runnable_name = runnable_name.clone();
                async move {
                    if let Err(err) = controller.stop().await {
                        error!(
                            runnable = %runnable_name,
                            run_id = %controller.run_id(),
                            "error stopping instance: {err:#}"
                        );
                    }
                }
            });
            futures::future::join_all(stops).await;
            info!(runnable = %runnable_name, "terminated all instances");
        }
        *inner = RegistryInner::default();
        self.container_change.notify_waiters();
    }

    /// Handles a completion reported by the cluster. No-ops when the
    /// container is no longer registered (it was removed intentionally).
    /// Abnormal exits add the runnable to `restart`.
    pub async fn handle_completed(
        &self,
        status: &ContainerStatus,
        restart: &mut HashMap<String, u32>,
    ) {
        let mut inner = self.inner.lock().await;
        let found = inner
            .containers
            .iter()
            .find(|(_, row)| row.contains_key(&status.container_id))
            .map(|(name, row)| (name.clone(), row[&status.container_id].clone()));
        let Some((runnable_name, controller)) = found else {
            debug!(
                container_id = %status.container_id,
                "completion for unregistered container ignored"
            );
            return;
        };

        if status.exit_status != 0 {
            warn!(
                container_id = %status.container_id,
                state = status.state.as_ref(),
                exit_status = status.exit_status,
                diagnostics = %status.diagnostics,
                "container exited abnormally, re-requesting"
            );
            *restart.entry(runnable_name.clone()).or_default() += 1;
        } else {
            info!(
                container_id = %status.container_id,
                state = status.state.as_ref(),
                "container exited normally"
            );
        }

        controller.completed(status.exit_status);
        if let Some(instance_id) = controller.run_id().instance_id() {
            inner.release_instance(&runnable_name, instance_id);
        }
        inner.remove_container(&runnable_name, &status.container_id);
        self.container_change.notify_waiters();
    }

    pub async fn resource_report(&self) -> ResourceReport {
        let inner = self.inner.lock().await;
        ResourceReport {
            app_id: self.app_id.clone(),
            app_master_resources: self.app_master_resources.clone(),
            resources: inner
                .resources
                .iter()
                .map(|(name, row)| (name.clone(), row.values().cloned().collect()))
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;

    use async_trait::async_trait;

    use super::*;
    use crate::cluster::ContainerState;

    struct StubLauncher {
        runnable_name: String,
        stop_log: Arc<StdMutex<Vec<String>>>,
        fail_stop: bool,
    }

    impl StubLauncher {
        fn new(runnable_name: &str, stop_log: Arc<StdMutex<Vec<String>>>) -> Self {
            StubLauncher {
                runnable_name: runnable_name.to_string(),
                stop_log,
                fail_stop: false,
            }
        }
    }

    #[async_trait]
    impl RunnableLauncher for StubLauncher {
        async fn start(
            &self,
            run_id: RunId,
            _instance_id: u32,
        ) -> Result<Arc<dyn ContainerController>> {
            Ok(Arc::new(StubController {
                runnable_name: self.runnable_name.clone(),
                run_id,
                stop_log: self.stop_log.clone(),
                fail_stop: self.fail_stop,
            }))
        }
    }

    struct StubController {
        runnable_name: String,
        run_id: RunId,
        stop_log: Arc<StdMutex<Vec<String>>>,
        fail_stop: bool,
    }

    #[async_trait]
    impl ContainerController for StubController {
        fn run_id(&self) -> &RunId {
            &self.run_id
        }

        async fn send_message(&self, _message: &Message) -> Result<()> {
            Ok(())
        }

        async fn stop(&self) -> Result<()> {
            self.stop_log.lock().unwrap().push(self.runnable_name.clone());
            if self.fail_stop {
                bail!("stub stop failure");
            }
            Ok(())
        }

        fn completed(&self, _exit_status: i32) {}

        async fn kill(&self) -> Result<()> {
            Ok(())
        }
    }

    fn registry() -> ContainerRegistry {
        ContainerRegistry::new(
            "application_1364543201964_0001",
            RunResources {
                instance_id: 0,
                container_id: "container_am".to_string(),
                vcores: 1,
                memory_mb: 512,
                host: "am-host".to_string(),
            },
        )
    }

    fn container(id: &str) -> ContainerInfo {
        ContainerInfo {
            id: id.to_string(),
            host: "worker".to_string(),
            vcores: 1,
            memory_mb: 1024,
        }
    }

    async fn start(
        registry: &ContainerRegistry,
        name: &str,
        container_id: &str,
        log: &Arc<StdMutex<Vec<String>>>,
    ) -> RunId {
        registry
            .start(name, container(container_id), &StubLauncher::new(name, log.clone()))
            .await
            .unwrap()
    }

    fn completion_of(container_id: &str, exit_status: i32) -> ContainerStatus {
        ContainerStatus {
            container_id: container_id.to_string(),
            state: ContainerState::Complete,
            exit_status,
            diagnostics: String::new(),
        }
    }

    #[tokio::test]
    async fn test_instance_ids_are_lowest_free_and_reused() -> Result<()> {
        let registry = registry();
        let log = Arc::new(StdMutex::new(Vec::new()));

        let id0 = start(&registry, "echo", "c0", &log).await;
        let id1 = start(&registry, "echo", "c1", &log).await;
        let id2 = start(&registry, "echo", "c2", &log).await;
        assert_eq!(id0.instance_id(), Some(0));
        assert_eq!(id1.instance_id(), Some(1));
        assert_eq!(id2.instance_id(), Some(2));
        assert_eq!(registry.count("echo").await, 3);

        // An abnormal completion frees the middle slot...
        let mut restart = HashMap::new();
        registry
            .handle_completed(&completion_of("c1", 1), &mut restart)
            .await;
        assert_eq!(restart["echo"], 1);
        assert_eq!(registry.count("echo").await, 2);

        // ...and the next start takes it again.
        let id_next = start(&registry, "echo", "c3", &log).await;
        assert_eq!(id_next.instance_id(), Some(1));
        assert!(id_next.instance_id().unwrap() <= 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_remove_last_stops_highest_instance() -> Result<()> {
        let registry = registry();
        let log = Arc::new(StdMutex::new(Vec::new()));
        start(&registry, "echo", "c0", &log).await;
        start(&registry, "echo", "c1", &log).await;

        registry.remove_last("echo").await?;
        assert_eq!(registry.count("echo").await, 1);
        // The remaining container holds instance 0.
        let report = registry.resource_report().await;
        assert_eq!(report.resources["echo"][0].instance_id, 0);

        // The cluster later reports the stopped container; that must no-op.
        let mut restart = HashMap::new();
        registry
            .handle_completed(&completion_of("c1", 143), &mut restart)
            .await;
        assert!(restart.is_empty());
        assert_eq!(registry.count("echo").await, 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_base_run_id_shared_while_live_and_rotated_when_empty() -> Result<()> {
        let registry = registry();
        let log = Arc::new(StdMutex::new(Vec::new()));
        let id0 = start(&registry, "echo", "c0", &log).await;
        let id1 = start(&registry, "echo", "c1", &log).await;
        assert_eq!(id0.base(), id1.base());

        let mut restart = HashMap::new();
        registry
            .handle_completed(&completion_of("c0", 0), &mut restart)
            .await;
        registry
            .handle_completed(&completion_of("c1", 0), &mut restart)
            .await;
        assert!(registry.is_empty().await);

        // No instance left: the base rotates.
        let id_new = start(&registry, "echo", "c2", &log).await;
        assert_ne!(id_new.base(), id0.base());
        Ok(())
    }

    #[tokio::test]
    async fn test_report_only_lists_registered_containers() -> Result<()> {
        let registry = registry();
        let log = Arc::new(StdMutex::new(Vec::new()));
        start(&registry, "a", "c0", &log).await;
        start(&registry, "b", "c1", &log).await;

        let ids = registry.container_ids().await;
        let report = registry.resource_report().await;
        for resources in report.resources.values() {
            for run in resources {
                assert!(ids.contains(&run.container_id));
            }
        }
        Ok(())
    }

    #[tokio::test]
    async fn test_stop_all_walks_reverse_start_order() -> Result<()> {
        let registry = registry();
        let log = Arc::new(StdMutex::new(Vec::new()));
        start(&registry, "a", "c0", &log).await;
        start(&registry, "a", "c1", &log).await;
        start(&registry, "b", "c2", &log).await;

        log.lock().unwrap().clear();
        registry.stop_all().await;

        let stops = log.lock().unwrap().clone();
        assert_eq!(stops.len(), 3);
        assert_eq!(stops[0], "b");
        assert!(stops[1..].iter().all(|name| name == "a"));
        assert!(registry.is_empty().await);
        assert!(registry.container_ids().await.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_stop_all_survives_stop_failures() -> Result<()> {
        let registry = registry();
        let log = Arc::new(StdMutex::new(Vec::new()));
        start(&registry, "a", "c0", &log).await;
        let mut failing = StubLauncher::new("b", log.clone());
        failing.fail_stop = true;
        registry.start("b", container("c1"), &failing).await?;

        registry.stop_all().await;
        let stops = log.lock().unwrap().clone();
        assert_eq!(stops, vec!["b", "a"]);
        assert!(registry.is_empty().await);
        Ok(())
    }

    #[tokio::test]
    async fn test_wait_for_count_wakes_on_change() -> Result<()> {
        let registry = Arc::new(registry());
        let log = Arc::new(StdMutex::new(Vec::new()));

        let waiter = tokio::spawn({
            let registry = registry.clone();
            async move { registry.wait_for_count("echo", 1).await }
        });
        start(&registry, "echo", "c0", &log).await;
        tokio::time::timeout(std::time::Duration::from_secs(5), waiter).await??;
        Ok(())
    }

    #[tokio::test]
    async fn test_send_to_empty_target_completes_immediately() -> Result<()> {
        let registry = registry();
        let (completion, rx) = MessageCompletion::new();
        registry
            .send_to_runnable(
                "echo",
                crate::data_model::system_messages::set_instances("echo", 1),
                completion,
            )
            .await;
        rx.await?;
        Ok(())
    }
}
