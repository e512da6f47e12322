use std::{
    collections::{HashSet, VecDeque},
    net::SocketAddr,
    sync::{Arc, Mutex},
};

use anyhow::{bail, Result};
use async_trait::async_trait;
use tracing::{debug, info};

use super::{
    AllocateHandler, ContainerInfo, ContainerState, ContainerStatus, FinalStatus, LaunchContext,
    ProcessLauncher, RequestId, ResourceManagerClient,
};
use crate::{
    controller::{ContainerController, LauncherFactory, RunnableLauncher},
    data_model::{Capability, Message, RunId},
    env_keys,
};

/// Resource manager that grants simulated containers out of a fixed-size
/// pool. This is what the binary runs against when no real cluster is
/// wired in, and what the test harness drives; the hooks (`pause_grants`,
/// `inject_completion`, `fail_next_launch`) exist for both.
pub struct StandaloneResourceManager {
    state: Arc<Mutex<State>>,
}

struct State {
    auto_grant: bool,
    capacity: u32,
    live: HashSet<String>,
    pending: VecDeque<Pending>,
    completions: VecDeque<ContainerStatus>,
    /// One entry per requested container, in request order.
    requested: Vec<Capability>,
    fail_launches: HashSet<String>,
    next_container: u64,
    next_request: u64,
    tracker_url: Option<String>,
}

struct Pending {
    id: RequestId,
    capability: Capability,
    remaining: u32,
}

impl StandaloneResourceManager {
    pub fn new(capacity: u32) -> Self {
        StandaloneResourceManager {
            state: Arc::new(Mutex::new(State {
                auto_grant: true,
                capacity,
                live: HashSet::new(),
                pending: VecDeque::new(),
                completions: VecDeque::new(),
                requested: Vec::new(),
                fail_launches: HashSet::new(),
                next_container: 1,
                next_request: 1,
                tracker_url: None,
            })),
        }
    }

    /// Stops granting containers until `resume_grants`.
    pub fn pause_grants(&self) {
        self.state.lock().unwrap().auto_grant = false;
    }

    pub fn resume_grants(&self) {
        self.state.lock().unwrap().auto_grant = true;
    }

    /// Reports a live container as completed with the given exit status, as
    /// the cluster would after a crash. Returns false if the container is
    /// not live.
    pub fn inject_completion(&self, container_id: &str, exit_status: i32) -> bool {
        let mut state = self.state.lock().unwrap();
        if !state.live.remove(container_id) {
            return false;
        }
        state.completions.push_back(ContainerStatus {
            container_id: container_id.to_string(),
            state: ContainerState::Complete,
            exit_status,
            diagnostics: "injected completion".to_string(),
        });
        true
    }

    /// Makes the next launch of the given runnable fail.
    pub fn fail_next_launch(&self, runnable_name: &str) {
        self.state
            .lock()
            .unwrap()
            .fail_launches
            .insert(runnable_name.to_string());
    }

    /// Every container requested so far, one capability entry per container.
    pub fn requested(&self) -> Vec<Capability> {
        self.state.lock().unwrap().requested.clone()
    }

    pub fn live_count(&self) -> usize {
        self.state.lock().unwrap().live.len()
    }

    pub fn tracker_url(&self) -> Option<String> {
        self.state.lock().unwrap().tracker_url.clone()
    }
}

#[async_trait]
impl ResourceManagerClient for StandaloneResourceManager {
    async fn start(&self) -> Result<()> {
        info!("standalone resource manager registered");
        Ok(())
    }

    async fn stop(&self, final_status: FinalStatus) -> Result<()> {
        info!(
            final_status = final_status.as_ref(),
            "standalone resource manager deregistered"
        );
        Ok(())
    }

    async fn set_tracker(&self, bind_address: SocketAddr, url: &str) -> Result<()> {
        debug!(%bind_address, url, "tracker registered");
        self.state.lock().unwrap().tracker_url = Some(url.to_string());
        Ok(())
    }

    async fn add_container_request(
        &self,
        capability: Capability,
        count: u32,
    ) -> Result<RequestId> {
        let mut state = self.state.lock().unwrap();
        let id = RequestId(format!("req-{}", state.next_request));
        state.next_request += 1;
        state.pending.push_back(Pending {
            id: id.clone(),
            capability,
            remaining: count,
        });
        for _ in 0..count {
            state.requested.push(capability);
        }
        Ok(id)
    }

    async fn complete_container_request(&self, request_id: &RequestId) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.pending.retain(|p| &p.id != request_id);
        Ok(())
    }

    async fn allocate(&self, _progress: f32, handler: &mut dyn AllocateHandler) -> Result<()> {
        let (grants, completed) = {
            let mut state = self.state.lock().unwrap();
            let mut grants: Vec<Arc<dyn ProcessLauncher>> = Vec::new();
            while state.auto_grant && (state.live.len() as u32) < state.capacity {
                let Some(front) = state.pending.front_mut() else {
                    break;
                };
                let capability = front.capability;
                front.remaining -= 1;
                if front.remaining == 0 {
                    state.pending.pop_front();
                }
                let id = format!("container_{:06}", state.next_container);
                state.next_container += 1;
                state.live.insert(id.clone());
                grants.push(Arc::new(StandaloneProcessLauncher {
                    info: ContainerInfo {
                        id,
                        host: "localhost".to_string(),
                        vcores: capability.vcores,
                        memory_mb: capability.memory_mb,
                    },
                    state: self.state.clone(),
                }));
            }
            let completed: Vec<ContainerStatus> = state.completions.drain(..).collect();
            (grants, completed)
        };
        if !grants.is_empty() {
            handler.acquired(grants).await;
        }
        if !completed.is_empty() {
            handler.completed(completed).await;
        }
        Ok(())
    }
}

struct StandaloneProcessLauncher {
    info: ContainerInfo,
    state: Arc<Mutex<State>>,
}

#[async_trait]
impl ProcessLauncher for StandaloneProcessLauncher {
    fn container_info(&self) -> ContainerInfo {
        self.info.clone()
    }

    async fn launch(&self, run_id: &RunId, instance_id: u32, ctx: &LaunchContext) -> Result<()> {
        let runnable = ctx
            .environment
            .get(env_keys::WEAVE_RUNNABLE_NAME)
            .cloned()
            .unwrap_or_default();
        let failed = {
            let mut state = self.state.lock().unwrap();
            if state.fail_launches.remove(&runnable) {
                state.live.remove(&self.info.id);
                state.completions.push_back(ContainerStatus {
                    container_id: self.info.id.clone(),
                    state: ContainerState::Complete,
                    exit_status: 10,
                    diagnostics: "launch failed".to_string(),
                });
                true
            } else {
                false
            }
        };
        if failed {
            bail!("launch of {runnable} in {} failed", self.info.id);
        }
        debug!(
            container_id = %self.info.id,
            runnable = %runnable,
            run_id = %run_id,
            instance_id,
            local_files = ctx.local_files.len(),
            jvm_opts = %ctx.jvm_opts,
            reserved_memory_mb = ctx.reserved_memory_mb,
            credentials = ctx.credentials.is_some(),
            "standalone container launched"
        );
        Ok(())
    }

    async fn terminate(&self) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.live.remove(&self.info.id) {
            state.completions.push_back(ContainerStatus {
                container_id: self.info.id.clone(),
                state: ContainerState::Complete,
                exit_status: 143,
                diagnostics: "terminated".to_string(),
            });
        }
        Ok(())
    }
}

/// Launcher factory for standalone mode: controllers are in-memory, stops
/// terminate the simulated container.
#[derive(Default)]
pub struct StandaloneLauncherFactory {
    hooks: Arc<Mutex<Hooks>>,
}

#[derive(Default)]
struct Hooks {
    stop_log: Vec<String>,
    fail_stops: HashSet<String>,
}

impl StandaloneLauncherFactory {
    /// Runnable names in the order their containers were stopped.
    pub fn stop_log(&self) -> Vec<String> {
        self.hooks.lock().unwrap().stop_log.clone()
    }

    /// Makes every stop of the given runnable's containers fail.
    pub fn fail_stops_for(&self, runnable_name: &str) {
        self.hooks
            .lock()
            .unwrap()
            .fail_stops
            .insert(runnable_name.to_string());
    }
}

impl LauncherFactory for StandaloneLauncherFactory {
    fn runnable_launcher(
        &self,
        runnable_name: &str,
        process: Arc<dyn ProcessLauncher>,
        ctx: LaunchContext,
    ) -> Arc<dyn RunnableLauncher> {
        Arc::new(StandaloneRunnableLauncher {
            runnable_name: runnable_name.to_string(),
            process,
            ctx,
            hooks: self.hooks.clone(),
        })
    }
}

struct StandaloneRunnableLauncher {
    runnable_name: String,
    process: Arc<dyn ProcessLauncher>,
    ctx: LaunchContext,
    hooks: Arc<Mutex<Hooks>>,
}

#[async_trait]
impl RunnableLauncher for StandaloneRunnableLauncher {
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
        Ok(Arc::new(StandaloneController {
            runnable_name: self.runnable_name.clone(),
            run_id,
            process: self.process.clone(),
            hooks: self.hooks.clone(),
            completed: Mutex::new(None),
        }))
    }
}

struct StandaloneController {
    runnable_name: String,
    run_id: RunId,
    process: Arc<dyn ProcessLauncher>,
    hooks: Arc<Mutex<Hooks>>,
    completed: Mutex<Option<i32>>,
}

#[cfg(test)]
mod tests {
    use anyhow::Result;

    use super::*;

    struct CollectingHandler {
        launchers: Vec<Arc<dyn ProcessLauncher>>,
        completed: Vec<ContainerStatus>,
    }

    #[async_trait]
    impl AllocateHandler for CollectingHandler {
        async fn acquired(&mut self, launchers: Vec<Arc<dyn ProcessLauncher>>) {
            self.launchers.extend(launchers);
        }

        async fn completed(&mut self, statuses: Vec<ContainerStatus>) {
            self.completed.extend(statuses);
        }
    }

    fn handler() -> CollectingHandler {
        CollectingHandler {
            launchers: Vec::new(),
            completed: Vec::new(),
        }
    }

    fn capability() -> Capability {
        Capability {
            vcores: 1,
            memory_mb: 512,
        }
    }

    #[tokio::test]
    async fn test_grants_are_bounded_by_capacity() -> Result<()> {
        let rm = StandaloneResourceManager::new(2);
        rm.start().await?;
        rm.set_tracker("127.0.0.1:4040".parse().unwrap(), "http://am:4040/")
            .await?;
        assert_eq!(rm.tracker_url().as_deref(), Some("http://am:4040/"));

        rm.add_container_request(capability(), 3).await?;
        assert_eq!(rm.requested().len(), 3);

        let mut h = handler();
        rm.allocate(0.0, &mut h).await?;
        assert_eq!(h.launchers.len(), 2);
        assert_eq!(rm.live_count(), 2);

        // A slot frees up, the remaining request is served.
        let released = h.launchers[0].container_info().id;
        assert!(rm.inject_completion(&released, 0));
        rm.allocate(0.0, &mut h).await?;
        assert_eq!(h.launchers.len(), 3);
        assert_eq!(h.completed.len(), 1);
        assert_eq!(h.completed[0].state, ContainerState::Complete);
        assert_ne!(h.completed[0].state, ContainerState::Running);

        rm.stop(FinalStatus::Killed).await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_paused_grants_hold_requests() -> Result<()> {
        let rm = StandaloneResourceManager::new(10);
        rm.pause_grants();
        rm.add_container_request(capability(), 1).await?;

        let mut h = handler();
        rm.allocate(0.0, &mut h).await?;
        assert!(h.launchers.is_empty());

        rm.resume_grants();
        rm.allocate(0.0, &mut h).await?;
        assert_eq!(h.launchers.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_completion_only_injectable_for_live_containers() -> Result<()> {
        let rm = StandaloneResourceManager::new(1);
        assert!(!rm.inject_completion("container_000042", 1));
        Ok(())
    }
}

#[async_trait]
impl ContainerController for StandaloneController {
    fn run_id(&self) -> &RunId {
        &self.run_id
    }

    async fn send_message(&self, message: &Message) -> Result<()> {
        debug!(
            runnable = %self.runnable_name,
            run_id = %self.run_id,
            command = %message.command.command,
            "message delivered to standalone container"
        );
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        if self.completed.lock().unwrap().is_some() {
            return Ok(());
        }
        let fail = {
            let mut hooks = self.hooks.lock().unwrap();
            hooks.stop_log.push(self.runnable_name.clone());
            hooks.fail_stops.contains(&self.runnable_name)
        };
        if fail {
            bail!("injected stop failure for {}", self.runnable_name);
        }
        self.process.terminate().await
    }

    fn completed(&self, exit_status: i32) {
        *self.completed.lock().unwrap() = Some(exit_status);
    }

    async fn kill(&self) -> Result<()> {
        self.process.terminate().await
    }
}
