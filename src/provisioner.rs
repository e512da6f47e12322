use std::{
    collections::{BTreeMap, HashMap, VecDeque},
    sync::Arc,
    time::Duration,
};

use anyhow::Result;
use async_trait::async_trait;
use tokio::{
    sync::{watch, Mutex},
    time::Instant,
};
use tracing::{debug, error, info, warn};

use crate::{
    cluster::{
        AllocateHandler, ContainerStatus, LaunchContext, ProcessLauncher, RequestId,
        ResourceManagerClient,
    },
    controller::LauncherFactory,
    credentials::CredentialsCache,
    data_model::{AppSpec, Capability, Order, OrderType, RuntimeSpec},
    events::{EventHandler, TimeoutAction, TimeoutEvent},
    expected::ExpectedContainers,
    registry::ContainerRegistry,
};

/// Container requests of one startup order, grouped by resource capability
/// so that runnables with identical capabilities are filled from a single
/// set of acquisitions. Groups are drawn in capability order.
pub struct RunnableContainerRequest {
    order_type: OrderType,
    groups: VecDeque<(Capability, Vec<RuntimeSpec>)>,
}

impl RunnableContainerRequest {
    pub fn from_order(spec: &AppSpec, order: &Order) -> Self {
        let mut groups: BTreeMap<Capability, Vec<RuntimeSpec>> = BTreeMap::new();
        for name in &order.names {
            if let Some(runtime_spec) = spec.runnables.get(name) {
                groups
                    .entry(runtime_spec.resource.capability())
                    .or_default()
                    .push(runtime_spec.clone());
            }
        }
        RunnableContainerRequest {
            order_type: order.order_type,
            groups: groups.into_iter().collect(),
        }
    }

    pub fn single(runtime_spec: RuntimeSpec, order_type: OrderType) -> Self {
        let capability = runtime_spec.resource.capability();
        RunnableContainerRequest {
            order_type,
            groups: VecDeque::from([(capability, vec![runtime_spec])]),
        }
    }

    pub fn order_type(&self) -> OrderType {
        self.order_type
    }

    /// The next capability group, or None when this order is exhausted.
    pub fn take_request(&mut self) -> Option<(Capability, Vec<RuntimeSpec>)> {
        self.groups.pop_front()
    }
}

/// The ordered queue of container requests. Written by the provisioning
/// loop and by the instance-change worker.
pub type RequestQueue = Arc<Mutex<VecDeque<RunnableContainerRequest>>>;

pub fn build_request_queue(spec: &AppSpec) -> RequestQueue {
    let requests: VecDeque<RunnableContainerRequest> = spec
        .normalized_orders()
        .iter()
        .map(|order| RunnableContainerRequest::from_order(spec, order))
        .collect();
    Arc::new(Mutex::new(requests))
}

/// An outstanding request batch: containers still expected for one runnable.
struct ProvisionRequest {
    runtime_spec: RuntimeSpec,
    request_id: RequestId,
    remaining: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::AsRefStr)]
pub enum LoopExit {
    /// Every container completed and nothing is left to request.
    Drained,
    /// A stop was requested from outside.
    Stopped,
    /// The event handler aborted the application.
    Aborted,
}

/// The 1 Hz provisioning loop: drives `allocate`, launches acquired
/// containers against the head of the provisioning queue, re-requests
/// abnormally exited containers and enforces provisioning timeouts. The
/// loop is the only mutator of the provisioning queue.
pub struct Provisioner {
    spec: Arc<AppSpec>,
    registry: Arc<ContainerRegistry>,
    expected: Arc<ExpectedContainers>,
    rm: Arc<dyn ResourceManagerClient>,
    event_handler: Arc<dyn EventHandler>,
    launcher_factory: Arc<dyn LauncherFactory>,
    credentials: Arc<CredentialsCache>,
    requests: RequestQueue,
    launch_ctx: LaunchContext,
    arguments: HashMap<String, Vec<String>>,
    allocate_interval: Duration,
    provision_timeout: Duration,
    provisioning: VecDeque<ProvisionRequest>,
    current: Option<(Capability, Vec<RuntimeSpec>)>,
}

#[allow(clippy::too_many_arguments)]
impl Provisioner {
    pub fn new(
        spec: Arc<AppSpec>,
        registry: Arc<ContainerRegistry>,
        expected: Arc<ExpectedContainers>,
        rm: Arc<dyn ResourceManagerClient>,
        event_handler: Arc<dyn EventHandler>,
        launcher_factory: Arc<dyn LauncherFactory>,
        credentials: Arc<CredentialsCache>,
        requests: RequestQueue,
        launch_ctx: LaunchContext,
        arguments: HashMap<String, Vec<String>>,
        allocate_interval: Duration,
        provision_timeout: Duration,
    ) -> Self {
        Provisioner {
            spec,
            registry,
            expected,
            rm,
            event_handler,
            launcher_factory,
            credentials,
            requests,
            launch_ctx,
            arguments,
            allocate_interval,
            provision_timeout,
            provisioning: VecDeque::new(),
            current: None,
        }
    }

    pub async fn run(&mut self, mut shutdown_rx: watch::Receiver<bool>) -> Result<LoopExit> {
        let mut next_timeout_check = Instant::now() + self.provision_timeout;
        loop {
            if *shutdown_rx.borrow() {
                return Ok(LoopExit::Stopped);
            }

            // Allocate first; it is also how cluster availability and
            // completions are observed.
            {
                let rm = self.rm.clone();
                let mut handler = LoopHandler { provisioner: self };
                rm.allocate(0.0, &mut handler).await?;
            }

            if self.provisioning.is_empty() &&
                self.current.is_none() &&
                self.requests.lock().await.is_empty() &&
                self.registry.is_empty().await
            {
                info!("all containers completed, shutting down application master");
                return Ok(LoopExit::Drained);
            }

            // Nothing in flight: draw the next capability group, dropping
            // exhausted orders along the way.
            while self.provisioning.is_empty() && self.current.is_none() {
                let mut queue = self.requests.lock().await;
                let Some(front) = queue.front_mut() else {
                    break;
                };
                match front.take_request() {
                    Some(group) => {
                        debug!(
                            order_type = front.order_type().as_ref(),
                            capability = %group.0,
                            "drawing next capability group"
                        );
                        self.current = Some(group);
                    }
                    None => {
                        queue.pop_front();
                    }
                }
            }

            if self.provisioning.is_empty() {
                if let Some((capability, runtime_specs)) = self.current.take() {
                    self.add_container_requests(capability, runtime_specs).await?;
                }
            }

            let (next, abort) = self.check_provision_timeout(next_timeout_check).await;
            next_timeout_check = next;
            if abort {
                info!("event handler aborted the application");
                return Ok(LoopExit::Aborted);
            }

            tokio::select! {
                _ = tokio::time::sleep(self.allocate_interval) => {}
                _ = shutdown_rx.changed() => {}
            }
        }
    }

    async fn add_container_requests(
        &mut self,
        capability: Capability,
        runtime_specs: Vec<RuntimeSpec>,
    ) -> Result<()> {
        for runtime_spec in runtime_specs {
            let name = runtime_spec.name.clone();
            let running = self.registry.count(&name).await;
            let desired = self.expected.expected(&name);
            let new_containers = desired.saturating_sub(running);
            if new_containers == 0 {
                continue;
            }
            info!(
                runnable = %name,
                count = new_containers,
                capability = %capability,
                "requesting containers"
            );
            let request_id = self.rm.add_container_request(capability, new_containers).await?;
            self.provisioning.push_back(ProvisionRequest {
                runtime_spec,
                request_id,
                remaining: new_containers,
            });
            self.expected.update_request_time([name.as_str()]);
        }
        Ok(())
    }

    async fn handle_acquired(&mut self, launchers: Vec<Arc<dyn ProcessLauncher>>) {
        for process in launchers {
            let container_info = process.container_info();
            let Some(front) = self.provisioning.front_mut() else {
                // Nothing outstanding: the acquisition was speculative.
                debug!(container_id = %container_info.id, "unexpected container ignored");
                continue;
            };
            let runnable_name = front.runtime_spec.name.clone();
            info!(
                container_id = %container_info.id,
                runnable = %runnable_name,
                "container acquired"
            );

            let mut ctx = self.launch_ctx.clone();
            ctx.instance_count = self.expected.expected(&runnable_name);
            ctx.credentials = self.credentials.current();
            ctx.local_files
                .extend(front.runtime_spec.local_files.iter().cloned());
            if let Some(arguments) = self.arguments.get(&runnable_name) {
                ctx.arguments = arguments.clone();
            }

            let launcher =
                self.launcher_factory
                    .runnable_launcher(&runnable_name, process.clone(), ctx);
            if let Err(err) = self
                .registry
                .start(&runnable_name, container_info, launcher.as_ref())
                .await
            {
                // The container was consumed without a running instance, as
                // if it had completed abnormally right away. Request a
                // replacement; the cluster-side completion of the dead
                // container later no-ops against the registry.
                error!(runnable = %runnable_name, "failed to launch container: {err:#}");
                let runtime_spec = front.runtime_spec.clone();
                self.requests.lock().await.push_back(RunnableContainerRequest::single(
                    runtime_spec,
                    self.spec.order_type_of(&runnable_name),
                ));
                self.expected.update_request_time([runnable_name.as_str()]);
            }

            front.remaining -= 1;
            if front.remaining == 0 {
                let request_id = front.request_id.clone();
                if let Err(err) = self.rm.complete_container_request(&request_id).await {
                    warn!(request_id = %request_id, "failed to complete request: {err:#}");
                }
                self.provisioning.pop_front();
                info!(runnable = %runnable_name, "request batch fully provisioned");
            }
        }
    }

    async fn handle_completed(&mut self, statuses: Vec<ContainerStatus>) {
        let mut restart: HashMap<String, u32> = HashMap::new();
        for status in &statuses {
            self.registry.handle_completed(status, &mut restart).await;
        }
        if restart.is_empty() {
            return;
        }

        {
            let mut queue = self.requests.lock().await;
            for (runnable_name, count) in &restart {
                let Some(runtime_spec) = self.spec.runnables.get(runnable_name) else {
                    warn!(runnable = %runnable_name, "completed container of unknown runnable");
                    continue;
                };
                info!(runnable = %runnable_name, count, "re-requesting containers");
                for _ in 0..*count {
                    queue.push_back(RunnableContainerRequest::single(
                        runtime_spec.clone(),
                        self.spec.order_type_of(runnable_name),
                    ));
                }
            }
        }
        // Measure the timeout window from the re-request.
        self.expected
            .update_request_time(restart.keys().map(String::as_str));
    }

    /// Returns the instant of the next check, and whether the event handler
    /// asked to abort.
    async fn check_provision_timeout(&mut self, next_timeout_check: Instant) -> (Instant, bool) {
        if Instant::now() < next_timeout_check {
            return (next_timeout_check, false);
        }

        let expected = self.expected.snapshot();
        let running = self.registry.count_all().await;
        let events: Vec<TimeoutEvent> = expected
            .iter()
            .filter_map(|(name, expected_count)| {
                let actual = running.get(name).copied().unwrap_or(0);
                (expected_count.count != actual).then(|| TimeoutEvent {
                    runnable_name: name.clone(),
                    expected: expected_count.count,
                    actual,
                    requested_at_ms: expected_count.requested_at_ms,
                })
            })
            .collect();

        if !events.is_empty() {
            match self.event_handler.launch_timeout(events).await {
                Ok(TimeoutAction::Abort) => return (next_timeout_check, true),
                Ok(TimeoutAction::Postpone(delay)) => return (next_timeout_check + delay, false),
                Err(err) => {
                    warn!("event handler failed, retrying at the default interval: {err:#}");
                }
            }
        }
        (next_timeout_check + self.provision_timeout, false)
    }
}

struct LoopHandler<'a> {
    provisioner: &'a mut Provisioner,
}

#[async_trait]
impl AllocateHandler for LoopHandler<'_> {
    async fn acquired(&mut self, launchers: Vec<Arc<dyn ProcessLauncher>>) {
        self.provisioner.handle_acquired(launchers).await;
    }

    async fn completed(&mut self, statuses: Vec<ContainerStatus>) {
        self.provisioner.handle_completed(statuses).await;
    }
}
