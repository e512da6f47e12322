use std::{
    collections::{BTreeSet, HashMap},
    sync::{Arc, Mutex},
    time::Duration,
};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use tokio::task::JoinHandle;
use tracing::subscriber;
use tracing_subscriber::{layer::SubscriberExt, Layer};

use crate::{
    cluster::standalone::{StandaloneLauncherFactory, StandaloneResourceManager},
    config::AmConfig,
    data_model::{
        AppSpec, AppSpecBuilder, Message, Order, OrderType, ResourceSpec, RuntimeSpecBuilder,
    },
    events::{EventHandler, TimeoutAction, TimeoutEvent},
    metadata::{memory::MemoryDriver, CreateMode},
    provisioner::LoopExit,
    service::{AmEnvironment, Service, ServiceDeps, StartupFiles},
};

pub fn init_tracing() {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("trace"));
    let _ = subscriber::set_global_default(
        tracing_subscriber::registry().with(tracing_subscriber::fmt::layer().with_filter(env_filter)),
    );
}

pub struct SpecRunnable {
    pub name: &'static str,
    pub instances: u32,
    pub vcores: u32,
    pub memory_mb: u32,
}

impl SpecRunnable {
    pub fn new(name: &'static str, instances: u32, vcores: u32, memory_mb: u32) -> Self {
        SpecRunnable {
            name,
            instances,
            vcores,
            memory_mb,
        }
    }
}

pub fn spec_with(runnables: Vec<SpecRunnable>) -> AppSpec {
    let runnables: HashMap<_, _> = runnables
        .into_iter()
        .map(|r| {
            (
                r.name.to_string(),
                RuntimeSpecBuilder::default()
                    .name(r.name)
                    .resource(ResourceSpec {
                        vcores: r.vcores,
                        memory_mb: r.memory_mb,
                        instances: r.instances,
                    })
                    .build()
                    .unwrap(),
            )
        })
        .collect();
    AppSpecBuilder::default()
        .name("test-app")
        .runnables(runnables)
        .build()
        .unwrap()
}

pub fn spec_with_orders(runnables: Vec<SpecRunnable>, orders: Vec<Vec<&str>>) -> AppSpec {
    let mut spec = spec_with(runnables);
    spec.orders = orders
        .into_iter()
        .map(|names| Order {
            names: names.into_iter().map(str::to_string).collect::<BTreeSet<_>>(),
            order_type: OrderType::Started,
        })
        .collect();
    spec
}

pub fn echo_spec(instances: u32) -> AppSpec {
    spec_with(vec![SpecRunnable::new("echo", instances, 1, 1024)])
}

pub fn test_environment(app_dir: &str) -> AmEnvironment {
    let run_id = crate::data_model::RunId::generate();
    AmEnvironment {
        app_dir: app_dir.to_string(),
        fs_user: "weave".to_string(),
        zk_connect: "memory:local".to_string(),
        kafka_zk_connect: format!("memory:local/{run_id}/kafka"),
        reserved_memory_mb: 200,
        yarn_app_id: 1,
        yarn_app_cluster_time: 1364543201964,
        am_resources: crate::data_model::RunResources {
            instance_id: 0,
            container_id: "container_am_000001".to_string(),
            vcores: 1,
            memory_mb: 512,
            host: "localhost".to_string(),
        },
        run_id,
    }
}

/// Event handler recording every timeout invocation and answering with a
/// configurable action.
pub struct RecordingEventHandler {
    action: Mutex<TimeoutAction>,
    calls: Mutex<Vec<Vec<TimeoutEvent>>>,
}

impl RecordingEventHandler {
    pub fn new(action: TimeoutAction) -> Self {
        RecordingEventHandler {
            action: Mutex::new(action),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> Vec<Vec<TimeoutEvent>> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl EventHandler for RecordingEventHandler {
    async fn launch_timeout(&self, events: Vec<TimeoutEvent>) -> Result<TimeoutAction> {
        self.calls.lock().unwrap().push(events);
        Ok(*self.action.lock().unwrap())
    }
}

#[derive(Default)]
pub struct TestOptions {
    pub event_handler: Option<Arc<dyn EventHandler>>,
    pub pause_grants: bool,
    pub config: Option<AmConfig>,
}

/// A fully started application master on in-process backends, with its
/// provisioning loop running in a spawned task.
pub struct TestService {
    pub service: Service,
    pub rm: Arc<StandaloneResourceManager>,
    pub factory: Arc<StandaloneLauncherFactory>,
    pub driver: Arc<MemoryDriver>,
    loop_task: Mutex<Option<JoinHandle<LoopExit>>>,
    _temp_dir: tempfile::TempDir,
}

impl TestService {
    pub async fn start(spec: AppSpec) -> Result<TestService> {
        Self::start_with(spec, TestOptions::default()).await
    }

    pub async fn start_with(spec: AppSpec, options: TestOptions) -> Result<TestService> {
        init_tracing();

        let temp_dir = tempfile::tempdir()?;
        let staging = temp_dir.path().join("staging");
        std::fs::create_dir_all(&staging)?;
        let environment = test_environment(&format!("file://{}", staging.display()));

        let config = options.config.unwrap_or_else(|| AmConfig {
            tracker_listen_addr: "127.0.0.1:0".to_string(),
            ..Default::default()
        });

        let driver = Arc::new(MemoryDriver::new());
        let rm = Arc::new(StandaloneResourceManager::new(config.standalone_capacity));
        if options.pause_grants {
            rm.pause_grants();
        }
        let factory = Arc::new(StandaloneLauncherFactory::default());

        let service = Service::new(
            config,
            environment,
            spec,
            StartupFiles::default(),
            ServiceDeps {
                driver: driver.clone(),
                rm: rm.clone(),
                launcher_factory: factory.clone(),
                event_handler: options.event_handler,
            },
        )?;
        service.start().await?;

        let loop_task = tokio::spawn({
            let service = service.clone();
            async move { service.run_until_stopped().await }
        });

        Ok(TestService {
            service,
            rm,
            factory,
            driver,
            loop_task: Mutex::new(Some(loop_task)),
            _temp_dir: temp_dir,
        })
    }

    /// Posts a control message the way an external controller would.
    pub async fn post_message(&self, message: &Message) -> Result<()> {
        let data = serde_json::to_vec(message)?;
        self.service.metadata_app.ensure("/messages", b"").await?;
        self.service
            .metadata_app
            .create("/messages/msg", &data, CreateMode::PersistentSequential)
            .await?;
        Ok(())
    }

    pub async fn wait_for_count(
        &self,
        runnable_name: &str,
        count: u32,
        timeout_secs: u64,
    ) -> Result<()> {
        tokio::time::timeout(
            Duration::from_secs(timeout_secs),
            self.service.registry.wait_for_count(runnable_name, count),
        )
        .await
        .map_err(|_| anyhow!("timed out waiting for {count} instances of {runnable_name}"))
    }

    /// Waits until the loop has exited and shutdown has completed.
    pub async fn join(&self) -> Result<LoopExit> {
        let handle = self
            .loop_task
            .lock()
            .unwrap()
            .take()
            .context("provisioning loop already joined")?;
        Ok(handle.await?)
    }

    pub async fn shutdown_and_join(&self) -> Result<LoopExit> {
        self.service.trigger_shutdown();
        self.join().await
    }
}

/// Polls a condition under the (possibly paused) tokio clock.
pub async fn wait_until<F: Fn() -> bool>(what: &str, timeout_secs: u64, condition: F) -> Result<()> {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(timeout_secs);
    while !condition() {
        if tokio::time::Instant::now() >= deadline {
            return Err(anyhow!("timed out waiting for {what}"));
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    Ok(())
}
