use std::{
    collections::{HashMap, HashSet},
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info, warn};

use crate::{
    broker::LogBroker,
    cluster::{
        AllocateHandler, ContainerStatus, FinalStatus, LaunchContext, ProcessLauncher,
        ResourceManagerClient,
    },
    config::AmConfig,
    constants::{files, DEFAULT_RESERVED_MEMORY_MB},
    controller::LauncherFactory,
    credentials::CredentialsCache,
    data_model::{AmLiveNodeData, AppSpec, LocalFile, RunId, RunResources},
    env_keys,
    events::{self, EventHandler, EventHandlerContext},
    expected::ExpectedContainers,
    filesystem::{LocalLocation, Location},
    instance_worker::InstanceChangeWorker,
    message_bus::MessageBus,
    metadata::{CreateMode, MetadataClient, StoreDriver},
    provisioner::{build_request_queue, LoopExit, Provisioner, RequestQueue},
    registry::ContainerRegistry,
    tracker::TrackerService,
};

/// The environment contract between the client-side launcher, the cluster
/// and this process.
#[derive(Debug, Clone)]
pub struct AmEnvironment {
    pub app_dir: String,
    pub fs_user: String,
    pub run_id: RunId,
    pub zk_connect: String,
    pub kafka_zk_connect: String,
    pub reserved_memory_mb: u32,
    pub yarn_app_id: i32,
    pub yarn_app_cluster_time: i64,
    pub am_resources: RunResources,
}

impl AmEnvironment {
    pub fn from_env() -> Result<Self> {
        let run_id = RunId::from_string(env_keys::required(env_keys::WEAVE_APP_RUN_ID)?);
        let zk_connect = env_keys::required(env_keys::WEAVE_ZK_CONNECT)?;
        let kafka_zk_connect = env_keys::optional(env_keys::WEAVE_LOG_KAFKA_ZK)
            .unwrap_or_else(|| format!("{zk_connect}/{run_id}/kafka"));
        let reserved_memory_mb = env_keys::optional(env_keys::WEAVE_RESERVED_MEMORY_MB)
            .and_then(|value| value.parse().ok())
            .unwrap_or(DEFAULT_RESERVED_MEMORY_MB);
        let am_resources = RunResources {
            instance_id: 0,
            container_id: env_keys::required(env_keys::YARN_CONTAINER_ID)?,
            vcores: env_keys::required(env_keys::YARN_CONTAINER_VIRTUAL_CORES)?
                .parse()
                .context("invalid container vcores")?,
            memory_mb: env_keys::required(env_keys::YARN_CONTAINER_MEMORY_MB)?
                .parse()
                .context("invalid container memory")?,
            host: env_keys::required(env_keys::YARN_CONTAINER_HOST)?,
        };
        Ok(AmEnvironment {
            app_dir: env_keys::required(env_keys::WEAVE_APP_DIR)?,
            fs_user: env_keys::required(env_keys::WEAVE_FS_USER)?,
            run_id,
            zk_connect,
            kafka_zk_connect,
            reserved_memory_mb,
            yarn_app_id: env_keys::required(env_keys::YARN_APP_ID)?
                .parse()
                .context("invalid application id")?,
            yarn_app_cluster_time: env_keys::required(env_keys::YARN_APP_ID_CLUSTER_TIME)?
                .parse()
                .context("invalid application cluster time")?,
            am_resources,
        })
    }

    pub fn app_id(&self) -> String {
        format!(
            "application_{}_{:04}",
            self.yarn_app_cluster_time, self.yarn_app_id
        )
    }

    pub fn live_node_data(&self) -> AmLiveNodeData {
        AmLiveNodeData {
            yarn_app_id: self.yarn_app_id,
            cluster_time: self.yarn_app_cluster_time,
            container_id: self.am_resources.container_id.clone(),
        }
    }
}

/// Files staged next to the AM by the client launcher. Everything but the
/// application spec is optional and degrades to a warning.
#[derive(Debug, Clone, Default)]
pub struct StartupFiles {
    pub arguments: HashMap<String, Vec<String>>,
    pub local_files: Vec<LocalFile>,
    pub jvm_opts: String,
    pub credentials_path: Option<PathBuf>,
}

impl StartupFiles {
    pub fn load(dir: &Path) -> StartupFiles {
        let arguments = match std::fs::read_to_string(dir.join(files::ARGUMENTS)) {
            Ok(content) => serde_json::from_str(&content).unwrap_or_else(|err| {
                warn!("malformed {}: {err}", files::ARGUMENTS);
                HashMap::new()
            }),
            Err(_) => HashMap::new(),
        };
        let mut local_files: Vec<LocalFile> =
            match std::fs::read_to_string(dir.join(files::LOCALIZE_FILES)) {
                Ok(content) => serde_json::from_str(&content).unwrap_or_else(|err| {
                    warn!("malformed {}: {err}", files::LOCALIZE_FILES);
                    Vec::new()
                }),
                Err(_) => Vec::new(),
            };
        let logback = dir.join(files::LOGBACK_TEMPLATE);
        if logback.exists() {
            local_files.push(LocalFile {
                name: files::LOGBACK_TEMPLATE.to_string(),
                uri: format!("file://{}", logback.display()),
                archive: false,
                pattern: None,
            });
        }
        let jvm_opts = std::fs::read_to_string(dir.join(files::JVM_OPTIONS)).unwrap_or_default();
        let credentials = dir.join(files::CREDENTIALS);
        StartupFiles {
            arguments,
            local_files,
            jvm_opts,
            credentials_path: credentials.exists().then_some(credentials),
        }
    }
}

/// External collaborators injected into the service: the metadata store
/// connection, the cluster allocation protocol and the container launch
/// transport.
pub struct ServiceDeps {
    pub driver: Arc<dyn StoreDriver>,
    pub rm: Arc<dyn ResourceManagerClient>,
    pub launcher_factory: Arc<dyn LauncherFactory>,
    /// Overrides the handler named by the application spec; used by tests.
    pub event_handler: Option<Arc<dyn EventHandler>>,
}

/// The application master: owns the wiring and the lifecycle, and runs the
/// provisioning loop.
#[derive(Clone)]
pub struct Service {
    pub config: AmConfig,
    pub environment: AmEnvironment,
    pub spec: Arc<AppSpec>,
    pub registry: Arc<ContainerRegistry>,
    pub expected: Arc<ExpectedContainers>,
    pub credentials: Arc<CredentialsCache>,
    pub event_handler: Arc<dyn EventHandler>,
    pub rm: Arc<dyn ResourceManagerClient>,
    pub launcher_factory: Arc<dyn LauncherFactory>,
    pub metadata_root: MetadataClient,
    pub metadata_app: MetadataClient,
    pub requests: RequestQueue,
    pub worker: Arc<InstanceChangeWorker>,
    pub broker: Arc<LogBroker>,
    pub shutdown_tx: watch::Sender<bool>,
    pub shutdown_rx: watch::Receiver<bool>,
    startup_files: StartupFiles,
    tracker: Arc<Mutex<Option<TrackerService>>>,
}

impl Service {
    pub fn new(
        config: AmConfig,
        environment: AmEnvironment,
        spec: AppSpec,
        startup_files: StartupFiles,
        deps: ServiceDeps,
    ) -> Result<Self> {
        let spec = Arc::new(spec);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let registry = Arc::new(ContainerRegistry::new(
            environment.app_id(),
            environment.am_resources.clone(),
        ));
        let expected = Arc::new(ExpectedContainers::from_spec(&spec));
        let credentials = Arc::new(CredentialsCache::new(startup_files.credentials_path.clone()));
        let event_handler = match deps.event_handler {
            Some(handler) => handler,
            None => events::create_handler(spec.event_handler.as_ref())?,
        };

        let metadata_root = MetadataClient::new(deps.driver);
        let metadata_app = metadata_root.namespace(&format!("/{}", environment.run_id));
        let requests = build_request_queue(&spec);
        let worker = Arc::new(InstanceChangeWorker::new(
            spec.clone(),
            registry.clone(),
            expected.clone(),
            requests.clone(),
            shutdown_rx.clone(),
        ));
        let broker = Arc::new(LogBroker::new(
            config.broker.clone(),
            environment.kafka_zk_connect.clone(),
        ));

        Ok(Service {
            config,
            environment,
            spec,
            registry,
            expected,
            credentials,
            event_handler,
            rm: deps.rm,
            launcher_factory: deps.launcher_factory,
            metadata_root,
            metadata_app,
            requests,
            worker,
            broker,
            shutdown_tx,
            shutdown_rx,
            startup_files,
            tracker: Arc::new(Mutex::new(None)),
        })
    }

    /// Startup: event handler, log broker, tracker, resource manager
    /// registration, metadata nodes, message bus. Any error here is fatal.
    pub async fn start(&self) -> Result<()> {
        info!(
            app = %self.spec.name,
            run_id = %self.environment.run_id,
            "starting application master"
        );

        self.event_handler
            .initialize(&EventHandlerContext {
                app_name: self.spec.name.clone(),
                run_id: self.environment.run_id.clone(),
                config: self
                    .spec
                    .event_handler
                    .as_ref()
                    .map(|spec| spec.config.clone())
                    .unwrap_or_default(),
            })
            .await
            .context("error initializing event handler")?;

        self.broker.start().await?;

        // The tracker must be up before the resource manager handshake so
        // the tracking URL can be registered with it.
        let tracker = TrackerService::start(
            self.registry.clone(),
            self.config.tracker_listen_addr.parse()?,
            &self.environment.am_resources.host,
        )
        .await?;
        self.rm
            .set_tracker(tracker.bind_address(), tracker.url())
            .await?;
        self.rm.start().await.context("error registering with the resource manager")?;
        *self.tracker.lock().await = Some(tracker);

        let app_path = format!("/{}", self.environment.run_id);
        self.metadata_root
            .ensure(&app_path, b"{\"state\":\"RUNNING\"}")
            .await?;
        self.metadata_app.ensure("/runnables", b"").await?;
        self.metadata_app.ensure("/kafka", b"").await?;
        for name in self.spec.runnables.keys() {
            self.metadata_app
                .ensure(&format!("/runnables/{name}"), b"")
                .await?;
        }
        let live_node = serde_json::to_vec(&self.environment.live_node_data())?;
        self.metadata_app
            .create("/live", &live_node, CreateMode::Ephemeral)
            .await?;

        let bus = Arc::new(MessageBus::new(
            self.metadata_app.clone(),
            self.spec.clone(),
            self.registry.clone(),
            self.expected.clone(),
            self.credentials.clone(),
            self.worker.clone(),
            self.shutdown_tx.clone(),
        ));
        tokio::spawn(bus.run(self.shutdown_rx.clone()));

        info!("application master started");
        Ok(())
    }

    fn launch_context(&self) -> LaunchContext {
        let mut environment = HashMap::new();
        environment.insert(
            env_keys::WEAVE_APP_DIR.to_string(),
            self.environment.app_dir.clone(),
        );
        environment.insert(
            env_keys::WEAVE_FS_USER.to_string(),
            self.environment.fs_user.clone(),
        );
        environment.insert(
            env_keys::WEAVE_APP_RUN_ID.to_string(),
            self.environment.run_id.to_string(),
        );
        environment.insert(env_keys::WEAVE_APP_NAME.to_string(), self.spec.name.clone());
        environment.insert(
            env_keys::WEAVE_ZK_CONNECT.to_string(),
            self.environment.zk_connect.clone(),
        );
        environment.insert(
            env_keys::WEAVE_LOG_KAFKA_ZK.to_string(),
            self.environment.kafka_zk_connect.clone(),
        );
        LaunchContext {
            environment,
            arguments: Vec::new(),
            local_files: self.startup_files.local_files.clone(),
            jvm_opts: self.startup_files.jvm_opts.clone(),
            reserved_memory_mb: self.environment.reserved_memory_mb,
            instance_count: 0,
            credentials: None,
        }
    }

    /// The top-level provisioning loop; returns when the application has
    /// drained, was stopped or was aborted by the event handler.
    pub async fn run(&self) -> Result<LoopExit> {
        let mut provisioner = Provisioner::new(
            self.spec.clone(),
            self.registry.clone(),
            self.expected.clone(),
            self.rm.clone(),
            self.event_handler.clone(),
            self.launcher_factory.clone(),
            self.credentials.clone(),
            self.requests.clone(),
            self.launch_context(),
            self.startup_files.arguments.clone(),
            Duration::from_millis(self.config.allocate_interval_ms),
            Duration::from_secs(self.config.provision_timeout_secs),
        );
        provisioner.run(self.shutdown_rx.clone()).await
    }

    /// Runs to completion and performs the full shutdown sequence. Runtime
    /// errors are logged, never escalated into a dirty exit.
    pub async fn run_until_stopped(&self) -> LoopExit {
        let exit = match self.run().await {
            Ok(exit) => exit,
            Err(err) => {
                error!("provisioning loop failed: {err:#}");
                LoopExit::Stopped
            }
        };
        self.stop(exit).await;
        exit
    }

    pub fn trigger_shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Shutdown: event handler, instance worker, containers, completion
    /// drain, tracker, staging directory, logs, broker, resource manager.
    /// Every step is best-effort.
    pub async fn stop(&self, exit: LoopExit) {
        info!(exit = exit.as_ref(), "stopping application master");
        self.trigger_shutdown();

        self.event_handler.destroy().await;

        self.worker.shutdown().await;

        let ids = self.registry.container_ids().await;
        self.registry.stop_all().await;
        self.drain_completions(ids).await;

        if let Some(tracker) = self.tracker.lock().await.take() {
            tracker.stop().await;
        }

        if let Err(err) = self.metadata_app.delete("/live").await {
            debug!("live node already gone: {err:#}");
        }

        self.cleanup_staging_dir().await;

        // Give the log shipper a moment to drain before its broker goes.
        tokio::time::sleep(Duration::from_secs(1)).await;
        self.broker.stop().await;

        let final_status = match exit {
            LoopExit::Aborted => FinalStatus::Failed,
            _ => FinalStatus::Succeeded,
        };
        if let Err(err) = self.rm.stop(final_status).await {
            error!("error deregistering with the resource manager: {err:#}");
        }
        info!("application master stopped");
    }

    /// Polls `allocate` for up to the drain window so completion events of
    /// the stopped containers are observed.
    async fn drain_completions(&self, ids: HashSet<String>) {
        let mut handler = DrainHandler { ids };
        let mut polls = 0;
        while !handler.ids.is_empty() && polls < self.config.drain_secs {
            if let Err(err) = self.rm.allocate(0.0, &mut handler).await {
                warn!("allocate failed while draining completions: {err:#}");
                break;
            }
            if handler.ids.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
            polls += 1;
        }
        if !handler.ids.is_empty() {
            warn!(
                remaining = handler.ids.len(),
                "not all containers reported completion before the drain window closed"
            );
        }
    }

    async fn cleanup_staging_dir(&self) {
        let location = match LocalLocation::from_uri(&self.environment.app_dir) {
            Ok(location) => location,
            Err(err) => {
                warn!("cannot clean up application directory: {err:#}");
                return;
            }
        };
        match location.delete().await {
            Ok(true) => info!(uri = %location.uri(), "application directory deleted"),
            Ok(false) => warn!(uri = %location.uri(), "application directory was already gone"),
            Err(err) => warn!(uri = %location.uri(), "error cleaning up application directory: {err:#}"),
        }
    }
}

struct DrainHandler {
    ids: HashSet<String>,
}

#[async_trait]
impl AllocateHandler for DrainHandler {
    async fn acquired(&mut self, _launchers: Vec<Arc<dyn ProcessLauncher>>) {}

    async fn completed(&mut self, statuses: Vec<ContainerStatus>) {
        for status in statuses {
            self.ids.remove(&status.container_id);
        }
    }
}
