use std::{collections::HashMap, fmt, net::SocketAddr, sync::Arc};

use anyhow::Result;
use async_trait::async_trait;

use crate::data_model::{Capability, LocalFile, RunId};

pub mod standalone;

/// Opaque handle for an outstanding container request, used to tell the
/// client library to forget the request once its containers have been
/// matched (allocated requests are otherwise never forgotten).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestId(pub String);

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone)]
pub struct ContainerInfo {
    pub id: String,
    pub host: String,
    pub vcores: u32,
    pub memory_mb: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::AsRefStr)]
pub enum ContainerState {
    Running,
    Complete,
}

#[derive(Debug, Clone)]
pub struct ContainerStatus {
    pub container_id: String,
    pub state: ContainerState,
    pub exit_status: i32,
    pub diagnostics: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::AsRefStr)]
pub enum FinalStatus {
    Succeeded,
    Failed,
    Killed,
}

/// Everything a container process is launched with, minus the identity
/// fields that are only assigned at start time by the registry.
#[derive(Debug, Clone, Default)]
pub struct LaunchContext {
    pub environment: HashMap<String, String>,
    pub arguments: Vec<String>,
    pub local_files: Vec<LocalFile>,
    pub jvm_opts: String,
    pub reserved_memory_mb: u32,
    pub instance_count: u32,
    pub credentials: Option<Arc<Vec<u8>>>,
}

/// Per-container launcher handed out by the resource manager client for
/// every acquired container.
#[async_trait]
pub trait ProcessLauncher: Send + Sync {
    fn container_info(&self) -> ContainerInfo;

    /// Submits the container process for launch. A failed launch surfaces as
    /// a non-zero completion through the normal `allocate` path.
    async fn launch(&self, run_id: &RunId, instance_id: u32, ctx: &LaunchContext) -> Result<()>;

    /// Forcibly releases the container.
    async fn terminate(&self) -> Result<()>;
}

/// Receives the outcome of one `allocate` poll. Both callbacks are invoked
/// synchronously within the poll, acquisitions first.
#[async_trait]
pub trait AllocateHandler: Send {
    async fn acquired(&mut self, launchers: Vec<Arc<dyn ProcessLauncher>>);
    async fn completed(&mut self, statuses: Vec<ContainerStatus>);
}

/// Client of the cluster-side allocation protocol. The caller drives
/// `allocate` at roughly 1 Hz; there is no ordering guarantee between
/// outstanding requests and acquisitions, so callers match by capability.
#[async_trait]
pub trait ResourceManagerClient: Send + Sync {
    /// Registers the application master and acquires attempt tokens.
    async fn start(&self) -> Result<()>;

    async fn stop(&self, final_status: FinalStatus) -> Result<()>;

    /// Registers the tracker URL shown in the resource manager UI. Must be
    /// called before `start`.
    async fn set_tracker(&self, bind_address: SocketAddr, url: &str) -> Result<()>;

    /// Enqueues a request for `count` containers of the given capability.
    async fn add_container_request(&self, capability: Capability, count: u32)
        -> Result<RequestId>;

    /// Tells the client library to forget a fully matched request.
    async fn complete_container_request(&self, request_id: &RequestId) -> Result<()>;

    /// One poll cycle against the resource manager.
    async fn allocate(&self, progress: f32, handler: &mut dyn AllocateHandler) -> Result<()>;
}
