//! Environment variables that make up the contract between the client-side
//! launcher, the application master and the containers it launches.

use anyhow::{Context, Result};

pub const WEAVE_APP_DIR: &str = "WEAVE_APP_DIR";
pub const WEAVE_APP_RUN_ID: &str = "WEAVE_APP_RUN_ID";
pub const WEAVE_APP_NAME: &str = "WEAVE_APP_NAME";
pub const WEAVE_FS_USER: &str = "WEAVE_FS_USER";
pub const WEAVE_ZK_CONNECT: &str = "WEAVE_ZK_CONNECT";
pub const WEAVE_LOG_KAFKA_ZK: &str = "WEAVE_LOG_KAFKA_ZK";
pub const WEAVE_RESERVED_MEMORY_MB: &str = "WEAVE_RESERVED_MEMORY_MB";

// Set by the AM for each launched container.
pub const WEAVE_RUN_ID: &str = "WEAVE_RUN_ID";
pub const WEAVE_RUNNABLE_NAME: &str = "WEAVE_RUNNABLE_NAME";
pub const WEAVE_RUNNABLE_ARGS: &str = "WEAVE_RUNNABLE_ARGS";
pub const WEAVE_INSTANCE_ID: &str = "WEAVE_INSTANCE_ID";
pub const WEAVE_INSTANCE_COUNT: &str = "WEAVE_INSTANCE_COUNT";

// Assigned by the resource manager.
pub const YARN_APP_ID: &str = "YARN_APP_ID";
pub const YARN_APP_ID_CLUSTER_TIME: &str = "YARN_APP_ID_CLUSTER_TIME";
pub const YARN_CONTAINER_ID: &str = "YARN_CONTAINER_ID";
pub const YARN_CONTAINER_HOST: &str = "YARN_CONTAINER_HOST";
pub const YARN_CONTAINER_VIRTUAL_CORES: &str = "YARN_CONTAINER_VIRTUAL_CORES";
pub const YARN_CONTAINER_MEMORY_MB: &str = "YARN_CONTAINER_MEMORY_MB";

pub fn required(key: &str) -> Result<String> {
    std::env::var(key).with_context(|| format!("missing environment variable {key}"))
}

pub fn optional(key: &str) -> Option<String> {
    std::env::var(key).ok()
}
