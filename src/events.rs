use std::{collections::HashMap, sync::Arc, time::Duration};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use tracing::{error, info, warn};

use crate::data_model::{EventHandlerSpec, RunId};

/// One runnable whose container request has not been met within the
/// provisioning timeout.
#[derive(Debug, Clone)]
pub struct TimeoutEvent {
    pub runnable_name: String,
    pub expected: u32,
    pub actual: u32,
    pub requested_at_ms: u64,
}

/// What the application master does after a provisioning timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutAction {
    /// Initiate a clean shutdown of the application.
    Abort,
    /// Check again after the given delay.
    Postpone(Duration),
}

#[derive(Debug, Clone)]
pub struct EventHandlerContext {
    pub app_name: String,
    pub run_id: RunId,
    pub config: HashMap<String, String>,
}

/// Pluggable hook consulted on provisioning timeouts. Handlers are resolved
/// by name from the built-in registry; errors from a handler never stop the
/// provisioning loop.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn initialize(&self, _ctx: &EventHandlerContext) -> Result<()> {
        Ok(())
    }

    async fn launch_timeout(&self, events: Vec<TimeoutEvent>) -> Result<TimeoutAction>;

    async fn destroy(&self) {}
}

pub const DEFAULT_HANDLER: &str = "log-and-retry";
pub const ABORT_HANDLER: &str = "abort-on-timeout";

/// Resolves the handler named by the application spec. A missing spec gets
/// the default handler; an unknown name fails startup.
pub fn create_handler(spec: Option<&EventHandlerSpec>) -> Result<Arc<dyn EventHandler>> {
    let (name, config) = match spec {
        Some(spec) => (spec.name.as_str(), spec.config.clone()),
        None => (DEFAULT_HANDLER, HashMap::new()),
    };
    match name {
        DEFAULT_HANDLER => Ok(Arc::new(LogAndRetryHandler::from_config(&config)?)),
        ABORT_HANDLER => Ok(Arc::new(AbortOnTimeoutHandler)),
        other => Err(anyhow!("unknown event handler: {other}")),
    }
}

/// Default handler: logs every unmet request and retries after a fixed
/// delay.
pub struct LogAndRetryHandler {
    retry_after: Duration,
}

impl LogAndRetryHandler {
    fn from_config(config: &HashMap<String, String>) -> Result<Self> {
        let retry_after = match config.get("retry.secs") {
            Some(value) => Duration::from_secs(
                value
                    .parse()
                    .map_err(|_| anyhow!("invalid retry.secs value: {value}"))?,
            ),
            None => Duration::from_secs(60),
        };
        Ok(LogAndRetryHandler { retry_after })
    }
}

#[async_trait]
impl EventHandler for LogAndRetryHandler {
    async fn initialize(&self, ctx: &EventHandlerContext) -> Result<()> {
        info!(
            app = %ctx.app_name,
            run_id = %ctx.run_id,
            config = ?ctx.config,
            "event handler initialized"
        );
        Ok(())
    }

    async fn launch_timeout(&self, events: Vec<TimeoutEvent>) -> Result<TimeoutAction> {
        for event in &events {
            warn!(
                runnable = %event.runnable_name,
                expected = event.expected,
                actual = event.actual,
                requested_at_ms = event.requested_at_ms,
                "containers not provisioned within the timeout"
            );
        }
        Ok(TimeoutAction::Postpone(self.retry_after))
    }
}

/// Aborts the application when any container request stays unmet.
pub struct AbortOnTimeoutHandler;

#[async_trait]
impl EventHandler for AbortOnTimeoutHandler {
    async fn launch_timeout(&self, events: Vec<TimeoutEvent>) -> Result<TimeoutAction> {
        for event in &events {
            error!(
                runnable = %event.runnable_name,
                expected = event.expected,
                actual = event.actual,
                "containers not provisioned within the timeout, aborting application"
            );
        }
        Ok(TimeoutAction::Abort)
    }
}
