use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use anyhow::Result;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

pub mod driver;
pub mod memory;

pub use driver::{CreateMode, NodeEventKind, SessionState, StoreDriver, StoreEvent, WatchKind};

/// Receives watch notifications. The event carries no payload; consumers
/// re-read the watched state, which keeps delivery at-least-once under
/// re-arming and session recovery.
pub type Watcher = mpsc::UnboundedSender<WatchEvent>;

#[derive(Debug, Clone)]
pub struct WatchEvent {
    /// The path as it was passed when the watch was installed.
    pub path: String,
    pub kind: NodeEventKind,
}

struct Registration {
    registered_path: String,
    sender: Watcher,
}

type WatchTable = Mutex<HashMap<(String, WatchKind), Vec<Registration>>>;

/// Client of the metadata store. All paths are namespaced under a prefix,
/// and watches installed through this client survive session expiry: they
/// are re-armed on reconnect and the latest state is re-delivered, so a
/// watcher observes every distinct state change (possibly with duplicates)
/// and is never stalled indefinitely by a disconnection.
#[derive(Clone)]
pub struct MetadataClient {
    driver: Arc<dyn StoreDriver>,
    prefix: String,
    watches: Arc<WatchTable>,
}

impl MetadataClient {
    pub fn new(driver: Arc<dyn StoreDriver>) -> Self {
        let watches: Arc<WatchTable> = Arc::new(Mutex::new(HashMap::new()));
        let client = MetadataClient {
            driver: driver.clone(),
            prefix: String::new(),
            watches: watches.clone(),
        };
        tokio::spawn(run_watch_router(driver, watches));
        client
    }

    /// A client sharing this client's connection and watch routing, with all
    /// paths nested under `sub`.
    pub fn namespace(&self, sub: &str) -> MetadataClient {
        MetadataClient {
            driver: self.driver.clone(),
            prefix: format!("{}{}", self.prefix, sub),
            watches: self.watches.clone(),
        }
    }

    pub fn connect_string(&self) -> String {
        self.driver.connect_string()
    }

    fn abs(&self, path: &str) -> String {
        if path.is_empty() {
            self.prefix.clone()
        } else {
            format!("{}{}", self.prefix, path)
        }
    }

    fn rel(&self, abs: &str) -> String {
        abs.strip_prefix(&self.prefix).unwrap_or(abs).to_string()
    }

    async fn register(&self, path: &str, kind: WatchKind, watcher: Watcher) -> Result<()> {
        let abs = self.abs(path);
        {
            let mut table = self.watches.lock().unwrap();
            table.entry((abs.clone(), kind)).or_default().push(Registration {
                registered_path: path.to_string(),
                sender: watcher,
            });
        }
        self.driver.watch(&abs, kind).await
    }

    /// Creates a node and returns its path (namespace-relative), which for
    /// sequential nodes carries the assigned sequence suffix.
    pub async fn create(&self, path: &str, data: &[u8], mode: CreateMode) -> Result<String> {
        let created = self.driver.create(&self.abs(path), data, mode).await?;
        Ok(self.rel(&created))
    }

    /// Creates a persistent node, tolerating that it already exists.
    pub async fn ensure(&self, path: &str, data: &[u8]) -> Result<()> {
        let abs = self.abs(path);
        if self.driver.exists(&abs).await? {
            return Ok(());
        }
        match self.driver.create(&abs, data, CreateMode::Persistent).await {
            Ok(_) => Ok(()),
            Err(err) if self.driver.exists(&abs).await.unwrap_or(false) => {
                debug!(path = %abs, "node created concurrently: {err:#}");
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    pub async fn set_data(&self, path: &str, data: &[u8]) -> Result<()> {
        self.driver.set_data(&self.abs(path), data).await
    }

    pub async fn get_data(&self, path: &str, watcher: Option<Watcher>) -> Result<Option<Vec<u8>>> {
        if let Some(watcher) = watcher {
            self.register(path, WatchKind::Data, watcher).await?;
        }
        self.driver.get_data(&self.abs(path)).await
    }

    pub async fn delete(&self, path: &str) -> Result<()> {
        self.driver.delete(&self.abs(path)).await
    }

    pub async fn exists(&self, path: &str, watcher: Option<Watcher>) -> Result<bool> {
        if let Some(watcher) = watcher {
            self.register(path, WatchKind::Data, watcher).await?;
        }
        self.driver.exists(&self.abs(path)).await
    }

    pub async fn get_children(
        &self,
        path: &str,
        watcher: Option<Watcher>,
    ) -> Result<Vec<String>> {
        if let Some(watcher) = watcher {
            self.register(path, WatchKind::Children, watcher).await?;
        }
        self.driver.get_children(&self.abs(path)).await
    }
}

/// Forwards driver events to registered watchers, re-arming the one-shot
/// store watch before every delivery so consumer re-reads happen under an
/// armed watch. After session expiry, all watches are re-armed on reconnect
/// and a synthetic event re-delivers the latest state.
async fn run_watch_router(driver: Arc<dyn StoreDriver>, watches: Arc<WatchTable>) {
    let mut events = driver.subscribe();
    let mut expired = false;
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                warn!(missed, "watch router lagged behind store events");
                continue;
            }
            Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
        };
        match event {
            StoreEvent::Node { path, kind } => {
                let watch_kind = match kind {
                    NodeEventKind::ChildrenChanged => WatchKind::Children,
                    _ => WatchKind::Data,
                };
                deliver(&driver, &watches, &path, watch_kind, kind).await;
            }
            StoreEvent::Session(SessionState::Expired) => {
                warn!("metadata store session expired");
                expired = true;
            }
            StoreEvent::Session(SessionState::Connected) if expired => {
                expired = false;
                warn!("metadata store session re-established, re-arming watches");
                let keys: Vec<(String, WatchKind)> = {
                    let table = watches.lock().unwrap();
                    table.keys().cloned().collect()
                };
                for (path, watch_kind) in keys {
                    let kind = match watch_kind {
                        WatchKind::Children => NodeEventKind::ChildrenChanged,
                        WatchKind::Data => NodeEventKind::DataChanged,
                    };
                    deliver(&driver, &watches, &path, watch_kind, kind).await;
                }
            }
            StoreEvent::Session(state) => {
                debug!(state = state.as_ref(), "metadata store session event");
            }
        }
    }
}

async fn deliver(
    driver: &Arc<dyn StoreDriver>,
    watches: &Arc<WatchTable>,
    path: &str,
    watch_kind: WatchKind,
    kind: NodeEventKind,
) {
    let targets: Vec<(String, Watcher)> = {
        let mut table = watches.lock().unwrap();
        let key = (path.to_string(), watch_kind);
        match table.get_mut(&key) {
            Some(registrations) => {
                registrations.retain(|r| !r.sender.is_closed());
                if registrations.is_empty() {
                    table.remove(&key);
                    return;
                }
                registrations
                    .iter()
                    .map(|r| (r.registered_path.clone(), r.sender.clone()))
                    .collect()
            }
            None => return,
        }
    };
    // Re-arm before notifying: the watcher's re-read then races no gap.
    if let Err(err) = driver.watch(path, watch_kind).await {
        error!(path = %path, "failed to re-arm watch: {err:#}");
    }
    for (registered_path, sender) in targets {
        let _ = sender.send(WatchEvent {
            path: registered_path,
            kind,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::memory::MemoryDriver;

    #[tokio::test]
    async fn test_namespaced_operations() -> Result<()> {
        let driver = Arc::new(MemoryDriver::new());
        let root = MetadataClient::new(driver.clone());
        root.create("/app", b"", CreateMode::Persistent).await?;
        let app = root.namespace("/app");
        app.create("/runnables", b"", CreateMode::Persistent).await?;
        assert!(driver.exists("/app/runnables").await?);
        assert_eq!(app.get_children("", None).await?, vec!["runnables"]);
        Ok(())
    }

    #[tokio::test]
    async fn test_watch_survives_repeated_changes() -> Result<()> {
        let driver = Arc::new(MemoryDriver::new());
        let root = MetadataClient::new(driver.clone());
        root.create("/app", b"", CreateMode::Persistent).await?;
        root.create("/app/messages", b"", CreateMode::Persistent).await?;

        let (tx, mut rx) = mpsc::unbounded_channel();
        root.get_children("/app/messages", Some(tx)).await?;

        root.create("/app/messages/msg", b"a", CreateMode::PersistentSequential)
            .await?;
        let event = rx.recv().await.unwrap();
        assert_eq!(event.path, "/app/messages");
        assert_eq!(event.kind, NodeEventKind::ChildrenChanged);

        // The one-shot store watch must have been re-armed by the client.
        root.create("/app/messages/msg", b"b", CreateMode::PersistentSequential)
            .await?;
        let event = rx.recv().await.unwrap();
        assert_eq!(event.kind, NodeEventKind::ChildrenChanged);
        Ok(())
    }

    #[tokio::test]
    async fn test_watch_rearmed_after_session_expiry() -> Result<()> {
        let driver = Arc::new(MemoryDriver::new());
        let root = MetadataClient::new(driver.clone());
        root.create("/app", b"", CreateMode::Persistent).await?;

        let (tx, mut rx) = mpsc::unbounded_channel();
        root.get_children("/app", Some(tx)).await?;

        driver.expire_session();
        // The latest state is re-delivered after reconnect.
        let event = rx.recv().await.unwrap();
        assert_eq!(event.kind, NodeEventKind::ChildrenChanged);

        // And changes after the expiry are observed again.
        root.create("/app/after", b"", CreateMode::Persistent).await?;
        let event = rx.recv().await.unwrap();
        assert_eq!(event.kind, NodeEventKind::ChildrenChanged);
        Ok(())
    }
}
