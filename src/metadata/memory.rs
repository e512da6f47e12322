use std::{
    collections::{BTreeMap, HashSet},
    sync::Mutex,
};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use tokio::sync::broadcast;

use super::driver::{CreateMode, NodeEventKind, SessionState, StoreDriver, StoreEvent, WatchKind};

/// In-process metadata store driver. Implements the full node, ephemeral,
/// sequential and watch semantics against a local tree, which is enough for
/// standalone mode and for tests; `expire_session` simulates the store
/// dropping the client's session.
pub struct MemoryDriver {
    inner: Mutex<Tree>,
    events: broadcast::Sender<StoreEvent>,
}

struct Tree {
    nodes: BTreeMap<String, Node>,
    watches: HashSet<(String, WatchKind)>,
    next_seq: u64,
}

struct Node {
    data: Vec<u8>,
    ephemeral: bool,
}

impl Default for MemoryDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryDriver {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(1024);
        MemoryDriver {
            inner: Mutex::new(Tree {
                nodes: BTreeMap::new(),
                watches: HashSet::new(),
                next_seq: 0,
            }),
            events,
        }
    }

    /// Drops the session: every ephemeral node disappears, all armed watches
    /// are lost, and the client observes expiry followed by a reconnect.
    pub fn expire_session(&self) {
        let ephemerals: Vec<String> = {
            let mut tree = self.inner.lock().unwrap();
            tree.watches.clear();
            let ephemerals: Vec<String> = tree
                .nodes
                .iter()
                .filter(|(_, node)| node.ephemeral)
                .map(|(path, _)| path.clone())
                .collect();
            for path in &ephemerals {
                tree.nodes.remove(path);
            }
            ephemerals
        };
        let _ = self
            .events
            .send(StoreEvent::Session(SessionState::Disconnected));
        let _ = self.events.send(StoreEvent::Session(SessionState::Expired));
        for path in ephemerals {
            tracing::debug!(path = %path, "ephemeral node removed on session expiry");
        }
        let _ = self
            .events
            .send(StoreEvent::Session(SessionState::Connected));
    }

    fn parent_of(path: &str) -> Option<String> {
        let idx = path.rfind('/')?;
        if idx == 0 {
            Some("/".to_string())
        } else {
            Some(path[..idx].to_string())
        }
    }

    /// Emits a node event if (and only if) a matching watch is armed, then
    /// disarms it.
    fn fire(&self, tree: &mut Tree, path: &str, kind: NodeEventKind) {
        let watch_kind = match kind {
            NodeEventKind::ChildrenChanged => WatchKind::Children,
            _ => WatchKind::Data,
        };
        if tree.watches.remove(&(path.to_string(), watch_kind)) {
            let _ = self.events.send(StoreEvent::Node {
                path: path.to_string(),
                kind,
            });
        }
    }

    fn fire_parent_changed(&self, tree: &mut Tree, path: &str) {
        if let Some(parent) = Self::parent_of(path) {
            self.fire(tree, &parent, NodeEventKind::ChildrenChanged);
        }
    }

    fn check_path(path: &str) -> Result<()> {
        if !path.starts_with('/') || (path.len() > 1 && path.ends_with('/')) {
            return Err(anyhow!("invalid node path: {path}"));
        }
        Ok(())
    }
}

#[async_trait]
impl StoreDriver for MemoryDriver {
    async fn create(&self, path: &str, data: &[u8], mode: CreateMode) -> Result<String> {
        Self::check_path(path)?;
        let mut tree = self.inner.lock().unwrap();
        let created = match mode {
            CreateMode::PersistentSequential => {
                let seq = tree.next_seq;
                tree.next_seq += 1;
                format!("{path}{seq:010}")
            }
            _ => path.to_string(),
        };
        if tree.nodes.contains_key(&created) {
            return Err(anyhow!("node already exists: {created}"));
        }
        if let Some(parent) = Self::parent_of(&created) {
            if parent != "/" && !tree.nodes.contains_key(&parent) {
                return Err(anyhow!("parent node does not exist: {parent}"));
            }
        }
        tree.nodes.insert(
            created.clone(),
            Node {
                data: data.to_vec(),
                ephemeral: mode == CreateMode::Ephemeral,
            },
        );
        self.fire(&mut tree, &created, NodeEventKind::Created);
        self.fire_parent_changed(&mut tree, &created);
        Ok(created)
    }

    async fn set_data(&self, path: &str, data: &[u8]) -> Result<()> {
        let mut tree = self.inner.lock().unwrap();
        match tree.nodes.get_mut(path) {
            Some(node) => {
                node.data = data.to_vec();
            }
            None => return Err(anyhow!("node does not exist: {path}")),
        }
        self.fire(&mut tree, path, NodeEventKind::DataChanged);
        Ok(())
    }

    async fn get_data(&self, path: &str) -> Result<Option<Vec<u8>>> {
        let tree = self.inner.lock().unwrap();
        Ok(tree.nodes.get(path).map(|node| node.data.clone()))
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let mut tree = self.inner.lock().unwrap();
        if tree.nodes.remove(path).is_none() {
            return Err(anyhow!("node does not exist: {path}"));
        }
        self.fire(&mut tree, path, NodeEventKind::Deleted);
        self.fire_parent_changed(&mut tree, path);
        Ok(())
    }

    async fn get_children(&self, path: &str) -> Result<Vec<String>> {
        let tree = self.inner.lock().unwrap();
        let prefix = if path == "/" {
            "/".to_string()
        } else {
            format!("{path}/")
        };
        Ok(tree
            .nodes
            .keys()
            .filter(|p| {
                p.starts_with(&prefix) && !p[prefix.len()..].is_empty() &&
                    !p[prefix.len()..].contains('/')
            })
            .map(|p| p[prefix.len()..].to_string())
            .collect())
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        let tree = self.inner.lock().unwrap();
        Ok(tree.nodes.contains_key(path))
    }

    async fn watch(&self, path: &str, kind: WatchKind) -> Result<()> {
        let mut tree = self.inner.lock().unwrap();
        tree.watches.insert((path.to_string(), kind));
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }

    fn connect_string(&self) -> String {
        "memory:local".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_create_get_delete() -> Result<()> {
        let driver = MemoryDriver::new();
        driver.create("/app", b"state", CreateMode::Persistent).await?;
        assert_eq!(driver.get_data("/app").await?, Some(b"state".to_vec()));
        driver.create("/app/runnables", b"", CreateMode::Persistent).await?;
        assert!(driver.exists("/app/runnables").await?);
        driver.delete("/app/runnables").await?;
        assert!(!driver.exists("/app/runnables").await?);
        Ok(())
    }

    #[tokio::test]
    async fn test_create_requires_parent() -> Result<()> {
        let driver = MemoryDriver::new();
        assert!(driver
            .create("/app/orphan", b"", CreateMode::Persistent)
            .await
            .is_err());
        Ok(())
    }

    #[tokio::test]
    async fn test_sequential_nodes_sort_in_creation_order() -> Result<()> {
        let driver = MemoryDriver::new();
        driver.create("/app", b"", CreateMode::Persistent).await?;
        driver.create("/app/messages", b"", CreateMode::Persistent).await?;
        let first = driver
            .create("/app/messages/msg", b"a", CreateMode::PersistentSequential)
            .await?;
        let second = driver
            .create("/app/messages/msg", b"b", CreateMode::PersistentSequential)
            .await?;
        assert!(first < second);
        let mut children = driver.get_children("/app/messages").await?;
        children.sort();
        assert_eq!(children.len(), 2);
        assert!(children[0].starts_with("msg"));
        Ok(())
    }

    #[tokio::test]
    async fn test_watch_fires_once_per_arming() -> Result<()> {
        let driver = MemoryDriver::new();
        driver.create("/app", b"", CreateMode::Persistent).await?;
        let mut events = driver.subscribe();
        driver.watch("/app", WatchKind::Children).await?;

        driver.create("/app/a", b"", CreateMode::Persistent).await?;
        // Second change without re-arming must not emit.
        driver.create("/app/b", b"", CreateMode::Persistent).await?;

        let event = events.try_recv().unwrap();
        match event {
            StoreEvent::Node { path, kind } => {
                assert_eq!(path, "/app");
                assert_eq!(kind, NodeEventKind::ChildrenChanged);
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert!(events.try_recv().is_err());
        Ok(())
    }

    #[tokio::test]
    async fn test_session_expiry_removes_ephemerals() -> Result<()> {
        let driver = MemoryDriver::new();
        driver.create("/app", b"", CreateMode::Persistent).await?;
        driver.create("/app/live", b"", CreateMode::Ephemeral).await?;
        driver.expire_session();
        assert!(!driver.exists("/app/live").await?);
        assert!(driver.exists("/app").await?);
        Ok(())
    }
}
