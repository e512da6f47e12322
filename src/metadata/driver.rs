use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::broadcast;

/// Creation mode of a node, mirroring the semantics of consensus-style
/// metadata stores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::AsRefStr)]
pub enum CreateMode {
    Persistent,
    /// Persistent with a monotonically increasing sequence number appended
    /// to the node name.
    PersistentSequential,
    /// Tied to the creator's session; removed when the session ends.
    Ephemeral,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeEventKind {
    Created,
    Deleted,
    DataChanged,
    ChildrenChanged,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::AsRefStr)]
pub enum SessionState {
    Connected,
    Disconnected,
    Expired,
}

/// Raw event stream of a store driver. Node events are only emitted for
/// paths with an armed watch; session events are always emitted.
#[derive(Debug, Clone)]
pub enum StoreEvent {
    Node { path: String, kind: NodeEventKind },
    Session(SessionState),
}

/// What a watch observes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WatchKind {
    /// Creation, deletion and data changes of the node itself.
    Data,
    /// Changes to the node's child list.
    Children,
}

/// Low-level client of the metadata store. Implementations wrap the actual
/// consensus-store protocol; watches are one-shot in the store's native
/// style and are re-armed by [`MetadataClient`](super::MetadataClient).
#[async_trait]
pub trait StoreDriver: Send + Sync {
    /// Creates a node, returning the path actually created (which differs
    /// from the requested path for sequential nodes).
    async fn create(&self, path: &str, data: &[u8], mode: CreateMode) -> Result<String>;

    async fn set_data(&self, path: &str, data: &[u8]) -> Result<()>;

    async fn get_data(&self, path: &str) -> Result<Option<Vec<u8>>>;

    async fn delete(&self, path: &str) -> Result<()>;

    /// Child node names (not full paths), unsorted.
    async fn get_children(&self, path: &str) -> Result<Vec<String>>;

    async fn exists(&self, path: &str) -> Result<bool>;

    /// Arms a one-shot watch. The next matching change emits a node event
    /// and disarms the watch.
    async fn watch(&self, path: &str, kind: WatchKind) -> Result<()>;

    fn subscribe(&self) -> broadcast::Receiver<StoreEvent>;

    /// Connect string handed to containers so they reach the same store.
    fn connect_string(&self) -> String;
}
