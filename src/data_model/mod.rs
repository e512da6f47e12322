use std::{
    collections::{BTreeSet, HashMap},
    fmt,
    path::Path,
};

use anyhow::{anyhow, Context, Result};
use derive_builder::Builder;
use serde::{Deserialize, Serialize};

/// Identifier of a running application or of a single runnable instance.
///
/// An application run is identified by a bare UUID. Instances append the
/// instance id as `<uuid>-<instanceId>`; the UUID itself is 36 characters,
/// which is how the two forms are told apart.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(String);

const UUID_LEN: usize = 36;

impl RunId {
    pub fn generate() -> Self {
        RunId(uuid::Uuid::new_v4().to_string())
    }

    pub fn from_string(id: impl Into<String>) -> Self {
        RunId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Derives the run id of instance `instance_id` under this base.
    pub fn derive(&self, instance_id: u32) -> RunId {
        RunId(format!("{}-{}", self.0, instance_id))
    }

    /// The base run id with any instance suffix stripped.
    pub fn base(&self) -> RunId {
        match self.0.as_bytes().get(UUID_LEN) {
            Some(b'-') => RunId(self.0[..UUID_LEN].to_string()),
            _ => self.clone(),
        }
    }

    /// The instance id suffix, if this identifies a single instance.
    pub fn instance_id(&self) -> Option<u32> {
        match self.0.as_bytes().get(UUID_LEN) {
            Some(b'-') => self.0[UUID_LEN + 1..].parse().ok(),
            _ => None,
        }
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Resource profile of a runnable: per-container capability plus the desired
/// number of instances.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Builder)]
#[serde(rename_all = "camelCase")]
pub struct ResourceSpec {
    #[builder(default = "1")]
    pub vcores: u32,
    #[serde(rename = "memoryMB")]
    #[builder(default = "512")]
    pub memory_mb: u32,
    #[builder(default = "1")]
    pub instances: u32,
}

impl ResourceSpec {
    pub fn capability(&self) -> Capability {
        Capability {
            vcores: self.vcores,
            memory_mb: self.memory_mb,
        }
    }
}

/// Container capability requested from the resource manager. Requests and
/// acquisitions are matched on this, so it is hashable and ordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Capability {
    pub vcores: u32,
    #[serde(rename = "memoryMB")]
    pub memory_mb: u32,
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<{} vcores, {} MB>", self.vcores, self.memory_mb)
    }
}

/// A file localized into each container of a runnable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalFile {
    pub name: String,
    pub uri: String,
    #[serde(default)]
    pub archive: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
}

/// Everything needed to run one runnable: its resource profile and the files
/// staged into its containers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Builder)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeSpec {
    #[builder(setter(into))]
    pub name: String,
    pub resource: ResourceSpec,
    #[serde(default)]
    #[builder(default)]
    pub local_files: Vec<LocalFile>,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::AsRefStr, strum::Display,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderType {
    Started,
    Completed,
}

/// A startup group. Runnables within a group are requested in parallel;
/// groups are requested sequentially.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub names: BTreeSet<String>,
    #[serde(rename = "type")]
    pub order_type: OrderType,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventHandlerSpec {
    pub name: String,
    #[serde(default)]
    pub config: HashMap<String, String>,
}

/// The immutable application specification, staged by the client launcher
/// and loaded once at startup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Builder)]
#[serde(rename_all = "camelCase")]
pub struct AppSpec {
    #[builder(setter(into))]
    pub name: String,
    pub runnables: HashMap<String, RuntimeSpec>,
    #[serde(default)]
    #[builder(default)]
    pub orders: Vec<Order>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[builder(default)]
    pub event_handler: Option<EventHandlerSpec>,
}

impl AppSpec {
    pub fn from_file(path: &Path) -> Result<AppSpec> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("error reading application spec {}", path.display()))?;
        let spec: AppSpec = serde_json::from_str(&content)
            .with_context(|| format!("error parsing application spec {}", path.display()))?;
        spec.validate()?;
        Ok(spec)
    }

    pub fn validate(&self) -> Result<()> {
        if self.runnables.is_empty() {
            return Err(anyhow!("application spec has no runnables"));
        }
        for order in &self.orders {
            for name in &order.names {
                if !self.runnables.contains_key(name) {
                    return Err(anyhow!("order references unknown runnable {name}"));
                }
            }
        }
        Ok(())
    }

    /// Startup orders with every runnable accounted for: runnables not named
    /// by any declared order are appended as a trailing group.
    pub fn normalized_orders(&self) -> Vec<Order> {
        let mut orders = self.orders.clone();
        let ordered: BTreeSet<&String> = orders.iter().flat_map(|o| o.names.iter()).collect();
        let leftover: BTreeSet<String> = self
            .runnables
            .keys()
            .filter(|name| !ordered.contains(name))
            .cloned()
            .collect();
        if !leftover.is_empty() {
            orders.push(Order {
                names: leftover,
                order_type: OrderType::Started,
            });
        }
        orders
    }

    /// The startup order type governing the given runnable.
    pub fn order_type_of(&self, runnable_name: &str) -> OrderType {
        self.normalized_orders()
            .iter()
            .find(|order| order.names.contains(runnable_name))
            .map(|order| order.order_type)
            .unwrap_or(OrderType::Started)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::AsRefStr)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageType {
    User,
    System,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::AsRefStr)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageScope {
    Application,
    AllRunnable,
    Runnable,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    pub command: String,
    #[serde(default)]
    pub options: HashMap<String, String>,
}

impl Command {
    pub fn new(command: impl Into<String>) -> Self {
        Command {
            command: command.into(),
            options: HashMap::new(),
        }
    }

    pub fn with_option(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.options.insert(key.into(), value.into());
        self
    }
}

/// An out-of-band control message, delivered through the metadata store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    #[serde(rename = "type")]
    pub message_type: MessageType,
    pub scope: MessageScope,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runnable_name: Option<String>,
    pub command: Command,
}

/// Predefined system messages.
pub mod system_messages {
    use super::{Command, Message, MessageScope, MessageType};

    pub const STOP_COMMAND: &str = "stop";
    pub const INSTANCES_COMMAND: &str = "instances";
    pub const SECURE_STORE_UPDATED_COMMAND: &str = "secureStoreUpdated";

    pub fn stop_application() -> Message {
        Message {
            message_type: MessageType::System,
            scope: MessageScope::Application,
            runnable_name: None,
            command: Command::new(STOP_COMMAND),
        }
    }

    pub fn stop_runnable(runnable_name: impl Into<String>) -> Message {
        Message {
            message_type: MessageType::System,
            scope: MessageScope::Runnable,
            runnable_name: Some(runnable_name.into()),
            command: Command::new(STOP_COMMAND),
        }
    }

    pub fn set_instances(runnable_name: impl Into<String>, count: u32) -> Message {
        Message {
            message_type: MessageType::System,
            scope: MessageScope::Runnable,
            runnable_name: Some(runnable_name.into()),
            command: Command::new(INSTANCES_COMMAND).with_option("count", count.to_string()),
        }
    }

    pub fn secure_store_updated() -> Message {
        Message {
            message_type: MessageType::System,
            scope: MessageScope::Application,
            runnable_name: None,
            command: Command::new(SECURE_STORE_UPDATED_COMMAND),
        }
    }
}

/// Resources of one live container, as exposed by the tracker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunResources {
    pub instance_id: u32,
    pub container_id: String,
    pub vcores: u32,
    #[serde(rename = "memoryMB")]
    pub memory_mb: u32,
    pub host: String,
}

/// Live snapshot of all containers of the application.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceReport {
    pub app_id: String,
    pub app_master_resources: RunResources,
    pub resources: HashMap<String, Vec<RunResources>>,
}

/// Data stored in the AM's ephemeral live node; external observers read it
/// to find the application attempt behind a run id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AmLiveNodeData {
    pub yarn_app_id: i32,
    pub cluster_time: i64,
    pub container_id: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_id_derivation() {
        let base = RunId::generate();
        assert_eq!(base.as_str().len(), UUID_LEN);
        assert_eq!(base.instance_id(), None);
        assert_eq!(base.base(), base);

        let derived = base.derive(3);
        assert_eq!(derived.instance_id(), Some(3));
        assert_eq!(derived.base(), base);

        let reparsed = RunId::from_string(derived.as_str());
        assert_eq!(reparsed.instance_id(), Some(3));
    }

    #[test]
    fn test_app_spec_parsing() {
        let json = r#"{
            "name": "echo-app",
            "runnables": {
                "echo": {
                    "name": "echo",
                    "resource": {"vcores": 1, "memoryMB": 1024, "instances": 2},
                    "localFiles": [{"name": "echo.jar", "uri": "file:///tmp/echo.jar"}]
                }
            },
            "orders": [{"names": ["echo"], "type": "STARTED"}]
        }"#;
        let spec: AppSpec = serde_json::from_str(json).unwrap();
        spec.validate().unwrap();
        assert_eq!(spec.name, "echo-app");
        let echo = &spec.runnables["echo"];
        assert_eq!(echo.resource.capability().memory_mb, 1024);
        assert_eq!(echo.resource.instances, 2);
        assert_eq!(spec.order_type_of("echo"), OrderType::Started);
    }

    #[test]
    fn test_missing_orders_default_to_single_group() {
        let spec = AppSpecBuilder::default()
            .name("app")
            .runnables(HashMap::from([
                (
                    "a".to_string(),
                    RuntimeSpecBuilder::default()
                        .name("a")
                        .resource(ResourceSpecBuilder::default().build().unwrap())
                        .build()
                        .unwrap(),
                ),
                (
                    "b".to_string(),
                    RuntimeSpecBuilder::default()
                        .name("b")
                        .resource(ResourceSpecBuilder::default().build().unwrap())
                        .build()
                        .unwrap(),
                ),
            ]))
            .build()
            .unwrap();
        let orders = spec.normalized_orders();
        assert_eq!(orders.len(), 1);
        assert_eq!(orders[0].names.len(), 2);
    }

    #[test]
    fn test_order_with_unknown_runnable_rejected() {
        let json = r#"{
            "name": "bad",
            "runnables": {
                "a": {"name": "a", "resource": {"vcores": 1, "memoryMB": 128, "instances": 1}}
            },
            "orders": [{"names": ["missing"], "type": "STARTED"}]
        }"#;
        let spec: AppSpec = serde_json::from_str(json).unwrap();
        assert!(spec.validate().is_err());
    }

    #[test]
    fn test_order_type_wire_values() {
        assert_eq!(serde_json::to_value(OrderType::Started).unwrap(), "STARTED");
        assert_eq!(
            serde_json::to_value(OrderType::Completed).unwrap(),
            "COMPLETED"
        );
        let completed: OrderType = serde_json::from_str("\"COMPLETED\"").unwrap();
        assert_eq!(completed, OrderType::Completed);
    }

    #[test]
    fn test_message_wire_shape() {
        let message = system_messages::set_instances("echo", 3);
        let value = serde_json::to_value(&message).unwrap();
        assert_eq!(value["type"], "SYSTEM");
        assert_eq!(value["scope"], "RUNNABLE");
        assert_eq!(value["runnableName"], "echo");
        assert_eq!(value["command"]["command"], "instances");
        assert_eq!(value["command"]["options"]["count"], "3");

        let decoded: Message = serde_json::from_value(value).unwrap();
        assert_eq!(decoded, message);
    }

    #[test]
    fn test_resource_report_round_trip() {
        let report = ResourceReport {
            app_id: "application_1364543201964_0001".to_string(),
            app_master_resources: RunResources {
                instance_id: 0,
                container_id: "container_01_000001".to_string(),
                vcores: 1,
                memory_mb: 512,
                host: "am-host".to_string(),
            },
            resources: HashMap::from([(
                "echo".to_string(),
                vec![RunResources {
                    instance_id: 0,
                    container_id: "container_01_000002".to_string(),
                    vcores: 1,
                    memory_mb: 1024,
                    host: "worker-1".to_string(),
                }],
            )]),
        };
        let json = serde_json::to_string(&report).unwrap();
        assert!(json.contains("\"appId\""));
        assert!(json.contains("\"appMasterResources\""));
        assert!(json.contains("\"memoryMB\""));
        let back: ResourceReport = serde_json::from_str(&json).unwrap();
        assert_eq!(back, report);
    }
}
