// MIT License - Copyright (c) 2026 Peter Wright
// Outbound zigbee2mqtt payloads

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::constants::{
    COLOR_CLUSTER, COLOR_TEMP_COMMAND, LEVEL_CLUSTER, LEVEL_COMMAND, TRANSTIME_SCALE,
};
use crate::registry::device::{Device, Group};

/// Anything that can receive `<base>/<name>/set` and `<base>/<name>/get`.
pub trait CommandTarget {
    fn base_topic(&self) -> &str;

    fn friendly_name(&self) -> String;

    fn topic(&self, suffix: &str) -> String {
        format!("{}/{}/{suffix}", self.base_topic(), self.friendly_name())
    }
}

impl CommandTarget for Device {
    fn base_topic(&self) -> &str {
        Device::base_topic(self)
    }

    fn friendly_name(&self) -> String {
        Device::friendly_name(self)
    }
}

impl CommandTarget for Group {
    fn base_topic(&self) -> &str {
        &self.base_topic
    }

    fn friendly_name(&self) -> String {
        self.friendly_name.clone()
    }
}

/// Body of a `/set` publish.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum SetCommand {
    /// Raw cluster command, used for properties that need a transition time.
    Cluster { command: ClusterCommand },
    /// `{property: value}`
    Flat(Map<String, Value>),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClusterCommand {
    pub cluster: &'static str,
    pub command: &'static str,
    pub payload: Map<String, Value>,
}

impl SetCommand {
    /// Translate a logical property into the bridge's command vocabulary.
    ///
    /// `brightness` (0-255) and `color_temp` (mireds) become cluster commands
    /// with a transition in tenths of a second; anything else is sent as is.
    pub fn for_property(property: &str, value: Value, transition_secs: u32) -> Self {
        let (cluster, command, field) = match property {
            "brightness" => (LEVEL_CLUSTER, LEVEL_COMMAND, "level"),
            "color_temp" => (COLOR_CLUSTER, COLOR_TEMP_COMMAND, "colortemp"),
            _ => {
                let mut flat = Map::new();
                flat.insert(property.to_string(), value);
                return SetCommand::Flat(flat);
            }
        };

        let mut payload = Map::new();
        payload.insert(field.to_string(), value);
        payload.insert(
            "transtime".to_string(),
            json!(transition_secs * TRANSTIME_SCALE),
        );
        SetCommand::Cluster {
            command: ClusterCommand {
                cluster,
                command,
                payload,
            },
        }
    }
}

/// Body of a `/get` publish asking for the current state.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GetRequest {
    pub state: String,
}

impl GetRequest {
    pub fn state() -> Self {
        Self {
            state: String::new(),
        }
    }
}

/// Body of a `bridge/request/<op>` publish: the operation's fields plus the
/// correlating transaction id.
#[derive(Serialize)]
pub struct BridgeRequest<'a, T: Serialize> {
    #[serde(flatten)]
    pub body: &'a T,
    pub transaction: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PermitJoinRequest {
    pub time: u32,
    pub device: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GroupMemberRequest {
    pub group: String,
    pub device: String,
}

/// A `bridge/response/<op>` message. Only the fields needed for correlation
/// are decoded.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BridgeResponse {
    #[serde(default)]
    pub transaction: Option<Value>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

impl BridgeResponse {
    pub fn matches(&self, transaction: u32) -> bool {
        self.transaction
            .as_ref()
            .and_then(Value::as_u64)
            .is_some_and(|t| t == u64::from(transaction))
    }

    pub fn is_error(&self) -> bool {
        self.status.as_deref() == Some("error")
    }
}
