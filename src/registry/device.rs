// MIT License - Copyright (c) 2026 Peter Wright
// Device and group records built from zigbee2mqtt discovery

use std::fmt;
use std::str::FromStr;
use std::sync::RwLock;

use chrono::{DateTime, Local};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use tokio::sync::watch;
use tokio::time::{timeout, Duration};
use tracing::warn;

use crate::error::{LightsError, Result};

/// Hardware address of a Zigbee device in canonical form (`00:12:4b:00:aa:bb:cc:dd`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct IeeeAddress(String);

impl IeeeAddress {
    /// Normalize `0x00124B00AABBCCDD` or an already colon-separated address.
    pub fn parse(raw: &str) -> Result<Self> {
        let trimmed = raw.trim();
        let hex: String = trimmed
            .strip_prefix("0x")
            .or_else(|| trimmed.strip_prefix("0X"))
            .unwrap_or(trimmed)
            .chars()
            .filter(|c| *c != ':')
            .collect();

        if hex.is_empty() || hex.len() % 2 != 0 || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(LightsError::config(format!("invalid IEEE address: {raw}")));
        }

        let lower = hex.to_ascii_lowercase();
        let pairs: Vec<&str> = (0..lower.len())
            .step_by(2)
            .map(|i| &lower[i..i + 2])
            .collect();
        Ok(Self(pairs.join(":")))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IeeeAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for IeeeAddress {
    type Err = LightsError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl<'de> Deserialize<'de> for IeeeAddress {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        Self::parse(&raw).map_err(serde::de::Error::custom)
    }
}

/// Position of a device in the mesh.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceRole {
    Coordinator,
    Router,
    EndDevice,
}

/// Descriptive fields of a `bridge/devices` entry.
///
/// Fields this crate does not interpret (`definition`, `endpoints`, ...) are
/// kept verbatim in `extra`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceInfo {
    #[serde(rename = "type")]
    pub role: DeviceRole,
    pub ieee_address: String,
    pub network_address: u16,
    pub friendly_name: String,
    #[serde(default)]
    pub interview_completed: bool,
    #[serde(default)]
    pub interviewing: bool,
    #[serde(default)]
    pub supported: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub power_source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manufacturer: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub software_build_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date_code: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl DeviceInfo {
    /// Overwrite the fields present in `update`, leaving the others untouched.
    ///
    /// A field whose new value does not fit its type is skipped.
    pub fn merge(&mut self, update: &Map<String, Value>) {
        let mut merged = match serde_json::to_value(&*self) {
            Ok(Value::Object(map)) => map,
            _ => return,
        };

        for (key, value) in update {
            let previous = merged.insert(key.clone(), value.clone());
            if serde_json::from_value::<DeviceInfo>(Value::Object(merged.clone())).is_err() {
                warn!("Ignoring invalid value for {key} on {}: {value}", self.friendly_name);
                match previous {
                    Some(previous) => merged.insert(key.clone(), previous),
                    None => merged.remove(key),
                };
            }
        }

        if let Ok(info) = serde_json::from_value(Value::Object(merged)) {
            *self = info;
        }
    }
}

/// Last known state reported by a device on its own topic.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeviceState {
    pub properties: Map<String, Value>,
    pub updated_at: Option<DateTime<Local>>,
    /// Number of updates received so far.
    pub generation: u64,
}

/// A device discovered on one segment. Never removed once seen.
#[derive(Debug)]
pub struct Device {
    address: IeeeAddress,
    base_topic: String,
    info: RwLock<DeviceInfo>,
    state: watch::Sender<DeviceState>,
}

/// Receiver for a device's state updates.
///
/// A freshly created receiver treats the current state as already seen, so
/// [`wait_for_update`] only completes for an update that arrives afterwards.
pub type StateReceiver = watch::Receiver<DeviceState>;

impl Device {
    pub fn new(address: IeeeAddress, base_topic: impl Into<String>, info: DeviceInfo) -> Self {
        let (state, _) = watch::channel(DeviceState::default());
        Self {
            address,
            base_topic: base_topic.into(),
            info: RwLock::new(info),
            state,
        }
    }

    pub fn address(&self) -> &IeeeAddress {
        &self.address
    }

    /// Base topic of the segment the device was discovered on.
    pub fn base_topic(&self) -> &str {
        &self.base_topic
    }

    pub fn info(&self) -> DeviceInfo {
        self.read_info().clone()
    }

    pub fn friendly_name(&self) -> String {
        self.read_info().friendly_name.clone()
    }

    pub fn model_id(&self) -> Option<String> {
        self.read_info().model_id.clone()
    }

    pub fn state(&self) -> DeviceState {
        self.state.borrow().clone()
    }

    /// Current value of one reported property.
    pub fn property(&self, name: &str) -> Option<Value> {
        self.state.borrow().properties.get(name).cloned()
    }

    pub fn subscribe_state(&self) -> StateReceiver {
        self.state.subscribe()
    }

    pub(crate) fn merge_info(&self, update: &Map<String, Value>) {
        match self.info.write() {
            Ok(mut info) => info.merge(update),
            Err(poisoned) => poisoned.into_inner().merge(update),
        }
    }

    /// Shallow-merge reported properties and wake every waiter.
    pub(crate) fn apply_state(&self, update: Map<String, Value>) {
        self.state.send_modify(|state| {
            state.properties.extend(update);
            state.updated_at = Some(Local::now());
            state.generation += 1;
        });
    }

    fn read_info(&self) -> std::sync::RwLockReadGuard<'_, DeviceInfo> {
        self.info.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl PartialEq for Device {
    fn eq(&self, other: &Self) -> bool {
        self.address == other.address
    }
}

impl Eq for Device {}

/// Wait up to `limit` for the next state update seen by `rx`.
pub async fn wait_for_update(rx: &mut StateReceiver, limit: Duration) -> bool {
    matches!(timeout(limit, rx.changed()).await, Ok(Ok(())))
}

/// Composite group id: segment key plus the bridge-assigned numeric id (`"1-5"`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(into = "String")]
pub struct GroupId {
    pub segment: String,
    pub id: u32,
}

impl GroupId {
    pub fn new(base_topic: &str, id: u32) -> Self {
        Self {
            segment: segment_key(base_topic).to_string(),
            id,
        }
    }
}

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.segment, self.id)
    }
}

impl From<GroupId> for String {
    fn from(id: GroupId) -> Self {
        id.to_string()
    }
}

impl FromStr for GroupId {
    type Err = LightsError;

    fn from_str(s: &str) -> Result<Self> {
        let (segment, id) = s
            .rsplit_once('-')
            .ok_or_else(|| LightsError::config(format!("invalid group id: {s}")))?;
        let id = id
            .parse::<u32>()
            .map_err(|_| LightsError::config(format!("invalid group id: {s}")))?;
        if segment.is_empty() {
            return Err(LightsError::config(format!("invalid group id: {s}")));
        }
        Ok(Self {
            segment: segment.to_string(),
            id,
        })
    }
}

impl<'de> Deserialize<'de> for GroupId {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Short key identifying a segment inside group ids: the part of the base
/// topic after its last `-` or `/` (`zigbee2mqtt-1` gives `1`).
pub fn segment_key(base_topic: &str) -> &str {
    match base_topic.rfind(['-', '/']) {
        Some(pos) if pos + 1 < base_topic.len() => &base_topic[pos + 1..],
        _ => base_topic,
    }
}

/// A `bridge/groups` entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupInfo {
    pub id: u32,
    pub friendly_name: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// A device group on one segment.
#[derive(Debug, Clone, PartialEq)]
pub struct Group {
    pub base_topic: String,
    pub id: GroupId,
    pub friendly_name: String,
    pub extra: Map<String, Value>,
}

impl Group {
    pub fn new(base_topic: &str, info: GroupInfo) -> Self {
        Self {
            base_topic: base_topic.to_string(),
            id: GroupId::new(base_topic, info.id),
            friendly_name: info.friendly_name,
            extra: info.extra,
        }
    }

    /// Apply a newer snapshot entry: present fields overwrite, absent ones are kept.
    pub fn merge(&mut self, info: GroupInfo) {
        self.friendly_name = info.friendly_name;
        self.extra.extend(info.extra);
    }
}
