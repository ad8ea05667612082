// MIT License - Copyright (c) 2026 Peter Wright
// In-memory directory of zigbee2mqtt devices and groups

//! Device registry.
//!
//! Discovery snapshots (`<base>/bridge/devices`, `<base>/bridge/groups`) and
//! per-device state messages (`<base>/<name>`) are merged into one model
//! shared by every segment. The registry is the only writer; readers get
//! `Arc<Device>` handles that stay valid and current for the process lifetime.

mod bridge;
pub mod command;
pub mod device;

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::{Arc, RwLock, Weak};

use futures::future::join_all;
use serde_json::{Map, Value};
use tokio::sync::Notify;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::constants::{
    DISCOVERY_TIMEOUT, GROUP_PROBE_ROUNDS, PROBE_ATTEMPTS, PROBE_TIMEOUT, VERIFY_ATTEMPTS,
    VERIFY_TIMEOUT,
};
use crate::error::{LightsError, Result};
use crate::transport::{MqttClient, QoS};

pub use command::{CommandTarget, SetCommand};
pub use device::{
    segment_key, wait_for_update, Device, DeviceInfo, DeviceRole, DeviceState, Group, GroupId,
    GroupInfo, IeeeAddress, StateReceiver,
};

use bridge::SubscriptionGuard;
use command::{GetRequest, GroupMemberRequest, PermitJoinRequest};

struct Inner {
    client: MqttClient,
    base_topics: Vec<String>,
    devices: RwLock<HashMap<IeeeAddress, Arc<Device>>>,
    /// Per segment: friendly name to address.
    names: RwLock<HashMap<String, HashMap<String, IeeeAddress>>>,
    groups: RwLock<HashMap<GroupId, Group>>,
    initialized: tokio::sync::Mutex<bool>,
}

/// Shared handle to the device registry.
#[derive(Clone)]
pub struct DeviceRegistry {
    inner: Arc<Inner>,
}

impl DeviceRegistry {
    pub fn new(client: MqttClient, base_topics: Vec<String>) -> Self {
        Self {
            inner: Arc::new(Inner {
                client,
                base_topics,
                devices: RwLock::new(HashMap::new()),
                names: RwLock::new(HashMap::new()),
                groups: RwLock::new(HashMap::new()),
                initialized: tokio::sync::Mutex::new(false),
            }),
        }
    }

    pub fn client(&self) -> &MqttClient {
        &self.inner.client
    }

    /// Base topics of every configured segment.
    pub fn segments(&self) -> &[String] {
        &self.inner.base_topics
    }

    /// Subscribe to discovery and state topics of every segment and wait for
    /// the first device and group snapshots.
    ///
    /// Runs once; later calls return immediately. On failure every
    /// subscription made so far is removed again, so a retry starts clean.
    pub async fn initialize(&self) -> Result<()> {
        let mut initialized = self.inner.initialized.lock().await;
        if *initialized {
            return Ok(());
        }

        let mut subscriptions = Vec::new();

        for base_topic in &self.inner.base_topics {
            info!("Discovering devices on {base_topic}");
            let weak = Arc::downgrade(&self.inner);
            let segment = base_topic.clone();
            let devices_topic = format!("{base_topic}/bridge/devices");
            let devices = self.discover(&devices_topic, move |_, payload| {
                with_inner(&weak, |inner| inner.apply_device_snapshot(&segment, payload))
            });
            subscriptions.push(devices.await?);

            let weak = Arc::downgrade(&self.inner);
            let segment = base_topic.clone();
            let groups_topic = format!("{base_topic}/bridge/groups");
            let groups = self.discover(&groups_topic, move |topic, payload| {
                with_inner(&weak, |inner| inner.apply_group_snapshot(&segment, topic, payload))
            });
            subscriptions.push(groups.await?);

            let weak = Arc::downgrade(&self.inner);
            let segment = base_topic.clone();
            subscriptions.push(SubscriptionGuard::subscribe(
                &self.inner.client,
                format!("{base_topic}/+"),
                move |topic, payload| with_inner(&weak, |inner| inner.apply_state(&segment, topic, payload)),
            )?);

            info!(
                "Segment {base_topic}: {} devices, {} groups",
                self.inner.segment_device_count(base_topic),
                self.inner.segment_group_count(base_topic)
            );
        }

        subscriptions.into_iter().for_each(SubscriptionGuard::keep);
        *initialized = true;
        Ok(())
    }

    /// Subscribe `apply` to a snapshot topic and wait for its first successful run.
    async fn discover<F>(&self, topic: &str, apply: F) -> Result<SubscriptionGuard>
    where
        F: Fn(&str, &str) -> Result<bool> + Send + Sync + 'static,
    {
        let received = Arc::new(Notify::new());
        let signal = received.clone();
        let guard = SubscriptionGuard::subscribe(
            &self.inner.client,
            topic.to_string(),
            move |topic, payload| {
                if apply(topic, payload)? {
                    signal.notify_one();
                }
                Ok(())
            },
        )?;

        if timeout(DISCOVERY_TIMEOUT, received.notified()).await.is_err() {
            error!("No snapshot received on {topic} within timeout");
            return Err(LightsError::DiscoveryTimeout {
                topic: topic.to_string(),
            });
        }
        Ok(guard)
    }

    pub fn device(&self, address: &IeeeAddress) -> Result<Arc<Device>> {
        read(&self.inner.devices)
            .get(address)
            .cloned()
            .ok_or_else(|| LightsError::UnknownDevice(address.to_string()))
    }

    pub fn devices(&self, addresses: &[IeeeAddress]) -> Result<Vec<Arc<Device>>> {
        addresses.iter().map(|a| self.device(a)).collect()
    }

    pub fn device_by_name(&self, base_topic: &str, name: &str) -> Option<Arc<Device>> {
        let address = read(&self.inner.names)
            .get(base_topic)
            .and_then(|names| names.get(name))
            .cloned()?;
        read(&self.inner.devices).get(&address).cloned()
    }

    pub fn group(&self, id: &GroupId) -> Result<Group> {
        read(&self.inner.groups)
            .get(id)
            .cloned()
            .ok_or_else(|| LightsError::UnknownGroup(id.to_string()))
    }

    /// Publish one property to a device or group. No verification.
    pub fn set_property<T>(
        &self,
        target: &T,
        property: &str,
        value: Value,
        transition_secs: u32,
    ) -> Result<()>
    where
        T: CommandTarget + ?Sized,
    {
        let command = SetCommand::for_property(property, value, transition_secs);
        self.inner
            .client
            .publish(&target.topic("set"), &command, QoS::AtMostOnce, false)
    }

    /// Set a property and confirm the device reports the requested value.
    ///
    /// Returns `false` when no attempt was confirmed.
    pub async fn set_and_verify_property(
        &self,
        device: &Device,
        property: &str,
        value: Value,
        transition_secs: u32,
    ) -> Result<bool> {
        let name = device.friendly_name();
        for attempt in 1..=VERIFY_ATTEMPTS {
            let mut updates = device.subscribe_state();
            self.set_property(device, property, value.clone(), transition_secs)?;

            if !wait_for_update(&mut updates, VERIFY_TIMEOUT).await {
                error!("Failed to set {property} on {name} within timeout (attempt {attempt})");
                continue;
            }
            if device.property(property).as_ref() == Some(&value) {
                return Ok(true);
            }
            warn!("{name} did not apply {property}={value} (attempt {attempt})");
        }
        Ok(false)
    }

    /// Probe every device concurrently; return the ones that never answered.
    pub async fn unresponsive_devices(&self, devices: &[Arc<Device>]) -> Result<Vec<Arc<Device>>> {
        let probes = join_all(devices.iter().map(|d| self.is_responsive(d))).await;

        let mut unresponsive = Vec::new();
        for (device, probe) in devices.iter().zip(probes) {
            if !probe? {
                unresponsive.push(device.clone());
            }
        }
        Ok(unresponsive)
    }

    async fn is_responsive(&self, device: &Device) -> Result<bool> {
        let mut updates = device.subscribe_state();
        let topic = device.topic("get");
        for _ in 0..PROBE_ATTEMPTS {
            self.inner
                .client
                .publish(&topic, &GetRequest::state(), QoS::AtMostOnce, false)?;
            if wait_for_update(&mut updates, PROBE_TIMEOUT).await {
                return Ok(true);
            }
        }
        warn!(
            "Device {} is unresponsive after {PROBE_ATTEMPTS} attempts",
            device.friendly_name()
        );
        Ok(false)
    }

    /// Find devices that do not hear group broadcasts.
    ///
    /// Each round asks the whole group for its state; a device that reports
    /// in any round is a member. Returns the devices silent in every round.
    pub async fn ungrouped_devices(
        &self,
        group: &Group,
        devices: &[Arc<Device>],
    ) -> Result<Vec<Arc<Device>>> {
        let mut outstanding: Vec<(Arc<Device>, StateReceiver)> = devices
            .iter()
            .map(|d| (d.clone(), d.subscribe_state()))
            .collect();
        if outstanding.is_empty() {
            return Ok(Vec::new());
        }

        let topic = group.topic("get");
        for _ in 0..GROUP_PROBE_ROUNDS {
            self.inner
                .client
                .publish(&topic, &GetRequest::state(), QoS::AtMostOnce, false)?;

            let answered = join_all(
                outstanding
                    .iter_mut()
                    .map(|(_, updates)| wait_for_update(updates, PROBE_TIMEOUT)),
            )
            .await;
            let mut answered = answered.into_iter();
            outstanding.retain(|_| !answered.next().unwrap_or(false));

            if outstanding.is_empty() {
                return Ok(Vec::new());
            }
        }

        let silent: Vec<Arc<Device>> = outstanding.into_iter().map(|(d, _)| d).collect();
        warn!(
            "Devices did not respond to group {} after {GROUP_PROBE_ROUNDS} attempts: {}",
            group.friendly_name,
            silent
                .iter()
                .map(|d| d.friendly_name())
                .collect::<Vec<_>>()
                .join(",")
        );
        Ok(silent)
    }

    /// Ask the bridge to add `device` to `group`.
    pub async fn add_to_group(&self, device: &Device, group: &Group) -> Result<bool> {
        info!("Adding {} to group {}", device.friendly_name(), group.friendly_name);
        let body = GroupMemberRequest {
            group: group.friendly_name.clone(),
            device: device.friendly_name(),
        };
        bridge::request(&self.inner.client, device.base_topic(), "group/members/add", &body).await
    }

    /// Open the network for joining through `device` for `duration_secs`.
    pub async fn permit_join(&self, device: &Device, duration_secs: u32) -> Result<bool> {
        info!("Permitting join via {} for {duration_secs}s", device.friendly_name());
        let body = PermitJoinRequest {
            time: duration_secs,
            device: device.friendly_name(),
        };
        bridge::request(&self.inner.client, device.base_topic(), "permit_join", &body).await
    }
}

impl std::fmt::Debug for DeviceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceRegistry")
            .field("segments", &self.inner.base_topics)
            .field("devices", &read(&self.inner.devices).len())
            .field("groups", &read(&self.inner.groups).len())
            .finish()
    }
}

impl Inner {
    /// Merge a full `bridge/devices` snapshot. Returns whether it was usable.
    fn apply_device_snapshot(&self, base_topic: &str, payload: &str) -> Result<bool> {
        let entries: Vec<Value> = serde_json::from_str(payload)?;

        for entry in entries {
            let Value::Object(entry) = entry else {
                warn!("Ignoring non-object device entry on {base_topic}");
                continue;
            };
            let Some(raw_address) = entry.get("ieee_address").and_then(Value::as_str) else {
                continue;
            };
            let address = match IeeeAddress::parse(raw_address) {
                Ok(address) => address,
                Err(e) => {
                    warn!("Skipping device on {base_topic}: {e}");
                    continue;
                }
            };
            self.upsert_device(base_topic, address, entry);
        }
        Ok(true)
    }

    fn upsert_device(&self, base_topic: &str, address: IeeeAddress, entry: Map<String, Value>) {
        let existing = read(&self.devices).get(&address).cloned();
        let (device, previous_name) = match existing {
            Some(device) => {
                let previous = device.friendly_name();
                device.merge_info(&entry);
                (device, Some(previous))
            }
            None => match serde_json::from_value::<DeviceInfo>(Value::Object(entry)) {
                Ok(info) => {
                    debug!("New device {} ({address}) on {base_topic}", info.friendly_name);
                    let device = Arc::new(Device::new(address.clone(), base_topic, info));
                    write(&self.devices).insert(address.clone(), device.clone());
                    (device, None)
                }
                Err(e) => {
                    warn!("Skipping malformed device {address} on {base_topic}: {e}");
                    return;
                }
            },
        };

        let name = device.friendly_name();
        let mut names = write(&self.names);
        let segment = names.entry(device.base_topic().to_string()).or_default();
        if let Some(previous) = previous_name
            && previous != name
            && segment.get(&previous) == Some(&address)
        {
            info!("Device {address} renamed from {previous} to {name}");
            segment.remove(&previous);
        }
        segment.insert(name, address);
    }

    /// Merge a full `bridge/groups` snapshot. Returns whether it was usable.
    fn apply_group_snapshot(&self, base_topic: &str, topic: &str, payload: &str) -> Result<bool> {
        if !topic.starts_with(base_topic) {
            warn!("Received groups on unexpected topic {topic}, expected prefix {base_topic}");
            return Ok(false);
        }
        let entries: Vec<Value> = serde_json::from_str(payload)?;

        let mut groups = write(&self.groups);
        for entry in entries {
            match serde_json::from_value::<GroupInfo>(entry) {
                Ok(info) => match groups.entry(GroupId::new(base_topic, info.id)) {
                    Entry::Occupied(mut existing) => existing.get_mut().merge(info),
                    Entry::Vacant(slot) => {
                        slot.insert(Group::new(base_topic, info));
                    }
                },
                Err(e) => warn!("Skipping malformed group on {base_topic}: {e}"),
            }
        }
        Ok(true)
    }

    /// Merge one `<base>/<name>` state message into the named device.
    fn apply_state(&self, base_topic: &str, topic: &str, payload: &str) -> Result<()> {
        let Some(name) = topic
            .strip_prefix(base_topic)
            .and_then(|rest| rest.strip_prefix('/'))
        else {
            return Ok(());
        };
        let address = match read(&self.names).get(base_topic).and_then(|n| n.get(name)) {
            Some(address) => address.clone(),
            None => return Ok(()),
        };
        let Some(device) = read(&self.devices).get(&address).cloned() else {
            return Ok(());
        };

        match serde_json::from_str::<Value>(payload)? {
            Value::Object(update) => device.apply_state(update),
            other => debug!("Ignoring non-object state for {name}: {other}"),
        }
        Ok(())
    }

    fn segment_device_count(&self, base_topic: &str) -> usize {
        read(&self.devices)
            .values()
            .filter(|d| d.base_topic() == base_topic)
            .count()
    }

    fn segment_group_count(&self, base_topic: &str) -> usize {
        read(&self.groups)
            .values()
            .filter(|g| g.base_topic == base_topic)
            .count()
    }
}

/// Run `f` against the registry if it is still alive.
fn with_inner<R: Default>(weak: &Weak<Inner>, f: impl FnOnce(&Inner) -> Result<R>) -> Result<R> {
    match weak.upgrade() {
        Some(inner) => f(&inner),
        None => Ok(R::default()),
    }
}

fn read<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MqttConfig;
    use serde_json::json;

    fn registry() -> DeviceRegistry {
        DeviceRegistry::new(
            MqttClient::new(MqttConfig::default()),
            vec!["zigbee2mqtt-1".to_string()],
        )
    }

    fn snapshot() -> String {
        json!([
            {
                "type": "Coordinator",
                "ieee_address": "0x00124b0000000000",
                "network_address": 0,
                "friendly_name": "Coordinator",
                "interview_completed": true,
                "interviewing": false,
                "supported": true
            },
            {
                "type": "Router",
                "ieee_address": "0x00124B0000000001",
                "network_address": 4321,
                "friendly_name": "Kitchen Lamp",
                "interview_completed": true,
                "interviewing": false,
                "supported": true,
                "model_id": "LED1545G12"
            },
            {"friendly_name": "no address"},
            {"ieee_address": "0x00124b0000000009", "friendly_name": "incomplete"}
        ])
        .to_string()
    }

    fn lamp() -> IeeeAddress {
        IeeeAddress::parse("00:12:4b:00:00:00:00:01").unwrap()
    }

    #[test]
    fn test_device_snapshot_merge_is_idempotent() {
        let registry = registry();
        let inner = &registry.inner;
        assert!(inner.apply_device_snapshot("zigbee2mqtt-1", &snapshot()).unwrap());
        let first = registry.device(&lamp()).unwrap().info();

        inner.apply_device_snapshot("zigbee2mqtt-1", &snapshot()).unwrap();
        assert_eq!(registry.device(&lamp()).unwrap().info(), first);
        assert_eq!(read(&inner.devices).len(), 2);
        assert_eq!(read(&inner.names)["zigbee2mqtt-1"].len(), 2);
    }

    #[test]
    fn test_device_rename_updates_name_index() {
        let registry = registry();
        let inner = &registry.inner;
        inner.apply_device_snapshot("zigbee2mqtt-1", &snapshot()).unwrap();
        let renamed = json!([{"ieee_address": "0x00124b0000000001", "friendly_name": "Pantry Lamp"}]);
        inner
            .apply_device_snapshot("zigbee2mqtt-1", &renamed.to_string())
            .unwrap();

        assert!(registry.device_by_name("zigbee2mqtt-1", "Kitchen Lamp").is_none());
        let device = registry.device_by_name("zigbee2mqtt-1", "Pantry Lamp").unwrap();
        assert_eq!(device.address(), &lamp());
        assert_eq!(device.model_id().as_deref(), Some("LED1545G12"));
    }

    #[test]
    fn test_group_snapshot() {
        let registry = registry();
        let payload = json!([{"id": 5, "friendly_name": "Kitchen", "members": []}]).to_string();
        assert!(registry
            .inner
            .apply_group_snapshot("zigbee2mqtt-1", "zigbee2mqtt-1/bridge/groups", &payload)
            .unwrap());

        let group = registry.group(&"1-5".parse().unwrap()).unwrap();
        assert_eq!(group.friendly_name, "Kitchen");
        assert_eq!(group.base_topic, "zigbee2mqtt-1");
        assert!(group.extra.contains_key("members"));
        assert!(matches!(
            registry.group(&"1-6".parse().unwrap()),
            Err(LightsError::UnknownGroup(_))
        ));
    }

    #[test]
    fn test_group_snapshot_merges_into_existing_group() {
        let registry = registry();
        let inner = &registry.inner;
        let first = json!([{"id": 5, "friendly_name": "Kitchen", "members": [], "description": "ceiling"}]);
        inner
            .apply_group_snapshot("zigbee2mqtt-1", "zigbee2mqtt-1/bridge/groups", &first.to_string())
            .unwrap();
        let second = json!([{"id": 5, "friendly_name": "Kitchen Lights", "members": [{"ieee_address": "0x00124b0000000001"}]}]);
        inner
            .apply_group_snapshot("zigbee2mqtt-1", "zigbee2mqtt-1/bridge/groups", &second.to_string())
            .unwrap();

        let group = registry.group(&"1-5".parse().unwrap()).unwrap();
        assert_eq!(group.friendly_name, "Kitchen Lights");
        assert_eq!(group.extra["members"].as_array().unwrap().len(), 1);
        assert_eq!(group.extra["description"], json!("ceiling"));
        assert_eq!(read(&inner.groups).len(), 1);
    }

    #[test]
    fn test_group_snapshot_on_foreign_topic_is_ignored() {
        let registry = registry();
        let payload = json!([{"id": 5, "friendly_name": "Kitchen"}]).to_string();
        assert!(!registry
            .inner
            .apply_group_snapshot("zigbee2mqtt-1", "zigbee2mqtt-2/bridge/groups", &payload)
            .unwrap());
        assert!(read(&registry.inner.groups).is_empty());
    }

    #[test]
    fn test_state_merge() {
        let registry = registry();
        let inner = &registry.inner;
        inner.apply_device_snapshot("zigbee2mqtt-1", &snapshot()).unwrap();

        inner
            .apply_state("zigbee2mqtt-1", "zigbee2mqtt-1/Kitchen Lamp", r#"{"state":"ON","brightness":10}"#)
            .unwrap();
        inner
            .apply_state("zigbee2mqtt-1", "zigbee2mqtt-1/Kitchen Lamp", r#"{"brightness":200}"#)
            .unwrap();
        inner
            .apply_state("zigbee2mqtt-1", "zigbee2mqtt-1/bridge", r#""online""#)
            .unwrap();
        inner
            .apply_state("zigbee2mqtt-1", "zigbee2mqtt-1/Unknown", r#"{"state":"ON"}"#)
            .unwrap();

        let state = registry.device(&lamp()).unwrap().state();
        assert_eq!(state.generation, 2);
        assert_eq!(state.properties.get("state"), Some(&json!("ON")));
        assert_eq!(state.properties.get("brightness"), Some(&json!(200)));
    }

    #[test]
    fn test_unknown_device() {
        let registry = registry();
        assert!(matches!(
            registry.device(&lamp()),
            Err(LightsError::UnknownDevice(_))
        ));
        assert!(registry.devices(&[lamp()]).is_err());
    }
}
