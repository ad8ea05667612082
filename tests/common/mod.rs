// MIT License - Copyright (c) 2026 Peter Wright
// In-memory zigbee2mqtt bridge used by the integration tests

#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use serde_json::{json, Map, Value};

use zigbee_lights::transport::client::WeakMqttClient;
use zigbee_lights::transport::{BrokerLink, LinkError};
use zigbee_lights::{MqttClient, MqttConfig, QoS};

pub const BASE: &str = "zigbee2mqtt-1";
pub const LAMP: &str = "0x00124b0000000001";
pub const SWITCH: &str = "0x00124b0000000002";
pub const GROUP_ID: u32 = 5;
pub const GROUP_NAME: &str = "Living Room";

#[derive(Debug, Clone)]
pub struct FakeDevice {
    pub ieee: String,
    pub name: String,
    pub model: String,
    /// Answers requests at all.
    pub online: bool,
    /// Hears group broadcasts.
    pub in_group: bool,
    /// Properties the device acknowledges but never applies.
    pub ignored: HashSet<String>,
    pub state: Map<String, Value>,
}

impl FakeDevice {
    pub fn new(ieee: &str, name: &str, model: &str) -> Self {
        Self {
            ieee: ieee.to_string(),
            name: name.to_string(),
            model: model.to_string(),
            online: true,
            in_group: true,
            ignored: HashSet::new(),
            state: Map::new(),
        }
    }

    pub fn offline(mut self) -> Self {
        self.online = false;
        self
    }

    pub fn ungrouped(mut self) -> Self {
        self.in_group = false;
        self
    }

    pub fn ignoring(mut self, property: &str) -> Self {
        self.ignored.insert(property.to_string());
        self
    }

    fn snapshot_entry(&self, network_address: usize) -> Value {
        json!({
            "type": "Router",
            "ieee_address": self.ieee,
            "network_address": network_address,
            "friendly_name": self.name,
            "interview_completed": true,
            "interviewing": false,
            "supported": true,
            "power_source": "Mains (single phase)",
            "model_id": self.model,
            "definition": {"model": self.model}
        })
    }
}

#[derive(Debug, Default)]
struct State {
    devices: Vec<FakeDevice>,
    groups: Vec<(u32, String)>,
    publishes: Vec<(String, Value)>,
    subscribed: Vec<String>,
    unsubscribed: Vec<String>,
    send_snapshots: bool,
    answer_bridge: bool,
    permit_join_revives: bool,
    /// Publishes to these topics fail at the link.
    rejected: Vec<String>,
    /// Publishes to these topics panic inside the link.
    faulty: Vec<String>,
}

/// Broker link that plays the part of one zigbee2mqtt bridge.
///
/// Everything is answered synchronously from inside the publish or
/// subscribe call, the way retained messages and fast devices arrive.
pub struct FakeBridge {
    state: Mutex<State>,
    client: Mutex<Option<WeakMqttClient>>,
}

impl FakeBridge {
    pub fn new(devices: Vec<FakeDevice>) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(State {
                devices,
                groups: vec![(GROUP_ID, GROUP_NAME.to_string())],
                send_snapshots: true,
                answer_bridge: true,
                ..Default::default()
            }),
            client: Mutex::new(None),
        })
    }

    /// Lamp and hardwired switch, both healthy.
    pub fn living_room() -> Arc<Self> {
        Self::new(vec![
            FakeDevice::new(LAMP, "Lamp", "LED1545G12"),
            FakeDevice::new(SWITCH, "Switch", "VZM31-SN"),
        ])
    }

    pub fn without_snapshots(self: Arc<Self>) -> Arc<Self> {
        self.lock().send_snapshots = false;
        self
    }

    pub fn without_bridge_responses(self: Arc<Self>) -> Arc<Self> {
        self.lock().answer_bridge = false;
        self
    }

    /// Offline devices come back when joining is permitted.
    pub fn reviving_on_permit_join(self: Arc<Self>) -> Arc<Self> {
        self.lock().permit_join_revives = true;
        self
    }

    pub fn rejecting_publishes_to(self: Arc<Self>, topic: &str) -> Arc<Self> {
        self.lock().rejected.push(topic.to_string());
        self
    }

    pub fn panicking_on_publish_to(self: Arc<Self>, topic: &str) -> Arc<Self> {
        self.lock().faulty.push(topic.to_string());
        self
    }

    /// Start or stop answering snapshot subscriptions.
    pub fn serve_snapshots(&self, enabled: bool) {
        self.lock().send_snapshots = enabled;
    }

    /// Connect `client` through this bridge.
    pub async fn connect(self: &Arc<Self>) -> MqttClient {
        let client = MqttClient::new(MqttConfig::default());
        let link = self.clone();
        client
            .connect_with(move |weak| {
                *link.client.lock().unwrap() = Some(weak.clone());
                weak.upgrade().unwrap().handle_connack(Ok(()));
                Ok(link as Arc<dyn BrokerLink>)
            })
            .await
            .unwrap();
        client
    }

    pub fn publishes(&self) -> Vec<(String, Value)> {
        self.lock().publishes.clone()
    }

    /// Payloads published to exactly `topic`.
    pub fn published_to(&self, topic: &str) -> Vec<Value> {
        self.lock()
            .publishes
            .iter()
            .filter(|(t, _)| t == topic)
            .map(|(_, p)| p.clone())
            .collect()
    }

    /// Values of `property` sent to a device's `/set` topic, in order.
    pub fn sets_of(&self, device: &str, property: &str) -> Vec<Value> {
        self.published_to(&format!("{BASE}/{device}/set"))
            .into_iter()
            .filter_map(|p| p.get(property).cloned())
            .collect()
    }

    pub fn subscribed(&self) -> Vec<String> {
        self.lock().subscribed.clone()
    }

    pub fn unsubscribed(&self) -> Vec<String> {
        self.lock().unsubscribed.clone()
    }

    pub fn device(&self, name: &str) -> FakeDevice {
        self.lock()
            .devices
            .iter()
            .find(|d| d.name == name)
            .cloned()
            .unwrap()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    fn deliver(&self, messages: Vec<(String, String)>) {
        let client = self.client.lock().unwrap().as_ref().and_then(|w| w.upgrade());
        if let Some(client) = client {
            for (topic, payload) in messages {
                client.dispatch(&topic, &payload);
            }
        }
    }

    fn handle_publish(state: &mut State, topic: &str, payload: &Value) -> Vec<(String, String)> {
        let Some(rest) = topic.strip_prefix(&format!("{BASE}/")) else {
            return Vec::new();
        };

        if let Some(op) = rest.strip_prefix("bridge/request/") {
            return Self::handle_bridge_request(state, op, payload);
        }

        let Some((name, action)) = rest.rsplit_once('/') else {
            return Vec::new();
        };
        let group = state
            .groups
            .iter()
            .find(|(_, n)| n == name)
            .map(|(id, _)| *id);

        match (action, group) {
            ("get", Some(_)) => state
                .devices
                .iter()
                .filter(|d| d.online && d.in_group)
                .map(state_message)
                .collect(),
            ("get", None) => state
                .devices
                .iter()
                .filter(|d| d.name == name && d.online)
                .map(state_message)
                .collect(),
            ("set", None) => {
                let Some(device) = state.devices.iter_mut().find(|d| d.name == name) else {
                    return Vec::new();
                };
                if !device.online {
                    return Vec::new();
                }
                if let Some(update) = payload.as_object() {
                    for (key, value) in update {
                        if key != "command" && !device.ignored.contains(key) {
                            device.state.insert(key.clone(), value.clone());
                        }
                    }
                }
                vec![state_message(device)]
            }
            _ => Vec::new(),
        }
    }

    fn handle_bridge_request(state: &mut State, op: &str, payload: &Value) -> Vec<(String, String)> {
        if !state.answer_bridge {
            return Vec::new();
        }
        let device = payload.get("device").and_then(Value::as_str).unwrap_or_default();
        match op {
            "group/members/add" => {
                if let Some(d) = state.devices.iter_mut().find(|d| d.name == device) {
                    d.in_group = true;
                }
            }
            "permit_join" => {
                if state.permit_join_revives {
                    for d in state.devices.iter_mut() {
                        d.online = true;
                    }
                }
            }
            _ => {}
        }

        let mut data = payload.as_object().cloned().unwrap_or_default();
        let transaction = data.remove("transaction").unwrap_or(Value::Null);
        let response = json!({"data": data, "status": "ok", "transaction": transaction});
        vec![(format!("{BASE}/bridge/response/{op}"), response.to_string())]
    }
}

fn state_message(device: &FakeDevice) -> (String, String) {
    (
        format!("{BASE}/{}", device.name),
        Value::Object(device.state.clone()).to_string(),
    )
}

impl BrokerLink for FakeBridge {
    fn publish(&self, topic: &str, _qos: QoS, _retain: bool, payload: Vec<u8>) -> Result<(), LinkError> {
        let payload: Value = serde_json::from_slice(&payload).map_err(|e| LinkError(e.to_string()))?;
        let messages = {
            let mut state = self.lock();
            if state.rejected.iter().any(|t| t == topic) {
                return Err(LinkError("rejected".to_string()));
            }
            if state.faulty.iter().any(|t| t == topic) {
                drop(state);
                panic!("bridge fault while publishing to {topic}");
            }
            state.publishes.push((topic.to_string(), payload.clone()));
            Self::handle_publish(&mut state, topic, &payload)
        };
        self.deliver(messages);
        Ok(())
    }

    fn subscribe(&self, topic: &str, _qos: QoS) -> Result<(), LinkError> {
        let messages = {
            let mut state = self.lock();
            state.subscribed.push(topic.to_string());
            if !state.send_snapshots {
                Vec::new()
            } else if topic == format!("{BASE}/bridge/devices") {
                let devices: Vec<Value> = state
                    .devices
                    .iter()
                    .enumerate()
                    .map(|(i, d)| d.snapshot_entry(i + 1))
                    .collect();
                vec![(topic.to_string(), Value::Array(devices).to_string())]
            } else if topic == format!("{BASE}/bridge/groups") {
                let groups: Vec<Value> = state
                    .groups
                    .iter()
                    .map(|(id, name)| json!({"id": id, "friendly_name": name, "members": []}))
                    .collect();
                vec![(topic.to_string(), Value::Array(groups).to_string())]
            } else {
                Vec::new()
            }
        };
        self.deliver(messages);
        Ok(())
    }

    fn unsubscribe(&self, topic: &str) -> Result<(), LinkError> {
        self.lock().unsubscribed.push(topic.to_string());
        Ok(())
    }

    fn disconnect(&self) -> Result<(), LinkError> {
        Ok(())
    }
}
