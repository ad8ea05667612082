// MIT License - Copyright (c) 2026 Peter Wright
// Device registry against an in-memory zigbee2mqtt bridge

mod common;

use std::sync::Arc;

use serde_json::json;

use common::{FakeBridge, FakeDevice, BASE, GROUP_ID, GROUP_NAME, LAMP, SWITCH};
use zigbee_lights::{Device, DeviceRegistry, GroupId, IeeeAddress, LightsError};

async fn registry_for(bridge: &Arc<FakeBridge>) -> DeviceRegistry {
    let client = bridge.connect().await;
    let registry = DeviceRegistry::new(client, vec![BASE.to_string()]);
    registry.initialize().await.unwrap();
    registry
}

fn device(registry: &DeviceRegistry, ieee: &str) -> Arc<Device> {
    registry.device(&IeeeAddress::parse(ieee).unwrap()).unwrap()
}

#[tokio::test(start_paused = true)]
async fn test_initialize_discovers_devices_and_groups() {
    let bridge = FakeBridge::living_room();
    let registry = registry_for(&bridge).await;

    let lamp = device(&registry, LAMP);
    assert_eq!(lamp.friendly_name(), "Lamp");
    assert_eq!(lamp.base_topic(), BASE);
    assert_eq!(lamp.model_id().as_deref(), Some("LED1545G12"));
    assert_eq!(
        registry.device_by_name(BASE, "Switch").unwrap().address().as_str(),
        "00:12:4b:00:00:00:00:02"
    );
    assert_eq!(lamp.address(), &IeeeAddress::parse(LAMP).unwrap());

    let group = registry.group(&GroupId::new(BASE, GROUP_ID)).unwrap();
    assert_eq!(group.friendly_name, GROUP_NAME);
    assert_eq!(group.id.to_string(), "1-5");
}

#[tokio::test(start_paused = true)]
async fn test_initialize_is_idempotent() {
    let bridge = FakeBridge::living_room();
    let registry = registry_for(&bridge).await;
    let subscribed = bridge.subscribed();

    registry.initialize().await.unwrap();
    assert_eq!(bridge.subscribed(), subscribed);
    assert_eq!(
        subscribed,
        vec![
            format!("{BASE}/bridge/devices"),
            format!("{BASE}/bridge/groups"),
            format!("{BASE}/+"),
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_initialize_times_out_without_snapshot() {
    let bridge = FakeBridge::living_room().without_snapshots();
    let client = bridge.connect().await;
    let registry = DeviceRegistry::new(client, vec![BASE.to_string()]);

    let err = registry.initialize().await.unwrap_err();
    assert!(
        matches!(&err, LightsError::DiscoveryTimeout { topic } if topic == "zigbee2mqtt-1/bridge/devices"),
        "unexpected error: {err}"
    );
}

#[tokio::test(start_paused = true)]
async fn test_initialize_can_be_retried_after_timeout() {
    let bridge = FakeBridge::living_room().without_snapshots();
    let client = bridge.connect().await;
    let registry = DeviceRegistry::new(client, vec![BASE.to_string()]);
    let devices_topic = format!("{BASE}/bridge/devices");

    assert!(registry.initialize().await.is_err());
    assert_eq!(bridge.unsubscribed(), vec![devices_topic.clone()]);
    assert!(registry.client().subscribed_patterns().is_empty());

    bridge.serve_snapshots(true);
    registry.initialize().await.unwrap();
    assert_eq!(
        bridge.subscribed().iter().filter(|t| **t == devices_topic).count(),
        2
    );
    assert_eq!(device(&registry, LAMP).friendly_name(), "Lamp");
    assert_eq!(registry.client().subscribed_patterns().len(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_state_updates_reach_devices() {
    let bridge = FakeBridge::living_room();
    let registry = registry_for(&bridge).await;

    registry
        .client()
        .dispatch(&format!("{BASE}/Lamp"), r#"{"state":"ON","brightness":40}"#);
    registry
        .client()
        .dispatch(&format!("{BASE}/Lamp"), r#"{"brightness":90}"#);

    let lamp = device(&registry, LAMP);
    assert_eq!(lamp.property("state"), Some(json!("ON")));
    assert_eq!(lamp.property("brightness"), Some(json!(90)));
    assert!(lamp.state().updated_at.is_some());
}

#[tokio::test(start_paused = true)]
async fn test_set_and_verify_confirms_echoed_value() {
    let bridge = FakeBridge::living_room();
    let registry = registry_for(&bridge).await;
    let switch = device(&registry, SWITCH);

    let ok = registry
        .set_and_verify_property(&switch, "smartBulbMode", json!("Disabled"), 0)
        .await
        .unwrap();
    assert!(ok);
    assert_eq!(bridge.sets_of("Switch", "smartBulbMode"), vec![json!("Disabled")]);
    assert_eq!(switch.property("smartBulbMode"), Some(json!("Disabled")));
}

#[tokio::test(start_paused = true)]
async fn test_set_and_verify_gives_up_after_three_attempts() {
    let bridge = FakeBridge::new(vec![
        FakeDevice::new(LAMP, "Lamp", "LED1545G12").offline(),
        FakeDevice::new(SWITCH, "Switch", "VZM31-SN").ignoring("state"),
    ]);
    let registry = registry_for(&bridge).await;

    // Answers, but with the old value.
    let switch = device(&registry, SWITCH);
    let ok = registry
        .set_and_verify_property(&switch, "state", json!("OFF"), 0)
        .await
        .unwrap();
    assert!(!ok);
    assert_eq!(bridge.sets_of("Switch", "state").len(), 3);

    // Never answers.
    let lamp = device(&registry, LAMP);
    let ok = registry
        .set_and_verify_property(&lamp, "state", json!("OFF"), 0)
        .await
        .unwrap();
    assert!(!ok);
    assert_eq!(bridge.sets_of("Lamp", "state").len(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_set_property_uses_cluster_commands_for_lighting() {
    let bridge = FakeBridge::living_room();
    let registry = registry_for(&bridge).await;
    let group = registry.group(&GroupId::new(BASE, GROUP_ID)).unwrap();

    registry
        .set_property(&group, "brightness", json!(128), 30)
        .unwrap();
    registry.set_property(&group, "state", json!("ON"), 30).unwrap();

    let sent = bridge.published_to(&format!("{BASE}/{GROUP_NAME}/set"));
    assert_eq!(
        sent,
        vec![
            json!({"command": {
                "cluster": "genLevelCtrl",
                "command": "moveToLevel",
                "payload": {"level": 128, "transtime": 300}
            }}),
            json!({"state": "ON"}),
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_unresponsive_devices_are_probed_concurrently() {
    let bridge = FakeBridge::new(vec![
        FakeDevice::new(LAMP, "Lamp", "LED1545G12").offline(),
        FakeDevice::new(SWITCH, "Switch", "VZM31-SN"),
    ]);
    let registry = registry_for(&bridge).await;
    let devices = vec![device(&registry, LAMP), device(&registry, SWITCH)];

    let started = tokio::time::Instant::now();
    let unresponsive = registry.unresponsive_devices(&devices).await.unwrap();

    assert_eq!(unresponsive.len(), 1);
    assert_eq!(unresponsive[0].friendly_name(), "Lamp");
    assert_eq!(bridge.published_to(&format!("{BASE}/Lamp/get")).len(), 24);
    assert_eq!(bridge.published_to(&format!("{BASE}/Switch/get")).len(), 1);
    // 24 probes of 5 seconds, not 25.
    assert_eq!(started.elapsed().as_secs(), 120);
}

#[tokio::test(start_paused = true)]
async fn test_ungrouped_devices_empty_when_all_answer() {
    let bridge = FakeBridge::living_room();
    let registry = registry_for(&bridge).await;
    let group = registry.group(&GroupId::new(BASE, GROUP_ID)).unwrap();
    let devices = vec![device(&registry, LAMP), device(&registry, SWITCH)];

    let ungrouped = registry.ungrouped_devices(&group, &devices).await.unwrap();
    assert!(ungrouped.is_empty());
    assert_eq!(bridge.published_to(&format!("{BASE}/{GROUP_NAME}/get")).len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_ungrouped_devices_returns_silent_members() {
    let bridge = FakeBridge::new(vec![
        FakeDevice::new(LAMP, "Lamp", "LED1545G12").ungrouped(),
        FakeDevice::new(SWITCH, "Switch", "VZM31-SN"),
    ]);
    let registry = registry_for(&bridge).await;
    let group = registry.group(&GroupId::new(BASE, GROUP_ID)).unwrap();
    let devices = vec![device(&registry, LAMP), device(&registry, SWITCH)];

    let ungrouped = registry.ungrouped_devices(&group, &devices).await.unwrap();
    assert_eq!(ungrouped.len(), 1);
    assert_eq!(ungrouped[0].friendly_name(), "Lamp");
    assert_eq!(bridge.published_to(&format!("{BASE}/{GROUP_NAME}/get")).len(), 120);
}

#[tokio::test(start_paused = true)]
async fn test_add_to_group_removes_response_subscription() {
    let bridge = FakeBridge::new(vec![
        FakeDevice::new(LAMP, "Lamp", "LED1545G12").ungrouped(),
        FakeDevice::new(SWITCH, "Switch", "VZM31-SN"),
    ]);
    let registry = registry_for(&bridge).await;
    let group = registry.group(&GroupId::new(BASE, GROUP_ID)).unwrap();
    let lamp = device(&registry, LAMP);

    assert!(registry.add_to_group(&lamp, &group).await.unwrap());
    assert!(bridge.device("Lamp").in_group);

    let response_topic = format!("{BASE}/bridge/response/group/members/add");
    assert!(!registry.client().subscribed_patterns().contains(&response_topic));
    assert_eq!(bridge.unsubscribed(), vec![response_topic]);

    let requests = bridge.published_to(&format!("{BASE}/bridge/request/group/members/add"));
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0]["group"], json!(GROUP_NAME));
    assert_eq!(requests[0]["device"], json!("Lamp"));
}

#[tokio::test(start_paused = true)]
async fn test_permit_join_request_carries_transaction() {
    let bridge = FakeBridge::living_room();
    let registry = registry_for(&bridge).await;
    let switch = device(&registry, SWITCH);

    assert!(registry.permit_join(&switch, 120).await.unwrap());

    let requests = bridge.published_to(&format!("{BASE}/bridge/request/permit_join"));
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0]["time"], json!(120));
    assert_eq!(requests[0]["device"], json!("Switch"));
    let transaction = requests[0]["transaction"].as_u64().unwrap();
    assert!((1000..=9999).contains(&transaction));
}

#[tokio::test(start_paused = true)]
async fn test_bridge_request_fails_after_three_silent_attempts() {
    let bridge = FakeBridge::living_room().without_bridge_responses();
    let registry = registry_for(&bridge).await;
    let switch = device(&registry, SWITCH);

    let started = tokio::time::Instant::now();
    assert!(!registry.permit_join(&switch, 120).await.unwrap());
    assert_eq!(started.elapsed().as_secs(), 45);

    let response_topic = format!("{BASE}/bridge/response/permit_join");
    assert_eq!(
        bridge.published_to(&format!("{BASE}/bridge/request/permit_join")).len(),
        3
    );
    assert_eq!(bridge.unsubscribed(), vec![response_topic.clone(); 3]);
    assert!(!registry.client().subscribed_patterns().contains(&response_topic));
}

#[tokio::test(start_paused = true)]
async fn test_unknown_device_and_group() {
    let bridge = FakeBridge::living_room();
    let registry = registry_for(&bridge).await;

    let missing = IeeeAddress::parse("0xffffffffffffffff").unwrap();
    assert!(matches!(registry.device(&missing), Err(LightsError::UnknownDevice(_))));
    assert!(matches!(
        registry.group(&GroupId::new(BASE, 99)),
        Err(LightsError::UnknownGroup(_))
    ));
}
