// MIT License - Copyright (c) 2026 Peter Wright
// Lighting control and device health for zigbee2mqtt networks
//
//! # zigbee-lights
//!
//! Drives Zigbee lighting circuits through one or more zigbee2mqtt bridges
//! over MQTT: applies a time-of-day brightness and color temperature
//! schedule to each circuit's group, and repairs circuits whose lights have
//! dropped out of their group or off the network.
//!
//! ## Quick Start
//!
//! ```no_run
//! use zigbee_lights::{DeviceRegistry, LightsConfig, LightsController, MqttClient, MqttConfig};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let client = MqttClient::new(MqttConfig::builder().host("localhost").build());
//!     client.connect().await?;
//!
//!     let registry = DeviceRegistry::new(client.clone(), vec!["zigbee2mqtt-1".to_string()]);
//!     registry.initialize().await?;
//!
//!     let lights: LightsConfig = toml::from_str(&std::fs::read_to_string("lights.toml")?)?;
//!     let controller = LightsController::new(registry, lights)?;
//!     controller.start().await;
//!
//!     tokio::signal::ctrl_c().await?;
//!     controller.shutdown();
//!     client.disconnect().await?;
//!     Ok(())
//! }
//! ```

pub mod brightness;
pub mod circuit;
pub mod config;
pub mod constants;
pub mod error;
pub mod orchestrator;
pub mod registry;
pub mod schedule;
pub mod transport;

// Re-exports for convenience
pub use brightness::{BrightnessCurve, BrightnessCurves, LinearCurve, LuxCurve};
pub use circuit::{Circuit, CircuitConfig, LightConfig, LightsConfig, SwitchConfig, SwitchKind};
pub use config::{parse_mqtt_url, MqttConfig, MqttConfigBuilder};
pub use error::{LightsError, Result};
pub use orchestrator::{CircuitHealth, CircuitLighting, LightsController, TickOutcome};
pub use registry::{Device, DeviceRegistry, Group, GroupId, IeeeAddress};
pub use schedule::{Lighting, Schedule, ScheduleEntry};
pub use transport::{BrokerLink, ConnectionState, MqttClient, QoS};
