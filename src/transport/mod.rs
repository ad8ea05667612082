// MIT License - Copyright (c) 2026 Peter Wright
// Broker transport

pub mod client;
pub mod rumqtt;
pub mod topic;

pub use client::{ConnectionState, MqttClient, SubscriptionId};
pub use rumqttc::QoS;
pub use topic::TopicFilter;

use tokio::task::JoinHandle;

/// Rejection reported by a broker link for a single request.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{0}")]
pub struct LinkError(pub String);

/// The raw, non-blocking request side of a broker connection.
///
/// Implementations queue the request and return immediately; inbound traffic
/// is fed back through [`MqttClient::dispatch`] and the connection
/// callbacks by whoever drives the connection.
pub trait BrokerLink: Send + Sync {
    fn publish(&self, topic: &str, qos: QoS, retain: bool, payload: Vec<u8>) -> Result<(), LinkError>;

    fn subscribe(&self, topic: &str, qos: QoS) -> Result<(), LinkError>;

    fn unsubscribe(&self, topic: &str) -> Result<(), LinkError>;

    fn disconnect(&self) -> Result<(), LinkError>;

    /// Hand over the task driving the connection, if the link owns one.
    ///
    /// After [`disconnect`](Self::disconnect) the driver ends once the
    /// DISCONNECT packet has been written, so callers can await it.
    fn take_driver(&self) -> Option<JoinHandle<()>> {
        None
    }
}
