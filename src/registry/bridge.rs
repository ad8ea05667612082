// MIT License - Copyright (c) 2026 Peter Wright
// Bridge request/response correlation

use std::sync::Arc;

use rand::Rng;
use serde::Serialize;
use tokio::sync::Notify;
use tokio::time::timeout;
use tracing::{debug, error, warn};

use crate::constants::{BRIDGE_ATTEMPTS, BRIDGE_TIMEOUT, TRANSACTION_MAX, TRANSACTION_MIN};
use crate::error::Result;
use crate::registry::command::{BridgeRequest, BridgeResponse};
use crate::transport::{MqttClient, QoS, SubscriptionId};

/// One outstanding bridge request, alive for a single attempt.
#[derive(Debug)]
struct PendingRequest {
    base_topic: String,
    transaction: u32,
    responded: Notify,
}

impl PendingRequest {
    fn new(base_topic: &str) -> Self {
        Self {
            base_topic: base_topic.to_string(),
            transaction: rand::thread_rng().gen_range(TRANSACTION_MIN..=TRANSACTION_MAX),
            responded: Notify::new(),
        }
    }

    fn on_response(&self, payload: &str) -> Result<()> {
        let response: BridgeResponse = serde_json::from_str(payload)?;
        if !response.matches(self.transaction) {
            return Ok(());
        }
        if response.is_error() {
            error!(
                "Bridge {} rejected transaction {}: {}",
                self.base_topic,
                self.transaction,
                response.error.as_deref().unwrap_or("unknown error")
            );
        }
        self.responded.notify_one();
        Ok(())
    }
}

/// A subscription that is removed again when the guard goes out of scope,
/// unless it has been kept.
pub(crate) struct SubscriptionGuard {
    client: MqttClient,
    topic: String,
    id: SubscriptionId,
    kept: bool,
}

impl SubscriptionGuard {
    pub(crate) fn subscribe<F>(client: &MqttClient, topic: String, callback: F) -> Result<Self>
    where
        F: Fn(&str, &str) -> Result<()> + Send + Sync + 'static,
    {
        let id = client.subscribe(&topic, QoS::AtMostOnce, callback)?;
        Ok(Self {
            client: client.clone(),
            topic,
            id,
            kept: false,
        })
    }

    /// Leave the subscription in place for the rest of the client's life.
    pub(crate) fn keep(mut self) {
        self.kept = true;
    }
}

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        if self.kept {
            return;
        }
        if let Err(e) = self.client.unsubscribe(&self.topic, self.id) {
            warn!("Failed to remove subscription on {}: {e}", self.topic);
        }
    }
}

/// Send `<base>/bridge/request/<op>` and wait for the matching response.
///
/// Each attempt uses a fresh transaction id and its own response
/// subscription. Returns `false` once every attempt has timed out.
pub(crate) async fn request<T: Serialize>(
    client: &MqttClient,
    base_topic: &str,
    op: &str,
    body: &T,
) -> Result<bool> {
    let request_topic = format!("{base_topic}/bridge/request/{op}");
    let response_topic = format!("{base_topic}/bridge/response/{op}");

    for attempt in 1..=BRIDGE_ATTEMPTS {
        let pending = Arc::new(PendingRequest::new(base_topic));
        let callback_pending = pending.clone();
        let _guard = SubscriptionGuard::subscribe(client, response_topic.clone(), move |_, payload| {
            callback_pending.on_response(payload)
        })?;

        debug!(
            "Bridge request {op} on {base_topic} (attempt {attempt}, transaction {})",
            pending.transaction
        );
        client.publish(
            &request_topic,
            &BridgeRequest {
                body,
                transaction: pending.transaction,
            },
            QoS::AtMostOnce,
            false,
        )?;

        if timeout(BRIDGE_TIMEOUT, pending.responded.notified()).await.is_ok() {
            return Ok(true);
        }
        warn!("No response to bridge request {op} on {base_topic} (attempt {attempt})");
    }

    error!("Bridge request {op} on {base_topic} failed after {BRIDGE_ATTEMPTS} attempts");
    Ok(false)
}
