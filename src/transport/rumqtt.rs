// MIT License - Copyright (c) 2026 Peter Wright
// rumqttc-backed broker link and its event loop

use std::sync::{Arc, Mutex};

use rumqttc::{
    AsyncClient, ConnectReturnCode, ConnectionError, Event, EventLoop, MqttOptions, Outgoing, Packet,
};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration};
use tracing::{debug, error, info};

use crate::config::MqttConfig;
use crate::error::Result;
use crate::transport::client::WeakMqttClient;
use crate::transport::{BrokerLink, LinkError, QoS};

/// Delay before polling again after an event loop error; rumqttc reconnects on the next poll.
const RECONNECT_BACKOFF: Duration = Duration::from_secs(1);

/// Broker link over a rumqttc [`AsyncClient`]. Owns the event loop task
/// until it is handed over by [`BrokerLink::take_driver`].
pub struct RumqttLink {
    client: AsyncClient,
    event_loop: Mutex<Option<JoinHandle<()>>>,
}

/// Create the rumqttc client and spawn its event loop on a dedicated task.
pub(crate) fn open(config: &MqttConfig, client: WeakMqttClient) -> Result<Arc<dyn BrokerLink>> {
    let mut options = MqttOptions::new(&config.client_id, &config.host, config.port);
    options.set_keep_alive(config.keep_alive);
    if let Some(username) = &config.username {
        options.set_credentials(username, config.password.clone().unwrap_or_default());
    }

    let (async_client, eventloop) = AsyncClient::new(options, config.request_capacity);
    let event_loop = tokio::spawn(run_event_loop(eventloop, client));

    Ok(Arc::new(RumqttLink {
        client: async_client,
        event_loop: Mutex::new(Some(event_loop)),
    }))
}

async fn run_event_loop(mut eventloop: EventLoop, client: WeakMqttClient) {
    loop {
        let event = eventloop.poll().await;
        let Some(client) = client.upgrade() else {
            debug!("MQTT client dropped, stopping event loop");
            return;
        };

        match event {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                if ack.code == ConnectReturnCode::Success {
                    client.handle_connack(Ok(()));
                } else {
                    client.handle_connack(Err(format!("{:?}", ack.code)));
                }
            }
            Ok(Event::Incoming(Packet::Publish(msg))) => {
                let payload = String::from_utf8_lossy(&msg.payload);
                client.dispatch(&msg.topic, &payload);
            }
            Ok(Event::Incoming(Packet::Disconnect)) => {
                info!("MQTT: broker sent disconnect");
                client.handle_disconnect();
            }
            // The packet is flushed before the event is reported.
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                debug!("MQTT: disconnect sent, stopping event loop");
                return;
            }
            Ok(_) => {}
            Err(ConnectionError::ConnectionRefused(code)) => {
                error!("MQTT connection refused: {code:?}");
                client.handle_connack(Err(format!("{code:?}")));
                drop(client);
                sleep(RECONNECT_BACKOFF).await;
            }
            Err(e) => {
                error!("MQTT event loop error: {e}");
                client.handle_disconnect();
                drop(client);
                sleep(RECONNECT_BACKOFF).await;
            }
        }
    }
}

impl BrokerLink for RumqttLink {
    fn publish(&self, topic: &str, qos: QoS, retain: bool, payload: Vec<u8>) -> std::result::Result<(), LinkError> {
        self.client
            .try_publish(topic, qos, retain, payload)
            .map_err(|e| LinkError(e.to_string()))
    }

    fn subscribe(&self, topic: &str, qos: QoS) -> std::result::Result<(), LinkError> {
        self.client
            .try_subscribe(topic, qos)
            .map_err(|e| LinkError(e.to_string()))
    }

    fn unsubscribe(&self, topic: &str) -> std::result::Result<(), LinkError> {
        self.client
            .try_unsubscribe(topic)
            .map_err(|e| LinkError(e.to_string()))
    }

    fn disconnect(&self) -> std::result::Result<(), LinkError> {
        self.client
            .try_disconnect()
            .map_err(|e| LinkError(e.to_string()))
    }

    fn take_driver(&self) -> Option<JoinHandle<()>> {
        self.event_loop
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
    }
}

impl Drop for RumqttLink {
    fn drop(&mut self) {
        let slot = self
            .event_loop
            .get_mut()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(event_loop) = slot.take() {
            event_loop.abort();
        }
    }
}
