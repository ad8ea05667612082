// MIT License - Copyright (c) 2026 Peter Wright
// Broker client: connection lifecycle, subscriptions and inbound dispatch

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};

use serde::Serialize;
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::config::MqttConfig;
use crate::constants::{CONNECT_TIMEOUT, DISCONNECT_TIMEOUT};
use crate::error::{LightsError, Result};
use crate::transport::topic::TopicFilter;
use crate::transport::{BrokerLink, QoS};

/// Callback invoked for every inbound message whose topic matches the pattern
/// it was registered with. Arguments are `(topic, payload)`.
pub type Callback = Arc<dyn Fn(&str, &str) -> Result<()> + Send + Sync>;

/// Handle identifying one registered callback, used to unsubscribe it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Latest known state of the broker connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connected,
    /// The broker answered the connect request with a failure.
    Refused(String),
}

struct Subscription {
    id: SubscriptionId,
    filter: TopicFilter,
    qos: QoS,
    callback: Callback,
}

struct Shared {
    config: MqttConfig,
    link: RwLock<Option<Arc<dyn BrokerLink>>>,
    /// Dispatch table, in registration order.
    subscriptions: Mutex<Vec<Subscription>>,
    /// Held across the dispatch-table check and the broker request it decides.
    registration: Mutex<()>,
    state: watch::Sender<ConnectionState>,
    connect_lock: tokio::sync::Mutex<()>,
    next_id: AtomicU64,
    connack_count: AtomicU64,
}

/// The process-wide broker connection.
///
/// Cheap to clone; all clones share one connection and one dispatch table.
#[derive(Clone)]
pub struct MqttClient {
    shared: Arc<Shared>,
}

/// Non-owning handle held by the connection driver so that dropping every
/// [`MqttClient`] also ends the driver.
#[derive(Clone)]
pub struct WeakMqttClient {
    shared: Weak<Shared>,
}

impl WeakMqttClient {
    pub fn upgrade(&self) -> Option<MqttClient> {
        self.shared.upgrade().map(|shared| MqttClient { shared })
    }
}

impl MqttClient {
    pub fn new(config: MqttConfig) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            shared: Arc::new(Shared {
                config,
                link: RwLock::new(None),
                subscriptions: Mutex::new(Vec::new()),
                registration: Mutex::new(()),
                state,
                connect_lock: tokio::sync::Mutex::new(()),
                next_id: AtomicU64::new(1),
                connack_count: AtomicU64::new(0),
            }),
        }
    }

    pub fn config(&self) -> &MqttConfig {
        &self.shared.config
    }

    pub fn downgrade(&self) -> WeakMqttClient {
        WeakMqttClient {
            shared: Arc::downgrade(&self.shared),
        }
    }

    /// Open the broker connection and wait for the broker to accept it.
    ///
    /// Only one attempt runs at a time; callers arriving while an attempt is
    /// in flight wait for it, and once a connection exists further calls are
    /// no-ops.
    pub async fn connect(&self) -> Result<()> {
        let config = self.shared.config.clone();
        self.connect_with(move |client| crate::transport::rumqtt::open(&config, client))
            .await
    }

    /// Same as [`connect`](Self::connect), over a link produced by `open`.
    ///
    /// `open` receives a handle to this client so that the link's driver can
    /// report CONNACKs and inbound messages back to it.
    pub async fn connect_with<F>(&self, open: F) -> Result<()>
    where
        F: FnOnce(WeakMqttClient) -> Result<Arc<dyn BrokerLink>>,
    {
        let _guard = self.shared.connect_lock.lock().await;
        if self.current_link().is_some() {
            debug!("Already connected to MQTT broker");
            return Ok(());
        }

        info!(
            "Connecting to MQTT broker at {}:{}",
            self.shared.config.host, self.shared.config.port
        );
        self.shared.state.send_replace(ConnectionState::Disconnected);
        let mut state_rx = self.shared.state.subscribe();

        let link = open(self.downgrade())?;
        self.set_link(Some(link));

        let outcome = timeout(
            CONNECT_TIMEOUT,
            state_rx.wait_for(|state| *state != ConnectionState::Disconnected),
        )
        .await
        .map(|answered| answered.map(|state| state.clone()));

        let state = match outcome {
            Ok(Ok(state)) => state,
            Ok(Err(_)) => ConnectionState::Refused("connection state channel closed".to_string()),
            Err(_) => {
                error!("Failed to connect to MQTT broker within timeout");
                self.set_link(None);
                return Err(LightsError::ConnectionTimeout);
            }
        };

        match state {
            ConnectionState::Connected => Ok(()),
            ConnectionState::Refused(reason) => {
                error!("Failed to connect to MQTT broker: {reason}");
                self.set_link(None);
                Err(LightsError::Connection { reason })
            }
            ConnectionState::Disconnected => {
                self.set_link(None);
                Err(LightsError::ConnectionTimeout)
            }
        }
    }

    /// Politely close the broker connection.
    ///
    /// Waits briefly for the link's driver to send the DISCONNECT packet
    /// before the link is dropped.
    pub async fn disconnect(&self) -> Result<()> {
        let Some(link) = self.current_link() else {
            return Ok(());
        };
        let result = link.disconnect().map_err(|e| LightsError::Connection {
            reason: e.to_string(),
        });
        if result.is_ok()
            && let Some(mut driver) = link.take_driver()
            && timeout(DISCONNECT_TIMEOUT, &mut driver).await.is_err()
        {
            warn!("MQTT event loop did not finish disconnecting in time");
            driver.abort();
        }
        self.set_link(None);
        self.shared.state.send_replace(ConnectionState::Disconnected);
        info!("Disconnected from MQTT broker");
        result
    }

    /// Whether the broker currently considers us connected. Never blocks.
    pub fn is_connected(&self) -> bool {
        *self.shared.state.borrow() == ConnectionState::Connected
    }

    /// Watch connection state transitions.
    pub fn connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    /// Serialize `payload` as JSON and publish it.
    pub fn publish<T>(&self, topic: &str, payload: &T, qos: QoS, retain: bool) -> Result<()>
    where
        T: Serialize + ?Sized,
    {
        let json = serde_json::to_vec(payload)?;
        debug!("Publishing to MQTT topic {topic}: {}", String::from_utf8_lossy(&json));

        let link = self.link()?;
        link.publish(topic, qos, retain, json)
            .map_err(|e| LightsError::Publish {
                topic: topic.to_string(),
                reason: e.to_string(),
            })
    }

    /// Register `callback` for every message whose topic matches `pattern`.
    ///
    /// The pattern is only subscribed at the broker the first time it is used;
    /// further callbacks on the same pattern are purely local. Callbacks a link
    /// runs from inside its own subscribe call must not (un)subscribe.
    pub fn subscribe<F>(&self, pattern: &str, qos: QoS, callback: F) -> Result<SubscriptionId>
    where
        F: Fn(&str, &str) -> Result<()> + Send + Sync + 'static,
    {
        debug!("Subscribing to MQTT topic {pattern}");
        let link = self.link()?;
        let filter = TopicFilter::new(pattern).map_err(|e| LightsError::Subscribe {
            topic: pattern.to_string(),
            reason: e.to_string(),
        })?;
        let id = SubscriptionId(self.shared.next_id.fetch_add(1, Ordering::Relaxed));

        let _registration = self.lock_registration();
        let already_subscribed = {
            let mut subs = self.lock_subscriptions();
            let already = subs.iter().any(|s| s.filter.pattern() == pattern);
            subs.push(Subscription {
                id,
                filter,
                qos,
                callback: Arc::new(callback),
            });
            already
        };

        // The dispatch table is unlocked here: a link may deliver retained messages synchronously.
        if !already_subscribed && let Err(e) = link.subscribe(pattern, qos) {
            self.lock_subscriptions().retain(|s| s.id != id);
            return Err(LightsError::Subscribe {
                topic: pattern.to_string(),
                reason: e.to_string(),
            });
        }

        Ok(id)
    }

    /// Remove one callback. The broker subscription is dropped only when no
    /// other callback remains on the same pattern.
    pub fn unsubscribe(&self, pattern: &str, id: SubscriptionId) -> Result<()> {
        debug!("Unsubscribing from MQTT topic {pattern}");
        let _registration = self.lock_registration();
        let (removed, last_for_pattern) = {
            let mut subs = self.lock_subscriptions();
            let before = subs.len();
            subs.retain(|s| !(s.id == id && s.filter.pattern() == pattern));
            let removed = subs.len() != before;
            (removed, !subs.iter().any(|s| s.filter.pattern() == pattern))
        };

        if !removed {
            debug!("No subscription {id:?} on {pattern}");
            return Ok(());
        }
        if last_for_pattern {
            let link = self.link()?;
            link.unsubscribe(pattern)
                .map_err(|e| LightsError::Unsubscribe {
                    topic: pattern.to_string(),
                    reason: e.to_string(),
                })?;
        }
        Ok(())
    }

    /// Distinct patterns currently subscribed at the broker.
    pub fn subscribed_patterns(&self) -> Vec<String> {
        let mut patterns: Vec<String> = Vec::new();
        for sub in self.lock_subscriptions().iter() {
            if !patterns.iter().any(|p| p == sub.filter.pattern()) {
                patterns.push(sub.filter.pattern().to_string());
            }
        }
        patterns
    }

    /// Deliver an inbound message to every matching callback, in registration order.
    ///
    /// A failing or panicking callback is logged and does not prevent the
    /// remaining callbacks from running.
    pub fn dispatch(&self, topic: &str, payload: &str) {
        debug!("Received MQTT message on {topic}: {payload}");

        let callbacks: Vec<Callback> = self
            .lock_subscriptions()
            .iter()
            .filter(|s| s.filter.matches(topic))
            .map(|s| s.callback.clone())
            .collect();

        for callback in callbacks {
            match catch_unwind(AssertUnwindSafe(|| callback(topic, payload))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!("Error in callback for topic {topic}: {e}"),
                Err(_) => error!("Callback for topic {topic} panicked"),
            }
        }
    }

    /// Record the broker's answer to a connect request.
    ///
    /// After a reconnect every active pattern is subscribed again, as the
    /// broker session does not keep them.
    pub fn handle_connack(&self, outcome: std::result::Result<(), String>) {
        match outcome {
            Ok(()) => {
                let previous = self.shared.connack_count.fetch_add(1, Ordering::SeqCst);
                self.shared.state.send_replace(ConnectionState::Connected);
                info!("Connected to MQTT broker");
                if previous > 0 {
                    self.resubscribe_all();
                }
            }
            Err(reason) => {
                self.shared
                    .state
                    .send_replace(ConnectionState::Refused(reason));
            }
        }
    }

    /// Record a lost connection.
    pub fn handle_disconnect(&self) {
        let was_connected = self.shared.state.send_if_modified(|state| {
            if *state == ConnectionState::Connected {
                *state = ConnectionState::Disconnected;
                true
            } else {
                false
            }
        });
        if was_connected {
            warn!("Unexpected disconnection from MQTT broker");
        }
    }

    fn resubscribe_all(&self) {
        let Some(link) = self.current_link() else {
            return;
        };
        let _registration = self.lock_registration();
        let patterns: Vec<(String, QoS)> = {
            let subs = self.lock_subscriptions();
            let mut unique: Vec<(String, QoS)> = Vec::new();
            for sub in subs.iter() {
                if !unique.iter().any(|(p, _)| p == sub.filter.pattern()) {
                    unique.push((sub.filter.pattern().to_string(), sub.qos));
                }
            }
            unique
        };
        info!("MQTT: resubscribing to {} topics", patterns.len());
        for (pattern, qos) in patterns {
            if let Err(e) = link.subscribe(&pattern, qos) {
                error!("Failed to resubscribe to {pattern}: {e}");
            }
        }
    }

    fn link(&self) -> Result<Arc<dyn BrokerLink>> {
        self.current_link().ok_or(LightsError::NotConnected)
    }

    fn current_link(&self) -> Option<Arc<dyn BrokerLink>> {
        match self.shared.link.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn set_link(&self, link: Option<Arc<dyn BrokerLink>>) {
        match self.shared.link.write() {
            Ok(mut guard) => *guard = link,
            Err(poisoned) => *poisoned.into_inner() = link,
        }
    }

    fn lock_registration(&self) -> std::sync::MutexGuard<'_, ()> {
        self.shared
            .registration
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_subscriptions(&self) -> std::sync::MutexGuard<'_, Vec<Subscription>> {
        self.shared
            .subscriptions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl std::fmt::Debug for MqttClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MqttClient")
            .field("host", &self.shared.config.host)
            .field("port", &self.shared.config.port)
            .field("state", &*self.shared.state.borrow())
            .finish()
    }
}
