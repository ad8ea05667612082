// MIT License - Copyright (c) 2026 Peter Wright
// Broker connection settings

use std::time::Duration;

use crate::error::{LightsError, Result};

/// Configuration for the broker connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MqttConfig {
    /// Broker host name or IP address
    pub host: String,
    /// Broker TCP port (default: 1883)
    pub port: u16,
    /// Optional username; the password is only sent when a username is set
    pub username: Option<String>,
    pub password: Option<String>,
    /// MQTT client identifier
    pub client_id: String,
    /// Keep-alive interval
    pub keep_alive: Duration,
    /// Capacity of the outbound request queue
    pub request_capacity: usize,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 1883,
            username: None,
            password: None,
            client_id: "zigbee-lights".to_string(),
            keep_alive: Duration::from_secs(60),
            request_capacity: 256,
        }
    }
}

impl MqttConfig {
    /// Create a new config builder starting from defaults.
    pub fn builder() -> MqttConfigBuilder {
        MqttConfigBuilder::default()
    }
}

/// Builder for MqttConfig.
#[derive(Debug, Clone, Default)]
pub struct MqttConfigBuilder {
    config: MqttConfig,
}

impl MqttConfigBuilder {
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.config.host = host.into();
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.config.port = port;
        self
    }

    pub fn credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.config.username = Some(username.into());
        self.config.password = Some(password.into());
        self
    }

    pub fn client_id(mut self, client_id: impl Into<String>) -> Self {
        self.config.client_id = client_id.into();
        self
    }

    pub fn keep_alive(mut self, keep_alive: Duration) -> Self {
        self.config.keep_alive = keep_alive;
        self
    }

    pub fn request_capacity(mut self, capacity: usize) -> Self {
        self.config.request_capacity = capacity;
        self
    }

    pub fn build(self) -> MqttConfig {
        self.config
    }
}

/// Parse a broker URL like "mqtt://host:port" into (host, port).
///
/// The scheme is optional; `tcp://` is accepted as well. The port defaults to
/// 1883 when omitted.
pub fn parse_mqtt_url(url: &str) -> Result<(String, u16)> {
    let stripped = url
        .strip_prefix("mqtt://")
        .or_else(|| url.strip_prefix("tcp://"))
        .unwrap_or(url);

    let (host, port) = match stripped.rsplit_once(':') {
        Some((host, port_str)) => {
            let port = port_str
                .parse::<u16>()
                .map_err(|_| LightsError::config(format!("invalid MQTT port number in {url}")))?;
            (host, port)
        }
        None => (stripped, 1883),
    };

    if host.is_empty() {
        return Err(LightsError::config(format!("missing MQTT host in {url}")));
    }
    Ok((host.to_string(), port))
}
