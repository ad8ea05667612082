// MIT License - Copyright (c) 2026 Peter Wright
// Lights controller service

use anyhow::{Context, Result};
use clap::Parser;
use serde::Deserialize;
use tokio::signal::unix::{signal, SignalKind};
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{info, warn};

use zigbee_lights::{
    parse_mqtt_url, CircuitConfig, DeviceRegistry, LightsConfig, LightsController, MqttClient,
    MqttConfig, Schedule, ScheduleEntry,
};

// ---------------------------------------------------------------------------
// CLI
// ---------------------------------------------------------------------------

#[derive(Parser)]
#[command(name = "zigbee-lights")]
#[command(about = "Schedule-driven lighting and self-healing for zigbee2mqtt circuits")]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(long, default_value = "config.toml")]
    config: String,
}

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
struct Config {
    mqtt: MqttToml,
    #[serde(default)]
    zigbee: ZigbeeToml,
    #[serde(default)]
    circuits: Vec<CircuitConfig>,
    schedule: Vec<ScheduleEntry>,
}

#[derive(Debug, Clone, Deserialize)]
struct MqttToml {
    url: String,
    username: Option<String>,
    password: Option<String>,
    #[serde(default = "default_client_id")]
    client_id: String,
    #[serde(default = "default_keep_alive")]
    keep_alive_secs: u64,
}

fn default_client_id() -> String {
    "zigbee-lights".to_string()
}
fn default_keep_alive() -> u64 {
    60
}

#[derive(Debug, Clone, Deserialize)]
struct ZigbeeToml {
    #[serde(default = "default_base_topics")]
    base_topics: Vec<String>,
}

impl Default for ZigbeeToml {
    fn default() -> Self {
        Self {
            base_topics: default_base_topics(),
        }
    }
}

fn default_base_topics() -> Vec<String> {
    vec!["zigbee2mqtt".to_string()]
}

impl Config {
    fn lights(&self) -> LightsConfig {
        LightsConfig {
            circuits: self.circuits.clone(),
            schedule: self.schedule.clone(),
        }
    }
}

fn build_mqtt_config(toml: &MqttToml) -> Result<MqttConfig> {
    let (host, port) = parse_mqtt_url(&toml.url)?;
    let mut builder = MqttConfig::builder()
        .host(host)
        .port(port)
        .client_id(&toml.client_id)
        .keep_alive(Duration::from_secs(toml.keep_alive_secs));
    if let Some(username) = &toml.username {
        builder = builder.credentials(username, toml.password.clone().unwrap_or_default());
    }
    Ok(builder.build())
}

/// Read and validate the config file.
fn load_config(path: &str) -> Result<Config> {
    let text = std::fs::read_to_string(path).context("Failed to read config file")?;
    let config: Config = toml::from_str(&text).context("Failed to parse config file")?;
    build_mqtt_config(&config.mqtt).context("Invalid MQTT settings")?;
    Schedule::new(config.schedule.clone()).context("Invalid schedule")?;
    if config.zigbee.base_topics.is_empty() {
        anyhow::bail!("zigbee.base_topics must list at least one base topic");
    }
    Ok(config)
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    // RUST_LOG controls verbosity (e.g. RUST_LOG=debug or RUST_LOG=zigbee_lights=trace).
    // Default: info.
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    // systemd journal already adds timestamps, so omit them when running under systemd
    if std::env::var_os("JOURNAL_STREAM").is_some() {
        tracing_subscriber::fmt().without_time().with_env_filter(env_filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(env_filter).init();
    }

    let cli = Cli::parse();
    let mut config = load_config(&cli.config)?;

    let mut sighup = signal(SignalKind::hangup())?;
    let mut sigterm = signal(SignalKind::terminate())?;

    loop {
        let client = MqttClient::new(build_mqtt_config(&config.mqtt)?);
        client
            .connect()
            .await
            .context("Failed to connect to MQTT broker")?;

        let registry = DeviceRegistry::new(client.clone(), config.zigbee.base_topics.clone());
        registry
            .initialize()
            .await
            .context("Failed to discover zigbee2mqtt devices")?;

        let controller = LightsController::new(registry, config.lights())
            .context("Failed to resolve lighting circuits")?;
        controller.start().await;

        info!("Lights controller running. Send SIGHUP to reload, SIGINT/SIGTERM to stop.");
        let mut readiness = interval(Duration::from_secs(60));
        readiness.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let restart = loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("Received SIGINT, shutting down...");
                    break false;
                }
                _ = sigterm.recv() => {
                    info!("Received SIGTERM, shutting down...");
                    break false;
                }
                _ = sighup.recv() => {
                    info!("Received SIGHUP, reloading config and restarting...");
                    break true;
                }
                _ = readiness.tick() => {
                    if !controller.is_ready() {
                        warn!("Not ready: broker disconnected or lighting tasks stopped");
                    }
                }
            }
        };

        controller.shutdown();
        if let Err(e) = client.disconnect().await {
            warn!("Error disconnecting from MQTT broker: {e}");
        }

        if !restart {
            break;
        }

        // Reload config from disk; keep previous config on failure
        info!("Reloading config from {}", cli.config);
        match load_config(&cli.config) {
            Ok(new_config) => {
                config = new_config;
                info!("Config reloaded successfully");
            }
            Err(e) => warn!("Failed to reload config, keeping previous: {e:#}"),
        }

        info!("Reconnecting...");
    }

    info!("Shutdown complete");
    Ok(())
}
