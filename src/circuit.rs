// MIT License - Copyright (c) 2026 Peter Wright
// Circuit topology

use std::sync::Arc;

use serde::Deserialize;

use crate::error::{LightsError, Result};
use crate::registry::{Device, DeviceRegistry, GroupId, IeeeAddress};
use crate::schedule::ScheduleEntry;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct LightConfig {
    pub ieee: IeeeAddress,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SwitchKind {
    /// Switches the mains supply of the circuit's lights.
    Hardwired,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SwitchConfig {
    pub ieee: IeeeAddress,
    #[serde(default, rename = "type")]
    pub kind: Option<SwitchKind>,
}

impl SwitchConfig {
    pub fn is_hardwired(&self) -> bool {
        self.kind == Some(SwitchKind::Hardwired)
    }
}

/// A lighting zone as written in the configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CircuitConfig {
    pub id: String,
    /// Group that carries the circuit's lighting commands.
    pub group_id: GroupId,
    #[serde(default)]
    pub lights: Vec<LightConfig>,
    #[serde(default)]
    pub switches: Vec<SwitchConfig>,
}

impl CircuitConfig {
    /// `living_room` becomes `Living Room`.
    pub fn friendly_name(&self) -> String {
        self.id
            .split('_')
            .map(|word| {
                let mut chars = word.chars();
                match chars.next() {
                    Some(first) => first.to_uppercase().chain(chars.flat_map(char::to_lowercase)).collect(),
                    None => String::new(),
                }
            })
            .collect::<Vec<String>>()
            .join(" ")
    }
}

/// Circuits and schedule, as loaded from the configuration file.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct LightsConfig {
    #[serde(default)]
    pub circuits: Vec<CircuitConfig>,
    pub schedule: Vec<ScheduleEntry>,
}

/// A circuit whose devices and group have been found in the registry.
#[derive(Debug, Clone)]
pub struct Circuit {
    pub config: CircuitConfig,
    pub name: String,
    pub lights: Vec<Arc<Device>>,
    pub switches: Vec<Arc<Device>>,
    pub hardwired_switches: Vec<Arc<Device>>,
}

impl Circuit {
    /// Look up every device and the group of `config`.
    pub fn resolve(config: CircuitConfig, registry: &DeviceRegistry) -> Result<Self> {
        let name = config.friendly_name();
        let unresolved = |e: LightsError| LightsError::config(format!("circuit {}: {e}", config.id));

        let lights = config
            .lights
            .iter()
            .map(|l| registry.device(&l.ieee))
            .collect::<Result<Vec<_>>>()
            .map_err(unresolved)?;
        let switches = config
            .switches
            .iter()
            .map(|s| registry.device(&s.ieee))
            .collect::<Result<Vec<_>>>()
            .map_err(unresolved)?;
        registry.group(&config.group_id).map_err(unresolved)?;

        let hardwired_switches = config
            .switches
            .iter()
            .zip(&switches)
            .filter(|(cfg, _)| cfg.is_hardwired())
            .map(|(_, device)| device.clone())
            .collect();

        Ok(Self {
            config,
            name,
            lights,
            switches,
            hardwired_switches,
        })
    }

    pub fn group_id(&self) -> &GroupId {
        &self.config.group_id
    }

    /// Lights followed by switches.
    pub fn devices(&self) -> Vec<Arc<Device>> {
        self.lights.iter().chain(&self.switches).cloned().collect()
    }

    pub fn is_light(&self, device: &Device) -> bool {
        self.lights.iter().any(|l| l.address() == device.address())
    }

    pub fn light_models(&self) -> Vec<Option<String>> {
        self.lights.iter().map(|l| l.model_id()).collect()
    }
}
