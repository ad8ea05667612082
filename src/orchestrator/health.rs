// MIT License - Copyright (c) 2026 Peter Wright
// Circuit health check

use std::sync::Arc;

use chrono::NaiveTime;
use tracing::{info, warn};

use crate::circuit::Circuit;
use crate::constants::{QUIET_HOURS_END, QUIET_HOURS_START};
use crate::error::Result;
use crate::registry::{segment_key, Device, DeviceRegistry};

/// Outcome of probing one circuit.
#[derive(Debug, Clone, Default)]
pub struct CircuitHealth {
    /// Ungrouped devices that also ignore direct requests.
    pub unresponsive: Vec<Arc<Device>>,
    /// Devices that do not hear the circuit's group.
    pub ungrouped: Vec<Arc<Device>>,
}

impl CircuitHealth {
    pub fn is_healthy(&self) -> bool {
        self.unresponsive.is_empty() && self.ungrouped.is_empty()
    }
}

/// Health checks are skipped from 18:00 until 08:00.
pub fn is_quiet_hours(now: NaiveTime) -> bool {
    let start = NaiveTime::from_hms_opt(QUIET_HOURS_START.0, QUIET_HOURS_START.1, 0);
    let end = NaiveTime::from_hms_opt(QUIET_HOURS_END.0, QUIET_HOURS_END.1, 0);
    match (start, end) {
        (Some(start), Some(end)) => now >= start || now < end,
        _ => false,
    }
}

pub(crate) async fn check_circuit(registry: &DeviceRegistry, circuit: &Circuit) -> Result<CircuitHealth> {
    let group = registry.group(circuit.group_id())?;
    let devices = circuit.devices();

    let expected = &circuit.group_id().segment;
    for device in &devices {
        if segment_key(device.base_topic()) != expected {
            warn!(
                "Device {} has wrong base topic: expected segment {expected}, actual {}",
                device.friendly_name(),
                device.base_topic()
            );
        }
    }
    if segment_key(&group.base_topic) != expected {
        warn!(
            "Group {} has wrong base topic: expected segment {expected}, actual {}",
            group.friendly_name, group.base_topic
        );
    }

    // Silence towards the group only means something once the device is
    // known to ignore direct requests too, so probe the ungrouped ones only.
    let ungrouped = registry.ungrouped_devices(&group, &devices).await?;
    let unresponsive = registry.unresponsive_devices(&ungrouped).await?;

    info!(
        "Health check for circuit {}: {} unresponsive, {} ungrouped devices",
        circuit.name,
        unresponsive.len(),
        ungrouped.len()
    );
    Ok(CircuitHealth {
        unresponsive,
        ungrouped,
    })
}
