// MIT License - Copyright (c) 2026 Peter Wright
// Circuit repair: regrouping and hard reset through hardwired switches

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use serde_json::json;
use tokio::time::{sleep, Duration};
use tracing::{error, info, warn};

use crate::circuit::Circuit;
use crate::constants::{
    PERMIT_JOIN_SECS, POWER_SETTLE, REJOIN_ATTEMPTS, RESET_CYCLES, SMART_BULB_MODE,
    SMART_BULB_MODE_DISABLED, SMART_BULB_MODE_ENABLED,
};
use crate::error::{LightsError, Result};
use crate::orchestrator::health::CircuitHealth;
use crate::registry::{Device, DeviceRegistry};

/// Repair an unhealthy circuit.
///
/// Returns `true` when a repair was carried out, `false` when there was
/// nothing actionable.
pub(crate) async fn heal_circuit(
    registry: &DeviceRegistry,
    circuit: &Circuit,
    health: &CircuitHealth,
) -> Result<bool> {
    if !health.unresponsive.is_empty() {
        if !health.unresponsive.iter().any(|d| circuit.is_light(d)) {
            warn!(
                "Unresponsive devices found in circuit {}, but no lights to reset",
                circuit.name
            );
            return Ok(false);
        }
        reset_circuit(registry, circuit, &health.unresponsive).await?;
        return Ok(true);
    }

    if health.ungrouped.is_empty() {
        return Ok(false);
    }
    let group = registry.group(circuit.group_id())?;
    for device in &health.ungrouped {
        if !registry.add_to_group(device, &group).await? {
            warn!(
                "Failed to add {} to group {}",
                device.friendly_name(),
                group.friendly_name
            );
        }
    }
    Ok(true)
}

/// Hard reset of every light through the circuit's hardwired switches,
/// followed by re-pairing.
///
/// Smart bulb mode is restored on every switch before returning, whatever
/// the outcome, including a panic inside the procedure.
async fn reset_circuit(
    registry: &DeviceRegistry,
    circuit: &Circuit,
    unresponsive: &[Arc<Device>],
) -> Result<()> {
    let aborted = |reason: &str| LightsError::HealingAborted {
        circuit: circuit.name.clone(),
        reason: reason.to_string(),
    };

    let switches = &circuit.hardwired_switches;
    if switches.is_empty() {
        return Err(aborted("no hardwired switch"));
    }
    if switches
        .iter()
        .any(|s| unresponsive.iter().any(|d| d.address() == s.address()))
    {
        return Err(aborted("hardwired switch is unresponsive"));
    }

    info!("Starting circuit reset for {} due to unresponsive devices", circuit.name);
    let outcome = AssertUnwindSafe(reset_and_rejoin(registry, circuit, switches))
        .catch_unwind()
        .await;

    for switch in switches {
        match registry
            .set_and_verify_property(switch, SMART_BULB_MODE, json!(SMART_BULB_MODE_ENABLED), 0)
            .await
        {
            Ok(true) => {}
            Ok(false) => error!("Failed to restore smart bulb mode on {}", switch.friendly_name()),
            Err(e) => error!("Failed to restore smart bulb mode on {}: {e}", switch.friendly_name()),
        }
    }

    match outcome {
        Ok(result) => result,
        Err(panic) => std::panic::resume_unwind(panic),
    }
}

async fn reset_and_rejoin(
    registry: &DeviceRegistry,
    circuit: &Circuit,
    switches: &[Arc<Device>],
) -> Result<()> {
    let aborted = |reason: String| LightsError::HealingAborted {
        circuit: circuit.name.clone(),
        reason,
    };

    for switch in switches {
        if !registry
            .set_and_verify_property(switch, SMART_BULB_MODE, json!(SMART_BULB_MODE_DISABLED), 0)
            .await?
        {
            return Err(aborted(format!(
                "failed to disable smart bulb mode on {}",
                switch.friendly_name()
            )));
        }
    }

    if !power_cycle(registry, switches, RESET_CYCLES).await? {
        return Err(aborted(format!("failed to power cycle {}", names(switches))));
    }

    // The reset knocks every light off the network.
    let mut rejoining = circuit.lights.clone();
    let Some(primary) = switches.first() else {
        return Err(aborted("no hardwired switch".to_string()));
    };
    for attempt in 1..=REJOIN_ATTEMPTS {
        if !power_cycle(registry, switches, 1).await? {
            continue;
        }
        if !registry.permit_join(primary, PERMIT_JOIN_SECS).await? {
            continue;
        }
        sleep(Duration::from_secs(PERMIT_JOIN_SECS.into())).await;

        rejoining = registry.unresponsive_devices(&rejoining).await?;
        if rejoining.is_empty() {
            break;
        }
        warn!(
            "{} lights of {} still missing after rejoin attempt {attempt}",
            rejoining.len(),
            circuit.name
        );
    }
    if !rejoining.is_empty() {
        error!("Lights did not rejoin circuit {}: {}", circuit.name, names(&rejoining));
    }

    let group = registry.group(circuit.group_id())?;
    for light in &circuit.lights {
        if !registry.add_to_group(light, &group).await? {
            warn!(
                "Failed to add {} to group {}",
                light.friendly_name(),
                group.friendly_name
            );
        }
    }

    info!("Successfully reset circuit {}", circuit.name);
    Ok(())
}

/// Switch every device off and on again `cycles` times.
async fn power_cycle(registry: &DeviceRegistry, switches: &[Arc<Device>], cycles: usize) -> Result<bool> {
    info!("Power cycling {} for {cycles} cycles", names(switches));
    for _ in 0..cycles {
        for state in ["OFF", "ON"] {
            for switch in switches {
                if !registry
                    .set_and_verify_property(switch, "state", json!(state), 0)
                    .await?
                {
                    error!("Failed to turn {state} switch {}", switch.friendly_name());
                    return Ok(false);
                }
            }
            sleep(POWER_SETTLE).await;
        }
    }
    Ok(true)
}

fn names(devices: &[Arc<Device>]) -> String {
    devices
        .iter()
        .map(|d| d.friendly_name())
        .collect::<Vec<_>>()
        .join(", ")
}
