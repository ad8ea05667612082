// MIT License - Copyright (c) 2026 Peter Wright
// Lighting and health loops

mod heal;
pub mod health;

use std::sync::{Arc, Mutex};

use chrono::{Local, NaiveTime, Timelike};
use serde_json::json;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration};
use tracing::{error, info, warn};

use crate::brightness::{mireds, BrightnessCurves};
use crate::circuit::{Circuit, LightsConfig};
use crate::constants::{
    HEALTH_INTERVAL_MINUTES, LIGHTING_INTERVAL_MINUTES, LIGHTING_TRANSITION_SECS,
    REPAIR_TRANSITION_SECS,
};
use crate::error::Result;
use crate::registry::DeviceRegistry;
use crate::schedule::Schedule;

pub use health::{is_quiet_hours, CircuitHealth};

/// Device units for one circuit: brightness level and color temperature in mireds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitLighting {
    pub level: u8,
    pub mireds: u32,
}

/// Whether a periodic run happened or was skipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    Ran,
    /// A previous run still holds the lock.
    Busy,
    QuietHours,
}

struct Inner {
    registry: DeviceRegistry,
    circuits: Vec<Circuit>,
    schedule: Schedule,
    curves: BrightnessCurves,
    lighting_lock: tokio::sync::Mutex<()>,
    health_lock: tokio::sync::Mutex<()>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    shutdown: watch::Sender<bool>,
}

/// Drives schedule-based lighting and circuit repair for every configured circuit.
#[derive(Clone)]
pub struct LightsController {
    inner: Arc<Inner>,
}

impl LightsController {
    /// Resolve every circuit against the registry and validate the schedule.
    ///
    /// The registry must already be initialized; a circuit referencing an
    /// unknown device or group is a configuration error.
    pub fn new(registry: DeviceRegistry, config: LightsConfig) -> Result<Self> {
        Self::with_curves(registry, config, BrightnessCurves::default())
    }

    pub fn with_curves(
        registry: DeviceRegistry,
        config: LightsConfig,
        curves: BrightnessCurves,
    ) -> Result<Self> {
        let schedule = Schedule::new(config.schedule)?;
        let circuits = config
            .circuits
            .into_iter()
            .map(|c| Circuit::resolve(c, &registry))
            .collect::<Result<Vec<_>>>()?;
        info!("Loaded {} circuits", circuits.len());

        let (shutdown, _) = watch::channel(false);
        Ok(Self {
            inner: Arc::new(Inner {
                registry,
                circuits,
                schedule,
                curves,
                lighting_lock: tokio::sync::Mutex::new(()),
                health_lock: tokio::sync::Mutex::new(()),
                tasks: Mutex::new(Vec::new()),
                shutdown,
            }),
        })
    }

    pub fn circuits(&self) -> &[Circuit] {
        &self.inner.circuits
    }

    /// Apply lighting once, then start the lighting and health loops.
    pub async fn start(&self) {
        if let Err(e) = self.update_all_circuits_lighting(Local::now().time()).await {
            error!("Error during initial lighting update: {e}");
        }

        let lighting = self.spawn_loop("lighting", LIGHTING_INTERVAL_MINUTES, |controller| async move {
            controller
                .update_all_circuits_lighting(Local::now().time())
                .await
        });
        let health = self.spawn_loop("health check", HEALTH_INTERVAL_MINUTES, |controller| async move {
            controller.run_health_checks(Local::now().time()).await
        });
        self.lock_tasks().extend([lighting, health]);
    }

    /// Signal both loops to stop. An in-flight repair is abandoned as is.
    pub fn shutdown(&self) {
        self.inner.shutdown.send_replace(true);
    }

    /// At least one loop is alive and the broker connection is up.
    pub fn is_ready(&self) -> bool {
        let running = self.lock_tasks().iter().any(|t| !t.is_finished());
        running && self.inner.registry.client().is_connected()
    }

    fn spawn_loop<F, Fut>(&self, name: &'static str, minutes: u32, tick: F) -> JoinHandle<()>
    where
        F: Fn(LightsController) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = Result<TickOutcome>> + Send + 'static,
    {
        let controller = self.clone();
        let mut shutdown = self.inner.shutdown.subscribe();
        tokio::spawn(async move {
            loop {
                let wait = seconds_until_next_interval(Local::now().time(), minutes);
                tokio::select! {
                    _ = stopped(&mut shutdown) => break,
                    _ = sleep(wait) => {}
                }

                tokio::select! {
                    _ = stopped(&mut shutdown) => break,
                    result = tick(controller.clone()) => match result {
                        Ok(TickOutcome::Busy) => warn!("Previous {name} run still in progress, skipping"),
                        Ok(TickOutcome::QuietHours) => {
                            info!("Skipping {name} during quiet hours (18:00-08:00)")
                        }
                        Ok(TickOutcome::Ran) => {}
                        Err(e) => error!("Error in {name} loop: {e}"),
                    },
                }
            }
            info!("Stopped {name} loop");
        })
    }

    /// Apply the scheduled lighting for `now` to every circuit's group.
    ///
    /// Skipped when the previous run has not finished.
    pub async fn update_all_circuits_lighting(&self, now: NaiveTime) -> Result<TickOutcome> {
        let Ok(_running) = self.inner.lighting_lock.try_lock() else {
            return Ok(TickOutcome::Busy);
        };
        info!("Updating lighting for all circuits");

        for circuit in &self.inner.circuits {
            let lighting = self.circuit_lighting(circuit, now);
            if let Err(e) = self.apply_lighting(circuit, lighting, LIGHTING_TRANSITION_SECS) {
                error!("Failed to update lighting for {}: {e}", circuit.name);
            }
        }
        Ok(TickOutcome::Ran)
    }

    /// Probe every circuit and repair the unhealthy ones.
    ///
    /// Skipped during quiet hours and when the previous run has not finished.
    pub async fn run_health_checks(&self, now: NaiveTime) -> Result<TickOutcome> {
        if is_quiet_hours(now) {
            return Ok(TickOutcome::QuietHours);
        }
        let Ok(_running) = self.inner.health_lock.try_lock() else {
            return Ok(TickOutcome::Busy);
        };
        info!("Running health checks for all circuits");

        for circuit in &self.inner.circuits {
            let lighting = self.circuit_lighting(circuit, now);
            match self.heal_circuit_if_needed(circuit).await {
                Ok(true) => {
                    if let Err(e) = self.apply_lighting(circuit, lighting, REPAIR_TRANSITION_SECS) {
                        error!("Failed to restore lighting for {}: {e}", circuit.name);
                    }
                }
                Ok(false) => {}
                Err(e) => error!("Health check failed for circuit {}: {e}", circuit.name),
            }
        }
        Ok(TickOutcome::Ran)
    }

    /// Check one circuit; repair it when unhealthy. Returns whether a repair ran.
    pub async fn heal_circuit_if_needed(&self, circuit: &Circuit) -> Result<bool> {
        let health = health::check_circuit(&self.inner.registry, circuit).await?;
        if health.is_healthy() {
            return Ok(false);
        }
        heal::heal_circuit(&self.inner.registry, circuit, &health).await
    }

    /// Scheduled lighting for `circuit` at `now`, in device units.
    pub fn circuit_lighting(&self, circuit: &Circuit, now: NaiveTime) -> CircuitLighting {
        let target = self.inner.schedule.lighting_at(now);
        let curve = self.inner.curves.for_models(&circuit.light_models());
        CircuitLighting {
            level: curve.level(target.brightness),
            mireds: mireds(target.temperature),
        }
    }

    fn apply_lighting(&self, circuit: &Circuit, lighting: CircuitLighting, transition_secs: u32) -> Result<()> {
        let registry = &self.inner.registry;
        let group = registry.group(circuit.group_id())?;
        registry.set_property(&group, "brightness", json!(lighting.level), transition_secs)?;
        registry.set_property(&group, "color_temp", json!(lighting.mireds), transition_secs)
    }

    fn lock_tasks(&self) -> std::sync::MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.inner
            .tasks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl std::fmt::Debug for LightsController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LightsController")
            .field("circuits", &self.inner.circuits.len())
            .field("schedule", &self.inner.schedule.entries().len())
            .finish()
    }
}

/// Resolves once the shutdown flag is raised or its sender is gone.
async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    loop {
        let stop = *shutdown.borrow_and_update();
        if stop || shutdown.changed().await.is_err() {
            return;
        }
    }
}

/// Time from `now` to the next multiple of `minutes` past the hour.
pub fn seconds_until_next_interval(now: NaiveTime, minutes: u32) -> Duration {
    let interval = f64::from(minutes.max(1) * 60);
    let since_hour = f64::from(now.minute() * 60 + now.second())
        + f64::from(now.nanosecond().min(999_999_999)) / 1e9;
    let remaining = interval - since_hour % interval;
    Duration::from_secs_f64(if remaining <= 0.0 { interval } else { remaining })
}
