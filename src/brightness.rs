// MIT License - Copyright (c) 2026 Peter Wright
// Brightness curves: schedule percentage to device level

use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;

/// Maps a brightness fraction (0.0-1.0) to a device level (0-255).
pub trait BrightnessCurve: Debug + Send + Sync {
    fn level(&self, fraction: f64) -> u8;
}

/// `round(fraction * 255)`.
#[derive(Debug, Clone, Copy, Default)]
pub struct LinearCurve;

impl BrightnessCurve for LinearCurve {
    fn level(&self, fraction: f64) -> u8 {
        clamp_level(fraction * 255.0)
    }
}

/// Exponential luminance model: `round(exp((max_lux * fraction - offset) / scale))`.
///
/// Keeps perceived brightness linear in the schedule percentage for lights
/// whose level response is logarithmic.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LuxCurve {
    pub max_lux: f64,
    pub offset: f64,
    pub scale: f64,
}

impl LuxCurve {
    /// Measured response of the ABL-LIGHT-Z-001 downlight.
    pub const ABL_LIGHT_Z_001: LuxCurve = LuxCurve {
        max_lux: 52.247_342_301_071_97,
        offset: 4.26,
        scale: 8.66,
    };
}

impl BrightnessCurve for LuxCurve {
    fn level(&self, fraction: f64) -> u8 {
        let lux = self.max_lux * fraction;
        clamp_level(((lux - self.offset) / self.scale).exp())
    }
}

fn clamp_level(value: f64) -> u8 {
    value.round().clamp(0.0, 255.0) as u8
}

/// Color temperature in mireds for a temperature in Kelvin.
pub fn mireds(kelvin: u32) -> u32 {
    (1_000_000.0 / f64::from(kelvin.max(1))).round() as u32
}

/// Brightness curves keyed by device model id, with a linear fallback.
#[derive(Debug, Clone)]
pub struct BrightnessCurves {
    fallback: Arc<dyn BrightnessCurve>,
    by_model: HashMap<String, Arc<dyn BrightnessCurve>>,
}

impl Default for BrightnessCurves {
    /// Linear fallback plus the built-in model curves.
    fn default() -> Self {
        let mut curves = Self::linear();
        curves.register("ABL-LIGHT-Z-001", LuxCurve::ABL_LIGHT_Z_001);
        curves
    }
}

impl BrightnessCurves {
    /// Only the linear curve, no model overrides.
    pub fn linear() -> Self {
        Self {
            fallback: Arc::new(LinearCurve),
            by_model: HashMap::new(),
        }
    }

    pub fn register(&mut self, model_id: impl Into<String>, curve: impl BrightnessCurve + 'static) {
        self.by_model.insert(model_id.into(), Arc::new(curve));
    }

    /// Curve for a circuit whose lights report `models`.
    ///
    /// A model curve applies only when every light has that same model;
    /// anything else (no lights, unknown or mixed models) is linear.
    pub fn for_models(&self, models: &[Option<String>]) -> Arc<dyn BrightnessCurve> {
        let Some(Some(first)) = models.first() else {
            return self.fallback.clone();
        };
        if !models.iter().all(|m| m.as_deref() == Some(first.as_str())) {
            return self.fallback.clone();
        }
        self.by_model
            .get(first)
            .cloned()
            .unwrap_or_else(|| self.fallback.clone())
    }
}
