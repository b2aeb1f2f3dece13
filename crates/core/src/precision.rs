//! Dynamic loss scaling for reduced-precision training.

use crate::config::MixedPrecisionConfig;
use crate::model::Parameter;

/// Gradient scaler for mixed-precision training.
///
/// The loss gradient is multiplied by `scale` before backpropagation so small
/// values survive f16. After backward the parameter gradients are divided
/// back down; if any of them is NaN or infinite the optimizer step must be
/// skipped and the scale is backed off. Every `growth_interval` consecutive
/// clean steps the scale grows again.
#[derive(Debug, Clone)]
pub struct GradScaler {
    scale: f32,
    growth_factor: f32,
    backoff_factor: f32,
    growth_interval: usize,
    /// Consecutive steps without overflow since the last scale change.
    growth_tracker: usize,
    enabled: bool,
    overflow_count: usize,
    successful_steps: usize,
}

impl GradScaler {
    pub fn new(initial_scale: f32) -> Self {
        Self::from_config(&MixedPrecisionConfig {
            initial_scale,
            ..MixedPrecisionConfig::default()
        })
    }

    pub fn from_config(config: &MixedPrecisionConfig) -> Self {
        Self {
            scale: if config.enabled {
                config.initial_scale
            } else {
                1.0
            },
            growth_factor: config.growth_factor,
            backoff_factor: config.backoff_factor,
            growth_interval: config.growth_interval.max(1),
            growth_tracker: 0,
            enabled: config.enabled,
            overflow_count: 0,
            successful_steps: 0,
        }
    }

    pub fn scale(&self) -> f32 {
        self.scale
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Divide every parameter gradient by the current scale.
    ///
    /// Returns `true` when all gradients are finite afterwards.
    pub fn unscale_and_check(&self, params: &mut [&mut Parameter]) -> bool {
        let inv_scale = 1.0 / self.scale;
        let mut finite = true;

        for param in params.iter_mut() {
            param.grad.mapv_inplace(|g| {
                let g = g * inv_scale;
                if !g.is_finite() {
                    finite = false;
                }
                g
            });
        }

        finite
    }

    /// Update the scale after a step. Pass `true` if gradients were finite.
    pub fn update(&mut self, grads_finite: bool) {
        if !self.enabled {
            return;
        }

        if grads_finite {
            self.successful_steps += 1;
            self.growth_tracker += 1;
            if self.growth_tracker >= self.growth_interval {
                self.scale *= self.growth_factor;
                self.growth_tracker = 0;
            }
        } else {
            self.overflow_count += 1;
            self.scale *= self.backoff_factor;
            self.growth_tracker = 0;
        }
    }

    pub fn overflow_count(&self) -> usize {
        self.overflow_count
    }

    pub fn successful_steps(&self) -> usize {
        self.successful_steps
    }
}

impl Default for GradScaler {
    fn default() -> Self {
        Self::from_config(&MixedPrecisionConfig::default())
    }
}
