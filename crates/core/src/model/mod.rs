//! Denoiser capability and the reference autoencoder.

pub mod autoencoder;
pub mod layers;

use anyhow::{bail, Result};
use ndarray::{Array4, ArrayD, ArrayViewD};
use serde::{Deserialize, Serialize};

use crate::device::ComputeContext;

pub use autoencoder::DenoisingAutoencoder;

/// A named trainable tensor and its accumulated gradient.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Parameter {
    pub name: String,
    pub value: ArrayD<f32>,
    #[serde(skip)]
    pub grad: ArrayD<f32>,
}

impl Parameter {
    pub fn new(name: impl Into<String>, value: ArrayD<f32>) -> Self {
        let grad = ArrayD::zeros(value.raw_dim());
        Self {
            name: name.into(),
            value,
            grad,
        }
    }

    pub fn zero_grad(&mut self) {
        if self.grad.shape() == self.value.shape() {
            self.grad.fill(0.0);
        } else {
            self.grad = ArrayD::zeros(self.value.raw_dim());
        }
    }

    /// Add `grad` into the accumulated gradient.
    pub fn accumulate_grad(&mut self, grad: ArrayViewD<'_, f32>) -> Result<()> {
        if grad.shape() != self.value.shape() {
            bail!(
                "gradient shape {:?} does not match parameter '{}' shape {:?}",
                grad.shape(),
                self.name,
                self.value.shape()
            );
        }
        if self.grad.shape() != self.value.shape() {
            self.grad = ArrayD::zeros(self.value.raw_dim());
        }
        self.grad += &grad;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.value.len()
    }

    pub fn is_empty(&self) -> bool {
        self.value.is_empty()
    }

    pub fn is_finite(&self) -> bool {
        self.value.iter().all(|v| v.is_finite())
    }
}

/// Anything that maps a noisy `(N, C, H, W)` batch to a denoised batch of the
/// same shape and exposes its parameters for optimisation and inspection.
pub trait Denoiser: Send + Sync {
    fn name(&self) -> &str;

    /// Inference pass with evaluation behaviour whatever the current mode.
    /// Keeps no state for backward.
    fn infer(&self, noisy: &Array4<f32>, ctx: &ComputeContext) -> Result<Array4<f32>>;

    /// Training pass. Caches whatever [`Denoiser::backward`] needs.
    fn forward(&mut self, noisy: &Array4<f32>, ctx: &ComputeContext) -> Result<Array4<f32>>;

    /// Backpropagate `grad_output` (d loss / d output of the last `forward`)
    /// and accumulate into every parameter's `grad`.
    fn backward(&mut self, grad_output: &Array4<f32>, ctx: &ComputeContext) -> Result<()>;

    fn parameters(&self) -> Vec<&Parameter>;

    fn parameters_mut(&mut self) -> Vec<&mut Parameter>;

    fn zero_grad(&mut self) {
        for param in self.parameters_mut() {
            param.zero_grad();
        }
    }

    fn set_training(&mut self, _training: bool) {}

    fn is_training(&self) -> bool {
        false
    }

    fn parameter_count(&self) -> usize {
        self.parameters().iter().map(|p| p.len()).sum()
    }
}

/// Names of parameters holding NaN or infinite values.
pub fn non_finite_parameters<M: Denoiser + ?Sized>(model: &M) -> Vec<String> {
    model
        .parameters()
        .into_iter()
        .filter(|p| !p.is_finite())
        .map(|p| p.name.clone())
        .collect()
}
