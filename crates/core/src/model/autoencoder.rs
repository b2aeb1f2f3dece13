//! Reference denoising autoencoder.
//!
//! Two-level encoder/decoder with a skip connection that predicts the noise
//! residual:
//!
//! ```text
//! x ─ conv+relu ─ e1 ─ pool ─ conv+relu ─ e2 ─ up ─(+ e1)─ conv+relu ─ d ─ conv ─ r
//! y = x + r
//! ```
//!
//! Spatial dimensions must be even.

use anyhow::{bail, Context, Result};
use ndarray::Array4;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::device::ComputeContext;
use crate::model::layers::{
    avg_pool2, avg_pool2_backward, relu_backward_in_place, relu_in_place, upsample2,
    upsample2_backward, Conv2d,
};
use crate::model::{Denoiser, Parameter};

pub const ARCHITECTURE_NAME: &str = "denoising-autoencoder";

/// Activations kept from the last training forward pass.
#[derive(Debug)]
struct ForwardCache {
    input: Array4<f32>,
    e1: Array4<f32>,
    pooled: Array4<f32>,
    e2: Array4<f32>,
    merged: Array4<f32>,
    decoded: Array4<f32>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DenoisingAutoencoder {
    channels: usize,
    hidden: usize,
    enc1: Conv2d,
    enc2: Conv2d,
    dec1: Conv2d,
    head: Conv2d,
    #[serde(skip)]
    cache: Option<ForwardCache>,
    #[serde(skip)]
    training: bool,
}

impl DenoisingAutoencoder {
    pub fn new<R: Rng + ?Sized>(channels: usize, hidden: usize, rng: &mut R) -> Self {
        Self {
            channels,
            hidden,
            enc1: Conv2d::new("enc1", channels, hidden, rng),
            enc2: Conv2d::new("enc2", hidden, hidden, rng),
            dec1: Conv2d::new("dec1", hidden, hidden, rng),
            head: Conv2d::new("head", hidden, channels, rng),
            cache: None,
            training: false,
        }
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    pub fn hidden(&self) -> usize {
        self.hidden
    }

    fn check_input(&self, noisy: &Array4<f32>) -> Result<()> {
        let (_, c, h, w) = noisy.dim();
        if c != self.channels {
            bail!(
                "{ARCHITECTURE_NAME} was built for {} channels, got {c}",
                self.channels
            );
        }
        if h % 2 != 0 || w % 2 != 0 {
            bail!("{ARCHITECTURE_NAME} needs even spatial dimensions, got {h}x{w}");
        }
        Ok(())
    }

    fn run(&self, noisy: &Array4<f32>, ctx: &ComputeContext) -> Result<(Array4<f32>, ForwardCache)> {
        self.check_input(noisy)?;
        let precision = ctx.precision;

        let mut input = noisy.clone();
        precision.round_in_place(&mut input);

        let mut e1 = self.enc1.forward(&input, ctx)?;
        relu_in_place(&mut e1);

        let mut pooled = avg_pool2(&e1);
        precision.round_in_place(&mut pooled);

        let mut e2 = self.enc2.forward(&pooled, ctx)?;
        relu_in_place(&mut e2);

        let mut merged = upsample2(&e2);
        merged += &e1;
        precision.round_in_place(&mut merged);

        let mut decoded = self.dec1.forward(&merged, ctx)?;
        relu_in_place(&mut decoded);

        let residual = self.head.forward(&decoded, ctx)?;
        let mut output = residual;
        output += &input;
        precision.round_in_place(&mut output);

        Ok((
            output,
            ForwardCache {
                input,
                e1,
                pooled,
                e2,
                merged,
                decoded,
            },
        ))
    }
}

impl Denoiser for DenoisingAutoencoder {
    fn name(&self) -> &str {
        ARCHITECTURE_NAME
    }

    fn infer(&self, noisy: &Array4<f32>, ctx: &ComputeContext) -> Result<Array4<f32>> {
        self.run(noisy, ctx).map(|(output, _)| output)
    }

    fn forward(&mut self, noisy: &Array4<f32>, ctx: &ComputeContext) -> Result<Array4<f32>> {
        let (output, cache) = self.run(noisy, ctx)?;
        self.cache = Some(cache);
        Ok(output)
    }

    fn backward(&mut self, grad_output: &Array4<f32>, ctx: &ComputeContext) -> Result<()> {
        let cache = self
            .cache
            .take()
            .context("backward called without a preceding forward pass")?;
        let precision = ctx.precision;

        let mut grad_decoded = self.head.backward(&cache.decoded, grad_output, ctx)?;
        relu_backward_in_place(&mut grad_decoded, &cache.decoded);

        let grad_merged = self.dec1.backward(&cache.merged, &grad_decoded, ctx)?;

        let mut grad_e2 = upsample2_backward(&grad_merged);
        precision.round_in_place(&mut grad_e2);
        relu_backward_in_place(&mut grad_e2, &cache.e2);

        let grad_pooled = self.enc2.backward(&cache.pooled, &grad_e2, ctx)?;

        let mut grad_e1 = avg_pool2_backward(&grad_pooled);
        grad_e1 += &grad_merged;
        precision.round_in_place(&mut grad_e1);
        relu_backward_in_place(&mut grad_e1, &cache.e1);

        self.enc1.backward(&cache.input, &grad_e1, ctx)?;
        Ok(())
    }

    fn parameters(&self) -> Vec<&Parameter> {
        [&self.enc1, &self.enc2, &self.dec1, &self.head]
            .into_iter()
            .flat_map(|layer| [&layer.weight, &layer.bias])
            .collect()
    }

    fn parameters_mut(&mut self) -> Vec<&mut Parameter> {
        [
            &mut self.enc1,
            &mut self.enc2,
            &mut self.dec1,
            &mut self.head,
        ]
        .into_iter()
        .flat_map(|layer| [&mut layer.weight, &mut layer.bias])
        .collect()
    }

    fn set_training(&mut self, training: bool) {
        self.training = training;
        if !training {
            self.cache = None;
        }
    }

    fn is_training(&self) -> bool {
        self.training
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{Device, Precision};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn model(channels: usize) -> DenoisingAutoencoder {
        DenoisingAutoencoder::new(channels, 4, &mut StdRng::seed_from_u64(11))
    }

    #[test]
    fn output_shape_matches_input() {
        let model = model(3);
        let input = Array4::from_elem((2, 3, 8, 6), 0.5f32);
        let out = model
            .infer(&input, &ComputeContext::default())
            .expect("infer");
        assert_eq!(out.dim(), input.dim());
    }

    #[test]
    fn rejects_odd_sizes_and_wrong_channels() {
        let model = model(3);
        let ctx = ComputeContext::default();
        assert!(model.infer(&Array4::zeros((1, 3, 7, 8)), &ctx).is_err());
        assert!(model.infer(&Array4::zeros((1, 1, 8, 8)), &ctx).is_err());
    }

    #[test]
    fn parameters_are_enumerated_in_layer_order() {
        let model = model(3);
        let names: Vec<_> = model.parameters().iter().map(|p| p.name.clone()).collect();
        assert_eq!(
            names,
            [
                "enc1.weight",
                "enc1.bias",
                "enc2.weight",
                "enc2.bias",
                "dec1.weight",
                "dec1.bias",
                "head.weight",
                "head.bias"
            ]
        );
        assert_eq!(model.parameter_count(), 3 * 4 * 9 + 4 + 2 * (4 * 4 * 9 + 4) + 4 * 3 * 9 + 3);
    }

    #[test]
    fn backward_without_forward_fails() {
        let mut model = model(3);
        let grad = Array4::zeros((1, 3, 4, 4));
        assert!(model.backward(&grad, &ComputeContext::default()).is_err());
    }

    /// Non-negative weights and positive biases keep every ReLU active for
    /// non-negative inputs, so the network is linear in each parameter and
    /// central differences are exact up to rounding.
    fn linearised_model() -> DenoisingAutoencoder {
        let mut model = model(2);
        for param in model.parameters_mut().into_iter().take(6) {
            param.value.mapv_inplace(|v| v.abs() + 0.05);
        }
        model
    }

    #[test]
    fn end_to_end_gradient_matches_finite_difference() {
        let mut model = linearised_model();
        let mut rng = StdRng::seed_from_u64(5);
        let input = Array4::from_shape_fn((1, 2, 4, 4), |_| rng.gen_range(0.0f32..1.0));
        let probe = Array4::from_shape_fn((1, 2, 4, 4), |_| rng.gen_range(-1.0f32..1.0));
        let ctx = ComputeContext::new(Device::Cpu, Precision::Full);

        model.zero_grad();
        model.forward(&input, &ctx).expect("forward");
        model.backward(&probe, &ctx).expect("backward");

        let objective = |m: &DenoisingAutoencoder| -> f64 {
            let out = m.infer(&input, &ctx).expect("infer");
            (&out * &probe).iter().map(|v| f64::from(*v)).sum()
        };

        let eps = 1e-2f32;
        for param_index in 0..8 {
            let analytic = model.parameters()[param_index]
                .grad
                .as_slice()
                .expect("contiguous")[0];

            let mut plus = linearised_model();
            plus.parameters_mut()[param_index]
                .value
                .as_slice_mut()
                .expect("contiguous")[0] += eps;
            let mut minus = linearised_model();
            minus.parameters_mut()[param_index]
                .value
                .as_slice_mut()
                .expect("contiguous")[0] -= eps;

            let numeric = (objective(&plus) - objective(&minus)) / (2.0 * f64::from(eps));
            assert!(
                (numeric - f64::from(analytic)).abs() < 1e-2 * (1.0 + numeric.abs()),
                "param {param_index}: numeric {numeric} vs analytic {analytic}"
            );
        }
    }

    #[test]
    fn half_precision_stays_close_to_full() {
        let model = model(3);
        let input = Array4::from_elem((1, 3, 4, 4), 0.25f32);
        let full = model
            .infer(&input, &ComputeContext::new(Device::Cpu, Precision::Full))
            .expect("full");
        let half = model
            .infer(&input, &ComputeContext::new(Device::Cpu, Precision::Half))
            .expect("half");
        for (a, b) in full.iter().zip(half.iter()) {
            assert!((a - b).abs() < 1e-2);
        }
    }

    #[test]
    fn serde_roundtrip_preserves_parameters() {
        let model = model(3);
        let encoded = serde_json::to_string(&model).expect("serialize model");
        let decoded: DenoisingAutoencoder =
            serde_json::from_str(&encoded).expect("deserialize model");
        for (a, b) in model.parameters().iter().zip(decoded.parameters()) {
            assert_eq!(a.name, b.name);
            assert_eq!(a.value, b.value);
        }
    }
}
