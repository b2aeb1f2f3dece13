//! Mixed-precision training loop.
//!
//! Each batch runs forward and backward at the context precision with the loss
//! gradient multiplied by the [`GradScaler`] factor. Parameter gradients are
//! unscaled before the optimizer sees them; if any of them overflowed the
//! optimizer step is skipped entirely and the scale backs off.

use anyhow::{bail, Result};
use ndarray::Array4;
use rand::Rng;
use tracing::{debug, info, warn};

use crate::config::{MixedPrecisionConfig, NonFinitePolicy, RunConfig, TrainingConfig};
use crate::crash;
use crate::dataset::{epoch_batches, PairedDataset};
use crate::device::{ComputeContext, Device, Precision};
use crate::loss::LossKind;
use crate::model::{non_finite_parameters, Denoiser};
use crate::optim::AdamW;
use crate::precision::GradScaler;

#[derive(Debug, Clone, PartialEq)]
pub struct TrainOptions {
    pub epochs: usize,
    pub loss: LossKind,
    pub training: TrainingConfig,
    pub mixed_precision: MixedPrecisionConfig,
    pub non_finite_policy: NonFinitePolicy,
}

impl TrainOptions {
    pub fn new(epochs: usize, loss: LossKind) -> Self {
        Self::from_config(epochs, loss, &RunConfig::default())
    }

    pub fn from_config(epochs: usize, loss: LossKind, config: &RunConfig) -> Self {
        Self {
            epochs,
            loss,
            training: config.training.clone(),
            mixed_precision: config.mixed_precision.clone(),
            non_finite_policy: config.diagnostics.non_finite_policy,
        }
    }

    /// Half precision when mixed precision is on.
    pub fn precision(&self) -> Precision {
        if self.mixed_precision.enabled {
            Precision::Half
        } else {
            Precision::Full
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EpochStats {
    /// 1-based.
    pub epoch: usize,
    pub mean_loss: f32,
    pub batches: usize,
    pub skipped_steps: usize,
}

impl EpochStats {
    /// Mean of the raw per-batch losses.
    pub fn from_losses(epoch: usize, losses: &[f32], skipped_steps: usize) -> Self {
        let total: f64 = losses.iter().map(|&l| f64::from(l)).sum();
        let mean_loss = if losses.is_empty() {
            0.0
        } else {
            (total / losses.len() as f64) as f32
        };
        Self {
            epoch,
            mean_loss,
            batches: losses.len(),
            skipped_steps,
        }
    }
}

#[derive(Debug)]
pub struct TrainOutcome<M> {
    pub model: M,
    pub epochs: Vec<EpochStats>,
    pub final_scale: f32,
    /// Optimizer updates actually applied.
    pub applied_steps: u64,
    pub skipped_steps: usize,
    /// Parameters holding NaN/Inf after the last epoch.
    pub non_finite: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepOutcome {
    /// Unscaled batch loss.
    pub loss: f32,
    pub applied: bool,
}

/// Train `model` on `dataset` for `options.epochs` epochs.
///
/// `rng` drives batch shuffling and crop offsets.
pub fn train<M, R>(
    mut model: M,
    dataset: &PairedDataset<'_>,
    options: &TrainOptions,
    device: Device,
    rng: &mut R,
) -> Result<TrainOutcome<M>>
where
    M: Denoiser,
    R: Rng + ?Sized,
{
    if dataset.is_empty() {
        bail!("cannot train on an empty dataset");
    }

    let ctx = ComputeContext::new(device, options.precision());
    let mut optimizer = AdamW::from_config(&options.training);
    let mut scaler = GradScaler::from_config(&options.mixed_precision);
    let mut history = Vec::with_capacity(options.epochs);
    let mut skipped_total = 0;

    info!(
        model = model.name(),
        parameters = model.parameter_count(),
        samples = dataset.len(),
        epochs = options.epochs,
        batch_size = options.training.batch_size,
        learning_rate = optimizer.lr(),
        loss = %options.loss,
        device = %ctx.device,
        precision = %ctx.precision,
        augment = dataset.augments(),
        "Starting training"
    );

    model.set_training(true);
    for epoch in 1..=options.epochs {
        crash::set_phase(format!("training epoch {epoch}/{}", options.epochs));
        let batches = epoch_batches(dataset.len(), options.training.batch_size, true, rng);
        let mut losses = Vec::with_capacity(batches.len());
        let mut skipped = 0;

        for indices in &batches {
            let (clean, noisy) = dataset.collate(indices, rng)?;
            let step = train_step(
                &mut model,
                &mut optimizer,
                &mut scaler,
                options.loss,
                &clean,
                &noisy,
                &ctx,
            )?;
            if !step.applied {
                skipped += 1;
            }
            losses.push(step.loss);
        }

        let stats = EpochStats::from_losses(epoch, &losses, skipped);
        info!(
            batches = stats.batches,
            skipped = stats.skipped_steps,
            scale = scaler.scale(),
            "Epoch {}/{}: loss {}",
            epoch,
            options.epochs,
            stats.mean_loss
        );
        skipped_total += skipped;
        history.push(stats);
    }
    model.set_training(false);

    let non_finite = non_finite_parameters(&model);
    if !non_finite.is_empty() {
        match options.non_finite_policy {
            NonFinitePolicy::Warn => warn!(
                parameters = ?non_finite,
                "Trained model holds NaN or infinite parameters"
            ),
            NonFinitePolicy::Fail => bail!(
                "trained model holds NaN or infinite parameters: {}",
                non_finite.join(", ")
            ),
        }
    }

    Ok(TrainOutcome {
        model,
        epochs: history,
        final_scale: scaler.scale(),
        applied_steps: optimizer.step_count(),
        skipped_steps: skipped_total,
        non_finite,
    })
}

/// One scaled optimisation step on a collated batch.
pub fn train_step<M: Denoiser + ?Sized>(
    model: &mut M,
    optimizer: &mut AdamW,
    scaler: &mut GradScaler,
    loss_kind: LossKind,
    clean: &Array4<f32>,
    noisy: &Array4<f32>,
    ctx: &ComputeContext,
) -> Result<StepOutcome> {
    model.zero_grad();

    let predicted = model.forward(noisy, ctx)?;
    if predicted.dim() != clean.dim() {
        bail!(
            "{} returned shape {:?} for a target of shape {:?}",
            model.name(),
            predicted.shape(),
            clean.shape()
        );
    }

    let (loss, mut grad) = loss_kind.loss_and_grad(predicted.view(), clean.view())?;
    let scale = scaler.scale();
    grad.mapv_inplace(|g| g * scale);
    ctx.precision.round_in_place(&mut grad);

    model.backward(&grad, ctx)?;

    let mut params = model.parameters_mut();
    let finite = scaler.unscale_and_check(&mut params);
    let applied = finite || !scaler.is_enabled();
    if applied {
        optimizer.step(&mut params);
    } else {
        debug!(scale, "Gradient overflow, skipping optimizer step");
    }
    scaler.update(finite);

    Ok(StepOutcome { loss, applied })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::ImageStack;
    use crate::model::DenoisingAutoencoder;
    use ndarray::ArrayD;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn snapshot<M: Denoiser>(model: &M) -> Vec<ArrayD<f32>> {
        model.parameters().iter().map(|p| p.value.clone()).collect()
    }

    fn model() -> DenoisingAutoencoder {
        DenoisingAutoencoder::new(3, 4, &mut StdRng::seed_from_u64(21))
    }

    #[test]
    fn epoch_loss_is_mean_of_batch_losses() {
        let stats = EpochStats::from_losses(1, &[0.4, 0.2, 0.3], 0);
        assert!((stats.mean_loss - 0.3).abs() < 1e-6);
        assert_eq!(stats.batches, 3);
    }

    #[test]
    fn overflowing_step_is_skipped_and_scale_backs_off() {
        let mut model = model();
        let before = snapshot(&model);
        let mut optimizer = AdamW::default_params(1e-4);
        let mut scaler = GradScaler::new(1e30);
        let ctx = ComputeContext::new(Device::Cpu, Precision::Half);
        let noisy = Array4::from_elem((2, 3, 4, 4), 0.5f32);
        let clean = Array4::zeros((2, 3, 4, 4));

        let step = train_step(
            &mut model,
            &mut optimizer,
            &mut scaler,
            LossKind::L2,
            &clean,
            &noisy,
            &ctx,
        )
        .expect("train step");

        assert!(!step.applied);
        assert!(step.loss.is_finite());
        assert_eq!(snapshot(&model), before);
        assert_eq!(optimizer.step_count(), 0);
        assert_eq!(scaler.scale(), 0.5e30);
        assert_eq!(scaler.overflow_count(), 1);
    }

    #[test]
    fn finite_step_updates_parameters() {
        let mut model = model();
        let before = snapshot(&model);
        let mut optimizer = AdamW::default_params(1e-2);
        let mut scaler = GradScaler::new(1024.0);
        let ctx = ComputeContext::new(Device::Cpu, Precision::Half);
        let noisy = Array4::from_elem((2, 3, 4, 4), 0.5f32);
        let clean = Array4::zeros((2, 3, 4, 4));

        let step = train_step(
            &mut model,
            &mut optimizer,
            &mut scaler,
            LossKind::L1,
            &clean,
            &noisy,
            &ctx,
        )
        .expect("train step");

        assert!(step.applied);
        assert_ne!(snapshot(&model), before);
        assert_eq!(optimizer.step_count(), 1);
        assert_eq!(scaler.scale(), 1024.0);
        assert_eq!(scaler.successful_steps(), 1);
    }

    struct Shrinking;

    impl Denoiser for Shrinking {
        fn name(&self) -> &str {
            "shrinking"
        }
        fn infer(&self, noisy: &Array4<f32>, _ctx: &ComputeContext) -> Result<Array4<f32>> {
            Ok(noisy.slice(ndarray::s![.., .., 1.., ..]).to_owned())
        }
        fn forward(&mut self, noisy: &Array4<f32>, ctx: &ComputeContext) -> Result<Array4<f32>> {
            self.infer(noisy, ctx)
        }
        fn backward(&mut self, _grad: &Array4<f32>, _ctx: &ComputeContext) -> Result<()> {
            Ok(())
        }
        fn parameters(&self) -> Vec<&crate::model::Parameter> {
            Vec::new()
        }
        fn parameters_mut(&mut self) -> Vec<&mut crate::model::Parameter> {
            Vec::new()
        }
    }

    #[test]
    fn shape_changing_model_is_rejected() {
        let batch = Array4::zeros((1, 3, 4, 4));
        let err = train_step(
            &mut Shrinking,
            &mut AdamW::default_params(1e-4),
            &mut GradScaler::default(),
            LossKind::L2,
            &batch,
            &batch,
            &ComputeContext::default(),
        )
        .expect_err("shape mismatch");
        assert!(err.to_string().contains("shrinking"));
    }

    #[test]
    fn short_run_reports_every_epoch() {
        let clean = ImageStack::new(Array4::from_elem((5, 3, 8, 8), 0.25f32), Vec::new());
        let noisy = ImageStack::new(
            Array4::from_shape_fn((5, 3, 8, 8), |(n, c, y, x)| {
                0.25 + 0.01 * ((n + c + y + x) % 3) as f32
            }),
            Vec::new(),
        );
        let dataset = PairedDataset::new(&clean, &noisy).expect("paired dataset");
        let mut options = TrainOptions::new(2, LossKind::L1Smooth);
        options.training.batch_size = 2;

        let outcome = train(
            model(),
            &dataset,
            &options,
            Device::Accelerator,
            &mut StdRng::seed_from_u64(4),
        )
        .expect("train");

        assert_eq!(outcome.epochs.len(), 2);
        assert!(outcome.epochs.iter().all(|e| e.batches == 3));
        assert_eq!(outcome.applied_steps as usize + outcome.skipped_steps, 6);
        assert!(outcome.epochs.iter().all(|e| e.mean_loss.is_finite()));
        assert!(outcome.non_finite.is_empty());
        assert!(!outcome.model.is_training());
    }

    #[test]
    fn fail_policy_rejects_non_finite_model() {
        let clean = ImageStack::new(Array4::zeros((1, 3, 4, 4)), Vec::new());
        let noisy = clean.clone();
        let dataset = PairedDataset::new(&clean, &noisy).expect("paired dataset");
        let mut model = model();
        model.parameters_mut()[1]
            .value
            .as_slice_mut()
            .expect("contiguous")[0] = f32::NAN;

        let mut options = TrainOptions::new(0, LossKind::L2);
        options.non_finite_policy = NonFinitePolicy::Fail;
        assert!(train(model, &dataset, &options, Device::Cpu, &mut StdRng::seed_from_u64(0)).is_err());
    }
}
