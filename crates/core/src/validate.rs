//! Deterministic validation pass.

use anyhow::{bail, Result};
use ndarray::{s, Array4};
use tracing::{debug, info};

use crate::crash;
use crate::dataset::{sequential_batches, PairedDataset};
use crate::device::{ComputeContext, Device, Precision};
use crate::loader::ImageStack;
use crate::loss::LossKind;
use crate::model::Denoiser;

/// Mean squared error of every validation batch, in dataset order.
///
/// Batches are never shuffled or cropped and run at full precision through
/// [`Denoiser::infer`], which always behaves as in evaluation mode. The
/// model is only read.
pub fn validate<M: Denoiser + ?Sized>(
    model: &M,
    clean: &ImageStack,
    noisy: &ImageStack,
    batch_size: usize,
    device: Device,
) -> Result<Vec<f32>> {
    let dataset = PairedDataset::new(clean, noisy)?;
    if dataset.is_empty() {
        bail!("cannot validate on an empty dataset");
    }

    crash::set_phase(format!("validation of {} samples", dataset.len()));
    let losses = batch_losses(model, &dataset, batch_size, device)?;

    info!(
        samples = dataset.len(),
        batches = losses.len(),
        mean = losses.iter().sum::<f32>() / losses.len().max(1) as f32,
        "Validation finished"
    );
    Ok(losses)
}

fn batch_losses<M: Denoiser + ?Sized>(
    model: &M,
    dataset: &PairedDataset<'_>,
    batch_size: usize,
    device: Device,
) -> Result<Vec<f32>> {
    let ctx = ComputeContext::new(device, Precision::Full);
    let batches = sequential_batches(dataset.len(), batch_size);

    let mut losses = Vec::with_capacity(batches.len());
    for (batch, indices) in batches.iter().enumerate() {
        let (clean, noisy) = dataset.collate_uncropped(indices)?;
        let denoised = model.infer(&noisy, &ctx)?;
        if denoised.dim() != clean.dim() {
            bail!(
                "{} returned shape {:?} for a target of shape {:?}",
                model.name(),
                denoised.shape(),
                clean.shape()
            );
        }
        let loss = LossKind::L2.loss(denoised.view(), clean.view())?;
        debug!(batch, size = indices.len(), loss, "Validation batch");
        losses.push(loss);
    }
    Ok(losses)
}

/// Target, input and output for the first `count` samples.
#[derive(Debug, Clone)]
pub struct Preview {
    pub clean: Array4<f32>,
    pub noisy: Array4<f32>,
    pub denoised: Array4<f32>,
}

pub fn preview<M: Denoiser + ?Sized>(
    model: &M,
    clean: &ImageStack,
    noisy: &ImageStack,
    count: usize,
    device: Device,
) -> Result<Preview> {
    let count = count.min(clean.len()).min(noisy.len());
    if count == 0 {
        bail!("no samples to preview");
    }
    let clean = clean.data.slice(s![..count, .., .., ..]).to_owned();
    let noisy = noisy.data.slice(s![..count, .., .., ..]).to_owned();
    let denoised = model.infer(&noisy, &ComputeContext::new(device, Precision::Full))?;
    Ok(Preview {
        clean,
        noisy,
        denoised,
    })
}
