//! Clean/noisy pairing, crop augmentation and batching.

use anyhow::{Context, Result};
use ndarray::{s, Array3, Array4, ArrayView3, Axis};
use rand::seq::SliceRandom;
use rand::Rng;

use crate::error::DatasetError;
use crate::loader::ImageStack;

/// Pixels removed from each spatial dimension by the crop augmentation.
pub const CROP_MARGIN: usize = 32;

/// One of the four sub-block shifts used by crop augmentation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct CropOffset {
    pub x: usize,
    pub y: usize,
}

impl CropOffset {
    pub const ALL: [CropOffset; 4] = [
        CropOffset { x: 0, y: 0 },
        CropOffset { x: 1, y: 0 },
        CropOffset { x: 0, y: 1 },
        CropOffset { x: 1, y: 1 },
    ];

    /// Uniform draw over [`CropOffset::ALL`].
    pub fn draw<R: Rng + ?Sized>(rng: &mut R) -> Self {
        Self::ALL[rng.gen_range(0..Self::ALL.len())]
    }
}

/// Crop `(C, H, W)` to `[y .. H-32+y, x .. W-32+x]`.
pub fn crop(sample: ArrayView3<'_, f32>, offset: CropOffset) -> Result<Array3<f32>, DatasetError> {
    let (_, height, width) = sample.dim();
    check_crop_size(height, width)?;
    let (y, x) = (offset.y, offset.x);
    Ok(sample
        .slice(s![.., y..height - CROP_MARGIN + y, x..width - CROP_MARGIN + x])
        .to_owned())
}

fn check_crop_size(height: usize, width: usize) -> Result<(), DatasetError> {
    if height <= CROP_MARGIN || width <= CROP_MARGIN {
        return Err(DatasetError::CropSize {
            height,
            width,
            margin: CROP_MARGIN,
        });
    }
    Ok(())
}

#[derive(Debug, Clone)]
pub struct PairedSample {
    pub clean: Array3<f32>,
    pub noisy: Array3<f32>,
    /// The offset applied to both tensors, if augmentation is on.
    pub offset: Option<CropOffset>,
}

/// Index-aligned view over a clean and a noisy stack.
#[derive(Debug, Clone, Copy)]
pub struct PairedDataset<'a> {
    clean: &'a ImageStack,
    noisy: &'a ImageStack,
    augment: bool,
}

impl<'a> PairedDataset<'a> {
    pub fn new(clean: &'a ImageStack, noisy: &'a ImageStack) -> Result<Self, DatasetError> {
        if clean.len() != noisy.len() {
            return Err(DatasetError::LengthMismatch {
                clean: clean.len(),
                noisy: noisy.len(),
            });
        }
        if !clean.is_empty() && clean.sample_shape() != noisy.sample_shape() {
            return Err(DatasetError::ShapeMismatch {
                path: noisy.sources.first().cloned().unwrap_or_default(),
                first: clean.sources.first().cloned().unwrap_or_default(),
                expected: clean.sample_shape(),
                actual: noisy.sample_shape(),
            });
        }
        Ok(Self {
            clean,
            noisy,
            augment: false,
        })
    }

    /// Enable random crop augmentation. Fails up front when samples are too
    /// small to crop.
    pub fn with_crop_augment(mut self, augment: bool) -> Result<Self, DatasetError> {
        if augment && !self.is_empty() {
            let [_, height, width] = self.clean.sample_shape();
            check_crop_size(height, width)?;
        }
        self.augment = augment;
        Ok(self)
    }

    pub fn len(&self) -> usize {
        self.clean.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn augments(&self) -> bool {
        self.augment
    }

    /// Fetch a pair. With augmentation on, one offset is drawn from `rng`
    /// and applied to both tensors.
    pub fn get<R: Rng + ?Sized>(
        &self,
        index: usize,
        rng: &mut R,
    ) -> Result<PairedSample, DatasetError> {
        let offset = self.augment.then(|| CropOffset::draw(rng));
        self.get_with_offset(index, offset)
    }

    pub fn get_with_offset(
        &self,
        index: usize,
        offset: Option<CropOffset>,
    ) -> Result<PairedSample, DatasetError> {
        let clean = self.clean.sample(index)?;
        let noisy = self.noisy.sample(index)?;
        match offset {
            Some(offset) => Ok(PairedSample {
                clean: crop(clean, offset)?,
                noisy: crop(noisy, offset)?,
                offset: Some(offset),
            }),
            None => Ok(PairedSample {
                clean: clean.to_owned(),
                noisy: noisy.to_owned(),
                offset: None,
            }),
        }
    }

    /// Stack the samples at `indices` into `(clean, noisy)` batches. Offsets
    /// are drawn in `indices` order.
    pub fn collate<R: Rng + ?Sized>(
        &self,
        indices: &[usize],
        rng: &mut R,
    ) -> Result<(Array4<f32>, Array4<f32>)> {
        let pairs = indices
            .iter()
            .map(|&index| self.get(index, rng))
            .collect::<Result<Vec<_>, _>>()?;
        stack_pairs(&pairs)
    }

    /// Like [`PairedDataset::collate`] but never crops.
    pub fn collate_uncropped(&self, indices: &[usize]) -> Result<(Array4<f32>, Array4<f32>)> {
        let pairs = indices
            .iter()
            .map(|&index| self.get_with_offset(index, None))
            .collect::<Result<Vec<_>, _>>()?;
        stack_pairs(&pairs)
    }
}

fn stack_pairs(pairs: &[PairedSample]) -> Result<(Array4<f32>, Array4<f32>)> {
    let clean: Vec<_> = pairs.iter().map(|p| p.clean.view()).collect();
    let noisy: Vec<_> = pairs.iter().map(|p| p.noisy.view()).collect();
    Ok((
        ndarray::stack(Axis(0), &clean).context("failed to collate clean batch")?,
        ndarray::stack(Axis(0), &noisy).context("failed to collate noisy batch")?,
    ))
}

/// Split `0..len` into batches of `batch_size`, shuffled with `rng` when
/// `shuffle` is set. The last batch may be short.
pub fn epoch_batches<R: Rng + ?Sized>(
    len: usize,
    batch_size: usize,
    shuffle: bool,
    rng: &mut R,
) -> Vec<Vec<usize>> {
    let mut order: Vec<usize> = (0..len).collect();
    if shuffle {
        order.shuffle(rng);
    }
    chunk(&order, batch_size)
}

/// `0..len` in order, split into batches of `batch_size`.
pub fn sequential_batches(len: usize, batch_size: usize) -> Vec<Vec<usize>> {
    let order: Vec<usize> = (0..len).collect();
    chunk(&order, batch_size)
}

fn chunk(order: &[usize], batch_size: usize) -> Vec<Vec<usize>> {
    order
        .chunks(batch_size.max(1))
        .map(|chunk| chunk.to_vec())
        .collect()
}
