//! Compute device and numeric precision selection.
//!
//! The device is chosen once per run and handed to the loader, trainer and
//! validator through [`ComputeContext`]; nothing re-queries the machine mid-run.

use anyhow::Result;
use half::f16;
use ndarray::{ArrayBase, DataMut, Dimension};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

/// Where per-sample work runs.
///
/// `Accelerator` fans batch samples out over the rayon pool; `Cpu` walks them
/// in order on the calling thread. Both produce identical results because
/// per-sample outputs are always reassembled in index order.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Device {
    #[default]
    Cpu,
    Accelerator,
}

impl Device {
    /// Pick the accelerator when more than one hardware thread is available.
    pub fn detect() -> Self {
        let threads = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        if threads > 1 {
            Self::Accelerator
        } else {
            Self::Cpu
        }
    }

    /// Workers used for per-sample work.
    pub fn threads(&self) -> usize {
        match self {
            Self::Cpu => 1,
            Self::Accelerator => rayon::current_num_threads(),
        }
    }

    /// Run `f` for every index in `0..count`, returning results in index order.
    pub fn map_indexed<T, F>(&self, count: usize, f: F) -> Result<Vec<T>>
    where
        T: Send,
        F: Fn(usize) -> Result<T> + Sync + Send,
    {
        match self {
            Self::Cpu => (0..count).map(f).collect(),
            Self::Accelerator => (0..count).into_par_iter().map(f).collect(),
        }
    }
}

impl std::fmt::Display for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cpu => write!(f, "cpu"),
            Self::Accelerator => write!(f, "accelerator"),
        }
    }
}

/// Numeric precision used for forward and backward compute.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Precision {
    #[default]
    Full,
    /// Values are rounded through IEEE binary16 after every op.
    /// Anything beyond the f16 range becomes infinite.
    Half,
}

impl Precision {
    pub fn round(&self, value: f32) -> f32 {
        match self {
            Self::Full => value,
            Self::Half => f16::from_f32(value).to_f32(),
        }
    }

    pub fn round_in_place<S, D>(&self, array: &mut ArrayBase<S, D>)
    where
        S: DataMut<Elem = f32>,
        D: Dimension,
    {
        if matches!(self, Self::Half) {
            array.mapv_inplace(|v| f16::from_f32(v).to_f32());
        }
    }
}

impl std::fmt::Display for Precision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Full => write!(f, "f32"),
            Self::Half => write!(f, "f16"),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ComputeContext {
    pub device: Device,
    pub precision: Precision,
}

impl ComputeContext {
    pub fn new(device: Device, precision: Precision) -> Self {
        Self { device, precision }
    }
}
