//! Reconstruction losses, mean-reduced over every element of the batch.

use std::fmt;

use anyhow::{bail, Result};
use ndarray::{Array4, ArrayView4, Zip};
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum LossKind {
    /// Mean absolute error.
    L1,
    /// Huber loss with threshold 1.
    L1Smooth,
    /// Mean squared error.
    #[default]
    L2,
}

const SMOOTH_L1_BETA: f32 = 1.0;

impl LossKind {
    fn element(&self, diff: f32) -> (f32, f32) {
        match self {
            Self::L1 => (diff.abs(), sign(diff)),
            Self::L1Smooth => {
                if diff.abs() < SMOOTH_L1_BETA {
                    (0.5 * diff * diff / SMOOTH_L1_BETA, diff / SMOOTH_L1_BETA)
                } else {
                    (diff.abs() - 0.5 * SMOOTH_L1_BETA, sign(diff))
                }
            }
            Self::L2 => (diff * diff, 2.0 * diff),
        }
    }

    pub fn loss(&self, predicted: ArrayView4<'_, f32>, target: ArrayView4<'_, f32>) -> Result<f32> {
        check_shapes(&predicted, &target)?;
        let count = predicted.len().max(1) as f64;
        let mut total = 0.0f64;
        Zip::from(&predicted).and(&target).for_each(|&p, &t| {
            total += f64::from(self.element(p - t).0);
        });
        Ok((total / count) as f32)
    }

    /// Loss value and its gradient with respect to `predicted`.
    pub fn loss_and_grad(
        &self,
        predicted: ArrayView4<'_, f32>,
        target: ArrayView4<'_, f32>,
    ) -> Result<(f32, Array4<f32>)> {
        check_shapes(&predicted, &target)?;
        let count = predicted.len().max(1);
        let inv_count = 1.0 / count as f32;
        let mut total = 0.0f64;
        let mut grad = Array4::<f32>::zeros(predicted.raw_dim());
        Zip::from(&mut grad)
            .and(&predicted)
            .and(&target)
            .for_each(|g, &p, &t| {
                let (value, slope) = self.element(p - t);
                total += f64::from(value);
                *g = slope * inv_count;
            });
        Ok(((total / count as f64) as f32, grad))
    }
}

fn sign(value: f32) -> f32 {
    if value > 0.0 {
        1.0
    } else if value < 0.0 {
        -1.0
    } else {
        0.0
    }
}

fn check_shapes(predicted: &ArrayView4<'_, f32>, target: &ArrayView4<'_, f32>) -> Result<()> {
    if predicted.shape() != target.shape() {
        bail!(
            "prediction shape {:?} does not match target shape {:?}",
            predicted.shape(),
            target.shape()
        );
    }
    Ok(())
}

impl fmt::Display for LossKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::L1 => write!(f, "L1"),
            Self::L1Smooth => write!(f, "L1smooth"),
            Self::L2 => write!(f, "L2"),
        }
    }
}
