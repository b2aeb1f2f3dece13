//! Building blocks for the reference autoencoder: a 3x3 same-padding
//! convolution (im2col + matmul), ReLU, 2x2 average pooling and nearest
//! upsampling, each with its backward pass.

use std::ops::Range;

use anyhow::{bail, Result};
use ndarray::{s, Array1, Array2, Array3, Array4, ArrayView2, ArrayView3, Axis, Ix1, Zip};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::device::ComputeContext;
use crate::model::Parameter;

const KERNEL: usize = 3;
const KERNEL_AREA: usize = KERNEL * KERNEL;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conv2d {
    pub weight: Parameter,
    pub bias: Parameter,
}

impl Conv2d {
    /// Uniform init in `±1/sqrt(fan_in)` for both weight and bias.
    pub fn new<R: Rng + ?Sized>(
        name: &str,
        in_channels: usize,
        out_channels: usize,
        rng: &mut R,
    ) -> Self {
        let bound = 1.0 / ((in_channels * KERNEL_AREA) as f32).sqrt();
        let weight = Array4::from_shape_fn((out_channels, in_channels, KERNEL, KERNEL), |_| {
            rng.gen_range(-bound..bound)
        });
        let bias = Array1::from_shape_fn(out_channels, |_| rng.gen_range(-bound..bound));

        Self {
            weight: Parameter::new(format!("{name}.weight"), weight.into_dyn()),
            bias: Parameter::new(format!("{name}.bias"), bias.into_dyn()),
        }
    }

    pub fn in_channels(&self) -> usize {
        self.weight.value.shape()[1]
    }

    pub fn out_channels(&self) -> usize {
        self.weight.value.shape()[0]
    }

    /// Weight as an `(out, in * 9)` matrix and the bias, both rounded to the
    /// context precision.
    fn cast_params(&self, ctx: &ComputeContext) -> Result<(Array2<f32>, Array1<f32>)> {
        let mut weight = self
            .weight
            .value
            .view()
            .into_shape_with_order((self.out_channels(), self.in_channels() * KERNEL_AREA))?
            .to_owned();
        let mut bias = self.bias.value.view().into_dimensionality::<Ix1>()?.to_owned();
        ctx.precision.round_in_place(&mut weight);
        ctx.precision.round_in_place(&mut bias);
        Ok((weight, bias))
    }

    pub fn forward(&self, input: &Array4<f32>, ctx: &ComputeContext) -> Result<Array4<f32>> {
        let (n, c, h, w) = input.dim();
        if c != self.in_channels() {
            bail!(
                "{} expects {} input channels, got {c}",
                self.weight.name,
                self.in_channels()
            );
        }
        if h == 0 || w == 0 {
            bail!("{} received an empty {h}x{w} input", self.weight.name);
        }

        let out_channels = self.out_channels();
        let (weight, bias) = self.cast_params(ctx)?;
        let bias_column = bias.view().insert_axis(Axis(1));

        let outputs = ctx.device.map_indexed(n, |i| {
            let mut cols = im2col(input.index_axis(Axis(0), i))?;
            ctx.precision.round_in_place(&mut cols);
            let mut out = weight.dot(&cols);
            out += &bias_column;
            ctx.precision.round_in_place(&mut out);
            Ok(out.into_shape_with_order((out_channels, h, w))?)
        })?;

        stack_samples(&outputs)
    }

    /// Accumulate weight/bias gradients for the `input` that produced
    /// `grad_output` and return the gradient with respect to `input`.
    pub fn backward(
        &mut self,
        input: &Array4<f32>,
        grad_output: &Array4<f32>,
        ctx: &ComputeContext,
    ) -> Result<Array4<f32>> {
        let (n, c, h, w) = input.dim();
        let out_channels = self.out_channels();
        if grad_output.dim() != (n, out_channels, h, w) {
            bail!(
                "{} gradient shape {:?} does not match output shape {:?}",
                self.weight.name,
                grad_output.shape(),
                [n, out_channels, h, w]
            );
        }

        let (weight, _) = self.cast_params(ctx)?;

        let per_sample = ctx.device.map_indexed(n, |i| {
            let mut cols = im2col(input.index_axis(Axis(0), i))?;
            ctx.precision.round_in_place(&mut cols);
            let grad = grad_output.index_axis(Axis(0), i);
            let grad = grad.to_shape((out_channels, h * w))?;

            let grad_weight = grad.dot(&cols.t());
            let grad_bias = grad.sum_axis(Axis(1));
            let grad_cols = weight.t().dot(&grad);
            let mut grad_input = col2im(grad_cols.view(), c, h, w)?;
            ctx.precision.round_in_place(&mut grad_input);
            Ok((grad_input, grad_weight, grad_bias))
        })?;

        let mut grad_weight = Array2::<f32>::zeros((out_channels, c * KERNEL_AREA));
        let mut grad_bias = Array1::<f32>::zeros(out_channels);
        let mut grad_inputs = Vec::with_capacity(n);
        for (grad_input, sample_weight, sample_bias) in per_sample {
            grad_weight += &sample_weight;
            grad_bias += &sample_bias;
            grad_inputs.push(grad_input);
        }
        ctx.precision.round_in_place(&mut grad_weight);
        ctx.precision.round_in_place(&mut grad_bias);

        let grad_weight = grad_weight.into_shape_with_order(self.weight.value.shape())?;
        self.weight.accumulate_grad(grad_weight.view())?;
        self.bias.accumulate_grad(grad_bias.into_dyn().view())?;

        stack_samples(&grad_inputs)
    }
}

/// Offsets a kernel tap `k` in `0..3` into (destination, source) ranges along
/// one axis of length `len`, with zero padding of one pixel.
fn tap_ranges(len: usize, k: usize) -> (Range<usize>, Range<usize>) {
    match k {
        0 => (1..len, 0..len - 1),
        1 => (0..len, 0..len),
        _ => (0..len - 1, 1..len),
    }
}

/// Unfold a `(C, H, W)` sample into a `(C * 9, H * W)` patch matrix.
fn im2col(x: ArrayView3<'_, f32>) -> Result<Array2<f32>> {
    let (c, h, w) = x.dim();
    let mut cols = Array3::<f32>::zeros((c * KERNEL_AREA, h, w));
    for ci in 0..c {
        for ky in 0..KERNEL {
            let (dst_y, src_y) = tap_ranges(h, ky);
            for kx in 0..KERNEL {
                let (dst_x, src_x) = tap_ranges(w, kx);
                let row = (ci * KERNEL + ky) * KERNEL + kx;
                cols.slice_mut(s![row, dst_y.clone(), dst_x])
                    .assign(&x.slice(s![ci, src_y.clone(), src_x]));
            }
        }
    }
    Ok(cols.into_shape_with_order((c * KERNEL_AREA, h * w))?)
}

/// Fold a `(C * 9, H * W)` patch gradient back onto a `(C, H, W)` sample.
fn col2im(cols: ArrayView2<'_, f32>, c: usize, h: usize, w: usize) -> Result<Array3<f32>> {
    let cols = cols.to_shape((c * KERNEL_AREA, h, w))?;
    let mut x = Array3::<f32>::zeros((c, h, w));
    for ci in 0..c {
        for ky in 0..KERNEL {
            let (dst_y, src_y) = tap_ranges(h, ky);
            for kx in 0..KERNEL {
                let (dst_x, src_x) = tap_ranges(w, kx);
                let row = (ci * KERNEL + ky) * KERNEL + kx;
                let mut target = x.slice_mut(s![ci, src_y.clone(), src_x]);
                target += &cols.slice(s![row, dst_y.clone(), dst_x]);
            }
        }
    }
    Ok(x)
}

fn stack_samples(samples: &[Array3<f32>]) -> Result<Array4<f32>> {
    let views: Vec<_> = samples.iter().map(|sample| sample.view()).collect();
    Ok(ndarray::stack(Axis(0), &views)?)
}

pub fn relu_in_place(x: &mut Array4<f32>) {
    x.mapv_inplace(|v| v.max(0.0));
}

/// Zero the gradient wherever the activation was clipped.
pub fn relu_backward_in_place(grad: &mut Array4<f32>, activated: &Array4<f32>) {
    Zip::from(grad).and(activated).for_each(|g, &a| {
        if a <= 0.0 {
            *g = 0.0;
        }
    });
}

const QUADRANTS: [(usize, usize); 4] = [(0, 0), (1, 0), (0, 1), (1, 1)];

/// 2x2 mean pooling with stride 2. Height and width must be even.
pub fn avg_pool2(x: &Array4<f32>) -> Array4<f32> {
    let mut out = x.slice(s![.., .., ..;2, ..;2]).to_owned();
    for &(dy, dx) in &QUADRANTS[1..] {
        out += &x.slice(s![.., .., dy..;2, dx..;2]);
    }
    out *= 0.25;
    out
}

pub fn avg_pool2_backward(grad: &Array4<f32>) -> Array4<f32> {
    let (n, c, h, w) = grad.dim();
    let quarter = grad * 0.25;
    let mut out = Array4::<f32>::zeros((n, c, h * 2, w * 2));
    for (dy, dx) in QUADRANTS {
        out.slice_mut(s![.., .., dy..;2, dx..;2]).assign(&quarter);
    }
    out
}

/// Nearest-neighbour 2x upsampling.
pub fn upsample2(x: &Array4<f32>) -> Array4<f32> {
    let (n, c, h, w) = x.dim();
    let mut out = Array4::<f32>::zeros((n, c, h * 2, w * 2));
    for (dy, dx) in QUADRANTS {
        out.slice_mut(s![.., .., dy..;2, dx..;2]).assign(x);
    }
    out
}

pub fn upsample2_backward(grad: &Array4<f32>) -> Array4<f32> {
    let mut out = grad.slice(s![.., .., ..;2, ..;2]).to_owned();
    for &(dy, dx) in &QUADRANTS[1..] {
        out += &grad.slice(s![.., .., dy..;2, dx..;2]);
    }
    out
}
