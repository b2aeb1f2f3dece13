//! AdamW optimizer (Adam with decoupled weight decay).

use ndarray::{ArrayD, Zip};

use crate::config::TrainingConfig;
use crate::model::Parameter;

/// AdamW optimizer.
///
/// Weight decay is applied to the parameters directly instead of being folded
/// into the gradient:
///
/// θ_t = θ_{t-1}·(1 − lr·λ) − lr · m̂_t / (√v̂_t + ε)
///
/// Moment buffers are allocated lazily per parameter slot and are only touched
/// by [`AdamW::step`]; a skipped step leaves them and the step counter as they
/// were.
pub struct AdamW {
    lr: f32,
    beta1: f32,
    beta2: f32,
    epsilon: f32,
    weight_decay: f32,
    t: u64,
    m: Vec<Option<ArrayD<f32>>>,
    v: Vec<Option<ArrayD<f32>>>,
}

impl AdamW {
    pub fn new(lr: f32, beta1: f32, beta2: f32, epsilon: f32, weight_decay: f32) -> Self {
        Self {
            lr,
            beta1,
            beta2,
            epsilon,
            weight_decay,
            t: 0,
            m: Vec::new(),
            v: Vec::new(),
        }
    }

    /// Default betas and epsilon with weight decay 0.01.
    #[cfg(test)]
    pub(crate) fn default_params(lr: f32) -> Self {
        Self::new(lr, 0.9, 0.999, 1e-8, 0.01)
    }

    pub fn from_config(config: &TrainingConfig) -> Self {
        Self::new(
            config.learning_rate,
            config.beta1,
            config.beta2,
            config.epsilon,
            config.weight_decay,
        )
    }

    pub fn lr(&self) -> f32 {
        self.lr
    }

    pub fn step_count(&self) -> u64 {
        self.t
    }

    pub fn step(&mut self, params: &mut [&mut Parameter]) {
        if self.m.len() < params.len() {
            self.m.resize(params.len(), None);
            self.v.resize(params.len(), None);
        }
        self.t += 1;

        let bias1 = 1.0 - self.beta1.powi(self.t as i32);
        let bias2 = 1.0 - self.beta2.powi(self.t as i32);
        let decay = 1.0 - self.lr * self.weight_decay;
        let (beta1, beta2, lr, eps) = (self.beta1, self.beta2, self.lr, self.epsilon);

        for (i, param) in params.iter_mut().enumerate() {
            let m = self.m[i].get_or_insert_with(|| ArrayD::zeros(param.value.raw_dim()));
            let v = self.v[i].get_or_insert_with(|| ArrayD::zeros(param.value.raw_dim()));

            Zip::from(&mut param.value)
                .and(&param.grad)
                .and(m)
                .and(v)
                .for_each(|p, &g, m, v| {
                    *m = beta1 * *m + (1.0 - beta1) * g;
                    *v = beta2 * *v + (1.0 - beta2) * g * g;
                    let m_hat = *m / bias1;
                    let v_hat = *v / bias2;
                    *p = *p * decay - lr * m_hat / (v_hat.sqrt() + eps);
                });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn param(value: f32, grad: f32) -> Parameter {
        let mut p = Parameter::new("w", ArrayD::from_elem(vec![1], value));
        p.grad.fill(grad);
        p
    }

    fn first(p: &Parameter) -> f32 {
        p.value.as_slice().expect("contiguous")[0]
    }

    #[test]
    fn first_step_moves_by_lr_against_gradient() {
        // With bias correction, step one is lr * g / (|g| + eps) ≈ lr * sign(g).
        let mut opt = AdamW::new(0.1, 0.9, 0.999, 1e-8, 0.0);
        let mut p = param(1.0, 0.5);
        opt.step(&mut [&mut p]);
        assert!((first(&p) - 0.9).abs() < 1e-6);
        assert_eq!(opt.step_count(), 1);
    }

    #[test]
    fn weight_decay_is_decoupled() {
        let mut opt = AdamW::new(0.1, 0.9, 0.999, 1e-8, 0.5);
        let mut p = param(2.0, 0.0);
        opt.step(&mut [&mut p]);
        // Zero gradient: only the decay term acts.
        assert!((first(&p) - 2.0 * (1.0 - 0.1 * 0.5)).abs() < 1e-6);
    }

    #[test]
    fn converges_on_quadratic() {
        let mut opt = AdamW::new(0.05, 0.9, 0.999, 1e-8, 0.0);
        let mut p = param(3.0, 0.0);
        for _ in 0..500 {
            let x = first(&p);
            p.grad.fill(2.0 * (x - 1.0));
            opt.step(&mut [&mut p]);
        }
        assert!((first(&p) - 1.0).abs() < 5e-2);
    }

    #[test]
    fn defaults() {
        let opt = AdamW::default_params(1e-4);
        assert_eq!(opt.lr(), 1e-4);
        assert_eq!(opt.step_count(), 0);
    }
}
