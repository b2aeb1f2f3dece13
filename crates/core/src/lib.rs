//! Paired clean/noisy dataset loading, mixed-precision denoiser training and
//! deterministic validation.

pub mod cfa;
pub mod config;
pub mod crash;
pub mod dataset;
pub mod device;
pub mod error;
pub mod loader;
pub mod logging;
pub mod loss;
pub mod model;
pub mod optim;
pub mod precision;
pub mod report;
pub mod train;
pub mod validate;
