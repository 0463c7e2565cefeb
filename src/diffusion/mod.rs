//! Gaussian diffusion process, noise schedules and timestep samplers
//!
//! Everything here is built once from a [`DiffusionConfig`] and then only
//! read, except the loss-aware sampler statistics which the training step
//! feeds back after every loss computation.

pub mod gaussian;
pub mod losses;
pub mod resample;
pub mod schedule;

use anyhow::Result;
use candle_core::{Device, Shape, Tensor};
use rand::Rng;
use rand_distr::StandardNormal;
use serde::{Deserialize, Serialize};

pub use gaussian::{GaussianDiffusion, LossType, ModelMeanType, ModelVarType, TrainingLosses};
pub use resample::{create_named_schedule_sampler, ScheduleSampler, TimestepDraw};

/// Diffusion process configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiffusionConfig {
    pub steps: usize,
    pub noise_schedule: String,
    pub learn_sigma: bool,
    pub sigma_small: bool,
    pub use_kl: bool,
    pub predict_xstart: bool,
    pub rescale_timesteps: bool,
    pub rescale_learned_sigmas: bool,
    /// Empty keeps every step; see [`schedule::space_timesteps`].
    pub timestep_respacing: String,
}

impl Default for DiffusionConfig {
    fn default() -> Self {
        Self {
            steps: 1000,
            noise_schedule: "linear".to_string(),
            learn_sigma: false,
            sigma_small: false,
            use_kl: false,
            predict_xstart: false,
            rescale_timesteps: false,
            rescale_learned_sigmas: true,
            timestep_respacing: String::new(),
        }
    }
}

impl DiffusionConfig {
    pub fn mean_type(&self) -> ModelMeanType {
        if self.predict_xstart {
            ModelMeanType::StartX
        } else {
            ModelMeanType::Epsilon
        }
    }

    pub fn var_type(&self) -> ModelVarType {
        if self.learn_sigma {
            ModelVarType::LearnedRange
        } else if self.sigma_small {
            ModelVarType::FixedSmall
        } else {
            ModelVarType::FixedLarge
        }
    }

    pub fn loss_type(&self) -> LossType {
        if self.use_kl {
            LossType::RescaledKl
        } else if self.rescale_learned_sigmas {
            LossType::RescaledMse
        } else {
            LossType::Mse
        }
    }
}

/// Build the (possibly respaced) diffusion process described by `config`.
pub fn diffusion_from_config(config: &DiffusionConfig) -> Result<GaussianDiffusion> {
    let betas = schedule::named_beta_schedule(&config.noise_schedule, config.steps)?;
    let use_timesteps = schedule::space_timesteps(config.steps, &config.timestep_respacing)?;
    let (betas, timestep_map) = schedule::respace_betas(&betas, &use_timesteps);

    log::info!(
        "Diffusion: {} schedule, {} of {} steps, mean={:?} var={:?} loss={:?}",
        config.noise_schedule,
        betas.len(),
        config.steps,
        config.mean_type(),
        config.var_type(),
        config.loss_type(),
    );

    GaussianDiffusion::new(
        betas,
        timestep_map,
        config.steps,
        config.mean_type(),
        config.var_type(),
        config.loss_type(),
        config.rescale_timesteps,
    )
}

/// Standard normal noise drawn from `rng`.
///
/// Noise is generated on the host so that seeded runs are reproducible on
/// every device.
pub fn seeded_randn<S: Into<Shape>, R: Rng + ?Sized>(
    shape: S,
    device: &Device,
    rng: &mut R,
) -> Result<Tensor> {
    let shape = shape.into();
    let data: Vec<f32> = (0..shape.elem_count())
        .map(|_| rng.sample(StandardNormal))
        .collect();
    Ok(Tensor::from_vec(data, shape, device)?)
}
