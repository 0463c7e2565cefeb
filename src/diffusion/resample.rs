//! Timestep samplers for training
//!
//! A sampler draws one diffusion timestep per example together with an
//! importance weight, so that `mean(loss * weight)` stays an unbiased
//! estimate of the uniformly weighted objective. The loss-aware sampler
//! concentrates draws on timesteps whose recent losses are large.

use anyhow::Result;
use candle_core::{Device, Tensor};
use rand::distributions::{Distribution, WeightedIndex};
use rand::Rng;

use crate::error::TexDiffError;

/// Losses kept per timestep before the loss-aware sampler trusts its stats.
pub const HISTORY_PER_TERM: usize = 10;
/// Probability mass always spread uniformly over timesteps.
pub const UNIFORM_PROB: f64 = 0.001;

/// Timesteps drawn for one batch.
pub struct TimestepDraw {
    /// Respaced timestep index per example.
    pub timesteps: Vec<usize>,
    /// [B] importance weights, f32.
    pub weights: Tensor,
}

#[derive(Debug, Clone)]
pub struct LossSecondMomentResampler {
    num_timesteps: usize,
    history_per_term: usize,
    uniform_prob: f64,
    loss_history: Vec<Vec<f64>>,
    loss_counts: Vec<usize>,
}

impl LossSecondMomentResampler {
    pub fn new(num_timesteps: usize, history_per_term: usize, uniform_prob: f64) -> Self {
        Self {
            num_timesteps,
            history_per_term,
            uniform_prob,
            loss_history: vec![vec![0.0; history_per_term]; num_timesteps],
            loss_counts: vec![0; num_timesteps],
        }
    }

    /// Number of losses recorded per timestep, capped at the history size.
    pub fn loss_counts(&self) -> &[usize] {
        &self.loss_counts
    }

    /// True once every timestep has a full history.
    pub fn warmed_up(&self) -> bool {
        self.loss_counts.iter().all(|&c| c == self.history_per_term)
    }

    pub fn weights(&self) -> Vec<f64> {
        if !self.warmed_up() {
            return vec![1.0; self.num_timesteps];
        }
        let rms: Vec<f64> = self
            .loss_history
            .iter()
            .map(|h| (h.iter().map(|l| l * l).sum::<f64>() / h.len() as f64).sqrt())
            .collect();
        let total: f64 = rms.iter().sum();
        if total <= 0.0 || !total.is_finite() {
            return vec![1.0; self.num_timesteps];
        }
        let uniform = self.uniform_prob / self.num_timesteps as f64;
        rms.iter()
            .map(|w| w / total * (1.0 - self.uniform_prob) + uniform)
            .collect()
    }

    /// Record the losses observed at timesteps `ts`.
    pub fn update_with_all_losses(&mut self, ts: &[usize], losses: &[f64]) {
        for (&t, &loss) in ts.iter().zip(losses) {
            let Some(history) = self.loss_history.get_mut(t) else {
                continue;
            };
            if self.loss_counts[t] == self.history_per_term {
                // Ring full: drop the oldest entry
                history.rotate_left(1);
                history[self.history_per_term - 1] = loss;
            } else {
                history[self.loss_counts[t]] = loss;
                self.loss_counts[t] += 1;
            }
        }
    }
}

/// Schedule sampler, chosen by name at construction.
#[derive(Debug, Clone)]
pub enum ScheduleSampler {
    Uniform { num_timesteps: usize },
    LossSecondMoment(LossSecondMomentResampler),
}

/// Create a sampler by name: `uniform` or `loss-second-moment`.
pub fn create_named_schedule_sampler(name: &str, num_timesteps: usize) -> Result<ScheduleSampler> {
    match name {
        "uniform" => Ok(ScheduleSampler::Uniform { num_timesteps }),
        "loss-second-moment" => Ok(ScheduleSampler::LossSecondMoment(
            LossSecondMomentResampler::new(num_timesteps, HISTORY_PER_TERM, UNIFORM_PROB),
        )),
        other => Err(TexDiffError::UnknownSampler(other.to_string()).into()),
    }
}

impl ScheduleSampler {
    /// Whether training should feed losses back through
    /// [`ScheduleSampler::update_with_local_losses`].
    pub fn is_loss_aware(&self) -> bool {
        matches!(self, ScheduleSampler::LossSecondMoment(_))
    }

    pub fn num_timesteps(&self) -> usize {
        match self {
            ScheduleSampler::Uniform { num_timesteps } => *num_timesteps,
            ScheduleSampler::LossSecondMoment(s) => s.num_timesteps,
        }
    }

    /// Unnormalized sampling weight per timestep.
    pub fn weights(&self) -> Vec<f64> {
        match self {
            ScheduleSampler::Uniform { num_timesteps } => vec![1.0; *num_timesteps],
            ScheduleSampler::LossSecondMoment(s) => s.weights(),
        }
    }

    /// Draw `batch_size` timesteps and their importance weights.
    pub fn sample<R: Rng + ?Sized>(
        &self,
        batch_size: usize,
        device: &Device,
        rng: &mut R,
    ) -> Result<TimestepDraw> {
        let weights = self.weights();
        let total: f64 = weights.iter().sum();
        let n = weights.len() as f64;
        let dist = WeightedIndex::new(&weights)?;

        let timesteps: Vec<usize> = (0..batch_size).map(|_| dist.sample(rng)).collect();
        let importance: Vec<f32> = timesteps
            .iter()
            .map(|&t| (1.0 / (n * weights[t] / total)) as f32)
            .collect();

        Ok(TimestepDraw {
            weights: Tensor::from_vec(importance, batch_size, device)?,
            timesteps,
        })
    }

    /// Feed back per-example losses. A no-op for samplers that are not
    /// loss-aware.
    pub fn update_with_local_losses(&mut self, ts: &[usize], losses: &[f64]) {
        if let ScheduleSampler::LossSecondMoment(s) = self {
            s.update_with_all_losses(ts, losses);
        }
    }
}
