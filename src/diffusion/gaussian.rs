//! Gaussian diffusion: forward noising, training losses and ancestral sampling
//! Schedule coefficients are kept on the host in f64 and gathered per batch.

use anyhow::{Context, Result};
use candle_core::{DType, Device, Tensor};
use log::debug;
use rand::Rng;

use super::losses::{discretized_gaussian_log_likelihood, mean_flat, normal_kl};
use super::seeded_randn;
use crate::error::TexDiffError;
use crate::models::DenoiseModel;

/// What the network predicts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelMeanType {
    Epsilon,
    StartX,
}

/// How the reverse-process variance is obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelVarType {
    /// Posterior variance (beta tilde).
    FixedSmall,
    /// Betas, with the first entry replaced by the posterior variance.
    FixedLarge,
    /// Network outputs an interpolation frac in [-1, 1] between the two.
    LearnedRange,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LossType {
    Mse,
    /// MSE plus the variational bound scaled to the number of steps.
    RescaledMse,
    RescaledKl,
}

impl ModelVarType {
    pub fn is_learned(&self) -> bool {
        matches!(self, ModelVarType::LearnedRange)
    }
}

/// Per-example training losses and the tensors needed for visualization.
pub struct TrainingLosses {
    /// [B] total loss per example.
    pub loss: Tensor,
    pub mse: Option<Tensor>,
    pub vb: Option<Tensor>,
    /// Predicted clean texture, detached from the graph.
    pub pred_xstart: Tensor,
    /// Noised input the network saw.
    pub x_t: Tensor,
}

pub struct MeanVariance {
    pub mean: Tensor,
    pub variance: Tensor,
    pub log_variance: Tensor,
    pub pred_xstart: Tensor,
}

#[derive(Debug)]
pub struct GaussianDiffusion {
    mean_type: ModelMeanType,
    var_type: ModelVarType,
    loss_type: LossType,
    rescale_timesteps: bool,
    original_num_steps: usize,
    timestep_map: Vec<usize>,

    betas: Vec<f64>,
    log_betas: Vec<f64>,
    alphas_cumprod: Vec<f64>,
    sqrt_alphas_cumprod: Vec<f64>,
    sqrt_one_minus_alphas_cumprod: Vec<f64>,
    sqrt_recip_alphas_cumprod: Vec<f64>,
    sqrt_recipm1_alphas_cumprod: Vec<f64>,
    posterior_variance: Vec<f64>,
    posterior_log_variance_clipped: Vec<f64>,
    posterior_mean_coef1: Vec<f64>,
    posterior_mean_coef2: Vec<f64>,
    fixed_large_variance: Vec<f64>,
    fixed_large_log_variance: Vec<f64>,
}

impl GaussianDiffusion {
    pub fn new(
        betas: Vec<f64>,
        timestep_map: Vec<usize>,
        original_num_steps: usize,
        mean_type: ModelMeanType,
        var_type: ModelVarType,
        loss_type: LossType,
        rescale_timesteps: bool,
    ) -> Result<Self> {
        anyhow::ensure!(!betas.is_empty(), "diffusion needs at least one timestep");
        anyhow::ensure!(
            betas.iter().all(|&b| b > 0.0 && b < 1.0),
            "betas must lie in (0, 1)"
        );
        anyhow::ensure!(
            betas.len() == timestep_map.len(),
            "timestep map has {} entries for {} betas",
            timestep_map.len(),
            betas.len()
        );

        let num_timesteps = betas.len();
        let mut alphas_cumprod = Vec::with_capacity(num_timesteps);
        let mut cumprod = 1.0;
        for beta in &betas {
            cumprod *= 1.0 - beta;
            alphas_cumprod.push(cumprod);
        }
        let alphas_cumprod_prev: Vec<f64> = std::iter::once(1.0)
            .chain(alphas_cumprod[..num_timesteps - 1].iter().copied())
            .collect();

        let sqrt_alphas_cumprod = alphas_cumprod.iter().map(|a| a.sqrt()).collect();
        let sqrt_one_minus_alphas_cumprod = alphas_cumprod.iter().map(|a| (1.0 - a).sqrt()).collect();
        let sqrt_recip_alphas_cumprod = alphas_cumprod.iter().map(|a| (1.0 / a).sqrt()).collect();
        let sqrt_recipm1_alphas_cumprod = alphas_cumprod.iter().map(|a| (1.0 / a - 1.0).sqrt()).collect();

        let posterior_variance: Vec<f64> = (0..num_timesteps)
            .map(|i| betas[i] * (1.0 - alphas_cumprod_prev[i]) / (1.0 - alphas_cumprod[i]))
            .collect();
        // posterior_variance[0] is 0, so the log is clipped with the next entry
        let first_nonzero = posterior_variance.get(1).copied().unwrap_or(betas[0]).max(1e-20);
        let posterior_log_variance_clipped = std::iter::once(first_nonzero.ln())
            .chain(posterior_variance[1..].iter().map(|v| v.max(1e-20).ln()))
            .collect();

        let posterior_mean_coef1 = (0..num_timesteps)
            .map(|i| betas[i] * alphas_cumprod_prev[i].sqrt() / (1.0 - alphas_cumprod[i]))
            .collect();
        let posterior_mean_coef2 = (0..num_timesteps)
            .map(|i| (1.0 - alphas_cumprod_prev[i]) * (1.0 - betas[i]).sqrt() / (1.0 - alphas_cumprod[i]))
            .collect();

        let fixed_large_variance: Vec<f64> = std::iter::once(first_nonzero)
            .chain(betas[1..].iter().copied())
            .collect();
        let fixed_large_log_variance = fixed_large_variance.iter().map(|v| v.ln()).collect();
        let log_betas = betas.iter().map(|b| b.ln()).collect();

        Ok(Self {
            mean_type,
            var_type,
            loss_type,
            rescale_timesteps,
            original_num_steps,
            timestep_map,
            betas,
            log_betas,
            alphas_cumprod,
            sqrt_alphas_cumprod,
            sqrt_one_minus_alphas_cumprod,
            sqrt_recip_alphas_cumprod,
            sqrt_recipm1_alphas_cumprod,
            posterior_variance,
            posterior_log_variance_clipped,
            posterior_mean_coef1,
            posterior_mean_coef2,
            fixed_large_variance,
            fixed_large_log_variance,
        })
    }

    pub fn num_timesteps(&self) -> usize {
        self.betas.len()
    }

    pub fn timestep_map(&self) -> &[usize] {
        &self.timestep_map
    }

    pub fn alphas_cumprod(&self) -> &[f64] {
        &self.alphas_cumprod
    }

    pub fn mean_type(&self) -> ModelMeanType {
        self.mean_type
    }

    pub fn var_type(&self) -> ModelVarType {
        self.var_type
    }

    pub fn loss_type(&self) -> LossType {
        self.loss_type
    }

    /// Gather `arr[t]` for each example as a [B, 1, 1, 1] tensor.
    fn extract(&self, arr: &[f64], t: &[usize], device: &Device) -> Result<Tensor> {
        let values = t
            .iter()
            .map(|&i| {
                arr.get(i)
                    .map(|&v| v as f32)
                    .with_context(|| format!("timestep {i} out of range 0..{}", arr.len()))
            })
            .collect::<Result<Vec<f32>>>()?;
        Ok(Tensor::from_vec(values, (t.len(), 1, 1, 1), device)?)
    }

    /// Timesteps as the network sees them: original (unrespaced) indices,
    /// optionally rescaled to the 0..1000 range.
    pub fn model_timesteps(&self, t: &[usize], device: &Device) -> Result<Tensor> {
        let scale = if self.rescale_timesteps {
            1000.0 / self.original_num_steps as f32
        } else {
            1.0
        };
        let values = t
            .iter()
            .map(|&i| {
                self.timestep_map
                    .get(i)
                    .map(|&orig| orig as f32 * scale)
                    .with_context(|| format!("timestep {i} out of range 0..{}", self.timestep_map.len()))
            })
            .collect::<Result<Vec<f32>>>()?;
        Ok(Tensor::from_vec(values, t.len(), device)?)
    }

    /// Diffuse `x_start` to step `t`: sqrt(ab) * x0 + sqrt(1 - ab) * noise.
    pub fn q_sample(&self, x_start: &Tensor, t: &[usize], noise: &Tensor) -> Result<Tensor> {
        let device = x_start.device();
        let a = self.extract(&self.sqrt_alphas_cumprod, t, device)?;
        let b = self.extract(&self.sqrt_one_minus_alphas_cumprod, t, device)?;
        Ok((a.broadcast_mul(x_start)? + b.broadcast_mul(noise)?)?)
    }

    /// Mean, variance and clipped log-variance of q(x_{t-1} | x_t, x_0).
    pub fn q_posterior_mean_variance(
        &self,
        x_start: &Tensor,
        x_t: &Tensor,
        t: &[usize],
    ) -> Result<(Tensor, Tensor, Tensor)> {
        let device = x_t.device();
        let mean = (self.extract(&self.posterior_mean_coef1, t, device)?.broadcast_mul(x_start)?
            + self.extract(&self.posterior_mean_coef2, t, device)?.broadcast_mul(x_t)?)?;
        let variance = self.extract(&self.posterior_variance, t, device)?;
        let log_variance = self.extract(&self.posterior_log_variance_clipped, t, device)?;
        Ok((mean, variance, log_variance))
    }

    fn predict_xstart_from_eps(&self, x_t: &Tensor, t: &[usize], eps: &Tensor) -> Result<Tensor> {
        let device = x_t.device();
        let a = self.extract(&self.sqrt_recip_alphas_cumprod, t, device)?;
        let b = self.extract(&self.sqrt_recipm1_alphas_cumprod, t, device)?;
        Ok((a.broadcast_mul(x_t)? - b.broadcast_mul(eps)?)?)
    }

    /// Turn a raw network output into the reverse-process distribution.
    pub fn p_mean_variance_from_output(
        &self,
        model_output: &Tensor,
        x: &Tensor,
        t: &[usize],
        clip_denoised: bool,
    ) -> Result<MeanVariance> {
        let channels = x.dim(1)?;
        let device = x.device();
        let expected = if self.var_type.is_learned() { channels * 2 } else { channels };
        let actual = model_output.dim(1)?;
        if actual != expected {
            return Err(TexDiffError::ModelChannels { expected, actual }.into());
        }

        let (output, variance, log_variance) = match self.var_type {
            ModelVarType::LearnedRange => {
                let output = model_output.narrow(1, 0, channels)?;
                let var_values = model_output.narrow(1, channels, channels)?;
                let min_log = self.extract(&self.posterior_log_variance_clipped, t, device)?;
                let max_log = self.extract(&self.log_betas, t, device)?;
                // var_values lie in [-1, 1]
                let frac = var_values.affine(0.5, 0.5)?;
                let one_minus_frac = frac.affine(-1.0, 1.0)?;
                let log_variance =
                    (frac.broadcast_mul(&max_log)? + one_minus_frac.broadcast_mul(&min_log)?)?;
                (output, log_variance.exp()?, log_variance)
            }
            ModelVarType::FixedLarge => (
                model_output.clone(),
                self.extract(&self.fixed_large_variance, t, device)?,
                self.extract(&self.fixed_large_log_variance, t, device)?,
            ),
            ModelVarType::FixedSmall => (
                model_output.clone(),
                self.extract(&self.posterior_variance, t, device)?,
                self.extract(&self.posterior_log_variance_clipped, t, device)?,
            ),
        };

        let pred_xstart = match self.mean_type {
            ModelMeanType::Epsilon => self.predict_xstart_from_eps(x, t, &output)?,
            ModelMeanType::StartX => output,
        };
        let pred_xstart = if clip_denoised {
            pred_xstart.clamp(-1f32, 1f32)?
        } else {
            pred_xstart
        };
        let (mean, _, _) = self.q_posterior_mean_variance(&pred_xstart, x, t)?;

        Ok(MeanVariance {
            mean,
            variance,
            log_variance,
            pred_xstart,
        })
    }

    /// Run the network and return p(x_{t-1} | x_t).
    pub fn p_mean_variance(
        &self,
        model: &dyn DenoiseModel,
        x: &Tensor,
        t: &[usize],
        cond: &Tensor,
        clip_denoised: bool,
    ) -> Result<MeanVariance> {
        let model_t = self.model_timesteps(t, x.device())?;
        let model_output = model.forward(x, &model_t, cond)?;
        self.p_mean_variance_from_output(&model_output, x, t, clip_denoised)
    }

    /// Variational bound term in bits per dimension, [B].
    ///
    /// At t = 0 this is the discretized decoder NLL, elsewhere the KL
    /// between the true and the predicted posterior.
    fn vb_terms_bpd(
        &self,
        model_output: &Tensor,
        x_start: &Tensor,
        x_t: &Tensor,
        t: &[usize],
    ) -> Result<(Tensor, MeanVariance)> {
        let (true_mean, _, true_log_variance) = self.q_posterior_mean_variance(x_start, x_t, t)?;
        let out = self.p_mean_variance_from_output(model_output, x_t, t, false)?;

        let ln2 = std::f64::consts::LN_2;
        let kl = normal_kl(&true_mean, &true_log_variance, &out.mean, &out.log_variance)?;
        let kl = (mean_flat(&kl)? / ln2)?;

        let log_scales = (&out.log_variance * 0.5)?;
        let decoder_ll = discretized_gaussian_log_likelihood(x_start, &out.mean, &log_scales)?;
        let decoder_nll = (mean_flat(&decoder_ll)? / -ln2)?;

        let first_step: Vec<f32> = t.iter().map(|&i| if i == 0 { 1.0 } else { 0.0 }).collect();
        let first_step = Tensor::from_vec(first_step, t.len(), x_t.device())?;
        let output = ((decoder_nll * &first_step)? + (kl * first_step.affine(-1.0, 1.0)?)?)?;
        Ok((output, out))
    }

    /// Per-example losses for one training step at timesteps `t`.
    pub fn training_losses<R: Rng + ?Sized>(
        &self,
        model: &dyn DenoiseModel,
        x_start: &Tensor,
        t: &[usize],
        cond: &Tensor,
        rng: &mut R,
    ) -> Result<TrainingLosses> {
        let device = x_start.device();
        let noise = seeded_randn(x_start.shape(), device, rng)?;
        let x_t = self.q_sample(x_start, t, &noise)?;
        let model_t = self.model_timesteps(t, device)?;
        let model_output = model.forward(&x_t, &model_t, cond)?;

        if self.loss_type == LossType::RescaledKl {
            let (vb, out) = self.vb_terms_bpd(&model_output, x_start, &x_t, t)?;
            let loss = (vb * self.num_timesteps() as f64)?;
            return Ok(TrainingLosses {
                loss,
                mse: None,
                vb: None,
                pred_xstart: out.pred_xstart.detach(),
                x_t,
            });
        }

        let channels = x_start.dim(1)?;
        let (output, vb) = if self.var_type.is_learned() {
            let actual = model_output.dim(1)?;
            if actual != channels * 2 {
                return Err(TexDiffError::ModelChannels {
                    expected: channels * 2,
                    actual,
                }
                .into());
            }
            let output = model_output.narrow(1, 0, channels)?;
            let var_values = model_output.narrow(1, channels, channels)?;
            // The bound only trains the variance; the mean is learned by the MSE term
            let frozen = Tensor::cat(&[&output.detach(), &var_values], 1)?;
            let (vb, _) = self.vb_terms_bpd(&frozen, x_start, &x_t, t)?;
            let vb = if self.loss_type == LossType::RescaledMse {
                (vb * (self.num_timesteps() as f64 / 1000.0))?
            } else {
                vb
            };
            (output, Some(vb))
        } else {
            (model_output, None)
        };

        let target = match self.mean_type {
            ModelMeanType::Epsilon => &noise,
            ModelMeanType::StartX => x_start,
        };
        let mse = mean_flat(&(target - &output)?.sqr()?)?;
        let loss = match &vb {
            Some(vb) => (&mse + vb)?,
            None => mse.clone(),
        };

        let pred_xstart = match self.mean_type {
            ModelMeanType::Epsilon => self.predict_xstart_from_eps(&x_t, t, &output.detach())?,
            ModelMeanType::StartX => output.detach(),
        };

        Ok(TrainingLosses {
            loss,
            mse: Some(mse),
            vb,
            pred_xstart,
            x_t,
        })
    }

    /// One ancestral sampling step from `x` at timestep `t` (same for the
    /// whole batch). No noise is added at t = 0.
    pub fn p_sample<R: Rng + ?Sized>(
        &self,
        model: &dyn DenoiseModel,
        x: &Tensor,
        t: usize,
        cond: &Tensor,
        clip_denoised: bool,
        rng: &mut R,
    ) -> Result<(Tensor, Tensor)> {
        let ts = vec![t; x.dim(0)?];
        let out = self.p_mean_variance(model, x, &ts, cond, clip_denoised)?;
        if t == 0 {
            return Ok((out.mean, out.pred_xstart));
        }
        let noise = seeded_randn(x.shape(), x.device(), rng)?;
        let std = (&out.log_variance * 0.5)?.exp()?;
        let sample = (out.mean + std.broadcast_mul(&noise)?)?;
        Ok((sample, out.pred_xstart))
    }

    /// Generate samples of `shape` by running the full reverse process.
    pub fn p_sample_loop<R: Rng + ?Sized>(
        &self,
        model: &dyn DenoiseModel,
        shape: (usize, usize, usize, usize),
        cond: &Tensor,
        clip_denoised: bool,
        rng: &mut R,
    ) -> Result<Tensor> {
        let device = cond.device();
        let mut img = seeded_randn(shape, device, rng)?;

        #[cfg(feature = "progress-bar")]
        let progress = {
            let pb = indicatif::ProgressBar::new(self.num_timesteps() as u64);
            if let Ok(style) =
                indicatif::ProgressStyle::with_template("sampling [{bar:40}] {pos}/{len} {elapsed_precise}")
            {
                pb.set_style(style);
            }
            pb
        };

        for t in (0..self.num_timesteps()).rev() {
            let (sample, _) = self.p_sample(model, &img, t, cond, clip_denoised, rng)?;
            // Keep the graph from growing across steps
            img = sample.detach();
            #[cfg(feature = "progress-bar")]
            progress.inc(1);
        }

        #[cfg(feature = "progress-bar")]
        progress.finish_and_clear();
        debug!("Sampled batch of shape {:?}", img.dims());

        Ok(img.to_dtype(DType::F32)?)
    }
}
