//! Training and sampling orchestration for the texture diffusion model
//!
//! `DiffusionModule` owns the network, its optimizer, the optional EMA
//! shadow and the schedule sampler. One call to [`DiffusionModule::training_step`]
//! performs a full optimizer update; [`DiffusionModule::test_step`] runs the
//! reverse process to produce textures for a batch of objects.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use candle_core::{DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};
use log::{debug, info};
use rand::rngs::StdRng;
use rand::SeedableRng;

use super::conditioning::prepare_batch;
use super::ema::ModelEma;
use super::lr_scheduler::{create_scheduler, LRScheduler, LrSchedulerConfig};
use super::metrics::{RunningMean, StepMetrics, TestVisuals, TrainVisuals};
use super::optim::{OptimizerConfig, TrainOptimizer};
use crate::data::Batch;
use crate::diffusion::{
    create_named_schedule_sampler, diffusion_from_config, DiffusionConfig, GaussianDiffusion,
    ScheduleSampler, TrainingLosses,
};
use crate::models::{DenoiseModel, DenoiserBuilder};

pub const NETWORK_WEIGHTS: &str = "network.safetensors";
pub const EMA_WEIGHTS: &str = "ema.safetensors";

/// Everything needed to construct a [`DiffusionModule`].
pub struct ModuleComponents<B: DenoiserBuilder> {
    pub diffusion: DiffusionConfig,
    pub network: B,
    pub optimizer: OptimizerConfig,
    pub lr_scheduler: LrSchedulerConfig,
    pub device: Device,
    /// `None` or `Some(0.0)` disables the EMA network.
    pub ema_decay: Option<f64>,
    pub schedule_sampler: String,
    pub seed: u64,
}

/// Result of [`DiffusionModule::forward`].
pub struct ForwardOutput {
    /// Importance-weighted scalar loss.
    pub loss: Tensor,
    pub losses: TrainingLosses,
    pub timesteps: Vec<usize>,
}

struct EmaNetwork {
    ema: ModelEma,
    net: Box<dyn DenoiseModel>,
}

pub struct DiffusionModule {
    device: Device,
    diffusion: Arc<GaussianDiffusion>,
    schedule_sampler: ScheduleSampler,
    net_vars: VarMap,
    net: Box<dyn DenoiseModel>,
    net_ema: Option<EmaNetwork>,
    optimizer: TrainOptimizer,
    lr_scheduler: Box<dyn LRScheduler>,
    global_step: usize,
    train_loss: RunningMean,
    rng: StdRng,
}

impl DiffusionModule {
    pub fn new<B: DenoiserBuilder>(components: ModuleComponents<B>) -> Result<Self> {
        let ModuleComponents {
            diffusion,
            network,
            optimizer,
            lr_scheduler,
            device,
            ema_decay,
            schedule_sampler,
            seed,
        } = components;

        let diffusion = Arc::new(diffusion_from_config(&diffusion)?);
        let schedule_sampler = create_named_schedule_sampler(&schedule_sampler, diffusion.num_timesteps())?;
        info!(
            "Schedule sampler: {} (loss-aware: {})",
            sampler_name(&schedule_sampler),
            schedule_sampler.is_loss_aware()
        );

        let net_vars = VarMap::new();
        let vb = VarBuilder::from_varmap(&net_vars, DType::F32, &device);
        let net = network.build(vb).context("Failed to build denoising network")?;
        let num_params: usize = net_vars.all_vars().iter().map(|v| v.elem_count()).sum();
        info!("Network built with {} parameters", num_params);

        let net_ema = match ema_decay {
            Some(decay) if decay > 0.0 => {
                info!("Using EMA with decay = {:.8}", decay);
                let ema = ModelEma::new(&net_vars, decay)?;
                // Building over the shadow reuses its vars instead of creating new ones
                let vb = VarBuilder::from_varmap(ema.shadow(), DType::F32, &device);
                let net = network.build(vb).context("Failed to build EMA network")?;
                Some(EmaNetwork { ema, net })
            }
            _ => None,
        };

        let optimizer = TrainOptimizer::new(net_vars.all_vars(), &optimizer)?;
        let lr_scheduler = create_scheduler(&lr_scheduler, optimizer.learning_rate());

        Ok(Self {
            device,
            diffusion,
            schedule_sampler,
            net_vars,
            net,
            net_ema,
            optimizer,
            lr_scheduler,
            global_step: 0,
            train_loss: RunningMean::default(),
            rng: StdRng::seed_from_u64(seed),
        })
    }

    /// Reseed the RNG behind timestep draws and diffusion noise.
    pub fn set_seed(&mut self, seed: u64) {
        self.rng = StdRng::seed_from_u64(seed);
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn diffusion(&self) -> &Arc<GaussianDiffusion> {
        &self.diffusion
    }

    pub fn schedule_sampler(&self) -> &ScheduleSampler {
        &self.schedule_sampler
    }

    pub fn network_vars(&self) -> &VarMap {
        &self.net_vars
    }

    pub fn ema(&self) -> Option<&ModelEma> {
        self.net_ema.as_ref().map(|e| &e.ema)
    }

    pub fn global_step(&self) -> usize {
        self.global_step
    }

    pub fn mean_train_loss(&self) -> Option<f64> {
        self.train_loss.compute()
    }

    pub fn reset_train_loss(&mut self) {
        self.train_loss.reset();
    }

    /// Draw timesteps, compute the diffusion losses and weight them.
    pub fn forward(&mut self, x: &Tensor, cond: &Tensor) -> Result<ForwardOutput> {
        let draw = self.schedule_sampler.sample(x.dim(0)?, &self.device, &mut self.rng)?;
        let losses = self
            .diffusion
            .training_losses(self.net.as_ref(), x, &draw.timesteps, cond, &mut self.rng)?;

        if self.schedule_sampler.is_loss_aware() {
            let values: Vec<f64> = losses.loss.detach().to_dtype(DType::F64)?.to_vec1()?;
            self.schedule_sampler
                .update_with_local_losses(&draw.timesteps, &values);
        }

        let loss = losses.loss.broadcast_mul(&draw.weights)?.mean_all()?;
        Ok(ForwardOutput {
            loss,
            losses,
            timesteps: draw.timesteps,
        })
    }

    /// One optimizer update on `batch`.
    pub fn training_step(&mut self, batch: &Batch, batch_idx: usize) -> Result<(StepMetrics, TrainVisuals)> {
        let batch = batch.to_device(&self.device)?;
        let prepared = prepare_batch(&batch)?;

        let lr = self.lr_scheduler.get_lr(self.global_step);
        self.optimizer.set_learning_rate(lr);

        let out = self.forward(&prepared.x, &prepared.cond)?;
        self.optimizer.backward_step(&out.loss)?;
        if let Some(ema) = self.net_ema.as_mut() {
            ema.ema.update(&self.net_vars)?;
        }

        let loss = out.loss.to_dtype(DType::F32)?.to_scalar::<f32>()?;
        self.train_loss.update(loss as f64);
        self.global_step += 1;

        let mse = scalar_mean(out.losses.mse.as_ref())?;
        let vb = scalar_mean(out.losses.vb.as_ref())?;
        debug!(
            "step {} batch {}: loss {:.6} mse {:?} vb {:?} lr {:.3e}",
            self.global_step, batch_idx, loss, mse, vb, lr
        );

        let image = Tensor::cat(
            &[
                &out.losses.pred_xstart,
                &prepared.x,
                &out.losses.x_t,
                &prepared.coarse_map,
            ],
            3,
        )?;
        let image = ((image + 1.0)? / 2.0)?;

        let metrics = StepMetrics {
            loss: Some(loss),
            mse,
            vb,
            train_loss_mean: self.train_loss.compute(),
            lr: Some(lr),
        };
        Ok((metrics, TrainVisuals { image }))
    }

    /// Sample textures for `batch` with the EMA network when there is one.
    pub fn test_step(&mut self, batch: &Batch, batch_idx: usize) -> Result<(StepMetrics, TestVisuals)> {
        let batch = batch.to_device(&self.device)?;
        let prepared = prepare_batch(&batch)?;
        let shape = prepared.x.dims4()?;

        let model: &dyn DenoiseModel = match &self.net_ema {
            Some(ema) => ema.net.as_ref(),
            None => self.net.as_ref(),
        };
        let sample = self
            .diffusion
            .p_sample_loop(model, shape, &prepared.cond, false, &mut self.rng)?;

        let mask = prepared.mask()?;
        let texture_map = ((sample + 1.0)? / 2.0)?
            .clamp(0f32, 1f32)?
            .broadcast_mul(&mask)?;

        let coarse_map = ((&prepared.coarse_map + 1.0)? / 2.0)?;
        let position = (prepared.position()? + 0.5)?;
        let image = Tensor::cat(&[&texture_map, &coarse_map, &position], 3)?;
        debug!("test batch {}: sampled {} textures", batch_idx, batch.len());

        let visuals = TestVisuals {
            image,
            texture_map,
            obj_c: batch.category.clone(),
            obj_name: batch.name.clone(),
            mask,
        };
        Ok((StepMetrics::default(), visuals))
    }

    /// Write the network (and EMA shadow) weights into `dir`.
    pub fn save_weights<P: AsRef<Path>>(&self, dir: P) -> Result<()> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create directory: {}", dir.display()))?;
        self.net_vars.save(dir.join(NETWORK_WEIGHTS))?;
        if let Some(ema) = &self.net_ema {
            ema.ema.shadow().save(dir.join(EMA_WEIGHTS))?;
        }
        info!("Saved weights to {}", dir.display());
        Ok(())
    }

    /// Load weights written by [`DiffusionModule::save_weights`]. Without an
    /// EMA file the shadow restarts from the loaded network weights.
    pub fn load_weights<P: AsRef<Path>>(&mut self, dir: P) -> Result<()> {
        let dir = dir.as_ref();
        let network = dir.join(NETWORK_WEIGHTS);
        self.net_vars
            .load(&network)
            .with_context(|| format!("Failed to load weights: {}", network.display()))?;

        if let Some(ema) = self.net_ema.as_mut() {
            let path = dir.join(EMA_WEIGHTS);
            if path.exists() {
                ema.ema.load(&path)?;
            } else {
                info!("No EMA weights in {}, starting EMA from network", dir.display());
                ema.ema.reset_to(&self.net_vars)?;
            }
        }
        info!("Loaded weights from {}", dir.display());
        Ok(())
    }
}

fn sampler_name(sampler: &ScheduleSampler) -> &'static str {
    match sampler {
        ScheduleSampler::Uniform { .. } => "uniform",
        ScheduleSampler::LossSecondMoment(_) => "loss-second-moment",
    }
}

fn scalar_mean(t: Option<&Tensor>) -> Result<Option<f32>> {
    t.map(|t| -> Result<f32> { Ok(t.mean_all()?.to_dtype(DType::F32)?.to_scalar::<f32>()?) })
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::tests::synthetic_batch;
    use crate::models::TextureDenoiserConfig;

    fn components(sampler: &str, ema_decay: Option<f64>) -> ModuleComponents<TextureDenoiserConfig> {
        ModuleComponents {
            diffusion: DiffusionConfig {
                steps: 100,
                ..Default::default()
            },
            network: TextureDenoiserConfig {
                hidden_channels: 8,
                num_blocks: 1,
                groups: 4,
                time_embed_dim: 16,
                ..Default::default()
            },
            optimizer: OptimizerConfig {
                lr: 1e-3,
                ..Default::default()
            },
            lr_scheduler: LrSchedulerConfig::default(),
            device: Device::Cpu,
            ema_decay,
            schedule_sampler: sampler.to_string(),
            seed: 0,
        }
    }

    fn var_values(varmap: &VarMap) -> Result<Vec<(String, Vec<f32>)>> {
        let data = varmap.data().lock().unwrap();
        let mut values = data
            .iter()
            .map(|(name, var)| Ok((name.clone(), var.as_tensor().flatten_all()?.to_vec1::<f32>()?)))
            .collect::<Result<Vec<_>>>()?;
        values.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(values)
    }

    #[test]
    fn test_forward_is_deterministic_after_set_seed() -> Result<()> {
        let mut module = DiffusionModule::new(components("uniform", None))?;
        let batch = synthetic_batch(2, 8, &Device::Cpu)?;
        let prepared = prepare_batch(&batch)?;

        module.set_seed(7);
        let first = module.forward(&prepared.x, &prepared.cond)?;
        module.set_seed(7);
        let second = module.forward(&prepared.x, &prepared.cond)?;

        assert_eq!(first.timesteps, second.timesteps);
        assert_eq!(
            first.loss.to_scalar::<f32>()?,
            second.loss.to_scalar::<f32>()?
        );
        Ok(())
    }

    #[test]
    fn test_training_step_outputs() -> Result<()> {
        let mut module = DiffusionModule::new(components("uniform", None))?;
        let batch = synthetic_batch(2, 8, &Device::Cpu)?;

        let (metrics, visuals) = module.training_step(&batch, 0)?;
        assert!(metrics.loss.is_some_and(f32::is_finite));
        assert!(metrics.mse.is_some());
        assert!(metrics.vb.is_none());
        assert_eq!(metrics.lr, Some(1e-3));
        assert_eq!(visuals.image.dims(), &[2, 3, 8, 32]);
        assert_eq!(module.global_step(), 1);
        assert!(module.mean_train_loss().is_some());
        Ok(())
    }

    #[test]
    fn test_training_step_updates_parameters() -> Result<()> {
        let mut module = DiffusionModule::new(components("uniform", None))?;
        let before = var_values(module.network_vars())?;
        module.training_step(&synthetic_batch(2, 8, &Device::Cpu)?, 0)?;
        assert_ne!(before, var_values(module.network_vars())?);
        Ok(())
    }

    #[test]
    fn test_ema_lags_behind_parameters() -> Result<()> {
        let mut module = DiffusionModule::new(components("uniform", Some(0.9)))?;
        assert_eq!(
            var_values(module.network_vars())?,
            var_values(module.ema().unwrap().shadow())?
        );

        module.training_step(&synthetic_batch(2, 8, &Device::Cpu)?, 0)?;
        let ema = module.ema().unwrap();
        assert_eq!(ema.num_updates(), 1);
        assert_ne!(var_values(module.network_vars())?, var_values(ema.shadow())?);
        Ok(())
    }

    #[test]
    fn test_zero_decay_disables_ema() -> Result<()> {
        let module = DiffusionModule::new(components("uniform", Some(0.0)))?;
        assert!(module.ema().is_none());
        Ok(())
    }

    #[test]
    fn test_loss_aware_sampler_is_fed() -> Result<()> {
        let mut module = DiffusionModule::new(components("loss-second-moment", None))?;
        let batch = synthetic_batch(3, 8, &Device::Cpu)?;
        module.training_step(&batch, 0)?;
        module.training_step(&batch, 1)?;

        let ScheduleSampler::LossSecondMoment(sampler) = module.schedule_sampler() else {
            panic!("expected loss-aware sampler");
        };
        assert_eq!(sampler.loss_counts().iter().sum::<usize>(), 6);
        Ok(())
    }

    #[test]
    fn test_sample_is_masked_and_in_range() -> Result<()> {
        let mut config = components("uniform", Some(0.99));
        config.diffusion.timestep_respacing = "5".to_string();
        let mut module = DiffusionModule::new(config)?;
        assert_eq!(module.diffusion().num_timesteps(), 5);

        let batch = synthetic_batch(2, 8, &Device::Cpu)?;
        let (metrics, visuals) = module.test_step(&batch, 0)?;
        assert!(metrics.loss.is_none());
        assert_eq!(visuals.texture_map.dims(), &[2, 3, 8, 8]);
        assert_eq!(visuals.image.dims(), &[2, 3, 8, 24]);
        assert_eq!(visuals.mask.dims(), &[2, 1, 8, 8]);
        assert_eq!(visuals.obj_name, batch.name);
        assert_eq!(visuals.obj_c, batch.category);

        let sample = visuals.texture_map.flatten_all()?.to_vec1::<f32>()?;
        assert!(sample.iter().all(|v| (0.0..=1.0).contains(v)));

        let outside = visuals
            .mask
            .affine(-1.0, 1.0)?
            .broadcast_mul(&visuals.texture_map)?
            .abs()?
            .sum_all()?
            .to_scalar::<f32>()?;
        assert_eq!(outside, 0.0);
        Ok(())
    }

    #[test]
    fn test_save_and_load_weights() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut module = DiffusionModule::new(components("uniform", Some(0.9)))?;
        let batch = synthetic_batch(2, 8, &Device::Cpu)?;
        module.training_step(&batch, 0)?;
        module.save_weights(dir.path())?;
        assert!(dir.path().join(NETWORK_WEIGHTS).exists());
        assert!(dir.path().join(EMA_WEIGHTS).exists());

        let saved = var_values(module.network_vars())?;
        let saved_ema = var_values(module.ema().unwrap().shadow())?;
        module.training_step(&batch, 1)?;
        assert_ne!(saved, var_values(module.network_vars())?);

        module.load_weights(dir.path())?;
        assert_eq!(saved, var_values(module.network_vars())?);
        assert_eq!(saved_ema, var_values(module.ema().unwrap().shadow())?);
        Ok(())
    }

    #[test]
    fn test_degenerate_schedule_is_rejected() {
        let mut config = components("uniform", None);
        config.diffusion.steps = 20;
        assert!(DiffusionModule::new(config).is_err());
    }

    #[test]
    fn test_malformed_batch_is_rejected() -> Result<()> {
        let mut module = DiffusionModule::new(components("uniform", None))?;
        let mut batch = synthetic_batch(2, 8, &Device::Cpu)?;
        batch.input.mask = batch.input.mask.unsqueeze(3)?;
        assert!(module.training_step(&batch, 0).is_err());
        Ok(())
    }
}
