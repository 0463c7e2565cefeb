//! YAML run configuration

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use candle_core::Device;
use serde::{Deserialize, Serialize};

use crate::diffusion::DiffusionConfig;
use crate::error::TexDiffError;
use crate::models::TextureDenoiserConfig;
use crate::trainers::{LrSchedulerConfig, ModuleComponents, OptimizerConfig};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub diffusion: DiffusionConfig,
    pub network: TextureDenoiserConfig,
    pub train: TrainConfig,
    pub data: DataConfig,
    pub output: OutputConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainConfig {
    /// cpu, cuda or cuda:N
    pub device: String,
    pub seed: u64,
    pub schedule_sampler: String,
    pub ema_decay: Option<f64>,
    pub batch_size: usize,
    pub steps: usize,
    pub log_every: usize,
    pub save_every: Option<usize>,
    pub optimizer: OptimizerConfig,
    pub lr_scheduler: LrSchedulerConfig,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            device: "cpu".to_string(),
            seed: 42,
            schedule_sampler: "uniform".to_string(),
            ema_decay: Some(0.999),
            batch_size: 4,
            steps: 1000,
            log_every: 10,
            save_every: None,
            optimizer: OptimizerConfig::default(),
            lr_scheduler: LrSchedulerConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DataConfig {
    pub path: PathBuf,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("data/train"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    pub dir: PathBuf,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("output"),
        }
    }
}

pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    let path = path.as_ref();
    let config_str = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let mut config: Config = serde_yaml::from_str(&config_str)
        .with_context(|| format!("Failed to parse YAML config: {}", path.display()))?;

    // The network's output width follows the diffusion variance setting
    config.network.learn_sigma = config.diffusion.learn_sigma;

    Ok(config)
}

/// Parse `cpu`, `cuda` or `cuda:N`.
pub fn parse_device(name: &str) -> Result<Device> {
    let name = name.trim().to_ascii_lowercase();
    match name.as_str() {
        "cpu" => Ok(Device::Cpu),
        "cuda" | "gpu" => Ok(Device::new_cuda(0)?),
        other => {
            let ordinal = other
                .strip_prefix("cuda:")
                .and_then(|n| n.parse::<usize>().ok())
                .ok_or_else(|| TexDiffError::InvalidDevice(other.to_string()))?;
            Ok(Device::new_cuda(ordinal)?)
        }
    }
}

impl Config {
    /// Assemble the module components this config describes.
    ///
    /// An unset `lr_scheduler.total_steps` decays over `train.steps`, read
    /// here so that step overrides applied after loading are honored.
    pub fn module_components(&self) -> Result<ModuleComponents<TextureDenoiserConfig>> {
        let mut lr_scheduler = self.train.lr_scheduler.clone();
        if lr_scheduler.total_steps <= 1 {
            lr_scheduler.total_steps = self.train.steps;
        }
        Ok(ModuleComponents {
            diffusion: self.diffusion.clone(),
            network: self.network.clone(),
            optimizer: self.train.optimizer.clone(),
            lr_scheduler,
            device: parse_device(&self.train.device)?,
            ema_decay: self.train.ema_decay,
            schedule_sampler: self.train.schedule_sampler.clone(),
            seed: self.train.seed,
        })
    }
}
