//! Optimizer selection over candle-nn's optimizers

use anyhow::Result;
use candle_core::{Tensor, Var};
use candle_nn::{AdamW, Optimizer, ParamsAdamW, SGD};
use serde::{Deserialize, Serialize};

use crate::error::TexDiffError;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizerConfig {
    /// adamw or sgd
    pub kind: String,
    pub lr: f64,
    pub beta1: f64,
    pub beta2: f64,
    pub eps: f64,
    pub weight_decay: f64,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            kind: "adamw".to_string(),
            lr: 1e-4,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
            weight_decay: 0.0,
        }
    }
}

pub enum TrainOptimizer {
    AdamW(AdamW),
    Sgd(SGD),
}

impl TrainOptimizer {
    pub fn new(vars: Vec<Var>, config: &OptimizerConfig) -> Result<Self> {
        match config.kind.as_str() {
            "adamw" | "adam" => Ok(Self::AdamW(AdamW::new(
                vars,
                ParamsAdamW {
                    lr: config.lr,
                    beta1: config.beta1,
                    beta2: config.beta2,
                    eps: config.eps,
                    weight_decay: config.weight_decay,
                },
            )?)),
            "sgd" => Ok(Self::Sgd(SGD::new(vars, config.lr)?)),
            other => Err(TexDiffError::UnknownOptimizer(other.to_string()).into()),
        }
    }

    pub fn backward_step(&mut self, loss: &Tensor) -> Result<()> {
        match self {
            Self::AdamW(opt) => opt.backward_step(loss)?,
            Self::Sgd(opt) => opt.backward_step(loss)?,
        }
        Ok(())
    }

    pub fn learning_rate(&self) -> f64 {
        match self {
            Self::AdamW(opt) => opt.learning_rate(),
            Self::Sgd(opt) => opt.learning_rate(),
        }
    }

    pub fn set_learning_rate(&mut self, lr: f64) {
        match self {
            Self::AdamW(opt) => opt.set_learning_rate(lr),
            Self::Sgd(opt) => opt.set_learning_rate(lr),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    #[test]
    fn test_sgd_step_moves_params() -> Result<()> {
        let device = Device::Cpu;
        let var = Var::ones(3, DType::F32, &device)?;
        let config = OptimizerConfig {
            kind: "sgd".to_string(),
            lr: 0.5,
            ..Default::default()
        };
        let mut opt = TrainOptimizer::new(vec![var.clone()], &config)?;
        // d/dx sum(x^2) = 2x = 2
        let loss = var.as_tensor().sqr()?.sum_all()?;
        opt.backward_step(&loss)?;
        assert_eq!(var.as_tensor().to_vec1::<f32>()?, vec![0.0; 3]);
        Ok(())
    }

    #[test]
    fn test_learning_rate_updates() -> Result<()> {
        let device = Device::Cpu;
        let var = Var::zeros(2, DType::F32, &device)?;
        let mut opt = TrainOptimizer::new(vec![var], &OptimizerConfig::default())?;
        assert_eq!(opt.learning_rate(), 1e-4);
        opt.set_learning_rate(3e-4);
        assert_eq!(opt.learning_rate(), 3e-4);
        Ok(())
    }

    #[test]
    fn test_unknown_optimizer() {
        let config = OptimizerConfig {
            kind: "lion".to_string(),
            ..Default::default()
        };
        assert!(TrainOptimizer::new(vec![], &config).is_err());
    }
}
