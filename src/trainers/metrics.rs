//! Step outputs and running loss average

use candle_core::Tensor;
use serde::Serialize;

/// Scalar metrics reported by a step. `loss` is `None` for test steps.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StepMetrics {
    pub loss: Option<f32>,
    pub mse: Option<f32>,
    pub vb: Option<f32>,
    pub train_loss_mean: Option<f64>,
    pub lr: Option<f64>,
}

/// Visualization returned by a training step.
#[derive(Debug, Clone)]
pub struct TrainVisuals {
    /// [B, C, H, 4W] of prediction, target, noised input and coarse map,
    /// mapped to [0, 1].
    pub image: Tensor,
}

/// Sample and metadata returned by a test step.
#[derive(Debug, Clone)]
pub struct TestVisuals {
    /// [B, C, H, 3W] of sample, coarse map and position.
    pub image: Tensor,
    /// Masked sample in [0, 1], [B, C, H, W].
    pub texture_map: Tensor,
    pub obj_c: Vec<String>,
    pub obj_name: Vec<String>,
    /// [B, 1, H, W]
    pub mask: Tensor,
}

/// Mean of every value fed to it since the last reset.
#[derive(Debug, Clone, Default)]
pub struct RunningMean {
    sum: f64,
    count: usize,
}

impl RunningMean {
    pub fn update(&mut self, value: f64) {
        if value.is_finite() {
            self.sum += value;
            self.count += 1;
        }
    }

    pub fn compute(&self) -> Option<f64> {
        (self.count > 0).then(|| self.sum / self.count as f64)
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_running_mean() {
        let mut mean = RunningMean::default();
        assert_eq!(mean.compute(), None);
        mean.update(1.0);
        mean.update(3.0);
        mean.update(f64::NAN);
        assert_eq!(mean.compute(), Some(2.0));
        mean.reset();
        assert_eq!(mean.compute(), None);
    }

    #[test]
    fn test_metrics_serialize() {
        let metrics = StepMetrics {
            loss: Some(0.5),
            ..Default::default()
        };
        let json = serde_json::to_string(&metrics).unwrap();
        assert!(json.contains("\"loss\":0.5"));
        assert!(json.contains("\"lr\":null"));
    }
}
