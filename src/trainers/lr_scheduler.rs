//! Learning rate schedules with linear warmup

use serde::{Deserialize, Serialize};

/// Learning rate scheduler trait
pub trait LRScheduler {
    fn get_lr(&self, step: usize) -> f64;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LrSchedulerConfig {
    /// constant, linear, cosine or polynomial
    pub kind: String,
    pub warmup_steps: usize,
    pub total_steps: usize,
    pub num_cycles: Option<usize>,
    pub power: Option<f64>,
}

impl Default for LrSchedulerConfig {
    fn default() -> Self {
        Self {
            kind: "constant".to_string(),
            warmup_steps: 0,
            total_steps: 1,
            num_cycles: None,
            power: None,
        }
    }
}

/// Create a learning rate scheduler. Unknown kinds fall back to constant.
pub fn create_scheduler(config: &LrSchedulerConfig, base_lr: f64) -> Box<dyn LRScheduler> {
    let warmup = Warmup {
        base_lr,
        warmup_steps: config.warmup_steps,
        total_steps: config.total_steps,
    };
    match config.kind.as_str() {
        "linear" => Box::new(LinearScheduler { warmup }),
        "cosine" => Box::new(CosineScheduler {
            warmup,
            num_cycles: config.num_cycles.unwrap_or(1),
        }),
        "polynomial" => Box::new(PolynomialScheduler {
            warmup,
            power: config.power.unwrap_or(1.0),
        }),
        other => {
            if other != "constant" {
                log::warn!("Unknown lr scheduler `{}`, using constant", other);
            }
            Box::new(ConstantScheduler { warmup })
        }
    }
}

/// Shared warmup ramp and decay progress.
struct Warmup {
    base_lr: f64,
    warmup_steps: usize,
    total_steps: usize,
}

impl Warmup {
    /// Some(lr) while warming up.
    fn warmup_lr(&self, step: usize) -> Option<f64> {
        (step < self.warmup_steps).then(|| self.base_lr * step as f64 / self.warmup_steps as f64)
    }

    /// Fraction of the decay phase completed, in [0, 1].
    fn progress(&self, step: usize) -> f64 {
        let decay_steps = self.total_steps.saturating_sub(self.warmup_steps);
        if decay_steps == 0 {
            return 1.0;
        }
        ((step - self.warmup_steps) as f64 / decay_steps as f64).min(1.0)
    }
}

struct ConstantScheduler {
    warmup: Warmup,
}

impl LRScheduler for ConstantScheduler {
    fn get_lr(&self, step: usize) -> f64 {
        self.warmup.warmup_lr(step).unwrap_or(self.warmup.base_lr)
    }
}

struct LinearScheduler {
    warmup: Warmup,
}

impl LRScheduler for LinearScheduler {
    fn get_lr(&self, step: usize) -> f64 {
        if let Some(lr) = self.warmup.warmup_lr(step) {
            return lr;
        }
        self.warmup.base_lr * (1.0 - self.warmup.progress(step))
    }
}

struct CosineScheduler {
    warmup: Warmup,
    num_cycles: usize,
}

impl LRScheduler for CosineScheduler {
    fn get_lr(&self, step: usize) -> f64 {
        if let Some(lr) = self.warmup.warmup_lr(step) {
            return lr;
        }
        let progress = self.warmup.progress(step);
        let cosine = ((progress * self.num_cycles as f64 * std::f64::consts::PI).cos() + 1.0) / 2.0;
        self.warmup.base_lr * cosine
    }
}

struct PolynomialScheduler {
    warmup: Warmup,
    power: f64,
}

impl LRScheduler for PolynomialScheduler {
    fn get_lr(&self, step: usize) -> f64 {
        if let Some(lr) = self.warmup.warmup_lr(step) {
            return lr;
        }
        self.warmup.base_lr * (1.0 - self.warmup.progress(step)).powf(self.power)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(kind: &str, warmup_steps: usize, total_steps: usize) -> LrSchedulerConfig {
        LrSchedulerConfig {
            kind: kind.to_string(),
            warmup_steps,
            total_steps,
            ..Default::default()
        }
    }

    #[test]
    fn test_warmup_ramp() {
        let sched = create_scheduler(&config("constant", 10, 100), 1.0);
        assert_eq!(sched.get_lr(0), 0.0);
        assert!((sched.get_lr(5) - 0.5).abs() < 1e-12);
        assert_eq!(sched.get_lr(10), 1.0);
        assert_eq!(sched.get_lr(1000), 1.0);
    }

    #[test]
    fn test_linear_and_cosine_decay() {
        let linear = create_scheduler(&config("linear", 0, 100), 2.0);
        assert!((linear.get_lr(50) - 1.0).abs() < 1e-12);
        assert_eq!(linear.get_lr(100), 0.0);
        assert_eq!(linear.get_lr(200), 0.0);

        let cosine = create_scheduler(&config("cosine", 0, 100), 1.0);
        assert!((cosine.get_lr(0) - 1.0).abs() < 1e-12);
        assert!((cosine.get_lr(50) - 0.5).abs() < 1e-12);
        assert!(cosine.get_lr(100).abs() < 1e-12);
    }

    #[test]
    fn test_polynomial_power() {
        let mut cfg = config("polynomial", 0, 10);
        cfg.power = Some(2.0);
        let sched = create_scheduler(&cfg, 1.0);
        assert!((sched.get_lr(5) - 0.25).abs() < 1e-12);
    }

    #[test]
    fn test_no_decay_window_does_not_divide_by_zero() {
        let sched = create_scheduler(&config("linear", 10, 10), 1.0);
        assert_eq!(sched.get_lr(10), 0.0);
        assert!(sched.get_lr(20).is_finite());
    }
}
