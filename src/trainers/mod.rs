pub mod conditioning;
pub mod diffusion_module;
pub mod ema;
pub mod image_utils;
pub mod lr_scheduler;
pub mod metrics;
pub mod optim;

// Re-export key types
pub use conditioning::{flip_vertical, prepare_batch, ConditioningLayout, PreparedBatch};
pub use diffusion_module::{DiffusionModule, ForwardOutput, ModuleComponents};
pub use ema::ModelEma;
pub use lr_scheduler::{create_scheduler, LRScheduler, LrSchedulerConfig};
pub use metrics::{RunningMean, StepMetrics, TestVisuals, TrainVisuals};
pub use optim::{OptimizerConfig, TrainOptimizer};
