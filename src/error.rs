//! Error types shared across the crate

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TexDiffError {
    #[error("batch field `{field}` has shape {actual:?}, expected {expected}")]
    BatchShape {
        field: &'static str,
        actual: Vec<usize>,
        expected: String,
    },

    #[error("unknown schedule sampler: {0}")]
    UnknownSampler(String),

    #[error("unknown beta schedule: {0}")]
    UnknownBetaSchedule(String),

    #[error("unknown optimizer: {0}")]
    UnknownOptimizer(String),

    #[error("`{schedule}` beta schedule with {steps} steps reaches beta >= 1")]
    DegenerateBetaSchedule { schedule: String, steps: usize },

    #[error("invalid timestep respacing `{respacing}`: {reason}")]
    InvalidRespacing { respacing: String, reason: String },

    #[error("model produced {actual} channels, expected {expected}")]
    ModelChannels { expected: usize, actual: usize },

    #[error("sample `{path}` is missing tensor `{name}`")]
    MissingTensor { path: String, name: String },

    #[error("invalid device `{0}`")]
    InvalidDevice(String),
}
