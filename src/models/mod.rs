//! Denoising networks
//!
//! The diffusion process only talks to networks through [`DenoiseModel`];
//! [`DenoiserBuilder`] lets the training module build the network twice,
//! once over the trainable parameters and once over the EMA shadow.

pub mod texture_denoiser;

use candle_core::{Result, Tensor};
use candle_nn::VarBuilder;

pub use texture_denoiser::{TextureDenoiser, TextureDenoiserConfig};

/// A network predicting the denoising target for a noised texture.
pub trait DenoiseModel {
    /// `x` is [B, C, H, W], `timesteps` is a float [B] tensor and `cond` is
    /// the [B, Cc, H, W] conditioning tensor.
    fn forward(&self, x: &Tensor, timesteps: &Tensor, cond: &Tensor) -> Result<Tensor>;
}

/// Builds a [`DenoiseModel`] whose weights come from a `VarBuilder`.
pub trait DenoiserBuilder {
    fn build(&self, vb: VarBuilder) -> Result<Box<dyn DenoiseModel>>;
}
