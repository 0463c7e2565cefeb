//! Conditional residual conv denoiser for texture maps
//! The noised texture and the conditioning channels are concatenated at the
//! input; the timestep enters every residual block through a projected
//! sinusoidal embedding.

use candle_core::{DType, Result, Tensor, D};
use candle_nn::{self as nn, Conv2d, Conv2dConfig, GroupNorm, Linear, Module, VarBuilder};
use serde::{Deserialize, Serialize};

use super::{DenoiseModel, DenoiserBuilder};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TextureDenoiserConfig {
    pub texture_channels: usize,
    pub cond_channels: usize,
    pub hidden_channels: usize,
    pub num_blocks: usize,
    pub groups: usize,
    pub time_embed_dim: usize,
    /// Doubles the output channels so the network also predicts variances.
    pub learn_sigma: bool,
}

impl Default for TextureDenoiserConfig {
    fn default() -> Self {
        Self {
            texture_channels: 3,
            // coarse map (3) + position (3) + normal (3) + mask (1)
            cond_channels: 10,
            hidden_channels: 64,
            num_blocks: 4,
            groups: 8,
            time_embed_dim: 256,
            learn_sigma: false,
        }
    }
}

impl TextureDenoiserConfig {
    pub fn out_channels(&self) -> usize {
        if self.learn_sigma {
            self.texture_channels * 2
        } else {
            self.texture_channels
        }
    }
}

impl DenoiserBuilder for TextureDenoiserConfig {
    fn build(&self, vb: VarBuilder) -> Result<Box<dyn DenoiseModel>> {
        Ok(Box::new(TextureDenoiser::new(vb, self.clone())?))
    }
}

struct ResBlock {
    norm1: GroupNorm,
    conv1: Conv2d,
    time_proj: Linear,
    norm2: GroupNorm,
    conv2: Conv2d,
}

impl ResBlock {
    fn new(vb: VarBuilder, channels: usize, groups: usize, time_embed_dim: usize) -> Result<Self> {
        let conv_cfg = Conv2dConfig {
            padding: 1,
            ..Default::default()
        };
        Ok(Self {
            norm1: nn::group_norm(groups, channels, 1e-5, vb.pp("norm1"))?,
            conv1: nn::conv2d(channels, channels, 3, conv_cfg, vb.pp("conv1"))?,
            time_proj: nn::linear(time_embed_dim, channels, vb.pp("time_proj"))?,
            norm2: nn::group_norm(groups, channels, 1e-5, vb.pp("norm2"))?,
            conv2: nn::conv2d(channels, channels, 3, conv_cfg, vb.pp("conv2"))?,
        })
    }

    fn forward(&self, xs: &Tensor, temb: &Tensor) -> Result<Tensor> {
        let h = nn::ops::silu(&self.norm1.forward(xs)?)?;
        let h = self.conv1.forward(&h)?;
        let t = self
            .time_proj
            .forward(&nn::ops::silu(temb)?)?
            .unsqueeze(D::Minus1)?
            .unsqueeze(D::Minus1)?;
        let h = h.broadcast_add(&t)?;
        let h = nn::ops::silu(&self.norm2.forward(&h)?)?;
        let h = self.conv2.forward(&h)?;
        xs + h
    }
}

pub struct TextureDenoiser {
    in_conv: Conv2d,
    time_fc1: Linear,
    time_fc2: Linear,
    blocks: Vec<ResBlock>,
    out_norm: GroupNorm,
    out_conv: Conv2d,
    config: TextureDenoiserConfig,
}

impl TextureDenoiser {
    pub fn new(vb: VarBuilder, config: TextureDenoiserConfig) -> Result<Self> {
        let conv_cfg = Conv2dConfig {
            padding: 1,
            ..Default::default()
        };
        let hidden = config.hidden_channels;
        let in_conv = nn::conv2d(
            config.texture_channels + config.cond_channels,
            hidden,
            3,
            conv_cfg,
            vb.pp("in_conv"),
        )?;
        let time_fc1 = nn::linear(hidden, config.time_embed_dim, vb.pp("time_embed.0"))?;
        let time_fc2 = nn::linear(config.time_embed_dim, config.time_embed_dim, vb.pp("time_embed.2"))?;

        let vb_blocks = vb.pp("blocks");
        let blocks = (0..config.num_blocks)
            .map(|i| ResBlock::new(vb_blocks.pp(i.to_string()), hidden, config.groups, config.time_embed_dim))
            .collect::<Result<Vec<_>>>()?;

        let out_norm = nn::group_norm(config.groups, hidden, 1e-5, vb.pp("out_norm"))?;
        let out_conv = nn::conv2d(hidden, config.out_channels(), 3, conv_cfg, vb.pp("out_conv"))?;

        Ok(Self {
            in_conv,
            time_fc1,
            time_fc2,
            blocks,
            out_norm,
            out_conv,
            config,
        })
    }

    pub fn config(&self) -> &TextureDenoiserConfig {
        &self.config
    }
}

/// Sinusoidal embedding of (possibly fractional) timesteps, [B] -> [B, dim].
pub fn timestep_embedding(timesteps: &Tensor, dim: usize) -> Result<Tensor> {
    let half = dim / 2;
    let device = timesteps.device();
    let exponent = (Tensor::arange(0u32, half as u32, device)?.to_dtype(DType::F32)?
        * (-(10000f64.ln()) / half as f64))?;
    let freqs = exponent.exp()?.unsqueeze(0)?;
    let args = timesteps
        .to_dtype(DType::F32)?
        .unsqueeze(1)?
        .broadcast_mul(&freqs)?;
    let emb = Tensor::cat(&[args.cos()?, args.sin()?], D::Minus1)?;
    if dim % 2 == 1 {
        let pad = Tensor::zeros((emb.dim(0)?, 1), DType::F32, device)?;
        Tensor::cat(&[emb, pad], D::Minus1)
    } else {
        Ok(emb)
    }
}

impl DenoiseModel for TextureDenoiser {
    fn forward(&self, x: &Tensor, timesteps: &Tensor, cond: &Tensor) -> Result<Tensor> {
        let temb = timestep_embedding(timesteps, self.config.hidden_channels)?;
        let temb = self.time_fc1.forward(&temb)?;
        let temb = self.time_fc2.forward(&nn::ops::silu(&temb)?)?;

        let xs = Tensor::cat(&[x, cond], 1)?;
        let mut h = self.in_conv.forward(&xs)?;
        for block in &self.blocks {
            h = block.forward(&h, &temb)?;
        }
        let h = nn::ops::silu(&self.out_norm.forward(&h)?)?;
        self.out_conv.forward(&h)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;
    use candle_nn::VarMap;

    #[test]
    fn test_output_shape() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let config = TextureDenoiserConfig {
            hidden_channels: 16,
            num_blocks: 2,
            groups: 4,
            time_embed_dim: 32,
            learn_sigma: true,
            ..Default::default()
        };
        let model = config.build(vb)?;

        let x = Tensor::randn(0f32, 1., (2, 3, 8, 8), &device)?;
        let cond = Tensor::randn(0f32, 1., (2, 10, 8, 8), &device)?;
        let t = Tensor::new(&[3f32, 700.], &device)?;
        let out = model.forward(&x, &t, &cond)?;
        assert_eq!(out.dims(), &[2, 6, 8, 8]);
        Ok(())
    }

    #[test]
    fn test_timestep_embedding_shape() -> Result<()> {
        let device = Device::Cpu;
        let t = Tensor::new(&[0f32, 10., 999.], &device)?;
        let emb = timestep_embedding(&t, 9)?;
        assert_eq!(emb.dims(), &[3, 9]);
        // t = 0 embeds to cos(0) = 1 / sin(0) = 0
        let row: Vec<f32> = emb.get(0)?.to_vec1()?;
        assert!(row[..4].iter().all(|&v| (v - 1.0).abs() < 1e-6));
        assert!(row[4..].iter().all(|&v| v.abs() < 1e-6));
        Ok(())
    }
}
