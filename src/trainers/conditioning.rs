//! Conditioning tensor construction shared by training and sampling
//!
//! Channel layout of the conditioning tensor is fixed: coarse map, then
//! position, then normal, then mask. The network is trained against this
//! layout, so sampling has to rebuild it identically.

use std::ops::Range;

use anyhow::Result;
use candle_core::{DType, Tensor};

use crate::data::Batch;
use crate::error::TexDiffError;

/// Channel ranges of each field inside the conditioning tensor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConditioningLayout {
    pub coarse_map: Range<usize>,
    pub position: Range<usize>,
    pub normal: Range<usize>,
    pub mask: Range<usize>,
}

impl ConditioningLayout {
    pub fn new(coarse_channels: usize, geometry_channels: usize) -> Self {
        let position_start = coarse_channels;
        let normal_start = position_start + geometry_channels;
        let mask_start = normal_start + geometry_channels;
        Self {
            coarse_map: 0..coarse_channels,
            position: position_start..normal_start,
            normal: normal_start..mask_start,
            mask: mask_start..mask_start + 1,
        }
    }

    pub fn channels(&self) -> usize {
        self.mask.end
    }
}

/// Network-ready tensors for one batch, all NCHW f32.
pub struct PreparedBatch {
    /// Ground-truth texture [B, C, H, W].
    pub x: Tensor,
    pub cond: Tensor,
    pub coarse_map: Tensor,
    pub layout: ConditioningLayout,
}

impl PreparedBatch {
    pub fn position(&self) -> Result<Tensor> {
        narrow_range(&self.cond, &self.layout.position)
    }

    pub fn mask(&self) -> Result<Tensor> {
        narrow_range(&self.cond, &self.layout.mask)
    }
}

fn narrow_range(cond: &Tensor, range: &Range<usize>) -> Result<Tensor> {
    Ok(cond.narrow(1, range.start, range.len())?)
}

/// Reverse the rows of an NHWC tensor (flip along H).
///
/// Rendered position and normal maps come out of the rasterizer upside
/// down relative to the texture; applying this twice is the identity.
pub fn flip_vertical(t: &Tensor) -> Result<Tensor> {
    let height = t.dim(1)?;
    let rows: Vec<u32> = (0..height as u32).rev().collect();
    let rows = Tensor::from_vec(rows, height, t.device())?;
    Ok(t.contiguous()?.index_select(&rows, 1)?)
}

fn expect_rank(t: &Tensor, rank: usize, field: &'static str, expected: &str) -> Result<()> {
    if t.rank() != rank {
        return Err(TexDiffError::BatchShape {
            field,
            actual: t.dims().to_vec(),
            expected: expected.to_string(),
        }
        .into());
    }
    Ok(())
}

/// NHWC -> NCHW as f32.
fn to_channels_first(t: &Tensor) -> Result<Tensor> {
    Ok(t.permute((0, 3, 1, 2))?.to_dtype(DType::F32)?.contiguous()?)
}

/// Geometry map: reshape to [B, H, W, C], flip vertically, then NCHW.
fn prepare_geometry(
    t: &Tensor,
    shape: (usize, usize, usize, usize),
    field: &'static str,
) -> Result<Tensor> {
    let (b, h, w, c) = shape;
    if t.elem_count() != b * h * w * c {
        return Err(TexDiffError::BatchShape {
            field,
            actual: t.dims().to_vec(),
            expected: format!("{} elements ([{b}, {h}, {w}, {c}])", b * h * w * c),
        }
        .into());
    }
    let t = t.reshape((b, h, w, c))?;
    to_channels_first(&flip_vertical(&t)?)
}

/// Build the texture target and conditioning tensor from a raw batch.
pub fn prepare_batch(batch: &Batch) -> Result<PreparedBatch> {
    let input = &batch.input;
    expect_rank(&input.texture, 4, "texture", "[B, H, W, C]")?;
    expect_rank(&input.coarse_map, 4, "coarse_map", "[B, H, W, C]")?;
    expect_rank(&input.mask, 3, "mask", "[B, H, W]")?;

    let (b, h, w, c) = input.texture.dims4()?;
    let x = to_channels_first(&input.texture)?;

    let position = prepare_geometry(&input.position, (b, h, w, c), "position")?;
    let normal = prepare_geometry(&input.normal, (b, h, w, c), "normal")?;
    let mask = input.mask.to_dtype(DType::F32)?.unsqueeze(1)?;
    let coarse_map = to_channels_first(&input.coarse_map)?;

    let layout = ConditioningLayout::new(coarse_map.dim(1)?, c);
    // Spatial mismatches between fields surface here
    let cond = Tensor::cat(&[&coarse_map, &position, &normal, &mask], 1)?;

    Ok(PreparedBatch {
        x,
        cond,
        coarse_map,
        layout,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::tests::synthetic_batch;
    use candle_core::Device;

    #[test]
    fn test_layout_ranges() {
        let layout = ConditioningLayout::new(3, 3);
        assert_eq!(layout.coarse_map, 0..3);
        assert_eq!(layout.position, 3..6);
        assert_eq!(layout.normal, 6..9);
        assert_eq!(layout.mask, 9..10);
        assert_eq!(layout.channels(), 10);
    }

    #[test]
    fn test_flip_is_involution() -> Result<()> {
        let device = Device::Cpu;
        let t = Tensor::arange(0f32, 24., &device)?.reshape((1, 4, 2, 3))?;
        let flipped = flip_vertical(&t)?;
        assert_ne!(
            flipped.flatten_all()?.to_vec1::<f32>()?,
            t.flatten_all()?.to_vec1::<f32>()?
        );
        // First row of the flipped map is the last row of the input
        assert_eq!(
            flipped.narrow(1, 0, 1)?.flatten_all()?.to_vec1::<f32>()?,
            t.narrow(1, 3, 1)?.flatten_all()?.to_vec1::<f32>()?
        );
        let restored = flip_vertical(&flipped)?;
        assert_eq!(
            restored.flatten_all()?.to_vec1::<f32>()?,
            t.flatten_all()?.to_vec1::<f32>()?
        );
        Ok(())
    }

    #[test]
    fn test_prepare_batch_channel_order() -> Result<()> {
        let device = Device::Cpu;
        let batch = synthetic_batch(2, 8, &device)?;
        let prepared = prepare_batch(&batch)?;

        assert_eq!(prepared.x.dims(), &[2, 3, 8, 8]);
        assert_eq!(prepared.cond.dims(), &[2, 10, 8, 8]);
        assert_eq!(prepared.layout.channels(), 10);

        // Coarse map occupies the leading channels unchanged
        let coarse = prepared.cond.narrow(1, 0, 3)?.flatten_all()?.to_vec1::<f32>()?;
        let expected = to_channels_first(&batch.input.coarse_map)?.flatten_all()?.to_vec1::<f32>()?;
        assert_eq!(coarse, expected);

        // Position is flipped before the permute
        let position = prepared.position()?.flatten_all()?.to_vec1::<f32>()?;
        let expected = to_channels_first(&flip_vertical(&batch.input.position)?)?
            .flatten_all()?
            .to_vec1::<f32>()?;
        assert_eq!(position, expected);

        // Mask is the last channel
        let mask = prepared.mask()?.flatten_all()?.to_vec1::<f32>()?;
        assert_eq!(mask, batch.input.mask.flatten_all()?.to_vec1::<f32>()?);
        Ok(())
    }

    #[test]
    fn test_flat_position_is_reshaped() -> Result<()> {
        let device = Device::Cpu;
        let mut batch = synthetic_batch(1, 4, &device)?;
        batch.input.position = batch.input.position.reshape((1, 16, 3))?;
        let prepared = prepare_batch(&batch)?;
        assert_eq!(prepared.position()?.dims(), &[1, 3, 4, 4]);
        Ok(())
    }

    #[test]
    fn test_mismatched_shapes_are_errors() -> Result<()> {
        let device = Device::Cpu;
        let mut batch = synthetic_batch(1, 4, &device)?;
        batch.input.normal = Tensor::zeros((1, 5, 5, 3), DType::F32, &device)?;
        assert!(prepare_batch(&batch).is_err());

        let mut batch = synthetic_batch(1, 4, &device)?;
        batch.input.mask = Tensor::zeros((1, 6, 6), DType::F32, &device)?;
        assert!(prepare_batch(&batch).is_err());
        Ok(())
    }
}
