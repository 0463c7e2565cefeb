//! Image export for training visualizations and sampled textures

use anyhow::{Context, Result};
use candle_core::{DType, Device, Tensor};
use image::{ImageBuffer, Rgb};
use std::fs;
use std::path::{Path, PathBuf};

/// Save a [C, H, W] tensor with values in [0, 1] as an RGB image.
/// Single-channel tensors are written as grayscale RGB.
pub fn save_image<P: AsRef<Path>>(tensor: &Tensor, path: P) -> Result<()> {
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }

    let (channels, height, width) = tensor.dims3().context("Expected 3D tensor [C, H, W]")?;
    let tensor = match channels {
        3 => tensor.clone(),
        1 => tensor.repeat((3, 1, 1))?,
        c => anyhow::bail!("Unsupported number of channels: {}", c),
    };

    let tensor = (tensor.to_device(&Device::Cpu)?.to_dtype(DType::F32)?.clamp(0f32, 1f32)? * 255.0)?
        .round()?
        .to_dtype(DType::U8)?;
    let data = tensor.permute((1, 2, 0))?.flatten_all()?.to_vec1::<u8>()?;

    let img = ImageBuffer::<Rgb<u8>, Vec<u8>>::from_raw(width as u32, height as u32, data)
        .context("Failed to create image buffer")?;
    img.save(path)
        .with_context(|| format!("Failed to save image: {}", path.display()))?;
    Ok(())
}

/// Save every image of a [B, C, H, W] batch as `<dir>/<name>.png`.
pub fn save_batch_images(batch: &Tensor, dir: &Path, names: &[String]) -> Result<Vec<PathBuf>> {
    let batch_size = batch.dim(0)?;
    anyhow::ensure!(
        names.len() == batch_size,
        "{} names for a batch of {}",
        names.len(),
        batch_size
    );

    names
        .iter()
        .enumerate()
        .map(|(i, name)| {
            let path = dir.join(format!("{name}.png"));
            save_image(&batch.get(i)?, &path)?;
            Ok(path)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_save_rgb_and_gray() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let device = Device::Cpu;

        let rgb = Tensor::rand(0f32, 1f32, (3, 8, 12), &device)?;
        save_image(&rgb, dir.path().join("rgb.png"))?;
        let img = image::open(dir.path().join("rgb.png"))?.to_rgb8();
        assert_eq!((img.width(), img.height()), (12, 8));

        let gray = Tensor::ones((1, 4, 4), DType::F32, &device)?;
        save_image(&gray, dir.path().join("nested/gray.png"))?;
        let img = image::open(dir.path().join("nested/gray.png"))?.to_rgb8();
        assert_eq!(img.get_pixel(0, 0).0, [255, 255, 255]);
        Ok(())
    }

    #[test]
    fn test_rejects_unsupported_channels() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let t = Tensor::zeros((4, 2, 2), DType::F32, &Device::Cpu)?;
        assert!(save_image(&t, dir.path().join("x.png")).is_err());
        Ok(())
    }

    #[test]
    fn test_save_batch_images() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let batch = Tensor::zeros((2, 3, 4, 4), DType::F32, &Device::Cpu)?;
        let names = vec!["a".to_string(), "b".to_string()];
        let paths = save_batch_images(&batch, dir.path(), &names)?;
        assert_eq!(paths.len(), 2);
        assert!(paths.iter().all(|p| p.exists()));
        Ok(())
    }
}
