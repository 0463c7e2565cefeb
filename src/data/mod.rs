//! Render batches and the on-disk dataset they are read from
//!
//! A dataset directory holds one safetensors file per object, laid out as
//! `<root>/<category>/<name>.safetensors`. Each file stores the per-object
//! maps without a batch dimension: `texture` [H, W, 3], `position`
//! [H, W, 3], `normal` [H, W, 3], `mask` [H, W] and `coarse_map` [H, W, 3].

use anyhow::{Context, Result};
use candle_core::{Device, Tensor};
use log::info;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::TexDiffError;

pub const TENSOR_NAMES: [&str; 5] = ["texture", "position", "normal", "mask", "coarse_map"];

/// Per-pixel render maps for a batch of objects, channel-last.
#[derive(Debug, Clone)]
pub struct BatchInput {
    pub texture: Tensor,
    pub position: Tensor,
    pub normal: Tensor,
    pub mask: Tensor,
    pub coarse_map: Tensor,
}

#[derive(Debug, Clone)]
pub struct Batch {
    pub input: BatchInput,
    pub category: Vec<String>,
    pub name: Vec<String>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.name.is_empty()
    }

    /// Copy every tensor of the batch to `device`.
    pub fn to_device(&self, device: &Device) -> Result<Batch> {
        let input = &self.input;
        Ok(Batch {
            input: BatchInput {
                texture: input.texture.to_device(device)?,
                position: input.position.to_device(device)?,
                normal: input.normal.to_device(device)?,
                mask: input.mask.to_device(device)?,
                coarse_map: input.coarse_map.to_device(device)?,
            },
            category: self.category.clone(),
            name: self.name.clone(),
        })
    }
}

#[derive(Debug, Clone)]
pub struct DatasetItem {
    pub path: PathBuf,
    pub category: String,
    pub name: String,
}

pub struct TextureDataset {
    root: PathBuf,
    items: Vec<DatasetItem>,
}

impl TextureDataset {
    /// Index every `<category>/<name>.safetensors` under `root`.
    pub fn open<P: AsRef<Path>>(root: P) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        let mut items = Vec::new();

        let mut categories: Vec<PathBuf> = fs::read_dir(&root)
            .with_context(|| format!("Failed to read dataset directory: {}", root.display()))?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.is_dir())
            .collect();
        categories.sort();

        for category_dir in categories {
            let category = category_dir
                .file_name()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_default();
            let mut files: Vec<PathBuf> = fs::read_dir(&category_dir)
                .with_context(|| format!("Failed to read category: {}", category_dir.display()))?
                .filter_map(|entry| entry.ok().map(|e| e.path()))
                .filter(|p| p.extension().and_then(|e| e.to_str()) == Some("safetensors"))
                .collect();
            files.sort();

            for path in files {
                items.push(DatasetItem {
                    name: file_stem(&path),
                    category: category.clone(),
                    path,
                });
            }
        }

        anyhow::ensure!(!items.is_empty(), "No samples found under {}", root.display());
        info!("Loaded dataset index: {} samples from {}", items.len(), root.display());

        Ok(Self { root, items })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn items(&self) -> &[DatasetItem] {
        &self.items
    }

    /// Load and stack the samples at `indices` into one batch.
    pub fn batch(&self, indices: &[usize], device: &Device) -> Result<Batch> {
        let mut fields: Vec<Vec<Tensor>> = vec![Vec::with_capacity(indices.len()); TENSOR_NAMES.len()];
        let mut category = Vec::with_capacity(indices.len());
        let mut name = Vec::with_capacity(indices.len());

        for &idx in indices {
            let item = self
                .items
                .get(idx)
                .with_context(|| format!("Sample index {idx} out of range (len {})", self.items.len()))?;
            let mut tensors = candle_core::safetensors::load(&item.path, device)
                .with_context(|| format!("Failed to load sample: {}", item.path.display()))?;

            for (slot, tensor_name) in fields.iter_mut().zip(TENSOR_NAMES) {
                let tensor = tensors.remove(tensor_name).ok_or_else(|| TexDiffError::MissingTensor {
                    path: item.path.display().to_string(),
                    name: tensor_name.to_string(),
                })?;
                slot.push(tensor);
            }
            category.push(item.category.clone());
            name.push(item.name.clone());
        }

        let mut stacked = fields
            .iter()
            .map(|tensors| Tensor::stack(tensors, 0))
            .collect::<candle_core::Result<Vec<_>>>()
            .context("Samples in a batch must share their spatial size")?
            .into_iter();
        let mut next = || stacked.next().context("missing stacked field");

        Ok(Batch {
            input: BatchInput {
                texture: next()?,
                position: next()?,
                normal: next()?,
                mask: next()?,
                coarse_map: next()?,
            },
            category,
            name,
        })
    }
}

fn file_stem(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default()
}
