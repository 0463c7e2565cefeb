//! Texture diffusion training and sampling binary

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use log::info;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use texdiff::data::TextureDataset;
use texdiff::trainers::image_utils::save_batch_images;
use texdiff::{load_config, Config, DiffusionModule};

#[derive(Parser, Debug)]
#[command(author, version, about = "Train and sample conditional texture diffusion models", long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Train the denoiser on a render dataset
    Train {
        /// Path to the YAML config
        #[arg(long)]
        config: PathBuf,

        /// Override the number of training steps
        #[arg(long)]
        steps: Option<usize>,
    },
    /// Sample textures for every object in the dataset
    Sample {
        /// Path to the YAML config
        #[arg(long)]
        config: PathBuf,

        /// Directory holding network.safetensors (defaults to <output>/weights)
        #[arg(long)]
        weights: Option<PathBuf>,
    },
}

fn main() -> Result<()> {
    texdiff::logging::init_logger();

    let args = Args::parse();
    match args.command {
        Command::Train { config, steps } => {
            info!("Starting training with config: {}", config.display());
            let mut config = load_config(&config)?;
            if let Some(steps) = steps {
                config.train.steps = steps;
            }
            train(&config)?;
            info!("Training completed successfully");
        }
        Command::Sample { config, weights } => {
            info!("Sampling with config: {}", config.display());
            let config = load_config(&config)?;
            let weights = weights.unwrap_or_else(|| config.output.dir.join("weights"));
            sample(&config, &weights)?;
        }
    }
    Ok(())
}

fn train(config: &Config) -> Result<()> {
    let dataset = TextureDataset::open(&config.data.path)?;
    let mut module = DiffusionModule::new(config.module_components()?)?;
    let device = module.device().clone();

    let output_dir = &config.output.dir;
    fs::create_dir_all(output_dir)
        .with_context(|| format!("Failed to create output directory: {}", output_dir.display()))?;
    let mut metrics_log = OpenOptions::new()
        .create(true)
        .append(true)
        .open(output_dir.join("metrics.jsonl"))
        .context("Failed to open metrics log")?;

    let batch_size = config.train.batch_size.clamp(1, dataset.len());
    let log_every = config.train.log_every.max(1);
    let mut rng = StdRng::seed_from_u64(config.train.seed);
    let mut order: Vec<usize> = Vec::new();
    let mut batch_idx = 0;

    for step in 1..=config.train.steps {
        if order.len() < batch_size {
            // New epoch
            let mut epoch: Vec<usize> = (0..dataset.len()).collect();
            epoch.shuffle(&mut rng);
            order.extend(epoch);
        }
        let indices: Vec<usize> = order.drain(..batch_size).collect();
        let batch = dataset.batch(&indices, &device)?;

        let (metrics, visuals) = module.training_step(&batch, batch_idx)?;
        batch_idx += 1;

        if step % log_every == 0 {
            info!(
                "Step {}/{}: loss {:.6}, mean {:.6}, lr {:.3e}",
                step,
                config.train.steps,
                metrics.loss.unwrap_or(f32::NAN),
                metrics.train_loss_mean.unwrap_or(f64::NAN),
                metrics.lr.unwrap_or_default()
            );
            writeln!(metrics_log, "{}", serde_json::json!({ "step": step, "metrics": metrics }))?;

            let names: Vec<String> = batch
                .category
                .iter()
                .zip(&batch.name)
                .map(|(c, n)| format!("{c}_{n}"))
                .collect();
            let vis_dir = output_dir.join("train_vis").join(format!("step_{step:06}"));
            save_batch_images(&visuals.image, &vis_dir, &names)?;
            module.reset_train_loss();
        }

        if let Some(every) = config.train.save_every {
            if every > 0 && step % every == 0 {
                module.save_weights(output_dir.join(format!("checkpoint_{step:06}")))?;
            }
        }
    }

    module.save_weights(output_dir.join("weights"))?;
    Ok(())
}

fn sample(config: &Config, weights: &Path) -> Result<()> {
    let dataset = TextureDataset::open(&config.data.path)?;
    let mut module = DiffusionModule::new(config.module_components()?)?;
    module.load_weights(weights)?;
    let device = module.device().clone();

    let sample_dir = config.output.dir.join("samples");
    let batch_size = config.train.batch_size.max(1);
    let indices: Vec<usize> = (0..dataset.len()).collect();

    for (batch_idx, chunk) in indices.chunks(batch_size).enumerate() {
        let batch = dataset.batch(chunk, &device)?;
        let (_, visuals) = module.test_step(&batch, batch_idx)?;

        let names: Vec<String> = visuals
            .obj_c
            .iter()
            .zip(&visuals.obj_name)
            .map(|(c, n)| format!("{c}_{n}"))
            .collect();
        save_batch_images(&visuals.texture_map, &sample_dir, &names)?;
        save_batch_images(&visuals.image, &sample_dir.join("composite"), &names)?;
        info!("Sampled {}/{} objects", batch_idx * batch_size + chunk.len(), dataset.len());
    }

    info!("Samples written to {}", sample_dir.display());
    Ok(())
}
