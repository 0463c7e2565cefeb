//! Beta schedules and timestep respacing for the Gaussian diffusion process

use std::collections::BTreeSet;

use crate::error::TexDiffError;

/// Largest beta allowed by the cosine schedule.
const MAX_BETA: f64 = 0.999;

/// Build the named beta schedule for `num_timesteps` steps.
pub fn named_beta_schedule(name: &str, num_timesteps: usize) -> Result<Vec<f64>, TexDiffError> {
    match name {
        "linear" => {
            // Scaled so that any step count matches the 1000-step reference ramp
            let scale = 1000.0 / num_timesteps as f64;
            let beta_end = scale * 0.02;
            // At beta = 1 alphas_cumprod hits zero and x0 prediction divides by it
            if beta_end >= 1.0 {
                return Err(TexDiffError::DegenerateBetaSchedule {
                    schedule: name.to_string(),
                    steps: num_timesteps,
                });
            }
            Ok(linear_beta_schedule(num_timesteps, scale * 0.0001, beta_end))
        }
        "scaled_linear" => Ok(scaled_linear_beta_schedule(num_timesteps, 0.00085, 0.012)),
        "cosine" | "squaredcos_cap_v2" => Ok(betas_for_alpha_bar(num_timesteps, |t| {
            ((t + 0.008) / 1.008 * std::f64::consts::FRAC_PI_2).cos().powi(2)
        })),
        other => Err(TexDiffError::UnknownBetaSchedule(other.to_string())),
    }
}

fn linear_beta_schedule(num_timesteps: usize, beta_start: f64, beta_end: f64) -> Vec<f64> {
    if num_timesteps == 1 {
        return vec![beta_start];
    }
    (0..num_timesteps)
        .map(|i| beta_start + (beta_end - beta_start) * i as f64 / (num_timesteps as f64 - 1.0))
        .collect()
}

fn scaled_linear_beta_schedule(num_timesteps: usize, beta_start: f64, beta_end: f64) -> Vec<f64> {
    linear_beta_schedule(num_timesteps, beta_start.sqrt(), beta_end.sqrt())
        .into_iter()
        .map(|b| b * b)
        .collect()
}

/// Discretize a continuous `alpha_bar(t)` over t in [0, 1].
fn betas_for_alpha_bar(num_timesteps: usize, alpha_bar: impl Fn(f64) -> f64) -> Vec<f64> {
    (0..num_timesteps)
        .map(|i| {
            let t1 = i as f64 / num_timesteps as f64;
            let t2 = (i + 1) as f64 / num_timesteps as f64;
            (1.0 - alpha_bar(t2) / alpha_bar(t1)).min(MAX_BETA)
        })
        .collect()
}

/// Pick which of the original `num_timesteps` steps to keep.
///
/// `respacing` is either `ddimN`, selecting N steps with a constant integer
/// stride, or a comma-separated list of section counts: the schedule is
/// cut into that many equal sections and each section is sampled with the
/// given number of evenly spaced steps. An empty string keeps every step.
pub fn space_timesteps(num_timesteps: usize, respacing: &str) -> Result<BTreeSet<usize>, TexDiffError> {
    let respacing = respacing.trim();
    if respacing.is_empty() {
        return Ok((0..num_timesteps).collect());
    }

    let invalid = |reason: String| TexDiffError::InvalidRespacing {
        respacing: respacing.to_string(),
        reason,
    };

    if let Some(count) = respacing.strip_prefix("ddim") {
        let desired: usize = count
            .parse()
            .map_err(|_| invalid(format!("`{count}` is not a step count")))?;
        for stride in 1..num_timesteps.max(2) {
            if (0..num_timesteps).step_by(stride).count() == desired {
                return Ok((0..num_timesteps).step_by(stride).collect());
            }
        }
        return Err(invalid(format!(
            "cannot create exactly {desired} steps with an integer stride"
        )));
    }

    let section_counts = respacing
        .split(',')
        .map(|s| {
            s.trim()
                .parse::<usize>()
                .map_err(|_| invalid(format!("`{s}` is not a step count")))
        })
        .collect::<Result<Vec<_>, _>>()?;

    let size_per = num_timesteps / section_counts.len();
    let extra = num_timesteps % section_counts.len();
    let mut start_idx = 0;
    let mut all_steps = BTreeSet::new();

    for (i, &section_count) in section_counts.iter().enumerate() {
        let size = size_per + usize::from(i < extra);
        if size < section_count {
            return Err(invalid(format!(
                "cannot divide section of {size} steps into {section_count}"
            )));
        }
        let frac_stride = if section_count <= 1 {
            1.0
        } else {
            (size - 1) as f64 / (section_count - 1) as f64
        };
        let mut cur_idx = 0.0f64;
        for _ in 0..section_count {
            // Halfway indices round to even
            all_steps.insert(start_idx + cur_idx.round_ties_even() as usize);
            cur_idx += frac_stride;
        }
        start_idx += size;
    }

    Ok(all_steps)
}

/// Rebuild betas for the kept timesteps.
///
/// Returns the new betas and the map from respaced index to original
/// timestep.
pub fn respace_betas(betas: &[f64], use_timesteps: &BTreeSet<usize>) -> (Vec<f64>, Vec<usize>) {
    let mut new_betas = Vec::with_capacity(use_timesteps.len());
    let mut timestep_map = Vec::with_capacity(use_timesteps.len());
    let mut last_alpha_cumprod = 1.0;
    let mut alpha_cumprod = 1.0;

    for (i, beta) in betas.iter().enumerate() {
        alpha_cumprod *= 1.0 - beta;
        if use_timesteps.contains(&i) {
            new_betas.push(1.0 - alpha_cumprod / last_alpha_cumprod);
            last_alpha_cumprod = alpha_cumprod;
            timestep_map.push(i);
        }
    }

    (new_betas, timestep_map)
}
