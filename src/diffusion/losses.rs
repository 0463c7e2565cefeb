//! Likelihood helpers for the variational bound terms

use candle_core::{Result, Tensor};

/// Mean over every dimension except the batch dimension.
pub fn mean_flat(tensor: &Tensor) -> Result<Tensor> {
    let batch_size = tensor.dim(0)?;
    tensor.reshape((batch_size, ()))?.mean(1)
}

/// KL divergence between two diagonal Gaussians, elementwise.
pub fn normal_kl(
    mean1: &Tensor,
    logvar1: &Tensor,
    mean2: &Tensor,
    logvar2: &Tensor,
) -> Result<Tensor> {
    // 0.5 * (-1 + lv2 - lv1 + exp(lv1 - lv2) + (m1 - m2)^2 * exp(-lv2))
    let log_ratio = logvar2.broadcast_sub(logvar1)?;
    let var_ratio = logvar1.broadcast_sub(logvar2)?.exp()?;
    let mean_term = mean1
        .broadcast_sub(mean2)?
        .sqr()?
        .broadcast_mul(&logvar2.neg()?.exp()?)?;
    log_ratio
        .broadcast_add(&var_ratio)?
        .broadcast_add(&mean_term)?
        .affine(0.5, -0.5)
}

/// Fast approximation of the standard normal CDF.
pub fn approx_standard_normal_cdf(x: &Tensor) -> Result<Tensor> {
    let coef = (2.0 / std::f64::consts::PI).sqrt();
    let inner = (x + (x.powf(3.0)? * 0.044715)?)?;
    ((inner * coef)?.tanh()? + 1.0)? * 0.5
}

/// Log-likelihood of `x` under a Gaussian discretized to 256 bins over [-1, 1].
pub fn discretized_gaussian_log_likelihood(
    x: &Tensor,
    means: &Tensor,
    log_scales: &Tensor,
) -> Result<Tensor> {
    let centered_x = x.broadcast_sub(means)?;
    let inv_stdv = log_scales.neg()?.exp()?;
    let plus_in = (&centered_x + 1.0 / 255.0)?.broadcast_mul(&inv_stdv)?;
    let cdf_plus = approx_standard_normal_cdf(&plus_in)?;
    let min_in = (&centered_x - 1.0 / 255.0)?.broadcast_mul(&inv_stdv)?;
    let cdf_min = approx_standard_normal_cdf(&min_in)?;

    let log_cdf_plus = cdf_plus.clamp(1e-12f32, f32::MAX)?.log()?;
    let log_one_minus_cdf_min = cdf_min.affine(-1.0, 1.0)?.clamp(1e-12f32, f32::MAX)?.log()?;
    let cdf_delta = (&cdf_plus - &cdf_min)?;
    let log_cdf_delta = cdf_delta.clamp(1e-12f32, f32::MAX)?.log()?;

    let upper = x.gt(0.999)?.where_cond(&log_one_minus_cdf_min, &log_cdf_delta)?;
    x.lt(-0.999)?.where_cond(&log_cdf_plus, &upper)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn test_normal_kl_is_zero_for_identical() -> Result<()> {
        let device = Device::Cpu;
        let mean = Tensor::new(&[0.3f32, -0.2, 1.0], &device)?;
        let logvar = Tensor::new(&[-1.0f32, 0.0, 0.5], &device)?;
        let kl = normal_kl(&mean, &logvar, &mean, &logvar)?.to_vec1::<f32>()?;
        assert!(kl.iter().all(|v| v.abs() < 1e-6));

        let shifted = (&mean + 1.0)?;
        let kl = normal_kl(&mean, &logvar, &shifted, &logvar)?.to_vec1::<f32>()?;
        assert!(kl.iter().all(|&v| v > 0.0));
        Ok(())
    }

    #[test]
    fn test_cdf_midpoint_and_tails() -> Result<()> {
        let device = Device::Cpu;
        let x = Tensor::new(&[-6.0f32, 0.0, 6.0], &device)?;
        let cdf = approx_standard_normal_cdf(&x)?.to_vec1::<f32>()?;
        assert!(cdf[0] < 1e-4);
        assert!((cdf[1] - 0.5).abs() < 1e-6);
        assert!(cdf[2] > 1.0 - 1e-4);
        Ok(())
    }

    #[test]
    fn test_discretized_likelihood_is_non_positive() -> Result<()> {
        let device = Device::Cpu;
        let x = Tensor::new(&[-1.0f32, -0.5, 0.0, 0.5, 1.0], &device)?;
        let means = Tensor::zeros(5, candle_core::DType::F32, &device)?;
        let log_scales = Tensor::full(-2.0f32, 5, &device)?;
        let ll = discretized_gaussian_log_likelihood(&x, &means, &log_scales)?.to_vec1::<f32>()?;
        assert!(ll.iter().all(|&v| v <= 0.0 && v.is_finite()));
        // The bin at the mean is the most likely one
        assert!(ll[2] > ll[1] && ll[2] > ll[3]);
        Ok(())
    }

    #[test]
    fn test_mean_flat() -> Result<()> {
        let device = Device::Cpu;
        let t = Tensor::arange(0f32, 8., &device)?.reshape((2, 2, 2))?;
        assert_eq!(mean_flat(&t)?.to_vec1::<f32>()?, vec![1.5, 5.5]);
        Ok(())
    }
}
