//! EMA (Exponential Moving Average) shadow of the network weights

use anyhow::{Context, Result};
use candle_core::Var;
use candle_nn::VarMap;

/// Decayed running copy of every trainable parameter.
///
/// The shadow lives in its own `VarMap` so a second network instance can
/// be built over it; `update` writes into the shadow vars in place, which
/// that instance sees immediately.
pub struct ModelEma {
    decay: f64,
    shadow: VarMap,
    num_updates: usize,
}

impl ModelEma {
    /// Start the shadow as an exact copy of `params`.
    pub fn new(params: &VarMap, decay: f64) -> Result<Self> {
        anyhow::ensure!((0.0..=1.0).contains(&decay), "EMA decay must lie in [0, 1], got {decay}");

        let shadow = VarMap::new();
        {
            let source = params.data().lock().map_err(|_| anyhow::anyhow!("parameter map poisoned"))?;
            let mut target = shadow.data().lock().map_err(|_| anyhow::anyhow!("EMA map poisoned"))?;
            for (name, var) in source.iter() {
                target.insert(name.clone(), Var::from_tensor(&var.as_tensor().copy()?)?);
            }
        }

        Ok(Self {
            decay,
            shadow,
            num_updates: 0,
        })
    }

    pub fn decay(&self) -> f64 {
        self.decay
    }

    pub fn num_updates(&self) -> usize {
        self.num_updates
    }

    pub fn shadow(&self) -> &VarMap {
        &self.shadow
    }

    /// shadow = decay * shadow + (1 - decay) * param
    pub fn update(&mut self, params: &VarMap) -> Result<()> {
        let source = params.data().lock().map_err(|_| anyhow::anyhow!("parameter map poisoned"))?;
        let target = self.shadow.data().lock().map_err(|_| anyhow::anyhow!("EMA map poisoned"))?;

        for (name, param) in source.iter() {
            let ema_param = target
                .get(name)
                .with_context(|| format!("EMA shadow has no parameter `{name}`"))?;
            let param = param.as_tensor().detach();
            let updated = ((ema_param.as_tensor() * self.decay)? + (param * (1.0 - self.decay))?)?;
            ema_param.set(&updated)?;
        }

        self.num_updates += 1;
        Ok(())
    }

    /// Load shadow weights saved with `shadow().save(..)`.
    pub fn load<P: AsRef<std::path::Path>>(&mut self, path: P) -> Result<()> {
        self.shadow.load(path)?;
        Ok(())
    }

    /// Overwrite the shadow with `params`.
    pub fn reset_to(&mut self, params: &VarMap) -> Result<()> {
        let source = params.data().lock().map_err(|_| anyhow::anyhow!("parameter map poisoned"))?;
        let target = self.shadow.data().lock().map_err(|_| anyhow::anyhow!("EMA map poisoned"))?;
        for (name, param) in source.iter() {
            if let Some(ema_param) = target.get(name) {
                ema_param.set(param.as_tensor())?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device, Tensor};
    use candle_nn::Init;

    fn params(device: &Device) -> Result<VarMap> {
        let varmap = VarMap::new();
        varmap.get((2, 2), "layer.weight", Init::Const(1.0), DType::F32, device)?;
        Ok(varmap)
    }

    fn values(varmap: &VarMap, name: &str) -> Result<Vec<f32>> {
        let data = varmap.data().lock().unwrap();
        Ok(data[name].as_tensor().flatten_all()?.to_vec1()?)
    }

    fn set_param(varmap: &VarMap, name: &str, value: f32, device: &Device) -> Result<()> {
        let data = varmap.data().lock().unwrap();
        data[name].set(&Tensor::full(value, (2, 2), device)?)?;
        Ok(())
    }

    #[test]
    fn test_shadow_starts_as_copy() -> Result<()> {
        let device = Device::Cpu;
        let varmap = params(&device)?;
        let ema = ModelEma::new(&varmap, 0.9)?;
        assert_eq!(values(ema.shadow(), "layer.weight")?, vec![1.0; 4]);

        // Shadow does not alias the live parameters
        set_param(&varmap, "layer.weight", 5.0, &device)?;
        assert_eq!(values(ema.shadow(), "layer.weight")?, vec![1.0; 4]);
        Ok(())
    }

    #[test]
    fn test_update_decays_toward_params() -> Result<()> {
        let device = Device::Cpu;
        let varmap = params(&device)?;
        let mut ema = ModelEma::new(&varmap, 0.9)?;

        set_param(&varmap, "layer.weight", 3.0, &device)?;
        ema.update(&varmap)?;
        let shadow = values(ema.shadow(), "layer.weight")?;
        assert!(shadow.iter().all(|v| (v - 1.2).abs() < 1e-6));
        assert_ne!(shadow, values(&varmap, "layer.weight")?);
        assert_eq!(ema.num_updates(), 1);
        Ok(())
    }

    #[test]
    fn test_zero_decay_tracks_params() -> Result<()> {
        let device = Device::Cpu;
        let varmap = params(&device)?;
        let mut ema = ModelEma::new(&varmap, 0.0)?;
        set_param(&varmap, "layer.weight", -2.0, &device)?;
        ema.update(&varmap)?;
        assert_eq!(values(ema.shadow(), "layer.weight")?, vec![-2.0; 4]);
        Ok(())
    }

    #[test]
    fn test_invalid_decay() {
        let varmap = VarMap::new();
        assert!(ModelEma::new(&varmap, 1.5).is_err());
    }
}
