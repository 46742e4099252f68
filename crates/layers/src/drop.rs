//! Stochastic depth drop for residual branches.
//!
//! During training, each element of the branch output is zeroed with the
//! configured probability before the residual add; evaluation passes the
//! branch through untouched. No rescaling is applied to survivors.

use candle_core::{DType, Error, Result, Tensor};

#[derive(Debug, Clone, Copy)]
pub struct DropPath {
    drop_prob: f64,
}

impl DropPath {
    pub fn new(drop_prob: f64) -> Result<Self> {
        if !(0.0..1.0).contains(&drop_prob) {
            return Err(Error::Msg(format!(
                "drop probability must be in [0, 1), got {drop_prob}"
            )));
        }
        Ok(Self { drop_prob })
    }

    pub fn drop_prob(&self) -> f64 {
        self.drop_prob
    }

    pub fn forward(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        if !train || self.drop_prob == 0.0 {
            return Ok(x.clone());
        }
        let keep = Tensor::rand(0f32, 1f32, x.dims(), x.device())?
            .ge(self.drop_prob)?
            .to_dtype(DType::F32)?;
        x.broadcast_mul(&keep)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn identity_outside_training() -> Result<()> {
        let drop = DropPath::new(0.9)?;
        let x = Tensor::randn(0f32, 1.0, (2, 4, 4, 3), &Device::Cpu)?;
        let out = drop.forward(&x, false)?;
        let diff = out.sub(&x)?.abs()?.max_all()?.to_vec0::<f32>()?;
        assert_eq!(diff, 0.0);
        Ok(())
    }

    #[test]
    fn zero_probability_is_identity_in_training() -> Result<()> {
        let drop = DropPath::new(0.0)?;
        let x = Tensor::randn(0f32, 1.0, (2, 8), &Device::Cpu)?;
        let out = drop.forward(&x, true)?;
        let diff = out.sub(&x)?.abs()?.max_all()?.to_vec0::<f32>()?;
        assert_eq!(diff, 0.0);
        Ok(())
    }

    #[test]
    fn training_zeroes_roughly_the_drop_fraction() -> Result<()> {
        let drop = DropPath::new(0.5)?;
        let x = Tensor::ones((64, 64), DType::F32, &Device::Cpu)?;
        let out = drop.forward(&x, true)?;
        let survivors = out.sum_all()?.to_vec0::<f32>()?;
        let fraction = survivors / (64.0 * 64.0);
        assert!((0.35..=0.65).contains(&fraction), "fraction {fraction}");
        Ok(())
    }

    #[test]
    fn rejects_probability_of_one() {
        assert!(DropPath::new(1.0).is_err());
    }
}
