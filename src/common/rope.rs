//! 1D rotary position embedding over the frame axis
//!
//! Rotates adjacent `(x0, x1)` pairs of each head, matching the interleaved
//! layout of `rotary-embedding-torch`. The cos/sin table is precomputed for
//! `max_len` positions; longer sequences compute a table per call.

use candle_core::{DType, Device, Result, Tensor};

pub use candle_nn::rotary_emb::rope_i;

#[derive(Debug, Clone)]
pub struct RotaryEmbedding {
    head_dim: usize,
    theta: f64,
    cos: Tensor,
    sin: Tensor,
}

impl RotaryEmbedding {
    pub fn new(head_dim: usize, max_len: usize, device: &Device) -> Result<Self> {
        Self::with_theta(head_dim, max_len, 10_000.0, device)
    }

    pub fn with_theta(head_dim: usize, max_len: usize, theta: f64, device: &Device) -> Result<Self> {
        if !head_dim.is_multiple_of(2) {
            candle_core::bail!("rotary embedding needs an even head dim, got {head_dim}")
        }
        let (cos, sin) = table(head_dim, max_len, theta, device)?;
        Ok(Self {
            head_dim,
            theta,
            cos,
            sin,
        })
    }

    pub fn head_dim(&self) -> usize {
        self.head_dim
    }

    /// Rotate `x` of shape `(B, H, L, head_dim)` by position along `L`
    pub fn apply(&self, x: &Tensor) -> Result<Tensor> {
        let (_, _, len, _) = x.dims4()?;
        let (cos, sin) = if len <= self.cos.dim(0)? {
            (self.cos.narrow(0, 0, len)?, self.sin.narrow(0, 0, len)?)
        } else {
            table(self.head_dim, len, self.theta, x.device())?
        };
        let cos = cos.to_device(x.device())?.to_dtype(x.dtype())?;
        let sin = sin.to_device(x.device())?.to_dtype(x.dtype())?;
        rope_i(&x.contiguous()?, &cos, &sin)
    }
}

fn table(head_dim: usize, len: usize, theta: f64, device: &Device) -> Result<(Tensor, Tensor)> {
    let half = head_dim / 2;
    let inv_freq: Vec<f32> = (0..half)
        .map(|i| 1.0 / theta.powf((2 * i) as f64 / head_dim as f64) as f32)
        .collect();
    let inv_freq = Tensor::from_vec(inv_freq, (1, half), device)?;
    let positions = Tensor::arange(0u32, len as u32, device)?
        .to_dtype(DType::F32)?
        .reshape((len, 1))?;
    let freqs = positions.broadcast_mul(&inv_freq)?;
    Ok((freqs.cos()?, freqs.sin()?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::IndexOp;

    #[test]
    fn test_position_zero_is_identity() -> Result<()> {
        let device = Device::Cpu;
        let rope = RotaryEmbedding::new(8, 16, &device)?;
        let x = Tensor::randn(0f32, 1.0, (2, 3, 5, 8), &device)?;
        let y = rope.apply(&x)?;
        assert_eq!(y.dims(), x.dims());
        let diff = (y.i((.., .., 0))? - x.i((.., .., 0))?)?
            .abs()?
            .max_all()?
            .to_scalar::<f32>()?;
        assert!(diff < 1e-6);
        Ok(())
    }

    #[test]
    fn test_rotation_preserves_norm() -> Result<()> {
        let device = Device::Cpu;
        let rope = RotaryEmbedding::new(4, 2, &device)?;
        // longer than the cached table
        let x = Tensor::randn(0f32, 1.0, (1, 1, 6, 4), &device)?;
        let y = rope.apply(&x)?;
        let nx = x.sqr()?.sum_keepdim(3)?;
        let ny = y.sqr()?.sum_keepdim(3)?;
        let diff = (nx - ny)?.abs()?.max_all()?.to_scalar::<f32>()?;
        assert!(diff < 1e-4);
        Ok(())
    }

    #[test]
    fn test_beyond_precomputed_matches_larger_table() -> Result<()> {
        let device = Device::Cpu;
        let x = Tensor::randn(0f32, 1.0, (1, 2, 6, 4), &device)?;
        let short = RotaryEmbedding::new(4, 2, &device)?.apply(&x)?;
        let long = RotaryEmbedding::new(4, 8, &device)?.apply(&x)?;
        let diff = (short - long)?.abs()?.max_all()?.to_scalar::<f32>()?;
        assert!(diff < 1e-6);
        Ok(())
    }

    #[test]
    fn test_odd_head_dim_rejected() {
        assert!(RotaryEmbedding::new(7, 4, &Device::Cpu).is_err());
    }
}
