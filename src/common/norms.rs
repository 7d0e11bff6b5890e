//! Normalization layers computed in f32 regardless of the weight dtype

use candle_core::{D, DType, Module, Result, Tensor};
use candle_nn::VarBuilder;

fn internal_dtype(dtype: DType) -> DType {
    match dtype {
        DType::F16 | DType::BF16 => DType::F32,
        d => d,
    }
}

/// LayerNorm without learnable parameters (`elementwise_affine=False`)
#[derive(Debug, Clone, Copy)]
pub struct LayerNormNoParams {
    eps: f64,
}

impl LayerNormNoParams {
    pub fn new(eps: f64) -> Self {
        Self { eps }
    }
}

impl Module for LayerNormNoParams {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let dtype = x.dtype();
        let hidden = x.dim(D::Minus1)? as f64;
        let x = x.to_dtype(internal_dtype(dtype))?;

        let mean = (x.sum_keepdim(D::Minus1)? / hidden)?;
        let x = x.broadcast_sub(&mean)?;
        let var = (x.sqr()?.sum_keepdim(D::Minus1)? / hidden)?;
        x.broadcast_div(&(var + self.eps)?.sqrt()?)?.to_dtype(dtype)
    }
}

/// RMSNorm with a learned per-channel scale, used as the q/k norm
#[derive(Debug, Clone)]
pub struct RmsNorm {
    weight: Tensor,
    eps: f64,
}

impl RmsNorm {
    pub fn new(dim: usize, eps: f64, vb: VarBuilder) -> Result<Self> {
        let weight = vb.get_with_hints(dim, "weight", candle_nn::init::ONE)?;
        Ok(Self { weight, eps })
    }
}

impl Module for RmsNorm {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let dtype = x.dtype();
        let internal = internal_dtype(dtype);
        let hidden = x.dim(D::Minus1)? as f64;
        let x = x.to_dtype(internal)?;

        let variance = (x.sqr()?.sum_keepdim(D::Minus1)? / hidden)?;
        let normed = x.broadcast_div(&(variance + self.eps)?.sqrt()?)?;
        normed
            .broadcast_mul(&self.weight.to_dtype(internal)?)?
            .to_dtype(dtype)
    }
}
