//! Scaled dot-product attention with per-device dispatch
//!
//! - CUDA: Flash Attention (with the `flash-attn` feature, f16 / bf16 only)
//! - Metal: fused SDPA via `candle_nn::ops::sdpa`
//! - CPU / fallback: matmul + softmax

use candle_core::{Device, Result, Tensor};

#[cfg(feature = "flash-attn")]
fn flash_attn(q: &Tensor, k: &Tensor, v: &Tensor, softmax_scale: f32) -> Result<Tensor> {
    candle_flash_attn::flash_attn(q, k, v, softmax_scale, false)
}

/// Attention over `(B, heads, L, head_dim)` tensors
#[derive(Debug, Clone, Copy)]
pub struct CrossPlatformAttention {
    use_accelerated: bool,
}

impl CrossPlatformAttention {
    pub fn new(use_accelerated: bool) -> Self {
        Self { use_accelerated }
    }

    /// `q`: `(B, H, Lq, D)`, `k`/`v`: `(B, H, Lk, D)`
    ///
    /// Variable-length keys are handled by the caller, one sample at a time.
    pub fn forward(&self, q: &Tensor, k: &Tensor, v: &Tensor, scale: f64) -> Result<Tensor> {
        if !self.use_accelerated {
            return attention_basic(q, k, v, scale);
        }
        match q.device() {
            Device::Cuda(_) => attention_cuda(q, k, v, scale),
            Device::Metal(_) => attention_metal(q, k, v, scale),
            Device::Cpu => attention_basic(q, k, v, scale),
        }
    }
}

fn attention_cuda(q: &Tensor, k: &Tensor, v: &Tensor, scale: f64) -> Result<Tensor> {
    #[cfg(feature = "flash-attn")]
    {
        if matches!(q.dtype(), candle_core::DType::F16 | candle_core::DType::BF16) {
            // flash-attn layout is (B, L, H, D)
            let q = q.transpose(1, 2)?.contiguous()?;
            let k = k.transpose(1, 2)?.contiguous()?;
            let v = v.transpose(1, 2)?.contiguous()?;
            return flash_attn(&q, &k, &v, scale as f32)?.transpose(1, 2);
        }
    }
    attention_basic(q, k, v, scale)
}

fn attention_metal(q: &Tensor, k: &Tensor, v: &Tensor, scale: f64) -> Result<Tensor> {
    candle_nn::ops::sdpa(q, k, v, None, false, scale as f32, 1.0)
}

fn attention_basic(q: &Tensor, k: &Tensor, v: &Tensor, scale: f64) -> Result<Tensor> {
    let k_t = k.transpose(2, 3)?.contiguous()?;
    let scores = (q.contiguous()?.matmul(&k_t)? * scale)?;
    let probs = candle_nn::ops::softmax_last_dim(&scores)?;
    probs.matmul(&v.contiguous()?)
}
