//! Input embedders: video patches, timesteps, fps, captions and 2D positions

use candle_core::{D, DType, Device, Module, Result, Tensor};
use candle_nn::{Linear, VarBuilder, init};

/// Width of the sinusoidal timestep features fed to the embedder MLPs
pub const FREQUENCY_EMBEDDING_SIZE: usize = 256;

/// Sinusoidal features `[cos(t·f), sin(t·f)]` for a `[N]` tensor of timesteps
pub fn timestep_embedding(t: &Tensor, dim: usize, max_period: f64) -> Result<Tensor> {
    let half = dim / 2;
    let freqs: Vec<f32> = (0..half)
        .map(|i| (-(max_period.ln()) * i as f64 / half as f64).exp() as f32)
        .collect();
    let freqs = Tensor::from_vec(freqs, (1, half), t.device())?;
    let args = t
        .to_dtype(DType::F32)?
        .flatten_all()?
        .unsqueeze(1)?
        .broadcast_mul(&freqs)?;
    let emb = Tensor::cat(&[args.cos()?, args.sin()?], D::Minus1)?;
    if dim.is_multiple_of(2) {
        Ok(emb)
    } else {
        emb.pad_with_zeros(D::Minus1, 0, 1)
    }
}

/// 3D patchifier equivalent to a Conv3d with `kernel = stride = patch_size`
///
/// Inputs are zero-padded at the end of each axis to a multiple of the patch
/// size. The conv weight `[hidden, C, pt, ph, pw]` is applied as a matmul over
/// flattened patches.
#[derive(Debug, Clone)]
pub struct PatchEmbed3D {
    weight: Tensor,
    bias: Tensor,
    patch_size: [usize; 3],
    in_channels: usize,
}

impl PatchEmbed3D {
    pub fn new(
        patch_size: [usize; 3],
        in_channels: usize,
        hidden_size: usize,
        vb: VarBuilder,
    ) -> Result<Self> {
        let [pt, ph, pw] = patch_size;
        let fan_in = in_channels * pt * ph * pw;
        let bound = 1.0 / (fan_in as f64).sqrt();
        let weight = vb.get_with_hints(
            (hidden_size, in_channels, pt, ph, pw),
            "weight",
            init::Init::Uniform {
                lo: -bound,
                up: bound,
            },
        )?;
        let bias = vb.get_with_hints(hidden_size, "bias", init::ZERO)?;
        Ok(Self {
            weight: weight.reshape((hidden_size, fan_in))?,
            bias,
            patch_size,
            in_channels,
        })
    }

    /// Number of patches along `(T, H, W)` after padding
    pub fn grid_size(&self, t: usize, h: usize, w: usize) -> (usize, usize, usize) {
        let [pt, ph, pw] = self.patch_size;
        (t.div_ceil(pt), h.div_ceil(ph), w.div_ceil(pw))
    }

    /// `[B, C, T, H, W]` -> `[B, nt·nh·nw, hidden]`, tokens ordered `(t, h, w)`
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let (b, c, t, h, w) = x.dims5()?;
        if c != self.in_channels {
            candle_core::bail!("patch embed: expected {} channels, got {c}", self.in_channels)
        }
        let [pt, ph, pw] = self.patch_size;
        let (nt, nh, nw) = self.grid_size(t, h, w);

        let x = x
            .pad_with_zeros(4, 0, nw * pw - w)?
            .pad_with_zeros(3, 0, nh * ph - h)?
            .pad_with_zeros(2, 0, nt * pt - t)?;
        let patches = x
            .reshape(vec![b, c, nt, pt, nh, ph, nw, pw])?
            .permute(vec![0, 2, 4, 6, 1, 3, 5, 7])?
            .reshape((b, nt * nh * nw, c * pt * ph * pw))?
            .contiguous()?;
        patches
            .broadcast_matmul(&self.weight.t()?)?
            .broadcast_add(&self.bias)
    }
}

/// `Linear -> SiLU -> Linear` over sinusoidal timestep features
#[derive(Debug, Clone)]
pub struct TimestepEmbedder {
    fc1: Linear,
    fc2: Linear,
}

impl TimestepEmbedder {
    pub fn new(hidden_size: usize, vb: VarBuilder) -> Result<Self> {
        let fc1 = candle_nn::linear(FREQUENCY_EMBEDDING_SIZE, hidden_size, vb.pp("mlp.0"))?;
        let fc2 = candle_nn::linear(hidden_size, hidden_size, vb.pp("mlp.2"))?;
        Ok(Self { fc1, fc2 })
    }

    /// `[N]` timesteps -> `[N, hidden]`
    pub fn forward(&self, t: &Tensor, dtype: DType) -> Result<Tensor> {
        let freq = timestep_embedding(t, FREQUENCY_EMBEDDING_SIZE, 10_000.0)?.to_dtype(dtype)?;
        self.fc2.forward(&self.fc1.forward(&freq)?.silu()?)
    }
}

/// Embeds a scalar size condition (fps) per sample
#[derive(Debug, Clone)]
pub struct SizeEmbedder {
    inner: TimestepEmbedder,
}

impl SizeEmbedder {
    pub fn new(hidden_size: usize, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            inner: TimestepEmbedder::new(hidden_size, vb)?,
        })
    }

    /// `[b]` or `[b, d]` sizes, repeated up to `batch` rows -> `[batch, d·hidden]`
    pub fn forward(&self, sizes: &Tensor, batch: usize, dtype: DType) -> Result<Tensor> {
        let sizes = if sizes.rank() == 1 {
            sizes.unsqueeze(1)?
        } else {
            sizes.clone()
        };
        let rows = sizes.dim(0)?;
        let sizes = if rows != batch {
            if rows == 0 || !batch.is_multiple_of(rows) {
                candle_core::bail!("size embedder: cannot repeat {rows} rows to batch {batch}")
            }
            sizes.repeat((batch / rows, 1))?
        } else {
            sizes
        };
        let emb = self.inner.forward(&sizes.flatten_all()?, dtype)?;
        emb.reshape((batch, ()))
    }
}

/// Caption projection `fc1 -> GELU(tanh) -> fc2` with a learned null caption
#[derive(Debug, Clone)]
pub struct CaptionEmbedder {
    fc1: Linear,
    fc2: Linear,
    y_embedding: Tensor,
}

impl CaptionEmbedder {
    pub fn new(
        caption_channels: usize,
        hidden_size: usize,
        token_num: usize,
        vb: VarBuilder,
    ) -> Result<Self> {
        let fc1 = candle_nn::linear(caption_channels, hidden_size, vb.pp("y_proj.fc1"))?;
        let fc2 = candle_nn::linear(hidden_size, hidden_size, vb.pp("y_proj.fc2"))?;
        let y_embedding = vb.get_with_hints(
            (token_num, caption_channels),
            "y_embedding",
            init::Init::Randn {
                mean: 0.0,
                stdev: 1.0 / (caption_channels as f64).sqrt(),
            },
        )?;
        Ok(Self {
            fc1,
            fc2,
            y_embedding,
        })
    }

    /// Learned unconditional caption, `[token_num, caption_channels]`
    pub fn null_caption(&self) -> &Tensor {
        &self.y_embedding
    }

    /// `[B, 1, L, caption_channels]` -> `[B, 1, L, hidden]`
    ///
    /// Rows of `drop_ids` (`[B]`, nonzero = drop) are replaced by the null caption.
    pub fn forward(&self, caption: &Tensor, drop_ids: Option<&Tensor>) -> Result<Tensor> {
        let caption = match drop_ids {
            Some(drop) => {
                let null = self
                    .y_embedding
                    .to_dtype(caption.dtype())?
                    .unsqueeze(0)?
                    .unsqueeze(0)?
                    .broadcast_as(caption.shape())?;
                let drop = drop
                    .ne(0u32)?
                    .reshape((caption.dim(0)?, 1, 1, 1))?
                    .broadcast_as(caption.shape())?;
                drop.where_cond(&null, caption)?
            }
            None => caption.clone(),
        };
        self.fc2.forward(&self.fc1.forward(&caption)?.gelu()?)
    }
}

/// 2D sin-cos position embedding recomputed for each resolution
///
/// The first half of the channels encodes the column index, the second half
/// the row index; each half is `[sin, cos]`.
#[derive(Debug, Clone)]
pub struct PositionEmbedding2D {
    dim: usize,
    inv_freq: Vec<f32>,
}

impl PositionEmbedding2D {
    pub fn new(dim: usize) -> Result<Self> {
        if !dim.is_multiple_of(4) {
            candle_core::bail!("2D position embedding needs dim divisible by 4, got {dim}")
        }
        let half = dim / 2;
        let inv_freq = (0..half)
            .step_by(2)
            .map(|i| 1.0 / 10_000f32.powf(i as f32 / half as f32))
            .collect();
        Ok(Self { dim, inv_freq })
    }

    fn sin_cos(&self, pos: f32, out: &mut Vec<f32>) {
        out.extend(self.inv_freq.iter().map(|f| (pos * f).sin()));
        out.extend(self.inv_freq.iter().map(|f| (pos * f).cos()));
    }

    /// `[1, h·w, dim]`; grid coordinates are divided by `scale` and
    /// stretched to `base_size` when given
    pub fn forward(
        &self,
        h: usize,
        w: usize,
        scale: f64,
        base_size: Option<usize>,
        device: &Device,
        dtype: DType,
    ) -> Result<Tensor> {
        let coords = |n: usize| -> Vec<f32> {
            (0..n)
                .map(|i| {
                    let mut v = i as f32 / scale as f32;
                    if let Some(base) = base_size {
                        v *= base as f32 / n as f32;
                    }
                    v
                })
                .collect()
        };
        let grid_h = coords(h);
        let grid_w = coords(w);

        let mut data = Vec::with_capacity(h * w * self.dim);
        for gh in &grid_h {
            for gw in &grid_w {
                self.sin_cos(*gw, &mut data);
                self.sin_cos(*gh, &mut data);
            }
        }
        Tensor::from_vec(data, (1, h * w, self.dim), device)?.to_dtype(dtype)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::IndexOp;
    use candle_nn::VarMap;

    #[test]
    fn test_timestep_embedding_layout() -> Result<()> {
        let t = Tensor::new(&[0f32, 10.0], &Device::Cpu)?;
        let emb = timestep_embedding(&t, 8, 10_000.0)?;
        assert_eq!(emb.dims(), &[2, 8]);
        // t = 0 -> cos half is 1, sin half is 0
        let row = emb.i(0)?.to_vec1::<f32>()?;
        assert_eq!(&row[..4], &[1.0; 4]);
        assert_eq!(&row[4..], &[0.0; 4]);
        Ok(())
    }

    #[test]
    fn test_patch_embed_pads_and_orders_tokens() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let embed = PatchEmbed3D::new([1, 2, 2], 3, 16, vb.pp("x_embedder.proj"))?;
        let x = Tensor::randn(0f32, 1.0, (2, 3, 2, 5, 4), &device)?;
        let out = embed.forward(&x)?;
        // H = 5 is padded to 6 -> 3 rows of patches
        assert_eq!(embed.grid_size(2, 5, 4), (2, 3, 2));
        assert_eq!(out.dims(), &[2, 2 * 3 * 2, 16]);
        Ok(())
    }

    #[test]
    fn test_patch_embed_matches_manual_patch() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let embed = PatchEmbed3D::new([1, 2, 2], 1, 4, vb)?;
        let x = Tensor::arange(0f32, 16.0, &device)?.reshape((1, 1, 1, 4, 4))?;
        let out = embed.forward(&x)?;

        // second token covers rows 0..2, cols 2..4
        let patch = Tensor::new(&[2f32, 3.0, 6.0, 7.0], &device)?.unsqueeze(0)?;
        let expected = patch
            .matmul(&embed.weight.t()?)?
            .broadcast_add(&embed.bias)?
            .squeeze(0)?;
        let diff = (out.i((0, 1))? - expected)?
            .abs()?
            .max_all()?
            .to_scalar::<f32>()?;
        assert!(diff < 1e-5);
        Ok(())
    }

    #[test]
    fn test_position_embedding_halves() -> Result<()> {
        let pe = PositionEmbedding2D::new(8)?;
        let emb = pe.forward(2, 3, 1.0, None, &Device::Cpu, DType::F32)?;
        assert_eq!(emb.dims(), &[1, 6, 8]);
        // token (row 1, col 0): column half is the zero position, [sin 0, cos 0]
        let tok = emb.i((0, 3))?.to_vec1::<f32>()?;
        assert_eq!(&tok[..4], &[0.0, 0.0, 1.0, 1.0]);
        assert!((tok[4] - 1f32.sin()).abs() < 1e-6);
        Ok(())
    }

    #[test]
    fn test_caption_drop_uses_null_caption() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let embedder = CaptionEmbedder::new(6, 4, 3, vb)?;
        let caption = Tensor::randn(0f32, 1.0, (2, 1, 3, 6), &device)?;
        let drop = Tensor::new(&[1u32, 0], &device)?;

        let out = embedder.forward(&caption, Some(&drop))?;
        let null = embedder.forward(&embedder.null_caption().reshape((1, 1, 3, 6))?, None)?;
        let kept = embedder.forward(&caption.narrow(0, 1, 1)?, None)?;

        let d0 = (out.i(0)? - null.i(0)?)?.abs()?.max_all()?.to_scalar::<f32>()?;
        let d1 = (out.i(1)? - kept.i(0)?)?.abs()?.max_all()?.to_scalar::<f32>()?;
        assert!(d0 < 1e-5 && d1 < 1e-5);
        Ok(())
    }
}
