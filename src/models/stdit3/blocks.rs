//! Spatial / temporal transformer blocks and the final projection

use crate::common::{CrossPlatformAttention, LayerNormNoParams, RmsNorm, RotaryEmbedding};
use crate::parallel::{ColumnParallelLinear, ProcessGroup, RowParallelLinear, all_to_all_autograd};
use candle_core::{Module, Result, Tensor, bail};
use candle_nn::{Linear, VarBuilder, init};

const NORM_EPS: f64 = 1e-6;

/// `x * (1 + scale) + shift`
pub fn t2i_modulate(x: &Tensor, shift: &Tensor, scale: &Tensor) -> Result<Tensor> {
    x.broadcast_mul(&(scale + 1.0)?)?.broadcast_add(shift)
}

/// Per (batch, frame) choice between `x` and `masked_x`
///
/// `x_mask` is `[B, T]` (nonzero keeps `x`); `x` and `masked_x` are `[B, T·S, C]`.
pub fn t_mask_select(
    x_mask: &Tensor,
    x: &Tensor,
    masked_x: &Tensor,
    frames: usize,
    spatial: usize,
) -> Result<Tensor> {
    let (b, n, c) = x.dims3()?;
    if n != frames * spatial {
        bail!("t_mask_select: {n} tokens is not {frames} frames x {spatial}")
    }
    let shape = (b, frames, spatial, c);
    let mask = x_mask
        .reshape((b, frames, 1, 1))?
        .broadcast_as(shape)?;
    mask.where_cond(&x.reshape(shape)?, &masked_x.reshape(shape)?)?
        .reshape((b, n, c))
}

fn scale_shift_table(rows: usize, hidden: usize, vb: &VarBuilder) -> Result<Tensor> {
    vb.get_with_hints(
        (rows, hidden),
        "scale_shift_table",
        init::Init::Randn {
            mean: 0.0,
            stdev: 1.0 / (hidden as f64).sqrt(),
        },
    )
}

/// `table[None] + t.reshape(B, rows, C)` split into `rows` tensors of `[B, 1, C]`
fn modulation(table: &Tensor, t: &Tensor, rows: usize) -> Result<Vec<Tensor>> {
    let (b, _) = t.dims2()?;
    let hidden = table.dim(1)?;
    let params = t
        .reshape((b, rows, hidden))?
        .broadcast_add(&table.unsqueeze(0)?.to_dtype(t.dtype())?)?;
    params.chunk(rows, 1)
}

/// `table[None] + t[:, None]` split into `rows` tensors of `[B, 1, C]`; `t` is `[B, C]`
fn broadcast_modulation(table: &Tensor, t: &Tensor, rows: usize) -> Result<Vec<Tensor>> {
    let params = table
        .unsqueeze(0)?
        .to_dtype(t.dtype())?
        .broadcast_add(&t.unsqueeze(1)?)?;
    params.chunk(rows, 1)
}

/// Multi-head self-attention with column / row parallel projections
#[derive(Debug, Clone)]
pub struct SelfAttention {
    proj_q: ColumnParallelLinear,
    proj_k: ColumnParallelLinear,
    proj_v: ColumnParallelLinear,
    proj_out: RowParallelLinear,
    q_norm: Option<RmsNorm>,
    k_norm: Option<RmsNorm>,
    rope: Option<RotaryEmbedding>,
    /// Set for spatial attention under sequence parallelism
    sequence_group: Option<ProcessGroup>,
    local_heads: usize,
    head_dim: usize,
    attn: CrossPlatformAttention,
}

impl SelfAttention {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        hidden: usize,
        num_heads: usize,
        qk_norm: bool,
        rope: Option<RotaryEmbedding>,
        sequence_group: Option<ProcessGroup>,
        use_accelerated: bool,
        vb: VarBuilder,
        tensor_group: &ProcessGroup,
    ) -> Result<Self> {
        let head_dim = hidden / num_heads;
        let tp = tensor_group.size();
        if !num_heads.is_multiple_of(tp) {
            bail!("{num_heads} heads not divisible by tensor-parallel size {tp}")
        }
        let local_heads = num_heads / tp;
        if let Some(group) = &sequence_group
            && !local_heads.is_multiple_of(group.size())
        {
            bail!(
                "{local_heads} local heads not divisible by sequence-parallel size {}",
                group.size()
            )
        }
        let (q_norm, k_norm) = if qk_norm {
            (
                Some(RmsNorm::new(head_dim, NORM_EPS, vb.pp("q_norm"))?),
                Some(RmsNorm::new(head_dim, NORM_EPS, vb.pp("k_norm"))?),
            )
        } else {
            (None, None)
        };
        Ok(Self {
            proj_q: ColumnParallelLinear::new(hidden, hidden, true, vb.pp("proj_q"), tensor_group)?,
            proj_k: ColumnParallelLinear::new(hidden, hidden, true, vb.pp("proj_k"), tensor_group)?,
            proj_v: ColumnParallelLinear::new(hidden, hidden, true, vb.pp("proj_v"), tensor_group)?,
            proj_out: RowParallelLinear::new(hidden, hidden, true, vb.pp("proj_out"), tensor_group)?,
            q_norm,
            k_norm,
            rope,
            sequence_group,
            local_heads,
            head_dim,
            attn: CrossPlatformAttention::new(use_accelerated),
        })
    }

    /// `[N, L, C]` -> `[N, L, C]`; under sequence parallelism `L` is the local shard
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let (n, len, _) = x.dims3()?;
        let heads = |t: Tensor| -> Result<Tensor> {
            let t = t.reshape((n, len, self.local_heads, self.head_dim))?;
            match &self.sequence_group {
                // [N, L/sp, H, D] -> [N, L, H/sp, D]
                Some(group) => all_to_all_autograd(&t, group, 2, 1),
                None => Ok(t),
            }
        };
        let mut q = heads(self.proj_q.forward(x)?)?;
        let mut k = heads(self.proj_k.forward(x)?)?;
        let v = heads(self.proj_v.forward(x)?)?;
        if let (Some(q_norm), Some(k_norm)) = (&self.q_norm, &self.k_norm) {
            q = q_norm.forward(&q)?;
            k = k_norm.forward(&k)?;
        }

        let mut q = q.transpose(1, 2)?.contiguous()?;
        let mut k = k.transpose(1, 2)?.contiguous()?;
        let v = v.transpose(1, 2)?.contiguous()?;
        if let Some(rope) = &self.rope {
            q = rope.apply(&q)?;
            k = rope.apply(&k)?;
        }

        let scale = 1.0 / (self.head_dim as f64).sqrt();
        let out = self.attn.forward(&q, &k, &v, scale)?.transpose(1, 2)?;
        let out = match &self.sequence_group {
            Some(group) => all_to_all_autograd(&out.contiguous()?, group, 1, 2)?,
            None => out,
        };
        let out = out.reshape((n, len, self.local_heads * self.head_dim))?;
        self.proj_out.forward(&out)
    }
}

/// Cross-attention from video tokens to each sample's own text tokens
#[derive(Debug, Clone)]
pub struct CrossAttention {
    proj_q: ColumnParallelLinear,
    proj_k: ColumnParallelLinear,
    proj_v: ColumnParallelLinear,
    proj_out: RowParallelLinear,
    local_heads: usize,
    head_dim: usize,
    attn: CrossPlatformAttention,
}

impl CrossAttention {
    pub fn new(
        hidden: usize,
        num_heads: usize,
        use_accelerated: bool,
        vb: VarBuilder,
        tensor_group: &ProcessGroup,
    ) -> Result<Self> {
        let tp = tensor_group.size();
        if !num_heads.is_multiple_of(tp) {
            bail!("{num_heads} heads not divisible by tensor-parallel size {tp}")
        }
        Ok(Self {
            proj_q: ColumnParallelLinear::new(hidden, hidden, true, vb.pp("proj_q"), tensor_group)?,
            proj_k: ColumnParallelLinear::new(hidden, hidden, true, vb.pp("proj_k"), tensor_group)?,
            proj_v: ColumnParallelLinear::new(hidden, hidden, true, vb.pp("proj_v"), tensor_group)?,
            proj_out: RowParallelLinear::new(hidden, hidden, true, vb.pp("proj_out"), tensor_group)?,
            local_heads: num_heads / tp,
            head_dim: hidden / num_heads,
            attn: CrossPlatformAttention::new(use_accelerated),
        })
    }

    /// `x`: `[B, N, C]`, `y`: `[1, Σ y_lens, C]` packed text tokens
    pub fn forward(&self, x: &Tensor, y: &Tensor, y_lens: &[usize]) -> Result<Tensor> {
        let (b, n, _) = x.dims3()?;
        if y_lens.len() != b {
            bail!("cross attention: {} text lengths for batch {b}", y_lens.len())
        }
        let inner = self.local_heads * self.head_dim;
        let q = self.proj_q.forward(x)?;
        let total: usize = y_lens.iter().sum();
        let kv = if total > 0 {
            Some((self.proj_k.forward(y)?, self.proj_v.forward(y)?))
        } else {
            None
        };

        let scale = 1.0 / (self.head_dim as f64).sqrt();
        let mut outputs = Vec::with_capacity(b);
        let mut offset = 0;
        for (i, &len) in y_lens.iter().enumerate() {
            let out = match &kv {
                Some((k, v)) if len > 0 => {
                    let split = |t: &Tensor, l: usize| -> Result<Tensor> {
                        t.reshape((1, l, self.local_heads, self.head_dim))?
                            .transpose(1, 2)?
                            .contiguous()
                    };
                    let q_i = split(&q.narrow(0, i, 1)?, n)?;
                    let k_i = split(&k.narrow(1, offset, len)?, len)?;
                    let v_i = split(&v.narrow(1, offset, len)?, len)?;
                    self.attn
                        .forward(&q_i, &k_i, &v_i, scale)?
                        .transpose(1, 2)?
                        .reshape((1, n, inner))?
                }
                _ => Tensor::zeros((1, n, inner), q.dtype(), q.device())?,
            };
            outputs.push(out);
            offset += len;
        }
        self.proj_out.forward(&Tensor::cat(&outputs, 0)?)
    }
}

/// Feed-forward `fc1 -> GELU(tanh) -> fc2`
#[derive(Debug, Clone)]
pub struct FeedForward {
    fc1: ColumnParallelLinear,
    fc2: RowParallelLinear,
}

impl FeedForward {
    pub fn new(
        hidden: usize,
        mlp_hidden: usize,
        vb: VarBuilder,
        tensor_group: &ProcessGroup,
    ) -> Result<Self> {
        Ok(Self {
            fc1: ColumnParallelLinear::new(hidden, mlp_hidden, true, vb.pp("net.0.proj"), tensor_group)?,
            fc2: RowParallelLinear::new(mlp_hidden, hidden, true, vb.pp("net.2"), tensor_group)?,
        })
    }
}

impl Module for FeedForward {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        self.fc2.forward(&self.fc1.forward(x)?.gelu()?)
    }
}

/// Conditioning shared by every block of one forward pass
#[derive(Debug, Clone, Copy)]
pub struct BlockInputs<'a> {
    /// Packed text tokens `[1, Σ, C]`
    pub y: &'a Tensor,
    pub y_lens: &'a [usize],
    /// `t_block` output `[B, 6C]`
    pub t: &'a Tensor,
    /// Frame validity `[B, T]`, u8
    pub x_mask: Option<&'a Tensor>,
    /// `t_block` output for timestep zero, required with `x_mask`
    pub t0: Option<&'a Tensor>,
    pub frames: usize,
    /// Spatial tokens per frame held by this rank
    pub spatial: usize,
}

impl BlockInputs<'_> {
    fn mask_and_t0(&self) -> Result<Option<(&Tensor, &Tensor)>> {
        match (self.x_mask, self.t0) {
            (Some(mask), Some(t0)) => Ok(Some((mask, t0))),
            (None, _) => Ok(None),
            (Some(_), None) => bail!("temporal mask given without zero-timestep conditioning"),
        }
    }
}

/// One STDiT3 block; attends within frames (spatial) or across frames (temporal)
#[derive(Debug, Clone)]
pub struct Stdit3Block {
    temporal: bool,
    norm: LayerNormNoParams,
    attn: SelfAttention,
    cross_attn: CrossAttention,
    ff: FeedForward,
    scale_shift_table: Tensor,
}

impl Stdit3Block {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        hidden: usize,
        num_heads: usize,
        mlp_hidden: usize,
        qk_norm: bool,
        temporal: Option<RotaryEmbedding>,
        sequence_group: Option<ProcessGroup>,
        use_accelerated: bool,
        vb: VarBuilder,
        tensor_group: &ProcessGroup,
    ) -> Result<Self> {
        let is_temporal = temporal.is_some();
        // temporal attention stays local to each spatial shard
        let sequence_group = if is_temporal { None } else { sequence_group };
        Ok(Self {
            temporal: is_temporal,
            norm: LayerNormNoParams::new(NORM_EPS),
            attn: SelfAttention::new(
                hidden,
                num_heads,
                qk_norm,
                temporal,
                sequence_group,
                use_accelerated,
                vb.pp("self_atten"),
                tensor_group,
            )?,
            cross_attn: CrossAttention::new(
                hidden,
                num_heads,
                use_accelerated,
                vb.pp("cross_atten"),
                tensor_group,
            )?,
            ff: FeedForward::new(hidden, mlp_hidden, vb.pp("ff"), tensor_group)?,
            scale_shift_table: scale_shift_table(6, hidden, &vb)?,
        })
    }

    pub fn is_temporal(&self) -> bool {
        self.temporal
    }

    fn modulate(
        &self,
        x_norm: &Tensor,
        shift: (&Tensor, &Tensor),
        scale: (&Tensor, &Tensor),
        inputs: &BlockInputs,
        masked: Option<&Tensor>,
    ) -> Result<Tensor> {
        let x_m = t2i_modulate(x_norm, shift.0, scale.0)?;
        match masked {
            Some(mask) => {
                let x_zero = t2i_modulate(x_norm, shift.1, scale.1)?;
                t_mask_select(mask, &x_m, &x_zero, inputs.frames, inputs.spatial)
            }
            None => Ok(x_m),
        }
    }

    fn gate(
        &self,
        x: &Tensor,
        gate: (&Tensor, &Tensor),
        inputs: &BlockInputs,
        masked: Option<&Tensor>,
    ) -> Result<Tensor> {
        let x_g = x.broadcast_mul(gate.0)?;
        match masked {
            Some(mask) => {
                let x_zero = x.broadcast_mul(gate.1)?;
                t_mask_select(mask, &x_g, &x_zero, inputs.frames, inputs.spatial)
            }
            None => Ok(x_g),
        }
    }

    /// `[B, T·S, C]` -> `[B, T·S, C]`
    pub fn forward(&self, x: &Tensor, inputs: &BlockInputs) -> Result<Tensor> {
        let (b, _, c) = x.dims3()?;
        let (frames, spatial) = (inputs.frames, inputs.spatial);
        let m = modulation(&self.scale_shift_table, inputs.t, 6)?;
        let masked = inputs.mask_and_t0()?;
        // without a mask the zero-timestep slots are never read
        let m0 = match masked {
            Some((_, t0)) => modulation(&self.scale_shift_table, t0, 6)?,
            None => m.clone(),
        };
        let mask = masked.map(|(mask, _)| mask);

        // attention
        let x_norm = self.norm.forward(x)?;
        let x_m = self.modulate(&x_norm, (&m[0], &m0[0]), (&m[1], &m0[1]), inputs, mask)?;
        let x_m = if self.temporal {
            let seq = x_m
                .reshape((b, frames, spatial, c))?
                .transpose(1, 2)?
                .reshape((b * spatial, frames, c))?;
            self.attn
                .forward(&seq)?
                .reshape((b, spatial, frames, c))?
                .transpose(1, 2)?
                .reshape((b, frames * spatial, c))?
        } else {
            let seq = x_m.reshape((b * frames, spatial, c))?;
            self.attn.forward(&seq)?.reshape((b, frames * spatial, c))?
        };
        let x = (x + self.gate(&x_m, (&m[2], &m0[2]), inputs, mask)?)?;

        // cross attention
        let x = (&x + self.cross_attn.forward(&x, inputs.y, inputs.y_lens)?)?;

        // feed-forward
        let x_norm = self.norm.forward(&x)?;
        let x_m = self.modulate(&x_norm, (&m[3], &m0[3]), (&m[4], &m0[4]), inputs, mask)?;
        let x_m = self.ff.forward(&x_m)?;
        x + self.gate(&x_m, (&m[5], &m0[5]), inputs, mask)?
    }
}

/// Final `norm -> modulate -> linear` projection to patch pixels
#[derive(Debug, Clone)]
pub struct T2IFinalLayer {
    norm: LayerNormNoParams,
    linear: Linear,
    scale_shift_table: Tensor,
}

impl T2IFinalLayer {
    pub fn new(hidden: usize, patch_volume: usize, out_channels: usize, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            norm: LayerNormNoParams::new(NORM_EPS),
            linear: candle_nn::linear(hidden, patch_volume * out_channels, vb.pp("linear"))?,
            scale_shift_table: scale_shift_table(2, hidden, &vb)?,
        })
    }

    /// `x`: `[B, T·S, C]`, `t` / `t0`: timestep embeddings `[B, C]`
    pub fn forward(
        &self,
        x: &Tensor,
        t: &Tensor,
        x_mask: Option<(&Tensor, &Tensor)>,
        frames: usize,
        spatial: usize,
    ) -> Result<Tensor> {
        let m = broadcast_modulation(&self.scale_shift_table, t, 2)?;
        let x_norm = self.norm.forward(x)?;
        let mut x_m = t2i_modulate(&x_norm, &m[0], &m[1])?;
        if let Some((mask, t0)) = x_mask {
            let m0 = broadcast_modulation(&self.scale_shift_table, t0, 2)?;
            let x_zero = t2i_modulate(&x_norm, &m0[0], &m0[1])?;
            x_m = t_mask_select(mask, &x_m, &x_zero, frames, spatial)?;
        }
        self.linear.forward(&x_m)
    }
}
