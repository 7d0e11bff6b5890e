use super::blocks::{BlockInputs, Stdit3Block, T2IFinalLayer};
use super::embeddings::{
    CaptionEmbedder, PatchEmbed3D, PositionEmbedding2D, SizeEmbedder, TimestepEmbedder,
};
use crate::common::RotaryEmbedding;
use crate::config::Stdit3Config;
use crate::models::{ModelKwargs, Predictor};
use crate::parallel::{
    GradScale, ParallelContext, ProcessGroup, gather_forward_split_backward,
    split_forward_gather_backward,
};
use candle_core::{DType, Module, Result, Tensor, bail};
use candle_nn::{Linear, VarBuilder};
use tracing::{debug, info};

/// fps assumed when the conditioning carries none
pub const DEFAULT_FPS: f32 = 24.0;

/// Spatial-temporal DiT predictor
///
/// Pairs of spatial and temporal blocks over patch tokens, conditioned on
/// the timestep (plus fps) through adaLN-style modulation and on text
/// through cross-attention.
#[derive(Debug)]
pub struct Stdit3 {
    config: Stdit3Config,
    dtype: DType,
    x_embedder: PatchEmbed3D,
    pos_embed: PositionEmbedding2D,
    t_embedder: TimestepEmbedder,
    fps_embedder: SizeEmbedder,
    t_block: Linear,
    y_embedder: CaptionEmbedder,
    spatial_blocks: Vec<Stdit3Block>,
    temporal_blocks: Vec<Stdit3Block>,
    final_layer: T2IFinalLayer,
    /// Context-parallel group when tokens are sharded across ranks
    sequence_group: Option<ProcessGroup>,
}

impl Stdit3 {
    pub fn new(config: Stdit3Config, vb: VarBuilder, ctx: &ParallelContext) -> Result<Self> {
        let hidden = config.hidden_size;
        if config.num_heads == 0 || !hidden.is_multiple_of(config.num_heads) {
            bail!("hidden size {hidden} not divisible by {} heads", config.num_heads)
        }
        let sequence_group = (config.enable_sequence_parallelism && ctx.context.is_distributed())
            .then(|| ctx.context.clone());
        let rope = RotaryEmbedding::new(config.head_dim(), 64, vb.device())?;
        let mlp_hidden = config.mlp_hidden_size();
        let accel = config.use_accelerated_attention;

        let mut spatial_blocks = Vec::with_capacity(config.depth);
        let mut temporal_blocks = Vec::with_capacity(config.depth);
        for i in 0..config.depth {
            spatial_blocks.push(Stdit3Block::new(
                hidden,
                config.num_heads,
                mlp_hidden,
                config.qk_norm,
                None,
                sequence_group.clone(),
                accel,
                vb.pp(format!("spatial_blocks.{i}")),
                &ctx.tensor,
            )?);
            temporal_blocks.push(Stdit3Block::new(
                hidden,
                config.num_heads,
                mlp_hidden,
                config.qk_norm,
                Some(rope.clone()),
                None,
                accel,
                vb.pp(format!("temporal_blocks.{i}")),
                &ctx.tensor,
            )?);
        }

        let patch_volume = config.patch_size.iter().product();
        let model = Self {
            dtype: vb.dtype(),
            x_embedder: PatchEmbed3D::new(
                config.patch_size,
                config.in_channels,
                hidden,
                vb.pp("x_embedder.proj"),
            )?,
            pos_embed: PositionEmbedding2D::new(hidden)?,
            t_embedder: TimestepEmbedder::new(hidden, vb.pp("t_embedder"))?,
            fps_embedder: SizeEmbedder::new(hidden, vb.pp("fps_embedder"))?,
            t_block: candle_nn::linear(hidden, 6 * hidden, vb.pp("t_block.1"))?,
            y_embedder: CaptionEmbedder::new(
                config.caption_channels,
                hidden,
                config.model_max_length,
                vb.pp("y_embedder"),
            )?,
            spatial_blocks,
            temporal_blocks,
            final_layer: T2IFinalLayer::new(
                hidden,
                patch_volume,
                config.out_channels(),
                vb.pp("final_layer"),
            )?,
            sequence_group,
            config,
        };
        info!(
            depth = model.config.depth,
            hidden_size = hidden,
            num_heads = model.config.num_heads,
            tensor_parallel = ctx.tensor.size(),
            sequence_parallel = model.sequence_group.as_ref().map_or(1, |g| g.size()),
            "STDiT3 predictor built"
        );
        Ok(model)
    }

    pub fn config(&self) -> &Stdit3Config {
        &self.config
    }

    pub fn caption_embedder(&self) -> &CaptionEmbedder {
        &self.y_embedder
    }

    /// Project captions and pack the valid tokens of every sample
    ///
    /// `y`: `[B, 1, L, caption_channels]` (or `[B, L, caption_channels]`),
    /// `mask`: `[B, L]` / `[B, 1, L]`, repeated along the batch when smaller.
    /// Returns `[1, Σ lengths, hidden]` and the per-sample lengths.
    pub fn encode_text(&self, y: &Tensor, mask: Option<&Tensor>) -> Result<(Tensor, Vec<usize>)> {
        let y = if y.rank() == 3 { y.unsqueeze(1)? } else { y.clone() };
        let y = self.y_embedder.forward(&y.to_dtype(self.dtype)?, None)?;
        let (b, _, len, hidden) = y.dims4()?;
        let flat = y.reshape((b * len, hidden))?;

        let Some(mask) = mask else {
            return Ok((flat.unsqueeze(0)?, vec![len; b]));
        };
        let mask_rows = mask.dim(0)?;
        let mask = mask.reshape((mask_rows, ()))?;
        if mask.dim(1)? != len {
            bail!("prompt mask covers {} tokens, captions have {len}", mask.dim(1)?)
        }
        let mask = if mask_rows != b {
            if mask_rows == 0 || !b.is_multiple_of(mask_rows) {
                bail!("cannot repeat prompt mask of {mask_rows} rows to batch {b}")
            }
            mask.repeat((b / mask_rows, 1))?
        } else {
            mask
        };

        let rows = mask.to_dtype(DType::F32)?.to_vec2::<f32>()?;
        let mut index = Vec::new();
        let mut lens = Vec::with_capacity(b);
        for (i, row) in rows.iter().enumerate() {
            let before = index.len();
            index.extend(
                row.iter()
                    .enumerate()
                    .filter(|(_, v)| **v != 0.0)
                    .map(|(j, _)| (i * len + j) as u32),
            );
            lens.push(index.len() - before);
        }
        let total = index.len();
        let index = Tensor::from_vec(index, total, y.device())?;
        Ok((flat.index_select(&index, 0)?.unsqueeze(0)?, lens))
    }

    /// `[B, T]` / `[B, T, H, W]` validity -> `[B, T]` u8 (frame valid if any position is)
    fn frame_mask(mask: &Tensor, batch: usize, frames: usize) -> Result<Tensor> {
        let mask = mask.to_dtype(DType::F32)?;
        let mask = match mask.rank() {
            2 => mask,
            r if r > 2 => mask.flatten_from(2)?.max(2)?,
            r => bail!("attention mask of rank {r}"),
        };
        let (b, t) = mask.dims2()?;
        if b != batch || t != frames {
            bail!("attention mask [{b}, {t}] does not match batch {batch} x {frames} frames")
        }
        mask.gt(0.0)
    }

    fn unpatchify(&self, x: &Tensor, grid: (usize, usize, usize), crop: (usize, usize, usize)) -> Result<Tensor> {
        let (b, _, _) = x.dims3()?;
        let (nt, nh, nw) = grid;
        let [pt, ph, pw] = self.config.patch_size;
        let c = self.config.out_channels();
        let x = x
            .reshape(vec![b, nt, nh, nw, pt, ph, pw, c])?
            .permute(vec![0, 7, 1, 4, 2, 5, 3, 6])?
            .reshape((b, c, nt * pt, nh * ph, nw * pw))?;
        x.narrow(2, 0, crop.0)?
            .narrow(3, 0, crop.1)?
            .narrow(4, 0, crop.2)?
            .contiguous()
    }

    fn resolution_scale(&self, kwargs: &ModelKwargs) -> Result<f64> {
        let first = |t: &Tensor| -> Result<f64> {
            let values = t.flatten_all()?.to_dtype(DType::F64)?.to_vec1::<f64>()?;
            match values.first() {
                Some(v) => Ok(*v),
                None => bail!("empty resolution tensor"),
            }
        };
        match (&kwargs.height, &kwargs.width) {
            (Some(h), Some(w)) => Ok((first(h)? * first(w)?).sqrt() / self.config.input_sq_size as f64),
            _ => Ok(1.0),
        }
    }
}

impl Predictor for Stdit3 {
    fn in_channels(&self) -> usize {
        self.config.in_channels
    }

    fn out_channels(&self) -> usize {
        self.config.out_channels()
    }

    fn shards_sequence(&self) -> bool {
        self.sequence_group.is_some()
    }

    fn forward(&self, hidden_states: &Tensor, timestep: &Tensor, kwargs: &ModelKwargs) -> Result<Tensor> {
        let x = hidden_states.to_dtype(self.dtype)?;
        let device = x.device().clone();
        let (b, _, tx, hx, wx) = x.dims5()?;
        let (frames, h, w) = self.x_embedder.grid_size(tx, hx, wx);
        let spatial = h * w;

        // position embedding
        let base_size = (spatial as f64).sqrt().round() as usize;
        let scale = self.resolution_scale(kwargs)?;
        let pos_emb = self
            .pos_embed
            .forward(h, w, scale, Some(base_size), &device, self.dtype)?;

        // timestep + fps conditioning
        let fps = match &kwargs.fps {
            Some(fps) => fps.to_device(&device)?,
            None => Tensor::new(&[DEFAULT_FPS], &device)?,
        };
        let fps = self.fps_embedder.forward(&fps, b, self.dtype)?;
        let t = (self.t_embedder.forward(timestep, self.dtype)? + &fps)?;
        let t_mlp = self.t_block.forward(&t.silu()?)?;

        let x_mask = match &kwargs.attention_mask {
            Some(mask) => Some(Self::frame_mask(mask, b, frames)?),
            None => None,
        };
        let t0 = match &x_mask {
            Some(_) => {
                let zeros = timestep.zeros_like()?;
                let t0 = (self.t_embedder.forward(&zeros, self.dtype)? + &fps)?;
                let t0_mlp = self.t_block.forward(&t0.silu()?)?;
                Some((t0, t0_mlp))
            }
            None => None,
        };

        // text
        let Some(y) = &kwargs.encoder_hidden_states else {
            bail!("STDiT3 needs encoder_hidden_states")
        };
        let (y, y_lens) = self.encode_text(y, kwargs.encoder_attention_mask.as_ref())?;
        if y_lens.len() != b {
            bail!("{} captions for a batch of {b}", y_lens.len())
        }

        // video tokens
        let hidden = self.config.hidden_size;
        let x = self
            .x_embedder
            .forward(&x)?
            .reshape((b, frames, spatial, hidden))?
            .broadcast_add(&pos_emb.unsqueeze(1)?)?;
        let (x, local_spatial) = match &self.sequence_group {
            Some(group) => {
                if !spatial.is_multiple_of(group.size()) {
                    bail!("{spatial} spatial tokens not divisible by {} ranks", group.size())
                }
                let x = split_forward_gather_backward(&x, group, 2, GradScale::Down)?;
                (x, spatial / group.size())
            }
            None => (x, spatial),
        };
        let mut x = x.reshape((b, frames * local_spatial, hidden))?;
        debug!(
            batch = b,
            frames,
            spatial = local_spatial,
            text_tokens = y.dim(1)?,
            "STDiT3 forward"
        );

        let inputs = BlockInputs {
            y: &y,
            y_lens: &y_lens,
            t: &t_mlp,
            x_mask: x_mask.as_ref(),
            t0: t0.as_ref().map(|(_, t0_mlp)| t0_mlp),
            frames,
            spatial: local_spatial,
        };
        for (spatial_block, temporal_block) in self.spatial_blocks.iter().zip(&self.temporal_blocks) {
            x = spatial_block.forward(&x, &inputs)?;
            x = temporal_block.forward(&x, &inputs)?;
        }

        if let Some(group) = &self.sequence_group {
            let full = x.reshape((b, frames, local_spatial, hidden))?;
            let full = gather_forward_split_backward(&full, group, 2, GradScale::Up)?;
            x = full.reshape((b, frames * spatial, hidden))?;
        }

        let final_mask = match (&x_mask, &t0) {
            (Some(mask), Some((t0, _))) => Some((mask, t0)),
            _ => None,
        };
        let x = self.final_layer.forward(&x, &t, final_mask, frames, spatial)?;
        self.unpatchify(&x, (frames, h, w), (tx, hx, wx))?
            .to_dtype(DType::F32)
    }
}
