//! Assembled text-to-video model: encoders, predictor and diffusion process
//!
//! Training runs `forward` (encode -> noise -> predict) then `compute_loss`;
//! inference calls [`SoraModel::sample`]. Either encoder stage is skipped when
//! the batch already carries pre-computed features.

use super::{
    ModelKwargs, Predictor, PredictorRegistry, TextEncoder, VideoAutoencoder,
};
use crate::config::{ConfigError, SoraConfig, parse_device, parse_dtype};
use crate::diffusion::{DiffusionError, DiffusionScheduler, SampleOptions};
use crate::loader::{CheckpointLoader, LoadReport, LoaderError, save_checkpoint};
use crate::parallel::ParallelContext;
use candle_core::{D, DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};
use std::path::Path;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum SoraError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Diffusion(#[from] DiffusionError),

    #[error(transparent)]
    Loader(#[from] LoaderError),

    #[error("Unsupported weight dtype: {0}")]
    UnsupportedDtype(String),

    #[error(transparent)]
    Candle(#[from] candle_core::Error),
}

pub type Result<T> = std::result::Result<T, SoraError>;

/// External encoders; each may be absent when the matching features are pre-computed
#[derive(Default)]
pub struct SoraComponents {
    pub ae: Option<Box<dyn VideoAutoencoder>>,
    pub text_encoder: Option<Box<dyn TextEncoder>>,
    pub text_encoder_2: Option<Box<dyn TextEncoder>>,
}

/// One training batch
#[derive(Debug, Clone)]
pub struct SoraBatch {
    /// Pixels `[B, 3, F, H, W]`, or latents `[B, C, T, H, W]` with `load_video_features`
    pub video: Tensor,
    /// Frame validity `[B, T]` or `[B, T, H, W]`
    pub video_mask: Option<Tensor>,
    /// Token ids `[B, N, L]`, or text features `[B, N, L, D]` with `load_text_features`
    pub prompt_ids: Tensor,
    pub prompt_mask: Option<Tensor>,
    pub prompt_ids_2: Option<Tensor>,
    pub prompt_mask_2: Option<Tensor>,
    /// Extra conditioning forwarded to the predictor (fps, resolution, inpainting)
    pub kwargs: ModelKwargs,
}

impl SoraBatch {
    pub fn new(video: Tensor, prompt_ids: Tensor) -> Self {
        Self {
            video,
            video_mask: None,
            prompt_ids,
            prompt_mask: None,
            prompt_ids_2: None,
            prompt_mask_2: None,
            kwargs: ModelKwargs::default(),
        }
    }

    pub fn with_video_mask(mut self, mask: Tensor) -> Self {
        self.video_mask = Some(mask);
        self
    }

    pub fn with_prompt_mask(mut self, mask: Tensor) -> Self {
        self.prompt_mask = Some(mask);
        self
    }

    pub fn with_second_prompt(mut self, ids: Tensor, mask: Tensor) -> Self {
        self.prompt_ids_2 = Some(ids);
        self.prompt_mask_2 = Some(mask);
        self
    }
}

/// Everything `compute_loss` needs from a forward pass
#[derive(Debug, Clone)]
pub struct SoraForwardOutput {
    pub model_output: Tensor,
    pub latents: Tensor,
    pub noised_latents: Tensor,
    pub timesteps: Tensor,
    pub noise: Tensor,
    pub video_mask: Option<Tensor>,
}

pub struct SoraModel {
    config: SoraConfig,
    weight_dtype: DType,
    device: Device,
    components: SoraComponents,
    predictor: Box<dyn Predictor>,
    varmap: VarMap,
    diffusion: DiffusionScheduler,
    ctx: ParallelContext,
}

impl SoraModel {
    pub fn new(config: SoraConfig, components: SoraComponents, ctx: ParallelContext) -> Result<Self> {
        Self::with_registry(config, components, ctx, &PredictorRegistry::default())
    }

    pub fn with_registry(
        config: SoraConfig,
        components: SoraComponents,
        ctx: ParallelContext,
        registry: &PredictorRegistry,
    ) -> Result<Self> {
        if !config.load_video_features && components.ae.is_none() {
            return Err(ConfigError::MissingComponent("ae").into());
        }
        if !config.load_text_features && components.text_encoder.is_none() {
            return Err(ConfigError::MissingComponent("text_encoder").into());
        }
        let weight_dtype = parse_dtype(&config.weight_dtype)
            .ok_or_else(|| SoraError::UnsupportedDtype(config.weight_dtype.clone()))?;
        let device = parse_device(&config.diffusion.device)?;

        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, weight_dtype, &device);
        let predictor = registry.build(&config.predictor, vb, &ctx)?;
        let diffusion = DiffusionScheduler::new(&config.diffusion)?;

        info!(
            predictor = config.predictor.model_id.as_str(),
            schedule = config.diffusion.model_id.as_str(),
            weight_dtype = ?weight_dtype,
            load_video_features = config.load_video_features,
            load_text_features = config.load_text_features,
            "SoRA model assembled"
        );
        Ok(Self {
            config,
            weight_dtype,
            device,
            components,
            predictor,
            varmap,
            diffusion,
            ctx,
        })
    }

    pub fn config(&self) -> &SoraConfig {
        &self.config
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn predictor(&self) -> &dyn Predictor {
        self.predictor.as_ref()
    }

    pub fn diffusion(&self) -> &DiffusionScheduler {
        &self.diffusion
    }

    pub fn diffusion_mut(&mut self) -> &mut DiffusionScheduler {
        &mut self.diffusion
    }

    /// Trainable predictor parameters
    pub fn varmap(&self) -> &VarMap {
        &self.varmap
    }

    fn encode_video(&self, video: &Tensor) -> Result<Tensor> {
        if self.config.load_video_features {
            return Ok(video.clone());
        }
        match &self.components.ae {
            Some(ae) => Ok(ae.encode(video)?),
            None => Err(ConfigError::MissingComponent("ae").into()),
        }
    }

    /// `[B, N, L]` ids -> `[B, N, L, D]` features and a `[B, N, L]` mask
    fn encode_prompt(
        &self,
        encoder: &dyn TextEncoder,
        ids: &Tensor,
        mask: Option<&Tensor>,
    ) -> Result<(Tensor, Tensor)> {
        let (b, n, l) = ids.dims3()?;
        let flat_ids = ids.reshape((b * n, l))?;
        let flat_mask = match mask {
            Some(mask) => mask.reshape((b * n, l))?,
            None => Tensor::ones((b * n, l), DType::U8, ids.device())?,
        };
        let hidden = encoder.encode(&flat_ids, &flat_mask)?;
        let d = hidden.dim(D::Minus1)?;
        let hidden = hidden.reshape((b, n, l, d))?.to_dtype(self.weight_dtype)?;
        Ok((hidden, flat_mask.reshape((b, n, l))?))
    }

    /// Encode, noise and predict one batch
    pub fn forward(&mut self, batch: SoraBatch) -> Result<SoraForwardOutput> {
        let latents = self.encode_video(&batch.video)?.to_dtype(self.weight_dtype)?;

        let (prompt, prompt_mask, pooled) = if self.config.load_text_features {
            (batch.prompt_ids, batch.prompt_mask, batch.prompt_ids_2)
        } else {
            let Some(encoder) = self.components.text_encoder.as_deref() else {
                return Err(ConfigError::MissingComponent("text_encoder").into());
            };
            let (prompt, mask) = self.encode_prompt(encoder, &batch.prompt_ids, batch.prompt_mask.as_ref())?;
            let pooled = match (self.components.text_encoder_2.as_deref(), &batch.prompt_ids_2) {
                (Some(encoder_2), Some(ids_2)) => {
                    let (hidden, _) =
                        self.encode_prompt(encoder_2, ids_2, batch.prompt_mask_2.as_ref())?;
                    let (b, n, _, _) = hidden.dims4()?;
                    Some(hidden.reshape((b, n, ()))?)
                }
                _ => None,
            };
            (prompt, Some(mask), pooled)
        };

        let sample = self.diffusion.q_sample(&latents, None, None)?;
        debug!(
            latents = ?latents.dims(),
            prompt = ?prompt.dims(),
            "SoRA forward"
        );

        let mut kwargs = batch.kwargs;
        kwargs.encoder_hidden_states = Some(prompt);
        kwargs.encoder_attention_mask = prompt_mask;
        kwargs.attention_mask = batch.video_mask.clone();
        kwargs.pooled_projections = pooled;
        let model_output = self
            .predictor
            .forward(&sample.x_t, &sample.timesteps, &kwargs)?;

        Ok(SoraForwardOutput {
            model_output,
            latents,
            noised_latents: sample.x_t,
            timesteps: sample.timesteps,
            noise: sample.noise,
            video_mask: batch.video_mask,
        })
    }

    /// Diffusion loss for a forward pass; a learned-variance half of the output is ignored
    pub fn compute_loss(&self, output: &SoraForwardOutput) -> Result<Tensor> {
        let channels = output.latents.dim(1)?;
        let model_output = if output.model_output.dim(1)? == channels * 2 {
            output.model_output.narrow(1, 0, channels)?
        } else {
            output.model_output.clone()
        };
        Ok(self.diffusion.training_losses(
            &model_output,
            &output.latents,
            &output.noise,
            output.video_mask.as_ref(),
            &output.timesteps,
        )?)
    }

    /// Generate latents of `shape` with the configured number of inference steps
    pub fn sample(
        &mut self,
        shape: &[usize],
        kwargs: ModelKwargs,
        options: SampleOptions<'_>,
    ) -> Result<Tensor> {
        Ok(self
            .diffusion
            .sample(self.predictor.as_ref(), shape, kwargs, &self.ctx, options)?)
    }

    /// Reconcile a checkpoint into the predictor parameters
    pub fn load_checkpoint(&self, path: impl AsRef<Path>, loader: &CheckpointLoader) -> Result<LoadReport> {
        let report = loader.load(path, &self.varmap)?;
        if !report.mismatched.is_empty() {
            warn!(
                count = report.mismatched.len(),
                "checkpoint entries skipped for element-count mismatch: {:?}", report.mismatched
            );
        }
        Ok(report)
    }

    /// Write the predictor parameters as safetensors
    pub fn save_checkpoint(&self, path: impl AsRef<Path>) -> Result<()> {
        save_checkpoint(path, &self.varmap)?;
        Ok(())
    }
}
