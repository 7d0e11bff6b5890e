//! Model components and the collaborator interfaces they plug into
//!
//! - [`Predictor`]: denoising network called by the sampler
//! - [`VideoAutoencoder`] / [`TextEncoder`]: external encoders used by [`sora::SoraModel`]
//! - [`PredictorRegistry`]: model id -> predictor constructor

pub mod sora;
pub mod stdit3;

use crate::config::{ConfigError, PredictorConfig};
use crate::parallel::ParallelContext;
use candle_core::{Result, Tensor};
use candle_nn::VarBuilder;
use std::collections::BTreeMap;

/// Optional conditioning passed through the sampler to the predictor
#[derive(Debug, Clone, Default)]
pub struct ModelKwargs {
    /// Text features, `[B, 1, L, C]`
    pub encoder_hidden_states: Option<Tensor>,
    /// Valid-token mask for `encoder_hidden_states`, `[B, L]` or `[B, 1, L]`
    pub encoder_attention_mask: Option<Tensor>,
    /// Latent validity mask, `[B, T]` or `[B, T, H, W]`
    pub attention_mask: Option<Tensor>,
    /// Pooled output of a second text encoder
    pub pooled_projections: Option<Tensor>,
    /// Inpainting: latents of the masked video, concatenated on channels;
    /// doubled on the batch dim by the caller under guidance
    pub masked_pixel_values: Option<Tensor>,
    /// Inpainting: binary mask latents, concatenated on channels
    pub mask: Option<Tensor>,
    pub fps: Option<Tensor>,
    pub height: Option<Tensor>,
    pub width: Option<Tensor>,
}

impl ModelKwargs {
    pub fn with_text(mut self, hidden_states: Tensor, mask: Option<Tensor>) -> Self {
        self.encoder_hidden_states = Some(hidden_states);
        self.encoder_attention_mask = mask;
        self
    }

    pub fn with_resolution(mut self, fps: Tensor, height: Tensor, width: Tensor) -> Self {
        self.fps = Some(fps);
        self.height = Some(height);
        self.width = Some(width);
        self
    }
}

/// Denoising network: `(x_t, t, conditioning) -> prediction`
///
/// Output is `[B, out_channels, T, H, W]`; `out_channels` is twice
/// `in_channels` when the model also predicts a variance.
pub trait Predictor: Send + Sync {
    fn in_channels(&self) -> usize;

    fn out_channels(&self) -> usize;

    /// True if the predictor splits tokens over the context-parallel group itself
    fn shards_sequence(&self) -> bool {
        false
    }

    fn forward(&self, hidden_states: &Tensor, timestep: &Tensor, kwargs: &ModelKwargs)
    -> Result<Tensor>;
}

/// Video autoencoder collaborator
pub trait VideoAutoencoder: Send + Sync {
    /// `[B, 3, F, H, W]` pixels -> `[B, C, T, H', W']` latents
    fn encode(&self, video: &Tensor) -> Result<Tensor>;
}

/// Text encoder collaborator
pub trait TextEncoder: Send + Sync {
    /// `[N, L]` token ids + mask -> `[N, L, D]` features
    fn encode(&self, input_ids: &Tensor, attention_mask: &Tensor) -> Result<Tensor>;
}

pub type PredictorFactory = fn(
    &PredictorConfig,
    VarBuilder,
    &ParallelContext,
) -> std::result::Result<Box<dyn Predictor>, ConfigError>;

/// Model id -> predictor constructor
#[derive(Debug, Clone)]
pub struct PredictorRegistry {
    factories: BTreeMap<String, PredictorFactory>,
}

impl Default for PredictorRegistry {
    fn default() -> Self {
        let mut registry = Self {
            factories: BTreeMap::new(),
        };
        registry.register("stdit3", stdit3::build_predictor);
        registry
    }
}

impl PredictorRegistry {
    pub fn register(&mut self, id: impl Into<String>, factory: PredictorFactory) {
        self.factories.insert(id.into(), factory);
    }

    pub fn contains(&self, id: &str) -> bool {
        self.factories.contains_key(id)
    }

    pub fn build(
        &self,
        config: &PredictorConfig,
        vb: VarBuilder,
        ctx: &ParallelContext,
    ) -> std::result::Result<Box<dyn Predictor>, ConfigError> {
        let factory = self
            .factories
            .get(&config.model_id)
            .ok_or_else(|| ConfigError::UnknownModelId(config.model_id.clone()))?;
        factory(config, vb, ctx)
    }
}
