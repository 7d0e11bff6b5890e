//! Diffusion process wrapper: forward noising, training loss and the sampling loop

use super::registry::ScheduleRegistry;
use super::schedule::{NoiseSchedule, ScheduleParams, StepOptions};
use super::{DiffusionError, NoiseGenerator, PredictionType};
use crate::config::{DiffusionConfig, parse_device};
use crate::models::{ModelKwargs, Predictor};
use crate::parallel::{ParallelContext, gather, split};
use candle_core::{DType, Device, Tensor};
use std::ops::ControlFlow;
use tracing::{debug, info, warn};

type Result<T> = std::result::Result<T, DiffusionError>;

/// Progress hook: `(step / order, timestep, latents)`; `Break` cancels sampling
pub type StepCallback<'a> = Box<dyn FnMut(usize, f64, &Tensor) -> ControlFlow<()> + 'a>;

/// Output of [`DiffusionScheduler::q_sample`]
#[derive(Debug, Clone)]
pub struct QSample {
    pub x_t: Tensor,
    pub noise: Tensor,
    pub timesteps: Tensor,
}

pub struct SampleOptions<'a> {
    /// Starting latents; drawn from the noise generator when absent
    pub latents: Option<Tensor>,
    pub callback: Option<StepCallback<'a>>,
    pub callback_steps: usize,
    pub step: StepOptions,
}

impl Default for SampleOptions<'_> {
    fn default() -> Self {
        Self {
            latents: None,
            callback: None,
            callback_steps: 1,
            step: StepOptions::default(),
        }
    }
}

impl<'a> SampleOptions<'a> {
    pub fn with_latents(mut self, latents: Tensor) -> Self {
        self.latents = Some(latents);
        self
    }

    pub fn with_callback(
        mut self,
        callback_steps: usize,
        callback: impl FnMut(usize, f64, &Tensor) -> ControlFlow<()> + 'a,
    ) -> Self {
        self.callback = Some(Box::new(callback));
        self.callback_steps = callback_steps;
        self
    }

    pub fn with_eta(mut self, eta: f64) -> Self {
        self.step.eta = eta;
        self
    }
}

/// A named noise schedule plus the training / sampling procedures around it
pub struct DiffusionScheduler {
    model_id: String,
    schedule: Box<dyn NoiseSchedule>,
    prediction_type: PredictionType,
    num_train_steps: usize,
    num_inference_steps: Option<usize>,
    num_warmup_steps: usize,
    guidance_scale: f64,
    noise_offset: f64,
    snr_gamma: Option<f64>,
    device: Device,
    rng: NoiseGenerator,
}

impl std::fmt::Debug for DiffusionScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiffusionScheduler")
            .field("model_id", &self.model_id)
            .field("prediction_type", &self.prediction_type)
            .field("num_inference_steps", &self.num_inference_steps)
            .field("guidance_scale", &self.guidance_scale)
            .finish()
    }
}

impl DiffusionScheduler {
    pub fn new(config: &DiffusionConfig) -> Result<Self> {
        Self::with_registry(config, &ScheduleRegistry::default())
    }

    pub fn with_registry(config: &DiffusionConfig, registry: &ScheduleRegistry) -> Result<Self> {
        let params = ScheduleParams::from_config(config)?;
        let prediction_type = params.prediction_type;
        let mut schedule = registry.build(&config.model_id, params)?;
        let device = parse_device(&config.device)?;

        let order = schedule.order();
        if !(1..=2).contains(&order) {
            warn!(
                model_id = config.model_id.as_str(),
                order, "unusual schedule order; callback cadence assumes 1 or 2"
            );
        }

        let num_warmup_steps = match config.num_inference_steps {
            Some(n) => {
                schedule.set_timesteps(n)?;
                schedule.timesteps().len().saturating_sub(n * order)
            }
            None => 0,
        };

        info!(
            model_id = config.model_id.as_str(),
            prediction_type = ?prediction_type,
            num_train_steps = config.num_train_steps,
            "diffusion scheduler ready"
        );

        Ok(Self {
            model_id: config.model_id.clone(),
            schedule,
            prediction_type,
            num_train_steps: config.num_train_steps,
            num_inference_steps: config.num_inference_steps,
            num_warmup_steps,
            guidance_scale: config.guidance_scale,
            noise_offset: config.noise_offset,
            snr_gamma: config.snr_gamma,
            device,
            rng: NoiseGenerator::new(config.seed),
        })
    }

    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    pub fn schedule(&self) -> &dyn NoiseSchedule {
        self.schedule.as_ref()
    }

    pub fn prediction_type(&self) -> PredictionType {
        self.prediction_type
    }

    pub fn guidance_scale(&self) -> f64 {
        self.guidance_scale
    }

    pub fn do_classifier_free_guidance(&self) -> bool {
        self.guidance_scale > 1.0
    }

    pub fn num_warmup_steps(&self) -> usize {
        self.num_warmup_steps
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn set_num_inference_steps(&mut self, n: usize) {
        self.num_inference_steps = Some(n);
    }

    pub fn set_guidance_scale(&mut self, guidance_scale: f64) {
        self.guidance_scale = guidance_scale;
    }

    /// `a_t / (1 - a_t)` per sample
    pub fn compute_snr(&self, timesteps: &Tensor) -> Result<Tensor> {
        Ok(self.schedule.alphas().snr(timesteps)?)
    }

    // =========================================================================
    // Training
    // =========================================================================

    /// Forward-noise `x_start` to timesteps `t`
    ///
    /// Missing noise is drawn from the generator, missing timesteps uniformly
    /// from `[0, num_train_steps)`. A nonzero noise offset adds a per
    /// (sample, channel) constant to the noise.
    pub fn q_sample(
        &mut self,
        x_start: &Tensor,
        t: Option<&Tensor>,
        noise: Option<&Tensor>,
    ) -> Result<QSample> {
        let mut noise = match noise {
            Some(noise) => {
                if noise.dims() != x_start.dims() {
                    return Err(DiffusionError::ShapeMismatch {
                        lhs: noise.dims().to_vec(),
                        rhs: x_start.dims().to_vec(),
                    });
                }
                noise.clone()
            }
            None => self.rng.randn_like(x_start)?,
        };

        if self.noise_offset != 0.0 {
            let dims = x_start.dims();
            let mut offset_shape = dims[..2.min(dims.len())].to_vec();
            offset_shape.resize(dims.len(), 1);
            let offset = self
                .rng
                .randn(offset_shape, x_start.dtype(), x_start.device())?;
            noise = noise.broadcast_add(&(offset * self.noise_offset)?)?;
        }

        let batch = x_start.dim(0)?;
        let timesteps = match t {
            Some(t) => {
                if t.elem_count() != batch {
                    return Err(DiffusionError::ShapeMismatch {
                        lhs: t.dims().to_vec(),
                        rhs: vec![batch],
                    });
                }
                t.clone()
            }
            None => self
                .rng
                .randint(0, self.num_train_steps as u32, batch, x_start.device())?,
        };

        let x_t = self.schedule.add_noise(x_start, &noise, &timesteps)?;
        Ok(QSample {
            x_t,
            noise,
            timesteps,
        })
    }

    /// Masked, optionally SNR-weighted mean squared error
    ///
    /// `mask` is `[B, T]` or `[B, T, H, W]` and is broadcast over channels.
    pub fn training_losses(
        &self,
        model_output: &Tensor,
        x_start: &Tensor,
        noise: &Tensor,
        mask: Option<&Tensor>,
        t: &Tensor,
    ) -> Result<Tensor> {
        let (target, model_output) = match self.prediction_type {
            PredictionType::Epsilon => (noise.clone(), model_output.clone()),
            PredictionType::VPrediction => (
                self.schedule.get_velocity(x_start, noise, t)?,
                model_output.clone(),
            ),
            PredictionType::Sample => (x_start.clone(), (model_output - noise)?),
        };
        if model_output.dims() != target.dims() {
            return Err(DiffusionError::ShapeMismatch {
                lhs: model_output.dims().to_vec(),
                rhs: target.dims().to_vec(),
            });
        }

        let batch = target.dim(0)?;
        let loss = (model_output.to_dtype(DType::F32)? - target.to_dtype(DType::F32)?)?
            .sqr()?
            .reshape((batch, ()))?;

        let loss = match self.snr_weights(t)? {
            Some(weights) => loss.broadcast_mul(&weights.reshape((batch, 1))?)?,
            None => loss,
        };

        let reduced = match mask {
            Some(mask) => {
                let mask = broadcast_mask(mask, &target)?.reshape((batch, ()))?;
                ((loss * &mask)?.sum_all()? / mask.sum_all()?.to_scalar::<f32>()? as f64)?
            }
            None => loss.mean_all()?,
        };
        Ok(reduced)
    }

    fn snr_weights(&self, t: &Tensor) -> Result<Option<Tensor>> {
        let Some(gamma) = self.snr_gamma else {
            return Ok(None);
        };
        let snr = self.compute_snr(t)?;
        let weights = snr.minimum(gamma)?;
        let weights = match self.prediction_type {
            PredictionType::Epsilon => (weights / &snr)?,
            PredictionType::VPrediction => (weights / (snr + 1.0)?)?,
            PredictionType::Sample => weights,
        };
        Ok(Some(weights))
    }

    // =========================================================================
    // Sampling
    // =========================================================================

    /// Run the reverse process from noise to clean latents of `shape`
    pub fn sample(
        &mut self,
        predictor: &dyn Predictor,
        shape: &[usize],
        kwargs: ModelKwargs,
        ctx: &ParallelContext,
        options: SampleOptions<'_>,
    ) -> Result<Tensor> {
        if shape.len() < 4 {
            return Err(DiffusionError::InvalidShape(shape.to_vec()));
        }
        let num_inference_steps = self
            .num_inference_steps
            .ok_or(DiffusionError::InferenceStepsNotSet)?;
        let SampleOptions {
            latents,
            mut callback,
            callback_steps,
            step: step_options,
        } = options;

        let mut latents = match latents {
            Some(latents) => latents,
            None => (self.rng.randn(shape, DType::F32, &self.device)?
                * self.schedule.init_noise_sigma())?,
        };

        self.schedule.set_timesteps(num_inference_steps)?;
        let timesteps = self.schedule.timesteps().to_vec();
        let order = self.schedule.order().max(1);
        self.num_warmup_steps = timesteps
            .len()
            .saturating_sub(num_inference_steps * order);
        let do_cfg = self.do_classifier_free_guidance();

        let mut kwargs = kwargs;
        let mut mask_dims = latents.dims().to_vec();
        mask_dims.remove(1);
        let video_mask = Tensor::ones(mask_dims, latents.dtype(), latents.device())?;
        if do_cfg {
            kwargs.attention_mask = Some(Tensor::cat(&[&video_mask, &video_mask], 0)?);
        } else if kwargs.attention_mask.is_none() {
            kwargs.attention_mask = Some(video_mask);
        }

        let shard = ctx.context.is_distributed() && !predictor.shards_sequence();
        if shard {
            latents = split(&latents, &ctx.context, 2)?;
            if let Some(states) = kwargs.encoder_hidden_states.take() {
                kwargs.encoder_hidden_states = Some(split(&states, &ctx.context, 2)?);
            }
            if let Some(mask) = kwargs.attention_mask.take() {
                kwargs.attention_mask = Some(split(&mask, &ctx.context, 1)?);
            }
            if let Some(masked) = kwargs.masked_pixel_values.take() {
                kwargs.masked_pixel_values = Some(split(&masked, &ctx.context, 2)?);
            }
            if let Some(mask) = kwargs.mask.take() {
                kwargs.mask = Some(split(&mask, &ctx.context, 2)?);
            }
        }

        // inpainting conditioning arrives already doubled for guidance, like the text states
        let inpaint = match (&kwargs.masked_pixel_values, &kwargs.mask) {
            (Some(masked), Some(mask)) => Some((masked.clone(), mask.clone())),
            _ => None,
        };
        let latent_channels = latents.dim(1)?;
        let last = timesteps.len().saturating_sub(1);
        let callback_steps = callback_steps.max(1);

        for (i, &t) in timesteps.iter().enumerate() {
            let model_input = if do_cfg {
                Tensor::cat(&[&latents, &latents], 0)?
            } else {
                latents.clone()
            };
            let mut model_input = self.schedule.scale_model_input(&model_input, t)?;
            if let Some((masked, mask)) = &inpaint {
                model_input = Tensor::cat(&[&model_input, masked, mask], 1)?;
            }
            let timestep = Tensor::full(t as f32, (model_input.dim(0)?,), model_input.device())?;

            let mut noise_pred = predictor
                .forward(&model_input, &timestep, &kwargs)?
                .to_dtype(latents.dtype())?;

            if do_cfg {
                let chunks = noise_pred.chunk(2, 0)?;
                let (uncond, cond) = (&chunks[0], &chunks[1]);
                noise_pred = (uncond + ((cond - uncond)? * self.guidance_scale)?)?;
            }
            if noise_pred.dim(1)? == latent_channels * 2 {
                noise_pred = noise_pred.narrow(1, 0, latent_channels)?;
            }

            latents = self
                .schedule
                .step(&noise_pred, t, &latents, &step_options, &mut self.rng)?
                .prev_sample;

            if i == last || ((i + 1) > self.num_warmup_steps && (i + 1) % order == 0) {
                debug!(step = i, timestep = t, "denoising step");
                if let Some(callback) = callback.as_mut()
                    && i % callback_steps == 0
                    && callback(i / order, t, &latents).is_break()
                {
                    return Err(DiffusionError::Interrupted { step: i });
                }
            }
        }

        if shard {
            latents = gather(&latents, &ctx.context, 2)?;
        }
        Ok(latents)
    }
}

/// `[B, T]` or `[B, T, H, W]` validity mask broadcast to `like` (`[B, C, T, ...]`)
fn broadcast_mask(mask: &Tensor, like: &Tensor) -> Result<Tensor> {
    let mask = mask.to_dtype(DType::F32)?;
    let mut dims = mask.dims().to_vec();
    dims.insert(1, 1);
    dims.resize(like.rank(), 1);
    Ok(mask.reshape(dims)?.broadcast_as(like.shape())?.contiguous()?)
}
