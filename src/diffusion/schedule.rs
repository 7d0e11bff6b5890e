//! Noise schedule interface and the beta / alpha tables shared by every sampler

use super::{DiffusionError, NoiseGenerator, PredictionType};
use crate::config::DiffusionConfig;
use candle_core::{DType, Result, Tensor};
use std::str::FromStr;

// =============================================================================
// Parameters
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BetaSchedule {
    Linear,
    ScaledLinear,
    SquaredCosCapV2,
}

impl FromStr for BetaSchedule {
    type Err = DiffusionError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "linear" => Ok(BetaSchedule::Linear),
            "scaled_linear" => Ok(BetaSchedule::ScaledLinear),
            "squaredcos_cap_v2" => Ok(BetaSchedule::SquaredCosCapV2),
            other => Err(DiffusionError::UnknownBetaSchedule(other.to_string())),
        }
    }
}

/// How inference timesteps are placed over the training range
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimestepSpacing {
    Leading,
    Trailing,
    Linspace,
}

impl FromStr for TimestepSpacing {
    type Err = DiffusionError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "leading" => Ok(TimestepSpacing::Leading),
            "trailing" => Ok(TimestepSpacing::Trailing),
            "linspace" => Ok(TimestepSpacing::Linspace),
            other => Err(DiffusionError::UnknownTimestepSpacing(other.to_string())),
        }
    }
}

/// Validated schedule parameters handed to schedule factories
#[derive(Debug, Clone)]
pub struct ScheduleParams {
    pub num_train_steps: usize,
    pub beta_start: f64,
    pub beta_end: f64,
    pub beta_schedule: BetaSchedule,
    pub prediction_type: PredictionType,
    pub rescale_betas_zero_snr: bool,
    pub timestep_spacing: TimestepSpacing,
    pub steps_offset: usize,
    /// Clamp predicted x0 to `[-range, range]`
    pub clip_sample: Option<f64>,
}

impl Default for ScheduleParams {
    fn default() -> Self {
        Self {
            num_train_steps: 1000,
            beta_start: 0.0001,
            beta_end: 0.02,
            beta_schedule: BetaSchedule::Linear,
            prediction_type: PredictionType::Epsilon,
            rescale_betas_zero_snr: false,
            timestep_spacing: TimestepSpacing::Leading,
            steps_offset: 0,
            clip_sample: None,
        }
    }
}

impl ScheduleParams {
    pub fn from_config(config: &DiffusionConfig) -> std::result::Result<Self, DiffusionError> {
        let timestep_spacing = match &config.timestep_spacing {
            Some(spacing) => spacing.parse()?,
            None if config.rescale_betas_zero_snr => TimestepSpacing::Trailing,
            None => TimestepSpacing::Leading,
        };
        Ok(Self {
            num_train_steps: config.num_train_steps,
            beta_start: config.beta_start,
            beta_end: config.beta_end,
            beta_schedule: config.beta_schedule.parse()?,
            prediction_type: config.prediction_type.parse()?,
            rescale_betas_zero_snr: config.rescale_betas_zero_snr,
            timestep_spacing,
            steps_offset: config.steps_offset,
            clip_sample: config.clip_sample.then_some(config.clip_sample_range),
        })
    }
}

// =============================================================================
// Alpha tables
// =============================================================================

/// Betas and cumulative alpha products over the training range
#[derive(Debug, Clone)]
pub struct AlphaSchedule {
    betas: Vec<f64>,
    alphas_cumprod: Vec<f64>,
}

impl AlphaSchedule {
    pub fn new(params: &ScheduleParams) -> Self {
        let n = params.num_train_steps;
        let mut betas = match params.beta_schedule {
            BetaSchedule::Linear => linspace(params.beta_start, params.beta_end, n),
            BetaSchedule::ScaledLinear => {
                linspace(params.beta_start.sqrt(), params.beta_end.sqrt(), n)
                    .into_iter()
                    .map(|b| b * b)
                    .collect()
            }
            BetaSchedule::SquaredCosCapV2 => cosine_betas(n, 0.999),
        };
        if params.rescale_betas_zero_snr {
            betas = rescale_zero_terminal_snr(&betas);
        }
        let alphas_cumprod = cumprod_alphas(&betas);
        Self {
            betas,
            alphas_cumprod,
        }
    }

    pub fn betas(&self) -> &[f64] {
        &self.betas
    }

    pub fn alphas_cumprod(&self) -> &[f64] {
        &self.alphas_cumprod
    }

    pub fn num_train_steps(&self) -> usize {
        self.alphas_cumprod.len()
    }

    /// Cumulative alpha at integer timestep `t`, clamped to the table
    pub fn alpha_cumprod(&self, t: usize) -> f64 {
        let last = self.alphas_cumprod.len().saturating_sub(1);
        self.alphas_cumprod[t.min(last)]
    }

    /// Noise level table `sqrt((1 - a) / a)` used by the sigma-space samplers
    pub fn sigmas(&self) -> Vec<f64> {
        self.alphas_cumprod
            .iter()
            // A zero-SNR terminal step would otherwise give an infinite sigma
            .map(|&a| a.max(2f64.powi(-24)))
            .map(|a| ((1.0 - a) / a).sqrt())
            .collect()
    }

    /// Per-sample coefficient tensor shaped `[B, 1, 1, ...]` to broadcast over `like`
    fn coefficients(&self, t: &Tensor, like: &Tensor, f: impl Fn(f64) -> f64) -> Result<Tensor> {
        let steps = timestep_indices(t)?;
        let values: Vec<f64> = steps.iter().map(|&s| f(self.alpha_cumprod(s))).collect();
        let mut shape = vec![values.len()];
        shape.extend(std::iter::repeat_n(1, like.rank().saturating_sub(1)));
        Tensor::from_vec(values, shape, like.device())?.to_dtype(like.dtype())
    }

    /// `sqrt(a_t) * x + sqrt(1 - a_t) * noise`
    pub fn add_noise(&self, x: &Tensor, noise: &Tensor, t: &Tensor) -> Result<Tensor> {
        let sqrt_alpha = self.coefficients(t, x, f64::sqrt)?;
        let sqrt_one_minus = self.coefficients(t, x, |a| (1.0 - a).sqrt())?;
        x.broadcast_mul(&sqrt_alpha)?
            .add(&noise.broadcast_mul(&sqrt_one_minus)?)
    }

    /// `sqrt(a_t) * noise - sqrt(1 - a_t) * x`
    pub fn get_velocity(&self, x: &Tensor, noise: &Tensor, t: &Tensor) -> Result<Tensor> {
        let sqrt_alpha = self.coefficients(t, x, f64::sqrt)?;
        let sqrt_one_minus = self.coefficients(t, x, |a| (1.0 - a).sqrt())?;
        noise
            .broadcast_mul(&sqrt_alpha)?
            .sub(&x.broadcast_mul(&sqrt_one_minus)?)
    }

    /// Signal-to-noise ratio `a_t / (1 - a_t)` per sample, as f32 `[B]`
    pub fn snr(&self, t: &Tensor) -> Result<Tensor> {
        let values: Vec<f32> = timestep_indices(t)?
            .into_iter()
            .map(|s| {
                let a = self.alpha_cumprod(s);
                (a / (1.0 - a)) as f32
            })
            .collect();
        let n = values.len();
        Tensor::from_vec(values, n, t.device())
    }
}

/// Integer timesteps from a `[B]` tensor of any numeric dtype
pub fn timestep_indices(t: &Tensor) -> Result<Vec<usize>> {
    let t = t.flatten_all()?.to_dtype(DType::F64)?.to_vec1::<f64>()?;
    Ok(t.into_iter().map(|v| v.round().max(0.0) as usize).collect())
}

fn linspace(start: f64, end: f64, n: usize) -> Vec<f64> {
    if n == 1 {
        return vec![start];
    }
    (0..n)
        .map(|i| start + (end - start) * i as f64 / (n - 1) as f64)
        .collect()
}

fn cosine_betas(n: usize, max_beta: f64) -> Vec<f64> {
    let alpha_bar = |t: f64| ((t + 0.008) / 1.008 * std::f64::consts::FRAC_PI_2).cos().powi(2);
    (0..n)
        .map(|i| {
            let t1 = i as f64 / n as f64;
            let t2 = (i + 1) as f64 / n as f64;
            (1.0 - alpha_bar(t2) / alpha_bar(t1)).min(max_beta)
        })
        .collect()
}

fn cumprod_alphas(betas: &[f64]) -> Vec<f64> {
    let mut acc = 1.0;
    betas
        .iter()
        .map(|b| {
            acc *= 1.0 - b;
            acc
        })
        .collect()
}

/// Shift and scale `sqrt(alphas_cumprod)` so the last step has zero SNR
pub fn rescale_zero_terminal_snr(betas: &[f64]) -> Vec<f64> {
    let sqrt_ac: Vec<f64> = cumprod_alphas(betas).iter().map(|a| a.sqrt()).collect();
    let (Some(&first), Some(&last)) = (sqrt_ac.first(), sqrt_ac.last()) else {
        return betas.to_vec();
    };
    let alphas_bar: Vec<f64> = sqrt_ac
        .iter()
        .map(|s| ((s - last) * first / (first - last)).powi(2))
        .collect();
    let mut out = Vec::with_capacity(alphas_bar.len());
    out.push(1.0 - alphas_bar[0]);
    for w in alphas_bar.windows(2) {
        out.push(1.0 - w[1] / w[0]);
    }
    out
}

/// Descending inference timesteps over `[0, num_train_steps)`
pub fn spaced_timesteps(
    spacing: TimestepSpacing,
    num_train_steps: usize,
    num_inference_steps: usize,
    steps_offset: usize,
) -> Vec<f64> {
    let n = num_inference_steps;
    match spacing {
        TimestepSpacing::Leading => {
            let ratio = num_train_steps / n;
            (0..n)
                .rev()
                .map(|i| (i * ratio + steps_offset) as f64)
                .collect()
        }
        TimestepSpacing::Trailing => {
            let ratio = num_train_steps as f64 / n as f64;
            (0..n)
                .map(|i| (num_train_steps as f64 - i as f64 * ratio).round() - 1.0)
                .collect()
        }
        TimestepSpacing::Linspace => linspace(0.0, (num_train_steps - 1) as f64, n)
            .into_iter()
            .rev()
            .map(f64::round)
            .collect(),
    }
}

pub(crate) fn validate_inference_steps(
    num_inference_steps: usize,
    num_train_steps: usize,
) -> Result<()> {
    if num_inference_steps == 0 || num_inference_steps > num_train_steps {
        candle_core::bail!(
            "num_inference_steps must be in 1..={num_train_steps}, got {num_inference_steps}"
        )
    }
    Ok(())
}

/// Piecewise-linear lookup of `table` at fractional index `x`
pub(crate) fn interp(x: f64, table: &[f64]) -> f64 {
    if table.is_empty() {
        return 0.0;
    }
    let last = table.len() - 1;
    if x <= 0.0 {
        return table[0];
    }
    if x >= last as f64 {
        return table[last];
    }
    let lo = x.floor() as usize;
    let frac = x - lo as f64;
    table[lo] * (1.0 - frac) + table[lo + 1] * frac
}

/// Position of `timestep` in `timesteps`
pub(crate) fn index_for_timestep(timesteps: &[f64], timestep: f64) -> Result<usize> {
    timesteps
        .iter()
        .position(|&t| (t - timestep).abs() < 1e-6)
        .ok_or_else(|| candle_core::Error::Msg(format!("timestep {timestep} not in schedule")))
}

/// Convert a model output to the predicted clean sample at cumulative alpha `a`
pub(crate) fn predict_original(
    prediction_type: PredictionType,
    model_output: &Tensor,
    sample: &Tensor,
    a: f64,
) -> Result<Tensor> {
    let b = 1.0 - a;
    match prediction_type {
        PredictionType::Epsilon => (sample - (model_output * b.sqrt())?)? / a.sqrt(),
        PredictionType::Sample => Ok(model_output.clone()),
        PredictionType::VPrediction => (sample * a.sqrt())? - (model_output * b.sqrt())?,
    }
}

// =============================================================================
// Schedule interface
// =============================================================================

/// Per-call sampler options
#[derive(Debug, Clone, Copy, Default)]
pub struct StepOptions {
    /// DDIM stochasticity; 0 is deterministic
    pub eta: f64,
}

#[derive(Debug, Clone)]
pub struct StepOutput {
    pub prev_sample: Tensor,
    pub pred_original_sample: Option<Tensor>,
}

/// Explicit interface every named noise schedule provides
pub trait NoiseSchedule: Send + std::fmt::Debug {
    fn name(&self) -> &'static str;

    fn alphas(&self) -> &AlphaSchedule;

    fn prediction_type(&self) -> PredictionType;

    /// Model evaluations consumed per logical step
    fn order(&self) -> usize {
        1
    }

    /// Standard deviation of the initial latent noise
    fn init_noise_sigma(&self) -> f64 {
        1.0
    }

    /// Regenerate the descending inference timesteps and reset sampler state
    fn set_timesteps(&mut self, num_inference_steps: usize) -> Result<()>;

    fn timesteps(&self) -> &[f64];

    fn scale_model_input(&self, sample: &Tensor, _timestep: f64) -> Result<Tensor> {
        Ok(sample.clone())
    }

    fn step(
        &mut self,
        model_output: &Tensor,
        timestep: f64,
        sample: &Tensor,
        options: &StepOptions,
        rng: &mut NoiseGenerator,
    ) -> Result<StepOutput>;

    fn add_noise(&self, x: &Tensor, noise: &Tensor, t: &Tensor) -> Result<Tensor> {
        self.alphas().add_noise(x, noise, t)
    }

    fn get_velocity(&self, x: &Tensor, noise: &Tensor, t: &Tensor) -> Result<Tensor> {
        self.alphas().get_velocity(x, noise, t)
    }
}
