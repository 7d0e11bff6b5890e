//! Euler and Euler-ancestral samplers in sigma space

use super::schedule::{
    AlphaSchedule, NoiseSchedule, ScheduleParams, StepOptions, StepOutput, TimestepSpacing,
    index_for_timestep, interp, spaced_timesteps, validate_inference_steps,
};
use super::{NoiseGenerator, PredictionType};
use candle_core::{Result, Tensor};

/// Inference timesteps with their interpolated noise levels (plus a trailing 0)
#[derive(Debug, Clone)]
pub(crate) struct SigmaTable {
    pub timesteps: Vec<f64>,
    pub sigmas: Vec<f64>,
    pub init_noise_sigma: f64,
}

impl SigmaTable {
    pub fn training(params: &ScheduleParams, alphas: &AlphaSchedule) -> Self {
        let mut sigmas = alphas.sigmas();
        sigmas.reverse();
        let timesteps = (0..params.num_train_steps).rev().map(|t| t as f64).collect();
        let init_noise_sigma = init_noise_sigma(params.timestep_spacing, &sigmas);
        sigmas.push(0.0);
        Self {
            timesteps,
            sigmas,
            init_noise_sigma,
        }
    }

    pub fn inference(
        params: &ScheduleParams,
        alphas: &AlphaSchedule,
        num_inference_steps: usize,
    ) -> Result<Self> {
        validate_inference_steps(num_inference_steps, params.num_train_steps)?;
        let table = alphas.sigmas();
        let timesteps = spaced_timesteps(
            params.timestep_spacing,
            params.num_train_steps,
            num_inference_steps,
            params.steps_offset,
        );
        let mut sigmas: Vec<f64> = timesteps.iter().map(|&t| interp(t, &table)).collect();
        let init_noise_sigma = init_noise_sigma(params.timestep_spacing, &sigmas);
        sigmas.push(0.0);
        Ok(Self {
            timesteps,
            sigmas,
            init_noise_sigma,
        })
    }
}

fn init_noise_sigma(spacing: TimestepSpacing, sigmas: &[f64]) -> f64 {
    let max = sigmas.iter().cloned().fold(0.0, f64::max);
    match spacing {
        TimestepSpacing::Linspace | TimestepSpacing::Trailing => max,
        TimestepSpacing::Leading => (max * max + 1.0).sqrt(),
    }
}

/// Predicted clean sample from a sigma-space model output
pub(crate) fn denoised(
    prediction_type: PredictionType,
    model_output: &Tensor,
    sample: &Tensor,
    sigma: f64,
) -> Result<Tensor> {
    match prediction_type {
        PredictionType::Epsilon => sample - (model_output * sigma)?,
        PredictionType::VPrediction => {
            let c_out = -sigma / (sigma * sigma + 1.0).sqrt();
            let c_skip = 1.0 / (sigma * sigma + 1.0);
            (model_output * c_out)? + (sample * c_skip)?
        }
        PredictionType::Sample => Ok(model_output.clone()),
    }
}

pub(crate) fn scale_by_sigma(sample: &Tensor, sigma: f64) -> Result<Tensor> {
    sample / (sigma * sigma + 1.0).sqrt()
}

// =============================================================================
// Euler
// =============================================================================

#[derive(Debug)]
pub struct EulerDiscreteScheduler {
    params: ScheduleParams,
    alphas: AlphaSchedule,
    table: SigmaTable,
    step_index: Option<usize>,
}

impl EulerDiscreteScheduler {
    pub fn new(params: ScheduleParams) -> Self {
        let alphas = AlphaSchedule::new(&params);
        let table = SigmaTable::training(&params, &alphas);
        Self {
            params,
            alphas,
            table,
            step_index: None,
        }
    }

    fn current_index(&self, timestep: f64) -> Result<usize> {
        match self.step_index {
            Some(i) => Ok(i),
            None => index_for_timestep(&self.table.timesteps, timestep),
        }
    }

    pub fn sigmas(&self) -> &[f64] {
        &self.table.sigmas
    }
}

impl NoiseSchedule for EulerDiscreteScheduler {
    fn name(&self) -> &'static str {
        "EulerDiscrete"
    }

    fn alphas(&self) -> &AlphaSchedule {
        &self.alphas
    }

    fn prediction_type(&self) -> PredictionType {
        self.params.prediction_type
    }

    fn init_noise_sigma(&self) -> f64 {
        self.table.init_noise_sigma
    }

    fn set_timesteps(&mut self, num_inference_steps: usize) -> Result<()> {
        self.table = SigmaTable::inference(&self.params, &self.alphas, num_inference_steps)?;
        self.step_index = None;
        Ok(())
    }

    fn timesteps(&self) -> &[f64] {
        &self.table.timesteps
    }

    fn scale_model_input(&self, sample: &Tensor, timestep: f64) -> Result<Tensor> {
        let i = self.current_index(timestep)?;
        scale_by_sigma(sample, self.table.sigmas[i])
    }

    fn step(
        &mut self,
        model_output: &Tensor,
        timestep: f64,
        sample: &Tensor,
        _options: &StepOptions,
        _rng: &mut NoiseGenerator,
    ) -> Result<StepOutput> {
        let i = self.current_index(timestep)?;
        let sigma = self.table.sigmas[i];
        let sigma_next = self.table.sigmas[i + 1];

        let pred_original = denoised(self.params.prediction_type, model_output, sample, sigma)?;
        let derivative = ((sample - &pred_original)? / sigma)?;
        let prev_sample = (sample + (derivative * (sigma_next - sigma))?)?;

        self.step_index = Some(i + 1);
        Ok(StepOutput {
            prev_sample,
            pred_original_sample: Some(pred_original),
        })
    }
}

// =============================================================================
// Euler ancestral
// =============================================================================

#[derive(Debug)]
pub struct EulerAncestralDiscreteScheduler {
    params: ScheduleParams,
    alphas: AlphaSchedule,
    table: SigmaTable,
    step_index: Option<usize>,
}

impl EulerAncestralDiscreteScheduler {
    pub fn new(params: ScheduleParams) -> Self {
        let alphas = AlphaSchedule::new(&params);
        let table = SigmaTable::training(&params, &alphas);
        Self {
            params,
            alphas,
            table,
            step_index: None,
        }
    }

    fn current_index(&self, timestep: f64) -> Result<usize> {
        match self.step_index {
            Some(i) => Ok(i),
            None => index_for_timestep(&self.table.timesteps, timestep),
        }
    }
}

impl NoiseSchedule for EulerAncestralDiscreteScheduler {
    fn name(&self) -> &'static str {
        "EulerAncestralDiscrete"
    }

    fn alphas(&self) -> &AlphaSchedule {
        &self.alphas
    }

    fn prediction_type(&self) -> PredictionType {
        self.params.prediction_type
    }

    fn init_noise_sigma(&self) -> f64 {
        self.table.init_noise_sigma
    }

    fn set_timesteps(&mut self, num_inference_steps: usize) -> Result<()> {
        self.table = SigmaTable::inference(&self.params, &self.alphas, num_inference_steps)?;
        self.step_index = None;
        Ok(())
    }

    fn timesteps(&self) -> &[f64] {
        &self.table.timesteps
    }

    fn scale_model_input(&self, sample: &Tensor, timestep: f64) -> Result<Tensor> {
        let i = self.current_index(timestep)?;
        scale_by_sigma(sample, self.table.sigmas[i])
    }

    fn step(
        &mut self,
        model_output: &Tensor,
        timestep: f64,
        sample: &Tensor,
        _options: &StepOptions,
        rng: &mut NoiseGenerator,
    ) -> Result<StepOutput> {
        let i = self.current_index(timestep)?;
        let sigma_from = self.table.sigmas[i];
        let sigma_to = self.table.sigmas[i + 1];
        let sigma_up = (sigma_to * sigma_to * (sigma_from * sigma_from - sigma_to * sigma_to)
            / (sigma_from * sigma_from))
            .max(0.0)
            .sqrt();
        let sigma_down = (sigma_to * sigma_to - sigma_up * sigma_up).max(0.0).sqrt();

        let pred_original =
            denoised(self.params.prediction_type, model_output, sample, sigma_from)?;
        let derivative = ((sample - &pred_original)? / sigma_from)?;
        let mut prev_sample = (sample + (derivative * (sigma_down - sigma_from))?)?;
        if sigma_up > 0.0 {
            let noise = rng.randn_like(model_output)?;
            prev_sample = (prev_sample + (noise * sigma_up)?)?;
        }

        self.step_index = Some(i + 1);
        Ok(StepOutput {
            prev_sample,
            pred_original_sample: Some(pred_original),
        })
    }
}
