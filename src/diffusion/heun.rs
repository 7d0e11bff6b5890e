//! Heun's second-order sampler
//!
//! Every interior timestep appears twice: the first visit takes an Euler
//! predictor step, the second averages the two slopes. `order()` is 2.

use super::euler::{SigmaTable, denoised, scale_by_sigma};
use super::schedule::{
    AlphaSchedule, NoiseSchedule, ScheduleParams, StepOptions, StepOutput, index_for_timestep,
};
use super::{NoiseGenerator, PredictionType};
use candle_core::{Result, Tensor};

#[derive(Debug)]
struct FirstOrderState {
    derivative: Tensor,
    dt: f64,
    sample: Tensor,
}

#[derive(Debug)]
pub struct HeunDiscreteScheduler {
    params: ScheduleParams,
    alphas: AlphaSchedule,
    timesteps: Vec<f64>,
    sigmas: Vec<f64>,
    init_noise_sigma: f64,
    step_index: Option<usize>,
    pending: Option<FirstOrderState>,
}

impl HeunDiscreteScheduler {
    pub fn new(params: ScheduleParams) -> Self {
        let alphas = AlphaSchedule::new(&params);
        let table = SigmaTable::training(&params, &alphas);
        Self {
            params,
            alphas,
            timesteps: table.timesteps,
            sigmas: table.sigmas,
            init_noise_sigma: table.init_noise_sigma,
            step_index: None,
            pending: None,
        }
    }

    fn current_index(&self, timestep: f64) -> Result<usize> {
        match self.step_index {
            Some(i) => Ok(i),
            None => index_for_timestep(&self.timesteps, timestep),
        }
    }
}

/// `[a, b, c]` -> `[a, b, b, c, c]`
fn interleave_tail(values: &[f64]) -> Vec<f64> {
    let mut out = Vec::with_capacity(values.len() * 2);
    if let Some((first, rest)) = values.split_first() {
        out.push(*first);
        for v in rest {
            out.push(*v);
            out.push(*v);
        }
    }
    out
}

impl NoiseSchedule for HeunDiscreteScheduler {
    fn name(&self) -> &'static str {
        "HeunDiscrete"
    }

    fn alphas(&self) -> &AlphaSchedule {
        &self.alphas
    }

    fn prediction_type(&self) -> PredictionType {
        self.params.prediction_type
    }

    fn order(&self) -> usize {
        2
    }

    fn init_noise_sigma(&self) -> f64 {
        self.init_noise_sigma
    }

    fn set_timesteps(&mut self, num_inference_steps: usize) -> Result<()> {
        let table = SigmaTable::inference(&self.params, &self.alphas, num_inference_steps)?;
        // sigmas: s0, s1, s1, ..., s_{n-1}, s_{n-1}, 0
        let n = table.sigmas.len();
        let mut sigmas = interleave_tail(&table.sigmas[..n - 1]);
        sigmas.push(0.0);
        self.timesteps = interleave_tail(&table.timesteps);
        self.sigmas = sigmas;
        self.init_noise_sigma = table.init_noise_sigma;
        self.step_index = None;
        self.pending = None;
        Ok(())
    }

    fn timesteps(&self) -> &[f64] {
        &self.timesteps
    }

    fn scale_model_input(&self, sample: &Tensor, timestep: f64) -> Result<Tensor> {
        let i = self.current_index(timestep)?;
        scale_by_sigma(sample, self.sigmas[i])
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
        let prediction_type = self.params.prediction_type;

        let (prev_sample, pred_original) = match self.pending.take() {
            None => {
                let sigma = self.sigmas[i];
                let sigma_next = self.sigmas[i + 1];
                let pred_original = denoised(prediction_type, model_output, sample, sigma)?;
                let derivative = ((sample - &pred_original)? / sigma)?;
                let dt = sigma_next - sigma;
                let prev = (sample + (&derivative * dt)?)?;
                self.pending = Some(FirstOrderState {
                    derivative,
                    dt,
                    sample: sample.clone(),
                });
                (prev, pred_original)
            }
            Some(state) => {
                let sigma_next = self.sigmas[i];
                let pred_original = denoised(prediction_type, model_output, sample, sigma_next)?;
                let derivative = ((sample - &pred_original)? / sigma_next)?;
                let derivative = ((state.derivative + derivative)? / 2.0)?;
                let prev = (state.sample + (derivative * state.dt)?)?;
                (prev, pred_original)
            }
        };

        self.step_index = Some(i + 1);
        Ok(StepOutput {
            prev_sample,
            pred_original_sample: Some(pred_original),
        })
    }
}
