//! DDPM ancestral sampler (fixed-small variance)

use super::schedule::{
    AlphaSchedule, NoiseSchedule, ScheduleParams, StepOptions, StepOutput, predict_original,
    spaced_timesteps, validate_inference_steps,
};
use super::{NoiseGenerator, PredictionType};
use candle_core::{Result, Tensor};

#[derive(Debug)]
pub struct DdpmScheduler {
    params: ScheduleParams,
    alphas: AlphaSchedule,
    timesteps: Vec<f64>,
    num_inference_steps: usize,
}

impl DdpmScheduler {
    pub fn new(params: ScheduleParams) -> Self {
        let alphas = AlphaSchedule::new(&params);
        let num_train_steps = params.num_train_steps;
        Self {
            params,
            alphas,
            timesteps: (0..num_train_steps).rev().map(|t| t as f64).collect(),
            num_inference_steps: num_train_steps,
        }
    }

    fn previous_timestep(&self, t: usize) -> i64 {
        t as i64 - (self.params.num_train_steps / self.num_inference_steps) as i64
    }
}

impl NoiseSchedule for DdpmScheduler {
    fn name(&self) -> &'static str {
        "DDPM"
    }

    fn alphas(&self) -> &AlphaSchedule {
        &self.alphas
    }

    fn prediction_type(&self) -> PredictionType {
        self.params.prediction_type
    }

    fn set_timesteps(&mut self, num_inference_steps: usize) -> Result<()> {
        validate_inference_steps(num_inference_steps, self.params.num_train_steps)?;
        self.num_inference_steps = num_inference_steps;
        self.timesteps = spaced_timesteps(
            self.params.timestep_spacing,
            self.params.num_train_steps,
            num_inference_steps,
            self.params.steps_offset,
        );
        Ok(())
    }

    fn timesteps(&self) -> &[f64] {
        &self.timesteps
    }

    fn step(
        &mut self,
        model_output: &Tensor,
        timestep: f64,
        sample: &Tensor,
        _options: &StepOptions,
        rng: &mut NoiseGenerator,
    ) -> Result<StepOutput> {
        let t = timestep.round() as usize;
        let prev_t = self.previous_timestep(t);

        let alpha_prod_t = self.alphas.alpha_cumprod(t);
        let alpha_prod_prev = if prev_t >= 0 {
            self.alphas.alpha_cumprod(prev_t as usize)
        } else {
            1.0
        };
        let beta_prod_t = 1.0 - alpha_prod_t;
        let beta_prod_prev = 1.0 - alpha_prod_prev;
        let current_alpha = alpha_prod_t / alpha_prod_prev;
        let current_beta = 1.0 - current_alpha;

        let mut pred_original = predict_original(
            self.params.prediction_type,
            model_output,
            sample,
            alpha_prod_t,
        )?;
        if let Some(range) = self.params.clip_sample {
            pred_original = pred_original.clamp(-range, range)?;
        }

        let original_coeff = alpha_prod_prev.sqrt() * current_beta / beta_prod_t;
        let sample_coeff = current_alpha.sqrt() * beta_prod_prev / beta_prod_t;
        let mut prev_sample = ((&pred_original * original_coeff)? + (sample * sample_coeff)?)?;

        if t > 0 {
            let variance = (beta_prod_prev / beta_prod_t * current_beta).max(1e-20);
            let noise = rng.randn_like(model_output)?;
            prev_sample = (prev_sample + (noise * variance.sqrt())?)?;
        }

        Ok(StepOutput {
            prev_sample,
            pred_original_sample: Some(pred_original),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    #[test]
    fn test_sample_prediction_at_t0_returns_prediction() -> Result<()> {
        let mut scheduler = DdpmScheduler::new(ScheduleParams {
            prediction_type: PredictionType::Sample,
            ..Default::default()
        });
        scheduler.set_timesteps(10)?;
        assert_eq!(scheduler.timesteps()[9], 0.0);

        let x0 = Tensor::full(0.25f32, (1, 2, 2), &Device::Cpu)?;
        let sample = Tensor::zeros((1, 2, 2), DType::F32, &Device::Cpu)?;
        let out = scheduler.step(
            &x0,
            0.0,
            &sample,
            &StepOptions::default(),
            &mut NoiseGenerator::new(Some(0)),
        )?;
        // At t = 0 the posterior mean collapses onto the predicted clean sample
        let diff = (out.prev_sample - x0)?.abs()?.max_all()?.to_scalar::<f32>()?;
        assert!(diff < 1e-5);
        Ok(())
    }
}
