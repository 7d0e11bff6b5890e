//! DDIM sampler with optional `eta` stochasticity

use super::schedule::{
    AlphaSchedule, NoiseSchedule, ScheduleParams, StepOptions, StepOutput, spaced_timesteps,
    validate_inference_steps,
};
use super::{NoiseGenerator, PredictionType};
use candle_core::{Result, Tensor};

#[derive(Debug)]
pub struct DdimScheduler {
    params: ScheduleParams,
    alphas: AlphaSchedule,
    /// Cumulative alpha used past the final step
    final_alpha_cumprod: f64,
    timesteps: Vec<f64>,
    num_inference_steps: usize,
}

impl DdimScheduler {
    pub fn new(params: ScheduleParams) -> Self {
        let alphas = AlphaSchedule::new(&params);
        let num_train_steps = params.num_train_steps;
        Self {
            params,
            alphas,
            final_alpha_cumprod: 1.0,
            timesteps: (0..num_train_steps).rev().map(|t| t as f64).collect(),
            num_inference_steps: num_train_steps,
        }
    }

    /// Use `alphas_cumprod[0]` instead of 1.0 beyond the last step
    pub fn without_alpha_one(mut self) -> Self {
        self.final_alpha_cumprod = self.alphas.alpha_cumprod(0);
        self
    }
}

impl NoiseSchedule for DdimScheduler {
    fn name(&self) -> &'static str {
        "DDIM"
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
        options: &StepOptions,
        rng: &mut NoiseGenerator,
    ) -> Result<StepOutput> {
        let t = timestep.round() as usize;
        let prev_t = t as i64 - (self.params.num_train_steps / self.num_inference_steps) as i64;

        let alpha_prod_t = self.alphas.alpha_cumprod(t);
        let alpha_prod_prev = if prev_t >= 0 {
            self.alphas.alpha_cumprod(prev_t as usize)
        } else {
            self.final_alpha_cumprod
        };
        let beta_prod_t = 1.0 - alpha_prod_t;

        let (mut pred_original, pred_epsilon) = match self.params.prediction_type {
            PredictionType::Epsilon => {
                let x0 = ((sample - (model_output * beta_prod_t.sqrt())?)? / alpha_prod_t.sqrt())?;
                (x0, model_output.clone())
            }
            PredictionType::Sample => {
                let eps =
                    ((sample - (model_output * alpha_prod_t.sqrt())?)? / beta_prod_t.sqrt())?;
                (model_output.clone(), eps)
            }
            PredictionType::VPrediction => {
                let x0 = ((sample * alpha_prod_t.sqrt())? - (model_output * beta_prod_t.sqrt())?)?;
                let eps = ((model_output * alpha_prod_t.sqrt())? + (sample * beta_prod_t.sqrt())?)?;
                (x0, eps)
            }
        };
        if let Some(range) = self.params.clip_sample {
            pred_original = pred_original.clamp(-range, range)?;
        }

        let variance = (1.0 - alpha_prod_prev) / beta_prod_t * (1.0 - alpha_prod_t / alpha_prod_prev);
        let std_dev = options.eta * variance.max(0.0).sqrt();

        let direction = (&pred_epsilon * (1.0 - alpha_prod_prev - std_dev * std_dev).max(0.0).sqrt())?;
        let mut prev_sample = ((&pred_original * alpha_prod_prev.sqrt())? + direction)?;

        if options.eta > 0.0 {
            let noise = rng.randn_like(model_output)?;
            prev_sample = (prev_sample + (noise * std_dev)?)?;
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
    use candle_core::Device;

    #[test]
    fn test_deterministic_step_recovers_x0_on_exact_epsilon() -> Result<()> {
        // x_t built from known x0 and noise; predicting that noise exactly
        // must move onto the DDIM trajectory of the same pair
        let mut scheduler = DdimScheduler::new(ScheduleParams::default());
        scheduler.set_timesteps(10)?;
        let device = Device::Cpu;
        let x0 = Tensor::full(0.5f32, (1, 4), &device)?;
        let noise = Tensor::full(-1.0f32, (1, 4), &device)?;
        let t = scheduler.timesteps()[0];
        let xt = scheduler.add_noise(&x0, &noise, &Tensor::new(&[t as u32], &device)?)?;

        let out = scheduler.step(
            &noise,
            t,
            &xt,
            &StepOptions::default(),
            &mut NoiseGenerator::new(Some(0)),
        )?;
        let pred_x0 = out.pred_original_sample.unwrap();
        let diff = (pred_x0 - &x0)?.abs()?.max_all()?.to_scalar::<f32>()?;
        assert!(diff < 1e-4, "x0 diff {diff}");

        let prev_t = t - 100.0;
        let expected = scheduler.add_noise(&x0, &noise, &Tensor::new(&[prev_t as u32], &device)?)?;
        let diff = (out.prev_sample - expected)?.abs()?.max_all()?.to_scalar::<f32>()?;
        assert!(diff < 1e-4, "x_prev diff {diff}");
        Ok(())
    }
}
