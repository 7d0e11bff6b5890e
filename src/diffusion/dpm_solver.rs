//! DPM-Solver++ multistep sampler (second order, midpoint update)

use super::euler::SigmaTable;
use super::schedule::{
    AlphaSchedule, NoiseSchedule, ScheduleParams, StepOptions, StepOutput, index_for_timestep,
};
use super::{NoiseGenerator, PredictionType};
use candle_core::{Result, Tensor};

/// `(alpha_t, sigma_t, lambda_t)` for a sigma-space noise level
fn alpha_sigma_lambda(sigma: f64) -> (f64, f64, f64) {
    let alpha_t = 1.0 / (sigma * sigma + 1.0).sqrt();
    let sigma_t = sigma * alpha_t;
    (alpha_t, sigma_t, alpha_t.ln() - sigma_t.ln())
}

#[derive(Debug)]
pub struct DpmSolverMultistepScheduler {
    params: ScheduleParams,
    alphas: AlphaSchedule,
    table: SigmaTable,
    step_index: Option<usize>,
    /// Converted data predictions of the last two steps, oldest first
    model_outputs: Vec<Tensor>,
    lower_order_nums: usize,
}

impl DpmSolverMultistepScheduler {
    pub fn new(params: ScheduleParams) -> Self {
        let alphas = AlphaSchedule::new(&params);
        let table = SigmaTable::training(&params, &alphas);
        Self {
            params,
            alphas,
            table,
            step_index: None,
            model_outputs: Vec::new(),
            lower_order_nums: 0,
        }
    }

    fn convert_model_output(&self, model_output: &Tensor, sample: &Tensor, sigma: f64) -> Result<Tensor> {
        let (alpha_t, sigma_t, _) = alpha_sigma_lambda(sigma);
        match self.params.prediction_type {
            PredictionType::Epsilon => (sample - (model_output * sigma_t)?)? / alpha_t,
            PredictionType::Sample => Ok(model_output.clone()),
            PredictionType::VPrediction => (sample * alpha_t)? - (model_output * sigma_t)?,
        }
    }

    fn first_order_update(&self, x0: &Tensor, sample: &Tensor, i: usize) -> Result<Tensor> {
        let (_, sigma_s, lambda_s) = alpha_sigma_lambda(self.table.sigmas[i]);
        let sigma_next = self.table.sigmas[i + 1];
        if sigma_next == 0.0 {
            return Ok(x0.clone());
        }
        let (alpha_t, sigma_t, lambda_t) = alpha_sigma_lambda(sigma_next);
        let h = lambda_t - lambda_s;
        (sample * (sigma_t / sigma_s))? - (x0 * (alpha_t * ((-h).exp() - 1.0)))?
    }

    fn second_order_update(&self, sample: &Tensor, i: usize) -> Result<Tensor> {
        let n = self.model_outputs.len();
        let m0 = &self.model_outputs[n - 1];
        let m1 = &self.model_outputs[n - 2];
        let (_, sigma_s0, lambda_s0) = alpha_sigma_lambda(self.table.sigmas[i]);
        let (_, _, lambda_s1) = alpha_sigma_lambda(self.table.sigmas[i - 1]);
        let (alpha_t, sigma_t, lambda_t) = alpha_sigma_lambda(self.table.sigmas[i + 1]);

        let h = lambda_t - lambda_s0;
        let r0 = (lambda_s0 - lambda_s1) / h;
        let d1 = ((m0 - m1)? * (1.0 / r0))?;
        let coeff = alpha_t * ((-h).exp() - 1.0);
        let x = ((sample * (sigma_t / sigma_s0))? - (m0 * coeff)?)?;
        x - (d1 * (0.5 * coeff))?
    }
}

impl NoiseSchedule for DpmSolverMultistepScheduler {
    fn name(&self) -> &'static str {
        "DPMSolverMultistep"
    }

    fn alphas(&self) -> &AlphaSchedule {
        &self.alphas
    }

    fn prediction_type(&self) -> PredictionType {
        self.params.prediction_type
    }

    fn set_timesteps(&mut self, num_inference_steps: usize) -> Result<()> {
        self.table = SigmaTable::inference(&self.params, &self.alphas, num_inference_steps)?;
        self.step_index = None;
        self.model_outputs.clear();
        self.lower_order_nums = 0;
        Ok(())
    }

    fn timesteps(&self) -> &[f64] {
        &self.table.timesteps
    }

    fn step(
        &mut self,
        model_output: &Tensor,
        timestep: f64,
        sample: &Tensor,
        _options: &StepOptions,
        _rng: &mut NoiseGenerator,
    ) -> Result<StepOutput> {
        let i = match self.step_index {
            Some(i) => i,
            None => index_for_timestep(&self.table.timesteps, timestep)?,
        };
        // The final step lands on sigma = 0, where only the first-order update is defined
        let is_last = i + 1 == self.table.timesteps.len();

        let x0 = self.convert_model_output(model_output, sample, self.table.sigmas[i])?;
        if self.model_outputs.len() == 2 {
            self.model_outputs.remove(0);
        }
        self.model_outputs.push(x0.clone());

        let prev_sample = if self.lower_order_nums < 1 || is_last || i == 0 {
            self.first_order_update(&x0, sample, i)?
        } else {
            self.second_order_update(sample, i)?
        };
        if self.lower_order_nums < 2 {
            self.lower_order_nums += 1;
        }

        self.step_index = Some(i + 1);
        Ok(StepOutput {
            prev_sample,
            pred_original_sample: Some(x0),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn test_final_step_returns_data_prediction() -> Result<()> {
        let mut scheduler = DpmSolverMultistepScheduler::new(ScheduleParams {
            prediction_type: PredictionType::Sample,
            ..Default::default()
        });
        scheduler.set_timesteps(4)?;
        let device = Device::Cpu;
        let target = Tensor::full(0.7f32, (2, 2), &device)?;
        let mut x = Tensor::full(3.0f32, (2, 2), &device)?;
        let mut rng = NoiseGenerator::new(None);
        for t in scheduler.timesteps().to_vec() {
            x = scheduler
                .step(&target, t, &x, &StepOptions::default(), &mut rng)?
                .prev_sample;
        }
        let diff = (x - target)?.abs()?.max_all()?.to_scalar::<f32>()?;
        assert!(diff < 1e-5, "diff {diff}");
        Ok(())
    }
}
