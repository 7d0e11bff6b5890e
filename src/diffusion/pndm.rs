//! PNDM in pure linear multistep (PLMS) mode
//!
//! The first step is evaluated twice (once at `t`, once at the predicted
//! `t - ratio`), so the timestep list has one more entry than the requested
//! step count and the sampler sees one warmup step.

use super::schedule::{
    AlphaSchedule, NoiseSchedule, ScheduleParams, StepOptions, StepOutput, spaced_timesteps,
    validate_inference_steps,
};
use super::{NoiseGenerator, PredictionType};
use candle_core::{Result, Tensor, bail};

#[derive(Debug)]
pub struct PndmScheduler {
    params: ScheduleParams,
    alphas: AlphaSchedule,
    final_alpha_cumprod: f64,
    timesteps: Vec<f64>,
    num_inference_steps: usize,
    ets: Vec<Tensor>,
    counter: usize,
    cur_sample: Option<Tensor>,
}

impl PndmScheduler {
    pub fn new(params: ScheduleParams) -> Self {
        let alphas = AlphaSchedule::new(&params);
        let final_alpha_cumprod = alphas.alpha_cumprod(0);
        Self {
            params,
            alphas,
            final_alpha_cumprod,
            timesteps: Vec::new(),
            num_inference_steps: 0,
            ets: Vec::new(),
            counter: 0,
            cur_sample: None,
        }
    }

    fn prev_sample(
        &self,
        sample: &Tensor,
        timestep: i64,
        prev_timestep: i64,
        model_output: &Tensor,
    ) -> Result<Tensor> {
        let alpha_prod_t = self.alphas.alpha_cumprod(timestep.max(0) as usize);
        let alpha_prod_prev = if prev_timestep >= 0 {
            self.alphas.alpha_cumprod(prev_timestep as usize)
        } else {
            self.final_alpha_cumprod
        };
        let beta_prod_t = 1.0 - alpha_prod_t;
        let beta_prod_prev = 1.0 - alpha_prod_prev;

        let model_output = match self.params.prediction_type {
            PredictionType::Epsilon => model_output.clone(),
            PredictionType::VPrediction => {
                ((model_output * alpha_prod_t.sqrt())? + (sample * beta_prod_t.sqrt())?)?
            }
            PredictionType::Sample => bail!("PNDM does not support sample prediction"),
        };

        let sample_coeff = (alpha_prod_prev / alpha_prod_t).sqrt();
        let denom = alpha_prod_t * beta_prod_prev.sqrt()
            + (alpha_prod_t * beta_prod_t * alpha_prod_prev).sqrt();
        (sample * sample_coeff)? - (model_output * ((alpha_prod_prev - alpha_prod_t) / denom))?
    }
}

impl NoiseSchedule for PndmScheduler {
    fn name(&self) -> &'static str {
        "PNDM"
    }

    fn alphas(&self) -> &AlphaSchedule {
        &self.alphas
    }

    fn prediction_type(&self) -> PredictionType {
        self.params.prediction_type
    }

    fn set_timesteps(&mut self, num_inference_steps: usize) -> Result<()> {
        validate_inference_steps(num_inference_steps, self.params.num_train_steps)?;
        let mut ascending = spaced_timesteps(
            self.params.timestep_spacing,
            self.params.num_train_steps,
            num_inference_steps,
            self.params.steps_offset,
        );
        ascending.reverse();

        let n = ascending.len();
        let mut plms = ascending.clone();
        if n >= 2 {
            plms = ascending[..n - 1].to_vec();
            plms.push(ascending[n - 2]);
            plms.push(ascending[n - 1]);
        }
        plms.reverse();

        self.timesteps = plms;
        self.num_inference_steps = num_inference_steps;
        self.ets.clear();
        self.counter = 0;
        self.cur_sample = None;
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
        _rng: &mut NoiseGenerator,
    ) -> Result<StepOutput> {
        if self.num_inference_steps == 0 {
            bail!("PNDM: set_timesteps must be called before step")
        }
        let ratio = (self.params.num_train_steps / self.num_inference_steps) as i64;
        let mut timestep = timestep.round() as i64;
        let mut prev_timestep = timestep - ratio;

        if self.counter != 1 {
            if self.ets.len() > 3 {
                self.ets.remove(0);
            }
            self.ets.push(model_output.clone());
        } else {
            prev_timestep = timestep;
            timestep += ratio;
        }

        let mut sample = sample.clone();
        let ets = &self.ets;
        let combined = match (ets.len(), self.counter) {
            (1, 0) => {
                self.cur_sample = Some(sample.clone());
                model_output.clone()
            }
            (1, 1) => {
                if let Some(cur) = self.cur_sample.take() {
                    sample = cur;
                }
                ((model_output + &ets[0])? / 2.0)?
            }
            (2, _) => (((&ets[1] * 3.0)? - &ets[0])? / 2.0)?,
            (3, _) => {
                let acc = ((&ets[2] * 23.0)? - (&ets[1] * 16.0)?)?;
                ((acc + (&ets[0] * 5.0)?)? / 12.0)?
            }
            _ => {
                let n = ets.len();
                let acc = ((&ets[n - 1] * 55.0)? - (&ets[n - 2] * 59.0)?)?;
                let acc = (acc + (&ets[n - 3] * 37.0)?)?;
                ((acc - (&ets[n - 4] * 9.0)?)? / 24.0)?
            }
        };

        let prev_sample = self.prev_sample(&sample, timestep, prev_timestep, &combined)?;
        self.counter += 1;

        Ok(StepOutput {
            prev_sample,
            pred_original_sample: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plms_timesteps_repeat_second_entry() -> Result<()> {
        let mut scheduler = PndmScheduler::new(ScheduleParams::default());
        scheduler.set_timesteps(3)?;
        assert_eq!(scheduler.timesteps(), &[666.0, 333.0, 333.0, 0.0]);
        Ok(())
    }
}
