//! Sampling loop tests with stub predictors and a registered toy schedule

use candle_core::{DType, Device, Result, Tensor};
use candle_sora::diffusion::{
    AlphaSchedule, DiffusionError, DiffusionScheduler, NoiseGenerator, NoiseSchedule,
    PredictionType, SampleOptions, ScheduleParams, ScheduleRegistry, StepOptions, StepOutput,
};
use candle_sora::parallel::{LocalCommunicator, ParallelContext, ProcessGroup};
use candle_sora::{DiffusionConfig, ModelKwargs, Predictor};
use std::ops::ControlFlow;
use std::sync::{Arc, Mutex};

// =============================================================================
// Stubs
// =============================================================================

/// `prev = sample / 2 + model_output`; `order` model calls per logical step
#[derive(Debug)]
struct HalvingSchedule {
    alphas: AlphaSchedule,
    timesteps: Vec<f64>,
    order: usize,
}

impl HalvingSchedule {
    fn new(params: ScheduleParams, order: usize) -> Self {
        Self {
            alphas: AlphaSchedule::new(&params),
            timesteps: Vec::new(),
            order,
        }
    }
}

impl NoiseSchedule for HalvingSchedule {
    fn name(&self) -> &'static str {
        "Halving"
    }

    fn alphas(&self) -> &AlphaSchedule {
        &self.alphas
    }

    fn prediction_type(&self) -> PredictionType {
        PredictionType::Epsilon
    }

    fn order(&self) -> usize {
        self.order
    }

    fn set_timesteps(&mut self, num_inference_steps: usize) -> Result<()> {
        let total = num_inference_steps * self.order;
        self.timesteps = (0..total).rev().map(|i| (i * 10) as f64).collect();
        Ok(())
    }

    fn timesteps(&self) -> &[f64] {
        &self.timesteps
    }

    fn step(
        &mut self,
        model_output: &Tensor,
        _timestep: f64,
        sample: &Tensor,
        _options: &StepOptions,
        _rng: &mut NoiseGenerator,
    ) -> Result<StepOutput> {
        Ok(StepOutput {
            prev_sample: ((sample * 0.5)? + model_output)?,
            pred_original_sample: None,
        })
    }
}

fn registry() -> ScheduleRegistry {
    let mut registry = ScheduleRegistry::default();
    registry.register("Halving", |p| Box::new(HalvingSchedule::new(p, 1)));
    registry.register("Halving2", |p| Box::new(HalvingSchedule::new(p, 2)));
    registry
}

fn scheduler(config: DiffusionConfig) -> DiffusionScheduler {
    DiffusionScheduler::with_registry(&config, &registry()).unwrap()
}

/// Predicts zeros with `out_channels` channels and records every input shape
#[derive(Default)]
struct ZeroPredictor {
    calls: Mutex<Vec<Vec<usize>>>,
}

impl ZeroPredictor {
    fn calls(&self) -> Vec<Vec<usize>> {
        self.calls.lock().unwrap().clone()
    }
}

impl Predictor for ZeroPredictor {
    fn in_channels(&self) -> usize {
        4
    }

    fn out_channels(&self) -> usize {
        4
    }

    fn forward(&self, hidden_states: &Tensor, _t: &Tensor, _kwargs: &ModelKwargs) -> Result<Tensor> {
        self.calls.lock().unwrap().push(hidden_states.dims().to_vec());
        let mut dims = hidden_states.dims().to_vec();
        dims[1] = self.out_channels();
        Tensor::zeros(dims, hidden_states.dtype(), hidden_states.device())
    }
}

/// Predicts the batch row index everywhere, plus a variance half of 100s
struct RowIndexPredictor;

impl Predictor for RowIndexPredictor {
    fn in_channels(&self) -> usize {
        4
    }

    fn out_channels(&self) -> usize {
        8
    }

    fn forward(&self, hidden_states: &Tensor, _t: &Tensor, _kwargs: &ModelKwargs) -> Result<Tensor> {
        let dims = hidden_states.dims();
        let mut row_shape = vec![dims[0]];
        row_shape.resize(dims.len(), 1);
        let rows = Tensor::arange(0f32, dims[0] as f32, hidden_states.device())?
            .reshape(row_shape)?
            .broadcast_as(dims)?;
        let sigma = (rows.ones_like()? * 100.0)?;
        Tensor::cat(&[&rows, &sigma], 1)
    }
}

fn ones(shape: &[usize]) -> Tensor {
    Tensor::ones(shape, DType::F32, &Device::Cpu).unwrap()
}

fn values(t: &Tensor) -> Vec<f32> {
    t.flatten_all().unwrap().to_vec1::<f32>().unwrap()
}

const SHAPE: [usize; 5] = [1, 4, 2, 2, 2];

// =============================================================================
// Loop mechanics
// =============================================================================

#[test]
fn test_one_predictor_call_per_timestep() {
    let mut s = scheduler(
        DiffusionConfig::default()
            .with_model_id("Halving")
            .with_num_inference_steps(2),
    );
    let predictor = ZeroPredictor::default();
    let out = s
        .sample(
            &predictor,
            &SHAPE,
            ModelKwargs::default(),
            &ParallelContext::single(),
            SampleOptions::default().with_latents(ones(&SHAPE)),
        )
        .unwrap();

    assert_eq!(predictor.calls(), vec![SHAPE.to_vec(), SHAPE.to_vec()]);
    assert!(values(&out).iter().all(|v| (*v - 0.25).abs() < 1e-6));
}

#[test]
fn test_seeded_sampling_is_deterministic() {
    let run = || {
        let mut s = scheduler(
            DiffusionConfig::default()
                .with_model_id("DDIM")
                .with_num_inference_steps(3)
                .with_seed(7),
        );
        let out = s
            .sample(
                &ZeroPredictor::default(),
                &SHAPE,
                ModelKwargs::default(),
                &ParallelContext::single(),
                SampleOptions::default(),
            )
            .unwrap();
        values(&out)
    };
    assert_eq!(run(), run());
}

#[test]
fn test_every_registered_schedule_samples() {
    for id in [
        "DDPM",
        "DDIM",
        "PNDM",
        "EulerDiscrete",
        "EulerAncestralDiscrete",
        "HeunDiscrete",
        "DPMSolverMultistep",
    ] {
        let mut s = scheduler(
            DiffusionConfig::default()
                .with_model_id(id)
                .with_num_inference_steps(4)
                .with_seed(0),
        );
        let out = s
            .sample(
                &ZeroPredictor::default(),
                &SHAPE,
                ModelKwargs::default(),
                &ParallelContext::single(),
                SampleOptions::default(),
            )
            .unwrap();
        assert_eq!(out.dims(), &SHAPE, "{id}");
        assert!(values(&out).iter().all(|v| v.is_finite()), "{id}");
    }
}

#[test]
fn test_rejects_short_shape() {
    let mut s = scheduler(DiffusionConfig::default().with_num_inference_steps(2));
    let result = s.sample(
        &ZeroPredictor::default(),
        &[1, 4, 4],
        ModelKwargs::default(),
        &ParallelContext::single(),
        SampleOptions::default(),
    );
    assert!(matches!(result, Err(DiffusionError::InvalidShape(dims)) if dims == vec![1, 4, 4]));
}

#[test]
fn test_requires_inference_steps() {
    let mut s = scheduler(DiffusionConfig::default());
    let result = s.sample(
        &ZeroPredictor::default(),
        &SHAPE,
        ModelKwargs::default(),
        &ParallelContext::single(),
        SampleOptions::default(),
    );
    assert!(matches!(result, Err(DiffusionError::InferenceStepsNotSet)));
}

// =============================================================================
// Callbacks
// =============================================================================

#[test]
fn test_callback_cadence_second_order() {
    let mut s = scheduler(
        DiffusionConfig::default()
            .with_model_id("Halving2")
            .with_num_inference_steps(5),
    );
    let mut seen = Vec::new();
    let options = SampleOptions::default().with_callback(1, |step, t, _latents| {
        seen.push((step, t));
        ControlFlow::Continue(())
    });
    let predictor = ZeroPredictor::default();
    s.sample(
        &predictor,
        &SHAPE,
        ModelKwargs::default(),
        &ParallelContext::single(),
        options,
    )
    .unwrap();

    assert_eq!(predictor.calls().len(), 10);
    assert_eq!(s.num_warmup_steps(), 0);
    // fires after i = 1, 3, 5, 7, 9 of timesteps [90, 80, ..., 0]
    assert_eq!(
        seen,
        vec![(0, 80.0), (1, 60.0), (2, 40.0), (3, 20.0), (4, 0.0)]
    );
}

#[test]
fn test_callback_steps_thins_calls() {
    let mut s = scheduler(
        DiffusionConfig::default()
            .with_model_id("Halving")
            .with_num_inference_steps(6),
    );
    let mut seen = Vec::new();
    let options = SampleOptions::default().with_callback(2, |step, _t, _latents| {
        seen.push(step);
        ControlFlow::Continue(())
    });
    s.sample(
        &ZeroPredictor::default(),
        &SHAPE,
        ModelKwargs::default(),
        &ParallelContext::single(),
        options,
    )
    .unwrap();
    assert_eq!(seen, vec![0, 2, 4]);
}

#[test]
fn test_callback_break_interrupts() {
    let mut s = scheduler(
        DiffusionConfig::default()
            .with_model_id("Halving")
            .with_num_inference_steps(4),
    );
    let predictor = ZeroPredictor::default();
    let options = SampleOptions::default().with_callback(1, |step, _t, _latents| {
        if step == 1 {
            ControlFlow::Break(())
        } else {
            ControlFlow::Continue(())
        }
    });
    let result = s.sample(
        &predictor,
        &SHAPE,
        ModelKwargs::default(),
        &ParallelContext::single(),
        options,
    );
    assert!(matches!(result, Err(DiffusionError::Interrupted { step: 1 })));
    assert_eq!(predictor.calls().len(), 2);
}

// =============================================================================
// Guidance
// =============================================================================

#[test]
fn test_classifier_free_guidance_combines_halves() {
    let mut s = scheduler(
        DiffusionConfig::default()
            .with_model_id("Halving")
            .with_num_inference_steps(1)
            .with_guidance_scale(7.5),
    );
    assert!(s.do_classifier_free_guidance());

    // uncond row predicts 0, cond row predicts 1; the 100s variance half is dropped
    let latents = Tensor::zeros(&SHAPE, DType::F32, &Device::Cpu).unwrap();
    let out = s
        .sample(
            &RowIndexPredictor,
            &SHAPE,
            ModelKwargs::default(),
            &ParallelContext::single(),
            SampleOptions::default().with_latents(latents),
        )
        .unwrap();
    assert_eq!(out.dims(), &SHAPE);
    assert!(values(&out).iter().all(|v| (*v - 7.5).abs() < 1e-5));
}

#[test]
fn test_guidance_scale_one_disables_duplication() {
    let mut s = scheduler(
        DiffusionConfig::default()
            .with_model_id("Halving")
            .with_num_inference_steps(1),
    );
    assert!(!s.do_classifier_free_guidance());
    let predictor = ZeroPredictor::default();
    s.sample(
        &predictor,
        &SHAPE,
        ModelKwargs::default(),
        &ParallelContext::single(),
        SampleOptions::default(),
    )
    .unwrap();
    assert_eq!(predictor.calls()[0][0], 1);

    s.set_guidance_scale(4.0);
    let predictor = ZeroPredictor::default();
    s.sample(
        &predictor,
        &SHAPE,
        ModelKwargs::default(),
        &ParallelContext::single(),
        SampleOptions::default(),
    )
    .unwrap();
    assert_eq!(predictor.calls()[0][0], 2);
}

#[test]
fn test_inpaint_conditioning_concatenated_on_channels() {
    let mut s = scheduler(
        DiffusionConfig::default()
            .with_model_id("Halving")
            .with_num_inference_steps(1)
            .with_guidance_scale(2.0),
    );
    // callers double the conditioning for guidance, as with the text states
    let kwargs = ModelKwargs {
        masked_pixel_values: Some(ones(&[2, 4, 2, 2, 2])),
        mask: Some(ones(&[2, 1, 2, 2, 2])),
        ..Default::default()
    };
    let predictor = ZeroPredictor::default();
    let out = s
        .sample(
            &predictor,
            &SHAPE,
            kwargs,
            &ParallelContext::single(),
            SampleOptions::default(),
        )
        .unwrap();
    assert_eq!(predictor.calls(), vec![vec![2, 9, 2, 2, 2]]);
    assert_eq!(out.dims(), &SHAPE);
}

#[test]
fn test_inpaint_conditioning_without_guidance() {
    let mut s = scheduler(
        DiffusionConfig::default()
            .with_model_id("Halving")
            .with_num_inference_steps(1)
            .with_guidance_scale(1.0),
    );
    let kwargs = ModelKwargs {
        masked_pixel_values: Some(ones(&SHAPE)),
        mask: Some(ones(&[1, 1, 2, 2, 2])),
        ..Default::default()
    };
    let predictor = ZeroPredictor::default();
    s.sample(
        &predictor,
        &SHAPE,
        kwargs,
        &ParallelContext::single(),
        SampleOptions::default(),
    )
    .unwrap();
    assert_eq!(predictor.calls(), vec![vec![1, 9, 2, 2, 2]]);
}

// =============================================================================
// Context parallelism
// =============================================================================

#[test]
fn test_context_parallel_splits_frames() {
    let shape = [1, 4, 4, 2, 2];
    let full = Tensor::arange(0f32, 64.0, &Device::Cpu)
        .unwrap()
        .reshape(&shape)
        .unwrap();
    let expected: Vec<f32> = values(&full).iter().map(|v| v * 0.25).collect();

    let results = std::thread::scope(|scope| {
        let handles: Vec<_> = LocalCommunicator::group(2)
            .into_iter()
            .map(|comm| {
                let full = full.clone();
                scope.spawn(move || {
                    let ctx = ParallelContext::single()
                        .with_context(ProcessGroup::new(Arc::new(comm)));
                    let mut s = scheduler(
                        DiffusionConfig::default()
                            .with_model_id("Halving")
                            .with_num_inference_steps(2),
                    );
                    let predictor = ZeroPredictor::default();
                    let out = s
                        .sample(
                            &predictor,
                            &shape,
                            ModelKwargs::default(),
                            &ctx,
                            SampleOptions::default().with_latents(full),
                        )
                        .unwrap();
                    (values(&out), predictor.calls())
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .collect::<Vec<_>>()
    });

    for (out, calls) in results {
        assert_eq!(out, expected);
        assert!(calls.iter().all(|dims| dims == &vec![1, 4, 2, 2, 2]));
    }
}
