//! Diffusion process: noise schedules, training losses and the sampling loop
//!
//! - [`schedule`]: the [`NoiseSchedule`] interface and shared alpha tables
//! - [`ddpm`], [`ddim`], [`pndm`], [`euler`], [`heun`], [`dpm_solver`]: named schedules
//! - [`registry`]: string id -> schedule factory
//! - [`scheduler`]: [`DiffusionScheduler`] (q_sample, training_losses, sample)

pub mod ddim;
pub mod ddpm;
pub mod dpm_solver;
pub mod euler;
pub mod heun;
mod noise;
pub mod pndm;
pub mod registry;
pub mod schedule;
pub mod scheduler;

pub use noise::NoiseGenerator;
pub use registry::{ScheduleFactory, ScheduleRegistry};
pub use schedule::{
    AlphaSchedule, BetaSchedule, NoiseSchedule, ScheduleParams, StepOptions, StepOutput,
    TimestepSpacing,
};
pub use scheduler::{DiffusionScheduler, QSample, SampleOptions, StepCallback};

use std::str::FromStr;

/// What the predictor is trained to output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PredictionType {
    /// The injected noise
    #[default]
    Epsilon,
    /// The velocity `sqrt(a) * noise - sqrt(1 - a) * x0`
    VPrediction,
    /// The clean sample
    Sample,
}

impl FromStr for PredictionType {
    type Err = DiffusionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "epsilon" => Ok(PredictionType::Epsilon),
            "v_prediction" => Ok(PredictionType::VPrediction),
            "sample" => Ok(PredictionType::Sample),
            other => Err(DiffusionError::UnknownPredictionType(other.to_string())),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DiffusionError {
    #[error("Shape mismatch: {lhs:?} vs {rhs:?}")]
    ShapeMismatch { lhs: Vec<usize>, rhs: Vec<usize> },

    #[error("Invalid sample shape {0:?}: expected at least 4 dims")]
    InvalidShape(Vec<usize>),

    #[error("Unknown prediction type: {0}")]
    UnknownPredictionType(String),

    #[error("Unknown noise schedule id: {0}")]
    UnknownScheduleId(String),

    #[error("Unknown beta schedule: {0}")]
    UnknownBetaSchedule(String),

    #[error("Unknown timestep spacing: {0}")]
    UnknownTimestepSpacing(String),

    #[error("num_inference_steps is not configured")]
    InferenceStepsNotSet,

    #[error("Sampling interrupted by callback at step {step}")]
    Interrupted { step: usize },

    #[error(transparent)]
    Config(#[from] crate::config::ConfigError),

    #[error(transparent)]
    Candle(#[from] candle_core::Error),
}
