//! Candle-SoRA: SoRA-style text-to-video diffusion for the Candle framework.
//!
//! This crate provides the STDiT3 denoising predictor, a family of diffusion
//! noise schedules with a training / sampling wrapper, checkpoint
//! reconciliation, and tensor / context parallel primitives.

pub mod common;
pub mod config;
pub mod diffusion;
pub mod loader;
pub mod models;
pub mod parallel;
pub mod utils;

pub use config::{ConfigError, DiffusionConfig, PredictorConfig, SoraConfig, Stdit3Config};
pub use diffusion::{DiffusionError, DiffusionScheduler, PredictionType, SampleOptions};
pub use loader::{CheckpointLoader, LoadReport, LoaderError};
pub use models::sora::{SoraBatch, SoraComponents, SoraError, SoraModel};
pub use models::{ModelKwargs, Predictor, PredictorRegistry};
pub use parallel::{ParallelContext, ProcessGroup};
