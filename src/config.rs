//! Configuration structures for the SoRA components
//!
//! All structures deserialize from JSON with serde; missing fields fall back
//! to the defaults used by the reference training configs.

use candle_core::Device;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use std::path::Path;

/// Errors raised while building components from configuration
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Unknown model id: {0}")]
    UnknownModelId(String),

    #[error("Missing component: {0}")]
    MissingComponent(&'static str),

    #[error("Invalid device string: {0}")]
    InvalidDevice(String),

    #[error("Failed to read config file: {path}")]
    FileRead {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse JSON config: {path}")]
    JsonParse {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Invalid predictor parameters for {model_id}")]
    InvalidParams {
        model_id: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Candle error: {0}")]
    Candle(#[from] candle_core::Error),
}

// =============================================================================
// Diffusion
// =============================================================================

/// Diffusion process configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiffusionConfig {
    /// Registered noise schedule id (e.g. "DDPM", "EulerDiscrete")
    pub model_id: String,
    #[serde(default = "default_num_train_steps")]
    pub num_train_steps: usize,
    #[serde(default = "default_beta_start")]
    pub beta_start: f64,
    #[serde(default = "default_beta_end")]
    pub beta_end: f64,
    /// "linear", "scaled_linear" or "squaredcos_cap_v2"
    #[serde(default = "default_beta_schedule")]
    pub beta_schedule: String,
    /// "epsilon", "v_prediction" or "sample"
    #[serde(default = "default_prediction_type")]
    pub prediction_type: String,
    /// Rescale betas to zero terminal SNR; also switches spacing to "trailing"
    #[serde(default)]
    pub rescale_betas_zero_snr: bool,
    /// Overrides the spacing implied by `rescale_betas_zero_snr`
    #[serde(default)]
    pub timestep_spacing: Option<String>,
    #[serde(default)]
    pub steps_offset: usize,
    #[serde(default)]
    pub clip_sample: bool,
    #[serde(default = "default_clip_sample_range")]
    pub clip_sample_range: f64,
    #[serde(default)]
    pub noise_offset: f64,
    /// Min-SNR loss weighting; disabled when absent
    #[serde(default)]
    pub snr_gamma: Option<f64>,
    #[serde(default = "default_guidance_scale")]
    pub guidance_scale: f64,
    #[serde(default)]
    pub num_inference_steps: Option<usize>,
    #[serde(default = "default_device")]
    pub device: String,
    /// Seed for the deterministic noise generator; OS-seeded noise when absent
    #[serde(default)]
    pub seed: Option<u64>,
}

fn default_num_train_steps() -> usize {
    1000
}

fn default_beta_start() -> f64 {
    0.0001
}

fn default_beta_end() -> f64 {
    0.02
}

fn default_beta_schedule() -> String {
    "linear".to_string()
}

fn default_prediction_type() -> String {
    "epsilon".to_string()
}

fn default_clip_sample_range() -> f64 {
    1.0
}

fn default_guidance_scale() -> f64 {
    1.0
}

fn default_device() -> String {
    "cpu".to_string()
}

impl Default for DiffusionConfig {
    fn default() -> Self {
        Self {
            model_id: "DDPM".to_string(),
            num_train_steps: default_num_train_steps(),
            beta_start: default_beta_start(),
            beta_end: default_beta_end(),
            beta_schedule: default_beta_schedule(),
            prediction_type: default_prediction_type(),
            rescale_betas_zero_snr: false,
            timestep_spacing: None,
            steps_offset: 0,
            clip_sample: false,
            clip_sample_range: default_clip_sample_range(),
            noise_offset: 0.0,
            snr_gamma: None,
            guidance_scale: default_guidance_scale(),
            num_inference_steps: None,
            device: default_device(),
            seed: None,
        }
    }
}

impl DiffusionConfig {
    pub fn with_model_id(mut self, model_id: impl Into<String>) -> Self {
        self.model_id = model_id.into();
        self
    }

    pub fn with_prediction_type(mut self, prediction_type: impl Into<String>) -> Self {
        self.prediction_type = prediction_type.into();
        self
    }

    pub fn with_guidance_scale(mut self, guidance_scale: f64) -> Self {
        self.guidance_scale = guidance_scale;
        self
    }

    pub fn with_num_inference_steps(mut self, steps: usize) -> Self {
        self.num_inference_steps = Some(steps);
        self
    }

    pub fn with_snr_gamma(mut self, gamma: f64) -> Self {
        self.snr_gamma = Some(gamma);
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }
}

// =============================================================================
// Predictor
// =============================================================================

/// Predictor selection: a registered model id plus model-specific parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PredictorConfig {
    pub model_id: String,
    #[serde(flatten)]
    pub params: serde_json::Map<String, serde_json::Value>,
}

impl PredictorConfig {
    pub fn new(model_id: impl Into<String>) -> Self {
        Self {
            model_id: model_id.into(),
            params: serde_json::Map::new(),
        }
    }

    /// Deserialize the model-specific parameters into `T`
    pub fn params<T: DeserializeOwned>(&self) -> Result<T, ConfigError> {
        serde_json::from_value(serde_json::Value::Object(self.params.clone())).map_err(|source| {
            ConfigError::InvalidParams {
                model_id: self.model_id.clone(),
                source,
            }
        })
    }
}

/// STDiT3 predictor hyper-parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stdit3Config {
    #[serde(default = "default_input_sq_size")]
    pub input_sq_size: usize,
    #[serde(default = "default_in_channels")]
    pub in_channels: usize,
    /// (T, H, W) patch size
    #[serde(default = "default_patch_size")]
    pub patch_size: [usize; 3],
    #[serde(default = "default_hidden_size")]
    pub hidden_size: usize,
    #[serde(default = "default_depth")]
    pub depth: usize,
    #[serde(default = "default_num_heads")]
    pub num_heads: usize,
    #[serde(default = "default_mlp_ratio")]
    pub mlp_ratio: f64,
    /// Predict a learned variance alongside the noise (doubles output channels)
    #[serde(default = "default_true")]
    pub pred_sigma: bool,
    #[serde(default = "default_caption_channels")]
    pub caption_channels: usize,
    #[serde(default = "default_model_max_length")]
    pub model_max_length: usize,
    #[serde(default = "default_true")]
    pub qk_norm: bool,
    #[serde(default)]
    pub enable_sequence_parallelism: bool,
    /// Use the accelerated attention kernels when the device has them
    #[serde(default = "default_true")]
    pub use_accelerated_attention: bool,
}

fn default_input_sq_size() -> usize {
    512
}

fn default_in_channels() -> usize {
    4
}

fn default_patch_size() -> [usize; 3] {
    [1, 2, 2]
}

fn default_hidden_size() -> usize {
    1152
}

fn default_depth() -> usize {
    28
}

fn default_num_heads() -> usize {
    16
}

fn default_mlp_ratio() -> f64 {
    4.0
}

fn default_caption_channels() -> usize {
    4096
}

fn default_model_max_length() -> usize {
    300
}

fn default_true() -> bool {
    true
}

impl Default for Stdit3Config {
    fn default() -> Self {
        Self {
            input_sq_size: default_input_sq_size(),
            in_channels: default_in_channels(),
            patch_size: default_patch_size(),
            hidden_size: default_hidden_size(),
            depth: default_depth(),
            num_heads: default_num_heads(),
            mlp_ratio: default_mlp_ratio(),
            pred_sigma: true,
            caption_channels: default_caption_channels(),
            model_max_length: default_model_max_length(),
            qk_norm: true,
            enable_sequence_parallelism: false,
            use_accelerated_attention: true,
        }
    }
}

impl Stdit3Config {
    pub fn out_channels(&self) -> usize {
        if self.pred_sigma {
            self.in_channels * 2
        } else {
            self.in_channels
        }
    }

    pub fn head_dim(&self) -> usize {
        self.hidden_size / self.num_heads
    }

    pub fn mlp_hidden_size(&self) -> usize {
        (self.hidden_size as f64 * self.mlp_ratio) as usize
    }
}

// =============================================================================
// Assembly
// =============================================================================

/// Top-level model configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SoraConfig {
    pub predictor: PredictorConfig,
    pub diffusion: DiffusionConfig,
    /// Inputs are pre-computed latents; skip the autoencoder
    #[serde(default)]
    pub load_video_features: bool,
    /// Inputs are pre-computed text embeddings; skip the text encoders
    #[serde(default)]
    pub load_text_features: bool,
    /// "f32", "f16" or "bf16"
    #[serde(default = "default_weight_dtype")]
    pub weight_dtype: String,
}

fn default_weight_dtype() -> String {
    "f32".to_string()
}

/// Load a JSON configuration file
pub fn load_model_config<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<T, ConfigError> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::FileRead {
        path: path.display().to_string(),
        source,
    })?;
    serde_json::from_str(&content).map_err(|source| ConfigError::JsonParse {
        path: path.display().to_string(),
        source,
    })
}

/// Parse "cpu", "cuda", "cuda:N", "metal" or "metal:N"
pub fn parse_device(name: &str) -> Result<Device, ConfigError> {
    let (kind, ordinal) = match name.split_once(':') {
        Some((kind, ordinal)) => {
            let ordinal = ordinal
                .parse::<usize>()
                .map_err(|_| ConfigError::InvalidDevice(name.to_string()))?;
            (kind, ordinal)
        }
        None => (name, 0),
    };
    match kind {
        "cpu" => Ok(Device::Cpu),
        "cuda" => Ok(Device::new_cuda(ordinal)?),
        "metal" => Ok(Device::new_metal(ordinal)?),
        _ => Err(ConfigError::InvalidDevice(name.to_string())),
    }
}

/// Parse a dtype name used in configs
pub fn parse_dtype(name: &str) -> Option<candle_core::DType> {
    use candle_core::DType;
    match name {
        "f32" | "fp32" | "float32" => Some(DType::F32),
        "f16" | "fp16" | "float16" => Some(DType::F16),
        "bf16" | "bfloat16" => Some(DType::BF16),
        "f64" | "float64" => Some(DType::F64),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_diffusion_config_defaults_from_json() {
        let config: DiffusionConfig = serde_json::from_str(r#"{"model_id": "DDIM"}"#).unwrap();
        assert_eq!(config.model_id, "DDIM");
        assert_eq!(config.num_train_steps, 1000);
        assert_eq!(config.prediction_type, "epsilon");
        assert_eq!(config.guidance_scale, 1.0);
        assert_eq!(config.noise_offset, 0.0);
        assert!(config.snr_gamma.is_none());
        assert!(!config.rescale_betas_zero_snr);
    }

    #[test]
    fn test_predictor_config_flattened_params() {
        let config: PredictorConfig =
            serde_json::from_str(r#"{"model_id": "stdit3", "hidden_size": 64, "depth": 2}"#)
                .unwrap();
        assert_eq!(config.model_id, "stdit3");
        let params: Stdit3Config = config.params().unwrap();
        assert_eq!(params.hidden_size, 64);
        assert_eq!(params.depth, 2);
        assert_eq!(params.num_heads, 16);
        assert_eq!(params.patch_size, [1, 2, 2]);
    }

    #[test]
    fn test_stdit3_out_channels() {
        let config = Stdit3Config::default();
        assert_eq!(config.out_channels(), 8);
        let config = Stdit3Config {
            pred_sigma: false,
            ..Default::default()
        };
        assert_eq!(config.out_channels(), 4);
    }

    #[test]
    fn test_parse_device() {
        assert!(matches!(parse_device("cpu"), Ok(Device::Cpu)));
        assert!(matches!(
            parse_device("tpu"),
            Err(ConfigError::InvalidDevice(_))
        ));
        assert!(matches!(
            parse_device("cuda:x"),
            Err(ConfigError::InvalidDevice(_))
        ));
    }
}
