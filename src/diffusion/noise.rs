use crate::utils::deterministic_rng::Pcg32;
use candle_core::{DType, Device, Result, Shape, Tensor};

/// Source of Gaussian noise and random timesteps
///
/// `Seeded` reproduces the same stream for a given seed on every device;
/// `Entropy` defers to the backend's own generator.
#[derive(Debug)]
pub enum NoiseGenerator {
    Seeded(Pcg32),
    Entropy,
}

impl NoiseGenerator {
    pub fn new(seed: Option<u64>) -> Self {
        match seed {
            Some(seed) => NoiseGenerator::Seeded(Pcg32::new(seed, 0)),
            None => NoiseGenerator::Entropy,
        }
    }

    pub fn randn(&mut self, shape: impl Into<Shape>, dtype: DType, device: &Device) -> Result<Tensor> {
        let shape = shape.into();
        match self {
            NoiseGenerator::Seeded(rng) => rng.randn(shape, device)?.to_dtype(dtype),
            NoiseGenerator::Entropy => Tensor::randn(0f32, 1.0, shape, device)?.to_dtype(dtype),
        }
    }

    pub fn randn_like(&mut self, t: &Tensor) -> Result<Tensor> {
        self.randn(t.shape().clone(), t.dtype(), t.device())
    }

    /// `n` integers drawn uniformly from `[low, high)`, as a U32 tensor
    pub fn randint(&mut self, low: u32, high: u32, n: usize, device: &Device) -> Result<Tensor> {
        match self {
            NoiseGenerator::Seeded(rng) => {
                let values: Vec<u32> = (0..n).map(|_| rng.next_below(low, high)).collect();
                Tensor::from_vec(values, n, device)
            }
            NoiseGenerator::Entropy => {
                let u = Tensor::rand(0f32, 1.0, n, &Device::Cpu)?.to_vec1::<f32>()?;
                let span = (high - low) as f32;
                let values: Vec<u32> = u
                    .into_iter()
                    .map(|x| low + ((x * span) as u32).min(high - low - 1))
                    .collect();
                Tensor::from_vec(values, n, device)
            }
        }
    }
}
