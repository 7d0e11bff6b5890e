//! Tensor-parallel linear layers
//!
//! A column-parallel layer keeps `out_features / N` rows of the weight, a
//! row-parallel layer keeps `in_features / N` columns. Chained as
//! column -> row they need a single all-reduce per pair.

use super::{ProcessGroup, copy_to_parallel_region, reduce_from_parallel_region};
use candle_core::{Module, Result, Tensor, bail};
use candle_nn::{Linear, VarBuilder, init};

/// Linear layer sharded along the output dimension
#[derive(Debug, Clone)]
pub struct ColumnParallelLinear {
    linear: Linear,
    group: ProcessGroup,
}

impl ColumnParallelLinear {
    pub fn new(
        in_features: usize,
        out_features: usize,
        bias: bool,
        vb: VarBuilder,
        group: &ProcessGroup,
    ) -> Result<Self> {
        let world = group.size();
        if !out_features.is_multiple_of(world) {
            bail!("column parallel: {out_features} output features not divisible by {world}")
        }
        let linear = candle_nn::linear_b(in_features, out_features / world, bias, vb)?;
        Ok(Self {
            linear,
            group: group.clone(),
        })
    }

    pub fn local_out_features(&self) -> usize {
        self.linear.weight().dim(0).unwrap_or(0)
    }
}

impl Module for ColumnParallelLinear {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let x = copy_to_parallel_region(x, &self.group)?;
        self.linear.forward(&x)
    }
}

/// Linear layer sharded along the input dimension
///
/// Expects the input already split along its last dim (the output of a
/// [`ColumnParallelLinear`]). The bias is added once, after the reduction.
#[derive(Debug, Clone)]
pub struct RowParallelLinear {
    weight: Tensor,
    bias: Option<Tensor>,
    group: ProcessGroup,
}

impl RowParallelLinear {
    pub fn new(
        in_features: usize,
        out_features: usize,
        bias: bool,
        vb: VarBuilder,
        group: &ProcessGroup,
    ) -> Result<Self> {
        let world = group.size();
        if !in_features.is_multiple_of(world) {
            bail!("row parallel: {in_features} input features not divisible by {world}")
        }
        let local_in = in_features / world;
        let bound = 1.0 / (in_features as f64).sqrt();
        let weight = vb.get_with_hints(
            (out_features, local_in),
            "weight",
            init::Init::Uniform {
                lo: -bound,
                up: bound,
            },
        )?;
        let bias = if bias {
            Some(vb.get_with_hints(
                out_features,
                "bias",
                init::Init::Uniform {
                    lo: -bound,
                    up: bound,
                },
            )?)
        } else {
            None
        };
        Ok(Self {
            weight,
            bias,
            group: group.clone(),
        })
    }
}

impl Module for RowParallelLinear {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let partial = x.broadcast_matmul(&self.weight.t()?)?;
        let y = reduce_from_parallel_region(&partial, &self.group)?;
        match &self.bias {
            Some(bias) => y.broadcast_add(bias),
            None => Ok(y),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parallel::LocalCommunicator;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_single_rank_matches_dense() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let group = ProcessGroup::single();
        let col = ColumnParallelLinear::new(8, 16, true, vb.pp("fc1"), &group)?;
        let row = RowParallelLinear::new(16, 8, true, vb.pp("fc2"), &group)?;

        let x = Tensor::randn(0f32, 1.0, (2, 3, 8), &device)?;
        let y = row.forward(&col.forward(&x)?)?;
        assert_eq!(y.dims(), &[2, 3, 8]);

        let data = varmap.data().lock().unwrap();
        let w1 = data["fc1.weight"].as_tensor();
        let b1 = data["fc1.bias"].as_tensor();
        let w2 = data["fc2.weight"].as_tensor();
        let b2 = data["fc2.bias"].as_tensor();
        let h = x.broadcast_matmul(&w1.t()?)?.broadcast_add(b1)?;
        let expected = h.broadcast_matmul(&w2.t()?)?.broadcast_add(b2)?;
        let diff = (y - expected)?.abs()?.max_all()?.to_scalar::<f32>()?;
        assert!(diff < 1e-5, "diff {diff}");
        Ok(())
    }

    #[test]
    fn test_indivisible_features_rejected() {
        let handles: Vec<_> = LocalCommunicator::group(3)
            .into_iter()
            .map(|comm| {
                thread::spawn(move || {
                    let varmap = VarMap::new();
                    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
                    let group = ProcessGroup::new(Arc::new(comm));
                    ColumnParallelLinear::new(4, 8, false, vb, &group).is_err()
                })
            })
            .collect();
        for h in handles {
            assert!(h.join().unwrap());
        }
    }
}
