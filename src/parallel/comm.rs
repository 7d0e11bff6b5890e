//! Split / gather collectives, plain and autograd-aware
//!
//! The autograd-aware variants are `CustomOp1`s whose backward runs the
//! mirrored collective, so a split followed by a gather is the identity in
//! both directions. The op body runs on host memory; tensors on other devices
//! are staged through the CPU with differentiable `to_device` calls.

use super::ProcessGroup;
use candle_core::{
    CpuStorage, CustomOp1, DType, Device, Layout, Result, Shape, Tensor, WithDType, bail,
};

/// Gradient rescaling applied before the backward collective
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GradScale {
    /// Multiply by the group size
    Up,
    /// Divide by the group size
    Down,
    #[default]
    None,
}

impl GradScale {
    fn apply(self, grad: &Tensor, size: usize) -> Result<Tensor> {
        match self {
            GradScale::Up => grad.affine(size as f64, 0.0),
            GradScale::Down => grad.affine(1.0 / size as f64, 0.0),
            GradScale::None => Ok(grad.clone()),
        }
    }
}

// =============================================================================
// Plain collectives
// =============================================================================

fn chunk_size(tensor: &Tensor, group: &ProcessGroup, dim: usize, op: &str) -> Result<usize> {
    let len = tensor.dim(dim)?;
    let size = group.size();
    if !len.is_multiple_of(size) {
        bail!("{op}: dim {dim} of size {len} is not divisible by group size {size}")
    }
    Ok(len / size)
}

/// Keep this rank's contiguous piece of `tensor` along `dim`
pub fn split(tensor: &Tensor, group: &ProcessGroup, dim: usize) -> Result<Tensor> {
    if group.size() == 1 {
        return Ok(tensor.clone());
    }
    let chunk = chunk_size(tensor, group, dim, "split")?;
    tensor.narrow(dim, group.rank() * chunk, chunk)?.contiguous()
}

/// Collect `tensor` from every rank, ordered by rank
pub fn all_gather(tensor: &Tensor, group: &ProcessGroup) -> Result<Vec<Tensor>> {
    group.communicator().all_gather(&tensor.contiguous()?)
}

/// All-gather and concatenate along `dim` in rank order
pub fn gather(tensor: &Tensor, group: &ProcessGroup, dim: usize) -> Result<Tensor> {
    if group.size() == 1 {
        return Ok(tensor.clone());
    }
    let parts = all_gather(tensor, group)?;
    Tensor::cat(&parts, dim)
}

pub fn all_reduce_sum(tensor: &Tensor, group: &ProcessGroup) -> Result<Tensor> {
    if group.size() == 1 {
        return Ok(tensor.clone());
    }
    let parts = all_gather(tensor, group)?;
    let mut acc = parts[0].clone();
    for part in &parts[1..] {
        acc = (acc + part)?;
    }
    Ok(acc)
}

/// Scatter `scatter_dim` across ranks while gathering `gather_dim`
///
/// Rank `r` receives piece `r` of every rank's `scatter_dim`, concatenated
/// along `gather_dim` in source-rank order.
pub fn all_to_all(
    tensor: &Tensor,
    group: &ProcessGroup,
    scatter_dim: usize,
    gather_dim: usize,
) -> Result<Tensor> {
    if group.size() == 1 {
        return Ok(tensor.clone());
    }
    let chunk = chunk_size(tensor, group, scatter_dim, "all_to_all")?;
    let rank = group.rank();
    let pieces = all_gather(tensor, group)?
        .iter()
        .map(|part| part.narrow(scatter_dim, rank * chunk, chunk))
        .collect::<Result<Vec<_>>>()?;
    Tensor::cat(&pieces, gather_dim)
}

// =============================================================================
// Autograd-aware collectives
// =============================================================================

#[derive(Debug, Clone, Copy)]
enum Collective {
    Split { dim: usize },
    Gather { dim: usize },
    AllToAll { scatter_dim: usize, gather_dim: usize },
    CopyToRegion,
    ReduceFromRegion,
}

struct CollectiveOp {
    kind: Collective,
    grad_scale: GradScale,
    group: ProcessGroup,
}

impl CollectiveOp {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        match self.kind {
            Collective::Split { dim } => split(x, &self.group, dim),
            Collective::Gather { dim } => gather(x, &self.group, dim),
            Collective::AllToAll {
                scatter_dim,
                gather_dim,
            } => all_to_all(x, &self.group, scatter_dim, gather_dim),
            Collective::CopyToRegion => Ok(x.clone()),
            Collective::ReduceFromRegion => all_reduce_sum(x, &self.group),
        }
    }

    fn backward(&self, grad: &Tensor) -> Result<Tensor> {
        let grad = self.grad_scale.apply(grad, self.group.size())?;
        match self.kind {
            Collective::Split { dim } => gather(&grad, &self.group, dim),
            Collective::Gather { dim } => split(&grad, &self.group, dim),
            Collective::AllToAll {
                scatter_dim,
                gather_dim,
            } => all_to_all(&grad, &self.group, gather_dim, scatter_dim),
            Collective::CopyToRegion => all_reduce_sum(&grad, &self.group),
            Collective::ReduceFromRegion => Ok(grad),
        }
    }
}

impl CustomOp1 for CollectiveOp {
    fn name(&self) -> &'static str {
        match self.kind {
            Collective::Split { .. } => "split-forward-gather-backward",
            Collective::Gather { .. } => "gather-forward-split-backward",
            Collective::AllToAll { .. } => "all-to-all",
            Collective::CopyToRegion => "copy-to-parallel-region",
            Collective::ReduceFromRegion => "reduce-from-parallel-region",
        }
    }

    fn cpu_fwd(&self, storage: &CpuStorage, layout: &Layout) -> Result<(CpuStorage, Shape)> {
        let input = storage_to_tensor(storage, layout)?;
        let output = self.forward(&input)?;
        let shape = output.shape().clone();
        Ok((tensor_to_storage(&output)?, shape))
    }

    fn bwd(&self, _arg: &Tensor, _res: &Tensor, grad_res: &Tensor) -> Result<Option<Tensor>> {
        self.backward(grad_res).map(Some)
    }
}

fn storage_to_tensor(storage: &CpuStorage, layout: &Layout) -> Result<Tensor> {
    fn collect<T: WithDType>(data: &[T], layout: &Layout) -> Result<Tensor> {
        match layout.contiguous_offsets() {
            Some((start, end)) => {
                Tensor::from_vec(data[start..end].to_vec(), layout.shape(), &Device::Cpu)
            }
            None => bail!("collective: input is not contiguous"),
        }
    }
    match storage {
        CpuStorage::U8(data) => collect(data, layout),
        CpuStorage::U32(data) => collect(data, layout),
        CpuStorage::I64(data) => collect(data, layout),
        CpuStorage::BF16(data) => collect(data, layout),
        CpuStorage::F16(data) => collect(data, layout),
        CpuStorage::F32(data) => collect(data, layout),
        CpuStorage::F64(data) => collect(data, layout),
        #[allow(unreachable_patterns)]
        _ => bail!("collective: unsupported storage dtype"),
    }
}

fn tensor_to_storage(tensor: &Tensor) -> Result<CpuStorage> {
    let flat = tensor.flatten_all()?;
    Ok(match tensor.dtype() {
        DType::U8 => CpuStorage::U8(flat.to_vec1()?),
        DType::U32 => CpuStorage::U32(flat.to_vec1()?),
        DType::I64 => CpuStorage::I64(flat.to_vec1()?),
        DType::BF16 => CpuStorage::BF16(flat.to_vec1()?),
        DType::F16 => CpuStorage::F16(flat.to_vec1()?),
        DType::F32 => CpuStorage::F32(flat.to_vec1()?),
        DType::F64 => CpuStorage::F64(flat.to_vec1()?),
        dtype => bail!("collective: unsupported dtype {dtype:?}"),
    })
}

/// Collectives run on contiguous CPU copies of their input
fn apply_collective(x: &Tensor, op: CollectiveOp) -> Result<Tensor> {
    match x.device() {
        Device::Cpu => x.contiguous()?.apply_op1(op),
        device => {
            let device = device.clone();
            x.to_device(&Device::Cpu)?
                .contiguous()?
                .apply_op1(op)?
                .to_device(&device)
        }
    }
}

/// Split along `dim` in the forward pass, gather in the backward pass
pub fn split_forward_gather_backward(
    x: &Tensor,
    group: &ProcessGroup,
    dim: usize,
    grad_scale: GradScale,
) -> Result<Tensor> {
    if group.size() == 1 {
        return Ok(x.clone());
    }
    let op = CollectiveOp {
        kind: Collective::Split { dim },
        grad_scale,
        group: group.clone(),
    };
    apply_collective(x, op)
}

/// Gather along `dim` in the forward pass, split in the backward pass
pub fn gather_forward_split_backward(
    x: &Tensor,
    group: &ProcessGroup,
    dim: usize,
    grad_scale: GradScale,
) -> Result<Tensor> {
    if group.size() == 1 {
        return Ok(x.clone());
    }
    let op = CollectiveOp {
        kind: Collective::Gather { dim },
        grad_scale,
        group: group.clone(),
    };
    apply_collective(x, op)
}

/// Differentiable [`all_to_all`]; the backward pass swaps the two dims
pub fn all_to_all_autograd(
    x: &Tensor,
    group: &ProcessGroup,
    scatter_dim: usize,
    gather_dim: usize,
) -> Result<Tensor> {
    if group.size() == 1 {
        return Ok(x.clone());
    }
    let op = CollectiveOp {
        kind: Collective::AllToAll {
            scatter_dim,
            gather_dim,
        },
        grad_scale: GradScale::None,
        group: group.clone(),
    };
    apply_collective(x, op)
}

/// Identity forward, all-reduce of the gradient backward
pub fn copy_to_parallel_region(x: &Tensor, group: &ProcessGroup) -> Result<Tensor> {
    if group.size() == 1 {
        return Ok(x.clone());
    }
    let op = CollectiveOp {
        kind: Collective::CopyToRegion,
        grad_scale: GradScale::None,
        group: group.clone(),
    };
    apply_collective(x, op)
}

/// All-reduce forward, identity backward
pub fn reduce_from_parallel_region(x: &Tensor, group: &ProcessGroup) -> Result<Tensor> {
    if group.size() == 1 {
        return Ok(x.clone());
    }
    let op = CollectiveOp {
        kind: Collective::ReduceFromRegion,
        grad_scale: GradScale::None,
        group: group.clone(),
    };
    apply_collective(x, op)
}
