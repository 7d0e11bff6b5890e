//! Parallel execution context and collective communication
//!
//! Two process groups matter to the model:
//! - **tensor**: shards individual weight matrices (column/row parallel linears)
//! - **context**: shards the token sequence (temporal dim in the sampler,
//!   spatial tokens inside the predictor)
//!
//! Groups are immutable after construction and passed explicitly; nothing in
//! the crate reads a global parallel state.

mod comm;
mod layers;
mod local;

pub use comm::{
    GradScale, all_gather, all_reduce_sum, all_to_all, all_to_all_autograd,
    copy_to_parallel_region, gather, gather_forward_split_backward, reduce_from_parallel_region,
    split, split_forward_gather_backward,
};
pub use layers::{ColumnParallelLinear, RowParallelLinear};
pub use local::LocalCommunicator;

use candle_core::{Result, Tensor};
use std::sync::Arc;

/// Collective backend for one rank of a process group
///
/// `all_gather` is the only required collective; the others are derived from
/// it. Every rank of a group must issue the same sequence of collectives.
pub trait Communicator: Send + Sync + std::fmt::Debug {
    fn rank(&self) -> usize;

    fn size(&self) -> usize;

    /// Collect `tensor` from every rank, ordered by rank
    fn all_gather(&self, tensor: &Tensor) -> Result<Vec<Tensor>>;
}

/// Communicator for a group of one
#[derive(Debug, Clone, Copy, Default)]
pub struct SingleProcess;

impl Communicator for SingleProcess {
    fn rank(&self) -> usize {
        0
    }

    fn size(&self) -> usize {
        1
    }

    fn all_gather(&self, tensor: &Tensor) -> Result<Vec<Tensor>> {
        Ok(vec![tensor.clone()])
    }
}

/// A logical group of ranks and this process's position in it
#[derive(Debug, Clone)]
pub struct ProcessGroup {
    comm: Arc<dyn Communicator>,
}

impl ProcessGroup {
    pub fn new(comm: Arc<dyn Communicator>) -> Self {
        Self { comm }
    }

    pub fn single() -> Self {
        Self::new(Arc::new(SingleProcess))
    }

    pub fn rank(&self) -> usize {
        self.comm.rank()
    }

    pub fn size(&self) -> usize {
        self.comm.size()
    }

    pub fn is_distributed(&self) -> bool {
        self.size() > 1
    }

    pub fn communicator(&self) -> &Arc<dyn Communicator> {
        &self.comm
    }
}

impl Default for ProcessGroup {
    fn default() -> Self {
        Self::single()
    }
}

/// Process groups used by one rank
#[derive(Debug, Clone, Default)]
pub struct ParallelContext {
    pub tensor: ProcessGroup,
    pub context: ProcessGroup,
}

impl ParallelContext {
    pub fn new(tensor: ProcessGroup, context: ProcessGroup) -> Self {
        Self { tensor, context }
    }

    pub fn single() -> Self {
        Self::default()
    }

    pub fn with_tensor(mut self, tensor: ProcessGroup) -> Self {
        self.tensor = tensor;
        self
    }

    pub fn with_context(mut self, context: ProcessGroup) -> Self {
        self.context = context;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_context() {
        let ctx = ParallelContext::single();
        assert_eq!(ctx.tensor.size(), 1);
        assert_eq!(ctx.context.rank(), 0);
        assert!(!ctx.context.is_distributed());
    }
}
