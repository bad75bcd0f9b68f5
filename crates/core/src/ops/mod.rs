//! Differentiable communication operators.
//!
//! Every operator is a forward function returning `(output, context)`. The
//! context is consumed by [`Backward::backward`], which computes the exact
//! adjoint of the forward, or discharged by [`Backward::release`] on
//! forward-only passes.
//!
//! ## Submodules
//!
//! - [`collective`]: all-gather, reduce-scatter, all-to-all (equal and uneven)
//! - [`hierarchical`]: two-level all-to-all through one designated rank per group
//! - [`grad_scaler`]: identity-forward operators that rescale gradients
//! - [`tensor_parallel`]: gather/drop token shards across a tensor-parallel group

pub mod collective;
pub mod grad_scaler;
pub mod hierarchical;
pub mod tensor_parallel;

pub use collective::{
    all_gather, all_gather_overlapped, all_to_all, all_to_all_overlapped, all_to_all_uneven,
    all_to_all_uneven_overlapped, reduce_scatter, reduce_scatter_overlapped, AllGatherContext,
    AllToAllContext, AllToAllUnevenContext, ReduceScatterContext,
};
pub use grad_scaler::{
    dp_grad_scaler_in, dp_grad_scaler_out, ep_grad_scaler_in, ep_grad_scaler_out,
    GradScaleContext, GradScaleKind,
};
pub use hierarchical::{hierarchical_all_to_all, HierarchicalAllToAllContext, HierarchicalGroups};
pub use tensor_parallel::{drop_tokens, gather_tokens, DropTokensContext, GatherTokensContext};

use candle_core::Tensor;
use tracing::error;

use crate::error::Result;

/// Backward half of a paired operation.
pub trait Backward {
    /// Gradient(s) returned to the forward inputs.
    type Grad;

    /// Run the adjoint of the forward call that produced this context.
    fn backward(self, grad_output: &Tensor) -> Result<Self::Grad>;

    /// Discard the context without running backward.
    ///
    /// Every rank of the group must make the same choice.
    fn release(self);
}

/// Obligation carried by contexts whose backward communicates.
///
/// Dropping an armed guard means this rank will never join the backward
/// collective its peers are about to issue.
#[derive(Debug)]
pub(crate) struct BackwardGuard {
    op: &'static str,
    world_size: usize,
    armed: bool,
}

impl BackwardGuard {
    pub(crate) fn new(op: &'static str, world_size: usize) -> Self {
        Self {
            op,
            world_size,
            armed: world_size > 1,
        }
    }

    pub(crate) fn discharge(&mut self) {
        self.armed = false;
    }
}

impl Drop for BackwardGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        error!(
            op = self.op,
            world_size = self.world_size,
            "context dropped without backward or release; peers will block in the backward collective"
        );
        if cfg!(debug_assertions) && !std::thread::panicking() {
            panic!(
                "{} context dropped without backward or release in a group of {} ranks",
                self.op, self.world_size
            );
        }
    }
}
