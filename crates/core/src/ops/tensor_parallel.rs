//! Token sharding across a tensor-parallel group.
//!
//! `gather_tokens` and `drop_tokens` are each other's adjoint: gathering
//! concatenates every rank's shard along `dim`, dropping keeps this rank's
//! contiguous chunk.

use std::sync::Arc;

use candle_core::Tensor;

use super::{Backward, BackwardGuard};
use crate::distributed::{check_dim, DeviceCommunicator};
use crate::error::Result;

/// Backward context of [`gather_tokens`]. Its backward is local.
pub struct GatherTokensContext {
    dim: usize,
    comm: Arc<dyn DeviceCommunicator>,
}

impl std::fmt::Debug for GatherTokensContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatherTokensContext")
            .field("dim", &self.dim)
            .finish_non_exhaustive()
    }
}

/// Backward context of [`drop_tokens`]. Its backward is an all-gather.
pub struct DropTokensContext {
    dim: usize,
    comm: Arc<dyn DeviceCommunicator>,
    guard: BackwardGuard,
}

impl std::fmt::Debug for DropTokensContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DropTokensContext")
            .field("dim", &self.dim)
            .field("guard", &self.guard)
            .finish_non_exhaustive()
    }
}

fn gather_along(x: &Tensor, dim: usize, comm: &Arc<dyn DeviceCommunicator>) -> Result<Tensor> {
    check_dim(x, dim)?;
    if comm.world_size() == 1 {
        return Ok(x.clone());
    }
    comm.all_gather(&x.contiguous()?, dim)
}

fn drop_along(x: &Tensor, dim: usize, comm: &Arc<dyn DeviceCommunicator>) -> Result<Tensor> {
    check_dim(x, dim)?;
    let world_size = comm.world_size();
    if world_size == 1 {
        return Ok(x.clone());
    }
    let range = comm.process_group().shard_range(dim, x.dim(dim)?)?;
    Ok(x.narrow(dim, range.start, range.len())?.contiguous()?)
}

/// Concatenate every rank's `x` along `dim` in rank order.
pub fn gather_tokens(
    x: &Tensor,
    dim: usize,
    comm: &Arc<dyn DeviceCommunicator>,
) -> Result<(Tensor, GatherTokensContext)> {
    let output = gather_along(x, dim, comm)?;
    Ok((
        output,
        GatherTokensContext {
            dim,
            comm: Arc::clone(comm),
        },
    ))
}

/// Keep this rank's contiguous chunk of `x` along `dim`.
pub fn drop_tokens(
    x: &Tensor,
    dim: usize,
    comm: &Arc<dyn DeviceCommunicator>,
) -> Result<(Tensor, DropTokensContext)> {
    let output = drop_along(x, dim, comm)?;
    Ok((
        output,
        DropTokensContext {
            dim,
            comm: Arc::clone(comm),
            guard: BackwardGuard::new("drop_tokens", comm.world_size()),
        },
    ))
}

impl Backward for GatherTokensContext {
    type Grad = Tensor;

    fn backward(self, grad_output: &Tensor) -> Result<Tensor> {
        drop_along(grad_output, self.dim, &self.comm)
    }

    fn release(self) {}
}

impl Backward for DropTokensContext {
    type Grad = Tensor;

    fn backward(mut self, grad_output: &Tensor) -> Result<Tensor> {
        self.guard.discharge();
        gather_along(grad_output, self.dim, &self.comm)
    }

    fn release(mut self) {
        self.guard.discharge();
    }
}
