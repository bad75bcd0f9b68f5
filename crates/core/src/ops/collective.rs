//! Differentiable collectives.
//!
//! | forward          | backward                    |
//! |------------------|-----------------------------|
//! | all_gather       | reduce_scatter (sum)        |
//! | reduce_scatter   | all_gather                  |
//! | all_to_all       | all_to_all                  |
//! | all_to_all_uneven| all_to_all_uneven (swapped) |
//!
//! Single-rank groups never reach the transport.

use std::sync::Arc;

use candle_core::Tensor;

use super::{Backward, BackwardGuard};
use crate::distributed::{check_dim, CommHandle, DeviceCommunicator, ReduceOp};
use crate::error::{MoeCommError, Result};

/// Wait for an overlapped result. A failed exchange releases its context, so
/// the error reaches the caller instead of an armed guard.
fn complete<C: Backward>(handle: CommHandle, ctx: C) -> Result<(Tensor, C)> {
    match handle.wait() {
        Ok(output) => Ok((output, ctx)),
        Err(e) => {
            ctx.release();
            Err(e)
        }
    }
}

// ─── AllGather ───────────────────────────────────────────────────────────────

/// Backward context of [`all_gather`].
pub struct AllGatherContext {
    comm: Arc<dyn DeviceCommunicator>,
    guard: BackwardGuard,
}

/// Stack every rank's `input` along a new leading axis: `(world_size, ...)`.
pub fn all_gather(
    input: &Tensor,
    comm: &Arc<dyn DeviceCommunicator>,
) -> Result<(Tensor, AllGatherContext)> {
    let (handle, ctx) = all_gather_overlapped(input, comm)?;
    complete(handle, ctx)
}

/// Non-blocking [`all_gather`]; the output exists once the handle is waited.
pub fn all_gather_overlapped(
    input: &Tensor,
    comm: &Arc<dyn DeviceCommunicator>,
) -> Result<(CommHandle, AllGatherContext)> {
    let stacked = input.unsqueeze(0)?;
    let handle = if comm.world_size() == 1 {
        CommHandle::ready(Ok(stacked))
    } else {
        comm.all_gather_async(&stacked.contiguous()?, 0)?
    };
    let ctx = AllGatherContext {
        comm: Arc::clone(comm),
        guard: BackwardGuard::new("all_gather", comm.world_size()),
    };
    Ok((handle, ctx))
}

impl Backward for AllGatherContext {
    type Grad = Tensor;

    fn backward(mut self, grad_output: &Tensor) -> Result<Tensor> {
        self.guard.discharge();
        let (grad, ctx) = reduce_scatter(grad_output, &self.comm)?;
        ctx.release();
        Ok(grad)
    }

    fn release(mut self) {
        self.guard.discharge();
    }
}

// ─── ReduceScatter ───────────────────────────────────────────────────────────

/// Backward context of [`reduce_scatter`].
pub struct ReduceScatterContext {
    comm: Arc<dyn DeviceCommunicator>,
    guard: BackwardGuard,
}

impl std::fmt::Debug for ReduceScatterContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReduceScatterContext")
            .field("guard", &self.guard)
            .finish_non_exhaustive()
    }
}

/// Sum chunk `r` of the leading axis over all ranks and deliver it to rank `r`
/// with the leading axis removed. `input.dim(0)` must equal the world size.
pub fn reduce_scatter(
    input: &Tensor,
    comm: &Arc<dyn DeviceCommunicator>,
) -> Result<(Tensor, ReduceScatterContext)> {
    let (handle, ctx) = reduce_scatter_overlapped(input, comm)?;
    complete(handle, ctx)
}

/// Non-blocking [`reduce_scatter`].
pub fn reduce_scatter_overlapped(
    input: &Tensor,
    comm: &Arc<dyn DeviceCommunicator>,
) -> Result<(CommHandle, ReduceScatterContext)> {
    let world_size = comm.world_size();
    check_dim(input, 0)?;
    if input.dim(0)? != world_size {
        let mut expected = input.dims().to_vec();
        expected[0] = world_size;
        return Err(MoeCommError::ShapeMismatch {
            expected,
            actual: input.dims().to_vec(),
        });
    }

    let handle = if world_size == 1 {
        CommHandle::ready(Ok(input.squeeze(0)?))
    } else {
        comm.reduce_scatter_async(&input.contiguous()?, 0, ReduceOp::Sum)?
            .map(|t| Ok(t.squeeze(0)?))
    };
    let ctx = ReduceScatterContext {
        comm: Arc::clone(comm),
        guard: BackwardGuard::new("reduce_scatter", world_size),
    };
    Ok((handle, ctx))
}

impl Backward for ReduceScatterContext {
    type Grad = Tensor;

    fn backward(mut self, grad_output: &Tensor) -> Result<Tensor> {
        self.guard.discharge();
        let (grad, ctx) = all_gather(grad_output, &self.comm)?;
        ctx.release();
        Ok(grad)
    }

    fn release(mut self) {
        self.guard.discharge();
    }
}

// ─── AllToAll ────────────────────────────────────────────────────────────────

/// Backward context of [`all_to_all`].
pub struct AllToAllContext {
    comm: Arc<dyn DeviceCommunicator>,
    guard: BackwardGuard,
}

impl std::fmt::Debug for AllToAllContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AllToAllContext")
            .field("guard", &self.guard)
            .finish_non_exhaustive()
    }
}

/// Send row chunk `i` to rank `i`; the output has the input's shape.
pub fn all_to_all(
    input: &Tensor,
    comm: &Arc<dyn DeviceCommunicator>,
) -> Result<(Tensor, AllToAllContext)> {
    let (handle, ctx) = all_to_all_overlapped(input, comm)?;
    complete(handle, ctx)
}

/// Non-blocking [`all_to_all`].
pub fn all_to_all_overlapped(
    input: &Tensor,
    comm: &Arc<dyn DeviceCommunicator>,
) -> Result<(CommHandle, AllToAllContext)> {
    let world_size = comm.world_size();
    check_dim(input, 0)?;
    let handle = if world_size == 1 {
        CommHandle::ready(Ok(input.clone()))
    } else {
        let rows = input.dim(0)?;
        if rows % world_size != 0 {
            return Err(MoeCommError::IndivisibleDimension {
                dim: 0,
                size: rows,
                parts: world_size,
            });
        }
        comm.all_to_all_async(&input.contiguous()?)?
    };
    let ctx = AllToAllContext {
        comm: Arc::clone(comm),
        guard: BackwardGuard::new("all_to_all", world_size),
    };
    Ok((handle, ctx))
}

impl Backward for AllToAllContext {
    type Grad = Tensor;

    fn backward(mut self, grad_output: &Tensor) -> Result<Tensor> {
        self.guard.discharge();
        let (grad, ctx) = all_to_all(grad_output, &self.comm)?;
        ctx.release();
        Ok(grad)
    }

    fn release(mut self) {
        self.guard.discharge();
    }
}

// ─── AllToAllUneven ──────────────────────────────────────────────────────────

/// Backward context of [`all_to_all_uneven`]; holds both split lists.
pub struct AllToAllUnevenContext {
    comm: Arc<dyn DeviceCommunicator>,
    input_split_sizes: Vec<usize>,
    output_split_sizes: Vec<usize>,
    guard: BackwardGuard,
}

impl std::fmt::Debug for AllToAllUnevenContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AllToAllUnevenContext")
            .field("input_split_sizes", &self.input_split_sizes)
            .field("output_split_sizes", &self.output_split_sizes)
            .field("guard", &self.guard)
            .finish_non_exhaustive()
    }
}

/// Send `input_split_sizes[i]` consecutive rows to rank `i` and receive
/// `output_split_sizes[j]` rows from rank `j`.
pub fn all_to_all_uneven(
    input: &Tensor,
    input_split_sizes: &[usize],
    output_split_sizes: &[usize],
    comm: &Arc<dyn DeviceCommunicator>,
) -> Result<(Tensor, AllToAllUnevenContext)> {
    let (handle, ctx) =
        all_to_all_uneven_overlapped(input, input_split_sizes, output_split_sizes, comm)?;
    complete(handle, ctx)
}

/// Non-blocking [`all_to_all_uneven`].
pub fn all_to_all_uneven_overlapped(
    input: &Tensor,
    input_split_sizes: &[usize],
    output_split_sizes: &[usize],
    comm: &Arc<dyn DeviceCommunicator>,
) -> Result<(CommHandle, AllToAllUnevenContext)> {
    let world_size = comm.world_size();
    validate_uneven(input, input_split_sizes, output_split_sizes, world_size)?;

    let handle = if world_size == 1 {
        CommHandle::ready(Ok(input.clone()))
    } else {
        comm.all_to_all_v_async(&input.contiguous()?, input_split_sizes, output_split_sizes)?
    };
    let ctx = AllToAllUnevenContext {
        comm: Arc::clone(comm),
        input_split_sizes: input_split_sizes.to_vec(),
        output_split_sizes: output_split_sizes.to_vec(),
        guard: BackwardGuard::new("all_to_all_uneven", world_size),
    };
    Ok((handle, ctx))
}

fn validate_uneven(
    input: &Tensor,
    input_split_sizes: &[usize],
    output_split_sizes: &[usize],
    world_size: usize,
) -> Result<()> {
    check_dim(input, 0)?;
    for splits in [input_split_sizes, output_split_sizes] {
        if splits.len() != world_size {
            return Err(MoeCommError::InvalidSplitCount {
                expected: world_size,
                actual: splits.len(),
            });
        }
    }
    let rows = input.dim(0)?;
    let sent: usize = input_split_sizes.iter().sum();
    if sent != rows {
        return Err(MoeCommError::SplitSizeMismatch {
            expected: rows,
            actual: sent,
        });
    }
    // A lone rank can only receive what it sends itself.
    if world_size == 1 && output_split_sizes[0] != rows {
        return Err(MoeCommError::SplitSizeMismatch {
            expected: rows,
            actual: output_split_sizes[0],
        });
    }
    Ok(())
}

impl AllToAllUnevenContext {
    pub fn input_split_sizes(&self) -> &[usize] {
        &self.input_split_sizes
    }

    pub fn output_split_sizes(&self) -> &[usize] {
        &self.output_split_sizes
    }
}

impl Backward for AllToAllUnevenContext {
    type Grad = Tensor;

    fn backward(mut self, grad_output: &Tensor) -> Result<Tensor> {
        self.guard.discharge();
        let (grad, ctx) = all_to_all_uneven(
            grad_output,
            &self.output_split_sizes,
            &self.input_split_sizes,
            &self.comm,
        )?;
        ctx.release();
        Ok(grad)
    }

    fn release(mut self) {
        self.guard.discharge();
    }
}
