//! Token dispatch and combine for Expert Parallelism.
//!
//! - **Dispatch**: scatter token rows into a fixed-capacity buffer, one block of
//!   `capacity` rows per expert
//! - **Combine**: gather expert outputs back per token, weighted by the gate
//!
//! ## Data flow
//!
//! ```text
//! tokens [S, H] ──dispatch──▶ buffer [E * capacity, H] ──experts──▶ [E * capacity, H]
//!                                                               │
//! output [S, H] ◀──combine (mask, dest_idx, logits [S, E])──────┘
//! ```
//!
//! Payloads are promoted to F32 around the kernel calls and restored to the
//! caller's dtype afterwards.

use std::sync::Arc;

use candle_core::{DType, Tensor};
use tracing::debug;

use super::kernels::{CombineShape, DispatchShape, MoeKernels};
use super::routing::RoutingTable;
use crate::error::{MoeCommError, Result};
use crate::ops::Backward;

/// Backward context of [`moe_dispatch`].
pub struct DispatchContext {
    kernels: Arc<dyn MoeKernels>,
    routing: Arc<RoutingTable>,
    shape: DispatchShape,
    dtype: DType,
}

impl std::fmt::Debug for DispatchContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatchContext")
            .field("routing", &self.routing)
            .field("shape", &self.shape)
            .field("dtype", &self.dtype)
            .finish_non_exhaustive()
    }
}

impl DispatchContext {
    pub fn routing(&self) -> &RoutingTable {
        &self.routing
    }
}

/// Gradients returned by [`CombineContext::backward`].
#[derive(Debug)]
pub struct CombineGrads {
    /// `(capacity_total, H)` in the expert tokens' dtype.
    pub expert_tokens: Tensor,
    /// `(S, E)` F32, zero outside assigned slots.
    pub logits: Tensor,
}

/// Backward context of [`moe_combine`].
pub struct CombineContext {
    kernels: Arc<dyn MoeKernels>,
    routing: Arc<RoutingTable>,
    expert_tokens: Tensor,
    logits: Tensor,
    shape: CombineShape,
    dtype: DType,
}

impl std::fmt::Debug for CombineContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CombineContext")
            .field("routing", &self.routing)
            .field("shape", &self.shape)
            .field("dtype", &self.dtype)
            .finish_non_exhaustive()
    }
}

fn token_batch_dims(tokens: &Tensor) -> Result<(usize, usize)> {
    match *tokens.dims() {
        [s, h] => Ok((s, h)),
        _ => Err(MoeCommError::ShapeMismatch {
            expected: vec![0, 0],
            actual: tokens.dims().to_vec(),
        }),
    }
}

/// Route token rows into the capacity buffer.
///
/// # Arguments
/// * `tokens` - Token batch of shape `[S, H]`, any float dtype
/// * `mask` - Assignment mask of shape `[S]` or `[k, S]`
/// * `dest_idx` - Linear destination slots, same shape as `mask`
/// * `capacity_total` - Rows of the capacity buffer (`E * capacity`)
/// * `kernels` - Row-permutation kernel provider
///
/// # Returns
/// Buffer of shape `[capacity_total, H]` in the tokens' dtype; rows with no
/// assigned token are zero.
pub fn moe_dispatch(
    tokens: &Tensor,
    mask: &Tensor,
    dest_idx: &Tensor,
    capacity_total: usize,
    kernels: &Arc<dyn MoeKernels>,
) -> Result<(Tensor, DispatchContext)> {
    let (num_tokens, hidden_size) = token_batch_dims(tokens)?;
    let routing = Arc::new(RoutingTable::from_tensors(
        mask,
        dest_idx,
        num_tokens,
        capacity_total,
    )?);
    let shape = DispatchShape {
        num_tokens,
        capacity_total,
        hidden_size,
    };
    debug!(
        num_tokens,
        capacity_total,
        hidden_size,
        top_k = routing.top_k(),
        dropped = routing.dropped_tokens(),
        "moe_dispatch"
    );

    let dtype = tokens.dtype();
    let wide = tokens.to_dtype(DType::F32)?.contiguous()?;
    let buffer = kernels
        .dispatch_forward(&wide, &routing, shape)?
        .to_dtype(dtype)?;

    Ok((
        buffer,
        DispatchContext {
            kernels: Arc::clone(kernels),
            routing,
            shape,
            dtype,
        },
    ))
}

impl Backward for DispatchContext {
    type Grad = Tensor;

    /// `grad_output` is `[capacity_total, H]`; returns `[S, H]`.
    fn backward(self, grad_output: &Tensor) -> Result<Tensor> {
        let wide = grad_output.to_dtype(DType::F32)?.contiguous()?;
        Ok(self
            .kernels
            .dispatch_backward(&wide, &self.routing, self.shape)?
            .to_dtype(self.dtype)?)
    }

    fn release(self) {}
}

/// Combine expert outputs back into token order.
///
/// # Arguments
/// * `expert_tokens` - Expert outputs of shape `[capacity_total, H]`
/// * `logits` - Gate scores of shape `[S, E]`, must be F32
/// * `mask` - Assignment mask of shape `[S]` or `[k, S]`
/// * `dest_idx` - Linear destination slots, same shape as `mask`
/// * `kernels` - Row-permutation kernel provider
///
/// # Returns
/// `[S, H]` in the expert tokens' dtype, where row `i` is
/// `Σ_j logits[i][e_j] · expert_tokens[dest_idx[j][i]]` over assigned `j`.
pub fn moe_combine(
    expert_tokens: &Tensor,
    logits: &Tensor,
    mask: &Tensor,
    dest_idx: &Tensor,
    kernels: &Arc<dyn MoeKernels>,
) -> Result<(Tensor, CombineContext)> {
    if logits.dtype() != DType::F32 {
        return Err(MoeCommError::DTypeMismatch {
            expected: DType::F32,
            actual: logits.dtype(),
        });
    }
    let (capacity_total, hidden_size) = token_batch_dims(expert_tokens)?;
    let (num_tokens, num_experts) = token_batch_dims(logits)?;
    if num_experts == 0 {
        return Err(MoeCommError::InvalidGroupSize {
            what: "num_experts",
        });
    }
    if capacity_total % num_experts != 0 {
        return Err(MoeCommError::IndivisibleDimension {
            dim: 0,
            size: capacity_total,
            parts: num_experts,
        });
    }
    let routing = Arc::new(RoutingTable::from_tensors(
        mask,
        dest_idx,
        num_tokens,
        capacity_total,
    )?);
    let shape = CombineShape {
        num_tokens,
        num_experts,
        capacity: capacity_total / num_experts,
        hidden_size,
    };
    debug!(
        num_tokens,
        num_experts,
        capacity = shape.capacity,
        hidden_size,
        "moe_combine"
    );

    let dtype = expert_tokens.dtype();
    let wide = expert_tokens.to_dtype(DType::F32)?.contiguous()?;
    let logits = logits.contiguous()?;
    let output = kernels
        .combine_forward(&wide, &logits, &routing, shape)?
        .to_dtype(dtype)?;

    Ok((
        output,
        CombineContext {
            kernels: Arc::clone(kernels),
            routing,
            expert_tokens: wide,
            logits,
            shape,
            dtype,
        },
    ))
}

impl Backward for CombineContext {
    type Grad = CombineGrads;

    /// `grad_output` is `[S, H]`.
    fn backward(self, grad_output: &Tensor) -> Result<CombineGrads> {
        let wide = grad_output.to_dtype(DType::F32)?.contiguous()?;
        let (d_expert, d_logits) = self.kernels.combine_backward(
            &wide,
            &self.expert_tokens,
            &self.logits,
            &self.routing,
            self.shape,
        )?;
        Ok(CombineGrads {
            expert_tokens: d_expert.to_dtype(self.dtype)?,
            logits: d_logits,
        })
    }

    fn release(self) {}
}

/// Row counts for which the cumulative-sum kernel is used.
pub fn cumsum_kernel_supports(rows: usize) -> bool {
    rows <= 1024 || (rows <= 2048 && rows % 2 == 0) || rows % 4 == 0
}

/// Inclusive cumulative sum along axis 0 minus one, as I64.
///
/// Turns a one-hot assignment matrix `[S, E]` into each token's position inside
/// its expert's capacity block. The kernel path is taken when `use_kernel` is
/// set and the row count is supported; both paths agree exactly on integer
/// inputs.
pub fn moe_cumsum(inputs: &Tensor, use_kernel: bool, kernels: &dyn MoeKernels) -> Result<Tensor> {
    if inputs.rank() == 0 {
        return Err(MoeCommError::DimOutOfRange { dim: 0, rank: 0 });
    }
    let rows = inputs.dim(0)?;
    if use_kernel && cumsum_kernel_supports(rows) {
        return kernels.cumsum_sub_one(inputs);
    }
    Ok(inputs
        .to_dtype(DType::F64)?
        .cumsum(0)?
        .affine(1.0, -1.0)?
        .to_dtype(DType::I64)?)
}
