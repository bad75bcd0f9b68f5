//! Expert-parallel token exchange.
//!
//! Composes the pieces of one MoE layer's communication:
//!
//! ```text
//! dispatch:  moe_dispatch ─▶ all_to_all (flat | hierarchical) ─▶ ep_grad_scaler_in
//! combine:   ep_grad_scaler_out ─▶ all_to_all (flat | hierarchical) ─▶ moe_combine
//! ```
//!
//! Each direction returns one composite context whose backward runs the stages
//! in reverse.

use std::sync::Arc;

use candle_core::Tensor;
use tracing::debug;

use super::kernels::MoeKernels;
use super::token_dispatch::{moe_combine, moe_dispatch, CombineContext, CombineGrads, DispatchContext};
use crate::distributed::{CommHandle, DeviceCommunicator};
use crate::error::{MoeCommError, Result};
use crate::ops::{
    all_to_all, all_to_all_overlapped, ep_grad_scaler_in, ep_grad_scaler_out,
    hierarchical_all_to_all, AllToAllContext, Backward, GradScaleContext,
    HierarchicalAllToAllContext, HierarchicalGroups,
};

/// How capacity buffers travel between expert-parallel ranks.
#[derive(Clone)]
pub enum ExchangeTopology {
    /// One all-to-all over the whole expert-parallel group.
    Flat(Arc<dyn DeviceCommunicator>),
    /// Intra-group gather/scatter through a designated rank per group.
    Hierarchical(HierarchicalGroups),
}

impl ExchangeTopology {
    /// Number of expert-parallel ranks the buffer is split across.
    fn ep_size(&self) -> usize {
        match self {
            ExchangeTopology::Flat(comm) => comm.world_size(),
            ExchangeTopology::Hierarchical(groups) => groups.total_ranks(),
        }
    }
}

enum StageContext {
    Flat(AllToAllContext),
    Hierarchical(HierarchicalAllToAllContext),
}

/// Keep `value` only if the following step succeeded; otherwise release the
/// communicating stage before the error propagates.
fn after_stage<T>(stage: StageContext, next: Result<T>) -> Result<(T, StageContext)> {
    match next {
        Ok(value) => Ok((value, stage)),
        Err(e) => {
            stage.release();
            Err(e)
        }
    }
}

impl Backward for StageContext {
    type Grad = Tensor;

    fn backward(self, grad_output: &Tensor) -> Result<Tensor> {
        match self {
            StageContext::Flat(ctx) => ctx.backward(grad_output),
            StageContext::Hierarchical(ctx) => ctx.backward(grad_output),
        }
    }

    fn release(self) {
        match self {
            StageContext::Flat(ctx) => ctx.release(),
            StageContext::Hierarchical(ctx) => ctx.release(),
        }
    }
}

/// Backward context of [`ExpertParallelExchange::dispatch`].
pub struct ExchangeDispatchContext {
    dispatch: DispatchContext,
    exchange: StageContext,
    scale: GradScaleContext,
}

impl std::fmt::Debug for ExchangeDispatchContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExchangeDispatchContext")
            .field("dispatch", &self.dispatch)
            .finish_non_exhaustive()
    }
}

/// Backward context of [`ExpertParallelExchange::combine`].
pub struct ExchangeCombineContext {
    scale: GradScaleContext,
    exchange: StageContext,
    combine: CombineContext,
}

/// Moves capacity buffers to the ranks hosting their experts and back.
///
/// Expert `e` of `E` lives on rank `e / (E / ep_size)`, so the capacity buffer
/// of every rank is split into `ep_size` equal row blocks.
pub struct ExpertParallelExchange {
    topology: ExchangeTopology,
    kernels: Arc<dyn MoeKernels>,
    ep_size: usize,
}

impl ExpertParallelExchange {
    pub fn new(topology: ExchangeTopology, kernels: Arc<dyn MoeKernels>) -> Self {
        let ep_size = topology.ep_size();
        Self {
            topology,
            kernels,
            ep_size,
        }
    }

    pub fn ep_size(&self) -> usize {
        self.ep_size
    }

    pub fn kernels(&self) -> &Arc<dyn MoeKernels> {
        &self.kernels
    }

    fn check_capacity(&self, capacity_total: usize) -> Result<()> {
        if self.ep_size == 0 {
            return Err(MoeCommError::InvalidGroupSize { what: "ep_size" });
        }
        if capacity_total % self.ep_size != 0 {
            return Err(MoeCommError::IndivisibleDimension {
                dim: 0,
                size: capacity_total,
                parts: self.ep_size,
            });
        }
        Ok(())
    }

    fn exchange(&self, buffer: &Tensor) -> Result<(Tensor, StageContext)> {
        match &self.topology {
            ExchangeTopology::Flat(comm) => {
                let (out, ctx) = all_to_all(buffer, comm)?;
                Ok((out, StageContext::Flat(ctx)))
            }
            ExchangeTopology::Hierarchical(groups) => {
                let (out, ctx) = hierarchical_all_to_all(buffer, groups)?;
                Ok((out, StageContext::Hierarchical(ctx)))
            }
        }
    }

    /// Route `tokens` into capacity buffers and deliver each block to the rank
    /// hosting its experts.
    ///
    /// Returns `[capacity_total, H]`: `ep_size` blocks, block `r` holding the
    /// rows rank `r` routed to this rank's experts.
    pub fn dispatch(
        &self,
        tokens: &Tensor,
        mask: &Tensor,
        dest_idx: &Tensor,
        capacity_total: usize,
    ) -> Result<(Tensor, ExchangeDispatchContext)> {
        self.check_capacity(capacity_total)?;
        let (buffer, dispatch) = moe_dispatch(tokens, mask, dest_idx, capacity_total, &self.kernels)?;
        let (received, exchange) = self.exchange(&buffer)?;
        let ((output, scale), exchange) =
            after_stage(exchange, ep_grad_scaler_in(&received, self.ep_size))?;
        debug!(ep_size = self.ep_size, rows = capacity_total, "ep dispatch");
        Ok((
            output,
            ExchangeDispatchContext {
                dispatch,
                exchange,
                scale,
            },
        ))
    }

    /// Non-blocking [`dispatch`](Self::dispatch).
    ///
    /// Only the flat topology overlaps; the hierarchical exchange completes
    /// before this returns.
    pub fn dispatch_overlapped(
        &self,
        tokens: &Tensor,
        mask: &Tensor,
        dest_idx: &Tensor,
        capacity_total: usize,
    ) -> Result<(CommHandle, ExchangeDispatchContext)> {
        let ExchangeTopology::Flat(comm) = &self.topology else {
            let (output, ctx) = self.dispatch(tokens, mask, dest_idx, capacity_total)?;
            return Ok((CommHandle::ready(Ok(output)), ctx));
        };
        self.check_capacity(capacity_total)?;
        let (buffer, dispatch) = moe_dispatch(tokens, mask, dest_idx, capacity_total, &self.kernels)?;
        let (handle, exchange) = all_to_all_overlapped(&buffer, comm)?;
        // The scaler is the identity on the forward pass.
        let ((_, scale), exchange) = after_stage(
            StageContext::Flat(exchange),
            ep_grad_scaler_in(&buffer, self.ep_size),
        )?;
        Ok((
            handle,
            ExchangeDispatchContext {
                dispatch,
                exchange,
                scale,
            },
        ))
    }

    /// Send expert outputs back to their source ranks and combine them per
    /// token.
    ///
    /// `expert_output` is laid out like the result of [`dispatch`](Self::dispatch).
    pub fn combine(
        &self,
        expert_output: &Tensor,
        logits: &Tensor,
        mask: &Tensor,
        dest_idx: &Tensor,
    ) -> Result<(Tensor, ExchangeCombineContext)> {
        self.check_capacity(expert_output.dim(0)?)?;
        let (scaled, scale) = ep_grad_scaler_out(expert_output, self.ep_size)?;
        let (returned, exchange) = self.exchange(&scaled)?;
        let ((output, combine), exchange) = after_stage(
            exchange,
            moe_combine(&returned, logits, mask, dest_idx, &self.kernels),
        )?;
        debug!(ep_size = self.ep_size, "ep combine");
        Ok((
            output,
            ExchangeCombineContext {
                scale,
                exchange,
                combine,
            },
        ))
    }
}

impl Backward for ExchangeDispatchContext {
    type Grad = Tensor;

    /// `grad_output` is `[capacity_total, H]`; returns the token gradient `[S, H]`.
    fn backward(self, grad_output: &Tensor) -> Result<Tensor> {
        let (grad, exchange) = after_stage(self.exchange, self.scale.backward(grad_output))?;
        let grad = exchange.backward(&grad)?;
        self.dispatch.backward(&grad)
    }

    fn release(self) {
        self.exchange.release();
    }
}

impl Backward for ExchangeCombineContext {
    type Grad = CombineGrads;

    /// `grad_output` is `[S, H]`.
    fn backward(self, grad_output: &Tensor) -> Result<CombineGrads> {
        let (grads, exchange) = after_stage(self.exchange, self.combine.backward(grad_output))?;
        let expert = exchange.backward(&grads.expert_tokens)?;
        let expert = self.scale.backward(&expert)?;
        Ok(CombineGrads {
            expert_tokens: expert,
            logits: grads.logits,
        })
    }

    fn release(self) {
        self.exchange.release();
    }
}
