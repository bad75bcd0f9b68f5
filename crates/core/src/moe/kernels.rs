//! Row-permutation kernels behind dispatch and combine.
//!
//! The dispatch/combine operators only decide dtypes and shapes; moving rows
//! between the token batch and the capacity buffer is delegated to a
//! [`MoeKernels`] provider. Providers work on F32 payloads.
//!
//! [`CandleMoeKernels`] is the portable provider: every kernel is a pair of
//! `index_select`/`index_add` calls driven by the host-side routing table, so it
//! runs on whatever device the tensors live on.

use std::sync::Arc;

use candle_core::{DType, Device, Tensor};
use tracing::{debug, info};

use super::routing::RoutingTable;
use crate::config::KernelConfig;
use crate::error::{MoeCommError, Result};

/// Shapes of a dispatch kernel call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchShape {
    pub num_tokens: usize,
    pub capacity_total: usize,
    pub hidden_size: usize,
}

/// Shapes of a combine kernel call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CombineShape {
    pub num_tokens: usize,
    pub num_experts: usize,
    pub capacity: usize,
    pub hidden_size: usize,
}

impl CombineShape {
    pub fn capacity_total(&self) -> usize {
        self.num_experts * self.capacity
    }
}

/// Accelerated row-permutation kernels.
pub trait MoeKernels: Send + Sync {
    /// Provider name, for logs.
    fn name(&self) -> &str;

    /// Scatter token rows `(S, H)` into the capacity buffer `(C, H)`.
    fn dispatch_forward(
        &self,
        tokens: &Tensor,
        routing: &RoutingTable,
        shape: DispatchShape,
    ) -> Result<Tensor>;

    /// Gather capacity-buffer gradients `(C, H)` back into token rows `(S, H)`,
    /// summing over each token's assignments.
    fn dispatch_backward(
        &self,
        grad: &Tensor,
        routing: &RoutingTable,
        shape: DispatchShape,
    ) -> Result<Tensor>;

    /// Weighted sum of each token's expert rows: `(C, H)` and `(S, E)` to `(S, H)`.
    fn combine_forward(
        &self,
        expert_tokens: &Tensor,
        logits: &Tensor,
        routing: &RoutingTable,
        shape: CombineShape,
    ) -> Result<Tensor>;

    /// Gradients of [`combine_forward`](Self::combine_forward) with respect to
    /// the expert rows `(C, H)` and the logits `(S, E)`.
    fn combine_backward(
        &self,
        grad: &Tensor,
        expert_tokens: &Tensor,
        logits: &Tensor,
        routing: &RoutingTable,
        shape: CombineShape,
    ) -> Result<(Tensor, Tensor)>;

    /// Inclusive cumulative sum along axis 0 minus one, as I64.
    fn cumsum_sub_one(&self, inputs: &Tensor) -> Result<Tensor>;
}

/// Index tensors derived from a routing table.
struct RouteIndex {
    tokens: Tensor,
    slots: Tensor,
    /// `token * num_experts + expert`, only built for combine.
    logit_offsets: Option<Tensor>,
}

impl RouteIndex {
    fn build(
        routing: &RoutingTable,
        device: &Device,
        combine: Option<&CombineShape>,
    ) -> Result<Option<Self>> {
        let assignments = routing.assignments();
        if assignments.is_empty() {
            return Ok(None);
        }
        let tokens: Vec<u32> = assignments.iter().map(|a| a.token).collect();
        let slots: Vec<u32> = assignments.iter().map(|a| a.slot).collect();
        let logit_offsets = match combine {
            Some(shape) => {
                let offsets: Vec<u32> = assignments
                    .iter()
                    .map(|a| {
                        let expert = a.slot as usize / shape.capacity;
                        (a.token as usize * shape.num_experts + expert) as u32
                    })
                    .collect();
                Some(Tensor::from_vec(offsets, assignments.len(), device)?)
            }
            None => None,
        };
        Ok(Some(Self {
            tokens: Tensor::from_vec(tokens, assignments.len(), device)?,
            slots: Tensor::from_vec(slots, assignments.len(), device)?,
            logit_offsets,
        }))
    }

    fn logit_offsets(&self) -> Result<&Tensor> {
        self.logit_offsets
            .as_ref()
            .ok_or_else(|| MoeCommError::Kernel("combine index built without logits".into()))
    }
}

/// Portable kernels built from candle index operations.
#[derive(Debug, Default, Clone, Copy)]
pub struct CandleMoeKernels;

impl CandleMoeKernels {
    pub fn new() -> Self {
        Self
    }

    /// Per-assignment gate weights `(n,)` gathered from `(S, E)` logits.
    fn gate_weights(logits: &Tensor, index: &RouteIndex) -> Result<Tensor> {
        Ok(logits
            .flatten_all()?
            .index_select(index.logit_offsets()?, 0)?)
    }
}

fn check_shape(t: &Tensor, expected: &[usize]) -> Result<()> {
    if t.dims() != expected {
        return Err(MoeCommError::ShapeMismatch {
            expected: expected.to_vec(),
            actual: t.dims().to_vec(),
        });
    }
    Ok(())
}

impl MoeKernels for CandleMoeKernels {
    fn name(&self) -> &str {
        "candle"
    }

    fn dispatch_forward(
        &self,
        tokens: &Tensor,
        routing: &RoutingTable,
        shape: DispatchShape,
    ) -> Result<Tensor> {
        check_shape(tokens, &[shape.num_tokens, shape.hidden_size])?;
        debug!(kernel = self.name(), ?shape, assignments = routing.assignments().len(), "dispatch_forward");
        let out = Tensor::zeros(
            (shape.capacity_total, shape.hidden_size),
            tokens.dtype(),
            tokens.device(),
        )?;
        let Some(index) = RouteIndex::build(routing, tokens.device(), None)? else {
            return Ok(out);
        };
        let rows = tokens.index_select(&index.tokens, 0)?;
        Ok(out.index_add(&index.slots, &rows, 0)?)
    }

    fn dispatch_backward(
        &self,
        grad: &Tensor,
        routing: &RoutingTable,
        shape: DispatchShape,
    ) -> Result<Tensor> {
        check_shape(grad, &[shape.capacity_total, shape.hidden_size])?;
        debug!(kernel = self.name(), ?shape, "dispatch_backward");
        let out = Tensor::zeros(
            (shape.num_tokens, shape.hidden_size),
            grad.dtype(),
            grad.device(),
        )?;
        let Some(index) = RouteIndex::build(routing, grad.device(), None)? else {
            return Ok(out);
        };
        let rows = grad.index_select(&index.slots, 0)?;
        Ok(out.index_add(&index.tokens, &rows, 0)?)
    }

    fn combine_forward(
        &self,
        expert_tokens: &Tensor,
        logits: &Tensor,
        routing: &RoutingTable,
        shape: CombineShape,
    ) -> Result<Tensor> {
        check_shape(expert_tokens, &[shape.capacity_total(), shape.hidden_size])?;
        check_shape(logits, &[shape.num_tokens, shape.num_experts])?;
        debug!(kernel = self.name(), ?shape, "combine_forward");
        let out = Tensor::zeros(
            (shape.num_tokens, shape.hidden_size),
            expert_tokens.dtype(),
            expert_tokens.device(),
        )?;
        let Some(index) = RouteIndex::build(routing, expert_tokens.device(), Some(&shape))? else {
            return Ok(out);
        };
        let weights = Self::gate_weights(logits, &index)?;
        let rows = expert_tokens
            .index_select(&index.slots, 0)?
            .broadcast_mul(&weights.unsqueeze(1)?)?;
        Ok(out.index_add(&index.tokens, &rows, 0)?)
    }

    fn combine_backward(
        &self,
        grad: &Tensor,
        expert_tokens: &Tensor,
        logits: &Tensor,
        routing: &RoutingTable,
        shape: CombineShape,
    ) -> Result<(Tensor, Tensor)> {
        check_shape(grad, &[shape.num_tokens, shape.hidden_size])?;
        debug!(kernel = self.name(), ?shape, "combine_backward");
        let d_expert = Tensor::zeros(
            (shape.capacity_total(), shape.hidden_size),
            grad.dtype(),
            grad.device(),
        )?;
        let d_logits = Tensor::zeros(
            shape.num_tokens * shape.num_experts,
            logits.dtype(),
            logits.device(),
        )?;
        let Some(index) = RouteIndex::build(routing, grad.device(), Some(&shape))? else {
            return Ok((
                d_expert,
                d_logits.reshape((shape.num_tokens, shape.num_experts))?,
            ));
        };

        let token_grads = grad.index_select(&index.tokens, 0)?;
        let weights = Self::gate_weights(logits, &index)?;
        let d_expert = d_expert.index_add(
            &index.slots,
            &token_grads.broadcast_mul(&weights.unsqueeze(1)?)?,
            0,
        )?;

        let expert_rows = expert_tokens.index_select(&index.slots, 0)?;
        let per_assignment = (expert_rows * token_grads)?.sum(1)?;
        let d_logits = d_logits
            .index_add(index.logit_offsets()?, &per_assignment, 0)?
            .reshape((shape.num_tokens, shape.num_experts))?;
        Ok((d_expert, d_logits))
    }

    fn cumsum_sub_one(&self, inputs: &Tensor) -> Result<Tensor> {
        if inputs.rank() == 0 {
            return Err(MoeCommError::DimOutOfRange { dim: 0, rank: 0 });
        }
        let rows = inputs.dim(0)?;
        let cols = inputs.elem_count().checked_div(rows).unwrap_or(0);
        let values: Vec<i64> = inputs.to_dtype(DType::I64)?.flatten_all()?.to_vec1()?;

        let mut out = values;
        for r in 1..rows {
            for c in 0..cols {
                out[r * cols + c] += out[(r - 1) * cols + c];
            }
        }
        for v in out.iter_mut() {
            *v -= 1;
        }
        Ok(Tensor::from_vec(out, inputs.dims(), inputs.device())?)
    }
}

/// Initialise the kernel provider once and hand out the capability object.
pub fn load_moe_kernels(config: &KernelConfig) -> Result<Arc<dyn MoeKernels>> {
    let kernels = CandleMoeKernels::new();
    info!(
        kernel = kernels.name(),
        use_cumsum_kernel = config.use_cumsum_kernel,
        "loaded MoE kernels"
    );
    Ok(Arc::new(kernels))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn routing(mask: &[u32], dest: &[u32], capacity_total: usize) -> RoutingTable {
        let mask = Tensor::new(mask, &Device::Cpu).unwrap();
        let dest = Tensor::new(dest, &Device::Cpu).unwrap();
        RoutingTable::from_tensors(&mask, &dest, mask.dim(0).unwrap(), capacity_total).unwrap()
    }

    fn tokens() -> Tensor {
        Tensor::new(&[[1f32, 2.0], [3.0, 4.0], [5.0, 6.0]], &Device::Cpu).unwrap()
    }

    #[test]
    fn dispatch_places_rows_at_slots() {
        let r = routing(&[1, 1, 0], &[3, 0, 1], 4);
        let shape = DispatchShape {
            num_tokens: 3,
            capacity_total: 4,
            hidden_size: 2,
        };
        let out = CandleMoeKernels.dispatch_forward(&tokens(), &r, shape).unwrap();
        assert_eq!(
            out.to_vec2::<f32>().unwrap(),
            vec![vec![3.0, 4.0], vec![0.0, 0.0], vec![0.0, 0.0], vec![1.0, 2.0]]
        );
        let back = CandleMoeKernels.dispatch_backward(&out, &r, shape).unwrap();
        assert_eq!(
            back.to_vec2::<f32>().unwrap(),
            vec![vec![1.0, 2.0], vec![3.0, 4.0], vec![0.0, 0.0]]
        );
    }

    #[test]
    fn empty_routing_yields_zeros() {
        let r = routing(&[0, 0, 0], &[0, 0, 0], 2);
        let shape = DispatchShape {
            num_tokens: 3,
            capacity_total: 2,
            hidden_size: 2,
        };
        let out = CandleMoeKernels.dispatch_forward(&tokens(), &r, shape).unwrap();
        assert_eq!(out.sum_all().unwrap().to_scalar::<f32>().unwrap(), 0.0);
    }

    #[test]
    fn combine_weights_by_expert_logit() {
        // 2 experts, capacity 1: slot 0 is expert 0, slot 1 is expert 1.
        let r = routing(&[1, 1], &[1, 0], 2);
        let shape = CombineShape {
            num_tokens: 2,
            num_experts: 2,
            capacity: 1,
            hidden_size: 2,
        };
        let expert = Tensor::new(&[[1f32, 1.0], [2.0, 2.0]], &Device::Cpu).unwrap();
        let logits = Tensor::new(&[[0.1f32, 0.9], [0.7, 0.3]], &Device::Cpu).unwrap();
        let out = CandleMoeKernels
            .combine_forward(&expert, &logits, &r, shape)
            .unwrap();
        let out = out.to_vec2::<f32>().unwrap();
        assert!((out[0][0] - 1.8).abs() < 1e-6);
        assert!((out[1][1] - 0.7).abs() < 1e-6);

        let grad = Tensor::ones((2, 2), DType::F32, &Device::Cpu).unwrap();
        let (d_expert, d_logits) = CandleMoeKernels
            .combine_backward(&grad, &expert, &logits, &r, shape)
            .unwrap();
        let d_expert = d_expert.to_vec2::<f32>().unwrap();
        assert!((d_expert[1][0] - 0.9).abs() < 1e-6);
        assert!((d_expert[0][0] - 0.7).abs() < 1e-6);
        let d_logits = d_logits.to_vec2::<f32>().unwrap();
        assert_eq!(d_logits, vec![vec![0.0, 4.0], vec![2.0, 0.0]]);
    }

    #[test]
    fn cumsum_sub_one_on_columns() {
        let x = Tensor::new(&[[1u32, 0], [1, 1], [0, 1]], &Device::Cpu).unwrap();
        let out = CandleMoeKernels.cumsum_sub_one(&x).unwrap();
        assert_eq!(out.dtype(), DType::I64);
        assert_eq!(
            out.to_vec2::<i64>().unwrap(),
            vec![vec![0, -1], vec![1, 0], vec![1, 1]]
        );
    }

    #[test]
    fn load_returns_candle_provider() {
        let kernels = load_moe_kernels(&KernelConfig::default()).unwrap();
        assert_eq!(kernels.name(), "candle");
    }
}
