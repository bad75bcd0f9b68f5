//! Identity-forward gradient scalers.
//!
//! Expert-parallel routing changes how many tokens each expert sees compared
//! with a dense data-parallel step, so the gradients flowing back through the
//! exchange are rescaled to keep their magnitudes comparable.

use candle_core::Tensor;

use super::Backward;
use crate::error::{MoeCommError, Result};

/// Which scaler produced a [`GradScaleContext`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GradScaleKind {
    ExpertParallelIn,
    ExpertParallelOut,
    DataParallelIn,
    DataParallelOut,
}

/// Backward context of the gradient scalers.
#[derive(Debug, Clone, Copy)]
pub struct GradScaleContext {
    kind: GradScaleKind,
    /// `(multiplier, divisor)`; `None` when backward is the identity.
    scale: Option<(f64, f64)>,
}

impl GradScaleContext {
    pub fn kind(&self) -> GradScaleKind {
        self.kind
    }

    /// Effective factor applied to gradients.
    pub fn factor(&self) -> f64 {
        self.scale.map_or(1.0, |(mul, div)| mul / div)
    }
}

fn positive(value: usize, what: &'static str) -> Result<()> {
    if value == 0 {
        return Err(MoeCommError::InvalidGroupSize { what });
    }
    Ok(())
}

/// Identity forward; backward multiplies by `ep_size`.
pub fn ep_grad_scaler_in(x: &Tensor, ep_size: usize) -> Result<(Tensor, GradScaleContext)> {
    positive(ep_size, "ep_size")?;
    let scale = (ep_size != 1).then_some((ep_size as f64, 1.0));
    Ok((
        x.clone(),
        GradScaleContext {
            kind: GradScaleKind::ExpertParallelIn,
            scale,
        },
    ))
}

/// Identity forward; backward divides by `ep_size`.
pub fn ep_grad_scaler_out(x: &Tensor, ep_size: usize) -> Result<(Tensor, GradScaleContext)> {
    positive(ep_size, "ep_size")?;
    let scale = (ep_size != 1).then_some((1.0, ep_size as f64));
    Ok((
        x.clone(),
        GradScaleContext {
            kind: GradScaleKind::ExpertParallelOut,
            scale,
        },
    ))
}

/// Identity forward; backward multiplies by `activated_experts / dp_size`.
pub fn dp_grad_scaler_in(
    x: &Tensor,
    dp_size: usize,
    activated_experts: usize,
) -> Result<(Tensor, GradScaleContext)> {
    positive(dp_size, "dp_size")?;
    positive(activated_experts, "activated_experts")?;
    let scale =
        (dp_size != activated_experts).then_some((activated_experts as f64, dp_size as f64));
    Ok((
        x.clone(),
        GradScaleContext {
            kind: GradScaleKind::DataParallelIn,
            scale,
        },
    ))
}

/// Identity forward; backward multiplies by `dp_size / activated_experts`.
pub fn dp_grad_scaler_out(
    x: &Tensor,
    dp_size: usize,
    activated_experts: usize,
) -> Result<(Tensor, GradScaleContext)> {
    positive(dp_size, "dp_size")?;
    positive(activated_experts, "activated_experts")?;
    let scale =
        (dp_size != activated_experts).then_some((dp_size as f64, activated_experts as f64));
    Ok((
        x.clone(),
        GradScaleContext {
            kind: GradScaleKind::DataParallelOut,
            scale,
        },
    ))
}

impl Backward for GradScaleContext {
    type Grad = Tensor;

    fn backward(self, grad_output: &Tensor) -> Result<Tensor> {
        match self.scale {
            None => Ok(grad_output.clone()),
            Some((mul, div)) => Ok(((grad_output * mul)? / div)?),
        }
    }

    fn release(self) {}
}
