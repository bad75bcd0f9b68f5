//! Two-level all-to-all.
//!
//! Ranks are arranged as `G` groups of `L` local ranks; global rank
//! `g * L + l` is local rank `l` of group `g`. Only one designated rank per
//! group talks across groups: it gathers the `L` local inputs, reorders their
//! row chunks so one inter-group all-to-all moves every block, lays the result
//! out per local destination and scatters it back. The overall permutation is
//! the flat all-to-all over the `L * G` ranks.
//!
//! Every rank always runs the full gather/scatter sequence, even when its own
//! input is rejected. A designated rank that finds a bad input agrees with the
//! other designated ranks before the inter-group step and then scatters an
//! abort marker, so the whole group returns `Err` together.

use std::sync::Arc;

use candle_core::{DType, Device, Tensor};
use tracing::{debug, warn};

use super::{Backward, BackwardGuard};
use crate::distributed::{check_dim, split_even, DeviceCommunicator};
use crate::error::{MoeCommError, Result};

/// Groups a rank uses for [`hierarchical_all_to_all`].
#[derive(Clone)]
pub struct HierarchicalGroups {
    intra: Arc<dyn DeviceCommunicator>,
    inter: Option<Arc<dyn DeviceCommunicator>>,
    src_rank: usize,
    inter_size: usize,
}

impl HierarchicalGroups {
    /// `src_rank` is the designated rank's index inside `intra` and
    /// `inter_size` the number of groups `G`, identical on every rank. `inter`
    /// spans the designated ranks of all groups; it is required on the
    /// designated rank when `inter_size > 1` and ignored elsewhere.
    pub fn new(
        intra: Arc<dyn DeviceCommunicator>,
        inter: Option<Arc<dyn DeviceCommunicator>>,
        src_rank: usize,
        inter_size: usize,
    ) -> Result<Self> {
        if src_rank >= intra.world_size() {
            return Err(MoeCommError::InvalidRank {
                rank: src_rank,
                world_size: intra.world_size(),
            });
        }
        if inter_size == 0 {
            return Err(MoeCommError::InvalidGroupSize { what: "inter_size" });
        }
        if intra.rank() == src_rank {
            let actual = inter.as_ref().map_or(1, |c| c.world_size());
            if actual != inter_size {
                return Err(MoeCommError::InvalidSplitCount {
                    expected: inter_size,
                    actual,
                });
            }
        }
        Ok(Self {
            intra,
            inter,
            src_rank,
            inter_size,
        })
    }

    pub fn intra(&self) -> &Arc<dyn DeviceCommunicator> {
        &self.intra
    }

    pub fn is_designated(&self) -> bool {
        self.intra.rank() == self.src_rank
    }

    /// Number of groups `G`.
    pub fn inter_size(&self) -> usize {
        self.inter_size
    }

    /// Total ranks `L * G` taking part in the exchange.
    pub fn total_ranks(&self) -> usize {
        self.intra.world_size() * self.inter_size
    }
}

/// Backward context of [`hierarchical_all_to_all`].
pub struct HierarchicalAllToAllContext {
    groups: HierarchicalGroups,
    guard: BackwardGuard,
}

/// Flat-equivalent all-to-all routed through one designated rank per group.
pub fn hierarchical_all_to_all(
    input: &Tensor,
    groups: &HierarchicalGroups,
) -> Result<(Tensor, HierarchicalAllToAllContext)> {
    let output = exchange(input, groups)?;
    let ctx = HierarchicalAllToAllContext {
        groups: groups.clone(),
        guard: BackwardGuard::new("hierarchical_all_to_all", groups.total_ranks()),
    };
    Ok((output, ctx))
}

fn check_rows(input: &Tensor, total: usize) -> Result<()> {
    let rows = input.dim(0)?;
    if rows % total != 0 {
        return Err(MoeCommError::IndivisibleDimension {
            dim: 0,
            size: rows,
            parts: total,
        });
    }
    Ok(())
}

fn exchange(input: &Tensor, groups: &HierarchicalGroups) -> Result<Tensor> {
    check_dim(input, 0)?;
    let intra = &groups.intra;
    let input = input.contiguous()?;
    let local = check_rows(&input, groups.total_ranks());

    if !groups.is_designated() {
        intra.gather(&input, groups.src_rank)?;
        let received = intra.scatter(None, input.dims(), input.dtype(), groups.src_rank);
        local?;
        return match received {
            Err(MoeCommError::ShapeMismatch { actual, .. }) if actual.is_empty() => Err(
                MoeCommError::Transport("designated rank aborted hierarchical all_to_all".into()),
            ),
            other => other,
        };
    }

    let inputs = intra
        .gather(&input, groups.src_rank)?
        .ok_or_else(|| MoeCommError::Transport("designated rank received no gather".into()))?;
    match route(&input, &inputs, groups, local) {
        Ok(outgoing) => intra.scatter(
            Some(outgoing.as_slice()),
            input.dims(),
            input.dtype(),
            groups.src_rank,
        ),
        Err(e) => {
            abort_scatter(groups, input.dtype(), input.device());
            Err(e)
        }
    }
}

/// Completes the scatter with 0-d chunks, which no receiver accepts.
fn abort_scatter(groups: &HierarchicalGroups, dtype: DType, device: &Device) {
    let intra = &groups.intra;
    let result = Tensor::zeros((), dtype, device)
        .map_err(MoeCommError::from)
        .and_then(|marker| {
            let chunks = vec![marker; intra.world_size()];
            intra.scatter(Some(chunks.as_slice()), &[], dtype, groups.src_rank)
        });
    if let Err(e) = result {
        warn!(error = %e, "hierarchical all_to_all abort could not reach local ranks");
    }
}

/// Designated-rank part: reorder, cross groups, lay out per local destination.
fn route(
    input: &Tensor,
    inputs: &[Tensor],
    groups: &HierarchicalGroups,
    local: Result<()>,
) -> Result<Vec<Tensor>> {
    let local_size = groups.intra.world_size();
    let inter_size = groups.inter_size;
    let total = local_size * inter_size;
    debug!(
        local_rank = groups.intra.rank(),
        local_size,
        inter_size,
        shape = ?input.dims(),
        "hierarchical all_to_all"
    );

    let ordered = local.and_then(|()| order_blocks(input, inputs, total));
    let buffer = match &groups.inter {
        Some(inter) if inter_size > 1 => {
            let peers = agree(inter.as_ref(), ordered.is_ok(), input);
            let ordered = ordered?;
            peers?;
            inter.all_to_all(&ordered)?
        }
        _ => ordered?,
    };

    // Received as (source group, local destination, local source); regroup
    // per local destination keeping sources in global order.
    let by_group = split_even(&buffer, 0, inter_size)?
        .iter()
        .map(|t| split_even(t, 0, local_size))
        .collect::<Result<Vec<_>>>()?;
    let mut relaid = Vec::with_capacity(total);
    for l in 0..local_size {
        for group in &by_group {
            relaid.push(group[l].clone());
        }
    }
    split_even(&Tensor::cat(&relaid, 0)?, 0, local_size)
}

/// Destination-major buffer: all blocks for global rank j are adjacent.
fn order_blocks(input: &Tensor, inputs: &[Tensor], total: usize) -> Result<Tensor> {
    let mut per_local = Vec::with_capacity(inputs.len());
    for t in inputs {
        if t.dims() != input.dims() {
            return Err(MoeCommError::ShapeMismatch {
                expected: input.dims().to_vec(),
                actual: t.dims().to_vec(),
            });
        }
        per_local.push(split_even(t, 0, total)?);
    }
    let mut ordered = Vec::with_capacity(total * inputs.len());
    for j in 0..total {
        for chunks in &per_local {
            ordered.push(chunks[j].clone());
        }
    }
    Ok(Tensor::cat(&ordered, 0)?)
}

/// Designated ranks exchange `[ok, elements]` before the inter-group step so
/// that either all of them enter it or none does.
fn agree(inter: &dyn DeviceCommunicator, ok: bool, input: &Tensor) -> Result<()> {
    let elements = input.elem_count() as u32;
    let status = Tensor::new(&[u32::from(ok), elements], input.device())?;
    let all = inter.all_gather(&status, 0)?.to_vec1::<u32>()?;
    for (group, pair) in all.chunks(2).enumerate() {
        if pair[0] == 0 {
            return Err(MoeCommError::Transport(format!(
                "group {group} aborted hierarchical all_to_all"
            )));
        }
        if pair[1] != elements {
            return Err(MoeCommError::ShapeMismatch {
                expected: vec![elements as usize],
                actual: vec![pair[1] as usize],
            });
        }
    }
    Ok(())
}

impl Backward for HierarchicalAllToAllContext {
    type Grad = Tensor;

    fn backward(mut self, grad_output: &Tensor) -> Result<Tensor> {
        self.guard.discharge();
        exchange(grad_output, &self.groups)
    }

    fn release(mut self) {
        self.guard.discharge();
    }
}
