//! One simulated MoE layer step across an in-process expert-parallel group.
//!
//! Every rank runs on its own thread:
//!
//! ```text
//! tokens ─▶ router (softmax, top-1, moe_cumsum) ─▶ dp_grad_scaler_in
//!        ─▶ exchange.dispatch ─▶ identity experts ─▶ exchange.combine
//!        ─▶ dp_grad_scaler_out ─▶ backward with unit gradients
//! ```

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use candle_core::{DType, Device, Tensor, D};
use tracing::{info, warn};

use moe_comm_core::config::MoeCommConfig;
use moe_comm_core::distributed::{run_ranks, DeviceCommunicator, InProcessCommunicator};
use moe_comm_core::moe::{
    load_moe_kernels, moe_cumsum, ExchangeTopology, ExpertParallelExchange, MoeKernels,
};
use moe_comm_core::ops::{dp_grad_scaler_in, dp_grad_scaler_out, HierarchicalGroups};
use moe_comm_core::Backward;

/// Shape of the simulated batch and router.
#[derive(Debug, Clone)]
pub struct SimulationParams {
    /// Tokens per rank.
    pub tokens: usize,
    pub hidden: usize,
    /// Experts across the whole expert-parallel group.
    pub experts: usize,
    /// Per-expert capacity as a multiple of an even split.
    pub capacity_factor: f64,
}

impl SimulationParams {
    /// Slots per expert for one source rank.
    pub fn capacity(&self) -> usize {
        let even = self.tokens as f64 * self.capacity_factor / self.experts as f64;
        (even.ceil() as usize).max(1)
    }
}

/// Per-rank outcome of a simulated step.
#[derive(Debug, Clone)]
pub struct RankReport {
    pub rank: usize,
    pub kept: usize,
    pub dropped: usize,
    pub output_norm: f32,
    pub token_grad_norm: f32,
    pub logits_grad_norm: f32,
}

/// Communicators one rank needs to build its exchange.
enum RankTopology {
    Flat(InProcessCommunicator),
    Hierarchical {
        intra: InProcessCommunicator,
        inter: Option<InProcessCommunicator>,
    },
}

/// Run one step on every rank of the configured expert-parallel group.
pub fn run(config: &MoeCommConfig, params: &SimulationParams) -> Result<Vec<RankReport>> {
    let ep_size = config.parallel.expert_parallel_size;
    if params.tokens == 0 || params.hidden == 0 || params.experts == 0 {
        bail!("tokens, hidden and experts must all be > 0");
    }
    if params.experts % ep_size != 0 {
        bail!(
            "experts ({}) must be divisible by expert_parallel_size ({ep_size})",
            params.experts
        );
    }
    if params.capacity_factor.is_nan() || params.capacity_factor <= 0.0 {
        bail!("capacity_factor must be positive");
    }
    if config.parallel.tensor_parallel_size > 1 {
        warn!(
            tp = config.parallel.tensor_parallel_size,
            "tensor parallelism is not simulated; running the expert-parallel group only"
        );
    }

    let topologies = build_topologies(config)?;
    info!(
        ep_size,
        hierarchical = config.exchange.hierarchical,
        overlap = config.exchange.overlap,
        tokens = params.tokens,
        experts = params.experts,
        capacity = params.capacity(),
        "starting simulation"
    );

    let results = run_ranks(topologies, |rank, topology| {
        run_rank(rank, topology, config, params)
            .with_context(|| format!("rank {rank} failed"))
    })?;
    let reports = results.into_iter().collect::<Result<Vec<_>>>()?;

    for r in &reports {
        info!(
            rank = r.rank,
            kept = r.kept,
            dropped = r.dropped,
            output_norm = r.output_norm,
            token_grad_norm = r.token_grad_norm,
            logits_grad_norm = r.logits_grad_norm,
            "rank finished"
        );
    }
    Ok(reports)
}

fn build_topologies(config: &MoeCommConfig) -> Result<Vec<RankTopology>> {
    let ep_size = config.parallel.expert_parallel_size;
    if !config.exchange.hierarchical {
        return Ok(InProcessCommunicator::group(ep_size)?
            .into_iter()
            .map(RankTopology::Flat)
            .collect());
    }

    let local = config.local_group_size();
    let num_groups = ep_size / local;
    // Local rank 0 of every group joins the inter-group communicator.
    let mut inter: Vec<Option<InProcessCommunicator>> = if num_groups > 1 {
        InProcessCommunicator::group(num_groups)?
            .into_iter()
            .map(Some)
            .collect()
    } else {
        vec![None]
    };

    let mut ranks = Vec::with_capacity(ep_size);
    for inter_comm in inter.iter_mut() {
        for (local_rank, intra) in InProcessCommunicator::group(local)?.into_iter().enumerate() {
            let inter = if local_rank == 0 { inter_comm.take() } else { None };
            ranks.push(RankTopology::Hierarchical { intra, inter });
        }
    }
    Ok(ranks)
}

fn run_rank(
    rank: usize,
    topology: RankTopology,
    config: &MoeCommConfig,
    params: &SimulationParams,
) -> Result<RankReport> {
    let device = Device::Cpu;
    let ep_size = config.parallel.expert_parallel_size;
    let dp_size = config.parallel.data_parallel_size;
    let activated = config.parallel.activated_experts;
    let kernels = load_moe_kernels(&config.kernels)?;

    let topology = match topology {
        RankTopology::Flat(comm) => {
            ExchangeTopology::Flat(Arc::new(comm) as Arc<dyn DeviceCommunicator>)
        }
        RankTopology::Hierarchical { intra, inter } => {
            let inter = inter.map(|c| Arc::new(c) as Arc<dyn DeviceCommunicator>);
            let num_groups = ep_size / intra.world_size();
            ExchangeTopology::Hierarchical(HierarchicalGroups::new(
                Arc::new(intra),
                inter,
                0,
                num_groups,
            )?)
        }
    };
    let exchange = ExpertParallelExchange::new(topology, kernels);

    let tokens = make_tokens(rank, params.tokens, params.hidden, &device)?;
    let router = make_router(params.hidden, params.experts, &device)?;
    let probs = candle_nn::ops::softmax(&tokens.matmul(&router)?, D::Minus1)?;

    let capacity = params.capacity();
    let capacity_total = capacity * params.experts;
    let (mask, dest, kept) = route_top1(
        &probs,
        capacity,
        config.kernels.use_cumsum_kernel,
        exchange.kernels().as_ref(),
    )?;

    let (x, dp_in) = dp_grad_scaler_in(&tokens, dp_size, activated)?;
    let (received, dispatch_ctx) = if config.exchange.overlap {
        let (handle, ctx) = exchange.dispatch_overlapped(&x, &mask, &dest, capacity_total)?;
        (handle.wait()?, ctx)
    } else {
        exchange.dispatch(&x, &mask, &dest, capacity_total)?
    };

    // Identity experts.
    let expert_output = received;

    let (combined, combine_ctx) = exchange.combine(&expert_output, &probs, &mask, &dest)?;
    let (output, dp_out) = dp_grad_scaler_out(&combined, dp_size, activated)?;

    let grad = output.ones_like()?;
    let grad = dp_out.backward(&grad)?;
    let grads = combine_ctx.backward(&grad)?;
    let token_grad = dispatch_ctx.backward(&grads.expert_tokens)?;
    let token_grad = dp_in.backward(&token_grad)?;

    Ok(RankReport {
        rank,
        kept,
        dropped: params.tokens - kept,
        output_norm: l2_norm(&output)?,
        token_grad_norm: l2_norm(&token_grad)?,
        logits_grad_norm: l2_norm(&grads.logits)?,
    })
}

fn make_tokens(rank: usize, tokens: usize, hidden: usize, device: &Device) -> Result<Tensor> {
    let offset = rank * tokens * hidden;
    let data: Vec<f32> = (0..tokens * hidden)
        .map(|i| ((offset + i) as f32 * 0.37).sin())
        .collect();
    Ok(Tensor::from_vec(data, (tokens, hidden), device)?)
}

/// Router weights shared by every rank.
fn make_router(hidden: usize, experts: usize, device: &Device) -> Result<Tensor> {
    let data: Vec<f32> = (0..hidden * experts)
        .map(|i| (i as f32 * 0.11).cos())
        .collect();
    Ok(Tensor::from_vec(data, (hidden, experts), device)?)
}

/// Top-1 routing into `capacity` slots per expert.
///
/// Returns `(mask, dest_idx, kept)`; tokens past their expert's capacity are
/// dropped.
fn route_top1(
    probs: &Tensor,
    capacity: usize,
    use_cumsum_kernel: bool,
    kernels: &dyn MoeKernels,
) -> Result<(Tensor, Tensor, usize)> {
    let (num_tokens, num_experts) = probs.dims2()?;
    let choice: Vec<u32> = probs.argmax(D::Minus1)?.to_vec1()?;

    let mut one_hot = vec![0u32; num_tokens * num_experts];
    for (i, &e) in choice.iter().enumerate() {
        one_hot[i * num_experts + e as usize] = 1;
    }
    let one_hot = Tensor::from_vec(one_hot, (num_tokens, num_experts), probs.device())?;
    let positions: Vec<Vec<i64>> =
        moe_cumsum(&one_hot, use_cumsum_kernel, kernels)?.to_vec2()?;

    let mut mask = vec![0u32; num_tokens];
    let mut dest = vec![0u32; num_tokens];
    let mut kept = 0;
    for (i, &e) in choice.iter().enumerate() {
        let pos = positions[i][e as usize];
        if pos >= 0 && (pos as usize) < capacity {
            mask[i] = 1;
            dest[i] = (e as usize * capacity + pos as usize) as u32;
            kept += 1;
        }
    }
    Ok((
        Tensor::from_vec(mask, num_tokens, probs.device())?,
        Tensor::from_vec(dest, num_tokens, probs.device())?,
        kept,
    ))
}

fn l2_norm(t: &Tensor) -> Result<f32> {
    Ok(t.to_dtype(DType::F32)?
        .sqr()?
        .sum_all()?
        .sqrt()?
        .to_scalar::<f32>()?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> SimulationParams {
        SimulationParams {
            tokens: 8,
            hidden: 4,
            experts: 4,
            capacity_factor: 2.0,
        }
    }

    #[test]
    fn capacity_rounds_up() {
        let p = SimulationParams {
            tokens: 10,
            capacity_factor: 1.0,
            ..params()
        };
        assert_eq!(p.capacity(), 3);
    }

    #[test]
    fn route_top1_respects_capacity() {
        let kernels = moe_comm_core::moe::CandleMoeKernels::new();
        let probs = Tensor::new(
            &[[0.9f32, 0.1], [0.8, 0.2], [0.3, 0.7], [0.6, 0.4]],
            &Device::Cpu,
        )
        .unwrap();
        let (mask, dest, kept) = route_top1(&probs, 2, true, &kernels).unwrap();
        assert_eq!(kept, 3);
        assert_eq!(mask.to_vec1::<u32>().unwrap(), vec![1, 1, 1, 0]);
        assert_eq!(dest.to_vec1::<u32>().unwrap()[..3], [0, 1, 2]);
    }

    #[test]
    fn flat_run_reports_every_rank() {
        let mut config = MoeCommConfig::default();
        config.parallel.expert_parallel_size = 2;
        let reports = run(&config, &params()).unwrap();
        assert_eq!(reports.len(), 2);
        for (rank, r) in reports.iter().enumerate() {
            assert_eq!(r.rank, rank);
            assert_eq!(r.kept + r.dropped, 8);
            assert!(r.output_norm.is_finite());
        }
    }

    #[test]
    fn hierarchical_run_matches_flat() {
        let mut flat = MoeCommConfig::default();
        flat.parallel.expert_parallel_size = 4;
        let mut hier = flat.clone();
        hier.exchange.hierarchical = true;
        hier.exchange.local_group_size = Some(2);

        let a = run(&flat, &params()).unwrap();
        let b = run(&hier, &params()).unwrap();
        for (x, y) in a.iter().zip(b.iter()) {
            assert_eq!(x.kept, y.kept);
            assert_eq!(x.output_norm, y.output_norm);
            assert_eq!(x.token_grad_norm, y.token_grad_norm);
        }
    }

    #[test]
    fn overlapped_run_matches_blocking() {
        let mut config = MoeCommConfig::default();
        config.parallel.expert_parallel_size = 2;
        let blocking = run(&config, &params()).unwrap();
        config.exchange.overlap = true;
        let overlapped = run(&config, &params()).unwrap();
        for (x, y) in blocking.iter().zip(overlapped.iter()) {
            assert_eq!(x.output_norm, y.output_norm);
        }
    }

    #[test]
    fn experts_must_divide_across_ranks() {
        let mut config = MoeCommConfig::default();
        config.parallel.expert_parallel_size = 3;
        let err = run(&config, &params()).unwrap_err();
        assert!(err.to_string().contains("divisible"));
    }
}
