//! Multi-rank integration tests for the differentiable collectives.
//!
//! Every test runs real in-process groups: one thread per rank, each with its
//! own communication stream. Results are collected per rank and checked on the
//! test thread.

use std::sync::Arc;

use candle_core::{DType, Device, Tensor};
use moe_comm_core::distributed::{
    run_ranks, spawn_ranks, DeviceCommunicator, InProcessCommunicator, LocalProcessGroup,
    MockCommunicator,
};
use moe_comm_core::ops::{
    all_gather, all_gather_overlapped, all_to_all, all_to_all_overlapped, all_to_all_uneven,
    all_to_all_uneven_overlapped, drop_tokens, gather_tokens, hierarchical_all_to_all,
    reduce_scatter, reduce_scatter_overlapped, HierarchicalGroups,
};
use moe_comm_core::{Backward, MoeCommError};

// ─── Helpers ─────────────────────────────────────────────────────────────────

/// `[rows, cols]` tensor whose values encode the owning rank.
fn rank_rows(rank: usize, rows: usize, cols: usize) -> Tensor {
    let base = (rank * 1000) as f32;
    Tensor::arange(base, base + (rows * cols) as f32, &Device::Cpu)
        .unwrap()
        .reshape((rows, cols))
        .unwrap()
}

fn rows_of(t: &Tensor) -> Vec<Vec<f32>> {
    t.to_vec2().unwrap()
}

fn shared(comm: InProcessCommunicator) -> Arc<dyn DeviceCommunicator> {
    Arc::new(comm)
}

fn flat(t: &Tensor) -> Vec<f32> {
    t.flatten_all().unwrap().to_vec1().unwrap()
}

fn pair<T>(v: Vec<T>) -> (T, T) {
    let mut it = v.into_iter();
    (it.next().unwrap(), it.next().unwrap())
}

// ─── AllGather / ReduceScatter ───────────────────────────────────────────────

#[test]
fn test_reduce_scatter_of_all_gather_scales_by_world_size() {
    let world_size = 3;
    let out = spawn_ranks(world_size, |comm| {
        let x = rank_rows(comm.rank(), 2, 2);
        let (gathered, g_ctx) = all_gather(&x, &comm).unwrap();
        assert_eq!(gathered.dims(), &[3, 2, 2]);
        let (reduced, r_ctx) = reduce_scatter(&gathered, &comm).unwrap();
        g_ctx.release();
        r_ctx.release();
        (rows_of(&x), rows_of(&reduced))
    })
    .unwrap();

    for (x, reduced) in out {
        for (xr, rr) in x.iter().zip(reduced.iter()) {
            for (a, b) in xr.iter().zip(rr.iter()) {
                assert_eq!(*b, 3.0 * a);
            }
        }
    }
}

#[test]
fn test_all_gather_backward_sums_gradients() {
    // d/dx_r of sum over ranks of (stacked * w) where each rank applies weight
    // (rank + 1) to its gathered copy: grad for x_r = sum_k (k + 1) = 1 + 2 = 3.
    let out = spawn_ranks(2, |comm| {
        let x = Tensor::ones((1, 2), DType::F32, &Device::Cpu).unwrap();
        let (gathered, ctx) = all_gather(&x, &comm).unwrap();
        let grad = gathered.ones_like().unwrap().affine(comm.rank() as f64 + 1.0, 0.0).unwrap();
        rows_of(&ctx.backward(&grad).unwrap())
    })
    .unwrap();
    assert_eq!(out[0], vec![vec![3.0, 3.0]]);
    assert_eq!(out[1], vec![vec![3.0, 3.0]]);
}

#[test]
fn test_reduce_scatter_backward_is_all_gather() {
    let out = spawn_ranks(2, |comm| {
        let x = Tensor::zeros((2, 1, 2), DType::F32, &Device::Cpu).unwrap();
        let (y, ctx) = reduce_scatter(&x, &comm).unwrap();
        assert_eq!(y.dims(), &[1, 2]);
        let grad = Tensor::full(comm.rank() as f32, (1, 2), &Device::Cpu).unwrap();
        let g = ctx.backward(&grad).unwrap();
        g.flatten_all().unwrap().to_vec1::<f32>().unwrap()
    })
    .unwrap();
    for g in out {
        assert_eq!(g, vec![0.0, 0.0, 1.0, 1.0]);
    }
}

#[test]
fn test_gather_and_reduce_overlapped_match_blocking() {
    let out = spawn_ranks(3, |comm| {
        let x = rank_rows(comm.rank(), 3, 2);
        // A blocking call issued while the overlapped one is in flight runs
        // after it on every rank.
        let (g_handle, g_ctx) = all_gather_overlapped(&x, &comm).unwrap();
        let (g_blocking, ctx) = all_gather(&x, &comm).unwrap();
        ctx.release();
        let gathered = g_handle.wait().unwrap();

        let (r_handle, r_ctx) = reduce_scatter_overlapped(&gathered, &comm).unwrap();
        let (r_blocking, ctx) = reduce_scatter(&gathered, &comm).unwrap();
        ctx.release();
        let reduced = r_handle.wait().unwrap();

        let d_x = g_ctx.backward(&gathered).unwrap();
        r_ctx.release();
        assert_eq!(gathered.dims(), &[3, 3, 2]);
        assert_eq!(reduced.dims(), &[3, 2]);
        (
            flat(&gathered) == flat(&g_blocking),
            rows_of(&reduced),
            rows_of(&r_blocking),
            rows_of(&x),
            rows_of(&d_x),
        )
    })
    .unwrap();

    for (same_gather, reduced, r_blocking, x, d_x) in out {
        assert!(same_gather);
        assert_eq!(reduced, r_blocking);
        // Summing the gathered copies of this rank's input over 3 ranks.
        for (xr, gr) in x.iter().zip(d_x.iter()) {
            for (a, b) in xr.iter().zip(gr.iter()) {
                assert_eq!(*b, 3.0 * a);
            }
        }
        assert_eq!(reduced, d_x);
    }
}

// ─── AllToAll ────────────────────────────────────────────────────────────────

#[test]
fn test_all_to_all_forward_backward_restores_input() {
    let out = spawn_ranks(4, |comm| {
        let x = rank_rows(comm.rank(), 8, 3);
        let (y, ctx) = all_to_all(&x, &comm).unwrap();
        let back = ctx.backward(&y).unwrap();
        (rows_of(&x), rows_of(&y), rows_of(&back))
    })
    .unwrap();

    for (rank, (x, y, back)) in out.iter().enumerate() {
        assert_eq!(x, back);
        // Rows 2*src..2*src+2 of rank `rank`'s output come from rank `src`.
        for src in 0..4 {
            assert_eq!(y[2 * src][0], (src * 1000 + rank * 2 * 3) as f32);
        }
    }
}

#[test]
fn test_all_to_all_overlapped_matches_blocking() {
    let out = spawn_ranks(2, |comm| {
        let x = rank_rows(comm.rank(), 4, 2);
        let (handle, ctx) = all_to_all_overlapped(&x, &comm).unwrap();
        // Unrelated local work while the exchange is in flight.
        let local = (&x * 2.0).unwrap();
        let overlapped = handle.wait().unwrap();
        ctx.release();
        let (blocking, ctx) = all_to_all(&x, &comm).unwrap();
        ctx.release();
        assert_eq!(local.dims(), &[4, 2]);
        (rows_of(&overlapped), rows_of(&blocking))
    })
    .unwrap();
    for (a, b) in out {
        assert_eq!(a, b);
    }
}

// ─── AllToAllUneven ──────────────────────────────────────────────────────────

#[test]
fn test_uneven_world_four_round_trip() {
    // send[r][j]: rows rank r sends to rank j.
    let send = [[1usize, 2, 1, 0], [0, 1, 1, 1], [2, 0, 0, 1], [1, 1, 0, 0]];
    let out = spawn_ranks(4, |comm| {
        let r = comm.rank();
        let input_splits = send[r].to_vec();
        let output_splits: Vec<usize> = (0..4).map(|j| send[j][r]).collect();
        let rows: usize = input_splits.iter().sum();
        let x = rank_rows(r, rows, 2);

        let (y, ctx) = all_to_all_uneven(&x, &input_splits, &output_splits, &comm).unwrap();
        let out_rows = y.dim(0).unwrap();
        let grad = ctx.backward(&y).unwrap();

        let (back, ctx) = all_to_all_uneven(&y, &output_splits, &input_splits, &comm).unwrap();
        ctx.release();
        (
            out_rows,
            output_splits.iter().sum::<usize>(),
            x.dims().to_vec(),
            grad.dims().to_vec(),
            rows_of(&x),
            rows_of(&back),
        )
    })
    .unwrap();

    for (out_rows, expected_rows, x_dims, grad_dims, x, back) in out {
        assert_eq!(out_rows, expected_rows);
        assert_eq!(grad_dims, x_dims);
        assert_eq!(x, back);
    }
}

#[test]
fn test_uneven_routes_rows_to_destinations() {
    let out = spawn_ranks(2, |comm| {
        let (splits_in, splits_out) = if comm.rank() == 0 {
            (vec![1, 2], vec![1, 1])
        } else {
            (vec![1, 0], vec![2, 0])
        };
        let rows: usize = splits_in.iter().sum();
        let x = rank_rows(comm.rank(), rows, 1);
        let (y, ctx) = all_to_all_uneven(&x, &splits_in, &splits_out, &comm).unwrap();
        ctx.release();
        y.flatten_all().unwrap().to_vec1::<f32>().unwrap()
    })
    .unwrap();
    assert_eq!(out[0], vec![0.0, 1000.0]);
    assert_eq!(out[1], vec![1.0, 2.0]);
}

#[test]
fn test_uneven_overlapped_matches_blocking() {
    let out = spawn_ranks(2, |comm| {
        let (splits_in, splits_out) = if comm.rank() == 0 {
            (vec![1, 2], vec![1, 1])
        } else {
            (vec![1, 0], vec![2, 0])
        };
        let rows: usize = splits_in.iter().sum();
        let x = rank_rows(comm.rank(), rows, 2);

        let (handle, ctx) =
            all_to_all_uneven_overlapped(&x, &splits_in, &splits_out, &comm).unwrap();
        let (blocking, b_ctx) = all_to_all_uneven(&x, &splits_in, &splits_out, &comm).unwrap();
        b_ctx.release();
        let overlapped = handle.wait().unwrap();
        assert_eq!(ctx.output_split_sizes(), splits_out.as_slice());
        let grad = ctx.backward(&overlapped).unwrap();
        (rows_of(&overlapped), rows_of(&blocking), rows_of(&x), rows_of(&grad))
    })
    .unwrap();

    for (overlapped, blocking, x, grad) in out {
        assert_eq!(overlapped, blocking);
        assert_eq!(grad, x);
    }
}

#[test]
fn test_uneven_receive_mismatch_is_an_error() {
    // Rank 1 expects [2, 0] rows but receives [1, 1].
    let out = spawn_ranks(2, |comm| {
        let recv = if comm.rank() == 0 { vec![1, 1] } else { vec![2, 0] };
        let x = rank_rows(comm.rank(), 2, 1);
        match all_to_all_uneven(&x, &[1, 1], &recv, &comm) {
            Ok((_, ctx)) => {
                ctx.release();
                None
            }
            Err(e) => Some(e),
        }
    })
    .unwrap();

    assert!(out[0].is_none());
    assert!(matches!(
        &out[1],
        Some(MoeCommError::ShapeMismatch { expected, actual })
            if expected == &vec![2, 0] && actual == &vec![1, 1]
    ));
}

// ─── Tensor-parallel shard/unshard ───────────────────────────────────────────

#[test]
fn test_drop_of_gather_returns_each_shard() {
    let out = spawn_ranks(3, |comm| {
        let shard = rank_rows(comm.rank(), 2, 2);
        let (full, g_ctx) = gather_tokens(&shard, 1, &comm).unwrap();
        assert_eq!(full.dims(), &[2, 6]);
        let (dropped, d_ctx) = drop_tokens(&full, 1, &comm).unwrap();
        // Gather's backward drops, drop's backward gathers.
        let g_back = g_ctx.backward(&full).unwrap();
        let d_back = d_ctx.backward(&dropped).unwrap();
        assert_eq!(d_back.dims(), &[2, 6]);
        (rows_of(&shard), rows_of(&dropped), rows_of(&g_back))
    })
    .unwrap();
    for (shard, dropped, g_back) in out {
        assert_eq!(shard, dropped);
        assert_eq!(shard, g_back);
    }
}

// ─── Hierarchical all-to-all ─────────────────────────────────────────────────

type RankGroups = (
    InProcessCommunicator,
    Option<InProcessCommunicator>,
    InProcessCommunicator,
);

/// Two groups of two ranks: intra groups {0,1} and {2,3}, designated local
/// rank 0, inter group {0,2}, plus a flat group over all four.
fn two_by_two() -> Vec<RankGroups> {
    let (a0, a1) = pair(InProcessCommunicator::group(2).unwrap());
    let (b0, b1) = pair(InProcessCommunicator::group(2).unwrap());
    let (i0, i1) = pair(InProcessCommunicator::group(2).unwrap());
    let mut flat = InProcessCommunicator::group(4).unwrap().into_iter();
    vec![
        (a0, Some(i0), flat.next().unwrap()),
        (a1, None, flat.next().unwrap()),
        (b0, Some(i1), flat.next().unwrap()),
        (b1, None, flat.next().unwrap()),
    ]
}

#[test]
fn test_hierarchical_two_by_two_equals_flat() {
    let out = run_ranks(two_by_two(), |rank, (intra, inter, flat)| {
        let groups = HierarchicalGroups::new(shared(intra), inter.map(shared), 0, 2).unwrap();
        let flat = shared(flat);
        let x = rank_rows(rank, 8, 2);

        let (hier, h_ctx) = hierarchical_all_to_all(&x, &groups).unwrap();
        let (reference, f_ctx) = all_to_all(&x, &flat).unwrap();
        f_ctx.release();
        let back = h_ctx.backward(&hier).unwrap();
        (rows_of(&x), rows_of(&hier), rows_of(&reference), rows_of(&back))
    })
    .unwrap();

    for (x, hier, reference, back) in out {
        assert_eq!(hier, reference);
        assert_eq!(back, x);
    }
}

#[test]
fn test_hierarchical_single_group_skips_inter_step() {
    let out = spawn_ranks(2, |comm| {
        let groups = HierarchicalGroups::new(Arc::clone(&comm), None, 1, 1).unwrap();
        let x = rank_rows(comm.rank(), 4, 1);
        let (y, ctx) = hierarchical_all_to_all(&x, &groups).unwrap();
        ctx.release();
        let (reference, ctx) = all_to_all(&x, &comm).unwrap();
        ctx.release();
        (rows_of(&y), rows_of(&reference))
    })
    .unwrap();
    for (y, reference) in out {
        assert_eq!(y, reference);
    }
}

#[test]
fn test_hierarchical_indivisible_rows_fail_on_every_rank() {
    let out = spawn_ranks(2, |comm| {
        let groups = HierarchicalGroups::new(Arc::clone(&comm), None, 0, 1).unwrap();
        let x = rank_rows(comm.rank(), 3, 2);
        match hierarchical_all_to_all(&x, &groups) {
            Ok((_, ctx)) => {
                ctx.release();
                false
            }
            Err(e) => matches!(
                e,
                MoeCommError::IndivisibleDimension {
                    size: 3,
                    parts: 2,
                    ..
                }
            ),
        }
    })
    .unwrap();
    assert_eq!(out, vec![true, true]);
}

#[test]
fn test_hierarchical_shape_disagreement_fails_every_group() {
    // Rank 3 sends 4 rows while everyone else sends 8: group 1 rejects its
    // inputs, group 0 learns of it before the inter-group step.
    let out = run_ranks(two_by_two(), |rank, (intra, inter, _flat)| {
        let groups = HierarchicalGroups::new(shared(intra), inter.map(shared), 0, 2).unwrap();
        let rows = if rank == 3 { 4 } else { 8 };
        let x = rank_rows(rank, rows, 2);
        match hierarchical_all_to_all(&x, &groups) {
            Ok((_, ctx)) => {
                ctx.release();
                None
            }
            Err(e) => Some(e),
        }
    })
    .unwrap();

    assert!(matches!(out[2], Some(MoeCommError::ShapeMismatch { .. })));
    for rank in [0, 1, 3] {
        assert!(
            matches!(out[rank], Some(MoeCommError::Transport(_))),
            "rank {rank}: {:?}",
            out[rank]
        );
    }
}

// ─── Backward obligation ─────────────────────────────────────────────────────

#[test]
#[cfg(debug_assertions)]
#[should_panic(expected = "dropped without backward or release")]
fn test_dropped_communicating_context_panics() {
    let comm: Arc<dyn DeviceCommunicator> =
        Arc::new(MockCommunicator::new(LocalProcessGroup::new(0, 2).unwrap()));
    let x = Tensor::zeros((4, 2), DType::F32, &Device::Cpu).unwrap();
    let (_y, ctx) = all_to_all(&x, &comm).unwrap();
    drop(ctx);
}

#[test]
fn test_single_rank_context_may_be_dropped() {
    let comm: Arc<dyn DeviceCommunicator> = Arc::new(MockCommunicator::single());
    let x = Tensor::zeros((4, 2), DType::F32, &Device::Cpu).unwrap();
    let (_y, ctx) = all_to_all(&x, &comm).unwrap();
    drop(ctx);
}
