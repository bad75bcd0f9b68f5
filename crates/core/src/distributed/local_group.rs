//! In-process communication groups.
//!
//! [`InProcessCommunicator`] moves tensors between threads of one process. All
//! communicators of a group share one exchange area: every collective is a
//! submit phase (each rank posts one optional tensor per destination), a
//! barrier, a read phase, a second barrier and a clear. Each communicator owns a
//! communication stream thread that runs its collectives in issue order, so
//! non-blocking and blocking calls interleave identically on every rank.

use std::sync::{Arc, Barrier, Mutex, MutexGuard};
use std::thread::JoinHandle;

use candle_core::{DType, Tensor};
use crossbeam::channel::{self, Receiver, Sender};
use tracing::debug;

use super::communicator::{
    check_dim, check_rank, check_splits, concat_rows, reduce_tensors, split_even, split_rows,
    DeviceCommunicator, ReduceOp,
};
use super::handle::CommHandle;
use super::process_group::{LocalProcessGroup, ProcessGroup};
use crate::error::{MoeCommError, Result};

type Job = Box<dyn FnOnce() + Send>;
type Outgoing = Vec<Option<Tensor>>;

/// Exchange area shared by all communicators of one group.
struct GroupShared {
    world_size: usize,
    slots: Mutex<Vec<Option<Outgoing>>>,
    barrier: Barrier,
}

impl GroupShared {
    fn new(world_size: usize) -> Arc<Self> {
        Arc::new(Self {
            world_size,
            slots: Mutex::new(vec![None; world_size]),
            barrier: Barrier::new(world_size),
        })
    }

    fn lock_slots(&self) -> Result<MutexGuard<'_, Vec<Option<Outgoing>>>> {
        self.slots
            .lock()
            .map_err(|_| MoeCommError::Transport("exchange area poisoned".to_string()))
    }

    /// Post `outgoing[dst]` for every destination and collect what every source
    /// posted for `rank`, in source order.
    ///
    /// Both barriers are reached even when the area is poisoned, so every rank
    /// of the group fails instead of some of them waiting forever.
    fn exchange(&self, rank: usize, outgoing: Outgoing) -> Result<Vec<Option<Tensor>>> {
        let posted = self
            .lock_slots()
            .map(|mut slots| slots[rank] = Some(outgoing));
        self.barrier.wait();

        let received = self.lock_slots().map(|slots| {
            (0..self.world_size)
                .map(|src| slots[src].as_ref().and_then(|out| out[rank].clone()))
                .collect::<Vec<_>>()
        });
        self.barrier.wait();

        posted?;
        let received = received?;
        self.lock_slots()?[rank] = None;
        Ok(received)
    }

    /// Exchange where every source is expected to send to `rank`.
    fn exchange_all(&self, rank: usize, outgoing: Outgoing) -> Result<Vec<Tensor>> {
        self.exchange(rank, outgoing)?
            .into_iter()
            .enumerate()
            .map(|(src, t)| {
                t.ok_or_else(|| {
                    MoeCommError::Transport(format!("rank {src} posted nothing for rank {rank}"))
                })
            })
            .collect()
    }
}

/// Per-rank worker executing collectives in issue order.
struct CommStream {
    tx: Option<Sender<Job>>,
    worker: Option<JoinHandle<()>>,
}

impl CommStream {
    fn spawn(rank: usize) -> Result<Self> {
        let (tx, rx) = channel::unbounded::<Job>();
        let worker = std::thread::Builder::new()
            .name(format!("moe-comm-rank{rank}"))
            .spawn(move || {
                for job in rx {
                    job();
                }
            })
            .map_err(|e| MoeCommError::Transport(format!("failed to start comm stream: {e}")))?;
        Ok(Self {
            tx: Some(tx),
            worker: Some(worker),
        })
    }

    fn submit(&self, job: Job) -> Result<()> {
        self.tx
            .as_ref()
            .ok_or_else(|| MoeCommError::Transport("communication stream stopped".to_string()))?
            .send(job)
            .map_err(|_| MoeCommError::Transport("communication stream stopped".to_string()))
    }
}

impl Drop for CommStream {
    fn drop(&mut self) {
        // Closing the queue lets the worker drain and exit.
        self.tx.take();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

/// Communicator for one rank of a group living in this process.
///
/// Created in sets by [`InProcessCommunicator::group`]; hand one communicator to
/// each rank thread. A rank that stops issuing collectives leaves its peers
/// blocked, exactly like a real collective library.
pub struct InProcessCommunicator {
    pg: LocalProcessGroup,
    shared: Arc<GroupShared>,
    stream: CommStream,
}

impl InProcessCommunicator {
    /// Create the `world_size` communicators of a new group, ordered by rank.
    pub fn group(world_size: usize) -> Result<Vec<Self>> {
        if world_size == 0 {
            return Err(MoeCommError::InvalidGroupSize { what: "world_size" });
        }
        let shared = GroupShared::new(world_size);
        (0..world_size)
            .map(|rank| {
                Ok(Self {
                    pg: LocalProcessGroup::new(rank, world_size)?,
                    shared: Arc::clone(&shared),
                    stream: CommStream::spawn(rank)?,
                })
            })
            .collect()
    }

    fn submit<T, F>(&self, op: F) -> Result<Receiver<Result<T>>>
    where
        T: Send + 'static,
        F: FnOnce(&GroupShared, usize) -> Result<T> + Send + 'static,
    {
        let (tx, rx) = channel::bounded(1);
        let shared = Arc::clone(&self.shared);
        let rank = self.pg.rank();
        self.stream.submit(Box::new(move || {
            let _ = tx.send(op(&shared, rank));
        }))?;
        Ok(rx)
    }

    fn run<T, F>(&self, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&GroupShared, usize) -> Result<T> + Send + 'static,
    {
        self.submit(op)?.recv().map_err(|_| {
            MoeCommError::Transport("communication stream closed before completion".to_string())
        })?
    }
}

impl DeviceCommunicator for InProcessCommunicator {
    fn process_group(&self) -> &dyn ProcessGroup {
        &self.pg
    }

    fn all_gather(&self, tensor: &Tensor, gather_dim: usize) -> Result<Tensor> {
        self.all_gather_async(tensor, gather_dim)?.wait()
    }

    fn reduce_scatter(&self, tensor: &Tensor, scatter_dim: usize, op: ReduceOp) -> Result<Tensor> {
        self.reduce_scatter_async(tensor, scatter_dim, op)?.wait()
    }

    fn all_to_all(&self, tensor: &Tensor) -> Result<Tensor> {
        self.all_to_all_async(tensor)?.wait()
    }

    fn all_to_all_v(
        &self,
        tensor: &Tensor,
        send_splits: &[usize],
        recv_splits: &[usize],
    ) -> Result<Tensor> {
        self.all_to_all_v_async(tensor, send_splits, recv_splits)?
            .wait()
    }

    fn gather(&self, tensor: &Tensor, dst_rank: usize) -> Result<Option<Vec<Tensor>>> {
        let world_size = self.pg.world_size();
        check_rank(dst_rank, world_size)?;
        debug!(rank = self.pg.rank(), world_size, dst_rank, shape = ?tensor.dims(), "gather");

        let tensor = tensor.clone();
        self.run(move |shared, rank| {
            let outgoing = (0..world_size)
                .map(|dst| (dst == dst_rank).then(|| tensor.clone()))
                .collect();
            let received = shared.exchange(rank, outgoing)?;
            if rank != dst_rank {
                return Ok(None);
            }
            received
                .into_iter()
                .enumerate()
                .map(|(src, t)| {
                    t.ok_or_else(|| {
                        MoeCommError::Transport(format!("rank {src} did not join gather"))
                    })
                })
                .collect::<Result<Vec<_>>>()
                .map(Some)
        })
    }

    fn scatter(
        &self,
        chunks: Option<&[Tensor]>,
        shape: &[usize],
        dtype: DType,
        src_rank: usize,
    ) -> Result<Tensor> {
        let world_size = self.pg.world_size();
        let rank = self.pg.rank();
        check_rank(src_rank, world_size)?;

        let outgoing: Outgoing = if rank == src_rank {
            let chunks = chunks.ok_or(MoeCommError::InvalidSplitCount {
                expected: world_size,
                actual: 0,
            })?;
            if chunks.len() != world_size {
                return Err(MoeCommError::InvalidSplitCount {
                    expected: world_size,
                    actual: chunks.len(),
                });
            }
            chunks.iter().cloned().map(Some).collect()
        } else {
            vec![None; world_size]
        };
        debug!(rank, world_size, src_rank, shape = ?shape, "scatter");

        let expected = shape.to_vec();
        self.run(move |shared, rank| {
            let mut received = shared.exchange(rank, outgoing)?;
            let chunk = received[src_rank].take().ok_or_else(|| {
                MoeCommError::Transport(format!("source rank {src_rank} sent no chunk"))
            })?;
            if chunk.dims() != expected.as_slice() {
                return Err(MoeCommError::ShapeMismatch {
                    expected,
                    actual: chunk.dims().to_vec(),
                });
            }
            Ok(chunk.to_dtype(dtype)?)
        })
    }

    fn all_gather_async(&self, tensor: &Tensor, gather_dim: usize) -> Result<CommHandle> {
        check_dim(tensor, gather_dim)?;
        let world_size = self.pg.world_size();
        debug!(rank = self.pg.rank(), world_size, gather_dim, shape = ?tensor.dims(), "all_gather");

        let tensor = tensor.clone();
        let rx = self.submit(move |shared, rank| {
            let received = shared.exchange_all(rank, vec![Some(tensor); world_size])?;
            Ok(Tensor::cat(&received, gather_dim)?)
        })?;
        Ok(CommHandle::pending(rx))
    }

    fn reduce_scatter_async(
        &self,
        tensor: &Tensor,
        scatter_dim: usize,
        op: ReduceOp,
    ) -> Result<CommHandle> {
        let world_size = self.pg.world_size();
        let chunks = split_even(&tensor.contiguous()?, scatter_dim, world_size)?;
        debug!(rank = self.pg.rank(), world_size, scatter_dim, ?op, shape = ?tensor.dims(), "reduce_scatter");

        let rx = self.submit(move |shared, rank| {
            let received = shared.exchange_all(rank, chunks.into_iter().map(Some).collect())?;
            reduce_tensors(&received, op)
        })?;
        Ok(CommHandle::pending(rx))
    }

    fn all_to_all_async(&self, tensor: &Tensor) -> Result<CommHandle> {
        let world_size = self.pg.world_size();
        let chunks = split_even(tensor, 0, world_size)?;
        debug!(rank = self.pg.rank(), world_size, shape = ?tensor.dims(), "all_to_all");

        let rx = self.submit(move |shared, rank| {
            let received = shared.exchange_all(rank, chunks.into_iter().map(Some).collect())?;
            Ok(Tensor::cat(&received, 0)?)
        })?;
        Ok(CommHandle::pending(rx))
    }

    fn all_to_all_v_async(
        &self,
        tensor: &Tensor,
        send_splits: &[usize],
        recv_splits: &[usize],
    ) -> Result<CommHandle> {
        let world_size = self.pg.world_size();
        check_splits(tensor, send_splits, recv_splits, world_size)?;
        let pieces = split_rows(tensor, send_splits)?;
        debug!(
            rank = self.pg.rank(),
            world_size,
            ?send_splits,
            ?recv_splits,
            "all_to_all_v"
        );

        let template = tensor.clone();
        let recv_splits = recv_splits.to_vec();
        let rx = self.submit(move |shared, rank| {
            let received = shared.exchange_all(rank, pieces.into_iter().map(Some).collect())?;
            let actual: Vec<usize> = received
                .iter()
                .map(|t| t.dim(0))
                .collect::<candle_core::Result<_>>()?;
            if actual != recv_splits {
                return Err(MoeCommError::ShapeMismatch {
                    expected: recv_splits,
                    actual,
                });
            }
            concat_rows(&received, &template)
        })?;
        Ok(CommHandle::pending(rx))
    }
}

/// Run one closure per element of `per_rank` on its own thread and collect the
/// results in rank order.
///
/// Each element is typically the set of communicators one rank participates in.
pub fn run_ranks<R, T, F>(per_rank: Vec<R>, f: F) -> Result<Vec<T>>
where
    R: Send,
    T: Send,
    F: Fn(usize, R) -> T + Sync,
{
    std::thread::scope(|scope| {
        let handles: Vec<_> = per_rank
            .into_iter()
            .enumerate()
            .map(|(rank, r)| {
                let f = &f;
                scope.spawn(move || f(rank, r))
            })
            .collect();
        handles
            .into_iter()
            .enumerate()
            .map(|(rank, h)| {
                h.join()
                    .map_err(|_| MoeCommError::Transport(format!("rank {rank} thread panicked")))
            })
            .collect()
    })
}

/// Build a group of `world_size` in-process ranks and run `f` on each.
pub fn spawn_ranks<T, F>(world_size: usize, f: F) -> Result<Vec<T>>
where
    T: Send,
    F: Fn(Arc<dyn DeviceCommunicator>) -> T + Sync,
{
    let comms = InProcessCommunicator::group(world_size)?;
    run_ranks(comms, |_, comm| f(Arc::new(comm)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn rank_tensor(rank: usize, rows: usize, cols: usize) -> Tensor {
        let base = (rank * 100) as f32;
        Tensor::arange(base, base + (rows * cols) as f32, &Device::Cpu)
            .unwrap()
            .reshape((rows, cols))
            .unwrap()
    }

    fn to_vec2(t: &Tensor) -> Vec<Vec<f32>> {
        t.to_vec2().unwrap()
    }

    #[test]
    fn poisoned_exchange_area_fails_every_rank() {
        let shared = GroupShared::new(2);
        let poisoner = Arc::clone(&shared);
        let _ = std::thread::spawn(move || {
            let _slots = poisoner.slots.lock().unwrap();
            panic!("poisoning the exchange area");
        })
        .join();

        let out = run_ranks(vec![Arc::clone(&shared), shared], |rank, shared| {
            matches!(
                shared.exchange(rank, vec![None, None]),
                Err(MoeCommError::Transport(_))
            )
        })
        .unwrap();
        assert_eq!(out, vec![true, true]);
    }

    #[test]
    fn zero_world_size_rejected() {
        assert!(matches!(
            InProcessCommunicator::group(0),
            Err(MoeCommError::InvalidGroupSize { .. })
        ));
    }

    #[test]
    fn all_gather_concatenates_in_rank_order() {
        let out = spawn_ranks(3, |comm| {
            let t = Tensor::full(comm.rank() as f32, (1, 2), &Device::Cpu).unwrap();
            to_vec2(&comm.all_gather(&t, 0).unwrap())
        })
        .unwrap();
        for gathered in out {
            assert_eq!(
                gathered,
                vec![vec![0.0, 0.0], vec![1.0, 1.0], vec![2.0, 2.0]]
            );
        }
    }

    #[test]
    fn reduce_scatter_sums_chunks() {
        let out = spawn_ranks(2, |comm| {
            let t = rank_tensor(comm.rank(), 4, 1);
            comm.reduce_scatter(&t, 0, ReduceOp::Sum)
                .unwrap()
                .flatten_all()
                .unwrap()
                .to_vec1::<f32>()
                .unwrap()
        })
        .unwrap();
        // rank 0 rows: 0..4, rank 1 rows: 100..104
        assert_eq!(out[0], vec![100.0, 102.0]);
        assert_eq!(out[1], vec![104.0, 106.0]);
    }

    #[test]
    fn all_to_all_transposes_chunks() {
        let out = spawn_ranks(2, |comm| {
            let t = rank_tensor(comm.rank(), 2, 1);
            comm.all_to_all(&t)
                .unwrap()
                .flatten_all()
                .unwrap()
                .to_vec1::<f32>()
                .unwrap()
        })
        .unwrap();
        assert_eq!(out[0], vec![0.0, 100.0]);
        assert_eq!(out[1], vec![1.0, 101.0]);
    }

    #[test]
    fn all_to_all_v_moves_uneven_rows() {
        // rank 0 sends [1 row -> r0, 2 rows -> r1]; rank 1 sends [0 -> r0, 1 -> r1]
        let out = spawn_ranks(2, |comm| {
            let (t, send, recv) = if comm.rank() == 0 {
                (rank_tensor(0, 3, 1), vec![1, 2], vec![1, 0])
            } else {
                (rank_tensor(1, 1, 1), vec![0, 1], vec![2, 1])
            };
            comm.all_to_all_v(&t, &send, &recv)
                .unwrap()
                .flatten_all()
                .unwrap()
                .to_vec1::<f32>()
                .unwrap()
        })
        .unwrap();
        assert_eq!(out[0], vec![0.0]);
        assert_eq!(out[1], vec![1.0, 2.0, 100.0]);
    }

    #[test]
    fn all_to_all_v_empty_receive_keeps_trailing_shape() {
        let out = spawn_ranks(2, |comm| {
            let t = rank_tensor(comm.rank(), 2, 3);
            let (send, recv) = if comm.rank() == 0 {
                (vec![0, 2], vec![0, 0])
            } else {
                (vec![0, 2], vec![2, 2])
            };
            comm.all_to_all_v(&t, &send, &recv).unwrap().dims().to_vec()
        })
        .unwrap();
        assert_eq!(out[0], vec![0, 3]);
        assert_eq!(out[1], vec![4, 3]);
    }

    #[test]
    fn gather_then_scatter_roundtrip() {
        let out = spawn_ranks(3, |comm| {
            let t = Tensor::full(comm.rank() as f32 + 1.0, (2,), &Device::Cpu).unwrap();
            let gathered = comm.gather(&t, 1).unwrap();
            assert_eq!(gathered.is_some(), comm.rank() == 1);
            let chunks = gathered.map(|g| g.into_iter().rev().collect::<Vec<_>>());
            comm.scatter(chunks.as_deref(), &[2], DType::F32, 1)
                .unwrap()
                .to_vec1::<f32>()
                .unwrap()
        })
        .unwrap();
        assert_eq!(out, vec![vec![3.0, 3.0], vec![2.0, 2.0], vec![1.0, 1.0]]);
    }

    #[test]
    fn async_and_blocking_keep_issue_order() {
        let out = spawn_ranks(2, |comm| {
            let a = Tensor::full(comm.rank() as f32, (2, 1), &Device::Cpu).unwrap();
            let b = Tensor::full(10.0 + comm.rank() as f32, (2, 1), &Device::Cpu).unwrap();
            let pending = comm.all_to_all_async(&a).unwrap();
            let second = comm.all_gather(&b, 0).unwrap();
            let first = pending.wait().unwrap();
            (
                first.flatten_all().unwrap().to_vec1::<f32>().unwrap(),
                second.flatten_all().unwrap().to_vec1::<f32>().unwrap(),
            )
        })
        .unwrap();
        assert_eq!(out[0].0, vec![0.0, 1.0]);
        assert_eq!(out[1].1, vec![10.0, 10.0, 11.0, 11.0]);
    }

    #[test]
    fn run_ranks_preserves_rank_order() {
        let out = run_ranks(vec!['a', 'b', 'c'], |rank, c| format!("{rank}{c}")).unwrap();
        assert_eq!(out, vec!["0a", "1b", "2c"]);
    }
}
