//! Device communicator for collective operations.
//!
//! [`DeviceCommunicator`] is the transport contract the differentiable
//! collectives are written against: all-gather, reduce-scatter, all-to-all with
//! equal and uneven shards, and rooted gather/scatter, each scoped to one group.

use candle_core::{DType, Device, Tensor};

use super::handle::CommHandle;
use super::process_group::{LocalProcessGroup, ProcessGroup};
use crate::error::{MoeCommError, Result};

/// Reduction applied by [`DeviceCommunicator::reduce_scatter`].
///
/// Gradient reduction only ever sums.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReduceOp {
    /// Element-wise sum.
    Sum,
}

/// Trait for rank-to-rank communication within one group.
///
/// Every rank of the group must issue the same sequence of calls with matching
/// shapes and split sizes; a rank that skips a call leaves its peers blocked.
pub trait DeviceCommunicator: Send + Sync {
    /// Get the underlying process group.
    fn process_group(&self) -> &dyn ProcessGroup;

    /// Rank of this process inside the group.
    fn rank(&self) -> usize {
        self.process_group().rank()
    }

    /// Number of ranks in the group.
    fn world_size(&self) -> usize {
        self.process_group().world_size()
    }

    /// All-gather: concatenate every rank's tensor along `gather_dim` in rank order.
    ///
    /// Input shape: [d0, d1, ...]
    /// Output shape: [d0 * world_size, d1, ...] (if gather_dim=0)
    fn all_gather(&self, tensor: &Tensor, gather_dim: usize) -> Result<Tensor>;

    /// Reduce-scatter: split along `scatter_dim` into `world_size` chunks, reduce
    /// chunk `r` across ranks and deliver it to rank `r`.
    fn reduce_scatter(&self, tensor: &Tensor, scatter_dim: usize, op: ReduceOp) -> Result<Tensor>;

    /// All-to-all: each rank sends distinct data to each other rank.
    ///
    /// Input tensor is split into `world_size` equal chunks along dimension 0.
    /// Chunk i is sent to rank i, and this rank receives chunk j from rank j.
    ///
    /// Input shape: [world_size * chunk_size, ...]
    /// Output shape: [world_size * chunk_size, ...] (same shape, different data)
    fn all_to_all(&self, tensor: &Tensor) -> Result<Tensor>;

    /// Variable-size all-to-all: each rank sends/receives different amounts to/from each rank.
    ///
    /// # Arguments
    /// * `tensor` - Input tensor, total size along dim 0 equals sum of send_splits
    /// * `send_splits` - Rows sent to each rank (length = world_size)
    /// * `recv_splits` - Rows received from each rank (length = world_size)
    ///
    /// Output tensor has size sum(recv_splits) along dimension 0.
    fn all_to_all_v(
        &self,
        tensor: &Tensor,
        send_splits: &[usize],
        recv_splits: &[usize],
    ) -> Result<Tensor>;

    /// Rooted gather: `dst_rank` receives every rank's tensor in rank order;
    /// other ranks receive `None`.
    fn gather(&self, tensor: &Tensor, dst_rank: usize) -> Result<Option<Vec<Tensor>>>;

    /// Rooted scatter: `src_rank` supplies one chunk per rank, every rank
    /// (including the source) receives its own chunk of `shape`/`dtype`.
    fn scatter(
        &self,
        chunks: Option<&[Tensor]>,
        shape: &[usize],
        dtype: DType,
        src_rank: usize,
    ) -> Result<Tensor>;

    /// Non-blocking [`all_gather`](Self::all_gather).
    ///
    /// The default runs the blocking call and hands back a completed handle.
    fn all_gather_async(&self, tensor: &Tensor, gather_dim: usize) -> Result<CommHandle> {
        self.all_gather(tensor, gather_dim)
            .map(|t| CommHandle::ready(Ok(t)))
    }

    /// Non-blocking [`reduce_scatter`](Self::reduce_scatter).
    fn reduce_scatter_async(
        &self,
        tensor: &Tensor,
        scatter_dim: usize,
        op: ReduceOp,
    ) -> Result<CommHandle> {
        self.reduce_scatter(tensor, scatter_dim, op)
            .map(|t| CommHandle::ready(Ok(t)))
    }

    /// Non-blocking [`all_to_all`](Self::all_to_all).
    fn all_to_all_async(&self, tensor: &Tensor) -> Result<CommHandle> {
        self.all_to_all(tensor).map(|t| CommHandle::ready(Ok(t)))
    }

    /// Non-blocking [`all_to_all_v`](Self::all_to_all_v).
    fn all_to_all_v_async(
        &self,
        tensor: &Tensor,
        send_splits: &[usize],
        recv_splits: &[usize],
    ) -> Result<CommHandle> {
        self.all_to_all_v(tensor, send_splits, recv_splits)
            .map(|t| CommHandle::ready(Ok(t)))
    }
}

// ─── Shared validation and data movement helpers ─────────────────────────────

pub(crate) fn check_dim(tensor: &Tensor, dim: usize) -> Result<()> {
    if dim >= tensor.rank() {
        return Err(MoeCommError::DimOutOfRange {
            dim,
            rank: tensor.rank(),
        });
    }
    Ok(())
}

pub(crate) fn check_rank(rank: usize, world_size: usize) -> Result<()> {
    if rank >= world_size {
        return Err(MoeCommError::InvalidRank { rank, world_size });
    }
    Ok(())
}

/// Split `tensor` into `parts` equal contiguous chunks along `dim`.
pub(crate) fn split_even(tensor: &Tensor, dim: usize, parts: usize) -> Result<Vec<Tensor>> {
    check_dim(tensor, dim)?;
    let size = tensor.dim(dim)?;
    if parts == 0 || size % parts != 0 {
        return Err(MoeCommError::IndivisibleDimension { dim, size, parts });
    }
    let chunk = size / parts;
    (0..parts)
        .map(|i| Ok(tensor.narrow(dim, i * chunk, chunk)?))
        .collect()
}

/// Validate uneven split lists against the group size and the input rows.
pub(crate) fn check_splits(
    tensor: &Tensor,
    send_splits: &[usize],
    recv_splits: &[usize],
    world_size: usize,
) -> Result<()> {
    for splits in [send_splits, recv_splits] {
        if splits.len() != world_size {
            return Err(MoeCommError::InvalidSplitCount {
                expected: world_size,
                actual: splits.len(),
            });
        }
    }
    if tensor.rank() == 0 {
        return Err(MoeCommError::ShapeMismatch {
            expected: vec![send_splits.iter().sum()],
            actual: vec![],
        });
    }
    let rows = tensor.dim(0)?;
    let total: usize = send_splits.iter().sum();
    if total != rows {
        return Err(MoeCommError::SplitSizeMismatch {
            expected: rows,
            actual: total,
        });
    }
    Ok(())
}

/// Split rows of `tensor` by `splits` (already validated).
pub(crate) fn split_rows(tensor: &Tensor, splits: &[usize]) -> Result<Vec<Tensor>> {
    let mut offset = 0;
    let mut pieces = Vec::with_capacity(splits.len());
    for &count in splits {
        pieces.push(tensor.narrow(0, offset, count)?);
        offset += count;
    }
    Ok(pieces)
}

/// Concatenate received row blocks; an all-empty receive keeps the trailing shape.
pub(crate) fn concat_rows(pieces: &[Tensor], template: &Tensor) -> Result<Tensor> {
    let non_empty: Vec<&Tensor> = pieces.iter().filter(|p| p.dim(0).unwrap_or(0) > 0).collect();
    if non_empty.is_empty() {
        let mut shape = template.dims().to_vec();
        shape[0] = 0;
        return Ok(Tensor::zeros(shape, template.dtype(), template.device())?);
    }
    Ok(Tensor::cat(&non_empty, 0)?)
}

/// Element-wise reduction of equally shaped tensors.
pub(crate) fn reduce_tensors(parts: &[Tensor], op: ReduceOp) -> Result<Tensor> {
    let (first, rest) = parts.split_first().ok_or_else(|| {
        MoeCommError::Transport("reduction over an empty set of ranks".to_string())
    })?;
    let mut acc = first.clone();
    for part in rest {
        acc = match op {
            ReduceOp::Sum => acc.add(part)?,
        };
    }
    Ok(acc)
}

// ─── MockCommunicator ────────────────────────────────────────────────────────

/// Communicator that never leaves the process.
///
/// With one rank every collective is the identity a real transport would
/// produce. With more ranks it behaves as if every peer held exactly the data
/// of this rank, which keeps shapes and reductions realistic for flow tests.
pub struct MockCommunicator<P: ProcessGroup> {
    process_group: P,
}

impl<P: ProcessGroup> MockCommunicator<P> {
    /// Create a new mock communicator with the given process group.
    pub fn new(process_group: P) -> Self {
        Self { process_group }
    }
}

impl MockCommunicator<LocalProcessGroup> {
    /// Single-rank loopback communicator.
    pub fn single() -> Self {
        Self::new(LocalProcessGroup::single())
    }
}

impl<P: ProcessGroup + Send + Sync> DeviceCommunicator for MockCommunicator<P> {
    fn process_group(&self) -> &dyn ProcessGroup {
        &self.process_group
    }

    fn all_gather(&self, tensor: &Tensor, gather_dim: usize) -> Result<Tensor> {
        check_dim(tensor, gather_dim)?;
        if self.process_group.is_single() {
            return Ok(tensor.clone());
        }
        let world_size = self.process_group.world_size();
        let copies: Vec<Tensor> = (0..world_size).map(|_| tensor.clone()).collect();
        Ok(Tensor::cat(&copies, gather_dim)?)
    }

    fn reduce_scatter(&self, tensor: &Tensor, scatter_dim: usize, op: ReduceOp) -> Result<Tensor> {
        let world_size = self.process_group.world_size();
        let chunks = split_even(tensor, scatter_dim, world_size)?;
        let mine = chunks[self.process_group.rank()].clone();
        let copies: Vec<Tensor> = (0..world_size).map(|_| mine.clone()).collect();
        reduce_tensors(&copies, op)
    }

    fn all_to_all(&self, tensor: &Tensor) -> Result<Tensor> {
        let world_size = self.process_group.world_size();
        let chunks = split_even(tensor, 0, world_size)?;
        if self.process_group.is_single() {
            return Ok(tensor.clone());
        }
        let mine = &chunks[self.process_group.rank()];
        let copies: Vec<Tensor> = (0..world_size).map(|_| mine.clone()).collect();
        Ok(Tensor::cat(&copies, 0)?)
    }

    fn all_to_all_v(
        &self,
        tensor: &Tensor,
        send_splits: &[usize],
        recv_splits: &[usize],
    ) -> Result<Tensor> {
        let world_size = self.process_group.world_size();
        check_splits(tensor, send_splits, recv_splits, world_size)?;
        let rank = self.process_group.rank();

        // Every mirrored peer sends us what we send to ourselves.
        if recv_splits.iter().any(|&r| r != send_splits[rank]) {
            return Err(MoeCommError::ShapeMismatch {
                expected: vec![send_splits[rank]; world_size],
                actual: recv_splits.to_vec(),
            });
        }
        let pieces = split_rows(tensor, send_splits)?;
        let copies: Vec<Tensor> = (0..world_size).map(|_| pieces[rank].clone()).collect();
        concat_rows(&copies, tensor)
    }

    fn gather(&self, tensor: &Tensor, dst_rank: usize) -> Result<Option<Vec<Tensor>>> {
        let world_size = self.process_group.world_size();
        check_rank(dst_rank, world_size)?;
        if self.process_group.rank() != dst_rank {
            return Ok(None);
        }
        Ok(Some((0..world_size).map(|_| tensor.clone()).collect()))
    }

    fn scatter(
        &self,
        chunks: Option<&[Tensor]>,
        shape: &[usize],
        dtype: DType,
        src_rank: usize,
    ) -> Result<Tensor> {
        let world_size = self.process_group.world_size();
        let rank = self.process_group.rank();
        check_rank(src_rank, world_size)?;
        match chunks {
            Some(chunks) if rank == src_rank => {
                if chunks.len() != world_size {
                    return Err(MoeCommError::InvalidSplitCount {
                        expected: world_size,
                        actual: chunks.len(),
                    });
                }
                Ok(chunks[rank].clone())
            }
            Some(chunks) => {
                let device = chunks
                    .first()
                    .map(|c| c.device().clone())
                    .unwrap_or(Device::Cpu);
                Ok(Tensor::zeros(shape, dtype, &device)?)
            }
            None if rank == src_rank => Err(MoeCommError::InvalidSplitCount {
                expected: world_size,
                actual: 0,
            }),
            None => Ok(Tensor::zeros(shape, dtype, &Device::Cpu)?),
        }
    }
}
