//! Group membership.
//!
//! Ranks are group-local: a rank that belongs to an expert-parallel group and a
//! tensor-parallel group has an independent index in each.

use std::ops::Range;

use crate::error::{MoeCommError, Result};

/// Rank and size of the group one collective is scoped to.
pub trait ProcessGroup: Send + Sync {
    /// Rank of this process inside the group (0..world_size).
    fn rank(&self) -> usize;

    fn world_size(&self) -> usize;

    /// Single-rank groups skip the transport entirely.
    fn is_single(&self) -> bool {
        self.world_size() == 1
    }

    /// This rank's contiguous share of `size` elements along `dim`.
    fn shard_range(&self, dim: usize, size: usize) -> Result<Range<usize>> {
        let parts = self.world_size();
        if size % parts != 0 {
            return Err(MoeCommError::IndivisibleDimension { dim, size, parts });
        }
        let chunk = size / parts;
        let start = self.rank() * chunk;
        Ok(start..start + chunk)
    }
}

/// Plain rank/size pair for groups whose transport lives elsewhere.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalProcessGroup {
    rank: usize,
    world_size: usize,
}

impl LocalProcessGroup {
    pub fn new(rank: usize, world_size: usize) -> Result<Self> {
        if world_size == 0 {
            return Err(MoeCommError::InvalidGroupSize { what: "world_size" });
        }
        if rank >= world_size {
            return Err(MoeCommError::InvalidRank { rank, world_size });
        }
        Ok(Self { rank, world_size })
    }

    pub fn single() -> Self {
        Self {
            rank: 0,
            world_size: 1,
        }
    }
}

impl ProcessGroup for LocalProcessGroup {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.world_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_group() {
        let pg = LocalProcessGroup::single();
        assert_eq!((pg.rank(), pg.world_size()), (0, 1));
        assert!(pg.is_single());
        assert_eq!(pg.shard_range(0, 7).unwrap(), 0..7);
    }

    #[test]
    fn rank_outside_group_rejected() {
        assert!(matches!(
            LocalProcessGroup::new(4, 4),
            Err(MoeCommError::InvalidRank {
                rank: 4,
                world_size: 4
            })
        ));
        assert!(matches!(
            LocalProcessGroup::new(0, 0),
            Err(MoeCommError::InvalidGroupSize { .. })
        ));
    }

    #[test]
    fn shard_range_is_rank_ordered() {
        let pg = LocalProcessGroup::new(2, 4).unwrap();
        assert_eq!(pg.shard_range(1, 12).unwrap(), 6..9);
        assert!(matches!(
            pg.shard_range(1, 10),
            Err(MoeCommError::IndivisibleDimension {
                dim: 1,
                size: 10,
                parts: 4
            })
        ));
    }
}
