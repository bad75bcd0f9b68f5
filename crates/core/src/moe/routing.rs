//! Host-side view of a router's assignment.

use candle_core::{DType, Tensor};

use crate::error::{MoeCommError, Result};

/// One `(token, slot)` pair of a routing assignment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Assignment {
    /// Token row in the `(S, H)` batch.
    pub token: u32,
    /// Linear slot `expert * capacity + position` in the capacity buffer.
    pub slot: u32,
}

/// Validated assignment mask and destination indices.
///
/// The mask is `(S,)` for top-1 routing or `(k, S)` for top-k; only entries
/// with a nonzero mask are kept, in choice-major order.
#[derive(Debug, Clone)]
pub struct RoutingTable {
    top_k: usize,
    num_tokens: usize,
    capacity_total: usize,
    assignments: Vec<Assignment>,
}

impl RoutingTable {
    /// Read `mask` and `dest_idx` to the host and validate them against the
    /// batch size and capacity buffer.
    pub fn from_tensors(
        mask: &Tensor,
        dest_idx: &Tensor,
        num_tokens: usize,
        capacity_total: usize,
    ) -> Result<Self> {
        let (top_k, s) = match *mask.dims() {
            [s] => (1, s),
            [k, s] => (k, s),
            _ => {
                return Err(MoeCommError::ShapeMismatch {
                    expected: vec![num_tokens],
                    actual: mask.dims().to_vec(),
                })
            }
        };
        if s != num_tokens {
            let mut expected = mask.dims().to_vec();
            let last = expected.len() - 1;
            expected[last] = num_tokens;
            return Err(MoeCommError::ShapeMismatch {
                expected,
                actual: mask.dims().to_vec(),
            });
        }
        if dest_idx.dims() != mask.dims() {
            return Err(MoeCommError::ShapeMismatch {
                expected: mask.dims().to_vec(),
                actual: dest_idx.dims().to_vec(),
            });
        }

        let mask: Vec<f32> = mask.to_dtype(DType::F32)?.flatten_all()?.to_vec1()?;
        let dest: Vec<i64> = dest_idx.to_dtype(DType::I64)?.flatten_all()?.to_vec1()?;

        let mut assignments = Vec::new();
        for (flat, (&m, &d)) in mask.iter().zip(dest.iter()).enumerate() {
            if m == 0.0 {
                continue;
            }
            if d < 0 || d as usize >= capacity_total {
                return Err(MoeCommError::IndexOutOfRange {
                    what: "destination slot",
                    index: d.max(0) as usize,
                    limit: capacity_total,
                });
            }
            assignments.push(Assignment {
                token: (flat % s) as u32,
                slot: d as u32,
            });
        }

        Ok(Self {
            top_k,
            num_tokens,
            capacity_total,
            assignments,
        })
    }

    pub fn top_k(&self) -> usize {
        self.top_k
    }

    pub fn num_tokens(&self) -> usize {
        self.num_tokens
    }

    pub fn capacity_total(&self) -> usize {
        self.capacity_total
    }

    pub fn assignments(&self) -> &[Assignment] {
        &self.assignments
    }

    /// Tokens with no assignment at all (dropped by the router).
    pub fn dropped_tokens(&self) -> usize {
        let mut seen = vec![false; self.num_tokens];
        for a in &self.assignments {
            seen[a.token as usize] = true;
        }
        seen.iter().filter(|&&s| !s).count()
    }
}
