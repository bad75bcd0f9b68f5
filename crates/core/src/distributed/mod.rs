//! Communication groups and transports.
//!
//! This module provides the transport contract the differentiable collectives
//! are built on:
//! - [`ProcessGroup`] - Group membership (group-local rank, world size)
//! - [`DeviceCommunicator`] - Collective operations (all_gather, all_to_all_v, etc.)
//! - [`CommHandle`] - Completion handle of a non-blocking collective
//!
//! # Transports
//!
//! - [`MockCommunicator`]: loopback for one rank, mirrored peers otherwise
//! - [`InProcessCommunicator`]: real group of ranks running as threads of one
//!   process, each with its own communication stream
//!
//! # Usage
//!
//! ```ignore
//! use moe_comm_core::distributed::spawn_ranks;
//!
//! let shapes = spawn_ranks(4, |comm| {
//!     let x = Tensor::ones((8, 16), DType::F32, &Device::Cpu)?;
//!     comm.all_to_all(&x).map(|y| y.dims().to_vec())
//! })?;
//! ```

mod communicator;
mod handle;
mod local_group;
mod process_group;

pub(crate) use communicator::{check_dim, split_even};
pub use communicator::{DeviceCommunicator, MockCommunicator, ReduceOp};
pub use handle::CommHandle;
pub use local_group::{run_ranks, spawn_ranks, InProcessCommunicator};
pub use process_group::{LocalProcessGroup, ProcessGroup};
