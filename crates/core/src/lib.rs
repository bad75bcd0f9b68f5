//! Communication and token routing for expert-parallel Mixture-of-Experts
//! training.
//!
//! Tokens are routed into per-expert capacity buffers, moved to the ranks
//! hosting their experts, and moved back; every movement is a paired
//! forward/backward operation whose backward is the exact adjoint.
//!
//! - [`distributed`]: process groups, transports, completion handles
//! - [`ops`]: differentiable collectives, gradient scalers, TP shard/unshard
//! - [`moe`]: dispatch/combine, kernel provider, expert-parallel exchange
//! - [`config`]: TOML configuration

pub mod config;
pub mod distributed;
pub mod error;
pub mod moe;
pub mod ops;

pub use config::{ConfigError, ConfigOverrides, MoeCommConfig};
pub use error::{MoeCommError, Result};
pub use ops::Backward;
