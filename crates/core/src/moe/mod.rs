//! Mixture of Experts (MoE) token routing.
//!
//! This module moves token rows between a batch and per-expert capacity buffers
//! and across expert-parallel ranks.
//!
//! ## Submodules
//!
//! - [`kernels`]: Row-permutation kernel provider and its portable implementation
//! - [`routing`]: Host-side validated view of mask and destination indices
//! - [`token_dispatch`]: Dispatch/combine operators and `moe_cumsum`
//! - [`ep_exchange`]: Dispatch → all-to-all → scaler composition for EP layers

pub mod ep_exchange;
pub mod kernels;
pub mod routing;
pub mod token_dispatch;

pub use ep_exchange::{
    ExchangeCombineContext, ExchangeDispatchContext, ExchangeTopology, ExpertParallelExchange,
};
pub use kernels::{load_moe_kernels, CandleMoeKernels, CombineShape, DispatchShape, MoeKernels};
pub use routing::{Assignment, RoutingTable};
pub use token_dispatch::{
    cumsum_kernel_supports, moe_combine, moe_cumsum, moe_dispatch, CombineContext, CombineGrads,
    DispatchContext,
};
