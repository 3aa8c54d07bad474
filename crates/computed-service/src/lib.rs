//! A reactive compute-cache with distributed invalidation.
//!
//! The [`ComputeService`] memoizes the results of registered compute methods, records which
//! results were read while computing others, and propagates invalidation along those edges.
//! Invalidations are coalesced per consumer by the [`UpdateDelayer`](delayer::UpdateDelayer)
//! and pushed to [`Replica`](replica::Replica)s, which mirror results on the client side and
//! refetch them lazily.

#[macro_use]
pub mod metrics;

pub mod compute;
pub mod config;
pub mod delayer;
pub mod hub;
pub mod logging;
pub mod replica;
pub mod transport;
pub mod utils;

pub use compute::{
    ComputeContext, ComputeError, ComputeService, ComputeServiceBuilder, Computed, ComputedKey,
    MethodOptions, NodeSnapshot, NodeState,
};
