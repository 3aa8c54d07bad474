//! The authoritative compute-cache.
//!
//! A [`ComputeService`] owns a table of computed nodes. Each node caches the result of one
//! [`ComputedKey`], remembers which other nodes its computation read, and is invalidated
//! together with everything depending on it once any of those reads changes.

mod error;
mod expiry;
mod graph;
mod key;
mod node;
mod registry;
mod service;
mod tracker;


pub use error::ComputeError;
pub use key::ComputedKey;
pub use node::{Computed, NodeSnapshot, NodeState};
pub use registry::MethodOptions;
pub use service::{ComputeService, ComputeServiceBuilder, InvalidationEvent};
pub use tracker::ComputeContext;

pub(crate) use node::Output;
