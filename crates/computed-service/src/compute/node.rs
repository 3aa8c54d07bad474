use std::sync::Arc;

use futures::channel::oneshot;
use futures::future::Shared;
use rustc_hash::FxHashSet;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::{ComputeError, ComputedKey, MethodOptions};

/// Lifecycle state of a computed node.
///
/// ```text
/// <none> -> Computing -> Consistent -> Invalidated -> Computing
///           Computing -> Invalidated                (failure)
///                        Consistent -> Disposed     (teardown)
///                                      Invalidated -> Disposed (keep-alive expiry)
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeState {
    Computing,
    Consistent,
    Invalidated,
    Disposed,
}

/// A successfully computed value together with the version that produced it.
#[derive(Clone, Debug, PartialEq)]
pub struct Computed {
    pub value: Arc<Value>,
    pub version: u64,
}

impl Computed {
    /// Deserializes the value into a concrete type.
    pub fn deserialize<T: DeserializeOwned>(&self) -> Result<T, ComputeError> {
        Ok(T::deserialize(&*self.value)?)
    }
}

/// The outcome of one computation as handed to every waiter.
///
/// Outcomes that were never stored in a node, like cancellations, carry version `0`.
#[derive(Clone, Debug)]
pub(crate) struct Output {
    pub result: Result<Arc<Value>, ComputeError>,
    pub version: u64,
}

impl Output {
    pub fn unversioned(err: ComputeError) -> Self {
        Self {
            result: Err(err),
            version: 0,
        }
    }

    pub fn into_computed(self) -> Result<Computed, ComputeError> {
        let version = self.version;
        self.result.map(|value| Computed { value, version })
    }
}

pub(crate) type ComputationChannel = Shared<oneshot::Receiver<Output>>;

/// Bookkeeping for the computation currently running for a node.
#[derive(Debug)]
pub(crate) struct InFlight {
    pub id: u64,
    pub channel: ComputationChannel,
    pub cancel: CancellationToken,
    /// Callers currently awaiting `channel`.
    pub waiters: usize,
    /// Set when an invalidation reached the node while it was computing.
    pub invalidated: bool,
    /// Keys this computation is waiting for right now, once per pending call.
    pub awaiting: Vec<ComputedKey>,
}

/// Index of a node inside the [`NodeTable`](super::graph::NodeTable) arena.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub(crate) struct NodeId(pub u32);

#[derive(Debug)]
pub(crate) struct Node {
    pub key: ComputedKey,
    pub options: MethodOptions,
    pub state: NodeState,
    /// Last stored outcome, if any computation has finished yet.
    pub output: Option<Output>,
    pub version: u64,
    /// Nodes read by the computation that produced `output`.
    pub dependencies: Vec<NodeId>,
    /// Nodes whose `dependencies` contain this node.
    pub dependents: FxHashSet<NodeId>,
    pub last_accessed: Instant,
    pub auto_invalidate_at: Option<Instant>,
    pub computation: Option<InFlight>,
}

impl Node {
    pub fn new(key: ComputedKey, options: MethodOptions, now: Instant) -> Self {
        Self {
            key,
            options,
            // A fresh node has nothing to serve and is computed right away.
            state: NodeState::Invalidated,
            output: None,
            version: 0,
            dependencies: Vec::new(),
            dependents: FxHashSet::default(),
            last_accessed: now,
            auto_invalidate_at: None,
            computation: None,
        }
    }

    /// Whether the keep-alive window elapsed without access.
    pub fn is_unused(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.last_accessed) > self.options.keep_alive_time
    }

    /// Whether the auto-invalidation deadline has passed.
    pub fn is_outdated(&self, now: Instant) -> bool {
        self.auto_invalidate_at.is_some_and(|at| at <= now)
    }
}

/// A point-in-time view of a node, for inspection and tests.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct NodeSnapshot {
    pub key: ComputedKey,
    pub state: NodeState,
    pub version: u64,
    pub dependencies: Vec<ComputedKey>,
    pub dependents: Vec<ComputedKey>,
    pub waiters: usize,
}
