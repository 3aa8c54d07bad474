//! Dependency tracking for running computations.
//!
//! Every computation receives a [`ComputeContext`]. Reads of other nodes made through the
//! context are recorded together with the version that was observed, and become the node's
//! dependency edges when the computation commits.

use std::future::Future;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

use super::{ComputeError, ComputeService, Computed, ComputedKey};

/// A read of another node: its key and the version that was handed out.
pub(crate) type Read = (ComputedKey, u64);

/// The ambient context of one computation.
///
/// Cloning the context is cheap, and all clones record into the same dependency set.
#[derive(Clone, Debug)]
pub struct ComputeContext {
    service: ComputeService,
    /// The chain of computations that led here, ending with this computation's own key.
    stack: Arc<[ComputedKey]>,
    /// Id of the in-flight computation this context belongs to.
    computation: u64,
    reads: Arc<Mutex<Vec<Read>>>,
    cancel: CancellationToken,
}

impl ComputeContext {
    pub(crate) fn new(
        service: ComputeService,
        key: ComputedKey,
        computation: u64,
        caller: Option<&ComputeContext>,
        cancel: CancellationToken,
    ) -> Self {
        let stack = match caller {
            Some(caller) => caller.stack.iter().cloned().chain([key]).collect(),
            None => Arc::from([key]),
        };
        Self {
            service,
            stack,
            computation,
            reads: Default::default(),
            cancel,
        }
    }

    /// The key being computed.
    pub fn key(&self) -> &ComputedKey {
        // The stack is never empty.
        &self.stack[self.stack.len() - 1]
    }

    /// Deserializes the arguments of the key being computed.
    pub fn args<T: DeserializeOwned>(&self) -> Result<T, ComputeError> {
        self.key().args()
    }

    /// The service this computation runs in.
    pub fn service(&self) -> &ComputeService {
        &self.service
    }

    /// Calls a registered compute method and records the read as a dependency.
    pub async fn call(&self, key: ComputedKey) -> Result<Computed, ComputeError> {
        self.service.call_tracked(key, self).await
    }

    /// Like [`call`](Self::call), but deserializes the value.
    pub async fn call_as<T: DeserializeOwned>(&self, key: ComputedKey) -> Result<T, ComputeError> {
        self.call(key).await?.deserialize()
    }

    /// Reads or computes an ad-hoc node and records the read as a dependency.
    pub async fn get_or_compute<F, Fut>(
        &self,
        key: ComputedKey,
        compute: F,
    ) -> Result<Computed, ComputeError>
    where
        F: FnOnce(ComputeContext) -> Fut + Send + 'static,
        Fut: Future<Output = Result<Value, ComputeError>> + Send + 'static,
    {
        self.service
            .get_or_compute_tracked(key, compute, self)
            .await
    }

    /// Whether every caller stopped waiting for this computation.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves once every caller stopped waiting for this computation.
    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.cancel.cancelled()
    }

    pub(crate) fn stack(&self) -> &[ComputedKey] {
        &self.stack
    }

    pub(crate) fn computation(&self) -> u64 {
        self.computation
    }

    /// Fails with a cycle error if `key` is already being computed up this call chain.
    pub(crate) fn check_reentrancy(&self, key: &ComputedKey) -> Result<(), ComputeError> {
        if !self.stack.contains(key) {
            return Ok(());
        }
        Err(self.cycle(std::slice::from_ref(key)))
    }

    /// A cycle error for this call chain continued by `tail`.
    pub(crate) fn cycle(&self, tail: &[ComputedKey]) -> ComputeError {
        let chain: Vec<_> = self
            .stack
            .iter()
            .chain(tail)
            .map(|k| k.to_string())
            .collect();
        ComputeError::Cycle(chain.join(" -> "))
    }

    pub(crate) fn record(&self, key: ComputedKey, version: u64) {
        self.reads.lock().push((key, version));
    }

    pub(crate) fn take_reads(&self) -> Vec<Read> {
        std::mem::take(&mut *self.reads.lock())
    }
}

/// Runs `body` as the computation of `ctx`, returning its result along with every read it made.
///
/// Reads are collected even when `body` fails, so a failed computation still knows what it
/// looked at.
pub(crate) async fn with_tracking<Fut>(
    ctx: &ComputeContext,
    body: Fut,
) -> (Result<Value, ComputeError>, Vec<Read>)
where
    Fut: Future<Output = Result<Value, ComputeError>>,
{
    let result = tokio::select! {
        result = body => result,
        _ = ctx.cancelled() => Err(ComputeError::Cancelled),
    };
    (result, ctx.take_reads())
}
