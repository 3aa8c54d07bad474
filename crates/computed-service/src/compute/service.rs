use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::channel::oneshot;
use futures::FutureExt;
use parking_lot::Mutex;
use sentry::{Hub, SentryFutureExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use super::expiry::{self, Deadline};
use super::graph::NodeTable;
use super::node::{ComputationChannel, InFlight, Node, NodeId, Output};
use super::registry::{self, MethodRegistry, RegisteredMethod};
use super::tracker::{with_tracking, Read};
use super::{
    ComputeContext, ComputeError, Computed, ComputedKey, MethodOptions, NodeSnapshot, NodeState,
};
use crate::config::CacheConfig;
use crate::transport::{FetchResponse, InstanceId};
use crate::utils::futures::CallOnDrop;

/// The set of keys invalidated by one propagation pass.
pub type InvalidationEvent = Arc<[ComputedKey]>;

pub(crate) struct ServiceInner {
    pub table: Mutex<NodeTable>,
    registry: MethodRegistry,
    overrides: BTreeMap<String, MethodOptions>,
    /// Versions are only meaningful together with the instance that handed them out.
    instance: InstanceId,
    versions: AtomicU64,
    computation_ids: AtomicU64,
    events: broadcast::Sender<InvalidationEvent>,
    timers: mpsc::UnboundedSender<Deadline>,
    pub shutdown: CancellationToken,
}

impl Drop for ServiceInner {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// The authoritative compute-cache.
///
/// Answers "compute or return the cached value for this key", runs at most one computation per
/// key at a time, tracks dependencies between nodes and propagates invalidation along them.
///
/// Cloning is cheap; all clones share the same node table.
#[derive(Clone)]
pub struct ComputeService {
    pub(crate) inner: Arc<ServiceInner>,
}

impl fmt::Debug for ComputeService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let nodes = self.inner.table.try_lock().map(|t| t.len());
        f.debug_struct("ComputeService")
            .field("registry", &self.inner.registry)
            .field("nodes", &nodes)
            .finish()
    }
}

/// Collects compute methods and configuration before starting a [`ComputeService`].
pub struct ComputeServiceBuilder {
    config: CacheConfig,
    overrides: BTreeMap<String, MethodOptions>,
    registry: MethodRegistry,
}

impl ComputeServiceBuilder {
    /// Per-method option overrides, keyed by `service.method`.
    pub fn method_options(mut self, overrides: BTreeMap<String, MethodOptions>) -> Self {
        self.overrides = overrides;
        self
    }

    /// Registers a compute method.
    ///
    /// The arguments of incoming keys are deserialized into `A`, usually a tuple, and the
    /// returned value is stored as JSON.
    pub fn register<A, T, F, Fut>(
        mut self,
        service: &str,
        method: &str,
        options: MethodOptions,
        compute: F,
    ) -> Self
    where
        A: DeserializeOwned + Send + 'static,
        T: Serialize + Send + 'static,
        F: Fn(ComputeContext, A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, ComputeError>> + Send + 'static,
    {
        let method_id = format!("{service}.{method}");
        let compute = registry::erase(compute);
        self.registry
            .insert(method_id, RegisteredMethod { options, compute });
        self
    }

    /// Starts the service and its background expiry tasks.
    ///
    /// Must be called from within a tokio runtime.
    pub fn build(mut self) -> ComputeService {
        self.registry.apply_overrides(&self.overrides);

        let (events, _) = broadcast::channel(self.config.event_capacity.max(1));
        let (timers, timer_rx) = mpsc::unbounded_channel();
        let service = ComputeService {
            inner: Arc::new(ServiceInner {
                table: Mutex::new(NodeTable::default()),
                registry: self.registry,
                overrides: self.overrides,
                instance: InstanceId::new_v4(),
                versions: AtomicU64::new(0),
                computation_ids: AtomicU64::new(0),
                events,
                timers,
                shutdown: CancellationToken::new(),
            }),
        };
        expiry::spawn_expiry_tasks(&service, timer_rx, self.config.sweep_interval);
        tracing::debug!("Started {:?}", service);
        service
    }
}

enum Lookup {
    Hit(Output),
    Wait {
        channel: ComputationChannel,
        computation: u64,
    },
    Cycle(ComputeError),
}

/// Decrements the waiter count of a computation when a caller stops waiting.
struct Waiter<'a> {
    service: &'a ComputeService,
    key: &'a ComputedKey,
    computation: u64,
    caller: Option<&'a ComputeContext>,
}

impl Drop for Waiter<'_> {
    fn drop(&mut self) {
        self.service
            .release_waiter(self.key, self.computation, self.caller);
    }
}

impl ComputeService {
    pub fn builder(config: &CacheConfig) -> ComputeServiceBuilder {
        ComputeServiceBuilder {
            config: config.clone(),
            overrides: BTreeMap::new(),
            registry: MethodRegistry::new(MethodOptions {
                auto_invalidate_time: None,
                keep_alive_time: config.default_keep_alive_time,
            }),
        }
    }

    /// Returns the cached value of a registered compute method, computing it if needed.
    pub async fn call(&self, key: ComputedKey) -> Result<Computed, ComputeError> {
        self.call_inner(key, None, None).await.into_computed()
    }

    /// Like [`call`](Self::call), but deserializes the value.
    pub async fn call_as<T: DeserializeOwned>(&self, key: ComputedKey) -> Result<T, ComputeError> {
        self.call(key).await?.deserialize()
    }

    /// Like [`call`](Self::call), but stops waiting once `cancel` fires.
    ///
    /// The computation itself keeps running as long as other callers wait for it.
    pub async fn call_cancellable(
        &self,
        key: ComputedKey,
        cancel: &CancellationToken,
    ) -> Result<Computed, ComputeError> {
        self.call_inner(key, None, Some(cancel))
            .await
            .into_computed()
    }

    /// Answers a fetch from a replica, carrying the outcome and its version either way.
    pub async fn fetch(&self, key: ComputedKey) -> FetchResponse {
        let output = self.call_inner(key, None, None).await;
        FetchResponse::from_output(output, self.inner.instance)
    }

    /// Identifies this run of the service. A restarted service starts over with new versions.
    pub fn instance(&self) -> InstanceId {
        self.inner.instance
    }

    pub(crate) async fn call_tracked(
        &self,
        key: ComputedKey,
        caller: &ComputeContext,
    ) -> Result<Computed, ComputeError> {
        self.call_inner(key, Some(caller), None)
            .await
            .into_computed()
    }

    pub(crate) async fn call_inner(
        &self,
        key: ComputedKey,
        caller: Option<&ComputeContext>,
        cancel: Option<&CancellationToken>,
    ) -> Output {
        let Some(method) = self.inner.registry.get(&key) else {
            return Output::unversioned(ComputeError::UnknownMethod(key.method_id()));
        };
        let compute = method.compute.clone();
        self.run(key, move |ctx| compute(ctx), caller, cancel).await
    }

    /// Returns the cached value for `key`, running `compute` only on a miss.
    pub async fn get_or_compute<F, Fut>(
        &self,
        key: ComputedKey,
        compute: F,
    ) -> Result<Computed, ComputeError>
    where
        F: FnOnce(ComputeContext) -> Fut + Send + 'static,
        Fut: Future<Output = Result<Value, ComputeError>> + Send + 'static,
    {
        self.run(key, compute, None, None).await.into_computed()
    }

    /// Like [`get_or_compute`](Self::get_or_compute), but stops waiting once `cancel` fires.
    pub async fn get_or_compute_cancellable<F, Fut>(
        &self,
        key: ComputedKey,
        compute: F,
        cancel: &CancellationToken,
    ) -> Result<Computed, ComputeError>
    where
        F: FnOnce(ComputeContext) -> Fut + Send + 'static,
        Fut: Future<Output = Result<Value, ComputeError>> + Send + 'static,
    {
        self.run(key, compute, None, Some(cancel))
            .await
            .into_computed()
    }

    pub(crate) async fn get_or_compute_tracked<F, Fut>(
        &self,
        key: ComputedKey,
        compute: F,
        caller: &ComputeContext,
    ) -> Result<Computed, ComputeError>
    where
        F: FnOnce(ComputeContext) -> Fut + Send + 'static,
        Fut: Future<Output = Result<Value, ComputeError>> + Send + 'static,
    {
        self.run(key, compute, Some(caller), None)
            .await
            .into_computed()
    }

    async fn run<F, Fut>(
        &self,
        key: ComputedKey,
        compute: F,
        caller: Option<&ComputeContext>,
        cancel: Option<&CancellationToken>,
    ) -> Output
    where
        F: FnOnce(ComputeContext) -> Fut + Send + 'static,
        Fut: Future<Output = Result<Value, ComputeError>> + Send + 'static,
    {
        if self.inner.shutdown.is_cancelled() {
            return Output::unversioned(ComputeError::Disposed);
        }
        if let Some(caller) = caller {
            if let Err(err) = caller.check_reentrancy(&key) {
                tracing::error!(error = %err, "Cyclic dependency detected");
                return Output::unversioned(err);
            }
        }

        let (lookup, expired) = self.lookup_or_spawn(&key, compute, caller);
        self.publish(expired);

        let output = match lookup {
            Lookup::Hit(output) => output,
            Lookup::Cycle(err) => {
                tracing::error!(error = %err, "Cyclic dependency detected");
                return Output::unversioned(err);
            }
            Lookup::Wait {
                channel,
                computation,
            } => {
                let waiter = Waiter {
                    service: self,
                    key: &key,
                    computation,
                    caller,
                };
                let received = match cancel {
                    Some(cancel) => tokio::select! {
                        received = channel => received,
                        _ = cancel.cancelled() => return Output::unversioned(ComputeError::Cancelled),
                    },
                    None => channel.await,
                };
                drop(waiter);
                // The sender is only dropped without sending if the computation panicked.
                received.unwrap_or_else(|_| {
                    self.abandon(&key, computation);
                    Output::unversioned(ComputeError::InternalError)
                })
            }
        };

        if let Some(caller) = caller {
            caller.record(key, output.version);
        }
        output
    }

    /// Serves a cache hit, joins an in-flight computation or spawns a new one.
    fn lookup_or_spawn<F, Fut>(
        &self,
        key: &ComputedKey,
        compute: F,
        caller: Option<&ComputeContext>,
    ) -> (Lookup, Vec<ComputedKey>)
    where
        F: FnOnce(ComputeContext) -> Fut + Send + 'static,
        Fut: Future<Output = Result<Value, ComputeError>> + Send + 'static,
    {
        let now = Instant::now();
        let mut table = self.inner.table.lock();
        let id = match table.lookup(key) {
            Some(id) => id,
            None => {
                let options = self.options_for(key);
                table.insert(Node::new(key.clone(), options, now))
            }
        };
        let expired = expiry::expire_on_access(&mut table, id, now);

        // Joining a computation that already waits for this caller's chain would deadlock.
        if let Some(caller) = caller {
            if let Some(chain) = table.find_wait_cycle(key, caller.stack()) {
                return (Lookup::Cycle(caller.cycle(&chain)), expired);
            }
        }

        let node = table.get_mut(id);
        node.last_accessed = now;
        if node.state == NodeState::Consistent {
            if let Some(output) = &node.output {
                tracing::trace!("Cache hit for {}", key);
                metric!(counter("computed.cache.hit") += 1);
                return (Lookup::Hit(output.clone()), expired);
            }
        }

        let joinable = node.state == NodeState::Computing;
        let joined = match node.computation.as_mut() {
            Some(computation) if joinable && !computation.cancel.is_cancelled() => {
                // A concurrent lookup was deduplicated.
                metric!(counter("computed.channel.hit") += 1);
                computation.waiters += 1;
                Some(Lookup::Wait {
                    channel: computation.channel.clone(),
                    computation: computation.id,
                })
            }
            _ => None,
        };
        let lookup = match joined {
            Some(lookup) => lookup,
            None => {
                metric!(counter("computed.cache.miss") += 1);
                self.spawn_computation(node, compute, caller)
            }
        };

        if let Some(caller) = caller {
            if let Some(computation) = table.computation_mut(caller.key(), caller.computation()) {
                computation.awaiting.push(key.clone());
            }
        }
        (lookup, expired)
    }

    /// Spawns the computation for `node` as a separate task and marks the node as computing.
    ///
    /// The computation runs on its own task so that it completes for the remaining waiters
    /// even when the caller that started it goes away.
    fn spawn_computation<F, Fut>(
        &self,
        node: &mut Node,
        compute: F,
        caller: Option<&ComputeContext>,
    ) -> Lookup
    where
        F: FnOnce(ComputeContext) -> Fut + Send + 'static,
        Fut: Future<Output = Result<Value, ComputeError>> + Send + 'static,
    {
        let id = self.inner.computation_ids.fetch_add(1, Ordering::Relaxed) + 1;
        let cancel = self.inner.shutdown.child_token();
        let key = node.key.clone();
        let ctx = ComputeContext::new(self.clone(), key.clone(), id, caller, cancel.clone());

        let (sender, receiver) = oneshot::channel();
        let channel = receiver.shared();
        node.state = NodeState::Computing;
        node.computation = Some(InFlight {
            id,
            channel: channel.clone(),
            cancel,
            waiters: 1,
            invalidated: false,
            awaiting: Vec::new(),
        });

        let abandon_token = {
            let inner = Arc::downgrade(&self.inner);
            let key = key.clone();
            CallOnDrop::new(move || {
                if let Some(inner) = inner.upgrade() {
                    ComputeService { inner }.abandon(&key, id);
                }
            })
        };

        let service = self.clone();
        let span = tracing::debug_span!("compute", key = %key);
        let computation = async move {
            tracing::debug!("Computing {}", key);
            let start = Instant::now();
            let (result, reads) = with_tracking(&ctx, compute(ctx.clone())).await;
            metric!(timer("computed.computation.duration") = start.elapsed());
            let output = service.commit(&key, id, result, reads);
            abandon_token.disarm();
            sender.send(output).ok();
        }
        .instrument(span)
        .bind_hub(Hub::new_from_top(Hub::current()));
        tokio::spawn(computation);

        Lookup::Wait {
            channel,
            computation: id,
        }
    }

    /// Stores the outcome of computation `id`, replacing the node's dependency edges.
    ///
    /// A result whose computation was invalidated mid-flight, or that read a dependency which
    /// has since been invalidated, is stored as `Invalidated` right away and announced.
    fn commit(
        &self,
        key: &ComputedKey,
        id: u64,
        result: Result<Value, ComputeError>,
        reads: Vec<Read>,
    ) -> Output {
        let now = Instant::now();
        let mut table = self.inner.table.lock();
        let Some(node_id) = table.lookup(key) else {
            return Output::unversioned(ComputeError::Disposed);
        };
        let node = table.get_mut(node_id);
        let computation = match node.computation.take() {
            Some(computation) if computation.id == id => computation,
            other => {
                // This computation was superseded after every waiter gave up on it.
                node.computation = other;
                return Output::unversioned(ComputeError::Cancelled);
            }
        };

        if let Err(ComputeError::Cancelled) = result {
            tracing::debug!("Computation of {} cancelled", key);
            node.state = NodeState::Invalidated;
            return Output::unversioned(ComputeError::Cancelled);
        }

        let mut stale = computation.invalidated;
        let mut dependencies = Vec::with_capacity(reads.len());
        for (dependency, version) in reads {
            match table.lookup(&dependency) {
                Some(dep_id) => {
                    let dep = table.get(dep_id);
                    stale |= dep.state != NodeState::Consistent || dep.version != version;
                    dependencies.push(dep_id);
                }
                None => stale = true,
            }
        }
        table.set_dependencies(node_id, dependencies);

        let version = self.inner.versions.fetch_add(1, Ordering::SeqCst) + 1;
        let output = Output {
            result: result.map(Arc::new),
            version,
        };
        let node = table.get_mut(node_id);
        node.version = version;
        node.output = Some(output.clone());

        let mut invalidated = Vec::new();
        match &output.result {
            Ok(_) => {
                metric!(counter("computed.computation.ok") += 1);
                node.state = NodeState::Consistent;
                node.auto_invalidate_at = node.options.auto_invalidate_time.map(|ttl| now + ttl);
                if let Some(at) = node.auto_invalidate_at {
                    let deadline = Deadline {
                        key: key.clone(),
                        version,
                        at,
                    };
                    self.inner.timers.send(deadline).ok();
                }
                if stale {
                    tracing::debug!("{} was invalidated while computing", key);
                    invalidated = table.invalidate(node_id);
                }
            }
            Err(err) => {
                metric!(counter("computed.computation.failed") += 1);
                tracing::debug!(error = %err, "Computation of {} failed", key);
                node.state = NodeState::Invalidated;
            }
        }
        drop(table);

        self.publish(invalidated);
        output
    }

    /// Resets a node whose computation task went away without committing.
    fn abandon(&self, key: &ComputedKey, id: u64) {
        let mut table = self.inner.table.lock();
        let Some(node_id) = table.lookup(key) else {
            return;
        };
        let node = table.get_mut(node_id);
        if node.computation.as_ref().map(|c| c.id) == Some(id) {
            tracing::error!("Computation of {} was abandoned", key);
            node.computation = None;
            node.state = NodeState::Invalidated;
        }
    }

    fn release_waiter(&self, key: &ComputedKey, id: u64, caller: Option<&ComputeContext>) {
        let mut table = self.inner.table.lock();
        if let Some(caller) = caller {
            if let Some(computation) = table.computation_mut(caller.key(), caller.computation()) {
                if let Some(pos) = computation.awaiting.iter().position(|k| k == key) {
                    computation.awaiting.swap_remove(pos);
                }
            }
        }
        if let Some(computation) = table.computation_mut(key, id) {
            computation.waiters = computation.waiters.saturating_sub(1);
            if computation.waiters == 0 {
                tracing::debug!("Nobody waits for {} any longer, cancelling", key);
                computation.cancel.cancel();
            }
        }
    }

    /// Invalidates `key` and everything that transitively depends on it.
    ///
    /// All affected nodes are marked before this returns. Returns the keys that were
    /// consistent before and are invalidated now.
    pub fn invalidate(&self, key: &ComputedKey) -> Vec<ComputedKey> {
        let invalidated = {
            let mut table = self.inner.table.lock();
            match table.lookup(key) {
                Some(id) => table.invalidate(id),
                None => Vec::new(),
            }
        };
        tracing::debug!("Invalidating {} affected {} nodes", key, invalidated.len());
        self.publish(invalidated.clone());
        invalidated
    }

    /// Invalidates `key` only if it still holds the value produced as `version`.
    pub(crate) fn invalidate_version(&self, key: &ComputedKey, version: u64) -> usize {
        let invalidated = {
            let mut table = self.inner.table.lock();
            match table.lookup(key) {
                Some(id) if table.get(id).version == version => table.invalidate(id),
                _ => Vec::new(),
            }
        };
        let count = invalidated.len();
        self.publish(invalidated);
        count
    }

    /// Announces a propagation pass to every invalidation subscriber.
    pub(crate) fn publish(&self, keys: Vec<ComputedKey>) {
        if keys.is_empty() {
            return;
        }
        metric!(counter("computed.invalidated") += keys.len() as i64);
        // Sending only fails when nobody listens.
        self.inner.events.send(Arc::from(keys)).ok();
    }

    /// Subscribes to every invalidation pass of this service.
    pub fn subscribe(&self) -> broadcast::Receiver<InvalidationEvent> {
        self.inner.events.subscribe()
    }

    pub(crate) fn options_for(&self, key: &ComputedKey) -> MethodOptions {
        self.inner.registry.options_for(key, &self.inner.overrides)
    }

    /// Returns a point-in-time view of the node for `key`.
    pub fn snapshot(&self, key: &ComputedKey) -> Option<NodeSnapshot> {
        let table = self.inner.table.lock();
        let id = table.lookup(key)?;
        let node = table.get(id);
        Some(NodeSnapshot {
            key: node.key.clone(),
            state: node.state,
            version: node.version,
            dependencies: sorted_keys(&table, &node.dependencies),
            dependents: sorted_keys(&table, &node.dependents),
            waiters: node.computation.as_ref().map_or(0, |c| c.waiters),
        })
    }

    /// The number of nodes in the cache table.
    pub fn len(&self) -> usize {
        self.inner.table.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Disposes every node of `service`, invalidating whatever depended on them.
    pub fn dispose_service(&self, service: &str) -> usize {
        let (invalidated, disposed) = {
            let mut table = self.inner.table.lock();
            let ids: Vec<_> = table
                .ids()
                .into_iter()
                .filter(|id| table.get(*id).key.service() == service)
                .collect();
            let mut invalidated = Vec::new();
            for id in &ids {
                invalidated.extend(table.invalidate(*id));
            }
            for id in &ids {
                if let Some(computation) = table.get_mut(*id).computation.take() {
                    computation.cancel.cancel();
                }
                table.remove(*id);
            }
            (invalidated, ids.len())
        };
        tracing::info!("Disposed {} nodes of service {}", disposed, service);
        self.publish(invalidated);
        disposed
    }

    /// Tears the whole service down: stops background tasks, cancels computations and
    /// disposes every node. Later calls fail with [`ComputeError::Disposed`].
    pub fn dispose(&self) {
        self.inner.shutdown.cancel();
        let mut table = self.inner.table.lock();
        let ids = table.ids();
        for id in &ids {
            if let Some(computation) = table.get_mut(*id).computation.take() {
                computation.cancel.cancel();
            }
            table.remove(*id);
        }
        tracing::info!("Disposed compute service with {} nodes", ids.len());
    }
}

fn sorted_keys<'a>(table: &NodeTable, ids: impl IntoIterator<Item = &'a NodeId>) -> Vec<ComputedKey> {
    let mut keys: Vec<_> = ids.into_iter().map(|id| table.get(*id).key.clone()).collect();
    keys.sort();
    keys
}
