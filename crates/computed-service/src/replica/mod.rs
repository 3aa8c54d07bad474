//! Client-side mirrors of computed values.
//!
//! A [`Replica`] caches values fetched through a [`Transport`] and keeps them until the push
//! channel reports them invalidated. Invalidated entries are refetched lazily on the next access.
//! While the push channel is down the replica keeps serving cached entries for a grace period,
//! after which every access goes to the service until the channel is back.

use std::slice;
use std::sync::{Arc, Weak};

use futures::StreamExt;
use parking_lot::Mutex;
use rustc_hash::{FxHashMap, FxHashSet};
use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::compute::{ComputeError, Computed, ComputedKey};
use crate::config::ReplicaConfig;
use crate::transport::{InstanceId, InvalidationBatch, SessionId, Transport, TransportError};

/// An error returned from [`Replica::get`].
#[derive(Debug, Error)]
pub enum ReplicaError {
    /// The service answered, but the computation failed.
    #[error(transparent)]
    Compute(#[from] ComputeError),
    /// The service could not be reached. The last known value is still available through
    /// [`Replica::peek`].
    #[error("failed to reach the compute service")]
    Transport(#[from] TransportError),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum EntryState {
    Consistent,
    Invalidated,
}

#[derive(Debug)]
struct Entry {
    value: Option<Arc<Value>>,
    version: u64,
    /// The service instance `version` comes from.
    instance: Option<InstanceId>,
    state: EntryState,
    /// Bumped on every invalidation, to detect invalidations racing with a fetch.
    invalidations: u64,
    /// The push channel session this key is subscribed on.
    subscribed: Option<SessionId>,
}

impl Default for Entry {
    fn default() -> Self {
        Self {
            value: None,
            version: 0,
            instance: None,
            state: EntryState::Invalidated,
            invalidations: 0,
            subscribed: None,
        }
    }
}

impl Entry {
    fn invalidate(&mut self) {
        self.state = EntryState::Invalidated;
        self.invalidations += 1;
    }

    fn computed(&self) -> Option<Computed> {
        let value = self.value.clone()?;
        Some(Computed {
            value,
            version: self.version,
        })
    }
}

#[derive(Clone, Copy, Debug)]
enum Connection {
    Connected { session: SessionId },
    Disconnected { since: Instant },
}

#[derive(Debug)]
struct ReplicaState {
    entries: FxHashMap<ComputedKey, Entry>,
    connection: Connection,
}

impl ReplicaState {
    fn session(&self) -> Option<SessionId> {
        match self.connection {
            Connection::Connected { session } => Some(session),
            Connection::Disconnected { .. } => None,
        }
    }
}

struct ReplicaInner {
    transport: Arc<dyn Transport>,
    config: ReplicaConfig,
    state: Mutex<ReplicaState>,
    connected: watch::Sender<bool>,
    shutdown: CancellationToken,
}

impl Drop for ReplicaInner {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// A client-side cache of computed values kept current by pushed invalidations.
///
/// Cloning is cheap, clones share the same entries and push channel.
#[derive(Clone)]
pub struct Replica {
    inner: Arc<ReplicaInner>,
}

impl std::fmt::Debug for Replica {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.try_lock();
        f.debug_struct("Replica")
            .field("entries", &state.as_ref().map(|s| s.entries.len()))
            .field("connection", &state.as_ref().map(|s| s.connection))
            .finish()
    }
}

impl Replica {
    /// Creates a replica and starts connecting its push channel.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(transport: Arc<dyn Transport>, config: ReplicaConfig) -> Self {
        let (connected, _) = watch::channel(false);
        let inner = Arc::new(ReplicaInner {
            transport,
            config,
            state: Mutex::new(ReplicaState {
                entries: FxHashMap::default(),
                connection: Connection::Disconnected {
                    since: Instant::now(),
                },
            }),
            connected,
            shutdown: CancellationToken::new(),
        });
        tokio::spawn(run_push_channel(
            Arc::downgrade(&inner),
            inner.transport.clone(),
            config,
            inner.shutdown.clone(),
        ));
        Self { inner }
    }

    /// Returns the value of `key`, from the local cache when it is known to be current.
    pub async fn get(&self, key: &ComputedKey) -> Result<Computed, ReplicaError> {
        let (session, invalidations) = {
            let mut state = self.inner.state.lock();
            let healthy = self.is_push_healthy(&state);
            let session = state.session();
            let entry = state.entries.entry(key.clone()).or_default();
            if healthy && entry.state == EntryState::Consistent {
                if let Some(computed) = entry.computed() {
                    metric!(counter("replica.hit") += 1);
                    return Ok(computed);
                }
            }
            let session = session.filter(|current| entry.subscribed != Some(*current));
            (session, entry.invalidations)
        };

        // Subscribe before fetching, so an invalidation can not slip in between the two.
        let mut subscribed = true;
        if let Some(session) = session {
            match self
                .inner
                .transport
                .subscribe(session, slice::from_ref(key))
                .await
            {
                Ok(()) => {
                    let mut state = self.inner.state.lock();
                    if let Some(entry) = state.entries.get_mut(key) {
                        entry.subscribed = Some(session);
                    }
                }
                Err(err) => {
                    tracing::warn!(
                        error = &err as &dyn std::error::Error,
                        "Failed to subscribe to {}",
                        key
                    );
                    subscribed = false;
                }
            }
        }

        metric!(counter("replica.fetch") += 1);
        let response = self.inner.transport.fetch(key).await?;

        let mut state = self.inner.state.lock();
        let entry = state.entries.entry(key.clone()).or_default();
        let same_instance = response.instance == entry.instance;
        if same_instance && response.version != 0 && response.version < entry.version {
            // A concurrent fetch already stored a newer outcome.
            tracing::trace!("Discarding outdated response for {}", key);
            return match entry.computed() {
                Some(computed) => Ok(computed),
                None => Err(ComputeError::Cancelled.into()),
            };
        }

        if !same_instance && entry.instance.is_some() {
            tracing::info!(
                "Service instance changed, accepting {} at version {}",
                key,
                response.version
            );
        }
        let fresh = subscribed && entry.invalidations == invalidations;
        let instance = response.instance;
        match response.into_result() {
            Ok(computed) => {
                entry.value = Some(computed.value.clone());
                entry.version = computed.version;
                entry.instance = instance;
                entry.state = if fresh {
                    EntryState::Consistent
                } else {
                    tracing::debug!("{} was invalidated while fetching", key);
                    EntryState::Invalidated
                };
                Ok(computed)
            }
            Err(err) => {
                // The last value stays available through `peek`.
                entry.state = EntryState::Invalidated;
                Err(err.into())
            }
        }
    }

    /// Like [`get`](Self::get), but gives up once `cancel` fires.
    pub async fn get_cancellable(
        &self,
        key: &ComputedKey,
        cancel: &CancellationToken,
    ) -> Result<Computed, ReplicaError> {
        tokio::select! {
            result = self.get(key) => result,
            _ = cancel.cancelled() => Err(ComputeError::Cancelled.into()),
        }
    }

    /// Like [`get`](Self::get), but deserializes the value.
    pub async fn get_as<T: DeserializeOwned>(&self, key: &ComputedKey) -> Result<T, ReplicaError> {
        Ok(self.get(key).await?.deserialize()?)
    }

    /// Returns the last known value of `key` without contacting the service, even if stale.
    pub fn peek(&self, key: &ComputedKey) -> Option<Computed> {
        self.inner.state.lock().entries.get(key)?.computed()
    }

    /// Whether `key` is cached and believed to be current.
    pub fn is_consistent(&self, key: &ComputedKey) -> bool {
        let state = self.inner.state.lock();
        self.is_push_healthy(&state)
            && state
                .entries
                .get(key)
                .is_some_and(|entry| entry.state == EntryState::Consistent)
    }

    /// Marks `key` as stale so the next access refetches it.
    pub fn invalidate(&self, key: &ComputedKey) {
        if let Some(entry) = self.inner.state.lock().entries.get_mut(key) {
            entry.invalidate();
        }
    }

    /// Drops all entries of keys that are not [`Consistent`](EntryState::Consistent).
    pub fn purge(&self) -> usize {
        let mut state = self.inner.state.lock();
        let before = state.entries.len();
        state
            .entries
            .retain(|_, entry| entry.state == EntryState::Consistent);
        before - state.entries.len()
    }

    pub fn len(&self) -> usize {
        self.inner.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_connected(&self) -> bool {
        *self.inner.connected.borrow()
    }

    /// Waits until the push channel is connected.
    pub async fn wait_connected(&self) {
        let mut connected = self.inner.connected.subscribe();
        // The sender lives in `self`, so this can not fail.
        connected.wait_for(|connected| *connected).await.ok();
    }

    /// Stops the push channel. Later accesses always go to the service.
    pub fn dispose(&self) {
        self.inner.shutdown.cancel();
    }

    fn is_push_healthy(&self, state: &ReplicaState) -> bool {
        match state.connection {
            Connection::Connected { .. } => !self.inner.shutdown.is_cancelled(),
            Connection::Disconnected { since } => {
                since.elapsed() < self.inner.config.disconnect_grace_period
            }
        }
    }
}

impl ReplicaInner {
    /// Switches to a new session: everything cached may have changed while disconnected, so all
    /// entries are invalidated and resubscribed.
    async fn on_connected(&self, session: SessionId) {
        let keys: Vec<_> = {
            let mut state = self.state.lock();
            state.connection = Connection::Connected { session };
            for entry in state.entries.values_mut() {
                entry.invalidate();
                entry.subscribed = None;
            }
            state.entries.keys().cloned().collect()
        };
        self.connected.send_replace(true);
        tracing::info!(session = %session, "Replica connected, resubscribing {} keys", keys.len());

        if keys.is_empty() {
            return;
        }
        match self.transport.subscribe(session, &keys).await {
            Ok(()) => {
                let mut state = self.state.lock();
                for key in &keys {
                    if let Some(entry) = state.entries.get_mut(key) {
                        entry.subscribed = Some(session);
                    }
                }
            }
            Err(err) => {
                tracing::warn!(
                    error = &err as &dyn std::error::Error,
                    "Failed to resubscribe after reconnecting"
                );
            }
        }
    }

    fn on_disconnected(&self) {
        self.state.lock().connection = Connection::Disconnected {
            since: Instant::now(),
        };
        self.connected.send_replace(false);
        tracing::warn!("Replica push channel disconnected");
    }

    fn apply(&self, batch: InvalidationBatch) {
        let keys: FxHashSet<_> = batch.keys.into_iter().collect();
        metric!(counter("replica.invalidated") += keys.len() as i64);
        let mut state = self.state.lock();
        for key in keys {
            if let Some(entry) = state.entries.get_mut(&key) {
                tracing::trace!("Invalidated {}", key);
                entry.invalidate();
                // The hub drops pushed keys from the session, the next fetch subscribes again.
                entry.subscribed = None;
            }
        }
    }
}

/// Keeps the push channel connected, reconnecting with exponential backoff.
async fn run_push_channel(
    inner: Weak<ReplicaInner>,
    transport: Arc<dyn Transport>,
    config: ReplicaConfig,
    shutdown: CancellationToken,
) {
    let mut delay = config.reconnect_delay;
    loop {
        let connected = tokio::select! {
            _ = shutdown.cancelled() => break,
            connected = transport.connect() => connected,
        };

        match connected {
            Ok(channel) => {
                delay = config.reconnect_delay;
                let Some(replica) = inner.upgrade() else { break };
                replica.on_connected(channel.session).await;
                drop(replica);

                let mut batches = channel.batches;
                loop {
                    let batch = tokio::select! {
                        _ = shutdown.cancelled() => return,
                        batch = batches.next() => batch,
                    };
                    let Some(batch) = batch else { break };
                    let Some(replica) = inner.upgrade() else { return };
                    replica.apply(batch);
                }

                let Some(replica) = inner.upgrade() else { break };
                replica.on_disconnected();
            }
            Err(err) => {
                tracing::warn!(
                    error = &err as &dyn std::error::Error,
                    "Failed to connect push channel, retrying in {:?}",
                    delay
                );
            }
        }

        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
        delay = (delay * 2).min(config.max_reconnect_delay);
    }
    tracing::debug!("Replica push channel stopped");
}
