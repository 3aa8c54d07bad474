//! Server side of the invalidation push channel.
//!
//! The [`InvalidationHub`] keeps one session per connected consumer. A session has its own set
//! of subscribed keys and its own [`UpdateDelayer`], and forwards coalesced batches of the
//! subscribed keys that the [`ComputeService`] invalidated.
//!
//! Subscriptions are one-shot: a key leaves the subscription set once it has been pushed, and
//! the consumer subscribes again when it refetches the key. Keys the service evicts or disposes
//! are pushed one last time, so the sets only hold keys consumers still have a current copy of.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::compute::{ComputeService, ComputedKey, InvalidationEvent};
use crate::delayer::UpdateDelayer;
use crate::transport::{InvalidationBatch, SessionId, TransportError};
use crate::utils::futures::CallOnDrop;

/// Batches buffered per session before the session stops reading events and starts lagging.
const SESSION_BUFFER: usize = 16;

type Sessions = Arc<Mutex<FxHashMap<SessionId, Arc<Mutex<FxHashSet<ComputedKey>>>>>>;

/// Fans invalidations out to push channel sessions.
#[derive(Clone, Debug)]
pub struct InvalidationHub {
    service: ComputeService,
    default_window: Duration,
    sessions: Sessions,
}

/// An open session, as handed to the consumer's connection.
#[derive(Debug)]
pub struct Session {
    pub id: SessionId,
    /// Coalesced batches. Closes when the hub or the service shuts down.
    pub batches: mpsc::Receiver<InvalidationBatch>,
}

impl InvalidationHub {
    pub fn new(service: ComputeService, default_window: Duration) -> Self {
        Self {
            service,
            default_window,
            sessions: Default::default(),
        }
    }

    pub fn service(&self) -> &ComputeService {
        &self.service
    }

    /// Opens a session, coalescing over `window` or the hub's default.
    ///
    /// The session lives as long as its batch receiver.
    pub fn open(&self, window: Option<Duration>) -> Session {
        let id = Uuid::new_v4();
        let subscribed = Arc::new(Mutex::new(FxHashSet::default()));
        self.sessions.lock().insert(id, subscribed.clone());

        let (sender, batches) = mpsc::channel(SESSION_BUFFER);
        let session = SessionTask {
            id,
            subscribed,
            events: self.service.subscribe(),
            delayer: UpdateDelayer::new(window.unwrap_or(self.default_window)),
            batches: sender,
            shutdown: self.service.inner.shutdown.child_token(),
        };

        let sessions = self.sessions.clone();
        let cleanup = CallOnDrop::new(move || {
            sessions.lock().remove(&id);
        });
        tokio::spawn(async move {
            let _cleanup = cleanup;
            session.run().await;
        });

        tracing::debug!(session = %id, "Opened invalidation session");
        metric!(gauge("computed.sessions") = self.session_count() as u64);
        Session { id, batches }
    }

    /// Adds `keys` to the subscription set of `session`.
    pub fn subscribe(
        &self,
        session: SessionId,
        keys: impl IntoIterator<Item = ComputedKey>,
    ) -> Result<(), TransportError> {
        let subscribed = self
            .sessions
            .lock()
            .get(&session)
            .cloned()
            .ok_or(TransportError::UnknownSession(session))?;
        subscribed.lock().extend(keys);
        Ok(())
    }

    pub fn session_count(&self) -> usize {
        self.sessions.lock().len()
    }

    /// The number of keys `session` is currently subscribed to.
    pub fn subscription_count(&self, session: SessionId) -> Option<usize> {
        let subscribed = self.sessions.lock().get(&session).cloned()?;
        let count = subscribed.lock().len();
        Some(count)
    }
}

struct SessionTask {
    id: SessionId,
    subscribed: Arc<Mutex<FxHashSet<ComputedKey>>>,
    events: broadcast::Receiver<InvalidationEvent>,
    delayer: UpdateDelayer,
    batches: mpsc::Sender<InvalidationBatch>,
    shutdown: CancellationToken,
}

impl SessionTask {
    async fn run(mut self) {
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = self.batches.closed() => break,
                event = self.events.recv() => match event {
                    Ok(keys) => {
                        let relevant: Vec<_> = {
                            let subscribed = self.subscribed.lock();
                            keys.iter().filter(|k| subscribed.contains(*k)).cloned().collect()
                        };
                        self.delayer.notify_all(relevant);
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        // The missed events are gone, so every subscribed key may be stale.
                        tracing::warn!(session = %self.id, skipped, "Invalidation session lagged behind");
                        let all: Vec<_> = self.subscribed.lock().iter().cloned().collect();
                        self.delayer.notify_all(all);
                    }
                    Err(RecvError::Closed) => break,
                },
                keys = self.delayer.ready() => {
                    {
                        let mut subscribed = self.subscribed.lock();
                        for key in &keys {
                            subscribed.remove(key);
                        }
                    }
                    metric!(counter("computed.batches") += 1);
                    metric!(counter("computed.batches.keys") += keys.len() as i64);
                    if self.batches.send(InvalidationBatch { keys }).await.is_err() {
                        break;
                    }
                }
            }
        }
        tracing::debug!(session = %self.id, "Closed invalidation session");
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;

    use super::*;
    use crate::config::CacheConfig;

    async fn cached(service: &ComputeService, name: &str) -> ComputedKey {
        let key = ComputedKey::unit("test", name);
        service
            .get_or_compute(key.clone(), |_| async { Ok(json!(1)) })
            .await
            .unwrap();
        key
    }

    #[tokio::test(start_paused = true)]
    async fn test_only_subscribed_keys_are_pushed() {
        let service = ComputeService::builder(&CacheConfig::default()).build();
        let hub = InvalidationHub::new(service.clone(), Duration::from_millis(100));
        let a = cached(&service, "a").await;
        let b = cached(&service, "b").await;

        let mut session = hub.open(None);
        hub.subscribe(session.id, [a.clone()]).unwrap();

        service.invalidate(&a);
        service.invalidate(&b);

        let batch = session.batches.recv().await.unwrap();
        assert_eq!(batch.keys, vec![a]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pushed_keys_are_unsubscribed() {
        let service = ComputeService::builder(&CacheConfig::default()).build();
        let hub = InvalidationHub::new(service.clone(), Duration::from_millis(100));
        let a = cached(&service, "a").await;

        let mut session = hub.open(None);
        hub.subscribe(session.id, [a.clone()]).unwrap();
        assert_eq!(hub.subscription_count(session.id), Some(1));

        service.invalidate(&a);
        let batch = session.batches.recv().await.unwrap();
        assert_eq!(batch.keys, vec![a.clone()]);
        assert_eq!(hub.subscription_count(session.id), Some(0));

        // Recomputed but not subscribed again, so nothing is pushed.
        cached(&service, "a").await;
        service.invalidate(&a);
        let next = tokio::time::timeout(Duration::from_millis(500), session.batches.recv()).await;
        assert!(next.is_err());

        hub.subscribe(session.id, [a.clone()]).unwrap();
        cached(&service, "a").await;
        service.invalidate(&a);
        let batch = session.batches.recv().await.unwrap();
        assert_eq!(batch.keys, vec![a]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disposed_keys_are_unsubscribed() {
        let service = ComputeService::builder(&CacheConfig::default()).build();
        let hub = InvalidationHub::new(service.clone(), Duration::from_millis(100));
        let a = cached(&service, "a").await;
        let b = cached(&service, "b").await;

        let mut session = hub.open(None);
        hub.subscribe(session.id, [a.clone(), b.clone()]).unwrap();

        assert_eq!(service.dispose_service("test"), 2);
        let batch = session.batches.recv().await.unwrap();
        assert_eq!(batch.keys, vec![a, b]);
        assert_eq!(hub.subscription_count(session.id), Some(0));
        assert_eq!(hub.subscription_count(Uuid::new_v4()), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_closed_session_is_removed() {
        let service = ComputeService::builder(&CacheConfig::default()).build();
        let hub = InvalidationHub::new(service, Duration::ZERO);

        let session = hub.open(None);
        assert_eq!(hub.session_count(), 1);
        let id = session.id;
        drop(session);

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(hub.session_count(), 0);
        assert!(matches!(
            hub.subscribe(id, Vec::new()),
            Err(TransportError::UnknownSession(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_lagging_session_gets_everything() {
        let config = CacheConfig {
            event_capacity: 2,
            ..Default::default()
        };
        let service = ComputeService::builder(&config).build();
        let hub = InvalidationHub::new(service.clone(), Duration::from_millis(100));
        let a = cached(&service, "a").await;
        let b = cached(&service, "b").await;
        let mut others = Vec::new();
        for name in ["x", "y", "z"] {
            others.push(cached(&service, name).await);
        }

        let mut session = hub.open(None);
        hub.subscribe(session.id, [a.clone(), b.clone()]).unwrap();

        // Overflow the event buffer before the session task gets to run.
        for key in &others {
            service.invalidate(key);
        }

        let batch = session.batches.recv().await.unwrap();
        assert_eq!(batch.keys, vec![a, b]);
    }
}
