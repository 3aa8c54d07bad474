use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use computed_service::config::{CacheConfig, ReplicaConfig};
use computed_service::transport::{
    FetchResponse, LocalTransport, PushChannel, SessionId, Transport, TransportError,
};
use computed_service::{ComputeError, ComputeService, ComputedKey, MethodOptions};
use computed_test as test;
use futures::{stream, StreamExt};
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::time;

/// The state behind the methods of the test service.
#[derive(Debug, Default)]
pub struct Source {
    /// Returned by `test.value`.
    pub value: AtomicU64,
    /// Makes `test.value` fail while set.
    pub failing: AtomicBool,
    /// How often `test.value` ran.
    pub computations: AtomicUsize,
}

impl Source {
    pub fn set(&self, value: u64) {
        self.value.store(value, Ordering::SeqCst);
    }

    pub fn computations(&self) -> usize {
        self.computations.load(Ordering::SeqCst)
    }
}

pub fn value_key() -> ComputedKey {
    ComputedKey::unit("test", "value")
}

pub fn doubled_key() -> ComputedKey {
    ComputedKey::unit("test", "doubled")
}

/// Setup tests and create a test service.
///
/// The service has a `test.value` method reading from the returned [`Source`] and a
/// `test.doubled` method depending on it. Background sweeps are disabled.
pub fn setup_service() -> (ComputeService, Arc<Source>) {
    test::setup();

    let source = Arc::new(Source::default());
    let config = CacheConfig {
        sweep_interval: Duration::ZERO,
        ..Default::default()
    };

    let value_source = source.clone();
    let service = ComputeService::builder(&config)
        .register("test", "value", MethodOptions::default(), move |_ctx, (): ()| {
            let source = value_source.clone();
            async move {
                source.computations.fetch_add(1, Ordering::SeqCst);
                if source.failing.load(Ordering::SeqCst) {
                    return Err(ComputeError::failed("source is failing"));
                }
                Ok(source.value.load(Ordering::SeqCst))
            }
        })
        .register("test", "doubled", MethodOptions::default(), |ctx, (): ()| async move {
            let value: u64 = ctx.call_as(value_key()).await?;
            Ok(value * 2)
        })
        .build();

    (service, source)
}

/// A replica configuration with a short grace period and quick reconnects.
pub fn replica_config() -> ReplicaConfig {
    ReplicaConfig {
        disconnect_grace_period: Duration::from_secs(1),
        reconnect_delay: Duration::from_millis(100),
        max_reconnect_delay: Duration::from_millis(400),
    }
}

/// Wraps a [`LocalTransport`] and counts fetches.
///
/// The wrapped service can be swapped to simulate a restart, and a single fetch can be held
/// back after the service answered it. Push channels optionally deliver every batch twice.
#[derive(Debug)]
pub struct CountingTransport {
    inner: Mutex<LocalTransport>,
    window: Duration,
    fetches: AtomicUsize,
    answered: AtomicUsize,
    held: Mutex<Option<oneshot::Receiver<()>>>,
    redeliver: AtomicBool,
}

impl CountingTransport {
    pub fn new(service: ComputeService, window: Duration) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(LocalTransport::new(service, window)),
            window,
            fetches: AtomicUsize::new(0),
            answered: AtomicUsize::new(0),
            held: Mutex::new(None),
            redeliver: AtomicBool::new(false),
        })
    }

    /// The transport to the current service.
    pub fn local(&self) -> LocalTransport {
        self.inner.lock().clone()
    }

    /// Points all later requests at `service`, returning the previous transport.
    pub fn switch_to(&self, service: ComputeService) -> LocalTransport {
        let next = LocalTransport::new(service, self.window);
        std::mem::replace(&mut *self.inner.lock(), next)
    }

    /// Fetches that were started.
    pub fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    /// Fetches the service has answered, including one that is held back.
    pub fn answered(&self) -> usize {
        self.answered.load(Ordering::SeqCst)
    }

    /// Holds back the response of the next fetch until the returned sender fires.
    pub fn hold_next_fetch(&self) -> oneshot::Sender<()> {
        let (release, held) = oneshot::channel();
        *self.held.lock() = Some(held);
        release
    }

    /// Makes push channels opened from now on deliver every batch twice.
    pub fn redeliver_batches(&self) {
        self.redeliver.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl Transport for CountingTransport {
    async fn fetch(&self, key: &ComputedKey) -> Result<FetchResponse, TransportError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let held = self.held.lock().take();
        let response = self.local().fetch(key).await;
        self.answered.fetch_add(1, Ordering::SeqCst);
        if let Some(held) = held {
            held.await.ok();
        }
        response
    }

    async fn connect(&self) -> Result<PushChannel, TransportError> {
        let channel = self.local().connect().await?;
        if !self.redeliver.load(Ordering::SeqCst) {
            return Ok(channel);
        }
        let batches = channel
            .batches
            .flat_map(|batch| stream::iter([batch.clone(), batch]))
            .boxed();
        Ok(PushChannel {
            session: channel.session,
            batches,
        })
    }

    async fn subscribe(
        &self,
        session: SessionId,
        keys: &[ComputedKey],
    ) -> Result<(), TransportError> {
        self.local().subscribe(session, keys).await
    }
}

/// Polls `condition` until it holds.
///
/// # Panics
///
/// Panics if the condition does not hold within ten seconds.
pub async fn wait_for(mut condition: impl FnMut() -> bool) {
    let waiting = async {
        while !condition() {
            time::sleep(Duration::from_millis(10)).await;
        }
    };
    if time::timeout(Duration::from_secs(10), waiting).await.is_err() {
        panic!("condition did not hold in time");
    }
}
