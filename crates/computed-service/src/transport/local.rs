use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use super::{FetchResponse, PushChannel, SessionId, Transport, TransportError};
use crate::compute::{ComputeService, ComputedKey};
use crate::hub::InvalidationHub;

/// Connects replicas to a [`ComputeService`] in the same process.
///
/// Besides being useful on its own, this transport can simulate outages: see
/// [`disconnect_all`](Self::disconnect_all) and [`set_available`](Self::set_available).
#[derive(Clone, Debug)]
pub struct LocalTransport {
    hub: InvalidationHub,
    state: Arc<LocalState>,
}

#[derive(Debug)]
struct LocalState {
    available: AtomicBool,
    disconnect: Mutex<CancellationToken>,
}

impl LocalTransport {
    /// Creates a transport whose push channels coalesce invalidations over `window`.
    pub fn new(service: ComputeService, window: Duration) -> Self {
        Self::from_hub(InvalidationHub::new(service, window))
    }

    pub fn from_hub(hub: InvalidationHub) -> Self {
        Self {
            hub,
            state: Arc::new(LocalState {
                available: AtomicBool::new(true),
                disconnect: Mutex::new(CancellationToken::new()),
            }),
        }
    }

    pub fn hub(&self) -> &InvalidationHub {
        &self.hub
    }

    /// Ends every open push channel. New channels can be opened right away.
    pub fn disconnect_all(&self) {
        let previous = std::mem::take(&mut *self.state.disconnect.lock());
        previous.cancel();
    }

    /// Toggles whether the service is reachable. Going unavailable also disconnects.
    pub fn set_available(&self, available: bool) {
        self.state.available.store(available, Ordering::SeqCst);
        if !available {
            self.disconnect_all();
        }
    }

    fn check_available(&self) -> Result<(), TransportError> {
        if self.state.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(TransportError::Unavailable)
        }
    }
}

#[async_trait]
impl Transport for LocalTransport {
    async fn fetch(&self, key: &ComputedKey) -> Result<FetchResponse, TransportError> {
        self.check_available()?;
        Ok(self.hub.service().fetch(key.clone()).await)
    }

    async fn connect(&self) -> Result<PushChannel, TransportError> {
        self.check_available()?;
        let session = self.hub.open(None);
        let disconnect = self.state.disconnect.lock().clone();

        let batches = futures::stream::unfold(
            (session.batches, disconnect),
            |(mut batches, disconnect)| async move {
                tokio::select! {
                    _ = disconnect.cancelled() => None,
                    batch = batches.recv() => batch.map(|batch| (batch, (batches, disconnect))),
                }
            },
        );
        Ok(PushChannel {
            session: session.id,
            batches: batches.boxed(),
        })
    }

    async fn subscribe(
        &self,
        session: SessionId,
        keys: &[ComputedKey],
    ) -> Result<(), TransportError> {
        self.check_available()?;
        self.hub.subscribe(session, keys.iter().cloned())
    }
}
