//! The boundary between replicas and the authoritative compute service.
//!
//! A [`Transport`] offers request/response fetches of computed values plus a push channel of
//! coalesced invalidation batches. [`LocalTransport`] connects straight to an in-process
//! [`ComputeService`](crate::ComputeService), [`HttpTransport`] talks to a remote server.

use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::compute::{ComputeError, Computed, ComputedKey, Output};

mod http;
mod local;

pub use http::{HttpTransport, SessionHello, SubscribeRequest};
pub use local::LocalTransport;

/// Identifies one consumer of pushed invalidations.
pub type SessionId = Uuid;

/// Identifies one run of a compute service. Versions are only comparable within an instance.
pub type InstanceId = Uuid;

/// The outcome of fetching one key: either a value or an error, and the version it had.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FetchResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Arc<Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ComputeError>,
    #[serde(default)]
    pub version: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance: Option<InstanceId>,
}

impl FetchResponse {
    pub fn into_result(self) -> Result<Computed, ComputeError> {
        match self.error {
            Some(err) => Err(err),
            None => Ok(Computed {
                // A `null` value is omitted on the wire.
                value: self.value.unwrap_or_else(|| Arc::new(Value::Null)),
                version: self.version,
            }),
        }
    }

    pub(crate) fn from_output(output: Output, instance: InstanceId) -> Self {
        let (value, error) = match output.result {
            Ok(value) => (Some(value), None),
            Err(err) => (None, Some(err)),
        };
        Self {
            value,
            error,
            version: output.version,
            instance: Some(instance),
        }
    }
}

/// Keys that were invalidated on the server, coalesced over the consumer's window.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvalidationBatch {
    pub keys: Vec<ComputedKey>,
}

/// An open push channel.
///
/// The stream ends when the channel disconnects.
pub struct PushChannel {
    pub session: SessionId,
    pub batches: BoxStream<'static, InvalidationBatch>,
}

impl std::fmt::Debug for PushChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PushChannel")
            .field("session", &self.session)
            .finish_non_exhaustive()
    }
}

/// Errors talking to the authoritative service.
///
/// These are connectivity problems. Computation failures travel inside [`FetchResponse`].
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("request failed")]
    Request(#[from] reqwest::Error),
    #[error("server responded with status {status}: {detail}")]
    Http { status: u16, detail: String },
    #[error("unknown session {0}")]
    UnknownSession(SessionId),
    #[error("malformed message: {0}")]
    Malformed(String),
    #[error("service unavailable")]
    Unavailable,
}

impl From<serde_json::Error> for TransportError {
    fn from(err: serde_json::Error) -> Self {
        Self::Malformed(err.to_string())
    }
}

/// Connectivity to an authoritative compute service.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Computes or retrieves the current value of `key`.
    async fn fetch(&self, key: &ComputedKey) -> Result<FetchResponse, TransportError>;

    /// Opens a push channel for invalidations.
    async fn connect(&self) -> Result<PushChannel, TransportError>;

    /// Adds keys to the subscription set of a push channel.
    async fn subscribe(&self, session: SessionId, keys: &[ComputedKey])
        -> Result<(), TransportError>;
}
