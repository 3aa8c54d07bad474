use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// An error produced while computing or retrieving a cached value.
///
/// A single outcome is shared between every caller waiting on the same computation, and it is
/// also sent over the wire to replicas, so this error is both cloneable and serializable.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum ComputeError {
    /// The compute function itself returned an error.
    ///
    /// The attached string contains the rendered error chain.
    #[error("computation failed: {0}")]
    Failed(String),
    /// A computation tried to read a key that is already being computed further up its own
    /// call chain.
    ///
    /// The attached string contains the offending chain, e.g. `a.x[] -> b.y[] -> a.x[]`.
    #[error("cyclic dependency: {0}")]
    Cycle(String),
    /// No compute method is registered under the requested `service.method` identifier.
    #[error("unknown compute method: {0}")]
    UnknownMethod(String),
    /// Arguments or a computed value could not be converted from or to JSON.
    #[error("malformed: {0}")]
    Malformed(String),
    /// Every caller stopped waiting, or the caller's own cancellation token fired.
    #[error("computation cancelled")]
    Cancelled,
    /// The owning service has been torn down.
    #[error("compute service disposed")]
    Disposed,
    /// An unexpected error in the cache itself, such as a panicking compute function.
    #[error("internal error")]
    InternalError,
}

impl ComputeError {
    /// Wraps any displayable error as a [`Failed`](Self::Failed) outcome.
    pub fn failed(err: impl fmt::Display) -> Self {
        Self::Failed(err.to_string())
    }

    /// Returns `false` for errors that will reproduce on every retry.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Cycle(_) | Self::UnknownMethod(_))
    }
}

impl From<serde_json::Error> for ComputeError {
    fn from(err: serde_json::Error) -> Self {
        Self::Malformed(err.to_string())
    }
}

impl From<anyhow::Error> for ComputeError {
    fn from(err: anyhow::Error) -> Self {
        Self::Failed(format!("{err:#}"))
    }
}
