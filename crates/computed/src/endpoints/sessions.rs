use std::convert::Infallible;
use std::time::Duration;

use axum::body::{Body, Bytes};
use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use computed_service::hub::InvalidationHub;
use computed_service::transport::{SessionHello, SessionId, SubscribeRequest};
use futures::{future, stream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::time::{self, Instant};

use super::ResponseError;

/// An empty line is sent this often, so dead connections are noticed on both ends.
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(15);

/// Query parameters of `GET /sessions`.
#[derive(Debug, Deserialize)]
pub struct SessionParams {
    /// Coalescing window in seconds, the configured default if omitted.
    #[serde(default)]
    window: Option<f64>,
}

fn ndjson_line<T: Serialize>(value: &T) -> Result<Bytes, serde_json::Error> {
    let mut line = serde_json::to_vec(value)?;
    line.push(b'\n');
    Ok(line.into())
}

/// Opens a push channel.
///
/// The response streams newline delimited JSON: first a [`SessionHello`] carrying the session
/// id, then one invalidation batch per line. Closing the response closes the session.
pub async fn open_session(
    State(hub): State<InvalidationHub>,
    Query(params): Query<SessionParams>,
) -> Result<Response, ResponseError> {
    let window = params
        .window
        .map(Duration::try_from_secs_f64)
        .transpose()
        .map_err(|_| (StatusCode::BAD_REQUEST, "invalid coalescing window"))?;

    let session = hub.open(window);
    let hello = ndjson_line(&SessionHello {
        session: session.id,
    })?;

    let keepalive = time::interval_at(Instant::now() + KEEPALIVE_INTERVAL, KEEPALIVE_INTERVAL);
    let batches = stream::unfold(
        (session.batches, keepalive),
        |(mut batches, mut keepalive)| async move {
            let line = tokio::select! {
                batch = batches.recv() => ndjson_line(&batch?).ok()?,
                _ = keepalive.tick() => Bytes::from_static(b"\n"),
            };
            Some((Ok::<_, Infallible>(line), (batches, keepalive)))
        },
    );

    let lines = stream::once(future::ready(Ok::<_, Infallible>(hello))).chain(batches);
    let headers = [(header::CONTENT_TYPE, "application/x-ndjson")];
    Ok((headers, Body::from_stream(lines)).into_response())
}

/// Adds keys to the subscription set of an open session.
pub async fn subscribe_session(
    State(hub): State<InvalidationHub>,
    Path(session): Path<SessionId>,
    Json(request): Json<SubscribeRequest>,
) -> Result<StatusCode, ResponseError> {
    hub.subscribe(session, request.keys)?;
    Ok(StatusCode::NO_CONTENT)
}
