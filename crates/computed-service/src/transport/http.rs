use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::stream::BoxStream;
use futures::{future, StreamExt};
use reqwest::{Client, Response, StatusCode};
use serde::{Deserialize, Serialize};

use super::{
    FetchResponse, InvalidationBatch, PushChannel, SessionId, Transport, TransportError,
};
use crate::compute::ComputedKey;

/// First line of the `GET /sessions` stream.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionHello {
    pub session: SessionId,
}

/// Body of `POST /sessions/{id}/subscribe`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscribeRequest {
    pub keys: Vec<ComputedKey>,
}

/// Talks to a remote `computed` server over HTTP.
///
/// Fetches are `POST /fetch` requests, the push channel is a long-lived `GET /sessions`
/// response streaming one JSON document per line.
#[derive(Clone, Debug)]
pub struct HttpTransport {
    client: Client,
    base_url: String,
    window: Option<Duration>,
}

impl HttpTransport {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_client(Client::new(), base_url)
    }

    pub fn with_client(client: Client, base_url: impl Into<String>) -> Self {
        let mut base_url = base_url.into();
        while base_url.ends_with('/') {
            base_url.pop();
        }
        Self {
            client,
            base_url,
            window: None,
        }
    }

    /// Requests a coalescing window for push channels instead of the server's default.
    pub fn with_window(mut self, window: Duration) -> Self {
        self.window = Some(window);
        self
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

async fn check_status(response: Response) -> Result<Response, TransportError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let detail = response.text().await.unwrap_or_default();
    Err(TransportError::Http {
        status: status.as_u16(),
        detail,
    })
}

/// Splits a streamed body into non-empty lines. The stream ends after the first error.
fn ndjson_lines(
    body: BoxStream<'static, reqwest::Result<Bytes>>,
) -> BoxStream<'static, Result<Bytes, TransportError>> {
    let state = (body, BytesMut::new(), false);
    futures::stream::unfold(state, |(mut body, mut buffer, failed)| async move {
        if failed {
            return None;
        }
        loop {
            if let Some(newline) = buffer.iter().position(|b| *b == b'\n') {
                let line = buffer.split_to(newline + 1).freeze().slice(..newline);
                // Empty lines are keep-alives.
                if line.iter().all(u8::is_ascii_whitespace) {
                    continue;
                }
                return Some((Ok(line), (body, buffer, false)));
            }
            match body.next().await {
                Some(Ok(chunk)) => buffer.extend_from_slice(&chunk),
                Some(Err(err)) => return Some((Err(err.into()), (body, buffer, true))),
                None => return None,
            }
        }
    })
    .boxed()
}

#[async_trait]
impl Transport for HttpTransport {
    async fn fetch(&self, key: &ComputedKey) -> Result<FetchResponse, TransportError> {
        let response = self.client.post(self.url("/fetch")).json(key).send().await?;
        let response = check_status(response).await?;
        Ok(response.json().await?)
    }

    async fn connect(&self) -> Result<PushChannel, TransportError> {
        let mut request = self.client.get(self.url("/sessions"));
        if let Some(window) = self.window {
            request = request.query(&[("window", window.as_secs_f64())]);
        }
        let response = check_status(request.send().await?).await?;

        let mut lines = ndjson_lines(response.bytes_stream().boxed());
        let hello = match lines.next().await {
            Some(line) => serde_json::from_slice::<SessionHello>(&line?)?,
            None => {
                return Err(TransportError::Malformed(
                    "push channel closed before announcing a session".into(),
                ))
            }
        };
        tracing::debug!(session = %hello.session, "Connected push channel");

        let batches = lines
            .take_while(|line| future::ready(line.is_ok()))
            .filter_map(|line| {
                let batch = line.ok().and_then(|line| {
                    serde_json::from_slice::<InvalidationBatch>(&line)
                        .map_err(|err| {
                            tracing::warn!(error = &err as &dyn std::error::Error, "Skipping malformed invalidation batch");
                        })
                        .ok()
                });
                future::ready(batch)
            });

        Ok(PushChannel {
            session: hello.session,
            batches: batches.boxed(),
        })
    }

    async fn subscribe(
        &self,
        session: SessionId,
        keys: &[ComputedKey],
    ) -> Result<(), TransportError> {
        let body = SubscribeRequest {
            keys: keys.to_vec(),
        };
        let response = self
            .client
            .post(self.url(&format!("/sessions/{session}/subscribe")))
            .json(&body)
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(TransportError::UnknownSession(session));
        }
        check_status(response).await?;
        Ok(())
    }
}
