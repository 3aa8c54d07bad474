use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use computed_service::transport::TransportError;
use sentry::integrations::anyhow::capture_anyhow;
use serde::{Deserialize, Serialize};

#[derive(Debug)]
pub struct ResponseError {
    status: StatusCode,
    err: anyhow::Error,
}

impl From<serde_json::Error> for ResponseError {
    fn from(err: serde_json::Error) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            err: err.into(),
        }
    }
}

impl From<TransportError> for ResponseError {
    fn from(err: TransportError) -> Self {
        let status = match err {
            TransportError::UnknownSession(_) => StatusCode::NOT_FOUND,
            TransportError::Malformed(_) => StatusCode::BAD_REQUEST,
            TransportError::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            err: err.into(),
        }
    }
}

impl From<(StatusCode, &'static str)> for ResponseError {
    fn from((code, msg): (StatusCode, &'static str)) -> Self {
        Self {
            status: code,
            err: anyhow::anyhow!(msg),
        }
    }
}

impl From<anyhow::Error> for ResponseError {
    fn from(err: anyhow::Error) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            err,
        }
    }
}

impl IntoResponse for ResponseError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            capture_anyhow(&self.err);
        }
        let mut response = Json(ApiErrorResponse::from(self.err)).into_response();
        *response.status_mut() = self.status;
        response
    }
}

/// An error response from an api.
#[derive(Serialize, Deserialize, Default, Debug)]
pub struct ApiErrorResponse {
    pub detail: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub causes: Option<Vec<String>>,
}

impl From<anyhow::Error> for ApiErrorResponse {
    fn from(err: anyhow::Error) -> Self {
        let mut chain = err.chain().map(|err| err.to_string());
        let detail = chain.next();
        let causes: Vec<_> = chain.collect();
        let causes = if causes.is_empty() {
            None
        } else {
            Some(causes)
        };

        ApiErrorResponse { detail, causes }
    }
}
