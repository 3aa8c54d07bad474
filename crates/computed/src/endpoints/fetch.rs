use axum::extract::State;
use axum::Json;
use computed_service::hub::InvalidationHub;
use computed_service::transport::FetchResponse;
use computed_service::ComputedKey;

/// Computes or retrieves the current value of a key.
///
/// Failed computations are not an error of the request: the outcome travels in the body,
/// together with the version it was produced at.
pub async fn fetch_value(
    State(hub): State<InvalidationHub>,
    Json(key): Json<ComputedKey>,
) -> Json<FetchResponse> {
    tracing::trace!("Fetching {}", key);
    Json(hub.service().fetch(key).await)
}
