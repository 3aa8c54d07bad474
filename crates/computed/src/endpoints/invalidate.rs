use axum::extract::State;
use axum::Json;
use computed_service::hub::InvalidationHub;
use computed_service::ComputedKey;
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize)]
pub struct InvalidateResponse {
    /// Every key that was consistent and is invalidated now, including dependents.
    pub invalidated: Vec<ComputedKey>,
}

pub async fn invalidate_key(
    State(hub): State<InvalidationHub>,
    Json(key): Json<ComputedKey>,
) -> Json<InvalidateResponse> {
    let invalidated = hub.service().invalidate(&key);
    Json(InvalidateResponse { invalidated })
}
