use axum::routing::{get, post};
use axum::Router;
use computed_service::hub::InvalidationHub;
use computed_service::metric;
use sentry::integrations::tower::{NewSentryLayer, SentryHttpLayer};
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;

mod error;
mod fetch;
mod invalidate;
mod metrics;
mod sessions;

pub use error::ResponseError;
use metrics::MetricsLayer;

use fetch::fetch_value as fetch;
use invalidate::invalidate_key as invalidate;
use sessions::{open_session as sessions, subscribe_session as subscribe};

pub async fn healthcheck() -> &'static str {
    metric!(counter("healthcheck") += 1);
    "ok"
}

pub fn create_app(hub: InvalidationHub) -> Router {
    // The layers here go "top to bottom" according to the reading order here.
    let layer = ServiceBuilder::new()
        .layer(NewSentryLayer::new_from_top())
        .layer(SentryHttpLayer::new().enable_transaction())
        .layer(TraceLayer::new_for_http())
        .layer(MetricsLayer);
    Router::new()
        .route("/fetch", post(fetch))
        .route("/invalidate", post(invalidate))
        .route("/sessions", get(sessions))
        .route("/sessions/:session/subscribe", post(subscribe))
        .with_state(hub)
        .layer(layer)
        // the healthcheck is last, as it will bypass all the middlewares
        .route("/healthcheck", get(healthcheck))
}
