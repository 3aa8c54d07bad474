use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Instant;

use axum::extract::MatchedPath;
use axum::http::{Request, Response, StatusCode};
use computed_service::metric;
use tower::{Layer, Service};

/// Reports duration and status code of every request, tagged by route.
#[derive(Clone, Debug)]
pub struct MetricsLayer;

#[derive(Clone, Debug)]
pub struct MetricsService<S> {
    service: S,
}

pub struct MetricsFuture<F> {
    start: Instant,
    route: String,
    future: F,
}

impl<F, B, E> Future for MetricsFuture<F>
where
    F: Future<Output = Result<Response<B>, E>>,
{
    type Output = F::Output;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        // SAFETY: `future` is never moved out of a pinned `MetricsFuture`, and `start` and
        // `route` are only read.
        let this = unsafe { self.get_unchecked_mut() };
        let future = unsafe { Pin::new_unchecked(&mut this.future) };
        let poll = future.poll(cx);
        if let Poll::Ready(ref res) = poll {
            metric!(
                timer("requests.duration") = this.start.elapsed(),
                "route" => &this.route,
            );
            let status = res
                .as_ref()
                .map(|r| r.status())
                .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            metric!(
                counter("responses.status_code") += 1,
                "status" => status.as_str(),
                "route" => &this.route,
            );
        }
        poll
    }
}

impl<S> Layer<S> for MetricsLayer {
    type Service = MetricsService<S>;

    fn layer(&self, service: S) -> Self::Service {
        Self::Service { service }
    }
}

impl<S, ReqBody, ResBody> Service<Request<ReqBody>> for MetricsService<S>
where
    S: Service<Request<ReqBody>, Response = Response<ResBody>>,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = MetricsFuture<S::Future>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.service.poll_ready(cx)
    }

    fn call(&mut self, request: Request<ReqBody>) -> Self::Future {
        let route = request
            .extensions()
            .get::<MatchedPath>()
            .map_or("unknown", |path| path.as_str())
            .to_owned();
        Self::Future {
            start: Instant::now(),
            route,
            future: self.service.call(request),
        }
    }
}
