//! A clock, as the simplest value that goes stale on its own.
//!
//! `time.now` returns the current time as an RFC 3339 timestamp and is invalidated every second.
//! `time.format` renders it with a `strftime`-style pattern and is invalidated along with it.

use std::fmt::Write;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use computed_service::{
    ComputeContext, ComputeError, ComputeServiceBuilder, ComputedKey, MethodOptions,
};

/// Simulated latency of reading the clock.
const CLOCK_LATENCY: Duration = Duration::from_millis(250);

pub fn register(builder: ComputeServiceBuilder) -> ComputeServiceBuilder {
    let now_options = MethodOptions {
        auto_invalidate_time: Some(Duration::from_secs(1)),
        keep_alive_time: Duration::from_secs(1),
    };
    builder
        .register("time", "now", now_options, now)
        .register("time", "format", MethodOptions::default(), format)
}

pub fn now_key() -> ComputedKey {
    ComputedKey::unit("time", "now")
}

async fn now(ctx: ComputeContext, (): ()) -> Result<String, ComputeError> {
    tokio::select! {
        _ = ctx.cancelled() => return Err(ComputeError::Cancelled),
        _ = tokio::time::sleep(CLOCK_LATENCY) => {}
    }
    Ok(Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true))
}

async fn format(ctx: ComputeContext, pattern: String) -> Result<String, ComputeError> {
    let now: String = ctx.call_as(now_key()).await?;
    let now = DateTime::parse_from_rfc3339(&now).map_err(ComputeError::failed)?;

    let mut formatted = String::new();
    write!(formatted, "{}", now.format(&pattern))
        .map_err(|_| ComputeError::Failed(format!("invalid format pattern {pattern:?}")))?;
    Ok(formatted)
}
