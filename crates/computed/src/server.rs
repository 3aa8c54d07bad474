use std::net::SocketAddr;

use anyhow::{Context, Result};
use computed_service::config::Config;
use computed_service::hub::InvalidationHub;
use computed_service::metric;

use crate::endpoints;
use crate::services;

/// Starts the compute service and the HTTP server based on loaded config.
pub fn run(config: Config) -> Result<()> {
    // Log this metric before actually starting the server. This allows to see restarts even if
    // service creation fails.
    metric!(counter("server.starting") += 1);

    let megs = 1024 * 1024;
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .thread_name("computed-web")
        .enable_all()
        .thread_stack_size(8 * megs)
        .build()?;

    let socket = config.bind.parse::<SocketAddr>()?;
    runtime.block_on(async {
        let service = services::create_service(&config);
        let hub = InvalidationHub::new(service.clone(), config.update_delayer.window);

        tracing::info!("Starting HTTP server on {}", socket);
        let server = axum_server::bind(socket)
            .serve(endpoints::create_app(hub).into_make_service());
        let result = server.await.context("HTTP server failed");

        service.dispose();
        result
    })?;
    tracing::info!("System shutdown complete");

    Ok(())
}
