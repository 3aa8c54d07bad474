//! Computed.
//!
//! Computed is a standalone web service serving memoized results of compute methods. Clients
//! fetch values over HTTP and keep a push channel open on which the server announces coalesced
//! batches of invalidated keys, so they can mirror values locally and refetch them lazily.

#![warn(
    missing_debug_implementations,
    unused_crate_dependencies,
    clippy::all
)]

mod cli;
mod endpoints;
mod healthcheck;
mod logging;
mod server;
mod services;

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: jemallocator::Jemalloc = jemallocator::Jemalloc;

fn main() {
    match cli::execute() {
        Ok(()) => std::process::exit(0),
        Err(error) => {
            logging::ensure_log_error(&error);
            std::process::exit(1);
        }
    }
}
