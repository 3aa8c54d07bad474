//! Helpers for testing the compute service and the web server.
//!
//! When writing tests, keep the following points in mind:
//!
//!  - In every test, call [`setup`]. This will set up the logger so that all console output
//!    is captured by the test runner.
//!
//!  - When using [`Server`], make sure that the server is held until all requests to it have been
//!    made. Dropping the server stops accepting connections. To avoid this, assign it to a
//!    variable: `let server = Server::new(app);`.
//!
//!  - When using [`tempdir`], hold on to the handle for the entire lifetime of the test.

use std::net::SocketAddr;
use std::path::PathBuf;

use axum::Router;
use reqwest::Url;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::fmt;

pub use tempfile::TempDir;

/// Setup the test environment.
///
///  - Initializes logs: The logger only captures logs from the `computed` crates and mutes all
///    other logs (such as hyper or reqwest).
pub fn setup() {
    fmt()
        .with_env_filter(EnvFilter::new("computed=trace,computed_service=trace"))
        .with_target(false)
        .pretty()
        .with_test_writer()
        .try_init()
        .ok();
}

/// Creates a temporary directory.
///
/// The directory is deleted when the [`TempDir`] instance is dropped.
pub fn tempdir() -> TempDir {
    TempDir::new().unwrap()
}

/// Writes `contents` to a file in `dir` and returns its path.
pub fn write_file(dir: &TempDir, name: &str, contents: &str) -> PathBuf {
    let path = dir.path().join(name);
    std::fs::write(&path, contents).unwrap();
    path
}

/// A test server that binds to a random port and serves a web app.
///
/// This server requires a `tokio` runtime and is supposed to be run in a `tokio::test`. It
/// automatically stops serving when dropped.
#[derive(Debug)]
pub struct Server {
    pub handle: tokio::task::JoinHandle<()>,
    pub socket: SocketAddr,
}

impl Server {
    /// Creates a new test server serving the given [`Router`].
    pub fn new(router: Router) -> Self {
        let listener = std::net::TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0))).unwrap();
        listener.set_nonblocking(true).unwrap();
        let socket = listener.local_addr().unwrap();
        let listener = tokio::net::TcpListener::from_std(listener).unwrap();

        let handle = tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });

        Self { handle, socket }
    }

    /// Returns the socket address that this server listens on.
    pub fn addr(&self) -> SocketAddr {
        self.socket
    }

    /// Returns the port that this server listens on.
    pub fn port(&self) -> u16 {
        self.addr().port()
    }

    /// Returns a full URL pointing to the given path.
    ///
    /// This URL uses `localhost` as hostname.
    pub fn url(&self, path: &str) -> Url {
        let path = path.trim_start_matches('/');
        format!("http://localhost:{}/{}", self.port(), path)
            .parse()
            .unwrap()
    }

    /// Returns the base URL of this server, without a trailing slash.
    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr())
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
