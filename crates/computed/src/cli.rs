//! Exposes the command line application.
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use computed_service::config::Config;
use computed_service::metrics;

use crate::healthcheck;
use crate::logging;
use crate::server;

/// Computed commands.
#[derive(Subcommand)]
enum Command {
    /// Run the web server.
    #[command(name = "run")]
    Run,

    /// Check the health of a running server.
    #[command(name = "healthcheck")]
    Healthcheck {
        /// Address of the server. Defaults to the `bind` address of the configuration.
        #[arg(long, value_name = "ADDR")]
        addr: Option<SocketAddr>,

        /// Request timeout in seconds.
        #[arg(long, default_value_t = 5)]
        timeout: u64,
    },
}

/// Command line interface parser.
#[derive(Parser)]
#[command(version, bin_name = "computed")]
struct Cli {
    /// Path to your configuration file.
    #[arg(long, short, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

impl Cli {
    /// Returns the path to the configuration file.
    fn config(&self) -> Option<&Path> {
        self.config.as_deref()
    }
}

/// Runs the main application.
pub fn execute() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::get(cli.config()).context("failed loading config")?;

    let _sentry = sentry::init(sentry::ClientOptions {
        dsn: config.sentry_dsn.clone(),
        release: sentry::release_name!(),
        session_mode: sentry::SessionMode::Request,
        auto_session_tracking: false,
        ..Default::default()
    });

    // SAFETY: The runtime is not started yet and nothing else touches the environment.
    unsafe { logging::init_logging(&config) };

    if let Some(ref statsd) = config.metrics.statsd {
        let mut tags = config.metrics.custom_tags.clone();
        if let Some(hostname_tag) = config.metrics.hostname_tag.clone() {
            if let Some(hostname) = hostname::get().ok().and_then(|s| s.into_string().ok()) {
                tags.insert(hostname_tag, hostname);
            }
        }
        metrics::configure_statsd(&config.metrics.prefix, statsd, tags)
            .context("failed to configure statsd")?;
    }

    match cli.command {
        Command::Run => server::run(config).context("failed to start the server")?,
        Command::Healthcheck { addr, timeout } => healthcheck::healthcheck(config, addr, timeout)?,
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_arguments() {
        use clap::CommandFactory;
        Cli::command().debug_assert();

        let cli = Cli::parse_from(["computed", "-c", "computed.yml", "healthcheck", "--timeout", "1"]);
        assert_eq!(cli.config(), Some(Path::new("computed.yml")));
        assert!(matches!(
            cli.command,
            Command::Healthcheck {
                addr: None,
                timeout: 1
            }
        ));
    }
}
