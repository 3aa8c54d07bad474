use std::collections::BTreeMap;
use std::env;
use std::fmt;
use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use sentry::types::Dsn;
use serde::{de, Deserialize, Deserializer};
use tracing::level_filters::LevelFilter;

use crate::compute::MethodOptions;

/// Controls the log format
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Auto detect (pretty for tty, simplified for other)
    Auto,
    /// With colors
    Pretty,
    /// Simplified log output
    Simplified,
    /// Dump out JSON lines
    Json,
}

/// Controls the logging system.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Logging {
    /// The log level for the server.
    #[serde(deserialize_with = "deserialize_level_filter")]
    pub level: LevelFilter,
    /// Controls the log format.
    pub format: LogFormat,
    /// When set to true, backtraces are forced on.
    pub enable_backtraces: bool,
}

impl Default for Logging {
    fn default() -> Self {
        Logging {
            level: LevelFilter::INFO,
            format: LogFormat::Auto,
            enable_backtraces: true,
        }
    }
}

/// Control the metrics.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Metrics {
    /// host/port of statsd instance
    pub statsd: Option<String>,
    /// The prefix that should be added to all metrics.
    pub prefix: String,
    /// A tag name to report the hostname to, for each metric. Defaults to not sending such a tag.
    pub hostname_tag: Option<String>,
    /// A map containing custom tags and their values.
    ///
    /// These tags will be appended to every metric.
    pub custom_tags: BTreeMap<String, String>,
}

impl Default for Metrics {
    fn default() -> Self {
        Metrics {
            statsd: env::var("STATSD_SERVER").ok(),
            prefix: "computed".into(),
            hostname_tag: None,
            custom_tags: BTreeMap::new(),
        }
    }
}

/// Settings of the node table.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct CacheConfig {
    /// Keep-alive of ad-hoc computations and methods without configured options.
    #[serde(with = "humantime_serde")]
    pub default_keep_alive_time: Duration,
    /// Interval of the background sweep that evicts unused nodes. Zero disables it.
    #[serde(with = "humantime_serde")]
    pub sweep_interval: Duration,
    /// Number of invalidation passes buffered per subscriber before it lags behind.
    pub event_capacity: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_keep_alive_time: Duration::from_secs(60),
            sweep_interval: Duration::from_secs(1),
            event_capacity: 1024,
        }
    }
}

/// Coalescing of invalidation notifications per consumer.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct UpdateDelayerConfig {
    /// Quiescence window before a batch is emitted. Zero notifies immediately.
    #[serde(deserialize_with = "deserialize_duration")]
    pub window: Duration,
}

impl Default for UpdateDelayerConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_millis(100),
        }
    }
}

/// Behavior of client-side replicas.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct ReplicaConfig {
    /// How long cached entries are still served after the push channel dropped.
    #[serde(with = "humantime_serde")]
    pub disconnect_grace_period: Duration,
    /// Delay before the first reconnection attempt.
    #[serde(with = "humantime_serde")]
    pub reconnect_delay: Duration,
    /// Upper bound for the exponential reconnection backoff.
    #[serde(with = "humantime_serde")]
    pub max_reconnect_delay: Duration,
}

impl Default for ReplicaConfig {
    fn default() -> Self {
        Self {
            disconnect_grace_period: Duration::from_secs(5),
            reconnect_delay: Duration::from_millis(100),
            max_reconnect_delay: Duration::from_secs(5),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Host and port to bind the HTTP webserver to.
    pub bind: String,

    /// Configuration for internal logging.
    pub logging: Logging,

    /// Configuration for reporting metrics to a statsd instance.
    pub metrics: Metrics,

    /// DSN to report internal errors to
    pub sentry_dsn: Option<Dsn>,

    /// Node table settings.
    pub cache: CacheConfig,

    /// Expiry options per compute method, keyed by `service.method`.
    pub methods: BTreeMap<String, MethodOptions>,

    /// Default coalescing of pushed invalidations.
    pub update_delayer: UpdateDelayerConfig,

    /// Settings for replicas created from this configuration.
    pub replica: ReplicaConfig,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            bind: "127.0.0.1:3040".to_owned(),
            logging: Logging::default(),
            metrics: Metrics::default(),
            sentry_dsn: None,
            cache: CacheConfig::default(),
            methods: BTreeMap::new(),
            update_delayer: UpdateDelayerConfig::default(),
            replica: ReplicaConfig::default(),
        }
    }
}

impl Config {
    pub fn get(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::from_reader(
                fs::File::open(path).context("failed to open configuration file")?,
            ),
            None => Ok(Config::default()),
        }
    }

    fn from_reader(mut reader: impl std::io::Read) -> Result<Self> {
        let mut config = String::new();
        reader
            .read_to_string(&mut config)
            .context("failed reading config file")?;
        // check for empty files explicitly
        if config.trim().is_empty() {
            anyhow::bail!("config file empty");
        }
        serde_yaml::from_str(&config).context("failed to parse config YAML")
    }
}

/// A duration given either as fractional seconds or as a humantime string.
#[derive(Deserialize)]
#[serde(untagged)]
enum DurationRepr {
    Seconds(f64),
    Human(#[serde(with = "humantime_serde")] Duration),
}

impl DurationRepr {
    fn into_duration<E: de::Error>(self) -> Result<Duration, E> {
        match self {
            DurationRepr::Seconds(secs) => Duration::try_from_secs_f64(secs)
                .map_err(|_| E::custom(format!("invalid duration of {secs} seconds"))),
            DurationRepr::Human(duration) => Ok(duration),
        }
    }
}

/// Deserializes a duration from fractional seconds (`0.25`) or a humantime string (`250ms`).
pub fn deserialize_duration<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
    DurationRepr::deserialize(deserializer)?.into_duration()
}

/// Like [`deserialize_duration`], with `null` meaning "never".
pub fn deserialize_opt_duration<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<Option<Duration>, D::Error> {
    Option::<DurationRepr>::deserialize(deserializer)?
        .map(DurationRepr::into_duration)
        .transpose()
}

#[derive(Debug)]
struct LevelFilterVisitor;

impl<'de> de::Visitor<'de> for LevelFilterVisitor {
    type Value = LevelFilter;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> std::fmt::Result {
        write!(
            formatter,
            r#"one of the strings "off", "error", "warn", "info", "debug", or "trace""#
        )
    }

    fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
    where
        E: de::Error,
    {
        match v {
            "off" => Ok(LevelFilter::OFF),
            "error" => Ok(LevelFilter::ERROR),
            "warn" => Ok(LevelFilter::WARN),
            "info" => Ok(LevelFilter::INFO),
            "debug" => Ok(LevelFilter::DEBUG),
            "trace" => Ok(LevelFilter::TRACE),
            _ => Err(de::Error::unknown_variant(
                v,
                &["off", "error", "warn", "info", "debug", "trace"],
            )),
        }
    }
}

fn deserialize_level_filter<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<LevelFilter, D::Error> {
    deserializer.deserialize_str(LevelFilterVisitor)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_method_options() {
        let yaml = r#"
            methods:
              time.now:
                auto_invalidate_time: 1
                keep_alive_time: 0.5
              users.get:
                keep_alive_time: 10m
              users.list:
                auto_invalidate_time: 1500ms
        "#;
        let cfg = Config::from_reader(yaml.as_bytes()).unwrap();

        let now = &cfg.methods["time.now"];
        assert_eq!(now.auto_invalidate_time, Some(Duration::from_secs(1)));
        assert_eq!(now.keep_alive_time, Duration::from_millis(500));

        let get = &cfg.methods["users.get"];
        assert_eq!(get.auto_invalidate_time, None);
        assert_eq!(get.keep_alive_time, Duration::from_secs(600));

        let list = &cfg.methods["users.list"];
        assert_eq!(list.auto_invalidate_time, Some(Duration::from_millis(1500)));
        assert_eq!(list.keep_alive_time, MethodOptions::default().keep_alive_time);
    }

    #[test]
    fn test_method_options_debug() {
        let yaml = r#"
            methods:
              time.now:
                auto_invalidate_time: 1
                keep_alive_time: 500ms
        "#;
        let cfg = Config::from_reader(yaml.as_bytes()).unwrap();
        insta::assert_debug_snapshot!(cfg.methods, @r###"
        {
            "time.now": MethodOptions {
                auto_invalidate_time: Some(
                    1s,
                ),
                keep_alive_time: 500ms,
            },
        }
        "###);
    }

    #[test]
    fn test_disabling_auto_invalidation() {
        let yaml = r#"
            methods:
              time.now:
                auto_invalidate_time: null
        "#;
        let cfg = Config::from_reader(yaml.as_bytes()).unwrap();
        assert_eq!(cfg.methods["time.now"].auto_invalidate_time, None);
    }

    #[test]
    fn test_negative_duration() {
        let yaml = r#"
            update_delayer:
              window: -1
        "#;
        assert!(Config::from_reader(yaml.as_bytes()).is_err());
    }

    #[test]
    fn test_sections_keep_defaults() {
        let yaml = r#"
            update_delayer:
              window: 0
            replica:
              disconnect_grace_period: 2s
        "#;
        let cfg = Config::from_reader(yaml.as_bytes()).unwrap();
        assert_eq!(cfg.update_delayer.window, Duration::ZERO);
        assert_eq!(cfg.replica.disconnect_grace_period, Duration::from_secs(2));
        assert_eq!(cfg.replica.reconnect_delay, ReplicaConfig::default().reconnect_delay);
        assert_eq!(cfg.cache, CacheConfig::default());
        assert_eq!(cfg.logging.level, LevelFilter::INFO);
    }

    #[test]
    fn test_empty_file() {
        let err = Config::from_reader("  \n".as_bytes()).unwrap_err();
        assert_eq!(err.to_string(), "config file empty");
    }
}
