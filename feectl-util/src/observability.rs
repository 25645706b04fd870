use std::env;
use std::error::Error;
use std::path::Path;

use serde::Deserialize;
use tracing::level_filters::LevelFilter;
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_appender::rolling;
use tracing_subscriber::fmt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

type BoxError = Box<dyn Error + Send + Sync>;

// HTTP and TLS internals are only interesting when chasing a transport bug
const NOISY_TARGETS: [&str; 5] = ["hyper", "hyper_util", "h2", "reqwest", "rustls"];

/// The `[log]` table
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LogConfig {
    /// `off`, `error`, `warn`, `info`, `debug` or `trace`.  RUST_LOG overrides it.
    pub level: String,
    /// also write `<datadir>/<who>.log`
    pub file: bool,
    /// start a new log file every day
    pub daily_rotation: bool,
    /// colors on stdout
    pub ansi: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        LogConfig { level: "info".to_string(), file: true, daily_rotation: false, ansi: true }
    }
}

impl LogConfig {
    /// The configured level
    pub fn level_filter(&self) -> Result<LevelFilter, BoxError> {
        self.level
            .trim()
            .parse()
            .map_err(|_| format!("invalid log level {:?}", self.level).into())
    }
}

/// A non blocking appender writing to `<datadir>/<who>.log`
pub fn setup_file_appender<P: AsRef<Path>>(
    datadir: P,
    who: &str,
    daily_rotation: bool,
) -> (NonBlocking, WorkerGuard) {
    let name = format!("{}.log", who);
    if daily_rotation {
        tracing_appender::non_blocking(rolling::daily(datadir.as_ref(), name))
    } else {
        tracing_appender::non_blocking(rolling::never(datadir.as_ref(), name))
    }
}

/// The filter to log with.
///
/// A non-empty `rust_log` is used as is.  Otherwise the configured level
/// applies, with the HTTP stack held at `warn` unless the level is quieter.
pub fn filter_for(config: &LogConfig, rust_log: Option<String>) -> Result<EnvFilter, BoxError> {
    if let Some(directives) = rust_log.filter(|v| !v.trim().is_empty()) {
        return Ok(EnvFilter::try_new(directives)?);
    }
    let level = config.level_filter()?;
    let mut directives = vec![level.to_string()];
    if level > LevelFilter::WARN {
        directives.extend(NOISY_TARGETS.iter().map(|t| format!("{}=warn", t)));
    }
    Ok(EnvFilter::try_new(directives.join(","))?)
}

/// Install the global subscriber: stdout, plus a log file in `datadir` unless
/// turned off.
///
/// `log` records are forwarded too.  The returned guard flushes the file on
/// drop and must be held for the life of the process.
pub fn init_tracing_subscriber<P: AsRef<Path>>(
    datadir: P,
    who: &str,
    config: &LogConfig,
) -> Result<LogGuard, BoxError> {
    let filter = filter_for(config, env::var("RUST_LOG").ok())?;

    let format = fmt::format().with_level(true).with_target(true).compact();
    let stdout_layer = fmt::layer()
        .event_format(format.clone().with_ansi(config.ansi))
        .with_writer(std::io::stdout);

    let (file_layer, file_guard) = if config.file {
        let (writer, guard) = setup_file_appender(datadir, who, config.daily_rotation);
        let layer = fmt::layer().event_format(format.with_ansi(false)).with_writer(writer);
        (Some(layer), Some(guard))
    } else {
        (None, None)
    };

    tracing_subscriber::registry().with(stdout_layer).with(file_layer).with(filter).try_init()?;
    Ok(LogGuard { _file_appender_guard: file_guard })
}

/// Keeps the file appender alive
pub struct LogGuard {
    _file_appender_guard: Option<WorkerGuard>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(level: &str) -> LogConfig {
        LogConfig { level: level.to_string(), ..Default::default() }
    }

    #[test]
    fn http_stack_is_quieted() {
        let filter = filter_for(&at("debug"), None).unwrap().to_string();
        assert!(filter.contains("debug"));
        assert!(filter.contains("hyper=warn"));
        assert!(filter.contains("reqwest=warn"));

        let filter = filter_for(&at("ERROR"), None).unwrap().to_string();
        assert!(filter.contains("error"));
        assert!(!filter.contains("hyper"));
    }

    #[test]
    fn rust_log_wins() {
        let filter = filter_for(&at("info"), Some("feectl=trace".to_string())).unwrap().to_string();
        assert!(filter.contains("feectl=trace"));
        assert!(!filter.contains("hyper"));
        // blank is unset
        let filter = filter_for(&at("info"), Some(" ".to_string())).unwrap().to_string();
        assert!(filter.contains("hyper=warn"));
    }

    #[test]
    fn bad_level() {
        assert!(at("loud").level_filter().is_err());
        assert!(filter_for(&at("loud"), None).is_err());
        assert_eq!(LogConfig::default().level_filter().unwrap(), LevelFilter::INFO);
    }
}
