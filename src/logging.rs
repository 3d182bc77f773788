//! Logging setup: stdout plus a daily-rolling file, both driven by [`LogConfig`].

use std::str::FromStr;

use anyhow::Result;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::fmt::time::{ChronoLocal, ChronoUtc, FormatTime};
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::layer::Layered;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer, Registry};

use crate::config::{log_dir_path, LogConfig};

const CRATE_TARGET: &str = "synward";
const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";

type Filtered = Layered<EnvFilter, Registry>;
type BoxedLayer = Box<dyn Layer<Filtered> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Compact,
    Pretty,
    Json,
}

impl FromStr for LogFormat {
    type Err = std::convert::Infallible;

    /// Unknown names fall back to `Text`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.to_ascii_lowercase().as_str() {
            "json" => LogFormat::Json,
            "compact" => LogFormat::Compact,
            "pretty" => LogFormat::Pretty,
            _ => LogFormat::Text,
        })
    }
}

impl LogFormat {
    fn file_suffix(self) -> &'static str {
        match self {
            LogFormat::Json => "json",
            _ => "log",
        }
    }
}

#[derive(Debug, Clone)]
enum LogTimer {
    Local(ChronoLocal),
    Utc(ChronoUtc),
}

impl LogTimer {
    fn from_config(timestamp_format: &str) -> Self {
        match timestamp_format.to_ascii_lowercase().as_str() {
            "rfc3339" => LogTimer::Utc(ChronoUtc::rfc_3339()),
            "utc" => LogTimer::Utc(ChronoUtc::new(TIME_FORMAT.to_string())),
            _ => LogTimer::Local(ChronoLocal::new(TIME_FORMAT.to_string())),
        }
    }
}

impl FormatTime for LogTimer {
    fn format_time(&self, w: &mut Writer<'_>) -> std::fmt::Result {
        match self {
            LogTimer::Local(t) => t.format_time(w),
            LogTimer::Utc(t) => t.format_time(w),
        }
    }
}

/// Parse log level string to a filter directive level.
fn parse_log_level(level_str: &str) -> Result<&'static str> {
    match level_str.to_lowercase().as_str() {
        "trace" => Ok("trace"),
        "debug" => Ok("debug"),
        "info" => Ok("info"),
        "warn" => Ok("warn"),
        "error" => Ok("error"),
        _ => anyhow::bail!("Invalid log level: {}", level_str),
    }
}

/// Filter directives for `cfg`: the crate level, then each valid per-module
/// override. Invalid module levels are dropped.
fn filter_directives(cfg: &LogConfig) -> Result<String> {
    let level = parse_log_level(&cfg.level)?;
    let mut directives = format!("{CRATE_TARGET}={level}");
    let mut modules: Vec<_> = cfg.module_levels.iter().collect();
    modules.sort();
    for (module, module_level) in modules {
        if let Ok(parsed) = parse_log_level(module_level) {
            directives.push_str(&format!(",{module}={parsed}"));
        }
    }
    Ok(directives)
}

fn fmt_layer<W>(cfg: &LogConfig, format: LogFormat, timer: LogTimer, writer: W, ansi: bool) -> BoxedLayer
where
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    let base = fmt::layer()
        .with_writer(writer)
        .with_timer(timer)
        .with_ansi(ansi)
        .with_target(cfg.show_target)
        .with_file(cfg.show_file)
        .with_line_number(cfg.show_file);
    match format {
        LogFormat::Json => base.json().boxed(),
        LogFormat::Compact => base.compact().boxed(),
        LogFormat::Pretty => base.pretty().boxed(),
        LogFormat::Text => base.boxed(),
    }
}

/// Initialize the global subscriber from `cfg`. `RUST_LOG`, when set, replaces
/// the configured levels. Keep the returned guard alive for as long as file
/// logging is wanted; dropping it flushes and stops the file writer.
pub fn init_logging(cfg: &LogConfig) -> Result<WorkerGuard> {
    let directives = filter_directives(cfg)?;
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&directives));

    let log_dir = log_dir_path(cfg);
    std::fs::create_dir_all(&log_dir)?;
    let format: LogFormat = cfg.format.parse().unwrap_or(LogFormat::Text);

    // synward.yyyy-MM-dd.log (or .json)
    let file_appender = tracing_appender::rolling::RollingFileAppender::builder()
        .rotation(tracing_appender::rolling::Rotation::DAILY)
        .filename_prefix(CRATE_TARGET)
        .filename_suffix(format.file_suffix())
        .build(&log_dir)
        .map_err(|e| anyhow::anyhow!("Failed to create rolling file appender: {}", e))?;
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let timer = LogTimer::from_config(&cfg.timestamp_format);
    let layers: Vec<BoxedLayer> = vec![
        fmt_layer(cfg, format, timer.clone(), non_blocking, false),
        fmt_layer(cfg, format, timer, std::io::stdout, true),
    ];

    tracing_subscriber::registry()
        .with(env_filter)
        .with(layers)
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to install tracing subscriber: {}", e))?;

    tracing::info!(
        level = %cfg.level,
        format = %cfg.format,
        timestamp_format = %cfg.timestamp_format,
        dir = %log_dir.display(),
        "Logging initialized"
    );
    Ok(guard)
}

/// Stdout-only logging for embedders that have no config loaded yet.
pub fn init_simple_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| format!("{CRATE_TARGET}=info").into()),
        )
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn directives_include_sorted_module_overrides() {
        let mut cfg = LogConfig {
            level: "DEBUG".into(),
            ..Default::default()
        };
        cfg.module_levels.insert("synward::heartbeat".into(), "trace".into());
        cfg.module_levels.insert("synward::cron".into(), "warn".into());
        cfg.module_levels.insert("synward::bus".into(), "loud".into());
        assert_eq!(
            filter_directives(&cfg).unwrap(),
            "synward=debug,synward::cron=warn,synward::heartbeat=trace"
        );
    }

    #[test]
    fn invalid_crate_level_is_an_error() {
        let cfg = LogConfig {
            level: "verbose".into(),
            ..Default::default()
        };
        assert!(filter_directives(&cfg).is_err());
    }

    #[test]
    fn unknown_format_falls_back_to_text() {
        assert_eq!("JSON".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert_eq!("pretty".parse::<LogFormat>().unwrap(), LogFormat::Pretty);
        assert_eq!("fancy".parse::<LogFormat>().unwrap(), LogFormat::Text);
        assert_eq!(LogFormat::Json.file_suffix(), "json");
        assert_eq!(LogFormat::Compact.file_suffix(), "log");
    }
}
