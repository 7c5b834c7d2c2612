//! Tracing setup for hosts of the session layer.
//!
//! Log lines carry `component` and `event` fields so the file output can be
//! filtered per subsystem (`auth_store`, `watchdog`, `realtime`, ...).

use std::time::{SystemTime, UNIX_EPOCH};

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::paths;

const DEFAULT_FILTER: &str = "info,sweat24_session=debug,reqwest=warn,tungstenite=warn";
const LOG_FILE: &str = "session.log";

/// Where log lines go
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogSink {
    /// `<data_dir>/logs/session.log`
    #[default]
    File,
    Stderr,
}

/// Keeps the non-blocking writer alive; drop it last.
pub struct LoggingHandle {
    pub run_id: String,
    pub guard: WorkerGuard,
}

pub fn init_logging(sink: LogSink) -> anyhow::Result<LoggingHandle> {
    let filter_source = filter_directives(|key| std::env::var(key).ok());
    let filter =
        EnvFilter::try_new(&filter_source).unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    let (writer, guard, location) = match sink {
        LogSink::File => {
            let log_dir = paths::log_dir();
            std::fs::create_dir_all(&log_dir)?;
            let appender = tracing_appender::rolling::daily(&log_dir, LOG_FILE);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (writer, guard, log_dir.join(LOG_FILE).display().to_string())
        }
        LogSink::Stderr => {
            let (writer, guard) = tracing_appender::non_blocking(std::io::stderr());
            (writer, guard, "stderr".to_string())
        }
    };

    let format = std::env::var("SWEAT24_LOG_FORMAT")
        .ok()
        .unwrap_or_else(|| default_format(sink).to_string());

    let registry = tracing_subscriber::registry().with(filter);
    if format.eq_ignore_ascii_case("pretty") {
        registry
            .with(
                fmt::layer()
                    .with_writer(writer)
                    .with_ansi(sink == LogSink::Stderr)
                    .compact()
                    .with_target(true),
            )
            .try_init()?;
    } else {
        registry
            .with(
                fmt::layer()
                    .with_writer(writer)
                    .json()
                    .flatten_event(true)
                    .with_file(true)
                    .with_line_number(true)
                    .with_target(true)
                    .with_current_span(true),
            )
            .try_init()?;
    }

    let run_id = std::env::var("SWEAT24_RUN_ID").unwrap_or_else(|_| {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or(0);
        format!("pid-{}-{}", std::process::id(), now)
    });

    tracing::info!(
        component = "logging",
        event = "logging.initialized",
        run_id = %run_id,
        location = %location,
        format = %format,
        filter = %filter_source,
    );

    Ok(LoggingHandle { run_id, guard })
}

/// `SWEAT24_LOG_FILTER` wins over `RUST_LOG`; blank values are skipped.
fn filter_directives(lookup: impl Fn(&str) -> Option<String>) -> String {
    ["SWEAT24_LOG_FILTER", "RUST_LOG"]
        .into_iter()
        .filter_map(&lookup)
        .find(|value| !value.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_FILTER.to_string())
}

fn default_format(sink: LogSink) -> &'static str {
    match sink {
        LogSink::File => "json",
        LogSink::Stderr => "pretty",
    }
}
