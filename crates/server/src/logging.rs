use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::config::LogFormat;

const DEFAULT_FILTER: &str = "info,tower_http=warn,hyper=warn";
const LOG_FILE_NAME: &str = "server.log";

pub struct LoggingHandle {
    pub run_id: String,
    pub guard: WorkerGuard,
}

pub fn init_logging(
    log_dir: &Path,
    format: LogFormat,
    to_stdout: bool,
) -> anyhow::Result<LoggingHandle> {
    let directive = filter_directive(
        std::env::var("AGENTRELAY_LOG_FILTER").ok(),
        std::env::var("RUST_LOG").ok(),
    );
    let filter = EnvFilter::try_new(&directive).unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    let (writer, guard, destination) = if to_stdout {
        let (writer, guard) = tracing_appender::non_blocking(std::io::stdout());
        (writer, guard, "stdout".to_string())
    } else {
        std::fs::create_dir_all(log_dir)?;
        let file_appender = tracing_appender::rolling::never(log_dir, LOG_FILE_NAME);
        let (writer, guard) = tracing_appender::non_blocking(file_appender);
        (
            writer,
            guard,
            log_dir.join(LOG_FILE_NAME).display().to_string(),
        )
    };

    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Pretty => registry
            .with(
                fmt::layer()
                    .with_writer(writer)
                    .with_ansi(to_stdout)
                    .pretty()
                    .with_file(true)
                    .with_line_number(true)
                    .with_target(true),
            )
            .try_init()?,
        LogFormat::Json => registry
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
            .try_init()?,
    }

    let run_id = std::env::var("AGENTRELAY_RUN_ID").unwrap_or_else(|_| {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or(0);
        format!("pid-{}-{}", std::process::id(), now)
    });

    tracing::info!(
        component = "logging",
        event = "logging.initialized",
        destination = %destination,
        format = ?format,
        filter = %directive,
        run_id = %run_id,
    );

    Ok(LoggingHandle { run_id, guard })
}

/// First parseable directive of `AGENTRELAY_LOG_FILTER`, then `RUST_LOG`.
fn filter_directive(custom: Option<String>, rust_log: Option<String>) -> String {
    [custom, rust_log]
        .into_iter()
        .flatten()
        .find(|value| !value.trim().is_empty() && EnvFilter::try_new(value).is_ok())
        .unwrap_or_else(|| DEFAULT_FILTER.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_prefers_custom_variable() {
        assert_eq!(
            filter_directive(Some("debug".into()), Some("warn".into())),
            "debug"
        );
        assert_eq!(filter_directive(None, Some("warn".into())), "warn");
        assert_eq!(filter_directive(None, None), DEFAULT_FILTER);
        assert_eq!(filter_directive(Some("  ".into()), None), DEFAULT_FILTER);
    }
}
