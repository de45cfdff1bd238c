use std::backtrace::{Backtrace, BacktraceStatus};
use std::panic::PanicHookInfo;

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{Layer, filter::EnvFilter, fmt};

const ENV_LOG_LEVEL: &str = "LOG_LEVEL";
const ENV_DEBUG: &str = "FRESHNESS_DEBUG";

/// Routes panics through `tracing` so they end up in the same (JSON) stream as every other
/// event, on a single line unless a backtrace was captured.
fn report_panic(panic_info: &PanicHookInfo<'_>) {
    // noop unless RUST_BACKTRACE or RUST_LIB_BACKTRACE is set
    let backtrace = Backtrace::capture();
    let backtrace_captured = backtrace.status() == BacktraceStatus::Captured;
    let payload = if let Some(s) = panic_info.payload().downcast_ref::<&str>() {
        Some(*s)
    } else {
        panic_info
            .payload()
            .downcast_ref::<String>()
            .map(|s| s.as_str())
    };

    match (panic_info.location(), payload, backtrace_captured) {
        (Some(location), Some(payload), false) => {
            tracing::error!(
                "{}:{}:{}: {}",
                location.file(),
                location.line(),
                location.column(),
                payload,
            );
        }
        _ => {
            tracing::error!("{}\n{}", panic_info, backtrace);
        }
    };
}

/// Maps a `LOG_LEVEL` value to a tracing level. Besides the tracing names, the `WARNING`,
/// `CRITICAL` and `FATAL` spellings common to other loggers are accepted.
fn parse_level(log_level: &str) -> Option<Level> {
    match log_level.trim().to_ascii_lowercase().as_str() {
        "warning" => Some(Level::WARN),
        "critical" | "fatal" => Some(Level::ERROR),
        other => other.parse().ok(),
    }
}

/// Default filter directive: `debug` in debug mode, otherwise `LOG_LEVEL` or `info`.
/// librdkafka chatter is kept at `warn` below everything else.
fn default_directive(debug_mode: bool, log_level: Option<&str>) -> String {
    let level = if debug_mode {
        Level::DEBUG
    } else {
        log_level.and_then(parse_level).unwrap_or(Level::INFO)
    };
    format!("{},rdkafka=warn", level.as_str().to_lowercase())
}

pub fn register() {
    // RUST_LOG, when set, overrides the default directive built from LOG_LEVEL.
    let debug_mode = std::env::var(ENV_DEBUG).is_ok_and(|v| v.eq_ignore_ascii_case("true"));
    let log_level = std::env::var(ENV_LOG_LEVEL).ok();
    let directive = default_directive(debug_mode, log_level.as_deref());

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(directive));

    let layer = if debug_mode {
        // Text format
        fmt::layer().boxed()
    } else {
        // JSON format, flattened
        fmt::layer()
            .with_ansi(false)
            .json()
            .flatten_event(true)
            .boxed()
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(layer)
        .init();

    std::panic::set_hook(Box::new(report_panic));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_directive() {
        assert_eq!(default_directive(false, None), "info,rdkafka=warn");
        assert_eq!(default_directive(false, Some("WARN")), "warn,rdkafka=warn");
        assert_eq!(default_directive(false, Some("verbose")), "info,rdkafka=warn");
        assert_eq!(default_directive(true, Some("error")), "debug,rdkafka=warn");
    }

    #[test]
    fn test_default_directive_accepts_logger_aliases() {
        assert_eq!(default_directive(false, Some("WARNING")), "warn,rdkafka=warn");
        assert_eq!(default_directive(false, Some("warning")), "warn,rdkafka=warn");
        assert_eq!(default_directive(false, Some("CRITICAL")), "error,rdkafka=warn");
        assert_eq!(default_directive(false, Some(" Fatal ")), "error,rdkafka=warn");
        assert_eq!(default_directive(false, Some("Debug")), "debug,rdkafka=warn");
    }
}
