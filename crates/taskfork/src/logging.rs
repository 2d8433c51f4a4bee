//! Tracing subscriber setup shared by worker binaries and embedding controllers.

use tracing_subscriber::EnvFilter;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Full directive syntax; wins over `TASKFORK_LOG` when it parses.
const RUST_LOG: &str = "RUST_LOG";
/// A bare level applied to the library and the worker binary.
const TASKFORK_LOG: &str = "TASKFORK_LOG";

fn build_filter(rust_log: Option<&str>, taskfork_log: Option<&str>) -> EnvFilter {
    if let Some(filter) = rust_log
        .filter(|d| !d.trim().is_empty())
        .and_then(|d| EnvFilter::try_new(d).ok())
    {
        return filter;
    }
    let level = taskfork_log
        .and_then(|l| l.trim().parse::<LevelFilter>().ok())
        .unwrap_or(LevelFilter::INFO);
    EnvFilter::new(format!("taskfork={level},taskfork_worker={level}"))
}

/// Installs a stderr subscriber. Stdout stays clean for the port handshake.
///
/// `LOG_FORMAT=json` switches to JSON lines. A no-op if a global subscriber
/// is already installed.
pub fn init_tracing() {
    let filter = build_filter(
        std::env::var(RUST_LOG).ok().as_deref(),
        std::env::var(TASKFORK_LOG).ok().as_deref(),
    );
    let use_json = std::env::var("LOG_FORMAT").as_deref() == Ok("json");

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(use_json.then(|| fmt::layer().json().with_writer(std::io::stderr)))
        .with((!use_json).then(|| fmt::layer().with_writer(std::io::stderr)))
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rust_log_takes_precedence() {
        let filter = build_filter(Some("debug"), Some("error"));
        assert_eq!(filter.max_level_hint(), Some(LevelFilter::DEBUG));
    }

    #[test]
    fn taskfork_log_scopes_level_to_crate() {
        let filter = build_filter(None, Some("WARN"));
        assert_eq!(filter.max_level_hint(), Some(LevelFilter::WARN));
    }

    #[test]
    fn unusable_values_fall_back_to_info() {
        let filter = build_filter(Some("taskfork=loud"), Some("loud"));
        assert_eq!(filter.max_level_hint(), Some(LevelFilter::INFO));

        let filter = build_filter(Some("  "), None);
        assert_eq!(filter.max_level_hint(), Some(LevelFilter::INFO));
    }

    #[test]
    fn repeated_init_is_harmless() {
        init_tracing();
        init_tracing();
    }
}
