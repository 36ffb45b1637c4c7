//! Logging setup.
//!
//! The log file receives everything the configured level allows. The console
//! (stderr) only shows warnings and errors unless debug mode is on, so the
//! chat output on stdout stays readable.

use std::fs::OpenOptions;
use std::sync::Mutex;

use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::layer::Layered;
use tracing_subscriber::{EnvFilter, Layer, Registry, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::{LogFormat, LoggingSection};

/// Crates that are too chatty at `info`.
const QUIET_TARGETS: &str = "rmcp=error,reqwest=warn,hyper=warn,hyper_util=warn";

type Base = Layered<EnvFilter, Registry>;
type BoxedLayer = Box<dyn Layer<Base> + Send + Sync>;

/// Filter directive for `logging`, unless `RUST_LOG` overrides it.
pub fn filter_directive(logging: &LoggingSection) -> String {
    format!("{},{QUIET_TARGETS}", logging.filter_directive())
}

fn env_filter(logging: &LoggingSection) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter_directive(logging)))
}

fn console_layer(logging: &LoggingSection) -> BoxedLayer {
    let level = if logging.debug_mode {
        LevelFilter::TRACE
    } else {
        LevelFilter::WARN
    };
    let layer = fmt::layer().with_target(true).with_writer(std::io::stderr);
    match logging.format {
        LogFormat::Json => layer.json().with_filter(level).boxed(),
        LogFormat::Text => layer.with_filter(level).boxed(),
    }
}

fn file_layer(logging: &LoggingSection) -> Option<BoxedLayer> {
    let path = logging.file_path()?;
    let file = match OpenOptions::new().create(true).append(true).open(path) {
        Ok(file) => file,
        Err(e) => {
            eprintln!("Cannot open log file {path}: {e}; logging to the console only");
            return None;
        }
    };
    let layer = fmt::layer()
        .with_target(true)
        .with_ansi(false)
        .with_writer(Mutex::new(file));
    Some(match logging.format {
        LogFormat::Json => layer.json().boxed(),
        LogFormat::Text => layer.boxed(),
    })
}

/// Install the global subscriber.
pub fn init_tracing(logging: &LoggingSection) -> anyhow::Result<()> {
    let mut layers = vec![console_layer(logging)];
    layers.extend(file_layer(logging));

    tracing_subscriber::registry()
        .with(env_filter(logging))
        .with(layers)
        .try_init()?;

    tracing::info!(
        name: "logging.initialised",
        level = logging.filter_directive(),
        file = logging.file_path().unwrap_or("-"),
        "Logging initialised"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn section(level: &str, debug_mode: bool) -> LoggingSection {
        LoggingSection {
            level: level.to_string(),
            file: None,
            format: LogFormat::Text,
            debug_mode,
        }
    }

    #[test]
    fn test_filter_directive() {
        assert_eq!(
            filter_directive(&section("WARNING", false)),
            "warn,rmcp=error,reqwest=warn,hyper=warn,hyper_util=warn"
        );
        assert!(filter_directive(&section("INFO", true)).starts_with("debug,"));
    }

    #[test]
    fn test_file_layer_skipped_without_path() {
        assert!(file_layer(&section("INFO", false)).is_none());

        let dir = tempfile::tempdir().unwrap();
        let mut logging = section("INFO", false);
        logging.file = Some(dir.path().join("agent.log").display().to_string());
        assert!(file_layer(&logging).is_some());
        assert!(dir.path().join("agent.log").exists());
    }
}
