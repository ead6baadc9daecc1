//! Supervisor telemetry: a rolling text log for everything plus a JSON
//! event stream for worker lifecycle transitions (records emitted with
//! `target: "event"`).

use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::filter::{EnvFilter, FilterFn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{Layer, fmt};

pub struct FileTelemetry {
    _guards: Vec<WorkerGuard>,
}

impl FileTelemetry {
    /// Install the global subscriber. Returns guards that must stay alive
    /// for the duration of the process or buffered lines are lost.
    pub fn init_files(log_level: &str, logs_dir: &Path, events_dir: &Path) -> FileTelemetry {
        let filter =
            EnvFilter::try_new(log_level).unwrap_or_else(|_| EnvFilter::new("info"));

        let (log_writer, log_guard) =
            tracing_appender::non_blocking(tracing_appender::rolling::daily(logs_dir, "opsdeck.log"));
        let log_layer = fmt::layer().with_writer(log_writer).with_ansi(false).boxed();

        let (event_writer, event_guard) = tracing_appender::non_blocking(
            tracing_appender::rolling::daily(events_dir, "events.json"),
        );
        let event_layer = fmt::layer()
            .json()
            .with_writer(event_writer)
            .with_filter(FilterFn::new(|meta| meta.target() == "event"))
            .boxed();

        let stderr_layer = fmt::layer().with_writer(std::io::stderr).boxed();

        tracing_subscriber::registry()
            .with(filter)
            .with(log_layer)
            .with(event_layer)
            .with(stderr_layer)
            .init();

        FileTelemetry { _guards: vec![log_guard, event_guard] }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_is_well_formed() {
        // The global subscriber can only be installed once per process, so
        // this just exercises construction against a throwaway directory.
        let dir = tempfile::tempdir().unwrap();
        let telemetry = FileTelemetry::init_files("debug", dir.path(), dir.path());
        tracing::info!(target: "event", plugin = "stripe", state = "running", "transition");
        drop(telemetry);
        let entries: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        assert!(!entries.is_empty());
    }
}
