//! Launch configuration for a worker process.

use std::ffi::OsString;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Environment variable carrying [`WorkerOptions`] (JSON) to the child.
pub const WORKER_OPTIONS_ENV: &str = "TASKFORK_WORKER_OPTIONS";

const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(4);
const DEFAULT_DRAIN_TIMEOUT_MS: u64 = 4_000;
const DEFAULT_EXIT_QUERY_TIMEOUT_MS: u64 = 4_000;

/// Where the worker's stdout/stderr lines end up on the controller side.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OutputMode {
    /// Re-emitted as tracing events under the `taskfork::worker` target.
    /// Falls back to [`OutputMode::Passthrough`] when no subscriber is
    /// installed at launch.
    #[default]
    Tracing,
    /// Copied verbatim to the controller's own stdout/stderr.
    Passthrough,
}

/// Settings the controller hands to the worker process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerOptions {
    /// Log only a one-line summary of task failures.
    pub hide_backtrace: bool,
    /// Concurrent task limit. Defaults to the available parallelism.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pool_size: Option<usize>,
    /// How long in-flight tasks get to finish after end-of-submissions.
    pub drain_timeout_ms: u64,
    /// How long a task's exit request waits for the controller's answer.
    pub exit_query_timeout_ms: u64,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            hide_backtrace: false,
            pool_size: None,
            drain_timeout_ms: DEFAULT_DRAIN_TIMEOUT_MS,
            exit_query_timeout_ms: DEFAULT_EXIT_QUERY_TIMEOUT_MS,
        }
    }
}

impl WorkerOptions {
    /// Reads options set by the controller; a missing variable means defaults.
    pub fn from_env() -> Result<Self, serde_json::Error> {
        match std::env::var(WORKER_OPTIONS_ENV) {
            Ok(json) => serde_json::from_str(&json),
            Err(_) => Ok(Self::default()),
        }
    }

    pub fn to_env_value(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn pool_size(&self) -> usize {
        self.pool_size
            .filter(|&n| n > 0)
            .or_else(|| std::thread::available_parallelism().ok().map(|n| n.get()))
            .unwrap_or(1)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }

    pub fn exit_query_timeout(&self) -> Duration {
        Duration::from_millis(self.exit_query_timeout_ms)
    }
}

/// Everything needed to start a worker.
///
/// The child command line is `executable [launch_options..] task [task_args..]`.
#[derive(Debug, Clone)]
pub struct ExecutorSpec {
    pub executable: PathBuf,
    pub launch_options: Vec<OsString>,
    pub task: String,
    pub task_args: Vec<String>,
    pub handshake_timeout: Duration,
    pub idle_exit: bool,
    pub output: OutputMode,
    pub worker: WorkerOptions,
}

impl ExecutorSpec {
    pub fn new(executable: impl Into<PathBuf>, task: impl Into<String>) -> Self {
        Self {
            executable: executable.into(),
            launch_options: Vec::new(),
            task: task.into(),
            task_args: Vec::new(),
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            idle_exit: false,
            output: OutputMode::default(),
            worker: WorkerOptions::default(),
        }
    }

    /// Argument placed before the task name (runtime flags for the worker executable).
    pub fn with_launch_option(mut self, option: impl Into<OsString>) -> Self {
        self.launch_options.push(option.into());
        self
    }

    /// Argument passed through to the task's factory.
    pub fn with_task_arg(mut self, arg: impl Into<String>) -> Self {
        self.task_args.push(arg.into());
        self
    }

    pub fn with_task_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.task_args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn with_hide_backtrace(mut self, hide: bool) -> Self {
        self.worker.hide_backtrace = hide;
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Let the worker exit when it asks to while nothing is in flight.
    pub fn with_idle_exit(mut self, idle_exit: bool) -> Self {
        self.idle_exit = idle_exit;
        self
    }

    pub fn with_output(mut self, output: OutputMode) -> Self {
        self.output = output;
        self
    }

    pub fn with_pool_size(mut self, n: usize) -> Self {
        self.worker.pool_size = Some(n);
        self
    }

    pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.worker.drain_timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    pub fn with_exit_query_timeout(mut self, timeout: Duration) -> Self {
        self.worker.exit_query_timeout_ms =
            u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_collects_arguments_in_order() {
        let spec = ExecutorSpec::new("/usr/bin/worker", "echo")
            .with_launch_option("--quiet")
            .with_task_arg("--delay-ms")
            .with_task_args(["10", "--fail-on"])
            .with_idle_exit(true);

        assert_eq!(spec.launch_options, vec![OsString::from("--quiet")]);
        assert_eq!(spec.task_args, vec!["--delay-ms", "10", "--fail-on"]);
        assert!(spec.idle_exit);
        assert_eq!(spec.handshake_timeout, Duration::from_secs(4));
    }

    #[test]
    fn worker_options_default_serializes() {
        let json = WorkerOptions::default().to_env_value().unwrap();
        insta::assert_snapshot!(json, @r#"{"hide_backtrace":false,"drain_timeout_ms":4000,"exit_query_timeout_ms":4000}"#);
    }

    #[test]
    fn worker_options_fill_missing_fields() {
        let options: WorkerOptions = serde_json::from_str(r#"{"pool_size":3}"#).unwrap();
        assert_eq!(options.pool_size(), 3);
        assert!(!options.hide_backtrace);
        assert_eq!(options.drain_timeout(), Duration::from_secs(4));
    }

    #[test]
    fn zero_pool_size_falls_back_to_parallelism() {
        let options = WorkerOptions {
            pool_size: Some(0),
            ..WorkerOptions::default()
        };
        assert!(options.pool_size() >= 1);
    }

    #[test]
    fn spec_carries_worker_options() {
        let spec = ExecutorSpec::new("w", "t")
            .with_hide_backtrace(true)
            .with_pool_size(2)
            .with_drain_timeout(Duration::from_millis(250));
        assert!(spec.worker.hide_backtrace);
        assert_eq!(spec.worker.pool_size, Some(2));
        assert_eq!(spec.worker.drain_timeout_ms, 250);
    }
}
