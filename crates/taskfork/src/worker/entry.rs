//! Process entry for worker binaries.
//!
//! A worker binary builds a [`TaskRegistry`] and hands it to [`main_with`]:
//!
//! ```no_run
//! use taskfork::worker::{TaskRegistry, entry};
//! use taskfork::bytes::Bytes;
//!
//! fn main() {
//!     let registry = TaskRegistry::new().register("upper", |_: &[String]| {
//!         Ok(|input: Bytes| -> anyhow::Result<Vec<u8>> { Ok(input.to_ascii_uppercase()) })
//!     });
//!     std::process::exit(entry::main_with(registry));
//! }
//! ```

use std::time::Duration;

use super::{TaskRegistry, WorkerConfig, WorkerError, run_worker};
use crate::spec::WorkerOptions;

/// How long runtime shutdown waits for blocking threads still running tasks.
const RUNTIME_SHUTDOWN_GRACE: Duration = Duration::from_millis(100);

/// Runs the worker named by the command line and returns the process exit code.
///
/// Arguments (after the program name): `<task> [task args...]`. Options come
/// from the environment the controller set up.
pub fn main_with(registry: TaskRegistry) -> i32 {
    crate::logging::init_tracing();

    match run(&registry, std::env::args().skip(1).collect()) {
        Ok(()) => {
            tracing::info!("Worker exiting");
            0
        }
        Err(e) => {
            tracing::error!(error = %e, "Worker failed");
            1
        }
    }
}

fn run(registry: &TaskRegistry, args: Vec<String>) -> Result<(), WorkerError> {
    let options = WorkerOptions::from_env().map_err(WorkerError::Options)?;
    let (name, task_args) = args.split_first().ok_or(WorkerError::Usage)?;

    let task = registry.create(name, task_args)?;
    tracing::debug!(task = %name, ?options, "Task created");

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("taskfork-worker")
        .build()
        .map_err(WorkerError::Runtime)?;

    let result = runtime.block_on(run_worker(
        task,
        WorkerConfig::from(&options),
        std::io::stdout(),
    ));
    runtime.shutdown_timeout(RUNTIME_SHUTDOWN_GRACE);
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_util::bytes::Bytes;

    fn registry() -> TaskRegistry {
        TaskRegistry::new().register("noop", |_: &[String]| {
            Ok(|input: Bytes| -> anyhow::Result<Vec<u8>> { Ok(input.to_vec()) })
        })
    }

    #[test]
    fn missing_task_name_is_usage_error() {
        assert!(matches!(run(&registry(), Vec::new()), Err(WorkerError::Usage)));
    }

    #[test]
    fn unknown_task_fails_before_handshake() {
        let err = run(&registry(), vec!["missing".to_string()]).unwrap_err();
        assert!(matches!(err, WorkerError::UnknownTask { .. }), "{err}");
    }
}
