//! The unit of work run for each submission, and name-based lookup of it.

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio_util::bytes::Bytes;

use super::WorkerError;
use super::lifecycle::Lifecycle;

/// Work executed inside the worker process, once per submission.
///
/// Calls run concurrently on the blocking pool, so implementations may block
/// but must be `Sync`.
pub trait Task: Send + Sync + 'static {
    /// Produce output bytes for `input`, or fail. Failures are logged by the
    /// worker and reported to the controller without detail.
    fn run(&self, input: Bytes) -> anyhow::Result<Vec<u8>>;

    /// Called once after the controller connects, before any submission runs.
    fn attach(&self, lifecycle: Lifecycle) {
        let _ = lifecycle;
    }
}

impl<F> Task for F
where
    F: Fn(Bytes) -> anyhow::Result<Vec<u8>> + Send + Sync + 'static,
{
    fn run(&self, input: Bytes) -> anyhow::Result<Vec<u8>> {
        self(input)
    }
}

type TaskFactory = Box<dyn Fn(&[String]) -> anyhow::Result<Arc<dyn Task>> + Send + Sync>;

/// Tasks a worker binary can run, by the name the controller launches it with.
#[derive(Default)]
pub struct TaskRegistry {
    factories: BTreeMap<String, TaskFactory>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `factory` under `name`. The factory receives the task
    /// arguments from the worker's command line.
    pub fn register<F, T>(mut self, name: impl Into<String>, factory: F) -> Self
    where
        F: Fn(&[String]) -> anyhow::Result<T> + Send + Sync + 'static,
        T: Task,
    {
        self.factories.insert(
            name.into(),
            Box::new(move |args: &[String]| -> anyhow::Result<Arc<dyn Task>> {
                let task: Arc<dyn Task> = Arc::new(factory(args)?);
                Ok(task)
            }),
        );
        self
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(String::as_str)
    }

    pub fn create(&self, name: &str, args: &[String]) -> Result<Arc<dyn Task>, WorkerError> {
        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| WorkerError::UnknownTask {
                name: name.to_string(),
                known: self.names().collect::<Vec<_>>().join(", "),
            })?;
        factory(args).map_err(|source| WorkerError::TaskSetup {
            name: name.to_string(),
            error: source,
        })
    }
}

impl std::fmt::Debug for TaskRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_set().entries(self.names()).finish()
    }
}
