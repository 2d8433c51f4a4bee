//! Worker process side: accepts the controller's connection and runs submissions.
//!
//! Flow:
//! 1. Bind `127.0.0.1:0` and print the port on stdout (the handshake)
//! 2. Accept exactly one connection
//! 3. Dispatch each submission to the blocking pool, bounded by `pool_size`;
//!    results are written back as they finish, in any order
//! 4. On end-of-submissions: acknowledge, stop reading, then wait up to
//!    `drain_timeout` for in-flight submissions. Not finishing in time is fatal.

pub mod entry;
pub mod lifecycle;
pub mod task;

use std::io::{self, Write};
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinSet};
use tokio_util::bytes::Bytes;
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::bridge::codec::{CommandCodec, MAX_PAYLOAD_LEN, ReplyCodec};
use crate::bridge::protocol::{Command, Reply, RequestId};
use crate::spec::WorkerOptions;

pub use lifecycle::Lifecycle;
pub use task::{Task, TaskRegistry};

use lifecycle::{ExitReply, InFlightGuard};

type ReplyWriter = Arc<tokio::sync::Mutex<FramedWrite<OwnedWriteHalf, ReplyCodec>>>;

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub pool_size: usize,
    pub drain_timeout: Duration,
    pub exit_query_timeout: Duration,
    pub hide_backtrace: bool,
}

impl From<&WorkerOptions> for WorkerConfig {
    fn from(options: &WorkerOptions) -> Self {
        Self {
            pool_size: options.pool_size(),
            drain_timeout: options.drain_timeout(),
            exit_query_timeout: options.exit_query_timeout(),
            hide_backtrace: options.hide_backtrace,
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self::from(&WorkerOptions::default())
    }
}

/// Fatal worker conditions. Each one ends the process with a non-zero status.
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("usage: <task> [args...]")]
    Usage,

    #[error("invalid worker options: {0}")]
    Options(serde_json::Error),

    #[error("unknown task '{name}' (known: {known})")]
    UnknownTask { name: String, known: String },

    #[error("failed to set up task '{name}': {error:#}")]
    TaskSetup { name: String, error: anyhow::Error },

    #[error("failed to start runtime: {0}")]
    Runtime(io::Error),

    #[error("failed to bind listener: {0}")]
    Bind(io::Error),

    #[error("failed to write port handshake: {0}")]
    Handshake(io::Error),

    #[error("failed to accept controller connection: {0}")]
    Accept(io::Error),

    #[error("control connection failed: {0}")]
    Connection(io::Error),

    #[error("controller closed the connection without ending submissions")]
    Disconnected,

    #[error("{remaining} submission(s) still running after {timeout:?}")]
    DrainTimeout { timeout: Duration, remaining: usize },
}

/// A bound, not yet connected worker.
pub struct Worker {
    listener: TcpListener,
    port: u16,
    config: WorkerConfig,
}

impl Worker {
    pub async fn bind(config: WorkerConfig) -> Result<Self, WorkerError> {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0))
            .await
            .map_err(WorkerError::Bind)?;
        let port = listener.local_addr().map_err(WorkerError::Bind)?.port();
        Ok(Self {
            listener,
            port,
            config,
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Accepts the controller and runs the dispatch loop to completion.
    pub async fn serve(self, task: Arc<dyn Task>) -> Result<(), WorkerError> {
        let Self {
            listener,
            port,
            config,
        } = self;

        let (stream, peer) = listener.accept().await.map_err(WorkerError::Accept)?;
        drop(listener);
        tracing::info!(port, %peer, "Controller connected");

        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!(error = %e, "Failed to set TCP_NODELAY");
        }
        let (read_half, write_half) = stream.into_split();
        let reader = FramedRead::new(read_half, CommandCodec);
        let writer = Arc::new(tokio::sync::Mutex::new(FramedWrite::new(
            write_half,
            ReplyCodec,
        )));

        run_dispatch_loop(reader, writer, task, config).await
    }
}

/// Binds, writes the port line to `handshake`, then serves.
pub async fn run_worker<W: Write>(
    task: Arc<dyn Task>,
    config: WorkerConfig,
    mut handshake: W,
) -> Result<(), WorkerError> {
    let worker = Worker::bind(config).await?;
    let port = worker.port();

    writeln!(handshake, "{port}")
        .and_then(|()| handshake.flush())
        .map_err(WorkerError::Handshake)?;
    tracing::info!(port, "Worker listening");

    worker.serve(task).await
}

async fn run_dispatch_loop(
    mut reader: FramedRead<OwnedReadHalf, CommandCodec>,
    writer: ReplyWriter,
    task: Arc<dyn Task>,
    config: WorkerConfig,
) -> Result<(), WorkerError> {
    let (lifecycle, mut exit_rx) = Lifecycle::new(config.exit_query_timeout);
    task.attach(lifecycle.clone());

    let permits = Arc::new(Semaphore::new(config.pool_size.max(1)));
    let mut running = JoinSet::new();
    let mut awaiting_exit: Vec<ExitReply> = Vec::new();

    tracing::debug!(pool_size = config.pool_size, "Dispatch loop started");

    // `None` means the controller ended submissions.
    let failure = loop {
        tokio::select! {
            frame = reader.next() => match frame {
                Some(Ok(Command::Run { id, payload })) => {
                    answer_exit_requests(&mut awaiting_exit, false);
                    tracing::trace!(%id, payload_bytes = payload.len(), "Submission received");
                    running.spawn(run_submission(
                        id,
                        payload,
                        Arc::clone(&task),
                        Arc::clone(&permits),
                        Arc::clone(&writer),
                        lifecycle.begin(),
                        config.hide_backtrace,
                    ));
                }
                Some(Ok(Command::EndOfSubmissions)) => {
                    tracing::info!("End of submissions received");
                    break None;
                }
                Some(Ok(Command::DenyShutdown)) => {
                    tracing::debug!("Controller denied exit request");
                    answer_exit_requests(&mut awaiting_exit, false);
                }
                Some(Err(e)) => {
                    tracing::error!(error = %e, "Control connection error");
                    break Some(WorkerError::Connection(e));
                }
                None => {
                    tracing::error!("Controller disconnected");
                    break Some(WorkerError::Disconnected);
                }
            },
            Some(reply) = exit_rx.recv() => {
                if lifecycle.in_flight() > 0 {
                    let _ = reply.send(false);
                    continue;
                }
                let first = awaiting_exit.is_empty();
                awaiting_exit.push(reply);
                if first {
                    tracing::debug!("Asking controller for permission to exit");
                    if let Err(e) = send_reply(&writer, Reply::ShutdownQuery).await {
                        tracing::warn!(error = %e, "Failed to send exit request");
                        answer_exit_requests(&mut awaiting_exit, false);
                    }
                }
            }
            Some(joined) = running.join_next(), if !running.is_empty() => {
                if let Err(e) = joined {
                    tracing::error!(error = %e, "Submission task did not complete");
                }
            }
        }
    };

    lifecycle.set_draining();
    answer_exit_requests(&mut awaiting_exit, failure.is_none());

    if failure.is_none() {
        match send_reply(&writer, Reply::ShutdownAck).await {
            Ok(()) => tracing::debug!("Acknowledged end of submissions"),
            // The controller usually closes its end right after sending -1.
            Err(e) => tracing::debug!(error = %e, "Could not acknowledge end of submissions"),
        }
    }

    let drained = drain(&mut running, config.drain_timeout).await;
    match (failure, drained) {
        (Some(e), Err(drain_error)) => {
            tracing::error!(error = %drain_error, "Drain failed after connection error");
            Err(e)
        }
        (Some(e), Ok(())) => Err(e),
        (None, result) => result,
    }
}

async fn run_submission(
    id: RequestId,
    payload: Bytes,
    task: Arc<dyn Task>,
    permits: Arc<Semaphore>,
    writer: ReplyWriter,
    guard: InFlightGuard,
    hide_backtrace: bool,
) {
    let reply = match permits.acquire_owned().await {
        Ok(permit) => {
            let outcome = tokio::task::spawn_blocking(move || {
                let _permit = permit;
                task.run(payload)
            })
            .await;
            to_reply(id, outcome, hide_backtrace)
        }
        Err(_) => Reply::Failure { id },
    };

    if let Err(e) = send_reply(&writer, reply).await {
        tracing::warn!(%id, error = %e, "Failed to write result");
    }
    drop(guard);
}

fn to_reply(
    id: RequestId,
    outcome: Result<anyhow::Result<Vec<u8>>, JoinError>,
    hide_backtrace: bool,
) -> Reply {
    match outcome {
        Ok(Ok(output)) if output.len() > MAX_PAYLOAD_LEN => {
            tracing::error!(%id, output_bytes = output.len(), "Task output exceeds frame limit");
            Reply::Failure { id }
        }
        Ok(Ok(output)) => Reply::Success {
            id,
            payload: Bytes::from(output),
        },
        Ok(Err(e)) if hide_backtrace => {
            tracing::error!(%id, "Task failed: {e}");
            Reply::Failure { id }
        }
        Ok(Err(e)) => {
            tracing::error!(%id, "Task failed: {e:?}");
            Reply::Failure { id }
        }
        Err(e) if e.is_panic() => {
            tracing::error!(%id, "Task panicked");
            Reply::Failure { id }
        }
        Err(e) => {
            tracing::error!(%id, error = %e, "Task did not complete");
            Reply::Failure { id }
        }
    }
}

async fn send_reply(writer: &ReplyWriter, reply: Reply) -> io::Result<()> {
    writer.lock().await.send(reply).await
}

fn answer_exit_requests(awaiting: &mut Vec<ExitReply>, granted: bool) {
    for reply in awaiting.drain(..) {
        let _ = reply.send(granted);
    }
}

async fn drain(running: &mut JoinSet<()>, timeout: Duration) -> Result<(), WorkerError> {
    if running.is_empty() {
        return Ok(());
    }
    tracing::debug!(remaining = running.len(), "Waiting for in-flight submissions");

    let finished = tokio::time::timeout(timeout, async {
        while let Some(joined) = running.join_next().await {
            if let Err(e) = joined {
                tracing::error!(error = %e, "Submission task did not complete");
            }
        }
    })
    .await;

    match finished {
        Ok(()) => Ok(()),
        Err(_) => {
            let remaining = running.len();
            running.abort_all();
            Err(WorkerError::DrainTimeout { timeout, remaining })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Mutex, mpsc as std_mpsc};
    use std::thread;

    use tokio::net::TcpStream;
    use tokio::task::JoinHandle;

    struct Controller {
        reader: FramedRead<OwnedReadHalf, ReplyCodec>,
        writer: FramedWrite<OwnedWriteHalf, CommandCodec>,
    }

    impl Controller {
        async fn run(&mut self, id: i32, payload: &'static [u8]) {
            let id = RequestId::new(id).unwrap();
            self.writer
                .send(Command::Run {
                    id,
                    payload: Bytes::from_static(payload),
                })
                .await
                .unwrap();
        }

        async fn recv(&mut self) -> Reply {
            self.reader.next().await.unwrap().unwrap()
        }

        /// Collects `n` results keyed by id.
        async fn results(&mut self, n: usize) -> HashMap<i32, Reply> {
            let mut out = HashMap::new();
            for _ in 0..n {
                let reply = self.recv().await;
                let id = reply.request_id().unwrap().get();
                out.insert(id, reply);
            }
            out
        }
    }

    fn config() -> WorkerConfig {
        WorkerConfig {
            pool_size: 4,
            drain_timeout: Duration::from_secs(2),
            exit_query_timeout: Duration::from_secs(2),
            hide_backtrace: false,
        }
    }

    async fn start(
        task: Arc<dyn Task>,
        config: WorkerConfig,
    ) -> (Controller, JoinHandle<Result<(), WorkerError>>) {
        let worker = Worker::bind(config).await.unwrap();
        let port = worker.port();
        let handle = tokio::spawn(worker.serve(task));

        let stream = TcpStream::connect((Ipv4Addr::LOCALHOST, port)).await.unwrap();
        let (read_half, write_half) = stream.into_split();
        let controller = Controller {
            reader: FramedRead::new(read_half, ReplyCodec),
            writer: FramedWrite::new(write_half, CommandCodec),
        };
        (controller, handle)
    }

    fn echo(input: Bytes) -> anyhow::Result<Vec<u8>> {
        match input.as_ref() {
            b"fail" => anyhow::bail!("asked to fail"),
            b"panic" => panic!("asked to panic"),
            _ => Ok(input.to_vec()),
        }
    }

    #[tokio::test]
    async fn echoes_and_acknowledges_end_of_submissions() {
        let (mut controller, handle) = start(Arc::new(echo), config()).await;

        controller.run(0, b"abc").await;
        controller.run(1, b"xyz").await;
        let results = controller.results(2).await;
        assert_eq!(
            results[&0],
            Reply::Success {
                id: RequestId::new(0).unwrap(),
                payload: Bytes::from_static(b"abc"),
            }
        );
        assert_eq!(
            results[&1],
            Reply::Success {
                id: RequestId::new(1).unwrap(),
                payload: Bytes::from_static(b"xyz"),
            }
        );

        controller.writer.send(Command::EndOfSubmissions).await.unwrap();
        assert_eq!(controller.recv().await, Reply::ShutdownAck);
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn task_errors_and_panics_are_reported_as_failures() {
        let (mut controller, handle) = start(Arc::new(echo), config()).await;

        controller.run(0, b"fail").await;
        controller.run(1, b"panic").await;
        controller.run(2, b"ok").await;
        let results = controller.results(3).await;
        assert!(matches!(results[&0], Reply::Failure { .. }));
        assert!(matches!(results[&1], Reply::Failure { .. }));
        assert!(matches!(results[&2], Reply::Success { .. }));

        // The loop keeps serving after failures.
        controller.run(3, b"still here").await;
        assert!(matches!(controller.recv().await, Reply::Success { .. }));

        controller.writer.send(Command::EndOfSubmissions).await.unwrap();
        assert_eq!(controller.recv().await, Reply::ShutdownAck);
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn hidden_backtraces_still_fail_the_call() {
        let config = WorkerConfig {
            hide_backtrace: true,
            ..config()
        };
        let (mut controller, handle) = start(Arc::new(echo), config).await;

        controller.run(0, b"fail").await;
        assert!(matches!(controller.recv().await, Reply::Failure { .. }));
        controller.writer.send(Command::EndOfSubmissions).await.unwrap();
        assert_eq!(controller.recv().await, Reply::ShutdownAck);
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn pool_size_bounds_concurrency() {
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let task = {
            let active = Arc::clone(&active);
            let peak = Arc::clone(&peak);
            move |input: Bytes| -> anyhow::Result<Vec<u8>> {
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                thread::sleep(Duration::from_millis(20));
                active.fetch_sub(1, Ordering::SeqCst);
                Ok(input.to_vec())
            }
        };
        let config = WorkerConfig {
            pool_size: 2,
            ..config()
        };
        let (mut controller, handle) = start(Arc::new(task), config).await;

        for id in 0..6 {
            controller.run(id, b"x").await;
        }
        let results = controller.results(6).await;
        assert_eq!(results.len(), 6);
        assert!(peak.load(Ordering::SeqCst) <= 2);

        controller.writer.send(Command::EndOfSubmissions).await.unwrap();
        assert_eq!(controller.recv().await, Reply::ShutdownAck);
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn disconnect_without_end_of_submissions_is_an_error() {
        let (controller, handle) = start(Arc::new(echo), config()).await;
        drop(controller);
        assert!(matches!(
            handle.await.unwrap(),
            Err(WorkerError::Disconnected)
        ));
    }

    #[tokio::test]
    async fn drain_timeout_is_fatal() {
        let slow = |input: Bytes| -> anyhow::Result<Vec<u8>> {
            thread::sleep(Duration::from_millis(300));
            Ok(input.to_vec())
        };
        let config = WorkerConfig {
            drain_timeout: Duration::from_millis(20),
            ..config()
        };
        let (mut controller, handle) = start(Arc::new(slow), config).await;

        controller.run(0, b"slow").await;
        controller.writer.send(Command::EndOfSubmissions).await.unwrap();
        assert_eq!(controller.recv().await, Reply::ShutdownAck);

        let err = handle.await.unwrap().unwrap_err();
        assert!(
            matches!(err, WorkerError::DrainTimeout { remaining: 1, .. }),
            "{err}"
        );
    }

    /// Asks to exit once, as soon as it is attached.
    struct ExitAsker {
        answers: Mutex<Option<std_mpsc::Sender<bool>>>,
    }

    impl ExitAsker {
        fn new() -> (Arc<Self>, std_mpsc::Receiver<bool>) {
            let (tx, rx) = std_mpsc::channel();
            let task = Arc::new(Self {
                answers: Mutex::new(Some(tx)),
            });
            (task, rx)
        }
    }

    impl Task for ExitAsker {
        fn run(&self, input: Bytes) -> anyhow::Result<Vec<u8>> {
            Ok(input.to_vec())
        }

        fn attach(&self, lifecycle: Lifecycle) {
            if let Some(tx) = self.answers.lock().unwrap().take() {
                thread::spawn(move || {
                    let _ = tx.send(lifecycle.request_exit());
                });
            }
        }
    }

    async fn exit_answer(rx: std_mpsc::Receiver<bool>) -> bool {
        tokio::task::spawn_blocking(move || rx.recv_timeout(Duration::from_secs(5)))
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn exit_request_denied_by_controller() {
        let (task, answers) = ExitAsker::new();
        let (mut controller, handle) = start(task, config()).await;

        assert_eq!(controller.recv().await, Reply::ShutdownQuery);
        controller.writer.send(Command::DenyShutdown).await.unwrap();
        assert!(!exit_answer(answers).await);

        controller.writer.send(Command::EndOfSubmissions).await.unwrap();
        assert_eq!(controller.recv().await, Reply::ShutdownAck);
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn new_submission_denies_pending_exit_request() {
        let (task, answers) = ExitAsker::new();
        let (mut controller, handle) = start(task, config()).await;

        assert_eq!(controller.recv().await, Reply::ShutdownQuery);
        controller.run(0, b"more work").await;
        assert!(!exit_answer(answers).await);
        assert!(matches!(controller.recv().await, Reply::Success { .. }));

        controller.writer.send(Command::EndOfSubmissions).await.unwrap();
        assert_eq!(controller.recv().await, Reply::ShutdownAck);
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn end_of_submissions_grants_pending_exit_request() {
        let (task, answers) = ExitAsker::new();
        let (mut controller, handle) = start(task, config()).await;

        assert_eq!(controller.recv().await, Reply::ShutdownQuery);
        controller.writer.send(Command::EndOfSubmissions).await.unwrap();
        assert_eq!(controller.recv().await, Reply::ShutdownAck);
        assert!(exit_answer(answers).await);
        handle.await.unwrap().unwrap();
    }

    #[test]
    fn oversized_output_becomes_failure() {
        let id = RequestId::new(4).unwrap();
        let reply = to_reply(id, Ok(Ok(vec![0; MAX_PAYLOAD_LEN + 1])), false);
        assert_eq!(reply, Reply::Failure { id });
    }
}
