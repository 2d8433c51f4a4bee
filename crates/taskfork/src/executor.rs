//! Controller facade: spawns the worker process and submits work to it.
//!
//! Launch sequence:
//! 1. Spawn `executable [launch_options..] task [task_args..]` with piped stdio
//! 2. Read the port line from the worker's stdout (bounded by the handshake timeout)
//! 3. Connect to `127.0.0.1:<port>` and start the [`Listener`]
//!
//! Remaining stdout lines and all stderr lines are forwarded per [`OutputMode`].

use std::io::{self, BufRead, BufReader, Write};
use std::net::{Ipv4Addr, TcpStream};
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tokio_util::bytes::Bytes;

use crate::bridge::protocol::RequestId;
use crate::call::{CallResult, PendingCall};
use crate::listener::{Listener, ListenerConfig, ListenerError};
use crate::spec::{ExecutorSpec, OutputMode, WORKER_OPTIONS_ENV};

/// Target for forwarded worker output in [`OutputMode::Tracing`].
pub const WORKER_LOG_TARGET: &str = "taskfork::worker";

#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    #[error("failed to encode worker options: {0}")]
    Options(#[from] serde_json::Error),

    #[error("failed to spawn {}: {source}", .executable.display())]
    Spawn {
        executable: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("{0} not captured")]
    MissingPipe(&'static str),

    #[error("failed to start output forwarder: {0}")]
    Forwarder(io::Error),

    #[error("worker did not report a port within {0:?}")]
    HandshakeTimeout(Duration),

    #[error("worker exited before reporting a port")]
    HandshakeClosed,

    #[error("failed to read handshake: {0}")]
    HandshakeRead(io::Error),

    #[error("invalid port line from worker: {0:?}")]
    InvalidPort(String),

    #[error("failed to connect to worker on port {port}: {source}")]
    Connect {
        port: u16,
        #[source]
        source: io::Error,
    },

    #[error("failed to start listener: {0}")]
    Listener(io::Error),
}

/// One step of [`ForkedExecutor::close`] that went wrong.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CloseFailure {
    #[error(transparent)]
    Listener(ListenerError),

    #[error("failed to terminate worker process: {0}")]
    Terminate(Arc<io::Error>),
}

/// Every failure seen while closing. Cleanup continues past each one.
#[derive(Debug, Clone, thiserror::Error)]
#[error("worker shutdown failed: {}", join_failures(.failures))]
pub struct CloseError {
    pub failures: Vec<CloseFailure>,
}

fn join_failures(failures: &[CloseFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Handle to a running worker process.
///
/// `submit_async` never blocks on the worker; `submit` waits for the result.
/// Dropping the executor closes it.
pub struct ForkedExecutor {
    listener: Listener,
    child: Mutex<Child>,
    pid: u32,
    next_id: AtomicI32,
    forwarders: Mutex<Vec<JoinHandle<()>>>,
    outcome: OnceLock<Result<(), CloseError>>,
}

impl std::fmt::Debug for ForkedExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ForkedExecutor")
            .field("pid", &self.pid)
            .field("closed", &self.listener.is_closed())
            .field("in_flight", &self.listener.in_flight())
            .finish()
    }
}

impl ForkedExecutor {
    /// Starts the worker and connects to it. On error the child is already
    /// killed and reaped.
    pub fn launch(spec: ExecutorSpec) -> Result<Self, LaunchError> {
        let options = spec.worker.to_env_value()?;

        tracing::info!(
            executable = %spec.executable.display(),
            task = %spec.task,
            "Spawning worker process"
        );
        let mut child = Command::new(&spec.executable)
            .args(&spec.launch_options)
            .arg(&spec.task)
            .args(&spec.task_args)
            .env(WORKER_OPTIONS_ENV, options)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| LaunchError::Spawn {
                executable: spec.executable.clone(),
                source,
            })?;
        let pid = child.id();

        match connect(&mut child, &spec) {
            Ok((listener, forwarders)) => {
                tracing::info!(pid, "Worker ready");
                Ok(Self {
                    listener,
                    child: Mutex::new(child),
                    pid,
                    next_id: AtomicI32::new(0),
                    forwarders: Mutex::new(forwarders),
                    outcome: OnceLock::new(),
                })
            }
            Err(e) => {
                tracing::error!(pid, error = %e, "Worker launch failed, killing process");
                let _ = child.kill();
                let _ = child.wait();
                Err(e)
            }
        }
    }

    /// Submits `input` and blocks until its result arrives.
    ///
    /// Must not be called from inside an async runtime; await
    /// [`submit_async`](Self::submit_async) there instead.
    pub fn submit(&self, input: impl Into<Bytes>) -> CallResult {
        self.submit_async(input).wait()
    }

    /// Submits `input` and returns immediately.
    pub fn submit_async(&self, input: impl Into<Bytes>) -> PendingCall {
        let id = RequestId::from_counter(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listener.submit(id, input.into())
    }

    pub fn worker_pid(&self) -> u32 {
        self.pid
    }

    /// True once shutdown has started, from either side.
    pub fn is_closed(&self) -> bool {
        self.listener.is_closed()
    }

    pub fn in_flight(&self) -> usize {
        self.listener.in_flight()
    }

    /// Shuts the channel down, then terminates and reaps the worker.
    ///
    /// Safe to call repeatedly and from several threads; every caller gets
    /// the outcome of the first close.
    pub fn close(&self) -> Result<(), CloseError> {
        self.outcome.get_or_init(|| self.close_once()).clone()
    }

    fn close_once(&self) -> Result<(), CloseError> {
        let mut failures = Vec::new();

        if let Err(errors) = self.listener.ensure_shutdown() {
            failures.extend(errors.into_iter().map(CloseFailure::Listener));
        }

        {
            let mut child = self.child.lock().unwrap_or_else(PoisonError::into_inner);
            if let Err(e) = terminate(&mut child) {
                tracing::warn!(pid = self.pid, error = %e, "Failed to terminate worker");
                failures.push(CloseFailure::Terminate(Arc::new(e)));
            }
        }

        let forwarders = std::mem::take(
            &mut *self.forwarders.lock().unwrap_or_else(PoisonError::into_inner),
        );
        for handle in forwarders {
            let _ = handle.join();
        }

        if failures.is_empty() {
            tracing::debug!(pid = self.pid, "Executor closed");
            Ok(())
        } else {
            Err(CloseError { failures })
        }
    }
}

impl Drop for ForkedExecutor {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            tracing::warn!(pid = self.pid, error = %e, "Executor close failed during drop");
        }
    }
}

/// Handshake and connect. Everything that can fail after spawn lives here so
/// `launch` has a single cleanup path.
fn connect(
    child: &mut Child,
    spec: &ExecutorSpec,
) -> Result<(Listener, Vec<JoinHandle<()>>), LaunchError> {
    let stdout = child
        .stdout
        .take()
        .ok_or(LaunchError::MissingPipe("stdout"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or(LaunchError::MissingPipe("stderr"))?;
    let pid = child.id();

    let output = resolve_output(spec.output);

    let (port_tx, port_rx) = mpsc::channel();
    let mut forwarders = Vec::with_capacity(2);
    forwarders.push(
        thread::Builder::new()
            .name("taskfork-stdout".to_string())
            .spawn(move || {
                let mut reader = BufReader::new(stdout);
                let mut first = Vec::new();
                match reader.read_until(b'\n', &mut first) {
                    Ok(0) => {}
                    Ok(_) => {
                        let _ = port_tx.send(Ok(String::from_utf8_lossy(&first).into_owned()));
                    }
                    Err(e) => {
                        let _ = port_tx.send(Err(e));
                    }
                }
                drop(port_tx);
                forward_output(reader, Stream::Stdout, output, pid);
            })
            .map_err(LaunchError::Forwarder)?,
    );
    forwarders.push(
        thread::Builder::new()
            .name("taskfork-stderr".to_string())
            .spawn(move || {
                forward_output(BufReader::new(stderr), Stream::Stderr, output, pid);
            })
            .map_err(LaunchError::Forwarder)?,
    );

    let line = match port_rx.recv_timeout(spec.handshake_timeout) {
        Ok(Ok(line)) => line,
        Ok(Err(e)) => return Err(LaunchError::HandshakeRead(e)),
        Err(RecvTimeoutError::Timeout) => {
            return Err(LaunchError::HandshakeTimeout(spec.handshake_timeout));
        }
        Err(RecvTimeoutError::Disconnected) => return Err(LaunchError::HandshakeClosed),
    };
    let port = parse_port(&line)?;
    tracing::debug!(pid, port, "Worker reported port");

    let stream = TcpStream::connect((Ipv4Addr::LOCALHOST, port))
        .map_err(|source| LaunchError::Connect { port, source })?;
    stream
        .set_nodelay(true)
        .map_err(|source| LaunchError::Connect { port, source })?;

    let listener = Listener::start(
        stream,
        ListenerConfig {
            idle_exit: spec.idle_exit,
        },
    )
    .map_err(LaunchError::Listener)?;
    Ok((listener, forwarders))
}

fn parse_port(line: &str) -> Result<u16, LaunchError> {
    line.trim()
        .parse::<u16>()
        .ok()
        .filter(|&port| port != 0)
        .ok_or_else(|| LaunchError::InvalidPort(line.to_string()))
}

#[derive(Debug, Clone, Copy)]
enum Stream {
    Stdout,
    Stderr,
}

/// Tracing output needs a subscriber; without one, worker lines would vanish.
fn resolve_output(requested: OutputMode) -> OutputMode {
    let has_subscriber = tracing::dispatcher::get_default(|dispatch| {
        !dispatch.is::<tracing::subscriber::NoSubscriber>()
    });
    effective_output(requested, has_subscriber)
}

fn effective_output(requested: OutputMode, has_subscriber: bool) -> OutputMode {
    match requested {
        OutputMode::Tracing if !has_subscriber => OutputMode::Passthrough,
        mode => mode,
    }
}

/// Calls `emit` for every `\n`-terminated line until EOF. Invalid UTF-8 is
/// replaced, not treated as the end of the stream.
fn for_each_line<R: BufRead>(mut reader: R, mut emit: impl FnMut(&str)) -> io::Result<()> {
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf) {
            Ok(0) => return Ok(()),
            Ok(_) => emit(String::from_utf8_lossy(&buf).trim_end_matches(['\n', '\r'])),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
}

fn forward_output<R: BufRead>(reader: R, stream: Stream, output: OutputMode, pid: u32) {
    let result = for_each_line(reader, |line| match (output, stream) {
        (OutputMode::Tracing, Stream::Stdout) => {
            tracing::info!(target: WORKER_LOG_TARGET, pid, stream = "stdout", "{line}");
        }
        (OutputMode::Tracing, Stream::Stderr) => {
            tracing::info!(target: WORKER_LOG_TARGET, pid, stream = "stderr", "{line}");
        }
        (OutputMode::Passthrough, Stream::Stdout) => {
            let _ = writeln!(io::stdout().lock(), "{line}");
        }
        (OutputMode::Passthrough, Stream::Stderr) => {
            let _ = writeln!(io::stderr().lock(), "{line}");
        }
    });
    match result {
        Ok(()) => tracing::trace!(pid, ?stream, "Worker output closed"),
        Err(e) => tracing::debug!(pid, ?stream, error = %e, "Reading worker output failed"),
    }
}

/// Asks the worker to stop and reaps it. A worker that already exited is fine.
fn terminate(child: &mut Child) -> io::Result<()> {
    if let Some(status) = child.try_wait()? {
        tracing::debug!(pid = child.id(), %status, "Worker already exited");
        return Ok(());
    }
    send_terminate(child)?;
    let status = child.wait()?;
    tracing::debug!(pid = child.id(), %status, "Worker exited");
    Ok(())
}

#[cfg(unix)]
fn send_terminate(child: &mut Child) -> io::Result<()> {
    use nix::errno::Errno;
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    let raw = i32::try_from(child.id())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "pid out of range"))?;
    match kill(Pid::from_raw(raw), Signal::SIGTERM) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[cfg(not(unix))]
fn send_terminate(child: &mut Child) -> io::Result<()> {
    match child.kill() {
        Err(e) if e.kind() != io::ErrorKind::InvalidInput => Err(e),
        _ => Ok(()),
    }
}
