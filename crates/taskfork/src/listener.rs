//! Controller-side listener: owns the read half of the control socket.
//!
//! Flow:
//! 1. `Listener::start` spawns a dedicated reader thread
//! 2. Submitters register a pending call and write the frame under the writer lock
//! 3. The reader thread resolves pending calls as results arrive, in any order
//! 4. Shutdown (explicit, worker ack, idle exit or fault) runs exactly once:
//!    latch `closed`, fail every pending call, send end-of-submissions, close the socket
//!
//! Closing the socket is what unblocks the reader thread. Read errors after the
//! latch is set are the expected result of that and are not reported.

use std::io;
use std::net::{Shutdown, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use std::thread::{self, JoinHandle};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::oneshot;
use tokio_util::bytes::Bytes;

use crate::bridge::blocking::{FrameReader, FrameWriter};
use crate::bridge::codec::{CommandCodec, ReplyCodec};
use crate::bridge::protocol::{Command, Reply, RequestId};
use crate::call::{CallError, CallResult, PendingCall, ShutdownReason};

type CommandWriter = FrameWriter<TcpStream, CommandCodec>;

#[derive(Debug, Clone, thiserror::Error)]
pub enum ListenerError {
    #[error("connection to worker failed: {0}")]
    Connection(Arc<io::Error>),

    #[error("worker closed the connection unexpectedly")]
    Disconnected,

    #[error("failed to close control socket: {0}")]
    Close(Arc<io::Error>),

    #[error("listener thread panicked")]
    Panicked,
}

#[derive(Debug, Clone, Default)]
pub struct ListenerConfig {
    /// Grant a worker's idle-exit query when nothing is in flight.
    pub idle_exit: bool,
}

/// State shared between submitters, the reader thread and shutdown callers.
struct Shared {
    pending: DashMap<RequestId, oneshot::Sender<CallResult>>,
    closed: AtomicBool,
    writer: Mutex<CommandWriter>,
    /// Handle used only to shut the socket down; reads and writes go through other clones.
    socket: TcpStream,
    failures: Mutex<Vec<ListenerError>>,
    config: ListenerConfig,
}

impl Shared {
    fn lock_writer(&self) -> MutexGuard<'_, CommandWriter> {
        self.writer.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn record(&self, error: ListenerError) {
        self.failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(error);
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Sole guard against running shutdown twice.
    fn latch(&self) -> bool {
        self.closed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn submit(&self, id: RequestId, payload: Bytes) -> PendingCall {
        // The closed check and the insert happen under the writer lock, which
        // shutdown also holds while draining: a call either lands in the table
        // before the drain or sees `closed` and fails fast.
        let mut writer = self.lock_writer();
        if self.is_closed() {
            return PendingCall::failed(id, CallError::Closed);
        }

        let call = match self.pending.entry(id) {
            Entry::Occupied(_) => return PendingCall::failed(id, CallError::IdInUse(id)),
            Entry::Vacant(slot) => {
                let (tx, call) = PendingCall::channel(id);
                slot.insert(tx);
                call
            }
        };

        tracing::trace!(%id, payload_bytes = payload.len(), "Submitting");
        if let Err(e) = writer.send(Command::Run { id, payload }) {
            tracing::warn!(%id, error = %e, "Failed to write submission");
            if let Some((_, tx)) = self.pending.remove(&id) {
                let _ = tx.send(Err(CallError::Send(Arc::new(e))));
            }
        }
        call
    }

    fn shutdown(&self, reason: ShutdownReason) {
        if !self.latch() {
            return;
        }
        let mut writer = self.lock_writer();
        self.finish_shutdown(&mut writer, reason);
    }

    /// Runs after the latch was won, with the writer lock held.
    fn finish_shutdown(&self, writer: &mut CommandWriter, reason: ShutdownReason) {
        tracing::debug!(%reason, pending = self.pending.len(), "Shutting down listener");

        let ids: Vec<RequestId> = self.pending.iter().map(|entry| *entry.key()).collect();
        for id in ids {
            // The reader thread may have resolved it meanwhile; remove() decides who wins.
            if let Some((_, tx)) = self.pending.remove(&id) {
                let _ = tx.send(Err(CallError::Shutdown(reason.clone())));
            }
        }

        match writer.send(Command::EndOfSubmissions) {
            Ok(()) => tracing::debug!("Sent end-of-submissions"),
            Err(e) => tracing::debug!(error = %e, "Could not send end-of-submissions"),
        }

        if let Err(e) = self.socket.shutdown(Shutdown::Both)
            && e.kind() != io::ErrorKind::NotConnected
        {
            tracing::warn!(error = %e, "Failed to close control socket");
            self.record(ListenerError::Close(Arc::new(e)));
        }
    }

    fn complete(&self, id: RequestId, result: CallResult) {
        match self.pending.remove(&id) {
            Some((_, tx)) => {
                let _ = tx.send(result);
            }
            None => tracing::debug!(%id, "Result for unknown or already failed call"),
        }
    }

    fn answer_shutdown_query(&self) {
        let mut writer = self.lock_writer();
        if self.is_closed() {
            return;
        }
        if self.config.idle_exit && self.pending.is_empty() {
            tracing::info!("Worker idle, granting exit");
            if self.latch() {
                self.finish_shutdown(&mut writer, ShutdownReason::IdleExit);
            }
            return;
        }
        tracing::debug!(pending = self.pending.len(), "Denying worker exit request");
        if let Err(e) = writer.send(Command::DenyShutdown) {
            tracing::debug!(error = %e, "Could not deny worker exit request");
        }
    }

    fn read_loop(
        &self,
        reader: &mut FrameReader<TcpStream, ReplyCodec>,
    ) -> Result<(), ListenerError> {
        while !self.is_closed() {
            let frame = match reader.read_frame() {
                Ok(Some(frame)) => frame,
                Ok(None) if self.is_closed() => break,
                Ok(None) => return Err(ListenerError::Disconnected),
                Err(_) if self.is_closed() => break,
                Err(e) => return Err(ListenerError::Connection(Arc::new(e))),
            };
            match frame {
                Reply::ShutdownAck => {
                    tracing::debug!("Worker acknowledged shutdown");
                    self.shutdown(ShutdownReason::WorkerFinished);
                    break;
                }
                Reply::Success { id, payload } => {
                    tracing::trace!(%id, payload_bytes = payload.len(), "Result received");
                    self.complete(id, Ok(payload));
                }
                Reply::Failure { id } => {
                    tracing::debug!(%id, "Remote execution failed");
                    self.complete(id, Err(CallError::RemoteFailed));
                }
                Reply::ShutdownQuery => self.answer_shutdown_query(),
            }
        }
        Ok(())
    }
}

/// Reader thread plus the demultiplexing table for one worker connection.
pub struct Listener {
    shared: Arc<Shared>,
    thread: Mutex<Option<JoinHandle<Result<(), ListenerError>>>>,
    outcome: OnceLock<Vec<ListenerError>>,
}

impl Listener {
    pub fn start(stream: TcpStream, config: ListenerConfig) -> io::Result<Self> {
        let read_half = stream.try_clone()?;
        let write_half = stream.try_clone()?;

        let shared = Arc::new(Shared {
            pending: DashMap::new(),
            closed: AtomicBool::new(false),
            writer: Mutex::new(FrameWriter::new(write_half, CommandCodec)),
            socket: stream,
            failures: Mutex::new(Vec::new()),
            config,
        });

        let reader_shared = Arc::clone(&shared);
        let thread = thread::Builder::new()
            .name("taskfork-listener".to_string())
            .spawn(move || {
                let mut reader = FrameReader::new(read_half, ReplyCodec);
                let result = reader_shared.read_loop(&mut reader);
                if let Err(ref e) = result {
                    tracing::error!(error = %e, "Listener failed, shutting down channel");
                    reader_shared.shutdown(ShutdownReason::Fault(e.clone()));
                }
                tracing::debug!("Listener thread exiting");
                result
            })?;

        Ok(Self {
            shared,
            thread: Mutex::new(Some(thread)),
            outcome: OnceLock::new(),
        })
    }

    /// Registers `id` and writes the submission. Never blocks on the result.
    pub fn submit(&self, id: RequestId, payload: Bytes) -> PendingCall {
        self.shared.submit(id, payload)
    }

    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    pub fn in_flight(&self) -> usize {
        self.shared.pending.len()
    }

    /// Starts shutdown without waiting for the reader thread.
    pub fn shutdown(&self, reason: ShutdownReason) {
        self.shared.shutdown(reason);
    }

    /// Shuts down, joins the reader thread and reports every failure seen on
    /// the way. Concurrent and repeated callers all get the first outcome.
    pub fn ensure_shutdown(&self) -> Result<(), Vec<ListenerError>> {
        let failures = self.outcome.get_or_init(|| {
            self.shared.shutdown(ShutdownReason::Interrupted);

            let mut failures = Vec::new();
            let handle = self
                .thread
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take();
            if let Some(handle) = handle {
                match handle.join() {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => failures.push(e),
                    Err(_) => failures.push(ListenerError::Panicked),
                }
            }
            failures.extend(std::mem::take(
                &mut *self
                    .shared
                    .failures
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner),
            ));
            failures
        });

        if failures.is_empty() {
            Ok(())
        } else {
            Err(failures.clone())
        }
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        if let Err(failures) = self.ensure_shutdown() {
            for e in failures {
                tracing::warn!(error = %e, "Listener shutdown error");
            }
        }
    }
}
