//! Pending calls and their failure modes.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio::sync::oneshot;
use tokio_util::bytes::Bytes;

use crate::bridge::protocol::RequestId;
use crate::listener::ListenerError;

pub type CallResult = Result<Bytes, CallError>;

/// Why the channel stopped accepting work.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ShutdownReason {
    /// Explicit close on the controller side.
    #[error("execution was interrupted")]
    Interrupted,

    /// The worker acknowledged end-of-submissions.
    #[error("worker acknowledged shutdown")]
    WorkerFinished,

    /// The worker asked to exit while idle and the controller agreed.
    #[error("worker exited while idle")]
    IdleExit,

    /// The connection failed while the channel was still open.
    #[error("listener failed: {0}")]
    Fault(ListenerError),
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum CallError {
    /// The unit of work failed inside the worker. Details are in the worker's log.
    #[error("remote execution failed")]
    RemoteFailed,

    /// Submitted after shutdown began.
    #[error("channel closed")]
    Closed,

    /// Still in flight when the channel shut down.
    #[error("channel shut down: {0}")]
    Shutdown(ShutdownReason),

    #[error("failed to send submission: {0}")]
    Send(Arc<io::Error>),

    /// The id counter wrapped onto a call that has not completed yet.
    #[error("request id {0} is still in flight")]
    IdInUse(RequestId),
}

/// Result cell for one submission.
///
/// Await it from async code, or call [`PendingCall::wait`] from a plain thread.
/// Always resolves: with the worker's output, a task failure, or a shutdown error.
#[derive(Debug)]
pub struct PendingCall {
    id: RequestId,
    rx: oneshot::Receiver<CallResult>,
}

impl PendingCall {
    pub(crate) fn channel(id: RequestId) -> (oneshot::Sender<CallResult>, Self) {
        let (tx, rx) = oneshot::channel();
        (tx, Self { id, rx })
    }

    pub(crate) fn failed(id: RequestId, error: CallError) -> Self {
        let (tx, call) = Self::channel(id);
        let _ = tx.send(Err(error));
        call
    }

    pub fn id(&self) -> RequestId {
        self.id
    }

    /// Blocks the current thread until the call resolves.
    ///
    /// Panics if called from inside an async runtime; `.await` the call there instead.
    pub fn wait(self) -> CallResult {
        self.rx.blocking_recv().unwrap_or(Err(CallError::Closed))
    }

    /// Non-blocking check. `None` while the call is still in flight.
    pub fn try_result(&mut self) -> Option<CallResult> {
        match self.rx.try_recv() {
            Ok(result) => Some(result),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => Some(Err(CallError::Closed)),
        }
    }
}

impl Future for PendingCall {
    type Output = CallResult;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|result| result.unwrap_or(Err(CallError::Closed)))
    }
}
