//! Worker-side view of its own lifecycle, handed to tasks via [`Task::attach`].
//!
//! A task may ask to exit early (for example after sitting idle). The
//! dispatch loop forwards the request to the controller only while nothing is
//! in flight; the answer comes back as end-of-submissions (granted) or a
//! denial frame. Any new submission also counts as a denial.
//!
//! [`Task::attach`]: super::Task::attach

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc as std_mpsc;
use std::time::Duration;

use tokio::sync::mpsc;

/// Reply slot for one exit request.
pub(crate) type ExitReply = std_mpsc::SyncSender<bool>;

struct State {
    in_flight: AtomicUsize,
    draining: AtomicBool,
    exit_tx: mpsc::UnboundedSender<ExitReply>,
    exit_query_timeout: Duration,
}

/// Cheap to clone; all clones observe the same worker.
#[derive(Clone)]
pub struct Lifecycle {
    state: Arc<State>,
}

impl Lifecycle {
    pub(crate) fn new(exit_query_timeout: Duration) -> (Self, mpsc::UnboundedReceiver<ExitReply>) {
        let (exit_tx, exit_rx) = mpsc::unbounded_channel();
        let lifecycle = Self {
            state: Arc::new(State {
                in_flight: AtomicUsize::new(0),
                draining: AtomicBool::new(false),
                exit_tx,
                exit_query_timeout,
            }),
        };
        (lifecycle, exit_rx)
    }

    /// Submissions received and not yet answered, including queued ones.
    pub fn in_flight(&self) -> usize {
        self.state.in_flight.load(Ordering::Acquire)
    }

    /// True once end-of-submissions arrived or the connection is gone.
    pub fn is_draining(&self) -> bool {
        self.state.draining.load(Ordering::Acquire)
    }

    /// Asks the controller whether this worker may exit now.
    ///
    /// Blocks the calling thread until the controller answers or the exit
    /// query timeout passes. Returns `true` only when the controller granted
    /// the exit; the worker then shuts down on its own. Never call this from
    /// an async task.
    pub fn request_exit(&self) -> bool {
        if self.is_draining() {
            return false;
        }
        let (reply_tx, reply_rx) = std_mpsc::sync_channel(1);
        if self.state.exit_tx.send(reply_tx).is_err() {
            return false;
        }
        match reply_rx.recv_timeout(self.state.exit_query_timeout) {
            Ok(granted) => granted,
            Err(_) => {
                tracing::debug!("Exit request not answered in time");
                false
            }
        }
    }

    pub(crate) fn begin(&self) -> InFlightGuard {
        self.state.in_flight.fetch_add(1, Ordering::AcqRel);
        InFlightGuard {
            state: Arc::clone(&self.state),
        }
    }

    pub(crate) fn set_draining(&self) {
        self.state.draining.store(true, Ordering::Release);
    }
}

impl std::fmt::Debug for Lifecycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lifecycle")
            .field("in_flight", &self.in_flight())
            .field("draining", &self.is_draining())
            .finish()
    }
}

/// Counts one submission as in flight until dropped.
pub(crate) struct InFlightGuard {
    state: Arc<State>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.state.in_flight.fetch_sub(1, Ordering::AcqRel);
    }
}
