//! Frame types for controller-worker communication.
//!
//! One TCP connection carries both directions. Every frame starts with a
//! big-endian `i32` id:
//! - **id >= 0**: a submission (controller → worker) or its result (worker → controller)
//! - **id < 0**: a control signal from the reserved range below
//!
//! Request ids are never negative, so control signals cannot collide with them.

use std::fmt;

use tokio_util::bytes::Bytes;

/// Controller → worker: no more submissions, shut down.
/// Worker → controller: graceful shutdown acknowledged.
pub const END_OF_SUBMISSIONS: i32 = -1;

/// Worker → controller: may the worker exit while idle?
/// Controller → worker: the exit request was denied.
pub const SHUTDOWN_QUERY: i32 = -2;

/// Identifier correlating a submission with its result.
///
/// Only unique while the request is in flight. Always non-negative.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(i32);

impl RequestId {
    /// Returns `None` for negative values, which are reserved for control signals.
    pub fn new(raw: i32) -> Option<Self> {
        (raw >= 0).then_some(Self(raw))
    }

    /// Maps any counter value onto the non-negative id space (wraps at `i32::MAX`).
    pub fn from_counter(counter: i32) -> Self {
        Self(counter & i32::MAX)
    }

    pub fn get(self) -> i32 {
        self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Frames sent from controller to worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// `[id][len][payload]`
    Run { id: RequestId, payload: Bytes },

    /// `[-1]`
    EndOfSubmissions,

    /// `[-2]`, answer to a worker's shutdown query.
    DenyShutdown,
}

/// Frames sent from worker to controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// `[id][1][len][payload]`
    Success { id: RequestId, payload: Bytes },

    /// `[id][0]`
    Failure { id: RequestId },

    /// `[-1]`
    ShutdownAck,

    /// `[-2]`, advisory request to exit while idle.
    ShutdownQuery,
}

impl Reply {
    pub fn request_id(&self) -> Option<RequestId> {
        match self {
            Self::Success { id, .. } | Self::Failure { id } => Some(*id),
            Self::ShutdownAck | Self::ShutdownQuery => None,
        }
    }
}
