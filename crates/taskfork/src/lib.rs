//! taskfork: run units of work in a child process over one loopback socket.
//!
//! The controller ([`ForkedExecutor`]) spawns a worker binary, reads the port
//! it prints on stdout, connects, and multiplexes submissions over that single
//! connection by request id. Every submission resolves exactly once: with the
//! worker's output, a remote failure, or a shutdown error.
//!
//! Worker binaries are built around [`worker::entry::main_with`] and a
//! [`worker::TaskRegistry`].

pub mod bridge;
pub mod call;
pub mod executor;
pub mod listener;
pub mod logging;
pub mod spec;
pub mod worker;

pub use tokio_util::bytes;

pub use bridge::protocol::RequestId;
pub use call::{CallError, CallResult, PendingCall, ShutdownReason};
pub use executor::{CloseError, CloseFailure, ForkedExecutor, LaunchError};
pub use listener::ListenerError;
pub use spec::{ExecutorSpec, OutputMode, WorkerOptions};
pub use worker::{Lifecycle, Task, TaskRegistry, WorkerError};
