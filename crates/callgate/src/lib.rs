//! callgate: admission control for asynchronous calls.
//!
//! A [`Dispatcher`] admits submitted calls under a global concurrency limit
//! and a per-host limit, hands admitted calls to an [`Executor`], and reports
//! when no call is running.

mod call;
mod completion;
mod config;
mod dispatcher;
mod error;
mod executor;
mod host;
mod queue;

pub use call::{
    Call, CallError, CallId, CallOutcome, CallRequest, CallStatus, CallTask, CancellationToken,
    Host,
};
pub use completion::{AdmittedCall, Completion, SyncCallGuard};
pub use config::{DEFAULT_MAX_REQUESTS, DEFAULT_MAX_REQUESTS_PER_HOST, DispatcherConfig};
pub use dispatcher::{Dispatcher, DispatcherSnapshot, HostLoad, IdleCallback};
pub use error::{DispatchError, Result};
pub use executor::{Executor, TokioExecutor};
pub use host::HostCounter;
