//! Execution substrate for admitted calls.

use crate::completion::AdmittedCall;
use crate::error::{DispatchError, Result};

/// Runs admitted calls.
///
/// `execute` is called outside the dispatcher's lock and must not block: it
/// hands the call off and returns. The executor must eventually report exactly
/// one outcome through the call's completion token (see [`AdmittedCall::run`]).
pub trait Executor: Send + Sync + 'static {
    fn execute(&self, call: AdmittedCall);
}

impl<F> Executor for F
where
    F: Fn(AdmittedCall) + Send + Sync + 'static,
{
    fn execute(&self, call: AdmittedCall) {
        self(call)
    }
}

/// Spawns each admitted call as a task on a tokio runtime.
#[derive(Debug, Clone)]
pub struct TokioExecutor {
    handle: tokio::runtime::Handle,
}

impl TokioExecutor {
    pub fn new(handle: tokio::runtime::Handle) -> Self {
        Self { handle }
    }

    /// Executor bound to the runtime of the calling context.
    pub fn current() -> Result<Self> {
        tokio::runtime::Handle::try_current()
            .map(Self::new)
            .map_err(|_| DispatchError::NoRuntime)
    }
}

impl Executor for TokioExecutor {
    fn execute(&self, call: AdmittedCall) {
        self.handle.spawn(call.run());
    }
}
