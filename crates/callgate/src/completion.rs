//! Exactly-once completion for admitted calls.
//!
//! - [`Completion`] reports the outcome of an async call. Reporting consumes
//!   it, so a call cannot be finished twice. Dropping it unreported finishes
//!   the call as abandoned, which keeps a lost call from holding its slot.
//! - [`SyncCallGuard`] tracks a call executing on the submitter's own task and
//!   finishes it on drop (as canceled) unless finished explicitly.

use std::fmt;
use std::sync::Arc;

use crate::call::{Call, CallError, CallOutcome, CallTask};
use crate::dispatcher::DispatcherInner;

/// Completion token for a promoted call.
#[must_use = "dropping a Completion finishes the call as abandoned"]
pub struct Completion {
    call: Call,
    dispatcher: Option<Arc<DispatcherInner>>,
}

impl Completion {
    pub(crate) fn new(call: Call, dispatcher: Arc<DispatcherInner>) -> Self {
        Self {
            call,
            dispatcher: Some(dispatcher),
        }
    }

    pub fn call(&self) -> &Call {
        &self.call
    }

    pub fn succeeded(self) {
        self.report(Ok(()));
    }

    pub fn failed(self, error: CallError) {
        self.report(Err(error));
    }

    pub fn cancelled(self) {
        self.report(Err(CallError::Canceled));
    }

    pub fn report(mut self, result: Result<(), CallError>) {
        self.finish(CallOutcome::from(result));
    }

    fn finish(&mut self, outcome: CallOutcome) {
        if let Some(dispatcher) = self.dispatcher.take() {
            dispatcher.finished_async(&self.call, outcome);
        }
    }
}

impl Drop for Completion {
    fn drop(&mut self) {
        if self.dispatcher.is_some() {
            tracing::error!(
                call_id = %self.call.id(),
                host = %self.call.host(),
                "Completion dropped without reporting an outcome"
            );
            self.finish(CallOutcome::from(Err(CallError::Abandoned)));
        }
    }
}

impl fmt::Debug for Completion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Completion")
            .field("call", &self.call)
            .field("reported", &self.dispatcher.is_none())
            .finish()
    }
}

/// A call handed to an [`Executor`](crate::Executor).
pub struct AdmittedCall {
    task: CallTask,
    completion: Completion,
}

impl AdmittedCall {
    pub(crate) fn new(task: CallTask, completion: Completion) -> Self {
        Self { task, completion }
    }

    pub fn call(&self) -> &Call {
        self.completion.call()
    }

    /// Split into the caller's task and the completion token, for executors
    /// that drive the task themselves.
    pub fn into_parts(self) -> (CallTask, Completion) {
        (self.task, self.completion)
    }

    /// Run the task to completion and report its outcome.
    ///
    /// A call canceled before it started completes as canceled without
    /// running. Cancellation while running drops the task's future.
    pub async fn run(self) {
        let (task, completion) = self.into_parts();
        let token = completion.call().cancel_token();

        if token.is_cancelled() {
            tracing::debug!(call_id = %completion.call().id(), "Call canceled before start");
            completion.cancelled();
            return;
        }

        let result = tokio::select! {
            biased;
            _ = token.cancelled() => Err(CallError::Canceled),
            result = task(token.clone()) => result,
        };
        completion.report(result);
    }
}

impl fmt::Debug for AdmittedCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdmittedCall")
            .field("call", self.call())
            .finish_non_exhaustive()
    }
}

/// Guard for a call executing on the submitter's side.
pub struct SyncCallGuard {
    call: Call,
    dispatcher: Option<Arc<DispatcherInner>>,
}

impl SyncCallGuard {
    pub(crate) fn new(call: Call, dispatcher: Arc<DispatcherInner>) -> Self {
        Self {
            call,
            dispatcher: Some(dispatcher),
        }
    }

    pub fn call(&self) -> &Call {
        &self.call
    }

    pub fn finish(mut self, result: Result<(), CallError>) {
        self.finish_inner(CallOutcome::from(result));
    }

    fn finish_inner(&mut self, outcome: CallOutcome) {
        if let Some(dispatcher) = self.dispatcher.take() {
            dispatcher.finished_sync(&self.call, outcome);
        }
    }
}

impl Drop for SyncCallGuard {
    fn drop(&mut self) {
        if self.dispatcher.is_some() {
            self.call.cancel();
            self.finish_inner(CallOutcome::Canceled);
        }
    }
}

impl fmt::Debug for SyncCallGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncCallGuard")
            .field("call", &self.call)
            .finish()
    }
}
