//! Dispatcher: the submitter-facing API over the admission queue.
//!
//! Every state change (submission, completion, limit change) is followed by a
//! promotion pass. Newly admitted calls are handed to the executor and the idle
//! callback is invoked only after the queue lock is released, so executors and
//! callbacks may call back into the dispatcher. Passes requested from inside a
//! running pass are folded into its loop, so the stack stays flat however
//! many calls an executor completes inline.

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::Serialize;

use crate::call::{Call, CallError, CallOutcome, CallRequest, Host};
use crate::completion::{AdmittedCall, Completion, SyncCallGuard};
use crate::config::DispatcherConfig;
use crate::error::Result;
use crate::executor::{Executor, TokioExecutor};
use crate::queue::AdmissionQueue;

/// Invoked each time the dispatcher goes from running calls to none.
pub type IdleCallback = Arc<dyn Fn() + Send + Sync>;

/// Per-host load in a [`DispatcherSnapshot`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct HostLoad {
    pub queued: usize,
    pub running: usize,
    /// Running duplex calls (not subject to the per-host limit).
    pub duplex: usize,
}

/// Point-in-time view of the dispatcher, taken under the queue lock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DispatcherSnapshot {
    pub max_requests: usize,
    pub max_requests_per_host: usize,
    pub queued: usize,
    pub running_async: usize,
    pub running_sync: usize,
    pub hosts: BTreeMap<String, HostLoad>,
}

impl DispatcherSnapshot {
    pub fn running(&self) -> usize {
        self.running_async + self.running_sync
    }

    pub fn is_idle(&self) -> bool {
        self.running() == 0
    }
}

pub(crate) struct DispatcherInner {
    queue: AdmissionQueue,
    executor: Arc<dyn Executor>,
    pass: Mutex<PassState>,
}

/// Serializes promotion passes. A pass requested while another is running
/// (from an inline completion, an executor or the idle callback) is folded
/// into the running pass's loop instead of recursing.
#[derive(Debug, Default)]
struct PassState {
    promoting: bool,
    pending: bool,
}

/// Releases the pass latch when the executor or idle callback unwinds.
struct PassGuard<'a> {
    inner: &'a DispatcherInner,
    armed: bool,
}

impl Drop for PassGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.inner.lock_pass().promoting = false;
        }
    }
}

impl DispatcherInner {
    fn lock_pass(&self) -> MutexGuard<'_, PassState> {
        self.pass.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Promote ready calls and hand them to the executor, repeating while
    /// passes were requested during hand-off.
    fn promote_and_execute(self: &Arc<Self>) {
        {
            let mut pass = self.lock_pass();
            pass.pending = true;
            if pass.promoting {
                return;
            }
            pass.promoting = true;
        }
        let mut guard = PassGuard {
            inner: self,
            armed: true,
        };

        loop {
            {
                let mut pass = self.lock_pass();
                if !pass.pending {
                    pass.promoting = false;
                    guard.armed = false;
                    return;
                }
                pass.pending = false;
            }

            let promotion = self.queue.promote();

            // Every admitted call owns its completion before any hand-off, so
            // a panicking executor abandons the rest instead of leaking slots.
            let admitted: Vec<AdmittedCall> = promotion
                .admitted
                .into_iter()
                .map(|(call, task)| {
                    AdmittedCall::new(task, Completion::new(call, Arc::clone(self)))
                })
                .collect();
            for call in admitted {
                self.executor.execute(call);
            }

            if let Some(idle) = promotion.idle {
                tracing::debug!("Dispatcher idle");
                idle();
            }
        }
    }

    pub(crate) fn finished_async(self: &Arc<Self>, call: &Call, outcome: CallOutcome) {
        self.queue.finish_async(call.id());
        call.set_finished(&outcome);
        self.promote_and_execute();
    }

    pub(crate) fn finished_sync(self: &Arc<Self>, call: &Call, outcome: CallOutcome) {
        self.queue.finish_sync(call.id());
        call.set_finished(&outcome);
        self.promote_and_execute();
    }
}

/// Admits calls under a global and a per-host concurrency limit.
///
/// Cloning yields another handle to the same dispatcher.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

impl Dispatcher {
    pub fn new(config: DispatcherConfig, executor: impl Executor) -> Result<Self> {
        Self::with_executor(config, Arc::new(executor))
    }

    pub fn with_executor(config: DispatcherConfig, executor: Arc<dyn Executor>) -> Result<Self> {
        config.validate()?;
        tracing::debug!(
            max_requests = config.max_requests,
            max_requests_per_host = config.max_requests_per_host,
            "Dispatcher created"
        );
        Ok(Self {
            inner: Arc::new(DispatcherInner {
                queue: AdmissionQueue::new(&config),
                executor,
                pass: Mutex::default(),
            }),
        })
    }

    /// Dispatcher running calls on the current tokio runtime.
    pub fn with_tokio(config: DispatcherConfig) -> Result<Self> {
        Self::new(config, TokioExecutor::current()?)
    }

    /// Queue a call; it starts as soon as both limits allow.
    pub fn submit(&self, request: CallRequest) -> Call {
        let call = self.inner.queue.enqueue_async(request);
        self.inner.promote_and_execute();
        call
    }

    /// Register a call the submitter is executing itself. It bypasses the
    /// ready queue and occupies a global slot until the guard is finished or
    /// dropped.
    pub fn submit_sync(&self, host: impl Into<Host>) -> SyncCallGuard {
        let call = self.inner.queue.enqueue_sync(host.into());
        SyncCallGuard::new(call, Arc::clone(&self.inner))
    }

    /// Run `future` inline as a sync call. Resolves to `CallError::Canceled`
    /// if the call is canceled first.
    pub async fn execute_sync<F, T>(
        &self,
        host: impl Into<Host>,
        future: F,
    ) -> std::result::Result<T, CallError>
    where
        F: Future<Output = std::result::Result<T, CallError>>,
    {
        let guard = self.submit_sync(host);
        let token = guard.call().cancel_token();

        let result = tokio::select! {
            biased;
            _ = token.cancelled() => Err(CallError::Canceled),
            result = future => result,
        };

        guard.finish(result.as_ref().map(|_| ()).map_err(Clone::clone));
        result
    }

    /// Request cancellation of every queued and running call. Calls leave the
    /// dispatcher through their normal completion path.
    pub fn cancel_all(&self) {
        let calls = self.inner.queue.all_calls();
        tracing::info!(calls = calls.len(), "Canceling all calls");
        for call in &calls {
            call.cancel();
        }
    }

    pub fn max_requests(&self) -> usize {
        self.inner.queue.max_requests()
    }

    /// Set the global limit. Running calls are never preempted when lowering it.
    pub fn set_max_requests(&self, max: usize) -> Result<()> {
        self.inner.queue.set_max_requests(max)?;
        self.inner.promote_and_execute();
        Ok(())
    }

    pub fn max_requests_per_host(&self) -> usize {
        self.inner.queue.max_requests_per_host()
    }

    /// Set the per-host limit. Running calls are never preempted when lowering it.
    pub fn set_max_requests_per_host(&self, max: usize) -> Result<()> {
        self.inner.queue.set_max_requests_per_host(max)?;
        self.inner.promote_and_execute();
        Ok(())
    }

    pub fn set_idle_callback(&self, callback: Option<IdleCallback>) {
        self.inner.queue.set_idle_callback(callback);
    }

    pub fn queued_calls(&self) -> Vec<Call> {
        self.inner.queue.queued_calls()
    }

    pub fn running_calls(&self) -> Vec<Call> {
        self.inner.queue.running_calls()
    }

    pub fn queued_count(&self) -> usize {
        self.inner.queue.queued_count()
    }

    pub fn running_count(&self) -> usize {
        self.inner.queue.running_count()
    }

    pub fn snapshot(&self) -> DispatcherSnapshot {
        self.inner.queue.snapshot()
    }
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("snapshot", &self.snapshot())
            .finish()
    }
}
