//! Admission queue: ready and running collections plus the promotion pass.
//!
//! All membership changes happen under a single mutex. Promotion is two-phase:
//! [`AdmissionQueue::promote`] moves eligible ready calls to running and
//! returns them together with any pending idle notification; the caller hands
//! them to the executor after the lock is released.
//!
//! Invariants:
//! - A call lives in exactly one of ready-async, running-async, running-sync.
//! - A promotion pass never leaves more than `max_requests` calls running.
//! - A non-duplex call is only promoted while its host counter is below
//!   `max_requests_per_host`; a saturated host is skipped, not waited on.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::call::{Call, CallId, CallRequest, CallStatus, CallTask, Host};
use crate::config::DispatcherConfig;
use crate::dispatcher::{DispatcherSnapshot, HostLoad, IdleCallback};
use crate::error::{DispatchError, Result};
use crate::host::HostCounter;

struct ReadyCall {
    call: Call,
    counter: Arc<HostCounter>,
    task: CallTask,
}

struct RunningCall {
    call: Call,
    counter: Arc<HostCounter>,
}

struct QueueState {
    ready_async: VecDeque<ReadyCall>,
    running_async: VecDeque<RunningCall>,
    running_sync: VecDeque<Call>,
    max_requests: usize,
    max_requests_per_host: usize,
    idle_callback: Option<IdleCallback>,
    /// Set when a call is admitted, cleared when the idle callback is taken.
    busy: bool,
}

impl QueueState {
    fn running_count(&self) -> usize {
        self.running_async.len() + self.running_sync.len()
    }

    /// Shared counter of an existing non-duplex call to `host`, running calls first.
    fn find_counter(&self, host: &Host) -> Option<Arc<HostCounter>> {
        self.running_async
            .iter()
            .filter(|r| !r.call.is_duplex() && r.call.host() == host)
            .map(|r| &r.counter)
            .chain(
                self.ready_async
                    .iter()
                    .filter(|r| !r.call.is_duplex() && r.call.host() == host)
                    .map(|r| &r.counter),
            )
            .next()
            .cloned()
    }

    fn take_idle_callback(&mut self) -> Option<IdleCallback> {
        if self.running_count() > 0 || !self.busy {
            return None;
        }
        self.busy = false;
        self.idle_callback.clone()
    }
}

/// Result of a promotion pass, to be acted on outside the lock.
pub(crate) struct Promotion {
    pub admitted: Vec<(Call, CallTask)>,
    pub idle: Option<IdleCallback>,
}

pub(crate) struct AdmissionQueue {
    state: Mutex<QueueState>,
}

impl AdmissionQueue {
    pub fn new(config: &DispatcherConfig) -> Self {
        Self {
            state: Mutex::new(QueueState {
                ready_async: VecDeque::new(),
                running_async: VecDeque::new(),
                running_sync: VecDeque::new(),
                max_requests: config.max_requests,
                max_requests_per_host: config.max_requests_per_host,
                idle_callback: None,
                busy: false,
            }),
        }
    }

    /// Lock the state, recovering from poisoning.
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                tracing::error!("Dispatcher state mutex poisoned - recovering");
                poisoned.into_inner()
            }
        }
    }

    /// Append a call to the ready queue. Does not promote.
    pub fn enqueue_async(&self, request: CallRequest) -> Call {
        let CallRequest { host, duplex, task } = request;
        let call = Call::new(host, duplex, CallStatus::Queued);

        let mut state = self.lock();
        // Duplex calls keep a private counter.
        let shared = if duplex {
            None
        } else {
            state.find_counter(call.host())
        };
        let counter = shared.unwrap_or_default();

        tracing::debug!(
            call_id = %call.id(),
            host = %call.host(),
            duplex,
            host_running = counter.get(),
            "Call enqueued"
        );

        state.ready_async.push_back(ReadyCall {
            call: call.clone(),
            counter,
            task,
        });
        call
    }

    /// Register a call that is already executing on the submitter's side.
    pub fn enqueue_sync(&self, host: Host) -> Call {
        let call = Call::new(host, false, CallStatus::Running);
        let mut state = self.lock();
        state.running_sync.push_back(call.clone());
        state.busy = true;
        tracing::debug!(call_id = %call.id(), host = %call.host(), "Sync call started");
        call
    }

    /// Move every eligible ready call to running, in arrival order.
    pub fn promote(&self) -> Promotion {
        let mut state = self.lock();
        let mut admitted = Vec::new();

        let mut pending = std::mem::take(&mut state.ready_async);
        let mut skipped = Vec::new();
        while state.running_count() < state.max_requests {
            let Some(ready) = pending.pop_front() else {
                break;
            };
            if !ready.call.is_duplex() && ready.counter.get() >= state.max_requests_per_host {
                skipped.push(ready);
                continue;
            }

            let host_running = ready.counter.increment();
            ready.call.set_running();

            tracing::debug!(
                call_id = %ready.call.id(),
                host = %ready.call.host(),
                host_running,
                "Call promoted"
            );

            state.running_async.push_back(RunningCall {
                call: ready.call.clone(),
                counter: ready.counter,
            });
            admitted.push((ready.call, ready.task));
        }
        // Skipped calls go back ahead of the unscanned tail.
        for ready in skipped.into_iter().rev() {
            pending.push_front(ready);
        }
        state.ready_async = pending;

        if !admitted.is_empty() {
            state.busy = true;
        }

        Promotion {
            admitted,
            idle: state.take_idle_callback(),
        }
    }

    /// Remove a finished async call from the running set.
    ///
    /// # Panics
    ///
    /// If the call is not running. Each call completes exactly once; a second
    /// completion is a bug in the executor.
    pub fn finish_async(&self, id: CallId) {
        let mut state = self.lock();
        let position = state.running_async.iter().position(|r| r.call.id() == id);
        let Some(index) = position else {
            drop(state);
            tracing::error!(call_id = %id, "Async call finished but was not in flight");
            panic!("call {id} wasn't in flight");
        };
        if let Some(running) = state.running_async.remove(index) {
            let host_running = running.counter.decrement();
            tracing::debug!(
                call_id = %id,
                host = %running.call.host(),
                host_running,
                "Call finished"
            );
        }
    }

    /// Remove a finished sync call from the running set.
    ///
    /// # Panics
    ///
    /// If the call is not running.
    pub fn finish_sync(&self, id: CallId) {
        let mut state = self.lock();
        let position = state.running_sync.iter().position(|c| c.id() == id);
        let Some(index) = position else {
            drop(state);
            tracing::error!(call_id = %id, "Sync call finished but was not in flight");
            panic!("call {id} wasn't in flight");
        };
        state.running_sync.remove(index);
        tracing::debug!(call_id = %id, "Sync call finished");
    }

    pub fn set_max_requests(&self, max: usize) -> Result<()> {
        if max < 1 {
            return Err(DispatchError::InvalidLimit {
                name: "max_requests",
                value: max,
            });
        }
        self.lock().max_requests = max;
        tracing::info!(max_requests = max, "Global limit updated");
        Ok(())
    }

    pub fn set_max_requests_per_host(&self, max: usize) -> Result<()> {
        if max < 1 {
            return Err(DispatchError::InvalidLimit {
                name: "max_requests_per_host",
                value: max,
            });
        }
        self.lock().max_requests_per_host = max;
        tracing::info!(max_requests_per_host = max, "Per-host limit updated");
        Ok(())
    }

    pub fn max_requests(&self) -> usize {
        self.lock().max_requests
    }

    pub fn max_requests_per_host(&self) -> usize {
        self.lock().max_requests_per_host
    }

    pub fn set_idle_callback(&self, callback: Option<IdleCallback>) {
        self.lock().idle_callback = callback;
    }

    /// Every tracked call, ready first, then running async, then running sync.
    pub fn all_calls(&self) -> Vec<Call> {
        let state = self.lock();
        state
            .ready_async
            .iter()
            .map(|r| r.call.clone())
            .chain(state.running_async.iter().map(|r| r.call.clone()))
            .chain(state.running_sync.iter().cloned())
            .collect()
    }

    pub fn queued_calls(&self) -> Vec<Call> {
        self.lock()
            .ready_async
            .iter()
            .map(|r| r.call.clone())
            .collect()
    }

    pub fn running_calls(&self) -> Vec<Call> {
        let state = self.lock();
        state
            .running_sync
            .iter()
            .cloned()
            .chain(state.running_async.iter().map(|r| r.call.clone()))
            .collect()
    }

    pub fn queued_count(&self) -> usize {
        self.lock().ready_async.len()
    }

    pub fn running_count(&self) -> usize {
        self.lock().running_count()
    }

    pub fn snapshot(&self) -> DispatcherSnapshot {
        let state = self.lock();
        let mut hosts: BTreeMap<String, HostLoad> = BTreeMap::new();
        for ready in &state.ready_async {
            hosts
                .entry(ready.call.host().to_string())
                .or_default()
                .queued += 1;
        }
        for running in &state.running_async {
            let load = hosts.entry(running.call.host().to_string()).or_default();
            if running.call.is_duplex() {
                load.duplex += 1;
            } else {
                load.running += 1;
            }
        }

        DispatcherSnapshot {
            max_requests: state.max_requests,
            max_requests_per_host: state.max_requests_per_host,
            queued: state.ready_async.len(),
            running_async: state.running_async.len(),
            running_sync: state.running_sync.len(),
            hosts,
        }
    }
}
