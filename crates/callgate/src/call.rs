//! Call identity, status tracking and the caller-facing handle.

use std::fmt;
use std::future::Future;
use std::sync::{Arc, OnceLock};

use chrono::{DateTime, Utc};
use futures::FutureExt;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
pub use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CallId(uuid::Uuid);

impl CallId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &uuid::Uuid {
        &self.0
    }

    pub fn parse(s: &str) -> Result<Self, uuid::Error> {
        let uuid = uuid::Uuid::parse_str(s)?;
        Ok(Self(uuid))
    }
}

impl Default for CallId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Destination key used for per-host limiting.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Host(Arc<str>);

impl Host {
    pub fn new(host: impl AsRef<str>) -> Self {
        Self(Arc::from(host.as_ref()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for Host {
    fn from(host: &str) -> Self {
        Self::new(host)
    }
}

impl From<String> for Host {
    fn from(host: String) -> Self {
        Self(Arc::from(host))
    }
}

impl fmt::Display for Host {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
    Canceled,
}

impl CallStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Canceled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
        }
    }
}

/// Error reported by a call's task or by the substrate running it.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CallError {
    #[error("{0}")]
    Failed(String),
    #[error("Call canceled")]
    Canceled,
    /// The completion token was dropped without reporting an outcome.
    #[error("Call abandoned by executor")]
    Abandoned,
}

/// Final result of a call as seen by the submitter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallOutcome {
    Succeeded,
    Failed(String),
    Canceled,
}

impl CallOutcome {
    pub fn status(&self) -> CallStatus {
        match self {
            Self::Succeeded => CallStatus::Succeeded,
            Self::Failed(_) => CallStatus::Failed,
            Self::Canceled => CallStatus::Canceled,
        }
    }
}

impl From<Result<(), CallError>> for CallOutcome {
    fn from(result: Result<(), CallError>) -> Self {
        match result {
            Ok(()) => Self::Succeeded,
            Err(CallError::Canceled) => Self::Canceled,
            Err(e) => Self::Failed(e.to_string()),
        }
    }
}

/// Execution logic supplied by the submitter.
///
/// Receives the call's cancellation token; the returned future is what the
/// executor drives.
pub type CallTask =
    Box<dyn FnOnce(CancellationToken) -> BoxFuture<'static, Result<(), CallError>> + Send>;

/// A call waiting to be submitted.
pub struct CallRequest {
    pub(crate) host: Host,
    pub(crate) duplex: bool,
    pub(crate) task: CallTask,
}

impl CallRequest {
    pub fn new<F, Fut>(host: impl Into<Host>, task: F) -> Self
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), CallError>> + Send + 'static,
    {
        Self {
            host: host.into(),
            duplex: false,
            task: Box::new(move |token| task(token).boxed()),
        }
    }

    /// Mark the call as full-duplex (streaming). Duplex calls are exempt from
    /// the per-host limit but still count toward the global one.
    pub fn duplex(mut self, duplex: bool) -> Self {
        self.duplex = duplex;
        self
    }

    pub fn host(&self) -> &Host {
        &self.host
    }
}

impl fmt::Debug for CallRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallRequest")
            .field("host", &self.host)
            .field("duplex", &self.duplex)
            .finish_non_exhaustive()
    }
}

struct CallInner {
    id: CallId,
    host: Host,
    duplex: bool,
    cancel_token: CancellationToken,
    status: watch::Sender<CallStatus>,
    error: OnceLock<String>,
    submitted_at: DateTime<Utc>,
}

/// Handle to a submitted call for status queries, waiting and cancellation.
///
/// Cloning is cheap; all clones observe the same call.
#[derive(Clone)]
pub struct Call {
    inner: Arc<CallInner>,
}

impl Call {
    pub(crate) fn new(host: Host, duplex: bool, status: CallStatus) -> Self {
        let (status, _) = watch::channel(status);
        Self {
            inner: Arc::new(CallInner {
                id: CallId::new(),
                host,
                duplex,
                cancel_token: CancellationToken::new(),
                status,
                error: OnceLock::new(),
                submitted_at: Utc::now(),
            }),
        }
    }

    pub fn id(&self) -> CallId {
        self.inner.id
    }

    pub fn host(&self) -> &Host {
        &self.inner.host
    }

    pub fn is_duplex(&self) -> bool {
        self.inner.duplex
    }

    pub fn submitted_at(&self) -> DateTime<Utc> {
        self.inner.submitted_at
    }

    pub fn status(&self) -> CallStatus {
        *self.inner.status.borrow()
    }

    pub fn error(&self) -> Option<&str> {
        self.inner.error.get().map(String::as_str)
    }

    /// Request cancellation. The call leaves the dispatcher only once its
    /// executor reports the cancellation as a completion.
    pub fn cancel(&self) {
        self.inner.cancel_token.cancel();
    }

    pub fn is_canceled(&self) -> bool {
        self.inner.cancel_token.is_cancelled()
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.inner.cancel_token.clone()
    }

    /// Wait for the call to reach a terminal status.
    pub async fn wait(&self) -> CallOutcome {
        let mut rx = self.inner.status.subscribe();
        let status = match rx.wait_for(|s| s.is_terminal()).await {
            Ok(status) => *status,
            // The sender lives in `inner`, which we hold.
            Err(_) => self.status(),
        };
        self.outcome_for(status)
    }

    pub(crate) fn set_running(&self) {
        self.inner.status.send_if_modified(|s| {
            if *s == CallStatus::Queued {
                *s = CallStatus::Running;
                true
            } else {
                false
            }
        });
    }

    pub(crate) fn set_finished(&self, outcome: &CallOutcome) {
        if let CallOutcome::Failed(message) = outcome {
            // Only the first failure message is kept.
            let _ = self.inner.error.set(message.clone());
        }
        self.inner.status.send_replace(outcome.status());
    }

    fn outcome_for(&self, status: CallStatus) -> CallOutcome {
        match status {
            CallStatus::Succeeded => CallOutcome::Succeeded,
            CallStatus::Canceled => CallOutcome::Canceled,
            _ => CallOutcome::Failed(self.error().unwrap_or("Unknown error").to_string()),
        }
    }
}

impl PartialEq for Call {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl Eq for Call {}

impl fmt::Debug for Call {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Call")
            .field("id", &self.inner.id)
            .field("host", &self.inner.host)
            .field("duplex", &self.inner.duplex)
            .field("status", &self.status())
            .finish()
    }
}
