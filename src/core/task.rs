//! Tasks and task handles

use crate::core::cancellation::{CancellationReason, CancellationToken};
use crate::core::codec::ConvertOutput;
use crate::core::error::PoolError;
use crate::core::options::ConvertOptions;
use crate::core::signal::OnceSignal;
use chrono::{DateTime, Utc};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use std::time::Duration;

/// What a task resolves to
pub type TaskOutcome = std::result::Result<ConvertOutput, PoolError>;

/// Per-pool submission number
///
/// Increases with submission order. Only meaningful for ordering and
/// debugging within one pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskId(pub(crate) u64);

impl TaskId {
    /// Raw value
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task-{}", self.0)
    }
}

/// Lifecycle state of a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskState {
    /// Waiting in the pool queue
    Queued,
    /// Assigned to an execution unit
    Running,
    /// Finished with an output
    Completed,
    /// Finished with an error
    Failed,
}

/// Pool-side hook used by [`TaskHandle::cancel`]
pub(crate) trait CancelHook: Send + Sync {
    fn cancel_task(&self, id: TaskId);
}

/// State shared between a task and all of its handles
pub(crate) struct TaskShared {
    id: TaskId,
    started: AtomicBool,
    outcome: OnceSignal<TaskOutcome>,
    token: CancellationToken,
    submitted_at: DateTime<Utc>,
}

impl TaskShared {
    pub(crate) fn new(id: TaskId, token: CancellationToken) -> Self {
        Self {
            id,
            started: AtomicBool::new(false),
            outcome: OnceSignal::new(),
            token,
            submitted_at: Utc::now(),
        }
    }

    pub(crate) fn id(&self) -> TaskId {
        self.id
    }

    pub(crate) fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub(crate) fn mark_running(&self) {
        self.started.store(true, Ordering::Release);
    }

    /// Publish the outcome; later calls lose
    pub(crate) fn resolve(&self, outcome: TaskOutcome) -> bool {
        self.outcome.set(outcome)
    }

    pub(crate) fn is_resolved(&self) -> bool {
        self.outcome.is_set()
    }

    fn state(&self) -> TaskState {
        match self.outcome.get() {
            Some(Ok(_)) => TaskState::Completed,
            Some(Err(_)) => TaskState::Failed,
            None if self.started.load(Ordering::Acquire) => TaskState::Running,
            None => TaskState::Queued,
        }
    }
}

/// One submitted conversion, owned by the pool until a unit finishes it
pub(crate) struct Task {
    pub(crate) input: Vec<u8>,
    pub(crate) options: ConvertOptions,
    pub(crate) timeout: Option<Duration>,
    pub(crate) shared: Arc<TaskShared>,
    /// Submitter's span, entered while the codec runs
    #[cfg(feature = "tracing")]
    pub(crate) span: ::tracing::Span,
}

impl Task {
    pub(crate) fn id(&self) -> TaskId {
        self.shared.id
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.shared.id)
            .field("input_bytes", &self.input.len())
            .field("options", &self.options)
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// Handle to a submitted conversion
///
/// Handles are cheap to clone; every clone observes the same outcome, and
/// waiting again after resolution returns that outcome again. A handle is
/// also a [`Future`], so async callers can `.await` it without blocking
/// their executor.
///
/// # Example
///
/// ```
/// use transcode_pool::prelude::*;
///
/// # fn main() -> Result<()> {
/// let codec = FnCodec::new(|input, options, _token| {
///     Ok(ConvertOutput::new(input.to_vec(), options.format))
/// });
/// let pool = TranscodePool::new(PoolConfig::new(1), codec)?;
///
/// let handle = pool.submit(vec![1, 2, 3], ConvertOptions::new(ImageFormat::Png))?;
/// let output = handle.wait()?;
/// assert_eq!(output.data(), &[1, 2, 3]);
///
/// // Waiting again yields the same outcome
/// assert_eq!(handle.wait()?.len(), 3);
/// # pool.close(CloseMode::Graceful)?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct TaskHandle {
    shared: Arc<TaskShared>,
    pool: Weak<dyn CancelHook>,
}

impl fmt::Debug for TaskHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskHandle")
            .field("id", &self.shared.id)
            .field("state", &self.state())
            .finish()
    }
}

impl TaskHandle {
    pub(crate) fn new(shared: Arc<TaskShared>, pool: Weak<dyn CancelHook>) -> Self {
        Self { shared, pool }
    }

    /// A handle with no pool behind it
    #[cfg(test)]
    pub(crate) fn detached(shared: Arc<TaskShared>) -> Self {
        let pool: Weak<dyn CancelHook> = Weak::<NoPool>::new();
        Self { shared, pool }
    }

    /// Submission number
    pub fn id(&self) -> TaskId {
        self.shared.id
    }

    /// Wall-clock submission time
    pub fn submitted_at(&self) -> DateTime<Utc> {
        self.shared.submitted_at
    }

    /// Current lifecycle state
    pub fn state(&self) -> TaskState {
        self.shared.state()
    }

    /// Whether the task has finished either way
    pub fn is_finished(&self) -> bool {
        self.shared.is_resolved()
    }

    /// Block the calling thread until the task finishes
    pub fn wait(&self) -> TaskOutcome {
        self.shared.outcome.wait()
    }

    /// Block for at most `timeout`; `None` if the task is still pending
    ///
    /// Giving up on the wait does not cancel the task.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<TaskOutcome> {
        self.shared.outcome.wait_timeout(timeout)
    }

    /// The outcome if the task has finished
    pub fn try_outcome(&self) -> Option<TaskOutcome> {
        self.shared.outcome.get()
    }

    /// The outcome as a future, for callers that prefer not to move the handle
    pub fn outcome(&self) -> impl Future<Output = TaskOutcome> {
        self.clone()
    }

    /// Request cancellation
    ///
    /// A queued task is removed from the queue and resolves as
    /// [`PoolError::Cancelled`] right away. A running task only has its
    /// token cancelled; the codec may notice and stop early, otherwise it
    /// runs to completion and the result is discarded in favour of
    /// `Cancelled`. Cancelling a finished task does nothing.
    pub fn cancel(&self) {
        if self.shared.is_resolved() {
            return;
        }
        self.shared.token.cancel_with_reason(CancellationReason::Manual);
        if let Some(pool) = self.pool.upgrade() {
            pool.cancel_task(self.shared.id);
        }
    }
}

impl Future for TaskHandle {
    type Output = TaskOutcome;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.shared.outcome.poll_get(cx)
    }
}

/// Placeholder hook for handles not attached to a pool
#[cfg(test)]
struct NoPool;

#[cfg(test)]
impl CancelHook for NoPool {
    fn cancel_task(&self, _id: TaskId) {}
}
