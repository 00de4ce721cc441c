//! Job model: the unit of work plus its execution policy.
//!
//! A [`Job`] carries a re-invocable task closure and policy knobs (category,
//! priority, retry count, per-attempt timeout) together with optional
//! lifecycle hooks. The job value is exclusively owned along the whole path
//! submitter -> deque -> worker -> executor; it is never cloned and never
//! re-enqueued once its status has left `Pending`.
//!
//! The task itself is `Arc<dyn Fn>` rather than a `FnOnce`: retries invoke
//! it again, and the timeout path hands a clone to a helper thread that may
//! outlive the attempt (see [`crate::executor`]).
//!
//! # Status state machine
//!
//! ```text
//! Pending -> Running -> Success
//!                    -> Failed
//!                    -> Timeout
//! ```
//!
//! Transitions are strictly monotone; there is no resurrection. The cell is
//! release-stored so concurrent observers see the final state.

use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

/// Error surfaced by a task body.
///
/// Carries only a message; the executor folds it into
/// [`JobResult::error_message`] and the retry decision.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TaskError {
    message: String,
}

impl TaskError {
    /// Create a task error with the given message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    /// The error message.
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for TaskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for TaskError {}

impl From<&str> for TaskError {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for TaskError {
    fn from(s: String) -> Self {
        Self { message: s }
    }
}

/// The task closure type. Re-invocable because retries call it again.
pub type TaskFn = dyn Fn() -> Result<(), TaskError> + Send + Sync;

/// Lifecycle status of a job.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[repr(u8)]
pub enum JobStatus {
    /// Created, not yet picked up by a worker.
    Pending = 0,
    /// Attempt loop in progress.
    Running = 1,
    /// Terminal: an attempt succeeded within its bound.
    Success = 2,
    /// Terminal: all attempts failed.
    Failed = 3,
    /// Terminal: an attempt exceeded its per-attempt deadline.
    Timeout = 4,
}

impl JobStatus {
    /// Whether this is one of the three terminal states.
    #[inline]
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Success | JobStatus::Failed | JobStatus::Timeout)
    }

    fn from_u8(v: u8) -> JobStatus {
        match v {
            0 => JobStatus::Pending,
            1 => JobStatus::Running,
            2 => JobStatus::Success,
            3 => JobStatus::Failed,
            _ => JobStatus::Timeout,
        }
    }
}

/// Atomically-updated status cell.
///
/// Stores are release, loads acquire, so a thread that observes a terminal
/// status also observes the writes that produced it.
#[derive(Debug)]
pub(crate) struct StatusCell(AtomicU8);

impl StatusCell {
    fn new() -> Self {
        Self(AtomicU8::new(JobStatus::Pending as u8))
    }

    #[inline]
    pub(crate) fn load(&self) -> JobStatus {
        JobStatus::from_u8(self.0.load(Ordering::Acquire))
    }

    /// Advance the state machine. Transitions are monotone by contract;
    /// the executor is the only writer.
    #[inline]
    pub(crate) fn store(&self, next: JobStatus) {
        debug_assert!(
            !self.load().is_terminal(),
            "job status must not leave a terminal state"
        );
        self.0.store(next as u8, Ordering::Release);
    }
}

/// Hook fired once before the first attempt.
pub type StartHook = Box<dyn Fn() + Send + Sync>;
/// Hook fired after every attempt: `(attempt, success, elapsed_ms, error_msg)`.
/// `attempt` is 1-based; `error_msg` is empty on success.
pub type AttemptHook = Box<dyn Fn(u32, bool, u64, &str) + Send + Sync>;
/// Hook fired after a failed attempt with a non-empty message.
pub type ErrorHook = Box<dyn Fn(&str) + Send + Sync>;
/// Hook fired exactly once when a job times out.
pub type TimeoutHook = Box<dyn Fn() + Send + Sync>;
/// Hook fired exactly once at the terminal point:
/// `(success, total_attempts, elapsed_ms)`.
pub type CompleteHook = Box<dyn Fn(bool, u32, u64) + Send + Sync>;
/// Hook fired exactly once with the finished [`JobResult`].
pub type ResultHook = Box<dyn Fn(&JobResult) + Send + Sync>;

/// The unit of work.
///
/// Construct via [`Job::new`] for the bare closure form or [`Job::builder`]
/// for policy and hooks. `priority` is recorded and reported but not honored
/// by the deque disciplines.
pub struct Job {
    /// Caller-supplied identifier. Uniqueness is not enforced.
    pub id: String,
    /// Grouping key for per-category metrics.
    pub category: String,
    /// Recorded only; scheduling does not honor it.
    pub priority: i32,
    /// Number of retries after the first attempt. 0 means a single attempt.
    pub retry_count: u32,
    /// Per-attempt deadline in milliseconds. 0 disables the bound.
    pub timeout_ms: u64,

    pub(crate) task: Arc<TaskFn>,
    pub(crate) status: StatusCell,

    pub(crate) on_start: Option<StartHook>,
    pub(crate) on_attempt: Option<AttemptHook>,
    pub(crate) on_error: Option<ErrorHook>,
    pub(crate) on_timeout: Option<TimeoutHook>,
    pub(crate) on_complete: Option<CompleteHook>,
    pub(crate) on_result: Option<ResultHook>,
}

impl Job {
    /// Create a job with default policy (one attempt, no timeout, category
    /// `"default"`).
    pub fn new<F>(id: impl Into<String>, task: F) -> Job
    where
        F: Fn() -> Result<(), TaskError> + Send + Sync + 'static,
    {
        Job::builder(id, task).build()
    }

    /// Start building a job with explicit policy and hooks.
    pub fn builder<F>(id: impl Into<String>, task: F) -> JobBuilder
    where
        F: Fn() -> Result<(), TaskError> + Send + Sync + 'static,
    {
        JobBuilder::new(id.into(), Arc::new(task))
    }

    /// Current status. Acquire load.
    #[inline]
    pub fn status(&self) -> JobStatus {
        self.status.load()
    }
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("id", &self.id)
            .field("category", &self.category)
            .field("priority", &self.priority)
            .field("retry_count", &self.retry_count)
            .field("timeout_ms", &self.timeout_ms)
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

/// Builder for [`Job`].
#[must_use = "call build() to obtain the Job"]
pub struct JobBuilder {
    id: String,
    task: Arc<TaskFn>,
    category: String,
    priority: i32,
    retry_count: u32,
    timeout_ms: u64,
    on_start: Option<StartHook>,
    on_attempt: Option<AttemptHook>,
    on_error: Option<ErrorHook>,
    on_timeout: Option<TimeoutHook>,
    on_complete: Option<CompleteHook>,
    on_result: Option<ResultHook>,
}

impl JobBuilder {
    fn new(id: String, task: Arc<TaskFn>) -> Self {
        assert!(!id.is_empty(), "job id must be non-empty");
        Self {
            id,
            task,
            category: "default".to_string(),
            priority: 0,
            retry_count: 0,
            timeout_ms: 0,
            on_start: None,
            on_attempt: None,
            on_error: None,
            on_timeout: None,
            on_complete: None,
            on_result: None,
        }
    }

    /// Metrics grouping key. Defaults to `"default"`.
    pub fn category(mut self, category: impl Into<String>) -> Self {
        self.category = category.into();
        self
    }

    /// Recorded priority. Not honored by scheduling.
    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Retries after the first attempt. 0 means a single attempt.
    pub fn retry_count(mut self, retries: u32) -> Self {
        self.retry_count = retries;
        self
    }

    /// Per-attempt deadline in milliseconds. 0 disables the bound.
    pub fn timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    /// Fired once before the first attempt.
    pub fn on_start<F: Fn() + Send + Sync + 'static>(mut self, f: F) -> Self {
        self.on_start = Some(Box::new(f));
        self
    }

    /// Fired after every attempt.
    pub fn on_attempt<F: Fn(u32, bool, u64, &str) + Send + Sync + 'static>(mut self, f: F) -> Self {
        self.on_attempt = Some(Box::new(f));
        self
    }

    /// Fired after a failed attempt with a non-empty message.
    pub fn on_error<F: Fn(&str) + Send + Sync + 'static>(mut self, f: F) -> Self {
        self.on_error = Some(Box::new(f));
        self
    }

    /// Fired exactly once when the job times out.
    pub fn on_timeout<F: Fn() + Send + Sync + 'static>(mut self, f: F) -> Self {
        self.on_timeout = Some(Box::new(f));
        self
    }

    /// Fired exactly once at the terminal point.
    pub fn on_complete<F: Fn(bool, u32, u64) + Send + Sync + 'static>(mut self, f: F) -> Self {
        self.on_complete = Some(Box::new(f));
        self
    }

    /// Fired exactly once with the finished result.
    pub fn on_result<F: Fn(&JobResult) + Send + Sync + 'static>(mut self, f: F) -> Self {
        self.on_result = Some(Box::new(f));
        self
    }

    /// Finish the build.
    pub fn build(self) -> Job {
        Job {
            id: self.id,
            category: self.category,
            priority: self.priority,
            retry_count: self.retry_count,
            timeout_ms: self.timeout_ms,
            task: self.task,
            status: StatusCell::new(),
            on_start: self.on_start,
            on_attempt: self.on_attempt,
            on_error: self.on_error,
            on_timeout: self.on_timeout,
            on_complete: self.on_complete,
            on_result: self.on_result,
        }
    }
}

/// Value record emitted exactly once per terminal job.
///
/// Invariants: `attempts >= 1`, `attempts <= retry_count + 1`,
/// `success == true` iff `error_message.is_none()`.
#[derive(Clone, Debug, Serialize)]
pub struct JobResult {
    /// The job's caller-supplied id.
    pub job_id: String,
    /// The job's category.
    pub category: String,
    /// Whether the job reached `Success`.
    pub success: bool,
    /// Attempts actually made, 1-based.
    pub attempts: u32,
    /// Wall time from first attempt start to terminal point, in ms.
    pub duration_ms: u64,
    /// Failure or timeout message; `None` exactly when `success`.
    pub error_message: Option<String>,
    /// Wall-clock instant the executor picked the job up.
    pub start_time: SystemTime,
    /// Wall-clock instant the terminal state was reached.
    pub end_time: SystemTime,
}

impl JobResult {
    /// JSON object form, used by result hooks that forward to files or
    /// notification scripts.
    pub fn to_json(&self) -> serde_json::Value {
        let mut obj = serde_json::json!({
            "jobId": self.job_id,
            "category": self.category,
            "success": self.success,
            "attempts": self.attempts,
            "durationMs": self.duration_ms,
        });
        if let Some(err) = &self.error_message {
            obj["error"] = serde_json::Value::String(err.clone());
        }
        obj
    }
}
