//! Job execution engine: attempt loop, timeout enforcement, callbacks.
//!
//! # Per-attempt protocol
//!
//! For up to `retry_count + 1` attempts (1-based numbering):
//!
//! 1. Fire `on_start` (first attempt only).
//! 2. Invoke the task. With `timeout_ms > 0` the invocation runs on a helper
//!    thread and the executor waits on its completion channel for at most
//!    `timeout_ms`; on expiry the attempt is a timeout and the helper thread
//!    is **abandoned**. With `timeout_ms == 0` the task runs inline.
//! 3. Outcome is success, failure(message), or timeout. A panic inside the
//!    task is a failure whose message is the panic payload text, or
//!    `"Unknown exception"` when the payload is not a string.
//! 4. Fire `on_attempt(attempt, success, elapsed_ms, error_msg)`; on failure
//!    with a non-empty message also fire `on_error`.
//! 5. Terminal rules:
//!    - success within the bound: `Success`, `on_complete(true, ..)`, done.
//!    - elapsed over the bound (whether the task succeeded, failed, or the
//!      wait expired): `Timeout`, `on_timeout` once, `on_complete(false, ..)`,
//!      done. Timeouts are not retried.
//!    - failure with attempts left: next attempt.
//!    - failure exhausted: `Failed`, `on_complete(false, total, cumulative)`.
//!
//! Exactly one `on_complete` and one `on_result` fire per job. Hooks run on
//! the executing worker thread and must not block indefinitely.
//!
//! # Timeout hazard
//!
//! The abandoned helper thread keeps running the task to completion in the
//! background. Tasks that can run indefinitely are responsible for their own
//! internal checkpoints; the engine offers no cooperative cancellation.

use crate::job::{Job, JobResult, JobStatus, TaskFn};
use crate::logger::{LogHandle, LogLevel};
use crossbeam_channel::{bounded, RecvTimeoutError};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant, SystemTime};

/// Message attached to failures whose cause produced no text.
const UNKNOWN_ERROR: &str = "Unknown exception";

/// Outcome of one task invocation, before deadline classification.
enum AttemptOutcome {
    Ok,
    Err(String),
    /// The wait on the helper thread expired; the thread was abandoned.
    WaitExpired,
}

/// Stateless execution engine. See the module docs for the protocol.
pub struct JobExecutor;

impl JobExecutor {
    /// Run one job to a terminal state and return its result.
    ///
    /// The returned result satisfies `1 <= attempts <= retry_count + 1` and
    /// `success == error_message.is_none()`.
    pub fn execute(job: Job, log: &LogHandle) -> JobResult {
        job.status.store(JobStatus::Running);

        let start_time = SystemTime::now();
        let overall = Instant::now();
        let max_attempts = job.retry_count + 1;
        let event = format!("job:{}", job.id);

        let mut attempts = 0;
        let mut final_success = false;
        let mut error_message: Option<String> = None;

        for attempt in 1..=max_attempts {
            attempts = attempt;
            let attempt_start = Instant::now();

            if attempt == 1 {
                if let Some(hook) = &job.on_start {
                    hook();
                }
            }

            let outcome = run_attempt(&job.task, job.timeout_ms);
            let elapsed = attempt_start.elapsed().as_millis() as u64;

            let (success, attempt_error) = match &outcome {
                AttemptOutcome::Ok => (true, String::new()),
                AttemptOutcome::Err(msg) => (false, msg.clone()),
                AttemptOutcome::WaitExpired => {
                    (false, format!("Timeout after {}ms", job.timeout_ms))
                }
            };

            if let Some(hook) = &job.on_attempt {
                hook(attempt, success, elapsed, &attempt_error);
            }
            if matches!(outcome, AttemptOutcome::Err(_)) && !attempt_error.is_empty() {
                if let Some(hook) = &job.on_error {
                    hook(&attempt_error);
                }
            }

            let over_deadline = job.timeout_ms > 0
                && (matches!(outcome, AttemptOutcome::WaitExpired) || elapsed > job.timeout_ms);

            if success && !over_deadline {
                job.status.store(JobStatus::Success);
                log.log(LogLevel::Info, &event, "success", elapsed, attempt);
                if let Some(hook) = &job.on_complete {
                    hook(true, attempt, elapsed);
                }
                final_success = true;
                break;
            }

            if over_deadline {
                // Terminal regardless of what the task returned; not retried.
                job.status.store(JobStatus::Timeout);
                log.log(LogLevel::Warn, &event, "timeout", elapsed, attempt);
                if let Some(hook) = &job.on_timeout {
                    hook();
                }
                if let Some(hook) = &job.on_complete {
                    hook(false, attempt, elapsed);
                }
                error_message = Some(format!("Timeout after {}ms", job.timeout_ms));
                break;
            }

            // Plain failure.
            let msg = if attempt_error.is_empty() {
                UNKNOWN_ERROR.to_string()
            } else {
                attempt_error
            };
            log.log(LogLevel::Error, &event, "failed", elapsed, attempt);
            error_message = Some(msg);

            if attempt == max_attempts {
                job.status.store(JobStatus::Failed);
                let cumulative = overall.elapsed().as_millis() as u64;
                if let Some(hook) = &job.on_complete {
                    hook(false, attempt, cumulative);
                }
                break;
            }
        }

        let result = JobResult {
            job_id: job.id.clone(),
            category: job.category.clone(),
            success: final_success,
            attempts,
            duration_ms: overall.elapsed().as_millis() as u64,
            error_message: if final_success { None } else { error_message },
            start_time,
            end_time: SystemTime::now(),
        };

        if let Some(hook) = &job.on_result {
            hook(&result);
        }

        result
    }
}

/// Invoke the task once, bounded by `timeout_ms` when non-zero.
fn run_attempt(task: &Arc<TaskFn>, timeout_ms: u64) -> AttemptOutcome {
    if timeout_ms == 0 {
        return invoke(task);
    }

    let (tx, rx) = bounded::<AttemptOutcome>(1);
    let task = Arc::clone(task);
    let spawned = thread::Builder::new()
        .name("jobforge-attempt".to_string())
        .spawn(move || {
            let _ = tx.send(invoke(&task));
        });
    if spawned.is_err() {
        return AttemptOutcome::Err("failed to spawn attempt thread".to_string());
    }

    match rx.recv_timeout(Duration::from_millis(timeout_ms)) {
        Ok(outcome) => outcome,
        // Helper keeps running detached; see the module docs.
        Err(RecvTimeoutError::Timeout) => AttemptOutcome::WaitExpired,
        Err(RecvTimeoutError::Disconnected) => AttemptOutcome::Err(UNKNOWN_ERROR.to_string()),
    }
}

/// Invoke the task inline, mapping panics to failures.
fn invoke(task: &Arc<TaskFn>) -> AttemptOutcome {
    match panic::catch_unwind(AssertUnwindSafe(|| (**task)())) {
        Ok(Ok(())) => AttemptOutcome::Ok,
        Ok(Err(e)) => {
            let msg = e.message().to_string();
            AttemptOutcome::Err(if msg.is_empty() {
                UNKNOWN_ERROR.to_string()
            } else {
                msg
            })
        }
        Err(payload) => AttemptOutcome::Err(panic_text(payload.as_ref())),
    }
}

pub(crate) fn panic_text(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        UNKNOWN_ERROR.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::TaskError;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    #[test]
    fn single_success_runs_once() {
        let job = Job::new("ok", || Ok(()));
        let res = JobExecutor::execute(job, &LogHandle::null());
        assert!(res.success);
        assert_eq!(res.attempts, 1);
        assert!(res.error_message.is_none());
    }

    #[test]
    fn status_reaches_success() {
        let job = Job::new("st", || Ok(()));
        // Status is observed through the result; the job moved into execute.
        let res = JobExecutor::execute(job, &LogHandle::null());
        assert!(res.success);
    }

    #[test]
    fn failure_exhausts_retries() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = Arc::clone(&calls);
        let job = Job::builder("f", move || {
            c.fetch_add(1, Ordering::Relaxed);
            Err(TaskError::new("nope"))
        })
        .retry_count(2)
        .build();

        let res = JobExecutor::execute(job, &LogHandle::null());
        assert!(!res.success);
        assert_eq!(res.attempts, 3);
        assert_eq!(calls.load(Ordering::Relaxed), 3);
        assert_eq!(res.error_message.as_deref(), Some("nope"));
    }

    #[test]
    fn retry_until_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = Arc::clone(&calls);
        let job = Job::builder("r", move || {
            if c.fetch_add(1, Ordering::Relaxed) < 2 {
                Err(TaskError::new("transient"))
            } else {
                Ok(())
            }
        })
        .retry_count(3)
        .build();

        let res = JobExecutor::execute(job, &LogHandle::null());
        assert!(res.success);
        assert_eq!(res.attempts, 3);
        assert!(res.error_message.is_none());
    }

    #[test]
    fn timeout_is_terminal_and_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = Arc::clone(&calls);
        let timeouts = Arc::new(AtomicU32::new(0));
        let t = Arc::clone(&timeouts);

        let job = Job::builder("slow", move || {
            c.fetch_add(1, Ordering::Relaxed);
            thread::sleep(Duration::from_millis(150));
            Ok(())
        })
        .timeout_ms(40)
        .retry_count(5)
        .on_timeout(move || {
            t.fetch_add(1, Ordering::Relaxed);
        })
        .build();

        let res = JobExecutor::execute(job, &LogHandle::null());
        assert!(!res.success);
        assert_eq!(res.attempts, 1, "timeout must not be retried");
        assert_eq!(timeouts.load(Ordering::Relaxed), 1);
        assert!(res.duration_ms >= 40);
        let msg = res.error_message.expect("timeout carries a message");
        assert!(msg.contains("Timeout after 40ms"), "got {msg}");
        // Exactly one invocation despite the generous retry budget.
        assert_eq!(calls.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn slow_success_is_classified_timeout() {
        // The task returns Ok but blows through its deadline: the wait
        // expires first and the attempt is a timeout.
        let job = Job::builder("slow-ok", || {
            thread::sleep(Duration::from_millis(120));
            Ok(())
        })
        .timeout_ms(30)
        .build();

        let res = JobExecutor::execute(job, &LogHandle::null());
        assert!(!res.success);
        assert!(res.error_message.is_some());
    }

    #[test]
    fn panic_becomes_failure_with_payload_text() {
        let job = Job::builder("p", || panic!("task exploded"))
            .retry_count(0)
            .build();
        let res = JobExecutor::execute(job, &LogHandle::null());
        assert!(!res.success);
        assert_eq!(res.error_message.as_deref(), Some("task exploded"));
    }

    #[test]
    fn callback_order_and_counts() {
        let events = Arc::new(Mutex::new(Vec::<String>::new()));

        let (e1, e2, e3, e4, e5) = (
            Arc::clone(&events),
            Arc::clone(&events),
            Arc::clone(&events),
            Arc::clone(&events),
            Arc::clone(&events),
        );
        let fail_first = Arc::new(AtomicU32::new(0));
        let ff = Arc::clone(&fail_first);

        let job = Job::builder("cb", move || {
            if ff.fetch_add(1, Ordering::Relaxed) == 0 {
                Err(TaskError::new("first fails"))
            } else {
                Ok(())
            }
        })
        .retry_count(1)
        .on_start(move || e1.lock().unwrap().push("start".into()))
        .on_attempt(move |a, ok, _, _| e2.lock().unwrap().push(format!("attempt{a}:{ok}")))
        .on_error(move |m| e3.lock().unwrap().push(format!("error:{m}")))
        .on_complete(move |ok, n, _| e4.lock().unwrap().push(format!("complete:{ok}:{n}")))
        .on_result(move |r| e5.lock().unwrap().push(format!("result:{}", r.success)))
        .build();

        let res = JobExecutor::execute(job, &LogHandle::null());
        assert!(res.success);

        let seq = events.lock().unwrap().clone();
        assert_eq!(
            seq,
            vec![
                "start",
                "attempt1:false",
                "error:first fails",
                "attempt2:true",
                "complete:true:2",
                "result:true",
            ]
        );
    }

    #[test]
    fn error_hook_not_fired_on_timeout() {
        let errors = Arc::new(AtomicU32::new(0));
        let e = Arc::clone(&errors);
        let job = Job::builder("t", || {
            thread::sleep(Duration::from_millis(100));
            Ok(())
        })
        .timeout_ms(25)
        .on_error(move |_| {
            e.fetch_add(1, Ordering::Relaxed);
        })
        .build();

        let _ = JobExecutor::execute(job, &LogHandle::null());
        assert_eq!(errors.load(Ordering::Relaxed), 0);
    }
}
