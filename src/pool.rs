//! Work-stealing worker pool.
//!
//! # Architecture
//!
//! ```text
//!   submit(i, job) ────────┐
//!                          ▼
//!   ┌───────────┐    ┌───────────┐         ┌───────────┐
//!   │ Worker 0  │    │ Worker 1  │   ...   │ Worker N-1│
//!   │ deque 0   │◄──►│ deque 1   │◄───────►│ deque N-1 │
//!   └───────────┘    └───────────┘  steal  └───────────┘
//! ```
//!
//! Each worker owns one [`WorkDeque`] and pops its own bottom (LIFO). When
//! its deque is empty it sweeps the peers in a pseudo-random rotation and
//! steals from the first non-empty top (FIFO). When the sweep also fails it
//! parks for a short backoff, woken early by any submit.
//!
//! # Shutdown
//!
//! `stop()` lowers the run flag, unparks everyone, and joins. A worker exits
//! only when the run flag is low, its own deque is empty, and a full steal
//! sweep found nothing, so local work is drained before exit. Jobs still
//! sitting in a deque after all workers exited (submitted concurrently with
//! `stop`) are discarded by design; callers are expected to `wait_all`
//! before stopping.
//!
//! # Failure isolation
//!
//! A panicking job never takes its worker down. [`JobExecutor`] catches
//! panics inside the task; a defensive guard here catches anything that
//! still escapes (a panicking user hook), logs it, and keeps the worker
//! alive.

use crate::deque::WorkDeque;
use crate::executor::JobExecutor;
use crate::job::Job;
use crate::logger::{LogHandle, LogLevel};
use crate::rng::XorShift64;
use crossbeam_utils::sync::{Parker, Unparker};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Error returned by job submission.
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum SubmitError {
    /// The worker index is not in `[0, workers)`.
    #[error("worker index {index} out of range for pool of {workers}")]
    InvalidIndex {
        /// The offending index.
        index: usize,
        /// Pool size.
        workers: usize,
    },
    /// The pool has been stopped; no new work is accepted.
    #[error("worker pool is stopped")]
    Stopped,
}

/// Pool configuration.
#[derive(Clone, Copy, Debug)]
pub struct PoolConfig {
    /// Number of worker threads.
    pub workers: usize,
    /// Master seed for the per-worker victim-selection RNGs.
    pub seed: u64,
    /// Idle backoff; a parked worker re-checks at this interval even
    /// without a wakeup.
    pub park_timeout: Duration,
}

impl PoolConfig {
    /// Config with an explicit worker count and default knobs.
    pub fn with_workers(workers: usize) -> Self {
        Self {
            workers,
            ..Self::default()
        }
    }

    /// Validate configuration. Panics on invalid values.
    pub fn validate(&self) {
        assert!(self.workers > 0, "workers must be > 0");
        assert!(
            self.park_timeout > Duration::ZERO,
            "park_timeout must be > 0"
        );
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            workers: thread::available_parallelism().map(|n| n.get()).unwrap_or(1),
            seed: 0x853c49e6748fea9b,
            park_timeout: Duration::from_millis(10),
        }
    }
}

struct PoolShared {
    deques: Vec<WorkDeque<Job>>,
    run: AtomicBool,
    /// Jobs submitted and not yet terminal. Guards `wait_all`.
    in_flight: AtomicUsize,
    done_mutex: Mutex<()>,
    all_done: Condvar,
    unparkers: Vec<Unparker>,
    executed: Vec<AtomicU64>,
    next_rr: AtomicUsize,
    log: LogHandle,
}

impl PoolShared {
    fn job_finished(&self, worker_id: usize) {
        self.executed[worker_id].fetch_add(1, Ordering::Relaxed);
        if self.in_flight.fetch_sub(1, Ordering::AcqRel) == 1 {
            let _guard = self.done_mutex.lock().expect("done mutex poisoned");
            self.all_done.notify_all();
        }
    }

    fn discard_job(&self) {
        if self.in_flight.fetch_sub(1, Ordering::AcqRel) == 1 {
            let _guard = self.done_mutex.lock().expect("done mutex poisoned");
            self.all_done.notify_all();
        }
    }
}

/// N worker threads over N deques with random-victim stealing.
///
/// Dropping the pool performs a best-effort `stop()`.
pub struct WorkerPool {
    shared: Arc<PoolShared>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    /// Create the pool and start its workers.
    ///
    /// Workers start parked and wake on the first submit.
    ///
    /// # Panics
    ///
    /// Panics when the configuration is invalid or a worker thread cannot
    /// be spawned.
    pub fn new(cfg: PoolConfig, log: LogHandle) -> WorkerPool {
        cfg.validate();

        let deques = (0..cfg.workers).map(|_| WorkDeque::new()).collect();

        let mut parkers = Vec::with_capacity(cfg.workers);
        let mut unparkers = Vec::with_capacity(cfg.workers);
        for _ in 0..cfg.workers {
            let p = Parker::new();
            unparkers.push(p.unparker().clone());
            parkers.push(p);
        }

        let shared = Arc::new(PoolShared {
            deques,
            run: AtomicBool::new(true),
            in_flight: AtomicUsize::new(0),
            done_mutex: Mutex::new(()),
            all_done: Condvar::new(),
            unparkers,
            executed: (0..cfg.workers).map(|_| AtomicU64::new(0)).collect(),
            next_rr: AtomicUsize::new(0),
            log,
        });

        let mut threads = Vec::with_capacity(cfg.workers);
        for (worker_id, parker) in parkers.into_iter().enumerate() {
            let shared = Arc::clone(&shared);
            let rng_seed = cfg.seed ^ (worker_id as u64).wrapping_mul(0x9E3779B97F4A7C15);
            let th = thread::Builder::new()
                .name(format!("jobforge-worker-{worker_id}"))
                .spawn(move || {
                    worker_loop(worker_id, shared, parker, XorShift64::new(rng_seed), cfg)
                })
                .expect("failed to spawn worker thread");
            threads.push(th);
        }

        shared
            .log
            .log(LogLevel::Info, "pool", "started", 0, 0);

        WorkerPool {
            shared,
            threads: Mutex::new(threads),
        }
    }

    /// Number of workers.
    pub fn workers(&self) -> usize {
        self.shared.deques.len()
    }

    /// Push a job onto worker `index`'s deque.
    ///
    /// # Errors
    ///
    /// `InvalidIndex` when `index` is out of range, `Stopped` after
    /// `stop()`. The job is rejected in both cases.
    pub fn submit(&self, index: usize, job: Job) -> Result<(), SubmitError> {
        let workers = self.shared.deques.len();
        if index >= workers {
            return Err(SubmitError::InvalidIndex { index, workers });
        }
        if !self.shared.run.load(Ordering::Acquire) {
            return Err(SubmitError::Stopped);
        }
        debug_assert_eq!(
            job.status(),
            crate::job::JobStatus::Pending,
            "a job that left Pending must not be re-enqueued"
        );
        // Count before push so wait_all can never observe the job missing.
        self.shared.in_flight.fetch_add(1, Ordering::AcqRel);
        self.shared.deques[index].push_bottom(job);
        self.shared.unparkers[index].unpark();
        Ok(())
    }

    /// Push a job onto the next deque in rotation; returns the chosen
    /// worker index.
    ///
    /// # Errors
    ///
    /// `Stopped` after `stop()`.
    pub fn submit_round_robin(&self, job: Job) -> Result<usize, SubmitError> {
        let workers = self.shared.deques.len();
        let index = self.shared.next_rr.fetch_add(1, Ordering::Relaxed) % workers;
        self.submit(index, job)?;
        Ok(index)
    }

    /// Block until every submitted job has reached a terminal state.
    pub fn wait_all(&self) {
        let mut guard = self.shared.done_mutex.lock().expect("done mutex poisoned");
        while self.shared.in_flight.load(Ordering::Acquire) != 0 {
            guard = self
                .shared
                .all_done
                .wait(guard)
                .expect("done mutex poisoned");
        }
    }

    /// Per-worker executed-job counters, indexed by worker id.
    pub fn executed_counts(&self) -> Vec<u64> {
        self.shared
            .executed
            .iter()
            .map(|c| c.load(Ordering::Relaxed))
            .collect()
    }

    /// Lower the run flags, wake all workers, and join them.
    ///
    /// Each worker drains its own deque before exiting, so work submitted
    /// before the stop completes and is callback-reported. Jobs left in a
    /// deque after the workers exit were raced in against the shutdown and
    /// are discarded with a warning record. Idempotent; a second call is a
    /// no-op.
    pub fn stop(&self) {
        let threads: Vec<JoinHandle<()>> = {
            let mut guard = self.threads.lock().expect("threads mutex poisoned");
            std::mem::take(&mut *guard)
        };
        if threads.is_empty() {
            return;
        }
        self.shared.run.store(false, Ordering::Release);
        for u in &self.shared.unparkers {
            u.unpark();
        }
        for th in threads {
            let _ = th.join();
        }
        // Anything still queued lost the race against shutdown.
        for deque in &self.shared.deques {
            while let Some(job) = deque.pop_bottom() {
                self.shared.log.log(
                    LogLevel::Warn,
                    &format!("job:{}", job.id),
                    "discarded_on_stop",
                    0,
                    0,
                );
                self.shared.discard_job();
            }
        }
        self.shared.log.log(LogLevel::Info, "pool", "stopped", 0, 0);
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.stop();
    }
}

fn worker_loop(
    worker_id: usize,
    shared: Arc<PoolShared>,
    parker: Parker,
    mut rng: XorShift64,
    cfg: PoolConfig,
) {
    loop {
        if let Some(job) = shared.deques[worker_id].pop_bottom() {
            run_job(&shared, worker_id, job);
            continue;
        }
        if let Some(job) = steal_sweep(&shared, worker_id, &mut rng) {
            run_job(&shared, worker_id, job);
            continue;
        }
        // Run flag low + own deque empty + failed sweep: exit the loop.
        if !shared.run.load(Ordering::Acquire) {
            break;
        }
        parker.park_timeout(cfg.park_timeout);
    }

    // Drain local after stop. The acquire load above synchronizes with the
    // release store in stop(), so everything submitted before stop() is
    // visible here; peers' leftovers are their owners' to drain.
    while let Some(job) = shared.deques[worker_id].pop_bottom() {
        run_job(&shared, worker_id, job);
    }
}

/// One pseudo-random rotation over the peers, each tried at most once.
fn steal_sweep(shared: &PoolShared, me: usize, rng: &mut XorShift64) -> Option<Job> {
    let n = shared.deques.len();
    if n <= 1 {
        return None;
    }
    let offset = rng.next_usize(n);
    for k in 0..n {
        let victim = (offset + k) % n;
        if victim == me {
            continue;
        }
        if let Some(job) = shared.deques[victim].steal_top() {
            return Some(job);
        }
    }
    None
}

fn run_job(shared: &PoolShared, worker_id: usize, job: Job) {
    let id = job.id.clone();
    // The executor already isolates task panics; this guard covers panics
    // escaping user hooks so the worker itself survives.
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        JobExecutor::execute(job, &shared.log)
    }));
    if outcome.is_err() {
        shared.log.log(
            LogLevel::Error,
            &format!("job:{id}"),
            "hook_panicked",
            0,
            0,
        );
    }
    shared.job_finished(worker_id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn test_config(workers: usize) -> PoolConfig {
        PoolConfig {
            workers,
            seed: 12345,
            park_timeout: Duration::from_millis(1),
        }
    }

    #[test]
    fn submit_rejects_bad_index() {
        let pool = WorkerPool::new(test_config(2), LogHandle::null());
        let err = pool.submit(2, Job::new("x", || Ok(()))).unwrap_err();
        assert_eq!(
            err,
            SubmitError::InvalidIndex {
                index: 2,
                workers: 2
            }
        );
        pool.stop();
    }

    #[test]
    fn all_jobs_execute() {
        let pool = WorkerPool::new(test_config(4), LogHandle::null());
        let counter = Arc::new(AtomicUsize::new(0));

        let n = 500;
        for i in 0..n {
            let c = Arc::clone(&counter);
            pool.submit_round_robin(Job::new(format!("j{i}"), move || {
                c.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }))
            .unwrap();
        }

        pool.wait_all();
        assert_eq!(counter.load(Ordering::Relaxed), n);
        let executed: u64 = pool.executed_counts().iter().sum();
        assert_eq!(executed, n as u64);
        pool.stop();
    }

    #[test]
    fn jobs_spawned_to_one_worker_get_stolen() {
        let pool = WorkerPool::new(test_config(2), LogHandle::null());
        let counter = Arc::new(AtomicUsize::new(0));

        for i in 0..5 {
            let c = Arc::clone(&counter);
            pool.submit(
                0,
                Job::new(format!("steal{i}"), move || {
                    thread::sleep(Duration::from_millis(10));
                    c.fetch_add(1, Ordering::Relaxed);
                    Ok(())
                }),
            )
            .unwrap();
        }

        pool.wait_all();
        assert_eq!(counter.load(Ordering::Relaxed), 5);
        let counts = pool.executed_counts();
        assert_eq!(counts.iter().sum::<u64>(), 5);
        assert!(
            counts[1] > 0,
            "worker 1 should have stolen something: {counts:?}"
        );
        pool.stop();
    }

    #[test]
    fn panicking_hook_does_not_kill_worker() {
        let pool = WorkerPool::new(test_config(1), LogHandle::null());
        let counter = Arc::new(AtomicUsize::new(0));

        pool.submit(
            0,
            Job::builder("bad-hook", || Ok(()))
                .on_complete(|_, _, _| panic!("hook panic"))
                .build(),
        )
        .unwrap();

        let c = Arc::clone(&counter);
        pool.submit(
            0,
            Job::new("after", move || {
                c.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }),
        )
        .unwrap();

        pool.wait_all();
        assert_eq!(counter.load(Ordering::Relaxed), 1);
        pool.stop();
    }

    #[test]
    fn submit_after_stop_fails() {
        let pool = WorkerPool::new(test_config(2), LogHandle::null());
        pool.stop();
        let err = pool.submit(0, Job::new("late", || Ok(()))).unwrap_err();
        assert_eq!(err, SubmitError::Stopped);
    }

    #[test]
    fn wait_all_returns_immediately_when_idle() {
        let pool = WorkerPool::new(test_config(2), LogHandle::null());
        pool.wait_all();
        pool.stop();
    }

    #[test]
    fn stop_drains_local_work() {
        let pool = WorkerPool::new(test_config(2), LogHandle::null());
        let counter = Arc::new(AtomicUsize::new(0));
        for i in 0..50 {
            let c = Arc::clone(&counter);
            pool.submit_round_robin(Job::new(format!("d{i}"), move || {
                c.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }))
            .unwrap();
        }
        // No wait_all: stop itself must let workers drain what was queued.
        pool.stop();
        assert_eq!(counter.load(Ordering::Relaxed), 50);
    }
}
