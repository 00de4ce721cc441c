//! jobforge: in-process job scheduler and task-graph runtime.
//!
//! # Overview
//!
//! Batch workloads hand the runtime a collection of [`Job`]s, each a
//! closure plus policy (category, priority, retry count, per-attempt
//! timeout) and optional lifecycle hooks. A [`WorkerPool`] spreads them
//! over per-worker deques with random-victim work stealing; a
//! [`JobExecutor`] drives each job's attempt loop with retry and timeout
//! semantics; a [`ProgressTracker`] accumulates per-category latency
//! metrics and serves them over a tiny HTTP endpoint; a [`TaskGraph`]
//! composes jobs as nodes of a dependency DAG whose ready set feeds the
//! same pool; an asynchronous [`Logger`] turns lifecycle events into
//! JSON-lines records on console and file.
//!
//! # Architecture
//!
//! ```text
//!  submitter ──► WorkerPool ──► WorkDeque[0..N] ◄──steal──► workers
//!                                   │
//!                                   ▼
//!                              JobExecutor ──hooks──► ProgressTracker ──► /metrics
//!                                   │
//!                                   └──records──► Logger ──► console + file
//!
//!  TaskGraph: DAG nodes ──ready set──► WorkerPool (same machinery)
//! ```
//!
//! # Module Organization
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`job`] | `Job`, `JobBuilder`, `JobStatus`, `JobResult`, lifecycle hooks |
//! | [`deque`] | Per-worker double-ended queue (owner bottom, thief top) |
//! | [`pool`] | Worker threads, random-victim stealing, shutdown protocol |
//! | [`executor`] | Attempt loop, timeout enforcement, callback emission |
//! | [`graph`] | Dependency DAG, cycle detection, topological release |
//! | [`progress`] | Concurrent counters, category metrics, exports, ETA |
//! | [`logger`] | Async dual-sink structured logging |
//! | [`rng`] | Deterministic RNG for victim selection |
//!
//! The HTTP scrape endpoint lives in a private `server` module and is
//! reached through [`ProgressTracker::start_server`].
//!
//! # Guarantees
//!
//! - **Per-worker ordering**: the owner pops LIFO; thieves steal FIFO.
//!   There is no ordering across workers.
//! - **Per-job callbacks**: `on_start` (at most once), any number of
//!   `on_attempt`/`on_error`, `on_timeout` at most once, then exactly one
//!   `on_complete` and one `on_result`.
//! - **Conservation**: with `wait_all` before `stop`, completions equal
//!   submissions.
//! - **Panic isolation**: a panicking task or hook never takes down its
//!   worker.
//!
//! # Example
//!
//! ```no_run
//! use jobforge::{Job, LogHandle, PoolConfig, WorkerPool};
//!
//! let pool = WorkerPool::new(PoolConfig::with_workers(4), LogHandle::null());
//! pool.submit(0, Job::builder("fetch-1", || Ok(()))
//!     .category("net")
//!     .retry_count(2)
//!     .timeout_ms(500)
//!     .build())
//!     .unwrap();
//! pool.wait_all();
//! pool.stop();
//! ```

pub mod deque;
pub mod executor;
pub mod graph;
pub mod job;
pub mod logger;
pub mod pool;
pub mod progress;
pub mod rng;

mod server;

// Core scheduling
pub use deque::WorkDeque;
pub use executor::JobExecutor;
pub use job::{Job, JobBuilder, JobResult, JobStatus, TaskError};
pub use pool::{PoolConfig, SubmitError, WorkerPool};

// Graph mode
pub use graph::{GraphError, NodeId, TaskGraph};

// Observability
pub use logger::{LogHandle, LogLevel, LogRecord, Logger};
pub use progress::{CategoryMetric, ProgressTracker, LATENCY_BUCKETS_MS};

// Supporting primitives
pub use rng::XorShift64;
