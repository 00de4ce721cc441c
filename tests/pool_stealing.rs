//! Pool-level behavior: stealing, conservation of jobs, liveness, shutdown.

use jobforge::{Job, LogHandle, PoolConfig, SubmitError, WorkerPool};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

fn pool(workers: usize) -> WorkerPool {
    WorkerPool::new(
        PoolConfig {
            workers,
            seed: 0xBEEF,
            park_timeout: Duration::from_millis(2),
        },
        LogHandle::null(),
    )
}

#[test]
fn jobs_funneled_to_one_worker_spread_to_the_other() {
    let pool = pool(2);
    let executed = Arc::new(AtomicUsize::new(0));

    for i in 0..5 {
        let e = Arc::clone(&executed);
        pool.submit(
            0,
            Job::new(format!("burst-{i}"), move || {
                thread::sleep(Duration::from_millis(10));
                e.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }),
        )
        .unwrap();
    }

    pool.wait_all();
    let counts = pool.executed_counts();
    assert_eq!(executed.load(Ordering::Relaxed), 5);
    assert_eq!(counts.iter().sum::<u64>(), 5);
    assert!(
        counts[1] > 0,
        "the idle worker must steal part of the burst: {counts:?}"
    );
    pool.stop();
}

#[test]
fn conservation_of_jobs() {
    // After wait_all + stop, on_complete events equal submissions.
    let pool = pool(4);
    let completions = Arc::new(AtomicUsize::new(0));

    let n = 200;
    for i in 0..n {
        let c = Arc::clone(&completions);
        let job = Job::builder(format!("c{i}"), move || {
            if i % 7 == 0 {
                Err("unlucky".into())
            } else {
                Ok(())
            }
        })
        .retry_count(1)
        .on_complete(move |_, _, _| {
            c.fetch_add(1, Ordering::Relaxed);
        })
        .build();
        pool.submit(i % 4, job).unwrap();
    }

    pool.wait_all();
    pool.stop();
    assert_eq!(completions.load(Ordering::Relaxed), n);
}

#[test]
fn steal_liveness_under_skewed_submission() {
    // All work lands on worker 0; every other worker is idle. No job may
    // starve: wait_all must return with everything executed.
    let pool = pool(4);
    let executed = Arc::new(AtomicUsize::new(0));

    let n = 300;
    for i in 0..n {
        let e = Arc::clone(&executed);
        pool.submit(
            0,
            Job::new(format!("skew-{i}"), move || {
                e.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }),
        )
        .unwrap();
    }

    pool.wait_all();
    assert_eq!(executed.load(Ordering::Relaxed), n);
    pool.stop();
}

#[test]
fn invalid_index_is_rejected_without_side_effects() {
    let pool = pool(2);
    let err = pool.submit(7, Job::new("nope", || Ok(()))).unwrap_err();
    assert_eq!(
        err,
        SubmitError::InvalidIndex {
            index: 7,
            workers: 2
        }
    );
    // Nothing was queued: wait_all returns immediately.
    pool.wait_all();
    pool.stop();
}

#[test]
fn results_arrive_on_worker_threads() {
    let pool = pool(2);
    let names = Arc::new(Mutex::new(Vec::new()));

    for i in 0..8 {
        let names = Arc::clone(&names);
        let job = Job::builder(format!("where-{i}"), || Ok(()))
            .on_result(move |_| {
                let name = thread::current().name().unwrap_or("").to_string();
                names.lock().unwrap().push(name);
            })
            .build();
        pool.submit_round_robin(job).unwrap();
    }

    pool.wait_all();
    pool.stop();

    let names = names.lock().unwrap();
    assert_eq!(names.len(), 8);
    for name in names.iter() {
        assert!(
            name.starts_with("jobforge-worker-"),
            "hooks run on worker threads, got {name:?}"
        );
    }
}

#[test]
fn stop_reports_work_submitted_before_it() {
    let pool = pool(2);
    let completions = Arc::new(AtomicUsize::new(0));

    for i in 0..40 {
        let c = Arc::clone(&completions);
        let job = Job::builder(format!("pre-stop-{i}"), move || {
            thread::sleep(Duration::from_millis(1));
            Ok(())
        })
        .on_complete(move |_, _, _| {
            c.fetch_add(1, Ordering::Relaxed);
        })
        .build();
        pool.submit_round_robin(job).unwrap();
    }

    // Drain-local shutdown: everything submitted before stop completes.
    pool.stop();
    assert_eq!(completions.load(Ordering::Relaxed), 40);
}
