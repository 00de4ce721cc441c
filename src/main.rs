//! Demo CLI: run a batch of simulated jobs through the pool, then a small
//! dependency graph, and export the run summary.
//!
//! ```text
//! jobforge [--threads N] [--jobs N] [--port P] [--log FILE] [--seed S]
//! ```
//!
//! `--port 0` disables the metrics endpoint. Exits 0 on a clean shutdown,
//! 1 when the run could not start, 2 on bad usage.

use chrono::Local;
use jobforge::{
    Job, LogHandle, LogLevel, Logger, PoolConfig, ProgressTracker, TaskGraph, WorkerPool,
    XorShift64,
};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use std::{env, fs};

struct Args {
    threads: usize,
    jobs: u64,
    port: u16,
    log_path: PathBuf,
    seed: u64,
}

impl Default for Args {
    fn default() -> Self {
        Args {
            threads: thread::available_parallelism().map(|n| n.get()).unwrap_or(2),
            jobs: 20,
            port: 8080,
            log_path: PathBuf::from(format!(
                "jobforge_{}.log",
                Local::now().format("%Y%m%d_%H%M%S")
            )),
            seed: 0xA076_1D64_78BD_642F,
        }
    }
}

fn usage() {
    eprintln!("usage: jobforge [--threads N] [--jobs N] [--port P] [--log FILE] [--seed S]");
    eprintln!("       --port 0 disables the metrics endpoint");
}

fn parse_args() -> Result<Args, String> {
    let mut args = Args::default();
    let mut iter = env::args().skip(1);
    while let Some(flag) = iter.next() {
        let mut value = |name: &str| {
            iter.next()
                .ok_or_else(|| format!("missing value for {name}"))
        };
        match flag.as_str() {
            "--threads" => {
                args.threads = value("--threads")?
                    .parse()
                    .map_err(|e| format!("--threads: {e}"))?;
                if args.threads == 0 {
                    return Err("--threads must be > 0".to_string());
                }
            }
            "--jobs" => {
                args.jobs = value("--jobs")?
                    .parse()
                    .map_err(|e| format!("--jobs: {e}"))?;
            }
            "--port" => {
                args.port = value("--port")?
                    .parse()
                    .map_err(|e| format!("--port: {e}"))?;
            }
            "--log" => args.log_path = PathBuf::from(value("--log")?),
            "--seed" => {
                args.seed = value("--seed")?
                    .parse()
                    .map_err(|e| format!("--seed: {e}"))?;
            }
            other => return Err(format!("unknown argument: {other}")),
        }
    }
    Ok(args)
}

fn main() -> ExitCode {
    let args = match parse_args() {
        Ok(args) => args,
        Err(msg) => {
            eprintln!("jobforge: {msg}");
            usage();
            return ExitCode::from(2);
        }
    };

    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("jobforge: {e}");
            ExitCode::FAILURE
        }
    }
}

fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    let logger = Logger::start(&args.log_path, true)?;
    let log = logger.handle();
    log.dual_safe_log("==== Job dispatcher started ====");

    let tracker = Arc::new(ProgressTracker::new(args.jobs, log.clone()));
    tracker.set_log_interval(5);
    tracker.set_highlight_latency(300);
    if args.port != 0 {
        tracker.start_server(args.port);
    }

    let pool = WorkerPool::new(
        PoolConfig {
            workers: args.threads,
            seed: args.seed,
            ..PoolConfig::default()
        },
        log.clone(),
    );

    // Simulated workload: jobs sleeping 50-400ms across three categories,
    // with a retry budget and a generous per-attempt deadline.
    let categories = ["io", "cpu", "net"];
    let mut rng = XorShift64::new(args.seed);
    for i in 0..args.jobs {
        let latency_ms = 50 + rng.next_usize(351) as u64;
        let category = categories[rng.next_usize(categories.len())];
        let tracker_hook = Arc::clone(&tracker);

        let job = Job::builder(format!("job-{i}"), move || {
            thread::sleep(Duration::from_millis(latency_ms));
            Ok(())
        })
        .category(category)
        .retry_count(3)
        .timeout_ms(2_000)
        .on_result(move |result| {
            let level = if result.success {
                LogLevel::Info
            } else {
                LogLevel::Error
            };
            tracker_hook.mark_done_category(&result.category, result.duration_ms, level);
        })
        .build();

        pool.submit_round_robin(job)?;
    }

    pool.wait_all();
    pool.stop();

    run_graph_demo(&log)?;

    tracker.finish();
    let summary = tracker.export_summary_json();
    fs::write("job_summary.json", serde_json::to_string_pretty(&summary)?)?;
    log.dual_safe_log("Summary exported to job_summary.json");

    logger.stop();
    Ok(())
}

/// A small extract -> transform x2 -> load pipeline on the graph executor.
fn run_graph_demo(log: &LogHandle) -> Result<(), Box<dyn std::error::Error>> {
    log.dual_safe_log("Running task-graph demo (extract -> transform -> load)");

    let mut graph = TaskGraph::with_logger(2, log.clone());
    let extract = graph.add_node("extract", || {
        thread::sleep(Duration::from_millis(30));
        Ok(())
    })?;
    let transform_a = graph.add_node("transform-a", || {
        thread::sleep(Duration::from_millis(50));
        Ok(())
    })?;
    let transform_b = graph.add_node("transform-b", || {
        thread::sleep(Duration::from_millis(50));
        Ok(())
    })?;
    let load = graph.add_node("load", || {
        thread::sleep(Duration::from_millis(20));
        Ok(())
    })?;
    graph.add_dependency(transform_a, extract)?;
    graph.add_dependency(transform_b, extract)?;
    graph.add_dependency(load, transform_a)?;
    graph.add_dependency(load, transform_b)?;

    graph.execute()?;
    graph.wait_all();

    for (node, error) in graph.node_errors() {
        log.dual_safe_log(&format!("graph node {node} failed: {error}"));
    }
    graph.shutdown();
    Ok(())
}
