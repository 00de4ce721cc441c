//! Dependency-graph execution over the worker pool.
//!
//! A [`TaskGraph`] owns a [`WorkerPool`] and a set of named nodes, each a
//! run-once closure. Dependencies form a DAG; `execute()` verifies
//! acyclicity with a three-color DFS, then releases every node whose
//! dependency counter is zero into the pool. As nodes finish they decrement
//! their dependents' counters; a counter hitting zero releases that
//! dependent. `wait_all()` blocks until every node is done.
//!
//! # Node lifecycle
//!
//! ```text
//! Pending ──release──► Ready ──worker picks up──► Running ──► Done
//! ```
//!
//! A node is enqueued at most once, exactly when its `remaining` counter
//! transitions to zero; the `Pending -> Ready` CAS is the enqueue guard.
//!
//! # Failure semantics
//!
//! A node that fails (error or panic) still counts as done for the purpose
//! of unblocking its dependents; the error is recorded and surfaced via
//! [`TaskGraph::node_errors`]. Callers that need poison-on-failure can
//! check `node_errors()` between phases.

use crate::executor::panic_text;
use crate::job::{Job, TaskError};
use crate::logger::{LogHandle, LogLevel};
use crate::pool::{PoolConfig, WorkerPool};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};

/// Handle to a node within one [`TaskGraph`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct NodeId(usize);

/// Errors surfaced by graph construction and execution.
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum GraphError {
    /// The graph is already executing; no further mutation is allowed.
    #[error("graph is already executing")]
    InvalidState,
    /// The dependency relation contains a cycle; nothing was run.
    #[error("dependency cycle detected: {}", cycle.join(" -> "))]
    CycleDetected {
        /// A representative cycle, first node repeated at the end.
        cycle: Vec<String>,
    },
}

/// Run-once node body.
pub type NodeWork = Box<dyn FnOnce() -> Result<(), TaskError> + Send + 'static>;

const PENDING: u8 = 0;
const READY: u8 = 1;
const RUNNING: u8 = 2;
const DONE: u8 = 3;

/// Node description collected before execution.
struct BuildNode {
    name: String,
    work: Option<NodeWork>,
    deps: Vec<usize>,
}

/// Node state once the graph is executing.
struct RtNode {
    name: String,
    work: Mutex<Option<NodeWork>>,
    dependents: Vec<usize>,
    remaining: AtomicUsize,
    state: AtomicU8,
    error: Mutex<Option<String>>,
}

struct GraphRuntime {
    nodes: Vec<RtNode>,
    done_count: AtomicUsize,
    done_mutex: Mutex<()>,
    all_done: Condvar,
}

/// DAG of run-once nodes executed on an owned worker pool.
pub struct TaskGraph {
    pool: Arc<WorkerPool>,
    building: Vec<BuildNode>,
    runtime: Option<Arc<GraphRuntime>>,
    log: LogHandle,
}

impl TaskGraph {
    /// Create a graph with its own pool of `threads` workers and no logging.
    ///
    /// # Panics
    ///
    /// Panics when `threads` is 0.
    pub fn new(threads: usize) -> TaskGraph {
        Self::with_logger(threads, LogHandle::null())
    }

    /// Create a graph with its own pool of `threads` workers.
    ///
    /// # Panics
    ///
    /// Panics when `threads` is 0.
    pub fn with_logger(threads: usize, log: LogHandle) -> TaskGraph {
        let pool = WorkerPool::new(PoolConfig::with_workers(threads), log.clone());
        TaskGraph {
            pool: Arc::new(pool),
            building: Vec::new(),
            runtime: None,
            log,
        }
    }

    /// Number of nodes added so far.
    pub fn len(&self) -> usize {
        self.building.len()
    }

    /// Whether the graph has no nodes.
    pub fn is_empty(&self) -> bool {
        self.building.is_empty()
    }

    /// Add a node.
    ///
    /// # Errors
    ///
    /// `InvalidState` once `execute()` has been called.
    pub fn add_node<F>(&mut self, name: impl Into<String>, work: F) -> Result<NodeId, GraphError>
    where
        F: FnOnce() -> Result<(), TaskError> + Send + 'static,
    {
        if self.runtime.is_some() {
            return Err(GraphError::InvalidState);
        }
        let id = self.building.len();
        self.building.push(BuildNode {
            name: name.into(),
            work: Some(Box::new(work)),
            deps: Vec::new(),
        });
        Ok(NodeId(id))
    }

    /// Declare that `node` runs only after `on` is done.
    ///
    /// Duplicate edges are ignored.
    ///
    /// # Errors
    ///
    /// `InvalidState` once `execute()` has been called.
    ///
    /// # Panics
    ///
    /// Panics when either id does not belong to this graph.
    pub fn add_dependency(&mut self, node: NodeId, on: NodeId) -> Result<(), GraphError> {
        if self.runtime.is_some() {
            return Err(GraphError::InvalidState);
        }
        assert!(node.0 < self.building.len(), "unknown node id {node:?}");
        assert!(on.0 < self.building.len(), "unknown node id {on:?}");
        let deps = &mut self.building[node.0].deps;
        if !deps.contains(&on.0) {
            deps.push(on.0);
        }
        Ok(())
    }

    /// Check for cycles, then release all ready nodes into the pool.
    ///
    /// Returns as soon as the seed set is submitted; use [`wait_all`] to
    /// block for completion.
    ///
    /// # Errors
    ///
    /// `InvalidState` on a second call; `CycleDetected` when the dependency
    /// relation has a cycle, in which case no node runs.
    ///
    /// [`wait_all`]: TaskGraph::wait_all
    pub fn execute(&mut self) -> Result<(), GraphError> {
        if self.runtime.is_some() {
            return Err(GraphError::InvalidState);
        }
        if let Some(cycle) = self.find_cycle() {
            self.log
                .log(LogLevel::Error, "graph", "cycle_detected", 0, 0);
            return Err(GraphError::CycleDetected { cycle });
        }

        // Freeze the build list into runtime nodes.
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); self.building.len()];
        for (idx, node) in self.building.iter().enumerate() {
            for &dep in &node.deps {
                dependents[dep].push(idx);
            }
        }
        let nodes: Vec<RtNode> = self
            .building
            .iter_mut()
            .zip(dependents)
            .map(|(build, dependents)| RtNode {
                name: build.name.clone(),
                work: Mutex::new(build.work.take()),
                dependents,
                remaining: AtomicUsize::new(build.deps.len()),
                state: AtomicU8::new(PENDING),
                error: Mutex::new(None),
            })
            .collect();

        let runtime = Arc::new(GraphRuntime {
            nodes,
            done_count: AtomicUsize::new(0),
            done_mutex: Mutex::new(()),
            all_done: Condvar::new(),
        });
        self.runtime = Some(Arc::clone(&runtime));

        self.log.log(LogLevel::Info, "graph", "executing", 0, 0);

        for idx in 0..runtime.nodes.len() {
            if runtime.nodes[idx].remaining.load(Ordering::Acquire) == 0 {
                release_node(&runtime, &self.pool, idx);
            }
        }
        Ok(())
    }

    /// Block until every node is done. Returns immediately when `execute`
    /// has not been called.
    pub fn wait_all(&self) {
        let Some(rt) = &self.runtime else { return };
        let mut guard = rt.done_mutex.lock().expect("graph done mutex poisoned");
        while rt.done_count.load(Ordering::Acquire) < rt.nodes.len() {
            guard = rt.all_done.wait(guard).expect("graph done mutex poisoned");
        }
    }

    /// `(name, error)` for every node that failed. Empty before execution.
    pub fn node_errors(&self) -> Vec<(String, String)> {
        let Some(rt) = &self.runtime else {
            return Vec::new();
        };
        rt.nodes
            .iter()
            .filter_map(|n| {
                let err = n.error.lock().expect("node error mutex poisoned");
                err.as_ref().map(|e| (n.name.clone(), e.clone()))
            })
            .collect()
    }

    /// Stop the owned pool. Call after [`wait_all`]; also runs on drop.
    ///
    /// [`wait_all`]: TaskGraph::wait_all
    pub fn shutdown(&self) {
        self.pool.stop();
    }

    /// Three-color DFS over the dependency edges.
    ///
    /// Returns a representative cycle (first node repeated at the end) or
    /// `None` for a DAG.
    fn find_cycle(&self) -> Option<Vec<String>> {
        const WHITE: u8 = 0;
        const GRAY: u8 = 1;
        const BLACK: u8 = 2;

        let n = self.building.len();
        let mut color = vec![WHITE; n];

        for start in 0..n {
            if color[start] != WHITE {
                continue;
            }
            // Iterative DFS: (node, next dependency index) frames.
            let mut stack: Vec<(usize, usize)> = vec![(start, 0)];
            color[start] = GRAY;

            while let Some(frame) = stack.last_mut() {
                let (node, next) = *frame;
                if next < self.building[node].deps.len() {
                    frame.1 += 1;
                    let dep = self.building[node].deps[next];
                    match color[dep] {
                        WHITE => {
                            color[dep] = GRAY;
                            stack.push((dep, 0));
                        }
                        GRAY => {
                            // On-stack node reached again: the stack slice
                            // from its frame to the top is the cycle.
                            let pos = stack
                                .iter()
                                .position(|&(on_stack, _)| on_stack == dep)
                                .expect("gray node is on the stack");
                            let mut cycle: Vec<String> = stack[pos..]
                                .iter()
                                .map(|&(id, _)| self.building[id].name.clone())
                                .collect();
                            cycle.push(self.building[dep].name.clone());
                            return Some(cycle);
                        }
                        _ => {}
                    }
                } else {
                    color[node] = BLACK;
                    stack.pop();
                }
            }
        }
        None
    }
}

impl Drop for TaskGraph {
    fn drop(&mut self) {
        self.pool.stop();
    }
}

/// Move a node from `Pending` to `Ready` and hand it to the pool.
///
/// The CAS makes double-release impossible even if two finishing
/// dependencies race on the same dependent.
fn release_node(rt: &Arc<GraphRuntime>, pool: &Arc<WorkerPool>, idx: usize) {
    let node = &rt.nodes[idx];
    if node
        .state
        .compare_exchange(PENDING, READY, Ordering::AcqRel, Ordering::Acquire)
        .is_err()
    {
        return;
    }

    let rt = Arc::clone(rt);
    let pool_for_task = Arc::clone(pool);
    let job = Job::new(format!("node:{}", node.name), move || {
        run_node(&rt, &pool_for_task, idx)
    });
    // The pool only refuses when stopped, which means shutdown raced the
    // release; the node then never completes and wait_all callers are
    // expected to have returned already.
    let _ = pool.submit_round_robin(job);
}

/// Run one node body and perform its completion bookkeeping.
fn run_node(
    rt: &Arc<GraphRuntime>,
    pool: &Arc<WorkerPool>,
    idx: usize,
) -> Result<(), TaskError> {
    let node = &rt.nodes[idx];
    if node
        .state
        .compare_exchange(READY, RUNNING, Ordering::AcqRel, Ordering::Acquire)
        .is_err()
    {
        return Ok(());
    }

    let work = node.work.lock().expect("node work mutex poisoned").take();
    let result = match work {
        Some(work) => match panic::catch_unwind(AssertUnwindSafe(work)) {
            Ok(r) => r,
            Err(payload) => Err(TaskError::new(panic_text(payload.as_ref()))),
        },
        None => Ok(()),
    };
    if let Err(e) = &result {
        let mut err = node.error.lock().expect("node error mutex poisoned");
        *err = Some(e.message().to_string());
    }

    node.state.store(DONE, Ordering::Release);

    // Dependents are unblocked regardless of this node's outcome; the
    // error stays queryable via node_errors().
    for &dependent in &node.dependents {
        if rt.nodes[dependent].remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
            release_node(rt, pool, dependent);
        }
    }

    let finished = rt.done_count.fetch_add(1, Ordering::AcqRel) + 1;
    if finished == rt.nodes.len() {
        let _guard = rt.done_mutex.lock().expect("graph done mutex poisoned");
        rt.all_done.notify_all();
    }

    result
}
