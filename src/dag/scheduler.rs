//! Parallel execution of a dependency graph under a resource budget.
//!
//! The loop works as follows:
//! 1. Every task starts `Pending`, with a count of producers not yet done.
//! 2. When that count hits zero the task is evaluated: fresh tasks become
//!    `Done` immediately (their consumers are released in turn), stale ones
//!    enter the ready set, ordered by topological rank.
//! 3. Ready tasks are dispatched head-of-line while their thread request
//!    fits in the free capacity. If the first one does not fit, nothing is
//!    dispatched until a running task returns.
//! 4. A finished task is checked against its output contract. On success
//!    its consumers are released; on failure every task downstream of it
//!    is `Blocked`, and the rest of the graph carries on.
//!
//! Cancellation stops dispatching; executors see the same token and kill
//! their processes. Whatever has not finished ends up `Blocked`.

use std::collections::{BTreeSet, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use futures::FutureExt;
use log::{debug, error, info, warn};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::dag::error::TaskError;
use crate::dag::graph::DependencyGraph;
use crate::dag::runner::{TaskExecutor, verify_outputs};
use crate::dag::staleness::evaluate;
use crate::dag::template::Resources;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Pending,
    Ready,
    Running,
    Done,
    Failed,
    Blocked,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerOptions {
    /// Total thread budget shared by all running tasks.
    pub capacity: usize,
    /// Optional memory budget in MiB.
    pub memory_capacity_mb: Option<u64>,
    /// Treat every task as stale.
    pub force: bool,
}

impl SchedulerOptions {
    pub fn new(capacity: usize) -> Self {
        SchedulerOptions {
            capacity: capacity.max(1),
            memory_capacity_mb: None,
            force: false,
        }
    }
}

#[derive(Debug, Default)]
pub struct RunSummary {
    pub executed: Vec<String>,
    pub up_to_date: Vec<String>,
    pub failed: Vec<(String, TaskError)>,
    pub blocked: Vec<String>,
    pub cancelled: bool,
    /// Highest thread weight in flight at any instant.
    pub peak_threads: usize,
}

impl RunSummary {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty() && self.blocked.is_empty() && !self.cancelled
    }
}

pub struct Scheduler {
    options: SchedulerOptions,
}

struct RunState<'g> {
    graph: &'g DependencyGraph,
    state: Vec<TaskState>,
    waiting_on: Vec<usize>,
    ran: Vec<bool>,
    ready: BTreeSet<(usize, usize)>,
    to_evaluate: VecDeque<usize>,
    summary: RunSummary,
}

impl<'g> RunState<'g> {
    fn new(graph: &'g DependencyGraph) -> Self {
        let n = graph.len();
        let waiting_on: Vec<usize> = (0..n).map(|i| graph.producers(i).len()).collect();
        let to_evaluate = graph.order().iter().copied().filter(|&i| waiting_on[i] == 0).collect();
        RunState {
            graph,
            state: vec![TaskState::Pending; n],
            waiting_on,
            ran: vec![false; n],
            ready: BTreeSet::new(),
            to_evaluate,
            summary: RunSummary::default(),
        }
    }

    fn release_consumers(&mut self, i: usize) {
        let graph = self.graph;
        for c in graph.consumers(i) {
            self.waiting_on[c] -= 1;
            if self.waiting_on[c] == 0 && self.state[c] == TaskState::Pending {
                self.to_evaluate.push_back(c);
            }
        }
    }

    fn evaluate_released(&mut self, force: bool) {
        let graph = self.graph;
        while let Some(i) = self.to_evaluate.pop_front() {
            let task = graph.task(i);
            match evaluate(graph, i, &self.ran, force) {
                Ok(staleness) if !staleness.is_stale() => {
                    debug!("Up to date: {}", task.id);
                    self.state[i] = TaskState::Done;
                    self.summary.up_to_date.push(task.id.clone());
                    self.release_consumers(i);
                }
                Ok(staleness) => {
                    debug!("Stale: {} ({})", task.id, staleness);
                    self.state[i] = TaskState::Ready;
                    self.ready.insert((graph.rank(i), i));
                }
                Err(e) => {
                    let err = TaskError::Io {
                        task: task.id.clone(),
                        path: task.outputs.first().cloned().unwrap_or_default(),
                        error: e.to_string(),
                    };
                    self.fail(i, err);
                }
            }
        }
    }

    fn fail(&mut self, i: usize, err: TaskError) {
        let graph = self.graph;
        let id = graph.task(i).id.clone();
        error!("{}", err);
        self.state[i] = TaskState::Failed;
        self.summary.failed.push((id, err));

        for d in graph.descendants(i) {
            if matches!(self.state[d], TaskState::Pending | TaskState::Ready) {
                self.ready.remove(&(graph.rank(d), d));
                self.state[d] = TaskState::Blocked;
                self.summary.blocked.push(graph.task(d).id.clone());
            }
        }
    }

    fn finish(&mut self, i: usize) {
        let id = self.graph.task(i).id.clone();
        self.state[i] = TaskState::Done;
        self.ran[i] = true;
        self.summary.executed.push(id);
        self.release_consumers(i);
    }

    /// Everything that never reached a terminal state is blocked.
    fn block_unfinished(&mut self) {
        let graph = self.graph;
        for &i in graph.order() {
            if matches!(self.state[i], TaskState::Pending | TaskState::Ready | TaskState::Running) {
                self.state[i] = TaskState::Blocked;
                self.summary.blocked.push(graph.task(i).id.clone());
            }
        }
    }
}

impl Scheduler {
    pub fn new(options: SchedulerOptions) -> Self {
        Scheduler { options }
    }

    pub fn options(&self) -> &SchedulerOptions {
        &self.options
    }

    /// A task asking for more than the whole budget is clamped so it can
    /// still run (alone).
    fn effective_request(&self, id: &str, requested: Resources) -> Resources {
        let mut effective = requested;
        if requested.threads > self.options.capacity {
            warn!(
                "Task {} requests {} threads, capacity is {}; clamping",
                id, requested.threads, self.options.capacity
            );
            effective.threads = self.options.capacity;
        }
        if let Some(mem_cap) = self.options.memory_capacity_mb {
            if requested.mem_mb > mem_cap {
                warn!(
                    "Task {} requests {} MiB, memory capacity is {} MiB; clamping",
                    id, requested.mem_mb, mem_cap
                );
                effective.mem_mb = mem_cap;
            }
        }
        effective
    }

    /// Runs the graph to completion (or cancellation).
    ///
    /// # Arguments
    ///
    /// * `graph` - Validated dependency graph.
    /// * `executor` - Runs individual tasks.
    /// * `cancel` - Stops dispatching and is forwarded to running tasks.
    ///
    /// # Returns
    /// RunSummary of executed, up-to-date, failed and blocked tasks.
    pub async fn run<E>(&self, graph: &DependencyGraph, executor: Arc<E>, cancel: CancellationToken) -> RunSummary
    where
        E: TaskExecutor + 'static,
    {
        let mut run = RunState::new(graph);
        let requests: Vec<Resources> = graph
            .tasks()
            .iter()
            .map(|t| self.effective_request(&t.id, t.resources))
            .collect();

        let mut in_flight_threads = 0usize;
        let mut in_flight_mem = 0u64;
        let mut started: Vec<Option<Instant>> = vec![None; graph.len()];
        let mut running: JoinSet<(usize, Result<(), TaskError>)> = JoinSet::new();

        loop {
            if !cancel.is_cancelled() {
                run.evaluate_released(self.options.force);

                while let Some(&(rank, i)) = run.ready.first() {
                    let request = requests[i];
                    let threads_fit = in_flight_threads + request.threads <= self.options.capacity;
                    let mem_fits = self
                        .options
                        .memory_capacity_mb
                        .map_or(true, |cap| in_flight_mem + request.mem_mb <= cap);
                    if !(threads_fit && mem_fits) {
                        break;
                    }
                    run.ready.remove(&(rank, i));
                    run.state[i] = TaskState::Running;
                    in_flight_threads += request.threads;
                    in_flight_mem += request.mem_mb;
                    run.summary.peak_threads = run.summary.peak_threads.max(in_flight_threads);
                    started[i] = Some(Instant::now());

                    // the executor sees the clamped request it was budgeted for
                    let mut task = graph.task(i).clone();
                    task.resources = request;
                    info!("Starting {} ({} threads)", task.id, request.threads);
                    let executor = Arc::clone(&executor);
                    let token = cancel.clone();
                    running.spawn(async move {
                        let result = AssertUnwindSafe(executor.execute(&task, token))
                            .catch_unwind()
                            .await
                            .unwrap_or_else(|_| {
                                Err(TaskError::Command {
                                    task: task.id.clone(),
                                    reason: "executor panicked".to_string(),
                                })
                            });
                        (i, result)
                    });
                }
            }

            let Some(joined) = running.join_next().await else {
                break;
            };
            let (i, result) = match joined {
                Ok(done) => done,
                Err(e) => {
                    error!("Task join failed: {}", e);
                    continue;
                }
            };

            in_flight_threads -= requests[i].threads;
            in_flight_mem -= requests[i].mem_mb;
            let elapsed = started[i].map(|t| t.elapsed().as_secs_f64()).unwrap_or_default();

            match result.and_then(|()| verify_outputs(graph.task(i))) {
                Ok(()) => {
                    info!("Finished {} in {:.1}s", graph.task(i).id, elapsed);
                    run.finish(i);
                }
                Err(e) => run.fail(i, e),
            }
        }

        run.summary.cancelled = cancel.is_cancelled();
        run.block_unfinished();
        run.summary
    }
}
