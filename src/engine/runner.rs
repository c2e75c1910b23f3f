mod diagnostics;

use std::collections::{HashMap, HashSet};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::mpsc::channel;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use petgraph::Graph;
use petgraph::graph::NodeIndex;
use tracing::Level;
use tracing_indicatif::span_ext::IndicatifSpanExt;

use crate::channel::Abort;
use crate::core::{Environment, Key};
use crate::engine::task::panic_message;
use crate::engine::{Budget, Launcher, Node, Ports, Resources, Runtime};
use crate::error::{ChannelError, PipelineError};

pub use diagnostics::Diagnostics;

/// Wall-clock span of one operator, from start until its output closed.
#[derive(Debug, Clone)]
pub struct TaskExecution {
    pub start: Instant,
    pub duration: Duration,
}

/// Timing of a single task instance.
#[derive(Debug, Clone)]
pub struct InstanceRecord {
    pub node: NodeIndex,
    pub name: String,
    pub key: Key,
    pub start: Instant,
    pub duration: Duration,
    pub succeeded: bool,
}

/// Outcome of planning: which nodes run and how many readers each port has.
#[derive(Debug, Default, Clone)]
pub(crate) struct Plan {
    pub active: HashSet<NodeIndex>,
    pub pruned: HashSet<NodeIndex>,
    pub consumers: HashMap<NodeIndex, usize>,
}

/// Time of the latest progress anywhere in the run.
///
/// Task instances mark it when they start and finish, collectors when a
/// token arrives. A wait only counts as a stall once nothing has moved for
/// the whole stall timeout.
#[derive(Debug)]
pub(crate) struct Progress {
    last: Mutex<Instant>,
}

impl Progress {
    pub fn new() -> Self {
        Self {
            last: Mutex::new(Instant::now()),
        }
    }

    pub fn mark(&self) {
        *self.last.lock().unwrap_or_else(PoisonError::into_inner) = Instant::now();
    }

    /// Latest progress plus `timeout`.
    pub fn deadline(&self, timeout: Duration) -> Instant {
        let last = *self.last.lock().unwrap_or_else(PoisonError::into_inner);
        last.checked_add(timeout)
            .unwrap_or_else(|| last + Duration::from_secs(365 * 24 * 3600))
    }
}

/// Settings shared by every operator of one run.
pub(crate) struct Settings<'a> {
    pub launcher: &'a dyn Launcher,
    pub budget: Resources,
    pub stall_timeout: Duration,
}

/// Executes a planned pipeline.
///
/// Every active operator is driven by its own scoped thread, blocking on its
/// input channels, while task instances are dispatched onto a rayon pool
/// sized to the CPU budget. Drivers report back over a channel:
/// 1. All ports are created up front, with their final consumer counts.
/// 2. One driver per active node is spawned.
/// 3. The main thread waits for driver results; the first failure raises the
///    shared abort signal, which every blocking wait observes.
/// 4. Once all drivers have returned, the first primary error (if any) is
///    the result of the run.
pub(crate) fn run_pipeline<G: Send + Sync>(
    graph: &Graph<Node<G>, ()>,
    plan: &Plan,
    env: &Environment<G>,
    settings: &Settings<'_>,
) -> Result<Diagnostics, PipelineError> {
    let abort = Arc::new(Abort::default());

    // Drivers are spawned in graph order so logs read top-down.
    let order: Vec<NodeIndex> = graph
        .node_indices()
        .filter(|index| plan.active.contains(index))
        .collect();

    let ports = Ports::new(
        order
            .iter()
            .map(|&index| {
                let node = &graph[index];
                let consumers = plan.consumers.get(&index).copied().unwrap_or(0);
                (index, node.op.make_port(&node.name, consumers, &abort))
            })
            .collect(),
    );

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(settings.budget.cpus.max(1))
        .thread_name(|i| format!("annoflow-worker-{i}"))
        .build()
        .map_err(|err| PipelineError::configuration("run.cpus", err.to_string()))?;

    let budget = Budget::new(settings.budget);
    let records = Mutex::new(Vec::new());

    let start = Instant::now();
    let progress = Progress::new();

    let root_span = tracing::span!(Level::INFO, "pipeline");
    root_span.pb_set_length(order.len() as u64);
    root_span.pb_set_style(&crate::utils::RUN_STYLE);
    root_span.pb_set_message("Running pipeline...");
    let _enter = root_span.enter();

    let mut execution_times = HashMap::new();

    std::thread::scope(|s| {
        let (result_sender, result_receiver) =
            channel::<(NodeIndex, Result<(), PipelineError>, Instant, Duration)>();

        for &index in &order {
            let node = &graph[index];
            let sender = result_sender.clone();

            let rt = Runtime {
                name: &node.name,
                index,
                env,
                ports: &ports,
                abort: &abort,
                budget: &budget,
                pool: &pool,
                launcher: settings.launcher,
                active: &plan.active,
                records: &records,
                span: &root_span,
                progress: &progress,
                stall_timeout: settings.stall_timeout,
            };

            s.spawn(move || {
                tracing::debug!("Starting '{}'", rt.name);
                let start_time = Instant::now();

                let result = match catch_unwind(AssertUnwindSafe(|| node.op.run(&rt))) {
                    Ok(result) => result,
                    Err(panic) => Err(PipelineError::task(rt.name, rt.name, panic_message(panic))),
                };

                // the receiver outlives every driver
                let _ = sender.send((index, result, start_time, start_time.elapsed()));
            });
        }

        drop(result_sender);

        // Scheduler loop, the main thread sits here while drivers run.
        for (index, result, start, duration) in result_receiver {
            execution_times.insert(index, TaskExecution { start, duration });
            root_span.pb_inc(1);

            if let Err(err) = result {
                abort.trigger(err);
            }
        }
    });

    if abort.is_set() {
        return Err(abort
            .take()
            .unwrap_or_else(|| PipelineError::channel("pipeline", ChannelError::Aborted)));
    }

    tracing::info!("Pipeline complete {}", crate::utils::as_overhead(start));

    let mut instances = records.into_inner().unwrap_or_else(PoisonError::into_inner);
    instances.sort_by_key(|record| record.start);

    Ok(Diagnostics {
        execution_times,
        instances,
        pruned: plan.pruned.clone(),
    })
}
