use std::collections::{HashMap, HashSet};
use std::fmt::Write;

use petgraph::graph::NodeIndex;

use crate::Pipeline;
use crate::engine::runner::{InstanceRecord, TaskExecution};

/// Run diagnostics and performance metrics.
///
/// Returned by [`Pipeline::run`]. Holds the wall-clock span of every
/// operator, the timing of every task instance and the nodes pruned at plan
/// time.
#[derive(Debug, Default)]
pub struct Diagnostics {
    /// Operator spans keyed by node.
    pub execution_times: HashMap<NodeIndex, TaskExecution>,
    /// Task instances, sorted by start time.
    pub instances: Vec<InstanceRecord>,
    /// Nodes that were not scheduled because a gate or predicate disabled them.
    pub pruned: HashSet<NodeIndex>,
}

impl Diagnostics {
    /// Instances of the task named `name`.
    pub fn instances_of<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a InstanceRecord> {
        self.instances.iter().filter(move |record| record.name == name)
    }

    /// Renders the pipeline graph as a Mermaid diagram.
    ///
    /// Operators are colored by how long they were active, from green
    /// (shortest) to red (longest). Pruned nodes are drawn grey and dashed.
    pub fn render_mermaid<G>(&self, pipeline: &Pipeline<G>) -> String
    where
        G: Send + Sync,
    {
        let mut f = String::new();
        let _ = writeln!(f, "graph LR");

        let times = &self.execution_times;
        let (min_time, max_time) = times
            .values()
            .map(|t| t.duration.as_secs_f64())
            .fold((f64::MAX, f64::MIN), |(lo, hi), t| (lo.min(t), hi.max(t)));

        // all operators took about the same time
        let span = if max_time > min_time { max_time - min_time } else { 1.0 };

        let mut instances: HashMap<NodeIndex, usize> = HashMap::new();
        for record in &self.instances {
            *instances.entry(record.node).or_default() += 1;
        }

        for index in pipeline.graph.node_indices() {
            let node = &pipeline.graph[index];
            let name = node.name.replace('"', "\\\"");
            let id = index.index();

            if self.pruned.contains(&index) {
                let _ = writeln!(f, "    {id}[\"{name}\\npruned\"]");
                let _ = writeln!(f, "    style {id} fill:#EEEEEE,stroke-dasharray: 5 5");
                continue;
            }

            let Some(exec) = times.get(&index) else {
                let _ = writeln!(f, "    {id}[\"{name}\"]");
                continue;
            };

            let label = match instances.get(&index) {
                Some(count) => format!("{:.2?} x{count}", exec.duration),
                None => format!("{:.2?}", exec.duration),
            };

            // 0.0 (green) -> 0.5 (yellow) -> 1.0 (red)
            let t = (exec.duration.as_secs_f64() - min_time) / span;
            let (r, g) = if t < 0.5 {
                ((255.0 * t * 2.0) as u8, 255)
            } else {
                (255, (255.0 * (1.0 - (t - 0.5) * 2.0)) as u8)
            };

            let _ = writeln!(f, "    {id}[\"{name}\\n{label}\"]");
            let _ = writeln!(f, "    style {id} fill:#{r:02X}{g:02X}00");
        }

        for edge in pipeline.graph.raw_edges() {
            let (source, target) = (edge.source(), edge.target());
            let type_name = pipeline.graph[source]
                .op
                .output_type_name()
                .replace('<', "&lt;")
                .replace('>', "&gt;");

            let (open, close) = if self.pruned.contains(&source) || self.pruned.contains(&target) {
                ("-.", ".->")
            } else {
                ("--", "-->")
            };

            let _ = writeln!(
                f,
                "    {} {open} \"{type_name}\" {close} {}",
                source.index(),
                target.index()
            );
        }

        f
    }
}
