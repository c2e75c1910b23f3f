use std::borrow::Cow;
use std::marker::PhantomData;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use camino::Utf8PathBuf;
use petgraph::Graph;
use petgraph::graph::NodeIndex;

use crate::core::{Environment, TaskContext, Token};
use crate::engine::runner::{Plan, Settings, run_pipeline};
use crate::engine::{
    Artifact, Chunk, Collector, Constant, CrossJoiner, EachTask, Expander, Gate, GateId,
    Invocation, Kind, Launcher, LocalLauncher, Many, Node, OnceTask, One, Pair, Predicate,
    Resources, Source, Splitter, TypedOperator, Values,
};
use crate::error::PipelineError;
use crate::Diagnostics;

/// The blueprint of a pipeline.
///
/// `Blueprint` is used to define the graph of operators. Every method adds
/// one node and returns a typed handle ([`Many`] for streams, [`One`] for
/// single values) that later nodes take as input, so the graph is wired by
/// ordinary data flow in Rust code.
///
/// Once configured, convert it into a [`Pipeline`] to run it.
///
/// # Example
///
/// ```rust,no_run
/// use annoflow::{Blueprint, Invocation, Splitter};
///
/// let mut bp: Blueprint<()> = Blueprint::new();
/// let chunks = bp.split("split", Splitter::fasta("proteins.fa", 10));
/// let hits = bp
///     .task("search")
///     .each(chunks, ())
///     .run(|_, chunk, _| Ok(Invocation::new("search").arg(chunk.payload.path.as_str())));
/// let all = bp.collect("collect", &[hits]);
/// ```
pub struct Blueprint<G: Send + Sync = ()> {
    pub(crate) graph: Graph<Node<G>, ()>,
    pub(crate) gates: Vec<Gate<G>>,
}

impl<G: Send + Sync + 'static> Blueprint<G> {
    /// Creates a new, empty blueprint.
    pub fn new() -> Self {
        Self {
            graph: Graph::new(),
            gates: Vec::new(),
        }
    }

    pub fn finish(self) -> Pipeline<G> {
        Pipeline {
            graph: self.graph,
            gates: self.gates,
            launcher: Arc::new(LocalLauncher),
        }
    }

    /// Registers a gate. Gates are evaluated in registration order.
    pub fn gate(&mut self, gate: Gate<G>) -> GateId {
        self.gates.push(gate);
        GateId(self.gates.len() - 1)
    }

    pub fn split(&mut self, name: impl Into<Cow<'static, str>>, splitter: Splitter) -> Many<Chunk> {
        Many::new(self.add_node(name.into(), None, None, splitter))
    }

    /// A value fixed at build time, keyed by `name`.
    pub fn value<T>(&mut self, name: impl Into<Cow<'static, str>>, value: T) -> One<T>
    where
        T: Send + Sync + 'static,
    {
        let name = name.into();
        let op = Constant::new(&name, value);
        One::new(self.add_node(name, None, None, op))
    }

    /// Expands every token of `source` into the members `parse` finds in it.
    pub fn expand<T, U, F>(
        &mut self,
        name: impl Into<Cow<'static, str>>,
        source: impl Into<Source<T>>,
        parse: F,
    ) -> Many<U>
    where
        T: Send + Sync + 'static,
        U: Send + Sync + 'static,
        F: Fn(&T) -> anyhow::Result<Vec<(String, U)>> + Send + Sync + 'static,
    {
        let op = Expander {
            source: source.into(),
            parse,
            _phantom: PhantomData,
        };
        Many::new(self.add_node(name.into(), None, None, op))
    }

    pub fn cross<A, B>(
        &mut self,
        name: impl Into<Cow<'static, str>>,
        left: Many<A>,
        right: Many<B>,
    ) -> Many<Pair<A, B>>
    where
        A: Send + Sync + 'static,
        B: Send + Sync + 'static,
    {
        Many::new(self.add_node(name.into(), None, None, CrossJoiner { left, right }))
    }

    /// Waits for every surviving input to close and yields all their tokens.
    pub fn collect<T>(&mut self, name: impl Into<Cow<'static, str>>, inputs: &[Many<T>]) -> One<Vec<Token<T>>>
    where
        T: Send + Sync + 'static,
    {
        let op = Collector {
            inputs: inputs.to_vec(),
        };
        One::new(self.add_node(name.into(), None, None, op))
    }

    /// The entry point for defining a task.
    pub fn task(&mut self, name: impl Into<Cow<'static, str>>) -> TaskDef<'_, G> {
        TaskDef {
            blueprint: self,
            name: name.into(),
            gate: None,
            enabled: None,
            resources: Resources::default(),
            publish: None,
        }
    }

    fn add_node<T>(
        &mut self,
        name: Cow<'static, str>,
        gate: Option<GateId>,
        enabled: Option<Predicate<G>>,
        op: T,
    ) -> NodeIndex
    where
        T: TypedOperator<G> + 'static,
    {
        let inputs = op.inputs();
        let index = self.graph.add_node(Node {
            name,
            gate,
            enabled,
            op: Arc::new(op),
        });

        for input in inputs {
            self.graph.add_edge(input, index, ());
        }

        index
    }
}

impl<G: Send + Sync + 'static> Default for Blueprint<G> {
    fn default() -> Self {
        Self::new()
    }
}

pub struct TaskDef<'a, G: Send + Sync> {
    blueprint: &'a mut Blueprint<G>,
    name: Cow<'static, str>,
    gate: Option<GateId>,
    enabled: Option<Predicate<G>>,
    resources: Resources,
    publish: Option<Utf8PathBuf>,
}

impl<'a, G: Send + Sync + 'static> TaskDef<'a, G> {
    /// Attaches the task to a gate; it is pruned when the gate is closed.
    pub fn gate(mut self, gate: GateId) -> Self {
        self.gate = Some(gate);
        self
    }

    pub fn enable_when<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&G) -> bool + Send + Sync + 'static,
    {
        self.enabled = Some(Arc::new(predicate));
        self
    }

    /// Resources each instance holds while it runs.
    pub fn resources(mut self, resources: Resources) -> Self {
        self.resources = resources;
        self
    }

    /// Copies the declared outputs of every succeeded instance into `dir`.
    pub fn publish(mut self, dir: impl Into<Utf8PathBuf>) -> Self {
        self.publish = Some(dir.into());
        self
    }

    /// One instance per token of `stream`, after every value in `values`
    /// has been produced.
    pub fn each<T, V>(self, stream: Many<T>, values: V) -> EachBinder<'a, G, T, V>
    where
        T: Send + Sync + 'static,
        V: Values + 'static,
    {
        EachBinder {
            def: self,
            stream,
            values,
        }
    }

    /// Exactly one instance, after every value in `values` has been produced.
    pub fn once<V>(self, values: V) -> OnceBinder<'a, G, V>
    where
        V: Values + 'static,
    {
        OnceBinder { def: self, values }
    }
}

pub struct EachBinder<'a, G: Send + Sync, T, V> {
    def: TaskDef<'a, G>,
    stream: Many<T>,
    values: V,
}

impl<'a, G, T, V> EachBinder<'a, G, T, V>
where
    G: Send + Sync + 'static,
    T: Send + Sync + 'static,
    V: Values + 'static,
{
    pub fn run<F>(self, callback: F) -> Many<Artifact>
    where
        F: for<'b> Fn(&TaskContext<'b, G>, &Token<T>, &V::Output) -> anyhow::Result<Invocation>
            + Send
            + Sync
            + 'static,
    {
        let TaskDef {
            blueprint,
            name,
            gate,
            enabled,
            resources,
            publish,
        } = self.def;

        let op = EachTask {
            stream: self.stream,
            values: self.values,
            resources,
            publish,
            callback,
            _phantom: PhantomData,
        };

        Many::new(blueprint.add_node(name, gate, enabled, op))
    }
}

pub struct OnceBinder<'a, G: Send + Sync, V> {
    def: TaskDef<'a, G>,
    values: V,
}

impl<'a, G, V> OnceBinder<'a, G, V>
where
    G: Send + Sync + 'static,
    V: Values + 'static,
{
    pub fn run<F>(self, callback: F) -> One<Artifact>
    where
        F: for<'b> Fn(&TaskContext<'b, G>, &V::Output) -> anyhow::Result<Invocation>
            + Send
            + Sync
            + 'static,
    {
        let TaskDef {
            blueprint,
            name,
            gate,
            enabled,
            resources,
            publish,
        } = self.def;

        let op = OnceTask {
            values: self.values,
            resources,
            publish,
            callback,
            _phantom: PhantomData,
        };

        One::new(blueprint.add_node(name, gate, enabled, op))
    }
}

/// Run-wide settings.
#[derive(Debug, Clone)]
pub struct Options {
    /// Root of split chunks and task work directories.
    pub work_dir: Utf8PathBuf,
    /// Total resources shared by all concurrently running instances.
    pub budget: Resources,
    /// How long a collector waits for its producers before the run fails.
    pub stall_timeout: Duration,
}

impl Default for Options {
    fn default() -> Self {
        let cpus = std::thread::available_parallelism()
            .map(NonZeroUsize::get)
            .unwrap_or(1);

        Self {
            work_dir: Utf8PathBuf::from("work"),
            budget: Resources::new(cpus, 8 << 30),
            stall_timeout: Duration::from_secs(24 * 3600),
        }
    }
}

/// A configured pipeline, ready to run.
///
/// A [`Pipeline`] is created from a [`Blueprint`]. Each call to
/// [`Pipeline::run`] plans the graph against the run facts, then executes it.
pub struct Pipeline<G: Send + Sync = ()> {
    pub(crate) graph: Graph<Node<G>, ()>,
    pub(crate) gates: Vec<Gate<G>>,
    launcher: Arc<dyn Launcher>,
}

impl<G> Pipeline<G>
where
    G: Send + Sync + 'static,
{
    /// Replaces the launcher used to run task commands.
    pub fn set_launcher(&mut self, launcher: impl Launcher + 'static) {
        self.launcher = Arc::new(launcher);
    }

    /// Runs the pipeline once.
    ///
    /// This will:
    /// 1. Evaluate every gate and prune disabled nodes.
    /// 2. Check every task against the resource budget.
    /// 3. Execute the remaining graph until every operator has finished.
    ///
    /// Nothing is dispatched if planning fails.
    pub fn run(&self, options: &Options, data: G) -> Result<Diagnostics, PipelineError> {
        let plan = self.plan(&data, &options.budget)?;

        tracing::info!(
            "Planned {} steps ({} pruned), budget {}",
            plan.active.len(),
            plan.pruned.len(),
            options.budget
        );

        // commands run inside their instance dirs, so every path handed to
        // them must be absolute
        std::fs::create_dir_all(&options.work_dir)?;

        let env = Environment {
            generator: "annoflow",
            work_dir: options.work_dir.canonicalize_utf8()?,
            data,
        };

        let settings = Settings {
            launcher: self.launcher.as_ref(),
            budget: options.budget,
            stall_timeout: options.stall_timeout,
        };

        run_pipeline(&self.graph, &plan, &env, &settings)
    }

    pub(crate) fn plan(&self, data: &G, budget: &Resources) -> Result<Plan, PipelineError> {
        // toposort doubles as cycle detection
        let order = petgraph::algo::toposort(&self.graph, None).map_err(|cycle| {
            PipelineError::Cycle {
                node: self.graph[cycle.node_id()].name.to_string(),
            }
        })?;

        for &index in &order {
            let node = &self.graph[index];
            node.op.validate(&node.name)?;
        }

        let mut open = Vec::with_capacity(self.gates.len());
        for gate in &self.gates {
            open.push(gate.evaluate(data)?);
        }

        let mut plan = Plan::default();

        for &index in &order {
            let node = &self.graph[index];

            let active = match node.op.kind() {
                // collectors only wait for whatever survives
                Kind::Collect => true,
                _ => {
                    node.gate.is_none_or(|GateId(gate)| open[gate])
                        && node.is_enabled(data)
                        && node.op.inputs().iter().all(|input| plan.active.contains(input))
                }
            };

            if active {
                plan.active.insert(index);
            } else {
                tracing::debug!("Pruned '{}'", node.name);
                plan.pruned.insert(index);
            }
        }

        for &index in order.iter().filter(|index| plan.active.contains(index)) {
            let node = &self.graph[index];

            if let Some(needed) = node.op.resources()
                && !budget.covers(&needed)
            {
                let key = if needed.cpus > budget.cpus {
                    "run.cpus"
                } else {
                    "run.memory"
                };

                return Err(PipelineError::configuration(
                    key,
                    format!("step '{}' needs {needed}, the budget is {budget}", node.name),
                ));
            }
        }

        for edge in self.graph.raw_edges() {
            if plan.active.contains(&edge.source()) && plan.active.contains(&edge.target()) {
                *plan.consumers.entry(edge.source()).or_default() += 1;
            }
        }

        Ok(plan)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::fs;
    use std::io;
    use std::sync::Mutex;

    use camino::Utf8Path;

    use super::*;
    use crate::engine::parse_member_list;

    fn tempdir() -> (tempfile::TempDir, Utf8PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::try_from(dir.path().to_path_buf()).unwrap();
        (dir, path)
    }

    fn fasta(root: &Utf8Path, records: usize) -> Utf8PathBuf {
        let path = root.join("proteins.fa");
        let text: String = (1..=records).map(|i| format!(">seq{i}\nMKVL\n")).collect();
        fs::write(&path, text).unwrap();
        path
    }

    fn options(root: &Utf8Path) -> Options {
        Options {
            work_dir: root.join("work"),
            budget: Resources::new(4, 1 << 30),
            stall_timeout: Duration::from_secs(30),
        }
    }

    /// Creates every declared output and succeeds.
    fn touch(inv: &Invocation, dir: &Utf8Path) -> io::Result<i32> {
        for output in &inv.outputs {
            fs::write(dir.join(output), &inv.program)?;
        }
        Ok(0)
    }

    fn keys<'a>(diagnostics: &'a Diagnostics, name: &'a str) -> HashSet<String> {
        diagnostics
            .instances_of(name)
            .map(|record| record.key.to_string())
            .collect()
    }

    #[test]
    fn test_broadcast_collect_report() {
        let (_guard, root) = tempdir();
        let input = fasta(&root, 23);

        let mut bp = Blueprint::<()>::new();
        let chunks = bp.split("split", Splitter::fasta(&input, 10));

        let branches: Vec<_> = ["a", "b", "c"]
            .into_iter()
            .map(|name| {
                bp.task(name)
                    .each(chunks, ())
                    .run(|ctx, chunk, _| {
                        Ok(Invocation::new(ctx.key.to_string())
                            .arg(chunk.payload.path.as_str())
                            .output("out.txt"))
                    })
            })
            .collect();

        let all = bp.collect("collect", &branches);
        let report = root.join("results");
        bp.task("report")
            .publish(&report)
            .once(all)
            .run(|_, all| {
                assert_eq!(all.payload.len(), 9);
                Ok(Invocation::new("report").output("report.txt"))
            });

        let mut pipeline = bp.finish();
        pipeline.set_launcher(touch);
        let diagnostics = pipeline.run(&options(&root), ()).unwrap();

        let expected: HashSet<_> = ["proteins.1", "proteins.2", "proteins.3"]
            .map(String::from)
            .into();

        for branch in ["a", "b", "c"] {
            assert_eq!(keys(&diagnostics, branch), expected);
        }
        assert_eq!(diagnostics.instances_of("report").count(), 1);
        assert!(report.join("report.txt").exists());
    }

    #[test]
    fn test_index_finishes_before_search() {
        let (_guard, root) = tempdir();
        let input = fasta(&root, 5);

        let mut bp = Blueprint::<()>::new();
        let chunks = bp.split("split", Splitter::fasta(&input, 1));
        let index = bp
            .task("index")
            .once(())
            .run(|_, _| Ok(Invocation::new("makedb").output("db.dmnd")));

        bp.task("search")
            .each(chunks, index)
            .run(|_, _, index| {
                let db = index.payload.require("db.dmnd")?;
                assert!(db.exists());
                Ok(Invocation::new("search").arg(db.as_str()).output("hits.tsv"))
            });

        let mut pipeline = bp.finish();
        pipeline.set_launcher(|inv: &Invocation, dir: &Utf8Path| {
            if inv.program == "makedb" {
                std::thread::sleep(Duration::from_millis(100));
            }
            touch(inv, dir)
        });

        let diagnostics = pipeline.run(&options(&root), ()).unwrap();
        let built = diagnostics.instances_of("index").next().unwrap();
        let ready = built.start + built.duration;

        assert_eq!(diagnostics.instances_of("search").count(), 5);
        assert!(diagnostics.instances_of("search").all(|s| s.start >= ready));
    }

    fn expanded(levels: &'static str) -> Diagnostics {
        let (_guard, root) = tempdir();
        let input = fasta(&root, 25);

        let mut bp = Blueprint::<()>::new();
        let chunks = bp.split("split", Splitter::fasta(&input, 10));
        let list = bp.value("levels", levels.to_string());
        let members = bp.expand("members", list, |text: &String| {
            Ok(parse_member_list(text)?.into_iter().map(|m| (m.clone(), m)).collect())
        });
        let pairs = bp.cross("pairs", chunks, members);
        let hits = bp.task("search").each(pairs, ()).run(|_, pair, _| {
            Ok(Invocation::new("search")
                .arg(pair.payload.right.payload.as_str())
                .output("hits.tsv"))
        });
        let all = bp.collect("collect", &[hits]);
        bp.task("report")
            .once(all)
            .run(|_, _| Ok(Invocation::new("report").output("report.txt")));

        let mut pipeline = bp.finish();
        pipeline.set_launcher(touch);
        pipeline.run(&options(&root), ()).unwrap()
    }

    #[test]
    fn test_cross_product_of_expansion() {
        let diagnostics = expanded("2759,33208\n7742");

        let keys = keys(&diagnostics, "search");
        assert_eq!(keys.len(), 9);
        assert!(keys.contains("proteins.3+levels/7742"));
        assert_eq!(diagnostics.instances_of("report").count(), 1);
    }

    #[test]
    fn test_empty_expansion_yields_no_pairs() {
        let diagnostics = expanded("");

        assert_eq!(diagnostics.instances_of("search").count(), 0);
        assert_eq!(diagnostics.instances_of("report").count(), 1);
    }

    struct Facts {
        orthodb_enabled: bool,
        orthodb: Utf8PathBuf,
    }

    fn gated(root: &Utf8Path) -> Pipeline<Facts> {
        let input = fasta(root, 23);

        let mut bp = Blueprint::<Facts>::new();
        let gate = bp.gate(
            Gate::new("orthodb")
                .when(|facts: &Facts| facts.orthodb_enabled)
                .require_dir("data.orthodb", |facts: &Facts| Some(facts.orthodb.clone())),
        );

        let chunks = bp.split("split", Splitter::fasta(&input, 10));
        let scan = bp
            .task("interproscan")
            .each(chunks, ())
            .run(|_, _, _| Ok(Invocation::new("interproscan").output("ipr.tsv")));
        let ortho = bp
            .task("orthodb")
            .gate(gate)
            .each(chunks, ())
            .run(|_, _, _| Ok(Invocation::new("orthodb").output("odb.tsv")));

        let all = bp.collect("collect", &[scan, ortho]);
        bp.task("report").once(all).run(|_, all| {
            assert_eq!(all.payload.len(), 3);
            Ok(Invocation::new("report").output("report.txt"))
        });

        let mut pipeline = bp.finish();
        pipeline.set_launcher(touch);
        pipeline
    }

    #[test]
    fn test_gate_failure_stops_before_dispatch() {
        let (_guard, root) = tempdir();
        let pipeline = gated(&root);
        let facts = Facts {
            orthodb_enabled: true,
            orthodb: root.join("missing"),
        };

        match pipeline.run(&options(&root), facts) {
            Err(PipelineError::Precondition { path, key, .. }) => {
                assert_eq!(path, root.join("missing"));
                assert_eq!(key, "data.orthodb");
            }
            other => panic!("unexpected {:?}", other.map(|_| ())),
        }

        assert!(!root.join("work").exists());
    }

    #[test]
    fn test_disabled_gate_prunes_branch() {
        let (_guard, root) = tempdir();
        let pipeline = gated(&root);
        let facts = Facts {
            orthodb_enabled: false,
            orthodb: root.join("missing"),
        };

        let diagnostics = pipeline.run(&options(&root), facts).unwrap();

        assert_eq!(diagnostics.instances_of("interproscan").count(), 3);
        assert_eq!(diagnostics.instances_of("orthodb").count(), 0);
        assert_eq!(diagnostics.instances_of("report").count(), 1);
        assert_eq!(diagnostics.pruned.len(), 1);

        let mermaid = diagnostics.render_mermaid(&pipeline);
        assert!(mermaid.contains("orthodb\\npruned"));
    }

    #[test]
    fn test_failing_instance_aborts_run() {
        let (_guard, root) = tempdir();
        let input = fasta(&root, 30);

        let mut bp = Blueprint::<()>::new();
        let chunks = bp.split("split", Splitter::fasta(&input, 10));
        let hits = bp.task("search").each(chunks, ()).run(|ctx, _, _| {
            Ok(Invocation::new(ctx.key.to_string()).output("hits.tsv"))
        });
        let all = bp.collect("collect", &[hits]);
        bp.task("report")
            .once(all)
            .run(|_, _| Ok(Invocation::new("report").output("report.txt")));

        let launched = Arc::new(Mutex::new(Vec::new()));
        let mut pipeline = bp.finish();
        pipeline.set_launcher({
            let launched = launched.clone();
            move |inv: &Invocation, dir: &Utf8Path| {
                launched.lock().unwrap().push(inv.program.clone());
                match inv.program.as_str() {
                    "proteins.2" => Ok(1),
                    _ => touch(inv, dir),
                }
            }
        });

        match pipeline.run(&options(&root), ()) {
            Err(PipelineError::TaskExecution { task, key, message }) => {
                assert_eq!(task, "search");
                assert_eq!(key, "proteins.2");
                assert!(message.contains("status 1"));
            }
            other => panic!("unexpected {:?}", other.map(|_| ())),
        }

        assert!(!launched.lock().unwrap().contains(&"report".to_string()));
    }

    #[test]
    fn test_missing_output_fails() {
        let (_guard, root) = tempdir();

        let mut bp = Blueprint::<()>::new();
        bp.task("index")
            .once(())
            .run(|_, _| Ok(Invocation::new("makedb").output("db.dmnd")));

        let mut pipeline = bp.finish();
        pipeline.set_launcher(|_: &Invocation, _: &Utf8Path| -> io::Result<i32> { Ok(0) });

        assert!(matches!(
            pipeline.run(&options(&root), ()),
            Err(PipelineError::TaskExecution { .. })
        ));
    }

    #[test]
    fn test_builder_error_is_task_failure() {
        let (_guard, root) = tempdir();

        let mut bp = Blueprint::<()>::new();
        bp.task("resolve")
            .once(())
            .run(|_, _| anyhow::bail!("no levels configured"));

        let pipeline = bp.finish();
        match pipeline.run(&options(&root), ()) {
            Err(PipelineError::TaskExecution { message, .. }) => {
                assert_eq!(message, "no levels configured");
            }
            other => panic!("unexpected {:?}", other.map(|_| ())),
        }
    }

    /// Runs one instance at a time.
    fn serial(root: &Utf8Path, stall_timeout: Duration) -> Options {
        Options {
            budget: Resources::new(1, 1 << 30),
            stall_timeout,
            ..options(root)
        }
    }

    fn sleepy(root: &Utf8Path, chunks: usize, sleep: impl Fn(&str) -> Duration + Send + Sync + 'static) -> Pipeline<()> {
        let input = fasta(root, chunks);

        let mut bp = Blueprint::<()>::new();
        let chunks = bp.split("split", Splitter::fasta(&input, 1));
        let hits = bp
            .task("search")
            .each(chunks, ())
            .run(|ctx, _, _| Ok(Invocation::new(ctx.key.to_string()).output("out.txt")));
        bp.collect("collect", &[hits]);

        let mut pipeline = bp.finish();
        pipeline.set_launcher(move |inv: &Invocation, dir: &Utf8Path| {
            std::thread::sleep(sleep(&inv.program));
            touch(inv, dir)
        });
        pipeline
    }

    #[test]
    fn test_collector_stalls_on_hung_instance() {
        let (_guard, root) = tempdir();
        let pipeline = sleepy(&root, 3, |key| match key {
            "proteins.2" => Duration::from_millis(400),
            _ => Duration::ZERO,
        });

        match pipeline.run(&serial(&root, Duration::from_millis(80)), ()) {
            Err(PipelineError::Stall { node, .. }) => assert_eq!(node, "collect"),
            other => panic!("unexpected {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_long_steady_run_is_not_a_stall() {
        let (_guard, root) = tempdir();
        let pipeline = sleepy(&root, 8, |_| Duration::from_millis(40));

        let diagnostics = pipeline.run(&serial(&root, Duration::from_millis(150)), ()).unwrap();
        assert_eq!(diagnostics.instances_of("search").count(), 8);
    }

    #[test]
    fn test_relative_work_dir() {
        let dir = tempfile::tempdir_in(".").unwrap();
        let root = Utf8PathBuf::from(dir.path().file_name().unwrap().to_str().unwrap());
        assert!(root.is_relative());
        let input = fasta(&root, 2);

        let mut bp = Blueprint::<()>::new();
        let chunks = bp.split("split", Splitter::fasta(&input, 1));
        bp.task("check").each(chunks, ()).run(|_, chunk, _| {
            Ok(Invocation::new("sh")
                .args(["-c", "test -f \"$0\" && touch seen.txt", chunk.payload.path.as_str()])
                .output("seen.txt"))
        });

        let diagnostics = bp.finish().run(&options(&root), ()).unwrap();

        assert_eq!(diagnostics.instances_of("check").count(), 2);
        assert!(diagnostics.instances_of("check").all(|record| record.succeeded));
    }

    #[test]
    fn test_task_larger_than_budget() {
        let (_guard, root) = tempdir();

        let mut bp = Blueprint::<()>::new();
        bp.task("huge")
            .resources(Resources::new(64, 0))
            .once(())
            .run(|_, _| Ok(Invocation::new("huge")));

        match bp.finish().run(&options(&root), ()) {
            Err(PipelineError::Configuration { key, .. }) => assert_eq!(key, "run.cpus"),
            other => panic!("unexpected {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_predicate_prunes_downstream() {
        let (_guard, root) = tempdir();
        let input = fasta(&root, 3);

        let mut bp = Blueprint::<bool>::new();
        let chunks = bp.split("split", Splitter::fasta(&input, 1));
        let first = bp
            .task("first")
            .enable_when(|enabled: &bool| *enabled)
            .each(chunks, ())
            .run(|_, _, _| Ok(Invocation::new("first").output("a.txt")));
        bp.task("second")
            .each(first, ())
            .run(|_, _, _| Ok(Invocation::new("second").output("b.txt")));

        let mut pipeline = bp.finish();
        pipeline.set_launcher(touch);

        let plan = pipeline.plan(&false, &Resources::new(1, 0)).unwrap();
        assert_eq!(plan.pruned.len(), 2);
        // nobody reads the chunks any more
        assert_eq!(plan.consumers.get(&chunks.index()), None);

        let diagnostics = pipeline.run(&options(&root), false).unwrap();
        assert_eq!(diagnostics.instances_of("second").count(), 0);
    }
}
