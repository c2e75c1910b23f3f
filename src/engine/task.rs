use std::fs::{self, File};
use std::io;
use std::marker::PhantomData;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::process::{Command, Stdio};
use std::sync::{Arc, PoisonError};
use std::time::Instant;

use camino::{Utf8Path, Utf8PathBuf};
use petgraph::graph::NodeIndex;
use tracing_indicatif::span_ext::IndicatifSpanExt;

use crate::channel::{Abort, TICK};
use crate::core::{Key, TaskContext, Token};
use crate::engine::{InstanceRecord, Kind, Many, Resources, Runtime, Shape, TypedOperator, Values};
use crate::error::{ChannelError, PipelineError};

const STDOUT: &str = ".command.out";
const STDERR: &str = ".command.err";

/// A command to run inside the work directory of one task instance.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    /// Files the command must leave behind, relative to the work directory.
    pub outputs: Vec<Utf8PathBuf>,
}

impl Invocation {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Default::default()
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn output(mut self, path: impl Into<Utf8PathBuf>) -> Self {
        self.outputs.push(path.into());
        self
    }
}

/// The result of a succeeded task instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub workdir: Utf8PathBuf,
    /// Absolute paths of the declared outputs, in declaration order.
    pub files: Vec<Utf8PathBuf>,
}

impl Artifact {
    /// Finds a declared output by its file name.
    pub fn file(&self, name: &str) -> Option<&Utf8Path> {
        self.files
            .iter()
            .find(|file| file.file_name() == Some(name))
            .map(Utf8PathBuf::as_path)
    }

    pub fn require(&self, name: &str) -> anyhow::Result<&Utf8Path> {
        self.file(name)
            .ok_or_else(|| anyhow::anyhow!("'{name}' is not an output of {}", self.workdir))
    }
}

/// Runs invocations. The engine never spawns processes itself.
pub trait Launcher: Send + Sync {
    /// Runs `invocation` inside `workdir` and returns its exit code, or
    /// `None` if it was stopped because the run was aborted.
    fn launch(
        &self,
        invocation: &Invocation,
        workdir: &Utf8Path,
        abort: &Abort,
    ) -> io::Result<Option<i32>>;
}

impl<F> Launcher for F
where
    F: Fn(&Invocation, &Utf8Path) -> io::Result<i32> + Send + Sync,
{
    fn launch(&self, invocation: &Invocation, workdir: &Utf8Path, _: &Abort) -> io::Result<Option<i32>> {
        self(invocation, workdir).map(Some)
    }
}

/// Spawns local processes, capturing their output next to the results.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalLauncher;

impl Launcher for LocalLauncher {
    fn launch(
        &self,
        invocation: &Invocation,
        workdir: &Utf8Path,
        abort: &Abort,
    ) -> io::Result<Option<i32>> {
        let mut child = Command::new(&invocation.program)
            .args(&invocation.args)
            .envs(invocation.env.iter().map(|(k, v)| (k, v)))
            .current_dir(workdir)
            .stdin(Stdio::null())
            .stdout(File::create(workdir.join(STDOUT))?)
            .stderr(File::create(workdir.join(STDERR))?)
            .spawn()?;

        loop {
            if let Some(status) = child.try_wait()? {
                // no code when killed by a signal
                return Ok(Some(status.code().unwrap_or(-1)));
            }

            if abort.is_set() {
                tracing::debug!("Killing '{}' in {workdir}", invocation.program);
                // the child may exit on its own in the meantime
                let _ = child.kill();
                child.wait()?;
                return Ok(None);
            }

            std::thread::sleep(TICK);
        }
    }
}

/// Last non-empty line the command wrote to stderr, if any.
fn stderr_tail(workdir: &Utf8Path) -> String {
    fs::read_to_string(workdir.join(STDERR))
        .ok()
        .and_then(|text| {
            text.lines()
                .rev()
                .find(|line| !line.trim().is_empty())
                .map(|line| format!(": {}", line.trim()))
        })
        .unwrap_or_default()
}

pub(crate) fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("Task panicked: {s}")
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("Task panicked: {s}")
    } else {
        String::from("Task panicked with unknown payload")
    }
}

/// Runs one instance of a task and records its timing.
fn instance<G, F>(
    rt: &Runtime<'_, G>,
    key: &Key,
    publish: Option<&Utf8Path>,
    build: F,
) -> Result<Artifact, PipelineError>
where
    G: Send + Sync,
    F: FnOnce(&TaskContext<'_, G>) -> anyhow::Result<Invocation>,
{
    let span = tracing::info_span!(parent: rt.span, "task", task = rt.name, key = %key);
    span.pb_set_style(&crate::utils::TASK_STYLE);
    span.pb_set_message(&format!("{} ({key})", rt.name));
    let _enter = span.enter();

    rt.progress.mark();
    let start = Instant::now();
    let result = execute(rt, key, publish, build, span.clone());
    let duration = start.elapsed();
    rt.progress.mark();

    rt.records
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .push(InstanceRecord {
            node: rt.index,
            name: rt.name.to_string(),
            key: key.clone(),
            start,
            duration,
            succeeded: result.is_ok(),
        });

    result
}

fn execute<G, F>(
    rt: &Runtime<'_, G>,
    key: &Key,
    publish: Option<&Utf8Path>,
    build: F,
    span: tracing::Span,
) -> Result<Artifact, PipelineError>
where
    G: Send + Sync,
    F: FnOnce(&TaskContext<'_, G>) -> anyhow::Result<Invocation>,
{
    let workdir = rt.env.instance_dir(rt.name, key);
    if workdir.exists() {
        fs::remove_dir_all(&workdir)?;
    }
    fs::create_dir_all(&workdir)?;

    let context = TaskContext {
        env: rt.env,
        key,
        workdir: &workdir,
        span,
    };

    // builders only see immutable facts and their own inputs
    let invocation = match catch_unwind(AssertUnwindSafe(|| build(&context))) {
        Ok(result) => result.map_err(|err| PipelineError::task(rt.name, key, format!("{err:#}")))?,
        Err(panic) => return Err(PipelineError::task(rt.name, key, panic_message(panic))),
    };

    tracing::debug!("{} {}", invocation.program, invocation.args.join(" "));

    let status = rt
        .launcher
        .launch(&invocation, &workdir, rt.abort)
        .map_err(|err| {
            PipelineError::task(
                rt.name,
                key,
                format!("cannot launch '{}': {err}", invocation.program),
            )
        })?;

    match status {
        None => return Err(PipelineError::channel(rt.name, ChannelError::Aborted)),
        Some(0) => {}
        Some(code) => {
            return Err(PipelineError::task(
                rt.name,
                key,
                format!(
                    "'{}' exited with status {code}{}",
                    invocation.program,
                    stderr_tail(&workdir)
                ),
            ));
        }
    }

    let mut files = Vec::with_capacity(invocation.outputs.len());
    for output in &invocation.outputs {
        let path = workdir.join(output);
        if !path.exists() {
            return Err(PipelineError::task(
                rt.name,
                key,
                format!("declared output '{output}' is missing"),
            ));
        }
        files.push(path);
    }

    if let Some(dir) = publish {
        fs::create_dir_all(dir)?;
        for file in &files {
            if let Some(name) = file.file_name() {
                fs::copy(file, dir.join(name))?;
            }
        }
    }

    Ok(Artifact { workdir, files })
}

/// One instance per token of a stream.
pub(crate) struct EachTask<G, T, V, F>
where
    G: Send + Sync,
    T: Send + Sync + 'static,
    V: Values,
    F: for<'a> Fn(&TaskContext<'a, G>, &Token<T>, &V::Output) -> anyhow::Result<Invocation>
        + Send
        + Sync,
{
    pub stream: Many<T>,
    pub values: V,
    pub resources: Resources,
    pub publish: Option<Utf8PathBuf>,
    pub callback: F,
    pub _phantom: PhantomData<G>,
}

impl<G, T, V, F> TypedOperator<G> for EachTask<G, T, V, F>
where
    G: Send + Sync,
    T: Send + Sync + 'static,
    V: Values,
    F: for<'a> Fn(&TaskContext<'a, G>, &Token<T>, &V::Output) -> anyhow::Result<Invocation>
        + Send
        + Sync,
{
    type Output = Artifact;

    fn kind(&self) -> Kind {
        Kind::Task
    }

    fn shape(&self) -> Shape {
        Shape::Stream
    }

    fn inputs(&self) -> Vec<NodeIndex> {
        let mut inputs = vec![self.stream.index()];
        inputs.extend(self.values.indices());
        inputs
    }

    fn resources(&self) -> Option<Resources> {
        Some(self.resources)
    }

    fn run(&self, rt: &Runtime<'_, G>) -> Result<(), PipelineError> {
        let sender = rt.sender::<Artifact>()?;
        let mut receiver = self.stream.subscribe(rt.ports)?;

        // value inputs such as a prebuilt index gate the first instance
        let values = self.values.resolve(rt.ports)?;
        let (sender_ref, values) = (&sender, &values);

        rt.pool.in_place_scope(|scope| -> Result<(), PipelineError> {
            loop {
                rt.check_abort()?;

                let token = match receiver.recv() {
                    Ok(Some(token)) => token,
                    Ok(None) => break,
                    Err(err) => return Err(PipelineError::channel(receiver.name(), err)),
                };

                let permit = rt
                    .budget
                    .acquire(self.resources, rt.abort)
                    .map_err(|err| PipelineError::channel(rt.name, err))?;

                scope.spawn(move |_| {
                    let _permit = permit;
                    let publish = self.publish.as_deref();

                    match instance(rt, &token.key, publish, |ctx| (self.callback)(ctx, &token, values)) {
                        Ok(artifact) => sender_ref.send(Token {
                            key: token.key.clone(),
                            payload: Arc::new(artifact),
                        }),
                        Err(err) => rt.abort.trigger(err),
                    }
                });
            }

            Ok(())
        })?;

        // an instance failed after the last token was dispatched
        rt.check_abort()?;
        sender.close();
        Ok(())
    }
}

/// Exactly one instance over value inputs only.
pub(crate) struct OnceTask<G, V, F>
where
    G: Send + Sync,
    V: Values,
    F: for<'a> Fn(&TaskContext<'a, G>, &V::Output) -> anyhow::Result<Invocation> + Send + Sync,
{
    pub values: V,
    pub resources: Resources,
    pub publish: Option<Utf8PathBuf>,
    pub callback: F,
    pub _phantom: PhantomData<G>,
}

impl<G, V, F> TypedOperator<G> for OnceTask<G, V, F>
where
    G: Send + Sync,
    V: Values,
    F: for<'a> Fn(&TaskContext<'a, G>, &V::Output) -> anyhow::Result<Invocation> + Send + Sync,
{
    type Output = Artifact;

    fn kind(&self) -> Kind {
        Kind::Task
    }

    fn shape(&self) -> Shape {
        Shape::Value
    }

    fn inputs(&self) -> Vec<NodeIndex> {
        self.values.indices()
    }

    fn resources(&self) -> Option<Resources> {
        Some(self.resources)
    }

    fn run(&self, rt: &Runtime<'_, G>) -> Result<(), PipelineError> {
        let setter = rt.setter::<Artifact>()?;
        let values = self.values.resolve(rt.ports)?;

        let _permit = rt
            .budget
            .acquire(self.resources, rt.abort)
            .map_err(|err| PipelineError::channel(rt.name, err))?;

        let key = Key::new(rt.name);
        let publish = self.publish.as_deref();
        let artifact = rt
            .pool
            .install(|| instance(rt, &key, publish, |ctx| (self.callback)(ctx, &values)))?;

        setter.set(Token::new(key, artifact));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn tempdir() -> (tempfile::TempDir, Utf8PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::try_from(dir.path().to_path_buf()).unwrap();
        (dir, path)
    }

    #[test]
    fn test_invocation_builder() {
        let inv = Invocation::new("diamond")
            .arg("blastp")
            .args(["--db", "nr.dmnd"])
            .env("OMP_NUM_THREADS", "4")
            .output("hits.tsv");

        assert_eq!(inv.program, "diamond");
        assert_eq!(inv.args, ["blastp", "--db", "nr.dmnd"]);
        assert_eq!(inv.env, [("OMP_NUM_THREADS".to_string(), "4".to_string())]);
        assert_eq!(inv.outputs, [Utf8PathBuf::from("hits.tsv")]);
    }

    #[test]
    fn test_artifact_lookup() {
        let artifact = Artifact {
            workdir: "work/ab/cd".into(),
            files: vec!["work/ab/cd/members.txt".into(), "work/ab/cd/log.txt".into()],
        };

        assert_eq!(artifact.file("members.txt"), Some(Utf8Path::new("work/ab/cd/members.txt")));
        assert!(artifact.file("missing.txt").is_none());
        assert!(artifact.require("missing.txt").is_err());
    }

    #[test]
    fn test_local_launcher_exit_codes() {
        let (_guard, dir) = tempdir();
        let abort = Abort::default();

        let ok = Invocation::new("sh").args(["-c", "echo hello > out.txt"]);
        assert_eq!(LocalLauncher.launch(&ok, &dir, &abort).unwrap(), Some(0));
        assert_eq!(fs::read_to_string(dir.join("out.txt")).unwrap(), "hello\n");

        let failing = Invocation::new("sh").args(["-c", "echo 'db missing' >&2; exit 3"]);
        assert_eq!(LocalLauncher.launch(&failing, &dir, &abort).unwrap(), Some(3));
        assert_eq!(stderr_tail(&dir), ": db missing");
    }

    #[test]
    fn test_local_launcher_killed_on_abort() {
        let (_guard, dir) = tempdir();
        let abort = Arc::new(Abort::default());

        let trigger = {
            let abort = abort.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(50));
                abort.trigger(PipelineError::task("other", "k", "failed"));
            })
        };

        let start = Instant::now();
        let sleep = Invocation::new("sleep").arg("10");
        assert_eq!(LocalLauncher.launch(&sleep, &dir, &abort).unwrap(), None);
        assert!(start.elapsed() < Duration::from_secs(5));
        trigger.join().unwrap();
    }

    #[test]
    fn test_missing_program() {
        let (_guard, dir) = tempdir();
        let inv = Invocation::new("definitely-not-a-real-program-annoflow");
        assert!(LocalLauncher.launch(&inv, &dir, &Abort::default()).is_err());
    }

    #[test]
    fn test_closure_launcher() {
        let (_guard, dir) = tempdir();
        let launcher = |inv: &Invocation, _: &Utf8Path| -> io::Result<i32> {
            Ok(if inv.program == "ok" { 0 } else { 1 })
        };

        let abort = Abort::default();
        assert_eq!(launcher.launch(&Invocation::new("ok"), &dir, &abort).unwrap(), Some(0));
        assert_eq!(launcher.launch(&Invocation::new("no"), &dir, &abort).unwrap(), Some(1));
    }
}
