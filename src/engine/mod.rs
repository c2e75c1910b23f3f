mod budget;
mod collect;
mod cross;
mod expand;
mod gate;
mod handle;
mod split;
mod task;

pub(crate) mod runner;

use std::any::type_name;
use std::borrow::Cow;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use petgraph::graph::NodeIndex;

use crate::channel::{Abort, Channel, Sender, ValueCell, ValueSetter};
use crate::core::{Dynamic, Environment};
use crate::error::PipelineError;

pub use crate::engine::budget::Resources;
pub use crate::engine::cross::Pair;
pub use crate::engine::gate::{Gate, GateId};
pub use crate::engine::handle::{Many, One, Source, Values};
pub use crate::engine::split::{Chunk, Fasta, Line, RecordFormat, Splitter};
pub use crate::engine::task::{Artifact, Invocation, Launcher, LocalLauncher};
pub use crate::engine::expand::parse_member_list;

pub(crate) use crate::engine::budget::Budget;
pub(crate) use crate::engine::collect::Collector;
pub(crate) use crate::engine::cross::CrossJoiner;
pub(crate) use crate::engine::expand::{Constant, Expander};
pub(crate) use crate::engine::runner::{InstanceRecord, Progress};
pub(crate) use crate::engine::task::{EachTask, OnceTask};

/// What an operator does with its inputs, used by planning and diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    Split,
    Constant,
    Task,
    Expand,
    Cross,
    Collect,
}

/// Shape of the port an operator writes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Shape {
    Stream,
    Value,
}

pub(crate) trait TypedOperator<G: Send + Sync = ()>: Send + Sync {
    /// The concrete payload type this operator emits.
    type Output: Send + Sync + 'static;

    fn kind(&self) -> Kind;

    fn shape(&self) -> Shape;

    fn inputs(&self) -> Vec<NodeIndex>;

    fn resources(&self) -> Option<Resources> {
        None
    }

    /// Static checks performed once at plan time.
    fn validate(&self, _: &str) -> Result<(), PipelineError> {
        Ok(())
    }

    fn run(&self, rt: &Runtime<'_, G>) -> Result<(), PipelineError>;
}

/// Type-erased operator stored in the pipeline graph.
pub(crate) trait Operator<G: Send + Sync = ()>: Send + Sync {
    fn kind(&self) -> Kind;

    fn inputs(&self) -> Vec<NodeIndex>;

    fn resources(&self) -> Option<Resources>;

    fn output_type_name(&self) -> &'static str;

    fn validate(&self, name: &str) -> Result<(), PipelineError>;

    fn make_port(&self, name: &str, consumers: usize, abort: &Arc<Abort>) -> Dynamic;

    fn run(&self, rt: &Runtime<'_, G>) -> Result<(), PipelineError>;
}

// The erasure happens here: the typed output decides which port is built.
impl<G, T> Operator<G> for T
where
    G: Send + Sync,
    T: TypedOperator<G> + 'static,
{
    fn kind(&self) -> Kind {
        T::kind(self)
    }

    fn inputs(&self) -> Vec<NodeIndex> {
        T::inputs(self)
    }

    fn resources(&self) -> Option<Resources> {
        T::resources(self)
    }

    fn output_type_name(&self) -> &'static str {
        type_name::<T::Output>()
    }

    fn validate(&self, name: &str) -> Result<(), PipelineError> {
        T::validate(self, name)
    }

    fn make_port(&self, name: &str, consumers: usize, abort: &Arc<Abort>) -> Dynamic {
        match self.shape() {
            Shape::Stream => handle::stream_port::<T::Output>(name, consumers, abort),
            Shape::Value => handle::value_port::<T::Output>(name, abort),
        }
    }

    fn run(&self, rt: &Runtime<'_, G>) -> Result<(), PipelineError> {
        T::run(self, rt)
    }
}

pub(crate) type Predicate<G> = Arc<dyn Fn(&G) -> bool + Send + Sync>;

/// A node in the pipeline graph.
pub(crate) struct Node<G: Send + Sync> {
    pub name: Cow<'static, str>,
    pub gate: Option<GateId>,
    pub enabled: Option<Predicate<G>>,
    pub op: Arc<dyn Operator<G>>,
}

impl<G: Send + Sync> Node<G> {
    pub(crate) fn is_enabled(&self, data: &G) -> bool {
        self.enabled.as_ref().is_none_or(|predicate| predicate(data))
    }
}

/// The ports of every active node, created once at plan time.
pub struct Ports {
    map: HashMap<NodeIndex, Dynamic>,
}

impl Ports {
    pub(crate) fn new(map: HashMap<NodeIndex, Dynamic>) -> Self {
        Self { map }
    }

    fn port(&self, index: NodeIndex) -> Dynamic {
        self.map
            .get(&index)
            .cloned()
            .expect("Port requested for a node that was pruned")
    }

    pub(crate) fn stream<T>(&self, index: NodeIndex) -> Arc<Channel<T>>
    where
        T: Send + Sync + 'static,
    {
        self.port(index)
            .downcast::<Channel<T>>()
            .expect("Port type mismatch")
    }

    pub(crate) fn value<T>(&self, index: NodeIndex) -> Arc<ValueCell<T>>
    where
        T: Send + Sync + 'static,
    {
        self.port(index)
            .downcast::<ValueCell<T>>()
            .expect("Port type mismatch")
    }
}

/// Everything an operator needs while it runs.
pub(crate) struct Runtime<'a, G: Send + Sync> {
    pub name: &'a str,
    pub index: NodeIndex,
    pub env: &'a Environment<G>,
    pub ports: &'a Ports,
    pub abort: &'a Arc<Abort>,
    pub budget: &'a Budget,
    pub pool: &'a rayon::ThreadPool,
    pub launcher: &'a dyn Launcher,
    pub active: &'a HashSet<NodeIndex>,
    pub records: &'a Mutex<Vec<InstanceRecord>>,
    pub span: &'a tracing::Span,
    pub progress: &'a Progress,
    pub stall_timeout: Duration,
}

impl<G: Send + Sync> Runtime<'_, G> {
    pub(crate) fn sender<T>(&self) -> Result<Sender<T>, PipelineError>
    where
        T: Send + Sync + 'static,
    {
        self.ports
            .stream::<T>(self.index)
            .sender()
            .map_err(|err| PipelineError::channel(self.name, err))
    }

    pub(crate) fn setter<T>(&self) -> Result<ValueSetter<T>, PipelineError>
    where
        T: Send + Sync + 'static,
    {
        self.ports
            .value::<T>(self.index)
            .setter()
            .map_err(|err| PipelineError::channel(self.name, err))
    }

    pub(crate) fn is_active(&self, index: NodeIndex) -> bool {
        self.active.contains(&index)
    }

    /// Fails with a secondary error once another component aborted the run.
    pub(crate) fn check_abort(&self) -> Result<(), PipelineError> {
        if self.abort.is_set() {
            return Err(PipelineError::channel(
                self.name,
                crate::error::ChannelError::Aborted,
            ));
        }
        Ok(())
    }
}
