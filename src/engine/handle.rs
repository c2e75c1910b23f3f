//! Typed references to the outputs of operators in the pipeline graph.
//!
//! The graph itself is type-erased: every port is stored as
//! `Arc<dyn Any + Send + Sync>`. Handles carry no data, only the node index
//! and the payload type in `PhantomData`, so the compiler checks that a
//! consumer asks for exactly the type its producer emits. The downcast at run
//! time is the bridge and can only fail if that guarantee was bypassed.

use std::marker::PhantomData;
use std::sync::Arc;

use petgraph::graph::NodeIndex;

use crate::channel::{Abort, Channel, Receiver, ValueCell};
use crate::core::{Dynamic, Token};
use crate::engine::Ports;
use crate::error::PipelineError;

/// A stream of tokens produced by a node, possibly of unknown length.
///
/// Every consumer holding a `Many<T>` receives every token in producer
/// order. When more than one consumer survives planning the underlying
/// channel becomes a broadcast.
#[derive(Debug, PartialEq, Eq, Hash)]
pub struct Many<T> {
    pub(crate) index: NodeIndex,
    _phantom: PhantomData<fn() -> T>,
}

impl<T> Many<T> {
    pub(crate) fn new(index: NodeIndex) -> Self {
        Self {
            index,
            _phantom: PhantomData,
        }
    }

    /// Returns the underlying `NodeIndex` of the producer in the graph.
    pub fn index(&self) -> NodeIndex {
        self.index
    }
}

impl<T> Clone for Many<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Many<T> {}

impl<T> Many<T>
where
    T: Send + Sync + 'static,
{
    pub(crate) fn subscribe(&self, ports: &Ports) -> Result<Receiver<T>, PipelineError> {
        let channel = ports.stream::<T>(self.index);
        channel
            .subscribe()
            .map_err(|err| PipelineError::channel(channel.name(), err))
    }
}

/// A single value produced once by a node and readable by any number of
/// consumers, for example a prebuilt search index or a collected set.
#[derive(Debug, PartialEq, Eq, Hash)]
pub struct One<T> {
    pub(crate) index: NodeIndex,
    _phantom: PhantomData<fn() -> T>,
}

impl<T> One<T> {
    pub(crate) fn new(index: NodeIndex) -> Self {
        Self {
            index,
            _phantom: PhantomData,
        }
    }

    /// Returns the underlying `NodeIndex` of the producer in the graph.
    pub fn index(&self) -> NodeIndex {
        self.index
    }
}

impl<T> Clone for One<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for One<T> {}

impl<T> One<T>
where
    T: Send + Sync + 'static,
{
    /// Blocks until the producer sets the value.
    pub(crate) fn get(&self, ports: &Ports) -> Result<Token<T>, PipelineError> {
        let cell = ports.value::<T>(self.index);
        cell.get(None)
            .map_err(|err| PipelineError::channel(cell.name(), err))
    }
}

/// Upstream of an operator that accepts either shape of output.
pub enum Source<T> {
    Stream(Many<T>),
    Value(One<T>),
}

impl<T> Source<T> {
    pub(crate) fn index(&self) -> NodeIndex {
        match self {
            Source::Stream(handle) => handle.index,
            Source::Value(handle) => handle.index,
        }
    }
}

impl<T> From<Many<T>> for Source<T> {
    fn from(value: Many<T>) -> Self {
        Source::Stream(value)
    }
}

impl<T> From<One<T>> for Source<T> {
    fn from(value: One<T>) -> Self {
        Source::Value(value)
    }
}

pub(crate) fn stream_port<T>(name: &str, consumers: usize, abort: &Arc<Abort>) -> Dynamic
where
    T: Send + Sync + 'static,
{
    Channel::<T>::new(name, consumers, abort.clone())
}

pub(crate) fn value_port<T>(name: &str, abort: &Arc<Abort>) -> Dynamic
where
    T: Send + Sync + 'static,
{
    ValueCell::<T>::new(name, abort.clone())
}

/// A set of value dependencies awaited before a task starts any instance.
///
/// Implemented for `()`, for a single [`One<T>`] and for tuples of them. When
/// resolved, every handle turns into the [`Token`] its producer set.
pub trait Values: Send + Sync {
    /// The resolved tokens, e.g. `(Token<A>, Token<B>)` for `(One<A>, One<B>)`.
    type Output: Send + Sync;

    /// Returns the [`NodeIndex`] of each producer.
    fn indices(&self) -> Vec<NodeIndex>;

    /// Waits for every value and returns the resolved tokens.
    fn resolve(&self, ports: &Ports) -> Result<Self::Output, PipelineError>;
}

impl Values for () {
    type Output = ();

    fn indices(&self) -> Vec<NodeIndex> {
        vec![]
    }

    fn resolve(&self, _: &Ports) -> Result<Self::Output, PipelineError> {
        Ok(())
    }
}

impl<T> Values for One<T>
where
    T: Send + Sync + 'static,
{
    type Output = Token<T>;

    fn indices(&self) -> Vec<NodeIndex> {
        vec![self.index]
    }

    fn resolve(&self, ports: &Ports) -> Result<Self::Output, PipelineError> {
        self.get(ports)
    }
}

macro_rules! impl_values {
    ($($T:ident),*) => {
        #[allow(non_snake_case)]
        impl<$($T: Send + Sync + 'static),*> Values for ($(One<$T>,)*) {
            type Output = ($(Token<$T>,)*);

            fn indices(&self) -> Vec<NodeIndex> {
                let ($($T,)*) = self;
                vec![$($T.index),*]
            }

            fn resolve(&self, ports: &Ports) -> Result<Self::Output, PipelineError> {
                let ($($T,)*) = self;
                Ok(($($T.get(ports)?,)*))
            }
        }
    };
}

impl_values!(A);
impl_values!(A, B);
impl_values!(A, B, C);
impl_values!(A, B, C, D);
impl_values!(A, B, C, D, E);
impl_values!(A, B, C, D, E, F);
