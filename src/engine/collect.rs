use std::time::Instant;

use petgraph::graph::NodeIndex;

use crate::core::{Key, Token};
use crate::engine::{Kind, Many, Runtime, Shape, TypedOperator};
use crate::error::{ChannelError, PipelineError};

/// Waits for every surviving producer to close and emits the complete set
/// exactly once.
///
/// Inputs pruned at plan time are skipped, so a collector downstream of a
/// disabled branch closes with whatever the remaining branches produced.
/// Tokens are ordered by input declaration, then by arrival.
pub(crate) struct Collector<T> {
    pub inputs: Vec<Many<T>>,
}

impl<G, T> TypedOperator<G> for Collector<T>
where
    G: Send + Sync,
    T: Send + Sync + 'static,
{
    type Output = Vec<Token<T>>;

    fn kind(&self) -> Kind {
        Kind::Collect
    }

    fn shape(&self) -> Shape {
        Shape::Value
    }

    fn inputs(&self) -> Vec<NodeIndex> {
        self.inputs.iter().map(Many::index).collect()
    }

    fn run(&self, rt: &Runtime<'_, G>) -> Result<(), PipelineError> {
        let setter = rt.setter::<Vec<Token<T>>>()?;

        // subscribe before reading so no producer runs ahead of its slot
        let mut receivers = Vec::new();
        for input in self.inputs.iter().filter(|input| rt.is_active(input.index())) {
            receivers.push(input.subscribe(rt.ports)?);
        }

        let mut set = Vec::new();
        for mut receiver in receivers {
            loop {
                let deadline = rt.progress.deadline(rt.stall_timeout);
                match receiver.recv_until(Some(deadline)) {
                    Ok(Some(token)) => {
                        rt.progress.mark();
                        set.push(token);
                    }
                    Ok(None) => break,
                    // another input or instance moved in the meantime
                    Err(ChannelError::TimedOut) if rt.progress.deadline(rt.stall_timeout) > Instant::now() => {}
                    Err(ChannelError::TimedOut) => {
                        return Err(PipelineError::Stall {
                            node: rt.name.to_string(),
                            waited: rt.stall_timeout,
                        });
                    }
                    Err(err) => return Err(PipelineError::channel(receiver.name(), err)),
                }
            }
        }

        tracing::info!("Collected {} results in '{}'", set.len(), rt.name);
        setter.set(Token::new(Key::new(rt.name), set));
        Ok(())
    }
}
