use std::time::Duration;

use petgraph::graph::NodeIndex;

use crate::channel::{Receiver, Recv, TICK};
use crate::core::{Key, Token};
use crate::engine::{Kind, Many, Runtime, Shape, TypedOperator};
use crate::error::PipelineError;

/// One element of a cross product.
#[derive(Debug)]
pub struct Pair<A, B> {
    pub left: Token<A>,
    pub right: Token<B>,
}

impl<A, B> Clone for Pair<A, B> {
    fn clone(&self) -> Self {
        Self {
            left: self.left.clone(),
            right: self.right.clone(),
        }
    }
}

impl<A, B> Pair<A, B> {
    fn token(left: &Token<A>, right: &Token<B>) -> Token<Self> {
        Token::new(
            Key::cross(&left.key, &right.key),
            Pair {
                left: left.clone(),
                right: right.clone(),
            },
        )
    }
}

/// One input of the join together with everything it delivered so far.
struct Side<T> {
    receiver: Receiver<T>,
    seen: Vec<Token<T>>,
    open: bool,
}

impl<T> Side<T> {
    fn new(receiver: Receiver<T>) -> Self {
        Self {
            receiver,
            seen: Vec::new(),
            open: true,
        }
    }

    /// Reads at most one token, noting when the side closes.
    fn step(&mut self, timeout: Duration) -> Result<Option<Token<T>>, PipelineError> {
        match self.receiver.poll(timeout) {
            Ok(Recv::Token(token)) => Ok(Some(token)),
            Ok(Recv::Empty) => Ok(None),
            Ok(Recv::Closed) => {
                self.open = false;
                Ok(None)
            }
            Err(err) => Err(PipelineError::channel(self.receiver.name(), err)),
        }
    }
}

/// Emits every `(left, right)` pair exactly once.
///
/// Symmetric streaming join: a token arriving on one side is paired with
/// every token already seen on the other, and is remembered only while the
/// other side can still deliver something to pair it with.
pub(crate) struct CrossJoiner<A, B> {
    pub left: Many<A>,
    pub right: Many<B>,
}

impl<G, A, B> TypedOperator<G> for CrossJoiner<A, B>
where
    G: Send + Sync,
    A: Send + Sync + 'static,
    B: Send + Sync + 'static,
{
    type Output = Pair<A, B>;

    fn kind(&self) -> Kind {
        Kind::Cross
    }

    fn shape(&self) -> Shape {
        Shape::Stream
    }

    fn inputs(&self) -> Vec<NodeIndex> {
        vec![self.left.index(), self.right.index()]
    }

    fn run(&self, rt: &Runtime<'_, G>) -> Result<(), PipelineError> {
        let sender = rt.sender::<Pair<A, B>>()?;
        let mut left = Side::new(self.left.subscribe(rt.ports)?);
        let mut right = Side::new(self.right.subscribe(rt.ports)?);

        let mut emitted = 0usize;
        let mut idle = false;

        while left.open || right.open {
            rt.check_abort()?;
            let mut progressed = false;

            if left.open {
                let wait = if idle { TICK } else { Duration::ZERO };
                if let Some(token) = left.step(wait)? {
                    for other in &right.seen {
                        sender.send(Pair::token(&token, other));
                        emitted += 1;
                    }
                    if right.open {
                        left.seen.push(token);
                    }
                    progressed = true;
                }
                if !left.open {
                    right.seen.clear();
                }
            }

            if right.open {
                let wait = if idle && !left.open { TICK } else { Duration::ZERO };
                if let Some(token) = right.step(wait)? {
                    for other in &left.seen {
                        sender.send(Pair::token(other, &token));
                        emitted += 1;
                    }
                    if left.open {
                        right.seen.push(token);
                    }
                    progressed = true;
                }
                if !right.open {
                    left.seen.clear();
                }
            }

            idle = !progressed;
        }

        tracing::debug!("Cross join '{}' emitted {emitted} pairs", rt.name);
        sender.close();
        Ok(())
    }
}
