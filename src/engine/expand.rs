use std::marker::PhantomData;

use petgraph::graph::NodeIndex;

use crate::core::{Key, Token};
use crate::engine::{Kind, Runtime, Shape, Source, TypedOperator};
use crate::error::PipelineError;

/// Turns each upstream token into zero or more tokens, one per identifier
/// returned by the parse function. Output keys are `upstream/identifier`.
pub(crate) struct Expander<T, U, F>
where
    T: Send + Sync + 'static,
    U: Send + Sync + 'static,
    F: Fn(&T) -> anyhow::Result<Vec<(String, U)>> + Send + Sync,
{
    pub source: Source<T>,
    pub parse: F,
    pub _phantom: PhantomData<fn() -> U>,
}

impl<T, U, F> Expander<T, U, F>
where
    T: Send + Sync + 'static,
    U: Send + Sync + 'static,
    F: Fn(&T) -> anyhow::Result<Vec<(String, U)>> + Send + Sync,
{
    fn expand(&self, node: &str, token: &Token<T>) -> Result<Vec<Token<U>>, PipelineError> {
        let members = (self.parse)(&token.payload).map_err(|err| PipelineError::ExpansionFormat {
            node: node.to_string(),
            key: token.key.to_string(),
            message: format!("{err:#}"),
        })?;

        Ok(members
            .into_iter()
            .map(|(ident, payload)| Token::new(token.key.child(&ident), payload))
            .collect())
    }
}

impl<G, T, U, F> TypedOperator<G> for Expander<T, U, F>
where
    G: Send + Sync,
    T: Send + Sync + 'static,
    U: Send + Sync + 'static,
    F: Fn(&T) -> anyhow::Result<Vec<(String, U)>> + Send + Sync,
{
    type Output = U;

    fn kind(&self) -> Kind {
        Kind::Expand
    }

    fn shape(&self) -> Shape {
        Shape::Stream
    }

    fn inputs(&self) -> Vec<NodeIndex> {
        vec![self.source.index()]
    }

    fn run(&self, rt: &Runtime<'_, G>) -> Result<(), PipelineError> {
        let sender = rt.sender::<U>()?;
        let mut emitted = 0;

        match &self.source {
            Source::Value(handle) => {
                let token = handle.get(rt.ports)?;
                for member in self.expand(rt.name, &token)? {
                    sender.send(member);
                    emitted += 1;
                }
            }
            Source::Stream(handle) => {
                let mut receiver = handle.subscribe(rt.ports)?;
                while let Some(token) = receiver
                    .recv()
                    .map_err(|err| PipelineError::channel(receiver.name(), err))?
                {
                    for member in self.expand(rt.name, &token)? {
                        sender.send(member);
                        emitted += 1;
                    }
                }
            }
        }

        tracing::debug!("Expander '{}' emitted {emitted} tokens", rt.name);
        sender.close();
        Ok(())
    }
}

/// A value known when the pipeline is built.
pub(crate) struct Constant<T> {
    pub value: Token<T>,
}

impl<G, T> TypedOperator<G> for Constant<T>
where
    G: Send + Sync,
    T: Send + Sync + 'static,
{
    type Output = T;

    fn kind(&self) -> Kind {
        Kind::Constant
    }

    fn shape(&self) -> Shape {
        Shape::Value
    }

    fn inputs(&self) -> Vec<NodeIndex> {
        vec![]
    }

    fn run(&self, rt: &Runtime<'_, G>) -> Result<(), PipelineError> {
        rt.setter::<T>()?.set(self.value.clone());
        Ok(())
    }
}

impl<T> Constant<T> {
    pub(crate) fn new(name: &str, value: T) -> Self {
        Self {
            value: Token::new(Key::new(name), value),
        }
    }
}

/// Parses a list of identifiers separated by commas and/or newlines.
///
/// Blank entries are skipped, so an empty or whitespace-only text yields an
/// empty list. Identifiers may only contain ASCII letters, digits and
/// `_ . : -`.
pub fn parse_member_list(text: &str) -> anyhow::Result<Vec<String>> {
    let mut members = Vec::new();

    for (line, entries) in text.lines().enumerate() {
        for entry in entries.split(',') {
            let entry = entry.trim();
            if entry.is_empty() {
                continue;
            }

            if let Some(bad) = entry
                .chars()
                .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | ':' | '-')))
            {
                anyhow::bail!(
                    "invalid character {bad:?} in identifier '{entry}' on line {}",
                    line + 1
                );
            }

            members.push(entry.to_string());
        }
    }

    Ok(members)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn expander() -> Expander<String, String, impl Fn(&String) -> anyhow::Result<Vec<(String, String)>>> {
        Expander {
            source: Source::Value(crate::engine::One::new(NodeIndex::new(0))),
            parse: |text: &String| {
                Ok(parse_member_list(text)?
                    .into_iter()
                    .map(|m| (m.clone(), m))
                    .collect())
            },
            _phantom: PhantomData,
        }
    }

    #[test]
    fn test_parse_member_list() {
        assert_eq!(
            parse_member_list("2759, 33208\n7742,\n\n").unwrap(),
            ["2759", "33208", "7742"]
        );
        assert!(parse_member_list("").unwrap().is_empty());
        assert!(parse_member_list(" \n , \n").unwrap().is_empty());
        assert!(parse_member_list("ok\nbad/level").is_err());
    }

    #[test]
    fn test_expand_keys_follow_upstream() {
        let token = Token::new("levels", "2759,33208,7742".to_string());
        let members = expander().expand("orthodb_levels", &token).unwrap();

        let keys: Vec<_> = members.iter().map(|t| t.key.to_string()).collect();
        assert_eq!(keys, ["levels/2759", "levels/33208", "levels/7742"]);
        assert_eq!(members[1].payload.as_str(), "33208");
    }

    #[test]
    fn test_expand_empty_list() {
        let token = Token::new("levels", String::new());
        assert!(expander().expand("orthodb_levels", &token).unwrap().is_empty());
    }

    #[test]
    fn test_expand_malformed() {
        let token = Token::new("levels", "2759;33208".to_string());

        match expander().expand("orthodb_levels", &token) {
            Err(PipelineError::ExpansionFormat { node, key, .. }) => {
                assert_eq!(node, "orthodb_levels");
                assert_eq!(key, "levels");
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
