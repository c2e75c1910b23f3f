use std::time::Duration;

use camino::Utf8PathBuf;
use thiserror::Error;

/// Errors observed while waiting on a channel or a value cell.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ChannelError {
    #[error("run aborted")]
    Aborted,

    #[error("producer failed before closing the channel")]
    ProducerFailed,

    #[error("timed out waiting for the producer")]
    TimedOut,

    #[error("channel has no free consumer slot")]
    AlreadyConsumed,
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Configuration error in `{key}`: {message}")]
    Configuration { key: String, message: String },

    #[error("Precondition '{check}' of step '{gate}' failed for {path} (check `{key}`)")]
    Precondition {
        gate: String,
        check: String,
        key: String,
        path: Utf8PathBuf,
    },

    #[error("Input file not found: {path}")]
    InputNotFound { path: Utf8PathBuf },

    #[error("Malformed input {path}, line {line}: {message}")]
    InputFormat {
        path: Utf8PathBuf,
        line: usize,
        message: String,
    },

    #[error("Expansion '{node}' received a malformed list from '{key}': {message}")]
    ExpansionFormat {
        node: String,
        key: String,
        message: String,
    },

    #[error("Task '{task}' failed for '{key}': {message}")]
    TaskExecution {
        task: String,
        key: String,
        message: String,
    },

    #[error("Collector '{node}' stalled: upstream did not close within {waited:?}")]
    Stall { node: String, waited: Duration },

    #[error("Cycle detected in pipeline graph at '{node}'")]
    Cycle { node: String },

    #[error("Channel '{name}': {source}")]
    Channel {
        name: String,
        #[source]
        source: ChannelError,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl PipelineError {
    pub(crate) fn configuration(key: impl Into<String>, message: impl Into<String>) -> Self {
        PipelineError::Configuration {
            key: key.into(),
            message: message.into(),
        }
    }

    pub(crate) fn task(
        task: impl Into<String>,
        key: impl ToString,
        message: impl Into<String>,
    ) -> Self {
        PipelineError::TaskExecution {
            task: task.into(),
            key: key.to_string(),
            message: message.into(),
        }
    }

    pub(crate) fn channel(name: impl Into<String>, source: ChannelError) -> Self {
        PipelineError::Channel {
            name: name.into(),
            source,
        }
    }

    /// A secondary error only reports that some other component failed first.
    /// It never wins over the error that caused it.
    pub fn is_secondary(&self) -> bool {
        matches!(
            self,
            PipelineError::Channel {
                source: ChannelError::Aborted | ChannelError::ProducerFailed,
                ..
            }
        )
    }
}
