#![forbid(unsafe_code)]
#![doc = include_str!("../README.md")]

mod blueprint;
mod channel;
mod core;
mod engine;
mod error;

pub mod annotate;
pub mod utils;

pub use crate::blueprint::{Blueprint, EachBinder, OnceBinder, Options, Pipeline, TaskDef};
pub use crate::channel::{Abort, Channel, Mode, Receiver, Recv, Sender, ValueCell, ValueSetter};
pub use crate::core::{Environment, Key, TaskContext, Token};
pub use crate::engine::runner::{Diagnostics, InstanceRecord, TaskExecution};
pub use crate::engine::{
    Artifact, Chunk, Fasta, Gate, GateId, Invocation, Kind, Launcher, Line, LocalLauncher, Many,
    One, Pair, Ports, RecordFormat, Resources, Source, Splitter, Values, parse_member_list,
};
pub use crate::error::{ChannelError, PipelineError};
