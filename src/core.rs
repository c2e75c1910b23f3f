use std::any::Any;
use std::fmt::{Debug, Display, Formatter};
use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};

/// A type-erased, thread-safe container.
pub(crate) type Dynamic = Arc<dyn Any + Send + Sync>;

/// Atomic reference-counted string type used for identifiers.
pub(crate) type ArcStr = Arc<str>;

/// A 32-byte BLAKE3 hash.
///
/// Used to derive the work directory of every task instance from the node
/// name and the key of the token it processes, so reruns with identical
/// inputs land in the same place.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub(crate) struct Hash32([u8; 32]);

impl<T> From<T> for Hash32
where
    T: Into<[u8; 32]>,
{
    fn from(value: T) -> Self {
        Hash32(value.into())
    }
}

impl Hash32 {
    pub(crate) fn hash_parts<'a>(parts: impl IntoIterator<Item = &'a str>) -> Self {
        let mut hasher = blake3::Hasher::new();
        for part in parts {
            // length prefix keeps ("ab", "c") apart from ("a", "bc")
            hasher.update(&(part.len() as u64).to_le_bytes());
            hasher.update(part.as_bytes());
        }
        hasher.finalize().into()
    }

    pub(crate) fn to_hex(self) -> String {
        const HEX: &[u8; 16] = b"0123456789abcdef";
        let mut acc = String::with_capacity(64);

        for byte in self.0 {
            acc.push(HEX[(byte >> 4) as usize] as char);
            acc.push(HEX[(byte & 0xF) as usize] as char);
        }

        acc
    }
}

impl Debug for Hash32 {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Hash32({})", self.to_hex())
    }
}

/// Stable identity of a logical record as it flows through the graph.
///
/// Keys are derived once by the splitter and carried unchanged by every
/// transformation concerning the same record. Expansion appends a member
/// (`upstream/member`) and cross joins concatenate both sides (`a+b`).
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Key(ArcStr);

impl Key {
    pub fn new(key: impl AsRef<str>) -> Self {
        Key(Arc::from(key.as_ref()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Key of a member produced from this token by an expansion.
    pub fn child(&self, member: &str) -> Key {
        Key::new(format!("{}/{}", self.0, member))
    }

    /// Key of a pair produced by a cross join.
    pub fn cross(left: &Key, right: &Key) -> Key {
        Key::new(format!("{}+{}", left.0, right.0))
    }
}

impl Display for Key {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl Debug for Key {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Key({})", self.0)
    }
}

impl From<&str> for Key {
    fn from(value: &str) -> Self {
        Key::new(value)
    }
}

impl From<String> for Key {
    fn from(value: String) -> Self {
        Key(Arc::from(value))
    }
}

/// One unit of data on a channel: a stable key plus a shared payload.
///
/// Tokens are immutable once created. Cloning a token only bumps the
/// reference count of its payload, which is released once the last consumer
/// lets go of it.
pub struct Token<T> {
    pub key: Key,
    pub payload: Arc<T>,
}

impl<T> Token<T> {
    pub fn new(key: impl Into<Key>, payload: T) -> Self {
        Self {
            key: key.into(),
            payload: Arc::new(payload),
        }
    }
}

impl<T> Clone for Token<T> {
    fn clone(&self) -> Self {
        Self {
            key: self.key.clone(),
            payload: self.payload.clone(),
        }
    }
}

impl<T: Debug> Debug for Token<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Token")
            .field("key", &self.key)
            .field("payload", &self.payload)
            .finish()
    }
}

/// Global, run-scoped state available to every task.
///
/// Built once when the run starts and shared by reference afterwards; nothing
/// in it changes during a run.
#[derive(Clone)]
pub struct Environment<D: Send + Sync = ()> {
    /// The name of the engine (defaults to "annoflow").
    pub generator: &'static str,
    /// Root directory for split chunks and task work directories.
    pub work_dir: Utf8PathBuf,
    /// User-defined run facts.
    pub data: D,
}

impl<D> Debug for Environment<D>
where
    D: Send + Sync + Debug,
{
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Environment")
            .field("generator", &self.generator)
            .field("work_dir", &self.work_dir)
            .field("data", &self.data)
            .finish()
    }
}

impl<D: Send + Sync> Environment<D> {
    /// Content-addressed work directory of one task instance.
    pub fn instance_dir(&self, node: &str, key: &Key) -> Utf8PathBuf {
        let hex = Hash32::hash_parts([node, key.as_str()]).to_hex();
        self.work_dir.join(&hex[..2]).join(&hex[2..32])
    }
}

/// The context passed to every task command builder.
pub struct TaskContext<'a, G: Send + Sync = ()> {
    /// Access to global configuration and data.
    pub env: &'a Environment<G>,
    /// Key of the token this instance processes.
    pub key: &'a Key,
    /// Fresh, empty working directory of this instance.
    pub workdir: &'a Utf8Path,
    /// Tracing span assigned to this instance.
    pub(crate) span: tracing::Span,
}

impl<G: Send + Sync> TaskContext<'_, G> {
    pub fn span(&self) -> &tracing::Span {
        &self.span
    }
}
