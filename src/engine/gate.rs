//! Pre-flight validation of optional pipeline branches.

use camino::{Utf8Path, Utf8PathBuf};

use crate::error::PipelineError;

/// Identifies a gate registered on a blueprint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GateId(pub(crate) usize);

type Lookup<G, T> = Box<dyn Fn(&G) -> Option<T> + Send + Sync>;

enum Probe<G> {
    /// The path must exist.
    Exists(Lookup<G, Utf8PathBuf>),
    /// The path must be a directory with at least one entry.
    NonEmptyDir(Lookup<G, Utf8PathBuf>),
    /// The value must be set and not blank.
    Value(Lookup<G, String>),
    /// Anything else.
    Predicate(Box<dyn Fn(&G) -> bool + Send + Sync>),
}

struct Check<G> {
    name: String,
    /// Configuration key the user should fix when the check fails.
    key: String,
    probe: Probe<G>,
}

/// A named set of startup checks guarding a branch of the pipeline.
///
/// Gates are evaluated once, in declaration order, before anything runs.
/// A disabled gate prunes every node attached to it; an enabled gate whose
/// checks fail stops the run with [`PipelineError::Precondition`].
pub struct Gate<G> {
    name: String,
    enabled: Box<dyn Fn(&G) -> bool + Send + Sync>,
    checks: Vec<Check<G>>,
}

impl<G> Gate<G> {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            enabled: Box::new(|_: &G| true),
            checks: Vec::new(),
        }
    }

    /// Enables the gate only when `predicate` holds for the run facts.
    pub fn when<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&G) -> bool + Send + Sync + 'static,
    {
        self.enabled = Box::new(predicate);
        self
    }

    pub fn require_path<F>(self, key: impl Into<String>, path: F) -> Self
    where
        F: Fn(&G) -> Option<Utf8PathBuf> + Send + Sync + 'static,
    {
        self.check("path exists", key, Probe::Exists(Box::new(path)))
    }

    pub fn require_dir<F>(self, key: impl Into<String>, path: F) -> Self
    where
        F: Fn(&G) -> Option<Utf8PathBuf> + Send + Sync + 'static,
    {
        self.check("directory not empty", key, Probe::NonEmptyDir(Box::new(path)))
    }

    pub fn require_value<F>(self, key: impl Into<String>, value: F) -> Self
    where
        F: Fn(&G) -> Option<String> + Send + Sync + 'static,
    {
        self.check("value set", key, Probe::Value(Box::new(value)))
    }

    pub fn require<F>(self, name: impl Into<String>, key: impl Into<String>, predicate: F) -> Self
    where
        F: Fn(&G) -> bool + Send + Sync + 'static,
    {
        self.check(name, key, Probe::Predicate(Box::new(predicate)))
    }

    fn check(mut self, name: impl Into<String>, key: impl Into<String>, probe: Probe<G>) -> Self {
        self.checks.push(Check {
            name: name.into(),
            key: key.into(),
            probe,
        });
        self
    }

    /// Returns whether the gate is open.
    pub fn evaluate(&self, data: &G) -> Result<bool, PipelineError> {
        if !(self.enabled)(data) {
            tracing::info!("Step '{}' disabled", self.name);
            return Ok(false);
        }

        for check in &self.checks {
            if let Some(path) = check.failure(data) {
                return Err(PipelineError::Precondition {
                    gate: self.name.clone(),
                    check: check.name.clone(),
                    key: check.key.clone(),
                    path,
                });
            }
        }

        Ok(true)
    }
}

impl<G> Check<G> {
    /// The offending path or value when the check fails.
    fn failure(&self, data: &G) -> Option<Utf8PathBuf> {
        let unset = || Some(Utf8PathBuf::from("<unset>"));

        match &self.probe {
            Probe::Exists(lookup) => match lookup(data) {
                Some(path) if path.exists() => None,
                Some(path) => Some(path),
                None => unset(),
            },
            Probe::NonEmptyDir(lookup) => match lookup(data) {
                Some(path) if is_non_empty_dir(&path) => None,
                Some(path) => Some(path),
                None => unset(),
            },
            Probe::Value(lookup) => match lookup(data) {
                Some(value) if !value.trim().is_empty() => None,
                Some(value) => Some(Utf8PathBuf::from(value)),
                None => unset(),
            },
            Probe::Predicate(predicate) if predicate(data) => None,
            Probe::Predicate(_) => Some(Utf8PathBuf::from(self.key.as_str())),
        }
    }
}

fn is_non_empty_dir(path: &Utf8Path) -> bool {
    path.read_dir_utf8()
        .map(|mut entries| entries.next().is_some())
        .unwrap_or(false)
}
