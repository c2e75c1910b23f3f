use std::fmt::{Display, Formatter};
use std::num::NonZeroUsize;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use serde::Deserialize;

use crate::blueprint::Options;
use crate::engine::Resources;
use crate::error::PipelineError;

/// Configuration of an annotation run, read from a JSON file.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub input: Input,
    #[serde(default)]
    pub data: Data,
    #[serde(default)]
    pub steps: Steps,
    pub output: Output,
    #[serde(default)]
    pub run: Run,
    #[serde(default)]
    pub tools: Tools,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Input {
    pub file: Utf8PathBuf,
    /// Sequence type of the input, `nucl` or `prot`.
    #[serde(rename = "type")]
    pub kind: String,
}

/// Locations of the external databases.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Data {
    pub interproscan: Option<Utf8PathBuf>,
    pub nr: Option<Utf8PathBuf>,
    pub sprot: Option<Utf8PathBuf>,
    pub orthodb: Option<Utf8PathBuf>,
    pub string: Option<Utf8PathBuf>,
}

/// A step that only runs when enabled.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Step {
    #[serde(default)]
    pub enable: bool,
}

/// A step that runs unless disabled.
#[derive(Debug, Clone, Deserialize)]
pub struct EnabledStep {
    #[serde(default = "yes")]
    pub enable: bool,
}

impl Default for EnabledStep {
    fn default() -> Self {
        Self { enable: true }
    }
}

fn yes() -> bool {
    true
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct OrthoStep {
    #[serde(default)]
    pub enable: bool,
    /// Category the levels are resolved in.
    pub db: Option<String>,
    /// Comma separated levels; all levels of `db` when unset.
    pub levels: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Steps {
    pub interproscan: EnabledStep,
    pub nr: Step,
    pub sprot: Step,
    pub orthodb: OrthoStep,
    pub string: Step,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Output {
    pub dir: Utf8PathBuf,
}

/// A memory amount, either a byte count or a string such as `"8GB"`.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum Memory {
    Bytes(u64),
    Text(String),
}

impl Memory {
    pub fn bytes(&self) -> Result<u64, PipelineError> {
        match self {
            Memory::Bytes(bytes) => Ok(*bytes),
            Memory::Text(text) => parse_memory(text)
                .ok_or_else(|| PipelineError::configuration("run.memory", format!("cannot parse '{text}'"))),
        }
    }
}

fn parse_memory(text: &str) -> Option<u64> {
    let text = text.trim();
    let split = text
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(text.len());
    let (number, unit) = text.split_at(split);

    let number: f64 = number.parse().ok()?;
    let scale: u64 = match unit.trim().to_ascii_uppercase().as_str() {
        "" | "B" => 1,
        "K" | "KB" => 1 << 10,
        "M" | "MB" => 1 << 20,
        "G" | "GB" => 1 << 30,
        "T" | "TB" => 1 << 40,
        _ => return None,
    };

    Some((number * scale as f64) as u64)
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Run {
    /// Records per chunk.
    pub chunk_size: usize,
    /// Total CPUs, all available when unset.
    pub cpus: Option<usize>,
    pub memory: Memory,
    /// CPUs given to each search instance.
    pub threads: usize,
    pub work_dir: Utf8PathBuf,
    /// Seconds the final collection may wait for its producers.
    pub stall_timeout: u64,
}

impl Default for Run {
    fn default() -> Self {
        Self {
            chunk_size: 100,
            cpus: None,
            memory: Memory::Text("8GB".into()),
            threads: 1,
            work_dir: Utf8PathBuf::from("work"),
            stall_timeout: 24 * 3600,
        }
    }
}

/// Names of the external programs.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Tools {
    /// Defaults to `interproscan.sh` inside `data.interproscan`.
    pub interproscan: Option<String>,
    pub diamond: String,
    pub orthodb: String,
    pub report: String,
}

impl Default for Tools {
    fn default() -> Self {
        Self {
            interproscan: None,
            diamond: "diamond".into(),
            orthodb: "orthodb-levels".into(),
            report: "annotation-report".into(),
        }
    }
}

/// Search mode used by every cross-database branch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchMode {
    /// Nucleotide queries against a protein database.
    Blastx,
    /// Protein queries against a protein database.
    Blastp,
}

impl SearchMode {
    pub fn from_type(kind: &str) -> Result<Self, PipelineError> {
        match kind.trim().to_ascii_lowercase().as_str() {
            "nucl" | "nucleotide" | "dna" => Ok(SearchMode::Blastx),
            "prot" | "protein" | "aa" => Ok(SearchMode::Blastp),
            other => Err(PipelineError::configuration(
                "input.type",
                format!("unknown sequence type '{other}', expected 'nucl' or 'prot'"),
            )),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SearchMode::Blastx => "blastx",
            SearchMode::Blastp => "blastp",
        }
    }
}

impl Display for SearchMode {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Facts derived once from the configuration and shared by every task.
#[derive(Debug, Clone)]
pub struct Facts {
    /// File stem of the input, used to name the reports.
    pub basename: String,
    pub mode: SearchMode,
    pub config: Config,
}

fn absolute(key: &str, path: &Utf8Path) -> Result<Utf8PathBuf, PipelineError> {
    let path = std::path::absolute(path).map_err(|err| PipelineError::configuration(key, err.to_string()))?;

    Utf8PathBuf::from_path_buf(path)
        .map_err(|path| PipelineError::configuration(key, format!("{} is not valid UTF-8", path.display())))
}

impl Config {
    pub fn load(path: &Utf8Path) -> Result<Self, PipelineError> {
        let text = std::fs::read_to_string(path)
            .map_err(|err| PipelineError::configuration(path.as_str(), err.to_string()))?;

        Self::parse(&text)
    }

    pub fn parse(text: &str) -> Result<Self, PipelineError> {
        serde_json::from_str(text).map_err(|err| PipelineError::configuration("config", err.to_string()))
    }

    /// Resolves everything that is fixed for the whole run.
    ///
    /// Input and database paths are made absolute, since every command runs
    /// inside its own instance directory.
    pub fn facts(&self) -> Result<Facts, PipelineError> {
        let mode = SearchMode::from_type(&self.input.kind)?;

        let basename = self
            .input
            .file
            .file_stem()
            .filter(|stem| !stem.is_empty())
            .ok_or_else(|| PipelineError::configuration("input.file", "no file name"))?
            .to_string();

        if self.run.chunk_size == 0 {
            return Err(PipelineError::configuration(
                "run.chunk_size",
                "chunk size must be at least 1",
            ));
        }

        if self.run.threads == 0 {
            return Err(PipelineError::configuration(
                "run.threads",
                "at least one thread is needed",
            ));
        }

        let mut config = self.clone();
        config.input.file = absolute("input.file", &config.input.file)?;

        let data = &mut config.data;
        for (key, path) in [
            ("data.interproscan", &mut data.interproscan),
            ("data.nr", &mut data.nr),
            ("data.sprot", &mut data.sprot),
            ("data.orthodb", &mut data.orthodb),
            ("data.string", &mut data.string),
        ] {
            if let Some(path) = path {
                *path = absolute(key, path)?;
            }
        }

        // a bare program name is looked up on PATH
        if let Some(program) = &mut config.tools.interproscan
            && program.contains(std::path::MAIN_SEPARATOR)
        {
            *program = absolute("tools.interproscan", Utf8Path::new(program.as_str()))?.into_string();
        }

        Ok(Facts {
            basename,
            mode,
            config,
        })
    }

    pub fn options(&self) -> Result<Options, PipelineError> {
        let cpus = match self.run.cpus {
            Some(0) => {
                return Err(PipelineError::configuration("run.cpus", "at least one CPU is needed"));
            }
            Some(cpus) => cpus,
            None => std::thread::available_parallelism()
                .map(NonZeroUsize::get)
                .unwrap_or(1),
        };

        Ok(Options {
            work_dir: self.run.work_dir.clone(),
            budget: Resources::new(cpus, self.run.memory.bytes()?),
            stall_timeout: Duration::from_secs(self.run.stall_timeout),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"{
        "input": { "file": "data/proteins.fa", "type": "prot" },
        "output": { "dir": "results" }
    }"#;

    #[test]
    fn test_defaults() {
        let config = Config::parse(MINIMAL).unwrap();

        assert!(config.steps.interproscan.enable);
        assert!(!config.steps.orthodb.enable);
        assert_eq!(config.run.chunk_size, 100);
        assert_eq!(config.tools.diamond, "diamond");

        let facts = config.facts().unwrap();
        assert_eq!(facts.basename, "proteins");
        assert_eq!(facts.mode, SearchMode::Blastp);
        assert_eq!(config.options().unwrap().budget.memory, 8 << 30);
    }

    #[test]
    fn test_listed_step_keeps_its_default() {
        let config = Config::parse(&MINIMAL.replace(
            "\"output\"",
            "\"steps\": { \"interproscan\": {}, \"nr\": {} }, \"output\"",
        ))
        .unwrap();

        assert!(config.steps.interproscan.enable);
        assert!(!config.steps.nr.enable);
    }

    #[test]
    fn test_facts_resolve_paths() {
        let config = Config::parse(
            r#"{
                "input": { "file": "data/proteins.fa", "type": "prot" },
                "data": { "nr": "db/nr.fa", "orthodb": "/srv/odb" },
                "tools": { "interproscan": "bin/interproscan.sh" },
                "output": { "dir": "results" }
            }"#,
        )
        .unwrap();

        let facts = config.facts().unwrap();
        let resolved = &facts.config;
        let cwd = std::env::current_dir().unwrap();

        assert!(resolved.input.file.is_absolute());
        assert!(resolved.input.file.as_std_path().starts_with(&cwd));
        assert!(resolved.input.file.ends_with("data/proteins.fa"));
        assert_eq!(
            resolved.data.nr.as_ref().map(|path| path.as_std_path().to_path_buf()),
            Some(cwd.join("db/nr.fa"))
        );
        assert_eq!(resolved.data.orthodb.as_deref(), Some(Utf8Path::new("/srv/odb")));
        assert!(resolved.tools.interproscan.as_deref().is_some_and(|p| p.starts_with('/')));
        assert_eq!(facts.basename, "proteins");
        // the loaded configuration itself is left alone
        assert_eq!(config.input.file, "data/proteins.fa");
    }

    #[test]
    fn test_sequence_type_aliases() {
        for (kind, mode) in [
            ("nucl", SearchMode::Blastx),
            ("DNA", SearchMode::Blastx),
            ("nucleotide", SearchMode::Blastx),
            ("prot", SearchMode::Blastp),
            ("aa", SearchMode::Blastp),
            ("Protein", SearchMode::Blastp),
        ] {
            assert_eq!(SearchMode::from_type(kind).unwrap(), mode);
        }
    }

    #[test]
    fn test_unknown_sequence_type() {
        let config = Config::parse(&MINIMAL.replace("\"prot\"", "\"rna\"")).unwrap();

        match config.facts() {
            Err(PipelineError::Configuration { key, .. }) => assert_eq!(key, "input.type"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_parse_memory() {
        assert_eq!(parse_memory("8GB"), Some(8 << 30));
        assert_eq!(parse_memory("512 MB"), Some(512 << 20));
        assert_eq!(parse_memory("1.5g"), Some(3 << 29));
        assert_eq!(parse_memory("1024"), Some(1024));
        assert_eq!(parse_memory("lots"), None);
        assert_eq!(parse_memory("8 parsecs"), None);
    }

    #[test]
    fn test_run_section() {
        let config = Config::parse(
            r#"{
                "input": { "file": "proteins.fa", "type": "nucl" },
                "output": { "dir": "results" },
                "steps": { "orthodb": { "enable": true, "db": "eukaryota", "levels": "2759" } },
                "run": { "chunk_size": 10, "cpus": 2, "memory": 1073741824, "stall_timeout": 60 }
            }"#,
        )
        .unwrap();

        let options = config.options().unwrap();
        assert_eq!(options.budget, Resources::new(2, 1 << 30));
        assert_eq!(options.stall_timeout, Duration::from_secs(60));
        assert_eq!(config.steps.orthodb.db.as_deref(), Some("eukaryota"));
        assert!(config.steps.interproscan.enable);
    }

    #[test]
    fn test_zero_chunk_size() {
        let config = Config::parse(&MINIMAL.replace(
            "\"output\"",
            "\"run\": { \"chunk_size\": 0 }, \"output\"",
        ))
        .unwrap();

        match config.facts() {
            Err(PipelineError::Configuration { key, .. }) => assert_eq!(key, "run.chunk_size"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_malformed_json() {
        assert!(matches!(
            Config::parse("{ \"input\": "),
            Err(PipelineError::Configuration { .. })
        ));
    }
}
