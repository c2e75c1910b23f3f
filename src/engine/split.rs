//! Splitting one input file into chunk files of bounded record count.

use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Lines, Write};
use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};
use petgraph::graph::NodeIndex;

use crate::core::Token;
use crate::engine::{Kind, Runtime, Shape, TypedOperator};
use crate::error::PipelineError;

/// Role of a single line within a record-oriented file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Line {
    /// The line opens a new record.
    Start,
    /// The line belongs to the current record.
    Body,
    /// The line carries nothing and is dropped.
    Skip,
}

/// A line-oriented record format.
pub trait RecordFormat: Send + Sync {
    /// Classifies one line, or explains why it is not valid input.
    fn classify(&self, line: &str) -> Result<Line, String>;

    /// Extension given to chunk files when the input has none.
    fn extension(&self) -> &'static str;
}

/// FASTA: records open with a `>` header naming the sequence.
#[derive(Debug, Clone, Copy, Default)]
pub struct Fasta;

impl RecordFormat for Fasta {
    fn classify(&self, line: &str) -> Result<Line, String> {
        let line = line.trim_end();

        if line.is_empty() {
            return Ok(Line::Skip);
        }

        match line.strip_prefix('>') {
            Some(header) if header.split_whitespace().next().is_some() => Ok(Line::Start),
            Some(_) => Err("record header without an identifier".into()),
            None => Ok(Line::Body),
        }
    }

    fn extension(&self) -> &'static str {
        "fa"
    }
}

/// Streaming record reader, holding at most one record at a time.
struct Records<'a, R> {
    lines: Lines<R>,
    format: &'a dyn RecordFormat,
    path: &'a Utf8Path,
    line: usize,
    current: Option<String>,
}

impl<'a> Records<'a, BufReader<File>> {
    fn open(path: &'a Utf8Path, format: &'a dyn RecordFormat) -> Result<Self, PipelineError> {
        let file = File::open(path)?;

        Ok(Self {
            lines: BufReader::new(file).lines(),
            format,
            path,
            line: 0,
            current: None,
        })
    }
}

impl<R: BufRead> Records<'_, R> {
    fn malformed(&self, message: impl Into<String>) -> PipelineError {
        PipelineError::InputFormat {
            path: self.path.to_owned(),
            line: self.line,
            message: message.into(),
        }
    }
}

impl<R: BufRead> Iterator for Records<'_, R> {
    type Item = Result<String, PipelineError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let Some(line) = self.lines.next() else {
                return self.current.take().map(Ok);
            };
            self.line += 1;

            let line = match line {
                Ok(line) => line,
                Err(err) => return Some(Err(self.malformed(err.to_string()))),
            };

            match self.format.classify(&line) {
                Err(message) => return Some(Err(self.malformed(message))),
                Ok(Line::Skip) => continue,
                Ok(Line::Start) => {
                    let previous = self.current.replace(line + "\n");
                    if previous.is_some() {
                        return previous.map(Ok);
                    }
                }
                Ok(Line::Body) => {
                    if self.current.is_none() {
                        return Some(Err(
                            self.malformed("sequence data before the first record header")
                        ));
                    }
                    if let Some(record) = &mut self.current {
                        record.push_str(&line);
                        record.push('\n');
                    }
                }
            }
        }
    }
}

/// One chunk file written by the splitter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub path: Utf8PathBuf,
    /// Number of records in the chunk.
    pub records: usize,
    /// 1-based position of the chunk.
    pub index: usize,
}

/// Lazily writes chunk files while the records are read.
struct Chunks<'a, R> {
    records: Records<'a, R>,
    dir: &'a Utf8Path,
    stem: &'a str,
    ext: &'a str,
    size: usize,
    index: usize,
}

impl<R: BufRead> Chunks<'_, R> {
    fn write(&mut self, first: String) -> Result<Token<Chunk>, PipelineError> {
        self.index += 1;

        let key = format!("{}.{}", self.stem, self.index);
        let path = self.dir.join(format!("{key}.{}", self.ext));
        let mut file = BufWriter::new(File::create(&path)?);

        file.write_all(first.as_bytes())?;
        let mut records = 1;

        while records < self.size {
            match self.records.next() {
                Some(record) => file.write_all(record?.as_bytes())?,
                None => break,
            }
            records += 1;
        }

        file.flush()?;

        Ok(Token::new(
            key,
            Chunk {
                path,
                records,
                index: self.index,
            },
        ))
    }
}

impl<R: BufRead> Iterator for Chunks<'_, R> {
    type Item = Result<Token<Chunk>, PipelineError>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.records.next()? {
            Ok(first) => Some(self.write(first)),
            Err(err) => Some(Err(err)),
        }
    }
}

/// Splits one input file into chunks of at most `chunk_size` records.
///
/// The input is read twice: a validation pass first, so that a missing or
/// malformed file fails before any chunk is emitted, and then the streaming
/// pass that writes the chunks. Chunk `i` of `proteins.fa` is written as
/// `proteins.i.fa` and keyed `proteins.i`.
pub struct Splitter {
    input: Utf8PathBuf,
    chunk_size: usize,
    format: Arc<dyn RecordFormat>,
}

impl Splitter {
    pub fn new(input: impl Into<Utf8PathBuf>, chunk_size: usize, format: impl RecordFormat + 'static) -> Self {
        Self {
            input: input.into(),
            chunk_size,
            format: Arc::new(format),
        }
    }

    pub fn fasta(input: impl Into<Utf8PathBuf>, chunk_size: usize) -> Self {
        Self::new(input, chunk_size, Fasta)
    }

    /// Counts the records, failing on the first malformed line.
    fn validate_input(&self) -> Result<usize, PipelineError> {
        if !self.input.is_file() {
            return Err(PipelineError::InputNotFound {
                path: self.input.clone(),
            });
        }

        Records::open(&self.input, self.format.as_ref())?
            .try_fold(0, |count, record| record.map(|_| count + 1))
    }

    fn chunks<'a>(&'a self, dir: &'a Utf8Path) -> Result<Chunks<'a, BufReader<File>>, PipelineError> {
        Ok(Chunks {
            records: Records::open(&self.input, self.format.as_ref())?,
            dir,
            stem: self.input.file_stem().unwrap_or("input"),
            ext: self.input.extension().unwrap_or(self.format.extension()),
            size: self.chunk_size,
            index: 0,
        })
    }
}

impl<G: Send + Sync> TypedOperator<G> for Splitter {
    type Output = Chunk;

    fn kind(&self) -> Kind {
        Kind::Split
    }

    fn shape(&self) -> Shape {
        Shape::Stream
    }

    fn inputs(&self) -> Vec<NodeIndex> {
        vec![]
    }

    fn validate(&self, name: &str) -> Result<(), PipelineError> {
        if self.chunk_size == 0 {
            return Err(PipelineError::configuration(
                format!("{name}.chunk_size"),
                "chunk size must be at least 1",
            ));
        }
        Ok(())
    }

    fn run(&self, rt: &Runtime<'_, G>) -> Result<(), PipelineError> {
        let sender = rt.sender::<Chunk>()?;

        let total = self.validate_input()?;
        tracing::info!(
            "Splitting {} ({total} records) into chunks of {}",
            self.input,
            self.chunk_size
        );

        let dir = rt.env.work_dir.join(rt.name);
        if dir.exists() {
            fs::remove_dir_all(&dir)?;
        }
        fs::create_dir_all(&dir)?;

        for chunk in self.chunks(&dir)? {
            rt.check_abort()?;
            sender.send(chunk?);
        }

        sender.close();
        Ok(())
    }
}
