//! Command lines of the external annotation tools.

use std::fmt::Write as _;

use anyhow::Context;
use camino::{Utf8Path, Utf8PathBuf};

use super::config::{Facts, SearchMode};
use crate::core::{TaskContext, Token};
use crate::engine::{Artifact, Chunk, Invocation, Pair};

pub const INTERPROSCAN: &str = "interproscan.tsv";
pub const HITS: &str = "hits.tsv";
pub const MEMBERS: &str = "members.txt";
pub const INPUTS: &str = "inputs.txt";

/// Tabular columns requested from every diamond search.
const OUTFMT: [&str; 13] = [
    "6", "qseqid", "sseqid", "pident", "length", "mismatch", "gapopen", "qstart", "qend",
    "sstart", "send", "evalue", "bitscore",
];

type Ctx<'a> = TaskContext<'a, Facts>;

fn data<'a>(path: &'a Option<Utf8PathBuf>, key: &str) -> anyhow::Result<&'a Utf8Path> {
    path.as_deref().with_context(|| format!("'{key}' is not set"))
}

fn threads(ctx: &Ctx<'_>) -> String {
    ctx.env.data.config.run.threads.to_string()
}

pub fn interproscan(ctx: &Ctx<'_>, chunk: &Token<Chunk>, _: &()) -> anyhow::Result<Invocation> {
    let config = &ctx.env.data.config;

    let program = match &config.tools.interproscan {
        Some(program) => program.clone(),
        None => data(&config.data.interproscan, "data.interproscan")?
            .join("interproscan.sh")
            .into_string(),
    };

    let seqtype = match ctx.env.data.mode {
        SearchMode::Blastx => "n",
        SearchMode::Blastp => "p",
    };

    Ok(Invocation::new(program)
        .args(["-i", chunk.payload.path.as_str()])
        .args(["-o", INTERPROSCAN])
        .args(["-f", "tsv", "-t", seqtype, "--goterms", "--pathways"])
        .args(["--cpu".to_string(), threads(ctx)])
        .output(INTERPROSCAN))
}

/// Builds a diamond index of one of the protein databases.
pub fn makedb(ctx: &Ctx<'_>, name: &str, source: &Utf8Path) -> anyhow::Result<Invocation> {
    let db = format!("{name}.dmnd");

    Ok(Invocation::new(&ctx.env.data.config.tools.diamond)
        .args(["makedb", "--in", source.as_str(), "--db", name])
        .args(["--threads".to_string(), threads(ctx)])
        .output(db))
}

/// Searches one chunk against a diamond index.
pub fn search(ctx: &Ctx<'_>, chunk: &Chunk, db: &Utf8Path) -> anyhow::Result<Invocation> {
    let facts = &ctx.env.data;

    Ok(Invocation::new(&facts.config.tools.diamond)
        .args([facts.mode.as_str(), "--query", chunk.path.as_str(), "--db", db.as_str()])
        .args(["--out", HITS, "--max-target-seqs", "5", "--evalue", "1e-5"])
        .args(["--threads".to_string(), threads(ctx)])
        .arg("--outfmt")
        .args(OUTFMT)
        .output(HITS))
}

pub fn nr_index(ctx: &Ctx<'_>, _: &()) -> anyhow::Result<Invocation> {
    makedb(ctx, "nr", data(&ctx.env.data.config.data.nr, "data.nr")?)
}

pub fn sprot_index(ctx: &Ctx<'_>, _: &()) -> anyhow::Result<Invocation> {
    makedb(ctx, "sprot", data(&ctx.env.data.config.data.sprot, "data.sprot")?)
}

pub fn nr_search(ctx: &Ctx<'_>, chunk: &Token<Chunk>, index: &Token<Artifact>) -> anyhow::Result<Invocation> {
    search(ctx, &chunk.payload, index.payload.require("nr.dmnd")?)
}

pub fn sprot_search(
    ctx: &Ctx<'_>,
    chunk: &Token<Chunk>,
    index: &Token<Artifact>,
) -> anyhow::Result<Invocation> {
    search(ctx, &chunk.payload, index.payload.require("sprot.dmnd")?)
}

pub fn string_search(ctx: &Ctx<'_>, chunk: &Token<Chunk>, _: &()) -> anyhow::Result<Invocation> {
    search(ctx, &chunk.payload, data(&ctx.env.data.config.data.string, "data.string")?)
}

/// Resolves the configured levels of an OrthoDB category into the member
/// list, one level identifier per line.
pub fn orthodb_levels(ctx: &Ctx<'_>, _: &()) -> anyhow::Result<Invocation> {
    let config = &ctx.env.data.config;
    let root = data(&config.data.orthodb, "data.orthodb")?;
    let step = &config.steps.orthodb;
    let db = step.db.as_deref().context("'steps.orthodb.db' is not set")?;

    let mut invocation = Invocation::new(&config.tools.orthodb)
        .args(["--data", root.as_str(), "--db", db, "--out", MEMBERS]);

    if let Some(levels) = &step.levels {
        invocation = invocation.args(["--levels", levels.as_str()]);
    }

    Ok(invocation.output(MEMBERS))
}

pub fn orthodb_search(ctx: &Ctx<'_>, pair: &Token<Pair<Chunk, String>>, _: &()) -> anyhow::Result<Invocation> {
    let config = &ctx.env.data.config;
    let root = data(&config.data.orthodb, "data.orthodb")?;
    let db = config.steps.orthodb.db.as_deref().context("'steps.orthodb.db' is not set")?;
    let level = pair.payload.right.payload.as_str();

    let index = root.join(db).join(format!("{level}.dmnd"));
    search(ctx, &pair.payload.left.payload, &index)
}

/// Merges every collected result into the final reports.
pub fn report(ctx: &Ctx<'_>, results: &Token<Vec<Token<Artifact>>>) -> anyhow::Result<Invocation> {
    let facts = &ctx.env.data;

    let mut listing = String::new();
    for result in results.payload.iter() {
        for file in &result.payload.files {
            writeln!(listing, "{}\t{}", result.key, file)?;
        }
    }

    tracing::debug!(parent: ctx.span(), "Listing {} results for the report", results.payload.len());

    let inputs = ctx.workdir.join(INPUTS);
    std::fs::write(&inputs, listing).with_context(|| format!("cannot write {inputs}"))?;

    let base = &facts.basename;
    Ok(Invocation::new(&facts.config.tools.report)
        .args(["--inputs", INPUTS, "--basename", base.as_str(), "--outdir", "."])
        .output(format!("{base}.annotations.tsv"))
        .output(format!("{base}.go_terms.tsv"))
        .output(format!("{base}.summary.txt")))
}
