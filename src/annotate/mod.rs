//! The sequence annotation pipeline.
//!
//! Chunks of the input are searched by up to five independent branches:
//!
//! - `interproscan`, domain and GO term annotation of every chunk,
//! - `nr` and `sprot`, a diamond index built once, then searched per chunk,
//! - `orthodb`, levels resolved at runtime, then every chunk searched
//!   against every level,
//! - `string`, a search against the STRING protein set.
//!
//! All surviving branch results are collected into one report.

mod commands;
mod config;

use std::fs;

pub use self::config::{Config, Data, EnabledStep, Facts, Input, Memory, OrthoStep, Output, Run, SearchMode, Step, Steps, Tools};

use crate::blueprint::{Blueprint, Pipeline};
use crate::engine::{Artifact, Gate, Launcher, LocalLauncher, Resources, Splitter, parse_member_list};
use crate::error::PipelineError;
use crate::Diagnostics;

const GB: u64 = 1 << 30;

/// Defines the annotation graph for `config`.
pub fn pipeline(config: &Config) -> Pipeline<Facts> {
    let mut bp = Blueprint::<Facts>::new();
    let threads = config.run.threads;

    let interproscan = bp.gate(
        Gate::new("interproscan")
            .when(|f: &Facts| f.config.steps.interproscan.enable)
            .require_dir("data.interproscan", |f: &Facts| f.config.data.interproscan.clone()),
    );
    let nr = bp.gate(
        Gate::new("nr")
            .when(|f: &Facts| f.config.steps.nr.enable)
            .require_path("data.nr", |f: &Facts| f.config.data.nr.clone()),
    );
    let sprot = bp.gate(
        Gate::new("sprot")
            .when(|f: &Facts| f.config.steps.sprot.enable)
            .require_path("data.sprot", |f: &Facts| f.config.data.sprot.clone()),
    );
    let orthodb = bp.gate(
        Gate::new("orthodb")
            .when(|f: &Facts| f.config.steps.orthodb.enable)
            .require_dir("data.orthodb", |f: &Facts| f.config.data.orthodb.clone())
            .require_value("steps.orthodb.db", |f: &Facts| f.config.steps.orthodb.db.clone()),
    );
    let string = bp.gate(
        Gate::new("string")
            .when(|f: &Facts| f.config.steps.string.enable)
            .require_path("data.string", |f: &Facts| f.config.data.string.clone()),
    );

    let chunks = bp.split("split", Splitter::fasta(&config.input.file, config.run.chunk_size));
    let search = Resources::new(threads, GB);

    let mut results = Vec::new();

    results.push(
        bp.task("interproscan")
            .gate(interproscan)
            .resources(Resources::new(threads, 2 * GB))
            .each(chunks, ())
            .run(commands::interproscan),
    );

    // nr
    let index = bp
        .task("nr_index")
        .gate(nr)
        .resources(Resources::new(threads, 2 * GB))
        .once(())
        .run(commands::nr_index);
    results.push(
        bp.task("nr_search")
            .gate(nr)
            .resources(search)
            .each(chunks, index)
            .run(commands::nr_search),
    );

    // sprot
    let index = bp
        .task("sprot_index")
        .gate(sprot)
        .resources(Resources::new(threads, GB))
        .once(())
        .run(commands::sprot_index);
    results.push(
        bp.task("sprot_search")
            .gate(sprot)
            .resources(search)
            .each(chunks, index)
            .run(commands::sprot_search),
    );

    // orthodb
    let levels = bp
        .task("orthodb_levels")
        .gate(orthodb)
        .once(())
        .run(commands::orthodb_levels);
    let members = bp.expand("orthodb_members", levels, |levels: &Artifact| {
        let path = levels.require(commands::MEMBERS)?;
        let text = fs::read_to_string(path)?;
        Ok(parse_member_list(&text)?
            .into_iter()
            .map(|level| (level.clone(), level))
            .collect())
    });
    let pairs = bp.cross("orthodb_pairs", chunks, members);
    results.push(
        bp.task("orthodb_search")
            .gate(orthodb)
            .resources(search)
            .each(pairs, ())
            .run(commands::orthodb_search),
    );

    results.push(
        bp.task("string_search")
            .gate(string)
            .resources(search)
            .each(chunks, ())
            .run(commands::string_search),
    );

    let all = bp.collect("collect", &results);
    bp.task("report")
        .publish(&config.output.dir)
        .once(all)
        .run(commands::report);

    bp.finish()
}

/// Runs the annotation pipeline described by `config` with local processes.
pub fn run(config: &Config) -> Result<Diagnostics, PipelineError> {
    run_with(config, None::<LocalLauncher>)
}

/// Like [`run`], optionally with a different launcher.
pub fn run_with(config: &Config, launcher: Option<impl Launcher + 'static>) -> Result<Diagnostics, PipelineError> {
    let facts = config.facts()?;
    let options = config.options()?;

    let mut pipeline = pipeline(config);
    if let Some(launcher) = launcher {
        pipeline.set_launcher(launcher);
    }

    let diagnostics = pipeline.run(&options, facts)?;

    tracing::info!("Reports written to {}", config.output.dir);

    Ok(diagnostics)
}

#[cfg(test)]
mod tests {
    use std::io;

    use camino::{Utf8Path, Utf8PathBuf};

    use super::*;
    use crate::engine::Invocation;

    fn tempdir() -> (tempfile::TempDir, Utf8PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::try_from(dir.path().to_path_buf()).unwrap();
        (dir, path)
    }

    fn touch(inv: &Invocation, dir: &Utf8Path) -> io::Result<i32> {
        for output in &inv.outputs {
            let content = match output.as_str() {
                commands::MEMBERS => "2759\n33208\n",
                _ => "",
            };
            fs::write(dir.join(output), content)?;
        }
        Ok(0)
    }

    fn setup(root: &Utf8Path, steps: &str) -> Config {
        let input = root.join("proteins.fa");
        let text: String = (1..=23).map(|i| format!(">seq{i}\nMKVLAAGIV\n")).collect();
        fs::write(&input, text).unwrap();

        let ipr = root.join("ipr");
        fs::create_dir_all(&ipr).unwrap();
        fs::write(ipr.join("interproscan.sh"), "").unwrap();

        let nr = root.join("nr.fa");
        fs::write(&nr, ">x\nMK\n").unwrap();

        let config = format!(
            r#"{{
                "input": {{ "file": "{input}", "type": "prot" }},
                "data": {{ "interproscan": "{ipr}", "nr": "{nr}", "orthodb": "{root}/odb" }},
                "steps": {steps},
                "output": {{ "dir": "{root}/results" }},
                "run": {{ "chunk_size": 10, "cpus": 2, "memory": "8GB", "work_dir": "{root}/work" }}
            }}"#
        );

        Config::parse(&config).unwrap()
    }

    #[test]
    fn test_interproscan_only() {
        let (_guard, root) = tempdir();
        let config = setup(&root, "{}");

        let diagnostics = run_with(&config, Some(touch)).unwrap();

        assert_eq!(diagnostics.instances_of("interproscan").count(), 3);
        assert_eq!(diagnostics.instances_of("nr_search").count(), 0);
        assert_eq!(diagnostics.instances_of("report").count(), 1);

        for file in ["proteins.annotations.tsv", "proteins.go_terms.tsv", "proteins.summary.txt"] {
            assert!(root.join("results").join(file).exists(), "{file}");
        }
    }

    #[test]
    fn test_report_lists_every_result() {
        let (_guard, root) = tempdir();
        let config = setup(&root, r#"{ "nr": { "enable": true } }"#);

        let diagnostics = run_with(&config, Some(touch)).unwrap();
        assert_eq!(diagnostics.instances_of("nr_index").count(), 1);
        assert_eq!(diagnostics.instances_of("nr_search").count(), 3);

        let report = diagnostics.instances_of("report").next().unwrap();
        let workdir = fs::read_dir(root.join("work"))
            .unwrap()
            .flat_map(|dir| fs::read_dir(dir.unwrap().path()).unwrap())
            .map(|dir| dir.unwrap().path())
            .find(|dir| dir.join(commands::INPUTS).exists())
            .unwrap();

        let listing = fs::read_to_string(workdir.join(commands::INPUTS)).unwrap();
        assert!(report.succeeded);
        assert_eq!(listing.lines().count(), 6);
        assert!(listing.contains(commands::HITS));
        assert!(listing.contains(commands::INTERPROSCAN));
    }

    #[test]
    fn test_orthodb_levels_expand() {
        let (_guard, root) = tempdir();
        let odb = root.join("odb");
        fs::create_dir_all(odb.join("eukaryota")).unwrap();
        fs::write(odb.join("eukaryota/2759.dmnd"), "").unwrap();

        let config = setup(
            &root,
            r#"{ "interproscan": { "enable": false }, "orthodb": { "enable": true, "db": "eukaryota" } }"#,
        );

        let diagnostics = run_with(&config, Some(touch)).unwrap();

        assert_eq!(diagnostics.instances_of("interproscan").count(), 0);
        assert_eq!(diagnostics.instances_of("orthodb_levels").count(), 1);
        assert_eq!(diagnostics.instances_of("orthodb_search").count(), 6);
        assert!(diagnostics
            .instances_of("orthodb_search")
            .any(|record| record.key.as_str() == "proteins.2+orthodb_levels/33208"));
    }

    #[test]
    fn test_orthodb_missing_data() {
        let (_guard, root) = tempdir();
        let config = setup(&root, r#"{ "orthodb": { "enable": true, "db": "eukaryota" } }"#);

        match run_with(&config, Some(touch)) {
            Err(PipelineError::Precondition { gate, key, path, .. }) => {
                assert_eq!(gate, "orthodb");
                assert_eq!(key, "data.orthodb");
                assert_eq!(path, root.join("odb"));
            }
            other => panic!("unexpected {:?}", other.map(|_| ())),
        }

        assert!(!root.join("work").exists());
    }

    #[test]
    fn test_orthodb_needs_category() {
        let (_guard, root) = tempdir();
        fs::create_dir_all(root.join("odb/eukaryota")).unwrap();
        let config = setup(&root, r#"{ "orthodb": { "enable": true } }"#);

        match run_with(&config, Some(touch)) {
            Err(PipelineError::Precondition { key, .. }) => assert_eq!(key, "steps.orthodb.db"),
            other => panic!("unexpected {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_failing_tool_stops_report() {
        let (_guard, root) = tempdir();
        let config = setup(&root, "{}");

        let result = run_with(
            &config,
            Some(|inv: &Invocation, dir: &Utf8Path| {
                if inv.args.iter().any(|arg| arg.ends_with("proteins.2.fa")) {
                    return Ok(2);
                }
                touch(inv, dir)
            }),
        );

        assert!(matches!(result, Err(PipelineError::TaskExecution { .. })));
        assert!(!root.join("results/proteins.summary.txt").exists());
    }
}
