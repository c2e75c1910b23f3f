use std::process::ExitCode;

use annoflow::annotate::{self, Config};
use annoflow::utils::{as_overhead, init_logging};
use camino::Utf8PathBuf;
use clap::Parser;

#[derive(Parser, Debug, Clone)]
#[command(version, about = "Chunked, multi-branch sequence annotation")]
struct Args {
    /// Path to the JSON run configuration.
    #[clap(index = 1)]
    config: Utf8PathBuf,

    /// Write the executed graph as a Mermaid chart to this file.
    #[clap(long)]
    mermaid: Option<Utf8PathBuf>,
}

fn main() -> ExitCode {
    let args = Args::parse();

    if let Err(err) = init_logging() {
        eprintln!("annoflow: {err}");
    }

    let start = std::time::Instant::now();

    let result = Config::load(&args.config).and_then(|config| {
        let diagnostics = annotate::run(&config)?;
        Ok((config, diagnostics))
    });

    match result {
        Ok((config, diagnostics)) => {
            tracing::info!("Annotation finished {}", as_overhead(start));

            if let Some(path) = args.mermaid {
                let chart = diagnostics.render_mermaid(&annotate::pipeline(&config));
                if let Err(err) = std::fs::write(&path, chart) {
                    eprintln!("annoflow: cannot write {path}: {err}");
                    return ExitCode::FAILURE;
                }
            }

            ExitCode::SUCCESS
        }
        Err(err) => {
            eprintln!("annoflow: {err}");
            ExitCode::FAILURE
        }
    }
}
