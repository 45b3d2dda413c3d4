// self_rag_bench/src/main.rs

//! Runs the pipelines of a benchmark document against the mock Self RAG
//! stages and prints the aggregate report of each.
//!
//! Usage: `self_rag_bench <CONFIG> [--pipeline NAME] [--report-json PATH] [--log-level LEVEL]`

mod stages;

use anyhow::{bail, Context};
use benchline::{BenchDocument, BenchError, CancellationToken, ComponentRegistry, PipelineExecutor, RunReport};
use clap::Parser;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing::{event, Level};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "self_rag_bench")]
#[command(about = "Drive a staged benchmark pipeline with an offline load generator")]
struct Args {
  /// Path to the YAML pipeline document
  config: PathBuf,

  /// Run only the pipeline with this name
  #[arg(long)]
  pipeline: Option<String>,

  /// Write the reports as a JSON array to this file
  #[arg(long = "report-json")]
  report_json: Option<PathBuf>,

  /// Log filter used when RUST_LOG is not set (e.g. `info`, `benchline=debug`)
  #[arg(long = "log-level", default_value = "info")]
  log_level: String,
}

fn init_logging(level: &str) {
  let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
  tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

#[tokio::main]
async fn main() -> ExitCode {
  let args = Args::parse();
  init_logging(&args.log_level);

  match run(args).await {
    Ok(()) => ExitCode::SUCCESS,
    Err(e) => {
      event!(Level::ERROR, "{:#}", e);
      ExitCode::FAILURE
    }
  }
}

async fn run(args: Args) -> anyhow::Result<()> {
  let doc = BenchDocument::from_file(&args.config)?;
  let registry = ComponentRegistry::with_builtins();
  stages::register(&registry);

  let specs: Vec<_> = match &args.pipeline {
    Some(name) => match doc.pipeline(name) {
      Some(spec) => vec![spec],
      None => bail!("pipeline '{}' not found in {}", name, args.config.display()),
    },
    None => doc.pipelines.iter().collect(),
  };

  // Assemble everything up front so a bad pipeline fails before any load runs.
  let executors = specs
    .into_iter()
    .map(|spec| PipelineExecutor::from_spec(spec, &registry))
    .collect::<Result<Vec<_>, _>>()?;

  let shutdown = CancellationToken::new();
  let ctrl_c = shutdown.clone();
  tokio::spawn(async move {
    if tokio::signal::ctrl_c().await.is_ok() {
      event!(Level::WARN, "Interrupt received; cancelling in-flight queries.");
      ctrl_c.cancel();
    }
  });

  let mut reports: Vec<RunReport> = Vec::new();
  let mut aborted = false;
  for executor in executors {
    if shutdown.is_cancelled() {
      break;
    }
    let name = executor.name().to_string();
    match executor.run(shutdown.clone()).await {
      Ok(outcome) => {
        println!("{}\n", outcome.report);
        reports.push(outcome.report);
      }
      Err(BenchError::Aborted { reason, partial }) => {
        event!(Level::ERROR, pipeline = %name, %reason, "Run aborted.");
        println!("{}\n", partial);
        reports.push(*partial);
        aborted = true;
      }
      Err(e) => return Err(e).with_context(|| format!("pipeline '{}' failed", name)),
    }
  }

  if let Some(path) = &args.report_json {
    save_reports(&reports, path)?;
    event!(Level::INFO, path = %path.display(), reports = reports.len(), "Reports written.");
  }
  if aborted {
    bail!("one or more pipeline runs were aborted");
  }
  Ok(())
}

fn save_reports(reports: &[RunReport], path: &Path) -> anyhow::Result<()> {
  let json = serde_json::to_string_pretty(reports)?;
  std::fs::write(path, json).with_context(|| format!("failed to write {}", path.display()))
}
