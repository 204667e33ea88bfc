#![forbid(unsafe_code)]

use std::fs::File;
use std::io::{BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use brand_harness::engine::{Engine, EngineConfig, ExecutionRequest, TraceSink};
use brand_harness::gateway::{OpenRouterAdapter, OpenRouterClientFactory};
use brand_harness::{JsonlTraceSink, SqliteRecordSink};

#[derive(Parser)]
#[command(name = "brand-harness", version, about = "Brand perception harness CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run an execution request against OpenRouter and write the report
    Run {
        /// Execution request (JSON)
        #[arg(long)]
        request: PathBuf,
        /// Where to write the final report (JSON)
        #[arg(long)]
        out: PathBuf,
        /// Write one JSONL line per recorded outcome
        #[arg(long)]
        trace: Option<PathBuf>,
        /// Persist per-brand records to this SQLite database
        #[arg(long)]
        db: Option<PathBuf>,
        /// Tasks in flight at once (overrides BRAND_HARNESS_CONCURRENCY)
        #[arg(long)]
        concurrency: Option<usize>,
        /// Map a request model name to an OpenRouter model id (NAME=ID).
        /// Unmapped names are sent as-is.
        #[arg(long = "model", value_name = "NAME=ID")]
        models: Vec<String>,
    },
    /// Print the task matrix of a request without calling any model
    Plan {
        #[arg(long)]
        request: PathBuf,
    },
}

fn read_request(path: &Path) -> Result<ExecutionRequest, Box<dyn std::error::Error>> {
    let file = File::open(path)?;
    Ok(serde_json::from_reader(BufReader::new(file))?)
}

fn model_aliases(
    request: &ExecutionRequest,
    overrides: &[String],
) -> Result<Vec<(String, String)>, Box<dyn std::error::Error>> {
    let mut aliases: Vec<(String, String)> = request
        .enabled_models()
        .into_iter()
        .map(|name| (name.clone(), name))
        .collect();
    for raw in overrides {
        let (name, id) = raw
            .split_once('=')
            .ok_or_else(|| format!("--model expects NAME=ID, got {raw:?}"))?;
        let (name, id) = (name.trim().to_string(), id.trim().to_string());
        match aliases.iter_mut().find(|(n, _)| *n == name) {
            Some(entry) => entry.1 = id,
            None => aliases.push((name, id)),
        }
    }
    Ok(aliases)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            request,
            out,
            trace,
            db,
            concurrency,
            models,
        } => {
            let request = read_request(&request)?;
            let mut config = EngineConfig::from_env();
            if let Some(n) = concurrency {
                if n == 0 {
                    return Err("--concurrency must be >= 1".into());
                }
                config.concurrency = n;
            }

            let mut factory = OpenRouterClientFactory::new(OpenRouterAdapter::from_env()?);
            for (name, id) in model_aliases(&request, &models)? {
                factory = factory.with_model(name, id);
            }

            let mut engine = Engine::new(Arc::new(factory), config);
            if let Some(path) = db {
                engine = engine.with_sink(Arc::new(SqliteRecordSink::new(path)?));
            }
            let worker = match trace {
                Some(path) => {
                    let (sink, worker) = JsonlTraceSink::new(path)?;
                    let sink: Arc<dyn TraceSink> = Arc::new(sink);
                    engine = engine.with_trace(sink);
                    Some(worker)
                }
                None => None,
            };

            let report = engine.run(request).await?;
            drop(engine);
            if let Some(worker) = worker {
                worker.join()?;
            }

            let mut file = File::create(&out)?;
            serde_json::to_writer_pretty(&mut file, &report)?;
            writeln!(file)?;

            println!(
                "{}: {} ({} of {} tasks succeeded, {} missing, quality {:.1} {})",
                report.execution_id,
                report.status,
                report.success_count(),
                report.total_tasks,
                report.missing_count,
                report.quality_score,
                report.quality_level,
            );
            for warning in &report.warnings {
                eprintln!("warning: {warning}");
            }
        }
        Commands::Plan { request } => {
            let request = read_request(&request)?;
            let engine = Engine::new(
                Arc::new(brand_harness::ClientRegistry::new()),
                EngineConfig::from_env(),
            );
            let matrix = engine.plan(&request)?;
            println!("{} tasks", matrix.total());
            for (idx, task) in matrix.tasks().enumerate() {
                println!("{idx}\t{}\t{}\t{}", task.brand, task.model, task.question);
            }
        }
    }

    Ok(())
}
