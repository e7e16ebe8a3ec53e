use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use ftclone_adapters::FixturePageSource;
use ftclone_core::{CloneFilters, Stage};
use ftclone_sync::{CloneConfig, CloneOrchestrator, CloneRequest, OperationRegistry, TriggerOutcome};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "ftclone")]
#[command(about = "Resumable mirror of the Find a Tender release-package API")]
struct Cli {
    /// Overrides FTCLONE_DATA_DIR.
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run (or resume) a clone in the foreground.
    #[command(name = "clone")]
    Mirror(CloneArgs),
    /// Print the status of an operation.
    Status { operation_id: String },
    /// Mark operations left `running` by a dead process as failed.
    Recover,
    /// Serve the admin API.
    Serve {
        #[arg(long, env = "FTCLONE_WEB_PORT", default_value_t = ftclone_web::DEFAULT_WEB_PORT)]
        port: u16,
    },
}

#[derive(Debug, Args)]
struct CloneArgs {
    /// Records to process; -1 or 0 for no limit.
    #[arg(long, default_value_t = -1, allow_negative_numbers = true)]
    total: i64,
    #[arg(long)]
    stages: Option<Stage>,
    #[arg(long)]
    updated_from: Option<String>,
    #[arg(long)]
    updated_to: Option<String>,
    /// Resume this operation instead of starting a new one.
    #[arg(long)]
    operation_id: Option<String>,
    #[arg(long)]
    force: bool,
    /// Mirror `page-*.json` files from this directory instead of the network.
    #[arg(long)]
    fixtures: Option<PathBuf>,
}

impl CloneArgs {
    fn request(&self) -> CloneRequest {
        CloneRequest {
            total: self.total,
            filters: CloneFilters {
                stages: self.stages,
                updated_from: self.updated_from.clone(),
                updated_to: self.updated_to.clone(),
            },
            operation_id: self.operation_id.clone(),
            force: self.force,
            background: false,
        }
    }
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging();

    let mut config = CloneConfig::from_env();
    if let Some(data_dir) = cli.data_dir {
        config.data_dir = data_dir;
    }

    match cli.command {
        Commands::Mirror(args) => {
            let orchestrator = match &args.fixtures {
                Some(dir) => {
                    let source = FixturePageSource::from_dir(dir)?;
                    CloneOrchestrator::new(config, Arc::new(source))
                }
                None => CloneOrchestrator::from_config(config)?,
            };
            let outcome = Arc::new(orchestrator).trigger(args.request()).await?;
            let result = match outcome {
                TriggerOutcome::Finished(result) => result,
                TriggerOutcome::AlreadyCompleted(result) => {
                    eprintln!("operation {} already completed; nothing fetched", result.operation_id);
                    result
                }
                TriggerOutcome::Queued(queued) => {
                    anyhow::bail!("unexpected background acknowledgement for {}", queued.operation_id)
                }
            };
            println!("{}", serde_json::to_string_pretty(&result)?);
            eprintln!(
                "clone complete: operation_id={} pages={} received={} objects_written={} path={}",
                result.operation_id,
                result.stats.pages,
                result.stats.received_raw,
                result.stats.objects_written,
                result.path
            );
        }
        Commands::Status { operation_id } => {
            let registry = OperationRegistry::new(&config.data_dir, config.max_background);
            let status = registry.poll(&operation_id).await?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        Commands::Recover => {
            let registry = OperationRegistry::new(&config.data_dir, config.max_background);
            let recovered = registry.recover().await?;
            if recovered.is_empty() {
                println!("no interrupted operations under {}", config.data_dir.display());
            }
            for operation_id in recovered {
                println!("marked failed: {operation_id}");
            }
        }
        Commands::Serve { port } => {
            ftclone_web::serve(config, port).await?;
        }
    }

    Ok(())
}
