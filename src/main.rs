// CodeGraph CLI - code intelligence graph server
use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;

use codegraph::errors::as_codegraph_error;
use codegraph::{init_logging_with_level, Conductor, MCPServer, ServerConfig};

#[derive(Parser)]
#[command(
    name = "codegraph",
    version,
    about = "Code intelligence graph with semantic search, served over MCP"
)]
struct Cli {
    /// Verbose logging (overridden by LOG_LEVEL / RUST_LOG)
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Suppress all output except errors
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Data directory for persisted state
    #[arg(long, global = true, env = "CODEGRAPH_DATA_DIR")]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve MCP tools over stdio
    Serve,
    /// Index a directory once and print a summary
    Index {
        /// Directory to index
        directory: PathBuf,
        /// Only re-parse files whose content changed
        #[arg(long)]
        incremental: bool,
        /// Glob patterns to exclude (repeatable)
        #[arg(long = "exclude")]
        exclude: Vec<String>,
    },
    /// Print store statistics and metrics
    Stats,
}

fn main() {
    let cli = Cli::parse();
    if let Err(e) = init_logging_with_level(cli.verbose, cli.quiet) {
        eprintln!("failed to initialize logging: {e}");
        std::process::exit(1);
    }

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("failed to start runtime: {e}");
            std::process::exit(1);
        }
    };

    match runtime.block_on(run(cli)) {
        Ok(()) => std::process::exit(codegraph::exit_codes::OK),
        Err(e) => {
            eprintln!("error: {e:#}");
            let code = as_codegraph_error(&e).map(|err| err.exit_code()).unwrap_or(1);
            std::process::exit(code);
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let mut config = ServerConfig::from_env();
    if let Some(data_dir) = cli.data_dir {
        config.data_dir = data_dir;
    }

    match cli.command {
        Commands::Serve => {
            let conductor = Arc::new(Conductor::build(config)?);
            conductor.start().await?;
            let server = MCPServer::new(Arc::clone(&conductor));
            let outcome = server.run_stdio().await;
            conductor.shutdown().await?;
            outcome
        }
        Commands::Index {
            directory,
            incremental,
            exclude,
        } => {
            let conductor = Arc::new(Conductor::build(config)?);
            conductor.start().await?;
            let directory = directory.canonicalize().unwrap_or(directory);
            let report = conductor
                .index_directory(&directory, incremental, &exclude)
                .await?;
            conductor.shutdown().await?;

            if !cli.quiet {
                println!(
                    "indexed {} files ({} removed), {} entities in {} ms",
                    report.files_indexed,
                    report.files_removed,
                    report.entities,
                    report.duration_ms
                );
                for error in &report.errors {
                    println!("  failed: {} ({})", error.file.display(), error.message);
                }
            }
            Ok(())
        }
        Commands::Stats => {
            let conductor = Arc::new(Conductor::build(config)?);
            let metrics = conductor.metrics();
            println!("{}", serde_json::to_string_pretty(&metrics)?);
            Ok(())
        }
    }
}
