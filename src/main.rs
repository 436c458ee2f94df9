//! # `inventory-to-records`
//!
//! Reads a CSV storage inventory on stdin and writes one enriched build
//! record per line on stdout. Logs and progress go to stderr.
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `inventory-to-records [run]` | Enrich the inventory read from stdin |
//! | `inventory-to-records scan <product>` | Print the latest candidate build folder of every version |
//! | `inventory-to-records cache stats` | Entry counts of the persisted metadata cache |
//! | `inventory-to-records completions <shell>` | Print shell completions |
//!
//! ## Examples
//!
//! ```bash
//! zcat inventory.csv.gz | inventory-to-records -v > records.jsonl
//! NB_PARALLEL_REQUESTS=16 inventory-to-records --lenient < inventory.csv
//! inventory-to-records scan mobile
//! ```

use anyhow::Result;
use clap::{CommandFactory, Parser, Subcommand};
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::sync::Arc;

use buildhub_records::config;
use buildhub_records::http::ReqwestTransport;
use buildhub_records::merge::ValidationPolicy;
use buildhub_records::pipeline::Pipeline;
use buildhub_records::progress::ProgressMode;
use buildhub_records::stats::print_cache_stats;
use buildhub_records::traits::JsonLinesSink;

/// Turn a storage inventory into build records enriched with archive metadata.
#[derive(Parser)]
#[command(name = "inventory-to-records", version)]
struct Cli {
    /// Path to configuration file (TOML). A missing file means defaults.
    #[arg(long, global = true, default_value = "./config/buildhub.toml")]
    config: PathBuf,

    /// Log at INFO level.
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Log at DEBUG level.
    #[arg(short = 'D', long, global = true)]
    debug: bool,

    /// Emit records that fail validation instead of dropping them.
    #[arg(long, global = true)]
    lenient: bool,

    /// Progress on stderr. Defaults to `human` when stderr is a terminal.
    #[arg(long, global = true, value_enum)]
    progress: Option<ProgressMode>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Enrich the inventory read from stdin (default).
    Run,

    /// Index a product's candidates and print the latest build folder per version.
    Scan {
        /// Product directory: firefox, thunderbird, mobile or devedition.
        product: String,
    },

    /// Inspect the persisted metadata cache.
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },

    /// Print shell completions to stdout.
    Completions {
        shell: clap_complete::Shell,
    },
}

#[derive(Subcommand)]
enum CacheAction {
    /// Entry counts per lookup kind.
    Stats,
}

fn init_tracing(cli: &Cli) {
    let level = if cli.debug {
        tracing::Level::DEBUG
    } else if cli.verbose {
        tracing::Level::INFO
    } else {
        tracing::Level::WARN
    };
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()),
        )
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Some(Commands::Completions { shell }) = &cli.command {
        let mut cmd = Cli::command();
        clap_complete::generate(*shell, &mut cmd, "inventory-to-records", &mut std::io::stdout());
        return Ok(());
    }

    init_tracing(&cli);
    let cfg = config::load_config(&cli.config)?;

    let transport = Arc::new(ReqwestTransport::new(&cfg.fetch.user_agent)?);
    let progress = cli.progress.unwrap_or_else(ProgressMode::default_for_tty);
    let mut pipeline = Pipeline::new(&cfg, transport).with_progress(progress.reporter());
    if cli.lenient {
        pipeline = pipeline.with_policy(ValidationPolicy::Lenient);
    }

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            let stdout = std::io::stdout();
            let mut sink = JsonLinesSink::new(BufWriter::new(stdout.lock()));
            let stats = pipeline.run_inventory(std::io::stdin(), &mut sink).await?;
            sink.into_inner().flush()?;
            stats.print_summary();
        }
        Commands::Scan { product } => {
            if !cfg.pipeline.products.contains(&product) {
                anyhow::bail!("Product '{}' is not in the configured product list", product);
            }
            pipeline.scan(&product).await?;
            let indexed = buildhub_records::archive::canonical_product(&product);
            for (version, folder) in pipeline.index().versions(indexed) {
                println!("{:<20} {}", version, folder);
            }
        }
        Commands::Cache {
            action: CacheAction::Stats,
        } => {
            print_cache_stats(pipeline.cache_path(), pipeline.cache());
        }
        Commands::Completions { .. } => unreachable!(),
    }

    Ok(())
}
