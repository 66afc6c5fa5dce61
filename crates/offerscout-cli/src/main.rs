use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use offerscout_pipeline::RunConfig;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "offerscout")]
#[command(about = "Job offer scraping pipeline")]
struct Cli {
    /// Path to the YAML run configuration.
    #[arg(long, default_value = "offerscout.yaml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Scrape every configured website and export new offers.
    Run,
    /// Serve the stored offers over HTTP (db export only).
    Serve {
        #[arg(long, default_value_t = 8000)]
        port: u16,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let config = RunConfig::from_yaml_file(&cli.config)?;

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            let summary = offerscout_pipeline::run_once(&config).await?;
            println!(
                "run complete: run_id={} sites={} scraped={} exported={} skipped={} blocked={}",
                summary.run_id,
                summary.sites,
                summary.scraped,
                summary.exported,
                summary.skipped,
                summary.blocked
            );
        }
        Commands::Serve { port } => {
            offerscout_web::serve(&config, port).await?;
        }
    }

    Ok(())
}
