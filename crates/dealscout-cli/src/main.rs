use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use dealscout_pipeline::{run_daemon, Pipeline, RuntimeConfig};

#[derive(Debug, Parser)]
#[command(name = "dealscout")]
#[command(about = "Marketplace listing harvester and hot-deal analyzer")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one scrape + analysis cycle now.
    Scan,
    /// Recompute the hot-deals store from the persisted listings.
    Analyze,
    /// Keep cycling on the configured interval until ctrl-c.
    Run,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let cli = Cli::parse();
    let pipeline = Pipeline::new(RuntimeConfig::from_env())?;

    match cli.command.unwrap_or(Commands::Scan) {
        Commands::Scan => match pipeline.try_run_cycle().await? {
            Some(cycle) => {
                let hot_deals = cycle.analysis.as_ref().map(|a| a.hot_deals).unwrap_or(0);
                println!(
                    "scan complete: run_id={} raw={} stored={} hot_deals={}",
                    cycle.scrape.run_id, cycle.scrape.raw_listings, cycle.scrape.store_size, hot_deals
                );
            }
            None => println!("scan skipped: another run is already in flight"),
        },
        Commands::Analyze => {
            let summary = pipeline.analyze_once()?;
            println!(
                "analysis complete: run_id={} listings={} hot_deals={} new={}",
                summary.run_id, summary.listings_considered, summary.hot_deals, summary.new_deals
            );
        }
        Commands::Run => run_daemon(Arc::new(pipeline)).await?,
    }

    Ok(())
}
