use std::path::PathBuf;
use std::process;

use clap::{Args, Parser, Subcommand};
use csu_harvester::{
    config::Settings,
    services::{
        collection_status, BuildCacheOptions, CollectOptions, Harvester, Selection, StopSignal,
    },
    utils::{logging, time::DateRange},
    HarvestError,
};
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "csu-harvester")]
#[command(about = "End-of-day snapshots of lending markets across EVM chains")]
struct Cli {
    /// Configuration file (defaults to config/harvester.toml when present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Collect one artifact per unit and date
    Collect {
        #[command(flatten)]
        range: RangeArgs,
        /// Concurrent tasks (overrides run.workers)
        #[arg(long)]
        workers: Option<usize>,
        /// Skip completed tasks and retry failed ones from the last checkpoint
        #[arg(long)]
        resume: bool,
        #[arg(long, value_delimiter = ',')]
        chains: Vec<String>,
        #[arg(long, value_delimiter = ',')]
        exclude_chains: Vec<String>,
        #[arg(long, value_delimiter = ',')]
        units: Vec<String>,
    },
    /// Resolve and cache end-of-day blocks without collecting
    BuildCache {
        #[command(flatten)]
        range: RangeArgs,
        #[arg(long, value_delimiter = ',')]
        chains: Vec<String>,
        /// Recompute dates that are already cached
        #[arg(long)]
        force: bool,
    },
    /// Summarise artifacts, checkpoint and block caches
    Status {
        #[arg(long)]
        json: bool,
    },
    /// Ask every configured endpoint for its latest block
    CheckEndpoints {
        #[arg(long, value_delimiter = ',')]
        chains: Vec<String>,
        #[arg(long)]
        json: bool,
    },
    /// Find the block and date at which a unit's registry was deployed
    ProbeDeployment {
        #[arg(long)]
        unit: String,
    },
}

#[derive(Args)]
struct RangeArgs {
    /// First date, YYYY-MM-DD
    #[arg(long)]
    start_date: String,
    /// Last date (inclusive), YYYY-MM-DD
    #[arg(long)]
    end_date: String,
}

impl RangeArgs {
    fn parse(&self) -> Result<DateRange, HarvestError> {
        Ok(DateRange::parse(&self.start_date, &self.end_date)?)
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let settings = match Settings::load(cli.config.as_deref()) {
        Ok(settings) => settings,
        Err(err) => {
            eprintln!("Failed to load configuration: {}", err);
            process::exit(2);
        }
    };
    logging::init(&settings.logging);

    if let Err(err) = run(cli.command, settings).await {
        error!(kind = err.kind().as_str(), error = %err, "Command failed");
        process::exit(if err.kind().is_fatal() { 2 } else { 1 });
    }
}

async fn run(command: Command, settings: Settings) -> Result<(), HarvestError> {
    match command {
        Command::Collect {
            range,
            workers,
            resume,
            chains,
            exclude_chains,
            units,
        } => {
            let options = CollectOptions {
                range: range.parse()?,
                workers,
                resume,
                selection: Selection {
                    chains,
                    exclude_chains,
                    units,
                },
            };
            let harvester = Harvester::new(settings)?;
            let stop = StopSignal::new();

            let ctrl_c = stop.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("Stop requested, finishing in-flight tasks");
                    ctrl_c.stop();
                }
            });

            info!(run_id = %harvester.run_id(), "Starting collection");
            let report = harvester.collect(&options, stop).await?;
            let summary = &report.summary;
            info!(
                run_id = %report.run_id,
                completed = summary.completed,
                failed = summary.failed,
                skipped = summary.skipped,
                not_started = summary.not_started,
                already_completed = report.already_completed,
                exhausted = report.exhausted.len(),
                stopped = summary.stopped,
                "Collection finished"
            );
            for (category, count) in &summary.failures_by_category {
                info!(category = %category, count, "Failures");
            }
        }
        Command::BuildCache {
            range,
            chains,
            force,
        } => {
            let options = BuildCacheOptions {
                range: range.parse()?,
                chains,
                force,
            };
            let harvester = Harvester::new(settings)?;
            let report = harvester.build_cache(&options).await?;
            for (chain, result) in &report {
                match &result.error {
                    None => info!(chain = %chain, resolved = result.resolved, "Cache complete"),
                    Some(reason) => warn!(
                        chain = %chain,
                        resolved = result.resolved,
                        reason = %reason,
                        "Cache incomplete"
                    ),
                }
            }
        }
        Command::Status { json } => {
            let status = collection_status(&settings)?;
            if json {
                match serde_json::to_string_pretty(&status) {
                    Ok(rendered) => println!("{}", rendered),
                    Err(err) => return Err(HarvestError::IoError(err.into())),
                }
            } else {
                print!("{}", status);
            }
        }
        Command::CheckEndpoints { chains, json } => {
            let harvester = Harvester::new(settings)?;
            let reports = harvester.check_endpoints(&chains).await?;
            if json {
                match serde_json::to_string_pretty(&reports) {
                    Ok(rendered) => println!("{}", rendered),
                    Err(err) => return Err(HarvestError::IoError(err.into())),
                }
            } else {
                for report in &reports {
                    println!("{}", report.chain);
                    if report.endpoints.is_empty() {
                        println!("  (no endpoints configured)");
                    }
                    for endpoint in &report.endpoints {
                        let kind = if endpoint.public { "public" } else { "key" };
                        let outcome = match (&endpoint.latest_block, &endpoint.error) {
                            _ if endpoint.blacklisted => "blacklisted".to_string(),
                            (Some(block), _) => format!(
                                "ok, block {} in {}ms",
                                block,
                                endpoint.latency_ms.unwrap_or_default()
                            ),
                            (None, Some(err)) => format!("failed: {}", err),
                            (None, None) => "no answer".to_string(),
                        };
                        println!("  {:<16} {:<6} {}", endpoint.label, kind, outcome);
                    }
                }
            }

            let unreachable: Vec<&str> = reports
                .iter()
                .filter(|report| !report.is_reachable())
                .map(|report| report.chain.as_str())
                .collect();
            if !unreachable.is_empty() {
                warn!(chains = %unreachable.join(","), "Some chains have no working endpoint");
                process::exit(1);
            }
        }
        Command::ProbeDeployment { unit } => {
            let harvester = Harvester::new(settings)?;
            let deployment = harvester.probe_deployment(&unit).await?;
            println!(
                "{} deployed on {} at block {} (timestamp {}, date {})",
                deployment.unit,
                deployment.chain,
                deployment.block,
                deployment.timestamp,
                deployment.date
            );
        }
    }
    Ok(())
}
