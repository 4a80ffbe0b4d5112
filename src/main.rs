use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use opal_scheduler::cli::{Cli, Command, LoopArg};
use opal_scheduler::config::SchedulerConfig;
use opal_scheduler::monitor::{JobsWatchdog, NodesWatchdog};
use opal_scheduler::notify::LogNotifier;
use opal_scheduler::runtime::{install_shutdown_handler, run_once, run_periodic};
use opal_scheduler::scheduler::JobScheduler;
use opal_scheduler::storage::SwiftClient;
use opal_scheduler::store::MongoStore;
use opal_scheduler::worker::HttpWorkerClient;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    let config = SchedulerConfig::load(&cli.config)?;

    let store = Arc::new(
        MongoStore::connect(&config.mongo_url, &config.database, config.store_timeout())
            .await
            .context("connecting to MongoDB")?,
    );
    let worker = Arc::new(HttpWorkerClient::new(config.request_timeout())?);
    let storage = Arc::new(SwiftClient::new(config.storage.clone(), config.request_timeout())?);

    let scheduler =
        JobScheduler::new(Arc::clone(&store), Arc::clone(&worker), config.failure_policy()?);
    let jobs = JobsWatchdog::new(Arc::clone(&store), worker, storage, &config)?;
    let nodes = NodesWatchdog::new(store, Arc::new(LogNotifier), config.node_staleness()?);

    match cli.command {
        Command::Run => {
            let shutdown = install_shutdown_handler();
            info!(database = %config.database, "opal scheduler started");
            tokio::join!(
                run_periodic(&scheduler, config.scheduler_interval(), shutdown.clone()),
                run_periodic(&jobs, config.jobs_watchdog_interval(), shutdown.clone()),
                run_periodic(&nodes, config.nodes_watchdog_interval(), shutdown),
            );
            info!("opal scheduler stopped");
        }
        Command::Tick { target } => {
            let summary = match target {
                LoopArg::Dispatch => run_once(&scheduler).await?,
                LoopArg::JobHealth => run_once(&jobs).await?,
                LoopArg::NodeHealth => run_once(&nodes).await?,
            };
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
    }

    Ok(())
}
