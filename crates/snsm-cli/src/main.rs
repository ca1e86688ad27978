use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use snsm_storage::Warehouse;
use snsm_sync::{KindStatus, ReconcileConfig, ReconcileSummary, Reconciler};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "snsm-cli")]
#[command(about = "Merge SNS staging tables into their main tables")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Serve the HTTP trigger (default).
    Serve {
        /// Use an in-process warehouse instead of BigQuery.
        #[arg(long)]
        memory: bool,
    },
    /// Run one reconciliation and print the summary.
    Merge,
    /// Print the statements a run would execute.
    Plan,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new("snsm_sync=info,snsm_web=info,snsm_storage=info,warn")
        }))
        .init();

    let cli = Cli::parse();
    match cli.command.unwrap_or(Commands::Serve { memory: false }) {
        Commands::Serve { memory } => serve(memory).await?,
        Commands::Merge => {
            let summary = snsm_sync::run_once_from_env().await?;
            print_summary(&summary);
        }
        Commands::Plan => plan()?,
    }

    Ok(())
}

async fn serve(memory: bool) -> Result<()> {
    let config = ReconcileConfig::from_env()?;
    let port = snsm_web::port_from_env()?;
    let warehouse: Arc<dyn Warehouse> = if memory {
        snsm_sync::memory_warehouse(&config).await
    } else {
        snsm_sync::bigquery_warehouse(&config)?
    };
    info!(warehouse = warehouse.name(), project = %config.project, dataset = %config.dataset, "starting");

    let reconciler = Arc::new(Reconciler::new(config, warehouse));
    let scheduler = snsm_sync::maybe_build_scheduler(reconciler.clone()).await?;
    if let Some(sched) = &scheduler {
        sched.start().await?;
        info!(cron = %reconciler.config().cron, "scheduler started");
    }

    snsm_web::serve(snsm_web::AppState::new(reconciler), port).await?;

    if let Some(mut sched) = scheduler {
        sched.shutdown().await?;
    }
    Ok(())
}

fn plan() -> Result<()> {
    let config = ReconcileConfig::from_env()?;
    for kind in snsm_core::RecordKind::ALL {
        let request = snsm_sync::MergeRequest::for_kind(&config, kind);
        println!("-- {kind}: {} -> {}", request.staging_ref(), request.main_ref());
        println!("{};", request.plan()?.to_sql());
        println!("{};", request.truncate_statement());
        println!();
    }
    Ok(())
}

fn print_summary(summary: &ReconcileSummary) {
    println!(
        "merge complete: run_id={} succeeded={}",
        summary.run_id,
        summary.all_succeeded()
    );
    for outcome in &summary.outcomes {
        match &outcome.status {
            KindStatus::Succeeded {
                provisioned,
                affected_rows,
            } => println!(
                "  {}: ok main={} ({:?}) affected_rows={}",
                outcome.kind,
                outcome.main_table,
                provisioned,
                affected_rows.map_or_else(|| "unknown".to_string(), |n| n.to_string())
            ),
            KindStatus::Failed { stage, message } => println!(
                "  {}: failed at {:?}: {}",
                outcome.kind, stage, message
            ),
        }
    }
}
