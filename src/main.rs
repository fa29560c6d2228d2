// src/main.rs
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use log::{info, warn};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use region_matching_lib::matching::manager::MatchingEngine;
use region_matching_lib::models::{HierarchyId, RegionId};
use region_matching_lib::utils::config::EngineConfig;
use region_matching_lib::utils::db_connect::{connect, get_pool_status};
use region_matching_lib::utils::env::load_env;
use region_matching_lib::utils::progress_bars::run_bar::{run_progress_bar, sync_bar};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Country-level tree matching over a whole hierarchy
    CountryLevel {
        #[arg(long)]
        hierarchy_id: HierarchyId,
    },
    /// AI rematching of every unresolved region
    Ai {
        #[arg(long)]
        hierarchy_id: HierarchyId,
        /// Poll interval of the progress bar in milliseconds
        #[arg(long, default_value_t = 500)]
        poll_ms: u64,
    },
    /// AI rematching of a single region
    AiRegion {
        #[arg(long)]
        hierarchy_id: HierarchyId,
        #[arg(long)]
        region_id: RegionId,
    },
    /// Geocode fallback for a single region
    Geocode {
        #[arg(long)]
        hierarchy_id: HierarchyId,
        #[arg(long)]
        region_id: RegionId,
    },
    /// Drop every assignment of a region
    ClearAssignments {
        #[arg(long)]
        hierarchy_id: HierarchyId,
        #[arg(long)]
        region_id: RegionId,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    load_env();
    let cli = Cli::parse();

    let config = EngineConfig::from_env();
    config.log_config();

    let pool = connect().await.context("Failed to connect to database")?;
    let (total, idle, in_use) = get_pool_status(&pool);
    info!("DB pool: {} connections ({} idle, {} in use)", total, idle, in_use);

    let engine =
        Arc::new(MatchingEngine::new(pool, config).context("Failed to build matching engine")?);

    match cli.command {
        Command::CountryLevel { hierarchy_id } => {
            let stats = until_done_or_cancelled(
                &engine,
                hierarchy_id,
                engine.match_country_level(hierarchy_id),
            )
            .await?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
        Command::Ai { hierarchy_id, poll_ms } => {
            run_ai_with_progress(&engine, hierarchy_id, poll_ms).await?
        }
        Command::AiRegion {
            hierarchy_id,
            region_id,
        } => {
            let result = until_done_or_cancelled(
                &engine,
                hierarchy_id,
                engine.ai_match_single_region(hierarchy_id, region_id),
            )
            .await?;
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        Command::Geocode {
            hierarchy_id,
            region_id,
        } => {
            let result = until_done_or_cancelled(
                &engine,
                hierarchy_id,
                engine.geocode_match_region(hierarchy_id, region_id),
            )
            .await?;
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        Command::ClearAssignments {
            hierarchy_id,
            region_id,
        } => {
            let cleared = engine.clear_region_assignments(hierarchy_id, region_id).await?;
            println!("Cleared {} assignments of region {}", cleared, region_id);
        }
    }
    Ok(())
}

/// Drives `operation`; Ctrl-C asks the hierarchy's active run to stop and
/// waits for it to wind down.
async fn until_done_or_cancelled<T>(
    engine: &MatchingEngine,
    hierarchy_id: HierarchyId,
    operation: impl Future<Output = Result<T>>,
) -> Result<T> {
    tokio::pin!(operation);
    tokio::select! {
        result = &mut operation => result,
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupt received, cancelling run for hierarchy {}", hierarchy_id);
            if let Some(handle) = engine.active_run(hierarchy_id).await {
                engine.cancel(&handle).await;
            }
            operation.await
        }
    }
}

async fn run_ai_with_progress(
    engine: &Arc<MatchingEngine>,
    hierarchy_id: HierarchyId,
    poll_ms: u64,
) -> Result<()> {
    let handle = engine.start_ai_matching(hierarchy_id).await?;
    info!("AI matching started (run {})", handle.run_id);
    let pb = run_progress_bar(0, "AI");
    let interval = Duration::from_millis(poll_ms.max(50));
    let mut cancel_requested = false;

    let final_progress = loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = tokio::signal::ctrl_c(), if !cancel_requested => {
                warn!("Interrupt received, cancelling after the current batch");
                cancel_requested = engine.cancel(&handle).await;
            }
        }
        let progress = engine.poll(&handle).await?;
        sync_bar(&pb, &progress);
        if progress.status.is_finished() {
            break progress;
        }
    };
    pb.finish_with_message(format!("{:?}", final_progress.status));
    println!("{}", serde_json::to_string_pretty(&final_progress)?);
    Ok(())
}
