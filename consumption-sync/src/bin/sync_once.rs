use anyhow::{bail, Result};
use consumption_sync::{
    app,
    config::AppConfig,
    observability,
    pipeline::ImportRun,
    registry::InstallationRegistry,
    scheduler::Scheduler,
    sinks::{InMemoryStatisticsSink, StatisticsSink},
    status::StatusBoard,
};
use std::{env, sync::Arc};

async fn run_pass<K: StatisticsSink + 'static>(
    cfg: &AppConfig,
    registry: InstallationRegistry,
    sink: Arc<K>,
) -> Result<Vec<ImportRun>> {
    let pipeline = app::build_pipeline(cfg, registry, sink).await?;
    let scheduler = Scheduler::new(pipeline, Arc::new(StatusBoard::new()), cfg.scheduler_settings());
    Ok(scheduler.run_all().await)
}

#[tokio::main]
async fn main() -> Result<()> {
    observability::init_tracing();

    let args: Vec<String> = env::args().collect();
    let dry_run = match args.get(1).map(String::as_str) {
        None => false,
        Some("--dry-run") => true,
        Some(_) => bail!("usage: sync_once [--dry-run]"),
    };

    let cfg = AppConfig::load()?;
    let registry = InstallationRegistry::open(&cfg.registry.path).await?;

    // A dry run fetches and normalizes but keeps rows and progress in memory.
    let runs = if dry_run {
        run_pass(&cfg, registry.into_in_memory(), Arc::new(InMemoryStatisticsSink::new())).await?
    } else {
        let pool = app::connect_questdb(&cfg).await?;
        run_pass(&cfg, registry, Arc::new(app::questdb_sink(&cfg, pool))).await?
    };

    for run in &runs {
        println!("{}", serde_json::to_string(run)?);
    }
    let failed = runs.iter().filter(|r| r.outcome.is_failure()).count();
    tracing::info!(runs = runs.len(), failed, dry_run, "sync pass finished");

    if failed > 0 {
        bail!("{failed} of {} import runs failed", runs.len());
    }
    Ok(())
}
