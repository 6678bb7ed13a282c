use std::sync::Arc;

use anyhow::Result;
use consumption_sync::{
    app, config::AppConfig, control, metrics_server, observability, registry::InstallationRegistry,
    scheduler::Scheduler, status::StatusBoard,
};

#[tokio::main]
async fn main() -> Result<()> {
    observability::init_tracing();

    // Load configuration
    let cfg = AppConfig::load()?;

    // Start metrics server if configured
    if let Some(metrics_cfg) = &cfg.metrics {
        metrics_server::init(&metrics_cfg.bind_addr).await?;
    }

    let pool = app::connect_questdb(&cfg).await?;
    let sink = Arc::new(app::questdb_sink(&cfg, pool));
    let registry = InstallationRegistry::open(&cfg.registry.path).await?;
    let pipeline = app::build_pipeline(&cfg, registry, sink).await?;

    let scheduler = Arc::new(Scheduler::new(
        pipeline,
        Arc::new(StatusBoard::new()),
        cfg.scheduler_settings(),
    ));

    if let Some(control_cfg) = &cfg.control {
        let load_credentials: control::CredentialsLoader =
            Arc::new(|| -> Result<_> { AppConfig::load()?.credentials() });
        control::serve(&control_cfg.bind_addr, scheduler.clone(), load_credentials).await?;
    }

    let ticker = tokio::spawn(scheduler.clone().run());

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown requested, cancelling in-flight imports");
    scheduler.shutdown();
    ticker.await?;

    Ok(())
}
