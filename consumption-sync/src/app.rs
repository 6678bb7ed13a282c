//! Wiring shared by the service and the operator binaries.

use std::sync::Arc;
use std::time::Duration;

use sqlx::postgres::{PgPool, PgPoolOptions};

use crate::config::AppConfig;
use crate::pipeline::ImportPipeline;
use crate::provider::{EkzClient, SessionManager};
use crate::registry::InstallationRegistry;
use crate::sinks::{QuestDbStatisticsSink, StatisticsSink};

pub fn provider_client(cfg: &AppConfig) -> EkzClient {
    EkzClient::new(&cfg.provider.base_url, &cfg.provider.data_type, cfg.fetch_timeout())
}

pub async fn connect_questdb(cfg: &AppConfig) -> anyhow::Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(cfg.questdb.max_connections)
        .connect(&cfg.questdb.uri)
        .await?;
    consumption_client::db::ensure_schema(&pool).await?;
    Ok(pool)
}

pub fn questdb_sink(cfg: &AppConfig, pool: PgPool) -> QuestDbStatisticsSink {
    QuestDbStatisticsSink::new(
        pool,
        cfg.sink.batch_size,
        cfg.sink.max_retries,
        Duration::from_millis(cfg.sink.retry_backoff_ms),
    )
}

/// Register configured installations and assemble the import pipeline around
/// `registry` and `sink`. Discovery is left to the scheduler.
pub async fn build_pipeline<K: StatisticsSink>(
    cfg: &AppConfig,
    registry: InstallationRegistry,
    sink: Arc<K>,
) -> anyhow::Result<Arc<ImportPipeline<EkzClient, K>>> {
    let provider = Arc::new(provider_client(cfg));
    let sessions = Arc::new(SessionManager::new(provider, cfg.credentials()?));

    let registry = Arc::new(registry);
    for inst in &cfg.installations {
        registry
            .upsert(&inst.id, inst.contract_start, inst.move_out_date)
            .await?;
    }

    Ok(Arc::new(ImportPipeline::new(
        sessions,
        registry,
        sink,
        cfg.pipeline_settings()?,
    )))
}
