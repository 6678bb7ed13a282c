use std::time::{Duration, Instant};

use consumption_client::db::{last_statistic, to_utc_primitive, STATISTICS_TABLE};
use consumption_client::domain::{LastStatistic, StatisticRow};
use sqlx::{postgres::PgPool, Postgres, QueryBuilder};

use super::StatisticsSink;
use crate::pipeline::PipelineError;

pub struct QuestDbStatisticsSink {
    pool: PgPool,
    batch_size: usize,
    max_retries: u32,
    retry_backoff: Duration,
}

impl QuestDbStatisticsSink {
    pub fn new(pool: PgPool, batch_size: usize, max_retries: u32, retry_backoff: Duration) -> Self {
        Self {
            pool,
            batch_size: batch_size.max(1),
            max_retries,
            retry_backoff,
        }
    }

    async fn flush_batch(&self, batch: &[StatisticRow]) -> Result<(), PipelineError> {
        if batch.is_empty() {
            return Ok(());
        }

        let started = Instant::now();
        let mut attempt: u32 = 0;
        loop {
            match self.insert_batch(batch).await {
                Ok(()) => {
                    metrics::counter!("questdb_ingested_records_total").increment(batch.len() as u64);
                    metrics::histogram!("questdb_write_latency_seconds").record(started.elapsed().as_secs_f64());
                    return Ok(());
                }
                Err(e) if attempt < self.max_retries => {
                    attempt += 1;
                    let sleep_for = self.retry_backoff * attempt;
                    tracing::warn!(
                        error = %e,
                        attempt,
                        "questdb statistics write failed, retrying with backoff"
                    );
                    tokio::time::sleep(sleep_for).await;
                }
                Err(e) => {
                    tracing::error!(error = %e, "questdb statistics write failed, giving up");
                    metrics::counter!("questdb_sink_errors_total").increment(1);
                    return Err(PipelineError::Sink(e.to_string()));
                }
            }
        }
    }

    async fn insert_batch(&self, batch: &[StatisticRow]) -> Result<(), sqlx::Error> {
        let mut builder = QueryBuilder::<Postgres>::new(format!(
            "INSERT INTO {STATISTICS_TABLE} (ts, statistic_id, kwh, cumulative_kwh) "
        ));

        builder.push("VALUES ");
        builder.push_values(batch, |mut b, row| {
            b.push_bind(to_utc_primitive(row.ts))
                .push_bind(&row.statistic_id)
                .push_bind(row.kwh)
                .push_bind(row.cumulative_kwh);
        });

        builder.build().execute(&self.pool).await.map(|_| ())
    }
}

#[async_trait::async_trait]
impl StatisticsSink for QuestDbStatisticsSink {
    async fn last_statistic(&self, statistic_id: &str) -> Result<Option<LastStatistic>, PipelineError> {
        last_statistic(&self.pool, statistic_id).await.map_err(|e| {
            metrics::counter!("questdb_sink_errors_total").increment(1);
            PipelineError::Sink(format!("reading last statistic of {statistic_id}: {e}"))
        })
    }

    async fn merge(&self, statistic_id: &str, rows: &[StatisticRow]) -> Result<usize, PipelineError> {
        // Re-sent rows replace their stored twins via the table's upsert keys.
        for chunk in rows.chunks(self.batch_size) {
            self.flush_batch(chunk).await?;
        }
        tracing::debug!(statistic_id, rows = rows.len(), "merged statistics into questdb");
        Ok(rows.len())
    }
}
