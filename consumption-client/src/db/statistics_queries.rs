use anyhow::Result;
use sqlx::PgPool;
use time::{OffsetDateTime, PrimitiveDateTime, UtcOffset};

use crate::domain::{LastStatistic, StatisticRow};

pub const STATISTICS_TABLE: &str = "consumption_statistics";

// DEDUP UPSERT KEYS makes re-inserting the same (ts, statistic_id) replace the
// existing row instead of appending a duplicate.
const CREATE_STATISTICS_TABLE: &str = r#"
    CREATE TABLE IF NOT EXISTS consumption_statistics (
        ts TIMESTAMP,
        statistic_id SYMBOL,
        kwh DOUBLE,
        cumulative_kwh DOUBLE
    ) TIMESTAMP(ts) PARTITION BY MONTH WAL
    DEDUP UPSERT KEYS(ts, statistic_id)
"#;

#[derive(Debug, Clone, sqlx::FromRow)]
struct StatisticRecord {
    ts: PrimitiveDateTime,
    statistic_id: String,
    kwh: f64,
    cumulative_kwh: f64,
}

impl From<StatisticRecord> for StatisticRow {
    fn from(r: StatisticRecord) -> Self {
        StatisticRow {
            ts: r.ts.assume_utc(),
            statistic_id: r.statistic_id,
            kwh: r.kwh,
            cumulative_kwh: r.cumulative_kwh,
        }
    }
}

/// QuestDB stores TIMESTAMP without zone; everything is kept in UTC.
pub fn to_utc_primitive(ts: OffsetDateTime) -> PrimitiveDateTime {
    let utc = ts.to_offset(UtcOffset::UTC);
    PrimitiveDateTime::new(utc.date(), utc.time())
}

pub async fn ensure_schema(pool: &PgPool) -> Result<()> {
    sqlx::query(CREATE_STATISTICS_TABLE).execute(pool).await?;
    Ok(())
}

/// Latest stored row for a statistic, if any.
pub async fn last_statistic(pool: &PgPool, statistic_id: &str) -> Result<Option<LastStatistic>> {
    let row = sqlx::query_as::<_, (PrimitiveDateTime, f64)>(
        r#"
        SELECT ts, cumulative_kwh
        FROM consumption_statistics
        WHERE statistic_id = $1
        ORDER BY ts DESC
        LIMIT 1
        "#,
    )
    .bind(statistic_id)
    .fetch_optional(pool)
    .await?;

    Ok(row.map(|(ts, cumulative_kwh)| LastStatistic {
        ts: ts.assume_utc(),
        cumulative_kwh,
    }))
}

/// Time-ordered rows of one statistic in `[start, end)`.
pub async fn load_statistics(
    pool: &PgPool,
    statistic_id: &str,
    start: OffsetDateTime,
    end: OffsetDateTime,
) -> Result<Vec<StatisticRow>> {
    let rows = sqlx::query_as::<_, StatisticRecord>(
        r#"
        SELECT
            ts,
            statistic_id,
            kwh,
            cumulative_kwh
        FROM consumption_statistics
        WHERE statistic_id = $1
          AND ts >= $2
          AND ts <  $3
        ORDER BY ts
        "#,
    )
    .bind(statistic_id)
    .bind(to_utc_primitive(start))
    .bind(to_utc_primitive(end))
    .fetch_all(pool)
    .await?;

    Ok(rows.into_iter().map(StatisticRow::from).collect())
}
