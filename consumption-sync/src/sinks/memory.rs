use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use consumption_client::domain::{LastStatistic, StatisticRow};
use time::OffsetDateTime;

use super::StatisticsSink;
use crate::pipeline::PipelineError;

/// Sink that keeps statistics in process memory. Used for dry runs and tests.
#[derive(Default)]
pub struct InMemoryStatisticsSink {
    series: Mutex<HashMap<String, BTreeMap<OffsetDateTime, StatisticRow>>>,
    fail_merges: AtomicBool,
    pub merges: AtomicUsize,
}

impl InMemoryStatisticsSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every following merge fail until switched off again.
    pub fn fail_merges(&self, fail: bool) {
        self.fail_merges.store(fail, Ordering::SeqCst);
    }

    /// Stored rows of one statistic, ascending.
    pub fn rows(&self, statistic_id: &str) -> Vec<StatisticRow> {
        self.series
            .lock()
            .map(|series| {
                series
                    .get(statistic_id)
                    .map(|rows| rows.values().cloned().collect())
                    .unwrap_or_default()
            })
            .unwrap_or_default()
    }

    /// Seed stored rows directly.
    pub fn insert_rows(&self, rows: &[StatisticRow]) {
        if let Ok(mut series) = self.series.lock() {
            for row in rows {
                series
                    .entry(row.statistic_id.clone())
                    .or_default()
                    .insert(row.ts, row.clone());
            }
        }
    }
}

#[async_trait::async_trait]
impl StatisticsSink for InMemoryStatisticsSink {
    async fn last_statistic(&self, statistic_id: &str) -> Result<Option<LastStatistic>, PipelineError> {
        let series = self
            .series
            .lock()
            .map_err(|_| PipelineError::Sink("in-memory sink poisoned".to_string()))?;
        Ok(series
            .get(statistic_id)
            .and_then(|rows| rows.values().next_back())
            .map(|row| LastStatistic {
                ts: row.ts,
                cumulative_kwh: row.cumulative_kwh,
            }))
    }

    async fn merge(&self, statistic_id: &str, rows: &[StatisticRow]) -> Result<usize, PipelineError> {
        if self.fail_merges.load(Ordering::SeqCst) {
            return Err(PipelineError::Sink("in-memory sink refused write".to_string()));
        }
        let mut series = self
            .series
            .lock()
            .map_err(|_| PipelineError::Sink("in-memory sink poisoned".to_string()))?;
        let stored = series.entry(statistic_id.to_string()).or_default();
        for row in rows {
            stored.insert(row.ts, row.clone());
        }
        self.merges.fetch_add(1, Ordering::SeqCst);
        Ok(rows.len())
    }
}
