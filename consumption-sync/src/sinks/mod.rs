pub mod memory;
pub mod questdb;

pub use memory::InMemoryStatisticsSink;
pub use questdb::QuestDbStatisticsSink;

use consumption_client::domain::{LastStatistic, StatisticRow};
use time::OffsetDateTime;

use crate::pipeline::PipelineError;

/// Long-term statistics store. The sink is the source of truth for what has
/// been imported.
#[async_trait::async_trait]
pub trait StatisticsSink: Send + Sync {
    async fn last_statistic(&self, statistic_id: &str) -> Result<Option<LastStatistic>, PipelineError>;

    async fn last_timestamp(&self, statistic_id: &str) -> Result<Option<OffsetDateTime>, PipelineError> {
        Ok(self.last_statistic(statistic_id).await?.map(|s| s.ts))
    }

    /// Store ascending rows. Writing a row whose timestamp already exists
    /// replaces it, so merging the same rows twice leaves the same state.
    async fn merge(&self, statistic_id: &str, rows: &[StatisticRow]) -> Result<usize, PipelineError>;
}
