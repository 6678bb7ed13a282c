use std::collections::BTreeMap;
use std::sync::RwLock;

use serde::Serialize;
use time::OffsetDateTime;

use crate::pipeline::ImportRun;

#[derive(Debug, Clone, Default, Serialize)]
pub struct InstallationStatus {
    pub last_run: Option<ImportRun>,
    pub consecutive_failures: u32,
    pub last_success_at: Option<OffsetDateTime>,
}

/// Latest run outcome per installation, as shown by `GET /status`.
#[derive(Default)]
pub struct StatusBoard {
    inner: RwLock<BTreeMap<String, InstallationStatus>>,
}

impl StatusBoard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, run: &ImportRun) {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        let status = inner.entry(run.installation_id.clone()).or_default();
        if run.outcome.is_failure() {
            status.consecutive_failures += 1;
        } else {
            status.consecutive_failures = 0;
            status.last_success_at = Some(run.finished_at);
        }
        status.last_run = Some(run.clone());
    }

    pub fn get(&self, installation_id: &str) -> Option<InstallationStatus> {
        self.inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(installation_id)
            .cloned()
    }

    pub fn snapshot(&self) -> BTreeMap<String, InstallationStatus> {
        self.inner.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn remove(&self, installation_id: &str) {
        self.inner
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(installation_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::RunState;

    fn run(outcome: RunState) -> ImportRun {
        let now = OffsetDateTime::now_utc();
        ImportRun {
            installation_id: "1".to_string(),
            requested_range: None,
            fetched_readings: 0,
            committed: 0,
            outcome,
            error: None,
            last_import_end: None,
            started_at: now,
            finished_at: now,
        }
    }

    #[test]
    fn failures_are_counted_until_next_success() {
        let board = StatusBoard::new();
        board.record(&run(RunState::FailedTransient));
        board.record(&run(RunState::FailedFatal));
        assert_eq!(board.get("1").unwrap().consecutive_failures, 2);
        assert!(board.get("1").unwrap().last_success_at.is_none());

        board.record(&run(RunState::Committed));
        let status = board.get("1").unwrap();
        assert_eq!(status.consecutive_failures, 0);
        assert!(status.last_success_at.is_some());
        assert_eq!(status.last_run.unwrap().outcome, RunState::Committed);
    }

    #[test]
    fn status_serializes_outcome_in_snake_case() {
        let board = StatusBoard::new();
        board.record(&run(RunState::PartialCommitted));
        let json = serde_json::to_string(&board.snapshot()).unwrap();
        assert!(json.contains("\"outcome\":\"partial_committed\""));
    }
}
