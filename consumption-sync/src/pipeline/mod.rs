use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono_tz::Tz;
use consumption_client::domain::{statistic_id, DateRange, Installation, LastStatistic, Reading, StatisticRow};
use serde::Serialize;
use time::{Date, OffsetDateTime};
use tokio_util::sync::CancellationToken;

use crate::gap::{compute_gap, Gap};
use crate::provider::{ProviderClient, ProviderError, SessionManager};
use crate::registry::{InstallationRegistry, RegistryError};
use crate::sinks::StatisticsSink;
use crate::transform::{self, calendar};

#[derive(thiserror::Error, Debug)]
pub enum PipelineError {
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error("transform error: {0}")]
    Transform(String),
    #[error("sink error: {0}")]
    Sink(String),
    #[error("run cancelled")]
    Cancelled,
}

impl PipelineError {
    /// Terminal state a run ends in when it fails with this error.
    pub fn outcome(&self) -> RunState {
        match self {
            Self::Provider(ProviderError::Authentication(_)) => RunState::FailedFatal,
            Self::Registry(RegistryError::NotFound(_)) => RunState::FailedFatal,
            _ => RunState::FailedTransient,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    UpToDate,
    Committed,
    PartialCommitted,
    FailedFatal,
    FailedTransient,
}

impl RunState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::UpToDate => "up_to_date",
            Self::Committed => "committed",
            Self::PartialCommitted => "partial_committed",
            Self::FailedFatal => "failed_fatal",
            Self::FailedTransient => "failed_transient",
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, Self::FailedFatal | Self::FailedTransient)
    }
}

/// Record of one pipeline run for one installation.
#[derive(Debug, Clone, Serialize)]
pub struct ImportRun {
    pub installation_id: String,
    pub requested_range: Option<DateRange>,
    /// Complete hours produced from the fetch.
    pub fetched_readings: usize,
    /// Rows written to the statistics store.
    pub committed: usize,
    pub outcome: RunState,
    pub error: Option<String>,
    pub last_import_end: Option<Date>,
    pub started_at: OffsetDateTime,
    pub finished_at: OffsetDateTime,
}

impl ImportRun {
    fn start(installation_id: &str) -> Self {
        let now = OffsetDateTime::now_utc();
        Self {
            installation_id: installation_id.to_string(),
            requested_range: None,
            fetched_readings: 0,
            committed: 0,
            outcome: RunState::UpToDate,
            error: None,
            last_import_end: None,
            started_at: now,
            finished_at: now,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    /// Provider tag used in statistic ids.
    pub provider_name: String,
    /// Zone in which the provider's days begin and end.
    pub timezone: Tz,
    /// Upper bound on the days fetched by one run; 0 means unbounded.
    pub max_days_per_run: u32,
    pub fetch_timeout: Duration,
    /// Metering intervals that make up one full hour of the fetched data type.
    pub samples_per_hour: usize,
}

/// What was written before the registry is touched.
struct Staged {
    last_complete_day: Option<Date>,
    note: Option<String>,
}

/// Imports the missing range of one installation per call:
/// gap, fetch, normalize, dedupe against the sink, commit, advance registry.
pub struct ImportPipeline<P: ProviderClient, K: StatisticsSink> {
    sessions: Arc<SessionManager<P>>,
    registry: Arc<InstallationRegistry>,
    sink: Arc<K>,
    settings: PipelineSettings,
}

impl<P: ProviderClient, K: StatisticsSink> ImportPipeline<P, K> {
    pub fn new(
        sessions: Arc<SessionManager<P>>,
        registry: Arc<InstallationRegistry>,
        sink: Arc<K>,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            sessions,
            registry,
            sink,
            settings,
        }
    }

    pub fn registry(&self) -> &Arc<InstallationRegistry> {
        &self.registry
    }

    pub fn sessions(&self) -> &Arc<SessionManager<P>> {
        &self.sessions
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    pub fn statistic_id(&self, installation_id: &str) -> String {
        statistic_id(&self.settings.provider_name, installation_id)
    }

    /// Register every contract the provider lists for the account.
    pub async fn discover_installations(&self) -> Result<usize, PipelineError> {
        let session = self.sessions.session().await?;
        let contracts = match self.sessions.provider().installations(&session).await {
            Ok(contracts) => contracts,
            Err(ProviderError::Authentication(reason)) => {
                self.sessions.invalidate(&session).await;
                return Err(ProviderError::Authentication(reason).into());
            }
            Err(e) => return Err(e.into()),
        };
        Ok(self.registry.sync_from_discovery(&contracts).await?)
    }

    /// Run the pipeline once. Failures are recorded in the returned run,
    /// never propagated.
    pub async fn run(&self, installation_id: &str, today: Date, cancel: &CancellationToken) -> ImportRun {
        let mut run = ImportRun::start(installation_id);

        match self.execute(installation_id, today, cancel, &mut run).await {
            Ok(state) => run.outcome = state,
            Err(e) => {
                run.outcome = e.outcome();
                run.error = Some(e.to_string());
            }
        }
        run.last_import_end = self
            .registry
            .get(installation_id)
            .await
            .and_then(|i| i.last_import_end);
        run.finished_at = OffsetDateTime::now_utc();

        metrics::counter!("consumption_import_runs_total", "outcome" => run.outcome.as_str()).increment(1);
        let range = run.requested_range.map(|r| r.to_string()).unwrap_or_default();
        match run.outcome {
            RunState::FailedFatal => tracing::error!(
                installation_id,
                %range,
                error = run.error.as_deref().unwrap_or_default(),
                "import run failed"
            ),
            RunState::FailedTransient => tracing::warn!(
                installation_id,
                %range,
                error = run.error.as_deref().unwrap_or_default(),
                "import run failed, will retry on next tick"
            ),
            outcome => tracing::info!(
                installation_id,
                %range,
                outcome = outcome.as_str(),
                fetched = run.fetched_readings,
                committed = run.committed,
                last_import_end = ?run.last_import_end,
                "import run finished"
            ),
        }
        run
    }

    async fn execute(
        &self,
        installation_id: &str,
        today: Date,
        cancel: &CancellationToken,
        run: &mut ImportRun,
    ) -> Result<RunState, PipelineError> {
        let installation = self
            .registry
            .get(installation_id)
            .await
            .ok_or_else(|| RegistryError::NotFound(installation_id.to_string()))?;

        let range = match compute_gap(&installation, today) {
            Gap::UpToDate => return Ok(RunState::UpToDate),
            Gap::Pending(range) => range.clamp_days(self.settings.max_days_per_run),
        };
        run.requested_range = Some(range);

        let staged = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(PipelineError::Cancelled),
            staged = self.fetch_and_commit(&installation, range, run) => staged?,
        };
        if cancel.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }

        if let Some(day) = staged.last_complete_day {
            self.registry
                .advance_last_import(installation_id, day, OffsetDateTime::now_utc())
                .await?;
        }

        run.error = staged.note;
        if staged.last_complete_day == Some(range.last_day()) {
            Ok(RunState::Committed)
        } else {
            Ok(RunState::PartialCommitted)
        }
    }

    async fn fetch_and_commit(
        &self,
        installation: &Installation,
        range: DateRange,
        run: &mut ImportRun,
    ) -> Result<Staged, PipelineError> {
        let session = self.sessions.session().await?;

        let started = Instant::now();
        let fetched = tokio::time::timeout(
            self.settings.fetch_timeout,
            self.sessions.provider().fetch(&session, &installation.id, range),
        )
        .await;
        metrics::histogram!("provider_fetch_latency_seconds").record(started.elapsed().as_secs_f64());

        let mut note = None;
        let samples = match fetched {
            Err(_) => {
                return Err(ProviderError::TransientFetch(format!(
                    "fetch timed out after {:?}",
                    self.settings.fetch_timeout
                ))
                .into())
            }
            Ok(Ok(samples)) => samples,
            Ok(Err(e @ ProviderError::NoData { .. })) => {
                tracing::info!(installation_id = %installation.id, %range, "provider has no data yet");
                note = Some(e.to_string());
                Vec::new()
            }
            Ok(Err(ProviderError::Authentication(reason))) => {
                self.sessions.invalidate(&session).await;
                return Err(ProviderError::Authentication(reason).into());
            }
            Ok(Err(e)) => return Err(e.into()),
        };

        let tz = self.settings.timezone;
        let normalized = transform::normalize(samples, range, tz, self.settings.samples_per_hour);
        run.fetched_readings = normalized.readings.len();
        if let Some(first) = normalized.incomplete_days.first() {
            tracing::info!(
                installation_id = %installation.id,
                incomplete_days = normalized.incomplete_days.len(),
                first_incomplete = %first,
                "range not fully available"
            );
            note.get_or_insert_with(|| format!("data incomplete from {first}"));
        }

        let statistic_id = self.statistic_id(&installation.id);
        let last = self.sink.last_statistic(&statistic_id).await?;
        self.check_consistency(installation, range, last.as_ref());

        let fresh: Vec<Reading> = normalized
            .committable
            .iter()
            .filter(|r| last.map_or(true, |l| r.ts > l.ts))
            .copied()
            .collect();

        if !fresh.is_empty() {
            let base = last.map(|l| l.cumulative_kwh).unwrap_or(0.0);
            let rows = StatisticRow::accumulate(&statistic_id, &fresh, base);
            run.committed = self.sink.merge(&statistic_id, &rows).await?;
            metrics::counter!("consumption_readings_committed_total").increment(run.committed as u64);
        }

        Ok(Staged {
            last_complete_day: normalized.last_complete_day,
            note,
        })
    }

    /// Warn when the store holds data the registry does not know about, or
    /// lacks data the registry claims was imported. The store wins.
    fn check_consistency(&self, installation: &Installation, range: DateRange, last: Option<&LastStatistic>) {
        let tz = self.settings.timezone;
        let Some(range_start) = calendar::day_start_utc(range.start, tz) else {
            return;
        };
        let second_day = calendar::day_start_utc(range.start.saturating_add(time::Duration::days(1)), tz);

        let detail = match (installation.last_import_end, last) {
            (Some(end), None) => Some(format!("registry imported up to {end} but the store is empty")),
            (Some(end), Some(l)) if l.ts < range_start - time::Duration::hours(1) => {
                Some(format!("store ends at {} but registry imported up to {end}", l.ts))
            }
            (_, Some(l)) if second_day.is_some_and(|d| l.ts >= d) => Some(format!(
                "store already holds data up to {} beyond the registry's {range}",
                l.ts
            )),
            _ => None,
        };

        if let Some(detail) = detail {
            let e = RegistryError::Inconsistent {
                installation_id: installation.id.clone(),
                detail,
            };
            metrics::counter!("registry_inconsistency_total").increment(1);
            tracing::warn!(installation_id = %installation.id, error = %e, "continuing with the statistics store as source of truth");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sinks::InMemoryStatisticsSink;
    use crate::testing::{hourly_samples, pipeline, FakeProvider, ZRH};
    use std::sync::atomic::Ordering;
    use time::macros::date;

    const ID: &str = "4000123";

    async fn setup(
        provider: FakeProvider,
        contract_start: Date,
        move_out: Option<Date>,
    ) -> (ImportPipeline<FakeProvider, InMemoryStatisticsSink>, Arc<FakeProvider>, Arc<InMemoryStatisticsSink>) {
        let provider = Arc::new(provider);
        let sink = Arc::new(InMemoryStatisticsSink::new());
        let registry = Arc::new(InstallationRegistry::in_memory());
        registry.upsert(ID, contract_start, move_out).await.unwrap();
        (pipeline(provider.clone(), registry, sink.clone()), provider, sink)
    }

    #[tokio::test]
    async fn first_run_imports_until_yesterday() {
        let (p, provider, sink) = setup(FakeProvider::new(), date!(2023 - 01 - 01), None).await;

        let run = p.run(ID, date!(2023 - 01 - 10), &CancellationToken::new()).await;

        assert_eq!(run.outcome, RunState::Committed);
        assert_eq!(
            run.requested_range,
            Some(DateRange::new(date!(2023 - 01 - 01), date!(2023 - 01 - 10)).unwrap())
        );
        assert_eq!(run.last_import_end, Some(date!(2023 - 01 - 09)));
        assert_eq!(run.committed, 216);
        let rows = sink.rows(&p.statistic_id(ID));
        assert_eq!(rows.len(), 216);
        assert_eq!(rows.last().unwrap().cumulative_kwh, 108.0);
        assert_eq!(provider.fetches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn partial_data_advances_only_to_last_complete_day() {
        let provider = FakeProvider::new().with_available_until(date!(2023 - 01 - 04));
        let (p, provider, sink) = setup(provider, date!(2023 - 01 - 01), None).await;

        let run = p.run(ID, date!(2023 - 01 - 06), &CancellationToken::new()).await;
        assert_eq!(run.outcome, RunState::PartialCommitted);
        assert_eq!(run.last_import_end, Some(date!(2023 - 01 - 03)));
        assert_eq!(run.committed, 72);
        assert!(run.error.is_some());

        provider.set_available_until(None);
        let run = p.run(ID, date!(2023 - 01 - 06), &CancellationToken::new()).await;
        assert_eq!(run.outcome, RunState::Committed);
        assert_eq!(
            run.requested_range,
            Some(DateRange::new(date!(2023 - 01 - 04), date!(2023 - 01 - 06)).unwrap())
        );
        assert_eq!(run.last_import_end, Some(date!(2023 - 01 - 05)));

        let rows = sink.rows(&p.statistic_id(ID));
        assert_eq!(rows.len(), 120);
        assert_eq!(rows.last().unwrap().cumulative_kwh, 60.0);
    }

    #[tokio::test]
    async fn nothing_available_keeps_registry_unchanged() {
        let provider = FakeProvider::new().with_available_until(date!(2023 - 01 - 01));
        let (p, _provider, sink) = setup(provider, date!(2023 - 01 - 01), None).await;

        let run = p.run(ID, date!(2023 - 01 - 03), &CancellationToken::new()).await;
        assert_eq!(run.outcome, RunState::PartialCommitted);
        assert_eq!(run.last_import_end, None);
        assert_eq!(run.committed, 0);
        assert!(sink.rows(&p.statistic_id(ID)).is_empty());
    }

    #[tokio::test]
    async fn recommitting_a_range_leaves_the_store_unchanged() {
        let provider = Arc::new(FakeProvider::new());
        let sink = Arc::new(InMemoryStatisticsSink::new());
        let today = date!(2023 - 01 - 05);

        let first = Arc::new(InstallationRegistry::in_memory());
        first.upsert(ID, date!(2023 - 01 - 01), None).await.unwrap();
        let p = pipeline(provider.clone(), first, sink.clone());
        p.run(ID, today, &CancellationToken::new()).await;
        let before = sink.rows(&p.statistic_id(ID));

        // A registry that forgot the import re-fetches the same range.
        let second = Arc::new(InstallationRegistry::in_memory());
        second.upsert(ID, date!(2023 - 01 - 01), None).await.unwrap();
        let p = pipeline(provider.clone(), second, sink.clone());
        let run = p.run(ID, today, &CancellationToken::new()).await;

        assert_eq!(run.outcome, RunState::Committed);
        assert_eq!(run.committed, 0);
        assert_eq!(run.last_import_end, Some(date!(2023 - 01 - 04)));
        assert_eq!(sink.rows(&p.statistic_id(ID)), before);
        assert_eq!(sink.merges.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn store_ahead_of_registry_only_adds_newer_hours() {
        let (p, _provider, sink) = setup(FakeProvider::new(), date!(2023 - 01 - 01), None).await;
        let seeded = DateRange::new(date!(2023 - 01 - 01), date!(2023 - 01 - 06)).unwrap();
        let readings: Vec<Reading> = hourly_samples(seeded, ZRH, 0.5)
            .into_iter()
            .map(|s| Reading { ts: s.ts, kwh: s.kwh })
            .collect();
        sink.insert_rows(&StatisticRow::accumulate(&p.statistic_id(ID), &readings, 0.0));

        let run = p.run(ID, date!(2023 - 01 - 10), &CancellationToken::new()).await;

        assert_eq!(run.outcome, RunState::Committed);
        assert_eq!(run.committed, 96);
        let rows = sink.rows(&p.statistic_id(ID));
        assert_eq!(rows.len(), 216);
        assert_eq!(rows.last().unwrap().cumulative_kwh, 108.0);
    }

    #[tokio::test]
    async fn failures_never_move_last_import_end() {
        let (p, provider, sink) = setup(FakeProvider::new(), date!(2023 - 01 - 01), None).await;
        let token = CancellationToken::new();
        p.run(ID, date!(2023 - 01 - 05), &token).await;

        provider.push_error(ProviderError::TransientFetch("503".to_string()));
        let run = p.run(ID, date!(2023 - 01 - 08), &token).await;
        assert_eq!(run.outcome, RunState::FailedTransient);
        assert_eq!(run.last_import_end, Some(date!(2023 - 01 - 04)));

        sink.fail_merges(true);
        let run = p.run(ID, date!(2023 - 01 - 08), &token).await;
        assert_eq!(run.outcome, RunState::FailedTransient);
        assert_eq!(run.last_import_end, Some(date!(2023 - 01 - 04)));

        sink.fail_merges(false);
        let run = p.run(ID, date!(2023 - 01 - 08), &token).await;
        assert_eq!(run.outcome, RunState::Committed);
        assert_eq!(run.last_import_end, Some(date!(2023 - 01 - 07)));
    }

    #[tokio::test]
    async fn authentication_failure_is_fatal_and_drops_the_session() {
        let (p, provider, sink) = setup(FakeProvider::new(), date!(2023 - 01 - 01), None).await;
        provider.push_error(ProviderError::Authentication("session expired".to_string()));

        let run = p.run(ID, date!(2023 - 01 - 05), &CancellationToken::new()).await;
        assert_eq!(run.outcome, RunState::FailedFatal);
        assert_eq!(run.last_import_end, None);
        assert!(sink.rows(&p.statistic_id(ID)).is_empty());

        let run = p.run(ID, date!(2023 - 01 - 05), &CancellationToken::new()).await;
        assert_eq!(run.outcome, RunState::Committed);
        assert_eq!(provider.logins.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn rejected_login_is_fatal() {
        let provider = FakeProvider::new();
        provider.reject_logins(true);
        let (p, provider, _sink) = setup(provider, date!(2023 - 01 - 01), None).await;

        let run = p.run(ID, date!(2023 - 01 - 05), &CancellationToken::new()).await;
        assert_eq!(run.outcome, RunState::FailedFatal);
        assert_eq!(provider.fetches.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn slow_fetch_times_out_as_transient() {
        let provider = FakeProvider::new().with_fetch_delay(Duration::from_millis(500));
        let (p, _provider, _sink) = setup(provider, date!(2023 - 01 - 01), None).await;

        let run = p.run(ID, date!(2023 - 01 - 05), &CancellationToken::new()).await;
        assert_eq!(run.outcome, RunState::FailedTransient);
        assert!(run.error.unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn cancelled_run_leaves_registry_untouched() {
        let (p, _provider, _sink) = setup(FakeProvider::new(), date!(2023 - 01 - 01), None).await;
        let token = CancellationToken::new();
        token.cancel();

        let run = p.run(ID, date!(2023 - 01 - 05), &token).await;
        assert_eq!(run.outcome, RunState::FailedTransient);
        assert_eq!(run.last_import_end, None);
    }

    #[tokio::test]
    async fn moved_out_and_imported_installation_is_up_to_date() {
        let (p, provider, _sink) = setup(FakeProvider::new(), date!(2023 - 01 - 01), Some(date!(2023 - 06 - 01))).await;
        p.registry()
            .advance_last_import(ID, date!(2023 - 06 - 01), OffsetDateTime::now_utc())
            .await
            .unwrap();

        let run = p.run(ID, date!(2023 - 07 - 01), &CancellationToken::new()).await;
        assert_eq!(run.outcome, RunState::UpToDate);
        assert_eq!(provider.fetches.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn long_history_is_imported_in_windows() {
        let (p, _provider, _sink) = setup(FakeProvider::new(), date!(2023 - 01 - 01), None).await;

        let run = p.run(ID, date!(2023 - 03 - 01), &CancellationToken::new()).await;
        assert_eq!(run.outcome, RunState::Committed);
        assert_eq!(run.last_import_end, Some(date!(2023 - 01 - 30)));

        let run = p.run(ID, date!(2023 - 03 - 01), &CancellationToken::new()).await;
        assert_eq!(run.last_import_end, Some(date!(2023 - 02 - 28)));
    }

    #[tokio::test]
    async fn discovery_registers_provider_contracts() {
        let provider = FakeProvider::new().with_contracts(vec![crate::provider::Contract {
            installation_id: "5000001".to_string(),
            move_in: date!(2022 - 05 - 01),
            move_out: None,
        }]);
        let (p, _provider, _sink) = setup(provider, date!(2023 - 01 - 01), None).await;

        assert_eq!(p.discover_installations().await.unwrap(), 1);
        let inst = p.registry().get("5000001").await.unwrap();
        assert_eq!(inst.contract_start, date!(2022 - 05 - 01));
        assert_eq!(p.registry().list().await.len(), 2);
    }

    #[tokio::test]
    async fn unknown_installation_is_fatal() {
        let (p, _provider, _sink) = setup(FakeProvider::new(), date!(2023 - 01 - 01), None).await;
        let run = p.run("missing", date!(2023 - 01 - 05), &CancellationToken::new()).await;
        assert_eq!(run.outcome, RunState::FailedFatal);
    }
}
