//! In-crate fakes shared by unit tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono_tz::Tz;
use consumption_client::domain::DateRange;
use time::{Date, OffsetDateTime};

use crate::pipeline::{ImportPipeline, PipelineSettings};
use crate::provider::{Contract, Credentials, ProviderClient, ProviderError, RawSample, SessionManager, Tariff};
use crate::registry::InstallationRegistry;
use crate::sinks::InMemoryStatisticsSink;
use crate::transform::calendar;

pub const ZRH: Tz = chrono_tz::Europe::Zurich;

fn samples_every(range: DateRange, tz: Tz, step: time::Duration, kwh: f64) -> Vec<RawSample> {
    let start = calendar::day_start_utc(range.start, tz).unwrap();
    let end = calendar::day_start_utc(range.end, tz).unwrap();
    let mut out = Vec::new();
    let mut ts: OffsetDateTime = start;
    while ts < end {
        out.push(RawSample {
            ts,
            kwh,
            tariff: Tariff::Low,
            status: "VALID".to_string(),
        });
        ts += step;
    }
    out
}

/// One sample per hour covering every local day of `range`.
pub fn hourly_samples(range: DateRange, tz: Tz, kwh: f64) -> Vec<RawSample> {
    samples_every(range, tz, time::Duration::hours(1), kwh)
}

pub fn quarter_hour_samples(range: DateRange, tz: Tz, kwh: f64) -> Vec<RawSample> {
    samples_every(range, tz, time::Duration::minutes(15), kwh)
}

#[derive(Debug)]
pub struct FakeSession {
    pub login: usize,
}

/// Provider serving 0.5 kWh every hour of every day before `available_until`.
pub struct FakeProvider {
    pub logins: AtomicUsize,
    pub fetches: AtomicUsize,
    pub discoveries: AtomicUsize,
    reject: AtomicBool,
    login_delay: Duration,
    fetch_delay: Duration,
    available_until: Mutex<Option<Date>>,
    errors: Mutex<VecDeque<ProviderError>>,
    contracts: Vec<Contract>,
}

impl FakeProvider {
    pub fn new() -> Self {
        Self {
            logins: AtomicUsize::new(0),
            fetches: AtomicUsize::new(0),
            discoveries: AtomicUsize::new(0),
            reject: AtomicBool::new(false),
            login_delay: Duration::ZERO,
            fetch_delay: Duration::ZERO,
            available_until: Mutex::new(None),
            errors: Mutex::new(VecDeque::new()),
            contracts: Vec::new(),
        }
    }

    pub fn with_login_delay(mut self, delay: Duration) -> Self {
        self.login_delay = delay;
        self
    }

    pub fn with_fetch_delay(mut self, delay: Duration) -> Self {
        self.fetch_delay = delay;
        self
    }

    pub fn with_available_until(self, day: Date) -> Self {
        self.set_available_until(Some(day));
        self
    }

    pub fn with_contracts(mut self, contracts: Vec<Contract>) -> Self {
        self.contracts = contracts;
        self
    }

    pub fn set_available_until(&self, day: Option<Date>) {
        *self.available_until.lock().unwrap() = day;
    }

    pub fn reject_logins(&self, reject: bool) {
        self.reject.store(reject, Ordering::SeqCst);
    }

    /// Fail the next fetch with `error`.
    pub fn push_error(&self, error: ProviderError) {
        self.errors.lock().unwrap().push_back(error);
    }
}

#[async_trait::async_trait]
impl ProviderClient for FakeProvider {
    type Session = FakeSession;

    fn name(&self) -> &str {
        "ekz"
    }

    async fn authenticate(&self, _credentials: &Credentials) -> Result<FakeSession, ProviderError> {
        let login = self.logins.fetch_add(1, Ordering::SeqCst) + 1;
        tokio::time::sleep(self.login_delay).await;
        if self.reject.load(Ordering::SeqCst) {
            return Err(ProviderError::Authentication("invalid credentials".to_string()));
        }
        Ok(FakeSession { login })
    }

    async fn fetch(
        &self,
        _session: &FakeSession,
        installation_id: &str,
        range: DateRange,
    ) -> Result<Vec<RawSample>, ProviderError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.fetch_delay).await;
        let injected = self.errors.lock().unwrap().pop_front();
        if let Some(e) = injected {
            return Err(e);
        }

        let available_until = *self.available_until.lock().unwrap();
        let end = match available_until {
            Some(until) => range.end.min(until),
            None => range.end,
        };
        match DateRange::new(range.start, end) {
            Ok(available) => Ok(hourly_samples(available, ZRH, 0.5)),
            Err(_) => Err(ProviderError::NoData {
                installation_id: installation_id.to_string(),
                range,
            }),
        }
    }

    async fn installations(&self, _session: &FakeSession) -> Result<Vec<Contract>, ProviderError> {
        self.discoveries.fetch_add(1, Ordering::SeqCst);
        Ok(self.contracts.clone())
    }
}

pub fn credentials() -> Credentials {
    Credentials {
        username: "user".to_string(),
        password: "pass".to_string(),
    }
}

pub fn settings() -> PipelineSettings {
    PipelineSettings {
        provider_name: "ekz".to_string(),
        timezone: ZRH,
        max_days_per_run: 30,
        fetch_timeout: Duration::from_millis(100),
        samples_per_hour: 1,
    }
}

pub fn pipeline(
    provider: Arc<FakeProvider>,
    registry: Arc<InstallationRegistry>,
    sink: Arc<InMemoryStatisticsSink>,
) -> ImportPipeline<FakeProvider, InMemoryStatisticsSink> {
    let sessions = Arc::new(SessionManager::new(provider, credentials()));
    ImportPipeline::new(sessions, registry, sink, settings())
}
