//! Periodic and on-demand fan-out of import runs.
//!
//! Each installation owns a slot with a lock and a cancellation token. A run
//! holds the lock for its whole duration; a trigger that finds it taken is
//! coalesced into a no-op instead of queueing a second run.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use futures::StreamExt;
use time::Date;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::gap;
use crate::pipeline::{ImportPipeline, ImportRun};
use crate::provider::ProviderClient;
use crate::registry::RegistryError;
use crate::sinks::StatisticsSink;
use crate::status::StatusBoard;
use crate::transform::calendar;

#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    pub interval: Duration,
    pub max_concurrent_runs: usize,
    pub run_on_startup: bool,
    /// Refresh installations from the provider before each scheduled pass.
    pub discover: bool,
}

struct Slot {
    lock: Arc<Mutex<()>>,
    cancel: CancellationToken,
}

#[derive(Default)]
struct Slots {
    active: HashMap<String, Slot>,
    /// Installations being removed; no new run may claim them.
    removing: HashSet<String>,
}

/// Exclusive right to run one installation.
pub struct Claim {
    installation_id: String,
    cancel: CancellationToken,
    _guard: OwnedMutexGuard<()>,
}

#[derive(Debug)]
pub enum TriggerResult {
    /// A run for this installation was already in flight.
    Coalesced,
    Completed(ImportRun),
}

pub struct Scheduler<P: ProviderClient, K: StatisticsSink> {
    pipeline: Arc<ImportPipeline<P, K>>,
    status: Arc<StatusBoard>,
    slots: StdMutex<Slots>,
    shutdown: CancellationToken,
    settings: SchedulerSettings,
}

impl<P, K> Scheduler<P, K>
where
    P: ProviderClient + 'static,
    K: StatisticsSink + 'static,
{
    pub fn new(pipeline: Arc<ImportPipeline<P, K>>, status: Arc<StatusBoard>, settings: SchedulerSettings) -> Self {
        Self {
            pipeline,
            status,
            slots: StdMutex::new(Slots::default()),
            shutdown: CancellationToken::new(),
            settings,
        }
    }

    pub fn pipeline(&self) -> &Arc<ImportPipeline<P, K>> {
        &self.pipeline
    }

    pub fn status(&self) -> &Arc<StatusBoard> {
        &self.status
    }

    /// Today's date in the provider's timezone.
    pub fn today(&self) -> Date {
        calendar::today(self.pipeline.settings().timezone)
    }

    /// `None` while another run holds the installation or it is being removed.
    pub fn try_claim(&self, installation_id: &str) -> Option<Claim> {
        let (lock, cancel) = {
            let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
            if slots.removing.contains(installation_id) {
                return None;
            }
            let slot = slots.active.entry(installation_id.to_string()).or_insert_with(|| Slot {
                lock: Arc::new(Mutex::new(())),
                cancel: self.shutdown.child_token(),
            });
            (slot.lock.clone(), slot.cancel.clone())
        };
        let guard = lock.try_lock_owned().ok()?;
        Some(Claim {
            installation_id: installation_id.to_string(),
            cancel,
            _guard: guard,
        })
    }

    pub async fn run_claimed(&self, claim: Claim, today: Date) -> ImportRun {
        let run = self.pipeline.run(&claim.installation_id, today, &claim.cancel).await;
        // Runs of installations that are gone leave no status behind.
        if self.pipeline.registry().get(&claim.installation_id).await.is_some() {
            self.status.record(&run);
        }
        run
    }

    pub async fn trigger_on(&self, installation_id: &str, today: Date) -> TriggerResult {
        match self.try_claim(installation_id) {
            Some(claim) => TriggerResult::Completed(self.run_claimed(claim, today).await),
            None => {
                metrics::counter!("import_triggers_coalesced_total").increment(1);
                tracing::debug!(installation_id, "run already in flight, trigger coalesced");
                TriggerResult::Coalesced
            }
        }
    }

    /// Start a run in the background. `None` when one is already in flight.
    pub fn spawn_trigger(self: &Arc<Self>, installation_id: &str) -> Option<JoinHandle<ImportRun>> {
        let Some(claim) = self.try_claim(installation_id) else {
            metrics::counter!("import_triggers_coalesced_total").increment(1);
            tracing::debug!(installation_id, "run already in flight, trigger coalesced");
            return None;
        };
        let this = self.clone();
        let today = self.today();
        Some(tokio::spawn(async move { this.run_claimed(claim, today).await }))
    }

    /// One run per installation that is not caught up, at most
    /// `max_concurrent_runs` at a time.
    pub async fn run_all_on(&self, today: Date) -> Vec<ImportRun> {
        if self.settings.discover {
            self.discover().await;
        }

        let ids: Vec<String> = self
            .pipeline
            .registry()
            .list()
            .await
            .into_iter()
            .filter(|inst| {
                let caught_up = gap::is_caught_up(inst);
                if caught_up {
                    tracing::debug!(installation_id = %inst.id, "skipping installation imported up to move-out");
                }
                !caught_up
            })
            .map(|inst| inst.id)
            .collect();

        futures::stream::iter(ids)
            .map(|id| async move { self.trigger_on(&id, today).await })
            .buffer_unordered(self.settings.max_concurrent_runs.max(1))
            .filter_map(|result| async move {
                match result {
                    TriggerResult::Completed(run) => Some(run),
                    TriggerResult::Coalesced => None,
                }
            })
            .collect()
            .await
    }

    pub async fn run_all(&self) -> Vec<ImportRun> {
        self.run_all_on(self.today()).await
    }

    async fn discover(&self) {
        match self.pipeline.discover_installations().await {
            Ok(added) => tracing::info!(added, "installation discovery finished"),
            Err(e) => tracing::warn!(error = %e, "installation discovery failed, using known installations"),
        }
    }

    /// Tick until shutdown. Each tick fans out in the background so a slow
    /// pass never delays the next one.
    pub async fn run(self: Arc<Self>) {
        let period = self.settings.interval;
        let start = if self.settings.run_on_startup {
            tokio::time::Instant::now()
        } else {
            tokio::time::Instant::now() + period
        };
        let mut ticker = tokio::time::interval_at(start, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        // A startup pass discovers on its own.
        if self.settings.discover && !self.settings.run_on_startup {
            self.discover().await;
        }

        tracing::info!(interval_secs = period.as_secs(), "scheduler started");
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    tracing::info!("scheduler stopped");
                    break;
                }
                _ = ticker.tick() => {
                    let this = self.clone();
                    tokio::spawn(async move {
                        let runs = this.run_all().await;
                        tracing::info!(runs = runs.len(), "scheduled pass finished");
                    });
                }
            }
        }
    }

    /// Cancel every in-flight run and stop the tick loop.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Cancel any run of `installation_id`, wait for it to stop, then forget
    /// the installation. Triggers arriving meanwhile are refused.
    pub async fn remove_installation(&self, installation_id: &str) -> Result<bool, RegistryError> {
        let running = {
            let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
            slots.removing.insert(installation_id.to_string());
            slots
                .active
                .get(installation_id)
                .map(|slot| (slot.lock.clone(), slot.cancel.clone()))
        };

        let held = match running {
            Some((lock, cancel)) => {
                cancel.cancel();
                Some(lock.lock_owned().await)
            }
            None => None,
        };
        let removed = self.pipeline.registry().remove(installation_id).await;
        self.status.remove(installation_id);
        drop(held);

        {
            let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
            slots.active.remove(installation_id);
            slots.removing.remove(installation_id);
        }

        let removed = removed?.is_some();
        if removed {
            tracing::info!(installation_id, "installation removed");
        }
        Ok(removed)
    }
}
