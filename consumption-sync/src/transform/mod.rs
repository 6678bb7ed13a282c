pub mod calendar;

use std::collections::{BTreeMap, HashMap};

use chrono_tz::Tz;
use consumption_client::domain::{DateRange, Reading};
use time::{macros::datetime, Date, Duration, OffsetDateTime};

use crate::pipeline::PipelineError;
use crate::provider::RawSample;

/// Pure validation of a portal sample.
///
/// Rules:
/// - kWh must be finite and non-negative.
/// - ts must be within a broad sanity window [2000-01-01, 2100-01-01).
pub fn validate_sample(sample: &RawSample) -> Result<(), PipelineError> {
    if !sample.kwh.is_finite() || sample.kwh < 0.0 {
        return Err(PipelineError::Transform("kwh must be non-negative".to_string()));
    }

    let min_ts = datetime!(2000-01-01 00:00:00 UTC);
    let max_ts = datetime!(2100-01-01 00:00:00 UTC);

    if sample.ts < min_ts || sample.ts >= max_ts {
        return Err(PipelineError::Transform("timestamp out of allowed range".to_string()));
    }

    Ok(())
}

/// Hourly view of one fetch.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Normalized {
    /// Every fully covered hour, ascending.
    pub readings: Vec<Reading>,
    /// Consecutive hours starting at the first hour of the requested range,
    /// up to the first hole.
    pub committable: Vec<Reading>,
    /// Last day of the leading run of complete local days.
    pub last_complete_day: Option<Date>,
    pub incomplete_days: Vec<Date>,
    pub rejected: usize,
}

fn truncate_to_hour(ts: OffsetDateTime) -> Option<OffsetDateTime> {
    let secs = ts.unix_timestamp();
    OffsetDateTime::from_unix_timestamp(secs - secs.rem_euclid(3600)).ok()
}

/// Turn raw portal samples into hourly readings and judge which local days
/// of `range` are complete.
///
/// Samples the portal marks unavailable are dropped, overlapping tariff series
/// are merged (first sample per timestamp wins) and sub-hourly values are
/// summed per UTC hour. An hour only counts once all `samples_per_hour`
/// intervals of the configured data type are present, and a day only once all
/// of its 23, 24 or 25 hours are.
pub fn normalize(samples: Vec<RawSample>, range: DateRange, tz: Tz, samples_per_hour: usize) -> Normalized {
    let mut rejected = 0;
    let mut kept: Vec<RawSample> = samples
        .into_iter()
        .filter(RawSample::is_available)
        .filter(|s| match validate_sample(s) {
            Ok(()) => true,
            Err(e) => {
                metrics::counter!("validation_samples_rejected_total").increment(1);
                tracing::debug!(error = %e, ts = %s.ts, "rejected sample");
                rejected += 1;
                false
            }
        })
        .filter(|s| calendar::local_date(s.ts, tz).is_some_and(|d| range.contains(d)))
        .collect();

    kept.sort_by_key(|s| s.ts);
    kept.dedup_by_key(|s| s.ts);

    let per_hour = samples_per_hour.max(1);

    let mut buckets: BTreeMap<OffsetDateTime, (f64, usize)> = BTreeMap::new();
    for s in &kept {
        let Some(hour) = truncate_to_hour(s.ts) else { continue };
        let entry = buckets.entry(hour).or_insert((0.0, 0));
        entry.0 += s.kwh;
        entry.1 += 1;
    }

    let readings: Vec<Reading> = buckets
        .into_iter()
        .filter(|(_, (_, count))| *count >= per_hour)
        .map(|(ts, (kwh, _))| Reading { ts, kwh })
        .collect();

    let mut committable = Vec::new();
    if let Some(mut expected) = calendar::day_start_utc(range.start, tz) {
        for r in &readings {
            if r.ts != expected {
                break;
            }
            committable.push(*r);
            expected += Duration::hours(1);
        }
    }

    let mut hours_per_day: HashMap<Date, i64> = HashMap::new();
    for r in &readings {
        if let Some(day) = calendar::local_date(r.ts, tz) {
            *hours_per_day.entry(day).or_default() += 1;
        }
    }

    let mut last_complete_day = None;
    let mut leading_run = true;
    let mut incomplete_days = Vec::new();
    for day in range.iter_days() {
        let have = hours_per_day.get(&day).copied().unwrap_or(0);
        if have == calendar::hours_in_local_day(day, tz) {
            if leading_run {
                last_complete_day = Some(day);
            }
        } else {
            leading_run = false;
            incomplete_days.push(day);
        }
    }

    Normalized {
        readings,
        committable,
        last_complete_day,
        incomplete_days,
        rejected,
    }
}
