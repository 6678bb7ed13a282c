use serde::{Deserialize, Serialize};
use time::{Date, Duration, OffsetDateTime};

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum DomainError {
    #[error("empty date range: {start} is not before {end}")]
    EmptyRange { start: Date, end: Date },
}

/// A metered electricity connection as tracked by the sync registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Installation {
    pub id: String,
    /// Earliest date for which the provider may hold data. Never changes once set.
    pub contract_start: Date,
    /// No data exists after this date.
    pub move_out_date: Option<Date>,
    /// Inclusive end of the most recently committed range.
    pub last_import_end: Option<Date>,
    pub last_success_at: Option<OffsetDateTime>,
}

impl Installation {
    pub fn new(id: impl Into<String>, contract_start: Date, move_out_date: Option<Date>) -> Self {
        Self {
            id: id.into(),
            contract_start,
            move_out_date,
            last_import_end: None,
            last_success_at: None,
        }
    }

    /// First date not yet committed.
    pub fn next_import_start(&self) -> Date {
        match self.last_import_end {
            Some(end) => end.saturating_add(Duration::days(1)),
            None => self.contract_start,
        }
    }
}

/// Half-open date interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    pub start: Date,
    pub end: Date,
}

impl DateRange {
    pub fn new(start: Date, end: Date) -> Result<Self, DomainError> {
        if start >= end {
            return Err(DomainError::EmptyRange { start, end });
        }
        Ok(Self { start, end })
    }

    pub fn days(&self) -> i64 {
        (self.end - self.start).whole_days()
    }

    /// Last date inside the range.
    pub fn last_day(&self) -> Date {
        self.end.saturating_sub(Duration::days(1))
    }

    pub fn contains(&self, date: Date) -> bool {
        date >= self.start && date < self.end
    }

    /// Shorten the range to at most `max_days` days, keeping the start.
    pub fn clamp_days(self, max_days: u32) -> Self {
        if max_days == 0 || self.days() <= i64::from(max_days) {
            return self;
        }
        Self {
            start: self.start,
            end: self.start.saturating_add(Duration::days(i64::from(max_days))),
        }
    }

    pub fn iter_days(&self) -> impl Iterator<Item = Date> {
        let end = self.end;
        std::iter::successors(Some(self.start), move |d| d.next_day().filter(|n| *n < end))
            .take_while(move |d| *d < end)
    }
}

impl std::fmt::Display for DateRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

/// Statistic/entity identifier used by the host for one installation.
pub fn statistic_id(provider: &str, installation_id: &str) -> String {
    format!("electricity_consumption_{provider}_{installation_id}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::date;

    #[test]
    fn next_import_start_uses_contract_start_without_prior_import() {
        let inst = Installation::new("4000123", date!(2023 - 01 - 01), None);
        assert_eq!(inst.next_import_start(), date!(2023 - 01 - 01));
    }

    #[test]
    fn next_import_start_is_day_after_last_import() {
        let mut inst = Installation::new("4000123", date!(2023 - 01 - 01), None);
        inst.last_import_end = Some(date!(2023 - 02 - 28));
        assert_eq!(inst.next_import_start(), date!(2023 - 03 - 01));
    }

    #[test]
    fn date_range_rejects_empty_interval() {
        let res = DateRange::new(date!(2023 - 01 - 10), date!(2023 - 01 - 10));
        assert!(matches!(res, Err(DomainError::EmptyRange { .. })));
    }

    #[test]
    fn date_range_iterates_half_open() {
        let r = DateRange::new(date!(2023 - 01 - 30), date!(2023 - 02 - 02)).unwrap();
        let days: Vec<Date> = r.iter_days().collect();
        assert_eq!(
            days,
            vec![date!(2023 - 01 - 30), date!(2023 - 01 - 31), date!(2023 - 02 - 01)]
        );
        assert_eq!(r.days(), 3);
        assert_eq!(r.last_day(), date!(2023 - 02 - 01));
        assert!(!r.contains(date!(2023 - 02 - 02)));
    }

    #[test]
    fn clamp_days_keeps_start() {
        let r = DateRange::new(date!(2023 - 01 - 01), date!(2023 - 06 - 01)).unwrap();
        let c = r.clamp_days(30);
        assert_eq!(c.start, date!(2023 - 01 - 01));
        assert_eq!(c.end, date!(2023 - 01 - 31));
        assert_eq!(r.clamp_days(0), r);
    }

    #[test]
    fn statistic_id_follows_naming_convention() {
        assert_eq!(statistic_id("ekz", "4000123"), "electricity_consumption_ekz_4000123");
    }

    #[test]
    fn installation_serializes_dates_as_iso_strings() {
        let inst = Installation::new("1", date!(2023 - 01 - 01), Some(date!(2023 - 06 - 01)));
        let json = serde_json::to_string(&inst).unwrap();
        assert!(json.contains("\"contract_start\":\"2023-01-01\""));
        let back: Installation = serde_json::from_str(&json).unwrap();
        assert_eq!(back, inst);
    }
}
