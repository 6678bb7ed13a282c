//! Local-calendar arithmetic in the provider's timezone.

use chrono::{Datelike, NaiveDate, TimeZone, Timelike};
use chrono_tz::Tz;
use time::{Date, Duration, OffsetDateTime};

fn to_naive(date: Date) -> Option<NaiveDate> {
    NaiveDate::from_yo_opt(date.year(), u32::from(date.ordinal()))
}

fn from_naive(date: NaiveDate) -> Option<Date> {
    Date::from_ordinal_date(date.year(), u16::try_from(date.ordinal()).ok()?).ok()
}

/// Calendar date of `ts` in `tz`.
pub fn local_date(ts: OffsetDateTime, tz: Tz) -> Option<Date> {
    let utc = chrono::DateTime::from_timestamp(ts.unix_timestamp(), 0)?;
    from_naive(utc.with_timezone(&tz).date_naive())
}

/// UTC instant at which `date` begins in `tz`.
pub fn day_start_utc(date: Date, tz: Tz) -> Option<OffsetDateTime> {
    let midnight = to_naive(date)?.and_hms_opt(0, 0, 0)?;
    // Zones that skip midnight on DST days start the day at the first valid instant.
    let local = tz.from_local_datetime(&midnight).earliest().or_else(|| {
        let one_am = midnight.with_hour(1)?;
        tz.from_local_datetime(&one_am).earliest()
    })?;
    OffsetDateTime::from_unix_timestamp(local.timestamp()).ok()
}

/// Number of hours in `date` in `tz`: 23 or 25 on DST switch days, else 24.
pub fn hours_in_local_day(date: Date, tz: Tz) -> i64 {
    let next = date.saturating_add(Duration::days(1));
    match (day_start_utc(date, tz), day_start_utc(next, tz)) {
        (Some(start), Some(end)) => (end - start).whole_hours(),
        _ => 24,
    }
}

/// Today's date in `tz`.
pub fn today(tz: Tz) -> Date {
    let now = OffsetDateTime::now_utc();
    local_date(now, tz).unwrap_or_else(|| now.date())
}
