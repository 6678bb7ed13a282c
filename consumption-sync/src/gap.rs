use consumption_client::domain::{DateRange, Installation};
use time::Date;

/// What the next run of an installation has to fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Gap {
    UpToDate,
    Pending(DateRange),
}

/// True once everything up to the move-out date has been committed.
pub fn is_caught_up(installation: &Installation) -> bool {
    installation
        .move_out_date
        .is_some_and(|move_out| installation.next_import_start() >= move_out)
}

/// Dates that still need importing: from the day after the last committed
/// day (or the contract start) up to, but excluding, today or the move-out
/// date, whichever comes first.
pub fn compute_gap(installation: &Installation, today: Date) -> Gap {
    let start = installation.next_import_start();
    let end = match installation.move_out_date {
        Some(move_out) => today.min(move_out),
        None => today,
    };
    match DateRange::new(start, end) {
        Ok(range) => Gap::Pending(range),
        Err(_) => Gap::UpToDate,
    }
}
