pub mod installation;
pub mod reading;

pub use installation::{statistic_id, DateRange, DomainError, Installation};
pub use reading::{LastStatistic, Reading, StatisticRow};
