pub mod statistics_queries;

pub use statistics_queries::{
    ensure_schema, last_statistic, load_statistics, to_utc_primitive, STATISTICS_TABLE,
};
