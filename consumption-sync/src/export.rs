use std::io::Write;

use consumption_client::domain::StatisticRow;
use serde::Serialize;
use time::format_description::well_known::Rfc3339;

#[derive(Serialize)]
struct CsvRow<'a> {
    ts: String,
    statistic_id: &'a str,
    kwh: f64,
    cumulative_kwh: f64,
}

/// Write statistics as CSV with a header row. Returns the number of rows.
pub fn write_csv<W: Write>(rows: &[StatisticRow], out: W) -> anyhow::Result<usize> {
    let mut wtr = csv::Writer::from_writer(out);
    for row in rows {
        wtr.serialize(CsvRow {
            ts: row.ts.format(&Rfc3339)?,
            statistic_id: &row.statistic_id,
            kwh: row.kwh,
            cumulative_kwh: row.cumulative_kwh,
        })?;
    }
    wtr.flush()?;
    Ok(rows.len())
}
