use time::OffsetDateTime;

/// Consumption of one hour, anchored at the UTC start of that hour.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Reading {
    pub ts: OffsetDateTime,
    pub kwh: f64,
}

/// One row of the long-term statistics table.
#[derive(Debug, Clone, PartialEq)]
pub struct StatisticRow {
    pub ts: OffsetDateTime,
    pub statistic_id: String,
    pub kwh: f64,
    /// Running total since the first imported hour of this statistic.
    pub cumulative_kwh: f64,
}

/// Most recent row stored for a statistic.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LastStatistic {
    pub ts: OffsetDateTime,
    pub cumulative_kwh: f64,
}

impl StatisticRow {
    /// Turn ordered readings into rows whose running sum continues from `base`.
    pub fn accumulate(statistic_id: &str, readings: &[Reading], base: f64) -> Vec<StatisticRow> {
        let mut running = base;
        readings
            .iter()
            .map(|r| {
                running += r.kwh;
                StatisticRow {
                    ts: r.ts,
                    statistic_id: statistic_id.to_string(),
                    kwh: r.kwh,
                    cumulative_kwh: running,
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn accumulate_continues_from_base_sum() {
        let readings = [
            Reading { ts: datetime!(2023-01-01 00:00 UTC), kwh: 0.5 },
            Reading { ts: datetime!(2023-01-01 01:00 UTC), kwh: 0.25 },
        ];
        let rows = StatisticRow::accumulate("s", &readings, 10.0);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].cumulative_kwh, 10.5);
        assert_eq!(rows[1].cumulative_kwh, 10.75);
        assert_eq!(rows[1].kwh, 0.25);
    }
}
