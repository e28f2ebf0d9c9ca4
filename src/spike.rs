//! Earliest future forecast above a price threshold.

use chrono::{DateTime, NaiveDateTime, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::forecast_store::{ForecastRecord, ForecastStore, PeriodType, StoreError};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SpikeResult {
    #[serde(rename = "SETTLEMENTDATE")]
    pub timestamp: NaiveDateTime,
    #[serde(rename = "RRP")]
    pub price: f64,
}

// Settlement timestamps are market-local wall-clock time.
pub fn market_local_now(now: DateTime<Utc>, tz: Tz) -> NaiveDateTime {
    now.with_timezone(&tz).naive_local()
}

pub fn find_first_spike(
    records: &[ForecastRecord],
    now: NaiveDateTime,
    threshold: f64,
) -> Option<SpikeResult> {
    records
        .iter()
        .filter(|r| r.period_type == PeriodType::Forecast)
        .filter(|r| r.timestamp > now && r.price > threshold)
        .min_by_key(|r| r.timestamp)
        .map(|r| SpikeResult {
            timestamp: r.timestamp,
            price: r.price,
        })
}

pub fn scan_for_spike(
    store: &dyn ForecastStore,
    now: DateTime<Utc>,
    tz: Tz,
    threshold: f64,
) -> Result<Option<SpikeResult>, StoreError> {
    let records = store.scan(now)?;
    let local_now = market_local_now(now, tz);
    let spike = find_first_spike(&records, local_now, threshold);

    info!(
        component = "spike",
        event = "spike.scan.finish",
        records = records.len(),
        threshold,
        market_now = %local_now,
        found = spike.is_some(),
        spike_at = ?spike.map(|s| s.timestamp)
    );

    Ok(spike)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration as ChronoDuration, NaiveDate, TimeZone};

    fn t0() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2025, 3, 10)
            .unwrap()
            .and_hms_opt(12, 0, 0)
            .unwrap()
    }

    fn record(offset_minutes: i64, price: f64, period_type: PeriodType) -> ForecastRecord {
        ForecastRecord {
            timestamp: t0() + ChronoDuration::minutes(offset_minutes),
            price,
            period_type,
            expires_at: 0,
        }
    }

    #[test]
    fn returns_earliest_breach() {
        let records = vec![
            record(30, 100.0, PeriodType::Forecast),
            record(60, 200.0, PeriodType::Forecast),
            record(90, 90.0, PeriodType::Forecast),
        ];
        let spike = find_first_spike(&records, t0(), 150.0).unwrap();
        assert_eq!(spike.timestamp, t0() + ChronoDuration::minutes(60));
        assert_eq!(spike.price, 200.0);
    }

    #[test]
    fn order_of_input_does_not_matter() {
        let records = vec![
            record(120, 500.0, PeriodType::Forecast),
            record(60, 151.0, PeriodType::Forecast),
        ];
        let spike = find_first_spike(&records, t0(), 150.0).unwrap();
        assert_eq!(spike.price, 151.0);
    }

    #[test]
    fn ignores_actuals_past_rows_and_threshold_ties() {
        let records = vec![
            record(-30, 900.0, PeriodType::Forecast),
            record(0, 900.0, PeriodType::Forecast),
            record(30, 900.0, PeriodType::Actual),
            record(60, 150.0, PeriodType::Forecast),
        ];
        assert_eq!(find_first_spike(&records, t0(), 150.0), None);
        assert_eq!(find_first_spike(&[], t0(), 150.0), None);
    }

    #[test]
    fn market_now_uses_the_configured_zone() {
        let utc = Utc.with_ymd_and_hms(2025, 3, 10, 2, 0, 0).unwrap();
        assert_eq!(market_local_now(utc, chrono_tz::Australia::Brisbane), t0());
    }
}
