use chrono::{Duration as ChronoDuration, NaiveDate, NaiveDateTime, TimeZone, Utc};
use rrp_forecast::{ForecastRecord, ForecastStore, PeriodType, SqliteForecastStore, StoreError};

fn ts(step: i64) -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2025, 7, 1)
        .unwrap()
        .and_hms_opt(0, 0, 0)
        .unwrap()
        + ChronoDuration::minutes(30 * step)
}

fn records(count: i64, price: f64, expires_at: i64) -> Vec<ForecastRecord> {
    (0..count)
        .map(|i| ForecastRecord {
            timestamp: ts(i),
            price: price + i as f64,
            period_type: if i < count / 2 {
                PeriodType::Actual
            } else {
                PeriodType::Forecast
            },
            expires_at,
        })
        .collect()
}

fn open() -> (tempfile::TempDir, SqliteForecastStore) {
    let dir = tempfile::tempdir().unwrap();
    let store = SqliteForecastStore::open(&dir.path().join("nested").join("forecast.sqlite")).unwrap();
    (dir, store)
}

const FAR_FUTURE: i64 = 4_102_444_800;

#[test]
fn replace_swaps_to_a_new_generation_and_retires_the_old_one() {
    let (_dir, store) = open();
    let now = Utc::now();

    let first = records(10, 50.0, FAR_FUTURE);
    let report = store.replace_all(&first, 4).unwrap();
    assert_eq!(report.generation, 1);
    assert_eq!(report.chunks, 3);
    assert_eq!(report.retired_records, 0);
    assert_eq!(store.scan(now).unwrap(), first);

    let second = records(96, 80.0, FAR_FUTURE);
    let report = store.replace_all(&second, 25).unwrap();
    assert_eq!(report.generation, 2);
    assert_eq!(report.written, 96);
    assert_eq!(report.chunks, 4);
    assert_eq!(report.retired_records, 10);

    assert_eq!(store.current_generation().unwrap(), 2);
    assert_eq!(store.stored_generations().unwrap(), vec![2]);
    assert_eq!(store.scan(now).unwrap(), second);
}

#[test]
fn failed_chunk_keeps_the_previous_generation_current() {
    let (_dir, store) = open();
    let now = Utc::now();

    let current = records(6, 10.0, FAR_FUTURE);
    store.replace_all(&current, 25).unwrap();

    // A repeated timestamp in the second chunk violates the primary key.
    let mut broken = records(8, 99.0, FAR_FUTURE);
    broken[6].timestamp = broken[5].timestamp;

    let err = store.replace_all(&broken, 4).unwrap_err();
    match err {
        StoreError::PartialWrite {
            written,
            failed_chunk,
            ..
        } => {
            assert_eq!(written, 4);
            assert_eq!(failed_chunk, 1);
        }
        other => panic!("unexpected error: {other}"),
    }

    assert_eq!(store.scan(now).unwrap(), current);
    assert_eq!(store.stored_generations().unwrap(), vec![1]);

    // The next successful publish still moves forward.
    let report = store.replace_all(&records(2, 1.0, FAR_FUTURE), 25).unwrap();
    assert_eq!(report.generation, 3);
}

#[test]
fn scan_skips_expired_records() {
    let (_dir, store) = open();
    let now = Utc.with_ymd_and_hms(2025, 7, 1, 12, 0, 0).unwrap();

    let mut set = records(4, 20.0, now.timestamp() + 60);
    set[0].expires_at = now.timestamp();
    set[1].expires_at = now.timestamp() - 1;
    store.replace_all(&set, 25).unwrap();

    let live = store.scan(now).unwrap();
    assert_eq!(live, set[2..].to_vec());
    assert!(store.scan(now + ChronoDuration::minutes(2)).unwrap().is_empty());
}

#[test]
fn period_type_survives_the_round_trip() {
    let (_dir, store) = open();
    let set = records(48, 30.0, FAR_FUTURE);
    store.replace_all(&set, 25).unwrap();

    let back = store.scan(Utc::now()).unwrap();
    let actual = back.iter().filter(|r| r.period_type == PeriodType::Actual).count();
    let forecast = back.iter().filter(|r| r.period_type == PeriodType::Forecast).count();
    assert_eq!((actual, forecast), (24, 24));
}

#[test]
fn zero_chunk_size_is_rejected_without_touching_the_store() {
    let (_dir, store) = open();
    let set = records(3, 1.0, FAR_FUTURE);
    store.replace_all(&set, 25).unwrap();

    assert!(matches!(
        store.replace_all(&records(5, 2.0, FAR_FUTURE), 0),
        Err(StoreError::InvalidChunkSize)
    ));
    assert_eq!(store.scan(Utc::now()).unwrap(), set);
    assert_eq!(store.current_generation().unwrap(), 1);
}

#[test]
fn record_serializes_with_store_field_names() {
    let record = ForecastRecord {
        timestamp: ts(1),
        price: 88.5,
        period_type: PeriodType::Forecast,
        expires_at: 1_751_328_000,
    };
    let value = serde_json::to_value(record).unwrap();
    assert_eq!(value["SETTLEMENTDATE"], "2025-07-01T00:30:00");
    assert_eq!(value["RRP"], 88.5);
    assert_eq!(value["PeriodType"], "Forecast");
    assert_eq!(value["TimeToExist"], 1_751_328_000);
}
