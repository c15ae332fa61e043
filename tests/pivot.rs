use assert_matches::assert_matches;
use serde_json::{Value, json};

use surgegauge::db::Db;
use surgegauge::domain::{Dataset, LocationType, ModelRunId, SourceKey, StationName, parse_time};
use surgegauge::error::SurgeError;
use surgegauge::loader::Loader;
use surgegauge::pivot::PivotEngine;
use surgegauge::registry::{Registry, StationRecord};
use surgegauge::transform::DataRecord;

const STATION: &str = "8651370";

fn source_key(data_source: &str, variable: &str) -> SourceKey {
    SourceKey::new(data_source, "noaa", "noaa", variable, "m", LocationType::Tidal).unwrap()
}

fn seed_station(db: &Db) -> i64 {
    Registry::new(db)
        .resolve_or_create_station(&StationRecord::new(
            STATION.parse().unwrap(),
            LocationType::Tidal,
        ))
        .unwrap()
}

fn seed_source(db: &Db, data_source: &str, variable: &str, dataset: Dataset) -> i64 {
    Registry::new(db)
        .resolve_or_create_source(&source_key(data_source, variable), "prefix", dataset, None)
        .unwrap()
}

fn record(
    source_id: i64,
    station_id: i64,
    timemark: &str,
    time: &str,
    slot: usize,
    value: f64,
) -> DataRecord {
    let mut values = [None; 5];
    values[slot] = Some(value);
    DataRecord {
        source_id,
        station_id,
        model_run_id: None,
        timemark: timemark.to_string(),
        time: time.to_string(),
        values,
    }
}

fn station() -> StationName {
    STATION.parse().unwrap()
}

#[test]
fn pivot_completeness_outer_joins_disjoint_times() {
    let mut db = Db::open_in_memory().unwrap();
    let station_id = seed_station(&db);
    let gauge = seed_source(&db, "tidal_gauge", "water_level", Dataset::Obs);
    let buoy = seed_source(&db, "ocean_buoy", "wave_height", Dataset::Obs);

    let batch = vec![
        record(gauge, station_id, "2023-04-23T12:00:00", "2023-04-23T12:00:00", 0, 1.12),
        record(buoy, station_id, "2023-04-23T12:00:00", "2023-04-23T12:06:00", 1, 0.43),
    ];
    Loader::new(&mut db).load_batch(Dataset::Obs, &batch).unwrap();

    let rows = PivotEngine::new(&db)
        .obs_series(
            &station(),
            parse_time("2023-04-23T12:00").unwrap(),
            parse_time("2023-04-23T12:06").unwrap(),
            &["tidal_gauge".to_string(), "ocean_buoy".to_string()],
            None,
        )
        .unwrap();

    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].time_stamp, "2023-04-23T12:00:00");
    assert_eq!(rows[0].columns["tidal_gauge_water_level"], json!(1.12));
    assert_eq!(rows[0].columns["ocean_buoy_wave_height"], Value::Null);
    assert_eq!(rows[1].time_stamp, "2023-04-23T12:06:00");
    assert_eq!(rows[1].columns["tidal_gauge_water_level"], Value::Null);
    assert_eq!(rows[1].columns["ocean_buoy_wave_height"], json!(0.43));
}

#[test]
fn pivot_rejects_unsafe_source_names_before_querying() {
    let db = Db::open_in_memory().unwrap();
    let engine = PivotEngine::new(&db);

    for name in ["tidal_gauge;--", "a b", "x'y", "drop()"] {
        let err = engine
            .obs_series(
                &station(),
                parse_time("2023-04-23T12:00").unwrap(),
                parse_time("2023-04-23T12:06").unwrap(),
                &[name.to_string()],
                None,
            )
            .unwrap_err();
        assert_matches!(err, SurgeError::InvalidSourceName(_));
    }

    let run: ModelRunId = "ec95d-2023042312-gfsforecast".parse().unwrap();
    assert_matches!(
        engine
            .forecast_series(&station(), &run, "bad name")
            .unwrap_err(),
        SurgeError::InvalidSourceName(_)
    );
}

#[test]
fn pivot_requests_each_category_once_in_order() {
    let mut db = Db::open_in_memory().unwrap();
    let station_id = seed_station(&db);
    let gauge = seed_source(&db, "tidal_gauge", "water_level", Dataset::Obs);

    let batch = vec![record(
        gauge,
        station_id,
        "2023-04-23T12:00:00",
        "2023-04-23T12:00:00",
        0,
        1.12,
    )];
    Loader::new(&mut db).load_batch(Dataset::Obs, &batch).unwrap();

    let rows = PivotEngine::new(&db)
        .obs_series(
            &station(),
            parse_time("2023-04-23T12:00").unwrap(),
            parse_time("2023-04-23T12:06").unwrap(),
            &[
                "tidal_gauge".to_string(),
                "tidal_gauge".to_string(),
                "mystery_source".to_string(),
            ],
            None,
        )
        .unwrap();

    assert_eq!(rows.len(), 1);
    let labels: Vec<&String> = rows[0].columns.keys().collect();
    assert_eq!(labels, ["tidal_gauge_water_level", "mystery_source"]);
    assert_eq!(rows[0].columns["mystery_source"], Value::Null);
}

#[test]
fn pivot_empty_source_list_yields_empty_result() {
    let db = Db::open_in_memory().unwrap();
    seed_station(&db);

    let rows = PivotEngine::new(&db)
        .obs_series(
            &station(),
            parse_time("2023-04-23T12:00").unwrap(),
            parse_time("2023-04-23T12:06").unwrap(),
            &[],
            None,
        )
        .unwrap();
    assert!(rows.is_empty());
}

#[test]
fn pivot_window_bounds_are_inclusive() {
    let mut db = Db::open_in_memory().unwrap();
    let station_id = seed_station(&db);
    let gauge = seed_source(&db, "tidal_gauge", "water_level", Dataset::Obs);

    let batch = vec![
        record(gauge, station_id, "2023-04-23T12:00:00", "2023-04-23T11:54:00", 0, 1.08),
        record(gauge, station_id, "2023-04-23T12:00:00", "2023-04-23T12:00:00", 0, 1.12),
        record(gauge, station_id, "2023-04-23T12:00:00", "2023-04-23T12:06:00", 0, 1.15),
        record(gauge, station_id, "2023-04-23T12:00:00", "2023-04-23T12:12:00", 0, 1.18),
    ];
    Loader::new(&mut db).load_batch(Dataset::Obs, &batch).unwrap();

    let rows = PivotEngine::new(&db)
        .obs_series(
            &station(),
            parse_time("2023-04-23T12:00").unwrap(),
            parse_time("2023-04-23T12:06").unwrap(),
            &["tidal_gauge".to_string()],
            None,
        )
        .unwrap();

    let times: Vec<&str> = rows.iter().map(|row| row.time_stamp.as_str()).collect();
    assert_eq!(times, ["2023-04-23T12:00:00", "2023-04-23T12:06:00"]);
}

#[test]
fn forecast_cycles_are_isolated_by_timemark() {
    let mut db = Db::open_in_memory().unwrap();
    let station_id = seed_station(&db);
    let forecast = seed_source(&db, "gfsforecast.ec95d", "water_level", Dataset::Model);

    let noon: ModelRunId = "ec95d-2023042312-gfsforecast".parse().unwrap();
    let evening: ModelRunId = "ec95d-2023042318-gfsforecast".parse().unwrap();

    let mut batch = Vec::new();
    for (run, value) in [(&noon, 1.40), (&evening, 1.55)] {
        batch.push(DataRecord {
            source_id: forecast,
            station_id,
            model_run_id: Some(run.to_string()),
            timemark: run.timemark().to_string(),
            time: "2023-04-24T00:00:00".to_string(),
            values: [Some(value), None, None, None, None],
        });
    }
    Loader::new(&mut db).load_batch(Dataset::Model, &batch).unwrap();

    let engine = PivotEngine::new(&db);
    let noon_rows = engine
        .forecast_series(&station(), &noon, "gfsforecast.ec95d")
        .unwrap();
    let evening_rows = engine
        .forecast_series(&station(), &evening, "gfsforecast.ec95d")
        .unwrap();

    assert_eq!(noon_rows.len(), 1);
    assert_eq!(noon_rows[0].columns["gfsforecastec95d"], json!(1.40));
    assert_eq!(evening_rows.len(), 1);
    assert_eq!(evening_rows[0].columns["gfsforecastec95d"], json!(1.55));
}

#[test]
fn obs_series_merges_nowcast_column() {
    let mut db = Db::open_in_memory().unwrap();
    let station_id = seed_station(&db);
    let gauge = seed_source(&db, "tidal_gauge", "water_level", Dataset::Obs);
    let nowcast = seed_source(&db, "nowcast.ec95d", "water_level", Dataset::Model);

    let obs_batch = vec![record(
        gauge,
        station_id,
        "2023-04-23T12:00:00",
        "2023-04-23T12:00:00",
        0,
        1.12,
    )];
    Loader::new(&mut db).load_batch(Dataset::Obs, &obs_batch).unwrap();

    let run: ModelRunId = "ec95d-2023042312-nowcast".parse().unwrap();
    let model_batch = vec![
        DataRecord {
            source_id: nowcast,
            station_id,
            model_run_id: Some(run.to_string()),
            timemark: run.timemark().to_string(),
            time: "2023-04-23T12:00:00".to_string(),
            values: [Some(1.10), None, None, None, None],
        },
        DataRecord {
            source_id: nowcast,
            station_id,
            model_run_id: Some(run.to_string()),
            timemark: run.timemark().to_string(),
            time: "2023-04-23T12:06:00".to_string(),
            values: [Some(1.13), None, None, None, None],
        },
    ];
    Loader::new(&mut db).load_batch(Dataset::Model, &model_batch).unwrap();

    let rows = PivotEngine::new(&db)
        .obs_series(
            &station(),
            parse_time("2023-04-23T12:00").unwrap(),
            parse_time("2023-04-23T12:06").unwrap(),
            &["tidal_gauge".to_string()],
            Some("nowcast.ec95d"),
        )
        .unwrap();

    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].columns["tidal_gauge_water_level"], json!(1.12));
    assert_eq!(rows[0].columns["nowcastec95d"], json!(1.10));
    assert_eq!(rows[1].columns["tidal_gauge_water_level"], Value::Null);
    assert_eq!(rows[1].columns["nowcastec95d"], json!(1.13));
}
