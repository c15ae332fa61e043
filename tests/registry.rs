use std::fs;

use assert_matches::assert_matches;
use camino::Utf8PathBuf;

use surgegauge::db::Db;
use surgegauge::domain::{Dataset, LocationType, SourceKey};
use surgegauge::error::SurgeError;
use surgegauge::registry::{Registry, StationRecord};

fn temp_csv(temp: &tempfile::TempDir, name: &str, content: &str) -> Utf8PathBuf {
    let path = Utf8PathBuf::from_path_buf(temp.path().join(name)).unwrap();
    fs::write(path.as_std_path(), content).unwrap();
    path
}

#[test]
fn station_csv_load_is_idempotent() {
    let temp = tempfile::tempdir().unwrap();
    let path = temp_csv(
        &temp,
        "stations.csv",
        "station_name,lat,lon,tz,gauge_owner,location_name,location_type,country,state,county\n\
         8651370,35.22,-75.63,EST,NOAA,Duck NC,tidal,US,NC,Dare\n\
         30052,34.21,-77.79,EST,NCEM,Wilmington,river,US,NC,New Hanover\n",
    );

    let db = Db::open_in_memory().unwrap();
    let registry = Registry::new(&db);
    assert_eq!(registry.load_stations_csv(&path).unwrap(), 2);
    assert_eq!(registry.load_stations_csv(&path).unwrap(), 2);

    let count: i64 = db
        .conn()
        .query_row("SELECT COUNT(*) FROM station", [], |row| row.get(0))
        .unwrap();
    assert_eq!(count, 2);

    let id = registry.station_id("8651370").unwrap();
    assert_eq!(registry.station_id("8651370").unwrap(), id);
}

#[test]
fn source_csv_binds_station_scoped_sources() {
    let temp = tempfile::tempdir().unwrap();
    let db = Db::open_in_memory().unwrap();
    let registry = Registry::new(&db);
    registry
        .resolve_or_create_station(&StationRecord::new(
            "8651370".parse().unwrap(),
            LocationType::Tidal,
        ))
        .unwrap();

    let path = temp_csv(
        &temp,
        "sources.csv",
        "data_source,source_name,source_archive,source_variable,units,location_type,filename_prefix,dataset,station_name\n\
         tidal_gauge,noaa,noaa,water_level,m,tidal,gauge,obs,\n\
         gfsforecast.ec95d,adcirc,renci,water_level,m,tidal,adcirc_gfs,model,8651370\n",
    );
    assert_eq!(registry.load_sources_csv(&path).unwrap(), 2);

    let obs = registry.sources_for_dataset(Dataset::Obs).unwrap();
    assert_eq!(obs.len(), 1);
    assert_eq!(obs[0].key.data_source, "tidal_gauge");
    assert_eq!(obs[0].station_id, None);

    let model = registry.sources_for_dataset(Dataset::Model).unwrap();
    assert_eq!(model.len(), 1);
    assert_eq!(model[0].filename_prefix, "adcirc_gfs");
    assert!(model[0].station_id.is_some());
}

#[test]
fn source_csv_rejects_unknown_station() {
    let temp = tempfile::tempdir().unwrap();
    let db = Db::open_in_memory().unwrap();
    let registry = Registry::new(&db);

    let path = temp_csv(
        &temp,
        "sources.csv",
        "data_source,source_name,source_archive,source_variable,units,location_type,filename_prefix,dataset,station_name\n\
         gfsforecast.ec95d,adcirc,renci,water_level,m,tidal,adcirc_gfs,model,0000000\n",
    );
    assert_matches!(
        registry.load_sources_csv(&path).unwrap_err(),
        SurgeError::StationNotFound(_)
    );
}

#[test]
fn concurrent_style_resolution_yields_one_row() {
    // Two registries over the same database stand in for two processes
    // contending on source creation; the constraint, not a lock, arbitrates.
    let db = Db::open_in_memory().unwrap();
    let first = Registry::new(&db);
    let second = Registry::new(&db);

    let key = SourceKey::new(
        "tidal_gauge",
        "noaa",
        "noaa",
        "water_level",
        "m",
        LocationType::Tidal,
    )
    .unwrap();
    let a = first
        .resolve_or_create_source(&key, "gauge", Dataset::Obs, None)
        .unwrap();
    let b = second
        .resolve_or_create_source(&key, "gauge", Dataset::Obs, None)
        .unwrap();
    assert_eq!(a, b);

    let count: i64 = db
        .conn()
        .query_row("SELECT COUNT(*) FROM source", [], |row| row.get(0))
        .unwrap();
    assert_eq!(count, 1);

    let variable = first.variable_for_data_source("tidal_gauge").unwrap();
    assert_eq!(variable.as_deref(), Some("water_level"));
}
