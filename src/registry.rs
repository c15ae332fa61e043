use camino::Utf8Path;
use rusqlite::{Connection, OptionalExtension, params};
use serde::Deserialize;
use tracing::{debug, info};

use crate::db::Db;
use crate::domain::{Dataset, LocationType, SourceKey, StationName};
use crate::error::SurgeError;

/// Station metadata as authored in the upstream station CSVs (original
/// harvester `geom_*.csv` layout, minus the geometry blob).
#[derive(Debug, Clone)]
pub struct StationRecord {
    pub name: StationName,
    pub lat: Option<f64>,
    pub lon: Option<f64>,
    pub tz: Option<String>,
    pub gauge_owner: Option<String>,
    pub location_name: Option<String>,
    pub location_type: LocationType,
    pub country: Option<String>,
    pub state: Option<String>,
    pub county: Option<String>,
}

impl StationRecord {
    pub fn new(name: StationName, location_type: LocationType) -> Self {
        Self {
            name,
            lat: None,
            lon: None,
            tz: None,
            gauge_owner: None,
            location_name: None,
            location_type,
            country: None,
            state: None,
            county: None,
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawStationRow {
    station_name: String,
    #[serde(default)]
    lat: Option<f64>,
    #[serde(default)]
    lon: Option<f64>,
    #[serde(default)]
    tz: Option<String>,
    #[serde(default)]
    gauge_owner: Option<String>,
    #[serde(default)]
    location_name: Option<String>,
    location_type: String,
    #[serde(default)]
    country: Option<String>,
    #[serde(default)]
    state: Option<String>,
    #[serde(default)]
    county: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawSourceRow {
    data_source: String,
    source_name: String,
    source_archive: String,
    source_variable: String,
    units: String,
    location_type: String,
    filename_prefix: String,
    dataset: String,
    #[serde(default)]
    station_name: Option<String>,
}

/// One registered source, as the tracker and transformer consume it.
#[derive(Debug, Clone)]
pub struct SourceMeta {
    pub source_id: i64,
    pub key: SourceKey,
    pub filename_prefix: String,
    pub dataset: Dataset,
    pub station_id: Option<i64>,
}

/// Durable mapping of stations, sources, and harvest files to surrogate
/// identifiers. All create operations are lookup-or-insert on the natural
/// key; the uniqueness constraint is the arbiter under concurrency, so a
/// conflicting insert falls through to a re-read instead of failing.
pub struct Registry<'a> {
    conn: &'a Connection,
}

impl<'a> Registry<'a> {
    pub fn new(db: &'a Db) -> Self {
        Self { conn: db.conn() }
    }

    pub fn resolve_or_create_station(&self, record: &StationRecord) -> Result<i64, SurgeError> {
        let inserted = self.conn.execute(
            "INSERT INTO station (station_name, lat, lon, tz, gauge_owner, location_name,
                                  location_type, country, state, county)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
             ON CONFLICT(station_name) DO NOTHING",
            params![
                record.name.as_str(),
                record.lat,
                record.lon,
                record.tz,
                record.gauge_owner,
                record.location_name,
                record.location_type.as_str(),
                record.country,
                record.state,
                record.county,
            ],
        )?;
        if inserted > 0 {
            debug!(station = %record.name, "created station");
        }
        self.station_id(record.name.as_str())
    }

    /// Strict lookup; fails when the station has never been registered.
    pub fn station_id(&self, name: &str) -> Result<i64, SurgeError> {
        self.conn
            .query_row(
                "SELECT station_id FROM station WHERE station_name = ?1",
                [name],
                |row| row.get(0),
            )
            .optional()?
            .ok_or_else(|| SurgeError::StationNotFound(name.to_string()))
    }

    pub fn resolve_or_create_source(
        &self,
        key: &SourceKey,
        filename_prefix: &str,
        dataset: Dataset,
        station_id: Option<i64>,
    ) -> Result<i64, SurgeError> {
        if filename_prefix.trim().is_empty() {
            return Err(SurgeError::InvalidSourceKey(format!(
                "missing filename_prefix for {}",
                key.label()
            )));
        }
        let inserted = self.conn.execute(
            "INSERT INTO source (data_source, source_name, source_archive, source_variable,
                                 units, location_type, filename_prefix, dataset, station_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT(data_source, source_name, source_archive, source_variable, units, location_type)
             DO NOTHING",
            params![
                key.data_source,
                key.source_name,
                key.source_archive,
                key.source_variable,
                key.units,
                key.location_type.as_str(),
                filename_prefix.trim(),
                dataset.as_str(),
                station_id,
            ],
        )?;
        if inserted > 0 {
            debug!(source = %key.label(), "created source");
        }
        self.source_id(key)
    }

    /// Strict lookup by natural key.
    pub fn source_id(&self, key: &SourceKey) -> Result<i64, SurgeError> {
        self.conn
            .query_row(
                "SELECT source_id FROM source
                 WHERE data_source = ?1 AND source_name = ?2 AND source_archive = ?3
                   AND source_variable = ?4 AND units = ?5 AND location_type = ?6",
                params![
                    key.data_source,
                    key.source_name,
                    key.source_archive,
                    key.source_variable,
                    key.units,
                    key.location_type.as_str(),
                ],
                |row| row.get(0),
            )
            .optional()?
            .ok_or_else(|| SurgeError::SourceNotFound(key.label()))
    }

    /// All sources feeding one dataset, ordered by filename prefix. Drives
    /// harvest-directory discovery.
    pub fn sources_for_dataset(&self, dataset: Dataset) -> Result<Vec<SourceMeta>, SurgeError> {
        let mut statement = self.conn.prepare(
            "SELECT source_id, data_source, source_name, source_archive, source_variable,
                    units, location_type, filename_prefix, dataset, station_id
             FROM source WHERE dataset = ?1
             ORDER BY filename_prefix",
        )?;
        let rows = statement.query_map([dataset.as_str()], Self::source_meta_from_row)?;
        let mut sources = Vec::new();
        for row in rows {
            sources.push(row??);
        }
        Ok(sources)
    }

    /// The registered variable for a data-source category, if any. Used by
    /// the pivot engine to label observation columns.
    pub fn variable_for_data_source(&self, data_source: &str) -> Result<Option<String>, SurgeError> {
        Ok(self
            .conn
            .query_row(
                "SELECT source_variable FROM source WHERE data_source = ?1 LIMIT 1",
                [data_source],
                |row| row.get(0),
            )
            .optional()?)
    }

    /// Bulk-loads station metadata CSVs (create-if-absent per row).
    pub fn load_stations_csv(&self, path: &Utf8Path) -> Result<usize, SurgeError> {
        let mut reader = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .from_path(path.as_std_path())?;
        let mut count = 0;
        for row in reader.deserialize::<RawStationRow>() {
            let raw = row?;
            let record = StationRecord {
                name: raw.station_name.parse()?,
                lat: raw.lat,
                lon: raw.lon,
                tz: none_if_empty(raw.tz),
                gauge_owner: none_if_empty(raw.gauge_owner),
                location_name: none_if_empty(raw.location_name),
                location_type: raw.location_type.parse()?,
                country: none_if_empty(raw.country),
                state: none_if_empty(raw.state),
                county: none_if_empty(raw.county),
            };
            self.resolve_or_create_station(&record)?;
            count += 1;
        }
        info!(path = %path, count, "loaded station metadata");
        Ok(count)
    }

    /// Bulk-loads source metadata CSVs. A row naming a station binds the
    /// source to it (station-scoped model sources); the station must already
    /// be registered.
    pub fn load_sources_csv(&self, path: &Utf8Path) -> Result<usize, SurgeError> {
        let mut reader = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .from_path(path.as_std_path())?;
        let mut count = 0;
        for row in reader.deserialize::<RawSourceRow>() {
            let raw = row?;
            let key = SourceKey::new(
                &raw.data_source,
                &raw.source_name,
                &raw.source_archive,
                &raw.source_variable,
                &raw.units,
                raw.location_type.parse()?,
            )?;
            let station_id = match none_if_empty(raw.station_name) {
                Some(name) => Some(self.station_id(&name)?),
                None => None,
            };
            let dataset: Dataset = raw.dataset.parse()?;
            self.resolve_or_create_source(&key, &raw.filename_prefix, dataset, station_id)?;
            count += 1;
        }
        info!(path = %path, count, "loaded source metadata");
        Ok(count)
    }

    fn source_meta_from_row(
        row: &rusqlite::Row<'_>,
    ) -> rusqlite::Result<Result<SourceMeta, SurgeError>> {
        let source_id: i64 = row.get(0)?;
        let data_source: String = row.get(1)?;
        let source_name: String = row.get(2)?;
        let source_archive: String = row.get(3)?;
        let source_variable: String = row.get(4)?;
        let units: String = row.get(5)?;
        let location_type: String = row.get(6)?;
        let filename_prefix: String = row.get(7)?;
        let dataset: String = row.get(8)?;
        let station_id: Option<i64> = row.get(9)?;
        Ok((|| {
            Ok(SourceMeta {
                source_id,
                key: SourceKey::new(
                    &data_source,
                    &source_name,
                    &source_archive,
                    &source_variable,
                    &units,
                    location_type.parse()?,
                )?,
                filename_prefix,
                dataset: dataset.parse()?,
                station_id,
            })
        })())
    }
}

fn none_if_empty(value: Option<String>) -> Option<String> {
    value.filter(|s| !s.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;
    use crate::db::Db;

    fn tidal_gauge_key() -> SourceKey {
        SourceKey::new(
            "tidal_gauge",
            "noaa",
            "noaa",
            "water_level",
            "m",
            LocationType::Tidal,
        )
        .unwrap()
    }

    #[test]
    fn station_resolve_is_idempotent() {
        let db = Db::open_in_memory().unwrap();
        let registry = Registry::new(&db);
        let record = StationRecord::new("8651370".parse().unwrap(), LocationType::Tidal);

        let first = registry.resolve_or_create_station(&record).unwrap();
        let second = registry.resolve_or_create_station(&record).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn source_resolve_is_idempotent() {
        let db = Db::open_in_memory().unwrap();
        let registry = Registry::new(&db);
        let key = tidal_gauge_key();

        let first = registry
            .resolve_or_create_source(&key, "noaa_stationdata", Dataset::Obs, None)
            .unwrap();
        let second = registry
            .resolve_or_create_source(&key, "noaa_stationdata", Dataset::Obs, None)
            .unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn strict_lookups_fail_when_absent() {
        let db = Db::open_in_memory().unwrap();
        let registry = Registry::new(&db);

        assert_matches!(
            registry.station_id("0000000").unwrap_err(),
            SurgeError::StationNotFound(_)
        );
        assert_matches!(
            registry.source_id(&tidal_gauge_key()).unwrap_err(),
            SurgeError::SourceNotFound(_)
        );
    }

    #[test]
    fn source_requires_filename_prefix() {
        let db = Db::open_in_memory().unwrap();
        let registry = Registry::new(&db);

        assert_matches!(
            registry
                .resolve_or_create_source(&tidal_gauge_key(), "  ", Dataset::Obs, None)
                .unwrap_err(),
            SurgeError::InvalidSourceKey(_)
        );
    }
}
