use std::fs;

use camino::Utf8Path;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::db::{Db, VALUE_COLUMNS, with_retry};
use crate::domain::{Dataset, FileStatus};
use crate::error::SurgeError;
use crate::tracker::{HarvestFile, Tracker};
use crate::transform::{DataRecord, intermediate_path};

/// Per-batch accounting. A duplicate key is an expected idempotence outcome,
/// counted as skipped; `failed` counts records isolated out of the batch.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct LoadOutcome {
    pub inserted: usize,
    pub skipped: usize,
    pub failed: usize,
    pub pruned: usize,
}

/// Commits normalized records into the data tables. The uniqueness constraint
/// on (source_id, station_id, time, timemark) is the sole concurrency
/// arbiter: first writer wins, duplicates are no-ops.
pub struct Loader<'a> {
    db: &'a mut Db,
}

impl<'a> Loader<'a> {
    pub fn new(db: &'a mut Db) -> Self {
        Self { db }
    }

    /// Loads one file's intermediate batch and advances its tracker state:
    /// data_ingested on success, failed (fingerprint preserved) otherwise.
    pub fn load_file(
        &mut self,
        file: &HarvestFile,
        ingest_dir: &Utf8Path,
    ) -> Result<LoadOutcome, SurgeError> {
        let path = intermediate_path(ingest_dir, &file.file_name);
        let result = with_retry("data ingest", || self.load_once(file, &path));
        match result {
            Ok(outcome) => {
                let tracker = Tracker::new(self.db);
                tracker.advance(file.file_id, FileStatus::DataIngested)?;
                // The intermediate is consumed; the harvest file itself is
                // left untouched (read-only contract).
                fs::remove_file(path.as_std_path())?;
                info!(
                    file = %file.file_name,
                    inserted = outcome.inserted,
                    skipped = outcome.skipped,
                    failed = outcome.failed,
                    pruned = outcome.pruned,
                    "ingested"
                );
                Ok(outcome)
            }
            Err(err) => {
                let tracker = Tracker::new(self.db);
                tracker.mark_failed(file.file_id, &err)?;
                Err(err)
            }
        }
    }

    fn load_once(&mut self, file: &HarvestFile, path: &Utf8Path) -> Result<LoadOutcome, SurgeError> {
        let mut reader = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .from_path(path.as_std_path())?;

        let mut records = Vec::new();
        let mut failed = 0;
        for row in reader.records() {
            let row = row?;
            match DataRecord::from_string_record(&row) {
                Ok(record) => records.push(record),
                Err(err) => {
                    warn!(file = %file.file_name, error = %err, "skipping malformed record");
                    failed += 1;
                }
            }
        }

        let mut outcome = self.load_batch(file.dataset, &records)?;
        outcome.failed += failed;
        Ok(outcome)
    }

    /// Set-based insert with conflict handling. Malformed records abort only
    /// themselves; the rest of the batch commits.
    pub fn load_batch(
        &mut self,
        dataset: Dataset,
        records: &[DataRecord],
    ) -> Result<LoadOutcome, SurgeError> {
        let mut outcome = LoadOutcome::default();
        if records.is_empty() {
            return Ok(outcome);
        }

        let value_list = VALUE_COLUMNS.join(", ");
        let sql = match dataset {
            Dataset::Obs => format!(
                "INSERT INTO obs_data (source_id, station_id, timemark, time, {value_list})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                 ON CONFLICT(source_id, station_id, time, timemark) DO NOTHING"
            ),
            Dataset::Model => format!(
                "INSERT INTO model_data (source_id, station_id, model_run_id, timemark, time, {value_list})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                 ON CONFLICT(source_id, station_id, time, timemark) DO NOTHING"
            ),
        };

        let tx = self.db.conn_mut().transaction()?;
        {
            let mut statement = tx.prepare(&sql)?;
            for record in records {
                let mut params: Vec<rusqlite::types::Value> = vec![
                    record.source_id.into(),
                    record.station_id.into(),
                ];
                if dataset == Dataset::Model {
                    params.push(record.model_run_id.clone().unwrap_or_default().into());
                }
                params.push(record.timemark.clone().into());
                params.push(record.time.clone().into());
                for value in &record.values {
                    params.push((*value).into());
                }

                match statement.execute(rusqlite::params_from_iter(params)) {
                    Ok(0) => outcome.skipped += 1,
                    Ok(_) => outcome.inserted += 1,
                    Err(err) => {
                        let err = SurgeError::from(err);
                        if err.is_transient() {
                            return Err(err);
                        }
                        warn!(error = %err, "record rejected, continuing batch");
                        outcome.failed += 1;
                    }
                }
            }
        }

        if dataset == Dataset::Obs {
            outcome.pruned = prune_superseded(&tx, records)?;
        }
        tx.commit()?;
        Ok(outcome)
    }
}

/// Observation files from successive harvests overlap in time under fresh
/// timemarks. Within the loaded span, keep only the newest timemark per
/// (source, station, time). Model data is never pruned: distinct forecast
/// cycles must coexist.
fn prune_superseded(
    tx: &rusqlite::Transaction<'_>,
    records: &[DataRecord],
) -> Result<usize, SurgeError> {
    let Some(source_id) = records.first().map(|r| r.source_id) else {
        return Ok(0);
    };
    let min_time = records.iter().map(|r| r.time.as_str()).min().unwrap_or_default();
    let max_time = records.iter().map(|r| r.time.as_str()).max().unwrap_or_default();

    let pruned = tx.execute(
        "DELETE FROM obs_data
         WHERE source_id = ?1 AND time >= ?2 AND time <= ?3
           AND timemark < (SELECT MAX(b.timemark) FROM obs_data b
                           WHERE b.source_id = obs_data.source_id
                             AND b.station_id = obs_data.station_id
                             AND b.time = obs_data.time)",
        rusqlite::params![source_id, min_time, max_time],
    )?;
    if pruned > 0 {
        debug!(source_id, min_time, max_time, pruned, "pruned superseded observations");
    }
    Ok(pruned)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::LocationType;
    use crate::registry::{Registry, StationRecord};

    fn seeded_db() -> (Db, i64, i64) {
        let db = Db::open_in_memory().unwrap();
        let registry = Registry::new(&db);
        let station_id = registry
            .resolve_or_create_station(&StationRecord::new(
                "8651370".parse().unwrap(),
                LocationType::Tidal,
            ))
            .unwrap();
        let key = crate::domain::SourceKey::new(
            "tidal_gauge",
            "noaa",
            "noaa",
            "water_level",
            "m",
            LocationType::Tidal,
        )
        .unwrap();
        let source_id = registry
            .resolve_or_create_source(&key, "noaa_stationdata", Dataset::Obs, None)
            .unwrap();
        (db, station_id, source_id)
    }

    fn record(source_id: i64, station_id: i64, timemark: &str, time: &str, level: f64) -> DataRecord {
        DataRecord {
            source_id,
            station_id,
            model_run_id: None,
            timemark: timemark.to_string(),
            time: time.to_string(),
            values: [Some(level), None, None, None, None],
        }
    }

    #[test]
    fn duplicate_insert_is_skipped_not_error() {
        let (mut db, station_id, source_id) = seeded_db();
        let batch = vec![record(
            source_id,
            station_id,
            "2023-04-23T12:00:00",
            "2023-04-23T12:00:00",
            1.12,
        )];

        let first = Loader::new(&mut db).load_batch(Dataset::Obs, &batch).unwrap();
        assert_eq!(first.inserted, 1);

        let second = Loader::new(&mut db).load_batch(Dataset::Obs, &batch).unwrap();
        assert_eq!(second.inserted, 0);
        assert_eq!(second.skipped, 1);
    }

    #[test]
    fn pruning_keeps_newest_timemark() {
        let (mut db, station_id, source_id) = seeded_db();
        let old = vec![record(
            source_id,
            station_id,
            "2023-04-23T06:00:00",
            "2023-04-23T12:00:00",
            1.10,
        )];
        Loader::new(&mut db).load_batch(Dataset::Obs, &old).unwrap();

        let new = vec![record(
            source_id,
            station_id,
            "2023-04-23T18:00:00",
            "2023-04-23T12:00:00",
            1.15,
        )];
        let outcome = Loader::new(&mut db).load_batch(Dataset::Obs, &new).unwrap();
        assert_eq!(outcome.inserted, 1);
        assert_eq!(outcome.pruned, 1);

        let level: f64 = db
            .conn()
            .query_row(
                "SELECT water_level FROM obs_data WHERE source_id = ?1",
                [source_id],
                |row| row.get(0),
            )
            .unwrap();
        assert!((level - 1.15).abs() < f64::EPSILON);
    }
}
