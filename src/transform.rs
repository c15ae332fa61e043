use std::collections::HashMap;
use std::io::Write;

use camino::{Utf8Path, Utf8PathBuf};
use serde::Serialize;
use tracing::{debug, warn};

use crate::db::{Db, VALUE_COLUMNS};
use crate::domain::{ModelRunId, Timemark, format_time, parse_time};
use crate::error::SurgeError;
use crate::registry::{Registry, SourceMeta};
use crate::tracker::HarvestFile;

/// Prefix for normalized intermediate files written to the ingest directory.
pub const INTERMEDIATE_PREFIX: &str = "data_copy_";

/// One normalized record, identifier-stamped and ready for bulk load.
#[derive(Debug, Clone, PartialEq)]
pub struct DataRecord {
    pub source_id: i64,
    pub station_id: i64,
    pub model_run_id: Option<String>,
    pub timemark: String,
    pub time: String,
    pub values: [Option<f64>; VALUE_COLUMNS.len()],
}

impl DataRecord {
    fn to_fields(&self) -> Vec<String> {
        let mut fields = vec![
            self.source_id.to_string(),
            self.station_id.to_string(),
            self.model_run_id.clone().unwrap_or_default(),
            self.timemark.clone(),
            self.time.clone(),
        ];
        for value in &self.values {
            fields.push(value.map(|v| v.to_string()).unwrap_or_default());
        }
        fields
    }

    pub fn from_string_record(record: &csv::StringRecord) -> Result<Self, SurgeError> {
        let expected = 5 + VALUE_COLUMNS.len();
        if record.len() != expected {
            return Err(SurgeError::Csv(format!(
                "expected {expected} fields, got {}",
                record.len()
            )));
        }
        let field = |index: usize| record.get(index).unwrap_or_default().trim();
        let parse_id = |index: usize, name: &str| {
            field(index)
                .parse::<i64>()
                .map_err(|_| SurgeError::Csv(format!("bad {name}: {}", field(index))))
        };
        let mut values = [None; VALUE_COLUMNS.len()];
        for (slot, value) in values.iter_mut().enumerate() {
            let raw = field(5 + slot);
            if !raw.is_empty() {
                *value = Some(
                    raw.parse::<f64>()
                        .map_err(|_| SurgeError::Csv(format!("bad value: {raw}")))?,
                );
            }
        }
        Ok(Self {
            source_id: parse_id(0, "source_id")?,
            station_id: parse_id(1, "station_id")?,
            model_run_id: match field(2) {
                "" => None,
                run => Some(run.to_string()),
            },
            timemark: field(3).to_string(),
            time: field(4).to_string(),
            values,
        })
    }
}

/// Per-file accounting of rows dropped during normalization. Dropped rows are
/// counted, never fatal to the batch.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct DropCounts {
    pub bad_time: usize,
    pub unknown_station: usize,
    pub missing_value: usize,
}

impl DropCounts {
    pub fn total(&self) -> usize {
        self.bad_time + self.unknown_station + self.missing_value
    }
}

#[derive(Debug, Clone)]
pub struct TransformOutcome {
    pub records: usize,
    pub dropped: DropCounts,
    pub output: Utf8PathBuf,
}

pub fn intermediate_path(ingest_dir: &Utf8Path, file_name: &str) -> Utf8PathBuf {
    ingest_dir.join(format!("{INTERMEDIATE_PREFIX}{file_name}"))
}

/// Converts raw harvest rows into normalized, identifier-stamped records.
pub struct Transformer<'a> {
    registry: Registry<'a>,
}

impl<'a> Transformer<'a> {
    pub fn new(db: &'a Db) -> Self {
        Self {
            registry: Registry::new(db),
        }
    }

    /// Normalizes one harvest file into an intermediate CSV in the ingest
    /// directory. Observation records are stamped with the run's batch
    /// timemark; model records with the run cycle time from `run`.
    pub fn transform_file(
        &self,
        file: &HarvestFile,
        source: &SourceMeta,
        batch_timemark: Timemark,
        run: Option<&ModelRunId>,
        ingest_dir: &Utf8Path,
    ) -> Result<TransformOutcome, SurgeError> {
        let (timemark, model_run_id) = match run {
            Some(run) => (run.timemark().to_string(), Some(run.to_string())),
            None => (batch_timemark.to_string(), None),
        };

        let mut reader = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .from_path(file.path().as_std_path())?;

        let headers: Vec<String> = reader
            .headers()?
            .iter()
            .map(|h| h.trim().to_lowercase())
            .collect();
        let column = |name: &str| headers.iter().position(|h| h == name);
        let time_index = column("time").ok_or_else(|| {
            SurgeError::Csv(format!("{}: missing time column", file.file_name))
        })?;
        let station_index = column("station").ok_or_else(|| {
            SurgeError::Csv(format!("{}: missing station column", file.file_name))
        })?;
        let value_indices: Vec<(usize, usize)> = VALUE_COLUMNS
            .iter()
            .enumerate()
            .filter_map(|(slot, name)| column(name).map(|index| (slot, index)))
            .collect();
        if value_indices.is_empty() {
            return Err(SurgeError::Csv(format!(
                "{}: no known value columns",
                file.file_name
            )));
        }

        let mut station_cache: HashMap<String, Option<i64>> = HashMap::new();
        let mut records = Vec::new();
        let mut dropped = DropCounts::default();

        for row in reader.records() {
            let row = row?;
            let Some(time) = row.get(time_index).and_then(parse_time) else {
                dropped.bad_time += 1;
                continue;
            };
            let station_name = row.get(station_index).unwrap_or_default().trim().to_string();
            let station_id = *station_cache
                .entry(station_name.clone())
                .or_insert_with(|| self.registry.station_id(&station_name).ok());
            let Some(station_id) = station_id else {
                dropped.unknown_station += 1;
                continue;
            };

            let mut values = [None; VALUE_COLUMNS.len()];
            for &(slot, index) in &value_indices {
                let raw = row.get(index).unwrap_or_default().trim();
                if !raw.is_empty() {
                    values[slot] = raw.parse::<f64>().ok();
                }
            }
            if values.iter().all(Option::is_none) {
                dropped.missing_value += 1;
                continue;
            }

            records.push(DataRecord {
                source_id: source.source_id,
                station_id,
                model_run_id: model_run_id.clone(),
                timemark: timemark.clone(),
                time: format_time(&time),
                values,
            });
        }

        if dropped.total() > 0 {
            warn!(
                file = %file.file_name,
                bad_time = dropped.bad_time,
                unknown_station = dropped.unknown_station,
                missing_value = dropped.missing_value,
                "dropped rows during normalization"
            );
        }

        let output = intermediate_path(ingest_dir, &file.file_name);
        write_intermediate(&output, &records)?;
        debug!(file = %file.file_name, records = records.len(), output = %output, "normalized");

        Ok(TransformOutcome {
            records: records.len(),
            dropped,
            output,
        })
    }
}

/// Writes the intermediate CSV atomically: temp file in the target directory,
/// then rename over the final path.
pub fn write_intermediate(path: &Utf8Path, records: &[DataRecord]) -> Result<(), SurgeError> {
    let parent = path
        .parent()
        .ok_or_else(|| SurgeError::Filesystem(format!("invalid intermediate path {path}")))?;
    std::fs::create_dir_all(parent.as_std_path())?;

    let mut header = vec!["source_id", "station_id", "model_run_id", "timemark", "time"];
    header.extend_from_slice(&VALUE_COLUMNS);

    let mut temp = tempfile::Builder::new()
        .prefix(".data_copy")
        .tempfile_in(parent.as_std_path())?;
    {
        let mut writer = csv::Writer::from_writer(&mut temp);
        writer.write_record(&header)?;
        for record in records {
            writer.write_record(record.to_fields())?;
        }
        writer.flush()?;
    }
    temp.flush()?;
    temp.persist(path.as_std_path())
        .map_err(|err| SurgeError::Filesystem(err.to_string()))?;
    Ok(())
}
