use std::fs;
use std::sync::OnceLock;

use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Utc};
use regex::Regex;
use rusqlite::{Connection, OptionalExtension, params};
use serde::Serialize;
use tracing::{debug, info};

use crate::db::Db;
use crate::domain::{Dataset, FileStatus};
use crate::error::SurgeError;
use crate::registry::SourceMeta;

/// Size + mtime identity of a harvest file on disk. A changed fingerprint is
/// the only thing that makes an already-ingested file eligible again.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fingerprint {
    pub file_size: i64,
    pub modified_at: String,
}

pub fn fingerprint(path: &Utf8Path) -> Result<Fingerprint, SurgeError> {
    let meta = fs::metadata(path.as_std_path())?;
    let modified: DateTime<Utc> = meta.modified()?.into();
    Ok(Fingerprint {
        file_size: meta.len() as i64,
        modified_at: modified.format("%Y-%m-%dT%H:%M:%S%.3f").to_string(),
    })
}

/// One tracked harvest file as persisted in harvest_file.
#[derive(Debug, Clone)]
pub struct HarvestFile {
    pub file_id: i64,
    pub dir_path: Utf8PathBuf,
    pub file_name: String,
    pub dataset: Dataset,
    pub source_id: i64,
    pub data_date_time: Option<String>,
    pub status: FileStatus,
    pub fingerprint: Fingerprint,
    pub last_error: Option<String>,
}

impl HarvestFile {
    pub fn path(&self) -> Utf8PathBuf {
        self.dir_path.join(&self.file_name)
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct DiscoveryOutcome {
    pub discovered: usize,
    pub refreshed: usize,
    pub skipped: usize,
}

fn filename_datetime(name: &str) -> Option<String> {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    let pattern = PATTERN
        .get_or_init(|| Regex::new(r"(\d{4}-\d{2}-\d{2}T\d{2}:\d{2}:\d{2})").unwrap());
    pattern.find(name).map(|m| m.as_str().to_string())
}

/// Tracks which harvest files have been seen and how far each has been
/// processed, so overlapping periodic runs never double-ingest.
pub struct Tracker<'a> {
    conn: &'a Connection,
}

impl<'a> Tracker<'a> {
    pub fn new(db: &'a Db) -> Self {
        Self { conn: db.conn() }
    }

    /// Scans the harvest directory for files matching each source's filename
    /// prefix. A file is recorded for processing only when it is new or its
    /// on-disk fingerprint differs from the persisted one; anything else is
    /// skipped, including failed files whose content has not changed.
    pub fn discover(
        &self,
        harvest_dir: &Utf8Path,
        sources: &[SourceMeta],
    ) -> Result<DiscoveryOutcome, SurgeError> {
        let mut names: Vec<String> = Vec::new();
        for entry in fs::read_dir(harvest_dir.as_std_path())? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            if let Ok(name) = entry.file_name().into_string() {
                names.push(name);
            }
        }
        names.sort();

        let mut outcome = DiscoveryOutcome::default();
        for source in sources {
            for name in &names {
                if !name.starts_with(source.filename_prefix.as_str()) || !name.ends_with(".csv") {
                    continue;
                }
                let print = fingerprint(&harvest_dir.join(name))?;
                match self.tracked(name)? {
                    None => {
                        self.insert(harvest_dir, name, source, &print)?;
                        outcome.discovered += 1;
                    }
                    Some(existing) if existing.fingerprint != print => {
                        self.refresh(existing.file_id, &print)?;
                        debug!(file = name, "fingerprint changed, reselected");
                        outcome.refreshed += 1;
                    }
                    Some(_) => outcome.skipped += 1,
                }
            }
        }
        info!(
            harvest_dir = %harvest_dir,
            discovered = outcome.discovered,
            refreshed = outcome.refreshed,
            skipped = outcome.skipped,
            "harvest directory scan complete"
        );
        Ok(outcome)
    }

    pub fn tracked(&self, file_name: &str) -> Result<Option<HarvestFile>, SurgeError> {
        self.conn
            .query_row(
                &format!("{SELECT_FILE} WHERE file_name = ?1"),
                [file_name],
                Self::file_from_row,
            )
            .optional()?
            .transpose()
    }

    pub fn files_with_status(
        &self,
        dataset: Dataset,
        status: FileStatus,
    ) -> Result<Vec<HarvestFile>, SurgeError> {
        let mut statement = self.conn.prepare(&format!(
            "{SELECT_FILE} WHERE dataset = ?1 AND status = ?2 ORDER BY data_date_time, file_name"
        ))?;
        let rows = statement.query_map(
            params![dataset.as_str(), status.as_str()],
            Self::file_from_row,
        )?;
        let mut files = Vec::new();
        for row in rows {
            files.push(row??);
        }
        Ok(files)
    }

    /// Moves a file forward through the state machine, rejecting skips and
    /// transitions out of terminal states.
    pub fn advance(&self, file_id: i64, next: FileStatus) -> Result<(), SurgeError> {
        let current = self.status_of(file_id)?;
        if !current.may_advance_to(next) {
            return Err(SurgeError::IllegalTransition {
                from: current.as_str().to_string(),
                to: next.as_str().to_string(),
            });
        }
        self.conn.execute(
            "UPDATE harvest_file SET status = ?1 WHERE file_id = ?2",
            params![next.as_str(), file_id],
        )?;
        Ok(())
    }

    /// Marks a file failed, preserving the attempted fingerprint so the same
    /// broken input is not silently retried until its content changes.
    pub fn mark_failed(&self, file_id: i64, error: &SurgeError) -> Result<(), SurgeError> {
        self.advance(file_id, FileStatus::Failed)?;
        self.conn.execute(
            "UPDATE harvest_file SET last_error = ?1 WHERE file_id = ?2",
            params![error.to_string(), file_id],
        )?;
        Ok(())
    }

    /// Operator override: re-queues failed files without a fingerprint
    /// change. Returns how many files were cleared.
    pub fn clear_failed(&self, dataset: Dataset) -> Result<usize, SurgeError> {
        let cleared = self.conn.execute(
            "UPDATE harvest_file SET status = ?1, last_error = NULL
             WHERE dataset = ?2 AND status = ?3",
            params![
                FileStatus::MetaIngested.as_str(),
                dataset.as_str(),
                FileStatus::Failed.as_str()
            ],
        )?;
        Ok(cleared)
    }

    fn status_of(&self, file_id: i64) -> Result<FileStatus, SurgeError> {
        let status: Option<String> = self
            .conn
            .query_row(
                "SELECT status FROM harvest_file WHERE file_id = ?1",
                [file_id],
                |row| row.get(0),
            )
            .optional()?;
        status
            .ok_or_else(|| SurgeError::FileNotTracked(format!("file_id {file_id}")))?
            .parse()
    }

    fn insert(
        &self,
        harvest_dir: &Utf8Path,
        file_name: &str,
        source: &SourceMeta,
        print: &Fingerprint,
    ) -> Result<(), SurgeError> {
        self.conn.execute(
            "INSERT INTO harvest_file (dir_path, file_name, dataset, source_id, data_date_time,
                                       status, file_size, modified_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                harvest_dir.as_str(),
                file_name,
                source.dataset.as_str(),
                source.source_id,
                filename_datetime(file_name),
                FileStatus::Discovered.as_str(),
                print.file_size,
                print.modified_at,
            ],
        )?;
        Ok(())
    }

    /// Re-harvested content: reset the row so the file flows through the
    /// pipeline again under the new fingerprint.
    fn refresh(&self, file_id: i64, print: &Fingerprint) -> Result<(), SurgeError> {
        self.conn.execute(
            "UPDATE harvest_file
             SET status = ?1, file_size = ?2, modified_at = ?3, last_error = NULL
             WHERE file_id = ?4",
            params![
                FileStatus::Discovered.as_str(),
                print.file_size,
                print.modified_at,
                file_id,
            ],
        )?;
        Ok(())
    }

    fn file_from_row(
        row: &rusqlite::Row<'_>,
    ) -> rusqlite::Result<Result<HarvestFile, SurgeError>> {
        let file_id: i64 = row.get(0)?;
        let dir_path: String = row.get(1)?;
        let file_name: String = row.get(2)?;
        let dataset: String = row.get(3)?;
        let source_id: i64 = row.get(4)?;
        let data_date_time: Option<String> = row.get(5)?;
        let status: String = row.get(6)?;
        let file_size: i64 = row.get(7)?;
        let modified_at: String = row.get(8)?;
        let last_error: Option<String> = row.get(9)?;
        Ok((|| {
            Ok(HarvestFile {
                file_id,
                dir_path: Utf8PathBuf::from(dir_path),
                file_name,
                dataset: dataset.parse()?,
                source_id,
                data_date_time,
                status: status.parse()?,
                fingerprint: Fingerprint {
                    file_size,
                    modified_at,
                },
                last_error,
            })
        })())
    }
}

const SELECT_FILE: &str = "SELECT file_id, dir_path, file_name, dataset, source_id,
                                  data_date_time, status, file_size, modified_at, last_error
                           FROM harvest_file";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filename_datetime_extracts_first_timestamp() {
        assert_eq!(
            filename_datetime("noaa_stationdata_2023-04-23T12:00:00_2023-04-23T18:00:00.csv"),
            Some("2023-04-23T12:00:00".to_string())
        );
        assert_eq!(filename_datetime("noaa_stationdata.csv"), None);
    }
}
