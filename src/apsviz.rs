use chrono::Duration;
use rusqlite::OptionalExtension;
use tracing::info;

use crate::db::Db;
use crate::domain::{ModelRunId, format_time};
use crate::error::SurgeError;

/// Observation stations within this many days before the run cycle are
/// considered active alongside the run.
const OBS_LOOKBACK_DAYS: i64 = 4;

/// Rebuilds the display-oriented station projection for one model run:
/// the run's own stations plus observation stations with data between the
/// cycle's lookback window and the forecast horizon. Delete-then-insert per
/// (run, timemark); never a source of truth.
pub fn rebuild_run(db: &mut Db, run: &ModelRunId) -> Result<usize, SurgeError> {
    let run_id = run.to_string();
    let timemark = run.timemark().to_string();

    let tx = db.conn_mut().transaction()?;
    tx.execute(
        "DELETE FROM apsviz_station WHERE model_run_id = ?1 AND timemark = ?2",
        rusqlite::params![run_id, timemark],
    )?;

    tx.execute(
        "INSERT INTO apsviz_station (model_run_id, timemark, station_name, lat, lon,
                                     location_type, data_source)
         SELECT DISTINCT ?1, ?2, g.station_name, g.lat, g.lon, g.location_type, s.data_source
         FROM model_data d
         JOIN station g ON g.station_id = d.station_id
         JOIN source s ON s.source_id = d.source_id
         WHERE d.model_run_id = ?1 AND d.timemark = ?2
         ON CONFLICT(model_run_id, timemark, station_name) DO NOTHING",
        rusqlite::params![run_id, timemark],
    )?;

    let horizon: Option<String> = tx
        .query_row(
            "SELECT MAX(time) FROM model_data WHERE model_run_id = ?1 AND timemark = ?2",
            rusqlite::params![run_id, timemark],
            |row| row.get(0),
        )
        .optional()?
        .flatten();

    if let Some(end) = horizon {
        let start = format_time(&(run.cycle - Duration::days(OBS_LOOKBACK_DAYS)));
        tx.execute(
            "INSERT INTO apsviz_station (model_run_id, timemark, station_name, lat, lon,
                                         location_type, data_source)
             SELECT DISTINCT ?1, ?2, g.station_name, g.lat, g.lon, g.location_type, s.data_source
             FROM obs_data d
             JOIN station g ON g.station_id = d.station_id
             JOIN source s ON s.source_id = d.source_id
             WHERE d.time >= ?3 AND d.time <= ?4
             ON CONFLICT(model_run_id, timemark, station_name) DO NOTHING",
            rusqlite::params![run_id, timemark, start, end],
        )?;
    }

    let count: usize = tx.query_row(
        "SELECT COUNT(*) FROM apsviz_station WHERE model_run_id = ?1 AND timemark = ?2",
        rusqlite::params![run_id, timemark],
        |row| row.get(0),
    )?;
    tx.commit()?;

    info!(run = %run_id, stations = count, "rebuilt display station projection");
    Ok(count)
}
