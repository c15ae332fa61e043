use std::time::Duration;

use camino::Utf8Path;
use rusqlite::Connection;
use tracing::warn;

use crate::error::SurgeError;

/// Nullable measured-quantity columns shared by both data tables. Each source
/// reports exactly one of these; the order is the pivot engine's coalescing
/// priority.
pub const VALUE_COLUMNS: [&str; 5] = [
    "water_level",
    "wave_height",
    "wind_speed",
    "air_pressure",
    "flow_volume",
];

/// Retry budget for transient database/file errors at stage level.
pub const RETRY_BUDGET: usize = 3;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS station (
    station_id    INTEGER PRIMARY KEY,
    station_name  TEXT NOT NULL UNIQUE,
    lat           REAL,
    lon           REAL,
    tz            TEXT,
    gauge_owner   TEXT,
    location_name TEXT,
    location_type TEXT NOT NULL,
    country       TEXT,
    state         TEXT,
    county        TEXT
);

CREATE TABLE IF NOT EXISTS source (
    source_id       INTEGER PRIMARY KEY,
    data_source     TEXT NOT NULL,
    source_name     TEXT NOT NULL,
    source_archive  TEXT NOT NULL,
    source_variable TEXT NOT NULL,
    units           TEXT NOT NULL,
    location_type   TEXT NOT NULL,
    filename_prefix TEXT NOT NULL,
    dataset         TEXT NOT NULL,
    station_id      INTEGER REFERENCES station(station_id),
    UNIQUE(data_source, source_name, source_archive, source_variable, units, location_type)
);

CREATE TABLE IF NOT EXISTS harvest_file (
    file_id        INTEGER PRIMARY KEY,
    dir_path       TEXT NOT NULL,
    file_name      TEXT NOT NULL UNIQUE,
    dataset        TEXT NOT NULL,
    source_id      INTEGER NOT NULL REFERENCES source(source_id),
    data_date_time TEXT,
    status         TEXT NOT NULL,
    file_size      INTEGER NOT NULL,
    modified_at    TEXT NOT NULL,
    last_error     TEXT
);

CREATE TABLE IF NOT EXISTS obs_data (
    obs_id       INTEGER PRIMARY KEY,
    source_id    INTEGER NOT NULL REFERENCES source(source_id),
    station_id   INTEGER NOT NULL REFERENCES station(station_id),
    timemark     TEXT NOT NULL,
    time         TEXT NOT NULL,
    water_level  REAL,
    wave_height  REAL,
    wind_speed   REAL,
    air_pressure REAL,
    flow_volume  REAL,
    UNIQUE(source_id, station_id, time, timemark)
);

CREATE TABLE IF NOT EXISTS model_data (
    model_id     INTEGER PRIMARY KEY,
    source_id    INTEGER NOT NULL REFERENCES source(source_id),
    station_id   INTEGER NOT NULL REFERENCES station(station_id),
    model_run_id TEXT NOT NULL,
    timemark     TEXT NOT NULL,
    time         TEXT NOT NULL,
    water_level  REAL,
    wave_height  REAL,
    wind_speed   REAL,
    air_pressure REAL,
    flow_volume  REAL,
    UNIQUE(source_id, station_id, time, timemark)
);

CREATE TABLE IF NOT EXISTS apsviz_station (
    apsviz_id     INTEGER PRIMARY KEY,
    model_run_id  TEXT NOT NULL,
    timemark      TEXT NOT NULL,
    station_name  TEXT NOT NULL,
    lat           REAL,
    lon           REAL,
    location_type TEXT,
    data_source   TEXT,
    UNIQUE(model_run_id, timemark, station_name)
);

CREATE INDEX IF NOT EXISTS idx_obs_data_station_time ON obs_data(station_id, time);
CREATE INDEX IF NOT EXISTS idx_model_data_station_time ON model_data(station_id, time);
CREATE INDEX IF NOT EXISTS idx_harvest_file_status ON harvest_file(status);
";

pub struct Db {
    conn: Connection,
}

impl Db {
    /// Opens (creating if absent) the database at `path` and ensures the
    /// schema exists. Safe to call on every startup.
    pub fn open(path: &Utf8Path) -> Result<Self, SurgeError> {
        let conn = Connection::open(path.as_std_path())?;
        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self, SurgeError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, SurgeError> {
        conn.busy_timeout(Duration::from_secs(30))?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn })
    }

    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    pub fn conn_mut(&mut self) -> &mut Connection {
        &mut self.conn
    }
}

/// Runs `operation` up to RETRY_BUDGET times, retrying only transient errors.
/// Validation and schema errors propagate on the first attempt.
pub fn with_retry<T>(
    operation: &str,
    mut f: impl FnMut() -> Result<T, SurgeError>,
) -> Result<T, SurgeError> {
    let mut last_message = String::new();
    for attempt in 1..=RETRY_BUDGET {
        match f() {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() => {
                warn!(operation, attempt, error = %err, "transient error, retrying");
                last_message = err.to_string();
            }
            Err(err) => return Err(err),
        }
    }
    Err(SurgeError::RetriesExhausted {
        operation: operation.to_string(),
        attempts: RETRY_BUDGET,
        message: last_message,
    })
}
