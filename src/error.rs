use camino::Utf8PathBuf;
use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum SurgeError {
    #[error("invalid station name: {0}")]
    InvalidStationName(String),

    #[error("invalid source key: {0}")]
    InvalidSourceKey(String),

    #[error("invalid source name for pivot column: {0}")]
    InvalidSourceName(String),

    #[error("invalid location type: {0}")]
    InvalidLocationType(String),

    #[error("invalid model run id: {0}")]
    InvalidRunId(String),

    #[error("invalid timemark: {0}")]
    InvalidTimemark(String),

    #[error("missing config file surgegauge.json in current directory")]
    MissingConfig,

    #[error("failed to read config file at {0}")]
    ConfigRead(Utf8PathBuf),

    #[error("failed to parse JSON config: {0}")]
    ConfigParse(String),

    #[error("station not found: {0}")]
    StationNotFound(String),

    #[error("source not found: {0}")]
    SourceNotFound(String),

    #[error("harvest file not tracked: {0}")]
    FileNotTracked(String),

    #[error("illegal harvest file transition from {from} to {to}")]
    IllegalTransition { from: String, to: String },

    #[error("database error: {0}")]
    Database(String),

    #[error("schema violation: {0}")]
    Schema(String),

    #[error("{operation} failed after {attempts} attempts: {message}")]
    RetriesExhausted {
        operation: String,
        attempts: usize,
        message: String,
    },

    #[error("csv error: {0}")]
    Csv(String),

    #[error("filesystem error: {0}")]
    Filesystem(String),
}

impl From<rusqlite::Error> for SurgeError {
    fn from(err: rusqlite::Error) -> Self {
        match &err {
            rusqlite::Error::SqliteFailure(failure, _)
                if failure.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                SurgeError::Schema(err.to_string())
            }
            rusqlite::Error::InvalidColumnType(..) | rusqlite::Error::InvalidColumnName(_) => {
                SurgeError::Schema(err.to_string())
            }
            _ => SurgeError::Database(err.to_string()),
        }
    }
}

impl From<csv::Error> for SurgeError {
    fn from(err: csv::Error) -> Self {
        SurgeError::Csv(err.to_string())
    }
}

impl From<std::io::Error> for SurgeError {
    fn from(err: std::io::Error) -> Self {
        SurgeError::Filesystem(err.to_string())
    }
}

impl SurgeError {
    /// True for errors worth retrying at the stage level; validation and
    /// schema errors are not.
    pub fn is_transient(&self) -> bool {
        matches!(self, SurgeError::Database(_) | SurgeError::Filesystem(_))
    }
}
