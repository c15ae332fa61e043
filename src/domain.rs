use std::fmt;
use std::str::FromStr;

use chrono::NaiveDateTime;
use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use crate::error::SurgeError;

/// Canonical text form for observation/prediction times, used in the database,
/// in intermediate files, and in pivot output. One format everywhere keeps
/// lexicographic comparison equivalent to chronological comparison.
pub const TIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

const ACCEPTED_TIME_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.fZ",
    "%Y-%m-%dT%H:%M:%SZ",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M",
];

pub fn parse_time(value: &str) -> Option<NaiveDateTime> {
    let trimmed = value.trim();
    ACCEPTED_TIME_FORMATS
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(trimmed, format).ok())
}

pub fn format_time(value: &NaiveDateTime) -> String {
    value.format(TIME_FORMAT).to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LocationType {
    Tidal,
    Coastal,
    River,
    Ocean,
}

impl LocationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            LocationType::Tidal => "tidal",
            LocationType::Coastal => "coastal",
            LocationType::River => "river",
            LocationType::Ocean => "ocean",
        }
    }
}

impl fmt::Display for LocationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for LocationType {
    type Err = SurgeError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_lowercase().as_str() {
            "tidal" => Ok(LocationType::Tidal),
            "coastal" => Ok(LocationType::Coastal),
            "river" => Ok(LocationType::River),
            "ocean" => Ok(LocationType::Ocean),
            _ => Err(SurgeError::InvalidLocationType(value.to_string())),
        }
    }
}

/// Which data table a source feeds: periodic observations or model output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Dataset {
    Obs,
    Model,
}

impl Dataset {
    pub fn as_str(&self) -> &'static str {
        match self {
            Dataset::Obs => "obs",
            Dataset::Model => "model",
        }
    }
}

impl fmt::Display for Dataset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Dataset {
    type Err = SurgeError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_lowercase().as_str() {
            "obs" => Ok(Dataset::Obs),
            "model" => Ok(Dataset::Model),
            _ => Err(SurgeError::InvalidSourceKey(format!(
                "dataset must be obs or model, got {value}"
            ))),
        }
    }
}

/// Harvest file processing states. Forward-only, with failed reachable from
/// any non-terminal state. Re-discovery after a fingerprint change resets a
/// row through the tracker, not through advance().
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileStatus {
    Discovered,
    MetaIngested,
    DataCreated,
    DataIngested,
    Failed,
}

impl FileStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileStatus::Discovered => "discovered",
            FileStatus::MetaIngested => "meta_ingested",
            FileStatus::DataCreated => "data_created",
            FileStatus::DataIngested => "data_ingested",
            FileStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, FileStatus::DataIngested | FileStatus::Failed)
    }

    pub fn may_advance_to(&self, next: FileStatus) -> bool {
        match (self, next) {
            (FileStatus::Discovered, FileStatus::MetaIngested) => true,
            (FileStatus::MetaIngested, FileStatus::DataCreated) => true,
            (FileStatus::DataCreated, FileStatus::DataIngested) => true,
            (from, FileStatus::Failed) => !from.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for FileStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for FileStatus {
    type Err = SurgeError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "discovered" => Ok(FileStatus::Discovered),
            "meta_ingested" => Ok(FileStatus::MetaIngested),
            "data_created" => Ok(FileStatus::DataCreated),
            "data_ingested" => Ok(FileStatus::DataIngested),
            "failed" => Ok(FileStatus::Failed),
            _ => Err(SurgeError::Schema(format!("unknown file status {value}"))),
        }
    }
}

/// Pipeline stages selectable from the CLI. SequenceIngest runs the other
/// three in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Stage {
    MetaIngest,
    DataCreate,
    DataIngest,
    SequenceIngest,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StationName(String);

impl StationName {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StationName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for StationName {
    type Err = SurgeError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim().to_string();
        if normalized.is_empty() || normalized.contains(',') {
            return Err(SurgeError::InvalidStationName(value.to_string()));
        }
        Ok(Self(normalized))
    }
}

/// Natural key of one logical time-series feed. No two sources may share the
/// same tuple; the registry enforces this with a uniqueness constraint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceKey {
    pub data_source: String,
    pub source_name: String,
    pub source_archive: String,
    pub source_variable: String,
    pub units: String,
    pub location_type: LocationType,
}

impl SourceKey {
    pub fn new(
        data_source: &str,
        source_name: &str,
        source_archive: &str,
        source_variable: &str,
        units: &str,
        location_type: LocationType,
    ) -> Result<Self, SurgeError> {
        for (field, value) in [
            ("data_source", data_source),
            ("source_name", source_name),
            ("source_archive", source_archive),
            ("source_variable", source_variable),
            ("units", units),
        ] {
            if value.trim().is_empty() {
                return Err(SurgeError::InvalidSourceKey(format!("missing {field}")));
            }
        }
        Ok(Self {
            data_source: data_source.trim().to_string(),
            source_name: source_name.trim().to_string(),
            source_archive: source_archive.trim().to_string(),
            source_variable: source_variable.trim().to_string(),
            units: units.trim().to_string(),
            location_type,
        })
    }

    pub fn label(&self) -> String {
        format!(
            "{}/{}/{}",
            self.data_source, self.source_name, self.source_archive
        )
    }
}

/// Run-identifying timestamp distinguishing which ingestion or forecast cycle
/// produced a value, orthogonal to the value's own observation time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timemark(NaiveDateTime);

impl Timemark {
    pub fn new(value: NaiveDateTime) -> Self {
        Self(value)
    }

    pub fn now() -> Self {
        Self(chrono::Utc::now().naive_utc())
    }

    pub fn as_datetime(&self) -> NaiveDateTime {
        self.0
    }
}

impl fmt::Display for Timemark {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", format_time(&self.0))
    }
}

impl FromStr for Timemark {
    type Err = SurgeError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        parse_time(value)
            .map(Self)
            .ok_or_else(|| SurgeError::InvalidTimemark(value.to_string()))
    }
}

/// Model run identifier of the form `instance-startTime-runType`, with the
/// start time encoded as YYYYMMDDHH. The instance segment may itself contain
/// dashes; the 10-digit cycle segment anchors the split.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelRunId {
    pub instance: String,
    pub cycle: NaiveDateTime,
    pub run_type: String,
}

impl ModelRunId {
    /// The run's cycle time doubles as the timemark stamped on every record
    /// the run produces.
    pub fn timemark(&self) -> Timemark {
        Timemark::new(self.cycle)
    }
}

impl fmt::Display for ModelRunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}-{}-{}",
            self.instance,
            self.cycle.format("%Y%m%d%H"),
            self.run_type
        )
    }
}

impl FromStr for ModelRunId {
    type Err = SurgeError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = value.trim().split('-').collect();
        let cycle_index = parts
            .iter()
            .rposition(|part| part.len() == 10 && part.chars().all(|ch| ch.is_ascii_digit()))
            .ok_or_else(|| SurgeError::InvalidRunId(value.to_string()))?;
        if cycle_index == 0 || cycle_index == parts.len() - 1 {
            return Err(SurgeError::InvalidRunId(value.to_string()));
        }
        let cycle = NaiveDateTime::parse_from_str(
            &format!("{}0000", parts[cycle_index]),
            "%Y%m%d%H%M%S",
        )
        .map_err(|_| SurgeError::InvalidRunId(value.to_string()))?;
        Ok(Self {
            instance: parts[..cycle_index].join("-"),
            cycle,
            run_type: parts[cycle_index + 1..].join("-"),
        })
    }
}
