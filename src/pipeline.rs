use camino::Utf8PathBuf;
use serde::Serialize;
use tracing::{error, info};

use crate::apsviz;
use crate::db::Db;
use crate::domain::{Dataset, FileStatus, ModelRunId, Stage, Timemark};
use crate::error::SurgeError;
use crate::loader::Loader;
use crate::registry::Registry;
use crate::tracker::{DiscoveryOutcome, Tracker};
use crate::transform::Transformer;

/// Explicit per-run state: the acting directories, dataset, model run, and
/// batch timemark. Passed into every stage; nothing here is ambient.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub harvest_dir: Utf8PathBuf,
    pub ingest_dir: Utf8PathBuf,
    pub dataset: Dataset,
    pub run: Option<ModelRunId>,
    pub timemark: Timemark,
}

impl RunContext {
    pub fn new(
        harvest_dir: Utf8PathBuf,
        ingest_dir: Utf8PathBuf,
        dataset: Dataset,
        run: Option<ModelRunId>,
        timemark: Option<Timemark>,
    ) -> Result<Self, SurgeError> {
        if dataset == Dataset::Model && run.is_none() {
            return Err(SurgeError::InvalidRunId(
                "model ingestion requires a run id".to_string(),
            ));
        }
        Ok(Self {
            harvest_dir,
            ingest_dir,
            dataset,
            run,
            timemark: timemark.unwrap_or_else(Timemark::now),
        })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FileReport {
    pub file_name: String,
    pub stage: &'static str,
    pub records: usize,
    pub inserted: usize,
    pub skipped: usize,
    pub failed: usize,
    pub pruned: usize,
    pub dropped: usize,
    pub error: Option<String>,
}

impl FileReport {
    fn new(file_name: &str, stage: &'static str) -> Self {
        Self {
            file_name: file_name.to_string(),
            stage,
            records: 0,
            inserted: 0,
            skipped: 0,
            failed: 0,
            pruned: 0,
            dropped: 0,
            error: None,
        }
    }
}

/// Aggregated outcome of one pipeline invocation. Per-file failures are
/// isolated here rather than aborting the run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunSummary {
    pub dataset: String,
    pub timemark: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub discovery: Option<DiscoveryOutcome>,
    pub files: Vec<FileReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub apsviz_stations: Option<usize>,
}

impl RunSummary {
    fn for_context(ctx: &RunContext) -> Self {
        Self {
            dataset: ctx.dataset.to_string(),
            timemark: ctx.timemark.to_string(),
            ..Self::default()
        }
    }

    pub fn failed_files(&self) -> usize {
        self.files.iter().filter(|f| f.error.is_some()).count()
    }
}

/// Drives the pipeline stages in order, resuming from whatever state the
/// tracker has persisted. One coordinator replaces per-stage entry points;
/// which stage runs is data, not which binary was invoked.
pub struct Pipeline<'a> {
    db: &'a mut Db,
    ctx: RunContext,
}

impl<'a> Pipeline<'a> {
    pub fn new(db: &'a mut Db, ctx: RunContext) -> Self {
        Self { db, ctx }
    }

    pub fn run(&mut self, stage: Stage) -> Result<RunSummary, SurgeError> {
        let mut summary = RunSummary::for_context(&self.ctx);
        match stage {
            Stage::MetaIngest => self.meta_ingest(&mut summary)?,
            Stage::DataCreate => self.data_create(&mut summary)?,
            Stage::DataIngest => self.data_ingest(&mut summary)?,
            Stage::SequenceIngest => {
                self.meta_ingest(&mut summary)?;
                self.data_create(&mut summary)?;
                self.data_ingest(&mut summary)?;
            }
        }
        Ok(summary)
    }

    /// Discovers harvest files and persists their existence, the durable
    /// record used for re-run detection.
    fn meta_ingest(&mut self, summary: &mut RunSummary) -> Result<(), SurgeError> {
        let sources = Registry::new(self.db).sources_for_dataset(self.ctx.dataset)?;
        let tracker = Tracker::new(self.db);
        let outcome = tracker.discover(&self.ctx.harvest_dir, &sources)?;
        for file in tracker.files_with_status(self.ctx.dataset, FileStatus::Discovered)? {
            tracker.advance(file.file_id, FileStatus::MetaIngested)?;
        }
        summary.discovery = Some(outcome);
        Ok(())
    }

    /// Normalizes every meta-ingested file into an intermediate batch. A file
    /// whose source cannot be resolved fails alone; the run continues.
    fn data_create(&mut self, summary: &mut RunSummary) -> Result<(), SurgeError> {
        let sources = Registry::new(self.db).sources_for_dataset(self.ctx.dataset)?;
        let tracker = Tracker::new(self.db);
        let transformer = Transformer::new(self.db);

        for file in tracker.files_with_status(self.ctx.dataset, FileStatus::MetaIngested)? {
            let mut report = FileReport::new(&file.file_name, "data_create");
            let source = sources.iter().find(|s| s.source_id == file.source_id);
            let result = match source {
                Some(source) => transformer.transform_file(
                    &file,
                    source,
                    self.ctx.timemark,
                    self.ctx.run.as_ref(),
                    &self.ctx.ingest_dir,
                ),
                None => Err(SurgeError::SourceNotFound(format!(
                    "source_id {} for {}",
                    file.source_id, file.file_name
                ))),
            };
            match result {
                Ok(outcome) => {
                    tracker.advance(file.file_id, FileStatus::DataCreated)?;
                    report.records = outcome.records;
                    report.dropped = outcome.dropped.total();
                }
                Err(err) => {
                    error!(file = %file.file_name, error = %err, "normalization failed");
                    tracker.mark_failed(file.file_id, &err)?;
                    report.error = Some(err.to_string());
                }
            }
            summary.files.push(report);
        }
        Ok(())
    }

    /// Commits every created batch; the loader advances each file's state.
    /// For model runs, rebuilds the display station projection afterwards.
    fn data_ingest(&mut self, summary: &mut RunSummary) -> Result<(), SurgeError> {
        let files = Tracker::new(self.db)
            .files_with_status(self.ctx.dataset, FileStatus::DataCreated)?;

        let mut any_loaded = false;
        for file in files {
            let mut report = FileReport::new(&file.file_name, "data_ingest");
            match Loader::new(self.db).load_file(&file, &self.ctx.ingest_dir) {
                Ok(outcome) => {
                    any_loaded = true;
                    report.inserted = outcome.inserted;
                    report.skipped = outcome.skipped;
                    report.failed = outcome.failed;
                    report.pruned = outcome.pruned;
                }
                Err(err) => {
                    error!(file = %file.file_name, error = %err, "ingest failed");
                    report.error = Some(err.to_string());
                }
            }
            summary.files.push(report);
        }

        if any_loaded {
            if let Some(run) = self.ctx.run.clone() {
                summary.apsviz_stations = Some(apsviz::rebuild_run(self.db, &run)?);
            }
        }

        info!(
            dataset = %self.ctx.dataset,
            files = summary.files.len(),
            failed = summary.failed_files(),
            "pipeline stage complete"
        );
        Ok(())
    }
}
