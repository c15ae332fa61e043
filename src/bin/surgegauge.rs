use std::process::ExitCode;

use camino::Utf8PathBuf;
use clap::{Args, Parser, Subcommand};
use miette::IntoDiagnostic;
use tracing_subscriber::EnvFilter;

use surgegauge::config::ConfigLoader;
use surgegauge::db::Db;
use surgegauge::domain::{Dataset, ModelRunId, Stage, StationName, Timemark, parse_time};
use surgegauge::error::SurgeError;
use surgegauge::output::JsonOutput;
use surgegauge::pipeline::{Pipeline, RunContext};
use surgegauge::pivot::PivotEngine;
use surgegauge::registry::Registry;
use surgegauge::tracker::Tracker;

#[derive(Parser)]
#[command(name = "surgegauge")]
#[command(about = "Ingest gauge and storm-surge model time series into SQLite and query pivoted views")]
#[command(version, author)]
struct Cli {
    #[arg(long, global = true)]
    config: Option<String>,

    #[arg(long, global = true)]
    database: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Create the database schema if it does not exist")]
    Init,
    #[command(about = "Manage station metadata")]
    Stations(StationsArgs),
    #[command(about = "Manage source metadata")]
    Sources(SourcesArgs),
    #[command(about = "Run an ingestion pipeline stage")]
    Ingest(IngestArgs),
    #[command(about = "Query pivoted time series")]
    Query(QueryArgs),
    #[command(about = "Inspect or repair harvest file tracking")]
    Tracker(TrackerArgs),
}

#[derive(Args)]
struct StationsArgs {
    #[command(subcommand)]
    command: StationsCommand,
}

#[derive(Subcommand)]
enum StationsCommand {
    #[command(about = "Load a station metadata CSV")]
    Load { path: String },
}

#[derive(Args)]
struct SourcesArgs {
    #[command(subcommand)]
    command: SourcesCommand,
}

#[derive(Subcommand)]
enum SourcesCommand {
    #[command(about = "Load a source metadata CSV")]
    Load { path: String },
}

#[derive(Args)]
struct IngestArgs {
    #[arg(value_enum)]
    stage: Stage,

    #[arg(long, value_enum)]
    dataset: Dataset,

    #[arg(long)]
    harvest_dir: Option<String>,

    #[arg(long)]
    ingest_dir: Option<String>,

    /// Model run identifier of the form instance-startTime-runType.
    #[arg(long)]
    run_id: Option<String>,

    /// Override for the batch timemark; defaults to the run start time.
    #[arg(long)]
    timemark: Option<String>,
}

#[derive(Args)]
struct QueryArgs {
    #[command(subcommand)]
    command: QueryCommand,
}

#[derive(Subcommand)]
enum QueryCommand {
    #[command(about = "Pivot observation series over a time window")]
    Obs(ObsQueryArgs),
    #[command(about = "Pivot one model run's forecast series")]
    Forecast(ForecastQueryArgs),
}

#[derive(Args)]
struct ObsQueryArgs {
    station: String,

    #[arg(long)]
    start: String,

    #[arg(long)]
    end: String,

    #[arg(long = "source")]
    sources: Vec<String>,

    #[arg(long)]
    nowcast_source: Option<String>,
}

#[derive(Args)]
struct ForecastQueryArgs {
    station: String,

    #[arg(long)]
    run_id: String,

    #[arg(long)]
    source: String,
}

#[derive(Args)]
struct TrackerArgs {
    #[command(subcommand)]
    command: TrackerCommand,
}

#[derive(Subcommand)]
enum TrackerCommand {
    #[command(about = "Re-queue failed files without a fingerprint change")]
    ClearFailed {
        #[arg(long, value_enum)]
        dataset: Dataset,
    },
}

fn main() -> ExitCode {
    if let Err(report) = run() {
        eprintln!("{report:?}");
        if let Some(surge) = report.downcast_ref::<SurgeError>() {
            return ExitCode::from(map_exit_code(surge));
        }
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

fn map_exit_code(error: &SurgeError) -> u8 {
    match error {
        SurgeError::InvalidStationName(_)
        | SurgeError::InvalidSourceKey(_)
        | SurgeError::InvalidSourceName(_)
        | SurgeError::InvalidLocationType(_)
        | SurgeError::InvalidRunId(_)
        | SurgeError::InvalidTimemark(_)
        | SurgeError::MissingConfig
        | SurgeError::StationNotFound(_)
        | SurgeError::SourceNotFound(_)
        | SurgeError::FileNotTracked(_) => 2,
        SurgeError::Database(_)
        | SurgeError::Filesystem(_)
        | SurgeError::Csv(_)
        | SurgeError::RetriesExhausted { .. } => 3,
        _ => 1,
    }
}

fn run() -> miette::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = ConfigLoader::resolve(cli.config.as_deref())?;
    let database = cli
        .database
        .map(Utf8PathBuf::from)
        .unwrap_or_else(|| config.database.clone());

    match cli.command {
        Commands::Init => {
            Db::open(&database)?;
            JsonOutput::print_count("tables_ready", 1).into_diagnostic()
        }
        Commands::Stations(args) => match args.command {
            StationsCommand::Load { path } => {
                let db = Db::open(&database)?;
                let count = Registry::new(&db).load_stations_csv(&Utf8PathBuf::from(path))?;
                JsonOutput::print_count("stations_loaded", count).into_diagnostic()
            }
        },
        Commands::Sources(args) => match args.command {
            SourcesCommand::Load { path } => {
                let db = Db::open(&database)?;
                let count = Registry::new(&db).load_sources_csv(&Utf8PathBuf::from(path))?;
                JsonOutput::print_count("sources_loaded", count).into_diagnostic()
            }
        },
        Commands::Ingest(args) => run_ingest(args, &database, &config),
        Commands::Query(args) => run_query(args, &database),
        Commands::Tracker(args) => match args.command {
            TrackerCommand::ClearFailed { dataset } => {
                let db = Db::open(&database)?;
                let cleared = Tracker::new(&db).clear_failed(dataset)?;
                JsonOutput::print_count("cleared", cleared).into_diagnostic()
            }
        },
    }
}

fn run_ingest(
    args: IngestArgs,
    database: &Utf8PathBuf,
    config: &surgegauge::config::ResolvedConfig,
) -> miette::Result<()> {
    let run = args
        .run_id
        .as_deref()
        .map(str::parse::<ModelRunId>)
        .transpose()?;
    let timemark = args
        .timemark
        .as_deref()
        .map(str::parse::<Timemark>)
        .transpose()?;

    let ctx = RunContext::new(
        args.harvest_dir
            .map(Utf8PathBuf::from)
            .unwrap_or_else(|| config.harvest_dir.clone()),
        args.ingest_dir
            .map(Utf8PathBuf::from)
            .unwrap_or_else(|| config.ingest_dir.clone()),
        args.dataset,
        run,
        timemark,
    )?;

    let mut db = Db::open(database)?;
    let summary = Pipeline::new(&mut db, ctx).run(args.stage)?;
    JsonOutput::print_summary(&summary).into_diagnostic()
}

fn run_query(args: QueryArgs, database: &Utf8PathBuf) -> miette::Result<()> {
    let db = Db::open(database)?;
    let engine = PivotEngine::new(&db);

    match args.command {
        QueryCommand::Obs(args) => {
            let station: StationName = args.station.parse()?;
            let start = parse_time(&args.start)
                .ok_or_else(|| miette::Report::msg(format!("invalid start time: {}", args.start)))?;
            let end = parse_time(&args.end)
                .ok_or_else(|| miette::Report::msg(format!("invalid end time: {}", args.end)))?;
            let rows = engine.obs_series(
                &station,
                start,
                end,
                &args.sources,
                args.nowcast_source.as_deref(),
            )?;
            JsonOutput::print_rows(&rows).into_diagnostic()
        }
        QueryCommand::Forecast(args) => {
            let station: StationName = args.station.parse()?;
            let run: ModelRunId = args.run_id.parse()?;
            let rows = engine.forecast_series(&station, &run, &args.source)?;
            JsonOutput::print_rows(&rows).into_diagnostic()
        }
    }
}
