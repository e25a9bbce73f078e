use std::process::ExitCode;

use camino::Utf8PathBuf;
use chrono::NaiveDate;
use clap::{Args, Parser, Subcommand};
use directories::BaseDirs;
use miette::IntoDiagnostic;
use tracing_subscriber::EnvFilter;

use uke_stations::db::Database;
use uke_stations::domain::{Location, PointFilter};
use uke_stations::downloader::{HttpPublicationClient, PublicationClient, SaveHandler};
use uke_stations::error::StationError;
use uke_stations::output::{CheckResult, ClearResult, JsonOutput, RefreshResult, StderrProgress};
use uke_stations::repository::PointsRepository;
use uke_stations::storage::FileStorage;

const DEFAULT_PAGE_URL: &str = "https://bip.uke.gov.pl/pozwolenia-radiowe/wykaz-pozwolen-radiowych-tresci/stacje-gsm-umts-lte-5gnr-oraz-cdma,12,0.html";

#[derive(Parser)]
#[command(name = "uke-stations")]
#[command(about = "Ingests UKE radio-permit spreadsheets into a local, spatially-queryable station database")]
#[command(version, author)]
struct Cli {
    /// Index page listing the permit spreadsheets.
    #[arg(long, global = true, default_value = DEFAULT_PAGE_URL)]
    page_url: String,

    /// Data directory; defaults to a per-user application directory.
    #[arg(long, global = true)]
    data_dir: Option<Utf8PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Compare the remote publication date against local data")]
    Check,
    #[command(about = "Download the current publication and rebuild the database")]
    Refresh,
    #[command(about = "Query stations around a location")]
    Points(PointsArgs),
    #[command(about = "Dump every stored station")]
    All(FilterArgs),
    #[command(about = "List distinct technologies")]
    Technologies,
    #[command(about = "List distinct operator names")]
    Operators,
    #[command(about = "Delete all local data")]
    Clear,
}

#[derive(Args)]
struct PointsArgs {
    #[arg(long, allow_hyphen_values = true)]
    lat: f64,

    #[arg(long, allow_hyphen_values = true)]
    lon: f64,

    /// Search radius in meters.
    #[arg(long, default_value_t = 2_000.0)]
    radius: f64,

    #[command(flatten)]
    filter: FilterArgs,
}

#[derive(Args)]
struct FilterArgs {
    /// Restrict to a technology; repeatable.
    #[arg(long = "technology")]
    technologies: Vec<String>,

    /// Restrict to an operator; repeatable.
    #[arg(long = "operator")]
    operators: Vec<String>,
}

impl FilterArgs {
    fn into_filter(self) -> PointFilter {
        PointFilter {
            technologies: if self.technologies.is_empty() {
                None
            } else {
                Some(self.technologies)
            },
            operator_names: if self.operators.is_empty() {
                None
            } else {
                Some(self.operators)
            },
        }
    }
}

fn main() -> ExitCode {
    if let Err(report) = run() {
        eprintln!("{report:?}");
        if let Some(err) = report.downcast_ref::<StationError>() {
            return ExitCode::from(map_exit_code(err));
        }
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

fn map_exit_code(error: &StationError) -> u8 {
    match error {
        StationError::IndexHttp(_)
        | StationError::IndexStatus { .. }
        | StationError::DownloadHttp(_)
        | StationError::MissingPublicationDate => 3,
        StationError::Database(_) => 4,
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
    let data_dir = match cli.data_dir {
        Some(dir) => dir,
        None => default_data_dir().into_diagnostic()?,
    };
    std::fs::create_dir_all(data_dir.as_std_path()).into_diagnostic()?;

    let storage = FileStorage::new(data_dir.join("publications"));
    let db = Database::open(data_dir.join("stations.sqlite").as_std_path()).into_diagnostic()?;

    match cli.command {
        Commands::Check => {
            let client = HttpPublicationClient::new().into_diagnostic()?;
            let repo = PointsRepository::new(client, storage, db, cli.page_url);
            let remote = repo.get_remote_date().into_diagnostic()?;
            let local = repo.get_local_dates().into_diagnostic()?;
            let result = CheckResult {
                new_version_available: repo.is_new_version_available().into_diagnostic()?,
                remote_date: remote.to_string(),
                local_dates: local.iter().map(NaiveDate::to_string).collect(),
            };
            JsonOutput::print_check(&result).into_diagnostic()
        }
        Commands::Refresh => {
            let client = HttpPublicationClient::new().into_diagnostic()?;
            let repo = PointsRepository::new(client, storage, db, cli.page_url);
            let date = repo.refresh(&StderrProgress).into_diagnostic()?;
            JsonOutput::print_refresh(&RefreshResult {
                date: date.map(|date| date.to_string()),
            })
            .into_diagnostic()
        }
        Commands::Points(args) => {
            let repo = PointsRepository::new(NopClient, storage, db, cli.page_url);
            let near = Location {
                latitude: args.lat,
                longitude: args.lon,
            };
            let points = repo
                .get_points(near, args.radius, &args.filter.into_filter())
                .into_diagnostic()?;
            JsonOutput::print_points(&points).into_diagnostic()
        }
        Commands::All(args) => {
            let repo = PointsRepository::new(NopClient, storage, db, cli.page_url);
            let points = repo
                .get_all_points(Some(&args.into_filter()))
                .into_diagnostic()?;
            JsonOutput::print_points(&points).into_diagnostic()
        }
        Commands::Technologies => {
            let repo = PointsRepository::new(NopClient, storage, db, cli.page_url);
            let names = repo.get_technologies().into_diagnostic()?;
            JsonOutput::print_names(&names).into_diagnostic()
        }
        Commands::Operators => {
            let repo = PointsRepository::new(NopClient, storage, db, cli.page_url);
            let names = repo.get_operator_names().into_diagnostic()?;
            JsonOutput::print_names(&names).into_diagnostic()
        }
        Commands::Clear => {
            let repo = PointsRepository::new(NopClient, storage, db, cli.page_url);
            repo.delete_all_local_data().into_diagnostic()?;
            JsonOutput::print_clear(&ClearResult { cleared: true }).into_diagnostic()
        }
    }
}

fn default_data_dir() -> Result<Utf8PathBuf, StationError> {
    let base = BaseDirs::new()
        .ok_or_else(|| StationError::Filesystem("no home directory".to_string()))?;
    let dir = base.data_local_dir().join("uke-stations");
    Utf8PathBuf::from_path_buf(dir)
        .map_err(|_| StationError::Filesystem("non-utf8 data directory".to_string()))
}

/// Placeholder for commands that never touch the network.
#[derive(Clone, Copy)]
struct NopClient;

impl PublicationClient for NopClient {
    fn fetch_current_data_date(&self, _page_url: &str) -> Result<NaiveDate, StationError> {
        Err(StationError::IndexHttp(
            "network client not configured".to_string(),
        ))
    }

    fn download_files(
        &self,
        _page_url: &str,
        _save: SaveHandler<'_>,
    ) -> Result<(), StationError> {
        Err(StationError::IndexHttp(
            "network client not configured".to_string(),
        ))
    }
}
