use std::process::ExitCode;
use std::time::Duration;

use camino::Utf8PathBuf;
use clap::{Args, Parser, Subcommand};
use miette::IntoDiagnostic;
use tracing_subscriber::EnvFilter;

use parcelcode::app::App;
use parcelcode::browser::HttpBrowser;
use parcelcode::config::{ConfigLoader, ResolvedConfig};
use parcelcode::error::ParcelError;
use parcelcode::fetcher::{BrowserExportSource, ExportFile, ExportSource};
use parcelcode::output::{JsonOutput, LogSink};
use parcelcode::store::Store;

#[derive(Parser)]
#[command(name = "parcelcode")]
#[command(about = "Harvest land-parcel exports and assign canonical address codes")]
#[command(version)]
struct Cli {
    #[arg(long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Download exports for every URL in a list")]
    Fetch(FetchArgs),
    #[command(about = "Parse export files without writing them")]
    Parse(ParseArgs),
    #[command(about = "Load export files into the raw observation store")]
    Load(LoadArgs),
    #[command(about = "Assign canonical codes to new observations")]
    Canonicalize(StoreArgs),
    #[command(about = "Look up one address by canonical code")]
    Address(AddressArgs),
    #[command(about = "Print all addresses as a GeoJSON FeatureCollection")]
    Plots(StoreArgs),
}

#[derive(Args)]
struct FetchArgs {
    url_list: Utf8PathBuf,
    out_dir: Utf8PathBuf,

    #[arg(long)]
    concurrency: Option<usize>,

    #[arg(long)]
    delay_ms: Option<u64>,
}

#[derive(Args)]
struct ParseArgs {
    export_dir: Utf8PathBuf,
}

#[derive(Args)]
struct LoadArgs {
    export_dir: Utf8PathBuf,
    store: String,

    #[arg(long)]
    source: Option<String>,
}

#[derive(Args)]
struct StoreArgs {
    store: String,
}

#[derive(Args)]
struct AddressArgs {
    store: String,
    code: String,
}

fn main() -> ExitCode {
    if let Err(report) = run() {
        eprintln!("{report:?}");
        if let Some(err) = report.downcast_ref::<ParcelError>() {
            return ExitCode::from(map_exit_code(err));
        }
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

fn map_exit_code(error: &ParcelError) -> u8 {
    match error {
        ParcelError::AddressNotFound(_) => 2,
        err if err.is_fatal() => 3,
        _ => 1,
    }
}

fn run() -> miette::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut config = ConfigLoader::resolve(cli.config.as_deref())?;

    match cli.command {
        Commands::Fetch(args) => {
            if let Some(concurrency) = args.concurrency {
                if concurrency == 0 {
                    return Err(ParcelError::InvalidConfig(
                        "--concurrency must be at least 1".to_string(),
                    )
                    .into());
                }
                config.fetch.concurrency = concurrency;
            }
            if let Some(delay) = args.delay_ms {
                config.fetch.inter_request_delay = Duration::from_millis(delay);
            }
            let browser = HttpBrowser::launch(&config.fetch.user_agent)?;
            let source = BrowserExportSource::new(browser, config.fetch.clone());
            let app = App::new(config, source);
            let result = app.fetch(&args.url_list, &args.out_dir, &LogSink)?;
            JsonOutput::print_fetch(&result).into_diagnostic()
        }
        Commands::Parse(args) => {
            let app = offline_app(config);
            let result = app.parse(&args.export_dir, &LogSink)?;
            JsonOutput::print_parse(&result).into_diagnostic()
        }
        Commands::Load(args) => {
            if let Some(source) = args.source {
                config.source = source;
            }
            let store = Store::open(&args.store)?;
            let app = offline_app(config);
            let result = app.load(&store, &args.export_dir, &LogSink)?;
            JsonOutput::print_load(&result).into_diagnostic()
        }
        Commands::Canonicalize(args) => {
            let store = Store::open(&args.store)?;
            let app = offline_app(config);
            let result = app.canonicalize(&store, &LogSink)?;
            JsonOutput::print_canonicalize(&result).into_diagnostic()
        }
        Commands::Address(args) => {
            let store = Store::open(&args.store)?;
            let app = offline_app(config);
            let result = app.address(&store, &args.code)?;
            JsonOutput::print_address(&result).into_diagnostic()
        }
        Commands::Plots(args) => {
            let store = Store::open(&args.store)?;
            let app = offline_app(config);
            let result = app.plots(&store)?;
            JsonOutput::print_plots(&result).into_diagnostic()
        }
    }
}

fn offline_app(config: ResolvedConfig) -> App<NopExportSource> {
    App::new(config, NopExportSource)
}

struct NopExportSource;

impl ExportSource for NopExportSource {
    fn export_for(&self, _url: &str) -> Result<Option<ExportFile>, ParcelError> {
        Err(ParcelError::BrowserLaunch(
            "browsing backend not started".to_string(),
        ))
    }
}
