use std::process::ExitCode;

use clap::{Args, Parser, Subcommand};
use miette::IntoDiagnostic;
use tracing::info;
use tracing_subscriber::EnvFilter;

use earthdata_sync::app::{App, ProgressSink, RunResult, SyncOptions};
use earthdata_sync::auth::{CmrTokenClient, Token, TokenService, resolve_credentials};
use earthdata_sync::cmr::{CatalogClient, CmrHttpClient, SearchPage};
use earthdata_sync::config::{ConfigLoader, ConfigOverrides, ResolvedConfig};
use earthdata_sync::domain::CyclePass;
use earthdata_sync::error::SyncError;
use earthdata_sync::fetch::{Downloader, HttpDownloader};
use earthdata_sync::output::{ConsoleOutput, JsonOutput, OutputMode, log_filter};
use earthdata_sync::query::SearchQuery;

#[derive(Parser)]
#[command(name = "earthdata-sync")]
#[command(about = "Incrementally download new granules of a NASA Earthdata collection")]
#[command(version, author)]
struct Cli {
    /// Print the result as JSON and suppress progress lines.
    #[arg(long, global = true)]
    json: bool,

    #[arg(long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Download granules added since the last successful run")]
    Sync(SyncArgs),
    #[command(about = "Download every granule of one orbit cycle (and pass)")]
    Cycle(CycleArgs),
    #[command(about = "Show the data directory and checkpoint state")]
    Status(OverrideArgs),
}

#[derive(Args, Clone, Default)]
struct OverrideArgs {
    #[arg(long)]
    data_dir: Option<String>,

    #[arg(long)]
    short_name: Option<String>,

    #[arg(long)]
    concept_id: Option<String>,

    /// Range mode: fetch granules with data since this time (yyyy-MM-ddTHH:mm:ssZ).
    #[arg(long)]
    since: Option<String>,

    #[arg(long)]
    lookback_minutes: Option<u32>,

    /// W,S,E,N in degrees.
    #[arg(long, allow_hyphen_values = true)]
    bbox: Option<String>,

    #[arg(long = "extension")]
    extensions: Vec<String>,

    #[arg(long)]
    no_paginate: bool,

    #[arg(long)]
    timeout_secs: Option<u64>,
}

#[derive(Args, Clone)]
struct SyncArgs {
    #[command(flatten)]
    overrides: OverrideArgs,

    #[arg(long)]
    dry_run: bool,
}

#[derive(Args, Clone)]
struct CycleArgs {
    #[command(flatten)]
    overrides: OverrideArgs,

    #[arg(long)]
    cycle: u32,

    #[arg(long)]
    pass: Option<u32>,

    #[arg(long)]
    dry_run: bool,
}

impl From<OverrideArgs> for ConfigOverrides {
    fn from(args: OverrideArgs) -> Self {
        ConfigOverrides {
            data_dir: args.data_dir,
            short_name: args.short_name,
            concept_id: args.concept_id,
            data_since: args.since,
            lookback_minutes: args.lookback_minutes,
            bounding_box: args.bbox,
            extensions: args.extensions,
            no_paginate: args.no_paginate,
            timeout_secs: args.timeout_secs,
        }
    }
}

fn main() -> ExitCode {
    if let Err(report) = run() {
        eprintln!("{report:?}");
        if let Some(error) = report.downcast_ref::<SyncError>() {
            return ExitCode::from(map_exit_code(error));
        }
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

fn map_exit_code(error: &SyncError) -> u8 {
    if error.is_config() {
        2
    } else if error.is_auth() {
        4
    } else if error.is_transport() {
        3
    } else {
        1
    }
}

fn run() -> miette::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(log_filter(
            &std::env::var(EnvFilter::DEFAULT_ENV).unwrap_or_default(),
        ))
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let output_mode = if cli.json {
        OutputMode::Json
    } else {
        OutputMode::Console
    };

    match cli.command {
        Commands::Sync(args) => {
            let resolved = ConfigLoader::resolve(cli.config.as_deref(), args.overrides.into())?;
            let options = SyncOptions {
                dry_run: args.dry_run,
            };
            let app = build_app(&resolved)?;
            run_with_output(output_mode, |sink| app.sync(&resolved, options, sink))
        }
        Commands::Cycle(args) => {
            let resolved = ConfigLoader::resolve(cli.config.as_deref(), args.overrides.into())?;
            let options = SyncOptions {
                dry_run: args.dry_run,
            };
            let cycle_pass = CyclePass {
                cycle: args.cycle,
                pass: args.pass,
            };
            let app = build_app(&resolved)?;
            run_with_output(output_mode, |sink| {
                app.fetch_cycle(&resolved, cycle_pass, options, sink)
            })
        }
        Commands::Status(overrides) => {
            let resolved =
                ConfigLoader::resolve_for_status(cli.config.as_deref(), overrides.into())?;
            let app = App::new(NopTokens, NopCatalog, NopDownloader);
            let status = app.status(&resolved);
            match output_mode {
                OutputMode::Json => JsonOutput::print_status(&status).into_diagnostic()?,
                OutputMode::Console => ConsoleOutput::new().print_status(&status),
            }
            Ok(())
        }
    }
}

fn build_app(
    resolved: &ResolvedConfig,
) -> Result<App<CmrTokenClient, CmrHttpClient, HttpDownloader>, SyncError> {
    let credentials = resolve_credentials(&resolved.auth, &resolved.endpoints.edl)?;
    info!(
        user = %credentials.username,
        host = %resolved.endpoints.edl,
        "using Earthdata Login account"
    );
    let tokens = CmrTokenClient::new(
        &resolved.endpoints,
        &resolved.auth,
        credentials.clone(),
        resolved.timeout,
    )?;
    let catalog = CmrHttpClient::new(&resolved.endpoints, resolved.timeout)?;
    let downloader = HttpDownloader::new(
        &resolved.endpoints.edl,
        Some(credentials),
        resolved.timeout,
        resolved.download_retries,
    )?;
    Ok(App::new(tokens, catalog, downloader))
}

fn run_with_output(
    output_mode: OutputMode,
    run: impl FnOnce(&dyn ProgressSink) -> Result<RunResult, SyncError>,
) -> miette::Result<()> {
    match output_mode {
        OutputMode::Json => {
            let result = run(&JsonOutput)?;
            JsonOutput::print_run(&result).into_diagnostic()?;
        }
        OutputMode::Console => {
            let console = ConsoleOutput::new();
            let result = run(&console)?;
            console.print_run(&result);
        }
    }
    Ok(())
}

struct NopTokens;
struct NopCatalog;
struct NopDownloader;

impl TokenService for NopTokens {
    fn acquire(&self) -> Result<Token, SyncError> {
        Err(SyncError::MissingCredentials(
            "token service not configured".to_string(),
        ))
    }

    fn revoke(&self, _token: &Token) -> Result<(), SyncError> {
        Ok(())
    }
}

impl CatalogClient for NopCatalog {
    fn search_page(
        &self,
        _query: &SearchQuery,
        _scroll_id: Option<&str>,
    ) -> Result<SearchPage, SyncError> {
        Err(SyncError::CmrHttp("CMR client not configured".to_string()))
    }
}

impl Downloader for NopDownloader {
    fn download(&self, _url: &str, _destination: &std::path::Path) -> Result<(), SyncError> {
        Err(SyncError::DownloadHttp(
            "downloader not configured".to_string(),
        ))
    }
}
