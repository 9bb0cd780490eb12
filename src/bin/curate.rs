use std::process::ExitCode;

use camino::{Utf8Path, Utf8PathBuf};
use clap::{Args, Parser, Subcommand};
use miette::IntoDiagnostic;
use tracing_subscriber::EnvFilter;

use series_curator::app::{AnalyzeOptions, Curator, ProgressSinkKind};
use series_curator::classifier::{CancelFlag, GeminiHttpClient};
use series_curator::config::{ConfigLoader, ResolvedConfig, resolve_api_key};
use series_curator::error::CurateError;
use series_curator::output::{JsonOutput, LogProgress, OutputMode, TextOutput};
use series_curator::review::Reviewer;
use series_curator::store::{SeriesFilter, SeriesOrder, SqliteStore};
use series_curator::tui::{self, ProgressScreen, ReviewerUi};

#[derive(Parser)]
#[command(name = "curate")]
#[command(about = "Curate scraped photo posts into ordered, captioned image series")]
#[command(version, author)]
struct Cli {
    /// JSON output, no prompts or screens
    #[arg(long, global = true)]
    non_interactive: bool,

    #[arg(long, global = true)]
    db_path: Option<Utf8PathBuf>,

    #[arg(long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Cluster a directory and classify every new candidate sequence")]
    Analyze(AnalyzeArgs),
    #[command(about = "Review confirmed series in the terminal")]
    Review,
    #[command(about = "Show database statistics")]
    Stats(StatsArgs),
    #[command(about = "List the newest stored series")]
    List(ListArgs),
    #[command(about = "Print the stored classification of a series")]
    Show(ShowArgs),
    #[command(about = "Delete every series with the given base name")]
    Remove(RemoveArgs),
    #[command(about = "Drop references to missing files and empty series")]
    Clean,
}

#[derive(Args)]
struct AnalyzeArgs {
    directory: Utf8PathBuf,

    #[arg(long)]
    api_key: Option<String>,

    /// Classify at most N candidates
    #[arg(long)]
    limit: Option<usize>,

    /// Keep key order instead of largest candidates first
    #[arg(long)]
    no_sort: bool,
}

#[derive(Args)]
struct StatsArgs {
    #[arg(long, default_value_t = 5)]
    top: usize,
}

#[derive(Args)]
struct ListArgs {
    #[arg(long, default_value_t = 20)]
    limit: usize,
}

#[derive(Args)]
struct ShowArgs {
    base_name: String,
}

#[derive(Args)]
struct RemoveArgs {
    base_name: String,

    /// Skip the confirmation prompt
    #[arg(long)]
    yes: bool,
}

fn main() -> ExitCode {
    if let Err(report) = run() {
        eprintln!("{report:?}");
        if let Some(error) = report.downcast_ref::<CurateError>() {
            return ExitCode::from(map_exit_code(error));
        }
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

fn map_exit_code(error: &CurateError) -> u8 {
    match error {
        CurateError::DatabaseNotFound(_)
        | CurateError::ScanRoot(_)
        | CurateError::SeriesNotFound(_)
        | CurateError::SeriesNameNotFound(_)
        | CurateError::ConfigRead(_)
        | CurateError::MissingApiKey => 2,
        CurateError::ServiceHttp(_)
        | CurateError::ServiceStatus { .. }
        | CurateError::ServiceResponse(_) => 3,
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
    let output_mode = if cli.non_interactive {
        OutputMode::NonInteractive
    } else {
        OutputMode::Interactive
    };

    let config = ConfigLoader::resolve(cli.config.as_deref())?;
    let db_path = cli
        .db_path
        .clone()
        .unwrap_or_else(|| config.database_path.clone());

    match cli.command {
        Commands::Analyze(args) => run_analyze(args, &config, &db_path, output_mode),
        Commands::Review => run_review(&db_path, output_mode),
        Commands::Stats(args) => {
            let curator = Curator::new(SqliteStore::open_existing(&db_path)?);
            let result = curator.stats(args.top)?;
            let printed = match output_mode {
                OutputMode::NonInteractive => JsonOutput::print_stats(&result),
                OutputMode::Interactive => TextOutput::print_stats(&result),
            };
            printed.into_diagnostic()
        }
        Commands::List(args) => {
            let curator = Curator::new(SqliteStore::open_existing(&db_path)?);
            let result = curator.list(Some(args.limit))?;
            let printed = match output_mode {
                OutputMode::NonInteractive => JsonOutput::print_list(&result),
                OutputMode::Interactive => TextOutput::print_list(&result),
            };
            printed.into_diagnostic()
        }
        Commands::Show(args) => {
            let curator = Curator::new(SqliteStore::open_existing(&db_path)?);
            let result = curator.show(&args.base_name)?;
            JsonOutput::print_show(&result).into_diagnostic()
        }
        Commands::Remove(args) => run_remove(args, &db_path, output_mode),
        Commands::Clean => run_clean(&db_path, output_mode),
    }
}

fn run_analyze(
    args: AnalyzeArgs,
    config: &ResolvedConfig,
    db_path: &Utf8Path,
    output_mode: OutputMode,
) -> miette::Result<()> {
    let api_key = resolve_api_key(args.api_key.as_deref())?;
    let cancel = CancelFlag::default();
    let classifier = GeminiHttpClient::new(config.gemini_settings(api_key), cancel.clone())?;
    let mut curator = Curator::new(SqliteStore::open(db_path)?);
    let options = AnalyzeOptions {
        limit: args.limit,
        sort_by_size: !args.no_sort,
        min_images: config.min_images_for_series,
        max_images: config.max_images_for_series,
        policy: config.request_policy(),
    };
    let directory = args.directory;

    match output_mode {
        OutputMode::NonInteractive => {
            let summary = curator.analyze(&directory, &classifier, &options, &cancel, &LogProgress)?;
            JsonOutput::print_analyze(&summary).into_diagnostic()
        }
        OutputMode::Interactive => {
            let mut screen = ProgressScreen::new(ProgressSinkKind::Analyze, cancel.clone());
            let summary = screen.run(move |sink| {
                curator.analyze(&directory, &classifier, &options, &cancel, sink)
            })?;
            TextOutput::print_analyze(&summary).into_diagnostic()
        }
    }
}

fn run_review(db_path: &Utf8Path, output_mode: OutputMode) -> miette::Result<()> {
    if output_mode == OutputMode::NonInteractive {
        return Err(miette::miette!("review needs an interactive terminal"));
    }
    let store = SqliteStore::open_existing(db_path)?;
    let reviewer = Reviewer::load(
        store,
        &SeriesFilter::confirmed().with_order(SeriesOrder::MemberCountDesc),
    )?;
    if reviewer.is_empty() {
        println!("No confirmed series to review.");
        return Ok(());
    }
    let summary = ReviewerUi::new(reviewer).run()?;
    println!(
        "Saved {} series, deleted {}, discarded changes to {}.",
        summary.saved, summary.deleted, summary.discarded
    );
    Ok(())
}

fn run_remove(args: RemoveArgs, db_path: &Utf8Path, output_mode: OutputMode) -> miette::Result<()> {
    let mut curator = Curator::new(SqliteStore::open_existing(db_path)?);
    if output_mode == OutputMode::Interactive && !args.yes {
        let question = format!("Delete every series named {}?", args.base_name);
        if !tui::confirm("Confirm", &question)? {
            println!("Nothing removed.");
            return Ok(());
        }
    }
    let result = curator.remove(&args.base_name)?;
    let printed = match output_mode {
        OutputMode::NonInteractive => JsonOutput::print_remove(&result),
        OutputMode::Interactive => TextOutput::print_remove(&result),
    };
    printed.into_diagnostic()
}

fn run_clean(db_path: &Utf8Path, output_mode: OutputMode) -> miette::Result<()> {
    let mut curator = Curator::new(SqliteStore::open_existing(db_path)?);
    match output_mode {
        OutputMode::NonInteractive => {
            let report = curator.clean(&JsonOutput)?;
            JsonOutput::print_clean(&report).into_diagnostic()
        }
        OutputMode::Interactive => {
            let mut screen = ProgressScreen::new(ProgressSinkKind::Clean, CancelFlag::default());
            let report = screen.run(move |sink| curator.clean(sink))?;
            println!(
                "Checked {} image references, removed {} missing, removed {} empty series.",
                report.checked, report.removed, report.empty_series_removed
            );
            Ok(())
        }
    }
}
