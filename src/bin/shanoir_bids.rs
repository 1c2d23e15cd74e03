use std::path::{Path, PathBuf};
use std::process::ExitCode;

use camino::Utf8PathBuf;
use clap::{Args, Parser, Subcommand};
use miette::IntoDiagnostic;
use tracing_subscriber::EnvFilter;

use shanoir_bids::app::{App, FetchAction, FetchOptions, FetchResult};
use shanoir_bids::catalog::{CatalogClient, SearchOutcome, ShanoirHttpClient};
use shanoir_bids::config::{ConfigLoader, ResolvedConfig, Toolchain};
use shanoir_bids::credentials;
use shanoir_bids::domain::{DatasetRecord, FileType, SearchQuery};
use shanoir_bids::dwi::{self, DwiOptions};
use shanoir_bids::error::BidsError;
use shanoir_bids::extract::{self, ExtractOptions, ExtractStatus, SubjectExtraction};
use shanoir_bids::layout::{self, BidsLayout};
use shanoir_bids::output::{ConsoleOutput, JsonOutput, OutputMode};
use shanoir_bids::pipeline::{
    FailurePolicy, PipelineReport, StepStatus, SystemToolRunner, find_in_path,
};

const GREEN: &str = "\x1b[32m";
const YELLOW: &str = "\x1b[33m";
const CYAN: &str = "\x1b[36m";
const RED: &str = "\x1b[31m";
const RESET: &str = "\x1b[0m";

#[derive(Parser)]
#[command(name = "shanoir-bids")]
#[command(
    about = "Download Shanoir series into a BIDS-like layout and run the preprocessing toolchain"
)]
#[command(version, author)]
struct Cli {
    /// Print machine-readable JSON on stdout instead of a summary.
    #[arg(long, global = true)]
    non_interactive: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Search, download and place the configured sequences")]
    Fetch(FetchArgs),
    #[command(about = "List every dataset available for a subject")]
    Sequences(SequencesArgs),
    #[command(about = "Place an already downloaded archive into the layout")]
    Place(PlaceArgs),
    #[command(about = "Unzip DICOM archives and convert them to NIfTI")]
    Extract(ExtractArgs),
    #[command(about = "Run the diffusion preprocessing chain on one image")]
    PreprocessDwi(DwiArgs),
}

#[derive(Args)]
struct FetchArgs {
    #[arg(long)]
    config: Option<String>,

    /// Overrides the configured username.
    #[arg(long)]
    username: Option<String>,

    /// Report what would be placed without downloading anything.
    #[arg(long)]
    dry_run: bool,

    /// Subject pattern to fetch instead of the configured list (repeatable).
    #[arg(long = "subject")]
    subjects: Vec<String>,
}

#[derive(Args)]
struct SequencesArgs {
    subject: String,

    #[arg(long)]
    config: Option<String>,

    #[arg(long)]
    username: Option<String>,
}

#[derive(Args)]
struct PlaceArgs {
    #[arg(long)]
    config: Option<String>,

    /// Archive to place. Located in --download-dir when omitted.
    #[arg(long, conflicts_with = "download_dir")]
    archive: Option<Utf8PathBuf>,

    #[arg(long, required_unless_present = "archive")]
    download_dir: Option<Utf8PathBuf>,

    #[arg(long)]
    dataset_id: String,

    /// Subject name as the portal reports it.
    #[arg(long)]
    subject_name: String,

    /// Configured sequence the archive belongs to.
    #[arg(long)]
    sequence: String,

    /// Dataset name as the portal reports it. Defaults to the sequence name.
    #[arg(long)]
    dataset_name: Option<String>,
}

#[derive(Args)]
struct ExtractArgs {
    /// Modality directory to process, e.g. `diffusion` or `structural`.
    modality_dir: String,

    #[arg(long, default_value = "data")]
    data_dir: Utf8PathBuf,

    /// Converter executable. Looked up on PATH when omitted.
    #[arg(long)]
    dcm2niix: Option<PathBuf>,
}

#[derive(Args)]
struct DwiArgs {
    #[arg(short, long)]
    input: PathBuf,

    #[arg(short, long)]
    bval: PathBuf,

    #[arg(short, long)]
    grad: Option<PathBuf>,

    /// Reverse phase-encoding B0 image.
    #[arg(short, long)]
    reverse: Option<PathBuf>,

    /// Phase encoding direction (0 x, 1 y, 2 z).
    #[arg(short, long, default_value_t = 1, value_parser = clap::value_parser!(u8).range(0..=2))]
    direction: u8,

    /// T1 image used for distortion correction and brain masking.
    #[arg(short, long)]
    t1: Option<PathBuf>,

    #[arg(long)]
    no_eddy_correction: bool,

    #[arg(long)]
    no_disto_correction: bool,

    #[arg(long)]
    no_denoising: bool,

    #[arg(long)]
    no_brain_masking: bool,

    #[arg(long, default_value = "python")]
    python: PathBuf,

    /// Toolchain config. Defaults to ~/.anima/config.txt.
    #[arg(long)]
    toolchain: Option<PathBuf>,

    #[arg(long, value_enum, default_value_t = FailurePolicy::FailFast)]
    on_failure: FailurePolicy,
}

fn main() -> ExitCode {
    if let Err(report) = run() {
        eprintln!("{report:?}");
        if let Some(error) = report.downcast_ref::<BidsError>() {
            return ExitCode::from(error.exit_code());
        }
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

fn run() -> miette::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let output_mode = if cli.non_interactive {
        OutputMode::NonInteractive
    } else {
        OutputMode::Interactive
    };

    match cli.command {
        Commands::Fetch(args) => run_fetch(args, output_mode),
        Commands::Sequences(args) => run_sequences(args, output_mode),
        Commands::Place(args) => run_place(args, output_mode),
        Commands::Extract(args) => run_extract(args, output_mode),
        Commands::PreprocessDwi(args) => run_preprocess(args, output_mode),
    }
}

fn connect(
    config: &ResolvedConfig,
    username: Option<String>,
    output_mode: OutputMode,
) -> Result<ShanoirHttpClient, BidsError> {
    let Some(username) = username.or_else(|| config.username.clone()) else {
        return Err(BidsError::InvalidConfig(
            "username is required (config `username` or --username)".to_string(),
        ));
    };
    let interactive = matches!(output_mode, OutputMode::Interactive);
    let credentials = credentials::resolve(&username, interactive)?;
    ShanoirHttpClient::new(&config.host, credentials)
}

fn run_fetch(args: FetchArgs, output_mode: OutputMode) -> miette::Result<()> {
    let config = ConfigLoader::resolve(args.config.as_deref())?;
    let options = FetchOptions {
        dry_run: args.dry_run,
        subjects: args.subjects,
    };
    let client = connect(&config, args.username, output_mode)?;
    let app = App::new(BidsLayout::new(config.output_dir.clone()), client);

    match output_mode {
        OutputMode::NonInteractive => {
            let result = app.fetch(&config, &options, &JsonOutput)?;
            JsonOutput::print_fetch(&result).into_diagnostic()?;
        }
        OutputMode::Interactive => {
            let result = app.fetch(&config, &options, &ConsoleOutput)?;
            print_fetch_summary(&result);
        }
    }
    Ok(())
}

fn run_sequences(args: SequencesArgs, output_mode: OutputMode) -> miette::Result<()> {
    let config = ConfigLoader::resolve(args.config.as_deref())?;
    let client = connect(&config, args.username, output_mode)?;
    let app = App::new(BidsLayout::new(config.output_dir.clone()), client);
    let records = app.sequences(&config, &args.subject)?;

    match output_mode {
        OutputMode::NonInteractive => JsonOutput::print_sequences(&records).into_diagnostic()?,
        OutputMode::Interactive => {
            println!(
                "{CYAN}{} dataset(s) for {}{RESET}",
                records.len(),
                args.subject
            );
            for record in &records {
                println!(
                    "  {} - {} (id {})",
                    record.subject_name, record.dataset_name, record.id
                );
            }
        }
    }
    Ok(())
}

fn run_place(args: PlaceArgs, output_mode: OutputMode) -> miette::Result<()> {
    let config = ConfigLoader::resolve(args.config.as_deref())?;
    let Some(sequence) = config
        .sequences
        .iter()
        .find(|sequence| sequence.dataset_name.eq_ignore_ascii_case(&args.sequence))
        .cloned()
    else {
        return Err(BidsError::InvalidConfig(format!(
            "sequence `{}` is not configured",
            args.sequence
        ))
        .into());
    };

    let archive = match (args.archive, args.download_dir) {
        (Some(archive), _) => archive,
        (None, Some(dir)) => layout::locate_archive(&dir, &args.dataset_id)?,
        (None, None) => {
            return Err(miette::Report::msg("either --archive or --download-dir is required"));
        }
    };
    let record = DatasetRecord {
        id: args.dataset_id,
        subject_name: args.subject_name,
        dataset_name: args.dataset_name.unwrap_or_else(|| sequence.dataset_name.clone()),
    };

    let app = App::new(BidsLayout::new(config.output_dir.clone()), OfflineCatalog);
    let item = app.place(&config, &archive, &record, &sequence)?;

    match output_mode {
        OutputMode::NonInteractive => JsonOutput::print_json(&item).into_diagnostic()?,
        OutputMode::Interactive => match (&item.action, &item.path) {
            (FetchAction::Placed, Some(path)) => {
                for renamed in &item.renamed {
                    println!("{CYAN}earlier run now {renamed}{RESET}");
                }
                println!("{GREEN}placed {path}{RESET}");
            }
            _ => println!(
                "{YELLOW}{}: dataset name mismatch, nothing placed{RESET}",
                item.subject_id
            ),
        },
    }
    Ok(())
}

fn run_extract(args: ExtractArgs, output_mode: OutputMode) -> miette::Result<()> {
    let dcm2niix = match args.dcm2niix {
        Some(path) => path,
        None => find_in_path("dcm2niix")
            .ok_or_else(|| BidsError::MissingTool("dcm2niix".to_string()))?,
    };
    let options = ExtractOptions {
        data_dir: args.data_dir,
        modality_dir: args.modality_dir,
        dcm2niix,
    };
    let results = extract::extract_all(&options, &SystemToolRunner)?;

    match output_mode {
        OutputMode::NonInteractive => JsonOutput::print_extract(&results).into_diagnostic()?,
        OutputMode::Interactive => print_extract_summary(&results),
    }
    Ok(())
}

fn run_preprocess(args: DwiArgs, output_mode: OutputMode) -> miette::Result<()> {
    let toolchain_path = match args.toolchain {
        Some(path) => path,
        None => Toolchain::default_path()?,
    };
    let toolchain = Toolchain::load(&toolchain_path)?;

    let options = DwiOptions {
        input: args.input,
        bval: args.bval,
        grad: args.grad,
        reverse: args.reverse,
        direction: args.direction,
        t1: args.t1,
        no_eddy_correction: args.no_eddy_correction,
        no_disto_correction: args.no_disto_correction,
        no_denoising: args.no_denoising,
        no_brain_masking: args.no_brain_masking,
        python: args.python,
    };
    let pipeline = dwi::build_pipeline(&options, &toolchain)?;
    let report = pipeline.run(&SystemToolRunner, args.on_failure);

    match output_mode {
        OutputMode::NonInteractive => JsonOutput::print_pipeline(&report).into_diagnostic()?,
        OutputMode::Interactive => print_pipeline_summary(&report),
    }
    report.into_result()?;
    Ok(())
}

fn print_fetch_summary(result: &FetchResult) {
    println!("{CYAN}shanoir-bids summary{RESET}");
    println!("{GREEN}placed archives: {}{RESET}", result.placed());
    let color = if result.failures.is_empty() { YELLOW } else { RED };
    println!("{color}errors: {}{RESET}", result.failures.len());

    for item in &result.items {
        let (label, color) = match item.action {
            FetchAction::Placed => ("placed", GREEN),
            FetchAction::Planned => ("planned", CYAN),
            FetchAction::NameMismatch => ("nothing downloaded", YELLOW),
        };
        println!(
            "{color}- {} {} ({label}){RESET}",
            item.subject_id, item.dataset_name
        );
        if let Some(path) = &item.path {
            println!("{color}    {path}{RESET}");
        }
        for renamed in &item.renamed {
            println!("{color}    earlier run now {renamed}{RESET}");
        }
    }
    for failure in &result.failures {
        let target = failure
            .dataset_name
            .as_deref()
            .unwrap_or("overview search");
        println!(
            "{RED}! {} / {target}: {}{RESET}",
            failure.subject_pattern, failure.message
        );
    }
}

fn print_extract_summary(results: &[SubjectExtraction]) {
    for entry in results {
        match &entry.status {
            ExtractStatus::Extracted(files) => {
                println!("{GREEN}{}: {}{RESET}", entry.subject, files.volume)
            }
            ExtractStatus::Skipped { reason } => {
                println!("{YELLOW}{}: skipped ({reason}){RESET}", entry.subject)
            }
            ExtractStatus::Failed { message } => {
                println!("{RED}{}: {message}{RESET}", entry.subject)
            }
        }
    }
}

fn print_pipeline_summary(report: &PipelineReport) {
    println!(
        "{CYAN}{}/{} step(s) completed{RESET}",
        report.completed(),
        report.steps.len()
    );
    for step in &report.steps {
        match &step.status {
            StepStatus::Completed => println!("{GREEN}ok      {}{RESET}", step.name),
            StepStatus::Failed { message } => {
                println!("{RED}failed  {}: {message}{RESET}", step.name)
            }
            StepStatus::Skipped { reason } => {
                println!("{YELLOW}skipped {}: {reason}{RESET}", step.name)
            }
        }
    }
}

/// Catalog stand-in for commands that never reach the portal.
struct OfflineCatalog;

impl CatalogClient for OfflineCatalog {
    fn search(&self, _query: &SearchQuery) -> Result<SearchOutcome, BidsError> {
        Err(BidsError::CatalogHttp("catalog is not used by this command".to_string()))
    }

    fn download(
        &self,
        _record: &DatasetRecord,
        _file_type: FileType,
        _destination_dir: &Path,
    ) -> Result<PathBuf, BidsError> {
        Err(BidsError::CatalogHttp("catalog is not used by this command".to_string()))
    }
}
