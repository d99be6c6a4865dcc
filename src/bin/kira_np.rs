use std::process::ExitCode;

use camino::Utf8PathBuf;
use clap::{Args, Parser, Subcommand};
use miette::IntoDiagnostic;
use tracing_subscriber::EnvFilter;

use kira_netpharm::app::{App, ProgressSink, RunOptions};
use kira_netpharm::config::{ConfigLoader, parse_assignment, parse_override};
use kira_netpharm::error::KiraError;
use kira_netpharm::output::{JsonOutput, StderrProgress};

#[derive(Parser)]
#[command(name = "kira-np")]
#[command(about = "Config-driven network pharmacology pipelines over interchangeable data sources")]
#[command(version, author)]
struct Cli {
    /// Path to the configuration document (default: ./kira-np.json).
    #[arg(long, global = true)]
    config: Option<String>,

    /// Suppress progress lines on stderr.
    #[arg(long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Run the configured pipeline")]
    Run(RunArgs),
    #[command(about = "Resolve the configuration and plan the pipeline without running it")]
    Validate(RunArgs),
    #[command(about = "Manage the result cache")]
    Cache(CacheArgs),
    #[command(about = "List registered strategies per step in preference order")]
    Strategies,
}

#[derive(Args, Clone)]
struct RunArgs {
    /// Global input, NAME=VALUE. Repeat to pass several identifiers.
    #[arg(long = "input", value_name = "NAME=VALUE")]
    inputs: Vec<String>,

    /// Step option override, STEP.OPTION=VALUE.
    #[arg(long = "set", value_name = "STEP.OPTION=VALUE")]
    overrides: Vec<String>,

    /// Comma separated subset of steps to run, in order.
    #[arg(long, value_delimiter = ',')]
    steps: Option<Vec<String>>,

    #[arg(long)]
    no_cache: bool,

    /// Write `{step}.tsv` tables and `manifest.json` into this directory.
    #[arg(long)]
    out: Option<Utf8PathBuf>,
}

#[derive(Args)]
struct CacheArgs {
    #[command(subcommand)]
    command: CacheCommand,
}

#[derive(Subcommand)]
enum CacheCommand {
    #[command(about = "Invalidate cached results for one step or everything")]
    Clear {
        #[arg(long)]
        step: Option<String>,
    },
}

fn main() -> ExitCode {
    if let Err(report) = run() {
        eprintln!("{report:?}");
        if let Some(kira) = report.downcast_ref::<KiraError>() {
            return ExitCode::from(map_exit_code(kira));
        }
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

fn map_exit_code(error: &KiraError) -> u8 {
    match error {
        KiraError::MissingConfig
        | KiraError::ConfigRead(_)
        | KiraError::ConfigParse(_)
        | KiraError::InvalidConfig(_)
        | KiraError::InvalidName { .. }
        | KiraError::UnknownStep(_)
        | KiraError::UndefinedStep(_)
        | KiraError::UnknownStrategy { .. }
        | KiraError::DuplicateStep(_)
        | KiraError::InvalidDependency { .. }
        | KiraError::MissingInput { .. } => 2,
        KiraError::PipelineAborted { .. }
        | KiraError::AllStrategiesFailed { .. }
        | KiraError::StepFailed { .. }
        | KiraError::SourceConfig { .. } => 3,
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
    let sink: &dyn ProgressSink = if cli.quiet {
        &JsonOutput
    } else {
        &StderrProgress
    };

    match cli.command {
        Commands::Run(args) => {
            let app = load_app(cli.config.as_deref(), args.no_cache)?;
            let result = app.run(&run_options(&args)?, sink)?;
            JsonOutput::print_run(&result).into_diagnostic()?;
        }
        Commands::Validate(args) => {
            let app = load_app(cli.config.as_deref(), args.no_cache)?;
            let result = app.validate(&run_options(&args)?, sink)?;
            JsonOutput::print_validate(&result).into_diagnostic()?;
        }
        Commands::Cache(CacheArgs {
            command: CacheCommand::Clear { step },
        }) => {
            let app = load_app(cli.config.as_deref(), false)?;
            let result = app.clear_cache(step.as_deref(), sink)?;
            JsonOutput::print_clear(&result).into_diagnostic()?;
        }
        Commands::Strategies => {
            let app = load_app(cli.config.as_deref(), true)?;
            JsonOutput::print_strategies(&app.strategies()).into_diagnostic()?;
        }
    }
    Ok(())
}

fn load_app(config: Option<&str>, no_cache: bool) -> Result<App, KiraError> {
    let resolved = ConfigLoader::resolve(config)?;
    App::from_config(resolved, no_cache)
}

fn run_options(args: &RunArgs) -> Result<RunOptions, KiraError> {
    Ok(RunOptions {
        steps: args.steps.clone(),
        inputs: args
            .inputs
            .iter()
            .map(|raw| parse_assignment(raw))
            .collect::<Result<_, _>>()?,
        overrides: args
            .overrides
            .iter()
            .map(|raw| parse_override(raw))
            .collect::<Result<_, _>>()?,
        out: args.out.clone(),
    })
}
