use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};

use sortie::commands::doctor::DoctorArgs;
use sortie::commands::init::InitArgs;
use sortie::commands::missions::{EventsArgs, ListArgs, StatusArgs};
use sortie::commands::run::{RetryArgs, RunArgs};
use sortie::commands::validate::ValidateArgs;
use sortie::commands::{self, load_config};
use sortie::{error, telemetry};

#[derive(Debug, Parser)]
#[command(
    name = "sortie",
    version,
    about = "Draft, validate, sandbox, self-heal and publish build missions"
)]
struct Cli {
    /// Path to sortie.toml (default: ./sortie.toml if present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Submit a mission and follow it to a terminal state
    Run(RunArgs),
    /// Show a mission snapshot
    Status(StatusArgs),
    /// Show a mission's evidence trail
    Events(EventsArgs),
    /// List recent missions, newest first
    List(ListArgs),
    /// Start a new mission from a FAILED one
    Retry(RetryArgs),
    /// Check a plan file against the policy gate without running it
    Validate(ValidateArgs),
    /// Write a sortie.toml with defaults
    Init(InitArgs),
    /// Validate config and companion tools
    Doctor(DoctorArgs),
    /// Print the JSON Schema for sortie.toml
    Schema,
}

impl Commands {
    const fn name(&self) -> &'static str {
        match self {
            Self::Run(_) => "run",
            Self::Status(_) => "status",
            Self::Events(_) => "events",
            Self::List(_) => "list",
            Self::Retry(_) => "retry",
            Self::Validate(_) => "validate",
            Self::Init(_) => "init",
            Self::Doctor(_) => "doctor",
            Self::Schema => "schema",
        }
    }
}

async fn dispatch(cli: Cli) -> anyhow::Result<()> {
    let explicit = cli.config.as_deref();
    match cli.command {
        Commands::Init(args) => args.execute(),
        Commands::Schema => commands::schema::run_schema(),
        Commands::Run(args) => args.execute(&load_config(explicit)?).await,
        Commands::Status(args) => args.execute(&load_config(explicit)?).await,
        Commands::Events(args) => args.execute(&load_config(explicit)?).await,
        Commands::List(args) => args.execute(&load_config(explicit)?).await,
        Commands::Retry(args) => args.execute(&load_config(explicit)?).await,
        Commands::Validate(args) => args.execute(&load_config(explicit)?),
        Commands::Doctor(args) => args.execute(explicit, &load_config(explicit)?).await,
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    telemetry::init();

    let cli = Cli::parse();

    let span = tracing::info_span!("command", name = cli.command.name());
    let result = tracing::Instrument::instrument(dispatch(cli), span).await;

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            if let Some(exit_err) = e.downcast_ref::<error::ExitError>() {
                eprintln!("error: {exit_err}");
                exit_err.exit_code()
            } else {
                eprintln!("error: {e:#}");
                ExitCode::FAILURE
            }
        }
    }
}
