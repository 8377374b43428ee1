use std::path::PathBuf;

use anyhow::{Result, ensure};
use clap::{Args, Parser, Subcommand, ValueHint, builder::NonEmptyStringValueParser};

/// Options shared by every command that reads a run configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigSource {
    /// Explicit path; `None` searches for `dimr.toml` or `.dimrrc`.
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOptions {
    pub config: ConfigSource,
    pub workflow: Option<String>,
    pub work_dir: Option<PathBuf>,
    pub json: bool,
}

/// The top-level command requested by the user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Run(RunOptions),
    Check { config: ConfigSource, json: bool },
    Workflows { config: ConfigSource },
    ShowVersion,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub command: Command,
    pub verbose: bool,
}

/// Parse CLI arguments into a high-level command.
pub fn parse() -> Result<Invocation> {
    from_cli(Cli::parse())
}

fn from_cli(cli: Cli) -> Result<Invocation> {
    let verbose = cli.verbose;
    if cli.version {
        return Ok(Invocation {
            command: Command::ShowVersion,
            verbose,
        });
    }

    let command = match cli.command {
        Some(CliCommand::Run(args)) => {
            if let Some(dir) = &args.work_dir {
                ensure!(
                    !dir.as_os_str().is_empty(),
                    "--work-dir must not be empty"
                );
            }
            Command::Run(RunOptions {
                config: ConfigSource { path: args.config },
                workflow: args.workflow,
                work_dir: args.work_dir,
                json: args.json,
            })
        }
        Some(CliCommand::Check { config, json }) => Command::Check {
            config: ConfigSource { path: config },
            json,
        },
        Some(CliCommand::Workflows { config }) => Command::Workflows {
            config: ConfigSource { path: config },
        },
        None => Command::Run(RunOptions {
            config: ConfigSource::default(),
            workflow: None,
            work_dir: None,
            json: false,
        }),
    };

    Ok(Invocation { command, verbose })
}

#[derive(Parser, Debug)]
#[command(
    name = "dimr-run",
    about = "Run coupled model workflows from a dimr.toml",
    disable_help_subcommand = true,
    disable_version_flag = true
)]
struct Cli {
    /// Print version information and exit.
    #[arg(short = 'V', long = "version", action = clap::ArgAction::SetTrue)]
    version: bool,

    /// Log progress at info level (DIMR_LOG takes precedence).
    #[arg(short, long, global = true, action = clap::ArgAction::SetTrue)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<CliCommand>,
}

#[derive(Subcommand, Debug)]
enum CliCommand {
    /// Build the integrated model and drive the current workflow.
    Run(RunArgs),

    /// Validate the time windows and models without running anything.
    Check {
        #[arg(value_name = "CONFIG", value_hint = ValueHint::FilePath)]
        config: Option<PathBuf>,

        /// Print the validation reports as JSON.
        #[arg(long, action = clap::ArgAction::SetTrue)]
        json: bool,
    },

    /// List the configured workflows.
    Workflows {
        #[arg(value_name = "CONFIG", value_hint = ValueHint::FilePath)]
        config: Option<PathBuf>,
    },
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Configuration file; searched for when omitted.
    #[arg(value_name = "CONFIG", value_hint = ValueHint::FilePath)]
    config: Option<PathBuf>,

    /// Workflow to run instead of the configured one.
    #[arg(
        short,
        long,
        value_name = "NAME",
        value_parser = NonEmptyStringValueParser::new()
    )]
    workflow: Option<String>,

    /// Root directory for the per-model working directories.
    #[arg(long = "work-dir", value_name = "DIR", value_hint = ValueHint::DirPath)]
    work_dir: Option<PathBuf>,

    /// Print the run summary as JSON.
    #[arg(long, action = clap::ArgAction::SetTrue)]
    json: bool,
}
