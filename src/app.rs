use std::io::{self, Write};
use std::sync::Arc;

use anyhow::Result;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use crate::activity::{Activity, StatusChanged};
use crate::builder::IntegratedModelBuilder;
use crate::cli::{Command, ConfigSource, RunOptions};
use crate::composite::{IntegratedModel, drive};
use crate::config::RunConfig;
use crate::model::ValidationReport;
use crate::output::{RunReport, format_json, format_run_summary, format_validation};
use crate::version;

/// Exit code of `check` when any report has issues.
const INVALID_EXIT_CODE: i32 = 60;

/// Installs the stderr subscriber. `DIMR_LOG` overrides the default level.
pub fn init_logging(verbose: bool) {
    let default = if verbose { "info" } else { "warn" };
    let filter = EnvFilter::try_from_env("DIMR_LOG").unwrap_or_else(|_| EnvFilter::new(default));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(io::stderr)
        .try_init();
}

pub fn run(command: Command) -> Result<i32> {
    match command {
        Command::Run(options) => run_model(options),
        Command::Check { config, json } => check(&config, json),
        Command::Workflows { config } => list_workflows(&config),
        Command::ShowVersion => {
            println!("{}", version::describe());
            Ok(0)
        }
    }
}

fn load(config: &ConfigSource, builder: &IntegratedModelBuilder) -> crate::Result<IntegratedModel> {
    let (path, run_config) = RunConfig::resolve(config.path.as_deref())?;
    debug!(path = %path.display(), "loaded run configuration");
    builder.build(&run_config, &path)
}

fn run_model(options: RunOptions) -> Result<i32> {
    let mut builder = IntegratedModelBuilder::default();
    if let Some(dir) = &options.work_dir {
        builder = builder.with_working_root(dir);
    }

    let mut model = match load(&options.config, &builder) {
        Ok(model) => model,
        Err(error) => return Ok(report_error(&error, options.json)),
    };
    if let Some(workflow) = &options.workflow {
        if let Err(error) = model.select_workflow(workflow) {
            return Ok(report_error(&error, options.json));
        }
    }

    model.subscribe(Arc::new(|event: &StatusChanged| {
        info!(
            activity = %event.activity,
            owner = event.owner.as_deref().unwrap_or("-"),
            from = %event.old,
            to = %event.new,
            "status changed"
        );
    }));

    let outcome = drive(&mut model);
    let report = RunReport::new(&model, outcome.error.as_ref());

    if options.json {
        println!("{}", format_json(&report)?);
    } else {
        print!("{}", format_run_summary(&report));
        io::stdout().flush().ok();
    }

    Ok(outcome.error.as_ref().map_or(0, |e| e.exit_code()))
}

fn check(config: &ConfigSource, json: bool) -> Result<i32> {
    let builder = IntegratedModelBuilder::default();
    let model = match load(config, &builder) {
        Ok(model) => model,
        Err(error) => return Ok(report_error(&error, json)),
    };

    let mut reports = Vec::new();
    let mut integrated = ValidationReport::new(model.name());
    for reason in model.time().window().validate() {
        integrated.push(reason.to_string());
    }
    reports.push(integrated);

    for handle in model.models() {
        let definition = handle.read();
        let mut report = definition.validate();
        if let Err(error) = builder.exporters().find_exporter(&definition) {
            report.push(error.to_string());
        }
        reports.push(report);
    }

    if json {
        println!("{}", format_json(&reports)?);
    } else {
        print!("{}", format_validation(&reports));
    }

    if reports.iter().all(ValidationReport::is_valid) {
        Ok(0)
    } else {
        Ok(INVALID_EXIT_CODE)
    }
}

fn list_workflows(config: &ConfigSource) -> Result<i32> {
    let model = match load(config, &IntegratedModelBuilder::default()) {
        Ok(model) => model,
        Err(error) => return Ok(report_error(&error, false)),
    };

    let current = model.current_workflow().map(|w| w.name().to_string());
    for workflow in model.workflows() {
        let marker = if current.as_deref() == Some(workflow.name()) { "*" } else { " " };
        println!(
            "{marker} {:<20} {:<10} {} activities",
            workflow.name(),
            workflow.mode().to_string(),
            workflow.len()
        );
    }
    Ok(0)
}

fn report_error(error: &crate::Error, json: bool) -> i32 {
    if json {
        println!("{}", error.to_json());
    } else {
        eprintln!("error: {error}");
    }
    error.exit_code()
}
