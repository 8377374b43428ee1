use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

use chrono::{NaiveDateTime, TimeDelta};
use serde::Deserialize;

use crate::composite::{ExecutionMode, ParallelFailurePolicy};
use crate::time::{TimeWindow, from_seconds};
use crate::{Error, Result};

/// File names searched for, in order, in the current directory and its
/// ancestors.
pub const CONFIG_FILE_NAMES: [&str; 2] = ["dimr.toml", ".dimrrc"];

/// A coupled run loaded from `dimr.toml` or `.dimrrc`.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RunConfig {
    pub run: RunSection,

    #[serde(default)]
    pub models: Vec<ModelConfig>,

    #[serde(default)]
    pub workflows: Vec<WorkflowConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RunSection {
    #[serde(default = "default_name")]
    pub name: String,

    /// ISO-8601 without offset, e.g. `"2024-01-01T00:00:00"`.
    pub start_time: NaiveDateTime,

    pub stop_time: NaiveDateTime,

    /// Seconds.
    pub time_step: f64,

    #[serde(default = "default_true")]
    pub override_start_time: bool,

    #[serde(default = "default_true")]
    pub override_stop_time: bool,

    #[serde(default = "default_true")]
    pub override_time_step: bool,

    /// Relative paths resolve against the configuration file's directory.
    #[serde(default)]
    pub working_directory: Option<PathBuf>,

    #[serde(default = "default_true")]
    pub message_buffering: bool,

    #[serde(default)]
    pub message_capacity: Option<usize>,

    /// Workflow selected when the run starts.
    #[serde(default)]
    pub workflow: Option<String>,

    #[serde(default)]
    pub parallel_failure_policy: ParallelFailurePolicy,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ModelConfig {
    pub name: String,

    pub kind: String,

    #[serde(default)]
    pub start_time: Option<NaiveDateTime>,

    #[serde(default)]
    pub stop_time: Option<NaiveDateTime>,

    #[serde(default)]
    pub time_step: Option<f64>,

    #[serde(default = "default_true")]
    pub override_start_time: bool,

    #[serde(default = "default_true")]
    pub override_stop_time: bool,

    #[serde(default = "default_true")]
    pub override_time_step: bool,

    #[serde(default)]
    pub export_directory: Option<PathBuf>,

    #[serde(default)]
    pub ignored_paths: Vec<PathBuf>,

    /// Passed through to the kernel configuration as strings.
    #[serde(default)]
    pub properties: BTreeMap<String, toml::Value>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WorkflowConfig {
    pub name: String,

    #[serde(default)]
    pub mode: ExecutionMode,

    /// Overrides `run.parallel_failure_policy` for this workflow.
    #[serde(default)]
    pub policy: Option<ParallelFailurePolicy>,

    pub activities: Vec<ActivityConfig>,
}

/// A workflow entry: a model name or a nested group.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ActivityConfig {
    Model(String),
    Group {
        #[serde(default)]
        name: Option<String>,
        mode: ExecutionMode,
        activities: Vec<ActivityConfig>,
    },
}

fn default_name() -> String {
    "integrated model".to_string()
}

fn default_true() -> bool {
    true
}

impl RunConfig {
    /// Search for a config file in the current directory and ancestors.
    pub fn find_config_path() -> Option<PathBuf> {
        let cwd = std::env::current_dir().ok()?;
        for dir in cwd.ancestors() {
            for name in &CONFIG_FILE_NAMES {
                let candidate = dir.join(name);
                if candidate.is_file() {
                    return Some(candidate);
                }
            }
        }
        None
    }

    /// Loads `path`, or the discovered config file when `path` is `None`.
    pub fn resolve(path: Option<&Path>) -> Result<(PathBuf, Self)> {
        let path = match path {
            Some(path) => path.to_path_buf(),
            None => Self::find_config_path().ok_or_else(|| {
                Error::invalid_config(format!(
                    "no {} found in the current directory or its parents",
                    CONFIG_FILE_NAMES.join(" or ")
                ))
            })?,
        };
        let config = Self::load(&path)?;
        Ok((path, config))
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::invalid_config(format!("failed to read {}: {e}", path.display()))
        })?;
        let config: Self = toml::from_str(&content).map_err(|e| {
            Error::invalid_config(format!("invalid config in {}: {e}", path.display()))
        })?;
        config.check_references()?;
        Ok(config)
    }

    pub fn parse(content: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(content).map_err(|e| Error::invalid_config(e.to_string()))?;
        config.check_references()?;
        Ok(config)
    }

    pub fn time_window(&self) -> Result<TimeWindow> {
        Ok(TimeWindow::new(
            self.run.start_time,
            self.run.stop_time,
            time_step(&self.run.name, self.run.time_step)?,
        )
        .with_overrides(
            self.run.override_start_time,
            self.run.override_stop_time,
            self.run.override_time_step,
        ))
    }

    /// Working root for model export directories.
    pub fn working_directory(&self, config_path: &Path) -> PathBuf {
        let base = config_path.parent().unwrap_or_else(|| Path::new("."));
        match &self.run.working_directory {
            Some(dir) => base.join(dir),
            None => base.join("dimr_work"),
        }
    }

    fn check_references(&self) -> Result<()> {
        time_step(&self.run.name, self.run.time_step)?;
        let mut names = HashSet::new();
        for model in &self.models {
            if !names.insert(model.name.as_str()) {
                return Err(Error::DuplicateModel(model.name.clone()));
            }
            if let Some(step) = model.time_step {
                time_step(&model.name, step)?;
            }
        }

        let mut workflows = HashSet::new();
        for workflow in &self.workflows {
            if !workflows.insert(workflow.name.as_str()) {
                return Err(Error::invalid_config(format!(
                    "workflow '{}' is defined twice",
                    workflow.name
                )));
            }
            check_activities(&workflow.name, &workflow.activities, &names, &mut HashSet::new())?;
        }

        if let Some(selected) = &self.run.workflow {
            let known = if self.workflows.is_empty() {
                DEFAULT_WORKFLOWS.contains(&selected.as_str())
            } else {
                workflows.contains(selected.as_str())
            };
            if !known {
                return Err(Error::WorkflowNotFound(selected.clone()));
            }
        }
        Ok(())
    }
}

/// Generated when a configuration defines no workflows.
pub const DEFAULT_WORKFLOWS: [&str; 2] = ["sequential", "parallel"];

/// Every model must exist and appear at most once in a workflow, nested
/// groups included. A runner owns its working directory exclusively.
fn check_activities<'a>(
    workflow: &str,
    activities: &'a [ActivityConfig],
    models: &HashSet<&str>,
    seen: &mut HashSet<&'a str>,
) -> Result<()> {
    for activity in activities {
        match activity {
            ActivityConfig::Model(name) => {
                if !models.contains(name.as_str()) {
                    return Err(Error::ModelNotFound(name.clone()));
                }
                if !seen.insert(name.as_str()) {
                    return Err(Error::invalid_config(format!(
                        "model '{name}' appears more than once in workflow '{workflow}'"
                    )));
                }
            }
            ActivityConfig::Group { activities, .. } => {
                check_activities(workflow, activities, models, seen)?
            }
        }
    }
    Ok(())
}

fn time_step(subject: &str, seconds: f64) -> Result<TimeDelta> {
    from_seconds(seconds).ok_or_else(|| {
        Error::invalid_config(format!(
            "time_step of '{subject}' is out of range: {seconds} seconds"
        ))
    })
}

impl ModelConfig {
    /// The model's own window; missing fields come from `run`.
    pub fn time_window(&self, run: &RunSection) -> Result<TimeWindow> {
        Ok(TimeWindow::new(
            self.start_time.unwrap_or(run.start_time),
            self.stop_time.unwrap_or(run.stop_time),
            time_step(&self.name, self.time_step.unwrap_or(run.time_step))?,
        )
        .with_overrides(
            self.override_start_time,
            self.override_stop_time,
            self.override_time_step,
        ))
    }

    pub fn property_strings(&self) -> BTreeMap<String, String> {
        self.properties
            .iter()
            .map(|(key, value)| {
                let text = match value {
                    toml::Value::String(text) => text.clone(),
                    other => other.to_string(),
                };
                (key.clone(), text)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;

    const SAMPLE: &str = r#"
[run]
name = "coupled"
start_time = "2024-01-01T00:00:00"
stop_time = "2024-01-01T06:00:00"
time_step = 600
parallel_failure_policy = "cancel-siblings"

[[models]]
name = "flow"
kind = "flow"
ignored_paths = ["locked.txt"]
properties = { fail_at_step = 3, solver = "implicit" }

[[models]]
name = "rtc"
kind = "rtc"
time_step = 60
override_time_step = false

[[workflows]]
name = "coupled"
mode = "sequential"
activities = ["rtc", { mode = "parallel", activities = ["flow"] }]
"#;

    #[test]
    fn parses_sample() {
        let config = RunConfig::parse(SAMPLE).unwrap();
        assert_eq!(config.run.name, "coupled");
        assert!(config.run.message_buffering);
        assert_eq!(
            config.run.parallel_failure_policy,
            ParallelFailurePolicy::CancelSiblings
        );

        let window = config.time_window().unwrap();
        assert_eq!(window.duration_text(), "0 days 6 hours 0 minutes 0 seconds");
        assert_eq!(window.time_step(), TimeDelta::minutes(10));

        let rtc = config.models[1].time_window(&config.run).unwrap();
        assert_eq!(rtc.time_step(), TimeDelta::minutes(1));
        assert!(!rtc.overrides(crate::time::TimeField::TimeStep));

        let properties = config.models[0].property_strings();
        assert_eq!(properties["fail_at_step"], "3");
        assert_eq!(properties["solver"], "implicit");

        assert!(matches!(
            &config.workflows[0].activities[1],
            ActivityConfig::Group { mode: ExecutionMode::Parallel, .. }
        ));
    }

    #[test]
    fn rejects_unknown_model_in_workflow() {
        let text = SAMPLE.replace(r#"activities = ["flow"]"#, r#"activities = ["wave"]"#);
        let err = RunConfig::parse(&text).unwrap_err();
        assert!(matches!(err, Error::ModelNotFound(name) if name == "wave"));
    }

    #[test]
    fn rejects_duplicate_models() {
        let text = SAMPLE.replace(
            "[[workflows]]",
            "[[models]]\nname = \"flow\"\nkind = \"flow\"\n\n[[workflows]]",
        );
        assert!(matches!(
            RunConfig::parse(&text),
            Err(Error::DuplicateModel(_))
        ));
    }

    #[test]
    fn rejects_unknown_selected_workflow() {
        let text = SAMPLE.replace("name = \"coupled\"\nstart", "name = \"coupled\"\nworkflow = \"other\"\nstart");
        assert!(matches!(
            RunConfig::parse(&text),
            Err(Error::WorkflowNotFound(name)) if name == "other"
        ));
    }

    #[test]
    fn rejects_model_listed_twice_in_one_workflow() {
        let text = SAMPLE.replace(r#"activities = ["flow"]"#, r#"activities = ["flow", "flow"]"#);
        let err = RunConfig::parse(&text).unwrap_err();
        assert_eq!(err.exit_code(), 61);
        assert!(err.to_string().contains("model 'flow' appears more than once in workflow 'coupled'"));

        let nested = SAMPLE.replace(r#"activities = ["flow"]"#, r#"activities = ["rtc"]"#);
        let err = RunConfig::parse(&nested).unwrap_err();
        assert!(err.to_string().contains("model 'rtc' appears more than once"));
    }

    #[test]
    fn same_model_in_different_workflows_is_allowed() {
        let text = format!(
            "{SAMPLE}\n[[workflows]]\nname = \"flow-only\"\nactivities = [\"flow\"]\n"
        );
        let config = RunConfig::parse(&text).unwrap();
        assert_eq!(config.workflows.len(), 2);
    }

    #[test]
    fn out_of_range_time_step_is_a_config_error() {
        let text = SAMPLE.replace("time_step = 600", "time_step = -1e300");
        let err = RunConfig::parse(&text).unwrap_err();
        assert_eq!(err.exit_code(), 61);
        assert!(err.to_string().contains("time_step of 'coupled' is out of range"));

        let text = SAMPLE.replace("time_step = 60\n", "time_step = 1e300\n");
        let err = RunConfig::parse(&text).unwrap_err();
        assert!(err.to_string().contains("'rtc'"));

        let mut config = RunConfig::parse(SAMPLE).unwrap();
        config.run.time_step = f64::INFINITY;
        assert!(config.time_window().is_err());
    }

    #[test]
    fn load_reports_path() {
        let err = RunConfig::load(Path::new("/nonexistent/dimr.toml")).unwrap_err();
        assert!(err.to_string().contains("/nonexistent/dimr.toml"));
        assert_eq!(err.exit_code(), 61);
    }

    #[test]
    fn working_directory_is_relative_to_config() {
        let config = RunConfig::parse(SAMPLE).unwrap();
        assert_eq!(
            config.working_directory(Path::new("/runs/case/dimr.toml")),
            PathBuf::from("/runs/case/dimr_work")
        );
    }
}
