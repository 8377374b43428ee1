//! Model Definitions
//!
//! The data a kernel-backed model hands to its runner: time window, export
//! location, cleanup exceptions, kernel properties, restart artifacts and
//! tagged text slots.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use indexmap::IndexMap;
use serde::Serialize;

use crate::time::TimeWindow;
use crate::{Error, Result};

/// Data item tag holding the kernel's redirected run log after a run.
pub const DIMR_RUN_LOG_TAG: &str = "DimrRunLog";

/// An opaque artifact produced by a finished run.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct RestartFile {
    pub name: String,
    pub content: Vec<u8>,
}

impl RestartFile {
    pub fn new(name: impl Into<String>, content: impl Into<Vec<u8>>) -> Self {
        Self {
            name: name.into(),
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ValidationReport {
    pub subject: String,
    pub issues: Vec<String>,
}

impl ValidationReport {
    pub fn new(subject: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            issues: Vec::new(),
        }
    }

    pub fn push(&mut self, issue: impl Into<String>) {
        self.issues.push(issue.into());
    }

    pub fn is_valid(&self) -> bool {
        self.issues.is_empty()
    }

    pub fn into_result(self) -> Result<()> {
        if self.is_valid() {
            Ok(())
        } else {
            Err(Error::Validation {
                subject: self.subject,
                reasons: self.issues.join("; "),
            })
        }
    }
}

#[derive(Debug, Clone)]
pub struct ModelDefinition {
    pub name: String,

    /// Matched against registered exporters.
    pub kind: String,

    pub time: TimeWindow,

    pub export_directory: PathBuf,

    /// Paths, relative to the working directory, kept by cleanup.
    pub ignored_paths: BTreeSet<PathBuf>,

    pub properties: BTreeMap<String, String>,

    pub restart_input: Option<RestartFile>,

    pub restart_outputs: Vec<RestartFile>,

    data_items: IndexMap<String, String>,
}

impl ModelDefinition {
    pub fn new(name: impl Into<String>, kind: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            export_directory: PathBuf::from(&name),
            name,
            kind: kind.into(),
            time: TimeWindow::default(),
            ignored_paths: BTreeSet::new(),
            properties: BTreeMap::new(),
            restart_input: None,
            restart_outputs: Vec::new(),
            data_items: IndexMap::new(),
        }
    }

    pub fn with_time(mut self, time: TimeWindow) -> Self {
        self.time = time;
        self
    }

    pub fn with_export_directory(mut self, path: impl Into<PathBuf>) -> Self {
        self.export_directory = path.into();
        self
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    pub fn ignore(&mut self, path: impl AsRef<Path>) {
        self.ignored_paths.insert(path.as_ref().to_path_buf());
    }

    pub fn data_item(&self, tag: &str) -> Option<&str> {
        self.data_items.get(tag).map(String::as_str)
    }

    pub fn set_data_item(&mut self, tag: impl Into<String>, text: impl Into<String>) {
        self.data_items.insert(tag.into(), text.into());
    }

    pub fn data_items(&self) -> impl Iterator<Item = (&str, &str)> {
        self.data_items.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn run_log(&self) -> Option<&str> {
        self.data_item(DIMR_RUN_LOG_TAG)
    }

    pub fn validate(&self) -> ValidationReport {
        let mut report = ValidationReport::new(&self.name);
        if self.name.trim().is_empty() {
            report.push("model name is empty");
        }
        if self.kind.trim().is_empty() {
            report.push("model kind is empty");
        }
        for error in self.time.validate() {
            report.push(error.to_string());
        }
        report
    }

    /// Promotes the last restart output to the next run's restart input.
    pub fn use_last_restart(&mut self) -> bool {
        match self.restart_outputs.last() {
            Some(last) => {
                self.restart_input = Some(last.clone());
                true
            }
            None => false,
        }
    }
}

/// Shared handle to a model, held by the runner and the time synchronizer.
#[derive(Debug, Clone)]
pub struct ModelHandle(Arc<RwLock<ModelDefinition>>);

impl ModelHandle {
    pub fn new(model: ModelDefinition) -> Self {
        Self(Arc::new(RwLock::new(model)))
    }

    pub fn read(&self) -> RwLockReadGuard<'_, ModelDefinition> {
        self.0.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, ModelDefinition> {
        self.0.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn name(&self) -> String {
        self.read().name.clone()
    }

    pub fn ptr_eq(&self, other: &ModelHandle) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl From<ModelDefinition> for ModelHandle {
    fn from(model: ModelDefinition) -> Self {
        Self::new(model)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;

    #[test]
    fn validate_collects_every_issue() {
        let start = chrono::NaiveDateTime::default();
        let model = ModelDefinition::new("", "flow")
            .with_time(TimeWindow::new(start, start, TimeDelta::zero()));

        let report = model.validate();
        assert_eq!(report.issues.len(), 3);

        let err = report.into_result().unwrap_err();
        assert_eq!(err.exit_code(), 60);
    }

    #[test]
    fn use_last_restart_picks_latest_output() {
        let mut model = ModelDefinition::new("flow", "flow");
        assert!(!model.use_last_restart());

        model.restart_outputs = vec![
            RestartFile::new("flow_20240101_rst.nc", "a"),
            RestartFile::new("flow_20240102_rst.nc", "b"),
        ];
        assert!(model.use_last_restart());
        assert_eq!(
            model.restart_input.as_ref().map(|r| r.name.as_str()),
            Some("flow_20240102_rst.nc")
        );
    }

    #[test]
    fn data_items_keep_insertion_order() {
        let mut model = ModelDefinition::new("rr", "rainfall-runoff");
        model.set_data_item("Summary", "ok");
        model.set_data_item(DIMR_RUN_LOG_TAG, "line 1\nline 2");

        let tags: Vec<_> = model.data_items().map(|(tag, _)| tag).collect();
        assert_eq!(tags, vec!["Summary", DIMR_RUN_LOG_TAG]);
        assert_eq!(model.run_log(), Some("line 1\nline 2"));
    }
}
