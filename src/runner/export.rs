//! Kernel configuration export.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;
use std::sync::Arc;

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::workdir::RUN_LOG_FILE_NAME;
use crate::model::ModelDefinition;
use crate::{Error, Result};

/// Writes the configuration a kernel loads for one model.
pub trait FileExporter: Send + Sync {
    fn name(&self) -> &str;

    fn supports(&self, model: &ModelDefinition) -> bool;

    /// File name of the artifact passed to the kernel's `initialize`.
    fn config_file_name(&self, model: &ModelDefinition) -> String;

    fn export(&self, model: &ModelDefinition, path: &Path) -> Result<()>;
}

/// The registered exporters. Lookups require exactly one match per model.
#[derive(Default, Clone)]
pub struct FileExportService {
    exporters: Vec<Arc<dyn FileExporter>>,
}

impl FileExportService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_exporter(mut self, exporter: impl FileExporter + 'static) -> Self {
        self.register(Arc::new(exporter));
        self
    }

    pub fn register(&mut self, exporter: Arc<dyn FileExporter>) {
        self.exporters.push(exporter);
    }

    pub fn exporters_for(&self, model: &ModelDefinition) -> Vec<Arc<dyn FileExporter>> {
        self.exporters
            .iter()
            .filter(|exporter| exporter.supports(model))
            .cloned()
            .collect()
    }

    pub fn find_exporter(&self, model: &ModelDefinition) -> Result<Arc<dyn FileExporter>> {
        let mut matches = self.exporters_for(model);
        match matches.len() {
            0 => Err(Error::NoExporter {
                model: model.name.clone(),
                kind: model.kind.clone(),
            }),
            1 => Ok(matches.remove(0)),
            _ => Err(Error::AmbiguousExporter {
                model: model.name.clone(),
                exporters: matches
                    .iter()
                    .map(|e| e.name().to_string())
                    .collect::<Vec<_>>()
                    .join(", "),
            }),
        }
    }
}

impl std::fmt::Debug for FileExportService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.exporters.iter().map(|e| e.name()))
            .finish()
    }
}

/// The document read by [`ClockKernel`](crate::kernel::ClockKernel).
///
/// Times are seconds relative to `reference_time`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DimrConfig {
    pub model: String,
    pub kind: String,
    pub reference_time: NaiveDateTime,
    pub start_time: f64,
    pub stop_time: f64,
    pub time_step: f64,
    pub log_file: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restart_input: Option<String>,
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
}

impl DimrConfig {
    pub fn from_model(model: &ModelDefinition) -> Self {
        Self {
            model: model.name.clone(),
            kind: model.kind.clone(),
            reference_time: model.time.start_time(),
            start_time: 0.0,
            stop_time: model.time.duration().num_milliseconds() as f64 / 1000.0,
            time_step: model.time.step_seconds(),
            log_file: RUN_LOG_FILE_NAME.to_string(),
            restart_input: model.restart_input.as_ref().map(|r| r.name.clone()),
            properties: model.properties.clone(),
        }
    }
}

/// Exports a [`DimrConfig`] as `dimr.json`, plus the restart input if any.
#[derive(Debug, Clone, Default)]
pub struct DimrConfigExporter {
    kinds: BTreeSet<String>,
}

impl DimrConfigExporter {
    pub const FILE_NAME: &'static str = "dimr.json";

    /// Supports every model kind.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn for_kinds<I, S>(kinds: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            kinds: kinds.into_iter().map(Into::into).collect(),
        }
    }
}

impl FileExporter for DimrConfigExporter {
    fn name(&self) -> &str {
        "dimr-config"
    }

    fn supports(&self, model: &ModelDefinition) -> bool {
        self.kinds.is_empty() || self.kinds.contains(&model.kind)
    }

    fn config_file_name(&self, _model: &ModelDefinition) -> String {
        Self::FILE_NAME.to_string()
    }

    fn export(&self, model: &ModelDefinition, path: &Path) -> Result<()> {
        let failed = |reason: String| Error::ExportFailed {
            model: model.name.clone(),
            path: path.to_path_buf(),
            reason,
        };

        let directory = path.parent().unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(directory).map_err(|e| failed(e.to_string()))?;

        if let Some(restart) = &model.restart_input {
            fs::write(directory.join(&restart.name), &restart.content)
                .map_err(|e| failed(e.to_string()))?;
        }

        let config = DimrConfig::from_model(model);
        let text = serde_json::to_string_pretty(&config)
            .map_err(|e| Error::Serialization(e.to_string()))?;
        fs::write(path, text).map_err(|e| failed(e.to_string()))?;

        debug!(model = %model.name, path = %path.display(), "exported kernel configuration");
        Ok(())
    }
}
