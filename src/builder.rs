//! Builds an [`IntegratedModel`] from a [`RunConfig`].

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use tracing::debug;

use crate::composite::{CompositeActivity, ExecutionMode, IntegratedModel, ParallelFailurePolicy};
use crate::config::{ActivityConfig, DEFAULT_WORKFLOWS, ModelConfig, RunConfig};
use crate::kernel::{ClockKernelFactory, KernelFactory};
use crate::model::{ModelDefinition, ModelHandle};
use crate::runner::{CoSimulationRunner, DimrConfigExporter, FileExportService, RunnerSettings};
use crate::{Error, Result};

pub struct IntegratedModelBuilder {
    exporters: Arc<FileExportService>,
    factory: Arc<dyn KernelFactory>,
    working_root: Option<PathBuf>,
}

impl Default for IntegratedModelBuilder {
    fn default() -> Self {
        Self::new(Arc::new(ClockKernelFactory))
    }
}

impl IntegratedModelBuilder {
    /// Uses the built-in exporter for every model kind.
    pub fn new(factory: Arc<dyn KernelFactory>) -> Self {
        Self {
            exporters: Arc::new(FileExportService::new().with_exporter(DimrConfigExporter::new())),
            factory,
            working_root: None,
        }
    }

    pub fn exporters(&self) -> &Arc<FileExportService> {
        &self.exporters
    }

    pub fn with_exporters(mut self, exporters: Arc<FileExportService>) -> Self {
        self.exporters = exporters;
        self
    }

    /// Overrides the working root derived from the configuration.
    pub fn with_working_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.working_root = Some(root.into());
        self
    }

    pub fn build(&self, config: &RunConfig, config_path: &std::path::Path) -> Result<IntegratedModel> {
        let settings = RunnerSettings {
            working_root: self
                .working_root
                .clone()
                .unwrap_or_else(|| config.working_directory(config_path)),
            use_message_buffering: config.run.message_buffering,
            message_capacity: config.run.message_capacity,
            ..RunnerSettings::default()
        };

        let mut integrated = IntegratedModel::new(&config.run.name, config.time_window()?);
        let mut handles = HashMap::new();
        for model in &config.models {
            let handle = ModelHandle::new(definition(model, config)?);
            integrated.add_model(handle.clone())?;
            handles.insert(model.name.clone(), handle);
        }

        let build = Build {
            handles: &handles,
            exporters: &self.exporters,
            factory: &self.factory,
            settings: &settings,
            policy: config.run.parallel_failure_policy,
        };

        if config.workflows.is_empty() {
            let all: Vec<ActivityConfig> = config
                .models
                .iter()
                .map(|m| ActivityConfig::Model(m.name.clone()))
                .collect();
            for (name, mode) in DEFAULT_WORKFLOWS
                .iter()
                .zip([ExecutionMode::Sequential, ExecutionMode::Parallel])
            {
                integrated.add_workflow(build.composite(name, mode, None, &all)?)?;
            }
        } else {
            for workflow in &config.workflows {
                integrated.add_workflow(build.composite(
                    &workflow.name,
                    workflow.mode,
                    workflow.policy,
                    &workflow.activities,
                )?)?;
            }
        }

        if let Some(selected) = &config.run.workflow {
            integrated.select_workflow(selected)?;
        }
        debug!(
            model = %config.run.name,
            models = handles.len(),
            workflows = integrated.workflows().len(),
            "built integrated model"
        );
        Ok(integrated)
    }
}

fn definition(model: &ModelConfig, config: &RunConfig) -> Result<ModelDefinition> {
    let mut definition = ModelDefinition::new(&model.name, &model.kind)
        .with_time(model.time_window(&config.run)?);
    if let Some(dir) = &model.export_directory {
        definition.export_directory = dir.clone();
    }
    for path in &model.ignored_paths {
        definition.ignore(path);
    }
    definition.properties = model.property_strings();
    Ok(definition)
}

struct Build<'a> {
    handles: &'a HashMap<String, ModelHandle>,
    exporters: &'a Arc<FileExportService>,
    factory: &'a Arc<dyn KernelFactory>,
    settings: &'a RunnerSettings,
    policy: ParallelFailurePolicy,
}

impl Build<'_> {
    fn composite(
        &self,
        name: &str,
        mode: ExecutionMode,
        policy: Option<ParallelFailurePolicy>,
        activities: &[ActivityConfig],
    ) -> Result<CompositeActivity> {
        let mut composite =
            CompositeActivity::new(name, mode).with_policy(policy.unwrap_or(self.policy));

        for (index, activity) in activities.iter().enumerate() {
            match activity {
                ActivityConfig::Model(model) => {
                    let handle = self
                        .handles
                        .get(model)
                        .ok_or_else(|| Error::ModelNotFound(model.clone()))?;
                    composite.add_activity(Box::new(CoSimulationRunner::new(
                        handle.clone(),
                        Arc::clone(self.exporters),
                        Arc::clone(self.factory),
                        self.settings.clone(),
                    )))?;
                }
                ActivityConfig::Group {
                    name: group,
                    mode,
                    activities,
                } => {
                    let group = group
                        .clone()
                        .unwrap_or_else(|| format!("{}/{}", name, index + 1));
                    let nested = self.composite(&group, *mode, None, activities)?;
                    composite.add_activity(Box::new(nested))?;
                }
            }
        }
        Ok(composite)
    }
}
