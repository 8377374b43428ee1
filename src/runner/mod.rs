//! Co-Simulation Runner
//!
//! Drives one model through a [`KernelSession`]: export the kernel
//! configuration, initialize, step until the kernel reaches its stop time,
//! finish, then collect restart files and the run log and clean up.

mod export;
mod workdir;

pub use export::{DimrConfig, DimrConfigExporter, FileExportService, FileExporter};
pub use workdir::{read_complete_stream, CleanupReport, RunWorkingDirectory, RUN_LOG_FILE_NAME};

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::TimeDelta;
use tracing::{debug, info};

use crate::activity::{Activity, ActivityStatus, Lifecycle, StepOutcome};
use crate::kernel::{KernelFactory, KernelSession, MessageSummary};
use crate::model::{ModelHandle, DIMR_RUN_LOG_TAG};
use crate::{Error, Result};

/// Removes one file from a working directory during cleanup.
pub type FileRemover = Arc<dyn Fn(&Path) -> io::Result<()> + Send + Sync>;

#[derive(Clone)]
pub struct RunnerSettings {
    /// Model export directories are resolved against this root.
    pub working_root: PathBuf,

    pub use_message_buffering: bool,

    pub message_capacity: Option<usize>,

    /// Replaces `fs::remove_file` when cleaning the working directory.
    pub remover: Option<FileRemover>,
}

impl RunnerSettings {
    fn clean(&self, workdir: &RunWorkingDirectory) -> CleanupReport {
        match &self.remover {
            Some(remove) => workdir.clean_with(|path| remove(path)),
            None => workdir.clean(),
        }
    }

    fn prepare(&self, workdir: &RunWorkingDirectory) -> Result<CleanupReport> {
        match &self.remover {
            Some(remove) => workdir.prepare_with(|path| remove(path)),
            None => workdir.prepare(),
        }
    }
}

impl Default for RunnerSettings {
    fn default() -> Self {
        Self {
            working_root: PathBuf::from("."),
            use_message_buffering: true,
            message_capacity: None,
            remover: None,
        }
    }
}

impl std::fmt::Debug for RunnerSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunnerSettings")
            .field("working_root", &self.working_root)
            .field("use_message_buffering", &self.use_message_buffering)
            .field("message_capacity", &self.message_capacity)
            .field("remover", &self.remover.is_some())
            .finish()
    }
}

pub struct CoSimulationRunner {
    lifecycle: Lifecycle,

    model: ModelHandle,

    exporters: Arc<FileExportService>,

    factory: Arc<dyn KernelFactory>,

    settings: RunnerSettings,

    session: Option<KernelSession>,

    workdir: Option<RunWorkingDirectory>,

    last_cleanup: Option<CleanupReport>,

    messages: Vec<String>,

    summary: MessageSummary,
}

impl CoSimulationRunner {
    pub fn new(
        model: ModelHandle,
        exporters: Arc<FileExportService>,
        factory: Arc<dyn KernelFactory>,
        settings: RunnerSettings,
    ) -> Self {
        let name = model.name();
        Self {
            lifecycle: Lifecycle::new(name),
            model,
            exporters,
            factory,
            settings,
            session: None,
            workdir: None,
            last_cleanup: None,
            messages: Vec::new(),
            summary: MessageSummary::default(),
        }
    }

    pub fn model(&self) -> &ModelHandle {
        &self.model
    }

    pub fn session(&self) -> Option<&KernelSession> {
        self.session.as_ref()
    }

    pub fn has_session(&self) -> bool {
        self.session.is_some()
    }

    /// Messages of the live session, or of the last one once disposed.
    pub fn messages(&self) -> Vec<String> {
        match &self.session {
            Some(session) => session.messages(),
            None => self.messages.clone(),
        }
    }

    pub fn message_summary(&self) -> MessageSummary {
        match &self.session {
            Some(session) => session.message_summary(),
            None => self.summary.clone(),
        }
    }

    pub fn working_directory(&self) -> Option<&Path> {
        self.workdir.as_ref().map(RunWorkingDirectory::path)
    }

    pub fn last_cleanup(&self) -> Option<&CleanupReport> {
        self.last_cleanup.as_ref()
    }

    /// Releases the kernel session. Safe to call at any time, repeatedly.
    pub fn dispose(&mut self) {
        if let Some(mut session) = self.session.take() {
            self.messages = session.messages();
            self.summary = session.message_summary();
            session.dispose();
            debug!(model = %self.lifecycle.name(), "runner released its kernel session");
        }
    }

    fn session_mut(&mut self) -> Result<&mut KernelSession> {
        self.session
            .as_mut()
            .ok_or_else(|| Error::KernelUnavailable("no kernel session is open".to_string()))
    }

    /// Disposes the session, leaving the working directory for diagnosis.
    fn abort(&mut self, error: Error) -> Error {
        self.dispose();
        self.store_run_log();
        error
    }

    fn store_run_log(&self) {
        if let Some(text) = self.workdir.as_ref().and_then(RunWorkingDirectory::read_run_log) {
            self.model.write().set_data_item(DIMR_RUN_LOG_TAG, text);
        }
    }

    fn check(&mut self, status: ActivityStatus, result: Result<i32>) -> Result<()> {
        match result {
            Ok(0) => Ok(()),
            Ok(code) => Err(self.abort(Error::KernelCode { status, code })),
            Err(error) => Err(self.abort(error)),
        }
    }
}

impl Activity for CoSimulationRunner {
    fn lifecycle(&self) -> &Lifecycle {
        &self.lifecycle
    }

    fn lifecycle_mut(&mut self) -> &mut Lifecycle {
        &mut self.lifecycle
    }

    fn kernel_messages(&self) -> Vec<String> {
        self.messages()
    }

    fn kernel_summary(&self) -> Option<MessageSummary> {
        Some(self.message_summary())
    }

    fn on_initialize(&mut self) -> Result<()> {
        let model = self.model.read().clone();
        model.validate().into_result()?;
        let exporter = self.exporters.find_exporter(&model)?;

        let workdir = RunWorkingDirectory::for_model(&self.settings.working_root, &model);
        let prepared = self.settings.prepare(&workdir)?;
        if !prepared.is_clean() {
            debug!(model = %model.name, failures = prepared.failures.len(), "working directory was not fully cleaned");
        }

        let config_path = workdir.path().join(exporter.config_file_name(&model));
        info!(model = %model.name, exporter = exporter.name(), path = %config_path.display(), "exporting kernel configuration");
        self.workdir = Some(workdir);
        exporter.export(&model, &config_path)?;

        let mut session = self
            .factory
            .create_new(self.settings.use_message_buffering)?
            .with_message_capacity(self.settings.message_capacity);
        session.set_reference_time(model.time.start_time());
        self.messages.clear();
        self.summary = MessageSummary::default();

        let result = session.initialize(&config_path);
        self.session = Some(session);
        self.check(ActivityStatus::Initializing, result)
    }

    fn on_execute(&mut self) -> Result<StepOutcome> {
        let step = self.model.read().time.step_seconds();
        let session = self.session_mut()?;
        let result = session.update(step);
        self.check(ActivityStatus::Executing, result)?;

        let session = self.session_mut()?;
        let remaining = match (session.stop_time(), session.current_time()) {
            (Ok(stop), Ok(current)) => stop - current,
            (Err(error), _) | (_, Err(error)) => return Err(self.abort(error)),
        };
        if remaining <= TimeDelta::zero() {
            info!(model = %self.lifecycle.name(), "kernel reached its stop time");
            Ok(StepOutcome::Done)
        } else {
            Ok(StepOutcome::Continue)
        }
    }

    fn on_finish(&mut self) -> Result<()> {
        let result = self.session_mut()?.finish();

        if let Some(workdir) = &self.workdir {
            if matches!(result, Ok(0)) {
                let input = self.model.read().restart_input.as_ref().map(|r| r.name.clone());
                let restarts: Vec<_> = workdir
                    .collect_restart_files()
                    .into_iter()
                    .filter(|file| input.as_deref() != Some(file.name.as_str()))
                    .collect();
                debug!(model = %self.lifecycle.name(), count = restarts.len(), "collected restart files");
                self.model.write().restart_outputs = restarts;
            }
            self.last_cleanup = Some(self.settings.clean(workdir));
        }
        self.store_run_log();
        self.dispose();

        match result {
            Ok(0) => Ok(()),
            Ok(code) => Err(Error::KernelCode {
                status: ActivityStatus::Finishing,
                code,
            }),
            Err(error) => Err(error),
        }
    }

    fn on_cancel(&mut self) {
        self.dispose();
        if let Some(workdir) = &self.workdir {
            self.last_cleanup = Some(self.settings.clean(workdir));
        }
        self.store_run_log();
        info!(model = %self.lifecycle.name(), "run cancelled");
    }

    fn on_reset(&mut self) -> Result<()> {
        self.dispose();
        self.workdir = None;
        self.last_cleanup = None;
        Ok(())
    }
}

impl std::fmt::Debug for CoSimulationRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoSimulationRunner")
            .field("lifecycle", &self.lifecycle)
            .field("exporters", &self.exporters)
            .field("settings", &self.settings)
            .field("session", &self.session)
            .field("workdir", &self.workdir)
            .finish()
    }
}
