use tracing::info;

use super::CompositeActivity;
use crate::activity::{
    Activity, ActivityStatus, CancellationToken, Lifecycle, StatusListener, StepOutcome,
};
use crate::model::ModelHandle;
use crate::time::{TimeSynchronizer, TimeWindow};
use crate::{Error, Result};

/// Top-level activity coupling several models under one time window.
///
/// Holds a fixed set of named workflows; the current one is driven when the
/// integrated model runs. The integrated model's status follows the
/// workflow's.
pub struct IntegratedModel {
    lifecycle: Lifecycle,

    time: TimeSynchronizer,

    workflows: Vec<CompositeActivity>,

    current: Option<usize>,
}

impl IntegratedModel {
    pub fn new(name: impl Into<String>, window: TimeWindow) -> Self {
        Self {
            lifecycle: Lifecycle::new(name),
            time: TimeSynchronizer::new(window),
            workflows: Vec::new(),
            current: None,
        }
    }

    pub fn time(&self) -> &TimeSynchronizer {
        &self.time
    }

    /// Time edits are only allowed while the model is not running.
    pub fn time_mut(&mut self) -> Result<&mut TimeSynchronizer> {
        self.ensure_idle()?;
        Ok(&mut self.time)
    }

    pub fn models(&self) -> &[ModelHandle] {
        self.time.children()
    }

    pub fn model(&self, name: &str) -> Option<&ModelHandle> {
        self.time.child(name)
    }

    pub fn add_model(&mut self, model: ModelHandle) -> Result<()> {
        self.ensure_idle()?;
        let name = model.name();
        if self.time.child(&name).is_some() {
            return Err(Error::DuplicateModel(name));
        }
        self.time.add_child(model);
        Ok(())
    }

    pub fn add_workflow(&mut self, mut workflow: CompositeActivity) -> Result<()> {
        self.ensure_idle()?;
        if self.workflow(workflow.name()).is_some() {
            return Err(Error::invalid_config(format!(
                "workflow '{}' is defined twice",
                workflow.name()
            )));
        }

        let token = self.lifecycle.cancel_token();
        workflow.lifecycle_mut().attach(self.lifecycle.name(), &token);
        for listener in self.lifecycle.listeners().to_vec() {
            workflow.subscribe(listener);
        }
        self.workflows.push(workflow);
        if self.current.is_none() {
            self.current = Some(self.workflows.len() - 1);
        }
        Ok(())
    }

    pub fn workflows(&self) -> &[CompositeActivity] {
        &self.workflows
    }

    pub fn workflow(&self, name: &str) -> Option<&CompositeActivity> {
        self.workflows.iter().find(|w| w.name() == name)
    }

    pub fn current_workflow(&self) -> Option<&CompositeActivity> {
        self.current.map(|index| &self.workflows[index])
    }

    /// Re-points the workflow the next run drives. No child status changes.
    pub fn select_workflow(&mut self, name: &str) -> Result<()> {
        self.ensure_idle()?;
        let index = self
            .workflows
            .iter()
            .position(|w| w.name() == name)
            .ok_or_else(|| Error::WorkflowNotFound(name.to_string()))?;

        if self.current != Some(index) {
            info!(model = %self.lifecycle.name(), workflow = name, "selected workflow");
        }
        self.current = Some(index);
        Ok(())
    }

    /// A clone of the root cancel token, for cancelling a run from another
    /// thread. A reset replaces the token, so fetch it again afterwards.
    pub fn cancel_token(&self) -> CancellationToken {
        self.lifecycle.cancel_token()
    }

    fn current_mut(&mut self) -> Result<&mut CompositeActivity> {
        let name = self.lifecycle.name().to_string();
        match self.current {
            Some(index) => Ok(&mut self.workflows[index]),
            None => Err(Error::WorkflowNotFound(format!("{} has no workflows", name))),
        }
    }

    fn ensure_idle(&self) -> Result<()> {
        let status = self.lifecycle.status();
        if status.is_running() {
            return Err(Error::WorkflowLocked {
                model: self.lifecycle.name().to_string(),
                status,
            });
        }
        Ok(())
    }
}

impl Activity for IntegratedModel {
    fn lifecycle(&self) -> &Lifecycle {
        &self.lifecycle
    }

    fn lifecycle_mut(&mut self) -> &mut Lifecycle {
        &mut self.lifecycle
    }

    fn is_stepwise(&self) -> bool {
        false
    }

    fn subscribe(&mut self, listener: StatusListener) {
        for workflow in &mut self.workflows {
            workflow.subscribe(listener.clone());
        }
        self.lifecycle.subscribe(listener);
    }

    fn on_initialize(&mut self) -> Result<()> {
        let errors = self.time.window().validate();
        if !errors.is_empty() {
            return Err(Error::Validation {
                subject: self.lifecycle.name().to_string(),
                reasons: errors
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join("; "),
            });
        }

        let workflow = self.current_mut()?;
        if workflow.status().is_terminal() {
            workflow.reset()?;
        }
        workflow.initialize()
    }

    fn on_execute(&mut self) -> Result<StepOutcome> {
        let workflow = self.current_mut()?;
        match workflow.execute()? {
            ActivityStatus::Executed => Ok(StepOutcome::Done),
            ActivityStatus::Cancelled => Ok(StepOutcome::Cancelled),
            _ => Ok(StepOutcome::Continue),
        }
    }

    fn on_finish(&mut self) -> Result<()> {
        self.current_mut()?.finish()
    }

    fn on_cancel(&mut self) {
        if let Ok(workflow) = self.current_mut() {
            if !workflow.status().is_terminal() {
                let _ = workflow.cancel();
            }
        }
    }

    fn on_reset(&mut self) -> Result<()> {
        let token = self.lifecycle.cancel_token();
        for workflow in &mut self.workflows {
            workflow.lifecycle_mut().attach(self.lifecycle.name(), &token);
            workflow.reset()?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for IntegratedModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IntegratedModel")
            .field("lifecycle", &self.lifecycle)
            .field("time", &self.time)
            .field("workflows", &self.workflows)
            .field("current", &self.current_workflow().map(|w| w.name()))
            .finish()
    }
}
