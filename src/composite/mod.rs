//! Composite Activities
//!
//! A [`CompositeActivity`] owns an ordered list of child activities and runs
//! them sequentially or in parallel inside a single `execute` call. Its own
//! terminal status is derived from its children's.

mod scheduler;
mod workflow;


pub use scheduler::{RunOutcome, aggregate, drive};
pub use workflow::IntegratedModel;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::activity::{Activity, ActivityStatus, Lifecycle, StatusListener, StepOutcome};
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    #[default]
    Sequential,
    Parallel,
}

impl std::fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecutionMode::Sequential => write!(f, "sequential"),
            ExecutionMode::Parallel => write!(f, "parallel"),
        }
    }
}

/// What a parallel composite does with running siblings when a child fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ParallelFailurePolicy {
    /// Siblings run to their own terminal status before aggregation.
    #[default]
    LetSiblingsFinish,
    /// Siblings are cancelled and stop at their next step boundary.
    CancelSiblings,
}

pub struct CompositeActivity {
    lifecycle: Lifecycle,

    mode: ExecutionMode,

    policy: ParallelFailurePolicy,

    activities: Vec<Box<dyn Activity>>,
}

impl CompositeActivity {
    pub fn new(name: impl Into<String>, mode: ExecutionMode) -> Self {
        Self {
            lifecycle: Lifecycle::new(name),
            mode,
            policy: ParallelFailurePolicy::default(),
            activities: Vec::new(),
        }
    }

    pub fn sequential(name: impl Into<String>) -> Self {
        Self::new(name, ExecutionMode::Sequential)
    }

    pub fn parallel(name: impl Into<String>) -> Self {
        Self::new(name, ExecutionMode::Parallel)
    }

    pub fn with_policy(mut self, policy: ParallelFailurePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_activity(mut self, activity: impl Activity + 'static) -> Result<Self> {
        self.add_activity(Box::new(activity))?;
        Ok(self)
    }

    pub fn mode(&self) -> ExecutionMode {
        self.mode
    }

    pub fn policy(&self) -> ParallelFailurePolicy {
        self.policy
    }

    pub fn set_policy(&mut self, policy: ParallelFailurePolicy) {
        self.policy = policy;
    }

    pub fn activities(&self) -> &[Box<dyn Activity>] {
        &self.activities
    }

    pub fn activity(&self, name: &str) -> Option<&dyn Activity> {
        self.activities
            .iter()
            .find(|a| a.name() == name)
            .map(|a| a.as_ref())
    }

    pub fn len(&self) -> usize {
        self.activities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.activities.is_empty()
    }

    pub fn add_activity(&mut self, mut activity: Box<dyn Activity>) -> Result<()> {
        self.ensure_idle()?;

        let token = self.lifecycle.cancel_token();
        activity.lifecycle_mut().attach(self.lifecycle.name(), &token);
        for listener in self.lifecycle.listeners().to_vec() {
            activity.subscribe(listener);
        }
        self.activities.push(activity);
        Ok(())
    }

    pub fn remove_activity(&mut self, name: &str) -> Result<Box<dyn Activity>> {
        self.ensure_idle()?;

        let index = self
            .activities
            .iter()
            .position(|a| a.name() == name)
            .ok_or_else(|| Error::ModelNotFound(name.to_string()))?;
        let mut activity = self.activities.remove(index);
        activity.lifecycle_mut().detach();
        Ok(activity)
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

impl Activity for CompositeActivity {
    fn lifecycle(&self) -> &Lifecycle {
        &self.lifecycle
    }

    fn lifecycle_mut(&mut self) -> &mut Lifecycle {
        &mut self.lifecycle
    }

    fn is_stepwise(&self) -> bool {
        false
    }

    fn children(&self) -> &[Box<dyn Activity>] {
        &self.activities
    }

    fn subscribe(&mut self, listener: StatusListener) {
        for activity in &mut self.activities {
            activity.subscribe(listener.clone());
        }
        self.lifecycle.subscribe(listener);
    }

    fn on_initialize(&mut self) -> Result<()> {
        for activity in &mut self.activities {
            if activity.status().is_terminal() {
                activity.reset()?;
            }
        }
        Ok(())
    }

    fn on_execute(&mut self) -> Result<StepOutcome> {
        info!(
            activity = %self.lifecycle.name(),
            mode = %self.mode,
            children = self.activities.len(),
            "running composite"
        );

        let outcomes = match self.mode {
            ExecutionMode::Sequential => scheduler::run_sequential(&mut self.activities),
            ExecutionMode::Parallel => scheduler::run_parallel(&mut self.activities, self.policy),
        };

        let status = aggregate(outcomes.iter().map(|(_, outcome)| outcome.status));
        match status {
            ActivityStatus::Cancelled => Ok(StepOutcome::Cancelled),
            ActivityStatus::Failed => {
                let (child, outcome) = outcomes
                    .into_iter()
                    .find(|(_, outcome)| outcome.status == ActivityStatus::Failed)
                    .ok_or_else(|| Error::other("failed child outcome is missing"))?;
                Err(Error::ChildFailed {
                    activity: self.lifecycle.name().to_string(),
                    child,
                    status: ActivityStatus::Failed,
                    source: outcome.error.map(Box::new),
                })
            }
            _ => Ok(StepOutcome::Done),
        }
    }

    fn on_finish(&mut self) -> Result<()> {
        Ok(())
    }

    fn on_cancel(&mut self) {
        for activity in &mut self.activities {
            if !activity.status().is_terminal() {
                let _ = activity.cancel();
            }
        }
    }

    fn on_reset(&mut self) -> Result<()> {
        let token = self.lifecycle.cancel_token();
        for activity in &mut self.activities {
            activity.lifecycle_mut().attach(self.lifecycle.name(), &token);
            activity.reset()?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for CompositeActivity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompositeActivity")
            .field("name", &self.lifecycle.name())
            .field("status", &self.lifecycle.status())
            .field("mode", &self.mode)
            .field("policy", &self.policy)
            .field(
                "activities",
                &self.activities.iter().map(|a| a.name()).collect::<Vec<_>>(),
            )
            .finish()
    }
}
