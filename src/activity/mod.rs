//! Activity Lifecycle
//!
//! Every runnable unit (a kernel-backed model, a composite, the integrated
//! model) carries a [`Lifecycle`] and moves along one transition graph:
//!
//! ```text
//! NotInitialized -> Initializing -> Initialized -> Executing (loop) -> Executed
//!     -> Finishing -> Finished
//! ```
//!
//! Any non-terminal state may fail or be cancelled. `Finished`, `Failed` and
//! `Cancelled` are terminal; only [`Activity::reset`] leaves them.

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, warn};

pub use tokio_util::sync::CancellationToken;

use crate::kernel::MessageSummary;
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ActivityStatus {
    NotInitialized,

    Initializing,

    Initialized,

    Executing,

    Executed,

    Finishing,

    Finished,

    Failed,

    Cancelled,
}

impl ActivityStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ActivityStatus::Finished | ActivityStatus::Failed | ActivityStatus::Cancelled
        )
    }

    /// Between `Initializing` and `Finishing`, inclusive.
    pub fn is_running(self) -> bool {
        !self.is_terminal() && self != ActivityStatus::NotInitialized
    }

    pub fn can_transition_to(self, next: ActivityStatus) -> bool {
        use ActivityStatus::*;

        match (self, next) {
            (NotInitialized, Initializing)
            | (Initializing, Initialized)
            | (Initialized, Executing)
            | (Executing, Executing)
            | (Executing, Executed)
            | (Executed, Finishing)
            | (Finishing, Finished) => true,
            (from, Failed) | (from, Cancelled) => !from.is_terminal(),
            (from, NotInitialized) => from.is_terminal(),
            _ => false,
        }
    }
}

impl std::fmt::Display for ActivityStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ActivityStatus::NotInitialized => write!(f, "not initialized"),
            ActivityStatus::Initializing => write!(f, "initializing"),
            ActivityStatus::Initialized => write!(f, "initialized"),
            ActivityStatus::Executing => write!(f, "executing"),
            ActivityStatus::Executed => write!(f, "executed"),
            ActivityStatus::Finishing => write!(f, "finishing"),
            ActivityStatus::Finished => write!(f, "finished"),
            ActivityStatus::Failed => write!(f, "failed"),
            ActivityStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// A request made against an activity's lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Initialize,
    Execute,
    Finish,
    Cancel,
    Reset,
}

impl Operation {
    pub fn is_allowed_from(self, status: ActivityStatus) -> bool {
        use ActivityStatus::*;

        match self {
            Operation::Initialize => status == NotInitialized,
            Operation::Execute => matches!(status, Initialized | Executing),
            Operation::Finish => status == Executed,
            Operation::Cancel => !status.is_terminal(),
            Operation::Reset => status.is_terminal() || status == NotInitialized,
        }
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Operation::Initialize => write!(f, "initialize"),
            Operation::Execute => write!(f, "execute"),
            Operation::Finish => write!(f, "finish"),
            Operation::Cancel => write!(f, "cancel"),
            Operation::Reset => write!(f, "reset"),
        }
    }
}

/// Result of one call to [`Activity::on_execute`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// More steps are needed.
    Continue,
    /// The run reached its end.
    Done,
    /// The step observed a cancellation and released its resources.
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusChanged {
    pub activity: String,
    pub owner: Option<String>,
    pub old: ActivityStatus,
    pub new: ActivityStatus,
}

pub type StatusListener = Arc<dyn Fn(&StatusChanged) + Send + Sync>;

/// Status bookkeeping shared by every activity.
pub struct Lifecycle {
    name: String,

    status: ActivityStatus,

    owner: Option<String>,

    /// Token of the owning composite; `cancel` is always one of its children.
    parent: Option<CancellationToken>,

    cancel: CancellationToken,

    listeners: Vec<StatusListener>,

    failure: Option<String>,
}

impl Lifecycle {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: ActivityStatus::NotInitialized,
            owner: None,
            parent: None,
            cancel: CancellationToken::new(),
            listeners: Vec::new(),
            failure: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn status(&self) -> ActivityStatus {
        self.status
    }

    /// Name of the composite this activity belongs to, if any.
    pub fn owner(&self) -> Option<&str> {
        self.owner.as_deref()
    }

    /// Message of the error that moved this activity to `Failed`.
    pub fn failure(&self) -> Option<&str> {
        self.failure.as_deref()
    }

    /// The token observed by this run. Replaced on attach and on reset.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn subscribe(&mut self, listener: StatusListener) {
        self.listeners.push(listener);
    }

    pub fn listeners(&self) -> &[StatusListener] {
        &self.listeners
    }

    /// Rejects `operation` without touching the status when the graph forbids it.
    pub fn ensure(&self, operation: Operation) -> Result<()> {
        if operation.is_allowed_from(self.status) {
            Ok(())
        } else {
            Err(Error::InvalidTransition {
                activity: self.name.clone(),
                operation,
                status: self.status,
            })
        }
    }

    pub(crate) fn attach(&mut self, owner: &str, parent: &CancellationToken) {
        self.owner = Some(owner.to_string());
        self.cancel = parent.child_token();
        self.parent = Some(parent.clone());
    }

    pub(crate) fn detach(&mut self) {
        self.owner = None;
        self.parent = None;
        self.cancel = CancellationToken::new();
    }

    pub(crate) fn transition(&mut self, next: ActivityStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(Error::InvalidTransition {
                activity: self.name.clone(),
                operation: operation_for(next),
                status: self.status,
            });
        }

        let old = self.status;
        self.status = next;
        if old != next {
            debug!(activity = %self.name, from = %old, to = %next, "status changed");
            self.emit(StatusChanged {
                activity: self.name.clone(),
                owner: self.owner.clone(),
                old,
                new: next,
            });
        }
        Ok(())
    }

    pub(crate) fn fail(&mut self, error: &Error) {
        warn!(activity = %self.name, status = %self.status, error = %error, "activity failed");
        self.failure = Some(error.to_string());
        if !self.status.is_terminal() {
            let _ = self.transition(ActivityStatus::Failed);
        }
    }

    /// Drops the failure and hands out a fresh token under the same parent.
    pub(crate) fn clear(&mut self) {
        self.failure = None;
        self.cancel = match &self.parent {
            Some(parent) => parent.child_token(),
            None => CancellationToken::new(),
        };
    }

    fn emit(&self, event: StatusChanged) {
        for listener in &self.listeners {
            listener(&event);
        }
    }
}

impl std::fmt::Debug for Lifecycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lifecycle")
            .field("name", &self.name)
            .field("status", &self.status)
            .field("owner", &self.owner)
            .field("listeners", &self.listeners.len())
            .field("failure", &self.failure)
            .finish()
    }
}

fn operation_for(next: ActivityStatus) -> Operation {
    match next {
        ActivityStatus::Initializing | ActivityStatus::Initialized => Operation::Initialize,
        ActivityStatus::Executing | ActivityStatus::Executed => Operation::Execute,
        ActivityStatus::Finishing | ActivityStatus::Finished => Operation::Finish,
        ActivityStatus::Cancelled => Operation::Cancel,
        ActivityStatus::NotInitialized => Operation::Reset,
        ActivityStatus::Failed => Operation::Execute,
    }
}

/// A runnable unit driven through Initialize → Execute* → Finish.
///
/// Implementors provide the `on_*` hooks; the provided methods enforce the
/// transition graph so a hook is only ever invoked from a legal state.
pub trait Activity: Send {
    fn lifecycle(&self) -> &Lifecycle;

    fn lifecycle_mut(&mut self) -> &mut Lifecycle;

    fn on_initialize(&mut self) -> Result<()>;

    fn on_execute(&mut self) -> Result<StepOutcome>;

    fn on_finish(&mut self) -> Result<()>;

    /// Releases resources after a cancellation. Must not fail.
    fn on_cancel(&mut self) {}

    fn on_reset(&mut self) -> Result<()> {
        Ok(())
    }

    /// Whether `execute` is called repeatedly, one step at a time.
    ///
    /// Composites run to completion inside a single `execute`, so a second
    /// call while `Executing` is a re-entrant call and gets rejected.
    fn is_stepwise(&self) -> bool {
        true
    }

    /// Owned child activities, in scheduling order.
    fn children(&self) -> &[Box<dyn Activity>] {
        &[]
    }

    /// Kernel messages captured while running, oldest first.
    fn kernel_messages(&self) -> Vec<String> {
        Vec::new()
    }

    fn kernel_summary(&self) -> Option<MessageSummary> {
        None
    }

    fn name(&self) -> &str {
        self.lifecycle().name()
    }

    fn status(&self) -> ActivityStatus {
        self.lifecycle().status()
    }

    fn subscribe(&mut self, listener: StatusListener) {
        self.lifecycle_mut().subscribe(listener);
    }

    fn initialize(&mut self) -> Result<()> {
        self.lifecycle().ensure(Operation::Initialize)?;
        self.lifecycle_mut().transition(ActivityStatus::Initializing)?;

        match self.on_initialize() {
            Ok(()) => self.lifecycle_mut().transition(ActivityStatus::Initialized),
            Err(error) => {
                self.lifecycle_mut().fail(&error);
                Err(error)
            }
        }
    }

    /// Runs one step and returns the resulting status.
    fn execute(&mut self) -> Result<ActivityStatus> {
        self.lifecycle().ensure(Operation::Execute)?;
        if self.status() == ActivityStatus::Executing && !self.is_stepwise() {
            return Err(Error::AlreadyExecuting(self.name().to_string()));
        }

        if self.lifecycle().cancel_token().is_cancelled() {
            self.cancel()?;
            return Ok(self.status());
        }

        if self.status() == ActivityStatus::Initialized {
            self.lifecycle_mut().transition(ActivityStatus::Executing)?;
        }

        match self.on_execute() {
            Ok(StepOutcome::Continue) => {}
            Ok(StepOutcome::Done) => self.lifecycle_mut().transition(ActivityStatus::Executed)?,
            Ok(StepOutcome::Cancelled) => {
                self.lifecycle_mut().transition(ActivityStatus::Cancelled)?
            }
            Err(error) => {
                self.lifecycle_mut().fail(&error);
                return Err(error);
            }
        }
        Ok(self.status())
    }

    fn finish(&mut self) -> Result<()> {
        self.lifecycle().ensure(Operation::Finish)?;
        self.lifecycle_mut().transition(ActivityStatus::Finishing)?;

        match self.on_finish() {
            Ok(()) => self.lifecycle_mut().transition(ActivityStatus::Finished),
            Err(error) => {
                self.lifecycle_mut().fail(&error);
                Err(error)
            }
        }
    }

    fn cancel(&mut self) -> Result<()> {
        self.lifecycle().ensure(Operation::Cancel)?;
        self.lifecycle().cancel_token().cancel();
        self.on_cancel();
        self.lifecycle_mut().transition(ActivityStatus::Cancelled)
    }

    /// Returns a terminal or never-run activity to `NotInitialized`.
    ///
    /// The lifecycle gets its fresh token before `on_reset` runs, so a
    /// composite can hand its children tokens derived from the new one.
    fn reset(&mut self) -> Result<()> {
        self.lifecycle().ensure(Operation::Reset)?;
        self.lifecycle_mut().clear();
        self.on_reset()?;
        if self.status() == ActivityStatus::NotInitialized {
            return Ok(());
        }
        self.lifecycle_mut().transition(ActivityStatus::NotInitialized)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Scripted activities for scheduler tests.

    use super::*;
    use std::sync::Mutex;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum Script {
        Succeed,
        FailOnInitialize,
        FailOnExecute,
        FailOnFinish,
        CancelOnExecute,
    }

    /// Records which hooks ran, in order, across activities.
    pub type Journal = Arc<Mutex<Vec<String>>>;

    pub struct ScriptedActivity {
        lifecycle: Lifecycle,
        script: Script,
        steps: u32,
        taken: u32,
        journal: Journal,
    }

    impl ScriptedActivity {
        pub fn new(name: &str, script: Script, journal: &Journal) -> Self {
            Self {
                lifecycle: Lifecycle::new(name),
                script,
                steps: 3,
                taken: 0,
                journal: Arc::clone(journal),
            }
        }

        pub fn boxed(name: &str, script: Script, journal: &Journal) -> Box<dyn Activity> {
            Box::new(Self::new(name, script, journal))
        }

        fn record(&self, hook: &str) {
            self.journal
                .lock()
                .unwrap()
                .push(format!("{}:{}", self.lifecycle.name(), hook));
        }
    }

    impl Activity for ScriptedActivity {
        fn lifecycle(&self) -> &Lifecycle {
            &self.lifecycle
        }

        fn lifecycle_mut(&mut self) -> &mut Lifecycle {
            &mut self.lifecycle
        }

        fn on_initialize(&mut self) -> Result<()> {
            self.record("initialize");
            if self.script == Script::FailOnInitialize {
                return Err(Error::KernelCode {
                    status: ActivityStatus::Initializing,
                    code: -1,
                });
            }
            Ok(())
        }

        fn on_execute(&mut self) -> Result<StepOutcome> {
            self.record("execute");
            self.taken += 1;
            match self.script {
                Script::FailOnExecute => Err(Error::KernelCode {
                    status: ActivityStatus::Executing,
                    code: 3,
                }),
                Script::CancelOnExecute => {
                    self.on_cancel();
                    Ok(StepOutcome::Cancelled)
                }
                _ if self.taken >= self.steps => Ok(StepOutcome::Done),
                _ => Ok(StepOutcome::Continue),
            }
        }

        fn on_finish(&mut self) -> Result<()> {
            self.record("finish");
            if self.script == Script::FailOnFinish {
                return Err(Error::KernelCode {
                    status: ActivityStatus::Finishing,
                    code: 4,
                });
            }
            Ok(())
        }

        fn on_cancel(&mut self) {
            self.record("cancel");
        }

        fn on_reset(&mut self) -> Result<()> {
            self.taken = 0;
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::{Journal, Script, ScriptedActivity};
    use super::*;
    use std::sync::Mutex;

    fn journal() -> Journal {
        Arc::new(Mutex::new(Vec::new()))
    }

    #[test]
    fn test_status_display() {
        assert_eq!(ActivityStatus::NotInitialized.to_string(), "not initialized");
        assert_eq!(ActivityStatus::Executing.to_string(), "executing");
        assert_eq!(ActivityStatus::Cancelled.to_string(), "cancelled");
    }

    #[test]
    fn test_transition_table() {
        use ActivityStatus::*;

        assert!(NotInitialized.can_transition_to(Initializing));
        assert!(Executing.can_transition_to(Executing));
        assert!(Initialized.can_transition_to(Failed));
        assert!(Executing.can_transition_to(Cancelled));
        assert!(NotInitialized.can_transition_to(Cancelled));

        assert!(!NotInitialized.can_transition_to(Executing));
        assert!(!Initialized.can_transition_to(Finishing));
        assert!(!Finished.can_transition_to(Failed));
        assert!(!Cancelled.can_transition_to(Executing));
        assert!(!Executing.can_transition_to(NotInitialized));
        assert!(Failed.can_transition_to(NotInitialized));
    }

    #[test]
    fn test_execute_before_initialize_is_rejected_without_mutation() {
        let journal = journal();
        let mut activity = ScriptedActivity::new("flow", Script::Succeed, &journal);

        let err = activity.execute().unwrap_err();
        assert!(matches!(
            err,
            Error::InvalidTransition {
                operation: Operation::Execute,
                status: ActivityStatus::NotInitialized,
                ..
            }
        ));
        assert_eq!(activity.status(), ActivityStatus::NotInitialized);
        assert!(journal.lock().unwrap().is_empty());
    }

    #[test]
    fn test_finish_requires_executed() {
        let journal = journal();
        let mut activity = ScriptedActivity::new("flow", Script::Succeed, &journal);
        activity.initialize().unwrap();

        assert!(activity.finish().is_err());
        assert_eq!(activity.status(), ActivityStatus::Initialized);
        assert!(activity.initialize().is_err());
        assert_eq!(activity.status(), ActivityStatus::Initialized);
    }

    #[test]
    fn test_full_lifecycle_emits_every_transition() {
        let journal = journal();
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);

        let mut activity = ScriptedActivity::new("rtc", Script::Succeed, &journal);
        activity.subscribe(Arc::new(move |event: &StatusChanged| {
            sink.lock().unwrap().push(event.new);
        }));

        activity.initialize().unwrap();
        while activity.execute().unwrap() != ActivityStatus::Executed {}
        activity.finish().unwrap();

        use ActivityStatus::*;
        assert_eq!(
            *events.lock().unwrap(),
            vec![Initializing, Initialized, Executing, Executed, Finishing, Finished]
        );
    }

    #[test]
    fn test_failed_initialize_records_failure() {
        let journal = journal();
        let mut activity = ScriptedActivity::new("flow", Script::FailOnInitialize, &journal);

        let err = activity.initialize().unwrap_err();
        assert!(matches!(err, Error::KernelCode { code: -1, .. }));
        assert_eq!(activity.status(), ActivityStatus::Failed);
        assert_eq!(
            activity.lifecycle().failure(),
            Some("Kernel returned error code -1 while initializing")
        );
        assert!(activity.execute().is_err());
        assert!(activity.cancel().is_err());
    }

    #[test]
    fn test_cancel_from_any_non_terminal_state() {
        let journal = journal();
        let mut fresh = ScriptedActivity::new("a", Script::Succeed, &journal);
        fresh.cancel().unwrap();
        assert_eq!(fresh.status(), ActivityStatus::Cancelled);

        let mut running = ScriptedActivity::new("b", Script::Succeed, &journal);
        running.initialize().unwrap();
        running.execute().unwrap();
        running.cancel().unwrap();
        assert_eq!(running.status(), ActivityStatus::Cancelled);
        assert!(running.cancel().is_err());
    }

    #[test]
    fn test_execute_observes_cancel_token() {
        let journal = journal();
        let mut activity = ScriptedActivity::new("flow", Script::Succeed, &journal);
        activity.initialize().unwrap();

        activity.lifecycle().cancel_token().cancel();
        assert_eq!(activity.execute().unwrap(), ActivityStatus::Cancelled);
        assert_eq!(
            *journal.lock().unwrap(),
            vec!["flow:initialize".to_string(), "flow:cancel".to_string()]
        );
    }

    #[test]
    fn test_reset_after_terminal_state() {
        let journal = journal();
        let mut activity = ScriptedActivity::new("flow", Script::Succeed, &journal);
        activity.cancel().unwrap();

        activity.reset().unwrap();
        assert_eq!(activity.status(), ActivityStatus::NotInitialized);
        assert!(!activity.lifecycle().cancel_token().is_cancelled());

        activity.initialize().unwrap();
        assert!(activity.reset().is_err());
    }

    #[test]
    fn test_reset_of_never_run_activity_is_quiet() {
        let journal = journal();
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        let mut activity = ScriptedActivity::new("a", Script::Succeed, &journal);
        activity.subscribe(Arc::new(move |event: &StatusChanged| {
            sink.lock().unwrap().push(event.clone());
        }));

        activity.reset().unwrap();
        assert_eq!(activity.status(), ActivityStatus::NotInitialized);
        assert!(events.lock().unwrap().is_empty());

        activity.initialize().unwrap();
        assert_eq!(activity.status(), ActivityStatus::Initialized);
    }

    #[test]
    fn test_reset_replaces_a_cancelled_token() {
        let journal = journal();
        let parent = CancellationToken::new();
        let mut activity = ScriptedActivity::new("a", Script::Succeed, &journal);
        activity.lifecycle_mut().attach("workflow", &parent);

        let stale = activity.lifecycle().cancel_token();
        activity.cancel().unwrap();
        assert!(stale.is_cancelled());
        assert!(!parent.is_cancelled());

        activity.reset().unwrap();
        assert!(!activity.lifecycle().cancel_token().is_cancelled());

        parent.cancel();
        assert!(activity.lifecycle().cancel_token().is_cancelled());
    }
}
