use std::panic::{self, AssertUnwindSafe};
use std::thread;

use tracing::{debug, error, warn};

use super::ParallelFailurePolicy;
use crate::activity::{Activity, ActivityStatus, CancellationToken};
use crate::kernel::panic_message;
use crate::Error;

/// Terminal status of one driven activity.
#[derive(Debug)]
pub struct RunOutcome {
    pub status: ActivityStatus,
    pub error: Option<Error>,
}

impl RunOutcome {
    fn of(activity: &dyn Activity, error: Option<Error>) -> Self {
        Self {
            status: activity.status(),
            error,
        }
    }
}

/// Drives `activity` through initialize, execute until done, and finish.
///
/// The cancel token is checked before initialization and before every step.
pub fn drive(activity: &mut dyn Activity) -> RunOutcome {
    let token = activity.lifecycle().cancel_token();

    if token.is_cancelled() {
        return cancelled(activity);
    }
    if let Err(error) = activity.initialize() {
        return RunOutcome::of(activity, Some(error));
    }

    loop {
        match activity.execute() {
            Ok(ActivityStatus::Executed) => break,
            Ok(ActivityStatus::Cancelled) => return RunOutcome::of(activity, None),
            Ok(_) => {}
            Err(error) => return RunOutcome::of(activity, Some(error)),
        }
    }

    if token.is_cancelled() {
        return cancelled(activity);
    }
    match activity.finish() {
        Ok(()) => RunOutcome::of(activity, None),
        Err(error) => RunOutcome::of(activity, Some(error)),
    }
}

fn cancelled(activity: &mut dyn Activity) -> RunOutcome {
    let error = activity.cancel().err();
    RunOutcome::of(activity, error)
}

/// Failed wins over Cancelled, which wins over Finished.
pub fn aggregate(statuses: impl IntoIterator<Item = ActivityStatus>) -> ActivityStatus {
    let mut result = ActivityStatus::Finished;
    for status in statuses {
        match status {
            ActivityStatus::Failed => return ActivityStatus::Failed,
            ActivityStatus::Cancelled => result = ActivityStatus::Cancelled,
            _ => {}
        }
    }
    result
}

/// [`drive`], with a panic turned into a failure of the activity itself.
fn drive_contained(activity: &mut dyn Activity) -> RunOutcome {
    match panic::catch_unwind(AssertUnwindSafe(|| drive(&mut *activity))) {
        Ok(outcome) => outcome,
        Err(payload) => {
            let error = Error::KernelFault {
                operation: "execute".to_string(),
                reason: format!(
                    "activity '{}' panicked: {}",
                    activity.name(),
                    panic_message(payload.as_ref())
                ),
            };
            error!(activity = %activity.name(), error = %error, "activity panicked");
            activity.lifecycle_mut().fail(&error);
            RunOutcome::of(activity, Some(error))
        }
    }
}

/// Runs children in order, stopping after the first that fails or is cancelled.
pub(super) fn run_sequential(activities: &mut [Box<dyn Activity>]) -> Vec<(String, RunOutcome)> {
    let mut outcomes = Vec::with_capacity(activities.len());
    for activity in activities.iter_mut() {
        let outcome = drive_contained(activity.as_mut());
        let stop = matches!(outcome.status, ActivityStatus::Failed | ActivityStatus::Cancelled);
        debug!(activity = %activity.name(), status = %outcome.status, "child reached terminal status");
        outcomes.push((activity.name().to_string(), outcome));
        if stop {
            break;
        }
    }
    outcomes
}

/// Runs every child on its own thread and waits for all of them.
pub(super) fn run_parallel(
    activities: &mut [Box<dyn Activity>],
    policy: ParallelFailurePolicy,
) -> Vec<(String, RunOutcome)> {
    let tokens: Vec<CancellationToken> = activities
        .iter()
        .map(|a| a.lifecycle().cancel_token())
        .collect();
    let tokens = &tokens;

    thread::scope(|scope| {
        let handles: Vec<_> = activities
            .iter_mut()
            .enumerate()
            .map(|(index, activity)| {
                let name = activity.name().to_string();
                let handle = scope.spawn(move || {
                    let outcome = drive_contained(activity.as_mut());
                    if outcome.status == ActivityStatus::Failed
                        && policy == ParallelFailurePolicy::CancelSiblings
                    {
                        warn!(activity = %activity.name(), "cancelling siblings after failure");
                        tokens
                            .iter()
                            .enumerate()
                            .filter(|(sibling, _)| *sibling != index)
                            .for_each(|(_, token)| token.cancel());
                    }
                    outcome
                });
                (name, handle)
            })
            .collect();

        handles
            .into_iter()
            .map(|(name, handle)| {
                let outcome = handle.join().unwrap_or_else(|payload| RunOutcome {
                    status: ActivityStatus::Failed,
                    error: Some(Error::KernelFault {
                        operation: "execute".to_string(),
                        reason: format!(
                            "activity '{}' panicked: {}",
                            name,
                            panic_message(payload.as_ref())
                        ),
                    }),
                });
                (name, outcome)
            })
            .collect()
    })
}
