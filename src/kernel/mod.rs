//! Kernel Sessions
//!
//! A co-simulation kernel is an external, stateful, stepwise engine reached
//! through the [`Kernel`] trait: `initialize`, `update` and `finish` return
//! integer result codes where zero means success. [`KernelSession`] wraps one
//! kernel instance with a reference time, message capture and idempotent
//! disposal.

mod clock;
mod messages;
#[cfg(test)]
pub(crate) mod testing;

pub use clock::{ClockKernel, ClockKernelFactory, codes};
pub use messages::{KernelMessage, MessageBuffer, MessageLevel, MessageSummary};

use std::panic::{self, AssertUnwindSafe};
use std::path::Path;

use chrono::{NaiveDateTime, TimeDelta};
use tracing::{debug, error, info, warn};

use crate::time::from_seconds;
use crate::{Error, Result};

/// First line of every session's messages.
pub const SESSION_BANNER: &str = "dimr kernel session started";

/// The native kernel contract.
///
/// Times are seconds relative to the reference time of the owning session.
/// An `Err` from any call means the kernel faulted rather than reporting a
/// result code.
pub trait Kernel: Send {
    fn initialize(&mut self, config_path: &Path) -> Result<i32>;

    /// Advances one step. A non-positive `time_step` means the kernel's own.
    fn update(&mut self, time_step: f64) -> Result<i32>;

    fn finish(&mut self) -> Result<i32>;

    /// Lines logged since the previous call.
    fn drain_messages(&mut self) -> Vec<String>;

    fn start_time(&self) -> f64;

    fn stop_time(&self) -> f64;

    fn current_time(&self) -> f64;

    fn time_step(&self) -> f64;

    fn dispose(&mut self) -> Result<()> {
        Ok(())
    }
}

pub trait KernelFactory: Send + Sync {
    fn create_kernel(&self) -> Result<Box<dyn Kernel>>;

    fn create_new(&self, use_message_buffering: bool) -> Result<KernelSession> {
        Ok(KernelSession::new(self.create_kernel()?, use_message_buffering))
    }
}

/// One running instance of a kernel.
pub struct KernelSession {
    kernel: Option<Box<dyn Kernel>>,

    reference_time: NaiveDateTime,

    use_message_buffering: bool,

    messages: MessageBuffer,

    last_result: Option<i32>,

    state: SessionState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    Created,
    Initialized,
    Finished,
}

impl KernelSession {
    pub fn new(kernel: Box<dyn Kernel>, use_message_buffering: bool) -> Self {
        Self {
            kernel: Some(kernel),
            reference_time: NaiveDateTime::default(),
            use_message_buffering,
            messages: MessageBuffer::unbounded(),
            last_result: None,
            state: SessionState::Created,
        }
    }

    pub fn with_message_capacity(mut self, capacity: Option<usize>) -> Self {
        self.messages = match capacity {
            Some(capacity) => MessageBuffer::bounded(capacity),
            None => MessageBuffer::unbounded(),
        };
        self
    }

    pub fn uses_message_buffering(&self) -> bool {
        self.use_message_buffering
    }

    pub fn reference_time(&self) -> NaiveDateTime {
        self.reference_time
    }

    pub fn set_reference_time(&mut self, reference_time: NaiveDateTime) {
        self.reference_time = reference_time;
    }

    pub fn is_initialized(&self) -> bool {
        self.state == SessionState::Initialized
    }

    pub fn is_disposed(&self) -> bool {
        self.kernel.is_none()
    }

    pub fn last_result(&self) -> Option<i32> {
        self.last_result
    }

    pub fn initialize(&mut self, config_path: &Path) -> Result<i32> {
        if self.state != SessionState::Created {
            return Err(Error::KernelFault {
                operation: "initialize".to_string(),
                reason: "session has already been initialized".to_string(),
            });
        }
        info!(config = %config_path.display(), reference = %self.reference_time, "initializing kernel");

        let code = self.call("initialize", |kernel| kernel.initialize(config_path))?;
        if code == 0 {
            self.state = SessionState::Initialized;
        }
        Ok(code)
    }

    pub fn update(&mut self, time_step: f64) -> Result<i32> {
        self.require_initialized("update")?;
        self.call("update", |kernel| kernel.update(time_step))
    }

    pub fn finish(&mut self) -> Result<i32> {
        self.require_initialized("finish")?;
        let code = self.call("finish", |kernel| kernel.finish());
        self.state = SessionState::Finished;
        code
    }

    /// With buffering, the banner followed by every retained line as
    /// `LEVEL: text`; without, the banner only.
    pub fn messages(&self) -> Vec<String> {
        let mut lines = vec![SESSION_BANNER.to_string()];
        if self.use_message_buffering {
            lines.extend(self.messages.lines());
        }
        lines
    }

    pub fn message_summary(&self) -> MessageSummary {
        self.messages.summary()
    }

    pub fn start_time(&self) -> Result<NaiveDateTime> {
        self.kernel_time("start_time", |kernel| kernel.start_time())
    }

    pub fn stop_time(&self) -> Result<NaiveDateTime> {
        self.kernel_time("stop_time", |kernel| kernel.stop_time())
    }

    pub fn current_time(&self) -> Result<NaiveDateTime> {
        self.kernel_time("current_time", |kernel| kernel.current_time())
    }

    pub fn time_step(&self) -> Result<TimeDelta> {
        match self.live_kernel() {
            Some(kernel) => {
                let seconds = kernel.time_step();
                from_seconds(seconds).ok_or_else(|| out_of_range("time_step", seconds))
            }
            None => Ok(TimeDelta::zero()),
        }
    }

    /// Releases the kernel. Safe to call repeatedly; failures are logged.
    pub fn dispose(&mut self) {
        let Some(mut kernel) = self.kernel.take() else {
            return;
        };

        match panic::catch_unwind(AssertUnwindSafe(|| kernel.dispose())) {
            Ok(Ok(())) => debug!("kernel session disposed"),
            Ok(Err(e)) => debug!(error = %e, "kernel dispose failed"),
            Err(_) => debug!("kernel panicked while disposing"),
        }
    }

    fn call(
        &mut self,
        operation: &str,
        f: impl FnOnce(&mut dyn Kernel) -> Result<i32>,
    ) -> Result<i32> {
        let kernel = self
            .kernel
            .as_deref_mut()
            .ok_or_else(|| Error::KernelUnavailable("the session has been disposed".to_string()))?;

        let result = match panic::catch_unwind(AssertUnwindSafe(|| f(&mut *kernel))) {
            Ok(result) => result,
            Err(payload) => Err(Error::KernelFault {
                operation: operation.to_string(),
                reason: panic_message(payload.as_ref()),
            }),
        };
        let lines = kernel.drain_messages();
        self.capture(lines);

        if let Ok(code) = result {
            self.last_result = Some(code);
            if code != 0 {
                warn!(operation, code, "kernel returned a non-zero result");
            }
        }
        result
    }

    fn capture(&mut self, lines: Vec<String>) {
        for line in lines {
            let message = KernelMessage::parse(&line);
            match message.level {
                MessageLevel::Error => error!(target: "dimr::kernel", "{}", message.text),
                MessageLevel::Warning => warn!(target: "dimr::kernel", "{}", message.text),
                MessageLevel::Info => info!(target: "dimr::kernel", "{}", message.text),
                MessageLevel::Debug => debug!(target: "dimr::kernel", "{}", message.text),
            }
            if self.use_message_buffering {
                self.messages.push(message);
            }
        }
    }

    fn require_initialized(&self, operation: &str) -> Result<()> {
        if self.state == SessionState::Initialized {
            Ok(())
        } else {
            Err(Error::KernelFault {
                operation: operation.to_string(),
                reason: "session is not initialized".to_string(),
            })
        }
    }

    fn live_kernel(&self) -> Option<&dyn Kernel> {
        self.kernel
            .as_deref()
            .filter(|_| self.state != SessionState::Created)
    }

    /// `reference_time` plus the kernel-relative seconds `f` reports.
    fn kernel_time(
        &self,
        operation: &str,
        f: impl FnOnce(&dyn Kernel) -> f64,
    ) -> Result<NaiveDateTime> {
        let Some(kernel) = self.live_kernel() else {
            return Ok(self.reference_time);
        };
        let seconds = f(kernel);
        from_seconds(seconds)
            .and_then(|offset| self.reference_time.checked_add_signed(offset))
            .ok_or_else(|| out_of_range(operation, seconds))
    }
}

impl Drop for KernelSession {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl std::fmt::Debug for KernelSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KernelSession")
            .field("reference_time", &self.reference_time)
            .field("use_message_buffering", &self.use_message_buffering)
            .field("messages", &self.messages.len())
            .field("last_result", &self.last_result)
            .field("state", &self.state)
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

fn out_of_range(operation: &str, seconds: f64) -> Error {
    Error::KernelFault {
        operation: operation.to_string(),
        reason: format!("kernel reported {seconds} seconds, outside the supported time range"),
    }
}

pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(text) = payload.downcast_ref::<&str>() {
        text.to_string()
    } else if let Some(text) = payload.downcast_ref::<String>() {
        text.clone()
    } else {
        "panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::testing::{KernelScript, ScriptedKernel};
    use super::*;
    use chrono::NaiveDate;

    fn reference() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 1, 1)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap()
    }

    fn session(script: KernelScript, buffering: bool) -> (KernelSession, super::testing::Calls) {
        let kernel = ScriptedKernel::new(script);
        let calls = kernel.calls();
        let mut session = KernelSession::new(Box::new(kernel), buffering);
        session.set_reference_time(reference());
        (session, calls)
    }

    #[test]
    fn times_follow_reference_until_initialized() {
        let (mut session, _) = session(KernelScript::default(), true);
        assert_eq!(session.start_time().unwrap(), reference());
        assert_eq!(session.stop_time().unwrap(), reference());
        assert_eq!(session.time_step().unwrap(), TimeDelta::zero());

        assert_eq!(session.initialize(Path::new("dimr.json")).unwrap(), 0);
        assert_eq!(
            session.stop_time().unwrap(),
            reference() + TimeDelta::seconds(3 * 60)
        );
        assert_eq!(session.time_step().unwrap(), TimeDelta::seconds(60));

        session.update(0.0).unwrap();
        assert_eq!(
            session.current_time().unwrap(),
            reference() + TimeDelta::seconds(60)
        );
    }

    #[test]
    fn out_of_range_kernel_time_is_a_fault() {
        let script = KernelScript {
            time_step: 1e300,
            ..KernelScript::default()
        };
        let (mut session, _) = session(script, false);
        session.initialize(Path::new("dimr.json")).unwrap();

        assert!(matches!(
            session.stop_time(),
            Err(Error::KernelFault { ref operation, .. }) if operation == "stop_time"
        ));
        assert!(session.time_step().is_err());
        assert_eq!(session.start_time().unwrap(), reference());
    }

    #[test]
    fn kernel_time_past_the_calendar_is_a_fault() {
        let script = KernelScript {
            // In range for a TimeDelta, but far beyond the last NaiveDateTime.
            time_step: 4e12,
            ..KernelScript::default()
        };
        let (mut session, _) = session(script, false);
        session.initialize(Path::new("dimr.json")).unwrap();

        assert!(session.time_step().is_ok());
        assert!(session.stop_time().is_err());
    }

    #[test]
    fn buffering_controls_message_history() {
        let (mut buffered, _) = session(KernelScript::default(), true);
        buffered.initialize(Path::new("dimr.json")).unwrap();
        let messages = buffered.messages();
        assert_eq!(messages[0], SESSION_BANNER);
        assert_eq!(messages[1], "INFO: loading dimr.json");

        let (mut quiet, _) = session(KernelScript::default(), false);
        quiet.initialize(Path::new("dimr.json")).unwrap();
        assert_eq!(quiet.messages(), vec![SESSION_BANNER.to_string()]);
    }

    #[test]
    fn bounded_session_reports_dropped_and_errors() {
        let script = KernelScript {
            initialize_code: -1,
            ..KernelScript::default()
        };
        let (session, _) = session(script, true);
        let mut session = session.with_message_capacity(Some(1));
        session.initialize(Path::new("dimr.json")).unwrap();

        assert_eq!(
            session.messages(),
            vec![SESSION_BANNER.to_string(), "ERROR: initialization failed".to_string()]
        );
        let summary = session.message_summary();
        assert_eq!(summary.dropped, 1);
        assert_eq!(summary.errors, 1);
    }

    #[test]
    fn failed_initialize_blocks_update() {
        let script = KernelScript {
            initialize_code: -1,
            ..KernelScript::default()
        };
        let (mut session, calls) = session(script, true);

        assert_eq!(session.initialize(Path::new("dimr.json")).unwrap(), -1);
        assert_eq!(session.last_result(), Some(-1));
        assert!(session.update(0.0).is_err());
        assert_eq!(calls.lock().unwrap().as_slice(), ["initialize"]);
    }

    #[test]
    fn dispose_is_idempotent_and_swallows_faults() {
        let script = KernelScript {
            dispose_error: true,
            ..KernelScript::default()
        };
        let (mut session, calls) = session(script, true);
        session.dispose();
        session.dispose();

        assert!(session.is_disposed());
        assert_eq!(calls.lock().unwrap().as_slice(), ["dispose"]);
        assert!(matches!(
            session.update(0.0),
            Err(Error::KernelFault { .. })
        ));
    }

    #[test]
    fn dispose_survives_kernel_panic() {
        let script = KernelScript {
            dispose_panics: true,
            ..KernelScript::default()
        };
        let (mut session, _) = session(script, false);
        session.dispose();
        assert!(session.is_disposed());
        drop(session);
    }

    #[test]
    fn panicking_update_becomes_kernel_fault() {
        let script = KernelScript {
            update_panics: true,
            ..KernelScript::default()
        };
        let (mut session, _) = session(script, false);
        session.initialize(Path::new("dimr.json")).unwrap();

        let err = session.update(0.0).unwrap_err();
        assert!(matches!(err, Error::KernelFault { ref operation, .. } if operation == "update"));
    }
}
