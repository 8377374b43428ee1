//! Scripted kernel for tests.

use std::path::Path;
use std::sync::{Arc, Mutex};

use super::{Kernel, KernelFactory};
use crate::{Error, Result};

pub type Calls = Arc<Mutex<Vec<String>>>;

#[derive(Debug, Clone)]
pub struct KernelScript {
    pub initialize_code: i32,
    /// `(step, code)`: the update with this 1-based index returns `code`.
    pub update_code_at: Option<(usize, i32)>,
    pub finish_code: i32,
    pub steps: usize,
    pub time_step: f64,
    pub update_panics: bool,
    pub dispose_error: bool,
    pub dispose_panics: bool,
}

impl Default for KernelScript {
    fn default() -> Self {
        Self {
            initialize_code: 0,
            update_code_at: None,
            finish_code: 0,
            steps: 3,
            time_step: 60.0,
            update_panics: false,
            dispose_error: false,
            dispose_panics: false,
        }
    }
}

/// Records every call so tests can assert on call order.
pub struct ScriptedKernel {
    script: KernelScript,
    calls: Calls,
    current: f64,
    taken: usize,
    pending: Vec<String>,
}

impl ScriptedKernel {
    pub fn new(script: KernelScript) -> Self {
        Self::with_calls(script, Arc::new(Mutex::new(Vec::new())))
    }

    pub fn with_calls(script: KernelScript, calls: Calls) -> Self {
        Self {
            script,
            calls,
            current: 0.0,
            taken: 0,
            pending: Vec::new(),
        }
    }

    pub fn calls(&self) -> Calls {
        Arc::clone(&self.calls)
    }

    fn record(&mut self, call: &str) {
        self.calls.lock().unwrap().push(call.to_string());
    }
}

impl Kernel for ScriptedKernel {
    fn initialize(&mut self, config_path: &Path) -> Result<i32> {
        self.record("initialize");
        self.pending
            .push(format!("INFO: loading {}", config_path.display()));
        if self.script.initialize_code != 0 {
            self.pending.push("ERROR: initialization failed".to_string());
        }
        Ok(self.script.initialize_code)
    }

    fn update(&mut self, time_step: f64) -> Result<i32> {
        self.record("update");
        if self.script.update_panics {
            panic!("scripted update panic");
        }
        self.taken += 1;
        if let Some((step, code)) = self.script.update_code_at {
            if step == self.taken {
                return Ok(code);
            }
        }
        let step = if time_step > 0.0 { time_step } else { self.script.time_step };
        self.current = (self.current + step).min(self.stop_time());
        self.pending.push(format!("time: {}", self.current));
        Ok(0)
    }

    fn finish(&mut self) -> Result<i32> {
        self.record("finish");
        Ok(self.script.finish_code)
    }

    fn drain_messages(&mut self) -> Vec<String> {
        std::mem::take(&mut self.pending)
    }

    fn start_time(&self) -> f64 {
        0.0
    }

    fn stop_time(&self) -> f64 {
        self.script.steps as f64 * self.script.time_step
    }

    fn current_time(&self) -> f64 {
        self.current
    }

    fn time_step(&self) -> f64 {
        self.script.time_step
    }

    fn dispose(&mut self) -> Result<()> {
        self.record("dispose");
        if self.script.dispose_panics {
            panic!("scripted dispose panic");
        }
        if self.script.dispose_error {
            return Err(Error::KernelFault {
                operation: "dispose".to_string(),
                reason: "handle already released".to_string(),
            });
        }
        Ok(())
    }
}

/// Creates a fresh [`ScriptedKernel`] per session, all sharing one call log.
pub struct ScriptedFactory {
    pub script: KernelScript,
    pub calls: Calls,
}

impl ScriptedFactory {
    pub fn new(script: KernelScript) -> Self {
        Self {
            script,
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

impl KernelFactory for ScriptedFactory {
    fn create_kernel(&self) -> Result<Box<dyn Kernel>> {
        Ok(Box::new(ScriptedKernel::with_calls(
            self.script.clone(),
            Arc::clone(&self.calls),
        )))
    }
}
