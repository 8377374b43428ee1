//! In-process reference kernel.
//!
//! Reads the JSON configuration written by [`DimrConfigExporter`], advances a
//! clock from start to stop, writes progress to the redirected run log and a
//! restart file on finish.
//!
//! [`DimrConfigExporter`]: crate::runner::DimrConfigExporter

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use super::{Kernel, KernelFactory};
use crate::runner::DimrConfig;
use crate::{Error, Result};

/// Result codes returned by [`ClockKernel`].
pub mod codes {
    pub const OK: i32 = 0;
    pub const CONFIG_MISSING: i32 = -1;
    pub const CONFIG_INVALID: i32 = -2;
    pub const STEP_FAILED: i32 = -3;
    pub const FINISH_FAILED: i32 = -4;
    pub const INITIALIZE_REQUESTED_FAILURE: i32 = -5;
}

#[derive(Debug, Default)]
pub struct ClockKernel {
    config: Option<DimrConfig>,
    directory: PathBuf,
    current: f64,
    steps: u64,
    pending: Vec<String>,
    log: Option<File>,
}

impl ClockKernel {
    pub fn new() -> Self {
        Self::default()
    }

    fn log(&mut self, line: String) {
        if let Some(file) = self.log.as_mut() {
            // The run log is best effort; kernel results never depend on it.
            let _ = writeln!(file, "{}", line);
        }
        self.pending.push(line);
    }

    fn flag(&self, key: &str) -> bool {
        self.property(key)
            .is_some_and(|value| matches!(value.trim(), "true" | "1" | "yes"))
    }

    fn property(&self, key: &str) -> Option<&str> {
        self.config
            .as_ref()
            .and_then(|config| config.properties.get(key))
            .map(String::as_str)
    }

    fn open_log(&mut self, name: &str) {
        let path = self.directory.join(name);
        self.log = OpenOptions::new().create(true).append(true).open(path).ok();
    }
}

impl Kernel for ClockKernel {
    fn initialize(&mut self, config_path: &Path) -> Result<i32> {
        let text = match fs::read_to_string(config_path) {
            Ok(text) => text,
            Err(e) => {
                self.pending.push(format!(
                    "ERROR: cannot read {}: {}",
                    config_path.display(),
                    e
                ));
                return Ok(codes::CONFIG_MISSING);
            }
        };
        let config: DimrConfig = match serde_json::from_str(&text) {
            Ok(config) => config,
            Err(e) => {
                self.pending
                    .push(format!("ERROR: invalid configuration: {}", e));
                return Ok(codes::CONFIG_INVALID);
            }
        };
        if config.time_step <= 0.0 || config.stop_time <= config.start_time {
            self.pending
                .push("ERROR: configuration has an empty time window".to_string());
            return Ok(codes::CONFIG_INVALID);
        }

        self.directory = config_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();
        self.current = config.start_time;
        let log_file = config.log_file.clone();
        let model = config.model.clone();
        let restart = config.restart_input.clone();
        self.config = Some(config);
        self.open_log(&log_file);

        self.log(format!("INFO: initialized model '{}'", model));
        if let Some(restart) = restart {
            if self.directory.join(&restart).exists() {
                self.log(format!("INFO: restarting from {}", restart));
            } else {
                self.log(format!("WARNING: restart file {} not found", restart));
            }
        }

        if self.flag("fail_on_initialize") {
            self.log("ERROR: initialization failure requested".to_string());
            return Ok(codes::INITIALIZE_REQUESTED_FAILURE);
        }
        Ok(codes::OK)
    }

    fn update(&mut self, time_step: f64) -> Result<i32> {
        let (own_step, stop) = match &self.config {
            Some(config) => (config.time_step, config.stop_time),
            None => {
                return Err(Error::KernelFault {
                    operation: "update".to_string(),
                    reason: "kernel is not initialized".to_string(),
                });
            }
        };

        self.steps += 1;
        let fail_at = self
            .property("fail_at_step")
            .and_then(|value| value.trim().parse::<u64>().ok());
        if fail_at == Some(self.steps) {
            self.log(format!("ERROR: step {} failed", self.steps));
            return Ok(codes::STEP_FAILED);
        }

        let step = if time_step > 0.0 { time_step } else { own_step };
        self.current = (self.current + step).min(stop);
        self.log(format!("INFO: step {} reached t={}s", self.steps, self.current));
        Ok(codes::OK)
    }

    fn finish(&mut self) -> Result<i32> {
        let Some(model) = self.config.as_ref().map(|c| c.model.clone()) else {
            return Err(Error::KernelFault {
                operation: "finish".to_string(),
                reason: "kernel is not initialized".to_string(),
            });
        };

        if self.flag("fail_on_finish") {
            self.log("ERROR: finish failure requested".to_string());
            return Ok(codes::FINISH_FAILED);
        }

        let restart = self
            .directory
            .join(format!("{}_{:08}_rst.txt", model, self.current as u64));
        if let Err(e) = fs::write(&restart, format!("time={}\nsteps={}\n", self.current, self.steps)) {
            self.log(format!("ERROR: cannot write restart file: {}", e));
            return Ok(codes::FINISH_FAILED);
        }
        self.log(format!("INFO: finished after {} steps", self.steps));
        Ok(codes::OK)
    }

    fn drain_messages(&mut self) -> Vec<String> {
        std::mem::take(&mut self.pending)
    }

    fn start_time(&self) -> f64 {
        self.config.as_ref().map_or(0.0, |c| c.start_time)
    }

    fn stop_time(&self) -> f64 {
        self.config.as_ref().map_or(0.0, |c| c.stop_time)
    }

    fn current_time(&self) -> f64 {
        self.current
    }

    fn time_step(&self) -> f64 {
        self.config.as_ref().map_or(0.0, |c| c.time_step)
    }

    fn dispose(&mut self) -> Result<()> {
        self.log = None;
        if self.flag("fail_on_dispose") {
            return Err(Error::KernelFault {
                operation: "dispose".to_string(),
                reason: "dispose failure requested".to_string(),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ClockKernelFactory;

impl KernelFactory for ClockKernelFactory {
    fn create_kernel(&self) -> Result<Box<dyn Kernel>> {
        Ok(Box::new(ClockKernel::new()))
    }
}
