//! Error Types

use std::path::PathBuf;
use thiserror::Error;

use crate::activity::{ActivityStatus, Operation};

pub type Result<T> = std::result::Result<T, Error>;

#[non_exhaustive]
#[derive(Error, Debug)]
pub enum Error {
    #[error("No file exporter registered for model '{model}' of kind '{kind}'")]
    NoExporter { model: String, kind: String },

    #[error("Model '{model}' matches more than one exporter: {exporters}")]
    AmbiguousExporter { model: String, exporters: String },

    #[error("Export of model '{model}' to {path} failed: {reason}")]
    ExportFailed {
        model: String,
        path: PathBuf,
        reason: String,
    },

    #[error("Kernel returned error code {code} while {status}")]
    KernelCode { status: ActivityStatus, code: i32 },

    #[error("Kernel fault during {operation}: {reason}")]
    KernelFault { operation: String, reason: String },

    #[error("Could not load the kernel: {0}")]
    KernelUnavailable(String),

    #[error("Cannot {operation} '{activity}' while it is {status}")]
    InvalidTransition {
        activity: String,
        operation: Operation,
        status: ActivityStatus,
    },

    #[error("'{0}' is already executing")]
    AlreadyExecuting(String),

    #[error("Activity '{activity}' stopped: '{child}' ended {status}")]
    ChildFailed {
        activity: String,
        child: String,
        status: ActivityStatus,
        #[source]
        source: Option<Box<Error>>,
    },

    #[error("Validation of '{subject}' failed: {reasons}")]
    Validation { subject: String, reasons: String },

    #[error("Workflow not found: {0}")]
    WorkflowNotFound(String),

    #[error("Cannot change '{model}' while it is {status}")]
    WorkflowLocked {
        model: String,
        status: ActivityStatus,
    },

    #[error("Model not found: {0}")]
    ModelNotFound(String),

    #[error("Model '{0}' is already part of this integrated model")]
    DuplicateModel(String),

    #[error("Invalid configuration: {reason}")]
    InvalidConfig { reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    pub fn other(msg: impl Into<String>) -> Self {
        Error::Other(msg.into())
    }

    pub fn invalid_config(reason: impl Into<String>) -> Self {
        Error::InvalidConfig {
            reason: reason.into(),
        }
    }

    pub fn exit_code(&self) -> i32 {
        match self {
            Error::Io(_) | Error::Serialization(_) | Error::Other(_) => 1,
            Error::NoExporter { .. } => 10,
            Error::AmbiguousExporter { .. } => 11,
            Error::ExportFailed { .. } => 12,
            Error::KernelCode { .. } => 20,
            Error::KernelFault { .. } => 21,
            Error::KernelUnavailable(_) => 22,
            Error::InvalidTransition { .. } => 30,
            Error::AlreadyExecuting(_) => 31,
            Error::ChildFailed { source, .. } => source.as_ref().map_or(40, |e| e.exit_code()),
            Error::Validation { .. } => 60,
            Error::InvalidConfig { .. } => 61,
            Error::WorkflowNotFound(_) => 62,
            Error::WorkflowLocked { .. } => 63,
            Error::ModelNotFound(_) => 64,
            Error::DuplicateModel(_) => 65,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Error::NoExporter { .. } => "no_exporter",
            Error::AmbiguousExporter { .. } => "ambiguous_exporter",
            Error::ExportFailed { .. } => "export_failed",
            Error::KernelCode { .. } => "kernel_code",
            Error::KernelFault { .. } => "kernel_fault",
            Error::KernelUnavailable(_) => "kernel_unavailable",
            Error::InvalidTransition { .. } => "invalid_transition",
            Error::AlreadyExecuting(_) => "already_executing",
            Error::ChildFailed { .. } => "child_failed",
            Error::Validation { .. } => "validation",
            Error::WorkflowNotFound(_) => "workflow_not_found",
            Error::WorkflowLocked { .. } => "workflow_locked",
            Error::ModelNotFound(_) => "model_not_found",
            Error::DuplicateModel(_) => "duplicate_model",
            Error::InvalidConfig { .. } => "invalid_config",
            Error::Io(_) => "io_error",
            Error::Serialization(_) => "serialization_error",
            Error::Other(_) => "other",
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::json!({
            "error": true,
            "kind": self.kind(),
            "exit_code": self.exit_code(),
            "message": self.to_string(),
        })
        .to_string()
    }

    /// Configuration errors are raised before any kernel interaction.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Error::NoExporter { .. }
                | Error::AmbiguousExporter { .. }
                | Error::InvalidConfig { .. }
                | Error::Validation { .. }
        )
    }

    /// Nothing in a run is retried automatically; only user-driven edits are.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::InvalidTransition { .. }
                | Error::AlreadyExecuting(_)
                | Error::WorkflowLocked { .. }
        )
    }

    /// The innermost error of a `ChildFailed` chain.
    pub fn root_cause(&self) -> &Error {
        match self {
            Error::ChildFailed {
                source: Some(inner),
                ..
            } => inner.root_cause(),
            other => other,
        }
    }

    pub fn activity_name(&self) -> Option<&str> {
        match self {
            Error::NoExporter { model, .. }
            | Error::AmbiguousExporter { model, .. }
            | Error::ExportFailed { model, .. }
            | Error::WorkflowLocked { model, .. } => Some(model),
            Error::InvalidTransition { activity, .. } | Error::ChildFailed { activity, .. } => {
                Some(activity)
            }
            Error::AlreadyExecuting(name) | Error::ModelNotFound(name) => Some(name),
            Error::Validation { subject, .. } => Some(subject),
            _ => None,
        }
    }
}
