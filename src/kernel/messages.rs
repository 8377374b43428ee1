//! Kernel Messages
//!
//! Log lines reported by a kernel, parsed into entries with a level and a
//! capture time and kept in an optionally bounded buffer.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageLevel {
    Debug,
    Info,
    Warning,
    Error,
}

impl std::fmt::Display for MessageLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MessageLevel::Debug => write!(f, "DEBUG"),
            MessageLevel::Info => write!(f, "INFO"),
            MessageLevel::Warning => write!(f, "WARNING"),
            MessageLevel::Error => write!(f, "ERROR"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KernelMessage {
    pub timestamp: DateTime<Utc>,

    pub level: MessageLevel,

    pub text: String,
}

impl KernelMessage {
    /// Parses a raw kernel line. A leading `ERROR:`, `WARNING:`/`WARN:`,
    /// `INFO:` or `DEBUG:` prefix sets the level; other lines are `Info`.
    pub fn parse(line: &str) -> Self {
        let trimmed = line.trim_end();
        let (level, text) = match trimmed.split_once(':') {
            Some((prefix, rest)) => match prefix.trim().to_ascii_uppercase().as_str() {
                "ERROR" | "FATAL" => (MessageLevel::Error, rest.trim_start()),
                "WARNING" | "WARN" => (MessageLevel::Warning, rest.trim_start()),
                "INFO" => (MessageLevel::Info, rest.trim_start()),
                "DEBUG" => (MessageLevel::Debug, rest.trim_start()),
                _ => (MessageLevel::Info, trimmed),
            },
            None => (MessageLevel::Info, trimmed),
        };

        Self {
            timestamp: Utc::now(),
            level,
            text: text.to_string(),
        }
    }

    pub fn format(&self) -> String {
        format!("{}: {}", self.level, self.text)
    }
}

/// Counts over everything a session captured, dropped entries included.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MessageSummary {
    pub errors: usize,

    pub warnings: usize,

    /// Entries pushed out of a bounded buffer.
    pub dropped: usize,

    /// Capture time of the oldest retained entry.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_at: Option<DateTime<Utc>>,

    /// Capture time of the newest retained entry.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_at: Option<DateTime<Utc>>,
}

impl MessageSummary {
    pub fn has_problems(&self) -> bool {
        self.errors > 0 || self.warnings > 0
    }
}

/// Message history of one kernel session.
#[derive(Debug, Clone, Default)]
pub struct MessageBuffer {
    entries: VecDeque<KernelMessage>,

    capacity: Option<usize>,

    dropped: usize,

    errors: usize,

    warnings: usize,
}

impl MessageBuffer {
    pub fn unbounded() -> Self {
        Self::default()
    }

    /// Keeps at most `capacity` entries, dropping the oldest first.
    pub fn bounded(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity.min(1024)),
            capacity: Some(capacity),
            ..Self::default()
        }
    }

    pub fn capacity(&self) -> Option<usize> {
        self.capacity
    }

    pub fn push(&mut self, message: KernelMessage) {
        match message.level {
            MessageLevel::Error => self.errors += 1,
            MessageLevel::Warning => self.warnings += 1,
            MessageLevel::Info | MessageLevel::Debug => {}
        }
        if let Some(capacity) = self.capacity {
            if capacity == 0 {
                self.dropped += 1;
                return;
            }
            if self.entries.len() >= capacity {
                self.entries.pop_front();
                self.dropped += 1;
            }
        }
        self.entries.push_back(message);
    }

    /// Retained entries as `LEVEL: text`, oldest first.
    pub fn lines(&self) -> Vec<String> {
        self.entries.iter().map(KernelMessage::format).collect()
    }

    pub fn summary(&self) -> MessageSummary {
        MessageSummary {
            errors: self.errors,
            warnings: self.warnings,
            dropped: self.dropped,
            first_at: self.entries.front().map(|m| m.timestamp),
            last_at: self.entries.back().map(|m| m.timestamp),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
