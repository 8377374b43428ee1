//! Time Windows
//!
//! A [`TimeWindow`] is the start/stop/step triple every time-dependent model
//! carries. [`TimeSynchronizer`] keeps the window of an integrated model and
//! the windows of its child models consistent.

mod sync;

pub use sync::{TimeEvent, TimeListener, TimeSource, TimeSynchronizer};

use chrono::{NaiveDateTime, TimeDelta};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimeField {
    StartTime,
    StopTime,
    TimeStep,
}

impl TimeField {
    pub const ALL: [TimeField; 3] = [TimeField::StartTime, TimeField::StopTime, TimeField::TimeStep];

    pub fn accepts(self, value: &TimeValue) -> bool {
        matches!(
            (self, value),
            (TimeField::StartTime | TimeField::StopTime, TimeValue::Instant(_))
                | (TimeField::TimeStep, TimeValue::Span(_))
        )
    }
}

impl std::fmt::Display for TimeField {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TimeField::StartTime => write!(f, "start time"),
            TimeField::StopTime => write!(f, "stop time"),
            TimeField::TimeStep => write!(f, "time step"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeValue {
    Instant(NaiveDateTime),
    Span(TimeDelta),
}

impl std::fmt::Display for TimeValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TimeValue::Instant(at) => write!(f, "{}", at.format("%Y-%m-%d %H:%M:%S")),
            TimeValue::Span(span) => write!(f, "{}s", span.num_seconds()),
        }
    }
}

/// Converts fractional seconds, rounded to whole milliseconds. `None` when
/// the value is not finite or outside the range of [`TimeDelta`].
pub fn from_seconds(value: f64) -> Option<TimeDelta> {
    let millis = (value * 1000.0).round();
    if !millis.is_finite() || millis < i64::MIN as f64 || millis >= i64::MAX as f64 {
        return None;
    }
    TimeDelta::try_milliseconds(millis as i64)
}

/// Reasons a window cannot be run. Both are checked independently.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeWindowError {
    #[error("the stop time must be later than the start time")]
    NonPositiveDuration,

    #[error("the time step must be larger than zero")]
    NonPositiveTimeStep,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimeWindow {
    start_time: NaiveDateTime,
    stop_time: NaiveDateTime,
    time_step: TimeDelta,
    override_start_time: bool,
    override_stop_time: bool,
    override_time_step: bool,
}

impl Default for TimeWindow {
    fn default() -> Self {
        let start = NaiveDateTime::default();
        Self::new(start, start + TimeDelta::days(1), TimeDelta::hours(1))
    }
}

impl TimeWindow {
    pub fn new(start_time: NaiveDateTime, stop_time: NaiveDateTime, time_step: TimeDelta) -> Self {
        Self {
            start_time,
            stop_time,
            time_step,
            override_start_time: true,
            override_stop_time: true,
            override_time_step: true,
        }
    }

    pub fn with_overrides(mut self, start: bool, stop: bool, step: bool) -> Self {
        self.override_start_time = start;
        self.override_stop_time = stop;
        self.override_time_step = step;
        self
    }

    pub fn start_time(&self) -> NaiveDateTime {
        self.start_time
    }

    pub fn stop_time(&self) -> NaiveDateTime {
        self.stop_time
    }

    pub fn time_step(&self) -> TimeDelta {
        self.time_step
    }

    pub fn step_seconds(&self) -> f64 {
        self.time_step.num_milliseconds() as f64 / 1000.0
    }

    pub fn get(&self, field: TimeField) -> TimeValue {
        match field {
            TimeField::StartTime => TimeValue::Instant(self.start_time),
            TimeField::StopTime => TimeValue::Instant(self.stop_time),
            TimeField::TimeStep => TimeValue::Span(self.time_step),
        }
    }

    /// Writes `value` and returns the previous value when it changed.
    ///
    /// A value of the wrong kind for `field` is ignored.
    pub fn set(&mut self, field: TimeField, value: TimeValue) -> Option<TimeValue> {
        let old = self.get(field);
        if old == value {
            return None;
        }
        match (field, value) {
            (TimeField::StartTime, TimeValue::Instant(at)) => self.start_time = at,
            (TimeField::StopTime, TimeValue::Instant(at)) => self.stop_time = at,
            (TimeField::TimeStep, TimeValue::Span(span)) => self.time_step = span,
            _ => return None,
        }
        Some(old)
    }

    pub fn overrides(&self, field: TimeField) -> bool {
        match field {
            TimeField::StartTime => self.override_start_time,
            TimeField::StopTime => self.override_stop_time,
            TimeField::TimeStep => self.override_time_step,
        }
    }

    /// Returns true when the flag changed.
    pub fn set_override(&mut self, field: TimeField, value: bool) -> bool {
        let flag = match field {
            TimeField::StartTime => &mut self.override_start_time,
            TimeField::StopTime => &mut self.override_stop_time,
            TimeField::TimeStep => &mut self.override_time_step,
        };
        let changed = *flag != value;
        *flag = value;
        changed
    }

    pub fn duration(&self) -> TimeDelta {
        self.stop_time - self.start_time
    }

    pub fn validate(&self) -> Vec<TimeWindowError> {
        let mut errors = Vec::new();
        if self.duration() <= TimeDelta::zero() {
            errors.push(TimeWindowError::NonPositiveDuration);
        }
        if self.time_step <= TimeDelta::zero() {
            errors.push(TimeWindowError::NonPositiveTimeStep);
        }
        errors
    }

    pub fn is_valid(&self) -> bool {
        self.validate().is_empty()
    }

    /// e.g. `"1 days 2 hours 0 minutes 30 seconds"`.
    pub fn duration_text(&self) -> String {
        let duration = self.duration();
        let sign = if duration < TimeDelta::zero() { "-" } else { "" };
        let total = duration.num_seconds().unsigned_abs();

        format!(
            "{}{} days {} hours {} minutes {} seconds",
            sign,
            total / 86_400,
            total % 86_400 / 3_600,
            total % 3_600 / 60,
            total % 60
        )
    }
}
