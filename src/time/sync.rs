use std::sync::Arc;

use chrono::{NaiveDateTime, TimeDelta};
use tracing::{debug, trace};

use super::{TimeField, TimeValue, TimeWindow};
use crate::model::ModelHandle;
use crate::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimeSource {
    /// The integrated model's own window.
    Composite,
    Model(String),
}

impl std::fmt::Display for TimeSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TimeSource::Composite => write!(f, "composite"),
            TimeSource::Model(name) => write!(f, "model '{}'", name),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimeEvent {
    FieldChanged {
        source: TimeSource,
        field: TimeField,
        old: TimeValue,
        new: TimeValue,
    },
    OverrideChanged {
        source: TimeSource,
        field: TimeField,
        value: bool,
    },
    DurationChanged {
        text: String,
        valid: bool,
    },
}

pub type TimeListener = Arc<dyn Fn(&TimeEvent) + Send + Sync>;

/// Keeps a composite time window consistent with the windows of its models.
///
/// A child field *follows* the composite when both the composite's and the
/// child's override flag for that field are set. Edits are resolved as:
///
/// - composite edit: pushed to every following child;
/// - edit on a following child: the composite value wins and is restored;
/// - edit on a child that does not follow: the composite adopts the value and
///   pushes it to the children that do.
///
/// Each accepted edit runs exactly one synchronization pass; a write that
/// does not change the stored value runs none. While a pass is in progress
/// further writes only store the value.
///
/// Synchronization is single-threaded. The guard is a plain field scoped to
/// one pass, so a synchronizer must not be edited from several threads, even
/// when the models it links are shared.
pub struct TimeSynchronizer {
    window: TimeWindow,
    children: Vec<ModelHandle>,
    is_synchronizing: bool,
    passes: u64,
    listeners: Vec<TimeListener>,
}

impl TimeSynchronizer {
    pub fn new(window: TimeWindow) -> Self {
        Self {
            window,
            children: Vec::new(),
            is_synchronizing: false,
            passes: 0,
            listeners: Vec::new(),
        }
    }

    pub fn window(&self) -> &TimeWindow {
        &self.window
    }

    pub fn children(&self) -> &[ModelHandle] {
        &self.children
    }

    pub fn child(&self, name: &str) -> Option<&ModelHandle> {
        self.children.iter().find(|child| child.read().name == name)
    }

    /// Number of synchronization passes run so far.
    pub fn passes(&self) -> u64 {
        self.passes
    }

    pub fn is_synchronizing(&self) -> bool {
        self.is_synchronizing
    }

    pub fn subscribe(&mut self, listener: TimeListener) {
        self.listeners.push(listener);
    }

    pub fn set_start_time(&mut self, value: NaiveDateTime) {
        self.edit_composite(TimeField::StartTime, TimeValue::Instant(value));
    }

    pub fn set_stop_time(&mut self, value: NaiveDateTime) {
        self.edit_composite(TimeField::StopTime, TimeValue::Instant(value));
    }

    pub fn set_time_step(&mut self, value: TimeDelta) {
        self.edit_composite(TimeField::TimeStep, TimeValue::Span(value));
    }

    pub fn set_override(&mut self, field: TimeField, value: bool) {
        if !self.window.set_override(field, value) {
            return;
        }
        self.emit(TimeEvent::OverrideChanged {
            source: TimeSource::Composite,
            field,
            value,
        });
        if self.is_synchronizing || !value {
            return;
        }

        self.run_pass(|sync| sync.push_to_followers(field));
    }

    /// Edits a field of one child model's window.
    pub fn set_model_field(&mut self, model: &str, field: TimeField, value: TimeValue) -> Result<()> {
        if !field.accepts(&value) {
            return Err(Error::other(format!("{} cannot be set to {}", field, value)));
        }
        let child = self.find(model)?;

        let written = child.write().time.set(field, value);
        let old = match written {
            Some(old) => old,
            None => return Ok(()),
        };
        if self.is_synchronizing {
            return Ok(());
        }

        let source = TimeSource::Model(model.to_string());
        self.emit(TimeEvent::FieldChanged {
            source: source.clone(),
            field,
            old,
            new: value,
        });

        self.run_pass(|sync| {
            if sync.follows(&child, field) {
                let authoritative = sync.window.get(field);
                let restored = child.write().time.set(field, authoritative);
                if let Some(edited) = restored {
                    sync.emit(TimeEvent::FieldChanged {
                        source,
                        field,
                        old: edited,
                        new: authoritative,
                    });
                }
            } else {
                if let Some(old) = sync.window.set(field, value) {
                    sync.emit(TimeEvent::FieldChanged {
                        source: TimeSource::Composite,
                        field,
                        old,
                        new: value,
                    });
                }
                sync.push_to_followers(field);
            }
        });
        Ok(())
    }

    pub fn set_model_override(&mut self, model: &str, field: TimeField, value: bool) -> Result<()> {
        let child = self.find(model)?;
        if !child.write().time.set_override(field, value) {
            return Ok(());
        }
        self.emit(TimeEvent::OverrideChanged {
            source: TimeSource::Model(model.to_string()),
            field,
            value,
        });
        if self.is_synchronizing || !value {
            return Ok(());
        }

        self.run_pass(|sync| sync.push_to(&child, field));
        Ok(())
    }

    /// Attaches a model; its following fields inherit the composite window.
    pub fn add_child(&mut self, child: ModelHandle) {
        if self.children.iter().any(|c| c.ptr_eq(&child)) {
            return;
        }
        self.children.push(child.clone());
        self.run_pass(|sync| {
            for field in TimeField::ALL {
                sync.push_to(&child, field);
            }
        });
    }

    pub fn remove_child(&mut self, name: &str) -> Option<ModelHandle> {
        let index = self.children.iter().position(|c| c.read().name == name)?;
        let removed = self.children.remove(index);
        self.run_pass(|_| {});
        Some(removed)
    }

    /// Pushes the composite window to every following child.
    pub fn synchronize(&mut self) {
        self.run_pass(|sync| {
            for field in TimeField::ALL {
                sync.push_to_followers(field);
            }
        });
    }

    fn edit_composite(&mut self, field: TimeField, value: TimeValue) {
        let old = match self.window.set(field, value) {
            Some(old) => old,
            None => return,
        };
        if self.is_synchronizing {
            return;
        }
        self.emit(TimeEvent::FieldChanged {
            source: TimeSource::Composite,
            field,
            old,
            new: value,
        });
        self.run_pass(|sync| sync.push_to_followers(field));
    }

    fn run_pass(&mut self, pass: impl FnOnce(&mut Self)) {
        self.is_synchronizing = true;
        self.passes += 1;
        trace!(pass = self.passes, "time synchronization pass");

        pass(self);

        self.emit(TimeEvent::DurationChanged {
            text: self.window.duration_text(),
            valid: self.window.is_valid(),
        });
        self.is_synchronizing = false;
    }

    fn follows(&self, child: &ModelHandle, field: TimeField) -> bool {
        self.window.overrides(field) && child.read().time.overrides(field)
    }

    fn push_to_followers(&mut self, field: TimeField) {
        let children = self.children.clone();
        for child in &children {
            self.push_to(child, field);
        }
    }

    fn push_to(&mut self, child: &ModelHandle, field: TimeField) {
        if !self.follows(child, field) {
            return;
        }
        let value = self.window.get(field);
        let (name, old) = {
            let mut model = child.write();
            (model.name.clone(), model.time.set(field, value))
        };
        if let Some(old) = old {
            debug!(model = %name, %field, %old, new = %value, "synchronized model time");
            self.emit(TimeEvent::FieldChanged {
                source: TimeSource::Model(name),
                field,
                old,
                new: value,
            });
        }
    }

    fn find(&self, name: &str) -> Result<ModelHandle> {
        self.child(name)
            .cloned()
            .ok_or_else(|| Error::ModelNotFound(name.to_string()))
    }

    fn emit(&self, event: TimeEvent) {
        for listener in &self.listeners {
            listener(&event);
        }
    }
}

impl std::fmt::Debug for TimeSynchronizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimeSynchronizer")
            .field("window", &self.window)
            .field("children", &self.children.len())
            .field("is_synchronizing", &self.is_synchronizing)
            .field("passes", &self.passes)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ModelDefinition;
    use chrono::NaiveDate;
    use std::sync::Mutex;

    fn at(hour: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 3, 1)
            .unwrap()
            .and_hms_opt(hour, 0, 0)
            .unwrap()
    }

    fn window(start: u32, stop: u32) -> TimeWindow {
        TimeWindow::new(at(start), at(stop), TimeDelta::minutes(10))
    }

    fn model(name: &str, time: TimeWindow) -> ModelHandle {
        ModelHandle::new(ModelDefinition::new(name, "flow").with_time(time))
    }

    #[test]
    fn added_child_inherits_composite_window() {
        let mut sync = TimeSynchronizer::new(window(0, 12));
        let flow = model("flow", window(3, 4));
        let rtc = model(
            "rtc",
            window(5, 6).with_overrides(false, true, true),
        );

        sync.add_child(flow.clone());
        sync.add_child(rtc.clone());

        assert_eq!(flow.read().time.start_time(), at(0));
        assert_eq!(flow.read().time.stop_time(), at(12));
        assert_eq!(rtc.read().time.start_time(), at(5));
        assert_eq!(rtc.read().time.stop_time(), at(12));
        assert_eq!(sync.passes(), 2);
    }

    #[test]
    fn composite_edit_reaches_followers_only() {
        let mut sync = TimeSynchronizer::new(window(0, 12));
        let flow = model("flow", window(0, 12));
        let rr = model("rr", window(0, 12).with_overrides(true, false, true));
        sync.add_child(flow.clone());
        sync.add_child(rr.clone());

        sync.set_stop_time(at(18));
        assert_eq!(flow.read().time.stop_time(), at(18));
        assert_eq!(rr.read().time.stop_time(), at(12));

        sync.set_override(TimeField::StopTime, false);
        sync.set_stop_time(at(20));
        assert_eq!(flow.read().time.stop_time(), at(18));
    }

    #[test]
    fn independent_child_edit_is_adopted_once() {
        let mut sync = TimeSynchronizer::new(window(0, 12));
        let flow = model("flow", window(0, 12));
        let rr = model("rr", window(0, 12).with_overrides(false, true, true));
        sync.add_child(flow.clone());
        sync.add_child(rr.clone());
        let before = sync.passes();

        let value = TimeValue::Instant(at(2));
        sync.set_model_field("rr", TimeField::StartTime, value).unwrap();
        sync.set_model_field("rr", TimeField::StartTime, value).unwrap();

        assert_eq!(sync.passes(), before + 1);
        assert_eq!(sync.window().start_time(), at(2));
        assert_eq!(flow.read().time.start_time(), at(2));
        assert_eq!(rr.read().time.start_time(), at(2));
    }

    #[test]
    fn following_child_edit_is_restored() {
        let mut sync = TimeSynchronizer::new(window(0, 12));
        let flow = model("flow", window(0, 12));
        sync.add_child(flow.clone());

        sync.set_model_field("flow", TimeField::TimeStep, TimeValue::Span(TimeDelta::minutes(1)))
            .unwrap();

        assert_eq!(flow.read().time.time_step(), TimeDelta::minutes(10));
        assert_eq!(sync.window().time_step(), TimeDelta::minutes(10));
    }

    #[test]
    fn enabling_child_override_inherits_composite_value() {
        let mut sync = TimeSynchronizer::new(window(0, 12));
        let rr = model("rr", window(4, 12).with_overrides(false, true, true));
        sync.add_child(rr.clone());
        assert_eq!(rr.read().time.start_time(), at(4));

        sync.set_model_override("rr", TimeField::StartTime, true).unwrap();
        assert_eq!(rr.read().time.start_time(), at(0));

        sync.set_model_override("rr", TimeField::StartTime, false).unwrap();
        assert_eq!(rr.read().time.start_time(), at(0));
    }

    #[test]
    fn events_carry_source_and_values() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);

        let mut sync = TimeSynchronizer::new(window(0, 12));
        sync.add_child(model("flow", window(0, 12)));
        sync.subscribe(Arc::new(move |event: &TimeEvent| {
            sink.lock().unwrap().push(event.clone());
        }));

        sync.set_start_time(at(1));

        let events = events.lock().unwrap();
        assert_eq!(
            events[0],
            TimeEvent::FieldChanged {
                source: TimeSource::Composite,
                field: TimeField::StartTime,
                old: TimeValue::Instant(at(0)),
                new: TimeValue::Instant(at(1)),
            }
        );
        assert!(matches!(
            &events[1],
            TimeEvent::FieldChanged { source: TimeSource::Model(name), .. } if name == "flow"
        ));
        assert_eq!(
            events[2],
            TimeEvent::DurationChanged {
                text: "0 days 11 hours 0 minutes 0 seconds".to_string(),
                valid: true,
            }
        );
        assert!(!sync.is_synchronizing());
    }

    #[test]
    fn unknown_model_and_wrong_kind_are_rejected() {
        let mut sync = TimeSynchronizer::new(window(0, 12));
        sync.add_child(model("flow", window(0, 12)));

        let err = sync
            .set_model_field("wave", TimeField::StartTime, TimeValue::Instant(at(1)))
            .unwrap_err();
        assert!(matches!(err, Error::ModelNotFound(name) if name == "wave"));

        assert!(sync
            .set_model_field("flow", TimeField::StopTime, TimeValue::Span(TimeDelta::hours(1)))
            .is_err());
    }
}
