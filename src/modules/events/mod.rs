//! Failure event system.
//!
//! Cascade, detection, and transition failures are turned into structured
//! [`FailureRecord`]s and broadcast to every registered [`DebugSink`]. How a
//! record is persisted is up to the sink.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

/// Subsystem that produced a failure record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Component {
    Detection,
    Cascade,
    StateEnter,
    StateExecute,
    StateExit,
    Transition,
    Network,
}

impl fmt::Display for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Component::Detection => "detection",
            Component::Cascade => "cascade",
            Component::StateEnter => "state_enter",
            Component::StateExecute => "state_execute",
            Component::StateExit => "state_exit",
            Component::Transition => "transition",
            Component::Network => "network",
        };
        f.write_str(label)
    }
}

/// Structured description of a local failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub timestamp: DateTime<Utc>,
    pub component: Component,
    pub inputs: Value,
    pub reason: String,
}

impl FailureRecord {
    pub fn new(component: Component, inputs: Value, reason: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            component,
            inputs,
            reason: reason.into(),
        }
    }

    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }
}

/// Receiver of failure records.
pub trait DebugSink: Send + Sync {
    fn record(&self, record: &FailureRecord);
}

/// Dispatcher that broadcasts records to registered sinks.
#[derive(Clone, Default)]
pub struct DebugDispatcher {
    sinks: Vec<Arc<dyn DebugSink>>,
}

impl DebugDispatcher {
    pub fn new() -> Self {
        Self { sinks: Vec::new() }
    }

    /// Dispatcher pre-wired with a [`LoggingSink`].
    pub fn with_logging() -> Self {
        let mut dispatcher = Self::new();
        dispatcher.register_sink(Arc::new(LoggingSink));
        dispatcher
    }

    pub fn register_sink(&mut self, sink: Arc<dyn DebugSink>) {
        self.sinks.push(sink);
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }

    pub fn dispatch(&self, record: FailureRecord) {
        for sink in &self.sinks {
            sink.record(&record);
        }
    }
}

impl fmt::Debug for DebugDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DebugDispatcher")
            .field("sinks", &self.sinks.len())
            .finish()
    }
}

/// Logs records using the `log` crate.
#[derive(Debug)]
pub struct LoggingSink;

impl DebugSink for LoggingSink {
    fn record(&self, record: &FailureRecord) {
        // Individual cascade misses are routine.
        let level = match record.component {
            Component::Cascade => log::Level::Debug,
            _ => log::Level::Warn,
        };
        log::log!(
            level,
            "[{}] {} failure: {} (inputs: {})",
            record.timestamp.to_rfc3339(),
            record.component,
            record.reason,
            record.inputs
        );
    }
}

/// Keeps every record in memory, oldest first.
#[derive(Debug, Default)]
pub struct MemorySink {
    records: Mutex<Vec<FailureRecord>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<FailureRecord> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn count(&self, component: Component) -> usize {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|record| record.component == component)
            .count()
    }
}

impl DebugSink for MemorySink {
    fn record(&self, record: &FailureRecord) {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(record.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn dispatches_to_every_sink() {
        let mut dispatcher = DebugDispatcher::with_logging();
        let memory = Arc::new(MemorySink::new());
        dispatcher.register_sink(memory.clone());

        dispatcher.dispatch(FailureRecord::new(
            Component::Cascade,
            json!({ "selector": "//div[@id='name']" }),
            "selector not found",
        ));

        let records = memory.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].component, Component::Cascade);
        assert_eq!(memory.count(Component::Transition), 0);
    }

    #[test]
    fn record_serializes_component_in_snake_case() {
        let record = FailureRecord::new(Component::StateExecute, Value::Null, "boom");
        let encoded = serde_json::to_value(&record).unwrap();
        assert_eq!(encoded["component"], "state_execute");
    }
}
