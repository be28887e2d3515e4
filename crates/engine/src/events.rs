//! Event types for edit-log change notifications.
//!
//! The manager delivers these through a callback installed once at session
//! start, in order, exactly once per state change. Hosts use them to sync a
//! frontend without polling; tests use the collector to verify ordering.

use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

/// Events emitted by the steps manager.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EngineEvent {
    /// A step was applied and appended to the log.
    StepApplied { index: usize, revision: u64, display_name: String },
    /// The cursor moved without appending (undo or redo).
    CursorMoved { cursor: usize, revision: u64, direction: CursorMove },
    /// Appending after an undo discarded the skipped tail.
    HistoryTruncated { discarded: usize, revision: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CursorMove {
    Undo,
    Redo,
}

/// Callback type for receiving engine events.
pub type EventCallback = Box<dyn FnMut(EngineEvent) + Send>;

/// Event collector for tests: a cloneable handle whose `callback()` can be
/// handed to the manager at construction.
#[derive(Clone, Default)]
pub struct EventCollector {
    events: Arc<Mutex<Vec<EngineEvent>>>,
}

impl EventCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn callback(&self) -> EventCallback {
        let events = self.events.clone();
        Box::new(move |event| {
            events.lock().expect("event collector poisoned").push(event);
        })
    }

    pub fn events(&self) -> Vec<EngineEvent> {
        self.events.lock().expect("event collector poisoned").clone()
    }

    pub fn len(&self) -> usize {
        self.events.lock().expect("event collector poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.events.lock().expect("event collector poisoned").clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collector_records_in_order() {
        let collector = EventCollector::new();
        let mut callback = collector.callback();
        callback(EngineEvent::StepApplied { index: 0, revision: 1, display_name: "Create Table".into() });
        callback(EngineEvent::CursorMoved { cursor: 0, revision: 2, direction: CursorMove::Undo });

        let events = collector.events();
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], EngineEvent::StepApplied { index: 0, .. }));
        assert!(matches!(events[1], EngineEvent::CursorMoved { direction: CursorMove::Undo, .. }));
    }
}
