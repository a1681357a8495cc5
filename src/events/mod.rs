//! In-process pub/sub event bus.
//!
//! Topics are string event types. Publish is synchronous with respect to
//! handler invocation but isolates handler failures: a panicking handler
//! neither aborts the publish nor prevents later handlers from running.
//! A bounded ring buffer retains recent events for newest-first queries.
//! The bus is a notification mechanism only - nothing here is durable.

use std::collections::{HashMap, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Standard event types published by the orchestrator.
pub mod topics {
    pub const TASK_CLAIMED: &str = "task.claimed";
    pub const TASK_TRANSITIONED: &str = "task.transitioned";
    pub const TASK_COMPLETED: &str = "task.completed";
    pub const TOOL_EXECUTED: &str = "tool.executed";
    pub const GATE_BLOCKED: &str = "gate.blocked";
    pub const GATE_PASSED: &str = "gate.passed";
}

const DEFAULT_MAX_HISTORY: usize = 1000;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub event_type: String,
    pub data: Value,
    pub timestamp: DateTime<Utc>,
}

type Handler = Arc<dyn Fn(&Event) + Send + Sync>;

struct Inner {
    subscribers: HashMap<String, Vec<Handler>>,
    history: VecDeque<Event>,
    max_history: usize,
}

/// Thread-safe pub/sub bus. Cheap to clone and share.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<Mutex<Inner>>,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus").finish_non_exhaustive()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_HISTORY)
    }
}

impl EventBus {
    pub fn new(max_history: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                subscribers: HashMap::new(),
                history: VecDeque::new(),
                max_history,
            })),
        }
    }

    pub fn subscribe<F>(&self, event_type: &str, handler: F)
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        let mut inner = self.inner.lock().expect("event bus lock poisoned");
        inner
            .subscribers
            .entry(event_type.to_string())
            .or_default()
            .push(Arc::new(handler));
    }

    /// Publish an event. Handlers run on the calling thread, outside the
    /// subscriber lock, so a handler that publishes or subscribes cannot
    /// deadlock the bus.
    pub fn publish(&self, event_type: &str, data: Value) {
        let event = Event {
            event_type: event_type.to_string(),
            data,
            timestamp: Utc::now(),
        };

        let handlers: Vec<Handler> = {
            let mut inner = self.inner.lock().expect("event bus lock poisoned");
            if inner.history.len() >= inner.max_history {
                inner.history.pop_front();
            }
            inner.history.push_back(event.clone());
            inner
                .subscribers
                .get(event_type)
                .map(|hs| hs.to_vec())
                .unwrap_or_default()
        };

        for handler in handlers {
            if catch_unwind(AssertUnwindSafe(|| handler(&event))).is_err() {
                tracing::error!(event_type, "event handler panicked; continuing");
            }
        }
    }

    /// Recent events, newest first, optionally filtered by type.
    pub fn history(&self, event_type: Option<&str>, limit: usize) -> Vec<Event> {
        let inner = self.inner.lock().expect("event bus lock poisoned");
        let filtered: Vec<&Event> = match event_type {
            Some(t) => inner.history.iter().filter(|e| e.event_type == t).collect(),
            None => inner.history.iter().collect(),
        };
        filtered
            .into_iter()
            .rev()
            .take(limit)
            .cloned()
            .collect()
    }

    pub fn clear_history(&self) {
        self.inner
            .lock()
            .expect("event bus lock poisoned")
            .history
            .clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn subscribers_receive_matching_events_only() {
        let bus = EventBus::default();
        let count = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&count);
        bus.subscribe(topics::TASK_CLAIMED, move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        });

        bus.publish(topics::TASK_CLAIMED, json!({"task_id": "t1"}));
        bus.publish(topics::TOOL_EXECUTED, json!({"tool": "grep"}));

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn panicking_handler_does_not_stop_others() {
        let bus = EventBus::default();
        let count = Arc::new(AtomicUsize::new(0));

        bus.subscribe("boom", |_| panic!("handler exploded"));
        let seen = Arc::clone(&count);
        bus.subscribe("boom", move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        });

        bus.publish("boom", json!({}));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn history_is_newest_first_and_filterable() {
        let bus = EventBus::default();
        bus.publish("a", json!({"n": 1}));
        bus.publish("b", json!({"n": 2}));
        bus.publish("a", json!({"n": 3}));

        let all = bus.history(None, 100);
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].data["n"], 3);
        assert_eq!(all[2].data["n"], 1);

        let only_a = bus.history(Some("a"), 100);
        assert_eq!(only_a.len(), 2);
        assert_eq!(only_a[0].data["n"], 3);
    }

    #[test]
    fn history_is_bounded() {
        let bus = EventBus::new(3);
        for n in 0..10 {
            bus.publish("tick", json!({"n": n}));
        }
        let events = bus.history(None, 100);
        assert_eq!(events.len(), 3);
        // Oldest events were dropped; newest first.
        assert_eq!(events[0].data["n"], 9);
        assert_eq!(events[2].data["n"], 7);
    }

    #[test]
    fn history_limit_applies_after_filter() {
        let bus = EventBus::default();
        for n in 0..5 {
            bus.publish("tick", json!({"n": n}));
        }
        let events = bus.history(Some("tick"), 2);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].data["n"], 4);
        assert_eq!(events[1].data["n"], 3);
    }

    #[test]
    fn handler_can_publish_without_deadlock() {
        let bus = EventBus::default();
        let inner_bus = bus.clone();
        bus.subscribe("outer", move |_| {
            inner_bus.publish("inner", json!({}));
        });
        bus.publish("outer", json!({}));
        assert_eq!(bus.history(Some("inner"), 10).len(), 1);
    }
}
