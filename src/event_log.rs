//! Event log for query invocations
//!
//! Optional audit trail of every lifecycle step of a query call.
//! - Event: envelope with id + timestamp + kind
//! - EventKind: one variant per lifecycle step
//! - EventLog: thread-safe, append-only log shared by clones

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::RwLock; // 2-3x faster than std::sync::RwLock

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::query::Phase;

/// Single event in the log
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Monotonic sequence ID (for ordering)
    pub id: u64,
    /// Time since log creation (ms)
    pub timestamp_ms: u64,
    /// Event type and data
    pub kind: EventKind,
}

/// All possible event types
///
/// Every variant carries the invocation id handed out by
/// [`EventLog::begin_invocation`], so concurrent calls can be told apart.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    InvocationStarted {
        invocation: u64,
        query: Arc<str>,
        positional: usize,
        keywords: Vec<String>,
    },
    /// Binding succeeded; `query_kwargs` is what the template receives
    ArgumentsBound {
        invocation: u64,
        query_kwargs: Value,
        runtime_keys: Vec<String>,
    },
    EngineCreated {
        invocation: u64,
        engine: String,
        model: Option<String>,
    },
    EngineFinished {
        invocation: u64,
        result_count: usize,
    },
    PostprocessorApplied {
        invocation: u64,
        postprocessor: String,
        result_count: usize,
    },
    EngineReleased {
        invocation: u64,
    },
    InvocationCompleted {
        invocation: u64,
        result_count: usize,
        duration_ms: u64,
    },
    InvocationFailed {
        invocation: u64,
        phase: Phase,
        error: String,
    },
}

impl EventKind {
    pub fn invocation(&self) -> u64 {
        match self {
            Self::InvocationStarted { invocation, .. }
            | Self::ArgumentsBound { invocation, .. }
            | Self::EngineCreated { invocation, .. }
            | Self::EngineFinished { invocation, .. }
            | Self::PostprocessorApplied { invocation, .. }
            | Self::EngineReleased { invocation }
            | Self::InvocationCompleted { invocation, .. }
            | Self::InvocationFailed { invocation, .. } => *invocation,
        }
    }

    /// Check if this event ends an invocation
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::InvocationCompleted { .. } | Self::InvocationFailed { .. }
        )
    }
}

/// Thread-safe, append-only event log
#[derive(Clone)]
pub struct EventLog {
    events: Arc<RwLock<Vec<Event>>>,
    start_time: Instant,
    next_id: Arc<AtomicU64>,
    next_invocation: Arc<AtomicU64>,
}

impl EventLog {
    pub fn new() -> Self {
        Self {
            events: Arc::new(RwLock::new(Vec::new())),
            start_time: Instant::now(),
            next_id: Arc::new(AtomicU64::new(0)),
            next_invocation: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Allocate an id for a new invocation
    pub fn begin_invocation(&self) -> u64 {
        self.next_invocation.fetch_add(1, Ordering::SeqCst)
    }

    /// Emit an event (thread-safe, returns event ID)
    pub fn emit(&self, kind: EventKind) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let event = Event {
            id,
            timestamp_ms: self.start_time.elapsed().as_millis() as u64,
            kind,
        };

        self.events.write().push(event);
        id
    }

    /// Get all events (cloned)
    pub fn events(&self) -> Vec<Event> {
        self.events.read().clone()
    }

    /// Events of one invocation, in emission order
    pub fn filter_invocation(&self, invocation: u64) -> Vec<Event> {
        self.events
            .read()
            .iter()
            .filter(|e| e.kind.invocation() == invocation)
            .cloned()
            .collect()
    }

    /// Terminal event of an invocation, if it has finished
    pub fn outcome(&self, invocation: u64) -> Option<Event> {
        self.events
            .read()
            .iter()
            .rev()
            .find(|e| e.kind.invocation() == invocation && e.kind.is_terminal())
            .cloned()
    }

    /// Number of invocation ids handed out so far
    pub fn invocations(&self) -> u64 {
        self.next_invocation.load(Ordering::SeqCst)
    }

    /// Serialize to JSON for persistence/debugging
    pub fn to_json(&self) -> Value {
        serde_json::to_value(self.events()).unwrap_or(Value::Null)
    }

    pub fn len(&self) -> usize {
        self.events.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for EventLog {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EventLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventLog")
            .field("len", &self.len())
            .field("invocations", &self.invocations())
            .finish()
    }
}
