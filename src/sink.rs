//! Output sinks
//!
//! A sink receives progress text from the engine and postprocessors.
//! It reaches the engine as the `output_writer` runtime argument, wrapped
//! in a [`Handle`].

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::info;

use crate::value::{Handle, Value};

/// Runtime argument name under which the sink is passed to the engine
pub const OUTPUT_WRITER_ARG: &str = "output_writer";

pub trait OutputSink: Send + Sync + fmt::Debug {
    fn write(&self, text: &str);
}

pub type SharedSink = Arc<dyn OutputSink>;

/// Wrap a sink as a runtime argument value
pub fn sink_value(sink: &SharedSink) -> Value {
    Value::Handle(Handle::new(OUTPUT_WRITER_ARG, Arc::clone(sink)))
}

/// Recover a sink from a runtime argument value
pub fn sink_from_value(value: &Value) -> Option<SharedSink> {
    value
        .as_handle()
        .and_then(|h| h.downcast_ref::<SharedSink>())
        .cloned()
}

/// Discards everything
#[derive(Debug, Default, Clone, Copy)]
pub struct SilentSink;

impl OutputSink for SilentSink {
    fn write(&self, _text: &str) {}
}

/// Forwards to `tracing` at info level
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl OutputSink for TracingSink {
    fn write(&self, text: &str) {
        info!(target: "qbind::output", "{}", text);
    }
}

/// Prints to stdout
#[derive(Debug, Default, Clone, Copy)]
pub struct StdoutSink;

impl OutputSink for StdoutSink {
    fn write(&self, text: &str) {
        println!("{}", text);
    }
}

/// Keeps every line (for tests and inspection)
#[derive(Debug, Default, Clone)]
pub struct BufferSink {
    lines: Arc<Mutex<Vec<String>>>,
}

impl BufferSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().clone()
    }
}

impl OutputSink for BufferSink {
    fn write(&self, text: &str) {
        self.lines.lock().push(text.to_string());
    }
}
