//! # Execution Engine Abstraction
//!
//! Trait and implementations for the engines that run compiled query
//! templates.
//!
//! ## Overview
//!
//! - [`Engine`] - one execution of one query; created and closed per call
//! - [`EngineFactory`] - builds a fresh engine for every invocation
//! - [`EngineGuard`] - scoped ownership that closes the engine exactly once
//! - [`RenderEngine`] - fills the template without calling a model
//! - [`MockEngine`] - test engine with queued results and failure injection
//!
//! ## Available Engines
//!
//! | Engine | Use Case | Features |
//! |--------|----------|----------|
//! | `render` | Dry runs | Prompt rendering, output holes from `outputs` arg |
//! | `mock` | Testing | Queued results, call recording, failures, delays |
//!
//! ## Creating Engines
//!
//! ```rust
//! use qbind::engine::create_engine_factory;
//!
//! let render = create_engine_factory("render");
//! assert!(render.is_ok());
//!
//! let unknown = create_engine_factory("gpt");
//! assert!(unknown.is_err());
//! ```

mod mock;
mod render;

pub use mock::{MockEngine, MockEngineFactory, MockRecord};
pub use render::{RenderEngine, RenderEngineFactory};

use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tracing::{debug, info};

use crate::event_log::{EventKind, EventLog};
use crate::query::{RENAMED_SELF_PARAM, SELF_PARAM};
use crate::result::Results;
use crate::template::CompiledTemplate;
use crate::value::{Kwargs, Value};

// ============================================================================
// TOKEN ESTIMATION
// ============================================================================

/// Average characters per token for mixed content (prose + code)
const CHARS_PER_TOKEN_MIXED: f32 = 3.0;

/// Token usage statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TokenUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

impl TokenUsage {
    pub fn new(prompt: u32, completion: u32) -> Self {
        Self {
            prompt_tokens: prompt,
            completion_tokens: completion,
            total_tokens: prompt + completion,
        }
    }

    /// Estimate usage when actual counts aren't available
    pub fn estimate(prompt_len: usize, response_len: usize) -> Self {
        let prompt_tokens = (prompt_len as f32 / CHARS_PER_TOKEN_MIXED).ceil() as u32;
        let completion_tokens = (response_len as f32 / CHARS_PER_TOKEN_MIXED).ceil() as u32;
        Self::new(prompt_tokens, completion_tokens)
    }

    pub fn add(&mut self, other: TokenUsage) {
        *self = Self::new(
            self.prompt_tokens + other.prompt_tokens,
            self.completion_tokens + other.completion_tokens,
        );
    }
}

/// Counters an engine reports through [`Engine::print_stats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineStats {
    pub runs: u32,
    pub results: u32,
    pub usage: TokenUsage,
}

/// A variable the engine scored over a fixed candidate set
#[derive(Debug, Clone, PartialEq)]
pub struct DistributionRequest {
    pub variable: String,
    pub candidates: Vec<Value>,
}

/// Template inputs as the template names them (`__self__` back to `self`)
pub(crate) fn template_inputs(mut query_kwargs: Kwargs) -> Kwargs {
    if let Some(value) = query_kwargs.remove(RENAMED_SELF_PARAM) {
        query_kwargs.insert(SELF_PARAM.to_string(), value);
    }
    query_kwargs
}

// ============================================================================
// ENGINE TRAIT (ASYNC)
// ============================================================================

/// One execution engine instance
///
/// Instances are never reused across invocations: the caller creates one
/// through an [`EngineFactory`], configures it, runs it once and closes it.
#[async_trait]
pub trait Engine: Send {
    /// Engine name (e.g. "render", "mock")
    fn name(&self) -> &str;

    /// Model this instance is bound to, if any
    fn model(&self) -> Option<&str> {
        None
    }

    /// Receive runtime configuration (non-query kwargs)
    fn set_extra_args(&mut self, args: Kwargs);

    /// Run the compiled template with the bound query kwargs
    async fn run(&mut self, template: &CompiledTemplate, query_kwargs: Kwargs) -> Result<Results>;

    /// Variable scored as a distribution in the last run, if any
    fn distribution_request(&self) -> Option<DistributionRequest> {
        None
    }

    fn stats(&self) -> EngineStats;

    /// Report statistics (logged through `tracing`)
    fn print_stats(&self) {
        let stats = self.stats();
        info!(
            engine = self.name(),
            model = self.model().unwrap_or("(default)"),
            runs = stats.runs,
            results = stats.results,
            prompt_tokens = stats.usage.prompt_tokens,
            completion_tokens = stats.usage.completion_tokens,
            "engine stats"
        );
    }

    /// Release resources held by this instance
    fn close(&mut self);
}

/// Builds one engine per invocation
pub trait EngineFactory: Send + Sync {
    fn name(&self) -> &str;

    /// Create a fresh engine, optionally forced onto a specific model
    fn create(&self, forced_model: Option<&str>) -> Result<Box<dyn Engine>>;
}

// ============================================================================
// SCOPED OWNERSHIP
// ============================================================================

/// Owns an engine for the duration of one invocation
///
/// Closing happens exactly once: either through [`EngineGuard::release`]
/// or, if the invocation errors out or its future is dropped, on `Drop`.
pub struct EngineGuard {
    engine: Box<dyn Engine>,
    closed: bool,
    events: Option<(EventLog, u64)>,
}

impl EngineGuard {
    pub fn new(engine: Box<dyn Engine>) -> Self {
        Self {
            engine,
            closed: false,
            events: None,
        }
    }

    /// Emit `EngineReleased` for `invocation` when closing
    pub fn with_events(mut self, log: EventLog, invocation: u64) -> Self {
        self.events = Some((log, invocation));
        self
    }

    /// Close the engine now
    pub fn release(mut self) {
        self.close_once();
    }

    fn close_once(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.engine.close();
        debug!(engine = self.engine.name(), "engine released");
        if let Some((log, invocation)) = &self.events {
            log.emit(EventKind::EngineReleased {
                invocation: *invocation,
            });
        }
    }
}

impl Deref for EngineGuard {
    type Target = dyn Engine;

    fn deref(&self) -> &Self::Target {
        self.engine.as_ref()
    }
}

impl DerefMut for EngineGuard {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.engine.as_mut()
    }
}

impl Drop for EngineGuard {
    fn drop(&mut self) {
        self.close_once();
    }
}

// ============================================================================
// ENGINE FACTORY
// ============================================================================

/// Create an engine factory by name
///
/// | Name | Description |
/// |------|-------------|
/// | `render` | Renders the prompt, no model call |
/// | `mock` | Testing |
pub fn create_engine_factory(name: &str) -> Result<Arc<dyn EngineFactory>> {
    match name.to_lowercase().as_str() {
        "render" => Ok(Arc::new(RenderEngineFactory)),
        "mock" => Ok(Arc::new(MockEngineFactory::new())),
        _ => anyhow::bail!("Unknown engine: '{}'. Available: render, mock", name),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_usage_estimate() {
        // With ratio 3.0: 300/3 = 100, 150/3 = 50
        let usage = TokenUsage::estimate(300, 150);
        assert_eq!(usage, TokenUsage::new(100, 50));
        assert_eq!(usage.total_tokens, 150);
    }

    #[test]
    fn token_usage_accumulates() {
        let mut usage = TokenUsage::new(1, 2);
        usage.add(TokenUsage::new(3, 4));
        assert_eq!(usage, TokenUsage::new(4, 6));
    }

    #[test]
    fn factory_by_name() {
        assert_eq!(create_engine_factory("render").unwrap().name(), "render");
        assert_eq!(create_engine_factory("MOCK").unwrap().name(), "mock");
        assert!(create_engine_factory("unknown").is_err());
    }

    #[test]
    fn guard_closes_exactly_once() {
        let factory = MockEngineFactory::new();
        let guard = EngineGuard::new(factory.create(None).unwrap());
        guard.release();
        assert_eq!(factory.record().closed, 1);

        let guard = EngineGuard::new(factory.create(None).unwrap());
        drop(guard);
        assert_eq!(factory.record().closed, 2);
        assert_eq!(factory.record().created, 2);
    }

    #[test]
    fn guard_emits_release_event() {
        let log = EventLog::new();
        let factory = MockEngineFactory::new();
        let guard = EngineGuard::new(factory.create(None).unwrap()).with_events(log.clone(), 7);
        drop(guard);
        assert_eq!(log.filter_invocation(7).len(), 1);
    }
}
