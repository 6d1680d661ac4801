//! Mock engine for testing
//!
//! Returns configurable results without calling any model, and records
//! every engine it creates so tests can assert on the lifecycle
//! (how many engines were built, closed, what they received).

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;

use super::{template_inputs, DistributionRequest, Engine, EngineFactory, EngineStats, TokenUsage};
use crate::result::{Distribution, QueryResult, Results};
use crate::sink::{sink_from_value, OUTPUT_WRITER_ARG};
use crate::template::CompiledTemplate;
use crate::value::{Kwargs, Value};

/// What every engine from one factory did
#[derive(Debug, Clone, Default)]
pub struct MockRecord {
    pub created: usize,
    pub closed: usize,
    /// Forced model per created engine
    pub forced_models: Vec<Option<String>>,
    /// Runtime kwargs per `set_extra_args` call
    pub extra_args: Vec<Kwargs>,
    /// Query kwargs per `run` call
    pub runs: Vec<Kwargs>,
}

#[derive(Debug, Clone)]
enum Outcome {
    Outputs(Kwargs),
    Fail(String),
}

#[derive(Debug, Default)]
struct Shared {
    record: Mutex<MockRecord>,
    /// Queue of outcomes (FIFO); empty queue → default outputs
    outcomes: Mutex<VecDeque<Outcome>>,
}

/// Factory producing [`MockEngine`]s that share one record
#[derive(Debug, Clone, Default)]
pub struct MockEngineFactory {
    shared: Arc<Shared>,
    default_output: Option<String>,
    delay: Option<Duration>,
    distribution: Option<(String, Vec<(Value, f64)>)>,
}

impl MockEngineFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Text written into output holes when no outcome is queued
    pub fn with_default(mut self, response: impl Into<String>) -> Self {
        self.default_output = Some(response.into());
        self
    }

    /// Sleep inside `run` (for cancellation and concurrency tests)
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Score `variable` over candidates with the given log-probabilities
    pub fn with_distribution(mut self, variable: impl Into<String>, logprobs: Vec<(Value, f64)>) -> Self {
        self.distribution = Some((variable.into(), logprobs));
        self
    }

    /// Queue output values for the next run
    pub fn queue_outputs(&self, outputs: Kwargs) {
        self.shared.outcomes.lock().push_back(Outcome::Outputs(outputs));
    }

    /// Make the next run fail
    pub fn queue_failure(&self, message: impl Into<String>) {
        self.shared.outcomes.lock().push_back(Outcome::Fail(message.into()));
    }

    pub fn record(&self) -> MockRecord {
        self.shared.record.lock().clone()
    }
}

impl EngineFactory for MockEngineFactory {
    fn name(&self) -> &str {
        "mock"
    }

    fn create(&self, forced_model: Option<&str>) -> Result<Box<dyn Engine>> {
        {
            let mut record = self.shared.record.lock();
            record.created += 1;
            record.forced_models.push(forced_model.map(str::to_string));
        }
        Ok(Box::new(MockEngine {
            factory: self.clone(),
            model: forced_model.map(str::to_string),
            extra_args: Kwargs::new(),
            stats: EngineStats::default(),
        }))
    }
}

pub struct MockEngine {
    factory: MockEngineFactory,
    model: Option<String>,
    extra_args: Kwargs,
    stats: EngineStats,
}

#[async_trait]
impl Engine for MockEngine {
    fn name(&self) -> &str {
        "mock"
    }

    fn model(&self) -> Option<&str> {
        self.model.as_deref()
    }

    fn set_extra_args(&mut self, args: Kwargs) {
        self.factory.shared.record.lock().extra_args.push(args.clone());
        self.extra_args = args;
    }

    async fn run(&mut self, template: &CompiledTemplate, query_kwargs: Kwargs) -> Result<Results> {
        self.factory
            .shared
            .record
            .lock()
            .runs
            .push(query_kwargs.clone());

        if let Some(delay) = self.factory.delay {
            tokio::time::sleep(delay).await;
        }

        let outcome = self.factory.shared.outcomes.lock().pop_front();
        let mut outputs = match outcome {
            Some(Outcome::Fail(message)) => anyhow::bail!(message),
            Some(Outcome::Outputs(outputs)) => outputs,
            None => Kwargs::new(),
        };
        let default_output = self
            .factory
            .default_output
            .as_deref()
            .unwrap_or("Mock response");
        for name in template.outputs() {
            outputs
                .entry(name)
                .or_insert_with(|| Value::from(default_output));
        }

        let prompt = template.render(&template_inputs(query_kwargs), &outputs);
        if let Some(sink) = self.extra_args.get(OUTPUT_WRITER_ARG).and_then(sink_from_value) {
            sink.write(&prompt);
        }

        let mut result = QueryResult::new(prompt.clone());
        result.variables = outputs;
        if let Some((variable, logprobs)) = &self.factory.distribution {
            result = result.with_distribution(Distribution::from_logprobs(variable.clone(), logprobs.clone()));
        }

        self.stats.runs += 1;
        self.stats.results += 1;
        self.stats
            .usage
            .add(TokenUsage::estimate(template.source().len(), prompt.len()));

        Ok(Results::single(result))
    }

    fn distribution_request(&self) -> Option<DistributionRequest> {
        self.factory
            .distribution
            .as_ref()
            .map(|(variable, logprobs)| DistributionRequest {
                variable: variable.clone(),
                candidates: logprobs.iter().map(|(v, _)| v.clone()).collect(),
            })
    }

    fn stats(&self) -> EngineStats {
        self.stats
    }

    fn close(&mut self) {
        self.factory.shared.record.lock().closed += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn template() -> CompiledTemplate {
        CompiledTemplate::compile("greet", "Hello {{name}}: [REPLY]").unwrap()
    }

    fn kwargs(name: &str) -> Kwargs {
        Kwargs::from([("name".to_string(), Value::from(name))])
    }

    #[tokio::test]
    async fn mock_default_response() {
        let factory = MockEngineFactory::new();
        let mut engine = factory.create(None).unwrap();
        let results = engine.run(&template(), kwargs("Ada")).await.unwrap();

        let first = results.first().unwrap();
        assert_eq!(first.prompt, "Hello Ada: Mock response");
        assert_eq!(first.variable("REPLY"), Some(&Value::from("Mock response")));
    }

    #[tokio::test]
    async fn mock_queued_outcomes() {
        let factory = MockEngineFactory::new().with_default("fallback");
        factory.queue_outputs(Kwargs::from([("REPLY".to_string(), Value::from("first"))]));
        factory.queue_failure("rate limited");

        let mut engine = factory.create(Some("small")).unwrap();
        let first = engine.run(&template(), kwargs("a")).await.unwrap();
        assert_eq!(first.first().unwrap().prompt, "Hello a: first");

        let err = engine.run(&template(), kwargs("b")).await.unwrap_err();
        assert_eq!(err.to_string(), "rate limited");

        let third = engine.run(&template(), kwargs("c")).await.unwrap();
        assert_eq!(third.first().unwrap().prompt, "Hello c: fallback");
        assert_eq!(engine.model(), Some("small"));
    }

    #[tokio::test]
    async fn mock_records_lifecycle() {
        let factory = MockEngineFactory::new();
        let mut engine = factory.create(None).unwrap();
        engine.set_extra_args(Kwargs::from([("temperature".to_string(), Value::Float(0.1))]));
        engine.run(&template(), kwargs("x")).await.unwrap();
        engine.close();

        let record = factory.record();
        assert_eq!(record.created, 1);
        assert_eq!(record.closed, 1);
        assert_eq!(record.runs.len(), 1);
        assert!(record.extra_args[0].contains_key("temperature"));
        assert_eq!(engine.stats().runs, 1);
        assert!(engine.stats().usage.total_tokens > 0);
    }
}
