//! Render engine
//!
//! Fills input references and returns the prompt without calling a model.
//! Output holes are filled from the `outputs` runtime argument (a record)
//! when given and left as `[NAME]` otherwise. Useful for dry runs.

use anyhow::{bail, Result};
use async_trait::async_trait;
use tracing::debug;

use super::{template_inputs, Engine, EngineFactory, EngineStats, TokenUsage};
use crate::result::{QueryResult, Results};
use crate::sink::{sink_from_value, OUTPUT_WRITER_ARG};
use crate::template::CompiledTemplate;
use crate::value::{Kwargs, Value};

/// Runtime argument holding pre-filled output values
pub const OUTPUTS_ARG: &str = "outputs";

#[derive(Debug, Default, Clone, Copy)]
pub struct RenderEngineFactory;

impl EngineFactory for RenderEngineFactory {
    fn name(&self) -> &str {
        "render"
    }

    fn create(&self, forced_model: Option<&str>) -> Result<Box<dyn Engine>> {
        Ok(Box::new(RenderEngine::new(forced_model)))
    }
}

#[derive(Debug, Default)]
pub struct RenderEngine {
    model: Option<String>,
    extra_args: Kwargs,
    stats: EngineStats,
}

impl RenderEngine {
    pub fn new(model: Option<&str>) -> Self {
        Self {
            model: model.map(str::to_string),
            ..Default::default()
        }
    }
}

#[async_trait]
impl Engine for RenderEngine {
    fn name(&self) -> &str {
        "render"
    }

    fn model(&self) -> Option<&str> {
        self.model.as_deref()
    }

    fn set_extra_args(&mut self, args: Kwargs) {
        debug!(keys = ?args.keys().collect::<Vec<_>>(), "render engine configured");
        self.extra_args = args;
    }

    async fn run(&mut self, template: &CompiledTemplate, query_kwargs: Kwargs) -> Result<Results> {
        let outputs = match self.extra_args.get(OUTPUTS_ARG) {
            Some(Value::Record(fields)) => fields.clone(),
            Some(other) => bail!(
                "runtime argument '{}' must be a record, got {}",
                OUTPUTS_ARG,
                other.type_name()
            ),
            None => Kwargs::new(),
        };

        let prompt = template.render(&template_inputs(query_kwargs), &outputs);
        if let Some(sink) = self
            .extra_args
            .get(OUTPUT_WRITER_ARG)
            .and_then(sink_from_value)
        {
            sink.write(&prompt);
        }

        let mut result = QueryResult::new(prompt.clone());
        for name in template.outputs() {
            let value = outputs.get(&name).cloned().unwrap_or(Value::Null);
            result.variables.insert(name, value);
        }

        self.stats.runs += 1;
        self.stats.results += 1;
        self.stats
            .usage
            .add(TokenUsage::estimate(prompt.len(), 0));

        Ok(Results::single(result))
    }

    fn stats(&self) -> EngineStats {
        self.stats
    }

    fn close(&mut self) {
        self.extra_args.clear();
    }
}
