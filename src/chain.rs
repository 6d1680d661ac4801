//! Chaining adapter
//!
//! Exposes a [`QueryFunction`] as a step that maps named inputs to named
//! outputs, so queries can be composed by an outer pipeline.

use std::sync::Arc;

use futures::future::try_join_all;
use tracing::debug;

use crate::error::Result;
use crate::query::QueryFunction;
use crate::value::{CallArgs, Kwargs, Value};

#[derive(Debug, Clone)]
pub struct ChainAdapter {
    query: Arc<QueryFunction>,
    output_keys: Vec<String>,
}

impl ChainAdapter {
    /// `output_keys` default to the query's declared output variables
    pub fn new(query: Arc<QueryFunction>, output_keys: Option<Vec<String>>) -> Self {
        let output_keys = output_keys.unwrap_or_else(|| query.output_keys().to_vec());
        Self { query, output_keys }
    }

    pub fn query(&self) -> &QueryFunction {
        &self.query
    }

    pub fn input_keys(&self) -> Vec<String> {
        self.query.input_keys()
    }

    pub fn output_keys(&self) -> &[String] {
        &self.output_keys
    }

    /// Call the query with keyword inputs and project the first result
    ///
    /// Output keys the result lacks map to `Null`.
    pub async fn call(&self, inputs: Kwargs) -> Result<Kwargs> {
        let results = self.query.call(CallArgs::from_kwargs(inputs)).await?;
        let first = results.first();
        debug!(
            query = self.query.name(),
            results = results.len(),
            "chain step finished"
        );

        Ok(self
            .output_keys
            .iter()
            .map(|key| {
                let value = first
                    .and_then(|r| r.variable(key))
                    .cloned()
                    .unwrap_or(Value::Null);
                (key.clone(), value)
            })
            .collect())
    }

    /// Run one call per input concurrently; the first error wins
    pub async fn apply(&self, inputs: Vec<Kwargs>) -> Result<Vec<Kwargs>> {
        try_join_all(inputs.into_iter().map(|input| self.call(input))).await
    }
}
