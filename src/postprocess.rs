//! Result postprocessors
//!
//! Engine results pass through [`ConditionalDistribution`] first,
//! unconditionally, then through the query's declared postprocessors in
//! declaration order. Each stage waits for the previous one.

use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;

use crate::engine::{DistributionRequest, Engine};
use crate::error::{QueryError, Result};
use crate::result::{Candidate, QueryResult, Results};
use crate::sink::SharedSink;

/// A named transform over query results
#[async_trait]
pub trait Postprocessor: Send + Sync + fmt::Debug {
    fn name(&self) -> &str;

    async fn process(&self, results: Results, sink: Option<&SharedSink>) -> Result<Results>;
}

/// Normalises scored distributions produced by the engine
///
/// When the engine scored a variable over candidates, each result's
/// log-probabilities become probabilities (softmax) and the variable is
/// set to the most likely candidate. Without a request this is a no-op.
#[derive(Debug, Clone, Default)]
pub struct ConditionalDistribution {
    request: Option<DistributionRequest>,
}

impl ConditionalDistribution {
    pub fn from_engine(engine: &dyn Engine) -> Self {
        Self {
            request: engine.distribution_request(),
        }
    }

    pub async fn process(&self, results: Results) -> Result<Results> {
        let Some(request) = &self.request else {
            return Ok(results);
        };

        match results {
            Results::List(items) => items
                .into_iter()
                .map(|mut result| -> Result<QueryResult> {
                    let distribution = result.distribution.as_mut().ok_or_else(|| {
                        QueryError::Postprocess {
                            name: "distribution".to_string(),
                            reason: format!(
                                "engine returned no scores for '{}'",
                                request.variable
                            ),
                        }
                    })?;
                    if !distribution.normalized {
                        softmax(&mut distribution.candidates);
                        distribution.normalized = true;
                    }
                    if let Some(best) = distribution.argmax() {
                        let value = best.value.clone();
                        result.variables.insert(request.variable.clone(), value);
                    }
                    Ok(result)
                })
                .collect::<Result<Vec<_>>>()
                .map(Results::List),
            Results::Grouped(_) => Err(QueryError::Postprocess {
                name: "distribution".to_string(),
                reason: "cannot score grouped results".to_string(),
            }),
        }
    }
}

fn softmax(candidates: &mut [Candidate]) {
    let max = candidates
        .iter()
        .map(|c| c.score)
        .fold(f64::NEG_INFINITY, f64::max);
    if !max.is_finite() {
        return;
    }
    let total: f64 = candidates.iter().map(|c| (c.score - max).exp()).sum();
    for c in candidates.iter_mut() {
        c.score = (c.score - max).exp() / total;
    }
}

/// Groups a result list by the value of one variable
///
/// Group keys are the prompt text of the value (`null` when missing).
#[derive(Debug, Clone)]
pub struct GroupBy {
    variable: String,
}

impl GroupBy {
    pub fn new(variable: impl Into<String>) -> Self {
        Self {
            variable: variable.into(),
        }
    }

    pub fn variable(&self) -> &str {
        &self.variable
    }
}

#[async_trait]
impl Postprocessor for GroupBy {
    fn name(&self) -> &str {
        "group_by"
    }

    async fn process(&self, results: Results, sink: Option<&SharedSink>) -> Result<Results> {
        let items = match results {
            Results::List(items) => items,
            Results::Grouped(_) => {
                return Err(QueryError::Postprocess {
                    name: self.name().to_string(),
                    reason: "results are already grouped".to_string(),
                })
            }
        };

        let mut groups: BTreeMap<String, Vec<_>> = BTreeMap::new();
        for result in items {
            let key = match result.variable(&self.variable) {
                Some(value) if !value.is_null() => value.to_prompt_text(),
                _ => "null".to_string(),
            };
            groups.entry(key).or_default().push(result);
        }

        if let Some(sink) = sink {
            for (key, members) in &groups {
                sink.write(&format!("{}={}: {} result(s)", self.variable, key, members.len()));
            }
        }

        Ok(Results::Grouped(groups))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{EngineFactory, MockEngineFactory};
    use crate::result::Distribution;
    use crate::sink::BufferSink;
    use crate::value::Value;
    use std::sync::Arc;

    fn results(keys: &[Option<&str>]) -> Results {
        Results::List(
            keys.iter()
                .enumerate()
                .map(|(i, key)| {
                    let r = QueryResult::new(i.to_string());
                    match key {
                        Some(k) => r.with_variable("LABEL", *k),
                        None => r,
                    }
                })
                .collect(),
        )
    }

    #[tokio::test]
    async fn group_by_groups_and_reports() {
        let buffer = BufferSink::new();
        let sink: SharedSink = Arc::new(buffer.clone());
        let grouped = GroupBy::new("LABEL")
            .process(results(&[Some("a"), Some("b"), Some("a"), None]), Some(&sink))
            .await
            .unwrap();

        match grouped {
            Results::Grouped(groups) => {
                assert_eq!(groups["a"].len(), 2);
                assert_eq!(groups["b"].len(), 1);
                assert_eq!(groups["null"].len(), 1);
            }
            other => panic!("expected groups, got {other:?}"),
        }
        assert_eq!(buffer.lines().len(), 3);
    }

    #[tokio::test]
    async fn group_by_rejects_grouped_input() {
        let once = GroupBy::new("LABEL")
            .process(results(&[Some("a")]), None)
            .await
            .unwrap();
        assert!(GroupBy::new("LABEL").process(once, None).await.is_err());
    }

    #[tokio::test]
    async fn distribution_without_request_is_identity() {
        let input = results(&[Some("a")]);
        let output = ConditionalDistribution::default()
            .process(input.clone())
            .await
            .unwrap();
        assert_eq!(input, output);
    }

    #[tokio::test]
    async fn distribution_normalizes_and_picks_argmax() {
        let factory = MockEngineFactory::new().with_distribution(
            "LABEL",
            vec![(Value::from("pos"), -0.1), (Value::from("neg"), -2.0)],
        );
        let engine = factory.create(None).unwrap();
        let step = ConditionalDistribution::from_engine(engine.as_ref());

        let scored = QueryResult::new("p").with_distribution(Distribution::from_logprobs(
            "LABEL",
            vec![(Value::from("pos"), -0.1), (Value::from("neg"), -2.0)],
        ));
        let out = step.process(Results::single(scored)).await.unwrap();
        let first = out.first().unwrap();

        assert_eq!(first.variable("LABEL"), Some(&Value::from("pos")));
        let dist = first.distribution.as_ref().unwrap();
        assert!(dist.normalized);
        let total: f64 = dist.candidates.iter().map(|c| c.score).sum();
        assert!((total - 1.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn distribution_requires_scores() {
        let factory = MockEngineFactory::new().with_distribution("LABEL", vec![]);
        let engine = factory.create(None).unwrap();
        let step = ConditionalDistribution::from_engine(engine.as_ref());
        assert!(step.process(results(&[Some("a")])).await.is_err());
    }
}
