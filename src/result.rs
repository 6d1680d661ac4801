//! Query results as produced by engines and transformed by postprocessors

use std::collections::BTreeMap;

use serde::Serialize;

use crate::value::{Kwargs, Value};

/// One completed prompt
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct QueryResult {
    /// Final prompt text, output holes filled
    pub prompt: String,
    /// Output variables (and anything else the engine chose to report)
    pub variables: Kwargs,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub distribution: Option<Distribution>,
}

impl QueryResult {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            ..Default::default()
        }
    }

    pub fn with_variable(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.variables.insert(name.into(), value.into());
        self
    }

    pub fn with_distribution(mut self, distribution: Distribution) -> Self {
        self.distribution = Some(distribution);
        self
    }

    pub fn variable(&self, name: &str) -> Option<&Value> {
        self.variables.get(name)
    }
}

/// Scores over the candidate values of one variable
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Distribution {
    pub variable: String,
    pub candidates: Vec<Candidate>,
    /// False while `score` holds log-probabilities
    pub normalized: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Candidate {
    pub value: Value,
    pub score: f64,
}

impl Distribution {
    /// Distribution from raw log-probabilities
    pub fn from_logprobs(variable: impl Into<String>, scores: Vec<(Value, f64)>) -> Self {
        Self {
            variable: variable.into(),
            candidates: scores
                .into_iter()
                .map(|(value, score)| Candidate { value, score })
                .collect(),
            normalized: false,
        }
    }

    /// Most likely candidate (first one wins ties)
    pub fn argmax(&self) -> Option<&Candidate> {
        self.candidates.iter().fold(None, |best, c| match best {
            Some(b) if b.score >= c.score => Some(b),
            _ => Some(c),
        })
    }
}

/// Results flowing through the postprocessor chain
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Results {
    List(Vec<QueryResult>),
    Grouped(BTreeMap<String, Vec<QueryResult>>),
}

impl Results {
    pub fn single(result: QueryResult) -> Self {
        Results::List(vec![result])
    }

    /// Number of individual results (across groups)
    pub fn len(&self) -> usize {
        match self {
            Results::List(items) => items.len(),
            Results::Grouped(groups) => groups.values().map(Vec::len).sum(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// First result in list order (or first group's first result)
    pub fn first(&self) -> Option<&QueryResult> {
        match self {
            Results::List(items) => items.first(),
            Results::Grouped(groups) => groups.values().flat_map(|g| g.iter()).next(),
        }
    }

    pub fn as_list(&self) -> Option<&[QueryResult]> {
        match self {
            Results::List(items) => Some(items),
            Results::Grouped(_) => None,
        }
    }
}
