//! Argument binding for query functions
//!
//! Splits one call into the kwargs the compiled template consumes
//! (query parameters) and the kwargs the engine consumes (runtime
//! parameters), filling query parameters from defaults, the call site
//! and finally the captured [`VariableScope`].
//!
//! Resolution failures are collected, not short-circuited, so one call
//! reports every unresolved name at once.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use tracing::{debug, trace};

use crate::error::{QueryError, Result};
use crate::scope::{OnMissing, VariableScope};
use crate::signature::{BindError, Signature};
use crate::value::{CallArgs, Kwargs, Value};

/// Signature, query parameters and captured scope of one query function
#[derive(Clone)]
pub struct FunctionContext {
    pub signature: Signature,
    /// Names consumed by the compiled template
    pub query_params: Vec<String>,
    pub scope: Arc<dyn VariableScope>,
}

impl FunctionContext {
    pub fn new(
        signature: Signature,
        query_params: impl IntoIterator<Item = impl Into<String>>,
        scope: Arc<dyn VariableScope>,
    ) -> Self {
        let mut seen = BTreeSet::new();
        let query_params = query_params
            .into_iter()
            .map(Into::into)
            .filter(|name: &String| seen.insert(name.clone()))
            .collect();
        Self {
            signature,
            query_params,
            scope,
        }
    }

    pub fn is_query_param(&self, name: &str) -> bool {
        self.query_params.iter().any(|p| p == name)
    }
}

impl fmt::Debug for FunctionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FunctionContext")
            .field("signature", &self.signature.to_string())
            .field("query_params", &self.query_params)
            .finish_non_exhaustive()
    }
}

/// Result of binding: two disjoint kwargs maps
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BoundArguments {
    /// Consumed by the compiled template
    pub query_kwargs: Kwargs,
    /// Handed to the engine as configuration
    pub runtime_kwargs: Kwargs,
}

/// Bind a call to a query function
///
/// `query` names the function in error messages.
pub fn bind(ctx: &FunctionContext, query: &str, args: &CallArgs) -> Result<BoundArguments> {
    let signature = &ctx.signature;

    // Keywords nobody declared go straight to the engine
    let mut runtime_kwargs: Kwargs = args
        .keyword
        .iter()
        .filter(|(k, _)| !signature.contains(k) && !ctx.is_query_param(k))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    let signature_kwargs: Kwargs = args
        .keyword
        .iter()
        .filter(|(k, _)| signature.contains(k))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();

    let mut query_kwargs = Kwargs::new();
    for param in signature.parameters() {
        if let Some(default) = &param.default {
            if ctx.is_query_param(&param.name) {
                query_kwargs.insert(param.name.clone(), default.clone());
            }
        }
    }

    let bound = signature
        .bind(&args.positional, &signature_kwargs)
        .map_err(|e| binding_error(e, query, signature, args))?;

    // Nothing matched the signature: classify the raw keywords directly
    if bound.is_empty() {
        for (k, v) in &args.keyword {
            if ctx.is_query_param(k) {
                query_kwargs.insert(k.clone(), v.clone());
            } else {
                runtime_kwargs.insert(k.clone(), v.clone());
            }
        }
    }

    for (name, value) in bound.iter() {
        if ctx.is_query_param(name) {
            query_kwargs.insert(name.to_string(), value.clone());
        }
    }

    let mut failed = Vec::new();
    for name in &ctx.query_params {
        if query_kwargs.contains_key(name) {
            continue;
        }
        match ctx.scope.resolve(name, OnMissing::Raise) {
            Ok(value) => {
                trace!(variable = %name, "captured from scope");
                query_kwargs.insert(name.clone(), value.unwrap_or(Value::Null));
            }
            Err(e) => {
                debug!(variable = %name, error = %e, "captured variable unresolved");
                failed.push(name.clone());
            }
        }
    }

    match failed.len() {
        0 => Ok(BoundArguments {
            query_kwargs,
            runtime_kwargs,
        }),
        1 => Err(QueryError::UnresolvedVariable {
            name: failed.remove(0),
        }),
        _ => {
            failed.sort();
            Err(QueryError::UnresolvedVariables { names: failed })
        }
    }
}

/// Enrich a signature mismatch with the expected signature and call site
fn binding_error(err: BindError, query: &str, signature: &Signature, args: &CallArgs) -> QueryError {
    let head = match &err {
        BindError::Missing(_) => format!("Call to query function '{}' is {}", query, err),
        _ => err.to_string(),
    };
    QueryError::SignatureBinding {
        message: format!(
            "{}. Expecting {}, but got positional args {} and keyword args {}.",
            head,
            signature,
            Value::List(args.positional.clone()),
            Value::Record(args.keyword.clone()),
        ),
    }
}
