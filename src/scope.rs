//! Lexical scope resolution
//!
//! A [`LexicalContext`] is the environment snapshot taken when a query
//! function is defined: local names, module-level names and an explicit
//! [`BuiltinTable`]. Lookups walk the tiers in that order and the first
//! tier that *contains* the name wins, whatever the value is.
//!
//! Uses FxHashMap for namespaces (small string keys, read-only after capture).

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use rustc_hash::FxHashMap;

use crate::error::{QueryError, Result};
use crate::value::Value;

/// What to do when a name is found in no tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OnMissing {
    /// Fail with [`QueryError::Unresolved`]
    #[default]
    Raise,
    /// Return `Ok(None)`
    Ignore,
}

impl FromStr for OnMissing {
    type Err = QueryError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "raise" => Ok(OnMissing::Raise),
            "ignore" => Ok(OnMissing::Ignore),
            other => Err(QueryError::Config {
                reason: format!("on_missing must be 'raise' or 'ignore', got '{}'", other),
            }),
        }
    }
}

impl fmt::Display for OnMissing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OnMissing::Raise => write!(f, "raise"),
            OnMissing::Ignore => write!(f, "ignore"),
        }
    }
}

/// Anything that can resolve a free variable name
pub trait VariableScope: Send + Sync + fmt::Debug {
    fn resolve(&self, name: &str, on_missing: OnMissing) -> Result<Option<Value>>;
}

/// One frozen tier of names
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Namespace {
    names: FxHashMap<String, Value>,
}

impl Namespace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.names.insert(name.into(), value.into());
        self
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.names.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.names.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for Namespace {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            names: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

/// Versioned table of builtin names
///
/// Passed explicitly into every [`LexicalContext`]; there is no ambient
/// process-wide builtin namespace.
#[derive(Debug, Clone, PartialEq)]
pub struct BuiltinTable {
    version: u32,
    names: Namespace,
}

impl BuiltinTable {
    pub const STANDARD_VERSION: u32 = 1;

    pub fn new(version: u32, names: Namespace) -> Self {
        Self { version, names }
    }

    /// Builtins available to every query (version 1)
    pub fn standard() -> Self {
        let names = Namespace::new()
            .with("null", Value::Null)
            .with("true", true)
            .with("false", false)
            .with("pi", std::f64::consts::PI)
            .with("e", std::f64::consts::E)
            .with("inf", f64::INFINITY)
            .with("nan", f64::NAN);
        Self::new(Self::STANDARD_VERSION, names)
    }

    pub fn empty() -> Self {
        Self::new(0, Namespace::new())
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.names.get(name)
    }
}

impl Default for BuiltinTable {
    fn default() -> Self {
        Self::standard()
    }
}

/// Frozen locals → globals → builtins chain captured at definition time
#[derive(Debug, Clone)]
pub struct LexicalContext {
    /// Owning query function (for error messages)
    query: String,
    locals: Namespace,
    globals: Namespace,
    builtins: Arc<BuiltinTable>,
}

impl LexicalContext {
    pub fn new(
        query: impl Into<String>,
        locals: Namespace,
        globals: Namespace,
        builtins: Arc<BuiltinTable>,
    ) -> Self {
        Self {
            query: query.into(),
            locals,
            globals,
            builtins,
        }
    }

    pub fn query(&self) -> &str {
        &self.query
    }

    pub fn builtins_version(&self) -> u32 {
        self.builtins.version()
    }

    /// Find the first tier that contains `name`
    fn lookup(&self, name: &str) -> Option<&Value> {
        self.locals
            .get(name)
            .or_else(|| self.globals.get(name))
            .or_else(|| self.builtins.get(name))
    }
}

impl VariableScope for LexicalContext {
    fn resolve(&self, name: &str, on_missing: OnMissing) -> Result<Option<Value>> {
        match (self.lookup(name), on_missing) {
            (Some(value), _) => Ok(Some(value.clone())),
            (None, OnMissing::Ignore) => Ok(None),
            (None, OnMissing::Raise) => Err(QueryError::Unresolved {
                name: name.to_string(),
                query: self.query.clone(),
            }),
        }
    }
}

/// Scope with no names at all
#[derive(Debug, Clone, Default)]
pub struct EmptyScope {
    query: String,
}

impl EmptyScope {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
        }
    }
}

impl VariableScope for EmptyScope {
    fn resolve(&self, name: &str, on_missing: OnMissing) -> Result<Option<Value>> {
        match on_missing {
            OnMissing::Ignore => Ok(None),
            OnMissing::Raise => Err(QueryError::Unresolved {
                name: name.to_string(),
                query: self.query.clone(),
            }),
        }
    }
}
