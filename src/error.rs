//! Error types with fix suggestions
//!
//! Every failure a query call can surface is a [`QueryError`] variant.
//! Variants carry a stable `QB-xxx` code so CLI output and logs can be
//! grepped without depending on message wording.

use thiserror::Error;

/// Trait for errors that provide fix suggestions
pub trait FixSuggestion {
    fn fix_suggestion(&self) -> Option<&str>;
}

pub type Result<T, E = QueryError> = std::result::Result<T, E>;

#[derive(Error, Debug)]
pub enum QueryError {
    // ─────────────────────────────────────────────────────────────
    // Binding errors (QB-010 to QB-014)
    // ─────────────────────────────────────────────────────────────
    #[error("QB-010: Cannot call query function '{query}' without a function context")]
    MissingContext { query: String },

    /// Positional/keyword arguments do not fit the signature.
    /// The message already carries the call site and expected signature.
    #[error("QB-011: {message}")]
    SignatureBinding { message: String },

    /// Raised by a scope when a single lookup misses every tier.
    #[error("QB-012: Failed to resolve value of variable '{name}' in query function '{query}'")]
    Unresolved { name: String, query: String },

    #[error("QB-013: Failed to resolve variable '{name}' in query.")]
    UnresolvedVariable { name: String },

    #[error("QB-014: Failed to resolve variables in query: {}", quoted_list(names))]
    UnresolvedVariables { names: Vec<String> },

    // ─────────────────────────────────────────────────────────────
    // Execution errors (QB-020 to QB-021)
    // ─────────────────────────────────────────────────────────────
    #[error("QB-020: Engine error: {0}")]
    Engine(String),

    #[error("QB-021: Postprocessor '{name}' failed: {reason}")]
    Postprocess { name: String, reason: String },

    // ─────────────────────────────────────────────────────────────
    // Definition errors (QB-030 to QB-033)
    // ─────────────────────────────────────────────────────────────
    #[error("QB-030: Invalid signature at position {position}: {details}")]
    SignatureParse { position: usize, details: String },

    #[error("QB-031: Template parse error at position {position}: {details}")]
    TemplateParse { position: usize, details: String },

    #[error("QB-032: Invalid query definition: {reason}")]
    Definition { reason: String },

    #[error("QB-033: Configuration error: {reason}")]
    Config { reason: String },

    #[error("YAML parse error: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl QueryError {
    /// Stable error code (e.g. `QB-013`), if the variant has one
    pub fn code(&self) -> Option<&'static str> {
        match self {
            Self::MissingContext { .. } => Some("QB-010"),
            Self::SignatureBinding { .. } => Some("QB-011"),
            Self::Unresolved { .. } => Some("QB-012"),
            Self::UnresolvedVariable { .. } => Some("QB-013"),
            Self::UnresolvedVariables { .. } => Some("QB-014"),
            Self::Engine(_) => Some("QB-020"),
            Self::Postprocess { .. } => Some("QB-021"),
            Self::SignatureParse { .. } => Some("QB-030"),
            Self::TemplateParse { .. } => Some("QB-031"),
            Self::Definition { .. } => Some("QB-032"),
            Self::Config { .. } => Some("QB-033"),
            Self::YamlParse(_) | Self::Io(_) => None,
        }
    }

    /// True for errors detected before any engine was created
    pub fn is_binding_error(&self) -> bool {
        matches!(
            self,
            Self::MissingContext { .. }
                | Self::SignatureBinding { .. }
                | Self::Unresolved { .. }
                | Self::UnresolvedVariable { .. }
                | Self::UnresolvedVariables { .. }
        )
    }
}

impl From<anyhow::Error> for QueryError {
    fn from(e: anyhow::Error) -> Self {
        QueryError::Engine(format!("{:#}", e))
    }
}

fn quoted_list(names: &[String]) -> String {
    names
        .iter()
        .map(|n| format!("'{}'", n))
        .collect::<Vec<_>>()
        .join(", ")
}

impl FixSuggestion for QueryError {
    fn fix_suggestion(&self) -> Option<&str> {
        match self {
            QueryError::MissingContext { .. } => {
                Some("Attach a FunctionContext (signature, query parameters, scope) before calling")
            }
            QueryError::SignatureBinding { .. } => {
                Some("Pass arguments matching the query signature shown above")
            }
            QueryError::Unresolved { .. }
            | QueryError::UnresolvedVariable { .. }
            | QueryError::UnresolvedVariables { .. } => Some(
                "Pass the variable as an argument or define it in scope.locals / scope.globals",
            ),
            QueryError::Engine(_) => Some("Check the engine name and model override"),
            QueryError::Postprocess { .. } => Some("Check group_by refers to an output variable"),
            QueryError::SignatureParse { .. } => {
                Some("Use a parameter list like (a, b=2, *rest, c=\"x\", **opts)")
            }
            QueryError::TemplateParse { .. } => {
                Some("Check template syntax: {{name}} for inputs, [NAME] for outputs")
            }
            QueryError::Definition { .. } => Some("Check required fields: name, signature, template"),
            QueryError::Config { .. } => Some("Check ~/.config/qbind/config.toml syntax"),
            QueryError::YamlParse(_) => Some("Check YAML syntax: indentation and quoting"),
            QueryError::Io(_) => Some("Check file path and permissions"),
        }
    }
}
