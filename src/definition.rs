//! Query definitions
//!
//! [`QueryDefinition`] is the programmatic way to declare a query
//! function: template source, signature, captured environment and
//! postprocessors. [`QueryFile`] is the YAML form of the same thing.
//!
//! ```yaml
//! name: classify
//! signature: "(text, *, strict=false)"
//! template: "Classify {{text}} for {{audience}}: [LABEL]"
//! group_by: LABEL
//! scope:
//!   locals:
//!     audience: engineers
//! ```

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use serde::Deserialize;
use tracing::debug;

use crate::binder::FunctionContext;
use crate::engine::EngineFactory;
use crate::error::{QueryError, Result};
use crate::postprocess::{GroupBy, Postprocessor};
use crate::query::QueryFunction;
use crate::scope::{BuiltinTable, LexicalContext, Namespace};
use crate::signature::Signature;
use crate::template::CompiledTemplate;
use crate::value::Value;

/// Builder for a [`QueryFunction`]
///
/// The template's input references become the query parameters; its
/// output holes become the output variables unless declared explicitly.
#[derive(Debug, Clone)]
pub struct QueryDefinition {
    name: String,
    source: String,
    signature: Signature,
    output_variables: Option<Vec<String>>,
    postprocessors: Vec<Arc<dyn Postprocessor>>,
    locals: Namespace,
    globals: Namespace,
    builtins: Arc<BuiltinTable>,
}

impl QueryDefinition {
    pub fn new(name: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            source: source.into(),
            signature: Signature::empty(),
            output_variables: None,
            postprocessors: Vec::new(),
            locals: Namespace::new(),
            globals: Namespace::new(),
            builtins: Arc::new(BuiltinTable::standard()),
        }
    }

    pub fn signature(mut self, signature: Signature) -> Self {
        self.signature = signature;
        self
    }

    pub fn output_variables(mut self, names: Vec<String>) -> Self {
        self.output_variables = Some(names);
        self
    }

    pub fn postprocessor(mut self, postprocessor: Arc<dyn Postprocessor>) -> Self {
        self.postprocessors.push(postprocessor);
        self
    }

    pub fn group_by(self, variable: impl Into<String>) -> Self {
        self.postprocessor(Arc::new(GroupBy::new(variable)))
    }

    pub fn locals(mut self, locals: Namespace) -> Self {
        self.locals = locals;
        self
    }

    pub fn globals(mut self, globals: Namespace) -> Self {
        self.globals = globals;
        self
    }

    pub fn builtins(mut self, builtins: Arc<BuiltinTable>) -> Self {
        self.builtins = builtins;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Compile the template and attach the binding context
    pub fn build(self, engine_factory: Arc<dyn EngineFactory>) -> Result<QueryFunction> {
        let template = CompiledTemplate::compile(self.name.clone(), &self.source)?;
        let holes = template.outputs();

        let output_variables = match self.output_variables {
            Some(declared) => {
                if let Some(unknown) = declared.iter().find(|v| !holes.contains(v)) {
                    return Err(QueryError::Definition {
                        reason: format!(
                            "output variable '{}' has no [{}] hole in query '{}'",
                            unknown, unknown, self.name
                        ),
                    });
                }
                declared
            }
            None => holes,
        };

        let query_params = template.inputs();
        debug!(
            query = %self.name,
            signature = %self.signature,
            ?query_params,
            ?output_variables,
            "query defined"
        );

        let scope = LexicalContext::new(self.name.clone(), self.locals, self.globals, self.builtins);
        let context = FunctionContext::new(self.signature, query_params, Arc::new(scope));

        QueryFunction::new(template, output_variables, self.postprocessors, engine_factory)
            .with_context(context)
    }
}

/// Captured environment as written in a query file
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct ScopeDef {
    #[serde(default)]
    pub locals: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub globals: BTreeMap<String, serde_json::Value>,
}

/// A query function parsed from YAML
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct QueryFile {
    pub name: String,
    #[serde(default)]
    pub signature: Option<String>,
    pub template: String,
    #[serde(default)]
    pub output_variables: Option<Vec<String>>,
    #[serde(default)]
    pub group_by: Option<String>,
    #[serde(default)]
    pub scope: ScopeDef,
}

impl QueryFile {
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let file: QueryFile = serde_yaml::from_str(yaml)?;
        if file.name.trim().is_empty() {
            return Err(QueryError::Definition {
                reason: "query name must not be empty".to_string(),
            });
        }
        Ok(file)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let yaml = std::fs::read_to_string(path)?;
        Self::from_yaml(&yaml)
    }

    pub fn into_definition(self) -> Result<QueryDefinition> {
        let signature = match &self.signature {
            Some(text) => Signature::parse(text)?,
            None => Signature::empty(),
        };

        let mut definition = QueryDefinition::new(self.name, self.template)
            .signature(signature)
            .locals(namespace(self.scope.locals))
            .globals(namespace(self.scope.globals));
        if let Some(outputs) = self.output_variables {
            definition = definition.output_variables(outputs);
        }
        if let Some(variable) = self.group_by {
            definition = definition.group_by(variable);
        }
        Ok(definition)
    }
}

fn namespace(values: BTreeMap<String, serde_json::Value>) -> Namespace {
    values.into_iter().map(|(k, v)| (k, Value::from(v))).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::MockEngineFactory;
    use crate::value::CallArgs;
    use pretty_assertions::assert_eq;

    const YAML: &str = r#"
name: classify
signature: "(text, *, strict=false)"
template: "Classify {{text}} for {{audience}}: [LABEL]"
group_by: LABEL
scope:
  locals:
    audience: engineers
  globals:
    audience: everyone
    retries: 3
"#;

    #[test]
    fn parse_query_file() {
        let file = QueryFile::from_yaml(YAML).unwrap();
        assert_eq!(file.name, "classify");
        assert_eq!(file.group_by.as_deref(), Some("LABEL"));
        assert_eq!(file.scope.locals["audience"], serde_json::json!("engineers"));
        assert_eq!(file.scope.globals["retries"], serde_json::json!(3));
    }

    #[test]
    fn empty_name_is_rejected() {
        let err = QueryFile::from_yaml("name: ''\ntemplate: x").unwrap_err();
        assert!(matches!(err, QueryError::Definition { .. }));
    }

    #[test]
    fn missing_template_is_yaml_error() {
        let err = QueryFile::from_yaml("name: q").unwrap_err();
        assert!(matches!(err, QueryError::YamlParse(_)));
    }

    #[test]
    fn bad_signature_is_reported() {
        let file = QueryFile::from_yaml("name: q\nsignature: '(a=1, b)'\ntemplate: x").unwrap();
        assert!(matches!(
            file.into_definition().unwrap_err(),
            QueryError::SignatureParse { .. }
        ));
    }

    #[tokio::test]
    async fn definition_captures_scope() {
        let factory = MockEngineFactory::new().with_default("tech");
        let query = QueryFile::from_yaml(YAML)
            .unwrap()
            .into_definition()
            .unwrap()
            .build(Arc::new(factory.clone()))
            .unwrap();

        assert_eq!(query.output_keys(), ["LABEL".to_string()]);
        assert_eq!(query.input_keys(), vec!["text", "strict"]);

        query.call(CallArgs::new().arg("a bug report")).await.unwrap();
        let run = &factory.record().runs[0];
        assert_eq!(run.get("audience"), Some(&Value::from("engineers")));
    }

    #[test]
    fn declared_outputs_must_exist() {
        let err = QueryDefinition::new("q", "[A]")
            .output_variables(vec!["B".into()])
            .build(Arc::new(MockEngineFactory::new()))
            .unwrap_err();
        assert!(err.to_string().contains("'B'"));
    }

    #[test]
    fn bad_template_is_reported() {
        let err = QueryDefinition::new("q", "{{unclosed")
            .build(Arc::new(MockEngineFactory::new()))
            .unwrap_err();
        assert!(matches!(err, QueryError::TemplateParse { .. }));
    }
}
