//! Formal parameter signatures
//!
//! A [`Signature`] is the ordered parameter list of a query function.
//! It is written the way it reads at a call site:
//!
//! ```text
//! (a, b=2, *rest, c="x", **opts)
//! ```
//!
//! Defaults are JSON literals. Parameters after `*` or `*rest` are
//! keyword-only. [`Signature::bind`] applies the usual positional/keyword
//! rules and reports only what the caller actually supplied; defaults are
//! left to the caller to apply.

use std::fmt;

use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

use crate::error::{QueryError, Result};
use crate::value::{Kwargs, Value};

/// Valid parameter identifier
static IDENT_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("valid identifier regex"));

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamKind {
    PositionalOrKeyword,
    /// `*rest` - collects extra positionals into a list
    VarPositional,
    KeywordOnly,
    /// `**opts` - collects extra keywords into a record
    VarKeyword,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Parameter {
    pub name: String,
    pub kind: ParamKind,
    pub default: Option<Value>,
}

impl Parameter {
    pub fn required(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: ParamKind::PositionalOrKeyword,
            default: None,
        }
    }

    pub fn with_default(name: impl Into<String>, default: impl Into<Value>) -> Self {
        Self {
            name: name.into(),
            kind: ParamKind::PositionalOrKeyword,
            default: Some(default.into()),
        }
    }

    pub fn keyword_only(mut self) -> Self {
        self.kind = ParamKind::KeywordOnly;
        self
    }

    pub fn is_variadic(&self) -> bool {
        matches!(self.kind, ParamKind::VarPositional | ParamKind::VarKeyword)
    }
}

/// Why a call does not fit a signature
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BindError {
    #[error("too many positional arguments")]
    TooManyPositional,
    #[error("multiple values for argument '{0}'")]
    MultipleValues(String),
    #[error("got an unexpected keyword argument '{0}'")]
    UnexpectedKeyword(String),
    #[error("missing a required argument: '{0}'")]
    Missing(String),
}

/// Arguments the caller supplied, in parameter order
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BoundArgs {
    arguments: Vec<(String, Value)>,
}

impl BoundArgs {
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.arguments
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.arguments.iter().map(|(n, v)| (n.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.arguments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.arguments.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Signature {
    params: Vec<Parameter>,
}

impl Signature {
    /// Build from parameters, checking ordering rules
    ///
    /// Error positions are byte offsets into the rendered signature.
    pub fn new(params: Vec<Parameter>) -> Result<Self> {
        let sig = Self { params };
        sig.check(&sig.rendered_offsets())?;
        Ok(sig)
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn parameters(&self) -> &[Parameter] {
        &self.params
    }

    pub fn parameter(&self, name: &str) -> Option<&Parameter> {
        self.params.iter().find(|p| p.name == name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.parameter(name).is_some()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.params.iter().map(|p| p.name.as_str())
    }

    /// Parse `(a, b=2, *rest, c="x", **opts)`
    ///
    /// Surrounding parentheses are optional.
    pub fn parse(text: &str) -> Result<Self> {
        let lead = text.len() - text.trim_start().len();
        let trimmed = text.trim();
        let (body, offset) = match trimmed.strip_prefix('(') {
            Some(rest) => match rest.strip_suffix(')') {
                Some(inner) => (inner, lead + 1),
                None => {
                    return Err(QueryError::SignatureParse {
                        position: lead + trimmed.len(),
                        details: "missing closing ')'".to_string(),
                    })
                }
            },
            None => (trimmed, lead),
        };

        let mut params = Vec::new();
        let mut offsets = Vec::new();
        let mut keyword_only = false;
        let mut bare_star = None;

        for (start, piece) in split_top_level(body)? {
            let position = start + offset + (piece.len() - piece.trim_start().len());
            let piece_trimmed = piece.trim();
            if piece_trimmed.is_empty() {
                return Err(QueryError::SignatureParse {
                    position,
                    details: "empty parameter".to_string(),
                });
            }

            if let Some(name) = piece_trimmed.strip_prefix("**") {
                offsets.push(position);
                params.push(Parameter {
                    name: ident(name, position)?,
                    kind: ParamKind::VarKeyword,
                    default: None,
                });
                continue;
            }

            if let Some(name) = piece_trimmed.strip_prefix('*') {
                if keyword_only {
                    return Err(QueryError::SignatureParse {
                        position,
                        details: "'*' may appear only once".to_string(),
                    });
                }
                keyword_only = true;
                if name.trim().is_empty() {
                    bare_star = Some(position);
                } else {
                    offsets.push(position);
                    params.push(Parameter {
                        name: ident(name, position)?,
                        kind: ParamKind::VarPositional,
                        default: None,
                    });
                }
                continue;
            }

            let param = match piece_trimmed.split_once('=') {
                Some((name, literal)) => Parameter::with_default(
                    ident(name, position)?,
                    parse_default(literal, position)?,
                ),
                None => Parameter::required(ident(piece_trimmed, position)?),
            };
            offsets.push(position);
            params.push(if keyword_only { param.keyword_only() } else { param });
        }

        if let Some(position) = bare_star {
            if !params.iter().any(|p| p.kind == ParamKind::KeywordOnly) {
                return Err(QueryError::SignatureParse {
                    position,
                    details: "named arguments must follow bare '*'".to_string(),
                });
            }
        }

        let sig = Self { params };
        sig.check(&offsets)?;
        Ok(sig)
    }

    /// Byte offset of each parameter in the `Display` rendering
    fn rendered_offsets(&self) -> Vec<usize> {
        let mut offsets = vec![0; self.params.len()];
        let mut cursor = 1;
        for (index, text) in self.rendered_parts() {
            if let Some(i) = index {
                offsets[i] = cursor;
            }
            cursor += text.len() + 2;
        }
        offsets
    }

    /// Rendered pieces, tagged with the parameter they render (`*` has none)
    fn rendered_parts(&self) -> Vec<(Option<usize>, String)> {
        let mut parts = Vec::with_capacity(self.params.len() + 1);
        let mut marker_written = false;
        for (i, p) in self.params.iter().enumerate() {
            let text = match p.kind {
                ParamKind::VarPositional => {
                    marker_written = true;
                    format!("*{}", p.name)
                }
                ParamKind::VarKeyword => format!("**{}", p.name),
                ParamKind::KeywordOnly | ParamKind::PositionalOrKeyword => {
                    if p.kind == ParamKind::KeywordOnly && !marker_written {
                        marker_written = true;
                        parts.push((None, "*".to_string()));
                    }
                    match &p.default {
                        Some(d) => format!("{}={}", p.name, d),
                        None => p.name.clone(),
                    }
                }
            };
            parts.push((Some(i), text));
        }
        parts
    }

    /// `offsets[i]` is where parameter `i` starts in the source text
    fn check(&self, offsets: &[usize]) -> Result<()> {
        let mut seen_default = false;
        let mut seen_var_keyword = false;
        let mut seen_var_positional = false;

        for (i, p) in self.params.iter().enumerate() {
            let err = |details: String| QueryError::SignatureParse {
                position: offsets.get(i).copied().unwrap_or_default(),
                details,
            };

            if self.params[..i].iter().any(|q| q.name == p.name) {
                return Err(err(format!("duplicate parameter '{}'", p.name)));
            }
            if seen_var_keyword {
                return Err(err(format!("parameter '{}' follows **kwargs", p.name)));
            }
            match p.kind {
                ParamKind::PositionalOrKeyword => {
                    if seen_var_positional {
                        return Err(err(format!("positional parameter '{}' follows *args", p.name)));
                    }
                    if p.default.is_some() {
                        seen_default = true;
                    } else if seen_default {
                        return Err(err(format!(
                            "non-default parameter '{}' follows default parameter",
                            p.name
                        )));
                    }
                }
                ParamKind::VarPositional => {
                    if seen_var_positional {
                        return Err(err("more than one *args parameter".to_string()));
                    }
                    seen_var_positional = true;
                }
                ParamKind::KeywordOnly => {}
                ParamKind::VarKeyword => seen_var_keyword = true,
            }
            if p.is_variadic() && p.default.is_some() {
                return Err(err(format!("variadic parameter '{}' cannot have a default", p.name)));
            }
        }
        Ok(())
    }

    /// Bind a call against this signature
    ///
    /// Only explicitly supplied arguments appear in the result. An empty
    /// `*rest` or `**opts` is not reported.
    pub fn bind(&self, positional: &[Value], keyword: &Kwargs) -> Result<BoundArgs, BindError> {
        let mut bound = Vec::new();
        let mut remaining = positional.iter();
        let mut consumed_keywords: Vec<&str> = Vec::new();
        let mut extra_keywords = Kwargs::new();

        for param in &self.params {
            match param.kind {
                ParamKind::PositionalOrKeyword => {
                    if let Some(value) = remaining.next() {
                        if keyword.contains_key(&param.name) {
                            return Err(BindError::MultipleValues(param.name.clone()));
                        }
                        bound.push((param.name.clone(), value.clone()));
                    } else if let Some(value) = keyword.get(&param.name) {
                        consumed_keywords.push(param.name.as_str());
                        bound.push((param.name.clone(), value.clone()));
                    } else if param.default.is_none() {
                        return Err(BindError::Missing(param.name.clone()));
                    }
                }
                ParamKind::VarPositional => {
                    let rest: Vec<Value> = remaining.by_ref().cloned().collect();
                    if !rest.is_empty() {
                        bound.push((param.name.clone(), Value::List(rest)));
                    }
                }
                ParamKind::KeywordOnly => {
                    if !remaining.as_slice().is_empty() {
                        return Err(BindError::TooManyPositional);
                    }
                    if let Some(value) = keyword.get(&param.name) {
                        consumed_keywords.push(param.name.as_str());
                        bound.push((param.name.clone(), value.clone()));
                    } else if param.default.is_none() {
                        return Err(BindError::Missing(param.name.clone()));
                    }
                }
                ParamKind::VarKeyword => {
                    if !remaining.as_slice().is_empty() {
                        return Err(BindError::TooManyPositional);
                    }
                }
            }
        }

        if remaining.next().is_some() {
            return Err(BindError::TooManyPositional);
        }

        let var_keyword = self
            .params
            .iter()
            .find(|p| p.kind == ParamKind::VarKeyword);

        for (name, value) in keyword {
            if consumed_keywords.contains(&name.as_str()) {
                continue;
            }
            match (self.parameter(name), var_keyword) {
                // Named a positional parameter that already took a positional value
                (Some(p), _) if p.kind == ParamKind::PositionalOrKeyword => {
                    return Err(BindError::MultipleValues(name.clone()));
                }
                (Some(p), None) if p.is_variadic() => {
                    return Err(BindError::UnexpectedKeyword(name.clone()));
                }
                (_, Some(_)) => {
                    extra_keywords.insert(name.clone(), value.clone());
                }
                (_, None) => return Err(BindError::UnexpectedKeyword(name.clone())),
            }
        }

        if let Some(p) = var_keyword {
            if !extra_keywords.is_empty() {
                bound.push((p.name.clone(), Value::Record(extra_keywords)));
            }
        }

        Ok(BoundArgs { arguments: bound })
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.rendered_parts().into_iter().map(|(_, t)| t).collect();
        write!(f, "({})", parts.join(", "))
    }
}

fn ident(raw: &str, position: usize) -> Result<String> {
    let name = raw.trim();
    if IDENT_PATTERN.is_match(name) {
        Ok(name.to_string())
    } else {
        Err(QueryError::SignatureParse {
            position,
            details: format!("invalid parameter name '{}'", name),
        })
    }
}

fn parse_default(literal: &str, position: usize) -> Result<Value> {
    serde_json::from_str::<serde_json::Value>(literal.trim())
        .map(Value::from)
        .map_err(|e| QueryError::SignatureParse {
            position,
            details: format!("default is not a JSON literal: {}", e),
        })
}

/// Split on commas outside strings, brackets and braces
fn split_top_level(body: &str) -> Result<Vec<(usize, &str)>> {
    let mut pieces = Vec::new();
    if body.trim().is_empty() {
        return Ok(pieces);
    }

    let mut depth = 0i32;
    let mut in_string = false;
    let mut escaped = false;
    let mut start = 0;

    for (i, ch) in body.char_indices() {
        if in_string {
            match ch {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '[' | '{' => depth += 1,
            ']' | '}' => {
                depth -= 1;
                if depth < 0 {
                    return Err(QueryError::SignatureParse {
                        position: i,
                        details: format!("unbalanced '{}'", ch),
                    });
                }
            }
            ',' if depth == 0 => {
                pieces.push((start, &body[start..i]));
                start = i + 1;
            }
            _ => {}
        }
    }

    if in_string || depth != 0 {
        return Err(QueryError::SignatureParse {
            position: body.len(),
            details: "unterminated default literal".to_string(),
        });
    }
    pieces.push((start, &body[start..]));
    Ok(pieces)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kw(pairs: &[(&str, Value)]) -> Kwargs {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn parse_and_display_round_trip_shape() {
        let sig = Signature::parse(r#"(a, b=2, *rest, c="x", **opts)"#).unwrap();
        assert_eq!(sig.parameters().len(), 5);
        assert_eq!(sig.parameter("c").unwrap().kind, ParamKind::KeywordOnly);
        assert_eq!(sig.to_string(), r#"(a, b=2, *rest, c="x", **opts)"#);
    }

    #[test]
    fn bare_star_marks_keyword_only() {
        let sig = Signature::parse("(a, *, flag=false)").unwrap();
        assert_eq!(sig.parameter("flag").unwrap().kind, ParamKind::KeywordOnly);
        assert_eq!(sig.to_string(), "(a, *, flag=false)");
    }

    #[test]
    fn defaults_may_contain_commas() {
        let sig = Signature::parse(r#"(a=[1, 2], b={"k": "x,y"})"#).unwrap();
        assert_eq!(
            sig.parameter("a").unwrap().default,
            Some(Value::List(vec![Value::Int(1), Value::Int(2)]))
        );
    }

    #[test]
    fn parse_rejects_bad_signatures() {
        assert!(Signature::parse("(a=1, b)").is_err());
        assert!(Signature::parse("(a, a)").is_err());
        assert!(Signature::parse("(1a)").is_err());
        assert!(Signature::parse("(**kw, a)").is_err());
        assert!(Signature::parse("(a=nope)").is_err());
        assert!(Signature::parse("(a, ").is_err());
    }

    #[test]
    fn empty_signature() {
        let sig = Signature::parse("()").unwrap();
        assert!(sig.parameters().is_empty());
        assert!(sig.bind(&[], &Kwargs::new()).unwrap().is_empty());
    }

    #[test]
    fn bind_reports_only_supplied_arguments() {
        let sig = Signature::parse("(a, b=2)").unwrap();
        let bound = sig.bind(&[Value::Int(1)], &Kwargs::new()).unwrap();
        assert_eq!(bound.len(), 1);
        assert_eq!(bound.get("a"), Some(&Value::Int(1)));
        assert_eq!(bound.get("b"), None);
    }

    #[test]
    fn bind_errors() {
        let sig = Signature::parse("(a, b=2)").unwrap();
        assert_eq!(
            sig.bind(&[], &Kwargs::new()),
            Err(BindError::Missing("a".into()))
        );
        assert_eq!(
            sig.bind(&[Value::Int(1), Value::Int(2), Value::Int(3)], &Kwargs::new()),
            Err(BindError::TooManyPositional)
        );
        assert_eq!(
            sig.bind(&[Value::Int(1)], &kw(&[("a", Value::Int(1))])),
            Err(BindError::MultipleValues("a".into()))
        );
        assert_eq!(
            sig.bind(&[Value::Int(1)], &kw(&[("z", Value::Int(1))])),
            Err(BindError::UnexpectedKeyword("z".into()))
        );
    }

    #[test]
    fn bind_collects_variadics() {
        let sig = Signature::parse("(a, *rest, **opts)").unwrap();
        let bound = sig
            .bind(
                &[Value::Int(1), Value::Int(2), Value::Int(3)],
                &kw(&[("x", Value::Bool(true))]),
            )
            .unwrap();
        assert_eq!(
            bound.get("rest"),
            Some(&Value::List(vec![Value::Int(2), Value::Int(3)]))
        );
        assert!(matches!(bound.get("opts"), Some(Value::Record(r)) if r.contains_key("x")));
    }

    #[test]
    fn extra_positional_before_keyword_only_is_too_many() {
        let sig = Signature::parse("(a, *, m)").unwrap();
        assert_eq!(
            sig.bind(&[Value::Int(1), Value::Int(2)], &Kwargs::new()),
            Err(BindError::TooManyPositional)
        );

        let sig = Signature::parse("(a, **opts)").unwrap();
        assert_eq!(
            sig.bind(&[Value::Int(1), Value::Int(2)], &Kwargs::new()),
            Err(BindError::TooManyPositional)
        );
    }

    #[test]
    fn bare_star_needs_named_arguments() {
        for text in ["(*)", "(a, *)", "(*, **opts)"] {
            let err = Signature::parse(text).unwrap_err();
            assert!(
                err.to_string().contains("named arguments must follow bare '*'"),
                "{text}: {err}"
            );
        }
    }

    #[test]
    fn parse_errors_report_byte_offsets() {
        // "(a=1, b)": 'b' starts at byte 6
        assert!(matches!(
            Signature::parse("(a=1, b)"),
            Err(QueryError::SignatureParse { position: 6, .. })
        ));
        assert!(matches!(
            Signature::parse("(a,  1a)"),
            Err(QueryError::SignatureParse { position: 5, .. })
        ));
        assert!(matches!(
            Signature::parse("  (a, a)"),
            Err(QueryError::SignatureParse { position: 6, .. })
        ));
    }

    #[test]
    fn new_reports_offsets_in_rendered_form() {
        // Rendered as "(a=1, *, k, k)": the second 'k' starts at byte 12
        let err = Signature::new(vec![
            Parameter::with_default("a", 1),
            Parameter::required("k").keyword_only(),
            Parameter::required("k").keyword_only(),
        ])
        .unwrap_err();
        assert!(matches!(err, QueryError::SignatureParse { position: 12, .. }));
    }

    #[test]
    fn missing_keyword_only_is_reported() {
        let sig = Signature::parse("(*, mode)").unwrap();
        assert_eq!(
            sig.bind(&[], &Kwargs::new()),
            Err(BindError::Missing("mode".into()))
        );
        assert_eq!(BindError::Missing("mode".into()).to_string(), "missing a required argument: 'mode'");
    }
}
