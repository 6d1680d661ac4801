//! Query template compiler with caching
//!
//! A query template mixes literal prompt text with two kinds of holes:
//! - `{{name}}` - input reference, filled from the bound query kwargs
//! - `[NAME]` - output hole, filled by the engine
//!
//! `[[` and `]]` escape literal brackets. Templates are tokenized once
//! and cached; compiled templates share tokens through `Arc`.

use std::sync::Arc;

use dashmap::DashMap;
use once_cell::sync::Lazy;

use crate::error::{QueryError, Result};
use crate::value::Kwargs;

/// Token representing a parsed template fragment
#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    /// Literal text (escapes already applied)
    Literal(String),
    /// Input reference: {{name}}
    Input(String),
    /// Output hole: [NAME]
    Output(String),
}

/// Tokenizer with a per-source cache
pub struct TemplateCache {
    cache: DashMap<String, Arc<Vec<Token>>>,
}

impl Default for TemplateCache {
    fn default() -> Self {
        Self::new()
    }
}

impl TemplateCache {
    pub fn new() -> Self {
        Self {
            cache: DashMap::new(),
        }
    }

    /// Parse template into tokens (with caching)
    pub fn tokenize(&self, source: &str) -> Result<Arc<Vec<Token>>> {
        if let Some(cached) = self.cache.get(source) {
            return Ok(Arc::clone(&cached));
        }

        let tokens = Arc::new(tokenize_uncached(source)?);
        self.cache.insert(source.to_string(), Arc::clone(&tokens));
        Ok(tokens)
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }
}

/// Global template cache instance
static TEMPLATE_CACHE: Lazy<TemplateCache> = Lazy::new(TemplateCache::new);

fn tokenize_uncached(source: &str) -> Result<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut literal = String::new();
    let mut chars = source.char_indices().peekable();

    while let Some((i, ch)) = chars.next() {
        let next = chars.peek().map(|(_, c)| *c);
        match (ch, next) {
            ('{', Some('{')) => {
                chars.next();
                let (name, _) = read_until(source, i + 2, "}}").ok_or_else(|| {
                    QueryError::TemplateParse {
                        position: i,
                        details: "unclosed '{{'".to_string(),
                    }
                })?;
                let name = hole_name(name, i)?;
                skip_to(&mut chars, i + 2 + name.raw_len + 2);
                flush(&mut tokens, &mut literal);
                tokens.push(Token::Input(name.ident));
            }
            ('[', Some('[')) | (']', Some(']')) => {
                chars.next();
                literal.push(ch);
            }
            ('[', _) => {
                let (name, _) = read_until(source, i + 1, "]").ok_or_else(|| {
                    QueryError::TemplateParse {
                        position: i,
                        details: "unclosed '['".to_string(),
                    }
                })?;
                let name = hole_name(name, i)?;
                skip_to(&mut chars, i + 1 + name.raw_len + 1);
                flush(&mut tokens, &mut literal);
                tokens.push(Token::Output(name.ident));
            }
            (']', _) => {
                return Err(QueryError::TemplateParse {
                    position: i,
                    details: "unmatched ']' (write ']]' for a literal bracket)".to_string(),
                })
            }
            _ => literal.push(ch),
        }
    }

    flush(&mut tokens, &mut literal);
    Ok(tokens)
}

struct HoleName {
    ident: String,
    raw_len: usize,
}

fn hole_name(raw: &str, position: usize) -> Result<HoleName> {
    let ident = raw.trim();
    let valid = ident
        .chars()
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && ident.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
    if !valid {
        return Err(QueryError::TemplateParse {
            position,
            details: format!("invalid variable name '{}'", ident),
        });
    }
    Ok(HoleName {
        ident: ident.to_string(),
        raw_len: raw.len(),
    })
}

fn read_until<'a>(source: &'a str, start: usize, close: &str) -> Option<(&'a str, usize)> {
    source[start..]
        .find(close)
        .map(|offset| (&source[start..start + offset], start + offset))
}

fn skip_to(chars: &mut std::iter::Peekable<std::str::CharIndices>, end: usize) {
    while chars.peek().is_some_and(|(i, _)| *i < end) {
        chars.next();
    }
}

fn flush(tokens: &mut Vec<Token>, literal: &mut String) {
    if !literal.is_empty() {
        tokens.push(Token::Literal(std::mem::take(literal)));
    }
}

/// A query template compiled into tokens
#[derive(Debug, Clone)]
pub struct CompiledTemplate {
    name: String,
    source: Arc<str>,
    tokens: Arc<Vec<Token>>,
}

impl CompiledTemplate {
    /// Compile using the global cache
    pub fn compile(name: impl Into<String>, source: &str) -> Result<Self> {
        Self::compile_with(&TEMPLATE_CACHE, name, source)
    }

    pub fn compile_with(cache: &TemplateCache, name: impl Into<String>, source: &str) -> Result<Self> {
        Ok(Self {
            name: name.into(),
            source: Arc::from(source),
            tokens: cache.tokenize(source)?,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn tokens(&self) -> &[Token] {
        &self.tokens
    }

    /// Input references in first-use order, deduplicated
    pub fn inputs(&self) -> Vec<String> {
        self.collect(|t| match t {
            Token::Input(n) => Some(n),
            _ => None,
        })
    }

    /// Output holes in first-use order, deduplicated
    pub fn outputs(&self) -> Vec<String> {
        self.collect(|t| match t {
            Token::Output(n) => Some(n),
            _ => None,
        })
    }

    fn collect<'a>(&'a self, pick: impl Fn(&'a Token) -> Option<&'a String>) -> Vec<String> {
        let mut names: Vec<String> = Vec::new();
        for name in self.tokens.iter().filter_map(pick) {
            if !names.contains(name) {
                names.push(name.clone());
            }
        }
        names
    }

    /// Render the prompt text
    ///
    /// Inputs come from `inputs`; output holes are filled from `outputs`
    /// when present and otherwise kept as `[NAME]`. Missing inputs render
    /// empty.
    pub fn render(&self, inputs: &Kwargs, outputs: &Kwargs) -> String {
        let mut result = String::with_capacity(self.source.len() * 2);
        for token in self.tokens.iter() {
            match token {
                Token::Literal(text) => result.push_str(text),
                Token::Input(name) => {
                    if let Some(value) = inputs.get(name) {
                        result.push_str(&value.to_prompt_text());
                    }
                }
                Token::Output(name) => match outputs.get(name) {
                    Some(value) => result.push_str(&value.to_prompt_text()),
                    None => {
                        result.push('[');
                        result.push_str(name);
                        result.push(']');
                    }
                },
            }
        }
        result
    }
}
