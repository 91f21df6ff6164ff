//! Compiled field-path expressions.
//!
//! Provider configs address values inside JSON documents with expressions of
//! the form `$.usage.input_tokens` or `$.messages[*].content`. Paths are
//! parsed once at config load into a small segment tree and evaluated with a
//! recursive walk, so wildcard extraction returns the full list of matches
//! by construction rather than the first hit.

use serde_json::Value;

use crate::error::{ConfigError, Result};

/// One step of a compiled field path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    /// Object key lookup (`.name`).
    Key(String),
    /// Array index lookup (`[3]`).
    Index(usize),
    /// Array wildcard (`[*]`).
    Wildcard,
}

/// A compiled field-path expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldPath {
    source: String,
    segments: Vec<Segment>,
}

/// Result of evaluating a field path against a document.
#[derive(Debug, Clone, PartialEq)]
pub enum Extracted<'a> {
    /// No segment matched.
    None,
    /// A non-wildcard path resolved to a single leaf.
    Single(&'a Value),
    /// A wildcard path resolved to an ordered list of leaves.
    ///
    /// The list may be empty when the containing collection exists but holds
    /// nothing; that is distinct from `None`.
    Many(Vec<&'a Value>),
}

impl<'a> Extracted<'a> {
    /// Returns the single value, if this is a present non-wildcard match.
    pub fn single(&self) -> Option<&'a Value> {
        match self {
            Extracted::Single(v) => Some(v),
            _ => None,
        }
    }

    /// True when nothing matched (empty wildcard lists are *present*).
    pub fn is_none(&self) -> bool {
        matches!(self, Extracted::None)
    }

    /// Collapses to an owned JSON value: lists become arrays.
    pub fn to_value(&self) -> Option<Value> {
        match self {
            Extracted::None => None,
            Extracted::Single(v) => Some((*v).clone()),
            Extracted::Many(vs) => Some(Value::Array(vs.iter().map(|v| (*v).clone()).collect())),
        }
    }
}

impl FieldPath {
    /// Parses an expression like `$.a.b[0].c[*].d`.
    ///
    /// The leading `$` (optionally `$.`) refers to the document root; a bare
    /// `$` is the identity path.
    pub fn parse(expr: &str) -> Result<Self> {
        let trimmed = expr.trim();
        let rest = trimmed
            .strip_prefix('$')
            .ok_or_else(|| ConfigError::FieldPath {
                expr: expr.to_string(),
                reason: "expression must start with '$'".to_string(),
            })?;

        let mut segments = Vec::new();
        let mut chars = rest.chars().peekable();

        while let Some(&c) = chars.peek() {
            match c {
                '.' => {
                    chars.next();
                    let mut key = String::new();
                    while let Some(&k) = chars.peek() {
                        if k == '.' || k == '[' {
                            break;
                        }
                        key.push(k);
                        chars.next();
                    }
                    if key.is_empty() {
                        return Err(ConfigError::FieldPath {
                            expr: expr.to_string(),
                            reason: "empty key segment".to_string(),
                        }
                        .into());
                    }
                    segments.push(Segment::Key(key));
                }
                '[' => {
                    chars.next();
                    let mut inner = String::new();
                    let mut closed = false;
                    for k in chars.by_ref() {
                        if k == ']' {
                            closed = true;
                            break;
                        }
                        inner.push(k);
                    }
                    if !closed {
                        return Err(ConfigError::FieldPath {
                            expr: expr.to_string(),
                            reason: "unterminated '['".to_string(),
                        }
                        .into());
                    }
                    if inner == "*" {
                        segments.push(Segment::Wildcard);
                    } else {
                        let idx: usize =
                            inner.parse().map_err(|_| ConfigError::FieldPath {
                                expr: expr.to_string(),
                                reason: format!("invalid index '{inner}'"),
                            })?;
                        segments.push(Segment::Index(idx));
                    }
                }
                _ => {
                    return Err(ConfigError::FieldPath {
                        expr: expr.to_string(),
                        reason: format!("unexpected character '{c}'"),
                    }
                    .into());
                }
            }
        }

        Ok(Self {
            source: trimmed.to_string(),
            segments,
        })
    }

    /// The original expression text.
    pub fn source(&self) -> &str {
        &self.source
    }

    /// True when any segment is a wildcard.
    pub fn has_wildcard(&self) -> bool {
        self.segments.iter().any(|s| matches!(s, Segment::Wildcard))
    }

    /// Evaluates the path against a document.
    pub fn eval<'a>(&self, doc: &'a Value) -> Extracted<'a> {
        if self.has_wildcard() {
            let mut out = Vec::new();
            let mut container_found = false;
            collect(doc, &self.segments, &mut out, &mut container_found);
            if !container_found && out.is_empty() {
                return Extracted::None;
            }
            // Nulls and empty strings are noise in wildcard extractions.
            out.retain(|v| !v.is_null() && v.as_str() != Some(""));
            Extracted::Many(out)
        } else {
            match walk_single(doc, &self.segments) {
                Some(v) if !v.is_null() && v.as_str() != Some("") => Extracted::Single(v),
                _ => Extracted::None,
            }
        }
    }
}

fn walk_single<'a>(doc: &'a Value, segments: &[Segment]) -> Option<&'a Value> {
    let mut current = doc;
    for segment in segments {
        current = match segment {
            Segment::Key(k) => current.get(k.as_str())?,
            Segment::Index(i) => current.get(*i)?,
            Segment::Wildcard => unreachable!("wildcard paths use collect()"),
        };
    }
    Some(current)
}

fn collect<'a>(
    doc: &'a Value,
    segments: &[Segment],
    out: &mut Vec<&'a Value>,
    container_found: &mut bool,
) {
    let Some((head, rest)) = segments.split_first() else {
        out.push(doc);
        return;
    };

    match head {
        Segment::Key(k) => {
            if let Some(next) = doc.get(k.as_str()) {
                collect(next, rest, out, container_found);
            }
        }
        Segment::Index(i) => {
            if let Some(next) = doc.get(*i) {
                collect(next, rest, out, container_found);
            }
        }
        Segment::Wildcard => {
            if let Some(arr) = doc.as_array() {
                *container_found = true;
                for item in arr {
                    collect(item, rest, out, container_found);
                }
            }
        }
    }
}
