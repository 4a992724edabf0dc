//! Reference expressions embedded in attribute values.
//!
//! A string attribute may embed any number of `${type.name.attribute}`
//! expressions. A string made of exactly one expression takes the referenced
//! value with its JSON type; any other string is interpolated. `$${` yields a
//! literal `${`.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use super::model::{Reference, ResourceId};

/// A piece of a parsed string attribute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    /// Literal text.
    Literal(String),
    /// A reference expression.
    Ref(Reference),
}

/// A malformed reference expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemplateError {
    /// The offending expression.
    pub expression: String,
    /// Why it was rejected.
    pub reason: String,
}

/// An attribute value after reference substitution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", content = "value", rename_all = "snake_case")]
pub enum AttributeValue {
    /// Fully resolved.
    Known(Value),
    /// Waiting on values a dependency only produces once it has executed.
    Deferred {
        /// The declared value, references intact.
        template: Value,
        /// References that could not be resolved yet.
        pending: Vec<Reference>,
    },
}

impl fmt::Display for TemplateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.expression, self.reason)
    }
}

impl AttributeValue {
    /// Returns the resolved value, if known.
    #[must_use]
    pub const fn known(&self) -> Option<&Value> {
        match self {
            Self::Known(value) => Some(value),
            Self::Deferred { .. } => None,
        }
    }

    /// Returns true if the value is waiting on a dependency.
    #[must_use]
    pub const fn is_deferred(&self) -> bool {
        matches!(self, Self::Deferred { .. })
    }
}

/// Parses a string attribute into literal and reference segments.
///
/// # Errors
///
/// Returns an error on an unterminated `${` or a malformed expression.
pub fn parse(input: &str) -> Result<Vec<Segment>, TemplateError> {
    let mut segments = Vec::new();
    let mut literal = String::new();
    let mut rest = input;

    while let Some(pos) = rest.find("${") {
        let (before, after) = rest.split_at(pos);
        let body = &after[2..];

        if let Some(kept) = before.strip_suffix('$') {
            literal.push_str(kept);
            literal.push_str("${");
            rest = body;
            continue;
        }

        literal.push_str(before);
        let Some(end) = body.find('}') else {
            return Err(TemplateError {
                expression: after.to_string(),
                reason: String::from("unterminated expression"),
            });
        };

        let reference = parse_reference(body[..end].trim())?;
        if !literal.is_empty() {
            segments.push(Segment::Literal(std::mem::take(&mut literal)));
        }
        segments.push(Segment::Ref(reference));
        rest = &body[end + 1..];
    }

    literal.push_str(rest);
    if !literal.is_empty() || segments.is_empty() {
        segments.push(Segment::Literal(literal));
    }
    Ok(segments)
}

/// Parses the inside of `${...}`.
fn parse_reference(expression: &str) -> Result<Reference, TemplateError> {
    let parts: Vec<&str> = expression.split('.').collect();
    match parts.as_slice() {
        [resource_type, name, attribute]
            if !resource_type.is_empty() && !name.is_empty() && !attribute.is_empty() =>
        {
            Ok(Reference::new(ResourceId::new(*resource_type, *name), *attribute))
        }
        _ => Err(TemplateError {
            expression: format!("${{{expression}}}"),
            reason: String::from("expected TYPE.NAME.ATTRIBUTE"),
        }),
    }
}

/// Collects every reference in a value, at any nesting depth.
///
/// # Errors
///
/// Returns the first malformed expression encountered.
pub fn collect_references(value: &Value) -> Result<Vec<Reference>, TemplateError> {
    let mut found = Vec::new();
    collect_into(value, &mut found)?;
    Ok(found)
}

fn collect_into(value: &Value, found: &mut Vec<Reference>) -> Result<(), TemplateError> {
    match value {
        Value::String(s) => {
            for segment in parse(s)? {
                if let Segment::Ref(reference) = segment {
                    found.push(reference);
                }
            }
        }
        Value::Array(items) => {
            for item in items {
                collect_into(item, found)?;
            }
        }
        Value::Object(map) => {
            for item in map.values() {
                collect_into(item, found)?;
            }
        }
        Value::Null | Value::Bool(_) | Value::Number(_) => {}
    }
    Ok(())
}

/// Substitutes references in `value` using `lookup`.
///
/// `lookup` returns `None` for a value that is not known yet; the whole
/// attribute then stays [`AttributeValue::Deferred`].
///
/// # Errors
///
/// Returns an error on a malformed expression.
pub fn resolve(
    value: &Value,
    lookup: &dyn Fn(&Reference) -> Option<Value>,
) -> Result<AttributeValue, TemplateError> {
    let mut pending = Vec::new();
    let resolved = substitute(value, lookup, &mut pending)?;
    if pending.is_empty() {
        Ok(AttributeValue::Known(resolved))
    } else {
        pending.dedup();
        Ok(AttributeValue::Deferred {
            template: value.clone(),
            pending,
        })
    }
}

fn substitute(
    value: &Value,
    lookup: &dyn Fn(&Reference) -> Option<Value>,
    pending: &mut Vec<Reference>,
) -> Result<Value, TemplateError> {
    match value {
        Value::String(s) => substitute_string(s, lookup, pending),
        Value::Array(items) => items
            .iter()
            .map(|item| substitute(item, lookup, pending))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        Value::Object(map) => {
            let mut out = serde_json::Map::new();
            for (key, item) in map {
                out.insert(key.clone(), substitute(item, lookup, pending)?);
            }
            Ok(Value::Object(out))
        }
        Value::Null | Value::Bool(_) | Value::Number(_) => Ok(value.clone()),
    }
}

fn substitute_string(
    s: &str,
    lookup: &dyn Fn(&Reference) -> Option<Value>,
    pending: &mut Vec<Reference>,
) -> Result<Value, TemplateError> {
    let segments = parse(s)?;

    if let [Segment::Ref(reference)] = segments.as_slice() {
        return Ok(lookup(reference).unwrap_or_else(|| {
            pending.push(reference.clone());
            Value::Null
        }));
    }

    let mut out = String::new();
    for segment in segments {
        match segment {
            Segment::Literal(text) => out.push_str(&text),
            Segment::Ref(reference) => match lookup(&reference) {
                Some(Value::String(text)) => out.push_str(&text),
                Some(Value::Null) => {}
                Some(other) => out.push_str(&other.to_string()),
                None => pending.push(reference),
            },
        }
    }
    Ok(Value::String(out))
}
