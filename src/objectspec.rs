//! Parsing of object specifications.
//!
//! [`parse`] turns text into an [`ObjectSpec`] without touching a session. The
//! grammar lives in `objectspec.pest`; query clauses are split and validated
//! here so that a malformed clause surfaces as `QueryClause` instead of a
//! generic syntax error.

use std::fmt;
use std::str::FromStr;

use pest::Parser;
use pest::error::LineColLocation;
use pest::iterators::Pair;
use pest_derive::Parser;
use tracing::trace;

use crate::datatype::{NULL_SENTINEL, is_null, quoted};
use crate::error::{DinoError, Result};

#[derive(Parser)]
#[grammar = "objectspec.pest"]
struct SpecParser;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SpecKind {
    EntityName,
    ElementName,
    ElementId,
    ElementFormId,
    ElementQuery,
    AttributeName,
}

impl SpecKind {
    pub const ALL: &'static [SpecKind] = &[
        SpecKind::EntityName,
        SpecKind::ElementName,
        SpecKind::ElementId,
        SpecKind::ElementFormId,
        SpecKind::ElementQuery,
        SpecKind::AttributeName,
    ];

    /// Kinds that denote elements rather than types or attributes.
    pub const ELEMENTS: &'static [SpecKind] = &[
        SpecKind::ElementName,
        SpecKind::ElementId,
        SpecKind::ElementFormId,
    ];
}

impl fmt::Display for SpecKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SpecKind::EntityName => "EntityName",
            SpecKind::ElementName => "ElementName",
            SpecKind::ElementId => "ElementId",
            SpecKind::ElementFormId => "ElementFormId",
            SpecKind::ElementQuery => "ElementQuery",
            SpecKind::AttributeName => "AttributeName",
        };
        write!(f, "{name}")
    }
}

// ------------- Clauses -------------
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClauseValue {
    Null,
    Text(String),
}

impl fmt::Display for ClauseValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClauseValue::Null => write!(f, "{NULL_SENTINEL}"),
            ClauseValue::Text(t) if t == NULL_SENTINEL || t.contains([';', ']']) || t.trim() != t => {
                write!(f, "'{t}'")
            }
            ClauseValue::Text(t) => write!(f, "{t}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Clause {
    /// Adds an inner join to the named relation or entity type.
    Join(String),
    /// Equality on a property of the queried type, or of a joined one.
    Equals {
        join: Option<String>,
        property: String,
        value: ClauseValue,
    },
}

impl fmt::Display for Clause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Clause::Join(join) => write!(f, "{join}"),
            Clause::Equals { join: Some(join), property, value } => write!(f, "{join}.{property}={value}"),
            Clause::Equals { join: None, property, value } => write!(f, "{property}={value}"),
        }
    }
}

fn is_identifier(text: &str) -> bool {
    let mut chars = text.chars();
    chars.next().is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Splits on `separator` outside single quotes.
fn split_unquoted(text: &str, separator: char) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut in_quotes = false;
    let mut start = 0;
    for (i, c) in text.char_indices() {
        match c {
            '\'' => in_quotes = !in_quotes,
            c if c == separator && !in_quotes => {
                parts.push(&text[start..i]);
                start = i + c.len_utf8();
            }
            _ => {}
        }
    }
    parts.push(&text[start..]);
    parts
}

fn parse_clause(text: &str) -> Result<Clause> {
    let clause = text.trim();
    if clause.is_empty() {
        return Err(DinoError::clause(text, "empty clause"));
    }
    let Some(eq) = clause.find('=') else {
        if is_identifier(clause) {
            return Ok(Clause::Join(clause.to_string()));
        }
        return Err(DinoError::clause(clause, "expected a join name or property=value"));
    };
    let (lhs, rhs) = (clause[..eq].trim(), clause[eq + 1..].trim());
    let (join, property) = match lhs.split_once('.') {
        Some((join, property)) => (Some(join), property),
        None => (None, lhs),
    };
    if join.is_some_and(|j| !is_identifier(j)) || !is_identifier(property) {
        return Err(DinoError::clause(clause, format!("'{lhs}' is not a property reference")));
    }
    if rhs.is_empty() {
        return Err(DinoError::clause(clause, "missing value, quote an empty string as ''"));
    }
    let value = match quoted(rhs) {
        Some(literal) => ClauseValue::Text(literal.to_string()),
        None if is_null(rhs) => ClauseValue::Null,
        None if rhs.contains('\'') => return Err(DinoError::clause(clause, "unbalanced quote in value")),
        None => ClauseValue::Text(rhs.to_string()),
    };
    Ok(Clause::Equals {
        join: join.map(str::to_string),
        property: property.to_string(),
        value,
    })
}

// ------------- Specifications -------------
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ObjectSpec {
    EntityName {
        entity: String,
        /// Trailing `/`: the elements of the type rather than the type.
        instances: bool,
    },
    ElementName {
        entity: String,
        instance_name: String,
    },
    ElementId {
        entity: String,
        id: i64,
    },
    ElementFormId {
        entity: String,
        form_id: u64,
    },
    ElementQuery {
        entity: String,
        clauses: Vec<Clause>,
    },
    AttributeName {
        element: Box<ObjectSpec>,
        property: String,
        /// Trailing `/`: the related elements rather than the attribute handle.
        instances: bool,
    },
}

impl ObjectSpec {
    pub fn kind(&self) -> SpecKind {
        match self {
            ObjectSpec::EntityName { .. } => SpecKind::EntityName,
            ObjectSpec::ElementName { .. } => SpecKind::ElementName,
            ObjectSpec::ElementId { .. } => SpecKind::ElementId,
            ObjectSpec::ElementFormId { .. } => SpecKind::ElementFormId,
            ObjectSpec::ElementQuery { .. } => SpecKind::ElementQuery,
            ObjectSpec::AttributeName { .. } => SpecKind::AttributeName,
        }
    }

    /// The entity type named by the specification, or by its owning element.
    pub fn entity(&self) -> &str {
        match self {
            ObjectSpec::EntityName { entity, .. }
            | ObjectSpec::ElementName { entity, .. }
            | ObjectSpec::ElementId { entity, .. }
            | ObjectSpec::ElementFormId { entity, .. }
            | ObjectSpec::ElementQuery { entity, .. } => entity,
            ObjectSpec::AttributeName { element, .. } => element.entity(),
        }
    }
}

impl fmt::Display for ObjectSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ObjectSpec::EntityName { entity, instances } => {
                write!(f, "{entity}{}", if *instances { "/" } else { "" })
            }
            ObjectSpec::ElementName { entity, instance_name } => {
                let needs_quotes = instance_name.starts_with(['{', '<'])
                    || instance_name
                        .chars()
                        .any(|c| matches!(c, '/' | ',' | '[' | ']' | ';') || c.is_whitespace());
                if needs_quotes {
                    write!(f, "{entity}:'{instance_name}'")
                } else {
                    write!(f, "{entity}:{instance_name}")
                }
            }
            ObjectSpec::ElementId { entity, id } => write!(f, "{entity}:{{{id}}}"),
            ObjectSpec::ElementFormId { entity, form_id } => write!(f, "{entity}:<{form_id}>"),
            ObjectSpec::ElementQuery { entity, clauses } => {
                let clauses: Vec<String> = clauses.iter().map(Clause::to_string).collect();
                write!(f, "{entity}[{}]", clauses.join(";"))
            }
            ObjectSpec::AttributeName {
                element,
                property,
                instances,
            } => write!(f, "{element}/{property}{}", if *instances { "/" } else { "" }),
        }
    }
}

impl FromStr for ObjectSpec {
    type Err = DinoError;

    fn from_str(text: &str) -> Result<Self> {
        parse(text, SpecKind::ALL)
    }
}

/// Parses `text`, accepting only the kinds listed in `expected`.
pub fn parse(text: &str, expected: &[SpecKind]) -> Result<ObjectSpec> {
    let mut pairs = SpecParser::parse(Rule::spec, text.trim()).map_err(|e| {
        let column = match e.line_col {
            LineColLocation::Pos((_, col)) | LineColLocation::Span((_, col), _) => col,
        };
        DinoError::syntax(text, format!("{} at column {column}", e.variant.message()))
    })?;
    let spec = pairs.next().ok_or_else(|| DinoError::syntax(text, "empty input"))?;
    let mut inner = spec.into_inner();
    let first = inner.next().ok_or_else(|| DinoError::syntax(text, "empty input"))?;
    let instances = inner.next().is_some_and(|p| p.as_rule() == Rule::instances);
    let parsed = match first.as_rule() {
        Rule::entity => ObjectSpec::EntityName {
            entity: first.as_str().to_string(),
            instances,
        },
        Rule::attribute_name => build_attribute(text, first)?,
        _ => build_element(text, first)?,
    };
    trace!(%text, kind = %parsed.kind(), "parsed object specification");
    if !expected.contains(&parsed.kind()) {
        return Err(DinoError::SpecificationKindMismatch {
            text: text.to_string(),
            found: parsed.kind().to_string(),
            expected: expected.iter().map(SpecKind::to_string).collect::<Vec<_>>().join(", "),
        });
    }
    Ok(parsed)
}

fn build_attribute(text: &str, pair: Pair<'_, Rule>) -> Result<ObjectSpec> {
    let mut inner = pair.into_inner();
    let owner = inner.next().ok_or_else(|| DinoError::syntax(text, "missing element"))?;
    let property = inner.next().ok_or_else(|| DinoError::syntax(text, "missing property"))?;
    Ok(ObjectSpec::AttributeName {
        element: Box::new(build_element(text, owner)?),
        property: property.as_str().to_string(),
        instances: inner.next().is_some(),
    })
}

fn build_element(text: &str, pair: Pair<'_, Rule>) -> Result<ObjectSpec> {
    let rule = pair.as_rule();
    let mut inner = pair.into_inner();
    let entity = inner
        .next()
        .ok_or_else(|| DinoError::syntax(text, "missing entity name"))?
        .as_str()
        .to_string();
    let part = inner.next().ok_or_else(|| DinoError::syntax(text, "incomplete element"))?;
    let overflow = |_| DinoError::syntax(text, "number out of range");
    match rule {
        Rule::element_name => {
            let instance_name = match part.into_inner().next() {
                Some(p) if p.as_rule() == Rule::quoted_instance => p.into_inner().as_str().to_string(),
                Some(p) => p.as_str().to_string(),
                None => return Err(DinoError::syntax(text, "missing instance name")),
            };
            Ok(ObjectSpec::ElementName { entity, instance_name })
        }
        Rule::element_id => Ok(ObjectSpec::ElementId {
            entity,
            id: part.as_str().parse().map_err(overflow)?,
        }),
        Rule::element_form_id => Ok(ObjectSpec::ElementFormId {
            entity,
            form_id: part.as_str().parse().map_err(overflow)?,
        }),
        Rule::element_query => {
            let clauses = split_unquoted(part.as_str(), ';')
                .into_iter()
                .map(parse_clause)
                .collect::<Result<Vec<_>>>()?;
            Ok(ObjectSpec::ElementQuery { entity, clauses })
        }
        other => Err(DinoError::syntax(text, format!("unexpected {other:?}"))),
    }
}
