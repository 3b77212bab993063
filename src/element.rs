//! Elements and typed attribute handles.
//!
//! An [`Element`] is one row of an entity type as seen by a session: its
//! persisted state (if any) plus the pending state built up by mutations. Elements
//! are owned by the session and addressed through copyable [`ElementKey`]s. All
//! mutation goes through an [`Attribute`] handle, which coerces text input to
//! the property's type before anything is recorded.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::datatype::{Value, is_null, quoted};
use crate::error::{DinoError, Result};
use crate::schema::{EntityType, Property};
use crate::session::Session;

/// Session local handle of an element.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ElementKey(pub(crate) u64);

impl fmt::Display for ElementKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Where a to-one relation points: a persisted row, or an element that only
/// exists in the session so far.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LinkTarget {
    Stored(i64),
    Pending(ElementKey),
}

/// The mutable part of an element.
#[derive(Debug, Clone, PartialEq, Default)]
pub(crate) struct Snapshot {
    pub instance_name: Option<String>,
    pub values: BTreeMap<String, Value>,
    pub links: BTreeMap<String, Option<LinkTarget>>,
}

impl Snapshot {
    pub fn value(&self, field: &str) -> &Value {
        self.values.get(field).unwrap_or(&Value::Null)
    }

    pub fn link(&self, relation: &str) -> Option<LinkTarget> {
        self.links.get(relation).copied().flatten()
    }
}

// ------------- Element -------------
#[derive(Debug, Clone)]
pub struct Element {
    pub(crate) entity: Arc<EntityType>,
    pub(crate) key: ElementKey,
    pub(crate) id: Option<i64>,
    pub(crate) revision: Option<i64>,
    pub(crate) changeset_id: Option<i64>,
    pub(crate) form_id: Option<u64>,
    pub(crate) state: Snapshot,
    /// State as loaded from storage; `None` for elements not persisted yet.
    pub(crate) original: Option<Snapshot>,
    pub(crate) deleted: bool,
}

impl Element {
    pub fn entity(&self) -> &Arc<EntityType> {
        &self.entity
    }

    pub fn entity_name(&self) -> &str {
        self.entity.name()
    }

    pub fn key(&self) -> ElementKey {
        self.key
    }

    pub fn id(&self) -> Option<i64> {
        self.id
    }

    pub fn revision(&self) -> Option<i64> {
        self.revision
    }

    /// The changeset that produced the persisted state.
    pub fn changeset_id(&self) -> Option<i64> {
        self.changeset_id
    }

    pub fn form_id(&self) -> Option<u64> {
        self.form_id
    }

    /// Current derived name, including pending changes to the element itself.
    pub fn instance_name(&self) -> Option<&str> {
        self.state.instance_name.as_deref()
    }

    /// The name as persisted, before any pending change.
    pub fn stored_name(&self) -> Option<&str> {
        self.original.as_ref().and_then(|o| o.instance_name.as_deref())
    }

    pub fn value(&self, field: &str) -> &Value {
        self.state.value(field)
    }

    pub fn link(&self, relation: &str) -> Option<LinkTarget> {
        self.state.link(relation)
    }

    pub fn is_new(&self) -> bool {
        self.original.is_none()
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted
    }

    pub fn is_dirty(&self) -> bool {
        self.original.as_ref().is_some_and(|o| *o != self.state)
    }

    /// `Type:name`, falling back to `Type:{id}` and then to `Type:<form id>`.
    pub fn element_name(&self) -> String {
        let name = self.instance_name().or(self.stored_name());
        match (name, self.id, self.form_id) {
            (Some(name), _, _) => crate::objectspec::ObjectSpec::ElementName {
                entity: self.entity_name().to_string(),
                instance_name: name.to_string(),
            }
            .to_string(),
            (None, Some(id), _) => format!("{}:{{{id}}}", self.entity_name()),
            (None, None, Some(form_id)) => format!("{}:<{form_id}>", self.entity_name()),
            (None, None, None) => format!("{}:{}", self.entity_name(), self.key),
        }
    }

    pub(crate) fn link_target(&self) -> LinkTarget {
        match self.id {
            Some(id) => LinkTarget::Stored(id),
            None => LinkTarget::Pending(self.key),
        }
    }

    /// Attributes whose pending value differs from the persisted one. New
    /// elements report every attribute.
    pub(crate) fn changed_attributes(&self) -> Vec<String> {
        let mut changed = Vec::new();
        let original = self.original.as_ref();
        for field in self.entity.fields() {
            if original.is_none_or(|o| o.value(&field.name) != self.state.value(&field.name)) {
                changed.push(field.name.clone());
            }
        }
        for relation in self.entity.to_one_relations() {
            if original.is_none_or(|o| o.link(&relation.name) != self.state.link(&relation.name)) {
                changed.push(relation.name.clone());
            }
        }
        if original.is_none_or(|o| o.instance_name != self.state.instance_name) {
            changed.push(crate::naming::INSTANCE_NAME.to_string());
        }
        changed
    }
}

// ------------- Attribute handles -------------
#[derive(Debug, Clone, PartialEq)]
pub enum AttributeValue {
    Value(Value),
    Element(Option<ElementKey>),
    Elements(Vec<ElementKey>),
}

/// A typed property of one element.
#[derive(Debug, Clone)]
pub struct Attribute {
    element: ElementKey,
    entity: Arc<EntityType>,
    property: String,
}

impl Attribute {
    pub(crate) fn new(element: ElementKey, entity: Arc<EntityType>, property: &str) -> Result<Self> {
        entity.require_property(property)?;
        Ok(Attribute {
            element,
            entity,
            property: property.to_string(),
        })
    }

    pub fn element(&self) -> ElementKey {
        self.element
    }

    pub fn entity(&self) -> &Arc<EntityType> {
        &self.entity
    }

    pub fn property(&self) -> &str {
        &self.property
    }

    fn kind(&self) -> Result<Property<'_>> {
        self.entity.require_property(&self.property)
    }

    pub fn is_to_many(&self) -> bool {
        matches!(self.kind(), Ok(Property::Relation(r)) if !r.is_to_one())
    }

    pub fn get(&self, session: &mut Session) -> Result<AttributeValue> {
        match self.kind()? {
            Property::Field(field) => Ok(AttributeValue::Value(session.element(self.element)?.value(&field.name).clone())),
            Property::Relation(r) if r.is_to_one() => Ok(AttributeValue::Element(session.linked(self.element, &r.name)?)),
            Property::Relation(r) => Ok(AttributeValue::Elements(session.members(self.element, &r.name)?)),
        }
    }

    /// The value rendered as text: element names for relations, `None` for null.
    pub fn get_text(&self, session: &mut Session) -> Result<String> {
        let text = match self.get(session)? {
            AttributeValue::Value(v) => v.to_string(),
            AttributeValue::Element(Some(key)) => session.element(key)?.element_name(),
            AttributeValue::Element(None) => Value::Null.to_string(),
            AttributeValue::Elements(keys) => {
                let mut names = Vec::with_capacity(keys.len());
                for key in keys {
                    names.push(session.element(key)?.element_name());
                }
                if names.is_empty() {
                    "[]".to_string()
                } else {
                    format!("[ {} ]", names.join(", "))
                }
            }
        };
        Ok(text)
    }

    /// Replaces the value. For to-many relations `text` is a comma separated list
    /// of element names; an empty list or `None` removes every member.
    pub fn set(&self, session: &mut Session, text: &str) -> Result<()> {
        match self.kind()? {
            Property::Field(field) => {
                let value = field.field_type.coerce(&field.name, text)?;
                session.set_value(self.element, &field.name, value)
            }
            Property::Relation(r) if r.is_to_one() => {
                let target = if text.trim().is_empty() || is_null(text) {
                    None
                } else {
                    Some(session.resolve_target(&r.target, text)?)
                };
                session.set_link(self.element, &r.name, target)
            }
            Property::Relation(r) => {
                let mut wanted = Vec::new();
                for item in split_list(text) {
                    wanted.push(session.resolve_target(&r.target, item)?);
                }
                session.replace_members(self.element, &r.name, &wanted)
            }
        }
    }

    pub fn add(&self, session: &mut Session, text: &str) -> Result<()> {
        let relation = self.to_many("add")?;
        for item in split_list(text) {
            let member = session.resolve_target(&relation, item)?;
            session.add_member(self.element, &self.property, member)?;
        }
        Ok(())
    }

    pub fn remove(&self, session: &mut Session, text: &str) -> Result<()> {
        let relation = self.to_many("remove")?;
        for item in split_list(text) {
            let member = session.resolve_target(&relation, item)?;
            session.remove_member(self.element, &self.property, member)?;
        }
        Ok(())
    }

    /// Applies an operator prefixed value: `=x` sets, `+x` adds, `-x` removes.
    /// Text without an operator sets.
    pub fn apply(&self, session: &mut Session, text: &str) -> Result<()> {
        let trimmed = text.trim_start();
        match trimmed.chars().next() {
            Some('+') if self.is_to_many() => self.add(session, &trimmed[1..]),
            Some('-') if self.is_to_many() => self.remove(session, &trimmed[1..]),
            Some('=') => self.set(session, &trimmed[1..]),
            _ => self.set(session, text),
        }
    }

    /// Target entity name of a to-many relation, else an error naming `operation`.
    fn to_many(&self, operation: &str) -> Result<String> {
        match self.kind()? {
            Property::Relation(r) if !r.is_to_one() => Ok(r.target.clone()),
            _ => Err(DinoError::attribute(
                self.entity.name(),
                &self.property,
                format!("{operation} needs a to-many relation"),
            )),
        }
    }
}

/// Splits `[ a, b ]` or `a, b` into items. `None` and blank text yield nothing.
pub(crate) fn split_list(text: &str) -> Vec<&str> {
    let trimmed = text.trim();
    let inner = trimmed
        .strip_prefix('[')
        .and_then(|t| t.strip_suffix(']'))
        .unwrap_or(trimmed);
    if is_null(inner) || quoted(inner.trim()).is_some_and(str::is_empty) {
        return Vec::new();
    }
    inner
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .collect()
}
