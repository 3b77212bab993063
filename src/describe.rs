//! Human readable description of a session's pending changes.

use std::fmt;

use crate::element::{Element, LinkTarget};
use crate::error::Result;
use crate::objectspec::ObjectSpec;
use crate::schema::EntityType;
use crate::session::Session;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Change {
    Create(String),
    Delete(String),
    SetField {
        element: String,
        attribute: String,
        value: String,
    },
    SetRelation {
        element: String,
        attribute: String,
        target: String,
    },
    AddMember {
        element: String,
        attribute: String,
        member: String,
    },
    RemoveMember {
        element: String,
        attribute: String,
        member: String,
    },
}

impl fmt::Display for Change {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Change::Create(element) => write!(f, "Add: {element}"),
            Change::Delete(element) => write!(f, "Delete: {element}"),
            Change::SetField { element, attribute, value } => write!(f, "Update: {element}/{attribute}: {value}"),
            Change::SetRelation { element, attribute, target } => {
                write!(f, "Update: {element}/{attribute}: {target}")
            }
            Change::AddMember { element, attribute, member } => {
                write!(f, "Update: {element}/{attribute}: add {member}")
            }
            Change::RemoveMember { element, attribute, member } => {
                write!(f, "Update: {element}/{attribute}: del {member}")
            }
        }
    }
}

/// Creations first, then deletions, then attribute updates.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeDescription {
    changes: Vec<Change>,
}

impl ChangeDescription {
    pub fn iter(&self) -> impl Iterator<Item = &Change> {
        self.changes.iter()
    }

    pub fn len(&self) -> usize {
        self.changes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn lines(&self) -> Vec<String> {
        self.changes.iter().map(Change::to_string).collect()
    }
}

impl IntoIterator for ChangeDescription {
    type Item = Change;
    type IntoIter = std::vec::IntoIter<Change>;

    fn into_iter(self) -> Self::IntoIter {
        self.changes.into_iter()
    }
}

impl fmt::Display for ChangeDescription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for change in &self.changes {
            writeln!(f, "{change}")?;
        }
        Ok(())
    }
}

impl Session {
    /// Describes the pending changes without touching session state.
    pub fn change_description(&self) -> Result<ChangeDescription> {
        let mut creates = Vec::new();
        let mut deletes = Vec::new();
        let mut updates = Vec::new();
        for element in self.elements.values() {
            if element.deleted {
                deletes.push(Change::Delete(element.element_name()));
                continue;
            }
            if element.is_new() {
                creates.push(Change::Create(element.element_name()));
            } else if !element.is_dirty() {
                continue;
            }
            describe_updates(self, element, &mut updates)?;
        }
        creates.append(&mut deletes);
        creates.append(&mut updates);
        Ok(ChangeDescription { changes: creates })
    }
}

fn describe_updates(session: &Session, element: &Element, updates: &mut Vec<Change>) -> Result<()> {
    let name = element.element_name();
    let original = element.original.as_ref();
    for field in element.entity.fields() {
        let value = element.state.value(&field.name);
        let changed = match original {
            Some(o) => o.value(&field.name) != value,
            None => !value.is_null(),
        };
        if changed {
            updates.push(Change::SetField {
                element: name.clone(),
                attribute: field.name.clone(),
                value: value.to_string(),
            });
        }
    }
    for relation in element.entity.to_one_relations() {
        let link = element.state.link(&relation.name);
        let before = original.and_then(|o| o.link(&relation.name));
        if link == before {
            continue;
        }
        let target = session.entity_type(&relation.target)?;
        updates.push(Change::SetRelation {
            element: name.clone(),
            attribute: relation.name.clone(),
            target: match link {
                Some(link) => link_name(session, &target, link)?,
                None => crate::datatype::NULL_SENTINEL.to_string(),
            },
        });
        // the same change seen from the other side of a to-many relation
        for many in target
            .relations()
            .iter()
            .filter(|r| r.inverse() == Some(relation.name.as_str()) && r.target == element.entity_name())
        {
            if let Some(old) = before {
                updates.push(Change::RemoveMember {
                    element: link_name(session, &target, old)?,
                    attribute: many.name.clone(),
                    member: name.clone(),
                });
            }
            if let Some(new) = link {
                updates.push(Change::AddMember {
                    element: link_name(session, &target, new)?,
                    attribute: many.name.clone(),
                    member: name.clone(),
                });
            }
        }
    }
    Ok(())
}

fn link_name(session: &Session, entity: &EntityType, link: LinkTarget) -> Result<String> {
    let key = match link {
        LinkTarget::Pending(key) => Some(key),
        LinkTarget::Stored(id) => session.by_id.get(&(entity.name().to_string(), id)).copied(),
    };
    if let Some(element) = key.and_then(|k| session.elements.get(&k)) {
        return Ok(element.element_name());
    }
    Ok(match session.peek(entity, link)? {
        Some((snapshot, _)) if snapshot.instance_name.is_some() => ObjectSpec::ElementName {
            entity: entity.name().to_string(),
            instance_name: snapshot.instance_name.clone().unwrap_or_default(),
        }
        .to_string(),
        _ => match link {
            LinkTarget::Stored(id) => format!("{}:{{{id}}}", entity.name()),
            LinkTarget::Pending(key) => format!("{}:{key}", entity.name()),
        },
    })
}
