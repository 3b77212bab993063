//! Resolution of object specifications against a session.
//!
//! Everything that can fail on the specification itself (unknown types,
//! properties and malformed clauses) fails in [`resolve`], before a query runs.
//! The returned [`Cursor`] then yields results one by one, loading stored
//! elements into the session only as they are reached.

use std::collections::VecDeque;
use std::sync::Arc;

use rusqlite::types::Value as SqlValue;
use tracing::debug;

use crate::element::{Attribute, ElementKey};
use crate::error::{DinoError, Result};
use crate::naming::INSTANCE_NAME;
use crate::objectspec::{self, Clause, ClauseValue, ObjectSpec, SpecKind};
use crate::persist::quote;
use crate::schema::{EntityType, Property, Relation, WILDCARD};
use crate::session::Session;

#[derive(Debug, Clone)]
pub enum Resolved {
    Entity(Arc<EntityType>),
    Element(ElementKey),
    Attribute(Attribute),
}

impl Resolved {
    pub fn element(&self) -> Option<ElementKey> {
        match self {
            Resolved::Element(key) => Some(*key),
            _ => None,
        }
    }
}

enum Step {
    Ready(Resolved),
    /// A stored element, loaded when reached.
    Stored(Arc<EntityType>, i64),
}

/// Single pass over the results of a resolution.
pub struct Cursor<'s> {
    session: &'s mut Session,
    steps: VecDeque<Step>,
}

impl Iterator for Cursor<'_> {
    type Item = Result<Resolved>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            match self.steps.pop_front()? {
                Step::Ready(resolved) => return Some(Ok(resolved)),
                Step::Stored(entity, id) => match self.session.load(&entity, id) {
                    Ok(Some(key)) if !self.session.elements[&key].deleted => {
                        return Some(Ok(Resolved::Element(key)));
                    }
                    // deleted in this session, or by someone else meanwhile
                    Ok(_) => continue,
                    Err(e) => return Some(Err(e)),
                },
            }
        }
    }
}

impl Session {
    /// Parses and resolves `text`, collecting every result.
    pub fn resolve(&mut self, text: &str) -> Result<Vec<Resolved>> {
        let spec = objectspec::parse(text, SpecKind::ALL)?;
        resolve(&spec, self)?.collect()
    }
}

pub fn resolve<'s>(spec: &ObjectSpec, session: &'s mut Session) -> Result<Cursor<'s>> {
    let span = session.span.clone();
    let _guard = span.enter();
    debug!(%spec, "resolving");
    let steps = match spec {
        ObjectSpec::EntityName { entity, instances: false } => session
            .schema
            .expand(entity)?
            .into_iter()
            .map(|e| Step::Ready(Resolved::Entity(e)))
            .collect(),
        ObjectSpec::EntityName { entity, instances: true } => {
            let mut steps = VecDeque::new();
            for entity in session.schema.expand(entity)? {
                steps.extend(all_of(session, &entity)?);
            }
            steps
        }
        ObjectSpec::ElementName { .. } | ObjectSpec::ElementId { .. } | ObjectSpec::ElementFormId { .. } => session
            .elements_for(spec)?
            .into_iter()
            .map(|k| Step::Ready(Resolved::Element(k)))
            .collect(),
        ObjectSpec::ElementQuery { entity, clauses } => query(session, entity, clauses)?,
        ObjectSpec::AttributeName {
            element,
            property,
            instances,
        } => attributes(session, element, property, *instances)?,
    };
    Ok(Cursor { session, steps })
}

/// Every live element of a type: new ones from the session, stored ones lazily.
fn all_of(session: &Session, entity: &Arc<EntityType>) -> Result<VecDeque<Step>> {
    let mut steps: VecDeque<Step> = session
        .elements
        .values()
        .filter(|e| e.entity == *entity && e.is_new() && !e.deleted)
        .map(|e| Step::Ready(Resolved::Element(e.key)))
        .collect();
    for id in session.persistor.all_ids(&session.conn, entity)? {
        steps.push_back(Step::Stored(Arc::clone(entity), id as i64));
    }
    Ok(steps)
}

fn attributes(session: &mut Session, owner: &ObjectSpec, property: &str, instances: bool) -> Result<VecDeque<Step>> {
    let candidates = session.schema.expand(owner.entity())?;
    let entities: Vec<Arc<EntityType>> = candidates
        .iter()
        .filter(|e| e.property(property).is_some())
        .cloned()
        .collect();
    if entities.is_empty() {
        return Err(DinoError::attribute(owner.entity(), property, "no such property"));
    }
    if instances && entities.iter().all(|e| matches!(e.property(property), Some(Property::Field(_)))) {
        return Err(DinoError::attribute(
            owner.entity(),
            property,
            "only relations have instances",
        ));
    }
    let mut owners = Vec::new();
    match owner {
        ObjectSpec::ElementQuery { entity, clauses } => {
            for step in query(session, entity, clauses)? {
                match step {
                    Step::Ready(Resolved::Element(key)) => owners.push(key),
                    Step::Stored(entity, id) => owners.extend(session.load(&entity, id)?),
                    Step::Ready(_) => {}
                }
            }
        }
        _ => owners = session.elements_for(owner)?,
    }
    let mut steps = VecDeque::new();
    for key in owners {
        let entity = Arc::clone(&session.elements[&key].entity);
        if session.elements[&key].deleted || !entities.contains(&entity) {
            continue;
        }
        let attribute = Attribute::new(key, entity, property)?;
        if !instances {
            steps.push_back(Step::Ready(Resolved::Attribute(attribute)));
            continue;
        }
        let members = if attribute.is_to_many() {
            session.members(key, property)?
        } else {
            session.linked(key, property)?.into_iter().collect()
        };
        steps.extend(members.into_iter().map(|k| Step::Ready(Resolved::Element(k))));
    }
    Ok(steps)
}

// ------------- Queries -------------
fn query(session: &mut Session, entity: &str, clauses: &[Clause]) -> Result<VecDeque<Step>> {
    let entities = session.schema.expand(entity)?;
    let wildcard = entity == WILDCARD;
    let mut steps = VecDeque::new();
    let mut first_error = None;
    let mut matched = false;
    for entity in entities {
        let compiled = match compile(session, &entity, clauses) {
            Ok(compiled) => compiled,
            // the wildcard keeps the types the clauses make sense for
            Err(e) if wildcard => {
                first_error.get_or_insert(e);
                continue;
            }
            Err(e) => return Err(e),
        };
        matched = true;
        debug!(sql = %compiled.sql, "element query");
        let ids = session.persistor.query_ids(&session.conn, &compiled.sql, &compiled.params)?;
        steps.extend(ids.into_iter().map(|id| Step::Stored(Arc::clone(&entity), id as i64)));
    }
    match first_error {
        Some(e) if !matched => Err(e),
        _ => Ok(steps),
    }
}

struct Join {
    name: String,
    entity: Arc<EntityType>,
    alias: String,
}

struct Compiled {
    sql: String,
    params: Vec<SqlValue>,
}

fn compile(session: &mut Session, entity: &Arc<EntityType>, clauses: &[Clause]) -> Result<Compiled> {
    let mut joins = vec![Join {
        name: entity.name().to_string(),
        entity: Arc::clone(entity),
        alias: "t0".to_string(),
    }];
    let mut join_sql = String::new();
    let mut predicates = Vec::new();
    let mut params = Vec::new();
    for clause in clauses {
        match clause {
            Clause::Join(name) => {
                join(session, &mut joins, &mut join_sql, name, clause)?;
            }
            Clause::Equals { join: target, property, value } => {
                let index = match target {
                    Some(name) => join(session, &mut joins, &mut join_sql, name, clause)?,
                    None => 0,
                };
                let (column, param) = predicate(session, &joins[index].entity, property, value, clause)?;
                let column = format!("{}.{}", joins[index].alias, quote(&column));
                match param {
                    Some(param) => {
                        predicates.push(format!("{column} = ?"));
                        params.push(param);
                    }
                    None => predicates.push(format!("{column} is null")),
                }
            }
        }
    }
    let mut sql = format!("select distinct t0.id from {} t0{join_sql}", quote(entity.table()));
    if !predicates.is_empty() {
        sql.push_str(" where ");
        sql.push_str(&predicates.join(" and "));
    }
    sql.push_str(" order by t0.id");
    Ok(Compiled { sql, params })
}

/// Index of the join called `name`, adding it when needed. A name is first
/// looked up as a relation of the joined types, then as an entity type related
/// to one of them.
fn join(session: &Session, joins: &mut Vec<Join>, sql: &mut String, name: &str, clause: &Clause) -> Result<usize> {
    if let Some(index) = joins.iter().position(|j| j.name == name) {
        return Ok(index);
    }
    let mut found: Option<(usize, &Relation)> = None;
    for (index, joined) in joins.iter().enumerate() {
        if let Some(relation) = joined.entity.relation(name) {
            found = Some((index, relation));
            break;
        }
    }
    let by_type = session.schema.entity(name).ok();
    if found.is_none() {
        if let Some(target) = by_type {
            'outer: for (index, joined) in joins.iter().enumerate() {
                for relation in joined.entity.relations() {
                    if relation.target == target.name() {
                        found = Some((index, relation));
                        break 'outer;
                    }
                }
            }
        }
    }
    let Some((from, relation)) = found else {
        return Err(DinoError::clause(
            &clause.to_string(),
            format!("'{name}' is neither a relation nor a related entity type"),
        ));
    };
    let target = session.entity_type(&relation.target)?;
    let alias = format!("t{}", joins.len());
    let on = match relation.inverse() {
        None => format!("{alias}.id = {}.{}", joins[from].alias, quote(&relation.column())),
        Some(inverse) => format!("{alias}.{} = {}.id", quote(&format!("{inverse}_id")), joins[from].alias),
    };
    sql.push_str(&format!(" join {} {alias} on {on}", quote(target.table())));
    joins.push(Join {
        name: name.to_string(),
        entity: target,
        alias,
    });
    Ok(joins.len() - 1)
}

/// Column and parameter for `property = value`; no parameter means `is null`.
fn predicate(
    session: &mut Session,
    entity: &EntityType,
    property: &str,
    value: &ClauseValue,
    clause: &Clause,
) -> Result<(String, Option<SqlValue>)> {
    let text = match value {
        ClauseValue::Null => None,
        ClauseValue::Text(text) => Some(text.as_str()),
    };
    if property == INSTANCE_NAME {
        return Ok((property.to_string(), text.map(|t| SqlValue::Text(t.to_string()))));
    }
    if property == "id" {
        let id = match text {
            Some(t) => Some(SqlValue::Integer(
                t.parse()
                    .map_err(|_| DinoError::clause(&clause.to_string(), format!("'{t}' is not an id")))?,
            )),
            None => None,
        };
        return Ok((property.to_string(), id));
    }
    match entity.require_property(property)? {
        Property::Field(field) => {
            let Some(text) = text else {
                return Ok((field.name.clone(), None));
            };
            let value = field
                .field_type
                .coerce_literal(&field.name, text)
                .map_err(|e| DinoError::clause(&clause.to_string(), e.to_string()))?;
            Ok((field.name.clone(), Some(value.to_sql())))
        }
        Property::Relation(relation) if relation.is_to_one() => {
            let Some(text) = text else {
                return Ok((relation.column(), None));
            };
            let key = session.resolve_target(&relation.target, text)?;
            // an element that is not stored yet matches nothing
            let id = session.elements[&key].id.unwrap_or(-1);
            Ok((relation.column(), Some(SqlValue::Integer(id))))
        }
        Property::Relation(relation) => Err(DinoError::clause(
            &clause.to_string(),
            format!("'{}' is a to-many relation, join it instead", relation.name),
        )),
    }
}
