//! Derived names.
//!
//! A naming template mixes literal text with `{key}` references. A key is a
//! field of the element itself (`{name}`) or a dotted path through to-one
//! relations ending in a field of the element reached (`{device.rack.site.name}`).
//! The leaf `instance_name` refers to the derived name of the related element,
//! so names can be built on top of other names (`{host.instance_name}_{port_name}`).
//!
//! Parenthesized groups are optional: `{addr}(/{mask_len})` renders the group only
//! when every key inside it has a value. A missing key outside of a group means
//! the element has no name yet.
//!
//! At schema load every key is compiled into listeners. For `a.b.c` on `T` there
//! is one listener on `T/a`, one on `A/b` reached through `a`, and one on the
//! field `B/c` reached through `a.b`. At commit, a change to a watched attribute
//! selects the dependents through the recorded relation path.

use std::borrow::Cow;
use std::collections::{BTreeSet, VecDeque};
use std::fmt;
use std::sync::Arc;

use lazy_static::lazy_static;
use regex::Regex;
use tracing::debug;

use crate::SeaMap;
use crate::element::{ElementKey, LinkTarget, Snapshot};
use crate::error::{DinoError, Result};
use crate::schema::EntityType;
use crate::session::Session;

/// Leaf key referring to the derived name of the element reached by the path.
pub const INSTANCE_NAME: &str = "instance_name";

lazy_static! {
    static ref KEY: Regex = Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*(\.[A-Za-z_][A-Za-z0-9_]*)*$").unwrap();
}

// ------------- Templates -------------
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct KeyPath {
    hops: Vec<String>,
    leaf: String,
}

impl KeyPath {
    /// Relations followed before reading the leaf.
    pub fn hops(&self) -> &[String] {
        &self.hops
    }

    pub fn leaf(&self) -> &str {
        &self.leaf
    }
}

impl fmt::Display for KeyPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for hop in &self.hops {
            write!(f, "{hop}.")?;
        }
        write!(f, "{}", self.leaf)
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Segment {
    Literal(String),
    Key(KeyPath),
    Optional(Vec<Segment>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct NameTemplate {
    source: String,
    segments: Vec<Segment>,
}

/// Outcome of rendering a template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DerivedName {
    Named(String),
    /// A required key had no value.
    Missing(KeyPath),
}

impl DerivedName {
    pub fn into_name(self) -> Option<String> {
        match self {
            DerivedName::Named(name) => Some(name),
            DerivedName::Missing(_) => None,
        }
    }
}

impl NameTemplate {
    pub fn parse(source: &str) -> Result<Self> {
        let invalid = |message: &str| DinoError::InvalidSchema(format!("template '{source}': {message}"));
        let mut segments = Vec::new();
        let mut group: Option<Vec<Segment>> = None;
        let mut literal = String::new();
        let mut chars = source.chars();
        while let Some(c) = chars.next() {
            let target = group.as_mut().unwrap_or(&mut segments);
            match c {
                '{' => {
                    if !literal.is_empty() {
                        target.push(Segment::Literal(std::mem::take(&mut literal)));
                    }
                    let mut key = String::new();
                    let mut closed = false;
                    for c in chars.by_ref() {
                        if c == '}' {
                            closed = true;
                            break;
                        }
                        key.push(c);
                    }
                    if !closed || !KEY.is_match(&key) {
                        return Err(invalid(&format!("bad key '{{{key}}}'")));
                    }
                    let mut parts: Vec<String> = key.split('.').map(str::to_string).collect();
                    let leaf = parts.pop().unwrap_or_default();
                    target.push(Segment::Key(KeyPath { hops: parts, leaf }));
                }
                '(' => {
                    if group.is_some() {
                        return Err(invalid("optional groups cannot nest"));
                    }
                    if !literal.is_empty() {
                        segments.push(Segment::Literal(std::mem::take(&mut literal)));
                    }
                    group = Some(Vec::new());
                }
                ')' => {
                    let mut inner = group.take().ok_or_else(|| invalid("unbalanced ')'"))?;
                    if !literal.is_empty() {
                        inner.push(Segment::Literal(std::mem::take(&mut literal)));
                    }
                    segments.push(Segment::Optional(inner));
                }
                '}' => return Err(invalid("unbalanced '}'")),
                other => literal.push(other),
            }
        }
        if group.is_some() {
            return Err(invalid("unclosed '('"));
        }
        if !literal.is_empty() {
            segments.push(Segment::Literal(literal));
        }
        if !segments.iter().any(|s| matches!(s, Segment::Key(_))) {
            return Err(invalid("at least one key must be outside optional groups"));
        }
        Ok(NameTemplate {
            source: source.to_string(),
            segments,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Every key, required or optional, in template order.
    pub fn keys(&self) -> Vec<&KeyPath> {
        fn walk<'a>(segments: &'a [Segment], keys: &mut Vec<&'a KeyPath>) {
            for segment in segments {
                match segment {
                    Segment::Key(k) => keys.push(k),
                    Segment::Optional(inner) => walk(inner, keys),
                    Segment::Literal(_) => {}
                }
            }
        }
        let mut keys = Vec::new();
        walk(&self.segments, &mut keys);
        keys
    }

    /// Renders the template, asking `lookup` for the text of every key.
    pub fn render<F>(&self, mut lookup: F) -> Result<DerivedName>
    where
        F: FnMut(&KeyPath) -> Result<Option<String>>,
    {
        let mut name = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => name.push_str(text),
                Segment::Key(key) => match lookup(key)? {
                    Some(text) => name.push_str(&text),
                    None => return Ok(DerivedName::Missing(key.clone())),
                },
                Segment::Optional(inner) => {
                    let mut part = String::new();
                    let mut complete = true;
                    for segment in inner {
                        match segment {
                            Segment::Literal(text) => part.push_str(text),
                            Segment::Key(key) => match lookup(key)? {
                                Some(text) => part.push_str(&text),
                                None => {
                                    complete = false;
                                    break;
                                }
                            },
                            Segment::Optional(_) => {}
                        }
                    }
                    if complete {
                        name.push_str(&part);
                    }
                }
            }
        }
        Ok(DerivedName::Named(name))
    }
}

// ------------- Dependency Graph -------------
/// An element type whose name reads a watched attribute through `path`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dependency {
    pub dependent: String,
    /// To-one relations walked from the dependent to the watched element.
    pub path: Vec<String>,
}

#[derive(Debug, Default)]
pub struct DependencyGraph {
    listeners: SeaMap<(String, String), Vec<Dependency>>,
}

impl DependencyGraph {
    pub(crate) fn compile(types: &[Arc<EntityType>]) -> Result<Self> {
        let find = |name: &str| types.iter().find(|t| t.name() == name);
        let mut graph = DependencyGraph::default();
        for entity in types {
            let Some(template) = entity.template() else {
                continue;
            };
            for key in template.keys() {
                let mut owner = entity;
                let mut walked: Vec<String> = Vec::new();
                for hop in key.hops() {
                    let relation = owner.relation(hop).filter(|r| r.is_to_one()).ok_or_else(|| {
                        DinoError::InvalidSchema(format!(
                            "{} template key {{{}}}: {} has no to-one relation '{}'",
                            entity.name(),
                            key,
                            owner.name(),
                            hop
                        ))
                    })?;
                    graph.listen(owner.name(), hop, entity.name(), &walked);
                    walked.push(hop.clone());
                    owner = find(&relation.target).ok_or_else(|| DinoError::UnknownEntityType(relation.target.clone()))?;
                }
                if key.leaf() != INSTANCE_NAME && owner.field(key.leaf()).is_none() {
                    return Err(DinoError::InvalidSchema(format!(
                        "{} template key {{{}}}: {} has no field '{}'",
                        entity.name(),
                        key,
                        owner.name(),
                        key.leaf()
                    )));
                }
                graph.listen(owner.name(), key.leaf(), entity.name(), &walked);
            }
        }
        Ok(graph)
    }

    fn listen(&mut self, watched: &str, attribute: &str, dependent: &str, path: &[String]) {
        let dependency = Dependency {
            dependent: dependent.to_string(),
            path: path.to_vec(),
        };
        let entry = self
            .listeners
            .entry((watched.to_string(), attribute.to_string()))
            .or_default();
        if !entry.contains(&dependency) {
            entry.push(dependency);
        }
    }

    /// Dependents whose names read `entity/attribute`.
    pub fn listeners(&self, entity: &str, attribute: &str) -> &[Dependency] {
        self.listeners
            .get(&(entity.to_string(), attribute.to_string()))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn len(&self) -> usize {
        self.listeners.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }
}

// ------------- Evaluation -------------
const MAX_DEPTH: usize = 32;

/// Derives the name of an element from its current state.
pub(crate) fn derive(session: &Session, entity: &EntityType, state: &Snapshot, id: Option<i64>) -> Result<Option<String>> {
    Ok(derive_at(session, entity, state, id, 0)?.into_name())
}

pub(crate) fn derive_at(
    session: &Session,
    entity: &EntityType,
    state: &Snapshot,
    id: Option<i64>,
    depth: usize,
) -> Result<DerivedName> {
    if depth > MAX_DEPTH {
        return Err(DinoError::name(entity.name(), "name templates refer to each other in a cycle"));
    }
    let Some(template) = entity.template() else {
        // unnamed types are known by their id
        return Ok(match id {
            Some(id) => DerivedName::Named(id.to_string()),
            None => DerivedName::Missing(KeyPath {
                hops: Vec::new(),
                leaf: "id".to_string(),
            }),
        });
    };
    template.render(|key| lookup(session, entity, state, id, key, depth))
}

fn lookup(
    session: &Session,
    entity: &EntityType,
    state: &Snapshot,
    id: Option<i64>,
    key: &KeyPath,
    depth: usize,
) -> Result<Option<String>> {
    let mut owner = entity;
    let mut current = Cow::Borrowed(state);
    let mut current_id = id;
    for hop in key.hops() {
        let relation = owner
            .relation(hop)
            .ok_or_else(|| DinoError::attribute(owner.name(), hop, "no such relation"))?;
        let Some(link) = current.link(hop) else {
            return Ok(None);
        };
        let target: &EntityType = session
            .schema
            .get(&relation.target)
            .ok_or_else(|| DinoError::UnknownEntityType(relation.target.clone()))?;
        let Some((snapshot, target_id)) = session.peek(target, link)? else {
            return Ok(None);
        };
        owner = target;
        current = snapshot;
        current_id = target_id;
    }
    if key.leaf() == INSTANCE_NAME {
        return Ok(derive_at(session, owner, &current, current_id, depth + 1)?.into_name());
    }
    Ok(current.value(key.leaf()).name_part())
}

// ------------- Cascade -------------
/// How often one element may be renamed by a single cascade.
const MAX_RENAMES: usize = 64;

/// Brings every derived name in the session up to date, following the
/// dependency graph from each pending change. Returns the number of elements
/// renamed that were not changed themselves.
pub(crate) fn cascade(session: &mut Session) -> Result<usize> {
    let schema = Arc::clone(&session.schema);
    let graph = schema.dependencies();
    let changed: Vec<ElementKey> = session
        .elements
        .values()
        .filter(|e| !e.deleted && (e.is_new() || e.is_dirty()))
        .map(|e| e.key)
        .collect();
    let mut work: VecDeque<(ElementKey, String)> = VecDeque::new();
    for key in changed {
        rename(session, key)?;
        for attribute in session.elements[&key].changed_attributes() {
            work.push_back((key, attribute));
        }
    }
    let mut renamed = 0;
    let mut renames: SeaMap<ElementKey, usize> = SeaMap::default();
    while let Some((key, attribute)) = work.pop_front() {
        let entity = session.elements[&key].entity.name().to_string();
        for dependency in graph.listeners(&entity, &attribute) {
            for dependent in dependents(session, key, dependency)? {
                if rename(session, dependent)? {
                    let count = renames.entry(dependent).or_default();
                    *count += 1;
                    if *count > MAX_RENAMES {
                        return Err(DinoError::name(
                            session.elements[&dependent].element_name(),
                            "derived names do not settle",
                        ));
                    }
                    renamed += 1;
                    debug!(
                        element = %session.elements[&dependent].element_name(),
                        cause = %format!("{entity}/{attribute}"),
                        "derived name cascaded"
                    );
                    work.push_back((dependent, INSTANCE_NAME.to_string()));
                }
            }
        }
    }
    Ok(renamed)
}

/// Recomputes one element's name, returning whether it changed.
fn rename(session: &mut Session, key: ElementKey) -> Result<bool> {
    let element = &session.elements[&key];
    if element.deleted || element.entity.template().is_none() {
        return Ok(false);
    }
    let name = derive(session, &element.entity, &element.state, element.id)?;
    if name == element.state.instance_name {
        return Ok(false);
    }
    if let Some(element) = session.elements.get_mut(&key) {
        element.state.instance_name = name;
    }
    Ok(true)
}

/// Elements of the dependency's type that reach `watched` through its path,
/// whether by their persisted state or by their pending state.
fn dependents(session: &mut Session, watched: ElementKey, dependency: &Dependency) -> Result<Vec<ElementKey>> {
    if dependency.path.is_empty() {
        return Ok(vec![watched]);
    }
    let dependent = session.entity_type(&dependency.dependent)?;
    let target = session.elements[&watched].link_target();
    let mut found = BTreeSet::new();
    if let LinkTarget::Stored(id) = target {
        let stored = session
            .persistor
            .dependents(&session.conn, &dependent, &dependency.path, id)?;
        for dependent_id in stored {
            found.extend(session.load(&dependent, dependent_id as i64)?);
        }
    }
    let candidates: Vec<ElementKey> = session
        .elements
        .values()
        .filter(|e| !e.deleted && e.entity == dependent)
        .map(|e| e.key)
        .collect();
    for key in candidates {
        if reaches(session, key, &dependency.path, target)? {
            found.insert(key);
        }
    }
    Ok(found.into_iter().collect())
}

fn reaches(session: &Session, key: ElementKey, path: &[String], target: LinkTarget) -> Result<bool> {
    let element = &session.elements[&key];
    let mut entity = Arc::clone(&element.entity);
    let mut state = Cow::Borrowed(&element.state);
    for (i, hop) in path.iter().enumerate() {
        let Some(link) = state.link(hop) else {
            return Ok(false);
        };
        if i + 1 == path.len() {
            return Ok(link == target);
        }
        let relation = entity
            .relation(hop)
            .ok_or_else(|| DinoError::attribute(entity.name(), hop, "no such relation"))?;
        let next_entity = session.entity_type(&relation.target)?;
        let Some((next, _)) = session.peek(&next_entity, link)? else {
            return Ok(false);
        };
        state = next;
        entity = next_entity;
    }
    Ok(false)
}
