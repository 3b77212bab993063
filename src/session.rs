//! Databases and sessions.
//!
//! A [`Database`] is the explicit context shared by all sessions: the schema,
//! the generated SQL and the storage location. A [`Session`] is one unit of work
//! with its own SQLite connection, an identity map of the elements it has
//! touched and at most one open changeset. Sessions are not shared between
//! threads; open one per thread or request instead.

use std::borrow::Cow;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bimap::BiMap;
use rusqlite::{Connection, OpenFlags};
use tracing::{Span, debug, info, info_span};

use crate::SeaMap;
use crate::changeset::ChangesetState;
use crate::datatype::Value;
use crate::element::{Attribute, Element, ElementKey, LinkTarget, Snapshot};
use crate::error::{DinoError, Result};
use crate::naming;
use crate::objectspec::{self, ObjectSpec, SpecKind};
use crate::persist::{Persistor, StoredRow};
use crate::schema::{EntityType, Property, Schema, WILDCARD};

static MEMORY_DATABASES: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PersistenceMode {
    /// A private in-memory database shared by the sessions of one `Database`.
    InMemory,
    File(String),
}

// ------------- Database -------------
pub struct Database {
    schema: Arc<Schema>,
    persistor: Arc<Persistor>,
    uri: String,
    busy_timeout: Duration,
    // keeps a shared in-memory database alive between sessions
    keeper: Mutex<Connection>,
    sessions: AtomicU64,
}

impl Database {
    pub fn new(schema: impl Into<Arc<Schema>>, mode: PersistenceMode) -> Result<Database> {
        Self::with_timeout(schema, mode, Duration::from_millis(5_000))
    }

    pub fn with_timeout(schema: impl Into<Arc<Schema>>, mode: PersistenceMode, busy_timeout: Duration) -> Result<Database> {
        let schema = schema.into();
        let uri = match &mode {
            PersistenceMode::InMemory => format!(
                "file:dinodb-{}-{}?mode=memory&cache=shared",
                std::process::id(),
                MEMORY_DATABASES.fetch_add(1, Ordering::Relaxed)
            ),
            PersistenceMode::File(path) => path.clone(),
        };
        let keeper = connect(&uri, busy_timeout)?;
        let persistor = Arc::new(Persistor::new(Arc::clone(&schema)));
        persistor.create_schema(&keeper)?;
        info!(?mode, types = schema.entity_types().count(), "database ready");
        Ok(Database {
            schema,
            persistor,
            uri,
            busy_timeout,
            keeper: Mutex::new(keeper),
            sessions: AtomicU64::new(0),
        })
    }

    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    pub fn session(&self) -> Result<Session> {
        let id = self.sessions.fetch_add(1, Ordering::Relaxed) + 1;
        let conn = connect(&self.uri, self.busy_timeout)?;
        let span = info_span!("session", id);
        debug!(parent: &span, "session opened");
        Ok(Session {
            schema: Arc::clone(&self.schema),
            persistor: Arc::clone(&self.persistor),
            conn,
            span,
            elements: BTreeMap::new(),
            by_id: SeaMap::default(),
            form_ids: BiMap::new(),
            names: SeaMap::default(),
            state: ChangesetState::NoChangeset,
            next_key: 0,
            next_form_id: 0,
        })
    }

    /// Drops every table and creates them again, empty.
    pub fn reset(&self) -> Result<()> {
        let keeper = self
            .keeper
            .lock()
            .map_err(|e| DinoError::Config(format!("database lock poisoned: {e}")))?;
        self.persistor.drop_schema(&keeper)?;
        self.persistor.create_schema(&keeper)
    }
}

fn connect(uri: &str, busy_timeout: Duration) -> Result<Connection> {
    let flags = OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE | OpenFlags::SQLITE_OPEN_URI;
    let conn = Connection::open_with_flags(uri, flags).map_err(|e| DinoError::backend("open", &[], e))?;
    conn.busy_timeout(busy_timeout)?;
    conn.execute_batch("pragma foreign_keys = on;")?;
    Ok(conn)
}

/// Scratch number of an element that has not been persisted yet.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct FormId {
    pub entity: String,
    pub number: u64,
}

// ------------- Session -------------
pub struct Session {
    pub(crate) schema: Arc<Schema>,
    pub(crate) persistor: Arc<Persistor>,
    pub(crate) conn: Connection,
    pub(crate) span: Span,
    pub(crate) elements: BTreeMap<ElementKey, Element>,
    pub(crate) by_id: SeaMap<(String, i64), ElementKey>,
    pub(crate) form_ids: BiMap<FormId, ElementKey>,
    /// Persisted name to id, cleared whenever names may have changed.
    pub(crate) names: SeaMap<(String, String), i64>,
    pub(crate) state: ChangesetState,
    next_key: u64,
    next_form_id: u64,
}

impl Session {
    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    pub(crate) fn entity_type(&self, name: &str) -> Result<Arc<EntityType>> {
        self.schema.entity(name).map(Arc::clone)
    }

    pub fn element(&self, key: ElementKey) -> Result<&Element> {
        self.elements
            .get(&key)
            .ok_or_else(|| DinoError::UnknownElement(format!("element {key} is not part of this session")))
    }

    fn live_mut(&mut self, key: ElementKey) -> Result<&mut Element> {
        match self.elements.get_mut(&key) {
            Some(element) if element.deleted => Err(DinoError::UnknownElement(format!(
                "{} is deleted",
                element.element_name()
            ))),
            Some(element) => Ok(element),
            None => Err(DinoError::UnknownElement(format!("element {key} is not part of this session"))),
        }
    }

    /// Every element held by the session that is not deleted.
    pub fn elements(&self) -> impl Iterator<Item = &Element> {
        self.elements.values().filter(|e| !e.deleted)
    }

    pub fn attribute(&self, key: ElementKey, property: &str) -> Result<Attribute> {
        let entity = Arc::clone(self.element(key)?.entity());
        Attribute::new(key, entity, property)
    }

    /// Shorthand for `attribute(key, property)?.set(self, text)`.
    pub fn set(&mut self, key: ElementKey, property: &str, text: &str) -> Result<()> {
        self.attribute(key, property)?.set(self, text)
    }

    /// Shorthand for `attribute(key, property)?.get_text(self)`.
    pub fn get_text(&mut self, key: ElementKey, property: &str) -> Result<String> {
        self.attribute(key, property)?.get_text(self)
    }

    // ------------- Loading -------------
    fn element_from_row(&mut self, entity: Arc<EntityType>, row: StoredRow) -> ElementKey {
        let key = self.allocate_key();
        let state = snapshot_from_row(&row);
        self.by_id.insert((entity.name().to_string(), row.id), key);
        self.elements.insert(
            key,
            Element {
                entity,
                key,
                id: Some(row.id),
                revision: row.revision,
                changeset_id: row.changeset_id,
                form_id: None,
                original: Some(state.clone()),
                state,
                deleted: false,
            },
        );
        key
    }

    fn allocate_key(&mut self) -> ElementKey {
        self.next_key += 1;
        ElementKey(self.next_key)
    }

    /// The session's element for a persisted row, loading it on first use.
    pub(crate) fn load(&mut self, entity: &Arc<EntityType>, id: i64) -> Result<Option<ElementKey>> {
        if let Some(key) = self.by_id.get(&(entity.name().to_string(), id)) {
            return Ok(Some(*key));
        }
        match self.persistor.fetch(&self.conn, entity, id)? {
            Some(row) => Ok(Some(self.element_from_row(Arc::clone(entity), row))),
            None => Ok(None),
        }
    }

    pub(crate) fn follow(&mut self, entity: &Arc<EntityType>, target: LinkTarget) -> Result<ElementKey> {
        match target {
            LinkTarget::Pending(key) => Ok(key),
            LinkTarget::Stored(id) => self.load(entity, id)?.ok_or_else(|| {
                DinoError::UnknownElement(format!("{}:{{{id}}}", entity.name()))
            }),
        }
    }

    /// Reads the state behind a link without adding it to the session.
    pub(crate) fn peek(&self, entity: &EntityType, target: LinkTarget) -> Result<Option<(Cow<'_, Snapshot>, Option<i64>)>> {
        let key = match target {
            LinkTarget::Pending(key) => Some(key),
            LinkTarget::Stored(id) => self.by_id.get(&(entity.name().to_string(), id)).copied(),
        };
        if let Some(element) = key.and_then(|k| self.elements.get(&k)) {
            return Ok(Some((Cow::Borrowed(&element.state), element.id)));
        }
        match target {
            LinkTarget::Stored(id) => Ok(self
                .persistor
                .fetch(&self.conn, entity, id)?
                .map(|row| (Cow::Owned(snapshot_from_row(&row)), Some(row.id)))),
            LinkTarget::Pending(_) => Ok(None),
        }
    }

    // ------------- Lookup -------------
    /// Finds the element of `entity` whose current derived name is `name`.
    pub fn find_element(&mut self, entity: &str, name: &str) -> Result<Option<ElementKey>> {
        let entity = self.entity_type(entity)?;
        self.find_named(&entity, name)
    }

    pub(crate) fn find_named(&mut self, entity: &Arc<EntityType>, name: &str) -> Result<Option<ElementKey>> {
        let pending = self
            .elements
            .values()
            .find(|e| !e.deleted && e.entity == *entity && e.instance_name() == Some(name))
            .map(|e| e.key);
        if pending.is_some() {
            return Ok(pending);
        }
        let cache_key = (entity.name().to_string(), name.to_string());
        let id = match self.names.get(&cache_key) {
            Some(id) => Some(*id),
            None => self.persistor.id_by_name(&self.conn, entity, name)?,
        };
        let Some(id) = id else {
            return Ok(None);
        };
        self.names.insert(cache_key, id);
        if self.by_id.contains_key(&(entity.name().to_string(), id)) {
            // loaded, then renamed or deleted in this session
            return Ok(None);
        }
        self.load(entity, id)
    }

    /// Elements denoted by an element-shaped specification.
    pub(crate) fn elements_for(&mut self, spec: &ObjectSpec) -> Result<Vec<ElementKey>> {
        let entities = self.schema.expand(spec.entity())?;
        let mut found = Vec::new();
        for entity in &entities {
            let key = match spec {
                ObjectSpec::ElementName { instance_name, .. } => self.find_named(entity, instance_name)?,
                ObjectSpec::ElementId { id, .. } => {
                    self.load(entity, *id)?.filter(|k| !self.elements[k].deleted)
                }
                ObjectSpec::ElementFormId { form_id, .. } => self
                    .form_ids
                    .get_by_left(&FormId {
                        entity: entity.name().to_string(),
                        number: *form_id,
                    })
                    .copied(),
                other => {
                    return Err(DinoError::SpecificationKindMismatch {
                        text: other.to_string(),
                        found: other.kind().to_string(),
                        expected: "ElementName, ElementId, ElementFormId".to_string(),
                    });
                }
            };
            found.extend(key);
        }
        if found.is_empty() {
            return Err(DinoError::UnknownElement(spec.to_string()));
        }
        Ok(found)
    }

    /// Resolves an element specification to exactly one element.
    pub(crate) fn element_for(&mut self, spec: &ObjectSpec) -> Result<ElementKey> {
        match self.elements_for(spec)?.as_slice() {
            [one] => Ok(*one),
            many => Err(DinoError::AmbiguousElement {
                spec: spec.to_string(),
                candidates: many
                    .iter()
                    .filter_map(|k| self.elements.get(k).map(Element::element_name))
                    .collect::<Vec<_>>()
                    .join(", "),
            }),
        }
    }

    /// Resolves `Type:name`, `Type:{id}` or `Type:<n>` to an element, or `None`
    /// when no such element exists.
    pub fn resolve_element_spec(&mut self, text: &str) -> Result<Option<ElementKey>> {
        let spec = objectspec::parse(text, SpecKind::ELEMENTS)?;
        match self.element_for(&spec) {
            Ok(key) => Ok(Some(key)),
            Err(DinoError::UnknownElement(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Resolves relation input: a full element specification of the target
    /// type, or a bare instance name of it.
    pub(crate) fn resolve_target(&mut self, target: &str, text: &str) -> Result<ElementKey> {
        let text = text.trim();
        let text = crate::datatype::quoted(text).unwrap_or(text);
        let entity = self.entity_type(target)?;
        if let Ok(spec) = objectspec::parse(text, SpecKind::ELEMENTS) {
            let named = spec.entity();
            if named != WILDCARD && self.schema.entity(named)?.name() != entity.name() {
                return Err(DinoError::attribute(
                    entity.name(),
                    named,
                    format!("'{text}' is not a {}", entity.name()),
                ));
            }
            let keys = self.elements_for(&spec)?;
            return keys
                .into_iter()
                .find(|k| self.elements[k].entity == entity)
                .ok_or_else(|| DinoError::UnknownElement(text.to_string()));
        }
        self.find_named(&entity, text)?
            .ok_or_else(|| DinoError::UnknownElement(format!("{}:{text}", entity.name())))
    }

    /// Fresh evaluation of the element's naming template.
    pub fn derive_name(&self, key: ElementKey) -> Result<Option<String>> {
        let element = self.element(key)?;
        naming::derive(self, &element.entity, &element.state, element.id)
    }

    // ------------- Mutation -------------
    pub fn create(&mut self, entity: &str) -> Result<ElementKey> {
        let entity = self.entity_type(entity)?;
        self.ensure_open()?;
        let key = self.allocate_key();
        self.next_form_id += 1;
        let form_id = FormId {
            entity: entity.name().to_string(),
            number: self.next_form_id,
        };
        self.form_ids.insert(form_id, key);
        let mut state = Snapshot::default();
        for field in entity.fields() {
            state
                .values
                .insert(field.name.clone(), field.default.clone().unwrap_or(Value::Null));
        }
        for relation in entity.to_one_relations() {
            state.links.insert(relation.name.clone(), None);
        }
        let span = self.span.clone();
        let _guard = span.enter();
        debug!(entity = entity.name(), form_id = self.next_form_id, "element created");
        self.elements.insert(
            key,
            Element {
                entity,
                key,
                id: None,
                revision: None,
                changeset_id: None,
                form_id: Some(self.next_form_id),
                state,
                original: None,
                deleted: false,
            },
        );
        self.refresh_name(key)?;
        Ok(key)
    }

    pub fn delete(&mut self, key: ElementKey) -> Result<()> {
        self.ensure_open()?;
        let span = self.span.clone();
        let _guard = span.enter();
        let element = self.live_mut(key)?;
        debug!(element = %element.element_name(), "element deleted");
        if element.is_new() {
            self.elements.remove(&key);
            self.form_ids.remove_by_right(&key);
        } else {
            element.deleted = true;
        }
        Ok(())
    }

    pub(crate) fn set_value(&mut self, key: ElementKey, field: &str, value: Value) -> Result<()> {
        self.ensure_open()?;
        let element = self.live_mut(key)?;
        if element.entity.field(field).is_none() {
            return Err(DinoError::attribute(element.entity.name(), field, "no such field"));
        }
        element.state.values.insert(field.to_string(), value);
        self.refresh_name(key)
    }

    pub(crate) fn set_link(&mut self, key: ElementKey, relation: &str, target: Option<ElementKey>) -> Result<()> {
        self.ensure_open()?;
        let link = match target {
            Some(target_key) => {
                let target = self.element(target_key)?;
                if target.deleted {
                    return Err(DinoError::UnknownElement(format!("{} is deleted", target.element_name())));
                }
                Some((target.entity.name().to_string(), target.link_target()))
            }
            None => None,
        };
        let element = self.live_mut(key)?;
        let expected = match element.entity.relation(relation) {
            Some(r) if r.is_to_one() => r.target.clone(),
            _ => {
                return Err(DinoError::attribute(
                    element.entity.name(),
                    relation,
                    "not a to-one relation",
                ));
            }
        };
        if let Some((actual, _)) = &link {
            if *actual != expected {
                return Err(DinoError::attribute(
                    element.entity.name(),
                    relation,
                    format!("expects a {expected}, got a {actual}"),
                ));
            }
        }
        element
            .state
            .links
            .insert(relation.to_string(), link.map(|(_, target)| target));
        self.refresh_name(key)
    }

    /// The element a to-one relation points at.
    pub fn linked(&mut self, key: ElementKey, relation: &str) -> Result<Option<ElementKey>> {
        let element = self.element(key)?;
        let target = match element.entity.relation(relation) {
            Some(r) if r.is_to_one() => self.entity_type(&r.target)?,
            _ => return Err(DinoError::attribute(element.entity.name(), relation, "not a to-one relation")),
        };
        match element.link(relation) {
            Some(link) => self.follow(&target, link).map(Some),
            None => Ok(None),
        }
    }

    fn to_many(&self, key: ElementKey, relation: &str) -> Result<(Arc<EntityType>, String)> {
        let element = self.element(key)?;
        match element.entity.property(relation) {
            Some(Property::Relation(r)) if !r.is_to_one() => {
                Ok((self.entity_type(&r.target)?, r.inverse().unwrap_or_default().to_string()))
            }
            _ => Err(DinoError::attribute(element.entity.name(), relation, "not a to-many relation")),
        }
    }

    /// Current members of a to-many relation, including pending changes.
    pub fn members(&mut self, key: ElementKey, relation: &str) -> Result<Vec<ElementKey>> {
        let (target, inverse) = self.to_many(key, relation)?;
        let owner = self.element(key)?.link_target();
        if let LinkTarget::Stored(id) = owner {
            for member in self.persistor.member_ids(&self.conn, &target, &inverse, id)? {
                self.load(&target, member as i64)?;
            }
        }
        Ok(self
            .elements
            .values()
            .filter(|e| !e.deleted && e.entity == target && e.link(&inverse) == Some(owner))
            .map(|e| e.key)
            .collect())
    }

    pub(crate) fn add_member(&mut self, key: ElementKey, relation: &str, member: ElementKey) -> Result<()> {
        let (_, inverse) = self.to_many(key, relation)?;
        self.set_link(member, &inverse, Some(key))
    }

    pub(crate) fn remove_member(&mut self, key: ElementKey, relation: &str, member: ElementKey) -> Result<()> {
        let (_, inverse) = self.to_many(key, relation)?;
        let owner = self.element(key)?.link_target();
        if self.element(member)?.link(&inverse) != Some(owner) {
            let element = self.element(key)?;
            return Err(DinoError::attribute(
                element.entity.name(),
                relation,
                format!("{} is not a member of {}", self.element(member)?.element_name(), element.element_name()),
            ));
        }
        self.set_link(member, &inverse, None)
    }

    pub(crate) fn replace_members(&mut self, key: ElementKey, relation: &str, wanted: &[ElementKey]) -> Result<()> {
        let current = self.members(key, relation)?;
        for member in current.iter().filter(|m| !wanted.contains(m)) {
            self.remove_member(key, relation, *member)?;
        }
        for member in wanted.iter().filter(|m| !current.contains(m)) {
            self.add_member(key, relation, *member)?;
        }
        Ok(())
    }

    /// Re-derives the element's own name after a change to it.
    fn refresh_name(&mut self, key: ElementKey) -> Result<()> {
        let element = self.element(key)?;
        if element.entity.template().is_none() {
            return Ok(());
        }
        let name = naming::derive(self, &element.entity, &element.state, element.id)?;
        if let Some(element) = self.elements.get_mut(&key) {
            element.state.instance_name = name;
        }
        Ok(())
    }

    /// Keeps generated form numbers clear of one chosen by hand.
    pub(crate) fn bump_form_ids(&mut self, number: u64) {
        self.next_form_id = self.next_form_id.max(number);
    }

    pub(crate) fn ensure_open(&mut self) -> Result<()> {
        self.open_changeset().map(|_| ())
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if matches!(self.state, ChangesetState::Open(_)) {
            let _guard = self.span.enter();
            debug!("session closed with an open changeset, pending changes discarded");
        }
    }
}

pub(crate) fn snapshot_from_row(row: &StoredRow) -> Snapshot {
    Snapshot {
        instance_name: row.instance_name.clone(),
        values: row.values.clone(),
        links: row
            .links
            .iter()
            .map(|(name, id)| (name.clone(), id.map(LinkTarget::Stored)))
            .collect(),
    }
}
