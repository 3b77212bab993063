//! Changesets, commits and point-in-time revisions.
//!
//! Every mutation belongs to the session's open changeset. Submitting it
//! cascades derived names, validates the pending state and writes it in one
//! SQLite transaction. Each written element closes its previous revision and
//! opens a new one stamped with the changeset id, so the history of any element
//! can be read back as of any committed changeset.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{NaiveDateTime, Utc};
use rusqlite::TransactionBehavior;
use tracing::{debug, info, warn};

use crate::SeaMap;
use crate::datatype::Value;
use crate::element::{Element, ElementKey, LinkTarget};
use crate::error::{DinoError, Result};
use crate::naming::{self, DerivedName};
use crate::persist::{Persistor, RevisionRow, RowWrite};
use crate::schema::EntityType;
use crate::session::Session;

#[derive(Debug, Clone, PartialEq)]
pub struct ChangeSet {
    /// Assigned when the changeset is committed.
    pub id: Option<i64>,
    pub created: NaiveDateTime,
    pub committed: Option<NaiveDateTime>,
    pub author: Option<String>,
    pub comment: Option<String>,
}

impl ChangeSet {
    fn new() -> ChangeSet {
        ChangeSet {
            id: None,
            created: Utc::now().naive_utc(),
            committed: None,
            author: None,
            comment: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ChangesetState {
    NoChangeset,
    Open(ChangeSet),
    Committing(ChangeSet),
}

impl ChangesetState {
    pub fn is_open(&self) -> bool {
        matches!(self, ChangesetState::Open(_))
    }
}

/// What a commit wrote, per element.
struct Written {
    ids: BTreeMap<ElementKey, i64>,
    names: BTreeMap<ElementKey, String>,
    inserted: Vec<ElementKey>,
    updated: Vec<ElementKey>,
    deleted: Vec<ElementKey>,
}

impl Session {
    /// Opens a changeset unless one is open already.
    pub fn open_changeset(&mut self) -> Result<&ChangeSet> {
        if let ChangesetState::Committing(_) = self.state {
            return Err(DinoError::RevisionConsistency(
                "a changeset is being committed".to_string(),
            ));
        }
        if let ChangesetState::NoChangeset = self.state {
            self.state = ChangesetState::Open(ChangeSet::new());
            debug!(parent: &self.span, "changeset opened");
        }
        match &self.state {
            ChangesetState::Open(changeset) => Ok(changeset),
            _ => Err(DinoError::RevisionConsistency("changeset did not open".to_string())),
        }
    }

    pub fn set_changeset_info(&mut self, author: Option<&str>, comment: Option<&str>) -> Result<()> {
        self.open_changeset()?;
        if let ChangesetState::Open(changeset) = &mut self.state {
            changeset.author = author.map(str::to_string);
            changeset.comment = comment.map(str::to_string);
        }
        Ok(())
    }

    pub fn changeset_state(&self) -> &ChangesetState {
        &self.state
    }

    /// Commits the open changeset. On failure nothing is written and the
    /// changeset stays open, so the caller can fix the input or revert.
    pub fn submit_changeset(&mut self) -> Result<ChangeSet> {
        let span = self.span.clone();
        let _guard = span.enter();
        let changeset = match std::mem::replace(&mut self.state, ChangesetState::NoChangeset) {
            ChangesetState::Open(changeset) => changeset,
            other => {
                self.state = other;
                return Err(DinoError::RevisionConsistency("no open changeset to submit".to_string()));
            }
        };
        self.state = ChangesetState::Committing(changeset.clone());
        match self.commit(&changeset) {
            Ok(committed) => {
                self.state = ChangesetState::NoChangeset;
                info!(changeset = committed.id, "changeset committed");
                Ok(committed)
            }
            Err(e) => {
                self.state = ChangesetState::Open(changeset);
                warn!(error = %e, "changeset rejected");
                Err(e)
            }
        }
    }

    /// Discards every pending change and closes the changeset.
    pub fn revert_changeset(&mut self) -> Result<()> {
        match self.state {
            ChangesetState::Committing(_) => {
                return Err(DinoError::RevisionConsistency(
                    "cannot revert a changeset while it is committing".to_string(),
                ));
            }
            ChangesetState::NoChangeset => return Ok(()),
            ChangesetState::Open(_) => {}
        }
        self.elements.retain(|_, e| !e.is_new());
        for element in self.elements.values_mut() {
            if let Some(original) = &element.original {
                element.state = original.clone();
            }
            element.deleted = false;
        }
        self.form_ids.clear();
        self.names.clear();
        self.state = ChangesetState::NoChangeset;
        info!(parent: &self.span, "changeset reverted");
        Ok(())
    }

    fn commit(&mut self, changeset: &ChangeSet) -> Result<ChangeSet> {
        let cascaded = naming::cascade(self)?;
        let mut inserted = Vec::new();
        let mut updated = Vec::new();
        let mut deleted = Vec::new();
        for element in self.elements.values() {
            if element.deleted {
                deleted.push(element.key);
            } else if element.is_new() {
                inserted.push(element.key);
            } else if element.is_dirty() {
                updated.push(element.key);
            }
        }
        self.validate(&inserted, &updated)?;
        debug!(
            inserts = inserted.len(),
            updates = updated.len(),
            deletes = deleted.len(),
            cascaded,
            "writing changeset"
        );

        let committed_at = Utc::now().naive_utc();
        let tx = self.conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let changeset_id = self.persistor.insert_changeset(&tx, changeset, committed_at)?;

        // ids are allocated up front so that pending links can be written
        let mut ids = BTreeMap::new();
        let mut next: SeaMap<String, i64> = SeaMap::default();
        for key in &inserted {
            let entity = &self.elements[key].entity;
            let id = match next.get(entity.name()) {
                Some(id) => *id,
                None => self.persistor.next_id(&tx, entity)?,
            };
            ids.insert(*key, id);
            next.insert(entity.name().to_string(), id + 1);
        }
        let mut names = BTreeMap::new();

        // deletes first, so that names they held are free for the rest
        for key in &deleted {
            let element = &self.elements[key];
            let id = stored_id(element)?;
            if element.entity.is_revisioned() {
                close_open_revision(&self.persistor, &tx, element, id, changeset_id)?;
            }
            self.persistor.delete_head(&tx, &element.entity, id)?;
        }
        // renamed heads give up their old names before any new name is written
        for key in &updated {
            let element = &self.elements[key];
            if element.stored_name() != element.state.instance_name.as_deref() {
                self.persistor.release_name(&tx, &element.entity, stored_id(element)?)?;
            }
        }
        for key in &updated {
            let element = &self.elements[key];
            let id = stored_id(element)?;
            let links = resolve_links(element, &ids)?;
            let name = element.state.instance_name.clone().unwrap_or_else(|| id.to_string());
            let row = RowWrite {
                id,
                instance_name: &name,
                values: &element.state.values,
                links: &links,
            };
            let revision = match (element.entity.is_revisioned(), element.revision) {
                (false, _) => None,
                (true, Some(current)) => {
                    close_open_revision(&self.persistor, &tx, element, id, changeset_id)?;
                    Some(current + 1)
                }
                (true, None) => {
                    return Err(DinoError::RevisionConsistency(format!(
                        "{} has no revision chain to extend",
                        element.element_name()
                    )));
                }
            };
            self.persistor
                .update_head(&tx, &element.entity, &row, revision, changeset_id)?;
            if let Some(revision) = revision {
                self.persistor
                    .insert_revision(&tx, &element.entity, &row, revision, changeset_id)?;
            }
            names.insert(*key, name);
        }
        for key in &inserted {
            let element = &self.elements[key];
            let id = ids[key];
            let links = resolve_links(element, &ids)?;
            let name = element.state.instance_name.clone().unwrap_or_else(|| id.to_string());
            let row = RowWrite {
                id,
                instance_name: &name,
                values: &element.state.values,
                links: &links,
            };
            let revision = element.entity.is_revisioned().then_some(1);
            self.persistor
                .insert_head(&tx, &element.entity, &row, revision, changeset_id)?;
            if let Some(revision) = revision {
                self.persistor
                    .insert_revision(&tx, &element.entity, &row, revision, changeset_id)?;
            }
            names.insert(*key, name);
        }
        tx.commit().map_err(|e| DinoError::backend("commit", &[], e))?;

        self.apply_commit(
            changeset_id,
            Written {
                ids,
                names,
                inserted,
                updated,
                deleted,
            },
        );
        Ok(ChangeSet {
            id: Some(changeset_id),
            committed: Some(committed_at),
            ..changeset.clone()
        })
    }

    /// Checks the pending state before anything is written.
    fn validate(&self, inserted: &[ElementKey], updated: &[ElementKey]) -> Result<()> {
        let mut seen: SeaMap<(String, String), ElementKey> = SeaMap::default();
        for key in inserted.iter().chain(updated) {
            let element = &self.elements[key];
            for relation in element.entity.to_one_relations() {
                match element.link(&relation.name) {
                    None if relation.is_required() => {
                        return Err(DinoError::RequiredAttribute {
                            entity: element.entity_name().to_string(),
                            element: element.element_name(),
                            attribute: relation.name.clone(),
                        });
                    }
                    Some(LinkTarget::Pending(target))
                        if self.elements.get(&target).is_none_or(|t| t.deleted) =>
                    {
                        return Err(DinoError::UnknownElement(format!(
                            "{} links to an element that no longer exists",
                            element.element_name()
                        )));
                    }
                    _ => {}
                }
            }
            if element.entity.template().is_some() {
                match naming::derive_at(self, &element.entity, &element.state, element.id, 0)? {
                    DerivedName::Missing(path) => {
                        return Err(DinoError::name(
                            element.element_name(),
                            format!("name component {{{path}}} has no value"),
                        ));
                    }
                    DerivedName::Named(name) if name.is_empty() => {
                        return Err(DinoError::name(element.element_name(), "derived name is empty"));
                    }
                    DerivedName::Named(_) => {}
                }
            }
            let Some(name) = element.instance_name() else {
                continue;
            };
            let name_key = (element.entity_name().to_string(), name.to_string());
            if let Some(other) = seen.insert(name_key, *key) {
                return Err(DinoError::name(
                    element.element_name(),
                    format!("name is also derived by {}", self.elements[&other].element_name()),
                ));
            }
            if element.stored_name() == Some(name) {
                continue;
            }
            if let Some(holder) = self.persistor.id_by_name(&self.conn, &element.entity, name)? {
                if Some(holder) == element.id {
                    continue;
                }
                // the current holder may be renamed or deleted in this same changeset
                let released = self
                    .by_id
                    .get(&(element.entity_name().to_string(), holder))
                    .and_then(|k| self.elements.get(k))
                    .is_some_and(|h| h.deleted || h.instance_name() != Some(name));
                if !released {
                    return Err(DinoError::name(
                        element.element_name(),
                        format!("{}:{{{holder}}} already has this name", element.entity_name()),
                    ));
                }
            }
        }
        Ok(())
    }

    fn apply_commit(&mut self, changeset_id: i64, written: Written) {
        let Written {
            ids,
            names,
            inserted,
            updated,
            deleted,
        } = written;
        for key in &deleted {
            if let Some(element) = self.elements.remove(key) {
                if let Some(id) = element.id {
                    self.by_id.remove(&(element.entity_name().to_string(), id));
                }
            }
        }
        for key in &inserted {
            let Some(element) = self.elements.get_mut(key) else {
                continue;
            };
            let revisioned = element.entity.is_revisioned();
            element.id = ids.get(key).copied();
            element.revision = revisioned.then_some(1);
            element.changeset_id = revisioned.then_some(changeset_id);
            element.form_id = None;
            if let Some(id) = element.id {
                self.by_id.insert((element.entity_name().to_string(), id), *key);
            }
        }
        for key in &updated {
            if let Some(element) = self.elements.get_mut(key) {
                if element.entity.is_revisioned() {
                    element.revision = element.revision.map(|r| r + 1);
                    element.changeset_id = Some(changeset_id);
                }
            }
        }
        for element in self.elements.values_mut() {
            if let Some(name) = names.get(&element.key) {
                element.state.instance_name = Some(name.clone());
            }
            for link in element.state.links.values_mut() {
                if let Some(LinkTarget::Pending(target)) = link {
                    *link = ids.get(target).map(|id| LinkTarget::Stored(*id));
                }
            }
            element.original = Some(element.state.clone());
        }
        self.form_ids.clear();
        self.names.clear();
    }

    // ------------- History -------------
    fn history_of(&self, key: ElementKey) -> Result<Option<(Arc<EntityType>, i64)>> {
        let element = self.element(key)?;
        if !element.entity.is_revisioned() {
            return Err(DinoError::RevisionConsistency(format!(
                "{} is not revisioned",
                element.entity_name()
            )));
        }
        Ok(element.id.map(|id| (Arc::clone(&element.entity), id)))
    }

    /// The element as it was when `changeset` was committed, or `None` if it did
    /// not exist then.
    pub fn revision_at(&self, key: ElementKey, changeset: i64) -> Result<Option<Revision>> {
        let Some((entity, id)) = self.history_of(key)? else {
            return Ok(None);
        };
        self.stored_revision_at(&entity, id, changeset)
    }

    /// Revision of any stored element by type and id, including deleted ones.
    pub fn stored_revision_at(&self, entity: &Arc<EntityType>, id: i64, changeset: i64) -> Result<Option<Revision>> {
        let row = self.persistor.revision_at(&self.conn, entity, id, changeset)?;
        Ok(row.map(|row| Revision::new(Arc::clone(entity), row, changeset)))
    }

    /// Revision number `number` of the element, viewed as of its own changeset.
    pub fn revision(&self, key: ElementKey, number: i64) -> Result<Option<Revision>> {
        let Some((entity, id)) = self.history_of(key)? else {
            return Ok(None);
        };
        let row = self.persistor.revision_number(&self.conn, &entity, id, number)?;
        Ok(row.map(|row| {
            let view = row.changeset_id;
            Revision::new(entity, row, view)
        }))
    }

    /// Every revision of the element, oldest first.
    pub fn revisions(&self, key: ElementKey) -> Result<Vec<Revision>> {
        let Some((entity, id)) = self.history_of(key)? else {
            return Ok(Vec::new());
        };
        Ok(self
            .persistor
            .revisions(&self.conn, &entity, id)?
            .into_iter()
            .map(|row| {
                let view = row.changeset_id;
                Revision::new(Arc::clone(&entity), row, view)
            })
            .collect())
    }

    pub fn changeset(&self, id: i64) -> Result<Option<ChangeSet>> {
        self.persistor.changeset(&self.conn, id)
    }
}

fn stored_id(element: &Element) -> Result<i64> {
    element.id.ok_or_else(|| {
        DinoError::RevisionConsistency(format!("{} has never been stored", element.element_name()))
    })
}

fn close_open_revision(
    persistor: &Persistor,
    conn: &rusqlite::Connection,
    element: &Element,
    id: i64,
    changeset_id: i64,
) -> Result<()> {
    match persistor.close_revision(conn, &element.entity, id, changeset_id)? {
        1 => Ok(()),
        closed => Err(DinoError::RevisionConsistency(format!(
            "{} has {closed} open revisions before changeset {changeset_id}, expected one",
            element.element_name()
        ))),
    }
}

fn resolve_links(element: &Element, ids: &BTreeMap<ElementKey, i64>) -> Result<BTreeMap<String, Option<i64>>> {
    let mut links = BTreeMap::new();
    for (relation, link) in &element.state.links {
        let id = match link {
            None => None,
            Some(LinkTarget::Stored(id)) => Some(*id),
            Some(LinkTarget::Pending(target)) => Some(*ids.get(target).ok_or_else(|| {
                DinoError::UnknownElement(format!("{}/{relation} links to an unsaved element", element.element_name()))
            })?),
        };
        links.insert(relation.clone(), id);
    }
    Ok(links)
}

// ------------- Revisions -------------
/// One stored revision of an element, read as of a particular changeset.
///
/// Relations followed from a revision are read as of the same changeset, so a
/// whole neighbourhood of elements can be inspected at one point in time.
#[derive(Debug, Clone)]
pub struct Revision {
    entity: Arc<EntityType>,
    row: RevisionRow,
    view: i64,
}

impl Revision {
    fn new(entity: Arc<EntityType>, row: RevisionRow, view: i64) -> Revision {
        Revision { entity, row, view }
    }

    pub fn entity(&self) -> &Arc<EntityType> {
        &self.entity
    }

    pub fn id(&self) -> i64 {
        self.row.head_id
    }

    pub fn revision(&self) -> i64 {
        self.row.revision
    }

    pub fn changeset_id(&self) -> i64 {
        self.row.changeset_id
    }

    pub fn changeset_invalid_id(&self) -> Option<i64> {
        self.row.changeset_invalid_id
    }

    /// The changeset this revision is viewed at.
    pub fn view(&self) -> i64 {
        self.view
    }

    /// Changesets `[from, until)` during which this revision was current.
    pub fn window(&self) -> (i64, Option<i64>) {
        (self.row.changeset_id, self.row.changeset_invalid_id)
    }

    pub fn is_current(&self) -> bool {
        self.row.changeset_invalid_id.is_none()
    }

    pub fn instance_name(&self) -> Option<&str> {
        self.row.instance_name.as_deref()
    }

    pub fn element_name(&self) -> String {
        match self.instance_name() {
            Some(name) => crate::objectspec::ObjectSpec::ElementName {
                entity: self.entity.name().to_string(),
                instance_name: name.to_string(),
            }
            .to_string(),
            None => format!("{}:{{{}}}", self.entity.name(), self.id()),
        }
    }

    pub fn value(&self, field: &str) -> &Value {
        self.row.values.get(field).unwrap_or(&Value::Null)
    }

    pub fn link(&self, relation: &str) -> Option<i64> {
        self.row.links.get(relation).copied().flatten()
    }

    /// Follows a relation as of this revision's view. To-one relations give at
    /// most one revision, to-many relations give one per member.
    pub fn follow(&self, session: &Session, relation: &str) -> Result<Vec<Revision>> {
        let relation = self
            .entity
            .relation(relation)
            .ok_or_else(|| DinoError::attribute(self.entity.name(), relation, "no such relation"))?;
        let target = session.entity_type(&relation.target)?;
        if !target.is_revisioned() {
            return Err(DinoError::RevisionConsistency(format!(
                "{} is not revisioned, its history cannot be followed",
                target.name()
            )));
        }
        let view = |row: RevisionRow| Revision::new(Arc::clone(&target), row, self.view);
        match relation.inverse() {
            None => {
                let Some(id) = self.link(&relation.name) else {
                    return Ok(Vec::new());
                };
                let row = session.persistor.revision_at(&session.conn, &target, id, self.view)?;
                Ok(row.into_iter().map(view).collect())
            }
            Some(inverse) => Ok(session
                .persistor
                .members_at(&session.conn, &target, inverse, self.id(), self.view)?
                .into_iter()
                .map(view)
                .collect()),
        }
    }
}
