// used for persistence
use rusqlite::types::Value as SqlValue;
use rusqlite::{Connection, OptionalExtension, params_from_iter};

// used for the id sets returned by queries
use roaring::RoaringTreemap;

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::NaiveDateTime;
use tracing::{debug, trace};

use crate::SeaMap;
use crate::changeset::ChangeSet;
use crate::datatype::Value;
use crate::error::{DinoError, Result};
use crate::schema::{EntityType, Schema};

pub(crate) fn quote(identifier: &str) -> String {
    format!("\"{identifier}\"")
}

/// Head row of an element as stored.
#[derive(Debug, Clone)]
pub struct StoredRow {
    pub id: i64,
    pub instance_name: Option<String>,
    pub revision: Option<i64>,
    pub changeset_id: Option<i64>,
    pub values: BTreeMap<String, Value>,
    pub links: BTreeMap<String, Option<i64>>,
}

/// Revision row of an element as stored.
#[derive(Debug, Clone)]
pub struct RevisionRow {
    pub head_id: i64,
    pub revision: i64,
    pub changeset_id: i64,
    pub changeset_invalid_id: Option<i64>,
    pub instance_name: Option<String>,
    pub values: BTreeMap<String, Value>,
    pub links: BTreeMap<String, Option<i64>>,
}

/// State written to a head row and its revision snapshot.
pub(crate) struct RowWrite<'a> {
    pub id: i64,
    pub instance_name: &'a str,
    pub values: &'a BTreeMap<String, Value>,
    pub links: &'a BTreeMap<String, Option<i64>>,
}

fn integer(value: &SqlValue) -> Option<i64> {
    match value {
        SqlValue::Integer(i) => Some(*i),
        _ => None,
    }
}

fn text(value: SqlValue) -> Option<String> {
    match value {
        SqlValue::Text(t) => Some(t),
        _ => None,
    }
}

// ------------- Statements -------------
struct TableSql {
    select_by_id: String,
    select_by_name: String,
    select_ids: String,
    insert_head: String,
    update_head: String,
    release_name: String,
    delete_head: String,
    next_id: String,
    insert_revision: String,
    close_revision: String,
    revision_at: String,
    revision_number: String,
    revisions: String,
}

impl TableSql {
    fn new(entity: &EntityType) -> TableSql {
        let table = quote(entity.table());
        let revision_table = quote(&entity.revision_table());
        let data: Vec<String> = data_columns(entity).iter().map(|c| quote(c)).collect();
        let data_list = data.iter().map(|c| format!(", {c}")).collect::<String>();
        let data_marks = ", ?".repeat(data.len());
        let data_sets = data.iter().map(|c| format!(", {c} = ?")).collect::<String>();
        let (meta, meta_marks, meta_sets) = if entity.is_revisioned() {
            ("revision, changeset_id", ", ?, ?", ", revision = ?, changeset_id = ?")
        } else {
            ("null, null", "", "")
        };
        let insert_meta = if entity.is_revisioned() { ", revision, changeset_id" } else { "" };
        let revision_columns = format!("head_id, revision, changeset_id, changeset_invalid_id, instance_name{data_list}");
        let next_id = if entity.is_revisioned() {
            format!(
                "select max(coalesce((select max(id) from {table}), 0), coalesce((select max(head_id) from {revision_table}), 0)) + 1"
            )
        } else {
            format!("select coalesce(max(id), 0) + 1 from {table}")
        };
        TableSql {
            select_by_id: format!("select id, instance_name, {meta}{data_list} from {table} where id = ?"),
            select_by_name: format!("select id from {table} where instance_name = ?"),
            select_ids: format!("select id from {table}"),
            insert_head: format!(
                "insert into {table} (id, instance_name{insert_meta}{data_list}) values (?, ?{meta_marks}{data_marks})"
            ),
            update_head: format!("update {table} set instance_name = ?{meta_sets}{data_sets} where id = ?"),
            release_name: format!("update {table} set instance_name = null where id = ?"),
            delete_head: format!("delete from {table} where id = ?"),
            next_id,
            insert_revision: format!(
                "insert into {revision_table} (head_id, revision, changeset_id, instance_name{data_list}) values (?, ?, ?, ?{data_marks})"
            ),
            close_revision: format!(
                "update {revision_table} set changeset_invalid_id = ? \
                 where head_id = ? and changeset_invalid_id is null and changeset_id < ?"
            ),
            revision_at: format!(
                "select {revision_columns} from {revision_table} \
                 where head_id = ? and changeset_id <= ? and (changeset_invalid_id is null or ? < changeset_invalid_id)"
            ),
            revision_number: format!("select {revision_columns} from {revision_table} where head_id = ? and revision = ?"),
            revisions: format!("select {revision_columns} from {revision_table} where head_id = ? order by revision"),
        }
    }
}

/// Field columns followed by to-one relation columns.
fn data_columns(entity: &EntityType) -> Vec<String> {
    entity
        .fields()
        .iter()
        .map(|f| f.name.clone())
        .chain(entity.to_one_relations().map(|r| r.column()))
        .collect()
}

fn data_params(entity: &EntityType, values: &BTreeMap<String, Value>, links: &BTreeMap<String, Option<i64>>) -> Vec<SqlValue> {
    let fields = entity
        .fields()
        .iter()
        .map(|f| values.get(&f.name).map(Value::to_sql).unwrap_or(SqlValue::Null));
    let relations = entity
        .to_one_relations()
        .map(|r| links.get(&r.name).copied().flatten().map(SqlValue::Integer).unwrap_or(SqlValue::Null));
    fields.chain(relations).collect()
}

type Decoded = (BTreeMap<String, Value>, BTreeMap<String, Option<i64>>);

fn decode_data(entity: &EntityType, columns: &mut impl Iterator<Item = SqlValue>) -> Result<Decoded> {
    let mut values = BTreeMap::new();
    for field in entity.fields() {
        let column = columns.next().unwrap_or(SqlValue::Null);
        values.insert(field.name.clone(), field.field_type.from_sql(&field.name, column)?);
    }
    let mut links = BTreeMap::new();
    for relation in entity.to_one_relations() {
        let column = columns.next().unwrap_or(SqlValue::Null);
        links.insert(relation.name.clone(), integer(&column));
    }
    Ok((values, links))
}

// ------------- Persistence -------------
/// SQL for every entity type, generated once per schema.
pub struct Persistor {
    schema: Arc<Schema>,
    tables: SeaMap<String, TableSql>,
}

impl Persistor {
    pub fn new(schema: Arc<Schema>) -> Persistor {
        let tables = schema
            .entity_types()
            .map(|t| (t.name().to_string(), TableSql::new(t)))
            .collect();
        Persistor { schema, tables }
    }

    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    fn sql(&self, entity: &EntityType) -> Result<&TableSql> {
        self.tables
            .get(entity.name())
            .ok_or_else(|| DinoError::UnknownEntityType(entity.name().to_string()))
    }

    pub fn create_schema(&self, conn: &Connection) -> Result<()> {
        let mut ddl = String::from(
            "
            create table if not exists changeset (
                id integer not null,
                created text not null,
                committed text,
                author text,
                comment text,
                constraint referenceable_changeset_id primary key (id)
            );",
        );
        for entity in self.schema.entity_types() {
            ddl.push_str(&table_ddl(entity, &self.schema));
        }
        conn.execute_batch(&ddl)
            .map_err(|e| DinoError::backend("create schema", &[], e))?;
        debug!(tables = self.tables.len(), "schema created");
        Ok(())
    }

    pub fn drop_schema(&self, conn: &Connection) -> Result<()> {
        let mut ddl = String::new();
        for entity in self.schema.entity_types() {
            ddl.push_str(&format!(
                "drop table if exists {}; drop table if exists {};",
                quote(&entity.revision_table()),
                quote(entity.table())
            ));
        }
        ddl.push_str("drop table if exists changeset;");
        conn.execute_batch(&format!("pragma foreign_keys = off; {ddl} pragma foreign_keys = on;"))
            .map_err(|e| DinoError::backend("drop schema", &[], e))?;
        debug!("schema dropped");
        Ok(())
    }

    // ------------- Reads -------------
    pub fn fetch(&self, conn: &Connection, entity: &EntityType, id: i64) -> Result<Option<StoredRow>> {
        let sql = &self.sql(entity)?.select_by_id;
        let Some(row) = rows(conn, sql, &[SqlValue::Integer(id)])?.into_iter().next() else {
            return Ok(None);
        };
        let mut columns = row.into_iter();
        let id = columns.next().as_ref().and_then(integer).unwrap_or(id);
        let instance_name = columns.next().and_then(text);
        let revision = columns.next().as_ref().and_then(integer);
        let changeset_id = columns.next().as_ref().and_then(integer);
        let (values, links) = decode_data(entity, &mut columns)?;
        Ok(Some(StoredRow {
            id,
            instance_name,
            revision,
            changeset_id,
            values,
            links,
        }))
    }

    pub fn id_by_name(&self, conn: &Connection, entity: &EntityType, name: &str) -> Result<Option<i64>> {
        let sql = &self.sql(entity)?.select_by_name;
        let params = [SqlValue::Text(name.to_string())];
        let mut stmt = conn.prepare_cached(sql).map_err(|e| DinoError::backend(sql, &params, e))?;
        stmt.query_row(params_from_iter(params.iter()), |row| row.get(0))
            .optional()
            .map_err(|e| DinoError::backend(sql, &params, e))
    }

    pub fn all_ids(&self, conn: &Connection, entity: &EntityType) -> Result<RoaringTreemap> {
        ids(conn, &self.sql(entity)?.select_ids, &[])
    }

    /// Ids of `target` elements whose `inverse` relation points at `owner`.
    pub fn member_ids(&self, conn: &Connection, target: &EntityType, inverse: &str, owner: i64) -> Result<RoaringTreemap> {
        let sql = format!(
            "select id from {} where {} = ?",
            quote(target.table()),
            quote(&format!("{inverse}_id"))
        );
        ids(conn, &sql, &[SqlValue::Integer(owner)])
    }

    /// Ids of `dependent` elements that reach `watched` by walking `path`.
    pub fn dependents(&self, conn: &Connection, dependent: &EntityType, path: &[String], watched: i64) -> Result<RoaringTreemap> {
        let Some((last, hops)) = path.split_last() else {
            let mut own = RoaringTreemap::new();
            own.insert(watched as u64);
            return Ok(own);
        };
        let mut sql = format!("select t0.id from {} t0", quote(dependent.table()));
        let mut owner = Arc::clone(self.schema.entity(dependent.name())?);
        for (i, hop) in hops.iter().enumerate() {
            let relation = owner
                .relation(hop)
                .ok_or_else(|| DinoError::attribute(owner.name(), hop, "no such relation"))?;
            let target = Arc::clone(self.schema.entity(&relation.target)?);
            sql.push_str(&format!(
                " join {} t{} on t{}.id = t{}.{}",
                quote(target.table()),
                i + 1,
                i + 1,
                i,
                quote(&relation.column())
            ));
            owner = target;
        }
        sql.push_str(&format!(" where t{}.{} = ?", hops.len(), quote(&format!("{last}_id"))));
        ids(conn, &sql, &[SqlValue::Integer(watched)])
    }

    pub fn query_ids(&self, conn: &Connection, sql: &str, params: &[SqlValue]) -> Result<RoaringTreemap> {
        ids(conn, sql, params)
    }

    pub fn next_id(&self, conn: &Connection, entity: &EntityType) -> Result<i64> {
        let sql = &self.sql(entity)?.next_id;
        let mut stmt = conn.prepare_cached(sql).map_err(|e| DinoError::backend(sql, &[], e))?;
        stmt.query_row([], |row| row.get(0))
            .map_err(|e| DinoError::backend(sql, &[], e))
    }

    // ------------- Revisions -------------
    pub fn revision_at(&self, conn: &Connection, entity: &EntityType, head_id: i64, changeset: i64) -> Result<Option<RevisionRow>> {
        let sql = &self.sql(entity)?.revision_at;
        let params = [SqlValue::Integer(head_id), SqlValue::Integer(changeset), SqlValue::Integer(changeset)];
        Ok(self.revision_rows(conn, entity, sql, &params)?.into_iter().next())
    }

    pub fn revision_number(&self, conn: &Connection, entity: &EntityType, head_id: i64, revision: i64) -> Result<Option<RevisionRow>> {
        let sql = &self.sql(entity)?.revision_number;
        let params = [SqlValue::Integer(head_id), SqlValue::Integer(revision)];
        Ok(self.revision_rows(conn, entity, sql, &params)?.into_iter().next())
    }

    pub fn revisions(&self, conn: &Connection, entity: &EntityType, head_id: i64) -> Result<Vec<RevisionRow>> {
        let sql = &self.sql(entity)?.revisions;
        self.revision_rows(conn, entity, sql, &[SqlValue::Integer(head_id)])
    }

    /// Revisions of `target` elements whose `inverse` relation pointed at `owner`
    /// as of `changeset`.
    pub fn members_at(
        &self,
        conn: &Connection,
        target: &EntityType,
        inverse: &str,
        owner: i64,
        changeset: i64,
    ) -> Result<Vec<RevisionRow>> {
        let data_list = data_columns(target).iter().map(|c| format!(", {}", quote(c))).collect::<String>();
        let sql = format!(
            "select head_id, revision, changeset_id, changeset_invalid_id, instance_name{data_list} from {} \
             where {} = ? and changeset_id <= ? and (changeset_invalid_id is null or ? < changeset_invalid_id) \
             order by head_id",
            quote(&target.revision_table()),
            quote(&format!("{inverse}_id"))
        );
        let params = [SqlValue::Integer(owner), SqlValue::Integer(changeset), SqlValue::Integer(changeset)];
        self.revision_rows(conn, target, &sql, &params)
    }

    fn revision_rows(&self, conn: &Connection, entity: &EntityType, sql: &str, params: &[SqlValue]) -> Result<Vec<RevisionRow>> {
        let mut decoded = Vec::new();
        for row in rows(conn, sql, params)? {
            let mut columns = row.into_iter();
            let head_id = columns.next().as_ref().and_then(integer).unwrap_or_default();
            let revision = columns.next().as_ref().and_then(integer).unwrap_or_default();
            let changeset_id = columns.next().as_ref().and_then(integer).unwrap_or_default();
            let changeset_invalid_id = columns.next().as_ref().and_then(integer);
            let instance_name = columns.next().and_then(text);
            let (values, links) = decode_data(entity, &mut columns)?;
            decoded.push(RevisionRow {
                head_id,
                revision,
                changeset_id,
                changeset_invalid_id,
                instance_name,
                values,
                links,
            });
        }
        Ok(decoded)
    }

    // ------------- Writes -------------
    pub(crate) fn insert_changeset(&self, conn: &Connection, changeset: &ChangeSet, committed: NaiveDateTime) -> Result<i64> {
        let sql = "insert into changeset (created, committed, author, comment) values (?, ?, ?, ?)";
        let params = [
            Value::DateTime(changeset.created).to_sql(),
            Value::DateTime(committed).to_sql(),
            changeset.author.clone().map(SqlValue::Text).unwrap_or(SqlValue::Null),
            changeset.comment.clone().map(SqlValue::Text).unwrap_or(SqlValue::Null),
        ];
        execute(conn, sql, &params)?;
        Ok(conn.last_insert_rowid())
    }

    pub fn changeset(&self, conn: &Connection, id: i64) -> Result<Option<ChangeSet>> {
        let sql = "select id, created, committed, author, comment from changeset where id = ?";
        let mut stmt = conn
            .prepare_cached(sql)
            .map_err(|e| DinoError::backend(sql, &[SqlValue::Integer(id)], e))?;
        stmt.query_row([id], |row| {
            Ok(ChangeSet {
                id: row.get(0)?,
                created: row.get(1)?,
                committed: row.get(2)?,
                author: row.get(3)?,
                comment: row.get(4)?,
            })
        })
        .optional()
        .map_err(|e| DinoError::backend(sql, &[SqlValue::Integer(id)], e))
    }

    pub(crate) fn insert_head(
        &self,
        conn: &Connection,
        entity: &EntityType,
        row: &RowWrite<'_>,
        revision: Option<i64>,
        changeset: i64,
    ) -> Result<()> {
        let mut params = vec![SqlValue::Integer(row.id), SqlValue::Text(row.instance_name.to_string())];
        if entity.is_revisioned() {
            params.push(revision.map(SqlValue::Integer).unwrap_or(SqlValue::Null));
            params.push(SqlValue::Integer(changeset));
        }
        params.extend(data_params(entity, row.values, row.links));
        trace!(table = entity.table(), id = row.id, "insert head");
        execute(conn, &self.sql(entity)?.insert_head, &params).map(|_| ())
    }

    pub(crate) fn update_head(
        &self,
        conn: &Connection,
        entity: &EntityType,
        row: &RowWrite<'_>,
        revision: Option<i64>,
        changeset: i64,
    ) -> Result<()> {
        let mut params = vec![SqlValue::Text(row.instance_name.to_string())];
        if entity.is_revisioned() {
            params.push(revision.map(SqlValue::Integer).unwrap_or(SqlValue::Null));
            params.push(SqlValue::Integer(changeset));
        }
        params.extend(data_params(entity, row.values, row.links));
        params.push(SqlValue::Integer(row.id));
        trace!(table = entity.table(), id = row.id, "update head");
        execute(conn, &self.sql(entity)?.update_head, &params).map(|_| ())
    }

    /// Clears a head's name so that another head can take it before this one
    /// is written with its new name.
    pub(crate) fn release_name(&self, conn: &Connection, entity: &EntityType, id: i64) -> Result<()> {
        trace!(table = entity.table(), id, "release name");
        execute(conn, &self.sql(entity)?.release_name, &[SqlValue::Integer(id)]).map(|_| ())
    }

    pub(crate) fn delete_head(&self, conn: &Connection, entity: &EntityType, id: i64) -> Result<()> {
        trace!(table = entity.table(), id, "delete head");
        execute(conn, &self.sql(entity)?.delete_head, &[SqlValue::Integer(id)]).map(|_| ())
    }

    pub(crate) fn insert_revision(
        &self,
        conn: &Connection,
        entity: &EntityType,
        row: &RowWrite<'_>,
        revision: i64,
        changeset: i64,
    ) -> Result<()> {
        let mut params = vec![
            SqlValue::Integer(row.id),
            SqlValue::Integer(revision),
            SqlValue::Integer(changeset),
            SqlValue::Text(row.instance_name.to_string()),
        ];
        params.extend(data_params(entity, row.values, row.links));
        trace!(table = entity.table(), id = row.id, revision, changeset, "insert revision");
        execute(conn, &self.sql(entity)?.insert_revision, &params).map(|_| ())
    }

    /// Closes the open revision of `head_id`. Returns the number of rows closed,
    /// which is zero when there is no open revision created before `changeset`.
    pub(crate) fn close_revision(&self, conn: &Connection, entity: &EntityType, head_id: i64, changeset: i64) -> Result<usize> {
        let params = [SqlValue::Integer(changeset), SqlValue::Integer(head_id), SqlValue::Integer(changeset)];
        trace!(table = entity.table(), head_id, changeset, "close revision");
        execute(conn, &self.sql(entity)?.close_revision, &params)
    }
}

fn table_ddl(entity: &EntityType, schema: &Schema) -> String {
    let table = entity.table();
    let mut columns = vec!["id integer not null".to_string(), "instance_name text".to_string()];
    let mut revision_columns = vec![
        "id integer not null".to_string(),
        "head_id integer not null".to_string(),
        "revision integer not null".to_string(),
        "changeset_id integer not null".to_string(),
        "changeset_invalid_id integer".to_string(),
        "instance_name text".to_string(),
    ];
    if entity.is_revisioned() {
        columns.push("revision integer".to_string());
        columns.push("changeset_id integer".to_string());
    }
    for field in entity.fields() {
        let column = format!("{} {}", quote(&field.name), field.field_type.sql_type());
        columns.push(column.clone());
        revision_columns.push(column);
    }
    for relation in entity.to_one_relations() {
        let column = format!("{} integer", quote(&relation.column()));
        columns.push(column.clone());
        revision_columns.push(column);
    }
    let mut constraints = Vec::new();
    if entity.is_revisioned() {
        constraints.push(format!(
            "constraint {table}_changeset foreign key (changeset_id) references changeset(id)"
        ));
    }
    for relation in entity.to_one_relations() {
        let target = schema
            .get(&relation.target)
            .map(|t| t.table().to_string())
            .unwrap_or_else(|| relation.target.clone());
        constraints.push(format!(
            "constraint {table}_{} foreign key ({}) references {}(id) deferrable initially deferred",
            relation.name,
            quote(&relation.column()),
            quote(&target)
        ));
    }
    constraints.push(format!("constraint referenceable_{table}_id primary key (id)"));
    constraints.push(format!("constraint unique_{table}_instance_name unique (instance_name)"));
    let mut ddl = format!(
        "
            create table if not exists {} (
                {}
            );",
        quote(table),
        columns.into_iter().chain(constraints).collect::<Vec<_>>().join(",\n                ")
    );
    if entity.is_revisioned() {
        let revision_table = entity.revision_table();
        ddl.push_str(&format!(
            "
            create table if not exists {} (
                {},
                constraint {revision_table}_changeset foreign key (changeset_id) references changeset(id),
                constraint {revision_table}_invalidated foreign key (changeset_invalid_id) references changeset(id),
                constraint referenceable_{revision_table}_id primary key (id),
                constraint unique_{revision_table}_revision unique (head_id, revision)
            );
            create index if not exists {revision_table}_window on {} (head_id, changeset_id);
            create index if not exists {revision_table}_changeset on {} (changeset_id);",
            quote(&revision_table),
            revision_columns.join(",\n                "),
            quote(&revision_table),
            quote(&revision_table),
        ));
    }
    ddl
}

// ------------- Statement helpers -------------
fn execute(conn: &Connection, sql: &str, params: &[SqlValue]) -> Result<usize> {
    let mut stmt = conn.prepare_cached(sql).map_err(|e| DinoError::backend(sql, params, e))?;
    stmt.execute(params_from_iter(params.iter()))
        .map_err(|e| DinoError::backend(sql, params, e))
}

fn rows(conn: &Connection, sql: &str, params: &[SqlValue]) -> Result<Vec<Vec<SqlValue>>> {
    let mut stmt = conn.prepare_cached(sql).map_err(|e| DinoError::backend(sql, params, e))?;
    let width = stmt.column_count();
    let mapped = stmt
        .query_map(params_from_iter(params.iter()), |row| {
            (0..width).map(|i| row.get::<_, SqlValue>(i)).collect::<rusqlite::Result<Vec<_>>>()
        })
        .and_then(|rows| rows.collect::<rusqlite::Result<Vec<_>>>())
        .map_err(|e| DinoError::backend(sql, params, e))?;
    Ok(mapped)
}

fn ids(conn: &Connection, sql: &str, params: &[SqlValue]) -> Result<RoaringTreemap> {
    let mut found = RoaringTreemap::new();
    for row in rows(conn, sql, params)? {
        if let Some(id) = row.first().and_then(integer) {
            found.insert(id as u64);
        }
    }
    trace!(sql, found = found.len(), "id query");
    Ok(found)
}
