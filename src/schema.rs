//! Entity Type descriptors and the schema registry.
//!
//! Entity types are declared once, at process start, through
//! [`EntityType::builder`] and registered with a [`SchemaBuilder`]. Building the
//! schema validates every relation target, every to-many inverse and every
//! naming template path, then compiles the name dependency graph used at
//! commit time (see [`crate::naming`]).

use std::sync::Arc;

use tracing::debug;

use crate::SeaMap;
use crate::datatype::{FieldType, Value};
use crate::error::{DinoError, Result};
use crate::naming::{DependencyGraph, NameTemplate};

/// Bare entity name that expands to every registered entity type.
pub const WILDCARD: &str = "Element";

/// Column and form keys that no declared property may use.
pub const RESERVED: &[&str] = &[
    "id",
    "instance_name",
    "element_name",
    "revision",
    "changeset",
    "changeset_id",
    "changeset_invalid_id",
    "head_id",
];

// ------------- Properties -------------
#[derive(Debug, Clone)]
pub struct Field {
    pub name: String,
    pub field_type: FieldType,
    pub default: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelationKind {
    ToOne { required: bool },
    /// Backed by the `inverse` to-one relation declared on the target type.
    ToMany { inverse: String },
}

#[derive(Debug, Clone)]
pub struct Relation {
    pub name: String,
    pub target: String,
    pub kind: RelationKind,
}

impl Relation {
    pub fn is_to_one(&self) -> bool {
        matches!(self.kind, RelationKind::ToOne { .. })
    }

    pub fn is_required(&self) -> bool {
        matches!(self.kind, RelationKind::ToOne { required: true })
    }

    /// Column holding the target id of a to-one relation.
    pub fn column(&self) -> String {
        format!("{}_id", self.name)
    }

    pub fn inverse(&self) -> Option<&str> {
        match &self.kind {
            RelationKind::ToMany { inverse } => Some(inverse),
            RelationKind::ToOne { .. } => None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub enum Property<'a> {
    Field(&'a Field),
    Relation(&'a Relation),
}

// ------------- Entity Types -------------
#[derive(Debug)]
pub struct EntityType {
    name: String,
    table: String,
    fields: Vec<Field>,
    relations: Vec<Relation>,
    template: Option<NameTemplate>,
    revisioned: bool,
}

impl EntityType {
    pub fn builder(name: &str) -> EntityTypeBuilder {
        EntityTypeBuilder {
            name: name.to_string(),
            fields: Vec::new(),
            relations: Vec::new(),
            template: None,
            revisioned: true,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn revision_table(&self) -> String {
        format!("{}_revision", self.table)
    }

    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    pub fn relations(&self) -> &[Relation] {
        &self.relations
    }

    pub fn to_one_relations(&self) -> impl Iterator<Item = &Relation> {
        self.relations.iter().filter(|r| r.is_to_one())
    }

    pub fn field(&self, name: &str) -> Option<&Field> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn relation(&self, name: &str) -> Option<&Relation> {
        self.relations.iter().find(|r| r.name == name)
    }

    pub fn property(&self, name: &str) -> Option<Property<'_>> {
        self.field(name)
            .map(Property::Field)
            .or_else(|| self.relation(name).map(Property::Relation))
    }

    /// Like [`EntityType::property`] but failing with `InvalidAttribute`.
    pub fn require_property(&self, name: &str) -> Result<Property<'_>> {
        self.property(name)
            .ok_or_else(|| DinoError::attribute(&self.name, name, "no such property"))
    }

    pub fn template(&self) -> Option<&NameTemplate> {
        self.template.as_ref()
    }

    pub fn is_revisioned(&self) -> bool {
        self.revisioned
    }
}

impl PartialEq for EntityType {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}
impl Eq for EntityType {}

#[must_use]
pub struct EntityTypeBuilder {
    name: String,
    fields: Vec<Field>,
    relations: Vec<Relation>,
    template: Option<String>,
    revisioned: bool,
}

impl EntityTypeBuilder {
    pub fn field(mut self, name: &str, field_type: FieldType) -> Self {
        self.fields.push(Field {
            name: name.to_string(),
            field_type,
            default: None,
        });
        self
    }

    pub fn field_default(mut self, name: &str, field_type: FieldType, default: impl Into<Value>) -> Self {
        self.fields.push(Field {
            name: name.to_string(),
            field_type,
            default: Some(default.into()),
        });
        self
    }

    pub fn to_one(self, name: &str, target: &str) -> Self {
        self.relation(name, target, RelationKind::ToOne { required: false })
    }

    pub fn required_to_one(self, name: &str, target: &str) -> Self {
        self.relation(name, target, RelationKind::ToOne { required: true })
    }

    pub fn to_many(self, name: &str, target: &str, inverse: &str) -> Self {
        self.relation(
            name,
            target,
            RelationKind::ToMany {
                inverse: inverse.to_string(),
            },
        )
    }

    fn relation(mut self, name: &str, target: &str, kind: RelationKind) -> Self {
        self.relations.push(Relation {
            name: name.to_string(),
            target: target.to_string(),
            kind,
        });
        self
    }

    /// Sets the naming template, e.g. `{name}.{pod.name}(.{device.rack.site.name})`.
    pub fn named(mut self, template: &str) -> Self {
        self.template = Some(template.to_string());
        self
    }

    pub fn unrevisioned(mut self) -> Self {
        self.revisioned = false;
        self
    }

    fn build(self) -> Result<EntityType> {
        let identifier = |name: &str| {
            let mut chars = name.chars();
            chars.next().is_some_and(|c| c.is_ascii_alphabetic())
                && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        };
        if let Some(bad) = std::iter::once(&self.name)
            .chain(self.fields.iter().map(|f| &f.name))
            .chain(self.relations.iter().map(|r| &r.name))
            .find(|name| !identifier(name))
        {
            return Err(DinoError::InvalidSchema(format!("'{bad}' is not an identifier")));
        }
        let mut seen: Vec<String> = Vec::new();
        let columns = self
            .fields
            .iter()
            .map(|f| f.name.clone())
            .chain(self.relations.iter().map(|r| r.name.clone()))
            .chain(self.relations.iter().filter(|r| r.is_to_one()).map(|r| r.column()));
        for column in columns {
            if RESERVED.contains(&column.as_str()) {
                return Err(DinoError::InvalidSchema(format!(
                    "{}: '{}' is a reserved name",
                    self.name, column
                )));
            }
            if seen.contains(&column) {
                return Err(DinoError::InvalidSchema(format!(
                    "{}: '{}' is declared twice",
                    self.name, column
                )));
            }
            seen.push(column);
        }
        let template = match &self.template {
            Some(t) => Some(NameTemplate::parse(t)?),
            None => None,
        };
        Ok(EntityType {
            table: table_name(&self.name),
            name: self.name,
            fields: self.fields,
            relations: self.relations,
            template,
            revisioned: self.revisioned,
        })
    }
}

/// `IpAddress` becomes `ip_address`.
pub fn table_name(entity: &str) -> String {
    let mut table = String::with_capacity(entity.len() + 4);
    let mut previous_lower = false;
    for c in entity.chars() {
        if c.is_ascii_uppercase() {
            if previous_lower {
                table.push('_');
            }
            table.push(c.to_ascii_lowercase());
            previous_lower = false;
        } else {
            table.push(c);
            previous_lower = c.is_ascii_lowercase() || c.is_ascii_digit();
        }
    }
    table
}

// ------------- Schema -------------
#[derive(Debug)]
pub struct Schema {
    types: Vec<Arc<EntityType>>,
    by_name: SeaMap<String, usize>,
    dependencies: DependencyGraph,
}

impl Schema {
    pub fn builder() -> SchemaBuilder {
        SchemaBuilder { entities: Vec::new() }
    }

    pub fn entity_types(&self) -> impl Iterator<Item = &Arc<EntityType>> {
        self.types.iter()
    }

    /// Exact, case sensitive lookup.
    pub fn get(&self, name: &str) -> Option<&Arc<EntityType>> {
        self.by_name.get(name).map(|&i| &self.types[i])
    }

    /// Looks up an entity type by bare name: exact match first, then case
    /// insensitive, failing when the latter matches more than one type.
    pub fn entity(&self, name: &str) -> Result<&Arc<EntityType>> {
        if let Some(entity) = self.get(name) {
            return Ok(entity);
        }
        let candidates: Vec<&Arc<EntityType>> = self
            .types
            .iter()
            .filter(|t| t.name.eq_ignore_ascii_case(name))
            .collect();
        match candidates.as_slice() {
            [] => Err(DinoError::UnknownEntityType(name.to_string())),
            [one] => Ok(one),
            many => Err(DinoError::AmbiguousEntityType {
                name: name.to_string(),
                candidates: many.iter().map(|t| t.name()).collect::<Vec<_>>().join(", "),
            }),
        }
    }

    /// Resolves a bare name, expanding the wildcard to every entity type.
    pub fn expand(&self, name: &str) -> Result<Vec<Arc<EntityType>>> {
        if name == WILDCARD && self.get(name).is_none() {
            return Ok(self.types.clone());
        }
        Ok(vec![Arc::clone(self.entity(name)?)])
    }

    pub fn dependencies(&self) -> &DependencyGraph {
        &self.dependencies
    }
}

#[must_use]
pub struct SchemaBuilder {
    entities: Vec<EntityTypeBuilder>,
}

impl SchemaBuilder {
    pub fn entity(mut self, entity: EntityTypeBuilder) -> Self {
        self.entities.push(entity);
        self
    }

    pub fn build(self) -> Result<Schema> {
        let mut types = Vec::with_capacity(self.entities.len());
        let mut by_name = SeaMap::default();
        for builder in self.entities {
            let entity = builder.build()?;
            if by_name.insert(entity.name.clone(), types.len()).is_some() {
                return Err(DinoError::InvalidSchema(format!(
                    "entity type {} is registered twice",
                    entity.name
                )));
            }
            types.push(Arc::new(entity));
        }
        for entity in &types {
            for relation in &entity.relations {
                let target = by_name
                    .get(&relation.target)
                    .map(|&i| &types[i])
                    .ok_or_else(|| {
                        DinoError::InvalidSchema(format!(
                            "{}/{} targets unknown entity type {}",
                            entity.name, relation.name, relation.target
                        ))
                    })?;
                if let Some(inverse) = relation.inverse() {
                    let valid = target
                        .relation(inverse)
                        .is_some_and(|r| r.is_to_one() && r.target == entity.name);
                    if !valid {
                        return Err(DinoError::InvalidSchema(format!(
                            "{}/{}: {}/{} is not a to-one relation back to {}",
                            entity.name, relation.name, target.name, inverse, entity.name
                        )));
                    }
                }
            }
        }
        let dependencies = DependencyGraph::compile(&types)?;
        debug!(types = types.len(), listeners = dependencies.len(), "schema built");
        Ok(Schema {
            types,
            by_name,
            dependencies,
        })
    }
}
