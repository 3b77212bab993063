//! Dinodb – a versioned inventory store with derived names.
//!
//! Elements of declared entity types (sites, racks, devices, hosts, ...) are
//! kept in SQLite. Every write happens inside a *changeset*: committing one
//! writes a new revision of each touched element, so any element can be read
//! back as it was at any earlier changeset.
//!
//! Elements are known by *derived names*, rendered from a template over their
//! own fields and the fields of related elements, e.g.
//! `{name}.{pod.name}.{device.rack.site.name}` for a host. The templates are
//! compiled into a dependency graph when the schema is built, and a commit
//! renames every element whose name depends on something that changed.
//!
//! ## Modules
//! * [`schema`] – entity types, fields, relations and the schema builder.
//! * [`naming`] – name templates and the dependency graph between them.
//! * [`objectspec`] – the addressing grammar (`Device:ab12cd/notes`, `Device[hw_class=server]`).
//! * [`resolver`] – resolves parsed specifications against a session.
//! * [`session`] – the [`session::Database`] context and units of work.
//! * [`changeset`] – commit, revert and point-in-time revisions.
//! * [`describe`] – human readable pending changes.
//! * [`form`] – text forms for editing elements by hand.
//! * [`persist`] – the SQLite layout.
//! * [`inventory`] – the datacenter schema.
//!
//! ## Quick Start
//! ```
//! use dinodb::session::{Database, PersistenceMode};
//! let db = Database::new(dinodb::inventory::schema().unwrap(), PersistenceMode::InMemory).unwrap();
//! let mut session = db.session().unwrap();
//! let site = session.create("Site").unwrap();
//! session.set(site, "name", "sjc1").unwrap();
//! session.submit_changeset().unwrap();
//! assert!(session.find_element("Site", "sjc1").unwrap().is_some());
//! ```

pub mod changeset;
pub mod config;
pub mod datatype;
pub mod describe;
pub mod element;
pub mod error;
pub mod form;
pub mod inventory;
pub mod naming;
pub mod objectspec;
pub mod persist;
pub mod resolver;
pub mod schema;
pub mod server;
pub mod session;

/// Hash map keyed by names, using seahash.
pub(crate) type SeaMap<K, V> = std::collections::HashMap<K, V, std::hash::BuildHasherDefault<seahash::SeaHasher>>;

pub use changeset::{ChangeSet, ChangesetState, Revision};
pub use describe::{Change, ChangeDescription};
pub use element::{Attribute, AttributeValue, Element, ElementKey};
pub use error::{DinoError, Result};
pub use objectspec::{ObjectSpec, SpecKind};
pub use resolver::Resolved;
pub use session::{Database, PersistenceMode, Session};
