use std::sync::Arc;

use dinodb::inventory;
use dinodb::{ChangesetState, Database, DinoError, ElementKey, PersistenceMode, Session};

fn create(session: &mut Session, entity: &str, values: &[(&str, &str)]) -> ElementKey {
    let key = session.create(entity).expect("Failed to create element");
    for (property, value) in values {
        session
            .set(key, property, value)
            .unwrap_or_else(|e| panic!("Failed to set {entity}/{property}: {e}"));
    }
    key
}

fn seed(database: &Database) {
    let mut session = database.session().expect("Failed to open session");
    create(&mut session, "Site", &[("name", "sjc1")]);
    create(&mut session, "Rack", &[("name", "r1"), ("site", "sjc1")]);
    create(&mut session, "Rack", &[("name", "r2"), ("site", "sjc1")]);
    create(&mut session, "Pod", &[("name", "pod1")]);
    for hid in ["ab12cd", "cd34ef", "ef56ab"] {
        create(&mut session, "Device", &[("hid", hid), ("hw_class", "server"), ("rack", "r1.sjc1")]);
    }
    for hid in ["sw0001", "sw0002"] {
        create(&mut session, "Device", &[("hid", hid), ("hw_class", "switch"), ("rack", "r1.sjc1")]);
    }
    create(&mut session, "Host", &[("name", "web1"), ("pod", "pod1"), ("device", "ab12cd")]);
    create(&mut session, "Interface", &[("port_name", "eth0"), ("host", "web1.pod1.sjc1")]);
    let changeset = session.submit_changeset().expect("Failed to commit seed data");
    assert_eq!(changeset.id, Some(1), "Seed data should be the first changeset");
}

fn setup() -> Database {
    let database = Database::new(inventory::schema().expect("Failed to build schema"), PersistenceMode::InMemory)
        .expect("Failed to create database");
    seed(&database);
    database
}

fn file_database(name: &str) -> (Database, String) {
    let path = std::env::temp_dir()
        .join(format!("dinodb-{}-{name}.db", std::process::id()))
        .to_string_lossy()
        .into_owned();
    let _ = std::fs::remove_file(&path);
    let database = Database::new(
        inventory::schema().expect("Failed to build schema"),
        PersistenceMode::File(path.clone()),
    )
    .expect("Failed to create database file");
    seed(&database);
    (database, path)
}

/// Every row of every table, in a stable order.
fn dump(path: &str) -> Vec<String> {
    let conn = rusqlite::Connection::open(path).expect("Failed to open database file");
    let mut stmt = conn
        .prepare("select name from sqlite_master where type = 'table' order by name")
        .expect("Failed to list tables");
    let tables: Vec<String> = stmt
        .query_map([], |row| row.get(0))
        .expect("Failed to list tables")
        .collect::<Result<_, _>>()
        .expect("Failed to read table names");
    let mut lines = Vec::new();
    for table in tables {
        let mut stmt = conn
            .prepare(&format!("select * from \"{table}\" order by 1, 2"))
            .expect("Failed to select table");
        let columns = stmt.column_count();
        let rows = stmt
            .query_map([], |row| {
                let mut values = Vec::with_capacity(columns);
                for i in 0..columns {
                    values.push(format!("{:?}", row.get::<_, rusqlite::types::Value>(i)?));
                }
                Ok(values.join("|"))
            })
            .expect("Failed to read rows");
        for row in rows {
            lines.push(format!("{table}: {}", row.expect("Failed to read row")));
        }
    }
    lines
}

fn find(session: &mut Session, entity: &str, name: &str) -> ElementKey {
    session
        .find_element(entity, name)
        .expect("Lookup failed")
        .unwrap_or_else(|| panic!("{entity}:{name} not found"))
}

#[test]
fn changeset_state_machine() {
    let database = setup();
    let mut session = database.session().expect("Failed to open session");
    assert_eq!(*session.changeset_state(), ChangesetState::NoChangeset, "Fresh sessions have no changeset");

    let device = find(&mut session, "Device", "cd34ef");
    assert_eq!(*session.changeset_state(), ChangesetState::NoChangeset, "Reads do not open a changeset");
    session.set(device, "notes", "spare").expect("Failed to set notes");
    assert!(session.changeset_state().is_open(), "Writes open a changeset");

    let committed = session.submit_changeset().expect("Failed to commit");
    assert_eq!(committed.id, Some(2));
    assert!(committed.committed.is_some(), "Committed changesets carry a commit time");
    assert_eq!(*session.changeset_state(), ChangesetState::NoChangeset);

    let err = session.submit_changeset().unwrap_err();
    assert!(matches!(err, DinoError::RevisionConsistency(_)), "got {err}");
    session.revert_changeset().expect("Reverting without a changeset is a no-op");
}

#[test]
fn changeset_info_is_stored() {
    let database = setup();
    let mut session = database.session().expect("Failed to open session");
    let device = find(&mut session, "Device", "ef56ab");
    session.set(device, "status", "deployed").expect("Failed to set status");
    session
        .set_changeset_info(Some("ops"), Some("deploy ef56ab"))
        .expect("Failed to set changeset info");
    let committed = session.submit_changeset().expect("Failed to commit");

    let stored = session
        .changeset(committed.id.expect("Committed changeset has an id"))
        .expect("Failed to read changeset")
        .expect("Changeset is stored");
    assert_eq!(stored.author.as_deref(), Some("ops"));
    assert_eq!(stored.comment.as_deref(), Some("deploy ef56ab"));
    assert!(stored.committed.is_some());
    assert!(session.changeset(99).expect("Failed to read changeset").is_none());
}

#[test]
fn cascade_renames_dependents_in_one_commit() {
    let database = setup();
    let mut session = database.session().expect("Failed to open session");
    let site = find(&mut session, "Site", "sjc1");
    let host = find(&mut session, "Host", "web1.pod1.sjc1");
    session.set(site, "name", "sjc2").expect("Failed to rename site");

    assert_eq!(
        session.derive_name(host).expect("Failed to derive"),
        Some("web1.pod1.sjc2".to_string()),
        "Derivation sees pending changes"
    );
    assert_eq!(
        session.element(host).expect("Host is loaded").instance_name(),
        Some("web1.pod1.sjc1"),
        "Stored names of dependents change on commit"
    );

    let committed = session.submit_changeset().expect("Failed to commit rename");
    assert_eq!(committed.id, Some(2));

    let mut fresh = database.session().expect("Failed to open session");
    for (entity, name) in [
        ("Site", "sjc2"),
        ("Rack", "r1.sjc2"),
        ("Rack", "r2.sjc2"),
        ("Host", "web1.pod1.sjc2"),
        ("Interface", "web1.pod1.sjc2_eth0"),
    ] {
        let key = find(&mut fresh, entity, name);
        assert_eq!(fresh.element(key).expect("Loaded").changeset_id(), Some(2), "{entity}:{name}");
    }
    assert!(fresh.find_element("Host", "web1.pod1.sjc1").expect("Lookup failed").is_none());
    let host = find(&mut fresh, "Host", "web1.pod1.sjc2");
    assert_eq!(fresh.element(host).expect("Loaded").revision(), Some(2), "Renamed host gets a new revision");
    let device = find(&mut fresh, "Device", "ab12cd");
    assert_eq!(fresh.element(device).expect("Loaded").revision(), Some(1), "Devices do not depend on sites");
}

#[test]
fn revisions_accumulate() {
    let database = setup();
    let mut session = database.session().expect("Failed to open session");
    let device = find(&mut session, "Device", "ab12cd");
    session.set(device, "notes", "first").expect("Failed to set notes");
    session.submit_changeset().expect("Failed to commit");
    session.set(device, "notes", "second").expect("Failed to set notes");
    session.submit_changeset().expect("Failed to commit");

    let revisions = session.revisions(device).expect("Failed to read revisions");
    assert_eq!(revisions.len(), 3, "Seed plus two updates");
    let windows: Vec<(i64, Option<i64>)> = revisions.iter().map(|r| r.window()).collect();
    assert_eq!(windows, vec![(1, Some(2)), (2, Some(3)), (3, None)]);
    assert!(revisions[2].is_current());
    assert!(!revisions[0].is_current());

    let first = session.revision(device, 1).expect("Failed to read").expect("Revision 1 exists");
    assert_eq!(first.value("notes").to_string(), "");
    assert_eq!(first.view(), 1);
    let at_two = session.revision_at(device, 2).expect("Failed to read").expect("Exists at 2");
    assert_eq!(at_two.revision(), 2);
    assert_eq!(at_two.value("notes").to_string(), "first");
    assert!(session.revision(device, 4).expect("Failed to read").is_none());
}

#[test]
fn point_in_time_navigation() {
    let database = setup();
    let mut session = database.session().expect("Failed to open session");
    let site = find(&mut session, "Site", "sjc1");
    session.set(site, "name", "sjc2").expect("Failed to rename site");
    session.submit_changeset().expect("Failed to commit");
    let device = find(&mut session, "Device", "sw0002");
    session.set(device, "rack", "r2.sjc2").expect("Failed to move device");
    session.submit_changeset().expect("Failed to commit");

    let host = find(&mut session, "Host", "web1.pod1.sjc2");
    let then = session.revision_at(host, 1).expect("Failed to read").expect("Host existed at 1");
    assert_eq!(then.element_name(), "Host:web1.pod1.sjc1");
    let device = then.follow(&session, "device").expect("Failed to follow device");
    let rack = device[0].follow(&session, "rack").expect("Failed to follow rack");
    let site = rack[0].follow(&session, "site").expect("Failed to follow site");
    assert_eq!(site[0].instance_name(), Some("sjc1"), "Followed as of changeset 1");
    assert_eq!(site[0].view(), 1);

    let members = rack[0].follow(&session, "devices").expect("Failed to follow devices");
    assert_eq!(members.len(), 5, "Every device was in r1 at changeset 1");

    let r1 = find(&mut session, "Rack", "r1.sjc2");
    let now = session.revision_at(r1, 3).expect("Failed to read").expect("Rack exists at 3");
    let members = now.follow(&session, "devices").expect("Failed to follow devices");
    assert_eq!(members.len(), 4, "sw0002 moved to r2 in changeset 3");

    let err = device[0].follow(&session, "chassis").unwrap_err();
    assert!(matches!(err, DinoError::RevisionConsistency(_)), "got {err}");
}

#[test]
fn deleted_elements_keep_their_history() {
    let database = setup();
    let mut session = database.session().expect("Failed to open session");
    let interface = find(&mut session, "Interface", "web1.pod1.sjc1_eth0");
    let id = session.element(interface).expect("Loaded").id().expect("Stored");
    session.delete(interface).expect("Failed to delete");
    assert!(
        session.find_element("Interface", "web1.pod1.sjc1_eth0").expect("Lookup failed").is_none(),
        "Deleted elements cannot be found"
    );
    session.submit_changeset().expect("Failed to commit delete");

    let entity = Arc::clone(session.schema().get("Interface").expect("Interface type"));
    let before = session
        .stored_revision_at(&entity, id, 1)
        .expect("Failed to read")
        .expect("Existed at changeset 1");
    assert_eq!(before.window(), (1, Some(2)));
    assert!(session.stored_revision_at(&entity, id, 2).expect("Failed to read").is_none());

    let mut fresh = database.session().expect("Failed to open session");
    assert!(fresh.resolve_element_spec(&format!("Interface:{{{id}}}")).expect("Resolve failed").is_none());
}

#[test]
fn revert_restores_session_state() {
    let database = setup();
    let mut session = database.session().expect("Failed to open session");
    let device = find(&mut session, "Device", "cd34ef");
    let rack = find(&mut session, "Rack", "r2.sjc1");
    create(&mut session, "Pod", &[("name", "pod2")]);
    session.set(device, "notes", "scratch").expect("Failed to set notes");
    session.delete(rack).expect("Failed to delete rack");

    session.revert_changeset().expect("Failed to revert");
    assert_eq!(*session.changeset_state(), ChangesetState::NoChangeset);
    assert_eq!(session.get_text(device, "notes").expect("Failed to read"), "");
    assert!(!session.element(rack).expect("Still held").is_deleted());
    assert!(session.find_element("Pod", "pod2").expect("Lookup failed").is_none());
    assert!(session.resolve_element_spec("Pod:<1>").expect("Resolve failed").is_none());
    assert!(session.change_description().expect("Failed to describe").is_empty());
}

#[test]
fn revert_leaves_storage_untouched() {
    let (database, path) = file_database("revert");
    let before = dump(&path);
    let mut session = database.session().expect("Failed to open session");
    let site = find(&mut session, "Site", "sjc1");
    session.set(site, "name", "sjc9").expect("Failed to rename");
    create(&mut session, "Pod", &[("name", "pod3")]);
    session.revert_changeset().expect("Failed to revert");
    assert_eq!(dump(&path), before, "Reverting writes nothing");
    drop(session);
    drop(database);
    let _ = std::fs::remove_file(&path);
}

#[test]
fn failed_commit_rolls_back() {
    let (database, path) = file_database("rollback");
    let before = dump(&path);
    let mut session = database.session().expect("Failed to open session");
    let pod = find(&mut session, "Pod", "pod1");
    session.set(pod, "name", "pod5").expect("Failed to rename pod");
    let site = find(&mut session, "Site", "sjc1");
    session.delete(site).expect("Failed to delete site");

    let err = session.submit_changeset().unwrap_err();
    assert!(matches!(err, DinoError::Backend { .. }), "Racks still reference the site, got {err}");
    assert!(session.changeset_state().is_open(), "A failed commit keeps the changeset open");
    assert_eq!(dump(&path), before, "Nothing of the failed commit is stored");

    session.revert_changeset().expect("Failed to revert");
    let mut fresh = database.session().expect("Failed to open session");
    assert!(fresh.find_element("Site", "sjc1").expect("Lookup failed").is_some());
    assert!(fresh.find_element("Pod", "pod1").expect("Lookup failed").is_some());
    drop(session);
    drop(fresh);
    drop(database);
    let _ = std::fs::remove_file(&path);
}

#[test]
fn required_relations_are_checked() {
    let database = setup();
    let mut session = database.session().expect("Failed to open session");
    create(&mut session, "Rack", &[("name", "r9")]);
    let err = session.submit_changeset().unwrap_err();
    assert!(
        matches!(err, DinoError::RequiredAttribute { ref attribute, .. } if attribute == "site"),
        "got {err}"
    );
    assert!(session.changeset_state().is_open());

    let rack = session.resolve_element_spec("Rack:<1>").expect("Resolve failed").expect("Pending rack");
    session.set(rack, "site", "Site:sjc1").expect("Failed to set site");
    session.submit_changeset().expect("Commit succeeds once the site is set");
    assert!(session.find_element("Rack", "r9.sjc1").expect("Lookup failed").is_some());
}

#[test]
fn unrevisioned_types_keep_no_history() {
    let database = setup();
    let mut session = database.session().expect("Failed to open session");
    let chassis = create(&mut session, "Chassis", &[("vendor", "acme"), ("model", "x1"), ("units", "2")]);
    let device = find(&mut session, "Device", "ab12cd");
    session.set(device, "chassis", "acme_x1").expect("Failed to link chassis");
    session.submit_changeset().expect("Failed to commit");

    let element = session.element(chassis).expect("Held");
    assert!(element.id().is_some());
    assert_eq!(element.revision(), None);
    assert_eq!(element.changeset_id(), None);
    let err = session.revisions(chassis).unwrap_err();
    assert!(matches!(err, DinoError::RevisionConsistency(_)), "got {err}");

    session.set(chassis, "units", "4").expect("Failed to update units");
    session.submit_changeset().expect("Unrevisioned updates commit");
    let mut fresh = database.session().expect("Failed to open session");
    let chassis = find(&mut fresh, "Chassis", "acme_x1");
    assert_eq!(fresh.get_text(chassis, "units").expect("Failed to read"), "4");
    let device = find(&mut fresh, "Device", "ab12cd");
    assert_eq!(fresh.get_text(device, "chassis").expect("Failed to read"), "Chassis:acme_x1");
}

#[test]
fn large_cascades_from_a_fresh_session() {
    let database = Database::new(inventory::schema().expect("Failed to build schema"), PersistenceMode::InMemory)
        .expect("Failed to create database");
    let mut session = database.session().expect("Failed to open session");
    create(&mut session, "Site", &[("name", "sjc1")]);
    create(&mut session, "Rack", &[("name", "r1"), ("site", "sjc1")]);
    create(&mut session, "Pod", &[("name", "pod1")]);
    for n in 0..150 {
        let hid = format!("d{n:03}");
        create(&mut session, "Device", &[("hid", &hid), ("rack", "r1.sjc1")]);
        create(&mut session, "Host", &[("name", &format!("h{n:03}")), ("pod", "pod1"), ("device", &hid)]);
    }
    session.submit_changeset().expect("Failed to commit seed data");
    drop(session);

    let mut fresh = database.session().expect("Failed to open session");
    let site = fresh.find_element("Site", "sjc1").expect("Lookup failed").expect("Site exists");
    fresh.set(site, "name", "sjc2").expect("Failed to rename site");
    fresh.submit_changeset().expect("Every host follows the site");

    let mut check = database.session().expect("Failed to open session");
    assert!(check.find_element("Rack", "r1.sjc2").expect("Lookup failed").is_some());
    for n in [0, 127, 128, 149] {
        let name = format!("h{n:03}.pod1.sjc2");
        assert!(check.find_element("Host", &name).expect("Lookup failed").is_some(), "{name} missing");
    }
    assert!(check.find_element("Host", "h149.pod1.sjc1").expect("Lookup failed").is_none());
}
