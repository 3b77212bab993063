use dinodb::inventory;
use dinodb::{Database, PersistenceMode};

fn setup(mode: PersistenceMode) -> Database {
    Database::new(inventory::schema().expect("Failed to build schema"), mode).expect("Failed to create database")
}

fn add_site(database: &Database, name: &str) {
    let mut session = database.session().expect("Failed to open session");
    let site = session.create("Site").expect("Failed to create site");
    session.set(site, "name", name).expect("Failed to set name");
    session.submit_changeset().expect("Failed to commit");
}

fn has_site(database: &Database, name: &str) -> bool {
    let mut session = database.session().expect("Failed to open session");
    session.find_element("Site", name).expect("Lookup failed").is_some()
}

#[test]
fn in_memory_sessions_share_one_database() {
    let database = setup(PersistenceMode::InMemory);
    let mut reader = database.session().expect("Failed to open session");
    add_site(&database, "sjc1");
    assert!(
        reader.find_element("Site", "sjc1").expect("Lookup failed").is_some(),
        "Commits are visible to other sessions"
    );
}

#[test]
fn in_memory_databases_are_isolated() {
    let first = setup(PersistenceMode::InMemory);
    let second = setup(PersistenceMode::InMemory);
    add_site(&first, "sjc1");
    assert!(has_site(&first, "sjc1"));
    assert!(!has_site(&second, "sjc1"), "Each in-memory database is private");
}

#[test]
fn files_persist_across_databases() {
    let path = std::env::temp_dir()
        .join(format!("dinodb-{}-persist.db", std::process::id()))
        .to_string_lossy()
        .into_owned();
    let _ = std::fs::remove_file(&path);
    {
        let database = setup(PersistenceMode::File(path.clone()));
        add_site(&database, "sjc1");
    }
    let reopened = setup(PersistenceMode::File(path.clone()));
    assert!(has_site(&reopened, "sjc1"), "Reopening a file keeps its contents");
    add_site(&reopened, "sjc2");
    let mut session = reopened.session().expect("Failed to open session");
    let site = session.find_element("Site", "sjc2").expect("Lookup failed").expect("Site exists");
    assert_eq!(session.element(site).expect("Held").changeset_id(), Some(2));
    drop(session);
    drop(reopened);
    let _ = std::fs::remove_file(&path);
}

#[test]
fn reset_empties_every_table() {
    let database = setup(PersistenceMode::InMemory);
    add_site(&database, "sjc1");
    database.reset().expect("Failed to reset");
    assert!(!has_site(&database, "sjc1"));
    add_site(&database, "sjc1");
    let mut session = database.session().expect("Failed to open session");
    let site = session.find_element("Site", "sjc1").expect("Lookup failed").expect("Site exists");
    assert_eq!(session.element(site).expect("Held").changeset_id(), Some(1), "Changesets count from one again");
}
