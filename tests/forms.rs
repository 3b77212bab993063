use dinodb::form::{apply_form, to_form};
use dinodb::inventory;
use dinodb::{Change, Database, DinoError, ElementKey, PersistenceMode, Session};

fn create(session: &mut Session, entity: &str, values: &[(&str, &str)]) -> ElementKey {
    let key = session.create(entity).expect("Failed to create element");
    for (property, value) in values {
        session
            .set(key, property, value)
            .unwrap_or_else(|e| panic!("Failed to set {entity}/{property}: {e}"));
    }
    key
}

fn setup() -> Database {
    let database = Database::new(inventory::schema().expect("Failed to build schema"), PersistenceMode::InMemory)
        .expect("Failed to create database");
    let mut session = database.session().expect("Failed to open session");
    create(&mut session, "Site", &[("name", "sjc1")]);
    create(&mut session, "Rack", &[("name", "r1"), ("site", "sjc1")]);
    create(&mut session, "Rack", &[("name", "r2"), ("site", "sjc1")]);
    create(&mut session, "Pod", &[("name", "pod1")]);
    for hid in ["ab12cd", "cd34ef"] {
        create(&mut session, "Device", &[("hid", hid), ("hw_class", "server"), ("rack", "r1.sjc1")]);
    }
    create(&mut session, "Host", &[("name", "web1"), ("pod", "pod1"), ("device", "ab12cd")]);
    session.submit_changeset().expect("Failed to commit seed data");
    database
}

fn find(session: &mut Session, entity: &str, name: &str) -> ElementKey {
    session
        .find_element(entity, name)
        .expect("Lookup failed")
        .unwrap_or_else(|| panic!("{entity}:{name} not found"))
}

#[test]
fn renders_a_stored_element() {
    let database = setup();
    let mut session = database.session().expect("Failed to open session");
    let device = find(&mut session, "Device", "ab12cd");
    let form = to_form(&mut session, &[device]).expect("Failed to render form");
    let lines: Vec<&str> = form.lines().collect();
    assert_eq!(lines[0], "element_name: Device:ab12cd");
    assert!(lines[1].starts_with("-id: "), "got {}", lines[1]);
    assert_eq!(lines[2], "-revision: 1");
    assert_eq!(lines[3], "-changeset: 1");
    for expected in [
        "hid: ab12cd",
        "hw_class: server",
        "status: inventory",
        "notes: ''",
        "rackpos: None",
        "rack: Rack:r1.sjc1",
        "chassis: None",
        "ports: []",
    ] {
        assert!(lines.contains(&expected), "missing '{expected}' in\n{form}");
    }
}

#[test]
fn multi_line_text_round_trips() {
    let database = setup();
    let mut session = database.session().expect("Failed to open session");
    let device = find(&mut session, "Device", "cd34ef");
    session
        .set(device, "notes", "racked by hand\nsecond line")
        .expect("Failed to set notes");
    session.submit_changeset().expect("Failed to commit");

    let form = to_form(&mut session, &[device]).expect("Failed to render form");
    assert!(form.contains("notes: |\n  racked by hand\n  second line\n"), "got\n{form}");
    let description = apply_form(&mut session, &form).expect("Failed to apply form");
    assert!(description.is_empty(), "An unchanged form changes nothing: {description}");
}

#[test]
fn unchanged_forms_change_nothing() {
    let database = setup();
    let mut session = database.session().expect("Failed to open session");
    let keys: Vec<ElementKey> = session
        .resolve("Device/")
        .expect("Failed to resolve")
        .iter()
        .filter_map(|r| r.element())
        .chain([find(&mut session, "Host", "web1.pod1.sjc1")])
        .collect();
    let form = to_form(&mut session, &keys).expect("Failed to render form");
    assert_eq!(form.matches("---").count(), 2, "One separator between each block");
    let description = apply_form(&mut session, &form).expect("Failed to apply form");
    assert!(description.is_empty(), "got {description}");
}

#[test]
fn edits_are_described() {
    let database = setup();
    let mut session = database.session().expect("Failed to open session");
    let form = "\
# move the device and note why
element_name: Device:cd34ef
-revision: 1
rack: r2.sjc1
notes: moved for power
";
    let description = apply_form(&mut session, form).expect("Failed to apply form");
    assert_eq!(
        description.lines(),
        vec![
            "Update: Device:cd34ef/notes: moved for power",
            "Update: Device:cd34ef/rack: Rack:r2.sjc1",
            "Update: Rack:r1.sjc1/devices: del Device:cd34ef",
            "Update: Rack:r2.sjc1/devices: add Device:cd34ef",
        ]
    );
    assert!(session.changeset_state().is_open(), "Applying a form does not commit");
    session.submit_changeset().expect("Failed to commit");
    let device = find(&mut session, "Device", "cd34ef");
    assert_eq!(session.get_text(device, "rack").expect("Failed to read"), "Rack:r2.sjc1");
}

#[test]
fn new_elements_refer_to_each_other() {
    let database = setup();
    let mut session = database.session().expect("Failed to open session");
    let form = "\
element_name: Pod:<1>
name: pod7
---
element_name: Host:<2>
name: db1
pod: Pod:<1>
device: Device:cd34ef
";
    let description = apply_form(&mut session, form).expect("Failed to apply form");
    let changes: Vec<Change> = description.into_iter().collect();
    assert_eq!(changes[0], Change::Create("Pod:pod7".to_string()));
    assert_eq!(changes[1], Change::Create("Host:db1.pod7.sjc1".to_string()));
    assert!(changes.contains(&Change::SetRelation {
        element: "Host:db1.pod7.sjc1".to_string(),
        attribute: "pod".to_string(),
        target: "Pod:pod7".to_string(),
    }));
    session.submit_changeset().expect("Failed to commit");

    let mut fresh = database.session().expect("Failed to open session");
    let host = find(&mut fresh, "Host", "db1.pod7.sjc1");
    assert_eq!(fresh.get_text(host, "enabled").expect("Failed to read"), "true", "Defaults apply");
}

#[test]
fn creates_are_described() {
    let database = setup();
    let mut session = database.session().expect("Failed to open session");
    create(&mut session, "Pod", &[("name", "pod9")]);
    let description = session.change_description().expect("Failed to describe");
    assert_eq!(description.lines(), vec!["Add: Pod:pod9", "Update: Pod:pod9/name: pod9"]);
    assert_eq!(description.to_string(), "Add: Pod:pod9\nUpdate: Pod:pod9/name: pod9\n");
}

#[test]
fn deletes_come_before_updates() {
    let database = setup();
    let mut session = database.session().expect("Failed to open session");
    let rack = find(&mut session, "Rack", "r2.sjc1");
    let device = find(&mut session, "Device", "ab12cd");
    session.set(device, "rackpos", "12").expect("Failed to set rackpos");
    session.delete(rack).expect("Failed to delete");
    create(&mut session, "Pod", &[("name", "pod4")]);
    let lines = session.change_description().expect("Failed to describe").lines();
    assert_eq!(
        lines,
        vec![
            "Add: Pod:pod4",
            "Delete: Rack:r2.sjc1",
            "Update: Device:ab12cd/rackpos: 12",
            "Update: Pod:pod4/name: pod4",
        ]
    );
}

#[test]
fn malformed_forms() {
    let database = setup();
    let mut session = database.session().expect("Failed to open session");
    let err = apply_form(&mut session, "element_name: Device:ab12cd\nno colon here\n").unwrap_err();
    assert!(matches!(err, DinoError::InvalidValue { .. }), "got {err}");
    let err = apply_form(&mut session, "hid: ab12cd\n").unwrap_err();
    assert!(matches!(err, DinoError::InvalidValue { .. }), "Blocks start with element_name, got {err}");
    let err = apply_form(&mut session, "element_name: Device:ab12cd\n---\n# second block\nhid: cd34ef\n").unwrap_err();
    assert!(err.to_string().contains("form line 4"), "The block's first line is reported, got {err}");
    let err = apply_form(&mut session, "element_name: Device:ab12cd\nnosuch: 1\n").unwrap_err();
    assert!(matches!(err, DinoError::InvalidAttribute { .. }), "got {err}");
    let err = apply_form(&mut session, "element_name: Device:ab12cd\nrackpos: twelve\n").unwrap_err();
    assert!(matches!(err, DinoError::InvalidValue { .. }), "got {err}");
    let err = apply_form(&mut session, "element_name: Device\n").unwrap_err();
    assert!(matches!(err, DinoError::SpecificationKindMismatch { .. }), "got {err}");
}
