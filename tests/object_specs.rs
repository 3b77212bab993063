use dinodb::DinoError;
use dinodb::objectspec::{Clause, ClauseValue, ObjectSpec, SpecKind, parse};

#[test]
fn element_name_with_expected_kind() {
    let spec = parse("Device:ab12cd", &[SpecKind::ElementName]).expect("element name");
    assert_eq!(
        spec,
        ObjectSpec::ElementName {
            entity: "Device".into(),
            instance_name: "ab12cd".into()
        }
    );
    assert_eq!(spec.entity(), "Device", "entity type of the element");
}

#[test]
fn every_kind_parses() {
    let cases = [
        ("Device", SpecKind::EntityName),
        ("Device/", SpecKind::EntityName),
        ("Device:ab12cd", SpecKind::ElementName),
        ("Host:web1.pod1.sjc1", SpecKind::ElementName),
        ("Device:{12}", SpecKind::ElementId),
        ("Device:<3>", SpecKind::ElementFormId),
        ("Device[hw_class=server]", SpecKind::ElementQuery),
        ("Device:ab12cd/notes", SpecKind::AttributeName),
        ("Device:{12}/rack", SpecKind::AttributeName),
        ("Device[hw_class=server]/notes", SpecKind::AttributeName),
        ("Rack:r1.sjc1/devices/", SpecKind::AttributeName),
    ];
    for (text, kind) in cases {
        let spec: ObjectSpec = text.parse().unwrap_or_else(|e| panic!("{text}: {e}"));
        assert_eq!(spec.kind(), kind, "kind of {text}");
    }
}

#[test]
fn trailing_slash_means_instances() {
    match parse("Device/", SpecKind::ALL).expect("entity") {
        ObjectSpec::EntityName { instances, .. } => assert!(instances),
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(
        parse("Device:ab12cd/", SpecKind::ALL).expect("element with slash"),
        parse("Device:ab12cd", SpecKind::ALL).expect("element"),
        "a trailing slash on an element is the element itself"
    );
    match parse("Rack:r1.sjc1/devices/", SpecKind::ALL).expect("attribute") {
        ObjectSpec::AttributeName {
            element,
            property,
            instances,
        } => {
            assert_eq!(property, "devices");
            assert!(instances, "related elements rather than the handle");
            assert_eq!(element.kind(), SpecKind::ElementName);
        }
        other => panic!("unexpected {other:?}"),
    }
}

#[test]
fn quoting_is_stripped() {
    let spec = parse("'Device:ab12cd'", SpecKind::ALL).expect("wrapped spec");
    assert_eq!(spec.to_string(), "Device:ab12cd");
    let spec = parse("Site:'san jose'", SpecKind::ALL).expect("quoted instance");
    match &spec {
        ObjectSpec::ElementName { instance_name, .. } => assert_eq!(instance_name, "san jose"),
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(spec.to_string(), "Site:'san jose'", "display quotes it again");
}

#[test]
fn query_clauses() {
    let spec = parse("Device[Rack; Rack.name=r1; serialno=None; hid='None'; notes='a;b']", SpecKind::ALL)
        .expect("query");
    let ObjectSpec::ElementQuery { entity, clauses } = spec else {
        panic!("not a query");
    };
    assert_eq!(entity, "Device");
    assert_eq!(
        clauses,
        vec![
            Clause::Join("Rack".into()),
            Clause::Equals {
                join: Some("Rack".into()),
                property: "name".into(),
                value: ClauseValue::Text("r1".into())
            },
            Clause::Equals {
                join: None,
                property: "serialno".into(),
                value: ClauseValue::Null
            },
            Clause::Equals {
                join: None,
                property: "hid".into(),
                value: ClauseValue::Text("None".into())
            },
            Clause::Equals {
                join: None,
                property: "notes".into(),
                value: ClauseValue::Text("a;b".into())
            },
        ]
    );
}

#[test]
fn display_reparses_to_the_same_spec() {
    for text in [
        "Device[hw_class=server;rack.name='None']",
        "Device:{7}/notes",
        "Host:<2>",
        "Site:'two words'",
        "Element/",
    ] {
        let spec = parse(text, SpecKind::ALL).expect(text);
        let again = parse(&spec.to_string(), SpecKind::ALL).expect("display output parses");
        assert_eq!(spec, again, "display of {text}");
    }
}

#[test]
fn kind_mismatch() {
    let err = parse("Device", SpecKind::ELEMENTS).unwrap_err();
    assert!(
        matches!(err, DinoError::SpecificationKindMismatch { ref found, .. } if found == "EntityName"),
        "got {err}"
    );
    let err = parse("Device:ab12cd/notes", &[SpecKind::ElementName]).unwrap_err();
    assert!(matches!(err, DinoError::SpecificationKindMismatch { .. }), "got {err}");
}

#[test]
fn syntax_errors() {
    for text in ["", "Device:", "Device[", "Dev ice", "Device:{abc}", "9Device", "Device:ab12cd//", "Device/notes"] {
        let err = parse(text, SpecKind::ALL).unwrap_err();
        assert!(
            matches!(err, DinoError::SpecificationSyntax { .. }),
            "'{text}' should be a syntax error, got {err}"
        );
    }
}

#[test]
fn malformed_clauses() {
    for text in ["Device[hw_class=]", "Device[]", "Device[a b=1]", "Device[x.y.z=1]", "Device[hw_class=it's]"] {
        let err = parse(text, SpecKind::ALL).unwrap_err();
        assert!(
            matches!(err, DinoError::QueryClause { .. }),
            "'{text}' should be a clause error, got {err}"
        );
    }
}
