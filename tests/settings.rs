use std::time::Duration;

use dinodb::PersistenceMode;
use dinodb::config::Settings;

fn setup(name: &str, contents: &str) -> String {
    let path = std::env::temp_dir().join(format!("dinodb-{}-{name}.toml", std::process::id()));
    std::fs::write(&path, contents).expect("Failed to write settings file");
    path.to_string_lossy().into_owned()
}

#[test]
fn defaults_without_a_file() {
    let settings = Settings::from_file("/nonexistent/dinodb-settings").expect("Defaults load");
    assert_eq!(settings.database.mode(), PersistenceMode::InMemory);
    assert_eq!(settings.database.busy_timeout(), Duration::from_secs(5));
    assert_eq!(settings.log.filter, "info,dinodb=debug");
    assert_eq!(settings.server.bind, "127.0.0.1:8086");
}

#[test]
fn file_overrides_defaults() {
    let path = setup(
        "override",
        r#"
[database]
path = "/var/lib/dinodb/inventory.db"
busy_timeout_ms = 250

[server]
bind = "0.0.0.0:9000"
"#,
    );
    let settings = Settings::from_file(&path).expect("Failed to load settings");
    assert_eq!(
        settings.database.mode(),
        PersistenceMode::File("/var/lib/dinodb/inventory.db".to_string())
    );
    assert_eq!(settings.database.busy_timeout(), Duration::from_millis(250));
    assert_eq!(settings.server.bind, "0.0.0.0:9000");
    assert_eq!(settings.log.filter, "info,dinodb=debug", "Unset keys keep their defaults");
    let _ = std::fs::remove_file(&path);
}

#[test]
fn blank_path_means_memory() {
    let path = setup("blank", "[database]\npath = \"  \"\n");
    let settings = Settings::from_file(&path).expect("Failed to load settings");
    assert_eq!(settings.database.mode(), PersistenceMode::InMemory);
    let _ = std::fs::remove_file(&path);
}

#[test]
fn malformed_values_are_config_errors() {
    let path = setup("malformed", "[database]\nbusy_timeout_ms = \"soon\"\n");
    let err = Settings::from_file(&path).unwrap_err();
    assert!(matches!(err, dinodb::DinoError::Config(_)), "got {err}");
    let _ = std::fs::remove_file(&path);
}
