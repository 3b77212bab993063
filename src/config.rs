//! Layered settings: built-in defaults, then `dinodb.toml` (or the file named by
//! `DINODB_CONFIG`), then `DINODB__SECTION__KEY` environment variables.

use std::time::Duration;

use config::{Config, Environment, File};
use serde::Deserialize;

use crate::error::Result;
use crate::session::PersistenceMode;

pub const CONFIG_VARIABLE: &str = "DINODB_CONFIG";
const DEFAULT_FILE: &str = "dinodb";

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct Settings {
    pub database: DatabaseSettings,
    pub log: LogSettings,
    pub server: ServerSettings,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct DatabaseSettings {
    /// SQLite file; in-memory when absent.
    pub path: Option<String>,
    pub busy_timeout_ms: u64,
}

impl DatabaseSettings {
    pub fn mode(&self) -> PersistenceMode {
        match &self.path {
            Some(path) if !path.trim().is_empty() => PersistenceMode::File(path.clone()),
            _ => PersistenceMode::InMemory,
        }
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct LogSettings {
    /// `tracing_subscriber::EnvFilter` directive, `RUST_LOG` wins when set.
    pub filter: String,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct ServerSettings {
    pub bind: String,
}

impl Settings {
    /// Loads settings from the default file location and the environment.
    pub fn load() -> Result<Settings> {
        let file = std::env::var(CONFIG_VARIABLE).unwrap_or_else(|_| DEFAULT_FILE.to_string());
        Self::from_file(&file)
    }

    /// Loads settings from `file` (optional, any format `config` knows by its
    /// extension) and the environment.
    pub fn from_file(file: &str) -> Result<Settings> {
        let settings = Self::defaults()?
            .add_source(File::with_name(file).required(false))
            .add_source(Environment::with_prefix("DINODB").prefix_separator("__").separator("__"))
            .build()?;
        Ok(settings.try_deserialize()?)
    }

    fn defaults() -> Result<config::ConfigBuilder<config::builder::DefaultState>> {
        Ok(Config::builder()
            .set_default("database.busy_timeout_ms", 5_000)?
            .set_default("log.filter", "info,dinodb=debug")?
            .set_default("server.bind", "127.0.0.1:8086")?)
    }
}
