use thiserror::Error;

#[derive(Error, Debug)]
pub enum DinoError {
    #[error("Invalid object specification '{text}': {message}")]
    SpecificationSyntax { text: String, message: String },
    #[error("Object specification '{text}' is a {found}, expected one of: {expected}")]
    SpecificationKindMismatch {
        text: String,
        found: String,
        expected: String,
    },
    #[error("Unknown entity type: {0}")]
    UnknownEntityType(String),
    #[error("Entity type name '{name}' is ambiguous, it matches: {candidates}")]
    AmbiguousEntityType { name: String, candidates: String },
    #[error("Unknown element: {0}")]
    UnknownElement(String),
    #[error("Element specification '{spec}' matches more than one element: {candidates}")]
    AmbiguousElement { spec: String, candidates: String },
    #[error("Invalid attribute '{attribute}' for {entity}: {message}")]
    InvalidAttribute {
        entity: String,
        attribute: String,
        message: String,
    },
    #[error("Invalid query clause '{clause}': {message}")]
    QueryClause { clause: String, message: String },
    #[error("Invalid name for {element}: {message}")]
    InvalidName { element: String, message: String },
    #[error("Revision consistency error: {0}")]
    RevisionConsistency(String),
    #[error("Backend error in '{statement}' with parameters [{params}]: {source}")]
    Backend {
        statement: String,
        params: String,
        #[source]
        source: rusqlite::Error,
    },
    #[error("Invalid schema: {0}")]
    InvalidSchema(String),
    #[error("Invalid value '{value}' for {attribute}: expected {expected}")]
    InvalidValue {
        attribute: String,
        value: String,
        expected: String,
    },
    #[error("Missing required attribute {entity}/{attribute} on {element}")]
    RequiredAttribute {
        entity: String,
        element: String,
        attribute: String,
    },
    #[error("Config error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, DinoError>;

impl DinoError {
    pub(crate) fn syntax(text: &str, message: impl Into<String>) -> Self {
        Self::SpecificationSyntax {
            text: text.to_string(),
            message: message.into(),
        }
    }

    pub(crate) fn clause(clause: &str, message: impl Into<String>) -> Self {
        Self::QueryClause {
            clause: clause.to_string(),
            message: message.into(),
        }
    }

    pub(crate) fn attribute(entity: &str, attribute: &str, message: impl Into<String>) -> Self {
        Self::InvalidAttribute {
            entity: entity.to_string(),
            attribute: attribute.to_string(),
            message: message.into(),
        }
    }

    pub(crate) fn name(element: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidName {
            element: element.into(),
            message: message.into(),
        }
    }

    /// Wraps a rusqlite failure together with the statement that caused it.
    pub(crate) fn backend(statement: &str, params: &[rusqlite::types::Value], source: rusqlite::Error) -> Self {
        let params = params
            .iter()
            .map(|p| match p {
                rusqlite::types::Value::Null => "NULL".to_string(),
                rusqlite::types::Value::Integer(i) => i.to_string(),
                rusqlite::types::Value::Real(r) => r.to_string(),
                rusqlite::types::Value::Text(t) => format!("'{t}'"),
                rusqlite::types::Value::Blob(b) => format!("<{} bytes>", b.len()),
            })
            .collect::<Vec<_>>()
            .join(", ");
        Self::Backend {
            statement: statement.split_whitespace().collect::<Vec<_>>().join(" "),
            params,
            source,
        }
    }

    /// True for errors caused by the request itself rather than by storage.
    pub fn is_user_error(&self) -> bool {
        !matches!(
            self,
            Self::Backend { .. } | Self::RevisionConsistency(_) | Self::Config(_)
        )
    }
}

// Helper conversions
impl From<rusqlite::Error> for DinoError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Backend {
            statement: String::new(),
            params: String::new(),
            source: e,
        }
    }
}

impl From<config::ConfigError> for DinoError {
    fn from(e: config::ConfigError) -> Self {
        Self::Config(e.to_string())
    }
}
