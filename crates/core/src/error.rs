use std::error::Error as StdError;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, StorageError>;

type BoxError = Box<dyn StdError + Send + Sync>;

/// Failures surfaced by every repository storage backend.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("repository not found{}", describe_lookup(.name.as_deref(), .path.as_deref()))]
    RepositoryNotFound {
        name: Option<String>,
        path: Option<String>,
    },

    #[error("{operation} failed: {message}")]
    Storage {
        operation: &'static str,
        message: String,
        #[source]
        source: Option<BoxError>,
    },

    #[error("validation failed: {message}")]
    Validation {
        message: String,
        field: Option<String>,
    },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl StorageError {
    pub fn not_found_name(name: impl Into<String>) -> Self {
        Self::RepositoryNotFound {
            name: Some(name.into()),
            path: None,
        }
    }

    pub fn not_found_path(path: impl Into<String>) -> Self {
        Self::RepositoryNotFound {
            name: None,
            path: Some(path.into()),
        }
    }

    pub fn storage(operation: &'static str, message: impl Into<String>) -> Self {
        Self::Storage {
            operation,
            message: message.into(),
            source: None,
        }
    }

    pub fn with_source<E>(operation: &'static str, message: impl Into<String>, source: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        Self::Storage {
            operation,
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
            field: None,
        }
    }

    pub fn invalid_field(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    /// Error raised when a path lookup without a hostname matches several hosts.
    pub fn ambiguous_path(path: &str, hostnames: &[String]) -> Self {
        Self::Validation {
            message: format!(
                "multiple repositories found at path '{path}' on different hosts: [{}]; specify a hostname to disambiguate",
                hostnames.join(", ")
            ),
            field: Some("hostname".to_owned()),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::RepositoryNotFound { .. })
    }

    pub fn operation(&self) -> Option<&'static str> {
        match self {
            Self::Storage { operation, .. } => Some(operation),
            _ => None,
        }
    }
}

fn describe_lookup(name: Option<&str>, path: Option<&str>) -> String {
    match (name, path) {
        (Some(name), Some(path)) => format!(": name '{name}', path '{path}'"),
        (Some(name), None) => format!(": '{name}'"),
        (None, Some(path)) => format!(" at path '{path}'"),
        (None, None) => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_message_names_the_lookup() {
        assert_eq!(
            StorageError::not_found_name("docs").to_string(),
            "repository not found: 'docs'"
        );
        assert_eq!(
            StorageError::not_found_path("/repo/docs").to_string(),
            "repository not found at path '/repo/docs'"
        );
    }

    #[test]
    fn ambiguous_path_lists_every_host() {
        let err = StorageError::ambiguous_path("/r", &["box1".to_owned(), "box2".to_owned()]);
        let msg = err.to_string();
        assert!(msg.contains("box1"));
        assert!(msg.contains("box2"));
        assert!(!err.is_not_found());
    }

    #[test]
    fn storage_error_keeps_operation_and_source() {
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let err = StorageError::with_source("save", "write metadata file", io);
        assert_eq!(err.operation(), Some("save"));
        assert!(StdError::source(&err).is_some());
        assert_eq!(err.to_string(), "save failed: write metadata file");
    }
}
