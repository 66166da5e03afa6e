//! Error Taxonomy - every failure is scoped to one request or one sync attempt

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DocforgeError {
    #[error("Store unavailable: {store}: {reason}")]
    StoreUnavailable { store: String, reason: String },

    #[error("Storage error in {store}: {reason}")]
    Storage { store: String, reason: String },

    #[error("Unknown store: {0}")]
    UnknownStore(String),

    #[error("Template not found: {0}")]
    TemplateNotFound(String),

    #[error("Template already exists: {0}")]
    TemplateAlreadyExists(String),

    #[error("Malformed template at byte {offset}: {reason}")]
    MalformedTemplate { offset: usize, reason: String },

    #[error("Placeholder declaration mismatch: missing {missing:?}, undeclared {undeclared:?}")]
    PlaceholderDeclarationMismatch {
        missing: Vec<String>,
        undeclared: Vec<String>,
    },

    #[error("Missing datapoint for required placeholder: {0}")]
    MissingDatapoint(String),

    #[error("Placeholder {placeholder} expects {expected}, got {value}")]
    PlaceholderType {
        placeholder: String,
        expected: String,
        value: String,
    },

    #[error("Invalid placeholder definition {0}: {1}")]
    InvalidDefinition(String, String),

    #[error("Concurrent version conflict on {template_id}: expected base v{expected}, found v{found}")]
    ConcurrentVersionConflict {
        template_id: String,
        expected: u32,
        found: u32,
    },

    #[error("Rule set not found: {0}")]
    RuleSetNotFound(String),

    #[error("Invalid rule set {0}: {1}")]
    InvalidRuleSet(String, String),

    #[error("Rule set {0} requires engine >= {1}, current is {2}")]
    EngineVersionMismatch(String, String, String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl DocforgeError {
    /// Transient failures the caller may retry as a whole.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            DocforgeError::StoreUnavailable { .. } | DocforgeError::ConcurrentVersionConflict { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, DocforgeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        let unavailable = DocforgeError::StoreUnavailable {
            store: "a".into(),
            reason: "database is locked".into(),
        };
        assert!(unavailable.is_retryable());

        let conflict = DocforgeError::ConcurrentVersionConflict {
            template_id: "t".into(),
            expected: 1,
            found: 2,
        };
        assert!(conflict.is_retryable());

        assert!(!DocforgeError::TemplateNotFound("t".into()).is_retryable());
        assert!(!DocforgeError::MissingDatapoint("build_count".into()).is_retryable());
    }

    #[test]
    fn test_missing_datapoint_names_placeholder() {
        let err = DocforgeError::MissingDatapoint("build_count".into());
        assert!(err.to_string().contains("build_count"));
    }
}
