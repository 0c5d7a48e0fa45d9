//! Crate-wide error type.
//!
//! Every failure in resolution, planning and rendering unwinds to the
//! statement boundary as one of these variants. There is no local recovery:
//! a model that cannot be compiled is reported, never patched over.

use crate::cache::CacheError;
use crate::config::SettingsError;
use crate::graph::GraphError;
use crate::validation::ModelValidationIssue;

/// Result type for compiler operations.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A reference that is neither in the environment nor defined locally.
    #[error("undefined concept: {address}{}", format_suggestions(.suggestions))]
    UndefinedConcept {
        address: String,
        suggestions: Vec<String>,
    },

    #[error("environment is frozen and cannot be modified")]
    FrozenEnvironment,

    /// Self-contradictory model or statement.
    #[error("invalid syntax: {0}")]
    InvalidSyntax(String),

    /// More than one equally valid join path exists.
    #[error("{message}")]
    AmbiguousRelationshipResolution {
        message: String,
        parents: Vec<Vec<String>>,
    },

    #[error("could not resolve a query for concepts: {}", .targets.join(", "))]
    UnresolvableQuery { targets: Vec<String> },

    #[error("no datasource found for {0}")]
    NoDatasource(String),

    /// Strict mode found an unresolved reference marker in compiled SQL.
    #[error("compiled SQL contains an invalid reference:\n{sql}")]
    InvalidReference { sql: String },

    #[error("datasource validation failed: {}", format_issues(.0))]
    DatasourceModelValidation(Vec<ModelValidationIssue>),

    #[error("concept validation failed: {}", format_issues(.0))]
    ConceptModelValidation(Vec<ModelValidationIssue>),

    #[error("configuration error: {0}")]
    Config(#[from] SettingsError),

    #[error("graph error: {0}")]
    Graph(#[from] GraphError),

    #[error("cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Reading sample rows for validation failed.
    #[error("sample query failed: {0}")]
    Sample(#[from] rusqlite::Error),
}

impl Error {
    pub fn syntax(message: impl Into<String>) -> Self {
        Error::InvalidSyntax(message.into())
    }

    pub fn undefined(address: impl Into<String>, suggestions: Vec<String>) -> Self {
        Error::UndefinedConcept {
            address: address.into(),
            suggestions,
        }
    }

    /// Whether a retry with a different search strategy might succeed.
    pub fn is_unresolvable(&self) -> bool {
        matches!(
            self,
            Error::UnresolvableQuery { .. } | Error::NoDatasource(_)
        )
    }
}

fn format_suggestions(suggestions: &[String]) -> String {
    if suggestions.is_empty() {
        String::new()
    } else {
        format!(". Did you mean: {}?", suggestions.join(", "))
    }
}

fn format_issues(issues: &[ModelValidationIssue]) -> String {
    let lines: Vec<String> = issues.iter().map(|i| i.to_string()).collect();
    lines.join("; ")
}
