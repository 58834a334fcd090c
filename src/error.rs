use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Which external collaborator failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExternalService {
    LanguageModel,
    Executor,
    SchemaSource,
}

impl fmt::Display for ExternalService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExternalService::LanguageModel => write!(f, "language model"),
            ExternalService::Executor => write!(f, "query executor"),
            ExternalService::SchemaSource => write!(f, "schema source"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceFailureKind {
    Timeout,
    Quota,
    Network,
    InvalidResponse,
}

impl fmt::Display for ServiceFailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServiceFailureKind::Timeout => write!(f, "timeout"),
            ServiceFailureKind::Quota => write!(f, "quota exceeded"),
            ServiceFailureKind::Network => write!(f, "network error"),
            ServiceFailureKind::InvalidResponse => write!(f, "invalid response"),
        }
    }
}

/// A validation stage rejected the chosen candidate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationFailure {
    pub stage: String,
    pub critical: bool,
    pub sql: String,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub suggestions: Vec<String>,
}

impl fmt::Display for ValidationFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} stage rejected query ({}): {}",
            self.stage,
            if self.critical { "critical" } else { "non-critical" },
            self.errors.join("; ")
        )
    }
}

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("No candidate SQL could be generated for '{question}' (tried: {})", .attempted_paths.join(", "))]
    GenerationExhausted {
        question: String,
        attempted_paths: Vec<String>,
    },

    #[error("Validation failure: {0}")]
    ValidationFailure(Box<ValidationFailure>),

    #[error("{service} failure ({kind}): {message}")]
    ExternalService {
        service: ExternalService,
        kind: ServiceFailureKind,
        message: String,
    },

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<rusqlite::Error> for EngineError {
    fn from(err: rusqlite::Error) -> Self {
        EngineError::Storage(err.to_string())
    }
}

impl EngineError {
    pub fn llm(kind: ServiceFailureKind, message: impl Into<String>) -> Self {
        EngineError::ExternalService {
            service: ExternalService::LanguageModel,
            kind,
            message: message.into(),
        }
    }

    pub fn executor(kind: ServiceFailureKind, message: impl Into<String>) -> Self {
        EngineError::ExternalService {
            service: ExternalService::Executor,
            kind,
            message: message.into(),
        }
    }

    /// Build the structured explanation shown to users on terminal failures.
    pub fn explain(&self) -> Explanation {
        match self {
            EngineError::ValidationFailure(failure) => Explanation {
                stage: Some(failure.stage.clone()),
                summary: format!("The generated query was rejected at the {} stage", failure.stage),
                details: failure.errors.clone(),
                suggestions: failure.suggestions.clone(),
            },
            EngineError::GenerationExhausted { attempted_paths, .. } => Explanation {
                stage: Some("generation".to_string()),
                summary: "No query could be produced for this question".to_string(),
                details: if attempted_paths.is_empty() {
                    vec!["No pattern matched and no generation path is enabled".to_string()]
                } else {
                    vec![format!("Generation paths attempted: {}", attempted_paths.join(", "))]
                },
                suggestions: vec![
                    "Rephrase the question using table or column names from the schema".to_string(),
                    "Ask about a single metric at a time".to_string(),
                ],
            },
            EngineError::ExternalService { service, kind, message } => Explanation {
                stage: None,
                summary: format!("The {} is unavailable ({})", service, kind),
                details: vec![message.clone()],
                suggestions: vec!["Retry shortly; pattern-based answers remain available".to_string()],
            },
            EngineError::Configuration(message) => Explanation {
                stage: None,
                summary: "The engine is misconfigured".to_string(),
                details: vec![message.clone()],
                suggestions: vec!["Check the pattern library and schema files".to_string()],
            },
            other => Explanation {
                stage: None,
                summary: "Internal error while resolving the question".to_string(),
                details: vec![other.to_string()],
                suggestions: Vec::new(),
            },
        }
    }
}

/// User-facing explanation of a failed resolution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Explanation {
    pub stage: Option<String>,
    pub summary: String,
    pub details: Vec<String>,
    pub suggestions: Vec<String>,
}

pub type Result<T> = std::result::Result<T, EngineError>;
