use std::{fmt, io};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc::error::SendError as TokioSendError;

use serde_json::Error as JsonError;

use crate::dispatch::Job;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Error)]
pub enum PatternError {
    #[error("Access denied: {0}")]
    AccessDenied(String),
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("Dispatcher error: {0}")]
    Dispatch(String),
    #[error("Resource not found: {0}")]
    NotFound(String),
    #[error("Setting '{reference}' as a reference to '{target}' would create a reference cycle")]
    ReferenceCycle { reference: String, target: String },
    #[error("(De)Serialization error: {0}")]
    Serialization(String),
    #[error("Type mismatch: expected {expected}, found {found}")]
    TypeMismatch { expected: String, found: String },
    #[error("Unknown resource type: {0}")]
    UnknownType(String),
    #[error("Usage error: {0}")]
    Usage(String),
}

pub type Result<T> = std::result::Result<T, PatternError>;

impl PatternError {
    /// True for errors caused by a malformed request rather than by the current graph state.
    pub fn is_usage_error(&self) -> bool {
        matches!(
            self,
            PatternError::Usage(_)
                | PatternError::TypeMismatch { .. }
                | PatternError::UnknownType(_)
                | PatternError::ReferenceCycle { .. }
        )
    }
}

impl From<toml::de::Error> for PatternError {
    fn from(src: toml::de::Error) -> PatternError {
        PatternError::Serialization(format!("Toml deserialization error: {src}"))
    }
}

impl From<toml::ser::Error> for PatternError {
    fn from(src: toml::ser::Error) -> PatternError {
        PatternError::Serialization(format!("Toml serialization error: {src}"))
    }
}

impl From<JsonError> for PatternError {
    fn from(src: JsonError) -> PatternError {
        PatternError::Serialization(format!("JSON (de)serialization error: {src}"))
    }
}

impl From<io::Error> for PatternError {
    fn from(x: io::Error) -> Self {
        match x.kind() {
            io::ErrorKind::NotFound => PatternError::NotFound(format!("{x}")),
            _ => PatternError::Config(format!("IOError: {}", x.kind())),
        }
    }
}

impl From<fmt::Error> for PatternError {
    fn from(x: fmt::Error) -> Self {
        PatternError::Serialization(format!("{x}"))
    }
}

impl From<TokioSendError<Job>> for PatternError {
    fn from(x: TokioSendError<Job>) -> Self {
        PatternError::Dispatch(format!(
            "Dispatch queue closed, could not enqueue {:?}",
            x.0
        ))
    }
}
