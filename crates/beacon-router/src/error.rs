//! Router error types.

use beacon_registry::RegistryError;
use thiserror::Error;

use crate::collaborator::ServiceError;

/// Application-level errors, answered with an `error` envelope.
#[derive(Debug, Error)]
pub enum RouterError {
    #[error("Malformed message: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("Missing required field: {0}")]
    MissingField(&'static str),

    #[error("Invalid field {field}: {reason}")]
    InvalidField { field: &'static str, reason: String },

    #[error("Unknown message type: {0}")]
    UnknownType(String),

    #[error("Service error: {0}")]
    Service(#[from] ServiceError),

    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),
}

impl RouterError {
    /// Stable code placed in the error envelope.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Malformed(_) => "malformed_json",
            Self::MissingField(_) => "missing_field",
            Self::InvalidField { .. } | Self::Registry(_) => "invalid_request",
            Self::UnknownType(_) => "unknown_type",
            Self::Service(_) => "service_error",
        }
    }
}

pub type RouterResult<T> = Result<T, RouterError>;
