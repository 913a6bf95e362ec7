//! Error taxonomy of the import API
//!
//! Worker internals return `anyhow::Result`; anything that crosses the request/reply
//! boundary is converted into an `ImportError` so it carries a stable code.

use thiserror::Error;
use uuid::Uuid;

use crate::types::{ErrorResponse, ImportJobStatus, MappingViolation};

#[derive(Debug, Error)]
pub enum ImportError {
    #[error("Import job {0} not found")]
    NotFound(Uuid),

    #[error("Authentication required")]
    Unauthorized,

    #[error("{0}")]
    Forbidden(String),

    #[error("Operation '{operation}' not allowed while job is {status}")]
    InvalidState {
        operation: &'static str,
        status: ImportJobStatus,
    },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Unsupported file: {0}")]
    UnsupportedFile(String),

    #[error("Mapping incomplete: at least one of email, phone, first_name or last_name must be mapped")]
    MappingIncomplete,

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl ImportError {
    pub fn code(&self) -> &'static str {
        match self {
            ImportError::NotFound(_) => "NOT_FOUND",
            ImportError::Unauthorized => "UNAUTHORIZED",
            ImportError::Forbidden(_) => "FORBIDDEN",
            ImportError::InvalidState { .. } => "INVALID_STATE",
            ImportError::InvalidConfig(_) => "INVALID_CONFIG",
            ImportError::UnsupportedFile(_) => "UNSUPPORTED_FILE",
            ImportError::MappingIncomplete => "MAPPING_INCOMPLETE",
            ImportError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    pub fn invalid_state(operation: &'static str, status: ImportJobStatus) -> Self {
        ImportError::InvalidState { operation, status }
    }

    pub fn to_response(&self, request_id: Uuid) -> ErrorResponse {
        let response = ErrorResponse::new(request_id, self.code(), self.to_string());
        match self {
            ImportError::InvalidState { operation, status } => response.with_details(
                serde_json::json!({ "operation": operation, "status": status }),
            ),
            _ => response,
        }
    }
}

impl From<MappingViolation> for ImportError {
    fn from(violation: MappingViolation) -> Self {
        ImportError::InvalidConfig(violation.to_string())
    }
}

impl From<sqlx::Error> for ImportError {
    fn from(e: sqlx::Error) -> Self {
        ImportError::Internal(e.into())
    }
}

pub type ImportResult<T> = std::result::Result<T, ImportError>;
