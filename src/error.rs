use thiserror::Error;

use crate::model::Message;

pub type Result<T> = std::result::Result<T, UcpError>;

#[derive(Error, Debug)]
pub enum UcpError {
    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Checkout could not be processed")]
    Checkout(Vec<Message>),

    #[error("Request signature is invalid or missing")]
    InvalidSignature,

    #[error("Agent is not authorized: {0}")]
    NotAuthorized(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    StateConflict(String),

    #[error("Checkout session has expired")]
    SessionExpired,

    #[error("UCP is currently disabled")]
    ProtocolDisabled,

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(String),
}

impl UcpError {
    /// HTTP status the transport layer should map this error to.
    pub fn status_code(&self) -> u16 {
        match self {
            UcpError::Validation(_) | UcpError::Checkout(_) => 400,
            UcpError::InvalidSignature => 401,
            UcpError::NotAuthorized(_) => 403,
            UcpError::NotFound(_) => 404,
            UcpError::StateConflict(_) => 409,
            UcpError::SessionExpired => 410,
            UcpError::ProtocolDisabled => 503,
            UcpError::Network(_) => 502,
            UcpError::Config(_)
            | UcpError::Database(_)
            | UcpError::Serialization(_)
            | UcpError::Io(_) => 500,
        }
    }

    /// Stable machine-readable code for error response bodies.
    pub fn code(&self) -> &'static str {
        match self {
            UcpError::Config(_) => "invalid_configuration",
            UcpError::Validation(_) => "validation_error",
            UcpError::Checkout(_) => "checkout_failed",
            UcpError::InvalidSignature => "invalid_signature",
            UcpError::NotAuthorized(_) => "agent_not_authorized",
            UcpError::NotFound(_) => "not_found",
            UcpError::StateConflict(_) => "conflict",
            UcpError::SessionExpired => "session_expired",
            UcpError::ProtocolDisabled => "ucp_disabled",
            UcpError::Database(_) => "storage_error",
            UcpError::Network(_) => "network_error",
            UcpError::Serialization(_) => "serialization_error",
            UcpError::Io(_) => "io_error",
        }
    }
}

impl From<serde_json::Error> for UcpError {
    fn from(err: serde_json::Error) -> Self {
        UcpError::Serialization(err.to_string())
    }
}

impl From<std::io::Error> for UcpError {
    fn from(err: std::io::Error) -> Self {
        UcpError::Io(err.to_string())
    }
}
