//! Error conditions callers need to tell apart.
//!
//! Everything else travels as [`anyhow::Error`]; use `downcast_ref` to
//! recover these.

use thiserror::Error;

/// Preference store failures that are expected outcomes rather than bugs.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The alias already maps to another grocery item.
    #[error("alias '{alias}' already belongs to grocery item {existing_item_id}")]
    Conflict { alias: String, existing_item_id: i64 },

    #[error("{0} not found")]
    NotFound(String),

    #[error("invalid request: {0}")]
    Invalid(String),
}

/// Order session lookups and phase checks.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("order session {0} not found")]
    NotFound(String),

    #[error("order session {id} is {actual}, expected {expected}")]
    WrongPhase {
        id: String,
        expected: &'static str,
        actual: String,
    },

    #[error("proposal {0} does not exist")]
    UnknownProposal(usize),
}

/// Failure of a call to an external collaborator (catalog or shopping list).
#[derive(Debug, Error)]
pub enum ServiceError {
    /// Credentials are missing, invalid or expired (HTTP 401/403).
    #[error("{service}: not authorized ({message})")]
    Unauthorized { service: String, message: String },

    /// Rate limited or temporarily unavailable (HTTP 429/502/503).
    #[error("{service}: temporarily unavailable (HTTP {status})")]
    Unavailable { service: String, status: u16 },

    #[error("{service}: not found")]
    NotFound { service: String },

    #[error("{service}: request timed out")]
    Timeout { service: String },

    #[error("{service}: HTTP {status}: {body}")]
    Http {
        service: String,
        status: u16,
        body: String,
    },

    #[error("{service}: malformed response: {message}")]
    Malformed { service: String, message: String },

    #[error("{service}: {message}")]
    Transport { service: String, message: String },
}

impl ServiceError {
    /// Map an HTTP status code onto the taxonomy. `None` for success codes.
    pub fn from_status(service: &str, status: u16, body: String) -> Option<Self> {
        let service = service.to_string();
        match status {
            200..=299 => None,
            401 | 403 => Some(Self::Unauthorized {
                service,
                message: format!("HTTP {}", status),
            }),
            404 => Some(Self::NotFound { service }),
            429 | 502 | 503 => Some(Self::Unavailable { service, status }),
            _ => Some(Self::Http {
                service,
                status,
                body,
            }),
        }
    }

    pub fn is_auth(&self) -> bool {
        matches!(self, Self::Unauthorized { .. })
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}
