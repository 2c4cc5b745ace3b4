//! Error types for pagestore-core

use thiserror::Error;

use crate::page::PageId;

/// Result alias used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Main error type for pagestore-core
#[derive(Error, Debug)]
pub enum Error {
    /// Page store errors
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Page context errors (closed scopes, restricted access)
    #[error("Context error: {0}")]
    Context(#[from] ContextError),

    /// Configuration errors
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
}

impl Error {
    /// Whether this error is an access violation raised by a restricted
    /// (background) page context.
    #[must_use]
    pub fn is_async_access_violation(&self) -> bool {
        matches!(self, Self::Context(ContextError::AsyncAccess { .. }))
    }
}

/// Page store errors
#[derive(Error, Debug)]
pub enum StoreError {
    /// The durable store failed to persist or load a page
    #[error("Persistence failed for page {page_id} in session {session_id}: {reason}")]
    Persistence {
        session_id: String,
        page_id: PageId,
        reason: String,
    },

    /// The wrapped store panicked while handling a page
    #[error("Store panicked during {operation} of page {page_id} in session {session_id}: {reason}")]
    Panicked {
        operation: &'static str,
        session_id: String,
        page_id: PageId,
        reason: String,
    },

    /// Request-scoped bookkeeping held an unexpected value under a private key
    #[error("Unexpected value stored under request key '{0}'")]
    CorruptRequestData(&'static str),
}

/// Page context errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ContextError {
    /// A restricted context refused an operation during background execution
    #[error("'{operation}' of '{key}' is not allowed in asynchronous mode")]
    AsyncAccess {
        operation: &'static str,
        key: String,
    },

    /// The request scope has ended
    #[error("Request scope is closed; cannot {operation} '{key}'")]
    RequestClosed {
        operation: &'static str,
        key: String,
    },

    /// No session is bound to the context
    #[error("No session is bound to this context")]
    NoSession,
}

impl ContextError {
    pub(crate) fn async_access(operation: &'static str, key: impl Into<String>) -> Self {
        Self::AsyncAccess {
            operation,
            key: key.into(),
        }
    }
}

/// Errors raised by pages
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PageError {
    /// The page could not determine whether it is stateless
    #[error("Statelessness check failed for page {page_id}: {reason}")]
    StatelessCheck { page_id: PageId, reason: String },
}

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Config file not found: {0}")]
    FileNotFound(String),

    #[error("Failed to read config {0}: {1}")]
    ReadFailed(String, String),

    #[error("Failed to parse config: {0}")]
    ParseFailed(String),

    #[error("Validation error: {0}")]
    ValidationError(String),
}
