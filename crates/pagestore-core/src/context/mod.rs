//! Page context: the session/request scope a store operates in.
//!
//! A [`PageContext`] exposes three key-value scopes (request data, session
//! data, session attributes) plus session identity. Stores never hold on to
//! a context past the call they received it in; background work gets an
//! owned, restricted snapshot instead (see [`restricted`]).

use std::any::Any;
use std::borrow::Borrow;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::ContextError;

pub mod memory;
pub mod restricted;

pub use memory::MemoryPageContext;
pub use restricted::{AsyncPageContext, CapturingContext};

/// Value stored in any context scope.
pub type DataValue = Arc<dyn Any + Send + Sync>;

/// Identifier of a session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SessionId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for SessionId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl Borrow<str> for SessionId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// Key for request or session data.
///
/// Keys are compared by name; crates should namespace their names to avoid
/// collisions (`"pagestore.request_buffer"`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DataKey(&'static str);

impl DataKey {
    #[must_use]
    pub const fn new(name: &'static str) -> Self {
        Self(name)
    }

    #[must_use]
    pub const fn name(&self) -> &'static str {
        self.0
    }
}

impl fmt::Display for DataKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0)
    }
}

/// The session/request scope handed to page stores.
///
/// All methods take `&self`; implementations use interior mutability so a
/// context can be shared between the layers of one pipeline.
pub trait PageContext: Send + Sync {
    /// Make the session persistent (materialize it if it is temporary).
    fn bind(&self) -> Result<(), ContextError>;

    /// Identifier of the bound session.
    fn session_id(&self) -> Result<SessionId, ContextError>;

    /// Read request-scoped data.
    fn request_data(&self, key: &DataKey) -> Result<Option<DataValue>, ContextError>;

    /// Write request-scoped data.
    fn set_request_data(&self, key: &DataKey, value: DataValue) -> Result<(), ContextError>;

    /// Read session-scoped data.
    fn session_data(&self, key: &DataKey) -> Result<Option<DataValue>, ContextError>;

    /// Write session-scoped data.
    fn set_session_data(&self, key: &DataKey, value: DataValue) -> Result<(), ContextError>;

    /// Read a session attribute.
    fn session_attribute(&self, name: &str) -> Result<Option<DataValue>, ContextError>;

    /// Write a session attribute.
    fn set_session_attribute(&self, name: &str, value: DataValue) -> Result<(), ContextError>;
}

/// Downcast a context value to a concrete type.
#[must_use]
pub fn downcast_value<T: Any + Send + Sync>(value: Option<DataValue>) -> Option<Arc<T>> {
    value.and_then(|v| v.downcast::<T>().ok())
}
