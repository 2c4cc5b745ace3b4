//! Restricted contexts for background persistence.
//!
//! Asynchronous stores hand a page to a worker that runs after the request
//! has returned. The worker must not touch live request or session state,
//! so the handoff happens in two phases:
//!
//! 1. **Capture**: [`CapturingContext`] wraps the live context while the
//!    request thread is still inside `add_page`. Every operation is forwarded
//!    unchanged and every value read or written is recorded.
//! 2. **Asynchronous**: [`CapturingContext::into_async`] turns the record into
//!    an owned [`AsyncPageContext`]. It answers `bind`, `session_id` and reads
//!    of captured keys from the snapshot, and refuses everything else with
//!    [`ContextError::AsyncAccess`].

use std::collections::HashMap;
use std::sync::Mutex;

use super::{DataKey, DataValue, PageContext, SessionId};
use crate::error::ContextError;

#[derive(Debug, Default)]
struct Snapshot {
    session_id: Option<SessionId>,
    request: HashMap<DataKey, Option<DataValue>>,
    session: HashMap<DataKey, Option<DataValue>>,
    attributes: HashMap<String, Option<DataValue>>,
}

/// Forwarding context that records what the wrapped context exposed.
pub struct CapturingContext<'a> {
    live: &'a dyn PageContext,
    snapshot: Mutex<Snapshot>,
}

impl std::fmt::Debug for CapturingContext<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CapturingContext")
            .field("snapshot", &self.snapshot)
            .finish_non_exhaustive()
    }
}

impl<'a> CapturingContext<'a> {
    #[must_use]
    pub fn new(live: &'a dyn PageContext) -> Self {
        Self {
            live,
            snapshot: Mutex::new(Snapshot::default()),
        }
    }

    fn record(&self, f: impl FnOnce(&mut Snapshot)) {
        f(&mut self.snapshot.lock().unwrap_or_else(|e| e.into_inner()));
    }

    /// Freeze the captured values into a context usable after the request.
    ///
    /// Fails with [`ContextError::NoSession`] when no session id can be
    /// determined.
    pub fn into_async(self) -> Result<AsyncPageContext, ContextError> {
        let snapshot = self
            .snapshot
            .into_inner()
            .unwrap_or_else(|e| e.into_inner());
        let session_id = match snapshot.session_id {
            Some(id) => id,
            None => self.live.session_id()?,
        };
        Ok(AsyncPageContext {
            session_id,
            request: snapshot.request,
            session: snapshot.session,
            attributes: snapshot.attributes,
        })
    }
}

impl PageContext for CapturingContext<'_> {
    fn bind(&self) -> Result<(), ContextError> {
        self.live.bind()
    }

    fn session_id(&self) -> Result<SessionId, ContextError> {
        let id = self.live.session_id()?;
        self.record(|s| s.session_id = Some(id.clone()));
        Ok(id)
    }

    fn request_data(&self, key: &DataKey) -> Result<Option<DataValue>, ContextError> {
        let value = self.live.request_data(key)?;
        self.record(|s| {
            s.request.insert(*key, value.clone());
        });
        Ok(value)
    }

    fn set_request_data(&self, key: &DataKey, value: DataValue) -> Result<(), ContextError> {
        self.live.set_request_data(key, value.clone())?;
        self.record(|s| {
            s.request.insert(*key, Some(value));
        });
        Ok(())
    }

    fn session_data(&self, key: &DataKey) -> Result<Option<DataValue>, ContextError> {
        let value = self.live.session_data(key)?;
        self.record(|s| {
            s.session.insert(*key, value.clone());
        });
        Ok(value)
    }

    fn set_session_data(&self, key: &DataKey, value: DataValue) -> Result<(), ContextError> {
        self.live.set_session_data(key, value.clone())?;
        self.record(|s| {
            s.session.insert(*key, Some(value));
        });
        Ok(())
    }

    fn session_attribute(&self, name: &str) -> Result<Option<DataValue>, ContextError> {
        let value = self.live.session_attribute(name)?;
        self.record(|s| {
            s.attributes.insert(name.to_string(), value.clone());
        });
        Ok(value)
    }

    fn set_session_attribute(&self, name: &str, value: DataValue) -> Result<(), ContextError> {
        self.live.set_session_attribute(name, value.clone())?;
        self.record(|s| {
            s.attributes.insert(name.to_string(), Some(value));
        });
        Ok(())
    }
}

/// Read-only snapshot of a context, safe to use from a background worker.
#[derive(Debug)]
pub struct AsyncPageContext {
    session_id: SessionId,
    request: HashMap<DataKey, Option<DataValue>>,
    session: HashMap<DataKey, Option<DataValue>>,
    attributes: HashMap<String, Option<DataValue>>,
}

fn captured<K, Q>(
    map: &HashMap<K, Option<DataValue>>,
    key: &Q,
    operation: &'static str,
    name: &str,
) -> Result<Option<DataValue>, ContextError>
where
    K: std::borrow::Borrow<Q> + Eq + std::hash::Hash,
    Q: Eq + std::hash::Hash + ?Sized,
{
    map.get(key)
        .cloned()
        .ok_or_else(|| ContextError::async_access(operation, name))
}

impl PageContext for AsyncPageContext {
    fn bind(&self) -> Result<(), ContextError> {
        // the session was materialized during capture
        Ok(())
    }

    fn session_id(&self) -> Result<SessionId, ContextError> {
        Ok(self.session_id.clone())
    }

    fn request_data(&self, key: &DataKey) -> Result<Option<DataValue>, ContextError> {
        captured(&self.request, key, "get_request_data", key.name())
    }

    fn set_request_data(&self, key: &DataKey, _value: DataValue) -> Result<(), ContextError> {
        Err(ContextError::async_access("set_request_data", key.name()))
    }

    fn session_data(&self, key: &DataKey) -> Result<Option<DataValue>, ContextError> {
        captured(&self.session, key, "get_session_data", key.name())
    }

    fn set_session_data(&self, key: &DataKey, _value: DataValue) -> Result<(), ContextError> {
        Err(ContextError::async_access("set_session_data", key.name()))
    }

    fn session_attribute(&self, name: &str) -> Result<Option<DataValue>, ContextError> {
        captured(&self.attributes, name, "get_session_attribute", name)
    }

    fn set_session_attribute(&self, name: &str, _value: DataValue) -> Result<(), ContextError> {
        Err(ContextError::async_access("set_session_attribute", name))
    }
}
