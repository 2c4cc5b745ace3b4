//! In-memory page context.
//!
//! Session state lives in a shared [`MemorySession`] so several request
//! contexts of one session (see [`MemoryPageContext::next_request`]) observe
//! the same session data. Request data is private to each context and is
//! closed by [`MemoryPageContext::end_request`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use super::{DataKey, DataValue, PageContext, SessionId};
use crate::error::ContextError;

static TEMPORARY_SESSIONS: AtomicU64 = AtomicU64::new(1);

/// Session state shared between the request contexts of one session.
#[derive(Debug, Default)]
pub struct MemorySession {
    id: Mutex<Option<SessionId>>,
    bound: AtomicBool,
    data: Mutex<HashMap<DataKey, DataValue>>,
    attributes: Mutex<HashMap<String, DataValue>>,
}

impl MemorySession {
    fn with_id(id: SessionId) -> Self {
        Self {
            id: Mutex::new(Some(id)),
            ..Self::default()
        }
    }
}

/// Page context backed by in-memory maps.
#[derive(Debug)]
pub struct MemoryPageContext {
    session: Arc<MemorySession>,
    request: Mutex<Option<HashMap<DataKey, DataValue>>>,
}

impl MemoryPageContext {
    /// Context of a request in an existing session.
    #[must_use]
    pub fn new(session_id: impl Into<SessionId>) -> Self {
        Self::for_session(Arc::new(MemorySession::with_id(session_id.into())))
    }

    /// Context of a request whose session has not been created yet.
    ///
    /// `session_id` fails with [`ContextError::NoSession`] until `bind` runs.
    #[must_use]
    pub fn temporary() -> Self {
        Self::for_session(Arc::new(MemorySession::default()))
    }

    fn for_session(session: Arc<MemorySession>) -> Self {
        Self {
            session,
            request: Mutex::new(Some(HashMap::new())),
        }
    }

    /// Context of the following request in the same session.
    #[must_use]
    pub fn next_request(&self) -> Self {
        Self::for_session(Arc::clone(&self.session))
    }

    /// End the request scope; later request data access fails.
    pub fn end_request(&self) {
        *self.request.lock().unwrap_or_else(|e| e.into_inner()) = None;
    }

    /// Whether the request scope is still open.
    #[must_use]
    pub fn is_request_open(&self) -> bool {
        self.request
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }

    /// Whether `bind` has been called for this session.
    #[must_use]
    pub fn is_bound(&self) -> bool {
        self.session.bound.load(Ordering::Acquire)
    }

    fn with_request<R>(
        &self,
        operation: &'static str,
        key: &DataKey,
        f: impl FnOnce(&mut HashMap<DataKey, DataValue>) -> R,
    ) -> Result<R, ContextError> {
        let mut guard = self.request.lock().unwrap_or_else(|e| e.into_inner());
        match guard.as_mut() {
            Some(map) => Ok(f(map)),
            None => Err(ContextError::RequestClosed {
                operation,
                key: key.name().to_string(),
            }),
        }
    }
}

impl PageContext for MemoryPageContext {
    fn bind(&self) -> Result<(), ContextError> {
        let mut id = self.session.id.lock().unwrap_or_else(|e| e.into_inner());
        if id.is_none() {
            let n = TEMPORARY_SESSIONS.fetch_add(1, Ordering::Relaxed);
            *id = Some(SessionId::new(format!("session-{n}")));
        }
        self.session.bound.store(true, Ordering::Release);
        Ok(())
    }

    fn session_id(&self) -> Result<SessionId, ContextError> {
        self.session
            .id
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or(ContextError::NoSession)
    }

    fn request_data(&self, key: &DataKey) -> Result<Option<DataValue>, ContextError> {
        self.with_request("get_request_data", key, |map| map.get(key).cloned())
    }

    fn set_request_data(&self, key: &DataKey, value: DataValue) -> Result<(), ContextError> {
        self.with_request("set_request_data", key, |map| {
            map.insert(*key, value);
        })
    }

    fn session_data(&self, key: &DataKey) -> Result<Option<DataValue>, ContextError> {
        let data = self.session.data.lock().unwrap_or_else(|e| e.into_inner());
        Ok(data.get(key).cloned())
    }

    fn set_session_data(&self, key: &DataKey, value: DataValue) -> Result<(), ContextError> {
        let mut data = self.session.data.lock().unwrap_or_else(|e| e.into_inner());
        data.insert(*key, value);
        Ok(())
    }

    fn session_attribute(&self, name: &str) -> Result<Option<DataValue>, ContextError> {
        let attributes = self
            .session
            .attributes
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        Ok(attributes.get(name).cloned())
    }

    fn set_session_attribute(&self, name: &str, value: DataValue) -> Result<(), ContextError> {
        let mut attributes = self
            .session
            .attributes
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        attributes.insert(name.to_string(), value);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::downcast_value;

    const KEY: DataKey = DataKey::new("test.key");

    #[test]
    fn request_data_roundtrip() {
        let ctx = MemoryPageContext::new("s1");
        assert!(ctx.request_data(&KEY).unwrap().is_none());
        ctx.set_request_data(&KEY, Arc::new(5u8)).unwrap();
        let value = downcast_value::<u8>(ctx.request_data(&KEY).unwrap());
        assert_eq!(value.as_deref(), Some(&5));
    }

    #[test]
    fn ended_request_rejects_request_data() {
        let ctx = MemoryPageContext::new("s1");
        ctx.end_request();
        assert!(!ctx.is_request_open());
        assert!(matches!(
            ctx.request_data(&KEY),
            Err(ContextError::RequestClosed { .. })
        ));
        assert!(matches!(
            ctx.set_request_data(&KEY, Arc::new(1u8)),
            Err(ContextError::RequestClosed { .. })
        ));
        // session scope is unaffected
        ctx.set_session_data(&KEY, Arc::new(1u8)).unwrap();
    }

    #[test]
    fn next_request_shares_session_not_request() {
        let first = MemoryPageContext::new("s1");
        first.set_request_data(&KEY, Arc::new(1u8)).unwrap();
        first.set_session_data(&KEY, Arc::new(2u8)).unwrap();
        first
            .set_session_attribute("user", Arc::new("ann".to_string()))
            .unwrap();

        let second = first.next_request();
        assert!(second.request_data(&KEY).unwrap().is_none());
        assert_eq!(
            downcast_value::<u8>(second.session_data(&KEY).unwrap()).as_deref(),
            Some(&2)
        );
        assert!(second.session_attribute("user").unwrap().is_some());
        assert_eq!(second.session_id().unwrap(), SessionId::new("s1"));
    }

    #[test]
    fn temporary_session_gets_id_on_bind() {
        let ctx = MemoryPageContext::temporary();
        assert_eq!(ctx.session_id(), Err(ContextError::NoSession));
        assert!(!ctx.is_bound());

        ctx.bind().unwrap();
        assert!(ctx.is_bound());
        let id = ctx.session_id().unwrap();
        assert!(id.as_str().starts_with("session-"));

        // binding again keeps the id
        ctx.bind().unwrap();
        assert_eq!(ctx.session_id().unwrap(), id);
    }
}
