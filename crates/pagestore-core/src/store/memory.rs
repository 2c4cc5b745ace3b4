//! Reference stores: a no-op sink and an identity-keeping in-memory store.

use std::collections::BTreeMap;
use std::sync::Mutex;

use tracing::debug;

use super::{PageStore, PersistedPage, PersistentPageStore};
use crate::context::{PageContext, SessionId};
use crate::error::{ContextError, Result};
use crate::page::{PageId, PageRef};

/// Accepts every page and keeps none of them.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopPageStore;

impl PageStore for NoopPageStore {
    fn add_page(&self, _context: &dyn PageContext, _page: PageRef) -> Result<()> {
        Ok(())
    }

    fn get_page(&self, _context: &dyn PageContext, _id: PageId) -> Result<Option<PageRef>> {
        Ok(None)
    }

    fn remove_page(&self, _context: &dyn PageContext, _page: &PageRef) -> Result<()> {
        Ok(())
    }

    fn remove_all_pages(&self, _context: &dyn PageContext) -> Result<()> {
        Ok(())
    }
}

type SessionPages = BTreeMap<PageId, PageRef>;

/// Keeps page instances in memory, per session.
///
/// Pages are returned by identity. With [`MemoryPageStore::asynchronous`]
/// the store accepts background adds and binds the session when asked.
#[derive(Debug, Default)]
pub struct MemoryPageStore {
    sessions: Mutex<BTreeMap<SessionId, SessionPages>>,
    asynchronous: bool,
}

impl MemoryPageStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Store that agrees to be used from background workers.
    #[must_use]
    pub fn asynchronous() -> Self {
        Self {
            asynchronous: true,
            ..Self::default()
        }
    }

    /// Number of pages across all sessions.
    #[must_use]
    pub fn page_count(&self) -> usize {
        self.lock().values().map(BTreeMap::len).sum()
    }

    /// Whether a page is stored for the session.
    #[must_use]
    pub fn contains(&self, session: &SessionId, id: PageId) -> bool {
        self.lock()
            .get(session)
            .is_some_and(|pages| pages.contains_key(&id))
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<SessionId, SessionPages>> {
        self.sessions.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Session of a context, or `None` when no session exists yet.
fn existing_session(context: &dyn PageContext) -> Result<Option<SessionId>> {
    match context.session_id() {
        Ok(id) => Ok(Some(id)),
        Err(ContextError::NoSession) => Ok(None),
        Err(err) => Err(err.into()),
    }
}

impl PageStore for MemoryPageStore {
    fn can_be_asynchronous(&self, context: &dyn PageContext) -> bool {
        self.asynchronous && context.bind().is_ok() && context.session_id().is_ok()
    }

    fn add_page(&self, context: &dyn PageContext, page: PageRef) -> Result<()> {
        let session = context.session_id()?;
        debug!(session_id = %session, page_id = page.page_id(), "storing page in memory");
        self.lock()
            .entry(session)
            .or_default()
            .insert(page.page_id(), page);
        Ok(())
    }

    fn get_page(&self, context: &dyn PageContext, id: PageId) -> Result<Option<PageRef>> {
        let Some(session) = existing_session(context)? else {
            return Ok(None);
        };
        Ok(self
            .lock()
            .get(&session)
            .and_then(|pages| pages.get(&id).cloned()))
    }

    fn remove_page(&self, context: &dyn PageContext, page: &PageRef) -> Result<()> {
        if let Some(session) = existing_session(context)? {
            let mut sessions = self.lock();
            if let Some(pages) = sessions.get_mut(&session) {
                pages.remove(&page.page_id());
                if pages.is_empty() {
                    sessions.remove(&session);
                }
            }
        }
        Ok(())
    }

    fn remove_all_pages(&self, context: &dyn PageContext) -> Result<()> {
        if let Some(session) = existing_session(context)? {
            self.lock().remove(&session);
        }
        Ok(())
    }

    fn destroy(&self) {
        self.lock().clear();
    }

    fn as_persistent(&self) -> Option<&dyn PersistentPageStore> {
        Some(self)
    }
}

impl PersistentPageStore for MemoryPageStore {
    fn session_identifier(&self, context: &dyn PageContext) -> Option<SessionId> {
        let session = context.session_id().ok()?;
        self.lock().contains_key(&session).then_some(session)
    }

    fn session_identifiers(&self) -> Vec<SessionId> {
        self.lock().keys().cloned().collect()
    }

    fn persisted_pages(&self, session: &SessionId) -> Vec<PersistedPage> {
        self.lock()
            .get(session)
            .map(|pages| {
                pages
                    .values()
                    .map(|page| PersistedPage {
                        page_id: page.page_id(),
                        page_type: page.page_type().to_string(),
                        // live instances, never serialized
                        size: None,
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    fn total_pages(&self) -> usize {
        self.page_count()
    }
}
