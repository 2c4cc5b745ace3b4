//! Page stores and their decorators.
//!
//! # Pipeline
//!
//! ```text
//! request thread ─▶ RequestPageStore ─▶ AsyncPageStore ─▶ durable store
//!                   (buffer per request)  (worker per session)
//! ```
//!
//! Every layer implements [`PageStore`]. Decorators expose the store they
//! wrap through [`PageStore::delegate`], which lets monitoring code find a
//! capability anywhere in the chain with [`unwrap_store`].

use serde::{Deserialize, Serialize};

use crate::context::{PageContext, SessionId};
use crate::error::Result;
use crate::page::{PageId, PageRef};

pub mod asynchronous;
pub mod delegating;
pub mod memory;
pub mod request;

pub use asynchronous::{AsyncPageStore, AsyncStoreStats};
pub use delegating::DelegatingPageStore;
pub use memory::{MemoryPageStore, NoopPageStore};
pub use request::RequestPageStore;

/// A store of pages keyed by (session, page id).
pub trait PageStore: Send + Sync {
    /// Whether pages may be added from a background thread.
    ///
    /// Called on the request thread before an asynchronous add is queued, so
    /// the store can bind the session or read whatever it needs from the live
    /// context.
    fn can_be_asynchronous(&self, _context: &dyn PageContext) -> bool {
        false
    }

    /// Store a page.
    fn add_page(&self, context: &dyn PageContext, page: PageRef) -> Result<()>;

    /// Look up a page of the context's session.
    fn get_page(&self, context: &dyn PageContext, id: PageId) -> Result<Option<PageRef>>;

    /// Remove a page.
    fn remove_page(&self, context: &dyn PageContext, page: &PageRef) -> Result<()>;

    /// Remove all pages of the context's session.
    fn remove_all_pages(&self, context: &dyn PageContext) -> Result<()>;

    /// End-of-request notification.
    fn detach(&self, _context: &dyn PageContext) -> Result<()> {
        Ok(())
    }

    /// Release all resources. The store must not be used afterwards.
    fn destroy(&self) {}

    /// The store this one decorates, if any.
    fn delegate(&self) -> Option<&dyn PageStore> {
        None
    }

    /// Capability probe for [`PersistentPageStore`].
    fn as_persistent(&self) -> Option<&dyn PersistentPageStore> {
        None
    }

    /// Capability probe for the asynchronous layer.
    fn as_async(&self) -> Option<&AsyncPageStore> {
        None
    }
}

/// A page as recorded by a persistent store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedPage {
    pub page_id: PageId,
    pub page_type: String,
    /// Serialized size in bytes, for stores that know it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
}

/// A store that can enumerate what it has persisted.
pub trait PersistentPageStore: PageStore {
    /// Identifier under which the context's session is persisted, if any.
    fn session_identifier(&self, context: &dyn PageContext) -> Option<SessionId>;

    /// All sessions with persisted pages.
    fn session_identifiers(&self) -> Vec<SessionId>;

    /// Pages persisted for a session, in ascending page id order.
    fn persisted_pages(&self, session: &SessionId) -> Vec<PersistedPage>;

    /// Number of pages persisted across all sessions.
    fn total_pages(&self) -> usize;
}

/// Walk the delegation chain from `store` downward and return the first
/// result of `probe`.
pub fn unwrap_store<'a, T, F>(store: &'a dyn PageStore, probe: F) -> Option<&'a T>
where
    T: ?Sized,
    F: Fn(&'a dyn PageStore) -> Option<&'a T>,
{
    let mut current = Some(store);
    while let Some(store) = current {
        if let Some(found) = probe(store) {
            return Some(found);
        }
        current = store.delegate();
    }
    None
}

/// Find the persistent store beneath any decorators.
pub fn find_persistent_store(store: &dyn PageStore) -> Option<&dyn PersistentPageStore> {
    unwrap_store(store, |s| s.as_persistent())
}

/// Find the asynchronous layer of a pipeline.
pub fn find_async_store(store: &dyn PageStore) -> Option<&AsyncPageStore> {
    unwrap_store(store, |s| s.as_async())
}
