//! Request-scoped buffering of added pages.
//!
//! Pages added during a request are kept in a per-request buffer and handed
//! to the next store at end of request ([`PageStore::detach`]), in the order
//! they were added. Adding a page id again moves it to the end, so the inner
//! store sees each page once, in its latest state.

use std::sync::{Arc, Mutex};

use tracing::{debug, warn};

use super::{DelegatingPageStore, PageStore};
use crate::context::{DataKey, PageContext};
use crate::error::{Result, StoreError};
use crate::page::{PageId, PageRef};

const REQUEST_BUFFER: DataKey = DataKey::new("pagestore.request_buffer");

/// Ordered, unique-by-id pages of one request.
#[derive(Debug, Default)]
pub struct RequestBuffer {
    pages: Vec<PageRef>,
}

impl RequestBuffer {
    /// Append as last, replacing an earlier entry with the same id.
    pub fn add(&mut self, page: PageRef) {
        self.remove(page.page_id());
        self.pages.push(page);
    }

    #[must_use]
    pub fn get(&self, id: PageId) -> Option<PageRef> {
        self.pages.iter().find(|p| p.page_id() == id).cloned()
    }

    pub fn remove(&mut self, id: PageId) {
        self.pages.retain(|p| p.page_id() != id);
    }

    pub fn clear(&mut self) {
        self.pages.clear();
    }

    /// Buffered page ids, in flush order.
    #[must_use]
    pub fn page_ids(&self) -> Vec<PageId> {
        self.pages.iter().map(|p| p.page_id()).collect()
    }

    fn take(&mut self) -> Vec<PageRef> {
        std::mem::take(&mut self.pages)
    }
}

type SharedBuffer = Arc<Mutex<RequestBuffer>>;

/// Buffers added pages until the end of the request.
#[derive(Debug)]
pub struct RequestPageStore {
    delegate: DelegatingPageStore,
}

impl RequestPageStore {
    #[must_use]
    pub fn new(inner: Arc<dyn PageStore>) -> Self {
        Self {
            delegate: DelegatingPageStore::new(inner),
        }
    }

    fn existing_buffer(context: &dyn PageContext) -> Result<Option<SharedBuffer>> {
        match context.request_data(&REQUEST_BUFFER)? {
            Some(value) => value
                .downcast::<Mutex<RequestBuffer>>()
                .map(Some)
                .map_err(|_| StoreError::CorruptRequestData(REQUEST_BUFFER.name()).into()),
            None => Ok(None),
        }
    }

    fn buffer(context: &dyn PageContext) -> Result<SharedBuffer> {
        if let Some(buffer) = Self::existing_buffer(context)? {
            return Ok(buffer);
        }
        let buffer: SharedBuffer = Arc::default();
        context.set_request_data(&REQUEST_BUFFER, buffer.clone())?;
        Ok(buffer)
    }

    fn with_buffer<R>(
        context: &dyn PageContext,
        f: impl FnOnce(&mut RequestBuffer) -> R,
    ) -> Result<Option<R>> {
        Ok(Self::existing_buffer(context)?.map(|buffer| {
            let mut guard = buffer.lock().unwrap_or_else(|e| e.into_inner());
            f(&mut guard)
        }))
    }

    /// Page ids buffered for the context's request, in flush order.
    pub fn buffered_page_ids(context: &dyn PageContext) -> Result<Vec<PageId>> {
        Ok(Self::with_buffer(context, |b| b.page_ids())?.unwrap_or_default())
    }
}

impl PageStore for RequestPageStore {
    fn can_be_asynchronous(&self, context: &dyn PageContext) -> bool {
        self.delegate.can_be_asynchronous(context)
    }

    fn add_page(&self, context: &dyn PageContext, page: PageRef) -> Result<()> {
        let buffer = Self::buffer(context)?;
        buffer.lock().unwrap_or_else(|e| e.into_inner()).add(page);
        Ok(())
    }

    fn get_page(&self, context: &dyn PageContext, id: PageId) -> Result<Option<PageRef>> {
        if let Some(page) = Self::with_buffer(context, |b| b.get(id))?.flatten() {
            return Ok(Some(page));
        }
        self.delegate.get_page(context, id)
    }

    fn remove_page(&self, context: &dyn PageContext, page: &PageRef) -> Result<()> {
        Self::with_buffer(context, |b| b.remove(page.page_id()))?;
        self.delegate.remove_page(context, page)
    }

    fn remove_all_pages(&self, context: &dyn PageContext) -> Result<()> {
        Self::with_buffer(context, RequestBuffer::clear)?;
        self.delegate.remove_all_pages(context)
    }

    fn detach(&self, context: &dyn PageContext) -> Result<()> {
        let pages = Self::with_buffer(context, RequestBuffer::take)?.unwrap_or_default();

        let mut first_error = None;
        for page in pages {
            let page_id = page.page_id();
            let stateless = match page.is_page_stateless() {
                Ok(stateless) => stateless,
                Err(err) => {
                    warn!(
                        page_id,
                        error = %err,
                        "An error occurred while checking whether a page is stateless. Assuming it is stateful."
                    );
                    false
                }
            };
            if stateless {
                debug!(page_id, "skipping stateless page");
                continue;
            }
            if let Err(err) = self.delegate.add_page(context, page) {
                warn!(page_id, error = %err, "failed to flush buffered page");
                first_error.get_or_insert(err);
            }
        }

        let detached = self.delegate.detach(context);
        match first_error {
            Some(err) => Err(err),
            None => detached,
        }
    }

    fn destroy(&self) {
        self.delegate.destroy();
    }

    fn delegate(&self) -> Option<&dyn PageStore> {
        self.delegate.delegate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::MemoryPageContext;
    use crate::error::Error;
    use crate::page::same_page;
    use crate::test_support::{RecordingStore, TestPage};

    fn setup() -> (Arc<RecordingStore>, RequestPageStore, MemoryPageContext) {
        let inner = Arc::new(RecordingStore::default());
        let store = RequestPageStore::new(inner.clone());
        (inner, store, MemoryPageContext::new("s1"))
    }

    #[test]
    fn add_is_deferred_until_detach() {
        let (inner, store, ctx) = setup();
        store.add_page(&ctx, TestPage::stateful(1)).unwrap();
        assert!(inner.calls().is_empty());

        store.detach(&ctx).unwrap();
        assert_eq!(inner.calls(), vec!["add 1", "detach"]);
    }

    #[test]
    fn get_prefers_buffered_instance() {
        let (inner, store, ctx) = setup();
        let page = TestPage::stateful(1);
        store.add_page(&ctx, page.clone()).unwrap();

        let back = store.get_page(&ctx, 1).unwrap().unwrap();
        assert!(same_page(&back, &page));
        assert!(inner.calls().is_empty());

        assert!(store.get_page(&ctx, 2).unwrap().is_none());
        assert_eq!(inner.calls(), vec!["get 2"]);
    }

    #[test]
    fn readding_moves_page_to_end() {
        let (inner, store, ctx) = setup();
        let first = TestPage::stateful(1);
        let latest = TestPage::stateful(1);
        store.add_page(&ctx, first).unwrap();
        store.add_page(&ctx, TestPage::stateful(2)).unwrap();
        store.add_page(&ctx, latest.clone()).unwrap();
        assert_eq!(RequestPageStore::buffered_page_ids(&ctx).unwrap(), vec![2, 1]);

        store.detach(&ctx).unwrap();
        assert_eq!(inner.calls(), vec!["add 2", "add 1", "detach"]);
        let stored = inner.memory.get_page(&ctx, 1).unwrap().unwrap();
        assert!(same_page(&stored, &latest));
    }

    #[test]
    fn detach_skips_stateless_and_keeps_failing_checks() {
        let (inner, store, ctx) = setup();
        store.add_page(&ctx, TestPage::stateless(1)).unwrap();
        store.add_page(&ctx, TestPage::failing(2)).unwrap();
        store.add_page(&ctx, TestPage::stateful(3)).unwrap();

        store.detach(&ctx).unwrap();
        assert_eq!(inner.calls(), vec!["add 2", "add 3", "detach"]);
    }

    #[test]
    fn detach_clears_buffer() {
        let (inner, store, ctx) = setup();
        store.add_page(&ctx, TestPage::stateful(1)).unwrap();
        store.detach(&ctx).unwrap();
        store.detach(&ctx).unwrap();

        assert_eq!(inner.calls(), vec!["add 1", "detach", "detach"]);
        assert!(RequestPageStore::buffered_page_ids(&ctx).unwrap().is_empty());
    }

    #[test]
    fn remove_drops_buffered_page_and_delegates() {
        let (inner, store, ctx) = setup();
        let page = TestPage::stateful(1);
        store.add_page(&ctx, page.clone()).unwrap();
        store.remove_page(&ctx, &page).unwrap();
        store.detach(&ctx).unwrap();

        assert_eq!(inner.calls(), vec!["remove 1", "detach"]);
    }

    #[test]
    fn remove_all_clears_buffer_and_delegates() {
        let (inner, store, ctx) = setup();
        store.add_page(&ctx, TestPage::stateful(1)).unwrap();
        store.add_page(&ctx, TestPage::stateful(2)).unwrap();
        store.remove_all_pages(&ctx).unwrap();
        store.detach(&ctx).unwrap();

        assert_eq!(inner.calls(), vec!["remove_all", "detach"]);
    }

    #[test]
    fn requests_have_separate_buffers() {
        let (inner, store, ctx) = setup();
        store.add_page(&ctx, TestPage::stateful(1)).unwrap();

        let next = ctx.next_request();
        assert!(store.get_page(&next, 1).unwrap().is_none());
        store.detach(&next).unwrap();
        assert_eq!(inner.calls(), vec!["get 1", "detach"]);
    }

    #[test]
    fn closed_request_surfaces_context_error() {
        let (_inner, store, ctx) = setup();
        ctx.end_request();
        let err = store.add_page(&ctx, TestPage::stateful(1)).unwrap_err();
        assert!(matches!(err, Error::Context(_)));
    }

    #[test]
    fn foreign_value_under_buffer_key_is_reported() {
        let (_inner, store, ctx) = setup();
        ctx.set_request_data(&REQUEST_BUFFER, Arc::new(1u8)).unwrap();
        let err = store.add_page(&ctx, TestPage::stateful(1)).unwrap_err();
        assert!(matches!(
            err,
            Error::Store(StoreError::CorruptRequestData(_))
        ));
    }
}
