//! Pass-through decorator base.
//!
//! Decorators embed a [`DelegatingPageStore`] and call it for every operation
//! they do not change, the way a subclass calls its superclass.

use std::sync::Arc;

use super::PageStore;
use crate::context::PageContext;
use crate::error::Result;
use crate::page::{PageId, PageRef};

/// Forwards every operation to the wrapped store.
#[derive(Clone)]
pub struct DelegatingPageStore {
    inner: Arc<dyn PageStore>,
}

impl std::fmt::Debug for DelegatingPageStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DelegatingPageStore").finish_non_exhaustive()
    }
}

impl DelegatingPageStore {
    #[must_use]
    pub fn new(inner: Arc<dyn PageStore>) -> Self {
        Self { inner }
    }
}

impl PageStore for DelegatingPageStore {
    fn can_be_asynchronous(&self, context: &dyn PageContext) -> bool {
        self.inner.can_be_asynchronous(context)
    }

    fn add_page(&self, context: &dyn PageContext, page: PageRef) -> Result<()> {
        self.inner.add_page(context, page)
    }

    fn get_page(&self, context: &dyn PageContext, id: PageId) -> Result<Option<PageRef>> {
        self.inner.get_page(context, id)
    }

    fn remove_page(&self, context: &dyn PageContext, page: &PageRef) -> Result<()> {
        self.inner.remove_page(context, page)
    }

    fn remove_all_pages(&self, context: &dyn PageContext) -> Result<()> {
        self.inner.remove_all_pages(context)
    }

    fn detach(&self, context: &dyn PageContext) -> Result<()> {
        self.inner.detach(context)
    }

    fn destroy(&self) {
        self.inner.destroy();
    }

    fn delegate(&self) -> Option<&dyn PageStore> {
        Some(self.inner.as_ref())
    }
}
