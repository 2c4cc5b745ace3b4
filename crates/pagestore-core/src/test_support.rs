//! Shared doubles for unit tests.

use std::any::Any;
use std::sync::{Arc, Mutex};

use crate::context::PageContext;
use crate::error::{PageError, Result};
use crate::page::{ManageablePage, PageId, PageRef};
use crate::store::{MemoryPageStore, PageStore};

#[derive(Debug)]
pub struct TestPage {
    id: PageId,
    stateless: Option<bool>,
}

impl TestPage {
    pub fn stateful(id: PageId) -> PageRef {
        Arc::new(Self {
            id,
            stateless: Some(false),
        })
    }

    pub fn stateless(id: PageId) -> PageRef {
        Arc::new(Self {
            id,
            stateless: Some(true),
        })
    }

    /// Page whose statelessness check fails.
    pub fn failing(id: PageId) -> PageRef {
        Arc::new(Self {
            id,
            stateless: None,
        })
    }
}

impl ManageablePage for TestPage {
    fn page_id(&self) -> PageId {
        self.id
    }

    fn is_page_stateless(&self) -> Result<bool, PageError> {
        self.stateless.ok_or_else(|| PageError::StatelessCheck {
            page_id: self.id,
            reason: "page not initialized".to_string(),
        })
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Memory store that logs the order of calls it receives.
#[derive(Debug, Default)]
pub struct RecordingStore {
    pub memory: MemoryPageStore,
    pub calls: Mutex<Vec<String>>,
}

impl RecordingStore {
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }
}

impl PageStore for RecordingStore {
    fn add_page(&self, context: &dyn PageContext, page: PageRef) -> Result<()> {
        self.record(format!("add {}", page.page_id()));
        self.memory.add_page(context, page)
    }

    fn get_page(&self, context: &dyn PageContext, id: PageId) -> Result<Option<PageRef>> {
        self.record(format!("get {id}"));
        self.memory.get_page(context, id)
    }

    fn remove_page(&self, context: &dyn PageContext, page: &PageRef) -> Result<()> {
        self.record(format!("remove {}", page.page_id()));
        self.memory.remove_page(context, page)
    }

    fn remove_all_pages(&self, context: &dyn PageContext) -> Result<()> {
        self.record("remove_all".to_string());
        self.memory.remove_all_pages(context)
    }

    fn detach(&self, _context: &dyn PageContext) -> Result<()> {
        self.record("detach".to_string());
        Ok(())
    }
}
