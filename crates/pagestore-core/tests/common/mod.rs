//! Shared test doubles for pagestore-core integration tests.
//!
//! Import from integration test files with:
//! ```ignore
//! mod common;
//! use common::{DummyPage, SlowPageStore};
//! ```

#![allow(dead_code)]

use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use rand::Rng;

use pagestore_core::page::downcast_page;
use pagestore_core::{
    ManageablePage, PageContext, PageError, PageId, PageRef, PageStore, Result, SessionId,
};

// ---------------------------------------------------------------------------
// DummyPage — a page with simulated serialization cost
// ---------------------------------------------------------------------------

/// Page whose storing takes `write_ms` and whose restoring takes `read_ms`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DummyPage {
    pub page_id: PageId,
    pub write_ms: u64,
    pub read_ms: u64,
    pub session_id: String,
}

impl DummyPage {
    pub fn new(page_id: PageId, write_ms: u64, read_ms: u64, session_id: &str) -> Self {
        Self {
            page_id,
            write_ms,
            read_ms,
            session_id: session_id.to_string(),
        }
    }

    pub fn into_ref(self) -> PageRef {
        Arc::new(self)
    }
}

impl ManageablePage for DummyPage {
    fn page_id(&self) -> PageId {
        self.page_id
    }

    fn is_page_stateless(&self) -> Result<bool, PageError> {
        Ok(false)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Value view of a page handle; panics for foreign page types.
pub fn dummy(page: &PageRef) -> &DummyPage {
    downcast_page::<DummyPage>(page).expect("DummyPage")
}

/// Value within ±10% of `target`.
pub fn around(target: u64) -> u64 {
    let low = target * 9 / 10;
    let high = target * 11 / 10;
    rand::rng().random_range(low..=high)
}

// ---------------------------------------------------------------------------
// SlowPageStore — persistent store with simulated latency
// ---------------------------------------------------------------------------

/// Stores page values and returns fresh copies, sleeping for the page's
/// write/read latency on every add/get.
#[derive(Debug, Default)]
pub struct SlowPageStore {
    pages: Mutex<HashMap<(SessionId, PageId), DummyPage>>,
    adds: AtomicUsize,
}

impl SlowPageStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of completed adds.
    pub fn adds(&self) -> usize {
        self.adds.load(Ordering::SeqCst)
    }

    /// Wait until at least `count` adds completed.
    pub fn wait_for_adds(&self, count: usize, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if self.adds() >= count {
                return true;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        self.adds() >= count
    }

    pub fn stored(&self, session: &str, id: PageId) -> Option<DummyPage> {
        self.pages
            .lock()
            .unwrap()
            .get(&(SessionId::new(session), id))
            .cloned()
    }
}

impl PageStore for SlowPageStore {
    fn can_be_asynchronous(&self, context: &dyn PageContext) -> bool {
        context.bind().is_ok() && context.session_id().is_ok()
    }

    fn add_page(&self, context: &dyn PageContext, page: PageRef) -> Result<()> {
        let session = context.session_id()?;
        let value = dummy(&page).clone();
        std::thread::sleep(Duration::from_millis(value.write_ms));
        self.pages
            .lock()
            .unwrap()
            .insert((session, value.page_id), value);
        self.adds.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn get_page(&self, context: &dyn PageContext, id: PageId) -> Result<Option<PageRef>> {
        let session = context.session_id()?;
        let stored = self.pages.lock().unwrap().get(&(session, id)).cloned();
        Ok(stored.map(|value| {
            std::thread::sleep(Duration::from_millis(value.read_ms));
            value.into_ref()
        }))
    }

    fn remove_page(&self, context: &dyn PageContext, page: &PageRef) -> Result<()> {
        let session = context.session_id()?;
        self.pages.lock().unwrap().remove(&(session, page.page_id()));
        Ok(())
    }

    fn remove_all_pages(&self, context: &dyn PageContext) -> Result<()> {
        let session = context.session_id()?;
        self.pages.lock().unwrap().retain(|(s, _), _| *s != session);
        Ok(())
    }
}
