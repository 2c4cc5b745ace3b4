//! Asynchronous page persistence with per-session workers.
//!
//! [`AsyncPageStore`] takes added pages off the request thread: each page is
//! queued for its session and a dedicated worker thread hands it to the
//! wrapped store. Pages still waiting in a queue are returned from
//! [`PageStore::get_page`] by identity.
//!
//! # Design
//!
//! All queues live in one `QueueState` behind a single mutex, together with
//! the global count of queued pages. The capacity check, the enqueue and the
//! decision to start a worker are one critical section, so the count never
//! exceeds the capacity. When it would, or when the wrapped store refuses
//! background work, the page is stored synchronously on the calling thread.
//!
//! A worker stores the entry at the front of its queue and removes it only
//! after the wrapped store returned. Until then `get_page` still finds the
//! page in the queue; afterwards the wrapped store has it.
//!
//! A page removed while its worker is storing it stays queued, hidden from
//! readers, until the worker has removed it from the wrapped store again.
//! Synchronous adds of that page wait for the removal to finish.
//!
//! Workers exit when their queue is empty and are started again by the next
//! add. Every call a worker makes into the wrapped store is guarded against
//! panics. [`PageStore::destroy`] stops async intake and joins every worker
//! after it drained its queue.
//!
//! Workers never see the live context. They get an [`AsyncPageContext`]
//! captured while `can_be_asynchronous` ran on the request thread.

use std::any::Any;
use std::collections::{HashMap, VecDeque};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::JoinHandle;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, trace, warn};

use super::{DelegatingPageStore, PageStore};
use crate::context::{AsyncPageContext, CapturingContext, PageContext, SessionId};
use crate::error::{Error, Result, StoreError};
use crate::page::{PageId, PageRef};

/// Default prefix of worker thread names.
pub const DEFAULT_WORKER_PREFIX: &str = "page-store";

// ---------------------------------------------------------------------------
// Queue state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    /// Waiting for the worker.
    Queued,
    /// Being stored by the worker.
    Storing,
    /// Removed by the caller while being stored.
    Discarded,
    /// Stored after being discarded; being removed from the wrapped store.
    Undoing,
}

#[derive(Debug)]
struct PendingAdd {
    seq: u64,
    page: PageRef,
    context: Arc<AsyncPageContext>,
    stage: Stage,
}

impl PendingAdd {
    fn is(&self, id: PageId) -> bool {
        self.page.page_id() == id
    }

    fn is_live(&self) -> bool {
        matches!(self.stage, Stage::Queued | Stage::Storing)
    }
}

#[derive(Debug, Default)]
struct SessionQueue {
    entries: VecDeque<PendingAdd>,
    worker: Option<JoinHandle<()>>,
}

/// What a session queue knows about a page id.
enum Lookup {
    Pending(PageRef),
    /// Removed while being stored; the wrapped store may still hold it.
    Discarded,
    Unknown,
}

impl SessionQueue {
    fn lookup(&self, id: PageId) -> Lookup {
        let mut discarded = false;
        for entry in self.entries.iter().rev().filter(|e| e.is(id)) {
            if entry.is_live() {
                return Lookup::Pending(entry.page.clone());
            }
            discarded = true;
        }
        if discarded {
            Lookup::Discarded
        } else {
            Lookup::Unknown
        }
    }

    fn undoing(&self, id: PageId) -> bool {
        self.entries
            .iter()
            .any(|e| e.stage == Stage::Undoing && e.is(id))
    }

    /// A synchronous add of `id` follows: drop its queued versions and keep
    /// a discarded one that is still being stored.
    fn supersede(&mut self, id: PageId) -> usize {
        for entry in self.entries.iter_mut() {
            if entry.stage == Stage::Discarded && entry.is(id) {
                entry.stage = Stage::Storing;
            }
        }
        let before = self.entries.len();
        self.entries
            .retain(|e| e.stage != Stage::Queued || !e.is(id));
        before - self.entries.len()
    }

    /// Drop matching queued entries; one being stored is marked discarded.
    fn cancel(&mut self, matches: impl Fn(&PendingAdd) -> bool) -> usize {
        for entry in self.entries.iter_mut() {
            if entry.stage == Stage::Storing && matches(&*entry) {
                entry.stage = Stage::Discarded;
            }
        }
        let before = self.entries.len();
        self.entries
            .retain(|e| e.stage != Stage::Queued || !matches(e));
        before - self.entries.len()
    }
}

#[derive(Debug)]
struct QueueState {
    accepting: bool,
    queued: usize,
    next_seq: u64,
    sessions: HashMap<SessionId, SessionQueue>,
}

#[derive(Debug, Default)]
struct Counters {
    stored: AtomicU64,
    failed: AtomicU64,
    cancelled: AtomicU64,
    sync_fallbacks: AtomicU64,
    sync_direct: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }
}

struct Shared {
    inner: Arc<dyn PageStore>,
    capacity: usize,
    worker_prefix: String,
    state: Mutex<QueueState>,
    /// Signalled whenever a worker finished an entry.
    settled: Condvar,
    counters: Counters,
}

enum Enqueued {
    Queued,
    Replaced,
    Rejected(PageRef),
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn enqueue(
        self: &Arc<Self>,
        session_id: &SessionId,
        page: PageRef,
        context: Arc<AsyncPageContext>,
    ) -> Enqueued {
        let mut guard = self.lock();
        let state = &mut *guard;
        let page_id = page.page_id();

        let waiting = state.sessions.get_mut(session_id).and_then(|queue| {
            queue
                .entries
                .iter_mut()
                .rev()
                .find(|e| e.stage == Stage::Queued && e.is(page_id))
        });
        if let Some(entry) = waiting {
            entry.page = page;
            entry.context = context;
            return Enqueued::Replaced;
        }

        if !state.accepting || state.queued >= self.capacity {
            return Enqueued::Rejected(page);
        }

        let seq = state.next_seq;
        state.next_seq += 1;
        let queue = state.sessions.entry(session_id.clone()).or_default();
        queue.entries.push_back(PendingAdd {
            seq,
            page,
            context,
            stage: Stage::Queued,
        });

        // a finished worker with a non-empty queue died; replace it
        if queue.worker.as_ref().is_none_or(JoinHandle::is_finished) {
            match self.spawn_worker(session_id) {
                Ok(handle) => queue.worker = Some(handle),
                Err(err) => {
                    error!(session_id = %session_id, error = %err, "failed to start page store worker");
                    let withdrawn = queue.entries.pop_back().map(|e| e.page);
                    if queue.entries.is_empty() {
                        state.sessions.remove(session_id);
                    }
                    return match withdrawn {
                        Some(page) => Enqueued::Rejected(page),
                        None => Enqueued::Queued,
                    };
                }
            }
        }

        state.queued += 1;
        Enqueued::Queued
    }

    fn spawn_worker(self: &Arc<Self>, session_id: &SessionId) -> std::io::Result<JoinHandle<()>> {
        let shared = Arc::clone(self);
        let session = session_id.clone();
        let name = format!("{}-{}", self.worker_prefix, session_id.as_str().replace('\0', ""));
        std::thread::Builder::new()
            .name(name)
            .spawn(move || shared.run_worker(&session))
    }

    /// Store the session's queue front to back until it is empty.
    fn run_worker(&self, session_id: &SessionId) {
        debug!(session_id = %session_id, "page store worker started");
        while let Some((seq, page, context)) = self.next_entry(session_id) {
            if self.store(session_id, &context, &page) && self.begin_undo(session_id, seq) {
                self.undo(session_id, &context, &page);
            }
            self.complete(session_id, seq);
        }
        debug!(session_id = %session_id, "page store worker idle, exiting");
    }

    /// The front entry, marked as being stored. An empty queue is removed.
    fn next_entry(&self, session_id: &SessionId) -> Option<(u64, PageRef, Arc<AsyncPageContext>)> {
        let mut guard = self.lock();
        let state = &mut *guard;
        let front = state
            .sessions
            .get_mut(session_id)
            .and_then(|queue| queue.entries.front_mut());
        match front {
            Some(entry) => {
                if entry.stage == Stage::Queued {
                    entry.stage = Stage::Storing;
                }
                Some((entry.seq, entry.page.clone(), Arc::clone(&entry.context)))
            }
            None => {
                // idle: the handle (if still held) is dropped with the queue
                state.sessions.remove(session_id);
                None
            }
        }
    }

    /// Store one page; failures are logged and counted, never propagated.
    fn store(&self, session_id: &SessionId, context: &AsyncPageContext, page: &PageRef) -> bool {
        let page_id = page.page_id();
        let outcome = guarded("add", session_id, page_id, || {
            self.inner.add_page(context, page.clone())
        });
        match outcome {
            Ok(()) => {
                trace!(session_id = %session_id, page_id, "stored page asynchronously");
                Counters::bump(&self.counters.stored, 1);
                true
            }
            Err(err) => {
                warn!(
                    session_id = %session_id,
                    page_id,
                    error = %err,
                    async_access = err.is_async_access_violation(),
                    panicked = matches!(err, Error::Store(StoreError::Panicked { .. })),
                    "asynchronous page store failed; page dropped"
                );
                Counters::bump(&self.counters.failed, 1);
                false
            }
        }
    }

    /// Whether the entry was discarded while it was stored. If so it stays
    /// queued, hidden from readers, until [`Shared::undo`] finished.
    fn begin_undo(&self, session_id: &SessionId, seq: u64) -> bool {
        let mut state = self.lock();
        let entry = state
            .sessions
            .get_mut(session_id)
            .and_then(|queue| queue.entries.iter_mut().find(|e| e.seq == seq));
        match entry {
            Some(entry) if matches!(entry.stage, Stage::Discarded | Stage::Undoing) => {
                entry.stage = Stage::Undoing;
                true
            }
            _ => false,
        }
    }

    fn undo(&self, session_id: &SessionId, context: &AsyncPageContext, page: &PageRef) {
        let page_id = page.page_id();
        Counters::bump(&self.counters.cancelled, 1);
        let outcome = guarded("remove", session_id, page_id, || {
            self.inner.remove_page(context, page)
        });
        if let Err(err) = outcome {
            warn!(
                session_id = %session_id,
                page_id,
                error = %err,
                "failed to remove page discarded while it was being stored"
            );
        }
    }

    /// Remove a finished entry and release its capacity.
    fn complete(&self, session_id: &SessionId, seq: u64) {
        {
            let mut guard = self.lock();
            let state = &mut *guard;
            if let Some(queue) = state.sessions.get_mut(session_id) {
                if let Some(pos) = queue.entries.iter().position(|e| e.seq == seq) {
                    queue.entries.remove(pos);
                    state.queued = state.queued.saturating_sub(1);
                }
            }
        }
        self.settled.notify_all();
    }

    fn lookup(&self, session_id: &SessionId, id: PageId) -> Lookup {
        self.lock()
            .sessions
            .get(session_id)
            .map_or(Lookup::Unknown, |queue| queue.lookup(id))
    }

    /// Make way for a synchronous add of `id`: wait until the removal of a
    /// discarded version finished, then drop queued versions.
    fn before_sync_add(&self, session_id: &SessionId, id: PageId) {
        let guard = self.lock();
        let mut guard = self
            .settled
            .wait_while(guard, |state| {
                state
                    .sessions
                    .get(session_id)
                    .is_some_and(|queue| queue.undoing(id))
            })
            .unwrap_or_else(|e| e.into_inner());
        let state = &mut *guard;
        if let Some(queue) = state.sessions.get_mut(session_id) {
            let dropped = queue.supersede(id);
            state.queued = state.queued.saturating_sub(dropped);
        }
    }

    fn cancel(&self, session_id: &SessionId, matches: impl Fn(&PendingAdd) -> bool) {
        let mut guard = self.lock();
        let state = &mut *guard;
        if let Some(queue) = state.sessions.get_mut(session_id) {
            let dropped = queue.cancel(matches);
            state.queued = state.queued.saturating_sub(dropped);
            Counters::bump(&self.counters.cancelled, dropped as u64);
        }
    }
}

/// Call into the wrapped store, turning a panic into an error.
fn guarded(
    operation: &'static str,
    session_id: &SessionId,
    page_id: PageId,
    call: impl FnOnce() -> Result<()>,
) -> Result<()> {
    catch_unwind(AssertUnwindSafe(call)).unwrap_or_else(|payload| {
        Err(StoreError::Panicked {
            operation,
            session_id: session_id.to_string(),
            page_id,
            reason: panic_message(payload.as_ref()),
        }
        .into())
    })
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "<non-string panic payload>".to_string()
    }
}

// ---------------------------------------------------------------------------
// Stats
// ---------------------------------------------------------------------------

/// Point-in-time view of an [`AsyncPageStore`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AsyncStoreStats {
    /// Maximum number of queued pages across all sessions.
    pub capacity: usize,
    /// Pages currently queued, including those being stored.
    pub queued: usize,
    /// Sessions with a queue (and a worker).
    pub active_sessions: usize,
    /// Pages stored by workers.
    pub stored: u64,
    /// Pages a worker failed to store.
    pub failed: u64,
    /// Queued pages discarded by `remove_page`/`remove_all_pages`.
    pub cancelled: u64,
    /// Adds stored synchronously because the queue was full or shut down.
    pub sync_fallbacks: u64,
    /// Adds stored synchronously because the inner store refused async work.
    pub sync_direct: u64,
}

// ---------------------------------------------------------------------------
// AsyncPageStore
// ---------------------------------------------------------------------------

/// Stores added pages on per-session background workers.
pub struct AsyncPageStore {
    delegate: DelegatingPageStore,
    shared: Arc<Shared>,
}

impl std::fmt::Debug for AsyncPageStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncPageStore")
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

impl AsyncPageStore {
    /// Wrap `inner`, queueing at most `capacity` pages across all sessions.
    #[must_use]
    pub fn new(inner: Arc<dyn PageStore>, capacity: usize) -> Self {
        Self::with_worker_prefix(inner, capacity, DEFAULT_WORKER_PREFIX)
    }

    /// Like [`AsyncPageStore::new`], naming worker threads `<prefix>-<session>`.
    #[must_use]
    pub fn with_worker_prefix(
        inner: Arc<dyn PageStore>,
        capacity: usize,
        prefix: impl Into<String>,
    ) -> Self {
        let shared = Arc::new(Shared {
            inner: Arc::clone(&inner),
            capacity,
            worker_prefix: prefix.into(),
            state: Mutex::new(QueueState {
                accepting: true,
                queued: 0,
                next_seq: 0,
                sessions: HashMap::new(),
            }),
            settled: Condvar::new(),
            counters: Counters::default(),
        });
        Self {
            delegate: DelegatingPageStore::new(inner),
            shared,
        }
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    /// Whether a page of the session is still waiting to be stored.
    #[must_use]
    pub fn is_pending(&self, session_id: &SessionId, id: PageId) -> bool {
        matches!(self.shared.lookup(session_id, id), Lookup::Pending(_))
    }

    #[must_use]
    pub fn stats(&self) -> AsyncStoreStats {
        let (queued, active_sessions) = {
            let state = self.shared.lock();
            (state.queued, state.sessions.len())
        };
        let counters = &self.shared.counters;
        AsyncStoreStats {
            capacity: self.shared.capacity,
            queued,
            active_sessions,
            stored: counters.stored.load(Ordering::Relaxed),
            failed: counters.failed.load(Ordering::Relaxed),
            cancelled: counters.cancelled.load(Ordering::Relaxed),
            sync_fallbacks: counters.sync_fallbacks.load(Ordering::Relaxed),
            sync_direct: counters.sync_direct.load(Ordering::Relaxed),
        }
    }

    fn add_directly(&self, context: &dyn PageContext, page: PageRef) -> Result<()> {
        Counters::bump(&self.shared.counters.sync_direct, 1);
        if let Ok(session_id) = context.session_id() {
            self.shared.before_sync_add(&session_id, page.page_id());
        }
        self.delegate.add_page(context, page)
    }
}

impl PageStore for AsyncPageStore {
    fn can_be_asynchronous(&self, context: &dyn PageContext) -> bool {
        self.delegate.can_be_asynchronous(context)
    }

    fn add_page(&self, context: &dyn PageContext, page: PageRef) -> Result<()> {
        let capturing = CapturingContext::new(context);
        if !self.shared.inner.can_be_asynchronous(&capturing) {
            trace!(page_id = page.page_id(), "inner store refused asynchronous add");
            return self.add_directly(context, page);
        }

        let session_id = match capturing.session_id() {
            Ok(id) => id,
            Err(err) => {
                debug!(page_id = page.page_id(), error = %err, "no session for asynchronous add");
                return self.add_directly(context, page);
            }
        };
        let async_context = Arc::new(capturing.into_async()?);

        let page_id = page.page_id();
        match self.shared.enqueue(&session_id, page, async_context) {
            Enqueued::Queued => {
                trace!(session_id = %session_id, page_id, "queued page for asynchronous store");
                Ok(())
            }
            Enqueued::Replaced => {
                trace!(session_id = %session_id, page_id, "replaced queued page");
                Ok(())
            }
            Enqueued::Rejected(page) => {
                debug!(
                    session_id = %session_id,
                    page_id,
                    capacity = self.shared.capacity,
                    "asynchronous queue unavailable, storing synchronously"
                );
                Counters::bump(&self.shared.counters.sync_fallbacks, 1);
                self.shared.before_sync_add(&session_id, page_id);
                self.delegate.add_page(context, page)
            }
        }
    }

    fn get_page(&self, context: &dyn PageContext, id: PageId) -> Result<Option<PageRef>> {
        if let Ok(session_id) = context.session_id() {
            match self.shared.lookup(&session_id, id) {
                Lookup::Pending(page) => {
                    trace!(session_id = %session_id, page_id = id, "returning queued page");
                    return Ok(Some(page));
                }
                Lookup::Discarded => return Ok(None),
                Lookup::Unknown => {}
            }
        }
        self.delegate.get_page(context, id)
    }

    fn remove_page(&self, context: &dyn PageContext, page: &PageRef) -> Result<()> {
        if let Ok(session_id) = context.session_id() {
            let id = page.page_id();
            self.shared.cancel(&session_id, |e| e.is(id));
        }
        self.delegate.remove_page(context, page)
    }

    fn remove_all_pages(&self, context: &dyn PageContext) -> Result<()> {
        if let Ok(session_id) = context.session_id() {
            self.shared.cancel(&session_id, |_| true);
        }
        self.delegate.remove_all_pages(context)
    }

    fn detach(&self, context: &dyn PageContext) -> Result<()> {
        // queued work outlives the request
        self.delegate.detach(context)
    }

    fn destroy(&self) {
        let (workers, queued) = {
            let mut state = self.shared.lock();
            if !state.accepting {
                return;
            }
            state.accepting = false;
            let workers: Vec<(SessionId, JoinHandle<()>)> = state
                .sessions
                .iter_mut()
                .filter_map(|(id, queue)| queue.worker.take().map(|h| (id.clone(), h)))
                .collect();
            (workers, state.queued)
        };

        info!(
            workers = workers.len(),
            queued,
            "draining asynchronous page store"
        );
        for (session_id, handle) in workers {
            if handle.join().is_err() {
                error!(
                    session_id = %session_id,
                    "page store worker terminated abnormally, finishing its queue"
                );
                self.shared.run_worker(&session_id);
            }
        }

        let stats = self.stats();
        info!(
            stored = stats.stored,
            failed = stats.failed,
            cancelled = stats.cancelled,
            sync_fallbacks = stats.sync_fallbacks,
            "asynchronous page store drained"
        );
        self.delegate.destroy();
    }

    fn delegate(&self) -> Option<&dyn PageStore> {
        self.delegate.delegate()
    }

    fn as_async(&self) -> Option<&AsyncPageStore> {
        Some(self)
    }
}
