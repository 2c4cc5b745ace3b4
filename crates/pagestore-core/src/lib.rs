//! pagestore-core: layered page persistence for stateful web sessions
//!
//! Pages are per-session units of UI state that must survive across
//! requests. Persisting a page is slow, yet a later request of the same
//! session may ask for it back before persistence finished. This crate
//! provides the decorator chain that hides that latency.
//!
//! # Architecture
//!
//! ```text
//! request thread
//!      │ add/get/remove
//!      ▼
//! RequestPageStore ── buffers adds, flushes once per page on detach
//!      │
//!      ▼
//! AsyncPageStore ──── queue + worker per session, bounded globally
//!      │                 (synchronous fallback when full)
//!      ▼
//! persistent store ── anything implementing PageStore
//! ```
//!
//! # Modules
//!
//! - `page`: the page abstraction stores operate on
//! - `context`: request/session scopes seen by stores, and the restricted
//!   context used by background workers
//! - `store`: the `PageStore` trait, decorators and reference stores
//! - `pipeline`: builder wiring the decorators together
//! - `config`: TOML configuration
//! - `logging`: `tracing` subscriber setup
//! - `error`: error types
//!
//! # Safety
//!
//! This crate forbids unsafe code.

#![forbid(unsafe_code)]

pub mod config;
pub mod context;
pub mod error;
pub mod logging;
pub mod page;
pub mod pipeline;
pub mod store;

#[cfg(test)]
pub(crate) mod test_support;

pub use config::{Config, PipelineConfig};
pub use context::{
    AsyncPageContext, CapturingContext, DataKey, DataValue, MemoryPageContext, PageContext,
    SessionId,
};
pub use error::{ConfigError, ContextError, Error, PageError, Result, StoreError};
pub use page::{ManageablePage, PageId, PageRef, same_page};
pub use pipeline::PageStorePipeline;
pub use store::{
    AsyncPageStore, AsyncStoreStats, DelegatingPageStore, MemoryPageStore, NoopPageStore,
    PageStore, PersistedPage, PersistentPageStore, RequestPageStore, find_async_store,
    find_persistent_store, unwrap_store,
};
