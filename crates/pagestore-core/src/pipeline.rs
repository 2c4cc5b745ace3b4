//! Assembly of the decorator chain around a persistent store.
//!
//! ```text
//! RequestPageStore ─▶ AsyncPageStore ─▶ inner
//! ```
//!
//! Both layers are optional. The request buffer, when enabled, is always
//! outermost so that a request flushes each page once, at its end.

use std::sync::Arc;

use tracing::info;

use crate::config::PipelineConfig;
use crate::store::asynchronous::DEFAULT_WORKER_PREFIX;
use crate::store::{AsyncPageStore, PageStore, RequestPageStore};

/// Builder for a page-store pipeline.
pub struct PageStorePipeline {
    inner: Arc<dyn PageStore>,
    request_buffer: bool,
    async_capacity: Option<usize>,
    worker_name_prefix: String,
}

impl std::fmt::Debug for PageStorePipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageStorePipeline")
            .field("request_buffer", &self.request_buffer)
            .field("async_capacity", &self.async_capacity)
            .field("worker_name_prefix", &self.worker_name_prefix)
            .finish_non_exhaustive()
    }
}

impl PageStorePipeline {
    /// Start from the store that finally persists pages. No layers are
    /// enabled until requested.
    #[must_use]
    pub fn builder(inner: Arc<dyn PageStore>) -> Self {
        Self {
            inner,
            request_buffer: false,
            async_capacity: None,
            worker_name_prefix: DEFAULT_WORKER_PREFIX.to_string(),
        }
    }

    /// Store pages on per-session workers, queueing at most `capacity`.
    #[must_use]
    pub fn asynchronous(mut self, capacity: usize) -> Self {
        self.async_capacity = Some(capacity);
        self
    }

    #[must_use]
    pub fn worker_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.worker_name_prefix = prefix.into();
        self
    }

    /// Buffer added pages until the end of the request.
    #[must_use]
    pub fn request_buffered(mut self) -> Self {
        self.request_buffer = true;
        self
    }

    /// Apply a [`PipelineConfig`], replacing earlier layer choices.
    #[must_use]
    pub fn from_config(mut self, config: &PipelineConfig) -> Self {
        self.request_buffer = config.request_buffer;
        self.async_capacity = config.asynchronous.then_some(config.async_capacity);
        self.worker_name_prefix.clone_from(&config.worker_name_prefix);
        self
    }

    #[must_use]
    pub fn build(self) -> Arc<dyn PageStore> {
        info!(
            request_buffer = self.request_buffer,
            asynchronous = self.async_capacity.is_some(),
            capacity = self.async_capacity.unwrap_or(0),
            "assembling page store pipeline"
        );

        let mut store = self.inner;
        if let Some(capacity) = self.async_capacity {
            store = Arc::new(AsyncPageStore::with_worker_prefix(
                store,
                capacity,
                self.worker_name_prefix,
            ));
        }
        if self.request_buffer {
            store = Arc::new(RequestPageStore::new(store));
        }
        store
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{MemoryPageContext, SessionId};
    use crate::store::{MemoryPageStore, find_async_store, find_persistent_store};
    use crate::test_support::TestPage;

    fn chain_len(store: &dyn PageStore) -> usize {
        let mut len = 1;
        let mut current = store.delegate();
        while let Some(next) = current {
            len += 1;
            current = next.delegate();
        }
        len
    }

    #[test]
    fn bare_builder_returns_inner_store() {
        let memory: Arc<dyn PageStore> = Arc::new(MemoryPageStore::new());
        let store = PageStorePipeline::builder(memory.clone()).build();
        assert!(Arc::ptr_eq(&store, &memory));
    }

    #[test]
    fn full_pipeline_layers_in_order() {
        let store = PageStorePipeline::builder(Arc::new(MemoryPageStore::asynchronous()))
            .asynchronous(8)
            .request_buffered()
            .build();

        assert_eq!(chain_len(store.as_ref()), 3);
        assert!(store.as_async().is_none());
        let async_store = find_async_store(store.as_ref()).expect("async layer");
        assert_eq!(async_store.capacity(), 8);
        assert!(find_persistent_store(store.as_ref()).is_some());
    }

    #[test]
    fn config_selects_layers() {
        let config = PipelineConfig {
            request_buffer: false,
            asynchronous: true,
            async_capacity: 3,
            worker_name_prefix: "pages".to_string(),
        };
        let store = PageStorePipeline::builder(Arc::new(MemoryPageStore::new()))
            .request_buffered()
            .from_config(&config)
            .build();
        assert_eq!(chain_len(store.as_ref()), 2);
        assert_eq!(store.as_async().map(AsyncPageStore::capacity), Some(3));

        let config = PipelineConfig {
            asynchronous: false,
            ..PipelineConfig::default()
        };
        let store = PageStorePipeline::builder(Arc::new(MemoryPageStore::new()))
            .asynchronous(10)
            .from_config(&config)
            .build();
        assert_eq!(chain_len(store.as_ref()), 2);
        assert!(find_async_store(store.as_ref()).is_none());
    }

    #[test]
    fn pages_reach_inner_store_after_detach() {
        let memory = Arc::new(MemoryPageStore::asynchronous());
        let store = PageStorePipeline::builder(memory.clone())
            .from_config(&PipelineConfig::default())
            .build();
        let ctx = MemoryPageContext::new("s1");

        store.add_page(&ctx, TestPage::stateful(1)).unwrap();
        store.add_page(&ctx, TestPage::stateless(2)).unwrap();
        assert_eq!(memory.page_count(), 0);

        store.detach(&ctx).unwrap();
        let async_store = find_async_store(store.as_ref()).expect("async layer");
        for _ in 0..500 {
            if async_store.stats().queued == 0 {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(10));
        }
        assert_eq!(async_store.stats().stored, 1);
        assert!(memory.contains(&SessionId::new("s1"), 1));
        assert!(!memory.contains(&SessionId::new("s1"), 2));
    }
}
