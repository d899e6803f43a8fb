use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::async_data::AsyncData;
use crate::client::ClientDirectory;
use crate::conf::Settings;
use crate::diag::Diagnostics;
use crate::error::Result;
use crate::executor::Executor;
use crate::namespace::QueueNamespace;
use crate::policy::{AllowAll, Security};
use crate::stats::Stats;
use crate::store::{Committed, MemoryStore, Store};
use crate::topic::{DefaultTopicTree, TopicTree};
use crate::transaction::TransactionControl;
use crate::types::ObjectId;

/// Everything the engine shares, built once and passed by handle.
#[derive(Clone)]
pub struct EngineContext {
    inner: Arc<EngineContextInner>,
}

pub struct EngineContextInner {
    pub settings: Settings,
    pub stats: Arc<Stats>,
    pub diag: Diagnostics,
    pub store: Arc<dyn Store>,
    pub topics: Arc<dyn TopicTree>,
    pub security: Arc<dyn Security>,
    pub namespace: QueueNamespace,
    pub transactions: TransactionControl,
    pub clients: ClientDirectory,
    pub executor: Executor,
    ids: AtomicU64,
}

impl Deref for EngineContext {
    type Target = EngineContextInner;
    #[inline]
    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

impl EngineContext {
    pub fn new(settings: Settings) -> Self {
        Self::with_parts(settings, Arc::new(MemoryStore::default()), Arc::new(DefaultTopicTree::new()), Arc::new(AllowAll))
    }

    pub fn with_parts(
        settings: Settings,
        store: Arc<dyn Store>,
        topics: Arc<dyn TopicTree>,
        security: Arc<dyn Security>,
    ) -> Self {
        Self {
            inner: Arc::new(EngineContextInner {
                settings,
                stats: Arc::new(Stats::new()),
                diag: Diagnostics::new(),
                store,
                topics,
                security,
                namespace: QueueNamespace::new(),
                transactions: TransactionControl::new(),
                clients: ClientDirectory::new(),
                executor: Executor::new(),
                ids: AtomicU64::new(1),
            }),
        }
    }

    #[inline]
    pub fn next_id(&self) -> ObjectId {
        self.ids.fetch_add(1, Ordering::SeqCst)
    }

    /// Make pending store writes durable, then run `f` with the outcome.
    ///
    /// `f` may run before this returns. If the store refuses the commit
    /// outright the error is returned and `f` is dropped unrun.
    pub(crate) fn commit_then<F>(&self, tag: &'static str, f: F) -> Result<()>
    where
        F: FnOnce(Result<()>) + Send + 'static,
    {
        let mut data = AsyncData::new();
        data.push_internal(tag, move |rc, d| {
            f(rc.clone());
            Some((rc, d))
        });
        match self.store.async_commit(data)? {
            Committed::Now(data) => data.resume(Ok(())),
            Committed::Later => {}
        }
        Ok(())
    }
}
