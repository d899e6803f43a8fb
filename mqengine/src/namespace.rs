//! The process-wide name to queue directory.
//!
//! Lookups and opens take the read lock, create and destroy take the write
//! lock. Store I/O for a new queue happens with no lock held; the creator then
//! re-checks under the write lock and discards its queue if it lost a race.

use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use itertools::Itertools;
use parking_lot::{Mutex, RwLock};
use serde_json::json;

use crate::conf::QueueConfig;
use crate::context::EngineContext;
use crate::error::{EngineError, Result};
use crate::policy::PolicyInfo;
use crate::queue::{Queue, QueueHandle, QueueKind};
use crate::refcount::{Release, UseCount};
use crate::store::{state, RecordId, RecordType};
use crate::types::{properties, ClientId, HashMap, Properties};

pub type NamedQueueHandle = Arc<NamedQueue>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenKind {
    Producer,
    Consumer,
}

/// How a queue came to be created
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CreateMode {
    /// First reference from a producer or consumer
    Auto,
    /// Admin object or configuration
    Declared,
    /// Owned by a client and threaded onto its queue group
    Temporary(ClientId),
}

pub struct NamedQueue {
    name: String,
    queue: QueueHandle,
    /// The namespace holds one reference for as long as the entry is present
    use_count: UseCount,
    consumers: AtomicU32,
    producers: AtomicU32,
    creator: Option<ClientId>,
    store_id: Option<RecordId>,
}

impl fmt::Debug for NamedQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "NamedQueue {{ name: {}, use: {}, consumers: {}, producers: {} }}",
            self.name,
            self.use_count.get(),
            self.consumers(),
            self.producers()
        )
    }
}

impl NamedQueue {
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn queue(&self) -> &QueueHandle {
        &self.queue
    }

    #[inline]
    pub fn is_temporary(&self) -> bool {
        self.creator.is_some()
    }

    #[inline]
    pub fn creator(&self) -> Option<&str> {
        self.creator.as_deref()
    }

    #[inline]
    pub fn consumers(&self) -> u32 {
        self.consumers.load(Ordering::SeqCst)
    }

    #[inline]
    pub fn producers(&self) -> u32 {
        self.producers.load(Ordering::SeqCst)
    }

    #[inline]
    pub fn use_count(&self) -> u32 {
        self.use_count.get()
    }

    pub fn to_json(&self) -> serde_json::Value {
        json!({
            "name": self.name,
            "use_count": self.use_count.get(),
            "consumers": self.consumers(),
            "producers": self.producers(),
            "temporary": self.is_temporary(),
            "queue": self.queue.to_json(),
        })
    }
}

#[derive(Default)]
pub struct QueueNamespace {
    table: RwLock<HashMap<String, NamedQueueHandle>>,
}

impl QueueNamespace {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn get(&self, name: &str) -> Option<NamedQueueHandle> {
        self.table.read().get(name).cloned()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.table.read().len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.table.read().is_empty()
    }

    pub fn names(&self) -> Vec<String> {
        self.table.read().keys().cloned().sorted().collect()
    }

    /// Create a queue, or update the policy of the existing one.
    ///
    /// Returns the entry and whether this call created it.
    pub fn create_queue(
        &self,
        ctx: &EngineContext,
        name: &str,
        props: &Properties,
        mode: CreateMode,
    ) -> Result<(NamedQueueHandle, bool)> {
        if name.is_empty() {
            return Err(EngineError::DestNotValid(name.into()));
        }
        loop {
            if let Some(nq) = self.get(name) {
                if matches!(mode, CreateMode::Temporary(_)) || nq.is_temporary() {
                    return Err(EngineError::DestinationInUse);
                }
                if mode == CreateMode::Declared {
                    Self::update_policy(&nq, props)?;
                }
                return Ok((nq, false));
            }

            let policy = PolicyInfo::default_for(name, &ctx.settings);
            if mode != CreateMode::Auto {
                policy.replace(policy.settings().merged(props)?);
            }
            let (kind, creator) = match &mode {
                CreateMode::Temporary(client_id) => (QueueKind::Temporary, Some(client_id.clone())),
                _ => (QueueKind::Named, None),
            };
            let queue = Queue::new(
                &ctx.stats,
                ctx.next_id(),
                name,
                kind,
                policy,
                ctx.settings.engine.multi_consumer_batch_size,
            );
            let store_id = match creator {
                Some(_) => None,
                None => match Self::write_record(ctx, name) {
                    Ok(id) => Some(id),
                    Err(e) => {
                        queue.delete();
                        return Err(e);
                    }
                },
            };
            let nq = Arc::new(NamedQueue {
                name: name.into(),
                queue,
                use_count: UseCount::new(1),
                consumers: AtomicU32::new(0),
                producers: AtomicU32::new(0),
                creator,
                store_id,
            });

            {
                let mut table = self.table.write();
                if !table.contains_key(name) {
                    table.insert(name.into(), nq.clone());
                    log::debug!("created {:?}, mode: {:?}", nq, mode);
                    return Ok((nq, true));
                }
            }

            log::debug!("lost create race for queue {}, discarding speculative queue", name);
            Self::discard(ctx, &nq);
        }
    }

    fn update_policy(nq: &NamedQueue, props: &Properties) -> Result<()> {
        let policy = nq.queue.policy();
        let next = policy.settings().merged(props)?;
        if !next.concurrent_consumers && nq.consumers() > 1 {
            return Err(EngineError::TooManyConsumers);
        }
        policy.replace(next);
        log::debug!("updated policy of {:?}, {:?}", nq, policy.settings());
        Ok(())
    }

    fn write_record(ctx: &EngineContext, name: &str) -> Result<RecordId> {
        let id = ctx.store.create_record(RecordType::Queue, Bytes::from(name.to_owned()), state::NONE)?;
        if let Err(e) = ctx.store.commit() {
            let _ = ctx.store.delete_record(id);
            return Err(e);
        }
        Ok(id)
    }

    fn discard(ctx: &EngineContext, nq: &NamedQueue) {
        nq.queue.delete();
        if let Some(id) = nq.store_id {
            if let Err(e) = ctx.store.delete_record(id).and_then(|_| ctx.store.commit()) {
                ctx.diag.ffdc(
                    "namespace_discard",
                    false,
                    "failed to delete queue record",
                    json!({"queue": nq.name, "error": e.to_string()}),
                );
            }
        }
    }

    /// Bind a producer or consumer, creating the queue on first reference
    /// unless auto-creation is disabled
    pub fn open_queue(
        &self,
        ctx: &EngineContext,
        name: &str,
        kind: OpenKind,
        client_id: &str,
    ) -> Result<NamedQueueHandle> {
        loop {
            {
                let table = self.table.read();
                if let Some(nq) = table.get(name) {
                    Self::bind(nq, kind, client_id)?;
                    if !nq.use_count.acquire() {
                        Self::unbind(nq, kind);
                        return Err(EngineError::Destroyed);
                    }
                    return Ok(nq.clone());
                }
            }
            if ctx.settings.engine.disable_auto_queue_creation {
                return Err(EngineError::DestNotValid(name.into()));
            }
            self.create_queue(ctx, name, &Properties::default(), CreateMode::Auto)?;
        }
    }

    fn bind(nq: &NamedQueue, kind: OpenKind, client_id: &str) -> Result<()> {
        let policy = nq.queue.policy();
        match kind {
            OpenKind::Consumer => {
                if nq.creator.as_deref().is_some_and(|c| c != client_id) {
                    return Err(EngineError::NotAuthorized);
                }
                let concurrent = policy.concurrent_consumers();
                nq.consumers
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |c| {
                        if !concurrent && c >= 1 {
                            None
                        } else {
                            Some(c + 1)
                        }
                    })
                    .map(|_| ())
                    .map_err(|_| EngineError::TooManyConsumers)
            }
            OpenKind::Producer => {
                if !policy.allow_send() {
                    return Err(EngineError::SendNotAllowed);
                }
                nq.producers.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        }
    }

    fn unbind(nq: &NamedQueue, kind: OpenKind) {
        let counter = match kind {
            OpenKind::Consumer => &nq.consumers,
            OpenKind::Producer => &nq.producers,
        };
        let _ = counter.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |c| c.checked_sub(1));
    }

    /// Undo an [`open_queue`](Self::open_queue)
    pub fn release(&self, ctx: &EngineContext, nq: &NamedQueue, kind: OpenKind) {
        Self::unbind(nq, kind);
        match nq.use_count.release() {
            Release::Held => {}
            other => ctx.diag.ffdc(
                "namespace_release",
                false,
                "released the namespace reference of a queue",
                json!({"queue": nq.to_json(), "release": format!("{:?}", other)}),
            ),
        }
    }

    /// Remove a queue that nothing but the namespace references.
    ///
    /// Buffered messages block the delete unless `discard` is set. Temporary
    /// queues cannot be deleted through the admin path.
    pub fn destroy_queue(&self, ctx: &EngineContext, name: &str, discard: bool, admin: bool) -> Result<()> {
        let nq = {
            let mut table = self.table.write();
            let nq = table.get(name).cloned().ok_or(EngineError::NotFound)?;
            if admin && nq.is_temporary() {
                return Err(EngineError::DestTypeNotValid);
            }
            if nq.use_count.get() != 1 {
                return Err(EngineError::DestinationInUse);
            }
            if !discard && nq.queue.buffered() > 0 {
                return Err(EngineError::DestinationNotEmpty);
            }
            table.remove(name);
            nq
        };
        if nq.use_count.release() != Release::Last {
            ctx.diag.ffdc("namespace_destroy", false, "unexpected use count on destroy", nq.to_json());
        }
        nq.queue.delete();
        if let Some(id) = nq.store_id {
            ctx.store.delete_record(id)?;
            ctx.store.commit()?;
        }
        log::debug!("destroyed queue {}, discard: {}", name, discard);
        Ok(())
    }

    /// Bring the namespace in line with the declared queue objects
    pub fn reconcile(&self, ctx: &EngineContext, declared: &BTreeMap<String, QueueConfig>) -> Result<()> {
        let mut first_err = None;
        for (name, cfg) in declared {
            let props = properties(cfg.to_properties());
            if self.get(name).is_none() {
                log::warn!("queue {} is declared in the configuration but missing, creating it", name);
            }
            if let Err(e) = self.create_queue(ctx, name, &props, CreateMode::Declared) {
                log::warn!("failed to reconcile queue {}, {:?}", name, e);
                first_err.get_or_insert(e);
            }
        }
        if ctx.settings.engine.disable_auto_queue_creation {
            let undeclared = self
                .table
                .read()
                .values()
                .filter(|nq| !nq.is_temporary() && !declared.contains_key(nq.name()))
                .map(|nq| nq.name.clone())
                .collect::<Vec<_>>();
            for name in undeclared {
                log::info!("queue {} is not declared in the configuration, deleting it", name);
                if let Err(e) = self.destroy_queue(ctx, &name, true, true) {
                    log::warn!("failed to delete undeclared queue {}, {:?}", name, e);
                    first_err.get_or_insert(e);
                }
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// Temporary queues owned by one client, newest first.
#[derive(Default)]
pub struct QueueGroup {
    queues: Mutex<VecDeque<NamedQueueHandle>>,
}

impl QueueGroup {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn add(&self, nq: NamedQueueHandle) {
        self.queues.lock().push_front(nq);
    }

    pub fn remove(&self, name: &str) -> Result<NamedQueueHandle> {
        let mut queues = self.queues.lock();
        let pos = queues.iter().position(|q| q.name() == name).ok_or(EngineError::NotFound)?;
        queues.remove(pos).ok_or(EngineError::NotFound)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.queues.lock().len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.queues.lock().is_empty()
    }

    /// Destroy every member. Failed members are dropped from the group as
    /// well; the first failure is returned.
    pub fn destroy_all(&self, ctx: &EngineContext) -> Result<()> {
        let members = std::mem::take(&mut *self.queues.lock());
        let mut first_err = None;
        for nq in members {
            if let Err(e) = ctx.namespace.destroy_queue(ctx, nq.name(), true, false) {
                log::warn!("failed to destroy temporary queue {}, {:?}", nq.name(), e);
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
