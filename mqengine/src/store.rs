//! The durable-store seam.
//!
//! The engine only needs record create/update/delete plus a commit that can
//! complete asynchronously. [`MemoryStore`] is the in-process implementation
//! used by default and by the tests; its [`CommitMode`] decides whether an
//! async commit completes synchronously, before `async_commit` returns, or
//! only when [`MemoryStore::complete_pending`] is called.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use crate::async_data::AsyncData;
use crate::error::{EngineError, Result};
use crate::types::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RecordType {
    ClientState,
    Queue,
    Subscription,
    Transaction,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RecordId(pub u64);

/// Record state values written by the engine
pub mod state {
    pub const NONE: u64 = 0;
    pub const IN_FLIGHT: u64 = 1;
    pub const PREPARED: u64 = 2;
    pub const COMMITTED: u64 = 3;
    pub const ROLLED_BACK: u64 = 4;
    pub const HEURISTIC_COMMIT: u64 = 5;
    pub const HEURISTIC_ROLLBACK: u64 = 6;
    pub const ZOMBIE: u64 = 7;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreEvent {
    CallbacksStopped,
}

pub type StoreEventCallback = Box<dyn Fn(StoreEvent) + Send + Sync>;

/// Outcome of [`Store::async_commit`]
#[must_use]
pub enum Committed {
    /// Durable already, the stack is handed back unrun
    Now(AsyncData),
    /// The stack will be resumed once the commit is durable
    Later,
}

pub trait Store: Send + Sync {
    fn create_record(&self, rtype: RecordType, data: Bytes, state: u64) -> Result<RecordId>;

    fn update_record(&self, id: RecordId, state: u64) -> Result<()>;

    fn delete_record(&self, id: RecordId) -> Result<()>;

    fn commit(&self) -> Result<()>;

    fn async_commit(&self, data: AsyncData) -> Result<Committed>;

    fn register_event_callback(&self, cb: StoreEventCallback);

    fn stop_callbacks(&self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitMode {
    Sync,
    /// The continuation stack runs before `async_commit` returns
    Inline,
    /// Continuations wait for `complete_pending`
    Deferred,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredRecord {
    pub rtype: RecordType,
    pub data: Bytes,
    pub state: u64,
}

pub struct MemoryStore {
    mode: RwLock<CommitMode>,
    next_id: AtomicU64,
    records: Mutex<HashMap<RecordId, StoredRecord>>,
    pending: Mutex<Vec<AsyncData>>,
    fail_next: Mutex<Option<EngineError>>,
    commits: AtomicU64,
    events: RwLock<Vec<StoreEventCallback>>,
    stopped: AtomicBool,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(CommitMode::Sync)
    }
}

impl MemoryStore {
    pub fn new(mode: CommitMode) -> Self {
        Self {
            mode: RwLock::new(mode),
            next_id: AtomicU64::new(1),
            records: Mutex::new(HashMap::default()),
            pending: Mutex::new(Vec::new()),
            fail_next: Mutex::new(None),
            commits: AtomicU64::new(0),
            events: RwLock::new(Vec::new()),
            stopped: AtomicBool::new(false),
        }
    }

    #[inline]
    pub fn set_mode(&self, mode: CommitMode) {
        *self.mode.write() = mode;
    }

    #[inline]
    pub fn mode(&self) -> CommitMode {
        *self.mode.read()
    }

    /// The next commit, sync or async, fails with `err`
    #[inline]
    pub fn fail_next_commit(&self, err: EngineError) {
        *self.fail_next.lock() = Some(err);
    }

    /// Resume every parked continuation stack, returns how many were resumed
    pub fn complete_pending(&self) -> usize {
        let pending = std::mem::take(&mut *self.pending.lock());
        let n = pending.len();
        for data in pending {
            data.resume(Ok(()));
        }
        n
    }

    #[inline]
    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    #[inline]
    pub fn commit_count(&self) -> u64 {
        self.commits.load(Ordering::SeqCst)
    }

    pub fn record_count(&self, rtype: RecordType) -> usize {
        self.records.lock().values().filter(|r| r.rtype == rtype).count()
    }

    #[inline]
    pub fn get_record(&self, id: RecordId) -> Option<StoredRecord> {
        self.records.lock().get(&id).cloned()
    }

    fn take_failure(&self) -> Result<()> {
        match self.fail_next.lock().take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn raise(&self, ev: StoreEvent) {
        for cb in self.events.read().iter() {
            cb(ev);
        }
    }
}

impl Store for MemoryStore {
    fn create_record(&self, rtype: RecordType, data: Bytes, state: u64) -> Result<RecordId> {
        let id = RecordId(self.next_id.fetch_add(1, Ordering::SeqCst));
        self.records.lock().insert(id, StoredRecord { rtype, data, state });
        Ok(id)
    }

    fn update_record(&self, id: RecordId, state: u64) -> Result<()> {
        match self.records.lock().get_mut(&id) {
            Some(r) => {
                r.state = state;
                Ok(())
            }
            None => Err(EngineError::Store(format!("record {} not found", id.0))),
        }
    }

    fn delete_record(&self, id: RecordId) -> Result<()> {
        match self.records.lock().remove(&id) {
            Some(_) => Ok(()),
            None => Err(EngineError::Store(format!("record {} not found", id.0))),
        }
    }

    fn commit(&self) -> Result<()> {
        self.take_failure()?;
        self.commits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn async_commit(&self, data: AsyncData) -> Result<Committed> {
        self.take_failure()?;
        self.commits.fetch_add(1, Ordering::SeqCst);
        if self.stopped.load(Ordering::SeqCst) {
            return Ok(Committed::Now(data));
        }
        match self.mode() {
            CommitMode::Sync => Ok(Committed::Now(data)),
            CommitMode::Inline => {
                data.resume(Ok(()));
                Ok(Committed::Later)
            }
            CommitMode::Deferred => {
                self.pending.lock().push(data);
                Ok(Committed::Later)
            }
        }
    }

    fn register_event_callback(&self, cb: StoreEventCallback) {
        self.events.write().push(cb);
    }

    /// Parked continuations are flushed and later commits complete synchronously
    fn stop_callbacks(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        let flushed = self.complete_pending();
        log::info!("store callbacks stopped, {} pending completions flushed", flushed);
        self.raise(StoreEvent::CallbacksStopped);
    }
}
