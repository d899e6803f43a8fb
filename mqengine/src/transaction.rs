//! Local and global (two-phase) transactions.
//!
//! Operations performed under a transaction append [`SoftLogEntry`]s; commit
//! replays them in order, rollback undoes them in reverse. A transaction is
//! committed or rolled back at most once, guarded by its completion stage.
//!
//! Global transactions live in [`TransactionControl`], keyed by XID, and are
//! bound to at most one session at a time. Ended transactions are bound to
//! the client state instead. A heuristically completed transaction keeps an
//! extra reference until it is forgotten.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::sync::{Arc, Weak};

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::json;

use crate::async_data::{Completion, CompletionCallback, PendingCompletion};
use crate::client::ClientState;
use crate::context::EngineContext;
use crate::error::{EngineError, Result};
use crate::refcount::{Release, UseCount};
use crate::session::{Session, SessionOptions};
use crate::stats::Stats;
use crate::store::{state, RecordId, RecordType};
use crate::types::{HashMap, ObjectId};

pub type TransactionHandle = Arc<Transaction>;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct Xid {
    pub format_id: i32,
    pub gtrid: Bytes,
    pub bqual: Bytes,
}

impl Xid {
    pub fn new(format_id: i32, gtrid: impl Into<Bytes>, bqual: impl Into<Bytes>) -> Self {
        Self { format_id, gtrid: gtrid.into(), bqual: bqual.into() }
    }

    fn to_bytes(&self) -> Bytes {
        Bytes::from(json!({"format_id": self.format_id, "gtrid": self.gtrid.to_vec(), "bqual": self.bqual.to_vec()}).to_string())
    }
}

impl fmt::Display for Xid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:", self.format_id)?;
        for b in self.gtrid.iter() {
            write!(f, "{:02x}", b)?;
        }
        write!(f, ":")?;
        for b in self.bqual.iter() {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateGlobal {
    /// Join the transaction if it exists, create it otherwise
    Default,
    /// TMNOFLAGS, the XID must be new
    NoFlags,
    /// TMRESUME, the XID must have been suspended by this client
    Resume,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndFlag {
    Success,
    /// TMFAIL, the transaction can only roll back
    Fail,
    /// TMSUSPEND, resumable by the same client
    Suspend,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeuristicOutcome {
    Commit,
    Rollback,
}

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct XaScan: u32 {
        const START = 0x0100_0000;
        const END = 0x0080_0000;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TranState {
    InFlight,
    Prepared,
    /// Committing, waiting for the store
    CommitOnly,
    HeuristicCommit,
    HeuristicRollback,
    Committed,
    RolledBack,
}

impl TranState {
    #[inline]
    pub fn is_heuristic(&self) -> bool {
        matches!(self, TranState::HeuristicCommit | TranState::HeuristicRollback)
    }

    fn store_state(&self) -> u64 {
        match self {
            TranState::InFlight => state::IN_FLIGHT,
            TranState::Prepared => state::PREPARED,
            TranState::CommitOnly | TranState::Committed => state::COMMITTED,
            TranState::RolledBack => state::ROLLED_BACK,
            TranState::HeuristicCommit => state::HEURISTIC_COMMIT,
            TranState::HeuristicRollback => state::HEURISTIC_ROLLBACK,
        }
    }
}

const STAGE_NONE: u8 = 0;
const STAGE_STARTED: u8 = 1;
const STAGE_ENDED: u8 = 2;

/// An undo/redo record appended by an operation performed under a transaction.
pub trait SoftLogEntry: Send {
    fn describe(&self) -> String;

    /// Whether commit needs a durable store write
    fn is_persistent(&self) -> bool {
        false
    }

    fn commit(self: Box<Self>);

    fn rollback(self: Box<Self>);
}

struct TranInner {
    state: TranState,
    rollback_only: bool,
    suspended: bool,
    persistent: bool,
    soft_log: Vec<Box<dyn SoftLogEntry>>,
    session: Option<(ObjectId, Weak<Session>)>,
    client: Option<Weak<ClientState>>,
    store_id: Option<RecordId>,
}

pub struct Transaction {
    id: ObjectId,
    xid: Option<Xid>,
    use_count: UseCount,
    stage: AtomicU8,
    /// One plus the number of transactional operations still in progress
    pre_resolve: AtomicU32,
    inner: Mutex<TranInner>,
    stats: Arc<Stats>,
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.xid {
            Some(xid) => write!(f, "Transaction {{ id: {}, xid: {} }}", self.id, xid),
            None => write!(f, "Transaction {{ id: {} }}", self.id),
        }
    }
}

impl Transaction {
    fn new(ctx: &EngineContext, xid: Option<Xid>, session: &Arc<Session>) -> TransactionHandle {
        Arc::new(Transaction {
            id: ctx.next_id(),
            xid,
            use_count: UseCount::new(1),
            stage: AtomicU8::new(STAGE_NONE),
            pre_resolve: AtomicU32::new(1),
            inner: Mutex::new(TranInner {
                state: TranState::InFlight,
                rollback_only: false,
                suspended: false,
                persistent: false,
                soft_log: Vec::new(),
                session: Some((session.id(), Arc::downgrade(session))),
                client: None,
                store_id: None,
            }),
            stats: ctx.stats.clone(),
        })
    }

    #[inline]
    pub fn id(&self) -> ObjectId {
        self.id
    }

    #[inline]
    pub fn xid(&self) -> Option<&Xid> {
        self.xid.as_ref()
    }

    #[inline]
    pub fn is_global(&self) -> bool {
        self.xid.is_some()
    }

    #[inline]
    pub fn state(&self) -> TranState {
        self.inner.lock().state
    }

    #[inline]
    pub fn is_rollback_only(&self) -> bool {
        self.inner.lock().rollback_only
    }

    #[inline]
    pub fn is_suspended(&self) -> bool {
        self.inner.lock().suspended
    }

    #[inline]
    pub fn is_ended(&self) -> bool {
        self.stage.load(Ordering::SeqCst) == STAGE_ENDED
    }

    #[inline]
    pub fn soft_log_len(&self) -> usize {
        self.inner.lock().soft_log.len()
    }

    #[inline]
    pub fn use_count(&self) -> u32 {
        self.use_count.get()
    }

    pub fn session_id(&self) -> Option<ObjectId> {
        self.inner.lock().session.as_ref().map(|(id, _)| *id)
    }

    pub fn mark_rollback_only(&self) {
        self.inner.lock().rollback_only = true;
    }

    /// Append an entry; if the transaction no longer accepts work the entry
    /// is rolled back at once
    pub fn add_soft_log(&self, entry: Box<dyn SoftLogEntry>) -> Result<()> {
        let refused = {
            let mut inner = self.inner.lock();
            if self.stage.load(Ordering::SeqCst) != STAGE_NONE || inner.state != TranState::InFlight {
                Some(entry)
            } else {
                log::trace!("{:?} soft log += {}", self, entry.describe());
                inner.persistent |= entry.is_persistent();
                inner.soft_log.push(entry);
                None
            }
        };
        match refused {
            Some(entry) => {
                entry.rollback();
                Err(EngineError::InvalidOperation)
            }
            None => Ok(()),
        }
    }

    /// Hold off resolution while a transactional operation is in progress
    pub fn begin_operation(&self) -> Result<()> {
        if self.stage.load(Ordering::SeqCst) != STAGE_NONE {
            return Err(EngineError::InvalidOperation);
        }
        self.pre_resolve.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    pub fn end_operation(&self) {
        let _ = self.pre_resolve.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |c| if c > 1 { Some(c - 1) } else { None });
    }

    fn check_session(inner: &TranInner, session: Option<&Session>) -> Result<()> {
        match (session, &inner.session) {
            (Some(s), Some((sid, _))) if s.id() != *sid => Err(EngineError::TransactionInUse),
            _ => Ok(()),
        }
    }

    fn start_completion(&self) -> Result<()> {
        self.stage
            .compare_exchange(STAGE_NONE, STAGE_STARTED, Ordering::SeqCst, Ordering::SeqCst)
            .map(|_| ())
            .map_err(|_| EngineError::InvalidOperation)
    }

    fn release(&self, ctx: &EngineContext) {
        match self.use_count.release() {
            Release::Held => {}
            Release::Last => {
                if let Some(xid) = &self.xid {
                    let mut global = ctx.transactions.global.write();
                    if global.get(xid).is_some_and(|t| t.id == self.id) {
                        global.remove(xid);
                    }
                }
                self.stats.transactions.dec();
                log::debug!("{:?} freed", self);
            }
            Release::Underflow => {
                ctx.diag.ffdc("transaction_release", false, "transaction use count underflow", self.to_json())
            }
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        let inner = self.inner.lock();
        json!({
            "id": self.id,
            "xid": self.xid.as_ref().map(|x| x.to_string()),
            "state": inner.state,
            "stage": self.stage.load(Ordering::SeqCst),
            "use_count": self.use_count.get(),
            "pre_resolve": self.pre_resolve.load(Ordering::SeqCst),
            "rollback_only": inner.rollback_only,
            "suspended": inner.suspended,
            "persistent": inner.persistent,
            "soft_log": inner.soft_log.iter().map(|e| e.describe()).collect::<Vec<_>>(),
            "session": inner.session.as_ref().map(|(id, _)| *id),
        })
    }
}

#[derive(Default)]
pub struct TransactionControl {
    global: RwLock<HashMap<Xid, TransactionHandle>>,
}

impl TransactionControl {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn global_count(&self) -> usize {
        self.global.read().len()
    }

    /// Look up a global transaction, taking a reference the guard releases
    fn find_global<'a>(
        &self,
        ctx: &'a EngineContext,
        xid: &Xid,
    ) -> Result<scopeguard::ScopeGuard<TransactionHandle, impl FnOnce(TransactionHandle) + 'a>> {
        let tran = self.global.read().get(xid).cloned().ok_or(EngineError::NotFound)?;
        if !tran.use_count.acquire() {
            return Err(EngineError::NotFound);
        }
        Ok(scopeguard::guard(tran, move |t| t.release(ctx)))
    }

    #[inline]
    pub fn lookup(&self, xid: &Xid) -> Option<TransactionHandle> {
        self.global.read().get(xid).cloned()
    }

    pub fn create_local(&self, ctx: &EngineContext, session: &Arc<Session>) -> Result<TransactionHandle> {
        Self::check_transactional(session)?;
        let tran = Transaction::new(ctx, None, session);
        ctx.stats.transactions.inc();
        session.link_transaction(tran.clone());
        log::debug!("{:?} created on session {}", tran, session.id());
        Ok(tran)
    }

    fn check_transactional(session: &Session) -> Result<()> {
        if session.is_destroyed() {
            return Err(EngineError::Destroyed);
        }
        if !session.options().contains(SessionOptions::TRANSACTIONAL) {
            return Err(EngineError::InvalidOperation);
        }
        Ok(())
    }

    pub fn create_global(
        &self,
        ctx: &EngineContext,
        session: &Arc<Session>,
        xid: Xid,
        flag: CreateGlobal,
    ) -> Result<TransactionHandle> {
        Self::check_transactional(session)?;
        if flag == CreateGlobal::Resume {
            return self.resume(session, &xid);
        }
        loop {
            let existing = self.global.read().get(&xid).cloned();
            if let Some(tran) = existing {
                if flag == CreateGlobal::NoFlags {
                    return Err(EngineError::TransactionInUse);
                }
                return self.join(session, tran);
            }

            let tran = Transaction::new(ctx, Some(xid.clone()), session);
            {
                let mut global = self.global.write();
                if global.contains_key(&xid) {
                    continue;
                }
                global.insert(xid.clone(), tran.clone());
            }
            ctx.stats.transactions.inc();

            let stored = ctx
                .store
                .create_record(RecordType::Transaction, xid.to_bytes(), state::IN_FLIGHT)
                .and_then(|id| ctx.store.commit().map(|_| id));
            match stored {
                Ok(id) => tran.inner.lock().store_id = Some(id),
                Err(e) => {
                    tran.inner.lock().session = None;
                    tran.release(ctx);
                    return Err(e);
                }
            }
            session.link_transaction(tran.clone());
            log::debug!("{:?} created on session {}", tran, session.id());
            return Ok(tran);
        }
    }

    fn resume(&self, session: &Arc<Session>, xid: &Xid) -> Result<TransactionHandle> {
        let client = session.client();
        let tran = client.find_transaction(xid).filter(|t| t.is_suspended()).ok_or(EngineError::NotFound)?;
        client.unlink_transaction(tran.id);
        {
            let mut inner = tran.inner.lock();
            inner.suspended = false;
            inner.client = None;
            inner.session = Some((session.id(), Arc::downgrade(session)));
        }
        session.link_transaction(tran.clone());
        log::debug!("{:?} resumed on session {}", tran, session.id());
        Ok(tran)
    }

    fn join(&self, session: &Arc<Session>, tran: TransactionHandle) -> Result<TransactionHandle> {
        let client = session.client();
        let was_client_bound = {
            let mut inner = tran.inner.lock();
            if inner.state != TranState::InFlight || tran.stage.load(Ordering::SeqCst) != STAGE_NONE {
                return Err(EngineError::InvalidOperation);
            }
            if inner.suspended {
                return Err(EngineError::TransactionInUse);
            }
            match &inner.session {
                Some((sid, _)) if *sid == session.id() => return Ok(tran.clone()),
                Some(_) => return Err(EngineError::TransactionInUse),
                None => {}
            }
            let bound_elsewhere = inner
                .client
                .as_ref()
                .and_then(|w| w.upgrade())
                .is_some_and(|c| !Arc::ptr_eq(&c, client));
            if bound_elsewhere {
                return Err(EngineError::TransactionInUse);
            }
            inner.session = Some((session.id(), Arc::downgrade(session)));
            inner.client.take().is_some()
        };
        if was_client_bound {
            client.unlink_transaction(tran.id);
        }
        session.link_transaction(tran.clone());
        log::debug!("{:?} joined by session {}", tran, session.id());
        Ok(tran)
    }

    /// Dissociate a global transaction from the session
    pub fn end(&self, ctx: &EngineContext, session: &Arc<Session>, xid: &Xid, flag: EndFlag) -> Result<()> {
        let tran = self.find_global(ctx, xid)?;
        let client = session.client();
        {
            let mut inner = tran.inner.lock();
            match &inner.session {
                Some((sid, _)) if *sid == session.id() => {}
                _ => return Err(EngineError::InvalidOperation),
            }
            inner.session = None;
            inner.client = Some(Arc::downgrade(client));
            match flag {
                EndFlag::Success => {}
                EndFlag::Fail => inner.rollback_only = true,
                EndFlag::Suspend => inner.suspended = true,
            }
        }
        session.unlink_transaction(tran.id);
        client.link_transaction((*tran).clone());
        log::debug!("{:?} ended, {:?}", *tran, flag);
        Ok(())
    }

    pub fn prepare(
        &self,
        ctx: &EngineContext,
        session: &Arc<Session>,
        xid: &Xid,
        cb: Option<CompletionCallback<()>>,
    ) -> Result<Completion<()>> {
        let tran = self.find_global(ctx, xid)?;
        let (rollback_only, store_id) = {
            let inner = tran.inner.lock();
            if inner.state != TranState::InFlight || inner.suspended {
                return Err(EngineError::InvalidOperation);
            }
            Transaction::check_session(&inner, Some(session.as_ref()))?;
            (inner.rollback_only, inner.store_id)
        };
        if rollback_only {
            self.rollback(ctx, &tran, Some(session.as_ref()))?;
            return Err(EngineError::RolledBack);
        }
        if tran.pre_resolve.load(Ordering::SeqCst) != 1 {
            return Err(EngineError::InvalidOperation);
        }
        tran.inner.lock().state = TranState::Prepared;
        if let Some(id) = store_id {
            if let Err(e) = ctx.store.update_record(id, state::PREPARED) {
                tran.inner.lock().state = TranState::InFlight;
                return Err(e);
            }
        }

        let pending = Arc::new(PendingCompletion::new());
        pending.arm(cb);
        let p = pending.clone();
        let c = ctx.clone();
        let t = (*tran).clone();
        ctx.commit_then("transaction_prepare", move |rc| {
            if let Err(e) = &rc {
                c.diag.ffdc("transaction_prepare", true, &e.to_string(), t.to_json());
            }
            p.complete(rc);
        })?;
        log::debug!("{:?} prepared", *tran);
        pending.settle()
    }

    /// Commit a global transaction by XID, reporting a prior heuristic outcome
    pub fn commit_global(
        &self,
        ctx: &EngineContext,
        session: &Arc<Session>,
        xid: &Xid,
        one_phase: bool,
        cb: Option<CompletionCallback<()>>,
    ) -> Result<Completion<()>> {
        let tran = self.find_global(ctx, xid)?;
        Self::check_heuristic(&tran)?;
        self.commit(ctx, &tran, Some(session.as_ref()), one_phase, cb)
    }

    pub fn rollback_global(&self, ctx: &EngineContext, session: &Arc<Session>, xid: &Xid) -> Result<()> {
        let tran = self.find_global(ctx, xid)?;
        Self::check_heuristic(&tran)?;
        self.rollback(ctx, &tran, Some(session.as_ref()))
    }

    pub fn commit(
        &self,
        ctx: &EngineContext,
        tran: &TransactionHandle,
        session: Option<&Session>,
        one_phase: bool,
        cb: Option<CompletionCallback<()>>,
    ) -> Result<Completion<()>> {
        let rollback_only = {
            let inner = tran.inner.lock();
            let valid = if tran.is_global() {
                match inner.state {
                    TranState::InFlight => one_phase,
                    TranState::Prepared | TranState::HeuristicCommit => true,
                    _ => false,
                }
            } else {
                inner.state == TranState::InFlight
            };
            if !valid {
                return Err(EngineError::InvalidOperation);
            }
            Transaction::check_session(&inner, session)?;
            if tran.pre_resolve.load(Ordering::SeqCst) != 1 {
                return Err(EngineError::InvalidOperation);
            }
            inner.rollback_only && inner.state == TranState::InFlight
        };
        if rollback_only {
            self.rollback(ctx, tran, session)?;
            return Err(EngineError::RolledBack);
        }
        tran.start_completion()?;
        self.unlink(tran);
        self.finish_commit(ctx, tran, cb)
    }

    fn finish_commit(
        &self,
        ctx: &EngineContext,
        tran: &TransactionHandle,
        cb: Option<CompletionCallback<()>>,
    ) -> Result<Completion<()>> {
        let (entries, durable, store_id, heuristic) = {
            let mut inner = tran.inner.lock();
            let heuristic = inner.state.is_heuristic();
            if !heuristic {
                inner.state = TranState::CommitOnly;
            }
            (std::mem::take(&mut inner.soft_log), inner.persistent || inner.store_id.is_some(), inner.store_id, heuristic)
        };

        if !durable {
            Self::commit_entries(ctx, tran, entries);
            return Ok(Completion::Done(()));
        }

        if let (Some(id), false) = (store_id, heuristic) {
            if let Err(e) = ctx.store.delete_record(id) {
                ctx.diag.ffdc("transaction_commit", true, &e.to_string(), tran.to_json());
                return Err(e);
            }
        }
        let pending = Arc::new(PendingCompletion::new());
        pending.arm(cb);
        let p = pending.clone();
        let c = ctx.clone();
        let t = tran.clone();
        let res = ctx.commit_then("transaction_commit", move |rc| match rc {
            Ok(()) => {
                Self::commit_entries(&c, &t, entries);
                p.complete(Ok(()));
            }
            Err(e) => {
                c.diag.ffdc("transaction_commit", true, &e.to_string(), t.to_json());
                p.complete(Err(e));
            }
        });
        if let Err(e) = res {
            ctx.diag.ffdc("transaction_commit", true, &e.to_string(), tran.to_json());
            return Err(e);
        }
        pending.settle()
    }

    fn commit_entries(ctx: &EngineContext, tran: &TransactionHandle, entries: Vec<Box<dyn SoftLogEntry>>) {
        let n = entries.len();
        for entry in entries {
            entry.commit();
        }
        {
            let mut inner = tran.inner.lock();
            if !inner.state.is_heuristic() {
                inner.state = TranState::Committed;
            }
        }
        tran.stage.store(STAGE_ENDED, Ordering::SeqCst);
        log::debug!("{:?} committed, {} soft log entries", tran, n);
        tran.release(ctx);
    }

    /// Roll back synchronously, undoing the soft log in reverse order
    pub fn rollback(&self, ctx: &EngineContext, tran: &TransactionHandle, session: Option<&Session>) -> Result<()> {
        {
            let inner = tran.inner.lock();
            if !matches!(inner.state, TranState::InFlight | TranState::Prepared | TranState::HeuristicRollback) {
                return Err(EngineError::InvalidOperation);
            }
            Transaction::check_session(&inner, session)?;
        }
        tran.start_completion()?;
        self.unlink(tran);
        let (entries, store_id, heuristic) = {
            let mut inner = tran.inner.lock();
            (std::mem::take(&mut inner.soft_log), inner.store_id, inner.state.is_heuristic())
        };
        let n = entries.len();
        for entry in entries.into_iter().rev() {
            entry.rollback();
        }
        if let (Some(id), false) = (store_id, heuristic) {
            if let Err(e) = ctx.store.delete_record(id).and_then(|_| ctx.store.commit()) {
                ctx.diag.ffdc("transaction_rollback", false, &e.to_string(), tran.to_json());
            }
        }
        {
            let mut inner = tran.inner.lock();
            if !heuristic {
                inner.state = TranState::RolledBack;
            }
        }
        tran.stage.store(STAGE_ENDED, Ordering::SeqCst);
        log::debug!("{:?} rolled back, {} soft log entries", tran, n);
        tran.release(ctx);
        Ok(())
    }

    /// Decide a prepared transaction's outcome without the transaction
    /// manager. It is retained until [`forget`](Self::forget).
    pub fn complete(&self, ctx: &EngineContext, xid: &Xid, outcome: HeuristicOutcome) -> Result<()> {
        let tran = self.find_global(ctx, xid)?;
        if !tran.use_count.acquire() {
            return Err(EngineError::NotFound);
        }
        let retention = scopeguard::guard((*tran).clone(), |t| t.release(ctx));
        let store_id = {
            let mut inner = tran.inner.lock();
            if inner.state != TranState::Prepared
                || tran.stage.load(Ordering::SeqCst) != STAGE_NONE
                || tran.pre_resolve.load(Ordering::SeqCst) != 1
            {
                return Err(EngineError::InvalidOperation);
            }
            inner.state = match outcome {
                HeuristicOutcome::Commit => TranState::HeuristicCommit,
                HeuristicOutcome::Rollback => TranState::HeuristicRollback,
            };
            inner.store_id
        };
        if let Some(id) = store_id {
            let next = tran.state().store_state();
            if let Err(e) = ctx.store.update_record(id, next).and_then(|_| ctx.store.commit()) {
                tran.inner.lock().state = TranState::Prepared;
                return Err(e);
            }
        }
        scopeguard::ScopeGuard::into_inner(retention);
        ctx.stats.heuristic_transactions.inc();
        log::info!("{:?} heuristically completed, {:?}", *tran, outcome);
        match outcome {
            HeuristicOutcome::Commit => self.commit(ctx, &tran, None, false, None).map(|_| ()),
            HeuristicOutcome::Rollback => self.rollback(ctx, &tran, None),
        }
    }

    /// Release a heuristically completed transaction; the XID is unknown afterwards
    pub fn forget(
        &self,
        ctx: &EngineContext,
        xid: &Xid,
        cb: Option<CompletionCallback<()>>,
    ) -> Result<Completion<()>> {
        let tran = self.find_global(ctx, xid)?;
        let store_id = {
            let mut inner = tran.inner.lock();
            if !tran.is_ended() || !inner.state.is_heuristic() {
                return Err(EngineError::InvalidOperation);
            }
            inner.state = match inner.state {
                TranState::HeuristicCommit => TranState::Committed,
                _ => TranState::RolledBack,
            };
            inner.store_id.take()
        };
        self.unlink(&tran);
        {
            let mut global = self.global.write();
            if global.get(xid).is_some_and(|t| Arc::ptr_eq(t, &*tran)) {
                global.remove(xid);
            }
        }
        ctx.stats.heuristic_transactions.dec();
        if let Some(id) = store_id {
            if let Err(e) = ctx.store.delete_record(id) {
                ctx.diag.ffdc("transaction_forget", true, &e.to_string(), tran.to_json());
                return Err(e);
            }
        }

        let pending = Arc::new(PendingCompletion::new());
        pending.arm(cb);
        let p = pending.clone();
        let c = ctx.clone();
        let t = (*tran).clone();
        ctx.commit_then("transaction_forget", move |rc| {
            t.release(&c);
            p.complete(rc);
        })?;
        log::info!("{:?} forgotten", *tran);
        pending.settle()
    }

    /// `Err` carrying the heuristic outcome, if there is one
    pub fn check_heuristic(tran: &Transaction) -> Result<()> {
        match tran.state() {
            TranState::HeuristicCommit => Err(EngineError::HeuristicallyCommitted),
            TranState::HeuristicRollback => Err(EngineError::HeuristicallyRolledBack),
            _ => Ok(()),
        }
    }

    /// Return up to `count` XIDs of prepared or heuristically completed
    /// transactions. A scan on one session must not run on two threads at once.
    pub fn xa_recover(&self, session: &Session, count: usize, flags: XaScan) -> Result<Vec<Xid>> {
        let mut scan = session.xa_scan().lock();
        if flags.contains(XaScan::START) {
            let mut xids = self
                .global
                .read()
                .values()
                .filter(|t| matches!(t.state(), TranState::Prepared) || t.state().is_heuristic())
                .filter_map(|t| t.xid.clone())
                .collect::<Vec<_>>();
            xids.sort();
            *scan = Some(VecDeque::from(xids));
        }
        let batch = match scan.as_mut() {
            Some(pending) => {
                let n = count.min(pending.len());
                pending.drain(..n).collect()
            }
            None => return Err(EngineError::InvalidOperation),
        };
        if flags.contains(XaScan::END) {
            *scan = None;
        }
        Ok(batch)
    }

    fn unlink(&self, tran: &TransactionHandle) {
        let (session, client) = {
            let mut inner = tran.inner.lock();
            (inner.session.take(), inner.client.take())
        };
        if let Some(s) = session.and_then(|(_, w)| w.upgrade()) {
            s.unlink_transaction(tran.id);
        }
        if let Some(c) = client.and_then(|w| w.upgrade()) {
            c.unlink_transaction(tran.id);
        }
    }

    /// Session teardown: local transactions roll back, global ones move to the client
    pub(crate) fn free_session_transactions(&self, ctx: &EngineContext, session: &Arc<Session>) {
        for tran in session.take_transactions() {
            if !tran.is_global() {
                tran.inner.lock().session = None;
                if let Err(e) = self.rollback(ctx, &tran, None) {
                    log::debug!("{:?} not rolled back on session teardown, {:?}", tran, e);
                }
                continue;
            }
            let client = session.client();
            {
                let mut inner = tran.inner.lock();
                inner.session = None;
                inner.client = Some(Arc::downgrade(client));
            }
            client.link_transaction(tran);
        }
    }

    /// Client teardown: unprepared transactions roll back, prepared ones
    /// remain for the transaction manager
    pub(crate) fn free_client_transactions(&self, ctx: &EngineContext, client: &ClientState) {
        for tran in client.take_transactions() {
            let in_flight = {
                let mut inner = tran.inner.lock();
                inner.client = None;
                inner.suspended = false;
                inner.state == TranState::InFlight
            };
            if in_flight {
                if let Err(e) = self.rollback(ctx, &tran, None) {
                    log::debug!("{:?} not rolled back on client teardown, {:?}", tran, e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_xid_display_and_order() {
        let a = Xid::new(1, "ab", "c");
        let b = Xid::new(1, "ac", "");
        assert_eq!(a.to_string(), "1:6162:63");
        assert_eq!(b.to_string(), "1:6163:");
        assert!(a < b);
    }

    #[test]
    fn test_heuristic_states() {
        assert!(TranState::HeuristicCommit.is_heuristic());
        assert!(TranState::HeuristicRollback.is_heuristic());
        assert!(!TranState::Prepared.is_heuristic());
        assert_eq!(TranState::CommitOnly.store_state(), TranState::Committed.store_state());
    }

    #[test]
    fn test_xa_scan_flags() {
        let flags = XaScan::START | XaScan::END;
        assert!(flags.contains(XaScan::START));
        assert!(!XaScan::END.contains(XaScan::START));
    }
}
