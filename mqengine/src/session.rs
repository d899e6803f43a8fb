//! Sessions: the unit of delivery control.
//!
//! Delivery is started and stopped per session. A stop completes once every
//! consumer waiter enabled for the session has reported itself disabled,
//! counted by `active_callbacks`. Stops requested by the engine, because the
//! client ran out of delivery ids, are remembered separately from the
//! client's own start/stop so that a restart by the engine never overrides a
//! client stop.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use bitflags::bitflags;
use parking_lot::Mutex;
use serde_json::json;

use crate::async_data::{Completion, CompletionCallback, PendingCompletion};
use crate::client::ClientState;
use crate::consumer::{
    confirm_delivery, confirm_delivery_batch, AckOption, Consumer, ConsumerHandle, ConsumerTarget, DeliveryHandle,
    MessageCallback,
};
use crate::context::EngineContext;
use crate::error::{EngineError, Result};
use crate::producer::{Producer, ProducerHandle};
use crate::refcount::{Release, UseCount};
use crate::transaction::{TransactionHandle, Xid};
use crate::types::{DestinationType, ObjectId, Origin};

pub type SessionHandle = Arc<Session>;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct SessionOptions: u32 {
        /// Consumers browse rather than receive; no producers or transactions
        const BROWSE_ONLY = 0x01;
        const TRANSACTIONAL = 0x02;
        /// Only an explicit suspend stops a consumer; the callback's return is ignored
        const EXPLICIT_SUSPEND = 0x04;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryState {
    Stopped,
    Starting,
    Delivering,
    Stopping,
}

struct SessionInner {
    state: DeliveryState,
    /// The client's last request was a start
    client_wants: bool,
    /// Stopped by the engine, awaiting an engine restart
    engine_paused: bool,
    /// An engine stop arrived while starting; applied once the start completes
    engine_stop_deferred: bool,
    producers: Vec<ProducerHandle>,
    consumers: Vec<ConsumerHandle>,
    transactions: Vec<TransactionHandle>,
}

pub struct Session {
    id: ObjectId,
    ctx: EngineContext,
    client: Arc<ClientState>,
    options: SessionOptions,
    use_count: UseCount,
    inner: Mutex<SessionInner>,
    active_callbacks: AtomicU32,
    /// Gate held by acknowledgements in progress; the last release nacks
    /// everything still outstanding on the session's consumers
    pre_nack_all: UseCount,
    destroyed: AtomicBool,
    xa_scan: Mutex<Option<VecDeque<Xid>>>,
    pending: PendingCompletion<()>,
    stop_pending: PendingCompletion<()>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Session {{ id: {}, client: {}, options: {:?} }}", self.id, self.client.client_id(), self.options)
    }
}

impl Session {
    pub(crate) fn create(client: &Arc<ClientState>, options: SessionOptions) -> Result<SessionHandle> {
        if options.contains(SessionOptions::BROWSE_ONLY | SessionOptions::TRANSACTIONAL) {
            return Err(EngineError::InvalidParameter("browse-only sessions cannot be transactional".into()));
        }
        if !client.acquire() {
            return Err(EngineError::Destroyed);
        }
        let ctx = client.ctx().clone();
        let session = Arc::new(Session {
            id: ctx.next_id(),
            ctx,
            client: client.clone(),
            options,
            use_count: UseCount::new(1),
            inner: Mutex::new(SessionInner {
                state: DeliveryState::Stopped,
                client_wants: false,
                engine_paused: false,
                engine_stop_deferred: false,
                producers: Vec::new(),
                consumers: Vec::new(),
                transactions: Vec::new(),
            }),
            active_callbacks: AtomicU32::new(0),
            pre_nack_all: UseCount::new(1),
            destroyed: AtomicBool::new(false),
            xa_scan: Mutex::new(None),
            pending: PendingCompletion::new(),
            stop_pending: PendingCompletion::new(),
        });
        if let Err(e) = client.add_session(session.clone()) {
            client.release();
            return Err(e);
        }
        session.ctx.stats.sessions.inc();
        log::debug!("{:?} created", session);
        Ok(session)
    }

    #[inline]
    pub fn id(&self) -> ObjectId {
        self.id
    }

    #[inline]
    pub fn ctx(&self) -> &EngineContext {
        &self.ctx
    }

    #[inline]
    pub fn client(&self) -> &Arc<ClientState> {
        &self.client
    }

    #[inline]
    pub fn options(&self) -> SessionOptions {
        self.options
    }

    #[inline]
    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    #[inline]
    pub fn delivery_state(&self) -> DeliveryState {
        self.inner.lock().state
    }

    #[inline]
    pub fn is_delivering(&self) -> bool {
        self.delivery_state() == DeliveryState::Delivering
    }

    /// Delivering, or about to be; new waiters are enabled speculatively
    #[inline]
    pub(crate) fn wants_delivery(&self) -> bool {
        matches!(self.delivery_state(), DeliveryState::Starting | DeliveryState::Delivering)
    }

    #[inline]
    pub fn consumer_count(&self) -> usize {
        self.inner.lock().consumers.len()
    }

    #[inline]
    pub fn producer_count(&self) -> usize {
        self.inner.lock().producers.len()
    }

    pub fn create_consumer(
        self: &Arc<Self>,
        target: ConsumerTarget<'_>,
        callback: MessageCallback,
    ) -> Result<ConsumerHandle> {
        if self.is_destroyed() {
            return Err(EngineError::Destroyed);
        }
        Consumer::create(self, target, callback)
    }

    pub fn create_producer(self: &Arc<Self>, dest_type: DestinationType, name: &str) -> Result<ProducerHandle> {
        if self.is_destroyed() {
            return Err(EngineError::Destroyed);
        }
        Producer::create(self, dest_type, name)
    }

    pub fn create_local_transaction(self: &Arc<Self>) -> Result<TransactionHandle> {
        self.ctx.transactions.create_local(&self.ctx, self)
    }

    pub fn confirm(
        self: &Arc<Self>,
        tran: Option<&TransactionHandle>,
        handle: &DeliveryHandle,
        option: AckOption,
    ) -> Result<()> {
        confirm_delivery(self, tran, handle, option)
    }

    pub fn confirm_batch(
        self: &Arc<Self>,
        tran: Option<&TransactionHandle>,
        handles: &[DeliveryHandle],
        option: AckOption,
    ) -> Result<()> {
        confirm_delivery_batch(self, tran, handles, option)
    }

    /// Start delivery to this session's consumers.
    ///
    /// A client start while the engine has delivery paused is recorded and
    /// takes effect when the engine restarts.
    pub fn start(&self, origin: Origin) -> Result<()> {
        let consumers = {
            let mut inner = self.inner.lock();
            if matches!(origin, Origin::Engine) && inner.engine_stop_deferred {
                inner.engine_stop_deferred = false;
                return Ok(());
            }
            if matches!(inner.state, DeliveryState::Starting | DeliveryState::Stopping) {
                return Err(EngineError::RequestInProgress);
            }
            match origin {
                Origin::Engine => {
                    if !inner.engine_paused {
                        return Err(EngineError::NotEngineControlled);
                    }
                    inner.engine_paused = false;
                    if !inner.client_wants {
                        return Ok(());
                    }
                }
                Origin::Client => {
                    inner.client_wants = true;
                    if inner.engine_paused {
                        log::debug!("{:?} start deferred, engine has delivery paused", self);
                        return Ok(());
                    }
                }
            }
            if inner.state == DeliveryState::Delivering {
                return Ok(());
            }
            inner.state = DeliveryState::Starting;
            inner.consumers.clone()
        };

        let enabled = consumers.into_iter().filter(|c| c.enable_waiter()).collect::<Vec<_>>();
        self.finish_start(origin, enabled)
    }

    fn finish_start(&self, origin: Origin, enabled: Vec<ConsumerHandle>) -> Result<()> {
        let deferred_stop = {
            let mut inner = self.inner.lock();
            inner.state = DeliveryState::Delivering;
            std::mem::take(&mut inner.engine_stop_deferred)
        };
        log::debug!("{:?} delivery started by {:?}, {} waiters enabled", self, origin, enabled.len());
        if deferred_stop {
            log::debug!("{:?} applying engine stop requested while starting", self);
            if let Err(e) = self.engine_stop() {
                log::debug!("{:?} engine stop, {:?}", self, e);
            }
            return Ok(());
        }
        for c in enabled {
            c.queue().check_waiters();
        }
        Ok(())
    }

    /// Stop delivery. Completes once no consumer callback can run any more.
    pub fn stop(&self, origin: Origin, cb: Option<CompletionCallback<()>>) -> Result<Completion<()>> {
        let consumers = {
            let mut inner = self.inner.lock();
            if matches!(inner.state, DeliveryState::Starting | DeliveryState::Stopping) {
                if matches!(origin, Origin::Engine) && inner.state == DeliveryState::Starting && inner.client_wants {
                    inner.engine_stop_deferred = true;
                }
                return Err(EngineError::RequestInProgress);
            }
            match origin {
                Origin::Engine => {
                    if inner.state != DeliveryState::Delivering || !inner.client_wants {
                        return Err(EngineError::NotEngineControlled);
                    }
                    inner.engine_paused = true;
                }
                Origin::Client => {
                    inner.client_wants = false;
                    inner.engine_paused = false;
                }
            }
            if inner.state == DeliveryState::Stopped {
                return Ok(Completion::Done(()));
            }
            self.stop_pending.arm(cb);
            self.active_callbacks.fetch_add(1, Ordering::SeqCst);
            inner.state = DeliveryState::Stopping;
            inner.consumers.clone()
        };

        for c in consumers {
            match c.disable_waiter() {
                Ok(_) | Err(EngineError::WaiterDisabled) => {}
                Err(e) => log::debug!("{:?} disable waiter of {:?}, {:?}", self, c, e),
            }
        }
        self.end_callback();
        self.stop_pending.settle()
    }

    #[inline]
    pub(crate) fn begin_callback(&self) {
        self.active_callbacks.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn end_callback(&self) {
        let stopped = {
            let mut inner = self.inner.lock();
            let prev = self.active_callbacks.fetch_sub(1, Ordering::SeqCst);
            if prev == 0 {
                self.active_callbacks.store(0, Ordering::SeqCst);
                drop(inner);
                self.ctx.diag.ffdc("session_callback", false, "active callback count underflow", self.to_json());
                return;
            }
            if prev == 1 && inner.state == DeliveryState::Stopping {
                inner.state = DeliveryState::Stopped;
                true
            } else {
                false
            }
        };
        if stopped {
            log::debug!("{:?} delivery stopped", self);
            self.stop_pending.complete(Ok(()));
        }
    }

    /// Pause delivery on the engine's behalf
    pub(crate) fn engine_stop(&self) -> Result<Completion<()>> {
        self.stop(Origin::Engine, None)
    }

    /// Undo an engine pause, retrying later while a start or stop is underway
    pub(crate) fn restart_delivery(self: &Arc<Self>) {
        if self.is_destroyed() {
            return;
        }
        match self.start(Origin::Engine) {
            Ok(()) | Err(EngineError::NotEngineControlled) => {}
            Err(EngineError::RequestInProgress) => {
                let session = self.clone();
                let delay = self.ctx.settings.engine.restart_delivery_delay;
                log::debug!("{:?} restart deferred by {:?}", self, delay);
                self.ctx.executor.schedule_after(delay, Box::new(move || session.restart_delivery()));
            }
            Err(e) => log::warn!("{:?} failed to restart delivery, {:?}", self, e),
        }
    }

    pub fn destroy(self: &Arc<Self>, cb: Option<CompletionCallback<()>>) -> Result<Completion<()>> {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return Err(EngineError::Destroyed);
        }
        self.pending.arm(cb);
        self.ctx.transactions.free_session_transactions(&self.ctx, self);

        let (producers, consumers) = {
            let inner = self.inner.lock();
            (inner.producers.clone(), inner.consumers.clone())
        };
        for p in producers {
            if let Err(e) = p.destroy() {
                log::debug!("{:?} destroying {:?}, {:?}", self, p, e);
            }
        }
        for c in consumers {
            if let Err(e) = c.destroy(None) {
                log::debug!("{:?} destroying {:?}, {:?}", self, c, e);
            }
        }
        self.leave_confirm();
        self.release();
        self.pending.settle()
    }

    #[inline]
    pub(crate) fn acquire(&self) -> bool {
        self.use_count.acquire()
    }

    pub(crate) fn release(&self) {
        match self.use_count.release() {
            Release::Held => {}
            Release::Last => self.teardown(),
            Release::Underflow => {
                self.ctx.diag.ffdc("session_release", false, "session use count underflow", self.to_json())
            }
        }
    }

    fn teardown(&self) {
        *self.xa_scan.lock() = None;
        self.client.remove_session(self.id);
        self.ctx.stats.sessions.dec();
        log::debug!("{:?} freed", self);
        self.pending.complete(Ok(()));
        self.client.release();
    }

    #[inline]
    pub(crate) fn enter_confirm(&self) -> bool {
        self.pre_nack_all.acquire()
    }

    pub(crate) fn leave_confirm(&self) {
        match self.pre_nack_all.release() {
            Release::Held => {}
            Release::Last => {
                let consumers = self.inner.lock().consumers.clone();
                let nacked: usize = consumers.iter().map(|c| c.nack_all()).sum();
                if nacked > 0 {
                    log::debug!("{:?} returned {} unacknowledged messages", self, nacked);
                }
            }
            Release::Underflow => {
                self.ctx.diag.ffdc("session_confirm", false, "acknowledgement gate underflow", self.to_json())
            }
        }
    }

    pub(crate) fn add_consumer(&self, consumer: ConsumerHandle) -> Result<()> {
        if self.is_destroyed() {
            return Err(EngineError::Destroyed);
        }
        self.inner.lock().consumers.push(consumer);
        Ok(())
    }

    pub(crate) fn remove_consumer(&self, id: ObjectId) {
        self.inner.lock().consumers.retain(|c| c.id() != id);
    }

    pub(crate) fn add_producer(&self, producer: ProducerHandle) -> Result<()> {
        if self.is_destroyed() {
            return Err(EngineError::Destroyed);
        }
        self.inner.lock().producers.push(producer);
        Ok(())
    }

    pub(crate) fn remove_producer(&self, id: ObjectId) {
        self.inner.lock().producers.retain(|p| p.id() != id);
    }

    pub(crate) fn link_transaction(&self, tran: TransactionHandle) {
        self.inner.lock().transactions.push(tran);
    }

    pub(crate) fn unlink_transaction(&self, id: ObjectId) {
        self.inner.lock().transactions.retain(|t| t.id() != id);
    }

    pub(crate) fn take_transactions(&self) -> Vec<TransactionHandle> {
        std::mem::take(&mut self.inner.lock().transactions)
    }

    #[inline]
    pub(crate) fn xa_scan(&self) -> &Mutex<Option<VecDeque<Xid>>> {
        &self.xa_scan
    }

    pub fn to_json(&self) -> serde_json::Value {
        let inner = self.inner.lock();
        json!({
            "id": self.id,
            "client": self.client.client_id(),
            "options": self.options.bits(),
            "state": format!("{:?}", inner.state),
            "client_wants": inner.client_wants,
            "engine_paused": inner.engine_paused,
            "engine_stop_deferred": inner.engine_stop_deferred,
            "producers": inner.producers.len(),
            "consumers": inner.consumers.len(),
            "transactions": inner.transactions.len(),
            "active_callbacks": self.active_callbacks.load(Ordering::SeqCst),
            "use_count": self.use_count.get(),
            "destroyed": self.is_destroyed(),
        })
    }
}
