//! Client states and the client-id directory.
//!
//! A client state is created on connect and destroyed on disconnect. A
//! durable client survives its destroy as a zombie: it stays in the
//! directory with no sessions until it is resumed by a reconnect, discarded
//! by a clean start, deleted by the administrator or reaped after its expiry
//! interval.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::ThreadId;
use std::time::Duration;

use bitflags::bitflags;
use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use parking_lot::Mutex;
use serde_json::json;

use crate::async_data::{Completion, CompletionCallback, PendingCompletion};
use crate::context::EngineContext;
use crate::error::{EngineError, Result};
use crate::message::MessageHandle;
use crate::namespace::{CreateMode, NamedQueueHandle, QueueGroup};
use crate::refcount::{Release, UseCount};
use crate::session::{Session, SessionHandle, SessionOptions};
use crate::store::{state, RecordId, RecordType};
use crate::topic::is_valid_topic;
use crate::transaction::{TransactionHandle, Xid};
use crate::types::{ClientId, DashMap, DeliveryId, ObjectId, Properties};
use crate::utils::{timestamp_secs, Timestamp};

pub type ClientHandle = Arc<ClientState>;

/// Invoked on the connected client whose id is about to be taken over
pub type StealCallback = Arc<dyn Fn(&ClientHandle) + Send + Sync>;

const MAX_DELIVERY_ID: DeliveryId = 65535;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ClientOptions: u32 {
        const DURABLE = 0x01;
        /// Take over the id from a connected client instead of being refused
        const CLIENTID_STEAL = 0x02;
        /// Discard any zombie state left under the same id
        const CLEANSTART = 0x04;
        /// On resume keep the durability of the zombie
        const INHERIT_DURABILITY = 0x08;
        /// Only steal from a client of the same user
        const CHECK_USER_STEAL = 0x10;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpState {
    Active,
    Disconnecting,
    Zombie,
}

#[derive(Clone)]
pub struct ClientRequest {
    pub client_id: ClientId,
    pub user_id: Option<String>,
    pub options: ClientOptions,
    pub steal_callback: Option<StealCallback>,
}

impl fmt::Debug for ClientRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ClientRequest {{ client_id: {}, user_id: {:?}, options: {:?} }}", self.client_id, self.user_id, self.options)
    }
}

impl ClientRequest {
    pub fn new(client_id: impl Into<ClientId>, options: ClientOptions) -> Self {
        Self { client_id: client_id.into(), user_id: None, options, steal_callback: None }
    }

    #[inline]
    pub fn user_id(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    #[inline]
    pub fn steal_callback(mut self, cb: StealCallback) -> Self {
        self.steal_callback = Some(cb);
        self
    }
}

#[derive(Debug, Clone)]
pub struct Created {
    pub client: ClientHandle,
    /// An existing zombie was taken over
    pub resumed: bool,
}

pub struct WillMessage {
    pub topic: String,
    pub message: MessageHandle,
    pub delay: Duration,
    /// Seconds, 0 for the message's own expiry
    pub ttl: u32,
}

#[derive(Debug, Default)]
struct DeliveryIds {
    next: DeliveryId,
    in_use: BTreeSet<DeliveryId>,
    exhausted: bool,
}

impl DeliveryIds {
    fn alloc(&mut self, max: usize) -> Option<DeliveryId> {
        if self.in_use.len() >= max.min(MAX_DELIVERY_ID as usize) {
            self.exhausted = true;
            return None;
        }
        loop {
            self.next = if self.next >= MAX_DELIVERY_ID { 1 } else { self.next + 1 };
            if self.in_use.insert(self.next) {
                return Some(self.next);
            }
        }
    }

    /// Returns true if the release ends an exhaustion
    fn release(&mut self, id: DeliveryId, max: usize) -> bool {
        self.in_use.remove(&id);
        if self.exhausted && self.in_use.len() < max {
            self.exhausted = false;
            return true;
        }
        false
    }
}

struct ClientInner {
    op_state: OpState,
    durable: bool,
    sessions: Vec<SessionHandle>,
    transactions: Vec<TransactionHandle>,
    will: Option<WillMessage>,
    unreleased: BTreeSet<DeliveryId>,
    steal_callback: Option<StealCallback>,
    store_id: Option<RecordId>,
    discard: bool,
    owner: Option<ThreadId>,
    expiry_time: Option<Timestamp>,
}

pub struct ClientState {
    id: ObjectId,
    client_id: ClientId,
    user_id: Option<String>,
    ctx: EngineContext,
    use_count: UseCount,
    inner: Mutex<ClientInner>,
    delivery_ids: Mutex<DeliveryIds>,
    /// Set while the state is being changed, the reaper leaves it alone
    suspend_expiry: AtomicBool,
    temp_queues: QueueGroup,
    pending: PendingCompletion<()>,
}

impl fmt::Debug for ClientState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ClientState {{ id: {}, client_id: {} }}", self.id, self.client_id)
    }
}

impl ClientState {
    fn new(ctx: &EngineContext, req: &ClientRequest) -> ClientHandle {
        Arc::new(ClientState {
            id: ctx.next_id(),
            client_id: req.client_id.clone(),
            user_id: req.user_id.clone(),
            ctx: ctx.clone(),
            use_count: UseCount::new(1),
            inner: Mutex::new(ClientInner {
                op_state: OpState::Active,
                durable: req.options.contains(ClientOptions::DURABLE),
                sessions: Vec::new(),
                transactions: Vec::new(),
                will: None,
                unreleased: BTreeSet::new(),
                steal_callback: req.steal_callback.clone(),
                store_id: None,
                discard: false,
                owner: None,
                expiry_time: None,
            }),
            delivery_ids: Mutex::new(DeliveryIds::default()),
            suspend_expiry: AtomicBool::new(false),
            temp_queues: QueueGroup::new(),
            pending: PendingCompletion::new(),
        })
    }

    /// Connect a client, resuming a zombie or stealing the id where the
    /// options allow. A durable connect completes once its record is durable.
    pub fn create(
        ctx: &EngineContext,
        req: ClientRequest,
        cb: Option<CompletionCallback<Created>>,
    ) -> Result<Completion<Created>> {
        if req.client_id.is_empty() {
            return Err(EngineError::ClientIdRequired);
        }
        let pending = Arc::new(PendingCompletion::new());
        pending.arm(cb);
        Self::create_step(ctx.clone(), req, pending.clone());
        pending.settle()
    }

    fn create_step(ctx: EngineContext, req: ClientRequest, pending: Arc<PendingCompletion<Created>>) {
        loop {
            let existing = match ctx.clients.get(&req.client_id) {
                Some(existing) => existing,
                None => {
                    let client = ClientState::new(&ctx, &req);
                    if ctx.clients.try_insert(client.clone()).is_err() {
                        continue;
                    }
                    ctx.stats.client_states.inc();
                    log::debug!("{:?} created, options: {:?}", client, req.options);
                    Self::persist_then(client, false, pending);
                    return;
                }
            };

            match existing.op_state() {
                OpState::Zombie if req.options.contains(ClientOptions::CLEANSTART) => {
                    if let Err(e) = existing.discard_zombie() {
                        log::debug!("{:?} clean start raced, {:?}", existing, e);
                    }
                }
                OpState::Zombie => {
                    if existing.resume(&req).is_ok() {
                        log::debug!("{:?} resumed", existing);
                        Self::persist_then(existing, true, pending);
                        return;
                    }
                }
                OpState::Active => {
                    if !req.options.contains(ClientOptions::CLIENTID_STEAL)
                        || (req.options.contains(ClientOptions::CHECK_USER_STEAL)
                            && existing.user_id() != req.user_id.as_deref())
                    {
                        pending.complete(Err(EngineError::ClientIdInUse));
                        return;
                    }
                    log::info!("{:?} client id stolen", existing);
                    let steal = existing.inner.lock().steal_callback.clone();
                    if let Some(steal) = steal {
                        steal(&existing);
                    }
                    let next = {
                        let (ctx, req, pending) = (ctx.clone(), req.clone(), pending.clone());
                        move |res: Result<()>| {
                            if let Err(e) = res {
                                log::warn!("destroy of stolen client {} failed, {:?}", req.client_id, e);
                            }
                            Self::create_step(ctx, req, pending)
                        }
                    };
                    match existing.destroy(false, Some(Box::new(next))) {
                        Ok(Completion::Done(())) => {}
                        Ok(Completion::Pending) => return,
                        Err(e) => {
                            log::debug!("{:?} steal destroy, {:?}", existing, e);
                            pending.complete(Err(EngineError::ClientIdInUse));
                            return;
                        }
                    }
                }
                OpState::Disconnecting => {
                    pending.complete(Err(EngineError::ClientIdInUse));
                    return;
                }
            }
        }
    }

    fn persist_then(client: ClientHandle, resumed: bool, pending: Arc<PendingCompletion<Created>>) {
        if !client.is_durable() {
            pending.complete(Ok(Created { client, resumed }));
            return;
        }
        let ctx = client.ctx.clone();
        let res = client.write_record(state::NONE).and_then(|_| {
            let (c, p) = (client.clone(), pending.clone());
            ctx.commit_then("client_create", move |rc| p.complete(rc.map(|_| Created { client: c, resumed })))
        });
        if let Err(e) = res {
            log::warn!("{:?} failed to persist, {:?}", client, e);
            client.inner.lock().op_state = OpState::Disconnecting;
            client.remove_and_free();
            pending.complete(Err(e));
        }
    }

    fn resume(&self, req: &ClientRequest) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.op_state != OpState::Zombie {
            return Err(EngineError::ClientIdInUse);
        }
        if !self.use_count.revive(1) {
            drop(inner);
            self.ctx.diag.ffdc("client_resume", false, "zombie client still referenced", self.to_json());
            return Err(EngineError::ClientIdInUse);
        }
        inner.op_state = OpState::Active;
        inner.discard = false;
        inner.owner = None;
        inner.expiry_time = None;
        inner.steal_callback = req.steal_callback.clone();
        if !req.options.contains(ClientOptions::INHERIT_DURABILITY) {
            inner.durable = req.options.contains(ClientOptions::DURABLE);
        }
        self.suspend_expiry.store(false, Ordering::SeqCst);
        self.ctx.stats.zombie_client_states.dec();
        Ok(())
    }

    fn write_record(&self, record_state: u64) -> Result<()> {
        let mut inner = self.inner.lock();
        match inner.store_id {
            Some(id) => self.ctx.store.update_record(id, record_state),
            None => {
                let data = serde_json::to_vec(&json!({"client_id": self.client_id, "user_id": self.user_id}))
                    .map_err(|e| EngineError::Store(e.to_string()))?;
                inner.store_id = Some(self.ctx.store.create_record(RecordType::ClientState, Bytes::from(data), record_state)?);
                Ok(())
            }
        }
    }

    #[inline]
    pub fn id(&self) -> ObjectId {
        self.id
    }

    #[inline]
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    #[inline]
    pub fn user_id(&self) -> Option<&str> {
        self.user_id.as_deref()
    }

    #[inline]
    pub fn ctx(&self) -> &EngineContext {
        &self.ctx
    }

    #[inline]
    pub fn op_state(&self) -> OpState {
        self.inner.lock().op_state
    }

    #[inline]
    pub fn is_durable(&self) -> bool {
        self.inner.lock().durable
    }

    #[inline]
    pub fn session_count(&self) -> usize {
        self.inner.lock().sessions.len()
    }

    #[inline]
    pub fn expiry_time(&self) -> Option<Timestamp> {
        self.inner.lock().expiry_time
    }

    pub fn create_session(self: &Arc<Self>, options: SessionOptions) -> Result<SessionHandle> {
        Session::create(self, options)
    }

    pub fn set_will_message(&self, topic: &str, message: MessageHandle, delay: Duration, ttl: u32) -> Result<()> {
        if !is_valid_topic(topic) {
            return Err(EngineError::DestNotValid(topic.into()));
        }
        let mut inner = self.inner.lock();
        if inner.op_state != OpState::Active {
            return Err(EngineError::Destroyed);
        }
        inner.will = Some(WillMessage { topic: topic.into(), message, delay, ttl });
        Ok(())
    }

    pub fn unset_will_message(&self) -> Result<()> {
        self.inner.lock().will.take().map(|_| ()).ok_or(EngineError::NotFound)
    }

    #[inline]
    pub fn has_will_message(&self) -> bool {
        self.inner.lock().will.is_some()
    }

    pub fn add_unreleased_delivery_id(&self, id: DeliveryId) -> Result<()> {
        if id == 0 {
            return Err(EngineError::ArgNotValid);
        }
        self.inner.lock().unreleased.insert(id);
        Ok(())
    }

    pub fn remove_unreleased_delivery_id(&self, id: DeliveryId) -> Result<()> {
        if self.inner.lock().unreleased.remove(&id) {
            Ok(())
        } else {
            Err(EngineError::NotFound)
        }
    }

    pub fn list_unreleased_delivery_ids(&self) -> Vec<DeliveryId> {
        self.inner.lock().unreleased.iter().copied().collect()
    }

    /// Create a temporary queue owned by this client, destroyed on disconnect
    pub fn create_temporary_queue(&self, name: &str, props: &Properties) -> Result<NamedQueueHandle> {
        if self.op_state() != OpState::Active {
            return Err(EngineError::Destroyed);
        }
        let (nq, _) =
            self.ctx.namespace.create_queue(&self.ctx, name, props, CreateMode::Temporary(self.client_id.clone()))?;
        self.temp_queues.add(nq.clone());
        Ok(nq)
    }

    pub fn destroy_temporary_queue(&self, name: &str) -> Result<()> {
        let nq = self.temp_queues.remove(name)?;
        if let Err(e) = self.ctx.namespace.destroy_queue(&self.ctx, nq.name(), true, false) {
            self.temp_queues.add(nq);
            return Err(e);
        }
        Ok(())
    }

    #[inline]
    pub fn temporary_queue_count(&self) -> usize {
        self.temp_queues.len()
    }

    pub(crate) fn alloc_delivery_id(&self) -> Option<DeliveryId> {
        let max = self.ctx.settings.engine.max_delivery_ids as usize;
        self.delivery_ids.lock().alloc(max)
    }

    pub(crate) fn release_delivery_id(&self, id: DeliveryId) {
        let max = self.ctx.settings.engine.max_delivery_ids as usize;
        if !self.delivery_ids.lock().release(id, max) {
            return;
        }
        log::debug!("{:?} delivery ids available again, restarting delivery", self);
        let sessions = self.inner.lock().sessions.clone();
        for s in sessions {
            s.restart_delivery();
        }
    }

    #[inline]
    pub fn delivery_ids_in_use(&self) -> usize {
        self.delivery_ids.lock().in_use.len()
    }

    #[inline]
    pub(crate) fn acquire(&self) -> bool {
        self.use_count.acquire()
    }

    pub(crate) fn release(self: &Arc<Self>) {
        match self.use_count.release() {
            Release::Held => {}
            Release::Last => self.finish_destroy(),
            Release::Underflow => {
                self.ctx.diag.ffdc("client_release", false, "client use count underflow", self.to_json())
            }
        }
    }

    pub(crate) fn add_session(&self, session: SessionHandle) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.op_state != OpState::Active {
            return Err(EngineError::Destroyed);
        }
        inner.sessions.push(session);
        Ok(())
    }

    pub(crate) fn remove_session(&self, id: ObjectId) {
        self.inner.lock().sessions.retain(|s| s.id() != id);
    }

    pub(crate) fn find_transaction(&self, xid: &Xid) -> Option<TransactionHandle> {
        self.inner.lock().transactions.iter().find(|t| t.xid() == Some(xid)).cloned()
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

    /// Disconnect. A durable client becomes a zombie unless `discard` is set.
    pub fn destroy(self: &Arc<Self>, discard: bool, cb: Option<CompletionCallback<()>>) -> Result<Completion<()>> {
        let (sessions, will) = {
            let mut inner = self.inner.lock();
            if inner.op_state != OpState::Active {
                return Err(EngineError::Destroyed);
            }
            inner.op_state = OpState::Disconnecting;
            inner.discard = discard;
            inner.owner = Some(std::thread::current().id());
            self.suspend_expiry.store(true, Ordering::SeqCst);
            self.pending.arm(cb);
            (inner.sessions.clone(), inner.will.take())
        };
        log::debug!("{:?} destroying, discard: {}", self, discard);

        for s in sessions {
            if let Err(e) = s.destroy(None) {
                log::debug!("{:?} destroying {:?}, {:?}", self, s, e);
            }
        }
        self.ctx.transactions.free_client_transactions(&self.ctx, self);
        if let Err(e) = self.temp_queues.destroy_all(&self.ctx) {
            log::warn!("{:?} temporary queue cleanup incomplete, {:?}", self, e);
        }
        if let Some(will) = will {
            self.publish_will(will);
        }
        self.release();
        self.pending.settle()
    }

    fn publish_will(&self, will: WillMessage) {
        if will.ttl > 0 {
            let _ = will.message.cap_expiry((timestamp_secs() as u32).saturating_add(will.ttl));
        }
        let ctx = self.ctx.clone();
        let client_id = self.client_id.clone();
        let publish = move || match ctx.topics.publish(&ctx, &will.topic, will.message, None) {
            Ok(n) => log::debug!("will message of {} published to {}, {} subscriptions", client_id, will.topic, n),
            Err(e) => log::warn!("will message of {} not published, {:?}", client_id, e),
        };
        if will.delay.is_zero() {
            publish();
        } else {
            self.ctx.executor.schedule_after(will.delay, Box::new(publish));
        }
    }

    fn finish_destroy(self: &Arc<Self>) {
        let (durable, discard, owner) = {
            let inner = self.inner.lock();
            (inner.durable, inner.discard, inner.owner)
        };
        if !durable || discard {
            self.remove_and_free();
            self.pending.complete(Ok(()));
            return;
        }

        let owner = owner.unwrap_or_else(|| std::thread::current().id());
        let client = self.clone();
        let res = self.write_record(state::ZOMBIE).and_then(|_| {
            self.ctx.commit_then("client_zombie", move |rc| {
                let c = client.clone();
                client.ctx.executor.submit_to(owner, Box::new(move || c.complete_zombie(rc)));
            })
        });
        if let Err(e) = res {
            log::warn!("{:?} zombie state not persisted, {:?}", self, e);
            self.complete_zombie(Err(e));
        }
    }

    fn complete_zombie(&self, rc: Result<()>) {
        let expiry = self
            .ctx
            .settings
            .engine
            .client_expiry_interval
            .map(|interval| timestamp_secs() + interval.as_secs() as Timestamp);
        {
            let mut inner = self.inner.lock();
            inner.op_state = OpState::Zombie;
            inner.expiry_time = expiry;
            inner.steal_callback = None;
        }
        self.suspend_expiry.store(false, Ordering::SeqCst);
        self.ctx.stats.zombie_client_states.inc();
        log::debug!("{:?} is now a zombie, expiry: {:?}", self, expiry);
        self.pending.complete(rc);
    }

    fn remove_and_free(&self) {
        let ctx = &self.ctx;
        ctx.clients.remove_if_same(self);
        for sub in ctx.topics.list_subscriptions(&self.client_id) {
            if let Err(e) = ctx.topics.destroy_subscription(ctx, &sub) {
                log::warn!("{:?} failed to destroy {:?}, {:?}", self, sub, e);
            }
        }
        let store_id = {
            let mut inner = self.inner.lock();
            inner.unreleased.clear();
            inner.store_id.take()
        };
        if let Some(id) = store_id {
            if let Err(e) = ctx.store.delete_record(id).and_then(|_| ctx.store.commit()) {
                ctx.diag.ffdc("client_free", false, "failed to delete client record", self.to_json_with(&e));
            }
        }
        ctx.stats.client_states.dec();
        log::debug!("{:?} freed", self);
    }

    /// Remove a zombie outright
    pub(crate) fn discard_zombie(&self) -> Result<()> {
        {
            let mut inner = self.inner.lock();
            if inner.op_state != OpState::Zombie {
                return Err(EngineError::ClientIdInUse);
            }
            inner.op_state = OpState::Disconnecting;
        }
        self.suspend_expiry.store(true, Ordering::SeqCst);
        self.ctx.stats.zombie_client_states.dec();
        self.remove_and_free();
        Ok(())
    }

    fn to_json_with(&self, e: &EngineError) -> serde_json::Value {
        json!({"client": self.to_json(), "error": e.to_string()})
    }

    pub fn to_json(&self) -> serde_json::Value {
        let inner = self.inner.lock();
        json!({
            "id": self.id,
            "client_id": self.client_id,
            "user_id": self.user_id,
            "op_state": format!("{:?}", inner.op_state),
            "durable": inner.durable,
            "sessions": inner.sessions.len(),
            "transactions": inner.transactions.len(),
            "will": inner.will.as_ref().map(|w| w.topic.clone()),
            "unreleased": inner.unreleased.len(),
            "expiry_time": inner.expiry_time,
            "use_count": self.use_count.get(),
            "temporary_queues": self.temp_queues.len(),
        })
    }
}

/// Client states by client id
#[derive(Default)]
pub struct ClientDirectory {
    clients: DashMap<ClientId, ClientHandle>,
}

impl ClientDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn get(&self, client_id: &str) -> Option<ClientHandle> {
        self.clients.get(client_id).map(|c| c.value().clone())
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.clients.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    pub fn zombies(&self) -> Vec<ClientHandle> {
        self.clients.iter().filter(|c| c.op_state() == OpState::Zombie).map(|c| c.value().clone()).collect()
    }

    fn try_insert(&self, client: ClientHandle) -> std::result::Result<(), ClientHandle> {
        match self.clients.entry(client.client_id.clone()) {
            Entry::Occupied(e) => Err(e.get().clone()),
            Entry::Vacant(e) => {
                e.insert(client);
                Ok(())
            }
        }
    }

    fn remove_if_same(&self, client: &ClientState) {
        self.clients.remove_if(&client.client_id, |_, c| std::ptr::eq(Arc::as_ptr(c), client));
    }

    /// Delete a disconnected durable client
    pub fn destroy_disconnected(&self, client_id: &str) -> Result<()> {
        let client = self.get(client_id).ok_or(EngineError::NotFound)?;
        client.discard_zombie()
    }

    /// Remove zombies whose expiry has passed, returns how many were removed
    pub fn reap_expired(&self, now: Timestamp) -> usize {
        let expired = self
            .clients
            .iter()
            .filter(|c| !c.suspend_expiry.load(Ordering::SeqCst))
            .filter(|c| c.op_state() == OpState::Zombie && c.expiry_time().is_some_and(|t| t <= now))
            .map(|c| c.value().clone())
            .collect::<Vec<_>>();
        let mut reaped = 0;
        for client in expired {
            match client.discard_zombie() {
                Ok(()) => {
                    log::info!("{:?} expired", client);
                    reaped += 1;
                }
                Err(e) => log::debug!("{:?} not reaped, {:?}", client, e),
            }
        }
        reaped
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delivery_ids_cycle_and_exhaust() {
        let mut ids = DeliveryIds::default();
        assert_eq!(ids.alloc(2), Some(1));
        assert_eq!(ids.alloc(2), Some(2));
        assert_eq!(ids.alloc(2), None);
        assert!(ids.exhausted);

        assert!(ids.release(1, 2));
        assert!(!ids.release(2, 2));
        assert_eq!(ids.alloc(2), Some(3));
    }

    #[test]
    fn test_delivery_ids_wrap_skipping_in_use() {
        let mut ids = DeliveryIds { next: MAX_DELIVERY_ID - 1, ..Default::default() };
        ids.in_use.insert(1);
        assert_eq!(ids.alloc(10), Some(MAX_DELIVERY_ID));
        assert_eq!(ids.alloc(10), Some(2));
    }

    #[test]
    fn test_request_builder() {
        let req = ClientRequest::new("c1", ClientOptions::DURABLE).user_id("u1");
        assert_eq!(req.client_id, "c1");
        assert_eq!(req.user_id.as_deref(), Some("u1"));
        assert!(req.steal_callback.is_none());
        assert!(format!("{:?}", req).contains("DURABLE"));
    }
}
