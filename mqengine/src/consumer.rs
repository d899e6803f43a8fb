//! Consumers, deliveries and acknowledgements.
//!
//! A consumer carries two packed counts (see [`ConsumerCounts`]). The use
//! count covers the create reference plus one per enabled waiter; when it
//! drops to zero the consumer is unregistered and its destroy completes.
//! Memory is only released once outstanding acknowledgements are resolved
//! as well, so a destroyed consumer with unacknowledged messages lingers as
//! a zombie until the last one is consumed or nacked.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde_json::json;

use crate::async_data::{Completion, CompletionCallback, PendingCompletion};
use crate::context::EngineContext;
use crate::error::{EngineError, Result};
use crate::message::{MessageHandle, Reliability};
use crate::namespace::{NamedQueueHandle, OpenKind};
use crate::policy::{Action, ResourceType, SecurityContext};
use crate::queue::QueueHandle;
use crate::refcount::{AckRelease, ConsumerCounts, Release};
use crate::session::{SessionHandle, SessionOptions};
use crate::topic::{SubscriptionHandle, SubscriptionRequest};
use crate::transaction::{SoftLogEntry, TransactionHandle};
use crate::types::{DeliveryId, ObjectId};
use crate::waiter::{Disabled, Enabled, Waiter};

pub type ConsumerHandle = Arc<Consumer>;

/// Message callback; returning `false` asks for delivery to this consumer
/// to be suspended
pub type MessageCallback = Arc<dyn Fn(&ConsumerHandle, Delivery) -> bool + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerTarget<'a> {
    Queue(&'a str),
    /// Non-durable subscription created for the consumer and destroyed with it
    Topic { topic: &'a str, max_reliability: Reliability },
    Subscription(&'a str),
}

pub enum ConsumerDest {
    Queue(NamedQueueHandle),
    Subscription(SubscriptionHandle),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOption {
    Consumed,
    /// First phase of an exactly-once acknowledgement, no state change
    Received,
    NotReceived,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryStatus {
    Started,
    Stopped,
    Suspended,
    Destroyed,
}

/// Identifies one in-flight message for acknowledgement
#[derive(Clone)]
pub struct DeliveryHandle {
    queue: QueueHandle,
    node: u64,
    consumer: ConsumerHandle,
    delivery_id: DeliveryId,
}

impl fmt::Debug for DeliveryHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "DeliveryHandle {{ queue: {}, node: {}, consumer: {}, delivery_id: {} }}",
            self.queue.name(),
            self.node,
            self.consumer.id,
            self.delivery_id
        )
    }
}

impl DeliveryHandle {
    pub(crate) fn new(queue: QueueHandle, node: u64, consumer: ConsumerHandle, delivery_id: DeliveryId) -> Self {
        Self { queue, node, consumer, delivery_id }
    }

    #[inline]
    pub fn delivery_id(&self) -> DeliveryId {
        self.delivery_id
    }

    #[inline]
    pub fn consumer(&self) -> &ConsumerHandle {
        &self.consumer
    }

    fn consume(&self) -> Result<()> {
        let resolved = self.queue.consume(self.node)?;
        self.consumer.ack_resolved(resolved.delivery_id);
        Ok(())
    }

    fn nack(&self) -> Result<()> {
        let resolved = self.queue.nack(self.node)?;
        self.consumer.ack_resolved(resolved.delivery_id);
        self.queue.check_waiters();
        Ok(())
    }
}

pub struct Delivery {
    /// `None` for messages that need no acknowledgement
    pub handle: Option<DeliveryHandle>,
    pub message: MessageHandle,
    pub delivery_count: u32,
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("handle", &self.handle)
            .field("message", &self.message.id())
            .field("delivery_count", &self.delivery_count)
            .finish()
    }
}

impl Delivery {
    pub(crate) fn new(handle: Option<DeliveryHandle>, message: MessageHandle, delivery_count: u32) -> Self {
        Self { handle, message, delivery_count }
    }

    #[inline]
    pub fn delivery_id(&self) -> Option<DeliveryId> {
        self.handle.as_ref().map(|h| h.delivery_id)
    }
}

pub struct Consumer {
    id: ObjectId,
    session: SessionHandle,
    queue: QueueHandle,
    dest: ConsumerDest,
    counts: ConsumerCounts,
    waiter: Waiter,
    destroyed: AtomicBool,
    suspended: AtomicBool,
    callback: MessageCallback,
    pending: PendingCompletion<()>,
}

impl fmt::Debug for Consumer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Consumer {{ id: {}, session: {}, queue: {} }}", self.id, self.session.id(), self.queue.name())
    }
}

impl Consumer {
    pub(crate) fn create(
        session: &SessionHandle,
        target: ConsumerTarget<'_>,
        callback: MessageCallback,
    ) -> Result<ConsumerHandle> {
        let ctx = session.ctx();
        let client = session.client();
        let browse = session.options().contains(SessionOptions::BROWSE_ONLY);
        let (resource, name, action) = match target {
            ConsumerTarget::Queue(name) => {
                (ResourceType::Queue, name, if browse { Action::Browse } else { Action::Receive })
            }
            ConsumerTarget::Topic { topic, .. } => (ResourceType::Topic, topic, Action::Subscribe),
            ConsumerTarget::Subscription(name) => (ResourceType::Subscription, name, Action::Receive),
        };
        let sctx = SecurityContext { client_id: client.client_id(), user_id: client.user_id() };
        ctx.security.validate_policy(&sctx, resource, name, action)?;

        if !session.acquire() {
            return Err(EngineError::Destroyed);
        }
        let session_ref = scopeguard::guard(session.clone(), |s| s.release());

        let dest = Self::open_dest(ctx, session, target)?;
        let queue = match &dest {
            ConsumerDest::Queue(nq) => nq.queue().clone(),
            ConsumerDest::Subscription(sub) => sub.queue().clone(),
        };
        let consumer = Arc::new(Consumer {
            id: ctx.next_id(),
            session: session.clone(),
            queue: queue.clone(),
            dest,
            counts: ConsumerCounts::new(1),
            waiter: Waiter::new(),
            destroyed: AtomicBool::new(false),
            suspended: AtomicBool::new(false),
            callback,
            pending: PendingCompletion::new(),
        });

        let registered = queue.register_consumer(consumer.clone()).and_then(|_| {
            session.add_consumer(consumer.clone()).inspect_err(|_| queue.unregister_consumer(consumer.id))
        });
        if let Err(e) = registered {
            let _ = consumer.waiter.disconnect();
            consumer.release_dest();
            return Err(e);
        }
        let _ = scopeguard::ScopeGuard::into_inner(session_ref);
        ctx.stats.consumers.inc();
        log::debug!("{:?} created", consumer);

        if let ConsumerDest::Subscription(sub) = &consumer.dest {
            if sub.is_implicit() {
                if let Err(e) = ctx.topics.republish_retained(ctx, sub) {
                    log::warn!("{:?} retained republish failed, {:?}", consumer, e);
                }
            }
        }
        if session.wants_delivery() && consumer.enable_waiter() {
            queue.check_waiters();
        }
        Ok(consumer)
    }

    fn open_dest(ctx: &EngineContext, session: &SessionHandle, target: ConsumerTarget<'_>) -> Result<ConsumerDest> {
        let client_id = session.client().client_id();
        match target {
            ConsumerTarget::Queue(name) => {
                let nq = ctx.namespace.open_queue(ctx, name, OpenKind::Consumer, client_id)?;
                Ok(ConsumerDest::Queue(nq))
            }
            ConsumerTarget::Topic { topic, max_reliability } => {
                let mut req = SubscriptionRequest::new(client_id, None, topic);
                req.max_reliability = max_reliability;
                let sub = ctx.topics.create_subscription(ctx, req)?;
                if let Err(e) = ctx.topics.register_consumer(&sub) {
                    let _ = ctx.topics.destroy_subscription(ctx, &sub);
                    return Err(e);
                }
                Ok(ConsumerDest::Subscription(sub))
            }
            ConsumerTarget::Subscription(name) => {
                let sub = ctx.topics.find_client_subscription(client_id, name)?;
                ctx.topics.register_consumer(&sub)?;
                Ok(ConsumerDest::Subscription(sub))
            }
        }
    }

    fn release_dest(&self) {
        let ctx = self.session.ctx();
        match &self.dest {
            ConsumerDest::Queue(nq) => ctx.namespace.release(ctx, nq, OpenKind::Consumer),
            ConsumerDest::Subscription(sub) => {
                ctx.topics.unregister_consumer(sub);
                if sub.is_implicit() {
                    if let Err(e) = ctx.topics.destroy_subscription(ctx, sub) {
                        log::warn!("{:?} failed to destroy implicit subscription, {:?}", self, e);
                    }
                }
            }
        }
    }

    #[inline]
    pub fn id(&self) -> ObjectId {
        self.id
    }

    #[inline]
    pub fn session(&self) -> &SessionHandle {
        &self.session
    }

    #[inline]
    pub fn queue(&self) -> &QueueHandle {
        &self.queue
    }

    #[inline]
    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    #[inline]
    pub(crate) fn waiter(&self) -> &Waiter {
        &self.waiter
    }

    #[inline]
    pub(crate) fn counts(&self) -> &ConsumerCounts {
        &self.counts
    }

    #[inline]
    pub(crate) fn requires_ack(&self, msg: &MessageHandle) -> bool {
        msg.reliability() >= Reliability::AtLeastOnce
    }

    #[inline]
    pub(crate) fn alloc_delivery_id(&self) -> Option<DeliveryId> {
        self.session.client().alloc_delivery_id()
    }

    pub fn delivery_status(&self) -> DeliveryStatus {
        if self.is_destroyed() {
            DeliveryStatus::Destroyed
        } else if self.suspended.load(Ordering::SeqCst) {
            DeliveryStatus::Suspended
        } else if self.waiter.is_enabled() {
            DeliveryStatus::Started
        } else {
            DeliveryStatus::Stopped
        }
    }

    /// Enable the waiter on behalf of the session. The consumer reference and
    /// session callback count are taken before asking, and handed back if the
    /// waiter turns out to be enabled already or no longer usable.
    pub(crate) fn enable_waiter(self: &Arc<Self>) -> bool {
        if self.is_destroyed() || self.suspended.load(Ordering::SeqCst) {
            return false;
        }
        if !self.counts.acquire_use() {
            return false;
        }
        self.session.begin_callback();
        match self.waiter.enable() {
            Ok(Enabled::Now) | Ok(Enabled::CancelledDisable) => true,
            Err(e) => {
                log::trace!("{:?} enable waiter, {:?}", self, e);
                self.waiter_disabled();
                false
            }
        }
    }

    pub(crate) fn disable_waiter(self: &Arc<Self>) -> Result<Disabled> {
        let res = self.waiter.disable()?;
        match res {
            Disabled::Now | Disabled::PendingAfterCancel => self.waiter_disabled(),
            Disabled::Pending => {}
        }
        Ok(res)
    }

    /// The notification owed for each enable that has ended
    fn waiter_disabled(self: &Arc<Self>) {
        self.session.end_callback();
        self.release_use();
    }

    fn unlock_waiter(self: &Arc<Self>, suspend: bool) {
        let unlocked = self.waiter.unlock(suspend);
        for _ in 0..unlocked.disabled_fires {
            self.waiter_disabled();
        }
    }

    pub(crate) fn release_waiter_lock(self: &Arc<Self>) {
        self.unlock_waiter(false);
    }

    pub(crate) fn deliver(self: &Arc<Self>, delivery: Delivery) {
        log::trace!("{:?} delivering {:?}", self, delivery);
        self.session.ctx().stats.deliveries.inc();
        let more = (self.callback)(self, delivery);
        let suspend = !more && !self.session.options().contains(SessionOptions::EXPLICIT_SUSPEND);
        if suspend {
            self.suspended.store(true, Ordering::SeqCst);
        }
        self.unlock_waiter(suspend);
    }

    /// The client ran out of delivery ids with this consumer's waiter locked
    pub(crate) fn delivery_ids_exhausted(self: &Arc<Self>) {
        log::debug!("{:?} client delivery ids exhausted, pausing session", self);
        if let Err(e) = self.session.engine_stop() {
            log::debug!("{:?} engine stop, {:?}", self, e);
        }
        self.release_waiter_lock();
    }

    pub fn suspend(self: &Arc<Self>) -> Result<()> {
        if self.is_destroyed() {
            return Err(EngineError::Destroyed);
        }
        if self.suspended.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        match self.disable_waiter() {
            Ok(_) | Err(EngineError::WaiterDisabled) => Ok(()),
            Err(e) => Err(e),
        }
    }

    pub fn resume(self: &Arc<Self>) -> Result<()> {
        if self.is_destroyed() {
            return Err(EngineError::Destroyed);
        }
        self.suspended.store(false, Ordering::SeqCst);
        if self.session.wants_delivery() && self.enable_waiter() {
            self.queue.check_waiters();
        }
        Ok(())
    }

    pub fn destroy(self: &Arc<Self>, cb: Option<CompletionCallback<()>>) -> Result<Completion<()>> {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return Err(EngineError::Destroyed);
        }
        self.pending.arm(cb);
        match self.disable_waiter() {
            Ok(_) | Err(EngineError::WaiterDisabled) => {}
            Err(e) => log::debug!("{:?} disable waiter on destroy, {:?}", self, e),
        }
        self.release_use();
        self.pending.settle()
    }

    fn release_use(self: &Arc<Self>) {
        match self.counts.release_use() {
            Release::Held => {}
            Release::Last => self.teardown(),
            Release::Underflow => {
                let ctx = self.session.ctx();
                ctx.diag.ffdc("consumer_release", false, "consumer use count underflow", self.to_json())
            }
        }
    }

    fn teardown(self: &Arc<Self>) {
        let ctx = self.session.ctx();
        self.queue.unregister_consumer(self.id);
        if let Err(e) = self.waiter.disconnect() {
            ctx.diag.ffdc("consumer_teardown", false, &e.to_string(), self.to_json());
        }
        self.release_dest();
        self.pending.complete(Ok(()));
        match self.counts.mark_destroy_completed() {
            Ok(true) => self.free(),
            Ok(false) => {
                ctx.stats.zombie_consumers.inc();
                log::debug!("{:?} destroyed with unacknowledged messages, {:?}", self, self.counts.snapshot());
            }
            Err(()) => ctx.diag.ffdc("consumer_teardown", true, "consumer destroy completed twice", self.to_json()),
        }
    }

    fn free(self: &Arc<Self>) {
        let ctx = self.session.ctx();
        self.session.remove_consumer(self.id);
        ctx.stats.consumers.dec();
        log::debug!("{:?} freed", self);
        self.session.release();
    }

    fn ack_resolved(self: &Arc<Self>, delivery_id: DeliveryId) {
        self.session.client().release_delivery_id(delivery_id);
        match self.counts.release_ack() {
            AckRelease::Held => {}
            AckRelease::Free => {
                self.session.ctx().stats.zombie_consumers.dec();
                self.free();
            }
            AckRelease::Underflow => {
                let ctx = self.session.ctx();
                ctx.diag.ffdc("consumer_ack", false, "consumer ack count underflow", self.to_json())
            }
        }
    }

    /// Return everything in flight to this consumer to its queue
    pub(crate) fn nack_all(self: &Arc<Self>) -> usize {
        let resolved = self.queue.nack_all_for(self.id);
        for r in resolved.iter() {
            self.ack_resolved(r.delivery_id);
        }
        if !resolved.is_empty() {
            self.queue.check_waiters();
        }
        resolved.len()
    }

    pub fn to_json(&self) -> serde_json::Value {
        let counts = self.counts.snapshot();
        json!({
            "id": self.id,
            "session": self.session.id(),
            "queue": self.queue.name(),
            "uses": counts.uses,
            "acks": counts.acks,
            "destroy_completed": counts.destroy_completed,
            "freed": counts.freed,
            "waiter": self.waiter.state(),
            "destroyed": self.is_destroyed(),
            "suspended": self.suspended.load(Ordering::SeqCst),
        })
    }
}

struct AckEntry {
    handle: DeliveryHandle,
}

impl SoftLogEntry for AckEntry {
    fn describe(&self) -> String {
        format!("ack {:?}", self.handle)
    }

    fn commit(self: Box<Self>) {
        if let Err(e) = self.handle.consume() {
            log::warn!("transactional ack of {:?} failed, {:?}", self.handle, e);
        }
    }

    fn rollback(self: Box<Self>) {
        if let Err(e) = self.handle.nack() {
            log::debug!("redelivery of {:?} after rollback, {:?}", self.handle, e);
        }
    }
}

/// Acknowledge one delivery made to a consumer of `session`
pub(crate) fn confirm_delivery(
    session: &SessionHandle,
    tran: Option<&TransactionHandle>,
    handle: &DeliveryHandle,
    option: AckOption,
) -> Result<()> {
    if handle.consumer.session.id() != session.id() {
        return Err(EngineError::ArgNotValid);
    }
    if !session.enter_confirm() {
        return Err(EngineError::Destroyed);
    }
    let _gate = scopeguard::guard(session.clone(), |s| s.leave_confirm());
    match (option, tran) {
        (AckOption::Received, _) => handle.queue.mark_received(handle.node),
        (AckOption::Consumed, Some(tran)) => {
            tran.begin_operation()?;
            let res = tran.add_soft_log(Box::new(AckEntry { handle: handle.clone() }));
            tran.end_operation();
            res
        }
        (AckOption::Consumed, None) => handle.consume(),
        (AckOption::NotReceived, _) => handle.nack(),
    }
}

/// Acknowledge a batch, carrying on past failures and reporting the first
pub(crate) fn confirm_delivery_batch(
    session: &SessionHandle,
    tran: Option<&TransactionHandle>,
    handles: &[DeliveryHandle],
    option: AckOption,
) -> Result<()> {
    let mut first_err = None;
    for handle in handles {
        if let Err(e) = confirm_delivery(session, tran, handle, option) {
            first_err.get_or_insert(e);
        }
    }
    match first_err {
        Some(e) => Err(e),
        None => Ok(()),
    }
}
