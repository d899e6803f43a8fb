//! Message queue with round-robin delivery to enabled waiters.
//!
//! Messages sit in `available` until a consumer's waiter is locked for them.
//! Messages that need an acknowledgement move to `inflight`, keyed by their
//! node number, until the consumer consumes or nacks them.

use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::json;

use crate::consumer::{ConsumerHandle, Delivery, DeliveryHandle};
use crate::error::{EngineError, Result};
use crate::message::MessageHandle;
use crate::policy::PolicyInfo;
use crate::stats::Stats;
use crate::transaction::{SoftLogEntry, TransactionHandle};
use crate::types::{DeliveryId, ObjectId};
use crate::utils::timestamp_secs;

pub type QueueHandle = Arc<Queue>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueKind {
    Named,
    Temporary,
    Subscription,
}

#[derive(Debug, Clone)]
pub struct QueueEntry {
    pub node: u64,
    pub msg: MessageHandle,
    pub delivery_count: u32,
}

#[derive(Debug)]
struct Inflight {
    entry: QueueEntry,
    consumer_id: ObjectId,
    delivery_id: DeliveryId,
    received: bool,
}

/// What a resolved in-flight message was bound to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resolved {
    pub consumer_id: ObjectId,
    pub delivery_id: DeliveryId,
}

#[derive(Default)]
struct QueueInner {
    next_node: u64,
    available: VecDeque<QueueEntry>,
    inflight: BTreeMap<u64, Inflight>,
    uncommitted: usize,
    consumers: Vec<ConsumerHandle>,
    cursor: usize,
    batch: u32,
}

pub struct Queue {
    id: ObjectId,
    name: String,
    kind: QueueKind,
    policy: Arc<PolicyInfo>,
    inner: Mutex<QueueInner>,
    deleted: AtomicBool,
    batch_size: u32,
    stats: Arc<Stats>,
}

impl fmt::Debug for Queue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Queue").field("id", &self.id).field("name", &self.name).field("kind", &self.kind).finish()
    }
}

enum Step {
    Deliver(ConsumerHandle, Delivery),
    Exhausted(ConsumerHandle),
}

impl Queue {
    pub(crate) fn new(
        stats: &Arc<Stats>,
        id: ObjectId,
        name: impl Into<String>,
        kind: QueueKind,
        policy: Arc<PolicyInfo>,
        batch_size: u32,
    ) -> QueueHandle {
        stats.queues.inc();
        Arc::new(Queue {
            id,
            name: name.into(),
            kind,
            policy,
            inner: Mutex::new(QueueInner { next_node: 1, ..Default::default() }),
            deleted: AtomicBool::new(false),
            batch_size: batch_size.max(1),
            stats: stats.clone(),
        })
    }

    #[inline]
    pub fn id(&self) -> ObjectId {
        self.id
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn kind(&self) -> QueueKind {
        self.kind
    }

    #[inline]
    pub fn policy(&self) -> &Arc<PolicyInfo> {
        &self.policy
    }

    #[inline]
    pub fn is_deleted(&self) -> bool {
        self.deleted.load(Ordering::SeqCst)
    }

    /// Available plus in-flight messages
    pub fn buffered(&self) -> usize {
        let inner = self.inner.lock();
        inner.available.len() + inner.inflight.len()
    }

    #[inline]
    pub fn available(&self) -> usize {
        self.inner.lock().available.len()
    }

    #[inline]
    pub fn inflight(&self) -> usize {
        self.inner.lock().inflight.len()
    }

    #[inline]
    pub fn consumer_count(&self) -> usize {
        self.inner.lock().consumers.len()
    }

    pub fn put(self: &Arc<Self>, msg: MessageHandle, tran: Option<&TransactionHandle>) -> Result<()> {
        {
            let mut inner = self.inner.lock();
            if self.is_deleted() {
                return Err(EngineError::Destroyed);
            }
            let depth = inner.available.len() + inner.inflight.len() + inner.uncommitted;
            if depth >= self.policy.max_messages() {
                log::debug!("{:?} full, depth: {}", self, depth);
                return Err(EngineError::DestinationFull);
            }
            match tran {
                Some(_) => inner.uncommitted += 1,
                None => Self::push_back(&mut inner, msg.clone()),
            }
        }
        msg.mark_enqueued();
        if let Some(tran) = tran {
            return tran.add_soft_log(Box::new(PutEntry { queue: self.clone(), msg }));
        }
        self.stats.buffered_messages.inc();
        self.check_waiters();
        Ok(())
    }

    fn push_back(inner: &mut QueueInner, msg: MessageHandle) {
        let node = inner.next_node;
        inner.next_node += 1;
        inner.available.push_back(QueueEntry { node, msg, delivery_count: 0 });
    }

    fn commit_put(self: &Arc<Self>, msg: MessageHandle) {
        {
            let mut inner = self.inner.lock();
            inner.uncommitted = inner.uncommitted.saturating_sub(1);
            if self.is_deleted() {
                return;
            }
            Self::push_back(&mut inner, msg);
        }
        self.stats.buffered_messages.inc();
        self.check_waiters();
    }

    fn abort_put(&self) {
        let mut inner = self.inner.lock();
        inner.uncommitted = inner.uncommitted.saturating_sub(1);
    }

    pub(crate) fn register_consumer(&self, consumer: ConsumerHandle) -> Result<()> {
        if self.is_deleted() {
            return Err(EngineError::Destroyed);
        }
        consumer.waiter().connect()?;
        self.inner.lock().consumers.push(consumer);
        Ok(())
    }

    pub(crate) fn unregister_consumer(&self, consumer_id: ObjectId) {
        let mut inner = self.inner.lock();
        if let Some(pos) = inner.consumers.iter().position(|c| c.id() == consumer_id) {
            inner.consumers.remove(pos);
            if pos < inner.cursor {
                inner.cursor -= 1;
            }
            if inner.cursor >= inner.consumers.len() {
                inner.cursor = 0;
                inner.batch = 0;
            }
        }
    }

    /// Offer available messages to enabled waiters.
    ///
    /// Consumers are served round-robin, each taking up to `batch_size`
    /// messages before the cursor moves on. The cursor survives delivery
    /// restarts. The callback runs with only the waiter locked.
    pub fn check_waiters(self: &Arc<Self>) {
        loop {
            let step = {
                let mut inner = self.inner.lock();
                if self.is_deleted() {
                    return;
                }
                self.drop_expired(&mut inner);
                if inner.available.is_empty() || inner.consumers.is_empty() {
                    return;
                }
                let n = inner.consumers.len();
                let start = inner.cursor % n;
                let idx = match (0..n).map(|i| (start + i) % n).find(|&i| inner.consumers[i].waiter().try_lock()) {
                    Some(idx) => idx,
                    None => return,
                };
                let consumer = inner.consumers[idx].clone();
                let entry = match inner.available.pop_front() {
                    Some(entry) => entry,
                    None => {
                        drop(inner);
                        consumer.release_waiter_lock();
                        return;
                    }
                };

                if consumer.requires_ack(&entry.msg) {
                    match consumer.alloc_delivery_id() {
                        Some(delivery_id) => {
                            Self::advance(&mut inner, idx, n, self.batch_size);
                            consumer.counts().inc_ack();
                            let handle = DeliveryHandle::new(self.clone(), entry.node, consumer.clone(), delivery_id);
                            let delivery = Delivery::new(Some(handle), entry.msg.clone(), entry.delivery_count);
                            inner.inflight.insert(
                                entry.node,
                                Inflight { entry, consumer_id: consumer.id(), delivery_id, received: false },
                            );
                            self.stats.inflight_messages.inc();
                            Step::Deliver(consumer, delivery)
                        }
                        None => {
                            inner.available.push_front(entry);
                            Step::Exhausted(consumer)
                        }
                    }
                } else {
                    Self::advance(&mut inner, idx, n, self.batch_size);
                    self.stats.buffered_messages.dec();
                    Step::Deliver(consumer, Delivery::new(None, entry.msg, entry.delivery_count))
                }
            };

            match step {
                Step::Deliver(consumer, delivery) => consumer.deliver(delivery),
                Step::Exhausted(consumer) => {
                    consumer.delivery_ids_exhausted();
                    return;
                }
            }
        }
    }

    fn advance(inner: &mut QueueInner, idx: usize, n: usize, batch_size: u32) {
        if idx != inner.cursor {
            inner.cursor = idx;
            inner.batch = 0;
        }
        inner.batch += 1;
        if inner.batch >= batch_size {
            inner.cursor = (idx + 1) % n;
            inner.batch = 0;
        }
    }

    fn drop_expired(&self, inner: &mut QueueInner) {
        let now = timestamp_secs() as u32;
        let before = inner.available.len();
        inner.available.retain(|e| !e.msg.is_expired(now));
        let expired = before - inner.available.len();
        if expired > 0 {
            log::debug!("{:?} dropped {} expired messages", self, expired);
            self.stats.expired_messages.incs(expired as isize);
            self.stats.buffered_messages.decs(expired as isize);
        }
    }

    /// Remove an acknowledged message
    pub(crate) fn consume(&self, node: u64) -> Result<Resolved> {
        let mut inner = self.inner.lock();
        let inflight = inner.inflight.remove(&node).ok_or(EngineError::NotFound)?;
        self.stats.inflight_messages.dec();
        self.stats.buffered_messages.dec();
        Ok(Resolved { consumer_id: inflight.consumer_id, delivery_id: inflight.delivery_id })
    }

    /// Return an in-flight message to the head of the queue for redelivery
    pub(crate) fn nack(&self, node: u64) -> Result<Resolved> {
        let mut inner = self.inner.lock();
        let inflight = inner.inflight.remove(&node).ok_or(EngineError::NotFound)?;
        self.stats.inflight_messages.dec();
        let resolved = Resolved { consumer_id: inflight.consumer_id, delivery_id: inflight.delivery_id };
        Self::requeue(&mut inner, inflight.entry, self.is_deleted(), &self.stats);
        Ok(resolved)
    }

    fn requeue(inner: &mut QueueInner, mut entry: QueueEntry, deleted: bool, stats: &Stats) {
        if deleted {
            stats.buffered_messages.dec();
            return;
        }
        entry.delivery_count += 1;
        let pos = inner.available.iter().position(|e| e.node > entry.node).unwrap_or(inner.available.len());
        inner.available.insert(pos, entry);
    }

    pub(crate) fn mark_received(&self, node: u64) -> Result<()> {
        let mut inner = self.inner.lock();
        let inflight = inner.inflight.get_mut(&node).ok_or(EngineError::NotFound)?;
        inflight.received = true;
        Ok(())
    }

    /// Requeue everything in flight to `consumer_id`
    pub(crate) fn nack_all_for(&self, consumer_id: ObjectId) -> Vec<Resolved> {
        let mut inner = self.inner.lock();
        let nodes = inner
            .inflight
            .iter()
            .filter_map(|(node, i)| if i.consumer_id == consumer_id { Some(*node) } else { None })
            .collect::<Vec<_>>();
        let deleted = self.is_deleted();
        let mut resolved = Vec::with_capacity(nodes.len());
        for node in nodes {
            if let Some(inflight) = inner.inflight.remove(&node) {
                self.stats.inflight_messages.dec();
                resolved.push(Resolved { consumer_id, delivery_id: inflight.delivery_id });
                Self::requeue(&mut inner, inflight.entry, deleted, &self.stats);
            }
        }
        resolved
    }

    /// Mark deleted and drop the available messages
    pub(crate) fn delete(&self) {
        if self.deleted.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut inner = self.inner.lock();
        let dropped = inner.available.len();
        inner.available.clear();
        inner.consumers.clear();
        self.stats.buffered_messages.decs(dropped as isize);
        self.stats.queues.dec();
        log::debug!("{:?} deleted, {} messages discarded", self, dropped);
    }

    pub fn to_json(&self) -> serde_json::Value {
        let inner = self.inner.lock();
        json!({
            "id": self.id,
            "name": self.name,
            "kind": format!("{:?}", self.kind),
            "available": inner.available.len(),
            "inflight": inner.inflight.len(),
            "received": inner.inflight.values().filter(|i| i.received).count(),
            "uncommitted": inner.uncommitted,
            "consumers": inner.consumers.len(),
            "deleted": self.is_deleted(),
        })
    }
}

struct PutEntry {
    queue: QueueHandle,
    msg: MessageHandle,
}

impl SoftLogEntry for PutEntry {
    fn describe(&self) -> String {
        format!("put message {} on {}", self.msg.id(), self.queue.name())
    }

    fn is_persistent(&self) -> bool {
        self.msg.is_persistent()
    }

    fn commit(self: Box<Self>) {
        let PutEntry { queue, msg } = *self;
        queue.commit_put(msg);
    }

    fn rollback(self: Box<Self>) {
        self.queue.abort_put();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conf::Settings;
    use crate::message::{Message, MessageHeader};
    use crate::types::properties;

    fn queue(stats: &Arc<Stats>, max: &str) -> QueueHandle {
        let policy = PolicyInfo::default_for("q", &Settings::default());
        policy.update(&properties([("MaxMessages", max)])).unwrap();
        Queue::new(stats, 1, "q", QueueKind::Named, policy, 5)
    }

    #[test]
    fn test_put_full_and_delete() {
        let stats = Arc::new(Stats::new());
        let q = queue(&stats, "2");
        for id in 0..2 {
            q.put(Message::new(&stats, id, MessageHeader::default(), vec![]), None).unwrap();
        }
        let m = Message::new(&stats, 9, MessageHeader::default(), vec![]);
        assert_eq!(q.put(m, None), Err(EngineError::DestinationFull));
        assert_eq!(q.buffered(), 2);
        assert_eq!(stats.buffered_messages.count(), 2);
        assert_eq!(stats.queues.count(), 1);

        q.delete();
        assert_eq!(q.buffered(), 0);
        assert_eq!(stats.buffered_messages.count(), 0);
        assert_eq!(stats.queues.count(), 0);
        assert_eq!(stats.messages.count(), 0);
        let m = Message::new(&stats, 10, MessageHeader::default(), vec![]);
        assert_eq!(q.put(m, None), Err(EngineError::Destroyed));
    }

    #[test]
    fn test_expired_messages_are_dropped() {
        let stats = Arc::new(Stats::new());
        let q = queue(&stats, "10");
        let header = MessageHeader { expiry: 1, ..Default::default() };
        q.put(Message::new(&stats, 1, header, vec![]), None).unwrap();
        q.put(Message::new(&stats, 2, MessageHeader::default(), vec![]), None).unwrap();
        {
            let mut inner = q.inner.lock();
            q.drop_expired(&mut inner);
        }
        assert_eq!(q.available(), 1);
        assert_eq!(stats.expired_messages.count(), 1);
    }
}
