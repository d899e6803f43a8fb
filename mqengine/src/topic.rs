//! Topic tree seam and the in-memory subscription matcher.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::RwLock;
use serde_json::json;

use crate::context::EngineContext;
use crate::error::{EngineError, Result};
use crate::message::{MessageHandle, Reliability};
use crate::policy::PolicyInfo;
use crate::queue::{Queue, QueueHandle, QueueKind};
use crate::stats::Stats;
use crate::store::{state, RecordId, RecordType};
use crate::transaction::{SoftLogEntry, TransactionHandle};
use crate::types::{ChangeType, ClientId, HashSet, ObjectId};

pub type SubscriptionHandle = Arc<Subscription>;

#[derive(Debug, Clone)]
pub struct SubscriptionRequest {
    pub client_id: ClientId,
    /// `None` for the implicit subscription behind a topic consumer
    pub name: Option<String>,
    pub topic_filter: String,
    pub max_reliability: Reliability,
    pub durable: bool,
    pub shared: bool,
}

impl SubscriptionRequest {
    pub fn new(client_id: impl Into<ClientId>, name: Option<&str>, topic_filter: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            name: name.map(|n| n.to_owned()),
            topic_filter: topic_filter.into(),
            max_reliability: Reliability::ExactlyOnce,
            durable: false,
            shared: false,
        }
    }
}

pub struct Subscription {
    id: ObjectId,
    client_id: ClientId,
    name: Option<String>,
    topic_filter: String,
    max_reliability: Reliability,
    durable: bool,
    shared: bool,
    queue: QueueHandle,
    consumers: AtomicU32,
    store_id: Option<RecordId>,
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("client_id", &self.client_id)
            .field("name", &self.name)
            .field("topic_filter", &self.topic_filter)
            .finish()
    }
}

impl Subscription {
    #[inline]
    pub fn id(&self) -> ObjectId {
        self.id
    }

    #[inline]
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    #[inline]
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    #[inline]
    pub fn topic_filter(&self) -> &str {
        &self.topic_filter
    }

    #[inline]
    pub fn is_durable(&self) -> bool {
        self.durable
    }

    #[inline]
    pub fn is_implicit(&self) -> bool {
        self.name.is_none()
    }

    #[inline]
    pub fn queue(&self) -> &QueueHandle {
        &self.queue
    }

    #[inline]
    pub fn consumers(&self) -> u32 {
        self.consumers.load(Ordering::SeqCst)
    }

    pub fn to_json(&self) -> serde_json::Value {
        json!({
            "id": self.id,
            "client_id": self.client_id,
            "name": self.name,
            "topic_filter": self.topic_filter,
            "max_reliability": self.max_reliability,
            "durable": self.durable,
            "shared": self.shared,
            "consumers": self.consumers(),
            "queue": self.queue.to_json(),
        })
    }
}

/// Subscription matching and retained-message handling.
pub trait TopicTree: Send + Sync {
    fn create_subscription(&self, ctx: &EngineContext, req: SubscriptionRequest) -> Result<SubscriptionHandle>;

    fn find_client_subscription(&self, client_id: &str, name: &str) -> Result<SubscriptionHandle>;

    /// Fails with `DestinationInUse` while consumers are attached
    fn destroy_subscription(&self, ctx: &EngineContext, sub: &SubscriptionHandle) -> Result<()>;

    fn register_consumer(&self, sub: &SubscriptionHandle) -> Result<()>;

    fn unregister_consumer(&self, sub: &SubscriptionHandle);

    /// Put `msg` on every matching subscription, returns how many matched
    fn publish(
        &self,
        ctx: &EngineContext,
        topic: &str,
        msg: MessageHandle,
        tran: Option<&TransactionHandle>,
    ) -> Result<usize>;

    fn republish_retained(&self, ctx: &EngineContext, sub: &SubscriptionHandle) -> Result<usize>;

    fn list_subscriptions(&self, client_id: &str) -> Vec<SubscriptionHandle>;

    fn topic_monitor_changed(&self, topic: &str, change: ChangeType) -> Result<()>;
}

/// Filter validation: `#` only as the last level, wildcards only as whole levels
pub fn is_valid_filter(filter: &str) -> bool {
    if filter.is_empty() {
        return false;
    }
    let levels = filter.split('/').collect::<Vec<_>>();
    let last = levels.len() - 1;
    levels.iter().enumerate().all(|(i, level)| match *level {
        "#" => i == last,
        "+" => true,
        l => !l.contains(['#', '+']),
    })
}

#[inline]
pub fn is_valid_topic(topic: &str) -> bool {
    !topic.is_empty() && !topic.contains(['#', '+'])
}

/// MQTT style match; topics starting with `$` never match a leading wildcard
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    if topic.starts_with('$') && (filter.starts_with('+') || filter.starts_with('#')) {
        return false;
    }
    let mut f = filter.split('/');
    let mut t = topic.split('/');
    loop {
        match (f.next(), t.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => {}
            (Some(fl), Some(tl)) if fl == tl => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

type RetainedMap = Arc<RwLock<BTreeMap<String, MessageHandle>>>;

#[derive(Default)]
pub struct DefaultTopicTree {
    subs: RwLock<Vec<SubscriptionHandle>>,
    retained: RetainedMap,
    monitors: RwLock<HashSet<String>>,
}

impl DefaultTopicTree {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn retained_count(&self) -> usize {
        self.retained.read().len()
    }

    #[inline]
    pub fn is_monitored(&self, topic: &str) -> bool {
        self.monitors.read().contains(topic)
    }

    fn deliver_to(
        &self,
        ctx: &EngineContext,
        sub: &Subscription,
        msg: &MessageHandle,
        tran: Option<&TransactionHandle>,
    ) -> Result<()> {
        let msg = if msg.reliability() > sub.max_reliability {
            msg.copy_with_reliability(ctx.next_id(), sub.max_reliability)
        } else {
            msg.clone()
        };
        sub.queue.put(msg, tran)
    }

    /// Replace or clear the retained message of `topic`. Under a
    /// transaction the change waits for commit.
    fn update_retained(
        &self,
        ctx: &EngineContext,
        topic: &str,
        msg: &MessageHandle,
        tran: Option<&TransactionHandle>,
    ) -> Result<()> {
        match tran {
            Some(tran) => tran.add_soft_log(Box::new(RetainEntry {
                retained: self.retained.clone(),
                stats: ctx.stats.clone(),
                topic: topic.to_owned(),
                msg: msg.clone(),
            })),
            None => {
                apply_retained(&self.retained, &ctx.stats, topic, msg);
                Ok(())
            }
        }
    }
}

fn apply_retained(retained: &RwLock<BTreeMap<String, MessageHandle>>, stats: &Stats, topic: &str, msg: &MessageHandle) {
    let mut retained = retained.write();
    let empty = msg.payload().map(|p| p.is_empty()).unwrap_or(true);
    if empty {
        if retained.remove(topic).is_some() {
            stats.retained_messages.dec();
        }
    } else if retained.insert(topic.to_owned(), msg.clone()).is_none() {
        stats.retained_messages.inc();
    }
}

struct RetainEntry {
    retained: RetainedMap,
    stats: Arc<Stats>,
    topic: String,
    msg: MessageHandle,
}

impl SoftLogEntry for RetainEntry {
    fn describe(&self) -> String {
        format!("retain message {} on {}", self.msg.id(), self.topic)
    }

    fn is_persistent(&self) -> bool {
        self.msg.is_persistent()
    }

    fn commit(self: Box<Self>) {
        apply_retained(&self.retained, &self.stats, &self.topic, &self.msg);
    }

    fn rollback(self: Box<Self>) {}
}

impl TopicTree for DefaultTopicTree {
    fn create_subscription(&self, ctx: &EngineContext, req: SubscriptionRequest) -> Result<SubscriptionHandle> {
        if !is_valid_filter(&req.topic_filter) {
            return Err(EngineError::DestNotValid(req.topic_filter));
        }
        if let Some(name) = req.name.as_deref() {
            if self.find_client_subscription(&req.client_id, name).is_ok() {
                return Err(EngineError::DestinationInUse);
            }
        }
        let id = ctx.next_id();
        let qname = match &req.name {
            Some(name) => format!("{}/{}", req.client_id, name),
            None => format!("{}/_implicit/{}", req.client_id, id),
        };
        let policy = PolicyInfo::default_for(&req.topic_filter, &ctx.settings);
        let store_id = if req.durable {
            let data = Bytes::from(json!({"client_id": req.client_id, "name": req.name, "filter": req.topic_filter}).to_string());
            let rid = ctx.store.create_record(RecordType::Subscription, data, state::NONE)?;
            ctx.store.commit()?;
            Some(rid)
        } else {
            None
        };
        let queue =
            Queue::new(&ctx.stats, id, qname, QueueKind::Subscription, policy, ctx.settings.engine.multi_consumer_batch_size);
        let sub = Arc::new(Subscription {
            id,
            client_id: req.client_id,
            name: req.name,
            topic_filter: req.topic_filter,
            max_reliability: req.max_reliability,
            durable: req.durable,
            shared: req.shared,
            queue,
            consumers: AtomicU32::new(0),
            store_id,
        });
        self.subs.write().push(sub.clone());
        ctx.stats.subscriptions.inc();
        log::debug!("created {:?}", sub);
        Ok(sub)
    }

    fn find_client_subscription(&self, client_id: &str, name: &str) -> Result<SubscriptionHandle> {
        self.subs
            .read()
            .iter()
            .find(|s| s.client_id == client_id && s.name.as_deref() == Some(name))
            .cloned()
            .ok_or(EngineError::NotFound)
    }

    fn destroy_subscription(&self, ctx: &EngineContext, sub: &SubscriptionHandle) -> Result<()> {
        {
            let mut subs = self.subs.write();
            if sub.consumers() > 0 {
                return Err(EngineError::DestinationInUse);
            }
            let pos = subs.iter().position(|s| Arc::ptr_eq(s, sub)).ok_or(EngineError::NotFound)?;
            subs.remove(pos);
        }
        sub.queue.delete();
        ctx.stats.subscriptions.dec();
        if let Some(id) = sub.store_id {
            ctx.store.delete_record(id)?;
            ctx.store.commit()?;
        }
        log::debug!("destroyed {:?}", sub);
        Ok(())
    }

    fn register_consumer(&self, sub: &SubscriptionHandle) -> Result<()> {
        let shared = sub.shared;
        sub.consumers
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |c| if !shared && c >= 1 { None } else { Some(c + 1) })
            .map(|_| ())
            .map_err(|_| EngineError::TooManyConsumers)
    }

    fn unregister_consumer(&self, sub: &SubscriptionHandle) {
        let _ = sub.consumers.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |c| c.checked_sub(1));
    }

    fn publish(
        &self,
        ctx: &EngineContext,
        topic: &str,
        msg: MessageHandle,
        tran: Option<&TransactionHandle>,
    ) -> Result<usize> {
        if !is_valid_topic(topic) {
            return Err(EngineError::DestNotValid(topic.into()));
        }
        let matched = self
            .subs
            .read()
            .iter()
            .filter(|s| topic_matches(&s.topic_filter, topic))
            .cloned()
            .collect::<Vec<_>>();
        for (n, sub) in matched.iter().enumerate() {
            if let Err(e) = self.deliver_to(ctx, sub, &msg, tran) {
                log::warn!("publish to {:?} failed, topic: {}, {:?}", sub, topic, e);
                if let Some(tran) = tran {
                    // earlier subscriptions already hold the put in the soft log
                    if n > 0 {
                        tran.mark_rollback_only();
                    }
                    return Err(e);
                }
            }
        }
        if msg.is_retained() {
            self.update_retained(ctx, topic, &msg, tran)?;
        }
        Ok(matched.len())
    }

    fn republish_retained(&self, ctx: &EngineContext, sub: &SubscriptionHandle) -> Result<usize> {
        let retained = self
            .retained
            .read()
            .iter()
            .filter(|(topic, _)| topic_matches(&sub.topic_filter, topic))
            .map(|(_, m)| m.clone())
            .collect::<Vec<_>>();
        for msg in retained.iter() {
            self.deliver_to(ctx, sub, msg, None)?;
        }
        Ok(retained.len())
    }

    fn list_subscriptions(&self, client_id: &str) -> Vec<SubscriptionHandle> {
        self.subs.read().iter().filter(|s| s.client_id == client_id).cloned().collect()
    }

    fn topic_monitor_changed(&self, topic: &str, change: ChangeType) -> Result<()> {
        if !is_valid_filter(topic) {
            return Err(EngineError::DestNotValid(topic.into()));
        }
        let mut monitors = self.monitors.write();
        match change {
            ChangeType::Create | ChangeType::Update => {
                monitors.insert(topic.into());
            }
            ChangeType::Delete => {
                if !monitors.remove(topic) {
                    return Err(EngineError::NotFound);
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conf::Settings;
    use crate::message::{AreaType, Message, MessageArea, MessageHeader};

    fn msg(ctx: &EngineContext, payload: &'static [u8], header: MessageHeader) -> MessageHandle {
        Message::new(
            &ctx.stats,
            ctx.next_id(),
            header,
            vec![MessageArea { area: AreaType::Payload, data: Bytes::from_static(payload) }],
        )
    }

    #[test]
    fn test_topic_matches() {
        assert!(topic_matches("a/+/c", "a/b/c"));
        assert!(topic_matches("a/#", "a"));
        assert!(topic_matches("a/#", "a/b/c"));
        assert!(topic_matches("#", "x/y"));
        assert!(!topic_matches("a/+", "a/b/c"));
        assert!(!topic_matches("#", "$SYS/x"));
        assert!(!topic_matches("+/x", "$SYS/x"));
        assert!(topic_matches("$SYS/#", "$SYS/x"));
        assert!(is_valid_filter("a/+/#"));
        assert!(!is_valid_filter("a/#/b"));
        assert!(!is_valid_filter("a/b+"));
        assert!(!is_valid_topic("a/+"));
    }

    #[test]
    fn test_publish_downgrades_and_retains() {
        let ctx = EngineContext::new(Settings::default());
        let tree = DefaultTopicTree::new();
        let mut req = SubscriptionRequest::new("c1", Some("s1"), "sport/#");
        req.max_reliability = Reliability::AtMostOnce;
        let sub = tree.create_subscription(&ctx, req.clone()).unwrap();
        assert_eq!(tree.create_subscription(&ctx, req).unwrap_err(), EngineError::DestinationInUse);

        let header = MessageHeader { reliability: Reliability::AtLeastOnce, retain: true, ..Default::default() };
        assert_eq!(tree.publish(&ctx, "sport/tennis", msg(&ctx, b"1-0", header.clone()), None).unwrap(), 1);
        assert_eq!(tree.publish(&ctx, "news", msg(&ctx, b"x", MessageHeader::default()), None).unwrap(), 0);
        assert_eq!(sub.queue().available(), 1);
        assert_eq!(tree.retained_count(), 1);

        let late = tree.create_subscription(&ctx, SubscriptionRequest::new("c2", Some("s2"), "sport/+")).unwrap();
        assert_eq!(tree.republish_retained(&ctx, &late).unwrap(), 1);

        tree.publish(&ctx, "sport/tennis", msg(&ctx, b"", header), None).unwrap();
        assert_eq!(tree.retained_count(), 0);
        assert_eq!(ctx.stats.retained_messages.count(), 0);
    }

    #[test]
    fn test_consumer_registration() {
        let ctx = EngineContext::new(Settings::default());
        let tree = DefaultTopicTree::new();
        let sub = tree.create_subscription(&ctx, SubscriptionRequest::new("c1", Some("s1"), "t")).unwrap();
        tree.register_consumer(&sub).unwrap();
        assert_eq!(tree.register_consumer(&sub), Err(EngineError::TooManyConsumers));
        assert_eq!(tree.destroy_subscription(&ctx, &sub), Err(EngineError::DestinationInUse));
        tree.unregister_consumer(&sub);
        tree.destroy_subscription(&ctx, &sub).unwrap();
        assert_eq!(tree.find_client_subscription("c1", "s1").unwrap_err(), EngineError::NotFound);
        assert_eq!(ctx.stats.subscriptions.count(), 0);
    }
}
