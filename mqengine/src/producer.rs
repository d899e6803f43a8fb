//! Producers put messages onto a named queue or publish them to a topic.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde_json::json;

use crate::error::{EngineError, Result};
use crate::message::MessageHandle;
use crate::namespace::{NamedQueueHandle, OpenKind};
use crate::policy::{Action, PolicyInfo, ResourceType, SecurityContext};
use crate::refcount::{Release, UseCount};
use crate::session::{SessionHandle, SessionOptions};
use crate::topic::is_valid_topic;
use crate::transaction::TransactionHandle;
use crate::types::{DestinationType, ObjectId};
use crate::utils::timestamp_secs;

pub type ProducerHandle = Arc<Producer>;

pub enum ProducerDest {
    Queue(NamedQueueHandle),
    Topic(String),
}

impl fmt::Debug for ProducerDest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProducerDest::Queue(nq) => write!(f, "queue:{}", nq.name()),
            ProducerDest::Topic(t) => write!(f, "topic:{}", t),
        }
    }
}

pub struct Producer {
    id: ObjectId,
    session: SessionHandle,
    dest: ProducerDest,
    policy: Arc<PolicyInfo>,
    use_count: UseCount,
    destroyed: AtomicBool,
}

impl fmt::Debug for Producer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Producer {{ id: {}, session: {}, dest: {:?} }}", self.id, self.session.id(), self.dest)
    }
}

impl Producer {
    pub(crate) fn create(session: &SessionHandle, dest_type: DestinationType, name: &str) -> Result<ProducerHandle> {
        if session.options().contains(SessionOptions::BROWSE_ONLY) {
            return Err(EngineError::InvalidOperation);
        }
        let ctx = session.ctx();
        let client = session.client();
        let sctx = SecurityContext { client_id: client.client_id(), user_id: client.user_id() };
        let (dest, policy) = match dest_type {
            DestinationType::Queue => {
                ctx.security.validate_policy(&sctx, ResourceType::Queue, name, Action::Send)?;
                let nq = ctx.namespace.open_queue(ctx, name, OpenKind::Producer, client.client_id())?;
                let policy = nq.queue().policy().clone();
                (ProducerDest::Queue(nq), policy)
            }
            DestinationType::Topic => {
                if !is_valid_topic(name) {
                    return Err(EngineError::DestNotValid(name.into()));
                }
                let policy = ctx
                    .security
                    .validate_policy(&sctx, ResourceType::Topic, name, Action::Publish)?
                    .unwrap_or_else(|| PolicyInfo::default_for(name, &ctx.settings));
                (ProducerDest::Topic(name.into()), policy)
            }
            DestinationType::Subscription => return Err(EngineError::DestTypeNotValid),
        };

        let producer = Arc::new(Producer {
            id: ctx.next_id(),
            session: session.clone(),
            dest,
            policy,
            use_count: UseCount::new(1),
            destroyed: AtomicBool::new(false),
        });
        if !session.acquire() {
            producer.release_dest();
            return Err(EngineError::Destroyed);
        }
        if let Err(e) = session.add_producer(producer.clone()) {
            producer.release_dest();
            session.release();
            return Err(e);
        }
        ctx.stats.producers.inc();
        log::debug!("{:?} created", producer);
        Ok(producer)
    }

    #[inline]
    pub fn id(&self) -> ObjectId {
        self.id
    }

    #[inline]
    pub fn dest(&self) -> &ProducerDest {
        &self.dest
    }

    #[inline]
    pub fn policy(&self) -> &Arc<PolicyInfo> {
        &self.policy
    }

    #[inline]
    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    /// Put a message, within `tran` if given. A topic put returns the number
    /// of subscriptions it reached, a queue put returns 1.
    pub fn put(&self, tran: Option<&TransactionHandle>, msg: MessageHandle) -> Result<usize> {
        if self.is_destroyed() || !self.use_count.acquire() {
            return Err(EngineError::Destroyed);
        }
        let _guard = scopeguard::guard((), |_| self.release());

        if let Some(tran) = tran {
            if tran.session_id() != Some(self.session.id()) {
                return Err(EngineError::TransactionInUse);
            }
            tran.begin_operation()?;
        }
        let res = self.put_inner(tran, msg);
        if let Some(tran) = tran {
            tran.end_operation();
        }
        res
    }

    fn put_inner(&self, tran: Option<&TransactionHandle>, msg: MessageHandle) -> Result<usize> {
        let ttl = self.policy.max_message_ttl();
        if ttl > 0 {
            let cap = (timestamp_secs() as u32).saturating_add(ttl);
            if msg.cap_expiry(cap) {
                log::trace!("{:?} capped expiry of message {} at {}", self, msg.id(), cap);
            }
        }
        let ctx = self.session.ctx();
        match &self.dest {
            ProducerDest::Queue(nq) => nq.queue().put(msg, tran).map(|_| 1),
            ProducerDest::Topic(topic) => ctx.topics.publish(ctx, topic, msg, tran),
        }
    }

    pub fn destroy(&self) -> Result<()> {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return Err(EngineError::Destroyed);
        }
        self.session.remove_producer(self.id);
        self.release();
        Ok(())
    }

    fn release(&self) {
        match self.use_count.release() {
            Release::Held => {}
            Release::Last => {
                self.release_dest();
                self.session.ctx().stats.producers.dec();
                log::debug!("{:?} freed", self);
                self.session.release();
            }
            Release::Underflow => {
                self.session.ctx().diag.ffdc("producer_release", false, "producer use count underflow", self.to_json())
            }
        }
    }

    fn release_dest(&self) {
        if let ProducerDest::Queue(nq) = &self.dest {
            let ctx = self.session.ctx();
            ctx.namespace.release(ctx, nq, OpenKind::Producer);
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        json!({
            "id": self.id,
            "session": self.session.id(),
            "dest": format!("{:?}", self.dest),
            "policy": self.policy.name(),
            "use_count": self.use_count.get(),
            "destroyed": self.is_destroyed(),
        })
    }
}
