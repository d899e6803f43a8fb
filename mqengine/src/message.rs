use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::stats::Stats;
use crate::types::ObjectId;

pub type MessageHandle = Arc<Message>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Reliability {
    AtMostOnce,
    AtLeastOnce,
    ExactlyOnce,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Persistence {
    NonPersistent,
    Persistent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AreaType {
    Properties,
    Payload,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageHeader {
    pub reliability: Reliability,
    pub persistence: Persistence,
    pub priority: u8,
    /// Expiry in seconds since the epoch, 0 for never
    pub expiry: u32,
    pub retain: bool,
}

impl Default for MessageHeader {
    fn default() -> Self {
        Self {
            reliability: Reliability::AtMostOnce,
            persistence: Persistence::NonPersistent,
            priority: 4,
            expiry: 0,
            retain: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageArea {
    pub area: AreaType,
    pub data: Bytes,
}

/// An immutable message shared by every queue holding it.
///
/// The only mutable field is the expiry, which a producer may tighten
/// once before the message is first enqueued.
pub struct Message {
    id: ObjectId,
    header: MessageHeader,
    expiry: AtomicU32,
    enqueued: AtomicBool,
    areas: Vec<MessageArea>,
    stats: Arc<Stats>,
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("id", &self.id)
            .field("header", &self.header)
            .field("expiry", &self.expiry())
            .field("areas", &self.areas.len())
            .finish()
    }
}

impl Drop for Message {
    fn drop(&mut self) {
        self.stats.messages.dec();
    }
}

impl Message {
    pub(crate) fn new(stats: &Arc<Stats>, id: ObjectId, header: MessageHeader, areas: Vec<MessageArea>) -> MessageHandle {
        stats.messages.inc();
        Arc::new(Message {
            id,
            expiry: AtomicU32::new(header.expiry),
            header,
            enqueued: AtomicBool::new(false),
            areas,
            stats: stats.clone(),
        })
    }

    /// A fresh message sharing this one's areas, with a different reliability
    pub(crate) fn copy_with_reliability(&self, id: ObjectId, reliability: Reliability) -> MessageHandle {
        let mut header = self.header.clone();
        header.reliability = reliability;
        header.expiry = self.expiry();
        Message::new(&self.stats, id, header, self.areas.clone())
    }

    #[inline]
    pub fn id(&self) -> ObjectId {
        self.id
    }

    #[inline]
    pub fn header(&self) -> &MessageHeader {
        &self.header
    }

    #[inline]
    pub fn reliability(&self) -> Reliability {
        self.header.reliability
    }

    #[inline]
    pub fn is_persistent(&self) -> bool {
        self.header.persistence == Persistence::Persistent
    }

    #[inline]
    pub fn is_retained(&self) -> bool {
        self.header.retain
    }

    #[inline]
    pub fn areas(&self) -> &[MessageArea] {
        &self.areas
    }

    #[inline]
    pub fn area(&self, area: AreaType) -> Option<&Bytes> {
        self.areas.iter().find(|a| a.area == area).map(|a| &a.data)
    }

    #[inline]
    pub fn payload(&self) -> Option<&Bytes> {
        self.area(AreaType::Payload)
    }

    #[inline]
    pub fn expiry(&self) -> u32 {
        self.expiry.load(Ordering::SeqCst)
    }

    #[inline]
    pub fn is_expired(&self, now_secs: u32) -> bool {
        let expiry = self.expiry();
        expiry != 0 && expiry <= now_secs
    }

    /// Cap the expiry at `max_expiry`. Refused once the message has been enqueued.
    pub(crate) fn cap_expiry(&self, max_expiry: u32) -> bool {
        if self.enqueued.load(Ordering::SeqCst) {
            return false;
        }
        self.expiry
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |cur| {
                if cur == 0 || cur > max_expiry {
                    Some(max_expiry)
                } else {
                    None
                }
            })
            .is_ok()
    }

    #[inline]
    pub(crate) fn mark_enqueued(&self) {
        self.enqueued.store(true, Ordering::SeqCst);
    }

    /// Number of holders of this message
    #[inline]
    pub fn usage_count(self: &Arc<Self>) -> usize {
        Arc::strong_count(self)
    }

    pub fn to_json(&self) -> serde_json::Value {
        json!({
            "id": self.id,
            "reliability": format!("{:?}", self.header.reliability),
            "persistent": self.is_persistent(),
            "priority": self.header.priority,
            "expiry": self.expiry(),
            "retain": self.header.retain,
            "areas": self.areas.iter().map(|a| json!({"type": format!("{:?}", a.area), "len": a.data.len()})).collect::<Vec<_>>(),
        })
    }
}
