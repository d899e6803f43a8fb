//! Engine object and message statistics.
//!
//! Counters move on create and on final teardown, so after a workload has
//! been fully torn down every object gauge is back at zero. Tests lean on
//! this to prove that recursive destroy released everything it should.

use serde::Serialize;
use serde_json::json;

use crate::utils::Counter;

#[derive(Serialize, Debug, Default)]
pub struct Stats {
    pub client_states: Counter,
    pub zombie_client_states: Counter,
    pub sessions: Counter,
    pub producers: Counter,
    pub consumers: Counter,
    pub zombie_consumers: Counter,
    pub queues: Counter,
    pub subscriptions: Counter,
    pub messages: Counter,
    pub buffered_messages: Counter,
    pub inflight_messages: Counter,
    pub expired_messages: Counter,
    pub retained_messages: Counter,
    pub transactions: Counter,
    pub heuristic_transactions: Counter,
    pub deliveries: Counter,
}

impl Stats {
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn to_json(&self) -> serde_json::Value {
        json!({
            "client_states.count": self.client_states.count(),
            "client_states.max": self.client_states.max(),
            "zombie_client_states.count": self.zombie_client_states.count(),
            "sessions.count": self.sessions.count(),
            "sessions.max": self.sessions.max(),
            "producers.count": self.producers.count(),
            "consumers.count": self.consumers.count(),
            "consumers.max": self.consumers.max(),
            "zombie_consumers.count": self.zombie_consumers.count(),
            "queues.count": self.queues.count(),
            "subscriptions.count": self.subscriptions.count(),
            "messages.count": self.messages.count(),
            "messages.max": self.messages.max(),
            "buffered_messages.count": self.buffered_messages.count(),
            "buffered_messages.max": self.buffered_messages.max(),
            "inflight_messages.count": self.inflight_messages.count(),
            "expired_messages.count": self.expired_messages.count(),
            "retained_messages.count": self.retained_messages.count(),
            "transactions.count": self.transactions.count(),
            "heuristic_transactions.count": self.heuristic_transactions.count(),
            "deliveries.count": self.deliveries.count(),
        })
    }
}
