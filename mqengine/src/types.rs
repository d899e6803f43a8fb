use std::fmt;

use serde::{Deserialize, Serialize};

pub type DashMap<K, V> = dashmap::DashMap<K, V, ahash::RandomState>;
pub type HashMap<K, V> = std::collections::HashMap<K, V, ahash::RandomState>;
pub type HashSet<K> = std::collections::HashSet<K, ahash::RandomState>;

pub type ObjectId = u64;
pub type ClientId = String;
pub type DeliveryId = u32;

/// Admin object properties, keyed by property name
pub type Properties = HashMap<String, String>;

#[inline]
pub fn properties<I, K, V>(iter: I) -> Properties
where
    I: IntoIterator<Item = (K, V)>,
    K: Into<String>,
    V: Into<String>,
{
    iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DestinationType {
    Queue,
    Topic,
    Subscription,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeType {
    Create,
    Update,
    Delete,
}

/// Where a start or stop request came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    Client,
    Engine,
}

impl fmt::Display for DestinationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DestinationType::Queue => write!(f, "queue"),
            DestinationType::Topic => write!(f, "topic"),
            DestinationType::Subscription => write!(f, "subscription"),
        }
    }
}
