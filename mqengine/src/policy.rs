use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;

use crate::conf::Settings;
use crate::error::{EngineError, Result};
use crate::types::{ChangeType, Properties};

pub const PROP_MAX_MESSAGES: &str = "MaxMessages";
pub const PROP_CONCURRENT_CONSUMERS: &str = "ConcurrentConsumers";
pub const PROP_ALLOW_SEND: &str = "AllowSend";
pub const PROP_MAX_MESSAGE_TTL: &str = "MaxMessageTimeToLive";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PolicySettings {
    pub max_messages: usize,
    pub concurrent_consumers: bool,
    pub allow_send: bool,
    /// Seconds, 0 for unlimited
    pub max_message_ttl: u32,
}

impl PolicySettings {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            max_messages: settings.engine.default_max_messages,
            concurrent_consumers: true,
            allow_send: true,
            max_message_ttl: 0,
        }
    }

    /// Overlay recognised properties, unknown keys are ignored
    pub fn merged(&self, props: &Properties) -> Result<Self> {
        let mut next = self.clone();
        if let Some(v) = props.get(PROP_MAX_MESSAGES) {
            next.max_messages = parse(PROP_MAX_MESSAGES, v)?;
        }
        if let Some(v) = props.get(PROP_CONCURRENT_CONSUMERS) {
            next.concurrent_consumers = parse_bool(PROP_CONCURRENT_CONSUMERS, v)?;
        }
        if let Some(v) = props.get(PROP_ALLOW_SEND) {
            next.allow_send = parse_bool(PROP_ALLOW_SEND, v)?;
        }
        if let Some(v) = props.get(PROP_MAX_MESSAGE_TTL) {
            next.max_message_ttl = parse(PROP_MAX_MESSAGE_TTL, v)?;
        }
        Ok(next)
    }
}

fn parse<T: std::str::FromStr>(name: &str, v: &str) -> Result<T> {
    v.trim().parse::<T>().map_err(|_| EngineError::InvalidParameter(format!("{name}={v}")))
}

fn parse_bool(name: &str, v: &str) -> Result<bool> {
    match v.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" => Ok(false),
        _ => Err(EngineError::InvalidParameter(format!("{name}={v}"))),
    }
}

/// Policy attached to a destination; updated in place by admin changes.
#[derive(Debug)]
pub struct PolicyInfo {
    name: String,
    default: AtomicBool,
    settings: RwLock<PolicySettings>,
}

impl PolicyInfo {
    pub fn new(name: impl Into<String>, settings: PolicySettings) -> Arc<Self> {
        Arc::new(Self { name: name.into(), default: AtomicBool::new(false), settings: RwLock::new(settings) })
    }

    /// A private copy of the engine default, still flagged as default
    pub fn default_for(name: impl Into<String>, settings: &Settings) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            default: AtomicBool::new(true),
            settings: RwLock::new(PolicySettings::from_settings(settings)),
        })
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn is_default(&self) -> bool {
        self.default.load(Ordering::SeqCst)
    }

    #[inline]
    pub fn settings(&self) -> PolicySettings {
        self.settings.read().clone()
    }

    #[inline]
    pub fn max_messages(&self) -> usize {
        self.settings.read().max_messages
    }

    #[inline]
    pub fn concurrent_consumers(&self) -> bool {
        self.settings.read().concurrent_consumers
    }

    #[inline]
    pub fn allow_send(&self) -> bool {
        self.settings.read().allow_send
    }

    #[inline]
    pub fn max_message_ttl(&self) -> u32 {
        self.settings.read().max_message_ttl
    }

    #[inline]
    pub fn replace(&self, settings: PolicySettings) {
        *self.settings.write() = settings;
        self.default.store(false, Ordering::SeqCst);
    }

    pub fn update(&self, props: &Properties) -> Result<()> {
        let next = self.settings().merged(props)?;
        self.replace(next);
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceType {
    Queue,
    Topic,
    Subscription,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Send,
    Receive,
    Browse,
    Publish,
    Subscribe,
}

#[derive(Debug, Clone, Copy)]
pub struct SecurityContext<'a> {
    pub client_id: &'a str,
    pub user_id: Option<&'a str>,
}

/// Authorization gate consulted before producers, consumers and publishes.
pub trait Security: Send + Sync {
    /// `Ok(Some(policy))` supplies the policy governing the resource, `Ok(None)`
    /// leaves the destination's own policy in charge
    fn validate_policy(
        &self,
        sctx: &SecurityContext<'_>,
        resource: ResourceType,
        name: &str,
        action: Action,
    ) -> Result<Option<Arc<PolicyInfo>>>;

    fn policy_changed(&self, _name: &str, _props: &Properties, _change: ChangeType) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct AllowAll;

impl Security for AllowAll {
    #[inline]
    fn validate_policy(
        &self,
        _sctx: &SecurityContext<'_>,
        _resource: ResourceType,
        _name: &str,
        _action: Action,
    ) -> Result<Option<Arc<PolicyInfo>>> {
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::properties;

    #[test]
    fn test_merge_properties() {
        let base = PolicySettings::from_settings(&Settings::default());
        assert_eq!(base.max_messages, 5000);
        let next = base
            .merged(&properties([(PROP_MAX_MESSAGES, "10"), (PROP_CONCURRENT_CONSUMERS, "False"), ("Other", "x")]))
            .unwrap();
        assert_eq!(next.max_messages, 10);
        assert!(!next.concurrent_consumers);
        assert!(next.allow_send);
        assert!(matches!(
            base.merged(&properties([(PROP_ALLOW_SEND, "maybe")])),
            Err(EngineError::InvalidParameter(_))
        ));
    }

    #[test]
    fn test_update_clears_default_flag() {
        let p = PolicyInfo::default_for("q", &Settings::default());
        assert!(p.is_default());
        p.update(&properties([(PROP_MAX_MESSAGE_TTL, "30")])).unwrap();
        assert!(!p.is_default());
        assert_eq!(p.max_message_ttl(), 30);
        assert_eq!(p.name(), "q");
    }
}
