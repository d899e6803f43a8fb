#![deny(unsafe_code)]

use std::collections::BTreeMap;
use std::fmt;
use std::ops::Deref;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use config::{Config, File, FileFormat};
use serde::Deserialize;

use mqengine_utils::{deserialize_duration, deserialize_duration_option};

pub use self::logging::Log;

pub mod logging;

#[derive(Debug, Clone, Default)]
pub struct Options {
    /// Extra configuration file layered over the default search path
    pub cfg_name: Option<String>,
    /// Overrides `engine.disable_auto_queue_creation`
    pub disable_auto_queue_creation: Option<bool>,
}

#[derive(Clone)]
pub struct Settings(Arc<Inner>);

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Inner {
    #[serde(default)]
    pub engine: Engine,
    #[serde(default)]
    pub log: Log,
    #[serde(default)]
    pub queues: BTreeMap<String, QueueConfig>,
    #[serde(default, skip)]
    pub opts: Options,
}

impl Deref for Settings {
    type Target = Inner;
    fn deref(&self) -> &Self::Target {
        self.0.as_ref()
    }
}

impl Default for Settings {
    fn default() -> Self {
        Settings(Arc::new(Inner::default()))
    }
}

impl fmt::Debug for Settings {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Settings ...")?;
        Ok(())
    }
}

impl Settings {
    pub fn new(opts: Options) -> Result<Self> {
        let mut builder = Config::builder()
            .add_source(File::with_name("/etc/mqengine/mqengine").required(false))
            .add_source(File::with_name("mqengine").required(false));

        if let Some(cfg) = opts.cfg_name.as_ref() {
            builder = builder.add_source(File::with_name(cfg).required(false));
        }

        builder = builder.add_source(
            config::Environment::with_prefix("mqengine").separator("__").try_parsing(true),
        );

        let mut inner: Inner = builder.build()?.try_deserialize()?;
        Self::apply(&mut inner, opts);
        Ok(Self(Arc::new(inner)))
    }

    /// Settings from an in-memory TOML document, no files or environment involved
    pub fn from_toml_str(toml: &str) -> Result<Self> {
        let mut inner: Inner =
            Config::builder().add_source(File::from_str(toml, FileFormat::Toml)).build()?.try_deserialize()?;
        Self::apply(&mut inner, Options::default());
        Ok(Self(Arc::new(inner)))
    }

    fn apply(inner: &mut Inner, opts: Options) {
        //Command line configuration overriding file configuration
        if let Some(disable) = opts.disable_auto_queue_creation {
            inner.engine.disable_auto_queue_creation = disable;
        }
        if inner.engine.multi_consumer_batch_size == 0 {
            inner.engine.multi_consumer_batch_size = 1;
        }
        inner.opts = opts;
    }

    pub fn logs(&self) {
        log::debug!("Config info is {:?}", self.0);
        log::info!("disable_auto_queue_creation is {}", self.engine.disable_auto_queue_creation);
        log::info!("multi_consumer_batch_size is {}", self.engine.multi_consumer_batch_size);
        log::info!("max_delivery_ids is {}", self.engine.max_delivery_ids);
        log::info!("declared queues: {}", self.queues.len());
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Engine {
    #[serde(default)]
    pub disable_auto_queue_creation: bool,

    //Messages handed to one consumer of a multi-consumer queue before moving on to the next.
    #[serde(default = "Engine::multi_consumer_batch_size_default")]
    pub multi_consumer_batch_size: u32,

    //Per-client delivery ids available for messages awaiting acknowledgement.
    #[serde(default = "Engine::max_delivery_ids_default")]
    pub max_delivery_ids: u32,

    #[serde(default = "Engine::restart_delivery_delay_default", deserialize_with = "deserialize_duration")]
    pub restart_delivery_delay: Duration,

    #[serde(default = "Engine::default_max_messages_default")]
    pub default_max_messages: usize,

    //Applied to durable client states that do not set their own expiry.
    #[serde(default, deserialize_with = "deserialize_duration_option")]
    pub client_expiry_interval: Option<Duration>,

    #[serde(default = "Engine::reaper_interval_default", deserialize_with = "deserialize_duration")]
    pub reaper_interval: Duration,
}

impl Default for Engine {
    #[inline]
    fn default() -> Self {
        Self {
            disable_auto_queue_creation: false,
            multi_consumer_batch_size: Self::multi_consumer_batch_size_default(),
            max_delivery_ids: Self::max_delivery_ids_default(),
            restart_delivery_delay: Self::restart_delivery_delay_default(),
            default_max_messages: Self::default_max_messages_default(),
            client_expiry_interval: None,
            reaper_interval: Self::reaper_interval_default(),
        }
    }
}

impl Engine {
    fn multi_consumer_batch_size_default() -> u32 {
        5
    }
    fn max_delivery_ids_default() -> u32 {
        128
    }
    fn restart_delivery_delay_default() -> Duration {
        Duration::from_millis(10)
    }
    fn default_max_messages_default() -> usize {
        5000
    }
    fn reaper_interval_default() -> Duration {
        Duration::from_secs(60)
    }
}

/// A queue object declared by the administrator
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
pub struct QueueConfig {
    #[serde(default)]
    pub max_messages: Option<usize>,
    #[serde(default)]
    pub concurrent_consumers: Option<bool>,
    #[serde(default)]
    pub allow_send: Option<bool>,
    #[serde(default)]
    pub max_message_time_to_live: Option<u32>,
}

impl QueueConfig {
    /// Property form consumed by the queue namespace
    pub fn to_properties(&self) -> Vec<(&'static str, String)> {
        let mut props = Vec::new();
        if let Some(v) = self.max_messages {
            props.push(("MaxMessages", v.to_string()));
        }
        if let Some(v) = self.concurrent_consumers {
            props.push(("ConcurrentConsumers", v.to_string()));
        }
        if let Some(v) = self.allow_send {
            props.push(("AllowSend", v.to_string()));
        }
        if let Some(v) = self.max_message_time_to_live {
            props.push(("MaxMessageTimeToLive", v.to_string()));
        }
        props
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let s = Settings::default();
        assert!(!s.engine.disable_auto_queue_creation);
        assert_eq!(s.engine.multi_consumer_batch_size, 5);
        assert_eq!(s.engine.restart_delivery_delay, Duration::from_millis(10));
        assert!(s.queues.is_empty());
        assert!(s.log.to.console());
    }

    #[test]
    fn test_from_toml_str() {
        let s = Settings::from_toml_str(
            r#"
            [engine]
            disable_auto_queue_creation = true
            multi_consumer_batch_size = 3
            restart_delivery_delay = "50ms"
            client_expiry_interval = "1h"

            [log]
            to = "off"
            level = "debug"

            [queues.orders]
            max_messages = 100
            concurrent_consumers = false
            "#,
        )
        .unwrap();
        assert!(s.engine.disable_auto_queue_creation);
        assert_eq!(s.engine.multi_consumer_batch_size, 3);
        assert_eq!(s.engine.restart_delivery_delay, Duration::from_millis(50));
        assert_eq!(s.engine.client_expiry_interval, Some(Duration::from_secs(3600)));
        assert!(s.log.to.off());
        assert_eq!(s.log.level.inner(), slog::Level::Debug);
        let orders = s.queues.get("orders").unwrap();
        assert_eq!(orders.max_messages, Some(100));
        assert_eq!(orders.concurrent_consumers, Some(false));
        assert_eq!(orders.to_properties().len(), 2);
    }

    #[test]
    fn test_zero_batch_size_is_clamped() {
        let s = Settings::from_toml_str("[engine]\nmulti_consumer_batch_size = 0\n").unwrap();
        assert_eq!(s.engine.multi_consumer_batch_size, 1);
    }
}
