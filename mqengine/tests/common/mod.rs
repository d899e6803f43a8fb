#![allow(dead_code)]

use std::sync::Arc;

use bytes::Bytes;
use once_cell::sync::Lazy;
use parking_lot::Mutex;

use mqengine::client::{ClientHandle, ClientOptions, ClientRequest};
use mqengine::conf::Settings;
use mqengine::consumer::{Delivery, DeliveryHandle, MessageCallback};
use mqengine::engine::Engine;
use mqengine::message::{AreaType, MessageArea, MessageHandle, MessageHeader, Reliability};
use mqengine::types::ObjectId;

static LOGGER: Lazy<()> = Lazy::new(|| {
    let level = if std::env::var("MQENGINE_TEST_LOG").is_ok() { log::LevelFilter::Debug } else { log::LevelFilter::Warn };
    let _ = simple_logger::SimpleLogger::new().with_level(level).init();
});

pub fn engine() -> Engine {
    Lazy::force(&LOGGER);
    Engine::new(Settings::default())
}

pub fn engine_with(toml: &str) -> Engine {
    Lazy::force(&LOGGER);
    Engine::new(Settings::from_toml_str(toml).unwrap())
}

pub fn connect(engine: &Engine, client_id: &str, options: ClientOptions) -> ClientHandle {
    let created = engine.create_client_state(ClientRequest::new(client_id, options), None).unwrap();
    created.done().unwrap().client
}

pub fn message(engine: &Engine, reliability: Reliability, payload: &'static str) -> MessageHandle {
    engine.create_message(
        MessageHeader { reliability, ..Default::default() },
        vec![MessageArea { area: AreaType::Payload, data: Bytes::from_static(payload.as_bytes()) }],
    )
}

/// Records every delivery together with the consumer it went to
#[derive(Clone, Default)]
pub struct Collector {
    deliveries: Arc<Mutex<Vec<(ObjectId, Delivery)>>>,
}

impl Collector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn callback(&self) -> MessageCallback {
        let deliveries = self.deliveries.clone();
        Arc::new(move |c, delivery| {
            deliveries.lock().push((c.id(), delivery));
            true
        })
    }

    pub fn len(&self) -> usize {
        self.deliveries.lock().len()
    }

    pub fn consumer_ids(&self) -> Vec<ObjectId> {
        self.deliveries.lock().iter().map(|(id, _)| *id).collect()
    }

    pub fn payloads(&self) -> Vec<Bytes> {
        self.deliveries.lock().iter().filter_map(|(_, d)| d.message.payload().cloned()).collect()
    }

    pub fn delivery_counts(&self) -> Vec<u32> {
        self.deliveries.lock().iter().map(|(_, d)| d.delivery_count).collect()
    }

    pub fn handle(&self, idx: usize) -> DeliveryHandle {
        self.deliveries.lock()[idx].1.handle.clone().unwrap()
    }
}
