mod common;

use std::sync::{Arc, Barrier};
use std::thread;

use common::{connect, engine, engine_with, message, Collector};
use mqengine::client::ClientOptions;
use mqengine::consumer::ConsumerTarget;
use mqengine::engine::PROP_DISCARD_MESSAGES;
use mqengine::message::Reliability;
use mqengine::namespace::CreateMode;
use mqengine::policy::{PROP_CONCURRENT_CONSUMERS, PROP_MAX_MESSAGES};
use mqengine::session::SessionOptions;
use mqengine::types::{properties, ChangeType, DestinationType, Properties};
use mqengine::EngineError;

#[test]
fn test_concurrent_create_has_one_winner() {
    let engine = Arc::new(engine());
    let barrier = Arc::new(Barrier::new(8));
    let handles = (0..8)
        .map(|_| {
            let (engine, barrier) = (engine.clone(), barrier.clone());
            thread::spawn(move || {
                barrier.wait();
                let ctx = engine.context();
                let (nq, created) =
                    ctx.namespace.create_queue(ctx, "race", &Properties::default(), CreateMode::Declared).unwrap();
                (nq.queue().id(), created)
            })
        })
        .collect::<Vec<_>>();
    let results = handles.into_iter().map(|h| h.join().unwrap()).collect::<Vec<_>>();

    assert_eq!(results.iter().filter(|(_, created)| *created).count(), 1);
    let first = results[0].0;
    assert!(results.iter().all(|(id, _)| *id == first));
    assert_eq!(engine.context().namespace.len(), 1);
    assert_eq!(engine.context().stats.queues.count(), 1);
}

#[test]
fn test_destroy_requires_empty_queue_unless_discarding() {
    let engine = engine();
    let client = connect(&engine, "C", ClientOptions::empty());
    let session = engine.create_session(&client, SessionOptions::empty()).unwrap();
    engine.create_queue("E", &Properties::default()).unwrap();
    let producer = engine.create_producer(&session, DestinationType::Queue, "E").unwrap();
    engine.put_message(&producer, None, message(&engine, Reliability::AtMostOnce, "m")).unwrap();

    assert_eq!(engine.destroy_queue("E", true), Err(EngineError::DestinationInUse));
    engine.destroy_producer(&producer).unwrap();
    assert_eq!(engine.destroy_producer(&producer), Err(EngineError::Destroyed));

    assert_eq!(engine.destroy_queue("E", false), Err(EngineError::DestinationNotEmpty));
    engine.destroy_queue("E", true).unwrap();
    assert!(engine.context().namespace.get("E").is_none());
    assert_eq!(engine.destroy_queue("E", true), Err(EngineError::NotFound));
    assert_eq!(engine.context().stats.buffered_messages.count(), 0);
}

#[test]
fn test_auto_creation_can_be_disabled() {
    let engine = engine_with("[engine]\ndisable_auto_queue_creation = true\n");
    let client = connect(&engine, "C", ClientOptions::empty());
    let session = engine.create_session(&client, SessionOptions::empty()).unwrap();
    assert!(matches!(
        engine.create_producer(&session, DestinationType::Queue, "missing"),
        Err(EngineError::DestNotValid(_))
    ));
    engine.create_queue("present", &Properties::default()).unwrap();
    engine.create_producer(&session, DestinationType::Queue, "present").unwrap();
}

#[test]
fn test_declared_queues_from_settings() {
    let engine = engine_with("[queues.orders]\nmax_messages = 1\n");
    engine.start().unwrap();
    let q = engine.context().namespace.get("orders").unwrap();
    assert_eq!(q.queue().policy().max_messages(), 1);
    engine.shutdown();
}

#[test]
fn test_max_messages_limits_queue_depth() {
    let engine = engine();
    engine.create_queue("L", &properties([(PROP_MAX_MESSAGES, "1")])).unwrap();
    let client = connect(&engine, "C", ClientOptions::empty());
    let session = engine.create_session(&client, SessionOptions::empty()).unwrap();
    let producer = engine.create_producer(&session, DestinationType::Queue, "L").unwrap();
    engine.put_message(&producer, None, message(&engine, Reliability::AtMostOnce, "1")).unwrap();
    assert_eq!(
        engine.put_message(&producer, None, message(&engine, Reliability::AtMostOnce, "2")),
        Err(EngineError::DestinationFull)
    );
}

#[test]
fn test_exclusive_queue_refuses_second_consumer() {
    let engine = engine();
    let client = connect(&engine, "C", ClientOptions::empty());
    let session = engine.create_session(&client, SessionOptions::empty()).unwrap();
    let collector = Collector::new();
    engine.create_consumer(&session, ConsumerTarget::Queue("X"), collector.callback()).unwrap();
    engine.create_consumer(&session, ConsumerTarget::Queue("X"), collector.callback()).unwrap();

    let exclusive = properties([(PROP_CONCURRENT_CONSUMERS, "false")]);
    assert_eq!(
        engine.config_callback("Queue", "X", &exclusive, ChangeType::Update),
        Err(EngineError::TooManyConsumers)
    );

    engine.config_callback("Queue", "Y", &exclusive, ChangeType::Create).unwrap();
    engine.create_consumer(&session, ConsumerTarget::Queue("Y"), collector.callback()).unwrap();
    assert_eq!(
        engine.create_consumer(&session, ConsumerTarget::Queue("Y"), collector.callback()).map(|_| ()),
        Err(EngineError::TooManyConsumers)
    );
}

#[test]
fn test_config_callback_routing() {
    let engine = engine();
    let props = properties([(PROP_MAX_MESSAGES, "10")]);
    engine.config_callback("Queue", "A", &props, ChangeType::Create).unwrap();
    assert_eq!(engine.context().namespace.get("A").unwrap().queue().policy().max_messages(), 10);

    engine
        .config_callback("Queue", "A", &properties([(PROP_MAX_MESSAGES, "20")]), ChangeType::Update)
        .unwrap();
    assert_eq!(engine.context().namespace.get("A").unwrap().queue().policy().max_messages(), 20);
    assert!(matches!(
        engine.config_callback("Queue", "A", &properties([(PROP_MAX_MESSAGES, "lots")]), ChangeType::Update),
        Err(EngineError::InvalidParameter(_))
    ));

    let client = connect(&engine, "C", ClientOptions::empty());
    let session = engine.create_session(&client, SessionOptions::empty()).unwrap();
    engine
        .put_message_on_destination(&session, DestinationType::Queue, "A", None, message(&engine, Reliability::AtMostOnce, "m"))
        .unwrap();
    assert_eq!(
        engine.config_callback("Queue", "A", &Properties::default(), ChangeType::Delete),
        Err(EngineError::DestinationNotEmpty)
    );
    engine
        .config_callback("Queue", "A", &properties([(PROP_DISCARD_MESSAGES, "true")]), ChangeType::Delete)
        .unwrap();
    assert!(engine.context().namespace.get("A").is_none());

    assert_eq!(
        engine.config_callback("ClientState", "nobody", &Properties::default(), ChangeType::Delete),
        Err(EngineError::NotFound)
    );
    assert!(matches!(
        engine.config_callback("Subscription", "s", &Properties::default(), ChangeType::Delete),
        Err(EngineError::InvalidParameter(_))
    ));
    assert!(matches!(
        engine.config_callback("Gadget", "g", &Properties::default(), ChangeType::Create),
        Err(EngineError::InvalidParameter(_))
    ));
}

#[test]
fn test_send_can_be_disallowed() {
    let engine = engine();
    engine.create_queue("RO", &properties([(mqengine::policy::PROP_ALLOW_SEND, "false")])).unwrap();
    let client = connect(&engine, "C", ClientOptions::empty());
    let session = engine.create_session(&client, SessionOptions::empty()).unwrap();
    assert_eq!(
        engine.create_producer(&session, DestinationType::Queue, "RO").map(|_| ()),
        Err(EngineError::SendNotAllowed)
    );
}
