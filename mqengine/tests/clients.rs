mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use common::{connect, engine, engine_with, message, Collector};
use mqengine::async_data::Completion;
use mqengine::client::{ClientHandle, ClientOptions, ClientRequest, OpState};
use mqengine::consumer::{AckOption, ConsumerTarget};
use mqengine::message::Reliability;
use mqengine::session::SessionOptions;
use mqengine::types::{DestinationType, Properties};
use mqengine::utils::timestamp_secs;
use mqengine::EngineError;

#[test]
fn test_client_id_required() {
    let engine = engine();
    assert_eq!(
        engine.create_client_state(ClientRequest::new("", ClientOptions::empty()), None).map(|_| ()),
        Err(EngineError::ClientIdRequired)
    );
}

#[test]
fn test_second_connect_is_refused_without_steal() {
    let engine = engine();
    let _c = connect(&engine, "X", ClientOptions::empty());
    assert_eq!(
        engine.create_client_state(ClientRequest::new("X", ClientOptions::empty()), None).map(|_| ()),
        Err(EngineError::ClientIdInUse)
    );
    assert_eq!(mqengine::error::last_error(), Some(EngineError::ClientIdInUse));
}

#[test]
fn test_durable_client_becomes_zombie_and_resumes() {
    let engine = engine();
    let client = connect(&engine, "D", ClientOptions::DURABLE);
    client.add_unreleased_delivery_id(7).unwrap();
    let _session = engine.create_session(&client, SessionOptions::empty()).unwrap();

    assert_eq!(engine.destroy_client_state(&client, false, None).unwrap(), Completion::Done(()));
    assert_eq!(client.op_state(), OpState::Zombie);
    assert_eq!(client.session_count(), 0);
    assert_eq!(engine.context().stats.zombie_client_states.count(), 1);
    assert_eq!(engine.context().clients.len(), 1);
    assert_eq!(engine.destroy_client_state(&client, false, None), Err(EngineError::Destroyed));

    let created = engine
        .create_client_state(ClientRequest::new("D", ClientOptions::DURABLE), None)
        .unwrap()
        .done()
        .unwrap();
    assert!(created.resumed);
    assert!(Arc::ptr_eq(&created.client, &client));
    assert_eq!(client.op_state(), OpState::Active);
    assert_eq!(client.list_unreleased_delivery_ids(), vec![7]);
    assert_eq!(engine.context().stats.zombie_client_states.count(), 0);
}

#[test]
fn test_clean_start_discards_zombie() {
    let engine = engine();
    let client = connect(&engine, "D", ClientOptions::DURABLE);
    client.add_unreleased_delivery_id(3).unwrap();
    engine.destroy_client_state(&client, false, None).unwrap();

    let created = engine
        .create_client_state(ClientRequest::new("D", ClientOptions::DURABLE | ClientOptions::CLEANSTART), None)
        .unwrap()
        .done()
        .unwrap();
    assert!(!created.resumed);
    assert!(!Arc::ptr_eq(&created.client, &client));
    assert!(created.client.list_unreleased_delivery_ids().is_empty());
    assert_eq!(engine.context().stats.client_states.count(), 1);
}

#[test]
fn test_discard_skips_zombie_state() {
    let engine = engine();
    let client = connect(&engine, "D", ClientOptions::DURABLE);
    engine.destroy_client_state(&client, true, None).unwrap();
    assert!(engine.context().clients.get("D").is_none());
    assert_eq!(engine.context().stats.client_states.count(), 0);
}

#[test]
fn test_steal_takes_over_active_client() {
    let engine = engine();
    let stolen = Arc::new(AtomicUsize::new(0));
    let s = stolen.clone();
    let victim = engine
        .create_client_state(
            ClientRequest::new("S", ClientOptions::empty()).steal_callback(Arc::new(move |_c: &ClientHandle| {
                s.fetch_add(1, Ordering::SeqCst);
            })),
            None,
        )
        .unwrap()
        .done()
        .unwrap()
        .client;
    let session = engine.create_session(&victim, SessionOptions::empty()).unwrap();

    let created = engine
        .create_client_state(ClientRequest::new("S", ClientOptions::CLIENTID_STEAL), None)
        .unwrap()
        .done()
        .unwrap();
    assert_eq!(stolen.load(Ordering::SeqCst), 1);
    assert!(!created.resumed);
    assert!(!Arc::ptr_eq(&created.client, &victim));
    assert!(session.is_destroyed());
    assert_eq!(victim.op_state(), OpState::Disconnecting);
    assert_eq!(engine.context().stats.client_states.count(), 1);
}

#[test]
fn test_steal_of_durable_client_resumes_its_state() {
    let engine = engine();
    let victim = connect(&engine, "S", ClientOptions::DURABLE);
    let created = engine
        .create_client_state(ClientRequest::new("S", ClientOptions::CLIENTID_STEAL | ClientOptions::INHERIT_DURABILITY), None)
        .unwrap()
        .done()
        .unwrap();
    assert!(created.resumed);
    assert!(Arc::ptr_eq(&created.client, &victim));
    assert!(created.client.is_durable());
}

#[test]
fn test_steal_checks_user() {
    let engine = engine();
    engine
        .create_client_state(ClientRequest::new("U", ClientOptions::empty()).user_id("alice"), None)
        .unwrap();
    let opts = ClientOptions::CLIENTID_STEAL | ClientOptions::CHECK_USER_STEAL;
    assert_eq!(
        engine.create_client_state(ClientRequest::new("U", opts).user_id("bob"), None).map(|_| ()),
        Err(EngineError::ClientIdInUse)
    );
    let created = engine
        .create_client_state(ClientRequest::new("U", opts).user_id("alice"), None)
        .unwrap()
        .done()
        .unwrap();
    assert_eq!(created.client.user_id(), Some("alice"));
}

#[test]
fn test_destroy_disconnected_client_state() {
    let engine = engine();
    let client = connect(&engine, "D", ClientOptions::DURABLE);
    assert_eq!(engine.destroy_disconnected_client_state("nobody"), Err(EngineError::NotFound));
    assert_eq!(engine.destroy_disconnected_client_state("D"), Err(EngineError::ClientIdInUse));

    engine.destroy_client_state(&client, false, None).unwrap();
    engine.destroy_disconnected_client_state("D").unwrap();
    assert!(engine.context().clients.is_empty());
    assert_eq!(engine.context().stats.zombie_client_states.count(), 0);
}

#[test]
fn test_expired_zombies_are_reaped() {
    let engine = engine_with("[engine]\nclient_expiry_interval = \"1s\"\n");
    let a = connect(&engine, "A", ClientOptions::DURABLE);
    let _b = connect(&engine, "B", ClientOptions::DURABLE);
    engine.destroy_client_state(&a, false, None).unwrap();
    assert!(a.expiry_time().is_some());

    let clients = &engine.context().clients;
    assert_eq!(clients.reap_expired(timestamp_secs() - 10), 0);
    assert_eq!(clients.reap_expired(timestamp_secs() + 10), 1);
    assert!(clients.get("A").is_none());
    assert!(clients.get("B").is_some());
}

#[test]
fn test_will_message_published_on_disconnect() {
    let engine = engine();
    let listener = connect(&engine, "L", ClientOptions::empty());
    let session = engine.create_session(&listener, SessionOptions::empty()).unwrap();
    let collector = Collector::new();
    engine
        .create_consumer(
            &session,
            ConsumerTarget::Topic { topic: "will/+", max_reliability: Reliability::AtMostOnce },
            collector.callback(),
        )
        .unwrap();
    engine.start_message_delivery(&session).unwrap();

    let client = connect(&engine, "W", ClientOptions::empty());
    assert!(client.set_will_message("will/#", message(&engine, Reliability::AtMostOnce, "bye"), Duration::ZERO, 0).is_err());
    client.set_will_message("will/W", message(&engine, Reliability::AtMostOnce, "bye"), Duration::ZERO, 0).unwrap();
    assert!(client.has_will_message());
    engine.destroy_client_state(&client, false, None).unwrap();

    assert_eq!(collector.len(), 1);
    assert_eq!(collector.payloads()[0].as_ref(), b"bye");
}

#[test]
fn test_unset_will_message() {
    let engine = engine();
    let client = connect(&engine, "W", ClientOptions::empty());
    assert_eq!(client.unset_will_message(), Err(EngineError::NotFound));
    client.set_will_message("t", message(&engine, Reliability::AtMostOnce, "x"), Duration::ZERO, 0).unwrap();
    client.unset_will_message().unwrap();
    assert!(!client.has_will_message());
}

#[test]
fn test_unreleased_delivery_ids() {
    let engine = engine();
    let client = connect(&engine, "C", ClientOptions::empty());
    assert_eq!(client.add_unreleased_delivery_id(0), Err(EngineError::ArgNotValid));
    client.add_unreleased_delivery_id(5).unwrap();
    client.add_unreleased_delivery_id(9).unwrap();
    let mut ids = client.list_unreleased_delivery_ids();
    ids.sort_unstable();
    assert_eq!(ids, vec![5, 9]);
    client.remove_unreleased_delivery_id(5).unwrap();
    assert_eq!(client.remove_unreleased_delivery_id(5), Err(EngineError::NotFound));
}

#[test]
fn test_consumer_outlives_destroy_until_acks_resolve() {
    let engine = engine();
    let client = connect(&engine, "C", ClientOptions::empty());
    let session = engine.create_session(&client, SessionOptions::empty()).unwrap();
    let collector = Collector::new();
    let consumer = engine.create_consumer(&session, ConsumerTarget::Queue("Q"), collector.callback()).unwrap();
    engine.start_message_delivery(&session).unwrap();
    engine
        .put_message_on_destination(&session, DestinationType::Queue, "Q", None, message(&engine, Reliability::AtLeastOnce, "m"))
        .unwrap();
    assert_eq!(collector.len(), 1);

    let stats = &engine.context().stats;
    assert_eq!(engine.destroy_consumer(&consumer, None).unwrap(), Completion::Done(()));
    assert!(consumer.is_destroyed());
    assert_eq!(stats.zombie_consumers.count(), 1);
    assert_eq!(stats.consumers.count(), 1);
    assert_eq!(session.consumer_count(), 1);

    engine.confirm_message_delivery(&session, None, &collector.handle(0), AckOption::Consumed).unwrap();
    assert_eq!(stats.zombie_consumers.count(), 0);
    assert_eq!(stats.consumers.count(), 0);
    assert_eq!(session.consumer_count(), 0);
    assert_eq!(client.delivery_ids_in_use(), 0);
}

#[test]
fn test_session_destroy_returns_unacknowledged_messages() {
    let engine = engine();
    let client = connect(&engine, "C", ClientOptions::empty());
    let session = engine.create_session(&client, SessionOptions::empty()).unwrap();
    let collector = Collector::new();
    engine.create_consumer(&session, ConsumerTarget::Queue("Q"), collector.callback()).unwrap();
    engine.start_message_delivery(&session).unwrap();
    engine
        .put_message_on_destination(&session, DestinationType::Queue, "Q", None, message(&engine, Reliability::AtLeastOnce, "m"))
        .unwrap();

    assert_eq!(engine.destroy_session(&session, None).unwrap(), Completion::Done(()));
    let q = engine.context().namespace.get("Q").unwrap();
    assert_eq!(q.queue().available(), 1);
    assert_eq!(q.queue().inflight(), 0);
    assert_eq!(client.session_count(), 0);
    assert_eq!(client.delivery_ids_in_use(), 0);
    assert_eq!(engine.context().stats.consumers.count(), 0);
    assert_eq!(engine.destroy_session(&session, None), Err(EngineError::Destroyed));
}

#[test]
fn test_temporary_queues_belong_to_their_client() {
    let engine = engine();
    let owner = connect(&engine, "O", ClientOptions::empty());
    let other = connect(&engine, "P", ClientOptions::empty());
    engine.create_temporary_queue(&owner, "tmp", &Properties::default()).unwrap();
    assert_eq!(owner.temporary_queue_count(), 1);
    assert_eq!(
        engine.create_temporary_queue(&other, "tmp", &Properties::default()).map(|_| ()),
        Err(EngineError::DestinationInUse)
    );
    assert_eq!(engine.destroy_queue("tmp", true), Err(EngineError::DestTypeNotValid));

    let session = engine.create_session(&other, SessionOptions::empty()).unwrap();
    assert_eq!(
        engine.create_consumer(&session, ConsumerTarget::Queue("tmp"), Collector::new().callback()).map(|_| ()),
        Err(EngineError::NotAuthorized)
    );

    engine.destroy_client_state(&owner, false, None).unwrap();
    assert!(engine.context().namespace.get("tmp").is_none());
}
