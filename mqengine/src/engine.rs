//! Public entry points.
//!
//! Every call checks that the engine has not been halted by a fatal
//! diagnostic and records the error it returns as the thread's last error.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::ThreadId;

use crate::async_data::{Completion, CompletionCallback};
use crate::client::{ClientHandle, ClientRequest, ClientState, Created};
use crate::conf::Settings;
use crate::consumer::{AckOption, ConsumerHandle, ConsumerTarget, DeliveryHandle, DeliveryStatus, MessageCallback};
use crate::context::EngineContext;
use crate::error::{finalize, EngineError, Result};
use crate::message::{Message, MessageArea, MessageHandle, MessageHeader};
use crate::namespace::{CreateMode, NamedQueueHandle};
use crate::producer::{Producer, ProducerHandle};
use crate::session::{SessionHandle, SessionOptions};
use crate::topic::{SubscriptionHandle, SubscriptionRequest};
use crate::transaction::{CreateGlobal, EndFlag, HeuristicOutcome, TransactionHandle, XaScan, Xid};
use crate::types::{ChangeType, DestinationType, Origin, Properties};
use crate::utils::timestamp_secs;

/// Admin property naming the owner of a subscription
pub const PROP_CLIENT_ID: &str = "ClientID";
/// Admin property allowing a queue delete to throw away buffered messages
pub const PROP_DISCARD_MESSAGES: &str = "DiscardMessages";

pub struct Engine {
    ctx: EngineContext,
    running: Arc<AtomicBool>,
}

impl Engine {
    pub fn new(settings: Settings) -> Self {
        Self::with_context(EngineContext::new(settings))
    }

    pub fn with_context(ctx: EngineContext) -> Self {
        Self { ctx, running: Arc::new(AtomicBool::new(false)) }
    }

    #[inline]
    pub fn context(&self) -> &EngineContext {
        &self.ctx
    }

    #[inline]
    fn call<T>(&self, f: impl FnOnce(&EngineContext) -> Result<T>) -> Result<T> {
        finalize(self.ctx.diag.check_running().and_then(|_| f(&self.ctx)))
    }

    /// Bring the namespace in line with the declared queues and start the
    /// zombie reaper
    pub fn start(&self) -> Result<()> {
        self.call(|ctx| {
            if self.running.swap(true, Ordering::SeqCst) {
                return Err(EngineError::RequestInProgress);
            }
            ctx.store.register_event_callback(Box::new(|ev| log::info!("store event, {:?}", ev)));
            ctx.namespace.reconcile(ctx, &ctx.settings.queues)?;
            if ctx.settings.engine.client_expiry_interval.is_some() {
                self.start_reaper();
            }
            log::info!("engine started, {} queues", ctx.namespace.len());
            Ok(())
        })
    }

    fn start_reaper(&self) {
        let ctx = self.ctx.clone();
        let running = self.running.clone();
        self.ctx.executor.spawn_interval(self.ctx.settings.engine.reaper_interval, move || {
            if !running.load(Ordering::SeqCst) || ctx.diag.is_halted() {
                return false;
            }
            let reaped = ctx.clients.reap_expired(timestamp_secs());
            if reaped > 0 {
                log::info!("reaped {} expired client states", reaped);
            }
            true
        });
    }

    /// Stop background work and flush outstanding store completions
    pub fn shutdown(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.ctx.store.stop_callbacks();
        log::info!("engine stopped, stats: {}", self.ctx.stats.to_json());
    }

    /// Give the calling thread a job queue for completions that must run on it
    pub fn thread_init(&self) -> ThreadId {
        self.ctx.executor.register_thread()
    }

    pub fn thread_term(&self) {
        self.ctx.executor.unregister_thread()
    }

    pub fn process_jobs(&self) -> usize {
        self.ctx.executor.process_jobs()
    }

    pub fn create_message(&self, header: MessageHeader, areas: Vec<MessageArea>) -> MessageHandle {
        Message::new(&self.ctx.stats, self.ctx.next_id(), header, areas)
    }

    pub fn create_client_state(
        &self,
        req: ClientRequest,
        cb: Option<CompletionCallback<Created>>,
    ) -> Result<Completion<Created>> {
        self.call(|ctx| ClientState::create(ctx, req, cb))
    }

    pub fn destroy_client_state(
        &self,
        client: &ClientHandle,
        discard: bool,
        cb: Option<CompletionCallback<()>>,
    ) -> Result<Completion<()>> {
        self.call(|_| client.destroy(discard, cb))
    }

    pub fn destroy_disconnected_client_state(&self, client_id: &str) -> Result<()> {
        self.call(|ctx| ctx.clients.destroy_disconnected(client_id))
    }

    pub fn create_session(&self, client: &ClientHandle, options: SessionOptions) -> Result<SessionHandle> {
        self.call(|_| client.create_session(options))
    }

    pub fn destroy_session(&self, session: &SessionHandle, cb: Option<CompletionCallback<()>>) -> Result<Completion<()>> {
        self.call(|_| session.destroy(cb))
    }

    pub fn start_message_delivery(&self, session: &SessionHandle) -> Result<()> {
        self.call(|_| session.start(Origin::Client))
    }

    pub fn stop_message_delivery(
        &self,
        session: &SessionHandle,
        cb: Option<CompletionCallback<()>>,
    ) -> Result<Completion<()>> {
        self.call(|_| session.stop(Origin::Client, cb))
    }

    pub fn create_producer(&self, session: &SessionHandle, dest_type: DestinationType, name: &str) -> Result<ProducerHandle> {
        self.call(|_| session.create_producer(dest_type, name))
    }

    pub fn destroy_producer(&self, producer: &ProducerHandle) -> Result<()> {
        self.call(|_| producer.destroy())
    }

    pub fn put_message(
        &self,
        producer: &ProducerHandle,
        tran: Option<&TransactionHandle>,
        msg: MessageHandle,
    ) -> Result<usize> {
        self.call(|_| producer.put(tran, msg))
    }

    /// Put without a long-lived producer
    pub fn put_message_on_destination(
        &self,
        session: &SessionHandle,
        dest_type: DestinationType,
        name: &str,
        tran: Option<&TransactionHandle>,
        msg: MessageHandle,
    ) -> Result<usize> {
        self.call(|_| {
            let producer = Producer::create(session, dest_type, name)?;
            let res = producer.put(tran, msg);
            producer.destroy()?;
            res
        })
    }

    pub fn create_consumer(
        &self,
        session: &SessionHandle,
        target: ConsumerTarget<'_>,
        callback: MessageCallback,
    ) -> Result<ConsumerHandle> {
        self.call(|_| session.create_consumer(target, callback))
    }

    pub fn destroy_consumer(&self, consumer: &ConsumerHandle, cb: Option<CompletionCallback<()>>) -> Result<Completion<()>> {
        self.call(|_| consumer.destroy(cb))
    }

    pub fn suspend_message_delivery(&self, consumer: &ConsumerHandle) -> Result<()> {
        self.call(|_| consumer.suspend())
    }

    pub fn resume_message_delivery(&self, consumer: &ConsumerHandle) -> Result<()> {
        self.call(|_| consumer.resume())
    }

    pub fn consumer_delivery_status(&self, consumer: &ConsumerHandle) -> DeliveryStatus {
        consumer.delivery_status()
    }

    pub fn confirm_message_delivery(
        &self,
        session: &SessionHandle,
        tran: Option<&TransactionHandle>,
        handle: &DeliveryHandle,
        option: AckOption,
    ) -> Result<()> {
        self.call(|_| session.confirm(tran, handle, option))
    }

    pub fn confirm_message_delivery_batch(
        &self,
        session: &SessionHandle,
        tran: Option<&TransactionHandle>,
        handles: &[DeliveryHandle],
        option: AckOption,
    ) -> Result<()> {
        self.call(|_| session.confirm_batch(tran, handles, option))
    }

    pub fn create_subscription(&self, req: SubscriptionRequest) -> Result<SubscriptionHandle> {
        self.call(|ctx| {
            if ctx.clients.get(&req.client_id).is_none() {
                return Err(EngineError::NotFound);
            }
            ctx.topics.create_subscription(ctx, req)
        })
    }

    pub fn destroy_subscription(&self, client_id: &str, name: &str) -> Result<()> {
        self.call(|ctx| {
            let sub = ctx.topics.find_client_subscription(client_id, name)?;
            ctx.topics.destroy_subscription(ctx, &sub)
        })
    }

    pub fn create_local_transaction(&self, session: &SessionHandle) -> Result<TransactionHandle> {
        self.call(|_| session.create_local_transaction())
    }

    pub fn create_global_transaction(
        &self,
        session: &SessionHandle,
        xid: Xid,
        flag: CreateGlobal,
    ) -> Result<TransactionHandle> {
        self.call(|ctx| ctx.transactions.create_global(ctx, session, xid, flag))
    }

    pub fn end_transaction(&self, session: &SessionHandle, xid: &Xid, flag: EndFlag) -> Result<()> {
        self.call(|ctx| ctx.transactions.end(ctx, session, xid, flag))
    }

    pub fn prepare_global_transaction(
        &self,
        session: &SessionHandle,
        xid: &Xid,
        cb: Option<CompletionCallback<()>>,
    ) -> Result<Completion<()>> {
        self.call(|ctx| ctx.transactions.prepare(ctx, session, xid, cb))
    }

    pub fn commit_transaction(
        &self,
        session: &SessionHandle,
        tran: &TransactionHandle,
        cb: Option<CompletionCallback<()>>,
    ) -> Result<Completion<()>> {
        self.call(|ctx| ctx.transactions.commit(ctx, tran, Some(session.as_ref()), false, cb))
    }

    pub fn commit_global_transaction(
        &self,
        session: &SessionHandle,
        xid: &Xid,
        one_phase: bool,
        cb: Option<CompletionCallback<()>>,
    ) -> Result<Completion<()>> {
        self.call(|ctx| ctx.transactions.commit_global(ctx, session, xid, one_phase, cb))
    }

    pub fn rollback_transaction(&self, session: &SessionHandle, tran: &TransactionHandle) -> Result<()> {
        self.call(|ctx| ctx.transactions.rollback(ctx, tran, Some(session.as_ref())))
    }

    pub fn rollback_global_transaction(&self, session: &SessionHandle, xid: &Xid) -> Result<()> {
        self.call(|ctx| ctx.transactions.rollback_global(ctx, session, xid))
    }

    pub fn mark_rollback_only(&self, tran: &TransactionHandle) -> Result<()> {
        self.call(|_| {
            tran.mark_rollback_only();
            Ok(())
        })
    }

    pub fn complete_global_transaction(&self, xid: &Xid, outcome: HeuristicOutcome) -> Result<()> {
        self.call(|ctx| ctx.transactions.complete(ctx, xid, outcome))
    }

    pub fn forget_global_transaction(&self, xid: &Xid, cb: Option<CompletionCallback<()>>) -> Result<Completion<()>> {
        self.call(|ctx| ctx.transactions.forget(ctx, xid, cb))
    }

    pub fn xa_recover(&self, session: &SessionHandle, count: usize, flags: XaScan) -> Result<Vec<Xid>> {
        self.call(|ctx| ctx.transactions.xa_recover(session, count, flags))
    }

    /// Create a named queue, or update the policy of an existing one
    pub fn create_queue(&self, name: &str, props: &Properties) -> Result<NamedQueueHandle> {
        self.call(|ctx| ctx.namespace.create_queue(ctx, name, props, CreateMode::Declared).map(|(nq, _)| nq))
    }

    pub fn destroy_queue(&self, name: &str, discard: bool) -> Result<()> {
        self.call(|ctx| ctx.namespace.destroy_queue(ctx, name, discard, true))
    }

    pub fn create_temporary_queue(&self, client: &ClientHandle, name: &str, props: &Properties) -> Result<NamedQueueHandle> {
        self.call(|_| client.create_temporary_queue(name, props))
    }

    pub fn destroy_temporary_queue(&self, client: &ClientHandle, name: &str) -> Result<()> {
        self.call(|_| client.destroy_temporary_queue(name))
    }

    /// Route an admin object change to the component that owns the object type
    pub fn config_callback(&self, object_type: &str, name: &str, props: &Properties, change: ChangeType) -> Result<()> {
        self.call(|ctx| {
            log::debug!("config change, type: {}, name: {}, change: {:?}", object_type, name, change);
            match (object_type, change) {
                ("Queue", ChangeType::Create | ChangeType::Update) => {
                    ctx.namespace.create_queue(ctx, name, props, CreateMode::Declared).map(|_| ())
                }
                ("Queue", ChangeType::Delete) => {
                    let discard = props.get(PROP_DISCARD_MESSAGES).is_some_and(|v| v.eq_ignore_ascii_case("true"));
                    ctx.namespace.destroy_queue(ctx, name, discard, true)
                }
                ("TopicMonitor", change) => ctx.topics.topic_monitor_changed(name, change),
                ("ClientState", ChangeType::Delete) => ctx.clients.destroy_disconnected(name),
                ("Subscription", ChangeType::Delete) => {
                    let client_id = props
                        .get(PROP_CLIENT_ID)
                        .ok_or_else(|| EngineError::InvalidParameter(PROP_CLIENT_ID.into()))?;
                    let sub = ctx.topics.find_client_subscription(client_id, name)?;
                    ctx.topics.destroy_subscription(ctx, &sub)
                }
                (t, change) if t.ends_with("Policy") => ctx.security.policy_changed(name, props, change),
                (t, change) => Err(EngineError::InvalidParameter(format!("{} {:?}", t, change))),
            }
        })
    }

    pub fn stats(&self) -> serde_json::Value {
        self.ctx.stats.to_json()
    }
}
