#![deny(unsafe_code)]

//! # Overall Example
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use mqengine::client::{ClientOptions, ClientRequest};
//! use mqengine::conf::Settings;
//! use mqengine::consumer::{ConsumerHandle, ConsumerTarget, Delivery};
//! use mqengine::engine::Engine;
//! use mqengine::message::{Reliability, MessageHeader};
//! use mqengine::session::SessionOptions;
//! use mqengine::types::DestinationType;
//!
//! let engine = Engine::new(Settings::from_toml_str("").unwrap());
//! engine.start().unwrap();
//!
//! let created = engine.create_client_state(ClientRequest::new("C1", ClientOptions::empty()), None).unwrap();
//! let client = created.done().unwrap().client;
//! let session = engine.create_session(&client, SessionOptions::TRANSACTIONAL).unwrap();
//! let _consumer = engine
//!     .create_consumer(
//!         &session,
//!         ConsumerTarget::Topic { topic: "T", max_reliability: Reliability::ExactlyOnce },
//!         Arc::new(|_c: &ConsumerHandle, delivery: Delivery| {
//!             println!("{:?}", delivery.message.payload());
//!             true
//!         }),
//!     )
//!     .unwrap();
//! engine.start_message_delivery(&session).unwrap();
//!
//! let producer = engine.create_producer(&session, DestinationType::Topic, "T").unwrap();
//! let tran = engine.create_local_transaction(&session).unwrap();
//! let msg = engine.create_message(MessageHeader { reliability: Reliability::AtLeastOnce, ..Default::default() }, vec![]);
//! engine.put_message(&producer, Some(&tran), msg).unwrap();
//! engine.commit_transaction(&session, &tran, None).unwrap();
//! ```

/// Object model
pub mod client; // Client states and the client-id directory
pub mod consumer; // Consumers, deliveries and acknowledgements
pub mod message; // Shared immutable messages
pub mod producer; // Producers
pub mod session; // Sessions and delivery flow control

/// Destinations
pub mod namespace; // Name to queue directory
pub mod queue; // Queue and waiter scheduling
pub mod topic; // Subscriptions and the topic tree

/// Transactions and completion
pub mod async_data; // Completion stacks
pub mod transaction; // Local and global transactions

/// Collaborators
pub mod policy; // Security and destination policies
pub mod store; // Durable store seam

/// Runtime
pub mod context; // Shared engine context
pub mod diag; // Failure data capture
pub mod engine; // Public entry points
pub mod error; // Error taxonomy
pub mod executor; // Deferred and per-thread jobs
pub mod logger; // slog backed logging
pub mod refcount; // Use counts
pub mod stats; // Object counters
pub mod types; // Common data types
pub mod waiter; // Waiter state machine

pub use error::{EngineError, Result};
pub use mqengine_conf as conf;
pub use mqengine_utils as utils;
