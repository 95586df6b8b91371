//! Publish/subscribe rendezvous for processes that should not know about each
//! other.
//!
//! Publishers connect to the broker's xsub endpoint, subscribers to its xpub
//! endpoint. Messages are routed by topic prefix; subscription changes are
//! forwarded back to every publisher so they can tell whether anyone listens.
//! Delivery is best effort and only ordered per publisher.

pub mod broker;
pub mod client;
pub mod error;
pub mod frame;

pub use broker::{Broker, BrokerConfig, SEND_HWM};
pub use client::{Message, Publisher, Subscriber, SubscriptionEvent};
pub use error::BrokerError;
pub use frame::{BrokerFrame, MAX_TOPIC_LEN, topic_matches};
