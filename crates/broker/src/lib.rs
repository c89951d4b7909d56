#![deny(
    trivial_numeric_casts,
    missing_docs,
    unsafe_code,
    unstable_features,
    unused_import_braces,
    unused_qualifications,
    unused_extern_crates,
    unused_results
)]
#![warn(rust_2021_compatibility, unreachable_pub)]

//! The small messaging capability a broker input/output/request-reply
//! component needs: connect, bind a queue, subscribe it to topic patterns,
//! publish, receive, and settle (ack/nack) a delivery. Concrete broker
//! drivers (Solace, Kafka, ...) are out of scope; this crate defines the
//! `Broker` trait plus one in-memory implementation usable standalone and in
//! integration tests.

use std::collections::HashMap;

use async_trait::async_trait;

pub mod memory;
pub mod requester;
pub mod router;

/// Errors raised by a broker or by the components built on top of it.
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// The broker link could not be established or was lost.
    #[error("broker connection error: {0}")]
    Connection(String),

    /// `bind_queue`/`subscribe`/`publish` referenced a queue that was never
    /// bound.
    #[error("unknown queue: {0}")]
    UnknownQueue(String),

    /// A subscription pattern could not be compiled.
    #[error("invalid subscription pattern '{pattern}': {reason}")]
    InvalidSubscription {
        /// The offending pattern.
        pattern: String,
        /// Why it was rejected.
        reason: String,
    },

    /// Publishing a message failed.
    #[error("publish failed: {0}")]
    Publish(String),

    /// A delivery tag passed to `ack`/`nack` is not outstanding.
    #[error("unknown delivery tag: {0}")]
    UnknownDelivery(u64),

    /// A request/reply call exceeded its deadline without a (final) reply.
    #[error("request timed out")]
    RequestTimeout,

    /// A request/reply call was cancelled before it completed.
    #[error("request cancelled")]
    RequestCancelled,
}

/// One message in flight through the broker: either freshly received (with
/// a `delivery_tag` to settle) or about to be published (tag irrelevant).
#[derive(Debug, Clone)]
pub struct BrokerMessage {
    /// Opaque identifier used to `ack`/`nack` this specific delivery.
    pub delivery_tag: u64,
    /// The topic this message was published to / received on.
    pub topic: String,
    /// The raw payload bytes; encoding/decoding is the caller's concern.
    pub payload: Vec<u8>,
    /// Broker-level user properties (headers), as opposed to the payload's
    /// own structure.
    pub user_properties: HashMap<String, String>,
    /// Number of times this delivery has been redelivered after a prior
    /// `nack`.
    pub redelivery_count: u32,
}

/// The messaging capability a broker input/output/request-reply component
/// depends on. Implementations own their own connection lifecycle;
/// `connect` may be called more than once to reconnect after a link drop.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Establishes (or re-establishes) the underlying connection.
    async fn connect(&self) -> Result<(), Error>;

    /// Declares a named queue that `subscribe`/`receive` can then target.
    async fn bind_queue(&self, queue_name: &str) -> Result<(), Error>;

    /// Adds a topic filter (solace wildcard grammar: `*` matches one level,
    /// `>` matches one or more trailing levels) to `queue_name`'s
    /// subscriptions.
    async fn subscribe(&self, queue_name: &str, topic_filter: &str) -> Result<(), Error>;

    /// Publishes `payload` to `topic`, fanning out to every queue with a
    /// matching subscription.
    async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        user_properties: HashMap<String, String>,
    ) -> Result<(), Error>;

    /// Blocks until the next message destined for `queue_name` arrives.
    async fn receive(&self, queue_name: &str) -> Result<BrokerMessage, Error>;

    /// Settles a delivery as successfully processed.
    async fn ack(&self, delivery_tag: u64) -> Result<(), Error>;

    /// Settles a delivery as failed; the broker redelivers it up to
    /// `max_redelivery_count` times before dropping it.
    async fn nack(&self, delivery_tag: u64) -> Result<(), Error>;
}
