//! An in-memory `Broker` implementation: topics are matched against each
//! bound queue's subscriptions using the same wildcard grammar as
//! `crate::router`, deliveries are held per-queue in a bounded `flume`
//! channel, and un-acked deliveries are redelivered (up to
//! `max_redelivery_count` times) on `nack`.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Mutex,
    },
};

use async_trait::async_trait;
use regex::Regex;

use crate::{router::compile_pattern, Broker, BrokerMessage, Error};

struct PendingAck {
    queue_name: String,
    topic: String,
    payload: Vec<u8>,
    user_properties: HashMap<String, String>,
    redelivery_count: u32,
}

struct Queue {
    subscriptions: Vec<Regex>,
    sender: flume::Sender<BrokerMessage>,
    receiver: flume::Receiver<BrokerMessage>,
}

/// A topic-matching, queue-backed broker with no external dependencies,
/// suitable for standalone use and conformance/integration tests.
pub struct InMemoryBroker {
    queue_depth: usize,
    max_redelivery_count: u32,
    queues: Mutex<HashMap<String, Queue>>,
    pending: Mutex<HashMap<u64, PendingAck>>,
    next_delivery_tag: AtomicU64,
}

impl InMemoryBroker {
    /// Creates a broker whose queues buffer up to `queue_depth` undelivered
    /// messages, redelivering a nacked message up to
    /// `max_redelivery_count` times before dropping it.
    pub fn new(queue_depth: usize, max_redelivery_count: u32) -> Self {
        Self {
            queue_depth,
            max_redelivery_count,
            queues: Mutex::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
            next_delivery_tag: AtomicU64::new(1),
        }
    }

    fn next_tag(&self) -> u64 {
        self.next_delivery_tag.fetch_add(1, Ordering::Relaxed)
    }

    fn deliver(&self, queue_name: &str, topic: String, payload: Vec<u8>, user_properties: HashMap<String, String>, redelivery_count: u32) {
        let tag = self.next_tag();
        let queues = self.queues.lock().expect("broker queues lock poisoned");
        let Some(queue) = queues.get(queue_name) else {
            return;
        };
        let message = BrokerMessage {
            delivery_tag: tag,
            topic: topic.clone(),
            payload: payload.clone(),
            user_properties: user_properties.clone(),
            redelivery_count,
        };
        if queue.sender.send(message).is_err() {
            return;
        }
        drop(queues);
        let _ = self.pending.lock().expect("broker pending lock poisoned").insert(
            tag,
            PendingAck {
                queue_name: queue_name.to_string(),
                topic,
                payload,
                user_properties,
                redelivery_count,
            },
        );
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn connect(&self) -> Result<(), Error> {
        Ok(())
    }

    async fn bind_queue(&self, queue_name: &str) -> Result<(), Error> {
        let mut queues = self.queues.lock().expect("broker queues lock poisoned");
        if !queues.contains_key(queue_name) {
            let (sender, receiver) = flume::bounded(self.queue_depth.max(1));
            let _ = queues.insert(
                queue_name.to_string(),
                Queue {
                    subscriptions: Vec::new(),
                    sender,
                    receiver,
                },
            );
        }
        Ok(())
    }

    async fn subscribe(&self, queue_name: &str, topic_filter: &str) -> Result<(), Error> {
        let pattern = compile_pattern(topic_filter)?;
        let mut queues = self.queues.lock().expect("broker queues lock poisoned");
        let queue = queues.get_mut(queue_name).ok_or_else(|| Error::UnknownQueue(queue_name.to_string()))?;
        queue.subscriptions.push(pattern);
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>, user_properties: HashMap<String, String>) -> Result<(), Error> {
        let matching_queues: Vec<String> = {
            let queues = self.queues.lock().expect("broker queues lock poisoned");
            queues
                .iter()
                .filter(|(_, queue)| queue.subscriptions.iter().any(|pattern| pattern.is_match(topic)))
                .map(|(name, _)| name.clone())
                .collect()
        };

        for queue_name in matching_queues {
            self.deliver(&queue_name, topic.to_string(), payload.clone(), user_properties.clone(), 0);
        }
        Ok(())
    }

    async fn receive(&self, queue_name: &str) -> Result<BrokerMessage, Error> {
        let receiver = {
            let queues = self.queues.lock().expect("broker queues lock poisoned");
            queues.get(queue_name).ok_or_else(|| Error::UnknownQueue(queue_name.to_string()))?.receiver.clone()
        };
        receiver.recv_async().await.map_err(|_| Error::Connection(format!("queue '{queue_name}' closed")))
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), Error> {
        match self.pending.lock().expect("broker pending lock poisoned").remove(&delivery_tag) {
            Some(_) => Ok(()),
            None => Err(Error::UnknownDelivery(delivery_tag)),
        }
    }

    async fn nack(&self, delivery_tag: u64) -> Result<(), Error> {
        let pending = self.pending.lock().expect("broker pending lock poisoned").remove(&delivery_tag);
        let Some(pending) = pending else {
            return Err(Error::UnknownDelivery(delivery_tag));
        };

        if pending.redelivery_count >= self.max_redelivery_count {
            tracing::warn!(
                queue = %pending.queue_name,
                topic = %pending.topic,
                redelivery_count = pending.redelivery_count,
                "dropping message after exceeding max redelivery count"
            );
            return Ok(());
        }

        self.deliver(&pending.queue_name, pending.topic, pending.payload, pending.user_properties, pending.redelivery_count + 1);
        Ok(())
    }
}
