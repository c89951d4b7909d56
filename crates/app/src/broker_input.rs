//! Free-standing async loops that pump broker deliveries into a simplified
//! app's flows. Unlike a user component, a broker input has no upstream
//! [`message::Message`] to transform — it originates messages from external
//! deliveries — so it does not implement [`component::Component`] and
//! instead runs as a plain task spawned by [`crate::App`].

use std::sync::Arc;

use broker::{router::SubscriptionRouter, Broker, BrokerMessage};
use config::{BrokerConfig, PayloadEncoding, PayloadFormat};
use message::{Message, PayloadValue};

use crate::codec;

fn to_message(delivery: BrokerMessage, encoding: PayloadEncoding, format: PayloadFormat) -> Result<Message, String> {
    let payload = codec::decode(&delivery.payload, encoding, format)?;

    let mut message = Message::with_topic(payload, delivery.topic.clone());
    for (key, value) in delivery.user_properties {
        message.set_user_property(key, PayloadValue::Text(value));
    }
    Ok(message)
}

/// Dispatch target for a decoded broker delivery: either the sole user
/// component (single-component apps skip routing entirely) or a router
/// deciding among several.
pub enum Dispatch {
    /// Send straight to this component; there is nothing to route between.
    Direct(flume::Sender<Vec<Message>>),
    /// Route by topic among several components, first-match-wins.
    Routed {
        /// One sender per user component, in declared order.
        senders: Vec<flume::Sender<Vec<Message>>>,
        /// Compiled from each component's `subscriptions`, same order.
        router: SubscriptionRouter,
    },
}

/// Consumes `queue_name` forever, decoding each delivery and dispatching it
/// to the matching component's entry queue. A delivery that matches nothing
/// (or arrives with an empty topic when routing is configured) is logged and
/// acked without being processed, never redelivered, per the broker's
/// first-match-wins routing contract.
pub async fn run_input_loop(broker: Arc<dyn Broker>, queue_name: String, broker_config: BrokerConfig, dispatch: Dispatch) {
    loop {
        let delivery = match broker.receive(&queue_name).await {
            Ok(delivery) => delivery,
            Err(err) => {
                tracing::warn!(queue = %queue_name, error = %err, "broker input receive failed, stopping");
                return;
            }
        };

        let delivery_tag = delivery.delivery_tag;
        let message = match to_message(delivery, broker_config.payload_encoding, broker_config.payload_format) {
            Ok(message) => message,
            Err(reason) => {
                tracing::warn!(queue = %queue_name, delivery_tag, reason, "broker input could not decode payload, nacking for redelivery");
                if let Err(err) = broker.nack(delivery_tag).await {
                    tracing::warn!(queue = %queue_name, error = %err, "broker input nack failed, stopping");
                    return;
                }
                continue;
            }
        };

        let broker_for_ack = broker.clone();
        let broker_for_nack = broker.clone();
        message.on_ack(move || {
            let broker = broker_for_ack;
            tokio::spawn(async move {
                if let Err(err) = broker.ack(delivery_tag).await {
                    tracing::warn!(delivery_tag, error = %err, "broker input ack failed");
                }
            });
        });
        message.on_nack(move |_reason| {
            let broker = broker_for_nack;
            tokio::spawn(async move {
                if let Err(err) = broker.nack(delivery_tag).await {
                    tracing::warn!(delivery_tag, error = %err, "broker input nack failed");
                }
            });
        });

        let target = match &dispatch {
            Dispatch::Direct(sender) => Some(sender),
            Dispatch::Routed { senders, router } => {
                let topic = message.topic().unwrap_or_default();
                match router.route(topic) {
                    Some(index) => senders.get(index),
                    None => {
                        tracing::warn!(topic, "no component subscribed to this topic, discarding");
                        message.ack();
                        None
                    }
                }
            }
        };

        if let Some(sender) = target {
            if sender.send_async(vec![message]).await.is_err() {
                tracing::warn!(queue = %queue_name, "component queue closed, stopping broker input");
                return;
            }
        }
    }
}

/// Consumes an app's dedicated reply queue forever, feeding every delivery
/// to `requester` and acking it regardless of whether it matched a pending
/// request (a stray or expired reply is still a consumed delivery).
pub async fn run_reply_loop(broker: Arc<dyn Broker>, reply_queue: String, requester: Arc<broker::requester::Requester>) {
    loop {
        let delivery = match broker.receive(&reply_queue).await {
            Ok(delivery) => delivery,
            Err(err) => {
                tracing::warn!(queue = %reply_queue, error = %err, "reply loop receive failed, stopping");
                return;
            }
        };

        let delivery_tag = delivery.delivery_tag;
        let _ = requester.deliver_reply(delivery);
        if let Err(err) = broker.ack(delivery_tag).await {
            tracing::warn!(delivery_tag, error = %err, "reply loop ack failed");
        }
    }
}

/// Union of every component's subscription patterns, in declared order, fed
/// to `broker.subscribe` so the input queue receives everything any
/// component might route to.
pub fn union_subscriptions(components: &[config::ComponentConfig]) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    let mut patterns = Vec::new();
    for component in components {
        for pattern in &component.subscriptions {
            if seen.insert(pattern.clone()) {
                patterns.push(pattern.clone());
            }
        }
    }
    patterns
}
