//! Request/reply on top of a `Broker`: publishes a request carrying a
//! correlation id, subscribes a reply queue, and resolves (or streams)
//! replies correlated back to the caller. A pending request moves through
//! OPEN → COMPLETED (final reply observed) | EXPIRED (deadline elapsed) |
//! CANCELLED (caller dropped the stream or the requester stopped).

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use futures::{stream::unfold, Stream};
use tokio::sync::mpsc;

use crate::{Broker, BrokerMessage, Error};

/// Correlation header carried alongside a request, and echoed back by the
/// responder on every reply.
pub const CORRELATION_HEADER: &str = "correlation-id";

/// Lifecycle of one outstanding request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    /// Awaiting a reply, not yet past its deadline.
    Open,
    /// The final reply was observed; the correlation is released.
    Completed,
    /// The deadline elapsed before a final reply arrived.
    Expired,
    /// The caller cancelled the request before it completed.
    Cancelled,
}

struct Pending {
    sender: mpsc::UnboundedSender<BrokerMessage>,
}

/// Issues and tracks broker request/reply exchanges correlated by an
/// internally generated id, delivered to a dedicated reply queue.
pub struct Requester {
    broker: Arc<dyn Broker>,
    reply_queue: String,
    reply_topic: String,
    reply_topic_key: String,
    reply_metadata_key: Option<String>,
    next_correlation: AtomicU64,
    pending: Arc<Mutex<HashMap<String, Pending>>>,
}

impl Requester {
    /// Builds a requester that publishes requests through `broker` and
    /// expects replies on `reply_queue`/`reply_topic` (already bound and
    /// subscribed by the caller, typically the owning app at construction).
    /// `reply_topic_key` is the user-property key the reply topic is
    /// written under (`BrokerConfig::user_properties_reply_topic_key`);
    /// `reply_metadata_key`, when set, is the key per-caller metadata passed
    /// to `do_request`/`do_streaming_request` is written under.
    pub fn new(
        broker: Arc<dyn Broker>,
        reply_queue: impl Into<String>,
        reply_topic: impl Into<String>,
        reply_topic_key: impl Into<String>,
        reply_metadata_key: Option<String>,
    ) -> Self {
        Self {
            broker,
            reply_queue: reply_queue.into(),
            reply_topic: reply_topic.into(),
            reply_topic_key: reply_topic_key.into(),
            reply_metadata_key,
            next_correlation: AtomicU64::new(1),
            pending: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn next_correlation_id(&self) -> String {
        format!("req-{}", self.next_correlation.fetch_add(1, Ordering::Relaxed))
    }

    /// Feeds a message received off the reply queue to its matching pending
    /// request, if any. The owning app's broker-input loop calls this for
    /// every message arriving on the reply queue before (or instead of)
    /// routing it anywhere else.
    pub fn deliver_reply(&self, message: BrokerMessage) -> bool {
        let correlation_id = match message.user_properties.get(CORRELATION_HEADER) {
            Some(id) => id.clone(),
            None => return false,
        };
        let pending = self.pending.lock().expect("requester pending lock poisoned");
        match pending.get(&correlation_id) {
            Some(entry) => {
                let _ = entry.sender.send(message);
                true
            }
            None => false,
        }
    }

    /// Writes the reply topic (under the configured topic key) and, when
    /// both `metadata` and a configured metadata key are present, the
    /// caller's metadata, into `user_properties`.
    fn with_reply_headers(&self, mut user_properties: HashMap<String, String>, metadata: Option<String>) -> HashMap<String, String> {
        let _ = user_properties.entry(self.reply_topic_key.clone()).or_insert_with(|| self.reply_topic.clone());
        if let (Some(key), Some(value)) = (&self.reply_metadata_key, metadata) {
            let _ = user_properties.insert(key.clone(), value);
        }
        user_properties
    }

    /// Issues a single-reply request, returning the first (and only
    /// expected) reply, or `Error::RequestTimeout` if none arrives within
    /// `timeout`. `metadata` is arbitrary per-caller data written under the
    /// configured reply-metadata key, when one is configured.
    pub async fn do_request(
        &self,
        topic: &str,
        payload: Vec<u8>,
        user_properties: HashMap<String, String>,
        metadata: Option<String>,
        timeout: Duration,
    ) -> Result<BrokerMessage, Error> {
        let correlation_id = self.next_correlation_id();
        let mut user_properties = self.with_reply_headers(user_properties, metadata);
        let _ = user_properties.insert(CORRELATION_HEADER.to_string(), correlation_id.clone());

        let (sender, mut receiver) = mpsc::unbounded_channel();
        let _ = self.pending.lock().expect("requester pending lock poisoned").insert(correlation_id.clone(), Pending { sender });

        self.broker.publish(topic, payload, user_properties).await?;

        let result = tokio::time::timeout(timeout, receiver.recv()).await;
        let _ = self.pending.lock().expect("requester pending lock poisoned").remove(&correlation_id);

        match result {
            Ok(Some(message)) => Ok(message),
            Ok(None) => Err(Error::RequestCancelled),
            Err(_) => Err(Error::RequestTimeout),
        }
    }

    /// Issues a streaming request: the returned stream yields every reply
    /// sharing the request's correlation id, in broker receive order, until
    /// `is_last` returns `true` for a reply (inclusive) or `timeout` elapses
    /// since the last activity, whichever comes first. `metadata` is written
    /// under the configured reply-metadata key, as in `do_request`.
    pub async fn do_streaming_request(
        &self,
        topic: &str,
        payload: Vec<u8>,
        user_properties: HashMap<String, String>,
        metadata: Option<String>,
        timeout: Duration,
        is_last: impl Fn(&BrokerMessage) -> bool + Send + Sync + 'static,
    ) -> Result<impl Stream<Item = Result<BrokerMessage, Error>>, Error> {
        let correlation_id = self.next_correlation_id();
        let mut user_properties = self.with_reply_headers(user_properties, metadata);
        let _ = user_properties.insert(CORRELATION_HEADER.to_string(), correlation_id.clone());

        let (sender, receiver) = mpsc::unbounded_channel();
        let _ = self.pending.lock().expect("requester pending lock poisoned").insert(correlation_id.clone(), Pending { sender });

        self.broker.publish(topic, payload, user_properties).await?;

        let pending = self.pending.clone();
        Ok(unfold(
            StreamState {
                receiver,
                correlation_id,
                pending,
                timeout,
                is_last: Arc::new(is_last),
                done: false,
            },
            step,
        ))
    }
}

struct StreamState {
    receiver: mpsc::UnboundedReceiver<BrokerMessage>,
    correlation_id: String,
    pending: Arc<Mutex<HashMap<String, Pending>>>,
    timeout: Duration,
    is_last: Arc<dyn Fn(&BrokerMessage) -> bool + Send + Sync>,
    done: bool,
}

impl Drop for StreamState {
    fn drop(&mut self) {
        let _ = self.pending.lock().expect("requester pending lock poisoned").remove(&self.correlation_id);
    }
}

async fn step(mut state: StreamState) -> Option<(Result<BrokerMessage, Error>, StreamState)> {
    if state.done {
        return None;
    }

    match tokio::time::timeout(state.timeout, state.receiver.recv()).await {
        Ok(Some(message)) => {
            if (state.is_last)(&message) {
                state.done = true;
            }
            Some((Ok(message), state))
        }
        Ok(None) => None,
        Err(_) => {
            state.done = true;
            Some((Err(Error::RequestTimeout), state))
        }
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use futures::StreamExt;

    use super::*;
    use crate::memory::InMemoryBroker;

    async fn echo_broker() -> Arc<InMemoryBroker> {
        let broker = Arc::new(InMemoryBroker::new(16, 3));
        broker.bind_queue("requests").await.unwrap();
        broker.subscribe("requests", "svc/request").await.unwrap();
        broker.bind_queue("replies").await.unwrap();
        broker.subscribe("replies", "svc/reply").await.unwrap();
        broker
    }

    #[tokio::test]
    async fn single_reply_round_trips() {
        let broker = echo_broker().await;
        let requester = Arc::new(Requester::new(broker.clone(), "replies", "svc/reply", "reply-to", None));

        let responder_requester = requester.clone();
        let responder_broker = broker.clone();
        let responder = tokio::spawn(async move {
            let request = responder_broker.receive("requests").await.unwrap();
            responder_broker.ack(request.delivery_tag).await.unwrap();
            let correlation_id = request.user_properties.get(CORRELATION_HEADER).cloned().unwrap();
            let mut reply_props = HashMap::new();
            let _ = reply_props.insert(CORRELATION_HEADER.to_string(), correlation_id);
            responder_broker.publish("svc/reply", b"pong".to_vec(), reply_props).await.unwrap();
            let reply = responder_broker.receive("replies").await.unwrap();
            responder_requester.deliver_reply(reply);
        });

        let reply = requester
            .do_request("svc/request", b"ping".to_vec(), HashMap::new(), None, Duration::from_secs(1))
            .await
            .unwrap();

        assert_eq!(reply.payload, b"pong".to_vec());
        responder.await.unwrap();
    }

    #[tokio::test]
    async fn request_without_reply_times_out() {
        let broker = echo_broker().await;
        let requester = Requester::new(broker, "replies", "svc/reply", "reply-to", None);

        let result = requester
            .do_request("svc/request", b"ping".to_vec(), HashMap::new(), None, Duration::from_millis(20))
            .await;
        assert!(matches!(result, Err(Error::RequestTimeout)));
    }

    #[tokio::test]
    async fn request_writes_configured_reply_and_metadata_keys() {
        let broker = echo_broker().await;
        let requester = Requester::new(broker.clone(), "replies", "svc/reply", "x-reply-topic", Some("x-caller-meta".to_string()));

        let _ = requester
            .do_request(
                "svc/request",
                b"ping".to_vec(),
                HashMap::new(),
                Some("caller-context".to_string()),
                Duration::from_millis(20),
            )
            .await;

        let request = broker.receive("requests").await.unwrap();
        assert_eq!(request.user_properties.get("x-reply-topic").map(String::as_str), Some("svc/reply"));
        assert_eq!(request.user_properties.get("x-caller-meta").map(String::as_str), Some("caller-context"));
        assert!(!request.user_properties.contains_key("reply-to"));
    }

    #[tokio::test]
    async fn streaming_request_yields_until_last() {
        let broker = echo_broker().await;
        let requester = Arc::new(Requester::new(broker.clone(), "replies", "svc/reply", "reply-to", None));

        let stream = requester
            .do_streaming_request(
                "svc/request",
                b"ping".to_vec(),
                HashMap::new(),
                None,
                Duration::from_secs(1),
                |message| message.payload == b"last".to_vec(),
            )
            .await
            .unwrap();

        let request = broker.receive("requests").await.unwrap();
        broker.ack(request.delivery_tag).await.unwrap();
        let correlation_id = request.user_properties.get(CORRELATION_HEADER).cloned().unwrap();

        for chunk in [&b"r1"[..], &b"r2"[..], &b"last"[..]] {
            let mut reply_props = HashMap::new();
            let _ = reply_props.insert(CORRELATION_HEADER.to_string(), correlation_id.clone());
            broker.publish("svc/reply", chunk.to_vec(), reply_props).await.unwrap();
            let reply = broker.receive("replies").await.unwrap();
            requester.deliver_reply(reply);
        }

        let received: Vec<_> = stream.collect().await;
        assert_eq!(received.len(), 3);
        assert_eq!(received[2].as_ref().unwrap().payload, b"last".to_vec());
    }
}
