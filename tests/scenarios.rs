//! End-to-end scenarios exercising a full `relay` wiring from the outside:
//! configuration (where relevant), broker, engine and component crates
//! together, instead of one crate's unit tests in isolation.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};

use relay::{
    app::App,
    broker::{memory::InMemoryBroker, requester::Requester, Broker as _},
    component::{Component, ComponentFactory, ComponentInfo, ConfigAccessor, Outcome, Registry},
    config::{AppConfig, BrokerConfig, ComponentConfig, PayloadEncoding, PayloadFormat},
    engine::flow::Flow,
    expr,
    message::{Message, PayloadValue},
    services::RuntimeServices,
    signal::SideSignal,
    task::{labels::ProcessLabels, TaskManager},
};

fn base_component_config(name: &str, component_type: &str, input_selection: &str) -> ComponentConfig {
    ComponentConfig {
        name: name.to_string(),
        component_type: component_type.to_string(),
        num_instances: 1,
        queue_depth: 8,
        disabled: false,
        component_config: HashMap::new(),
        input_transforms: Vec::new(),
        input_selection: input_selection.to_string(),
        subscriptions: Vec::new(),
    }
}

// --- Scenario: echo pipeline ------------------------------------------------
//
// A simplified app with broker input and output enabled and a single `noop`
// component wired between them. A message published to a subscribed topic
// comes back out through the broker output unchanged.

struct EchoFactory;

// Echoes its selected data exactly once, then discards: the republished copy
// the broker hands back to this app's own input subscription (its topic is
// unchanged by the round trip) would otherwise feed right back in and echo
// again forever.
struct Echo {
    echoed: bool,
}

#[async_trait::async_trait]
impl Component for Echo {
    fn info(&self) -> ComponentInfo {
        ComponentInfo {
            name: "echo".into(),
            component_type: "echo".into(),
        }
    }

    async fn invoke(&mut self, _message: &Message, data: Option<PayloadValue>) -> Result<Outcome, relay::component::Error> {
        if self.echoed {
            return Ok(Outcome::Discard);
        }
        self.echoed = true;
        Ok(Outcome::Emit(data.unwrap_or(PayloadValue::Null)))
    }
}

impl ComponentFactory for EchoFactory {
    fn create(
        &self,
        _name: &str,
        _component_type: &str,
        _config: ConfigAccessor,
        _services: RuntimeServices,
        _side_channel: flume::Sender<SideSignal>,
    ) -> Result<Box<dyn Component>, relay::component::Error> {
        Ok(Box::new(Echo { echoed: false }))
    }
}

#[tokio::test]
async fn echo_pipeline_roundtrips_through_broker() {
    let mut registry = Registry::new();
    registry.register("echo", Arc::new(EchoFactory)).unwrap();

    let broker_config = BrokerConfig {
        input_enabled: true,
        output_enabled: true,
        queue_name: Some("echo-in".to_string()),
        payload_encoding: PayloadEncoding::Utf8,
        payload_format: PayloadFormat::Text,
        ..BrokerConfig::default()
    };

    let mut component = base_component_config("echo", "echo", "input.payload");
    component.subscriptions = vec!["echo/>".to_string()];

    let app_config = AppConfig {
        name: "echo-app".to_string(),
        num_instances: 1,
        broker: Some(broker_config),
        config: HashMap::new(),
        flows: None,
        components: Some(vec![component]),
    };

    let services = RuntimeServices::new();
    let process_labels = ProcessLabels::new("echo-test");
    let mut task_manager = TaskManager::new();

    let app = App::start(&app_config, &registry, &services, &process_labels, &mut task_manager, None).await.unwrap();
    let broker = app.broker().expect("simplified app exposes its broker");

    broker.bind_queue("probe").await.unwrap();
    broker.subscribe("probe", ">").await.unwrap();

    broker.publish("echo/hello", b"hi there".to_vec(), HashMap::new()).await.unwrap();

    let delivered = tokio::time::timeout(Duration::from_secs(1), broker.receive("probe")).await.unwrap().unwrap();
    assert_eq!(delivered.payload, b"hi there".to_vec());
    broker.ack(delivered.delivery_tag).await.unwrap();

    app.stop();
}

// --- Scenario: prefix transform ---------------------------------------------
//
// A single component reads a `prefix` setting through `ConfigAccessor` and
// prepends it to the selected input data; downstream sees the result in
// `previous`, while the message's own payload is untouched.

struct PrefixComponent;

#[async_trait::async_trait]
impl Component for PrefixComponent {
    fn info(&self) -> ComponentInfo {
        ComponentInfo {
            name: "prefixer".into(),
            component_type: "prefixer".into(),
        }
    }

    async fn invoke(&mut self, _message: &Message, data: Option<PayloadValue>) -> Result<Outcome, relay::component::Error> {
        let text = data.map(|value| value.as_text()).unwrap_or_default();
        Ok(Outcome::Emit(PayloadValue::Text(format!("Echo: {text}"))))
    }
}

struct PrefixFactory;

impl ComponentFactory for PrefixFactory {
    fn create(
        &self,
        _name: &str,
        _component_type: &str,
        _config: ConfigAccessor,
        _services: RuntimeServices,
        _side_channel: flume::Sender<SideSignal>,
    ) -> Result<Box<dyn Component>, relay::component::Error> {
        Ok(Box::new(PrefixComponent))
    }
}

#[tokio::test]
async fn prefix_transform_sets_previous_without_touching_payload() {
    let mut registry = Registry::new();
    registry.register("prefixer", Arc::new(PrefixFactory)).unwrap();

    let component = base_component_config("prefixer", "prefixer", "input.payload");

    let services = RuntimeServices::new();
    let process_labels = ProcessLabels::new("prefix-test");
    let mut task_manager = TaskManager::new();

    let (sink_sender, sink_receiver) = flume::bounded::<Vec<Message>>(4);

    let flow = Flow::start(
        "prefix-flow",
        std::slice::from_ref(&component),
        &HashMap::new(),
        &registry,
        &services,
        &process_labels,
        &mut task_manager,
        Some(sink_sender),
    )
    .unwrap();

    let entry = flow.entry_sender().unwrap();
    entry.send_async(vec![Message::new(PayloadValue::Text("world".to_string()))]).await.unwrap();

    let received = sink_receiver.recv_async().await.unwrap();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].payload().as_text(), "world");
    assert_eq!(received[0].previous().map(PayloadValue::as_text), Some("Echo: world".to_string()));

    drop(entry);
    flow.stop();
    task_manager.join().await;
}

// --- Scenario: simplified-app routing ---------------------------------------
//
// Two components, each with its own subscription, are synthesized into
// independent chains behind a `SubscriptionRouter`; only the component whose
// subscription matches the published topic records it.

struct RecordingFactory {
    log: Arc<Mutex<Vec<String>>>,
}

struct RecordingComponent {
    log: Arc<Mutex<Vec<String>>>,
}

#[async_trait::async_trait]
impl Component for RecordingComponent {
    fn info(&self) -> ComponentInfo {
        ComponentInfo {
            name: "recorder".into(),
            component_type: "recorder".into(),
        }
    }

    async fn invoke(&mut self, message: &Message, _data: Option<PayloadValue>) -> Result<Outcome, relay::component::Error> {
        self.log.lock().unwrap().push(message.topic().unwrap_or_default().to_string());
        Ok(Outcome::Discard)
    }
}

impl ComponentFactory for RecordingFactory {
    fn create(
        &self,
        _name: &str,
        _component_type: &str,
        _config: ConfigAccessor,
        _services: RuntimeServices,
        _side_channel: flume::Sender<SideSignal>,
    ) -> Result<Box<dyn Component>, relay::component::Error> {
        Ok(Box::new(RecordingComponent { log: self.log.clone() }))
    }
}

#[tokio::test]
async fn simplified_app_routes_by_subscription() {
    let log_new = Arc::new(Mutex::new(Vec::new()));
    let log_updates = Arc::new(Mutex::new(Vec::new()));

    let mut registry = Registry::new();
    registry.register("rec_new", Arc::new(RecordingFactory { log: log_new.clone() })).unwrap();
    registry.register("rec_updates", Arc::new(RecordingFactory { log: log_updates.clone() })).unwrap();

    let mut new_component = base_component_config("new_orders", "rec_new", "input.payload");
    new_component.subscriptions = vec!["orders/new/>".to_string()];
    let mut updates_component = base_component_config("order_updates", "rec_updates", "input.payload");
    updates_component.subscriptions = vec!["orders/updates/>".to_string()];

    let broker_config = BrokerConfig {
        input_enabled: true,
        queue_name: Some("orders-in".to_string()),
        ..BrokerConfig::default()
    };

    let app_config = AppConfig {
        name: "orders".to_string(),
        num_instances: 1,
        broker: Some(broker_config),
        config: HashMap::new(),
        flows: None,
        components: Some(vec![new_component, updates_component]),
    };

    let services = RuntimeServices::new();
    let process_labels = ProcessLabels::new("routing-test");
    let mut task_manager = TaskManager::new();

    let app = App::start(&app_config, &registry, &services, &process_labels, &mut task_manager, None).await.unwrap();
    let broker = app.broker().unwrap();

    broker.publish("orders/updates/42", b"{}".to_vec(), HashMap::new()).await.unwrap();

    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(*log_updates.lock().unwrap(), vec!["orders/updates/42".to_string()]);
    assert!(log_new.lock().unwrap().is_empty());

    app.stop();
}

// --- Scenario: iteration fan-out joins the parent ack -----------------------
//
// A component emitting several payloads from one invocation (`EmitMany`)
// splits the message into independent children; the parent only acks once
// every child has resolved, never before and never more than once.

struct SplitterComponent;

#[async_trait::async_trait]
impl Component for SplitterComponent {
    fn info(&self) -> ComponentInfo {
        ComponentInfo {
            name: "splitter".into(),
            component_type: "splitter".into(),
        }
    }

    async fn invoke(&mut self, _message: &Message, _data: Option<PayloadValue>) -> Result<Outcome, relay::component::Error> {
        Ok(Outcome::EmitMany(vec![
            PayloadValue::Text("a".to_string()),
            PayloadValue::Text("b".to_string()),
            PayloadValue::Text("c".to_string()),
        ]))
    }
}

struct SplitterFactory;

impl ComponentFactory for SplitterFactory {
    fn create(
        &self,
        _name: &str,
        _component_type: &str,
        _config: ConfigAccessor,
        _services: RuntimeServices,
        _side_channel: flume::Sender<SideSignal>,
    ) -> Result<Box<dyn Component>, relay::component::Error> {
        Ok(Box::new(SplitterComponent))
    }
}

#[tokio::test]
async fn iteration_emits_many_and_joins_parent_ack_once() {
    let mut registry = Registry::new();
    registry.register("splitter", Arc::new(SplitterFactory)).unwrap();

    let component = base_component_config("splitter", "splitter", "input.payload");

    let services = RuntimeServices::new();
    let process_labels = ProcessLabels::new("iteration-test");
    let mut task_manager = TaskManager::new();

    // No downstream: the flow itself acks whatever the splitter emits, which
    // exercises the join from the other direction (every child resolves as
    // soon as it arrives rather than after further processing).
    let flow = Flow::start(
        "splitter-flow",
        std::slice::from_ref(&component),
        &HashMap::new(),
        &registry,
        &services,
        &process_labels,
        &mut task_manager,
        None,
    )
    .unwrap();

    let ack_count = Arc::new(Mutex::new(0usize));
    let nack_count = Arc::new(Mutex::new(0usize));
    let parent = Message::new(PayloadValue::Text("input".to_string()));
    {
        let ack_count = ack_count.clone();
        parent.on_ack(move || *ack_count.lock().unwrap() += 1);
    }
    {
        let nack_count = nack_count.clone();
        parent.on_nack(move |_reason| *nack_count.lock().unwrap() += 1);
    }

    let entry = flow.entry_sender().unwrap();
    entry.send_async(vec![parent]).await.unwrap();

    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(*ack_count.lock().unwrap(), 1);
    assert_eq!(*nack_count.lock().unwrap(), 0);

    drop(entry);
    flow.stop();
    task_manager.join().await;
}

// --- Scenario: request/reply with streaming ---------------------------------
//
// A requester issues a streaming request; a responder publishes three
// correlated replies, the last one flagged, and the caller's stream yields
// exactly those three in order before closing.

#[tokio::test]
async fn request_reply_streams_until_the_last_chunk() {
    use futures::StreamExt;

    let broker = Arc::new(InMemoryBroker::new(16, 3));
    broker.bind_queue("requests").await.unwrap();
    broker.subscribe("requests", "svc/request").await.unwrap();
    broker.bind_queue("replies").await.unwrap();
    broker.subscribe("replies", "svc/reply").await.unwrap();

    let requester = Arc::new(Requester::new(broker.clone(), "replies", "svc/reply", "reply-to", None));

    let stream = requester
        .do_streaming_request(
            "svc/request",
            b"start".to_vec(),
            HashMap::new(),
            None,
            Duration::from_secs(1),
            |message| message.payload == b"done".to_vec(),
        )
        .await
        .unwrap();

    let request = broker.receive("requests").await.unwrap();
    broker.ack(request.delivery_tag).await.unwrap();
    let correlation_id = request.user_properties.get("correlation-id").cloned().unwrap();

    for chunk in [&b"chunk-1"[..], &b"chunk-2"[..], &b"done"[..]] {
        let mut reply_props = HashMap::new();
        reply_props.insert("correlation-id".to_string(), correlation_id.clone());
        broker.publish("svc/reply", chunk.to_vec(), reply_props).await.unwrap();
        let reply = broker.receive("replies").await.unwrap();
        requester.deliver_reply(reply);
    }

    let received: Vec<_> = stream.collect().await;
    let payloads: Vec<_> = received.into_iter().map(|r| r.unwrap().payload).collect();
    assert_eq!(payloads, vec![b"chunk-1".to_vec(), b"chunk-2".to_vec(), b"done".to_vec()]);
}

// --- Scenario: template rendering with an embedded JSON placeholder ---------
//
// A template string mixing plain text with a `{{json://...}}` placeholder
// renders the referenced payload subtree as compact JSON inline.

#[tokio::test]
async fn template_renders_embedded_json_fragment() {
    let payload = PayloadValue::from_json(serde_json::json!({"id": 42, "tags": ["a", "b"]}));
    let message = Message::with_topic(payload, "orders/new/42");
    let scope = expr::Scope::default();

    let rendered = expr::render_template(&message, &scope, "order={{json://input.payload}} topic={{input.topic}}");

    assert_eq!(rendered, "order={\"id\":42,\"tags\":[\"a\",\"b\"]} topic=orders/new/42");
}
