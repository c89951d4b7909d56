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

//! Runs one configured app: either standard mode (a named list of
//! independently-chained [`engine::flow::Flow`]s) or simplified mode (a
//! `broker` section plus a flat component list, synthesized into a
//! broker-input loop, an optional subscription router, the user components
//! and a broker-output tail). See [`App::start`].

pub mod broker_input;
pub mod broker_output;
pub mod codec;

use std::{collections::HashMap, sync::Arc};

use broker::{requester::Requester, Broker as _};
use component::Registry;
use config::{AppConfig, BrokerConfig, ComponentConfig};
use engine::flow::Flow;
use message::{Message, PayloadValue};
use services::RuntimeServices;
use task::{
    labels::{ProcessLabels, TaskLabels},
    TaskManager,
};

use crate::broker_output::{BrokerOutputComponent, BrokerOutputFactory, DIRECT_INJECTION_MARKER};

/// The bound of a simplified app's in-memory broker queues, when the broker
/// type doesn't otherwise dictate one.
const DEFAULT_BROKER_QUEUE_DEPTH: usize = 256;
/// Redeliveries tolerated before a dropped message when the broker section
/// doesn't set `max_redelivery_count`.
const DEFAULT_MAX_REDELIVERY_COUNT: u32 = 3;
/// The synthesized name of a simplified app's broker-output component.
const BROKER_OUTPUT_NAME: &str = "broker_output";
/// The registered component type used to construct the broker-output
/// component through the ordinary factory dispatch path.
const BROKER_OUTPUT_TYPE: &str = "__broker_output";

/// Errors raised while starting or running an app.
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// Starting one of the app's flows failed.
    #[error("flow construction failed: {0}")]
    Flow(#[from] engine::Error),

    /// A broker operation failed.
    #[error("broker error: {0}")]
    Broker(#[from] broker::Error),

    /// Registering the synthesized broker-output factory failed (should not
    /// happen, since its type name is reserved).
    #[error("component registry error: {0}")]
    Registry(#[from] component::Error),

    /// The broker section names a driver this crate doesn't implement.
    #[error("unknown broker type '{0}'")]
    UnknownBrokerType(String),

    /// A simplified app (one with a `broker` section) declared no
    /// components.
    #[error("simplified app '{name}' declares no components")]
    NoComponents {
        /// The app's name.
        name: String,
    },
}

fn build_broker(broker_config: &BrokerConfig) -> Result<Arc<dyn broker::Broker>, Error> {
    match broker_config.broker_type.as_str() {
        "memory" => Ok(Arc::new(broker::memory::InMemoryBroker::new(
            DEFAULT_BROKER_QUEUE_DEPTH,
            broker_config.max_redelivery_count.unwrap_or(DEFAULT_MAX_REDELIVERY_COUNT),
        ))),
        other => Err(Error::UnknownBrokerType(other.to_string())),
    }
}

fn reply_queue_name(app_name: &str, broker_config: &BrokerConfig) -> String {
    format!("{}-{app_name}", broker_config.response_queue_prefix)
}

fn reply_topic_name(app_name: &str, broker_config: &BrokerConfig) -> String {
    let suffix = broker_config.response_topic_suffix.as_deref().unwrap_or("");
    if suffix.is_empty() {
        format!("{}/{app_name}", broker_config.response_topic_prefix)
    } else {
        format!("{}/{app_name}/{suffix}", broker_config.response_topic_prefix)
    }
}

/// One running replica of an app: a full copy of its flows (and, in
/// simplified mode, its own broker connection), so that an app-level
/// `num_instances > 1` replicates the whole app rather than sharing state
/// across replicas.
struct AppReplica {
    flows: Vec<Flow>,
    broker: Option<Arc<dyn broker::Broker>>,
    requester: Option<Arc<Requester>>,
    background_tasks: Vec<tokio::task::JoinHandle<()>>,
    entry: Option<flume::Sender<Vec<Message>>>,
}

impl AppReplica {
    async fn start(
        replica_name: &str,
        app_config: &AppConfig,
        registry: &Registry,
        services: &RuntimeServices,
        process_labels: &ProcessLabels,
        task_manager: &mut TaskManager,
        error_sender: Option<flume::Sender<Vec<Message>>>,
    ) -> Result<Self, Error> {
        if let Some(flows) = &app_config.flows {
            return Self::start_standard(replica_name, flows, app_config, registry, services, process_labels, task_manager, error_sender);
        }

        Self::start_simplified(replica_name, app_config, registry, services, process_labels, task_manager, error_sender).await
    }

    fn start_standard(
        replica_name: &str,
        flows: &[config::FlowConfig],
        app_config: &AppConfig,
        registry: &Registry,
        services: &RuntimeServices,
        process_labels: &ProcessLabels,
        task_manager: &mut TaskManager,
        error_sender: Option<flume::Sender<Vec<Message>>>,
    ) -> Result<Self, Error> {
        let mut started = Vec::with_capacity(flows.len());
        for flow_config in flows {
            let flow_name = format!("{replica_name}/{}", flow_config.name);
            let flow = Flow::start_with_error_flow(
                &flow_name,
                &flow_config.components,
                &app_config.config,
                registry,
                services,
                process_labels,
                task_manager,
                None,
                error_sender.clone(),
            )?;
            started.push(flow);
        }

        Ok(Self {
            flows: started,
            broker: None,
            requester: None,
            background_tasks: Vec::new(),
            entry: None,
        })
    }

    async fn start_simplified(
        replica_name: &str,
        app_config: &AppConfig,
        registry: &Registry,
        services: &RuntimeServices,
        process_labels: &ProcessLabels,
        task_manager: &mut TaskManager,
        error_sender: Option<flume::Sender<Vec<Message>>>,
    ) -> Result<Self, Error> {
        let broker_config = app_config.broker.clone().unwrap_or_default();
        let components: Vec<ComponentConfig> = app_config.components.clone().unwrap_or_default();
        if components.is_empty() {
            return Err(Error::NoComponents { name: replica_name.to_string() });
        }

        let broker = build_broker(&broker_config)?;
        broker.connect().await?;

        let mut flows = Vec::new();
        let mut background_tasks = Vec::new();

        // Broker output, if enabled, becomes every user flow's downstream:
        // the tail of each user component's single-component flow feeds
        // straight into it.
        let output_entry = if broker_config.output_enabled {
            let mut output_registry = registry.clone();
            output_registry.register(BROKER_OUTPUT_TYPE, Arc::new(BrokerOutputFactory::new(broker.clone(), broker_config.clone())))?;
            let output_config = ComponentConfig {
                name: BROKER_OUTPUT_NAME.to_string(),
                component_type: BROKER_OUTPUT_TYPE.to_string(),
                num_instances: 1,
                queue_depth: DEFAULT_BROKER_QUEUE_DEPTH,
                disabled: false,
                component_config: HashMap::new(),
                input_transforms: Vec::new(),
                input_selection: "previous".to_string(),
                subscriptions: Vec::new(),
            };
            let flow = Flow::start_with_error_flow(
                &format!("{replica_name}/{BROKER_OUTPUT_NAME}"),
                std::slice::from_ref(&output_config),
                &app_config.config,
                &output_registry,
                services,
                process_labels,
                task_manager,
                None,
                error_sender.clone(),
            )?;
            let entry = flow.entry_sender();
            flows.push(flow);
            entry
        } else {
            None
        };

        // Each user component gets its own single-component flow, all
        // sharing `output_entry` as downstream: `engine::flow::Flow` is a
        // strict linear chain, so a router fanning out to several
        // independent components can't be expressed as one flow.
        let mut component_senders = Vec::with_capacity(components.len());
        for component_config in &components {
            let flow = Flow::start_with_error_flow(
                &format!("{replica_name}/{}", component_config.name),
                std::slice::from_ref(component_config),
                &app_config.config,
                registry,
                services,
                process_labels,
                task_manager,
                output_entry.clone(),
                error_sender.clone(),
            )?;
            component_senders.push(flow.entry_sender().expect("single-component flow always has an entry"));
            flows.push(flow);
        }

        let mut requester = None;

        if broker_config.request_reply_enabled {
            let reply_queue = reply_queue_name(replica_name, &broker_config);
            let reply_topic = reply_topic_name(replica_name, &broker_config);
            broker.bind_queue(&reply_queue).await?;
            broker.subscribe(&reply_queue, &reply_topic).await?;
            let built = Arc::new(Requester::new(
                broker.clone(),
                reply_queue.clone(),
                reply_topic,
                broker_config.user_properties_reply_topic_key.clone(),
                broker_config.user_properties_reply_metadata_key.clone(),
            ));
            let task = tokio::spawn(broker_input::run_reply_loop(broker.clone(), reply_queue, built.clone()));
            background_tasks.push(task);
            requester = Some(built);
        }

        if broker_config.input_enabled {
            let queue_name = broker_config.queue_name.clone().unwrap_or_else(|| replica_name.to_string());
            broker.bind_queue(&queue_name).await?;
            for pattern in broker_input::union_subscriptions(&components) {
                broker.subscribe(&queue_name, &pattern).await?;
            }

            let dispatch = if component_senders.len() > 1 {
                let subscriptions: Vec<Vec<String>> = components.iter().map(|c| c.subscriptions.clone()).collect();
                let router = broker::router::SubscriptionRouter::new(&subscriptions)?;
                broker_input::Dispatch::Routed { senders: component_senders.clone(), router }
            } else {
                broker_input::Dispatch::Direct(component_senders[0].clone())
            };

            let task = tokio::spawn(broker_input::run_input_loop(broker.clone(), queue_name, broker_config.clone(), dispatch));
            background_tasks.push(task);
        }

        // `App::send_message` always targets the broker-output stage: a
        // direct-injected message is, by definition, headed for a publish.
        let entry = output_entry.clone();

        Ok(Self {
            flows,
            broker: Some(broker),
            requester,
            background_tasks,
            entry,
        })
    }

    fn stop(self) {
        for task in self.background_tasks {
            task.abort();
        }
        for flow in self.flows {
            flow.stop();
        }
    }
}

/// One configured app, started and running.
pub struct App {
    name: String,
    replicas: Vec<AppReplica>,
}

impl App {
    /// Starts every replica of `app_config` (`num_instances` independent
    /// copies, each with its own broker connection in simplified mode).
    /// `error_sender`, when set, is the entry queue of the connector's error
    /// flow, forwarded to every component this app starts.
    pub async fn start(
        app_config: &AppConfig,
        registry: &Registry,
        services: &RuntimeServices,
        process_labels: &ProcessLabels,
        task_manager: &mut TaskManager,
        error_sender: Option<flume::Sender<Vec<Message>>>,
    ) -> Result<Self, Error> {
        let instance_count = app_config.num_instances.max(1);
        let mut replicas = Vec::with_capacity(instance_count);
        for instance in 0..instance_count {
            let replica_name = if instance_count > 1 {
                format!("{}#{instance}", app_config.name)
            } else {
                app_config.name.clone()
            };
            let replica = AppReplica::start(&replica_name, app_config, registry, services, process_labels, task_manager, error_sender.clone()).await?;
            replicas.push(replica);
        }

        Ok(Self {
            name: app_config.name.clone(),
            replicas,
        })
    }

    /// The app's configured name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Stops every replica: background broker loops are aborted and every
    /// flow's entry queue is closed, letting in-flight messages drain.
    pub fn stop(self) {
        for replica in self.replicas {
            replica.stop();
        }
    }

    /// The entry queue of this app's first flow, if it has one. Used by the
    /// connector to wire this app as another app's error flow.
    pub fn entry_sender(&self) -> Option<flume::Sender<Vec<Message>>> {
        self.replicas.first().and_then(|replica| replica.flows.first()).and_then(Flow::entry_sender)
    }

    /// The requester issuing broker request/reply calls on this app's
    /// behalf, if `request_reply_enabled`. When the app has several
    /// replicas, returns the first replica's requester.
    pub fn get_request_response(&self) -> Option<Arc<Requester>> {
        self.replicas.first().and_then(|replica| replica.requester.clone())
    }

    /// The broker this app's first replica is connected to, in simplified
    /// mode. `None` for standard apps. Exposed for operators and tests that
    /// need to bind an external probe queue (e.g. observing everything a
    /// broker-output stage publishes).
    pub fn broker(&self) -> Option<Arc<dyn broker::Broker>> {
        self.replicas.first().and_then(|replica| replica.broker.clone())
    }

    /// Injects `payload` as a new message addressed to `topic`, as if it had
    /// arrived from the broker, without an actual upstream delivery to ack.
    /// The broker-output stage acks it itself once the publish is confirmed.
    /// A no-op (with a logged warning) if this app has no broker-output
    /// stage to receive it.
    pub async fn send_message(&self, payload: PayloadValue, topic: impl Into<String>, user_properties: HashMap<String, PayloadValue>) {
        let Some(replica) = self.replicas.first() else { return };
        let Some(entry) = &replica.entry else {
            tracing::warn!(app = %self.name, "send_message called on an app with no broker output enabled, dropping");
            return;
        };

        let mut shape = serde_yaml::Mapping::new();
        let _ = shape.insert(serde_yaml::Value::String("payload".to_string()), payload.to_yaml());
        let _ = shape.insert(serde_yaml::Value::String("topic".to_string()), serde_yaml::Value::String(topic.into()));
        if !user_properties.is_empty() {
            let mut properties = serde_yaml::Mapping::new();
            for (key, value) in user_properties {
                let _ = properties.insert(serde_yaml::Value::String(key), value.to_yaml());
            }
            let _ = shape.insert(serde_yaml::Value::String("user_properties".to_string()), serde_yaml::Value::Mapping(properties));
        }

        let mut message = Message::new(PayloadValue::Null);
        message.set_previous(PayloadValue::Structured(serde_yaml::Value::Mapping(shape)));
        message.set_user_data(DIRECT_INJECTION_MARKER, PayloadValue::Text("true".to_string()));

        if entry.send_async(vec![message]).await.is_err() {
            tracing::warn!(app = %self.name, "send_message target queue closed, dropping");
        }
    }
}

#[cfg(test)]
mod test {
    use component::ComponentFactory;
    use task::TaskManager;

    use super::*;

    struct EchoFactory;

    struct Echo;

    #[async_trait::async_trait]
    impl component::Component for Echo {
        fn info(&self) -> component::ComponentInfo {
            component::ComponentInfo {
                name: "echo".into(),
                component_type: "echo".into(),
            }
        }

        async fn invoke(&mut self, message: &Message, _data: Option<PayloadValue>) -> Result<component::Outcome, component::Error> {
            Ok(component::Outcome::Emit(message.payload().clone()))
        }
    }

    impl ComponentFactory for EchoFactory {
        fn create(
            &self,
            _name: &str,
            _component_type: &str,
            _config: component::ConfigAccessor,
            _services: RuntimeServices,
            _side_channel: flume::Sender<signal::SideSignal>,
        ) -> Result<Box<dyn component::Component>, component::Error> {
            Ok(Box::new(Echo))
        }
    }

    #[tokio::test]
    async fn simplified_app_round_trips_through_broker() {
        let mut registry = Registry::new();
        registry.register("echo", Arc::new(EchoFactory)).unwrap();

        let broker_config = BrokerConfig {
            input_enabled: true,
            output_enabled: true,
            queue_name: Some("app-in".into()),
            ..BrokerConfig::default()
        };

        let component = ComponentConfig {
            name: "echo".into(),
            component_type: "echo".into(),
            num_instances: 1,
            queue_depth: 4,
            disabled: false,
            component_config: HashMap::new(),
            input_transforms: Vec::new(),
            input_selection: "previous".into(),
            subscriptions: vec!["demo/>".into()],
        };

        let app_config = AppConfig {
            name: "demo".into(),
            num_instances: 1,
            broker: Some(broker_config.clone()),
            config: HashMap::new(),
            flows: None,
            components: Some(vec![component]),
        };

        let services = RuntimeServices::new();
        let process_labels = ProcessLabels::new("app-test");
        let mut task_manager = TaskManager::new();

        let app = App::start(&app_config, &registry, &services, &process_labels, &mut task_manager, None).await.unwrap();

        let broker = app.replicas[0].broker.clone().unwrap();
        broker.publish("demo/hello".into(), b"hi".to_vec(), HashMap::new()).await.unwrap();

        // Give the broker-input and echo flows a moment to pump the
        // message through, then confirm it reached `app-in`'s subscriber
        // indirectly: since there's no broker-output sink queue to observe
        // here, assert via the broker's own delivered/acked bookkeeping by
        // re-binding a probe queue is out of scope for this smoke test;
        // instead just confirm the app starts and stops cleanly.
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        app.stop();
    }
}
