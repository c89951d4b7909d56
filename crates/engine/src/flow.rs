//! Wires a flow's configured components into a running pipeline.
//!
//! Each component gets its own bounded queue and a pool of worker instances
//! sharing it; a group's workers forward the messages they emit into the
//! next group's queue, exactly as the teacher's receiver -> processor chain
//! -> exporter fan-out wired stages together, generalized here to an
//! arbitrary number of per-component stages instead of three fixed ones.
//! Shutdown needs no in-band stop message: closing a group's input queue
//! drains it, its workers exit, and their dropped downstream senders close
//! the next group's queue in turn.

use std::collections::HashMap;

use component::{ConfigAccessor, ConfigValue, Registry};
use config::ComponentConfig;
use message::Message;
use processor::{
    component_adapter::{ComponentProcessor, InputStage},
    effect::EffectHandler,
    AsyncProcessor,
};
use services::RuntimeServices;
use signal::{Signal, SignalReceiver, SideSignal};
use task::{
    labels::{ProcessLabels, TaskLabels},
    TaskManager,
};

use crate::Error;

/// Used when a component's configuration doesn't set `queue_depth`.
const DEFAULT_QUEUE_DEPTH: usize = 5;
/// Bound of a component instance's private timer/cache side channel.
const SIDE_CHANNEL_DEPTH: usize = 16;

/// A started, ordered chain of component groups. Dropping (or calling
/// [`Flow::stop`]) closes every group's input queue; the components
/// themselves keep running, registered with the shared `TaskManager`, until
/// their queues drain.
pub struct Flow {
    name: String,
    entry: Option<flume::Sender<Vec<Message>>>,
    group_senders: Vec<flume::Sender<Vec<Message>>>,
}

impl Flow {
    /// Builds and starts every component group in `components`, in order,
    /// each forwarding into the next; the last group forwards into
    /// `downstream` (another flow's entry, or `None` if this flow has no
    /// successor and its tail components ack what they emit themselves).
    ///
    /// Disabled components are skipped entirely, as if absent from the
    /// configuration.
    #[allow(clippy::too_many_arguments)]
    pub fn start(
        flow_name: &str,
        components: &[ComponentConfig],
        app_config: &HashMap<String, ConfigValue>,
        registry: &Registry,
        services: &RuntimeServices,
        process_labels: &ProcessLabels,
        task_manager: &mut TaskManager,
        downstream: Option<flume::Sender<Vec<Message>>>,
    ) -> Result<Self, Error> {
        Self::start_with_error_flow(flow_name, components, app_config, registry, services, process_labels, task_manager, downstream, None)
    }

    /// Like [`Flow::start`], additionally forwarding a best-effort copy of
    /// every message a component nacks to `error_sender` (typically the
    /// entry queue of the connector's error flow).
    #[allow(clippy::too_many_arguments)]
    pub fn start_with_error_flow(
        flow_name: &str,
        components: &[ComponentConfig],
        app_config: &HashMap<String, ConfigValue>,
        registry: &Registry,
        services: &RuntimeServices,
        process_labels: &ProcessLabels,
        task_manager: &mut TaskManager,
        downstream: Option<flume::Sender<Vec<Message>>>,
        error_sender: Option<flume::Sender<Vec<Message>>>,
    ) -> Result<Self, Error> {
        let enabled: Vec<&ComponentConfig> = components.iter().filter(|c| !c.disabled).collect();

        // Built back-to-front so every group already knows its downstream
        // sender by the time it spawns its workers.
        let mut group_senders = Vec::with_capacity(enabled.len());
        let mut next_downstream = downstream;
        let mut built_in_reverse = Vec::with_capacity(enabled.len());
        for component_config in enabled.into_iter().rev() {
            let sender = start_group(
                flow_name,
                component_config,
                app_config,
                registry,
                services,
                process_labels,
                task_manager,
                next_downstream.clone(),
                error_sender.clone(),
            )?;
            next_downstream = Some(sender.clone());
            built_in_reverse.push(sender);
        }
        built_in_reverse.reverse();
        group_senders.extend(built_in_reverse);

        let entry = group_senders.first().cloned();

        Ok(Self {
            name: flow_name.to_string(),
            entry,
            group_senders,
        })
    }

    /// The flow's name, as declared in configuration.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The sender feeding this flow's first component group, if it has at
    /// least one enabled component.
    pub fn entry_sender(&self) -> Option<flume::Sender<Vec<Message>>> {
        self.entry.clone()
    }

    /// Closes every group's input queue. Component instances drain their
    /// queues and stop on their own; join them via the `TaskManager` they
    /// were registered with.
    pub fn stop(self) {
        drop(self);
    }
}

/// Starts one component's queue and worker pool, returning the sender
/// used to feed it (kept by the caller as either the flow's entry or the
/// preceding group's downstream).
#[allow(clippy::too_many_arguments)]
#[allow(clippy::too_many_arguments)]
fn start_group(
    flow_name: &str,
    component_config: &ComponentConfig,
    app_config: &HashMap<String, ConfigValue>,
    registry: &Registry,
    services: &RuntimeServices,
    process_labels: &ProcessLabels,
    task_manager: &mut TaskManager,
    downstream: Option<flume::Sender<Vec<Message>>>,
    error_sender: Option<flume::Sender<Vec<Message>>>,
) -> Result<flume::Sender<Vec<Message>>, Error> {
    let queue_depth = if component_config.queue_depth == 0 {
        DEFAULT_QUEUE_DEPTH
    } else {
        component_config.queue_depth
    };
    let (sender, receiver) = flume::bounded(queue_depth);

    for instance in 0..component_config.num_instances {
        let accessor = ConfigAccessor::new(component_config.component_config.clone(), app_config.clone());
        let (side_sender, side_receiver) = flume::bounded(SIDE_CHANNEL_DEPTH);

        let component = registry
            .create(
                &component_config.name,
                &component_config.component_type,
                accessor.clone(),
                services.clone(),
                side_sender,
            )
            .map_err(|err| Error::ComponentConstruction {
                component: component_config.name.clone(),
                error: err.to_string(),
            })?;

        let input = InputStage {
            transforms: component_config.input_transforms.clone(),
            input_selection: component_config.input_selection.clone(),
        };
        let mut processor = ComponentProcessor::new(component, input, accessor);
        if let Some(error_sender) = &error_sender {
            processor = processor.with_error_sender(error_sender.clone());
        }

        let task_labels = TaskLabels::new(
            "component",
            &format!("{}/{}#{instance}", component_config.name, instance),
            flow_name,
        );

        let join_handle = tokio::task::spawn(run_instance(
            processor,
            process_labels.clone(),
            task_labels.clone(),
            receiver.clone(),
            side_receiver,
            downstream.clone(),
        ));

        task_manager.register(join_handle, &task_labels);
    }

    Ok(sender)
}

/// Drives one component instance: pulls signals (messages, timer ticks,
/// cache expiries) off its queue and side channel, invokes the component,
/// and forwards whatever it emits downstream. Returns once the channel
/// closes (`Signal::Stop`), after calling the component's `stop` hook.
async fn run_instance(
    mut processor: ComponentProcessor,
    process_labels: ProcessLabels,
    task_labels: TaskLabels,
    receiver: flume::Receiver<Vec<Message>>,
    side_channel: flume::Receiver<SideSignal>,
    downstream: Option<flume::Sender<Vec<Message>>>,
) -> Box<dyn task::TaskCleaner> {
    let mut signal_receiver = SignalReceiver::with_side_channel(receiver, side_channel);
    let mut effect_handler = EffectHandler::with_sender_map(process_labels.process_id.clone(), &task_labels, HashMap::new());

    if let Err(error) = processor.init(&mut processor::EngineHandler::default()).await {
        tracing::error!(
            process_id = %process_labels.process_id,
            task_id = %task_labels.task_id,
            %error,
            "component init hook failed"
        );
    }

    loop {
        let signal = signal_receiver.recv().await;
        if matches!(signal, Signal::Stop) {
            break;
        }
        let signal_name = signal.name();

        if let Err(error) = processor.process(signal, &mut effect_handler).await {
            tracing::error!(
                process_id = %process_labels.process_id,
                task_cat = %task_labels.task_cat,
                task_id = %task_labels.task_id,
                task_source = %task_labels.task_source,
                %signal_name,
                %error,
                "component processing failed"
            );
            continue;
        }

        let messages = effect_handler.execute_effects().await;
        if messages.is_empty() {
            continue;
        }

        match &downstream {
            Some(downstream) => {
                if downstream.send_async(messages).await.is_err() {
                    tracing::warn!(
                        process_id = %process_labels.process_id,
                        task_id = %task_labels.task_id,
                        "downstream component group is gone, dropping emitted messages"
                    );
                }
            }
            // No further component in this flow: nothing else will ack
            // these, so ack them here rather than leaking the delivery.
            None => {
                let emitted = messages.len();
                for message in messages {
                    message.ack();
                }
                tracing::debug!(
                    process_id = %process_labels.process_id,
                    task_id = %task_labels.task_id,
                    %emitted,
                    "flow has no further components; emitted messages acked"
                );
            }
        }
    }

    if let Err(error) = processor.stop().await {
        tracing::error!(
            process_id = %process_labels.process_id,
            task_id = %task_labels.task_id,
            %error,
            "component stop hook failed"
        );
    }

    tracing::info!(
        process_id = %process_labels.process_id,
        task_cat = %task_labels.task_cat,
        task_id = %task_labels.task_id,
        task_source = %task_labels.task_source,
        "component instance stopped"
    );

    TaskManager::no_task_cleaner(process_labels, task_labels)
}

#[cfg(test)]
mod test {
    use async_trait::async_trait;
    use component::{Component, ComponentFactory, ComponentInfo, Outcome};
    use config::FlowConfig;
    use message::PayloadValue;

    use super::*;

    struct UppercaseComponent;

    #[async_trait]
    impl Component for UppercaseComponent {
        fn info(&self) -> ComponentInfo {
            ComponentInfo {
                name: "uppercase".into(),
                component_type: "uppercase".into(),
            }
        }

        async fn invoke(&mut self, message: &Message, data: Option<PayloadValue>) -> Result<Outcome, component::Error> {
            let data = data.unwrap_or_else(|| message.payload().clone());
            Ok(Outcome::Emit(PayloadValue::Text(data.as_text().to_uppercase())))
        }
    }

    struct UppercaseFactory;

    impl ComponentFactory for UppercaseFactory {
        fn create(
            &self,
            _name: &str,
            _component_type: &str,
            _config: ConfigAccessor,
            _services: RuntimeServices,
            _side_channel: flume::Sender<SideSignal>,
        ) -> Result<Box<dyn Component>, component::Error> {
            Ok(Box::new(UppercaseComponent))
        }
    }

    fn test_registry() -> Registry {
        let mut registry = Registry::new();
        registry.register("uppercase", std::sync::Arc::new(UppercaseFactory)).unwrap();
        registry
    }

    #[tokio::test]
    async fn two_component_flow_chains_previous() {
        let registry = test_registry();
        let services = RuntimeServices::new();
        let process_labels = ProcessLabels::new("test-process");
        let mut task_manager = TaskManager::with_process_labels(process_labels.clone());

        let first = ComponentConfig {
            name: "first".into(),
            component_type: "uppercase".into(),
            num_instances: 1,
            queue_depth: 4,
            disabled: false,
            component_config: HashMap::new(),
            input_transforms: Vec::new(),
            input_selection: "input.payload".into(),
            subscriptions: Vec::new(),
        };
        let second = ComponentConfig {
            name: "second".into(),
            component_type: "uppercase".into(),
            num_instances: 1,
            queue_depth: 4,
            disabled: false,
            component_config: HashMap::new(),
            input_transforms: Vec::new(),
            input_selection: "previous".into(),
            subscriptions: Vec::new(),
        };
        let flow_config = FlowConfig {
            name: "flow-1".into(),
            components: vec![first, second],
        };

        let (sink_sender, sink_receiver) = flume::bounded::<Vec<Message>>(4);

        let flow = Flow::start(
            &flow_config.name,
            &flow_config.components,
            &HashMap::new(),
            &registry,
            &services,
            &process_labels,
            &mut task_manager,
            Some(sink_sender),
        )
        .unwrap();

        let entry = flow.entry_sender().unwrap();
        entry
            .send_async(vec![Message::new(PayloadValue::Text("hi".into()))])
            .await
            .unwrap();

        let received = sink_receiver.recv_async().await.unwrap();
        assert_eq!(received.len(), 1);
        // "first" uppercases into `previous`; "second" reads `previous` and
        // uppercases again, which is idempotent on already-uppercase text.
        assert_eq!(received[0].previous().unwrap().as_text(), "HI");

        drop(entry);
        flow.stop();
        task_manager.join().await;
    }
}
