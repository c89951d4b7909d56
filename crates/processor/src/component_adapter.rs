//! Adapts a [`component::Component`] into an [`AsyncProcessor`], so the flow
//! engine can drive any component through the same signal-handling, effect
//! emission, and lifecycle machinery already built for processors.

use async_trait::async_trait;
use component::{ConfigAccessor, Outcome};
use expr::Scope;
use message::Message;
use signal::Signal;

use crate::{effect::EffectHandler, AsyncProcessor, Error, EngineHandler};

/// An ordered input transform applied to the message before the wrapped
/// component is invoked, followed by evaluation of `input_selection` to
/// produce the `data` argument passed to `Component::invoke`.
pub struct InputStage {
    /// Transforms applied, in order, before invocation. Each transform may
    /// write into `user_data`/`previous` via its own output expression.
    pub transforms: Vec<expr::transform::Transform>,
    /// Expression evaluated to produce the value handed to
    /// `Component::invoke` as `data`. Defaults to `"previous"`.
    pub input_selection: String,
}

impl Default for InputStage {
    fn default() -> Self {
        Self {
            transforms: Vec::new(),
            input_selection: "previous".to_string(),
        }
    }
}

/// Wraps a [`component::Component`] so it can run as an [`AsyncProcessor`]
/// inside a component group.
pub struct ComponentProcessor {
    component: Box<dyn component::Component>,
    input: InputStage,
    config: ConfigAccessor,
    error_sender: Option<flume::Sender<Vec<Message>>>,
}

impl ComponentProcessor {
    /// Builds a processor driving `component`, applying `input` before each
    /// invocation.
    pub fn new(component: Box<dyn component::Component>, input: InputStage, config: ConfigAccessor) -> Self {
        Self {
            component,
            input,
            config,
            error_sender: None,
        }
    }

    /// Routes a best-effort copy of every message this component nacks to
    /// `sender` (the entry queue of a connector-level error flow), alongside
    /// the normal nack. Never blocks the component: a full error queue just
    /// drops the copy.
    pub fn with_error_sender(mut self, sender: flume::Sender<Vec<Message>>) -> Self {
        self.error_sender = Some(sender);
        self
    }

    fn forward_to_error_flow(&self, mut message: Message, component: &str, reason: &str) {
        let Some(sender) = &self.error_sender else { return };
        message.set_user_data("error_component", message::PayloadValue::Text(component.to_string()));
        message.set_user_data("error_reason", message::PayloadValue::Text(reason.to_string()));
        if sender.try_send(vec![message]).is_err() {
            tracing::trace!(component, reason, "error flow queue full or closed, dropping error copy");
        }
    }

    fn select_data(&self, message: &Message) -> Option<message::PayloadValue> {
        let scope = Scope::default();
        expr::evaluate(message, &scope, &self.input.input_selection)
    }

    /// The configuration accessor this component was constructed with,
    /// exposed for callers that need to re-derive settings (e.g. the error
    /// flow wiring reading a component's `error_topic` override).
    pub fn config(&self) -> &ConfigAccessor {
        &self.config
    }

    async fn invoke_one(
        &mut self,
        mut message: Message,
        effect_handler: &mut EffectHandler<Message>,
    ) -> Result<(), Error> {
        let info = self.component.info();

        if let Err(err) = expr::transform::apply_all(&mut message, &self.input.transforms) {
            let reason = format!("input transform failed: {err}");
            effect_handler.error(reason.clone(), Some(format!("component: {}", info.name)));
            self.forward_to_error_flow(message.clone(), &info.name, &reason);
            message.nack(&reason);
            return Ok(());
        }

        let data = self.select_data(&message);

        match self.component.invoke(&message, data).await {
            Ok(Outcome::Emit(payload)) => {
                // `out` shares `message`'s ack state; it resolves only once
                // some later stage acks/nacks or discards it. `payload` is
                // this invoke's result, so it becomes `previous` for the next
                // component's default `input_selection`; the message's own
                // `payload` (the originating input) is left untouched.
                let mut out = message.clone();
                out.set_previous(payload);
                effect_handler.emit_message(out);
            }
            Ok(Outcome::EmitMany(payloads)) => {
                let handle = message.begin_iteration(payloads.len());
                for payload in payloads {
                    let child = handle.child(&message, payload);
                    effect_handler.emit_message(child);
                }
            }
            Ok(Outcome::Discard) => {
                message.discard();
            }
            Ok(Outcome::NoOutput) => {
                // The component has taken responsibility for this message
                // (e.g. buffered it for a later timer-triggered emission);
                // leave ack/nack to it.
            }
            Err(err) => {
                let reason = err.to_string();
                effect_handler.error(reason.clone(), Some(format!("component: {}", info.name)));
                self.forward_to_error_flow(message.clone(), &info.name, &reason);
                message.nack(&reason);
            }
        }

        Ok(())
    }
}

#[async_trait]
impl AsyncProcessor<Message> for ComponentProcessor {
    async fn init(&mut self, _engine_handler: &mut EngineHandler) -> Result<(), Error> {
        Ok(())
    }

    async fn stop(&mut self) -> Result<(), Error> {
        self.component
            .stop()
            .await
            .map_err(|err| Error::Processor {
                processor: self.component.info().name,
                error: err.to_string(),
                context: Default::default(),
            })
    }

    async fn process(&mut self, signal: Signal<Message>, effect_handler: &mut EffectHandler<Message>) -> Result<(), Error> {
        match signal {
            Signal::Messages { messages } => {
                for message in messages {
                    self.invoke_one(message, effect_handler).await?;
                }
                Ok(())
            }
            Signal::TimerTick { timer_id: Some(timer_id), payload, .. } => {
                let outcomes = self.component.handle_timer_event(&timer_id, payload).await.map_err(|err| Error::Processor {
                    processor: self.component.info().name,
                    error: err.to_string(),
                    context: Default::default(),
                })?;
                for outcome in outcomes {
                    emit_outcome(outcome, effect_handler);
                }
                Ok(())
            }
            Signal::CacheExpiry { cache_name, key, metadata, expired_data } => {
                let outcomes = self
                    .component
                    .handle_cache_expiry_event(&cache_name, &key, metadata, expired_data)
                    .await
                    .map_err(|err| Error::Processor {
                        processor: self.component.info().name,
                        error: err.to_string(),
                        context: Default::default(),
                    })?;
                for outcome in outcomes {
                    emit_outcome(outcome, effect_handler);
                }
                Ok(())
            }
            Signal::TimerTick { timer_id: None, .. } => Ok(()),
            Signal::Stop => Ok(()),
        }
    }
}

fn emit_outcome(outcome: Outcome, effect_handler: &mut EffectHandler<Message>) {
    match outcome {
        Outcome::Emit(payload) => effect_handler.emit_message(Message::new(payload)),
        Outcome::EmitMany(payloads) => {
            effect_handler.emit_messages(payloads.into_iter().map(Message::new).collect());
        }
        Outcome::Discard | Outcome::NoOutput => {}
    }
}

#[cfg(test)]
mod test {
    use async_trait::async_trait;
    use component::{Component, ComponentInfo};
    use message::PayloadValue;
    use task::labels::TaskLabels;

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

        async fn invoke(&mut self, _message: &Message, data: Option<PayloadValue>) -> Result<Outcome, component::Error> {
            match data {
                Some(value) => Ok(Outcome::Emit(PayloadValue::Text(value.as_text().to_uppercase()))),
                None => Ok(Outcome::Discard),
            }
        }
    }

    #[tokio::test]
    async fn emits_transformed_payload() {
        let mut processor = ComponentProcessor::new(
            Box::new(UppercaseComponent),
            InputStage {
                transforms: Vec::new(),
                input_selection: "input.payload".to_string(),
            },
            ConfigAccessor::default(),
        );

        let message = Message::new(PayloadValue::Text("hi".into()));
        let task_labels = TaskLabels::new("component", "uppercase", "flow-1");
        let mut effect_handler = EffectHandler::with_sender_map("p1".into(), &task_labels, Default::default());

        processor
            .process(Signal::Messages { messages: vec![message] }, &mut effect_handler)
            .await
            .unwrap();

        let emitted = effect_handler.execute_effects().await;
        assert_eq!(emitted.len(), 1);
        assert_eq!(emitted[0].payload().as_text(), "hi");
        assert_eq!(emitted[0].previous().map(PayloadValue::as_text), Some("HI".to_string()));
    }
}
