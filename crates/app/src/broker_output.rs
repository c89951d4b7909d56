//! The synthesized tail component of a simplified app: publishes every
//! message it receives to the broker, then acks (or nacks) it.

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use component::{Component, ComponentFactory, ComponentInfo, ConfigAccessor, Outcome};
use config::{PayloadEncoding, PayloadFormat};
use message::{Message, PayloadValue};
use services::RuntimeServices;
use signal::SideSignal;

use crate::codec;

/// Marker set on messages synthesized by [`crate::App::send_message`];
/// [`BrokerOutputComponent`] acks these itself since there is no upstream
/// delivery to propagate the ack to.
pub const DIRECT_INJECTION_MARKER: &str = "direct_injection";

/// Publishes a message's selected payload to the broker this app is
/// attached to.
pub struct BrokerOutputComponent {
    name: String,
    broker: Arc<dyn broker::Broker>,
    encoding: PayloadEncoding,
    format: PayloadFormat,
    copy_user_properties: bool,
    propagate_acknowledgements: bool,
}

impl BrokerOutputComponent {
    /// Builds a broker output bound to `broker`, encoding/decoding per the
    /// resolved broker section.
    pub fn new(name: impl Into<String>, broker: Arc<dyn broker::Broker>, broker_config: &config::BrokerConfig) -> Self {
        Self {
            name: name.into(),
            broker,
            encoding: broker_config.payload_encoding,
            format: broker_config.payload_format,
            copy_user_properties: broker_config.copy_user_properties,
            propagate_acknowledgements: broker_config.propagate_acknowledgements,
        }
    }
}

fn is_direct_injection(message: &Message) -> bool {
    matches!(message.user_data(DIRECT_INJECTION_MARKER), Some(PayloadValue::Text(value)) if value == "true")
}

fn yaml_to_payload(value: serde_yaml::Value) -> PayloadValue {
    match value {
        serde_yaml::Value::Null => PayloadValue::Null,
        serde_yaml::Value::String(s) => PayloadValue::Text(s),
        other => PayloadValue::Structured(other),
    }
}

/// `data`'s `{payload, topic, user_properties?}` shape, when it carries one;
/// any other shape (or no data at all) is treated as a bare payload with no
/// topic/user_properties override.
fn output_shape(data: &Option<PayloadValue>) -> Option<&serde_yaml::Mapping> {
    match data {
        Some(PayloadValue::Structured(serde_yaml::Value::Mapping(map))) => Some(map),
        _ => None,
    }
}

#[async_trait]
impl Component for BrokerOutputComponent {
    fn info(&self) -> ComponentInfo {
        ComponentInfo {
            name: self.name.clone(),
            component_type: "broker_output".to_string(),
        }
    }

    async fn invoke(&mut self, message: &Message, data: Option<PayloadValue>) -> Result<Outcome, component::Error> {
        let shape = output_shape(&data);

        let payload = shape
            .and_then(|map| map.get(&serde_yaml::Value::String("payload".to_string())))
            .cloned()
            .map(yaml_to_payload)
            .or_else(|| if shape.is_none() { data.clone() } else { None })
            .unwrap_or_else(|| message.payload().clone());

        let topic = shape
            .and_then(|map| map.get(&serde_yaml::Value::String("topic".to_string())))
            .and_then(serde_yaml::Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| message.topic().unwrap_or_default().to_string());

        let mut user_properties = HashMap::new();
        if self.copy_user_properties {
            for (key, value) in message.user_properties() {
                let _ = user_properties.insert(key.clone(), value.as_text());
            }
        }
        if let Some(serde_yaml::Value::Mapping(overrides)) =
            shape.and_then(|map| map.get(&serde_yaml::Value::String("user_properties".to_string())))
        {
            for (key, value) in overrides {
                if let serde_yaml::Value::String(key) = key {
                    let _ = user_properties.insert(key.clone(), yaml_to_payload(value.clone()).as_text());
                }
            }
        }

        let bytes = codec::encode(&payload, self.encoding, self.format);

        match self.broker.publish(&topic, bytes, user_properties).await {
            Ok(()) => {
                if self.propagate_acknowledgements || is_direct_injection(message) {
                    message.ack();
                }
                Ok(Outcome::NoOutput)
            }
            Err(err) => Err(component::Error::InvokeError {
                component: self.name.clone(),
                reason: err.to_string(),
            }),
        }
    }
}

/// Constructs [`BrokerOutputComponent`]s bound to a fixed broker and broker
/// section, so it can be driven through the same [`component::Registry`]
/// dispatch as any user-configured component.
pub struct BrokerOutputFactory {
    broker: Arc<dyn broker::Broker>,
    broker_config: config::BrokerConfig,
}

impl BrokerOutputFactory {
    /// Builds a factory that hands out outputs bound to `broker`.
    pub fn new(broker: Arc<dyn broker::Broker>, broker_config: config::BrokerConfig) -> Self {
        Self { broker, broker_config }
    }
}

impl ComponentFactory for BrokerOutputFactory {
    fn create(
        &self,
        name: &str,
        _component_type: &str,
        _config: ConfigAccessor,
        _services: RuntimeServices,
        _side_channel: flume::Sender<SideSignal>,
    ) -> Result<Box<dyn Component>, component::Error> {
        Ok(Box::new(BrokerOutputComponent::new(name, self.broker.clone(), &self.broker_config)))
    }
}
