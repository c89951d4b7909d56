//! A component that forwards its selected data unchanged, for flows built
//! entirely out of `input_transforms`/`input_selection` with no bespoke
//! invocation logic of their own.

use async_trait::async_trait;
use message::{Message, PayloadValue};

use crate::{Component, ComponentFactory, ComponentInfo, ConfigAccessor, Error, Outcome};

/// Emits `data` (or, absent a selection, the message's own payload)
/// unchanged.
pub struct Noop {
    name: String,
}

impl Noop {
    /// Creates a new noop component named `name`.
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

#[async_trait]
impl Component for Noop {
    fn info(&self) -> ComponentInfo {
        ComponentInfo {
            name: self.name.clone(),
            component_type: "noop".to_string(),
        }
    }

    async fn invoke(&mut self, message: &Message, data: Option<PayloadValue>) -> Result<Outcome, Error> {
        tracing::trace!(component = %self.name, "noop forwarding message");
        Ok(Outcome::Emit(data.unwrap_or_else(|| message.payload().clone())))
    }
}

/// Constructs [`Noop`] instances, registered under the `"noop"` component
/// type by default.
pub struct NoopFactory;

impl ComponentFactory for NoopFactory {
    fn create(
        &self,
        name: &str,
        _component_type: &str,
        _config: ConfigAccessor,
        _services: services::RuntimeServices,
        _side_channel: flume::Sender<signal::SideSignal>,
    ) -> Result<Box<dyn Component>, Error> {
        Ok(Box::new(Noop::new(name)))
    }
}
