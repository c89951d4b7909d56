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

//! A component is the unit of work inside a flow: it receives a message
//! (plus an optional piece of data selected from it by an expression),
//! decides whether to emit, discard, or silently consume it, and reacts to
//! timer ticks and cache expirations it has registered interest in. This
//! crate defines the `Component` trait and the configuration-precedence
//! rules components read their settings through; the runtime dispatch
//! (channels, workers, effect emission) lives in `processor` and `engine`.

/// A component that forwards its selected data unchanged.
pub mod noop;

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use expr::{CoerceType, Scope};
use message::{Message, PayloadValue};
use signal::SideSignal;

/// Errors a component can raise.
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// No factory is registered for the requested component type.
    #[error("unknown component (component: {component}, type: {r#type})")]
    UnknownComponent {
        /// The configured component name.
        component: String,
        /// The configured component type.
        r#type: String,
    },

    /// A factory was already registered for this component type.
    #[error("duplicate component type registration (type: {r#type})")]
    DuplicateType {
        /// The component type.
        r#type: String,
    },

    /// The component's configuration could not be applied.
    #[error("invalid configuration (component: {component}, reason: {reason})")]
    InvalidConfig {
        /// The configured component name.
        component: String,
        /// Why the configuration was rejected.
        reason: String,
    },

    /// A transform attached to the component's input failed.
    #[error("transform failed (component: {component}, reason: {reason})")]
    TransformError {
        /// The configured component name.
        component: String,
        /// Why the transform failed.
        reason: String,
    },

    /// The component's own invocation logic failed.
    #[error("invoke failed (component: {component}, reason: {reason})")]
    InvokeError {
        /// The configured component name.
        component: String,
        /// Why the invocation failed.
        reason: String,
    },
}

/// A configuration leaf value: either a value fixed at load time, or one
/// deferred until a message is in flight.
///
/// `invoke` blocks (module/object + function/attribute + params) are
/// resolved entirely while the configuration is loaded, so by the time a
/// value reaches a component it has already collapsed to one of these two
/// cases — a component never sees an unresolved `invoke` block.
#[derive(Debug, Clone)]
pub enum ConfigValue {
    /// A value already known at configuration-load time.
    Literal(PayloadValue),
    /// An expression (optionally coerced) evaluated against the in-flight
    /// message each time the value is read.
    DeferredExpression {
        /// The expression text, e.g. `"input.payload:user.id"`.
        expression: String,
        /// Optional coercion applied to the evaluated result.
        coerce: Option<CoerceType>,
    },
}

impl ConfigValue {
    /// Resolves the value against `message`/`scope`. Always succeeds for
    /// `Literal`; for `DeferredExpression`, returns `None` if the expression
    /// doesn't resolve (e.g. the referenced path is absent).
    pub fn resolve(&self, message: &Message, scope: &Scope) -> Option<PayloadValue> {
        match self {
            ConfigValue::Literal(value) => Some(value.clone()),
            ConfigValue::DeferredExpression { expression, coerce } => {
                expr::evaluate_expression(message, scope, expression, *coerce)
            }
        }
    }

    /// Resolves the value without a message in scope, for use at
    /// construction time. Returns `None` for `DeferredExpression`.
    pub fn resolve_static(&self) -> Option<PayloadValue> {
        match self {
            ConfigValue::Literal(value) => Some(value.clone()),
            ConfigValue::DeferredExpression { .. } => None,
        }
    }
}

/// Read-only view over a component's settings, honoring the precedence
/// `component_config` (the component's own YAML block) over `app_config`
/// (the owning app's shared configuration) over a caller-supplied static
/// default.
#[derive(Debug, Clone, Default)]
pub struct ConfigAccessor {
    component_config: HashMap<String, ConfigValue>,
    app_config: HashMap<String, ConfigValue>,
}

impl ConfigAccessor {
    /// Builds an accessor from a component's own config block and the
    /// owning app's shared config block.
    pub fn new(component_config: HashMap<String, ConfigValue>, app_config: HashMap<String, ConfigValue>) -> Self {
        Self {
            component_config,
            app_config,
        }
    }

    fn lookup(&self, key: &str) -> Option<&ConfigValue> {
        self.component_config.get(key).or_else(|| self.app_config.get(key))
    }

    /// Resolves `key` against `message`/`scope`, falling back to `default`
    /// if the key is absent or its deferred expression doesn't resolve.
    pub fn get_or(&self, key: &str, message: &Message, scope: &Scope, default: PayloadValue) -> PayloadValue {
        self.lookup(key).and_then(|value| value.resolve(message, scope)).unwrap_or(default)
    }

    /// Resolves `key` against `message`/`scope`; `None` if absent or
    /// unresolved.
    pub fn get(&self, key: &str, message: &Message, scope: &Scope) -> Option<PayloadValue> {
        self.lookup(key).and_then(|value| value.resolve(message, scope))
    }

    /// Resolves `key` without a message in scope, for use in `construct`.
    /// Falls back to `default` if `key` is absent or is a deferred
    /// expression (which cannot be resolved before any message exists).
    pub fn get_static_or(&self, key: &str, default: PayloadValue) -> PayloadValue {
        self.lookup(key).and_then(ConfigValue::resolve_static).unwrap_or(default)
    }
}

/// Identity of a constructed component, surfaced in logs and error flow
/// envelopes.
#[derive(Debug, Clone)]
pub struct ComponentInfo {
    /// The name this component instance was configured under.
    pub name: String,
    /// The registered type used to construct it.
    pub component_type: String,
}

/// The result of invoking a component on one message.
#[derive(Debug)]
pub enum Outcome {
    /// Emit a single derived payload downstream.
    Emit(PayloadValue),
    /// Emit several derived payloads downstream, each acking independently
    /// once the rest of the flow has processed it.
    EmitMany(Vec<PayloadValue>),
    /// Consume the message without producing output; acks as successful.
    Discard,
    /// The component produced nothing for this invocation and does not want
    /// the message acknowledged yet (e.g. it buffered the message for a
    /// later timer-triggered emission).
    NoOutput,
}

/// Unit of work inside a flow.
#[async_trait]
pub trait Component: Send {
    /// Identity of this component instance.
    fn info(&self) -> ComponentInfo;

    /// Processes one message, `data` being the value selected by the
    /// component's `input_selection` expression (defaulting to
    /// `previous`).
    async fn invoke(&mut self, message: &Message, data: Option<PayloadValue>) -> Result<Outcome, Error>;

    /// Reacts to a timer this component previously registered. Default:
    /// does nothing.
    async fn handle_timer_event(
        &mut self,
        _timer_id: &str,
        _payload: Option<serde_yaml::Value>,
    ) -> Result<Vec<Outcome>, Error> {
        Ok(Vec::new())
    }

    /// Reacts to a cache entry this component owns expiring. Default: does
    /// nothing.
    async fn handle_cache_expiry_event(
        &mut self,
        _cache_name: &str,
        _key: &str,
        _metadata: Option<serde_yaml::Value>,
        _expired_data: Option<serde_yaml::Value>,
    ) -> Result<Vec<Outcome>, Error> {
        Ok(Vec::new())
    }

    /// Called once when the component instance is stopping, after all
    /// in-flight messages have been acknowledged. Default: does nothing.
    async fn stop(&mut self) -> Result<(), Error> {
        Ok(())
    }
}

/// Constructs component instances of one registered type.
pub trait ComponentFactory: Send + Sync {
    /// Builds a new component instance.
    ///
    /// `side_channel` is this instance's private sender for timer ticks and
    /// cache expirations it registers with `services` (e.g.
    /// `services.timers().add_timer(name, side_channel.clone(), ...)`); the
    /// runtime drains it via a `SignalReceiver::with_side_channel` built from
    /// the matching receiver half.
    fn create(
        &self,
        name: &str,
        component_type: &str,
        config: ConfigAccessor,
        services: services::RuntimeServices,
        side_channel: flume::Sender<SideSignal>,
    ) -> Result<Box<dyn Component>, Error>;
}

/// Maps component type names (as written in configuration) to the factory
/// that constructs them.
#[derive(Default, Clone)]
pub struct Registry {
    factories: HashMap<String, Arc<dyn ComponentFactory>>,
}

impl Registry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a registry with every component type this crate ships
    /// pre-registered (currently just `"noop"`). Callers add their own
    /// `component_module`/`component_class` factories on top.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry
            .register("noop", Arc::new(noop::NoopFactory))
            .expect("builtin registration cannot collide in a fresh registry");
        registry
    }

    /// Registers a factory under `component_type`.
    pub fn register(&mut self, component_type: impl Into<String>, factory: Arc<dyn ComponentFactory>) -> Result<(), Error> {
        let component_type = component_type.into();
        if self.factories.contains_key(&component_type) {
            return Err(Error::DuplicateType { r#type: component_type });
        }
        let _ = self.factories.insert(component_type, factory);
        Ok(())
    }

    /// Constructs a component instance named `name` of type
    /// `component_type`.
    pub fn create(
        &self,
        name: &str,
        component_type: &str,
        config: ConfigAccessor,
        services: services::RuntimeServices,
        side_channel: flume::Sender<SideSignal>,
    ) -> Result<Box<dyn Component>, Error> {
        match self.factories.get(component_type) {
            Some(factory) => factory.create(name, component_type, config, services, side_channel),
            None => Err(Error::UnknownComponent {
                component: name.to_string(),
                r#type: component_type.to_string(),
            }),
        }
    }
}
