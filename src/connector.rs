//! Top-level orchestration (`spec.md` §4.14): loads one or more
//! configuration documents, builds the shared [`RuntimeServices`], starts
//! every configured app plus a synthesized error flow, and provides
//! start/stop for the binary entry point.
//!
//! Lives above both `engine` and `app` rather than inside either, since a
//! connector that constructs `app::App`s would make `engine` depend on
//! `app`, which already depends on `engine::flow` — see `SPEC_FULL.md` §2.b.

use std::{collections::HashMap, path::Path, sync::Arc};

use app::App;
use component::{Component, ComponentFactory, ComponentInfo, Outcome, Registry};
use config::{AppConfig, ComponentConfig};
use engine::flow::Flow;
use message::{Message, PayloadValue};
use services::RuntimeServices;
use signal::SideSignal;
use task::{labels::ProcessLabels, TaskManager};

/// The name of the synthesized flow that receives error events (`spec.md`
/// §4.14, §6 "Error flow input", §7).
const ERROR_FLOW_NAME: &str = "__error_flow";
/// Reserved component type backing the error flow's default component.
const ERROR_COMPONENT_TYPE: &str = "__log_error";
/// Queue depth of the error flow's entry, generous since error traffic is
/// bursty and best-effort (dropped rather than backpressuring a component
/// that is already failing).
const ERROR_QUEUE_DEPTH: usize = 64;

/// Errors raised while starting or running the connector.
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// Loading or validating the configuration documents failed.
    #[error("configuration error: {0}")]
    Config(#[from] config::Error),

    /// The error flow failed to start (should not happen: it is built from
    /// a fixed, reserved component).
    #[error("error flow failed to start: {0}")]
    ErrorFlow(#[from] engine::Error),

    /// One of the configured apps failed to start.
    #[error("app '{app}' failed to start: {error}")]
    App {
        /// The app's configured name.
        app: String,
        /// Why it failed.
        error: String,
    },
}

/// Default error-flow component: logs the routed error context (`spec.md`
/// §6 "Error flow input": component name and failure reason, attached by
/// `processor::component_adapter::ComponentProcessor::forward_to_error_flow`
/// as `user_data.error_component`/`user_data.error_reason`) and discards.
/// An operator who needs different behavior (publish, escalate) replaces it
/// by declaring their own app named `ERROR_FLOW_NAME`... but since that name
/// is reserved internally, the intended path is instead a user-declared app
/// whose broker input subscribes to whatever topic a custom error component
/// chooses to publish errors on.
struct LogErrorComponent;

#[async_trait::async_trait]
impl Component for LogErrorComponent {
    fn info(&self) -> ComponentInfo {
        ComponentInfo {
            name: "log_error".to_string(),
            component_type: ERROR_COMPONENT_TYPE.to_string(),
        }
    }

    async fn invoke(&mut self, message: &Message, _data: Option<PayloadValue>) -> Result<Outcome, component::Error> {
        let component = message.user_data("error_component").map(PayloadValue::as_text).unwrap_or_default();
        let reason = message.user_data("error_reason").map(PayloadValue::as_text).unwrap_or_default();
        tracing::error!(
            component = %component,
            reason = %reason,
            topic = ?message.topic(),
            "component error routed to error flow"
        );
        Ok(Outcome::Discard)
    }
}

struct LogErrorFactory;

impl ComponentFactory for LogErrorFactory {
    fn create(
        &self,
        _name: &str,
        _component_type: &str,
        _config: component::ConfigAccessor,
        _services: RuntimeServices,
        _side_channel: flume::Sender<SideSignal>,
    ) -> Result<Box<dyn Component>, component::Error> {
        Ok(Box::new(LogErrorComponent))
    }
}

fn error_flow_component_config() -> ComponentConfig {
    ComponentConfig {
        name: "log_error".to_string(),
        component_type: ERROR_COMPONENT_TYPE.to_string(),
        num_instances: 1,
        queue_depth: ERROR_QUEUE_DEPTH,
        disabled: false,
        component_config: HashMap::new(),
        input_transforms: Vec::new(),
        input_selection: "previous".to_string(),
        subscriptions: Vec::new(),
    }
}

/// A running connector: every configured app, the error flow, the shared
/// runtime services, and the task manager every worker is registered with.
pub struct Connector {
    apps: Vec<App>,
    error_flow: Flow,
    task_manager: TaskManager,
    services: RuntimeServices,
}

impl Connector {
    /// Loads and merges `paths`, builds the shared services and error flow,
    /// then starts every configured app in declaration order. `registry`
    /// supplies the component factories available to `component_module`/
    /// `component_class` references; callers register their own components
    /// (and any `invoke`-resolvable integrations) on it before calling this.
    ///
    /// Fails fast on the first `ConfigError` or app-construction failure,
    /// per `spec.md` §7 ("Fatal during startup: any ConfigError aborts the
    /// process before any component starts").
    pub async fn start(paths: &[impl AsRef<Path>], registry: Registry) -> Result<Self, Error> {
        let app_configs = config::load_apps(paths)?;

        let services = RuntimeServices::new();
        let process_labels = ProcessLabels::new("connector");
        let mut task_manager = TaskManager::with_process_labels(process_labels.clone());

        let mut error_registry = registry.clone();
        error_registry
            .register(ERROR_COMPONENT_TYPE, Arc::new(LogErrorFactory))
            .expect("ERROR_COMPONENT_TYPE is reserved and registered exactly once");

        let error_component = error_flow_component_config();
        let error_flow = Flow::start(
            ERROR_FLOW_NAME,
            std::slice::from_ref(&error_component),
            &HashMap::new(),
            &error_registry,
            &services,
            &process_labels,
            &mut task_manager,
            None,
        )?;
        let error_sender = error_flow.entry_sender();

        let mut apps = Vec::with_capacity(app_configs.len());
        for app_config in &app_configs {
            let app = Self::start_app(app_config, &registry, &services, &process_labels, &mut task_manager, error_sender.clone()).await?;
            apps.push(app);
        }

        tracing::info!(app_count = apps.len(), "connector started");

        Ok(Self {
            apps,
            error_flow,
            task_manager,
            services,
        })
    }

    async fn start_app(
        app_config: &AppConfig,
        registry: &Registry,
        services: &RuntimeServices,
        process_labels: &ProcessLabels,
        task_manager: &mut TaskManager,
        error_sender: Option<flume::Sender<Vec<Message>>>,
    ) -> Result<App, Error> {
        App::start(app_config, registry, services, process_labels, task_manager, error_sender)
            .await
            .map_err(|err| Error::App {
                app: app_config.name.clone(),
                error: err.to_string(),
            })
    }

    /// The app named `name`, if the connector started one with that name.
    pub fn app(&self, name: &str) -> Option<&App> {
        self.apps.iter().find(|app| app.name() == name)
    }

    /// The shared cache/timer services every component was constructed
    /// with.
    pub fn services(&self) -> &RuntimeServices {
        &self.services
    }

    /// Stops every app, then the error flow, then joins every worker task
    /// registered with the connector's `TaskManager`, giving in-flight
    /// messages a bounded chance to drain before returning.
    pub async fn stop(self) {
        for app in self.apps {
            app.stop();
        }
        self.error_flow.stop();
        self.task_manager.join().await;
        tracing::info!("connector stopped");
    }
}

#[cfg(test)]
mod test {
    use component::ConfigAccessor;

    use super::*;

    struct EchoFactory;
    struct Echo;

    #[async_trait::async_trait]
    impl Component for Echo {
        fn info(&self) -> ComponentInfo {
            ComponentInfo {
                name: "echo".into(),
                component_type: "echo".into(),
            }
        }

        async fn invoke(&mut self, message: &Message, _data: Option<PayloadValue>) -> Result<Outcome, component::Error> {
            Ok(Outcome::Emit(message.payload().clone()))
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
        ) -> Result<Box<dyn Component>, component::Error> {
            Ok(Box::new(Echo))
        }
    }

    /// Writes `contents` to a unique path under the system temp directory
    /// and returns it; the test run's files accumulate there like any other
    /// scratch temp file, nothing here depends on a dedicated crate.
    fn write_temp_config(name: &str, contents: &str) -> std::path::PathBuf {
        let path = std::env::temp_dir().join(format!("relay-connector-test-{name}-{:?}.yaml", std::thread::current().id()));
        std::fs::write(&path, contents).unwrap();
        path
    }

    #[tokio::test]
    async fn starts_and_stops_a_standard_app() {
        let path = write_temp_config(
            "standard-app",
            r#"
apps:
  - name: demo
    flows:
      - name: main
        components:
          - name: echo
            component_module: echo
            input_selection: "input.payload"
"#,
        );

        let mut registry = Registry::new();
        registry.register("echo", Arc::new(EchoFactory)).unwrap();

        let connector = Connector::start(&[&path], registry).await.unwrap();
        assert!(connector.app("demo").is_some());
        connector.stop().await;

        std::fs::remove_file(&path).ok();
    }
}
