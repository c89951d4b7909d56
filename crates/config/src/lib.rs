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

//! Loads and resolves the configuration documents that describe a
//! connector's apps, flows and components: deep-merges one or more YAML
//! documents (later documents override earlier ones), substitutes
//! `${NAME}`/`${NAME, default}` environment references, and resolves
//! `invoke` blocks down to the `component::ConfigValue` shape components
//! read their settings through.

mod invoke;
mod merge;

use std::{collections::HashMap, path::Path};

use component::ConfigValue;
use expr::transform::{Transform, TransformFn};
use message::PayloadValue;
use serde_yaml::Value;
use validator::Validate;

pub use invoke::InvokeRegistry;
pub use merge::{deep_merge, substitute_env_vars};

/// Errors raised while loading or validating configuration.
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// A configuration file could not be read.
    #[error("could not read configuration file '{file}': {reason}")]
    Io {
        /// The path that failed to read.
        file: String,
        /// The underlying I/O error.
        reason: String,
    },

    /// A configuration document could not be parsed as YAML.
    #[error("invalid YAML in '{file}': {reason}")]
    InvalidYaml {
        /// The path that failed to parse.
        file: String,
        /// The underlying parse error.
        reason: String,
    },

    /// A structural validation rule was violated.
    #[error("invalid configuration (reason: {reason})")]
    InvalidConfig {
        /// What failed.
        reason: String,
    },

    /// An `invoke` block could not be resolved.
    #[error("invalid invoke block (reason: {reason})")]
    InvalidInvoke {
        /// What failed.
        reason: String,
    },

    /// A subscription pattern failed to compile.
    #[error("invalid subscription: {0}")]
    Subscription(#[from] broker::Error),
}

/// How a broker input/output decodes/encodes a message payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadEncoding {
    /// UTF-8 text, the default.
    Utf8,
    /// Base64-encoded bytes.
    Base64,
    /// Raw, unencoded bytes.
    None,
}

/// The structural shape of a decoded/encoded payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadFormat {
    /// Plain text.
    Text,
    /// JSON.
    Json,
    /// YAML.
    Yaml,
}

/// Top-level `log:` section (`spec.md` §6): `{ stdout_log_level,
/// log_file_level, log_file, log_format?, logback? }`. Absent sections
/// resolve to [`LogConfig::default`].
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Minimum level emitted to stdout.
    pub stdout_log_level: String,
    /// Minimum level emitted to `log_file`, when set.
    pub log_file_level: Option<String>,
    /// Path of a file to additionally log to.
    pub log_file: Option<String>,
    /// Rendering of each log line (`"text"`/`"json"`), when the default
    /// human-readable format isn't wanted.
    pub log_format: Option<String>,
    /// Path to a logback-style configuration document, honored by
    /// deployments that bring their own logging backend instead of this
    /// crate's `tracing-subscriber` wiring.
    pub logback: Option<String>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            stdout_log_level: "info".to_string(),
            log_file_level: None,
            log_file: None,
            log_format: None,
            logback: None,
        }
    }
}

/// Top-level `trace:` section (`spec.md` §6): `{ trace_file?, enable_trace?
/// }`. Absent resolves to [`TraceConfig::default`] (tracing disabled).
#[derive(Debug, Clone, Default)]
pub struct TraceConfig {
    /// Path a trace-level file layer writes to, when `enable_trace` is set.
    pub trace_file: Option<String>,
    /// Whether the trace-level file layer is installed at all.
    pub enable_trace: bool,
}

fn parse_log(value: &Value) -> LogConfig {
    let default = LogConfig::default();
    LogConfig {
        stdout_log_level: string_field(value, "stdout_log_level").unwrap_or(default.stdout_log_level),
        log_file_level: string_field(value, "log_file_level"),
        log_file: string_field(value, "log_file"),
        log_format: string_field(value, "log_format"),
        logback: string_field(value, "logback"),
    }
}

fn parse_trace(value: &Value) -> TraceConfig {
    TraceConfig {
        trace_file: string_field(value, "trace_file"),
        enable_trace: bool_field(value, "enable_trace", false),
    }
}

/// A resolved broker section, shared by simplified-mode broker input,
/// output, and request/reply.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Identifies which concrete `broker::Broker` implementation to build
    /// (only `"memory"` ships with this crate).
    pub broker_type: String,
    /// Connection URL, when applicable.
    pub broker_url: Option<String>,
    /// Connection username, when applicable.
    pub broker_username: Option<String>,
    /// Connection password, when applicable.
    pub broker_password: Option<String>,
    /// Connection VPN/namespace, when applicable.
    pub broker_vpn: Option<String>,
    /// Whether this app consumes from the broker.
    pub input_enabled: bool,
    /// Whether this app publishes to the broker.
    pub output_enabled: bool,
    /// Whether this app issues broker request/reply calls.
    pub request_reply_enabled: bool,
    /// The queue this app's broker input binds, required when
    /// `input_enabled`.
    pub queue_name: Option<String>,
    /// Whether to create `queue_name` if it doesn't already exist.
    pub create_queue_on_start: bool,
    /// How the broker input/output (de)codes bytes.
    pub payload_encoding: PayloadEncoding,
    /// The structural shape the decoded payload is parsed into.
    pub payload_format: PayloadFormat,
    /// Redeliveries tolerated before a message is routed to the error flow.
    pub max_redelivery_count: Option<u32>,
    /// Milliseconds before an outstanding request expires.
    pub request_expiry_ms: u64,
    /// Prefix of the per-request reply topic.
    pub response_topic_prefix: String,
    /// Optional suffix of the per-request reply topic.
    pub response_topic_suffix: Option<String>,
    /// Prefix of the per-app reply queue name.
    pub response_queue_prefix: String,
    /// User-property key carrying the reply topic.
    pub user_properties_reply_topic_key: String,
    /// User-property key carrying caller-supplied reply metadata.
    pub user_properties_reply_metadata_key: Option<String>,
    /// Whether broker output merges the in-flight message's user properties
    /// into the published delivery.
    pub copy_user_properties: bool,
    /// Whether broker output acks the upstream message itself once the
    /// broker confirms the publish.
    pub propagate_acknowledgements: bool,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            broker_type: "memory".to_string(),
            broker_url: None,
            broker_username: None,
            broker_password: None,
            broker_vpn: None,
            input_enabled: false,
            output_enabled: false,
            request_reply_enabled: false,
            queue_name: None,
            create_queue_on_start: true,
            payload_encoding: PayloadEncoding::Utf8,
            payload_format: PayloadFormat::Json,
            max_redelivery_count: None,
            request_expiry_ms: 60_000,
            response_topic_prefix: "reply".to_string(),
            response_topic_suffix: None,
            response_queue_prefix: "reply-queue".to_string(),
            user_properties_reply_topic_key: "reply-to".to_string(),
            user_properties_reply_metadata_key: None,
            copy_user_properties: true,
            propagate_acknowledgements: true,
        }
    }
}

/// A resolved component configuration.
#[derive(Debug, Clone, Validate)]
pub struct ComponentConfig {
    /// The configured instance name.
    pub name: String,
    /// The registered component type used to construct it.
    pub component_type: String,
    /// How many worker instances share this component's input queue.
    #[validate(range(min = 1))]
    pub num_instances: usize,
    /// The bound of this component's input queue.
    #[validate(range(min = 1))]
    pub queue_depth: usize,
    /// Whether this component is skipped entirely when the flow is built.
    pub disabled: bool,
    /// The component's own settings.
    pub component_config: HashMap<String, ConfigValue>,
    /// Transforms applied to the in-flight message before `input_selection`
    /// is evaluated.
    pub input_transforms: Vec<Transform>,
    /// The expression selecting the data passed to `invoke`.
    pub input_selection: String,
    /// Topic subscriptions, only meaningful for simplified-app components.
    pub subscriptions: Vec<String>,
}

/// A resolved, standard-mode flow: a named, ordered list of components.
#[derive(Debug, Clone)]
pub struct FlowConfig {
    /// The flow's name.
    pub name: String,
    /// The flow's components, in execution order.
    pub components: Vec<ComponentConfig>,
}

/// A resolved app: either standard (`flows`) or simplified (`broker` +
/// `components`).
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// The app's name.
    pub name: String,
    /// How many independent replicas of this app to run (each with its own
    /// broker connection in simplified mode).
    pub num_instances: usize,
    /// The simplified-mode broker section, if this is a simplified app.
    pub broker: Option<BrokerConfig>,
    /// The app-level shared configuration, consulted by
    /// `component::ConfigAccessor` below component-level settings.
    pub config: HashMap<String, ConfigValue>,
    /// Standard-mode flows.
    pub flows: Option<Vec<FlowConfig>>,
    /// Simplified-mode components.
    pub components: Option<Vec<ComponentConfig>>,
}

fn yaml_to_payload(value: Value) -> PayloadValue {
    match value {
        Value::Null => PayloadValue::Null,
        Value::String(s) => PayloadValue::Text(s),
        other => PayloadValue::Structured(other),
    }
}

fn string_field(mapping: &Value, key: &str) -> Option<String> {
    mapping.get(key).and_then(Value::as_str).map(str::to_string)
}

fn bool_field(mapping: &Value, key: &str, default: bool) -> bool {
    mapping.get(key).and_then(Value::as_bool).unwrap_or(default)
}

fn u64_field(mapping: &Value, key: &str, default: u64) -> u64 {
    mapping.get(key).and_then(Value::as_u64).unwrap_or(default)
}

fn parse_encoding(mapping: &Value) -> PayloadEncoding {
    match mapping.get("payload_encoding").and_then(Value::as_str) {
        Some("base64") => PayloadEncoding::Base64,
        Some("none") => PayloadEncoding::None,
        _ => PayloadEncoding::Utf8,
    }
}

fn parse_format(mapping: &Value) -> PayloadFormat {
    match mapping.get("payload_format").and_then(Value::as_str) {
        Some("text") => PayloadFormat::Text,
        Some("yaml") => PayloadFormat::Yaml,
        _ => PayloadFormat::Json,
    }
}

fn parse_broker(value: &Value) -> BrokerConfig {
    let default = BrokerConfig::default();
    BrokerConfig {
        broker_type: string_field(value, "broker_type").unwrap_or(default.broker_type),
        broker_url: string_field(value, "broker_url"),
        broker_username: string_field(value, "broker_username"),
        broker_password: string_field(value, "broker_password"),
        broker_vpn: string_field(value, "broker_vpn"),
        input_enabled: bool_field(value, "input_enabled", default.input_enabled),
        output_enabled: bool_field(value, "output_enabled", default.output_enabled),
        request_reply_enabled: bool_field(value, "request_reply_enabled", default.request_reply_enabled),
        queue_name: string_field(value, "queue_name"),
        create_queue_on_start: bool_field(value, "create_queue_on_start", default.create_queue_on_start),
        payload_encoding: parse_encoding(value),
        payload_format: parse_format(value),
        max_redelivery_count: value.get("max_redelivery_count").and_then(Value::as_u64).map(|n| n as u32),
        request_expiry_ms: u64_field(value, "request_expiry_ms", default.request_expiry_ms),
        response_topic_prefix: string_field(value, "response_topic_prefix").unwrap_or(default.response_topic_prefix),
        response_topic_suffix: string_field(value, "response_topic_suffix"),
        response_queue_prefix: string_field(value, "response_queue_prefix").unwrap_or(default.response_queue_prefix),
        user_properties_reply_topic_key: string_field(value, "user_properties_reply_topic_key")
            .unwrap_or(default.user_properties_reply_topic_key),
        user_properties_reply_metadata_key: string_field(value, "user_properties_reply_metadata_key"),
        copy_user_properties: bool_field(value, "copy_user_properties", default.copy_user_properties),
        propagate_acknowledgements: bool_field(value, "propagate_acknowledgements", default.propagate_acknowledgements),
    }
}

fn transform_fn(value: Option<&Value>, registry: &InvokeRegistry) -> Result<Option<TransformFn>, Error> {
    let Some(value) = value else { return Ok(None) };
    match invoke::resolve_value(value, registry)? {
        ConfigValue::DeferredExpression { expression, coerce } => {
            Ok(Some(std::sync::Arc::new(move |message: &message::Message, scope: &expr::Scope| {
                expr::evaluate_expression(message, scope, &expression, coerce)
            })))
        }
        ConfigValue::Literal(literal) => Ok(Some(std::sync::Arc::new(move |_: &message::Message, _: &expr::Scope| Some(literal.clone())))),
    }
}

fn parse_transform(value: &Value, registry: &InvokeRegistry) -> Result<Transform, Error> {
    let transform_type = string_field(value, "type").ok_or_else(|| Error::InvalidConfig {
        reason: "transform is missing 'type'".to_string(),
    })?;

    let source_expression = string_field(value, "source_expression");
    let source_value = value.get("source_value").cloned().map(yaml_to_payload);
    let dest_expression = string_field(value, "dest_expression").unwrap_or_default();
    let dest_list_expression = string_field(value, "dest_list_expression").unwrap_or_default();
    let source_list_expression = string_field(value, "source_list_expression").unwrap_or_default();

    match transform_type.as_str() {
        "copy" => Ok(Transform::Copy {
            source_expression,
            source_value,
            dest_expression,
        }),
        "append" => Ok(Transform::Append {
            source_expression,
            source_value,
            dest_expression,
        }),
        "map" => Ok(Transform::Map {
            source_list_expression,
            source_expression: string_field(value, "source_expression").unwrap_or_default(),
            processing_function: transform_fn(value.get("processing_function"), registry)?,
            dest_list_expression,
        }),
        "reduce" => Ok(Transform::Reduce {
            source_list_expression,
            accumulator_function: transform_fn(value.get("accumulator_function"), registry)?.ok_or_else(|| Error::InvalidConfig {
                reason: "reduce transform requires accumulator_function".to_string(),
            })?,
            initial_value: value.get("initial_value").cloned().map(yaml_to_payload).unwrap_or(PayloadValue::Null),
            dest_expression,
        }),
        "filter" => Ok(Transform::Filter {
            source_list_expression,
            filter_function: transform_fn(value.get("filter_function"), registry)?.ok_or_else(|| Error::InvalidConfig {
                reason: "filter transform requires filter_function".to_string(),
            })?,
            dest_list_expression,
        }),
        other => Err(Error::InvalidConfig {
            reason: format!("unknown transform type '{other}'"),
        }),
    }
}

fn parse_component(value: &Value, registry: &InvokeRegistry) -> Result<ComponentConfig, Error> {
    let name = string_field(value, "name").ok_or_else(|| Error::InvalidConfig {
        reason: "component is missing 'name'".to_string(),
    })?;
    let component_type = string_field(value, "component_module")
        .or_else(|| string_field(value, "component_class"))
        .ok_or_else(|| Error::InvalidConfig {
            reason: format!("component '{name}' is missing 'component_module'/'component_class'"),
        })?;

    let input_transforms = match value.get("input_transforms").and_then(Value::as_sequence) {
        Some(sequence) => sequence.iter().map(|t| parse_transform(t, registry)).collect::<Result<Vec<_>, _>>()?,
        None => Vec::new(),
    };

    let input_selection = match value.get("input_selection") {
        None => "previous".to_string(),
        Some(selection) => {
            if let Some(plain) = selection.as_str() {
                plain.to_string()
            } else if let Some(expression) = string_field(selection, "source_expression") {
                expression
            } else if let Some(source_value) = selection.get("source_value") {
                source_value.as_str().map(str::to_string).ok_or_else(|| Error::InvalidConfig {
                    reason: format!(
                        "component '{name}' has input_selection.source_value that isn't an expression string (got {source_value:?}); use source_expression, or a plain string, to select from the message"
                    ),
                })?
            } else {
                "previous".to_string()
            }
        }
    };

    let subscriptions = value
        .get("subscriptions")
        .and_then(Value::as_sequence)
        .map(|sequence| {
            sequence
                .iter()
                .filter_map(|s| string_field(s, "topic").or_else(|| s.as_str().map(str::to_string)))
                .collect()
        })
        .unwrap_or_default();

    Ok(ComponentConfig {
        name,
        component_type,
        num_instances: value.get("num_instances").and_then(Value::as_u64).unwrap_or(1) as usize,
        queue_depth: value.get("queue_depth").and_then(Value::as_u64).unwrap_or(5) as usize,
        disabled: bool_field(value, "disabled", false),
        component_config: invoke::resolve_config_map(value.get("component_config"), registry)?,
        input_transforms,
        input_selection,
        subscriptions,
    })
}

fn parse_flow(value: &Value, registry: &InvokeRegistry) -> Result<FlowConfig, Error> {
    let name = string_field(value, "name").ok_or_else(|| Error::InvalidConfig {
        reason: "flow is missing 'name'".to_string(),
    })?;
    let components = value
        .get("components")
        .and_then(Value::as_sequence)
        .ok_or_else(|| Error::InvalidConfig {
            reason: format!("flow '{name}' is missing 'components'"),
        })?
        .iter()
        .map(|c| parse_component(c, registry))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(FlowConfig { name, components })
}

fn parse_app(value: &Value, registry: &InvokeRegistry) -> Result<AppConfig, Error> {
    let name = string_field(value, "name").ok_or_else(|| Error::InvalidConfig {
        reason: "app is missing 'name'".to_string(),
    })?;

    let broker = value.get("broker").map(parse_broker);
    let config = invoke::resolve_config_map(value.get("config"), registry)?;

    let flows = match value.get("flows").and_then(Value::as_sequence) {
        Some(sequence) => Some(sequence.iter().map(|f| parse_flow(f, registry)).collect::<Result<Vec<_>, _>>()?),
        None => None,
    };

    let components = match value.get("components").and_then(Value::as_sequence) {
        Some(sequence) => Some(sequence.iter().map(|c| parse_component(c, registry)).collect::<Result<Vec<_>, _>>()?),
        None => None,
    };

    Ok(AppConfig {
        name,
        num_instances: value.get("num_instances").and_then(Value::as_u64).unwrap_or(1) as usize,
        broker,
        config,
        flows,
        components,
    })
}

fn validate_app(app: &AppConfig) -> Result<(), Error> {
    if app.num_instances == 0 {
        return Err(Error::InvalidConfig {
            reason: format!("app '{}' has num_instances=0", app.name),
        });
    }

    if app.flows.is_none() && app.components.is_none() {
        return Err(Error::InvalidConfig {
            reason: format!("app '{}' declares neither 'flows' nor 'components'", app.name),
        });
    }

    if let Some(broker) = &app.broker {
        if broker.input_enabled && broker.queue_name.is_none() {
            return Err(Error::InvalidConfig {
                reason: format!("app '{}' has broker.input_enabled without a queue_name", app.name),
            });
        }
        if broker.request_reply_enabled && broker.broker_type.is_empty() {
            return Err(Error::InvalidConfig {
                reason: format!("app '{}' has request_reply_enabled without a broker_type", app.name),
            });
        }
    }

    for flow in app.flows.iter().flatten() {
        validate_component_configs(&flow.components)?;
        if let Some(first) = flow.components.iter().find(|c| !c.disabled) {
            if first.input_selection == "previous" {
                return Err(Error::InvalidConfig {
                    reason: format!(
                        "flow '{}' component '{}' is first but selects 'previous' with no upstream",
                        flow.name, first.name
                    ),
                });
            }
        }
    }

    if let Some(components) = &app.components {
        validate_component_configs(components)?;
    }

    Ok(())
}

fn validate_component_configs(components: &[ComponentConfig]) -> Result<(), Error> {
    for component in components {
        component.validate().map_err(|err| Error::InvalidConfig {
            reason: format!("component '{}': {err}", component.name),
        })?;
    }
    Ok(())
}

fn load_merged(paths: &[impl AsRef<Path>]) -> Result<Value, Error> {
    let mut documents = Vec::with_capacity(paths.len());
    for path in paths {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|err| Error::Io {
            file: path.display().to_string(),
            reason: err.to_string(),
        })?;
        documents.push(text);
    }

    merge::merge_documents(&documents).map_err(|err| Error::InvalidYaml {
        file: paths.iter().map(|p| p.as_ref().display().to_string()).collect::<Vec<_>>().join(", "),
        reason: err.to_string(),
    })
}

/// Reads and merges `paths` exactly as [`load_apps`] does, returning the
/// top-level `log:`/`trace:` sections instead of the resolved apps. Called
/// independently of [`load_apps`] so a caller can set up logging before
/// apps (and any `invoke` blocks they resolve) are parsed.
pub fn load_runtime_settings(paths: &[impl AsRef<Path>]) -> Result<(LogConfig, TraceConfig), Error> {
    let merged = load_merged(paths)?;
    let log = merged.get("log").map(parse_log).unwrap_or_default();
    let trace = merged.get("trace").map(parse_trace).unwrap_or_default();
    Ok((log, trace))
}

/// Reads, merges, substitutes, and resolves one or more configuration
/// documents into a list of apps. A backward-compatible top-level `flows:`
/// document (no `apps:` section) is treated as a single implicit app named
/// `"default"`.
pub fn load_apps(paths: &[impl AsRef<Path>]) -> Result<Vec<AppConfig>, Error> {
    load_apps_with_registry(paths, &InvokeRegistry::default())
}

/// Like [`load_apps`], with a caller-supplied `InvokeRegistry` (e.g. one
/// with additional integrations registered).
pub fn load_apps_with_registry(paths: &[impl AsRef<Path>], registry: &InvokeRegistry) -> Result<Vec<AppConfig>, Error> {
    let merged = load_merged(paths)?;

    let apps = if let Some(apps) = merged.get("apps").and_then(Value::as_sequence) {
        apps.iter().map(|a| parse_app(a, registry)).collect::<Result<Vec<_>, _>>()?
    } else if merged.get("flows").is_some() {
        vec![parse_app(
            &serde_yaml::from_str(&format!(
                "name: default\nflows: {}",
                serde_yaml::to_string(merged.get("flows").expect("checked above")).expect("re-serializing parsed yaml")
            ))
            .map_err(|err| Error::InvalidYaml {
                file: "(merged flows)".to_string(),
                reason: err.to_string(),
            })?,
            registry,
        )?]
    } else {
        Vec::new()
    };

    for app in &apps {
        validate_app(app)?;
    }

    Ok(apps)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn env_substitution_reexported() {
        std::env::set_var("CONFIG_LIB_TEST_VAR", "1");
        assert_eq!(substitute_env_vars("${CONFIG_LIB_TEST_VAR}"), "1");
        std::env::remove_var("CONFIG_LIB_TEST_VAR");
    }

    fn write_temp(contents: &str) -> std::path::PathBuf {
        let mut path = std::env::temp_dir();
        path.push(format!("config-test-{}.yaml", std::process::id()));
        std::fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn loads_standard_app_with_one_flow() {
        let path = write_temp(
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
        let apps = load_apps(&[&path]).unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(apps.len(), 1);
        assert_eq!(apps[0].name, "demo");
        let flows = apps[0].flows.as_ref().unwrap();
        assert_eq!(flows[0].components[0].name, "echo");
        assert_eq!(flows[0].components[0].input_selection, "input.payload");
    }

    #[test]
    fn rejects_first_component_selecting_previous() {
        let path = write_temp(
            r#"
apps:
  - name: demo
    flows:
      - name: main
        components:
          - name: c1
            component_module: echo
"#,
        );
        let result = load_apps(&[&path]);
        std::fs::remove_file(&path).ok();
        assert!(matches!(result, Err(Error::InvalidConfig { .. })));
    }

    #[test]
    fn rejects_num_instances_zero() {
        let path = write_temp(
            r#"
apps:
  - name: demo
    num_instances: 0
    flows:
      - name: main
        components:
          - name: c1
            component_module: echo
            input_selection: "input.payload"
"#,
        );
        let result = load_apps(&[&path]);
        std::fs::remove_file(&path).ok();
        assert!(matches!(result, Err(Error::InvalidConfig { .. })));
    }

    #[test]
    fn log_and_trace_sections_parse() {
        let path = write_temp(
            r#"
log:
  stdout_log_level: debug
  log_file: /var/log/relay.log
trace:
  enable_trace: true
  trace_file: /var/log/relay.trace
flows:
  - name: main
    components:
      - name: c1
        component_module: echo
        input_selection: "input.payload"
"#,
        );
        let (log, trace) = load_runtime_settings(&[&path]).unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(log.stdout_log_level, "debug");
        assert_eq!(log.log_file.as_deref(), Some("/var/log/relay.log"));
        assert!(trace.enable_trace);
        assert_eq!(trace.trace_file.as_deref(), Some("/var/log/relay.trace"));
    }

    #[test]
    fn missing_log_and_trace_sections_default() {
        let path = write_temp(
            r#"
flows:
  - name: main
    components:
      - name: c1
        component_module: echo
        input_selection: "input.payload"
"#,
        );
        let (log, trace) = load_runtime_settings(&[&path]).unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(log.stdout_log_level, "info");
        assert!(!trace.enable_trace);
    }

    #[test]
    fn backward_compatible_top_level_flows() {
        let path = write_temp(
            r#"
flows:
  - name: main
    components:
      - name: c1
        component_module: echo
        input_selection: "input.payload"
"#,
        );
        let apps = load_apps(&[&path]).unwrap();
        std::fs::remove_file(&path).ok();
        assert_eq!(apps.len(), 1);
        assert_eq!(apps[0].name, "default");
    }
}
