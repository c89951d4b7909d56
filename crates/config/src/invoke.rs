//! Resolves `invoke` blocks (§4.2: `{module|object, function|attribute,
//! params}`) into `component::ConfigValue`, the two-variant shape
//! (`Literal`/`DeferredExpression`) a component actually reads its
//! configuration through. By the time a value reaches a component, every
//! `invoke` block has collapsed to one of these two cases.

use std::{collections::HashMap, sync::Arc};

use component::ConfigValue;
use expr::CoerceType;
use message::PayloadValue;
use serde_yaml::Value;

use crate::Error;

/// A function an `invoke` block can call eagerly at load time. Registered
/// under `"<module>.<function>"`. The seam where real AI/vector/database
/// integrations (out of scope per spec.md §1) would register themselves;
/// only a couple of built-ins ship here.
pub type InvokeFn = Arc<dyn Fn(&[Value], &HashMap<String, Value>) -> Result<PayloadValue, Error> + Send + Sync>;

/// Named dispatch table for eagerly-resolved `invoke` targets.
#[derive(Clone)]
pub struct InvokeRegistry {
    functions: HashMap<String, InvokeFn>,
}

impl Default for InvokeRegistry {
    fn default() -> Self {
        let mut registry = Self {
            functions: HashMap::new(),
        };
        registry.register("env.get", |positional, keyword| {
            let name = positional
                .first()
                .and_then(Value::as_str)
                .or_else(|| keyword.get("name").and_then(Value::as_str))
                .ok_or_else(|| Error::InvalidInvoke {
                    reason: "env.get requires a 'name' argument".to_string(),
                })?;
            Ok(std::env::var(name).map(PayloadValue::Text).unwrap_or(PayloadValue::Null))
        });
        registry.register("static.value", |positional, keyword| {
            let value = positional.first().or_else(|| keyword.get("value")).cloned().unwrap_or(Value::Null);
            Ok(crate::yaml_to_payload(value))
        });
        registry
    }
}

impl InvokeRegistry {
    /// Registers a function under `name` (conventionally `"module.function"`).
    pub fn register(
        &mut self,
        name: impl Into<String>,
        function: impl Fn(&[Value], &HashMap<String, Value>) -> Result<PayloadValue, Error> + Send + Sync + 'static,
    ) {
        let _ = self.functions.insert(name.into(), Arc::new(function));
    }
}

fn is_invoke_block(mapping: &serde_yaml::Mapping) -> bool {
    let has_target = mapping.contains_key(Value::String("module".into())) || mapping.contains_key(Value::String("object".into()));
    let has_action = mapping.contains_key(Value::String("function".into())) || mapping.contains_key(Value::String("attribute".into()));
    has_target && has_action
}

fn coerce_type_from_str(name: &str) -> Option<CoerceType> {
    match name {
        "int" => Some(CoerceType::Int),
        "float" => Some(CoerceType::Float),
        "bool" => Some(CoerceType::Bool),
        "string" => Some(CoerceType::String),
        _ => None,
    }
}

fn params_of(mapping: &serde_yaml::Mapping) -> (Vec<Value>, HashMap<String, Value>) {
    let params = mapping.get(Value::String("params".into()));
    let positional = params
        .and_then(|p| p.get("positional"))
        .and_then(Value::as_sequence)
        .cloned()
        .unwrap_or_default();
    let keyword = params
        .and_then(|p| p.get("keyword"))
        .and_then(Value::as_mapping)
        .map(|m| {
            m.iter()
                .filter_map(|(k, v)| k.as_str().map(|k| (k.to_string(), v.clone())))
                .collect()
        })
        .unwrap_or_default();
    (positional, keyword)
}

/// Resolves one raw YAML value into a `ConfigValue`, handling `invoke`
/// blocks (including the special `evaluate_expression` target, which
/// collapses to `DeferredExpression` instead of being called eagerly) and
/// passing through every other value as a `Literal`.
pub fn resolve_value(value: &Value, registry: &InvokeRegistry) -> Result<ConfigValue, Error> {
    if let Value::Mapping(mapping) = value {
        if is_invoke_block(mapping) {
            return resolve_invoke(mapping, registry);
        }
    }
    Ok(ConfigValue::Literal(crate::yaml_to_payload(value.clone())))
}

fn resolve_invoke(mapping: &serde_yaml::Mapping, registry: &InvokeRegistry) -> Result<ConfigValue, Error> {
    let (positional, keyword) = params_of(mapping);

    if let Some(object) = mapping.get(Value::String("object".into())) {
        if let Value::Mapping(nested) = object {
            if is_invoke_block(nested) {
                return resolve_invoke(nested, registry);
            }
        }
    }

    let module = mapping.get(Value::String("module".into())).and_then(Value::as_str).unwrap_or("");
    let function = mapping.get(Value::String("function".into())).and_then(Value::as_str);
    let attribute = mapping.get(Value::String("attribute".into())).and_then(Value::as_str);

    if module == "expr" && function == Some("evaluate_expression") {
        let expression = positional
            .first()
            .and_then(Value::as_str)
            .or_else(|| keyword.get("expression").and_then(Value::as_str))
            .ok_or_else(|| Error::InvalidInvoke {
                reason: "evaluate_expression requires an expression argument".to_string(),
            })?
            .to_string();
        let coerce = positional
            .get(1)
            .and_then(Value::as_str)
            .or_else(|| keyword.get("type").and_then(Value::as_str))
            .and_then(coerce_type_from_str);
        return Ok(ConfigValue::DeferredExpression { expression, coerce });
    }

    let key = match (function, attribute) {
        (Some(function), _) => format!("{module}.{function}"),
        (None, Some(attribute)) => format!("{module}.{attribute}"),
        (None, None) => {
            return Err(Error::InvalidInvoke {
                reason: format!("invoke block for module '{module}' has neither function nor attribute"),
            })
        }
    };

    match registry.functions.get(&key) {
        Some(callee) => Ok(ConfigValue::Literal(callee(&positional, &keyword)?)),
        None => {
            tracing::warn!(target = %key, "unknown invoke target, resolving to null");
            Ok(ConfigValue::Literal(PayloadValue::Null))
        }
    }
}

/// Resolves every entry of a flat `component_config`/app `config` mapping.
pub fn resolve_config_map(value: Option<&Value>, registry: &InvokeRegistry) -> Result<HashMap<String, ConfigValue>, Error> {
    let mut resolved = HashMap::new();
    let Some(Value::Mapping(mapping)) = value else {
        return Ok(resolved);
    };
    for (key, value) in mapping {
        let Some(key) = key.as_str() else { continue };
        let _ = resolved.insert(key.to_string(), resolve_value(value, registry)?);
    }
    Ok(resolved)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn plain_scalar_resolves_to_literal() {
        let registry = InvokeRegistry::default();
        let value: Value = serde_yaml::from_str("\"Echo: \"").unwrap();
        match resolve_value(&value, &registry).unwrap() {
            ConfigValue::Literal(PayloadValue::Text(text)) => assert_eq!(text, "Echo: "),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn evaluate_expression_invoke_defers() {
        let registry = InvokeRegistry::default();
        let value: Value = serde_yaml::from_str(
            "module: expr\nfunction: evaluate_expression\nparams:\n  positional: [\"previous:text\", \"string\"]",
        )
        .unwrap();
        match resolve_value(&value, &registry).unwrap() {
            ConfigValue::DeferredExpression { expression, coerce } => {
                assert_eq!(expression, "previous:text");
                assert_eq!(coerce, Some(CoerceType::String));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn unknown_invoke_target_resolves_to_null() {
        let registry = InvokeRegistry::default();
        let value: Value = serde_yaml::from_str("module: vector_store\nfunction: connect").unwrap();
        match resolve_value(&value, &registry).unwrap() {
            ConfigValue::Literal(PayloadValue::Null) => {}
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn env_get_resolves_eagerly() {
        std::env::set_var("CONFIG_INVOKE_TEST_VAR", "secret");
        let registry = InvokeRegistry::default();
        let value: Value = serde_yaml::from_str(
            "module: env\nfunction: get\nparams:\n  positional: [\"CONFIG_INVOKE_TEST_VAR\"]",
        )
        .unwrap();
        match resolve_value(&value, &registry).unwrap() {
            ConfigValue::Literal(PayloadValue::Text(text)) => assert_eq!(text, "secret"),
            other => panic!("unexpected: {other:?}"),
        }
        std::env::remove_var("CONFIG_INVOKE_TEST_VAR");
    }
}
