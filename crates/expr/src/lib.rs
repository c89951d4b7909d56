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

//! The expression/template language used by component configuration to
//! address a [`Message`] without embedding code. An expression is
//! `<plane>[:<path>]`: a plane names a region of the message (or of the
//! transform-local scope), an optional dotted `path` navigates into it.
//!
//! Evaluation never fails on a missing lookup — it returns `None`, mirroring
//! the "missing planes are absent, not an error" testable property. Writing
//! is restricted to the planes the runtime allows a component to mutate
//! (`user_data.<name>` and, during a transform, `previous`); see [`set`].

pub mod transform;

use std::collections::HashMap;

use message::{Message, PayloadValue};

/// Error returned when an expression string can't be parsed, or is used in a
/// context it doesn't support (e.g. writing to a read-only plane).
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// The plane name in the expression isn't recognized.
    #[error("unknown expression plane: {0}")]
    UnknownPlane(String),
    /// The plane is valid for reading but can't be written to.
    #[error("plane is not writable: {0}")]
    NotWritable(String),
    /// `set_path` failed to create the requested structure (e.g. a numeric
    /// segment against a non-sequence).
    #[error("could not set path for expression: {0}")]
    SetPathFailed(String),
}

/// A parsed expression: the plane it addresses plus the dotted path within
/// that plane.
#[derive(Debug, Clone, PartialEq)]
#[non_exhaustive]
pub enum Expression {
    /// The `input` plane: first path segment selects `payload` / `topic` /
    /// `topic_levels` / `user_properties`, remaining segments navigate
    /// within it.
    Input {
        /// Dotted path within the plane.
        path: Vec<String>,
    },
    /// The fully-qualified `input.payload[:path]` plane.
    InputPayload {
        /// Dotted path within the payload.
        path: Vec<String>,
    },
    /// The `input.topic` plane. Always a leaf (a string or absent).
    InputTopic,
    /// The `input.topic_levels` plane: the topic split on `/`.
    InputTopicLevels {
        /// Dotted path (an integer segment indexes a level).
        path: Vec<String>,
    },
    /// The `input.user_properties` plane.
    InputUserProperties {
        /// Dotted path within the user properties map.
        path: Vec<String>,
    },
    /// The `previous` plane: the prior component's output.
    Previous {
        /// Dotted path within the previous value.
        path: Vec<String>,
    },
    /// The `user_data.<name>` plane: a named scratch region.
    UserData {
        /// Name of the scratch region.
        name: String,
        /// Dotted path within it.
        path: Vec<String>,
    },
    /// `static:<literal>` — a literal string, path ignored.
    Static {
        /// The literal content.
        literal: String,
    },
    /// `template:<text>` — a template string scanned for placeholders.
    Template {
        /// The template text.
        text: String,
    },
    /// The transform-local `item` plane (current element in `map`/`filter`).
    Item {
        /// Dotted path within the current item.
        path: Vec<String>,
    },
    /// The transform-local `index` plane (current index in `map`/`filter`).
    Index,
    /// The transform-local `keyword_args` plane.
    KeywordArgs {
        /// Dotted path; first segment selects the keyword argument.
        path: Vec<String>,
    },
    /// The transform-local `invoke_data` plane (the `data` argument passed
    /// to a component's `invoke`).
    InvokeData {
        /// Dotted path within it.
        path: Vec<String>,
    },
    /// The transform-local `self` plane (the component's own instance
    /// state, when applicable).
    SelfValue {
        /// Dotted path within it.
        path: Vec<String>,
    },
}

fn split_path(path: Option<&str>) -> Vec<String> {
    match path {
        None | Some("") => Vec::new(),
        Some(p) => p.split('.').map(str::to_string).collect(),
    }
}

/// Parses an expression string into its plane and path.
pub fn parse(expression: &str) -> Result<Expression, Error> {
    let (plane, rest) = match expression.split_once(':') {
        Some((plane, rest)) => (plane, Some(rest)),
        None => (expression, None),
    };

    match plane {
        "static" => Ok(Expression::Static {
            literal: rest.unwrap_or_default().to_string(),
        }),
        "template" => Ok(Expression::Template {
            text: rest.unwrap_or_default().to_string(),
        }),
        "input" => Ok(Expression::Input { path: split_path(rest) }),
        "input.payload" => Ok(Expression::InputPayload { path: split_path(rest) }),
        "input.topic" => Ok(Expression::InputTopic),
        "input.topic_levels" => Ok(Expression::InputTopicLevels { path: split_path(rest) }),
        "input.user_properties" => Ok(Expression::InputUserProperties { path: split_path(rest) }),
        "previous" => Ok(Expression::Previous { path: split_path(rest) }),
        "item" => Ok(Expression::Item { path: split_path(rest) }),
        "index" => Ok(Expression::Index),
        "keyword_args" => Ok(Expression::KeywordArgs { path: split_path(rest) }),
        "invoke_data" => Ok(Expression::InvokeData { path: split_path(rest) }),
        "self" => Ok(Expression::SelfValue { path: split_path(rest) }),
        other if other.starts_with("user_data.") => Ok(Expression::UserData {
            name: other["user_data.".len()..].to_string(),
            path: split_path(rest),
        }),
        other => Err(Error::UnknownPlane(other.to_string())),
    }
}

/// Bindings available to transform-local planes (`item`, `index`,
/// `keyword_args`, `invoke_data`, `self`). Empty by default; the transform
/// engine and the component runtime populate the fields that apply.
#[derive(Debug, Clone, Default)]
pub struct Scope {
    /// The current element, for `map`/`filter`/`reduce` iteration.
    pub item: Option<PayloadValue>,
    /// The current index, for `map`/`filter` iteration.
    pub index: Option<usize>,
    /// Named arguments passed to a transform's processing function.
    pub keyword_args: HashMap<String, PayloadValue>,
    /// The `data` value passed to a component's `invoke`.
    pub invoke_data: Option<PayloadValue>,
    /// The component's own instance state, when exposed.
    pub self_value: Option<PayloadValue>,
}

fn navigate(value: &PayloadValue, path: &[String]) -> Option<PayloadValue> {
    if path.is_empty() {
        return Some(value.clone());
    }
    let segments: Vec<&str> = path.iter().map(String::as_str).collect();
    value.get_path(&segments)
}

fn map_to_payload(map: &HashMap<String, PayloadValue>) -> PayloadValue {
    let mut mapping = serde_yaml::Mapping::new();
    for (key, value) in map {
        let _ = mapping.insert(serde_yaml::Value::String(key.clone()), value.to_yaml());
    }
    PayloadValue::Structured(serde_yaml::Value::Mapping(mapping))
}

/// Evaluates `expression` against `message` and `scope`. Returns `None` if
/// any segment of the path is absent, the plane doesn't apply in this
/// context (e.g. `item` outside a `map`/`filter`), or the expression string
/// doesn't parse.
pub fn evaluate(message: &Message, scope: &Scope, expression: &str) -> Option<PayloadValue> {
    match parse(expression) {
        Ok(parsed) => evaluate_parsed(message, scope, &parsed),
        Err(err) => {
            tracing::trace!(%expression, %err, "expression did not parse, evaluating to absent");
            None
        }
    }
}

/// Evaluates an already-parsed expression. Useful when the same expression
/// is evaluated repeatedly (e.g. once per element of a `map` transform).
pub fn evaluate_parsed(message: &Message, scope: &Scope, expression: &Expression) -> Option<PayloadValue> {
    match expression {
        Expression::Static { literal } => Some(PayloadValue::Text(literal.clone())),
        Expression::Template { text } => Some(PayloadValue::Text(render_template(message, scope, text))),
        Expression::Input { path } => {
            let (head, rest) = path.split_first()?;
            match head.as_str() {
                "payload" => navigate(message.payload(), rest),
                "topic" => message.topic().map(|topic| PayloadValue::Text(topic.to_string())),
                "topic_levels" => navigate(&topic_levels_payload(message), rest),
                "user_properties" => navigate(&map_to_payload(message.user_properties()), rest),
                _ => None,
            }
        }
        Expression::InputPayload { path } => navigate(message.payload(), path),
        Expression::InputTopic => message.topic().map(|topic| PayloadValue::Text(topic.to_string())),
        Expression::InputTopicLevels { path } => navigate(&topic_levels_payload(message), path),
        Expression::InputUserProperties { path } => navigate(&map_to_payload(message.user_properties()), path),
        Expression::Previous { path } => message.previous().and_then(|value| navigate(value, path)),
        Expression::UserData { name, path } => message.user_data(name).and_then(|value| navigate(value, path)),
        Expression::Item { path } => scope.item.as_ref().and_then(|value| navigate(value, path)),
        Expression::Index => scope
            .index
            .and_then(|index| serde_yaml::to_value(index).ok())
            .map(PayloadValue::Structured),
        Expression::KeywordArgs { path } => navigate(&map_to_payload(&scope.keyword_args), path),
        Expression::InvokeData { path } => scope.invoke_data.as_ref().and_then(|value| navigate(value, path)),
        Expression::SelfValue { path } => scope.self_value.as_ref().and_then(|value| navigate(value, path)),
    }
}

fn topic_levels_payload(message: &Message) -> PayloadValue {
    PayloadValue::Sequence(
        message
            .topic_levels()
            .into_iter()
            .map(|level| PayloadValue::Text(level.to_string()))
            .collect(),
    )
}

/// Writes `value` at `expression`. Only `user_data.<name>[:path]` and
/// `previous[:path]` are writable; anything else returns
/// [`Error::NotWritable`].
pub fn set(message: &mut Message, expression: &str, value: PayloadValue) -> Result<(), Error> {
    match parse(expression)? {
        Expression::UserData { name, path } => {
            if path.is_empty() {
                message.set_user_data(name, value);
                return Ok(());
            }
            let mut current = message.user_data(&name).cloned().unwrap_or_default();
            let segments: Vec<&str> = path.iter().map(String::as_str).collect();
            if !current.set_path(&segments, value) {
                return Err(Error::SetPathFailed(expression.to_string()));
            }
            message.set_user_data(name, current);
            Ok(())
        }
        Expression::Previous { path } => {
            if path.is_empty() {
                message.set_previous(value);
                return Ok(());
            }
            let mut current = message.previous().cloned().unwrap_or_default();
            let segments: Vec<&str> = path.iter().map(String::as_str).collect();
            if !current.set_path(&segments, value) {
                return Err(Error::SetPathFailed(expression.to_string()));
            }
            message.set_previous(current);
            Ok(())
        }
        other => Err(Error::NotWritable(format!("{other:?}"))),
    }
}

/// A type coercion requested via the optional `<type>` qualifier of
/// `evaluate_expression` (one of `int`, `float`, `bool`, `string`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum CoerceType {
    /// Coerce to a 64-bit integer.
    Int,
    /// Coerce to a 64-bit float.
    Float,
    /// Coerce to a boolean.
    Bool,
    /// Coerce to a string.
    String,
}

/// Evaluates `expression`, then applies an optional type coercion — the
/// `evaluate_expression(expr[, type])` contract used by deferred
/// configuration values.
pub fn evaluate_expression(
    message: &Message,
    scope: &Scope,
    expression: &str,
    coerce: Option<CoerceType>,
) -> Option<PayloadValue> {
    let value = evaluate(message, scope, expression)?;
    match coerce {
        None => Some(value),
        Some(coerce) => coerce_value(value, coerce),
    }
}

fn coerce_value(value: PayloadValue, coerce: CoerceType) -> Option<PayloadValue> {
    match coerce {
        CoerceType::String => Some(PayloadValue::Text(value.as_text())),
        CoerceType::Bool => Some(PayloadValue::Structured(serde_yaml::Value::Bool(is_truthy(&value)))),
        CoerceType::Int => {
            let text = value.as_text();
            let parsed = text.trim().parse::<i64>().ok().or_else(|| match value.to_yaml() {
                serde_yaml::Value::Number(n) => n.as_i64(),
                _ => None,
            })?;
            serde_yaml::to_value(parsed).ok().map(PayloadValue::Structured)
        }
        CoerceType::Float => {
            let text = value.as_text();
            let parsed = text.trim().parse::<f64>().ok().or_else(|| match value.to_yaml() {
                serde_yaml::Value::Number(n) => n.as_f64(),
                _ => None,
            })?;
            serde_yaml::to_value(parsed).ok().map(PayloadValue::Structured)
        }
    }
}

/// Truthiness used by the `filter` transform operator and by `bool`
/// coercion: `Null` and `false` are falsy, empty strings/bytes/sequences are
/// falsy, zero numbers are falsy, everything else is truthy.
pub fn is_truthy(value: &PayloadValue) -> bool {
    match value {
        PayloadValue::Null => false,
        PayloadValue::Bytes(b) => !b.is_empty(),
        PayloadValue::Text(s) => !s.is_empty(),
        PayloadValue::Sequence(items) => !items.is_empty(),
        PayloadValue::Structured(v) => match v {
            serde_yaml::Value::Null => false,
            serde_yaml::Value::Bool(b) => *b,
            serde_yaml::Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(true),
            serde_yaml::Value::String(s) => !s.is_empty(),
            serde_yaml::Value::Sequence(seq) => !seq.is_empty(),
            serde_yaml::Value::Mapping(map) => !map.is_empty(),
            _ => true,
        },
    }
}

/// Renders a template string, substituting each `{{<encoding>://<inner>}}`
/// placeholder left-to-right. `<encoding>` defaults to `text` when omitted
/// (a bare `{{<inner>}}`); an absent value renders as the empty string.
pub fn render_template(message: &Message, scope: &Scope, text: &str) -> String {
    let mut rendered = String::with_capacity(text.len());
    let mut rest = text;

    while let Some(start) = rest.find("{{") {
        rendered.push_str(&rest[..start]);
        let after_open = &rest[start + 2..];
        let Some(end) = after_open.find("}}") else {
            rendered.push_str("{{");
            rest = after_open;
            continue;
        };
        rendered.push_str(&render_placeholder(message, scope, &after_open[..end]));
        rest = &after_open[end + 2..];
    }
    rendered.push_str(rest);
    rendered
}

fn render_placeholder(message: &Message, scope: &Scope, placeholder: &str) -> String {
    let (encoding, inner_expression) = placeholder.split_once("://").unwrap_or(("text", placeholder));
    let Some(value) = evaluate(message, scope, inner_expression) else {
        return String::new();
    };

    match encoding {
        "text" => value.as_text(),
        "json" => serde_json::to_string(&value.to_json()).unwrap_or_default(),
        "yaml" => serde_yaml::to_string(&value.to_yaml()).unwrap_or_default(),
        "base64" => base64::Engine::encode(&base64::engine::general_purpose::STANDARD, &value.as_bytes()),
        datauri if datauri.starts_with("datauri:") => {
            let mime = &datauri["datauri:".len()..];
            let encoded = base64::Engine::encode(&base64::engine::general_purpose::STANDARD, &value.as_bytes());
            format!("data:{mime};base64,{encoded}")
        }
        _ => value.as_text(),
    }
}

#[cfg(test)]
mod test {
    use message::{Message, PayloadValue};

    use super::*;

    fn json_payload() -> Message {
        let json = serde_json::json!({"a": 1, "b": [2, 3]});
        Message::with_topic(PayloadValue::from_json(json), "orders/new/42")
    }

    #[test]
    fn evaluates_input_payload_path() {
        let message = json_payload();
        let scope = Scope::default();
        let value = evaluate(&message, &scope, "input.payload:a").unwrap();
        assert_eq!(value.as_text(), "1");
    }

    #[test]
    fn evaluates_topic_and_topic_levels() {
        let message = json_payload();
        let scope = Scope::default();
        assert_eq!(evaluate(&message, &scope, "input.topic").unwrap().as_text(), "orders/new/42");
        let level = evaluate(&message, &scope, "input.topic_levels:1").unwrap();
        assert_eq!(level.as_text(), "new");
    }

    #[test]
    fn missing_plane_is_absent_not_error() {
        let message = Message::new(PayloadValue::Null);
        let scope = Scope::default();
        assert!(evaluate(&message, &scope, "input.payload:missing.path").is_none());
        assert!(evaluate(&message, &scope, "previous:anything").is_none());
    }

    #[test]
    fn evaluation_is_pure() {
        let message = json_payload();
        let scope = Scope::default();
        let first = evaluate(&message, &scope, "input.payload:b.0");
        let second = evaluate(&message, &scope, "input.payload:b.0");
        assert_eq!(first, second);
    }

    #[test]
    fn static_plane_returns_literal() {
        let message = Message::new(PayloadValue::Null);
        let scope = Scope::default();
        assert_eq!(evaluate(&message, &scope, "static:hello").unwrap().as_text(), "hello");
    }

    #[test]
    fn set_data_then_get_data_round_trips() {
        let mut message = Message::new(PayloadValue::Null);
        set(&mut message, "user_data.scratch:nested.value", PayloadValue::Text("v".into())).unwrap();
        let scope = Scope::default();
        let got = evaluate(&message, &scope, "user_data.scratch:nested.value").unwrap();
        assert_eq!(got.as_text(), "v");
    }

    #[test]
    fn set_previous_is_writable_during_a_transform() {
        let mut message = Message::new(PayloadValue::Null);
        set(&mut message, "previous", PayloadValue::Text("x".into())).unwrap();
        assert_eq!(message.previous(), Some(&PayloadValue::Text("x".into())));
    }

    #[test]
    fn set_rejects_read_only_planes() {
        let mut message = Message::new(PayloadValue::Null);
        let err = set(&mut message, "input.payload", PayloadValue::Text("x".into())).unwrap_err();
        assert!(matches!(err, Error::NotWritable(_)));
    }

    #[test]
    fn template_identity_round_trip() {
        let message = json_payload();
        let scope = Scope::default();
        let rendered = render_template(&message, &scope, "{{text://input.payload:a}}");
        let direct = evaluate(&message, &scope, "input.payload:a").unwrap();
        assert_eq!(rendered, direct.as_text());
    }

    #[test]
    fn template_json_placeholder() {
        let message = json_payload();
        let scope = Scope::default();
        let rendered = render_template(&message, &scope, "X={{json://input.payload}}");
        assert_eq!(rendered, "X={\"a\":1,\"b\":[2,3]}");
    }

    #[test]
    fn template_missing_value_renders_empty() {
        let message = Message::new(PayloadValue::Null);
        let scope = Scope::default();
        let rendered = render_template(&message, &scope, "[{{text://input.payload:missing}}]");
        assert_eq!(rendered, "[]");
    }

    #[test]
    fn coerces_to_int_and_bool() {
        let message = Message::new(PayloadValue::Text("42".into()));
        let scope = Scope::default();
        let as_int = evaluate_expression(&message, &scope, "input.payload", Some(CoerceType::Int)).unwrap();
        assert_eq!(as_int.as_text(), "42");
        let as_bool = evaluate_expression(&message, &scope, "static:", Some(CoerceType::Bool)).unwrap();
        assert_eq!(as_bool, PayloadValue::Structured(serde_yaml::Value::Bool(false)));
    }
}
