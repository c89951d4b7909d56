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

//! The `Message` object that flows through a flow: a payload carried
//! alongside routing metadata (topic, user properties), a scratch space for
//! components to stash derived values (`user_data`), a snapshot of the
//! payload before the last transform (`previous`), and the acknowledgement
//! machinery a broker input relies on to know when it is safe to ack/nack the
//! original delivery.
//!
//! A `Message` is a cheap-to-clone handle: cloning duplicates the current
//! payload/metadata snapshot (needed when a component fans a message out to
//! several downstream consumers) but keeps a shared handle on the
//! acknowledgement state, so whichever clone resolves first is the one that
//! counts — acknowledgement happens at most once for the delivery the
//! `Message` was constructed from.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex,
    },
};

/// A tagged-union payload representation. `Structured` reuses
/// `serde_yaml::Value` as the navigable tree type so JSON, YAML, and
/// programmatically-built payloads share one representation instead of a
/// bespoke tree.
#[derive(Debug, Clone, PartialEq)]
#[non_exhaustive]
pub enum PayloadValue {
    /// Raw, unparsed bytes.
    Bytes(Vec<u8>),
    /// A plain text payload.
    Text(String),
    /// A structured (map/sequence/scalar) payload.
    Structured(serde_yaml::Value),
    /// A sequence of payload values, used by iteration and the `map`
    /// transform operator.
    Sequence(Vec<PayloadValue>),
    /// The absence of a payload.
    Null,
}

impl Default for PayloadValue {
    fn default() -> Self {
        PayloadValue::Null
    }
}

impl PayloadValue {
    /// Returns this payload as a byte slice, encoding structured/text
    /// payloads as needed.
    pub fn as_bytes(&self) -> Vec<u8> {
        match self {
            PayloadValue::Bytes(b) => b.clone(),
            PayloadValue::Text(s) => s.as_bytes().to_vec(),
            PayloadValue::Structured(v) => serde_json::to_vec(v).unwrap_or_default(),
            PayloadValue::Sequence(_) => serde_json::to_vec(&self.to_json()).unwrap_or_default(),
            PayloadValue::Null => vec![],
        }
    }

    /// Returns this payload rendered as a UTF-8 string, best-effort.
    pub fn as_text(&self) -> String {
        match self {
            PayloadValue::Bytes(b) => String::from_utf8_lossy(b).into_owned(),
            PayloadValue::Text(s) => s.clone(),
            PayloadValue::Structured(v) => serde_yaml::to_string(v).unwrap_or_default(),
            PayloadValue::Sequence(_) => serde_json::to_string(&self.to_json()).unwrap_or_default(),
            PayloadValue::Null => String::new(),
        }
    }

    /// Converts this payload into a `serde_json::Value` tree, for template
    /// rendering and JSON encoding.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            PayloadValue::Bytes(b) => serde_json::Value::String(base64::Engine::encode(
                &base64::engine::general_purpose::STANDARD,
                b,
            )),
            PayloadValue::Text(s) => serde_json::Value::String(s.clone()),
            PayloadValue::Structured(v) => yaml_to_json(v),
            PayloadValue::Sequence(items) => serde_json::Value::Array(items.iter().map(PayloadValue::to_json).collect()),
            PayloadValue::Null => serde_json::Value::Null,
        }
    }

    /// Builds a `PayloadValue` from a parsed JSON document.
    pub fn from_json(value: serde_json::Value) -> Self {
        PayloadValue::Structured(json_to_yaml(value))
    }

    /// Converts this payload into a navigable `serde_yaml::Value` tree
    /// (bytes are base64-encoded, `Sequence` becomes a YAML sequence).
    pub fn to_yaml(&self) -> serde_yaml::Value {
        match self {
            PayloadValue::Bytes(b) => {
                serde_yaml::Value::String(base64::Engine::encode(&base64::engine::general_purpose::STANDARD, b))
            }
            PayloadValue::Text(s) => serde_yaml::Value::String(s.clone()),
            PayloadValue::Structured(v) => v.clone(),
            PayloadValue::Sequence(items) => serde_yaml::Value::Sequence(items.iter().map(PayloadValue::to_yaml).collect()),
            PayloadValue::Null => serde_yaml::Value::Null,
        }
    }

    /// Navigates this payload following a dotted path (e.g. `["a", "b"]`),
    /// indexing into structured maps and sequences (numeric segments index
    /// sequences, other segments index maps). Returns `None` if any segment
    /// of the path is absent or the value at that point isn't indexable.
    pub fn get_path(&self, segments: &[&str]) -> Option<PayloadValue> {
        let mut current = self.to_yaml();
        for segment in segments {
            current = match current {
                serde_yaml::Value::Mapping(map) => {
                    map.get(&serde_yaml::Value::String((*segment).to_string()))?.clone()
                }
                serde_yaml::Value::Sequence(seq) => {
                    let index: usize = segment.parse().ok()?;
                    seq.get(index)?.clone()
                }
                _ => return None,
            };
        }
        Some(PayloadValue::Structured(current))
    }

    /// Sets the value at a dotted path, creating intermediate maps as
    /// needed. Returns `false` if a non-leaf segment addresses a scalar.
    pub fn set_path(&mut self, segments: &[&str], value: PayloadValue) -> bool {
        if segments.is_empty() {
            *self = value;
            return true;
        }
        let mut root = self.to_yaml();
        let ok = set_yaml_path(&mut root, segments, value.to_yaml());
        if ok {
            *self = PayloadValue::Structured(root);
        }
        ok
    }
}

fn set_yaml_path(node: &mut serde_yaml::Value, segments: &[&str], value: serde_yaml::Value) -> bool {
    let (head, rest) = segments.split_first().expect("segments checked non-empty by caller");

    if !matches!(node, serde_yaml::Value::Mapping(_) | serde_yaml::Value::Sequence(_)) {
        *node = serde_yaml::Value::Mapping(serde_yaml::Mapping::new());
    }

    match node {
        serde_yaml::Value::Mapping(map) => {
            let key = serde_yaml::Value::String((*head).to_string());
            if rest.is_empty() {
                let _ = map.insert(key, value);
                true
            } else {
                if !map.contains_key(&key) {
                    let _ = map.insert(key.clone(), serde_yaml::Value::Mapping(serde_yaml::Mapping::new()));
                }
                set_yaml_path(map.get_mut(&key).expect("just inserted"), rest, value)
            }
        }
        serde_yaml::Value::Sequence(seq) => {
            let Ok(index) = head.parse::<usize>() else { return false };
            if index >= seq.len() {
                seq.resize(index + 1, serde_yaml::Value::Null);
            }
            if rest.is_empty() {
                seq[index] = value;
                true
            } else {
                set_yaml_path(&mut seq[index], rest, value)
            }
        }
        _ => false,
    }
}

fn yaml_to_json(value: &serde_yaml::Value) -> serde_json::Value {
    match value {
        serde_yaml::Value::Null => serde_json::Value::Null,
        serde_yaml::Value::Bool(b) => serde_json::Value::Bool(*b),
        serde_yaml::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                serde_json::Value::from(i)
            } else if let Some(u) = n.as_u64() {
                serde_json::Value::from(u)
            } else {
                serde_json::Number::from_f64(n.as_f64().unwrap_or_default())
                    .map(serde_json::Value::Number)
                    .unwrap_or(serde_json::Value::Null)
            }
        }
        serde_yaml::Value::String(s) => serde_json::Value::String(s.clone()),
        serde_yaml::Value::Sequence(seq) => serde_json::Value::Array(seq.iter().map(yaml_to_json).collect()),
        serde_yaml::Value::Mapping(map) => {
            let mut obj = serde_json::Map::new();
            for (k, v) in map {
                if let serde_yaml::Value::String(key) = k {
                    let _ = obj.insert(key.clone(), yaml_to_json(v));
                }
            }
            serde_json::Value::Object(obj)
        }
        _ => serde_json::Value::Null,
    }
}

fn json_to_yaml(value: serde_json::Value) -> serde_yaml::Value {
    match value {
        serde_json::Value::Null => serde_yaml::Value::Null,
        serde_json::Value::Bool(b) => serde_yaml::Value::Bool(b),
        serde_json::Value::Number(n) => serde_yaml::Value::Number(
            n.as_i64()
                .map(serde_yaml::Number::from)
                .or_else(|| n.as_f64().map(serde_yaml::Number::from))
                .unwrap_or_else(|| serde_yaml::Number::from(0)),
        ),
        serde_json::Value::String(s) => serde_yaml::Value::String(s),
        serde_json::Value::Array(arr) => serde_yaml::Value::Sequence(arr.into_iter().map(json_to_yaml).collect()),
        serde_json::Value::Object(obj) => {
            let mut map = serde_yaml::Mapping::new();
            for (k, v) in obj {
                let _ = map.insert(serde_yaml::Value::String(k), json_to_yaml(v));
            }
            serde_yaml::Value::Mapping(map)
        }
    }
}

/// Shared acknowledgement state behind a `Message`. Either resolved directly
/// (the common case) or forwarded into an `IterationJoin` when the message is
/// a child produced by an iteration split.
enum AckState {
    Direct {
        resolved: AtomicBool,
        on_ack: Mutex<Vec<Box<dyn FnOnce() + Send>>>,
        on_nack: Mutex<Vec<Box<dyn FnOnce(&str) + Send>>>,
    },
    IterationChild {
        resolved: AtomicBool,
        join: Arc<IterationJoin>,
    },
}

impl AckState {
    fn direct() -> Arc<Self> {
        Arc::new(AckState::Direct {
            resolved: AtomicBool::new(false),
            on_ack: Mutex::new(Vec::new()),
            on_nack: Mutex::new(Vec::new()),
        })
    }

    fn resolve_ack(&self) {
        match self {
            AckState::Direct { resolved, on_ack, .. } => {
                if resolved.swap(true, Ordering::AcqRel) {
                    return;
                }
                let callbacks = std::mem::take(&mut *on_ack.lock().expect("ack callback lock poisoned"));
                for cb in callbacks {
                    cb();
                }
            }
            AckState::IterationChild { resolved, join } => {
                if resolved.swap(true, Ordering::AcqRel) {
                    return;
                }
                join.child_resolved(None);
            }
        }
    }

    fn resolve_nack(&self, reason: &str) {
        match self {
            AckState::Direct { resolved, on_nack, .. } => {
                if resolved.swap(true, Ordering::AcqRel) {
                    return;
                }
                let callbacks = std::mem::take(&mut *on_nack.lock().expect("nack callback lock poisoned"));
                for cb in callbacks {
                    cb(reason);
                }
            }
            AckState::IterationChild { resolved, join } => {
                if resolved.swap(true, Ordering::AcqRel) {
                    return;
                }
                join.child_resolved(Some(reason.to_string()));
            }
        }
    }

    fn add_ack(&self, f: Box<dyn FnOnce() + Send>) {
        if let AckState::Direct { on_ack, .. } = self {
            on_ack.lock().expect("ack callback lock poisoned").push(f);
        }
    }

    fn add_nack(&self, f: Box<dyn FnOnce(&str) + Send>) {
        if let AckState::Direct { on_nack, .. } = self {
            on_nack.lock().expect("nack callback lock poisoned").push(f);
        }
    }
}

/// Tracks the fan-out produced by an iteration split: the parent message is
/// only acked (or nacked, if any child failed) once every child has
/// resolved.
struct IterationJoin {
    remaining: AtomicUsize,
    failure: Mutex<Option<String>>,
    parent: Arc<AckState>,
}

impl IterationJoin {
    fn child_resolved(&self, nack_reason: Option<String>) {
        if let Some(reason) = nack_reason {
            let mut failure = self.failure.lock().expect("iteration failure lock poisoned");
            if failure.is_none() {
                *failure = Some(reason);
            }
        }

        if self.remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
            match self.failure.lock().expect("iteration failure lock poisoned").take() {
                Some(reason) => self.parent.resolve_nack(&reason),
                None => self.parent.resolve_ack(),
            }
        }
    }
}

/// A handle used to create the children of an iteration split. All children
/// must resolve (ack or nack) before the parent message resolves.
#[derive(Clone)]
pub struct IterationHandle {
    join: Arc<IterationJoin>,
}

impl IterationHandle {
    /// Creates a child message for this iteration. `result` is this
    /// iteration's invoke result and becomes the child's `previous`, mirroring
    /// the single-emit case; the child inherits the parent's payload (the
    /// originating input), topic and user properties.
    pub fn child(&self, parent: &Message, result: PayloadValue) -> Message {
        Message {
            payload: parent.payload.clone(),
            topic: parent.topic.clone(),
            user_properties: parent.user_properties.clone(),
            user_data: HashMap::new(),
            previous: Some(Box::new(result)),
            ack_state: Arc::new(AckState::IterationChild {
                resolved: AtomicBool::new(false),
                join: self.join.clone(),
            }),
        }
    }
}

/// The message object flowing through a flow.
#[derive(Clone)]
pub struct Message {
    payload: PayloadValue,
    topic: Option<String>,
    user_properties: HashMap<String, PayloadValue>,
    user_data: HashMap<String, PayloadValue>,
    previous: Option<Box<PayloadValue>>,
    ack_state: Arc<AckState>,
}

impl Message {
    /// Creates a new message with no topic, no properties, and a fresh
    /// acknowledgement state.
    pub fn new(payload: PayloadValue) -> Self {
        Self {
            payload,
            topic: None,
            user_properties: HashMap::new(),
            user_data: HashMap::new(),
            previous: None,
            ack_state: AckState::direct(),
        }
    }

    /// Creates a new message addressed to `topic`.
    pub fn with_topic(payload: PayloadValue, topic: impl Into<String>) -> Self {
        let mut message = Self::new(payload);
        message.topic = Some(topic.into());
        message
    }

    /// Returns the current payload.
    pub fn payload(&self) -> &PayloadValue {
        &self.payload
    }

    /// Replaces the payload, stashing the previous value so `previous()`
    /// reflects the payload as it was before this transform.
    pub fn set_payload(&mut self, payload: PayloadValue) {
        let old = std::mem::replace(&mut self.payload, payload);
        self.previous = Some(Box::new(old));
    }

    /// Returns the payload as it was before the last `set_payload` call.
    pub fn previous(&self) -> Option<&PayloadValue> {
        self.previous.as_deref()
    }

    /// Directly overwrites `previous`, bypassing the payload-stashing done by
    /// `set_payload`. Used by the transform engine, which writes to the
    /// `previous` plane without touching the current payload.
    pub fn set_previous(&mut self, value: PayloadValue) {
        self.previous = Some(Box::new(value));
    }

    /// Returns the topic, if any.
    pub fn topic(&self) -> Option<&str> {
        self.topic.as_deref()
    }

    /// Sets the topic.
    pub fn set_topic(&mut self, topic: impl Into<String>) {
        self.topic = Some(topic.into());
    }

    /// Splits the topic into its `/`-separated levels. Returns an empty
    /// vector when there is no topic.
    pub fn topic_levels(&self) -> Vec<&str> {
        self.topic.as_deref().map(|t| t.split('/').collect()).unwrap_or_default()
    }

    /// Returns the user properties map.
    pub fn user_properties(&self) -> &HashMap<String, PayloadValue> {
        &self.user_properties
    }

    /// Sets a user property.
    pub fn set_user_property(&mut self, key: impl Into<String>, value: PayloadValue) {
        let _ = self.user_properties.insert(key.into(), value);
    }

    /// Returns a named entry of the component-local scratch space.
    pub fn user_data(&self, name: &str) -> Option<&PayloadValue> {
        self.user_data.get(name)
    }

    /// Sets a named entry of the component-local scratch space.
    pub fn set_user_data(&mut self, name: impl Into<String>, value: PayloadValue) {
        let _ = self.user_data.insert(name.into(), value);
    }

    /// Registers a callback invoked exactly once, the first time this
    /// message (or a clone sharing its acknowledgement state) is acked.
    pub fn on_ack(&self, f: impl FnOnce() + Send + 'static) {
        self.ack_state.add_ack(Box::new(f));
    }

    /// Registers a callback invoked exactly once, the first time this
    /// message (or a clone sharing its acknowledgement state) is nacked.
    pub fn on_nack(&self, f: impl FnOnce(&str) + Send + 'static) {
        self.ack_state.add_nack(Box::new(f));
    }

    /// Acknowledges this message. A no-op if the message was already
    /// acked/nacked, or if it is a child of an iteration that has not fully
    /// resolved yet.
    pub fn ack(&self) {
        self.ack_state.resolve_ack();
    }

    /// Negatively acknowledges this message with `reason`.
    pub fn nack(&self, reason: impl AsRef<str>) {
        self.ack_state.resolve_nack(reason.as_ref());
    }

    /// Discards this message: it is acked (the delivery is considered
    /// consumed) but no further processing happens.
    pub fn discard(&self) {
        self.ack();
    }

    /// Starts an iteration split: `count` children must be created via the
    /// returned handle, and the parent only resolves once every child has
    /// resolved (ack if none failed, nack with the first failure reason
    /// otherwise).
    pub fn begin_iteration(&self, count: usize) -> IterationHandle {
        IterationHandle {
            join: Arc::new(IterationJoin {
                remaining: AtomicUsize::new(count.max(1)),
                failure: Mutex::new(None),
                parent: self.ack_state.clone(),
            }),
        }
    }
}

impl std::fmt::Debug for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Message")
            .field("topic", &self.topic)
            .field("payload", &self.payload)
            .finish()
    }
}

#[cfg(test)]
mod test {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    use super::*;

    #[test]
    fn ack_runs_exactly_once_across_clones() {
        let message = Message::new(PayloadValue::Text("hello".into()));
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();
        message.on_ack(move || {
            let _ = calls_clone.fetch_add(1, Ordering::SeqCst);
        });

        let clone = message.clone();
        message.ack();
        clone.ack();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn nack_carries_reason() {
        let message = Message::new(PayloadValue::Null);
        let captured = Arc::new(std::sync::Mutex::new(None));
        let captured_clone = captured.clone();
        message.on_nack(move |reason| {
            *captured_clone.lock().unwrap() = Some(reason.to_string());
        });

        message.nack("boom");
        assert_eq!(captured.lock().unwrap().as_deref(), Some("boom"));
    }

    #[test]
    fn iteration_join_acks_parent_only_once_all_children_ack() {
        let parent = Message::new(PayloadValue::Sequence(vec![
            PayloadValue::Text("a".into()),
            PayloadValue::Text("b".into()),
        ]));
        let parent_acked = Arc::new(AtomicUsize::new(0));
        let parent_acked_clone = parent_acked.clone();
        parent.on_ack(move || {
            let _ = parent_acked_clone.fetch_add(1, Ordering::SeqCst);
        });

        let handle = parent.begin_iteration(2);
        let child1 = handle.child(&parent, PayloadValue::Text("a".into()));
        let child2 = handle.child(&parent, PayloadValue::Text("b".into()));

        child1.ack();
        assert_eq!(parent_acked.load(Ordering::SeqCst), 0);
        child2.ack();
        assert_eq!(parent_acked.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn iteration_join_nacks_parent_if_any_child_fails() {
        let parent = Message::new(PayloadValue::Null);
        let parent_nacked = Arc::new(std::sync::Mutex::new(None));
        let parent_nacked_clone = parent_nacked.clone();
        parent.on_nack(move |reason| {
            *parent_nacked_clone.lock().unwrap() = Some(reason.to_string());
        });

        let handle = parent.begin_iteration(2);
        let child1 = handle.child(&parent, PayloadValue::Null);
        let child2 = handle.child(&parent, PayloadValue::Null);

        child1.ack();
        child2.nack("child failed");

        assert_eq!(parent_nacked.lock().unwrap().as_deref(), Some("child failed"));
    }

    #[test]
    fn topic_levels_split_on_slash() {
        let message = Message::with_topic(PayloadValue::Null, "a/b/c");
        assert_eq!(message.topic_levels(), vec!["a", "b", "c"]);
    }

    #[test]
    fn set_payload_stashes_previous() {
        let mut message = Message::new(PayloadValue::Text("one".into()));
        message.set_payload(PayloadValue::Text("two".into()));
        assert_eq!(message.previous(), Some(&PayloadValue::Text("one".into())));
        assert_eq!(message.payload(), &PayloadValue::Text("two".into()));
    }
}
