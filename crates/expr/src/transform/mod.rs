//! Ordered, declarative Message mutations applied before a component's
//! `invoke`. Each operator reads from one or more source expressions/values
//! and writes into a destination expression (restricted, like [`crate::set`],
//! to `user_data.*` and `previous`).

use std::{collections::HashMap, sync::Arc};

use message::{Message, PayloadValue};

use crate::{evaluate, is_truthy, set, Scope};

/// A function invoked per-element by `map`/`reduce`/`filter`, evaluated
/// against the message and the transform-local scope built for that
/// element. Configuration resolves an `invoke` block using
/// `evaluate_expression` down to one of these at load time; `expr::transform`
/// only needs the resulting callable.
pub type TransformFn = Arc<dyn Fn(&Message, &Scope) -> Option<PayloadValue> + Send + Sync>;

/// Error raised while applying a transform.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// A `copy`/`append` transform had neither or both of
    /// `source_expression`/`source_value` set; exactly one is required.
    #[error("transform requires exactly one of source_expression/source_value")]
    AmbiguousSource,
    /// Writing the destination expression failed (e.g. not a writable
    /// plane).
    #[error("writing destination expression failed: {0}")]
    Dest(#[from] crate::Error),
}

/// One element of an ordered transform list.
#[derive(Clone)]
#[non_exhaustive]
pub enum Transform {
    /// Copies a source (expression or literal value) to `dest_expression`.
    Copy {
        /// An expression evaluated against the message to produce the
        /// source value.
        source_expression: Option<String>,
        /// A literal source value.
        source_value: Option<PayloadValue>,
        /// The destination expression.
        dest_expression: String,
    },
    /// Appends a source (expression or literal value) to the sequence at
    /// `dest_expression`, creating it if absent.
    Append {
        /// An expression evaluated against the message to produce the
        /// value being appended.
        source_expression: Option<String>,
        /// A literal value being appended.
        source_value: Option<PayloadValue>,
        /// The destination expression (addresses a sequence).
        dest_expression: String,
    },
    /// Maps each element of `source_list_expression` through
    /// `source_expression` (with `item`/`index` bound), optionally post
    /// processed by `processing_function`, writing the results to
    /// `dest_list_expression`.
    Map {
        /// Expression evaluating to the source sequence.
        source_list_expression: String,
        /// Expression evaluated per-element, with `item`/`index` bound.
        source_expression: String,
        /// Optional post-processing function applied to each mapped value.
        processing_function: Option<TransformFn>,
        /// The destination expression (a sequence).
        dest_list_expression: String,
    },
    /// Reduces `source_list_expression` to a single value via
    /// `accumulator_function`, seeded with `initial_value`, writing the
    /// final accumulator to `dest_expression`.
    Reduce {
        /// Expression evaluating to the source sequence.
        source_list_expression: String,
        /// Function called per element with `keyword_args.accumulated_value`
        /// / `keyword_args.current_value` bound; returns the next
        /// accumulator.
        accumulator_function: TransformFn,
        /// The seed accumulator.
        initial_value: PayloadValue,
        /// The destination expression.
        dest_expression: String,
    },
    /// Filters `source_list_expression` by `filter_function`, writing kept
    /// elements (in order) to `dest_list_expression`.
    Filter {
        /// Expression evaluating to the source sequence.
        source_list_expression: String,
        /// Function called per element with `keyword_args.current_value` /
        /// `keyword_args.index` bound; elements are kept when truthy.
        filter_function: TransformFn,
        /// The destination expression (a sequence).
        dest_list_expression: String,
    },
}

/// Applies an ordered list of transforms to `message`, in order. An empty
/// list is the identity operation.
pub fn apply_all(message: &mut Message, transforms: &[Transform]) -> Result<(), Error> {
    for transform in transforms {
        apply_one(message, transform)?;
    }
    Ok(())
}

fn apply_one(message: &mut Message, transform: &Transform) -> Result<(), Error> {
    match transform {
        Transform::Copy {
            source_expression,
            source_value,
            dest_expression,
        } => {
            let value = resolve_source(message, source_expression, source_value)?;
            set(message, dest_expression, value)?;
            Ok(())
        }
        Transform::Append {
            source_expression,
            source_value,
            dest_expression,
        } => {
            let value = resolve_source(message, source_expression, source_value)?;
            let scope = Scope::default();
            let mut items = match evaluate(message, &scope, dest_expression) {
                Some(PayloadValue::Sequence(items)) => items,
                Some(PayloadValue::Null) | None => Vec::new(),
                Some(other) => vec![other],
            };
            items.push(value);
            set(message, dest_expression, PayloadValue::Sequence(items))?;
            Ok(())
        }
        Transform::Map {
            source_list_expression,
            source_expression,
            processing_function,
            dest_list_expression,
        } => {
            let items = list_items(message, source_list_expression);
            let mut mapped = Vec::with_capacity(items.len());
            for (index, item) in items.into_iter().enumerate() {
                let scope = Scope {
                    item: Some(item),
                    index: Some(index),
                    ..Scope::default()
                };
                let mut value = evaluate(message, &scope, source_expression).unwrap_or(PayloadValue::Null);
                if let Some(processing_function) = processing_function {
                    if let Some(processed) = processing_function(message, &scope) {
                        value = processed;
                    }
                }
                mapped.push(value);
            }
            set(message, dest_list_expression, PayloadValue::Sequence(mapped))?;
            Ok(())
        }
        Transform::Reduce {
            source_list_expression,
            accumulator_function,
            initial_value,
            dest_expression,
        } => {
            let items = list_items(message, source_list_expression);
            let mut accumulated = initial_value.clone();
            for item in items {
                let mut keyword_args = HashMap::new();
                let _ = keyword_args.insert("accumulated_value".to_string(), accumulated.clone());
                let _ = keyword_args.insert("current_value".to_string(), item);
                let scope = Scope {
                    keyword_args,
                    ..Scope::default()
                };
                if let Some(next) = accumulator_function(message, &scope) {
                    accumulated = next;
                }
            }
            set(message, dest_expression, accumulated)?;
            Ok(())
        }
        Transform::Filter {
            source_list_expression,
            filter_function,
            dest_list_expression,
        } => {
            let items = list_items(message, source_list_expression);
            let mut kept = Vec::new();
            for (index, item) in items.into_iter().enumerate() {
                let mut keyword_args = HashMap::new();
                let _ = keyword_args.insert("current_value".to_string(), item.clone());
                let _ = keyword_args.insert(
                    "index".to_string(),
                    serde_yaml::to_value(index).map(PayloadValue::Structured).unwrap_or(PayloadValue::Null),
                );
                let scope = Scope {
                    keyword_args,
                    ..Scope::default()
                };
                let keep = accumulator_truthy(filter_function(message, &scope));
                if keep {
                    kept.push(item);
                }
            }
            set(message, dest_list_expression, PayloadValue::Sequence(kept))?;
            Ok(())
        }
    }
}

fn accumulator_truthy(value: Option<PayloadValue>) -> bool {
    value.as_ref().map(is_truthy).unwrap_or(false)
}

fn resolve_source(
    message: &Message,
    source_expression: &Option<String>,
    source_value: &Option<PayloadValue>,
) -> Result<PayloadValue, Error> {
    match (source_expression, source_value) {
        (Some(expression), None) => Ok(evaluate(message, &Scope::default(), expression).unwrap_or(PayloadValue::Null)),
        (None, Some(value)) => Ok(value.clone()),
        _ => Err(Error::AmbiguousSource),
    }
}

/// Evaluates `expression`, treating an absent or non-sequence result as an
/// empty list (the boundary behavior `map`/`reduce`/`filter` require).
fn list_items(message: &Message, expression: &str) -> Vec<PayloadValue> {
    match evaluate(message, &Scope::default(), expression) {
        Some(PayloadValue::Sequence(items)) => items,
        _ => Vec::new(),
    }
}
