//! Compiles subscription topic patterns (solace wildcard grammar: `*`
//! matches exactly one level, `>` matches one or more trailing levels,
//! `/` is the level separator) into regular expressions, and routes an
//! incoming topic to the first component (in declared order) whose
//! subscriptions match it.

use regex::Regex;

use crate::Error;

/// Compiles `pattern` into a regular expression matching the topics it
/// describes.
pub fn compile_pattern(pattern: &str) -> Result<Regex, Error> {
    let levels: Vec<&str> = pattern.split('/').collect();
    let mut parts = Vec::with_capacity(levels.len());

    for (index, level) in levels.iter().enumerate() {
        let is_last = index == levels.len() - 1;
        match *level {
            "*" => parts.push("[^/]+".to_string()),
            ">" if is_last => parts.push(">".to_string()),
            ">" => {
                return Err(Error::InvalidSubscription {
                    pattern: pattern.to_string(),
                    reason: "'>' must be the last topic level".to_string(),
                })
            }
            other => parts.push(regex::escape(other)),
        }
    }

    let pattern_str = if parts.last().map(String::as_str) == Some(">") {
        let prefix = parts[..parts.len() - 1].join("/");
        if prefix.is_empty() {
            "^.+$".to_string()
        } else {
            format!("^{prefix}/.+$")
        }
    } else {
        format!("^{}$", parts.join("/"))
    };

    Regex::new(&pattern_str).map_err(|err| Error::InvalidSubscription {
        pattern: pattern.to_string(),
        reason: err.to_string(),
    })
}

/// Routes an incoming topic to the first matching component, by declared
/// order. Built once at flow construction from each user component's
/// configured subscription list.
pub struct SubscriptionRouter {
    /// `subscriptions[i]` is the compiled pattern set for component `i`.
    subscriptions: Vec<Vec<Regex>>,
}

impl SubscriptionRouter {
    /// Compiles the subscription lists declared, in order, by each
    /// downstream component.
    pub fn new(subscriptions_per_component: &[Vec<String>]) -> Result<Self, Error> {
        let subscriptions = subscriptions_per_component
            .iter()
            .map(|patterns| patterns.iter().map(|pattern| compile_pattern(pattern)).collect::<Result<Vec<_>, _>>())
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { subscriptions })
    }

    /// Returns the index of the first component (in declared order) whose
    /// subscriptions match `topic`, or `None` if no component matches.
    pub fn route(&self, topic: &str) -> Option<usize> {
        self.subscriptions.iter().position(|patterns| patterns.iter().any(|pattern| pattern.is_match(topic)))
    }
}
