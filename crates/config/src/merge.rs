//! Deep-merges multiple parsed YAML documents (later documents override
//! earlier ones; mappings are unioned key-wise, sequences are replaced
//! wholesale) and substitutes `${NAME}`/`${NAME, default}` environment
//! references in the raw document text before it is parsed.

use std::sync::OnceLock;

use regex::Regex;
use serde_yaml::Value;

fn env_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\$\{\s*([A-Za-z_][A-Za-z0-9_]*)\s*(?:,\s*([^}]*))?\}").expect("static env pattern"))
}

/// Replaces every `${NAME}`/`${NAME, default}` occurrence in `text` with the
/// environment variable's value, or `default` (or the empty string if no
/// default is given) when the variable is unset.
pub fn substitute_env_vars(text: &str) -> String {
    env_pattern()
        .replace_all(text, |captures: &regex::Captures<'_>| {
            let name = &captures[1];
            match std::env::var(name) {
                Ok(value) => value,
                Err(_) => captures.get(2).map(|m| m.as_str().trim().to_string()).unwrap_or_default(),
            }
        })
        .into_owned()
}

/// Deep-merges `overlay` onto `base`: mappings are merged key-wise
/// (recursively), with `overlay`'s value winning on conflicting scalars or
/// sequences; anything that isn't a mapping on either side is replaced
/// wholesale by `overlay`.
pub fn deep_merge(base: Value, overlay: Value) -> Value {
    match (base, overlay) {
        (Value::Mapping(mut base_map), Value::Mapping(overlay_map)) => {
            for (key, overlay_value) in overlay_map {
                let merged = match base_map.remove(&key) {
                    Some(base_value) => deep_merge(base_value, overlay_value),
                    None => overlay_value,
                };
                let _ = base_map.insert(key, merged);
            }
            Value::Mapping(base_map)
        }
        (_, overlay) => overlay,
    }
}

/// Parses and substitutes environment references in `documents` (in order),
/// deep-merging them into a single tree.
pub fn merge_documents(documents: &[String]) -> Result<Value, serde_yaml::Error> {
    let mut merged = Value::Null;
    for document in documents {
        let substituted = substitute_env_vars(document);
        let parsed: Value = serde_yaml::from_str(&substituted)?;
        merged = deep_merge(merged, parsed);
    }
    Ok(merged)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn env_substitution_uses_value_or_default() {
        std::env::set_var("CONFIG_MERGE_TEST_VAR", "hello");
        assert_eq!(substitute_env_vars("x: ${CONFIG_MERGE_TEST_VAR}"), "x: hello");
        assert_eq!(substitute_env_vars("x: ${CONFIG_MERGE_TEST_MISSING, fallback}"), "x: fallback");
        std::env::remove_var("CONFIG_MERGE_TEST_VAR");
    }

    #[test]
    fn deep_merge_unions_mappings_and_replaces_sequences() {
        let base: Value = serde_yaml::from_str("a: 1\nb: {x: 1, y: 2}\nlist: [1, 2]").unwrap();
        let overlay: Value = serde_yaml::from_str("b: {y: 3, z: 4}\nlist: [9]").unwrap();
        let merged = deep_merge(base, overlay);
        let expected: Value = serde_yaml::from_str("a: 1\nb: {x: 1, y: 3, z: 4}\nlist: [9]").unwrap();
        assert_eq!(merged, expected);
    }

    #[test]
    fn merge_documents_applies_later_override() {
        let docs = vec!["a: 1\nb: 2".to_string(), "b: 3".to_string()];
        let merged = merge_documents(&docs).unwrap();
        let expected: Value = serde_yaml::from_str("a: 1\nb: 3").unwrap();
        assert_eq!(merged, expected);
    }
}
