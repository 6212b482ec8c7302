//! Environment-variable model shared with the configuration layer.

use serde::de::Deserializer;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A single key/value pair applied to a child process environment or an
/// HTTP header set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvVar {
    pub key: String,
    pub value: String,
}

impl EnvVar {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// Deserialize env vars supporting both list and map forms.
///
/// Configuration files in the wild use either
/// `[{"key": "FOO", "value": "bar"}]` or `{"FOO": "bar"}`; map keys become
/// `key`. Map form is sorted by key so output ordering is deterministic.
pub fn deserialize_env_vars<'de, D>(deserializer: D) -> Result<Option<Vec<EnvVar>>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<RawEnvCollection>::deserialize(deserializer)?;
    Ok(raw.map(RawEnvCollection::into_env_vars))
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawEnvCollection {
    List(Vec<EnvVar>),
    Map(HashMap<String, String>),
}

impl RawEnvCollection {
    fn into_env_vars(self) -> Vec<EnvVar> {
        match self {
            RawEnvCollection::List(list) => list,
            RawEnvCollection::Map(map) => {
                let mut vars: Vec<EnvVar> =
                    map.into_iter().map(|(key, value)| EnvVar { key, value }).collect();
                vars.sort_by(|a, b| a.key.cmp(&b.key));
                vars
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Deserialize)]
    struct Holder {
        #[serde(default, deserialize_with = "deserialize_env_vars")]
        env: Option<Vec<EnvVar>>,
    }

    #[test]
    fn list_form() {
        let holder: Holder =
            serde_json::from_str(r#"{"env": [{"key": "A", "value": "1"}]}"#).unwrap();
        assert_eq!(holder.env.unwrap(), vec![EnvVar::new("A", "1")]);
    }

    #[test]
    fn map_form_is_sorted() {
        let holder: Holder = serde_json::from_str(r#"{"env": {"B": "2", "A": "1"}}"#).unwrap();
        let env = holder.env.unwrap();
        assert_eq!(env[0], EnvVar::new("A", "1"));
        assert_eq!(env[1], EnvVar::new("B", "2"));
    }

    #[test]
    fn absent_is_none() {
        let holder: Holder = serde_json::from_str(r#"{}"#).unwrap();
        assert!(holder.env.is_none());
    }
}
