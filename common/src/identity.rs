//! Device identity claims.
//!
//! An identity is an ordered string-to-string map. Keys starting with
//! `@` are administrative metadata filled in by the enforcer
//! (`@switch`, `@port`, `@mac`, `@ip`); keys starting with `$` are
//! monotonic claims compared lexicographically by the decider.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Keys every identity must carry.
pub const REQUIRED_KEYS: [&str; 3] = ["@switch", "@port", "@mac"];

/// Keys whose values end up in filesystem paths and therefore must
/// not contain path elements.
const PATH_KEYS: [&str; 5] = ["@switch", "@port", "@mac", "@ip", "$version"];

/// Identity normalization errors
#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("identity is not a JSON object")]
    NotAnObject,
    #[error("{0}: must not contain path elements")]
    UnsafeValue(String),
    #[error("{0}: required key not found")]
    MissingKey(String),
}

/// A normalized device identity.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Identity(BTreeMap<String, String>);

impl Identity {
    /// Create an empty identity.
    pub fn new() -> Self {
        Self::default()
    }

    /// Normalize a raw JSON value into an identity.
    ///
    /// The value must be an object. Every member is coerced to a
    /// string (non-strings through their canonical JSON rendering).
    /// Path-sensitive keys are rejected if they contain `/` or `..`
    /// and are lowercased.
    pub fn from_value(value: &Value) -> Result<Self, IdentityError> {
        let obj = value.as_object().ok_or(IdentityError::NotAnObject)?;

        let mut id = Identity::new();
        for (key, raw) in obj {
            let mut val = match raw {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };

            if PATH_KEYS.contains(&key.as_str()) {
                if val.contains('/') || val.contains("..") {
                    return Err(IdentityError::UnsafeValue(key.clone()));
                }
                val = val.to_lowercase();
            }

            id.0.insert(key.clone(), val);
        }

        Ok(id)
    }

    /// Verify the required administrative keys are present.
    pub fn check_required(&self) -> Result<(), IdentityError> {
        for key in REQUIRED_KEYS {
            if !self.0.contains_key(key) {
                return Err(IdentityError::MissingKey(key.to_string()));
            }
        }
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn set(&mut self, key: &str, value: impl Into<String>) {
        self.0.insert(key.to_string(), value.into());
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.0.remove(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    /// Iterate entries in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Non-`@` claim keys, i.e. everything device-supplied.
    pub fn claim_keys(&self) -> impl Iterator<Item = &str> {
        self.0
            .keys()
            .filter(|k| !k.starts_with('@'))
            .map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Pretty-printed, newline-terminated JSON for on-disk storage.
    pub fn to_json_bytes(&self) -> Vec<u8> {
        let mut out = serde_json::to_vec_pretty(self).unwrap_or_else(|_| b"{}".to_vec());
        out.push(b'\n');
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_coerces_values_to_strings() {
        let id = Identity::from_value(&json!({
            "manufacturer": "Acme",
            "model": 42,
            "beta": true,
        }))
        .unwrap();

        assert_eq!(id.get("manufacturer"), Some("Acme"));
        assert_eq!(id.get("model"), Some("42"));
        assert_eq!(id.get("beta"), Some("true"));
    }

    #[test]
    fn test_lowercases_path_keys() {
        let id = Identity::from_value(&json!({
            "@mac": "AA:BB:CC:DD:EE:FF",
            "$version": "V1.2",
            "manufacturer": "ACME",
        }))
        .unwrap();

        assert_eq!(id.get("@mac"), Some("aa:bb:cc:dd:ee:ff"));
        assert_eq!(id.get("$version"), Some("v1.2"));
        // non-path keys keep their case
        assert_eq!(id.get("manufacturer"), Some("ACME"));
    }

    #[test]
    fn test_rejects_path_elements() {
        for bad in ["../../etc", "a/b", ".."] {
            let err = Identity::from_value(&json!({ "@port": bad })).unwrap_err();
            assert!(matches!(err, IdentityError::UnsafeValue(_)), "{bad}");
        }
    }

    #[test]
    fn test_rejects_non_object() {
        assert!(Identity::from_value(&json!([1, 2])).is_err());
        assert!(Identity::from_value(&json!("str")).is_err());
    }

    #[test]
    fn test_required_keys() {
        let id = Identity::from_value(&json!({
            "@switch": "s1", "@port": "p1", "@mac": "aa:bb:cc:dd:ee:ff",
        }))
        .unwrap();
        assert!(id.check_required().is_ok());

        let id = Identity::from_value(&json!({ "@switch": "s1" })).unwrap();
        let err = id.check_required().unwrap_err();
        assert!(err.to_string().contains("@port"));
    }

    #[test]
    fn test_json_bytes_are_newline_terminated() {
        let mut id = Identity::new();
        id.set("@switch", "s1");
        let bytes = id.to_json_bytes();
        assert_eq!(bytes.last(), Some(&b'\n'));
    }

    #[test]
    fn test_claim_keys_skip_admin_metadata() {
        let id = Identity::from_value(&json!({
            "@switch": "s1", "manufacturer": "acme", "$version": "1.0",
        }))
        .unwrap();
        let claims: Vec<_> = id.claim_keys().collect();
        assert_eq!(claims, vec!["$version", "manufacturer"]);
    }
}
