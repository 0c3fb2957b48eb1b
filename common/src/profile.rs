//! Traffic profiles.
//!
//! A profile is a free-form JSON object. The enforcement-relevant
//! shape is `from_device` and/or `to_device`, each optionally carrying
//! `rate` (Mbit/s), `allow` and `block` service-spec lists. Metadata
//! keys: `@timestamp` (epoch seconds of fetch), `@source` (URL it came
//! from), `@empty` (true iff synthetic).

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Profile shape errors raised while probing enforcement keys.
#[derive(Debug, Error)]
pub enum ProfileError {
    #[error("{0}: not an object")]
    NotAnObject(&'static str),
    #[error("rate: not a number: {0}")]
    BadRate(String),
    #[error("{0}: expected a string or list of strings")]
    BadRuleList(&'static str),
}

/// Which side of the device a rule set applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Traffic originated by the device (ingress on the host).
    FromDevice,
    /// Traffic towards the device (egress on the host).
    ToDevice,
}

impl Direction {
    /// The profile key carrying this side's rules.
    pub fn key(self) -> &'static str {
        match self {
            Direction::FromDevice => "from_device",
            Direction::ToDevice => "to_device",
        }
    }
}

/// A traffic profile as produced by the decider.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Profile(Map<String, Value>);

impl Profile {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap a JSON value; `None` unless it is an object.
    pub fn from_value(value: Value) -> Option<Self> {
        match value {
            Value::Object(map) => Some(Self(map)),
            _ => None,
        }
    }

    /// Stamp fetch metadata: `@timestamp` now, `@source` the URL.
    pub fn stamp(&mut self, source: &str) {
        self.0
            .insert("@timestamp".into(), Value::from(chrono::Utc::now().timestamp()));
        self.0.insert("@source".into(), Value::from(source));
    }

    /// Build the synthetic empty profile.
    pub fn empty() -> Self {
        let mut pf = Self::new();
        pf.stamp("");
        pf.0.insert("@empty".into(), Value::Bool(true));
        pf
    }

    pub fn is_marked_empty(&self) -> bool {
        self.0.get("@empty").and_then(Value::as_bool).unwrap_or(false)
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn insert(&mut self, key: &str, value: Value) {
        self.0.insert(key.to_string(), value);
    }

    /// Extract the rule set for one side of the device, if present.
    pub fn rules(&self, dir: Direction) -> Result<Option<DeviceRules>, ProfileError> {
        let Some(raw) = self.0.get(dir.key()) else {
            return Ok(None);
        };
        let obj = raw
            .as_object()
            .ok_or(ProfileError::NotAnObject(dir.key()))?;
        DeviceRules::from_object(obj).map(Some)
    }

    /// Pretty-printed, newline-terminated JSON for on-disk storage.
    pub fn to_json_bytes(&self) -> Vec<u8> {
        let mut out = serde_json::to_vec_pretty(&self.0).unwrap_or_else(|_| b"{}".to_vec());
        out.push(b'\n');
        out
    }
}

/// The enforcement-relevant rules for one traffic direction.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeviceRules {
    /// Policing rate in Mbit/s.
    pub rate: Option<f64>,
    /// Service specs always accepted; presence flips the default to drop.
    pub allow: Vec<String>,
    /// Service specs always dropped.
    pub block: Vec<String>,
}

impl DeviceRules {
    fn from_object(obj: &Map<String, Value>) -> Result<Self, ProfileError> {
        Ok(Self {
            rate: coerce_rate(obj.get("rate"))?,
            allow: coerce_specs(obj.get("allow"), "allow")?,
            block: coerce_specs(obj.get("block"), "block")?,
        })
    }
}

/// `rate` accepts a JSON number or a stringified number.
fn coerce_rate(value: Option<&Value>) -> Result<Option<f64>, ProfileError> {
    match value {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => Ok(n.as_f64()),
        Some(Value::String(s)) => s
            .trim()
            .parse::<f64>()
            .map(Some)
            .map_err(|_| ProfileError::BadRate(s.clone())),
        Some(other) => Err(ProfileError::BadRate(other.to_string())),
    }
}

/// `allow`/`block` accept a single string or a list of strings.
fn coerce_specs(value: Option<&Value>, key: &'static str) -> Result<Vec<String>, ProfileError> {
    match value {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::String(s)) => Ok(vec![s.clone()]),
        Some(Value::Array(items)) => items
            .iter()
            .map(|v| {
                v.as_str()
                    .map(str::to_string)
                    .ok_or(ProfileError::BadRuleList(key))
            })
            .collect(),
        Some(_) => Err(ProfileError::BadRuleList(key)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn profile(v: Value) -> Profile {
        Profile::from_value(v).unwrap()
    }

    #[test]
    fn test_rate_coercion() {
        let pf = profile(json!({ "from_device": { "rate": 10 } }));
        let rules = pf.rules(Direction::FromDevice).unwrap().unwrap();
        assert_eq!(rules.rate, Some(10.0));

        let pf = profile(json!({ "from_device": { "rate": "2.5" } }));
        let rules = pf.rules(Direction::FromDevice).unwrap().unwrap();
        assert_eq!(rules.rate, Some(2.5));

        let pf = profile(json!({ "from_device": { "rate": "fast" } }));
        assert!(pf.rules(Direction::FromDevice).is_err());
    }

    #[test]
    fn test_specs_string_or_list() {
        let pf = profile(json!({ "to_device": { "allow": "tcp" } }));
        let rules = pf.rules(Direction::ToDevice).unwrap().unwrap();
        assert_eq!(rules.allow, vec!["tcp"]);

        let pf = profile(json!({ "to_device": { "block": ["udp", "dst 10.0.0.0/8 tcp"] } }));
        let rules = pf.rules(Direction::ToDevice).unwrap().unwrap();
        assert_eq!(rules.block.len(), 2);

        let pf = profile(json!({ "to_device": { "allow": [1, 2] } }));
        assert!(pf.rules(Direction::ToDevice).is_err());
    }

    #[test]
    fn test_missing_direction_is_none() {
        let pf = profile(json!({ "from_device": {} }));
        assert!(pf.rules(Direction::ToDevice).unwrap().is_none());
        assert!(pf.rules(Direction::FromDevice).unwrap().is_some());
    }

    #[test]
    fn test_empty_profile_metadata() {
        let pf = Profile::empty();
        assert!(pf.is_marked_empty());
        assert_eq!(pf.get("@source").and_then(Value::as_str), Some(""));
        assert!(pf.get("@timestamp").and_then(Value::as_i64).is_some());
    }

    #[test]
    fn test_stamp_sets_source_and_timestamp() {
        let mut pf = profile(json!({ "from_device": { "rate": 1 } }));
        pf.stamp("http://dev.example/profile");
        assert_eq!(
            pf.get("@source").and_then(Value::as_str),
            Some("http://dev.example/profile")
        );
        assert!(!pf.is_marked_empty());
    }
}
