//! Stage metadata namespace
//!
//! Each pipeline stage reports a nested key/value namespace (a JSON object).
//! Keys are addressed with dotted paths, e.g. `apPipe:ccdProcessor:isr.runEndCpuTime`
//! refers to `{"apPipe:ccdProcessor:isr": {"runEndCpuTime": ...}}`.
//!
//! Colons are part of task names, only dots separate levels.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{Error, Result};

/// Nested metadata produced by one or more stages
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StageMetadata {
    root: Map<String, Value>,
}

impl StageMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap a JSON value; anything but an object is rejected
    pub fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Object(root) => Ok(Self { root }),
            Value::Null => Ok(Self::new()),
            other => Err(Error::InvalidInput(format!(
                "Stage metadata must be a JSON object, got {}",
                type_name(&other)
            ))),
        }
    }

    /// Parse stage output; blank output means "no metadata"
    pub fn from_json_str(json: &str) -> Result<Self> {
        if json.trim().is_empty() {
            return Ok(Self::new());
        }
        Self::from_value(serde_json::from_str(json)?)
    }

    pub fn is_empty(&self) -> bool {
        self.root.is_empty()
    }

    /// Dotted paths of every leaf, depth first in key order
    pub fn names(&self) -> Vec<String> {
        let mut names = Vec::new();
        collect_names(&self.root, "", &mut names);
        names
    }

    /// Dotted paths of top-level keys only
    pub fn top_level_names(&self) -> Vec<String> {
        self.root.keys().cloned().collect()
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        let mut parts = key.split('.');
        let first = parts.next()?;
        let mut current = self.root.get(first)?;
        for part in parts {
            current = current.as_object()?.get(part)?;
        }
        Some(current)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Leaf value rendered as a string; strings are returned unquoted
    pub fn get_as_string(&self, key: &str) -> Result<String> {
        match self.require(key)? {
            Value::String(s) => Ok(s.clone()),
            Value::Number(n) => Ok(n.to_string()),
            Value::Bool(b) => Ok(b.to_string()),
            other => Err(Error::InvalidInput(format!(
                "Metadata key {} is a {}, not a string",
                key,
                type_name(other)
            ))),
        }
    }

    /// Leaf value as a float; numeric strings are accepted
    pub fn get_as_f64(&self, key: &str) -> Result<f64> {
        let value = self.require(key)?;
        let parsed = match value {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.trim().parse::<f64>().ok(),
            _ => None,
        };
        parsed.ok_or_else(|| {
            Error::InvalidInput(format!("Metadata key {} is not numeric: {}", key, value))
        })
    }

    /// Leaf value as an integer; integral floats are accepted
    pub fn get_as_i64(&self, key: &str) -> Result<i64> {
        let value = self.require(key)?;
        let parsed = match value {
            Value::Number(n) => n
                .as_i64()
                .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64)),
            Value::String(s) => s.trim().parse::<i64>().ok(),
            _ => None,
        };
        parsed.ok_or_else(|| {
            Error::InvalidInput(format!("Metadata key {} is not an integer: {}", key, value))
        })
    }

    /// Set a leaf, creating intermediate objects; non-object intermediates are replaced
    pub fn set(&mut self, key: &str, value: impl Into<Value>) {
        let mut parts: Vec<&str> = key.split('.').collect();
        let leaf = parts.pop().unwrap_or(key);

        let mut current = &mut self.root;
        for part in parts {
            let entry = current
                .entry(part.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            if !entry.is_object() {
                *entry = Value::Object(Map::new());
            }
            current = match entry {
                Value::Object(map) => map,
                _ => unreachable!("entry was just made an object"),
            };
        }
        current.insert(leaf.to_string(), value.into());
    }

    /// Recursively merge `other` into `self`; leaves from `other` win
    pub fn combine(&mut self, other: &StageMetadata) {
        merge_objects(&mut self.root, &other.root);
    }

    fn require(&self, key: &str) -> Result<&Value> {
        self.get(key)
            .ok_or_else(|| Error::InvalidInput(format!("Metadata key not found: {}", key)))
    }
}

fn collect_names(map: &Map<String, Value>, prefix: &str, out: &mut Vec<String>) {
    for (key, value) in map {
        let path = if prefix.is_empty() {
            key.clone()
        } else {
            format!("{}.{}", prefix, key)
        };
        match value {
            Value::Object(child) if !child.is_empty() => collect_names(child, &path, out),
            _ => out.push(path),
        }
    }
}

fn merge_objects(target: &mut Map<String, Value>, source: &Map<String, Value>) {
    for (key, value) in source {
        match (target.get_mut(key), value) {
            (Some(Value::Object(existing)), Value::Object(incoming)) => {
                merge_objects(existing, incoming)
            }
            _ => {
                target.insert(key.clone(), value.clone());
            }
        }
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
