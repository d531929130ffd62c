//! The state record threaded through every step
//!
//! A `StateRecord` is owned by exactly one party at a time: the executor
//! between steps, a step while it runs, and the checkpoint store while a
//! traversal is suspended. Steps receive the record by value and hand it back.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use std::collections::BTreeMap;

/// Ordered, append-only log of step events
///
/// Entries cannot be removed or reordered through this type. The executor
/// marks the trace before every step and checks the mark afterwards.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Trace(Vec<String>);

impl Trace {
    /// Create an empty trace
    pub fn new() -> Self {
        Self(Vec::new())
    }

    /// Append one event
    pub fn record(&mut self, event: impl Into<String>) {
        self.0.push(event.into());
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn last(&self) -> Option<&str> {
        self.0.last().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    pub fn entries(&self) -> &[String] {
        &self.0
    }

    /// Snapshot the length and last entry
    pub fn mark(&self) -> TraceMark {
        TraceMark {
            len: self.0.len(),
            last: self.0.last().cloned(),
        }
    }

    /// Whether the entry marked last is still at its marked position
    ///
    /// Catches truncation and a replaced tail in constant time. In-place edits
    /// of older entries are impossible through this type.
    pub fn extends(&self, mark: &TraceMark) -> bool {
        match mark.len.checked_sub(1) {
            None => true,
            Some(index) => self.0.get(index) == mark.last.as_ref(),
        }
    }
}

/// Position of a trace taken by `Trace::mark`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceMark {
    len: usize,
    last: Option<String>,
}

impl TraceMark {
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl<S: Into<String>> FromIterator<S> for Trace {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self(iter.into_iter().map(Into::into).collect())
    }
}

/// The unit of work flowing through the graph
///
/// The engine reads `checkpoint_id` and `status` only. Everything else is
/// opaque to it and interpreted by steps and routers.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StateRecord {
    /// Original submitted document
    #[serde(default)]
    pub payload: Map<String, JsonValue>,

    /// Intermediate results keyed by logical category
    #[serde(default)]
    pub derived: BTreeMap<String, Map<String, JsonValue>>,

    /// Evaluation score (interpretation is step-specific)
    #[serde(default, with = "score_format")]
    pub score: f64,

    /// Short classification produced by an evaluation step
    #[serde(default)]
    pub decision: String,

    /// Present only while suspended
    #[serde(default)]
    pub checkpoint_id: Option<String>,

    /// Lifecycle label
    #[serde(default)]
    pub status: String,

    /// One entry per step execution
    #[serde(default)]
    pub trace: Trace,
}

impl StateRecord {
    /// Create a fresh record around a submitted payload
    pub fn new(payload: Map<String, JsonValue>) -> Self {
        Self {
            payload,
            status: "NEW".to_string(),
            ..Default::default()
        }
    }

    /// Create a record from a JSON value; non-object values yield an empty payload
    pub fn from_payload(payload: JsonValue) -> Self {
        match payload {
            JsonValue::Object(map) => Self::new(map),
            _ => Self::new(Map::new()),
        }
    }

    /// Whether the record is currently suspended awaiting external action
    pub fn is_suspended(&self) -> bool {
        self.checkpoint_id.as_deref().is_some_and(|id| !id.is_empty())
    }

    /// Mark the record as suspended under `checkpoint_id`
    pub fn suspend(&mut self, checkpoint_id: impl Into<String>, status: impl Into<String>) {
        self.checkpoint_id = Some(checkpoint_id.into());
        self.status = status.into();
    }

    /// Get a derived category, if a step produced it
    pub fn derived(&self, category: &str) -> Option<&Map<String, JsonValue>> {
        self.derived.get(category)
    }

    /// Get or create a derived category for writing
    pub fn derived_mut(&mut self, category: &str) -> &mut Map<String, JsonValue> {
        self.derived.entry(category.to_string()).or_default()
    }

    /// Shallow-merge `updates` into the payload
    pub fn merge_payload(&mut self, updates: &JsonValue) {
        if let Some(updates) = updates.as_object() {
            for (key, value) in updates {
                self.payload.insert(key.clone(), value.clone());
            }
        }
    }
}

/// Lossless encoding for `score`
///
/// JSON has no representation for NaN or infinity, so those are written as
/// the strings `"NaN"`, `"inf"` and `"-inf"`. Finite values stay numbers.
mod score_format {
    use serde::de::{self, Unexpected, Visitor};
    use serde::{Deserializer, Serializer};
    use std::fmt;

    pub fn serialize<S: Serializer>(score: &f64, serializer: S) -> Result<S::Ok, S::Error> {
        if score.is_finite() {
            serializer.serialize_f64(*score)
        } else if score.is_nan() {
            serializer.serialize_str("NaN")
        } else if score.is_sign_positive() {
            serializer.serialize_str("inf")
        } else {
            serializer.serialize_str("-inf")
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
        deserializer.deserialize_any(ScoreVisitor)
    }

    struct ScoreVisitor;

    impl<'de> Visitor<'de> for ScoreVisitor {
        type Value = f64;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            formatter.write_str("a number or one of \"NaN\", \"inf\", \"-inf\"")
        }

        fn visit_f64<E: de::Error>(self, value: f64) -> Result<f64, E> {
            Ok(value)
        }

        fn visit_i64<E: de::Error>(self, value: i64) -> Result<f64, E> {
            Ok(value as f64)
        }

        fn visit_u64<E: de::Error>(self, value: u64) -> Result<f64, E> {
            Ok(value as f64)
        }

        fn visit_str<E: de::Error>(self, value: &str) -> Result<f64, E> {
            match value {
                "NaN" => Ok(f64::NAN),
                "inf" => Ok(f64::INFINITY),
                "-inf" => Ok(f64::NEG_INFINITY),
                other => Err(E::invalid_value(Unexpected::Str(other), &self)),
            }
        }
    }
}
