//! Delivered event model and accepted-type allowlists.

use std::collections::BTreeSet;

use serde::de::DeserializeOwned;
use serde_json::Value;

/// Event delivered to subscribers.
#[derive(Clone, Debug, PartialEq)]
pub struct StreamEvent {
    /// Server-declared event name.
    pub event_type: String,
    /// Decoded payload.
    pub data: EventData,
}

impl StreamEvent {
    /// Builds an event from a raw wire payload.
    pub fn new(event_type: impl Into<String>, raw: &str) -> Self {
        Self {
            event_type: event_type.into(),
            data: EventData::from_raw(raw),
        }
    }
}

/// Event payload, JSON-decoded when the raw text parses.
///
/// Payloads that are not valid JSON degrade to the raw string instead of
/// failing delivery.
#[derive(Clone, Debug, PartialEq)]
pub enum EventData {
    Json(Value),
    Text(String),
}

impl EventData {
    /// Parses a raw payload, falling back to the untouched text.
    pub fn from_raw(raw: &str) -> Self {
        match serde_json::from_str::<Value>(raw) {
            Ok(value) => Self::Json(value),
            Err(_) => Self::Text(raw.to_string()),
        }
    }

    /// Returns the JSON value when the payload parsed as JSON.
    pub fn as_json(&self) -> Option<&Value> {
        match self {
            Self::Json(value) => Some(value),
            Self::Text(_) => None,
        }
    }

    /// Returns the raw text when the payload did not parse as JSON.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Json(_) => None,
            Self::Text(text) => Some(text),
        }
    }

    /// Deserializes the payload into a concrete type.
    ///
    /// Text payloads deserialize as JSON strings, so `decode::<String>()`
    /// works for both shapes.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        match self {
            Self::Json(value) => serde_json::from_value(value.clone()),
            Self::Text(text) => serde_json::from_value(Value::String(text.clone())),
        }
    }
}

/// Allowlist of event names a stream listens for.
///
/// The `opened` sentinel is always included: every stream observes the
/// server's connection-established event regardless of its vocabulary. Each
/// logical stream flavor is a value of this type handed to the client at
/// construction.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct EventTypes {
    names: BTreeSet<String>,
}

impl EventTypes {
    /// Sentinel event name the server emits once the connection is up.
    pub const OPENED: &'static str = "opened";

    /// Builds an allowlist from the given names plus the sentinel.
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut names: BTreeSet<String> = names.into_iter().map(Into::into).collect();
        names.insert(Self::OPENED.to_string());
        Self { names }
    }

    /// Minimal vocabulary: only the connection sentinel.
    pub fn opened_only() -> Self {
        Self::new(std::iter::empty::<String>())
    }

    /// Whether frames with this event name are delivered.
    pub fn accepts(&self, event_type: &str) -> bool {
        self.names.contains(event_type)
    }

    /// Iterates the accepted names in sorted order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.names.iter().map(String::as_str)
    }
}

impl Default for EventTypes {
    fn default() -> Self {
        Self::opened_only()
    }
}
