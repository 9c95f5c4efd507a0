//! Event model

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

use crate::error::{CoreError, Result};

/// The closed set of event kinds the runtime dispatches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    Tick,
    Bar,
    Order,
    Trade,
    Position,
    Signal,
    Risk,
    Log,
    Error,
    Start,
    Stop,
    Heartbeat,
}

impl EventType {
    pub const ALL: [EventType; 12] = [
        EventType::Tick,
        EventType::Bar,
        EventType::Order,
        EventType::Trade,
        EventType::Position,
        EventType::Signal,
        EventType::Risk,
        EventType::Log,
        EventType::Error,
        EventType::Start,
        EventType::Stop,
        EventType::Heartbeat,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            EventType::Tick => "TICK",
            EventType::Bar => "BAR",
            EventType::Order => "ORDER",
            EventType::Trade => "TRADE",
            EventType::Position => "POSITION",
            EventType::Signal => "SIGNAL",
            EventType::Risk => "RISK",
            EventType::Log => "LOG",
            EventType::Error => "ERROR",
            EventType::Start => "START",
            EventType::Stop => "STOP",
            EventType::Heartbeat => "HEARTBEAT",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventType {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        EventType::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| CoreError::UnknownEventType(s.to_string()))
    }
}

/// Immutable record of something that happened.
///
/// Middleware that wants to alter an event builds a new one with
/// [`Event::with_payload`] or [`Event::with_source`] and forwards that.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    event_type: EventType,
    timestamp: DateTime<Utc>,
    payload: Value,
    source: Option<String>,
}

impl Event {
    pub fn new(event_type: EventType, payload: Value) -> Self {
        Self {
            event_type,
            timestamp: Utc::now(),
            payload,
            source: None,
        }
    }

    /// Builds an event from a textual kind such as `"BAR"`.
    pub fn from_kind(kind: &str, payload: Value) -> Result<Self> {
        Ok(Self::new(kind.parse()?, payload))
    }

    #[must_use]
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    #[must_use]
    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    #[must_use]
    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn event_type(&self) -> EventType {
        self.event_type
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn payload(&self) -> &Value {
        &self.payload
    }

    pub fn source(&self) -> Option<&str> {
        self.source.as_deref()
    }

    pub fn is_error(&self) -> bool {
        self.event_type == EventType::Error
    }
}

/// Where inside a dispatch pass a fault was caught.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DispatchStage {
    Middleware,
    Handler,
}

impl fmt::Display for DispatchStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DispatchStage::Middleware => f.write_str("middleware"),
            DispatchStage::Handler => f.write_str("handler"),
        }
    }
}

/// Payload of the ERROR events the engine synthesizes for caught faults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub stage: DispatchStage,
    pub target: String,
    pub error_type: String,
    pub error_message: String,
}

impl ErrorPayload {
    pub fn into_event(self, source: &str) -> Event {
        let payload = serde_json::to_value(&self).unwrap_or(Value::Null);
        Event::new(EventType::Error, payload).with_source(source)
    }

    /// Decodes an engine-generated ERROR event. Returns `None` for other
    /// events or ERROR events with a caller-defined payload.
    pub fn from_event(event: &Event) -> Option<Self> {
        if !event.is_error() {
            return None;
        }
        serde_json::from_value(event.payload().clone()).ok()
    }
}
