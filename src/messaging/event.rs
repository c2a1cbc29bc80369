use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt::{Display, Formatter};
use std::str::FromStr;
use uuid::Uuid;

/// Event types flowing through the dispatcher
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum EventType {
    // Capture events
    MotionStart,
    FlushEnd,
    RecordingChange,

    // Artifact events
    CombineEnd,
    UploadEnd,

    // Configuration events
    FileChange,

    // Telemetry and relay events
    HealthEnd,
    RecordEnd,

    // Operator-defined event
    Custom(String),
}

impl EventType {
    /// Every built-in event type, in the order handlers are registered for them
    pub const BUILT_IN: [EventType; 8] = [
        EventType::MotionStart,
        EventType::FlushEnd,
        EventType::RecordingChange,
        EventType::CombineEnd,
        EventType::UploadEnd,
        EventType::FileChange,
        EventType::HealthEnd,
        EventType::RecordEnd,
    ];

    pub fn name(&self) -> &str {
        match self {
            Self::MotionStart => "motion_start",
            Self::FlushEnd => "flush_end",
            Self::RecordingChange => "recording_change",
            Self::CombineEnd => "combine_end",
            Self::UploadEnd => "upload_end",
            Self::FileChange => "file_change",
            Self::HealthEnd => "health_end",
            Self::RecordEnd => "record_end",
            Self::Custom(name) => name,
        }
    }
}

impl Display for EventType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl FromStr for EventType {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(EventType::BUILT_IN
            .iter()
            .find(|known| known.name() == s)
            .cloned()
            .unwrap_or_else(|| EventType::Custom(s.to_string())))
    }
}

/// Event message structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventMessage {
    /// Unique event ID
    pub id: Uuid,
    /// Event type
    pub event_type: EventType,
    /// Event timestamp, whole seconds since the epoch
    pub timestamp: i64,
    /// Event data payload
    pub payload: Map<String, Value>,
}

impl EventMessage {
    /// Create a new event message stamped with the current time
    pub fn new(event_type: EventType, payload: Value) -> Self {
        Self::at(event_type, chrono::Utc::now().timestamp(), payload)
    }

    /// Create a new event message with an explicit timestamp
    pub fn at(event_type: EventType, timestamp: i64, payload: Value) -> Self {
        let payload = match payload {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => {
                let mut map = Map::new();
                map.insert("value".to_string(), other);
                map
            }
        };
        Self {
            id: Uuid::new_v4(),
            event_type,
            timestamp,
            payload,
        }
    }

    /// Look up a payload field
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.payload.get(key)
    }

    /// Flattened form: payload fields plus `name` and `timestamp`
    pub fn to_json(&self) -> Value {
        let mut flat = self.payload.clone();
        flat.insert("name".to_string(), Value::from(self.event_type.name()));
        flat.insert("timestamp".to_string(), Value::from(self.timestamp));
        Value::Object(flat)
    }
}
