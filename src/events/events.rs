use chrono::{DateTime, Utc};

/// Category of a device event, from the last segment of its type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Motion,
    Person,
    Sound,
    Chime,
    Other,
}

impl EventKind {
    /// `CameraMotion.Motion` → Motion; unknown types map to Other.
    pub fn from_event_type(event_type: &str) -> Self {
        match short_type(event_type) {
            "Motion" => EventKind::Motion,
            "Person" => EventKind::Person,
            "Sound" => EventKind::Sound,
            "Chime" => EventKind::Chime,
            _ => EventKind::Other,
        }
    }

    /// Whether events of this kind trigger a capture
    pub fn is_actionable(&self) -> bool {
        matches!(self, EventKind::Motion | EventKind::Person)
    }
}

/// Last dot-separated segment of an event type.
pub fn short_type(event_type: &str) -> &str {
    event_type.rsplit('.').next().unwrap_or(event_type)
}

/// A notification about something a device observed
#[derive(Debug, Clone, PartialEq)]
pub struct CaptureEvent {
    /// Full resource name of the device
    pub device: String,
    /// e.g. `sdm.devices.events.CameraMotion.Motion`
    pub event_type: String,
    pub kind: EventKind,
    /// Correlation id for the event image API; may be empty
    pub event_id: String,
    pub timestamp: DateTime<Utc>,
}

impl CaptureEvent {
    pub fn new(
        device: impl Into<String>,
        event_type: impl Into<String>,
        event_id: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        let event_type = event_type.into();
        Self {
            device: device.into(),
            kind: EventKind::from_event_type(&event_type),
            event_type,
            event_id: event_id.into(),
            timestamp,
        }
    }

    /// Lower-cased short type used in artifact names, e.g. `motion`.
    pub fn label(&self) -> String {
        match short_type(&self.event_type) {
            "" => "event".to_string(),
            s => s.to_lowercase(),
        }
    }

    /// Identity used to recognise redeliveries of the same event.
    pub fn dedup_key(&self) -> (DateTime<Utc>, String) {
        (self.timestamp, self.event_type.clone())
    }
}
