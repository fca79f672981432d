//! Events: the logical operations carried by record bodies.

use std::fmt;
use std::str::FromStr;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Stable primary key of one collection instance: a UUIDv4.
///
/// The textual form (hyphenated, as stored in the instance's `_id` field)
/// and the opaque 16-byte form convert losslessly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstanceId(Uuid);

impl InstanceId {
    /// Generate a fresh random id.
    pub fn new_random() -> Self {
        InstanceId(Uuid::new_v4())
    }

    /// The opaque 16-byte form.
    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }

    /// Build from the opaque 16-byte form.
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        InstanceId(Uuid::from_bytes(bytes))
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

impl FromStr for InstanceId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(InstanceId(Uuid::parse_str(s)?))
    }
}

/// The kind of operation an event applies to an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    /// A new instance was created.
    Create,
    /// An existing instance was replaced.
    Save,
    /// An instance was removed.
    Delete,
}

impl EventKind {
    /// Stable textual tag, used in durable dispatcher keys.
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Create => "create",
            EventKind::Save => "save",
            EventKind::Delete => "delete",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One logical action on one collection instance.
///
/// Events inside a single record share one timestamp (the commit point) and
/// apply as an atomic batch; across records in one log, timestamps are
/// monotonically non-decreasing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    /// Target collection.
    pub collection: String,
    /// Target instance.
    pub instance: InstanceId,
    /// Operation kind.
    pub kind: EventKind,
    /// Commit timestamp, monotonic nanoseconds.
    pub time: u64,
    /// Full JSON instance bytes after the action; empty for deletes.
    pub patch: Bytes,
}

impl Event {
    /// The full JSON bytes for create/save events, `None` for deletes.
    pub fn body(&self) -> Option<&Bytes> {
        match self.kind {
            EventKind::Delete => None,
            _ => Some(&self.patch),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instance_id_text_round_trip() {
        let id = InstanceId::new_random();
        let parsed: InstanceId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn event_postcard_round_trip() {
        let event = Event {
            collection: "books".into(),
            instance: InstanceId::new_random(),
            kind: EventKind::Save,
            time: 42,
            patch: Bytes::from_static(b"{\"_id\":\"x\"}"),
        };
        let bytes = postcard::to_stdvec(&event).unwrap();
        let back: Event = postcard::from_bytes(&bytes).unwrap();
        assert_eq!(event, back);
    }

    #[test]
    fn delete_has_no_body() {
        let event = Event {
            collection: "books".into(),
            instance: InstanceId::new_random(),
            kind: EventKind::Delete,
            time: 1,
            patch: Bytes::new(),
        };
        assert!(event.body().is_none());
    }
}
