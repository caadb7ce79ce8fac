use std::{fmt, str::FromStr, sync::Arc, time::Instant};

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use time::OffsetDateTime;

/// Which way a chunk of traffic was travelling through the wiretap.
///
/// `Inbound` is client → wrapped server, `Outbound` is server → client.
/// The legacy wire strings `request`/`response` are accepted on ingest and
/// normalized; serialization always emits `inbound`/`outbound`.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum Direction {
    Inbound,
    Outbound,
}

impl Direction {
    pub fn as_str(self) -> &'static str {
        match self {
            Direction::Inbound => "inbound",
            Direction::Outbound => "outbound",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown direction `{0}`")]
pub struct ParseDirectionError(String);

impl FromStr for Direction {
    type Err = ParseDirectionError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.to_ascii_lowercase().as_str() {
            "inbound" | "request" => Ok(Direction::Inbound),
            "outbound" | "response" => Ok(Direction::Outbound),
            _ => Err(ParseDirectionError(raw.to_string())),
        }
    }
}

impl Serialize for Direction {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Direction {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// JSON-RPC shape of an observed message.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Classification {
    Request,
    Response,
    Notification,
    ErrorReply,
    /// The chunk could not be parsed as a single JSON-RPC message.
    Unframed,
}

/// Session-scoped identifier stamped on every egress event so the backend
/// can stitch one wrapper invocation back together.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(Arc<str>);

impl CorrelationId {
    /// Generates a fresh session-unique id.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string().into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CorrelationId {
    fn from(raw: &str) -> Self {
        Self(raw.into())
    }
}

/// One framed unit of traffic as seen on the wire, plus its classification.
///
/// The payload bytes are exactly what crossed the pipe (surrounding
/// whitespace trimmed to one framed unit) and are immutable once published;
/// clones share the underlying allocation.
#[derive(Clone, Debug)]
pub struct ObservedMessage {
    pub bytes: Arc<[u8]>,
    pub direction: Direction,
    /// Monotonic capture instant, for ordering within the process.
    pub monotonic: Instant,
    /// Wall-clock capture time, for egress timestamps.
    pub wall: OffsetDateTime,
    pub classification: Classification,
    /// JSON-RPC method, for requests and notifications.
    pub method: Option<String>,
    /// The raw `id` token as JSON text; absent for notifications/unframed.
    pub request_id: Option<String>,
    pub correlation_id: CorrelationId,
}

impl ObservedMessage {
    /// Builds an unclassified message around raw bytes; the framer fills in
    /// classification details.
    pub fn unframed(
        bytes: impl Into<Arc<[u8]>>,
        direction: Direction,
        correlation_id: CorrelationId,
    ) -> Self {
        Self {
            bytes: bytes.into(),
            direction,
            monotonic: Instant::now(),
            wall: OffsetDateTime::now_utc(),
            classification: Classification::Unframed,
            method: None,
            request_id: None,
            correlation_id,
        }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn direction_parses_legacy_strings() {
        assert_eq!("request".parse::<Direction>().unwrap(), Direction::Inbound);
        assert_eq!(
            "response".parse::<Direction>().unwrap(),
            Direction::Outbound
        );
        assert_eq!("Inbound".parse::<Direction>().unwrap(), Direction::Inbound);
        assert!("sideways".parse::<Direction>().is_err());
    }

    #[test]
    fn direction_serializes_normalized() {
        let json = serde_json::to_string(&Direction::Inbound).unwrap();
        assert_eq!(json, "\"inbound\"");
        let parsed: Direction = serde_json::from_str("\"response\"").unwrap();
        assert_eq!(parsed, Direction::Outbound);
    }

    #[test]
    fn correlation_ids_are_unique() {
        assert_ne!(
            CorrelationId::generate().as_str(),
            CorrelationId::generate().as_str()
        );
    }
}
