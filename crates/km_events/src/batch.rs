use base64::Engine as _;
use serde::{Deserialize, Serialize};
use time::{format_description::FormatItem, macros::format_description, OffsetDateTime};

use crate::message::{CorrelationId, Direction, ObservedMessage};

/// RFC3339 with fixed nanosecond precision, the backend's event timestamp
/// format.
const TIMESTAMP_FORMAT: &[FormatItem<'static>] = format_description!(
    "[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond digits:9]Z"
);

pub(crate) fn format_timestamp(wall: OffsetDateTime) -> String {
    wall.to_offset(time::UtcOffset::UTC)
        .format(TIMESTAMP_FORMAT)
        .unwrap_or_else(|_| wall.unix_timestamp().to_string())
}

/// One observed message encoded for egress.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EgressEvent {
    pub id: String,
    pub timestamp: String,
    pub direction: Direction,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    /// Base64 of the exact payload bytes.
    pub payload: String,
    pub size: usize,
    pub correlation_id: CorrelationId,
}

impl EgressEvent {
    pub fn from_observed(msg: &ObservedMessage) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp: format_timestamp(msg.wall),
            direction: msg.direction,
            method: msg.method.clone(),
            payload: base64::engine::general_purpose::STANDARD.encode(&msg.bytes),
            size: msg.bytes.len(),
            correlation_id: msg.correlation_id.clone(),
        }
    }
}

/// A unit of egress: an ordered run of events published exactly once
/// (success or retry exhaustion).
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventBatch {
    pub events: Vec<EgressEvent>,
    pub batch_id: String,
    pub correlation_id: CorrelationId,
    pub cli_version: String,
    pub batch_timestamp: String,
}

impl EventBatch {
    pub fn new(
        events: Vec<EgressEvent>,
        correlation_id: CorrelationId,
        cli_version: String,
    ) -> Self {
        Self {
            events,
            batch_id: generate_batch_id(),
            correlation_id,
            cli_version,
            batch_timestamp: format_timestamp(OffsetDateTime::now_utc()),
        }
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

fn generate_batch_id() -> String {
    hex::encode(rand::random::<[u8; 8]>())
}
