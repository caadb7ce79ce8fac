use std::{sync::Arc, time::Instant};

use km_events::{Classification, CorrelationId, Direction, ObservedMessage};
use serde_json::Value;
use time::OffsetDateTime;
use tracing::debug;

/// Residual bytes beyond this are flushed as unframed rather than buffered
/// forever against a stream that never closes its braces.
const MAX_RESIDUAL: usize = 1 << 20;

/// Incremental JSON-RPC framer for one direction.
///
/// A single OS read may carry a partial message, one message, or several;
/// [`Framer::push`] therefore maps one chunk to zero or more
/// [`ObservedMessage`]s, keeping incomplete bytes in a residual buffer.
/// Messages are delimited by newlines or, when absent, by balanced-brace
/// scanning. Garbage between messages is emitted as `Unframed` and counted
/// as a sync loss; it never halts the framer.
pub struct Framer {
    direction: Direction,
    correlation_id: CorrelationId,
    residual: Vec<u8>,
    sync_losses: u64,
    version_flagged: u64,
}

impl Framer {
    pub fn new(direction: Direction, correlation_id: CorrelationId) -> Self {
        Self {
            direction,
            correlation_id,
            residual: Vec::new(),
            sync_losses: 0,
            version_flagged: 0,
        }
    }

    /// Feeds one raw chunk; returns every message completed by it.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<ObservedMessage> {
        self.residual.extend_from_slice(chunk);
        let mut messages = Vec::new();

        loop {
            let start = match self.residual.iter().position(|b| !b.is_ascii_whitespace()) {
                Some(start) => start,
                None => {
                    self.residual.clear();
                    break;
                }
            };

            if self.residual[start] == b'{' {
                match scan_balanced_object(&self.residual[start..]) {
                    Some(len) => {
                        let unit = self.residual[start..start + len].to_vec();
                        self.residual.drain(..start + len);
                        messages.push(self.classify(unit));
                    }
                    None => {
                        if self.residual.len() - start > MAX_RESIDUAL {
                            let unit = self.residual.split_off(0);
                            self.sync_losses += 1;
                            messages.push(self.emit_unframed(unit));
                            continue;
                        }
                        break;
                    }
                }
            } else {
                // Not a JSON object start: emit through the next newline as
                // one unframed unit and resynchronize after it.
                match self.residual[start..].iter().position(|&b| b == b'\n') {
                    Some(offset) => {
                        let unit = self.residual[start..start + offset].to_vec();
                        self.residual.drain(..start + offset + 1);
                        self.sync_losses += 1;
                        if !unit.is_empty() {
                            messages.push(self.emit_unframed(unit));
                        }
                    }
                    None => {
                        if self.residual.len() - start > MAX_RESIDUAL {
                            let unit = self.residual.split_off(0);
                            self.sync_losses += 1;
                            messages.push(self.emit_unframed(unit));
                            continue;
                        }
                        break;
                    }
                }
            }
        }

        messages
    }

    /// Flushes any non-empty residual as `Unframed`; called at EOF.
    pub fn finish(&mut self) -> Option<ObservedMessage> {
        let trimmed_len = self
            .residual
            .iter()
            .rposition(|b| !b.is_ascii_whitespace())
            .map(|p| p + 1)?;
        self.residual.truncate(trimmed_len);
        let unit = std::mem::take(&mut self.residual);
        let start = unit.iter().position(|b| !b.is_ascii_whitespace())?;
        Some(self.emit_unframed(unit[start..].to_vec()))
    }

    pub fn sync_losses(&self) -> u64 {
        self.sync_losses
    }

    /// Messages seen without `"jsonrpc": "2.0"`; classified best-effort but
    /// flagged.
    pub fn version_flagged(&self) -> u64 {
        self.version_flagged
    }

    fn classify(&mut self, unit: Vec<u8>) -> ObservedMessage {
        let parsed: Option<Value> = serde_json::from_slice(&unit).ok();
        let Some(value) = parsed else {
            self.sync_losses += 1;
            return self.emit_unframed(unit);
        };

        match value.get("jsonrpc").and_then(Value::as_str) {
            Some("2.0") => {}
            _ => {
                self.version_flagged += 1;
                debug!(direction = %self.direction, "message without jsonrpc 2.0 marker");
            }
        }

        let id = value.get("id").map(Value::to_string);
        let method = value
            .get("method")
            .and_then(Value::as_str)
            .map(str::to_string);

        let (classification, method, request_id) = if value.get("error").is_some() {
            (Classification::ErrorReply, None, id)
        } else if let Some(method) = method {
            if id.is_some() {
                (Classification::Request, Some(method), id)
            } else {
                (Classification::Notification, Some(method), None)
            }
        } else if value.get("result").is_some() || id.is_some() {
            (Classification::Response, None, id)
        } else {
            self.sync_losses += 1;
            (Classification::Unframed, None, None)
        };

        ObservedMessage {
            bytes: Arc::from(unit.as_slice()),
            direction: self.direction,
            monotonic: Instant::now(),
            wall: OffsetDateTime::now_utc(),
            classification,
            method,
            request_id,
            correlation_id: self.correlation_id.clone(),
        }
    }

    fn emit_unframed(&self, unit: Vec<u8>) -> ObservedMessage {
        ObservedMessage::unframed(
            Arc::<[u8]>::from(unit.as_slice()),
            self.direction,
            self.correlation_id.clone(),
        )
    }
}

/// Returns the byte length of a complete JSON object at the start of
/// `bytes`, or `None` when more input is needed. String and escape aware.
fn scan_balanced_object(bytes: &[u8]) -> Option<usize> {
    debug_assert_eq!(bytes.first(), Some(&b'{'));
    let mut depth: usize = 0;
    let mut in_string = false;
    let mut escaped = false;

    for (index, &byte) in bytes.iter().enumerate() {
        if in_string {
            if escaped {
                escaped = false;
            } else if byte == b'\\' {
                escaped = true;
            } else if byte == b'"' {
                in_string = false;
            }
            continue;
        }
        match byte {
            b'"' => in_string = true,
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(index + 1);
                }
            }
            _ => {}
        }
    }
    None
}
