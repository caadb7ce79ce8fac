//! The wiretap engine: child supervision, transparent stdio proxying,
//! JSON-RPC framing/classification, and non-blocking observation fan-out.
//!
//! Invariants this crate is built around:
//! - Bytes cross the proxy unaltered and in order, per direction.
//! - Observers live off the data path: a slow or dead observer costs
//!   observations (counted), never forwarding latency.
//! - The child is spawned once, reaped once, and shutdown is bounded.

mod child;
mod error;
mod fanout;
mod framer;
mod proxy;
mod session;

pub use child::{ChildProcess, ChildSpec, SignalKind};
pub use error::MonitorError;
pub use fanout::{FanOut, ObservationStream, DEFAULT_MAILBOX};
pub use framer::Framer;
pub use proxy::{pump, pump_stderr, RawChunk, TeeSender, CHUNK_SIZE};
pub use session::{MonitorConfig, MonitorSession};
