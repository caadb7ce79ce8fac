#![forbid(unsafe_code)]
//! Shared observation model and batching egress pipeline for the `km`
//! wiretap.
//!
//! The wiretap's data path hands framed traffic to observers as
//! [`ObservedMessage`] values; this crate defines that model plus the
//! size-and-time [`BatchPipeline`] that encodes observations and ships them
//! to the backend. The pipeline never sits on the forwarding path: intake is
//! non-blocking and overload degrades to counted drops.

mod batch;
mod config;
mod message;
mod pipeline;
mod sink;

pub use batch::{EgressEvent, EventBatch};
pub use config::{expand_home, ConfigError, ResolvedConfig};
pub use message::{
    Classification, CorrelationId, Direction, ObservedMessage, ParseDirectionError,
};
pub use pipeline::{BatchConfig, BatchPipeline, BatchSink, PipelineHandle, PipelineStats};
pub use sink::HttpBatchSink;
