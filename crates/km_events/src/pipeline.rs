use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use tokio::{
    sync::mpsc,
    task::JoinHandle,
    time::{self, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    batch::{EgressEvent, EventBatch},
    message::{CorrelationId, ObservedMessage},
};

/// Destination for assembled batches. The HTTP implementation lives in
/// [`crate::sink::HttpBatchSink`]; tests substitute recording sinks.
#[async_trait]
pub trait BatchSink: Send + Sync {
    async fn publish(&self, batch: &EventBatch) -> Result<(), km_api::ApiError>;
}

/// Knobs for the egress pipeline; mirrors the batching fields of
/// `ResolvedConfig`.
#[derive(Clone, Debug)]
pub struct BatchConfig {
    pub batch_size: usize,
    pub flush_interval: Duration,
    /// Best-effort deadline for the final flush on shutdown.
    pub drain_deadline: Duration,
    pub debug: bool,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            flush_interval: Duration::from_secs(5),
            drain_deadline: Duration::from_secs(5),
            debug: false,
        }
    }
}

impl BatchConfig {
    /// Buffered events beyond this trip oldest-drop.
    fn high_water(&self) -> usize {
        self.batch_size.saturating_mul(10)
    }
}

/// Counters surfaced in debug diagnostics.
#[derive(Debug, Default)]
pub struct PipelineStats {
    pub submitted: AtomicU64,
    pub published_batches: AtomicU64,
    pub published_events: AtomicU64,
    pub dropped_events: AtomicU64,
    pub dropped_batches: AtomicU64,
}

impl PipelineStats {
    pub fn summary(&self) -> String {
        format!(
            "submitted={} published_batches={} published_events={} dropped_events={} dropped_batches={}",
            self.submitted.load(Ordering::Relaxed),
            self.published_batches.load(Ordering::Relaxed),
            self.published_events.load(Ordering::Relaxed),
            self.dropped_events.load(Ordering::Relaxed),
            self.dropped_batches.load(Ordering::Relaxed),
        )
    }
}

/// Cheap handle for feeding the pipeline from the fan-out.
#[derive(Clone)]
pub struct PipelineHandle {
    intake: mpsc::Sender<ObservedMessage>,
    stats: Arc<PipelineStats>,
}

impl PipelineHandle {
    /// Non-blocking submit. A saturated intake drops the message and counts
    /// it; the data path is never back-pressured from here.
    pub fn submit(&self, msg: ObservedMessage) {
        self.stats.submitted.fetch_add(1, Ordering::Relaxed);
        if self.intake.try_send(msg).is_err() {
            self.stats.dropped_events.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn stats(&self) -> &PipelineStats {
        &self.stats
    }
}

/// Size-and-time batching egress pipeline.
///
/// A serializer task owns the buffer and flushes on either `batch_size`
/// buffered events or `flush_interval` elapsed; a publisher task posts the
/// batches serially so a retrying batch delays later batches at the
/// publisher, never at the serializer. Beyond ten batches' worth of
/// buffered events the oldest are dropped.
pub struct BatchPipeline {
    handle: PipelineHandle,
    tasks: Vec<JoinHandle<()>>,
}

impl BatchPipeline {
    pub fn spawn(
        config: BatchConfig,
        sink: Arc<dyn BatchSink>,
        correlation_id: CorrelationId,
        cli_version: String,
        cancel: CancellationToken,
    ) -> Self {
        let stats = Arc::new(PipelineStats::default());
        let (intake_tx, intake_rx) = mpsc::channel(config.high_water().max(64));
        let (batch_tx, batch_rx) = mpsc::channel(4);

        let serializer = tokio::spawn(serializer_task(
            config.clone(),
            intake_rx,
            batch_tx,
            correlation_id,
            cli_version,
            Arc::clone(&stats),
            cancel,
        ));
        let publisher = tokio::spawn(publisher_task(
            config,
            batch_rx,
            sink,
            Arc::clone(&stats),
        ));

        Self {
            handle: PipelineHandle {
                intake: intake_tx,
                stats,
            },
            tasks: vec![serializer, publisher],
        }
    }

    pub fn handle(&self) -> PipelineHandle {
        self.handle.clone()
    }

    /// Waits for the serializer's final flush and the publisher drain.
    /// Cancellation must already have been signalled.
    pub async fn join(self) {
        let BatchPipeline { handle, tasks } = self;
        drop(handle);
        for task in tasks {
            let _ = task.await;
        }
    }
}

async fn serializer_task(
    config: BatchConfig,
    mut intake: mpsc::Receiver<ObservedMessage>,
    batches: mpsc::Sender<EventBatch>,
    correlation_id: CorrelationId,
    cli_version: String,
    stats: Arc<PipelineStats>,
    cancel: CancellationToken,
) {
    let mut buffer: VecDeque<EgressEvent> = VecDeque::new();
    let mut ticker = time::interval(config.flush_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.reset();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            received = intake.recv() => {
                let Some(msg) = received else { break };
                buffer.push_back(EgressEvent::from_observed(&msg));
                if buffer.len() >= config.batch_size {
                    try_flush(&mut buffer, &batches, &correlation_id, &cli_version, &stats);
                    ticker.reset();
                }
                enforce_high_water(&mut buffer, &config, &stats);
            }
            _ = ticker.tick() => {
                if !buffer.is_empty() {
                    try_flush(&mut buffer, &batches, &correlation_id, &cli_version, &stats);
                }
            }
        }
    }

    // Final best-effort flush within the drain deadline. Anything the
    // publisher cannot take in time is counted as dropped.
    while let Ok(msg) = intake.try_recv() {
        buffer.push_back(EgressEvent::from_observed(&msg));
    }
    if !buffer.is_empty() {
        let events: Vec<EgressEvent> = buffer.drain(..).collect();
        let count = events.len() as u64;
        let batch = EventBatch::new(events, correlation_id, cli_version);
        let send = time::timeout(config.drain_deadline, batches.send(batch));
        if !matches!(send.await, Ok(Ok(()))) {
            stats.dropped_events.fetch_add(count, Ordering::Relaxed);
        }
    }
}

/// Moves the buffered events into one batch and hands it to the publisher.
/// A saturated publisher channel leaves the buffer in place; the high-water
/// check bounds how far it can grow while the publisher catches up.
fn try_flush(
    buffer: &mut VecDeque<EgressEvent>,
    batches: &mpsc::Sender<EventBatch>,
    correlation_id: &CorrelationId,
    cli_version: &str,
    stats: &PipelineStats,
) {
    if buffer.is_empty() {
        return;
    }
    let events: Vec<EgressEvent> = buffer.drain(..).collect();
    let batch = EventBatch::new(events, correlation_id.clone(), cli_version.to_string());
    match batches.try_send(batch) {
        Ok(()) => {}
        Err(mpsc::error::TrySendError::Full(batch)) => {
            // Put the events back, preserving order, and wait for capacity.
            for event in batch.events.into_iter().rev() {
                buffer.push_front(event);
            }
        }
        Err(mpsc::error::TrySendError::Closed(batch)) => {
            stats
                .dropped_events
                .fetch_add(batch.events.len() as u64, Ordering::Relaxed);
        }
    }
}

fn enforce_high_water(buffer: &mut VecDeque<EgressEvent>, config: &BatchConfig, stats: &PipelineStats) {
    let high_water = config.high_water();
    while buffer.len() > high_water {
        buffer.pop_front();
        stats.dropped_events.fetch_add(1, Ordering::Relaxed);
        if config.debug {
            eprintln!("[API] egress buffer over high-water mark, dropping oldest event");
        }
    }
}

async fn publisher_task(
    config: BatchConfig,
    mut batches: mpsc::Receiver<EventBatch>,
    sink: Arc<dyn BatchSink>,
    stats: Arc<PipelineStats>,
) {
    while let Some(batch) = batches.recv().await {
        let batch_id = batch.batch_id.clone();
        let count = batch.events.len();
        match sink.publish(&batch).await {
            Ok(()) => {
                stats.published_batches.fetch_add(1, Ordering::Relaxed);
                stats
                    .published_events
                    .fetch_add(count as u64, Ordering::Relaxed);
                debug!(batch_id = batch_id.as_str(), events = count, "published batch");
            }
            Err(error) => {
                stats.dropped_batches.fetch_add(1, Ordering::Relaxed);
                stats
                    .dropped_events
                    .fetch_add(count as u64, Ordering::Relaxed);
                warn!(
                    batch_id = batch_id.as_str(),
                    events = count,
                    %error,
                    "dropping batch after retry exhaustion"
                );
                if config.debug {
                    eprintln!("[API] dropped batch {batch_id} ({count} events): {error}");
                }
            }
        }
    }
}
