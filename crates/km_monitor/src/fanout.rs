use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use km_events::ObservedMessage;
use tokio::sync::broadcast;
use tracing::debug;

/// Default per-observer mailbox depth.
pub const DEFAULT_MAILBOX: usize = 1024;

/// Delivers every observed message to every registered observer without
/// ever back-pressuring the publisher.
///
/// Each subscriber owns an independent bounded mailbox; a slow observer
/// loses its oldest entries (surfaced as a per-observer drop counter) while
/// the others keep receiving at full rate.
#[derive(Clone)]
pub struct FanOut {
    tx: broadcast::Sender<ObservedMessage>,
    debug_diagnostics: bool,
}

impl FanOut {
    pub fn new(mailbox: usize, debug_diagnostics: bool) -> Self {
        let (tx, _rx) = broadcast::channel(mailbox.max(1));
        Self {
            tx,
            debug_diagnostics,
        }
    }

    /// Registers an observer. Subscribe before traffic starts; messages
    /// published earlier are not replayed.
    pub fn subscribe(&self, name: impl Into<String>) -> ObservationStream {
        ObservationStream {
            rx: self.tx.subscribe(),
            dropped: Arc::new(AtomicU64::new(0)),
            name: name.into(),
            debug_diagnostics: self.debug_diagnostics,
        }
    }

    /// Non-blocking publish; a send with no live observers is a no-op.
    pub fn publish(&self, msg: ObservedMessage) {
        let _ = self.tx.send(msg);
    }

    pub fn observer_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

/// One observer's view of the fan-out.
pub struct ObservationStream {
    rx: broadcast::Receiver<ObservedMessage>,
    dropped: Arc<AtomicU64>,
    name: String,
    debug_diagnostics: bool,
}

impl ObservationStream {
    /// Next message, absorbing overflow: a lagged mailbox adds to the drop
    /// counter and delivery continues from the oldest retained entry.
    /// `None` once the fan-out shuts down.
    pub async fn recv(&mut self) -> Option<ObservedMessage> {
        loop {
            match self.rx.recv().await {
                Ok(msg) => return Some(msg),
                Err(broadcast::error::RecvError::Lagged(count)) => {
                    self.dropped.fetch_add(count, Ordering::Relaxed);
                    debug!(observer = self.name.as_str(), count, "observer mailbox overflow");
                    if self.debug_diagnostics {
                        eprintln!(
                            "[Monitor] observer `{}` dropped {count} message(s) (mailbox full)",
                            self.name
                        );
                    }
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Shared handle to this observer's drop counter, for diagnostics.
    pub fn drop_counter(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.dropped)
    }
}
