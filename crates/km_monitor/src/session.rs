use std::time::Duration;

use km_events::{CorrelationId, Direction};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    sync::mpsc,
    task::JoinHandle,
    time,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    child::{ChildProcess, ChildSpec, SignalKind},
    fanout::{FanOut, DEFAULT_MAILBOX},
    framer::Framer,
    proxy::{self, RawChunk, TeeSender},
    MonitorError,
};

#[derive(Clone, Debug)]
pub struct MonitorConfig {
    pub debug: bool,
    /// Depth of the pump → framer handoff, per direction.
    pub tee_capacity: usize,
    /// Per-observer fan-out mailbox depth.
    pub observer_mailbox: usize,
    /// How long the outbound pump may keep draining after child exit.
    pub exit_grace: Duration,
    /// Global bound on cooperative shutdown after cancellation.
    pub drain_deadline: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            debug: false,
            tee_capacity: 256,
            observer_mailbox: DEFAULT_MAILBOX,
            exit_grace: Duration::from_secs(5),
            drain_deadline: Duration::from_secs(10),
        }
    }
}

/// One wiretap run: spawns the wrapped server, pumps bytes both ways, and
/// feeds framed observations to whoever subscribed to [`MonitorSession::fanout`].
///
/// The proxy is invisible to both sides: bytes flow in read order with no
/// alteration, and the observation path can only ever lose messages, never
/// delay delivery.
pub struct MonitorSession {
    config: MonitorConfig,
    correlation_id: CorrelationId,
    fanout: FanOut,
}

impl MonitorSession {
    pub fn new(config: MonitorConfig, correlation_id: CorrelationId) -> Self {
        let fanout = FanOut::new(config.observer_mailbox, config.debug);
        Self {
            config,
            correlation_id,
            fanout,
        }
    }

    /// Observers subscribe here before [`MonitorSession::run`] starts traffic.
    pub fn fanout(&self) -> &FanOut {
        &self.fanout
    }

    pub fn correlation_id(&self) -> &CorrelationId {
        &self.correlation_id
    }

    /// Runs against the wrapper's real stdio; returns the child's exit code.
    pub async fn run(&self, spec: &ChildSpec, cancel: CancellationToken) -> Result<i32, MonitorError> {
        self.run_with_io(
            spec,
            tokio::io::stdin(),
            tokio::io::stdout(),
            tokio::io::stderr(),
            cancel,
        )
        .await
    }

    /// Same as [`MonitorSession::run`] with injectable client-side streams.
    pub async fn run_with_io<I, O, E>(
        &self,
        spec: &ChildSpec,
        client_in: I,
        client_out: O,
        client_err: E,
        cancel: CancellationToken,
    ) -> Result<i32, MonitorError>
    where
        I: AsyncRead + Unpin + Send + 'static,
        O: AsyncWrite + Unpin + Send + 'static,
        E: AsyncWrite + Unpin + Send + 'static,
    {
        let mut child = ChildProcess::spawn(spec).await?;
        let child_stdin = child.take_stdin().ok_or(MonitorError::StdinUnavailable)?;
        let child_stdout = child.take_stdout().ok_or(MonitorError::StdoutUnavailable)?;
        let child_stderr = child.take_stderr().ok_or(MonitorError::StderrUnavailable)?;

        let (tee_in, framer_in_rx) = TeeSender::new(self.config.tee_capacity, self.config.debug);
        let (tee_out, framer_out_rx) = TeeSender::new(self.config.tee_capacity, self.config.debug);

        let framer_in = self.spawn_framer(Direction::Inbound, framer_in_rx);
        let framer_out = self.spawn_framer(Direction::Outbound, framer_out_rx);

        let inbound_cancel = CancellationToken::new();
        let outbound_cancel = CancellationToken::new();

        let inbound = tokio::spawn(proxy::pump(
            client_in,
            child_stdin,
            Direction::Inbound,
            tee_in.clone(),
            inbound_cancel.clone(),
        ));
        let mut outbound = tokio::spawn(proxy::pump(
            child_stdout,
            client_out,
            Direction::Outbound,
            tee_out.clone(),
            outbound_cancel.clone(),
        ));
        let stderr_pump = tokio::spawn(proxy::pump_stderr(child_stderr, client_err));

        // Keep only the drop counters; the senders must die with the pumps
        // so the framer channels close at EOF.
        let tee_dropped = (tee_in.drop_counter(), tee_out.drop_counter());
        drop(tee_in);
        drop(tee_out);

        let code = tokio::select! {
            code = child.wait() => code,
            _ = cancel.cancelled() => {
                debug!("cancellation requested, terminating child");
                child.signal(SignalKind::Terminate);
                inbound_cancel.cancel();
                match child.wait_timeout(self.config.drain_deadline).await {
                    Some(code) => code,
                    None => {
                        warn!(pid = child.id(), "child ignored termination, killing");
                        child.signal(SignalKind::Kill);
                        child.wait_timeout(Duration::from_secs(2)).await.unwrap_or(1)
                    }
                }
            }
        };

        // Child is gone: stop feeding it and let the outbound pump drain
        // whatever stdout still holds, bounded by the grace window.
        inbound_cancel.cancel();
        if time::timeout(self.config.exit_grace, &mut outbound)
            .await
            .is_err()
        {
            outbound_cancel.cancel();
            let _ = time::timeout(Duration::from_secs(1), &mut outbound).await;
        }

        let _ = inbound.await;
        let _ = time::timeout(Duration::from_secs(1), stderr_pump).await;

        // Pumps are done, tee senders dropped; framers flush residuals.
        let in_counts = framer_in.await.unwrap_or_default();
        let out_counts = framer_out.await.unwrap_or_default();

        if self.config.debug {
            use std::sync::atomic::Ordering;
            eprintln!(
                "[Monitor] session complete: exit={code} sync_losses={} flagged={} tee_dropped={}",
                in_counts.0 + out_counts.0,
                in_counts.1 + out_counts.1,
                tee_dropped.0.load(Ordering::Relaxed) + tee_dropped.1.load(Ordering::Relaxed),
            );
        }

        Ok(code)
    }

    fn spawn_framer(
        &self,
        direction: Direction,
        mut rx: mpsc::Receiver<RawChunk>,
    ) -> JoinHandle<(u64, u64)> {
        let fanout = self.fanout.clone();
        let mut framer = Framer::new(direction, self.correlation_id.clone());
        tokio::spawn(async move {
            while let Some(chunk) = rx.recv().await {
                for msg in framer.push(&chunk.bytes) {
                    fanout.publish(msg);
                }
            }
            if let Some(tail) = framer.finish() {
                fanout.publish(tail);
            }
            (framer.sync_losses(), framer.version_flagged())
        })
    }
}
