use std::{
    io,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use km_events::Direction;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    sync::mpsc,
};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// OS-read granularity for the pumps.
pub const CHUNK_SIZE: usize = 4096;

/// A raw chunk exactly as read from the source, handed to the framer after
/// the sink write completed.
#[derive(Debug)]
pub struct RawChunk {
    pub direction: Direction,
    pub bytes: Vec<u8>,
}

/// Non-blocking handoff from a pump to the observation path. Saturation
/// drops the chunk and counts it; the pump never waits here.
#[derive(Clone)]
pub struct TeeSender {
    tx: mpsc::Sender<RawChunk>,
    dropped: Arc<AtomicU64>,
    debug_diagnostics: bool,
}

impl TeeSender {
    pub fn new(capacity: usize, debug_diagnostics: bool) -> (Self, mpsc::Receiver<RawChunk>) {
        let (tx, rx) = mpsc::channel(capacity);
        (
            Self {
                tx,
                dropped: Arc::new(AtomicU64::new(0)),
                debug_diagnostics,
            },
            rx,
        )
    }

    pub fn submit(&self, direction: Direction, bytes: &[u8]) {
        let chunk = RawChunk {
            direction,
            bytes: bytes.to_vec(),
        };
        if self.tx.try_send(chunk).is_err() {
            let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            if self.debug_diagnostics {
                eprintln!("[Monitor] observation handoff saturated, dropped chunk #{dropped}");
            }
        }
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Counter handle that outlives the sender without holding the channel
    /// open.
    pub fn drop_counter(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.dropped)
    }
}

/// Copies `reader` to `writer` byte-transparently, teeing each chunk to the
/// observation path only after its sink write completed.
///
/// Returns the byte count forwarded. The pump suspends only on its own
/// source/sink I/O; cancellation is honored while waiting on the source so
/// an idle direction can be shut down.
pub async fn pump<R, W>(
    mut reader: R,
    mut writer: W,
    direction: Direction,
    tee: TeeSender,
    cancel: CancellationToken,
) -> Result<u64, io::Error>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut chunk = [0u8; CHUNK_SIZE];
    let mut forwarded: u64 = 0;
    loop {
        let n = tokio::select! {
            read = reader.read(&mut chunk) => read?,
            _ = cancel.cancelled() => break,
        };
        if n == 0 {
            break;
        }
        writer.write_all(&chunk[..n]).await?;
        writer.flush().await?;
        forwarded += n as u64;
        tee.submit(direction, &chunk[..n]);
    }
    // Dropping the writer closes the sink; for the inbound pump that is
    // what makes the child observe EOF on its stdin.
    writer.shutdown().await.ok();
    debug!(%direction, forwarded, "pump finished");
    Ok(forwarded)
}

/// Forwards child stderr verbatim; never observed, never batched.
pub async fn pump_stderr<R, W>(mut reader: R, mut writer: W) -> Result<u64, io::Error>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut chunk = [0u8; CHUNK_SIZE];
    let mut forwarded: u64 = 0;
    loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        writer.write_all(&chunk[..n]).await?;
        writer.flush().await?;
        forwarded += n as u64;
    }
    Ok(forwarded)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn pump_is_byte_transparent() {
        let payload: Vec<u8> = (0..=255u8).cycle().take(20_000).collect();
        let reader = std::io::Cursor::new(payload.clone());
        let mut sink = Vec::new();
        let (tee, mut rx) = TeeSender::new(64, false);

        let forwarded = pump(
            reader,
            &mut sink,
            Direction::Inbound,
            tee,
            CancellationToken::new(),
        )
        .await
        .unwrap();

        assert_eq!(forwarded, payload.len() as u64);
        assert_eq!(sink, payload);

        // The tee saw the same bytes in the same order.
        rx.close();
        let mut teed = Vec::new();
        while let Ok(chunk) = rx.try_recv() {
            teed.extend_from_slice(&chunk.bytes);
        }
        assert_eq!(teed, payload);
    }

    #[tokio::test]
    async fn saturated_tee_never_blocks_the_pump() {
        let payload = vec![7u8; CHUNK_SIZE * 16];
        let reader = std::io::Cursor::new(payload.clone());
        let mut sink = Vec::new();
        // Capacity one and nobody draining: everything past the first
        // chunk is dropped for observation, none for forwarding.
        let (tee, _rx) = TeeSender::new(1, false);

        let forwarded = pump(
            reader,
            &mut sink,
            Direction::Outbound,
            tee.clone(),
            CancellationToken::new(),
        )
        .await
        .unwrap();

        assert_eq!(forwarded, payload.len() as u64);
        assert_eq!(sink, payload);
        assert!(tee.dropped() > 0);
    }

    #[tokio::test]
    async fn cancellation_stops_an_idle_pump() {
        let (_client_side, server_side) = tokio::io::duplex(64);
        let cancel = CancellationToken::new();
        let (tee, _rx) = TeeSender::new(4, false);
        let mut sink = Vec::new();

        let task = {
            let cancel = cancel.clone();
            async move { pump(server_side, &mut sink, Direction::Inbound, tee, cancel).await }
        };
        let task = tokio::spawn(task);

        cancel.cancel();
        let result = tokio::time::timeout(std::time::Duration::from_secs(1), task)
            .await
            .expect("pump should observe cancellation")
            .unwrap();
        assert!(result.is_ok());
    }
}
