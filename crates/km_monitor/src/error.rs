use std::{io, path::PathBuf};

use thiserror::Error;

/// Errors from the monitor path: supervisor, pumps, and session wiring.
///
/// Observer-side problems (framer desync, mailbox overflow) are counters,
/// not errors; only the data path itself can fail the monitor.
#[derive(Debug, Error)]
pub enum MonitorError {
    #[error("executable `{binary}` could not be found")]
    ExecutableMissing { binary: PathBuf },
    #[error("working directory `{dir}` does not exist")]
    WorkingDirMissing { dir: PathBuf },
    #[error("failed to spawn `{binary}`: {source}")]
    Spawn {
        binary: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to wait for child: {source}")]
    Wait {
        #[source]
        source: io::Error,
    },
    #[error("child stdin unavailable")]
    StdinUnavailable,
    #[error("child stdout unavailable")]
    StdoutUnavailable,
    #[error("child stderr unavailable")]
    StderrUnavailable,
    #[error("data-path pipe failed: {0}")]
    Pipe(#[source] io::Error),
    #[error("failed to join pump task: {0}")]
    Join(#[from] tokio::task::JoinError),
}
