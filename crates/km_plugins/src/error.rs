use std::time::Duration;

use km_api::{ApiError, Tier};
use thiserror::Error;

/// Plugin-side failures. Everything here is isolated to the offending
/// plugin or install attempt; nothing aborts the wiretap's data path.
#[derive(Debug, Error)]
pub enum PluginError {
    #[error("plugin `{plugin}` failed to load: {reason}")]
    LoadFailed { plugin: String, reason: String },
    #[error("plugin `{plugin}` handshake failed: {reason}")]
    HandshakeFailed { plugin: String, reason: String },
    #[error("plugin `{plugin}` requires {required} (user tier {user})")]
    AuthDenied {
        plugin: String,
        required: Tier,
        user: Tier,
    },
    #[error("plugin `{plugin}` crashed: {reason}")]
    Crashed { plugin: String, reason: String },
    #[error("rpc `{method}` failed: {reason}")]
    Rpc { method: String, reason: String },
    #[error("rpc call exceeded {0:?}")]
    RpcTimeout(Duration),
    #[error("rpc connection closed")]
    RpcClosed,

    #[error("downloaded plugin hash mismatch: expected {expected}, got {actual}")]
    DownloadHashMismatch { expected: String, actual: String },
    #[error("downloaded plugin signature is invalid")]
    DownloadSignatureInvalid,
    #[error("archive entry escapes the target directory: {path}")]
    DownloadUnsafePath { path: String },
    #[error("archive entry `{path}` has unsafe type {entry_type}")]
    UnsafeEntryType { entry_type: String, path: String },
    #[error("package `{0}` carries no metadata entry")]
    PackageMetadataMissing(String),
    #[error("plugin `{0}` is not in the manifest")]
    NotInManifest(String),

    #[error("registry file is corrupt: {0}")]
    RegistryCorrupt(String),

    #[error(transparent)]
    Api(#[from] ApiError),
    #[error("i/o failure: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed JSON: {0}")]
    Json(#[from] serde_json::Error),
}
