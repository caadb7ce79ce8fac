//! Handshake-gated RPC to out-of-process plugins.
//!
//! The wrapper spawns the plugin binary with a magic cookie in its
//! environment; the plugin prints a single handshake line on stdout
//! (`CORE|APP|network|addr|protocol`) advertising where and how to attach.
//! Two wire protocols are supported: `netrpc` (newline-delimited JSON-RPC)
//! and the `grpc` variant (length-prefixed JSON frames). Either way the
//! plugin dispenses one object, `kilometers`, whose methods this client
//! wraps.

use std::{
    collections::HashMap,
    path::Path,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use base64::Engine as _;
use km_api::Tier;
use km_events::Direction;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader},
    process::{Child, Command},
    sync::{mpsc, oneshot, Mutex},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::PluginError;

/// Environment variable and cookie proving the plugin was launched by the
/// wrapper rather than run by hand.
pub const HANDSHAKE_COOKIE_KEY: &str = "KILOMETERS_PLUGIN";
pub const HANDSHAKE_COOKIE_VALUE: &str = "kilometers_monitoring_plugin";

/// Handshake protocol version this wrapper speaks.
pub const CORE_PROTOCOL_VERSION: u32 = 1;

/// Name of the object plugins dispense; method names are prefixed with it.
pub const DISPENSE_NAME: &str = "kilometers";

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_FRAME: usize = 16 * 1024 * 1024;
const METHOD_NOT_FOUND: i64 = -32601;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProtocolKind {
    /// Newline-delimited JSON-RPC method calls.
    NetRpc,
    /// Length-prefixed frames carrying the same call shapes.
    Grpc,
}

/// Parsed `CORE|APP|network|addr|protocol` handshake line.
#[derive(Clone, Debug)]
pub struct Handshake {
    pub core_version: u32,
    pub app_version: u32,
    pub network: String,
    pub addr: String,
    pub protocol: ProtocolKind,
}

pub fn parse_handshake(line: &str) -> Result<Handshake, String> {
    let parts: Vec<&str> = line.trim().split('|').collect();
    if parts.len() != 5 {
        return Err(format!("expected 5 handshake fields, got {}", parts.len()));
    }
    let core_version: u32 = parts[0]
        .parse()
        .map_err(|_| format!("bad core protocol version `{}`", parts[0]))?;
    if core_version != CORE_PROTOCOL_VERSION {
        return Err(format!(
            "core protocol version {core_version} unsupported (want {CORE_PROTOCOL_VERSION})"
        ));
    }
    let app_version: u32 = parts[1]
        .parse()
        .map_err(|_| format!("bad app protocol version `{}`", parts[1]))?;
    let protocol = match parts[4] {
        "netrpc" => ProtocolKind::NetRpc,
        "grpc" => ProtocolKind::Grpc,
        other => return Err(format!("unknown protocol `{other}`")),
    };
    match parts[2] {
        "tcp" | "unix" => {}
        other => return Err(format!("unknown network `{other}`")),
    }
    Ok(Handshake {
        core_version,
        app_version,
        network: parts[2].to_string(),
        addr: parts[3].to_string(),
        protocol,
    })
}

/// Plugin-reported identity, from `kilometers.GetInfo`.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginInfo {
    pub name: String,
    pub version: String,
    #[serde(default, alias = "required_tier")]
    pub required_tier: Tier,
}

/// Plugin-side result of `kilometers.Authenticate`.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginAuthResult {
    #[serde(default)]
    pub authorized: bool,
    #[serde(default)]
    pub tier: Option<Tier>,
    #[serde(default)]
    pub message: Option<String>,
}

type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<Result<Value, PluginError>>>>>;

/// JSON-RPC client over the handshake-advertised endpoint.
///
/// A writer task owns the socket's write half, a reader task matches
/// responses to pending calls by id; either half failing trips the
/// `closed` token, which the host watches for crash detection.
pub struct RpcClient {
    writer: mpsc::UnboundedSender<Vec<u8>>,
    pending: PendingMap,
    next_id: AtomicU64,
    tasks: Vec<JoinHandle<()>>,
    closed: CancellationToken,
    call_timeout: Duration,
}

impl RpcClient {
    /// Dials the handshake's endpoint.
    pub async fn connect(handshake: &Handshake, call_timeout: Duration) -> Result<Self, PluginError> {
        match handshake.network.as_str() {
            "tcp" => {
                let stream = tokio::net::TcpStream::connect(&handshake.addr)
                    .await
                    .map_err(PluginError::Io)?;
                Ok(Self::from_stream(stream, handshake.protocol, call_timeout))
            }
            #[cfg(unix)]
            "unix" => {
                let stream = tokio::net::UnixStream::connect(&handshake.addr)
                    .await
                    .map_err(PluginError::Io)?;
                Ok(Self::from_stream(stream, handshake.protocol, call_timeout))
            }
            other => Err(PluginError::HandshakeFailed {
                plugin: String::new(),
                reason: format!("unsupported network `{other}`"),
            }),
        }
    }

    /// Builds a client over any duplex byte stream (tests use in-memory
    /// pipes).
    pub fn from_stream<S>(stream: S, protocol: ProtocolKind, call_timeout: Duration) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let closed = CancellationToken::new();
        let (writer_tx, writer_rx) = mpsc::unbounded_channel();

        let writer_task = tokio::spawn(writer_loop(write_half, writer_rx, protocol, closed.clone()));
        let reader_task = tokio::spawn(reader_loop(
            read_half,
            protocol,
            Arc::clone(&pending),
            closed.clone(),
        ));

        Self {
            writer: writer_tx,
            pending,
            next_id: AtomicU64::new(1),
            tasks: vec![writer_task, reader_task],
            closed,
            call_timeout,
        }
    }

    /// Fires when the connection is gone (EOF, I/O error, or shutdown).
    pub fn closed(&self) -> CancellationToken {
        self.closed.clone()
    }

    pub async fn call(&self, method: &str, params: Value) -> Result<Value, PluginError> {
        if self.closed.is_cancelled() {
            return Err(PluginError::RpcClosed);
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let message = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });
        let encoded = serde_json::to_vec(&message)?;
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.pending.lock().await;
            pending.insert(id, tx);
        }
        if self.writer.send(encoded).is_err() {
            self.pending.lock().await.remove(&id);
            return Err(PluginError::RpcClosed);
        }

        match tokio::time::timeout(self.call_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(PluginError::RpcClosed),
            Err(_) => {
                self.pending.lock().await.remove(&id);
                Err(PluginError::RpcTimeout(self.call_timeout))
            }
        }
    }

    // Typed surface of the dispensed `kilometers` object.

    pub async fn get_info(&self) -> Result<PluginInfo, PluginError> {
        let value = self.call(&method("GetInfo"), Value::Null).await?;
        Ok(serde_json::from_value(value)?)
    }

    pub async fn initialize(&self, config: Value) -> Result<(), PluginError> {
        self.call(&method("Initialize"), config).await?;
        Ok(())
    }

    pub async fn authenticate(&self, token: &str) -> Result<PluginAuthResult, PluginError> {
        let value = self
            .call(&method("Authenticate"), json!({ "token": token }))
            .await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Delivers one observation; returns whatever events the plugin
    /// produced. Falls back to the legacy `HandleMessage` name when the
    /// plugin predates `ProcessMessage`.
    pub async fn process_message(
        &self,
        bytes: &[u8],
        direction: Direction,
    ) -> Result<Vec<Value>, PluginError> {
        let params = json!({
            "payload": base64::engine::general_purpose::STANDARD.encode(bytes),
            "direction": direction.as_str(),
        });
        let result = match self.call(&method("ProcessMessage"), params.clone()).await {
            Err(PluginError::Rpc { reason, .. }) if reason.contains("-32601") => {
                self.call(&method("HandleMessage"), params).await?
            }
            other => other?,
        };
        match result {
            Value::Null => Ok(Vec::new()),
            Value::Array(events) => Ok(events),
            other => Ok(vec![other]),
        }
    }

    /// Best-effort plugin-side shutdown; the process kill happens in
    /// [`PluginProcess::kill`].
    pub async fn shutdown(&self) {
        let shutdown_method = method("Shutdown");
        let call = self.call(&shutdown_method, Value::Null);
        let _ = tokio::time::timeout(Duration::from_secs(2), call).await;
        self.closed.cancel();
    }
}

impl Drop for RpcClient {
    fn drop(&mut self) {
        self.closed.cancel();
        for task in &self.tasks {
            task.abort();
        }
    }
}

fn method(name: &str) -> String {
    format!("{DISPENSE_NAME}.{name}")
}

async fn writer_loop<W>(
    mut writer: W,
    mut rx: mpsc::UnboundedReceiver<Vec<u8>>,
    protocol: ProtocolKind,
    closed: CancellationToken,
) where
    W: AsyncWrite + Send + Unpin,
{
    while let Some(frame) = rx.recv().await {
        let result = match protocol {
            ProtocolKind::NetRpc => {
                let mut line = frame;
                line.push(b'\n');
                writer.write_all(&line).await
            }
            ProtocolKind::Grpc => {
                let len = (frame.len() as u32).to_be_bytes();
                match writer.write_all(&len).await {
                    Ok(()) => writer.write_all(&frame).await,
                    Err(err) => Err(err),
                }
            }
        };
        if result.is_err() || writer.flush().await.is_err() {
            break;
        }
    }
    closed.cancel();
    let _ = writer.shutdown().await;
}

async fn reader_loop<R>(
    reader: R,
    protocol: ProtocolKind,
    pending: PendingMap,
    closed: CancellationToken,
) where
    R: AsyncRead + Send + Unpin,
{
    match protocol {
        ProtocolKind::NetRpc => {
            let mut lines = BufReader::new(reader).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if line.trim().is_empty() {
                    continue;
                }
                dispatch_frame(line.as_bytes(), &pending).await;
            }
        }
        ProtocolKind::Grpc => {
            let mut reader = reader;
            loop {
                let mut len_buf = [0u8; 4];
                if reader.read_exact(&mut len_buf).await.is_err() {
                    break;
                }
                let len = u32::from_be_bytes(len_buf) as usize;
                if len == 0 || len > MAX_FRAME {
                    warn!(len, "plugin sent an out-of-range frame length");
                    break;
                }
                let mut frame = vec![0u8; len];
                if reader.read_exact(&mut frame).await.is_err() {
                    break;
                }
                dispatch_frame(&frame, &pending).await;
            }
        }
    }

    closed.cancel();
    let mut pending = pending.lock().await;
    for (_, tx) in pending.drain() {
        let _ = tx.send(Err(PluginError::RpcClosed));
    }
}

#[derive(Debug, Deserialize)]
struct RpcResponse {
    id: Option<u64>,
    result: Option<Value>,
    error: Option<RpcErrorBody>,
}

#[derive(Debug, Deserialize)]
struct RpcErrorBody {
    code: i64,
    message: String,
}

async fn dispatch_frame(frame: &[u8], pending: &PendingMap) {
    let response: RpcResponse = match serde_json::from_slice(frame) {
        Ok(response) => response,
        Err(err) => {
            warn!(error = %err, "undecodable frame from plugin");
            return;
        }
    };
    let Some(id) = response.id else {
        // Plugins may emit notifications; nothing correlates to them.
        debug!("ignoring plugin notification frame");
        return;
    };
    let sender = { pending.lock().await.remove(&id) };
    let Some(tx) = sender else { return };

    let outcome = if let Some(error) = response.error {
        Err(PluginError::Rpc {
            method: format!("id {id}"),
            reason: format!("{} ({})", error.message, error.code),
        })
    } else {
        Ok(response.result.unwrap_or(Value::Null))
    };
    let _ = tx.send(outcome);
}

/// A live plugin: its OS process plus the attached RPC client. The client
/// is shared so the host can keep calling (auth refresh) while the forward
/// task owns delivery.
pub struct PluginProcess {
    child: Child,
    pub rpc: Arc<RpcClient>,
    pub handshake: Handshake,
}

impl PluginProcess {
    /// Spawns the binary with the handshake cookie, reads the handshake
    /// line, and attaches to the advertised endpoint.
    pub async fn spawn(binary: &Path, call_timeout: Duration) -> Result<Self, PluginError> {
        let plugin = binary.display().to_string();
        let mut command = Command::new(binary);
        command
            .env(HANDSHAKE_COOKIE_KEY, HANDSHAKE_COOKIE_VALUE)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);

        let mut child = command.spawn().map_err(|err| PluginError::LoadFailed {
            plugin: plugin.clone(),
            reason: format!("spawn failed: {err}"),
        })?;

        let stdout = child.stdout.take().ok_or_else(|| PluginError::LoadFailed {
            plugin: plugin.clone(),
            reason: "plugin stdout unavailable".into(),
        })?;
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(plugin = %line, "plugin stderr");
                }
            });
        }

        let mut stdout_lines = BufReader::new(stdout).lines();
        let line = tokio::time::timeout(HANDSHAKE_TIMEOUT, stdout_lines.next_line())
            .await
            .map_err(|_| PluginError::HandshakeFailed {
                plugin: plugin.clone(),
                reason: format!("no handshake within {HANDSHAKE_TIMEOUT:?}"),
            })?
            .map_err(|err| PluginError::HandshakeFailed {
                plugin: plugin.clone(),
                reason: err.to_string(),
            })?
            .ok_or_else(|| PluginError::HandshakeFailed {
                plugin: plugin.clone(),
                reason: "plugin exited before handshake".into(),
            })?;

        let handshake = parse_handshake(&line).map_err(|reason| PluginError::HandshakeFailed {
            plugin: plugin.clone(),
            reason,
        })?;

        // Anything the plugin prints after the handshake is diagnostics.
        tokio::spawn(async move {
            while let Ok(Some(line)) = stdout_lines.next_line().await {
                debug!(plugin_stdout = %line, "plugin stdout");
            }
        });

        let rpc = Arc::new(RpcClient::connect(&handshake, call_timeout).await?);
        Ok(Self {
            child,
            rpc,
            handshake,
        })
    }

    pub fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    /// Cooperative shutdown then kill: plugin-side `Shutdown`, close the
    /// transport, terminate the process.
    pub async fn kill(mut self) {
        self.rpc.shutdown().await;
        let _ = self.child.start_kill();
        let _ = tokio::time::timeout(Duration::from_secs(2), self.child.wait()).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_tcp_netrpc_handshake() {
        let handshake = parse_handshake("1|1|tcp|127.0.0.1:43521|netrpc").unwrap();
        assert_eq!(handshake.core_version, 1);
        assert_eq!(handshake.network, "tcp");
        assert_eq!(handshake.addr, "127.0.0.1:43521");
        assert_eq!(handshake.protocol, ProtocolKind::NetRpc);
    }

    #[test]
    fn parses_unix_grpc_handshake() {
        let handshake = parse_handshake("1|3|unix|/tmp/km-plugin.sock|grpc\n").unwrap();
        assert_eq!(handshake.app_version, 3);
        assert_eq!(handshake.network, "unix");
        assert_eq!(handshake.protocol, ProtocolKind::Grpc);
    }

    #[test]
    fn rejects_bad_handshakes() {
        assert!(parse_handshake("").is_err());
        assert!(parse_handshake("1|1|tcp|addr").is_err());
        assert!(parse_handshake("2|1|tcp|addr|netrpc").is_err());
        assert!(parse_handshake("1|1|carrier-pigeon|addr|netrpc").is_err());
        assert!(parse_handshake("1|1|tcp|addr|corba").is_err());
    }

    async fn serve_netrpc_once(stream: tokio::io::DuplexStream, reply: impl Fn(Value) -> Value + Send + 'static) {
        let (read_half, mut write_half) = tokio::io::split(stream);
        let mut lines = BufReader::new(read_half).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let request: Value = serde_json::from_str(&line).unwrap();
            let response = reply(request);
            let mut encoded = serde_json::to_vec(&response).unwrap();
            encoded.push(b'\n');
            if write_half.write_all(&encoded).await.is_err() {
                break;
            }
        }
    }

    #[tokio::test]
    async fn netrpc_call_round_trip() {
        let (client_side, server_side) = tokio::io::duplex(4096);
        tokio::spawn(serve_netrpc_once(server_side, |request| {
            assert_eq!(request["method"], "kilometers.GetInfo");
            json!({
                "jsonrpc": "2.0",
                "id": request["id"],
                "result": {"name": "console", "version": "1.0.0", "requiredTier": "Free"},
            })
        }));

        let client =
            RpcClient::from_stream(client_side, ProtocolKind::NetRpc, Duration::from_secs(2));
        let info = client.get_info().await.unwrap();
        assert_eq!(info.name, "console");
        assert_eq!(info.required_tier, Tier::Free);
    }

    #[tokio::test]
    async fn grpc_framing_round_trip() {
        let (client_side, server_side) = tokio::io::duplex(4096);
        tokio::spawn(async move {
            let (mut read_half, mut write_half) = tokio::io::split(server_side);
            let mut len_buf = [0u8; 4];
            read_half.read_exact(&mut len_buf).await.unwrap();
            let mut frame = vec![0u8; u32::from_be_bytes(len_buf) as usize];
            read_half.read_exact(&mut frame).await.unwrap();
            let request: Value = serde_json::from_slice(&frame).unwrap();

            let response = serde_json::to_vec(&json!({
                "jsonrpc": "2.0",
                "id": request["id"],
                "result": {"authorized": true, "tier": "Pro"},
            }))
            .unwrap();
            write_half
                .write_all(&(response.len() as u32).to_be_bytes())
                .await
                .unwrap();
            write_half.write_all(&response).await.unwrap();
        });

        let client =
            RpcClient::from_stream(client_side, ProtocolKind::Grpc, Duration::from_secs(2));
        let auth = client.authenticate("token").await.unwrap();
        assert!(auth.authorized);
        assert_eq!(auth.tier, Some(Tier::Pro));
    }

    #[tokio::test]
    async fn falls_back_to_legacy_handle_message() {
        let (client_side, server_side) = tokio::io::duplex(4096);
        tokio::spawn(serve_netrpc_once(server_side, |request| {
            if request["method"] == "kilometers.ProcessMessage" {
                json!({
                    "jsonrpc": "2.0",
                    "id": request["id"],
                    "error": {"code": -32601, "message": "method not found"},
                })
            } else {
                assert_eq!(request["method"], "kilometers.HandleMessage");
                json!({
                    "jsonrpc": "2.0",
                    "id": request["id"],
                    "result": [{"kind": "observation"}],
                })
            }
        }));

        let client =
            RpcClient::from_stream(client_side, ProtocolKind::NetRpc, Duration::from_secs(2));
        let events = client
            .process_message(b"{}", Direction::Inbound)
            .await
            .unwrap();
        assert_eq!(events.len(), 1);
    }

    #[tokio::test]
    async fn rpc_error_carries_code_and_message() {
        let (client_side, server_side) = tokio::io::duplex(4096);
        tokio::spawn(serve_netrpc_once(server_side, |request| {
            json!({
                "jsonrpc": "2.0",
                "id": request["id"],
                "error": {"code": -32000, "message": "backend unavailable"},
            })
        }));

        let client =
            RpcClient::from_stream(client_side, ProtocolKind::NetRpc, Duration::from_secs(2));
        let err = client.initialize(json!({})).await.unwrap_err();
        assert!(matches!(err, PluginError::Rpc { .. }));
        assert!(err.to_string().contains("backend unavailable"));
    }

    #[tokio::test]
    async fn closed_fires_on_peer_disconnect() {
        let (client_side, server_side) = tokio::io::duplex(64);
        let client =
            RpcClient::from_stream(client_side, ProtocolKind::NetRpc, Duration::from_millis(500));
        let closed = client.closed();
        assert!(!closed.is_cancelled());

        drop(server_side);
        tokio::time::timeout(Duration::from_secs(1), closed.cancelled())
            .await
            .expect("closed token should fire on EOF");

        let err = client.get_info().await.unwrap_err();
        assert!(matches!(
            err,
            PluginError::RpcClosed | PluginError::RpcTimeout(_)
        ));
    }
}
