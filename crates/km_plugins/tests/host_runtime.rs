//! Runtime tests against fake plugins: a real spawned handshake script plus
//! an in-test TCP JSON-RPC server standing in for the plugin's endpoint.

#![cfg(unix)]

use std::{
    fs,
    path::Path,
    sync::{Arc, Mutex},
    time::Duration,
};

use base64::Engine as _;
use ed25519_dalek::{Signer, SigningKey};
use km_api::{ApiClient, ApiKeyHeaders, BackendEndpoint, DefaultRetryPolicy, KeyRing, Tier, TokenManager};
use km_events::{CorrelationId, Direction, ObservedMessage};
use km_plugins::{HostConfig, LoadOutcome, PluginBinary, PluginHost};
use serde_json::{json, Value};
use tokio::{
    io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader},
    net::{TcpListener, TcpStream},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;

/// A scripted plugin: a shell script that prints the handshake and an
/// in-test RPC server behind it.
struct FakePlugin {
    binary: PluginBinary,
    received: Arc<Mutex<Vec<String>>>,
    drop_connection: CancellationToken,
    _server: JoinHandle<()>,
}

async fn fake_plugin(dir: &Path, name: &str, info_tier: Tier, authorized: bool) -> FakePlugin {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let script = format!("#!/bin/sh\necho \"1|1|tcp|127.0.0.1:{port}|netrpc\"\nexec sleep 60\n");
    let path = dir.join(format!("km-plugin-{name}"));
    fs::write(&path, script).unwrap();
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();

    let received = Arc::new(Mutex::new(Vec::new()));
    let drop_connection = CancellationToken::new();
    let server = {
        let received = Arc::clone(&received);
        let drop_connection = drop_connection.clone();
        let name = name.to_string();
        tokio::spawn(async move {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            serve_plugin_rpc(stream, name, info_tier, authorized, received, drop_connection).await;
        })
    };

    FakePlugin {
        binary: PluginBinary {
            path,
            name: name.to_string(),
            version: "1.0.0".to_string(),
            required_tier: Tier::Free,
            signature: None,
        },
        received,
        drop_connection,
        _server: server,
    }
}

async fn serve_plugin_rpc(
    stream: TcpStream,
    name: String,
    info_tier: Tier,
    authorized: bool,
    received: Arc<Mutex<Vec<String>>>,
    drop_connection: CancellationToken,
) {
    let (read_half, mut write_half) = tokio::io::split(stream);
    let mut lines = BufReader::new(read_half).lines();
    loop {
        let line = tokio::select! {
            _ = drop_connection.cancelled() => break,
            line = lines.next_line() => match line {
                Ok(Some(line)) => line,
                _ => break,
            },
        };
        let request: Value = serde_json::from_str(&line).unwrap();
        let method = request["method"].as_str().unwrap_or_default().to_string();
        match method.as_str() {
            "kilometers.Authenticate" => {
                let token = request["params"]["token"].as_str().unwrap_or_default();
                received.lock().unwrap().push(format!("auth:{token}"));
            }
            "kilometers.ProcessMessage" => {
                let payload = request["params"]["payload"].as_str().unwrap_or_default();
                let direction = request["params"]["direction"].as_str().unwrap_or_default();
                received
                    .lock()
                    .unwrap()
                    .push(format!("msg:{direction}:{payload}"));
            }
            _ => {
                received.lock().unwrap().push(method.clone());
            }
        }
        let result = match method.as_str() {
            "kilometers.GetInfo" => json!({
                "name": name,
                "version": "1.0.0",
                "requiredTier": info_tier,
            }),
            "kilometers.Authenticate" => json!({ "authorized": authorized }),
            "kilometers.ProcessMessage" => json!([]),
            _ => json!({}),
        };
        let mut encoded = serde_json::to_vec(&json!({
            "jsonrpc": "2.0",
            "id": request["id"],
            "result": result,
        }))
        .unwrap();
        encoded.push(b'\n');
        if write_half.write_all(&encoded).await.is_err() {
            break;
        }
    }
}

fn anonymous_host() -> PluginHost {
    PluginHost::new(HostConfig::default(), KeyRing::new(), None, None)
}

fn observation(payload: &[u8]) -> ObservedMessage {
    ObservedMessage::unframed(
        Arc::<[u8]>::from(payload),
        Direction::Inbound,
        CorrelationId::from("session"),
    )
}

async fn wait_until<F>(mut condition: F, deadline: Duration)
where
    F: FnMut() -> bool,
{
    let start = std::time::Instant::now();
    while !condition() {
        assert!(start.elapsed() < deadline, "condition not met in time");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn loads_free_plugin_anonymously() {
    let tmp = tempfile::tempdir().unwrap();
    let plugin = fake_plugin(tmp.path(), "console", Tier::Free, true).await;
    let host = anonymous_host();

    let outcome = host.load(plugin.binary.clone()).await.unwrap();
    assert!(matches!(outcome, LoadOutcome::Loaded));
    assert_eq!(host.active().await, vec!["console".to_string()]);

    // Anonymous auth presented an empty token.
    let log = plugin.received.lock().unwrap().clone();
    assert!(log.contains(&"auth:".to_string()), "log: {log:?}");

    host.shutdown().await;
}

#[tokio::test]
async fn tier_denied_plugin_is_killed_and_skipped() {
    let tmp = tempfile::tempdir().unwrap();
    let plugin = fake_plugin(tmp.path(), "pro-analyzer", Tier::Pro, true).await;
    let host = anonymous_host();

    let outcome = host.load(plugin.binary.clone()).await.unwrap();
    assert!(matches!(
        outcome,
        LoadOutcome::TierDenied {
            required: Tier::Pro,
            user: Tier::Free,
        }
    ));
    assert!(host.active().await.is_empty());

    // No observations are ever delivered to it.
    host.forward(&observation(b"{}")).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    let log = plugin.received.lock().unwrap().clone();
    assert!(!log.iter().any(|entry| entry.starts_with("msg:")));
}

#[tokio::test]
async fn observations_reach_all_loaded_plugins() {
    let tmp = tempfile::tempdir().unwrap();
    let console = fake_plugin(tmp.path(), "console", Tier::Free, true).await;
    let shipper = fake_plugin(tmp.path(), "api-shipper", Tier::Free, true).await;
    let host = anonymous_host();

    assert!(matches!(
        host.load(console.binary.clone()).await.unwrap(),
        LoadOutcome::Loaded
    ));
    assert!(matches!(
        host.load(shipper.binary.clone()).await.unwrap(),
        LoadOutcome::Loaded
    ));

    host.forward(&observation(br#"{"jsonrpc":"2.0","method":"ping","id":1}"#))
        .await;

    let saw_message = |log: &Arc<Mutex<Vec<String>>>| {
        let log = log.lock().unwrap();
        log.iter().any(|entry| entry.starts_with("msg:inbound:"))
    };
    wait_until(|| saw_message(&console.received), Duration::from_secs(3)).await;
    wait_until(|| saw_message(&shipper.received), Duration::from_secs(3)).await;

    host.shutdown().await;
}

#[tokio::test]
async fn crash_of_one_plugin_leaves_the_other_serving() {
    let tmp = tempfile::tempdir().unwrap();
    let console = fake_plugin(tmp.path(), "console", Tier::Free, true).await;
    let shipper = fake_plugin(tmp.path(), "api-shipper", Tier::Free, true).await;
    let host = Arc::new(anonymous_host());

    host.load(console.binary.clone()).await.unwrap();
    host.load(shipper.binary.clone()).await.unwrap();
    assert_eq!(host.active().await.len(), 2);

    // Sever console's RPC connection mid-session.
    console.drop_connection.cancel();
    let start = std::time::Instant::now();
    while host.active().await.len() != 1 {
        assert!(
            start.elapsed() < Duration::from_secs(3),
            "crashed plugin was not removed"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(host.active().await, vec!["api-shipper".to_string()]);

    // The survivor still receives observations.
    host.forward(&observation(br#"{"jsonrpc":"2.0","method":"after-crash","id":2}"#))
        .await;
    wait_until(
        || {
            let log = shipper.received.lock().unwrap();
            log.iter().filter(|entry| entry.starts_with("msg:")).count() >= 1
        },
        Duration::from_secs(3),
    )
    .await;

    host.shutdown().await;
}

fn sign_plugin_token(signing: &SigningKey, plugin_name: &str, tier: &str) -> String {
    let url_safe = base64::engine::general_purpose::URL_SAFE_NO_PAD;
    let now = time::OffsetDateTime::now_utc().unix_timestamp();
    let header = url_safe.encode(
        serde_json::to_vec(&json!({"alg": "EdDSA", "typ": "JWT", "kid": "test-kid"})).unwrap(),
    );
    let payload = url_safe.encode(
        serde_json::to_vec(&json!({
            "sub": "customer-1",
            "iat": now - 30,
            "exp": now + 3600,
            "customerId": "customer-1",
            "pluginName": plugin_name,
            "pluginVersion": "1.0.0",
            "tier": tier,
            "tokenType": "plugin",
        }))
        .unwrap(),
    );
    let signed = format!("{header}.{payload}");
    let signature = signing.sign(signed.as_bytes());
    format!("{signed}.{}", url_safe.encode(signature.to_bytes()))
}

fn http_response(body: &str) -> String {
    format!(
        "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    )
}

/// One scripted HTTP response per connection; requests are not inspected
/// beyond draining the headers and body.
async fn scripted_http_server(responses: Vec<String>) -> (std::net::SocketAddr, JoinHandle<usize>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let handle = tokio::spawn(async move {
        let mut served = 0usize;
        for response in responses {
            let Ok((mut stream, _)) = listener.accept().await else {
                break;
            };
            let mut buf = vec![0u8; 65536];
            let _ = stream.read(&mut buf).await;
            if stream.write_all(response.as_bytes()).await.is_err() {
                break;
            }
            let _ = stream.shutdown().await;
            served += 1;
        }
        served
    });
    (addr, handle)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn backend_auth_mints_verifies_and_presents_the_plugin_token() {
    let tmp = tempfile::tempdir().unwrap();
    let plugin = fake_plugin(tmp.path(), "console", Tier::Free, true).await;

    let signing = SigningKey::generate(&mut rand::rngs::OsRng);
    let mut ring = KeyRing::new();
    ring.insert("test-kid", signing.verifying_key().to_bytes())
        .unwrap();
    let plugin_token = sign_plugin_token(&signing, "console", "Pro");

    let token_body = json!({
        "success": true,
        "customer": {"id": "customer-1", "email": "", "organization": "", "subscriptionPlan": "Pro"},
        "token": {
            "accessToken": "scoped-jwt",
            "refreshToken": "",
            "accessTokenExpiresAt": "2031-01-01T00:00:00Z",
            "refreshTokenExpiresAt": "",
            "tokenType": "Bearer",
            "accessTokenLifetimeMinutes": 15,
        },
    });
    let auth_body = json!({
        "success": true,
        "token": plugin_token,
        "expiresAt": "2031-01-01T00:00:00Z",
        "authorizedFeatures": ["console"],
        "subscriptionTier": "Pro",
        "customerName": "Acme",
        "pluginVersion": "1.0.0",
    });
    let (addr, server) = scripted_http_server(vec![
        http_response(&token_body.to_string()),
        http_response(&auth_body.to_string()),
    ])
    .await;

    let endpoint = BackendEndpoint::new(format!("http://{addr}"), "km-test/0.0.0");
    let tokens = Arc::new(TokenManager::new(endpoint.clone(), "km_live_key").unwrap());
    let api = Arc::new(
        ApiClient::new(
            endpoint,
            Arc::new(ApiKeyHeaders::new("km_live_key")),
            Arc::new(DefaultRetryPolicy::with_max_attempts(1)),
            Duration::from_secs(5),
        )
        .unwrap(),
    );
    let host = PluginHost::new(HostConfig::default(), ring, Some(tokens), Some(api));

    let outcome = host.load(plugin.binary.clone()).await.unwrap();
    assert!(matches!(outcome, LoadOutcome::Loaded));
    assert_eq!(host.tier_of("console").await, Some(Tier::Pro));

    // The plugin saw the backend-minted, ring-verified token.
    let expected = format!("auth:{plugin_token}");
    let log = plugin.received.lock().unwrap().clone();
    assert!(log.contains(&expected), "log: {log:?}");

    assert_eq!(server.await.unwrap(), 2);
    host.shutdown().await;
}
