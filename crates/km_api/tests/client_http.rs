//! Exercises the client's retry and auth-refresh behavior against a
//! scripted in-process HTTP server.

use std::{
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use km_api::{
    ApiClient, ApiError, ApiKeyHeaders, BackendEndpoint, DefaultRetryPolicy, HeaderProvider,
    SCOPE_GENERAL,
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    task::JoinHandle,
};

fn http_response(status: u16, body: &str) -> String {
    let reason = match status {
        200 => "OK",
        401 => "Unauthorized",
        404 => "Not Found",
        429 => "Too Many Requests",
        500 => "Internal Server Error",
        _ => "Status",
    };
    format!(
        "HTTP/1.1 {status} {reason}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    )
}

async fn read_request(stream: &mut TcpStream) -> String {
    let mut buf = Vec::new();
    let mut tmp = [0u8; 1024];
    loop {
        let n = stream.read(&mut tmp).await.unwrap_or(0);
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&tmp[..n]);
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            let headers = String::from_utf8_lossy(&buf[..pos]).to_string();
            let content_length = headers
                .lines()
                .find_map(|line| {
                    let lower = line.to_ascii_lowercase();
                    lower
                        .strip_prefix("content-length:")
                        .map(|v| v.trim().parse::<usize>().unwrap_or(0))
                })
                .unwrap_or(0);
            let need = pos + 4 + content_length;
            while buf.len() < need {
                let n = stream.read(&mut tmp).await.unwrap_or(0);
                if n == 0 {
                    break;
                }
                buf.extend_from_slice(&tmp[..n]);
            }
            break;
        }
    }
    String::from_utf8_lossy(&buf).to_string()
}

/// Serves one scripted response per connection and returns every request it
/// saw, in order.
async fn scripted_server(responses: Vec<String>) -> (SocketAddr, JoinHandle<Vec<String>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let handle = tokio::spawn(async move {
        let mut seen = Vec::new();
        for response in responses {
            let (mut stream, _) = listener.accept().await.unwrap();
            seen.push(read_request(&mut stream).await);
            stream.write_all(response.as_bytes()).await.unwrap();
            let _ = stream.shutdown().await;
        }
        seen
    });
    (addr, handle)
}

fn fast_policy(max_attempts: u32) -> Arc<DefaultRetryPolicy> {
    Arc::new(DefaultRetryPolicy {
        max_attempts,
        base_backoff: Duration::from_millis(1),
        max_backoff: Duration::from_millis(5),
    })
}

fn client_for(addr: SocketAddr, policy: Arc<DefaultRetryPolicy>) -> ApiClient {
    let endpoint = BackendEndpoint::new(format!("http://{addr}"), "km-test/0.0.0");
    ApiClient::new(
        endpoint,
        Arc::new(ApiKeyHeaders::new("km_test_key")),
        policy,
        Duration::from_secs(5),
    )
    .unwrap()
}

#[tokio::test]
async fn retries_server_errors_then_succeeds() {
    let (addr, server) = scripted_server(vec![
        http_response(500, "{}"),
        http_response(500, "{}"),
        http_response(200, r#"{"ok":true}"#),
    ])
    .await;
    let client = client_for(addr, fast_policy(3));

    let body = serde_json::json!({"events": []});
    let reply: serde_json::Value = client
        .post_json("/api/events/batch", SCOPE_GENERAL, &body)
        .await
        .unwrap();
    assert_eq!(reply["ok"], true);

    let seen = server.await.unwrap();
    assert_eq!(seen.len(), 3);
    for request in &seen {
        assert!(request.contains("X-API-Key: km_test_key") || request.contains("x-api-key"));
        assert!(request.starts_with("POST /api/events/batch"));
    }
}

#[tokio::test]
async fn surfaces_status_after_retry_exhaustion() {
    let (addr, server) = scripted_server(vec![
        http_response(500, "nope"),
        http_response(500, "nope"),
    ])
    .await;
    let client = client_for(addr, fast_policy(2));

    let err = client
        .post_accepted("/api/events/batch", SCOPE_GENERAL, &serde_json::json!({}))
        .await
        .unwrap_err();
    assert!(matches!(err, ApiError::Status { status: 500, .. }));
    assert_eq!(server.await.unwrap().len(), 2);
}

#[tokio::test]
async fn does_not_retry_client_errors() {
    let (addr, server) = scripted_server(vec![http_response(404, "missing")]).await;
    let client = client_for(addr, fast_policy(5));

    let err = client
        .post_accepted("/api/plugins/manifest", SCOPE_GENERAL, &serde_json::json!({}))
        .await
        .unwrap_err();
    assert!(matches!(err, ApiError::Status { status: 404, .. }));
    assert_eq!(server.await.unwrap().len(), 1);
}

struct RefreshingHeaders {
    refreshed: AtomicBool,
}

#[async_trait]
impl HeaderProvider for RefreshingHeaders {
    async fn headers(&self, _scope: &str) -> Result<Vec<(String, String)>, ApiError> {
        let token = if self.refreshed.load(Ordering::SeqCst) {
            "fresh-token"
        } else {
            "stale-token"
        };
        Ok(vec![(
            "Authorization".to_string(),
            format!("Bearer {token}"),
        )])
    }

    async fn refresh(&self, _scope: &str) -> bool {
        self.refreshed.store(true, Ordering::SeqCst);
        true
    }
}

#[tokio::test]
async fn retries_once_with_fresh_headers_after_401() {
    let (addr, server) = scripted_server(vec![
        http_response(401, "expired"),
        http_response(200, r#"{"ok":true}"#),
    ])
    .await;
    let endpoint = BackendEndpoint::new(format!("http://{addr}"), "km-test/0.0.0");
    let client = ApiClient::new(
        endpoint,
        Arc::new(RefreshingHeaders {
            refreshed: AtomicBool::new(false),
        }),
        fast_policy(1),
        Duration::from_secs(5),
    )
    .unwrap();

    client
        .post_accepted("/api/auth/validate", SCOPE_GENERAL, &serde_json::json!({}))
        .await
        .unwrap();

    let seen = server.await.unwrap();
    assert_eq!(seen.len(), 2);
    assert!(seen[0].contains("stale-token"));
    assert!(seen[1].contains("fresh-token"));
}

#[tokio::test]
async fn download_reports_progress() {
    let payload = "binary-ish plugin payload".repeat(10);
    let (addr, server) = scripted_server(vec![http_response(200, &payload)]).await;
    let client = client_for(addr, fast_policy(1));

    let mut last_seen = 0u64;
    let bytes = client
        .download(
            "/api/plugins/download/console",
            SCOPE_GENERAL,
            Duration::from_secs(5),
            &mut |so_far, _total| last_seen = so_far,
        )
        .await
        .unwrap();
    assert_eq!(bytes.len(), payload.len());
    assert_eq!(last_seen, payload.len() as u64);
    server.await.unwrap();
}

#[tokio::test]
async fn tier_gated_download_surfaces_status() {
    let (addr, server) = scripted_server(vec![http_response(401, "tier required")]).await;
    let client = client_for(addr, fast_policy(1));

    let err = client
        .download(
            "/api/plugins/download/pro-only",
            SCOPE_GENERAL,
            Duration::from_secs(5),
            &mut |_, _| {},
        )
        .await
        .unwrap_err();
    assert!(matches!(err, ApiError::Status { status: 401, .. }));
    server.await.unwrap();
}
