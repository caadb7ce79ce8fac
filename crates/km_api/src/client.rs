use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use futures::StreamExt;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::{
    endpoint::BackendEndpoint,
    error::ApiError,
    retry::{AttemptOutcome, RetryPolicy},
};

/// Supplies authorization headers per request scope, and optionally a
/// forced refresh after a 401 under a bearer grant.
#[async_trait]
pub trait HeaderProvider: Send + Sync {
    async fn headers(&self, scope: &str) -> Result<Vec<(String, String)>, ApiError>;

    /// Invoked once after a 401. Returning true asks the client to retry
    /// the request with freshly minted headers.
    async fn refresh(&self, _scope: &str) -> bool {
        false
    }
}

/// Static-key provider: `X-API-Key` only, nothing to refresh.
pub struct ApiKeyHeaders {
    api_key: String,
}

impl ApiKeyHeaders {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
        }
    }
}

#[async_trait]
impl HeaderProvider for ApiKeyHeaders {
    async fn headers(&self, _scope: &str) -> Result<Vec<(String, String)>, ApiError> {
        if self.api_key.is_empty() {
            return Ok(Vec::new());
        }
        Ok(vec![("X-API-Key".to_string(), self.api_key.clone())])
    }
}

/// Single-endpoint request executor with retry and auth-header injection.
///
/// One instance serves all backend calls of a wrapper invocation; retry
/// behavior is delegated to the configured [`RetryPolicy`], with a single
/// forced header refresh on 401 handled locally here.
pub struct ApiClient {
    http: reqwest::Client,
    endpoint: BackendEndpoint,
    headers: Arc<dyn HeaderProvider>,
    policy: Arc<dyn RetryPolicy>,
}

impl ApiClient {
    pub fn new(
        endpoint: BackendEndpoint,
        headers: Arc<dyn HeaderProvider>,
        policy: Arc<dyn RetryPolicy>,
        timeout: Duration,
    ) -> Result<Self, ApiError> {
        let http = reqwest::Client::builder()
            .user_agent(endpoint.user_agent())
            .timeout(timeout)
            .build()
            .map_err(ApiError::ClientBuild)?;
        Ok(Self {
            http,
            endpoint,
            headers,
            policy,
        })
    }

    pub fn endpoint(&self) -> &BackendEndpoint {
        &self.endpoint
    }

    /// POST a JSON body, decode a JSON response.
    pub async fn post_json<B, R>(&self, path: &str, scope: &str, body: &B) -> Result<R, ApiError>
    where
        B: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let body = serde_json::to_value(body)?;
        let response = self
            .execute(reqwest::Method::POST, path, scope, &[], Some(&body), None)
            .await?;
        let bytes = response.bytes().await.map_err(|source| ApiError::Transport {
            url: self.endpoint.join(path),
            source,
        })?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// POST a JSON body where only a 2xx acknowledgement matters.
    pub async fn post_accepted<B>(&self, path: &str, scope: &str, body: &B) -> Result<(), ApiError>
    where
        B: Serialize + ?Sized,
    {
        let body = serde_json::to_value(body)?;
        self.execute(reqwest::Method::POST, path, scope, &[], Some(&body), None)
            .await?;
        Ok(())
    }

    /// GET returning only the final status code; non-2xx is not an error
    /// here (used for token validation probes).
    pub async fn get_status(&self, path: &str, scope: &str) -> Result<u16, ApiError> {
        match self
            .execute(reqwest::Method::GET, path, scope, &[], None, None)
            .await
        {
            Ok(response) => Ok(response.status().as_u16()),
            Err(ApiError::Status { status, .. }) => Ok(status),
            Err(err) => Err(err),
        }
    }

    /// Streams a download into memory with a progress callback
    /// `(bytes_so_far, total_if_known)`. Accepts absolute URLs or paths
    /// relative to the endpoint; tier-gated 401/403 surface as
    /// [`ApiError::Status`].
    pub async fn download(
        &self,
        url: &str,
        scope: &str,
        timeout: Duration,
        progress: &mut dyn FnMut(u64, Option<u64>),
    ) -> Result<Vec<u8>, ApiError> {
        let full = self.endpoint.join(url);
        let response = self
            .execute(reqwest::Method::GET, url, scope, &[], None, Some(timeout))
            .await?;

        let total = response.content_length();
        let mut bytes: Vec<u8> = Vec::new();
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|source| ApiError::Transport {
                url: full.clone(),
                source,
            })?;
            bytes.extend_from_slice(&chunk);
            progress(bytes.len() as u64, total);
        }
        Ok(bytes)
    }

    async fn execute(
        &self,
        method: reqwest::Method,
        path: &str,
        scope: &str,
        query: &[(&str, &str)],
        body: Option<&Value>,
        timeout: Option<Duration>,
    ) -> Result<reqwest::Response, ApiError> {
        let url = self.endpoint.join(path);
        let mut attempt: u32 = 0;
        let mut refreshed = false;

        loop {
            attempt += 1;
            let mut request = self.http.request(method.clone(), &url);
            if !query.is_empty() {
                request = request.query(query);
            }
            if let Some(timeout) = timeout {
                request = request.timeout(timeout);
            }
            for (name, value) in self.headers.headers(scope).await? {
                request = request.header(&name, &value);
            }
            if let Some(body) = body {
                request = request.json(body);
            }

            match request.send().await {
                Ok(response) if response.status().is_success() => return Ok(response),
                Ok(response) => {
                    let status = response.status().as_u16();
                    if status == 401 && !refreshed {
                        refreshed = true;
                        if self.headers.refresh(scope).await {
                            debug!(url = url.as_str(), "retrying once after forced auth refresh");
                            continue;
                        }
                    }
                    let retry_after = parse_retry_after(&response);
                    let outcome = AttemptOutcome {
                        status: Some(status),
                        retry_after,
                        transport: false,
                    };
                    match self.policy.decide(&outcome, attempt) {
                        Some(backoff) => {
                            warn!(url = url.as_str(), status, attempt, "retrying after backoff");
                            tokio::time::sleep(backoff).await;
                        }
                        None => {
                            let body = response.text().await.unwrap_or_default();
                            return Err(ApiError::Status { status, body });
                        }
                    }
                }
                Err(source) => {
                    let outcome = AttemptOutcome {
                        status: None,
                        retry_after: None,
                        transport: true,
                    };
                    match self.policy.decide(&outcome, attempt) {
                        Some(backoff) => {
                            warn!(url = url.as_str(), attempt, error = %source, "transport error, retrying");
                            tokio::time::sleep(backoff).await;
                        }
                        None => return Err(ApiError::Transport { url, source }),
                    }
                }
            }
        }
    }
}

fn parse_retry_after(response: &reqwest::Response) -> Option<Duration> {
    response
        .headers()
        .get(reqwest::header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}
