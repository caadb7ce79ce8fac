use std::{collections::HashMap, time::Duration};

use async_trait::async_trait;
use time::OffsetDateTime;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::{
    client::HeaderProvider,
    endpoint::BackendEndpoint,
    error::ApiError,
    types::{RefreshRequest, TokenRequest, TokenResponse},
};

/// Scope key for general (non-plugin) API use.
pub const SCOPE_GENERAL: &str = "api";

/// Scope key for a plugin-bound token.
pub fn plugin_scope(plugin_name: &str) -> String {
    format!("plugin:{plugin_name}")
}

/// A bundle is refreshed this long before its nominal expiry.
const REFRESH_SKEW: Duration = Duration::from_secs(120);

/// Deadline for token endpoint round trips, independent of the general
/// client timeout.
const TOKEN_FETCH_TIMEOUT: Duration = Duration::from_secs(30);

/// A cached grant for one scope.
#[derive(Clone, Debug)]
pub struct TokenBundle {
    pub access_token: String,
    pub refresh_token: String,
    pub token_type: String,
    pub issued_at: OffsetDateTime,
    pub expires_at: OffsetDateTime,
    pub scopes: Vec<String>,
}

impl TokenBundle {
    /// Valid means usable without a refresh: inside the expiry window with
    /// skew subtracted.
    pub fn is_valid(&self) -> bool {
        OffsetDateTime::now_utc() < self.expires_at - REFRESH_SKEW
    }
}

/// Exchanges the static API key for short-lived bearer tokens and caches
/// them per scope. Reads take the common path; refreshes are rare writes.
pub struct TokenManager {
    http: reqwest::Client,
    endpoint: BackendEndpoint,
    api_key: String,
    cache: RwLock<HashMap<String, TokenBundle>>,
}

impl TokenManager {
    pub fn new(endpoint: BackendEndpoint, api_key: impl Into<String>) -> Result<Self, ApiError> {
        let http = reqwest::Client::builder()
            .user_agent(endpoint.user_agent())
            .timeout(TOKEN_FETCH_TIMEOUT)
            .build()
            .map_err(ApiError::ClientBuild)?;
        Ok(Self {
            http,
            endpoint,
            api_key: api_key.into(),
            cache: RwLock::new(HashMap::new()),
        })
    }

    pub fn api_key(&self) -> &str {
        &self.api_key
    }

    /// Returns a token for the scope, refreshing when inside the skew
    /// window.
    pub async fn get_valid_token(&self, scope: &str) -> Result<TokenBundle, ApiError> {
        {
            let cache = self.cache.read().await;
            if let Some(bundle) = cache.get(scope) {
                if bundle.is_valid() {
                    return Ok(bundle.clone());
                }
            }
        }
        self.force_refresh(scope).await
    }

    /// Bypasses the cache: refresh grant when one is held, fresh exchange
    /// otherwise. The cache entry is replaced atomically.
    pub async fn force_refresh(&self, scope: &str) -> Result<TokenBundle, ApiError> {
        let refresh_token = {
            let cache = self.cache.read().await;
            cache
                .get(scope)
                .map(|bundle| bundle.refresh_token.clone())
                .filter(|token| !token.is_empty())
        };

        let bundle = match refresh_token {
            Some(refresh_token) => match self.refresh_grant(scope, refresh_token).await {
                Ok(bundle) => bundle,
                Err(err) => {
                    debug!(scope, error = %err, "refresh grant failed, falling back to key exchange");
                    self.exchange_api_key(scope).await?
                }
            },
            None => self.exchange_api_key(scope).await?,
        };

        let mut cache = self.cache.write().await;
        cache.insert(scope.to_string(), bundle.clone());
        Ok(bundle)
    }

    pub async fn clear_cache(&self) {
        self.cache.write().await.clear();
    }

    /// Headers for an outgoing request under `scope`: the raw key always
    /// (primary auth), plus a bearer grant for general API scopes.
    pub async fn headers(&self, scope: &str) -> Result<Vec<(String, String)>, ApiError> {
        let mut headers = Vec::new();
        if self.api_key.is_empty() {
            return Ok(headers);
        }
        headers.push(("X-API-Key".to_string(), self.api_key.clone()));
        if !scope.starts_with("plugin:") {
            match self.get_valid_token(scope).await {
                Ok(bundle) => headers.push((
                    "Authorization".to_string(),
                    format!("{} {}", bundle.token_type, bundle.access_token),
                )),
                Err(err) => {
                    // The key header alone still authenticates most
                    // endpoints; degrade rather than fail the request.
                    warn!(scope, error = %err, "bearer token unavailable");
                }
            }
        }
        Ok(headers)
    }

    /// Probes `GET /api/auth/validate` with the current bearer token.
    pub async fn validate_token(&self) -> Result<bool, ApiError> {
        let bundle = self.get_valid_token(SCOPE_GENERAL).await?;
        let url = self.endpoint.join("/api/auth/validate");
        let response = self
            .http
            .get(&url)
            .header("X-API-Key", &self.api_key)
            .header(
                "Authorization",
                format!("{} {}", bundle.token_type, bundle.access_token),
            )
            .send()
            .await
            .map_err(|source| ApiError::Transport {
                url: url.clone(),
                source,
            })?;
        Ok(response.status().is_success())
    }

    async fn exchange_api_key(&self, scope: &str) -> Result<TokenBundle, ApiError> {
        let body = TokenRequest {
            api_key: self.api_key.clone(),
            scope: vec![scope.to_string()],
        };
        self.post_token_request(&serde_json::to_value(&body)?, scope)
            .await
    }

    async fn refresh_grant(
        &self,
        scope: &str,
        refresh_token: String,
    ) -> Result<TokenBundle, ApiError> {
        let body = RefreshRequest::new(refresh_token);
        self.post_token_request(&serde_json::to_value(&body)?, scope)
            .await
    }

    async fn post_token_request(
        &self,
        body: &serde_json::Value,
        scope: &str,
    ) -> Result<TokenBundle, ApiError> {
        let url = self.endpoint.join("/api/auth/token");
        let response = self
            .http
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(|source| ApiError::Transport {
                url: url.clone(),
                source,
            })?;

        let status = response.status().as_u16();
        if !response.status().is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ApiError::Status { status, body });
        }

        let parsed: TokenResponse = response
            .json()
            .await
            .map_err(|source| ApiError::Transport { url, source })?;
        bundle_from_response(parsed, scope)
    }
}

fn bundle_from_response(response: TokenResponse, scope: &str) -> Result<TokenBundle, ApiError> {
    if !response.success {
        return Err(ApiError::TokenRejected(format!(
            "token grant denied for scope `{scope}`"
        )));
    }
    let grant = response
        .token
        .ok_or_else(|| ApiError::TokenRejected("response carried no token".into()))?;

    let expires_at = OffsetDateTime::parse(
        &grant.access_token_expires_at,
        &time::format_description::well_known::Rfc3339,
    )
    .map_err(|err| ApiError::TokenRejected(format!("unparseable expiry: {err}")))?;

    let issued_at = OffsetDateTime::now_utc();
    if expires_at <= issued_at {
        return Err(ApiError::TokenRejected("grant already expired".into()));
    }

    Ok(TokenBundle {
        access_token: grant.access_token,
        refresh_token: grant.refresh_token,
        token_type: grant.token_type,
        issued_at,
        expires_at,
        scopes: vec![scope.to_string()],
    })
}

#[async_trait]
impl HeaderProvider for TokenManager {
    async fn headers(&self, scope: &str) -> Result<Vec<(String, String)>, ApiError> {
        TokenManager::headers(self, scope).await
    }

    async fn refresh(&self, scope: &str) -> bool {
        self.force_refresh(scope).await.is_ok()
    }
}
