//! Wire shapes for the backend HTTP surface. Field names follow the
//! backend's JSON exactly; everything else in the workspace converts at
//! this boundary.

use serde::{Deserialize, Serialize};

use crate::jwt::Tier;

#[derive(Clone, Debug, Serialize)]
pub struct TokenRequest {
    #[serde(rename = "ApiKey")]
    pub api_key: String,
    pub scope: Vec<String>,
}

#[derive(Clone, Debug, Serialize)]
pub struct RefreshRequest {
    pub grant_type: &'static str,
    pub refresh_token: String,
}

impl RefreshRequest {
    pub fn new(refresh_token: impl Into<String>) -> Self {
        Self {
            grant_type: "refresh_token",
            refresh_token: refresh_token.into(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenResponse {
    #[serde(default)]
    pub success: bool,
    pub customer: Option<CustomerInfo>,
    pub token: Option<TokenGrant>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomerInfo {
    pub id: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub organization: String,
    #[serde(default)]
    pub subscription_plan: String,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenGrant {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: String,
    pub access_token_expires_at: String,
    #[serde(default)]
    pub refresh_token_expires_at: String,
    #[serde(default = "default_token_type")]
    pub token_type: String,
    #[serde(default)]
    pub access_token_lifetime_minutes: u64,
}

fn default_token_type() -> String {
    "Bearer".to_string()
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginAuthRequest {
    pub plugin_name: String,
    pub plugin_version: String,
    /// base64(SHA-256("name:version:kilometers-plugins")).
    pub plugin_signature: String,
    pub jwt_token: String,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginAuthResponse {
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub token: String,
    #[serde(default)]
    pub expires_at: String,
    #[serde(default)]
    pub authorized_features: Vec<String>,
    #[serde(default)]
    pub subscription_tier: Tier,
    #[serde(default)]
    pub customer_name: String,
    #[serde(default)]
    pub plugin_version: String,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestRequest {
    pub plugins: Vec<InstalledPlugin>,
    pub platform: PlatformInfo,
    pub cli_version: String,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InstalledPlugin {
    pub name: String,
    pub installed_version: String,
}

#[derive(Clone, Debug, Serialize)]
pub struct PlatformInfo {
    pub os: String,
    pub arch: String,
}

impl PlatformInfo {
    pub fn current() -> Self {
        Self {
            os: std::env::consts::OS.to_string(),
            arch: std::env::consts::ARCH.to_string(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct ManifestResponse {
    #[serde(default)]
    pub plugins: Vec<PluginManifestEntry>,
}

/// One downloadable plugin build as advertised by the backend.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginManifestEntry {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub tier: Tier,
    /// Backend-proxied download URL; may be relative to the base URL.
    pub url: String,
    /// Hex SHA-256 of the binary.
    pub hash: String,
    /// Optional base64 detached EdDSA signature.
    #[serde(default)]
    pub signature: Option<String>,
    #[serde(default)]
    pub size: u64,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProvisionRequest {
    pub plugin_name: String,
    pub platform: PlatformInfo,
    pub cli_version: String,
}
