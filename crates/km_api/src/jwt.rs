use std::{collections::HashMap, fmt, str::FromStr};

use base64::Engine as _;
use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use time::OffsetDateTime;

use crate::error::ApiError;

const URL_SAFE: base64::engine::GeneralPurpose = base64::engine::general_purpose::URL_SAFE_NO_PAD;

/// Subscription tier. Ordering is the authorization lattice: a user may run
/// a plugin iff their tier is at least the plugin's required tier.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum Tier {
    #[default]
    Free,
    Pro,
    Enterprise,
}

impl Tier {
    pub fn as_str(self) -> &'static str {
        match self {
            Tier::Free => "Free",
            Tier::Pro => "Pro",
            Tier::Enterprise => "Enterprise",
        }
    }

    /// The tier-gating decision: sufficient level and an explicit grant.
    pub fn satisfies(self, required: Tier, authorized: bool) -> bool {
        authorized && self >= required
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown tier `{0}`")]
pub struct ParseTierError(String);

impl FromStr for Tier {
    type Err = ParseTierError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.to_ascii_lowercase().as_str() {
            "free" => Ok(Tier::Free),
            "pro" => Ok(Tier::Pro),
            "enterprise" => Ok(Tier::Enterprise),
            _ => Err(ParseTierError(raw.to_string())),
        }
    }
}

impl Serialize for Tier {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Tier {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Deserialize)]
struct JwtHeader {
    alg: String,
    typ: Option<String>,
    kid: Option<String>,
}

/// Claims carried by backend-issued plugin tokens.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JwtClaims {
    pub sub: String,
    pub iat: i64,
    pub exp: i64,
    #[serde(default)]
    pub jti: String,
    #[serde(default)]
    pub iss: String,
    #[serde(default)]
    pub aud: String,
    #[serde(rename = "customerId", alias = "customer_id", default)]
    pub customer_id: String,
    #[serde(rename = "pluginName", alias = "plugin_name", default)]
    pub plugin_name: String,
    #[serde(rename = "pluginVersion", alias = "plugin_version", default)]
    pub plugin_version: String,
    #[serde(default)]
    pub tier: Tier,
    #[serde(default)]
    pub features: Vec<String>,
    #[serde(rename = "tokenType", alias = "token_type", default)]
    pub token_type: String,
}

/// The wrapper's embedded set of trusted EdDSA public keys, keyed by the
/// JWT `kid` header value. Also used for detached binary signatures.
#[derive(Clone, Debug, Default)]
pub struct KeyRing {
    keys: HashMap<String, VerifyingKey>,
}

/// Production signing keys. Rotations append here; revocations remove.
const EMBEDDED_KEYS: &[(&str, &str)] = &[(
    "km-2025-01",
    "c83720380f50470212f2d68e7ca0669fb24769a5bfa62bec98884c34588aba93",
)];

impl KeyRing {
    pub fn new() -> Self {
        Self::default()
    }

    /// The compiled-in production key ring.
    pub fn embedded() -> Self {
        let mut ring = Self::new();
        for (kid, hex_key) in EMBEDDED_KEYS {
            // Embedded constants are validated by tests; a malformed entry
            // is simply absent from the ring.
            let _ = ring.insert_hex(*kid, *hex_key);
        }
        ring
    }

    pub fn insert(&mut self, kid: impl Into<String>, key: [u8; 32]) -> Result<(), ApiError> {
        let key = VerifyingKey::from_bytes(&key)
            .map_err(|_| ApiError::AuthInvalidClaims("invalid public key bytes".into()))?;
        self.keys.insert(kid.into(), key);
        Ok(())
    }

    pub fn insert_hex(&mut self, kid: impl Into<String>, hex_key: &str) -> Result<(), ApiError> {
        let raw = hex::decode(hex_key)
            .map_err(|_| ApiError::AuthInvalidClaims("public key is not valid hex".into()))?;
        let bytes: [u8; 32] = raw
            .try_into()
            .map_err(|_| ApiError::AuthInvalidClaims("public key must be 32 bytes".into()))?;
        self.insert(kid, bytes)
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn contains(&self, kid: &str) -> bool {
        self.keys.contains_key(kid)
    }

    /// Full JWT verification: structure, header, signature, claims.
    pub fn verify(&self, token: &str) -> Result<JwtClaims, ApiError> {
        let mut parts = token.split('.');
        let (header_b64, payload_b64, signature_b64) =
            match (parts.next(), parts.next(), parts.next(), parts.next()) {
                (Some(h), Some(p), Some(s), None) if !h.is_empty() && !p.is_empty() => (h, p, s),
                _ => return Err(ApiError::AuthInvalidFormat),
            };

        let header_raw = URL_SAFE
            .decode(header_b64)
            .map_err(|_| ApiError::AuthInvalidFormat)?;
        let header: JwtHeader =
            serde_json::from_slice(&header_raw).map_err(|_| ApiError::AuthInvalidFormat)?;

        if header.alg != "EdDSA" {
            return Err(ApiError::AuthUnsupportedAlgorithm(header.alg));
        }
        match header.typ.as_deref() {
            Some("JWT") => {}
            Some(other) => return Err(ApiError::AuthInvalidTokenType(other.to_string())),
            None => return Err(ApiError::AuthInvalidTokenType("missing".to_string())),
        }
        let kid = header.kid.ok_or(ApiError::AuthMissingKeyId)?;
        let key = self
            .keys
            .get(&kid)
            .ok_or_else(|| ApiError::AuthUnknownKeyId(kid.clone()))?;

        let signature_raw = URL_SAFE
            .decode(signature_b64)
            .map_err(|_| ApiError::AuthInvalidFormat)?;
        let signature =
            Signature::from_slice(&signature_raw).map_err(|_| ApiError::AuthInvalidFormat)?;
        let signed = format!("{header_b64}.{payload_b64}");
        key.verify(signed.as_bytes(), &signature)
            .map_err(|_| ApiError::AuthSignatureInvalid)?;

        let payload_raw = URL_SAFE
            .decode(payload_b64)
            .map_err(|_| ApiError::AuthInvalidFormat)?;
        let claims: JwtClaims = serde_json::from_slice(&payload_raw)
            .map_err(|err| ApiError::AuthInvalidClaims(err.to_string()))?;

        validate_claims(&claims)?;
        Ok(claims)
    }

    /// Verifies a token and checks its plugin binding.
    pub fn verify_for_plugin(
        &self,
        token: &str,
        expected_plugin: &str,
    ) -> Result<JwtClaims, ApiError> {
        let claims = self.verify(token)?;
        if claims.plugin_name != expected_plugin {
            return Err(ApiError::AuthTokenNotForPlugin {
                expected: expected_plugin.to_string(),
                actual: claims.plugin_name,
            });
        }
        Ok(claims)
    }

    /// Verifies a detached signature against any trusted key. Used for
    /// plugin binary `.sig` sidecars, where the signing key is not named.
    pub fn verify_detached(&self, message: &[u8], signature: &[u8]) -> Result<(), ApiError> {
        let signature =
            Signature::from_slice(signature).map_err(|_| ApiError::AuthInvalidFormat)?;
        for key in self.keys.values() {
            if key.verify(message, &signature).is_ok() {
                return Ok(());
            }
        }
        Err(ApiError::AuthSignatureInvalid)
    }
}

fn validate_claims(claims: &JwtClaims) -> Result<(), ApiError> {
    if claims.token_type != "plugin" {
        return Err(ApiError::AuthInvalidClaims(format!(
            "token type `{}` is not a plugin token",
            claims.token_type
        )));
    }
    if claims.customer_id.is_empty() {
        return Err(ApiError::AuthInvalidClaims("missing customer id".into()));
    }
    if claims.exp <= claims.iat {
        return Err(ApiError::AuthInvalidClaims(
            "expiry precedes issuance".into(),
        ));
    }
    let now = OffsetDateTime::now_utc().unix_timestamp();
    if claims.exp <= now {
        return Err(ApiError::AuthTokenExpired);
    }
    Ok(())
}

/// The plugin identity digest the backend expects on
/// `/api/plugins/authenticate`: base64(SHA-256("name:version:kilometers-plugins")).
pub fn plugin_signature(name: &str, version: &str) -> String {
    let digest = Sha256::digest(format!("{name}:{version}:kilometers-plugins").as_bytes());
    base64::engine::general_purpose::STANDARD.encode(digest)
}
