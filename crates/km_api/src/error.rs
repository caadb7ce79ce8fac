use thiserror::Error;

/// Errors surfaced by the backend client and the auth/JWT layer.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("request to `{url}` failed: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("backend returned status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("invalid backend URL `{0}`")]
    InvalidUrl(String),
    #[error("failed to decode backend response: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("token endpoint rejected the request: {0}")]
    TokenRejected(String),
    #[error("failed to build HTTP client: {0}")]
    ClientBuild(#[source] reqwest::Error),

    // JWT verification failures. Fatal to the plugin load that required
    // them, never to the process.
    #[error("token is not a well-formed JWT")]
    AuthInvalidFormat,
    #[error("unsupported JWT algorithm `{0}`")]
    AuthUnsupportedAlgorithm(String),
    #[error("unsupported JWT type `{0}`")]
    AuthInvalidTokenType(String),
    #[error("JWT header is missing `kid`")]
    AuthMissingKeyId,
    #[error("JWT key id `{0}` is not in the key ring")]
    AuthUnknownKeyId(String),
    #[error("JWT signature verification failed")]
    AuthSignatureInvalid,
    #[error("JWT claims rejected: {0}")]
    AuthInvalidClaims(String),
    #[error("token has expired")]
    AuthTokenExpired,
    #[error("token is bound to plugin `{actual}`, expected `{expected}`")]
    AuthTokenNotForPlugin { expected: String, actual: String },
}

impl ApiError {
    /// Whether the error came out of JWT/claims validation.
    pub fn is_auth_error(&self) -> bool {
        matches!(
            self,
            ApiError::AuthInvalidFormat
                | ApiError::AuthUnsupportedAlgorithm(_)
                | ApiError::AuthInvalidTokenType(_)
                | ApiError::AuthMissingKeyId
                | ApiError::AuthUnknownKeyId(_)
                | ApiError::AuthSignatureInvalid
                | ApiError::AuthInvalidClaims(_)
                | ApiError::AuthTokenExpired
                | ApiError::AuthTokenNotForPlugin { .. }
        )
    }
}
