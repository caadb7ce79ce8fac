#![forbid(unsafe_code)]
//! Backend HTTP surface for the `km` wiretap: a single-endpoint request
//! executor with pluggable retry, the API-key/bearer token manager, and
//! in-process verification of plugin-scoped EdDSA JWTs.
//!
//! The client is deliberately small: every backend call in the workspace
//! goes through [`ApiClient::post_json`]/[`ApiClient::download`] with
//! headers supplied by a [`HeaderProvider`] (usually the [`TokenManager`]).
//! The one piece of cross-cutting recovery — a single forced refresh after
//! a 401 under a bearer grant — lives inside the client; everything else is
//! explicit `Result` plumbing.

mod client;
mod endpoint;
mod error;
mod jwt;
mod retry;
mod token;
pub mod types;

pub use client::{ApiClient, ApiKeyHeaders, HeaderProvider};
pub use endpoint::BackendEndpoint;
pub use error::ApiError;
pub use jwt::{plugin_signature, JwtClaims, KeyRing, ParseTierError, Tier};
pub use retry::{AttemptOutcome, DefaultRetryPolicy, NoRetry, RetryPolicy};
pub use token::{plugin_scope, TokenBundle, TokenManager, SCOPE_GENERAL};
