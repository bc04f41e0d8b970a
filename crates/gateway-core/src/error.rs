// ── Keystone Gateway: Error Types ───────────────────────────────────────────
// Single canonical error enum for the gateway core, built with `thiserror`.
//
// Design rules:
//   • Variants are coarse-grained by domain (I/O, Store, Upstream, Config…).
//   • The `#[from]` attribute wires std/external error conversions automatically.
//   • No variant carries secret material (access tokens, API keys) in its message.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum GatewayError {
    /// Filesystem or OS-level I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization / deserialization failure.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// TOML configuration parse failure.
    #[error("Configuration error: {0}")]
    Config(String),

    /// SQLite / rusqlite database failure.
    #[error("Storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    /// Decryption of a single persisted row failed. Carries the row id so the
    /// caller can skip just that row instead of failing the whole read.
    #[error("Decrypt error for row {id}: {message}")]
    Decrypt { id: String, message: String },

    /// OS keychain / credential store failure.
    #[error("Keyring error: {0}")]
    Keyring(String),

    /// HTTP / network failure (reqwest layer).
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    /// 401/403 from an upstream provider. Never retried.
    #[error("Upstream auth error ({provider}): {message}")]
    UpstreamAuth { provider: String, message: String },

    /// 429 or a quota/limit-shaped error message from an upstream provider.
    #[error("Upstream rate limited ({provider}): {message}")]
    UpstreamRateLimit {
        provider: String,
        message: String,
        retry_after_secs: Option<u64>,
    },

    /// Network failure, 5xx, or timeout from an upstream provider.
    #[error("Upstream transient error ({provider}): {message}")]
    UpstreamTransient { provider: String, message: String },

    /// Non-retryable, non-auth, non-rate-limit API error from upstream.
    #[error("Upstream API error ({provider}, status {status}): {message}")]
    UpstreamApi {
        provider: String,
        status: u16,
        message: String,
    },

    /// Upstream closed an SSE stream without emitting any data.
    #[error("Empty response stream")]
    EmptyStream,

    /// No candidate account survived selection for the requested model.
    #[error("No available accounts for model '{model}'")]
    NoAccount { model: String },

    /// Malformed inbound client request.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Catch-all for errors that do not yet have a dedicated variant.
    #[error("{0}")]
    Other(String),
}

impl From<String> for GatewayError {
    fn from(s: String) -> Self {
        GatewayError::Other(s)
    }
}

impl From<&str> for GatewayError {
    fn from(s: &str) -> Self {
        GatewayError::Other(s.to_string())
    }
}

pub type GatewayResult<T> = Result<T, GatewayError>;

impl GatewayError {
    pub fn is_rate_limited_shaped(message: &str) -> bool {
        let lower = message.to_lowercase();
        lower.contains("429")
            || lower.contains("quota")
            || lower.contains("limit")
            || lower.contains("resource_exhausted")
    }
}
