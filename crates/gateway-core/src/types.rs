// ── Keystone Gateway: Core Data Types ───────────────────────────────────────
// Plain struct/enum definitions for the credential & quota store.
// Mirrors the overloaded historical fields (`refresh_token` / `project_id`
// on local-provider accounts) verbatim — the persisted shape must round-trip
// with existing databases, so the overload is kept at the storage layer and
// exposed through typed accessors below instead of a new enum shape.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Provider {
    Google,
    Anthropic,
    LocalOllama,
    LocalLmstudio,
}

impl Provider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::Google => "google",
            Provider::Anthropic => "anthropic",
            Provider::LocalOllama => "local-ollama",
            Provider::LocalLmstudio => "local-lmstudio",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "google" => Some(Provider::Google),
            "anthropic" => Some(Provider::Anthropic),
            "local-ollama" => Some(Provider::LocalOllama),
            "local-lmstudio" => Some(Provider::LocalLmstudio),
            _ => None,
        }
    }

    /// The "local sovereignty rule" pivots on this prefix check.
    pub fn is_local(&self) -> bool {
        self.as_str().starts_with("local-")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountStatus {
    Active,
    Refreshing,
    RateLimited,
    Error,
}

impl Default for AccountStatus {
    fn default() -> Self {
        AccountStatus::Active
    }
}

/// Token sub-record. For local-provider accounts `refresh_token` carries the
/// upstream base URL and `project_id` carries the model identifier — this
/// overloading is historical but load-bearing and must be preserved.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenRecord {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_in: i64,
    /// Absolute Unix-seconds expiry. Refresh only ever moves this forward.
    pub expiry_timestamp: i64,
    pub token_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    /// Provider-specific overflow fields that don't warrant a dedicated column.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub extra: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelQuota {
    pub percentage: u8,
    pub reset_time: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_token_allowed: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_completion_tokens: Option<u64>,
}

/// Canonical model id → quota. `HashMap` rather than a fixed struct because
/// the set of models is open-ended and provider-defined.
pub type QuotaMap = HashMap<String, ModelQuota>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub id: String,
    pub provider: Provider,
    pub email: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
    pub token: TokenRecord,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quota: Option<QuotaMap>,
    pub created_at: i64,
    pub last_used: i64,
    pub status: AccountStatus,
    pub is_active: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub selected_models: Vec<String>,
}

impl Account {
    /// For local-provider accounts, `refresh_token` is overloaded to carry
    /// the upstream base URL.
    pub fn local_base_url(&self) -> Option<&str> {
        self.provider.is_local().then_some(self.token.refresh_token.as_str())
    }

    /// For local-provider accounts, `project_id` is overloaded to carry the
    /// upstream model identifier.
    pub fn local_model(&self) -> Option<&str> {
        if !self.provider.is_local() {
            return None;
        }
        self.token.project_id.as_deref()
    }

    /// Average quota percentage across known models; `None` when quota is
    /// entirely unknown (discovery treats this as "assume healthy", health
    /// scoring treats it as zero weight — see `health_score`).
    pub fn avg_quota_percent(&self) -> Option<f64> {
        let quota = self.quota.as_ref()?;
        if quota.is_empty() {
            return None;
        }
        let sum: u32 = quota.values().map(|q| q.percentage as u32).sum();
        Some(sum as f64 / quota.len() as f64)
    }

    /// 0–100 health score used by the auto-switcher.
    pub fn health_score(&self) -> f64 {
        if self.quota.is_none() || matches!(self.status, AccountStatus::RateLimited | AccountStatus::Error) {
            return 0.0;
        }
        let avg = self.avg_quota_percent().unwrap_or(0.0);
        let status_bonus = match self.status {
            AccountStatus::Active => 40.0,
            AccountStatus::Refreshing => 20.0,
            AccountStatus::RateLimited | AccountStatus::Error => 0.0,
        };
        (0.6 * avg + status_bonus).clamp(0.0, 100.0)
    }

    /// Normalise a requested model id the way the token manager's model
    /// filter does: strip an optional `models/` prefix, case-fold.
    pub fn normalize_model(model: &str) -> String {
        model.strip_prefix("models/").unwrap_or(model).to_lowercase()
    }

    /// Whether this account's `selected_models` filter (if any) accepts the
    /// requested model. Empty `selected_models` means "no filter".
    pub fn accepts_model(&self, requested_model: Option<&str>) -> bool {
        let Some(requested) = requested_model else {
            return true;
        };
        if self.selected_models.is_empty() {
            return true;
        }
        let normalized = Self::normalize_model(requested);
        self.selected_models
            .iter()
            .any(|m| Self::normalize_model(m) == normalized)
    }
}

/// Semantic-cache entry, keyed by `(id, prompt_hash)` at the storage layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub id: String,
    pub prompt_hash: String,
    pub prompt_text: String,
    /// Fixed-width, assumed unit-normalised embedding vector.
    pub embedding: Vec<f32>,
    pub response_text: String,
    pub model: String,
    pub created_at: i64,
}

/// Dot product of two equal-length vectors. Callers are responsible for
/// ensuring unit normalisation — the store does not re-normalise.
pub fn dot_product(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}
