// ── Keystone Gateway: Upstream Providers ────────────────────────────────────
// Dispatches by `Provider` kind: Google participates in the OAuth
// refresh/project-id flow over cloud-code endpoints, local providers speak
// OpenAI-compatible HTTP directly, Anthropic (no refresh_token flow in
// practice — see DESIGN.md) is treated as a no-op refresh target.

pub mod google;
pub mod local;

use crate::error::GatewayResult;
use crate::token_manager::{RefreshedToken, TokenRefresher};
use crate::types::{Account, Provider};

/// Google OAuth client credentials. In production these come from the
/// gateway's own registered OAuth client (baked in alongside the IDE
/// masquerade identity); kept as plain fields here rather than `Config` so
/// tests can substitute fixtures.
pub struct OAuthClientCredentials {
    pub client_id: String,
    pub client_secret: String,
}

pub struct GatewayRefresher {
    pub client: reqwest::Client,
    pub google_oauth: OAuthClientCredentials,
}

impl TokenRefresher for GatewayRefresher {
    fn refresh(&self, account: &Account) -> GatewayResult<RefreshedToken> {
        match account.provider {
            Provider::Google => {
                let handle = tokio::runtime::Handle::try_current()
                    .map_err(|e| format!("refresh requires a tokio runtime: {e}"))?;
                let outcome = tokio::task::block_in_place(|| {
                    handle.block_on(google::refresh_token(
                        &self.client,
                        &self.google_oauth.client_id,
                        &self.google_oauth.client_secret,
                        &account.token.refresh_token,
                    ))
                })?;
                Ok(RefreshedToken { access_token: outcome.access_token, expires_in: outcome.expires_in })
            }
            Provider::Anthropic | Provider::LocalOllama | Provider::LocalLmstudio => {
                Err("no refresh flow for this provider".into())
            }
        }
    }

    fn fetch_project_id(&self, account: &Account) -> GatewayResult<Option<String>> {
        match account.provider {
            // Both google and anthropic accounts resolve a project id; the
            // only discovery endpoint this system has is Google's
            // cloud-code one, so both reuse it (see DESIGN.md).
            Provider::Google | Provider::Anthropic => {
                let handle = tokio::runtime::Handle::try_current()
                    .map_err(|e| format!("fetch_project_id requires a tokio runtime: {e}"))?;
                tokio::task::block_in_place(|| {
                    handle.block_on(google::load_code_assist(&self.client, &account.token.access_token))
                })
            }
            Provider::LocalOllama | Provider::LocalLmstudio => Ok(None),
        }
    }
}
