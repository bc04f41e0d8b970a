// ── Keystone Gateway: Shared Application State ──────────────────────────────
// Aggregates store/token-manager/proxy/config behind one `Arc` for axum
// handlers. Bootstrap guards against a second instance binding the same
// port — the OS-level `bind()` failure is translated into `ConfigError`
// rather than panicking.

use std::sync::Arc;

use crate::config::GatewayConfig;
use crate::proxy::Proxy;
use crate::store::Store;
use crate::token_manager::TokenManager;

pub struct AppState {
    pub config: GatewayConfig,
    pub store: Arc<Store>,
    pub token_manager: Arc<TokenManager>,
    pub proxy: Arc<Proxy>,
}

impl AppState {
    pub fn new(
        config: GatewayConfig,
        store: Arc<Store>,
        token_manager: Arc<TokenManager>,
        proxy: Arc<Proxy>,
    ) -> Arc<Self> {
        Arc::new(AppState { config, store, token_manager, proxy })
    }
}
