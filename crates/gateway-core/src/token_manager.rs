// ── Keystone Gateway: Token Manager ─────────────────────────────────────────
// In-memory `HashMap<AccountId, Account>` behind one `parking_lot::Mutex`,
// round-robin index and cooldown map guarded by the same lock. Degrades
// instead of throwing for expected operational conditions — refresh
// failure and a missing project id are not errors, they're states the
// proxy layer reacts to.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;

use crate::error::GatewayResult;
use crate::store::Store;
use crate::types::Account;

const COOLDOWN_SECS: i64 = 5 * 60;
const REFRESH_WINDOW_SECS: i64 = 300;

fn now() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs() as i64
}

struct Inner {
    accounts: HashMap<String, Account>,
    cooldowns: HashMap<String, i64>,
    round_robin_index: usize,
}

pub struct TokenManager {
    store: Arc<Store>,
    inner: Mutex<Inner>,
}

/// Hook for refreshing an OAuth token and resolving a provider-side project
/// id. Kept as a trait so `token_manager` doesn't depend directly on
/// `providers`/`http` — tests supply a stub, production wires the real
/// Google/Anthropic clients.
pub trait TokenRefresher: Send + Sync {
    fn refresh(&self, account: &Account) -> GatewayResult<RefreshedToken>;
    fn fetch_project_id(&self, account: &Account) -> GatewayResult<Option<String>>;
}

pub struct RefreshedToken {
    pub access_token: String,
    pub expires_in: i64,
}

impl TokenManager {
    pub fn new(store: Arc<Store>) -> Self {
        TokenManager {
            store,
            inner: Mutex::new(Inner { accounts: HashMap::new(), cooldowns: HashMap::new(), round_robin_index: 0 }),
        }
    }

    /// Bulk-loads all accounts from the store. Called at startup and
    /// on-demand whenever the map is found empty.
    pub fn load(&self) -> GatewayResult<()> {
        let accounts = self.store.list()?;
        let mut inner = self.inner.lock();
        inner.accounts = accounts.into_iter().map(|a| (a.id.clone(), a)).collect();
        Ok(())
    }

    pub fn count(&self) -> usize {
        self.inner.lock().accounts.len()
    }

    pub fn mark_rate_limited(&self, email: &str) {
        let mut inner = self.inner.lock();
        inner.cooldowns.insert(email.to_string(), now() + COOLDOWN_SECS);
    }

    pub fn reset_cooldown(&self, email: &str) {
        self.inner.lock().cooldowns.remove(email);
    }

    /// The selection routine: cooldown filter → model filter → local
    /// sovereignty pin → round-robin → expiry-triggered refresh → project-id
    /// resolution. Returns `None` only when no account survives filtering.
    pub fn get_next(
        &self,
        requested_model: Option<&str>,
        refresher: &dyn TokenRefresher,
    ) -> GatewayResult<Option<Account>> {
        if self.count() == 0 {
            self.load()?;
            if self.count() == 0 {
                return Ok(None);
            }
        }

        let chosen_id = {
            let mut inner = self.inner.lock();
            let t = now();
            let candidate_ids: Vec<String> = inner
                .accounts
                .values()
                .filter(|a| *inner.cooldowns.get(&a.email).unwrap_or(&0) <= t)
                .filter(|a| a.accepts_model(requested_model))
                .map(|a| a.id.clone())
                .collect();

            if candidate_ids.is_empty() {
                return Ok(None);
            }

            // Local sovereignty rule: an active local-provider account
            // preempts round-robin entirely.
            let pinned = candidate_ids
                .iter()
                .find(|id| {
                    let a = &inner.accounts[*id];
                    a.is_active && a.provider.is_local()
                })
                .cloned();

            if let Some(id) = pinned {
                id
            } else {
                let idx = inner.round_robin_index % candidate_ids.len();
                inner.round_robin_index = inner.round_robin_index.wrapping_add(1);
                candidate_ids[idx].clone()
            }
        };

        let mut account = self.inner.lock().accounts.get(&chosen_id).cloned().expect("chosen id must exist");

        if account.token.expiry_timestamp < now() + REFRESH_WINDOW_SECS {
            match refresher.refresh(&account) {
                Ok(refreshed) => {
                    account.token.access_token = refreshed.access_token;
                    account.token.expires_in = refreshed.expires_in;
                    account.token.expiry_timestamp = now() + refreshed.expires_in;
                    self.store.update_token(&account.id, &account.token)?;
                    self.inner.lock().accounts.insert(account.id.clone(), account.clone());
                }
                Err(e) => {
                    log::warn!("token refresh failed for {}: {e} (returning expiring token anyway)", account.email);
                }
            }
        }

        if account.token.project_id.is_none()
            && matches!(account.provider, crate::types::Provider::Google | crate::types::Provider::Anthropic)
        {
            let resolved = refresher.fetch_project_id(&account).unwrap_or(None);
            let project_id = resolved.unwrap_or_else(|| format!("cloud-code-{}", local_part(&account.email)));
            account.token.project_id = Some(project_id);
            self.store.update_token(&account.id, &account.token)?;
            self.inner.lock().accounts.insert(account.id.clone(), account.clone());
        }

        Ok(Some(account))
    }
}

fn local_part(email: &str) -> &str {
    email.split('@').next().unwrap_or(email)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AccountStatus, Provider, TokenRecord};
    use std::collections::HashMap as StdHashMap;

    struct NoopRefresher;
    impl TokenRefresher for NoopRefresher {
        fn refresh(&self, _account: &Account) -> GatewayResult<RefreshedToken> {
            Err("refresh unavailable in test".into())
        }
        fn fetch_project_id(&self, _account: &Account) -> GatewayResult<Option<String>> {
            Ok(None)
        }
    }

    struct SucceedingRefresher;
    impl TokenRefresher for SucceedingRefresher {
        fn refresh(&self, _account: &Account) -> GatewayResult<RefreshedToken> {
            Ok(RefreshedToken { access_token: "new".into(), expires_in: 3600 })
        }
        fn fetch_project_id(&self, _account: &Account) -> GatewayResult<Option<String>> {
            Ok(Some("resolved-project".into()))
        }
    }

    fn account(id: &str, email: &str, provider: Provider) -> Account {
        Account {
            id: id.into(),
            provider,
            email: email.into(),
            name: None,
            avatar_url: None,
            token: TokenRecord {
                access_token: "old".into(),
                refresh_token: "rt".into(),
                expires_in: 3600,
                expiry_timestamp: now() + 100_000,
                token_type: "Bearer".into(),
                project_id: Some("already-known".into()),
                session_id: None,
                extra: StdHashMap::new(),
            },
            quota: None,
            created_at: 0,
            last_used: 0,
            status: AccountStatus::Active,
            is_active: false,
            selected_models: vec![],
        }
    }

    fn manager_with(accounts: Vec<Account>) -> TokenManager {
        let store = Arc::new(Store::open_in_memory().unwrap());
        for a in &accounts {
            store.add(a).unwrap();
        }
        let manager = TokenManager::new(store);
        manager.load().unwrap();
        manager
    }

    #[test]
    fn round_robin_cycles_through_all_candidates() {
        let manager = manager_with(vec![
            account("a", "a@x.com", Provider::Google),
            account("b", "b@x.com", Provider::Google),
            account("c", "c@x.com", Provider::Google),
        ]);
        let refresher = NoopRefresher;
        let mut seen = std::collections::HashSet::new();
        for _ in 0..3 {
            let picked = manager.get_next(None, &refresher).unwrap().unwrap();
            seen.insert(picked.id);
        }
        assert_eq!(seen.len(), 3, "every account should be selected within |C| calls");
    }

    #[test]
    fn cooldown_excludes_account_until_expiry() {
        let manager = manager_with(vec![account("a", "a@x.com", Provider::Google)]);
        manager.mark_rate_limited("a@x.com");
        let refresher = NoopRefresher;
        assert!(manager.get_next(None, &refresher).unwrap().is_none());
        manager.reset_cooldown("a@x.com");
        assert!(manager.get_next(None, &refresher).unwrap().is_some());
    }

    #[test]
    fn model_filter_empty_selected_models_is_unfiltered() {
        let manager = manager_with(vec![account("a", "a@x.com", Provider::Google)]);
        let refresher = NoopRefresher;
        assert!(manager.get_next(Some("anything"), &refresher).unwrap().is_some());
    }

    #[test]
    fn model_filter_matches_case_insensitively_and_strips_prefix() {
        let mut a = account("a", "a@x.com", Provider::Google);
        a.selected_models = vec!["models/Gemini-2.5-Pro".into()];
        let manager = manager_with(vec![a]);
        let refresher = NoopRefresher;
        assert!(manager.get_next(Some("gemini-2.5-pro"), &refresher).unwrap().is_some());
        assert!(manager.get_next(Some("gpt-4"), &refresher).unwrap().is_none());
    }

    #[test]
    fn local_sovereignty_pins_active_local_account() {
        let mut local = account("local", "local@x.com", Provider::LocalOllama);
        local.is_active = true;
        let cloud = account("cloud", "cloud@x.com", Provider::Google);
        let manager = manager_with(vec![local, cloud]);
        let refresher = NoopRefresher;
        for _ in 0..5 {
            let picked = manager.get_next(None, &refresher).unwrap().unwrap();
            assert_eq!(picked.id, "local");
        }
    }

    #[test]
    fn refresh_failure_still_returns_the_expiring_account() {
        let mut a = account("a", "a@x.com", Provider::Google);
        a.token.expiry_timestamp = now() + 1; // inside the refresh window
        let manager = manager_with(vec![a]);
        let refresher = NoopRefresher;
        let picked = manager.get_next(None, &refresher).unwrap().unwrap();
        assert_eq!(picked.token.access_token, "old");
    }

    #[test]
    fn refresh_success_updates_token_and_expiry() {
        let mut a = account("a", "a@x.com", Provider::Google);
        a.token.expiry_timestamp = now() + 1;
        let manager = manager_with(vec![a]);
        let refresher = SucceedingRefresher;
        let picked = manager.get_next(None, &refresher).unwrap().unwrap();
        assert_eq!(picked.token.access_token, "new");
        assert!(picked.token.expiry_timestamp >= now() + 3599);
    }

    #[test]
    fn missing_project_id_falls_back_to_deterministic_value() {
        let mut a = account("a", "someone@example.com", Provider::Google);
        a.token.project_id = None;
        let manager = manager_with(vec![a]);
        struct FailingProjectId;
        impl TokenRefresher for FailingProjectId {
            fn refresh(&self, _a: &Account) -> GatewayResult<RefreshedToken> {
                Ok(RefreshedToken { access_token: "old".into(), expires_in: 100_000 })
            }
            fn fetch_project_id(&self, _a: &Account) -> GatewayResult<Option<String>> {
                Err("discovery unavailable".into())
            }
        }
        let picked = manager.get_next(None, &FailingProjectId).unwrap().unwrap();
        assert_eq!(picked.token.project_id.as_deref(), Some("cloud-code-someone"));
    }

    #[test]
    fn empty_manager_returns_none() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let manager = TokenManager::new(store);
        let refresher = NoopRefresher;
        assert!(manager.get_next(None, &refresher).unwrap().is_none());
    }
}
