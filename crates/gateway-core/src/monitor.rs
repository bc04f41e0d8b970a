// ── Keystone Gateway: Quota Monitor & Auto-Switcher ─────────────────────────
// Background loop, every 5 minutes plus an explicit `force_poll`, bounding
// concurrent per-account polls to 3 via a counting semaphore.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::sync::Semaphore;

use crate::error::GatewayResult;
use crate::http;
use crate::store::Store;
use crate::types::{Account, AccountStatus};

const POLL_INTERVAL_SECS: u64 = 5 * 60;
const REFRESH_WINDOW_SECS: i64 = 600;
const MONITOR_CONCURRENCY: usize = 3;
/// Hysteresis guard: a candidate must beat the active account's score by
/// more than this margin to trigger a switch. This asymmetry is
/// intentional, not a bug — see DESIGN.md.
const HYSTERESIS_MARGIN: f64 = 5.0;
const CRITICAL_SCORE_THRESHOLD: f64 = 10.0;

fn now() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs() as i64
}

/// Per-account refresh + quota fetch, isolated behind a trait so the monitor
/// doesn't depend on `providers` directly (mirrors `token_manager`'s
/// `TokenRefresher` seam).
#[async_trait::async_trait]
pub trait QuotaFetcher: Send + Sync {
    async fn refresh_if_needed(&self, account: &mut Account) -> GatewayResult<()>;
    async fn fetch_quota(&self, account: &Account) -> GatewayResult<crate::types::QuotaMap>;
}

pub struct Monitor {
    store: Arc<Store>,
    fetcher: Arc<dyn QuotaFetcher>,
    semaphore: Arc<Semaphore>,
}

pub struct SwitchNotification {
    pub from: Option<String>,
    pub to: String,
}

impl Monitor {
    pub fn new(store: Arc<Store>, fetcher: Arc<dyn QuotaFetcher>) -> Self {
        Monitor { store, fetcher, semaphore: Arc::new(Semaphore::new(MONITOR_CONCURRENCY)) }
    }

    /// Runs the background loop until the task is cancelled.
    pub async fn run_loop(&self) {
        loop {
            if let Err(e) = self.force_poll().await {
                log::error!("quota monitor pass failed: {e}");
            }
            tokio::time::sleep(std::time::Duration::from_secs(POLL_INTERVAL_SECS)).await;
        }
    }

    /// One full pass: poll every account's quota, then run auto-switch.
    /// Never panics or propagates a per-account error — the loop must never
    /// die.
    pub async fn force_poll(&self) -> GatewayResult<Option<SwitchNotification>> {
        let accounts = self.store.list()?;
        let mut tasks = Vec::new();
        for account in accounts {
            let permit = self.semaphore.clone().acquire_owned().await.expect("semaphore never closed");
            let store = self.store.clone();
            let fetcher = self.fetcher.clone();
            tasks.push(tokio::spawn(async move {
                let _permit = permit;
                poll_one_account(&store, fetcher.as_ref(), account).await;
            }));
        }
        for task in tasks {
            let _ = task.await;
        }

        if self.store.auto_switch_enabled()? {
            return self.auto_switch();
        }
        Ok(None)
    }

    /// Runs the hysteresis-guarded switch check against the store's current
    /// state, independent of a quota poll. `force_poll` calls this after
    /// every polling pass; callers that already know quotas are fresh (tests,
    /// a CLI "check now" command) can call it directly.
    pub fn auto_switch(&self) -> GatewayResult<Option<SwitchNotification>> {
        let accounts = self.store.list()?;
        let Some(active) = accounts.iter().find(|a| a.is_active) else { return Ok(None) };
        let active_score = active.health_score();

        let is_critical = active_score < CRITICAL_SCORE_THRESHOLD
            || matches!(active.status, AccountStatus::RateLimited | AccountStatus::Error);
        if !is_critical {
            return Ok(None);
        }

        let candidate = accounts
            .iter()
            .filter(|a| !a.is_active && matches!(a.status, AccountStatus::Active))
            .max_by(|a, b| a.health_score().total_cmp(&b.health_score()));

        let Some(candidate) = candidate else { return Ok(None) };
        if candidate.health_score() <= active_score + HYSTERESIS_MARGIN {
            return Ok(None);
        }

        self.store.set_active(&candidate.id)?;
        Ok(Some(SwitchNotification { from: Some(active.id.clone()), to: candidate.id.clone() }))
    }
}

async fn poll_one_account(store: &Store, fetcher: &dyn QuotaFetcher, mut account: Account) {
    if let Err(e) = store.update_status(&account.id, AccountStatus::Refreshing) {
        log::warn!("failed to mark {} refreshing: {e}", account.email);
        return;
    }

    if account.token.expiry_timestamp < now() + REFRESH_WINDOW_SECS {
        if let Err(e) = fetcher.refresh_if_needed(&mut account).await {
            log::warn!("token refresh failed for {} during quota poll: {e}", account.email);
        }
    }

    let mut last_err = None;
    for attempt in 0..http::MAX_RETRIES {
        match fetcher.fetch_quota(&account).await {
            Ok(quota) => {
                if let Err(e) = store.update_quota(&account.id, &quota) {
                    log::warn!("failed to persist quota for {}: {e}", account.email);
                }
                let _ = store.update_status(&account.id, AccountStatus::Active);
                return;
            }
            Err(e @ crate::error::GatewayError::UpstreamRateLimit { .. }) => {
                log::warn!("{} rate limited during quota poll: {e}", account.email);
                let _ = store.update_status(&account.id, AccountStatus::RateLimited);
                return;
            }
            Err(e) => {
                last_err = Some(e);
                tokio::time::sleep(std::time::Duration::from_millis(http::retry_delay_ms(attempt))).await;
            }
        }
    }
    log::error!("quota fetch exhausted retries for {}: {:?}", account.email, last_err.map(|e| e.to_string()));
    let _ = store.update_status(&account.id, AccountStatus::Error);
}
