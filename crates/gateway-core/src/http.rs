// ── Keystone Gateway: Shared HTTP Plumbing ──────────────────────────────────
// Retry/backoff, circuit breaker, a certificate-pinned client, and a request
// audit ring buffer, shared by every upstream call site (token refresh,
// quota fetch, proxy dispatch, embeddings) instead of duplicated per-client.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, LazyLock, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use sha2::{Digest, Sha256};

pub const MAX_RETRIES: u32 = 3;
const INITIAL_RETRY_DELAY_MS: u64 = 1000;
const MAX_RETRY_DELAY_MS: u64 = 30_000;

pub fn is_retryable_status(status: u16) -> bool {
    matches!(status, 429 | 500 | 502 | 503 | 504 | 529)
}

fn now_nanos() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.subsec_nanos() as u64)
        .unwrap_or(0)
}

/// Deterministic, dependency-free jitter: ±25% of `base_ms`, seeded off the
/// low bits of the current time. Not cryptographic — this only needs to
/// desynchronize concurrent retriers, not resist prediction.
fn apply_jitter(base_ms: u64) -> u64 {
    let spread = base_ms / 4;
    if spread == 0 {
        return base_ms;
    }
    let offset = (now_nanos() % (2 * spread + 1)) as i64 - spread as i64;
    (base_ms as i64 + offset).max(0) as u64
}

/// Exponential backoff delay (ms) for retry attempt `attempt` (0-indexed).
pub fn retry_delay_ms(attempt: u32) -> u64 {
    let base = INITIAL_RETRY_DELAY_MS.saturating_mul(1u64 << attempt.min(10));
    apply_jitter(base.min(MAX_RETRY_DELAY_MS))
}

/// Parses a `Retry-After` header value, either seconds or an HTTP-date (the
/// date form is not parsed — only the integer-seconds form is common from the
/// providers this gateway talks to).
pub fn parse_retry_after(header_value: &str) -> Option<u64> {
    header_value.trim().parse::<u64>().ok()
}

/// Per-provider circuit breaker: trips after `threshold` consecutive
/// failures, resets after `cooldown_secs`.
pub struct CircuitBreaker {
    consecutive_failures: AtomicU32,
    tripped_at: AtomicU64,
    threshold: u32,
    cooldown_secs: u64,
}

impl CircuitBreaker {
    pub fn new(threshold: u32, cooldown_secs: u64) -> Self {
        CircuitBreaker {
            consecutive_failures: AtomicU32::new(0),
            tripped_at: AtomicU64::new(0),
            threshold,
            cooldown_secs,
        }
    }

    /// `true` if calls are currently allowed through.
    pub fn check(&self) -> bool {
        let tripped_at = self.tripped_at.load(Ordering::SeqCst);
        if tripped_at == 0 {
            return true;
        }
        let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs();
        if now.saturating_sub(tripped_at) >= self.cooldown_secs {
            self.consecutive_failures.store(0, Ordering::SeqCst);
            self.tripped_at.store(0, Ordering::SeqCst);
            true
        } else {
            false
        }
    }

    pub fn record_success(&self) {
        self.consecutive_failures.store(0, Ordering::SeqCst);
        self.tripped_at.store(0, Ordering::SeqCst);
    }

    pub fn record_failure(&self) {
        let failures = self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
        if failures >= self.threshold {
            let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs();
            self.tripped_at.store(now, Ordering::SeqCst);
        }
    }
}

/// Builds a `reqwest::Client` pinned to the bundled webpki root store (no
/// reliance on the OS trust store), optionally routed through an outbound
/// HTTPS proxy.
pub fn build_client(upstream_proxy: Option<&str>) -> reqwest::Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder()
        .use_rustls_tls()
        .tls_built_in_root_certs(false)
        .tls_built_in_webpki_certs(true)
        .timeout(std::time::Duration::from_secs(120));

    if let Some(proxy_url) = upstream_proxy {
        if let Ok(proxy) = reqwest::Proxy::all(proxy_url) {
            builder = builder.proxy(proxy);
        }
    }

    builder.build()
}

static DEFAULT_CLIENT: LazyLock<reqwest::Client> =
    LazyLock::new(|| build_client(None).expect("failed to build default HTTP client"));

pub fn default_client() -> reqwest::Client {
    DEFAULT_CLIENT.clone()
}

#[derive(Debug, Clone)]
pub struct RequestAuditEntry {
    pub provider: String,
    pub model: String,
    pub timestamp: u64,
    pub request_hash: String,
    pub status: Option<u16>,
}

pub struct RequestAuditLog {
    entries: Vec<RequestAuditEntry>,
    capacity: usize,
}

impl RequestAuditLog {
    fn new(capacity: usize) -> Self {
        RequestAuditLog { entries: Vec::with_capacity(capacity), capacity }
    }

    pub fn push(&mut self, entry: RequestAuditEntry) {
        if self.entries.len() == self.capacity {
            self.entries.remove(0);
        }
        self.entries.push(entry);
    }

    pub fn recent(&self, n: usize) -> Vec<RequestAuditEntry> {
        let start = self.entries.len().saturating_sub(n);
        self.entries[start..].to_vec()
    }

    pub fn total(&self) -> usize {
        self.entries.len()
    }

    pub fn mark_last_status(&mut self, status: u16) {
        if let Some(last) = self.entries.last_mut() {
            last.status = Some(status);
        }
    }
}

pub static AUDIT_LOG: LazyLock<Arc<Mutex<RequestAuditLog>>> =
    LazyLock::new(|| Arc::new(Mutex::new(RequestAuditLog::new(500))));

/// SHA-256 of provider+model+timestamp+body, logged alongside the request
/// rather than the body itself (which may carry user content).
pub fn sign_and_log_request(provider: &str, model: &str, body: &[u8]) -> String {
    let timestamp = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs();
    let mut hasher = Sha256::new();
    hasher.update(provider.as_bytes());
    hasher.update(model.as_bytes());
    hasher.update(timestamp.to_le_bytes());
    hasher.update(body);
    let hash = format!("{:x}", hasher.finalize());

    AUDIT_LOG.lock().unwrap().push(RequestAuditEntry {
        provider: provider.to_string(),
        model: model.to_string(),
        timestamp,
        request_hash: hash.clone(),
        status: None,
    });

    hash
}

pub fn update_last_audit_status(status: u16) {
    AUDIT_LOG.lock().unwrap().mark_last_status(status);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_statuses() {
        assert!(is_retryable_status(429));
        assert!(is_retryable_status(503));
        assert!(!is_retryable_status(404));
        assert!(!is_retryable_status(200));
    }

    #[test]
    fn parse_retry_after_valid() {
        assert_eq!(parse_retry_after("30"), Some(30));
        assert_eq!(parse_retry_after("  7 "), Some(7));
        assert_eq!(parse_retry_after("not-a-number"), None);
    }

    #[test]
    fn jitter_stays_in_range() {
        for attempt in 0..5 {
            let delay = retry_delay_ms(attempt);
            let base = INITIAL_RETRY_DELAY_MS.saturating_mul(1u64 << attempt).min(MAX_RETRY_DELAY_MS);
            let spread = base / 4;
            assert!(delay <= base + spread + 1, "delay {delay} exceeded base {base} + spread {spread}");
        }
    }

    #[test]
    fn circuit_breaker_trips_and_recovers() {
        let breaker = CircuitBreaker::new(3, 0);
        assert!(breaker.check());
        breaker.record_failure();
        breaker.record_failure();
        assert!(breaker.check(), "should still be closed below threshold");
        breaker.record_failure();
        assert!(!breaker.check(), "should trip at threshold");
    }

    #[test]
    fn circuit_breaker_resets_on_success() {
        let breaker = CircuitBreaker::new(2, 0);
        breaker.record_failure();
        breaker.record_success();
        breaker.record_failure();
        assert!(breaker.check(), "success should reset the failure count");
    }

    #[test]
    fn audit_log_ring_buffer_caps_at_capacity() {
        let mut log = RequestAuditLog::new(2);
        for i in 0..5 {
            log.push(RequestAuditEntry {
                provider: "google".into(),
                model: "gemini".into(),
                timestamp: i,
                request_hash: format!("hash{i}"),
                status: None,
            });
        }
        assert_eq!(log.total(), 2);
        assert_eq!(log.recent(10)[0].request_hash, "hash3");
    }

    #[test]
    fn sign_request_produces_hex_hash() {
        let hash = sign_and_log_request("google", "gemini-2.5-pro", b"{}");
        assert_eq!(hash.len(), 64);
        assert!(hash.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn default_client_builds_successfully() {
        let _ = default_client();
    }
}
