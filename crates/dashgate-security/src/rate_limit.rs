use crate::audit::{AuditAction, AuditLog};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Thresholds for the per-client sliding windows.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Width of both the request and the failure window.
    pub window: Duration,
    /// Requests allowed per window; the next one is rejected.
    pub max_requests: usize,
    /// Failed authentications per window that trigger a block.
    pub max_failed_auth: usize,
    /// How long a client stays blocked once the failure threshold is hit.
    pub block_duration: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(60),
            max_requests: 30,
            max_failed_auth: 5,
            block_duration: Duration::from_secs(5 * 60),
        }
    }
}

/// Outcome of an admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    /// The request may proceed to authentication.
    Allowed,
    /// Too many requests in the current window.
    Exceeded {
        /// Suggested wait before retrying (one full window).
        retry_after: Duration,
        /// Requests counted in the window, including this one.
        count: usize,
    },
    /// The client is serving a failed-auth block.
    Blocked {
        /// Time left on the block, rounded up to whole seconds.
        retry_after: Duration,
    },
}

impl RateDecision {
    /// Returns true if the request may proceed.
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed)
    }
}

#[derive(Default)]
struct ClientRateState {
    requests: VecDeque<Instant>,
    failed_auth: VecDeque<Instant>,
    blocked_until: Option<Instant>,
}

impl ClientRateState {
    fn last_activity(&self) -> Option<Instant> {
        let last_request = self.requests.back().copied();
        let last_failure = self.failed_auth.back().copied();
        last_request.max(last_failure)
    }
}

/// Drop entries that fell out of the trailing window ending at `now`.
fn prune(events: &mut VecDeque<Instant>, window: Duration, now: Instant) {
    while let Some(&oldest) = events.front() {
        if now.saturating_duration_since(oldest) >= window {
            events.pop_front();
        } else {
            break;
        }
    }
}

/// Per-client sliding-window rate limiter with progressive blocking.
///
/// Request volume and authentication failures are tracked in two independent
/// windows. Exceeding the request window only costs the client one window of
/// cooldown; hitting the failure threshold blocks it for the full block
/// duration, and the failure history is only cleared once that block has been
/// waited out.
pub struct RateLimiter {
    config: RateLimitConfig,
    clients: Mutex<HashMap<String, ClientRateState>>,
    audit: Option<Arc<AuditLog>>,
}

impl RateLimiter {
    /// Create a new rate limiter.
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            clients: Mutex::new(HashMap::new()),
            audit: None,
        }
    }

    /// Record `rate_exceeded`, `rate_blocked` and `client_blocked` events to `audit`.
    pub fn with_audit(mut self, audit: Arc<AuditLog>) -> Self {
        self.audit = Some(audit);
        self
    }

    /// The thresholds this limiter enforces.
    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Admission check for one request from `client` to `endpoint`.
    pub async fn check(&self, client: &str, endpoint: &str) -> RateDecision {
        self.check_at(client, endpoint, Instant::now()).await
    }

    /// [`check`](Self::check) evaluated at an explicit instant.
    pub async fn check_at(&self, client: &str, endpoint: &str, now: Instant) -> RateDecision {
        let decision = {
            let mut clients = self.clients.lock().await;
            let state = clients.entry(client.to_string()).or_default();

            match state.blocked_until {
                Some(until) if now < until => {
                    let retry_after = Duration::from_secs(ceil_secs(until - now));
                    RateDecision::Blocked { retry_after }
                }
                Some(_) => {
                    // Block served: clean slate for the failure window.
                    state.blocked_until = None;
                    state.failed_auth.clear();
                    self.count_request(state, now)
                }
                None => self.count_request(state, now),
            }
        };

        match decision {
            RateDecision::Allowed => {}
            RateDecision::Blocked { retry_after } => {
                let secs = retry_after.as_secs();
                warn!(client, endpoint, retry_after_secs = secs, "Blocked client rejected");
                self.audit(
                    client,
                    endpoint,
                    AuditAction::RateBlocked,
                    format!("Still blocked, retry in {secs}s"),
                );
            }
            RateDecision::Exceeded { count, .. } => {
                warn!(client, endpoint, count, "Rate limit exceeded");
                self.audit(
                    client,
                    endpoint,
                    AuditAction::RateExceeded,
                    format!("{count} requests in window"),
                );
            }
        }
        decision
    }

    fn count_request(&self, state: &mut ClientRateState, now: Instant) -> RateDecision {
        state.requests.push_back(now);
        prune(&mut state.requests, self.config.window, now);

        let count = state.requests.len();
        if count > self.config.max_requests {
            RateDecision::Exceeded {
                retry_after: self.config.window,
                count,
            }
        } else {
            RateDecision::Allowed
        }
    }

    /// Count one failed authentication for `client`.
    ///
    /// Returns `true` if this failure put the client into a block.
    pub async fn record_failure(&self, client: &str) -> bool {
        self.record_failure_at(client, Instant::now()).await
    }

    /// [`record_failure`](Self::record_failure) evaluated at an explicit instant.
    pub async fn record_failure_at(&self, client: &str, now: Instant) -> bool {
        let failures = {
            let mut clients = self.clients.lock().await;
            let state = clients.entry(client.to_string()).or_default();
            state.failed_auth.push_back(now);
            prune(&mut state.failed_auth, self.config.window, now);

            let failures = state.failed_auth.len();
            if failures < self.config.max_failed_auth {
                debug!(client, failures, "Failed auth recorded");
                return false;
            }
            // An unrepresentable end instant is clamped to the request window.
            let until = now
                .checked_add(self.config.block_duration)
                .unwrap_or(now + self.config.window);
            state.blocked_until = Some(until);
            failures
        };

        let block_secs = self.config.block_duration.as_secs();
        warn!(client, failures, block_secs, "Client blocked after repeated auth failures");
        self.audit(
            client,
            "-",
            AuditAction::ClientBlocked,
            format!("{failures} failed auth attempts, blocked for {block_secs}s"),
        );
        true
    }

    /// Returns true if `client` is currently serving a block.
    pub async fn is_blocked(&self, client: &str) -> bool {
        let clients = self.clients.lock().await;
        clients
            .get(client)
            .and_then(|s| s.blocked_until)
            .is_some_and(|until| Instant::now() < until)
    }

    /// Number of clients currently tracked.
    pub async fn tracked_clients(&self) -> usize {
        self.clients.lock().await.len()
    }

    /// Remove clients with no activity for the given duration.
    ///
    /// Clients that are still blocked are kept regardless of idleness.
    pub async fn cleanup(&self, max_idle: Duration) {
        self.cleanup_at(max_idle, Instant::now()).await;
    }

    /// [`cleanup`](Self::cleanup) evaluated at an explicit instant.
    pub async fn cleanup_at(&self, max_idle: Duration, now: Instant) {
        let mut clients = self.clients.lock().await;
        let before = clients.len();
        clients.retain(|_, s| {
            let blocked = s.blocked_until.is_some_and(|until| now < until);
            let active = s
                .last_activity()
                .is_some_and(|last| now.saturating_duration_since(last) < max_idle);
            blocked || active
        });
        let evicted = before - clients.len();
        if evicted > 0 {
            debug!(evicted, remaining = clients.len(), "Rate limiter cleanup");
        }
    }

    fn audit(&self, client: &str, endpoint: &str, action: AuditAction, detail: String) {
        if let Some(audit) = &self.audit {
            audit.record(client, endpoint, action, detail);
        }
    }
}

fn ceil_secs(d: Duration) -> u64 {
    let secs = d.as_secs();
    if d.subsec_nanos() > 0 {
        secs + 1
    } else {
        secs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CLIENT: &str = "10.0.0.7";

    #[tokio::test]
    async fn test_rate_limiter_allows_up_to_max() {
        let limiter = RateLimiter::new(RateLimitConfig::default());
        let t0 = Instant::now();
        for i in 0..30 {
            let now = t0 + Duration::from_millis(i * 100);
            assert!(limiter.check_at(CLIENT, "/api", now).await.is_allowed());
        }
    }

    #[tokio::test]
    async fn test_rate_limiter_rejects_31st_request() {
        let limiter = RateLimiter::new(RateLimitConfig::default());
        let t0 = Instant::now();
        for _ in 0..30 {
            limiter.check_at(CLIENT, "/api", t0).await;
        }
        let decision = limiter.check_at(CLIENT, "/api", t0 + Duration::from_secs(1)).await;
        assert_eq!(
            decision,
            RateDecision::Exceeded {
                retry_after: Duration::from_secs(60),
                count: 31
            }
        );
    }

    #[tokio::test]
    async fn test_request_window_slides() {
        let limiter = RateLimiter::new(RateLimitConfig::default());
        let t0 = Instant::now();
        for _ in 0..30 {
            limiter.check_at(CLIENT, "/api", t0).await;
        }
        // All 30 fall out of the window after 60s.
        let later = t0 + Duration::from_secs(60);
        assert!(limiter.check_at(CLIENT, "/api", later).await.is_allowed());
    }

    #[tokio::test]
    async fn test_clients_are_independent() {
        let limiter = RateLimiter::new(RateLimitConfig::default());
        let t0 = Instant::now();
        for _ in 0..31 {
            limiter.check_at("a", "/api", t0).await;
        }
        assert!(!limiter.check_at("a", "/api", t0).await.is_allowed());
        assert!(limiter.check_at("b", "/api", t0).await.is_allowed());
    }

    #[tokio::test]
    async fn test_five_failures_block() {
        let limiter = RateLimiter::new(RateLimitConfig::default());
        let t0 = Instant::now();
        for i in 0..4 {
            assert!(!limiter.record_failure_at(CLIENT, t0 + Duration::from_secs(i)).await);
        }
        assert!(limiter.record_failure_at(CLIENT, t0 + Duration::from_secs(4)).await);

        let decision = limiter.check_at(CLIENT, "/api", t0 + Duration::from_secs(5)).await;
        assert_eq!(
            decision,
            RateDecision::Blocked {
                retry_after: Duration::from_secs(299)
            }
        );
    }

    #[tokio::test]
    async fn test_failures_outside_window_do_not_block() {
        let limiter = RateLimiter::new(RateLimitConfig::default());
        let t0 = Instant::now();
        for i in 0..5 {
            let blocked = limiter
                .record_failure_at(CLIENT, t0 + Duration::from_secs(i * 20))
                .await;
            assert!(!blocked);
        }
    }

    #[tokio::test]
    async fn test_block_expiry_resets_failures() {
        let limiter = RateLimiter::new(RateLimitConfig::default());
        let t0 = Instant::now();
        for _ in 0..5 {
            limiter.record_failure_at(CLIENT, t0).await;
        }

        let after_block = t0 + Duration::from_secs(5 * 60);
        assert!(limiter.check_at(CLIENT, "/api", after_block).await.is_allowed());

        // A single new failure must not re-block on stale history.
        assert!(!limiter.record_failure_at(CLIENT, after_block).await);
        assert!(limiter
            .check_at(CLIENT, "/api", after_block + Duration::from_secs(1))
            .await
            .is_allowed());
    }

    #[tokio::test]
    async fn test_concurrent_checks_admit_exactly_max() {
        let limiter = Arc::new(RateLimiter::new(RateLimitConfig::default()));
        let mut handles = Vec::new();
        for _ in 0..50 {
            let limiter = limiter.clone();
            handles.push(tokio::spawn(async move {
                limiter.check(CLIENT, "/api").await.is_allowed()
            }));
        }
        let mut allowed = 0;
        for h in handles {
            if h.await.unwrap() {
                allowed += 1;
            }
        }
        assert_eq!(allowed, 30);
    }

    #[tokio::test]
    async fn test_cleanup_evicts_idle_but_keeps_blocked() {
        let limiter = RateLimiter::new(RateLimitConfig::default());
        let t0 = Instant::now();
        limiter.check_at("idle", "/api", t0).await;
        for _ in 0..5 {
            limiter.record_failure_at("bad", t0).await;
        }
        assert_eq!(limiter.tracked_clients().await, 2);

        limiter
            .cleanup_at(Duration::from_secs(120), t0 + Duration::from_secs(180))
            .await;
        assert_eq!(limiter.tracked_clients().await, 1);
        assert!(limiter.is_blocked("bad").await);
    }

    #[tokio::test]
    async fn test_oversized_block_duration_does_not_panic() {
        let limiter = RateLimiter::new(RateLimitConfig {
            block_duration: Duration::MAX,
            ..RateLimitConfig::default()
        });
        let t0 = Instant::now();
        for _ in 0..4 {
            limiter.record_failure_at(CLIENT, t0).await;
        }
        assert!(limiter.record_failure_at(CLIENT, t0).await);
        assert!(!limiter.check_at(CLIENT, "/api", t0).await.is_allowed());
    }

    #[test]
    fn test_ceil_secs() {
        assert_eq!(ceil_secs(Duration::from_millis(1500)), 2);
        assert_eq!(ceil_secs(Duration::from_secs(3)), 3);
    }
}
