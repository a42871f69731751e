//! Rate limiting and throttling.
//!
//! Three layers, evaluated per request: a fixed-window pre-auth IP limit,
//! tier-based concentric windows (minute/hour/day, with optional queueing
//! and token-bucket burst), and the per-user fallback (sliding-window rate
//! limit plus soft throttle). All counters go through the shared store's
//! atomic `incr`; counter TTL is twice the window so a straggling read
//! never resurrects a dead window.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use doorman_core::{Tier, User, WindowUnit};
use doorman_state::{KeyKind, SharedStore, StateKey};

use crate::error::GatewayError;

/// Minimum effective wait when a tier queues instead of rejecting.
const MIN_THROTTLE_WAIT: Duration = Duration::from_millis(100);

/// `X-RateLimit-*` header values attached to successful responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitHeaders {
    pub limit: u64,
    pub remaining: u64,
    /// Seconds until the current window resets.
    pub reset: u64,
}

/// The outcome of the rate/throttle step for an admitted request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RateDecision {
    /// How long the pipeline must suspend before continuing.
    pub delay: Option<Duration>,
    pub headers: Option<RateLimitHeaders>,
}

struct SlidingOutcome {
    allowed: bool,
    remaining: u64,
    reset: u64,
}

/// The engine. Stateless besides the shared store handle.
pub struct RateLimiter {
    store: Arc<dyn SharedStore>,
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter").finish_non_exhaustive()
    }
}

fn now_secs() -> i64 {
    Utc::now().timestamp()
}

impl RateLimiter {
    #[must_use]
    pub fn new(store: Arc<dyn SharedStore>) -> Self {
        Self { store }
    }

    // -- IP pre-auth fixed window -------------------------------------------

    /// Fixed-window limit applied before token parsing on auth-adjacent
    /// endpoints. Key: `ip_rate_limit:{ip}:{bucket}`.
    pub async fn check_ip(
        &self,
        ip: &str,
        limit: u64,
        window_secs: u64,
    ) -> Result<RateLimitHeaders, GatewayError> {
        self.check_ip_at(ip, limit, window_secs, now_secs()).await
    }

    async fn check_ip_at(
        &self,
        ip: &str,
        limit: u64,
        window_secs: u64,
        now: i64,
    ) -> Result<RateLimitHeaders, GatewayError> {
        let window = i64::try_from(window_secs.max(1)).unwrap_or(60);
        let bucket = now.div_euclid(window);
        let key = StateKey::new(KeyKind::IpRateLimit, format!("{ip}:{bucket}"));

        let count = self.store.incr(&key, 1).await?;
        if count == 1 {
            self.store
                .expire(&key, Duration::from_secs(window_secs * 2))
                .await?;
        }

        let reset = u64::try_from(window - now.rem_euclid(window)).unwrap_or(window_secs);
        let count = u64::try_from(count.max(0)).unwrap_or(0);
        if count > limit {
            return Err(GatewayError::RateLimited {
                retry_after: reset,
                limit,
                remaining: 0,
                reset,
            });
        }
        Ok(RateLimitHeaders {
            limit,
            remaining: limit.saturating_sub(count),
            reset,
        })
    }

    // -- sliding-window counter ---------------------------------------------

    /// Sliding-window estimate: `prev * (1 - elapsed/window) + current`.
    /// The current window counter is incremented unconditionally; the
    /// request is rejected when the weighted estimate exceeds `limit`.
    async fn check_sliding_at(
        &self,
        kind: KeyKind,
        id: &str,
        limit: u64,
        window_secs: u64,
        now: i64,
    ) -> Result<SlidingOutcome, GatewayError> {
        let window = i64::try_from(window_secs.max(1)).unwrap_or(60);
        let current_start = now.div_euclid(window) * window;
        let previous_start = current_start - window;

        let current_key = StateKey::new(
            kind.clone(),
            format!("{id}:{window_secs}:{current_start}"),
        );
        let previous_key =
            StateKey::new(kind, format!("{id}:{window_secs}:{previous_start}"));

        let previous: i64 = match self.store.get(&previous_key).await? {
            Some(raw) => raw.parse().unwrap_or(0),
            None => 0,
        };

        let current = self.store.incr(&current_key, 1).await?;
        if current == 1 {
            self.store
                .expire(&current_key, Duration::from_secs(window_secs * 2))
                .await?;
        }

        #[allow(clippy::cast_precision_loss)]
        let weight = 1.0 - ((now - current_start) as f64 / window as f64);
        #[allow(
            clippy::cast_precision_loss,
            clippy::cast_possible_truncation,
            clippy::cast_sign_loss
        )]
        let estimated = (previous.max(0) as f64 * weight + current.max(0) as f64) as u64;

        let reset = u64::try_from(current_start + window - now).unwrap_or(window_secs);
        Ok(SlidingOutcome {
            allowed: estimated <= limit,
            remaining: limit.saturating_sub(estimated),
            reset,
        })
    }

    // -- tier limits --------------------------------------------------------

    /// Check all configured tier windows for `username`.
    ///
    /// On overflow the tier either hard-rejects, or (with throttling
    /// enabled) queues the request until the tightest violated window
    /// resets, bounded by `max_queue_time_ms`. A token-bucket burst
    /// allowance on the minute window admits short spikes.
    pub async fn check_tier(
        &self,
        username: &str,
        tier: &Tier,
    ) -> Result<RateDecision, GatewayError> {
        self.check_tier_at(username, tier, now_secs()).await
    }

    async fn check_tier_at(
        &self,
        username: &str,
        tier: &Tier,
        now: i64,
    ) -> Result<RateDecision, GatewayError> {
        let mut headers = None;
        for (limit, window_secs) in tier.windows() {
            let id = format!("tier:{username}");
            let outcome = self
                .check_sliding_at(KeyKind::RateLimit, &id, limit, window_secs, now)
                .await?;

            if window_secs == 60 {
                headers = Some(RateLimitHeaders {
                    limit,
                    remaining: outcome.remaining,
                    reset: outcome.reset,
                });
            }

            if outcome.allowed {
                continue;
            }

            // Token-bucket burst on the minute window.
            if window_secs == 60 && tier.burst_allowance > 0 {
                let burst_key = StateKey::new(
                    KeyKind::RateLimit,
                    format!("tier:{username}:burst:{}", now.div_euclid(60)),
                );
                let burst = self.store.incr(&burst_key, 1).await?;
                if burst == 1 {
                    self.store
                        .expire(&burst_key, Duration::from_secs(120))
                        .await?;
                }
                if u64::try_from(burst.max(0)).unwrap_or(u64::MAX) <= tier.burst_allowance {
                    continue;
                }
            }

            if tier.throttle_enabled {
                let wait = Duration::from_secs(outcome.reset).max(MIN_THROTTLE_WAIT);
                if wait <= Duration::from_millis(tier.max_queue_time_ms) {
                    return Ok(RateDecision {
                        delay: Some(wait),
                        headers,
                    });
                }
            }
            return Err(GatewayError::RateLimited {
                retry_after: outcome.reset,
                limit,
                remaining: 0,
                reset: outcome.reset,
            });
        }
        Ok(RateDecision {
            delay: None,
            headers,
        })
    }

    // -- per-user fallback ---------------------------------------------------

    /// Per-user rate limit + soft throttle for users without a tier.
    pub async fn check_user(&self, user: &User) -> Result<RateDecision, GatewayError> {
        self.check_user_at(user, now_secs()).await
    }

    async fn check_user_at(&self, user: &User, now: i64) -> Result<RateDecision, GatewayError> {
        let mut decision = RateDecision::default();

        if user.rate_limit_active() {
            let limit = user.rate_limit_duration.unwrap_or(60);
            let window_secs = user
                .rate_limit_duration_type
                .unwrap_or(WindowUnit::Minute)
                .seconds();
            let outcome = self
                .check_sliding_at(KeyKind::RateLimit, &user.username, limit, window_secs, now)
                .await?;
            if !outcome.allowed {
                return Err(GatewayError::RateLimited {
                    retry_after: outcome.reset,
                    limit,
                    remaining: 0,
                    reset: outcome.reset,
                });
            }
            decision.headers = Some(RateLimitHeaders {
                limit,
                remaining: outcome.remaining,
                reset: outcome.reset,
            });
        }

        if user.throttle_active() {
            decision.delay = self.check_throttle_at(user, now).await?;
        }

        Ok(decision)
    }

    /// Soft throttle: `throttle_duration` is the allowed request count per
    /// window; requests beyond it are delayed by `wait x excess`, and the
    /// queue cap converts excess into a hard 429.
    async fn check_throttle_at(
        &self,
        user: &User,
        now: i64,
    ) -> Result<Option<Duration>, GatewayError> {
        let limit = i64::try_from(user.throttle_duration.unwrap_or(10)).unwrap_or(10);
        let window_secs = user
            .throttle_duration_type
            .unwrap_or(WindowUnit::Second)
            .seconds();
        let window = i64::try_from(window_secs.max(1)).unwrap_or(1);
        let window_index = now.div_euclid(window);
        let key = StateKey::new(
            KeyKind::Throttle,
            format!("{}:{}", user.username, window_index),
        );

        let count = self.store.incr(&key, 1).await?;
        if count == 1 {
            self.store
                .expire(&key, Duration::from_secs(window_secs * 2))
                .await?;
        }

        let queue_limit = i64::try_from(user.throttle_queue_limit.unwrap_or(10)).unwrap_or(10);
        if queue_limit > 0 && count > queue_limit {
            return Err(GatewayError::ThrottleQueueFull);
        }
        let excess = (count - limit).max(0);
        if queue_limit > 0 && excess > queue_limit {
            return Err(GatewayError::ThrottleQueueFull);
        }
        if excess == 0 {
            return Ok(None);
        }

        let wait_unit_secs = user
            .throttle_wait_duration_type
            .unwrap_or(WindowUnit::Second)
            .seconds();
        #[allow(clippy::cast_precision_loss)]
        let wait_secs =
            user.throttle_wait_duration.unwrap_or(0.5) * wait_unit_secs as f64 * excess as f64;
        Ok(Some(Duration::from_secs_f64(wait_secs.max(0.0))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use doorman_state_memory::MemorySharedStore;

    fn limiter() -> RateLimiter {
        RateLimiter::new(Arc::new(MemorySharedStore::new()))
    }

    fn user(rate: Option<u64>, throttle: Option<u64>) -> User {
        User {
            username: "alice".into(),
            email: "alice@example.com".into(),
            password_hash: String::new(),
            role: "client".into(),
            groups: vec![],
            active: true,
            ui_access: false,
            tier: None,
            rate_limit_enabled: rate.is_some(),
            rate_limit_duration: rate,
            rate_limit_duration_type: Some(WindowUnit::Minute),
            throttle_enabled: throttle.is_some(),
            throttle_duration: throttle,
            throttle_duration_type: Some(WindowUnit::Second),
            throttle_wait_duration: Some(0.5),
            throttle_wait_duration_type: Some(WindowUnit::Second),
            throttle_queue_limit: Some(10),
            created_at: None,
        }
    }

    #[tokio::test]
    async fn ip_fixed_window_allows_then_rejects() {
        let rl = limiter();
        let now = 1_700_000_000;
        for i in 0..10 {
            let headers = rl.check_ip_at("1.2.3.4", 10, 60, now).await.unwrap();
            assert_eq!(headers.remaining, 10 - (i + 1));
        }
        let err = rl.check_ip_at("1.2.3.4", 10, 60, now).await.unwrap_err();
        match err {
            GatewayError::RateLimited {
                retry_after,
                remaining,
                ..
            } => {
                assert!(retry_after > 0 && retry_after <= 60);
                assert_eq!(remaining, 0);
            }
            other => panic!("expected RateLimited, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn ip_windows_are_per_ip() {
        let rl = limiter();
        let now = 1_700_000_000;
        for _ in 0..5 {
            rl.check_ip_at("1.1.1.1", 5, 60, now).await.unwrap();
        }
        assert!(rl.check_ip_at("1.1.1.1", 5, 60, now).await.is_err());
        assert!(rl.check_ip_at("2.2.2.2", 5, 60, now).await.is_ok());
    }

    #[tokio::test]
    async fn user_rate_limit_scenario_two_then_reject() {
        // rate_limit_duration = 2 per minute: first two pass, third is 429.
        let rl = limiter();
        let user = user(Some(2), None);
        // Align to a window start so the previous window carries no weight.
        let now = 1_700_000_040 - 1_700_000_040 % 60;
        assert!(rl.check_user_at(&user, now).await.is_ok());
        assert!(rl.check_user_at(&user, now + 1).await.is_ok());
        let err = rl.check_user_at(&user, now + 2).await.unwrap_err();
        assert!(matches!(err, GatewayError::RateLimited { .. }));
    }

    #[tokio::test]
    async fn rate_headers_count_down() {
        let rl = limiter();
        let user = user(Some(5), None);
        let now = 1_700_000_040 - 1_700_000_040 % 60;
        let first = rl.check_user_at(&user, now).await.unwrap();
        let second = rl.check_user_at(&user, now).await.unwrap();
        assert_eq!(first.headers.unwrap().remaining, 4);
        assert_eq!(second.headers.unwrap().remaining, 3);
    }

    #[tokio::test]
    async fn sliding_window_counts_previous_window_weighted() {
        let rl = limiter();
        let user = user(Some(10), None);
        let window_start = 1_700_000_040 - 1_700_000_040 % 60;

        // Fill the previous window to its limit.
        for _ in 0..10 {
            rl.check_user_at(&user, window_start - 30).await.unwrap();
        }
        // At the very start of the next window the previous window carries
        // full weight, so the first request is over the estimate.
        let err = rl.check_user_at(&user, window_start).await;
        assert!(err.is_err(), "carried weight should reject immediately");

        // Near the end of the next window the carried weight has decayed.
        assert!(rl.check_user_at(&user, window_start + 59).await.is_ok());
    }

    #[tokio::test]
    async fn throttle_delays_scale_with_excess() {
        let rl = limiter();
        let user = user(None, Some(2));
        let now = 1_700_000_000;

        assert_eq!(rl.check_user_at(&user, now).await.unwrap().delay, None);
        assert_eq!(rl.check_user_at(&user, now).await.unwrap().delay, None);
        // Third request: excess 1 -> 0.5s; fourth: excess 2 -> 1.0s.
        assert_eq!(
            rl.check_user_at(&user, now).await.unwrap().delay,
            Some(Duration::from_secs_f64(0.5))
        );
        assert_eq!(
            rl.check_user_at(&user, now).await.unwrap().delay,
            Some(Duration::from_secs_f64(1.0))
        );
    }

    #[tokio::test]
    async fn throttle_queue_cap_rejects() {
        let rl = limiter();
        let mut user = user(None, Some(1));
        user.throttle_queue_limit = Some(3);
        let now = 1_700_000_000;

        // 1 allowed + 2 queued fit; the 4th exceeds the absolute cap.
        for _ in 0..3 {
            assert!(rl.check_user_at(&user, now).await.is_ok());
        }
        let err = rl.check_user_at(&user, now).await.unwrap_err();
        assert!(matches!(err, GatewayError::ThrottleQueueFull));
    }

    #[tokio::test]
    async fn tier_minute_window_enforced() {
        let rl = limiter();
        let tier = Tier {
            tier_name: "basic".into(),
            requests_per_minute: Some(3),
            requests_per_hour: None,
            requests_per_day: None,
            throttle_enabled: false,
            max_queue_time_ms: 5_000,
            burst_allowance: 0,
        };
        let now = 1_700_000_040 - 1_700_000_040 % 60;
        for _ in 0..3 {
            assert!(rl.check_tier_at("alice", &tier, now).await.is_ok());
        }
        assert!(rl.check_tier_at("alice", &tier, now).await.is_err());
    }

    #[tokio::test]
    async fn tier_burst_allows_spike() {
        let rl = limiter();
        let tier = Tier {
            tier_name: "burst".into(),
            requests_per_minute: Some(2),
            requests_per_hour: None,
            requests_per_day: None,
            throttle_enabled: false,
            max_queue_time_ms: 0,
            burst_allowance: 2,
        };
        let now = 1_700_000_040 - 1_700_000_040 % 60;
        // 2 within limit + 2 burst pass; the 5th is rejected.
        for _ in 0..4 {
            assert!(rl.check_tier_at("alice", &tier, now).await.is_ok());
        }
        assert!(rl.check_tier_at("alice", &tier, now).await.is_err());
    }

    #[tokio::test]
    async fn tier_throttle_queues_with_min_wait() {
        let rl = limiter();
        let tier = Tier {
            tier_name: "queue".into(),
            requests_per_minute: Some(1),
            requests_per_hour: None,
            requests_per_day: None,
            throttle_enabled: true,
            max_queue_time_ms: 120_000,
            burst_allowance: 0,
        };
        let now = 1_700_000_040 - 1_700_000_040 % 60;
        assert!(rl.check_tier_at("alice", &tier, now).await.unwrap().delay.is_none());
        let decision = rl.check_tier_at("alice", &tier, now).await.unwrap();
        let delay = decision.delay.expect("over-limit should queue");
        assert!(delay >= MIN_THROTTLE_WAIT);
        assert!(delay <= Duration::from_secs(60));
    }

    #[tokio::test]
    async fn tier_queue_rejects_past_max_queue_time() {
        let rl = limiter();
        let tier = Tier {
            tier_name: "strict".into(),
            requests_per_minute: Some(1),
            requests_per_hour: None,
            requests_per_day: None,
            throttle_enabled: true,
            max_queue_time_ms: 10,
            burst_allowance: 0,
        };
        let now = 1_700_000_040 - 1_700_000_040 % 60;
        assert!(rl.check_tier_at("alice", &tier, now).await.is_ok());
        assert!(rl.check_tier_at("alice", &tier, now).await.is_err());
    }

    #[tokio::test]
    async fn no_limits_configured_passes_clean() {
        let rl = limiter();
        let user = user(None, None);
        let decision = rl.check_user_at(&user, 1_700_000_000).await.unwrap();
        assert_eq!(decision, RateDecision::default());
    }
}
