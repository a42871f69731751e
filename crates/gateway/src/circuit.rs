//! Per-API circuit breakers.
//!
//! Tracks upstream health per `api_id` and short-circuits dispatch with a
//! synthetic 503 while an API's circuit is open:
//! - `Closed` -> `Open` when consecutive failures reach the threshold
//! - `Open` -> `HalfOpen` after the recovery timeout elapses
//! - `HalfOpen` -> `Closed` after enough consecutive successes
//! - `HalfOpen` -> `Open` on any failure

use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{info, warn};

/// State of a circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Circuit breaker tuning, hot-reloadable.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Disabled breakers admit everything and track nothing.
    pub enabled: bool,
    /// Consecutive failures before opening the circuit.
    pub failure_threshold: u32,
    /// Consecutive half-open successes required to close.
    pub success_threshold: u32,
    /// Time spent open before probing again.
    pub recovery_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            failure_threshold: 5,
            success_threshold: 2,
            recovery_timeout: Duration::from_secs(60),
        }
    }
}

#[derive(Debug)]
struct BreakerData {
    state: CircuitState,
    consecutive_failures: u32,
    consecutive_successes: u32,
    opened_at: Option<Instant>,
}

impl Default for BreakerData {
    fn default() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            consecutive_successes: 0,
            opened_at: None,
        }
    }
}

/// Registry of breakers keyed by `api_id`, created lazily on first use.
#[derive(Debug, Default)]
pub struct CircuitBreakerRegistry {
    breakers: DashMap<String, BreakerData>,
    config: CircuitBreakerConfig,
}

impl CircuitBreakerRegistry {
    #[must_use]
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            breakers: DashMap::new(),
            config,
        }
    }

    /// Whether a request for `api_id` may be dispatched right now.
    ///
    /// An open circuit flips to half-open once the recovery timeout has
    /// elapsed, admitting probe traffic.
    pub fn allow(&self, api_id: &str) -> bool {
        if !self.config.enabled {
            return true;
        }
        let mut data = self.breakers.entry(api_id.to_owned()).or_default();
        match data.state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let elapsed = data
                    .opened_at
                    .map(|at| at.elapsed() >= self.config.recovery_timeout)
                    .unwrap_or(true);
                if elapsed {
                    info!(api_id, "circuit transitioning open -> half_open");
                    data.state = CircuitState::HalfOpen;
                    data.consecutive_successes = 0;
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Record a dispatch outcome for `api_id`.
    pub fn record(&self, api_id: &str, success: bool) {
        if !self.config.enabled {
            return;
        }
        let mut data = self.breakers.entry(api_id.to_owned()).or_default();
        if success {
            match data.state {
                CircuitState::HalfOpen => {
                    data.consecutive_successes += 1;
                    if data.consecutive_successes >= self.config.success_threshold {
                        info!(api_id, "circuit closing after successful probes");
                        *data = BreakerData::default();
                    }
                }
                CircuitState::Closed => {
                    data.consecutive_failures = 0;
                }
                CircuitState::Open => {}
            }
        } else {
            match data.state {
                CircuitState::HalfOpen => {
                    warn!(api_id, "probe failed, circuit re-opening");
                    data.state = CircuitState::Open;
                    data.opened_at = Some(Instant::now());
                    data.consecutive_successes = 0;
                }
                CircuitState::Closed => {
                    data.consecutive_failures += 1;
                    if data.consecutive_failures >= self.config.failure_threshold {
                        warn!(
                            api_id,
                            failures = data.consecutive_failures,
                            "failure threshold reached, circuit opening"
                        );
                        data.state = CircuitState::Open;
                        data.opened_at = Some(Instant::now());
                    }
                }
                CircuitState::Open => {}
            }
        }
    }

    /// Current state for diagnostics; `Closed` for unknown APIs.
    #[must_use]
    pub fn state(&self, api_id: &str) -> CircuitState {
        self.breakers
            .get(api_id)
            .map_or(CircuitState::Closed, |data| data.state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry(failures: u32, successes: u32, recovery: Duration) -> CircuitBreakerRegistry {
        CircuitBreakerRegistry::new(CircuitBreakerConfig {
            enabled: true,
            failure_threshold: failures,
            success_threshold: successes,
            recovery_timeout: recovery,
        })
    }

    #[tokio::test]
    async fn opens_after_threshold() {
        let reg = registry(3, 1, Duration::from_secs(60));
        for _ in 0..2 {
            reg.record("api-1", false);
        }
        assert_eq!(reg.state("api-1"), CircuitState::Closed);
        reg.record("api-1", false);
        assert_eq!(reg.state("api-1"), CircuitState::Open);
        assert!(!reg.allow("api-1"));
    }

    #[tokio::test]
    async fn success_resets_failure_streak() {
        let reg = registry(3, 1, Duration::from_secs(60));
        reg.record("api-1", false);
        reg.record("api-1", false);
        reg.record("api-1", true);
        reg.record("api-1", false);
        assert_eq!(reg.state("api-1"), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn recovery_timeout_half_opens() {
        let reg = registry(1, 2, Duration::from_secs(30));
        reg.record("api-1", false);
        assert!(!reg.allow("api-1"));

        tokio::time::advance(Duration::from_secs(31)).await;
        assert!(reg.allow("api-1"));
        assert_eq!(reg.state("api-1"), CircuitState::HalfOpen);

        // One success isn't enough with success_threshold = 2.
        reg.record("api-1", true);
        assert_eq!(reg.state("api-1"), CircuitState::HalfOpen);
        reg.record("api-1", true);
        assert_eq!(reg.state("api-1"), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_failure_reopens() {
        let reg = registry(1, 1, Duration::from_secs(10));
        reg.record("api-1", false);
        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(reg.allow("api-1"));
        reg.record("api-1", false);
        assert_eq!(reg.state("api-1"), CircuitState::Open);
        assert!(!reg.allow("api-1"));
    }

    #[tokio::test]
    async fn disabled_registry_admits_everything() {
        let reg = CircuitBreakerRegistry::new(CircuitBreakerConfig {
            enabled: false,
            ..CircuitBreakerConfig::default()
        });
        for _ in 0..100 {
            reg.record("api-1", false);
        }
        assert!(reg.allow("api-1"));
        assert_eq!(reg.state("api-1"), CircuitState::Closed);
    }

    #[tokio::test]
    async fn breakers_are_independent_per_api() {
        let reg = registry(1, 1, Duration::from_secs(60));
        reg.record("api-1", false);
        assert!(!reg.allow("api-1"));
        assert!(reg.allow("api-2"));
    }
}
