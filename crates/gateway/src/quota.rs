//! Day/month usage quotas.
//!
//! Tracks `(user, quota_type)` usage against calendar periods. Counters
//! live in the shared store under the period key so every worker sees the
//! same usage; entries expire on their own at twice the period length.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Datelike, TimeZone, Utc};

use doorman_state::{KeyKind, SharedStore, StateKey};

use crate::error::GatewayError;

/// Quota period granularity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaPeriod {
    Day,
    Month,
}

impl QuotaPeriod {
    /// Key segment for the current period, e.g. `20260801` or `202608`.
    fn period_key(self, now: DateTime<Utc>) -> String {
        match self {
            Self::Day => now.format("%Y%m%d").to_string(),
            Self::Month => now.format("%Y%m").to_string(),
        }
    }

    /// Start of the next period.
    #[must_use]
    pub fn next_reset(self, now: DateTime<Utc>) -> DateTime<Utc> {
        match self {
            Self::Day => {
                let tomorrow = now.date_naive() + chrono::Days::new(1);
                Utc.from_utc_datetime(&tomorrow.and_hms_opt(0, 0, 0).expect("midnight is valid"))
            }
            Self::Month => {
                let (year, month) = if now.month() == 12 {
                    (now.year() + 1, 1)
                } else {
                    (now.year(), now.month() + 1)
                };
                Utc.with_ymd_and_hms(year, month, 1, 0, 0, 0)
                    .single()
                    .expect("first of month is valid")
            }
        }
    }

    fn ttl(self) -> Duration {
        match self {
            Self::Day => Duration::from_secs(2 * 86_400),
            Self::Month => Duration::from_secs(2 * 31 * 86_400),
        }
    }
}

/// Outcome of a quota check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuotaCheck {
    pub allowed: bool,
    pub current_usage: u64,
    pub limit: u64,
    pub remaining: u64,
    pub reset_at: DateTime<Utc>,
}

/// Quota tracker over the shared store.
pub struct QuotaTracker {
    store: Arc<dyn SharedStore>,
}

impl std::fmt::Debug for QuotaTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QuotaTracker").finish_non_exhaustive()
    }
}

impl QuotaTracker {
    #[must_use]
    pub fn new(store: Arc<dyn SharedStore>) -> Self {
        Self { store }
    }

    fn key(user_id: &str, quota_type: &str, period: QuotaPeriod, now: DateTime<Utc>) -> StateKey {
        StateKey::new(
            KeyKind::Quota,
            format!("{user_id}:{quota_type}:{}", period.period_key(now)),
        )
    }

    /// Whether adding `amount` would stay within `limit` for the current
    /// period. Read-only; pair with [`record`](Self::record) on success.
    pub async fn check(
        &self,
        user_id: &str,
        quota_type: &str,
        amount: u64,
        limit: u64,
        period: QuotaPeriod,
    ) -> Result<QuotaCheck, GatewayError> {
        self.check_at(user_id, quota_type, amount, limit, period, Utc::now())
            .await
    }

    async fn check_at(
        &self,
        user_id: &str,
        quota_type: &str,
        amount: u64,
        limit: u64,
        period: QuotaPeriod,
        now: DateTime<Utc>,
    ) -> Result<QuotaCheck, GatewayError> {
        let key = Self::key(user_id, quota_type, period, now);
        let current_usage: u64 = match self.store.get(&key).await? {
            Some(raw) => raw.parse().unwrap_or(0),
            None => 0,
        };
        let allowed = current_usage.saturating_add(amount) <= limit;
        Ok(QuotaCheck {
            allowed,
            current_usage,
            limit,
            remaining: limit.saturating_sub(current_usage),
            reset_at: period.next_reset(now),
        })
    }

    /// Add `amount` to the period's usage.
    pub async fn record(
        &self,
        user_id: &str,
        quota_type: &str,
        amount: u64,
        period: QuotaPeriod,
    ) -> Result<u64, GatewayError> {
        self.record_at(user_id, quota_type, amount, period, Utc::now())
            .await
    }

    async fn record_at(
        &self,
        user_id: &str,
        quota_type: &str,
        amount: u64,
        period: QuotaPeriod,
        now: DateTime<Utc>,
    ) -> Result<u64, GatewayError> {
        let key = Self::key(user_id, quota_type, period, now);
        let usage = self
            .store
            .incr(&key, i64::try_from(amount).unwrap_or(i64::MAX))
            .await?;
        if usage == i64::try_from(amount).unwrap_or(i64::MAX) {
            // First write of the period; attach the expiry.
            self.store.expire(&key, period.ttl()).await?;
        }
        Ok(u64::try_from(usage.max(0)).unwrap_or(0))
    }
}
