use serde::{Deserialize, Serialize};

/// A service tier: concentric rate windows plus queueing behavior.
///
/// Tier limits are checked before the per-user fallback fields on
/// [`User`](crate::User); a user with a tier gets the tier's windows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tier {
    pub tier_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requests_per_minute: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requests_per_hour: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requests_per_day: Option<u64>,
    /// When `true`, over-limit requests queue instead of hard-rejecting.
    #[serde(default)]
    pub throttle_enabled: bool,
    /// Upper bound on queue wait before a 429.
    #[serde(default = "default_max_queue_time_ms")]
    pub max_queue_time_ms: u64,
    /// Token-bucket burst allowance on top of the minute window.
    #[serde(default)]
    pub burst_allowance: u64,
}

fn default_max_queue_time_ms() -> u64 {
    5_000
}

impl Tier {
    /// The three concentric windows as `(limit, window_seconds)` pairs,
    /// tightest first.
    #[must_use]
    pub fn windows(&self) -> Vec<(u64, u64)> {
        let mut out = Vec::with_capacity(3);
        if let Some(limit) = self.requests_per_minute {
            out.push((limit, 60));
        }
        if let Some(limit) = self.requests_per_hour {
            out.push((limit, 3_600));
        }
        if let Some(limit) = self.requests_per_day {
            out.push((limit, 86_400));
        }
        out
    }
}
