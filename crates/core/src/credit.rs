use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::api::RotationPhase;

/// How often a credit tier's grant resets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ResetFrequency {
    Daily,
    Weekly,
    #[default]
    Monthly,
    Never,
}

/// One purchasable tier within a credit group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreditTier {
    pub tier_name: String,
    /// Credits granted per reset period.
    pub credits: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_limit: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_limit: Option<u64>,
    #[serde(default)]
    pub reset_frequency: ResetFrequency,
}

/// A credit group definition: the upstream credential pair plus its tiers.
///
/// Both keys are stored AEAD-encrypted. During the rotation grace window
/// `[rotation_start, rotation_expires)` either key is accepted inbound,
/// while the outbound side prefers `api_key_new`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreditDefinition {
    pub api_credit_group: String,
    /// Encrypted primary upstream key.
    pub api_key: String,
    /// Encrypted replacement key staged for rotation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key_new: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key_rotation_start: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key_rotation_expires: Option<DateTime<Utc>>,
    /// Header name the outbound key is attached under.
    pub api_key_header: String,
    #[serde(default)]
    pub credit_tiers: Vec<CreditTier>,
}

impl CreditDefinition {
    /// Resolve the rotation phase at `now`.
    ///
    /// With no staged key or no window configured the group is permanently
    /// [`RotationPhase::BeforeRotation`].
    #[must_use]
    pub fn rotation_phase(&self, now: DateTime<Utc>) -> RotationPhase {
        let (Some(start), Some(expires)) =
            (self.api_key_rotation_start, self.api_key_rotation_expires)
        else {
            return RotationPhase::BeforeRotation;
        };
        if self.api_key_new.is_none() || now < start {
            RotationPhase::BeforeRotation
        } else if now < expires {
            RotationPhase::Grace
        } else {
            RotationPhase::AfterExpiry
        }
    }

    #[must_use]
    pub fn tier(&self, name: &str) -> Option<&CreditTier> {
        self.credit_tiers.iter().find(|t| t.tier_name == name)
    }
}

/// One user's balance within a credit group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserCreditEntry {
    pub tier_name: String,
    pub available_credits: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reset_date: Option<DateTime<Utc>>,
    /// Encrypted per-user override key; wins over the definition keys.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_api_key: Option<String>,
}

/// All credit balances for one user, keyed by credit group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct UserCredits {
    pub username: String,
    #[serde(default)]
    pub credits: BTreeMap<String, UserCreditEntry>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn def(start: Option<i64>, expires: Option<i64>, staged: bool) -> CreditDefinition {
        CreditDefinition {
            api_credit_group: "g1".into(),
            api_key: "enc-old".into(),
            api_key_new: staged.then(|| "enc-new".into()),
            api_key_rotation_start: start.map(|s| Utc.timestamp_opt(s, 0).unwrap()),
            api_key_rotation_expires: expires.map(|s| Utc.timestamp_opt(s, 0).unwrap()),
            api_key_header: "x-api-key".into(),
            credit_tiers: vec![],
        }
    }

    #[test]
    fn no_staged_key_means_before_rotation() {
        let d = def(Some(100), Some(200), false);
        let now = Utc.timestamp_opt(150, 0).unwrap();
        assert_eq!(d.rotation_phase(now), RotationPhase::BeforeRotation);
    }

    #[test]
    fn grace_window_is_half_open() {
        let d = def(Some(100), Some(200), true);
        let before = Utc.timestamp_opt(99, 0).unwrap();
        let at_start = Utc.timestamp_opt(100, 0).unwrap();
        let inside = Utc.timestamp_opt(150, 0).unwrap();
        let at_expiry = Utc.timestamp_opt(200, 0).unwrap();
        assert_eq!(d.rotation_phase(before), RotationPhase::BeforeRotation);
        assert_eq!(d.rotation_phase(at_start), RotationPhase::Grace);
        assert_eq!(d.rotation_phase(inside), RotationPhase::Grace);
        assert_eq!(d.rotation_phase(at_expiry), RotationPhase::AfterExpiry);
    }
}
