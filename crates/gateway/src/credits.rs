//! Credit accounting for metered APIs.
//!
//! Pre-check resolves the caller's balance and selects the outbound API
//! key according to the rotation phase; the commit step decrements the
//! balance only after an upstream response with effective status < 500.
//! Decrements for one user are serialized through a per-user async mutex
//! so concurrent requests cannot lose updates in the embedded profile.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{Datelike, Duration as ChronoDuration, TimeZone, Utc};
use dashmap::DashMap;
use subtle::ConstantTimeEq;
use tokio::sync::Mutex;

use doorman_cache::{CacheManager, CachePrefix};
use doorman_core::{
    Api, CreditDefinition, CreditTier, ResetFrequency, RotationPhase, UserCreditEntry, UserCredits,
};
use doorman_crypto::SecretCipher;
use doorman_store::{collections, ConfigStore, ConfigStoreExt, Filter};

use crate::error::GatewayError;

/// What the dispatcher needs to attach the upstream credential.
#[derive(Debug, Clone)]
pub struct CreditGrant {
    pub group: String,
    pub header_name: String,
    /// Decrypted outbound key.
    pub api_key: String,
    /// The user's tier definition, for input/output quota enforcement.
    pub tier: Option<CreditTier>,
}

/// Credit pre-check and commit.
pub struct CreditService {
    store: Arc<dyn ConfigStore>,
    cipher: Arc<SecretCipher>,
    /// Per-user decrement locks.
    user_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl std::fmt::Debug for CreditService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CreditService").finish_non_exhaustive()
    }
}

impl CreditService {
    #[must_use]
    pub fn new(store: Arc<dyn ConfigStore>, cipher: Arc<SecretCipher>) -> Self {
        Self {
            store,
            cipher,
            user_locks: DashMap::new(),
        }
    }

    fn lock_for(&self, username: &str) -> Arc<Mutex<()>> {
        self.user_locks
            .entry(username.to_owned())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    async fn load_definition(
        &self,
        cache: &CacheManager,
        group: &str,
    ) -> Result<CreditDefinition, GatewayError> {
        if let Some(def) = cache.get::<CreditDefinition>(CachePrefix::CreditDef, group).await? {
            return Ok(def);
        }
        let def: CreditDefinition = self
            .store
            .get_one(
                collections::CREDIT_DEFS,
                &Filter::new().eq("api_credit_group", group),
            )
            .await
            .map_err(|e| {
                if e.is_not_found() {
                    GatewayError::InsufficientCredits
                } else {
                    e.into()
                }
            })?;
        cache.set(CachePrefix::CreditDef, group, &def).await?;
        Ok(def)
    }

    async fn load_user_credits(&self, username: &str) -> Result<UserCredits, GatewayError> {
        self.store
            .get_one(
                collections::USER_CREDITS,
                &Filter::new().eq("username", username),
            )
            .await
            .map_err(|e| {
                if e.is_not_found() {
                    GatewayError::InsufficientCredits
                } else {
                    e.into()
                }
            })
    }

    /// Select the outbound key for the definition's rotation phase: the
    /// staged key is preferred as soon as the grace window opens and is the
    /// only valid key after expiry.
    fn outbound_key(&self, def: &CreditDefinition) -> Result<String, GatewayError> {
        let encrypted = match def.rotation_phase(Utc::now()) {
            RotationPhase::BeforeRotation => &def.api_key,
            RotationPhase::Grace | RotationPhase::AfterExpiry => def
                .api_key_new
                .as_ref()
                .ok_or_else(|| GatewayError::Internal("rotation phase without staged key".into()))?,
        };
        self.cipher
            .decrypt_str(encrypted)
            .map_err(|e| GatewayError::Internal(format!("credit key decrypt failed: {e}")))
    }

    /// Step 1 of §4.7: resolve the balance and pick the outbound key.
    /// Fails with `insufficient_credits` when the user has no record for
    /// the group or the balance is exhausted.
    pub async fn pre_check(
        &self,
        cache: &CacheManager,
        username: &str,
        api: &Api,
    ) -> Result<CreditGrant, GatewayError> {
        let Some(group) = api.api_credit_group.as_deref() else {
            return Err(GatewayError::Internal(
                "credits enabled without a credit group".into(),
            ));
        };
        let def = self.load_definition(cache, group).await?;
        let mut credits = self.load_user_credits(username).await?;

        let entry = credits
            .credits
            .get_mut(group)
            .ok_or(GatewayError::InsufficientCredits)?;

        self.apply_reset(username, group, &def, entry).await?;

        if entry.available_credits <= 0 {
            return Err(GatewayError::InsufficientCredits);
        }

        // A per-user override key wins over the definition pair.
        let api_key = match &entry.user_api_key {
            Some(encrypted) => self
                .cipher
                .decrypt_str(encrypted)
                .map_err(|e| GatewayError::Internal(format!("user key decrypt failed: {e}")))?,
            None => self.outbound_key(&def)?,
        };

        Ok(CreditGrant {
            group: group.to_owned(),
            header_name: def.api_key_header.clone(),
            api_key,
            tier: def.tier(&entry.tier_name).cloned(),
        })
    }

    /// Restore the tier grant when the reset boundary has passed.
    async fn apply_reset(
        &self,
        username: &str,
        group: &str,
        def: &CreditDefinition,
        entry: &mut UserCreditEntry,
    ) -> Result<(), GatewayError> {
        let Some(reset_date) = entry.reset_date else {
            return Ok(());
        };
        let now = Utc::now();
        if now < reset_date {
            return Ok(());
        }
        let Some(tier) = def.tier(&entry.tier_name) else {
            return Ok(());
        };
        let next_reset = match tier.reset_frequency {
            ResetFrequency::Daily => Some(reset_date + ChronoDuration::days(1)),
            ResetFrequency::Weekly => Some(reset_date + ChronoDuration::weeks(1)),
            ResetFrequency::Monthly => {
                let (year, month) = if reset_date.month() == 12 {
                    (reset_date.year() + 1, 1)
                } else {
                    (reset_date.year(), reset_date.month() + 1)
                };
                Utc.with_ymd_and_hms(year, month, 1, 0, 0, 0).single()
            }
            ResetFrequency::Never => None,
        };

        entry.available_credits = tier.credits;
        entry.reset_date = next_reset;
        self.write_entry(username, group, entry).await
    }

    async fn write_entry(
        &self,
        username: &str,
        group: &str,
        entry: &UserCreditEntry,
    ) -> Result<(), GatewayError> {
        // Rewrite the whole credits map for the user: the map is small and
        // `$set` on a nested path is not part of the facade surface.
        let mut credits = self.load_user_credits(username).await?;
        credits.credits.insert(group.to_owned(), entry.clone());
        let map = serde_json::to_value(&credits.credits)
            .map_err(|e| GatewayError::Internal(format!("credits encode failed: {e}")))?;
        self.store
            .update_one(
                collections::USER_CREDITS,
                &Filter::new().eq("username", username),
                serde_json::json!({ "credits": map }),
            )
            .await?;
        Ok(())
    }

    /// Step 4 of §4.7: decrement after a successful upstream call
    /// (effective status < 500). 5xx responses never reach this point.
    pub async fn commit(&self, username: &str, group: &str) -> Result<(), GatewayError> {
        let lock = self.lock_for(username);
        let _guard = lock.lock().await;

        let mut credits = self.load_user_credits(username).await?;
        let entry = credits
            .credits
            .get_mut(group)
            .ok_or(GatewayError::InsufficientCredits)?;
        entry.available_credits -= 1;
        let entry = entry.clone();
        self.write_entry(username, group, &entry).await
    }

    /// Inbound acceptance when the gateway itself validates a presented
    /// key: during the grace window either key matches; outside it only
    /// the phase-appropriate key does. Comparison is constant-time.
    pub fn key_accepted(&self, def: &CreditDefinition, presented: &str) -> bool {
        let decrypt = |enc: &str| self.cipher.decrypt_str(enc).ok();
        let matches = |expected: Option<String>| {
            expected.is_some_and(|expected| {
                expected.as_bytes().ct_eq(presented.as_bytes()).into()
            })
        };
        match def.rotation_phase(Utc::now()) {
            RotationPhase::BeforeRotation => matches(decrypt(&def.api_key)),
            RotationPhase::Grace => {
                matches(decrypt(&def.api_key))
                    || matches(def.api_key_new.as_deref().and_then(decrypt))
            }
            RotationPhase::AfterExpiry => {
                matches(def.api_key_new.as_deref().and_then(decrypt))
            }
        }
    }

    /// Seed helper used by tests and demo tooling.
    pub async fn grant(
        &self,
        username: &str,
        group: &str,
        tier_name: &str,
        amount: i64,
    ) -> Result<(), GatewayError> {
        let entry = UserCreditEntry {
            tier_name: tier_name.to_owned(),
            available_credits: amount,
            reset_date: None,
            user_api_key: None,
        };
        match self.load_user_credits(username).await {
            Ok(_) => self.write_entry(username, group, &entry).await,
            Err(GatewayError::InsufficientCredits) => {
                let credits = UserCredits {
                    username: username.to_owned(),
                    credits: BTreeMap::from([(group.to_owned(), entry)]),
                };
                self.store
                    .put_one(collections::USER_CREDITS, &credits)
                    .await?;
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}
