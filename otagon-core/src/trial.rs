//! Pro trials and tier changes
//!
//! A free user may take one Pro trial. Expiry is not enforced by a timer:
//! it is checked when a session starts, and an expired trial is downgraded
//! to free at that point.

use crate::config::{LimitsConfig, TrialConfig};
use crate::db::Database;
use crate::error::{Error, Result};
use crate::types::*;
use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;

/// Starts, checks and ends trials; changes tiers
pub struct TrialManager {
    db: Arc<Database>,
    trial: TrialConfig,
    limits: LimitsConfig,
}

impl TrialManager {
    pub fn new(db: Arc<Database>, trial: TrialConfig, limits: LimitsConfig) -> Self {
        Self { db, trial, limits }
    }

    /// Put a free user on a Pro trial
    pub fn start_trial(&self, user_id: &str, now: DateTime<Utc>) -> Result<User> {
        let pro_limits = self.limits.for_tier(Tier::Pro);
        let expires_at = Duration::try_days(self.trial.duration_days)
            .and_then(|duration| now.checked_add_signed(duration))
            .ok_or_else(|| {
                Error::Config(format!(
                    "trial.duration_days = {} is out of range",
                    self.trial.duration_days
                ))
            })?;

        let user = self.db.modify_user(user_id, |user| {
            if user.has_used_trial {
                return Err(Error::TrialUnavailable(
                    "trial has already been used".to_string(),
                ));
            }
            if user.tier != Tier::Free {
                return Err(Error::TrialUnavailable(format!(
                    "user is already on the {} tier",
                    user.tier.display_name()
                )));
            }

            user.apply_tier(Tier::Pro, pro_limits);
            user.is_on_trial = true;
            user.has_used_trial = true;
            user.trial_started_at = Some(now);
            user.trial_expires_at = Some(expires_at);
            user.updated_at = now;
            Ok(user.clone())
        })?;

        tracing::info!(
            user_id,
            expires_at = ?user.trial_expires_at,
            "Trial started"
        );
        Ok(user)
    }

    /// Evaluate the trial once, at session start.
    ///
    /// Expired trials are downgraded to free and the user record is reloaded.
    pub fn check_on_session_start(
        &self,
        user_id: &str,
        now: DateTime<Utc>,
    ) -> Result<TrialCheck> {
        let free_limits = self.limits.for_tier(Tier::Free);
        let warning = Duration::try_hours(self.trial.warning_hours).ok_or_else(|| {
            Error::Config(format!(
                "trial.warning_hours = {} is out of range",
                self.trial.warning_hours
            ))
        })?;

        let downgraded = self.db.modify_user(user_id, |user| {
            let expired = user.tier == Tier::Pro
                && user.is_on_trial
                && user.trial_expires_at.is_some_and(|expires| expires <= now);
            if expired {
                user.apply_tier(Tier::Free, free_limits);
                user.is_on_trial = false;
                user.updated_at = now;
            }
            Ok(expired)
        })?;

        let user = self
            .db
            .get_user(user_id)?
            .ok_or_else(|| Error::UserNotFound(user_id.to_string()))?;

        if downgraded {
            tracing::info!(user_id, "Trial expired, downgraded to free");
            return Ok(TrialCheck::Expired { user });
        }

        let expires_at = match (user.tier, user.is_on_trial, user.trial_expires_at) {
            (Tier::Pro, true, Some(expires_at)) => expires_at,
            _ => return Ok(TrialCheck::NotOnTrial { user }),
        };

        let remaining = expires_at - now;
        if remaining <= warning {
            let hours_left = remaining.num_hours();
            tracing::info!(user_id, hours_left, "Trial expiring soon");
            return Ok(TrialCheck::ExpiringSoon { user, hours_left });
        }

        Ok(TrialCheck::Active { user, expires_at })
    }

    /// Move a user to `tier` with that tier's limits; ends any trial
    pub fn set_tier(&self, user_id: &str, tier: Tier, now: DateTime<Utc>) -> Result<User> {
        let limits = self.limits.for_tier(tier);

        let user = self.db.modify_user(user_id, |user| {
            user.apply_tier(tier, limits);
            user.is_on_trial = false;
            user.updated_at = now;
            Ok(user.clone())
        })?;

        tracing::info!(user_id, tier = tier.as_str(), "Tier changed");
        Ok(user)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(d: u32, h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 10, d, h, 0, 0).unwrap()
    }

    fn setup() -> (TrialManager, String) {
        let db = Database::open_in_memory().unwrap();
        db.migrate().unwrap();
        let user = User::new("auth-t", "t@example.com", Tier::Free, TierLimits::FREE, at(1, 0));
        db.insert_user(&user).unwrap();
        let manager = TrialManager::new(
            Arc::new(db),
            TrialConfig::default(),
            LimitsConfig::default(),
        );
        (manager, user.id)
    }

    #[test]
    fn test_start_trial_grants_pro() {
        let (manager, user_id) = setup();
        let user = manager.start_trial(&user_id, at(1, 12)).unwrap();

        assert_eq!(user.tier, Tier::Pro);
        assert_eq!(user.text_limit, 1583);
        assert_eq!(user.image_limit, 328);
        assert!(user.is_on_trial);
        assert!(user.has_used_trial);
        assert_eq!(user.trial_expires_at, Some(at(15, 12)));
    }

    #[test]
    fn test_trial_only_once() {
        let (manager, user_id) = setup();
        manager.start_trial(&user_id, at(1, 12)).unwrap();
        manager.set_tier(&user_id, Tier::Free, at(2, 0)).unwrap();

        assert!(matches!(
            manager.start_trial(&user_id, at(3, 0)),
            Err(Error::TrialUnavailable(_))
        ));
    }

    #[test]
    fn test_paid_user_cannot_start_trial() {
        let (manager, user_id) = setup();
        manager.set_tier(&user_id, Tier::Vanguard, at(1, 1)).unwrap();
        assert!(matches!(
            manager.start_trial(&user_id, at(1, 2)),
            Err(Error::TrialUnavailable(_))
        ));
    }

    #[test]
    fn test_expired_trial_downgrades_to_free() {
        let (manager, user_id) = setup();
        manager.start_trial(&user_id, at(1, 12)).unwrap();

        let check = manager.check_on_session_start(&user_id, at(16, 0)).unwrap();
        match check {
            TrialCheck::Expired { user } => {
                assert_eq!(user.tier, Tier::Free);
                assert_eq!(user.text_limit, 55);
                assert_eq!(user.image_limit, 25);
                assert!(!user.is_on_trial);
                assert!(user.has_used_trial);
            }
            other => panic!("expected expiry, got {:?}", other),
        }

        // A second check finds nothing to do
        let check = manager.check_on_session_start(&user_id, at(17, 0)).unwrap();
        assert!(matches!(check, TrialCheck::NotOnTrial { .. }));
    }

    #[test]
    fn test_expiring_soon_warning() {
        let (manager, user_id) = setup();
        manager.start_trial(&user_id, at(1, 12)).unwrap();

        let check = manager.check_on_session_start(&user_id, at(15, 2)).unwrap();
        match check {
            TrialCheck::ExpiringSoon { user, hours_left } => {
                assert_eq!(hours_left, 10);
                assert_eq!(user.tier, Tier::Pro);
            }
            other => panic!("expected warning, got {:?}", other),
        }
    }

    #[test]
    fn test_active_trial() {
        let (manager, user_id) = setup();
        manager.start_trial(&user_id, at(1, 12)).unwrap();

        let check = manager.check_on_session_start(&user_id, at(5, 0)).unwrap();
        assert_eq!(
            check,
            TrialCheck::Active {
                user: check.user().clone(),
                expires_at: at(15, 12),
            }
        );
    }

    #[test]
    fn test_out_of_range_trial_length_is_config_error() {
        let db = Database::open_in_memory().unwrap();
        db.migrate().unwrap();
        let user = User::new("auth-t", "t@example.com", Tier::Free, TierLimits::FREE, at(1, 0));
        db.insert_user(&user).unwrap();
        let db = Arc::new(db);

        let manager = TrialManager::new(
            Arc::clone(&db),
            TrialConfig {
                duration_days: 1_000_000_000_000,
                warning_hours: 24,
            },
            LimitsConfig::default(),
        );
        assert!(matches!(
            manager.start_trial(&user.id, at(1, 12)),
            Err(Error::Config(_))
        ));
        let stored = db.get_user(&user.id).unwrap().unwrap();
        assert_eq!(stored.tier, Tier::Free);
        assert!(!stored.has_used_trial);

        let manager = TrialManager::new(
            db,
            TrialConfig {
                duration_days: 14,
                warning_hours: i64::MAX,
            },
            LimitsConfig::default(),
        );
        assert!(matches!(
            manager.check_on_session_start(&user.id, at(2, 0)),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_set_tier_ends_trial() {
        let (manager, user_id) = setup();
        manager.start_trial(&user_id, at(1, 12)).unwrap();

        let user = manager.set_tier(&user_id, Tier::Pro, at(2, 0)).unwrap();
        assert_eq!(user.tier, Tier::Pro);
        assert!(!user.is_on_trial);

        let check = manager.check_on_session_start(&user_id, at(20, 0)).unwrap();
        assert!(matches!(check, TrialCheck::NotOnTrial { user } if user.tier == Tier::Pro));
    }
}
