//! Monthly query quotas
//!
//! Each user has one window per [`QueryKind`]. A window resets to zero the
//! first time it is touched in a calendar month (UTC) different from the one
//! of `last_reset_at`. The reset, the limit check and the increment run in a
//! single database transaction, so two tabs racing on the same account can
//! neither double-count nor skip a reset.

use crate::db::Database;
use crate::error::{Error, Result};
use crate::types::*;
use chrono::{DateTime, Datelike, TimeZone, Utc};
use std::sync::Arc;

/// Whether `now` is in a different calendar month than `last_reset_at`
pub fn needs_reset(last_reset_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
    last_reset_at.year() != now.year() || last_reset_at.month() != now.month()
}

/// First instant of the month after `now`
pub fn next_reset_at(now: DateTime<Utc>) -> DateTime<Utc> {
    let (year, month) = if now.month() == 12 {
        (now.year() + 1, 1)
    } else {
        (now.year(), now.month() + 1)
    };
    Utc.with_ymd_and_hms(year, month, 1, 0, 0, 0)
        .single()
        .unwrap_or_else(|| {
            tracing::warn!(%now, "Failed to compute next reset, using now");
            now
        })
}

/// Zero both windows if the month rolled over. Returns true if it did.
fn apply_reset(user: &mut User, now: DateTime<Utc>) -> bool {
    if !needs_reset(user.last_reset_at, now) {
        return false;
    }

    tracing::info!(
        user_id = %user.id,
        previous_reset = %user.last_reset_at,
        text_count = user.text_count,
        image_count = user.image_count,
        "Monthly quota reset"
    );

    user.text_count = 0;
    user.image_count = 0;
    user.last_reset_at = now;
    user.updated_at = now;
    true
}

/// Compare the current window against its limit
pub fn evaluate(user: &User, kind: QueryKind) -> QuotaDecision {
    let used = user.count(kind);
    let limit = user.limit(kind);

    if used < limit {
        return QuotaDecision {
            kind,
            allowed: true,
            reason: None,
            used,
            limit,
        };
    }

    let hint = if user.tier.is_paid() {
        "The limit resets at the start of next month."
    } else {
        "Upgrade to Pro for more queries."
    };
    QuotaDecision {
        kind,
        allowed: false,
        reason: Some(format!(
            "Monthly {} query limit reached ({}/{}). {}",
            kind, used, limit, hint
        )),
        used,
        limit,
    }
}

/// Apply any pending reset, then take one query of `kind` if it fits.
///
/// Mutates `user` in place; the caller owns the transaction. A denied
/// decision leaves the counters untouched apart from the reset.
pub(crate) fn consume(user: &mut User, kind: QueryKind, now: DateTime<Utc>) -> QuotaDecision {
    apply_reset(user, now);
    let decision = evaluate(user, kind);
    if !decision.allowed {
        return decision;
    }

    let count = user.count_mut(kind);
    *count += 1;
    let used = *count;
    user.updated_at = now;
    QuotaDecision { used, ..decision }
}

/// Checks and consumes per-user query quotas
pub struct QuotaTracker {
    db: Arc<Database>,
}

impl QuotaTracker {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Decide whether one more query of `kind` is allowed.
    ///
    /// Applies (and persists) a pending monthly reset first. Does not consume.
    pub fn can_send_query(
        &self,
        user_id: &str,
        kind: QueryKind,
        now: DateTime<Utc>,
    ) -> Result<QuotaDecision> {
        let decision = self.db.modify_user(user_id, |user| {
            apply_reset(user, now);
            Ok(evaluate(user, kind))
        })?;

        tracing::debug!(
            user_id,
            kind = kind.as_str(),
            allowed = decision.allowed,
            used = decision.used,
            limit = decision.limit,
            "Quota checked"
        );
        Ok(decision)
    }

    /// Consume one query of `kind`.
    ///
    /// Returns the window after the increment, or `Error::QuotaExceeded` with
    /// the denying decision. A pending reset is persisted either way.
    pub fn record_query(
        &self,
        user_id: &str,
        kind: QueryKind,
        now: DateTime<Utc>,
    ) -> Result<QuotaDecision> {
        let decision = self
            .db
            .modify_user(user_id, |user| Ok(consume(user, kind, now)))?;

        if !decision.allowed {
            tracing::info!(
                user_id,
                kind = kind.as_str(),
                used = decision.used,
                limit = decision.limit,
                "Query denied by quota"
            );
            return Err(Error::QuotaExceeded(decision));
        }

        tracing::debug!(
            user_id,
            kind = kind.as_str(),
            used = decision.used,
            limit = decision.limit,
            "Query recorded"
        );
        Ok(decision)
    }

    /// Both windows after applying any pending reset
    pub fn usage(&self, user_id: &str, now: DateTime<Utc>) -> Result<UsageSummary> {
        self.db.modify_user(user_id, |user| {
            apply_reset(user, now);
            Ok(UsageSummary {
                user_id: user.id.clone(),
                tier: user.tier,
                is_on_trial: user.is_on_trial,
                text: QuotaWindow {
                    used: user.text_count,
                    limit: user.text_limit,
                },
                image: QuotaWindow {
                    used: user.image_count,
                    limit: user.image_limit,
                },
                last_reset_at: user.last_reset_at,
                next_reset_at: next_reset_at(now),
            })
        })
    }
}
