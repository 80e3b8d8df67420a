pub mod ledger;
pub mod quota;
pub mod sweeper;

pub use ledger::{GrantOutcome, ReferralBonus, SubscriptionLedger};
pub use quota::{QuotaEnforcer, QuotaLimits, UsageChannel};
pub use sweeper::{ExpirySweeper, SweepStats};

use chrono::{DateTime, Duration, Utc};
use thiserror::Error;

use crate::db::models::Tier;

#[derive(Debug, Error)]
pub enum LedgerError {
    /// The user has no subscription record. Registration must happen first;
    /// this is never silently defaulted.
    #[error("no subscription record for user {0}")]
    NotFound(i64),
    #[error("subscription storage unavailable")]
    Storage(#[from] sqlx::Error),
}

/// A user's effective entitlement at a point in time.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SubscriptionState {
    pub tier: Tier,
    /// End of the active premium or trial window.
    pub expires_at: Option<DateTime<Utc>>,
    /// Time left in the trial window, while on trial.
    pub trial_remaining: Option<Duration>,
}
