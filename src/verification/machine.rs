//! pure transitions of the verification lifecycle
//!
//! ```text
//! pending --match--------------------> verified
//! pending --miss, attempts == MAX----> failed
//! pending --now > expires_at---------> expired
//! pending --forced completion--------> force_completed
//! ```
//!
//! Nothing here touches the store; the engine applies each step with a
//! compare-and-swap so concurrent attempts on one row serialize.

use chrono::{DateTime, Utc};

use crate::store::model::{Verification, VerificationStatus};

pub const MAX_ATTEMPTS: u32 = 5;

/// What an attempt must do before any evidence is looked up
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    /// Already terminal, report as is
    Terminal,
    /// Every attempt is reserved but the row is still pending. The caller
    /// looks up evidence once more without reserving and concludes.
    Exhausted,
    /// The challenge lapsed; persist this row and stop
    Expire(Verification),
    /// Reserve an attempt by persisting this row, then look up evidence
    Reserve(Verification),
}

pub fn begin_attempt(current: &Verification, now: DateTime<Utc>) -> Step {
    if current.status.is_terminal() {
        return Step::Terminal;
    }

    if current.is_expired_at(now) {
        let mut expired = current.clone();
        expired.status = VerificationStatus::Expired;
        expired.completed_at = Some(now);
        return Step::Expire(expired);
    }

    if current.attempts >= MAX_ATTEMPTS {
        return Step::Exhausted;
    }

    let mut reserved = current.clone();
    reserved.attempts = current.attempts.saturating_add(1);
    Step::Reserve(reserved)
}

/// Outcome of a reserved attempt. `None` means the row stays pending.
pub fn conclude(
    reserved: &Verification,
    matched: bool,
    now: DateTime<Utc>,
) -> Option<Verification> {
    if reserved.status.is_terminal() {
        return None;
    }

    if matched {
        let mut verified = reserved.clone();
        verified.status = VerificationStatus::Verified;
        verified.completed_at = Some(now);
        verified.verified_at = Some(now);
        return Some(verified);
    }

    if reserved.attempts >= MAX_ATTEMPTS {
        let mut failed = reserved.clone();
        failed.status = VerificationStatus::Failed;
        failed.completed_at = Some(now);
        return Some(failed);
    }

    None
}

pub fn force_complete(current: &Verification, now: DateTime<Utc>) -> Option<Verification> {
    if current.status.is_terminal() {
        return None;
    }

    let mut forced = current.clone();
    forced.status = VerificationStatus::ForceCompleted;
    forced.completed_at = Some(now);
    Some(forced)
}

pub fn attempts_remaining(verification: &Verification) -> u32 {
    MAX_ATTEMPTS.saturating_sub(verification.attempts)
}
