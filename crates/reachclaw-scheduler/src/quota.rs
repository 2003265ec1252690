//! Quota Guard: daily action ceilings in a fixed reference timezone.

use std::sync::Arc;

use chrono::{DateTime, FixedOffset, NaiveDate, Utc};
use reachclaw_core::config::QuotaConfig;
use reachclaw_core::error::{OutreachError, Result};
use reachclaw_core::types::ActionType;

use crate::persistence::OutreachDb;

/// Why a consume request was denied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenyReason {
    DailyLimitReached,
}

/// Result of [`QuotaGuard::try_consume`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaDecision {
    Granted { count: u32, date: NaiveDate },
    Denied(DenyReason),
}

impl QuotaDecision {
    pub fn is_granted(&self) -> bool {
        matches!(self, QuotaDecision::Granted { .. })
    }
}

/// A granted unit of quota that can be handed back if the action never happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaReservation {
    pub action: ActionType,
    pub date: NaiveDate,
}

pub struct QuotaGuard {
    db: Arc<OutreachDb>,
    ceilings: QuotaConfig,
    tz: FixedOffset,
}

impl QuotaGuard {
    pub fn new(db: Arc<OutreachDb>, ceilings: QuotaConfig, tz: FixedOffset) -> Self {
        Self { db, ceilings, tz }
    }

    /// Calendar date of `at` in the reference timezone.
    pub fn date_of(&self, at: DateTime<Utc>) -> NaiveDate {
        at.with_timezone(&self.tz).date_naive()
    }

    pub fn ceiling(&self, action: ActionType) -> u32 {
        self.ceilings.ceiling(action)
    }

    /// Atomically take one unit of `action` for the day containing `at`.
    /// Denials never mutate the counter.
    pub fn try_consume(&self, action: ActionType, at: DateTime<Utc>) -> Result<QuotaDecision> {
        let date = self.date_of(at);
        let decision = match self
            .db
            .try_increment_counter(action, date, self.ceiling(action))?
        {
            Some(count) => QuotaDecision::Granted { count, date },
            None => QuotaDecision::Denied(DenyReason::DailyLimitReached),
        };
        Ok(decision)
    }

    /// Like [`try_consume`](Self::try_consume), mapping a denial to `QuotaExceeded`.
    pub fn reserve(&self, action: ActionType, at: DateTime<Utc>) -> Result<QuotaReservation> {
        match self.try_consume(action, at)? {
            QuotaDecision::Granted { date, .. } => Ok(QuotaReservation { action, date }),
            QuotaDecision::Denied(_) => Err(OutreachError::QuotaExceeded {
                action: action.to_string(),
                date: self.date_of(at).to_string(),
            }),
        }
    }

    /// Return a reservation whose action was not performed.
    /// Reservations from an elapsed day are left alone.
    pub fn release(&self, reservation: QuotaReservation, now: DateTime<Utc>) -> Result<bool> {
        let today = self.date_of(now);
        if reservation.date != today {
            tracing::debug!(
                "Quota for {} on {} is closed, not releasing",
                reservation.action,
                reservation.date
            );
            return Ok(false);
        }
        self.db
            .record_counter(reservation.action, reservation.date, -1, today)?;
        Ok(true)
    }

    /// Units still available today.
    pub fn remaining(&self, action: ActionType, now: DateTime<Utc>) -> Result<u32> {
        let used = self.db.counter(action, self.date_of(now))?;
        Ok(self.ceiling(action).saturating_sub(used))
    }
}
