//! Metrics feed: state counts, quota headroom, backlog and funnel rates.

use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate, Utc};
use reachclaw_core::error::Result;
use reachclaw_core::lifecycle::ContactState;
use reachclaw_core::types::{ActionType, PostStatus};
use serde::Serialize;

use crate::persistence::OutreachDb;
use crate::quota::QuotaGuard;

#[derive(Debug, Clone, Serialize)]
pub struct QuotaStatus {
    pub action: ActionType,
    pub used: u32,
    pub ceiling: u32,
    pub remaining: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct Backlog {
    /// Unfired items, due or not.
    pub pending: u64,
    /// Unfired items already past due.
    pub overdue: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct PipelineMetrics {
    pub generated_at: DateTime<Utc>,
    /// Calendar date in the reference timezone.
    pub date: NaiveDate,
    pub total_contacts: u64,
    pub contacts_by_state: BTreeMap<String, u64>,
    pub quarantined: u64,
    pub hiring_signals: u64,
    pub quota: Vec<QuotaStatus>,
    pub backlog: Backlog,
    pub posts_by_status: BTreeMap<String, u64>,
    /// Connected-or-later over requested-or-later.
    pub acceptance_rate: f64,
    /// Replied over messaged-or-later.
    pub reply_rate: f64,
}

impl PipelineMetrics {
    pub fn collect(db: &OutreachDb, quota: &QuotaGuard, now: DateTime<Utc>) -> Result<Self> {
        let states = db.state_counts()?;
        let count = |s: ContactState| states.get(&s).copied().unwrap_or(0);

        let date = quota.date_of(now);
        let mut quota_status = Vec::with_capacity(ActionType::ALL.len());
        for action in ActionType::ALL {
            let used = db.counter(action, date)?;
            let ceiling = quota.ceiling(action);
            quota_status.push(QuotaStatus {
                action,
                used,
                ceiling,
                remaining: ceiling.saturating_sub(used),
            });
        }

        let posts = db.post_counts()?;
        let posts_by_status = PostStatus::ALL
            .into_iter()
            .map(|s| (s.as_str().to_string(), posts.get(&s).copied().unwrap_or(0)))
            .collect();

        let closed = count(ContactState::Replied) + count(ContactState::NoReply);
        let messaged_or_later = count(ContactState::Messaged) + closed;
        let connected_or_later = count(ContactState::Connected) + messaged_or_later;
        let requested_or_later = count(ContactState::Requested) + connected_or_later;

        Ok(Self {
            generated_at: now,
            date,
            total_contacts: states.values().sum(),
            contacts_by_state: states
                .iter()
                .map(|(s, n)| (s.as_str().to_string(), *n))
                .collect(),
            quarantined: db.quarantined_count()?,
            hiring_signals: db.hiring_signal_count()?,
            quota: quota_status,
            backlog: Backlog {
                pending: db.unfired_count()?,
                overdue: db.due_count(now)?,
            },
            posts_by_status,
            acceptance_rate: ratio(connected_or_later, requested_or_later),
            reply_rate: ratio(count(ContactState::Replied), messaged_or_later),
        })
    }
}

fn ratio(n: u64, d: u64) -> f64 {
    if d == 0 { 0.0 } else { n as f64 / d as f64 }
}
