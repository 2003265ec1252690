//! Delay Scheduler: durable "fire at time T" items backed by the store.
//! Nothing is held in memory; a restart simply asks for `due(now)` again.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use reachclaw_core::error::Result;
use reachclaw_core::types::{ItemKind, NewScheduledItem, ScheduledItem};

use crate::persistence::OutreachDb;

/// Upper bound on items pulled per tick.
pub const DEFAULT_BATCH: usize = 500;

pub struct DelayScheduler {
    db: Arc<OutreachDb>,
    batch: usize,
}

impl DelayScheduler {
    pub fn new(db: Arc<OutreachDb>) -> Self {
        Self {
            db,
            batch: DEFAULT_BATCH,
        }
    }

    pub fn with_batch(mut self, batch: usize) -> Self {
        self.batch = batch.max(1);
        self
    }

    /// Schedule `kind` for a contact. Duplicates follow the store's policy.
    pub fn schedule(
        &self,
        contact_id: &str,
        kind: ItemKind,
        due_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<ScheduledItem> {
        let item = NewScheduledItem::for_contact(contact_id, kind, due_at);
        let created = self.db.create_scheduled_item(&item, now)?;
        tracing::debug!("🗓️ Scheduled {kind} #{} for {contact_id} at {due_at}", created.id);
        Ok(created)
    }

    /// Schedule a system-owned item.
    pub fn schedule_system(
        &self,
        kind: ItemKind,
        due_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<ScheduledItem> {
        self.db
            .create_scheduled_item(&NewScheduledItem::system(kind, due_at), now)
    }

    /// Unfired items with `due_at <= now`, oldest due first, ties by creation order.
    pub fn due(&self, now: DateTime<Utc>) -> Result<Vec<ScheduledItem>> {
        self.db.due_scheduled_items(now, self.batch)
    }

    /// Number of unfired items, due or not.
    pub fn backlog(&self) -> Result<u64> {
        self.db.unfired_count()
    }
}
