//! SQLite-backed persistent store for contacts, daily counters, scheduled items,
//! content posts, daily gates and the audit log.
//! Every multi-row mutation runs inside one `BEGIN IMMEDIATE` transaction.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use reachclaw_core::error::{OutreachError, Result};
use reachclaw_core::lifecycle::ContactState;
use reachclaw_core::types::{
    ActionType, AuditEntry, Contact, ContactFilter, ContentPost, DailyActionCounter,
    DuplicatePolicy, ItemKind, ItemOutcome, ItemOwner, NewScheduledItem, PostStatus, RawContact,
    ScheduledItem,
};
use rusqlite::types::Value as SqlValue;
use rusqlite::{Connection, ErrorCode, OptionalExtension, Row, TransactionBehavior, params};

/// SQLite-backed persistence store: single source of truth for the pipeline.
pub struct OutreachDb {
    conn: Mutex<Connection>,
    policy: DuplicatePolicy,
}

/// A contact transition plus everything that must land with it.
#[derive(Debug)]
pub struct TransitionWrite<'a> {
    /// The contact as it should look after the transition.
    pub contact: &'a Contact,
    /// The persisted state the transition was computed from.
    pub expected_state: ContactState,
    /// Item that triggered the transition, resolved in the same unit.
    pub fire: Option<(i64, ItemOutcome)>,
    pub schedule: Vec<NewScheduledItem>,
    /// Retire every unfired item the contact owns (opt-out).
    pub suppress_pending: bool,
    pub audit: Option<AuditRecord>,
}

#[derive(Debug, Clone)]
pub struct AuditRecord {
    pub actor: String,
    pub action: String,
    pub detail: Option<String>,
}

/// Whether a discovery upsert created or refreshed a contact.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoveryUpsert {
    Inserted,
    Updated,
}

const CONTACT_COLUMNS: &str = "id, name, organization, title, location, ai_relevance_score, \
    hiring_signal, profile, state, discovered_at, connection_requested_at, connected_at, \
    message_sent_at, replied_at, closed_no_reply_at, opted_out_at, quarantined, \
    quarantine_reason, failure_count, retry_after, last_error, updated_at";

const ITEM_COLUMNS: &str =
    "id, contact_id, kind, due_at, fired, fired_at, outcome, last_error, created_at";

const POST_COLUMNS: &str =
    "id, generated_at, status, text, scheduled_publish_at, published_at, template, last_error";

impl OutreachDb {
    /// Open or create the outreach database.
    pub fn open(path: &Path, policy: DuplicatePolicy) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path).map_err(storage_err)?;
        conn.query_row("PRAGMA journal_mode=WAL", [], |_| Ok(()))
            .map_err(storage_err)?;
        Self::init(conn, policy)
    }

    /// In-memory database, used by tests and dry runs.
    pub fn open_in_memory(policy: DuplicatePolicy) -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(storage_err)?;
        Self::init(conn, policy)
    }

    fn init(conn: Connection, policy: DuplicatePolicy) -> Result<Self> {
        conn.busy_timeout(std::time::Duration::from_secs(5))
            .map_err(storage_err)?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")
            .map_err(storage_err)?;
        Self::migrate(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            policy,
        })
    }

    pub fn duplicate_policy(&self) -> DuplicatePolicy {
        self.policy
    }

    /// Run migrations to create tables.
    fn migrate(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS contacts (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL DEFAULT '',
                organization TEXT NOT NULL DEFAULT '',
                title TEXT NOT NULL DEFAULT '',
                location TEXT NOT NULL DEFAULT '',
                ai_relevance_score REAL NOT NULL DEFAULT 0.0,
                hiring_signal INTEGER NOT NULL DEFAULT 0,
                profile TEXT NOT NULL DEFAULT 'null',   -- JSON document
                state TEXT NOT NULL,                    -- cache of the timestamp set
                discovered_at TEXT NOT NULL,
                connection_requested_at TEXT,
                connected_at TEXT,
                message_sent_at TEXT,
                replied_at TEXT,
                closed_no_reply_at TEXT,
                opted_out_at TEXT,
                quarantined INTEGER NOT NULL DEFAULT 0,
                quarantine_reason TEXT,
                failure_count INTEGER NOT NULL DEFAULT 0,
                retry_after TEXT,
                last_error TEXT,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_contacts_state ON contacts(state, ai_relevance_score);
            CREATE INDEX IF NOT EXISTS idx_contacts_org ON contacts(organization);

            -- One row per (action_type, calendar date in the reference timezone)
            CREATE TABLE IF NOT EXISTS daily_counters (
                action_type TEXT NOT NULL,
                date TEXT NOT NULL,
                count INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (action_type, date)
            );

            -- Append-only deferred actions
            CREATE TABLE IF NOT EXISTS scheduled_items (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                contact_id TEXT REFERENCES contacts(id),  -- NULL = system-owned
                kind TEXT NOT NULL,
                due_at TEXT NOT NULL,
                fired INTEGER NOT NULL DEFAULT 0,
                fired_at TEXT,
                outcome TEXT,
                last_error TEXT,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_items_due ON scheduled_items(fired, due_at, id);
            CREATE INDEX IF NOT EXISTS idx_items_contact ON scheduled_items(contact_id);
            CREATE UNIQUE INDEX IF NOT EXISTS idx_items_one_unfired
                ON scheduled_items(IFNULL(contact_id, ''), kind) WHERE fired = 0;
            CREATE TRIGGER IF NOT EXISTS scheduled_items_fired_sticky
                BEFORE UPDATE OF fired ON scheduled_items
                WHEN OLD.fired = 1 AND NEW.fired = 0
                BEGIN SELECT RAISE(ABORT, 'fired items cannot be unfired'); END;
            CREATE TRIGGER IF NOT EXISTS scheduled_items_append_only
                BEFORE DELETE ON scheduled_items
                BEGIN SELECT RAISE(ABORT, 'scheduled items are append-only'); END;

            CREATE TABLE IF NOT EXISTS content_posts (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                generated_at TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending_approval',
                text TEXT NOT NULL,
                scheduled_publish_at TEXT NOT NULL,
                published_at TEXT,
                template TEXT NOT NULL DEFAULT '',
                last_error TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_posts_status ON content_posts(status, scheduled_publish_at);

            -- Once-per-day jobs (nightly discovery, morning content)
            CREATE TABLE IF NOT EXISTS daily_gates (
                name TEXT PRIMARY KEY,
                last_fired_date TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS audit_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                contact_id TEXT,
                actor TEXT NOT NULL,
                action TEXT NOT NULL,
                detail TEXT,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_audit_contact ON audit_log(contact_id);
            ",
        )
        .map_err(storage_err)?;
        Ok(())
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| OutreachError::storage(format!("connection lock poisoned: {e}")))
    }

    /// Run `f` inside one immediate transaction. Commits on Ok, rolls back on Err.
    pub fn with_transaction<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        let mut conn = self.lock()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(storage_err)?;
        let value = f(&tx)?;
        tx.commit().map_err(storage_err)?;
        Ok(value)
    }

    // ─── Contacts ──────────────────────────────────────────────

    pub fn find(&self, id: &str) -> Result<Option<Contact>> {
        let conn = self.lock()?;
        find_contact(&conn, id)
    }

    pub fn get(&self, id: &str) -> Result<Contact> {
        self.find(id)?
            .ok_or_else(|| OutreachError::NotFound(format!("contact {id}")))
    }

    /// Insert or overwrite a contact. Rejects a state that disagrees with the timestamps.
    pub fn upsert(&self, contact: &Contact) -> Result<()> {
        contact.validate()?;
        self.with_transaction(|tx| upsert_contact(tx, contact))
    }

    /// Insert a newly discovered contact, or refresh the profile of a known one.
    pub fn upsert_discovered(&self, raw: &RawContact, now: DateTime<Utc>) -> Result<DiscoveryUpsert> {
        self.with_transaction(|tx| match find_contact(tx, &raw.id)? {
            Some(mut existing) => {
                existing.merge_profile(raw, now);
                upsert_contact(tx, &existing)?;
                Ok(DiscoveryUpsert::Updated)
            }
            None => {
                let contact = Contact::discovered(raw.clone(), now);
                contact.validate()?;
                upsert_contact(tx, &contact)?;
                Ok(DiscoveryUpsert::Inserted)
            }
        })
    }

    pub fn list(&self, filter: &ContactFilter) -> Result<Vec<Contact>> {
        let mut sql = format!("SELECT {CONTACT_COLUMNS} FROM contacts WHERE 1=1");
        let mut values: Vec<SqlValue> = Vec::new();
        if let Some(state) = filter.state {
            values.push(SqlValue::Text(state.as_str().into()));
            sql.push_str(&format!(" AND state = ?{}", values.len()));
        }
        if let Some(org) = &filter.organization {
            values.push(SqlValue::Text(org.clone()));
            sql.push_str(&format!(" AND organization = ?{}", values.len()));
        }
        if let Some(after) = filter.discovered_after {
            values.push(SqlValue::Text(ts(&after)));
            sql.push_str(&format!(" AND discovered_at >= ?{}", values.len()));
        }
        if let Some(before) = filter.discovered_before {
            values.push(SqlValue::Text(ts(&before)));
            sql.push_str(&format!(" AND discovered_at < ?{}", values.len()));
        }
        if let Some(quarantined) = filter.quarantined {
            values.push(SqlValue::Integer(quarantined as i64));
            sql.push_str(&format!(" AND quarantined = ?{}", values.len()));
        }
        sql.push_str(" ORDER BY discovered_at ASC, id ASC");
        if let Some(limit) = filter.limit {
            sql.push_str(&format!(" LIMIT {limit}"));
        }

        let conn = self.lock()?;
        let mut stmt = conn.prepare(&sql).map_err(storage_err)?;
        let rows = stmt
            .query_map(rusqlite::params_from_iter(values), contact_from_row)
            .map_err(storage_err)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(storage_err)
    }

    /// Discovered contacts eligible for a connection request, best first.
    pub fn eligible_for_request(
        &self,
        threshold: f64,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Contact>> {
        let decoded = {
            let conn = self.lock()?;
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {CONTACT_COLUMNS} FROM contacts
                     WHERE state = 'discovered'
                       AND quarantined = 0
                       AND opted_out_at IS NULL
                       AND ai_relevance_score >= ?1
                       AND (retry_after IS NULL OR retry_after <= ?2)
                     ORDER BY ai_relevance_score DESC, discovered_at ASC, id ASC
                     LIMIT ?3"
                ))
                .map_err(storage_err)?;
            let rows = stmt
                .query_map(params![threshold, ts(&now), limit as i64], |row| {
                    Ok((row.get::<_, String>(0)?, contact_from_row(row)))
                })
                .map_err(storage_err)?;
            let decoded = rows.collect::<rusqlite::Result<Vec<_>>>().map_err(storage_err)?;
            decoded
        };

        // An unreadable contact is quarantined rather than failing the whole batch.
        let mut contacts = Vec::with_capacity(decoded.len());
        for (id, contact) in decoded {
            match contact {
                Ok(contact) => contacts.push(contact),
                Err(e) => {
                    tracing::error!("🚨 Contact {id} is unreadable, quarantining: {e}");
                    self.quarantine(&id, &e.to_string(), now)?;
                }
            }
        }
        Ok(contacts)
    }

    /// Record a failed attempt and when the contact may be retried.
    pub fn record_failure(
        &self,
        id: &str,
        error: &str,
        retry_after: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE contacts SET failure_count = failure_count + 1, retry_after = ?1,
                 last_error = ?2, updated_at = ?3 WHERE id = ?4",
            params![ts(&retry_after), error, ts(&now), id],
        )
        .map_err(storage_err)?;
        Ok(())
    }

    /// Record why a contact was not acted on, without counting it as a failure.
    pub fn note(&self, id: &str, reason: &str) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE contacts SET last_error = ?1 WHERE id = ?2",
            params![reason, id],
        )
        .map_err(storage_err)?;
        Ok(())
    }

    /// Take a contact out of automated processing.
    pub fn quarantine(&self, id: &str, reason: &str, now: DateTime<Utc>) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE contacts SET quarantined = 1, quarantine_reason = ?1, last_error = ?1,
                 updated_at = ?2 WHERE id = ?3",
            params![reason, ts(&now), id],
        )
        .map_err(storage_err)?;
        Ok(())
    }

    /// Apply a contact transition together with its item and audit writes.
    pub fn apply_transition(
        &self,
        write: &TransitionWrite<'_>,
        now: DateTime<Utc>,
    ) -> Result<Vec<ScheduledItem>> {
        write.contact.validate()?;
        let policy = self.policy;
        self.with_transaction(|tx| {
            let current: Option<String> = tx
                .query_row(
                    "SELECT state FROM contacts WHERE id = ?1",
                    [&write.contact.id],
                    |r| r.get(0),
                )
                .optional()
                .map_err(storage_err)?;
            let current = current
                .ok_or_else(|| OutreachError::NotFound(format!("contact {}", write.contact.id)))?;
            if current != write.expected_state.as_str() {
                return Err(OutreachError::Conflict(format!(
                    "{} is {current}, expected {}",
                    write.contact.id, write.expected_state
                )));
            }

            upsert_contact(tx, write.contact)?;

            if let Some((item_id, outcome)) = write.fire {
                if !mark_fired_tx(tx, item_id, outcome, now)? {
                    return Err(OutreachError::Conflict(format!("item {item_id} already fired")));
                }
            }
            if write.suppress_pending {
                let suppressed = tx
                    .execute(
                        "UPDATE scheduled_items SET fired = 1, fired_at = ?1, outcome = ?2
                         WHERE contact_id = ?3 AND fired = 0",
                        params![ts(&now), ItemOutcome::SuppressedOptOut.as_str(), write.contact.id],
                    )
                    .map_err(storage_err)?;
                tracing::debug!("🔕 Suppressed {suppressed} pending item(s) for {}", write.contact.id);
            }

            let mut created = Vec::with_capacity(write.schedule.len());
            for item in &write.schedule {
                created.push(insert_item_tx(tx, item, policy, now)?);
            }

            if let Some(audit) = &write.audit {
                insert_audit_tx(tx, Some(&write.contact.id), audit, now)?;
            }
            Ok(created)
        })
    }

    // ─── Daily counters ──────────────────────────────────────

    /// Atomically increment the (action, date) counter unless that would exceed `ceiling`.
    /// Returns the new count, or `None` if the ceiling is already reached.
    pub fn try_increment_counter(
        &self,
        action: ActionType,
        date: NaiveDate,
        ceiling: u32,
    ) -> Result<Option<u32>> {
        if ceiling == 0 {
            return Ok(None);
        }
        self.with_transaction(|tx| {
            let changed = tx
                .execute(
                    "INSERT INTO daily_counters (action_type, date, count) VALUES (?1, ?2, 1)
                     ON CONFLICT(action_type, date) DO UPDATE SET count = count + 1
                     WHERE count < ?3",
                    params![action.as_str(), day(&date), ceiling],
                )
                .map_err(storage_err)?;
            if changed == 0 {
                return Ok(None);
            }
            counter_tx(tx, action, date).map(Some)
        })
    }

    /// Adjust a counter by `delta` (floored at zero). Rows before `today` are closed.
    pub fn record_counter(
        &self,
        action: ActionType,
        date: NaiveDate,
        delta: i64,
        today: NaiveDate,
    ) -> Result<u32> {
        if date < today {
            return Err(OutreachError::storage(format!(
                "counter {action} for {date} is closed"
            )));
        }
        self.with_transaction(|tx| {
            tx.execute(
                "INSERT INTO daily_counters (action_type, date, count) VALUES (?1, ?2, MAX(0, ?3))
                 ON CONFLICT(action_type, date) DO UPDATE SET count = MAX(0, count + ?3)",
                params![action.as_str(), day(&date), delta],
            )
            .map_err(storage_err)?;
            counter_tx(tx, action, date)
        })
    }

    pub fn counter(&self, action: ActionType, date: NaiveDate) -> Result<u32> {
        let conn = self.lock()?;
        counter_tx(&conn, action, date)
    }

    pub fn counters_for(&self, date: NaiveDate) -> Result<Vec<DailyActionCounter>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare("SELECT action_type, count FROM daily_counters WHERE date = ?1 ORDER BY action_type")
            .map_err(storage_err)?;
        let rows = stmt
            .query_map([day(&date)], |row| {
                let action: String = row.get(0)?;
                let count: u32 = row.get(1)?;
                Ok((action, count))
            })
            .map_err(storage_err)?;
        let mut counters = Vec::new();
        for row in rows {
            let (action, count) = row.map_err(storage_err)?;
            if let Some(action) = ActionType::parse(&action) {
                counters.push(DailyActionCounter { action, date, count });
            }
        }
        Ok(counters)
    }

    // ─── Scheduled items ──────────────────────────────────────

    pub fn create_scheduled_item(
        &self,
        item: &NewScheduledItem,
        now: DateTime<Utc>,
    ) -> Result<ScheduledItem> {
        let policy = self.policy;
        self.with_transaction(|tx| insert_item_tx(tx, item, policy, now))
    }

    /// Unfired items with `due_at <= now`, oldest due first, ties by creation order.
    ///
    /// Items whose owner is quarantined or still backing off are left out so
    /// they cannot crowd the batch. Rows that fail to decode are retired with
    /// [`ItemOutcome::Unreadable`] and skipped.
    pub fn due_scheduled_items(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<ScheduledItem>> {
        let decoded = {
            let conn = self.lock()?;
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {ITEM_COLUMNS} FROM scheduled_items
                     WHERE fired = 0 AND due_at <= ?1
                       AND NOT EXISTS (
                           SELECT 1 FROM contacts c
                           WHERE c.id = scheduled_items.contact_id
                             AND (c.quarantined = 1 OR c.retry_after > ?1)
                       )
                     ORDER BY due_at ASC, id ASC
                     LIMIT ?2"
                ))
                .map_err(storage_err)?;
            let rows = stmt
                .query_map(params![ts(&now), limit as i64], |row| {
                    Ok((row.get::<_, i64>(0)?, item_from_row(row)))
                })
                .map_err(storage_err)?;
            let decoded = rows.collect::<rusqlite::Result<Vec<_>>>().map_err(storage_err)?;
            decoded
        };

        let mut items = Vec::with_capacity(decoded.len());
        for (id, item) in decoded {
            match item {
                Ok(item) => items.push(item),
                Err(e) => {
                    tracing::error!("🚨 Scheduled item #{id} is unreadable, retiring it: {e}");
                    self.retire_unreadable_item(id, &e.to_string(), now)?;
                }
            }
        }
        Ok(items)
    }

    fn retire_unreadable_item(&self, item_id: i64, error: &str, now: DateTime<Utc>) -> Result<()> {
        self.with_transaction(|tx| {
            tx.execute(
                "UPDATE scheduled_items SET fired = 1, fired_at = ?1, outcome = ?2, last_error = ?3
                 WHERE id = ?4 AND fired = 0",
                params![ts(&now), ItemOutcome::Unreadable.as_str(), error, item_id],
            )
            .map_err(storage_err)?;
            Ok(())
        })
    }

    pub fn get_item(&self, id: i64) -> Result<ScheduledItem> {
        let conn = self.lock()?;
        conn.query_row(
            &format!("SELECT {ITEM_COLUMNS} FROM scheduled_items WHERE id = ?1"),
            [id],
            item_from_row,
        )
        .optional()
        .map_err(storage_err)?
        .ok_or_else(|| OutreachError::NotFound(format!("scheduled item {id}")))
    }

    /// Full item history for an owner, in creation order.
    pub fn items_for(&self, owner: &ItemOwner) -> Result<Vec<ScheduledItem>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {ITEM_COLUMNS} FROM scheduled_items WHERE contact_id IS ?1 ORDER BY id"
            ))
            .map_err(storage_err)?;
        let rows = stmt
            .query_map([owner.contact_id()], item_from_row)
            .map_err(storage_err)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(storage_err)
    }

    /// Mark an item fired. Returns false if it had already fired.
    pub fn mark_fired(&self, item_id: i64, outcome: ItemOutcome, now: DateTime<Utc>) -> Result<bool> {
        self.with_transaction(|tx| mark_fired_tx(tx, item_id, outcome, now))
    }

    /// Resolve an item and optionally queue its successor, atomically.
    pub fn resolve_item(
        &self,
        item_id: i64,
        outcome: ItemOutcome,
        next: Option<&NewScheduledItem>,
        now: DateTime<Utc>,
    ) -> Result<Option<ScheduledItem>> {
        let policy = self.policy;
        self.with_transaction(|tx| {
            if !mark_fired_tx(tx, item_id, outcome, now)? {
                return Ok(None);
            }
            match next {
                Some(item) => insert_item_tx(tx, item, policy, now).map(Some),
                None => Ok(None),
            }
        })
    }

    pub fn record_item_error(&self, item_id: i64, error: &str) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE scheduled_items SET last_error = ?1 WHERE id = ?2",
            params![error, item_id],
        )
        .map_err(storage_err)?;
        Ok(())
    }

    pub fn unfired_count(&self) -> Result<u64> {
        let conn = self.lock()?;
        conn.query_row("SELECT COUNT(*) FROM scheduled_items WHERE fired = 0", [], |r| {
            r.get::<_, i64>(0)
        })
        .map(|n| n as u64)
        .map_err(storage_err)
    }

    pub fn due_count(&self, now: DateTime<Utc>) -> Result<u64> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT COUNT(*) FROM scheduled_items WHERE fired = 0 AND due_at <= ?1",
            [ts(&now)],
            |r| r.get::<_, i64>(0),
        )
        .map(|n| n as u64)
        .map_err(storage_err)
    }

    // ─── Content posts ──────────────────────────────────────

    pub fn create_post(
        &self,
        text: &str,
        template: &str,
        generated_at: DateTime<Utc>,
        scheduled_publish_at: DateTime<Utc>,
    ) -> Result<ContentPost> {
        self.with_transaction(|tx| {
            tx.execute(
                "INSERT INTO content_posts (generated_at, status, text, scheduled_publish_at, template)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    ts(&generated_at),
                    PostStatus::PendingApproval.as_str(),
                    text,
                    ts(&scheduled_publish_at),
                    template
                ],
            )
            .map_err(storage_err)?;
            let id = tx.last_insert_rowid();
            post_tx(tx, id)
        })
    }

    pub fn get_post(&self, id: i64) -> Result<ContentPost> {
        let conn = self.lock()?;
        post_tx(&conn, id)
    }

    pub fn list_posts(&self, status: Option<PostStatus>) -> Result<Vec<ContentPost>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {POST_COLUMNS} FROM content_posts
                 WHERE ?1 IS NULL OR status = ?1
                 ORDER BY generated_at DESC, id DESC"
            ))
            .map_err(storage_err)?;
        let rows = stmt
            .query_map([status.map(|s| s.as_str())], post_from_row)
            .map_err(storage_err)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(storage_err)
    }

    /// Move a post to `to` if it is currently in one of `from`.
    pub fn set_post_status(
        &self,
        id: i64,
        from: &[PostStatus],
        to: PostStatus,
        now: DateTime<Utc>,
    ) -> Result<ContentPost> {
        self.with_transaction(|tx| post_status_tx(tx, id, from, to, now))
    }

    /// Operator approval or rejection: the status change and its audit row
    /// land together or not at all.
    pub fn review_post(
        &self,
        id: i64,
        from: &[PostStatus],
        to: PostStatus,
        audit: &AuditRecord,
        now: DateTime<Utc>,
    ) -> Result<ContentPost> {
        self.with_transaction(|tx| {
            let post = post_status_tx(tx, id, from, to, now)?;
            insert_audit_tx(tx, None, audit, now)?;
            Ok(post)
        })
    }

    /// Edit post text. Published and rejected posts are frozen.
    pub fn update_post_text(&self, id: i64, text: &str) -> Result<ContentPost> {
        self.with_transaction(|tx| {
            let post = post_tx(tx, id)?;
            if !matches!(post.status, PostStatus::PendingApproval | PostStatus::Approved) {
                return Err(OutreachError::Conflict(format!(
                    "post {id} is {} and can no longer be edited",
                    post.status
                )));
            }
            tx.execute(
                "UPDATE content_posts SET text = ?1 WHERE id = ?2",
                params![text, id],
            )
            .map_err(storage_err)?;
            post_tx(tx, id)
        })
    }

    /// Approved posts whose publish time has elapsed.
    pub fn due_posts(&self, now: DateTime<Utc>) -> Result<Vec<ContentPost>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {POST_COLUMNS} FROM content_posts
                 WHERE status = 'approved' AND scheduled_publish_at <= ?1
                 ORDER BY scheduled_publish_at ASC, id ASC"
            ))
            .map_err(storage_err)?;
        let rows = stmt
            .query_map([ts(&now)], post_from_row)
            .map_err(storage_err)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(storage_err)
    }

    pub fn record_post_error(&self, id: i64, error: &str) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE content_posts SET last_error = ?1 WHERE id = ?2",
            params![error, id],
        )
        .map_err(storage_err)?;
        Ok(())
    }

    pub fn post_counts(&self) -> Result<HashMap<PostStatus, u64>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare("SELECT status, COUNT(*) FROM content_posts GROUP BY status")
            .map_err(storage_err)?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))
            .map_err(storage_err)?;
        let mut counts = HashMap::new();
        for row in rows {
            let (status, n) = row.map_err(storage_err)?;
            if let Some(status) = PostStatus::parse(&status) {
                counts.insert(status, n as u64);
            }
        }
        Ok(counts)
    }

    // ─── Daily gates ──────────────────────────────────────

    /// Claim `name` for `date`. Returns false if it already fired on or after `date`.
    pub fn try_claim_gate(&self, name: &str, date: NaiveDate) -> Result<bool> {
        self.with_transaction(|tx| {
            let changed = tx
                .execute(
                    "INSERT INTO daily_gates (name, last_fired_date) VALUES (?1, ?2)
                     ON CONFLICT(name) DO UPDATE SET last_fired_date = excluded.last_fired_date
                     WHERE last_fired_date < excluded.last_fired_date",
                    params![name, day(&date)],
                )
                .map_err(storage_err)?;
            Ok(changed == 1)
        })
    }

    pub fn gate_last_fired(&self, name: &str) -> Result<Option<NaiveDate>> {
        let conn = self.lock()?;
        let value: Option<String> = conn
            .query_row(
                "SELECT last_fired_date FROM daily_gates WHERE name = ?1",
                [name],
                |r| r.get(0),
            )
            .optional()
            .map_err(storage_err)?;
        value
            .map(|s| {
                NaiveDate::parse_from_str(&s, "%Y-%m-%d")
                    .map_err(|e| OutreachError::corrupt(format!("gate {name} date '{s}': {e}")))
            })
            .transpose()
    }

    // ─── Audit log ──────────────────────────────────────

    pub fn record_audit(
        &self,
        contact_id: Option<&str>,
        audit: &AuditRecord,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.with_transaction(|tx| insert_audit_tx(tx, contact_id, audit, now))
    }

    pub fn list_audit(&self, contact_id: Option<&str>, limit: usize) -> Result<Vec<AuditEntry>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT id, contact_id, actor, action, detail, created_at FROM audit_log
                 WHERE ?1 IS NULL OR contact_id = ?1
                 ORDER BY id DESC LIMIT ?2",
            )
            .map_err(storage_err)?;
        let rows = stmt
            .query_map(params![contact_id, limit as i64], |row| {
                Ok(AuditEntry {
                    id: row.get(0)?,
                    contact_id: row.get(1)?,
                    actor: row.get(2)?,
                    action: row.get(3)?,
                    detail: row.get(4)?,
                    created_at: get_ts(row, 5)?,
                })
            })
            .map_err(storage_err)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(storage_err)
    }

    // ─── Aggregates ──────────────────────────────────────

    pub fn state_counts(&self) -> Result<HashMap<ContactState, u64>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare("SELECT state, COUNT(*) FROM contacts GROUP BY state")
            .map_err(storage_err)?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))
            .map_err(storage_err)?;
        let mut counts: HashMap<ContactState, u64> =
            ContactState::ALL.into_iter().map(|s| (s, 0)).collect();
        for row in rows {
            let (state, n) = row.map_err(storage_err)?;
            let state = ContactState::parse(&state)
                .ok_or_else(|| OutreachError::corrupt(format!("unknown contact state '{state}'")))?;
            counts.insert(state, n as u64);
        }
        Ok(counts)
    }

    pub fn quarantined_count(&self) -> Result<u64> {
        self.count_where("quarantined = 1")
    }

    pub fn hiring_signal_count(&self) -> Result<u64> {
        self.count_where("hiring_signal = 1 AND opted_out_at IS NULL")
    }

    fn count_where(&self, clause: &str) -> Result<u64> {
        let conn = self.lock()?;
        conn.query_row(
            &format!("SELECT COUNT(*) FROM contacts WHERE {clause}"),
            [],
            |r| r.get::<_, i64>(0),
        )
        .map(|n| n as u64)
        .map_err(storage_err)
    }
}

// ─── Transaction-scoped helpers ──────────────────────────────────

fn find_contact(conn: &Connection, id: &str) -> Result<Option<Contact>> {
    conn.query_row(
        &format!("SELECT {CONTACT_COLUMNS} FROM contacts WHERE id = ?1"),
        [id],
        contact_from_row,
    )
    .optional()
    .map_err(storage_err)
}

fn upsert_contact(conn: &Connection, c: &Contact) -> Result<()> {
    conn.execute(
        "INSERT INTO contacts (id, name, organization, title, location, ai_relevance_score,
             hiring_signal, profile, state, discovered_at, connection_requested_at, connected_at,
             message_sent_at, replied_at, closed_no_reply_at, opted_out_at, quarantined,
             quarantine_reason, failure_count, retry_after, last_error, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17,
             ?18, ?19, ?20, ?21, ?22)
         ON CONFLICT(id) DO UPDATE SET
             name = excluded.name,
             organization = excluded.organization,
             title = excluded.title,
             location = excluded.location,
             ai_relevance_score = excluded.ai_relevance_score,
             hiring_signal = excluded.hiring_signal,
             profile = excluded.profile,
             state = excluded.state,
             discovered_at = excluded.discovered_at,
             connection_requested_at = excluded.connection_requested_at,
             connected_at = excluded.connected_at,
             message_sent_at = excluded.message_sent_at,
             replied_at = excluded.replied_at,
             closed_no_reply_at = excluded.closed_no_reply_at,
             opted_out_at = excluded.opted_out_at,
             quarantined = excluded.quarantined,
             quarantine_reason = excluded.quarantine_reason,
             failure_count = excluded.failure_count,
             retry_after = excluded.retry_after,
             last_error = excluded.last_error,
             updated_at = excluded.updated_at",
        params![
            c.id,
            c.name,
            c.organization,
            c.title,
            c.location,
            c.ai_relevance_score,
            c.hiring_signal as i32,
            c.profile.to_string(),
            c.state.as_str(),
            ts(&c.discovered_at),
            c.connection_requested_at.as_ref().map(ts),
            c.connected_at.as_ref().map(ts),
            c.message_sent_at.as_ref().map(ts),
            c.replied_at.as_ref().map(ts),
            c.closed_no_reply_at.as_ref().map(ts),
            c.opted_out_at.as_ref().map(ts),
            c.quarantined as i32,
            c.quarantine_reason,
            c.failure_count,
            c.retry_after.as_ref().map(ts),
            c.last_error,
            ts(&c.updated_at),
        ],
    )
    .map_err(storage_err)?;
    Ok(())
}

fn insert_item_tx(
    conn: &Connection,
    item: &NewScheduledItem,
    policy: DuplicatePolicy,
    now: DateTime<Utc>,
) -> Result<ScheduledItem> {
    let owner_id = item.owner.contact_id();
    let existing: Option<i64> = conn
        .query_row(
            "SELECT id FROM scheduled_items WHERE contact_id IS ?1 AND kind = ?2 AND fired = 0",
            params![owner_id, item.kind.as_str()],
            |r| r.get(0),
        )
        .optional()
        .map_err(storage_err)?;
    if let Some(existing_id) = existing {
        match policy {
            DuplicatePolicy::Reject => {
                return Err(OutreachError::DuplicateScheduledItem {
                    owner: item.owner.to_string(),
                    kind: item.kind.to_string(),
                });
            }
            DuplicatePolicy::Replace => {
                mark_fired_tx(conn, existing_id, ItemOutcome::Replaced, now)?;
            }
        }
    }
    conn.execute(
        "INSERT INTO scheduled_items (contact_id, kind, due_at, fired, created_at)
         VALUES (?1, ?2, ?3, 0, ?4)",
        params![owner_id, item.kind.as_str(), ts(&item.due_at), ts(&now)],
    )
    .map_err(storage_err)?;
    Ok(ScheduledItem {
        id: conn.last_insert_rowid(),
        owner: item.owner.clone(),
        kind: item.kind,
        due_at: item.due_at,
        fired: false,
        fired_at: None,
        outcome: None,
        last_error: None,
        created_at: now,
    })
}

fn mark_fired_tx(
    conn: &Connection,
    item_id: i64,
    outcome: ItemOutcome,
    now: DateTime<Utc>,
) -> Result<bool> {
    let changed = conn
        .execute(
            "UPDATE scheduled_items SET fired = 1, fired_at = ?1, outcome = ?2
             WHERE id = ?3 AND fired = 0",
            params![ts(&now), outcome.as_str(), item_id],
        )
        .map_err(storage_err)?;
    Ok(changed == 1)
}

fn insert_audit_tx(
    conn: &Connection,
    contact_id: Option<&str>,
    audit: &AuditRecord,
    now: DateTime<Utc>,
) -> Result<()> {
    conn.execute(
        "INSERT INTO audit_log (contact_id, actor, action, detail, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![contact_id, audit.actor, audit.action, audit.detail, ts(&now)],
    )
    .map_err(storage_err)?;
    Ok(())
}

fn counter_tx(conn: &Connection, action: ActionType, date: NaiveDate) -> Result<u32> {
    conn.query_row(
        "SELECT count FROM daily_counters WHERE action_type = ?1 AND date = ?2",
        params![action.as_str(), day(&date)],
        |r| r.get::<_, u32>(0),
    )
    .optional()
    .map(|c| c.unwrap_or(0))
    .map_err(storage_err)
}

fn post_status_tx(
    conn: &Connection,
    id: i64,
    from: &[PostStatus],
    to: PostStatus,
    now: DateTime<Utc>,
) -> Result<ContentPost> {
    let post = post_tx(conn, id)?;
    if !from.contains(&post.status) {
        return Err(OutreachError::Conflict(format!(
            "post {id} is {}, cannot become {to}",
            post.status
        )));
    }
    let published_at = (to == PostStatus::Published).then(|| ts(&now));
    conn.execute(
        "UPDATE content_posts SET status = ?1, published_at = COALESCE(?2, published_at),
             last_error = NULL WHERE id = ?3",
        params![to.as_str(), published_at, id],
    )
    .map_err(storage_err)?;
    post_tx(conn, id)
}

fn post_tx(conn: &Connection, id: i64) -> Result<ContentPost> {
    conn.query_row(
        &format!("SELECT {POST_COLUMNS} FROM content_posts WHERE id = ?1"),
        [id],
        post_from_row,
    )
    .optional()
    .map_err(storage_err)?
    .ok_or_else(|| OutreachError::NotFound(format!("post {id}")))
}

// ─── Row mapping ──────────────────────────────────

fn contact_from_row(row: &Row<'_>) -> rusqlite::Result<Contact> {
    let profile: String = row.get(7)?;
    let state: String = row.get(8)?;
    Ok(Contact {
        id: row.get(0)?,
        name: row.get(1)?,
        organization: row.get(2)?,
        title: row.get(3)?,
        location: row.get(4)?,
        ai_relevance_score: row.get(5)?,
        hiring_signal: row.get::<_, i64>(6)? != 0,
        profile: serde_json::from_str(&profile)
            .map_err(|e| bad_column(7, format!("bad profile JSON: {e}")))?,
        state: ContactState::parse(&state)
            .ok_or_else(|| bad_column(8, format!("unknown contact state '{state}'")))?,
        discovered_at: get_ts(row, 9)?,
        connection_requested_at: get_opt_ts(row, 10)?,
        connected_at: get_opt_ts(row, 11)?,
        message_sent_at: get_opt_ts(row, 12)?,
        replied_at: get_opt_ts(row, 13)?,
        closed_no_reply_at: get_opt_ts(row, 14)?,
        opted_out_at: get_opt_ts(row, 15)?,
        quarantined: row.get::<_, i64>(16)? != 0,
        quarantine_reason: row.get(17)?,
        failure_count: row.get(18)?,
        retry_after: get_opt_ts(row, 19)?,
        last_error: row.get(20)?,
        updated_at: get_ts(row, 21)?,
    })
}

fn item_from_row(row: &Row<'_>) -> rusqlite::Result<ScheduledItem> {
    let contact_id: Option<String> = row.get(1)?;
    let kind: String = row.get(2)?;
    let outcome: Option<String> = row.get(6)?;
    Ok(ScheduledItem {
        id: row.get(0)?,
        owner: contact_id.map(ItemOwner::Contact).unwrap_or(ItemOwner::System),
        kind: ItemKind::parse(&kind)
            .ok_or_else(|| bad_column(2, format!("unknown item kind '{kind}'")))?,
        due_at: get_ts(row, 3)?,
        fired: row.get::<_, i64>(4)? != 0,
        fired_at: get_opt_ts(row, 5)?,
        outcome: outcome.as_deref().and_then(ItemOutcome::parse),
        last_error: row.get(7)?,
        created_at: get_ts(row, 8)?,
    })
}

fn post_from_row(row: &Row<'_>) -> rusqlite::Result<ContentPost> {
    let status: String = row.get(2)?;
    Ok(ContentPost {
        id: row.get(0)?,
        generated_at: get_ts(row, 1)?,
        status: PostStatus::parse(&status)
            .ok_or_else(|| bad_column(2, format!("unknown post status '{status}'")))?,
        text: row.get(3)?,
        scheduled_publish_at: get_ts(row, 4)?,
        published_at: get_opt_ts(row, 5)?,
        template: row.get(6)?,
        last_error: row.get(7)?,
    })
}

/// Fixed-width UTC timestamp so text order matches time order.
pub(crate) fn ts(t: &DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn day(d: &NaiveDate) -> String {
    d.format("%Y-%m-%d").to_string()
}

fn get_ts(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let s: String = row.get(idx)?;
    parse_ts(&s).map_err(|e| bad_column(idx, e))
}

fn get_opt_ts(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let s: Option<String> = row.get(idx)?;
    s.map(|s| parse_ts(&s).map_err(|e| bad_column(idx, e)))
        .transpose()
}

fn parse_ts(s: &str) -> std::result::Result<DateTime<Utc>, String> {
    DateTime::parse_from_rfc3339(s)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| format!("bad timestamp '{s}': {e}"))
}

fn bad_column(idx: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, message.into())
}

/// Map SQLite failures, flagging on-disk corruption as fatal.
pub(crate) fn storage_err(e: rusqlite::Error) -> OutreachError {
    match &e {
        rusqlite::Error::SqliteFailure(failure, _)
            if matches!(failure.code, ErrorCode::DatabaseCorrupt | ErrorCode::NotADatabase) =>
        {
            OutreachError::corrupt(e.to_string())
        }
        rusqlite::Error::FromSqlConversionFailure(..) => OutreachError::corrupt(e.to_string()),
        _ => OutreachError::storage(e.to_string()),
    }
}
