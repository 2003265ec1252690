//! Persisted entity types: contacts, daily counters, scheduled items, content posts.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{OutreachError, Result};
use crate::lifecycle::{ContactState, LifecycleEvent};

/// A discovered person at a target organization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Contact {
    /// Platform-unique identifier (profile slug).
    pub id: String,
    pub name: String,
    pub organization: String,
    pub title: String,
    #[serde(default)]
    pub location: String,
    /// 0.0–1.0, produced by the discovery collaborator.
    pub ai_relevance_score: f64,
    pub hiring_signal: bool,
    /// Free-form profile document (experience, skills, recent activity).
    #[serde(default)]
    pub profile: serde_json::Value,
    pub state: ContactState,
    pub discovered_at: DateTime<Utc>,
    pub connection_requested_at: Option<DateTime<Utc>>,
    pub connected_at: Option<DateTime<Utc>>,
    pub message_sent_at: Option<DateTime<Utc>>,
    pub replied_at: Option<DateTime<Utc>>,
    pub closed_no_reply_at: Option<DateTime<Utc>>,
    pub opted_out_at: Option<DateTime<Utc>>,
    /// Taken out of automated processing pending manual review.
    #[serde(default)]
    pub quarantined: bool,
    pub quarantine_reason: Option<String>,
    #[serde(default)]
    pub failure_count: u32,
    pub retry_after: Option<DateTime<Utc>>,
    /// Why the contact is stuck, if it is.
    pub last_error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl Contact {
    /// A freshly discovered contact.
    pub fn discovered(raw: RawContact, at: DateTime<Utc>) -> Self {
        Self {
            id: raw.id,
            name: raw.name,
            organization: raw.organization,
            title: raw.title,
            location: raw.location,
            ai_relevance_score: raw.ai_relevance_score.clamp(0.0, 1.0),
            hiring_signal: raw.hiring_signal,
            profile: raw.profile,
            state: ContactState::Discovered,
            discovered_at: at,
            connection_requested_at: None,
            connected_at: None,
            message_sent_at: None,
            replied_at: None,
            closed_no_reply_at: None,
            opted_out_at: None,
            quarantined: false,
            quarantine_reason: None,
            failure_count: 0,
            retry_after: None,
            last_error: None,
            updated_at: at,
        }
    }

    /// Refresh profile fields from a re-discovery. Lifecycle fields are untouched.
    pub fn merge_profile(&mut self, raw: &RawContact, at: DateTime<Utc>) {
        self.name = raw.name.clone();
        self.organization = raw.organization.clone();
        self.title = raw.title.clone();
        self.location = raw.location.clone();
        self.ai_relevance_score = raw.ai_relevance_score.clamp(0.0, 1.0);
        self.hiring_signal = raw.hiring_signal;
        self.profile = raw.profile.clone();
        self.updated_at = at;
    }

    /// The state implied by which timestamps are set.
    pub fn derived_state(&self) -> ContactState {
        if self.opted_out_at.is_some() {
            ContactState::OptedOut
        } else if self.replied_at.is_some() {
            ContactState::Replied
        } else if self.closed_no_reply_at.is_some() {
            ContactState::NoReply
        } else if self.message_sent_at.is_some() {
            ContactState::Messaged
        } else if self.connected_at.is_some() {
            ContactState::Connected
        } else if self.connection_requested_at.is_some() {
            ContactState::Requested
        } else {
            ContactState::Discovered
        }
    }

    /// Check the stored state against the timestamp set and timestamp ordering.
    pub fn validate(&self) -> Result<()> {
        let derived = self.derived_state();
        if derived != self.state {
            return Err(OutreachError::Inconsistent(format!(
                "{}: state {} but timestamps imply {}",
                self.id, self.state, derived
            )));
        }
        if self.replied_at.is_some() && self.closed_no_reply_at.is_some() {
            return Err(OutreachError::Inconsistent(format!(
                "{}: both replied and closed without reply",
                self.id
            )));
        }

        let chain = [
            ("discovered_at", Some(self.discovered_at)),
            ("connection_requested_at", self.connection_requested_at),
            ("connected_at", self.connected_at),
            ("message_sent_at", self.message_sent_at),
            ("replied_at", self.replied_at.or(self.closed_no_reply_at)),
        ];
        for pair in chain.windows(2) {
            let (prev_name, prev) = pair[0];
            let (name, current) = pair[1];
            match (prev, current) {
                (None, Some(_)) => {
                    return Err(OutreachError::Inconsistent(format!(
                        "{}: {name} set without {prev_name}",
                        self.id
                    )));
                }
                (Some(p), Some(c)) if c < p => {
                    return Err(OutreachError::Inconsistent(format!(
                        "{}: {name} precedes {prev_name}",
                        self.id
                    )));
                }
                _ => {}
            }
        }
        if let Some(opted) = self.opted_out_at {
            if opted < self.discovered_at {
                return Err(OutreachError::Inconsistent(format!(
                    "{}: opted out before discovery",
                    self.id
                )));
            }
        }
        Ok(())
    }

    /// Apply a lifecycle event, stamping the matching timestamp.
    pub fn apply(&mut self, event: LifecycleEvent, at: DateTime<Utc>) -> Result<ContactState> {
        let next = self
            .state
            .next(event)
            .ok_or_else(|| OutreachError::InvalidTransition {
                contact_id: self.id.clone(),
                from: self.state.to_string(),
                event: event.to_string(),
            })?;
        let slot = match event {
            LifecycleEvent::RequestSent => &mut self.connection_requested_at,
            LifecycleEvent::AcceptanceDetected => &mut self.connected_at,
            LifecycleEvent::MessageSent => &mut self.message_sent_at,
            LifecycleEvent::ReplyDetected => &mut self.replied_at,
            LifecycleEvent::ReplyWindowElapsed => &mut self.closed_no_reply_at,
            LifecycleEvent::OptOut => &mut self.opted_out_at,
        };
        *slot = Some(at);
        self.state = next;
        self.updated_at = at;
        self.validate()?;
        Ok(next)
    }

    /// Whether the orchestrator may act on this contact at `now`.
    pub fn is_schedulable(&self, now: DateTime<Utc>) -> bool {
        !self.quarantined
            && !self.state.is_terminal()
            && self.retry_after.is_none_or(|t| t <= now)
    }
}

/// Profile as returned by the discovery collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawContact {
    pub id: String,
    pub name: String,
    pub organization: String,
    pub title: String,
    #[serde(default)]
    pub location: String,
    #[serde(default)]
    pub ai_relevance_score: f64,
    #[serde(default)]
    pub hiring_signal: bool,
    #[serde(default)]
    pub profile: serde_json::Value,
}

/// Listing filter for contacts. Empty filter matches everything.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContactFilter {
    pub state: Option<ContactState>,
    pub organization: Option<String>,
    pub discovered_after: Option<DateTime<Utc>>,
    pub discovered_before: Option<DateTime<Utc>>,
    pub quarantined: Option<bool>,
    pub limit: Option<usize>,
}

impl ContactFilter {
    pub fn state(state: ContactState) -> Self {
        Self {
            state: Some(state),
            ..Default::default()
        }
    }
}

/// Rate-limited action categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    ConnectionRequest,
    FollowUpMessage,
    ContentPublish,
}

impl ActionType {
    pub const ALL: [ActionType; 3] = [
        ActionType::ConnectionRequest,
        ActionType::FollowUpMessage,
        ActionType::ContentPublish,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ActionType::ConnectionRequest => "connection_request",
            ActionType::FollowUpMessage => "follow_up_message",
            ActionType::ContentPublish => "content_publish",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|a| a.as_str() == s)
    }
}

impl std::fmt::Display for ActionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One row per (action_type, calendar date).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DailyActionCounter {
    pub action: ActionType,
    pub date: NaiveDate,
    pub count: u32,
}

/// What a scheduled item does when it fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemKind {
    FollowUp,
    AcceptanceCheck,
    ReplyCheck,
    ContentGeneration,
}

impl ItemKind {
    pub const ALL: [ItemKind; 4] = [
        ItemKind::FollowUp,
        ItemKind::AcceptanceCheck,
        ItemKind::ReplyCheck,
        ItemKind::ContentGeneration,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ItemKind::FollowUp => "follow_up",
            ItemKind::AcceptanceCheck => "acceptance_check",
            ItemKind::ReplyCheck => "reply_check",
            ItemKind::ContentGeneration => "content_generation",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.as_str() == s)
    }

    /// The contact state this item acts on. Firing against any other state is a no-op.
    pub fn target_state(&self) -> Option<ContactState> {
        match self {
            ItemKind::FollowUp => Some(ContactState::Connected),
            ItemKind::AcceptanceCheck => Some(ContactState::Requested),
            ItemKind::ReplyCheck => Some(ContactState::Messaged),
            ItemKind::ContentGeneration => None,
        }
    }
}

impl std::fmt::Display for ItemKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Who a scheduled item belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemOwner {
    Contact(String),
    /// Content side-lane work not tied to a contact.
    System,
}

impl ItemOwner {
    pub fn contact_id(&self) -> Option<&str> {
        match self {
            ItemOwner::Contact(id) => Some(id),
            ItemOwner::System => None,
        }
    }
}

impl std::fmt::Display for ItemOwner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ItemOwner::Contact(id) => write!(f, "contact:{id}"),
            ItemOwner::System => f.write_str("system"),
        }
    }
}

/// How a fired item was resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemOutcome {
    Transitioned,
    Rescheduled,
    DeferredQuota,
    NoopStateAdvanced,
    SuppressedOptOut,
    Replaced,
    Expired,
    ContentGenerated,
    /// The stored row could not be decoded and was retired.
    Unreadable,
}

impl ItemOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemOutcome::Transitioned => "transitioned",
            ItemOutcome::Rescheduled => "rescheduled",
            ItemOutcome::DeferredQuota => "deferred_quota",
            ItemOutcome::NoopStateAdvanced => "noop_state_advanced",
            ItemOutcome::SuppressedOptOut => "suppressed_opt_out",
            ItemOutcome::Replaced => "replaced",
            ItemOutcome::Expired => "expired",
            ItemOutcome::ContentGenerated => "content_generated",
            ItemOutcome::Unreadable => "unreadable",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        [
            ItemOutcome::Transitioned,
            ItemOutcome::Rescheduled,
            ItemOutcome::DeferredQuota,
            ItemOutcome::NoopStateAdvanced,
            ItemOutcome::SuppressedOptOut,
            ItemOutcome::Replaced,
            ItemOutcome::Expired,
            ItemOutcome::ContentGenerated,
            ItemOutcome::Unreadable,
        ]
        .into_iter()
        .find(|o| o.as_str() == s)
    }
}

/// A durable deferred action. Append-only: fired items are never deleted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledItem {
    /// Monotonic id; also the creation-order tiebreaker.
    pub id: i64,
    pub owner: ItemOwner,
    pub kind: ItemKind,
    pub due_at: DateTime<Utc>,
    pub fired: bool,
    pub fired_at: Option<DateTime<Utc>>,
    pub outcome: Option<ItemOutcome>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Request to create a scheduled item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewScheduledItem {
    pub owner: ItemOwner,
    pub kind: ItemKind,
    pub due_at: DateTime<Utc>,
}

impl NewScheduledItem {
    pub fn for_contact(contact_id: &str, kind: ItemKind, due_at: DateTime<Utc>) -> Self {
        Self {
            owner: ItemOwner::Contact(contact_id.to_string()),
            kind,
            due_at,
        }
    }

    pub fn system(kind: ItemKind, due_at: DateTime<Utc>) -> Self {
        Self {
            owner: ItemOwner::System,
            kind,
            due_at,
        }
    }
}

/// What to do when an unfired item of the same (owner, kind) already exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DuplicatePolicy {
    /// Refuse the new item with `DuplicateScheduledItem`.
    Reject,
    /// Retire the existing item (outcome `replaced`) and insert the new one.
    #[default]
    Replace,
}

/// Content post lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PostStatus {
    PendingApproval,
    Approved,
    Rejected,
    Published,
}

impl PostStatus {
    pub const ALL: [PostStatus; 4] = [
        PostStatus::PendingApproval,
        PostStatus::Approved,
        PostStatus::Rejected,
        PostStatus::Published,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PostStatus::PendingApproval => "pending_approval",
            PostStatus::Approved => "approved",
            PostStatus::Rejected => "rejected",
            PostStatus::Published => "published",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|p| p.as_str() == s)
    }
}

impl std::fmt::Display for PostStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Generated content awaiting operator approval and timed publication.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentPost {
    pub id: i64,
    pub generated_at: DateTime<Utc>,
    pub status: PostStatus,
    pub text: String,
    pub scheduled_publish_at: DateTime<Utc>,
    pub published_at: Option<DateTime<Utc>>,
    /// Prompt template the text was generated from.
    pub template: String,
    pub last_error: Option<String>,
}

/// One operator-visible audit row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: i64,
    pub contact_id: Option<String>,
    pub actor: String,
    pub action: String,
    pub detail: Option<String>,
    pub created_at: DateTime<Utc>,
}
