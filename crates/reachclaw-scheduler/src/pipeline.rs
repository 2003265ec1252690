//! Pipeline State Machine: the only code that calls collaborators and
//! mutates contact state.
//!
//! Every handler is keyed on the contact's *persisted* state, so a due item
//! delivered twice (e.g. replayed after a crash) is a no-op the second time.
//! Rate-limited side effects follow reserve → act → commit: quota is taken
//! before the collaborator call and handed back if the call does not succeed.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Duration, FixedOffset, NaiveTime, Utc};
use reachclaw_core::config::{MAX_DELAY_MINUTES, MAX_WINDOW_DAYS, ReachClawConfig};
use reachclaw_core::error::{OutreachError, Result};
use reachclaw_core::lifecycle::{ContactState, LifecycleEvent};
use reachclaw_core::traits::{Delivery, Generation, SendOutcome};
use reachclaw_core::types::{
    ActionType, Contact, ContentPost, ItemKind, ItemOutcome, ItemOwner, NewScheduledItem,
    PostStatus, ScheduledItem,
};

use crate::claims::{Backoff, ClaimGuard, ContactClaims};
use crate::persistence::{AuditRecord, OutreachDb, TransitionWrite};
use crate::quota::{QuotaGuard, QuotaReservation};

/// What a pipeline step did.
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    /// The contact moved to this state.
    Advanced(ContactState),
    /// The item fired without a state change.
    Resolved(ItemOutcome),
    /// Nothing was applied; a later tick retries.
    Deferred(String),
}

/// Operator override request.
#[derive(Debug, Clone)]
pub struct OverrideRequest {
    pub target: ContactState,
    pub actor: String,
    pub reason: Option<String>,
    /// Skip the daily quota for steps that normally consume it.
    pub bypass_quota: bool,
}

/// Timing knobs, flattened out of the config sections.
#[derive(Debug, Clone)]
struct Timing {
    follow_up_delay: Duration,
    acceptance_poll: Duration,
    acceptance_window: Duration,
    reply_poll: Duration,
    reply_window: Duration,
    content_retry: Duration,
    publish_after: Duration,
    call_timeout: std::time::Duration,
}

pub struct Pipeline {
    db: Arc<OutreachDb>,
    quota: QuotaGuard,
    delivery: Arc<dyn Delivery>,
    generation: Arc<dyn Generation>,
    timing: Timing,
    backoff: Backoff,
    claims: ContactClaims,
    tz: FixedOffset,
    personalize_requests: bool,
    post_template: String,
}

impl Pipeline {
    pub fn new(
        db: Arc<OutreachDb>,
        config: &ReachClawConfig,
        delivery: Arc<dyn Delivery>,
        generation: Arc<dyn Generation>,
    ) -> Self {
        let tz = config.timezone();
        let p = &config.pipeline;
        let o = &config.orchestrator;
        Self {
            quota: QuotaGuard::new(db.clone(), config.quota.clone(), tz),
            db,
            delivery,
            generation,
            timing: Timing {
                follow_up_delay: minutes(p.follow_up_delay_minutes),
                acceptance_poll: minutes(p.acceptance_poll_minutes.max(1)),
                acceptance_window: days(p.acceptance_window_days),
                reply_poll: minutes(p.reply_poll_minutes.max(1)),
                reply_window: days(p.reply_window_days),
                content_retry: minutes(o.content_retry_minutes.max(1)),
                publish_after: minutes(config.content.publish_after_minutes),
                call_timeout: std::time::Duration::from_secs(o.collaborator_timeout_secs.max(1)),
            },
            backoff: Backoff::new(o.backoff_base_secs, o.backoff_max_secs),
            claims: ContactClaims::new(),
            tz,
            personalize_requests: p.personalize_connection_requests,
            post_template: config.content.template.clone(),
        }
    }

    pub fn db(&self) -> &Arc<OutreachDb> {
        &self.db
    }

    pub fn quota(&self) -> &QuotaGuard {
        &self.quota
    }

    /// Contacts with a transition in flight, shared by the loop and operator calls.
    pub fn claims(&self) -> &ContactClaims {
        &self.claims
    }

    fn claim(&self, contact_id: &str) -> Result<ClaimGuard> {
        self.claims.try_claim(contact_id).ok_or_else(|| {
            OutreachError::Conflict(format!("{contact_id} has a transition in flight, try again"))
        })
    }

    // ─── Discovered → Requested ──────────────────────────────

    /// Reserve quota and send a connection request.
    pub async fn request_connection(&self, contact: Contact, now: DateTime<Utc>) -> Result<StepOutcome> {
        match self.quota.reserve(ActionType::ConnectionRequest, now) {
            Ok(reservation) => self.send_connection_request(contact, reservation, now).await,
            Err(OutreachError::QuotaExceeded { action, date }) => {
                let reason = format!("daily {action} limit reached for {date}");
                self.db.note(&contact.id, &reason)?;
                Ok(StepOutcome::Deferred(reason))
            }
            Err(e) => Err(e),
        }
    }

    /// Send a connection request using an already-granted reservation.
    pub async fn send_connection_request(
        &self,
        contact: Contact,
        reservation: QuotaReservation,
        now: DateTime<Utc>,
    ) -> Result<StepOutcome> {
        if contact.state != ContactState::Discovered || !contact.is_schedulable(now) {
            self.quota.release(reservation, now)?;
            return Ok(StepOutcome::Deferred(format!("{} is not eligible", contact.id)));
        }

        let note = if self.personalize_requests {
            let vars = personalization(&contact);
            match self
                .call("connection note", self.generation.generate_text("connection_request", &vars))
                .await
            {
                Ok(text) => Some(text),
                Err(e) => {
                    self.quota.release(reservation, now)?;
                    return Err(self.fail_contact(&contact, e, now)?);
                }
            }
        } else {
            None
        };

        let sent = self
            .call(
                "send_connection_request",
                self.delivery.send_connection_request(&contact, note.as_deref()),
            )
            .await
            .and_then(require_sent);
        if let Err(e) = sent {
            self.quota.release(reservation, now)?;
            return Err(self.fail_contact(&contact, e, now)?);
        }

        let expected = contact.state;
        let updated = advance(contact, LifecycleEvent::RequestSent, now)?;
        self.db.apply_transition(
            &TransitionWrite {
                contact: &updated,
                expected_state: expected,
                fire: None,
                schedule: vec![NewScheduledItem::for_contact(
                    &updated.id,
                    ItemKind::AcceptanceCheck,
                    now + self.timing.acceptance_poll,
                )],
                suppress_pending: false,
                audit: None,
            },
            now,
        )?;
        tracing::info!("🤝 Connection request sent to {} ({})", updated.id, updated.organization);
        Ok(StepOutcome::Advanced(ContactState::Requested))
    }

    // ─── Scheduled items ──────────────────────────────────────

    /// Fire one due item. Safe to call again with the same item.
    pub async fn fire_item(&self, item: &ScheduledItem, now: DateTime<Utc>) -> Result<StepOutcome> {
        if item.fired {
            return Ok(StepOutcome::Resolved(item.outcome.unwrap_or(ItemOutcome::NoopStateAdvanced)));
        }
        let contact_id = match &item.owner {
            ItemOwner::System => return self.fire_system_item(item, now).await,
            ItemOwner::Contact(id) => id.clone(),
        };
        let contact = self.db.get(&contact_id)?;

        if contact.state == ContactState::OptedOut {
            return self.resolve(item, ItemOutcome::SuppressedOptOut, None, now);
        }
        if contact.quarantined {
            return Ok(StepOutcome::Deferred(format!("{contact_id} is quarantined")));
        }
        let Some(target) = item.kind.target_state() else {
            return Err(OutreachError::Inconsistent(format!(
                "{} item #{} owned by contact {contact_id}",
                item.kind, item.id
            )));
        };
        if contact.state != target {
            if contact.state.rank() > target.rank() {
                tracing::debug!(
                    "⏭️ Item #{} ({}) for {contact_id} is stale, contact already {}",
                    item.id,
                    item.kind,
                    contact.state
                );
                return self.resolve(item, ItemOutcome::NoopStateAdvanced, None, now);
            }
            return Err(OutreachError::InvalidTransition {
                contact_id,
                from: contact.state.to_string(),
                event: item.kind.to_string(),
            });
        }
        if !contact.is_schedulable(now) {
            return Ok(StepOutcome::Deferred(format!("{contact_id} is backing off")));
        }

        match self.detect_opt_out(&contact).await {
            Ok(true) => {
                self.apply_opt_out(contact, "platform", None, now)?;
                return Ok(StepOutcome::Advanced(ContactState::OptedOut));
            }
            Ok(false) => {}
            Err(e) => {
                self.db.record_item_error(item.id, &e.to_string())?;
                return Err(self.fail_contact(&contact, e, now)?);
            }
        }

        let result = match item.kind {
            ItemKind::AcceptanceCheck => self.check_acceptance(item, contact.clone(), now).await,
            ItemKind::FollowUp => self.send_follow_up(item, contact.clone(), now).await,
            ItemKind::ReplyCheck => self.check_reply(item, contact.clone(), now).await,
            ItemKind::ContentGeneration => {
                return Err(OutreachError::Inconsistent(format!(
                    "content item #{} owned by {contact_id}",
                    item.id
                )));
            }
        };
        match result {
            Err(e @ OutreachError::TransientCollaborator(_)) => {
                self.db.record_item_error(item.id, &e.to_string())?;
                Err(self.fail_contact(&contact, e, now)?)
            }
            other => other,
        }
    }

    async fn check_acceptance(
        &self,
        item: &ScheduledItem,
        contact: Contact,
        now: DateTime<Utc>,
    ) -> Result<StepOutcome> {
        let accepted = self
            .call("detect_acceptance", self.delivery.detect_acceptance(&contact))
            .await?;
        if accepted {
            let expected = contact.state;
            let updated = advance(contact, LifecycleEvent::AcceptanceDetected, now)?;
            self.db.apply_transition(
                &TransitionWrite {
                    contact: &updated,
                    expected_state: expected,
                    fire: Some((item.id, ItemOutcome::Transitioned)),
                    schedule: vec![NewScheduledItem::for_contact(
                        &updated.id,
                        ItemKind::FollowUp,
                        now + self.timing.follow_up_delay,
                    )],
                    suppress_pending: false,
                    audit: None,
                },
                now,
            )?;
            tracing::info!(
                "✅ {} accepted, follow-up due at {}",
                updated.id,
                now + self.timing.follow_up_delay
            );
            return Ok(StepOutcome::Advanced(ContactState::Connected));
        }

        let requested_at = contact.connection_requested_at.unwrap_or(contact.discovered_at);
        if now - requested_at >= self.timing.acceptance_window {
            self.db.note(&contact.id, "connection request not accepted within window")?;
            tracing::info!("⌛ Acceptance window elapsed for {}", contact.id);
            return self.resolve(item, ItemOutcome::Expired, None, now);
        }
        let next = NewScheduledItem::for_contact(
            &contact.id,
            ItemKind::AcceptanceCheck,
            now + self.timing.acceptance_poll,
        );
        self.resolve(item, ItemOutcome::Rescheduled, Some(&next), now)
    }

    async fn send_follow_up(
        &self,
        item: &ScheduledItem,
        contact: Contact,
        now: DateTime<Utc>,
    ) -> Result<StepOutcome> {
        let reservation = match self.quota.reserve(ActionType::FollowUpMessage, now) {
            Ok(r) => r,
            Err(OutreachError::QuotaExceeded { action, date }) => {
                let reason = format!("daily {action} limit reached for {date}");
                self.db.note(&contact.id, &reason)?;
                let next = NewScheduledItem::for_contact(
                    &contact.id,
                    ItemKind::FollowUp,
                    self.next_local_day(now),
                );
                tracing::warn!("⏸️ Follow-up for {} deferred: {reason}", contact.id);
                self.resolve(item, ItemOutcome::DeferredQuota, Some(&next), now)?;
                return Ok(StepOutcome::Deferred(reason));
            }
            Err(e) => return Err(e),
        };

        let vars = personalization(&contact);
        let text = match self
            .call("personalized message", self.generation.generate_text("personalized_message", &vars))
            .await
        {
            Ok(text) => text,
            Err(e) => {
                self.quota.release(reservation, now)?;
                return Err(e);
            }
        };
        let sent = self
            .call("send_message", self.delivery.send_message(&contact, &text))
            .await
            .and_then(require_sent);
        if let Err(e) = sent {
            self.quota.release(reservation, now)?;
            return Err(e);
        }

        let expected = contact.state;
        let updated = advance(contact, LifecycleEvent::MessageSent, now)?;
        self.db.apply_transition(
            &TransitionWrite {
                contact: &updated,
                expected_state: expected,
                fire: Some((item.id, ItemOutcome::Transitioned)),
                schedule: vec![NewScheduledItem::for_contact(
                    &updated.id,
                    ItemKind::ReplyCheck,
                    now + self.timing.reply_poll,
                )],
                suppress_pending: false,
                audit: None,
            },
            now,
        )?;
        tracing::info!("✉️ Follow-up sent to {}", updated.id);
        Ok(StepOutcome::Advanced(ContactState::Messaged))
    }

    async fn check_reply(
        &self,
        item: &ScheduledItem,
        contact: Contact,
        now: DateTime<Utc>,
    ) -> Result<StepOutcome> {
        let replied = self
            .call("detect_reply", self.delivery.detect_reply(&contact))
            .await?;
        let sent_at = contact.message_sent_at.unwrap_or(now);
        let window_end = sent_at + self.timing.reply_window;

        let event = if replied {
            LifecycleEvent::ReplyDetected
        } else if now >= window_end {
            LifecycleEvent::ReplyWindowElapsed
        } else {
            let next = NewScheduledItem::for_contact(
                &contact.id,
                ItemKind::ReplyCheck,
                (now + self.timing.reply_poll).min(window_end),
            );
            return self.resolve(item, ItemOutcome::Rescheduled, Some(&next), now);
        };

        let expected = contact.state;
        let updated = advance(contact, event, now)?;
        self.db.apply_transition(
            &TransitionWrite {
                contact: &updated,
                expected_state: expected,
                fire: Some((item.id, ItemOutcome::Transitioned)),
                schedule: Vec::new(),
                suppress_pending: false,
                audit: None,
            },
            now,
        )?;
        if replied {
            tracing::info!("💬 {} replied", updated.id);
        } else {
            tracing::info!("🔚 {} closed without reply", updated.id);
        }
        Ok(StepOutcome::Advanced(updated.state))
    }

    async fn fire_system_item(&self, item: &ScheduledItem, now: DateTime<Utc>) -> Result<StepOutcome> {
        match item.kind {
            ItemKind::ContentGeneration => {
                self.generate_content(Some(item), now).await?;
                Ok(StepOutcome::Resolved(ItemOutcome::ContentGenerated))
            }
            kind => Err(OutreachError::Inconsistent(format!(
                "{kind} item #{} has no contact",
                item.id
            ))),
        }
    }

    // ─── Opt-out and overrides ──────────────────────────────

    /// Move a contact to `OptedOut` and suppress its pending items.
    /// Fails with `Conflict` while the loop is working on the contact.
    pub fn opt_out(
        &self,
        contact_id: &str,
        actor: &str,
        reason: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<Contact> {
        let _claim = self.claim(contact_id)?;
        self.opt_out_claimed(contact_id, actor, reason, now)
    }

    fn opt_out_claimed(
        &self,
        contact_id: &str,
        actor: &str,
        reason: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<Contact> {
        let contact = self.db.get(contact_id)?;
        if contact.state == ContactState::OptedOut {
            return Ok(contact);
        }
        self.apply_opt_out(contact, actor, reason, now)
    }

    fn apply_opt_out(
        &self,
        contact: Contact,
        actor: &str,
        reason: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<Contact> {
        let expected = contact.state;
        let mut updated = contact;
        updated.apply(LifecycleEvent::OptOut, now)?;
        updated.retry_after = None;
        self.db.apply_transition(
            &TransitionWrite {
                contact: &updated,
                expected_state: expected,
                fire: None,
                schedule: Vec::new(),
                suppress_pending: true,
                audit: Some(AuditRecord {
                    actor: actor.to_string(),
                    action: "opt_out".into(),
                    detail: Some(format!("from {expected}{}", reason_suffix(&reason))),
                }),
            },
            now,
        )?;
        tracing::info!("🚫 {} opted out (from {expected}, by {actor})", updated.id);
        Ok(updated)
    }

    /// Force a contact forward to `request.target`. Audited. Never moves backwards.
    pub fn override_state(
        &self,
        contact_id: &str,
        request: &OverrideRequest,
        now: DateTime<Utc>,
    ) -> Result<Contact> {
        let _claim = self.claim(contact_id)?;
        if request.target == ContactState::OptedOut {
            return self.opt_out_claimed(contact_id, &request.actor, request.reason.clone(), now);
        }
        let contact = self.db.get(contact_id)?;
        let expected = contact.state;
        if request.target.rank() <= contact.state.rank() {
            return Err(OutreachError::InvalidTransition {
                contact_id: contact_id.to_string(),
                from: contact.state.to_string(),
                event: format!("override to {}", request.target),
            });
        }

        let mut updated = contact;
        let mut reservations = Vec::new();
        let walked = self.walk_forward(&mut updated, request, now, &mut reservations);
        if let Err(e) = walked {
            for r in reservations {
                self.quota.release(r, now)?;
            }
            return Err(e);
        }
        updated.failure_count = 0;
        updated.retry_after = None;
        updated.last_error = None;

        let follow_on = match updated.state {
            ContactState::Requested => Some((ItemKind::AcceptanceCheck, self.timing.acceptance_poll)),
            ContactState::Connected => Some((ItemKind::FollowUp, self.timing.follow_up_delay)),
            ContactState::Messaged => Some((ItemKind::ReplyCheck, self.timing.reply_poll)),
            _ => None,
        };
        let detail = format!(
            "{expected} -> {}{}{}",
            updated.state,
            if request.bypass_quota { " (quota bypassed)" } else { "" },
            reason_suffix(&request.reason)
        );
        let written = self.db.apply_transition(
            &TransitionWrite {
                contact: &updated,
                expected_state: expected,
                fire: None,
                schedule: follow_on
                    .map(|(kind, delay)| NewScheduledItem::for_contact(&updated.id, kind, now + delay))
                    .into_iter()
                    .collect(),
                suppress_pending: false,
                audit: Some(AuditRecord {
                    actor: request.actor.clone(),
                    action: "override".into(),
                    detail: Some(detail.clone()),
                }),
            },
            now,
        );
        if let Err(e) = written {
            for r in reservations {
                self.quota.release(r, now)?;
            }
            return Err(e);
        }
        tracing::info!("🛠️ Override {}: {detail} by {}", updated.id, request.actor);
        Ok(updated)
    }

    fn walk_forward(
        &self,
        contact: &mut Contact,
        request: &OverrideRequest,
        now: DateTime<Utc>,
        reservations: &mut Vec<QuotaReservation>,
    ) -> Result<()> {
        while contact.state != request.target {
            let step = match contact.state {
                ContactState::Discovered => ContactState::Requested,
                ContactState::Requested => ContactState::Connected,
                ContactState::Connected => ContactState::Messaged,
                _ => request.target,
            };
            let event = LifecycleEvent::toward(step).ok_or_else(|| OutreachError::InvalidTransition {
                contact_id: contact.id.clone(),
                from: contact.state.to_string(),
                event: format!("override to {}", request.target),
            })?;
            let action = match event {
                LifecycleEvent::RequestSent => Some(ActionType::ConnectionRequest),
                LifecycleEvent::MessageSent => Some(ActionType::FollowUpMessage),
                _ => None,
            };
            if let (Some(action), false) = (action, request.bypass_quota) {
                reservations.push(self.quota.reserve(action, now)?);
            }
            contact.apply(event, now)?;
        }
        Ok(())
    }

    /// Return a quarantined contact to automated processing.
    pub fn release_quarantine(&self, contact_id: &str, actor: &str, now: DateTime<Utc>) -> Result<Contact> {
        let _claim = self.claim(contact_id)?;
        let mut contact = self.db.get(contact_id)?;
        if !contact.quarantined {
            return Ok(contact);
        }
        let reason = contact.quarantine_reason.take();
        contact.quarantined = false;
        contact.failure_count = 0;
        contact.retry_after = None;
        contact.last_error = None;
        contact.updated_at = now;
        self.db.apply_transition(
            &TransitionWrite {
                contact: &contact,
                expected_state: contact.state,
                fire: None,
                schedule: Vec::new(),
                suppress_pending: false,
                audit: Some(AuditRecord {
                    actor: actor.to_string(),
                    action: "release_quarantine".into(),
                    detail: reason,
                }),
            },
            now,
        )?;
        tracing::info!("🔓 {} released from quarantine by {actor}", contact.id);
        Ok(contact)
    }

    // ─── Content side-lane ──────────────────────────────────

    /// Generate a post awaiting approval. On failure a retry item is queued.
    pub async fn generate_content(
        &self,
        item: Option<&ScheduledItem>,
        now: DateTime<Utc>,
    ) -> Result<ContentPost> {
        let mut vars = HashMap::new();
        vars.insert(
            "date".to_string(),
            now.with_timezone(&self.tz).format("%B %d, %Y").to_string(),
        );
        let generated = self
            .call("content", self.generation.generate_text(&self.post_template, &vars))
            .await;
        let text = match generated {
            Ok(text) => text,
            Err(e) => {
                let retry = NewScheduledItem::system(ItemKind::ContentGeneration, now + self.timing.content_retry);
                match item {
                    Some(item) => {
                        self.db.record_item_error(item.id, &e.to_string())?;
                        self.db.resolve_item(item.id, ItemOutcome::Rescheduled, Some(&retry), now)?;
                    }
                    None => match self.db.create_scheduled_item(&retry, now) {
                        Ok(_) | Err(OutreachError::DuplicateScheduledItem { .. }) => {}
                        Err(other) => return Err(other),
                    },
                }
                tracing::warn!("⚠️ Content generation failed, retry at {}: {e}", retry.due_at);
                return Err(e);
            }
        };

        let post = self.db.create_post(
            text.trim(),
            &self.post_template,
            now,
            now + self.timing.publish_after,
        )?;
        if let Some(item) = item {
            self.db.mark_fired(item.id, ItemOutcome::ContentGenerated, now)?;
        }
        tracing::info!("📝 Post #{} generated, awaiting approval", post.id);
        Ok(post)
    }

    /// Publish an approved post whose time has come.
    pub async fn publish(&self, post: &ContentPost, now: DateTime<Utc>) -> Result<StepOutcome> {
        if post.status != PostStatus::Approved || post.scheduled_publish_at > now {
            return Ok(StepOutcome::Deferred(format!("post {} is not due", post.id)));
        }
        let reservation = match self.quota.reserve(ActionType::ContentPublish, now) {
            Ok(r) => r,
            Err(OutreachError::QuotaExceeded { action, date }) => {
                let reason = format!("daily {action} limit reached for {date}");
                self.db.record_post_error(post.id, &reason)?;
                return Ok(StepOutcome::Deferred(reason));
            }
            Err(e) => return Err(e),
        };
        let sent = self
            .call("publish_post", self.delivery.publish_post(post))
            .await
            .and_then(require_sent);
        if let Err(e) = sent {
            self.quota.release(reservation, now)?;
            self.db.record_post_error(post.id, &e.to_string())?;
            return Err(e);
        }
        self.db
            .set_post_status(post.id, &[PostStatus::Approved], PostStatus::Published, now)?;
        tracing::info!("📣 Post #{} published", post.id);
        Ok(StepOutcome::Resolved(ItemOutcome::Transitioned))
    }

    // ─── Helpers ──────────────────────────────────────────

    /// Run a collaborator call under the configured timeout.
    async fn call<T>(&self, what: &str, fut: impl Future<Output = Result<T>>) -> Result<T> {
        match tokio::time::timeout(self.timing.call_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(OutreachError::TransientCollaborator(format!(
                "{what} timed out after {}s",
                self.timing.call_timeout.as_secs()
            ))),
        }
    }

    async fn detect_opt_out(&self, contact: &Contact) -> Result<bool> {
        self.call("detect_opt_out", self.delivery.detect_opt_out(contact))
            .await
    }

    fn resolve(
        &self,
        item: &ScheduledItem,
        outcome: ItemOutcome,
        next: Option<&NewScheduledItem>,
        now: DateTime<Utc>,
    ) -> Result<StepOutcome> {
        self.db.resolve_item(item.id, outcome, next, now)?;
        Ok(StepOutcome::Resolved(outcome))
    }

    /// Record a failed attempt with backoff; hands the error back for propagation.
    fn fail_contact(&self, contact: &Contact, error: OutreachError, now: DateTime<Utc>) -> Result<OutreachError> {
        let retry_after = self.backoff.retry_after(contact.failure_count + 1, now);
        self.db
            .record_failure(&contact.id, &error.to_string(), retry_after, now)?;
        tracing::warn!(
            "⚠️ {} failed (attempt {}), retry after {retry_after}: {error}",
            contact.id,
            contact.failure_count + 1
        );
        Ok(error)
    }

    /// Start of the next calendar day in the reference timezone.
    fn next_local_day(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let local = now.with_timezone(&self.tz);
        local
            .date_naive()
            .succ_opt()
            .and_then(|d| d.and_time(NaiveTime::MIN).and_local_timezone(self.tz).single())
            .map(|d| d.with_timezone(&Utc))
            .unwrap_or(now + Duration::days(1))
    }
}

/// Apply `event` and clear failure bookkeeping.
fn advance(mut contact: Contact, event: LifecycleEvent, now: DateTime<Utc>) -> Result<Contact> {
    contact.apply(event, now)?;
    contact.failure_count = 0;
    contact.retry_after = None;
    contact.last_error = None;
    Ok(contact)
}

/// Config durations, clamped to the ranges `validate` accepts.
fn minutes(n: i64) -> Duration {
    Duration::try_minutes(n.clamp(0, MAX_DELAY_MINUTES)).unwrap_or_else(Duration::zero)
}

fn days(n: i64) -> Duration {
    Duration::try_days(n.clamp(0, MAX_WINDOW_DAYS)).unwrap_or_else(Duration::zero)
}

fn require_sent(outcome: SendOutcome) -> Result<()> {
    match outcome {
        SendOutcome::Sent => Ok(()),
        SendOutcome::Failed(reason) => Err(OutreachError::TransientCollaborator(reason)),
    }
}

fn reason_suffix(reason: &Option<String>) -> String {
    reason
        .as_deref()
        .map(|r| format!(": {r}"))
        .unwrap_or_default()
}

/// Template variables for personalized notes and messages.
pub fn personalization(contact: &Contact) -> HashMap<String, String> {
    let recent_activity = match contact.profile.get("recent_activity") {
        Some(serde_json::Value::String(s)) => s.clone(),
        Some(serde_json::Value::Array(items)) => items
            .iter()
            .filter_map(|v| v.as_str())
            .collect::<Vec<_>>()
            .join("; "),
        _ => String::new(),
    };
    let mut vars = HashMap::new();
    vars.insert("name".to_string(), contact.name.clone());
    vars.insert("company".to_string(), contact.organization.clone());
    vars.insert("title".to_string(), contact.title.clone());
    vars.insert("location".to_string(), contact.location.clone());
    vars.insert("profile_data".to_string(), contact.profile.to_string());
    vars.insert("recent_activity".to_string(), recent_activity);
    vars
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use reachclaw_core::types::DuplicatePolicy;

    use crate::fakes::{FakeDelivery, FakeGenerator, raw_contact};

    fn pipeline(config: &ReachClawConfig) -> (Pipeline, Arc<FakeDelivery>, Arc<FakeGenerator>) {
        let db = Arc::new(OutreachDb::open_in_memory(DuplicatePolicy::Reject).unwrap());
        let delivery = Arc::new(FakeDelivery::default());
        let generator = Arc::new(FakeGenerator::default());
        let p = Pipeline::new(db, config, delivery.clone(), generator.clone());
        (p, delivery, generator)
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, 22, 30, 0).unwrap()
    }

    #[test]
    fn test_personalization_variables() {
        let contact = Contact::discovered(raw_contact("ada", "Acme AI", 0.9), t0());
        let vars = personalization(&contact);
        assert_eq!(vars["name"], "Contact ada");
        assert_eq!(vars["company"], "Acme AI");
        assert_eq!(vars["title"], "Machine Learning Engineer");
        assert!(vars["profile_data"].contains("pytorch"));
        assert_eq!(vars["recent_activity"], "Shipped an inference server");
    }

    #[test]
    fn test_next_local_day_in_reference_timezone() {
        let mut config = ReachClawConfig::default();
        config.utc_offset_minutes = 120;
        let (p, _, _) = pipeline(&config);
        // 22:30Z is 00:30 on March 3rd at UTC+2; the next local day starts March 4th 00:00+02.
        assert_eq!(
            p.next_local_day(t0()),
            Utc.with_ymd_and_hms(2026, 3, 3, 22, 0, 0).unwrap()
        );
    }

    #[tokio::test]
    async fn test_personalized_connection_note() {
        let mut config = ReachClawConfig::default();
        config.pipeline.personalize_connection_requests = true;
        let (p, delivery, generator) = pipeline(&config);
        p.db().upsert_discovered(&raw_contact("ada", "Acme AI", 0.9), t0()).unwrap();

        let contact = p.db().get("ada").unwrap();
        let outcome = p.request_connection(contact, t0()).await.unwrap();
        assert_eq!(outcome, StepOutcome::Advanced(ContactState::Requested));
        let requests = delivery.requests.lock().unwrap();
        assert_eq!(requests[0].1.as_deref(), Some("[connection_request] hello Contact ada"));
        assert_eq!(generator.calls.lock().unwrap()[0].0, "connection_request");
    }

    #[tokio::test]
    async fn test_failed_note_generation_releases_quota() {
        let mut config = ReachClawConfig::default();
        config.pipeline.personalize_connection_requests = true;
        let (p, delivery, generator) = pipeline(&config);
        generator.fail(true);
        p.db().upsert_discovered(&raw_contact("ada", "Acme AI", 0.9), t0()).unwrap();

        let contact = p.db().get("ada").unwrap();
        assert!(p.request_connection(contact, t0()).await.is_err());
        assert!(delivery.requested_ids().is_empty());
        assert_eq!(p.quota().remaining(ActionType::ConnectionRequest, t0()).unwrap(), 30);
        assert_eq!(p.db().get("ada").unwrap().failure_count, 1);
    }

    #[tokio::test]
    async fn test_release_quarantine_is_audited() {
        let (p, _, _) = pipeline(&ReachClawConfig::default());
        p.db().upsert_discovered(&raw_contact("ada", "Acme AI", 0.9), t0()).unwrap();
        p.db().quarantine("ada", "bad profile", t0()).unwrap();

        let released = p.release_quarantine("ada", "operator", t0()).unwrap();
        assert!(!released.quarantined);
        assert!(!p.db().get("ada").unwrap().quarantined);
        let audit = p.db().list_audit(Some("ada"), 5).unwrap();
        assert_eq!(audit[0].action, "release_quarantine");
        assert_eq!(audit[0].detail.as_deref(), Some("bad profile"));
    }

    #[test]
    fn test_out_of_range_durations_are_clamped() {
        let mut config = ReachClawConfig::default();
        config.pipeline.acceptance_window_days = i64::MAX;
        config.pipeline.reply_poll_minutes = i64::MAX;
        config.pipeline.follow_up_delay_minutes = -30;
        config.content.publish_after_minutes = i64::MIN;
        let (p, _, _) = pipeline(&config);
        assert_eq!(p.timing.acceptance_window, Duration::days(MAX_WINDOW_DAYS));
        assert_eq!(p.timing.reply_poll, Duration::minutes(MAX_DELAY_MINUTES));
        assert_eq!(p.timing.follow_up_delay, Duration::zero());
        assert_eq!(p.timing.publish_after, Duration::zero());
        assert!(t0() + p.timing.acceptance_window > t0());
    }

    #[test]
    fn test_operator_changes_wait_for_in_flight_transition() {
        let (p, _, _) = pipeline(&ReachClawConfig::default());
        p.db().upsert_discovered(&raw_contact("ada", "Acme AI", 0.9), t0()).unwrap();
        p.db().quarantine("ada", "bad profile", t0()).unwrap();
        let held = p.claims().try_claim("ada").unwrap();

        let busy = p.opt_out("ada", "operator", None, t0()).unwrap_err();
        assert!(matches!(busy, OutreachError::Conflict(_)));
        let request = OverrideRequest {
            target: ContactState::Connected,
            actor: "operator".into(),
            reason: None,
            bypass_quota: true,
        };
        assert!(matches!(
            p.override_state("ada", &request, t0()),
            Err(OutreachError::Conflict(_))
        ));
        assert!(matches!(
            p.release_quarantine("ada", "operator", t0()),
            Err(OutreachError::Conflict(_))
        ));
        let contact = p.db().get("ada").unwrap();
        assert_eq!(contact.state, ContactState::Discovered);
        assert!(contact.quarantined);
        assert!(p.db().list_audit(Some("ada"), 5).unwrap().is_empty());

        drop(held);
        assert!(!p.release_quarantine("ada", "operator", t0()).unwrap().quarantined);
        assert_eq!(
            p.opt_out("ada", "operator", None, t0()).unwrap().state,
            ContactState::OptedOut
        );
        assert!(p.claims().is_empty());
    }

    #[tokio::test]
    async fn test_opt_out_twice_is_noop() {
        let (p, _, _) = pipeline(&ReachClawConfig::default());
        p.db().upsert_discovered(&raw_contact("ada", "Acme AI", 0.9), t0()).unwrap();
        let first = p.opt_out("ada", "operator", None, t0()).unwrap();
        let second = p.opt_out("ada", "operator", None, t0() + Duration::hours(1)).unwrap();
        assert_eq!(first.opted_out_at, second.opted_out_at);
        assert_eq!(p.db().list_audit(Some("ada"), 5).unwrap().len(), 1);
    }
}
