//! Orchestrator Loop: wakes on a fixed cadence, drains due items, spends the
//! day's connection budget, and runs the nightly/morning gates.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::StreamExt;
use reachclaw_core::config::ReachClawConfig;
use reachclaw_core::error::{OutreachError, Result};
use reachclaw_core::traits::Discovery;
use reachclaw_core::types::{ActionType, Contact, ItemOutcome, ScheduledItem};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::claims::{ClaimGuard, ContactClaims};
use crate::delay::DelayScheduler;
use crate::gates::GateKeeper;
use crate::persistence::DiscoveryUpsert;
use crate::pipeline::{Pipeline, StepOutcome};
use crate::quota::QuotaReservation;

/// Claim key for system-owned items.
const SYSTEM_CLAIM: &str = "\u{0}system";

/// What one wake accomplished.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TickReport {
    pub items_processed: usize,
    pub transitions: usize,
    pub requests_sent: usize,
    pub deferred: usize,
    pub failures: usize,
    pub quarantined: usize,
    pub discovered: usize,
    pub posts_generated: usize,
    pub posts_published: usize,
    pub nightly_fired: bool,
    pub morning_fired: bool,
}

impl TickReport {
    pub fn is_idle(&self) -> bool {
        *self == TickReport::default()
    }

    /// Count a failed tick step; the remaining steps still run.
    fn step(&mut self, name: &str, result: Result<()>) {
        if let Err(e) = result {
            tracing::error!("❌ Tick step '{name}' failed: {e}");
            self.failures += 1;
        }
    }

    fn absorb(&mut self, outcome: &Result<StepOutcome>) {
        match outcome {
            Ok(StepOutcome::Advanced(_)) => self.transitions += 1,
            Ok(StepOutcome::Resolved(_)) => {}
            Ok(StepOutcome::Deferred(_)) => self.deferred += 1,
            Err(e) if e.quarantines() => {
                self.failures += 1;
                self.quarantined += 1;
            }
            Err(_) => self.failures += 1,
        }
    }
}

pub struct Orchestrator {
    pipeline: Arc<Pipeline>,
    delay: DelayScheduler,
    gates: GateKeeper,
    discovery: Arc<dyn Discovery>,
    relevance_threshold: f64,
    max_workers: usize,
    target_companies: Vec<String>,
    max_discovery_companies: usize,
    tick_interval: std::time::Duration,
    call_timeout: std::time::Duration,
}

impl Orchestrator {
    pub fn new(
        pipeline: Arc<Pipeline>,
        discovery: Arc<dyn Discovery>,
        config: &ReachClawConfig,
    ) -> Result<Self> {
        let db = pipeline.db().clone();
        let o = &config.orchestrator;
        Ok(Self {
            delay: DelayScheduler::new(db.clone()),
            gates: GateKeeper::new(db, config.timezone(), o)?,
            pipeline,
            discovery,
            relevance_threshold: config.pipeline.relevance_threshold,
            max_workers: o.max_workers.max(1),
            target_companies: config.bridge.target_companies.clone(),
            max_discovery_companies: o.max_discovery_companies,
            tick_interval: std::time::Duration::from_secs(o.tick_interval_secs.max(1)),
            call_timeout: std::time::Duration::from_secs(o.collaborator_timeout_secs.max(1)),
        })
    }

    pub fn pipeline(&self) -> &Arc<Pipeline> {
        &self.pipeline
    }

    pub fn claims(&self) -> &ContactClaims {
        self.pipeline.claims()
    }

    /// One wake of the control loop. Each step runs even if an earlier one
    /// failed; failures are logged and counted in the report.
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<TickReport> {
        let mut report = TickReport::default();

        let drained = self.drain_due_items(now, &mut report).await;
        report.step("due items", drained);
        let requested = self.send_connection_requests(now, &mut report).await;
        report.step("connection requests", requested);

        match self.gates.try_fire(self.gates.nightly(), now) {
            Ok(true) => {
                report.nightly_fired = true;
                report.discovered = self.run_discovery(now).await;
            }
            Ok(false) => {}
            Err(e) => report.step("nightly gate", Err(e)),
        }
        match self.gates.try_fire(self.gates.morning(), now) {
            Ok(true) => {
                report.morning_fired = true;
                match self.pipeline.generate_content(None, now).await {
                    Ok(_) => report.posts_generated += 1,
                    Err(_) => report.failures += 1,
                }
            }
            Ok(false) => {}
            Err(e) => report.step("morning gate", Err(e)),
        }

        let published = self.publish_due_posts(now, &mut report).await;
        report.step("publishing", published);

        if report.is_idle() {
            tracing::debug!("💤 Tick at {now}: nothing to do");
        } else {
            tracing::info!(
                "⏱️ Tick: {} items, {} transitions, {} requests, {} deferred, {} failures",
                report.items_processed,
                report.transitions,
                report.requests_sent,
                report.deferred,
                report.failures
            );
        }
        Ok(report)
    }

    async fn drain_due_items(&self, now: DateTime<Utc>, report: &mut TickReport) -> Result<()> {
        let due = self.delay.due(now)?;
        if due.is_empty() {
            return Ok(());
        }
        tracing::debug!("📬 {} due item(s)", due.len());

        let outcomes: Vec<Option<Result<StepOutcome>>> = futures::stream::iter(due)
            .map(|item| self.run_item(item, now))
            .buffered(self.max_workers)
            .collect()
            .await;
        for outcome in outcomes.iter().flatten() {
            report.items_processed += 1;
            if matches!(outcome, Ok(StepOutcome::Resolved(ItemOutcome::ContentGenerated))) {
                report.posts_generated += 1;
            }
            report.absorb(outcome);
        }
        Ok(())
    }

    /// Fire one item under its owner's claim. `None` when the owner is busy.
    async fn run_item(&self, item: ScheduledItem, now: DateTime<Utc>) -> Option<Result<StepOutcome>> {
        let key = item.owner.contact_id().unwrap_or(SYSTEM_CLAIM).to_string();
        let Some(_claim) = self.claims().try_claim(&key) else {
            tracing::debug!("🔒 {key} busy, item #{} waits for next tick", item.id);
            return None;
        };
        let outcome = self.pipeline.fire_item(&item, now).await;
        if let Err(e) = &outcome {
            self.isolate(item.owner.contact_id(), Some(item.id), e, now);
        }
        Some(outcome)
    }

    async fn send_connection_requests(&self, now: DateTime<Utc>, report: &mut TickReport) -> Result<()> {
        let db = self.pipeline.db();
        let eligible = db.eligible_for_request(self.relevance_threshold, now, crate::delay::DEFAULT_BATCH)?;
        if eligible.is_empty() {
            return Ok(());
        }

        // Reserve sequentially in priority order, dispatch concurrently.
        let mut granted: Vec<(Contact, QuotaReservation, ClaimGuard)> = Vec::new();
        let mut denial: Option<String> = None;
        for contact in eligible {
            if let Some(reason) = &denial {
                db.note(&contact.id, reason)?;
                continue;
            }
            let Some(claim) = self.claims().try_claim(&contact.id) else {
                continue;
            };
            match self.pipeline.quota().reserve(ActionType::ConnectionRequest, now) {
                Ok(reservation) => granted.push((contact, reservation, claim)),
                Err(OutreachError::QuotaExceeded { action, date }) => {
                    let reason = format!("daily {action} limit reached for {date}");
                    tracing::info!("🧮 {reason}, remaining contacts wait");
                    db.note(&contact.id, &reason)?;
                    report.deferred += 1;
                    denial = Some(reason);
                }
                Err(e) => return Err(e),
            }
        }

        let outcomes: Vec<Result<StepOutcome>> = futures::stream::iter(granted)
            .map(|(contact, reservation, claim)| async move {
                let id = contact.id.clone();
                let outcome = self
                    .pipeline
                    .send_connection_request(contact, reservation, now)
                    .await;
                if let Err(e) = &outcome {
                    self.isolate(Some(&id), None, e, now);
                }
                drop(claim);
                outcome
            })
            .buffer_unordered(self.max_workers)
            .collect()
            .await;
        for outcome in &outcomes {
            if matches!(outcome, Ok(StepOutcome::Advanced(_))) {
                report.requests_sent += 1;
            }
            report.absorb(outcome);
        }
        Ok(())
    }

    /// Scan target companies; one company failing does not stop the rest.
    async fn run_discovery(&self, now: DateTime<Utc>) -> usize {
        let db = self.pipeline.db();
        let mut inserted = 0;
        for company in self.target_companies.iter().take(self.max_discovery_companies) {
            let found = match tokio::time::timeout(self.call_timeout, self.discovery.discover(company)).await {
                Ok(Ok(found)) => found,
                Ok(Err(e)) => {
                    tracing::warn!("⚠️ Discovery failed for {company}: {e}");
                    continue;
                }
                Err(_) => {
                    tracing::warn!("⚠️ Discovery timed out for {company}");
                    continue;
                }
            };
            for raw in &found {
                match db.upsert_discovered(raw, now) {
                    Ok(DiscoveryUpsert::Inserted) => inserted += 1,
                    Ok(DiscoveryUpsert::Updated) => {}
                    Err(e) => tracing::warn!("⚠️ Could not store {}: {e}", raw.id),
                }
            }
            tracing::info!("🔎 {company}: {} profile(s) found", found.len());
        }
        inserted
    }

    async fn publish_due_posts(&self, now: DateTime<Utc>, report: &mut TickReport) -> Result<()> {
        for post in self.pipeline.db().due_posts(now)? {
            match self.pipeline.publish(&post, now).await {
                Ok(StepOutcome::Deferred(_)) => report.deferred += 1,
                Ok(_) => report.posts_published += 1,
                Err(e) => {
                    tracing::warn!("⚠️ Publishing post #{} failed: {e}", post.id);
                    report.failures += 1;
                }
            }
        }
        Ok(())
    }

    /// Log a per-contact failure and quarantine when the error calls for it.
    fn isolate(&self, contact_id: Option<&str>, item_id: Option<i64>, error: &OutreachError, now: DateTime<Utc>) {
        let db = self.pipeline.db();
        if let Some(item_id) = item_id {
            if let Err(e) = db.record_item_error(item_id, &error.to_string()) {
                tracing::error!("❌ Could not record error on item #{item_id}: {e}");
            }
        }
        match contact_id {
            Some(id) if error.quarantines() => {
                tracing::error!("🚨 Quarantining {id}: {error}");
                if let Err(e) = db.quarantine(id, &error.to_string(), now) {
                    tracing::error!("❌ Could not quarantine {id}: {e}");
                }
            }
            Some(id) => tracing::warn!("⚠️ {id}: {error}"),
            None => tracing::warn!("⚠️ System item failed: {error}"),
        }
    }

    /// Run until `shutdown` flips to true. The first tick runs immediately to
    /// catch up on anything that came due while stopped. A tick in progress
    /// always completes before the loop exits.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(
            "⏰ Orchestrator started (tick every {}s, {} workers)",
            self.tick_interval.as_secs(),
            self.max_workers
        );
        let mut interval = tokio::time::interval(self.tick_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.tick(Utc::now()).await {
                        tracing::error!("❌ Tick failed: {e}");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        tracing::info!("🛑 Orchestrator stopped");
    }

    pub fn spawn(self: Arc<Self>, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }
}
