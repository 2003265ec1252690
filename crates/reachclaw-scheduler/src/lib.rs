//! # ReachClaw Scheduler
//!
//! Durable outreach pipeline engine.
//!
//! ## Design Principles
//! - SQLite persistence, single source of truth, survives restarts
//! - No in-memory timers: due work is always re-read from the store
//! - Daily quota enforced by one conditional UPSERT per consume
//! - Handlers keyed on persisted contact state, so replays are no-ops
//!
//! ## Architecture
//! ```text
//! Orchestrator (tokio interval + watch shutdown)
//!   ├── DelayScheduler::due(now) → Pipeline::fire_item  (bounded worker pool)
//!   ├── eligible Discovered contacts → QuotaGuard → Pipeline::send_connection_request
//!   ├── nightly gate  → Discovery::discover → OutreachDb::upsert_discovered
//!   ├── morning gate  → Pipeline::generate_content → ContentPost (pending_approval)
//!   └── approved posts past publish time → Pipeline::publish
//! ```

pub mod claims;
pub mod delay;
pub mod engine;
pub mod gates;
pub mod metrics;
pub mod persistence;
pub mod pipeline;
pub mod quota;

#[cfg(test)]
mod fakes;

pub use claims::{Backoff, ContactClaims};
pub use delay::DelayScheduler;
pub use engine::{Orchestrator, TickReport};
pub use gates::GateKeeper;
pub use metrics::PipelineMetrics;
pub use persistence::{OutreachDb, TransitionWrite};
pub use pipeline::{OverrideRequest, Pipeline, StepOutcome};
pub use quota::{QuotaDecision, QuotaGuard};
