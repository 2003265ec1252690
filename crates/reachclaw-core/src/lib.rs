//! # ReachClaw Core
//!
//! Shared vocabulary for the outreach pipeline: configuration, the error
//! taxonomy, persisted entity types, the contact lifecycle table, and the
//! traits every external collaborator (discovery, generation, delivery)
//! implements.

pub mod config;
pub mod error;
pub mod lifecycle;
pub mod traits;
pub mod types;

pub use config::ReachClawConfig;
pub use error::{OutreachError, Result};
pub use lifecycle::{ContactState, LifecycleEvent};
