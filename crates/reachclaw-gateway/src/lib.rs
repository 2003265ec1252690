//! # ReachClaw Gateway
//!
//! Operator HTTP API: contact inspection, manual overrides and opt-outs,
//! quarantine release, content review, and the metrics feed.

pub mod routes;
pub mod server;

pub use server::{AppState, build_router, start};
