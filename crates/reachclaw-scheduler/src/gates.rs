//! Once-per-day time-of-day gates, persisted as rows in `daily_gates`.

use std::sync::Arc;

use chrono::{DateTime, FixedOffset, NaiveTime, Utc};
use reachclaw_core::config::{OrchestratorConfig, parse_gate_time};
use reachclaw_core::error::Result;

use crate::persistence::OutreachDb;

pub const NIGHTLY_GATE: &str = "nightly_discovery";
pub const MORNING_GATE: &str = "morning_content";

#[derive(Debug, Clone)]
pub struct DailyGate {
    pub name: &'static str,
    pub at: NaiveTime,
}

/// Claims gates at most once per calendar day in the reference timezone.
pub struct GateKeeper {
    db: Arc<OutreachDb>,
    tz: FixedOffset,
    nightly: DailyGate,
    morning: DailyGate,
}

impl GateKeeper {
    pub fn new(db: Arc<OutreachDb>, tz: FixedOffset, config: &OrchestratorConfig) -> Result<Self> {
        Ok(Self {
            db,
            tz,
            nightly: DailyGate {
                name: NIGHTLY_GATE,
                at: parse_gate_time(&config.nightly_gate)?,
            },
            morning: DailyGate {
                name: MORNING_GATE,
                at: parse_gate_time(&config.morning_gate)?,
            },
        })
    }

    pub fn nightly(&self) -> &DailyGate {
        &self.nightly
    }

    pub fn morning(&self) -> &DailyGate {
        &self.morning
    }

    /// Claim `gate` for today if its local time has passed and it has not fired today.
    /// Only the first caller per day gets `true`.
    pub fn try_fire(&self, gate: &DailyGate, now: DateTime<Utc>) -> Result<bool> {
        let local = now.with_timezone(&self.tz);
        if local.time() < gate.at {
            return Ok(false);
        }
        let claimed = self.db.try_claim_gate(gate.name, local.date_naive())?;
        if claimed {
            tracing::info!("🔔 Gate '{}' fired for {}", gate.name, local.date_naive());
        }
        Ok(claimed)
    }
}
