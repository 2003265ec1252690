//! Per-contact processing claims and failure backoff.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use reachclaw_core::config::MAX_BACKOFF_SECS;

/// Set of contacts with an in-flight transition.
#[derive(Debug, Clone, Default)]
pub struct ContactClaims {
    inner: Arc<Mutex<HashSet<String>>>,
}

impl ContactClaims {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `id`. Returns `None` if another transition already holds it.
    pub fn try_claim(&self, id: &str) -> Option<ClaimGuard> {
        let mut held = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        if !held.insert(id.to_string()) {
            return None;
        }
        Some(ClaimGuard {
            id: id.to_string(),
            claims: self.inner.clone(),
        })
    }

    pub fn is_claimed(&self, id: &str) -> bool {
        self.inner
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .contains(id)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Releases the claim on drop, including on error paths and panics.
#[derive(Debug)]
pub struct ClaimGuard {
    id: String,
    claims: Arc<Mutex<HashSet<String>>>,
}

impl ClaimGuard {
    pub fn id(&self) -> &str {
        &self.id
    }
}

impl Drop for ClaimGuard {
    fn drop(&mut self) {
        self.claims
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(&self.id);
    }
}

/// Exponential backoff: `min(base * 2^(n-1), max)` plus up to 10% jitter.
/// Both bounds are capped at [`MAX_BACKOFF_SECS`].
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    pub base_secs: u64,
    pub max_secs: u64,
}

impl Backoff {
    pub fn new(base_secs: u64, max_secs: u64) -> Self {
        let cap = MAX_BACKOFF_SECS.unsigned_abs();
        let base_secs = base_secs.min(cap);
        Self {
            base_secs,
            max_secs: max_secs.clamp(base_secs, cap),
        }
    }

    /// Delay before retry after the `failures`-th consecutive failure, without jitter.
    pub fn delay(&self, failures: u32) -> Duration {
        let exp = failures.saturating_sub(1).min(32);
        let secs = self
            .base_secs
            .saturating_mul(1u64 << exp)
            .min(self.max_secs);
        let secs = i64::try_from(secs).map_or(MAX_BACKOFF_SECS, |s| s.min(MAX_BACKOFF_SECS));
        Duration::seconds(secs)
    }

    pub fn retry_after(&self, failures: u32, now: DateTime<Utc>) -> DateTime<Utc> {
        let delay = self.delay(failures);
        let jitter_cap = delay.num_milliseconds() / 10;
        let jitter = if jitter_cap > 0 {
            rand::thread_rng().gen_range(0..=jitter_cap)
        } else {
            0
        };
        now + delay + Duration::milliseconds(jitter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_claim_is_exclusive_and_released_on_drop() {
        let claims = ContactClaims::new();
        let guard = claims.try_claim("ada").unwrap();
        assert_eq!(guard.id(), "ada");
        assert!(claims.try_claim("ada").is_none());
        assert!(claims.try_claim("bob").is_some());
        drop(guard);
        assert!(!claims.is_claimed("ada"));
        assert!(claims.try_claim("ada").is_some());
    }

    #[test]
    fn test_claim_released_when_task_errors() {
        let claims = ContactClaims::new();
        let result: Result<(), String> = (|| {
            let _guard = claims.try_claim("ada").ok_or("busy")?;
            Err("send failed".to_string())
        })();
        assert!(result.is_err());
        assert!(claims.is_empty());
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let backoff = Backoff::new(60, 600);
        assert_eq!(backoff.delay(1), Duration::seconds(60));
        assert_eq!(backoff.delay(2), Duration::seconds(120));
        assert_eq!(backoff.delay(4), Duration::seconds(480));
        assert_eq!(backoff.delay(5), Duration::seconds(600));
        assert_eq!(backoff.delay(40), Duration::seconds(600));
    }

    #[test]
    fn test_backoff_huge_bounds_stay_positive() {
        let backoff = Backoff::new(60, u64::MAX);
        let cap = Duration::seconds(MAX_BACKOFF_SECS);
        assert_eq!(backoff.max_secs, MAX_BACKOFF_SECS as u64);
        assert_eq!(backoff.delay(64), cap);

        let backoff = Backoff::new(u64::MAX, u64::MAX);
        assert_eq!(backoff.delay(1), cap);
        let now = Utc.with_ymd_and_hms(2026, 3, 2, 8, 0, 0).unwrap();
        assert!(backoff.retry_after(3, now) > now);
    }

    #[test]
    fn test_retry_after_jitter_bounds() {
        let backoff = Backoff::new(100, 1000);
        let now = Utc.with_ymd_and_hms(2026, 3, 2, 8, 0, 0).unwrap();
        for _ in 0..50 {
            let at = backoff.retry_after(1, now);
            assert!(at >= now + Duration::seconds(100));
            assert!(at <= now + Duration::seconds(110));
        }
    }
}
