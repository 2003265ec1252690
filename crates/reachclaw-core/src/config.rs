//! ReachClaw configuration system.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{FixedOffset, NaiveTime, Offset, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{OutreachError, Result};
use crate::types::{ActionType, DuplicatePolicy};

/// Longest accepted delay or poll interval: one year.
pub const MAX_DELAY_MINUTES: i64 = 365 * 24 * 60;
/// Longest accepted acceptance or reply window: ten years.
pub const MAX_WINDOW_DAYS: i64 = 3650;
/// Longest accepted retry backoff: thirty days.
pub const MAX_BACKOFF_SECS: i64 = 30 * 24 * 60 * 60;

/// Root configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReachClawConfig {
    #[serde(default = "default_database_path")]
    pub database_path: String,
    /// Fixed reference timezone for calendar days and gates, as minutes east of UTC.
    #[serde(default)]
    pub utc_offset_minutes: i32,
    #[serde(default)]
    pub quota: QuotaConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    #[serde(default)]
    pub content: ContentConfig,
    #[serde(default)]
    pub generation: GenerationConfig,
    #[serde(default)]
    pub bridge: BridgeConfig,
    #[serde(default)]
    pub gateway: GatewayConfig,
}

fn default_database_path() -> String { "~/.reachclaw/outreach.db".into() }

impl Default for ReachClawConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            utc_offset_minutes: 0,
            quota: QuotaConfig::default(),
            pipeline: PipelineConfig::default(),
            orchestrator: OrchestratorConfig::default(),
            content: ContentConfig::default(),
            generation: GenerationConfig::default(),
            bridge: BridgeConfig::default(),
            gateway: GatewayConfig::default(),
        }
    }
}

impl ReachClawConfig {
    /// Load config from the default path (~/.reachclaw/config.toml).
    pub fn load() -> Result<Self> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load config from a specific path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| OutreachError::Config(format!("Failed to read config: {e}")))?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| OutreachError::Config(format!("Failed to parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Save config to a specific path.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| OutreachError::Config(format!("Failed to serialize config: {e}")))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Get the default config path.
    pub fn default_path() -> PathBuf {
        Self::home_dir().join("config.toml")
    }

    /// Get the ReachClaw home directory.
    pub fn home_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".reachclaw")
    }

    /// Database path with `~` expanded.
    pub fn database_path(&self) -> PathBuf {
        PathBuf::from(shellexpand::tilde(&self.database_path).to_string())
    }

    /// The reference timezone. Host-local time is never used.
    pub fn timezone(&self) -> FixedOffset {
        FixedOffset::east_opt(self.utc_offset_minutes * 60)
            .unwrap_or_else(|| Utc.fix())
    }

    pub fn validate(&self) -> Result<()> {
        if self.utc_offset_minutes.abs() > 14 * 60 {
            return Err(OutreachError::Config(format!(
                "utc_offset_minutes out of range: {}",
                self.utc_offset_minutes
            )));
        }
        if !(0.0..=1.0).contains(&self.pipeline.relevance_threshold) {
            return Err(OutreachError::Config(
                "pipeline.relevance_threshold must be within 0..=1".into(),
            ));
        }
        if self.orchestrator.max_workers == 0 {
            return Err(OutreachError::Config("orchestrator.max_workers must be ≥ 1".into()));
        }
        if self.orchestrator.tick_interval_secs == 0 {
            return Err(OutreachError::Config(
                "orchestrator.tick_interval_secs must be ≥ 1".into(),
            ));
        }
        parse_gate_time(&self.orchestrator.nightly_gate)?;
        parse_gate_time(&self.orchestrator.morning_gate)?;

        let p = &self.pipeline;
        let o = &self.orchestrator;
        check_range("pipeline.follow_up_delay_minutes", p.follow_up_delay_minutes, 0, MAX_DELAY_MINUTES)?;
        check_range("pipeline.acceptance_poll_minutes", p.acceptance_poll_minutes, 1, MAX_DELAY_MINUTES)?;
        check_range("pipeline.reply_poll_minutes", p.reply_poll_minutes, 1, MAX_DELAY_MINUTES)?;
        check_range("pipeline.acceptance_window_days", p.acceptance_window_days, 0, MAX_WINDOW_DAYS)?;
        check_range("pipeline.reply_window_days", p.reply_window_days, 0, MAX_WINDOW_DAYS)?;
        check_range("orchestrator.content_retry_minutes", o.content_retry_minutes, 1, MAX_DELAY_MINUTES)?;
        check_range("content.publish_after_minutes", self.content.publish_after_minutes, 0, MAX_DELAY_MINUTES)?;

        let max_backoff = MAX_BACKOFF_SECS.unsigned_abs();
        if o.backoff_max_secs > max_backoff || o.backoff_base_secs > o.backoff_max_secs {
            return Err(OutreachError::Config(format!(
                "orchestrator backoff must satisfy base ({}) ≤ max ({}) ≤ {max_backoff}",
                o.backoff_base_secs, o.backoff_max_secs
            )));
        }
        Ok(())
    }
}

fn check_range(name: &str, value: i64, min: i64, max: i64) -> Result<()> {
    if (min..=max).contains(&value) {
        Ok(())
    } else {
        Err(OutreachError::Config(format!(
            "{name} must be within {min}..={max}, got {value}"
        )))
    }
}

/// Parse a gate time of the form `HH:MM`.
pub fn parse_gate_time(s: &str) -> Result<NaiveTime> {
    NaiveTime::parse_from_str(s.trim(), "%H:%M")
        .map_err(|e| OutreachError::Config(format!("Invalid gate time '{s}': {e}")))
}

/// Daily ceilings per action type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuotaConfig {
    #[serde(default = "default_connection_ceiling")]
    pub connection_request: u32,
    #[serde(default = "default_follow_up_ceiling")]
    pub follow_up_message: u32,
    #[serde(default = "default_publish_ceiling")]
    pub content_publish: u32,
}

fn default_connection_ceiling() -> u32 { 30 }
fn default_follow_up_ceiling() -> u32 { 50 }
fn default_publish_ceiling() -> u32 { 1 }

impl QuotaConfig {
    pub fn ceiling(&self, action: ActionType) -> u32 {
        match action {
            ActionType::ConnectionRequest => self.connection_request,
            ActionType::FollowUpMessage => self.follow_up_message,
            ActionType::ContentPublish => self.content_publish,
        }
    }
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            connection_request: default_connection_ceiling(),
            follow_up_message: default_follow_up_ceiling(),
            content_publish: default_publish_ceiling(),
        }
    }
}

/// Contact lifecycle timing and eligibility.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default = "default_relevance_threshold")]
    pub relevance_threshold: f64,
    #[serde(default = "default_follow_up_delay")]
    pub follow_up_delay_minutes: i64,
    #[serde(default = "default_acceptance_poll")]
    pub acceptance_poll_minutes: i64,
    #[serde(default = "default_acceptance_window")]
    pub acceptance_window_days: i64,
    #[serde(default = "default_reply_poll")]
    pub reply_poll_minutes: i64,
    #[serde(default = "default_reply_window")]
    pub reply_window_days: i64,
    #[serde(default)]
    pub duplicate_policy: DuplicatePolicy,
    /// Generate a note for each connection request from the `connection_request` template.
    #[serde(default)]
    pub personalize_connection_requests: bool,
}

fn default_relevance_threshold() -> f64 { 0.5 }
fn default_follow_up_delay() -> i64 { 300 }
fn default_acceptance_poll() -> i64 { 15 }
fn default_acceptance_window() -> i64 { 30 }
fn default_reply_poll() -> i64 { 60 }
fn default_reply_window() -> i64 { 7 }

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            relevance_threshold: default_relevance_threshold(),
            follow_up_delay_minutes: default_follow_up_delay(),
            acceptance_poll_minutes: default_acceptance_poll(),
            acceptance_window_days: default_acceptance_window(),
            reply_poll_minutes: default_reply_poll(),
            reply_window_days: default_reply_window(),
            duplicate_policy: DuplicatePolicy::default(),
            personalize_connection_requests: false,
        }
    }
}

/// Control loop cadence, worker pool and gates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    #[serde(default = "default_tick_interval")]
    pub tick_interval_secs: u64,
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    #[serde(default = "default_collaborator_timeout")]
    pub collaborator_timeout_secs: u64,
    #[serde(default = "default_nightly_gate")]
    pub nightly_gate: String,
    #[serde(default = "default_morning_gate")]
    pub morning_gate: String,
    #[serde(default = "default_backoff_base")]
    pub backoff_base_secs: u64,
    #[serde(default = "default_backoff_max")]
    pub backoff_max_secs: u64,
    #[serde(default = "default_max_discovery_companies")]
    pub max_discovery_companies: usize,
    #[serde(default = "default_content_retry")]
    pub content_retry_minutes: i64,
}

fn default_tick_interval() -> u64 { 120 }
fn default_max_workers() -> usize { 4 }
fn default_collaborator_timeout() -> u64 { 60 }
fn default_nightly_gate() -> String { "02:00".into() }
fn default_morning_gate() -> String { "07:00".into() }
fn default_backoff_base() -> u64 { 60 }
fn default_backoff_max() -> u64 { 6 * 3600 }
fn default_max_discovery_companies() -> usize { 10 }
fn default_content_retry() -> i64 { 30 }

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            tick_interval_secs: default_tick_interval(),
            max_workers: default_max_workers(),
            collaborator_timeout_secs: default_collaborator_timeout(),
            nightly_gate: default_nightly_gate(),
            morning_gate: default_morning_gate(),
            backoff_base_secs: default_backoff_base(),
            backoff_max_secs: default_backoff_max(),
            max_discovery_companies: default_max_discovery_companies(),
            content_retry_minutes: default_content_retry(),
        }
    }
}

/// Content side-lane.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentConfig {
    /// Delay between generation and the earliest publish time.
    #[serde(default = "default_publish_after")]
    pub publish_after_minutes: i64,
    #[serde(default = "default_post_template")]
    pub template: String,
}

fn default_publish_after() -> i64 { 180 }
fn default_post_template() -> String { "viral_post".into() }

impl Default for ContentConfig {
    fn default() -> Self {
        Self {
            publish_after_minutes: default_publish_after(),
            template: default_post_template(),
        }
    }
}

/// Text-generation backend (Ollama) and prompt templates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationConfig {
    #[serde(default = "default_ollama_url")]
    pub base_url: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
    #[serde(default = "default_retry_delay")]
    pub retry_delay_secs: u64,
    #[serde(default = "default_generation_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_prompts")]
    pub prompts: HashMap<String, PromptTemplate>,
}

/// A system/user prompt pair with `{variable}` placeholders.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptTemplate {
    #[serde(default)]
    pub system: String,
    pub user: String,
}

fn default_ollama_url() -> String { "http://localhost:11434".into() }
fn default_model() -> String { "llama3.2".into() }
fn default_temperature() -> f32 { 0.7 }
fn default_max_tokens() -> u32 { 1000 }
fn default_retry_attempts() -> u32 { 3 }
fn default_retry_delay() -> u64 { 2 }
fn default_generation_timeout() -> u64 { 60 }

fn default_prompts() -> HashMap<String, PromptTemplate> {
    let mut prompts = HashMap::new();
    prompts.insert(
        "connection_request".into(),
        PromptTemplate {
            system: "You are a professional networking assistant writing short, personal connection requests.".into(),
            user: "Write a connection note (max 280 chars) for {name}, {title} at {company}.".into(),
        },
    );
    prompts.insert(
        "personalized_message".into(),
        PromptTemplate {
            system: "You write concise, highly personalized outreach messages for AI professionals.".into(),
            user: "Write a personalized message to {name}, {title} at {company}. Profile: {profile_data}. Recent activity: {recent_activity}.".into(),
        },
    );
    prompts.insert(
        "viral_post".into(),
        PromptTemplate {
            system: "You are a content strategist specializing in AI topics.".into(),
            user: "Write an engaging post about AI for {date}. Max 1300 characters.".into(),
        },
    );
    prompts
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            base_url: default_ollama_url(),
            model: default_model(),
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            retry_attempts: default_retry_attempts(),
            retry_delay_secs: default_retry_delay(),
            timeout_secs: default_generation_timeout(),
            prompts: default_prompts(),
        }
    }
}

/// HTTP bridge to the browser-automation service that talks to the platform.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    #[serde(default = "default_bridge_url")]
    pub base_url: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_bridge_timeout")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub target_companies: Vec<String>,
}

fn default_bridge_url() -> String { "http://127.0.0.1:8765".into() }
fn default_bridge_timeout() -> u64 { 90 }

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            base_url: default_bridge_url(),
            api_key: String::new(),
            timeout_secs: default_bridge_timeout(),
            target_companies: Vec::new(),
        }
    }
}

/// Gateway (operator HTTP API) configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_host")]
    pub host: String,
}

fn default_port() -> u16 { 3077 }
fn default_host() -> String { "127.0.0.1".into() }

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            host: default_host(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ReachClawConfig::default();
        assert_eq!(config.quota.connection_request, 30);
        assert_eq!(config.pipeline.follow_up_delay_minutes, 300);
        assert_eq!(config.orchestrator.nightly_gate, "02:00");
        assert!(config.generation.prompts.contains_key("personalized_message"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_from_toml() {
        let toml_str = r#"
            utc_offset_minutes = 330

            [quota]
            connection_request = 3

            [pipeline]
            relevance_threshold = 0.7
            duplicate_policy = "reject"

            [bridge]
            target_companies = ["Acme AI", "Globex"]
        "#;

        let config: ReachClawConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.quota.connection_request, 3);
        assert_eq!(config.quota.follow_up_message, 50);
        assert_eq!(config.pipeline.duplicate_policy, DuplicatePolicy::Reject);
        assert_eq!(config.bridge.target_companies.len(), 2);
        assert_eq!(config.timezone().local_minus_utc(), 330 * 60);
    }

    #[test]
    fn test_config_missing_fields_use_defaults() {
        let config: ReachClawConfig = toml::from_str("").unwrap();
        assert_eq!(config.gateway.port, 3077);
        assert_eq!(config.pipeline.duplicate_policy, DuplicatePolicy::Replace);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = ReachClawConfig::default();
        config.orchestrator.nightly_gate = "25:99".into();
        assert!(config.validate().is_err());

        let mut config = ReachClawConfig::default();
        config.pipeline.relevance_threshold = 1.5;
        assert!(config.validate().is_err());

        let mut config = ReachClawConfig::default();
        config.utc_offset_minutes = 20 * 60;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_bounds_durations() {
        let check = |edit: fn(&mut ReachClawConfig)| {
            let mut config = ReachClawConfig::default();
            edit(&mut config);
            config.validate()
        };
        assert!(check(|c| c.pipeline.follow_up_delay_minutes = -5).is_err());
        assert!(check(|c| c.content.publish_after_minutes = -1).is_err());
        assert!(check(|c| c.pipeline.acceptance_poll_minutes = 0).is_err());
        assert!(check(|c| c.pipeline.acceptance_window_days = i64::MAX).is_err());
        assert!(check(|c| c.pipeline.reply_window_days = MAX_WINDOW_DAYS + 1).is_err());
        assert!(check(|c| c.pipeline.reply_poll_minutes = i64::MAX / 2).is_err());
        assert!(check(|c| c.orchestrator.backoff_max_secs = u64::MAX).is_err());
        assert!(check(|c| c.orchestrator.backoff_base_secs = c.orchestrator.backoff_max_secs + 1).is_err());

        let err = check(|c| c.pipeline.follow_up_delay_minutes = -5).unwrap_err();
        assert!(err.to_string().contains("follow_up_delay_minutes"));

        // Edges are accepted.
        assert!(check(|c| c.pipeline.follow_up_delay_minutes = 0).is_ok());
        assert!(check(|c| c.pipeline.reply_window_days = MAX_WINDOW_DAYS).is_ok());
        assert!(check(|c| c.orchestrator.backoff_max_secs = MAX_BACKOFF_SECS as u64).is_ok());
    }

    #[test]
    fn test_save_and_load() {
        let dir = std::env::temp_dir().join("reachclaw-config-test");
        let path = dir.join("config.toml");
        let mut config = ReachClawConfig::default();
        config.quota.connection_request = 12;
        config.save_to(&path).unwrap();
        let loaded = ReachClawConfig::load_from(&path).unwrap();
        assert_eq!(loaded.quota.connection_request, 12);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_home_dir() {
        let home = ReachClawConfig::home_dir();
        assert!(home.to_string_lossy().contains("reachclaw"));
    }
}
