//! Collaborator interfaces. The pipeline calls these; it never implements them.

use std::collections::HashMap;

use async_trait::async_trait;

use crate::error::Result;
use crate::types::{Contact, ContentPost, RawContact};

/// Result of a side-effecting platform action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    Sent,
    Failed(String),
}

impl SendOutcome {
    pub fn is_sent(&self) -> bool {
        matches!(self, SendOutcome::Sent)
    }
}

/// Finds candidate contacts at target organizations.
#[async_trait]
pub trait Discovery: Send + Sync {
    fn name(&self) -> &str;

    /// Profiles found at one organization. Transient failures only affect that organization.
    async fn discover(&self, organization: &str) -> Result<Vec<RawContact>>;
}

/// Produces text from a named prompt template.
#[async_trait]
pub trait Generation: Send + Sync {
    fn name(&self) -> &str;

    async fn generate_text(
        &self,
        template: &str,
        variables: &HashMap<String, String>,
    ) -> Result<String>;
}

/// Performs and observes actions on the external platform.
#[async_trait]
pub trait Delivery: Send + Sync {
    fn name(&self) -> &str;

    async fn send_connection_request(
        &self,
        contact: &Contact,
        note: Option<&str>,
    ) -> Result<SendOutcome>;

    async fn send_message(&self, contact: &Contact, text: &str) -> Result<SendOutcome>;

    async fn detect_acceptance(&self, contact: &Contact) -> Result<bool>;

    async fn detect_reply(&self, contact: &Contact) -> Result<bool>;

    async fn detect_opt_out(&self, contact: &Contact) -> Result<bool>;

    async fn publish_post(&self, post: &ContentPost) -> Result<SendOutcome>;
}
