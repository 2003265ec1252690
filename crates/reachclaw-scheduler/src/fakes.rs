//! Scripted in-memory collaborators for tests.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use reachclaw_core::error::{OutreachError, Result};
use reachclaw_core::traits::{Delivery, Discovery, Generation, SendOutcome};
use reachclaw_core::types::{Contact, ContentPost, RawContact};

fn set(m: &Mutex<HashSet<String>>) -> std::sync::MutexGuard<'_, HashSet<String>> {
    m.lock().unwrap()
}

#[derive(Default)]
pub struct FakeDelivery {
    accepted: Mutex<HashSet<String>>,
    replied: Mutex<HashSet<String>>,
    opted_out: Mutex<HashSet<String>>,
    failing: Mutex<HashSet<String>>,
    hang: AtomicBool,
    fail_publish: AtomicBool,
    pub requests: Mutex<Vec<(String, Option<String>)>>,
    pub messages: Mutex<Vec<(String, String)>>,
    pub published: Mutex<Vec<i64>>,
    pub polls: AtomicUsize,
}

impl FakeDelivery {
    pub fn accept(&self, id: &str) {
        set(&self.accepted).insert(id.into());
    }

    pub fn reply(&self, id: &str) {
        set(&self.replied).insert(id.into());
    }

    pub fn opt_out(&self, id: &str) {
        set(&self.opted_out).insert(id.into());
    }

    /// Sends to `id` report `Failed` until `heal` is called.
    pub fn fail(&self, id: &str) {
        set(&self.failing).insert(id.into());
    }

    pub fn heal(&self, id: &str) {
        set(&self.failing).remove(id);
    }

    /// Every call sleeps far past any test timeout.
    pub fn hang(&self, on: bool) {
        self.hang.store(on, Ordering::SeqCst);
    }

    pub fn fail_publish(&self, on: bool) {
        self.fail_publish.store(on, Ordering::SeqCst);
    }

    pub fn requested_ids(&self) -> Vec<String> {
        self.requests.lock().unwrap().iter().map(|(id, _)| id.clone()).collect()
    }

    pub fn messages_to(&self, id: &str) -> usize {
        self.messages.lock().unwrap().iter().filter(|(to, _)| to == id).count()
    }

    async fn maybe_hang(&self) {
        if self.hang.load(Ordering::SeqCst) {
            tokio::time::sleep(std::time::Duration::from_secs(3600)).await;
        }
    }

    fn outcome(&self, id: &str) -> SendOutcome {
        if set(&self.failing).contains(id) {
            SendOutcome::Failed("platform rejected the action".into())
        } else {
            SendOutcome::Sent
        }
    }
}

#[async_trait]
impl Delivery for FakeDelivery {
    fn name(&self) -> &str {
        "fake"
    }

    async fn send_connection_request(&self, contact: &Contact, note: Option<&str>) -> Result<SendOutcome> {
        self.maybe_hang().await;
        let outcome = self.outcome(&contact.id);
        if outcome.is_sent() {
            self.requests
                .lock()
                .unwrap()
                .push((contact.id.clone(), note.map(str::to_string)));
        }
        Ok(outcome)
    }

    async fn send_message(&self, contact: &Contact, text: &str) -> Result<SendOutcome> {
        self.maybe_hang().await;
        let outcome = self.outcome(&contact.id);
        if outcome.is_sent() {
            self.messages
                .lock()
                .unwrap()
                .push((contact.id.clone(), text.to_string()));
        }
        Ok(outcome)
    }

    async fn detect_acceptance(&self, contact: &Contact) -> Result<bool> {
        self.maybe_hang().await;
        self.polls.fetch_add(1, Ordering::SeqCst);
        Ok(set(&self.accepted).contains(&contact.id))
    }

    async fn detect_reply(&self, contact: &Contact) -> Result<bool> {
        self.maybe_hang().await;
        self.polls.fetch_add(1, Ordering::SeqCst);
        Ok(set(&self.replied).contains(&contact.id))
    }

    async fn detect_opt_out(&self, contact: &Contact) -> Result<bool> {
        self.maybe_hang().await;
        Ok(set(&self.opted_out).contains(&contact.id))
    }

    async fn publish_post(&self, post: &ContentPost) -> Result<SendOutcome> {
        if self.fail_publish.load(Ordering::SeqCst) {
            return Err(OutreachError::TransientCollaborator("publish endpoint down".into()));
        }
        self.published.lock().unwrap().push(post.id);
        Ok(SendOutcome::Sent)
    }
}

#[derive(Default)]
pub struct FakeGenerator {
    fail: AtomicBool,
    pub calls: Mutex<Vec<(String, HashMap<String, String>)>>,
}

impl FakeGenerator {
    pub fn fail(&self, on: bool) {
        self.fail.store(on, Ordering::SeqCst);
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl Generation for FakeGenerator {
    fn name(&self) -> &str {
        "fake"
    }

    async fn generate_text(&self, template: &str, variables: &HashMap<String, String>) -> Result<String> {
        self.calls
            .lock()
            .unwrap()
            .push((template.to_string(), variables.clone()));
        if self.fail.load(Ordering::SeqCst) {
            return Err(OutreachError::TransientCollaborator("model offline".into()));
        }
        let who = variables.get("name").cloned().unwrap_or_default();
        Ok(format!("[{template}] hello {who}"))
    }
}

#[derive(Default)]
pub struct FakeDiscovery {
    pub by_org: Mutex<HashMap<String, Vec<RawContact>>>,
    failing: Mutex<HashSet<String>>,
    pub calls: Mutex<Vec<String>>,
}

impl FakeDiscovery {
    pub fn add(&self, raw: RawContact) {
        self.by_org
            .lock()
            .unwrap()
            .entry(raw.organization.clone())
            .or_default()
            .push(raw);
    }

    pub fn fail_org(&self, org: &str) {
        set(&self.failing).insert(org.into());
    }
}

#[async_trait]
impl Discovery for FakeDiscovery {
    fn name(&self) -> &str {
        "fake"
    }

    async fn discover(&self, organization: &str) -> Result<Vec<RawContact>> {
        self.calls.lock().unwrap().push(organization.to_string());
        if set(&self.failing).contains(organization) {
            return Err(OutreachError::TransientCollaborator(format!("{organization} unreachable")));
        }
        Ok(self
            .by_org
            .lock()
            .unwrap()
            .get(organization)
            .cloned()
            .unwrap_or_default())
    }
}

/// A discovered profile with the given score.
pub fn raw_contact(id: &str, organization: &str, score: f64) -> RawContact {
    RawContact {
        id: id.into(),
        name: format!("Contact {id}"),
        organization: organization.into(),
        title: "Machine Learning Engineer".into(),
        location: "Berlin".into(),
        ai_relevance_score: score,
        hiring_signal: false,
        profile: serde_json::json!({
            "skills": ["pytorch", "rust"],
            "recent_activity": "Shipped an inference server",
        }),
    }
}
