//! API route handlers for the gateway.

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use chrono::{DateTime, Utc};
use reachclaw_core::error::OutreachError;
use reachclaw_core::lifecycle::ContactState;
use reachclaw_core::types::{ContactFilter, ItemOwner, PostStatus};
use reachclaw_scheduler::persistence::AuditRecord;
use reachclaw_scheduler::{OverrideRequest, PipelineMetrics};
use serde::Deserialize;
use serde_json::{Value, json};
use std::sync::Arc;

use super::server::AppState;

type ApiResponse = (StatusCode, Json<Value>);

const DEFAULT_ACTOR: &str = "operator";
const CONTACT_AUDIT_LIMIT: usize = 50;

fn ok(mut body: Value) -> ApiResponse {
    body["ok"] = Value::Bool(true);
    (StatusCode::OK, Json(body))
}

fn bad_request(message: impl Into<String>) -> ApiResponse {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({"ok": false, "error": message.into()})),
    )
}

/// Map a pipeline error onto an HTTP status.
fn fail(err: OutreachError) -> ApiResponse {
    let status = match &err {
        OutreachError::NotFound(_) => StatusCode::NOT_FOUND,
        OutreachError::InvalidTransition { .. }
        | OutreachError::Conflict(_)
        | OutreachError::DuplicateScheduledItem { .. } => StatusCode::CONFLICT,
        OutreachError::QuotaExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
        OutreachError::Config(_) | OutreachError::Inconsistent(_) => StatusCode::UNPROCESSABLE_ENTITY,
        OutreachError::TransientCollaborator(_) => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status.is_server_error() {
        tracing::error!("❌ API error: {err}");
    }
    (status, Json(json!({"ok": false, "error": err.to_string()})))
}

// ─── Health & Info ──────────────────────────────────────

/// Health check endpoint.
pub async fn health_check() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "service": "reachclaw-gateway",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// System information endpoint.
pub async fn system_info(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "name": "ReachClaw",
        "version": env!("CARGO_PKG_VERSION"),
        "platform": format!("{}/{}", std::env::consts::OS, std::env::consts::ARCH),
        "uptime_secs": state.start_time.elapsed().as_secs(),
        "duplicate_policy": state.pipeline.db().duplicate_policy(),
        "gateway": {
            "host": state.gateway_config.host,
            "port": state.gateway_config.port,
        }
    }))
}

/// State counts, quota headroom, backlog and funnel rates.
pub async fn metrics(State(state): State<Arc<AppState>>) -> ApiResponse {
    let pipeline = &state.pipeline;
    match PipelineMetrics::collect(pipeline.db(), pipeline.quota(), Utc::now()) {
        Ok(m) => ok(json!({ "metrics": m })),
        Err(e) => fail(e),
    }
}

// ─── Contacts ───────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
pub struct ContactQuery {
    pub state: Option<String>,
    pub organization: Option<String>,
    pub discovered_after: Option<DateTime<Utc>>,
    pub discovered_before: Option<DateTime<Utc>>,
    pub quarantined: Option<bool>,
    pub limit: Option<usize>,
}

/// List contacts, optionally filtered by state, organization and discovery window.
pub async fn list_contacts(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ContactQuery>,
) -> ApiResponse {
    let contact_state = match query.state.as_deref() {
        Some(s) => match ContactState::parse(s) {
            Some(cs) => Some(cs),
            None => return bad_request(format!("unknown state '{s}'")),
        },
        None => None,
    };
    let filter = ContactFilter {
        state: contact_state,
        organization: query.organization,
        discovered_after: query.discovered_after,
        discovered_before: query.discovered_before,
        quarantined: query.quarantined,
        limit: query.limit,
    };
    match state.pipeline.db().list(&filter) {
        Ok(contacts) => ok(json!({ "count": contacts.len(), "contacts": contacts })),
        Err(e) => fail(e),
    }
}

/// One contact with its scheduled items and recent audit trail.
pub async fn get_contact(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> ApiResponse {
    let db = state.pipeline.db();
    let contact = match db.get(&id) {
        Ok(c) => c,
        Err(e) => return fail(e),
    };
    let items = match db.items_for(&ItemOwner::Contact(id.clone())) {
        Ok(items) => items,
        Err(e) => return fail(e),
    };
    match db.list_audit(Some(&id), CONTACT_AUDIT_LIMIT) {
        Ok(audit) => ok(json!({ "contact": contact, "items": items, "audit": audit })),
        Err(e) => fail(e),
    }
}

/// Operator identity and free-text reason carried by mutating requests.
#[derive(Debug, Default, Deserialize)]
pub struct ActorBody {
    #[serde(default)]
    pub actor: Option<String>,
    #[serde(default)]
    pub reason: Option<String>,
}

impl ActorBody {
    fn actor(&self) -> String {
        self.actor
            .as_deref()
            .filter(|a| !a.trim().is_empty())
            .unwrap_or(DEFAULT_ACTOR)
            .to_string()
    }
}

#[derive(Debug, Deserialize)]
pub struct OverrideBody {
    pub target: String,
    #[serde(flatten)]
    pub who: ActorBody,
    #[serde(default)]
    pub bypass_quota: bool,
}

/// Force a contact forward to a later state.
pub async fn override_contact(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(body): Json<OverrideBody>,
) -> ApiResponse {
    let Some(target) = ContactState::parse(&body.target) else {
        return bad_request(format!("unknown state '{}'", body.target));
    };
    let request = OverrideRequest {
        target,
        actor: body.who.actor(),
        reason: body.who.reason.clone(),
        bypass_quota: body.bypass_quota,
    };
    match state.pipeline.override_state(&id, &request, Utc::now()) {
        Ok(contact) => ok(json!({ "contact": contact })),
        Err(e) => fail(e),
    }
}

/// Mark a contact opted-out. Idempotent.
pub async fn opt_out_contact(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(body): Json<ActorBody>,
) -> ApiResponse {
    match state
        .pipeline
        .opt_out(&id, &body.actor(), body.reason.clone(), Utc::now())
    {
        Ok(contact) => ok(json!({ "contact": contact })),
        Err(e) => fail(e),
    }
}

/// Return a quarantined contact to automated processing.
pub async fn release_contact(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(body): Json<ActorBody>,
) -> ApiResponse {
    match state.pipeline.release_quarantine(&id, &body.actor(), Utc::now()) {
        Ok(contact) => ok(json!({ "contact": contact })),
        Err(e) => fail(e),
    }
}

/// Recent audit entries, newest first. `?contact_id=` narrows to one contact.
pub async fn list_audit(
    State(state): State<Arc<AppState>>,
    Query(params): Query<std::collections::HashMap<String, String>>,
) -> ApiResponse {
    let limit = params
        .get("limit")
        .and_then(|l| l.parse::<usize>().ok())
        .unwrap_or(100);
    let contact_id = params.get("contact_id").map(String::as_str);
    match state.pipeline.db().list_audit(contact_id, limit) {
        Ok(entries) => ok(json!({ "entries": entries })),
        Err(e) => fail(e),
    }
}

// ─── Content review ─────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
pub struct PostQuery {
    pub status: Option<String>,
}

pub async fn list_posts(
    State(state): State<Arc<AppState>>,
    Query(query): Query<PostQuery>,
) -> ApiResponse {
    let status = match query.status.as_deref() {
        Some(s) => match PostStatus::parse(s) {
            Some(ps) => Some(ps),
            None => return bad_request(format!("unknown post status '{s}'")),
        },
        None => None,
    };
    match state.pipeline.db().list_posts(status) {
        Ok(posts) => ok(json!({ "posts": posts })),
        Err(e) => fail(e),
    }
}

pub async fn get_post(State(state): State<Arc<AppState>>, Path(id): Path<i64>) -> ApiResponse {
    match state.pipeline.db().get_post(id) {
        Ok(post) => ok(json!({ "post": post })),
        Err(e) => fail(e),
    }
}

#[derive(Debug, Deserialize)]
pub struct EditPostBody {
    pub text: String,
}

/// Replace the text of a post that has not been published or rejected.
pub async fn edit_post(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Json(body): Json<EditPostBody>,
) -> ApiResponse {
    if body.text.trim().is_empty() {
        return bad_request("text must not be empty");
    }
    match state.pipeline.db().update_post_text(id, &body.text) {
        Ok(post) => ok(json!({ "post": post })),
        Err(e) => fail(e),
    }
}

pub async fn approve_post(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Json(body): Json<ActorBody>,
) -> ApiResponse {
    review_post(&state, id, &[PostStatus::PendingApproval], PostStatus::Approved, &body)
}

pub async fn reject_post(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Json(body): Json<ActorBody>,
) -> ApiResponse {
    review_post(
        &state,
        id,
        &[PostStatus::PendingApproval, PostStatus::Approved],
        PostStatus::Rejected,
        &body,
    )
}

fn review_post(
    state: &AppState,
    id: i64,
    from: &[PostStatus],
    to: PostStatus,
    body: &ActorBody,
) -> ApiResponse {
    let audit = AuditRecord {
        actor: body.actor(),
        action: format!("post_{to}"),
        detail: Some(match &body.reason {
            Some(reason) => format!("post {id}: {reason}"),
            None => format!("post {id}"),
        }),
    };
    match state.pipeline.db().review_post(id, from, to, &audit, Utc::now()) {
        Ok(post) => {
            tracing::info!("📝 Post {id} {to} by {}", audit.actor);
            ok(json!({ "post": post }))
        }
        Err(e) => fail(e),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use async_trait::async_trait;
    use reachclaw_core::config::ReachClawConfig;
    use reachclaw_core::error::Result;
    use reachclaw_core::traits::{Delivery, Generation, SendOutcome};
    use reachclaw_core::types::{Contact, ContentPost, DuplicatePolicy, RawContact};
    use reachclaw_scheduler::{OutreachDb, Pipeline};

    struct Offline;

    #[async_trait]
    impl Delivery for Offline {
        fn name(&self) -> &str {
            "offline"
        }
        async fn send_connection_request(&self, _: &Contact, _: Option<&str>) -> Result<SendOutcome> {
            Ok(SendOutcome::Failed("offline".into()))
        }
        async fn send_message(&self, _: &Contact, _: &str) -> Result<SendOutcome> {
            Ok(SendOutcome::Failed("offline".into()))
        }
        async fn detect_acceptance(&self, _: &Contact) -> Result<bool> {
            Ok(false)
        }
        async fn detect_reply(&self, _: &Contact) -> Result<bool> {
            Ok(false)
        }
        async fn detect_opt_out(&self, _: &Contact) -> Result<bool> {
            Ok(false)
        }
        async fn publish_post(&self, _: &ContentPost) -> Result<SendOutcome> {
            Ok(SendOutcome::Failed("offline".into()))
        }
    }

    #[async_trait]
    impl Generation for Offline {
        fn name(&self) -> &str {
            "offline"
        }
        async fn generate_text(
            &self,
            _: &str,
            _: &std::collections::HashMap<String, String>,
        ) -> Result<String> {
            Err(OutreachError::TransientCollaborator("offline".into()))
        }
    }

    pub(crate) fn test_state() -> Arc<AppState> {
        let db = Arc::new(OutreachDb::open_in_memory(DuplicatePolicy::Replace).unwrap());
        let now = Utc::now();
        for (id, org) in [("ada", "Acme AI"), ("bob", "Acme AI"), ("cyd", "Nimbus Labs")] {
            let raw = RawContact {
                id: id.into(),
                name: id.to_uppercase(),
                organization: org.into(),
                title: "ML Engineer".into(),
                location: String::new(),
                ai_relevance_score: 0.9,
                hiring_signal: false,
                profile: json!({}),
            };
            db.upsert(&Contact::discovered(raw, now)).unwrap();
        }
        let config = ReachClawConfig::default();
        let offline = Arc::new(Offline);
        let pipeline = Arc::new(Pipeline::new(db, &config, offline.clone(), offline));
        Arc::new(AppState::new(config.gateway.clone(), pipeline))
    }

    fn actor(name: &str) -> Json<ActorBody> {
        Json(ActorBody {
            actor: Some(name.into()),
            reason: Some("asked by email".into()),
        })
    }

    // ---- Health & Info ----

    #[tokio::test]
    async fn test_health_check() {
        let json = health_check().await.0;
        assert_eq!(json["status"], "ok");
    }

    #[tokio::test]
    async fn test_system_info() {
        let json = system_info(State(test_state())).await.0;
        assert_eq!(json["name"], "ReachClaw");
        assert_eq!(json["duplicate_policy"], "replace");
        assert!(json["uptime_secs"].is_number());
    }

    #[tokio::test]
    async fn test_metrics() {
        let (status, Json(json)) = metrics(State(test_state())).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["metrics"]["total_contacts"], 3);
        assert_eq!(json["metrics"]["contacts_by_state"]["discovered"], 3);
    }

    // ---- Contacts ----

    #[tokio::test]
    async fn test_list_contacts_filters() {
        let state = test_state();
        let (_, Json(all)) = list_contacts(State(state.clone()), Query(ContactQuery::default())).await;
        assert_eq!(all["count"], 3);

        let query = ContactQuery {
            organization: Some("Acme AI".into()),
            state: Some("discovered".into()),
            ..Default::default()
        };
        let (_, Json(acme)) = list_contacts(State(state.clone()), Query(query)).await;
        assert_eq!(acme["count"], 2);

        let query = ContactQuery {
            state: Some("asleep".into()),
            ..Default::default()
        };
        let (status, _) = list_contacts(State(state), Query(query)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_get_contact_not_found() {
        let (status, Json(json)) = get_contact(State(test_state()), Path("nobody".into())).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(json["ok"], false);
    }

    #[tokio::test]
    async fn test_override_with_bypass_is_audited() {
        let state = test_state();
        let body = OverrideBody {
            target: "connected".into(),
            who: ActorBody {
                actor: Some("dana".into()),
                reason: Some("accepted in person".into()),
            },
            bypass_quota: true,
        };
        let (status, Json(json)) = override_contact(State(state.clone()), Path("ada".into()), Json(body)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["contact"]["state"], "connected");

        let (_, Json(detail)) = get_contact(State(state.clone()), Path("ada".into())).await;
        assert_eq!(detail["items"][0]["kind"], "follow_up");
        assert_eq!(detail["audit"][0]["actor"], "dana");
        assert_eq!(detail["audit"][0]["action"], "override");

        // Bypass leaves the day's budget untouched.
        let (_, Json(m)) = metrics(State(state)).await;
        assert_eq!(m["metrics"]["quota"][0]["used"], 0);
    }

    #[tokio::test]
    async fn test_override_backwards_is_conflict() {
        let state = test_state();
        let body = |target: &str| OverrideBody {
            target: target.into(),
            who: ActorBody::default(),
            bypass_quota: true,
        };
        let (status, _) = override_contact(State(state.clone()), Path("bob".into()), Json(body("messaged"))).await;
        assert_eq!(status, StatusCode::OK);
        let (status, _) = override_contact(State(state.clone()), Path("bob".into()), Json(body("requested"))).await;
        assert_eq!(status, StatusCode::CONFLICT);
        let (status, _) = override_contact(State(state), Path("bob".into()), Json(body("sideways"))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_opt_out_is_idempotent() {
        let state = test_state();
        for _ in 0..2 {
            let (status, Json(json)) = opt_out_contact(State(state.clone()), Path("cyd".into()), actor("dana")).await;
            assert_eq!(status, StatusCode::OK);
            assert_eq!(json["contact"]["state"], "opted_out");
        }
        let (_, Json(audit)) = list_audit(
            State(state),
            Query(std::collections::HashMap::from([("contact_id".to_string(), "cyd".to_string())])),
        )
        .await;
        assert_eq!(audit["entries"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_release_quarantine() {
        let state = test_state();
        state.pipeline.db().quarantine("bob", "inconsistent timestamps", Utc::now()).unwrap();
        let (status, Json(json)) = release_contact(State(state.clone()), Path("bob".into()), actor("dana")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["contact"]["quarantined"], false);
    }

    #[tokio::test]
    async fn test_operator_change_while_contact_busy_is_conflict() {
        let state = test_state();
        let held = state.pipeline.claims().try_claim("ada").unwrap();
        let (status, Json(json)) = opt_out_contact(State(state.clone()), Path("ada".into()), actor("dana")).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(json["ok"], false);
        let (status, _) = release_contact(State(state.clone()), Path("ada".into()), actor("dana")).await;
        assert_eq!(status, StatusCode::CONFLICT);

        drop(held);
        let (status, Json(json)) = opt_out_contact(State(state), Path("ada".into()), actor("dana")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["contact"]["state"], "opted_out");
    }

    // ---- Content review ----

    #[tokio::test]
    async fn test_post_review_flow() {
        let state = test_state();
        let now = Utc::now();
        let post = state
            .pipeline
            .db()
            .create_post("Draft about agents", "viral_post", now, now + chrono::Duration::hours(2))
            .unwrap();

        let edit = EditPostBody { text: "Edited draft".into() };
        let (status, Json(json)) = edit_post(State(state.clone()), Path(post.id), Json(edit)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["post"]["text"], "Edited draft");

        let (status, Json(json)) = approve_post(State(state.clone()), Path(post.id), actor("dana")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["post"]["status"], "approved");

        // Already approved: a second approval is a conflict.
        let (status, _) = approve_post(State(state.clone()), Path(post.id), actor("dana")).await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (status, Json(json)) = reject_post(State(state.clone()), Path(post.id), actor("dana")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["post"]["status"], "rejected");

        let edit = EditPostBody { text: "Too late".into() };
        let (status, _) = edit_post(State(state.clone()), Path(post.id), Json(edit)).await;
        assert_eq!(status, StatusCode::CONFLICT);

        // One audit row per accepted review; the refused approval left none.
        let audit = state.pipeline.db().list_audit(None, 10).unwrap();
        let actions: Vec<&str> = audit.iter().map(|e| e.action.as_str()).collect();
        assert_eq!(actions, vec!["post_rejected", "post_approved"]);
        assert!(audit.iter().all(|e| e.actor == "dana" && e.contact_id.is_none()));

        let query = PostQuery { status: Some("rejected".into()) };
        let (_, Json(json)) = list_posts(State(state), Query(query)).await;
        assert_eq!(json["posts"].as_array().unwrap().len(), 1);
    }
}
