use std::sync::{Arc, Mutex};

use anyhow::Context;
use axum::{
    body::{to_bytes, Body},
    http::{header, Method, Request, StatusCode},
    Router,
};
use futures_util::future::BoxFuture;
use parley_core::files::LocalFileStore;
use parley_core::mail::{InviteEmail, Mailer};
use parley_core::{AppConfig, AppState, CoreError};
use serde_json::{json, Value};
use tempfile::TempDir;
use tower::ServiceExt;

#[derive(Default)]
struct Outbox {
    sent: Mutex<Vec<InviteEmail>>,
}

impl Mailer for Outbox {
    fn send_invite<'a>(&'a self, email: &'a InviteEmail) -> BoxFuture<'a, Result<(), CoreError>> {
        self.sent.lock().unwrap().push(email.clone());
        Box::pin(async { Ok(()) })
    }
}

struct TestContext {
    app: Router,
    outbox: Arc<Outbox>,
    _storage_dir: TempDir,
}

impl TestContext {
    async fn new() -> anyhow::Result<Self> {
        let db = parley_db::create_pool("sqlite::memory:", 1).await?;
        parley_db::run_migrations(&db).await?;
        let storage_dir = tempfile::tempdir()?;
        let outbox = Arc::new(Outbox::default());
        let state = AppState::new(
            db,
            AppConfig {
                jwt_secret: "integration-test-secret".to_string(),
                public_url: Some("https://chat.example.com".to_string()),
                ..AppConfig::default()
            },
            outbox.clone(),
            Arc::new(LocalFileStore::new(storage_dir.path(), "/files")),
        );
        let app = parley_api::build_router().with_state(state);
        Ok(Self {
            app,
            outbox,
            _storage_dir: storage_dir,
        })
    }

    async fn request_json(
        &self,
        method: Method,
        path: &str,
        token: Option<&str>,
        body: Option<Value>,
    ) -> anyhow::Result<(StatusCode, Value)> {
        let mut builder = Request::builder().method(method).uri(path);
        if let Some(token) = token {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
        }
        let request = if let Some(payload) = body {
            builder = builder.header(header::CONTENT_TYPE, "application/json");
            builder.body(Body::from(payload.to_string()))?
        } else {
            builder.body(Body::empty())?
        };

        let response = self.app.clone().oneshot(request).await?;
        let status = response.status();
        let body_bytes = to_bytes(response.into_body(), usize::MAX).await?;
        let payload = if body_bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&body_bytes)
                .unwrap_or_else(|_| json!({ "raw": String::from_utf8_lossy(&body_bytes) }))
        };
        Ok((status, payload))
    }

    /// Register a user and return (id, token).
    async fn register(&self, name: &str) -> anyhow::Result<(String, String)> {
        let (status, payload) = self
            .request_json(
                Method::POST,
                "/api/users/register",
                None,
                Some(json!({
                    "username": name,
                    "email": format!("{name}@example.com"),
                    "password": "correct-horse-battery",
                })),
            )
            .await?;
        assert_eq!(status, StatusCode::CREATED, "{payload}");
        let id = payload["user"]["id"].as_str().context("user id should be a string")?;
        let token = payload["token"].as_str().context("token should be a string")?;
        Ok((id.to_string(), token.to_string()))
    }

    async fn create_group(&self, token: &str, name: &str, room_type: &str) -> anyhow::Result<String> {
        let (status, payload) = self
            .request_json(
                Method::POST,
                "/api/groups",
                Some(token),
                Some(json!({ "name": name, "type": room_type })),
            )
            .await?;
        assert_eq!(status, StatusCode::CREATED, "{payload}");
        Ok(payload["id"].as_str().context("room id should be a string")?.to_string())
    }
}

#[tokio::test]
async fn health_is_public() -> anyhow::Result<()> {
    let ctx = TestContext::new().await?;
    let (status, payload) = ctx.request_json(Method::GET, "/api/health", None, None).await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(payload["status"], "ok");
    Ok(())
}

#[tokio::test]
async fn register_login_and_profile() -> anyhow::Result<()> {
    let ctx = TestContext::new().await?;
    let (id, _) = ctx.register("alice").await?;

    let (status, payload) = ctx
        .request_json(
            Method::POST,
            "/api/users/login",
            None,
            Some(json!({ "email": "alice@example.com", "password": "correct-horse-battery" })),
        )
        .await?;
    assert_eq!(status, StatusCode::OK);
    let token = payload["token"].as_str().context("token")?.to_string();

    let (status, me) = ctx.request_json(Method::GET, "/api/users/@me", Some(&token), None).await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(me["id"], id.as_str());
    assert_eq!(me["email"], "alice@example.com");

    let (status, me) = ctx
        .request_json(
            Method::PATCH,
            "/api/users/@me",
            Some(&token),
            Some(json!({ "preferences": { "theme": "dark" } })),
        )
        .await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(me["preferences"]["theme"], "dark");

    let (status, payload) = ctx
        .request_json(
            Method::POST,
            "/api/users/login",
            None,
            Some(json!({ "username": "alice", "password": "wrong-password" })),
        )
        .await?;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(payload["code"], "authentication");
    Ok(())
}

#[tokio::test]
async fn missing_or_bad_tokens_are_unauthorized() -> anyhow::Result<()> {
    let ctx = TestContext::new().await?;
    let (status, payload) = ctx.request_json(Method::GET, "/api/groups", None, None).await?;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(payload["code"], "authentication");

    let (status, _) = ctx.request_json(Method::GET, "/api/groups", Some("garbage"), None).await?;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    Ok(())
}

#[tokio::test]
async fn duplicate_registration_conflicts() -> anyhow::Result<()> {
    let ctx = TestContext::new().await?;
    ctx.register("alice").await?;
    let (status, payload) = ctx
        .request_json(
            Method::POST,
            "/api/users/register",
            None,
            Some(json!({
                "username": "alice2",
                "email": "alice@example.com",
                "password": "correct-horse-battery",
            })),
        )
        .await?;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(payload["code"], "conflict");
    Ok(())
}

#[tokio::test]
async fn group_lifecycle_with_roles() -> anyhow::Result<()> {
    let ctx = TestContext::new().await?;
    let (_, owner) = ctx.register("owner").await?;
    let (bob_id, bob) = ctx.register("bob").await?;
    let room_id = ctx.create_group(&owner, "lobby", "public").await?;

    // Public rooms can be joined without an invite.
    let (status, snapshot) = ctx
        .request_json(Method::POST, &format!("/api/groups/{room_id}/join"), Some(&bob), None)
        .await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(snapshot["members"].as_array().context("members")?.len(), 2);

    // Members cannot change settings.
    let (status, payload) = ctx
        .request_json(
            Method::PATCH,
            &format!("/api/groups/{room_id}/settings"),
            Some(&bob),
            Some(json!({ "allowReactions": false })),
        )
        .await?;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(payload["code"], "authorization");

    let (status, member) = ctx
        .request_json(
            Method::PATCH,
            &format!("/api/groups/{room_id}/members/{bob_id}"),
            Some(&owner),
            Some(json!({ "role": "admin" })),
        )
        .await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(member["role"], "admin");

    // Nobody can hand out ownership.
    let (status, _) = ctx
        .request_json(
            Method::PATCH,
            &format!("/api/groups/{room_id}/members/{bob_id}"),
            Some(&owner),
            Some(json!({ "role": "owner" })),
        )
        .await?;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, channel) = ctx
        .request_json(
            Method::POST,
            &format!("/api/groups/{room_id}/channels"),
            Some(&bob),
            Some(json!({ "name": "random" })),
        )
        .await?;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(channel["name"], "random");

    // The owner cannot walk out of their own room.
    let (status, _) = ctx
        .request_json(Method::POST, &format!("/api/groups/{room_id}/leave"), Some(&owner), None)
        .await?;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, _) = ctx
        .request_json(Method::DELETE, &format!("/api/groups/{room_id}"), Some(&owner), None)
        .await?;
    assert_eq!(status, StatusCode::NO_CONTENT);
    let (status, payload) = ctx
        .request_json(Method::GET, &format!("/api/groups/{room_id}"), Some(&owner), None)
        .await?;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(payload["code"], "not_found");
    Ok(())
}

#[tokio::test]
async fn invites_are_mailed_and_accepted_once() -> anyhow::Result<()> {
    let ctx = TestContext::new().await?;
    let (_, owner) = ctx.register("owner").await?;
    let (_, carol) = ctx.register("carol").await?;
    let room_id = ctx.create_group(&owner, "staff", "private").await?;

    let (status, _) = ctx
        .request_json(Method::POST, &format!("/api/groups/{room_id}/join"), Some(&carol), None)
        .await?;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, receipt) = ctx
        .request_json(
            Method::POST,
            &format!("/api/groups/{room_id}/invites"),
            Some(&owner),
            Some(json!({ "email": "carol@example.com" })),
        )
        .await?;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(receipt["role"], "member");
    assert!(receipt.get("token").is_none());

    let email = ctx.outbox.sent.lock().unwrap().last().cloned().context("invite mailed")?;
    assert_eq!(email.to, "carol@example.com");
    assert_eq!(
        email.accept_url.as_deref(),
        Some(format!("https://chat.example.com/invite/{}", email.token).as_str())
    );

    let accept = format!("/api/groups/invites/{}/accept", email.token);
    let (status, snapshot) = ctx.request_json(Method::POST, &accept, Some(&carol), None).await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(snapshot["room"]["id"], room_id.as_str());

    // Single-use by default.
    let (status, _) = ctx.request_json(Method::POST, &accept, Some(&carol), None).await?;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, payload) = ctx
        .request_json(
            Method::POST,
            &format!("/api/groups/{room_id}/invites"),
            Some(&owner),
            Some(json!({ "email": "carol@example.com" })),
        )
        .await?;
    assert_eq!(status, StatusCode::CONFLICT, "{payload}");
    Ok(())
}

#[tokio::test]
async fn history_requires_membership() -> anyhow::Result<()> {
    let ctx = TestContext::new().await?;
    let (_, owner) = ctx.register("owner").await?;
    let (_, eve) = ctx.register("eve").await?;
    let room_id = ctx.create_group(&owner, "staff", "private").await?;

    let (status, page) = ctx
        .request_json(
            Method::GET,
            &format!("/api/groups/{room_id}/messages?limit=10"),
            Some(&owner),
            None,
        )
        .await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(page["items"], json!([]));
    assert_eq!(page["hasMore"], false);

    let (status, _) = ctx
        .request_json(Method::GET, &format!("/api/groups/{room_id}/messages"), Some(&eve), None)
        .await?;
    assert_eq!(status, StatusCode::FORBIDDEN);
    Ok(())
}

#[tokio::test]
async fn encryption_bundles_are_published() -> anyhow::Result<()> {
    let ctx = TestContext::new().await?;
    let (alice_id, alice) = ctx.register("alice").await?;
    let (_, bob) = ctx.register("bob").await?;

    let (status, bundle) = ctx
        .request_json(Method::POST, "/api/users/@me/encryption", Some(&alice), None)
        .await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(bundle["userId"], alice_id.as_str());

    let (status, fetched) = ctx
        .request_json(
            Method::GET,
            &format!("/api/users/{alice_id}/prekey-bundle"),
            Some(&bob),
            None,
        )
        .await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(fetched["identityKey"], bundle["identityKey"]);

    let (status, _) = ctx
        .request_json(Method::GET, "/api/users/424242/prekey-bundle", Some(&bob), None)
        .await?;
    assert_eq!(status, StatusCode::NOT_FOUND);
    Ok(())
}
