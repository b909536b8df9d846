use std::time::Duration;

use axum::{
    Router,
    body::{Body, to_bytes},
    http::{Request, StatusCode, header},
};
use serde_json::{Value, json};
use tempfile::TempDir;
use tower::ServiceExt;

use parlor_api::attachments::AttachmentStore;
use parlor_api::middleware::create_token;
use parlor_api::routes::router;
use parlor_api::state::{AppState, AppStateInner};
use parlor_db::Database;
use parlor_gateway::hub::Hub;
use parlor_types::api::Caller;
use parlor_types::models::RoomSettings;

const SECRET: &str = "integration-secret";

const PNG: &[u8] = &[
    0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A, 0x00, 0x00, 0x00, 0x0D, 0x49, 0x48, 0x44, 0x52,
];

async fn setup() -> (TempDir, AppState, Router) {
    let dir = TempDir::new().unwrap();
    let db = Database::open_in_memory().unwrap();
    let attachments = AttachmentStore::new(dir.path().join("attachments"))
        .await
        .unwrap();
    let state = AppStateInner::build(db, Hub::new(), attachments, SECRET.into()).unwrap();
    let app = router(state.clone());
    (dir, state, app)
}

fn token(user_id: i64, admin: bool) -> String {
    let caller = Caller {
        user_id,
        username: format!("user{user_id}"),
        admin,
    };
    create_token(SECRET, &caller, Duration::from_secs(3600)).unwrap()
}

async fn send(app: &Router, req: Request<Body>) -> (StatusCode, Value) {
    let resp = app.clone().oneshot(req).await.unwrap();
    let status = resp.status();
    let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, body)
}

fn get(uri: &str) -> Request<Body> {
    Request::get(uri).body(Body::empty()).unwrap()
}

fn post_json(uri: &str, body: Value, bearer: Option<&str>) -> Request<Body> {
    let mut builder = Request::post(uri).header(header::CONTENT_TYPE, "application/json");
    if let Some(token) = bearer {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
    }
    builder.body(Body::from(body.to_string())).unwrap()
}

fn multipart(uri: &str, file_name: &str, content_type: &str, data: &[u8], bearer: &str) -> Request<Body> {
    let boundary = "parlor-test-boundary";
    let mut body = Vec::new();
    body.extend_from_slice(
        format!(
            "--{boundary}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"{file_name}\"\r\nContent-Type: {content_type}\r\n\r\n"
        )
        .as_bytes(),
    );
    body.extend_from_slice(data);
    body.extend_from_slice(format!("\r\n--{boundary}--\r\n").as_bytes());

    Request::post(uri)
        .header(
            header::CONTENT_TYPE,
            format!("multipart/form-data; boundary={boundary}"),
        )
        .header(header::AUTHORIZATION, format!("Bearer {bearer}"))
        .body(Body::from(body))
        .unwrap()
}

#[tokio::test]
async fn test_public_config() {
    let (_dir, _state, app) = setup().await;

    let (status, body) = send(&app, get("/api/chat/config")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    assert_eq!(body["data"]["enabled"], true);
    assert_eq!(body["data"]["message_limit"], 1000);
    assert_eq!(body["data"]["ws_path"], "/api/chat/ws");
}

#[tokio::test]
async fn test_post_then_paginate() {
    let (_dir, _state, app) = setup().await;
    let user = token(1, false);

    for content in ["one", "two", "three"] {
        let (status, body) = send(
            &app,
            post_json("/api/chat/messages", json!({ "content": content }), Some(&user)),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true, "{body}");
        assert_eq!(body["data"]["username"], "user1");
    }

    let (_, page) = send(&app, get("/api/chat/messages?limit=2")).await;
    let first: Vec<&Value> = page["data"].as_array().unwrap().iter().collect();
    assert_eq!(first.len(), 2);
    assert_eq!(first[0]["content"], "three");
    assert_eq!(first[1]["content"], "two");

    let cursor = first[1]["id"].as_i64().unwrap();
    let (_, page) = send(&app, get(&format!("/api/chat/messages?limit=2&before_id={cursor}"))).await;
    let second = page["data"].as_array().unwrap();
    assert_eq!(second.len(), 1);
    assert_eq!(second[0]["content"], "one");
    assert!(second[0]["id"].as_i64().unwrap() < cursor);

    let (_, count) = send(&app, get("/api/chat/count?room=global")).await;
    assert_eq!(count["data"]["count"], 3);
    assert_eq!(count["data"]["enabled"], true);
}

#[tokio::test]
async fn test_malformed_paging_falls_back_to_defaults() {
    let (_dir, _state, app) = setup().await;
    let user = token(1, false);
    for content in ["one", "two"] {
        send(&app, post_json("/api/chat/messages", json!({ "content": content }), Some(&user))).await;
    }

    for uri in [
        "/api/chat/messages?before_id=",
        "/api/chat/messages?limit=abc",
        "/api/chat/messages?limit=&before_id=x",
        "/api/chat/messages?limit=-1&before_id=0",
    ] {
        let (status, body) = send(&app, get(uri)).await;
        assert_eq!(status, StatusCode::OK, "{uri}");
        assert_eq!(body["success"], true, "{uri}: {body}");
        let page = body["data"].as_array().unwrap();
        assert_eq!(page.len(), 2, "{uri}");
        assert_eq!(page[0]["content"], "two");
    }
}

#[tokio::test]
async fn test_validation_failures_stay_200() {
    let (_dir, state, app) = setup().await;

    let (status, body) = send(&app, post_json("/api/chat/messages", json!({ "content": "  " }), None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], false);
    assert_eq!(body["message"], "message content cannot be empty");

    let (status, body) = send(
        &app,
        Request::post("/api/chat/messages")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from("{not json"))
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], false);

    assert_eq!(state.db.count_messages("global").unwrap(), 0);
}

#[tokio::test]
async fn test_bad_token_is_rejected() {
    let (_dir, _state, app) = setup().await;

    let req = Request::get("/api/chat/config")
        .header(header::AUTHORIZATION, "Bearer not-a-jwt")
        .body(Body::empty())
        .unwrap();
    let (status, _) = send(&app, req).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_upload_is_typed_by_content_and_served() {
    let (_dir, _state, app) = setup().await;
    let user = token(3, false);

    // Declared as text, but the bytes are a PNG.
    let (status, body) = send(
        &app,
        multipart("/api/chat/images", "notes.txt", "text/plain", PNG, &user),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true, "{body}");
    assert_eq!(body["data"]["content_type"], "image/png");
    assert_eq!(body["data"]["bytes"], PNG.len());
    let url = body["data"]["url"].as_str().unwrap().to_string();
    assert!(url.ends_with(".png"));

    let resp = app.clone().oneshot(get(&url)).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(resp.headers()[header::CONTENT_TYPE], "image/png");
    assert_eq!(
        resp.headers()[header::CACHE_CONTROL],
        "public, max-age=31536000, immutable"
    );
    let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    assert_eq!(&bytes[..], PNG);
}

#[tokio::test]
async fn test_text_upload_keeps_original_name() {
    let (_dir, _state, app) = setup().await;
    let user = token(3, false);

    let (_, body) = send(
        &app,
        multipart("/api/chat/files", "log.txt", "text/plain", "hello 世界".as_bytes(), &user),
    )
    .await;
    assert_eq!(body["success"], true, "{body}");
    assert_eq!(body["data"]["content_type"], "text/plain");
    assert_eq!(body["data"]["file_name"], "log.txt");
    assert!(body["data"]["url"].as_str().unwrap().ends_with(".txt"));
}

#[tokio::test]
async fn test_uploads_need_a_user() {
    let (_dir, _state, app) = setup().await;

    let req = Request::post("/api/chat/images")
        .header(header::CONTENT_TYPE, "multipart/form-data; boundary=x")
        .body(Body::from("--x--\r\n"))
        .unwrap();
    let (status, _) = send(&app, req).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_image_gate() {
    let (_dir, state, app) = setup().await;
    state
        .settings
        .replace(
            &state.db,
            RoomSettings {
                image_enabled: false,
                ..Default::default()
            },
        )
        .unwrap();

    let (status, body) = send(
        &app,
        multipart("/api/chat/images", "a.png", "image/png", PNG, &token(3, false)),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], false);
    assert_eq!(body["message"], "image uploads are disabled");
}

#[tokio::test]
async fn test_attachment_traversal_and_missing() {
    let (dir, _state, app) = setup().await;
    std::fs::write(dir.path().join("secret.txt"), "top secret").unwrap();

    let (status, _) = send(&app, get("/api/chat/images/../secret.txt")).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, _) = send(&app, get("/api/chat/images/%2E%2E/secret.txt")).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, _) = send(&app, get("/api/chat/images/20240101/nothing.png")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_hotlink_policy() {
    let (_dir, state, app) = setup().await;
    let (_, body) = send(
        &app,
        multipart("/api/chat/images", "a.png", "image/png", PNG, &token(3, false)),
    )
    .await;
    let url = body["data"]["url"].as_str().unwrap().to_string();

    state
        .settings
        .replace(
            &state.db,
            RoomSettings {
                anti_hotlink_enabled: true,
                allowed_referers: vec!["partner.example".into()],
                ..Default::default()
            },
        )
        .unwrap();

    let fetch = |referer: Option<&'static str>| {
        let mut builder = Request::get(&url).header(header::HOST, "chat.example");
        if let Some(referer) = referer {
            builder = builder.header(header::REFERER, referer);
        }
        builder.body(Body::empty()).unwrap()
    };

    let (status, _) = send(&app, fetch(Some("https://evil.example/page"))).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    let resp = app.clone().oneshot(fetch(Some("https://chat.example/room"))).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let resp = app.clone().oneshot(fetch(Some("https://www.partner.example/"))).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let resp = app.clone().oneshot(fetch(None)).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_admin_routes() {
    let (_dir, state, app) = setup().await;
    let mut reg = state.hub.register(8);

    let req = Request::get("/api/chat/setting")
        .header(header::AUTHORIZATION, format!("Bearer {}", token(1, false)))
        .body(Body::empty())
        .unwrap();
    let (status, _) = send(&app, req).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, _) = send(&app, get("/api/chat/setting")).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let admin = token(2, true);
    let (status, body) = send(
        &app,
        post_json("/api/chat/announcement", json!({ "announcement": "maintenance at 5" }), Some(&admin)),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["announcement"], "maintenance at 5");

    let pushed: Value = serde_json::from_str(reg.outbound.try_recv().unwrap().as_str()).unwrap();
    assert_eq!(pushed["type"], "announcement");
    assert_eq!(pushed["data"]["announcement"], "maintenance at 5");

    let mut next = state.settings.current();
    next.message_limit = 10;
    let req = Request::put("/api/chat/setting")
        .header(header::CONTENT_TYPE, "application/json")
        .header(header::AUTHORIZATION, format!("Bearer {admin}"))
        .body(Body::from(serde_json::to_vec(&next).unwrap()))
        .unwrap();
    let (_, body) = send(&app, req).await;
    assert_eq!(body["data"]["message_limit"], 10);
    // Announcement unchanged, so nothing new is pushed.
    assert!(reg.outbound.try_recv().is_err());

    let (_, config) = send(&app, get("/api/chat/config")).await;
    assert_eq!(config["data"]["message_limit"], 10);
    assert_eq!(config["data"]["announcement"], "maintenance at 5");
}

#[tokio::test]
async fn test_disabled_room() {
    let (_dir, state, app) = setup().await;
    state
        .settings
        .replace(
            &state.db,
            RoomSettings {
                enabled: false,
                ..Default::default()
            },
        )
        .unwrap();

    let (status, body) = send(&app, get("/api/chat/ws?room=global")).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["success"], false);

    let (_, body) = send(&app, get("/api/chat/count")).await;
    assert_eq!(body["data"]["count"], 0);
    assert_eq!(body["data"]["enabled"], false);

    let (_, body) = send(&app, get("/api/chat/messages")).await;
    assert_eq!(body["success"], false);
    assert_eq!(body["message"], "chat room is closed");
}
