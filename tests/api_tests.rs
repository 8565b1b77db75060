//! API integration tests

use axum::body::Body;
use axum::Router;
use huddle::config::Config;
use huddle::models::{MessageType, NewMessage, Sender};
use huddle::store::{self, Store, Transcript};
use huddle::{router, AppState};
use sqlx::sqlite::SqlitePoolOptions;
use tower::ServiceExt;

async fn setup_app() -> (Router, Store) {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("Failed to create in-memory database");

    store::run_migrations(&pool)
        .await
        .expect("Failed to run migrations");

    let state = AppState::new(pool, &Config::default());
    let store = state.store.clone();

    (router(state), store)
}

fn message(room: &str, content: &str, flagged: bool) -> NewMessage {
    NewMessage {
        issue_id: room.to_string(),
        sender: Sender {
            id: "u1".to_string(),
            name: "Alice".to_string(),
            avatar: None,
        },
        content: content.to_string(),
        message_type: MessageType::Text,
        attachments: vec![],
        metadata: None,
        flagged,
        flag_reason: flagged.then(|| "Forbidden term: seed phrase".to_string()),
    }
}

async fn get_json(app: Router, uri: &str) -> (hyper::StatusCode, serde_json::Value) {
    let response = app
        .oneshot(
            hyper::Request::builder()
                .uri(uri)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let json = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
    (status, json)
}

#[tokio::test]
async fn test_health_endpoint() {
    let (app, _store) = setup_app().await;

    let response = app
        .oneshot(
            hyper::Request::builder()
                .uri("/health")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), hyper::StatusCode::OK);
}

#[tokio::test]
async fn test_room_history_excludes_flagged() {
    let (app, store) = setup_app().await;
    store.persist_message(message("issue-42", "first", false)).await.unwrap();
    store.persist_message(message("issue-42", "my seed phrase", true)).await.unwrap();
    store.persist_message(message("issue-42", "second", false)).await.unwrap();
    store.persist_message(message("issue-7", "elsewhere", false)).await.unwrap();

    let (status, json) = get_json(app, "/rooms/issue-42/messages").await;
    assert_eq!(status, hyper::StatusCode::OK);

    let messages = json.as_array().unwrap();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0]["content"], "first");
    assert_eq!(messages[1]["content"], "second");
    assert_eq!(messages[0]["type"], "TEXT");
    assert!(messages[0]["_id"].is_string());
}

#[tokio::test]
async fn test_room_history_include_flagged() {
    let (app, store) = setup_app().await;
    store.persist_message(message("issue-42", "ok", false)).await.unwrap();
    store.persist_message(message("issue-42", "my seed phrase", true)).await.unwrap();

    let (status, json) = get_json(app, "/rooms/issue-42/messages?includeFlagged=true").await;
    assert_eq!(status, hyper::StatusCode::OK);

    let messages = json.as_array().unwrap();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[1]["flagged"], true);
    assert_eq!(messages[1]["flagReason"], "Forbidden term: seed phrase");
}

#[tokio::test]
async fn test_room_history_empty_room() {
    let (app, _store) = setup_app().await;

    let (status, json) = get_json(app, "/rooms/nobody-here/messages").await;
    assert_eq!(status, hyper::StatusCode::OK);
    assert!(json.as_array().unwrap().is_empty());
}

#[tokio::test]
async fn test_websocket_requires_upgrade() {
    let (app, _store) = setup_app().await;

    let response = app
        .oneshot(
            hyper::Request::builder()
                .uri("/ws?userId=u1")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert!(response.status().is_client_error());
}

#[tokio::test]
async fn test_app_state_new() {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap();

    let state = AppState::new(pool, &Config::default());
    assert_eq!(state.hub.registry.room_count().await, 0);
    assert_eq!(state.hub.registry.connection_count().await, 0);
}
