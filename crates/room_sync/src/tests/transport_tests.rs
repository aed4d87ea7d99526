use super::*;

use axum::{
    extract::{Path, Query},
    http::{HeaderMap, StatusCode},
    routing::get,
    Json, Router,
};
use serde::Deserialize;
use shared::domain::{MessageId, UserId};
use tokio::net::TcpListener;

#[derive(Debug, Deserialize)]
struct PageParams {
    page: u32,
    page_size: u32,
}

fn authorized(headers: &HeaderMap) -> bool {
    headers
        .get("authorization")
        .and_then(|value| value.to_str().ok())
        == Some("Bearer good-token")
}

fn record(room: &str, id: &str, content: &str) -> serde_json::Value {
    serde_json::json!({
        "id": id,
        "roomId": room,
        "senderId": "u-1",
        "content": content,
        "createdAt": "2024-03-01T09:00:00Z",
    })
}

async fn list_messages(
    Path(room): Path<String>,
    Query(params): Query<PageParams>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, (StatusCode, String)> {
    if !authorized(&headers) {
        return Err((StatusCode::UNAUTHORIZED, "token expired".into()));
    }
    if room == "broken" {
        return Ok(Json(serde_json::json!([{ "id": "x" }])));
    }
    if room == "flaky" {
        return Err((StatusCode::SERVICE_UNAVAILABLE, String::new()));
    }
    let body = (0..params.page_size.min(3))
        .map(|i| record(&room, &format!("p{}-{i}", params.page), "older"))
        .collect::<Vec<_>>();
    Ok(Json(serde_json::Value::Array(body)))
}

#[derive(Debug, Deserialize)]
struct SendBody {
    content: String,
}

async fn send_message(
    Path(room): Path<String>,
    headers: HeaderMap,
    Json(body): Json<SendBody>,
) -> Result<Json<serde_json::Value>, (StatusCode, String)> {
    if !authorized(&headers) {
        return Err((StatusCode::UNAUTHORIZED, String::new()));
    }
    Ok(Json(record(&room, "srv-1", &body.content)))
}

async fn spawn_backend() -> anyhow::Result<SyncConfig> {
    std::env::set_var("NO_PROXY", "127.0.0.1,localhost");
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let app = Router::new().route(
        "/api/backend/rooms/:room/messages",
        get(list_messages).post(send_message),
    );
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    Ok(SyncConfig::default().with_api_base_url(format!("http://{addr}")))
}

#[tokio::test]
async fn fetches_page_with_bearer_and_paging_query() {
    let config = spawn_backend().await.expect("spawn backend");
    let backend = HttpBackend::new(&config);

    let page = backend
        .fetch_page("good-token", &RoomId::from("lobby"), 2, 20)
        .await
        .expect("page");

    assert_eq!(page.len(), 3);
    assert_eq!(page[0].id, MessageId::from("p2-0"));
    assert_eq!(page[0].room_id, RoomId::from("lobby"));
}

#[tokio::test]
async fn unauthorized_history_is_auth_rejected() {
    let config = spawn_backend().await.expect("spawn backend");
    let backend = HttpBackend::new(&config);

    let err = backend
        .fetch_page("stale-token", &RoomId::from("lobby"), 1, 20)
        .await
        .expect_err("must be rejected");

    assert!(err.is_auth_rejected(), "unexpected error: {err}");
}

#[tokio::test]
async fn server_failure_is_transient() {
    let config = spawn_backend().await.expect("spawn backend");
    let backend = HttpBackend::new(&config);

    let err = backend
        .fetch_page("good-token", &RoomId::from("flaky"), 1, 20)
        .await
        .expect_err("must fail");

    match err {
        SyncError::Transient(message) => {
            assert!(message.contains("Request failed with status 503"), "{message}")
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn undecodable_page_is_malformed_payload() {
    let config = spawn_backend().await.expect("spawn backend");
    let backend = HttpBackend::new(&config);

    let err = backend
        .fetch_page("good-token", &RoomId::from("broken"), 1, 20)
        .await
        .expect_err("must fail");

    assert!(matches!(err, SyncError::MalformedPayload(_)), "{err:?}");
}

#[tokio::test]
async fn send_returns_confirmed_record() {
    let config = spawn_backend().await.expect("spawn backend");
    let backend = HttpBackend::new(&config);

    let confirmed = backend
        .send_message("good-token", &RoomId::from("lobby"), "hello")
        .await
        .expect("send");

    assert_eq!(confirmed.id, MessageId::from("srv-1"));
    assert_eq!(confirmed.content, "hello");
    assert_eq!(confirmed.sender_id, UserId::from("u-1"));
    assert!(!confirmed.pending);

    let err = backend
        .send_message("bad-token", &RoomId::from("lobby"), "hello")
        .await
        .expect_err("must be rejected");
    assert!(err.is_auth_rejected());
}
