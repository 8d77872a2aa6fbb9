use std::{collections::HashMap, time::Duration};

use axum::{
    Json, Router,
    extract::{Path, Query},
    http::{StatusCode, header},
    response::IntoResponse,
    routing::{delete, get, post},
};
use chat_core::{ChatErrorCategory, ExportFormat, ExportedTranscript, MessageRole};
use chat_remote::{RestClient, RestClientConfig};
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

const SESSION: &str = "9b2d4f6a-1c3e-4a5b-8d7f-0e1a2b3c4d5e";

async fn serve(router: Router) -> String {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("listener should bind");
    let addr = listener.local_addr().expect("listener address");
    tokio::spawn(async move {
        axum::serve(listener, router).await.expect("mock server");
    });
    format!("http://{addr}")
}

fn client(base: String) -> RestClient {
    RestClient::new(RestClientConfig::new(base)).expect("client should build")
}

fn backend() -> Router {
    Router::new()
        .route(
            "/api/session/create",
            post(|| async { Json(json!({ "sessionId": SESSION })) }),
        )
        .route(
            "/api/session/{id}",
            delete(|Path(id): Path<String>| async move {
                Json(json!({ "success": true, "sessionId": id }))
            }),
        )
        .route(
            "/api/session/{id}/stats",
            get(|| async { Json(json!({ "messageCount": 4, "tokensUsed": 812 })) }),
        )
        .route(
            "/api/session/{id}/export",
            get(|Query(query): Query<HashMap<String, String>>| async move {
                match query.get("format").map(String::as_str) {
                    Some("csv") => (
                        [(header::CONTENT_TYPE, "text/csv")],
                        "timestamp,type,content,sources\n".to_owned(),
                    )
                        .into_response(),
                    _ => Json(json!({ "messages": [] })).into_response(),
                }
            }),
        )
        .route(
            "/api/chat/send",
            post(|Json(body): Json<Value>| async move {
                let message = body["message"].as_str().unwrap_or_default().to_owned();
                assert_eq!(body["sessionId"], SESSION);
                Json(json!({
                    "answer": format!("You asked: {message}"),
                    "sources": [{
                        "title": "Rates hold",
                        "url": "https://news.example.com/rates",
                        "outlet": "Example Wire",
                        "relevanceScore": 0.92,
                        "snippet": "The central bank held rates."
                    }],
                    "metadata": { "model": "test" }
                }))
            }),
        )
        .route(
            "/api/chat/history/{id}",
            get(
                |Path(id): Path<String>, Query(query): Query<HashMap<String, String>>| async move {
                    if !query.contains_key("_t") {
                        return (StatusCode::BAD_REQUEST, Json(json!({ "error": "missing _t" })))
                            .into_response();
                    }
                    Json(json!({
                        "sessionId": id,
                        "messages": [
                            { "id": "m1", "type": "user", "content": "hi", "timestamp": 1_700_000_000_000_i64 },
                            { "id": "m2", "type": "bot", "content": "hello", "timestamp": "2023-11-14T22:13:21Z" }
                        ]
                    }))
                    .into_response()
                },
            ),
        )
        .route(
            "/health",
            get(|| async {
                Json(json!({ "status": "healthy", "services": { "vectorStore": "ok" } }))
            }),
        )
}

#[tokio::test]
async fn creates_session_and_sends_message() {
    let client = client(serve(backend()).await);

    let session_id = client.create_session().await.expect("session should be created");
    assert_eq!(session_id, SESSION);

    let reply = client
        .send_message(&session_id, "rates?", CancellationToken::new())
        .await
        .expect("send should succeed");
    assert_eq!(reply.answer.as_deref(), Some("You asked: rates?"));
    assert_eq!(reply.sources.len(), 1);
    assert_eq!(reply.sources[0].relevance_percent(), 92);
}

#[tokio::test]
async fn fetches_history_with_mixed_timestamps() {
    let client = client(serve(backend()).await);

    let messages = client
        .fetch_history(SESSION)
        .await
        .expect("history should load");
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0].role, MessageRole::User);
    assert_eq!(messages[0].timestamp.timestamp_millis(), 1_700_000_000_000);
    assert_eq!(messages[1].id, "m2");
}

#[tokio::test]
async fn session_maintenance_endpoints() {
    let client = client(serve(backend()).await);

    client
        .clear_session(SESSION)
        .await
        .expect("clear should succeed");
    let stats = client
        .session_stats(SESSION)
        .await
        .expect("stats should load");
    assert_eq!(stats.counters.get("tokensUsed"), Some(&json!(812)));

    let csv = client
        .export_session(SESSION, ExportFormat::Csv)
        .await
        .expect("csv export");
    assert_eq!(
        csv,
        ExportedTranscript::Text("timestamp,type,content,sources\n".to_owned())
    );
    let doc = client
        .export_session(SESSION, ExportFormat::Json)
        .await
        .expect("json export");
    assert!(matches!(doc, ExportedTranscript::Json(_)));

    let report = client.test_connection().await;
    assert!(report.success);
    assert_eq!(report.status.as_deref(), Some("healthy"));
}

#[tokio::test]
async fn rate_limit_carries_retry_after_and_body_message() {
    let router = Router::new().route(
        "/api/chat/send",
        post(|| async {
            (
                StatusCode::TOO_MANY_REQUESTS,
                [(header::RETRY_AFTER, "3")],
                Json(json!({ "error": "Too many requests from this client" })),
            )
        }),
    );
    let client = client(serve(router).await);

    let err = client
        .send_message(SESSION, "again", CancellationToken::new())
        .await
        .expect_err("429 should fail");
    assert_eq!(err.category, ChatErrorCategory::RateLimited);
    assert_eq!(err.status, Some(429));
    assert_eq!(err.retry_after_ms, Some(3_000));
    assert_eq!(err.message, "Too many requests from this client");
    assert_eq!(err.user_message(), "Too many requests. Please slow down.");
}

#[tokio::test]
async fn server_errors_and_missing_sessions_are_classified() {
    let router = Router::new()
        .route(
            "/api/chat/history/{id}",
            get(|| async { StatusCode::INTERNAL_SERVER_ERROR }),
        )
        .route(
            "/api/session/{id}",
            get(|| async { (StatusCode::NOT_FOUND, Json(json!({ "error": "Session not found" }))) }),
        );
    let client = client(serve(router).await);

    let err = client
        .fetch_history(SESSION)
        .await
        .expect_err("500 should fail");
    assert_eq!(err.category, ChatErrorCategory::Server);
    assert_eq!(err.code, "http_500");

    let validation = client.validate_session(SESSION).await;
    assert!(!validation.valid);
    assert_eq!(validation.error.as_deref(), Some("Session not found"));
}

#[tokio::test]
async fn cancelling_a_slow_send_resolves_promptly() {
    let router = Router::new().route(
        "/api/chat/send",
        post(|| async {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Json(json!({ "answer": "too late" }))
        }),
    );
    let client = client(serve(router).await);
    let cancel = CancellationToken::new();

    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });

    let err = tokio::time::timeout(
        Duration::from_secs(5),
        client.send_message(SESSION, "slow", cancel),
    )
    .await
    .expect("cancellation should not wait for the server")
    .expect_err("cancelled send should fail");
    assert!(err.is_cancelled());
}

#[tokio::test]
async fn unreachable_backend_is_a_network_error() {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("listener should bind");
    let addr = listener.local_addr().expect("listener address");
    drop(listener);

    let client = client(format!("http://{addr}"));
    let err = client
        .create_session()
        .await
        .expect_err("closed port should fail");
    assert_eq!(err.category, ChatErrorCategory::Network);
    assert_eq!(
        err.user_message(),
        "Network error. Please check your connection."
    );

    let report = client.test_connection().await;
    assert!(!report.success);
}
