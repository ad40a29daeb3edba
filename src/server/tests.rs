use std::time::Duration;

use axum::{
    body::{to_bytes, Body},
    http::{self, Request, StatusCode},
    response::IntoResponse,
    routing::post,
    Json, Router,
};
use serde_json::{json, Value};
use tower::util::ServiceExt;

use crate::{
    agent::{Agent, UsageSink, APOLOGY},
    chat::LlmClient,
    checkpoint::Checkpoints,
    conf::{ConfJwt, ConfLlm},
    data::Storage,
};

use super::{router, AppState};

const MAX_BODY_SIZE: usize = 1024 * 1024; // 1MB limit

/// Stands in for the chat-completions upstream. Speaks just enough of the
/// protocol for the client: a fixed reply, usage metadata, an SSE stream.
async fn spawn_stub_llm() -> String {
    let app = Router::new().route(
        "/chat/completions",
        post(|Json(req): Json<Value>| async move {
            if req["stream"].as_bool().unwrap_or(false) {
                (
                    [(http::header::CONTENT_TYPE, "text/event-stream")],
                    concat!(
                        "data: {\"model\":\"stub-model\",\"choices\":\
                         [{\"delta\":{\"content\":\"Hello\"}}]}\n\n",
                        "data: {\"model\":\"stub-model\",\"choices\":\
                         [{\"delta\":{\"content\":\" there\"}}]}\n\n",
                        "data: {\"model\":\"stub-model\",\"choices\":[],\
                         \"usage\":{\"prompt_tokens\":12,\
                         \"completion_tokens\":4,\"total_tokens\":16}}\n\n",
                        "data: [DONE]\n\n",
                    ),
                )
                    .into_response()
            } else {
                Json(json!({
                    "model": "stub-model",
                    "choices": [{
                        "message": {
                            "role": "assistant",
                            "content": "Hello there",
                        },
                    }],
                    "usage": {
                        "prompt_tokens": 12,
                        "completion_tokens": 4,
                        "total_tokens": 16,
                    },
                }))
                .into_response()
            }
        }),
    );
    let listener =
        tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

struct TestApp {
    app: Router,
    state: AppState,
    _dir: tempfile::TempDir,
}

fn llm_conf(base_url: String) -> ConfLlm {
    ConfLlm {
        base_url,
        api_key: "test-key".to_string(),
        model: "stub-model".to_string(),
        system_prompt: "You are a test assistant.".to_string(),
        request_timeout: 5.0,
    }
}

async fn test_app_with(base_url: String) -> TestApp {
    let dir = tempfile::tempdir().unwrap();
    let storage = Storage::connect_at(
        dir.path().join("data.db"),
        Duration::from_secs(5),
    )
    .await
    .unwrap();
    let llm = LlmClient::new(&llm_conf(base_url)).unwrap();
    let checkpoints = Checkpoints::new(&storage);
    let usage = UsageSink::spawn(storage.clone(), 64);
    let agent = Agent::new(
        llm,
        checkpoints,
        usage,
        "You are a test assistant.".to_string(),
    );
    let state = AppState {
        storage,
        agent,
        jwt: ConfJwt {
            secret: "test-secret".to_string(),
            audience: "test".to_string(),
            issuer: "test".to_string(),
        },
        token_ttl: Duration::from_secs(300),
        bcrypt_cost: 4,
    };
    TestApp {
        app: router(state.clone()),
        state,
        _dir: dir,
    }
}

async fn test_app() -> TestApp {
    let base_url = spawn_stub_llm().await;
    test_app_with(base_url).await
}

fn req(
    method: http::Method,
    uri: &str,
    token: Option<&str>,
    body: Option<&Value>,
) -> Request<Body> {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(token) = token {
        builder = builder.header(
            http::header::AUTHORIZATION,
            format!("Bearer {token}"),
        );
    }
    match body {
        Some(body) => builder
            .header(http::header::CONTENT_TYPE, "application/json")
            .body(Body::from(serde_json::to_string(body).unwrap()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    }
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes =
        to_bytes(response.into_body(), MAX_BODY_SIZE).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

async fn body_text(response: axum::response::Response) -> String {
    let bytes =
        to_bytes(response.into_body(), MAX_BODY_SIZE).await.unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

async fn register_and_login(app: &Router, username: &str) -> String {
    let response = app
        .clone()
        .oneshot(req(
            http::Method::POST,
            "/auth/register",
            None,
            Some(&json!({
                "username": username,
                "email": format!("{username}@example.com"),
                "password": "hunter2",
            })),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);

    let response = app
        .clone()
        .oneshot(req(
            http::Method::POST,
            "/auth/login",
            None,
            Some(&json!({
                "email": format!("{username}@example.com"),
                "password": "hunter2",
            })),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    body_json(response).await["access_token"]
        .as_str()
        .unwrap()
        .to_string()
}

async fn me(app: &Router, token: &str) -> Value {
    let response = app
        .clone()
        .oneshot(req(http::Method::GET, "/users/me", Some(token), None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    body_json(response).await
}

/// The sink is asynchronous; wait for it to drain before asserting counts.
async fn wait_for_ledger(state: &AppState, user_id: i64, count: i64) {
    for _ in 0..250 {
        let totals =
            state.storage.usage_totals(user_id, None).await.unwrap();
        if totals.count >= count {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("Ledger never reached {count} rows for user {user_id}");
}

#[tokio::test]
async fn health() {
    let test = test_app().await;
    let response = test
        .app
        .clone()
        .oneshot(req(http::Method::GET, "/health", None, None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn register_login_me() {
    let test = test_app().await;
    let token = register_and_login(&test.app, "alice").await;

    let user = me(&test.app, &token).await;
    assert_eq!(user["username"], "alice");
    assert_eq!(user["is_active"], true);
    assert!(user["plan_id"].as_i64().is_some());

    // Duplicate email is rejected before any insert.
    let response = test
        .app
        .clone()
        .oneshot(req(
            http::Method::POST,
            "/auth/register",
            None,
            Some(&json!({
                "username": "alice2",
                "email": "alice@example.com",
                "password": "hunter2",
            })),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = test
        .app
        .clone()
        .oneshot(req(
            http::Method::POST,
            "/auth/login",
            None,
            Some(&json!({
                "email": "alice@example.com",
                "password": "wrong",
            })),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = test
        .app
        .clone()
        .oneshot(req(http::Method::GET, "/users/me", None, None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn chat_message_validation() {
    let test = test_app().await;
    let token = register_and_login(&test.app, "alice").await;
    let user_id = me(&test.app, &token).await["id"].as_i64().unwrap();

    let oversized = "x".repeat(2001);
    for message in ["", oversized.as_str()] {
        let response = test
            .app
            .clone()
            .oneshot(req(
                http::Method::POST,
                "/chatbot",
                Some(&token),
                Some(&json!({"message": message})),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    // Rejected before any LLM or ledger work.
    let totals =
        test.state.storage.usage_totals(user_id, None).await.unwrap();
    assert_eq!(totals.count, 0);
}

#[tokio::test]
async fn chat_quota_exhaustion_returns_429() {
    let test = test_app().await;
    let token = register_and_login(&test.app, "alice").await;
    let user_id = me(&test.app, &token).await["id"].as_i64().unwrap();

    let response = test
        .app
        .clone()
        .oneshot(req(
            http::Method::GET,
            "/chatbot/usage",
            Some(&token),
            None,
        ))
        .await
        .unwrap();
    let usage = body_json(response).await;
    assert_eq!(usage["limit"], 5);
    assert_eq!(usage["window_hours"], 24);
    assert_eq!(usage["used"], 0);
    assert_eq!(usage["can_query"], true);

    // The default plan allows 5 queries per window.
    for n in 1..=5 {
        let response = test
            .app
            .clone()
            .oneshot(req(
                http::Method::POST,
                "/chatbot",
                Some(&token),
                Some(&json!({"message": "hi"})),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_text(response).await, "Hello there");
        wait_for_ledger(&test.state, user_id, n).await;
    }

    let response = test
        .app
        .clone()
        .oneshot(req(
            http::Method::POST,
            "/chatbot",
            Some(&token),
            Some(&json!({"message": "one more"})),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(
        response
            .headers()
            .get("X-RateLimit-Remaining")
            .and_then(|v| v.to_str().ok()),
        Some("0")
    );
    let payload = body_json(response).await;
    assert_eq!(payload["queries_used"], 5);
    assert_eq!(payload["queries_limit"], 5);
    assert_eq!(payload["queries_remaining"], 0);
    assert_eq!(payload["window_hours"], 24);

    let response = test
        .app
        .clone()
        .oneshot(req(
            http::Method::GET,
            "/chatbot/usage",
            Some(&token),
            None,
        ))
        .await
        .unwrap();
    let usage = body_json(response).await;
    assert_eq!(usage["used"], 5);
    assert_eq!(usage["remaining"], 0);
    assert_eq!(usage["can_query"], false);
}

#[tokio::test]
async fn chat_stream_emits_fragments_and_usage() {
    let test = test_app().await;
    let token = register_and_login(&test.app, "alice").await;
    let user_id = me(&test.app, &token).await["id"].as_i64().unwrap();

    let response = test
        .app
        .clone()
        .oneshot(req(
            http::Method::POST,
            "/chatbot/stream",
            Some(&token),
            Some(&json!({"message": "hi"})),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response
            .headers()
            .get(http::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok()),
        Some("text/event-stream")
    );
    let body = body_text(response).await;
    assert!(body.contains("data: Hello"), "body: {body}");

    // The terminal chunk's usage metadata lands in the ledger.
    wait_for_ledger(&test.state, user_id, 1).await;
    let totals =
        test.state.storage.usage_totals(user_id, None).await.unwrap();
    assert_eq!(totals.input_tokens, 12);
    assert_eq!(totals.output_tokens, 4);
    assert_eq!(totals.total_tokens, 16);
}

#[tokio::test]
async fn usage_log_endpoints_report_ledger_rows() {
    let test = test_app().await;
    let token = register_and_login(&test.app, "alice").await;
    let user_id = me(&test.app, &token).await["id"].as_i64().unwrap();

    for n in 1..=2 {
        let response = test
            .app
            .clone()
            .oneshot(req(
                http::Method::POST,
                "/chatbot",
                Some(&token),
                Some(&json!({"message": "hi"})),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        wait_for_ledger(&test.state, user_id, n).await;
    }

    let response = test
        .app
        .clone()
        .oneshot(req(
            http::Method::GET,
            "/chatbot/usage/logs",
            Some(&token),
            None,
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let logs = body_json(response).await;
    let logs = logs.as_array().unwrap();
    assert_eq!(logs.len(), 2);
    assert_eq!(logs[0]["model"], "stub-model");
    assert_eq!(logs[0]["total_tokens"], 16);
    // Distinct main calls, distinct node calls.
    assert_ne!(logs[0]["main_call_id"], logs[1]["main_call_id"]);
    assert_ne!(logs[0]["node_call_id"], logs[1]["node_call_id"]);

    let response = test
        .app
        .clone()
        .oneshot(req(
            http::Method::GET,
            "/chatbot/usage/totals",
            Some(&token),
            None,
        ))
        .await
        .unwrap();
    let totals = body_json(response).await;
    assert_eq!(totals["count"], 2);
    assert_eq!(totals["total_tokens"], 32);
}

#[tokio::test]
async fn upstream_failure_degrades_to_apology() {
    // Nothing listens on the discard port; every LLM call fails fast.
    let test = test_app_with("http://127.0.0.1:9".to_string()).await;
    let token = register_and_login(&test.app, "alice").await;
    let user_id = me(&test.app, &token).await["id"].as_i64().unwrap();

    let response = test
        .app
        .clone()
        .oneshot(req(
            http::Method::POST,
            "/chatbot",
            Some(&token),
            Some(&json!({"message": "hi"})),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_text(response).await, APOLOGY);

    // The user message stays checkpointed even though generation failed.
    let checkpoints = Checkpoints::new(&test.state.storage);
    let history = checkpoints
        .load(&Checkpoints::thread_for_user(user_id))
        .await
        .unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].role, "user");
    assert_eq!(history[0].content, "hi");
}

#[tokio::test]
async fn ledger_write_failure_does_not_mask_reply() {
    let base_url = spawn_stub_llm().await;
    let dir = tempfile::tempdir().unwrap();
    let storage = Storage::connect_at(
        dir.path().join("data.db"),
        Duration::from_secs(5),
    )
    .await
    .unwrap();
    let llm = LlmClient::new(&llm_conf(base_url)).unwrap();
    let checkpoints = Checkpoints::new(&storage);
    // Accounting sink with its drain side gone: every sample is dropped.
    let agent = Agent::new(
        llm,
        checkpoints,
        UsageSink::closed(),
        "You are a test assistant.".to_string(),
    );

    let reply = agent
        .invoke(1, "thread-1", "parent-x", "hi")
        .await
        .unwrap();
    assert_eq!(reply, "Hello there");
}

#[tokio::test]
async fn plan_admin_requires_superuser() {
    let test = test_app().await;
    let token = register_and_login(&test.app, "alice").await;
    let user_id = me(&test.app, &token).await["id"].as_i64().unwrap();

    let response = test
        .app
        .clone()
        .oneshot(req(http::Method::GET, "/plans", Some(&token), None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    // Promote and retry; the middleware reloads the user row per request.
    sqlx::query("UPDATE users SET is_superuser = 1 WHERE id = ?")
        .bind(user_id)
        .execute(&test.state.storage.pool())
        .await
        .unwrap();

    let response = test
        .app
        .clone()
        .oneshot(req(http::Method::GET, "/plans", Some(&token), None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let plans = body_json(response).await;
    assert!(plans
        .as_array()
        .unwrap()
        .iter()
        .any(|p| p["name"] == "Free"));

    let response = test
        .app
        .clone()
        .oneshot(req(
            http::Method::POST,
            "/plans",
            Some(&token),
            Some(&json!({
                "name": "Pro",
                "query_limit": 100,
                "query_window_hours": 24,
            })),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let pro = body_json(response).await;

    let response = test
        .app
        .clone()
        .oneshot(req(
            http::Method::POST,
            &format!("/users/{user_id}/plan"),
            Some(&token),
            Some(&json!({"plan_id": pro["id"]})),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = test
        .app
        .clone()
        .oneshot(req(
            http::Method::GET,
            "/chatbot/usage",
            Some(&token),
            None,
        ))
        .await
        .unwrap();
    let usage = body_json(response).await;
    assert_eq!(usage["limit"], 100);
}
