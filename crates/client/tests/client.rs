// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! End-to-end tests for the client pipeline against a mock backend.
//!
//! The backend runs on a real TCP listener; timings in the client config are
//! shrunk so the suite stays fast on real time.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::net::TcpListener;

use attend_client::{
    ApiClient, ApiRequest, ClientConfig, ClientError, FormData, QueryCache, RefreshError,
};

const PASSWORD: &str = "hunter2";

#[derive(Default)]
struct Backend {
    session_valid: AtomicBool,
    login_calls: AtomicU32,
    refresh_calls: AtomicU32,
    items_calls: AtomicU32,
    guarded_calls: AtomicU32,
    limited_calls: AtomicU32,
    /// Status the refresh endpoint answers with; 0 means 200.
    refresh_status: AtomicU16,
    refresh_delay_ms: AtomicU64,
    /// 429s still to serve on /limited before it succeeds.
    rate_limited: AtomicU32,
    retry_after: Mutex<Option<String>>,
    last_cookie: Mutex<Option<String>>,
    last_upload_type: Mutex<Option<String>>,
    last_request_id: Mutex<Option<String>>,
}

impl Backend {
    fn expire(&self) {
        self.session_valid.store(false, Ordering::SeqCst);
    }

    fn fail_refresh_with(&self, status: u16) {
        self.refresh_status.store(status, Ordering::SeqCst);
    }

    fn count(counter: &AtomicU32) -> u32 {
        counter.load(Ordering::SeqCst)
    }
}

fn unauthorized() -> Response {
    (StatusCode::UNAUTHORIZED, Json(json!({ "error": "unauthorized" }))).into_response()
}

async fn login(State(b): State<Arc<Backend>>, Json(body): Json<Value>) -> Response {
    b.login_calls.fetch_add(1, Ordering::SeqCst);
    if body["password"] != PASSWORD {
        return unauthorized();
    }
    b.session_valid.store(true, Ordering::SeqCst);
    (
        StatusCode::OK,
        [(header::SET_COOKIE, "sid=first; Path=/; HttpOnly")],
        Json(json!({ "email": body["email"] })),
    )
        .into_response()
}

async fn refresh(State(b): State<Arc<Backend>>) -> Response {
    b.refresh_calls.fetch_add(1, Ordering::SeqCst);
    let delay = b.refresh_delay_ms.load(Ordering::SeqCst);
    if delay > 0 {
        tokio::time::sleep(Duration::from_millis(delay)).await;
    }
    match b.refresh_status.load(Ordering::SeqCst) {
        0 => {
            b.session_valid.store(true, Ordering::SeqCst);
            (StatusCode::OK, [(header::SET_COOKIE, "sid=rotated; Path=/; HttpOnly")])
                .into_response()
        }
        status => StatusCode::from_u16(status)
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
            .into_response(),
    }
}

async fn logout(State(b): State<Arc<Backend>>) -> Response {
    b.expire();
    StatusCode::NO_CONTENT.into_response()
}

async fn me(State(b): State<Arc<Backend>>, headers: HeaderMap) -> Response {
    *b.last_cookie.lock() =
        headers.get(header::COOKIE).and_then(|v| v.to_str().ok()).map(str::to_owned);
    if !b.session_valid.load(Ordering::SeqCst) {
        return unauthorized();
    }
    Json(json!({ "email": "ada@example.com" })).into_response()
}

async fn items(State(b): State<Arc<Backend>>, headers: HeaderMap) -> Response {
    b.items_calls.fetch_add(1, Ordering::SeqCst);
    *b.last_request_id.lock() =
        headers.get("x-request-id").and_then(|v| v.to_str().ok()).map(str::to_owned);
    if !b.session_valid.load(Ordering::SeqCst) {
        return unauthorized();
    }
    Json(json!({ "items": [1, 2, 3] })).into_response()
}

async fn guarded(State(b): State<Arc<Backend>>) -> Response {
    b.guarded_calls.fetch_add(1, Ordering::SeqCst);
    unauthorized()
}

async fn limited(State(b): State<Arc<Backend>>) -> Response {
    b.limited_calls.fetch_add(1, Ordering::SeqCst);
    let remaining = b.rate_limited.load(Ordering::SeqCst);
    if remaining == 0 {
        return Json(json!({ "ok": true })).into_response();
    }
    b.rate_limited.store(remaining - 1, Ordering::SeqCst);
    match b.retry_after.lock().clone() {
        Some(value) => {
            (StatusCode::TOO_MANY_REQUESTS, [(header::RETRY_AFTER, value)]).into_response()
        }
        None => StatusCode::TOO_MANY_REQUESTS.into_response(),
    }
}

async fn upload(State(b): State<Arc<Backend>>, headers: HeaderMap) -> Response {
    *b.last_upload_type.lock() =
        headers.get(header::CONTENT_TYPE).and_then(|v| v.to_str().ok()).map(str::to_owned);
    Json(json!({ "stored": true })).into_response()
}

async fn mock_backend() -> (SocketAddr, Arc<Backend>) {
    let backend = Arc::new(Backend::default());
    let app = Router::new()
        .route("/api/auth/login", post(login))
        .route("/api/auth/refresh", post(refresh))
        .route("/api/auth/logout", post(logout))
        .route("/api/auth/me", get(me))
        .route("/api/items", get(items))
        .route("/api/guarded", get(guarded))
        .route("/api/limited", get(limited).post(limited))
        .route("/api/upload", post(upload))
        .with_state(Arc::clone(&backend));

    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.ok();
    });
    (addr, backend)
}

fn fast_config(addr: SocketAddr) -> ClientConfig {
    ClientConfig {
        request_timeout_ms: 5_000,
        refresh_timeout_ms: 1_000,
        waiter_timeout_ms: 3_000,
        release_stagger_ms: 5,
        backoff_base_ms: 10,
        backoff_max_ms: 40,
        busy_recheck_ms: 50,
        ..ClientConfig::with_base_url(format!("http://{addr}/api"))
    }
}

async fn logged_in(config: ClientConfig) -> anyhow::Result<Arc<ApiClient>> {
    let client = ApiClient::with_memory_session(config)?;
    client.login(&json!({ "email": "ada@example.com", "password": PASSWORD })).await?;
    Ok(client)
}

async fn fetch_items_concurrently(client: &Arc<ApiClient>, n: usize) -> Vec<Result<Value, ClientError>> {
    let handles: Vec<_> = (0..n)
        .map(|_| {
            let client = Arc::clone(client);
            tokio::spawn(async move { client.get::<Value>("/items").await })
        })
        .collect();
    let mut results = Vec::with_capacity(n);
    for handle in handles {
        results.push(handle.await.expect("join"));
    }
    results
}

#[tokio::test]
async fn login_marks_session_and_arms_proactive_refresh() -> anyhow::Result<()> {
    let (addr, backend) = mock_backend().await;
    let client = logged_in(fast_config(addr)).await?;

    assert!(client.is_authenticated());
    assert!(client.proactive_refresh_scheduled());
    assert_eq!(Backend::count(&backend.login_calls), 1);

    let me = client.whoami().await?;
    assert_eq!(me["email"], "ada@example.com");
    Ok(())
}

#[tokio::test]
async fn session_cookie_is_sent_back() -> anyhow::Result<()> {
    let (addr, backend) = mock_backend().await;
    let client = logged_in(fast_config(addr)).await?;

    client.whoami().await?;
    let cookie = backend.last_cookie.lock().clone().unwrap_or_default();
    assert!(cookie.contains("sid=first"), "cookie header: {cookie:?}");
    Ok(())
}

#[tokio::test]
async fn rejected_login_does_not_refresh() -> anyhow::Result<()> {
    let (addr, backend) = mock_backend().await;
    let client = ApiClient::with_memory_session(fast_config(addr))?;

    let err = client
        .login(&json!({ "email": "ada@example.com", "password": "wrong" }))
        .await
        .expect_err("bad password should fail");

    assert_eq!(err.status(), Some(reqwest::StatusCode::UNAUTHORIZED));
    assert_eq!(Backend::count(&backend.refresh_calls), 0);
    assert!(!client.is_authenticated());
    Ok(())
}

#[tokio::test]
async fn concurrent_401s_share_one_refresh() -> anyhow::Result<()> {
    let (addr, backend) = mock_backend().await;
    let client = logged_in(fast_config(addr)).await?;
    backend.expire();
    backend.refresh_delay_ms.store(200, Ordering::SeqCst);

    let results = fetch_items_concurrently(&client, 10).await;

    for result in &results {
        assert!(result.is_ok(), "request failed: {result:?}");
    }
    assert_eq!(Backend::count(&backend.refresh_calls), 1);
    assert_eq!(Backend::count(&backend.items_calls), 20);
    assert!(client.is_authenticated());
    assert_eq!(client.coordinator().consecutive_failures(), 0);
    Ok(())
}

#[tokio::test]
async fn failed_refresh_rejects_every_caller_and_clears_session() -> anyhow::Result<()> {
    let (addr, backend) = mock_backend().await;
    let client = logged_in(fast_config(addr)).await?;
    client.get::<Value>("/items").await?;
    assert!(client.query_cache().get("/items").is_some());

    backend.expire();
    backend.fail_refresh_with(401);
    backend.refresh_delay_ms.store(200, Ordering::SeqCst);

    let results = fetch_items_concurrently(&client, 5).await;

    for result in results {
        match result {
            Err(e) => assert!(e.is_session_lost(), "unexpected error: {e}"),
            Ok(v) => panic!("expected failure, got {v}"),
        }
    }
    assert_eq!(Backend::count(&backend.refresh_calls), 1);
    assert!(!client.is_authenticated());
    assert!(client.query_cache().get("/items").is_none());
    assert!(!client.proactive_refresh_scheduled());
    Ok(())
}

#[tokio::test]
async fn waiters_beyond_capacity_are_rejected() -> anyhow::Result<()> {
    let (addr, backend) = mock_backend().await;
    let config = ClientConfig { max_waiters: 2, ..fast_config(addr) };
    let client = logged_in(config).await?;
    backend.expire();
    backend.refresh_delay_ms.store(400, Ordering::SeqCst);

    let results = fetch_items_concurrently(&client, 5).await;

    let full = results.iter().filter(|r| matches!(r, Err(ClientError::QueueFull { capacity: 2 }))).count();
    let ok = results.iter().filter(|r| r.is_ok()).count();
    assert_eq!((ok, full), (3, 2));
    assert_eq!(Backend::count(&backend.refresh_calls), 1);
    Ok(())
}

#[tokio::test]
async fn second_401_after_refresh_is_final() -> anyhow::Result<()> {
    let (addr, backend) = mock_backend().await;
    let client = logged_in(fast_config(addr)).await?;

    let err = client.get::<Value>("/guarded").await.expect_err("always unauthorized");

    assert_eq!(err.code(), "UNAUTHORIZED");
    assert_eq!(Backend::count(&backend.guarded_calls), 2);
    assert_eq!(Backend::count(&backend.refresh_calls), 1);
    Ok(())
}

#[tokio::test]
async fn skip_auth_retry_surfaces_401_directly() -> anyhow::Result<()> {
    let (addr, backend) = mock_backend().await;
    let client = logged_in(fast_config(addr)).await?;

    let err = client
        .request(ApiRequest::get("/guarded").skip_auth_retry())
        .await
        .expect_err("always unauthorized");

    assert_eq!(err.status(), Some(reqwest::StatusCode::UNAUTHORIZED));
    assert_eq!(Backend::count(&backend.guarded_calls), 1);
    assert_eq!(Backend::count(&backend.refresh_calls), 0);
    Ok(())
}

#[tokio::test]
async fn circuit_opens_after_three_failed_refreshes() -> anyhow::Result<()> {
    let (addr, backend) = mock_backend().await;
    let client = logged_in(fast_config(addr)).await?;
    backend.fail_refresh_with(500);

    for _ in 0..3 {
        backend.expire();
        let err = client.get::<Value>("/items").await.expect_err("refresh fails");
        assert!(matches!(err, ClientError::RefreshFailed(RefreshError::Rejected(500))), "got {err}");
    }
    assert!(client.coordinator().is_circuit_open());

    let err = client.get::<Value>("/items").await.expect_err("circuit open");
    assert!(matches!(err, ClientError::CircuitOpen { .. }), "got {err}");
    assert_eq!(Backend::count(&backend.refresh_calls), 3);
    Ok(())
}

#[tokio::test]
async fn slow_refresh_times_out_and_counts_as_failure() -> anyhow::Result<()> {
    let (addr, backend) = mock_backend().await;
    let config = ClientConfig { refresh_timeout_ms: 100, ..fast_config(addr) };
    let client = logged_in(config).await?;
    backend.expire();
    backend.refresh_delay_ms.store(1_000, Ordering::SeqCst);

    let err = client.get::<Value>("/items").await.expect_err("refresh times out");

    assert!(matches!(err, ClientError::RefreshFailed(RefreshError::TimedOut(_))), "got {err}");
    assert_eq!(client.coordinator().consecutive_failures(), 1);
    assert!(!client.is_authenticated());
    Ok(())
}

#[tokio::test]
async fn rate_limited_get_waits_for_retry_after() -> anyhow::Result<()> {
    let (addr, backend) = mock_backend().await;
    let client = ApiClient::with_memory_session(fast_config(addr))?;
    backend.rate_limited.store(1, Ordering::SeqCst);
    *backend.retry_after.lock() = Some("1".to_owned());

    let started = Instant::now();
    let body: Value = client.get("/limited").await?;

    assert_eq!(body["ok"], true);
    assert!(started.elapsed() >= Duration::from_millis(950), "elapsed {:?}", started.elapsed());
    assert_eq!(Backend::count(&backend.limited_calls), 2);
    Ok(())
}

#[tokio::test]
async fn rate_limited_get_gives_up_after_three_retries() -> anyhow::Result<()> {
    let (addr, backend) = mock_backend().await;
    let client = ApiClient::with_memory_session(fast_config(addr))?;
    backend.rate_limited.store(10, Ordering::SeqCst);

    let err = client.get::<Value>("/limited").await.expect_err("still limited");

    assert_eq!(err.code(), "RATE_LIMITED");
    assert_eq!(Backend::count(&backend.limited_calls), 4);
    Ok(())
}

#[tokio::test]
async fn rate_limited_post_is_not_retried() -> anyhow::Result<()> {
    let (addr, backend) = mock_backend().await;
    let client = ApiClient::with_memory_session(fast_config(addr))?;
    backend.rate_limited.store(10, Ordering::SeqCst);
    *backend.retry_after.lock() = Some("2".to_owned());

    let err = client.post::<Value, _>("/limited", &json!({})).await.expect_err("limited");

    match err {
        ClientError::Status { status, retry_after, .. } => {
            assert_eq!(status, reqwest::StatusCode::TOO_MANY_REQUESTS);
            assert_eq!(retry_after, Some(Duration::from_secs(2)));
        }
        other => panic!("expected status error, got {other}"),
    }
    assert_eq!(Backend::count(&backend.limited_calls), 1);
    Ok(())
}

#[tokio::test]
async fn form_upload_carries_multipart_boundary() -> anyhow::Result<()> {
    let (addr, backend) = mock_backend().await;
    let client = logged_in(fast_config(addr)).await?;

    let form = FormData::new()
        .text("note", "sick leave")
        .file("proof", "note.pdf", b"%PDF-1.4".to_vec(), Some("application/pdf".to_owned()));
    let body: Value = client.upload("/upload", form).await?;

    assert_eq!(body["stored"], true);
    let content_type = backend.last_upload_type.lock().clone().unwrap_or_default();
    assert!(
        content_type.starts_with("multipart/form-data; boundary="),
        "content type: {content_type:?}"
    );
    Ok(())
}

#[tokio::test]
async fn every_attempt_gets_a_fresh_request_id() -> anyhow::Result<()> {
    let (addr, backend) = mock_backend().await;
    let client = logged_in(fast_config(addr)).await?;

    client.get::<Value>("/items").await?;
    let first = backend.last_request_id.lock().clone();
    client.get::<Value>("/items").await?;
    let second = backend.last_request_id.lock().clone();

    assert!(first.is_some());
    assert_ne!(first, second);
    Ok(())
}

#[tokio::test]
async fn get_bodies_land_in_the_query_cache() -> anyhow::Result<()> {
    let (addr, _backend) = mock_backend().await;
    let client = logged_in(fast_config(addr)).await?;

    client.get::<Value>("/items").await?;

    assert_eq!(client.query_cache().get("/items"), Some(json!({ "items": [1, 2, 3] })));
    Ok(())
}

#[tokio::test]
async fn logout_clears_local_session() -> anyhow::Result<()> {
    let (addr, _backend) = mock_backend().await;
    let client = logged_in(fast_config(addr)).await?;
    client.get::<Value>("/items").await?;

    client.logout().await?;

    assert!(!client.is_authenticated());
    assert!(client.query_cache().get("/items").is_none());
    assert!(!client.proactive_refresh_scheduled());
    Ok(())
}

#[tokio::test]
async fn rescheduled_proactive_refresh_fires_once() -> anyhow::Result<()> {
    let (addr, backend) = mock_backend().await;
    let client = logged_in(fast_config(addr)).await?;

    client.schedule_proactive_refresh(Duration::from_millis(50));
    client.schedule_proactive_refresh(Duration::from_millis(80));
    tokio::time::sleep(Duration::from_millis(400)).await;

    assert_eq!(Backend::count(&backend.refresh_calls), 1);
    // Re-armed for the next token lifetime.
    assert!(client.proactive_refresh_scheduled());
    Ok(())
}

#[tokio::test]
async fn failed_proactive_refresh_keeps_session() -> anyhow::Result<()> {
    let (addr, backend) = mock_backend().await;
    let client = logged_in(fast_config(addr)).await?;
    backend.fail_refresh_with(500);

    client.schedule_proactive_refresh(Duration::from_millis(20));
    tokio::time::sleep(Duration::from_millis(300)).await;

    assert_eq!(Backend::count(&backend.refresh_calls), 1);
    assert_eq!(client.coordinator().consecutive_failures(), 1);
    assert!(client.is_authenticated());
    assert!(!client.proactive_refresh_scheduled());
    Ok(())
}

#[tokio::test]
async fn cancelled_proactive_refresh_never_fires() -> anyhow::Result<()> {
    let (addr, backend) = mock_backend().await;
    let client = logged_in(fast_config(addr)).await?;

    client.schedule_proactive_refresh(Duration::from_millis(30));
    client.cancel_proactive_refresh();
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(Backend::count(&backend.refresh_calls), 0);
    Ok(())
}

#[tokio::test]
async fn logout_during_refresh_keeps_session_cleared() -> anyhow::Result<()> {
    let (addr, backend) = mock_backend().await;
    let client = logged_in(fast_config(addr)).await?;
    backend.refresh_delay_ms.store(300, Ordering::SeqCst);

    client.schedule_proactive_refresh(Duration::from_millis(10));
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(client.coordinator().is_refreshing());

    client.logout().await?;
    tokio::time::sleep(Duration::from_millis(500)).await;

    assert_eq!(Backend::count(&backend.refresh_calls), 1);
    assert!(!client.coordinator().is_refreshing());
    assert!(!client.is_authenticated());
    assert!(!client.proactive_refresh_scheduled());
    Ok(())
}

#[tokio::test]
async fn proactive_refresh_waits_out_an_open_circuit() -> anyhow::Result<()> {
    let (addr, backend) = mock_backend().await;
    let config = ClientConfig { circuit_reset_secs: 2, ..fast_config(addr) };
    let client = logged_in(config).await?;
    backend.fail_refresh_with(500);
    for _ in 0..3 {
        backend.expire();
        client.get::<Value>("/items").await.expect_err("refresh fails");
    }
    assert!(client.coordinator().is_circuit_open());

    // Fire halfway through the window: no refresh, timer re-armed for the rest.
    tokio::time::sleep(Duration::from_millis(1_000)).await;
    client.schedule_proactive_refresh(Duration::from_millis(10));
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(Backend::count(&backend.refresh_calls), 3);
    assert!(client.proactive_refresh_scheduled());

    // Window closed: the deferred tick retries without waiting a full window again.
    tokio::time::sleep(Duration::from_millis(1_200)).await;
    assert_eq!(Backend::count(&backend.refresh_calls), 4);
    Ok(())
}

#[tokio::test]
async fn proactive_refresh_defers_to_an_in_flight_refresh() -> anyhow::Result<()> {
    let (addr, backend) = mock_backend().await;
    let client = logged_in(fast_config(addr)).await?;
    backend.expire();
    backend.refresh_delay_ms.store(300, Ordering::SeqCst);

    let reactive = {
        let client = Arc::clone(&client);
        tokio::spawn(async move { client.get::<Value>("/items").await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(client.coordinator().is_refreshing());

    client.schedule_proactive_refresh(Duration::from_millis(10));
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(client.proactive_refresh_scheduled());

    reactive.await.expect("join")?;
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(Backend::count(&backend.refresh_calls), 1);
    assert!(client.proactive_refresh_scheduled());
    assert!(client.is_authenticated());
    Ok(())
}

#[tokio::test]
async fn overlong_retry_after_surfaces_the_429() -> anyhow::Result<()> {
    let (addr, backend) = mock_backend().await;
    let client = ApiClient::with_memory_session(fast_config(addr))?;
    backend.rate_limited.store(1, Ordering::SeqCst);
    *backend.retry_after.lock() = Some("86400".to_owned());

    let started = Instant::now();
    let err = client.get::<Value>("/limited").await.expect_err("wait too long");

    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(err.code(), "RATE_LIMITED");
    match err {
        ClientError::Status { retry_after, .. } => {
            assert_eq!(retry_after, Some(Duration::from_secs(86_400)));
        }
        other => panic!("expected status error, got {other}"),
    }
    assert_eq!(Backend::count(&backend.limited_calls), 1);
    Ok(())
}
