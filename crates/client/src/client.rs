// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Resilient API client for the attendance backend.
//!
//! # Request pipeline
//! ```text
//! request(req)
//!     → header fixup (accept, request id, content type unless multipart)
//!     → transport call (cookie session, credentials on every request)
//!     → status dispatch
//!         2xx → cache GET bodies, re-arm proactive refresh on session routes
//!         429 + GET/HEAD + budget left → wait Retry-After or backoff, loop
//!             (a wait above max_retry_after surfaces the 429 instead)
//!         401 + not retried + not login/refresh → refresh protocol, loop once
//!         anything else → error
//! ```
//!
//! The refresh protocol and its circuit breaker live in [`crate::refresh`];
//! this module drives them and tears the session down when they give up.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use bytes::Bytes;
use chrono::Utc;
use reqwest::header::{HeaderMap, CONTENT_TYPE, RETRY_AFTER};
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::backoff::{is_idempotent, parse_retry_after, rate_limit_delay};
use crate::config::ClientConfig;
use crate::error::{ClientError, RefreshError};
use crate::proactive::ProactiveTimer;
use crate::refresh::{Admission, LeadDenied, RefreshCoordinator, RefreshLease, RefreshPolicy};
use crate::request::{ApiRequest, Body, FormData};
use crate::session::{AuthStore, MemoryAuthStore, MemoryQueryCache, QueryCache};

/// Response as received, before status dispatch.
struct RawResponse {
    status: StatusCode,
    headers: HeaderMap,
    body: Bytes,
}

/// HTTP client bound to one backend origin and one cookie session.
pub struct ApiClient {
    config: ClientConfig,
    http: reqwest::Client,
    auth: Arc<dyn AuthStore>,
    cache: Arc<dyn QueryCache>,
    coordinator: Arc<RefreshCoordinator>,
    proactive: ProactiveTimer,
    /// Bumped on every teardown. Work started under an older epoch must not
    /// restore the session.
    epoch: AtomicU64,
}

impl ApiClient {
    /// Create a client. Fails on invalid configuration.
    pub fn new(
        config: ClientConfig,
        auth: Arc<dyn AuthStore>,
        cache: Arc<dyn QueryCache>,
    ) -> anyhow::Result<Arc<Self>> {
        config.validate()?;
        crate::ensure_crypto();

        let http = reqwest::Client::builder()
            .cookie_store(true)
            .timeout(config.request_timeout())
            .build()
            .context("failed to build HTTP client")?;

        let coordinator = RefreshCoordinator::new(RefreshPolicy::from(&config));
        Ok(Arc::new(Self {
            config,
            http,
            auth,
            cache,
            coordinator,
            proactive: ProactiveTimer::new(),
            epoch: AtomicU64::new(0),
        }))
    }

    /// Create a client backed by in-memory session collaborators.
    pub fn with_memory_session(config: ClientConfig) -> anyhow::Result<Arc<Self>> {
        Self::new(config, Arc::new(MemoryAuthStore::new()), Arc::new(MemoryQueryCache::new()))
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn coordinator(&self) -> &Arc<RefreshCoordinator> {
        &self.coordinator
    }

    pub fn auth_store(&self) -> &Arc<dyn AuthStore> {
        &self.auth
    }

    pub fn query_cache(&self) -> &Arc<dyn QueryCache> {
        &self.cache
    }

    pub fn is_authenticated(&self) -> bool {
        self.auth.is_authenticated()
    }

    /// True while a proactive refresh is pending.
    pub fn proactive_refresh_scheduled(&self) -> bool {
        self.proactive.is_scheduled()
    }

    /// Perform a request, recovering from expired sessions and rate limits.
    pub async fn request(self: &Arc<Self>, mut req: ApiRequest) -> Result<Value, ClientError> {
        if !req.path.starts_with('/') {
            return Err(ClientError::InvalidRequest(format!(
                "path must start with '/': {:?}",
                req.path
            )));
        }

        loop {
            let epoch = self.epoch();
            let resp = self.send(&req).await?;

            if resp.status.is_success() {
                let body = decode_body(&req.method, &resp)?;
                self.on_success(&req, &body, epoch);
                return Ok(body);
            }

            if resp.status == StatusCode::TOO_MANY_REQUESTS
                && is_idempotent(&req.method)
                && req.options.rate_limit_attempts < self.config.max_rate_limit_retries
            {
                let attempt = req.options.rate_limit_attempts;
                let delay = rate_limit_delay(
                    &resp.headers,
                    attempt,
                    self.config.backoff_base(),
                    self.config.backoff_max(),
                );
                if delay > self.config.max_retry_after() {
                    warn!(
                        method = %req.method,
                        path = %req.path,
                        delay_ms = delay.as_millis() as u64,
                        "rate limit wait too long, giving up"
                    );
                    return Err(status_error(resp));
                }
                warn!(
                    method = %req.method,
                    path = %req.path,
                    attempt = attempt + 1,
                    delay_ms = delay.as_millis() as u64,
                    "rate limited, retrying"
                );
                tokio::time::sleep(delay).await;
                req.options.rate_limit_attempts += 1;
                continue;
            }

            if resp.status == StatusCode::UNAUTHORIZED && self.should_refresh(&req) {
                debug!(method = %req.method, path = %req.path, "session expired, refreshing");
                self.recover_session().await?;
                req.options.retried = true;
                continue;
            }

            return Err(status_error(resp));
        }
    }

    pub async fn get<T: DeserializeOwned>(self: &Arc<Self>, path: &str) -> Result<T, ClientError> {
        decode_as(self.request(ApiRequest::get(path)).await?)
    }

    pub async fn post<T: DeserializeOwned, B: Serialize + ?Sized>(
        self: &Arc<Self>,
        path: &str,
        body: &B,
    ) -> Result<T, ClientError> {
        let req = ApiRequest::post(path).with_json(serde_json::to_value(body)?);
        decode_as(self.request(req).await?)
    }

    pub async fn put<T: DeserializeOwned, B: Serialize + ?Sized>(
        self: &Arc<Self>,
        path: &str,
        body: &B,
    ) -> Result<T, ClientError> {
        let req = ApiRequest::put(path).with_json(serde_json::to_value(body)?);
        decode_as(self.request(req).await?)
    }

    pub async fn patch<T: DeserializeOwned, B: Serialize + ?Sized>(
        self: &Arc<Self>,
        path: &str,
        body: &B,
    ) -> Result<T, ClientError> {
        let req = ApiRequest::patch(path).with_json(serde_json::to_value(body)?);
        decode_as(self.request(req).await?)
    }

    pub async fn delete<T: DeserializeOwned>(self: &Arc<Self>, path: &str) -> Result<T, ClientError> {
        decode_as(self.request(ApiRequest::delete(path)).await?)
    }

    /// POST a multipart form (file uploads).
    pub async fn upload<T: DeserializeOwned>(
        self: &Arc<Self>,
        path: &str,
        form: FormData,
    ) -> Result<T, ClientError> {
        decode_as(self.request(ApiRequest::post(path).with_form(form)).await?)
    }

    /// Start a session. The backend sets the session cookies.
    pub async fn login<C: Serialize + ?Sized>(
        self: &Arc<Self>,
        credentials: &C,
    ) -> Result<Value, ClientError> {
        let req = ApiRequest::post(self.config.login_path.clone())
            .with_json(serde_json::to_value(credentials)?)
            .skip_auth_retry();
        let body = self.request(req).await?;
        info!("logged in");
        Ok(body)
    }

    /// End the session. Local state is cleared even if the backend call fails.
    pub async fn logout(self: &Arc<Self>) -> Result<(), ClientError> {
        let req = ApiRequest::post(self.config.logout_path.clone()).skip_auth_retry();
        let result = self.request(req).await;
        self.teardown("logout");
        result.map(|_| ())
    }

    /// Identity check for the current session.
    pub async fn whoami(self: &Arc<Self>) -> Result<Value, ClientError> {
        self.request(ApiRequest::get(self.config.me_path.clone())).await
    }

    /// Run the refresh protocol now, as a 401 would.
    pub async fn refresh_session(self: &Arc<Self>) -> Result<(), ClientError> {
        self.recover_session().await
    }

    /// Arm the proactive refresh timer, replacing any pending one.
    pub fn schedule_proactive_refresh(self: &Arc<Self>, delay: Duration) {
        let client = Arc::downgrade(self);
        self.proactive.schedule(delay, async move {
            if let Some(client) = client.upgrade() {
                client.proactive_tick().await;
            }
        });
    }

    pub fn cancel_proactive_refresh(&self) {
        self.proactive.cancel();
    }

    fn should_refresh(&self, req: &ApiRequest) -> bool {
        let route = req.route();
        !req.options.retried
            && !req.options.skip_auth_retry
            && route != self.config.login_path
            && route != self.config.refresh_path
    }

    fn is_session_route(&self, route: &str) -> bool {
        route == self.config.login_path
            || route == self.config.refresh_path
            || route == self.config.me_path
    }

    fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }

    fn on_success(self: &Arc<Self>, req: &ApiRequest, body: &Value, epoch: u64) {
        if self.epoch() != epoch {
            debug!(path = %req.path, "session cleared while in flight, not caching");
            return;
        }
        if req.method == Method::GET {
            self.cache.insert(&req.path, body.clone());
        }
        if self.is_session_route(req.route()) {
            self.auth.set_authenticated(true);
            self.schedule_proactive_refresh(self.config.proactive_delay());
        }
    }

    /// Refresh protocol for a caller that just saw a 401.
    async fn recover_session(self: &Arc<Self>) -> Result<(), ClientError> {
        match self.coordinator.admit() {
            Admission::CircuitOpen { retry_in } => {
                warn!(retry_in_ms = retry_in.as_millis() as u64, "refresh circuit open");
                self.teardown("refresh circuit open");
                Err(ClientError::CircuitOpen { retry_in })
            }
            Admission::QueueFull { capacity } => Err(ClientError::QueueFull { capacity }),
            Admission::Wait(waiter) => {
                let stagger = waiter.wait().await?;
                if !stagger.is_zero() {
                    tokio::time::sleep(stagger).await;
                }
                Ok(())
            }
            Admission::Lead(lease) => {
                let epoch = self.epoch();
                let outcome = self.call_refresh().await;
                self.settle_refresh(lease, outcome, epoch, "session refresh")
                    .map_err(|e| {
                        self.teardown("refresh failed");
                        ClientError::RefreshFailed(e)
                    })
            }
        }
    }

    /// Settle the lease. On success the session is restored unless a teardown
    /// happened since `epoch`.
    fn settle_refresh(
        self: &Arc<Self>,
        lease: RefreshLease,
        outcome: Result<(), RefreshError>,
        epoch: u64,
        what: &str,
    ) -> Result<(), RefreshError> {
        match outcome {
            Ok(()) => {
                lease.succeed();
                if self.epoch() == epoch {
                    self.auth.set_authenticated(true);
                    self.schedule_proactive_refresh(self.config.proactive_delay());
                    info!("{what} succeeded");
                } else {
                    debug!("session cleared during refresh, not restoring it");
                }
                Ok(())
            }
            Err(e) => {
                lease.fail(e.clone());
                warn!(
                    err = %e,
                    failures = self.coordinator.consecutive_failures(),
                    "{what} failed"
                );
                Err(e)
            }
        }
    }

    /// Timer-driven refresh. Best effort: failures only feed the counters.
    async fn proactive_tick(self: &Arc<Self>) {
        let lease = match self.coordinator.try_lead() {
            Ok(lease) => lease,
            Err(LeadDenied::CircuitOpen { retry_in }) => {
                debug!(
                    retry_in_ms = retry_in.as_millis() as u64,
                    "proactive refresh deferred, circuit open"
                );
                self.schedule_proactive_refresh(retry_in);
                return;
            }
            Err(LeadDenied::InFlight) => {
                debug!("proactive refresh deferred, refresh already in flight");
                self.schedule_proactive_refresh(self.config.busy_recheck());
                return;
            }
        };

        let epoch = self.epoch();
        let outcome = self.call_refresh().await;
        // Failures only feed the counters; the next 401 drives recovery.
        let _ = self.settle_refresh(lease, outcome, epoch, "proactive refresh");
    }

    /// One refresh call under its own timeout. Never re-enters the 401 path.
    async fn call_refresh(&self) -> Result<(), RefreshError> {
        let timeout = self.config.refresh_timeout();
        let req = ApiRequest::post(self.config.refresh_path.clone()).skip_auth_retry();
        match tokio::time::timeout(timeout, self.send(&req)).await {
            Err(_elapsed) => Err(RefreshError::TimedOut(timeout)),
            Ok(Err(e)) => Err(RefreshError::Transport(e.to_string())),
            Ok(Ok(resp)) if resp.status.is_success() => Ok(()),
            Ok(Ok(resp)) => Err(RefreshError::Rejected(resp.status.as_u16())),
        }
    }

    /// Drop every trace of the session: auth flag, cached queries, timer.
    fn teardown(&self, reason: &str) {
        self.epoch.fetch_add(1, Ordering::AcqRel);
        self.auth.clear();
        self.cache.clear();
        self.proactive.cancel();
        info!(reason, "session cleared");
    }

    /// Transport stage: build and send one attempt.
    async fn send(&self, req: &ApiRequest) -> Result<RawResponse, ClientError> {
        let request_id = uuid::Uuid::new_v4().to_string();
        let mut builder = self
            .http
            .request(req.method.clone(), self.config.url(&req.path))
            .headers(req.headers(&request_id));
        builder = match &req.body {
            Body::Empty => builder,
            Body::Json(value) => builder.json(value),
            Body::Form(form) => builder.multipart(form.to_multipart()?),
        };

        let resp = builder.send().await?;
        let status = resp.status();
        let headers = resp.headers().clone();
        let body = resp.bytes().await?;
        debug!(
            method = %req.method,
            path = %req.path,
            status = status.as_u16(),
            request_id = %request_id,
            retried = req.options.retried,
            "response received"
        );
        Ok(RawResponse { status, headers, body })
    }
}

/// Empty bodies decode to `null`; non-JSON text comes back as a string.
fn decode_body(method: &Method, resp: &RawResponse) -> Result<Value, ClientError> {
    if *method == Method::HEAD || resp.body.is_empty() {
        return Ok(Value::Null);
    }
    match serde_json::from_slice(&resp.body) {
        Ok(value) => Ok(value),
        Err(e) => {
            let is_json = resp
                .headers
                .get(CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .is_some_and(|ct| ct.contains("json"));
            if is_json {
                Err(ClientError::Decode(e))
            } else {
                Ok(Value::String(String::from_utf8_lossy(&resp.body).into_owned()))
            }
        }
    }
}

fn decode_as<T: DeserializeOwned>(value: Value) -> Result<T, ClientError> {
    serde_json::from_value(value).map_err(ClientError::Decode)
}

fn status_error(resp: RawResponse) -> ClientError {
    let retry_after = resp
        .headers
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| parse_retry_after(v, Utc::now()));
    ClientError::Status {
        status: resp.status,
        body: String::from_utf8_lossy(&resp.body).into_owned(),
        retry_after,
    }
}
