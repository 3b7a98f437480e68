// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Attend API client: cookie-session HTTP client for the attendance backend.
//!
//! Wraps every outbound call with single-flight token refresh, a bounded
//! waiter queue, a refresh circuit breaker, 429 backoff for idempotent
//! methods and a proactive refresh timer.

pub mod backoff;
pub mod client;
pub mod config;
pub mod error;
pub mod proactive;
pub mod refresh;
pub mod request;
pub mod session;

use std::sync::Once;

pub use client::ApiClient;
pub use config::ClientConfig;
pub use error::{ClientError, RefreshError};
pub use request::{ApiRequest, Body, FormData};
pub use session::{AuthStore, MemoryAuthStore, MemoryQueryCache, QueryCache};

static CRYPTO_INIT: Once = Once::new();

/// Install the ring crypto provider for reqwest/rustls.
/// Safe to call multiple times; only the first call has effect.
pub fn ensure_crypto() {
    CRYPTO_INIT.call_once(|| {
        let _ = rustls::crypto::ring::default_provider().install_default();
    });
}
