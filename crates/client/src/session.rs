// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Session-side collaborators the client clears when a session is lost.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::RwLock;
use serde_json::Value;

/// External holder of the "authenticated" flag.
pub trait AuthStore: Send + Sync {
    fn set_authenticated(&self, authenticated: bool);
    fn is_authenticated(&self) -> bool;
    /// Forget the session entirely.
    fn clear(&self);
}

/// External request/response cache, dropped wholesale on session loss.
pub trait QueryCache: Send + Sync {
    fn get(&self, key: &str) -> Option<Value>;
    fn insert(&self, key: &str, value: Value);
    fn clear(&self);
}

#[derive(Debug, Default)]
pub struct MemoryAuthStore {
    authenticated: AtomicBool,
}

impl MemoryAuthStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl AuthStore for MemoryAuthStore {
    fn set_authenticated(&self, authenticated: bool) {
        self.authenticated.store(authenticated, Ordering::Release);
    }

    fn is_authenticated(&self) -> bool {
        self.authenticated.load(Ordering::Acquire)
    }

    fn clear(&self) {
        self.authenticated.store(false, Ordering::Release);
    }
}

/// In-process cache of GET response bodies keyed by request path.
#[derive(Debug, Default)]
pub struct MemoryQueryCache {
    entries: RwLock<HashMap<String, Value>>,
}

impl MemoryQueryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl QueryCache for MemoryQueryCache {
    fn get(&self, key: &str) -> Option<Value> {
        self.entries.read().get(key).cloned()
    }

    fn insert(&self, key: &str, value: Value) {
        self.entries.write().insert(key.to_owned(), value);
    }

    fn clear(&self) {
        self.entries.write().clear();
    }
}

#[cfg(test)]
#[path = "session_tests.rs"]
mod tests;
