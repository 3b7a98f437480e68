// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Single-slot cancellable timer for proactive session refresh.

use std::future::Future;
use std::time::Duration;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Holds at most one pending timer. Scheduling always cancels the previous one.
#[derive(Default)]
pub struct ProactiveTimer {
    slot: Mutex<Option<CancellationToken>>,
}

impl ProactiveTimer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `task` after `delay`, replacing any pending timer.
    pub fn schedule<F>(&self, delay: Duration, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let token = CancellationToken::new();
        let previous = self.slot.lock().replace(token.clone());
        if let Some(previous) = previous {
            previous.cancel();
        }
        debug!(delay_ms = delay.as_millis() as u64, "proactive refresh scheduled");

        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
            // Fired: nothing is pending any more until the task reschedules.
            token.cancel();
            task.await;
        });
    }

    /// Cancel the pending timer, if any.
    pub fn cancel(&self) {
        if let Some(token) = self.slot.lock().take() {
            token.cancel();
            debug!("proactive refresh cancelled");
        }
    }

    /// True while a timer is waiting to fire.
    pub fn is_scheduled(&self) -> bool {
        self.slot.lock().as_ref().is_some_and(|t| !t.is_cancelled())
    }
}

impl Drop for ProactiveTimer {
    fn drop(&mut self) {
        if let Some(token) = self.slot.get_mut().take() {
            token.cancel();
        }
    }
}

#[cfg(test)]
#[path = "proactive_tests.rs"]
mod tests;
