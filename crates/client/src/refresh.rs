// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Single-flight refresh coordination.
//!
//! At most one refresh is in flight. Callers that need a fresh session while
//! one is running park in a bounded FIFO queue with their own timeout, and are
//! released together when it settles. Consecutive failures open a circuit
//! that short-circuits further refresh attempts for a cooldown window.
//!
//! The state lock is synchronous and never held across an await.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::ClientConfig;
use crate::error::{ClientError, RefreshError};

/// Limits applied by the coordinator.
#[derive(Debug, Clone)]
pub struct RefreshPolicy {
    pub max_waiters: usize,
    pub waiter_timeout: Duration,
    pub release_stagger: Duration,
    pub circuit_threshold: u32,
    pub circuit_reset: Duration,
}

impl From<&ClientConfig> for RefreshPolicy {
    fn from(config: &ClientConfig) -> Self {
        Self {
            max_waiters: config.max_waiters,
            waiter_timeout: config.waiter_timeout(),
            release_stagger: config.release_stagger(),
            circuit_threshold: config.circuit_threshold,
            circuit_reset: config.circuit_reset(),
        }
    }
}

/// Open window used when the configured one does not fit in an `Instant`.
const MAX_CIRCUIT_WINDOW: Duration = Duration::from_secs(crate::config::MAX_CIRCUIT_RESET_SECS);

type Release = Result<Duration, RefreshError>;

struct Parked {
    id: u64,
    registered_at: Instant,
    tx: oneshot::Sender<Release>,
}

#[derive(Default)]
struct State {
    in_flight: bool,
    waiters: VecDeque<Parked>,
    next_id: u64,
    consecutive_failures: u32,
    circuit_open_until: Option<Instant>,
}

impl State {
    fn circuit_remaining(&self, now: Instant, threshold: u32) -> Option<Duration> {
        if self.consecutive_failures < threshold {
            return None;
        }
        self.circuit_open_until.filter(|until| now < *until).map(|until| until - now)
    }
}

/// Result of asking to refresh the session.
pub enum Admission {
    /// Circuit is open; no refresh may be attempted.
    CircuitOpen { retry_in: Duration },
    /// A refresh is running and the waiter queue is at capacity.
    QueueFull { capacity: usize },
    /// A refresh is running; wait for it.
    Wait(Waiter),
    /// No refresh is running; the caller now owns it.
    Lead(RefreshLease),
}

/// Why a caller could not become the refresh leader without queueing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeadDenied {
    CircuitOpen { retry_in: Duration },
    InFlight,
}

/// Owner of the refresh coordination state for one client.
pub struct RefreshCoordinator {
    policy: RefreshPolicy,
    state: Mutex<State>,
}

impl RefreshCoordinator {
    pub fn new(policy: RefreshPolicy) -> Arc<Self> {
        Arc::new(Self { policy, state: Mutex::new(State::default()) })
    }

    pub fn policy(&self) -> &RefreshPolicy {
        &self.policy
    }

    /// Decide how a caller that just saw a 401 proceeds.
    pub fn admit(self: &Arc<Self>) -> Admission {
        let mut state = self.state.lock();
        let now = Instant::now();

        if let Some(retry_in) = state.circuit_remaining(now, self.policy.circuit_threshold) {
            return Admission::CircuitOpen { retry_in };
        }

        if state.in_flight {
            if state.waiters.len() >= self.policy.max_waiters {
                warn!(capacity = self.policy.max_waiters, "refresh queue full, rejecting caller");
                return Admission::QueueFull { capacity: self.policy.max_waiters };
            }
            let id = state.next_id;
            state.next_id += 1;
            let (tx, rx) = oneshot::channel();
            state.waiters.push_back(Parked { id, registered_at: now, tx });
            debug!(waiter = id, waiters = state.waiters.len(), "parked behind in-flight refresh");
            return Admission::Wait(Waiter {
                id,
                rx,
                timeout: self.policy.waiter_timeout,
                coordinator: Arc::clone(self),
            });
        }

        state.in_flight = true;
        Admission::Lead(RefreshLease { coordinator: Arc::clone(self), settled: false })
    }

    /// Become the refresh leader only if nobody else is refreshing.
    pub fn try_lead(self: &Arc<Self>) -> Result<RefreshLease, LeadDenied> {
        let mut state = self.state.lock();
        if let Some(retry_in) = state.circuit_remaining(Instant::now(), self.policy.circuit_threshold)
        {
            return Err(LeadDenied::CircuitOpen { retry_in });
        }
        if state.in_flight {
            return Err(LeadDenied::InFlight);
        }
        state.in_flight = true;
        Ok(RefreshLease { coordinator: Arc::clone(self), settled: false })
    }

    pub fn is_refreshing(&self) -> bool {
        self.state.lock().in_flight
    }

    /// Number of parked waiters.
    pub fn waiting(&self) -> usize {
        self.state.lock().waiters.len()
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.state.lock().consecutive_failures
    }

    pub fn circuit_open_until(&self) -> Option<Instant> {
        self.state.lock().circuit_open_until
    }

    pub fn is_circuit_open(&self) -> bool {
        let state = self.state.lock();
        state.circuit_remaining(Instant::now(), self.policy.circuit_threshold).is_some()
    }

    /// Remaining cooldown if the circuit is open.
    pub fn circuit_retry_in(&self) -> Option<Duration> {
        let state = self.state.lock();
        state.circuit_remaining(Instant::now(), self.policy.circuit_threshold)
    }

    /// Returns false if the waiter was already released.
    fn remove_waiter(&self, id: u64) -> bool {
        let mut state = self.state.lock();
        let before = state.waiters.len();
        state.waiters.retain(|w| w.id != id);
        state.waiters.len() != before
    }

    fn settle(&self, outcome: Result<(), RefreshError>) {
        let released = {
            let mut state = self.state.lock();
            state.in_flight = false;
            match &outcome {
                Ok(()) => {
                    state.consecutive_failures = 0;
                    state.circuit_open_until = None;
                }
                // Abandoned refreshes have no verdict; they do not count.
                Err(RefreshError::Abandoned) => {}
                Err(e) => {
                    state.consecutive_failures = state.consecutive_failures.saturating_add(1);
                    if state.consecutive_failures >= self.policy.circuit_threshold {
                        let now = Instant::now();
                        state.circuit_open_until = Some(
                            now.checked_add(self.policy.circuit_reset)
                                .unwrap_or_else(|| now + MAX_CIRCUIT_WINDOW),
                        );
                        warn!(
                            failures = state.consecutive_failures,
                            reset_secs = self.policy.circuit_reset.as_secs(),
                            err = %e,
                            "refresh circuit opened"
                        );
                    }
                }
            }
            std::mem::take(&mut state.waiters)
        };

        if released.is_empty() {
            return;
        }
        debug!(waiters = released.len(), ok = outcome.is_ok(), "releasing refresh waiters");

        match outcome {
            Ok(()) => {
                let mut stagger = Duration::ZERO;
                for parked in released {
                    debug!(
                        waiter = parked.id,
                        waited_ms = parked.registered_at.elapsed().as_millis() as u64,
                        delay_ms = stagger.as_millis() as u64,
                        "waiter released"
                    );
                    let _ = parked.tx.send(Ok(stagger));
                    stagger += self.policy.release_stagger;
                }
            }
            Err(e) => {
                for parked in released {
                    let _ = parked.tx.send(Err(e.clone()));
                }
            }
        }
    }
}

/// A caller parked behind the in-flight refresh.
pub struct Waiter {
    id: u64,
    rx: oneshot::Receiver<Release>,
    timeout: Duration,
    coordinator: Arc<RefreshCoordinator>,
}

impl Waiter {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Wait for the in-flight refresh.
    ///
    /// On success returns the stagger delay to observe before retrying.
    pub async fn wait(mut self) -> Result<Duration, ClientError> {
        let outcome = match tokio::time::timeout(self.timeout, &mut self.rx).await {
            Ok(received) => received.ok(),
            Err(_elapsed) => {
                if self.coordinator.remove_waiter(self.id) {
                    debug!(waiter = self.id, "refresh waiter timed out");
                    return Err(ClientError::WaiterTimeout);
                }
                // Already drained by a settling refresh; its verdict is in transit.
                (&mut self.rx).await.ok()
            }
        };
        match outcome {
            Some(Ok(stagger)) => Ok(stagger),
            Some(Err(e)) => Err(ClientError::RefreshFailed(e)),
            None => Err(ClientError::RefreshFailed(RefreshError::Abandoned)),
        }
    }
}

impl Drop for Waiter {
    fn drop(&mut self) {
        self.coordinator.remove_waiter(self.id);
    }
}

/// Ownership of the single in-flight refresh.
///
/// Settle with [`succeed`](Self::succeed) or [`fail`](Self::fail). Dropping an
/// unsettled lease releases its waiters with [`RefreshError::Abandoned`] and
/// clears the in-flight flag.
pub struct RefreshLease {
    coordinator: Arc<RefreshCoordinator>,
    settled: bool,
}

impl RefreshLease {
    pub fn succeed(mut self) {
        self.settled = true;
        self.coordinator.settle(Ok(()));
    }

    pub fn fail(mut self, err: RefreshError) {
        self.settled = true;
        self.coordinator.settle(Err(err));
    }
}

impl Drop for RefreshLease {
    fn drop(&mut self) {
        if !self.settled {
            self.coordinator.settle(Err(RefreshError::Abandoned));
        }
    }
}

#[cfg(test)]
#[path = "refresh_tests.rs"]
mod tests;
