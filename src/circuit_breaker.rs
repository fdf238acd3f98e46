//! Availability tracking for Provider A.
//!
//! # States
//!
//! - **Available**: requests go through. Re-probed once per `check_interval`.
//! - **Unavailable**: every query answers `false` with zero network calls
//!   until `check_interval` has passed since the last check; then exactly one
//!   caller re-probes while the others keep getting `false`.
//!
//! Connection and timeout errors (from probes, logins or searches) count as
//! failures. Any HTTP answer to a probe, even 404/405, counts as alive.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;
use std::time::Duration;

use crate::clock::{elapsed_between, SharedClock};
use crate::errors::ProviderError;
use crate::models::ProviderId;
use crate::warning_throttle::WarningThrottle;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProviderAvailability {
    pub provider_id: ProviderId,
    pub is_available: bool,
    pub last_checked_at: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    pub check_interval: Duration,
    pub max_failures: u32,
}

pub struct AvailabilityTracker {
    probe_url: String,
    probe_timeout: Duration,
    client: reqwest::Client,
    clock: SharedClock,
    throttle: WarningThrottle,
    state: RwLock<ProviderAvailability>,
    probe_in_flight: AtomicBool,
}

enum Decision {
    Known(bool),
    Probe,
}

/// Clears the in-flight flag even when the probing future is dropped.
struct ProbeGuard<'a>(&'a AtomicBool);

impl Drop for ProbeGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl AvailabilityTracker {
    /// Creates a tracker that starts out `Available` and probes on first use.
    ///
    /// # Arguments
    ///
    /// * `provider_id` - The circuit-broken provider.
    /// * `probe_url` - Cheap entry point to hit (the login URL for Provider A).
    /// * `check_interval` - How long a check result is trusted.
    /// * `max_failures` - Consecutive failures before tripping (at least 1).
    /// * `probe_timeout` - Timeout for the reachability request.
    pub fn new(
        provider_id: ProviderId,
        probe_url: impl Into<String>,
        check_interval: Duration,
        max_failures: u32,
        probe_timeout: Duration,
        clock: SharedClock,
        throttle: WarningThrottle,
    ) -> Self {
        Self {
            probe_url: probe_url.into(),
            probe_timeout,
            client: reqwest::Client::new(),
            clock,
            throttle,
            state: RwLock::new(ProviderAvailability {
                provider_id,
                is_available: true,
                last_checked_at: None,
                consecutive_failures: 0,
                check_interval,
                max_failures: max_failures.max(1),
            }),
            probe_in_flight: AtomicBool::new(false),
        }
    }

    pub fn provider(&self) -> ProviderId {
        self.read().provider_id
    }

    pub fn snapshot(&self) -> ProviderAvailability {
        self.read().clone()
    }

    /// Whether Provider A should be tried right now.
    ///
    /// Answers from the last check while it is younger than `check_interval`
    /// (no I/O); otherwise one probe decides.
    pub async fn is_available(&self) -> bool {
        match self.decide() {
            Decision::Known(available) => available,
            Decision::Probe => self.probe().await,
        }
    }

    fn decide(&self) -> Decision {
        let now = self.clock.now();
        let state = self.read();

        if let Some(last) = state.last_checked_at {
            if elapsed_between(last, now) < state.check_interval {
                return Decision::Known(state.is_available);
            }
        }

        // Due for a check: only one caller gets to probe.
        if self
            .probe_in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Decision::Known(state.is_available);
        }

        Decision::Probe
    }

    async fn probe(&self) -> bool {
        let _guard = ProbeGuard(&self.probe_in_flight);
        let provider = self.provider();

        let result = self
            .client
            .get(&self.probe_url)
            .timeout(self.probe_timeout)
            .send()
            .await;

        match result {
            Ok(response) => {
                tracing::debug!(
                    "{}: reachability probe answered HTTP {}",
                    provider,
                    response.status()
                );
                self.record_success();
                true
            }
            Err(err) => {
                let error = ProviderError::from_reqwest(provider, err);
                if error.is_unreachable() {
                    self.record_failure();
                    false
                } else {
                    // Reached something but the exchange itself failed; keep
                    // the current verdict and check again next interval.
                    tracing::debug!("{}: probe inconclusive: {}", provider, error);
                    let mut state = self.write();
                    state.last_checked_at = Some(self.clock.now());
                    if state.consecutive_failures >= state.max_failures {
                        state.is_available = false;
                    }
                    state.is_available
                }
            }
        }
    }

    /// Records a connection/timeout failure from a probe, login or search.
    pub fn record_failure(&self) {
        let now = self.clock.now();
        let (tripped, provider, failures) = {
            let mut state = self.write();
            state.consecutive_failures = state.consecutive_failures.saturating_add(1);
            state.last_checked_at = Some(now);
            let tripped = state.is_available && state.consecutive_failures >= state.max_failures;
            if state.consecutive_failures >= state.max_failures {
                state.is_available = false;
            }
            (tripped, state.provider_id, state.consecutive_failures)
        };

        if tripped && self.throttle.should_log(&format!("{}_marked_unavailable", provider)) {
            tracing::warn!(
                "{} marked unavailable after {} consecutive failure(s)",
                provider,
                failures
            );
        }
    }

    /// Records a successful probe, login or search.
    pub fn record_success(&self) {
        let now = self.clock.now();
        let recovered = {
            let mut state = self.write();
            let recovered = !state.is_available;
            state.is_available = true;
            state.consecutive_failures = 0;
            state.last_checked_at = Some(now);
            recovered
        };

        if recovered {
            tracing::info!("{} is reachable again", self.provider());
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, ProviderAvailability> {
        self.state.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, ProviderAvailability> {
        self.state.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
