//! Reconnect backoff policies.
//!
//! A policy maps the index of a consecutive failure to the delay before the
//! next attempt, or `None` to stop retrying. Index 0 is the first failure
//! after a successful connection.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::prefs::{NetworkMonitor, Preferences};

/// Decides whether and when to retry after a failure.
pub trait ReconnectPolicy: Send + Sync {
    fn next_delay(&self, attempt: u32) -> Option<Duration>;
}

/// One tier of a [`BackoffSchedule`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackoffRule {
    /// Delay before each attempt in this tier.
    pub delay_secs: u64,
    /// How many attempts use this delay. `None` repeats forever.
    #[serde(default)]
    pub repeat: Option<u32>,
}

impl BackoffRule {
    pub fn new(delay_secs: u64, repeat: Option<u32>) -> Self {
        Self { delay_secs, repeat }
    }
}

/// Tiered delays: walk the rules in order, each covering `repeat` attempts.
///
/// Running past the last finite rule stops reconnecting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackoffSchedule {
    rules: Vec<BackoffRule>,
}

impl BackoffSchedule {
    pub fn new(rules: Vec<BackoffRule>) -> Self {
        Self { rules }
    }
}

impl Default for BackoffSchedule {
    fn default() -> Self {
        Self::new(default_rules())
    }
}

/// 5s three times, 30s five times, then every two minutes.
pub fn default_rules() -> Vec<BackoffRule> {
    vec![
        BackoffRule::new(5, Some(3)),
        BackoffRule::new(30, Some(5)),
        BackoffRule::new(120, None),
    ]
}

impl ReconnectPolicy for BackoffSchedule {
    fn next_delay(&self, attempt: u32) -> Option<Duration> {
        let mut remaining = attempt;
        for rule in &self.rules {
            match rule.repeat {
                None => return Some(Duration::from_secs(rule.delay_secs)),
                Some(n) if remaining < n => return Some(Duration::from_secs(rule.delay_secs)),
                Some(n) => remaining -= n,
            }
        }
        None
    }
}

/// Whether the live preferences allow an automatic reconnect right now.
pub fn reconnect_permitted(prefs: &dyn Preferences, network: &dyn NetworkMonitor) -> bool {
    if !prefs.reconnect_enabled() || !prefs.reconnect_on_connectivity_change() {
        return false;
    }
    !prefs.reconnect_wifi_required() || network.is_wifi()
}

/// Wraps a policy so it yields `None` whenever the user's preferences or the
/// current network forbid reconnecting.
pub struct PreferenceGatedPolicy<P> {
    inner: P,
    prefs: Arc<dyn Preferences>,
    network: Arc<dyn NetworkMonitor>,
}

impl<P: ReconnectPolicy> PreferenceGatedPolicy<P> {
    pub fn new(inner: P, prefs: Arc<dyn Preferences>, network: Arc<dyn NetworkMonitor>) -> Self {
        Self {
            inner,
            prefs,
            network,
        }
    }
}

impl<P: ReconnectPolicy> ReconnectPolicy for PreferenceGatedPolicy<P> {
    fn next_delay(&self, attempt: u32) -> Option<Duration> {
        if !reconnect_permitted(self.prefs.as_ref(), self.network.as_ref()) {
            return None;
        }
        self.inner.next_delay(attempt)
    }
}
