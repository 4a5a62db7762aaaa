//! Connection health bookkeeping.
//!
//! [`HealthMonitor`] is a plain state holder. It does not schedule anything;
//! the hub feeds it connection outcomes and relays the returned
//! [`HealthChange`] to the registered hooks.

use draftsync_shared::EnvelopeKind;
use serde::Serialize;

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Recovering,
    Degraded,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Recovering => "recovering",
            HealthStatus::Degraded => "degraded",
        }
    }
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Point-in-time copy of the hub's health.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct HealthState {
    pub status: HealthStatus,
    pub last_event_at: Option<i64>,
    pub last_heartbeat_at: Option<i64>,
    pub retry_attempt: u32,
    pub fallback_active: bool,
}

/// Value changes produced by a single transition. `None` means unchanged.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HealthChange {
    pub status: Option<HealthStatus>,
    pub fallback_active: Option<bool>,
}

impl HealthChange {
    pub fn is_empty(&self) -> bool {
        self.status.is_none() && self.fallback_active.is_none()
    }
}

#[derive(Debug)]
pub struct HealthMonitor {
    state: HealthState,
}

impl Default for HealthMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthMonitor {
    pub fn new() -> Self {
        Self {
            state: HealthState {
                status: HealthStatus::Healthy,
                last_event_at: None,
                last_heartbeat_at: None,
                retry_attempt: 0,
                fallback_active: false,
            },
        }
    }

    pub fn snapshot(&self) -> HealthState {
        self.state.clone()
    }

    pub fn status(&self) -> HealthStatus {
        self.state.status
    }

    pub fn retry_attempt(&self) -> u32 {
        self.state.retry_attempt
    }

    /// Record a connection error or heartbeat timeout. `backoff_len` is the
    /// number of configured retry delays; exceeding it degrades the channel.
    pub fn record_failure(&mut self, backoff_len: u32) -> HealthChange {
        self.state.retry_attempt = self.state.retry_attempt.saturating_add(1);

        let target = if self.state.retry_attempt > backoff_len {
            HealthStatus::Degraded
        } else if self.state.status == HealthStatus::Healthy {
            HealthStatus::Recovering
        } else {
            self.state.status
        };

        let mut change = self.set_status(target);
        if target == HealthStatus::Degraded {
            change.fallback_active = self.set_fallback(true);
        }
        change
    }

    /// Record a successful open, from any state.
    pub fn record_connected(&mut self) -> HealthChange {
        self.state.retry_attempt = 0;
        let mut change = self.set_status(HealthStatus::Healthy);
        change.fallback_active = self.set_fallback(false);
        change
    }

    pub fn record_envelope(&mut self, kind: EnvelopeKind, at: i64) {
        match kind {
            EnvelopeKind::Event => self.state.last_event_at = Some(at),
            EnvelopeKind::Heartbeat => self.state.last_heartbeat_at = Some(at),
        }
    }

    /// Manual reconnect: the backoff restarts but the status is left for
    /// the next open to settle.
    pub fn reset_retries(&mut self) {
        self.state.retry_attempt = 0;
    }

    fn set_status(&mut self, status: HealthStatus) -> HealthChange {
        if self.state.status == status {
            return HealthChange::default();
        }
        self.state.status = status;
        HealthChange {
            status: Some(status),
            fallback_active: None,
        }
    }

    fn set_fallback(&mut self, active: bool) -> Option<bool> {
        if self.state.fallback_active == active {
            return None;
        }
        self.state.fallback_active = active;
        Some(active)
    }
}
