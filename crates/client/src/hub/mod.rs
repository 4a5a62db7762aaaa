//! Event hub: one reconnecting push connection shared by every subscriber.
//!
//! # Architecture
//!
//! ```text
//!   subscribe()/Subscription::unsubscribe()
//!                  │
//!                  ▼
//!   ┌─────────────────────────────┐      ┌──────────────────┐
//!   │          EventHub           │─────▶│ TransportFactory │
//!   │ registry ─ health ─ timers  │◀─────│ (PushConnection) │
//!   └─────────────────────────────┘      └──────────────────┘
//!        │ matching envelopes              TransportEvents
//!        ▼
//!   listeners (registration order)
//! ```
//!
//! The connection is opened lazily by the first subscription and closed
//! when the last one goes away. Failures and heartbeat timeouts feed the
//! backoff table in [`HubConfig`]; running past the end of the table puts
//! the hub into degraded mode so callers can fall back to polling.
//!
//! State changes happen under a short synchronous lock that is never held
//! while listeners or hooks run, so callbacks may call back into the hub.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Weak};

use draftsync_shared::EventEnvelope;
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

use crate::clock::{system_clock, Clock};
use crate::error::HubError;

mod config;
mod connection;
mod health;
mod registry;

pub use config::HubConfig;
pub use connection::{
    AuthTokenSource, ConnectInit, ConnectionPhase, PushConnection, StaticToken, TransportEvents,
    TransportFactory, WebSocketTransport,
};
pub use health::{HealthChange, HealthMonitor, HealthState, HealthStatus};
pub use registry::{Listener, SubscriptionId, SubscriptionRegistry, SubscriptionScope};

pub type HealthHook = Arc<dyn Fn(HealthStatus) + Send + Sync>;
pub type FallbackHook = Arc<dyn Fn(bool) + Send + Sync>;

/// Builder for [`EventHub`].
pub struct EventHubBuilder {
    config: HubConfig,
    factory: Arc<dyn TransportFactory>,
    auth: Arc<dyn AuthTokenSource>,
    clock: Clock,
    health_hooks: Vec<HealthHook>,
    fallback_hooks: Vec<FallbackHook>,
}

impl EventHubBuilder {
    pub fn auth_token(mut self, source: impl AuthTokenSource + 'static) -> Self {
        self.auth = Arc::new(source);
        self
    }

    pub fn clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    pub fn on_health_change(mut self, hook: impl Fn(HealthStatus) + Send + Sync + 'static) -> Self {
        self.health_hooks.push(Arc::new(hook));
        self
    }

    pub fn on_fallback_change(mut self, hook: impl Fn(bool) + Send + Sync + 'static) -> Self {
        self.fallback_hooks.push(Arc::new(hook));
        self
    }

    /// Validate the configuration and bind the hub to the current tokio
    /// runtime. No connection is opened until the first subscription.
    pub fn build(self) -> Result<EventHub, HubError> {
        self.config.validate()?;
        let runtime = Handle::try_current().map_err(|_| HubError::NoRuntime)?;

        let shared = Arc::new(HubShared {
            config: self.config,
            factory: self.factory,
            auth: self.auth,
            clock: self.clock,
            runtime,
            state: Mutex::new(HubState {
                enabled: true,
                shut_down: false,
                registry: SubscriptionRegistry::new(),
                health: HealthMonitor::new(),
                generation: 0,
                phase: ConnectionPhase::Idle,
                connection: None,
                retry_timer: None,
                heartbeat_timer: None,
                last_event_id: None,
                health_hooks: self.health_hooks,
                fallback_hooks: self.fallback_hooks,
            }),
        });
        Ok(EventHub { shared })
    }
}

/// Multiplexes subscriptions over a single push connection.
///
/// Cloning is cheap; clones share the same connection and subscriptions.
#[derive(Clone)]
pub struct EventHub {
    shared: Arc<HubShared>,
}

impl EventHub {
    pub fn builder(config: HubConfig, factory: Arc<dyn TransportFactory>) -> EventHubBuilder {
        EventHubBuilder {
            config,
            factory,
            auth: Arc::new(StaticToken::default()),
            clock: system_clock(),
            health_hooks: Vec::new(),
            fallback_hooks: Vec::new(),
        }
    }

    /// Register `listener` for envelopes matching `scope`. The first live
    /// subscription opens the connection; envelopes emitted before it is
    /// open are missed.
    pub fn subscribe(
        &self,
        scope: SubscriptionScope,
        listener: impl Fn(&EventEnvelope) + Send + Sync + 'static,
    ) -> Subscription {
        let mut state = self.shared.state.lock();
        if state.shut_down {
            drop(state);
            tracing::debug!(scope = %scope, "subscribe after shutdown ignored");
            drop(listener);
            return Subscription::inert();
        }

        tracing::debug!(scope = %scope, "subscribing");
        let id = state.registry.insert(scope, Arc::new(listener));
        self.shared.ensure_connected(&mut state);

        Subscription {
            id: Some(id),
            hub: Arc::downgrade(&self.shared),
        }
    }

    pub fn on_health_change(&self, hook: impl Fn(HealthStatus) + Send + Sync + 'static) {
        self.shared.state.lock().health_hooks.push(Arc::new(hook));
    }

    pub fn on_fallback_change(&self, hook: impl Fn(bool) + Send + Sync + 'static) {
        self.shared.state.lock().fallback_hooks.push(Arc::new(hook));
    }

    pub fn health_state(&self) -> HealthState {
        self.shared.state.lock().health.snapshot()
    }

    pub fn is_enabled(&self) -> bool {
        self.shared.state.lock().enabled
    }

    /// Disabling closes the connection and suppresses reconnects until the
    /// hub is enabled again.
    pub fn set_enabled(&self, enabled: bool) {
        let mut state = self.shared.state.lock();
        if state.enabled == enabled {
            return;
        }
        state.enabled = enabled;
        tracing::info!(enabled, "push channel toggled");
        if enabled {
            self.shared.ensure_connected(&mut state);
        } else {
            self.shared.teardown(&mut state);
        }
    }

    /// Drop the current connection and any pending retry, restart the
    /// backoff and open again right away.
    pub fn force_reconnect(&self) {
        let mut state = self.shared.state.lock();
        if state.shut_down {
            return;
        }
        tracing::info!("forcing reconnect");
        self.shared.teardown(&mut state);
        state.health.reset_retries();
        self.shared.ensure_connected(&mut state);
    }

    /// Close the connection, drop all subscriptions and cancel timers.
    /// Safe to call repeatedly.
    pub fn shutdown(&self) {
        let released = {
            let mut state = self.shared.state.lock();
            if state.shut_down {
                return;
            }
            tracing::info!(subscriptions = state.registry.len(), "shutting down event hub");
            state.shut_down = true;
            self.shared.teardown(&mut state);
            state.registry.clear()
        };
        // Listener closures may own subscriptions; drop them unlocked.
        drop(released);
    }

    pub fn subscription_count(&self) -> usize {
        self.shared.state.lock().registry.len()
    }

    pub fn is_connected(&self) -> bool {
        self.shared.state.lock().phase.is_connected()
    }

    pub fn phase(&self) -> ConnectionPhase {
        self.shared.state.lock().phase
    }
}

/// Handle returned by [`EventHub::subscribe`]. Dropping it unsubscribes.
#[must_use = "dropping a Subscription unsubscribes it immediately"]
pub struct Subscription {
    id: Option<SubscriptionId>,
    hub: Weak<HubShared>,
}

impl Subscription {
    fn inert() -> Self {
        Self {
            id: None,
            hub: Weak::new(),
        }
    }

    pub fn id(&self) -> Option<SubscriptionId> {
        self.id
    }

    /// Takes effect immediately, including for an envelope that is being
    /// dispatched right now: listeners not yet reached are skipped.
    pub fn unsubscribe(mut self) {
        self.release();
    }

    fn release(&mut self) {
        let Some(id) = self.id.take() else { return };
        if let Some(hub) = self.hub.upgrade() {
            hub.remove_subscription(id);
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}

pub(crate) struct HubShared {
    config: HubConfig,
    factory: Arc<dyn TransportFactory>,
    auth: Arc<dyn AuthTokenSource>,
    clock: Clock,
    runtime: Handle,
    state: Mutex<HubState>,
}

struct HubState {
    enabled: bool,
    shut_down: bool,
    registry: SubscriptionRegistry,
    health: HealthMonitor,
    /// Bumped whenever the current connection is abandoned. Anything tagged
    /// with an older generation is stale.
    generation: u64,
    phase: ConnectionPhase,
    connection: Option<Box<dyn PushConnection>>,
    retry_timer: Option<JoinHandle<()>>,
    heartbeat_timer: Option<JoinHandle<()>>,
    last_event_id: Option<String>,
    health_hooks: Vec<HealthHook>,
    fallback_hooks: Vec<FallbackHook>,
}

/// Hook invocations collected under the lock and run after it is released.
struct PendingHooks {
    change: HealthChange,
    health_hooks: Vec<HealthHook>,
    fallback_hooks: Vec<FallbackHook>,
}

impl PendingHooks {
    fn collect(change: HealthChange, state: &HubState) -> Option<Self> {
        if change.is_empty() {
            return None;
        }
        if let Some(status) = change.status {
            tracing::info!(status = %status, retry_attempt = state.health.retry_attempt(), "push health changed");
        }
        if let Some(active) = change.fallback_active {
            tracing::warn!(fallback_active = active, "push fallback mode changed");
        }
        Some(Self {
            change,
            health_hooks: state.health_hooks.clone(),
            fallback_hooks: state.fallback_hooks.clone(),
        })
    }

    fn fire(self) {
        if let Some(status) = self.change.status {
            for hook in &self.health_hooks {
                hook(status);
            }
        }
        if let Some(active) = self.change.fallback_active {
            for hook in &self.fallback_hooks {
                hook(active);
            }
        }
    }
}

impl HubShared {
    fn ensure_connected(self: &Arc<Self>, state: &mut HubState) {
        if state.shut_down
            || !state.enabled
            || state.registry.is_empty()
            || state.phase != ConnectionPhase::Idle
            || state.retry_timer.is_some()
        {
            return;
        }
        self.begin_open(state);
    }

    fn begin_open(self: &Arc<Self>, state: &mut HubState) {
        state.generation += 1;
        state.phase = ConnectionPhase::Connecting;
        let generation = state.generation;
        let last_event_id = state.last_event_id.clone();

        tracing::debug!(generation, attempt = state.health.retry_attempt(), "opening push connection");
        self.arm_heartbeat(state, generation);

        let hub = Arc::downgrade(self);
        let auth = Arc::clone(&self.auth);
        self.runtime.spawn(async move {
            let auth_token = auth.auth_token().await;
            let Some(hub) = hub.upgrade() else { return };
            hub.finish_open(generation, ConnectInit {
                auth_token,
                last_event_id,
            });
        });
    }

    fn finish_open(self: &Arc<Self>, generation: u64, init: ConnectInit) {
        {
            let state = self.state.lock();
            if state.generation != generation || !state.phase.is_connecting() {
                return;
            }
        }

        // The factory may report synchronously, so it runs without the lock.
        let events = TransportEvents::new(Arc::downgrade(self), generation);
        let mut connection = self.factory.connect(&self.config.url, init, events);

        let mut state = self.state.lock();
        if state.generation == generation {
            state.connection = Some(connection);
        } else {
            drop(state);
            connection.close();
        }
    }

    /// Cancel timers, close the connection and invalidate its generation.
    /// Health is left untouched.
    fn teardown(&self, state: &mut HubState) {
        state.generation += 1;
        state.phase = ConnectionPhase::Idle;
        if let Some(timer) = state.retry_timer.take() {
            timer.abort();
        }
        if let Some(timer) = state.heartbeat_timer.take() {
            timer.abort();
        }
        if let Some(mut connection) = state.connection.take() {
            connection.close();
        }
    }

    fn arm_heartbeat(self: &Arc<Self>, state: &mut HubState, generation: u64) {
        if let Some(timer) = state.heartbeat_timer.take() {
            timer.abort();
        }
        let hub = Arc::downgrade(self);
        let timeout = self.config.heartbeat_timeout();
        state.heartbeat_timer = Some(self.runtime.spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(hub) = hub.upgrade() {
                hub.handle_failure(generation, "heartbeat timeout");
            }
        }));
    }

    fn schedule_retry(self: &Arc<Self>, state: &mut HubState) {
        let attempt = state.health.retry_attempt();
        let delay = self.config.retry_delay(attempt);
        let generation = state.generation;
        tracing::info!(attempt, delay_ms = delay.as_millis() as u64, "scheduling push reconnect");

        if let Some(timer) = state.retry_timer.take() {
            timer.abort();
        }
        let hub = Arc::downgrade(self);
        state.retry_timer = Some(self.runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(hub) = hub.upgrade() {
                hub.retry_due(generation);
            }
        }));
    }

    fn retry_due(self: &Arc<Self>, generation: u64) {
        let mut state = self.state.lock();
        if state.generation != generation {
            return;
        }
        state.retry_timer = None;
        self.ensure_connected(&mut state);
    }

    fn remove_subscription(self: &Arc<Self>, id: SubscriptionId) {
        let released = {
            let mut state = self.state.lock();
            let Some(listener) = state.registry.remove(id) else {
                return;
            };
            if state.registry.is_empty() {
                tracing::debug!("last subscription released, closing push connection");
                self.teardown(&mut state);
            }
            listener
        };
        drop(released);
    }

    pub(crate) fn handle_opened(self: &Arc<Self>, generation: u64) {
        let hooks = {
            let mut state = self.state.lock();
            if state.generation != generation || state.phase.is_connected() {
                return;
            }
            self.mark_open(&mut state, generation)
        };
        if let Some(hooks) = hooks {
            hooks.fire();
        }
    }

    fn mark_open(self: &Arc<Self>, state: &mut HubState, generation: u64) -> Option<PendingHooks> {
        tracing::info!(generation, "push connection open");
        state.phase = ConnectionPhase::Open;
        self.arm_heartbeat(state, generation);
        let change = state.health.record_connected();
        PendingHooks::collect(change, state)
    }

    pub(crate) fn handle_frame(self: &Arc<Self>, generation: u64, frame: &str) {
        match EventEnvelope::from_json(frame) {
            Ok(envelope) => self.handle_envelope(generation, envelope),
            Err(e) => {
                tracing::warn!(generation, kind = e.kind(), error = %e, "dropping push frame");
            }
        }
    }

    pub(crate) fn handle_envelope(self: &Arc<Self>, generation: u64, envelope: EventEnvelope) {
        let (listeners, hooks) = {
            let mut state = self.state.lock();
            if state.generation != generation {
                return;
            }
            // A frame proves the connection works even if the transport
            // never reported the open explicitly.
            let hooks = if state.phase.is_connected() {
                self.arm_heartbeat(&mut state, generation);
                None
            } else {
                self.mark_open(&mut state, generation)
            };

            let now = (self.clock)();
            state.health.record_envelope(envelope.kind, now);
            state.last_event_id = Some(envelope.resume_token().to_string());
            (state.registry.matching(&envelope), hooks)
        };

        if let Some(hooks) = hooks {
            hooks.fire();
        }

        for (id, listener) in listeners {
            // an earlier listener may have unsubscribed this one
            if !self.state.lock().registry.contains(id) {
                continue;
            }
            if catch_unwind(AssertUnwindSafe(|| listener(&envelope))).is_err() {
                tracing::warn!(
                    topic = %envelope.topic,
                    envelope_id = %envelope.id,
                    "push listener panicked; continuing delivery"
                );
            }
        }
    }

    pub(crate) fn handle_failure(self: &Arc<Self>, generation: u64, reason: &str) {
        let hooks = {
            let mut state = self.state.lock();
            if state.generation != generation || state.shut_down {
                return;
            }
            self.teardown(&mut state);
            let change = state.health.record_failure(self.config.backoff_len());
            tracing::warn!(
                generation,
                reason,
                retry_attempt = state.health.retry_attempt(),
                "push connection failed"
            );
            if state.enabled && !state.registry.is_empty() {
                self.schedule_retry(&mut state);
            }
            PendingHooks::collect(change, &state)
        };
        if let Some(hooks) = hooks {
            hooks.fire();
        }
    }
}
