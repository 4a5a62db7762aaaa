//! Push transport seam.
//!
//! The hub never talks to a socket directly. A [`TransportFactory`] opens a
//! [`PushConnection`] and reports what happens on it through the
//! [`TransportEvents`] handle it was given. Events carry the generation of
//! the attempt that produced them, so reports from a connection the hub has
//! already abandoned are dropped.

use std::sync::Weak;

use async_trait::async_trait;
use draftsync_shared::EventEnvelope;

use super::HubShared;

mod websocket;

pub use websocket::WebSocketTransport;

/// Lifecycle of the hub's single connection slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionPhase {
    /// No connection and no attempt in flight.
    Idle,
    /// Waiting for the auth token or for the transport to report open.
    Connecting,
    Open,
}

impl ConnectionPhase {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionPhase::Open)
    }

    pub fn is_connecting(&self) -> bool {
        matches!(self, ConnectionPhase::Connecting)
    }
}

/// Extra data handed to the transport for each attempt.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectInit {
    pub auth_token: Option<String>,
    /// Resume hint from the last envelope seen. Best effort only.
    pub last_event_id: Option<String>,
}

/// Opens push connections.
pub trait TransportFactory: Send + Sync {
    fn connect(
        &self,
        url: &str,
        init: ConnectInit,
        events: TransportEvents,
    ) -> Box<dyn PushConnection>;
}

/// An open (or opening) push connection.
pub trait PushConnection: Send {
    /// Close the connection. Called with the hub's state locked, so it must
    /// not report back synchronously. Late reports after closing are
    /// harmless.
    fn close(&mut self);
}

/// Supplies the bearer token for each connection attempt.
#[async_trait]
pub trait AuthTokenSource: Send + Sync {
    async fn auth_token(&self) -> Option<String>;
}

/// Fixed token, or no token at all.
#[derive(Debug, Clone, Default)]
pub struct StaticToken(pub Option<String>);

#[async_trait]
impl AuthTokenSource for StaticToken {
    async fn auth_token(&self) -> Option<String> {
        self.0.clone()
    }
}

/// Handle a transport uses to report back to the hub that opened it.
#[derive(Clone)]
pub struct TransportEvents {
    hub: Weak<HubShared>,
    generation: u64,
}

impl TransportEvents {
    pub(crate) fn new(hub: Weak<HubShared>, generation: u64) -> Self {
        Self { hub, generation }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// The connection is established.
    pub fn opened(&self) {
        if let Some(hub) = self.hub.upgrade() {
            hub.handle_opened(self.generation);
        }
    }

    /// A raw text frame arrived.
    pub fn message(&self, frame: &str) {
        if let Some(hub) = self.hub.upgrade() {
            hub.handle_frame(self.generation, frame);
        }
    }

    /// An already decoded envelope arrived.
    pub fn envelope(&self, envelope: EventEnvelope) {
        if let Some(hub) = self.hub.upgrade() {
            hub.handle_envelope(self.generation, envelope);
        }
    }

    /// The remote side closed the connection.
    pub fn closed(&self) {
        if let Some(hub) = self.hub.upgrade() {
            hub.handle_failure(self.generation, "connection closed by remote");
        }
    }

    /// The connection failed or could not be established.
    pub fn failed(&self, reason: &str) {
        if let Some(hub) = self.hub.upgrade() {
            hub.handle_failure(self.generation, reason);
        }
    }
}

impl std::fmt::Debug for TransportEvents {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportEvents")
            .field("generation", &self.generation)
            .finish()
    }
}
