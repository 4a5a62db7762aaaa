//! draftsync client real-time layer.
//!
//! Two independent pieces:
//!
//! - [`EventHub`]: one reconnecting push connection multiplexed across
//!   topic/resource subscriptions, with health tracking and a polling
//!   fallback signal.
//! - [`SectionStreamQueue`]: per-section admission control for AI
//!   generation streams.

pub mod clock;
pub mod error;
pub mod hub;
pub mod stream_queue;

pub use clock::{fixed_clock, system_clock, Clock};
pub use error::{ConfigError, HubError};
pub use hub::{
    AuthTokenSource, ConnectInit, ConnectionPhase, EventHub, EventHubBuilder, HealthState,
    HealthStatus, HubConfig, PushConnection, StaticToken, Subscription, SubscriptionId,
    SubscriptionScope, TransportEvents, TransportFactory, WebSocketTransport,
};
pub use stream_queue::{
    Activation, CancelDetails, CancelReason, CancelResult, CompleteResult, EnqueueResult,
    QueueSnapshot, SectionStreamQueue, SessionState, StreamRequest,
};

pub use draftsync_shared::{topics, EventEnvelope, EnvelopeKind, ProtocolError};
