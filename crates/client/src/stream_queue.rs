//! Per-section admission control for AI generation streams.
//!
//! Each section runs at most one stream at a time and keeps at most one
//! request waiting behind it. A newer request displaces the waiting one;
//! finishing or cancelling the running stream promotes the waiting one.
//!
//! ```text
//!   enqueue ──▶ [active] ──complete/cancel──▶ promote [pending] ──▶ [active]
//!                   │
//!   enqueue ──▶ [pending] ◀── enqueue displaces (on_cancel: replaced_by_new_request)
//! ```
//!
//! Cancellation is purely local bookkeeping: telling the server to stop a
//! stream is the caller's job.

use std::collections::{BTreeMap, HashMap};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::str::FromStr;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::clock::{system_clock, Clock};

/// Why a session was terminated early. Passed through to the cancel hook
/// verbatim.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum CancelReason {
    AuthorCancelled,
    ReplacedByNewRequest,
    TransportFailure,
    Deferred,
}

impl CancelReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            CancelReason::AuthorCancelled => "author_cancelled",
            CancelReason::ReplacedByNewRequest => "replaced_by_new_request",
            CancelReason::TransportFailure => "transport_failure",
            CancelReason::Deferred => "deferred",
        }
    }
}

impl std::fmt::Display for CancelReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CancelReason {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "author_cancelled" => Ok(CancelReason::AuthorCancelled),
            "replaced_by_new_request" => Ok(CancelReason::ReplacedByNewRequest),
            "transport_failure" => Ok(CancelReason::TransportFailure),
            "deferred" => Ok(CancelReason::Deferred),
            other => Err(format!("unknown cancel reason: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Active,
    Pending,
}

/// A caller asking to start streaming into a section.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct StreamRequest {
    pub session_id: String,
    pub section_id: String,
    pub enqueued_at: i64,
}

impl StreamRequest {
    pub fn new(
        session_id: impl Into<String>,
        section_id: impl Into<String>,
        enqueued_at: i64,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            section_id: section_id.into(),
            enqueued_at,
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ActiveSession {
    pub session_id: String,
    pub section_id: String,
    pub enqueued_at: i64,
    pub started_at: i64,
    /// Number of running streams when this one started, itself included.
    /// Advisory only; not a stable lane id.
    pub concurrency_slot: usize,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PendingSession {
    pub session_id: String,
    pub section_id: String,
    pub enqueued_at: i64,
}

/// A session that just moved into the active slot.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Activation {
    pub session_id: String,
    pub section_id: String,
    pub concurrency_slot: usize,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(tag = "disposition", rename_all = "snake_case")]
pub enum EnqueueResult {
    #[serde(rename_all = "camelCase")]
    Started {
        session_id: String,
        section_id: String,
        concurrency_slot: usize,
        /// Always `None`: starting never displaces anything. Kept so both
        /// dispositions serialize with the same fields.
        replaced_session_id: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    Pending {
        session_id: String,
        section_id: String,
        replaced_session_id: Option<String>,
    },
}

impl EnqueueResult {
    pub fn session_id(&self) -> &str {
        match self {
            EnqueueResult::Started { session_id, .. } | EnqueueResult::Pending { session_id, .. } => {
                session_id
            }
        }
    }

    pub fn is_started(&self) -> bool {
        matches!(self, EnqueueResult::Started { .. })
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CompleteResult {
    pub session_id: String,
    pub section_id: String,
    pub activated: Option<Activation>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CancelResult {
    pub released: bool,
    pub reason: CancelReason,
    pub promoted: Option<Activation>,
}

/// Passed to the cancel hook for every session terminated early.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CancelDetails {
    pub session_id: String,
    pub section_id: String,
    pub reason: CancelReason,
    pub state: SessionState,
}

/// Owned copy of the queue contents, keyed by section id.
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct QueueSnapshot {
    pub active: BTreeMap<String, ActiveSession>,
    pub pending: BTreeMap<String, PendingSession>,
}

pub type CancelHook = Arc<dyn Fn(CancelDetails) + Send + Sync>;

#[derive(Default)]
struct QueueState {
    active: HashMap<String, ActiveSession>,
    pending: HashMap<String, PendingSession>,
    /// session id -> (section id, where it lives)
    sessions: HashMap<String, (String, SessionState)>,
}

impl QueueState {
    fn start(&mut self, session_id: String, section_id: String, enqueued_at: i64, now: i64) -> Activation {
        let concurrency_slot = self.active.len() + 1;
        self.sessions
            .insert(session_id.clone(), (section_id.clone(), SessionState::Active));
        self.active.insert(
            section_id.clone(),
            ActiveSession {
                session_id: session_id.clone(),
                section_id: section_id.clone(),
                enqueued_at,
                started_at: now,
                concurrency_slot,
            },
        );
        Activation {
            session_id,
            section_id,
            concurrency_slot,
        }
    }

    fn promote(&mut self, section_id: &str, now: i64) -> Option<Activation> {
        let pending = self.pending.remove(section_id)?;
        Some(self.start(pending.session_id, pending.section_id, pending.enqueued_at, now))
    }

    /// Current disposition of an already tracked session.
    fn disposition_of(&self, session_id: &str) -> Option<EnqueueResult> {
        let (section_id, state) = self.sessions.get(session_id)?;
        Some(match state {
            SessionState::Active => EnqueueResult::Started {
                session_id: session_id.to_string(),
                section_id: section_id.clone(),
                concurrency_slot: self.active.get(section_id)?.concurrency_slot,
                replaced_session_id: None,
            },
            SessionState::Pending => EnqueueResult::Pending {
                session_id: session_id.to_string(),
                section_id: section_id.clone(),
                replaced_session_id: None,
            },
        })
    }
}

/// Admission queue allowing one active and one pending stream per section.
pub struct SectionStreamQueue {
    state: Mutex<QueueState>,
    on_cancel: Option<CancelHook>,
    clock: Clock,
}

impl Default for SectionStreamQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl SectionStreamQueue {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            on_cancel: None,
            clock: system_clock(),
        }
    }

    /// Called for every session the queue terminates early, after the
    /// queue state has been updated.
    pub fn with_cancel_hook(mut self, hook: impl Fn(CancelDetails) + Send + Sync + 'static) -> Self {
        self.on_cancel = Some(Arc::new(hook));
        self
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    /// Admit a request. Never fails: the request either starts right away
    /// or waits behind the section's running stream, displacing any
    /// request that was already waiting.
    pub fn enqueue(&self, request: StreamRequest) -> EnqueueResult {
        let StreamRequest {
            session_id,
            section_id,
            enqueued_at,
        } = request;

        let (result, displaced) = {
            let mut state = self.state.lock();

            if let Some(existing) = state.disposition_of(&session_id) {
                tracing::debug!(session_id = %session_id, "stream already tracked, enqueue ignored");
                return existing;
            }

            if !state.active.contains_key(&section_id) {
                let activation = state.start(session_id, section_id, enqueued_at, (self.clock)());
                tracing::debug!(
                    session_id = %activation.session_id,
                    section_id = %activation.section_id,
                    slot = activation.concurrency_slot,
                    "stream started"
                );
                let result = EnqueueResult::Started {
                    session_id: activation.session_id,
                    section_id: activation.section_id,
                    concurrency_slot: activation.concurrency_slot,
                    replaced_session_id: None,
                };
                (result, None)
            } else {
                let displaced = state.pending.remove(&section_id);
                if let Some(old) = &displaced {
                    state.sessions.remove(&old.session_id);
                }
                state
                    .sessions
                    .insert(session_id.clone(), (section_id.clone(), SessionState::Pending));
                state.pending.insert(
                    section_id.clone(),
                    PendingSession {
                        session_id: session_id.clone(),
                        section_id: section_id.clone(),
                        enqueued_at,
                    },
                );
                tracing::debug!(
                    session_id = %session_id,
                    section_id = %section_id,
                    displaced = displaced.as_ref().map(|d| d.session_id.as_str()),
                    "stream queued behind active session"
                );
                let result = EnqueueResult::Pending {
                    session_id,
                    section_id,
                    replaced_session_id: displaced.as_ref().map(|d| d.session_id.clone()),
                };
                (result, displaced)
            }
        };

        if let Some(old) = displaced {
            self.notify_cancel(CancelDetails {
                session_id: old.session_id,
                section_id: old.section_id,
                reason: CancelReason::ReplacedByNewRequest,
                state: SessionState::Pending,
            });
        }
        result
    }

    /// Finish the active session `session_id`. Returns `None` if it is not
    /// the active session of its section, e.g. because a cancel already
    /// released it.
    pub fn complete(&self, session_id: &str) -> Option<CompleteResult> {
        let mut state = self.state.lock();
        let section_id = match state.sessions.get(session_id) {
            Some((section_id, SessionState::Active)) => section_id.clone(),
            _ => return None,
        };
        state.sessions.remove(session_id);
        state.active.remove(&section_id);

        let activated = state.promote(&section_id, (self.clock)());
        tracing::debug!(
            session_id,
            section_id = %section_id,
            promoted = activated.as_ref().map(|a| a.session_id.as_str()),
            "stream completed"
        );
        Some(CompleteResult {
            session_id: session_id.to_string(),
            section_id,
            activated,
        })
    }

    /// Release `session_id` wherever it is tracked. Cancelling the active
    /// session promotes the section's pending one.
    pub fn cancel(&self, session_id: &str, reason: CancelReason) -> CancelResult {
        let (details, promoted) = {
            let mut state = self.state.lock();
            let Some((section_id, session_state)) = state.sessions.remove(session_id) else {
                return CancelResult {
                    released: false,
                    reason,
                    promoted: None,
                };
            };

            let promoted = match session_state {
                SessionState::Pending => {
                    state.pending.remove(&section_id);
                    None
                }
                SessionState::Active => {
                    state.active.remove(&section_id);
                    state.promote(&section_id, (self.clock)())
                }
            };
            tracing::debug!(
                session_id,
                section_id = %section_id,
                reason = %reason,
                promoted = promoted.as_ref().map(|a| a.session_id.as_str()),
                "stream cancelled"
            );
            let details = CancelDetails {
                session_id: session_id.to_string(),
                section_id,
                reason,
                state: session_state,
            };
            (details, promoted)
        };

        self.notify_cancel(details);
        CancelResult {
            released: true,
            reason,
            promoted,
        }
    }

    pub fn snapshot(&self) -> QueueSnapshot {
        let state = self.state.lock();
        QueueSnapshot {
            active: state
                .active
                .iter()
                .map(|(section, session)| (section.clone(), session.clone()))
                .collect(),
            pending: state
                .pending
                .iter()
                .map(|(section, session)| (section.clone(), session.clone()))
                .collect(),
        }
    }

    pub fn state_of(&self, session_id: &str) -> Option<SessionState> {
        self.state.lock().sessions.get(session_id).map(|(_, state)| *state)
    }

    pub fn active_count(&self) -> usize {
        self.state.lock().active.len()
    }

    pub fn pending_count(&self) -> usize {
        self.state.lock().pending.len()
    }

    /// The queue has already moved on when the hook runs, so a panicking
    /// hook is logged and swallowed rather than losing the caller's result.
    fn notify_cancel(&self, details: CancelDetails) {
        let Some(hook) = &self.on_cancel else { return };
        let session_id = details.session_id.clone();
        let reason = details.reason;
        if catch_unwind(AssertUnwindSafe(|| hook(details))).is_err() {
            tracing::warn!(session_id = %session_id, reason = %reason, "stream cancel hook panicked");
        }
    }
}
