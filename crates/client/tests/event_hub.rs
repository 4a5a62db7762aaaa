use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use draftsync_client::{
    topics, ConnectInit, EnvelopeKind, EventEnvelope, EventHub, HealthStatus, HubConfig,
    PushConnection, StaticToken, SubscriptionScope, TransportEvents, TransportFactory,
};
use parking_lot::Mutex;

#[derive(Default)]
struct Recorder {
    attempts: Mutex<Vec<(ConnectInit, TransportEvents, Arc<AtomicBool>)>>,
}

struct Handle(Arc<AtomicBool>);

impl PushConnection for Handle {
    fn close(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

impl TransportFactory for Recorder {
    fn connect(
        &self,
        _url: &str,
        init: ConnectInit,
        events: TransportEvents,
    ) -> Box<dyn PushConnection> {
        let closed = Arc::new(AtomicBool::new(false));
        self.attempts
            .lock()
            .push((init, events, Arc::clone(&closed)));
        Box::new(Handle(closed))
    }
}

impl Recorder {
    fn events(&self) -> TransportEvents {
        self.attempts.lock().last().unwrap().1.clone()
    }

    fn init(&self) -> ConnectInit {
        self.attempts.lock().last().unwrap().0.clone()
    }

    fn count(&self) -> usize {
        self.attempts.lock().len()
    }
}

fn envelope(id: &str, topic: &str, resource: &str) -> String {
    serde_json::json!({
        "id": id,
        "topic": topic,
        "resourceId": resource,
        "workspaceId": "ws-1",
        "sequence": 3,
        "kind": "event",
        "payload": { "status": "ready" },
        "emittedAt": Utc::now(),
    })
    .to_string()
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}

#[tokio::test(start_paused = true)]
async fn document_and_section_listeners_share_a_connection() {
    let transport = Arc::new(Recorder::default());
    let hub = EventHub::builder(
        HubConfig {
            url: "ws://push.test/events".to_string(),
            retry_delays_ms: vec![10, 20],
            heartbeat_timeout_ms: 60_000,
        },
        transport.clone(),
    )
    .auth_token(StaticToken(Some("tok".to_string())))
    .build()
    .unwrap();

    let docs = Arc::new(Mutex::new(Vec::new()));
    let sections = Arc::new(Mutex::new(Vec::new()));
    let _docs_sub = {
        let docs = Arc::clone(&docs);
        hub.subscribe(
            SubscriptionScope::topic(topics::DOCUMENT_LIFECYCLE),
            move |e: &EventEnvelope| docs.lock().push(e.id.clone()),
        )
    };
    let sections_sub = {
        let sections = Arc::clone(&sections);
        hub.subscribe(
            SubscriptionScope::resource(topics::SECTION_STREAM, "sec-1"),
            move |e: &EventEnvelope| sections.lock().push(e.id.clone()),
        )
    };
    settle().await;
    assert_eq!(transport.count(), 1);
    assert_eq!(transport.init().auth_token.as_deref(), Some("tok"));

    let events = transport.events();
    events.opened();
    assert!(hub.is_connected());
    events.message(&envelope("e1", topics::DOCUMENT_LIFECYCLE, "doc-1"));
    events.message(&envelope("e2", topics::SECTION_STREAM, "sec-1"));
    events.message(&envelope("e3", topics::SECTION_STREAM, "sec-2"));
    events.message("{ not json");

    assert_eq!(*docs.lock(), vec!["e1"]);
    assert_eq!(*sections.lock(), vec!["e2"]);
    assert_eq!(hub.health_state().status, HealthStatus::Healthy);
    assert!(hub.health_state().last_event_at.is_some());

    sections_sub.unsubscribe();
    assert_eq!(hub.subscription_count(), 1);
    assert!(hub.is_connected());
}

#[tokio::test(start_paused = true)]
async fn exhausted_backoff_enables_polling_fallback_until_reconnect() {
    let transport = Arc::new(Recorder::default());
    let fallback = Arc::new(Mutex::new(Vec::new()));
    let hub = {
        let fallback = Arc::clone(&fallback);
        EventHub::builder(
            HubConfig {
                url: "ws://push.test/events".to_string(),
                retry_delays_ms: vec![10],
                heartbeat_timeout_ms: 60_000,
            },
            transport.clone(),
        )
        .on_fallback_change(move |active| fallback.lock().push(active))
        .build()
        .unwrap()
    };

    let _sub = hub.subscribe(SubscriptionScope::topic(topics::QUALITY_GATE), |_| {});
    settle().await;
    transport.events().opened();
    transport
        .events()
        .message(&envelope("q1", topics::QUALITY_GATE, "doc-1"));

    transport.events().failed("reset");
    assert_eq!(hub.health_state().status, HealthStatus::Recovering);
    tokio::time::sleep(Duration::from_millis(11)).await;
    assert_eq!(transport.count(), 2);
    assert_eq!(transport.init().last_event_id.as_deref(), Some("q1"));

    transport.events().failed("reset");
    assert_eq!(hub.health_state().status, HealthStatus::Degraded);
    assert_eq!(*fallback.lock(), vec![true]);

    tokio::time::sleep(Duration::from_millis(11)).await;
    assert_eq!(transport.count(), 3);
    transport.events().opened();
    assert_eq!(hub.health_state().status, HealthStatus::Healthy);
    assert_eq!(*fallback.lock(), vec![true, false]);

    hub.shutdown();
    assert!(transport.attempts.lock()[2].2.load(Ordering::SeqCst));
    assert_eq!(hub.subscription_count(), 0);
}

#[test]
fn heartbeat_frames_decode() {
    let raw = serde_json::json!({
        "id": "h1",
        "topic": topics::REVIEW_ACTIVITY,
        "workspaceId": "ws-1",
        "sequence": 0,
        "kind": "heartbeat",
        "emittedAt": Utc::now(),
    })
    .to_string();
    let envelope = EventEnvelope::from_json(&raw).unwrap();
    assert_eq!(envelope.kind, EnvelopeKind::Heartbeat);
    assert!(envelope.is_heartbeat());
}
