use std::sync::Arc;

use draftsync_client::{
    fixed_clock, Activation, CancelReason, EnqueueResult, SectionStreamQueue, SessionState,
    StreamRequest,
};
use parking_lot::Mutex;

fn queue_with_log() -> (SectionStreamQueue, Arc<Mutex<Vec<String>>>) {
    let log = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&log);
    let queue = SectionStreamQueue::new()
        .with_clock(fixed_clock(42))
        .with_cancel_hook(move |details| {
            sink.lock().push(format!(
                "{}:{}:{:?}",
                details.session_id, details.reason, details.state
            ))
        });
    (queue, log)
}

#[test]
fn newest_request_wins_the_waiting_slot() {
    let (queue, log) = queue_with_log();

    let a = queue.enqueue(StreamRequest::new("A", "sec1", 1));
    assert!(matches!(a, EnqueueResult::Started { concurrency_slot: 1, .. }));

    let b = queue.enqueue(StreamRequest::new("B", "sec1", 2));
    assert!(matches!(
        b,
        EnqueueResult::Pending { replaced_session_id: None, .. }
    ));

    let c = queue.enqueue(StreamRequest::new("C", "sec1", 3));
    assert!(matches!(
        c,
        EnqueueResult::Pending { replaced_session_id: Some(ref id), .. } if id == "B"
    ));
    assert_eq!(*log.lock(), vec!["B:replaced_by_new_request:Pending"]);

    let done = queue.complete("A").unwrap();
    assert_eq!(
        done.activated,
        Some(Activation {
            session_id: "C".to_string(),
            section_id: "sec1".to_string(),
            concurrency_slot: 1,
        })
    );
    assert_eq!(log.lock().len(), 1);
}

#[test]
fn sections_do_not_interfere() {
    let (queue, log) = queue_with_log();
    queue.enqueue(StreamRequest::new("A", "intro", 1));
    queue.enqueue(StreamRequest::new("B", "methods", 1));
    queue.enqueue(StreamRequest::new("C", "intro", 2));

    let cancelled = queue.cancel("B", CancelReason::AuthorCancelled);
    assert!(cancelled.released);
    assert!(cancelled.promoted.is_none());

    let snapshot = queue.snapshot();
    assert_eq!(snapshot.active.len(), 1);
    assert_eq!(snapshot.active["intro"].session_id, "A");
    assert_eq!(snapshot.pending["intro"].session_id, "C");
    assert_eq!(*log.lock(), vec!["B:author_cancelled:Active"]);
}

#[test]
fn transport_failure_hands_the_section_to_the_waiting_stream() {
    let (queue, log) = queue_with_log();
    queue.enqueue(StreamRequest::new("A", "sec1", 1));
    queue.enqueue(StreamRequest::new("B", "sec1", 2));

    let result = queue.cancel("A", CancelReason::TransportFailure);
    let promoted = result.promoted.unwrap();
    assert_eq!(promoted.session_id, "B");
    assert_eq!(queue.state_of("B"), Some(SessionState::Active));
    assert_eq!(queue.snapshot().active["sec1"].started_at, 42);

    // the stream for A reports completion after it was already cancelled
    assert!(queue.complete("A").is_none());
    assert_eq!(queue.active_count(), 1);
    assert_eq!(queue.pending_count(), 0);
    assert_eq!(*log.lock(), vec!["A:transport_failure:Active"]);
}
