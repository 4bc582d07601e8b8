//! Integration tests for the uplink session controller
//!
//! These tests drive the controller end to end against mock collaborators
//! and verify the lifecycle guarantees: single live session, ordered
//! teardown on channel switches, cached endpoint resolution, and failure
//! isolation between start attempts.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use channel_uplink::config::StreamIdentity;
use channel_uplink::endpoint::{ControlPlane, EndpointResolver, ResolveError};
use channel_uplink::session::{SessionController, SessionStatus, UplinkError};
use channel_uplink::source::{MediaSource, OpenError, SourceBody, SourceHandle, SourceOpener};
use channel_uplink::transport::{
    AckEvent, MediaTransport, TransportError, TransportEvent, UplinkHandle, UplinkRequest,
};

/// Shared ordered log of collaborator calls
#[derive(Clone, Default)]
struct EventLog(Arc<StdMutex<Vec<String>>>);

impl EventLog {
    fn push(&self, entry: impl Into<String>) {
        self.0.lock().unwrap().push(entry.into());
    }

    fn entries(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }
}

struct CountingControlPlane {
    calls: AtomicUsize,
    fail: bool,
}

impl CountingControlPlane {
    fn answering() -> Self {
        Self {
            calls: AtomicUsize::new(0),
            fail: false,
        }
    }

    fn failing() -> Self {
        Self {
            calls: AtomicUsize::new(0),
            fail: true,
        }
    }
}

#[async_trait]
impl ControlPlane for CountingControlPlane {
    async fn describe_data_endpoint(&self, _stream_name: &str) -> Result<String, ResolveError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            Err(ResolveError::ControlPlane("lookup unreachable".to_string()))
        } else {
            Ok("https://ingest.example.net".to_string())
        }
    }
}

struct LogSourceHandle {
    log: EventLog,
    channel: String,
    fail_close: bool,
}

impl SourceHandle for LogSourceHandle {
    fn close(&mut self) -> std::io::Result<()> {
        self.log.push(format!("close:source:{}", self.channel));
        if self.fail_close {
            Err(std::io::Error::new(std::io::ErrorKind::Other, "stuck socket"))
        } else {
            Ok(())
        }
    }
}

struct MockSourceOpener {
    log: EventLog,
    refuse: HashSet<String>,
    time_out: HashSet<String>,
    fail_close: bool,
}

impl MockSourceOpener {
    fn new(log: EventLog) -> Self {
        Self {
            log,
            refuse: HashSet::new(),
            time_out: HashSet::new(),
            fail_close: false,
        }
    }

    fn refusing(mut self, channel: &str) -> Self {
        self.refuse.insert(channel.to_string());
        self
    }

    fn timing_out(mut self, channel: &str) -> Self {
        self.time_out.insert(channel.to_string());
        self
    }

    fn with_failing_close(mut self) -> Self {
        self.fail_close = true;
        self
    }
}

#[async_trait]
impl SourceOpener for MockSourceOpener {
    async fn open(&self, channel_id: &str) -> Result<MediaSource, OpenError> {
        if self.time_out.contains(channel_id) {
            return Err(OpenError::Timeout { millis: 10_000 });
        }
        if self.refuse.contains(channel_id) {
            return Err(OpenError::Connect("connection refused".to_string()));
        }

        self.log.push(format!("open:source:{}", channel_id));
        let body = SourceBody::new(futures::stream::pending());
        let handle = LogSourceHandle {
            log: self.log.clone(),
            channel: channel_id.to_string(),
            fail_close: self.fail_close,
        };
        Ok(MediaSource::from_parts(body, Box::new(handle)))
    }
}

struct LogUplinkHandle {
    log: EventLog,
    fail_close: bool,
}

#[async_trait]
impl UplinkHandle for LogUplinkHandle {
    async fn close(self: Box<Self>) -> Result<(), TransportError> {
        self.log.push("close:transport");
        if self.fail_close {
            Err(TransportError::Close("flush failed".to_string()))
        } else {
            Ok(())
        }
    }
}

struct MockTransport {
    log: EventLog,
    opens: AtomicUsize,
    scripts: StdMutex<VecDeque<Vec<TransportEvent>>>,
    fail_close: bool,
}

impl MockTransport {
    fn quiet(log: EventLog) -> Self {
        Self {
            log,
            opens: AtomicUsize::new(0),
            scripts: StdMutex::new(VecDeque::new()),
            fail_close: false,
        }
    }

    /// One script of events per uplink open, in order; later opens get none
    fn scripted(log: EventLog, scripts: Vec<Vec<TransportEvent>>) -> Self {
        Self {
            log,
            opens: AtomicUsize::new(0),
            scripts: StdMutex::new(scripts.into()),
            fail_close: false,
        }
    }

    fn with_failing_close(mut self) -> Self {
        self.fail_close = true;
        self
    }
}

#[async_trait]
impl MediaTransport for MockTransport {
    async fn open_uplink(
        &self,
        request: UplinkRequest,
        _payload: SourceBody,
    ) -> Result<(Box<dyn UplinkHandle>, mpsc::Receiver<TransportEvent>), TransportError> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        self.log.push(format!("open:transport:{}", request.stream_name));

        let script = self
            .scripts
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_default();

        let (tx, rx) = mpsc::channel(64);
        for event in script {
            tx.send(event).await.expect("script overflowed channel");
        }

        let handle = LogUplinkHandle {
            log: self.log.clone(),
            fail_close: self.fail_close,
        };
        Ok((Box::new(handle), rx))
    }
}

fn ack(number: u64) -> TransportEvent {
    TransportEvent::Ack(AckEvent {
        fragment_timecode: number * 2000,
        fragment_number: number,
        acknowledged_bytes: number * 188_000,
    })
}

fn controller(
    control: Arc<CountingControlPlane>,
    opener: MockSourceOpener,
    transport: Arc<MockTransport>,
) -> SessionController {
    let identity = StreamIdentity {
        stream_name: "south1".to_string(),
        region: "eu-west-1".to_string(),
    };
    let resolver = Arc::new(EndpointResolver::new(control));
    SessionController::new(identity, resolver, Arc::new(opener), transport)
}

async fn wait_for_status(controller: &SessionController, expected: SessionStatus) {
    for _ in 0..200 {
        if controller.status().await == expected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!(
        "status never became {:?}, still {:?}",
        expected,
        controller.status().await
    );
}

#[tokio::test]
async fn test_start_activates_and_tracks_increasing_acks() {
    let log = EventLog::default();
    let transport = Arc::new(MockTransport::scripted(
        log.clone(),
        vec![vec![ack(1), ack(2), ack(3)]],
    ));
    let controller = controller(
        Arc::new(CountingControlPlane::answering()),
        MockSourceOpener::new(log.clone()),
        transport,
    );

    let status = controller.start("5").await;
    assert_eq!(status, SessionStatus::Active);
    assert_eq!(controller.current_channel().await, Some("5".to_string()));
    assert!(controller.session_id().await.unwrap().starts_with("up_"));

    // The tracker runs concurrently; wait for the third ack to land
    let mut observed = None;
    for _ in 0..200 {
        observed = controller.last_ack_event().await;
        if observed.as_ref().map(|a| a.fragment_number) == Some(3) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    let last = observed.expect("no ack observed");
    assert_eq!(last.fragment_number, 3);
    assert_eq!(last.acknowledged_bytes, 3 * 188_000);

    let warnings = controller.stop().await;
    assert!(warnings.is_empty());
    assert_eq!(controller.status().await, SessionStatus::Idle);
    assert_eq!(controller.current_channel().await, None);
    assert_eq!(controller.session_id().await, None);

    assert_eq!(
        log.entries(),
        vec![
            "open:source:5",
            "open:transport:south1",
            "close:transport",
            "close:source:5",
        ]
    );
}

#[tokio::test]
async fn test_stop_is_idempotent() {
    let log = EventLog::default();
    let transport = Arc::new(MockTransport::quiet(log.clone()));
    let controller = controller(
        Arc::new(CountingControlPlane::answering()),
        MockSourceOpener::new(log.clone()),
        transport,
    );

    controller.start("5").await;

    let first = controller.stop().await;
    assert!(first.is_empty());
    assert_eq!(controller.status().await, SessionStatus::Idle);

    let second = controller.stop().await;
    assert!(second.is_empty());
    assert_eq!(controller.status().await, SessionStatus::Idle);

    // The second stop must not touch the handles again
    let closes = log
        .entries()
        .iter()
        .filter(|e| e.starts_with("close:"))
        .count();
    assert_eq!(closes, 2);
}

#[tokio::test]
async fn test_stop_without_session_is_a_noop() {
    let log = EventLog::default();
    let transport = Arc::new(MockTransport::quiet(log.clone()));
    let controller = controller(
        Arc::new(CountingControlPlane::answering()),
        MockSourceOpener::new(log.clone()),
        transport,
    );

    let warnings = controller.stop().await;
    assert!(warnings.is_empty());
    assert_eq!(controller.status().await, SessionStatus::Idle);
    assert!(log.entries().is_empty());
}

#[tokio::test]
async fn test_switch_releases_old_session_before_acquiring_new() {
    let log = EventLog::default();
    let transport = Arc::new(MockTransport::quiet(log.clone()));
    let controller = controller(
        Arc::new(CountingControlPlane::answering()),
        MockSourceOpener::new(log.clone()),
        transport,
    );

    assert_eq!(controller.start("A").await, SessionStatus::Active);
    assert_eq!(controller.start("B").await, SessionStatus::Active);

    assert_eq!(controller.current_channel().await, Some("B".to_string()));
    assert_eq!(
        log.entries(),
        vec![
            "open:source:A",
            "open:transport:south1",
            "close:transport",
            "close:source:A",
            "open:source:B",
            "open:transport:south1",
        ]
    );
}

#[tokio::test]
async fn test_at_most_one_session_holds_handles() {
    let log = EventLog::default();
    let transport = Arc::new(MockTransport::quiet(log.clone()));
    let controller = controller(
        Arc::new(CountingControlPlane::answering()),
        MockSourceOpener::new(log.clone()),
        transport,
    );

    controller.start("A").await;
    controller.start("B").await;
    controller.start("C").await;

    let entries = log.entries();
    let opened = entries.iter().filter(|e| e.starts_with("open:source")).count();
    let closed = entries
        .iter()
        .filter(|e| e.starts_with("close:source"))
        .count();
    assert_eq!(opened - closed, 1);
    assert_eq!(controller.status().await, SessionStatus::Active);
}

#[tokio::test]
async fn test_endpoint_resolved_once_across_starts() {
    let log = EventLog::default();
    let control = Arc::new(CountingControlPlane::answering());
    let transport = Arc::new(MockTransport::quiet(log.clone()));
    let controller = controller(
        control.clone(),
        MockSourceOpener::new(log.clone()),
        transport,
    );

    controller.start("A").await;
    controller.start("B").await;

    assert_eq!(control.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_open_error_leaves_failed_and_next_start_recovers() {
    let log = EventLog::default();
    let transport = Arc::new(MockTransport::quiet(log.clone()));
    let controller = controller(
        Arc::new(CountingControlPlane::answering()),
        MockSourceOpener::new(log.clone()).refusing("X"),
        transport.clone(),
    );

    let status = controller.start("X").await;
    assert_eq!(status, SessionStatus::Failed);
    assert!(matches!(
        controller.last_error().await,
        Some(UplinkError::Open { .. })
    ));
    // No transport handle was ever created for the failed attempt
    assert_eq!(transport.opens.load(Ordering::SeqCst), 0);

    // A later start succeeds without an explicit stop in between
    let status = controller.start("Y").await;
    assert_eq!(status, SessionStatus::Active);
    assert!(controller.last_error().await.is_none());
}

#[tokio::test]
async fn test_source_open_timeout_never_touches_transport() {
    let log = EventLog::default();
    let transport = Arc::new(MockTransport::quiet(log.clone()));
    let controller = controller(
        Arc::new(CountingControlPlane::answering()),
        MockSourceOpener::new(log.clone()).timing_out("7"),
        transport.clone(),
    );

    let status = controller.start("7").await;
    assert_eq!(status, SessionStatus::Failed);

    match controller.last_error().await {
        Some(UplinkError::Open { channel, cause }) => {
            assert_eq!(channel, "7");
            assert!(matches!(cause, OpenError::Timeout { millis: 10_000 }));
        }
        other => panic!("expected open error, got {:?}", other),
    }
    assert_eq!(transport.opens.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_resolution_failure_releases_the_opened_source() {
    let log = EventLog::default();
    let transport = Arc::new(MockTransport::quiet(log.clone()));
    let controller = controller(
        Arc::new(CountingControlPlane::failing()),
        MockSourceOpener::new(log.clone()),
        transport.clone(),
    );

    let status = controller.start("5").await;
    assert_eq!(status, SessionStatus::Failed);
    assert!(matches!(
        controller.last_error().await,
        Some(UplinkError::Resolve(_))
    ));

    assert_eq!(log.entries(), vec!["open:source:5", "close:source:5"]);
    assert_eq!(transport.opens.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_transport_failure_is_terminal_until_next_start() {
    let log = EventLog::default();
    let transport = Arc::new(MockTransport::scripted(
        log.clone(),
        vec![vec![TransportEvent::Failure("broken pipe".to_string())]],
    ));
    let controller = controller(
        Arc::new(CountingControlPlane::answering()),
        MockSourceOpener::new(log.clone()),
        transport,
    );

    controller.start("5").await;
    wait_for_status(&controller, SessionStatus::Failed).await;

    assert!(matches!(
        controller.last_error().await,
        Some(UplinkError::Transport(_))
    ));

    // The failed session's handles are released by the next start
    let status = controller.start("6").await;
    assert_eq!(status, SessionStatus::Active);

    let entries = log.entries();
    let close_old_transport = entries.iter().position(|e| e == "close:transport").unwrap();
    let close_old_source = entries.iter().position(|e| e == "close:source:5").unwrap();
    let open_new_source = entries.iter().position(|e| e == "open:source:6").unwrap();
    assert!(close_old_transport < open_new_source);
    assert!(close_old_source < open_new_source);
}

#[tokio::test]
async fn test_orderly_completion_returns_to_idle() {
    let log = EventLog::default();
    let transport = Arc::new(MockTransport::scripted(
        log.clone(),
        vec![vec![ack(1), TransportEvent::Complete]],
    ));
    let controller = controller(
        Arc::new(CountingControlPlane::answering()),
        MockSourceOpener::new(log.clone()),
        transport,
    );

    controller.start("5").await;
    wait_for_status(&controller, SessionStatus::Idle).await;

    assert_eq!(controller.current_channel().await, None);
    assert_eq!(
        log.entries(),
        vec![
            "open:source:5",
            "open:transport:south1",
            "close:transport",
            "close:source:5",
        ]
    );
}

#[tokio::test]
async fn test_release_failures_are_aggregated_and_still_reach_idle() {
    let log = EventLog::default();
    let transport = Arc::new(MockTransport::quiet(log.clone()).with_failing_close());
    let controller = controller(
        Arc::new(CountingControlPlane::answering()),
        MockSourceOpener::new(log.clone()).with_failing_close(),
        transport,
    );

    controller.start("5").await;
    let warnings = controller.stop().await;

    assert_eq!(warnings.len(), 2);
    assert_eq!(warnings[0].handle, "transport");
    assert_eq!(warnings[1].handle, "source");
    assert_eq!(controller.status().await, SessionStatus::Idle);

    // Both releases were attempted despite both failing
    assert_eq!(
        log.entries(),
        vec![
            "open:source:5",
            "open:transport:south1",
            "close:transport",
            "close:source:5",
        ]
    );
}
