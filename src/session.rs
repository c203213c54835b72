//! Acquisition session state machine
//!
//! Drives the full cycle: request permission, run a single-shot discovery
//! round, decode the matched frame, publish, wait out the poll interval,
//! repeat. The session is one sequential task; it owns at most one
//! discovery round and one pending timer at any instant, and tears each
//! down before arming the next.
use log::{debug, error, info, warn};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::{sleep, Duration};

use crate::config::AppConfig;
use crate::decoder;
use crate::models::{Advertisement, PeripheralIdentity, SampleRecord};
use crate::store::SampleStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    AwaitingPermission,
    Scanning,
    Matched,
    IdleWaiting,
    Stopped,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("bluetooth permission denied")]
    PermissionDenied,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("discovery failed: {0}")]
pub struct DiscoveryError(pub String);

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("sink failure: {0}")]
pub struct SinkError(pub String);

/// Source of raw peripheral-seen events, one round per acquisition cycle.
///
/// `start` must tear down any round left over from a previous cycle before
/// opening a new one; the session stops every round it opens.
#[allow(async_fn_in_trait)]
pub trait Discovery {
    async fn start(&mut self) -> Result<(), DiscoveryError>;
    async fn next_event(&mut self) -> Result<Advertisement, DiscoveryError>;
    async fn stop(&mut self);
}

/// Host permission to scan, requested once per start action.
#[allow(async_fn_in_trait)]
pub trait Permission {
    async fn request(&mut self) -> bool;
}

/// Receiver of serialized samples. Single attempt, no retry; a failure is
/// logged and counted but never affects the acquisition cycle.
#[allow(async_fn_in_trait)]
pub trait SampleSink {
    async fn publish(&mut self, record: &SampleRecord) -> Result<(), SinkError>;
}

/// Per-session observability counters.
#[derive(Debug, Clone, Copy, Default)]
pub struct SessionStats {
    pub cycles: u64,
    pub matches: u64,
    pub decode_failures: u64,
    pub discovery_errors: u64,
    pub sink_errors: u64,
}

/// Requests a running session to stop at its next suspension point.
pub struct SessionHandle {
    stop: watch::Sender<bool>,
}

impl SessionHandle {
    pub fn stop(&self) {
        let _ = self.stop.send(true);
    }
}

enum CycleOutcome {
    Matched(Advertisement),
    Empty,
    Stop,
}

enum ScanWake {
    Event(Result<Advertisement, DiscoveryError>),
    Deadline,
    Stop,
}

pub struct AcquisitionSession<D, P, S> {
    target: PeripheralIdentity,
    poll_interval: Duration,
    scan_timeout: Duration,
    discovery: D,
    permission: P,
    sink: S,
    store: Arc<SampleStore>,
    state: SessionState,
    stats: SessionStats,
    stop_rx: watch::Receiver<bool>,
}

impl<D: Discovery, P: Permission, S: SampleSink> AcquisitionSession<D, P, S> {
    pub fn new(
        config: &AppConfig,
        discovery: D,
        permission: P,
        sink: S,
        store: Arc<SampleStore>,
    ) -> (Self, SessionHandle) {
        let (stop_tx, stop_rx) = watch::channel(false);
        let session = AcquisitionSession {
            target: config.target.clone(),
            poll_interval: config.poll_interval,
            scan_timeout: config.scan_timeout,
            discovery,
            permission,
            sink,
            store,
            state: SessionState::Idle,
            stats: SessionStats::default(),
            stop_rx,
        };
        (session, SessionHandle { stop: stop_tx })
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn stats(&self) -> SessionStats {
        self.stats
    }

    /// Drive the session until it stops.
    ///
    /// Terminal outcomes are a denied permission request and an explicit
    /// stop; every decode- or discovery-level fault is absorbed and the
    /// loop retries on the next scheduled cycle.
    pub async fn run(&mut self) -> Result<(), SessionError> {
        self.set_state(SessionState::AwaitingPermission);
        info!("requesting bluetooth permission");
        if !self.permission.request().await {
            self.set_state(SessionState::Stopped);
            error!("bluetooth permission denied, acquisition aborted");
            return Err(SessionError::PermissionDenied);
        }

        info!("acquisition started for {}", self.target);
        while !self.stop_requested() {
            self.stats.cycles += 1;
            match self.scan_cycle().await {
                CycleOutcome::Matched(advertisement) => {
                    self.set_state(SessionState::Matched);
                    self.handle_match(advertisement).await;
                }
                CycleOutcome::Empty => {}
                CycleOutcome::Stop => break,
            }

            if self.stop_requested() {
                break;
            }
            self.set_state(SessionState::IdleWaiting);
            if !self.wait_for_next_cycle().await {
                break;
            }
        }

        self.set_state(SessionState::Stopped);
        info!(
            "acquisition stopped after {} cycles: {} matched, {} decode failures, {} discovery errors, {} sink errors",
            self.stats.cycles,
            self.stats.matches,
            self.stats.decode_failures,
            self.stats.discovery_errors,
            self.stats.sink_errors
        );
        Ok(())
    }

    /// One single-shot discovery round: scan until the target is seen, the
    /// scan window elapses, or a stop arrives. The round is always torn
    /// down before returning.
    async fn scan_cycle(&mut self) -> CycleOutcome {
        self.set_state(SessionState::Scanning);
        if let Err(e) = self.discovery.start().await {
            self.stats.discovery_errors += 1;
            error!("failed to start discovery: {}", e);
            return CycleOutcome::Empty;
        }

        let deadline = sleep(self.scan_timeout);
        tokio::pin!(deadline);

        let outcome = loop {
            let wake = tokio::select! {
                event = self.discovery.next_event() => ScanWake::Event(event),
                _ = &mut deadline => ScanWake::Deadline,
                _ = self.stop_rx.changed() => ScanWake::Stop,
            };
            match wake {
                ScanWake::Event(Ok(advertisement)) => {
                    if self.target.matches(&advertisement.identity) {
                        break CycleOutcome::Matched(advertisement);
                    }
                    debug!("ignoring advertisement from {}", advertisement.identity);
                }
                ScanWake::Event(Err(e)) => {
                    self.stats.discovery_errors += 1;
                    error!("scan failed: {}", e);
                    break CycleOutcome::Empty;
                }
                ScanWake::Deadline => {
                    debug!("scan window elapsed without seeing {}", self.target);
                    break CycleOutcome::Empty;
                }
                ScanWake::Stop => break CycleOutcome::Stop,
            }
        };

        self.discovery.stop().await;
        outcome
    }

    /// Decode the matched frame and publish. Decode and sink faults are
    /// absorbed here so a single bad frame never halts acquisition.
    async fn handle_match(&mut self, advertisement: Advertisement) {
        self.stats.matches += 1;

        let Some(bytes) = advertisement.data else {
            self.stats.decode_failures += 1;
            warn!(
                "advertisement from {} carried no manufacturer data",
                advertisement.identity
            );
            return;
        };
        // The frame travels as hex byte tokens from here on, the form the
        // device contract is written in.
        let hex_frame = hex::encode_upper(&bytes);
        debug!("frame from {}: {}", advertisement.identity, hex_frame);

        match decoder::decode_hex(&hex_frame) {
            Ok(sample) => {
                let record = SampleRecord::new(&sample, advertisement.received_at);
                self.store.publish(sample);
                if let Err(e) = self.sink.publish(&record).await {
                    self.stats.sink_errors += 1;
                    warn!("sink rejected sample: {}", e);
                }
            }
            Err(e) => {
                self.stats.decode_failures += 1;
                warn!("discarding frame from {}: {}", advertisement.identity, e);
            }
        }
    }

    /// One-shot timer between cycles. Returns false when a stop request
    /// arrived instead of the tick.
    async fn wait_for_next_cycle(&mut self) -> bool {
        tokio::select! {
            _ = sleep(self.poll_interval) => true,
            _ = self.stop_rx.changed() => false,
        }
    }

    fn stop_requested(&self) -> bool {
        *self.stop_rx.borrow()
    }

    fn set_state(&mut self, next: SessionState) {
        if self.state != next {
            debug!("session state {:?} -> {:?}", self.state, next);
            self.state = next;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;
    use time::OffsetDateTime;

    const TARGET: &str = "02:80:E1:00:00:00";

    fn test_config() -> AppConfig {
        AppConfig {
            target: PeripheralIdentity::new(TARGET),
            poll_interval: Duration::from_millis(5),
            scan_timeout: Duration::from_millis(40),
            database_url: String::new(),
        }
    }

    fn valid_frame() -> Vec<u8> {
        let mut frame = vec![0xA1, 0x80, 0x80, 0x80];
        frame.extend_from_slice(&[0u8; 22]);
        frame
    }

    fn seen(identity: &str, data: Option<Vec<u8>>) -> Result<Advertisement, DiscoveryError> {
        Ok(Advertisement {
            identity: identity.to_string(),
            data,
            received_at: OffsetDateTime::now_utc(),
        })
    }

    #[derive(Clone, Default)]
    struct MockDiscovery {
        script: Arc<Mutex<VecDeque<Result<Advertisement, DiscoveryError>>>>,
        active: Arc<AtomicBool>,
        rounds: Arc<AtomicUsize>,
        overlapped: Arc<AtomicBool>,
    }

    impl MockDiscovery {
        fn scripted(events: Vec<Result<Advertisement, DiscoveryError>>) -> Self {
            let mock = MockDiscovery::default();
            *mock.script.lock().unwrap() = events.into();
            mock
        }
    }

    impl Discovery for MockDiscovery {
        async fn start(&mut self) -> Result<(), DiscoveryError> {
            if self.active.swap(true, Ordering::SeqCst) {
                self.overlapped.store(true, Ordering::SeqCst);
            }
            self.rounds.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn next_event(&mut self) -> Result<Advertisement, DiscoveryError> {
            let next = self.script.lock().unwrap().pop_front();
            match next {
                Some(event) => event,
                // Script exhausted: stay quiet until the scan window or a
                // stop request ends the round.
                None => std::future::pending().await,
            }
        }

        async fn stop(&mut self) {
            self.active.store(false, Ordering::SeqCst);
        }
    }

    #[derive(Clone)]
    struct MockPermission {
        grant: bool,
        requests: Arc<AtomicUsize>,
    }

    impl MockPermission {
        fn granting(grant: bool) -> Self {
            MockPermission {
                grant,
                requests: Arc::new(AtomicUsize::new(0)),
            }
        }
    }

    impl Permission for MockPermission {
        async fn request(&mut self) -> bool {
            self.requests.fetch_add(1, Ordering::SeqCst);
            self.grant
        }
    }

    #[derive(Clone, Default)]
    struct MockSink {
        published: Arc<Mutex<Vec<SampleRecord>>>,
        fail: bool,
    }

    impl SampleSink for MockSink {
        async fn publish(&mut self, record: &SampleRecord) -> Result<(), SinkError> {
            if self.fail {
                return Err(SinkError("mock sink down".to_string()));
            }
            self.published.lock().unwrap().push(record.clone());
            Ok(())
        }
    }

    /// Stop the session once `done` holds, with a hard cap so a broken
    /// session cannot hang the test run.
    fn stop_when(handle: SessionHandle, done: impl Fn() -> bool + Send + 'static) {
        tokio::spawn(async move {
            for _ in 0..2000 {
                if done() {
                    break;
                }
                sleep(Duration::from_millis(2)).await;
            }
            handle.stop();
        });
    }

    fn stop_after(handle: SessionHandle, delay: Duration) {
        tokio::spawn(async move {
            sleep(delay).await;
            handle.stop();
        });
    }

    #[tokio::test]
    async fn permission_denial_is_terminal() {
        let discovery = MockDiscovery::default();
        let permission = MockPermission::granting(false);
        let sink = MockSink::default();
        let store = Arc::new(SampleStore::new());

        let (mut session, _handle) = AcquisitionSession::new(
            &test_config(),
            discovery.clone(),
            permission.clone(),
            sink,
            store.clone(),
        );

        assert_eq!(session.run().await, Err(SessionError::PermissionDenied));
        assert_eq!(session.state(), SessionState::Stopped);
        assert_eq!(discovery.rounds.load(Ordering::SeqCst), 0);
        assert!(store.latest().is_none());
    }

    #[tokio::test]
    async fn matched_frame_is_decoded_published_and_sunk() {
        let discovery = MockDiscovery::scripted(vec![
            seen("AA:BB:CC:DD:EE:FF", Some(valid_frame())),
            seen(TARGET, Some(valid_frame())),
        ]);
        let sink = MockSink::default();
        let store = Arc::new(SampleStore::new());

        let (mut session, handle) = AcquisitionSession::new(
            &test_config(),
            discovery.clone(),
            MockPermission::granting(true),
            sink.clone(),
            store.clone(),
        );
        let published = sink.published.clone();
        stop_when(handle, move || !published.lock().unwrap().is_empty());

        assert_eq!(session.run().await, Ok(()));
        assert_eq!(session.state(), SessionState::Stopped);

        // The non-matching advertisement was discarded without a decode.
        assert_eq!(session.stats().matches, 1);
        assert_eq!(store.sample_count(), 1);

        let latest = store.latest().unwrap();
        assert_eq!(latest.motion_x, 0.0);
        assert_eq!(latest.primary, -0.33333);

        let records = sink.published.lock().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].secondary, [-0.33333; 10]);
        assert!(!discovery.overlapped.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn decode_failure_skips_the_cycle_without_halting() {
        let discovery = MockDiscovery::scripted(vec![
            seen(TARGET, Some(vec![0xA1, 0x01, 0x02])),
            seen(TARGET, Some(valid_frame())),
        ]);
        let sink = MockSink::default();
        let store = Arc::new(SampleStore::new());

        let (mut session, handle) = AcquisitionSession::new(
            &test_config(),
            discovery.clone(),
            MockPermission::granting(true),
            sink.clone(),
            store.clone(),
        );
        let published = sink.published.clone();
        stop_when(handle, move || !published.lock().unwrap().is_empty());

        assert_eq!(session.run().await, Ok(()));
        assert_eq!(session.stats().matches, 2);
        assert_eq!(session.stats().decode_failures, 1);
        // The truncated frame left no trace in the store.
        assert_eq!(store.sample_count(), 1);
        assert!(!discovery.overlapped.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn absent_advertisement_data_counts_as_decode_failure() {
        let discovery = MockDiscovery::scripted(vec![
            seen(TARGET, None),
            seen(TARGET, Some(valid_frame())),
        ]);
        let sink = MockSink::default();
        let store = Arc::new(SampleStore::new());

        let (mut session, handle) = AcquisitionSession::new(
            &test_config(),
            discovery,
            MockPermission::granting(true),
            sink.clone(),
            store.clone(),
        );
        let published = sink.published.clone();
        stop_when(handle, move || !published.lock().unwrap().is_empty());

        assert_eq!(session.run().await, Ok(()));
        assert_eq!(session.stats().decode_failures, 1);
        assert_eq!(store.sample_count(), 1);
    }

    #[tokio::test]
    async fn discovery_error_abandons_the_cycle_and_self_heals() {
        let discovery = MockDiscovery::scripted(vec![
            Err(DiscoveryError("hci adapter went away".to_string())),
            seen(TARGET, Some(valid_frame())),
        ]);
        let sink = MockSink::default();
        let store = Arc::new(SampleStore::new());

        let (mut session, handle) = AcquisitionSession::new(
            &test_config(),
            discovery,
            MockPermission::granting(true),
            sink.clone(),
            store,
        );
        let published = sink.published.clone();
        stop_when(handle, move || !published.lock().unwrap().is_empty());

        assert_eq!(session.run().await, Ok(()));
        assert_eq!(session.stats().discovery_errors, 1);
        assert_eq!(sink.published.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn sink_failure_does_not_affect_store_or_session() {
        let discovery = MockDiscovery::scripted(vec![seen(TARGET, Some(valid_frame()))]);
        let sink = MockSink {
            published: Arc::new(Mutex::new(Vec::new())),
            fail: true,
        };
        let store = Arc::new(SampleStore::new());

        let (mut session, handle) = AcquisitionSession::new(
            &test_config(),
            discovery,
            MockPermission::granting(true),
            sink,
            store.clone(),
        );
        let probe = store.clone();
        stop_when(handle, move || probe.sample_count() > 0);

        assert_eq!(session.run().await, Ok(()));
        assert!(session.stats().sink_errors >= 1);
        assert!(store.latest().is_some());
    }

    #[tokio::test]
    async fn stop_during_scanning_tears_discovery_down() {
        let discovery = MockDiscovery::scripted(Vec::new());
        let store = Arc::new(SampleStore::new());

        let (mut session, handle) = AcquisitionSession::new(
            &test_config(),
            discovery.clone(),
            MockPermission::granting(true),
            MockSink::default(),
            store,
        );
        stop_after(handle, Duration::from_millis(10));

        assert_eq!(session.run().await, Ok(()));
        assert_eq!(session.state(), SessionState::Stopped);
        assert_eq!(session.stats().cycles, 1);
        assert_eq!(discovery.rounds.load(Ordering::SeqCst), 1);
        assert!(!discovery.active.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn restart_requests_permission_again() {
        let permission = MockPermission::granting(true);
        let store = Arc::new(SampleStore::new());

        for _ in 0..2 {
            let (mut session, handle) = AcquisitionSession::new(
                &test_config(),
                MockDiscovery::default(),
                permission.clone(),
                MockSink::default(),
                store.clone(),
            );
            stop_after(handle, Duration::from_millis(5));
            assert_eq!(session.run().await, Ok(()));
            assert_eq!(session.state(), SessionState::Stopped);
        }

        assert_eq!(permission.requests.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn non_matching_traffic_oscillates_without_matching_or_stopping() {
        let mut events = Vec::new();
        for _ in 0..30 {
            events.push(seen("11:22:33:44:55:66", Some(valid_frame())));
        }
        let discovery = MockDiscovery::scripted(events);
        let store = Arc::new(SampleStore::new());

        let config = AppConfig {
            scan_timeout: Duration::from_millis(10),
            poll_interval: Duration::from_millis(2),
            ..test_config()
        };
        let (mut session, handle) = AcquisitionSession::new(
            &config,
            discovery.clone(),
            MockPermission::granting(true),
            MockSink::default(),
            store.clone(),
        );
        stop_after(handle, Duration::from_millis(80));

        assert_eq!(session.run().await, Ok(()));
        assert_eq!(session.stats().matches, 0);
        assert!(session.stats().cycles >= 2);
        assert!(store.latest().is_none());
        // Many rounds, never more than one at a time.
        assert!(discovery.rounds.load(Ordering::SeqCst) >= 2);
        assert!(!discovery.overlapped.load(Ordering::SeqCst));
    }
}
