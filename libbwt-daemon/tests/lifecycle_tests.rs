use std::collections::VecDeque;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread::{self, sleep};
use std::time::{Duration, Instant};

use libbwt_core::{BwtConfig, DaemonEvent, DaemonState, ServerKind, ShutdownHandle};
use libbwt_daemon::{
    probe, shutdown, start, start_with_source, ChainInfo, ChainSource, DaemonError, DaemonRegistry,
    Notifier, RpcError, ScanInfo,
};

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

fn chain(blocks: u32, headers: u32, progress: f64) -> ChainInfo {
    ChainInfo {
        chain: "regtest".to_string(),
        blocks,
        headers,
        best_block_hash: format!("{blocks:064x}"),
        verification_progress: progress,
        initial_block_download: blocks < headers,
        median_time: 0,
    }
}

fn warmup() -> RpcError {
    RpcError::Rpc {
        code: -28,
        message: "Loading block index...".to_string(),
    }
}

/// Replays scripted RPC answers; the last chain answer repeats forever.
struct ScriptedSource {
    chain: Mutex<VecDeque<Result<ChainInfo, RpcError>>>,
    tip: Mutex<ChainInfo>,
    scans: Mutex<VecDeque<ScanInfo>>,
}

impl ScriptedSource {
    fn new(chain: Vec<Result<ChainInfo, RpcError>>, scans: Vec<ScanInfo>) -> Arc<Self> {
        let tip = chain
            .iter()
            .rev()
            .find_map(|step| step.as_ref().ok().cloned())
            .expect("script needs at least one chain answer");
        Arc::new(Self {
            chain: Mutex::new(chain.into()),
            tip: Mutex::new(tip),
            scans: Mutex::new(scans.into()),
        })
    }

    fn synced() -> Arc<Self> {
        Self::new(vec![Ok(chain(200, 200, 1.0))], vec![])
    }
}

impl ChainSource for ScriptedSource {
    fn chain_info(&self) -> Result<ChainInfo, RpcError> {
        match self.chain.lock().unwrap().pop_front() {
            Some(step) => step,
            None => Ok(self.tip.lock().unwrap().clone()),
        }
    }

    fn scan_info(&self) -> Result<Option<ScanInfo>, RpcError> {
        Ok(self.scans.lock().unwrap().pop_front())
    }
}

/// Records every callback and hands the shutdown handle to the test thread.
struct Recorder {
    events: Mutex<Vec<DaemonEvent>>,
    handle_tx: Mutex<mpsc::Sender<ShutdownHandle>>,
}

impl Recorder {
    fn new() -> (Arc<Self>, mpsc::Receiver<ShutdownHandle>) {
        let (tx, rx) = mpsc::channel();
        let recorder = Arc::new(Self {
            events: Mutex::new(Vec::new()),
            handle_tx: Mutex::new(tx),
        });
        (recorder, rx)
    }

    fn events(&self) -> Vec<DaemonEvent> {
        self.events.lock().unwrap().clone()
    }

    fn push(&self, event: DaemonEvent) {
        self.events.lock().unwrap().push(event);
    }

    fn is_ready(&self) -> bool {
        self.events().contains(&DaemonEvent::Ready)
    }
}

impl Notifier for Recorder {
    fn on_booting(&self, handle: ShutdownHandle) {
        self.push(DaemonEvent::Booting { handle });
        let _ = self.handle_tx.lock().unwrap().send(handle);
    }
    fn on_sync_progress(&self, progress: f32, tip_height: u32) {
        self.push(DaemonEvent::SyncProgress { progress, tip_height });
    }
    fn on_scan_progress(&self, progress: f32, eta: u32) {
        self.push(DaemonEvent::ScanProgress { progress, eta });
    }
    fn on_electrum_ready(&self, addr: SocketAddr) {
        self.push(DaemonEvent::ElectrumReady { addr });
    }
    fn on_http_ready(&self, addr: SocketAddr) {
        self.push(DaemonEvent::HttpReady { addr });
    }
    fn on_ready(&self) {
        self.push(DaemonEvent::Ready);
    }
}

fn local() -> SocketAddr {
    "127.0.0.1:0".parse().unwrap()
}

fn test_config(electrum: bool, http: bool) -> BwtConfig {
    BwtConfig {
        bitcoind_auth: Some("user:pass".to_string()),
        poll_interval: Duration::from_millis(20),
        electrum_addr: electrum.then(local),
        http_addr: http.then(local),
        ..BwtConfig::default()
    }
}

/// A daemon running `start_with_source` on its own thread.
struct Harness {
    registry: DaemonRegistry,
    recorder: Arc<Recorder>,
    handle: ShutdownHandle,
    done_rx: mpsc::Receiver<Result<(), DaemonError>>,
}

impl Harness {
    fn boot(config: BwtConfig, source: Arc<dyn ChainSource>) -> Self {
        Self::boot_in(&DaemonRegistry::new(), config, source)
    }

    /// Boot into an existing registry, next to any instances already in it.
    fn boot_in(registry: &DaemonRegistry, config: BwtConfig, source: Arc<dyn ChainSource>) -> Self {
        let registry = registry.clone();
        let (recorder, handle_rx) = Recorder::new();
        let (done_tx, done_rx) = mpsc::channel();

        let thread_registry = registry.clone();
        let notifier = recorder.clone();
        thread::spawn(move || {
            let result = start_with_source(&thread_registry, config, source, notifier);
            let _ = done_tx.send(result);
        });

        let handle = handle_rx
            .recv_timeout(Duration::from_secs(5))
            .expect("on_booting delivered a handle");
        Self {
            registry,
            recorder,
            handle,
            done_rx,
        }
    }

    fn wait_ready(&self) {
        assert!(
            wait_until(Duration::from_secs(5), || self.recorder.is_ready()),
            "daemon did not become ready; events: {:?}",
            self.recorder.events(),
        );
    }

    fn stop(self) -> (Vec<DaemonEvent>, Result<(), DaemonError>) {
        shutdown(&self.registry, self.handle).expect("shutdown accepted");
        let result = self
            .done_rx
            .recv_timeout(Duration::from_secs(5))
            .expect("start returned after shutdown");
        assert!(!self.registry.handles().contains(&self.handle));
        (self.recorder.events(), result)
    }
}

fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        sleep(Duration::from_millis(10));
    }
    false
}

fn ready_addr(events: &[DaemonEvent], kind: ServerKind) -> Option<SocketAddr> {
    events.iter().find_map(|event| match (event, kind) {
        (DaemonEvent::ElectrumReady { addr }, ServerKind::Electrum) => Some(*addr),
        (DaemonEvent::HttpReady { addr }, ServerKind::Http) => Some(*addr),
        _ => None,
    })
}

fn http_get(addr: SocketAddr, path: &str) -> String {
    let mut stream = TcpStream::connect_timeout(&addr, Duration::from_secs(2)).expect("connect");
    stream
        .set_read_timeout(Some(Duration::from_secs(2)))
        .expect("timeout");
    write!(
        stream,
        "GET {path} HTTP/1.1\r\nHost: {addr}\r\nConnection: close\r\n\r\n"
    )
    .expect("write request");
    let mut response = String::new();
    stream.read_to_string(&mut response).expect("read response");
    response
}

// ---------------------------------------------------------------------------
// Lifecycle
// ---------------------------------------------------------------------------

#[test]
fn full_boot_reports_in_order_then_stops_on_shutdown() {
    let source = ScriptedSource::new(
        vec![
            Err(warmup()),
            Ok(chain(50, 200, 0.25)),
            Ok(chain(120, 200, 0.6)),
            Ok(chain(200, 200, 1.0)),
        ],
        vec![
            ScanInfo { duration: 10, progress: 0.5 },
            ScanInfo { duration: 18, progress: 0.9 },
        ],
    );
    let harness = Harness::boot(test_config(true, true), source);
    harness.wait_ready();
    assert_eq!(
        harness.registry.state(harness.handle),
        Some(DaemonState::Running)
    );

    let (events, result) = harness.stop();
    result.expect("clean shutdown");

    assert!(matches!(events.first(), Some(DaemonEvent::Booting { .. })));
    assert_eq!(events.last(), Some(&DaemonEvent::Ready));
    assert_eq!(
        events.iter().filter(|e| **e == DaemonEvent::Ready).count(),
        1
    );

    let sync: Vec<f32> = events
        .iter()
        .filter_map(|e| match e {
            DaemonEvent::SyncProgress { progress, .. } => Some(*progress),
            _ => None,
        })
        .collect();
    assert_eq!(sync.first(), Some(&0.25));
    assert_eq!(sync.last(), Some(&1.0));
    assert!(sync.windows(2).all(|w| w[0] <= w[1]), "sync regressed: {sync:?}");

    let scan: Vec<f32> = events
        .iter()
        .filter_map(|e| match e {
            DaemonEvent::ScanProgress { progress, .. } => Some(*progress),
            _ => None,
        })
        .collect();
    assert_eq!(scan, vec![0.5, 0.9, 1.0]);

    // Both servers are announced after all progress and before ready.
    let electrum_pos = events
        .iter()
        .position(|e| matches!(e, DaemonEvent::ElectrumReady { .. }))
        .expect("electrum ready");
    let http_pos = events
        .iter()
        .position(|e| matches!(e, DaemonEvent::HttpReady { .. }))
        .expect("http ready");
    let last_progress = events
        .iter()
        .rposition(|e| {
            matches!(
                e,
                DaemonEvent::SyncProgress { .. } | DaemonEvent::ScanProgress { .. }
            )
        })
        .expect("progress");
    assert!(last_progress < electrum_pos && electrum_pos < http_pos);
}

#[test]
fn electrum_only_never_reports_http() {
    let harness = Harness::boot(test_config(true, false), ScriptedSource::synced());
    harness.wait_ready();

    let events = harness.recorder.events();
    let addr = ready_addr(&events, ServerKind::Electrum).expect("electrum ready");
    assert_ne!(addr.port(), 0, "announced address is the bound one");
    assert!(ready_addr(&events, ServerKind::Http).is_none());

    let software = probe(addr, Duration::from_secs(2)).expect("electrum handshake");
    assert!(software.starts_with("bwt "), "got {software}");

    let (events, result) = harness.stop();
    result.expect("clean shutdown");
    assert!(ready_addr(&events, ServerKind::Http).is_none());
}

#[test]
fn no_servers_still_reaches_ready() {
    let harness = Harness::boot(test_config(false, false), ScriptedSource::synced());
    harness.wait_ready();
    let (events, result) = harness.stop();
    result.expect("clean shutdown");
    assert!(ready_addr(&events, ServerKind::Electrum).is_none());
    assert!(ready_addr(&events, ServerKind::Http).is_none());
}

#[test]
fn http_status_reports_running_instance() {
    let config = BwtConfig {
        http_cors: true,
        ..test_config(false, true)
    };
    let harness = Harness::boot(config, ScriptedSource::synced());
    harness.wait_ready();

    let addr = ready_addr(&harness.recorder.events(), ServerKind::Http).expect("http ready");
    let response = http_get(addr, "/status");
    assert!(response.starts_with("HTTP/1.1 200"), "got {response}");
    assert!(response.to_ascii_lowercase().contains("access-control-allow-origin: *"));

    let body = response.split("\r\n\r\n").nth(1).expect("body");
    let status: serde_json::Value = serde_json::from_str(body.trim()).expect("json body");
    assert_eq!(status["state"], "running");
    assert_eq!(status["tip_height"], 200);
    assert_eq!(status["handle"], harness.handle.0);

    harness.stop().1.expect("clean shutdown");
}

#[test]
fn shutdown_while_syncing_returns_ok_without_ready() {
    // Never finishes syncing.
    let source = ScriptedSource::new(vec![Ok(chain(10, 500, 0.02))], vec![]);
    let harness = Harness::boot(test_config(true, true), source);

    assert!(wait_until(Duration::from_secs(5), || {
        harness
            .recorder
            .events()
            .iter()
            .any(|e| matches!(e, DaemonEvent::SyncProgress { .. }))
    }));

    let started = Instant::now();
    let recorder = harness.recorder.clone();
    let (events, result) = harness.stop();
    result.expect("canceled boot is a clean stop");
    assert!(started.elapsed() < Duration::from_secs(2));
    assert!(!events.contains(&DaemonEvent::Ready));
    assert!(ready_addr(&events, ServerKind::Electrum).is_none());

    // Nothing trickles in after start has returned.
    sleep(Duration::from_millis(100));
    assert_eq!(recorder.events().len(), events.len());
}

/// Sink that blocks inside every progress hook, so events pile up behind it.
struct SlowSink {
    handle_tx: Mutex<mpsc::Sender<ShutdownHandle>>,
    entered_tx: Mutex<mpsc::Sender<()>>,
    shutdown_requested: AtomicBool,
    late_calls: AtomicUsize,
}

impl SlowSink {
    fn hook(&self) {
        if self.shutdown_requested.load(Ordering::SeqCst) {
            self.late_calls.fetch_add(1, Ordering::SeqCst);
        }
    }
}

impl Notifier for SlowSink {
    fn on_booting(&self, handle: ShutdownHandle) {
        let _ = self.handle_tx.lock().unwrap().send(handle);
    }
    fn on_sync_progress(&self, _progress: f32, _tip_height: u32) {
        self.hook();
        let _ = self.entered_tx.lock().unwrap().send(());
        sleep(Duration::from_millis(100));
    }
    fn on_scan_progress(&self, _progress: f32, _eta: u32) {
        self.hook();
    }
    fn on_electrum_ready(&self, _addr: SocketAddr) {
        self.hook();
    }
    fn on_http_ready(&self, _addr: SocketAddr) {
        self.hook();
    }
    fn on_ready(&self) {
        self.hook();
    }
}

#[test]
fn queued_events_are_dropped_once_shutdown_is_requested() {
    let (handle_tx, handle_rx) = mpsc::channel();
    let (entered_tx, entered_rx) = mpsc::channel();
    let sink = Arc::new(SlowSink {
        handle_tx: Mutex::new(handle_tx),
        entered_tx: Mutex::new(entered_tx),
        shutdown_requested: AtomicBool::new(false),
        late_calls: AtomicUsize::new(0),
    });

    // Polls every 20ms while each hook takes 100ms: the queue keeps growing.
    let source = ScriptedSource::new(vec![Ok(chain(10, 500, 0.02))], vec![]);
    let registry = DaemonRegistry::new();
    let (done_tx, done_rx) = mpsc::channel();
    {
        let registry = registry.clone();
        let sink = sink.clone();
        thread::spawn(move || {
            let _ = done_tx.send(start_with_source(
                &registry,
                test_config(true, true),
                source,
                sink,
            ));
        });
    }

    let handle = handle_rx.recv_timeout(Duration::from_secs(5)).expect("booting");
    for _ in 0..3 {
        entered_rx
            .recv_timeout(Duration::from_secs(5))
            .expect("sync progress delivered");
    }

    // The sink is asleep inside its third hook; request shutdown before it wakes.
    shutdown(&registry, handle).expect("shutdown accepted");
    sink.shutdown_requested.store(true, Ordering::SeqCst);

    done_rx
        .recv_timeout(Duration::from_secs(2))
        .expect("start returned promptly")
        .expect("clean shutdown");
    assert_eq!(sink.late_calls.load(Ordering::SeqCst), 0);
    assert!(entered_rx.try_recv().is_err(), "no hook entered after the request");
}

#[test]
fn second_shutdown_after_stop_is_unknown_handle() {
    let harness = Harness::boot(test_config(false, false), ScriptedSource::synced());
    harness.wait_ready();
    let registry = harness.registry.clone();
    let handle = harness.handle;
    harness.stop().1.expect("clean shutdown");

    assert!(matches!(
        registry.shutdown(handle),
        Err(DaemonError::UnknownHandle(h)) if h == handle
    ));
}

#[test]
fn concurrent_instances_get_distinct_handles() {
    let registry = DaemonRegistry::new();
    let first = Harness::boot_in(&registry, test_config(false, false), ScriptedSource::synced());
    let second = Harness::boot_in(&registry, test_config(false, false), ScriptedSource::synced());
    assert_ne!(first.handle, second.handle);
    first.wait_ready();
    second.wait_ready();
    assert_eq!(registry.handles(), vec![first.handle, second.handle]);

    // Stopping one instance leaves the other running.
    first.stop().1.expect("first stops");
    assert_eq!(registry.state(second.handle), Some(DaemonState::Running));
    second.stop().1.expect("second stops");
    assert!(registry.handles().is_empty());
}

// ---------------------------------------------------------------------------
// Failures
// ---------------------------------------------------------------------------

#[test]
fn invalid_config_fails_before_any_callback() {
    let registry = DaemonRegistry::new();
    let (recorder, _handles) = Recorder::new();

    let err = start(&registry, r#"{"gap_limit": 0}"#, recorder.clone()).unwrap_err();
    assert!(matches!(err, DaemonError::ConfigInvalid(_)), "got {err}");

    let err = start(&registry, "{not json", recorder.clone()).unwrap_err();
    assert!(matches!(err, DaemonError::ConfigInvalid(_)), "got {err}");

    assert!(recorder.events().is_empty());
    assert!(registry.handles().is_empty());
}

#[test]
fn rpc_failure_during_sync_fails_start() {
    let source = ScriptedSource::new(
        vec![
            Ok(chain(10, 20, 0.5)),
            Err(RpcError::Unauthorized),
            Ok(chain(20, 20, 1.0)),
        ],
        vec![],
    );
    let registry = DaemonRegistry::new();
    let (recorder, _handles) = Recorder::new();

    let err = start_with_source(&registry, test_config(false, false), source, recorder.clone())
        .unwrap_err();
    assert!(matches!(err, DaemonError::SyncFailed(RpcError::Unauthorized)), "got {err}");
    assert!(!recorder.events().contains(&DaemonEvent::Ready));
    assert!(registry.handles().is_empty());
}

#[test]
fn occupied_port_fails_with_bind_error() {
    let taken = std::net::TcpListener::bind("127.0.0.1:0").expect("reserve port");
    let config = BwtConfig {
        electrum_addr: Some(taken.local_addr().unwrap()),
        ..test_config(false, false)
    };
    let registry = DaemonRegistry::new();
    let (recorder, _handles) = Recorder::new();

    let err =
        start_with_source(&registry, config, ScriptedSource::synced(), recorder.clone()).unwrap_err();
    match err {
        DaemonError::BindFailed { server, addr, .. } => {
            assert_eq!(server, ServerKind::Electrum);
            assert_eq!(addr, taken.local_addr().unwrap());
        }
        other => panic!("expected BindFailed, got {other}"),
    }

    let events = recorder.events();
    assert!(matches!(events.first(), Some(DaemonEvent::Booting { .. })));
    assert!(!events.contains(&DaemonEvent::Ready));
    assert!(ready_addr(&events, ServerKind::Electrum).is_none());
}

#[test]
fn panicking_callback_does_not_stop_delivery() {
    struct Grumpy(Arc<Recorder>);
    impl Notifier for Grumpy {
        fn on_booting(&self, handle: ShutdownHandle) {
            self.0.on_booting(handle);
        }
        fn on_sync_progress(&self, _progress: f32, _tip_height: u32) {
            panic!("sync callback exploded");
        }
        fn on_ready(&self) {
            self.0.on_ready();
        }
    }

    let registry = DaemonRegistry::new();
    let (recorder, handles) = Recorder::new();
    let notifier = Grumpy(recorder.clone());
    let thread_registry = registry.clone();
    let runner = thread::spawn(move || {
        start_with_source(
            &thread_registry,
            test_config(false, false),
            ScriptedSource::synced(),
            notifier,
        )
    });

    let handle = handles.recv_timeout(Duration::from_secs(5)).expect("booting");
    assert!(wait_until(Duration::from_secs(5), || recorder.is_ready()));
    registry.shutdown(handle).expect("shutdown");
    runner.join().expect("runner thread").expect("clean shutdown");
}
