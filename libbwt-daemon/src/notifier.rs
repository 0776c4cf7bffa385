//! Callback sink and the thread that feeds it.
//!
//! The runtime never calls a [`Notifier`] directly. Events are queued on an
//! ordered channel and delivered one at a time from a dedicated
//! `bwt-notifier` thread, which also enforces the delivery contract:
//!
//! - `on_booting` comes first; anything queued before it is dropped.
//! - sync and scan progress are each non-decreasing; regressing samples are
//!   dropped.
//! - `on_electrum_ready`, `on_http_ready` and `on_ready` fire at most once,
//!   and the server notifications never follow `on_ready`.
//! - nothing is delivered once shutdown has been requested.

use std::any::Any;
use std::net::SocketAddr;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;

use tokio::sync::mpsc;

use libbwt_core::{DaemonEvent, ShutdownHandle};

use crate::error::{io_err, DaemonError};
use crate::registry::ShutdownSignal;

/// Lifecycle hooks implemented by the embedding application.
///
/// Every hook has an empty default so a sink only implements what it needs.
/// Hooks run on the notifier thread and must not block indefinitely: the
/// queue behind them keeps growing while they do.
pub trait Notifier: Send + 'static {
    /// The instance registered and can be shut down through `handle`.
    fn on_booting(&self, _handle: ShutdownHandle) {}

    /// Node initial sync progress; `tip_height` is the node's block height.
    fn on_sync_progress(&self, _progress: f32, _tip_height: u32) {}

    /// Wallet rescan progress; `eta` is the estimated seconds remaining.
    fn on_scan_progress(&self, _progress: f32, _eta: u32) {}

    fn on_electrum_ready(&self, _addr: SocketAddr) {}

    fn on_http_ready(&self, _addr: SocketAddr) {}

    /// All configured subsystems are up.
    fn on_ready(&self) {}
}

impl<N: Notifier + Sync> Notifier for Arc<N> {
    fn on_booting(&self, handle: ShutdownHandle) {
        (**self).on_booting(handle)
    }
    fn on_sync_progress(&self, progress: f32, tip_height: u32) {
        (**self).on_sync_progress(progress, tip_height)
    }
    fn on_scan_progress(&self, progress: f32, eta: u32) {
        (**self).on_scan_progress(progress, eta)
    }
    fn on_electrum_ready(&self, addr: SocketAddr) {
        (**self).on_electrum_ready(addr)
    }
    fn on_http_ready(&self, addr: SocketAddr) {
        (**self).on_http_ready(addr)
    }
    fn on_ready(&self) {
        (**self).on_ready()
    }
}

/// A sink that ignores everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopNotifier;

impl Notifier for NoopNotifier {}

/// Forwards every hook as a [`DaemonEvent`] into a tokio channel.
#[derive(Debug, Clone)]
pub struct ChannelNotifier {
    tx: mpsc::UnboundedSender<DaemonEvent>,
}

impl ChannelNotifier {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<DaemonEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn forward(&self, event: DaemonEvent) {
        // The receiver going away only means nobody is listening anymore.
        let _ = self.tx.send(event);
    }
}

impl Notifier for ChannelNotifier {
    fn on_booting(&self, handle: ShutdownHandle) {
        self.forward(DaemonEvent::Booting { handle });
    }
    fn on_sync_progress(&self, progress: f32, tip_height: u32) {
        self.forward(DaemonEvent::SyncProgress { progress, tip_height });
    }
    fn on_scan_progress(&self, progress: f32, eta: u32) {
        self.forward(DaemonEvent::ScanProgress { progress, eta });
    }
    fn on_electrum_ready(&self, addr: SocketAddr) {
        self.forward(DaemonEvent::ElectrumReady { addr });
    }
    fn on_http_ready(&self, addr: SocketAddr) {
        self.forward(DaemonEvent::HttpReady { addr });
    }
    fn on_ready(&self) {
        self.forward(DaemonEvent::Ready);
    }
}

/// Producer side of the event queue, cloned into every task that reports.
#[derive(Debug, Clone)]
pub(crate) struct EventSender {
    tx: mpsc::UnboundedSender<DaemonEvent>,
}

impl EventSender {
    pub(crate) fn send(&self, event: DaemonEvent) {
        if self.tx.send(event).is_err() {
            tracing::debug!("notifier thread gone; dropping event");
        }
    }
}

/// Owns the notifier thread. Dropping every [`EventSender`] and then calling
/// [`Dispatcher::finish`] drains the queue and joins the thread.
pub(crate) struct Dispatcher {
    thread: thread::JoinHandle<()>,
}

impl Dispatcher {
    pub(crate) fn spawn<N: Notifier>(
        notifier: N,
        shutdown: ShutdownSignal,
    ) -> Result<(EventSender, Dispatcher), DaemonError> {
        let (tx, mut rx) = mpsc::unbounded_channel::<DaemonEvent>();
        let thread = thread::Builder::new()
            .name("bwt-notifier".to_string())
            .spawn(move || {
                let mut contract = DeliveryContract::default();
                while let Some(event) = rx.blocking_recv() {
                    if shutdown.is_requested() {
                        tracing::trace!(?event, "shutdown requested; suppressing event");
                        continue;
                    }
                    if !contract.admit(&event) {
                        tracing::trace!(?event, "event out of order; dropped");
                        continue;
                    }
                    deliver(&notifier, event);
                }
            })
            .map_err(|e| io_err("bwt-notifier thread", e))?;

        Ok((EventSender { tx }, Dispatcher { thread }))
    }

    /// Wait for the notifier thread to drain and exit.
    pub(crate) async fn finish(self) {
        let joined = tokio::task::spawn_blocking(move || self.thread.join()).await;
        match joined {
            Ok(Ok(())) => {}
            Ok(Err(panic)) => {
                tracing::error!(panic = %fmt_panic(panic), "notifier thread panicked")
            }
            Err(err) => tracing::error!(error = %err, "notifier join task failed"),
        }
    }
}

fn deliver<N: Notifier>(notifier: &N, event: DaemonEvent) {
    let label = event_label(&event);
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| match event {
        DaemonEvent::Booting { handle } => notifier.on_booting(handle),
        DaemonEvent::SyncProgress { progress, tip_height } => {
            notifier.on_sync_progress(progress, tip_height)
        }
        DaemonEvent::ScanProgress { progress, eta } => notifier.on_scan_progress(progress, eta),
        DaemonEvent::ElectrumReady { addr } => notifier.on_electrum_ready(addr),
        DaemonEvent::HttpReady { addr } => notifier.on_http_ready(addr),
        DaemonEvent::Ready => notifier.on_ready(),
    }));
    if let Err(panic) = outcome {
        tracing::error!(callback = label, panic = %fmt_panic(panic), "notifier callback panicked");
    }
}

fn event_label(event: &DaemonEvent) -> &'static str {
    match event {
        DaemonEvent::Booting { .. } => "on_booting",
        DaemonEvent::SyncProgress { .. } => "on_sync_progress",
        DaemonEvent::ScanProgress { .. } => "on_scan_progress",
        DaemonEvent::ElectrumReady { .. } => "on_electrum_ready",
        DaemonEvent::HttpReady { .. } => "on_http_ready",
        DaemonEvent::Ready => "on_ready",
    }
}

fn fmt_panic(panic: Box<dyn Any + Send + 'static>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Ordering and once-only bookkeeping for one instance's event stream.
#[derive(Debug, Default)]
struct DeliveryContract {
    booted: bool,
    last_sync: Option<f32>,
    last_scan: Option<f32>,
    electrum_ready: bool,
    http_ready: bool,
    ready: bool,
}

impl DeliveryContract {
    fn admit(&mut self, event: &DaemonEvent) -> bool {
        match event {
            DaemonEvent::Booting { .. } => !std::mem::replace(&mut self.booted, true),
            _ if !self.booted => false,
            DaemonEvent::SyncProgress { progress, .. } => {
                !self.ready && advance(&mut self.last_sync, *progress)
            }
            DaemonEvent::ScanProgress { progress, .. } => {
                !self.ready && advance(&mut self.last_scan, *progress)
            }
            DaemonEvent::ElectrumReady { .. } => {
                !self.ready && !std::mem::replace(&mut self.electrum_ready, true)
            }
            DaemonEvent::HttpReady { .. } => {
                !self.ready && !std::mem::replace(&mut self.http_ready, true)
            }
            DaemonEvent::Ready => !std::mem::replace(&mut self.ready, true),
        }
    }
}

fn advance(last: &mut Option<f32>, next: f32) -> bool {
    match last {
        Some(prev) if next < *prev => false,
        _ => {
            *last = Some(next);
            true
        }
    }
}
