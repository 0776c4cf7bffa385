//! Handle registry: maps each [`ShutdownHandle`] to its live instance.
//!
//! The registry is owned by the embedding process and passed to every start
//! call. An instance registers when it boots and deregisters when its run
//! ends, so a handle that outlived its daemon resolves to
//! [`DaemonError::UnknownHandle`] instead of undefined behaviour.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::watch;

use libbwt_core::{DaemonState, Progress, ServerKind, ShutdownHandle};

use crate::error::DaemonError;

/// Point-in-time view of one instance, served by the HTTP status endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct InstanceStatus {
    pub handle: ShutdownHandle,
    pub state: DaemonState,
    pub started_at_unix: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sync: Option<Progress>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scan: Option<Progress>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tip_height: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tip_hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub electrum_addr: Option<SocketAddr>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub http_addr: Option<SocketAddr>,
}

/// Receiving side of an instance's shutdown request.
#[derive(Debug, Clone)]
pub(crate) struct ShutdownSignal(watch::Receiver<bool>);

impl ShutdownSignal {
    pub(crate) fn is_requested(&self) -> bool {
        *self.0.borrow()
    }

    /// Resolves once shutdown is requested (or the instance is gone).
    pub(crate) async fn requested(&mut self) {
        let _ = self.0.wait_for(|requested| *requested).await;
    }
}

/// Shared state of one live instance.
#[derive(Debug)]
pub(crate) struct Instance {
    handle: ShutdownHandle,
    shutdown_tx: watch::Sender<bool>,
    stopped_tx: watch::Sender<bool>,
    status: RwLock<InstanceStatus>,
}

impl Instance {
    pub(crate) fn handle(&self) -> ShutdownHandle {
        self.handle
    }

    pub(crate) fn shutdown_signal(&self) -> ShutdownSignal {
        ShutdownSignal(self.shutdown_tx.subscribe())
    }

    pub(crate) fn status(&self) -> InstanceStatus {
        self.status.read().clone()
    }

    pub(crate) fn state(&self) -> DaemonState {
        self.status.read().state
    }

    /// Apply a lifecycle transition; illegal transitions are ignored.
    pub(crate) fn transition(&self, next: DaemonState) -> bool {
        let mut status = self.status.write();
        if status.state.can_transition_to(next) {
            tracing::debug!(handle = %self.handle, from = %status.state, to = %next, "state transition");
            status.state = next;
            true
        } else {
            false
        }
    }

    pub(crate) fn record_progress(&self, progress: Progress) {
        let mut status = self.status.write();
        match progress {
            Progress::Sync { tip_height, .. } => {
                status.sync = Some(progress);
                status.tip_height = Some(tip_height);
            }
            Progress::Scan { .. } => status.scan = Some(progress),
        }
    }

    pub(crate) fn record_tip(&self, height: u32, hash: &str) {
        let mut status = self.status.write();
        status.tip_height = Some(height);
        status.tip_hash = Some(hash.to_string());
    }

    pub(crate) fn record_server(&self, kind: ServerKind, addr: SocketAddr) {
        let mut status = self.status.write();
        match kind {
            ServerKind::Electrum => status.electrum_addr = Some(addr),
            ServerKind::Http => status.http_addr = Some(addr),
        }
    }

    fn request_shutdown(&self) {
        self.transition(DaemonState::ShuttingDown);
        self.shutdown_tx.send_replace(true);
    }
}

#[derive(Debug, Default)]
struct RegistryInner {
    next_id: AtomicU64,
    instances: Mutex<HashMap<ShutdownHandle, Arc<Instance>>>,
}

/// Caller-owned registry of live daemon instances. Cheap to clone.
#[derive(Debug, Clone, Default)]
pub struct DaemonRegistry {
    inner: Arc<RegistryInner>,
}

impl DaemonRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a fresh instance in the `Starting` state.
    pub(crate) fn register(&self) -> InstanceGuard {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let handle = ShutdownHandle(id);
        let (shutdown_tx, _) = watch::channel(false);
        let (stopped_tx, _) = watch::channel(false);

        let instance = Arc::new(Instance {
            handle,
            shutdown_tx,
            stopped_tx,
            status: RwLock::new(InstanceStatus {
                handle,
                state: DaemonState::Uninitialized,
                started_at_unix: unix_seconds_now(),
                sync: None,
                scan: None,
                tip_height: None,
                tip_hash: None,
                electrum_addr: None,
                http_addr: None,
            }),
        });
        instance.transition(DaemonState::Starting);

        self.inner.instances.lock().insert(handle, instance.clone());
        tracing::debug!(%handle, "instance registered");

        InstanceGuard {
            registry: self.clone(),
            instance,
        }
    }

    fn lookup(&self, handle: ShutdownHandle) -> Result<Arc<Instance>, DaemonError> {
        self.inner
            .instances
            .lock()
            .get(&handle)
            .cloned()
            .ok_or(DaemonError::UnknownHandle(handle))
    }

    /// Ask the instance behind `handle` to stop. Returns immediately; the
    /// matching start call returns once the instance has wound down.
    /// Repeated requests for an instance that is still stopping are no-ops.
    pub fn shutdown(&self, handle: ShutdownHandle) -> Result<(), DaemonError> {
        let instance = self.lookup(handle)?;
        tracing::info!(%handle, "shutdown requested");
        instance.request_shutdown();
        Ok(())
    }

    /// Request shutdown and wait until the instance has fully stopped.
    pub async fn shutdown_and_wait(
        &self,
        handle: ShutdownHandle,
        timeout: Duration,
    ) -> Result<(), DaemonError> {
        let instance = self.lookup(handle)?;
        let mut stopped = instance.stopped_tx.subscribe();
        instance.request_shutdown();
        drop(instance);

        // An inner Err means the instance was dropped, which only happens
        // after it stopped.
        let waited = tokio::time::timeout(timeout, stopped.wait_for(|done| *done))
            .await
            .map(|_| ());
        match waited {
            Ok(()) => Ok(()),
            Err(_) => Err(DaemonError::ShutdownTimeout { handle, timeout }),
        }
    }

    pub fn state(&self, handle: ShutdownHandle) -> Option<DaemonState> {
        self.lookup(handle).ok().map(|instance| instance.state())
    }

    pub fn status(&self, handle: ShutdownHandle) -> Option<InstanceStatus> {
        self.lookup(handle).ok().map(|instance| instance.status())
    }

    /// Handles of every live instance, sorted.
    pub fn handles(&self) -> Vec<ShutdownHandle> {
        let mut handles: Vec<_> = self.inner.instances.lock().keys().copied().collect();
        handles.sort();
        handles
    }

    /// Request shutdown of every live instance.
    pub fn shutdown_all(&self) {
        let instances: Vec<_> = self.inner.instances.lock().values().cloned().collect();
        for instance in instances {
            instance.request_shutdown();
        }
    }
}

/// Keeps an instance registered for the duration of its run. Dropping the
/// guard marks it `Stopped`, wakes waiters and removes it from the registry.
#[derive(Debug)]
pub(crate) struct InstanceGuard {
    registry: DaemonRegistry,
    instance: Arc<Instance>,
}

impl InstanceGuard {
    pub(crate) fn instance(&self) -> &Arc<Instance> {
        &self.instance
    }
}

impl Drop for InstanceGuard {
    fn drop(&mut self) {
        let handle = self.instance.handle;
        if self.instance.state() == DaemonState::Running {
            self.instance.transition(DaemonState::ShuttingDown);
        }
        self.instance.transition(DaemonState::Stopped);
        self.registry.inner.instances.lock().remove(&handle);
        self.instance.stopped_tx.send_replace(true);
        tracing::debug!(%handle, "instance deregistered");
    }
}

fn unix_seconds_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
