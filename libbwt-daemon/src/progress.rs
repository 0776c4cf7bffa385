//! Boot-time waiters: block until the node is synced and the wallet rescan is
//! done, reporting progress on the way.

use std::sync::Arc;
use std::time::Duration;

use libbwt_core::{clamp_progress, DaemonEvent, Progress};

use crate::bitcoind::{ChainInfo, ChainSource, RpcError, ScanInfo};
use crate::error::DaemonError;
use crate::notifier::EventSender;
use crate::registry::{Instance, ShutdownSignal};

/// Everything a waiter needs to poll and report.
pub(crate) struct Waiter<'a> {
    pub(crate) source: Arc<dyn ChainSource>,
    pub(crate) interval: Duration,
    pub(crate) instance: &'a Instance,
    pub(crate) events: &'a EventSender,
    pub(crate) shutdown: ShutdownSignal,
}

impl Waiter<'_> {
    /// Poll `getblockchaininfo` until initial block download is over.
    pub(crate) async fn wait_for_sync(&mut self) -> Result<ChainInfo, DaemonError> {
        loop {
            let info = match self.poll(|source| source.chain_info()).await? {
                Some(info) => info,
                None => {
                    self.sleep().await?;
                    continue;
                }
            };

            if info.is_synced() {
                tracing::info!(height = info.blocks, hash = %info.best_block_hash, "bitcoind synced");
                self.report(Progress::Sync {
                    progress: 1.0,
                    tip_height: info.blocks,
                });
                return Ok(info);
            }

            tracing::info!(
                height = info.blocks,
                headers = info.headers,
                progress = %format!("{:.2}%", info.verification_progress * 100.0),
                "waiting for bitcoind to sync",
            );
            self.report(Progress::Sync {
                progress: clamp_progress(info.verification_progress),
                tip_height: info.blocks,
            });
            self.sleep().await?;
        }
    }

    /// Poll the wallet's rescan status until no rescan is running.
    pub(crate) async fn wait_for_scan(&mut self) -> Result<(), DaemonError> {
        let mut scanned = false;
        loop {
            let scan: Option<ScanInfo> = match self.poll(|source| source.scan_info()).await? {
                Some(scan) => scan,
                None => {
                    self.sleep().await?;
                    continue;
                }
            };

            let Some(scan) = scan else {
                if scanned {
                    tracing::info!("wallet rescan completed");
                    self.report(Progress::Scan { progress: 1.0, eta: 0 });
                }
                return Ok(());
            };

            scanned = true;
            let eta = scan.eta();
            tracing::info!(
                progress = %format!("{:.2}%", scan.progress * 100.0),
                eta_secs = eta,
                "waiting for wallet rescan",
            );
            self.report(Progress::Scan {
                progress: clamp_progress(scan.progress),
                eta,
            });
            self.sleep().await?;
        }
    }

    /// Run one blocking RPC. Warm-up errors yield `None` so the caller waits;
    /// anything else fails the boot.
    async fn poll<T, F>(&mut self, call: F) -> Result<Option<T>, DaemonError>
    where
        T: Send + 'static,
        F: FnOnce(&dyn ChainSource) -> Result<T, RpcError> + Send + 'static,
    {
        let source = self.source.clone();
        let result = tokio::task::spawn_blocking(move || call(source.as_ref()))
            .await
            .map_err(|err| DaemonError::Runtime(format!("rpc task join error: {err}")))?;

        match result {
            Ok(value) => Ok(Some(value)),
            Err(err) if err.is_warmup() => {
                tracing::info!(error = %err, "bitcoind is warming up");
                Ok(None)
            }
            Err(err) => Err(DaemonError::SyncFailed(err)),
        }
    }

    fn report(&self, progress: Progress) {
        self.instance.record_progress(progress);
        self.events.send(DaemonEvent::from(progress));
    }

    async fn sleep(&mut self) -> Result<(), DaemonError> {
        tokio::select! {
            _ = self.shutdown.requested() => Err(DaemonError::Canceled),
            _ = tokio::time::sleep(self.interval) => Ok(()),
        }
    }
}
