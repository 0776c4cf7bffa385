use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use libbwt_core::{BwtConfig, DaemonEvent, DaemonState, ServerKind};

use crate::bitcoind::{BitcoindRpc, ChainInfo, ChainSource};
use crate::error::{io_err, DaemonError};
use crate::logging::init_logging;
use crate::notifier::{ChannelNotifier, Dispatcher, EventSender, Notifier};
use crate::progress::Waiter;
use crate::registry::{DaemonRegistry, Instance, ShutdownSignal};
use crate::servers::{self, Bound};
use crate::webhooks::{WebhookEvent, WebhookSender};

/// An instance started with [`spawn`]: lifecycle events arrive on `events`,
/// `task` resolves once the instance has stopped.
pub struct RunningDaemon {
    pub events: mpsc::UnboundedReceiver<DaemonEvent>,
    pub task: JoinHandle<Result<(), DaemonError>>,
}

/// Parse `json_config`, start the daemon against the configured bitcoind and
/// block the current thread until it is shut down.
///
/// The shutdown handle arrives through `on_booting` and must be used from a
/// different thread. An invalid config fails before any callback fires.
/// Calling this from inside a tokio runtime fails with
/// [`DaemonError::Runtime`]; async callers use [`run`] or [`spawn`].
pub fn start<N: Notifier>(
    registry: &DaemonRegistry,
    json_config: &str,
    notifier: N,
) -> Result<(), DaemonError> {
    let config = BwtConfig::from_json(json_config)?;
    let source = Arc::new(BitcoindRpc::from_config(&config)?);
    start_with_source(registry, config, source, notifier)
}

/// Blocking start with an explicit chain source.
pub fn start_with_source<N: Notifier>(
    registry: &DaemonRegistry,
    config: BwtConfig,
    source: Arc<dyn ChainSource>,
    notifier: N,
) -> Result<(), DaemonError> {
    config.validate()?;
    if tokio::runtime::Handle::try_current().is_ok() {
        return Err(DaemonError::Runtime(
            "start blocks its thread; call run or spawn from async code".to_string(),
        ));
    }
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .thread_name("bwt-runtime")
        .enable_all()
        .build()
        .map_err(|e| io_err("tokio-runtime", e))?;
    runtime.block_on(run(registry, config, source, notifier))
}

/// Spawn the daemon on the current tokio runtime. Must be called from
/// within a runtime.
pub fn spawn(
    registry: &DaemonRegistry,
    config: BwtConfig,
    source: Arc<dyn ChainSource>,
) -> RunningDaemon {
    let (notifier, events) = ChannelNotifier::new();
    let registry = registry.clone();
    let task = tokio::spawn(async move { run(&registry, config, source, notifier).await });
    RunningDaemon { events, task }
}

/// Request shutdown of the instance behind `handle`.
pub fn shutdown(
    registry: &DaemonRegistry,
    handle: libbwt_core::ShutdownHandle,
) -> Result<(), DaemonError> {
    registry.shutdown(handle)
}

/// One-shot connectivity check against the configured bitcoind.
pub fn test_rpc(config: &BwtConfig) -> Result<ChainInfo, DaemonError> {
    config.validate()?;
    let rpc = BitcoindRpc::from_config(config)?;
    let info = rpc.chain_info()?;
    if config.bitcoind_wallet.is_some() {
        rpc.scan_info()?;
    }
    tracing::info!(chain = %info.chain, height = info.blocks, "bitcoind rpc reachable");
    Ok(info)
}

/// Run one daemon instance to completion.
///
/// Returns `Ok(())` when the instance stopped because shutdown was requested,
/// including a shutdown that interrupted the boot.
pub async fn run<N: Notifier>(
    registry: &DaemonRegistry,
    config: BwtConfig,
    source: Arc<dyn ChainSource>,
    notifier: N,
) -> Result<(), DaemonError> {
    config.validate()?;
    if config.setup_logger {
        init_logging(config.verbose);
    }

    let guard = registry.register();
    let instance = guard.instance().clone();
    let handle = instance.handle();

    let (events, dispatcher) = Dispatcher::spawn(notifier, instance.shutdown_signal())?;
    tracing::info!(%handle, network = %config.network, "daemon booting");
    events.send(DaemonEvent::Booting { handle });

    let result = serve(&config, source, &instance, &events).await;

    // No callback may run once the start call has returned.
    drop(events);
    dispatcher.finish().await;
    drop(guard);

    match result {
        Err(DaemonError::Canceled) => {
            tracing::info!(%handle, "start canceled by shutdown");
            Ok(())
        }
        Err(err) => {
            tracing::warn!(%handle, error = %err, "daemon stopped with error");
            Err(err)
        }
        Ok(()) => {
            tracing::debug!(%handle, "daemon stopped successfully");
            Ok(())
        }
    }
}

async fn serve(
    config: &BwtConfig,
    source: Arc<dyn ChainSource>,
    instance: &Arc<Instance>,
    events: &EventSender,
) -> Result<(), DaemonError> {
    let mut shutdown = instance.shutdown_signal();

    let mut waiter = Waiter {
        source: source.clone(),
        interval: config.poll_interval,
        instance: instance.as_ref(),
        events,
        shutdown: shutdown.clone(),
    };
    let synced = waiter.wait_for_sync().await?;
    waiter.wait_for_scan().await?;
    instance.record_tip(synced.blocks, &synced.best_block_hash);

    if shutdown.is_requested() {
        return Err(DaemonError::Canceled);
    }

    // Bind everything before announcing anything.
    let electrum = match config.electrum_addr {
        Some(addr) => Some(servers::bind(ServerKind::Electrum, addr).await?),
        None => None,
    };
    let http = match config.http_addr {
        Some(addr) => Some(servers::bind(ServerKind::Http, addr).await?),
        None => None,
    };

    let mut tasks: Vec<(&'static str, JoinHandle<Result<(), DaemonError>>)> = Vec::new();

    if let Some(bound) = electrum {
        announce(instance, events, ServerKind::Electrum, &bound);
        tasks.push((
            "electrum_server",
            tokio::spawn(servers::electrum_server_task(bound, shutdown.clone())),
        ));
    }
    if let Some(bound) = http {
        announce(instance, events, ServerKind::Http, &bound);
        tasks.push((
            "http_server",
            tokio::spawn(servers::http_server_task(
                bound,
                instance.clone(),
                config.http_cors,
                shutdown.clone(),
            )),
        ));
    }

    tasks.push((
        "tip_follower",
        tokio::spawn(follow_tip(
            source,
            instance.clone(),
            synced,
            config.poll_interval,
            WebhookSender::new(config.webhooks_urls.clone()),
            shutdown.clone(),
        )),
    ));

    if instance.transition(DaemonState::Running) {
        events.send(DaemonEvent::Ready);
        tracing::info!(handle = %instance.handle(), "bwt is ready");
    }

    shutdown.requested().await;
    tracing::info!(handle = %instance.handle(), "shutting down");

    let mut first_error = None;
    for (name, task) in tasks {
        if let Err(err) = handle_join(name, task.await) {
            tracing::error!(task = name, error = %err, "task failed during shutdown");
            first_error.get_or_insert(err);
        }
    }
    match first_error {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

fn announce(instance: &Instance, events: &EventSender, kind: ServerKind, bound: &Bound) {
    instance.record_server(kind, bound.addr);
    let event = match kind {
        ServerKind::Electrum => DaemonEvent::ElectrumReady { addr: bound.addr },
        ServerKind::Http => DaemonEvent::HttpReady { addr: bound.addr },
    };
    tracing::info!(server = %kind, addr = %bound.addr, "server ready");
    events.send(event);
}

/// Poll the node tip after readiness, recording changes and posting
/// webhooks. RPC errors are logged and retried on the next tick.
async fn follow_tip(
    source: Arc<dyn ChainSource>,
    instance: Arc<Instance>,
    synced: ChainInfo,
    interval: std::time::Duration,
    webhooks: WebhookSender,
    mut shutdown: ShutdownSignal,
) -> Result<(), DaemonError> {
    let mut tip = (synced.blocks, synced.best_block_hash);
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    ticker.tick().await; // consume the first immediate tick

    loop {
        tokio::select! {
            _ = shutdown.requested() => break,
            _ = ticker.tick() => {
                let source = source.clone();
                let info = tokio::task::spawn_blocking(move || source.chain_info())
                    .await
                    .map_err(|err| DaemonError::Runtime(format!("tip poll join error: {err}")))?;
                let info = match info {
                    Ok(info) => info,
                    Err(err) => {
                        tracing::warn!(error = %err, "tip poll failed; retrying");
                        continue;
                    }
                };
                if (info.blocks, info.best_block_hash.as_str()) == (tip.0, tip.1.as_str()) {
                    continue;
                }

                tracing::info!(height = info.blocks, hash = %info.best_block_hash, "new chain tip");
                instance.record_tip(info.blocks, &info.best_block_hash);
                tip = (info.blocks, info.best_block_hash);

                if !webhooks.is_empty() {
                    let webhooks = webhooks.clone();
                    let event = WebhookEvent::chain_tip(tip.0, &tip.1);
                    tokio::task::spawn_blocking(move || webhooks.send(&event));
                }
            }
        }
    }
    Ok(())
}

fn handle_join(
    task: &str,
    result: Result<Result<(), DaemonError>, tokio::task::JoinError>,
) -> Result<(), DaemonError> {
    match result {
        Ok(inner) => inner,
        Err(err) => Err(DaemonError::Runtime(format!(
            "{task} task join failure: {err}"
        ))),
    }
}
