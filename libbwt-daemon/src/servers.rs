//! Electrum and HTTP listeners.
//!
//! Both listeners are bound before any readiness is announced, so a bind
//! failure aborts the boot without a half-reported server. Each serve loop
//! exits when the instance's shutdown signal fires.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::State;
use axum::http::{header, HeaderValue};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio_util::codec::{Framed, LinesCodec, LinesCodecError};

use libbwt_core::ServerKind;

use crate::error::{io_err, DaemonError};
use crate::protocol::{respond_line, ElectrumResponse, PARSE_ERROR};
use crate::registry::{Instance, ShutdownSignal};

/// A bound listener and the address it actually got (port 0 resolves here).
pub(crate) struct Bound {
    pub(crate) listener: TcpListener,
    pub(crate) addr: SocketAddr,
}

pub(crate) async fn bind(kind: ServerKind, addr: SocketAddr) -> Result<Bound, DaemonError> {
    let bind_failed = |source| DaemonError::BindFailed {
        server: kind,
        addr,
        source,
    };
    let listener = TcpListener::bind(addr).await.map_err(bind_failed)?;
    let addr = listener.local_addr().map_err(bind_failed)?;
    tracing::info!(server = %kind, %addr, "listener bound");
    Ok(Bound { listener, addr })
}

// ---------------------------------------------------------------------------
// Electrum
// ---------------------------------------------------------------------------

pub(crate) async fn electrum_server_task(
    bound: Bound,
    mut shutdown: ShutdownSignal,
) -> Result<(), DaemonError> {
    let Bound { listener, addr } = bound;
    loop {
        tokio::select! {
            _ = shutdown.requested() => break,
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(accepted) => accepted,
                    Err(err) => {
                        // Per-connection failures (e.g. fd exhaustion) must not
                        // take the listener down.
                        tracing::warn!(%addr, error = %err, "electrum accept failed");
                        continue;
                    }
                };
                tracing::debug!(%peer, "electrum client connected");
                let shutdown = shutdown.clone();
                tokio::spawn(async move {
                    if let Err(err) = handle_electrum_client(stream, shutdown).await {
                        tracing::warn!(%peer, error = %err, "electrum client error");
                    }
                });
            }
        }
    }
    tracing::debug!(%addr, "electrum listener stopped");
    Ok(())
}

/// Longest request line a client may send before the connection is dropped.
pub(crate) const MAX_LINE_BYTES: usize = 64 * 1024;

async fn handle_electrum_client<S>(stream: S, mut shutdown: ShutdownSignal) -> Result<(), DaemonError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut framed = Framed::new(stream, LinesCodec::new_with_max_length(MAX_LINE_BYTES));

    loop {
        let line = tokio::select! {
            _ = shutdown.requested() => break,
            line = framed.next() => line,
        };
        let line = match line {
            None => break,
            Some(Ok(line)) => line,
            Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                let response = ElectrumResponse::error(
                    Value::Null,
                    PARSE_ERROR,
                    format!("request line exceeds {MAX_LINE_BYTES} bytes"),
                );
                send_response(&mut framed, &response).await?;
                tracing::debug!("electrum client sent an oversized line, closing");
                break;
            }
            Some(Err(LinesCodecError::Io(err))) => return Err(io_err("electrum socket read", err)),
        };
        if line.trim().is_empty() {
            continue;
        }
        send_response(&mut framed, &respond_line(&line)).await?;
    }
    Ok(())
}

async fn send_response<S>(
    framed: &mut Framed<S, LinesCodec>,
    response: &ElectrumResponse,
) -> Result<(), DaemonError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let payload = serde_json::to_string(response)?;
    framed.send(payload).await.map_err(|err| match err {
        LinesCodecError::Io(err) => io_err("electrum socket write", err),
        LinesCodecError::MaxLineLengthExceeded => {
            DaemonError::Runtime("electrum response exceeded line limit".to_string())
        }
    })
}

// ---------------------------------------------------------------------------
// HTTP
// ---------------------------------------------------------------------------

#[derive(Clone)]
struct HttpState {
    instance: Arc<Instance>,
    cors: bool,
}

fn http_router(instance: Arc<Instance>, cors: bool) -> Router {
    Router::new()
        .route("/status", get(status_handler))
        .with_state(HttpState { instance, cors })
}

async fn status_handler(State(state): State<HttpState>) -> Response {
    let mut response = Json(state.instance.status()).into_response();
    if state.cors {
        response.headers_mut().insert(
            header::ACCESS_CONTROL_ALLOW_ORIGIN,
            HeaderValue::from_static("*"),
        );
    }
    response
}

pub(crate) async fn http_server_task(
    bound: Bound,
    instance: Arc<Instance>,
    cors: bool,
    mut shutdown: ShutdownSignal,
) -> Result<(), DaemonError> {
    let Bound { listener, addr } = bound;
    axum::serve(listener, http_router(instance, cors))
        .with_graceful_shutdown(async move { shutdown.requested().await })
        .await
        .map_err(|e| io_err(format!("http://{addr}"), e))?;
    tracing::debug!(%addr, "http listener stopped");
    Ok(())
}
