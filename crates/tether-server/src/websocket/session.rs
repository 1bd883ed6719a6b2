//! One connection task, from upgrade to close.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::ws::{CloseFrame, Message, Utf8Bytes, WebSocket};
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use metrics::{counter, gauge, histogram};
use tether_session::ContextService;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, field, info, instrument, warn};

use super::connection::Outbound;
use super::dispatch::{DispatchOutcome, HandlerRegistry, InboundContext};
use super::handshake::{
    HandshakeOutcome, HandshakeRequest, RejectReason, handshake_ack, parse_handshake,
};
use super::lifecycle::{CloseReason, ConnectionState, Lifecycle};
use super::registry::ConnectionRegistry;
use crate::config::ServerConfig;
use crate::metrics::{
    WS_CONNECTION_DURATION_SECONDS, WS_CONNECTIONS_ACTIVE, WS_CONNECTIONS_TOTAL,
    WS_DISCONNECTIONS_TOTAL, WS_HANDSHAKE_REJECTIONS_TOTAL,
};

/// How long the close path waits for the writer to flush.
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Shared state a connection task needs.
#[derive(Clone)]
pub struct ConnectionDeps {
    /// Server tunables.
    pub config: Arc<ServerConfig>,
    /// Live connections.
    pub registry: Arc<ConnectionRegistry>,
    /// Envelope handlers.
    pub handlers: Arc<HandlerRegistry>,
    /// Session and delta facade.
    pub context: ContextService,
}

/// Why the active phase ended.
enum Exit {
    /// Peer closed or the transport failed.
    Peer,
    /// The server decided to close.
    Server(CloseReason),
}

/// Handshake phase failures.
enum HandshakeFailure {
    Rejected(RejectReason),
    /// Peer went away before sending anything usable.
    Gone,
    ShuttingDown,
}

/// Drive one upgraded socket until it closes.
///
/// 1. Waits for the `connect` frame (bounded by the handshake timeout)
/// 2. Registers the client and sends the `connected` ack
/// 3. Dispatches envelopes in receipt order; a writer task drains the
///    outbound queue and sends Ping frames
/// 4. Unregisters and closes on peer close, handler failure, heartbeat
///    timeout, or shutdown
#[instrument(skip_all, fields(client_id = field::Empty, connection_id = field::Empty))]
pub async fn run_connection(
    mut socket: WebSocket,
    deps: ConnectionDeps,
    cancel: CancellationToken,
) {
    let mut lifecycle = Lifecycle::new();
    let _ = lifecycle.transition(ConnectionState::Handshaking);

    let handshake_timeout = deps.config.handshake_timeout();
    let request = match await_handshake(&mut socket, handshake_timeout, &cancel).await {
        Ok(request) => request,
        Err(failure) => {
            match failure {
                HandshakeFailure::Rejected(reason) => reject(&mut socket, reason).await,
                HandshakeFailure::ShuttingDown => {
                    let _ = socket.send(close_message(CloseReason::SHUTTING_DOWN)).await;
                }
                HandshakeFailure::Gone => debug!("peer left during handshake"),
            }
            let _ = lifecycle.transition(ConnectionState::Closed);
            return;
        }
    };

    let (tx, rx) = mpsc::channel(deps.config.send_queue_capacity.max(1));
    let registration = match deps.registry.try_register(request, tx.clone()) {
        Ok(registration) => registration,
        Err(reason) => {
            reject(&mut socket, reason).await;
            let _ = lifecycle.transition(ConnectionState::Closed);
            return;
        }
    };

    let span = tracing::Span::current();
    let _ = span.record("client_id", field::display(registration.client_id()));
    let _ = span.record("connection_id", field::display(registration.id()));

    let ack = handshake_ack(registration.client_id(), chrono::Utc::now());
    if socket.send(Message::Text(ack.to_string().into())).await.is_err() {
        debug!("peer went away before the ack");
        drop(registration);
        let _ = lifecycle.transition(ConnectionState::Closed);
        return;
    }
    let _ = lifecycle.transition(ConnectionState::Active);

    info!(session_id = ?registration.session_id(), "client connected");
    counter!(WS_CONNECTIONS_TOTAL).increment(1);
    gauge!(WS_CONNECTIONS_ACTIVE).increment(1.0);

    let (sink, mut stream) = socket.split();
    let writer = tokio::spawn(write_outbound(sink, rx, deps.config.heartbeat_interval()));

    let ctx = InboundContext {
        client_id: registration.client_id().clone(),
        connection_id: registration.id(),
        session_id: registration.session_id().cloned(),
        context: deps.context.clone(),
        registry: Arc::clone(&deps.registry),
    };

    let mut heartbeat = tokio::time::interval(deps.config.heartbeat_interval());
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let _ = heartbeat.tick().await;
    let heartbeat_timeout = deps.config.heartbeat_timeout();

    let exit = loop {
        tokio::select! {
            () = cancel.cancelled() => break Exit::Server(CloseReason::SHUTTING_DOWN),
            _ = heartbeat.tick() => {
                let silent_for = registration.last_pong_elapsed();
                if silent_for > heartbeat_timeout {
                    warn!(?silent_for, "client unresponsive, disconnecting");
                    break Exit::Server(CloseReason::HEARTBEAT_TIMEOUT);
                }
            }
            frame = stream.next() => {
                let text = match frame {
                    None | Some(Err(_) | Ok(Message::Close(_))) => break Exit::Peer,
                    Some(Ok(Message::Ping(_) | Message::Pong(_))) => {
                        registration.mark_alive();
                        continue;
                    }
                    Some(Ok(Message::Text(text))) => {
                        registration.mark_alive();
                        text.as_str().to_owned()
                    }
                    Some(Ok(Message::Binary(data))) => {
                        registration.mark_alive();
                        match String::from_utf8(data.to_vec()) {
                            Ok(text) => text,
                            Err(_) => {
                                debug!(len = data.len(), "ignoring non-UTF-8 binary frame");
                                continue;
                            }
                        }
                    }
                };
                match deps.handlers.dispatch(&text, &ctx).await {
                    DispatchOutcome::Reply(reply) => {
                        if !registration.send_json(&reply) {
                            warn!(
                                dropped = registration.drop_count(),
                                "outbound queue full, reply dropped"
                            );
                        }
                    }
                    DispatchOutcome::Silent => {}
                    DispatchOutcome::Fatal { .. } => {
                        break Exit::Server(CloseReason::INTERNAL_ERROR);
                    }
                }
            }
        }
    };

    let _ = lifecycle.transition(ConnectionState::Closing);
    let close = match exit {
        Exit::Peer => {
            debug!("peer closed");
            None
        }
        Exit::Server(reason) => {
            info!(code = reason.code, reason = reason.reason, "closing connection");
            Some(reason)
        }
    };
    let duration = registration.age();
    drop(registration);
    finish_writer(writer, tx, close).await;

    info!(?duration, "client disconnected");
    counter!(WS_DISCONNECTIONS_TOTAL).increment(1);
    gauge!(WS_CONNECTIONS_ACTIVE).decrement(1.0);
    histogram!(WS_CONNECTION_DURATION_SECONDS).record(duration.as_secs_f64());
    let _ = lifecycle.transition(ConnectionState::Closed);
}

/// Read frames until a usable `connect` frame, a rejection, or the deadline.
async fn await_handshake(
    socket: &mut WebSocket,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<HandshakeRequest, HandshakeFailure> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let frame = tokio::select! {
            () = cancel.cancelled() => return Err(HandshakeFailure::ShuttingDown),
            frame = tokio::time::timeout_at(deadline, socket.recv()) => frame,
        };
        let text = match frame {
            Err(_elapsed) => return Err(HandshakeFailure::Rejected(RejectReason::Timeout)),
            Ok(None | Some(Err(_) | Ok(Message::Close(_)))) => return Err(HandshakeFailure::Gone),
            Ok(Some(Ok(Message::Ping(_) | Message::Pong(_)))) => continue,
            Ok(Some(Ok(Message::Text(text)))) => text.as_str().to_owned(),
            Ok(Some(Ok(Message::Binary(data)))) => String::from_utf8(data.to_vec())
                .map_err(|_| HandshakeFailure::Rejected(RejectReason::NonTextFrame))?,
        };
        return match parse_handshake(&text) {
            HandshakeOutcome::Accepted(request) => Ok(request),
            HandshakeOutcome::Rejected(reason) => Err(HandshakeFailure::Rejected(reason)),
        };
    }
}

/// Send the rejection close frame and count it.
async fn reject(socket: &mut WebSocket, reason: RejectReason) {
    let close = reason.close_reason();
    info!(reason = reason.label(), code = close.code, "handshake rejected");
    counter!(WS_HANDSHAKE_REJECTIONS_TOTAL, "reason" => reason.label()).increment(1);
    let _ = socket.send(close_message(close)).await;
}

fn close_message(reason: CloseReason) -> Message {
    Message::Close(Some(CloseFrame {
        code: reason.code,
        reason: Utf8Bytes::from_static(reason.reason),
    }))
}

/// Drain the outbound queue onto the socket, pinging every `ping_every`.
async fn write_outbound(
    mut sink: SplitSink<WebSocket, Message>,
    mut rx: mpsc::Receiver<Outbound>,
    ping_every: Duration,
) {
    let mut ping = tokio::time::interval(ping_every);
    ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let _ = ping.tick().await;

    loop {
        tokio::select! {
            item = rx.recv() => match item {
                Some(Outbound::Text(text)) => {
                    if sink.send(Message::Text(text.as_str().to_owned().into())).await.is_err() {
                        break;
                    }
                }
                Some(Outbound::Close(Some(reason))) => {
                    let _ = sink.send(close_message(reason)).await;
                    break;
                }
                Some(Outbound::Close(None)) | None => {
                    let _ = sink.close().await;
                    break;
                }
            },
            _ = ping.tick() => {
                if sink.send(Message::Ping(Bytes::new())).await.is_err() {
                    break;
                }
            }
        }
    }
}

/// Queue the final close behind pending replies, then wait for the writer.
async fn finish_writer(
    mut writer: tokio::task::JoinHandle<()>,
    tx: mpsc::Sender<Outbound>,
    close: Option<CloseReason>,
) {
    let queued = tokio::time::timeout(WRITER_DRAIN_TIMEOUT, tx.send(Outbound::Close(close))).await;
    drop(tx);
    if !matches!(queued, Ok(Ok(()))) {
        writer.abort();
        return;
    }
    if tokio::time::timeout(WRITER_DRAIN_TIMEOUT, &mut writer).await.is_err() {
        warn!("writer did not drain in time");
        writer.abort();
    }
}
