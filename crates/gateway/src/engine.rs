//! Engine.IO transport plumbing on `/socket.io/`.
//!
//! Three entry points share one session model:
//! - `GET` without a sid opens a polling session (handshake),
//! - `GET`/`POST` with a sid drain and feed an existing polling session,
//! - a WebSocket upgrade either starts a fresh session or upgrades a polling
//!   session after the `2probe`/`3probe`/`5` exchange.
//!
//! A session is a pair of channels: `to_client` (engine-encoded frames,
//! bounded — the back-pressure boundary) and `inbound` (raw packets handed
//! to the session driver in [`crate::socket`]).

use std::{
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use {
    axum::{
        extract::{
            ConnectInfo, FromRequestParts, Query, State, WebSocketUpgrade,
            ws::{Message, WebSocket},
        },
        http::{HeaderMap, StatusCode, header},
        response::{IntoResponse, Response},
    },
    futures::{SinkExt, stream::StreamExt},
    serde::Deserialize,
    tokio::sync::{Mutex, mpsc},
    tokio_util::sync::CancellationToken,
    tracing::{debug, warn},
};

use pulse_protocol::{
    ENGINE_VERSION, EnginePacket, MAX_PAYLOAD_BYTES, OpenPayload, encode_polling_payload,
    split_polling_payload,
};

use crate::{
    server::AppState,
    socket::{self, HandshakeContext},
    state::GatewayState,
};

/// Inbound queue depth between the transport and the session driver.
const INBOUND_QUEUE: usize = 64;
/// Extra slack over the ping interval before an idle poll returns a noop.
const POLL_SLACK: Duration = Duration::from_secs(5);

// ── Session ──────────────────────────────────────────────────────────────────

/// One live transport session (at most one socket).
#[derive(Debug)]
pub struct EngineSession {
    pub sid: String,
    /// Outbound frames; cloned into the connected socket as its sender.
    pub to_client: mpsc::Sender<String>,
    /// Raw inbound packets toward the driver.
    pub inbound: mpsc::Sender<String>,
    /// Receiver half of `to_client`, drained by exactly one transport at a
    /// time (a pending poll or the websocket writer).
    outbox: Mutex<mpsc::Receiver<String>>,
    /// Set once the websocket upgrade commits; polling then only drains.
    upgraded: AtomicBool,
    pub closer: CancellationToken,
}

impl EngineSession {
    fn open_packet(&self, state: &GatewayState, polling: bool) -> String {
        EnginePacket::open(&OpenPayload {
            sid: self.sid.clone(),
            upgrades: if polling {
                vec!["websocket".into()]
            } else {
                Vec::new()
            },
            ping_interval: state.config.heartbeat.ping_interval_ms,
            ping_timeout: state.config.heartbeat.ping_timeout_ms,
            max_payload: MAX_PAYLOAD_BYTES as u64,
        })
        .encode()
    }
}

fn create_session(state: &Arc<GatewayState>, ctx: HandshakeContext) -> Arc<EngineSession> {
    let (to_client, outbox) = mpsc::channel(state.config.limits.outbound_queue_frames);
    let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_QUEUE);
    let session = Arc::new(EngineSession {
        sid: uuid::Uuid::new_v4().to_string(),
        to_client,
        inbound: inbound_tx,
        outbox: Mutex::new(outbox),
        upgraded: AtomicBool::new(false),
        closer: CancellationToken::new(),
    });
    state
        .engine_sessions
        .insert(session.sid.clone(), Arc::clone(&session));
    tokio::spawn(socket::drive(
        Arc::clone(state),
        Arc::clone(&session),
        inbound_rx,
        ctx,
    ));
    session
}

// ── HTTP entry points ────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct EngineQuery {
    #[serde(rename = "EIO")]
    pub eio: Option<u32>,
    pub transport: Option<String>,
    pub sid: Option<String>,
    pub token: Option<String>,
}

fn handshake_context(
    headers: &HeaderMap,
    query: &EngineQuery,
    addr: SocketAddr,
) -> HandshakeContext {
    let header_token = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::to_string);
    let user_agent = headers
        .get(header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    HandshakeContext {
        header_token,
        query_token: query.token.clone(),
        remote_addr: addr.to_string(),
        user_agent,
    }
}

fn engine_error(status: StatusCode, message: &str) -> Response {
    (
        status,
        axum::Json(serde_json::json!({ "message": message })),
    )
        .into_response()
}

fn polling_body(body: String) -> Response {
    (
        [(header::CONTENT_TYPE, "text/plain; charset=UTF-8")],
        body,
    )
        .into_response()
}

/// `GET /socket.io/` — polling handshake, poll drain, or websocket upgrade.
pub async fn engine_get(
    State(app): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Query(query): Query<EngineQuery>,
    request: axum::extract::Request,
) -> Response {
    let state = &app.gateway;
    if query.eio.is_some_and(|v| v != ENGINE_VERSION) {
        return engine_error(StatusCode::BAD_REQUEST, "unsupported protocol version");
    }
    let (mut parts, _body) = request.into_parts();
    let headers = parts.headers.clone();

    if query.transport.as_deref() == Some("websocket") {
        let ws = match <WebSocketUpgrade as FromRequestParts<()>>::from_request_parts(
            &mut parts,
            &(),
        )
        .await
        {
            Ok(ws) => ws,
            Err(_) => {
                return engine_error(
                    StatusCode::BAD_REQUEST,
                    "websocket transport requires upgrade",
                );
            },
        };
        return match &query.sid {
            Some(sid) => match state.engine_sessions.get(sid).map(|s| Arc::clone(&s)) {
                Some(session) => {
                    ws.on_upgrade(move |socket| ws_upgrade_transport(session, socket))
                },
                None => engine_error(StatusCode::BAD_REQUEST, "unknown session"),
            },
            None => {
                let state = Arc::clone(state);
                let ctx = handshake_context(&headers, &query, addr);
                ws.on_upgrade(move |socket| ws_direct_transport(state, ctx, socket))
            },
        };
    }

    // Polling transport.
    match &query.sid {
        None => {
            let session = create_session(state, handshake_context(&headers, &query, addr));
            let open = session.open_packet(state, true);
            polling_body(open)
        },
        Some(sid) => match state.engine_sessions.get(sid).map(|s| Arc::clone(&s)) {
            Some(session) => poll_drain(state, session).await,
            None => engine_error(StatusCode::BAD_REQUEST, "unknown session"),
        },
    }
}

/// `POST /socket.io/` — client packets over the polling transport.
pub async fn engine_post(
    State(app): State<AppState>,
    Query(query): Query<EngineQuery>,
    body: String,
) -> Response {
    let state = &app.gateway;
    let Some(sid) = &query.sid else {
        return engine_error(StatusCode::BAD_REQUEST, "missing sid");
    };
    if body.len() > MAX_PAYLOAD_BYTES {
        return engine_error(StatusCode::PAYLOAD_TOO_LARGE, "payload too large");
    }
    let Some(session) = state.engine_sessions.get(sid).map(|s| Arc::clone(&s)) else {
        return engine_error(StatusCode::BAD_REQUEST, "unknown session");
    };
    for raw in split_polling_payload(&body) {
        if session.inbound.send(raw.to_string()).await.is_err() {
            break;
        }
    }
    polling_body("ok".into())
}

/// Hold the poll open until frames arrive, the session closes, or the wait
/// passes the ping interval (the driver's keepalive normally wakes it first).
async fn poll_drain(state: &GatewayState, session: Arc<EngineSession>) -> Response {
    if session.upgraded.load(Ordering::SeqCst) {
        // The websocket owns the session now; polling only sees filler.
        return polling_body(EnginePacket::Noop.encode());
    }
    let Ok(mut outbox) = session.outbox.try_lock() else {
        // A second concurrent poll for one session is a protocol violation.
        return engine_error(StatusCode::BAD_REQUEST, "overlapping poll");
    };

    let wait = Duration::from_millis(state.config.heartbeat.ping_interval_ms) + POLL_SLACK;
    let first = tokio::select! {
        _ = session.closer.cancelled() => {
            let mut packets = Vec::new();
            while let Ok(frame) = outbox.try_recv() {
                packets.push(frame);
            }
            packets.push(EnginePacket::Close.encode());
            return polling_body(encode_polling_payload(&packets));
        },
        frame = outbox.recv() => frame,
        _ = tokio::time::sleep(wait) => {
            return polling_body(EnginePacket::Noop.encode());
        },
    };

    let Some(first) = first else {
        return polling_body(EnginePacket::Close.encode());
    };
    let mut packets = vec![first];
    while let Ok(frame) = outbox.try_recv() {
        packets.push(frame);
    }
    polling_body(encode_polling_payload(&packets))
}

// ── WebSocket transports ─────────────────────────────────────────────────────

/// Fresh session opened directly over a websocket.
async fn ws_direct_transport(state: Arc<GatewayState>, ctx: HandshakeContext, ws: WebSocket) {
    let session = create_session(&state, ctx);
    let open = session.open_packet(&state, false);
    let (mut tx, rx) = ws.split();
    if tx.send(Message::Text(open.into())).await.is_err() {
        session.closer.cancel();
        return;
    }
    pump_websocket(session, tx, rx).await;
}

/// Upgrade of an existing polling session: answer the probe, commit, then
/// take over both directions.
async fn ws_upgrade_transport(session: Arc<EngineSession>, ws: WebSocket) {
    let (mut tx, mut rx) = ws.split();

    // Probe phase: 2probe → 3probe, then 5 commits the upgrade.
    loop {
        let message = tokio::select! {
            _ = session.closer.cancelled() => return,
            message = rx.next() => message,
        };
        let text = match message {
            Some(Ok(Message::Text(t))) => t.to_string(),
            Some(Ok(Message::Close(_))) | None => return,
            Some(Ok(_)) => continue,
            Some(Err(e)) => {
                debug!(sid = %session.sid, error = %e, "upgrade probe read error");
                return;
            },
        };
        match EnginePacket::parse(&text) {
            Ok(EnginePacket::Ping(Some(probe))) if probe == "probe" => {
                if tx
                    .send(Message::Text(EnginePacket::Pong(Some("probe".into())).encode().into()))
                    .await
                    .is_err()
                {
                    return;
                }
            },
            Ok(EnginePacket::Upgrade) => {
                session.upgraded.store(true, Ordering::SeqCst);
                // Wake a pending poll so it releases the outbox.
                let _ = session.to_client.try_send(EnginePacket::Noop.encode());
                break;
            },
            Ok(other) => {
                debug!(sid = %session.sid, packet = ?other, "unexpected packet during upgrade");
            },
            Err(e) => {
                warn!(sid = %session.sid, error = %e, "bad packet during upgrade");
                return;
            },
        }
    }

    pump_websocket(session, tx, rx).await;
}

/// Bridge a websocket to the session channels until either side ends.
async fn pump_websocket(
    session: Arc<EngineSession>,
    mut tx: futures::stream::SplitSink<WebSocket, Message>,
    mut rx: futures::stream::SplitStream<WebSocket>,
) {
    let writer_session = Arc::clone(&session);
    let writer = tokio::spawn(async move {
        let mut outbox = writer_session.outbox.lock().await;
        loop {
            tokio::select! {
                _ = writer_session.closer.cancelled() => {
                    // Flush whatever is already queued before closing.
                    while let Ok(frame) = outbox.try_recv() {
                        if tx.send(Message::Text(frame.into())).await.is_err() {
                            return;
                        }
                    }
                    let _ = tx.send(Message::Text(EnginePacket::Close.encode().into())).await;
                    let _ = tx.send(Message::Close(None)).await;
                    return;
                },
                frame = outbox.recv() => {
                    match frame {
                        Some(frame) => {
                            if tx.send(Message::Text(frame.into())).await.is_err() {
                                return;
                            }
                        },
                        None => return,
                    }
                },
            }
        }
    });

    while let Some(message) = rx.next().await {
        let text = match message {
            Ok(Message::Text(t)) => t.to_string(),
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                debug!(sid = %session.sid, error = %e, "websocket read error");
                break;
            },
        };
        if text.len() > MAX_PAYLOAD_BYTES {
            warn!(sid = %session.sid, size = text.len(), "inbound frame too large");
            continue;
        }
        if session.inbound.send(text).await.is_err() {
            break;
        }
    }

    // Transport is gone; the driver owns state cleanup.
    session.closer.cancel();
    let _ = writer.await;
}
