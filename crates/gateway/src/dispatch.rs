//! Broadcast dispatch: channel fan-out, user-targeted delivery, and batches.
//!
//! Dispatch never blocks on a consumer: the subscriber set is snapshotted,
//! the frame serialized once, and each delivery is a non-blocking enqueue on
//! that socket's bounded outbound queue. A full queue drops the socket
//! (back-pressure), never the dispatcher.

use {
    serde::{Deserialize, Serialize},
    tracing::debug,
};

use {pulse_common::UserId, pulse_protocol::SocketPacket};

use crate::state::GatewayState;

#[derive(Debug, Clone, Copy, Serialize)]
pub struct BroadcastResult {
    pub recipients: usize,
}

/// One item of a multi-broadcast request.
#[derive(Debug, Clone, Deserialize)]
pub struct BroadcastItem {
    #[serde(default)]
    pub channel: String,
    #[serde(default)]
    pub event: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

#[derive(Debug, Clone, Serialize)]
pub struct BroadcastItemResult {
    pub channel: String,
    pub event: String,
    pub recipients: usize,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Deliver an event to every current subscriber of a channel.
///
/// An unknown channel is not an error: zero recipients, success. Per-channel
/// delivery order across subscribers is unspecified; per-subscriber order
/// follows the enqueue order on that socket's queue.
pub fn broadcast(
    state: &GatewayState,
    channel: &str,
    event: &str,
    data: serde_json::Value,
) -> BroadcastResult {
    let frame = SocketPacket::event(event, data).to_engine();
    let subscribers = state.registry.subscribers(channel);
    let mut recipients = 0;

    for socket_id in &subscribers {
        let Some(socket) = state.socket(socket_id) else {
            continue;
        };
        if socket.send_raw(&frame) {
            recipients += 1;
        } else {
            state.health.record_broadcast_failure();
            metrics::counter!(pulse_metrics::broadcast::FAILURES_TOTAL).increment(1);
            state.drop_for_backpressure(&socket);
        }
    }

    state.health.record_broadcast(recipients);
    metrics::counter!(pulse_metrics::broadcast::EVENTS_TOTAL).increment(1);
    metrics::counter!(pulse_metrics::broadcast::DELIVERIES_TOTAL).increment(recipients as u64);
    debug!(channel, event, recipients, subscribers = subscribers.len(), "broadcast");

    BroadcastResult { recipients }
}

/// Deliver an event straight to a user's active socket, skipping channel
/// indirection. Zero recipients when the user is offline.
pub fn broadcast_to_user(
    state: &GatewayState,
    user_id: UserId,
    event: &str,
    data: serde_json::Value,
) -> BroadcastResult {
    let Some(socket) = state.socket_for_user(user_id) else {
        state.health.record_broadcast(0);
        metrics::counter!(pulse_metrics::broadcast::EVENTS_TOTAL).increment(1);
        return BroadcastResult { recipients: 0 };
    };

    let frame = SocketPacket::event(event, data).to_engine();
    let recipients = if socket.send_raw(&frame) {
        1
    } else {
        state.health.record_broadcast_failure();
        metrics::counter!(pulse_metrics::broadcast::FAILURES_TOTAL).increment(1);
        state.drop_for_backpressure(&socket);
        0
    };

    state.health.record_broadcast(recipients);
    metrics::counter!(pulse_metrics::broadcast::EVENTS_TOTAL).increment(1);
    metrics::counter!(pulse_metrics::broadcast::DELIVERIES_TOTAL).increment(recipients as u64);
    BroadcastResult { recipients }
}

/// Dispatch a batch. A bad item fails alone; the rest of the batch runs.
pub fn broadcast_multi(
    state: &GatewayState,
    items: Vec<BroadcastItem>,
) -> Vec<BroadcastItemResult> {
    items
        .into_iter()
        .map(|item| {
            if item.channel.is_empty() || item.event.is_empty() {
                return BroadcastItemResult {
                    channel: item.channel,
                    event: item.event,
                    recipients: 0,
                    success: false,
                    error: Some("channel and event are required".into()),
                };
            }
            let result = broadcast(state, &item.channel, &item.event, item.data);
            BroadcastItemResult {
                channel: item.channel,
                event: item.event,
                recipients: result.recipients,
                success: true,
                error: None,
            }
        })
        .collect()
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use std::sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64},
    };

    use {tokio::sync::mpsc, tokio_util::sync::CancellationToken};

    use {
        pulse_common::{Role, UserIdentity, now_ms},
        pulse_config::Config,
        pulse_protocol::{EnginePacket, SocketPacket},
    };

    use {
        super::*,
        crate::state::{ConnectedSocket, GatewayState},
    };

    fn test_state() -> Arc<GatewayState> {
        let mut config = Config::default();
        config.jwt_secret = "secret".into();
        config.upstream_api_key = "key".into();
        GatewayState::new(config, None)
    }

    fn attach_socket(
        state: &GatewayState,
        user_id: u64,
        queue: usize,
    ) -> (Arc<ConnectedSocket>, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(queue);
        let socket = Arc::new(ConnectedSocket {
            socket_id: format!("sock-{user_id}"),
            identity: UserIdentity {
                user_id,
                role: Role::Member,
                permissions: Default::default(),
                name: String::new(),
                email: String::new(),
                avatar: None,
            },
            sender: tx,
            connected_at_ms: now_ms(),
            last_activity_ms: AtomicU64::new(now_ms()),
            token_fingerprint: String::new(),
            remote_addr: "127.0.0.1:1".into(),
            user_agent: None,
            is_alive: AtomicBool::new(true),
            closer: CancellationToken::new(),
        });
        state.register_socket(Arc::clone(&socket));
        state.connections.try_claim(user_id, &socket.socket_id);
        state.connections.activate(user_id, &socket.socket_id);
        (socket, rx)
    }

    fn decode_event(frame: &str) -> (String, serde_json::Value) {
        let engine = EnginePacket::parse(frame).unwrap();
        let EnginePacket::Message(inner) = engine else {
            panic!("not a message: {frame}");
        };
        let SocketPacket::Event { name, data, .. } = SocketPacket::parse(&inner).unwrap() else {
            panic!("not an event: {inner}");
        };
        (name, data)
    }

    #[tokio::test]
    async fn broadcast_reaches_all_subscribers() {
        let state = test_state();
        let (a, mut rx_a) = attach_socket(&state, 1, 16);
        let (b, mut rx_b) = attach_socket(&state, 2, 16);
        state.registry.subscribe(&a.socket_id, 1, "public.news").unwrap();
        state.registry.subscribe(&b.socket_id, 2, "public.news").unwrap();

        let result = broadcast(&state, "public.news", "story.published", serde_json::json!({"id": 9}));
        assert_eq!(result.recipients, 2);

        for rx in [&mut rx_a, &mut rx_b] {
            let (name, data) = decode_event(&rx.recv().await.unwrap());
            assert_eq!(name, "story.published");
            assert_eq!(data["id"], 9);
        }
    }

    #[tokio::test]
    async fn per_subscriber_order_is_preserved() {
        let state = test_state();
        let (socket, mut rx) = attach_socket(&state, 1, 16);
        state
            .registry
            .subscribe(&socket.socket_id, 1, "forum.7")
            .unwrap();

        for i in 0..5 {
            broadcast(&state, "forum.7", "tick", serde_json::json!({"n": i}));
        }
        for i in 0..5 {
            let (_, data) = decode_event(&rx.recv().await.unwrap());
            assert_eq!(data["n"], i);
        }
    }

    #[tokio::test]
    async fn unknown_channel_reaches_no_one() {
        let state = test_state();
        let result = broadcast(&state, "public.empty", "e", serde_json::Value::Null);
        assert_eq!(result.recipients, 0);
        assert_eq!(state.health.snapshot().broadcast.sent, 1);
    }

    #[tokio::test]
    async fn full_queue_drops_the_slow_socket() {
        let state = test_state();
        let (socket, _rx) = attach_socket(&state, 1, 2);
        state
            .registry
            .subscribe(&socket.socket_id, 1, "public.firehose")
            .unwrap();

        // The queue holds 2 frames; the receiver never drains.
        assert_eq!(broadcast(&state, "public.firehose", "e", serde_json::Value::Null).recipients, 1);
        assert_eq!(broadcast(&state, "public.firehose", "e", serde_json::Value::Null).recipients, 1);
        let third = broadcast(&state, "public.firehose", "e", serde_json::Value::Null);
        assert_eq!(third.recipients, 0);
        // The slow consumer is torn down, not the dispatcher.
        assert!(socket.closer.is_cancelled());
        assert_eq!(state.health.snapshot().broadcast.failed, 1);
    }

    #[tokio::test]
    async fn user_broadcast_hits_the_active_socket_only() {
        let state = test_state();
        let (_socket, mut rx) = attach_socket(&state, 42, 16);

        let result = broadcast_to_user(&state, 42, "notification.sent", serde_json::json!({"t": "hi"}));
        assert_eq!(result.recipients, 1);
        let (name, _) = decode_event(&rx.recv().await.unwrap());
        assert_eq!(name, "notification.sent");

        let offline = broadcast_to_user(&state, 77, "notification.sent", serde_json::Value::Null);
        assert_eq!(offline.recipients, 0);
    }

    #[tokio::test]
    async fn multi_batch_isolates_failures() {
        let state = test_state();
        let (socket, mut rx) = attach_socket(&state, 1, 16);
        state
            .registry
            .subscribe(&socket.socket_id, 1, "public.a")
            .unwrap();

        let results = broadcast_multi(&state, vec![
            BroadcastItem {
                channel: "public.a".into(),
                event: "e1".into(),
                data: serde_json::Value::Null,
            },
            BroadcastItem {
                channel: String::new(),
                event: "e2".into(),
                data: serde_json::Value::Null,
            },
            BroadcastItem {
                channel: "public.unknown".into(),
                event: "e3".into(),
                data: serde_json::Value::Null,
            },
        ]);

        assert_eq!(results.len(), 3);
        assert!(results[0].success);
        assert_eq!(results[0].recipients, 1);
        assert!(!results[1].success);
        assert!(results[2].success);
        assert_eq!(results[2].recipients, 0);

        let (name, _) = decode_event(&rx.recv().await.unwrap());
        assert_eq!(name, "e1");
    }
}
