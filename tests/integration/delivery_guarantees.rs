// Test-specific lint overrides: integration tests use unwrap/expect freely,
// and some pedantic/nursery lints are not appropriate for test code.
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::future_not_send,
    clippy::missing_panics_doc,
    clippy::significant_drop_tightening
)]

//! Delivery guarantees over the loopback transport.
//!
//! Every test runs with a paused clock, so backoff delays, ack timeouts and
//! heartbeat intervals elapse instantly once all tasks are idle. The
//! [`LoopbackPeer`] plays the backend: it reads what the client writes,
//! acknowledges selectively, and severs sessions to simulate network loss.

use std::sync::Arc;
use std::time::Duration;

use courier::transport::loopback::{LoopbackPeer, LoopbackTransport, OpenBehavior};
use courier::{
    ConfigError, ConnectError, ConnectionError, ConnectionState, ConnectionStats, Courier,
    CourierConfig, DeliveryError, DispatchError, MessageId, OutboundMessage, StateChange,
};
use courier_proto::codec::MAX_FRAME_SIZE;
use courier_proto::frame::Frame;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::Instant;

// =============================================================================
// Helpers
// =============================================================================

fn test_config() -> CourierConfig {
    CourierConfig {
        reconnect_interval: Duration::from_millis(100),
        max_reconnect_interval: Duration::from_secs(1),
        max_reconnect_attempts: 3,
        ping_interval: Duration::from_secs(60),
        heartbeat_timeout: Duration::from_secs(5),
        connection_timeout: Duration::from_millis(500),
        message_ack_timeout: Duration::from_secs(1),
        max_retries: 2,
        ..CourierConfig::default()
    }
}

fn start(config: CourierConfig) -> (Courier, LoopbackPeer, mpsc::UnboundedReceiver<DispatchError>) {
    let (transport, peer) = LoopbackTransport::create_pair();
    let (courier, errors) = Courier::new(transport, config).unwrap();
    (courier, peer, errors)
}

/// Next `message` frame written by the client, skipping control frames.
async fn next_message(peer: &mut LoopbackPeer) -> MessageId {
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(120), peer.next_frame())
            .await
            .expect("timed out waiting for a message frame")
            .expect("transport dropped");
        if let Frame::Message { id, .. } = frame {
            return id;
        }
    }
}

type StateLog = Arc<Mutex<Vec<(Instant, StateChange)>>>;

/// Record every state change with the (paused) time it was published.
async fn record_states(courier: &Courier) -> StateLog {
    let log: StateLog = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&log);
    courier
        .on_connection_state_change(move |change| {
            sink.lock().push((Instant::now(), change.clone()));
            Ok(())
        })
        .await
        .unwrap();
    log
}

async fn wait_for_state(courier: &Courier, target: ConnectionState) {
    let mut state = courier.watch_state();
    tokio::time::timeout(Duration::from_secs(120), state.wait_for(|s| *s == target))
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {target}"))
        .unwrap();
}

// =============================================================================
// Construction
// =============================================================================

#[tokio::test]
async fn invalid_config_is_rejected_at_construction() {
    let (transport, _peer) = LoopbackTransport::create_pair();
    let config = CourierConfig {
        ping_interval: Duration::ZERO,
        ..test_config()
    };
    let result = Courier::new(transport, config);
    assert!(matches!(result, Err(ConfigError::Invalid(msg)) if msg.contains("ping_interval")));
}

// =============================================================================
// Ordering and acknowledgment
// =============================================================================

#[tokio::test(start_paused = true)]
async fn messages_are_sent_in_submission_order() {
    let (courier, mut peer, _errors) = start(test_config());
    courier.connect().await.unwrap();

    let mut receipts = Vec::new();
    for i in 0..20 {
        receipts.push(
            courier
                .submit(OutboundMessage::text(format!("m{i}"), format!("body {i}")))
                .await
                .unwrap(),
        );
    }

    let mut seen = Vec::new();
    for _ in 0..20 {
        seen.push(next_message(&mut peer).await);
    }
    let expected: Vec<MessageId> = (0..20).map(|i| MessageId::new(format!("m{i}"))).collect();
    assert_eq!(seen, expected);

    // Acks may arrive in any order.
    for id in seen.iter().rev() {
        assert!(peer.ack(id));
    }
    for receipt in receipts {
        let ack = receipt.wait().await.unwrap();
        assert_eq!(ack.retries, 0);
    }

    let stats = courier.stats();
    assert_eq!(stats.messages_sent, 20);
    assert_eq!(stats.retransmissions, 0);
    assert!(stats.average_latency.is_some());
    assert_eq!(courier.pending().await.unwrap().in_flight, 0);
}

#[tokio::test(start_paused = true)]
async fn unacknowledged_message_fails_after_max_retries() {
    let config = CourierConfig {
        message_ack_timeout: Duration::from_millis(100),
        max_retries: 2,
        ..test_config()
    };
    let (courier, mut peer, _errors) = start(config);
    courier.connect().await.unwrap();

    let started = Instant::now();
    let receipt = courier.submit(OutboundMessage::text("m1", "hi")).await.unwrap();
    let result = receipt.wait().await;

    assert_eq!(
        result,
        Err(DeliveryError::Exhausted {
            id: MessageId::new("m1"),
            retries: 2
        })
    );
    assert!(started.elapsed() >= Duration::from_millis(300));

    // One original transmission plus two retransmissions.
    for _ in 0..3 {
        assert_eq!(next_message(&mut peer).await.as_str(), "m1");
    }

    let stats = courier.stats();
    assert_eq!(stats.messages_sent, 1);
    assert_eq!(stats.retransmissions, 2);
    assert_eq!(stats.failed_deliveries, 1);
    assert_eq!(courier.state(), ConnectionState::Connected);
}

#[tokio::test(start_paused = true)]
async fn ack_after_retransmission_reports_retry_count() {
    let config = CourierConfig {
        message_ack_timeout: Duration::from_millis(100),
        max_retries: 3,
        ..test_config()
    };
    let (courier, mut peer, _errors) = start(config);
    courier.connect().await.unwrap();

    let receipt = courier.submit(OutboundMessage::text("m1", "hi")).await.unwrap();
    assert_eq!(next_message(&mut peer).await.as_str(), "m1");
    assert_eq!(next_message(&mut peer).await.as_str(), "m1");
    assert!(peer.ack(&MessageId::new("m1")));

    let ack = receipt.wait().await.unwrap();
    assert_eq!(ack.id.as_str(), "m1");
    assert_eq!(ack.retries, 1);
    assert_eq!(courier.stats().retransmissions, 1);
}

#[tokio::test(start_paused = true)]
async fn late_and_duplicate_acks_are_ignored() {
    let config = CourierConfig {
        message_ack_timeout: Duration::from_millis(100),
        max_retries: 0,
        ..test_config()
    };
    let (courier, mut peer, _errors) = start(config);
    courier.connect().await.unwrap();

    let receipt = courier.submit(OutboundMessage::text("late", "x")).await.unwrap();
    assert!(matches!(
        receipt.wait().await,
        Err(DeliveryError::Exhausted { retries: 0, .. })
    ));
    assert_eq!(next_message(&mut peer).await.as_str(), "late");

    // The ack arrives after the message already failed.
    assert!(peer.ack(&MessageId::new("late")));
    assert!(peer.ack(&MessageId::new("never-sent")));

    let receipt = courier.submit(OutboundMessage::text("m2", "y")).await.unwrap();
    let id = next_message(&mut peer).await;
    assert!(peer.ack(&id));
    assert!(peer.ack(&id));
    assert!(receipt.wait().await.is_ok());

    let stats = courier.stats();
    assert_eq!(stats.failed_deliveries, 1);
    assert_eq!(courier.pending().await.unwrap().in_flight, 0);
    assert_eq!(courier.state(), ConnectionState::Connected);
}

#[tokio::test(start_paused = true)]
async fn oversized_message_is_rejected_without_sending() {
    let (courier, mut peer, _errors) = start(test_config());
    courier.connect().await.unwrap();

    let result = courier
        .send(OutboundMessage::text("huge", "x".repeat(MAX_FRAME_SIZE)))
        .await;
    match result {
        Err(DeliveryError::TooLarge { id, size, max }) => {
            assert_eq!(id.as_str(), "huge");
            assert_eq!(max, MAX_FRAME_SIZE);
            assert!(size > max);
        }
        other => panic!("expected TooLarge, got {other:?}"),
    }

    // Nothing was written for the oversized message.
    let receipt = courier.submit(OutboundMessage::text("small", "ok")).await.unwrap();
    let id = next_message(&mut peer).await;
    assert_eq!(id.as_str(), "small");
    assert!(peer.ack(&id));
    assert!(receipt.wait().await.is_ok());

    let stats = courier.stats();
    assert_eq!(stats.messages_sent, 1);
    assert_eq!(stats.failed_deliveries, 1);
    assert_eq!(courier.state(), ConnectionState::Connected);
}

#[tokio::test(start_paused = true)]
async fn duplicate_in_flight_id_is_rejected() {
    let (courier, mut peer, _errors) = start(test_config());
    courier.connect().await.unwrap();

    let first = courier.submit(OutboundMessage::text("dup", "a")).await.unwrap();
    let second = courier.submit(OutboundMessage::text("dup", "b")).await.unwrap();
    assert_eq!(
        second.wait().await,
        Err(DeliveryError::DuplicateId {
            id: MessageId::new("dup")
        })
    );

    let id = next_message(&mut peer).await;
    assert!(peer.ack(&id));
    assert!(first.wait().await.is_ok());
}

// =============================================================================
// Offline queue
// =============================================================================

#[tokio::test(start_paused = true)]
async fn queued_messages_are_sent_before_new_ones() {
    let (courier, mut peer, _errors) = start(test_config());

    let q1 = courier.submit(OutboundMessage::text("q1", "a")).await.unwrap();
    let q2 = courier.submit(OutboundMessage::text("q2", "b")).await.unwrap();
    assert_eq!(courier.pending().await.unwrap().queued, 2);

    courier.connect().await.unwrap();
    let n1 = courier.submit(OutboundMessage::text("n1", "c")).await.unwrap();

    let order: Vec<String> = [
        next_message(&mut peer).await,
        next_message(&mut peer).await,
        next_message(&mut peer).await,
    ]
    .iter()
    .map(|id| id.as_str().to_owned())
    .collect();
    assert_eq!(order, ["q1", "q2", "n1"]);

    for id in ["q1", "q2", "n1"] {
        assert!(peer.ack(&MessageId::new(id)));
    }
    for receipt in [q1, q2, n1] {
        assert!(receipt.wait().await.is_ok());
    }
}

#[tokio::test(start_paused = true)]
async fn full_queue_evicts_oldest() {
    let config = CourierConfig {
        offline_queue_capacity: 2,
        ..test_config()
    };
    let (courier, mut peer, _errors) = start(config);

    let a = courier.submit(OutboundMessage::text("a", "1")).await.unwrap();
    let b = courier.submit(OutboundMessage::text("b", "2")).await.unwrap();
    let c = courier.submit(OutboundMessage::text("c", "3")).await.unwrap();

    let evicted = a.wait().await.unwrap_err();
    assert_eq!(
        evicted,
        DeliveryError::QueueOverflow {
            id: MessageId::new("a")
        }
    );
    assert!(evicted.is_retryable());
    assert_eq!(courier.pending().await.unwrap().queued, 2);
    assert_eq!(courier.stats().queue_evictions, 1);

    courier.connect().await.unwrap();
    assert_eq!(next_message(&mut peer).await.as_str(), "b");
    assert_eq!(next_message(&mut peer).await.as_str(), "c");
    assert!(peer.ack(&MessageId::new("b")));
    assert!(peer.ack(&MessageId::new("c")));
    assert!(b.wait().await.is_ok());
    assert!(c.wait().await.is_ok());
}

// =============================================================================
// Connection lifecycle
// =============================================================================

#[tokio::test(start_paused = true)]
async fn disconnect_is_idempotent() {
    let (courier, _peer, _errors) = start(test_config());
    let log = record_states(&courier).await;

    // Nothing to do while already disconnected.
    courier.disconnect().await;
    assert!(log.lock().is_empty());

    courier.connect().await.unwrap();
    courier.disconnect().await;
    courier.disconnect().await;

    assert_eq!(courier.state(), ConnectionState::Disconnected);
    let transitions: Vec<_> = log
        .lock()
        .iter()
        .map(|(_, c)| (c.previous, c.current))
        .collect();
    assert_eq!(
        transitions,
        [
            (ConnectionState::Disconnected, ConnectionState::Connecting),
            (ConnectionState::Connecting, ConnectionState::Connected),
            (ConnectionState::Connected, ConnectionState::Disconnected),
        ]
    );
    assert_eq!(courier.stats().disconnections, 1);
}

#[tokio::test(start_paused = true)]
async fn connect_while_connected_resolves_immediately() {
    let (courier, peer, _errors) = start(test_config());
    courier.connect().await.unwrap();
    courier.connect().await.unwrap();
    assert_eq!(peer.open_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn disconnect_requeues_in_flight_messages() {
    let (courier, mut peer, _errors) = start(test_config());
    courier.connect().await.unwrap();

    let receipt = courier.submit(OutboundMessage::text("m1", "x")).await.unwrap();
    assert_eq!(next_message(&mut peer).await.as_str(), "m1");

    courier.disconnect().await;
    let pending = courier.pending().await.unwrap();
    assert_eq!(pending.in_flight, 0);
    assert_eq!(pending.queued, 1);

    courier.connect().await.unwrap();
    assert_eq!(next_message(&mut peer).await.as_str(), "m1");
    assert!(peer.ack(&MessageId::new("m1")));
    assert!(receipt.wait().await.is_ok());
}

#[tokio::test(start_paused = true)]
async fn reconnect_delays_double() {
    let (courier, peer, _errors) = start(test_config());
    let log = record_states(&courier).await;
    peer.set_open_behavior(OpenBehavior::Refuse);

    let result = courier.connect().await;
    assert!(matches!(
        result,
        Err(ConnectError::Failed(ConnectionError::TransportLost(_)))
    ));
    wait_for_state(&courier, ConnectionState::Error).await;

    let attempts: Vec<Instant> = log
        .lock()
        .iter()
        .filter(|(_, c)| c.current == ConnectionState::Connecting)
        .map(|(at, _)| *at)
        .collect();
    assert_eq!(attempts.len(), 4);
    let gaps: Vec<Duration> = attempts.windows(2).map(|w| w[1] - w[0]).collect();
    for (gap, expected) in gaps.iter().zip([100u64, 200, 400]) {
        let expected = Duration::from_millis(expected);
        assert!(
            *gap >= expected && *gap < expected + Duration::from_millis(20),
            "gap {gap:?}, expected {expected:?}"
        );
    }

    let stats = courier.stats();
    assert_eq!(stats.connect_attempts, 4);
    assert_eq!(stats.reconnect_attempts, 3);
    assert_eq!(peer.open_count(), 4);
}

#[tokio::test(start_paused = true)]
async fn exhausted_reconnects_are_fatal() {
    let config = CourierConfig {
        max_reconnect_attempts: 2,
        ..test_config()
    };
    let (courier, mut peer, _errors) = start(config);
    let log = record_states(&courier).await;
    peer.set_open_behavior(OpenBehavior::Refuse);

    assert!(courier.connect().await.is_err());
    wait_for_state(&courier, ConnectionState::Error).await;

    let last = log.lock().last().map(|(_, c)| c.clone()).unwrap();
    assert_eq!(last.current, ConnectionState::Error);
    assert_eq!(
        last.error,
        Some(ConnectionError::ReconnectExhausted { attempts: 2 })
    );
    assert!(last.error.as_ref().is_some_and(ConnectionError::is_fatal));
    assert_eq!(peer.open_count(), 3);

    // No further attempts happen on their own.
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(peer.open_count(), 3);

    // Messages submitted after the failure wait for an explicit connect.
    let receipt = courier.submit(OutboundMessage::text("later", "x")).await.unwrap();
    assert_eq!(courier.pending().await.unwrap().queued, 1);

    peer.set_open_behavior(OpenBehavior::Accept);
    courier.connect().await.unwrap();
    assert_eq!(next_message(&mut peer).await.as_str(), "later");
    assert!(peer.ack(&MessageId::new("later")));
    assert!(receipt.wait().await.is_ok());
}

#[tokio::test(start_paused = true)]
async fn stalled_open_times_out_and_retries() {
    let (courier, peer, _errors) = start(test_config());
    peer.set_open_behavior(OpenBehavior::Stall);

    let started = Instant::now();
    let result = courier.connect().await;
    assert_eq!(result, Err(ConnectError::Failed(ConnectionError::Timeout)));
    assert!(started.elapsed() >= Duration::from_millis(500));

    peer.set_open_behavior(OpenBehavior::Accept);
    wait_for_state(&courier, ConnectionState::Connected).await;
    assert_eq!(peer.open_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn in_flight_messages_survive_a_dropped_connection() {
    let (courier, mut peer, _errors) = start(test_config());
    let log = record_states(&courier).await;
    courier.connect().await.unwrap();

    let mut receipts = Vec::new();
    for id in ["a", "b", "c"] {
        receipts.push(courier.submit(OutboundMessage::text(id, id)).await.unwrap());
    }
    for expected in ["a", "b", "c"] {
        assert_eq!(next_message(&mut peer).await.as_str(), expected);
    }

    peer.sever();

    // The client reconnects and retransmits in the original order.
    for expected in ["a", "b", "c"] {
        let id = next_message(&mut peer).await;
        assert_eq!(id.as_str(), expected);
        assert!(peer.ack(&id));
    }
    for receipt in receipts {
        assert!(receipt.wait().await.is_ok());
    }

    let states: Vec<ConnectionState> = log.lock().iter().map(|(_, c)| c.current).collect();
    assert_eq!(
        states,
        [
            ConnectionState::Connecting,
            ConnectionState::Connected,
            ConnectionState::Reconnecting,
            ConnectionState::Connecting,
            ConnectionState::Connected,
        ]
    );

    let stats = courier.stats();
    assert_eq!(stats.successful_connections, 2);
    assert_eq!(stats.disconnections, 1);
    assert_eq!(stats.reconnect_attempts, 1);
    assert_eq!(stats.messages_sent, 6);
    assert_eq!(stats.retransmissions, 0);
}

#[tokio::test(start_paused = true)]
async fn stalled_write_drops_the_connection() {
    let config = CourierConfig {
        ping_interval: Duration::from_secs(1),
        heartbeat_timeout: Duration::from_millis(500),
        message_ack_timeout: Duration::from_millis(200),
        write_timeout: Duration::from_millis(300),
        ..test_config()
    };
    let (courier, mut peer, _errors) = start(config);
    let log = record_states(&courier).await;
    courier.connect().await.unwrap();

    peer.set_write_stall(true);
    let receipt = courier.submit(OutboundMessage::text("m1", "x")).await.unwrap();
    let started = Instant::now();
    wait_for_state(&courier, ConnectionState::Reconnecting).await;
    assert!(started.elapsed() >= Duration::from_millis(300));
    peer.set_write_stall(false);

    let lost = log
        .lock()
        .iter()
        .find(|(_, c)| c.current == ConnectionState::Reconnecting)
        .map(|(_, c)| c.clone())
        .unwrap();
    assert!(matches!(lost.error, Some(ConnectionError::TransportLost(_))));

    // The message that never left is sent on the next connection.
    let id = next_message(&mut peer).await;
    assert_eq!(id.as_str(), "m1");
    assert!(peer.ack(&id));
    let ack = receipt.wait().await.unwrap();
    assert_eq!(ack.retries, 0);

    assert_eq!(courier.state(), ConnectionState::Connected);
    let stats = courier.stats();
    assert_eq!(stats.disconnections, 1);
    assert_eq!(stats.successful_connections, 2);
}

#[tokio::test(start_paused = true)]
async fn disconnect_completes_while_a_write_stalls() {
    let config = CourierConfig {
        write_timeout: Duration::from_millis(300),
        ..test_config()
    };
    let (courier, peer, _errors) = start(config);
    courier.connect().await.unwrap();

    peer.set_write_stall(true);
    let _receipt = courier.submit(OutboundMessage::text("m1", "x")).await.unwrap();
    tokio::time::timeout(Duration::from_secs(5), courier.disconnect())
        .await
        .expect("disconnect blocked behind a stalled write");

    assert_eq!(courier.state(), ConnectionState::Disconnected);
    assert_eq!(courier.pending().await.unwrap().queued, 1);
    assert_eq!(courier.stats().disconnections, 1);
}

// =============================================================================
// Heartbeat
// =============================================================================

#[tokio::test(start_paused = true)]
async fn missing_pong_triggers_reconnect() {
    let config = CourierConfig {
        ping_interval: Duration::from_secs(1),
        heartbeat_timeout: Duration::from_millis(500),
        ..test_config()
    };
    let (courier, _peer, _errors) = start(config);
    let log = record_states(&courier).await;
    courier.connect().await.unwrap();

    let started = Instant::now();
    wait_for_state(&courier, ConnectionState::Reconnecting).await;
    assert!(started.elapsed() >= Duration::from_millis(1500));

    let lost = log
        .lock()
        .iter()
        .find(|(_, c)| c.current == ConnectionState::Reconnecting)
        .map(|(_, c)| c.clone())
        .unwrap();
    assert_eq!(lost.error, Some(ConnectionError::HeartbeatTimeout));
    assert!(courier.stats().heartbeats_sent >= 1);
}

#[tokio::test(start_paused = true)]
async fn answered_heartbeats_keep_the_connection() {
    let config = CourierConfig {
        ping_interval: Duration::from_secs(1),
        heartbeat_timeout: Duration::from_millis(500),
        ..test_config()
    };
    let (courier, mut peer, _errors) = start(config);
    courier.connect().await.unwrap();

    let responder = tokio::spawn(async move {
        while let Some(frame) = peer.next_frame().await {
            if let Frame::Ping { id, .. } = frame {
                peer.send(&Frame::pong(id));
            }
        }
    });

    tokio::time::sleep(Duration::from_millis(3500)).await;

    assert_eq!(courier.state(), ConnectionState::Connected);
    let stats = courier.stats();
    assert_eq!(stats.heartbeats_sent, 3);
    assert_eq!(stats.disconnections, 0);
    assert!(stats.last_latency.is_some());
    responder.abort();
}

// =============================================================================
// Inbound traffic and subscribers
// =============================================================================

#[tokio::test(start_paused = true)]
async fn inbound_message_is_acknowledged_and_dispatched() {
    let (courier, mut peer, _errors) = start(test_config());
    let (tx, mut rx) = mpsc::unbounded_channel();
    courier
        .on_message(move |m| {
            let _ = tx.send(m.clone());
            Ok(())
        })
        .await
        .unwrap();
    courier.connect().await.unwrap();
    assert!(peer.accept().await);

    assert!(peer.send(&Frame::message(
        MessageId::new("in-1"),
        serde_json::json!({"body": "hello"})
    )));
    let ack = peer.next_frame().await.unwrap();
    assert!(matches!(ack, Frame::Ack { .. }));
    assert_eq!(ack.id().as_str(), "in-1");

    let received = rx.recv().await.unwrap();
    assert_eq!(received.id.as_str(), "in-1");
    assert_eq!(received.payload["body"], "hello");

    assert!(peer.send(&Frame::ping(MessageId::new("srv-ping-7"))));
    let pong = peer.next_frame().await.unwrap();
    assert!(matches!(pong, Frame::Pong { .. }));
    assert_eq!(pong.id().as_str(), "srv-ping-7");

    assert_eq!(courier.stats().messages_received, 1);
}

#[tokio::test(start_paused = true)]
async fn malformed_inbound_frames_are_dropped() {
    let (courier, mut peer, _errors) = start(test_config());
    courier.connect().await.unwrap();
    assert!(peer.accept().await);

    assert!(peer.send_raw(b"{not json".to_vec()));
    assert!(peer.send_raw(br#"{"type":"shout","id":"x"}"#.to_vec()));
    assert!(peer.send(&Frame::ping(MessageId::new("after"))));

    let pong = peer.next_frame().await.unwrap();
    assert_eq!(pong.id().as_str(), "after");
    assert_eq!(courier.state(), ConnectionState::Connected);
}

#[tokio::test(start_paused = true)]
async fn failing_handlers_do_not_affect_others() {
    let (courier, mut peer, mut errors) = start(test_config());
    let failing = courier
        .on_message(|_| Err("handler refused".into()))
        .await
        .unwrap();
    let panicking = courier
        .on_message(|_| panic!("handler exploded"))
        .await
        .unwrap();
    let (tx, mut rx) = mpsc::unbounded_channel();
    courier
        .on_message(move |m| {
            let _ = tx.send(m.id.clone());
            Ok(())
        })
        .await
        .unwrap();

    courier.connect().await.unwrap();
    assert!(peer.accept().await);
    assert!(peer.send(&Frame::message(MessageId::new("in-1"), serde_json::Value::Null)));

    assert_eq!(rx.recv().await.unwrap().as_str(), "in-1");
    assert_eq!(
        errors.recv().await.unwrap(),
        DispatchError::Failed {
            subscriber: failing,
            reason: "handler refused".to_string()
        }
    );
    assert_eq!(
        errors.recv().await.unwrap(),
        DispatchError::Panicked {
            subscriber: panicking,
            reason: "handler exploded".to_string()
        }
    );
    assert_eq!(courier.state(), ConnectionState::Connected);
}

#[tokio::test(start_paused = true)]
async fn unsubscribed_handler_stops_receiving() {
    let (courier, mut peer, _errors) = start(test_config());
    let count = Arc::new(Mutex::new(0u32));
    let sink = Arc::clone(&count);
    let id = courier
        .on_message(move |_| {
            *sink.lock() += 1;
            Ok(())
        })
        .await
        .unwrap();
    courier.connect().await.unwrap();
    assert!(peer.accept().await);

    assert!(peer.send(&Frame::message(MessageId::new("one"), serde_json::Value::Null)));
    peer.next_frame().await.unwrap();
    assert!(courier.unsubscribe(id).await.unwrap());
    assert!(!courier.unsubscribe(id).await.unwrap());

    assert!(peer.send(&Frame::message(MessageId::new("two"), serde_json::Value::Null)));
    peer.next_frame().await.unwrap();
    // A round trip through the client task orders this after the dispatch.
    courier.pending().await.unwrap();
    assert_eq!(*count.lock(), 1);
}

// =============================================================================
// Reset and shutdown
// =============================================================================

#[tokio::test(start_paused = true)]
async fn reset_rejects_pending_and_clears_stats() {
    let (courier, mut peer, _errors) = start(test_config());
    courier.connect().await.unwrap();

    let receipt = courier.submit(OutboundMessage::text("m1", "x")).await.unwrap();
    let id = next_message(&mut peer).await;
    assert!(peer.ack(&id));
    assert!(receipt.wait().await.is_ok());

    courier.disconnect().await;
    let queued = courier.submit(OutboundMessage::text("m2", "y")).await.unwrap();

    let before = courier.reset().await.unwrap();
    assert_eq!(before.messages_sent, 1);
    assert_eq!(before.successful_connections, 1);
    assert_eq!(before.disconnections, 1);
    assert_eq!(queued.wait().await, Err(DeliveryError::Shutdown));
    assert_eq!(courier.stats(), ConnectionStats::default());
    assert_eq!(courier.state(), ConnectionState::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn shutdown_rejects_in_flight_and_refuses_new_work() {
    let (courier, mut peer, _errors) = start(test_config());
    courier.connect().await.unwrap();

    let receipt = courier.submit(OutboundMessage::text("m1", "x")).await.unwrap();
    assert_eq!(next_message(&mut peer).await.as_str(), "m1");

    courier.shutdown().await;
    assert_eq!(receipt.wait().await, Err(DeliveryError::Shutdown));
    assert_eq!(
        courier.send(OutboundMessage::text("m2", "y")).await,
        Err(DeliveryError::Shutdown)
    );
    assert_eq!(courier.connect().await, Err(ConnectError::Shutdown));
    courier.shutdown().await;
}
