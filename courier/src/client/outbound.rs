//! Outbound path: submission, transmission, ack timeouts, the offline
//! queue, and heartbeat probes.

use courier_proto::codec;
use courier_proto::frame::Frame;
use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::connection::{ConnectionError, ConnectionState};
use crate::delivery::{
    AckResult, Delivery, DeliveryError, DeliveryStatus, OutboundMessage, SlotKey,
};
use crate::timers::TimerKey;
use crate::transport::Transport;

use super::actor::Actor;

/// A delivery that could not be written, and why.
type Unsent = (Delivery, ConnectionError);

fn encode_message(message: &OutboundMessage) -> Result<Vec<u8>, codec::CodecError> {
    codec::encode(&Frame::message(message.id.clone(), message.payload.clone()))
}

impl<T: Transport> Actor<T> {
    /// Accept a message from a caller: transmit it now if connected,
    /// otherwise queue it.
    pub(super) async fn submit(
        &mut self,
        message: OutboundMessage,
        reply: oneshot::Sender<Result<AckResult, DeliveryError>>,
    ) {
        let id = message.id.clone();
        if self.tracker.contains(&id) || self.queue.iter().any(|d| d.id() == &id) {
            tracing::warn!(message_id = %id, "rejecting duplicate message id");
            let _ = reply.send(Err(DeliveryError::DuplicateId { id }));
            return;
        }
        // Encoding failures surface from `transmit`.
        let size = encode_message(&message).map_or(0, |bytes| bytes.len());
        if size > codec::MAX_FRAME_SIZE {
            tracing::warn!(
                message_id = %id,
                size,
                max = codec::MAX_FRAME_SIZE,
                "rejecting oversized message"
            );
            self.stats.record_failure();
            let _ = reply.send(Err(DeliveryError::TooLarge {
                id,
                size,
                max: codec::MAX_FRAME_SIZE,
            }));
            return;
        }

        let seq = self.next_seq;
        self.next_seq += 1;
        let delivery = Delivery::new(message, seq, reply);

        if self.connection.state() == ConnectionState::Connected {
            if let Err((delivery, error)) = self.transmit(delivery).await {
                self.enqueue(delivery);
                self.connection_lost(error).await;
            }
        } else {
            tracing::debug!(
                message_id = %id,
                state = %self.connection.state(),
                queued = self.queue.len() + 1,
                "not connected, queueing message"
            );
            self.enqueue(delivery);
        }
    }

    /// Encode and write a delivery, then start waiting for its ack.
    ///
    /// A write failure hands the delivery back untouched.
    pub(super) async fn transmit(&mut self, mut delivery: Delivery) -> Result<(), Unsent> {
        let bytes = match encode_message(&delivery.message) {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!(message_id = %delivery.id(), error = %e, "cannot encode message");
                self.stats.record_failure();
                delivery.reject(DeliveryError::Encoding(e.to_string()));
                return Ok(());
            }
        };
        if let Err(error) = self.write_bytes(&bytes).await {
            return Err((delivery, error));
        }

        delivery.status = DeliveryStatus::Sent;
        self.stats.record_sent();
        tracing::debug!(
            message_id = %delivery.id(),
            seq = delivery.seq,
            retries = delivery.retry_count,
            "message sent"
        );

        let id = delivery.id().clone();
        match self.tracker.insert(delivery, Instant::now()) {
            Ok(key) => self
                .timers
                .schedule(TimerKey::AckTimeout(key), self.config.message_ack_timeout),
            Err(duplicate) => duplicate.reject(DeliveryError::DuplicateId { id }),
        }
        Ok(())
    }

    /// Send every queued message in FIFO order. Runs once per transition
    /// into CONNECTED; stops early if the connection drops.
    pub(super) async fn drain_queue(&mut self) {
        if self.queue.is_empty() {
            return;
        }
        tracing::info!(queued = self.queue.len(), "draining offline queue");
        while self.connection.state() == ConnectionState::Connected {
            let Some(delivery) = self.queue.pop_front() else {
                break;
            };
            if let Err((delivery, error)) = self.transmit(delivery).await {
                if let Some(evicted) = self.queue.push_front(delivery) {
                    self.evict(evicted);
                }
                self.connection_lost(error).await;
                break;
            }
        }
    }

    /// Retransmit the message behind `key`, or fail it once its retry
    /// budget is spent.
    pub(super) async fn ack_timeout(&mut self, key: SlotKey) {
        let max_retries = self.config.max_retries;
        let Some(waiter) = self.tracker.get_mut(key) else {
            return;
        };

        if waiter.delivery.retry_count >= max_retries {
            let Some(waiter) = self.tracker.remove(key) else {
                return;
            };
            let delivery = waiter.delivery;
            let retries = delivery.retry_count;
            tracing::warn!(message_id = %delivery.id(), retries, "message not acknowledged, giving up");
            self.stats.record_failure();
            let id = delivery.id().clone();
            delivery.reject(DeliveryError::Exhausted { id, retries });
            return;
        }

        waiter.delivery.retry_count += 1;
        waiter.sent_at = Instant::now();
        let attempt = waiter.delivery.retry_count;
        let id = waiter.delivery.id().clone();
        let encoded = encode_message(&waiter.delivery.message);

        tracing::warn!(message_id = %id, attempt, max_retries, "ack timeout expired, retransmitting");
        let bytes = match encoded {
            Ok(bytes) => bytes,
            Err(e) => {
                if let Some(waiter) = self.tracker.remove(key) {
                    self.stats.record_failure();
                    waiter.delivery.reject(DeliveryError::Encoding(e.to_string()));
                }
                return;
            }
        };
        match self.write_bytes(&bytes).await {
            Ok(()) => {
                self.stats.record_retransmission();
                self.timers
                    .schedule(TimerKey::AckTimeout(key), self.config.message_ack_timeout);
            }
            Err(error) => self.connection_lost(error).await,
        }
    }

    /// Move every un-acknowledged message back to the head of the queue in
    /// send order. Retry counts are kept.
    pub(super) fn requeue_in_flight(&mut self) {
        let in_flight = self.tracker.drain_in_send_order();
        if in_flight.is_empty() {
            return;
        }
        let mut deliveries = Vec::with_capacity(in_flight.len());
        for (key, waiter) in in_flight {
            self.timers.cancel(TimerKey::AckTimeout(key));
            let mut delivery = waiter.delivery;
            delivery.status = DeliveryStatus::Pending;
            deliveries.push(delivery);
        }
        tracing::info!(count = deliveries.len(), "requeued in-flight messages");
        for evicted in self.queue.requeue_front(deliveries) {
            self.evict(evicted);
        }
    }

    fn enqueue(&mut self, delivery: Delivery) {
        if let Some(evicted) = self.queue.enqueue(delivery) {
            self.evict(evicted);
        }
    }

    fn evict(&self, delivery: Delivery) {
        tracing::warn!(
            message_id = %delivery.id(),
            capacity = self.queue.capacity(),
            "offline queue full, evicting oldest message"
        );
        self.stats.record_eviction();
        let id = delivery.id().clone();
        delivery.reject(DeliveryError::QueueOverflow { id });
    }

    /// Write a heartbeat probe if none is outstanding and re-arm the
    /// interval timer.
    pub(super) async fn send_heartbeat(&mut self) {
        if self.connection.state() != ConnectionState::Connected {
            return;
        }
        if let Some(probe) = self.heartbeat.next_probe(Instant::now()) {
            tracing::debug!(probe_id = %probe.id(), "sending heartbeat");
            if let Err(error) = self.write_frame(&probe).await {
                self.connection_lost(error).await;
                return;
            }
            self.stats.record_heartbeat();
            self.timers
                .schedule(TimerKey::HeartbeatTimeout, self.heartbeat.timeout());
        }
        self.timers
            .schedule(TimerKey::Heartbeat, self.heartbeat.interval());
    }

    /// Encode and write a control frame.
    pub(super) async fn write_frame(&mut self, frame: &Frame) -> Result<(), ConnectionError> {
        let bytes = match codec::encode(frame) {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!(kind = %frame.kind(), error = %e, "cannot encode frame");
                return Ok(());
            }
        };
        self.write_bytes(&bytes).await
    }

    /// Write encoded bytes, giving up after the configured write timeout.
    async fn write_bytes(&mut self, bytes: &[u8]) -> Result<(), ConnectionError> {
        let limit = self.config.write_timeout;
        match tokio::time::timeout(limit, self.transport.send(bytes)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(ConnectionError::TransportLost(e.to_string())),
            Err(_) => {
                tracing::warn!(timeout_ms = limit.as_millis(), "write timed out");
                Err(ConnectionError::TransportLost(format!(
                    "write not completed within {}ms",
                    limit.as_millis()
                )))
            }
        }
    }
}
