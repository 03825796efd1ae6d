//! Inbound path: frame routing for the live connection.
//!
//! Malformed frames are logged and dropped; they never tear down the
//! connection.

use courier_proto::codec;
use courier_proto::frame::{Frame, MessageId};
use tokio::time::Instant;

use crate::dispatch::InboundMessage;
use crate::timers::TimerKey;
use crate::transport::Transport;

use super::actor::Actor;

impl<T: Transport> Actor<T> {
    pub(super) async fn on_inbound(&mut self, bytes: &[u8]) {
        let frame = match codec::decode(bytes) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!(len = bytes.len(), error = %e, "dropping malformed frame");
                return;
            }
        };
        tracing::debug!(kind = %frame.kind(), id = %frame.id(), "frame received");

        match frame {
            Frame::Ack { id, .. } => self.on_ack(&id),
            Frame::Pong { id, .. } => self.on_pong(&id),
            Frame::Ping { id, .. } => {
                if let Err(error) = self.write_frame(&Frame::pong(id)).await {
                    self.connection_lost(error).await;
                }
            }
            Frame::Message {
                id,
                payload,
                timestamp,
            } => {
                self.stats.record_received();
                let acked = self.write_frame(&Frame::ack(id.clone())).await;
                self.dispatcher.dispatch_message(&InboundMessage {
                    id,
                    payload,
                    timestamp,
                });
                if let Err(error) = acked {
                    self.connection_lost(error).await;
                }
            }
        }
    }

    /// Resolve the waiter for `id`. Unknown ids are late or duplicate acks
    /// and are ignored.
    fn on_ack(&mut self, id: &MessageId) {
        let Some((key, waiter)) = self.tracker.acknowledge(id) else {
            tracing::debug!(message_id = %id, "ignoring ack with no pending message");
            return;
        };
        self.timers.cancel(TimerKey::AckTimeout(key));
        let latency = waiter.sent_at.elapsed();
        self.stats.record_latency(latency);
        tracing::debug!(
            message_id = %id,
            latency_ms = latency.as_millis(),
            retries = waiter.delivery.retry_count,
            "message acknowledged"
        );
        waiter.delivery.resolve(latency);
    }

    fn on_pong(&mut self, id: &MessageId) {
        match self.heartbeat.on_pong(id, Instant::now()) {
            Some(rtt) => {
                self.timers.cancel(TimerKey::HeartbeatTimeout);
                self.stats.record_latency(rtt);
                tracing::debug!(probe_id = %id, rtt_ms = rtt.as_millis(), "heartbeat reply");
            }
            None => tracing::debug!(probe_id = %id, "ignoring unmatched pong"),
        }
    }
}
