//! Connection statistics.
//!
//! Counters only ever grow; the sole way to clear them is an explicit
//! [`crate::Courier::reset`].

use std::time::Duration;

use serde::{Serialize, Serializer};
use tokio::sync::watch;

/// Snapshot of accumulated counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ConnectionStats {
    /// Open attempts, initial and reconnect.
    pub connect_attempts: u64,
    /// Attempts that reached CONNECTED.
    pub successful_connections: u64,
    /// Established connections that were lost or closed.
    pub disconnections: u64,
    /// Attempts started by the backoff timer.
    pub reconnect_attempts: u64,
    /// Message frames written, first transmissions only.
    pub messages_sent: u64,
    /// Message frames received from the peer.
    pub messages_received: u64,
    /// Message frames written again after an ack timeout.
    pub retransmissions: u64,
    /// Deliveries that ended FAILED.
    pub failed_deliveries: u64,
    /// Deliveries evicted from a full offline queue.
    pub queue_evictions: u64,
    /// Heartbeat probes written.
    pub heartbeats_sent: u64,
    /// Smoothed round-trip latency over acks and pongs.
    #[serde(serialize_with = "as_millis")]
    pub average_latency: Option<Duration>,
    /// Most recent latency sample.
    #[serde(serialize_with = "as_millis")]
    pub last_latency: Option<Duration>,
}

#[allow(clippy::ref_option)]
fn as_millis<S: Serializer>(value: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error> {
    match value {
        Some(d) => serializer.serialize_some(&(d.as_secs_f64() * 1000.0)),
        None => serializer.serialize_none(),
    }
}

impl ConnectionStats {
    /// Merge a latency sample: the first sample is taken as is, later ones
    /// as `avg = (avg + sample) / 2`.
    pub fn record_latency(&mut self, sample: Duration) {
        self.average_latency = Some(match self.average_latency {
            Some(avg) => (avg + sample) / 2,
            None => sample,
        });
        self.last_latency = Some(sample);
    }
}

/// Publishes [`ConnectionStats`] to any number of readers.
///
/// Owned by the client task; readers hold [`watch::Receiver`]s and never
/// block the writer.
#[derive(Debug)]
pub struct StatsCollector {
    tx: watch::Sender<ConnectionStats>,
}

impl StatsCollector {
    /// A collector with zeroed counters.
    #[must_use]
    pub fn new() -> Self {
        let (tx, _) = watch::channel(ConnectionStats::default());
        Self { tx }
    }

    /// A new reader of the published snapshot.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<ConnectionStats> {
        self.tx.subscribe()
    }

    /// Current snapshot.
    #[must_use]
    pub fn snapshot(&self) -> ConnectionStats {
        self.tx.borrow().clone()
    }

    fn update(&self, f: impl FnOnce(&mut ConnectionStats)) {
        self.tx.send_modify(f);
    }

    /// Count a transport open, first connect or reconnect.
    pub fn record_connect_attempt(&self) {
        self.update(|s| s.connect_attempts += 1);
    }

    /// Count a transition into CONNECTED.
    pub fn record_connected(&self) {
        self.update(|s| s.successful_connections += 1);
    }

    /// Count the loss or caller-initiated close of a live connection.
    pub fn record_disconnect(&self) {
        self.update(|s| s.disconnections += 1);
    }

    /// Count an open started by the reconnect timer.
    pub fn record_reconnect_attempt(&self) {
        self.update(|s| s.reconnect_attempts += 1);
    }

    /// Count a message transmission. Resends after an ack timeout are
    /// counted by [`Self::record_retransmission`] instead.
    pub fn record_sent(&self) {
        self.update(|s| s.messages_sent += 1);
    }

    /// Count an inbound application message.
    pub fn record_received(&self) {
        self.update(|s| s.messages_received += 1);
    }

    /// Count a resend after an ack timeout.
    pub fn record_retransmission(&self) {
        self.update(|s| s.retransmissions += 1);
    }

    /// Count a message rejected without being acknowledged.
    pub fn record_failure(&self) {
        self.update(|s| s.failed_deliveries += 1);
    }

    /// Count a message dropped from the full offline queue.
    pub fn record_eviction(&self) {
        self.update(|s| s.queue_evictions += 1);
    }

    /// Count a heartbeat ping written.
    pub fn record_heartbeat(&self) {
        self.update(|s| s.heartbeats_sent += 1);
    }

    /// Fold a round-trip sample into the published stats.
    pub fn record_latency(&self, sample: Duration) {
        self.update(|s| s.record_latency(sample));
    }

    /// Zero every counter and return the values they held.
    pub fn reset(&self) -> ConnectionStats {
        self.tx.send_replace(ConnectionStats::default())
    }
}

impl Default for StatsCollector {
    fn default() -> Self {
        Self::new()
    }
}
