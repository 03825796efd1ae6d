//! Liveness probing and round-trip latency measurement.
//!
//! The monitor keeps at most one probe outstanding. A pong that does not
//! match the outstanding probe id is ignored.

use std::time::Duration;

use courier_proto::frame::{Frame, MessageId};
use tokio::time::Instant;

#[derive(Debug, Clone)]
struct Probe {
    id: MessageId,
    sent_at: Instant,
}

/// Heartbeat state for the current connection.
#[derive(Debug)]
pub struct HeartbeatMonitor {
    interval: Duration,
    timeout: Duration,
    outstanding: Option<Probe>,
    counter: u64,
}

impl HeartbeatMonitor {
    /// A monitor probing every `interval` and declaring the connection dead
    /// after `timeout` without a reply.
    #[must_use]
    pub const fn new(interval: Duration, timeout: Duration) -> Self {
        Self {
            interval,
            timeout,
            outstanding: None,
            counter: 0,
        }
    }

    /// Delay between probes.
    #[must_use]
    pub const fn interval(&self) -> Duration {
        self.interval
    }

    /// How long to wait for a pong.
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Build the next probe, or `None` if one is still awaiting its reply.
    pub fn next_probe(&mut self, now: Instant) -> Option<Frame> {
        if self.outstanding.is_some() {
            return None;
        }
        self.counter += 1;
        let id = MessageId::new(format!("hb-{}", self.counter));
        self.outstanding = Some(Probe {
            id: id.clone(),
            sent_at: now,
        });
        Some(Frame::ping(id))
    }

    /// Match a pong against the outstanding probe.
    ///
    /// Returns the round-trip time if it matches.
    pub fn on_pong(&mut self, id: &MessageId, now: Instant) -> Option<Duration> {
        match &self.outstanding {
            Some(probe) if &probe.id == id => {
                let rtt = now.saturating_duration_since(probe.sent_at);
                self.outstanding = None;
                Some(rtt)
            }
            _ => None,
        }
    }

    /// Whether a probe is awaiting its pong.
    #[must_use]
    pub const fn is_awaiting(&self) -> bool {
        self.outstanding.is_some()
    }

    /// Forget the outstanding probe, e.g. when the connection is replaced.
    pub fn reset(&mut self) {
        self.outstanding = None;
    }
}
