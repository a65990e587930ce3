//! Heartbeat bookkeeping and round-trip latency.
//!
//! Only the most recent outbound heartbeat is tracked. The first inbound
//! HEARTBEAT after it is taken as the ack; clearing the send time makes a
//! duplicate ack harmless. An inbound HEARTBEAT with nothing outstanding is a
//! relay ping and gets answered.

use std::time::{Duration, Instant};

/// What to do with an inbound HEARTBEAT.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatInbound {
    /// Ack for our heartbeat; latency measured.
    Ack(Duration),
    /// Relay-initiated ping; reply with an ack.
    Ping,
}

#[derive(Debug, Default)]
pub struct HeartbeatTracker {
    sent_at: Option<Instant>,
    latency: Option<Duration>,
}

impl HeartbeatTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an outbound heartbeat. Overwrites any unanswered one.
    pub fn on_sent(&mut self, now: Instant) {
        self.sent_at = Some(now);
    }

    pub fn on_inbound(&mut self, now: Instant) -> HeartbeatInbound {
        match self.sent_at.take() {
            Some(sent) => {
                let rtt = now.saturating_duration_since(sent);
                self.latency = Some(rtt);
                HeartbeatInbound::Ack(rtt)
            }
            None => HeartbeatInbound::Ping,
        }
    }

    pub fn is_outstanding(&self) -> bool {
        self.sent_at.is_some()
    }

    /// Last measured round trip.
    pub fn latency(&self) -> Option<Duration> {
        self.latency
    }

    pub fn reset(&mut self) {
        self.sent_at = None;
        self.latency = None;
    }
}
