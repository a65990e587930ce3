//! In-memory traffic log of envelopes sent and received.
//!
//! ## Design
//!
//! - **Ring buffer**: `VecDeque<TrafficEntry>` capped at `max_entries`
//!   (default 1000). The oldest entries fall off when the buffer is full.
//! - **Monotonic IDs**: every entry gets an increasing `id`, so a view can ask
//!   for "everything since N" without gaps even after entries are dropped.
//! - **Pause**: while paused, new envelopes are counted but not stored.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::protocol::{Body, Envelope, MessageType, PeerStatus};
use crate::util::truncate_str;

const SUMMARY_MAX: usize = 120;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Inbound,
    Outbound,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Info,
    Success,
    Warning,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrafficEntry {
    pub id: u64,
    pub timestamp: DateTime<Utc>,
    pub direction: Direction,
    pub message_type: MessageType,
    pub level: Level,
    pub message_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    pub summary: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

/// Filters are ANDed; `None` or an empty list matches everything.
#[derive(Debug, Clone, Default)]
pub struct TrafficFilter {
    pub types: Vec<MessageType>,
    pub direction: Option<Direction>,
    pub client_ids: Vec<String>,
    pub levels: Vec<Level>,
    pub search: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
}

impl TrafficFilter {
    fn matches(&self, e: &TrafficEntry, needle: Option<&str>) -> bool {
        (self.types.is_empty() || self.types.contains(&e.message_type))
            && self.direction.map_or(true, |d| e.direction == d)
            && (self.client_ids.is_empty()
                || e.client_id
                    .as_ref()
                    .is_some_and(|c| self.client_ids.contains(c)))
            && (self.levels.is_empty() || self.levels.contains(&e.level))
            && self.since.map_or(true, |t| e.timestamp >= t)
            && self.until.map_or(true, |t| e.timestamp <= t)
            && needle.map_or(true, |n| {
                e.summary.to_lowercase().contains(n)
                    || e.message_type.as_str().to_lowercase().contains(n)
                    || e
                        .client_id
                        .as_ref()
                        .is_some_and(|c| c.to_lowercase().contains(n))
            })
    }
}

pub struct TrafficLog {
    entries: RwLock<VecDeque<TrafficEntry>>,
    next_id: AtomicU64,
    max_entries: RwLock<usize>,
    paused: AtomicBool,
    dropped_while_paused: AtomicU64,
}

impl TrafficLog {
    pub fn new(max_entries: usize) -> Self {
        let max_entries = max_entries.max(1);
        Self {
            entries: RwLock::new(VecDeque::with_capacity(max_entries.min(1024))),
            next_id: AtomicU64::new(1),
            max_entries: RwLock::new(max_entries),
            paused: AtomicBool::new(false),
            dropped_while_paused: AtomicU64::new(0),
        }
    }

    /// Append an envelope and return its entry id, or `None` while paused.
    pub fn record(&self, direction: Direction, envelope: &Envelope) -> Option<u64> {
        if self.paused.load(Ordering::Relaxed) {
            self.dropped_while_paused.fetch_add(1, Ordering::Relaxed);
            return None;
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let entry = TrafficEntry {
            id,
            timestamp: Utc::now(),
            direction,
            message_type: envelope.message_type(),
            level: level_of(&envelope.body),
            message_id: envelope.message_id.clone(),
            client_id: client_of(envelope),
            request_id: envelope.correlation_id().map(ToString::to_string),
            summary: summarize(&envelope.body),
            payload: serde_json::to_value(envelope)
                .ok()
                .and_then(|mut v| v.get_mut("payload").map(Value::take)),
        };

        let max = *self.max_entries.read();
        let mut entries = self.entries.write();
        while entries.len() >= max {
            entries.pop_front();
        }
        entries.push_back(entry);
        Some(id)
    }

    pub fn clear(&self) {
        self.entries.write().clear();
    }

    pub fn set_paused(&self, paused: bool) {
        self.paused.store(paused, Ordering::Relaxed);
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Relaxed)
    }

    /// Envelopes not stored because the log was paused.
    pub fn dropped_while_paused(&self) -> u64 {
        self.dropped_while_paused.load(Ordering::Relaxed)
    }

    /// Change capacity, dropping the oldest entries that no longer fit.
    pub fn set_max_entries(&self, max: usize) {
        let max = max.max(1);
        *self.max_entries.write() = max;
        let mut entries = self.entries.write();
        while entries.len() > max {
            entries.pop_front();
        }
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    pub fn entries(&self) -> Vec<TrafficEntry> {
        self.entries.read().iter().cloned().collect()
    }

    /// Entries with `id > since_id`, up to `limit`.
    pub fn read_since(&self, since_id: u64, limit: usize) -> Vec<TrafficEntry> {
        self.entries
            .read()
            .iter()
            .filter(|e| e.id > since_id)
            .take(limit)
            .cloned()
            .collect()
    }

    pub fn filtered(&self, filter: &TrafficFilter) -> Vec<TrafficEntry> {
        let needle = filter
            .search
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_lowercase);
        self.entries
            .read()
            .iter()
            .filter(|e| filter.matches(e, needle.as_deref()))
            .cloned()
            .collect()
    }
}

fn client_of(envelope: &Envelope) -> Option<String> {
    if let Some(id) = &envelope.target_client_id {
        return Some(id.clone());
    }
    match &envelope.body {
        Body::Status(s) => s.peer_id().map(ToString::to_string),
        _ => None,
    }
}

fn level_of(body: &Body) -> Level {
    match body {
        Body::Error(_) => Level::Error,
        Body::Response(r) if !r.success => Level::Error,
        Body::Response(_) | Body::ConnectAck(_) => Level::Success,
        Body::Status(s) if matches!(s.status, PeerStatus::PeerDisconnected | PeerStatus::Unpaired) => {
            Level::Warning
        }
        _ => Level::Info,
    }
}

fn summarize(body: &Body) -> String {
    let text = match body {
        Body::Connect(c) => format!(
            "connect (version {})",
            c.version.as_deref().unwrap_or("unknown")
        ),
        Body::ConnectAck(a) => format!("session {}", a.session_id),
        Body::Chat(c) => c.text.clone(),
        Body::Command(c) => match &c.params {
            Some(p) => format!("{} {p}", c.command),
            None => c.command.clone(),
        },
        Body::Response(r) if r.success => match r.execution_time {
            Some(ms) => format!("ok ({ms}ms)"),
            None => "ok".to_string(),
        },
        Body::Response(r) => format!(
            "failed: {}",
            r.error.as_deref().unwrap_or("unknown error")
        ),
        Body::Status(s) => match s.status {
            PeerStatus::Paired => "paired",
            PeerStatus::PeerDisconnected => "peer_disconnected",
            PeerStatus::PeerReconnected => "peer_reconnected",
            PeerStatus::Unpaired => "unpaired",
            PeerStatus::Other => "unknown status",
        }
        .to_string(),
        Body::Error(e) => format!("{}: {}", e.code, e.message),
        Body::Heartbeat => "heartbeat".to_string(),
    };
    truncate_str(&text, SUMMARY_MAX)
}
