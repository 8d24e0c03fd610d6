use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Instant;
use time::OffsetDateTime;
use tokio::sync::RwLock;

use crate::clock;
use crate::db::Db;
use crate::sensors::Snapshot;

/// Maximum number of events retained in the ring buffer.
const MAX_EVENTS: usize = 200;

// ---------------------------------------------------------------------------
// Public type alias
// ---------------------------------------------------------------------------

pub type SharedState = Arc<RwLock<SystemState>>;

// ---------------------------------------------------------------------------
// Core types
// ---------------------------------------------------------------------------

pub struct SystemState {
    pub started_at: Instant,
    pub mqtt_connected: bool,
    pub latest: Option<Snapshot>,
    pub nodes: HashMap<String, NodeState>,
    pub events: VecDeque<SystemEvent>,
}

#[derive(Clone, Serialize)]
pub struct NodeState {
    #[serde(with = "time::serde::rfc3339")]
    pub last_seen: OffsetDateTime,
    pub channels: usize,
}

#[derive(Clone, Serialize)]
pub struct SystemEvent {
    #[serde(with = "time::serde::rfc3339")]
    pub ts: OffsetDateTime,
    pub kind: EventKind,
    pub detail: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Reading,
    Actuator,
    Dosing,
    Error,
    System,
}

// ---------------------------------------------------------------------------
// JSON response (what the API returns)
// ---------------------------------------------------------------------------

#[derive(Serialize)]
pub struct StatusResponse {
    pub uptime_secs: u64,
    pub mqtt_connected: bool,
    pub latest: Option<Snapshot>,
    pub nodes: HashMap<String, NodeState>,
    pub events: Vec<SystemEvent>,
}

// ---------------------------------------------------------------------------
// Construction & mutation
// ---------------------------------------------------------------------------

impl Default for SystemState {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemState {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            mqtt_connected: false,
            latest: None,
            nodes: HashMap::new(),
            events: VecDeque::with_capacity(MAX_EVENTS),
        }
    }

    pub fn shared() -> SharedState {
        Arc::new(RwLock::new(Self::new()))
    }

    /// Record a sensor snapshot from a node; it becomes the latest one.
    pub fn record_reading(&mut self, snapshot: Snapshot) {
        let detail = format!(
            "{}: {}",
            snapshot.node_id,
            snapshot
                .readings
                .iter()
                .map(|(ch, r)| format!("{ch:?}={}", r.value))
                .collect::<Vec<_>>()
                .join(", ")
        );

        self.nodes.insert(
            snapshot.node_id.clone(),
            NodeState {
                last_seen: clock::now(),
                channels: snapshot.readings.len(),
            },
        );
        self.latest = Some(snapshot);

        self.push_event(EventKind::Reading, detail);
    }

    pub fn record_actuator(&mut self, detail: String) {
        self.push_event(EventKind::Actuator, detail);
    }

    pub fn record_dosing(&mut self, detail: String) {
        self.push_event(EventKind::Dosing, detail);
    }

    /// Record an error event.
    pub fn record_error(&mut self, detail: String) {
        self.push_event(EventKind::Error, detail);
    }

    /// Record a generic system event.
    pub fn record_system(&mut self, detail: String) {
        self.push_event(EventKind::System, detail);
    }

    /// Build the JSON-serialisable status snapshot.
    pub fn to_status(&self) -> StatusResponse {
        StatusResponse {
            uptime_secs: self.started_at.elapsed().as_secs(),
            mqtt_connected: self.mqtt_connected,
            latest: self.latest.clone(),
            nodes: self.nodes.clone(),
            events: self.events.iter().rev().cloned().collect(),
        }
    }

    fn push_event(&mut self, kind: EventKind, detail: String) {
        if self.events.len() >= MAX_EVENTS {
            self.events.pop_front();
        }
        self.events.push_back(SystemEvent {
            ts: clock::now(),
            kind,
            detail,
        });
    }
}

/// Latest snapshot: the cached one when a node has reported since boot,
/// otherwise the newest persisted reading.
pub async fn latest_snapshot(shared: &SharedState, db: &Db) -> anyhow::Result<Option<Snapshot>> {
    if let Some(s) = shared.read().await.latest.clone() {
        return Ok(Some(s));
    }
    db.latest_reading().await
}

// ===========================================================================
// Tests
// ===========================================================================
