use std::collections::BTreeMap;

use serde::Deserialize;
use time::OffsetDateTime;

use crate::actuator::Status;
use crate::events::Event;
use crate::sensors::{Channel, ChannelReading, Snapshot};

// ---------------------------------------------------------------------------
// Topics
// ---------------------------------------------------------------------------

pub(crate) const READING_TOPICS: &str = "tele/+/reading";
pub(crate) const COMMAND_TOPICS: &str = "actuator/+/set";
/// Broadcast-sink events, JSON `{type, data}`.
pub(crate) const EVENTS_TOPIC: &str = "hydro/events";

// ---------------------------------------------------------------------------
// MQTT message types
// ---------------------------------------------------------------------------

/// Reservoir snapshot as published by a node. `ts` is Unix seconds.
#[derive(Debug, Deserialize)]
pub(crate) struct ReadingMsg {
    pub(crate) ts: i64,
    pub(crate) readings: BTreeMap<Channel, ChannelReading>,
}

impl ReadingMsg {
    pub(crate) fn into_snapshot(self, node_id: &str) -> Result<Snapshot, String> {
        let ts = OffsetDateTime::from_unix_timestamp(self.ts)
            .map_err(|e| format!("bad timestamp {}: {e}", self.ts))?;
        Ok(Snapshot {
            ts,
            node_id: node_id.to_string(),
            readings: self.readings,
        })
    }
}

// ---------------------------------------------------------------------------
// Topic / payload helpers
// ---------------------------------------------------------------------------

/// Middle segment of "<prefix>/<id>/<suffix>".
fn middle<'a>(topic: &'a str, prefix: &str, suffix: &str) -> Option<&'a str> {
    let parts: Vec<&str> = topic.split('/').collect();
    if parts.len() == 3 && parts[0] == prefix && parts[2] == suffix && !parts[1].is_empty() {
        Some(parts[1])
    } else {
        None
    }
}

/// Extract node_id from "tele/<node_id>/reading".
pub(crate) fn extract_node_id(topic: &str) -> Option<&str> {
    middle(topic, "tele", "reading")
}

/// Extract the actuator id from "actuator/<id>/set".
pub(crate) fn extract_actuator_id(topic: &str) -> Option<&str> {
    middle(topic, "actuator", "set")
}

/// Parse an "ON"/"OFF"/"PAUSE" payload (case-insensitive, trims whitespace).
pub(crate) fn parse_command(payload: &[u8]) -> Result<Status, String> {
    let s = String::from_utf8_lossy(payload).trim().to_uppercase();
    match s.as_str() {
        "ON" => Ok(Status::Active),
        "OFF" => Ok(Status::Idle),
        "PAUSE" => Ok(Status::Paused),
        _ => Err(format!("unknown actuator command '{s}'")),
    }
}

pub(crate) fn event_payload(event: &Event) -> serde_json::Result<Vec<u8>> {
    serde_json::to_vec(event)
}

// ===========================================================================
// Tests
// ===========================================================================
