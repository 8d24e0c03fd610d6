//! Broadcast sink: in-process fan-out of state changes to whoever
//! subscribes (MQTT forwarder, relay board, event ring).

use serde::Serialize;
use time::OffsetDateTime;
use tokio::sync::broadcast;

use crate::actuator::Actuator;
use crate::clock;
use crate::dosing::Phase;

/// Slow subscribers lag and drop the oldest events beyond this.
const CHANNEL_CAPACITY: usize = 256;

// ---------------------------------------------------------------------------
// Payloads
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum Event {
    ActuatorUpdate(ActuatorUpdate),
    FertilizerProgress(Progress),
}

/// Full actuator snapshot plus transient UI hints.
#[derive(Debug, Clone, Serialize)]
pub struct ActuatorUpdate {
    #[serde(flatten)]
    pub actuator: Actuator,
    #[serde(flatten)]
    pub hints: Hints,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Hints {
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub prevented_activation: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub override_message: Option<String>,
}

impl Hints {
    pub fn message(msg: &str) -> Self {
        Self {
            override_message: Some(msg.to_string()),
            ..Default::default()
        }
    }

    pub fn prevented(msg: &str) -> Self {
        Self {
            prevented_activation: true,
            override_message: Some(msg.to_string()),
            ..Default::default()
        }
    }
}

/// Dispensing / auto-dosing progress. Every field is optional so each
/// emitter sends only what it knows; the server timestamp is always set.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Progress {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_dispensing: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auto_dosing_mode: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_step: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_steps: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_fertilizer: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remaining_time: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub waiting_fertilizer_ids: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub in_delay: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delay_remaining: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dispensing_delay: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stopped: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub test_pulse_active: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub test_pulse_phase: Option<Phase>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub test_pulse_complete: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mixing_state: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mixing_time_remaining: Option<u64>,
    #[serde(rename = "baselineEC", skip_serializing_if = "Option::is_none")]
    pub baseline_ec: Option<f64>,
    #[serde(rename = "testPulseEC", skip_serializing_if = "Option::is_none")]
    pub test_pulse_ec: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ec_sensitivity: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub calculated_dose: Option<u32>,
    #[serde(rename = "currentEC", skip_serializing_if = "Option::is_none")]
    pub current_ec: Option<f64>,
    #[serde(rename = "targetEC", skip_serializing_if = "Option::is_none")]
    pub target_ec: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ec_gap: Option<f64>,
    #[serde(
        with = "time::serde::rfc3339::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub next_check_time: Option<OffsetDateTime>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// Unix milliseconds, for client-side drift correction.
    pub server_timestamp: i64,
}

// ---------------------------------------------------------------------------
// Broadcaster
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct Broadcaster {
    tx: broadcast::Sender<Event>,
}

impl Default for Broadcaster {
    fn default() -> Self {
        Self::new()
    }
}

impl Broadcaster {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    pub fn actuator(&self, actuator: &Actuator, hints: Hints) {
        self.send(Event::ActuatorUpdate(ActuatorUpdate {
            actuator: actuator.clone(),
            hints,
        }));
    }

    pub fn progress(&self, mut progress: Progress) {
        progress.server_timestamp = clock::unix_ms(clock::now());
        self.send(Event::FertilizerProgress(progress));
    }

    fn send(&self, event: Event) {
        // No subscribers is fine; delivery is best-effort.
        let _ = self.tx.send(event);
    }
}

// ===========================================================================
// Tests
// ===========================================================================
