//! Actuator model: one record type with a `type` tag carrying the
//! kind-specific fields, plus the pure status/settings transitions the
//! arbiter applies under its write lock.
//!
//! ```text
//!            set_status(active)               countdown / set_status(idle)
//!   Idle ───────────────────────────▶ Active ─────────────────────────────▶ Idle
//!    ▲                                  │ ▲
//!    │            set_status(paused)    │ │ set_status(active)
//!    │                                  ▼ │   duration := remainingTime
//!    └──────── set_status(idle) ───── Paused
//! ```

use serde::{Deserialize, Deserializer, Serialize};
use time::OffsetDateTime;

use crate::clock::{secs, secs_between};

/// Flow rate assumed when a pump record carries none (mL/min).
pub const DEFAULT_FLOW_RATE: f64 = 60.0;

// ---------------------------------------------------------------------------
// Enumerations
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Manual,
    Auto,
    Rule,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Idle,
    Active,
    Paused,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PhDirection {
    Up,
    Down,
}

fn default_flow_rate() -> f64 {
    DEFAULT_FLOW_RATE
}

/// Kind tag plus the fields only that kind carries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ActuatorKind {
    Pump,
    FertilizerPump {
        #[serde(rename = "nutrientType", default)]
        nutrient_type: String,
        #[serde(rename = "flowRate", default = "default_flow_rate")]
        flow_rate: f64,
    },
    PhPump {
        direction: PhDirection,
        #[serde(rename = "flowRate", default = "default_flow_rate")]
        flow_rate: f64,
    },
    SensorPump,
    Fan,
    Chiller,
}

impl ActuatorKind {
    pub fn flow_rate(&self) -> Option<f64> {
        match self {
            Self::FertilizerPump { flow_rate, .. } | Self::PhPump { flow_rate, .. } => {
                Some(*flow_rate)
            }
            _ => None,
        }
    }

    pub fn is_fertilizer_pump(&self) -> bool {
        matches!(self, Self::FertilizerPump { .. })
    }

    /// Circulation pumps run open-ended and never count down.
    pub fn is_circulation(&self) -> bool {
        matches!(self, Self::SensorPump)
    }

    pub fn tag(&self) -> &'static str {
        match self {
            Self::Pump => "pump",
            Self::FertilizerPump { .. } => "fertilizer-pump",
            Self::PhPump { .. } => "ph-pump",
            Self::SensorPump => "sensor-pump",
            Self::Fan => "fan",
            Self::Chiller => "chiller",
        }
    }
}

// ---------------------------------------------------------------------------
// Schedule
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hms {
    #[serde(default)]
    pub hours: u32,
    #[serde(default)]
    pub minutes: u32,
    #[serde(default)]
    pub seconds: u32,
}

impl Hms {
    pub fn total_secs(&self) -> u64 {
        self.hours as u64 * 3600 + self.minutes as u64 * 60 + self.seconds as u64
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Schedule {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub active_days: Vec<String>,
    #[serde(default)]
    pub interval: Hms,
    #[serde(default)]
    pub duration: Hms,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub next_scheduled_run: Option<OffsetDateTime>,
    /// Set by an interval change; the scheduler recomputes the next run
    /// from "now" on its next tick and clears it.
    #[serde(default)]
    pub interval_updated: bool,
}

impl Schedule {
    pub fn runs_on(&self, weekday: &str) -> bool {
        self.active_days.iter().any(|d| d.eq_ignore_ascii_case(weekday))
    }
}

// ---------------------------------------------------------------------------
// Actuator
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Actuator {
    pub id: String,
    pub name: String,
    pub pin: u8,
    #[serde(flatten)]
    pub kind: ActuatorKind,

    pub mode: Mode,
    #[serde(default)]
    pub previous_mode: Option<Mode>,
    #[serde(default)]
    pub override_mode: bool,
    #[serde(default)]
    pub triggered_by_rule: Option<i64>,

    pub status: Status,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub start_time: Option<OffsetDateTime>,
    /// Seconds.
    #[serde(default)]
    pub duration: f64,
    /// Seconds; stored value, see [`Actuator::live_remaining`].
    #[serde(default)]
    pub remaining_time: f64,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub last_run: Option<OffsetDateTime>,

    #[serde(default)]
    pub schedule: Schedule,

    /// mL handed over by a "Release" rule.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub solution_amount: Option<f64>,

    // Interlock markers. Persisted so a restart can undo a dangling hold.
    #[serde(default)]
    pub disabled_by_fertilizer: bool,
    #[serde(default)]
    pub activated_by_fertilizer: bool,
    #[serde(default)]
    pub disabled_controls: bool,
}

/// Requested status transition.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusUpdate {
    pub status: Option<Status>,
    #[serde(default)]
    pub mode: Option<Mode>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub start_time: Option<OffsetDateTime>,
    #[serde(default)]
    pub duration: Option<f64>,
    #[serde(default)]
    pub remaining_time: Option<f64>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub next_scheduled_run: Option<OffsetDateTime>,
}

impl StatusUpdate {
    pub fn to(status: Status) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn with_mode(mut self, mode: Mode) -> Self {
        self.mode = Some(mode);
        self
    }

    pub fn for_secs(mut self, secs: f64) -> Self {
        self.duration = Some(secs);
        self.remaining_time = Some(secs);
        self
    }
}

/// Partial settings update. `None` leaves a field untouched; for the
/// nullable fields `Some(None)` clears it.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettingsPatch {
    pub mode: Option<Mode>,
    pub schedule: Option<SchedulePatch>,
    pub override_mode: Option<bool>,
    #[serde(default, deserialize_with = "double_option")]
    pub triggered_by_rule: Option<Option<i64>>,
    #[serde(default, deserialize_with = "double_option")]
    pub previous_mode: Option<Option<Mode>>,
    pub nutrient_type: Option<String>,
    pub flow_rate: Option<f64>,
    pub name: Option<String>,
    #[serde(default)]
    pub reset_schedule: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchedulePatch {
    pub enabled: Option<bool>,
    pub active_days: Option<Vec<String>>,
    pub interval: Option<Hms>,
    pub duration: Option<Hms>,
}

fn double_option<'de, D, T>(de: D) -> Result<Option<Option<T>>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Option::<T>::deserialize(de).map(Some)
}

impl Actuator {
    pub fn new(id: &str, name: &str, pin: u8, kind: ActuatorKind) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            pin,
            kind,
            mode: Mode::Manual,
            previous_mode: None,
            override_mode: false,
            triggered_by_rule: None,
            status: Status::Idle,
            start_time: None,
            duration: 0.0,
            remaining_time: 0.0,
            last_run: None,
            schedule: Schedule::default(),
            solution_amount: None,
            disabled_by_fertilizer: false,
            activated_by_fertilizer: false,
            disabled_controls: false,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == Status::Active
    }

    pub fn held_by_interlock(&self) -> bool {
        self.disabled_by_fertilizer || self.activated_by_fertilizer
    }

    /// Schedule-driven: auto mode with the schedule switched on.
    pub fn is_scheduled(&self) -> bool {
        self.mode == Mode::Auto && self.schedule.enabled
    }

    /// Seconds left on the current run as of `now`.
    pub fn live_remaining(&self, now: OffsetDateTime) -> f64 {
        if self.kind.is_circulation() {
            return 0.0;
        }
        match self.status {
            Status::Paused => self.remaining_time,
            Status::Active => match self.start_time {
                Some(start) if self.duration > 0.0 => {
                    (self.duration - secs_between(start, now)).max(0.0)
                }
                _ => self.remaining_time,
            },
            Status::Idle => 0.0,
        }
    }

    /// Timed run whose duration has fully elapsed.
    pub fn run_finished(&self, now: OffsetDateTime) -> bool {
        match (self.status, self.start_time) {
            (Status::Active, Some(start)) if !self.kind.is_circulation() && self.duration > 0.0 => {
                secs_between(start, now) >= self.duration
            }
            _ => false,
        }
    }

    /// Instant at which the current timed run ends (or ended).
    pub fn run_end(&self) -> Option<OffsetDateTime> {
        self.start_time.map(|s| s + secs(self.duration))
    }

    /// Apply a status transition in place.
    pub fn apply_status(&mut self, update: &StatusUpdate, now: OffsetDateTime) {
        let previous = self.status;
        if let Some(mode) = update.mode {
            self.enter_mode(mode);
        }
        if let Some(next) = update.next_scheduled_run {
            self.schedule.next_scheduled_run = Some(next);
        }
        let Some(status) = update.status else {
            self.enforce_invariants();
            return;
        };
        self.status = status;

        if self.kind.is_circulation() {
            self.start_time = None;
            self.duration = 0.0;
            self.remaining_time = 0.0;
            self.last_run = Some(now);
            self.enforce_invariants();
            return;
        }

        match status {
            Status::Active => {
                self.start_time = Some(update.start_time.unwrap_or(now));
                self.last_run = Some(now);
                if previous == Status::Paused && self.remaining_time > 0.0 && update.duration.is_none()
                {
                    self.duration = self.remaining_time;
                } else {
                    let d = update.duration.unwrap_or(0.0).max(0.0);
                    self.duration = d;
                    self.remaining_time = update.remaining_time.unwrap_or(d).max(0.0);
                }
            }
            Status::Paused => {
                self.remaining_time = update
                    .remaining_time
                    .unwrap_or_else(|| self.live_remaining_from(previous, now))
                    .max(0.0);
                self.start_time = None;
            }
            Status::Idle => {
                self.start_time = None;
                self.duration = 0.0;
                self.remaining_time = 0.0;
                self.last_run = Some(now);
            }
        }
        self.enforce_invariants();
    }

    fn live_remaining_from(&self, previous: Status, now: OffsetDateTime) -> f64 {
        let mut probe = self.clone();
        probe.status = previous;
        probe.live_remaining(now)
    }

    /// Apply a settings patch in place. Returns true when the schedule
    /// interval changed.
    pub fn apply_settings(&mut self, patch: &SettingsPatch, now: OffsetDateTime) -> bool {
        if let Some(mode) = patch.mode {
            self.enter_mode(mode);
        }
        if let Some(prev) = patch.previous_mode {
            self.previous_mode = prev;
        }
        if let Some(flag) = patch.override_mode {
            self.override_mode = flag;
        }
        if let Some(rule) = patch.triggered_by_rule {
            self.triggered_by_rule = rule;
        }
        if let Some(name) = &patch.name {
            self.name = name.trim().to_string();
        }
        match &mut self.kind {
            ActuatorKind::FertilizerPump {
                nutrient_type,
                flow_rate,
            } => {
                if let Some(n) = &patch.nutrient_type {
                    *nutrient_type = n.trim().to_string();
                }
                if let Some(f) = patch.flow_rate {
                    *flow_rate = f;
                }
            }
            ActuatorKind::PhPump { flow_rate, .. } => {
                if let Some(f) = patch.flow_rate {
                    *flow_rate = f;
                }
            }
            _ => {}
        }

        let mut interval_changed = false;
        if let Some(s) = &patch.schedule {
            if let Some(enabled) = s.enabled {
                self.schedule.enabled = enabled;
            }
            if let Some(days) = &s.active_days {
                self.schedule.active_days = days.iter().map(|d| d.to_ascii_lowercase()).collect();
            }
            if let Some(d) = s.duration {
                self.schedule.duration = d;
            }
            if let Some(i) = s.interval {
                if i != self.schedule.interval {
                    self.schedule.interval = i;
                    interval_changed = true;
                }
            }
        }
        if patch.reset_schedule {
            self.schedule.next_scheduled_run = None;
            self.last_run = None;
        }

        self.enforce_invariants();

        if interval_changed {
            self.schedule.interval_updated = true;
            if self.is_scheduled() && self.schedule.interval.total_secs() > 0 {
                self.schedule.next_scheduled_run =
                    Some(now + secs(self.schedule.interval.total_secs() as f64));
            }
        }
        interval_changed
    }

    /// Switch mode, snapshotting the mode being left when entering `rule`.
    /// Leaving `rule` for any other mode drops the rule's ownership.
    pub fn enter_mode(&mut self, mode: Mode) {
        if mode == Mode::Rule && self.mode != Mode::Rule {
            self.previous_mode = Some(self.mode);
        } else if mode != Mode::Rule && self.mode == Mode::Rule {
            self.previous_mode = None;
            self.override_mode = false;
            self.triggered_by_rule = None;
        }
        self.mode = mode;
    }

    /// Leave a held state, going back to the recorded mode. An actuator
    /// restored into auto resumes its schedule.
    pub fn restore_mode(&mut self) {
        if self.mode == Mode::Rule {
            self.mode = self.previous_mode.unwrap_or(Mode::Manual);
            if self.mode == Mode::Auto {
                self.schedule.enabled = true;
            }
        }
        self.previous_mode = None;
        self.override_mode = false;
        self.triggered_by_rule = None;
    }

    /// Schedules only run in auto mode.
    pub fn enforce_invariants(&mut self) {
        if matches!(self.mode, Mode::Manual | Mode::Rule) {
            self.schedule.enabled = false;
        }
        if self.kind.is_circulation() {
            self.duration = 0.0;
            self.remaining_time = 0.0;
        }
    }
}

// ---------------------------------------------------------------------------
// Defaults
// ---------------------------------------------------------------------------

/// The fixed actuator set a fresh installation starts with.
pub fn default_actuators() -> Vec<Actuator> {
    let fert = |id: &str, name: &str, pin: u8, nutrient: &str| {
        Actuator::new(
            id,
            name,
            pin,
            ActuatorKind::FertilizerPump {
                nutrient_type: nutrient.to_string(),
                flow_rate: 1.0,
            },
        )
    };
    let ph = |id: &str, name: &str, pin: u8, direction: PhDirection| {
        Actuator::new(
            id,
            name,
            pin,
            ActuatorKind::PhPump {
                direction,
                flow_rate: 1.0,
            },
        )
    };

    vec![
        Actuator::new("chiller", "Chiller", 16, ActuatorKind::Chiller),
        Actuator::new("fan", "Fan", 4, ActuatorKind::Fan),
        Actuator::new("irrigation-pump", "Irrigation Pump", 5, ActuatorKind::Pump),
        Actuator::new("sensor-pump", "Sensor Pump", 18, ActuatorKind::SensorPump),
        fert("fertilizer-pump-a", "Fertilizer Pump A", 19, "A"),
        fert("fertilizer-pump-b", "Fertilizer Pump B", 21, "B"),
        fert("fertilizer-pump-c", "Fertilizer Pump C", 22, "C"),
        ph("ph-up-pump", "pH Up Pump", 23, PhDirection::Up),
        ph("ph-down-pump", "pH Down Pump", 24, PhDirection::Down),
    ]
}

// ===========================================================================
// Tests
// ===========================================================================
