//! Relay outputs for the actuators. The `gpio` feature gates the real rppal
//! driver; without it, a mock board only tracks and logs state.

use anyhow::Result;
use std::collections::HashMap;
use tracing::{info, warn};

#[cfg(feature = "gpio")]
use rppal::gpio::{Gpio, OutputPin};

use crate::actuator::{Actuator, Status};
use crate::events::Event;

/// (actuator id, BCM pin) pairs for every actuator.
pub(crate) fn pin_map(actuators: &[Actuator]) -> Vec<(String, u8)> {
    actuators.iter().map(|a| (a.id.clone(), a.pin)).collect()
}

// ---------------------------------------------------------------------------
// Real GPIO relay board (requires rppal + Raspberry Pi hardware)
// ---------------------------------------------------------------------------
#[cfg(feature = "gpio")]
pub(crate) struct RelayBoard {
    pins: HashMap<String, OutputPin>, // actuator id -> GPIO pin
    active_low: bool,                 // many relay boards are active-low
}

#[cfg(feature = "gpio")]
impl RelayBoard {
    pub(crate) fn new(pin_map: &[(String, u8)], active_low: bool) -> Result<Self> {
        let gpio = Gpio::new()?;
        let mut pins = HashMap::new();

        for (id, pin_num) in pin_map {
            let mut pin = gpio.get(*pin_num)?.into_output();

            // Fail-safe: ensure "OFF" at startup
            if active_low {
                pin.set_high();
            } else {
                pin.set_low();
            }

            pins.insert(id.clone(), pin);
        }

        info!(outputs = pins.len(), active_low, "relay: board initialised");
        Ok(Self { pins, active_low })
    }

    pub(crate) fn set(&mut self, id: &str, on: bool) {
        let Some(pin) = self.pins.get_mut(id) else {
            warn!(actuator = %id, "relay: no output for actuator");
            return;
        };
        // active-low: LOW = ON; active-high: HIGH = ON
        if on != self.active_low {
            pin.set_high();
        } else {
            pin.set_low();
        }
        info!(actuator = %id, on, "relay: output set");
    }

    pub(crate) fn all_off(&mut self) {
        let keys: Vec<String> = self.pins.keys().cloned().collect();
        for k in keys {
            self.set(&k, false);
        }
    }
}

// ---------------------------------------------------------------------------
// Mock relay board (development, no hardware)
// ---------------------------------------------------------------------------
#[cfg(not(feature = "gpio"))]
pub(crate) struct RelayBoard {
    pub(super) outputs: HashMap<String, bool>, // actuator id -> on/off
}

#[cfg(not(feature = "gpio"))]
impl RelayBoard {
    pub(crate) fn new(pin_map: &[(String, u8)], _active_low: bool) -> Result<Self> {
        let mut outputs = HashMap::new();
        for (id, pin_num) in pin_map {
            info!(actuator = %id, gpio = pin_num, "relay: mock output registered");
            outputs.insert(id.clone(), false);
        }
        info!(outputs = outputs.len(), "relay: mock board initialised (no hardware)");
        Ok(Self { outputs })
    }

    pub(crate) fn set(&mut self, id: &str, on: bool) {
        match self.outputs.get_mut(id) {
            Some(state) => {
                *state = on;
                info!(actuator = %id, on, "relay: mock output set");
            }
            None => warn!(actuator = %id, "relay: no output for actuator"),
        }
    }

    pub(crate) fn all_off(&mut self) {
        let keys: Vec<String> = self.outputs.keys().cloned().collect();
        for k in keys {
            self.set(&k, false);
        }
    }
}

impl RelayBoard {
    /// Follow an actuator update: active drives the relay, anything else
    /// releases it. Progress events are ignored.
    pub(crate) fn apply(&mut self, event: &Event) {
        if let Event::ActuatorUpdate(update) = event {
            let a = &update.actuator;
            self.set(&a.id, a.status == Status::Active);
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(all(test, not(feature = "gpio")))]
mod tests {
    use super::*;
    use crate::actuator::default_actuators;
    use crate::events::{ActuatorUpdate, Hints, Progress};

    fn board() -> RelayBoard {
        RelayBoard::new(&pin_map(&default_actuators()), true).unwrap()
    }

    fn update(id: &str, status: Status) -> Event {
        let mut actuator = default_actuators()
            .into_iter()
            .find(|a| a.id == id)
            .unwrap();
        actuator.status = status;
        Event::ActuatorUpdate(ActuatorUpdate {
            actuator,
            hints: Hints::default(),
        })
    }

    // -- RelayBoard (mock) --------------------------------------------------

    #[test]
    fn new_registers_every_actuator_off() {
        let b = board();
        assert_eq!(b.outputs.len(), 9);
        assert!(b.outputs.values().all(|on| !on));
    }

    #[test]
    fn follows_actuator_updates() {
        let mut b = board();
        b.apply(&update("fan", Status::Active));
        assert!(b.outputs["fan"]);

        b.apply(&update("fan", Status::Paused));
        assert!(!b.outputs["fan"]);
    }

    #[test]
    fn progress_events_are_ignored() {
        let mut b = board();
        b.set("chiller", true);
        b.apply(&Event::FertilizerProgress(Progress::default()));
        assert!(b.outputs["chiller"]);
    }

    #[test]
    fn all_off_resets_everything() {
        let mut b = board();
        b.set("fan", true);
        b.set("sensor-pump", true);
        b.all_off();
        assert!(b.outputs.values().all(|on| !on));
    }

    #[test]
    fn unknown_actuator_does_not_panic() {
        let mut b = board();
        b.set("nonexistent", true);
        assert_eq!(b.outputs.len(), 9);
    }
}
