//! TOML config file loading, validation, and actuator seeding.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::HashSet;

use crate::actuator::{default_actuators, Actuator, ActuatorKind, Mode, Schedule};
use crate::clock::WEEKDAYS;
use crate::db::Db;
use crate::dosing::DosingLimits;

// ---------------------------------------------------------------------------
// Config file structures
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
pub struct Config {
    /// Seed set. Empty means the built-in default actuators.
    #[serde(default)]
    pub actuators: Vec<ActuatorEntry>,
    #[serde(default)]
    pub interlock: InterlockSection,
    #[serde(default)]
    pub dosing: DosingLimits,
    #[serde(default)]
    pub schedule: ScheduleSection,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ActuatorEntry {
    pub id: String,
    pub name: String,
    pub pin: i64,
    /// `type = "fertilizer-pump"` plus that kind's fields.
    #[serde(flatten)]
    pub kind: ActuatorKind,
    #[serde(default)]
    pub schedule: Option<Schedule>,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct InterlockSection {
    pub irrigation_pump: String,
}

impl Default for InterlockSection {
    fn default() -> Self {
        Self {
            irrigation_pump: "irrigation-pump".into(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct ScheduleSection {
    /// Local time offset used for the active-day check.
    pub utc_offset_minutes: i32,
}

// ---------------------------------------------------------------------------
// GPIO whitelist
// ---------------------------------------------------------------------------

/// BCM GPIO pins available on the Raspberry Pi 40-pin header for general
/// use. GPIO 0-1 are reserved for the ID EEPROM and must never be used.
/// GPIO 28+ are not exposed on the standard header.
const VALID_GPIO_PINS: &[i64] = &[
    2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16, 17, 18, 19, 20, 21, 22, 23, 24, 25, 26, 27,
];

const MAX_UTC_OFFSET_MINUTES: i32 = 14 * 60;

impl ActuatorEntry {
    fn to_actuator(&self) -> Actuator {
        let mut a = Actuator::new(&self.id, &self.name, self.pin as u8, self.kind.clone());
        if let Some(schedule) = &self.schedule {
            a.schedule = schedule.clone();
            if schedule.enabled {
                a.mode = Mode::Auto;
            }
        }
        a
    }
}

impl Config {
    /// The actuator set a fresh store is seeded with.
    pub fn seed(&self) -> Vec<Actuator> {
        if self.actuators.is_empty() {
            default_actuators()
        } else {
            self.actuators.iter().map(ActuatorEntry::to_actuator).collect()
        }
    }

    // -----------------------------------------------------------------------
    // Validation
    // -----------------------------------------------------------------------

    /// Validate all config entries. Returns `Ok(())` or an error describing
    /// every violation found (not just the first one).
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        self.validate_actuators(&mut errors);
        self.validate_interlock(&mut errors);
        errors.extend(self.dosing.validate());
        if self.schedule.utc_offset_minutes.abs() > MAX_UTC_OFFSET_MINUTES {
            errors.push(format!(
                "schedule.utc_offset_minutes {} out of range [-{MAX_UTC_OFFSET_MINUTES}, {MAX_UTC_OFFSET_MINUTES}]",
                self.schedule.utc_offset_minutes
            ));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            bail!(
                "config validation failed ({} error{}):\n  - {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("\n  - ")
            );
        }
    }

    fn validate_actuators(&self, errors: &mut Vec<String>) {
        let mut seen_ids: HashSet<&str> = HashSet::new();
        let mut seen_pins: HashSet<i64> = HashSet::new();
        let mut sensor_pumps = 0;

        for (i, a) in self.actuators.iter().enumerate() {
            let ctx = || {
                if a.id.is_empty() {
                    format!("actuators[{i}]")
                } else {
                    format!("actuator '{}'", a.id)
                }
            };

            // ── Identity ────────────────────────────────────────
            if a.id.trim().is_empty() {
                errors.push(format!("{}: id is empty", ctx()));
            } else if !seen_ids.insert(&a.id) {
                errors.push(format!("{}: duplicate id", ctx()));
            }
            if a.name.trim().is_empty() {
                errors.push(format!("{}: name is empty", ctx()));
            }

            // ── GPIO pin whitelist ──────────────────────────────
            if !VALID_GPIO_PINS.contains(&a.pin) {
                errors.push(format!(
                    "{}: pin {} is not a valid BCM GPIO pin (allowed: 2-27)",
                    ctx(),
                    a.pin
                ));
            } else if !seen_pins.insert(a.pin) {
                errors.push(format!(
                    "{}: pin {} is already used by another actuator",
                    ctx(),
                    a.pin
                ));
            }

            // ── Kind-specific ───────────────────────────────────
            if let Some(flow) = a.kind.flow_rate() {
                if !(flow.is_finite() && flow > 0.0) {
                    errors.push(format!(
                        "{}: flowRate must be positive, got {flow}",
                        ctx()
                    ));
                }
            }
            if a.kind.is_circulation() {
                sensor_pumps += 1;
            }

            if let Some(schedule) = &a.schedule {
                for day in &schedule.active_days {
                    if !WEEKDAYS.contains(&day.to_lowercase().as_str()) {
                        errors.push(format!("{}: unknown weekday '{day}'", ctx()));
                    }
                }
            }
        }

        if sensor_pumps > 1 {
            errors.push(format!(
                "{sensor_pumps} sensor-pump actuators configured, at most one is allowed"
            ));
        }
    }

    fn validate_interlock(&self, errors: &mut Vec<String>) {
        let id = self.interlock.irrigation_pump.as_str();
        let seed = self.seed();
        match seed.iter().find(|a| a.id == id) {
            None => errors.push(format!(
                "interlock.irrigation_pump '{id}' does not name a configured actuator"
            )),
            Some(a) if a.kind != ActuatorKind::Pump => errors.push(format!(
                "interlock.irrigation_pump '{id}' is a {}, expected a pump",
                a.kind.tag()
            )),
            Some(_) => {}
        }
    }
}

// ---------------------------------------------------------------------------
// Load + apply
// ---------------------------------------------------------------------------

/// Read, parse, and validate a TOML config file.
pub fn load(path: &str) -> Result<Config> {
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("failed to read config: {path}"))?;
    let config: Config =
        toml::from_str(&contents).with_context(|| format!("failed to parse config: {path}"))?;
    config
        .validate()
        .with_context(|| format!("invalid config: {path}"))?;
    Ok(config)
}

/// Create configured actuators that are not in the store yet. Existing
/// records are left alone. Returns how many were created.
pub async fn apply(config: &Config, db: &Db) -> Result<usize> {
    let seed = config.seed();
    let mut created = 0;
    for a in &seed {
        if db
            .insert_actuator_if_absent(a)
            .await
            .with_context(|| format!("failed to seed actuator '{}'", a.id))?
        {
            created += 1;
        }
    }

    tracing::info!(actuators = seed.len(), created, "config applied");

    Ok(created)
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actuator::{Hms, Status};

    // -- Helper: build a valid baseline config that passes validation ------

    fn entry(id: &str, pin: i64, kind: ActuatorKind) -> ActuatorEntry {
        ActuatorEntry {
            id: id.into(),
            name: id.to_uppercase(),
            pin,
            kind,
            schedule: None,
        }
    }

    fn fertilizer(flow_rate: f64) -> ActuatorKind {
        ActuatorKind::FertilizerPump {
            nutrient_type: "Grow".into(),
            flow_rate,
        }
    }

    fn valid_config() -> Config {
        Config {
            actuators: vec![
                entry("irrigation-pump", 5, ActuatorKind::Pump),
                entry("sensor-pump", 18, ActuatorKind::SensorPump),
                entry("grow", 19, fertilizer(50.0)),
            ],
            ..Default::default()
        }
    }

    /// Assert validation fails and the error message contains `needle`.
    fn assert_validation_err(cfg: &Config, needle: &str) {
        let err = cfg.validate().unwrap_err();
        let msg = format!("{err:#}");
        assert!(
            msg.contains(needle),
            "expected error containing {needle:?}, got: {msg}"
        );
    }

    // -- Parsing ----------------------------------------------------------

    #[test]
    fn parse_full_config() {
        let toml_str = r#"
[interlock]
irrigation_pump = "main-pump"

[dosing]
test_pulse_amount = 3.0
max_dose = 20.0

[schedule]
utc_offset_minutes = 120

[[actuators]]
id = "main-pump"
name = "Main Pump"
pin = 5
type = "pump"

[actuators.schedule]
enabled = true
activeDays = ["monday", "Thursday"]
interval = { hours = 2 }
duration = { minutes = 5 }

[[actuators]]
id = "grow"
name = "Grow"
pin = 19
type = "fertilizer-pump"
nutrientType = "Grow"
flowRate = 45.0
"#;
        let config: Config = toml::from_str(toml_str).unwrap();
        config.validate().unwrap();
        assert_eq!(config.interlock.irrigation_pump, "main-pump");
        assert_eq!(config.dosing.test_pulse_amount, 3.0);
        assert_eq!(config.dosing.dead_band, 0.2);
        assert_eq!(config.schedule.utc_offset_minutes, 120);

        let seed = config.seed();
        assert_eq!(seed.len(), 2);
        assert_eq!(seed[0].mode, Mode::Auto);
        assert_eq!(
            seed[0].schedule.interval,
            Hms {
                hours: 2,
                minutes: 0,
                seconds: 0
            }
        );
        assert_eq!(seed[1].kind.flow_rate(), Some(45.0));
        assert_eq!(seed[1].mode, Mode::Manual);
    }

    #[test]
    fn empty_config_uses_defaults() {
        let config: Config = toml::from_str("").unwrap();
        config.validate().unwrap();
        assert_eq!(config.seed().len(), 9);
        assert_eq!(config.interlock.irrigation_pump, "irrigation-pump");
        assert_eq!(config.dosing.max_dose, 30.0);
    }

    // -- Validation: valid configs pass -----------------------------------

    #[test]
    fn valid_config_passes() {
        valid_config().validate().unwrap();
    }

    // -- Actuator: identity -------------------------------------------------

    #[test]
    fn empty_id_rejected() {
        let mut cfg = valid_config();
        cfg.actuators[2].id = "".into();
        assert_validation_err(&cfg, "id is empty");
    }

    #[test]
    fn duplicate_id_rejected() {
        let mut cfg = valid_config();
        cfg.actuators.push(entry("grow", 20, fertilizer(50.0)));
        assert_validation_err(&cfg, "duplicate id");
    }

    #[test]
    fn empty_name_rejected() {
        let mut cfg = valid_config();
        cfg.actuators[2].name = "  ".into();
        assert_validation_err(&cfg, "name is empty");
    }

    // -- Actuator: GPIO whitelist -------------------------------------------

    #[test]
    fn reserved_and_unexposed_pins_rejected() {
        for pin in [0, 1, 28, -3] {
            let mut cfg = valid_config();
            cfg.actuators[2].pin = pin;
            assert_validation_err(&cfg, "not a valid BCM GPIO pin");
        }
    }

    #[test]
    fn boundary_pins_accepted() {
        for pin in [2, 27] {
            let mut cfg = valid_config();
            cfg.actuators[2].pin = pin;
            cfg.validate().unwrap();
        }
    }

    #[test]
    fn duplicate_pin_rejected() {
        let mut cfg = valid_config();
        cfg.actuators[2].pin = 5;
        assert_validation_err(&cfg, "already used");
    }

    // -- Actuator: kind -----------------------------------------------------

    #[test]
    fn non_positive_flow_rejected() {
        let mut cfg = valid_config();
        cfg.actuators[2].kind = fertilizer(0.0);
        assert_validation_err(&cfg, "flowRate must be positive");
    }

    #[test]
    fn second_sensor_pump_rejected() {
        let mut cfg = valid_config();
        cfg.actuators
            .push(entry("sensor-pump-2", 20, ActuatorKind::SensorPump));
        assert_validation_err(&cfg, "at most one");
    }

    #[test]
    fn unknown_weekday_rejected() {
        let mut cfg = valid_config();
        cfg.actuators[0].schedule = Some(Schedule {
            active_days: vec!["Monday".into(), "Funday".into()],
            ..Default::default()
        });
        assert_validation_err(&cfg, "unknown weekday 'Funday'");
    }

    // -- Interlock ----------------------------------------------------------

    #[test]
    fn interlock_must_name_an_actuator() {
        let mut cfg = valid_config();
        cfg.interlock.irrigation_pump = "missing".into();
        assert_validation_err(&cfg, "does not name a configured actuator");
    }

    #[test]
    fn interlock_must_be_a_pump() {
        let mut cfg = valid_config();
        cfg.interlock.irrigation_pump = "grow".into();
        assert_validation_err(&cfg, "is a fertilizer-pump, expected a pump");
    }

    // -- Dosing + schedule --------------------------------------------------

    #[test]
    fn dosing_limits_must_be_positive() {
        let mut cfg = valid_config();
        cfg.dosing.max_dose = 0.0;
        assert_validation_err(&cfg, "dosing.max_dose");
    }

    #[test]
    fn utc_offset_out_of_range() {
        let mut cfg = valid_config();
        cfg.schedule.utc_offset_minutes = 15 * 60;
        assert_validation_err(&cfg, "utc_offset_minutes");
    }

    // -- Multiple errors reported at once ---------------------------------

    #[test]
    fn multiple_errors_collected() {
        let mut cfg = valid_config();
        cfg.actuators[2].pin = 1;
        cfg.actuators[2].kind = fertilizer(-5.0);
        cfg.dosing.dead_band = 0.0;

        let msg = format!("{:#}", cfg.validate().unwrap_err());
        assert!(msg.contains("3 errors"), "{msg}");
        assert!(msg.contains("pin 1"), "missing gpio error in: {msg}");
        assert!(msg.contains("flowRate"), "missing flow error in: {msg}");
        assert!(msg.contains("dosing.dead_band"), "missing dosing error in: {msg}");
    }

    // -- DB integration ---------------------------------------------------

    #[tokio::test]
    async fn apply_seeds_missing_actuators_only() {
        let db = Db::connect("sqlite::memory:").await.unwrap();
        db.migrate().await.unwrap();

        let config = valid_config();
        assert_eq!(apply(&config, &db).await.unwrap(), 3);

        let mut pump = db.get_actuator("irrigation-pump").await.unwrap().unwrap();
        pump.status = Status::Active;
        db.upsert_actuator(&pump).await.unwrap();

        assert_eq!(apply(&config, &db).await.unwrap(), 0);
        let stored = db.get_actuator("irrigation-pump").await.unwrap().unwrap();
        assert_eq!(stored.status, Status::Active);
        assert_eq!(db.load_actuators().await.unwrap().len(), 3);
    }
}
