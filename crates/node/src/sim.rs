//! Stateful reservoir simulator for local development.
//!
//! Models a nutrient reservoir as seen by a hydroponic sensor node:
//! - Temporal coherence via random walk with mean reversion
//! - Per-reading electronic noise
//! - Diurnal (day/night) temperature and humidity cycle
//! - Occasional DS18B20-style faults (-127) on temperature channels
//! - Closed-loop response to the hub's actuators (EC rises while a
//!   fertilizer pump runs, pH follows the pH pumps, level falls while
//!   the irrigation pump runs)

use std::fmt;

/// Value a disconnected temperature probe reports.
pub const SENSOR_FAULT: f64 = -127.0;

// ---------------------------------------------------------------------------
// Gaussian approximation (no extra dependency)
// ---------------------------------------------------------------------------

/// Approximate a sample from N(0,1) using the Irwin-Hall method:
/// sum of 12 uniform [0,1) values minus 6.
fn approx_std_normal() -> f64 {
    let mut sum: f64 = 0.0;
    for _ in 0..12 {
        sum += fastrand::f64();
    }
    sum - 6.0
}

/// Sample from N(mean, sigma).
fn gaussian(mean: f64, sigma: f64) -> f64 {
    mean + sigma * approx_std_normal()
}

// ---------------------------------------------------------------------------
// Scenario presets
// ---------------------------------------------------------------------------

/// Pre-configured simulation profiles selectable via `SIM_SCENARIO` env var.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scenario {
    /// Holds near setpoints.  Low noise, no faults.
    Stable,
    /// Plants take up nutrients: EC falls and pH creeps up.  Exercises the
    /// rule engine and auto-dosing.
    Uptake,
    /// High noise and ~10% fault rate on temperature probes.
    Flaky,
}

impl Scenario {
    pub fn from_str_lossy(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "uptake" => Self::Uptake,
            "flaky" => Self::Flaky,
            _ => Self::Stable, // default
        }
    }
}

impl fmt::Display for Scenario {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stable => write!(f, "stable"),
            Self::Uptake => write!(f, "uptake"),
            Self::Flaky => write!(f, "flaky"),
        }
    }
}

// ---------------------------------------------------------------------------
// Actuator feedback
// ---------------------------------------------------------------------------

/// Which hub outputs are currently running, as far as the node has heard.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Outputs {
    pub fertilizer_pumps: usize,
    pub irrigating: bool,
    pub ph_up: bool,
    pub ph_down: bool,
}

// ---------------------------------------------------------------------------
// Readings
// ---------------------------------------------------------------------------

/// One snapshot. EC is in µS/cm, as most EC probes report it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sample {
    pub ph: f64,
    pub ec: f64,
    pub water_temp: f64,
    pub air_temp: f64,
    pub humidity: f64,
    pub water_level: f64,
}

// ---------------------------------------------------------------------------
// Main simulator
// ---------------------------------------------------------------------------

pub struct ReservoirSim {
    // "True" reservoir state, evolved each tick.
    ph: f64,
    ec_ms: f64,
    level: f64,

    // Random walk parameters
    ph_center: f64,
    ph_drift: f64,
    ec_drift: f64,
    walk_sigma: f64,
    mean_reversion: f64,

    // Noise + faults
    noise_scale: f64,
    fault_prob: f32,

    // Diurnal cycle
    diurnal_period_s: f64,

    outputs: Outputs,
}

/// mS/cm gained per tick for each running fertilizer pump.
const EC_PER_PUMP: f64 = 0.04;
/// pH units moved per tick by a running pH pump.
const PH_PER_PUMP: f64 = 0.05;
/// Percent of tank lost per tick while irrigating.
const LEVEL_PER_IRRIGATION_TICK: f64 = 0.5;
/// Percent of tank lost per tick to evaporation.
const EVAPORATION: f64 = 0.01;

impl ReservoirSim {
    /// `diurnal_period_s` controls the day/night cycle length.  Use 600
    /// (10 min) for fast dev iteration or 86400 for real-time.
    pub fn new(scenario: Scenario, diurnal_period_s: f64) -> Self {
        let (ph_drift, ec_drift, noise_scale, fault_prob) = match scenario {
            Scenario::Stable => (0.0, 0.0, 1.0, 0.0_f32),
            Scenario::Uptake => (0.01, -0.01, 1.0, 0.005),
            Scenario::Flaky => (0.0, 0.0, 3.0, 0.10),
        };
        Self {
            ph: gaussian(6.0, 0.1),
            ec_ms: gaussian(1.4, 0.05).max(0.0),
            level: 85.0,
            ph_center: 6.0,
            ph_drift,
            ec_drift,
            walk_sigma: 0.01,
            mean_reversion: 0.05,
            noise_scale,
            fault_prob,
            diurnal_period_s,
            outputs: Outputs::default(),
        }
    }

    pub fn set_outputs(&mut self, outputs: Outputs) {
        self.outputs = outputs;
    }

    /// Top the tank back up, e.g. after a simulated refill.
    pub fn refill(&mut self) {
        self.level = 100.0;
    }

    /// Advance one tick at wall-clock `now_s` (Unix seconds) and read every
    /// channel.
    pub fn sample(&mut self, now_s: f64) -> Sample {
        self.evolve();

        let phase = 2.0 * std::f64::consts::PI * now_s / self.diurnal_period_s;
        let diurnal = phase.sin();
        let n = self.noise_scale;

        let water_temp = gaussian(20.0 + 1.5 * diurnal, 0.05 * n);
        let air_temp = gaussian(24.0 + 4.0 * diurnal, 0.2 * n);

        Sample {
            ph: round(gaussian(self.ph, 0.02 * n).clamp(0.0, 14.0), 2),
            ec: gaussian(self.ec_ms * 1000.0, 10.0 * n).max(0.0).round(),
            water_temp: self.faulty_or(round(water_temp, 1)),
            air_temp: self.faulty_or(round(air_temp, 1)),
            humidity: round(gaussian(60.0 - 10.0 * diurnal, 1.0 * n).clamp(0.0, 100.0), 1),
            water_level: round(gaussian(self.level, 0.2 * n).clamp(0.0, 100.0), 1),
        }
    }

    fn evolve(&mut self) {
        let o = self.outputs;

        // pH: mean reversion + walk + uptake drift + pH pumps.  Fertilizer
        // is mildly acidic.
        let pull = self.mean_reversion * (self.ph_center - self.ph);
        let mut ph = self.ph + pull + self.ph_drift + gaussian(0.0, self.walk_sigma);
        if o.ph_up {
            ph += PH_PER_PUMP;
        }
        if o.ph_down {
            ph -= PH_PER_PUMP;
        }
        ph -= 0.005 * o.fertilizer_pumps as f64;
        self.ph = ph.clamp(3.0, 9.0);

        // EC: uptake drift + dosing.  Evaporation concentrates slightly.
        let dose = EC_PER_PUMP * o.fertilizer_pumps as f64;
        self.ec_ms = (self.ec_ms + self.ec_drift + dose + gaussian(0.0, self.walk_sigma * 0.5))
            .clamp(0.0, 5.0);

        // Level: evaporation + irrigation draw.
        let draw = if o.irrigating { LEVEL_PER_IRRIGATION_TICK } else { 0.0 };
        self.level = (self.level - EVAPORATION - draw).clamp(0.0, 100.0);
    }

    fn faulty_or(&self, value: f64) -> f64 {
        if fastrand::f32() < self.fault_prob {
            SENSOR_FAULT
        } else {
            value
        }
    }
}

fn round(v: f64, places: i32) -> f64 {
    let k = 10_f64.powi(places);
    (v * k).round() / k
}

// ===========================================================================
// Tests
// ===========================================================================
