//! Auto-dosing controller: closed-loop EC targeting with a test pulse.
//!
//! ```text
//!   check ──gap ≤ dead band──▶ wait checkInterval ──▶ check
//!     │
//!     └─gap > dead band─▶ baseline ─▶ test-pulse (N mL per pump)
//!                                         │ mix checkInterval
//!                                         ▼
//!                          measuring ─▶ calculation ──dose 0──▶ wait ─▶ check
//!                                         │ dose > 0
//!                                         ▼
//!                                    final-dose ─▶ mix ─▶ check
//! ```
//!
//! One tick task drives the machine. Each tick takes the phase lock, so a
//! phase never overlaps another; `stop` flips the cancel flag, which the
//! pump-run poll observes within one interval, and then waits for the
//! lock before cleaning up.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tokio::sync::Mutex;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::arbiter::{Arbiter, Holder};
use crate::checkpoint::{Checkpoint, CheckpointFile};
use crate::clock;
use crate::dispense::{idle_pumps, run_items, Dispensed, DoseItem, RunEnd};
use crate::error::{HubError, Result};
use crate::events::Progress;
use crate::sensors::normalize_ec;
use crate::state::{self, SharedState};

/// Used when a start request carries an unusable target.
pub const DEFAULT_TARGET_EC: f64 = 2.0;
const DEFAULT_DISPENSING_DELAY: u64 = 5;
const DEFAULT_CHECK_INTERVAL: u64 = 300;
const DEFAULT_WATER_VOLUME: f64 = 100.0;
/// Status reports never claim more than an hour of mixing left.
const MAX_REPORTED_MIXING: u64 = 3600;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Phase {
    Baseline,
    TestPulse,
    Measuring,
    Calculation,
    FinalDose,
}

/// Tunables from the `[dosing]` config section.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct DosingLimits {
    /// mL per pump for the calibration pulse.
    pub test_pulse_amount: f64,
    /// Ceiling for any single computed dose, mL.
    pub max_dose: f64,
    /// mS/cm below target that counts as on target.
    pub dead_band: f64,
    /// mS/cm per mL when the test pulse shows no rise.
    pub fallback_sensitivity: f64,
}

impl Default for DosingLimits {
    fn default() -> Self {
        Self {
            test_pulse_amount: 5.0,
            max_dose: 30.0,
            dead_band: 0.2,
            fallback_sensitivity: 0.02,
        }
    }
}

impl DosingLimits {
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        for (name, v) in [
            ("test_pulse_amount", self.test_pulse_amount),
            ("max_dose", self.max_dose),
            ("dead_band", self.dead_band),
            ("fallback_sensitivity", self.fallback_sensitivity),
        ] {
            if !(v.is_finite() && v > 0.0) {
                errors.push(format!("dosing.{name} must be positive, got {v}"));
            }
        }
        errors
    }
}

fn one() -> f64 {
    1.0
}

/// One pump in the dosing set. `ratio` scales the computed dose.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DoseTarget {
    #[serde(alias = "actuatorId")]
    pub id: String,
    #[serde(default = "one")]
    pub ratio: f64,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartRequest {
    #[serde(rename = "targetEC")]
    pub target_ec: Option<f64>,
    #[serde(rename = "currentEC")]
    pub current_ec: Option<f64>,
    /// Seconds between checks; also the mixing time.
    pub check_interval: Option<u64>,
    pub dispensing_delay: Option<u64>,
    /// Litres.
    pub water_volume: Option<f64>,
    pub fertilizers: Option<Vec<DoseTarget>>,
    pub test_pulse_amount: Option<f64>,
}

impl StartRequest {
    fn validate(&self) -> Result<()> {
        let mut errors = Vec::new();
        if !self.target_ec.is_some_and(|v| v > 0.0) {
            errors.push("targetEC is required".to_string());
        }
        if !self.check_interval.is_some_and(|v| v > 0) {
            errors.push("checkInterval is required".to_string());
        }
        if !self.water_volume.is_some_and(|v| v > 0.0) {
            errors.push("waterVolume is required".to_string());
        }
        match &self.fertilizers {
            Some(list) if !list.is_empty() => {
                for (i, f) in list.iter().enumerate() {
                    if f.id.trim().is_empty() {
                        errors.push(format!("fertilizers[{i}]: id is required"));
                    }
                    if !(f.ratio.is_finite() && f.ratio > 0.0) {
                        errors.push(format!("fertilizers[{i}]: ratio must be positive"));
                    }
                }
            }
            _ => errors.push("fertilizers are required".to_string()),
        }
        if let Some(v) = self.test_pulse_amount {
            if !(v.is_finite() && v > 0.0) {
                errors.push(format!("testPulseAmount must be positive, got {v}"));
            }
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(HubError::Validation(errors.join("; ")))
        }
    }
}

/// Targets above 100 are taken as µS/cm.
pub fn normalize_target(raw: f64) -> f64 {
    if raw.is_finite() {
        normalize_ec(raw)
    } else {
        DEFAULT_TARGET_EC
    }
}

/// Result of the calculation phase.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DoseCalc {
    /// mS/cm per mL.
    pub sensitivity: f64,
    pub remaining_gap: f64,
    /// mL per pump, already clamped.
    pub dose: u32,
}

pub fn calculate_dose(
    baseline_ec: f64,
    pulse_ec: f64,
    pulse_ml: f64,
    target_ec: f64,
    limits: &DosingLimits,
) -> DoseCalc {
    let change = pulse_ec - baseline_ec;
    let sensitivity = if change > 0.0 && pulse_ml > 0.0 {
        change / pulse_ml
    } else {
        limits.fallback_sensitivity
    };
    let remaining_gap = target_ec - pulse_ec;
    let dose = if remaining_gap <= 0.0 {
        0
    } else {
        (remaining_gap / sensitivity).ceil().clamp(0.0, limits.max_dose) as u32
    };
    DoseCalc {
        sensitivity,
        remaining_gap,
        dose,
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
enum Stage {
    /// Idle until `next_check_time`.
    #[default]
    Waiting,
    /// The next tick runs the pumps for this phase.
    Dispense(Phase),
    Mixing { until: OffsetDateTime, then: AfterMix },
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum AfterMix {
    Measure,
    Check,
}

/// The live session, as reported by `status`.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub active: bool,
    #[serde(rename = "targetEC")]
    pub target_ec: Option<f64>,
    #[serde(rename = "currentEC")]
    pub current_ec: Option<f64>,
    pub water_volume: f64,
    pub check_interval: u64,
    pub dispensing_delay: u64,
    pub fertilizers: Vec<DoseTarget>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_check: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub next_check_time: Option<OffsetDateTime>,

    pub in_mixing_phase: bool,
    #[serde(with = "time::serde::rfc3339::option")]
    pub mixing_end_time: Option<OffsetDateTime>,
    pub mixing_time_remaining: Option<u64>,

    pub test_pulse_active: bool,
    pub test_pulse_phase: Option<Phase>,
    #[serde(rename = "baselineEC")]
    pub baseline_ec: Option<f64>,
    #[serde(rename = "testPulseEC")]
    pub test_pulse_ec: Option<f64>,
    pub test_pulse_amount: f64,
    pub ec_sensitivity: Option<f64>,
    pub calculated_dose: Option<u32>,
    pub phases_completed: Vec<Phase>,

    pub recently_active: Vec<Dispensed>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_dispensing: Option<OffsetDateTime>,

    #[serde(skip)]
    stage: Stage,
}

impl Session {
    fn target(&self) -> f64 {
        self.target_ec.unwrap_or(DEFAULT_TARGET_EC)
    }

    /// Move to `phase`, marking the current one completed.
    fn enter_phase(&mut self, phase: Phase) {
        if let Some(prev) = self.test_pulse_phase {
            if prev != phase && !self.phases_completed.contains(&prev) {
                self.phases_completed.push(prev);
            }
        }
        self.test_pulse_phase = Some(phase);
    }

    /// Close the current phase and leave the test-pulse sequence.
    fn end_sequence(&mut self) {
        if let Some(prev) = self.test_pulse_phase.take() {
            if !self.phases_completed.contains(&prev) {
                self.phases_completed.push(prev);
            }
        }
        self.test_pulse_active = false;
    }

    fn clear_mixing(&mut self) {
        self.in_mixing_phase = false;
        self.mixing_end_time = None;
        self.mixing_time_remaining = None;
    }

    fn schedule_next(&mut self, from: OffsetDateTime) {
        self.next_check_time = Some(from + clock::secs(self.check_interval as f64));
        self.stage = Stage::Waiting;
    }

    /// Abandon the sequence and fall back to the periodic check.
    fn abort(&mut self, from: OffsetDateTime) {
        self.test_pulse_active = false;
        self.test_pulse_phase = None;
        self.clear_mixing();
        self.schedule_next(from);
    }

    fn progress(&self) -> Progress {
        Progress {
            auto_dosing_mode: Some(true),
            is_dispensing: Some(false),
            target_ec: self.target_ec,
            current_ec: self.current_ec,
            test_pulse_active: Some(self.test_pulse_active),
            test_pulse_phase: self.test_pulse_phase,
            ..Default::default()
        }
    }

    fn checkpoint(&self, now: OffsetDateTime) -> Checkpoint {
        Checkpoint {
            active: self.active,
            target_ec: self.target_ec,
            check_interval: Some(self.check_interval),
            dispensing_delay: Some(self.dispensing_delay),
            water_volume: Some(self.water_volume),
            fertilizers: Some(self.fertilizers.clone()),
            timestamp: now,
        }
    }
}

// ---------------------------------------------------------------------------
// Controller
// ---------------------------------------------------------------------------

pub struct AutoDoser {
    arbiter: Arc<Arbiter>,
    shared: SharedState,
    limits: DosingLimits,
    checkpoint: CheckpointFile,
    second: Duration,
    cancel: AtomicBool,
    phase_lock: Mutex<()>,
    session: Mutex<Session>,
}

impl AutoDoser {
    pub fn new(
        arbiter: Arc<Arbiter>,
        shared: SharedState,
        limits: DosingLimits,
        checkpoint: CheckpointFile,
    ) -> Self {
        Self::with_second(arbiter, shared, limits, checkpoint, Duration::from_secs(1))
    }

    /// `second` is the pump-run poll interval; tests shrink it.
    pub fn with_second(
        arbiter: Arc<Arbiter>,
        shared: SharedState,
        limits: DosingLimits,
        checkpoint: CheckpointFile,
        second: Duration,
    ) -> Self {
        Self {
            arbiter,
            shared,
            limits,
            checkpoint,
            second,
            cancel: AtomicBool::new(false),
            phase_lock: Mutex::new(()),
            session: Mutex::new(Session::default()),
        }
    }

    pub async fn is_active(&self) -> bool {
        self.session.lock().await.active
    }

    /// Session snapshot with the mixing countdown computed live.
    pub async fn status(&self, now: OffsetDateTime) -> Session {
        let mut s = self.session.lock().await.clone();
        if let Stage::Mixing { until, .. } = s.stage {
            let left = clock::secs_between(now, until).ceil().max(0.0) as u64;
            s.mixing_time_remaining = Some(left.min(MAX_REPORTED_MIXING));
        }
        s
    }

    fn emit(&self, mut p: Progress, message: impl Into<String>) {
        p.message = Some(message.into());
        self.arbiter.events().progress(p);
    }

    async fn latest_ec(&self) -> Result<Option<f64>> {
        let snapshot = state::latest_snapshot(&self.shared, self.arbiter.db()).await?;
        Ok(snapshot.and_then(|s| s.ec()))
    }

    async fn save_checkpoint(&self, now: OffsetDateTime) {
        let cp = self.session.lock().await.checkpoint(now);
        if let Err(e) = self.checkpoint.save(&cp).await {
            warn!("dosing: failed to write checkpoint: {e:#}");
        }
    }

    // -----------------------------------------------------------------------
    // Start / stop
    // -----------------------------------------------------------------------

    /// Start a session, replacing any running one, and run the first check
    /// right away. A failed first check is logged; the next tick retries.
    pub async fn start(&self, req: StartRequest, now: OffsetDateTime) -> Result<Session> {
        req.validate()?;
        self.stop().await;

        self.arbiter.acquire(Holder::AutoDosing).await?;
        self.cancel.store(false, Ordering::SeqCst);

        let check_interval = req.check_interval.unwrap_or(DEFAULT_CHECK_INTERVAL);
        let target = normalize_target(req.target_ec.unwrap_or(DEFAULT_TARGET_EC));
        {
            let mut s = self.session.lock().await;
            *s = Session {
                active: true,
                target_ec: Some(target),
                current_ec: req.current_ec.map(normalize_ec),
                water_volume: req.water_volume.unwrap_or(DEFAULT_WATER_VOLUME),
                check_interval,
                dispensing_delay: req.dispensing_delay.unwrap_or(DEFAULT_DISPENSING_DELAY),
                fertilizers: req.fertilizers.unwrap_or_default(),
                last_check: Some(now),
                test_pulse_amount: req
                    .test_pulse_amount
                    .unwrap_or(self.limits.test_pulse_amount),
                ..Default::default()
            };
            s.schedule_next(now);
        }
        self.save_checkpoint(now).await;

        info!(target_ec = target, check_interval, "dosing: auto-dosing started");
        self.shared
            .write()
            .await
            .record_dosing(format!("auto-dosing started, target EC {target:.2} mS/cm"));

        if let Err(e) = self.check_and_adjust(now).await {
            warn!("dosing: initial EC check failed, will retry: {e}");
        }
        Ok(self.status(now).await)
    }

    /// Stop the session: cancel any dispense, idle the session's pumps, drop
    /// the interlock and delete the checkpoint. Returns whether a session
    /// was active.
    pub async fn stop(&self) -> bool {
        self.cancel.store(true, Ordering::SeqCst);
        let (was_active, ids) = {
            let mut s = self.session.lock().await;
            let was = s.active;
            let ids: Vec<String> = s.fertilizers.iter().map(|f| f.id.clone()).collect();
            s.active = false;
            s.test_pulse_active = false;
            s.test_pulse_phase = None;
            s.clear_mixing();
            s.next_check_time = None;
            s.stage = Stage::Waiting;
            (was, ids)
        };

        // Wait out an in-flight phase; it sees the flag within one poll.
        let _phase = self.phase_lock.lock().await;

        // A combined run may be driving the same pumps.
        let pumps = if was_active && self.arbiter.dispenser().await.is_none() {
            idle_pumps(&self.arbiter, &ids).await
        } else {
            0
        };
        self.arbiter.release(Holder::DosingPhase).await;
        self.arbiter.release(Holder::AutoDosing).await;
        if let Err(e) = self.checkpoint.clear().await {
            warn!("dosing: failed to remove checkpoint: {e:#}");
        }

        if was_active {
            info!(pumps_stopped = pumps, "dosing: auto-dosing stopped");
            self.arbiter.events().progress(Progress {
                is_dispensing: Some(false),
                auto_dosing_mode: Some(true),
                stopped: Some(true),
                message: Some("Auto-dosing stopped by user".into()),
                ..Default::default()
            });
            self.shared
                .write()
                .await
                .record_dosing("auto-dosing stopped".into());
        }
        was_active
    }

    /// Resume a session from the checkpoint file. Returns whether a session
    /// was started.
    pub async fn restore(&self, now: OffsetDateTime) -> Result<bool> {
        let cp = match self.checkpoint.load().await {
            Ok(Some(cp)) => cp,
            Ok(None) => return Ok(false),
            Err(e) => {
                warn!("dosing: ignoring unreadable checkpoint: {e:#}");
                return Ok(false);
            }
        };
        if !cp.is_restorable(now) {
            info!(saved_at = %cp.timestamp, "dosing: checkpoint inactive or stale, not restoring");
            if let Err(e) = self.checkpoint.clear().await {
                warn!("dosing: failed to remove checkpoint: {e:#}");
            }
            return Ok(false);
        }

        let fertilizers = match cp.fertilizers.filter(|f| !f.is_empty()) {
            Some(list) => list,
            None => self
                .arbiter
                .list()
                .await?
                .into_iter()
                .filter(|a| a.kind.is_fertilizer_pump())
                .map(|a| DoseTarget { id: a.id, ratio: 1.0 })
                .collect(),
        };
        let req = StartRequest {
            target_ec: cp.target_ec,
            check_interval: Some(cp.check_interval.unwrap_or(DEFAULT_CHECK_INTERVAL)),
            dispensing_delay: Some(cp.dispensing_delay.unwrap_or(DEFAULT_DISPENSING_DELAY)),
            water_volume: Some(cp.water_volume.unwrap_or(DEFAULT_WATER_VOLUME)),
            fertilizers: Some(fertilizers),
            ..Default::default()
        };
        info!(saved_at = %cp.timestamp, "dosing: restoring session from checkpoint");
        self.start(req, now).await?;
        Ok(true)
    }

    // -----------------------------------------------------------------------
    // Phase machine
    // -----------------------------------------------------------------------

    /// One step of the control loop.
    pub async fn on_tick(&self, now: OffsetDateTime) -> Result<()> {
        let _phase = self.phase_lock.lock().await;
        let (stage, next_check) = {
            let s = self.session.lock().await;
            if !s.active {
                return Ok(());
            }
            (s.stage, s.next_check_time)
        };
        match stage {
            Stage::Waiting => {
                if next_check.is_some_and(|t| now >= t) {
                    self.check_locked(now).await?;
                }
                Ok(())
            }
            Stage::Dispense(phase) => self.dispense_locked(phase, now).await,
            Stage::Mixing { until, then } => self.mix_locked(until, then, now).await,
        }
    }

    /// Read EC and either reschedule or open a test-pulse sequence. While a
    /// sequence is running this is a no-op; the tick advances it.
    pub async fn check_and_adjust(&self, now: OffsetDateTime) -> Result<()> {
        let _phase = self.phase_lock.lock().await;
        self.check_locked(now).await
    }

    async fn check_locked(&self, now: OffsetDateTime) -> Result<()> {
        let ec = self.latest_ec().await?;
        let mut s = self.session.lock().await;
        if !s.active {
            return Ok(());
        }
        if s.test_pulse_active {
            if s.stage != Stage::Waiting {
                debug!("dosing: test-pulse sequence in progress, check skipped");
                return Ok(());
            }
            // Nothing advances a sequence parked in Waiting.
            warn!(phase = ?s.test_pulse_phase, "dosing: stranded test-pulse sequence abandoned");
            s.abort(now);
        }
        s.last_check = Some(now);

        let Some(ec) = ec else {
            warn!("dosing: no usable EC reading, retrying next interval");
            s.schedule_next(now);
            let mut p = s.progress();
            p.next_check_time = s.next_check_time;
            self.emit(p, "No EC reading available, retrying at next check");
            return Ok(());
        };

        s.current_ec = Some(ec);
        let target = s.target();
        let gap = target - ec;
        info!(current_ec = ec, target_ec = target, gap, "dosing: EC check");

        if gap <= self.limits.dead_band {
            s.schedule_next(now);
            let mut p = s.progress();
            p.ec_gap = Some(gap);
            p.progress = Some(ec / target * 100.0);
            p.next_check_time = s.next_check_time;
            self.emit(p, "EC within target range");
            return Ok(());
        }

        s.test_pulse_active = true;
        s.test_pulse_phase = None;
        s.phases_completed.clear();
        s.enter_phase(Phase::Baseline);
        s.baseline_ec = Some(ec);
        s.test_pulse_ec = None;
        s.ec_sensitivity = None;
        s.calculated_dose = None;
        let mut p = s.progress();
        p.baseline_ec = Some(ec);
        p.ec_gap = Some(gap);
        self.emit(p, format!("Baseline EC {ec:.2} mS/cm recorded"));

        s.enter_phase(Phase::TestPulse);
        s.stage = Stage::Dispense(Phase::TestPulse);
        let amount = s.test_pulse_amount;
        drop(s);

        info!(baseline_ec = ec, pulse_ml = amount, "dosing: test-pulse sequence started");
        self.shared.write().await.record_dosing(format!(
            "test pulse started at EC {ec:.2} (target {target:.2})"
        ));
        Ok(())
    }

    async fn dispense_locked(&self, phase: Phase, now: OffsetDateTime) -> Result<()> {
        let (items, base, delay) = {
            let s = self.session.lock().await;
            if !s.active {
                return Ok(());
            }
            let per_pump = match phase {
                Phase::TestPulse => s.test_pulse_amount,
                _ => f64::from(s.calculated_dose.unwrap_or(0)),
            };
            let items: Vec<DoseItem> = s
                .fertilizers
                .iter()
                .map(|f| DoseItem {
                    id: f.id.clone(),
                    amount: match phase {
                        Phase::TestPulse => per_pump,
                        _ => (per_pump * f.ratio).min(self.limits.max_dose),
                    },
                })
                .collect();
            let mut base = s.progress();
            base.test_pulse_phase = Some(phase);
            base.calculated_dose = s.calculated_dose;
            (items, base, s.dispensing_delay)
        };

        let label = match phase {
            Phase::TestPulse => "test pulse",
            _ => "final dose",
        };

        // The stage stays put while a combined run holds the pumps; the
        // next tick tries again.
        let guard = match self.arbiter.acquire_dispenser(Holder::DosingPhase).await {
            Ok(g) => g,
            Err(e) if e.is_conflict() => {
                debug!("dosing: {label} deferred, {e}");
                return Ok(());
            }
            Err(e) => {
                self.session.lock().await.abort(now);
                return Err(e);
            }
        };

        let mut p = base.clone();
        p.is_dispensing = Some(true);
        self.emit(p, format!("Delivering {label}"));
        info!(pumps = items.len(), "dosing: delivering {label}");

        let started = clock::now();
        let res = run_items(&self.arbiter, &items, delay, &self.cancel, self.second, &base).await;
        if res.is_err() {
            let ids: Vec<String> = items.iter().map(|i| i.id.clone()).collect();
            idle_pumps(&self.arbiter, &ids).await;
        }
        guard.release().await;
        let finished = now + (clock::now() - started);

        let mut s = self.session.lock().await;
        if !s.active {
            return Ok(());
        }
        let done = match res {
            Ok(RunEnd::Completed(done)) if !done.is_empty() => done,
            Ok(RunEnd::Completed(_)) => {
                warn!("dosing: none of the configured pumps exist");
                s.abort(finished);
                let mut p = s.progress();
                p.error = Some("no configured fertilizer pumps found".into());
                self.emit(p, "Dosing skipped: no fertilizer pumps available");
                return Ok(());
            }
            Ok(RunEnd::Stopped(_)) => return Ok(()),
            Err(e) => {
                error!("dosing: {label} failed: {e}");
                s.abort(finished);
                let mut p = s.progress();
                p.error = Some(e.to_string());
                self.emit(p, format!("Error during {label}"));
                drop(s);
                self.shared
                    .write()
                    .await
                    .record_error(format!("auto-dosing {label} failed: {e}"));
                return Ok(());
            }
        };

        let total_ml: f64 = done.iter().map(|d| d.amount).sum();
        s.recently_active = done;
        s.last_dispensing = Some(finished);

        let until = finished + clock::secs(s.check_interval as f64);
        s.in_mixing_phase = true;
        s.mixing_end_time = Some(until);
        s.mixing_time_remaining = Some(s.check_interval);

        let mut p = s.progress();
        p.completed = Some(true);
        p.mixing_state = Some(true);
        p.mixing_time_remaining = Some(s.check_interval);
        let message = match phase {
            Phase::TestPulse => {
                s.stage = Stage::Mixing {
                    until,
                    then: AfterMix::Measure,
                };
                p.test_pulse_phase = Some(Phase::Measuring);
                "Test pulse delivered, mixing before measurement"
            }
            _ => {
                s.end_sequence();
                s.next_check_time = Some(until);
                s.stage = Stage::Mixing {
                    until,
                    then: AfterMix::Check,
                };
                p.test_pulse_active = Some(false);
                p.test_pulse_complete = Some(true);
                p.next_check_time = Some(until);
                "Final dose delivered, mixing before next check"
            }
        };
        self.emit(p, message);
        drop(s);

        self.shared
            .write()
            .await
            .record_dosing(format!("{label} delivered ({total_ml:.1} mL total)"));
        Ok(())
    }

    async fn mix_locked(
        &self,
        until: OffsetDateTime,
        then: AfterMix,
        now: OffsetDateTime,
    ) -> Result<()> {
        let remaining = clock::secs_between(now, until).ceil().max(0.0) as u64;
        {
            let mut s = self.session.lock().await;
            if !s.active {
                return Ok(());
            }
            s.mixing_time_remaining = Some(remaining);
            if remaining > 0 {
                if remaining % 5 == 0 || remaining <= 10 {
                    let mut p = s.progress();
                    p.mixing_state = Some(true);
                    p.mixing_time_remaining = Some(remaining);
                    self.emit(p, format!("Mixing: {remaining}s remaining"));
                }
                return Ok(());
            }
            s.clear_mixing();
            s.stage = Stage::Waiting;
            let mut p = s.progress();
            p.mixing_state = Some(false);
            p.mixing_time_remaining = Some(0);
            self.emit(p, "Mixing complete");
        }
        debug!(?then, "dosing: mixing complete");
        match then {
            AfterMix::Measure => self.measure_locked(now).await,
            AfterMix::Check => self.check_locked(now).await,
        }
    }

    async fn measure_locked(&self, now: OffsetDateTime) -> Result<()> {
        let read = self.latest_ec().await;
        let mut s = self.session.lock().await;
        if !s.active {
            return Ok(());
        }
        let ec = match read {
            Ok(ec) => ec,
            Err(e) => {
                error!("dosing: EC read after test pulse failed: {e}");
                s.abort(now);
                let mut p = s.progress();
                p.error = Some(e.to_string());
                p.next_check_time = s.next_check_time;
                self.emit(p, "EC read failed after test pulse, retrying at next check");
                drop(s);
                self.shared
                    .write()
                    .await
                    .record_error(format!("auto-dosing measurement failed: {e}"));
                return Ok(());
            }
        };
        let Some(ec) = ec else {
            warn!("dosing: no usable EC reading after test pulse, abandoning sequence");
            s.abort(now);
            self.emit(s.progress(), "No EC reading after test pulse, retrying at next check");
            return Ok(());
        };

        s.enter_phase(Phase::Measuring);
        s.test_pulse_ec = Some(ec);
        s.current_ec = Some(ec);
        let mut p = s.progress();
        p.test_pulse_ec = Some(ec);
        p.baseline_ec = s.baseline_ec;
        self.emit(p, format!("Post-pulse EC {ec:.2} mS/cm"));

        s.enter_phase(Phase::Calculation);
        let baseline = s.baseline_ec.unwrap_or(ec);
        let calc = calculate_dose(baseline, ec, s.test_pulse_amount, s.target(), &self.limits);
        s.ec_sensitivity = Some(calc.sensitivity);
        s.calculated_dose = Some(calc.dose);
        info!(
            baseline_ec = baseline,
            pulse_ec = ec,
            sensitivity = calc.sensitivity,
            dose_ml = calc.dose,
            "dosing: dose calculated"
        );

        let mut p = s.progress();
        p.baseline_ec = s.baseline_ec;
        p.test_pulse_ec = Some(ec);
        p.ec_sensitivity = Some(calc.sensitivity);
        p.calculated_dose = Some(calc.dose);
        p.ec_gap = Some(calc.remaining_gap);

        if calc.dose == 0 {
            s.end_sequence();
            s.schedule_next(now);
            p.test_pulse_active = Some(false);
            p.test_pulse_phase = None;
            p.test_pulse_complete = Some(true);
            p.next_check_time = s.next_check_time;
            self.emit(p, "Target reached by test pulse, no further dose needed");
            return Ok(());
        }

        self.emit(p, format!("Calculated dose: {} mL per pump", calc.dose));
        s.enter_phase(Phase::FinalDose);
        s.stage = Stage::Dispense(Phase::FinalDose);
        Ok(())
    }
}

/// Control loop: one phase-machine step per second.
pub async fn run(doser: Arc<AutoDoser>) {
    let mut tick = tokio::time::interval(Duration::from_secs(1));
    tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        tick.tick().await;
        if let Err(e) = doser.on_tick(clock::now()).await {
            error!("dosing: tick failed: {e}");
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
