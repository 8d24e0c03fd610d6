//! Mode arbiter: the only path through which actuator records change.
//!
//! Every write is a read-modify-write of one record under a single write
//! lock, followed by an `actuator_update` broadcast. On top of that sits
//! the pump interlock used by fertilizer operations:
//!
//! ```text
//!   holders: {}  ──acquire(h)──▶  {h}  ──acquire(h2)──▶  {h, h2}
//!      ▲          engage pumps          (no hardware change)   │
//!      │                                                       │ release(h)
//!      └──── disengage pumps ◀── release(h2) ──── {h2} ◀────────┘
//! ```
//!
//! Engaging idles the irrigation pump and forces every circulation pump on,
//! both in `rule` mode with their previous mode recorded. Disengaging puts
//! them back. While any holder is registered the irrigation pump refuses to
//! start and circulation pumps refuse every change. Only one holder that
//! drives fertilizer pumps may be registered at a time.

use std::collections::BTreeSet;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::actuator::{Actuator, Mode, SettingsPatch, Status, StatusUpdate};
use crate::clock::{self, WEEKDAYS};
use crate::db::Db;
use crate::dispense::dispense_secs;
use crate::error::{HubError, Result};
use crate::events::{Broadcaster, Hints};

const MSG_BLOCKED: &str = "Blocked during fertilizer cycle";
const MSG_DISABLED: &str = "Disabled during fertilizer dispensing";
const MSG_REQUIRED: &str = "Required for fertilizer mixing";

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Who is holding the pump interlock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Holder {
    /// One combined-dispense run, tagged with its run number.
    Sequencer(u64),
    /// The auto-dosing session as a whole.
    AutoDosing,
    /// A single auto-dosing dispense phase.
    DosingPhase,
}

impl Holder {
    /// Holders that drive fertilizer pumps themselves. At most one may be
    /// registered at a time.
    pub fn dispenses(&self) -> bool {
        !matches!(self, Self::AutoDosing)
    }

    fn describe(&self) -> String {
        match self {
            Self::Sequencer(run) => format!("combined dispense run {run} in progress"),
            Self::AutoDosing => "auto-dosing session active".to_string(),
            Self::DosingPhase => "auto-dosing phase in progress".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub enum StatusOutcome {
    Applied(Actuator),
    /// Safety veto: the request was refused and the pump held at idle.
    Vetoed(Actuator),
}

impl StatusOutcome {
    pub fn actuator(&self) -> &Actuator {
        match self {
            Self::Applied(a) | Self::Vetoed(a) => a,
        }
    }

    pub fn is_vetoed(&self) -> bool {
        matches!(self, Self::Vetoed(_))
    }
}

pub struct Arbiter {
    db: Db,
    events: Broadcaster,
    irrigation_pump_id: String,
    seed: Vec<Actuator>,
    write_lock: Mutex<()>,
    holders: Mutex<BTreeSet<Holder>>,
}

// ---------------------------------------------------------------------------
// Record access
// ---------------------------------------------------------------------------

impl Arbiter {
    pub fn new(db: Db, events: Broadcaster, irrigation_pump_id: &str, seed: Vec<Actuator>) -> Self {
        Self {
            db,
            events,
            irrigation_pump_id: irrigation_pump_id.to_string(),
            seed,
            write_lock: Mutex::new(()),
            holders: Mutex::new(BTreeSet::new()),
        }
    }

    pub fn events(&self) -> &Broadcaster {
        &self.events
    }

    pub fn db(&self) -> &Db {
        &self.db
    }

    pub fn irrigation_pump_id(&self) -> &str {
        &self.irrigation_pump_id
    }

    pub async fn get(&self, id: &str) -> Result<Actuator> {
        self.db
            .get_actuator(id)
            .await?
            .ok_or_else(|| HubError::ActuatorNotFound(id.to_string()))
    }

    /// All actuators, with `remainingTime` reflecting live countdowns.
    pub async fn list(&self) -> Result<Vec<Actuator>> {
        let now = clock::now();
        let mut all = self.db.load_actuators().await?;
        for a in &mut all {
            if a.status == Status::Active {
                a.remaining_time = a.live_remaining(now);
            }
        }
        Ok(all)
    }

    pub async fn remaining_time(&self, id: &str) -> Result<f64> {
        Ok(self.get(id).await?.live_remaining(clock::now()))
    }

    /// Read-modify-write one record. The closure returns the hints to
    /// broadcast, or `None` to leave the record untouched.
    pub(crate) async fn update_if<F>(&self, id: &str, f: F) -> Result<Option<Actuator>>
    where
        F: FnOnce(&mut Actuator) -> Option<Hints>,
    {
        let guard = self.write_lock.lock().await;
        let mut a = self.get(id).await?;
        let Some(hints) = f(&mut a) else {
            return Ok(None);
        };
        a.enforce_invariants();
        self.db.upsert_actuator(&a).await?;
        drop(guard);

        self.events.actuator(&a, hints);
        Ok(Some(a))
    }

    pub(crate) async fn update<F>(&self, id: &str, f: F) -> Result<Actuator>
    where
        F: FnOnce(&mut Actuator) -> Hints,
    {
        let updated = self.update_if(id, |a| Some(f(a))).await?;
        updated.ok_or_else(|| HubError::ActuatorNotFound(id.to_string()))
    }

    // -----------------------------------------------------------------------
    // Status / settings
    // -----------------------------------------------------------------------

    pub async fn set_status(&self, id: &str, update: StatusUpdate) -> Result<StatusOutcome> {
        if update.status.is_none() && update.mode.is_none() {
            return Err(HubError::validation("status is required"));
        }
        // Held until the write lands so no holder can register in between.
        let holders = self.holders.lock().await;
        if let Some(vetoed) = self.veto_locked(&holders, id, update.status).await? {
            return Ok(StatusOutcome::Vetoed(vetoed));
        }

        let now = clock::now();
        let a = self
            .update(id, |a| {
                a.apply_status(&update, now);
                Hints::default()
            })
            .await?;
        drop(holders);
        info!(actuator = %id, status = ?a.status, mode = ?a.mode, "arbiter: status set");
        Ok(StatusOutcome::Applied(a))
    }

    pub async fn set_settings(&self, id: &str, patch: SettingsPatch) -> Result<Actuator> {
        validate_settings(&patch)?;
        let now = clock::now();
        let mut interval_changed = false;
        let a = self
            .update(id, |a| {
                interval_changed = a.apply_settings(&patch, now);
                Hints::default()
            })
            .await?;
        if interval_changed {
            info!(
                actuator = %id,
                interval_secs = a.schedule.interval.total_secs(),
                "arbiter: schedule interval changed"
            );
        }
        Ok(a)
    }

    /// Flip between active and idle; subject to the same veto as
    /// `set_status`.
    pub async fn toggle(&self, id: &str) -> Result<StatusOutcome> {
        let current = self.get(id).await?;
        let next = if current.is_active() {
            Status::Idle
        } else {
            Status::Active
        };
        self.set_status(id, StatusUpdate::to(next)).await
    }

    /// Drop every actuator record and recreate the configured set.
    pub async fn reset_all(&self) -> Result<Vec<Actuator>> {
        let guard = self.write_lock.lock().await;
        let removed = self.db.delete_all_actuators().await?;
        for a in &self.seed {
            self.db.upsert_actuator(a).await?;
        }
        drop(guard);

        for a in &self.seed {
            self.events.actuator(a, Hints::default());
        }
        warn!(removed, recreated = self.seed.len(), "arbiter: actuators reset");
        Ok(self.seed.clone())
    }

    // -----------------------------------------------------------------------
    // Rule ownership
    // -----------------------------------------------------------------------

    /// Hand an actuator to a rule: rule mode, override on, owner recorded.
    pub async fn claim_for_rule(
        &self,
        id: &str,
        rule_id: i64,
        status: Status,
        solution_amount: Option<f64>,
    ) -> Result<StatusOutcome> {
        let holders = self.holders.lock().await;
        if let Some(vetoed) = self.veto_locked(&holders, id, Some(status)).await? {
            return Ok(StatusOutcome::Vetoed(vetoed));
        }
        let now = clock::now();
        let a = self
            .update(id, |a| {
                a.enter_mode(Mode::Rule);
                a.override_mode = true;
                a.triggered_by_rule = Some(rule_id);
                if solution_amount.is_some() {
                    a.solution_amount = solution_amount;
                }
                // A measured release on a metered pump runs for its dispense time.
                let timed = match (status, solution_amount, a.kind.flow_rate()) {
                    (Status::Active, Some(ml), Some(flow)) if ml > 0.0 => {
                        Some(dispense_secs(ml, flow))
                    }
                    _ => None,
                };
                if let Some(secs) = timed {
                    a.apply_status(&StatusUpdate::to(status).for_secs(secs), now);
                } else if a.status != status {
                    a.apply_status(&StatusUpdate::to(status), now);
                }
                Hints::default()
            })
            .await?;
        drop(holders);
        Ok(StatusOutcome::Applied(a))
    }

    /// Give an actuator back from a rule, but only while that rule still
    /// owns it. Returns whether anything changed.
    pub async fn release_from_rule(&self, id: &str, rule_id: i64) -> Result<bool> {
        let now = clock::now();
        let changed = self
            .update_if(id, |a| {
                if a.mode != Mode::Rule || a.triggered_by_rule != Some(rule_id) {
                    return None;
                }
                if a.status != Status::Idle {
                    a.apply_status(&StatusUpdate::to(Status::Idle), now);
                }
                a.restore_mode();
                Some(Hints::default())
            })
            .await?;
        Ok(changed.is_some())
    }

    // -----------------------------------------------------------------------
    // Pump interlock
    // -----------------------------------------------------------------------

    pub async fn interlock_held(&self) -> bool {
        !self.holders.lock().await.is_empty()
    }

    /// Register `holder`. The first holder engages the pumps; further
    /// holders, or a repeat of the same one, change nothing.
    pub async fn acquire(&self, holder: Holder) -> Result<()> {
        let mut holders = self.holders.lock().await;
        self.acquire_locked(&mut holders, holder).await
    }

    async fn acquire_locked(&self, holders: &mut BTreeSet<Holder>, holder: Holder) -> Result<()> {
        if !holders.insert(holder) {
            return Ok(());
        }
        if holders.len() > 1 {
            return Ok(());
        }
        info!(?holder, "interlock: engaging pumps");
        if let Err(e) = self.engage_pumps().await {
            error!(?holder, "interlock: engage failed: {e}");
            holders.remove(&holder);
            self.disengage_pumps().await;
            return Err(e);
        }
        Ok(())
    }

    /// Acquire for a holder that drives fertilizer pumps, with a guard that
    /// releases on every exit path. Fails with [`HubError::Busy`] while a
    /// different dispensing holder is registered.
    pub async fn acquire_dispenser(self: &Arc<Self>, holder: Holder) -> Result<InterlockGuard> {
        let mut holders = self.holders.lock().await;
        if let Some(other) = holders.iter().find(|h| h.dispenses() && **h != holder) {
            return Err(HubError::Busy(other.describe()));
        }
        self.acquire_locked(&mut holders, holder).await?;
        Ok(InterlockGuard {
            arbiter: Arc::clone(self),
            holder,
            released: false,
        })
    }

    /// The registered holder driving fertilizer pumps, if any.
    pub async fn dispenser(&self) -> Option<Holder> {
        self.holders.lock().await.iter().copied().find(Holder::dispenses)
    }

    /// Unregister `holder`; the last one out restores the pumps. Unknown
    /// holders are ignored. Never fails: problems are logged.
    pub async fn release(&self, holder: Holder) {
        let mut holders = self.holders.lock().await;
        if !holders.remove(&holder) {
            return;
        }
        if holders.is_empty() {
            info!(?holder, "interlock: disengaging pumps");
            self.disengage_pumps().await;
        }
    }

    /// Undo interlock markers left behind by an unclean shutdown.
    pub async fn recover_interlock(&self) -> usize {
        let holders = self.holders.lock().await;
        if !holders.is_empty() {
            return 0;
        }
        let restored = self.disengage_pumps().await;
        if restored > 0 {
            warn!(restored, "interlock: released pumps left held by a previous run");
        }
        restored
    }

    /// Refuse a change the interlock forbids: starting the irrigation pump,
    /// or touching an actuator whose controls are disabled. Called with
    /// `holders` locked.
    async fn veto_locked(
        &self,
        holders: &BTreeSet<Holder>,
        id: &str,
        status: Option<Status>,
    ) -> Result<Option<Actuator>> {
        if holders.is_empty() {
            return Ok(None);
        }
        if id != self.irrigation_pump_id {
            let a = self.get(id).await?;
            if !a.disabled_controls {
                return Ok(None);
            }
            warn!(actuator = %id, "arbiter: change refused, controls disabled by interlock");
            self.events.actuator(&a, Hints::prevented(MSG_REQUIRED));
            return Ok(Some(a));
        }
        if status != Some(Status::Active) {
            return Ok(None);
        }
        let now = clock::now();
        let a = self
            .update(id, |a| {
                if a.status != Status::Idle {
                    a.apply_status(&StatusUpdate::to(Status::Idle), now);
                }
                a.enter_mode(Mode::Rule);
                a.override_mode = true;
                a.disabled_by_fertilizer = true;
                Hints::prevented(MSG_BLOCKED)
            })
            .await?;
        warn!(actuator = %id, "arbiter: activation vetoed, fertilizer operation in progress");
        Ok(Some(a))
    }

    async fn engage_pumps(&self) -> Result<()> {
        let now = clock::now();

        match self
            .update(&self.irrigation_pump_id, |a| {
                if a.status != Status::Idle {
                    a.apply_status(&StatusUpdate::to(Status::Idle), now);
                }
                a.enter_mode(Mode::Rule);
                a.override_mode = true;
                a.triggered_by_rule = None;
                a.disabled_by_fertilizer = true;
                Hints::message(MSG_DISABLED)
            })
            .await
        {
            Ok(_) => {}
            Err(e) if e.is_not_found() => {
                warn!(actuator = %self.irrigation_pump_id, "interlock: irrigation pump missing");
            }
            Err(e) => return Err(e),
        }

        let circulation: Vec<String> = self
            .db
            .load_actuators()
            .await?
            .into_iter()
            .filter(|a| a.kind.is_circulation())
            .map(|a| a.id)
            .collect();
        if circulation.is_empty() {
            warn!("interlock: no sensor pump configured");
        }
        for id in circulation {
            self.update(&id, |a| {
                a.enter_mode(Mode::Rule);
                a.override_mode = true;
                a.triggered_by_rule = None;
                a.apply_status(&StatusUpdate::to(Status::Active), now);
                a.activated_by_fertilizer = true;
                a.disabled_controls = true;
                Hints::message(MSG_REQUIRED)
            })
            .await?;
        }
        Ok(())
    }

    /// Restore every actuator carrying an interlock marker. Returns how
    /// many were restored.
    async fn disengage_pumps(&self) -> usize {
        let held: Vec<String> = match self.db.load_actuators().await {
            Ok(all) => all
                .into_iter()
                .filter(|a| a.held_by_interlock())
                .map(|a| a.id)
                .collect(),
            Err(e) => {
                error!("interlock: cannot load actuators for release: {e:#}");
                return 0;
            }
        };

        let now = clock::now();
        let mut restored = 0;
        for id in held {
            let res = self
                .update(&id, |a| {
                    if a.activated_by_fertilizer && a.status != Status::Idle {
                        a.apply_status(&StatusUpdate::to(Status::Idle), now);
                    }
                    a.restore_mode();
                    a.disabled_by_fertilizer = false;
                    a.activated_by_fertilizer = false;
                    a.disabled_controls = false;
                    Hints::default()
                })
                .await;
            match res {
                Ok(_) => restored += 1,
                Err(e) => error!(actuator = %id, "interlock: release failed: {e}"),
            }
        }
        restored
    }
}

fn validate_settings(patch: &SettingsPatch) -> Result<()> {
    let mut errors = Vec::new();
    if let Some(f) = patch.flow_rate {
        if !(f.is_finite() && f > 0.0) {
            errors.push(format!("flowRate must be positive, got {f}"));
        }
    }
    if let Some(days) = patch.schedule.as_ref().and_then(|s| s.active_days.as_ref()) {
        for d in days {
            if !WEEKDAYS.contains(&d.to_ascii_lowercase().as_str()) {
                errors.push(format!("unknown weekday '{d}'"));
            }
        }
    }
    if errors.is_empty() {
        Ok(())
    } else {
        Err(HubError::Validation(errors.join("; ")))
    }
}

// ---------------------------------------------------------------------------
// Scoped acquisition
// ---------------------------------------------------------------------------

/// Interlock hold released on every exit path. Prefer [`release`]; the
/// drop fallback schedules the release on the runtime.
///
/// [`release`]: InterlockGuard::release
pub struct InterlockGuard {
    arbiter: Arc<Arbiter>,
    holder: Holder,
    released: bool,
}

impl InterlockGuard {
    pub async fn release(mut self) {
        self.released = true;
        self.arbiter.release(self.holder).await;
    }
}

impl Drop for InterlockGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let arbiter = Arc::clone(&self.arbiter);
        let holder = self.holder;
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move { arbiter.release(holder).await });
            }
            Err(_) => error!(?holder, "interlock: guard dropped outside runtime, hold leaked"),
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
