//! Conditional rules: model, pure evaluation, the periodic engine pass and
//! the management operations.
//!
//! ```text
//!   inactive ──condition met──▶ active ──until met / condition cleared──▶ inactive
//!       ▲                         │
//!       └── deactivated by a ─────┘   (a higher-priority rule took the actuator,
//!           competing rule            the actuator was reassigned, rule edited)
//! ```
//!
//! A rule is only `currentlyActive` while its actuator is in rule mode with
//! `triggeredByRule` pointing back at it; every pass starts by clearing
//! rules that lost their actuator some other way.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tokio::sync::Mutex;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::actuator::{Actuator, Mode, Status};
use crate::arbiter::Arbiter;
use crate::clock::{self, secs_between};
use crate::db::Db;
use crate::error::{HubError, Result};
use crate::sensors::{is_fault, normalize_ec, Channel, Snapshot};
use crate::state::{self, SharedState};

const TICK_INTERVAL_SEC: u64 = 5;

/// Tolerance for `=` comparisons.
const EQ_EPSILON: f64 = 0.1;

pub const DEFAULT_PRIORITY: u8 = 10;
pub const DEFAULT_MAX_EC: f64 = 3.0;

// ---------------------------------------------------------------------------
// Model
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Trigger {
    #[serde(rename = "pH Level", alias = "ph")]
    Ph,
    #[serde(rename = "EC Level", alias = "ec")]
    Ec,
    #[serde(rename = "Water Level", alias = "waterLevel")]
    WaterLevel,
    #[serde(rename = "Air Temperature", alias = "airTemp")]
    AirTemp,
    #[serde(rename = "Water Temperature", alias = "waterTemp")]
    WaterTemp,
    #[serde(rename = "Humidity", alias = "humidity")]
    Humidity,
}

impl Trigger {
    pub fn channel(self) -> Channel {
        match self {
            Self::Ph => Channel::Ph,
            Self::Ec => Channel::Ec,
            Self::WaterLevel => Channel::WaterLevel,
            Self::AirTemp => Channel::AirTemp,
            Self::WaterTemp => Channel::WaterTemp,
            Self::Humidity => Channel::Humidity,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Ph => "pH Level",
            Self::Ec => "EC Level",
            Self::WaterLevel => "Water Level",
            Self::AirTemp => "Air Temperature",
            Self::WaterTemp => "Water Temperature",
            Self::Humidity => "Humidity",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Condition {
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = "=")]
    Eq,
}

impl Condition {
    pub fn holds(self, reading: f64, threshold: f64) -> bool {
        match self {
            Self::Lt => reading < threshold,
            Self::Gt => reading > threshold,
            Self::Eq => (reading - threshold).abs() < EQ_EPSILON,
        }
    }

    pub fn symbol(self) -> &'static str {
        match self {
            Self::Lt => "<",
            Self::Gt => ">",
            Self::Eq => "=",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Rule {
    #[serde(default)]
    pub id: i64,
    pub name: String,
    pub trigger: Trigger,
    pub condition: Condition,
    pub value: f64,
    /// Free text: "Turn On", "Turn Off", "Release Fertilizer", ...
    pub action: String,
    pub actuator_id: String,
    #[serde(default)]
    pub solution_amount: f64,
    pub enabled: bool,
    pub priority: u8,

    #[serde(default, with = "time::serde::rfc3339::option")]
    pub last_triggered: Option<OffsetDateTime>,
    #[serde(default)]
    pub currently_active: bool,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub active_since: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub cooldown_until: Option<OffsetDateTime>,

    #[serde(default)]
    pub until_condition_enabled: bool,
    #[serde(default)]
    pub until_trigger: Option<Trigger>,
    #[serde(default)]
    pub until_condition: Option<Condition>,
    #[serde(default)]
    pub until_value: Option<f64>,

    /// Minutes between two releases.
    #[serde(default)]
    pub min_interval: f64,
    #[serde(default)]
    pub check_ec_level: bool,
    #[serde(default = "default_max_ec")]
    pub max_ec_level: f64,

    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

fn default_max_ec() -> f64 {
    DEFAULT_MAX_EC
}

impl Rule {
    pub fn is_release(&self) -> bool {
        self.action.contains("Release")
    }

    /// Actuator status this rule drives while active.
    pub fn target_status(&self) -> Status {
        if self.action.contains("Turn Off") {
            Status::Idle
        } else {
            Status::Active
        }
    }
}

/// Create/update payload. Absent fields keep their current (or default)
/// value.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleDraft {
    pub name: Option<String>,
    pub trigger: Option<Trigger>,
    pub condition: Option<Condition>,
    pub value: Option<f64>,
    pub action: Option<String>,
    pub actuator_id: Option<String>,
    pub solution_amount: Option<f64>,
    pub enabled: Option<bool>,
    pub priority: Option<i64>,
    pub until_condition_enabled: Option<bool>,
    pub until_trigger: Option<Trigger>,
    pub until_condition: Option<Condition>,
    pub until_value: Option<f64>,
    pub min_interval: Option<f64>,
    pub check_ec_level: Option<bool>,
    pub max_ec_level: Option<f64>,
}

impl RuleDraft {
    /// Build a new rule. Trigger, condition, value, action and actuatorId
    /// are required.
    pub fn into_rule(self, now: OffsetDateTime) -> Result<Rule> {
        let mut missing = Vec::new();
        if self.trigger.is_none() {
            missing.push("trigger");
        }
        if self.condition.is_none() {
            missing.push("condition");
        }
        if self.value.is_none() {
            missing.push("value");
        }
        if self.action.as_deref().map_or(true, |s| s.trim().is_empty()) {
            missing.push("action");
        }
        if self.actuator_id.as_deref().map_or(true, |s| s.trim().is_empty()) {
            missing.push("actuatorId");
        }
        let (Some(trigger), Some(condition), Some(value), Some(action), Some(actuator_id), true) = (
            self.trigger,
            self.condition,
            self.value,
            self.action.clone(),
            self.actuator_id.clone(),
            missing.is_empty(),
        ) else {
            return Err(HubError::Validation(format!(
                "missing required fields: {}",
                missing.join(", ")
            )));
        };

        let mut rule = Rule {
            id: 0,
            name: format!("{} {} {}", trigger.label(), condition.symbol(), value),
            trigger,
            condition,
            value,
            action,
            actuator_id,
            solution_amount: 0.0,
            enabled: true,
            priority: DEFAULT_PRIORITY,
            last_triggered: None,
            currently_active: false,
            active_since: None,
            cooldown_until: None,
            until_condition_enabled: false,
            until_trigger: None,
            until_condition: None,
            until_value: None,
            min_interval: 0.0,
            check_ec_level: false,
            max_ec_level: DEFAULT_MAX_EC,
            created_at: now,
        };
        self.apply_to(&mut rule)?;
        Ok(rule)
    }

    /// Overlay the present fields onto `rule`, then validate the result.
    pub fn apply_to(&self, rule: &mut Rule) -> Result<()> {
        if let Some(n) = self.name.as_deref().map(str::trim).filter(|n| !n.is_empty()) {
            rule.name = n.to_string();
        }
        if let Some(t) = self.trigger {
            rule.trigger = t;
        }
        if let Some(c) = self.condition {
            rule.condition = c;
        }
        if let Some(v) = self.value {
            rule.value = v;
        }
        if let Some(a) = &self.action {
            rule.action = a.trim().to_string();
        }
        if let Some(id) = &self.actuator_id {
            rule.actuator_id = id.trim().to_string();
        }
        if let Some(s) = self.solution_amount {
            rule.solution_amount = s;
        }
        if let Some(e) = self.enabled {
            rule.enabled = e;
        }
        if let Some(p) = self.priority {
            rule.priority = p.clamp(1, 100) as u8;
        }
        if let Some(u) = self.until_condition_enabled {
            rule.until_condition_enabled = u;
        }
        if self.until_trigger.is_some() {
            rule.until_trigger = self.until_trigger;
        }
        if self.until_condition.is_some() {
            rule.until_condition = self.until_condition;
        }
        if self.until_value.is_some() {
            rule.until_value = self.until_value;
        }
        if let Some(m) = self.min_interval {
            rule.min_interval = m;
        }
        if let Some(c) = self.check_ec_level {
            rule.check_ec_level = c;
        }
        if let Some(m) = self.max_ec_level {
            rule.max_ec_level = m;
        }
        validate(rule)
    }
}

fn validate(rule: &Rule) -> Result<()> {
    let mut errors = Vec::new();
    if !rule.value.is_finite() {
        errors.push("value must be a number".to_string());
    }
    if rule.action.is_empty() {
        errors.push("action must not be empty".to_string());
    }
    if rule.actuator_id.is_empty() {
        errors.push("actuatorId must not be empty".to_string());
    }
    if !(rule.solution_amount >= 0.0) {
        errors.push(format!("solutionAmount must be >= 0, got {}", rule.solution_amount));
    }
    if !(rule.min_interval >= 0.0) {
        errors.push(format!("minInterval must be >= 0, got {}", rule.min_interval));
    }
    if !(rule.max_ec_level >= 0.0) {
        errors.push(format!("maxEcLevel must be >= 0, got {}", rule.max_ec_level));
    }
    if rule.until_condition_enabled
        && (rule.until_trigger.is_none()
            || rule.until_condition.is_none()
            || rule.until_value.is_none())
    {
        errors.push("until condition needs untilTrigger, untilCondition and untilValue".to_string());
    }
    if errors.is_empty() {
        Ok(())
    } else {
        Err(HubError::Validation(errors.join("; ")))
    }
}

pub fn parse_rule_id(raw: &str) -> Result<i64> {
    raw.trim()
        .parse::<i64>()
        .ok()
        .filter(|id| *id > 0)
        .ok_or_else(|| HubError::InvalidId(raw.to_string()))
}

// ---------------------------------------------------------------------------
// Evaluation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Activate,
    Deactivate,
    /// No transition this pass.
    Keep,
    /// Not evaluated this pass; an active rule keeps its actuator.
    Skip(&'static str),
}

/// Channel value for rule comparisons. `None` when absent; faults are
/// passed through so the caller can tell them apart.
fn channel_value(snapshot: &Snapshot, trigger: Trigger) -> Option<f64> {
    let v = snapshot.value(trigger.channel())?;
    if trigger == Trigger::Ec && !is_fault(v) {
        Some(normalize_ec(v))
    } else {
        Some(v)
    }
}

/// Decide what a rule should do given the latest snapshot.
pub fn evaluate(rule: &Rule, snapshot: &Snapshot, now: OffsetDateTime) -> Decision {
    if rule.cooldown_until.is_some_and(|t| t > now) {
        return Decision::Skip("cooldown");
    }
    if rule.is_release() && rule.min_interval > 0.0 {
        if let Some(last) = rule.last_triggered {
            if secs_between(last, now) / 60.0 < rule.min_interval {
                return Decision::Skip("minimum interval not reached");
            }
        }
    }

    let Some(reading) = channel_value(snapshot, rule.trigger) else {
        return Decision::Skip("no data");
    };
    if is_fault(reading) {
        return Decision::Skip("sensor fault");
    }
    let met = rule.condition.holds(reading, rule.value);

    if rule.currently_active {
        if !rule.until_condition_enabled {
            return if met { Decision::Keep } else { Decision::Deactivate };
        }
        let (Some(trigger), Some(condition), Some(threshold)) =
            (rule.until_trigger, rule.until_condition, rule.until_value)
        else {
            return Decision::Keep;
        };
        return match channel_value(snapshot, trigger) {
            Some(v) if !is_fault(v) && condition.holds(v, threshold) => Decision::Deactivate,
            _ => Decision::Keep,
        };
    }

    if !met {
        return Decision::Keep;
    }
    if rule.is_release() && rule.check_ec_level {
        match snapshot.ec() {
            Some(ec) if ec < rule.max_ec_level => {}
            Some(_) => return Decision::Skip("EC at or above limit"),
            None => return Decision::Skip("EC unavailable"),
        }
    }
    Decision::Activate
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

pub struct RuleEngine {
    arbiter: Arc<Arbiter>,
    shared: SharedState,
    /// One pass or management operation at a time.
    pass_lock: Mutex<()>,
}

/// Clear a rule's active flags. Used when its actuator finishes a timed
/// run on its own. Unknown ids are ignored.
pub async fn mark_inactive(db: &Db, rule_id: i64) -> Result<()> {
    let Some(mut rule) = db.get_rule(rule_id).await? else {
        debug!(rule_id, "rules: mark_inactive on unknown rule");
        return Ok(());
    };
    if rule.currently_active || rule.active_since.is_some() {
        rule.currently_active = false;
        rule.active_since = None;
        db.update_rule(&rule).await?;
        info!(rule_id, "rules: rule inactive after run completed");
    }
    Ok(())
}

impl RuleEngine {
    pub fn new(arbiter: Arc<Arbiter>, shared: SharedState) -> Self {
        Self {
            arbiter,
            shared,
            pass_lock: Mutex::new(()),
        }
    }

    fn db(&self) -> &Db {
        self.arbiter.db()
    }

    /// One evaluation pass over every enabled rule, highest priority first.
    pub async fn tick(&self, now: OffsetDateTime) -> Result<()> {
        let _pass = self.pass_lock.lock().await;

        let Some(snapshot) = state::latest_snapshot(&self.shared, self.db()).await? else {
            debug!("rules: no sensor readings yet, skipping pass");
            return Ok(());
        };
        let actuators: HashMap<String, Actuator> = self
            .db()
            .load_actuators()
            .await?
            .into_iter()
            .map(|a| (a.id.clone(), a))
            .collect();
        let mut rules = self.db().load_rules().await?;

        self.reconcile(&mut rules, &actuators).await;

        // actuator id -> owning rule id
        let mut owners: HashMap<String, i64> = actuators
            .values()
            .filter(|a| a.mode == Mode::Rule)
            .filter_map(|a| a.triggered_by_rule.map(|r| (a.id.clone(), r)))
            .collect();
        // Actuators already decided this pass by a higher-priority rule.
        let mut settled: HashSet<String> = HashSet::new();

        for i in 0..rules.len() {
            if !rules[i].enabled {
                continue;
            }
            let decision = evaluate(&rules[i], &snapshot, now);
            let target = rules[i].actuator_id.clone();
            match decision {
                Decision::Activate => {
                    let Some(actuator) = actuators.get(&target) else {
                        warn!(rule_id = rules[i].id, actuator = %target, "rules: target actuator missing");
                        continue;
                    };
                    if actuator.held_by_interlock() {
                        debug!(rule_id = rules[i].id, actuator = %target, "rules: actuator held by fertilizer interlock");
                        continue;
                    }
                    if settled.contains(&target) {
                        debug!(rule_id = rules[i].id, actuator = %target, "rules: actuator held by higher-priority rule");
                        continue;
                    }
                    if let Some(&other) = owners.get(&target) {
                        if other != rules[i].id {
                            match rules.iter().position(|r| r.id == other) {
                                Some(j) => self.deactivate(&mut rules[j]).await,
                                None => self.release_orphan(&target, other).await,
                            }
                            owners.remove(&target);
                        }
                    }
                    if self.activate(&mut rules[i], now).await {
                        owners.insert(target.clone(), rules[i].id);
                        settled.insert(target);
                    }
                }
                Decision::Deactivate => {
                    self.deactivate(&mut rules[i]).await;
                    if owners.get(&target) == Some(&rules[i].id) {
                        owners.remove(&target);
                    }
                }
                Decision::Keep | Decision::Skip(_) => {
                    if let Decision::Skip(reason) = decision {
                        debug!(rule_id = rules[i].id, reason, "rules: skipped");
                    }
                    if rules[i].currently_active {
                        settled.insert(target);
                    }
                }
            }
        }
        Ok(())
    }

    /// Clear active flags on rules whose actuator was taken away from them.
    async fn reconcile(&self, rules: &mut [Rule], actuators: &HashMap<String, Actuator>) {
        for rule in rules.iter_mut().filter(|r| r.currently_active) {
            let owns = actuators.get(&rule.actuator_id).is_some_and(|a| {
                a.mode == Mode::Rule && a.triggered_by_rule == Some(rule.id)
            });
            if owns {
                continue;
            }
            rule.currently_active = false;
            rule.active_since = None;
            match self.db().update_rule(rule).await {
                Ok(_) => info!(rule_id = rule.id, actuator = %rule.actuator_id, "rules: rule lost its actuator, marked inactive"),
                Err(e) => error!(rule_id = rule.id, "rules: reconcile failed: {e:#}"),
            }
        }
    }

    /// Returns whether the rule now owns its actuator.
    async fn activate(&self, rule: &mut Rule, now: OffsetDateTime) -> bool {
        let amount = rule.is_release().then_some(rule.solution_amount);
        let outcome = match self
            .arbiter
            .claim_for_rule(&rule.actuator_id, rule.id, rule.target_status(), amount)
            .await
        {
            Ok(o) => o,
            Err(e) => {
                error!(rule_id = rule.id, actuator = %rule.actuator_id, "rules: apply failed: {e}");
                return false;
            }
        };
        if outcome.is_vetoed() {
            info!(rule_id = rule.id, actuator = %rule.actuator_id, "rules: activation vetoed");
            return false;
        }

        rule.last_triggered = Some(now);
        rule.currently_active = true;
        rule.active_since = Some(now);
        if let Err(e) = self.db().update_rule(rule).await {
            error!(rule_id = rule.id, "rules: saving activation failed: {e:#}");
        }
        info!(
            rule_id = rule.id,
            rule = %rule.name,
            actuator = %rule.actuator_id,
            status = ?rule.target_status(),
            "rules: rule activated"
        );
        let mut st = self.shared.write().await;
        st.record_actuator(format!("rule '{}' took {}", rule.name, rule.actuator_id));
        true
    }

    /// Give the actuator back (if this rule still owns it) and clear the
    /// rule's active flags regardless.
    async fn deactivate(&self, rule: &mut Rule) {
        match self.arbiter.release_from_rule(&rule.actuator_id, rule.id).await {
            Ok(true) => {}
            Ok(false) => debug!(rule_id = rule.id, actuator = %rule.actuator_id, "rules: actuator no longer owned"),
            Err(e) if e.is_not_found() => {
                warn!(rule_id = rule.id, actuator = %rule.actuator_id, "rules: actuator missing on release")
            }
            Err(e) => error!(rule_id = rule.id, actuator = %rule.actuator_id, "rules: release failed: {e}"),
        }
        rule.currently_active = false;
        rule.active_since = None;
        if let Err(e) = self.db().update_rule(rule).await {
            error!(rule_id = rule.id, "rules: saving deactivation failed: {e:#}");
        }
        info!(rule_id = rule.id, rule = %rule.name, "rules: rule deactivated");
    }

    /// Owner id that is not among the loaded rules (deleted or disabled).
    async fn release_orphan(&self, actuator_id: &str, rule_id: i64) {
        if let Err(e) = self.arbiter.release_from_rule(actuator_id, rule_id).await {
            warn!(rule_id, actuator = %actuator_id, "rules: releasing orphaned owner failed: {e}");
        }
        if let Err(e) = mark_inactive(self.db(), rule_id).await {
            warn!(rule_id, "rules: {e}");
        }
    }

    // -----------------------------------------------------------------------
    // Management
    // -----------------------------------------------------------------------

    pub async fn list(&self) -> Result<Vec<Rule>> {
        Ok(self.db().load_rules().await?)
    }

    pub async fn get(&self, raw_id: &str) -> Result<Rule> {
        let id = parse_rule_id(raw_id)?;
        self.load(id).await
    }

    async fn load(&self, id: i64) -> Result<Rule> {
        self.db()
            .get_rule(id)
            .await?
            .ok_or(HubError::RuleNotFound(id))
    }

    pub async fn create(&self, draft: RuleDraft) -> Result<Rule> {
        let mut rule = draft.into_rule(clock::now())?;
        self.ensure_actuator(&rule.actuator_id).await?;
        let _pass = self.pass_lock.lock().await;
        rule.id = self.db().insert_rule(&rule).await?;
        info!(rule_id = rule.id, rule = %rule.name, actuator = %rule.actuator_id, "rules: rule created");
        Ok(rule)
    }

    pub async fn update(&self, raw_id: &str, draft: RuleDraft) -> Result<Rule> {
        let id = parse_rule_id(raw_id)?;
        let _pass = self.pass_lock.lock().await;
        let mut rule = self.load(id).await?;

        let mut next = rule.clone();
        draft.apply_to(&mut next)?;
        if next.actuator_id != rule.actuator_id {
            self.ensure_actuator(&next.actuator_id).await?;
            if rule.currently_active {
                info!(rule_id = id, from = %rule.actuator_id, to = %next.actuator_id, "rules: active rule moved to another actuator");
                self.deactivate(&mut rule).await;
                next.currently_active = false;
                next.active_since = None;
            }
        }
        if !self.db().update_rule(&next).await? {
            return Err(HubError::RuleNotFound(id));
        }
        Ok(next)
    }

    pub async fn delete(&self, raw_id: &str) -> Result<()> {
        let id = parse_rule_id(raw_id)?;
        let _pass = self.pass_lock.lock().await;
        let mut rule = self.load(id).await?;
        if rule.currently_active {
            self.deactivate(&mut rule).await;
        }
        if !self.db().delete_rule(id).await? {
            return Err(HubError::RuleNotFound(id));
        }
        info!(rule_id = id, "rules: rule deleted");
        Ok(())
    }

    /// Flip `enabled`; disabling an active rule releases its actuator.
    pub async fn toggle(&self, raw_id: &str) -> Result<Rule> {
        let id = parse_rule_id(raw_id)?;
        let _pass = self.pass_lock.lock().await;
        let mut rule = self.load(id).await?;
        rule.enabled = !rule.enabled;
        if !rule.enabled && rule.currently_active {
            self.deactivate(&mut rule).await;
        }
        self.db().update_rule(&rule).await?;
        info!(rule_id = id, enabled = rule.enabled, "rules: rule toggled");
        Ok(rule)
    }

    /// Run one pass now instead of waiting for the next tick.
    pub async fn check_now(&self) -> Result<()> {
        self.tick(clock::now()).await
    }

    async fn ensure_actuator(&self, id: &str) -> Result<()> {
        match self.arbiter.get(id).await {
            Ok(_) => Ok(()),
            Err(e) if e.is_not_found() => Err(HubError::Validation(format!("unknown actuator '{id}'"))),
            Err(e) => Err(e),
        }
    }
}

/// Periodic rule pass.  Intended to be `tokio::spawn`-ed from main.
pub async fn run(engine: Arc<RuleEngine>) {
    let mut ticker = tokio::time::interval(Duration::from_secs(TICK_INTERVAL_SEC));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    info!(tick_sec = TICK_INTERVAL_SEC, "rule engine started");

    loop {
        ticker.tick().await;
        if let Err(e) = engine.tick(clock::now()).await {
            error!("rules: pass failed: {e}");
            let mut st = engine.shared.write().await;
            st.record_error(format!("rule pass failed: {e}"));
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arbiter::tests::test_arbiter;
    use crate::arbiter::Holder;
    use crate::sensors::SENSOR_FAULT;
    use crate::state::SystemState;
    use time::macros::datetime;

    const T0: OffsetDateTime = datetime!(2024-06-03 12:00 UTC);

    fn draft(trigger: Trigger, cond: Condition, value: f64, action: &str, actuator: &str) -> RuleDraft {
        RuleDraft {
            trigger: Some(trigger),
            condition: Some(cond),
            value: Some(value),
            action: Some(action.into()),
            actuator_id: Some(actuator.into()),
            ..Default::default()
        }
    }

    fn rule(trigger: Trigger, cond: Condition, value: f64, action: &str) -> Rule {
        draft(trigger, cond, value, action, "fan").into_rule(T0).unwrap()
    }

    fn snap() -> Snapshot {
        Snapshot::new(T0, "node-a")
    }

    // -- Model --------------------------------------------------------------

    #[test]
    fn draft_requires_core_fields() {
        let err = RuleDraft {
            trigger: Some(Trigger::Ph),
            ..Default::default()
        }
        .into_rule(T0)
        .unwrap_err();
        let msg = err.to_string();
        assert!(err.is_validation());
        for field in ["condition", "value", "action", "actuatorId"] {
            assert!(msg.contains(field), "{msg}");
        }
        assert!(!msg.contains("trigger"), "{msg}");
    }

    #[test]
    fn draft_defaults() {
        let r = rule(Trigger::AirTemp, Condition::Gt, 28.0, "Turn On");
        assert_eq!(r.name, "Air Temperature > 28");
        assert_eq!(r.priority, DEFAULT_PRIORITY);
        assert_eq!(r.max_ec_level, DEFAULT_MAX_EC);
        assert!(r.enabled);
        assert!(!r.currently_active);
        assert_eq!(r.created_at, T0);
    }

    #[test]
    fn priority_is_clamped() {
        let mut d = draft(Trigger::Ph, Condition::Lt, 5.5, "Turn On", "fan");
        d.priority = Some(500);
        assert_eq!(d.clone().into_rule(T0).unwrap().priority, 100);
        d.priority = Some(-3);
        assert_eq!(d.into_rule(T0).unwrap().priority, 1);
    }

    #[test]
    fn until_condition_needs_all_parts() {
        let mut d = draft(Trigger::Ph, Condition::Lt, 5.5, "Turn On", "fan");
        d.until_condition_enabled = Some(true);
        d.until_trigger = Some(Trigger::Ph);
        assert!(d.into_rule(T0).unwrap_err().is_validation());
    }

    #[test]
    fn wire_names() {
        let r: RuleDraft = serde_json::from_str(
            r#"{"trigger":"pH Level","condition":"<","value":5.8,"action":"Turn On",
                "actuatorId":"ph-up-pump","untilTrigger":"waterTemp"}"#,
        )
        .unwrap();
        assert_eq!(r.trigger, Some(Trigger::Ph));
        assert_eq!(r.condition, Some(Condition::Lt));
        assert_eq!(r.until_trigger, Some(Trigger::WaterTemp));

        let json = serde_json::to_value(r.into_rule(T0).unwrap()).unwrap();
        assert_eq!(json["trigger"], "pH Level");
        assert_eq!(json["actuatorId"], "ph-up-pump");
        assert_eq!(json["maxEcLevel"], 3.0);
    }

    #[test]
    fn rule_ids_must_be_numeric() {
        assert_eq!(parse_rule_id("42").unwrap(), 42);
        assert!(matches!(parse_rule_id("abc"), Err(HubError::InvalidId(_))));
        assert!(matches!(parse_rule_id("0"), Err(HubError::InvalidId(_))));
    }

    #[test]
    fn action_text_mapping() {
        assert_eq!(rule(Trigger::Ph, Condition::Lt, 1.0, "Turn Off").target_status(), Status::Idle);
        let r = rule(Trigger::Ec, Condition::Lt, 1.0, "Release Fertilizer");
        assert!(r.is_release());
        assert_eq!(r.target_status(), Status::Active);
    }

    // -- evaluate -----------------------------------------------------------

    #[test]
    fn conditions() {
        assert!(Condition::Lt.holds(5.4, 5.5));
        assert!(!Condition::Lt.holds(5.5, 5.5));
        assert!(Condition::Gt.holds(30.1, 30.0));
        assert!(Condition::Eq.holds(6.05, 6.0));
        assert!(!Condition::Eq.holds(6.1, 6.0));
    }

    #[test]
    fn inactive_rule_activates_when_met() {
        let r = rule(Trigger::AirTemp, Condition::Gt, 28.0, "Turn On");
        assert_eq!(evaluate(&r, &snap().with(Channel::AirTemp, 29.0), T0), Decision::Activate);
        assert_eq!(evaluate(&r, &snap().with(Channel::AirTemp, 27.0), T0), Decision::Keep);
    }

    #[test]
    fn fault_and_missing_data_never_trigger() {
        let r = rule(Trigger::WaterTemp, Condition::Lt, 18.0, "Turn On");
        assert_eq!(
            evaluate(&r, &snap().with(Channel::WaterTemp, SENSOR_FAULT), T0),
            Decision::Skip("sensor fault")
        );
        assert_eq!(evaluate(&r, &snap(), T0), Decision::Skip("no data"));
    }

    #[test]
    fn active_rule_deactivates_when_condition_clears() {
        let mut r = rule(Trigger::AirTemp, Condition::Gt, 28.0, "Turn On");
        r.currently_active = true;
        assert_eq!(evaluate(&r, &snap().with(Channel::AirTemp, 29.0), T0), Decision::Keep);
        assert_eq!(evaluate(&r, &snap().with(Channel::AirTemp, 26.0), T0), Decision::Deactivate);
    }

    #[test]
    fn until_condition_holds_rule_active() {
        let mut r = rule(Trigger::Ph, Condition::Lt, 5.5, "Turn On");
        r.currently_active = true;
        r.until_condition_enabled = true;
        r.until_trigger = Some(Trigger::Ph);
        r.until_condition = Some(Condition::Gt);
        r.until_value = Some(6.0);

        // Trigger condition no longer met, but until not reached yet.
        assert_eq!(evaluate(&r, &snap().with(Channel::Ph, 5.8), T0), Decision::Keep);
        assert_eq!(evaluate(&r, &snap().with(Channel::Ph, 6.2), T0), Decision::Deactivate);
    }

    #[test]
    fn until_sensor_problems_keep_rule_active() {
        let mut r = rule(Trigger::AirTemp, Condition::Gt, 28.0, "Turn On");
        r.currently_active = true;
        r.until_condition_enabled = true;
        r.until_trigger = Some(Trigger::WaterTemp);
        r.until_condition = Some(Condition::Lt);
        r.until_value = Some(20.0);

        let s = snap().with(Channel::AirTemp, 25.0);
        assert_eq!(evaluate(&r, &s, T0), Decision::Keep);
        let s = s.with(Channel::WaterTemp, SENSOR_FAULT);
        assert_eq!(evaluate(&r, &s, T0), Decision::Keep);
        let s = snap().with(Channel::AirTemp, 25.0).with(Channel::WaterTemp, 19.0);
        assert_eq!(evaluate(&r, &s, T0), Decision::Deactivate);
    }

    #[test]
    fn cooldown_skips() {
        let mut r = rule(Trigger::AirTemp, Condition::Gt, 28.0, "Turn On");
        r.cooldown_until = Some(T0 + time::Duration::minutes(1));
        let s = snap().with(Channel::AirTemp, 30.0);
        assert_eq!(evaluate(&r, &s, T0), Decision::Skip("cooldown"));
        assert_eq!(evaluate(&r, &s, T0 + time::Duration::minutes(2)), Decision::Activate);
    }

    #[test]
    fn release_min_interval() {
        let mut r = rule(Trigger::Ec, Condition::Lt, 1.2, "Release Fertilizer");
        r.min_interval = 30.0;
        r.last_triggered = Some(T0 - time::Duration::minutes(10));
        let s = snap().with(Channel::Ec, 0.9);
        assert_eq!(evaluate(&r, &s, T0), Decision::Skip("minimum interval not reached"));
        assert_eq!(evaluate(&r, &s, T0 + time::Duration::minutes(21)), Decision::Activate);
    }

    #[test]
    fn release_ec_guard_uses_normalised_ec() {
        let mut r = rule(Trigger::Ph, Condition::Gt, 6.5, "Release Fertilizer");
        r.check_ec_level = true;
        r.max_ec_level = 2.0;

        let high = snap().with(Channel::Ph, 7.0).with(Channel::Ec, 2100.0);
        assert_eq!(evaluate(&r, &high, T0), Decision::Skip("EC at or above limit"));
        let ok = snap().with(Channel::Ph, 7.0).with(Channel::Ec, 1500.0);
        assert_eq!(evaluate(&r, &ok, T0), Decision::Activate);
        let missing = snap().with(Channel::Ph, 7.0);
        assert_eq!(evaluate(&r, &missing, T0), Decision::Skip("EC unavailable"));
    }

    #[test]
    fn ec_trigger_compares_in_millisiemens() {
        let r = rule(Trigger::Ec, Condition::Lt, 1.2, "Turn On");
        assert_eq!(evaluate(&r, &snap().with(Channel::Ec, 1000.0), T0), Decision::Activate);
        assert_eq!(evaluate(&r, &snap().with(Channel::Ec, 1400.0), T0), Decision::Keep);
    }

    // -- Engine -------------------------------------------------------------

    async fn engine() -> (RuleEngine, Arc<Arbiter>) {
        let arb = test_arbiter().await;
        (RuleEngine::new(Arc::clone(&arb), SystemState::shared()), arb)
    }

    async fn feed(engine: &RuleEngine, snapshot: Snapshot) {
        engine.shared.write().await.record_reading(snapshot);
    }

    #[tokio::test]
    async fn activation_and_release_through_arbiter() {
        let (engine, arb) = engine().await;
        let r = engine
            .create(draft(Trigger::AirTemp, Condition::Gt, 28.0, "Turn On", "fan"))
            .await
            .unwrap();

        feed(&engine, snap().with(Channel::AirTemp, 30.0)).await;
        engine.tick(clock::now()).await.unwrap();

        let fan = arb.get("fan").await.unwrap();
        assert_eq!(fan.mode, Mode::Rule);
        assert_eq!(fan.status, Status::Active);
        assert_eq!(fan.triggered_by_rule, Some(r.id));
        assert_eq!(fan.previous_mode, Some(Mode::Manual));
        let stored = engine.get(&r.id.to_string()).await.unwrap();
        assert!(stored.currently_active);
        assert!(stored.last_triggered.is_some() && stored.active_since.is_some());

        feed(&engine, snap().with(Channel::AirTemp, 24.0)).await;
        engine.tick(clock::now()).await.unwrap();

        let fan = arb.get("fan").await.unwrap();
        assert_eq!(fan.mode, Mode::Manual);
        assert_eq!(fan.status, Status::Idle);
        assert_eq!(fan.triggered_by_rule, None);
        assert!(!engine.get(&r.id.to_string()).await.unwrap().currently_active);
    }

    #[tokio::test]
    async fn higher_priority_rule_takes_over() {
        let (engine, arb) = engine().await;
        let mut low = draft(Trigger::AirTemp, Condition::Gt, 25.0, "Turn On", "fan");
        low.priority = Some(5);
        let low = engine.create(low).await.unwrap();

        feed(&engine, snap().with(Channel::AirTemp, 26.0)).await;
        engine.tick(clock::now()).await.unwrap();
        assert_eq!(arb.get("fan").await.unwrap().triggered_by_rule, Some(low.id));

        let mut high = draft(Trigger::Humidity, Condition::Gt, 80.0, "Turn Off", "fan");
        high.priority = Some(50);
        let high = engine.create(high).await.unwrap();

        feed(&engine, snap().with(Channel::AirTemp, 26.0).with(Channel::Humidity, 90.0)).await;
        engine.tick(clock::now()).await.unwrap();

        let fan = arb.get("fan").await.unwrap();
        assert_eq!(fan.triggered_by_rule, Some(high.id));
        assert_eq!(fan.status, Status::Idle);
        assert_eq!(fan.mode, Mode::Rule);
        assert_eq!(fan.previous_mode, Some(Mode::Manual));
        assert!(!engine.get(&low.id.to_string()).await.unwrap().currently_active);
        assert!(engine.get(&high.id.to_string()).await.unwrap().currently_active);

        // A second pass does not flip it back.
        engine.tick(clock::now()).await.unwrap();
        assert_eq!(arb.get("fan").await.unwrap().triggered_by_rule, Some(high.id));
    }

    #[tokio::test]
    async fn stale_active_flag_is_cleared() {
        let (engine, arb) = engine().await;
        let r = engine
            .create(draft(Trigger::AirTemp, Condition::Gt, 28.0, "Turn On", "fan"))
            .await
            .unwrap();
        feed(&engine, snap().with(Channel::AirTemp, 30.0)).await;
        engine.tick(clock::now()).await.unwrap();

        // Operator takes the fan back by hand.
        arb.set_settings(
            "fan",
            crate::actuator::SettingsPatch {
                mode: Some(Mode::Manual),
                triggered_by_rule: Some(None),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        feed(&engine, snap().with(Channel::AirTemp, 20.0)).await;
        engine.tick(clock::now()).await.unwrap();

        assert!(!engine.get(&r.id.to_string()).await.unwrap().currently_active);
    }

    #[tokio::test]
    async fn interlocked_actuators_are_left_alone() {
        let (engine, arb) = engine().await;
        engine
            .create(draft(Trigger::WaterLevel, Condition::Gt, 50.0, "Turn On", "irrigation-pump"))
            .await
            .unwrap();
        arb.acquire(Holder::AutoDosing).await.unwrap();

        feed(&engine, snap().with(Channel::WaterLevel, 80.0)).await;
        engine.tick(clock::now()).await.unwrap();

        let irr = arb.get("irrigation-pump").await.unwrap();
        assert_eq!(irr.status, Status::Idle);
        assert_eq!(irr.triggered_by_rule, None);
    }

    #[tokio::test]
    async fn release_rule_runs_measured_dose() {
        let (engine, arb) = engine().await;
        let mut d = draft(Trigger::Ec, Condition::Lt, 1.0, "Release Fertilizer", "fertilizer-pump-a");
        d.solution_amount = Some(0.5);
        engine.create(d).await.unwrap();

        feed(&engine, snap().with(Channel::Ec, 0.6)).await;
        engine.tick(clock::now()).await.unwrap();

        let pump = arb.get("fertilizer-pump-a").await.unwrap();
        assert!(pump.is_active());
        assert_eq!(pump.solution_amount, Some(0.5));
        // 0.5 mL at 1 mL/min.
        assert_eq!(pump.duration, 30.0);
    }

    #[tokio::test]
    async fn delete_and_disable_release_actuator() {
        let (engine, arb) = engine().await;
        let a = engine
            .create(draft(Trigger::AirTemp, Condition::Gt, 28.0, "Turn On", "fan"))
            .await
            .unwrap();
        let b = engine
            .create(draft(Trigger::AirTemp, Condition::Gt, 28.0, "Turn On", "chiller"))
            .await
            .unwrap();
        feed(&engine, snap().with(Channel::AirTemp, 30.0)).await;
        engine.tick(clock::now()).await.unwrap();
        assert!(arb.get("fan").await.unwrap().is_active());
        assert!(arb.get("chiller").await.unwrap().is_active());

        engine.delete(&a.id.to_string()).await.unwrap();
        assert_eq!(arb.get("fan").await.unwrap().mode, Mode::Manual);
        assert!(matches!(
            engine.get(&a.id.to_string()).await,
            Err(HubError::RuleNotFound(_))
        ));

        let toggled = engine.toggle(&b.id.to_string()).await.unwrap();
        assert!(!toggled.enabled && !toggled.currently_active);
        let chiller = arb.get("chiller").await.unwrap();
        assert_eq!(chiller.mode, Mode::Manual);
        assert!(!chiller.is_active());
    }

    #[tokio::test]
    async fn moving_active_rule_releases_old_actuator() {
        let (engine, arb) = engine().await;
        let r = engine
            .create(draft(Trigger::AirTemp, Condition::Gt, 28.0, "Turn On", "fan"))
            .await
            .unwrap();
        feed(&engine, snap().with(Channel::AirTemp, 30.0)).await;
        engine.tick(clock::now()).await.unwrap();

        let updated = engine
            .update(
                &r.id.to_string(),
                RuleDraft {
                    actuator_id: Some("chiller".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.actuator_id, "chiller");
        assert!(!updated.currently_active);
        assert_eq!(arb.get("fan").await.unwrap().mode, Mode::Manual);

        engine.tick(clock::now()).await.unwrap();
        assert_eq!(arb.get("chiller").await.unwrap().triggered_by_rule, Some(r.id));
    }

    #[tokio::test]
    async fn management_errors() {
        let (engine, _arb) = engine().await;
        assert!(engine
            .create(draft(Trigger::Ph, Condition::Lt, 5.0, "Turn On", "nope"))
            .await
            .unwrap_err()
            .is_validation());
        assert!(matches!(engine.get("x1").await, Err(HubError::InvalidId(_))));
        assert!(matches!(engine.toggle("77").await, Err(HubError::RuleNotFound(77))));
    }

    #[tokio::test]
    async fn mark_inactive_clears_flags() {
        let (engine, _arb) = engine().await;
        let r = engine
            .create(draft(Trigger::AirTemp, Condition::Gt, 28.0, "Turn On", "fan"))
            .await
            .unwrap();
        let mut stored = engine.get(&r.id.to_string()).await.unwrap();
        stored.currently_active = true;
        stored.active_since = Some(T0);
        engine.db().update_rule(&stored).await.unwrap();

        mark_inactive(engine.db(), r.id).await.unwrap();
        let stored = engine.get(&r.id.to_string()).await.unwrap();
        assert!(!stored.currently_active && stored.active_since.is_none());
        mark_inactive(engine.db(), 9999).await.unwrap();
    }
}
