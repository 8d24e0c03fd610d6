//! Interval scheduler for auto-mode actuators, plus the countdown ticker
//! that rebroadcasts live timers and finishes non-scheduled timed runs.
//!
//! ## Per-actuator schedule cycle
//!
//! ```text
//!                 now >= nextScheduledRun && weekday in activeDays
//!   Idle ────────────────────────────────────────────────────────▶ Active
//!    ▲  │                                                            │
//!    │  └─[irrigation pump, interlock held]─▶ nextScheduledRun += 1m │
//!    │                                                               │
//!    └──── elapsed >= duration: nextScheduledRun = end + k·interval ─┘
//! ```
//!
//! Every decision is re-checked inside the arbiter's write lock, so a
//! manual command racing a tick wins or loses cleanly.

use std::sync::Arc;
use std::time::Duration;

use time::OffsetDateTime;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

use crate::actuator::{Actuator, Status, StatusUpdate};
use crate::arbiter::Arbiter;
use crate::clock::{self, secs, secs_between};
use crate::error::Result;
use crate::events::Hints;
use crate::rules;
use crate::state::SharedState;

/// How often both passes run.
const TICK_INTERVAL_SEC: u64 = 1;

/// How far a blocked irrigation run is pushed back.
const DEFER_SECS: i64 = 60;

const MSG_DELAYED: &str = "Activation delayed - fertilizer in use";

/// Next run strictly after `now`: one interval past `last_run`, advanced
/// by whole intervals over any missed slots. No `last_run` counts from
/// `now`. A zero interval never runs.
pub fn next_run(
    last_run: Option<OffsetDateTime>,
    interval_secs: u64,
    now: OffsetDateTime,
) -> Option<OffsetDateTime> {
    if interval_secs == 0 {
        return None;
    }
    let step = interval_secs as f64;
    let Some(last) = last_run else {
        return Some(now + secs(step));
    };
    let mut next = last + secs(step);
    if next <= now {
        let behind = secs_between(next, now);
        let skips = (behind / step).floor() + 1.0;
        next += secs(skips * step);
    }
    Some(next)
}

pub struct Scheduler {
    arbiter: Arc<Arbiter>,
    shared: SharedState,
    utc_offset_minutes: i32,
}

impl Scheduler {
    pub fn new(arbiter: Arc<Arbiter>, shared: SharedState, utc_offset_minutes: i32) -> Self {
        Self {
            arbiter,
            shared,
            utc_offset_minutes,
        }
    }

    // -----------------------------------------------------------------------
    // Schedule passes
    // -----------------------------------------------------------------------

    /// One scheduler tick: interval recalculation, run completion, then
    /// activation, for every schedule-driven actuator.
    pub async fn tick(&self, now: OffsetDateTime) -> Result<()> {
        let actuators = self.arbiter.db().load_actuators().await?;
        let weekday = clock::weekday_name(now, self.utc_offset_minutes);

        for a in actuators.iter().filter(|a| a.is_scheduled()) {
            let res = if a.schedule.interval_updated {
                self.recalculate(a, now).await
            } else {
                match a.status {
                    Status::Active => self.complete_if_due(a, now).await,
                    Status::Idle if a.schedule.runs_on(weekday) => {
                        self.activate_if_due(a, now).await
                    }
                    _ => Ok(()),
                }
            };
            if let Err(e) = res {
                error!(actuator = %a.id, "scheduler: {e}");
            }
        }
        Ok(())
    }

    async fn recalculate(&self, a: &Actuator, now: OffsetDateTime) -> Result<()> {
        let next = next_run(None, a.schedule.interval.total_secs(), now);
        self.arbiter
            .update(&a.id, |x| {
                x.schedule.next_scheduled_run = next;
                x.schedule.interval_updated = false;
                Hints::default()
            })
            .await?;
        info!(actuator = %a.id, next = ?next, "scheduler: interval changed, rescheduled");
        Ok(())
    }

    async fn complete_if_due(&self, a: &Actuator, now: OffsetDateTime) -> Result<()> {
        if !a.run_finished(now) {
            return Ok(());
        }
        let interval = a.schedule.interval.total_secs();
        let done = self
            .arbiter
            .update_if(&a.id, |x| {
                if !(x.is_scheduled() && x.run_finished(now)) {
                    return None;
                }
                let ended = x.run_end().unwrap_or(now);
                x.apply_status(&StatusUpdate::to(Status::Idle), now);
                x.schedule.next_scheduled_run = next_run(Some(ended), interval, now);
                Some(Hints::default())
            })
            .await?;

        if let Some(x) = done {
            info!(
                actuator = %x.id,
                next = ?x.schedule.next_scheduled_run,
                "scheduler: run complete"
            );
            let mut st = self.shared.write().await;
            st.record_actuator(format!("{}: scheduled run complete", x.id));
        }
        Ok(())
    }

    async fn activate_if_due(&self, a: &Actuator, now: OffsetDateTime) -> Result<()> {
        let duration = a.schedule.duration.total_secs();
        if duration == 0 {
            debug!(actuator = %a.id, "scheduler: zero duration, nothing to run");
            return Ok(());
        }

        let due_at = match a.schedule.next_scheduled_run {
            Some(t) => t,
            None => {
                let Some(t) = next_run(a.last_run, a.schedule.interval.total_secs(), now) else {
                    return Ok(());
                };
                self.arbiter
                    .update(&a.id, |x| {
                        x.schedule.next_scheduled_run = Some(t);
                        Hints::default()
                    })
                    .await?;
                t
            }
        };
        if now < due_at {
            return Ok(());
        }

        if a.id == self.arbiter.irrigation_pump_id() && self.arbiter.interlock_held().await {
            let later = now + time::Duration::seconds(DEFER_SECS);
            self.arbiter
                .update(&a.id, |x| {
                    x.schedule.next_scheduled_run = Some(later);
                    Hints::prevented(MSG_DELAYED)
                })
                .await?;
            info!(actuator = %a.id, "scheduler: activation deferred, fertilizer in use");
            let mut st = self.shared.write().await;
            st.record_actuator(format!("{}: scheduled run delayed (fertilizer in use)", a.id));
            return Ok(());
        }

        let update = StatusUpdate {
            start_time: Some(now),
            ..StatusUpdate::to(Status::Active).for_secs(duration as f64)
        };
        let outcome = self.arbiter.set_status(&a.id, update).await?;
        if !outcome.is_vetoed() {
            info!(actuator = %a.id, duration_secs = duration, "scheduler: run started");
            let mut st = self.shared.write().await;
            st.record_actuator(format!("{}: scheduled run started ({duration}s)", a.id));
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Countdown pass
    // -----------------------------------------------------------------------

    /// Rebroadcast live timers and finish timed runs that no schedule owns.
    pub async fn countdown_tick(&self, now: OffsetDateTime) -> Result<()> {
        let actuators = self.arbiter.db().load_actuators().await?;
        for a in actuators {
            if a.kind.is_circulation() {
                continue;
            }
            match a.status {
                Status::Active if a.run_finished(now) && !a.is_scheduled() => {
                    if let Err(e) = self.finish_timed_run(&a, now).await {
                        error!(actuator = %a.id, "scheduler: finishing run failed: {e}");
                    }
                }
                Status::Active if a.duration > 0.0 => {
                    self.broadcast_remaining(a.clone(), a.live_remaining(now));
                }
                Status::Paused => {
                    let r = a.remaining_time;
                    self.broadcast_remaining(a, r);
                }
                Status::Idle if a.is_scheduled() => {
                    if let Some(next) = a.schedule.next_scheduled_run {
                        self.broadcast_remaining(a, secs_between(now, next).max(0.0).round());
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }

    fn broadcast_remaining(&self, mut a: Actuator, remaining: f64) {
        a.remaining_time = remaining;
        self.arbiter.events().actuator(&a, Hints::default());
    }

    async fn finish_timed_run(&self, a: &Actuator, now: OffsetDateTime) -> Result<()> {
        let mut owner = None;
        let done = self
            .arbiter
            .update_if(&a.id, |x| {
                if !x.run_finished(now) || x.is_scheduled() {
                    return None;
                }
                owner = x.triggered_by_rule;
                x.apply_status(&StatusUpdate::to(Status::Idle), now);
                x.restore_mode();
                Some(Hints::default())
            })
            .await?;

        if done.is_none() {
            return Ok(());
        }
        info!(actuator = %a.id, "scheduler: timed run finished");
        if let Some(rule_id) = owner {
            if let Err(e) = rules::mark_inactive(self.arbiter.db(), rule_id).await {
                error!(actuator = %a.id, rule_id, "scheduler: releasing rule failed: {e:#}");
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Entry points
// ---------------------------------------------------------------------------

/// Run the schedule passes.  Intended to be `tokio::spawn`-ed from main.
pub async fn run(scheduler: Arc<Scheduler>) {
    let mut ticker = tokio::time::interval(Duration::from_secs(TICK_INTERVAL_SEC));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    info!(tick_sec = TICK_INTERVAL_SEC, "scheduler started");
    {
        let mut st = scheduler.shared.write().await;
        st.record_system("scheduler started".to_string());
    }

    loop {
        ticker.tick().await;
        if let Err(e) = scheduler.tick(clock::now()).await {
            error!("scheduler: tick failed: {e}");
        }
    }
}

/// Run the countdown rebroadcast.  Intended to be `tokio::spawn`-ed from main.
pub async fn run_countdown(scheduler: Arc<Scheduler>) {
    let mut ticker = tokio::time::interval(Duration::from_secs(TICK_INTERVAL_SEC));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        ticker.tick().await;
        if let Err(e) = scheduler.countdown_tick(clock::now()).await {
            error!("scheduler: countdown failed: {e}");
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actuator::{Hms, Mode, SchedulePatch, SettingsPatch};
    use crate::arbiter::tests::test_arbiter;
    use crate::arbiter::Holder;
    use crate::events::Event;
    use crate::rules::{Condition, RuleDraft, Trigger};
    use crate::state::SystemState;
    use time::macros::datetime;

    const T0: OffsetDateTime = datetime!(2024-06-03 12:00 UTC);

    // -- next_run -----------------------------------------------------------

    #[test]
    fn next_run_without_history_counts_from_now() {
        assert_eq!(
            next_run(None, 600, T0),
            Some(T0 + time::Duration::minutes(10))
        );
    }

    #[test]
    fn next_run_zero_interval_never() {
        assert_eq!(next_run(Some(T0), 0, T0), None);
    }

    #[test]
    fn next_run_future_slot_kept() {
        let last = T0 - time::Duration::minutes(3);
        assert_eq!(
            next_run(Some(last), 600, T0),
            Some(T0 + time::Duration::minutes(7))
        );
    }

    #[test]
    fn next_run_skips_missed_slots() {
        // Down for 95 minutes with a 30 minute interval.
        let last = T0 - time::Duration::minutes(95);
        let next = next_run(Some(last), 1800, T0).unwrap();
        assert_eq!(next, T0 + time::Duration::minutes(25));
        assert!(next > T0);
    }

    #[test]
    fn next_run_exact_boundary_moves_past_now() {
        let last = T0 - time::Duration::minutes(30);
        assert_eq!(
            next_run(Some(last), 1800, T0),
            Some(T0 + time::Duration::minutes(30))
        );
    }

    // -- Helpers ------------------------------------------------------------

    async fn scheduled(arb: &Arbiter, id: &str, now: OffsetDateTime) {
        let patch = SettingsPatch {
            mode: Some(Mode::Auto),
            schedule: Some(SchedulePatch {
                enabled: Some(true),
                active_days: Some(vec![clock::weekday_name(now, 0).to_string()]),
                interval: Some(Hms {
                    hours: 0,
                    minutes: 30,
                    seconds: 0,
                }),
                duration: Some(Hms {
                    hours: 0,
                    minutes: 5,
                    seconds: 0,
                }),
            }),
            ..Default::default()
        };
        arb.set_settings(id, patch).await.unwrap();
        // Make it due immediately.
        arb.update(id, |a| {
            a.schedule.interval_updated = false;
            a.schedule.next_scheduled_run = Some(now - time::Duration::seconds(1));
            Hints::default()
        })
        .await
        .unwrap();
    }

    fn scheduler(arb: &Arc<Arbiter>) -> Scheduler {
        Scheduler::new(Arc::clone(arb), SystemState::shared(), 0)
    }

    // -- Schedule passes ----------------------------------------------------

    #[tokio::test]
    async fn due_actuator_runs_then_completes_in_auto() {
        let arb = test_arbiter().await;
        let now = clock::now();
        scheduled(&arb, "fan", now).await;
        let s = scheduler(&arb);

        s.tick(now).await.unwrap();
        let fan = arb.get("fan").await.unwrap();
        assert!(fan.is_active());
        assert_eq!(fan.duration, 300.0);
        assert_eq!(fan.start_time, Some(now));

        // Not yet finished.
        s.tick(now + time::Duration::seconds(299)).await.unwrap();
        assert!(arb.get("fan").await.unwrap().is_active());

        let later = now + time::Duration::seconds(301);
        s.tick(later).await.unwrap();
        let fan = arb.get("fan").await.unwrap();
        assert_eq!(fan.status, Status::Idle);
        assert_eq!(fan.mode, Mode::Auto);
        assert!(fan.schedule.enabled);
        // Run ended at now+300s, next slot one interval later.
        assert_eq!(
            fan.schedule.next_scheduled_run,
            Some(now + time::Duration::seconds(300 + 1800))
        );
    }

    #[tokio::test]
    async fn other_weekday_does_not_run() {
        let arb = test_arbiter().await;
        let now = clock::now();
        scheduled(&arb, "fan", now).await;
        let tomorrow = clock::weekday_name(now + time::Duration::days(1), 0);
        arb.set_settings(
            "fan",
            SettingsPatch {
                schedule: Some(SchedulePatch {
                    active_days: Some(vec![tomorrow.to_string()]),
                    ..Default::default()
                }),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        scheduler(&arb).tick(now).await.unwrap();
        assert!(!arb.get("fan").await.unwrap().is_active());
    }

    #[tokio::test]
    async fn manual_actuators_are_ignored() {
        let arb = test_arbiter().await;
        let now = clock::now();
        scheduler(&arb).tick(now).await.unwrap();
        for a in arb.list().await.unwrap() {
            assert_eq!(a.status, Status::Idle, "{} should stay idle", a.id);
        }
    }

    #[tokio::test]
    async fn interval_flag_forces_recalculation() {
        let arb = test_arbiter().await;
        let now = clock::now();
        scheduled(&arb, "fan", now).await;
        arb.update("fan", |a| {
            a.schedule.interval_updated = true;
            Hints::default()
        })
        .await
        .unwrap();

        scheduler(&arb).tick(now).await.unwrap();
        let fan = arb.get("fan").await.unwrap();
        assert!(!fan.is_active());
        assert!(!fan.schedule.interval_updated);
        assert_eq!(
            fan.schedule.next_scheduled_run,
            Some(now + time::Duration::minutes(30))
        );
    }

    #[tokio::test]
    async fn irrigation_deferred_while_interlock_held() {
        let arb = test_arbiter().await;
        let now = clock::now();
        arb.acquire(Holder::Sequencer(1)).await.unwrap();
        // Operator switches the pump back to its schedule mid-dispense.
        scheduled(&arb, "irrigation-pump", now).await;
        let mut rx = arb.events().subscribe();

        scheduler(&arb).tick(now).await.unwrap();

        let irr = arb.get("irrigation-pump").await.unwrap();
        assert_eq!(irr.status, Status::Idle);
        assert_eq!(
            irr.schedule.next_scheduled_run,
            Some(now + time::Duration::seconds(DEFER_SECS))
        );
        match rx.recv().await.unwrap() {
            Event::ActuatorUpdate(u) => {
                assert!(u.hints.prevented_activation);
                assert_eq!(u.hints.override_message.as_deref(), Some(MSG_DELAYED));
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    // -- Countdown ----------------------------------------------------------

    #[tokio::test]
    async fn countdown_broadcasts_live_remaining() {
        let arb = test_arbiter().await;
        let now = clock::now();
        arb.set_status(
            "chiller",
            StatusUpdate {
                start_time: Some(now),
                ..StatusUpdate::to(Status::Active).for_secs(120.0)
            },
        )
        .await
        .unwrap();
        let mut rx = arb.events().subscribe();

        scheduler(&arb)
            .countdown_tick(now + time::Duration::seconds(20))
            .await
            .unwrap();

        match rx.recv().await.unwrap() {
            Event::ActuatorUpdate(u) => {
                assert_eq!(u.actuator.id, "chiller");
                assert_eq!(u.actuator.remaining_time, 100.0);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn countdown_finishes_rule_run_and_releases_rule() {
        let arb = test_arbiter().await;
        let db = arb.db().clone();
        let rule = RuleDraft {
            trigger: Some(Trigger::Ec),
            condition: Some(Condition::Lt),
            value: Some(1.0),
            action: Some("Release Fertilizer".into()),
            actuator_id: Some("fertilizer-pump-a".into()),
            ..Default::default()
        }
        .into_rule(clock::now())
        .unwrap();
        let rule_id = db.insert_rule(&rule).await.unwrap();
        let mut stored = db.get_rule(rule_id).await.unwrap().unwrap();
        stored.currently_active = true;
        stored.active_since = Some(clock::now());
        db.update_rule(&stored).await.unwrap();

        let now = clock::now();
        arb.claim_for_rule("fertilizer-pump-a", rule_id, Status::Active, Some(1.0))
            .await
            .unwrap();
        let pump = arb.get("fertilizer-pump-a").await.unwrap();
        assert!(pump.duration > 0.0);

        scheduler(&arb)
            .countdown_tick(now + time::Duration::seconds(pump.duration as i64 + 5))
            .await
            .unwrap();

        let pump = arb.get("fertilizer-pump-a").await.unwrap();
        assert_eq!(pump.status, Status::Idle);
        assert_eq!(pump.mode, Mode::Manual);
        assert_eq!(pump.triggered_by_rule, None);
        assert!(!pump.override_mode);

        let r = db.get_rule(rule_id).await.unwrap().unwrap();
        assert!(!r.currently_active);
        assert!(r.active_since.is_none());
    }

    #[tokio::test]
    async fn countdown_leaves_scheduled_runs_to_scheduler() {
        let arb = test_arbiter().await;
        let now = clock::now();
        scheduled(&arb, "fan", now).await;
        let s = scheduler(&arb);
        s.tick(now).await.unwrap();

        s.countdown_tick(now + time::Duration::seconds(400))
            .await
            .unwrap();
        // Still active: completion belongs to the schedule pass.
        assert!(arb.get("fan").await.unwrap().is_active());
    }
}
