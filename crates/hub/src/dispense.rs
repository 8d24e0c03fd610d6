//! Timed pump runs and the combined-dispense sequencer.
//!
//! ```text
//!   start ─▶ acquire interlock ─▶ for each item:
//!                                   activate pump for max(3s, mL / flow)
//!                                   poll 1/s, broadcast progress
//!                                   idle pump
//!                                   delay countdown (not after the last)
//!            ─▶ release interlock ─▶ completed | stopped | error
//! ```
//!
//! `stop` flips the cancel flag (observed within one poll), idles every
//! running fertilizer pump and drops the interlock hold.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{error, info, warn};

use crate::actuator::{Mode, Status, StatusUpdate, DEFAULT_FLOW_RATE};
use crate::arbiter::{Arbiter, Holder};
use crate::error::{HubError, Result};
use crate::events::Progress;
use crate::state::SharedState;

/// Shortest pump run, however small the dose.
pub const MIN_PUMP_RUN_SECS: f64 = 3.0;

/// Seconds to deliver `amount_ml` at `flow_ml_per_min`.
pub fn dispense_secs(amount_ml: f64, flow_ml_per_min: f64) -> f64 {
    let flow = if flow_ml_per_min > 0.0 {
        flow_ml_per_min
    } else {
        DEFAULT_FLOW_RATE
    };
    (amount_ml / (flow / 60.0)).max(MIN_PUMP_RUN_SECS)
}

// ---------------------------------------------------------------------------
// Requests and results
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DoseItem {
    #[serde(alias = "actuatorId")]
    pub id: String,
    /// mL.
    pub amount: f64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CombinedRequest {
    #[serde(default)]
    pub fertilizers: Vec<DoseItem>,
    /// Seconds between pumps.
    #[serde(default)]
    pub dispensing_delay: u64,
}

impl CombinedRequest {
    fn validate(&self) -> Result<()> {
        if self.fertilizers.is_empty() {
            return Err(HubError::validation("no fertilizers provided for dispensing"));
        }
        let mut errors = Vec::new();
        for (i, f) in self.fertilizers.iter().enumerate() {
            if f.id.trim().is_empty() {
                errors.push(format!("fertilizers[{i}]: id is required"));
            }
            if !(f.amount.is_finite() && f.amount > 0.0) {
                errors.push(format!("fertilizers[{i}]: amount must be positive, got {}", f.amount));
            }
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(HubError::Validation(errors.join("; ")))
        }
    }
}

/// One pump that actually ran.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Dispensed {
    pub id: String,
    pub name: String,
    pub amount: f64,
    pub nutrient_type: String,
    pub seconds: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RunEnd {
    Completed(Vec<Dispensed>),
    Stopped(Vec<Dispensed>),
}

// ---------------------------------------------------------------------------
// Pump runs
// ---------------------------------------------------------------------------

/// Shared pump-run loop: dispenses `items` in order, broadcasting progress
/// built on top of `base`. `second` is the length of one poll; tests shrink
/// it. Missing pumps are skipped.
pub(crate) async fn run_items(
    arbiter: &Arbiter,
    items: &[DoseItem],
    delay_secs: u64,
    cancel: &AtomicBool,
    second: Duration,
    base: &Progress,
) -> Result<RunEnd> {
    let total = items.len();
    let ids: Vec<String> = items.iter().map(|f| f.id.clone()).collect();
    let report = |f: &dyn Fn(&mut Progress)| {
        let mut p = base.clone();
        p.is_dispensing = Some(true);
        p.total_steps = Some(total);
        f(&mut p);
        arbiter.events().progress(p);
    };
    let mut done = Vec::new();

    report(&|p| {
        p.current_step = Some(0);
        p.dispensing_delay = Some(delay_secs);
        p.waiting_fertilizer_ids = Some(ids.clone());
    });

    for (i, item) in items.iter().enumerate() {
        if cancel.load(Ordering::SeqCst) {
            return Ok(RunEnd::Stopped(done));
        }
        let step = i + 1;
        let waiting = ids[step..].to_vec();

        let pump = match arbiter.get(&item.id).await {
            Ok(p) => p,
            Err(e) if e.is_not_found() => {
                warn!(actuator = %item.id, "dispense: pump not found, skipping");
                continue;
            }
            Err(e) => return Err(e),
        };
        let flow = pump.kind.flow_rate().unwrap_or(DEFAULT_FLOW_RATE);
        let secs = dispense_secs(item.amount, flow);

        report(&|p| {
            p.current_step = Some(step);
            p.current_fertilizer = Some(item.id.clone());
            p.remaining_time = Some(secs);
            p.dispensing_delay = Some(delay_secs);
            p.waiting_fertilizer_ids = Some(waiting.clone());
        });
        info!(
            actuator = %item.id,
            amount_ml = item.amount,
            flow_ml_min = flow,
            secs,
            "dispense: pump on"
        );
        arbiter
            .set_status(
                &item.id,
                StatusUpdate::to(Status::Active)
                    .with_mode(Mode::Manual)
                    .for_secs(secs),
            )
            .await?;

        let mut elapsed = 0.0;
        while elapsed < secs && !cancel.load(Ordering::SeqCst) {
            report(&|p| {
                p.current_step = Some(step);
                p.current_fertilizer = Some(item.id.clone());
                p.remaining_time = Some((secs - elapsed).max(0.0));
                p.progress = Some((elapsed / secs * 100.0).min(100.0));
                p.waiting_fertilizer_ids = Some(waiting.clone());
            });
            let slice = (secs - elapsed).min(1.0);
            tokio::time::sleep(second.mul_f64(slice)).await;
            elapsed += slice;
        }

        arbiter
            .set_status(&item.id, StatusUpdate::to(Status::Idle).with_mode(Mode::Manual))
            .await?;
        done.push(Dispensed {
            id: pump.id.clone(),
            name: pump.name.clone(),
            amount: item.amount,
            nutrient_type: match &pump.kind {
                crate::actuator::ActuatorKind::FertilizerPump { nutrient_type, .. } => {
                    nutrient_type.clone()
                }
                _ => "Fertilizer".to_string(),
            },
            seconds: elapsed,
        });

        if step < total && delay_secs > 0 && !cancel.load(Ordering::SeqCst) {
            for d in (1..=delay_secs).rev() {
                if cancel.load(Ordering::SeqCst) {
                    break;
                }
                report(&|p| {
                    p.current_step = Some(step);
                    p.in_delay = Some(true);
                    p.remaining_time = Some(d as f64);
                    p.delay_remaining = Some(d);
                    p.dispensing_delay = Some(delay_secs);
                    p.waiting_fertilizer_ids = Some(waiting.clone());
                });
                tokio::time::sleep(second).await;
            }
        }
    }

    if cancel.load(Ordering::SeqCst) {
        Ok(RunEnd::Stopped(done))
    } else {
        Ok(RunEnd::Completed(done))
    }
}

/// Idle whichever of `ids` are running, in parallel. Failures are logged.
/// Returns how many were stopped.
pub(crate) async fn idle_pumps(arbiter: &Arc<Arbiter>, ids: &[String]) -> usize {
    let running: Vec<String> = match arbiter.list().await {
        Ok(all) => all
            .into_iter()
            .filter(|a| a.status == Status::Active && ids.contains(&a.id))
            .map(|a| a.id)
            .collect(),
        Err(e) => {
            error!("dispense: cannot list pumps to stop: {e}");
            return 0;
        }
    };

    let mut set = JoinSet::new();
    for id in running {
        let arbiter = Arc::clone(arbiter);
        set.spawn(async move {
            let res = arbiter
                .set_status(&id, StatusUpdate::to(Status::Idle).with_mode(Mode::Manual))
                .await;
            (id, res)
        });
    }

    let mut stopped = 0;
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok((_, Ok(_))) => stopped += 1,
            Ok((id, Err(e))) => warn!(actuator = %id, "dispense: failed to stop pump: {e}"),
            Err(e) => error!("dispense: stop task failed: {e}"),
        }
    }
    stopped
}

// ---------------------------------------------------------------------------
// Sequencer
// ---------------------------------------------------------------------------

struct ActiveRun {
    run: u64,
    pumps: Vec<String>,
    cancel: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunStarted {
    pub run: u64,
    pub total_steps: usize,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StopSummary {
    pub was_running: bool,
    pub pumps_stopped: usize,
}

/// Manual combined-dispense runs, one at a time.
pub struct Sequencer {
    arbiter: Arc<Arbiter>,
    shared: SharedState,
    second: Duration,
    runs: AtomicU64,
    current: Mutex<Option<ActiveRun>>,
}

impl Sequencer {
    pub fn new(arbiter: Arc<Arbiter>, shared: SharedState) -> Self {
        Self::with_second(arbiter, shared, Duration::from_secs(1))
    }

    pub fn with_second(arbiter: Arc<Arbiter>, shared: SharedState, second: Duration) -> Self {
        Self {
            arbiter,
            shared,
            second,
            runs: AtomicU64::new(0),
            current: Mutex::new(None),
        }
    }

    pub async fn is_running(&self) -> bool {
        self.current
            .lock()
            .await
            .as_ref()
            .is_some_and(|r| !r.task.is_finished())
    }

    /// Start a run in the background. A run already in progress is
    /// stopped first. Refused with [`HubError::Busy`] while an auto-dosing
    /// phase is driving the pumps.
    pub async fn start(self: &Arc<Self>, req: CombinedRequest) -> Result<RunStarted> {
        req.validate()?;
        self.stop().await;

        let run = self.runs.fetch_add(1, Ordering::SeqCst) + 1;
        let guard = match self.arbiter.acquire_dispenser(Holder::Sequencer(run)).await {
            Ok(g) => g,
            Err(e) => {
                warn!(run, "dispense: run refused: {e}");
                return Err(e);
            }
        };
        let cancel = Arc::new(AtomicBool::new(false));
        let total_steps = req.fertilizers.len();
        let pumps: Vec<String> = req.fertilizers.iter().map(|f| f.id.clone()).collect();

        info!(run, steps = total_steps, delay_secs = req.dispensing_delay, "dispense: run started");
        {
            let mut st = self.shared.write().await;
            st.record_dosing(format!("combined dispense started ({total_steps} pumps)"));
        }

        let this = Arc::clone(self);
        let flag = Arc::clone(&cancel);
        let owned = pumps.clone();
        let task = tokio::spawn(async move {
            let res = run_items(
                &this.arbiter,
                &req.fertilizers,
                req.dispensing_delay,
                &flag,
                this.second,
                &Progress::default(),
            )
            .await;
            if res.is_err() {
                idle_pumps(&this.arbiter, &owned).await;
            }
            guard.release().await;
            this.finish(run, total_steps, res).await;
        });

        *self.current.lock().await = Some(ActiveRun {
            run,
            pumps,
            cancel,
            task,
        });
        Ok(RunStarted { run, total_steps })
    }

    async fn finish(&self, run: u64, total: usize, res: Result<RunEnd>) {
        let mut p = Progress {
            is_dispensing: Some(false),
            total_steps: Some(total),
            waiting_fertilizer_ids: Some(Vec::new()),
            ..Default::default()
        };
        let detail = match &res {
            Ok(RunEnd::Completed(done)) => {
                p.current_step = Some(total);
                p.completed = Some(true);
                info!(run, pumps = done.len(), "dispense: run complete");
                format!("combined dispense complete ({} pumps)", done.len())
            }
            Ok(RunEnd::Stopped(done)) => {
                p.current_step = Some(done.len());
                p.stopped = Some(true);
                info!(run, pumps = done.len(), "dispense: run stopped");
                "combined dispense stopped".to_string()
            }
            Err(e) => {
                p.error = Some(e.to_string());
                error!(run, "dispense: run failed: {e}");
                format!("combined dispense failed: {e}")
            }
        };
        self.arbiter.events().progress(p);

        let mut st = self.shared.write().await;
        if res.is_err() {
            st.record_error(detail);
        } else {
            st.record_dosing(detail);
        }
    }

    /// Stop the current run: cancel, idle the run's pumps, drop the
    /// interlock, then wait for the run to wind down.
    pub async fn stop(&self) -> StopSummary {
        let Some(active) = self.current.lock().await.take() else {
            return StopSummary {
                was_running: false,
                pumps_stopped: 0,
            };
        };
        let was_running = !active.task.is_finished();
        active.cancel.store(true, Ordering::SeqCst);

        let pumps_stopped = if was_running {
            idle_pumps(&self.arbiter, &active.pumps).await
        } else {
            0
        };
        self.arbiter.release(Holder::Sequencer(active.run)).await;
        if let Err(e) = active.task.await {
            error!(run = active.run, "dispense: run task ended abnormally: {e}");
        }
        if was_running {
            info!(run = active.run, pumps_stopped, "dispense: stop requested");
        }
        StopSummary {
            was_running,
            pumps_stopped,
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
