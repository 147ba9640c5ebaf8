//! Scripted passes through both gates
//!
//! A pass puts an object in front of the first gate, waits for the stop
//! lamp, moves it away, then presents it to the second gate a chosen time
//! after the timer started counting.

use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use gate_core::{TimingRecord, Timestamp};
use gate_runtime::{ControllerState, TimerState};

use crate::GateRig;

/// Distance that counts as an arrival at either gate (trigger is half the reference)
pub const OBJECT_PRESENT_CM: f64 = 40.0;

/// Distance beyond the departure threshold of a 100 cm gate
pub const OBJECT_LEFT_CM: f64 = 60.0;

/// Distance the second gate sees when the object arrives
pub const OBJECT_ARRIVED_CM: f64 = 45.0;

const PHASE_LIMIT: Duration = Duration::from_secs(10);

// ============================================================================
// Pass report
// ============================================================================

/// What happened during one pass, in rig time
#[derive(Clone, Debug, Default)]
pub struct PassReport {
    /// Controller saw the object arrive
    pub detected_at: Option<Timestamp>,
    /// Caution lamp came on
    pub caution_at: Option<Timestamp>,
    /// Stop lamp came on
    pub stop_at: Option<Timestamp>,
    /// `START_TIMER` was sent
    pub start_sent_at: Option<Timestamp>,
    /// Timer began counting
    pub timer_started_at: Option<Timestamp>,
    /// Controller logged the result
    pub record: Option<TimingRecord>,
}

impl PassReport {
    pub fn elapsed_ms(&self) -> Option<u64> {
        self.record.as_ref().map(|r| r.elapsed_ms)
    }

    pub fn completed(&self) -> bool {
        self.record.is_some()
    }
}

// ============================================================================
// Scenario steps
// ============================================================================

/// Hold an object at the first gate until the stop lamp, recording each phase
///
/// Returns false if the controller never reached `StopPendingDeparture`.
pub async fn approach_first_gate(rig: &mut GateRig, report: &mut PassReport) -> bool {
    rig.first_gate.set(OBJECT_PRESENT_CM);

    let end = rig.now().saturating_add(PHASE_LIMIT);
    while rig.now() < end {
        rig.step().await;
        let controller = rig.controller().controller();
        if report.detected_at.is_none() {
            report.detected_at = controller.cycle().map(|c| c.object_detected_at);
        }
        match controller.state() {
            ControllerState::CautionActive { since } => {
                report.caution_at.get_or_insert(since);
            }
            ControllerState::StopPendingDeparture => {
                report.stop_at = Some(rig.now());
                return true;
            }
            ControllerState::Fault { .. } => return false,
            _ => {}
        }
    }
    false
}

/// Move the object past the first gate and wait for the timer to start
pub async fn leave_first_gate(rig: &mut GateRig, report: &mut PassReport) -> bool {
    rig.first_gate.set(OBJECT_LEFT_CM);

    let end = rig.now().saturating_add(PHASE_LIMIT);
    while rig.now() < end {
        rig.step().await;
        if report.start_sent_at.is_none() {
            report.start_sent_at = rig
                .controller()
                .controller()
                .cycle()
                .and_then(|c| c.start_sent_at);
        }
        if rig.controller().controller().state().is_fault() {
            rig.clear_first_gate();
            return false;
        }
        if let TimerState::Timing { started_at } = rig.timer().timer().state() {
            report.timer_started_at = Some(started_at);
            rig.clear_first_gate();
            return true;
        }
    }
    rig.clear_first_gate();
    false
}

/// Present the object to the second gate `transit` after the timer started
///
/// The clock jumps straight to the arrival instant, so the reported time
/// is exact rather than rounded to the tick period.
pub async fn reach_second_gate(rig: &mut GateRig, transit: Duration, report: &mut PassReport) -> bool {
    let Some(started_at) = report.timer_started_at else {
        return false;
    };
    let arrival = started_at.saturating_add(transit);
    let before = rig.log.records().len();

    rig.second_gate.set(OBJECT_ARRIVED_CM);
    rig.advance(arrival.since(rig.now())).await;
    let recorded = rig
        .run_until(PHASE_LIMIT, |rig| rig.log.records().len() > before)
        .await;
    rig.clear_second_gate();
    if recorded {
        report.record = rig.log.records().last().cloned();
    }
    recorded
}

/// Run a complete pass with the given transit time
pub async fn run_pass(rig: &mut GateRig, transit: Duration) -> PassReport {
    let mut report = PassReport::default();
    if !approach_first_gate(rig, &mut report).await {
        return report;
    }
    if !leave_first_gate(rig, &mut report).await {
        return report;
    }
    reach_second_gate(rig, transit, &mut report).await;
    report
}

/// Wait until both nodes are ready for another pass
pub async fn settle(rig: &mut GateRig) -> bool {
    rig.run_until(PHASE_LIMIT, |rig| rig.is_ready()).await
}

/// Run `count` passes with transit times drawn from `range` (milliseconds)
///
/// Returns the planned and reported times in pass order.
pub async fn run_random_passes(
    rig: &mut GateRig,
    count: usize,
    range: std::ops::Range<u64>,
    seed: u64,
) -> Vec<(u64, Option<u64>)> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut results = Vec::with_capacity(count);
    for _ in 0..count {
        let planned = rng.gen_range(range.clone());
        let report = run_pass(rig, Duration::from_millis(planned)).await;
        results.push((planned, report.elapsed_ms()));
        settle(rig).await;
    }
    results
}
