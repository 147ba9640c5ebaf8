//! Controller node state machine
//!
//! Sequences the three-lamp signal around an object passing the first gate
//! and opens at most one timing cycle at a time. The machine is pure: every
//! tick the driver hands it one [`ControllerInput`] and performs the
//! returned [`ControllerAction`]s.

use std::fmt;

use gate_core::{
    CalibratedGate, ControllerConfig, GateError, GateResult, Lamps, LinkStatus, Timestamp,
    TimingRecord,
};
use gate_transport::LinkEvent;
use gate_wire::Message;

/// Why the controller is in `Fault`
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FaultReason {
    /// Too many consecutive invalid readings
    Sensor,
    /// The timer never reported a result
    TimingTimeout,
    /// Departure detected with no timer connected
    NoPeerForStart,
    /// No usable reference distance
    Calibration,
}

impl fmt::Display for FaultReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FaultReason::Sensor => write!(f, "sensor"),
            FaultReason::TimingTimeout => write!(f, "timing timeout"),
            FaultReason::NoPeerForStart => write!(f, "no peer for start"),
            FaultReason::Calibration => write!(f, "calibration"),
        }
    }
}

/// Controller phases
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ControllerState {
    /// Gate clear, signal green
    Idle,
    /// Object arrived, signal dark
    ArrivalPendingCaution,
    CautionActive { since: Timestamp },
    /// Signal red, waiting for the object to leave
    StopPendingDeparture,
    /// Start sent, waiting for the timer's result
    TimingActive,
    /// Result received, holding before the next cycle
    Cooldown { since: Timestamp },
    Fault {
        reason: FaultReason,
        /// When the fault was entered; drives the blink pattern
        entered: Timestamp,
        /// Start of the current backoff before recalibration
        retry_from: Timestamp,
        recalibration_requested: bool,
    },
}

impl ControllerState {
    pub fn is_fault(&self) -> bool {
        matches!(self, ControllerState::Fault { .. })
    }

    pub fn name(&self) -> &'static str {
        match self {
            ControllerState::Idle => "Idle",
            ControllerState::ArrivalPendingCaution => "ArrivalPendingCaution",
            ControllerState::CautionActive { .. } => "CautionActive",
            ControllerState::StopPendingDeparture => "StopPendingDeparture",
            ControllerState::TimingActive => "TimingActive",
            ControllerState::Cooldown { .. } => "Cooldown",
            ControllerState::Fault { .. } => "Fault",
        }
    }
}

impl fmt::Display for ControllerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ControllerState::Fault { reason, .. } => write!(f, "Fault({})", reason),
            other => write!(f, "{}", other.name()),
        }
    }
}

/// The one open timing cycle
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TimingCycle {
    pub object_detected_at: Timestamp,
    pub start_sent_at: Option<Timestamp>,
    pub elapsed_ms: Option<u64>,
}

/// Everything the controller observes in one tick
#[derive(Clone, Debug)]
pub struct ControllerInput {
    pub now: Timestamp,
    /// Filtered distance; `None` when the filter found no reliable reading
    pub reading: Option<f64>,
    pub link_event: Option<LinkEvent>,
    pub peer_connected: bool,
    /// Application messages received since the previous tick
    pub messages: Vec<Message>,
    /// Outcome of a recalibration requested on an earlier tick
    pub calibration: Option<GateResult<CalibratedGate>>,
}

impl ControllerInput {
    /// Input carrying only the time and a reading
    pub fn at(now: Timestamp, reading: Option<f64>) -> Self {
        ControllerInput {
            now,
            reading,
            link_event: None,
            peer_connected: false,
            messages: Vec::new(),
            calibration: None,
        }
    }
}

/// Effects requested by the controller
#[derive(Clone, Debug, PartialEq)]
pub enum ControllerAction {
    SetSignal(Lamps),
    Send(Message),
    Record(TimingRecord),
    /// Run the calibrator and feed the result into a later step
    Recalibrate,
}

/// Controller machine context
#[derive(Debug)]
pub struct GateController {
    config: ControllerConfig,
    state: ControllerState,
    gate: Option<CalibratedGate>,
    cycle: Option<TimingCycle>,
    lamps: Lamps,
    invalid_readings: u32,
    /// Timer reported ready since the last start or link change
    peer_ready: bool,
    /// Last "timing still open" log line
    last_timing_notice: Option<Timestamp>,
    cycles_started: u64,
}

impl GateController {
    /// Start idle with a calibrated gate
    pub fn new(config: ControllerConfig, gate: CalibratedGate) -> Self {
        GateController {
            config,
            state: ControllerState::Idle,
            gate: Some(gate),
            cycle: None,
            lamps: Lamps::GO,
            invalid_readings: 0,
            peer_ready: false,
            last_timing_notice: None,
            cycles_started: 0,
        }
    }

    /// Start from the outcome of the start-up calibration
    ///
    /// A failed calibration starts the controller in `Fault`, lamp red,
    /// retrying after the configured backoff.
    pub fn from_calibration(
        config: ControllerConfig,
        calibration: GateResult<CalibratedGate>,
        now: Timestamp,
    ) -> Self {
        match calibration {
            Ok(gate) => Self::new(config, gate),
            Err(e) => {
                tracing::error!("controller starting without reference: {}", e);
                GateController {
                    config,
                    state: ControllerState::Fault {
                        reason: FaultReason::Calibration,
                        entered: now,
                        retry_from: now,
                        recalibration_requested: false,
                    },
                    gate: None,
                    cycle: None,
                    lamps: Lamps::STOP,
                    invalid_readings: 0,
                    peer_ready: false,
                    last_timing_notice: None,
                    cycles_started: 0,
                }
            }
        }
    }

    pub fn state(&self) -> ControllerState {
        self.state
    }

    pub fn gate(&self) -> Option<&CalibratedGate> {
        self.gate.as_ref()
    }

    pub fn cycle(&self) -> Option<&TimingCycle> {
        self.cycle.as_ref()
    }

    /// Whether a timing cycle is open
    pub fn timing_in_progress(&self) -> bool {
        self.cycle.is_some()
    }

    /// Lamps as last commanded
    pub fn lamps(&self) -> Lamps {
        self.lamps
    }

    /// Whether the timer has announced it can take a `START_TIMER`
    pub fn peer_ready(&self) -> bool {
        self.peer_ready
    }

    pub fn invalid_readings(&self) -> u32 {
        self.invalid_readings
    }

    /// Number of StartTimer messages issued so far
    pub fn cycles_started(&self) -> u64 {
        self.cycles_started
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    /// Evaluate one tick
    pub fn step(&mut self, input: ControllerInput) -> Vec<ControllerAction> {
        let mut actions = Vec::new();
        let now = input.now;

        if let Some(event) = input.link_event {
            self.on_link_event(event, &mut actions);
        }

        if let Some(result) = input.calibration {
            self.on_calibration(result, now, &mut actions);
        }

        for message in input.messages {
            self.on_message(message, now, input.peer_connected, &mut actions);
        }

        let reading = self.track_sensor(input.reading, now, &mut actions);
        self.advance(reading, now, input.peer_connected, &mut actions);
        actions
    }

    fn on_link_event(&mut self, event: LinkEvent, actions: &mut Vec<ControllerAction>) {
        // A new session announces readiness with its own CLIENT_READY
        self.peer_ready = false;

        // A stale cycle must never outlive the connection it belonged to
        if let Some(cycle) = self.cycle.take() {
            tracing::warn!(
                detected_at = %cycle.object_detected_at,
                "discarding open timing cycle after link change"
            );
        }

        match event {
            LinkEvent::Connected => tracing::info!("timer link up"),
            LinkEvent::Lost(reason) => tracing::warn!("timer link down: {}", reason),
        }

        if self.state.is_fault() {
            return;
        }
        if self.state != ControllerState::Idle {
            tracing::info!(from = %self.state, "resetting to Idle");
        }
        self.state = ControllerState::Idle;
        self.set_lamps(Lamps::GO, actions);
    }

    fn on_calibration(
        &mut self,
        result: GateResult<CalibratedGate>,
        now: Timestamp,
        actions: &mut Vec<ControllerAction>,
    ) {
        let ControllerState::Fault { reason, entered, .. } = self.state else {
            tracing::debug!("calibration result outside Fault ignored");
            return;
        };

        match result {
            Ok(gate) => {
                tracing::info!(
                    reference_cm = gate.reference_distance(),
                    trigger_cm = gate.trigger_threshold(),
                    "recovered from {} fault",
                    reason
                );
                self.gate = Some(gate);
                self.cycle = None;
                self.invalid_readings = 0;
                self.state = ControllerState::Idle;
                self.set_lamps(Lamps::GO, actions);
            }
            Err(e) => {
                tracing::error!("recalibration failed, staying in Fault: {}", e);
                self.state = ControllerState::Fault {
                    reason,
                    entered,
                    retry_from: now,
                    recalibration_requested: false,
                };
                self.set_lamps(self.fault_lamps(now), actions);
            }
        }
    }

    fn on_message(
        &mut self,
        message: Message,
        now: Timestamp,
        peer_connected: bool,
        actions: &mut Vec<ControllerAction>,
    ) {
        match message {
            Message::StopTimer { elapsed_ms } => {
                if self.state != ControllerState::TimingActive {
                    tracing::warn!(elapsed_ms, state = %self.state, "STOP_TIMER ignored, no timing in progress");
                    return;
                }
                tracing::info!(elapsed_ms, "timing result received");

                let record = TimingRecord {
                    timestamp_ms: now.as_millis(),
                    elapsed_ms,
                    link_status: if peer_connected {
                        LinkStatus::Ok
                    } else {
                        LinkStatus::NoClient
                    },
                    reference_distance: self.gate.map(|g| g.reference_distance()).unwrap_or(0.0),
                };
                if let Some(cycle) = self.cycle.as_mut() {
                    cycle.elapsed_ms = Some(elapsed_ms);
                }
                actions.push(ControllerAction::Record(record));

                self.cycle = None;
                self.state = ControllerState::Cooldown { since: now };
                self.set_lamps(Lamps::CAUTION, actions);
            }
            Message::ClientReady => {
                tracing::info!(state = %self.state, "timer reports ready");
                self.peer_ready = true;
            }
            other => tracing::warn!(message = %other, "unexpected message for controller"),
        }
    }

    /// Count invalid readings and raise a sensor fault at the limit
    fn track_sensor(
        &mut self,
        reading: Option<f64>,
        now: Timestamp,
        actions: &mut Vec<ControllerAction>,
    ) -> Option<f64> {
        if self.state.is_fault() {
            return reading;
        }

        match reading {
            Some(distance) => {
                self.invalid_readings = 0;
                Some(distance)
            }
            None => {
                self.invalid_readings += 1;
                if self.invalid_readings >= self.config.max_invalid_readings {
                    let consecutive = self.invalid_readings;
                    self.enter_fault(
                        FaultReason::Sensor,
                        GateError::SensorFault { consecutive },
                        now,
                        actions,
                    );
                }
                None
            }
        }
    }

    fn advance(
        &mut self,
        reading: Option<f64>,
        now: Timestamp,
        peer_connected: bool,
        actions: &mut Vec<ControllerAction>,
    ) {
        let gate = self.gate;
        let arrived = matches!((gate, reading), (Some(g), Some(d)) if g.is_arrival(d));
        let departed = matches!(
            (gate, reading),
            (Some(g), Some(d)) if g.is_departure(d, self.config.hysteresis_factor)
        );

        match self.state {
            ControllerState::Idle => {
                if !arrived {
                    return;
                }
                if self.cycle.is_some() {
                    self.notice_open_cycle(now, "arrival ignored");
                    return;
                }
                tracing::info!(distance_cm = reading, "object arrived");
                self.cycle = Some(TimingCycle {
                    object_detected_at: now,
                    start_sent_at: None,
                    elapsed_ms: None,
                });
                self.state = ControllerState::ArrivalPendingCaution;
                self.set_lamps(Lamps::DARK, actions);
            }

            ControllerState::ArrivalPendingCaution => {
                let Some(cycle) = self.cycle else {
                    self.reset_to_idle(actions);
                    return;
                };
                if now - cycle.object_detected_at >= self.config.yellow_pending_delay {
                    self.state = ControllerState::CautionActive { since: now };
                    self.set_lamps(Lamps::CAUTION, actions);
                }
            }

            ControllerState::CautionActive { since } => {
                if now - since >= self.config.caution_duration {
                    self.state = ControllerState::StopPendingDeparture;
                    self.set_lamps(Lamps::STOP, actions);
                }
            }

            ControllerState::StopPendingDeparture => {
                if !departed {
                    return;
                }
                if !peer_connected {
                    self.enter_fault(FaultReason::NoPeerForStart, GateError::NoPeerForStart, now, actions);
                    return;
                }

                tracing::info!(distance_cm = reading, "object departed, starting timer");
                let cycle = self.cycle.get_or_insert(TimingCycle {
                    object_detected_at: now,
                    start_sent_at: None,
                    elapsed_ms: None,
                });
                cycle.start_sent_at = Some(now);
                self.cycles_started += 1;
                self.peer_ready = false;
                self.last_timing_notice = Some(now);

                actions.push(ControllerAction::Send(Message::StartTimer));
                self.state = ControllerState::TimingActive;
                self.set_lamps(Lamps::ALL, actions);
            }

            ControllerState::TimingActive => {
                let started = self.cycle.and_then(|c| c.start_sent_at).unwrap_or(now);
                let waited = now - started;
                if waited > self.config.max_timing_duration {
                    self.enter_fault(
                        FaultReason::TimingTimeout,
                        GateError::TimingTimeout { waited },
                        now,
                        actions,
                    );
                    return;
                }
                if arrived {
                    self.notice_open_cycle(now, "arrival ignored");
                } else {
                    self.notice_open_cycle(now, "waiting for timer result");
                }
            }

            ControllerState::Cooldown { since } => {
                let held = now - since;
                if held < self.config.min_time_between_measurements {
                    return;
                }
                // The timer ignores START_TIMER while its result is on screen
                if self.peer_ready || !peer_connected {
                    tracing::info!("ready for next measurement");
                    self.reset_to_idle(actions);
                } else if held >= self.config.peer_ready_timeout {
                    tracing::warn!(waited = ?held, "timer never reported ready, resuming anyway");
                    self.reset_to_idle(actions);
                }
            }

            ControllerState::Fault {
                reason,
                entered,
                retry_from,
                recalibration_requested,
            } => {
                if recalibration_requested {
                    return;
                }
                self.set_lamps(self.fault_lamps(now), actions);

                if now - retry_from >= self.config.fault_backoff {
                    tracing::info!("attempting recovery from {} fault", reason);
                    self.state = ControllerState::Fault {
                        reason,
                        entered,
                        retry_from,
                        recalibration_requested: true,
                    };
                    self.set_lamps(Lamps::CALIBRATING, actions);
                    actions.push(ControllerAction::Recalibrate);
                }
            }
        }
    }

    fn enter_fault(
        &mut self,
        reason: FaultReason,
        error: GateError,
        now: Timestamp,
        actions: &mut Vec<ControllerAction>,
    ) {
        tracing::error!(from = %self.state, "entering Fault: {}", error);
        self.cycle = None;
        self.invalid_readings = 0;
        self.state = ControllerState::Fault {
            reason,
            entered: now,
            retry_from: now,
            recalibration_requested: false,
        };
        self.set_lamps(self.fault_lamps(now), actions);
    }

    /// Stop lamp blinks after entering `Fault`, then stays lit
    fn fault_lamps(&self, now: Timestamp) -> Lamps {
        let ControllerState::Fault { entered, .. } = self.state else {
            return Lamps::STOP;
        };
        let period = self.config.fault_blink_period.as_micros().max(1);
        let phase = (now - entered).as_micros() / period;
        if phase >= u128::from(self.config.fault_blink_count) * 2 || phase % 2 == 0 {
            Lamps::STOP
        } else {
            Lamps::DARK
        }
    }

    fn reset_to_idle(&mut self, actions: &mut Vec<ControllerAction>) {
        self.cycle = None;
        self.state = ControllerState::Idle;
        self.set_lamps(Lamps::GO, actions);
    }

    fn notice_open_cycle(&mut self, now: Timestamp, what: &str) {
        let due = self
            .last_timing_notice
            .map_or(true, |last| now - last >= self.config.timing_warning_interval);
        if due {
            tracing::info!(state = %self.state, "timing in progress, {}", what);
            self.last_timing_notice = Some(now);
        }
    }

    fn set_lamps(&mut self, lamps: Lamps, actions: &mut Vec<ControllerAction>) {
        if self.lamps != lamps {
            self.lamps = lamps;
            actions.push(ControllerAction::SetSignal(lamps));
        }
    }
}
