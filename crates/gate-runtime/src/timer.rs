//! Timer node state machine
//!
//! Waits for the controller's start command, measures the time until the
//! object reaches the second gate and reports it back. Like the controller,
//! the machine is pure and driven one tick at a time.

use std::fmt;

use gate_core::{CalibratedGate, GateResult, LinkLossReason, TimerConfig, Timestamp};
use gate_transport::LinkEvent;
use gate_wire::Message;

/// Timer phases
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TimerState {
    /// No session, or session up but not yet calibrated
    AwaitingLink,
    /// Handshake done, waiting for `START_TIMER`
    Ready,
    Timing { started_at: Timestamp },
    /// Result sent this tick
    Reporting { elapsed_ms: u64, at: Timestamp },
    /// Result on screen
    Cooldown { since: Timestamp, elapsed_ms: u64 },
}

impl fmt::Display for TimerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimerState::AwaitingLink => write!(f, "AwaitingLink"),
            TimerState::Ready => write!(f, "Ready"),
            TimerState::Timing { .. } => write!(f, "Timing"),
            TimerState::Reporting { .. } => write!(f, "Reporting"),
            TimerState::Cooldown { .. } => write!(f, "Cooldown"),
        }
    }
}

/// Everything the timer observes in one tick
#[derive(Clone, Debug)]
pub struct TimerInput {
    pub now: Timestamp,
    /// Filtered distance, only taken while timing
    pub reading: Option<f64>,
    pub link_event: Option<LinkEvent>,
    pub messages: Vec<Message>,
    pub calibration: Option<GateResult<CalibratedGate>>,
}

impl TimerInput {
    pub fn at(now: Timestamp) -> Self {
        TimerInput {
            now,
            reading: None,
            link_event: None,
            messages: Vec::new(),
            calibration: None,
        }
    }
}

/// Effects requested by the timer
#[derive(Clone, Debug, PartialEq)]
pub enum TimerAction {
    Send(Message),
    /// Replace the status display
    Display(Vec<String>),
    Recalibrate,
}

/// Timer machine context
#[derive(Debug)]
pub struct GateTimer {
    config: TimerConfig,
    state: TimerState,
    gate: Option<CalibratedGate>,
    connected: bool,
    calibration_requested: bool,
    calibration_failed_at: Option<Timestamp>,
    last_display: Option<Timestamp>,
    last_result_ms: Option<u64>,
    ignored_starts: u64,
}

impl GateTimer {
    pub fn new(config: TimerConfig) -> Self {
        GateTimer {
            config,
            state: TimerState::AwaitingLink,
            gate: None,
            connected: false,
            calibration_requested: false,
            calibration_failed_at: None,
            last_display: None,
            last_result_ms: None,
            ignored_starts: 0,
        }
    }

    /// Start with a gate calibrated ahead of the first connection
    pub fn with_gate(config: TimerConfig, gate: CalibratedGate) -> Self {
        GateTimer {
            gate: Some(gate),
            ..Self::new(config)
        }
    }

    pub fn state(&self) -> TimerState {
        self.state
    }

    pub fn gate(&self) -> Option<&CalibratedGate> {
        self.gate.as_ref()
    }

    pub fn last_result_ms(&self) -> Option<u64> {
        self.last_result_ms
    }

    /// `START_TIMER` commands dropped because the timer was not ready
    pub fn ignored_starts(&self) -> u64 {
        self.ignored_starts
    }

    /// Whether the driver should take a distance reading this tick
    pub fn needs_reading(&self) -> bool {
        matches!(self.state, TimerState::Timing { .. })
    }

    /// Evaluate one tick
    pub fn step(&mut self, input: TimerInput) -> Vec<TimerAction> {
        let mut actions = Vec::new();
        let now = input.now;

        if let Some(event) = input.link_event {
            self.on_link_event(event, now, &mut actions);
        }

        if let Some(result) = input.calibration {
            self.on_calibration(result, now, &mut actions);
        }
        self.retry_calibration(now, &mut actions);

        for message in input.messages {
            self.on_message(message, now, &mut actions);
        }

        self.advance(input.reading, now, &mut actions);
        actions
    }

    fn on_link_event(&mut self, event: LinkEvent, now: Timestamp, actions: &mut Vec<TimerAction>) {
        if let TimerState::Timing { started_at } = self.state {
            tracing::warn!(
                running_ms = (now - started_at).as_millis() as u64,
                "discarding timing in progress"
            );
        }
        self.state = TimerState::AwaitingLink;

        match event {
            LinkEvent::Lost(reason) => {
                tracing::warn!("connection to controller lost: {}", reason);
                self.connected = false;
                let screen: Vec<String> = match reason {
                    LinkLossReason::HeartbeatTimeout => {
                        vec!["Heartbeat timeout!".into(), "Connection lost".into()]
                    }
                    _ => vec!["Connection lost!".into(), "Reconnecting...".into()],
                };
                actions.push(TimerAction::Display(screen));
            }
            LinkEvent::Connected => {
                tracing::info!("connected to controller");
                self.connected = true;
                if self.gate.is_none() || self.config.recalibrate_on_connect {
                    self.request_calibration(actions);
                } else {
                    self.enter_ready(actions);
                }
            }
        }
    }

    fn on_calibration(
        &mut self,
        result: GateResult<CalibratedGate>,
        now: Timestamp,
        actions: &mut Vec<TimerAction>,
    ) {
        self.calibration_requested = false;
        match result {
            Ok(gate) => {
                tracing::info!(
                    reference_cm = gate.reference_distance(),
                    trigger_cm = gate.trigger_threshold(),
                    degraded = gate.is_degraded(),
                    "timer gate calibrated"
                );
                self.gate = Some(gate);
                self.calibration_failed_at = None;
                if self.connected && self.state == TimerState::AwaitingLink {
                    self.enter_ready(actions);
                }
            }
            Err(e) if self.gate.is_some() => {
                tracing::warn!("recalibration failed, keeping previous reference: {}", e);
                if self.connected && self.state == TimerState::AwaitingLink {
                    self.enter_ready(actions);
                }
            }
            Err(e) => {
                tracing::error!("timer calibration failed: {}", e);
                self.calibration_failed_at = Some(now);
                actions.push(TimerAction::Display(vec![
                    "Calibration failed!".into(),
                    "Check sensor".into(),
                    "Retrying...".into(),
                ]));
            }
        }
    }

    fn retry_calibration(&mut self, now: Timestamp, actions: &mut Vec<TimerAction>) {
        if !self.connected || self.gate.is_some() || self.calibration_requested {
            return;
        }
        let due = self
            .calibration_failed_at
            .map_or(true, |at| now - at >= self.config.calibration_retry);
        if due {
            self.request_calibration(actions);
        }
    }

    fn on_message(&mut self, message: Message, now: Timestamp, actions: &mut Vec<TimerAction>) {
        match message {
            Message::StartTimer if self.state == TimerState::Ready => {
                tracing::info!("timing started");
                self.state = TimerState::Timing { started_at: now };
                self.last_display = Some(now);
                let reference = self.gate.map(|g| g.reference_distance()).unwrap_or(0.0);
                actions.push(TimerAction::Display(vec![
                    "TIMING!".into(),
                    format!("Time: {}", seconds(0)),
                    "Waiting for object...".into(),
                    format!("Ref: {:.1}cm", reference),
                ]));
            }
            Message::StartTimer => {
                // Never restart a cycle that is already running
                tracing::warn!(state = %self.state, "START_TIMER ignored, timer not ready");
                self.ignored_starts += 1;
            }
            other => tracing::warn!(message = %other, "unexpected message for timer"),
        }
    }

    fn advance(&mut self, reading: Option<f64>, now: Timestamp, actions: &mut Vec<TimerAction>) {
        match self.state {
            TimerState::AwaitingLink | TimerState::Ready => {}

            TimerState::Timing { started_at } => {
                let elapsed = now - started_at;
                let arrived = matches!((self.gate, reading), (Some(g), Some(d)) if g.is_arrival(d));

                if arrived {
                    let elapsed_ms = elapsed.as_millis() as u64;
                    tracing::info!(elapsed_ms, distance_cm = reading, "object detected");
                    self.last_result_ms = Some(elapsed_ms);
                    self.state = TimerState::Reporting { elapsed_ms, at: now };
                    actions.push(TimerAction::Send(Message::StopTimer { elapsed_ms }));
                    actions.push(TimerAction::Display(vec![
                        "RESULT:".into(),
                        format!("Time: {}", seconds(elapsed_ms)),
                        format!("= {}ms", elapsed_ms),
                    ]));
                } else if elapsed > self.config.max_timing_duration {
                    tracing::warn!(waited = ?elapsed, "no object at second gate, abandoning cycle");
                    self.enter_ready_quiet(actions);
                } else if self
                    .last_display
                    .map_or(true, |at| now - at >= self.config.display_refresh)
                {
                    self.last_display = Some(now);
                    let distance = reading
                        .map(|d| format!("Dist: {:.1}cm", d))
                        .unwrap_or_else(|| "Dist: --".into());
                    actions.push(TimerAction::Display(vec![
                        "TIMING!".into(),
                        format!("Time: {}", seconds(elapsed.as_millis() as u64)),
                        "Waiting for object...".into(),
                        distance,
                    ]));
                }
            }

            TimerState::Reporting { elapsed_ms, at } => {
                self.state = TimerState::Cooldown { since: at, elapsed_ms };
            }

            TimerState::Cooldown { since, .. } => {
                if now - since >= self.config.display_duration {
                    // The controller holds its cooldown until it hears this
                    self.enter_ready(actions);
                }
            }
        }
    }

    fn request_calibration(&mut self, actions: &mut Vec<TimerAction>) {
        self.calibration_requested = true;
        actions.push(TimerAction::Display(vec![
            "Calibrating...".into(),
            "Measuring reference".into(),
            "Keep gate clear!".into(),
        ]));
        actions.push(TimerAction::Recalibrate);
    }

    /// Enter `Ready` and tell the controller a start will be accepted
    fn enter_ready(&mut self, actions: &mut Vec<TimerAction>) {
        actions.push(TimerAction::Send(Message::ClientReady));
        self.enter_ready_quiet(actions);
    }

    /// Enter `Ready` without announcing it
    fn enter_ready_quiet(&mut self, actions: &mut Vec<TimerAction>) {
        self.state = TimerState::Ready;
        actions.push(TimerAction::Display(self.ready_screen()));
    }

    fn ready_screen(&self) -> Vec<String> {
        let Some(gate) = self.gate else {
            return vec!["Ready!".into(), "Waiting for start...".into()];
        };
        if gate.is_degraded() {
            return vec![
                "Sensor warning!".into(),
                format!("Fallback: {:.0}cm", gate.reference_distance()),
                "Check sensor".into(),
                "Waiting for start...".into(),
            ];
        }
        match self.last_result_ms {
            Some(ms) => vec![
                "Ready!".into(),
                "Waiting for start...".into(),
                format!("Last time: {}", seconds(ms)),
                format!("Ref: {:.1}cm", gate.reference_distance()),
            ],
            None => vec![
                "Ready!".into(),
                "Waiting for start...".into(),
                format!("Reference: {:.1}cm", gate.reference_distance()),
                format!("Trigger: {:.1}cm", gate.trigger_threshold()),
            ],
        }
    }
}

/// Milliseconds as seconds with three decimals
fn seconds(ms: u64) -> String {
    format!("{:.3}s", ms as f64 / 1000.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use gate_core::GateError;

    fn ms(v: u64) -> Timestamp {
        Timestamp::from_millis(v)
    }

    fn ready_timer() -> GateTimer {
        let mut t = GateTimer::with_gate(TimerConfig::default(), CalibratedGate::new(100.0));
        let actions = t.step(TimerInput {
            link_event: Some(LinkEvent::Connected),
            ..TimerInput::at(ms(0))
        });
        assert!(actions.contains(&TimerAction::Send(Message::ClientReady)));
        assert_eq!(t.state(), TimerState::Ready);
        t
    }

    fn start(t: &mut GateTimer, at: u64) {
        t.step(TimerInput {
            messages: vec![Message::StartTimer],
            ..TimerInput::at(ms(at))
        });
    }

    fn reading(at: u64, distance: f64) -> TimerInput {
        TimerInput {
            reading: Some(distance),
            ..TimerInput::at(ms(at))
        }
    }

    fn sends(actions: &[TimerAction]) -> Vec<Message> {
        actions
            .iter()
            .filter_map(|a| match a {
                TimerAction::Send(m) => Some(m.clone()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_reports_elapsed_time() {
        let mut t = ready_timer();
        start(&mut t, 1_000);
        assert_eq!(t.state(), TimerState::Timing { started_at: ms(1_000) });
        assert!(t.needs_reading());

        assert!(sends(&t.step(reading(1_500, 80.0))).is_empty());
        let actions = t.step(reading(1_733, 45.0));
        assert_eq!(sends(&actions), vec![Message::StopTimer { elapsed_ms: 733 }]);
        assert!(actions.contains(&TimerAction::Display(vec![
            "RESULT:".into(),
            "Time: 0.733s".into(),
            "= 733ms".into(),
        ])));
        assert!(matches!(t.state(), TimerState::Reporting { elapsed_ms: 733, .. }));

        t.step(TimerInput::at(ms(1_753)));
        assert_eq!(
            t.state(),
            TimerState::Cooldown {
                since: ms(1_733),
                elapsed_ms: 733
            }
        );

        assert!(sends(&t.step(TimerInput::at(ms(6_732)))).is_empty());
        assert!(matches!(t.state(), TimerState::Cooldown { .. }));
        let actions = t.step(TimerInput::at(ms(6_733)));
        assert_eq!(t.state(), TimerState::Ready);
        assert_eq!(sends(&actions), vec![Message::ClientReady]);
        assert_eq!(t.last_result_ms(), Some(733));
    }

    #[test]
    fn test_start_ignored_unless_ready() {
        let mut t = ready_timer();
        start(&mut t, 100);
        start(&mut t, 300);
        assert_eq!(t.state(), TimerState::Timing { started_at: ms(100) });
        assert_eq!(t.ignored_starts(), 1);

        let mut idle = GateTimer::new(TimerConfig::default());
        start(&mut idle, 0);
        assert_eq!(idle.state(), TimerState::AwaitingLink);
    }

    #[test]
    fn test_link_loss_discards_timing() {
        let mut t = ready_timer();
        start(&mut t, 100);

        let actions = t.step(TimerInput {
            link_event: Some(LinkEvent::Lost(LinkLossReason::HeartbeatTimeout)),
            reading: Some(10.0),
            ..TimerInput::at(ms(500))
        });
        assert!(sends(&actions).is_empty());
        assert_eq!(t.state(), TimerState::AwaitingLink);
        assert!(actions.contains(&TimerAction::Display(vec![
            "Heartbeat timeout!".into(),
            "Connection lost".into(),
        ])));
    }

    #[test]
    fn test_reconnect_keeps_gate() {
        let mut t = ready_timer();
        t.step(TimerInput {
            link_event: Some(LinkEvent::Lost(LinkLossReason::TransportClosed)),
            ..TimerInput::at(ms(10))
        });

        let actions = t.step(TimerInput {
            link_event: Some(LinkEvent::Connected),
            ..TimerInput::at(ms(2_000))
        });
        assert!(!actions.contains(&TimerAction::Recalibrate));
        assert_eq!(sends(&actions), vec![Message::ClientReady]);
        assert_eq!(t.state(), TimerState::Ready);
    }

    #[test]
    fn test_calibrates_on_first_connect() {
        let mut t = GateTimer::new(TimerConfig::default());
        let actions = t.step(TimerInput {
            link_event: Some(LinkEvent::Connected),
            ..TimerInput::at(ms(0))
        });
        assert!(actions.contains(&TimerAction::Recalibrate));
        assert_eq!(t.state(), TimerState::AwaitingLink);

        let actions = t.step(TimerInput {
            calibration: Some(Ok(CalibratedGate::fallback(50.0))),
            ..TimerInput::at(ms(1_500))
        });
        assert_eq!(sends(&actions), vec![Message::ClientReady]);
        assert_eq!(t.state(), TimerState::Ready);
        assert!(actions.contains(&TimerAction::Display(vec![
            "Sensor warning!".into(),
            "Fallback: 50cm".into(),
            "Check sensor".into(),
            "Waiting for start...".into(),
        ])));
    }

    #[test]
    fn test_failed_calibration_retries() {
        let mut t = GateTimer::new(TimerConfig::default());
        t.step(TimerInput {
            link_event: Some(LinkEvent::Connected),
            ..TimerInput::at(ms(0))
        });
        let actions = t.step(TimerInput {
            calibration: Some(Err(GateError::CalibrationFailure { valid: 0, required: 7 })),
            ..TimerInput::at(ms(1_000))
        });
        assert!(!actions.contains(&TimerAction::Recalibrate));

        assert!(!t.step(TimerInput::at(ms(5_999))).contains(&TimerAction::Recalibrate));
        assert!(t.step(TimerInput::at(ms(6_000))).contains(&TimerAction::Recalibrate));
    }

    #[test]
    fn test_abandons_after_max_duration() {
        let mut t = ready_timer();
        start(&mut t, 0);
        t.step(reading(30_000, 90.0));
        assert!(matches!(t.state(), TimerState::Timing { .. }));

        let actions = t.step(reading(30_001, 90.0));
        assert!(sends(&actions).is_empty());
        assert_eq!(t.state(), TimerState::Ready);
    }

    #[test]
    fn test_live_display_refresh() {
        let mut t = ready_timer();
        start(&mut t, 0);

        let displays = |actions: Vec<TimerAction>| {
            actions
                .into_iter()
                .filter(|a| matches!(a, TimerAction::Display(_)))
                .count()
        };
        assert_eq!(displays(t.step(reading(60, 90.0))), 0);
        assert_eq!(displays(t.step(reading(100, 90.0))), 1);
        assert_eq!(displays(t.step(reading(120, 90.0))), 0);
    }
}
