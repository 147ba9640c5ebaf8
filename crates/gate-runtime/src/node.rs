//! Node drivers - the tick loop around each state machine
//!
//! Every tick runs the same stages in a fixed order:
//! 1. session bookkeeping (liveness, accept / connect)
//! 2. one filtered distance measurement
//! 3. one state machine step, effects applied
//! 4. protocol I/O (outgoing messages, heartbeat, inbound lines, flush)
//! 5. wait for the next tick
//!
//! Sensing always precedes the step, and the step always precedes
//! outgoing I/O, so no decision is taken on stale state.

use std::future::Future;
use std::time::Duration;

use tokio::time::MissedTickBehavior;

use gate_core::{
    CalibratedGate, Clock, DisplayOutput, DistanceSource, GateResult, Lamps, LogSink,
    NodeConfig, SignalIndicator, Timestamp, TimingRecord, DISPLAY_LINES,
};
use gate_sensor::GateCalibrator;
use gate_transport::{Acceptor, Connector, LinkRole, SessionLink};
use gate_wire::Message;

use crate::{
    ControllerAction, ControllerInput, GateController, GateSettings, GateTimer, Statistics,
    TimerAction, TimerInput,
};

/// Lamp test at power-up: all on, then dark
pub async fn lamp_self_test(signal: &mut dyn SignalIndicator) {
    tracing::info!("lamp self-test");
    signal.set_signal(Lamps::ALL);
    tokio::time::sleep(Duration::from_secs(1)).await;
    signal.set_signal(Lamps::DARK);
    tokio::time::sleep(Duration::from_millis(500)).await;
}

/// Drive `tick` on a fixed period until `shutdown` resolves
macro_rules! tick_loop {
    ($node:expr, $period:expr, $shutdown:expr) => {{
        let mut interval = tokio::time::interval($period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let shutdown = $shutdown;
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    tracing::info!("shutting down");
                    break;
                }
                _ = interval.tick() => {
                    $node.tick().await;
                }
            }
        }
    }};
}

/// The part of a screen the display has room for
fn visible(lines: &[String]) -> &[String] {
    &lines[..lines.len().min(DISPLAY_LINES)]
}

/// Driver counters
#[derive(Clone, Debug, Default)]
pub struct DriverStats {
    pub ticks: u64,
    pub readings: u64,
    pub missing_readings: u64,
    pub send_failures: u64,
}

/// Controller node: first gate, signal lamps, listening end of the link
pub struct ControllerNode<A: Acceptor, C: Clock> {
    config: NodeConfig,
    clock: C,
    acceptor: A,
    link: SessionLink<A::Conn>,
    calibrator: GateCalibrator,
    controller: GateController,
    source: Box<dyn DistanceSource>,
    signal: Box<dyn SignalIndicator>,
    log: Box<dyn LogSink>,
    stats: Statistics,
    pending_calibration: Option<GateResult<CalibratedGate>>,
    last_status: Option<Timestamp>,
    driver: DriverStats,
}

impl<A: Acceptor, C: Clock> ControllerNode<A, C> {
    /// Calibrate the first gate and come up idle (or faulted)
    pub fn new(
        settings: &GateSettings,
        clock: C,
        acceptor: A,
        mut source: Box<dyn DistanceSource>,
        mut signal: Box<dyn SignalIndicator>,
        log: Box<dyn LogSink>,
    ) -> Self {
        let calibrator = GateCalibrator::new(settings.sensor.clone());

        signal.set_signal(Lamps::CALIBRATING);
        let calibration = calibrator.calibrate_or_fallback(&mut source);
        let controller =
            GateController::from_calibration(settings.controller.clone(), calibration, clock.now());
        signal.set_signal(controller.lamps());

        if let Some(gate) = controller.gate() {
            tracing::info!(
                reference_cm = gate.reference_distance(),
                trigger_cm = gate.trigger_threshold(),
                "controller ready"
            );
        }

        ControllerNode {
            config: settings.node.clone(),
            clock,
            acceptor,
            link: SessionLink::new(LinkRole::Controller, settings.link.clone()),
            calibrator,
            controller,
            source,
            signal,
            log,
            stats: Statistics::new(),
            pending_calibration: None,
            last_status: None,
            driver: DriverStats::default(),
        }
    }

    pub fn controller(&self) -> &GateController {
        &self.controller
    }

    pub fn link(&self) -> &SessionLink<A::Conn> {
        &self.link
    }

    pub fn statistics(&self) -> &Statistics {
        &self.stats
    }

    pub fn driver_stats(&self) -> &DriverStats {
        &self.driver
    }

    /// Run one tick (stages 1 to 4)
    pub async fn tick(&mut self) {
        self.driver.ticks += 1;

        // Stage 1: session bookkeeping, loss first
        let now = self.clock.now();
        let lost = self.link.check_liveness(now);
        let accepted = self.link.accept_from(&mut self.acceptor, now).await;
        let link_event = accepted.or(lost);

        // Stage 2: one measurement
        let reading = self.calibrator.filter().filter(&mut self.source);
        self.count_reading(reading);

        // Stage 3: one state machine step
        let now = self.clock.now();
        let input = ControllerInput {
            now,
            reading,
            link_event,
            peer_connected: self.link.is_connected(),
            messages: self.link.drain_inbox(),
            calibration: self.pending_calibration.take(),
        };
        let mut outgoing = Vec::new();
        for action in self.controller.step(input) {
            match action {
                ControllerAction::SetSignal(lamps) => self.signal.set_signal(lamps),
                ControllerAction::Send(message) => outgoing.push(message),
                ControllerAction::Record(record) => self.record(&record),
                ControllerAction::Recalibrate => {
                    let result = self.calibrator.calibrate_or_fallback(&mut self.source);
                    self.pending_calibration = Some(result);
                }
            }
        }

        // Stage 4: protocol I/O
        let now = self.clock.now();
        self.flush(outgoing, now);
        self.link.maintain_heartbeat(now);
        self.link.poll_incoming(now);
        self.link.flush().await;

        self.log_status(now);
    }

    /// Tick on the configured period until `shutdown` resolves
    pub async fn run_until<F: Future<Output = ()>>(&mut self, shutdown: F) {
        let period = self.config.tick_period;
        tracing::info!(period = ?period, "controller loop started");
        tick_loop!(self, period, shutdown);
    }

    fn count_reading(&mut self, reading: Option<f64>) {
        self.driver.readings += 1;
        if reading.is_none() {
            self.driver.missing_readings += 1;
        }
    }

    fn flush(&mut self, outgoing: Vec<Message>, now: Timestamp) {
        for message in outgoing {
            if let Err(e) = self.link.send(&message, now) {
                tracing::error!(message = %message, "send failed: {}", e);
                self.driver.send_failures += 1;
            }
        }
    }

    fn record(&mut self, record: &TimingRecord) {
        self.stats.record(record.elapsed_ms);
        if let Err(e) = self.log.append(record) {
            tracing::warn!("measurement log write failed: {}", e);
        }
        match self.stats.to_json() {
            Ok(json) => tracing::info!(elapsed_ms = record.elapsed_ms, stats = %json, "measurement recorded"),
            Err(e) => tracing::warn!("statistics unavailable: {}", e),
        }
    }

    fn log_status(&mut self, now: Timestamp) {
        let due = self
            .last_status
            .map_or(true, |at| now - at >= self.config.status_interval);
        if !due {
            return;
        }
        self.last_status = Some(now);
        tracing::info!(
            state = %self.controller.state(),
            link = %self.link.link_status(),
            last_loss = ?self.link.last_loss(),
            timing = self.controller.timing_in_progress(),
            reference_cm = self.controller.gate().map(|g| g.reference_distance()),
            "controller status"
        );
    }
}

/// Timer node: second gate, status display, dialing end of the link
pub struct TimerNode<K: Connector, C: Clock> {
    config: NodeConfig,
    clock: C,
    connector: K,
    link: SessionLink<K::Conn>,
    calibrator: GateCalibrator,
    timer: GateTimer,
    source: Box<dyn DistanceSource>,
    display: Box<dyn DisplayOutput>,
    pending_calibration: Option<GateResult<CalibratedGate>>,
    last_status: Option<Timestamp>,
    driver: DriverStats,
}

impl<K: Connector, C: Clock> TimerNode<K, C> {
    pub fn new(
        settings: &GateSettings,
        clock: C,
        connector: K,
        source: Box<dyn DistanceSource>,
        mut display: Box<dyn DisplayOutput>,
    ) -> Self {
        display.show(visible(&["Gate Timer".to_string(), "Initialising...".to_string()]));

        TimerNode {
            config: settings.node.clone(),
            clock,
            connector,
            link: SessionLink::new(LinkRole::Timer, settings.link.clone()),
            calibrator: GateCalibrator::new(settings.sensor.clone()),
            timer: GateTimer::new(settings.timer.clone()),
            source,
            display,
            pending_calibration: None,
            last_status: None,
            driver: DriverStats::default(),
        }
    }

    pub fn timer(&self) -> &GateTimer {
        &self.timer
    }

    pub fn link(&self) -> &SessionLink<K::Conn> {
        &self.link
    }

    pub fn driver_stats(&self) -> &DriverStats {
        &self.driver
    }

    /// Run one tick (stages 1 to 4)
    pub async fn tick(&mut self) {
        self.driver.ticks += 1;

        // Stage 1: session bookkeeping, loss first
        let now = self.clock.now();
        let lost = self.link.check_liveness(now);
        let mut connected = None;
        // A loss gets its own tick so the timer sees and shows it
        if lost.is_none() && !self.link.is_connected() && self.link.should_attempt(now) {
            self.show(&["Connecting...".to_string(), self.config.address.to_string()]);
            connected = self.link.connect_with(&mut self.connector, now).await;
            if connected.is_none() {
                self.show(&["Server error!".to_string(), "Connection failed".to_string()]);
            }
        }
        let link_event = connected.or(lost);

        // Stage 2: measure only while timing
        let reading = if self.timer.needs_reading() {
            let reading = self.calibrator.filter().filter(&mut self.source);
            self.driver.readings += 1;
            if reading.is_none() {
                self.driver.missing_readings += 1;
            }
            reading
        } else {
            None
        };

        // Stage 3: one state machine step
        let now = self.clock.now();
        let input = TimerInput {
            now,
            reading,
            link_event,
            messages: self.link.drain_inbox(),
            calibration: self.pending_calibration.take(),
        };
        let mut outgoing = Vec::new();
        for action in self.timer.step(input) {
            match action {
                TimerAction::Send(message) => outgoing.push(message),
                TimerAction::Display(lines) => self.show(&lines),
                TimerAction::Recalibrate => {
                    let result = self.calibrator.calibrate_or_fallback(&mut self.source);
                    self.pending_calibration = Some(result);
                }
            }
        }

        // Stage 4: protocol I/O
        let now = self.clock.now();
        for message in outgoing {
            if let Err(e) = self.link.send(&message, now) {
                tracing::error!(message = %message, "send failed: {}", e);
                self.driver.send_failures += 1;
            }
        }
        self.link.poll_incoming(now);
        self.link.flush().await;

        self.log_status(now);
    }

    /// Tick on the configured period until `shutdown` resolves
    pub async fn run_until<F: Future<Output = ()>>(&mut self, shutdown: F) {
        let period = self.config.tick_period;
        tracing::info!(period = ?period, peer = %self.config.address, "timer loop started");
        tick_loop!(self, period, shutdown);
    }

    fn show(&mut self, lines: &[String]) {
        if lines.len() > DISPLAY_LINES {
            tracing::debug!(lines = lines.len(), "screen clipped to {} lines", DISPLAY_LINES);
        }
        self.display.show(visible(lines));
    }

    fn log_status(&mut self, now: Timestamp) {
        let due = self
            .last_status
            .map_or(true, |at| now - at >= self.config.status_interval);
        if !due {
            return;
        }
        self.last_status = Some(now);
        tracing::info!(
            state = %self.timer.state(),
            link = %self.link.state(),
            reference_cm = self.timer.gate().map(|g| g.reference_distance()),
            "timer status"
        );
    }
}
