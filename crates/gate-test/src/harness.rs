//! Two-node rig over the in-memory network
//!
//! Both nodes read the same [`ManualClock`], so a run is a pure function of
//! the scripted gate distances and the tick sizes chosen by the caller.

use std::time::Duration;

use gate_core::{Clock, DistanceSource, ManualClock, Timestamp};
use gate_runtime::{
    ControllerNode, GateSettings, MemoryDisplay, MemoryLogSink, MemorySignal, NodeRole, TimerNode,
};
use gate_sensor::{NoiseConfig, NoisySource, SimulatedGate};
use gate_transport::{MemoryAcceptor, MemoryConnector, MemoryNetwork};

// ============================================================================
// Configuration
// ============================================================================

/// Rig construction options
#[derive(Clone, Debug)]
pub struct RigConfig {
    /// Clock advance per [`GateRig::step`]
    pub tick: Duration,
    /// Resting distance at the first gate
    pub first_reference: f64,
    /// Resting distance at the second gate
    pub second_reference: f64,
    /// Sensor noise and its seed, applied to both gates
    pub noise: Option<(NoiseConfig, u64)>,
    pub controller: GateSettings,
    pub timer: GateSettings,
}

impl RigConfig {
    /// Default settings with sensor pauses removed
    pub fn new() -> Self {
        RigConfig {
            tick: Duration::from_millis(20),
            first_reference: 100.0,
            second_reference: 100.0,
            noise: None,
            controller: instant_sensor(GateSettings::defaults(NodeRole::Controller)),
            timer: instant_sensor(GateSettings::defaults(NodeRole::Timer)),
        }
    }

    pub fn with_noise(mut self, noise: NoiseConfig, seed: u64) -> Self {
        self.noise = Some((noise, seed));
        self
    }
}

impl Default for RigConfig {
    fn default() -> Self {
        Self::new()
    }
}

fn instant_sensor(mut settings: GateSettings) -> GateSettings {
    settings.sensor.inter_sample_delay = Duration::ZERO;
    settings.sensor.calibration_interval = Duration::ZERO;
    settings
}

fn boxed_source(gate: &SimulatedGate, noise: &Option<(NoiseConfig, u64)>) -> Box<dyn DistanceSource> {
    match noise {
        Some((config, seed)) => Box::new(NoisySource::with_seed(gate.clone(), config.clone(), *seed)),
        None => Box::new(gate.clone()),
    }
}

// ============================================================================
// Rig
// ============================================================================

/// A controller and a timer sharing one clock and one in-memory network
pub struct GateRig {
    pub clock: ManualClock,
    pub network: MemoryNetwork,
    /// Distance seen by the controller's sensor
    pub first_gate: SimulatedGate,
    /// Distance seen by the timer's sensor
    pub second_gate: SimulatedGate,
    pub signal: MemorySignal,
    pub display: MemoryDisplay,
    pub log: MemoryLogSink,
    controller: ControllerNode<MemoryAcceptor, ManualClock>,
    timer: TimerNode<MemoryConnector, ManualClock>,
    tick: Duration,
    first_reference: f64,
    second_reference: f64,
}

impl GateRig {
    /// Build both nodes; the controller calibrates immediately
    pub fn new(config: RigConfig) -> Self {
        let clock = ManualClock::new();
        let network = MemoryNetwork::new();
        let first_gate = SimulatedGate::new(config.first_reference);
        let second_gate = SimulatedGate::new(config.second_reference);
        let signal = MemorySignal::new();
        let display = MemoryDisplay::new();
        let log = MemoryLogSink::new();

        let controller = ControllerNode::new(
            &config.controller,
            clock.clone(),
            network.acceptor(),
            boxed_source(&first_gate, &config.noise),
            Box::new(signal.clone()),
            Box::new(log.clone()),
        );
        let timer = TimerNode::new(
            &config.timer,
            clock.clone(),
            network.connector(),
            boxed_source(&second_gate, &config.noise),
            Box::new(display.clone()),
        );

        GateRig {
            clock,
            network,
            first_gate,
            second_gate,
            signal,
            display,
            log,
            controller,
            timer,
            tick: config.tick,
            first_reference: config.first_reference,
            second_reference: config.second_reference,
        }
    }

    pub fn controller(&self) -> &ControllerNode<MemoryAcceptor, ManualClock> {
        &self.controller
    }

    pub fn timer(&self) -> &TimerNode<MemoryConnector, ManualClock> {
        &self.timer
    }

    pub fn now(&self) -> Timestamp {
        self.clock.now()
    }

    pub fn tick_period(&self) -> Duration {
        self.tick
    }

    /// Advance one tick period, then tick the controller and the timer
    pub async fn step(&mut self) {
        self.advance(self.tick).await;
    }

    /// Advance by an arbitrary amount, then tick both nodes once
    pub async fn advance(&mut self, dt: Duration) {
        self.clock.advance(dt);
        self.controller.tick().await;
        self.timer.tick().await;
    }

    /// Advance one tick period and tick only the controller
    pub async fn step_controller(&mut self) {
        self.clock.advance(self.tick);
        self.controller.tick().await;
    }

    /// Advance one tick period and tick only the timer
    pub async fn step_timer(&mut self) {
        self.clock.advance(self.tick);
        self.timer.tick().await;
    }

    /// Step for at least `duration` of simulated time
    pub async fn run_for(&mut self, duration: Duration) {
        let end = self.now().saturating_add(duration);
        while self.now() < end {
            self.step().await;
        }
    }

    /// Step until `done` holds, giving up after `limit` of simulated time
    ///
    /// Returns whether the condition was reached.
    pub async fn run_until<F>(&mut self, limit: Duration, done: F) -> bool
    where
        F: Fn(&GateRig) -> bool,
    {
        let end = self.now().saturating_add(limit);
        while !done(self) {
            if self.now() >= end {
                return false;
            }
            self.step().await;
        }
        true
    }

    /// Step until the link is up and the timer has reported ready
    pub async fn connect(&mut self) -> bool {
        self.run_until(Duration::from_secs(5), |rig| rig.is_ready()).await
    }

    /// Both ends connected, timer ready, controller idle
    pub fn is_ready(&self) -> bool {
        self.controller.link().is_connected()
            && self.timer.link().is_connected()
            && self.timer.timer().state() == gate_runtime::TimerState::Ready
            && self.controller.controller().state() == gate_runtime::ControllerState::Idle
    }

    /// Put the first gate back at rest
    pub fn clear_first_gate(&self) {
        self.first_gate.set(self.first_reference);
    }

    /// Put the second gate back at rest
    pub fn clear_second_gate(&self) {
        self.second_gate.set(self.second_reference);
    }
}
