//! Timer node with a simulated second-gate sensor

use std::path::PathBuf;
use std::time::Duration;

use gate_core::MonotonicClock;
use gate_runtime::{init_logging, GateSettings, NodeRole, TimerNode, TracingDisplay};
use gate_sensor::{NoiseConfig, NoisySource, SimulatedGate};
use gate_transport::TcpConnector;

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args: Vec<String> = std::env::args().collect();
    if args.iter().any(|a| a == "-h" || a == "--help") {
        println!("Usage: gate-timer [settings.json]");
        println!("Log filter: GATE_LOG=debug gate-timer");
        println!("Dials node.address (default 192.168.4.1:80)");
        return Ok(());
    }

    let settings_path = args.get(1).map(PathBuf::from);
    let settings = GateSettings::load(NodeRole::Timer, settings_path.as_deref())?;
    init_logging(&settings.logging)?;

    let gate = SimulatedGate::new(120.0);
    tokio::spawn(simulate_arrivals(gate.clone()));
    let source = NoisySource::new(gate, NoiseConfig::default());

    let mut node = TimerNode::new(
        &settings,
        MonotonicClock::new(),
        TcpConnector::new(settings.node.address),
        Box::new(source),
        Box::new(TracingDisplay),
    );
    node.run_until(async {
        let _ = tokio::signal::ctrl_c().await;
    })
    .await;

    tracing::info!(last_ms = ?node.timer().last_result_ms(), "timer stopped");
    Ok(())
}

/// Briefly place a simulated object in the second gate every 5 s
async fn simulate_arrivals(gate: SimulatedGate) {
    let clear = gate.get();
    loop {
        tokio::time::sleep(Duration::from_secs(5)).await;
        gate.set(clear * 0.35);
        tokio::time::sleep(Duration::from_millis(500)).await;
        gate.set(clear);
    }
}
