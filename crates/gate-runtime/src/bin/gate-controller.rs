//! Controller node with a simulated first-gate sensor

use std::path::PathBuf;
use std::time::Duration;

use gate_core::{LogSink, MonotonicClock};
use gate_runtime::{
    init_logging, lamp_self_test, ControllerNode, CsvLogSink, GateSettings, NodeRole,
    TracingLogSink, TracingSignal,
};
use gate_sensor::{NoiseConfig, NoisySource, SimulatedGate};
use gate_transport::TcpAcceptor;

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args: Vec<String> = std::env::args().collect();
    if args.iter().any(|a| a == "-h" || a == "--help") {
        println!("Usage: gate-controller [settings.json]");
        println!("Log filter: GATE_LOG=debug gate-controller");
        println!("Listens on node.address (default 192.168.4.1:80)");
        return Ok(());
    }

    let settings_path = args.get(1).map(PathBuf::from);
    let settings = GateSettings::load(NodeRole::Controller, settings_path.as_deref())?;
    init_logging(&settings.logging)?;

    let mut signal = TracingSignal::new();
    lamp_self_test(&mut signal).await;

    let gate = SimulatedGate::new(100.0);
    tokio::spawn(simulate_passes(gate.clone()));
    let source = NoisySource::new(gate, NoiseConfig::default());

    let log: Box<dyn LogSink> = match &settings.log_file {
        Some(path) => Box::new(CsvLogSink::open(path)?),
        None => Box::new(TracingLogSink),
    };

    let acceptor = TcpAcceptor::bind(settings.node.address).await?;
    tracing::info!(addr = %acceptor.local_addr(), "waiting for timer");

    let mut node = ControllerNode::new(
        &settings,
        MonotonicClock::new(),
        acceptor,
        Box::new(source),
        Box::new(signal),
        log,
    );
    node.run_until(async {
        let _ = tokio::signal::ctrl_c().await;
    })
    .await;

    tracing::info!(stats = ?node.statistics(), "controller stopped");
    Ok(())
}

/// Move a simulated object through the first gate every 20 s
async fn simulate_passes(gate: SimulatedGate) {
    let clear = gate.get();
    loop {
        tokio::time::sleep(Duration::from_secs(20)).await;
        gate.set(clear * 0.4);
        tokio::time::sleep(Duration::from_secs(3)).await;
        gate.set(clear);
    }
}
