//! Simulated and real-time bus runs

use std::collections::HashSet;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{info, warn};

use dropbus_core::config::SharedConfig;
use dropbus_core::identity::StdRandom;
use dropbus_core::types::{Address, SerialNumber};
use dropbus_devices::devices::{SensorDriver, SensorHandle, SensorState, SENSOR_CLASS};
use dropbus_devices::{
    BusPacket, BusRuntime, BusTap, ChannelTransport, DeviceSnapshot, LogicDriver, LoopbackBus, SlotId,
};

/// Outbound queue depth of each real-time node
const OUTBOUND_CAPACITY: usize = 64;

/// Largest step a simulated reading drifts per tick
const READING_DRIFT: i16 = 5;

/// Final state of one node
#[derive(Debug, Serialize)]
struct NodeSummary {
    serial_number: String,
    address: Address,
    committed: bool,
    sensor: SensorState,
    registry: Vec<DeviceSnapshot>,
}

/// Final state of a whole run
#[derive(Debug, Serialize)]
struct RunSummary {
    finished_at: DateTime<Utc>,
    ticks: u32,
    converged: bool,
    nodes: Vec<NodeSummary>,
}

struct SimNode {
    driver: LogicDriver<SensorDriver>,
    tap: BusTap,
    local: SlotId,
    sensor: SensorHandle,
}

fn summarize(driver: &LogicDriver<SensorDriver>, local: SlotId, sensor: &SensorHandle) -> NodeSummary {
    let record = driver.driver(local).map(|instance| instance.record().clone());
    NodeSummary {
        serial_number: driver.serial_number().to_string(),
        address: record.as_ref().map_or(Address::UNASSIGNED, |record| record.address),
        committed: record.as_ref().map_or(false, |record| record.is_initialised()),
        sensor: sensor.state(),
        registry: driver.snapshot(),
    }
}

fn converged(nodes: &[NodeSummary]) -> bool {
    let mut seen = HashSet::new();
    nodes
        .iter()
        .all(|node| node.committed && seen.insert(node.address))
}

fn print_summary(summary: &RunSummary, json: bool) -> Result<()> {
    if json {
        let rendered = serde_json::to_string_pretty(summary).context("Failed to render summary")?;
        println!("{}", rendered);
        return Ok(());
    }

    println!(
        "{} nodes after {} ticks, {}",
        summary.nodes.len(),
        summary.ticks,
        if summary.converged { "converged" } else { "not converged" }
    );
    for node in &summary.nodes {
        println!(
            "  {}  address {:>3}  {}  reading {:>5}  peers {}",
            node.serial_number,
            node.address,
            if node.committed { "committed" } else { "claiming " },
            node.sensor.reading,
            node.registry.len().saturating_sub(1),
        );
    }
    Ok(())
}

fn new_sensor(rng: &mut StdRng) -> SensorDriver {
    SensorDriver::with_reading(rng.gen_range(-400..400))
}

fn new_serial(rng: &mut StdRng) -> SerialNumber {
    SerialNumber::new(rng.gen_range(1..=u32::MAX))
}

/// Run `nodes` nodes on a loopback bus for `ticks` ticks
pub fn simulate(config: &SharedConfig, nodes: usize, ticks: u32, seed: u64, json: bool) -> Result<()> {
    if nodes == 0 {
        bail!("At least one node is required");
    }

    let mut rng = StdRng::seed_from_u64(seed);
    let bus = LoopbackBus::new();
    let mut sim = Vec::with_capacity(nodes);

    for _ in 0..nodes {
        let tap = bus.tap();
        let mut driver = LogicDriver::new(config.get().bus.clone(), new_serial(&mut rng), tap.clone())
            .with_random(StdRandom::seeded(rng.gen()));
        let sensor = new_sensor(&mut rng);
        let handle = sensor.handle();
        let local = driver.add_local(SENSOR_CLASS, sensor)?;
        sim.push(SimNode {
            driver,
            tap,
            local,
            sensor: handle,
        });
    }
    info!(nodes, ticks, seed, "simulation started");

    for _ in 0..ticks {
        for node in sim.iter_mut() {
            let reading = node.sensor.state().reading;
            let drift = rng.gen_range(-READING_DRIFT..=READING_DRIFT);
            node.sensor.set_reading(reading.saturating_add(drift));
            node.driver.tick();
        }
        for node in sim.iter_mut() {
            for packet in node.tap.drain() {
                node.driver.handle_packet(&packet);
            }
        }
    }

    let nodes: Vec<NodeSummary> = sim
        .iter()
        .map(|node| summarize(&node.driver, node.local, &node.sensor))
        .collect();
    let summary = RunSummary {
        finished_at: Utc::now(),
        ticks,
        converged: converged(&nodes),
        nodes,
    };
    print_summary(&summary, json)
}

/// Run `nodes` nodes in real time, each in its own task
pub async fn run(config: &SharedConfig, nodes: usize, duration_secs: u64) -> Result<()> {
    if nodes == 0 {
        bail!("At least one node is required");
    }

    let mut rng = StdRng::from_entropy();
    let mut runtimes = Vec::with_capacity(nodes);
    let mut outbound = Vec::with_capacity(nodes);

    for _ in 0..nodes {
        let (tx, rx) = mpsc::channel::<BusPacket>(OUTBOUND_CAPACITY);
        let mut driver = LogicDriver::new(config.get().bus.clone(), SerialNumber::random(), ChannelTransport::new(tx));
        let sensor = new_sensor(&mut rng);
        let handle = sensor.handle();
        let local = driver.add_local(SENSOR_CLASS, sensor)?;
        runtimes.push((BusRuntime::spawn(driver), local, handle));
        outbound.push(rx);
    }

    let inbound: Vec<_> = runtimes.iter().map(|(runtime, _, _)| runtime.inbound()).collect();
    let mut hubs = Vec::with_capacity(nodes);
    for (index, mut rx) in outbound.into_iter().enumerate() {
        let peers = inbound.clone();
        hubs.push(tokio::spawn(async move {
            while let Some(packet) = rx.recv().await {
                for (peer, sender) in peers.iter().enumerate() {
                    if peer == index {
                        continue;
                    }
                    if let Err(e) = sender.try_send(packet.clone()) {
                        warn!(from = index, to = peer, error = %e, "packet lost");
                    }
                }
            }
        }));
    }
    drop(inbound);

    info!(nodes, duration_secs, "bus running");
    let started = Instant::now();
    tokio::select! {
        _ = tokio::time::sleep(Duration::from_secs(duration_secs)) => {}
        result = tokio::signal::ctrl_c() => match result {
            Ok(()) => info!("Received ctrl-c signal, shutting down"),
            Err(e) => warn!(error = %e, "Failed to listen for ctrl-c"),
        },
    }

    let elapsed = started.elapsed();
    let mut summaries = Vec::with_capacity(nodes);
    for (runtime, local, sensor) in runtimes {
        let driver = runtime.shutdown().await?;
        summaries.push(summarize(&driver, local, &sensor));
    }
    let tick_ms = config.get().bus.tick_interval_ms.max(1);
    let ticks = u32::try_from(elapsed.as_millis() / u128::from(tick_ms)).unwrap_or(u32::MAX);
    for hub in hubs {
        hub.abort();
    }

    let summary = RunSummary {
        finished_at: Utc::now(),
        ticks,
        converged: converged(&summaries),
        nodes: summaries,
    };
    print_summary(&summary, false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_converged_requires_unique_commits() {
        let node = |address: u8, committed: bool| NodeSummary {
            serial_number: String::new(),
            address: Address::new(address),
            committed,
            sensor: SensorState::default(),
            registry: Vec::new(),
        };
        assert!(converged(&[node(1, true), node(2, true)]));
        assert!(!converged(&[node(1, true), node(1, true)]));
        assert!(!converged(&[node(1, true), node(2, false)]));
    }

    #[test]
    fn test_simulation_runs() {
        let config = SharedConfig::new(Default::default());
        simulate(&config, 3, 12, 9, true).unwrap();
    }
}
