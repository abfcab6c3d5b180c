use std::collections::{HashMap, HashSet};

use dropbus_core::config::BusConfig;
use dropbus_core::identity::{RandomSource, ScriptedRandom, StdRandom};
use dropbus_core::types::{Address, SerialNumber};
use dropbus_devices::devices::{SensorDriver, SensorHandle, SENSOR_CLASS};
use dropbus_devices::{BusTap, LogicDriver, LoopbackBus, RegistryEvent, SlotId};

struct Node {
    driver: LogicDriver<SensorDriver>,
    tap: BusTap,
    local: SlotId,
    sensor: SensorHandle,
}

impl Node {
    fn address(&self) -> Address {
        self.driver.driver(self.local).unwrap().record().address
    }

    fn committed(&self) -> bool {
        self.driver.driver(self.local).unwrap().record().is_initialised()
    }
}

fn node<R: RandomSource + 'static>(bus: &LoopbackBus, serial: u32, random: R) -> Node {
    let tap = bus.tap();
    let mut driver = LogicDriver::new(BusConfig::default(), SerialNumber::new(serial), tap.clone())
        .with_random(random);
    let sensor = SensorDriver::with_reading(serial as i16);
    let handle = sensor.handle();
    let local = driver.add_local(SENSOR_CLASS, sensor).unwrap();
    Node {
        driver,
        tap,
        local,
        sensor: handle,
    }
}

fn seeded_node(bus: &LoopbackBus, serial: u32) -> Node {
    node(bus, serial, StdRandom::seeded(serial as u64))
}

fn scripted_node(bus: &LoopbackBus, serial: u32, script: Vec<u8>) -> Node {
    node(bus, serial, ScriptedRandom::new(script))
}

/// Each node ticks, then every node handles what reached it
fn round(nodes: &mut [Node]) {
    for node in nodes.iter_mut() {
        node.driver.tick();
    }
    for node in nodes.iter_mut() {
        for packet in node.tap.drain() {
            node.driver.handle_packet(&packet);
        }
    }
}

fn assert_unique_committed(nodes: &[Node]) {
    let mut seen = HashSet::new();
    for node in nodes {
        assert!(node.committed(), "node {} not committed", node.driver.serial_number());
        assert!(node.address().is_assignable());
        assert!(seen.insert(node.address()), "address {} claimed twice", node.address());
    }
}

#[test_log::test]
fn test_addresses_converge_to_unique() {
    let bus = LoopbackBus::new();
    let mut nodes: Vec<Node> = (1..=6).map(|serial| seeded_node(&bus, serial * 0x1111)).collect();

    for _ in 0..30 {
        round(&mut nodes);
    }
    assert_unique_committed(&nodes);
}

#[test_log::test]
fn test_simultaneous_claims_resolve() {
    let bus = LoopbackBus::new();
    let mut nodes: Vec<Node> = [0x400, 0x100, 0x300, 0x200]
        .into_iter()
        .map(|serial| scripted_node(&bus, serial, vec![5]))
        .collect();

    round(&mut nodes);
    let holders: Vec<u32> = nodes
        .iter()
        .filter(|node| node.address() == Address::new(5))
        .map(|node| node.driver.serial_number().get())
        .collect();
    assert_eq!(holders, vec![0x100]);

    for _ in 0..30 {
        round(&mut nodes);
    }
    assert_unique_committed(&nodes);
    assert_eq!(nodes[1].address(), Address::new(5));
}

#[test_log::test]
fn test_first_announcer_keeps_address() {
    let bus = LoopbackBus::new();
    let mut nodes = vec![scripted_node(&bus, 0x900, vec![5])];
    let mut events = nodes[0].driver.events().subscribe::<RegistryEvent>().unwrap();

    for _ in 0..3 {
        round(&mut nodes);
    }
    assert!(nodes[0].committed());

    // the newcomer has a lower serial but arrives late
    nodes.push(scripted_node(&bus, 0x001, vec![5, 5, 5]));
    for _ in 0..10 {
        round(&mut nodes);
    }

    assert_eq!(nodes[0].address(), Address::new(5));
    assert_unique_committed(&nodes);

    let mut connects = 0;
    let mut disconnects = 0;
    while let Ok(event) = events.try_recv() {
        match event {
            RegistryEvent::Connected { slot, .. } if slot == nodes[0].local => connects += 1,
            RegistryEvent::Disconnected { slot, .. } if slot == nodes[0].local => disconnects += 1,
            _ => {}
        }
    }
    assert_eq!((connects, disconnects), (1, 0));
    assert_eq!(nodes[0].sensor.state().connects, 1);
}

#[test_log::test]
fn test_proxies_mirror_peers() {
    let bus = LoopbackBus::new();
    let mut nodes: Vec<Node> = (1..=4).map(|serial| seeded_node(&bus, serial * 0x77)).collect();
    for _ in 0..30 {
        round(&mut nodes);
    }
    assert_unique_committed(&nodes);

    let peers: HashMap<Address, SerialNumber> = nodes
        .iter()
        .map(|node| (node.address(), node.driver.serial_number()))
        .collect();

    for node in &nodes {
        let proxies: HashMap<Address, SerialNumber> = node
            .driver
            .registry()
            .iter()
            .filter(|(_, instance)| instance.record().is_broadcast())
            .map(|(_, instance)| (instance.record().address, instance.record().serial_number))
            .collect();
        let mut expected = peers.clone();
        expected.remove(&node.address());
        assert_eq!(proxies, expected);

        for (_, instance) in node.driver.registry().iter() {
            if let Some(proxy) = instance.broadcast_state() {
                assert!(proxy.observed() > 0);
            }
        }
    }
}

#[test_log::test]
fn test_silent_node_is_forgotten() {
    let bus = LoopbackBus::new();
    let mut nodes: Vec<Node> = (1..=3).map(|serial| seeded_node(&bus, serial * 0x31)).collect();
    for _ in 0..20 {
        round(&mut nodes);
    }
    let gone = nodes.pop().unwrap();
    let gone_address = gone.address();
    assert!(nodes[0].driver.registry().represents(gone_address, SENSOR_CLASS));

    for _ in 0..5 {
        round(&mut nodes);
    }
    for node in &nodes {
        assert!(!node.driver.registry().represents(gone_address, SENSOR_CLASS));
        assert_eq!(node.driver.registry().len(), 2);
    }
}
