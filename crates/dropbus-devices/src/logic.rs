/*!
 * The logic driver.
 *
 * One logic driver runs per bus. It owns the registry of driver instances
 * and the address filter, and is driven by two callbacks that never run
 * concurrently:
 *
 * - [`LogicDriver::tick`] allocates and commits addresses for local
 *   drivers, sends one announcement packet and expires silent remotes.
 * - [`LogicDriver::handle_packet`] walks the segments of an inbound
 *   announcement, resolves address collisions, forwards payloads to
 *   matching drivers and creates proxies for unclaimed devices.
 *
 * Addresses are claimed without a coordinator. A local driver picks a
 * random free address and announces it with `UNCERTAIN` set. If nobody
 * objects for `grace_ticks` ticks the address is committed. Collisions
 * are settled by comparing commitment first and serial numbers second.
 */
use bytes::Bytes;
use serde::Serialize;
use tracing::{debug, info, trace, warn};

use dropbus_core::config::BusConfig;
use dropbus_core::event::SharedEventBus;
use dropbus_core::identity::{RandomSource, StdRandom};
use dropbus_core::logging::{bus_span, Span};
use dropbus_core::types::{Address, DriverClass, RollingCounter, SerialNumber};

use crate::device::{DeviceFlags, DeviceRecord, LinkRate, Result};
use crate::driver::{DriverHandler, DriverInstance, Verdict};
use crate::filter::AddressFilter;
use crate::protocol::{
    AnnouncementBuilder, AnnouncementPacket, BusPacket, DriverInfo, InboundSegment, InfoFlags,
    SegmentKind,
};
use crate::registry::{DeviceSnapshot, Registry, RegistryEvent, SlotId};
use crate::transport::Transport;

/// Random draws attempted before falling back to a linear scan
const MAX_ADDRESS_DRAWS: usize = 1024;

/// What one tick did
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TickReport {
    /// Rolling counter value the tick ran at
    pub counter: u8,
    /// Segments written into the announcement
    pub segments: usize,
    /// Local drivers left out for lack of room
    pub omitted: usize,
    /// Addresses drawn for local drivers
    pub allocated: usize,
    /// Local drivers that committed their address
    pub promoted: usize,
    /// Remote drivers that timed out
    pub evicted: usize,
    /// Whether an announcement went out
    pub sent: bool,
}

/// What handling one packet did
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DispatchReport {
    /// Packet dropped for a protocol version mismatch
    pub version_mismatch: bool,
    /// Parsing stopped at a malformed header or segment
    pub malformed: bool,
    /// Segments decoded
    pub segments: usize,
    /// Panic segments seen
    pub panics: usize,
    /// Payloads forwarded to drivers
    pub forwarded: usize,
    /// Collisions this node won
    pub collisions_won: usize,
    /// Collisions this node lost
    pub collisions_lost: usize,
    /// Conflict responses sent
    pub conflicts_sent: usize,
    /// Conflicts raised against local drivers
    pub conflicts_received: usize,
    /// Remote drivers dropped for a serial mismatch
    pub serial_mismatches: usize,
    /// Remote drivers bound to a device
    pub connected: usize,
    /// Broadcast proxies created
    pub proxies_created: usize,
    /// Broadcast proxies destroyed
    pub proxies_removed: usize,
    /// Addresses added to the filter
    pub filtered: usize,
    /// Addresses removed from the filter
    pub unfiltered: usize,
    /// Proxies not created because the registry was full
    pub capacity_drops: usize,
}

/// Addressing and discovery state machine for one bus
pub struct LogicDriver<H> {
    registry: Registry<H>,
    filter: AddressFilter,
    rolling_counter: RollingCounter,
    serial_number: SerialNumber,
    link_rate: LinkRate,
    random: Box<dyn RandomSource>,
    transport: Box<dyn Transport>,
    events: SharedEventBus,
    config: BusConfig,
    span: Span,
}

impl<H: DriverHandler> LogicDriver<H> {
    /// Create a logic driver for the node with `serial_number`
    pub fn new<T>(config: BusConfig, serial_number: SerialNumber, transport: T) -> Self
    where
        T: Transport + 'static,
    {
        Self {
            registry: Registry::new(config.registry_capacity),
            filter: AddressFilter::new(config.filter_capacity),
            rolling_counter: RollingCounter::default(),
            serial_number,
            link_rate: LinkRate::default(),
            random: Box::new(StdRandom::from_entropy()),
            transport: Box::new(transport),
            events: SharedEventBus::new(),
            span: bus_span("logic", serial_number),
            config,
        }
    }

    /// Use `random` for address draws
    pub fn with_random<R: RandomSource + 'static>(mut self, random: R) -> Self {
        self.random = Box::new(random);
        self
    }

    /// Publish registry events on `events`
    pub fn with_events(mut self, events: SharedEventBus) -> Self {
        self.events = events;
        self
    }

    /// Serial number of this node
    pub fn serial_number(&self) -> SerialNumber {
        self.serial_number
    }

    /// Current tick counter
    pub fn rolling_counter(&self) -> RollingCounter {
        self.rolling_counter
    }

    /// Bus settings
    pub fn config(&self) -> &BusConfig {
        &self.config
    }

    /// Event bus registry events are published on
    pub fn events(&self) -> &SharedEventBus {
        &self.events
    }

    /// The registry
    pub fn registry(&self) -> &Registry<H> {
        &self.registry
    }

    /// The address filter
    pub fn filter(&self) -> &AddressFilter {
        &self.filter
    }

    /// Look up a driver instance
    pub fn driver(&self, id: SlotId) -> Option<&DriverInstance<H>> {
        self.registry.get(id)
    }

    /// Look up a driver instance mutably
    pub fn driver_mut(&mut self, id: SlotId) -> Option<&mut DriverInstance<H>> {
        self.registry.get_mut(id)
    }

    /// Register a local or remote driver
    pub fn add_driver(&mut self, instance: DriverInstance<H>) -> Result<SlotId> {
        self.registry.insert(instance)
    }

    /// Host a local driver under this node's serial number
    pub fn add_local(&mut self, driver_class: impl Into<DriverClass>, handler: H) -> Result<SlotId> {
        self.add_driver(DriverInstance::local(driver_class.into(), self.serial_number, handler))
    }

    /// Change the pairing state a driver announces
    pub fn set_pairing(&mut self, id: SlotId, flags: DeviceFlags) -> Result<()> {
        self.registry.try_get_mut(id)?.set_pairing(flags);
        Ok(())
    }

    /// Registry contents for diagnostics
    pub fn snapshot(&self) -> Vec<DeviceSnapshot> {
        self.registry.snapshot()
    }

    /// Run one announce and allocate cycle
    pub fn tick(&mut self) -> TickReport {
        let span = self.span.clone();
        let _entered = span.enter();

        let now = self.rolling_counter;
        let mut report = TickReport {
            counter: now.get(),
            ..TickReport::default()
        };
        let mut builder = AnnouncementBuilder::new(self.serial_number, self.config.max_packet_payload);

        for id in self.registry.ids() {
            let local = match self.registry.get(id) {
                Some(instance) => instance.record().is_local(),
                None => continue,
            };
            if local {
                self.announce_local(id, now, &mut builder, &mut report);
            } else {
                self.check_liveness(id, now, &mut report);
            }
        }

        report.segments = builder.segment_count();
        if report.segments > 0 {
            let packet = BusPacket::announcement(self.config.protocol_version, self.link_rate, builder.finish());
            match self.transport.send(packet) {
                Ok(()) => report.sent = true,
                Err(e) => warn!(error = %e, "failed to send announcement"),
            }
        }

        self.rolling_counter.advance();
        trace!(counter = now.get(), segments = report.segments, "tick complete");
        report
    }

    fn announce_local(
        &mut self,
        id: SlotId,
        now: RollingCounter,
        builder: &mut AnnouncementBuilder,
        report: &mut TickReport,
    ) {
        if !builder.has_room() {
            report.omitted += 1;
            return;
        }

        let claiming = match self.registry.get(id) {
            Some(instance) => instance.record().flags.is_claiming(),
            None => return,
        };

        if !claiming {
            let Some(address) = self.draw_address(id) else {
                warn!("no free address left to claim");
                return;
            };
            let Some(instance) = self.registry.get_mut(id) else {
                return;
            };
            let record = instance.record_mut();
            record.address = address;
            record.flags.insert(DeviceFlags::INITIALISING);
            record.rolling_counter = now;
            debug!(%address, class = %record.driver_class, "claiming address");

            let info = segment_for(instance, InfoFlags::UNCERTAIN, Bytes::new());
            builder.push(&info);
            report.allocated += 1;
            return;
        }

        let Some(instance) = self.registry.get_mut(id) else {
            return;
        };
        if instance.record().is_initialising()
            && now.distance(instance.record().rolling_counter) >= self.config.grace_ticks
        {
            instance.commit();
            let record = instance.record().clone();
            report.promoted += 1;
            info!(address = %record.address, class = %record.driver_class, "address committed");
            self.publish(RegistryEvent::Connected {
                slot: id,
                address: record.address,
                driver_class: record.driver_class,
                serial_number: record.serial_number,
            });
        }

        let Some(instance) = self.registry.get_mut(id) else {
            return;
        };
        let extra = if instance.record().is_initialising() {
            InfoFlags::UNCERTAIN
        } else {
            InfoFlags::empty()
        };
        let payload = instance.populate_announcement(builder.payload_budget(self.config.max_segment_payload));
        let info = segment_for(instance, extra, payload);
        if !builder.push(&info) {
            report.omitted += 1;
        }
    }

    fn draw_address(&mut self, id: SlotId) -> Option<Address> {
        for _ in 0..MAX_ADDRESS_DRAWS {
            let candidate = Address::new(self.random.next_byte());
            if candidate.is_assignable() && !self.registry.address_claimed(candidate, Some(id)) {
                return Some(candidate);
            }
        }
        (Address::MIN..=Address::MAX)
            .map(Address::new)
            .find(|candidate| !self.registry.address_claimed(*candidate, Some(id)))
    }

    fn check_liveness(&mut self, id: SlotId, now: RollingCounter, report: &mut TickReport) {
        let Some(instance) = self.registry.get_mut(id) else {
            return;
        };
        let record = instance.record();
        if !record.is_remote() || !record.is_initialised() {
            return;
        }

        let seen = record.flags.contains(DeviceFlags::CP_SEEN);
        if !seen && now.distance(record.rolling_counter) > self.config.grace_ticks {
            debug!(address = %record.address, class = %record.driver_class, "remote driver timed out");
            report.evicted += 1;
            self.disconnect_remote(id);
            return;
        }

        let record = instance.record_mut();
        if seen {
            record.rolling_counter = now;
        }
        record.flags.remove(DeviceFlags::CP_SEEN);
    }

    /// Handle one inbound packet
    pub fn handle_packet(&mut self, packet: &BusPacket) -> DispatchReport {
        let span = self.span.clone();
        let _entered = span.enter();

        let mut report = DispatchReport::default();
        if packet.version != self.config.protocol_version {
            trace!(version = packet.version, "dropping packet of another protocol version");
            report.version_mismatch = true;
            return report;
        }

        let (serial_number, segments) = match AnnouncementPacket::parse(packet.data.clone()) {
            Ok(parsed) => parsed,
            Err(e) => {
                trace!(error = %e, "dropping malformed announcement");
                report.malformed = true;
                return report;
            }
        };

        for item in segments {
            let info = match item {
                Ok(info) => info,
                Err(e) => {
                    trace!(error = %e, "dropping rest of announcement");
                    report.malformed = true;
                    break;
                }
            };
            report.segments += 1;

            match info.kind {
                SegmentKind::Panic => {
                    warn!(
                        serial = %serial_number,
                        address = %info.address,
                        class = %info.driver_class,
                        name = %info.panic_name(),
                        "remote driver panicked"
                    );
                    report.panics += 1;
                    continue;
                }
                SegmentKind::Other(kind) => {
                    trace!(kind, "skipping segment of unknown type");
                    continue;
                }
                SegmentKind::Normal | SegmentKind::Error => {}
            }

            let segment = InboundSegment {
                serial_number,
                link_rate: packet.link_rate,
                info: &info,
            };
            self.dispatch_segment(&segment, &mut report);
        }

        report
    }

    fn dispatch_segment(&mut self, segment: &InboundSegment<'_>, report: &mut DispatchReport) {
        let info = segment.info;
        let safe = !info
            .flags
            .intersects(InfoFlags::UNCERTAIN | InfoFlags::PAIRING_MODE);
        trace!(
            serial = %segment.serial_number,
            address = %info.address,
            class = %info.driver_class,
            flags = info.flags.bits(),
            "segment"
        );

        let mut handled = false;
        for id in self.registry.ids() {
            let Some(instance) = self.registry.get(id) else {
                continue;
            };
            let record = instance.record();
            if record.driver_class != info.driver_class {
                continue;
            }
            if record.is_local() {
                if record.flags.is_claiming()
                    && record.address == info.address
                    && self.handle_local_match(id, segment, safe, report)
                {
                    handled = true;
                }
            } else if self.handle_remote_match(id, segment, safe, report) {
                handled = true;
            }
        }

        if !handled && safe {
            self.handle_unmatched(segment, report);
        }
    }

    /// Returns whether the local claim absorbed the segment
    fn handle_local_match(
        &mut self,
        id: SlotId,
        segment: &InboundSegment<'_>,
        safe: bool,
        report: &mut DispatchReport,
    ) -> bool {
        let info = segment.info;
        let Some(instance) = self.registry.get_mut(id) else {
            return false;
        };
        let ours = instance.record().clone();

        if info.flags.contains(InfoFlags::CONFLICT) {
            debug!(address = %ours.address, from = %segment.serial_number, "conflict raised against local address");
            report.conflicts_received += 1;
            self.release_local(id);
            return false;
        }

        if segment.serial_number != ours.serial_number {
            let ours_committed = ours.is_initialised();
            let theirs_committed = !info.flags.contains(InfoFlags::UNCERTAIN);
            let we_win = match (ours_committed, theirs_committed) {
                (true, false) => true,
                (false, true) => false,
                _ => ours.serial_number < segment.serial_number,
            };
            debug!(
                address = %ours.address,
                ours = %ours.serial_number,
                theirs = %segment.serial_number,
                we_win,
                "address collision"
            );

            if !we_win {
                report.collisions_lost += 1;
                self.release_local(id);
                return false;
            }
            report.collisions_won += 1;
            if ours_committed {
                self.send_conflict(info, report);
            }
            return true;
        }

        if ours.is_initialised() {
            instance.record_mut().link_rate = segment.link_rate;
            if safe {
                instance.handle_announcement(segment);
                report.forwarded += 1;
            }
        }
        true
    }

    fn handle_remote_match(
        &mut self,
        id: SlotId,
        segment: &InboundSegment<'_>,
        safe: bool,
        report: &mut DispatchReport,
    ) -> bool {
        let info = segment.info;
        let Some(instance) = self.registry.get_mut(id) else {
            return false;
        };
        let record = instance.record();
        if !record.is_initialised() || info.flags.contains(InfoFlags::CONFLICT) {
            return false;
        }

        if record.address != info.address {
            if record.is_broadcast() && safe {
                instance.handle_announcement(segment);
            }
            return false;
        }

        if record.serial_number != segment.serial_number {
            debug!(
                address = %record.address,
                known = %record.serial_number,
                seen = %segment.serial_number,
                "serial changed behind remote address"
            );
            report.serial_mismatches += 1;
            if self.disconnect_remote(id) {
                report.proxies_removed += 1;
            }
            return false;
        }

        let record = instance.record_mut();
        record.flags.insert(DeviceFlags::CP_SEEN);
        record.link_rate = segment.link_rate;
        if !safe {
            return true;
        }
        report.forwarded += 1;
        instance.handle_announcement(segment) == Verdict::Accepted
    }

    fn handle_unmatched(&mut self, segment: &InboundSegment<'_>, report: &mut DispatchReport) {
        let info = segment.info;
        if info.address.is_unassigned() {
            trace!(class = %info.driver_class, "segment without an address");
            return;
        }

        if info.flags.contains(InfoFlags::PAIRED) {
            let owned = self.registry.address_claimed(info.address, None);
            if self.filter.add(info.address, owned) {
                report.filtered += 1;
            }
            return;
        }
        if self.filter.contains(info.address) {
            self.filter.remove(info.address);
            report.unfiltered += 1;
            return;
        }

        let now = self.rolling_counter;
        for id in self.registry.ids() {
            let Some(instance) = self.registry.get_mut(id) else {
                continue;
            };
            let record = instance.record();
            if !record.is_remote()
                || record.is_broadcast()
                || record.flags.is_claiming()
                || record.driver_class != info.driver_class
                || !instance.accepts_serial(segment.serial_number)
            {
                continue;
            }

            match instance.handle_announcement(segment) {
                Verdict::Accepted => {
                    let mut device = DeviceRecord::new(
                        info.address,
                        DeviceFlags::REMOTE
                            | DeviceFlags::INITIALISED
                            | DeviceFlags::CP_SEEN
                            | pairing_from(info.flags),
                        segment.serial_number,
                        info.driver_class,
                    );
                    device.rolling_counter = now;
                    device.link_rate = segment.link_rate;
                    instance.connect(device);

                    info!(
                        address = %info.address,
                        class = %info.driver_class,
                        serial = %segment.serial_number,
                        "remote driver bound"
                    );
                    report.connected += 1;
                    self.publish(RegistryEvent::Connected {
                        slot: id,
                        address: info.address,
                        driver_class: info.driver_class,
                        serial_number: segment.serial_number,
                    });
                    return;
                }
                Verdict::Deferred => continue,
                Verdict::Rejected => break,
            }
        }

        if self.registry.represents(info.address, info.driver_class) {
            return;
        }

        let proxy = DriverInstance::broadcast(
            info.address,
            info.driver_class,
            segment.serial_number,
            segment.link_rate,
            now,
        );
        match self.registry.insert(proxy) {
            Ok(slot) => {
                debug!(%slot, address = %info.address, class = %info.driver_class, "broadcast proxy created");
                report.proxies_created += 1;
                self.publish(RegistryEvent::ProxyCreated {
                    slot,
                    address: info.address,
                    driver_class: info.driver_class,
                });
            }
            Err(e) => {
                warn!(error = %e, address = %info.address, class = %info.driver_class, "announcement dropped");
                report.capacity_drops += 1;
            }
        }
    }

    fn send_conflict(&mut self, offender: &DriverInfo, report: &mut DispatchReport) {
        let mut reply = offender.clone();
        reply.flags |= InfoFlags::CONFLICT | InfoFlags::UNCERTAIN;
        reply.payload = Bytes::new();

        let data = AnnouncementPacket {
            serial_number: self.serial_number,
            segments: vec![reply],
        }
        .encode();
        let packet = BusPacket::announcement(self.config.protocol_version, self.link_rate, data);
        match self.transport.send(packet) {
            Ok(()) => report.conflicts_sent += 1,
            Err(e) => warn!(error = %e, "failed to send conflict response"),
        }
    }

    fn release_local(&mut self, id: SlotId) {
        let Some(instance) = self.registry.get_mut(id) else {
            return;
        };
        let record = instance.record().clone();
        instance.disconnect();
        if record.is_initialised() {
            info!(address = %record.address, class = %record.driver_class, "local driver lost its address");
            self.publish(RegistryEvent::Disconnected {
                slot: id,
                address: record.address,
                driver_class: record.driver_class,
            });
        }
    }

    /// Disconnect a remote driver; broadcast proxies are destroyed
    ///
    /// Returns whether the instance was removed from the registry.
    fn disconnect_remote(&mut self, id: SlotId) -> bool {
        let Some(instance) = self.registry.get_mut(id) else {
            return false;
        };
        let record = instance.record().clone();
        instance.disconnect();
        if record.is_initialised() {
            info!(address = %record.address, class = %record.driver_class, "remote driver disconnected");
            self.publish(RegistryEvent::Disconnected {
                slot: id,
                address: record.address,
                driver_class: record.driver_class,
            });
        }

        if !record.is_broadcast() {
            return false;
        }
        self.registry.remove(id);
        debug!(slot = %id, address = %record.address, "broadcast proxy removed");
        self.publish(RegistryEvent::ProxyRemoved {
            slot: id,
            address: record.address,
            driver_class: record.driver_class,
        });
        true
    }

    fn publish(&self, event: RegistryEvent) {
        if let Err(e) = self.events.publish(event) {
            warn!(error = %e, "failed to publish registry event");
        }
    }
}

fn segment_for<H: DriverHandler>(instance: &DriverInstance<H>, extra: InfoFlags, payload: Bytes) -> DriverInfo {
    let record = instance.record();
    let mut info = DriverInfo::new(record.address, record.driver_class, instance.pairing_flags() | extra)
        .with_payload(payload);
    let code = instance.error_code();
    if code != 0 {
        info.kind = SegmentKind::Error;
        info.error_code = code;
    }
    info
}

fn pairing_from(flags: InfoFlags) -> DeviceFlags {
    let mut device = DeviceFlags::empty();
    if flags.contains(InfoFlags::PAIRING_MODE) {
        device |= DeviceFlags::PAIRING;
    }
    if flags.contains(InfoFlags::PAIRED) {
        device |= DeviceFlags::PAIRED;
    }
    if flags.contains(InfoFlags::PAIRABLE) {
        device |= DeviceFlags::PAIRABLE;
    }
    device
}
