/*!
 * Driver instances and the capability interface drivers implement.
 *
 * An instance is one of a closed set of roles: a local driver hosted on
 * this node, a remote driver acting for a device elsewhere on the bus, or a
 * broadcast proxy created automatically for a device nobody claimed. Local
 * and remote roles delegate to a [`DriverHandler`]; the handler type is a
 * generic parameter, so dispatch is static unless the caller opts into
 * `Box<dyn DriverHandler>`.
 */
use bytes::{Bytes, BytesMut};
use serde::Serialize;
use tracing::debug;

use dropbus_core::types::{Address, DriverClass, RollingCounter, SerialNumber};

use crate::device::{DeviceFlags, DeviceRecord, LinkRate};
use crate::protocol::{InboundSegment, InfoFlags};

/// A driver's answer to an offered announcement
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// The driver consumed the segment
    Accepted,
    /// The driver refuses the segment; searching stops here
    Rejected,
    /// Not for this driver; the search moves on to the next candidate
    Deferred,
}

/// The business side of a driver
///
/// Every method has a default so simple drivers only override what they use.
pub trait DriverHandler: Send {
    /// Write the driver's status into `out`, at most `budget` bytes
    ///
    /// Returns the number of bytes written. Anything beyond `budget` is cut.
    fn populate_announcement(&mut self, _record: &DeviceRecord, _out: &mut BytesMut, _budget: usize) -> usize {
        0
    }

    /// Offer an inbound segment to the driver
    fn handle_announcement(&mut self, _record: &DeviceRecord, _segment: &InboundSegment<'_>) -> Verdict {
        Verdict::Accepted
    }

    /// The driver's device now holds a committed address
    fn on_connected(&mut self, _record: &DeviceRecord) {}

    /// The driver's device lost its address or went away
    fn on_disconnected(&mut self, _record: &DeviceRecord) {}

    /// Current error code, zero when healthy
    fn error_code(&self) -> u16 {
        0
    }
}

impl<H: DriverHandler + ?Sized> DriverHandler for Box<H> {
    fn populate_announcement(&mut self, record: &DeviceRecord, out: &mut BytesMut, budget: usize) -> usize {
        (**self).populate_announcement(record, out, budget)
    }

    fn handle_announcement(&mut self, record: &DeviceRecord, segment: &InboundSegment<'_>) -> Verdict {
        (**self).handle_announcement(record, segment)
    }

    fn on_connected(&mut self, record: &DeviceRecord) {
        (**self).on_connected(record)
    }

    fn on_disconnected(&mut self, record: &DeviceRecord) {
        (**self).on_disconnected(record)
    }

    fn error_code(&self) -> u16 {
        (**self).error_code()
    }
}

/// What a broadcast proxy has observed
#[derive(Debug, Clone, Default)]
pub struct BroadcastProxy {
    last_payload: Bytes,
    last_address: Address,
    observed: u64,
}

impl BroadcastProxy {
    /// Payload of the most recent segment
    pub fn last_payload(&self) -> &Bytes {
        &self.last_payload
    }

    /// Address the most recent segment came from
    pub fn last_address(&self) -> Address {
        self.last_address
    }

    /// Number of segments observed
    pub fn observed(&self) -> u64 {
        self.observed
    }

    fn observe(&mut self, segment: &InboundSegment<'_>) -> Verdict {
        self.last_payload = segment.info.payload.clone();
        self.last_address = segment.info.address;
        self.observed += 1;
        Verdict::Accepted
    }
}

/// Role of a driver instance
#[derive(Debug)]
pub enum DriverRole<H> {
    /// Hosted on this node
    Local(H),
    /// Acts for a device elsewhere on the bus
    Remote(H),
    /// Created automatically for an unclaimed device
    Broadcast(BroadcastProxy),
}

/// Role names used in snapshots
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RoleKind {
    /// Local driver
    Local,
    /// Remote driver
    Remote,
    /// Broadcast proxy
    Broadcast,
}

/// A bus endpoint: one device record plus the role that drives it
#[derive(Debug)]
pub struct DriverInstance<H> {
    record: DeviceRecord,
    role: DriverRole<H>,
    preferred_serial: Option<SerialNumber>,
}

impl<H: DriverHandler> DriverInstance<H> {
    /// A driver hosted on this node
    pub fn local(driver_class: DriverClass, serial: SerialNumber, handler: H) -> Self {
        Self {
            record: DeviceRecord::new(Address::UNASSIGNED, DeviceFlags::LOCAL, serial, driver_class),
            role: DriverRole::Local(handler),
            preferred_serial: None,
        }
    }

    /// A driver that binds to the first unclaimed device of its class
    pub fn remote(driver_class: DriverClass, handler: H) -> Self {
        Self {
            record: DeviceRecord::new(
                Address::UNASSIGNED,
                DeviceFlags::REMOTE,
                SerialNumber::default(),
                driver_class,
            ),
            role: DriverRole::Remote(handler),
            preferred_serial: None,
        }
    }

    /// A driver that only binds to the device with `serial`
    pub fn remote_for(driver_class: DriverClass, serial: SerialNumber, handler: H) -> Self {
        let mut instance = Self::remote(driver_class, handler);
        instance.record.serial_number = serial;
        instance.preferred_serial = Some(serial);
        instance
    }

    /// A proxy for a device seen on the bus, committed and marked seen
    pub fn broadcast(
        address: Address,
        driver_class: DriverClass,
        serial: SerialNumber,
        link_rate: LinkRate,
        now: RollingCounter,
    ) -> Self {
        let mut record = DeviceRecord::new(
            address,
            DeviceFlags::BROADCAST
                | DeviceFlags::REMOTE
                | DeviceFlags::INITIALISED
                | DeviceFlags::CP_SEEN,
            serial,
            driver_class,
        );
        record.link_rate = link_rate;
        record.rolling_counter = now;
        Self {
            record,
            role: DriverRole::Broadcast(BroadcastProxy::default()),
            preferred_serial: None,
        }
    }

    /// The device record
    pub fn record(&self) -> &DeviceRecord {
        &self.record
    }

    pub(crate) fn record_mut(&mut self) -> &mut DeviceRecord {
        &mut self.record
    }

    /// The role
    pub fn role(&self) -> &DriverRole<H> {
        &self.role
    }

    /// Role name
    pub fn role_kind(&self) -> RoleKind {
        match self.role {
            DriverRole::Local(_) => RoleKind::Local,
            DriverRole::Remote(_) => RoleKind::Remote,
            DriverRole::Broadcast(_) => RoleKind::Broadcast,
        }
    }

    /// The handler, for local and remote drivers
    pub fn handler(&self) -> Option<&H> {
        match &self.role {
            DriverRole::Local(handler) | DriverRole::Remote(handler) => Some(handler),
            DriverRole::Broadcast(_) => None,
        }
    }

    /// Mutable access to the handler
    pub fn handler_mut(&mut self) -> Option<&mut H> {
        match &mut self.role {
            DriverRole::Local(handler) | DriverRole::Remote(handler) => Some(handler),
            DriverRole::Broadcast(_) => None,
        }
    }

    /// Observation state, for broadcast proxies
    pub fn broadcast_state(&self) -> Option<&BroadcastProxy> {
        match &self.role {
            DriverRole::Broadcast(proxy) => Some(proxy),
            _ => None,
        }
    }

    /// Serial this instance insists on, if any
    pub fn preferred_serial(&self) -> Option<SerialNumber> {
        self.preferred_serial
    }

    /// Whether this instance would bind to a device with `serial`
    pub fn accepts_serial(&self, serial: SerialNumber) -> bool {
        self.preferred_serial.map_or(true, |preferred| preferred == serial)
    }

    /// Replace the pairing bits of the record; other bits are ignored
    pub fn set_pairing(&mut self, flags: DeviceFlags) {
        let pairing = DeviceFlags::PAIRABLE | DeviceFlags::PAIRING | DeviceFlags::PAIRED;
        self.record.flags.remove(pairing);
        self.record.flags.insert(flags & pairing);
    }

    /// Segment flags describing this record's pairing state
    pub fn pairing_flags(&self) -> InfoFlags {
        let mut flags = InfoFlags::empty();
        if self.record.flags.contains(DeviceFlags::PAIRING) {
            flags |= InfoFlags::PAIRING_MODE;
        }
        if self.record.flags.contains(DeviceFlags::PAIRED) {
            flags |= InfoFlags::PAIRED;
        }
        if self.record.flags.contains(DeviceFlags::PAIRABLE) {
            flags |= InfoFlags::PAIRABLE;
        }
        flags
    }

    /// Build-announcement capability: serialize status, at most `budget` bytes
    pub fn populate_announcement(&mut self, budget: usize) -> Bytes {
        let handler = match &mut self.role {
            DriverRole::Local(handler) | DriverRole::Remote(handler) => handler,
            DriverRole::Broadcast(_) => return Bytes::new(),
        };

        let mut out = BytesMut::with_capacity(budget);
        let written = handler.populate_announcement(&self.record, &mut out, budget);
        out.truncate(written.min(budget));
        out.freeze()
    }

    /// Handle-announcement capability
    pub fn handle_announcement(&mut self, segment: &InboundSegment<'_>) -> Verdict {
        match &mut self.role {
            DriverRole::Local(handler) | DriverRole::Remote(handler) => {
                handler.handle_announcement(&self.record, segment)
            }
            DriverRole::Broadcast(proxy) => proxy.observe(segment),
        }
    }

    /// Error code reported by the handler
    pub fn error_code(&self) -> u16 {
        self.handler().map_or(0, DriverHandler::error_code)
    }

    /// Connect capability: adopt `device` as this instance's identity
    pub fn connect(&mut self, device: DeviceRecord) {
        debug!(
            address = %device.address,
            serial = %device.serial_number,
            class = %device.driver_class,
            "driver connected"
        );
        self.record = device;
        if let DriverRole::Local(handler) | DriverRole::Remote(handler) = &mut self.role {
            handler.on_connected(&self.record);
        }
    }

    /// Local drivers keep their identity: mark committed and notify
    pub(crate) fn commit(&mut self) {
        self.record.flags.remove(DeviceFlags::INITIALISING);
        self.record.flags.insert(DeviceFlags::INITIALISED);
        let record = self.record.clone();
        self.connect(record);
    }

    /// Disconnect capability
    ///
    /// Local drivers drop their address so the next tick re-allocates one.
    /// Remote drivers go back to searching, keeping any serial preference.
    pub fn disconnect(&mut self) {
        let was_initialised = self.record.is_initialised();
        let snapshot = self.record.clone();

        self.record.release_address();
        if self.record.is_remote() {
            self.record.flags.remove(
                DeviceFlags::CP_SEEN | DeviceFlags::PAIRED | DeviceFlags::PAIRING | DeviceFlags::PAIRABLE,
            );
            self.record.serial_number = self.preferred_serial.unwrap_or_default();
        }

        if was_initialised {
            debug!(address = %snapshot.address, class = %snapshot.driver_class, "driver disconnected");
            if let Some(handler) = self.handler_mut() {
                handler.on_disconnected(&snapshot);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Default)]
    struct Counting {
        connected: usize,
        disconnected: usize,
        status: Vec<u8>,
    }

    impl DriverHandler for Counting {
        fn populate_announcement(&mut self, _record: &DeviceRecord, out: &mut BytesMut, _budget: usize) -> usize {
            out.extend_from_slice(&self.status);
            self.status.len()
        }

        fn on_connected(&mut self, _record: &DeviceRecord) {
            self.connected += 1;
        }

        fn on_disconnected(&mut self, _record: &DeviceRecord) {
            self.disconnected += 1;
        }
    }

    #[test]
    fn test_payload_is_cut_to_budget() {
        let handler = Counting {
            status: vec![1, 2, 3, 4, 5],
            ..Counting::default()
        };
        let mut instance = DriverInstance::local(DriverClass::new(1), SerialNumber::new(1), handler);
        assert_eq!(&instance.populate_announcement(3)[..], &[1, 2, 3]);
        assert_eq!(instance.populate_announcement(8).len(), 5);
    }

    #[test]
    fn test_remote_disconnect_restores_preference() {
        let mut instance = DriverInstance::remote_for(DriverClass::new(2), SerialNumber::new(77), Counting::default());
        let mut device = instance.record().clone();
        device.address = Address::new(8);
        device.flags |= DeviceFlags::INITIALISED | DeviceFlags::PAIRED;
        instance.connect(device);
        assert_eq!(instance.handler().unwrap().connected, 1);

        instance.disconnect();
        let record = instance.record();
        assert!(record.address.is_unassigned());
        assert_eq!(record.serial_number, SerialNumber::new(77));
        assert_eq!(record.flags, DeviceFlags::REMOTE);
        assert_eq!(instance.handler().unwrap().disconnected, 1);
    }

    #[test]
    fn test_disconnect_of_unconnected_driver_is_silent() {
        let mut instance = DriverInstance::remote(DriverClass::new(2), Counting::default());
        instance.disconnect();
        assert_eq!(instance.handler().unwrap().disconnected, 0);
    }

    #[test]
    fn test_serial_preference() {
        let any = DriverInstance::remote(DriverClass::new(2), Counting::default());
        assert!(any.accepts_serial(SerialNumber::new(5)));
        let picky = DriverInstance::remote_for(DriverClass::new(2), SerialNumber::new(6), Counting::default());
        assert!(!picky.accepts_serial(SerialNumber::new(5)));
        assert!(picky.accepts_serial(SerialNumber::new(6)));
    }

    #[test]
    fn test_broadcast_proxy_flags() {
        let proxy: DriverInstance<Counting> = DriverInstance::broadcast(
            Address::new(12),
            DriverClass::new(7),
            SerialNumber::new(3),
            LinkRate::Baud1M,
            RollingCounter::new(4),
        );
        assert_eq!(
            proxy.record().flags,
            DeviceFlags::BROADCAST | DeviceFlags::REMOTE | DeviceFlags::INITIALISED | DeviceFlags::CP_SEEN
        );
        assert_eq!(proxy.role_kind(), RoleKind::Broadcast);
        assert!(proxy.handler().is_none());
    }
}
