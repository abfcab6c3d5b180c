/*!
 * Sensor driver.
 *
 * A local sensor publishes its current reading as a little-endian `i16`.
 * A remote sensor binds to a peer's sensor and keeps the last reading it
 * announced. The state sits behind a shared handle so the application can
 * read and update it while the driver lives inside a registry.
 */
use std::sync::{Arc, PoisonError, RwLock};

use bytes::{BufMut, BytesMut};
use serde::Serialize;
use tracing::debug;

use dropbus_core::types::{Address, DriverClass, SerialNumber};

use crate::device::DeviceRecord;
use crate::driver::{DriverHandler, Verdict};
use crate::protocol::InboundSegment;

/// Driver class of sensors
pub const SENSOR_CLASS: DriverClass = DriverClass::new(0x5e05);

/// Bytes a reading takes on the wire
pub const READING_SIZE: usize = 2;

/// Observable state of a sensor driver
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SensorState {
    /// Reading published by a local sensor
    pub reading: i16,
    /// Last reading received from the bound peer
    pub peer_reading: Option<i16>,
    /// Serial of the bound peer
    pub peer_serial: Option<SerialNumber>,
    /// Address of the device while connected
    pub address: Option<Address>,
    /// Times the driver connected
    pub connects: u32,
    /// Times the driver disconnected
    pub disconnects: u32,
    /// Error code to report, zero when healthy
    pub error_code: u16,
}

/// Shared handle to a sensor's state
#[derive(Debug, Clone, Default)]
pub struct SensorHandle(Arc<RwLock<SensorState>>);

impl SensorHandle {
    /// Copy of the current state
    pub fn state(&self) -> SensorState {
        self.0.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Set the reading a local sensor publishes
    pub fn set_reading(&self, reading: i16) {
        self.update(|state| state.reading = reading);
    }

    /// Set the error code; non-zero codes turn announcements into error segments
    pub fn set_error(&self, error_code: u16) {
        self.update(|state| state.error_code = error_code);
    }

    fn update<F: FnOnce(&mut SensorState)>(&self, f: F) {
        f(&mut self.0.write().unwrap_or_else(PoisonError::into_inner));
    }
}

/// Driver for a sensor endpoint
#[derive(Debug, Clone, Default)]
pub struct SensorDriver {
    handle: SensorHandle,
}

impl SensorDriver {
    /// Create a sensor driver with a zero reading
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a sensor driver publishing `reading`
    pub fn with_reading(reading: i16) -> Self {
        let driver = Self::new();
        driver.handle.set_reading(reading);
        driver
    }

    /// Handle to the driver's state
    pub fn handle(&self) -> SensorHandle {
        self.handle.clone()
    }
}

impl DriverHandler for SensorDriver {
    fn populate_announcement(&mut self, _record: &DeviceRecord, out: &mut BytesMut, budget: usize) -> usize {
        if budget < READING_SIZE {
            return 0;
        }
        out.put_i16_le(self.handle.state().reading);
        READING_SIZE
    }

    fn handle_announcement(&mut self, record: &DeviceRecord, segment: &InboundSegment<'_>) -> Verdict {
        let payload = &segment.info.payload;
        if payload.len() < READING_SIZE {
            return Verdict::Deferred;
        }
        let reading = i16::from_le_bytes([payload[0], payload[1]]);
        debug!(address = %segment.info.address, reading, "sensor reading");
        self.handle.update(|state| {
            state.peer_reading = Some(reading);
            if record.is_remote() {
                state.peer_serial = Some(segment.serial_number);
            }
        });
        Verdict::Accepted
    }

    fn on_connected(&mut self, record: &DeviceRecord) {
        self.handle.update(|state| {
            state.address = Some(record.address);
            state.connects += 1;
        });
    }

    fn on_disconnected(&mut self, _record: &DeviceRecord) {
        self.handle.update(|state| {
            state.address = None;
            state.peer_serial = None;
            state.disconnects += 1;
        });
    }

    fn error_code(&self) -> u16 {
        self.handle.state().error_code
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;
    use crate::device::{DeviceFlags, LinkRate};
    use crate::protocol::{DriverInfo, InfoFlags};

    fn record(flags: DeviceFlags) -> DeviceRecord {
        DeviceRecord::new(Address::new(4), flags, SerialNumber::new(1), SENSOR_CLASS)
    }

    #[test]
    fn test_publishes_reading() {
        let mut driver = SensorDriver::with_reading(-300);
        let mut out = BytesMut::new();
        assert_eq!(driver.populate_announcement(&record(DeviceFlags::LOCAL), &mut out, 32), 2);
        assert_eq!(&out[..], &(-300i16).to_le_bytes());

        let mut out = BytesMut::new();
        assert_eq!(driver.populate_announcement(&record(DeviceFlags::LOCAL), &mut out, 1), 0);
        assert!(out.is_empty());
    }

    #[test]
    fn test_remote_decodes_peer_reading() {
        let mut driver = SensorDriver::new();
        let handle = driver.handle();
        let info = DriverInfo::new(Address::new(9), SENSOR_CLASS, InfoFlags::empty())
            .with_payload(Bytes::copy_from_slice(&1234i16.to_le_bytes()));
        let segment = InboundSegment {
            serial_number: SerialNumber::new(0x99),
            link_rate: LinkRate::Baud1M,
            info: &info,
        };

        assert_eq!(driver.handle_announcement(&record(DeviceFlags::REMOTE), &segment), Verdict::Accepted);
        let state = handle.state();
        assert_eq!(state.peer_reading, Some(1234));
        assert_eq!(state.peer_serial, Some(SerialNumber::new(0x99)));
    }

    #[test]
    fn test_short_payload_is_deferred() {
        let mut driver = SensorDriver::new();
        let info = DriverInfo::new(Address::new(9), SENSOR_CLASS, InfoFlags::empty());
        let segment = InboundSegment {
            serial_number: SerialNumber::new(0x99),
            link_rate: LinkRate::Baud1M,
            info: &info,
        };
        assert_eq!(driver.handle_announcement(&record(DeviceFlags::REMOTE), &segment), Verdict::Deferred);
    }

    #[test]
    fn test_connection_bookkeeping() {
        let mut driver = SensorDriver::new();
        let handle = driver.handle();
        driver.on_connected(&record(DeviceFlags::LOCAL | DeviceFlags::INITIALISED));
        assert_eq!(handle.state().address, Some(Address::new(4)));
        driver.on_disconnected(&record(DeviceFlags::LOCAL));
        let state = handle.state();
        assert_eq!(state.address, None);
        assert_eq!((state.connects, state.disconnects), (1, 1));

        handle.set_error(7);
        assert_eq!(driver.error_code(), 7);
    }
}
