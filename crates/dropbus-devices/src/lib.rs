/*!
 * dropbus devices
 *
 * Driver instances, the driver registry, the announcement wire format and
 * the logic driver that allocates addresses and discovers peers on a
 * multi-drop bus without a bus master.
 */

#![warn(missing_docs)]

// Re-export core types
pub use dropbus_core::prelude;

pub mod device;
pub mod devices;
pub mod driver;
pub mod filter;
pub mod logic;
pub mod protocol;
pub mod registry;
pub mod runtime;
pub mod transport;

pub use device::{DeviceError, DeviceFlags, DeviceRecord, LinkRate};
pub use driver::{BroadcastProxy, DriverHandler, DriverInstance, DriverRole, RoleKind, Verdict};
pub use filter::AddressFilter;
pub use logic::{DispatchReport, LogicDriver, TickReport};
pub use protocol::{AnnouncementPacket, BusPacket, DriverInfo, InboundSegment, InfoFlags, SegmentKind};
pub use registry::{DeviceSnapshot, Registry, RegistryEvent, SlotId};
pub use runtime::BusRuntime;
pub use transport::{BusTap, ChannelTransport, LoopbackBus, RecordingTransport, Transport};

/// dropbus devices crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Initialize the device layer
pub fn init() -> Result<(), dropbus_core::error::Error> {
    tracing::info!("dropbus devices {} initialized", VERSION);
    Ok(())
}
