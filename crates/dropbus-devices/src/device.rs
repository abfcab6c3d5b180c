/*!
 * Device records and the errors of the device layer.
 *
 * A [`DeviceRecord`] is passive data. The logic driver and the registry are
 * the only components that mutate it.
 */
use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use dropbus_core::error::Error as CoreError;
use dropbus_core::types::{Address, DriverClass, RollingCounter, SerialNumber};

/// Error type for device operations
#[derive(Error, Debug)]
pub enum DeviceError {
    /// The registry has no free slot
    #[error("Registry full: capacity {0}")]
    RegistryFull(usize),

    /// A slot handle no longer refers to a live instance
    #[error("Unknown slot: {0}")]
    UnknownSlot(String),

    /// A packet could not be decoded
    #[error("Codec error: {0}")]
    Codec(String),

    /// The transport refused a packet
    #[error("Transport error: {0}")]
    Transport(String),

    /// Core error
    #[error("Core error: {0}")]
    CoreError(#[from] CoreError),
}

/// Result type for device operations
pub type Result<T> = std::result::Result<T, DeviceError>;

bitflags! {
    /// State and capability flags of a device record
    ///
    /// Exactly one of `LOCAL` and `REMOTE` holds. `INITIALISING` and
    /// `INITIALISED` are mutually exclusive.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct DeviceFlags: u16 {
        /// Hosted on this node
        const LOCAL = 1 << 0;
        /// Proxy for a device elsewhere on the bus
        const REMOTE = 1 << 1;
        /// Proxy created automatically for an unclaimed device
        const BROADCAST = 1 << 2;
        /// Device may be paired
        const PAIRABLE = 1 << 3;
        /// Device is looking for a pairing partner
        const PAIRING = 1 << 4;
        /// Device is paired
        const PAIRED = 1 << 5;
        /// Address claimed but not yet committed
        const INITIALISING = 1 << 6;
        /// Address committed
        const INITIALISED = 1 << 7;
        /// Announcement seen since the last tick
        const CP_SEEN = 1 << 8;
    }
}

impl DeviceFlags {
    /// Holds an address, committed or not
    pub fn is_claiming(self) -> bool {
        self.intersects(DeviceFlags::INITIALISING | DeviceFlags::INITIALISED)
    }

    /// Flag names for diagnostics
    pub fn names(self) -> Vec<&'static str> {
        self.iter_names().map(|(name, _)| name).collect()
    }
}

/// Link rate negotiated for a device, carried by the outer bus packet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum LinkRate {
    /// 1 Mbaud
    #[default]
    Baud1M,
    /// 500 kbaud
    Baud500K,
    /// 250 kbaud
    Baud250K,
    /// 125 kbaud
    Baud125K,
}

impl LinkRate {
    /// Wire encoding of the rate
    pub fn as_byte(self) -> u8 {
        match self {
            LinkRate::Baud1M => 1,
            LinkRate::Baud500K => 2,
            LinkRate::Baud250K => 3,
            LinkRate::Baud125K => 4,
        }
    }

    /// Decode a rate byte; unknown values fall back to the default rate
    pub fn from_byte(byte: u8) -> Self {
        match byte {
            2 => LinkRate::Baud500K,
            3 => LinkRate::Baud250K,
            4 => LinkRate::Baud125K,
            _ => LinkRate::Baud1M,
        }
    }
}

/// Identity, address and state of one bus endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceRecord {
    /// Bus address, zero while unassigned
    pub address: Address,
    /// Hardware identity of the device behind this record
    pub serial_number: SerialNumber,
    /// Driver class
    pub driver_class: DriverClass,
    /// State and capability flags
    pub flags: DeviceFlags,
    /// Tick stamp used for allocation and liveness timing
    pub rolling_counter: RollingCounter,
    /// Negotiated link rate
    pub link_rate: LinkRate,
}

impl DeviceRecord {
    /// Create a record
    pub fn new(
        address: Address,
        flags: DeviceFlags,
        serial_number: SerialNumber,
        driver_class: DriverClass,
    ) -> Self {
        Self {
            address,
            serial_number,
            driver_class,
            flags,
            rolling_counter: RollingCounter::default(),
            link_rate: LinkRate::default(),
        }
    }

    /// Whether the record is hosted on this node
    pub fn is_local(&self) -> bool {
        self.flags.contains(DeviceFlags::LOCAL)
    }

    /// Whether the record is a proxy for another node's device
    pub fn is_remote(&self) -> bool {
        self.flags.contains(DeviceFlags::REMOTE)
    }

    /// Whether the record is an automatically created proxy
    pub fn is_broadcast(&self) -> bool {
        self.flags.contains(DeviceFlags::BROADCAST)
    }

    /// Whether the address is committed
    pub fn is_initialised(&self) -> bool {
        self.flags.contains(DeviceFlags::INITIALISED)
    }

    /// Whether the address is claimed but uncommitted
    pub fn is_initialising(&self) -> bool {
        self.flags.contains(DeviceFlags::INITIALISING)
    }

    /// Drop the address and every address-state flag
    pub fn release_address(&mut self) {
        self.address = Address::UNASSIGNED;
        self.flags
            .remove(DeviceFlags::INITIALISING | DeviceFlags::INITIALISED);
    }
}
