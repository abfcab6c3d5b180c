/*!
 * Primitive bus types for dropbus.
 *
 * Addresses, serial numbers, driver classes and the rolling tick counter
 * are shared by every crate in the workspace.
 */
use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A one-byte bus address
///
/// Zero means "unassigned". Addresses 1 to 254 are valid for devices and
/// 255 is reserved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct Address(u8);

impl Address {
    /// The unassigned address
    pub const UNASSIGNED: Address = Address(0);
    /// Lowest address a device may claim
    pub const MIN: u8 = 1;
    /// Highest address a device may claim
    pub const MAX: u8 = 254;

    /// Create an address from its raw byte
    pub const fn new(raw: u8) -> Self {
        Self(raw)
    }

    /// Get the raw byte
    pub const fn get(self) -> u8 {
        self.0
    }

    /// Whether this is the unassigned address
    pub const fn is_unassigned(self) -> bool {
        self.0 == 0
    }

    /// Whether a device may own this address
    pub const fn is_assignable(self) -> bool {
        self.0 >= Self::MIN && self.0 <= Self::MAX
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u8> for Address {
    fn from(raw: u8) -> Self {
        Self(raw)
    }
}

/// Hardware identity of a physical device, stable for its lifetime
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct SerialNumber(u32);

impl SerialNumber {
    /// Create a serial number from its raw value
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    /// Generate a fresh serial number for a simulated device
    pub fn random() -> Self {
        let id = Uuid::new_v4().as_u128();
        // zero is reserved for "no serial preference"
        Self(((id >> 96) as u32).max(1))
    }

    /// Get the raw value
    pub const fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Display for SerialNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08x}", self.0)
    }
}

impl From<u32> for SerialNumber {
    fn from(raw: u32) -> Self {
        Self(raw)
    }
}

/// Protocol/type tag of a driver; devices only talk to their own class
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct DriverClass(u32);

impl DriverClass {
    /// Create a driver class from its raw value
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    /// Get the raw value
    pub const fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Display for DriverClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for DriverClass {
    fn from(raw: u32) -> Self {
        Self(raw)
    }
}

/// An eight-bit tick counter that wraps around
///
/// Comparisons between two counters always use [`RollingCounter::distance`],
/// the shorter of the two modular differences, so thresholds stay well
/// defined across wraparound.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct RollingCounter(u8);

impl RollingCounter {
    /// Create a counter at a given value
    pub const fn new(value: u8) -> Self {
        Self(value)
    }

    /// Get the raw value
    pub const fn get(self) -> u8 {
        self.0
    }

    /// Advance by one tick, wrapping at 256
    pub fn advance(&mut self) {
        self.0 = self.0.wrapping_add(1);
    }

    /// Modular distance between two counters, in ticks
    pub fn distance(self, other: RollingCounter) -> u8 {
        let forward = self.0.wrapping_sub(other.0);
        let backward = other.0.wrapping_sub(self.0);
        forward.min(backward)
    }
}
